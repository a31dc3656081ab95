use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;

use crate::caveat::Service;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub mint: MintConfig,
    pub proxy: ProxyConfig,
    pub lnd: LndConfig,
    pub services: Vec<ServiceConfig>,
}
// https://github.com/mehcode/config-rs

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

/// Connection details for the LND node the invoice tracker subscribes to.
/// The node itself is an external collaborator; this is only how we reach it.
#[derive(Debug, Deserialize, Clone)]
pub struct LndConfig {
    pub host: String,
    pub tls_path: String,
    pub mac_path: String,
}

/// Which `SecretStore` backend to use, selected per spec.md §6's env vars.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Sled { path: String },
    Postgres(PostgresStorageConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresStorageConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    #[serde(default)]
    pub requiressl: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl From<PostgresStorageConfig> for crate::secret_store::PostgresConfig {
    fn from(c: PostgresStorageConfig) -> Self {
        Self {
            host: c.host,
            port: c.port,
            user: c.user,
            password: c.password,
            dbname: c.dbname,
            require_ssl: c.requiressl,
            max_connections: c.max_connections,
        }
    }
}

/// Mint-wide tuning. Keeps the one-hour right expiry as the default,
/// overridable here, rather than varying it per service.
#[derive(Debug, Deserialize, Clone)]
pub struct MintConfig {
    #[serde(default = "default_right_expiry_secs")]
    pub right_expiry_secs: i64,
}

fn default_right_expiry_secs() -> i64 {
    crate::mint::L402_RIGHT_EXPIRY_SECS
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            right_expiry_secs: default_right_expiry_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Base URL of the wrapping privacy proxy (`LNPROXY_URL`).
    pub lnproxy_url: String,
}

/// A protected service's descriptor plus the upstream-forwarding fields
/// needed to proxy a request through once a caller is authorized.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub tier: u8,
    pub recipient_lud16: String,
    pub price_sats: i64,
    pub path: String,
    pub upstream: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub pass_fields: HashMap<String, String>,
    #[serde(default)]
    pub response_fields: String,
}

impl From<&ServiceConfig> for Service {
    fn from(c: &ServiceConfig) -> Self {
        Service {
            name: c.name.clone(),
            tier: c.tier,
            recipient_lud16: c.recipient_lud16.clone(),
            price_sats: c.price_sats,
        }
    }
}
