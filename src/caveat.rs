//! Encoding and decoding of the three recognized caveat value formats, and
//! the service descriptors they carry.

use std::fmt;

use crate::error::CaveatError;

/// Condition used for the services caveat.
pub const COND_SERVICES: &str = "services";
/// Condition suffix for a service's capabilities caveat, e.g. `loop_capabilities`.
pub const COND_CAPABILITIES_SUFFIX: &str = "_capabilities";
/// Condition suffix for a service's timeout caveat, e.g. `loop_valid_until`.
pub const COND_TIMEOUT_SUFFIX: &str = "_valid_until";

/// Base tier for any freshly minted L402, not part of a tier upgrade.
pub const BASE_TIER: u8 = 0;

/// Details of an L402-enabled service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub tier: u8,
    pub recipient_lud16: String,
    pub price_sats: i64,
}

impl Service {
    pub fn new(name: impl Into<String>, recipient_lud16: impl Into<String>, price_sats: i64) -> Self {
        Self {
            name: name.into(),
            tier: BASE_TIER,
            recipient_lud16: recipient_lud16.into(),
            price_sats,
        }
    }

    fn capabilities_condition(&self) -> String {
        format!("{}{}", self.name, COND_CAPABILITIES_SUFFIX)
    }

    fn timeout_condition(&self) -> String {
        format!("{}{}", self.name, COND_TIMEOUT_SUFFIX)
    }
}

/// A single `(condition, value)` caveat pair. Wire-encoded as
/// `"<condition>=<value>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    pub condition: String,
    pub value: String,
}

impl Caveat {
    pub fn new(condition: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}={}", self.condition, self.value)
    }

    pub fn decode(s: &str) -> Result<Self, CaveatError> {
        let (condition, value) = s.split_once('=').ok_or(CaveatError::MalformedCaveat)?;
        if condition.is_empty() {
            return Err(CaveatError::MalformedCaveat);
        }
        Ok(Self {
            condition: condition.to_string(),
            value: value.to_string(),
        })
    }
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Encodes a list of services into the expected format of a services
/// caveat's value: `name1:tier1,name2:tier2,...`.
pub fn encode_services(services: &[Service]) -> Result<String, CaveatError> {
    if services.is_empty() {
        return Err(CaveatError::NoServices);
    }

    let mut out = String::new();
    for (i, service) in services.iter().enumerate() {
        if service.name.is_empty() {
            return Err(CaveatError::MissingName);
        }
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{}:{}", service.name, service.tier));
    }
    Ok(out)
}

/// Decodes a list of services from the expected format of a services
/// caveat's value.
pub fn decode_services(s: &str) -> Result<Vec<Service>, CaveatError> {
    if s.is_empty() {
        return Err(CaveatError::NoServices);
    }

    s.split(',')
        .map(|raw| {
            let (name, tier_str) = raw.split_once(':').ok_or(CaveatError::InvalidService)?;
            if name.is_empty() {
                return Err(CaveatError::InvalidService);
            }
            let tier: u8 = tier_str.parse().map_err(|_| CaveatError::InvalidService)?;
            Ok(Service {
                name: name.to_string(),
                tier,
                recipient_lud16: String::new(),
                price_sats: 0,
            })
        })
        .collect()
}

/// Builds the initial `services` caveat for a set of services.
pub fn services_caveat(services: &[Service]) -> Result<Caveat, CaveatError> {
    Ok(Caveat::new(COND_SERVICES, encode_services(services)?))
}

/// Builds a `<service>_capabilities` caveat.
pub fn capabilities_caveat(service: &Service, capabilities: &str) -> Caveat {
    Caveat::new(service.capabilities_condition(), capabilities)
}

/// Builds a `<service>_valid_until` caveat valid for `valid_for_secs` seconds
/// from `now` (a Unix timestamp, seconds).
pub fn encode_timeout(service: &Service, now: i64, valid_for_secs: i64) -> Caveat {
    Caveat::new(service.timeout_condition(), (now + valid_for_secs).to_string())
}
