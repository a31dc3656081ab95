use std::sync::Arc;

use lsat_proxy::{
    api::{handle_invoice_status, handle_protected, handle_rejection},
    authenticator::Authenticator,
    challenger::{Challenger, LnproxyChallenger},
    config::{Config, ServiceConfig, StorageConfig},
    invoice_tracker::InvoiceTracker,
    lnd,
    mint::Mint,
    secret_store::{PostgresSecretStore, SharedSecretStore, SledSecretStore},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warp::{http::HeaderValue, hyper::HeaderMap, path::FullPath, Filter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("config"))
        .add_source(config::Environment::with_prefix("APP"))
        .build()
        .expect("problem building the config")
        .try_deserialize()
        .expect("problem deserializing config");

    info!("configuration loaded on startup: {:?}", config);

    let secret_store: SharedSecretStore = match config.storage.clone() {
        StorageConfig::Sled { path } => {
            Arc::new(SledSecretStore::open(path).expect("failed to open sled secret store"))
        }
        StorageConfig::Postgres(pg) => Arc::new(
            PostgresSecretStore::connect(&pg.into())
                .await
                .expect("failed to connect to postgres secret store"),
        ),
    };

    let challenger: Arc<dyn Challenger> = Arc::new(LnproxyChallenger::new(config.proxy.lnproxy_url.clone()));
    let mint = Mint::new(secret_store, challenger).with_right_expiry(config.mint.right_expiry_secs);

    info!("connecting to LND for invoice tracking");
    let lnd_conf = config.lnd.clone();
    let lnd_client = lnd::Client::init(lnd_conf.host, lnd_conf.tls_path, lnd_conf.mac_path).await;
    let info = lnd_client.get_info().await.expect("failed to get info");
    info!(?info, "LND instance info");

    let source = lnd::LndInvoiceSource::new(lnd_client);
    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel(4);
    let tracker = Arc::new(
        InvoiceTracker::start(source, err_tx)
            .await
            .expect("failed to start invoice tracker"),
    );

    tokio::spawn(async move {
        if let Some(e) = err_rx.recv().await {
            error!(error = %e, "invoice tracker terminated fatally; process restart required");
        }
    });

    let authenticator = Arc::new(Authenticator::new(mint, tracker.clone()));

    info!("listening on {}:{}", config.server.host, config.server.port);

    let mut headers = HeaderMap::new();
    headers.insert("Access-Control-Expose-Headers", HeaderValue::from_static("*"));
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "DELETE"])
        .allow_headers(vec!["www-authenticate", "accept-authenticate", "content-type", "authorization"]);

    let base = warp::any().and(with_clone(config.clone()));

    let invoice_status = base
        .clone()
        .and(warp::path!("invoice" / "status"))
        .and(warp::body::json())
        .and(with_clone(tracker.clone()))
        .and_then(handle_invoice_status);

    let protected = base
        .and(warp::path::full())
        .and_then(protected_path)
        .and(warp::body::json())
        .and(warp::header::headers_cloned())
        .and(with_clone(authenticator))
        .and_then(handle_protected);

    let routes = warp::any()
        .and(invoice_status)
        .or(protected)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::reply::with::headers(headers));

    info!("starting server...");
    warp::serve(routes).run((config.server.host, config.server.port)).await;
    Ok(())
}

pub async fn protected_path(config: Config, path: FullPath) -> Result<ServiceConfig, warp::Rejection> {
    let service = config.services.iter().find(|s| s.path == path.as_str());

    match service {
        Some(service) => Ok(service.clone()),
        None => Err(warp::reject()),
    }
}

/// Warp helper for cloning configuration and handles into request handlers.
pub fn with_clone<C: Clone + Send>(c: C) -> impl Filter<Extract = (C,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || c.clone())
}
