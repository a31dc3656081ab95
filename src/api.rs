use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use serde_json::json;
use tracing::{debug, error, info, instrument};
use warp::{
    hyper::{HeaderMap, StatusCode},
    reject, Rejection, Reply,
};

use crate::{authenticator::Authenticator, config::ServiceConfig, invoice_tracker::InvoiceState, upstream::Upstream};

#[derive(Debug)]
struct MyRejection<'a>(&'a str);
impl reject::Reject for MyRejection<'static> {}

#[derive(Debug)]
struct Nope;
impl warp::reject::Reject for Nope {}

/// Reports whether the invoice identified by `payment_hash` (hex) has
/// settled, per the in-memory tracker. Not part of the L402 accept/challenge
/// decision itself; a convenience endpoint for clients polling before
/// retrying with their preimage.
#[instrument(level = "info", skip(tracker))]
pub async fn handle_invoice_status(
    indata: HashMap<String, String>,
    tracker: Arc<crate::invoice_tracker::InvoiceTracker>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let hash_hex = indata.get("payment_hash").ok_or_else(|| {
        error!("no payment_hash field found");
        MyRejection("payment_hash field not found")
    })?;
    let hash_bytes = hex::decode(hash_hex).map_err(|e| {
        error!(error=%e, "invalid payment_hash hex");
        MyRejection("invalid payment_hash")
    })?;
    let hash: [u8; 32] = hash_bytes
        .try_into()
        .map_err(|_| MyRejection("payment_hash must be 32 bytes"))?;

    let settled = tracker
        .wait_for_state(hash, InvoiceState::Settled, Duration::from_millis(50))
        .await
        .is_ok();

    Ok(warp::reply::json(&json!({ "settled": settled })).into_response())
}

/// Entry point for a protected service: mints/returns a challenge when the
/// caller has no credentials, verifies and forwards to the upstream when it
/// does.
#[instrument(level = "info", skip(authenticator))]
pub async fn handle_protected(
    service: ServiceConfig,
    indata: HashMap<String, String>,
    headers: HeaderMap,
    authenticator: Arc<Authenticator>,
) -> Result<impl warp::Reply, warp::Rejection> {
    debug!(headers=?headers, indata=?indata, "handling protected resource");

    let header_value = headers.get("Authorization").and_then(|v| v.to_str().ok());

    let header_value = match header_value {
        None => {
            return challenge_response(&authenticator, &service, StatusCode::PAYMENT_REQUIRED).await;
        }
        Some(v) => v,
    };

    if !authenticator.accept(header_value, &service.name).await {
        return challenge_response(&authenticator, &service, StatusCode::UNAUTHORIZED).await;
    }

    let mut upstream = Upstream::new(service.clone());
    let data = upstream
        .build(&indata)
        .map_err(|e| {
            error!(error=%e, "unable to construct upstream request");
            reject::custom(Nope)
        })?
        .make()
        .await
        .map_err(|e| {
            error!(error=%e, "unable to contact upstream");
            reject::custom(Nope)
        })?
        .parse()
        .map_err(|e| {
            error!(error=%e, "unable to parse upstream response");
            reject::custom(Nope)
        })?;

    let paragraphs: Vec<&str> = data.trim().split("\n\n").collect();
    Ok(warp::reply::json(&json!({ "data": paragraphs })).into_response())
}

async fn challenge_response(
    authenticator: &Authenticator,
    service: &ServiceConfig,
    status: StatusCode,
) -> Result<warp::reply::Response, warp::Rejection> {
    let header = authenticator
        .fresh_challenge_header(&service.name, &service.recipient_lud16, service.price_sats)
        .await
        .map_err(|e| {
            error!(error=%e, "unable to generate challenge");
            reject::custom(MyRejection("unable to generate challenge"))
        })?;

    info!(service = %service.name, "issuing fresh challenge");
    let mut resp = warp::reply::with_status(warp::reply::json(&json!({ "message": "payment required" })), status)
        .into_response();
    resp.headers_mut().insert(
        "WWW-Authenticate",
        header.parse().expect("challenge header is valid ASCII"),
    );
    Ok(resp)
}

/// Receives a `Rejection` and tries to return a custom
/// value, otherwise simply passes the rejection along.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code;
    let message: String;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "NOT_FOUND".into();
    } else if let Some(MyRejection(e)) = err.find() {
        code = StatusCode::BAD_REQUEST;
        message = e.to_string();
    } else {
        error!("unhandled rejection: {:?}", err);
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "UNHANDLED_REJECTION".into();
    }

    let json = warp::reply::json(&json!({
        "code": code.as_u16(),
        "message": message,
    }));

    Ok(warp::reply::with_status(json, code))
}
