//! Request authentication layers for the assistant's HTTP surface.
//!
//! Signed routes verify the nonce/timestamp/HMAC header triple over the
//! raw body. Admin routes are reachable only from loopback or the VPN
//! network; the state-changing ones additionally re-verify the signature.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use aide_core::config::{HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use aide_core::types::{now_ms, ApiResponse};

use crate::app::AppState;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Private network holding the mesh peer and operator tooling.
const VPN_NET: (Ipv4Addr, u32) = (Ipv4Addr::new(10, 42, 0, 0), 16);

/// Middleware for signed routes: buffer the body, run the ordered
/// verification, and pass the request through on success.
pub async fn require_signature(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large", "request body too large")
        }
    };

    if let Err(response) = verify_signed(&state, &parts.headers, &bytes) {
        return response;
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

/// Shared verification used by the middleware and by state-changing admin
/// handlers.
pub fn verify_signed(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    body: &Bytes,
) -> Result<(), Response> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    aide_auth::verify_request(
        header(HEADER_NONCE),
        header(HEADER_TIMESTAMP),
        header(HEADER_SIGNATURE),
        body,
        &state.secrets,
        &state.nonces,
        state.config.auth.timestamp_tolerance_ms,
        now_ms(),
    )
    .map_err(|e| {
        warn!(code = e.code(), "request authentication failed");
        error_response(
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            e.code(),
            &e.to_string(),
        )
    })
}

/// Middleware for the admin surface: the peer address must be loopback or
/// inside the VPN network.
pub async fn require_local_source(req: Request, next: Next) -> Response {
    let allowed = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| is_admin_source(addr.ip()))
        .unwrap_or(false);

    if !allowed {
        warn!("admin request from non-local source rejected");
        return error_response(StatusCode::FORBIDDEN, "forbidden", "admin surface is local-only");
    }
    next.run(req).await
}

pub fn is_admin_source(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || in_net_v4(v4, VPN_NET.0, VPN_NET.1),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| is_admin_source(IpAddr::V4(v4)))
        }
    }
}

fn in_net_v4(ip: Ipv4Addr, net: Ipv4Addr, prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ApiResponse::error(code, message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_admin_source() {
        assert!(is_admin_source("127.0.0.1".parse().unwrap()));
        assert!(is_admin_source("::1".parse().unwrap()));
    }

    #[test]
    fn vpn_range_is_admin_source() {
        assert!(is_admin_source("10.42.0.5".parse().unwrap()));
        assert!(is_admin_source("10.42.255.1".parse().unwrap()));
        assert!(!is_admin_source("10.43.0.1".parse().unwrap()));
    }

    #[test]
    fn public_addresses_are_rejected() {
        assert!(!is_admin_source("203.0.113.9".parse().unwrap()));
        assert!(!is_admin_source("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn mapped_ipv4_loopback_is_accepted() {
        assert!(is_admin_source("::ffff:127.0.0.1".parse().unwrap()));
    }
}
