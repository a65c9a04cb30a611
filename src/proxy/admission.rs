//! Admission gate for authenticated routes.
//!
//! Runs before any handler: resolves the bearer key to an account, rejects
//! banned accounts, demotes expired premium tiers and enforces the single-IP
//! lock below the premium tier. The admitted [`Account`] is handed to the
//! handler as a request extension.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;

use super::server::AppState;
use crate::error::{AdmissionError, Result};
use crate::storage::{self, accounts, Account};

/// Key from an `Authorization: Bearer <key>` header.
pub fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, key) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

/// Client address: the configured forwarding header first, then the peer.
pub fn client_ip(headers: &HeaderMap, ip_header: &str, peer: Option<IpAddr>) -> Option<String> {
    headers
        .get(ip_header)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|ip| ip.to_string()))
}

/// Resolve and vet the caller's account.
pub async fn check(state: &AppState, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<Account> {
    let key = bearer_key(headers).ok_or(AdmissionError::MissingKey)?;
    let mut account = state
        .ledger
        .account(key)
        .await?
        .ok_or(AdmissionError::UnknownKey)?;

    if account.banned {
        return Err(AdmissionError::Banned.into());
    }

    let premium_tier = state.config.credits.premium_tier;
    let now = storage::unix_now();
    if account.tier >= premium_tier && account.premium_expiry.is_some_and(|exp| exp < now) {
        tracing::info!(tier = account.tier, "Premium tier expired, demoting account");
        accounts::demote(&state.db, &account.key, 0).await?;
        account.tier = 0;
        account.premium_expiry = None;
    }

    if account.tier < premium_tier {
        match client_ip(headers, &state.config.server.client_ip_header, peer) {
            Some(ip) => {
                let bound = accounts::bind_ip(&state.db, &account.key, &ip).await?;
                if bound.as_deref() != Some(ip.as_str()) {
                    return Err(AdmissionError::IpMismatch.into());
                }
                account.ip = bound;
            }
            None if account.ip.is_some() => return Err(AdmissionError::IpMismatch.into()),
            None => {}
        }
    }

    Ok(account)
}

/// Middleware wrapper around [`check`].
pub async fn admit(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let account = match check(&state, request.headers(), peer).await {
        Ok(account) => account,
        Err(e) => {
            tracing::info!(path = %request.uri().path(), error = %e, "Request refused");
            return Err(e);
        }
    };

    request.extensions_mut().insert(account);
    Ok(next.run(request).await)
}
