//! Client identification for the guards.
//!
//! The client address is a rate-limiting hint only: `X-Forwarded-For` can be
//! forged by anyone the proxy policy trusts.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{request::Parts, Extensions, HeaderMap},
};
use haven_core::RouteClass;
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyPolicy {
    /// Honor the left-most `X-Forwarded-For` entry.
    pub trust_forwarded_for: bool,
    /// When non-empty, only these peers may supply `X-Forwarded-For`.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            trust_forwarded_for: true,
            trusted_proxies: Vec::new(),
        }
    }
}

impl ProxyPolicy {
    fn honors_forwarded_for(&self, peer: Option<IpAddr>) -> bool {
        if !self.trust_forwarded_for {
            return false;
        }
        if self.trusted_proxies.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.trusted_proxies.contains(&ip))
    }

    pub fn resolve_client_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if self.honors_forwarded_for(peer) {
            if let Some(ip) = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| raw.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                return ip.to_string();
            }
        }
        peer.map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Subject identity attached to the request by the host's session layer.
///
/// Haven never sets this itself. A host that fronts the router with its own
/// session middleware inserts it into the request extensions before the
/// rate-limit layers run; without it [`SubjectKey`] keys on the client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(pub String);

fn peer_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Derives the rate-limiting key for a request.
pub trait KeyExtractor: Send + Sync + 'static {
    fn extract(&self, request: &Request, proxy: &ProxyPolicy) -> String;
}

/// `ip:<client address>`
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientAddressKey;

impl KeyExtractor for ClientAddressKey {
    fn extract(&self, request: &Request, proxy: &ProxyPolicy) -> String {
        let ip = proxy.resolve_client_ip(request.headers(), peer_ip(request.extensions()));
        format!("ip:{ip}")
    }
}

/// `user:<subject>`, or the client address for anonymous requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectKey;

impl KeyExtractor for SubjectKey {
    fn extract(&self, request: &Request, proxy: &ProxyPolicy) -> String {
        match request.extensions().get::<Subject>() {
            Some(Subject(id)) => format!("user:{id}"),
            None => ClientAddressKey.extract(request, proxy),
        }
    }
}

/// `ip:<client address>|route:<class>`
#[derive(Debug, Clone, Copy)]
pub struct AddressAndRouteKey(pub RouteClass);

impl KeyExtractor for AddressAndRouteKey {
    fn extract(&self, request: &Request, proxy: &ProxyPolicy) -> String {
        format!(
            "{}|route:{}",
            ClientAddressKey.extract(request, proxy),
            self.0.as_str()
        )
    }
}

/// Resolved client address, for handlers that key guards themselves.
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(
            state
                .settings
                .proxy
                .resolve_client_ip(&parts.headers, peer_ip(&parts.extensions)),
        ))
    }
}

/// Brute-force keys for a login attempt.
pub fn auth_guard_keys(client_ip: &str, account_hint: Option<&str>) -> Vec<String> {
    let mut keys = vec![format!("ip:{client_ip}")];
    if let Some(account) = account_hint.map(str::trim).filter(|v| !v.is_empty()) {
        keys.push(format!("acct:{}", account.to_ascii_lowercase()));
    }
    keys
}
