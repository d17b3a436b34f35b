//! Per-request policy decisions for the proxy pipeline
//!
//! Pipeline order: ACME challenge, trusted-proxy normalization, access
//! control, forced HTTPS, redirect, location match, upstream dispatch.
//! Earlier steps short-circuit later ones. The functions here are pure
//! decision logic; the proxy turns their results into responses.

use std::collections::HashSet;
use std::net::IpAddr;

use hyper::header::HeaderMap;

use crate::auth::{decode_basic_auth, verify_password};
use crate::snapshot::{AccessList, RuleAction};

/// Path prefix served by the ACME challenge filter
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Outcome of evaluating an access list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// IP rule rejection -> 403
    Forbidden,
    /// Missing or invalid Basic-Auth credentials -> 401
    Unauthorized,
}

/// The client identity a request is judged by: socket peer facts unless
/// the immediate peer is a trusted proxy hop.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentity {
    pub ip: IpAddr,
    pub https: bool,
}

/// Resolve the effective client IP and scheme.
///
/// `X-Forwarded-For` / `X-Forwarded-Proto` are honored only when the
/// immediate peer is in the trusted proxy set; otherwise they are
/// attacker-controlled and ignored.
pub fn resolve_client(
    peer_ip: IpAddr,
    peer_is_tls: bool,
    headers: &HeaderMap,
    trusted_proxies: &HashSet<IpAddr>,
) -> ClientIdentity {
    if !trusted_proxies.contains(&peer_ip) {
        return ClientIdentity {
            ip: peer_ip,
            https: peer_is_tls,
        };
    }

    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find_map(|c| c.parse::<IpAddr>().ok())
        })
        .unwrap_or(peer_ip);

    let https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(peer_is_tls);

    ClientIdentity { ip, https }
}

/// Evaluate an access list against the effective client.
///
/// IP rules run first, top-to-bottom, first match wins; an unmatched
/// client is rejected when any allow rule exists (whitelist semantics).
/// Client credentials, when present, then require a valid Basic-Auth
/// header.
pub fn check_access(
    list: &AccessList,
    client_ip: IpAddr,
    authorization: Option<&str>,
) -> AccessDecision {
    if !list.ip_rules.is_empty() {
        let mut matched = None;
        for rule in &list.ip_rules {
            if rule.matches(client_ip) {
                matched = Some(rule.action);
                break;
            }
        }

        match matched {
            Some(RuleAction::Deny) => return AccessDecision::Forbidden,
            Some(RuleAction::Allow) => {}
            None => {
                let has_allow = list
                    .ip_rules
                    .iter()
                    .any(|r| r.action == RuleAction::Allow);
                if has_allow {
                    return AccessDecision::Forbidden;
                }
            }
        }
    }

    if !list.clients.is_empty() {
        let authenticated = authorization
            .and_then(decode_basic_auth)
            .map(|(username, password)| {
                list.clients
                    .get(&username)
                    .map(|hash| verify_password(&password, hash))
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        if !authenticated {
            return AccessDecision::Unauthorized;
        }
    }

    AccessDecision::Allow
}

/// Location header value for a forced-HTTPS redirect
pub fn force_https_location(host: &str, path_and_query: &str) -> String {
    format!("https://{}{}", host, path_and_query)
}
