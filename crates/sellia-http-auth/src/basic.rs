//! HTTP Basic Authentication (RFC 7617) against a tunnel's configured
//! [`BasicAuthPair`](sellia_proto::BasicAuthPair).
//!
//! A tunnel carries at most one username/password pair, set at
//! `tunnel_open` time. Credentials arrive base64-encoded in the
//! `Authorization` header as `Basic <base64(username:password)>`.

use base64::Engine;
use sellia_proto::{BasicAuthPair, HeaderList};
use tracing::debug;

use crate::AuthOutcome;

fn extract_credentials(auth_header: &str) -> Option<(String, String)> {
    if auth_header.len() < 6 || !auth_header[..6].eq_ignore_ascii_case("basic ") {
        return None;
    }
    let encoded = auth_header[6..].trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    text.split_once(':')
        .map(|(u, p)| (u.to_string(), p.to_string()))
}

/// Enforce `pair` against the request's headers. `None` means the tunnel
/// has no basic-auth configured and every request passes.
pub fn check(pair: Option<&BasicAuthPair>, headers: &HeaderList) -> AuthOutcome {
    let Some(pair) = pair else {
        return AuthOutcome::Authenticated;
    };

    let header_value = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.as_str());

    let Some(header_value) = header_value else {
        debug!("basic auth: no Authorization header");
        return AuthOutcome::Unauthorized;
    };

    match extract_credentials(header_value) {
        Some((username, password)) if username == pair.username && password == pair.password => {
            AuthOutcome::Authenticated
        }
        Some(_) => {
            debug!("basic auth: credentials did not match");
            AuthOutcome::Unauthorized
        }
        None => {
            debug!("basic auth: could not decode Authorization header");
            AuthOutcome::Unauthorized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(username: &str, password: &str) -> String {
        let raw = format!("{username}:{password}");
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
        format!("Basic {encoded}")
    }

    fn pair() -> BasicAuthPair {
        BasicAuthPair {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn no_pair_configured_always_authenticates() {
        let headers: HeaderList = vec![];
        assert_eq!(check(None, &headers), AuthOutcome::Authenticated);
    }

    #[test]
    fn matching_credentials_authenticate() {
        let headers: HeaderList = vec![("Authorization".to_string(), header_for("alice", "hunter2"))];
        assert_eq!(check(Some(&pair()), &headers), AuthOutcome::Authenticated);
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let headers: HeaderList = vec![("Authorization".to_string(), header_for("alice", "wrong"))];
        assert_eq!(check(Some(&pair()), &headers), AuthOutcome::Unauthorized);
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let headers: HeaderList = vec![("Host".to_string(), "example.com".to_string())];
        assert_eq!(check(Some(&pair()), &headers), AuthOutcome::Unauthorized);
    }

    #[test]
    fn non_basic_scheme_is_unauthorized() {
        let headers: HeaderList = vec![("Authorization".to_string(), "Bearer abc".to_string())];
        assert_eq!(check(Some(&pair()), &headers), AuthOutcome::Unauthorized);
    }

    #[test]
    fn header_name_is_case_insensitive() {
        let headers: HeaderList = vec![("authorization".to_string(), header_for("alice", "hunter2"))];
        assert_eq!(check(Some(&pair()), &headers), AuthOutcome::Authenticated);
    }

    #[test]
    fn malformed_base64_is_unauthorized() {
        let headers: HeaderList = vec![("Authorization".to_string(), "Basic !!!not-base64!!!".to_string())];
        assert_eq!(check(Some(&pair()), &headers), AuthOutcome::Unauthorized);
    }
}
