//! HTTP Basic Authentication enforcement for `http`-kind tunnels.
//!
//! A tunnel may be opened with a [`sellia_proto::BasicAuthPair`]; the HTTP
//! ingress calls [`basic::check`] against each inbound request before
//! forwarding it over the control channel, returning a ready-made 401
//! response when the check fails.

mod basic;

pub use basic::check;

/// Result of an auth check against a tunnel's configured credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Unauthorized,
}

/// Build the raw HTTP/1.1 401 response body for a failed Basic check,
/// including the `WWW-Authenticate` challenge header that `spec.md` §6
/// requires on this error path.
pub fn unauthorized_response(realm: &str) -> Vec<u8> {
    let realm_escaped = realm.replace('"', "\\\"");
    let body = b"authentication required";
    format!(
        "HTTP/1.1 401 Unauthorized\r\n\
         WWW-Authenticate: Basic realm=\"{realm_escaped}\"\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n",
        body.len()
    )
    .into_bytes()
    .into_iter()
    .chain(body.iter().copied())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_response_carries_challenge_header() {
        let response = unauthorized_response("sellia");
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("401 Unauthorized"));
        assert!(text.contains("WWW-Authenticate: Basic realm=\"sellia\""));
    }

    #[test]
    fn unauthorized_response_escapes_quotes_in_realm() {
        let response = unauthorized_response("my \"tunnel\"");
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("realm=\"my \\\"tunnel\\\"\""));
    }
}
