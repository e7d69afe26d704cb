//! Header translation between `axum`'s `HeaderMap` and the wire protocol's
//! `HeaderList`, plus the hop-by-hop stripping and `X-Forwarded-*` injection
//! `spec.md` §4.7 requires on both directions.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use sellia_proto::HeaderList;

/// Headers that must never cross a proxy hop, per `spec.md` §4.7.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailers",
    "proxy-authorization",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Converts an inbound `HeaderMap` into the wire's multi-valued list,
/// preserving order and duplicate headers (e.g. repeated `Cookie`), and
/// dropping hop-by-hop headers.
pub fn to_wire(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Converts a client-supplied `HeaderList` back into a `HeaderMap`,
/// dropping hop-by-hop headers and any value that isn't valid for the
/// `http` crate's strict header types (malformed values from a
/// misbehaving client are simply omitted, not a hard failure).
pub fn from_wire(list: &HeaderList) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in list {
        if is_hop_by_hop(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

/// Appends `X-Forwarded-For`, `X-Forwarded-Proto`, and `X-Forwarded-Host`
/// to a request's wire header list before it is sent to the client.
pub fn inject_forwarded(headers: &mut HeaderList, source_ip: &str, proto: &str, host: &str) {
    headers.push(("x-forwarded-for".to_string(), source_ip.to_string()));
    headers.push(("x-forwarded-proto".to_string(), proto.to_string()));
    headers.push(("x-forwarded-host".to_string(), host.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn to_wire_drops_hop_by_hop_and_keeps_order() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("myapp.example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let wire = to_wire(&headers);
        assert!(wire.iter().all(|(name, _)| name != "connection"));
        let cookies: Vec<_> = wire.iter().filter(|(n, _)| n == "set-cookie").collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn from_wire_drops_hop_by_hop() {
        let list = vec![
            ("upgrade".to_string(), "websocket".to_string()),
            ("content-type".to_string(), "text/plain".to_string()),
        ];
        let map = from_wire(&list);
        assert!(!map.contains_key("upgrade"));
        assert!(map.contains_key("content-type"));
    }

    #[test]
    fn inject_forwarded_appends_three_headers() {
        let mut headers = vec![];
        inject_forwarded(&mut headers, "203.0.113.4", "https", "myapp.example.com");
        assert_eq!(headers.len(), 3);
        assert!(headers.iter().any(|(n, v)| n == "x-forwarded-for" && v == "203.0.113.4"));
    }
}
