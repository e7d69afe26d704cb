pub mod headers;
pub mod host;
pub mod ingress;

pub use host::extract_subdomain;
pub use ingress::{handle, is_websocket_upgrade, HttpIngressConfig};
