pub mod frame;
pub mod ingress;

pub use ingress::{handle, WsIngressConfig};
