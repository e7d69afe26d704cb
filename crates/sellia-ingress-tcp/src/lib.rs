pub mod pool;

pub use pool::{TcpIngress, TcpIngressConfig};
