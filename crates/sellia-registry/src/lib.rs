//! Subdomain naming rules, the tunnel registry, and the reserved-name
//! source that gates what a tunnel may be called.

pub mod registry;
pub mod reserved;

pub use registry::{RegistryError, Tunnel, TunnelRegistry, ValidationResult};
pub use reserved::{ReservedSourceError, ReservedSubdomainSource};
