//! Outbound-call resilience: credential rotation and relay failover.

mod proxy;
mod rotation;

pub use proxy::{ForwardRequest, ProxyFailoverClient};
pub use rotation::{CredentialPool, RotationMode, mask_key};
