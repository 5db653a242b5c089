//! meshgate: control plane for gated outbound tool execution.
//!
//! Four cooperating subsystems:
//!
//! - [`payment`]: admits metered tool calls behind a two-phase payment
//!   protocol against an external provider, binding each approved charge to
//!   one exact tool payload.
//! - [`claim`]: redeems a one-time free-credits reward per social handle,
//!   proven by a public post and enforced by an atomic store transaction.
//! - [`outbound`]: resilience for outbound API calls: credential rotation
//!   across equivalent keys, and round-robin failover across relay servers.
//! - [`config`]: environment-driven configuration for all of the above.
//!
//! The crate is transport-agnostic: it exposes typed operations and errors,
//! and an HTTP (or other) front-end maps them to its own wire format.

pub mod claim;
pub mod config;
pub mod error;
pub mod outbound;
pub mod payment;
pub mod testing;
