//! Trust Gate: pairing (first-contact handshake) and tool policy (RBAC).

pub mod pairing;
pub mod policy;

pub use pairing::{PairingStore, PendingRequest};
pub use policy::{AuditEntry, ToolPolicy, ToolPolicyEngine};
