//! ThinkForward Common Types
//!
//! Identity and permission types shared by the identity service and the
//! portal's CRUD handlers.

pub mod capability;
pub mod identity;
pub mod permissions;
pub mod role;

pub use capability::{Capability, CapabilitySet};
pub use identity::AuthenticatedIdentity;
pub use permissions::{resolve_permissions, resolve_permissions_str};
pub use role::{Role, SubscriptionTier};
