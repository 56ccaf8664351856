//! # Data Models
//!
//! SeaORM entities for the account slot ledger.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod binding;
pub mod slot;
pub mod transfer_event;
pub mod transfer_request;

pub use binding::Entity as AccountBinding;
pub use slot::Entity as AccountSlot;
pub use transfer_event::Entity as TransferEvent;
pub use transfer_request::Entity as TransferRequest;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "account-slots".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
