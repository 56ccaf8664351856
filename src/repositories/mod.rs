//! # Repository Layer
//!
//! SeaORM data access for the slot ledger. Methods are generic over
//! [`sea_orm::ConnectionTrait`] so they run on the pool or inside a transaction.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;

pub mod binding;
pub mod slot;
pub mod transfer_event;
pub mod transfer_request;

pub use binding::{BindingCredentials, BindingRepository};
pub use slot::{NewSlot, SlotRepository};
pub use transfer_event::{NewTransferEvent, TransferEventRepository};
pub use transfer_request::{StagedTransfer, TransferRequestRepository};

pub(crate) fn to_db_time(dt: DateTime<Utc>) -> DateTimeWithTimeZone {
    dt.fixed_offset()
}
