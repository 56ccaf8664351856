//! Transfer event entity model
//!
//! One row per completed ownership transfer, addressed to the owner who lost
//! the identity. Deduplicated by `(provider, external_account_id, ownership_version)`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "transfer_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub provider: String,

    pub external_account_id: String,

    pub external_identity_label: Option<String>,

    /// Owner that lost the identity; the only reader of this event
    pub from_owner_id: Uuid,

    pub to_owner_id: Uuid,

    /// Binding version produced by the transfer
    pub ownership_version: i32,

    pub created_at: DateTimeWithTimeZone,

    pub acknowledged_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
