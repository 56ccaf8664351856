//! Slot entity model
//!
//! A slot is one permanent allocation of an owner's lifetime quota for a
//! provider. Rows are never deleted; `origin_owner_id` and `sequence_number`
//! never change after creation, while `owner_id` follows the external
//! identity through ownership transfers.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "account_slots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Current holder of the slot
    pub owner_id: Uuid,

    /// Owner whose lifetime quota this slot consumed
    pub origin_owner_id: Uuid,

    pub provider: String,

    /// Normalized (trimmed, non-empty) external account identifier
    pub external_account_id: String,

    /// Display identity (usually the account email) recorded at connect time
    pub external_identity_label: Option<String>,

    /// 1-based position in the origin owner's ledger for this provider
    pub sequence_number: i32,

    pub is_active: bool,

    /// Plan the origin owner was on when the slot was allocated
    pub plan_at_creation: String,

    pub created_at: DateTimeWithTimeZone,

    /// Most recent disconnection, cleared on reconnect
    pub deactivated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::binding::Entity")]
    Binding,
}

impl Related<super::binding::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Binding.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
