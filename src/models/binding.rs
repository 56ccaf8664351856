//! Account binding entity model
//!
//! The live, credential-bearing record that links a slot to a usable external
//! identity. `(provider, external_account_id)` is unique across all owners.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "account_bindings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub owner_id: Uuid,

    pub provider: String,

    pub external_account_id: String,

    /// Owning slot; always held by the same `owner_id` as the binding
    pub slot_id: Uuid,

    pub external_identity_label: Option<String>,

    /// AES-256-GCM ciphertext of the access token
    pub access_token_ciphertext: Vec<u8>,

    /// AES-256-GCM ciphertext of the refresh token, when the provider issued one
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    pub token_expires_at: Option<DateTimeWithTimeZone>,

    pub is_active: bool,

    /// Incremented by every ownership transfer
    pub ownership_version: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::slot::Entity",
        from = "Column::SlotId",
        to = "super::slot::Column::Id"
    )]
    Slot,
}

impl Related<super::slot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Slot.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
