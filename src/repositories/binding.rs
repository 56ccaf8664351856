//! Account binding repository for database operations

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use super::to_db_time;
use crate::crypto::EncryptedCredentials;
use crate::models::binding::{self, ActiveModel, Entity as Binding, Model};

/// Credential columns written on connect, reconnect and transfer.
#[derive(Debug, Clone)]
pub struct BindingCredentials {
    pub encrypted: EncryptedCredentials,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub external_identity_label: Option<String>,
}

pub struct BindingRepository;

impl BindingRepository {
    /// Finds the binding for an external identity (at most one exists)
    pub async fn find_by_identity<C: ConnectionTrait>(
        conn: &C,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Binding::find()
            .filter(binding::Column::Provider.eq(provider))
            .filter(binding::Column::ExternalAccountId.eq(external_account_id))
            .one(conn)
            .await
    }

    /// Same as [`Self::find_by_identity`] but holds an exclusive row lock until
    /// the surrounding transaction ends (no-op on SQLite)
    pub async fn lock_by_identity<C: ConnectionTrait>(
        conn: &C,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Binding::find()
            .filter(binding::Column::Provider.eq(provider))
            .filter(binding::Column::ExternalAccountId.eq(external_account_id))
            .lock_exclusive()
            .one(conn)
            .await
    }

    /// Inserts a binding for a freshly resolved slot
    pub async fn insert<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
        provider: &str,
        external_account_id: &str,
        slot_id: Uuid,
        credentials: BindingCredentials,
        now: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let id = Uuid::new_v4();
        let now = to_db_time(now);
        let active = ActiveModel {
            id: Set(id),
            owner_id: Set(owner_id),
            provider: Set(provider.to_string()),
            external_account_id: Set(external_account_id.to_string()),
            slot_id: Set(slot_id),
            external_identity_label: Set(credentials.external_identity_label),
            access_token_ciphertext: Set(credentials.encrypted.access_token),
            refresh_token_ciphertext: Set(credentials.encrypted.refresh_token),
            token_expires_at: Set(credentials.token_expires_at.map(to_db_time)),
            is_active: Set(true),
            ownership_version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Binding::insert(active).exec_without_returning(conn).await?;

        Binding::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("account binding {id}")))
    }

    /// Replaces credentials and reactivates an existing binding for the same owner
    pub async fn refresh<C: ConnectionTrait>(
        conn: &C,
        existing: Model,
        slot_id: Uuid,
        credentials: BindingCredentials,
        now: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let label = credentials
            .external_identity_label
            .or_else(|| existing.external_identity_label.clone());
        let mut active = existing.into_active_model();
        active.slot_id = Set(slot_id);
        active.external_identity_label = Set(label);
        active.access_token_ciphertext = Set(credentials.encrypted.access_token);
        active.refresh_token_ciphertext = Set(credentials.encrypted.refresh_token);
        active.token_expires_at = Set(credentials.token_expires_at.map(to_db_time));
        active.is_active = Set(true);
        active.updated_at = Set(to_db_time(now));
        active.update(conn).await
    }

    /// Hands a binding to a new owner and bumps its ownership version
    pub async fn reassign<C: ConnectionTrait>(
        conn: &C,
        existing: Model,
        new_owner_id: Uuid,
        credentials: BindingCredentials,
        now: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let next_version = existing.ownership_version + 1;
        let label = credentials
            .external_identity_label
            .or_else(|| existing.external_identity_label.clone());
        let mut active = existing.into_active_model();
        active.owner_id = Set(new_owner_id);
        active.external_identity_label = Set(label);
        active.access_token_ciphertext = Set(credentials.encrypted.access_token);
        active.refresh_token_ciphertext = Set(credentials.encrypted.refresh_token);
        active.token_expires_at = Set(credentials.token_expires_at.map(to_db_time));
        active.is_active = Set(true);
        active.ownership_version = Set(next_version);
        active.updated_at = Set(to_db_time(now));
        active.update(conn).await
    }

    /// Marks a binding inactive; ciphertexts are kept for a later reconnect
    pub async fn deactivate<C: ConnectionTrait>(
        conn: &C,
        existing: Model,
        now: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let mut active = existing.into_active_model();
        active.is_active = Set(false);
        active.updated_at = Set(to_db_time(now));
        active.update(conn).await
    }

    /// Lists an owner's bindings, active and inactive
    pub async fn list_for_owner<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
    ) -> Result<Vec<Model>, DbErr> {
        Binding::find()
            .filter(binding::Column::OwnerId.eq(owner_id))
            .order_by_asc(binding::Column::Provider)
            .order_by_asc(binding::Column::CreatedAt)
            .order_by_asc(binding::Column::Id)
            .all(conn)
            .await
    }

    /// Counts active bindings for an external identity across all owners
    pub async fn count_active_for_identity<C: ConnectionTrait>(
        conn: &C,
        provider: &str,
        external_account_id: &str,
    ) -> Result<u64, DbErr> {
        Binding::find()
            .filter(binding::Column::Provider.eq(provider))
            .filter(binding::Column::ExternalAccountId.eq(external_account_id))
            .filter(binding::Column::IsActive.eq(true))
            .count(conn)
            .await
    }

    /// Returns the binding that references a slot, if any
    pub async fn find_by_slot<C: ConnectionTrait>(
        conn: &C,
        slot_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Binding::find()
            .filter(binding::Column::SlotId.eq(slot_id))
            .one(conn)
            .await
    }
}
