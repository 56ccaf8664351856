//! Slot repository for database operations
//!
//! Every method takes the connection explicitly so the same queries run on the
//! pool or inside the caller's transaction.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use super::to_db_time;
use crate::models::slot::{self, ActiveModel, Entity as Slot, Model};

/// Fields for a newly allocated slot.
#[derive(Debug, Clone)]
pub struct NewSlot<'a> {
    pub owner_id: Uuid,
    pub provider: &'a str,
    pub external_account_id: &'a str,
    pub external_identity_label: Option<&'a str>,
    pub sequence_number: i32,
    pub plan: &'a str,
}

pub struct SlotRepository;

impl SlotRepository {
    /// Finds the slot an owner currently holds for an external identity
    pub async fn find_for_owner_identity<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Slot::find()
            .filter(slot::Column::OwnerId.eq(owner_id))
            .filter(slot::Column::Provider.eq(provider))
            .filter(slot::Column::ExternalAccountId.eq(external_account_id))
            .one(conn)
            .await
    }

    /// Finds the slot for an external identity regardless of owner
    pub async fn find_by_identity<C: ConnectionTrait>(
        conn: &C,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Slot::find()
            .filter(slot::Column::Provider.eq(provider))
            .filter(slot::Column::ExternalAccountId.eq(external_account_id))
            .one(conn)
            .await
    }

    pub async fn find_by_id<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Option<Model>, DbErr> {
        Slot::find_by_id(id).one(conn).await
    }

    /// Loads a slot by id with an exclusive row lock (no-op on SQLite)
    pub async fn lock_by_id<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Option<Model>, DbErr> {
        Slot::find_by_id(id).lock_exclusive().one(conn).await
    }

    /// Number of slots ever allocated against an owner's quota for a provider
    pub async fn count_historical<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
        provider: &str,
    ) -> Result<u64, DbErr> {
        Slot::find()
            .filter(slot::Column::OriginOwnerId.eq(owner_id))
            .filter(slot::Column::Provider.eq(provider))
            .count(conn)
            .await
    }

    /// Number of active slots currently held by an owner for a provider
    pub async fn count_active<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
        provider: &str,
    ) -> Result<u64, DbErr> {
        Slot::find()
            .filter(slot::Column::OwnerId.eq(owner_id))
            .filter(slot::Column::Provider.eq(provider))
            .filter(slot::Column::IsActive.eq(true))
            .count(conn)
            .await
    }

    /// Highest sequence number allocated against an owner's quota, if any
    pub async fn max_sequence<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
        provider: &str,
    ) -> Result<Option<i32>, DbErr> {
        let last = Slot::find()
            .filter(slot::Column::OriginOwnerId.eq(owner_id))
            .filter(slot::Column::Provider.eq(provider))
            .order_by_desc(slot::Column::SequenceNumber)
            .limit(1)
            .one(conn)
            .await?;
        Ok(last.map(|slot| slot.sequence_number))
    }

    /// Inserts a new active slot and returns the stored row
    pub async fn insert<C: ConnectionTrait>(
        conn: &C,
        new_slot: NewSlot<'_>,
        now: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let id = Uuid::new_v4();
        let active = ActiveModel {
            id: Set(id),
            owner_id: Set(new_slot.owner_id),
            origin_owner_id: Set(new_slot.owner_id),
            provider: Set(new_slot.provider.to_string()),
            external_account_id: Set(new_slot.external_account_id.to_string()),
            external_identity_label: Set(new_slot.external_identity_label.map(str::to_string)),
            sequence_number: Set(new_slot.sequence_number),
            is_active: Set(true),
            plan_at_creation: Set(new_slot.plan.to_string()),
            created_at: Set(to_db_time(now)),
            deactivated_at: Set(None),
        };

        // Avoids fetching a last-insert id, which SQLite cannot produce for UUID keys
        Slot::insert(active).exec_without_returning(conn).await?;

        Slot::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("account slot {id}")))
    }

    /// Marks a slot active again and refreshes its display label
    pub async fn reactivate<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        label: Option<&str>,
    ) -> Result<(), DbErr> {
        let mut update = Slot::update_many()
            .col_expr(slot::Column::IsActive, Expr::value(true))
            .col_expr(
                slot::Column::DeactivatedAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            );
        if let Some(label) = label {
            update = update.col_expr(slot::Column::ExternalIdentityLabel, Expr::value(label));
        }
        update.filter(slot::Column::Id.eq(id)).exec(conn).await?;
        Ok(())
    }

    /// Marks a slot inactive, recording when it was disconnected
    pub async fn deactivate<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        Slot::update_many()
            .col_expr(slot::Column::IsActive, Expr::value(false))
            .col_expr(slot::Column::DeactivatedAt, Expr::value(to_db_time(now)))
            .filter(slot::Column::Id.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Moves a slot to a new holder and activates it
    pub async fn reassign<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        new_owner_id: Uuid,
        label: Option<&str>,
    ) -> Result<(), DbErr> {
        let mut update = Slot::update_many()
            .col_expr(slot::Column::OwnerId, Expr::value(new_owner_id))
            .col_expr(slot::Column::IsActive, Expr::value(true))
            .col_expr(
                slot::Column::DeactivatedAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            );
        if let Some(label) = label {
            update = update.col_expr(slot::Column::ExternalIdentityLabel, Expr::value(label));
        }
        update.filter(slot::Column::Id.eq(id)).exec(conn).await?;
        Ok(())
    }

    /// Lists every slot an owner holds, oldest first
    pub async fn list_for_owner<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
    ) -> Result<Vec<Model>, DbErr> {
        Slot::find()
            .filter(slot::Column::OwnerId.eq(owner_id))
            .order_by_asc(slot::Column::Provider)
            .order_by_asc(slot::Column::CreatedAt)
            .order_by_asc(slot::Column::Id)
            .all(conn)
            .await
    }

    /// Lists every slot allocated against an owner's quota for a provider, by sequence
    pub async fn list_ledger<C: ConnectionTrait>(
        conn: &C,
        owner_id: Uuid,
        provider: &str,
    ) -> Result<Vec<Model>, DbErr> {
        Slot::find()
            .filter(slot::Column::OriginOwnerId.eq(owner_id))
            .filter(slot::Column::Provider.eq(provider))
            .order_by_asc(slot::Column::SequenceNumber)
            .all(conn)
            .await
    }

    /// Distinct (origin owner, provider) pairs present in the ledger
    pub async fn ledger_keys<C: ConnectionTrait>(conn: &C) -> Result<Vec<(Uuid, String)>, DbErr> {
        Slot::find()
            .select_only()
            .column(slot::Column::OriginOwnerId)
            .column(slot::Column::Provider)
            .distinct()
            .order_by_asc(slot::Column::OriginOwnerId)
            .order_by_asc(slot::Column::Provider)
            .into_tuple::<(Uuid, String)>()
            .all(conn)
            .await
    }
}
