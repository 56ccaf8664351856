//! Transfer event repository for database operations

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use super::to_db_time;
use crate::models::transfer_event::{self, ActiveModel, Entity as TransferEvent, Model};

/// A completed transfer to report to the dispossessed owner.
#[derive(Debug, Clone)]
pub struct NewTransferEvent<'a> {
    pub provider: &'a str,
    pub external_account_id: &'a str,
    pub external_identity_label: Option<&'a str>,
    pub from_owner_id: Uuid,
    pub to_owner_id: Uuid,
    pub ownership_version: i32,
}

pub struct TransferEventRepository;

impl TransferEventRepository {
    /// Inserts an event unless one already exists for this ownership version.
    /// Returns true when a row was written.
    pub async fn insert_once<C: ConnectionTrait>(
        conn: &C,
        event: NewTransferEvent<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let active = ActiveModel {
            id: Set(Uuid::new_v4()),
            provider: Set(event.provider.to_string()),
            external_account_id: Set(event.external_account_id.to_string()),
            external_identity_label: Set(event.external_identity_label.map(str::to_string)),
            from_owner_id: Set(event.from_owner_id),
            to_owner_id: Set(event.to_owner_id),
            ownership_version: Set(event.ownership_version),
            created_at: Set(to_db_time(now)),
            acknowledged_at: Set(None),
        };

        let rows = TransferEvent::insert(active)
            .on_conflict(
                OnConflict::columns([
                    transfer_event::Column::Provider,
                    transfer_event::Column::ExternalAccountId,
                    transfer_event::Column::OwnershipVersion,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;

        Ok(rows > 0)
    }

    /// Unacknowledged events addressed to an owner, oldest first
    pub async fn list_unacknowledged<C: ConnectionTrait>(
        conn: &C,
        from_owner_id: Uuid,
    ) -> Result<Vec<Model>, DbErr> {
        TransferEvent::find()
            .filter(transfer_event::Column::FromOwnerId.eq(from_owner_id))
            .filter(transfer_event::Column::AcknowledgedAt.is_null())
            .order_by_asc(transfer_event::Column::CreatedAt)
            .order_by_asc(transfer_event::Column::Id)
            .all(conn)
            .await
    }

    /// Finds an event only if it is addressed to `from_owner_id`
    pub async fn find_for_owner<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        from_owner_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        TransferEvent::find_by_id(id)
            .filter(transfer_event::Column::FromOwnerId.eq(from_owner_id))
            .one(conn)
            .await
    }

    /// Sets `acknowledged_at` if it is still empty
    pub async fn acknowledge<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        from_owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        TransferEvent::update_many()
            .col_expr(
                transfer_event::Column::AcknowledgedAt,
                Expr::value(to_db_time(now)),
            )
            .filter(transfer_event::Column::Id.eq(id))
            .filter(transfer_event::Column::FromOwnerId.eq(from_owner_id))
            .filter(transfer_event::Column::AcknowledgedAt.is_null())
            .exec(conn)
            .await?;
        Ok(())
    }

    /// All events for an identity, used by the ledger audit
    pub async fn list_for_identity<C: ConnectionTrait>(
        conn: &C,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Vec<Model>, DbErr> {
        TransferEvent::find()
            .filter(transfer_event::Column::Provider.eq(provider))
            .filter(transfer_event::Column::ExternalAccountId.eq(external_account_id))
            .order_by_asc(transfer_event::Column::OwnershipVersion)
            .all(conn)
            .await
    }
}
