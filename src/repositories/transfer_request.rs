//! Transfer request repository for database operations

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, Set,
};
use uuid::Uuid;

use super::binding::BindingCredentials;
use super::to_db_time;
use crate::models::transfer_request::{
    self, ActiveModel, Entity as TransferRequest, Model, TransferRequestStatus,
};

/// Fields for staging a transfer.
#[derive(Debug, Clone)]
pub struct StagedTransfer<'a> {
    pub provider: &'a str,
    pub external_account_id: &'a str,
    pub requesting_owner_id: Uuid,
    pub current_owner_id: Uuid,
    pub credentials: BindingCredentials,
    pub expires_at: DateTime<Utc>,
}

pub struct TransferRequestRepository;

impl TransferRequestRepository {
    pub async fn find_by_id<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Option<Model>, DbErr> {
        TransferRequest::find_by_id(id).one(conn).await
    }

    /// The claimant's pending request for an identity, if one exists
    pub async fn find_pending<C: ConnectionTrait>(
        conn: &C,
        provider: &str,
        external_account_id: &str,
        requesting_owner_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        TransferRequest::find()
            .filter(transfer_request::Column::Provider.eq(provider))
            .filter(transfer_request::Column::ExternalAccountId.eq(external_account_id))
            .filter(transfer_request::Column::RequestingOwnerId.eq(requesting_owner_id))
            .filter(transfer_request::Column::Status.eq(TransferRequestStatus::Pending.as_str()))
            .one(conn)
            .await
    }

    pub async fn insert<C: ConnectionTrait>(
        conn: &C,
        staged: StagedTransfer<'_>,
        now: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let id = Uuid::new_v4();
        let active = ActiveModel {
            id: Set(id),
            provider: Set(staged.provider.to_string()),
            external_account_id: Set(staged.external_account_id.to_string()),
            requesting_owner_id: Set(staged.requesting_owner_id),
            current_owner_id: Set(staged.current_owner_id),
            claimed_identity_label: Set(staged.credentials.external_identity_label),
            access_token_ciphertext: Set(staged.credentials.encrypted.access_token),
            refresh_token_ciphertext: Set(staged.credentials.encrypted.refresh_token),
            token_expires_at: Set(staged.credentials.token_expires_at.map(to_db_time)),
            status: Set(TransferRequestStatus::Pending.to_string()),
            created_at: Set(to_db_time(now)),
            expires_at: Set(to_db_time(staged.expires_at)),
            used_at: Set(None),
        };

        TransferRequest::insert(active)
            .exec_without_returning(conn)
            .await?;

        TransferRequest::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("transfer request {id}")))
    }

    /// Replaces the staged credentials of a live pending request and extends it
    pub async fn refresh_pending<C: ConnectionTrait>(
        conn: &C,
        existing: Model,
        staged: StagedTransfer<'_>,
    ) -> Result<Model, DbErr> {
        let mut active = existing.into_active_model();
        active.current_owner_id = Set(staged.current_owner_id);
        active.claimed_identity_label = Set(staged.credentials.external_identity_label);
        active.access_token_ciphertext = Set(staged.credentials.encrypted.access_token);
        active.refresh_token_ciphertext = Set(staged.credentials.encrypted.refresh_token);
        active.token_expires_at = Set(staged.credentials.token_expires_at.map(to_db_time));
        active.expires_at = Set(to_db_time(staged.expires_at));
        active.update(conn).await
    }

    /// Flips a pending request to `used`. Returns false when it was not pending.
    pub async fn mark_used<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let result = TransferRequest::update_many()
            .col_expr(
                transfer_request::Column::Status,
                Expr::value(TransferRequestStatus::Used.as_str()),
            )
            .col_expr(transfer_request::Column::UsedAt, Expr::value(to_db_time(now)))
            .filter(transfer_request::Column::Id.eq(id))
            .filter(transfer_request::Column::Status.eq(TransferRequestStatus::Pending.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Flips a pending request to `expired`. Returns false when it was not pending.
    pub async fn mark_expired<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<bool, DbErr> {
        let result = TransferRequest::update_many()
            .col_expr(
                transfer_request::Column::Status,
                Expr::value(TransferRequestStatus::Expired.as_str()),
            )
            .filter(transfer_request::Column::Id.eq(id))
            .filter(transfer_request::Column::Status.eq(TransferRequestStatus::Pending.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Expires every pending request whose deadline has passed, optionally
    /// narrowed to one claimant and identity
    pub async fn expire_overdue<C: ConnectionTrait>(
        conn: &C,
        now: DateTime<Utc>,
        scope: Option<(&str, &str, Uuid)>,
    ) -> Result<u64, DbErr> {
        let mut update = TransferRequest::update_many()
            .col_expr(
                transfer_request::Column::Status,
                Expr::value(TransferRequestStatus::Expired.as_str()),
            )
            .filter(transfer_request::Column::Status.eq(TransferRequestStatus::Pending.as_str()))
            .filter(transfer_request::Column::ExpiresAt.lte(to_db_time(now)));

        if let Some((provider, external_account_id, requesting_owner_id)) = scope {
            update = update
                .filter(transfer_request::Column::Provider.eq(provider))
                .filter(transfer_request::Column::ExternalAccountId.eq(external_account_id))
                .filter(transfer_request::Column::RequestingOwnerId.eq(requesting_owner_id));
        }

        Ok(update.exec(conn).await?.rows_affected)
    }
}
