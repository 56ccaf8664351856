//! NotificationLedger: one acknowledgeable event per completed transfer,
//! visible only to the owner who lost the identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde::Serialize;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::SlotError;
use crate::models::transfer_event;
use crate::repositories::{NewTransferEvent, TransferEventRepository};

/// What the dispossessed owner is told. The new owner is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct TransferNotice {
    pub id: Uuid,
    pub provider: String,
    pub external_account_id: String,
    pub external_identity_label: Option<String>,
    pub transferred_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl From<transfer_event::Model> for TransferNotice {
    fn from(event: transfer_event::Model) -> Self {
        Self {
            id: event.id,
            provider: event.provider,
            external_account_id: event.external_account_id,
            external_identity_label: event.external_identity_label,
            transferred_at: event.created_at.with_timezone(&Utc),
            acknowledged_at: event.acknowledged_at.map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationLedger {
    db: Arc<DatabaseConnection>,
}

impl NotificationLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Records a transfer inside the caller's transaction. A second call for
    /// the same ownership version is a no-op and returns false.
    pub async fn record<C: ConnectionTrait>(
        &self,
        conn: &C,
        event: NewTransferEvent<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, SlotError> {
        let from_owner_id = event.from_owner_id;
        let ownership_version = event.ownership_version;
        let inserted = TransferEventRepository::insert_once(conn, event, now).await?;
        if !inserted {
            debug!(
                from_owner_id = %from_owner_id,
                ownership_version,
                "Transfer event already recorded"
            );
        }
        Ok(inserted)
    }

    pub async fn list_unacknowledged(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<TransferNotice>, SlotError> {
        Ok(
            TransferEventRepository::list_unacknowledged(&*self.db, owner_id)
                .await?
                .into_iter()
                .map(TransferNotice::from)
                .collect(),
        )
    }

    /// Acknowledges an event addressed to `owner_id`. Acknowledging twice keeps
    /// the first timestamp. Returns `None` when no such event exists for the owner.
    pub async fn acknowledge(
        &self,
        owner_id: Uuid,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TransferNotice>, SlotError> {
        TransferEventRepository::acknowledge(&*self.db, event_id, owner_id, now).await?;

        let event = TransferEventRepository::find_for_owner(&*self.db, event_id, owner_id).await?;
        if event.is_some() {
            info!(owner_id = %owner_id, event_id = %event_id, "Transfer notice acknowledged");
        }
        Ok(event.map(TransferNotice::from))
    }
}
