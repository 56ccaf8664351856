//! Transfer request entity model
//!
//! Stages a claimant's credentials for an identity held by another owner
//! until the claimant confirms, or the request expires.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "transfer_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub provider: String,

    pub external_account_id: String,

    /// Owner asking to take the identity over
    pub requesting_owner_id: Uuid,

    /// Owner observed holding the identity when the request was staged
    pub current_owner_id: Uuid,

    /// Display identity reported for the claimant's credentials
    pub claimed_identity_label: Option<String>,

    pub access_token_ciphertext: Vec<u8>,

    pub refresh_token_ciphertext: Option<Vec<u8>>,

    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// `pending`, `used` or `expired`
    pub status: String,

    pub created_at: DateTimeWithTimeZone,

    pub expires_at: DateTimeWithTimeZone,

    pub used_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn status(&self) -> Option<TransferRequestStatus> {
        self.status.parse().ok()
    }
}

/// Lifecycle of a staged transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRequestStatus {
    Pending,
    Used,
    Expired,
}

impl TransferRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Used => "used",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for TransferRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "used" => Ok(Self::Used),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown transfer request status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_stored_values() {
        assert_eq!(
            "pending".parse::<TransferRequestStatus>(),
            Ok(TransferRequestStatus::Pending)
        );
        assert_eq!(TransferRequestStatus::Expired.to_string(), "expired");
        assert!("cancelled".parse::<TransferRequestStatus>().is_err());
    }
}
