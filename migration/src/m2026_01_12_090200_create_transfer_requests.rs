//! Migration to create the transfer_requests table.
//!
//! A transfer request stages a claimant's fresh credentials until the claimant
//! explicitly confirms taking over an identity held by another owner.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TransferRequests::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TransferRequests::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TransferRequests::Provider).text().not_null())
                    .col(
                        ColumnDef::new(TransferRequests::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::RequestingOwnerId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::CurrentOwnerId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::ClaimedIdentityLabel)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferRequests::UsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_transfer_requests_status_expires_at")
                    .table(TransferRequests::Table)
                    .col(TransferRequests::Status)
                    .col(TransferRequests::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // At most one pending request per claimant and identity.
        let backend = manager.get_database_backend();
        let sql = match backend {
            DatabaseBackend::Postgres => {
                "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = 'idx_transfer_requests_pending_claim'\n    ) THEN\n        CREATE UNIQUE INDEX idx_transfer_requests_pending_claim\n            ON transfer_requests (provider, external_account_id, requesting_owner_id)\n            WHERE status = 'pending';\n    END IF;\nEND\n$$;"
            }
            _ => {
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_transfer_requests_pending_claim \
                 ON transfer_requests (provider, external_account_id, requesting_owner_id) \
                 WHERE status = 'pending'"
            }
        };
        manager
            .get_connection()
            .execute(Statement::from_string(backend, sql.to_string()))
            .await
            .map(|_| ())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_transfer_requests_pending_claim",
            ))
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_transfer_requests_status_expires_at")
                    .table(TransferRequests::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(TransferRequests::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TransferRequests {
    Table,
    Id,
    Provider,
    ExternalAccountId,
    RequestingOwnerId,
    CurrentOwnerId,
    ClaimedIdentityLabel,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    TokenExpiresAt,
    Status,
    CreatedAt,
    ExpiresAt,
    UsedAt,
}
