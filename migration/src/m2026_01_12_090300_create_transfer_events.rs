//! Migration to create the transfer_events table (notifications for the
//! owner who lost an identity).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TransferEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TransferEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TransferEvents::Provider).text().not_null())
                    .col(
                        ColumnDef::new(TransferEvents::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferEvents::ExternalIdentityLabel)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(TransferEvents::FromOwnerId).uuid().not_null())
                    .col(ColumnDef::new(TransferEvents::ToOwnerId).uuid().not_null())
                    .col(
                        ColumnDef::new(TransferEvents::OwnershipVersion)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransferEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TransferEvents::AcknowledgedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_transfer_events_identity_version")
                    .table(TransferEvents::Table)
                    .col(TransferEvents::Provider)
                    .col(TransferEvents::ExternalAccountId)
                    .col(TransferEvents::OwnershipVersion)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_transfer_events_from_owner_ack")
                    .table(TransferEvents::Table)
                    .col(TransferEvents::FromOwnerId)
                    .col(TransferEvents::AcknowledgedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_transfer_events_identity_version",
            "idx_transfer_events_from_owner_ack",
        ] {
            manager
                .drop_index(
                    Index::drop()
                        .name(name)
                        .table(TransferEvents::Table)
                        .to_owned(),
                )
                .await?;
        }

        manager
            .drop_table(Table::drop().table(TransferEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TransferEvents {
    Table,
    Id,
    Provider,
    ExternalAccountId,
    ExternalIdentityLabel,
    FromOwnerId,
    ToOwnerId,
    OwnershipVersion,
    CreatedAt,
    AcknowledgedAt,
}
