//! Migration to create the account_slots table.
//!
//! A slot is one permanent unit of an owner's lifetime quota for a provider.
//! Rows are never deleted; `origin_owner_id` and `sequence_number` are immutable.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AccountSlots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccountSlots::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AccountSlots::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(AccountSlots::OriginOwnerId).uuid().not_null())
                    .col(ColumnDef::new(AccountSlots::Provider).text().not_null())
                    .col(
                        ColumnDef::new(AccountSlots::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AccountSlots::ExternalIdentityLabel)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountSlots::SequenceNumber)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AccountSlots::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(AccountSlots::PlanAtCreation).text().not_null())
                    .col(
                        ColumnDef::new(AccountSlots::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AccountSlots::DeactivatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_account_slots_owner_provider_external")
                    .table(AccountSlots::Table)
                    .col(AccountSlots::OwnerId)
                    .col(AccountSlots::Provider)
                    .col(AccountSlots::ExternalAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // A slot travels with its external identity, so the identity is globally unique.
        manager
            .create_index(
                Index::create()
                    .name("idx_account_slots_provider_external")
                    .table(AccountSlots::Table)
                    .col(AccountSlots::Provider)
                    .col(AccountSlots::ExternalAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Serialises concurrent allocations for the same owner.
        manager
            .create_index(
                Index::create()
                    .name("idx_account_slots_origin_provider_sequence")
                    .table(AccountSlots::Table)
                    .col(AccountSlots::OriginOwnerId)
                    .col(AccountSlots::Provider)
                    .col(AccountSlots::SequenceNumber)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_account_slots_owner_provider_external",
            "idx_account_slots_provider_external",
            "idx_account_slots_origin_provider_sequence",
        ] {
            manager
                .drop_index(Index::drop().name(name).table(AccountSlots::Table).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(AccountSlots::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AccountSlots {
    Table,
    Id,
    OwnerId,
    OriginOwnerId,
    Provider,
    ExternalAccountId,
    ExternalIdentityLabel,
    SequenceNumber,
    IsActive,
    PlanAtCreation,
    CreatedAt,
    DeactivatedAt,
}
