//! Migration to create the account_bindings table.
//!
//! Bindings carry the encrypted provider credentials for a slot. The unique
//! index on `(provider, external_account_id)` is global across owners: only
//! one local profile may hold an external identity at a time.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AccountBindings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccountBindings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AccountBindings::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(AccountBindings::Provider).text().not_null())
                    .col(
                        ColumnDef::new(AccountBindings::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AccountBindings::SlotId).uuid().not_null())
                    .col(
                        ColumnDef::new(AccountBindings::ExternalIdentityLabel)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::OwnershipVersion)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AccountBindings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_account_bindings_slot_id")
                            .from(AccountBindings::Table, AccountBindings::SlotId)
                            .to(AccountSlots::Table, AccountSlots::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_account_bindings_provider_external")
                    .table(AccountBindings::Table)
                    .col(AccountBindings::Provider)
                    .col(AccountBindings::ExternalAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_account_bindings_slot_id")
                    .table(AccountBindings::Table)
                    .col(AccountBindings::SlotId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_account_bindings_owner_id")
                    .table(AccountBindings::Table)
                    .col(AccountBindings::OwnerId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_account_bindings_provider_external",
            "idx_account_bindings_slot_id",
            "idx_account_bindings_owner_id",
        ] {
            manager
                .drop_index(
                    Index::drop()
                        .name(name)
                        .table(AccountBindings::Table)
                        .to_owned(),
                )
                .await?;
        }

        manager
            .drop_table(Table::drop().table(AccountBindings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AccountBindings {
    Table,
    Id,
    OwnerId,
    Provider,
    ExternalAccountId,
    SlotId,
    ExternalIdentityLabel,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    TokenExpiresAt,
    IsActive,
    OwnershipVersion,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AccountSlots {
    Table,
    Id,
}
