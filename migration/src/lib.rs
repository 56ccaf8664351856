//! Database migrations for the account slot ledger.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_12_090000_create_account_slots;
mod m2026_01_12_090100_create_account_bindings;
mod m2026_01_12_090200_create_transfer_requests;
mod m2026_01_12_090300_create_transfer_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_12_090000_create_account_slots::Migration),
            Box::new(m2026_01_12_090100_create_account_bindings::Migration),
            Box::new(m2026_01_12_090200_create_transfer_requests::Migration),
            Box::new(m2026_01_12_090300_create_transfer_events::Migration),
        ]
    }
}
