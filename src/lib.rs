//! # Account Slots
//!
//! Lifetime account slots, credential bindings and ownership transfers for
//! externally connected accounts, served over HTTP.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod server;
pub mod slots;
pub mod telemetry;
pub use migration;
