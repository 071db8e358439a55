//! Database layer for the call bridge.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. The bridge only reads tenant routing data
//! while calls are live; writes happen through provisioning.
//!
//! - **WAL mode** lets every call worker resolve its tenant concurrently
//!   without blocking on provisioning writes.
//! - **Embedded migrations** are compiled in via `include_str!`, so the
//!   schema ships with the binary.

mod migrations;
mod pool;

pub use migrations::{applied_migrations, run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
