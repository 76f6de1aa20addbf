//! Write-behind persistence layer over SQLite.
//!
//! Two complementary primitives sit in front of the database:
//! [`writer::AsyncWriter`], a bounded work queue drained by a small pool of
//! workers (single-item writes that should never block the caller), and
//! [`batch::BatchWriter`], which accumulates same-shaped items and commits
//! them together once a size or age threshold trips. [`db`] owns schema
//! setup for the three on-disk databases the storage layer manages.

pub mod batch;
pub mod db;
pub mod manager;
pub mod writer;

pub use batch::{BatchConfig, BatchWriter};
pub use db::Databases;
pub use manager::StorageManager;
pub use writer::{AsyncWriter, WriteOp};
