//! Durable persistence of sweep batches and their member sweeps.
//!
//! The [`store::BatcherStore`] trait is the only surface the batcher
//! depends on; [`sqlite::SqliteStore`] is the shipped implementation.

pub mod errors;
pub mod sqlite;
pub mod store;

pub use errors::{DbError, DbResult};
pub use sqlite::SqliteStore;
pub use store::{BatcherStore, DbBatch, DbSweep};
