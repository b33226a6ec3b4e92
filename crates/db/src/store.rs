//! The store contract of the batcher and the row types it traffics in.

use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use sweepbatcher_primitives::types::{BatchState, SwapHash};

use crate::errors::DbResult;

/// Persisted form of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbBatch {
    /// Assigned by the store on insert.
    pub id: i32,

    pub state: BatchState,

    /// Identity of the last published transaction, unset until the first
    /// publication.
    pub batch_txid: Option<Txid>,
    pub batch_pk_script: ScriptBuf,

    /// Height at which the fee rate was last raised; zero until the
    /// first publication.
    pub last_rbf_height: u32,

    /// Fee-rate floor for the next publication, in sat/kw; zero until
    /// the first fee estimate.
    pub last_rbf_sat_per_kw: u64,

    pub max_timeout_distance: u32,
}

/// Persisted form of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSweep {
    pub swap_hash: SwapHash,
    pub batch_id: i32,
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub completed: bool,
}

/// Durable operations the batcher relies on. Every call is atomic.
#[async_trait]
pub trait BatcherStore: Send + Sync {
    /// Fetches all batches that are not yet confirmed.
    async fn fetch_unconfirmed_sweep_batches(&self) -> DbResult<Vec<DbBatch>>;

    /// Inserts a batch, returning the assigned id.
    async fn insert_sweep_batch(&self, batch: &DbBatch) -> DbResult<i32>;

    /// Drops a batch. Only legal while the batch has no sweeps.
    async fn drop_batch(&self, id: i32) -> DbResult<()>;

    /// Updates a batch row in place.
    async fn update_sweep_batch(&self, batch: &DbBatch) -> DbResult<()>;

    /// Marks a batch confirmed. Terminal.
    async fn confirm_batch(&self, id: i32) -> DbResult<()>;

    /// Fetches the sweeps of a batch in insertion order, so the first
    /// row is the batch's primary sweep.
    async fn fetch_batch_sweeps(&self, id: i32) -> DbResult<Vec<DbSweep>>;

    /// Inserts a sweep, or refreshes it if the swap hash already exists.
    async fn upsert_sweep(&self, sweep: &DbSweep) -> DbResult<()>;

    /// Whether the sweep has been completed. Unknown sweeps report
    /// `false`.
    async fn get_sweep_status(&self, swap_hash: SwapHash) -> DbResult<bool>;

    /// The batch a (completed) sweep belongs to.
    async fn get_parent_batch(&self, swap_hash: SwapHash) -> DbResult<DbBatch>;

    /// Total value of all sweeps in a batch.
    async fn total_swept_amount(&self, id: i32) -> DbResult<Amount>;
}
