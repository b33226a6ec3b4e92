//! Unified error type for the batcher and its batches.

use sweepbatcher_db::DbError;
use sweepbatcher_primitives::{htlc::HtlcError, types::SwapHash, weight::WeightError};
use thiserror::Error;

use crate::client::ClientError;

#[derive(Debug, Error)]
pub enum BatcherError {
    /// The batcher is shutting down and no longer accepts sweeps.
    #[error("batcher shutting down")]
    BatcherShuttingDown,

    /// The batch is closed or gone and no longer accepts sweeps.
    #[error("batch shutting down")]
    BatchShuttingDown,

    /// A store operation failed. Fatal to the owning batch.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// A collaborator call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Weight estimation failed.
    #[error("weight estimation failed: {0}")]
    Weight(#[from] WeightError),

    /// HTLC witness material is inconsistent.
    #[error(transparent)]
    Htlc(#[from] HtlcError),

    /// A batch that was expected to take a sweep rejected it.
    #[error("sweep {swap_hash} was not accepted by batch {batch_id}")]
    SweepNotAccepted { swap_hash: SwapHash, batch_id: i32 },

    /// An externally addressed sweep carries no destination address.
    #[error("externally addressed sweep {0} has no destination address")]
    MissingDestAddr(SwapHash),

    /// A weight or fee estimate was requested for a batch with no sweeps.
    #[error("batch {0} has no sweeps")]
    EmptyBatch(i32),

    /// A fee rate below the absolute floor was offered.
    #[error("fee rate {0} sat/kw is below the absolute floor")]
    FeeRateTooLow(u64),

    /// Batch selection returned an id that is no longer live.
    #[error("selected batch {0} no longer exists")]
    UnknownBatch(i32),

    /// Adding a sweep to a batch did not increase its fee, which means
    /// the weight math is broken.
    #[error("got non-positive cost {cost} of adding sweep to batch {batch_id}")]
    NonPositiveCost { batch_id: i32, cost: i64 },
}
