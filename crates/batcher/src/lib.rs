//! Sweep batcher for a Lightning submarine-swap client.
//!
//! When a swap completes off-chain the client holds the preimage to an
//! on-chain HTLC and must sweep that output before its timeout. Sweeping
//! each HTLC alone wastes fees; this crate aggregates concurrently
//! maturing sweeps into one batched transaction per published block,
//! bumps its fee through RBF until it confirms, prefers the cooperative
//! MuSig2 key-spend path over the preimage-revealing success path, and
//! persists every batch so a restart resumes in-flight work.
//!
//! Entry point is [`Batcher`]: feed it [`SweepRequest`]s through a
//! [`BatcherHandle`] and drive it with [`Batcher::run`]. Collaborators
//! (wallet, chain backend, signers, store) are injected through the
//! traits in [`client`] and [`sweepbatcher_db`].

mod batch;
pub mod batcher;
pub mod client;
pub mod errors;
mod selection;
pub mod sweep;

#[cfg(test)]
mod test_utils;

pub use batcher::{Batcher, BatcherConfig, BatcherHandle};
pub use errors::BatcherError;
pub use sweep::{SpendDetail, SpendNotifier, SweepInfo, SweepRequest};
