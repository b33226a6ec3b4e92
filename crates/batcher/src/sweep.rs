//! Sweep requests, fetched sweep details and the in-memory sweep owned
//! by a batch.

use bitcoin::{Address, Amount, FeeRate, OutPoint, Transaction};
use sweepbatcher_primitives::{
    htlc::Htlc,
    types::{HtlcKeys, Preimage, ProtocolVersion, SwapHash},
};
use tokio::sync::{mpsc, watch};

use crate::client::ClientError;

/// A request to sweep a specific HTLC outpoint.
#[derive(Debug, Clone)]
pub struct SweepRequest {
    /// Hash of the swap being swept.
    pub swap_hash: SwapHash,

    /// The HTLC outpoint to spend and its value.
    pub outpoint: OutPoint,
    pub value: Amount,

    /// Channels the requester listens on for the spend of this sweep.
    pub notifier: Option<SpendNotifier>,
}

/// Everything the swap layer knows about a sweep, resolved by swap hash.
#[derive(Debug, Clone)]
pub struct SweepInfo {
    pub conf_target: u32,

    /// Absolute height at which the HTLC refund path opens.
    pub timeout: u32,
    pub initiation_height: u32,

    pub htlc: Htlc,
    pub preimage: Preimage,
    pub swap_invoice_payment_addr: [u8; 32],
    pub htlc_keys: HtlcKeys,
    pub protocol_version: ProtocolVersion,

    /// Sweeps to a non-wallet address; such a sweep is never co-batched.
    pub is_external_addr: bool,
    pub dest_addr: Option<Address>,

    /// Minimum fee rate for any batch holding this sweep. Zero leaves
    /// the fee rate to the batcher.
    pub min_fee_rate: FeeRate,
}

/// The spend of a sweep as reported to its requester.
#[derive(Debug, Clone)]
pub struct SpendDetail {
    /// The transaction that spent the swept outpoint.
    pub tx: Transaction,

    /// This sweep's share of the spending transaction's fee.
    pub on_chain_fee_portion: Amount,
}

/// Channels a sweep requester listens on. Sends never block batch
/// progress.
#[derive(Debug, Clone)]
pub struct SpendNotifier {
    pub spend_chan: mpsc::Sender<SpendDetail>,
    pub spend_err_chan: mpsc::Sender<ClientError>,

    /// Flips to true when the requester is no longer interested.
    pub quit: watch::Receiver<bool>,
}

impl SpendNotifier {
    /// Builds a notifier together with the receiver and quit ends held
    /// by the requester.
    pub fn new() -> (
        Self,
        mpsc::Receiver<SpendDetail>,
        mpsc::Receiver<ClientError>,
        watch::Sender<bool>,
    ) {
        let (spend_tx, spend_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = watch::channel(false);

        (
            SpendNotifier {
                spend_chan: spend_tx,
                spend_err_chan: err_tx,
                quit: quit_rx,
            },
            spend_rx,
            err_rx,
            quit_tx,
        )
    }
}

/// A sweep as owned and mutated by its batch.
#[derive(Debug, Clone)]
pub(crate) struct Sweep {
    pub swap_hash: SwapHash,
    pub outpoint: OutPoint,
    pub value: Amount,
    pub conf_target: u32,
    pub timeout: u32,
    pub initiation_height: u32,
    pub htlc: Htlc,
    pub preimage: Preimage,
    pub swap_invoice_payment_addr: [u8; 32],
    pub htlc_keys: HtlcKeys,
    pub protocol_version: ProtocolVersion,
    pub is_external_addr: bool,
    pub dest_addr: Option<Address>,
    pub min_fee_rate: FeeRate,
    pub notifier: Option<SpendNotifier>,

    /// Set when cooperative signing failed for this sweep; from then on
    /// its batch spends through the HTLC success path.
    pub non_coop_hint: bool,
}

impl Sweep {
    /// Combines a sweep request with its fetched details.
    pub(crate) fn new(
        swap_hash: SwapHash,
        outpoint: OutPoint,
        value: Amount,
        notifier: Option<SpendNotifier>,
        info: SweepInfo,
    ) -> Self {
        Sweep {
            swap_hash,
            outpoint,
            value,
            conf_target: info.conf_target,
            timeout: info.timeout,
            initiation_height: info.initiation_height,
            htlc: info.htlc,
            preimage: info.preimage,
            swap_invoice_payment_addr: info.swap_invoice_payment_addr,
            htlc_keys: info.htlc_keys,
            protocol_version: info.protocol_version,
            is_external_addr: info.is_external_addr,
            dest_addr: info.dest_addr,
            min_fee_rate: info.min_fee_rate,
            notifier,
            non_coop_hint: false,
        }
    }
}
