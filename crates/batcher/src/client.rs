//! Capability interfaces of the batcher's collaborators.
//!
//! Everything the batcher needs from the outside world — the wallet, the
//! chain backend, the local signer and the swap server — is specified
//! here as a narrow trait and injected as a trait object. The batcher
//! never constructs HTLC scripts, never owns keys and never talks RPC
//! directly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bitcoin::{
    Address, FeeRate, OutPoint, ScriptBuf, TapNodeHash, Transaction, TxOut, Txid,
};
use musig2::{PartialSignature, PubNonce};
use secp256k1::{schnorr, Message, PublicKey, XOnlyPublicKey, SECP256K1};
use sweepbatcher_primitives::types::{KeyLocator, ProtocolVersion, SwapHash};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sweep::SweepInfo;

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by collaborator clients. These are transient from the
/// batcher's point of view: they are logged and retried on the next
/// block tick, or trigger the non-cooperative fallback when signing.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("chain error: {0}")]
    Chain(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("swap server signer error: {0}")]
    CoopSigner(String),

    #[error("sweep fetcher error: {0}")]
    SweepFetcher(String),

    /// The published replacement did not pay enough fee over the
    /// transaction it replaces.
    #[error("insufficient fee to replace published transaction: {0}")]
    InsufficientFee(String),

    #[error("schnorr signature verification failed: {0}")]
    InvalidSignature(String),
}

/// A spend of a watched outpoint.
#[derive(Debug, Clone)]
pub struct SpendEvent {
    pub spending_tx: Transaction,
    pub spending_height: u32,
}

/// A watched transaction reaching its requested confirmation depth.
#[derive(Debug, Clone)]
pub struct ConfEvent {
    pub tx: Transaction,
    pub block_height: u32,
}

/// Chain notifications and transaction publication.
#[async_trait]
pub trait ChainNotifier: Send + Sync {
    /// Streams the height of every new chain tip.
    async fn register_block_epoch_ntfn(&self) -> ClientResult<mpsc::Receiver<u32>>;

    /// Watches `outpoint` for a spend, scanning from `height_hint`.
    async fn register_spend_ntfn(
        &self,
        outpoint: &OutPoint,
        pk_script: &ScriptBuf,
        height_hint: u32,
    ) -> ClientResult<(mpsc::Receiver<SpendEvent>, mpsc::Receiver<ClientError>)>;

    /// Watches `txid` until it is `num_confs` deep.
    async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        pk_script: &ScriptBuf,
        num_confs: u32,
        height_hint: u32,
    ) -> ClientResult<(mpsc::Receiver<ConfEvent>, mpsc::Receiver<ClientError>)>;

    /// Broadcasts a raw transaction.
    async fn publish_tx(&self, tx: &Transaction, label: &str) -> ClientResult<()>;
}

/// Fee estimation and destination addresses from the on-chain wallet.
#[async_trait]
pub trait WalletKit: Send + Sync {
    /// Estimates the fee rate to confirm within `conf_target` blocks.
    async fn estimate_fee_rate(&self, conf_target: u32) -> ClientResult<FeeRate>;

    /// Hands out a fresh wallet taproot address.
    async fn next_addr(&self) -> ClientResult<Address>;
}

/// A MuSig2 signing session opened with the local signer.
#[derive(Debug, Clone)]
pub struct MuSig2Session {
    pub session_id: [u8; 32],

    /// Our public nonce, shared with the remote signer.
    pub our_nonce: PubNonce,

    /// The tweaked combined key. For a v3 HTLC this equals the taproot
    /// output key, so the final signature verifies against it.
    pub combined_key: XOnlyPublicKey,
}

/// How a raw input signature is to be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMethod {
    /// Segwit v0 ECDSA over the witness script (v2 HTLC success path).
    WitnessV0,

    /// Taproot script-spend Schnorr over the success leaf (v3 HTLC).
    TaprootScriptSpend,
}

/// Descriptor for one raw script-path signature.
#[derive(Debug, Clone)]
pub struct SignDescriptor {
    pub key_locator: KeyLocator,
    pub witness_script: ScriptBuf,
    pub output: TxOut,
    pub input_index: usize,
    pub sign_method: SignMethod,
}

/// The local signer: MuSig2 sessions for cooperative key spends and raw
/// signatures for the script path.
#[async_trait]
pub trait SignerClient: Send + Sync {
    /// Opens a two-party MuSig2 session over `signer_keys`, applying the
    /// taproot tweak for `root_hash`.
    async fn musig2_create_session(
        &self,
        key_locator: &KeyLocator,
        signer_keys: [PublicKey; 2],
        root_hash: TapNodeHash,
    ) -> ClientResult<MuSig2Session>;

    /// Registers counterparty nonces; returns whether all nonces are in.
    async fn musig2_register_nonces(
        &self,
        session_id: [u8; 32],
        nonces: &[PubNonce],
    ) -> ClientResult<bool>;

    /// Produces our partial signature over `sig_hash`.
    async fn musig2_sign(
        &self,
        session_id: [u8; 32],
        sig_hash: [u8; 32],
    ) -> ClientResult<PartialSignature>;

    /// Combines the counterparty partials with ours. The flag reports
    /// whether the signature is complete.
    async fn musig2_combine_sig(
        &self,
        session_id: [u8; 32],
        other_partials: &[PartialSignature],
    ) -> ClientResult<(bool, schnorr::Signature)>;

    /// Produces the raw signature for a script-path input.
    async fn sign_output_raw(
        &self,
        tx: &Transaction,
        descriptor: &SignDescriptor,
        prev_outs: &[TxOut],
    ) -> ClientResult<Vec<u8>>;
}

/// The swap server's half of a cooperative sweep signature.
#[async_trait]
pub trait MuSig2SignSweep: Send + Sync {
    /// Sends the sweep PSBT to the server; returns the server's public
    /// nonce and partial signature.
    async fn musig2_sign_sweep(
        &self,
        protocol_version: ProtocolVersion,
        swap_hash: SwapHash,
        payment_addr: [u8; 32],
        nonce: &PubNonce,
        sweep_tx_psbt: &[u8],
        prevout_map: &BTreeMap<OutPoint, TxOut>,
    ) -> ClientResult<(PubNonce, PartialSignature)>;
}

/// A custom MuSig2 signer producing the complete signature in one call,
/// replacing both the local session and the swap server exchange.
#[async_trait]
pub trait SignMuSig2: Send + Sync {
    async fn sign_musig2(
        &self,
        protocol_version: ProtocolVersion,
        swap_hash: SwapHash,
        root_hash: TapNodeHash,
        sig_hash: [u8; 32],
    ) -> ClientResult<schnorr::Signature>;
}

/// Schnorr signature verification.
#[async_trait]
pub trait VerifySchnorrSig: Send + Sync {
    async fn verify_schnorr_sig(
        &self,
        pub_key: &XOnlyPublicKey,
        sig_hash: &[u8; 32],
        sig: &schnorr::Signature,
    ) -> ClientResult<()>;
}

/// In-process Schnorr verification over the global secp context, for
/// setups that do not route verification through a signer RPC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecpVerifier;

#[async_trait]
impl VerifySchnorrSig for SecpVerifier {
    async fn verify_schnorr_sig(
        &self,
        pub_key: &XOnlyPublicKey,
        sig_hash: &[u8; 32],
        sig: &schnorr::Signature,
    ) -> ClientResult<()> {
        SECP256K1
            .verify_schnorr(sig, &Message::from_digest(*sig_hash), pub_key)
            .map_err(|e| ClientError::InvalidSignature(e.to_string()))
    }
}

/// Per-swap sweep details, resolved by swap hash.
#[async_trait]
pub trait SweepFetcher: Send + Sync {
    async fn fetch_sweep(&self, swap_hash: SwapHash) -> ClientResult<SweepInfo>;
}
