//! Core domain types shared across the sweep-batcher workspace.

use std::{fmt, str::FromStr};

use bitcoin::secp256k1::PublicKey;
use thiserror::Error;

/// The payment hash of the swap a sweep belongs to. It is the unique key of
/// a sweep everywhere: in batches, in the store and in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapHash(pub [u8; 32]);

impl SwapHash {
    /// Returns the first six bytes in hex, the form used in log lines.
    pub fn short(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for SwapHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Preimage of the swept HTLC, revealed on-chain by the success path.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage(pub [u8; 32]);

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The preimage is money; keep it out of debug output.
        f.write_str("Preimage(..)")
    }
}

/// Protocol version of the swap a sweep belongs to. It decides the HTLC
/// construction (v2 script vs v3 taproot) and with it whether the
/// cooperative MuSig2 key-spend path exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Pre-taproot swaps using the v2 HTLC. Script-path spends only.
    HtlcV2,
    /// Taproot swaps using the v3 HTLC with MuSig2 internal keys.
    MuSig2,
}

impl ProtocolVersion {
    /// Whether swaps of this version can be swept through the cooperative
    /// taproot key-spend path.
    pub fn supports_coop_sweep(self) -> bool {
        matches!(self, ProtocolVersion::MuSig2)
    }
}

/// Locator the signer uses to resolve the client's private HTLC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLocator {
    pub family: u32,
    pub index: u32,
}

/// The public keys of a swap HTLC, as handed out by the swap layer.
///
/// The internal keys are only present for [`ProtocolVersion::MuSig2`]
/// swaps; they aggregate into the taproot internal key of the v3 HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcKeys {
    pub sender_script_key: PublicKey,
    pub receiver_script_key: PublicKey,
    pub sender_internal_key: Option<PublicKey>,
    pub receiver_internal_key: Option<PublicKey>,

    /// Resolves the local private key matching the client's script or
    /// internal key.
    pub client_key_locator: KeyLocator,
}

/// Lifecycle state of a batch.
///
/// While `Open` new sweeps may join. `Closed` freezes the member set
/// pending confirmation. `Confirmed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Closed,
    Confirmed,
}

impl BatchState {
    /// The string persisted in the batch row.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Open => "open",
            BatchState::Closed => "closed",
            BatchState::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a persisted batch state string is unknown.
#[derive(Debug, Clone, Error)]
#[error("unknown batch state: {0}")]
pub struct UnknownBatchState(pub String);

impl FromStr for BatchState {
    type Err = UnknownBatchState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BatchState::Open),
            "closed" => Ok(BatchState::Closed),
            "confirmed" => Ok(BatchState::Confirmed),
            other => Err(UnknownBatchState(other.to_string())),
        }
    }
}
