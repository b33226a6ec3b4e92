//! HTLC script material, pre-built by the swap layer and consumed here.
//!
//! The batcher never constructs HTLC scripts itself. It receives the
//! output script, the success leaf and (for v3) the taproot spend proof,
//! and only assembles witnesses and weight contributions from them.

use bitcoin::{ScriptBuf, TapNodeHash, Witness};
use thiserror::Error;

use crate::{
    types::{Preimage, ProtocolVersion},
    weight::{TxWeightEstimator, HTLC_V2_SUCCESS_WITNESS_SIZE, HTLC_V3_SUCCESS_WITNESS_SIZE},
};

/// On-chain construction of a swap HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcVersion {
    /// Segwit v0 P2WSH script.
    V2,
    /// Taproot output with MuSig2 internal key and script leaves.
    V3,
}

impl ProtocolVersion {
    /// The HTLC construction used by swaps of this protocol version.
    pub fn htlc_version(self) -> HtlcVersion {
        match self {
            ProtocolVersion::HtlcV2 => HtlcVersion::V2,
            ProtocolVersion::MuSig2 => HtlcVersion::V3,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HtlcError {
    /// A v3 spend needs taproot material the HTLC does not carry.
    #[error("htlc is missing taproot material: {0}")]
    MissingTaprootMaterial(&'static str),
}

/// Script material of one swap HTLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc {
    pub version: HtlcVersion,

    /// The output script of the HTLC itself, watched for spends.
    pub pk_script: ScriptBuf,

    /// The success (preimage) leaf; the witness script for v2, the tap
    /// leaf script for v3.
    pub success_script: ScriptBuf,

    /// Merkle root of the v3 taproot tree; tweaks the MuSig2 internal key
    /// for cooperative key spends.
    pub root_hash: Option<TapNodeHash>,

    /// Control block proving the success leaf of the v3 tree.
    pub control_block: Option<Vec<u8>>,
}

impl Htlc {
    /// Adds this HTLC's success-path input to a weight estimator.
    pub fn add_success_to_estimator(&self, estimator: &mut TxWeightEstimator) {
        match self.version {
            HtlcVersion::V2 => estimator.add_witness_input(HTLC_V2_SUCCESS_WITNESS_SIZE),
            HtlcVersion::V3 => estimator.add_witness_input(HTLC_V3_SUCCESS_WITNESS_SIZE),
        };
    }

    /// The taproot merkle root of a v3 HTLC.
    pub fn root_hash(&self) -> Result<TapNodeHash, HtlcError> {
        self.root_hash
            .ok_or(HtlcError::MissingTaprootMaterial("root hash"))
    }

    /// Assembles the success-path witness revealing `preimage`, given the
    /// raw signature returned by the signer.
    pub fn success_witness(&self, preimage: &Preimage, sig: &[u8]) -> Result<Witness, HtlcError> {
        match self.version {
            HtlcVersion::V2 => Ok(Witness::from_slice(&[
                sig,
                &preimage.0,
                self.success_script.as_bytes(),
            ])),
            HtlcVersion::V3 => {
                let control_block = self
                    .control_block
                    .as_deref()
                    .ok_or(HtlcError::MissingTaprootMaterial("control block"))?;

                Ok(Witness::from_slice(&[
                    sig,
                    &preimage.0,
                    self.success_script.as_bytes(),
                    control_block,
                ]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn htlc(version: HtlcVersion) -> Htlc {
        Htlc {
            version,
            pk_script: ScriptBuf::new(),
            success_script: ScriptBuf::from_bytes(vec![0x51]),
            root_hash: None,
            control_block: match version {
                HtlcVersion::V2 => None,
                HtlcVersion::V3 => Some(vec![0xc0; 33]),
            },
        }
    }

    #[test]
    fn v2_witness_has_three_items() {
        let witness = htlc(HtlcVersion::V2)
            .success_witness(&Preimage([7; 32]), &[1; 72])
            .unwrap();
        assert_eq!(witness.len(), 3);
    }

    #[test]
    fn v3_witness_has_four_items() {
        let witness = htlc(HtlcVersion::V3)
            .success_witness(&Preimage([7; 32]), &[1; 64])
            .unwrap();
        assert_eq!(witness.len(), 4);
    }

    #[test]
    fn v3_witness_needs_control_block() {
        let mut htlc = htlc(HtlcVersion::V3);
        htlc.control_block = None;
        assert_eq!(
            htlc.success_witness(&Preimage([7; 32]), &[1; 64]),
            Err(HtlcError::MissingTaprootMaterial("control block")),
        );
    }
}
