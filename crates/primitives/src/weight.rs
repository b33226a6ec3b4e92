//! Transaction weight accounting for sweep transactions.
//!
//! Weights are needed before any signature exists, so the estimator works
//! from the serialized sizes the final transaction will have: base bytes
//! count four weight units each, witness bytes one.

use bitcoin::{Address, AddressType, Weight};
use thiserror::Error;

/// Version and locktime.
const BASE_TX_SIZE: u64 = 8;

/// Segwit marker and flag, in weight units.
const WITNESS_HEADER_WEIGHT: u64 = 2;

/// Previous outpoint (36), empty script-sig length (1) and sequence (4).
const INPUT_BASE_SIZE: u64 = 36 + 1 + 4;

/// Taproot key-spend witness with the default sighash type: item count,
/// length prefix and the 64-byte Schnorr signature.
const TAPROOT_KEY_SPEND_WITNESS_SIZE: u64 = 1 + 1 + 64;

/// Success-path witness of a v2 HTLC: item count, DER signature, preimage
/// and the witness script.
pub const HTLC_V2_SUCCESS_WITNESS_SIZE: u64 = 1 + (1 + 73) + (1 + 32) + (1 + 95);

/// Success-path witness of a v3 HTLC: item count, Schnorr signature,
/// preimage, success leaf script and the control block.
pub const HTLC_V3_SUCCESS_WITNESS_SIZE: u64 = 1 + (1 + 64) + (1 + 32) + (1 + 191) + (1 + 65);

/// Output sizes: 8-byte value, script length prefix and the script itself.
const P2TR_OUTPUT_SIZE: u64 = 8 + 1 + 34;
const P2WSH_OUTPUT_SIZE: u64 = 8 + 1 + 34;
const P2WPKH_OUTPUT_SIZE: u64 = 8 + 1 + 22;
const P2PKH_OUTPUT_SIZE: u64 = 8 + 1 + 25;
const P2SH_OUTPUT_SIZE: u64 = 8 + 1 + 23;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WeightError {
    /// The destination address kind has no output-size entry.
    #[error("unsupported destination address type")]
    UnsupportedAddress,
}

/// Accumulates the weight of a transaction under construction, input by
/// input and output by output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxWeightEstimator {
    input_count: u64,
    output_count: u64,
    input_size: u64,
    output_size: u64,
    witness_size: u64,
    has_witness: bool,
}

impl TxWeightEstimator {
    /// Accounts for a taproot key-spend input signed with the default
    /// sighash type.
    pub fn add_taproot_key_spend_input(&mut self) -> &mut Self {
        self.add_witness_input(TAPROOT_KEY_SPEND_WITNESS_SIZE)
    }

    /// Accounts for a segwit input whose witness serializes to
    /// `witness_size` bytes (including the item-count byte).
    pub fn add_witness_input(&mut self, witness_size: u64) -> &mut Self {
        self.input_count += 1;
        self.input_size += INPUT_BASE_SIZE;
        self.witness_size += witness_size;
        self.has_witness = true;
        self
    }

    pub fn add_p2tr_output(&mut self) -> &mut Self {
        self.add_output(P2TR_OUTPUT_SIZE)
    }

    pub fn add_p2wsh_output(&mut self) -> &mut Self {
        self.add_output(P2WSH_OUTPUT_SIZE)
    }

    pub fn add_p2wpkh_output(&mut self) -> &mut Self {
        self.add_output(P2WPKH_OUTPUT_SIZE)
    }

    pub fn add_p2pkh_output(&mut self) -> &mut Self {
        self.add_output(P2PKH_OUTPUT_SIZE)
    }

    pub fn add_p2sh_output(&mut self) -> &mut Self {
        self.add_output(P2SH_OUTPUT_SIZE)
    }

    fn add_output(&mut self, size: u64) -> &mut Self {
        self.output_count += 1;
        self.output_size += size;
        self
    }

    /// The weight of the transaction accumulated so far.
    pub fn weight(&self) -> Weight {
        let base = BASE_TX_SIZE
            + var_int_size(self.input_count)
            + self.input_size
            + var_int_size(self.output_count)
            + self.output_size;

        let mut wu = base * 4;
        if self.has_witness {
            wu += WITNESS_HEADER_WEIGHT + self.witness_size;
        }

        Weight::from_wu(wu)
    }
}

/// Accounts for one output paying to `dest`, or to a wallet taproot
/// address when `dest` is `None`.
pub fn add_output_estimate(
    estimator: &mut TxWeightEstimator,
    dest: Option<&Address>,
) -> Result<(), WeightError> {
    let Some(addr) = dest else {
        estimator.add_p2tr_output();
        return Ok(());
    };

    match addr.address_type() {
        Some(AddressType::P2tr) => estimator.add_p2tr_output(),
        Some(AddressType::P2wsh) => estimator.add_p2wsh_output(),
        Some(AddressType::P2wpkh) => estimator.add_p2wpkh_output(),
        Some(AddressType::P2pkh) => estimator.add_p2pkh_output(),
        Some(AddressType::P2sh) => estimator.add_p2sh_output(),
        _ => return Err(WeightError::UnsupportedAddress),
    };

    Ok(())
}

fn var_int_size(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
