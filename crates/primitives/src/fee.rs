//! Fee-rate policy: floor fee computation, the RBF minimum replacement
//! increment and per-sweep fee attribution for confirmed batches.

use bitcoin::{Amount, FeeRate, OutPoint, Transaction, Weight};

/// Lowest fee rate any batch may ever use, the standard relay floor
/// expressed in sat/kw.
pub const ABSOLUTE_FEE_PER_KW_FLOOR: FeeRate = FeeRate::from_sat_per_kwu(253);

/// One sat/vbyte in sat/kw, the absolute leg of the RBF increment rule.
const ONE_SAT_PER_VBYTE: u64 = 250;

/// The fee paid by a transaction of `weight` at `rate`, rounded down.
pub fn fee_for_weight(rate: FeeRate, weight: Weight) -> Amount {
    Amount::from_sat(rate.to_sat_per_kwu().saturating_mul(weight.to_wu()) / 1000)
}

/// The smallest fee rate accepted as a replacement for a transaction
/// published at `rate`: a quarter more, or one sat/vbyte more, whichever
/// is larger.
pub fn min_replacement_rate(rate: FeeRate) -> FeeRate {
    let relative = rate.to_sat_per_kwu().saturating_mul(5) / 4;
    let absolute = rate.to_sat_per_kwu().saturating_add(ONE_SAT_PER_VBYTE);
    FeeRate::from_sat_per_kwu(relative.max(absolute))
}

/// Clamps `rate` up to the absolute floor.
pub fn clamp_to_floor(rate: FeeRate) -> FeeRate {
    rate.max(ABSOLUTE_FEE_PER_KW_FLOOR)
}

/// Splits the on-chain fee of `spend_tx` evenly across `num_sweeps`
/// sweeps whose total input value is `total_swept`. Returns the even
/// portion and the rounding remainder, which the first input pays.
pub fn fee_portion_per_sweep(
    total_swept: Amount,
    num_sweeps: u64,
    spend_tx: &Transaction,
) -> (Amount, Amount) {
    let total_out: u64 = spend_tx.output.iter().map(|o| o.value.to_sat()).sum();
    let total_fee = total_swept.to_sat().saturating_sub(total_out);

    let per_sweep = total_fee / num_sweeps;
    let remainder = total_fee - per_sweep * num_sweeps;

    (Amount::from_sat(per_sweep), Amount::from_sat(remainder))
}

/// The fee portion paid by the sweep spending `outpoint`. The remainder
/// lands on the first input, which is the lowest swap hash because batch
/// inputs are swap-hash ordered.
pub fn fee_portion_paid_by_sweep(
    spend_tx: &Transaction,
    per_sweep: Amount,
    remainder: Amount,
    outpoint: &OutPoint,
) -> Amount {
    let pays_remainder = spend_tx
        .input
        .first()
        .is_some_and(|txin| txin.previous_output == *outpoint);

    if pays_remainder {
        per_sweep + remainder
    } else {
        per_sweep
    }
}
