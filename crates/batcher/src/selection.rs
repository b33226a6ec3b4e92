//! Greedy batch selection.
//!
//! Pure cost comparison: adding a sweep to a batch costs the fee
//! increase of that batch's transaction, opening a new batch costs the
//! full fee of a one-sweep transaction. The cheapest option wins.

use std::collections::BTreeMap;

use bitcoin::{Amount, FeeRate, Weight};
use sweepbatcher_primitives::{
    fee::{fee_for_weight, ABSOLUTE_FEE_PER_KW_FLOOR},
    weight::{add_output_estimate, TxWeightEstimator},
};

use crate::{errors::BatcherError, sweep::Sweep};
use sweepbatcher_primitives::types::SwapHash;

/// Returned by [`select_batch`] when the cheapest option is opening a
/// new batch.
pub(crate) const NEW_BATCH_ID: i32 = -1;

/// Weight and fee-rate profile of a batch, or the weight deltas of a
/// candidate sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeeDetails {
    pub batch_id: i32,
    pub fee_rate: FeeRate,
    pub coop_weight: Weight,
    pub non_coop_weight: Weight,
    pub non_coop_hint: bool,
    pub is_external_addr: bool,
}

impl FeeDetails {
    /// Fee of the on-chain transaction this profile describes.
    fn fee(&self) -> Amount {
        let weight = if self.non_coop_hint {
            self.non_coop_weight
        } else {
            self.coop_weight
        };

        fee_for_weight(self.fee_rate, weight)
    }

    /// The profile of this batch with `other` added to it.
    fn combine(self, other: FeeDetails) -> FeeDetails {
        FeeDetails {
            batch_id: self.batch_id,
            fee_rate: self.fee_rate.max(other.fee_rate),
            coop_weight: self.coop_weight + other.coop_weight,
            non_coop_weight: self.non_coop_weight + other.non_coop_weight,
            non_coop_hint: self.non_coop_hint || other.non_coop_hint,
            is_external_addr: self.is_external_addr || other.is_external_addr,
        }
    }
}

/// Estimates the fee profile of a batch with the given sweeps at the
/// given fee rate.
pub(crate) fn estimate_batch_weight(
    batch_id: i32,
    fee_rate: FeeRate,
    sweeps: &BTreeMap<SwapHash, Sweep>,
) -> Result<FeeDetails, BatcherError> {
    if sweeps.is_empty() {
        return Err(BatcherError::EmptyBatch(batch_id));
    }

    if fee_rate < ABSOLUTE_FEE_PER_KW_FLOOR {
        return Err(BatcherError::FeeRateTooLow(fee_rate.to_sat_per_kwu()));
    }

    let has_non_coop = sweeps.values().any(|s| s.non_coop_hint);

    // Any sweep determines the destination; it only matters when the
    // batch holds a single externally addressed sweep.
    let the_sweep = sweeps.values().next().expect("batch is not empty");
    let dest_addr = if the_sweep.is_external_addr {
        Some(
            the_sweep
                .dest_addr
                .as_ref()
                .ok_or(BatcherError::MissingDestAddr(the_sweep.swap_hash))?,
        )
    } else {
        None
    };

    let mut coop_weight = TxWeightEstimator::default();
    let mut non_coop_weight = TxWeightEstimator::default();

    add_output_estimate(&mut coop_weight, dest_addr)?;
    add_output_estimate(&mut non_coop_weight, dest_addr)?;

    for sweep in sweeps.values() {
        coop_weight.add_taproot_key_spend_input();
        sweep.htlc.add_success_to_estimator(&mut non_coop_weight);
    }

    Ok(FeeDetails {
        batch_id,
        fee_rate,
        coop_weight: coop_weight.weight(),
        non_coop_weight: non_coop_weight.weight(),
        non_coop_hint: has_non_coop,
        is_external_addr: the_sweep.is_external_addr,
    })
}

/// Estimates the weight increments of adding `sweep` to any batch, and
/// the profile of a new batch holding only `sweep`.
pub(crate) fn estimate_sweep_fee_increment(
    sweep: &Sweep,
) -> Result<(FeeDetails, FeeDetails), BatcherError> {
    let mut sweeps = BTreeMap::new();
    sweeps.insert(sweep.swap_hash, sweep.clone());

    let new_batch = estimate_batch_weight(0, sweep.min_fee_rate, &sweeps)?;

    // Add the same sweep again under a distinct key to measure the
    // per-sweep weight increments.
    let mut second_hash = sweep.swap_hash;
    second_hash.0[0] = second_hash.0[0].wrapping_add(1);
    sweeps.insert(second_hash, sweep.clone());

    let two_sweeps = estimate_batch_weight(0, sweep.min_fee_rate, &sweeps)?;

    let sweep_details = FeeDetails {
        batch_id: 0,
        fee_rate: sweep.min_fee_rate,
        coop_weight: two_sweeps.coop_weight - new_batch.coop_weight,
        non_coop_weight: two_sweeps.non_coop_weight - new_batch.non_coop_weight,
        non_coop_hint: sweep.non_coop_hint,
        is_external_addr: sweep.is_external_addr,
    };

    Ok((sweep_details, new_batch))
}

/// Picks the batch whose marginal cost of taking the sweep is lowest,
/// or [`NEW_BATCH_ID`] when a fresh one-sweep batch is cheaper.
///
/// Externally addressed entities never combine: such sweeps go to their
/// own batch and such batches take no further sweeps.
pub(crate) fn select_batch(
    batches: &[FeeDetails],
    sweep: FeeDetails,
    one_sweep_batch: FeeDetails,
) -> Result<i32, BatcherError> {
    let mut best_batch_id = NEW_BATCH_ID;
    let mut best_cost = one_sweep_batch.fee();

    for batch in batches {
        if batch.is_external_addr || sweep.is_external_addr {
            continue;
        }

        let combined = batch.combine(sweep);
        let cost = combined.fee().to_sat() as i64 - batch.fee().to_sat() as i64;

        // Adding an input must cost something; anything else means the
        // weight math is broken.
        if cost <= 0 {
            return Err(BatcherError::NonPositiveCost {
                batch_id: batch.batch_id,
                cost,
            });
        }

        if (cost as u64) < best_cost.to_sat() {
            best_batch_id = batch.batch_id;
            best_cost = Amount::from_sat(cost as u64);
        }
    }

    Ok(best_batch_id)
}

#[cfg(test)]
mod tests {
    use sweepbatcher_primitives::htlc::HtlcVersion;

    use super::*;
    use crate::test_utils::{test_p2pkh_addr, test_p2tr_addr, test_sweep};

    const LOW_FEE_RATE: FeeRate = ABSOLUTE_FEE_PER_KW_FLOOR;
    const HIGH_FEE_RATE: FeeRate = FeeRate::from_sat_per_kwu(30_000);

    const COOP_INPUT_WEIGHT: Weight = Weight::from_wu(230);
    const NON_COOP_INPUT_WEIGHT: Weight = Weight::from_wu(521);
    const COOP_NEW_BATCH_WEIGHT: Weight = Weight::from_wu(396);
    // New batch weight plus the non-coop penalty of its one input.
    const NON_COOP_NEW_BATCH_WEIGHT: Weight = Weight::from_wu(396 + (521 - 230));

    fn details(
        batch_id: i32,
        fee_rate: FeeRate,
        coop_weight: Weight,
        non_coop_weight: Weight,
    ) -> FeeDetails {
        FeeDetails {
            batch_id,
            fee_rate,
            coop_weight,
            non_coop_weight,
            non_coop_hint: false,
            is_external_addr: false,
        }
    }

    fn sweep_details(fee_rate: FeeRate) -> FeeDetails {
        details(0, fee_rate, COOP_INPUT_WEIGHT, NON_COOP_INPUT_WEIGHT)
    }

    fn one_sweep_batch(fee_rate: FeeRate) -> FeeDetails {
        details(
            0,
            fee_rate,
            COOP_NEW_BATCH_WEIGHT,
            NON_COOP_NEW_BATCH_WEIGHT,
        )
    }

    fn batch(batch_id: i32, fee_rate: FeeRate) -> FeeDetails {
        details(
            batch_id,
            fee_rate,
            COOP_NEW_BATCH_WEIGHT,
            NON_COOP_NEW_BATCH_WEIGHT,
        )
    }

    #[test]
    fn sweep_fee_increment_regular() {
        let mut sweep = test_sweep(1, HtlcVersion::V3);
        sweep.min_fee_rate = LOW_FEE_RATE;

        let (sweep_fd, new_batch_fd) = estimate_sweep_fee_increment(&sweep).unwrap();

        assert_eq!(sweep_fd.coop_weight, COOP_INPUT_WEIGHT);
        assert_eq!(sweep_fd.non_coop_weight, NON_COOP_INPUT_WEIGHT);
        assert!(!sweep_fd.non_coop_hint);

        assert_eq!(new_batch_fd.coop_weight, Weight::from_wu(444));
        assert_eq!(new_batch_fd.non_coop_weight, Weight::from_wu(735));
    }

    #[test]
    fn sweep_fee_increment_external_taproot() {
        let mut sweep = test_sweep(1, HtlcVersion::V3);
        sweep.min_fee_rate = LOW_FEE_RATE;
        sweep.is_external_addr = true;
        sweep.dest_addr = Some(test_p2tr_addr());

        let (sweep_fd, new_batch_fd) = estimate_sweep_fee_increment(&sweep).unwrap();

        assert!(sweep_fd.is_external_addr);
        assert_eq!(new_batch_fd.coop_weight, Weight::from_wu(444));
        assert_eq!(new_batch_fd.non_coop_weight, Weight::from_wu(735));
    }

    #[test]
    fn sweep_fee_increment_external_p2pkh() {
        let mut sweep = test_sweep(1, HtlcVersion::V3);
        sweep.min_fee_rate = LOW_FEE_RATE;
        sweep.is_external_addr = true;
        sweep.dest_addr = Some(test_p2pkh_addr());

        let (_, new_batch_fd) = estimate_sweep_fee_increment(&sweep).unwrap();

        assert_eq!(new_batch_fd.coop_weight, Weight::from_wu(408));
        assert_eq!(new_batch_fd.non_coop_weight, Weight::from_wu(699));
    }

    #[test]
    fn sweep_fee_increment_non_coop() {
        let mut sweep = test_sweep(1, HtlcVersion::V3);
        sweep.min_fee_rate = LOW_FEE_RATE;
        sweep.non_coop_hint = true;

        let (sweep_fd, new_batch_fd) = estimate_sweep_fee_increment(&sweep).unwrap();

        assert!(sweep_fd.non_coop_hint);
        assert!(new_batch_fd.non_coop_hint);
    }

    #[test]
    fn sweep_fee_increment_rejects_rate_below_floor() {
        let mut sweep = test_sweep(1, HtlcVersion::V3);
        sweep.min_fee_rate = FeeRate::ZERO;

        assert!(matches!(
            estimate_sweep_fee_increment(&sweep),
            Err(BatcherError::FeeRateTooLow(0)),
        ));
    }

    #[test]
    fn batch_weight_one_and_two_sweeps() {
        let mut sweeps = BTreeMap::new();
        let s1 = test_sweep(1, HtlcVersion::V3);
        sweeps.insert(s1.swap_hash, s1);

        let fd = estimate_batch_weight(1, LOW_FEE_RATE, &sweeps).unwrap();
        assert_eq!(fd.batch_id, 1);
        assert_eq!(fd.coop_weight, Weight::from_wu(444));
        assert_eq!(fd.non_coop_weight, Weight::from_wu(735));

        let s2 = test_sweep(2, HtlcVersion::V3);
        sweeps.insert(s2.swap_hash, s2);

        let fd = estimate_batch_weight(1, LOW_FEE_RATE, &sweeps).unwrap();
        assert_eq!(fd.coop_weight, Weight::from_wu(674));
        assert_eq!(fd.non_coop_weight, Weight::from_wu(1256));
    }

    #[test]
    fn batch_weight_mixed_htlc_versions() {
        let mut sweeps = BTreeMap::new();
        let s1 = test_sweep(1, HtlcVersion::V2);
        let s2 = test_sweep(2, HtlcVersion::V3);
        sweeps.insert(s1.swap_hash, s1);
        sweeps.insert(s2.swap_hash, s2);

        let fd = estimate_batch_weight(1, LOW_FEE_RATE, &sweeps).unwrap();
        assert_eq!(fd.coop_weight, Weight::from_wu(674));
        assert_eq!(fd.non_coop_weight, Weight::from_wu(1103));
    }

    #[test]
    fn batch_weight_non_coop_member_sets_hint() {
        let mut sweeps = BTreeMap::new();
        let s1 = test_sweep(1, HtlcVersion::V3);
        let mut s2 = test_sweep(2, HtlcVersion::V3);
        s2.non_coop_hint = true;
        sweeps.insert(s1.swap_hash, s1);
        sweeps.insert(s2.swap_hash, s2);

        let fd = estimate_batch_weight(1, LOW_FEE_RATE, &sweeps).unwrap();
        assert!(fd.non_coop_hint);
    }

    #[test]
    fn batch_weight_empty_batch_is_an_error() {
        assert!(matches!(
            estimate_batch_weight(7, LOW_FEE_RATE, &BTreeMap::new()),
            Err(BatcherError::EmptyBatch(7)),
        ));
    }

    #[test]
    fn select_no_existing_batches() {
        let got = select_batch(
            &[],
            sweep_details(LOW_FEE_RATE),
            one_sweep_batch(LOW_FEE_RATE),
        )
        .unwrap();
        assert_eq!(got, NEW_BATCH_ID);
    }

    #[test]
    fn select_low_fee_sweep_low_fee_batch() {
        let got = select_batch(
            &[batch(1, LOW_FEE_RATE)],
            sweep_details(LOW_FEE_RATE),
            one_sweep_batch(LOW_FEE_RATE),
        )
        .unwrap();
        assert_eq!(got, 1);
    }

    #[test]
    fn select_low_fee_sweep_high_fee_batch() {
        let got = select_batch(
            &[batch(1, HIGH_FEE_RATE)],
            sweep_details(LOW_FEE_RATE),
            one_sweep_batch(LOW_FEE_RATE),
        )
        .unwrap();
        assert_eq!(got, NEW_BATCH_ID);
    }

    #[test]
    fn select_low_fee_sweep_mixed_batches() {
        let got = select_batch(
            &[batch(1, LOW_FEE_RATE), batch(2, HIGH_FEE_RATE)],
            sweep_details(LOW_FEE_RATE),
            one_sweep_batch(LOW_FEE_RATE),
        )
        .unwrap();
        assert_eq!(got, 1);
    }

    #[test]
    fn select_high_fee_sweep_mixed_batches() {
        let got = select_batch(
            &[batch(1, LOW_FEE_RATE), batch(2, HIGH_FEE_RATE)],
            sweep_details(HIGH_FEE_RATE),
            one_sweep_batch(HIGH_FEE_RATE),
        )
        .unwrap();
        assert_eq!(got, 2);
    }

    #[test]
    fn select_high_fee_non_coop_sweep() {
        let mut sweep = sweep_details(HIGH_FEE_RATE);
        sweep.non_coop_hint = true;
        let mut new_batch = one_sweep_batch(HIGH_FEE_RATE);
        new_batch.non_coop_hint = true;

        let got = select_batch(
            &[batch(1, LOW_FEE_RATE), batch(2, HIGH_FEE_RATE)],
            sweep,
            new_batch,
        )
        .unwrap();
        assert_eq!(got, NEW_BATCH_ID);
    }

    #[test]
    fn select_high_fee_non_coop_sweep_with_non_coop_batch() {
        let mut sweep = sweep_details(HIGH_FEE_RATE);
        sweep.non_coop_hint = true;
        let mut new_batch = one_sweep_batch(HIGH_FEE_RATE);
        new_batch.non_coop_hint = true;
        let mut high_batch = batch(2, HIGH_FEE_RATE);
        high_batch.non_coop_hint = true;

        let got = select_batch(&[batch(1, LOW_FEE_RATE), high_batch], sweep, new_batch).unwrap();
        assert_eq!(got, 2);
    }

    #[test]
    fn select_low_fee_non_coop_sweep() {
        let mut sweep = sweep_details(LOW_FEE_RATE);
        sweep.non_coop_hint = true;
        let mut new_batch = one_sweep_batch(LOW_FEE_RATE);
        new_batch.non_coop_hint = true;

        let got = select_batch(
            &[batch(1, LOW_FEE_RATE), batch(2, HIGH_FEE_RATE)],
            sweep,
            new_batch,
        )
        .unwrap();
        assert_eq!(got, NEW_BATCH_ID);
    }

    #[test]
    fn select_low_fee_non_coop_sweep_with_non_coop_batch() {
        let mut sweep = sweep_details(LOW_FEE_RATE);
        sweep.non_coop_hint = true;
        let mut new_batch = one_sweep_batch(LOW_FEE_RATE);
        new_batch.non_coop_hint = true;
        let mut low_batch = batch(1, LOW_FEE_RATE);
        low_batch.non_coop_hint = true;

        let got = select_batch(&[low_batch, batch(2, HIGH_FEE_RATE)], sweep, new_batch).unwrap();
        assert_eq!(got, 1);
    }

    #[test]
    fn select_external_address_sweep() {
        let mut sweep = sweep_details(HIGH_FEE_RATE);
        sweep.is_external_addr = true;
        let mut new_batch = one_sweep_batch(HIGH_FEE_RATE);
        new_batch.is_external_addr = true;

        let got = select_batch(
            &[batch(1, HIGH_FEE_RATE), batch(2, HIGH_FEE_RATE)],
            sweep,
            new_batch,
        )
        .unwrap();
        assert_eq!(got, NEW_BATCH_ID);
    }

    #[test]
    fn select_skips_external_address_batch() {
        let mut external_batch = batch(2, HIGH_FEE_RATE);
        external_batch.is_external_addr = true;

        let slightly_lower = FeeRate::from_sat_per_kwu(HIGH_FEE_RATE.to_sat_per_kwu() - 1);

        let got = select_batch(
            &[batch(1, slightly_lower), external_batch],
            sweep_details(HIGH_FEE_RATE),
            one_sweep_batch(HIGH_FEE_RATE),
        )
        .unwrap();
        assert_eq!(got, 1);
    }
}
