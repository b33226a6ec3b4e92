//! The per-batch actor.
//!
//! Each batch runs in its own task, owns its sweeps exclusively and
//! serializes every mutation. The rest of the system talks to it through
//! a [`BatchHandle`] carrying typed request messages; block epochs, spend
//! and confirmation notifications arrive on channels the actor
//! subscribes to itself.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bitcoin::{
    absolute::LockTime, hashes::Hash, sighash::Prevouts, sighash::SighashCache,
    transaction::Version, Amount, FeeRate, OutPoint, Psbt, ScriptBuf, Sequence, TapSighashType,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use secp256k1::{schnorr, XOnlyPublicKey};
use sweepbatcher_db::{BatcherStore, DbBatch, DbSweep};
use sweepbatcher_primitives::{
    fee::{clamp_to_floor, fee_for_weight, fee_portion_paid_by_sweep, fee_portion_per_sweep,
        min_replacement_rate},
    htlc::{Htlc, HtlcVersion},
    types::{BatchState, SwapHash},
    weight::{add_output_estimate, TxWeightEstimator},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    client::{
        ChainNotifier, ClientError, ConfEvent, MuSig2SignSweep, SignDescriptor, SignMethod,
        SignMuSig2, SignerClient, SpendEvent, VerifySchnorrSig, WalletKit,
    },
    errors::BatcherError,
    selection::{estimate_batch_weight, FeeDetails},
    sweep::{SpendDetail, Sweep, SweepRequest},
};

/// Blocks left to the nearest member timeout below which the batch is
/// considered urgent.
const URGENCY_WINDOW: u32 = 24;

/// Publication attempts per trigger while replacements keep being
/// rejected for insufficient fee.
const MAX_PUBLISH_ATTEMPTS: usize = 3;

/// Deadline for the swap server's cooperative signing call.
const COOP_SIGN_DEADLINE: Duration = Duration::from_secs(30);

/// Static configuration of one batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchConfig {
    pub max_timeout_distance: u32,
    pub batch_publish_delay: Duration,
    pub no_bumping: bool,
    pub min_confirmations: u32,
}

/// The fee-rate floor for the next publication and the height at which
/// it was last raised. Never decreases over a batch's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RbfCache {
    pub last_height: u32,
    pub fee_rate: FeeRate,
}

/// Collaborator handles a batch needs to do its work.
#[derive(Clone)]
pub(crate) struct BatchKit {
    pub wallet: Arc<dyn WalletKit>,
    pub chain: Arc<dyn ChainNotifier>,
    pub signer: Arc<dyn SignerClient>,
    pub musig2_sign_sweep: Option<Arc<dyn MuSig2SignSweep>>,
    pub sign_musig2: Option<Arc<dyn SignMuSig2>>,
    pub verify_schnorr_sig: Arc<dyn VerifySchnorrSig>,
    pub store: Arc<dyn BatcherStore>,

    /// Re-enqueues sweeps the batch can no longer serve.
    pub purger: mpsc::Sender<SweepRequest>,

    pub shutdown: watch::Receiver<bool>,
}

/// Request messages accepted by a batch actor.
pub(crate) enum BatchRequest {
    /// Offers a sweep to the batch. Resolves to whether it was taken.
    AddSweep {
        sweep: Box<Sweep>,
        resp: oneshot::Sender<Result<bool, BatcherError>>,
    },

    /// Whether the batch holds the given swap hash.
    ContainsSweep {
        swap_hash: SwapHash,
        resp: oneshot::Sender<bool>,
    },

    /// The batch's current fee profile for batch selection.
    FeeDetails {
        resp: oneshot::Sender<Result<FeeDetails, BatcherError>>,
    },
}

/// Cloneable handle to a running batch actor.
#[derive(Clone)]
pub(crate) struct BatchHandle {
    pub id: i32,
    sender: mpsc::Sender<BatchRequest>,
    complete: Arc<AtomicBool>,
}

impl BatchHandle {
    pub(crate) async fn add_sweep(&self, sweep: Sweep) -> Result<bool, BatcherError> {
        let (resp, rx) = oneshot::channel();
        self.sender
            .send(BatchRequest::AddSweep {
                sweep: Box::new(sweep),
                resp,
            })
            .await
            .map_err(|_| BatcherError::BatchShuttingDown)?;

        rx.await.map_err(|_| BatcherError::BatchShuttingDown)?
    }

    pub(crate) async fn contains_sweep(&self, swap_hash: SwapHash) -> bool {
        let (resp, rx) = oneshot::channel();
        if self
            .sender
            .send(BatchRequest::ContainsSweep { swap_hash, resp })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    pub(crate) async fn fee_details(&self) -> Result<FeeDetails, BatcherError> {
        let (resp, rx) = oneshot::channel();
        self.sender
            .send(BatchRequest::FeeDetails { resp })
            .await
            .map_err(|_| BatcherError::BatchShuttingDown)?;

        rx.await.map_err(|_| BatcherError::BatchShuttingDown)?
    }

    /// Whether the actor has terminated. Eventually consistent; the
    /// store is authoritative.
    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

/// State owned by a batch actor.
pub(crate) struct Batch {
    id: i32,
    state: BatchState,

    /// The first sweep added; anchors the timeout-distance check.
    primary_sweep_hash: Option<SwapHash>,

    /// Members keyed by swap hash; iteration order is the input order of
    /// the batch transaction.
    sweeps: BTreeMap<SwapHash, Sweep>,

    rbf_cache: RbfCache,
    batch_txid: Option<Txid>,
    batch_pk_script: ScriptBuf,
    current_height: u32,
    spending_tx: Option<Transaction>,

    cfg: BatchConfig,
    kit: BatchKit,

    sender: mpsc::Sender<BatchRequest>,
    complete: Arc<AtomicBool>,
}

impl Batch {
    /// Creates a fresh batch. The id is assigned by
    /// [`Batch::insert_and_acquire_id`] before the actor is spawned.
    pub(crate) fn new(cfg: BatchConfig, kit: BatchKit) -> (Batch, mpsc::Receiver<BatchRequest>) {
        let (sender, receiver) = mpsc::channel(16);

        let batch = Batch {
            id: 0,
            state: BatchState::Open,
            primary_sweep_hash: None,
            sweeps: BTreeMap::new(),
            rbf_cache: RbfCache {
                last_height: 0,
                fee_rate: FeeRate::ZERO,
            },
            batch_txid: None,
            batch_pk_script: ScriptBuf::new(),
            current_height: 0,
            spending_tx: None,
            cfg,
            kit,
            sender,
            complete: Arc::new(AtomicBool::new(false)),
        };

        (batch, receiver)
    }

    /// Rebuilds a batch from its persisted row and member sweeps.
    /// `fee_rate` is the persisted rate raised to the members' minimum
    /// rates; `primary` is the first persisted sweep.
    pub(crate) fn from_db(
        cfg: BatchConfig,
        kit: BatchKit,
        row: &DbBatch,
        sweeps: BTreeMap<SwapHash, Sweep>,
        primary: SwapHash,
        fee_rate: FeeRate,
    ) -> Result<(Batch, mpsc::Receiver<BatchRequest>), BatcherError> {
        if sweeps.is_empty() {
            return Err(BatcherError::EmptyBatch(row.id));
        }

        let (sender, receiver) = mpsc::channel(16);

        let batch = Batch {
            id: row.id,
            state: row.state,
            primary_sweep_hash: Some(primary),
            sweeps,
            rbf_cache: RbfCache {
                last_height: row.last_rbf_height,
                fee_rate,
            },
            batch_txid: row.batch_txid,
            batch_pk_script: row.batch_pk_script.clone(),
            current_height: 0,
            spending_tx: None,
            cfg,
            kit,
            sender,
            complete: Arc::new(AtomicBool::new(false)),
        };

        Ok((batch, receiver))
    }

    /// Allocates the persistent row of this batch and captures the
    /// assigned id.
    pub(crate) async fn insert_and_acquire_id(&mut self) -> Result<i32, BatcherError> {
        let id = self.kit.store.insert_sweep_batch(&self.to_db_row()).await?;
        self.id = id;

        debug!(batch_id = %id, "acquired batch id");
        Ok(id)
    }

    pub(crate) fn handle(&self) -> BatchHandle {
        BatchHandle {
            id: self.id,
            sender: self.sender.clone(),
            complete: self.complete.clone(),
        }
    }

    /// The actor loop. Terminates on confirmation, on shutdown or on a
    /// fatal error.
    pub(crate) async fn run(
        mut self,
        requests: mpsc::Receiver<BatchRequest>,
    ) -> Result<(), BatcherError> {
        let result = self.run_inner(requests).await;
        self.complete.store(true, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(batch_id = %self.id, state = %self.state, "batch actor terminated"),
            Err(e) => error!(batch_id = %self.id, error = %e, "batch actor failed"),
        }

        result
    }

    async fn run_inner(
        &mut self,
        mut requests: mpsc::Receiver<BatchRequest>,
    ) -> Result<(), BatcherError> {
        let mut shutdown = self.kit.shutdown.clone();
        let mut blocks = self.kit.chain.register_block_epoch_ntfn().await?;

        let mut spend_rx: Option<mpsc::Receiver<SpendEvent>> = None;
        let mut spend_err_rx: Option<mpsc::Receiver<ClientError>> = None;
        let mut conf_rx: Option<mpsc::Receiver<ConfEvent>> = None;
        let mut conf_err_rx: Option<mpsc::Receiver<ClientError>> = None;
        let mut publish_at: Option<Instant> = None;

        info!(batch_id = %self.id, state = %self.state, "batch actor started");

        // A recovered batch that already published watches for the spend
        // right away.
        if self.batch_txid.is_some() {
            let (rx, err_rx) = self.register_spend_watch().await?;
            spend_rx = Some(rx);
            spend_err_rx = Some(err_rx);
        }

        loop {
            // A far-future deadline keeps the timer arm well-typed while
            // no publish is pending; the guard keeps it from firing.
            let publish_deadline = publish_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                req = requests.recv() => match req {
                    Some(BatchRequest::AddSweep { sweep, resp }) => {
                        match self.handle_add_sweep(*sweep).await {
                            Err(BatcherError::Store(e)) => {
                                let _ = resp.send(Err(BatcherError::BatchShuttingDown));
                                return Err(BatcherError::Store(e));
                            }
                            result => {
                                let _ = resp.send(result);
                            }
                        }
                    }
                    Some(BatchRequest::ContainsSweep { swap_hash, resp }) => {
                        let _ = resp.send(self.sweeps.contains_key(&swap_hash));
                    }
                    Some(BatchRequest::FeeDetails { resp }) => {
                        let _ = resp.send(self.fee_details());
                    }
                    None => {
                        // The batcher is gone; nothing left to serve.
                        self.purge_sweeps();
                        return Ok(());
                    }
                },

                Some(height) = blocks.recv() => {
                    debug!(batch_id = %self.id, height, "new block tip");
                    self.current_height = height;

                    let publishable = self.spending_tx.is_none()
                        && self.state != BatchState::Confirmed
                        && !self.sweeps.is_empty();
                    if publishable {
                        self.update_fee_rate().await?;
                        publish_at = Some(Instant::now() + self.cfg.batch_publish_delay);
                    }
                }

                _ = tokio::time::sleep_until(publish_deadline), if publish_at.is_some() => {
                    publish_at = None;

                    let monitoring = spend_rx.is_some();
                    if let Some((rx, err_rx)) = self.publish(monitoring).await? {
                        spend_rx = Some(rx);
                        spend_err_rx = Some(err_rx);
                    }
                }

                Some(spend) = recv_opt(&mut spend_rx) => {
                    publish_at = None;

                    let (rx, err_rx) = self.handle_spend(spend).await?;
                    conf_rx = Some(rx);
                    conf_err_rx = Some(err_rx);
                }

                Some(err) = recv_opt(&mut spend_err_rx) => {
                    return Err(BatcherError::Client(err));
                }

                Some(conf) = recv_opt(&mut conf_rx) => {
                    self.handle_conf(conf).await?;
                    return Ok(());
                }

                Some(err) = recv_opt(&mut conf_err_rx) => {
                    return Err(BatcherError::Client(err));
                }

                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!(batch_id = %self.id, "batch actor shutting down");
                        self.purge_sweeps();
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Accepts, updates or rejects an offered sweep. See the batch
    /// contract: `Ok(false)` means open-but-incompatible, the caller
    /// tries elsewhere.
    async fn handle_add_sweep(&mut self, sweep: Sweep) -> Result<bool, BatcherError> {
        if self.state != BatchState::Open {
            return Err(BatcherError::BatchShuttingDown);
        }

        let is_update = self.sweeps.contains_key(&sweep.swap_hash);
        if !is_update {
            if let Some(primary) = self.primary_sweep() {
                if sweep.is_external_addr || self.sweeps.values().any(|s| s.is_external_addr) {
                    debug!(
                        batch_id = %self.id,
                        swap_hash = %sweep.swap_hash.short(),
                        "rejecting sweep: external addresses are not co-batched",
                    );
                    return Ok(false);
                }

                if sweep.protocol_version != primary.protocol_version {
                    debug!(
                        batch_id = %self.id,
                        swap_hash = %sweep.swap_hash.short(),
                        "rejecting sweep: protocol version mismatch",
                    );
                    return Ok(false);
                }

                if sweep.timeout.abs_diff(primary.timeout) > self.cfg.max_timeout_distance {
                    debug!(
                        batch_id = %self.id,
                        swap_hash = %sweep.swap_hash.short(),
                        sweep_timeout = sweep.timeout,
                        primary_timeout = primary.timeout,
                        "rejecting sweep: timeout distance exceeded",
                    );
                    return Ok(false);
                }
            }
        }

        // Durable before observable: the row is written before the
        // in-memory set changes.
        self.kit
            .store
            .upsert_sweep(&DbSweep {
                swap_hash: sweep.swap_hash,
                batch_id: self.id,
                outpoint: sweep.outpoint,
                amount: sweep.value,
                completed: false,
            })
            .await?;

        if self.primary_sweep_hash.is_none() {
            self.primary_sweep_hash = Some(sweep.swap_hash);
        }

        info!(
            batch_id = %self.id,
            swap_hash = %sweep.swap_hash.short(),
            update = is_update,
            "sweep added to batch",
        );

        let min_fee_rate = sweep.min_fee_rate;
        self.sweeps.insert(sweep.swap_hash, sweep);

        if min_fee_rate > self.rbf_cache.fee_rate {
            self.rbf_cache.fee_rate = min_fee_rate;
            self.persist().await?;
        }

        Ok(true)
    }

    fn fee_details(&self) -> Result<FeeDetails, BatcherError> {
        let mut rate = self.rbf_cache.fee_rate;
        if rate == FeeRate::ZERO {
            rate = self.member_min_fee_rate();
        }

        estimate_batch_weight(self.id, rate, &self.sweeps)
    }

    /// Retargets the fee rate on a new block tip. The cached rate only
    /// ever moves up: it is seeded from the wallet estimate and the
    /// members' minimum rates, and from then on every new block bumps it
    /// by at least the RBF minimum increment, unless bumping is
    /// disabled.
    async fn update_fee_rate(&mut self) -> Result<(), BatcherError> {
        let old = self.rbf_cache;
        let member_min = self.member_min_fee_rate();

        if self.rbf_cache.fee_rate == FeeRate::ZERO {
            let mut target = member_min;
            if !self.cfg.no_bumping {
                match self
                    .kit
                    .wallet
                    .estimate_fee_rate(self.min_conf_target())
                    .await
                {
                    Ok(estimated) => target = target.max(estimated),
                    Err(e) => warn!(batch_id = %self.id, error = %e, "fee estimation failed"),
                }
            }
            self.rbf_cache.fee_rate = clamp_to_floor(target);
        } else if self.current_height > self.rbf_cache.last_height {
            if self.cfg.no_bumping {
                if self.blocks_until_timeout() <= URGENCY_WINDOW {
                    warn!(
                        batch_id = %self.id,
                        blocks_left = self.blocks_until_timeout(),
                        "timeout imminent but fee bumping is disabled",
                    );
                }
                self.rbf_cache.fee_rate = self.rbf_cache.fee_rate.max(member_min);
            } else {
                let mut target = min_replacement_rate(self.rbf_cache.fee_rate);
                match self
                    .kit
                    .wallet
                    .estimate_fee_rate(self.min_conf_target())
                    .await
                {
                    Ok(estimated) => target = target.max(estimated),
                    Err(e) => warn!(batch_id = %self.id, error = %e, "fee estimation failed"),
                }
                self.rbf_cache.fee_rate = target.max(member_min);
            }
        } else {
            // Re-triggered within the same block: only member minimum
            // rates can raise the cache.
            self.rbf_cache.fee_rate = self.rbf_cache.fee_rate.max(member_min);
        }

        self.rbf_cache.last_height = self.current_height;

        if self.rbf_cache != old {
            debug!(
                batch_id = %self.id,
                fee_rate_sat_per_kw = self.rbf_cache.fee_rate.to_sat_per_kwu(),
                height = self.rbf_cache.last_height,
                "fee rate updated",
            );
            self.persist().await?;
        }

        Ok(())
    }

    /// Builds, signs and broadcasts the batch transaction. Only store
    /// failures are fatal; everything else is logged and retried on the
    /// next block.
    async fn publish(
        &mut self,
        monitoring: bool,
    ) -> Result<Option<(mpsc::Receiver<SpendEvent>, mpsc::Receiver<ClientError>)>, BatcherError>
    {
        if self.sweeps.is_empty()
            || self.spending_tx.is_some()
            || self.state == BatchState::Confirmed
        {
            return Ok(None);
        }

        if let Err(e) = self.ensure_pk_script().await {
            return match e {
                BatcherError::Store(_) => Err(e),
                other => {
                    warn!(batch_id = %self.id, error = %other, "cannot resolve batch destination");
                    Ok(None)
                }
            };
        }

        let mut published = false;
        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let fee_rate = self.rbf_cache.fee_rate;
            let coop = self.sweeps.values().all(|s| !s.non_coop_hint);

            let tx = if coop {
                self.create_coop_tx(fee_rate).await?
            } else {
                None
            };

            // Either the batch is non-cooperative to begin with, or
            // cooperative signing just failed and set a hint.
            let tx = match tx {
                Some(tx) => tx,
                None => match self.create_non_coop_tx(fee_rate).await? {
                    Some(tx) => tx,
                    None => return Ok(None),
                },
            };

            let coop_used = self.sweeps.values().all(|s| !s.non_coop_hint);
            let label = format!("sweepbatcher batch {}", self.id);

            match self.kit.chain.publish_tx(&tx, &label).await {
                Ok(()) => {
                    let txid = tx.compute_txid();
                    info!(
                        batch_id = %self.id,
                        %txid,
                        fee_rate_sat_per_kw = fee_rate.to_sat_per_kwu(),
                        coop = coop_used,
                        sweeps = self.sweeps.len(),
                        "published batch transaction",
                    );

                    self.batch_txid = Some(txid);
                    self.batch_pk_script = tx.output[0].script_pubkey.clone();

                    // A published success-path spend commits to this
                    // input set; the batch takes no more members.
                    if !coop_used && self.state == BatchState::Open {
                        self.state = BatchState::Closed;
                    }

                    self.persist().await?;
                    published = true;
                    break;
                }

                Err(ClientError::InsufficientFee(msg)) => {
                    let bumped = min_replacement_rate(fee_rate);
                    warn!(
                        batch_id = %self.id,
                        attempt,
                        old_rate = fee_rate.to_sat_per_kwu(),
                        new_rate = bumped.to_sat_per_kwu(),
                        error = %msg,
                        "replacement fee too low, bumping",
                    );
                    self.rbf_cache.fee_rate = bumped;
                    self.persist().await?;
                }

                Err(e) => {
                    warn!(batch_id = %self.id, error = %e, "publish failed");
                    return Ok(None);
                }
            }
        }

        if published && !monitoring {
            return Ok(Some(self.register_spend_watch().await?));
        }

        Ok(None)
    }

    /// Assembles the unsigned batch transaction and its prevouts at the
    /// given fee rate, or `None` when the fee would consume the batch.
    fn build_unsigned_tx(
        &self,
        fee_rate: FeeRate,
        coop: bool,
    ) -> Result<Option<(Transaction, Vec<TxOut>)>, BatcherError> {
        let dest_addr = self
            .sweeps
            .values()
            .find(|s| s.is_external_addr)
            .and_then(|s| s.dest_addr.as_ref());

        let mut estimator = TxWeightEstimator::default();
        add_output_estimate(&mut estimator, dest_addr)?;

        for sweep in self.sweeps.values() {
            if coop {
                estimator.add_taproot_key_spend_input();
            } else {
                sweep.htlc.add_success_to_estimator(&mut estimator);
            }
        }

        let fee = fee_for_weight(fee_rate, estimator.weight());
        let total: u64 = self.sweeps.values().map(|s| s.value.to_sat()).sum();

        if fee.to_sat() >= total {
            warn!(
                batch_id = %self.id,
                fee = fee.to_sat(),
                total,
                "fee would consume the whole batch, not publishing",
            );
            return Ok(None);
        }

        let input: Vec<TxIn> = self
            .sweeps
            .values()
            .map(|sweep| TxIn {
                previous_output: sweep.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            })
            .collect();

        let prevouts: Vec<TxOut> = self
            .sweeps
            .values()
            .map(|sweep| TxOut {
                value: sweep.value,
                script_pubkey: sweep.htlc.pk_script.clone(),
            })
            .collect();

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: vec![TxOut {
                value: Amount::from_sat(total - fee.to_sat()),
                script_pubkey: self.batch_pk_script.clone(),
            }],
        };

        Ok(Some((tx, prevouts)))
    }

    /// Signs the batch through the cooperative key-spend path. Returns
    /// `None` when any sweep fails to sign; that sweep's hint is set and
    /// persisted so the caller retries through the success path.
    async fn create_coop_tx(
        &mut self,
        fee_rate: FeeRate,
    ) -> Result<Option<Transaction>, BatcherError> {
        let Some((mut tx, prevouts)) = self.build_unsigned_tx(fee_rate, true)? else {
            return Ok(None);
        };

        // The PSBT and prevout map shared with the remote signer.
        let psbt_bytes = match Psbt::from_unsigned_tx(tx.clone()) {
            Ok(mut psbt) => {
                for (i, prevout) in prevouts.iter().enumerate() {
                    psbt.inputs[i].witness_utxo = Some(prevout.clone());
                }
                psbt.serialize()
            }
            Err(e) => {
                error!(batch_id = %self.id, error = %e, "psbt construction failed");
                return Ok(None);
            }
        };

        let prevout_map: BTreeMap<OutPoint, TxOut> = self
            .sweeps
            .values()
            .map(|s| {
                (
                    s.outpoint,
                    TxOut {
                        value: s.value,
                        script_pubkey: s.htlc.pk_script.clone(),
                    },
                )
            })
            .collect();

        let hashes: Vec<SwapHash> = self.sweeps.keys().copied().collect();
        for (i, swap_hash) in hashes.iter().enumerate() {
            let sweep = self
                .sweeps
                .get(swap_hash)
                .cloned()
                .ok_or(BatcherError::EmptyBatch(self.id))?;

            let sig_hash = match SighashCache::new(&tx).taproot_key_spend_signature_hash(
                i,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            ) {
                Ok(hash) => hash.to_byte_array(),
                Err(e) => {
                    warn!(
                        batch_id = %self.id,
                        swap_hash = %swap_hash.short(),
                        error = %e,
                        "key-spend sighash failed, falling back to script path",
                    );
                    self.set_non_coop_hint(*swap_hash).await?;
                    return Ok(None);
                }
            };

            match self
                .coop_sign(&sweep, sig_hash, &psbt_bytes, &prevout_map)
                .await
            {
                Ok(sig) => {
                    let sig_bytes = sig.serialize();
                    tx.input[i].witness = Witness::from_slice(&[&sig_bytes[..]]);
                }
                Err(e) => {
                    warn!(
                        batch_id = %self.id,
                        swap_hash = %swap_hash.short(),
                        error = %e,
                        "cooperative signing failed, falling back to script path",
                    );
                    self.set_non_coop_hint(*swap_hash).await?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(tx))
    }

    /// Produces the final key-spend signature for one sweep, either via
    /// the injected custom signer or via the local MuSig2 session plus
    /// the swap server's half.
    async fn coop_sign(
        &self,
        sweep: &Sweep,
        sig_hash: [u8; 32],
        psbt_bytes: &[u8],
        prevout_map: &BTreeMap<OutPoint, TxOut>,
    ) -> Result<schnorr::Signature, ClientError> {
        let root_hash = sweep
            .htlc
            .root_hash()
            .map_err(|e| ClientError::Signer(e.to_string()))?;
        let output_key = htlc_output_key(&sweep.htlc)?;

        if let Some(custom) = &self.kit.sign_musig2 {
            let sig = custom
                .sign_musig2(sweep.protocol_version, sweep.swap_hash, root_hash, sig_hash)
                .await?;

            self.kit
                .verify_schnorr_sig
                .verify_schnorr_sig(&output_key, &sig_hash, &sig)
                .await?;

            return Ok(sig);
        }

        let server = self
            .kit
            .musig2_sign_sweep
            .as_ref()
            .ok_or_else(|| ClientError::Signer("no cooperative signer configured".to_string()))?;

        let sender_key = sweep
            .htlc_keys
            .sender_internal_key
            .ok_or_else(|| ClientError::Signer("missing sender internal key".to_string()))?;
        let receiver_key = sweep
            .htlc_keys
            .receiver_internal_key
            .ok_or_else(|| ClientError::Signer("missing receiver internal key".to_string()))?;

        let session = self
            .kit
            .signer
            .musig2_create_session(
                &sweep.htlc_keys.client_key_locator,
                [sender_key, receiver_key],
                root_hash,
            )
            .await?;

        let served = tokio::time::timeout(
            COOP_SIGN_DEADLINE,
            server.musig2_sign_sweep(
                sweep.protocol_version,
                sweep.swap_hash,
                sweep.swap_invoice_payment_addr,
                &session.our_nonce,
                psbt_bytes,
                prevout_map,
            ),
        )
        .await;

        let (remote_nonce, remote_partial) = match served {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::CoopSigner(
                    "cooperative signing timed out".to_string(),
                ))
            }
        };

        let have_all_nonces = self
            .kit
            .signer
            .musig2_register_nonces(session.session_id, &[remote_nonce])
            .await?;
        if !have_all_nonces {
            return Err(ClientError::Signer(
                "musig2 session is missing nonces".to_string(),
            ));
        }

        let _our_partial = self.kit.signer.musig2_sign(session.session_id, sig_hash).await?;

        let (complete, sig) = self
            .kit
            .signer
            .musig2_combine_sig(session.session_id, &[remote_partial])
            .await?;
        if !complete {
            return Err(ClientError::Signer(
                "combined musig2 signature incomplete".to_string(),
            ));
        }

        self.kit
            .verify_schnorr_sig
            .verify_schnorr_sig(&output_key, &sig_hash, &sig)
            .await?;

        Ok(sig)
    }

    /// Signs the batch through the HTLC success path, revealing each
    /// preimage. Returns `None` on transient signing failures.
    async fn create_non_coop_tx(
        &self,
        fee_rate: FeeRate,
    ) -> Result<Option<Transaction>, BatcherError> {
        let Some((mut tx, prevouts)) = self.build_unsigned_tx(fee_rate, false)? else {
            return Ok(None);
        };

        for (i, sweep) in self.sweeps.values().enumerate() {
            let descriptor = SignDescriptor {
                key_locator: sweep.htlc_keys.client_key_locator,
                witness_script: sweep.htlc.success_script.clone(),
                output: prevouts[i].clone(),
                input_index: i,
                sign_method: match sweep.htlc.version {
                    HtlcVersion::V2 => SignMethod::WitnessV0,
                    HtlcVersion::V3 => SignMethod::TaprootScriptSpend,
                },
            };

            let raw_sig = match self
                .kit
                .signer
                .sign_output_raw(&tx, &descriptor, &prevouts)
                .await
            {
                Ok(sig) => sig,
                Err(e) => {
                    warn!(
                        batch_id = %self.id,
                        swap_hash = %sweep.swap_hash.short(),
                        error = %e,
                        "script-path signing failed",
                    );
                    return Ok(None);
                }
            };

            match sweep.htlc.success_witness(&sweep.preimage, &raw_sig) {
                Ok(witness) => tx.input[i].witness = witness,
                Err(e) => {
                    error!(
                        batch_id = %self.id,
                        swap_hash = %sweep.swap_hash.short(),
                        error = %e,
                        "success witness assembly failed",
                    );
                    return Ok(None);
                }
            }
        }

        Ok(Some(tx))
    }

    /// Resolves the batch output script once: the external destination
    /// when the batch holds an externally addressed sweep, a fresh
    /// wallet taproot address otherwise.
    async fn ensure_pk_script(&mut self) -> Result<(), BatcherError> {
        if !self.batch_pk_script.is_empty() {
            return Ok(());
        }

        let script = if let Some(external) = self.sweeps.values().find(|s| s.is_external_addr) {
            external
                .dest_addr
                .as_ref()
                .ok_or(BatcherError::MissingDestAddr(external.swap_hash))?
                .script_pubkey()
        } else {
            self.kit.wallet.next_addr().await?.script_pubkey()
        };

        self.batch_pk_script = script;
        Ok(())
    }

    async fn register_spend_watch(
        &self,
    ) -> Result<(mpsc::Receiver<SpendEvent>, mpsc::Receiver<ClientError>), BatcherError> {
        let primary = self
            .primary_sweep()
            .ok_or(BatcherError::EmptyBatch(self.id))?;

        info!(
            batch_id = %self.id,
            outpoint = %primary.outpoint,
            "watching primary outpoint for spend",
        );

        Ok(self
            .kit
            .chain
            .register_spend_ntfn(
                &primary.outpoint,
                &primary.htlc.pk_script,
                primary.initiation_height,
            )
            .await?)
    }

    /// Attributes fees, notifies member notifiers and starts the
    /// confirmation watch.
    async fn handle_spend(
        &mut self,
        spend: SpendEvent,
    ) -> Result<(mpsc::Receiver<ConfEvent>, mpsc::Receiver<ClientError>), BatcherError> {
        let tx = spend.spending_tx;
        let txid = tx.compute_txid();

        info!(
            batch_id = %self.id,
            %txid,
            height = spend.spending_height,
            "batch spend detected",
        );

        let included: Vec<Sweep> = self
            .sweeps
            .values()
            .filter(|s| tx.input.iter().any(|i| i.previous_output == s.outpoint))
            .cloned()
            .collect();

        let total_swept =
            Amount::from_sat(included.iter().map(|s| s.value.to_sat()).sum::<u64>());
        let (per_sweep, remainder) =
            fee_portion_per_sweep(total_swept, included.len().max(1) as u64, &tx);

        let mut shutdown = self.kit.shutdown.clone();
        for sweep in &included {
            let Some(notifier) = &sweep.notifier else {
                continue;
            };

            let detail = SpendDetail {
                tx: tx.clone(),
                on_chain_fee_portion: fee_portion_paid_by_sweep(
                    &tx,
                    per_sweep,
                    remainder,
                    &sweep.outpoint,
                ),
            };

            let mut quit = notifier.quit.clone();
            tokio::select! {
                _ = notifier.spend_chan.send(detail) => {}
                _ = quit.changed() => {}
                _ = shutdown.changed() => {}
            }
        }

        self.spending_tx = Some(tx.clone());

        let conf_script = tx
            .output
            .first()
            .map(|o| o.script_pubkey.clone())
            .unwrap_or_default();

        Ok(self
            .kit
            .chain
            .register_confirmations_ntfn(
                txid,
                &conf_script,
                self.cfg.min_confirmations,
                spend.spending_height,
            )
            .await?)
    }

    /// Terminal step: re-enqueues sweeps the confirmed transaction did
    /// not include, marks the rest completed and confirms the batch.
    async fn handle_conf(&mut self, conf: ConfEvent) -> Result<(), BatcherError> {
        let tx = self.spending_tx.clone().unwrap_or_else(|| conf.tx.clone());

        info!(
            batch_id = %self.id,
            height = conf.block_height,
            "batch fully confirmed",
        );

        let (included, missing): (Vec<Sweep>, Vec<Sweep>) = self
            .sweeps
            .values()
            .cloned()
            .partition(|s| tx.input.iter().any(|i| i.previous_output == s.outpoint));

        for sweep in missing {
            warn!(
                batch_id = %self.id,
                swap_hash = %sweep.swap_hash.short(),
                "sweep missing from confirmed transaction, re-queueing",
            );

            let request = SweepRequest {
                swap_hash: sweep.swap_hash,
                outpoint: sweep.outpoint,
                value: sweep.value,
                notifier: sweep.notifier.clone(),
            };
            if let Err(e) = self.kit.purger.try_send(request) {
                warn!(
                    batch_id = %self.id,
                    swap_hash = %sweep.swap_hash.short(),
                    error = %e,
                    "failed to re-queue sweep",
                );
            }
        }

        for sweep in &included {
            self.kit
                .store
                .upsert_sweep(&DbSweep {
                    swap_hash: sweep.swap_hash,
                    batch_id: self.id,
                    outpoint: sweep.outpoint,
                    amount: sweep.value,
                    completed: true,
                })
                .await?;
        }

        self.kit.store.confirm_batch(self.id).await?;
        self.state = BatchState::Confirmed;

        Ok(())
    }

    /// Best-effort re-enqueue of all members when the actor exits
    /// without confirming.
    fn purge_sweeps(&self) {
        if self.state == BatchState::Confirmed {
            return;
        }

        for sweep in self.sweeps.values() {
            let request = SweepRequest {
                swap_hash: sweep.swap_hash,
                outpoint: sweep.outpoint,
                value: sweep.value,
                notifier: sweep.notifier.clone(),
            };
            if self.kit.purger.try_send(request).is_err() {
                debug!(
                    batch_id = %self.id,
                    swap_hash = %sweep.swap_hash.short(),
                    "could not re-queue sweep on exit",
                );
            }
        }
    }

    async fn set_non_coop_hint(&mut self, swap_hash: SwapHash) -> Result<(), BatcherError> {
        let Some(sweep) = self.sweeps.get_mut(&swap_hash) else {
            return Ok(());
        };
        sweep.non_coop_hint = true;

        let row = DbSweep {
            swap_hash,
            batch_id: self.id,
            outpoint: sweep.outpoint,
            amount: sweep.value,
            completed: false,
        };
        self.kit.store.upsert_sweep(&row).await?;

        Ok(())
    }

    async fn persist(&self) -> Result<(), BatcherError> {
        self.kit.store.update_sweep_batch(&self.to_db_row()).await?;
        Ok(())
    }

    fn to_db_row(&self) -> DbBatch {
        DbBatch {
            id: self.id,
            state: self.state,
            batch_txid: self.batch_txid,
            batch_pk_script: self.batch_pk_script.clone(),
            last_rbf_height: self.rbf_cache.last_height,
            last_rbf_sat_per_kw: self.rbf_cache.fee_rate.to_sat_per_kwu(),
            max_timeout_distance: self.cfg.max_timeout_distance,
        }
    }

    fn primary_sweep(&self) -> Option<&Sweep> {
        self.primary_sweep_hash
            .and_then(|hash| self.sweeps.get(&hash))
            .or_else(|| self.sweeps.values().next())
    }

    fn member_min_fee_rate(&self) -> FeeRate {
        self.sweeps
            .values()
            .map(|s| s.min_fee_rate)
            .max()
            .unwrap_or(FeeRate::ZERO)
    }

    fn min_conf_target(&self) -> u32 {
        self.sweeps
            .values()
            .map(|s| s.conf_target)
            .min()
            .unwrap_or(1)
            .max(1)
    }

    fn blocks_until_timeout(&self) -> u32 {
        self.sweeps
            .values()
            .map(|s| s.timeout)
            .min()
            .unwrap_or(u32::MAX)
            .saturating_sub(self.current_height)
    }
}

/// Receives from an optional channel; pending forever while unset so it
/// can sit in a `select!` arm.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The taproot output key of a v3 HTLC, read off its P2TR output
/// script. The final cooperative signature verifies against it.
fn htlc_output_key(htlc: &Htlc) -> Result<XOnlyPublicKey, ClientError> {
    if !htlc.pk_script.is_p2tr() {
        return Err(ClientError::Signer(
            "htlc output is not taproot".to_string(),
        ));
    }

    XOnlyPublicKey::from_slice(&htlc.pk_script.as_bytes()[2..])
        .map_err(|e| ClientError::Signer(format!("invalid taproot output key: {e}")))
}

#[cfg(test)]
mod tests {
    use sweepbatcher_primitives::htlc::HtlcVersion;
    use sweepbatcher_primitives::types::ProtocolVersion;

    use super::*;
    use crate::test_utils::{test_kit, test_p2tr_addr, test_sweep};

    fn config() -> BatchConfig {
        BatchConfig {
            max_timeout_distance: 288,
            batch_publish_delay: Duration::from_millis(10),
            no_bumping: false,
            min_confirmations: 3,
        }
    }

    #[tokio::test]
    async fn add_sweep_enforces_timeout_distance() {
        let kit = test_kit(0).await;
        let (mut batch, _rx) = Batch::new(config(), kit.kit.clone());
        batch.insert_and_acquire_id().await.unwrap();

        let first = test_sweep(1, HtlcVersion::V3);
        let timeout = first.timeout;
        assert!(batch.handle_add_sweep(first).await.unwrap());

        let mut near = test_sweep(2, HtlcVersion::V3);
        near.timeout = timeout + 288;
        assert!(batch.handle_add_sweep(near).await.unwrap());

        let mut far = test_sweep(3, HtlcVersion::V3);
        far.timeout = timeout + 289;
        assert!(!batch.handle_add_sweep(far).await.unwrap());
    }

    #[tokio::test]
    async fn add_sweep_isolates_external_addresses() {
        let kit = test_kit(0).await;
        let (mut batch, _rx) = Batch::new(config(), kit.kit.clone());
        batch.insert_and_acquire_id().await.unwrap();

        let mut external = test_sweep(1, HtlcVersion::V3);
        external.is_external_addr = true;
        external.dest_addr = Some(test_p2tr_addr());

        // The first sweep is always taken, external or not.
        assert!(batch.handle_add_sweep(external).await.unwrap());

        // No other sweep joins an external batch.
        let normal = test_sweep(2, HtlcVersion::V3);
        assert!(!batch.handle_add_sweep(normal).await.unwrap());
    }

    #[tokio::test]
    async fn add_sweep_rejects_mixed_protocol_versions() {
        let kit = test_kit(0).await;
        let (mut batch, _rx) = Batch::new(config(), kit.kit.clone());
        batch.insert_and_acquire_id().await.unwrap();

        let v3 = test_sweep(1, HtlcVersion::V3);
        assert_eq!(v3.protocol_version, ProtocolVersion::MuSig2);
        assert!(batch.handle_add_sweep(v3).await.unwrap());

        let v2 = test_sweep(2, HtlcVersion::V2);
        assert!(!batch.handle_add_sweep(v2).await.unwrap());
    }

    #[tokio::test]
    async fn add_sweep_update_raises_fee_rate() {
        let kit = test_kit(0).await;
        let (mut batch, _rx) = Batch::new(config(), kit.kit.clone());
        let id = batch.insert_and_acquire_id().await.unwrap();

        let sweep = test_sweep(1, HtlcVersion::V3);
        assert!(batch.handle_add_sweep(sweep.clone()).await.unwrap());

        let mut update = sweep;
        update.min_fee_rate = FeeRate::from_sat_per_kwu(44_000);
        assert!(batch.handle_add_sweep(update).await.unwrap());

        assert_eq!(
            batch.rbf_cache.fee_rate,
            FeeRate::from_sat_per_kwu(44_000),
        );

        // The raise is durable.
        let rows = kit.store.fetch_unconfirmed_sweep_batches().await.unwrap();
        let row = rows.iter().find(|b| b.id == id).unwrap();
        assert_eq!(row.last_rbf_sat_per_kw, 44_000);
    }

    #[tokio::test]
    async fn add_sweep_fails_when_closed() {
        let kit = test_kit(0).await;
        let (mut batch, _rx) = Batch::new(config(), kit.kit.clone());
        batch.insert_and_acquire_id().await.unwrap();
        batch.state = BatchState::Closed;

        let sweep = test_sweep(1, HtlcVersion::V3);
        assert!(matches!(
            batch.handle_add_sweep(sweep).await,
            Err(BatcherError::BatchShuttingDown),
        ));
    }
}
