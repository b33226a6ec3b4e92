//! The top-level batcher.
//!
//! Owns the table of live batch actors, routes incoming sweep requests
//! into them (greedy selection first, simple placement as fallback),
//! recovers unconfirmed batches from the store on start-up and serves
//! spend notifications for sweeps that completed in earlier runs.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bitcoin::{FeeRate, Network};
use sweepbatcher_db::BatcherStore;
use sweepbatcher_primitives::fee::{clamp_to_floor, ABSOLUTE_FEE_PER_KW_FLOOR};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    batch::{Batch, BatchConfig, BatchHandle, BatchKit},
    client::{
        ChainNotifier, MuSig2SignSweep, SignMuSig2, SignerClient, SweepFetcher, VerifySchnorrSig,
        WalletKit,
    },
    errors::BatcherError,
    selection::{estimate_sweep_fee_increment, select_batch, NEW_BATCH_ID},
    sweep::{SpendNotifier, Sweep, SweepRequest},
};

/// Default maximum timeout distance of sweeps sharing a batch.
pub const DEFAULT_MAX_TIMEOUT_DISTANCE: u32 = 288;

/// Default confirmation depth at which a batch is final.
pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 3;

/// Publish debounce on mainnet.
const DEFAULT_MAINNET_PUBLISH_DELAY: Duration = Duration::from_secs(5);

/// Publish debounce on every other network.
const DEFAULT_PUBLISH_DELAY: Duration = Duration::from_millis(500);

/// Batcher configuration.
#[derive(Clone, Default)]
pub struct BatcherConfig {
    /// Maximum timeout distance of sweeps sharing a batch; zero selects
    /// the default.
    pub max_timeout_distance: u32,

    /// Disables fee bumping; batches then follow only the minimum fee
    /// rates of their sweeps.
    pub no_bumping: bool,

    /// Confirmation depth for finality; zero selects the default.
    pub min_confirmations: u32,

    /// Overrides the network-derived publish debounce.
    pub publish_delay: Option<Duration>,

    /// Custom MuSig2 signer; mutually exclusive with a swap server
    /// signer.
    pub sign_musig2: Option<Arc<dyn SignMuSig2>>,
}

impl BatcherConfig {
    pub fn with_no_bumping(mut self) -> Self {
        self.no_bumping = true;
        self
    }

    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    pub fn with_sign_musig2(mut self, signer: Arc<dyn SignMuSig2>) -> Self {
        self.sign_musig2 = Some(signer);
        self
    }

    fn max_timeout_distance(&self) -> u32 {
        if self.max_timeout_distance == 0 {
            DEFAULT_MAX_TIMEOUT_DISTANCE
        } else {
            self.max_timeout_distance
        }
    }

    fn min_confirmations(&self) -> u32 {
        if self.min_confirmations == 0 {
            DEFAULT_MIN_CONFIRMATIONS
        } else {
            self.min_confirmations
        }
    }
}

/// Cloneable handle for feeding sweeps into a running batcher.
#[derive(Clone)]
pub struct BatcherHandle {
    sweep_reqs: mpsc::Sender<SweepRequest>,
    init: watch::Receiver<bool>,
}

impl BatcherHandle {
    /// Enqueues a sweep request for routing.
    pub async fn add_sweep(&self, request: SweepRequest) -> Result<(), BatcherError> {
        self.sweep_reqs
            .send(request)
            .await
            .map_err(|_| BatcherError::BatcherShuttingDown)
    }

    /// Resolves once start-up recovery has finished.
    pub async fn wait_initialized(&self) {
        let mut init = self.init.clone();
        while !*init.borrow() {
            if init.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The batcher. Create with [`Batcher::new`], hand out handles with
/// [`Batcher::handle`], then drive it with [`Batcher::run`].
pub struct Batcher {
    batches: BTreeMap<i32, BatchHandle>,

    sweep_req_tx: mpsc::Sender<SweepRequest>,
    sweep_req_rx: Option<mpsc::Receiver<SweepRequest>>,
    err_tx: mpsc::Sender<BatcherError>,
    err_rx: Option<mpsc::Receiver<BatcherError>>,
    init_tx: watch::Sender<bool>,
    init_rx: watch::Receiver<bool>,

    /// Flipped on exit; every batch actor drains and stops.
    child_shutdown: watch::Sender<bool>,

    tasks: JoinSet<()>,

    wallet: Arc<dyn WalletKit>,
    chain: Arc<dyn ChainNotifier>,
    signer: Arc<dyn SignerClient>,
    musig2_sign_sweep: Option<Arc<dyn MuSig2SignSweep>>,
    verify_schnorr_sig: Arc<dyn VerifySchnorrSig>,
    network: Network,
    store: Arc<dyn BatcherStore>,
    sweep_fetcher: Arc<dyn SweepFetcher>,
    cfg: BatcherConfig,
}

impl Batcher {
    /// Creates a new batcher.
    ///
    /// # Panics
    ///
    /// Panics if the config injects a custom MuSig2 signer while a swap
    /// server signer is also provided; the two are mutually exclusive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet: Arc<dyn WalletKit>,
        chain: Arc<dyn ChainNotifier>,
        signer: Arc<dyn SignerClient>,
        musig2_sign_sweep: Option<Arc<dyn MuSig2SignSweep>>,
        verify_schnorr_sig: Arc<dyn VerifySchnorrSig>,
        network: Network,
        store: Arc<dyn BatcherStore>,
        sweep_fetcher: Arc<dyn SweepFetcher>,
        cfg: BatcherConfig,
    ) -> Batcher {
        assert!(
            !(cfg.sign_musig2.is_some() && musig2_sign_sweep.is_some()),
            "a custom musig2 signer excludes the swap server signer",
        );

        let (sweep_req_tx, sweep_req_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (init_tx, init_rx) = watch::channel(false);
        let (child_shutdown, _) = watch::channel(false);

        Batcher {
            batches: BTreeMap::new(),
            sweep_req_tx,
            sweep_req_rx: Some(sweep_req_rx),
            err_tx,
            err_rx: Some(err_rx),
            init_tx,
            init_rx,
            child_shutdown,
            tasks: JoinSet::new(),
            wallet,
            chain,
            signer,
            musig2_sign_sweep,
            verify_schnorr_sig,
            network,
            store,
            sweep_fetcher,
            cfg,
        }
    }

    pub fn handle(&self) -> BatcherHandle {
        BatcherHandle {
            sweep_reqs: self.sweep_req_tx.clone(),
            init: self.init_rx.clone(),
        }
    }

    /// Runs the batcher until shutdown or a fatal error. Recovers
    /// unconfirmed batches first, then processes intake.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), BatcherError> {
        let result = self.run_inner(shutdown).await;

        // Tear down every batch actor before reporting.
        let _ = self.child_shutdown.send(true);
        while self.tasks.join_next().await.is_some() {}

        if let Err(e) = &result {
            error!(error = %e, "batcher terminated with error");
        }
        result
    }

    async fn run_inner(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BatcherError> {
        let mut sweep_reqs = self
            .sweep_req_rx
            .take()
            .expect("batcher must only run once");
        let mut err_rx = self.err_rx.take().expect("batcher must only run once");

        // Resume every batch that has not confirmed yet.
        let unconfirmed = self.store.fetch_unconfirmed_sweep_batches().await?;
        info!(batches = unconfirmed.len(), "recovering unconfirmed batches");
        for row in unconfirmed {
            self.spin_up_batch_from_db(&row).await?;
        }

        let _ = self.init_tx.send(true);

        loop {
            tokio::select! {
                Some(request) = sweep_reqs.recv() => {
                    let swap_hash = request.swap_hash;
                    match self.fetch_sweep(request).await {
                        Ok(sweep) => self.handle_sweep(sweep).await?,
                        Err(e) => {
                            // A malformed request must not take the
                            // batcher down; the requester learns about
                            // it through its error channel.
                            warn!(
                                swap_hash = %swap_hash.short(),
                                error = %e,
                                "failed to resolve sweep request",
                            );
                        }
                    }
                }

                Some(err) = err_rx.recv() => {
                    return Err(err);
                }

                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("batcher shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Resolves a sweep request against the sweep fetcher. Validation
    /// failures surface on the requester's error channel.
    async fn fetch_sweep(&self, request: SweepRequest) -> Result<Sweep, BatcherError> {
        let fetched = self.sweep_fetcher.fetch_sweep(request.swap_hash).await;

        let info = match fetched {
            Ok(info) => info,
            Err(e) => {
                if let Some(notifier) = &request.notifier {
                    let _ = notifier.spend_err_chan.try_send(e.clone());
                }
                return Err(e.into());
            }
        };

        if info.is_external_addr && info.dest_addr.is_none() {
            return Err(BatcherError::MissingDestAddr(request.swap_hash));
        }

        // A zero rate leaves fee selection to the batcher; anything else
        // must clear the relay floor.
        if info.min_fee_rate != FeeRate::ZERO && info.min_fee_rate < ABSOLUTE_FEE_PER_KW_FLOOR {
            return Err(BatcherError::FeeRateTooLow(
                info.min_fee_rate.to_sat_per_kwu(),
            ));
        }

        Ok(Sweep::new(
            request.swap_hash,
            request.outpoint,
            request.value,
            request.notifier,
            info,
        ))
    }

    /// Routes one sweep: completed sweeps get a historical spend watch,
    /// live duplicates are re-offered to their batch, everything else
    /// goes through batch selection.
    async fn handle_sweep(&mut self, sweep: Sweep) -> Result<(), BatcherError> {
        let swap_hash = sweep.swap_hash;
        let completed = self.store.get_sweep_status(swap_hash).await?;

        info!(
            swap_hash = %swap_hash.short(),
            completed,
            "batcher handling sweep",
        );

        // A sweep that confirmed in an earlier life has no live batch to
        // attach the notifier to; serve the spend directly.
        if completed {
            if let Some(notifier) = sweep.notifier.clone() {
                self.monitor_spend_and_notify(&sweep, notifier).await?;
            }
            return Ok(());
        }

        // Drop completed batches lazily while scanning.
        self.batches.retain(|_, handle| !handle.is_complete());

        let handles: Vec<BatchHandle> = self.batches.values().cloned().collect();
        for handle in &handles {
            if !handle.contains_sweep(swap_hash).await {
                continue;
            }

            return match handle.add_sweep(sweep.clone()).await {
                Ok(true) => Ok(()),
                // The owning batch stopped taking sweeps; find it a new
                // home below.
                Err(BatcherError::BatchShuttingDown) => break,
                Ok(false) => Err(BatcherError::SweepNotAccepted {
                    swap_hash,
                    batch_id: handle.id,
                }),
                Err(e) => Err(e),
            };
        }

        match self.greedy_add_sweep(&sweep).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(
                    swap_hash = %swap_hash.short(),
                    error = %e,
                    "greedy batch selection failed, falling back",
                );
            }
        }

        // Fallback placement: first batch that takes the sweep wins.
        let handles: Vec<BatchHandle> = self.batches.values().cloned().collect();
        for handle in &handles {
            match handle.add_sweep(sweep.clone()).await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(BatcherError::BatchShuttingDown) => continue,
                Err(e) => return Err(e),
            }
        }

        // No batch can take it; a fresh batch must.
        let handle = self.spin_up_batch().await?;
        if !handle.add_sweep(sweep).await? {
            return Err(BatcherError::SweepNotAccepted {
                swap_hash,
                batch_id: handle.id,
            });
        }

        Ok(())
    }

    /// Places the sweep with the greedy cost-minimizing selector.
    async fn greedy_add_sweep(&mut self, sweep: &Sweep) -> Result<(), BatcherError> {
        // The selector needs a concrete rate for the candidate; sweeps
        // that leave the rate to the batcher get the wallet estimate.
        let mut candidate = sweep.clone();
        if candidate.min_fee_rate < ABSOLUTE_FEE_PER_KW_FLOOR {
            let estimated = self
                .wallet
                .estimate_fee_rate(candidate.conf_target)
                .await?;
            candidate.min_fee_rate = clamp_to_floor(estimated.max(candidate.min_fee_rate));
        }

        let (sweep_details, new_batch_details) = estimate_sweep_fee_increment(&candidate)?;

        let mut batch_details = Vec::with_capacity(self.batches.len());
        for handle in self.batches.values() {
            batch_details.push(handle.fee_details().await?);
        }

        let batch_id = select_batch(&batch_details, sweep_details, new_batch_details)?;

        if batch_id == NEW_BATCH_ID {
            let handle = self.spin_up_batch().await?;
            if !handle.add_sweep(sweep.clone()).await? {
                return Err(BatcherError::SweepNotAccepted {
                    swap_hash: sweep.swap_hash,
                    batch_id: handle.id,
                });
            }
            return Ok(());
        }

        let handle = self
            .batches
            .get(&batch_id)
            .ok_or(BatcherError::UnknownBatch(batch_id))?
            .clone();

        if !handle.add_sweep(sweep.clone()).await? {
            // Lost a race against the batch closing; the caller retries
            // with simple placement.
            return Err(BatcherError::SweepNotAccepted {
                swap_hash: sweep.swap_hash,
                batch_id,
            });
        }

        debug!(
            swap_hash = %sweep.swap_hash.short(),
            batch_id,
            "sweep placed by greedy selection",
        );

        Ok(())
    }

    fn batch_config(&self, max_timeout_distance: u32) -> BatchConfig {
        let batch_publish_delay = self.cfg.publish_delay.unwrap_or(match self.network {
            Network::Bitcoin => DEFAULT_MAINNET_PUBLISH_DELAY,
            _ => DEFAULT_PUBLISH_DELAY,
        });

        BatchConfig {
            max_timeout_distance,
            batch_publish_delay,
            no_bumping: self.cfg.no_bumping,
            min_confirmations: self.cfg.min_confirmations(),
        }
    }

    fn batch_kit(&self) -> BatchKit {
        BatchKit {
            wallet: self.wallet.clone(),
            chain: self.chain.clone(),
            signer: self.signer.clone(),
            musig2_sign_sweep: self.musig2_sign_sweep.clone(),
            sign_musig2: self.cfg.sign_musig2.clone(),
            verify_schnorr_sig: self.verify_schnorr_sig.clone(),
            store: self.store.clone(),
            purger: self.sweep_req_tx.clone(),
            shutdown: self.child_shutdown.subscribe(),
        }
    }

    fn spawn_batch(&mut self, batch: Batch, requests: mpsc::Receiver<crate::batch::BatchRequest>) {
        let err_tx = self.err_tx.clone();
        self.tasks.spawn(async move {
            if let Err(e) = batch.run(requests).await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    /// Creates, persists and starts a fresh batch.
    async fn spin_up_batch(&mut self) -> Result<BatchHandle, BatcherError> {
        let cfg = self.batch_config(self.cfg.max_timeout_distance());
        let (mut batch, requests) = Batch::new(cfg, self.batch_kit());

        let id = batch.insert_and_acquire_id().await?;
        let handle = batch.handle();

        info!(batch_id = %id, "spun up fresh batch");

        self.batches.insert(id, handle.clone());
        self.spawn_batch(batch, requests);

        Ok(handle)
    }

    /// Rebuilds one persisted batch and resumes it. Empty rows are
    /// dropped instead.
    async fn spin_up_batch_from_db(
        &mut self,
        row: &sweepbatcher_db::DbBatch,
    ) -> Result<(), BatcherError> {
        let db_sweeps = self.store.fetch_batch_sweeps(row.id).await?;

        if db_sweeps.is_empty() {
            info!(batch_id = %row.id, "skipping restored batch with no sweeps");
            if let Err(e) = self.store.drop_batch(row.id).await {
                warn!(batch_id = %row.id, error = %e, "unable to drop empty batch");
            }
            return Ok(());
        }

        let primary = db_sweeps[0].swap_hash;

        let mut sweeps = BTreeMap::new();
        let mut fee_rate = FeeRate::from_sat_per_kwu(row.last_rbf_sat_per_kw);

        for db_sweep in &db_sweeps {
            let info = self.sweep_fetcher.fetch_sweep(db_sweep.swap_hash).await?;
            let sweep = Sweep::new(
                db_sweep.swap_hash,
                db_sweep.outpoint,
                db_sweep.amount,
                None,
                info,
            );

            fee_rate = fee_rate.max(sweep.min_fee_rate);
            sweeps.insert(sweep.swap_hash, sweep);
        }

        let cfg = self.batch_config(row.max_timeout_distance);
        let (batch, requests) =
            Batch::from_db(cfg, self.batch_kit(), row, sweeps, primary, fee_rate)?;
        let handle = batch.handle();

        info!(
            batch_id = %row.id,
            state = %row.state,
            sweeps = db_sweeps.len(),
            "restored batch from store",
        );

        self.batches.insert(row.id, handle);
        self.spawn_batch(batch, requests);

        Ok(())
    }

    /// Serves the spend of an already-completed sweep: looks up its
    /// confirmed batch, watches the outpoint and reports the spend with
    /// this sweep's fee portion.
    async fn monitor_spend_and_notify(
        &mut self,
        sweep: &Sweep,
        notifier: SpendNotifier,
    ) -> Result<(), BatcherError> {
        use sweepbatcher_primitives::fee::{fee_portion_paid_by_sweep, fee_portion_per_sweep};

        let parent_batch = self.store.get_parent_batch(sweep.swap_hash).await?;
        let total_swept = self.store.total_swept_amount(parent_batch.id).await?;

        let (mut spend_rx, mut spend_err_rx) = self
            .chain
            .register_spend_ntfn(
                &sweep.outpoint,
                &sweep.htlc.pk_script,
                sweep.initiation_height,
            )
            .await?;

        info!(
            swap_hash = %sweep.swap_hash.short(),
            batch_id = %parent_batch.id,
            "monitoring historical spend",
        );

        let outpoint = sweep.outpoint;
        let swap_hash = sweep.swap_hash;
        let err_tx = self.err_tx.clone();
        let mut shutdown = self.child_shutdown.subscribe();
        let mut quit = notifier.quit.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                Some(spend) = spend_rx.recv() => {
                    let tx = spend.spending_tx;
                    let (per_sweep, remainder) =
                        fee_portion_per_sweep(total_swept, tx.input.len().max(1) as u64, &tx);
                    let portion =
                        fee_portion_paid_by_sweep(&tx, per_sweep, remainder, &outpoint);

                    let detail = crate::sweep::SpendDetail {
                        tx,
                        on_chain_fee_portion: portion,
                    };

                    tokio::select! {
                        _ = notifier.spend_chan.send(detail) => {}
                        _ = quit.changed() => {}
                        _ = shutdown.changed() => {}
                    }
                }

                Some(err) = spend_err_rx.recv() => {
                    warn!(
                        swap_hash = %swap_hash.short(),
                        error = %err,
                        "historical spend watch failed",
                    );
                    let _ = notifier.spend_err_chan.try_send(err.clone());
                    let _ = err_tx.send(BatcherError::Client(err)).await;
                }

                _ = quit.changed() => {}
                _ = shutdown.changed() => {}
            }
        });

        Ok(())
    }
}
