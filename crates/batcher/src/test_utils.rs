//! Mock collaborators and fixtures shared by the crate's tests.

use std::{
    collections::{HashMap, VecDeque},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bitcoin::{
    hashes::Hash, Address, Amount, FeeRate, Network, OutPoint, ScriptBuf, TapNodeHash,
    Transaction, TxOut, Txid,
};
use musig2::{PartialSignature, PubNonce, SecNonce};
use secp256k1::{schnorr, PublicKey, XOnlyPublicKey, SECP256K1};
use sqlx::sqlite::SqlitePoolOptions;
use sweepbatcher_db::{BatcherStore, SqliteStore};
use sweepbatcher_primitives::{
    htlc::{Htlc, HtlcVersion},
    types::{HtlcKeys, KeyLocator, Preimage, ProtocolVersion, SwapHash},
};
use tokio::sync::{mpsc, watch};

use crate::{
    batch::BatchKit,
    client::{
        ChainNotifier, ClientError, ClientResult, ConfEvent, MuSig2Session, MuSig2SignSweep,
        SignDescriptor, SignerClient, SpendEvent, SweepFetcher, VerifySchnorrSig, WalletKit,
    },
    sweep::{Sweep, SweepInfo, SweepRequest},
};

/// The generator point; any fixed valid key works for fixtures.
const TEST_PUBKEY_HEX: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

pub(crate) fn test_pubkey() -> PublicKey {
    PublicKey::from_str(TEST_PUBKEY_HEX).expect("static key must parse")
}

pub(crate) fn test_xonly() -> XOnlyPublicKey {
    test_pubkey().x_only_public_key().0
}

pub(crate) fn test_p2tr_addr() -> Address {
    Address::p2tr(SECP256K1, test_xonly(), None, Network::Regtest)
}

pub(crate) fn test_p2pkh_addr() -> Address {
    Address::p2pkh(bitcoin::PublicKey::new(test_pubkey()), Network::Regtest)
}

pub(crate) fn test_htlc(version: HtlcVersion) -> Htlc {
    match version {
        HtlcVersion::V2 => Htlc {
            version,
            pk_script: ScriptBuf::from_bytes(vec![0x00, 0x20].into_iter().chain([7; 32]).collect()),
            success_script: ScriptBuf::from_bytes(vec![0x51, 0x52]),
            root_hash: None,
            control_block: None,
        },
        HtlcVersion::V3 => Htlc {
            version,
            pk_script: test_p2tr_addr().script_pubkey(),
            success_script: ScriptBuf::from_bytes(vec![0x51, 0x53]),
            root_hash: Some(TapNodeHash::from_byte_array([9; 32])),
            control_block: Some(vec![0xc0; 33]),
        },
    }
}

pub(crate) fn test_keys() -> HtlcKeys {
    HtlcKeys {
        sender_script_key: test_pubkey(),
        receiver_script_key: test_pubkey(),
        sender_internal_key: Some(test_pubkey()),
        receiver_internal_key: Some(test_pubkey()),
        client_key_locator: KeyLocator { family: 6, index: 1 },
    }
}

/// A ready-to-batch sweep. `n` seeds the swap hash, outpoint and
/// preimage.
pub(crate) fn test_sweep(n: u8, version: HtlcVersion) -> Sweep {
    let protocol_version = match version {
        HtlcVersion::V2 => ProtocolVersion::HtlcV2,
        HtlcVersion::V3 => ProtocolVersion::MuSig2,
    };

    Sweep {
        swap_hash: SwapHash([n; 32]),
        outpoint: OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout: 0,
        },
        value: Amount::from_sat(1_000_000),
        conf_target: 3,
        timeout: 810_000,
        initiation_height: 799_000,
        htlc: test_htlc(version),
        preimage: Preimage([n; 32]),
        swap_invoice_payment_addr: [n; 32],
        htlc_keys: test_keys(),
        protocol_version,
        is_external_addr: false,
        dest_addr: None,
        min_fee_rate: FeeRate::ZERO,
        notifier: None,
        non_coop_hint: false,
    }
}

/// The fetcher-side view of a sweep, for registering in a
/// [`MockSweepFetcher`].
pub(crate) fn sweep_info_from(sweep: &Sweep) -> SweepInfo {
    SweepInfo {
        conf_target: sweep.conf_target,
        timeout: sweep.timeout,
        initiation_height: sweep.initiation_height,
        htlc: sweep.htlc.clone(),
        preimage: sweep.preimage,
        swap_invoice_payment_addr: sweep.swap_invoice_payment_addr,
        htlc_keys: sweep.htlc_keys,
        protocol_version: sweep.protocol_version,
        is_external_addr: sweep.is_external_addr,
        dest_addr: sweep.dest_addr.clone(),
        min_fee_rate: sweep.min_fee_rate,
    }
}

pub(crate) struct MockWallet {
    fee_rate: Mutex<FeeRate>,
    addr: Address,
}

impl MockWallet {
    pub(crate) fn new() -> Self {
        MockWallet {
            fee_rate: Mutex::new(FeeRate::from_sat_per_kwu(10_000)),
            addr: test_p2tr_addr(),
        }
    }
}

#[async_trait]
impl WalletKit for MockWallet {
    async fn estimate_fee_rate(&self, _conf_target: u32) -> ClientResult<FeeRate> {
        Ok(*self.fee_rate.lock().unwrap())
    }

    async fn next_addr(&self) -> ClientResult<Address> {
        Ok(self.addr.clone())
    }
}

struct SpendWatch {
    outpoint: OutPoint,
    sender: mpsc::Sender<SpendEvent>,
    _err_sender: mpsc::Sender<ClientError>,
}

struct ConfWatch {
    txid: Txid,
    sender: mpsc::Sender<ConfEvent>,
    _err_sender: mpsc::Sender<ClientError>,
}

/// Scripted chain backend: tests mine blocks, deliver spends and
/// confirmations, and inspect what was published.
pub(crate) struct MockChain {
    epochs: Mutex<Vec<mpsc::Sender<u32>>>,
    published: Mutex<Vec<Transaction>>,
    publish_errors: Mutex<VecDeque<ClientError>>,
    spend_watches: Mutex<Vec<SpendWatch>>,
    conf_watches: Mutex<Vec<ConfWatch>>,
}

impl MockChain {
    pub(crate) fn new() -> Self {
        MockChain {
            epochs: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            publish_errors: Mutex::new(VecDeque::new()),
            spend_watches: Mutex::new(Vec::new()),
            conf_watches: Mutex::new(Vec::new()),
        }
    }

    /// The next publish attempt fails with `err`.
    pub(crate) fn push_publish_error(&self, err: ClientError) {
        self.publish_errors.lock().unwrap().push_back(err);
    }

    pub(crate) fn published(&self) -> Vec<Transaction> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn epoch_subscriber_count(&self) -> usize {
        self.epochs.lock().unwrap().len()
    }

    pub(crate) fn spend_watch_count(&self) -> usize {
        self.spend_watches.lock().unwrap().len()
    }

    pub(crate) fn conf_watch_count(&self) -> usize {
        self.conf_watches.lock().unwrap().len()
    }

    pub(crate) async fn mine_block(&self, height: u32) {
        let senders: Vec<_> = self.epochs.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(height).await;
        }
    }

    /// Delivers `tx` as the spend of every watched outpoint it spends.
    pub(crate) async fn notify_spend(&self, tx: Transaction, height: u32) {
        let senders: Vec<_> = self
            .spend_watches
            .lock()
            .unwrap()
            .iter()
            .filter(|w| tx.input.iter().any(|i| i.previous_output == w.outpoint))
            .map(|w| w.sender.clone())
            .collect();

        for sender in senders {
            let _ = sender
                .send(SpendEvent {
                    spending_tx: tx.clone(),
                    spending_height: height,
                })
                .await;
        }
    }

    /// Delivers a spend event to the watches of one specific outpoint.
    pub(crate) async fn send_spend_event(&self, outpoint: &OutPoint, event: SpendEvent) {
        let senders: Vec<_> = self
            .spend_watches
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.outpoint == *outpoint)
            .map(|w| w.sender.clone())
            .collect();

        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    pub(crate) async fn notify_conf(&self, tx: Transaction, height: u32) {
        let txid = tx.compute_txid();
        let senders: Vec<_> = self
            .conf_watches
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.txid == txid)
            .map(|w| w.sender.clone())
            .collect();

        for sender in senders {
            let _ = sender
                .send(ConfEvent {
                    tx: tx.clone(),
                    block_height: height,
                })
                .await;
        }
    }
}

#[async_trait]
impl ChainNotifier for MockChain {
    async fn register_block_epoch_ntfn(&self) -> ClientResult<mpsc::Receiver<u32>> {
        let (tx, rx) = mpsc::channel(16);
        self.epochs.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn register_spend_ntfn(
        &self,
        outpoint: &OutPoint,
        _pk_script: &ScriptBuf,
        _height_hint: u32,
    ) -> ClientResult<(mpsc::Receiver<SpendEvent>, mpsc::Receiver<ClientError>)> {
        let (tx, rx) = mpsc::channel(4);
        let (err_tx, err_rx) = mpsc::channel(4);
        self.spend_watches.lock().unwrap().push(SpendWatch {
            outpoint: *outpoint,
            sender: tx,
            _err_sender: err_tx,
        });
        Ok((rx, err_rx))
    }

    async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        _pk_script: &ScriptBuf,
        _num_confs: u32,
        _height_hint: u32,
    ) -> ClientResult<(mpsc::Receiver<ConfEvent>, mpsc::Receiver<ClientError>)> {
        let (tx, rx) = mpsc::channel(4);
        let (err_tx, err_rx) = mpsc::channel(4);
        self.conf_watches.lock().unwrap().push(ConfWatch {
            txid,
            sender: tx,
            _err_sender: err_tx,
        });
        Ok((rx, err_rx))
    }

    async fn publish_tx(&self, tx: &Transaction, _label: &str) -> ClientResult<()> {
        if let Some(err) = self.publish_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.published.lock().unwrap().push(tx.clone());
        Ok(())
    }
}

/// Signer returning structurally valid but unverifiable signatures; pair
/// it with [`MockVerifier`].
pub(crate) struct MockSigner;

#[async_trait]
impl SignerClient for MockSigner {
    async fn musig2_create_session(
        &self,
        _key_locator: &KeyLocator,
        _signer_keys: [PublicKey; 2],
        _root_hash: TapNodeHash,
    ) -> ClientResult<MuSig2Session> {
        Ok(MuSig2Session {
            session_id: [0x33; 32],
            our_nonce: SecNonce::build([7u8; 32]).build().public_nonce(),
            combined_key: test_xonly(),
        })
    }

    async fn musig2_register_nonces(
        &self,
        _session_id: [u8; 32],
        _nonces: &[PubNonce],
    ) -> ClientResult<bool> {
        Ok(true)
    }

    async fn musig2_sign(
        &self,
        _session_id: [u8; 32],
        _sig_hash: [u8; 32],
    ) -> ClientResult<PartialSignature> {
        Ok(PartialSignature::from_slice(&[1u8; 32]).expect("static scalar must parse"))
    }

    async fn musig2_combine_sig(
        &self,
        _session_id: [u8; 32],
        _other_partials: &[PartialSignature],
    ) -> ClientResult<(bool, schnorr::Signature)> {
        Ok((
            true,
            schnorr::Signature::from_slice(&[0x22; 64]).expect("static signature must parse"),
        ))
    }

    async fn sign_output_raw(
        &self,
        _tx: &Transaction,
        _descriptor: &SignDescriptor,
        _prev_outs: &[TxOut],
    ) -> ClientResult<Vec<u8>> {
        Ok(vec![0x44; 64])
    }
}

/// Swap server mock with a scripted number of initial failures.
pub(crate) struct MockCoopSigner {
    remaining_failures: Mutex<usize>,
    calls: AtomicUsize,
}

impl MockCoopSigner {
    pub(crate) fn new(failures: usize) -> Self {
        MockCoopSigner {
            remaining_failures: Mutex::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MuSig2SignSweep for MockCoopSigner {
    async fn musig2_sign_sweep(
        &self,
        _protocol_version: ProtocolVersion,
        _swap_hash: SwapHash,
        _payment_addr: [u8; 32],
        _nonce: &PubNonce,
        _sweep_tx_psbt: &[u8],
        _prevout_map: &std::collections::BTreeMap<OutPoint, TxOut>,
    ) -> ClientResult<(PubNonce, PartialSignature)> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::CoopSigner("scripted failure".to_string()));
            }
        }

        Ok((
            SecNonce::build([8u8; 32]).build().public_nonce(),
            PartialSignature::from_slice(&[2u8; 32]).expect("static scalar must parse"),
        ))
    }
}

/// Verifier accepting everything the mock signer produces.
pub(crate) struct MockVerifier;

#[async_trait]
impl VerifySchnorrSig for MockVerifier {
    async fn verify_schnorr_sig(
        &self,
        _pub_key: &XOnlyPublicKey,
        _sig_hash: &[u8; 32],
        _sig: &schnorr::Signature,
    ) -> ClientResult<()> {
        Ok(())
    }
}

pub(crate) struct MockSweepFetcher {
    infos: Mutex<HashMap<SwapHash, SweepInfo>>,
}

impl MockSweepFetcher {
    pub(crate) fn new() -> Self {
        MockSweepFetcher {
            infos: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, swap_hash: SwapHash, info: SweepInfo) {
        self.infos.lock().unwrap().insert(swap_hash, info);
    }
}

#[async_trait]
impl SweepFetcher for MockSweepFetcher {
    async fn fetch_sweep(&self, swap_hash: SwapHash) -> ClientResult<SweepInfo> {
        self.infos
            .lock()
            .unwrap()
            .get(&swap_hash)
            .cloned()
            .ok_or_else(|| ClientError::SweepFetcher(format!("no sweep info for {swap_hash}")))
    }
}

/// Everything a [`crate::batch::Batch`] needs, wired to mocks and an
/// in-memory store.
pub(crate) struct TestKit {
    pub kit: BatchKit,
    pub store: Arc<SqliteStore>,
    _shutdown: watch::Sender<bool>,
    _purge_rx: mpsc::Receiver<SweepRequest>,
}

pub(crate) async fn test_kit(coop_failures: usize) -> TestKit {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite must connect");
    let store = Arc::new(
        SqliteStore::new(pool)
            .await
            .expect("schema must initialize"),
    );

    let (purge_tx, purge_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dyn_store: Arc<dyn BatcherStore> = store.clone();

    let kit = BatchKit {
        wallet: Arc::new(MockWallet::new()),
        chain: Arc::new(MockChain::new()),
        signer: Arc::new(MockSigner),
        musig2_sign_sweep: Some(Arc::new(MockCoopSigner::new(coop_failures))),
        sign_musig2: None,
        verify_schnorr_sig: Arc::new(MockVerifier),
        store: dyn_store,
        purger: purge_tx,
        shutdown: shutdown_rx,
    };

    TestKit {
        kit,
        store,
        _shutdown: shutdown_tx,
        _purge_rx: purge_rx,
    }
}
