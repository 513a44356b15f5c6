//! End-to-end swap scenarios over simulated chains
//!
//! Two full nodes (initiator and participant) run against the same pair
//! of in-memory ledgers, wired together by an in-process transport hub.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use asnd::chain::adapter::{ChainAdapter, TxView};
use asnd::chain::sim::SimChain;
use asnd::chain::ChainManager;
use asnd::config::{ChainConfig, ChainFamily, SwapConfig};
use asnd::error::{SwapError, SwapResult};
use asnd::protocol::{PeerTransport, SwapId, SwapParameters};
use asnd::signer::{KeyHandle, LocalSigner, Signer};
use asnd::swap::SwapManager;

const GENESIS: u64 = 1_700_000_000;
const BLOCK_SECS: u64 = 600;

/// In-process transport: routes envelopes to the peer's inbound queue by
/// negotiation public key.
#[derive(Default)]
struct Hub {
    routes: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl Hub {
    async fn connect(&self, peer: String, inbox: mpsc::Sender<Vec<u8>>) {
        self.routes.write().await.insert(peer, inbox);
    }
}

#[async_trait]
impl PeerTransport for Hub {
    async fn send(&self, peer: &str, payload: Vec<u8>) -> SwapResult<()> {
        let routes = self.routes.read().await;
        match routes.get(peer) {
            Some(inbox) => inbox
                .send(payload)
                .await
                .map_err(|_| SwapError::Transport("peer inbox closed".into())),
            None => Err(SwapError::Transport(format!("no route to {}", peer))),
        }
    }
}

/// Adapter wrapper whose broadcasts always fail; used to model a
/// participant that never manages to fund its leg.
struct BroadcastBlackhole(Arc<SimChain>);

#[async_trait]
impl ChainAdapter for BroadcastBlackhole {
    fn chain_id(&self) -> u64 {
        self.0.chain_id()
    }

    async fn broadcast(&self, _payload: Vec<u8>) -> SwapResult<String> {
        Err(SwapError::ChainRpc {
            chain_id: self.0.chain_id(),
            message: "broadcast rejected".into(),
        })
    }

    async fn get_transaction(&self, txid: &str) -> SwapResult<Option<TxView>> {
        self.0.get_transaction(txid).await
    }

    async fn get_block_height(&self) -> SwapResult<u64> {
        self.0.get_block_height().await
    }

    async fn get_chain_time(&self) -> SwapResult<u64> {
        self.0.get_chain_time().await
    }

    async fn find_spender(&self, lock_address: &str) -> SwapResult<Option<TxView>> {
        self.0.find_spender(lock_address).await
    }

    async fn subscribe(&self, _lock_address: &str) -> Option<mpsc::Receiver<TxView>> {
        None
    }
}

fn swap_config() -> SwapConfig {
    SwapConfig {
        tick_interval_ms: 25,
        min_timeout_gap_secs: 600,
        negotiation_timeout_secs: 3_600,
        refund_grace_secs: 7_200,
        retention_secs: 86_400,
        max_clock_skew_secs: 300,
        max_retries: 2,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
    }
}

fn adapter(chain: Arc<impl ChainAdapter + 'static>) -> Arc<dyn ChainAdapter> {
    chain
}

fn chain_config(chain_id: u64, family: ChainFamily, confirmations: u64) -> ChainConfig {
    ChainConfig {
        chain_id,
        name: format!("chain-{}", chain_id),
        family,
        adapter: "sim".into(),
        rpc_urls: vec![],
        confirmation_blocks: confirmations,
        poll_interval_ms: 15,
        enabled: true,
    }
}

struct Node {
    manager: Arc<SwapManager>,
    pubkey: String,
}

/// Build a node wired to the given adapters and hub
async fn spawn_node(
    hub: Arc<Hub>,
    adapters: Vec<(ChainConfig, Arc<dyn ChainAdapter>)>,
) -> Node {
    let mut signer = LocalSigner::new();
    let pubkey = hex::encode(signer.generate(KeyHandle::negotiation()));
    for (config, _) in &adapters {
        signer.generate(KeyHandle::for_chain(config.chain_id));
    }
    let signer: Arc<dyn Signer> = Arc::new(signer);

    let chain_manager = Arc::new(ChainManager::new(&swap_config()));
    for (config, adapter) in adapters {
        chain_manager.register(config, adapter);
    }

    let manager = SwapManager::new(swap_config(), chain_manager, hub.clone(), signer, None);
    hub.connect(pubkey.clone(), manager.inbound_sender()).await;
    tokio::spawn(manager.clone().run());

    Node { manager, pubkey }
}

/// Mine both chains continuously in the background
fn spawn_miners(chains: Vec<Arc<SimChain>>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            for chain in &chains {
                chain.mine_block();
            }
        }
    });
}

async fn wait_for_state(node: &Node, swap_id: SwapId, target: &str, within: Duration) -> String {
    let deadline = tokio::time::Instant::now() + within;
    let mut last = String::from("<none>");
    while tokio::time::Instant::now() < deadline {
        if let Some(status) = node.manager.status(swap_id).await {
            last = status.state.clone();
            if status.state == target {
                return last;
            }
            if status.state == "failed" && target != "failed" {
                panic!(
                    "swap failed while waiting for {}: {:?}",
                    target, status.reason
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}; last state {}", target, last);
}

fn base_params(counterparty: &str, timeout_a: u64, timeout_b: u64) -> SwapParameters {
    SwapParameters {
        chain_a: 7,
        amount_a: 1,
        timeout_a,
        chain_b: 9,
        amount_b: 100,
        timeout_b,
        initiator_pubkey: String::new(),
        participant_pubkey: counterparty.to_string(),
        initiator_redeem_key: String::new(),
        initiator_refund_key: String::new(),
        participant_redeem_key: String::new(),
        participant_refund_key: String::new(),
    }
}

/// Scenario A: 1 unit on chain A for 100 units on chain B, 48h/24h
/// timeouts. Both legs confirm, the initiator's redeem reveals the
/// preimage, the participant observes it and redeems in time; both sides
/// end Completed.
#[tokio::test]
async fn scenario_a_happy_path_completes_both_legs() {
    let chain_a = SimChain::new(7, GENESIS, BLOCK_SECS);
    let chain_b = SimChain::new(9, GENESIS, BLOCK_SECS);
    let hub = Arc::new(Hub::default());

    let initiator = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (chain_config(9, ChainFamily::Account, 2), adapter(chain_b.clone())),
        ],
    )
    .await;
    let participant = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (chain_config(9, ChainFamily::Account, 2), adapter(chain_b.clone())),
        ],
    )
    .await;

    spawn_miners(vec![chain_a, chain_b], Duration::from_millis(40));

    let params = base_params(
        &participant.pubkey,
        GENESIS + 48 * 3_600,
        GENESIS + 24 * 3_600,
    );
    let swap_id = initiator.manager.initiate_swap(params).await.unwrap();

    wait_for_state(&initiator, swap_id, "completed", Duration::from_secs(15)).await;
    wait_for_state(&participant, swap_id, "completed", Duration::from_secs(15)).await;

    let status = initiator.manager.status(swap_id).await.unwrap();
    assert!(status.secret_revealed);
    assert!(status.leg_a.is_some() && status.leg_b.is_some());
}

/// Scenario B: the participant accepts but never funds (its broadcasts
/// fail). After the initiator leg's timeout elapses on-chain, the
/// initiator refunds; final state Refunded.
#[tokio::test]
async fn scenario_b_unfunded_counterparty_leads_to_refund() {
    let chain_a = SimChain::new(7, GENESIS, BLOCK_SECS);
    let chain_b = SimChain::new(9, GENESIS, BLOCK_SECS);
    let hub = Arc::new(Hub::default());

    let initiator = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (chain_config(9, ChainFamily::Account, 2), adapter(chain_b.clone())),
        ],
    )
    .await;
    // the participant's chain B adapter swallows every broadcast
    let participant = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (
                chain_config(9, ChainFamily::Account, 2),
                adapter(Arc::new(BroadcastBlackhole(chain_b.clone()))),
            ),
        ],
    )
    .await;

    spawn_miners(vec![chain_a, chain_b], Duration::from_millis(40));

    // short timeouts: the initiator leg expires after ~6 simulated blocks
    let params = base_params(
        &participant.pubkey,
        GENESIS + 6 * BLOCK_SECS,
        GENESIS + 3 * BLOCK_SECS,
    );
    let swap_id = initiator.manager.initiate_swap(params).await.unwrap();

    wait_for_state(&initiator, swap_id, "refunded", Duration::from_secs(15)).await;

    let status = initiator.manager.status(swap_id).await.unwrap();
    assert!(!status.secret_revealed, "preimage never left the initiator");
    assert!(status.leg_b.is_none(), "participant leg never funded");
}

/// Scenario C: a proposal with timeout_b >= timeout_a is rejected at
/// negotiation time with no on-chain activity.
#[tokio::test]
async fn scenario_c_reversed_timeouts_rejected_without_chain_activity() {
    let chain_a = SimChain::new(7, GENESIS, BLOCK_SECS);
    let chain_b = SimChain::new(9, GENESIS, BLOCK_SECS);
    let hub = Arc::new(Hub::default());

    let initiator = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (chain_config(9, ChainFamily::Account, 2), adapter(chain_b.clone())),
        ],
    )
    .await;

    let params = base_params("02ffff", GENESIS + 3_600, GENESIS + 7_200);
    let err = initiator.manager.initiate_swap(params).await.unwrap_err();
    assert!(matches!(err, SwapError::Negotiation(_)));

    // nothing was broadcast anywhere
    chain_a.mine_block();
    chain_b.mine_block();
    assert!(initiator.manager.list_swaps().await.is_empty());
    assert!(chain_a.find_spender("any").await.unwrap().is_none());
}

/// Replayed envelopes are screened and produce no duplicate effects.
#[tokio::test]
async fn replayed_messages_are_idempotent() {
    let chain_a = SimChain::new(7, GENESIS, BLOCK_SECS);
    let chain_b = SimChain::new(9, GENESIS, BLOCK_SECS);
    let hub = Arc::new(Hub::default());

    // a recording hub wrapper would be heavier; instead replay at the
    // queue level: capture the initiator's proposal by sending it to a
    // tap route, then deliver it to the participant twice
    let (tap_tx, mut tap_rx) = mpsc::channel::<Vec<u8>>(16);

    let initiator = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (chain_config(9, ChainFamily::Account, 2), adapter(chain_b.clone())),
        ],
    )
    .await;
    let participant = spawn_node(
        hub.clone(),
        vec![
            (chain_config(7, ChainFamily::Script, 2), adapter(chain_a.clone())),
            (chain_config(9, ChainFamily::Account, 2), adapter(chain_b.clone())),
        ],
    )
    .await;

    // divert the participant's inbox through the tap
    hub.connect(participant.pubkey.clone(), tap_tx).await;

    let params = base_params(
        &participant.pubkey,
        GENESIS + 48 * 3_600,
        GENESIS + 24 * 3_600,
    );
    let swap_id = initiator.manager.initiate_swap(params).await.unwrap();

    let proposal = tokio::time::timeout(Duration::from_secs(2), tap_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // first delivery creates the session; the replay is a no-op
    participant.manager.handle_inbound(&proposal).await.unwrap();
    participant.manager.handle_inbound(&proposal).await.unwrap();

    assert_eq!(participant.manager.list_swaps().await.len(), 1);
    assert!(participant.manager.status(swap_id).await.is_some());
}
