//! In-memory stand-ins for the block exchange and pub/sub layers, in the
//! spirit of the custom syncer/broadcaster pairs used to test the real
//! store against a fake network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dagkv::{Block, Broadcaster, Cid, DagSyncer, Error, HierarchicalKey, Options, StateStore, Store};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub const DEFAULT_TOPIC: &str = "crdt";

/// Opt-in test logging: run with `RUST_LOG=dagkv=debug` to watch the sync.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// The shared content-addressed "network": any block published by one
/// replica is fetchable by the others.
pub type BlockNetwork = Arc<Mutex<HashMap<Cid, Block>>>;

pub fn block_network() -> BlockNetwork {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Per-replica block store over a shared network. `has_block` answers for
/// the local replica only; fetches pull remote blocks into the local store.
pub struct MemoryDagSyncer {
    local: Mutex<HashMap<Cid, Block>>,
    network: BlockNetwork,
}

impl MemoryDagSyncer {
    pub fn new(network: BlockNetwork) -> Self {
        Self {
            local: Mutex::new(HashMap::new()),
            network,
        }
    }
}

#[async_trait]
impl DagSyncer for MemoryDagSyncer {
    async fn add_node(&self, block: Block) -> Result<(), Error> {
        self.local.lock().unwrap().insert(*block.cid(), block.clone());
        self.network.lock().unwrap().insert(*block.cid(), block);
        Ok(())
    }

    async fn get_node(&self, cid: &Cid) -> Result<Block, Error> {
        if let Some(block) = self.local.lock().unwrap().get(cid) {
            return Ok(block.clone());
        }
        let fetched = self
            .network
            .lock()
            .unwrap()
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::DagFetch(format!("block {cid} not found")))?;
        self.local.lock().unwrap().insert(*cid, fetched.clone());
        Ok(fetched)
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self.local.lock().unwrap().contains_key(cid))
    }

    async fn fetch_graph_on_depth(&self, cid: &Cid, _depth: u64) -> Result<Block, Error> {
        self.get_node(cid).await
    }
}

type Envelope = (Vec<u8>, String);

#[derive(Default)]
struct HubState {
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    log: Vec<Envelope>,
}

/// Central pub/sub hub. Every envelope goes to every peer, the sender
/// included, so self-delivery and duplicate delivery paths get exercised.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    state: Arc<Mutex<HubState>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, topics: &[&str]) -> HubBroadcaster {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().peers.push(tx);
        let mut subscribed: HashSet<String> = topics.iter().map(|t| t.to_string()).collect();
        subscribed.insert(DEFAULT_TOPIC.to_string());
        HubBroadcaster {
            hub: self.clone(),
            subscribed,
            inbox: AsyncMutex::new(rx),
        }
    }

    fn publish(&self, payload: Vec<u8>, topic: String) {
        let mut state = self.state.lock().unwrap();
        state.log.push((payload.clone(), topic.clone()));
        state
            .peers
            .retain(|peer| peer.send((payload.clone(), topic.clone())).is_ok());
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }

    pub fn messages_on(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(_, t)| t == topic)
            .count()
    }

    /// Re-delivers every envelope ever published, without logging them
    /// again. Replicas must treat the replay as a no-op.
    pub fn replay_all(&self) {
        let log = self.state.lock().unwrap().log.clone();
        for (payload, topic) in log {
            self.state
                .lock()
                .unwrap()
                .peers
                .retain(|peer| peer.send((payload.clone(), topic.clone())).is_ok());
        }
    }
}

pub struct HubBroadcaster {
    hub: BroadcastHub,
    subscribed: HashSet<String>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Envelope>>,
}

#[async_trait]
impl Broadcaster for HubBroadcaster {
    async fn broadcast(&self, payload: Vec<u8>, topic: Option<&str>) -> Result<(), Error> {
        self.hub
            .publish(payload, topic.unwrap_or(DEFAULT_TOPIC).to_string());
        Ok(())
    }

    async fn next(&self) -> Result<Option<Envelope>, Error> {
        Ok(self.inbox.lock().await.recv().await)
    }

    fn has_topic(&self, topic: &str) -> bool {
        self.subscribed.contains(topic)
    }
}

pub type TestStore = Store<MemoryDagSyncer, HubBroadcaster>;

pub async fn open_store(
    state: StateStore,
    dag: Arc<MemoryDagSyncer>,
    hub: &BroadcastHub,
    topics: &[&str],
    options: Options,
) -> anyhow::Result<TestStore> {
    let broadcaster = Arc::new(hub.join(topics));
    Ok(Store::new(
        state,
        HierarchicalKey::new("/crdt")?,
        dag,
        broadcaster,
        options,
    )
    .await?)
}

/// Polls `cond` for up to five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}
