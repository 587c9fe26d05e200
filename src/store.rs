use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::join_all;
use libipld::cid::Cid;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::broadcast::{decode_broadcast, encode_broadcast, Broadcaster};
use crate::config::Options;
use crate::dag::{Block, DagSyncer, LinkedDelta};
use crate::delta::Delta;
use crate::error::Error;
use crate::heads::HeadStore;
use crate::key::HierarchicalKey;
use crate::set::AddWinsSet;
use crate::storage::StateStore;
use crate::transaction::AtomicTransaction;

const SET_NAMESPACE: &str = "s";
const HEADS_NAMESPACE: &str = "h";
const PROCESSED_CIDS_CAP: usize = 8192;

/// One unit of DAG traversal: fetch `cid`, merge its delta, and update the
/// heads for `root`. Links that are still unknown become new jobs carrying
/// the same root.
#[derive(Debug, Clone)]
struct DagJob {
    cid: Cid,
    root: Cid,
    /// Zero means unknown; the worker reads it from the fetched delta.
    root_priority: u64,
    topic: Option<String>,
}

/// Bounded dedup of already-processed CIDs. In-flight CIDs live in their own
/// set so the FIFO eviction can never drop a CID whose job is still queued.
struct ProcessedCids {
    seen: HashSet<Cid>,
    order: VecDeque<Cid>,
    in_flight: HashSet<Cid>,
    cap: usize,
}

impl ProcessedCids {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            in_flight: HashSet::new(),
            cap,
        }
    }

    fn contains(&self, cid: &Cid) -> bool {
        self.seen.contains(cid) || self.in_flight.contains(cid)
    }

    /// Claims `cid` for processing. Returns false when it is already known.
    fn begin(&mut self, cid: Cid) -> bool {
        if self.contains(&cid) {
            return false;
        }
        self.in_flight.insert(cid);
        true
    }

    /// Releases a claim whose job failed, so a later announce retries it.
    fn abandon(&mut self, cid: &Cid) {
        self.in_flight.remove(cid);
    }

    fn finish(&mut self, cid: Cid) {
        self.in_flight.remove(&cid);
        self.mark(cid);
    }

    fn mark(&mut self, cid: Cid) {
        if self.seen.insert(cid) {
            self.order.push_back(cid);
            while self.order.len() > self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The replicated datastore: hierarchical keys to opaque values over a
/// Merkle-CRDT. Local mutations become DAG nodes linking the previous heads;
/// remote head announcements are fetched, merged and re-headed by a worker
/// pool. Cheap to clone; `close` shuts the background tasks down.
pub struct Store<D, B> {
    inner: Arc<Inner<D, B>>,
}

impl<D, B> Clone for Store<D, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<D, B> {
    set: AddWinsSet,
    heads: HeadStore,
    dag: Arc<D>,
    broadcaster: Arc<B>,
    options: Options,
    jobs: mpsc::UnboundedSender<DagJob>,
    // Guards the merge + head update of one node, so head consistency is
    // preserved across concurrent publishes and replays.
    dag_mutex: AsyncMutex<()>,
    listen_topics: Mutex<HashSet<String>>,
    broadcast_topics: Mutex<Vec<String>>,
    // Damping set of heads seen since the last rebroadcast.
    seen_heads: Mutex<HashSet<Cid>>,
    processed: Mutex<ProcessedCids>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D, B> Store<D, B>
where
    D: DagSyncer + 'static,
    B: Broadcaster + 'static,
{
    /// Opens the store over its collaborators, primes the head frontier from
    /// storage and starts the receiver, rebroadcaster and DAG worker tasks.
    pub async fn new(
        state: StateStore,
        namespace: HierarchicalKey,
        dag: Arc<D>,
        broadcaster: Arc<B>,
        options: Options,
    ) -> Result<Self, Error> {
        options.verify()?;
        let set = AddWinsSet::new(
            state.clone(),
            namespace.child_string(SET_NAMESPACE),
            options.put_hook.clone(),
            options.delete_hook.clone(),
        );
        let heads = HeadStore::new(state, namespace.child_string(HEADS_NAMESPACE))?;
        let (head_list, max_height) = heads.list();
        info!(
            heads = head_list.len(),
            max_height, "crdt datastore opened"
        );

        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            set,
            heads,
            dag,
            broadcaster,
            options,
            jobs,
            dag_mutex: AsyncMutex::new(()),
            listen_topics: Mutex::new(HashSet::new()),
            broadcast_topics: Mutex::new(Vec::new()),
            seen_heads: Mutex::new(HashSet::new()),
            processed: Mutex::new(ProcessedCids::new(PROCESSED_CIDS_CAP)),
            running: AtomicBool::new(true),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        let store = Self { inner };
        store.spawn_tasks(jobs_rx);
        Ok(store)
    }

    fn spawn_tasks(&self, jobs_rx: mpsc::UnboundedReceiver<DagJob>) {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            self.inner.broadcaster.clone(),
            self.inner.shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(rebroadcast_loop(
            Arc::downgrade(&self.inner),
            self.inner.options.rebroadcast_interval,
            self.inner.shutdown.subscribe(),
        )));

        let queue = Arc::new(AsyncMutex::new(jobs_rx));
        for worker in 0..self.inner.options.num_workers {
            handles.push(tokio::spawn(worker_loop(
                Arc::downgrade(&self.inner),
                queue.clone(),
                self.inner.shutdown.subscribe(),
                worker,
            )));
        }

        lock(&self.inner.tasks).extend(handles);
    }

    /// Stores `value` under `key` and announces the new head, on `topic` or
    /// the registered broadcast topics. Returns once the local apply has
    /// committed.
    #[instrument(name = "store::put", skip_all)]
    pub async fn put(
        &self,
        key: &HierarchicalKey,
        value: &[u8],
        topic: Option<&str>,
    ) -> Result<(), Error> {
        let delta = self.inner.set.create_delta_to_add(key.as_str(), value);
        let topics = self.topics_for(topic);
        self.publish_delta(delta, &topics).await.map(|_| ())
    }

    /// The current value for `key`; reads local state only.
    #[instrument(name = "store::get", skip_all)]
    pub fn get(&self, key: &HierarchicalKey) -> Result<Vec<u8>, Error> {
        self.inner.set.element(key.as_str())
    }

    #[instrument(name = "store::has", skip_all)]
    pub fn has(&self, key: &HierarchicalKey) -> Result<bool, Error> {
        self.inner.set.is_value_in_set(key.as_str())
    }

    /// Tombstones every live instance of `key`. Removing an absent key is a
    /// no-op that publishes nothing.
    #[instrument(name = "store::remove", skip_all)]
    pub async fn remove(&self, key: &HierarchicalKey) -> Result<(), Error> {
        self.inner.ensure_running()?;
        let delta = self.inner.set.create_delta_to_remove(key.as_str())?;
        if delta.tombstones.is_empty() {
            return Ok(());
        }
        let topics = self.topics_for(None);
        self.publish_delta(delta, &topics).await.map(|_| ())
    }

    /// Every observable `(key, value)` pair under `prefix`, as one
    /// consistent snapshot.
    #[instrument(name = "store::query", skip_all)]
    pub fn query_key_values(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        self.inner.set.snapshot_query(prefix)
    }

    /// Prefix query with a segment filter right after `prefix_base`:
    /// `middle` is matched against the first segment of the remainder and
    /// may be a literal, `"*"` (any) or `"!x"` (anything but `x`); the rest
    /// of the key must then start with `remainder`. An empty `middle`
    /// disables filtering.
    #[instrument(name = "store::query_filtered", skip_all)]
    pub fn query_key_values_filtered(
        &self,
        prefix_base: &str,
        middle: &str,
        remainder: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let all = self.inner.set.snapshot_query(prefix_base)?;
        if middle.is_empty() {
            return Ok(all);
        }
        let remainder = remainder.strip_prefix('/').unwrap_or(remainder);
        Ok(all
            .into_iter()
            .filter(|(key, _)| {
                let rest = &key[prefix_base.len()..];
                let rest = rest.strip_prefix('/').unwrap_or(rest);
                let (segment, tail) = match rest.split_once('/') {
                    Some((segment, tail)) => (segment, tail),
                    None => (rest, ""),
                };
                let segment_matches = if middle == "*" {
                    true
                } else if let Some(negated) = middle.strip_prefix('!') {
                    segment != negated
                } else {
                    segment == middle
                };
                segment_matches && tail.starts_with(remainder)
            })
            .collect())
    }

    /// Starts an atomic multi-key transaction against this store.
    pub fn begin_transaction(&self) -> AtomicTransaction<D, B> {
        AtomicTransaction::new(self.clone())
    }

    /// Registers a topic that `put`/`remove`/`commit` publish under when the
    /// caller names none. Heads published without any topic are not
    /// rebroadcast; register an explicit topic when rebroadcast recovery
    /// matters.
    pub fn add_broadcast_topic(&self, topic: &str) {
        lock(&self.inner.broadcast_topics).push(topic.to_string());
    }

    /// Accepts inbound broadcasts on `topic` in addition to whatever the
    /// broadcaster itself is subscribed to.
    pub fn add_listen_topic(&self, topic: &str) {
        lock(&self.inner.listen_topics).insert(topic.to_string());
    }

    /// Shuts down the receiver, rebroadcaster and workers and waits for them
    /// to exit. Idempotent; publishing operations fail afterwards.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing crdt datastore");
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("background task failed during shutdown: {e}");
            }
        }
        Ok(())
    }

    fn topics_for(&self, topic: Option<&str>) -> Vec<String> {
        match topic {
            Some(t) => vec![t.to_string()],
            None => lock(&self.inner.broadcast_topics).clone(),
        }
    }

    pub(crate) fn set(&self) -> &AddWinsSet {
        &self.inner.set
    }

    pub(crate) fn max_batch_delta_size(&self) -> usize {
        self.inner.options.max_batch_delta_size
    }

    pub(crate) fn default_broadcast_topics(&self) -> Vec<String> {
        lock(&self.inner.broadcast_topics).clone()
    }

    pub(crate) fn ensure_running(&self) -> Result<(), Error> {
        self.inner.ensure_running()
    }

    /// Publish pipeline entry shared by put/remove and transactions: one DAG
    /// node, applied locally, announced on every topic in `topics` (or the
    /// default when empty).
    pub(crate) async fn publish_delta(
        &self,
        delta: Delta,
        topics: &[String],
    ) -> Result<Cid, Error> {
        self.inner.ensure_running()?;
        self.inner.publish(delta, topics).await
    }
}

impl<D, B> Inner<D, B>
where
    D: DagSyncer,
    B: Broadcaster,
{
    fn ensure_running(&self) -> Result<(), Error> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialised)
        }
    }

    async fn publish(&self, delta: Delta, topics: &[String]) -> Result<Cid, Error> {
        let cid = self
            .add_dag_node(delta, topics.first().map(String::as_str))
            .await?;
        // The node is durable and applied; a failed announce only delays
        // convergence until the next rebroadcast.
        if topics.is_empty() {
            if let Err(e) = self.broadcast(&[cid], None).await {
                warn!(%cid, "broadcast failed after local apply: {e}");
            }
        } else {
            for topic in topics {
                if let Err(e) = self.broadcast(&[cid], Some(topic)).await {
                    warn!(%cid, topic = %topic, "broadcast failed after local apply: {e}");
                }
            }
        }
        Ok(cid)
    }

    /// Builds a node over the current heads, writes it durably, and applies
    /// it locally before any announcement.
    async fn add_dag_node(&self, mut delta: Delta, topic: Option<&str>) -> Result<Cid, Error> {
        let (heads, max_height) = self.heads.list();
        // Minimum priority is 1.
        delta.priority = max_height + 1;
        let priority = delta.priority;
        let node = LinkedDelta::new(heads, delta);
        let block = node.to_block()?;
        let cid = *block.cid();
        self.dag.add_node(block).await?;

        debug!(%cid, priority, "processing generated block");
        let children = self.process_node(&cid, priority, cid, &node, topic).await?;
        if !children.is_empty() {
            error!(%cid, "created a block with unknown children");
        }
        Ok(cid)
    }

    async fn broadcast(&self, cids: &[Cid], topic: Option<&str>) -> Result<(), Error> {
        if cids.is_empty() {
            return Ok(());
        }
        let payload = encode_broadcast(cids)?;
        self.broadcaster.broadcast(payload, topic).await
    }

    fn is_listening(&self, topic: &str) -> bool {
        lock(&self.listen_topics).contains(topic) || self.broadcaster.has_topic(topic)
    }

    async fn handle_broadcast(&self, payload: &[u8], topic: &str) {
        if !self.is_listening(topic) {
            debug!(topic, "ignoring broadcast on unsubscribed topic");
            return;
        }
        let cids = match decode_broadcast(payload) {
            Ok(cids) => cids,
            Err(e) => {
                error!("unable to decode broadcast: {e}");
                return;
            }
        };
        for cid in cids {
            if let Err(e) = self.handle_block(cid, topic).await {
                error!(%cid, "unable to handle block: {e}");
                continue;
            }
            lock(&self.seen_heads).insert(cid);
        }
    }

    /// Vets one announced head: already-processed and locally-known blocks
    /// are skipped, anything else becomes a fetch job.
    async fn handle_block(&self, cid: Cid, topic: &str) -> Result<(), Error> {
        if lock(&self.processed).contains(&cid) {
            return Ok(());
        }
        if self.dag.has_block(&cid).await? {
            lock(&self.processed).mark(cid);
            return Ok(());
        }
        if !lock(&self.processed).begin(cid) {
            return Ok(());
        }
        self.enqueue(DagJob {
            cid,
            root: cid,
            root_priority: 0,
            topic: Some(topic.to_string()),
        })
    }

    fn enqueue(&self, job: DagJob) -> Result<(), Error> {
        self.jobs.send(job).map_err(|_| Error::NotInitialised)
    }

    async fn process_job(&self, job: &DagJob) -> Result<(), Error> {
        let block = self.fetch_node(&job.cid).await?;
        let node = LinkedDelta::from_block(&block)?;
        // The delta's own priority is authoritative when replaying fetched
        // nodes; the computed head height only applies to local publishes.
        let root_priority = if job.root_priority == 0 {
            node.delta.priority
        } else {
            job.root_priority
        };
        let children = self
            .process_node(
                &job.root,
                root_priority,
                *block.cid(),
                &node,
                job.topic.as_deref(),
            )
            .await?;
        lock(&self.processed).finish(job.cid);
        // Traversal jobs are enqueued unconditionally: a link claimed by its
        // own announcement still needs this root's head update, and merges
        // are idempotent. Only inbound announcements are deduplicated.
        for child in children {
            debug!(cid = %child, root = %job.root, "traversing link");
            self.enqueue(DagJob {
                cid: child,
                root: job.root,
                root_priority,
                topic: job.topic.clone(),
            })?;
        }
        Ok(())
    }

    async fn fetch_node(&self, cid: &Cid) -> Result<Block, Error> {
        let timeout = self.options.dag_syncer_timeout;
        let fetch = self.dag.fetch_graph_on_depth(cid, 1);
        if timeout.is_zero() {
            fetch.await
        } else {
            tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| Error::DagFetch(format!("timed out fetching {cid}")))?
        }
    }

    /// Merges one node's delta and updates the head frontier for `root`,
    /// returning the links that still need traversal. The DAG mutex keeps
    /// the merge + head update atomic against concurrent publishes.
    async fn process_node(
        &self,
        root: &Cid,
        root_priority: u64,
        current: Cid,
        node: &LinkedDelta,
        topic: Option<&str>,
    ) -> Result<Vec<Cid>, Error> {
        let _guard = self.dag_mutex.lock().await;
        self.set.merge(&node.delta, &current.to_string())?;
        if node.delta.priority % 10 == 0 {
            info!(%current, priority = node.delta.priority, "merged delta");
        }

        let mut children = Vec::new();
        if node.prev.is_empty() {
            self.heads.add(root, root_priority, topic)?;
        } else {
            for link in &node.prev {
                if self.heads.is_head(link) {
                    self.heads.replace(link, root, root_priority, topic)?;
                    lock(&self.processed).mark(*link);
                } else if self.dag.has_block(link).await? {
                    // Known ancestry: the new node extends it without
                    // needing traversal.
                    self.heads.add(root, root_priority, topic)?;
                    lock(&self.processed).mark(*link);
                } else {
                    children.push(*link);
                }
            }
        }
        lock(&self.processed).mark(current);
        Ok(children)
    }

    async fn rebroadcast_heads(&self) {
        let (heads, _) = self.heads.list();
        let mut groups: HashMap<String, Vec<Cid>> = HashMap::new();
        for cid in heads {
            let topic = self.heads.topic(&cid).unwrap_or_default();
            groups.entry(topic).or_default().push(cid);
        }
        for (topic, cids) in groups {
            if topic.is_empty() {
                // Heads published without an explicit topic stay quiet
                // rather than flooding the default channel.
                debug!(count = cids.len(), "skipping rebroadcast of topicless heads");
                continue;
            }
            debug!(topic = %topic, count = cids.len(), "rebroadcasting heads");
            if let Err(e) = self.broadcast(&cids, Some(&topic)).await {
                error!(topic = %topic, "head rebroadcast failed: {e}");
            }
        }
        lock(&self.seen_heads).clear();
    }
}

/// Pulls inbound envelopes until the transport finishes or shutdown is
/// signalled. Holds the store weakly, upgrading per message.
async fn receive_loop<D, B>(
    weak: Weak<Inner<D, B>>,
    broadcaster: Arc<B>,
    mut shutdown: watch::Receiver<bool>,
) where
    D: DagSyncer,
    B: Broadcaster,
{
    debug!("broadcast receiver started");
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = broadcaster.next() => message,
        };
        match message {
            Ok(Some((payload, topic))) => {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                inner.handle_broadcast(&payload, &topic).await;
            }
            Ok(None) => {
                debug!("broadcaster finished");
                break;
            }
            Err(e) => {
                warn!("failed to receive broadcast: {e}");
            }
        }
    }
    debug!("broadcast receiver finished");
}

async fn rebroadcast_loop<D, B>(
    weak: Weak<Inner<D, B>>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    D: DagSyncer,
    B: Broadcaster,
{
    debug!("head rebroadcaster started");
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        inner.rebroadcast_heads().await;
    }
    debug!("head rebroadcaster finished");
}

/// One member of the DAG worker pool: drains the shared job queue, upgrading
/// the weak store reference for the duration of each job.
async fn worker_loop<D, B>(
    weak: Weak<Inner<D, B>>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<DagJob>>>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) where
    D: DagSyncer,
    B: Broadcaster,
{
    debug!(worker, "dag worker started");
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        debug!(worker, cid = %job.cid, priority = job.root_priority, "processing dag job");
        if let Err(e) = inner.process_job(&job).await {
            error!(worker, cid = %job.cid, "failed to process node: {e}");
            lock(&inner.processed).abandon(&job.cid);
        }
    }
    debug!(worker, "dag worker finished");
}
