use async_trait::async_trait;
use libipld::cbor::DagCborCodec;
use libipld::cid::Cid;
use libipld::codec::Encode;
use libipld::multihash::Code;
use libipld::store::DefaultParams;
use libipld::DagCbor;

use crate::delta::Delta;
use crate::error::Error;

pub type Block = libipld::block::Block<DefaultParams>;

pub fn to_block<T: Encode<DagCborCodec>>(data: &T) -> Result<Block, Error> {
    Block::encode(DagCborCodec, Code::Blake3_256, data).map_err(Error::codec)
}

/// A Merkle-DAG node: one serialized delta plus links to the heads the
/// publisher saw at publication time. The block's CID is deterministic over
/// the DAG-CBOR form, so replicas agree on node identity.
#[derive(DagCbor, Debug, Clone, PartialEq, Eq)]
pub struct LinkedDelta {
    /// Previous heads.
    pub prev: Vec<Cid>,
    pub delta: Delta,
}

impl LinkedDelta {
    pub fn new(prev: Vec<Cid>, delta: Delta) -> Self {
        Self { prev, delta }
    }

    pub fn to_block(&self) -> Result<Block, Error> {
        to_block(self)
    }

    pub fn from_block(block: &Block) -> Result<Self, Error> {
        block.decode::<DagCborCodec, Self>().map_err(Error::codec)
    }
}

/// An IPLD-style p2p block layer: durable local writes plus the ability to
/// retrieve nodes published by other replicas.
#[async_trait]
pub trait DagSyncer: Send + Sync {
    /// Durably store a node. Must complete before its CID is announced.
    async fn add_node(&self, block: Block) -> Result<(), Error>;

    /// Retrieve a node, fetching from the network if necessary.
    async fn get_node(&self, cid: &Cid) -> Result<Block, Error>;

    /// Whether the block is locally available.
    async fn has_block(&self, cid: &Cid) -> Result<bool, Error>;

    /// Retrieve `cid` while prefetching its ancestry up to `depth` links, to
    /// save per-link round-trips on deep traversals.
    async fn fetch_graph_on_depth(&self, cid: &Cid, depth: u64) -> Result<Block, Error>;
}
