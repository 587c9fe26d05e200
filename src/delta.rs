use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::DagCbor;

use crate::error::Error;

/// A single add or remove of the observed-remove set. `id` names the block
/// under which the element instance is filed: empty on freshly created add
/// deltas (the publishing block's CID is not known yet), and the instance id
/// being shadowed on tombstones.
#[derive(DagCbor, Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub key: String,
    pub value: Vec<u8>,
    pub id: String,
}

/// An atomic bundle of add-elements and tombstones sharing one priority.
#[derive(DagCbor, Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub priority: u64,
    pub elements: Vec<Element>,
    pub tombstones: Vec<Element>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.tombstones.is_empty()
    }
}

/// Deterministic wire form of a delta (DAG-CBOR).
pub fn encode(delta: &Delta) -> Result<Vec<u8>, Error> {
    DagCborCodec.encode(delta).map_err(Error::codec)
}

pub fn decode(bytes: &[u8]) -> Result<Delta, Error> {
    DagCborCodec.decode(bytes).map_err(Error::codec)
}

/// Concatenates elements and tombstones and keeps the highest priority.
pub fn delta_merge(a: &Delta, b: &Delta) -> Delta {
    Delta {
        priority: a.priority.max(b.priority),
        elements: a.elements.iter().chain(b.elements.iter()).cloned().collect(),
        tombstones: a
            .tombstones
            .iter()
            .chain(b.tombstones.iter())
            .cloned()
            .collect(),
    }
}
