// The DagCbor derive macro (libipld-cbor-derive 0.14) expands to code that
// trips this future-compat lint under current rustc; the generated code's
// behavior is unaffected by the never-type fallback change.
#![allow(dependency_on_unit_never_type_fallback)]
//! Replicated, content-addressed key-value store over a Merkle-CRDT.
//!
//! Local mutations become immutable DAG-CBOR nodes linking the previous
//! heads; replicas gossip head CIDs and converge through an add-wins
//! observed-remove set with a priority-ordered last-writer-wins value per
//! key. Block transport and pub/sub live behind the [`DagSyncer`] and
//! [`Broadcaster`] traits.

pub mod broadcast;
pub mod config;
pub mod dag;
pub mod delta;
pub mod error;
pub mod heads;
pub mod key;
pub mod set;
pub mod storage;
pub mod store;
pub mod transaction;

pub use broadcast::{decode_broadcast, encode_broadcast, Broadcaster};
pub use config::{DeleteHook, Options, PutHook};
pub use dag::{Block, DagSyncer, LinkedDelta};
pub use delta::{delta_merge, Delta, Element};
pub use error::Error;
pub use heads::HeadStore;
pub use key::HierarchicalKey;
pub use libipld::cid::Cid;
pub use set::AddWinsSet;
pub use storage::StateStore;
pub use store::Store;
pub use transaction::AtomicTransaction;
