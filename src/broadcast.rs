use async_trait::async_trait;
use bincode::Options as _;
use libipld::cid::Cid;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Wire envelope for head announcements: the CIDs in string form.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
struct CrdtBroadcast {
    heads: Vec<String>,
}

fn wire_options() -> impl bincode::Options {
    // The default options reject trailing bytes, which stands in for the
    // unknown-field rejection of the previous protobuf envelope.
    bincode::DefaultOptions::new()
}

pub fn encode_broadcast(heads: &[Cid]) -> Result<Vec<u8>, Error> {
    let msg = CrdtBroadcast {
        heads: heads.iter().map(|c| c.to_string()).collect(),
    };
    Ok(wire_options().serialize(&msg)?)
}

/// Decodes a head announcement. Undecodable CIDs inside a well-formed
/// envelope are skipped; a malformed envelope is an error.
pub fn decode_broadcast(bytes: &[u8]) -> Result<Vec<Cid>, Error> {
    if bytes.is_empty() {
        return Err(Error::Codec("empty broadcast payload".to_string()));
    }
    let msg: CrdtBroadcast = wire_options().deserialize(bytes)?;
    let mut cids = Vec::with_capacity(msg.heads.len());
    for head in &msg.heads {
        match Cid::try_from(head.as_str()) {
            Ok(cid) => cids.push(cid),
            Err(e) => warn!(cid = %head, "skipping undecodable head cid: {e}"),
        }
    }
    Ok(cids)
}

/// Pub/sub transport delivering head announcements between replicas.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Fire-and-forget send to all subscribers of `topic`, or of the
    /// transport's default topic when `None`.
    async fn broadcast(&self, payload: Vec<u8>, topic: Option<&str>) -> Result<(), Error>;

    /// The next inbound envelope and its topic. `Ok(None)` means the
    /// transport is finished and the receive loop should exit cleanly.
    async fn next(&self) -> Result<Option<(Vec<u8>, String)>, Error>;

    /// Whether this transport is subscribed to `topic`.
    fn has_topic(&self, topic: &str) -> bool;
}
