use openlcb_defs::Mti;

use crate::buffer::{Handle, Pool};
use crate::message::PayloadClass;
use crate::node::Node;
use crate::node_id::{Alias, NodeId};

/// The reply slot a protocol handler fills in.
///
/// A handler that wants to answer allocates its reply from the pool,
/// parks the handle here and leaves `enumerate` set while it has more to
/// say about the same incoming message; the dispatcher transmits the
/// reply, then calls the handler again until `enumerate` goes false.
#[derive(Debug, Default)]
pub struct OutgoingSlot {
    handle: Option<Handle>,
    pub enumerate: bool,
}

impl OutgoingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a reply. Replacing an untaken reply is a handler bug.
    pub fn set(&mut self, handle: Handle) {
        debug_assert!(self.handle.is_none());
        self.handle = Some(handle);
    }

    pub fn take(&mut self) -> Option<Handle> {
        self.handle.take()
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }
}

/// Allocate a reply buffer with its header already pointing back at the
/// peer. `None` when the pool is dry; the caller drops the reply and the
/// peer's own retry logic takes over.
pub fn allocate_reply(
    pool: &mut Pool,
    node: &Node,
    peer_alias: Alias,
    peer_id: NodeId,
    class: PayloadClass,
    mti: Mti,
) -> Option<Handle> {
    let handle = pool.allocate(class)?;
    pool.get_mut(handle)
        .load_header(node.alias, node.id, peer_alias, peer_id, mti);
    Some(handle)
}
