use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::handler::{allocate_reply, OutgoingSlot};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::Node;
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::{error, Mti, ProtocolSupport};

use crate::Service;

fn verified_mti(node: &Node) -> Mti {
    if node
        .parameters
        .protocol_support
        .contains(ProtocolSupport::SIMPLE)
    {
        Mti::VerifiedNodeIdSimple
    } else {
        Mti::VerifiedNodeId
    }
}

impl Service {
    /// Verify Node ID (global): answer when unqualified or when the
    /// queried id is ours.
    pub fn handle_verify_node_id_global(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let queried = {
            let msg = pool.get(incoming);
            if msg.payload.len() >= 6 {
                Some(msg.node_id_at(0))
            } else {
                None
            }
        };
        if let Some(id) = queried {
            if id != node.id {
                return;
            }
        }
        self.emit_verified(node, pool, out);
    }

    /// Verify Node ID (addressed): the destination match already
    /// happened, but a mismatched id in the payload is a protocol error.
    pub fn handle_verify_node_id_addressed(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, queried) = {
            let msg = pool.get(incoming);
            let queried = if msg.payload.len() >= 6 {
                Some(msg.node_id_at(0))
            } else {
                None
            };
            (msg.source_alias, msg.source_id, queried)
        };
        if let Some(id) = queried {
            if id != node.id {
                self.reject(
                    node,
                    pool,
                    peer_alias,
                    peer_id,
                    error::INVALID_ARGUMENTS,
                    Mti::VerifyNodeIdAddressed,
                    out,
                );
                return;
            }
        }
        self.emit_verified(node, pool, out);
    }

    fn emit_verified(&self, node: &Node, pool: &mut Pool, out: &mut OutgoingSlot) {
        let Some(handle) = allocate_reply(
            pool,
            node,
            Alias::NULL,
            NodeId::NULL,
            PayloadClass::Basic,
            verified_mti(node),
        ) else {
            return;
        };
        pool.get_mut(handle).set_node_id(0, node.id).unwrap();
        out.set(handle);
    }

    /// A peer told the bus its full id.
    pub fn handle_verified_node_id(&self, _node: &mut Node, pool: &mut Pool, incoming: Handle) {
        let msg = pool.get(incoming);
        if msg.payload.len() < 6 {
            return;
        }
        if let Some(callback) = self.on_verified_node_id {
            callback(msg.source_alias, msg.node_id_at(0));
        }
    }

    /// Protocol Support Inquiry: reply with the node's support mask.
    pub fn handle_protocol_support_inquiry(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id) = {
            let msg = pool.get(incoming);
            (msg.source_alias, msg.source_id)
        };
        let Some(handle) = allocate_reply(
            pool,
            node,
            peer_alias,
            peer_id,
            PayloadClass::Basic,
            Mti::ProtocolSupportReply,
        ) else {
            return;
        };
        let bits = node.parameters.protocol_support.bits();
        let msg = pool.get_mut(handle);
        msg.set_bytes(
            0,
            &[
                (bits >> 16) as u8,
                (bits >> 8) as u8,
                bits as u8,
                0,
                0,
                0,
            ],
        )
        .unwrap();
        out.set(handle);
    }

    pub fn handle_optional_interaction_rejected(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let msg = pool.get(incoming);
        if msg.payload.len() < 4 {
            return;
        }
        if let Some(callback) = self.on_interaction_rejected {
            callback(msg.source_alias, msg.word_at(0), msg.word_at(2));
        }
    }

    pub fn handle_terminate_due_to_error(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let msg = pool.get(incoming);
        let code = if msg.payload.len() >= 2 {
            msg.word_at(0)
        } else {
            error::PERMANENT
        };
        if let Some(callback) = self.on_interaction_rejected {
            callback(msg.source_alias, code, u16::from(Mti::TerminateDueToError));
        }
    }

    /// An addressed message nobody implements: Optional Interaction
    /// Rejected with a not-implemented code.
    pub fn reject_unknown_mti(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, mti) = {
            let msg = pool.get(incoming);
            (msg.source_alias, msg.source_id, msg.mti)
        };
        self.reject(
            node,
            pool,
            peer_alias,
            peer_id,
            error::NOT_IMPLEMENTED_UNKNOWN_MTI,
            mti,
            out,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn reject(
        &self,
        node: &Node,
        pool: &mut Pool,
        peer_alias: Alias,
        peer_id: NodeId,
        code: u16,
        mti: Mti,
        out: &mut OutgoingSlot,
    ) {
        let Some(handle) = allocate_reply(
            pool,
            node,
            peer_alias,
            peer_id,
            PayloadClass::Basic,
            Mti::OptionalInteractionRejected,
        ) else {
            return;
        };
        let msg = pool.get_mut(handle);
        msg.set_word(0, code).unwrap();
        msg.set_word(2, u16::from(mti)).unwrap();
        out.set(handle);
    }
}
