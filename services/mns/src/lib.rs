#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Minimum node services.

The protocols every node must speak: node id verification, protocol
support inquiry, the initialization-complete family, optional
interaction rejection, and Simple Node Ident Info.
*/

pub mod message_network;
pub mod snip;

use openlcb_core::node_id::{Alias, NodeId};

/// The minimum-node-services handler.
///
/// Stateless apart from the optional application hooks.
#[derive(Default)]
pub struct Service {
    /// A peer answered a verify with its full node id.
    pub on_verified_node_id: Option<fn(Alias, NodeId)>,
    /// A peer rejected one of our interactions: (peer, code, mti).
    pub on_interaction_rejected: Option<fn(Alias, u16, u16)>,
    /// A peer's SNIP reply arrived: (peer, raw reply octets).
    pub on_simple_node_info: Option<fn(Alias, &[u8])>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use openlcb_core::buffer::{Handle, Pool};
    use openlcb_core::message::PayloadClass;
    use openlcb_core::node::{
        AddressSpace, ConfigurationOptions, Node, NodeFlags, NodeParameters, RunState, SnipIdent,
    };
    use openlcb_core::node_id::{Alias, NodeId};
    use openlcb_defs::{Mti, ProtocolSupport};

    pub static SPACES: [AddressSpace; 2] = [
        AddressSpace::read_only(0xFF, 0x200, "cdi"),
        AddressSpace::read_write(0xFD, 0x100, "config"),
    ];

    pub static PARAMS: NodeParameters = NodeParameters {
        snip: SnipIdent {
            manufacturer: "Basic OpenLcb Node",
            model: "Test",
            hardware_version: "0.0.1",
            software_version: "0.0.1",
        },
        protocol_support: ProtocolSupport::SIMPLE
            .union(ProtocolSupport::DATAGRAM)
            .union(ProtocolSupport::SIMPLE_NODE_INFO),
        configuration_options: ConfigurationOptions {
            write_under_mask: false,
            unaligned_reads: true,
            unaligned_writes: true,
            read_manufacturer_acdi: true,
            read_user_acdi: true,
            write_user_acdi: true,
            stream_read_write: false,
            high_address_space: 0xFF,
            low_address_space: 0xEF,
            description: "",
        },
        address_spaces: &SPACES,
        cdi: b"<cdi/>\0",
        producer_events: &[],
        consumer_events: &[],
        producer_ranges: &[],
        consumer_ranges: &[],
    };

    pub fn test_node() -> Node {
        let mut node = Node::new(NodeId::from_u64(0x0501_0101_0707), &PARAMS);
        node.alias = Alias::new(0x6BE);
        node.flags = NodeFlags::PERMITTED | NodeFlags::INITIALIZED;
        node.run_state = RunState::Run;
        node
    }

    /// An assembled message from peer alias AAA addressed to the node.
    pub fn incoming(pool: &mut Pool, mti: Mti, payload: &[u8]) -> Handle {
        let handle = pool.allocate(PayloadClass::Basic).unwrap();
        let msg = pool.get_mut(handle);
        msg.load_header(
            Alias::new(0xAAA),
            NodeId::NULL,
            Alias::new(0x6BE),
            NodeId::from_u64(0x0501_0101_0707),
            mti,
        );
        msg.payload.extend_from_slice(payload).unwrap();
        handle
    }
}
