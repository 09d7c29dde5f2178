//! A single node logging into a simulated bus.
//!
//! Real firmware replaces the loopback with an `EmbeddedCan` wrapper
//! around its CAN peripheral and calls `tick` from a 100 ms timer.

use openlcb_core::event::EventId;
use openlcb_core::node::{
    AddressSpace, ConfigurationOptions, Node, NodeParameters, RunState, SnipIdent,
};
use openlcb_core::node_id::NodeId;
use openlcb_defs::ProtocolSupport;
use openlcb_module::Stack;
use openlcb_network::phy::loopback::Loopback;
use openlcb_persistence::RamStorage;

static SPACES: [AddressSpace; 2] = [
    AddressSpace::read_only(0xFF, 0x3F, "cdi"),
    AddressSpace::read_write(0xFD, 0xFF, "configuration"),
];

static PRODUCERS: [EventId; 1] = [EventId::from_u64(0x0501_0101_0707_0001)];

static PARAMETERS: NodeParameters = NodeParameters {
    snip: SnipIdent {
        manufacturer: "Basic OpenLcb Node",
        model: "Example",
        hardware_version: "0.0.1",
        software_version: "0.0.1",
    },
    protocol_support: ProtocolSupport::SIMPLE
        .union(ProtocolSupport::DATAGRAM)
        .union(ProtocolSupport::EVENT_EXCHANGE)
        .union(ProtocolSupport::MEMORY_CONFIGURATION)
        .union(ProtocolSupport::SIMPLE_NODE_INFO)
        .union(ProtocolSupport::CDI),
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
    cdi: b"<?xml version=\"1.0\"?><cdi></cdi>",
    producer_events: &PRODUCERS,
    consumer_events: &[],
    producer_ranges: &[],
    consumer_ranges: &[],
};

fn main() {
    let mut device = Loopback::new();
    let mut nodes = [Node::new(NodeId::from_u64(0x0501_0101_0707), &PARAMETERS)];
    let mut stack = Stack::new(&mut nodes[..], RamStorage::<256, 160>::new());

    // The main loop: poll while there is work, tick at 100 ms. Here the
    // tick is simulated whenever the stack goes idle.
    while stack.node(0).run_state != RunState::Run {
        if !stack.poll(&mut device) {
            stack.tick();
        }
    }

    println!(
        "node {} logged in with alias {}",
        stack.node(0).id,
        stack.node(0).alias
    );
    while let Some(frame) = device.dequeue_tx() {
        print!("sent:");
        for byte in &frame {
            print!(" {byte:02X}");
        }
        println!();
    }

    stack.produce_event(0, PRODUCERS[0]);
    while stack.poll(&mut device) {}
    println!("event report queued: {} frame(s)", device.tx_len());
}
