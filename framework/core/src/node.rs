use bitflags::bitflags;
use heapless::Vec;
use openlcb_defs::ProtocolSupport;

use crate::buffer::Handle;
use crate::config;
use crate::event::{EventId, EventRange, EventState};
use crate::node_id::{Alias, NodeId};

bitflags! {
    /// Per-node condition bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Alias arbitration finished; the alias is ours on this bus.
        const PERMITTED = 0x01;
        /// Initialization Complete has been transmitted.
        const INITIALIZED = 0x02;
        /// Another node on the bus carries our full node id.
        const DUPLICATE_ID_DETECTED = 0x04;
        /// Datagram Received OK already sent for the datagram in hand.
        const DATAGRAM_ACK_SENT = 0x08;
        /// A rejected datagram is waiting for retransmission.
        const RESEND_DATAGRAM = 0x10;
        /// A freeze command put the firmware space in charge.
        const FIRMWARE_UPGRADE_ACTIVE = 0x20;
    }
}

/// Login and run progression. One action is attempted per visit; a state
/// only advances once the driver has accepted its frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunState {
    #[default]
    Init,
    GenerateSeed,
    GenerateAlias,
    SendCid7,
    SendCid6,
    SendCid5,
    SendCid4,
    Wait200ms,
    SendRid,
    SendAmd,
    SendInitializationComplete,
    SendProducerEvents,
    SendConsumerEvents,
    Run,
    /// Parked after a duplicate node id was seen on the bus. Only an
    /// external reset leaves this state.
    Inhibited,
}

/// One address space a node exposes through the memory configuration
/// protocol. The stack enforces these bounds; the storage backend never
/// sees an out-of-range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressSpace {
    pub space: u8,
    pub present: bool,
    pub read_only: bool,
    pub low_address_valid: bool,
    pub low_address: u32,
    pub highest_address: u32,
    pub description: &'static str,
}

impl AddressSpace {
    pub const fn absent(space: u8) -> Self {
        Self {
            space,
            present: false,
            read_only: true,
            low_address_valid: false,
            low_address: 0,
            highest_address: 0,
            description: "",
        }
    }

    pub const fn read_only(space: u8, highest_address: u32, description: &'static str) -> Self {
        Self {
            space,
            present: true,
            read_only: true,
            low_address_valid: false,
            low_address: 0,
            highest_address,
            description,
        }
    }

    pub const fn read_write(space: u8, highest_address: u32, description: &'static str) -> Self {
        Self {
            space,
            present: true,
            read_only: false,
            low_address_valid: false,
            low_address: 0,
            highest_address,
            description,
        }
    }
}

/// Capabilities advertised by the memory configuration OPTIONS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationOptions {
    pub write_under_mask: bool,
    pub unaligned_reads: bool,
    pub unaligned_writes: bool,
    pub read_manufacturer_acdi: bool,
    pub read_user_acdi: bool,
    pub write_user_acdi: bool,
    pub stream_read_write: bool,
    pub high_address_space: u8,
    pub low_address_space: u8,
    pub description: &'static str,
}

/// The four fixed SNIP strings burned into the firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SnipIdent {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub hardware_version: &'static str,
    pub software_version: &'static str,
}

/// Immutable per-node description supplied by the application.
#[derive(Debug, Clone, Copy)]
pub struct NodeParameters {
    pub snip: SnipIdent,
    pub protocol_support: ProtocolSupport,
    pub configuration_options: ConfigurationOptions,
    pub address_spaces: &'static [AddressSpace],
    /// Configuration description info XML served from space 0xFF.
    pub cdi: &'static [u8],
    /// Events announced during login and matched by identify requests.
    pub producer_events: &'static [EventId],
    pub consumer_events: &'static [EventId],
    /// Range encodings, matched but never enumerated one-by-one.
    pub producer_ranges: &'static [EventId],
    pub consumer_ranges: &'static [EventId],
}

impl NodeParameters {
    pub fn address_space(&self, space: u8) -> Option<&AddressSpace> {
        self.address_spaces.iter().find(|s| s.space == space)
    }
}

/// A produced or consumed event and its last known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventSlot {
    pub id: EventId,
    pub state: EventState,
}

/// A node's producer or consumer list with its enumeration cursor. The
/// cursor lets login and Identify-Events emit one message per call.
#[derive(Debug, Default)]
pub struct EventList {
    list: Vec<EventSlot, { config::MAX_EVENTS_PER_LIST }>,
    pub enum_index: usize,
    pub enumerating: bool,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: &[EventId]) -> Self {
        let mut list = Self::new();
        for id in ids {
            // Capacity overflow drops the tail; sized by config.
            let _ = list.list.push(EventSlot {
                id: *id,
                state: EventState::Unknown,
            });
        }
        list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&EventSlot> {
        self.list.get(index)
    }

    pub fn find(&self, id: EventId) -> Option<usize> {
        self.list.iter().position(|slot| slot.id == id)
    }

    pub fn set_state(&mut self, index: usize, state: EventState) {
        if let Some(slot) = self.list.get_mut(index) {
            slot.state = state;
        }
    }

    pub fn start_enumeration(&mut self) {
        self.enum_index = 0;
        self.enumerating = true;
    }

    pub fn stop_enumeration(&mut self) {
        self.enum_index = 0;
        self.enumerating = false;
    }
}

/// A logical OpenLCB endpoint. Several may share one process and one CAN
/// segment; each runs its own login and keeps its own protocol state.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub alias: Alias,
    /// Pseudo-random generator state for alias arbitration.
    pub seed: u64,
    pub run_state: RunState,
    pub flags: NodeFlags,
    pub parameters: &'static NodeParameters,
    pub producers: EventList,
    pub consumers: EventList,
    /// Incremented by the 100 ms tick; meaning depends on `run_state`.
    pub timer_ticks: u16,
    /// The datagram being handled, kept for duplicate detection until its
    /// reply went out.
    pub last_received_datagram: Option<Handle>,
    /// A transmitted datagram waiting for Received OK / Rejected.
    pub pending_datagram: Option<Handle>,
    pub datagram_resend_count: u8,
}

impl Node {
    pub fn new(id: NodeId, parameters: &'static NodeParameters) -> Self {
        Self {
            id,
            alias: Alias::NULL,
            seed: 0,
            run_state: RunState::Init,
            flags: NodeFlags::empty(),
            parameters,
            producers: EventList::from_ids(parameters.producer_events),
            consumers: EventList::from_ids(parameters.consumer_events),
            timer_ticks: 0,
            last_received_datagram: None,
            pending_datagram: None,
            datagram_resend_count: 0,
        }
    }

    pub fn is_permitted(&self) -> bool {
        self.flags.contains(NodeFlags::PERMITTED)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.contains(NodeFlags::INITIALIZED)
    }

    /// Drop the alias and every protocol flag, keeping the seed so the
    /// next login arbitrates a different alias. Buffers held by the node
    /// are returned by the caller, which owns the pool.
    pub fn reset_for_relogin(&mut self) {
        self.alias = Alias::NULL;
        self.flags = NodeFlags::empty();
        self.run_state = RunState::GenerateSeed;
        self.timer_ticks = 0;
        self.datagram_resend_count = 0;
        self.producers.stop_enumeration();
        self.consumers.stop_enumeration();
    }

    /// Whether `event_id` names a produced event, directly or via range.
    pub fn produces(&self, event_id: EventId) -> Option<EventState> {
        if let Some(index) = self.producers.find(event_id) {
            return self.producers.get(index).map(|slot| slot.state);
        }
        self.parameters
            .producer_ranges
            .iter()
            .any(|range| EventRange::new(*range).contains(event_id))
            .then_some(EventState::Unknown)
    }

    /// Whether `event_id` names a consumed event, directly or via range.
    pub fn consumes(&self, event_id: EventId) -> Option<EventState> {
        if let Some(index) = self.consumers.find(event_id) {
            return self.consumers.get(index).map(|slot| slot.state);
        }
        self.parameters
            .consumer_ranges
            .iter()
            .any(|range| EventRange::new(*range).contains(event_id))
            .then_some(EventState::Unknown)
    }
}

#[cfg(test)]
pub mod testing {
    //! A minimal parameter block shared by tests across the workspace.

    use super::*;

    pub static TEST_SPACES: [AddressSpace; 4] = [
        AddressSpace::read_only(0xFF, 0x200, "cdi"),
        AddressSpace::read_write(0xFD, 0x100, "config"),
        AddressSpace::read_only(0xFC, 0x7D, ""),
        AddressSpace::read_write(0xFB, 0x80, ""),
    ];

    pub static TEST_PRODUCERS: [EventId; 2] = [
        EventId::from_u64(0x0501_0101_0707_0001),
        EventId::from_u64(0x0501_0101_0707_0002),
    ];

    pub static TEST_CONSUMERS: [EventId; 1] = [EventId::from_u64(0x0501_0101_0707_0003)];

    pub static TEST_PARAMETERS: NodeParameters = NodeParameters {
        snip: SnipIdent {
            manufacturer: "Basic OpenLcb Node",
            model: "Test",
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
        address_spaces: &TEST_SPACES,
        cdi: b"<?xml version=\"1.0\"?><cdi></cdi>\0",
        producer_events: &TEST_PRODUCERS,
        consumer_events: &TEST_CONSUMERS,
        producer_ranges: &[],
        consumer_ranges: &[],
    };
}

#[cfg(test)]
mod test {
    use super::testing::TEST_PARAMETERS;
    use super::*;

    #[test]
    fn test_new_node_starts_uninitialized() {
        let node = Node::new(NodeId::from_u64(0x0501_0101_0707), &TEST_PARAMETERS);
        assert_eq!(node.run_state, RunState::Init);
        assert!(!node.is_permitted());
        assert!(node.alias.is_null());
        assert_eq!(node.producers.len(), 2);
        assert_eq!(node.consumers.len(), 1);
    }

    #[test]
    fn test_relogin_keeps_seed_and_id() {
        let mut node = Node::new(NodeId::from_u64(0x0501_0101_0707), &TEST_PARAMETERS);
        node.seed = 0xDEAD_BEEF;
        node.alias = Alias::new(0x6BE);
        node.flags = NodeFlags::PERMITTED | NodeFlags::INITIALIZED;
        node.run_state = RunState::Run;

        node.reset_for_relogin();
        assert_eq!(node.seed, 0xDEAD_BEEF);
        assert_eq!(node.id, NodeId::from_u64(0x0501_0101_0707));
        assert!(node.alias.is_null());
        assert_eq!(node.run_state, RunState::GenerateSeed);
        assert!(node.flags.is_empty());
    }

    #[test]
    fn test_event_membership() {
        let node = Node::new(NodeId::from_u64(0x0501_0101_0707), &TEST_PARAMETERS);
        assert_eq!(
            node.produces(EventId::from_u64(0x0501_0101_0707_0001)),
            Some(EventState::Unknown)
        );
        assert_eq!(node.produces(EventId::from_u64(0x1)), None);
        assert_eq!(
            node.consumes(EventId::from_u64(0x0501_0101_0707_0003)),
            Some(EventState::Unknown)
        );
    }

    #[test]
    fn test_event_state_tracking() {
        let mut node = Node::new(NodeId::from_u64(0x0501_0101_0707), &TEST_PARAMETERS);
        node.producers.set_state(0, EventState::Valid);
        assert_eq!(
            node.produces(EventId::from_u64(0x0501_0101_0707_0001)),
            Some(EventState::Valid)
        );
    }
}
