#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Event transport.

Producer/consumer identification, the identify sweeps, event learning
and the report messages, including the with-payload variant. Range
membership is decoded from the trailing-ones encoding.
*/

#[cfg(test)]
extern crate alloc;

use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::event::{EventId, EventState};
use openlcb_core::handler::{allocate_reply, OutgoingSlot};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::Node;
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::Mti;

/// The event transport handler.
#[derive(Default)]
pub struct Service {
    /// A consumed event arrived: (node, event, report payload).
    pub on_consumed_event: Option<fn(&mut Node, EventId, &[u8])>,
    /// A Learn Event message: the application decides what to store.
    pub on_learn_event: Option<fn(&mut Node, EventId)>,
    /// Peers describing their event interest.
    pub on_consumer_identified: Option<fn(Alias, EventId, EventState)>,
    pub on_producer_identified: Option<fn(Alias, EventId, EventState)>,
    pub on_consumer_range_identified: Option<fn(Alias, EventId)>,
    pub on_producer_range_identified: Option<fn(Alias, EventId)>,
}

fn incoming_event(pool: &Pool, incoming: Handle) -> Option<(Alias, NodeId, EventId)> {
    let msg = pool.get(incoming);
    if msg.payload.len() < 8 {
        return None;
    }
    Some((msg.source_alias, msg.source_id, msg.event_id_at(0)))
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identify Consumer: answer when the event is in our consumer list
    /// or inside a declared consumer range.
    pub fn handle_identify_consumer(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let Some((_, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        let Some(state) = node.consumes(event_id) else {
            return;
        };
        emit_identified(node, pool, state.consumer_identified_mti(), event_id, out);
    }

    /// Identify Producer, the mirror image.
    pub fn handle_identify_producer(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let Some((_, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        let Some(state) = node.produces(event_id) else {
            return;
        };
        emit_identified(node, pool, state.producer_identified_mti(), event_id, out);
    }

    /// Identify Events: enumerate every producer, then every consumer,
    /// one identified message per call. The dispatcher keeps calling
    /// while `out.enumerate` stays set.
    pub fn handle_identify_events(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        _incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        if !node.producers.enumerating && !node.consumers.enumerating {
            node.producers.start_enumeration();
        }

        if node.producers.enumerating {
            let index = node.producers.enum_index;
            if let Some(slot) = node.producers.get(index).copied() {
                if emit_identified(
                    node,
                    pool,
                    slot.state.producer_identified_mti(),
                    slot.id,
                    out,
                ) {
                    node.producers.enum_index += 1;
                }
                out.enumerate = true;
                return;
            }
            node.producers.stop_enumeration();
            node.consumers.start_enumeration();
        }

        let index = node.consumers.enum_index;
        if let Some(slot) = node.consumers.get(index).copied() {
            if emit_identified(
                node,
                pool,
                slot.state.consumer_identified_mti(),
                slot.id,
                out,
            ) {
                node.consumers.enum_index += 1;
            }
            out.enumerate = true;
            return;
        }
        node.consumers.stop_enumeration();
        out.enumerate = false;
    }

    /// Learn Event: forwarded to the application.
    pub fn handle_learn_event(&self, node: &mut Node, pool: &mut Pool, incoming: Handle) {
        let Some((_, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        if let Some(callback) = self.on_learn_event {
            callback(node, event_id);
        }
    }

    /// PC Event Report, with or without payload: deliver to the
    /// application when we consume the event.
    pub fn handle_pc_event_report(&self, node: &mut Node, pool: &mut Pool, incoming: Handle) {
        let Some((_, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        if node.consumes(event_id).is_none() {
            return;
        }
        if let Some(index) = node.consumers.find(event_id) {
            node.consumers.set_state(index, EventState::Valid);
        }
        if let Some(callback) = self.on_consumed_event {
            // Payload octets follow the eight-octet event id.
            let payload = &pool.get(incoming).payload.as_slice()[8..];
            callback(node, event_id, payload);
        }
    }

    pub fn handle_consumer_identified(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let Some((peer, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        let mti = pool.get(incoming).mti;
        let Some(state) = EventState::from_identified_mti(mti) else {
            return;
        };
        if let Some(callback) = self.on_consumer_identified {
            callback(peer, event_id, state);
        }
    }

    pub fn handle_producer_identified(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let Some((peer, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        let mti = pool.get(incoming).mti;
        let Some(state) = EventState::from_identified_mti(mti) else {
            return;
        };
        if let Some(callback) = self.on_producer_identified {
            callback(peer, event_id, state);
        }
    }

    pub fn handle_consumer_range_identified(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let Some((peer, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        if let Some(callback) = self.on_consumer_range_identified {
            callback(peer, event_id);
        }
    }

    pub fn handle_producer_range_identified(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let Some((peer, _, event_id)) = incoming_event(pool, incoming) else {
            return;
        };
        if let Some(callback) = self.on_producer_range_identified {
            callback(peer, event_id);
        }
    }
}

/// Emit one Producer/Consumer-Identified message. Returns whether the
/// message was parked for transmission.
fn emit_identified(
    node: &Node,
    pool: &mut Pool,
    mti: Mti,
    event_id: EventId,
    out: &mut OutgoingSlot,
) -> bool {
    if out.is_valid() {
        // Still waiting for the previous reply to drain.
        return false;
    }
    let Some(handle) = allocate_reply(
        pool,
        node,
        Alias::NULL,
        NodeId::NULL,
        PayloadClass::Basic,
        mti,
    ) else {
        return false;
    };
    pool.get_mut(handle).set_event_id(0, event_id).unwrap();
    out.set(handle);
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use openlcb_core::node::{
        AddressSpace, ConfigurationOptions, NodeFlags, NodeParameters, RunState, SnipIdent,
    };
    use openlcb_defs::ProtocolSupport;

    static SPACES: [AddressSpace; 1] = [AddressSpace::read_write(0xFD, 0x100, "")];

    static PRODUCERS: [EventId; 2] = [
        EventId::from_u64(0x0501_0101_0707_0001),
        EventId::from_u64(0x0501_0101_0707_0002),
    ];
    static CONSUMERS: [EventId; 1] = [EventId::from_u64(0x0501_0101_0707_0003)];
    static CONSUMER_RANGES: [EventId; 1] = [EventId::from_u64(0x0501_0101_0800_00FF)];

    static PARAMS: NodeParameters = NodeParameters {
        snip: SnipIdent {
            manufacturer: "Basic OpenLcb Node",
            model: "Test",
            hardware_version: "0.0.1",
            software_version: "0.0.1",
        },
        protocol_support: ProtocolSupport::SIMPLE.union(ProtocolSupport::EVENT_EXCHANGE),
        configuration_options: ConfigurationOptions {
            write_under_mask: false,
            unaligned_reads: true,
            unaligned_writes: true,
            read_manufacturer_acdi: false,
            read_user_acdi: false,
            write_user_acdi: false,
            stream_read_write: false,
            high_address_space: 0xFF,
            low_address_space: 0xEF,
            description: "",
        },
        address_spaces: &SPACES,
        cdi: b"",
        producer_events: &PRODUCERS,
        consumer_events: &CONSUMERS,
        producer_ranges: &[],
        consumer_ranges: &CONSUMER_RANGES,
    };

    fn test_node() -> Node {
        let mut node = Node::new(NodeId::from_u64(0x0501_0101_0707), &PARAMS);
        node.alias = Alias::new(0x6BE);
        node.flags = NodeFlags::PERMITTED | NodeFlags::INITIALIZED;
        node.run_state = RunState::Run;
        node
    }

    fn incoming(pool: &mut Pool, mti: Mti, payload: &[u8]) -> Handle {
        let handle = pool.allocate(PayloadClass::Basic).unwrap();
        let msg = pool.get_mut(handle);
        msg.load_header(Alias::new(0xAAA), NodeId::NULL, Alias::NULL, NodeId::NULL, mti);
        msg.payload.extend_from_slice(payload).unwrap();
        handle
    }

    #[test]
    fn test_identify_producer_answers_with_state_mti() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut out = OutgoingSlot::new();
        node.producers.set_state(0, EventState::Valid);

        let incoming = incoming(
            &mut pool,
            Mti::IdentifyProducer,
            PRODUCERS[0].as_bytes(),
        );
        service.handle_identify_producer(&mut node, &mut pool, incoming, &mut out);

        let reply = pool.get(out.take().unwrap());
        assert_eq!(reply.mti, Mti::ProducerIdentifiedValid);
        assert_eq!(reply.event_id_at(0), PRODUCERS[0]);
    }

    #[test]
    fn test_identify_consumer_matches_range() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut out = OutgoingSlot::new();

        // Inside the declared 256-event range.
        let queried = EventId::from_u64(0x0501_0101_0800_0042);
        let incoming = incoming(&mut pool, Mti::IdentifyConsumer, queried.as_bytes());
        service.handle_identify_consumer(&mut node, &mut pool, incoming, &mut out);

        let reply = pool.get(out.take().unwrap());
        assert_eq!(reply.mti, Mti::ConsumerIdentifiedUnknown);
        assert_eq!(reply.event_id_at(0), queried);
    }

    #[test]
    fn test_identify_unknown_event_is_silent() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut out = OutgoingSlot::new();

        let incoming = incoming(
            &mut pool,
            Mti::IdentifyConsumer,
            EventId::from_u64(0xFFFF_0000_0000_0000).as_bytes(),
        );
        service.handle_identify_consumer(&mut node, &mut pool, incoming, &mut out);
        assert!(!out.is_valid());
    }

    #[test]
    fn test_identify_events_enumerates_all_lists() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();

        let incoming = incoming(&mut pool, Mti::IdentifyEventsGlobal, &[]);
        let mut seen = alloc::vec::Vec::new();
        loop {
            let mut out = OutgoingSlot::new();
            service.handle_identify_events(&mut node, &mut pool, incoming, &mut out);
            if let Some(handle) = out.take() {
                let msg = pool.get(handle);
                seen.push((msg.mti, msg.event_id_at(0)));
                pool.free(handle);
            }
            if !out.enumerate {
                break;
            }
        }

        assert_eq!(
            seen,
            alloc::vec![
                (Mti::ProducerIdentifiedUnknown, PRODUCERS[0]),
                (Mti::ProducerIdentifiedUnknown, PRODUCERS[1]),
                (Mti::ConsumerIdentifiedUnknown, CONSUMERS[0]),
            ]
        );
    }

    #[test]
    fn test_event_report_updates_state_and_calls_back() {
        fn on_event(_node: &mut Node, _id: EventId, _data: &[u8]) {}

        let mut service = Service::new();
        service.on_consumed_event = Some(on_event);
        let mut pool = Pool::new();
        let mut node = test_node();

        let incoming = incoming(&mut pool, Mti::PcEventReport, CONSUMERS[0].as_bytes());
        service.handle_pc_event_report(&mut node, &mut pool, incoming);
        assert_eq!(node.consumes(CONSUMERS[0]), Some(EventState::Valid));
    }

    #[test]
    fn test_report_for_unconsumed_event_ignored() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();

        let incoming = incoming(
            &mut pool,
            Mti::PcEventReport,
            EventId::from_u64(0x1).as_bytes(),
        );
        service.handle_pc_event_report(&mut node, &mut pool, incoming);
        assert_eq!(node.consumers.get(0).unwrap().state, EventState::Unknown);
    }
}
