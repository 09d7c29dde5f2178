use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::handler::OutgoingSlot;
use openlcb_core::node::{Node, NodeFlags};
use openlcb_defs::Mti;
use openlcb_network::iface::Interface;
use openlcb_persistence::ConfigurationStorage;
use openlcb_svc_all::traction::TrainControl;

use crate::Services;

/// The message currently being walked through the handlers.
///
/// An addressed message visits its destination node once; a global
/// message visits every initialized node in turn. `enumerate` keeps the
/// same handler running across polls while it splits a long reply.
pub(crate) struct DispatchState {
    handle: Handle,
    node_index: usize,
    addressed: bool,
}

fn next_initialized(nodes: &[Node], from: usize) -> Option<usize> {
    nodes[from..]
        .iter()
        .position(|node| node.is_initialized())
        .map(|offset| from + offset)
}

/// One dispatcher step: pick up the next assembled message if idle,
/// run one handler call, move its reply to the transmit queue.
pub(crate) fn dispatch<S: ConfigurationStorage>(
    nodes: &mut [Node],
    pool: &mut Pool,
    iface: &mut Interface,
    storage: &mut S,
    services: &mut Services,
    active: &mut Option<DispatchState>,
    train: Option<&mut dyn TrainControl>,
) -> bool {
    if active.is_none() {
        let Some(handle) = iface.pop_received() else {
            return false;
        };
        let msg = pool.get(handle);
        let addressed = msg.is_addressed();
        let node_index = if addressed {
            let dest = msg.dest_alias;
            match nodes
                .iter()
                .position(|node| node.alias == dest && node.is_permitted())
            {
                Some(index) => index,
                None => {
                    // Not one of ours after all; drop silently.
                    pool.free(handle);
                    return true;
                }
            }
        } else {
            match next_initialized(nodes, 0) {
                Some(index) => index,
                None => {
                    pool.free(handle);
                    return true;
                }
            }
        };
        // An in-flight datagram stays attached to its node until the
        // acknowledgement went out, so a relogin can reclaim it.
        if addressed && pool.get(handle).mti == Mti::Datagram {
            let node = &mut nodes[node_index];
            if let Some(previous) = node.last_received_datagram.take() {
                pool.free(previous);
            }
            pool.inc_ref(handle);
            node.last_received_datagram = Some(handle);
        }
        *active = Some(DispatchState {
            handle,
            node_index,
            addressed,
        });
    }

    let state = active.as_mut().expect("dispatch state");
    let handle = state.handle;
    let node = &mut nodes[state.node_index];
    let mut out = OutgoingSlot::new();

    route(services, node, pool, storage, handle, &mut out, train);

    // Replies leave before the next message is dispatched; a reply
    // datagram additionally waits for its acknowledgement.
    if let Some(reply) = out.take() {
        let is_datagram = pool.get(reply).mti == Mti::Datagram;
        if is_datagram {
            if let Some(previous) = node.pending_datagram.take() {
                pool.free(previous);
            }
            pool.inc_ref(reply);
            pool.get_mut(reply).timer_ticks = 0;
            node.pending_datagram = Some(reply);
            node.datagram_resend_count = 0;
        }
        if iface.send(reply).is_err() {
            pool.free(reply);
            if is_datagram {
                if let Some(previous) = node.pending_datagram.take() {
                    pool.free(previous);
                }
            }
        }
    }

    // A rejected-with-resend datagram goes out again from its pending
    // slot.
    if node.flags.contains(NodeFlags::RESEND_DATAGRAM) {
        node.flags.remove(NodeFlags::RESEND_DATAGRAM);
        if let Some(pending) = node.pending_datagram {
            pool.inc_ref(pending);
            pool.get_mut(pending).timer_ticks = 0;
            if iface.send(pending).is_err() {
                pool.free(pending);
            }
        }
    }

    if out.enumerate {
        // Same handler again on the next pass.
        return true;
    }

    let finished = if state.addressed {
        true
    } else {
        match next_initialized(nodes, state.node_index + 1) {
            Some(index) => {
                state.node_index = index;
                false
            }
            None => true,
        }
    };
    if finished {
        let node = &mut nodes[state.node_index];
        if node.last_received_datagram == Some(handle) {
            node.last_received_datagram = None;
            pool.free(handle);
        }
        pool.free(handle);
        *active = None;
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn route<S: ConfigurationStorage>(
    services: &mut Services,
    node: &mut Node,
    pool: &mut Pool,
    storage: &mut S,
    incoming: Handle,
    out: &mut OutgoingSlot,
    train: Option<&mut dyn TrainControl>,
) {
    let mti = pool.get(incoming).mti;
    match mti {
        Mti::VerifyNodeIdGlobal => {
            services
                .mns
                .handle_verify_node_id_global(node, pool, incoming, out)
        }
        Mti::VerifyNodeIdAddressed => {
            services
                .mns
                .handle_verify_node_id_addressed(node, pool, incoming, out)
        }
        Mti::VerifiedNodeId | Mti::VerifiedNodeIdSimple => {
            services.mns.handle_verified_node_id(node, pool, incoming)
        }
        Mti::ProtocolSupportInquiry => {
            services
                .mns
                .handle_protocol_support_inquiry(node, pool, incoming, out)
        }
        Mti::OptionalInteractionRejected => {
            services
                .mns
                .handle_optional_interaction_rejected(node, pool, incoming)
        }
        Mti::TerminateDueToError => {
            services
                .mns
                .handle_terminate_due_to_error(node, pool, incoming)
        }
        // Peer lifecycle announcements need no reply.
        Mti::InitializationComplete
        | Mti::InitializationCompleteSimple
        | Mti::ProtocolSupportReply => {}

        Mti::IdentifyConsumer => {
            services
                .events
                .handle_identify_consumer(node, pool, incoming, out)
        }
        Mti::IdentifyProducer => {
            services
                .events
                .handle_identify_producer(node, pool, incoming, out)
        }
        Mti::IdentifyEventsGlobal | Mti::IdentifyEventsAddressed => {
            services
                .events
                .handle_identify_events(node, pool, incoming, out)
        }
        Mti::LearnEvent => services.events.handle_learn_event(node, pool, incoming),
        Mti::PcEventReport | Mti::PcEventReportWithPayload => {
            services.events.handle_pc_event_report(node, pool, incoming)
        }
        Mti::ConsumerIdentifiedValid
        | Mti::ConsumerIdentifiedInvalid
        | Mti::ConsumerIdentifiedReserved
        | Mti::ConsumerIdentifiedUnknown => {
            services
                .events
                .handle_consumer_identified(node, pool, incoming)
        }
        Mti::ProducerIdentifiedValid
        | Mti::ProducerIdentifiedInvalid
        | Mti::ProducerIdentifiedReserved
        | Mti::ProducerIdentifiedUnknown => {
            services
                .events
                .handle_producer_identified(node, pool, incoming)
        }
        Mti::ConsumerRangeIdentified => {
            services
                .events
                .handle_consumer_range_identified(node, pool, incoming)
        }
        Mti::ProducerRangeIdentified => {
            services
                .events
                .handle_producer_range_identified(node, pool, incoming)
        }

        Mti::SimpleNodeInfoRequest => services.mns.handle_simple_node_info_request(
            node, pool, storage, incoming, out,
        ),
        Mti::SimpleNodeInfoReply => {
            services
                .mns
                .handle_simple_node_info_reply(node, pool, incoming)
        }

        Mti::Datagram => services
            .config
            .handle_datagram(node, pool, storage, incoming, out),
        Mti::DatagramReceivedOk => {
            services
                .config
                .handle_datagram_received_ok(node, pool, incoming)
        }
        Mti::DatagramRejected => {
            services
                .config
                .handle_datagram_rejected(node, pool, incoming)
        }

        Mti::StreamInitiateRequest => {
            services
                .stream
                .handle_initiate_request(node, pool, incoming, out)
        }
        Mti::StreamInitiateReply => {
            services.stream.handle_initiate_reply(node, pool, incoming)
        }
        Mti::StreamDataSend => services.stream.handle_data_send(node, pool, incoming, out),
        Mti::StreamDataProceed => services.stream.handle_data_proceed(node, pool, incoming),
        Mti::StreamDataComplete => {
            services.stream.handle_data_complete(node, pool, incoming)
        }

        Mti::TractionControlCommand => {
            services
                .traction
                .handle_command(node, pool, train, incoming, out)
        }
        Mti::TractionControlReply => services.traction.handle_reply(node, pool, incoming),

        Mti::Unknown(_) => {
            if pool.get(incoming).is_addressed() {
                services.mns.reject_unknown_mti(node, pool, incoming, out);
            }
        }
    }
}
