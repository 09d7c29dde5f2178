/*! Alias arbitration and node login.

A fresh node walks CID7..CID4, waits out 200 ms of bus silence, claims
the alias with RID and AMD, announces itself with Initialization
Complete and then enumerates its producer and consumer events. Every
state performs at most one action per visit and stays put when a queue
or pool is full, so a stalled driver simply retries on the next poll.
*/

use heapless::Deque;
use openlcb_core::buffer::{Fifo, Pool};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::{Node, NodeFlags, RunState};
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::can::{
    CONTROL_AMD, CONTROL_CID4, CONTROL_CID5, CONTROL_CID6, CONTROL_CID7, CONTROL_RID,
};
use openlcb_defs::{Mti, ProtocolSupport};

use crate::config;
use crate::iface::alias_map::AliasMap;
use crate::wire::can::{frame_buffer, FrameBuffer, Identifier};

/// The queues and tables a login step may touch.
pub(crate) struct LoginIo<'a> {
    pub map: &'a mut AliasMap,
    pub control: &'a mut Deque<FrameBuffer, { config::CONTROL_QUEUE_DEPTH }>,
    pub tx: &'a mut Fifo<{ config::TX_FIFO_DEPTH }>,
    pub pool: &'a mut Pool,
    pub on_alias_change: Option<fn(Alias, NodeId)>,
}

/// Advance the two 24-bit registers of the alias generator.
///
/// The constants are normative; every implementation must converge on
/// the same alias sequence for a given node id.
pub(crate) fn generate_seed(seed: u64) -> u64 {
    let lfsr1 = (seed & 0xFF_FFFF) as u32;
    let lfsr2 = ((seed >> 24) & 0xFF_FFFF) as u32;

    let temp1 = (lfsr1.wrapping_shl(9) | (lfsr2 >> 15) & 0x1FF) & 0xFF_FFFF;
    let temp2 = lfsr2.wrapping_shl(9) & 0xFF_FFFF;

    let lfsr1 = lfsr1.wrapping_add(temp1).wrapping_add(0x1B0C_A3);
    let lfsr2 = lfsr2.wrapping_add(temp2).wrapping_add(0x7A4B_A9);

    let lfsr1 = (lfsr1 & 0xFF_FFFF) + ((lfsr2 & 0xFF00_0000) >> 24);
    let lfsr2 = lfsr2 & 0xFF_FFFF;

    (u64::from(lfsr1) << 24) | u64::from(lfsr2)
}

/// Fold the generator state down to a twelve-bit alias candidate.
pub(crate) fn generate_alias(seed: u64) -> Alias {
    let lfsr2 = (seed & 0xFF_FFFF) as u32;
    let lfsr1 = ((seed >> 24) & 0xFF_FFFF) as u32;

    Alias::new(((lfsr1 ^ lfsr2 ^ (lfsr1 >> 12) ^ (lfsr2 >> 12)) & 0x0FFF) as u16)
}

/// Run one login step for `node`.
pub(crate) fn run(node: &mut Node, io: &mut LoginIo<'_>) -> bool {
    match node.run_state {
        RunState::Init => {
            node.seed = node.id.as_u64();
            node.run_state = RunState::GenerateAlias;
            true
        }
        RunState::GenerateSeed => {
            node.seed = generate_seed(node.seed);
            node.run_state = RunState::GenerateAlias;
            true
        }
        RunState::GenerateAlias => {
            let alias = generate_alias(node.seed);
            if alias.is_null() {
                node.seed = generate_seed(node.seed);
                return true;
            }
            node.alias = alias;
            if let Some(callback) = io.on_alias_change {
                callback(node.alias, node.id);
            }
            node.run_state = RunState::SendCid7;
            true
        }
        RunState::SendCid7 => {
            let slice = ((node.id.as_u64() >> 24) as u32) & 0xFFF0_00;
            send_control(io, node, CONTROL_CID7 | slice, &[], RunState::SendCid6)
        }
        RunState::SendCid6 => {
            let slice = ((node.id.as_u64() >> 12) as u32) & 0xFFF0_00;
            send_control(io, node, CONTROL_CID6 | slice, &[], RunState::SendCid5)
        }
        RunState::SendCid5 => {
            let slice = (node.id.as_u64() as u32) & 0xFFF0_00;
            send_control(io, node, CONTROL_CID5 | slice, &[], RunState::SendCid4)
        }
        RunState::SendCid4 => {
            let slice = ((node.id.as_u64() << 12) as u32) & 0xFFF0_00;
            if send_control(io, node, CONTROL_CID4 | slice, &[], RunState::Wait200ms) {
                node.timer_ticks = 0;
                true
            } else {
                false
            }
        }
        RunState::Wait200ms => {
            if node.timer_ticks >= config::LOGIN_WAIT_TICKS {
                node.run_state = RunState::SendRid;
                true
            } else {
                false
            }
        }
        RunState::SendRid => send_control(io, node, CONTROL_RID, &[], RunState::SendAmd),
        RunState::SendAmd => {
            // Claiming the alias also inserts it into the mapping table;
            // without a slot there the claim is not usable.
            if io.map.find_by_alias(node.alias).is_none()
                && io.map.register(node.alias, node.id).is_none()
            {
                net_debug!("login: alias map full, cannot claim");
                return false;
            }
            let id = node.id;
            if send_control_with_id(io, node, CONTROL_AMD, id) {
                node.flags.insert(NodeFlags::PERMITTED);
                node.run_state = RunState::SendInitializationComplete;
                true
            } else {
                false
            }
        }
        RunState::SendInitializationComplete => {
            let mti = if node
                .parameters
                .protocol_support
                .contains(ProtocolSupport::SIMPLE)
            {
                Mti::InitializationCompleteSimple
            } else {
                Mti::InitializationComplete
            };
            let Some(handle) = io.pool.allocate(PayloadClass::Basic) else {
                return false;
            };
            let msg = io.pool.get_mut(handle);
            msg.load_header(node.alias, node.id, Alias::NULL, NodeId::NULL, mti);
            // The payload repeats the full node id.
            msg.set_node_id(0, node.id).unwrap();
            if io.tx.push(handle).is_err() {
                io.pool.free(handle);
                return false;
            }
            node.flags.insert(NodeFlags::INITIALIZED);
            node.producers.start_enumeration();
            node.run_state = RunState::SendProducerEvents;
            true
        }
        RunState::SendProducerEvents => {
            let index = node.producers.enum_index;
            let Some(slot) = node.producers.get(index).copied() else {
                node.producers.stop_enumeration();
                node.consumers.start_enumeration();
                node.run_state = RunState::SendConsumerEvents;
                return true;
            };
            if emit_identified(io, node, slot.state.producer_identified_mti(), slot.id) {
                node.producers.enum_index += 1;
                true
            } else {
                false
            }
        }
        RunState::SendConsumerEvents => {
            let index = node.consumers.enum_index;
            let Some(slot) = node.consumers.get(index).copied() else {
                node.consumers.stop_enumeration();
                node.run_state = RunState::Run;
                return true;
            };
            if emit_identified(io, node, slot.state.consumer_identified_mti(), slot.id) {
                node.consumers.enum_index += 1;
                true
            } else {
                false
            }
        }
        RunState::Run | RunState::Inhibited => false,
    }
}

fn send_control(
    io: &mut LoginIo<'_>,
    node: &mut Node,
    field: u32,
    payload: &[u8],
    next: RunState,
) -> bool {
    let identifier = Identifier::control(field, node.alias);
    if io
        .control
        .push_back(frame_buffer(identifier, payload))
        .is_err()
    {
        return false;
    }
    node.run_state = next;
    true
}

fn send_control_with_id(io: &mut LoginIo<'_>, node: &mut Node, field: u32, id: NodeId) -> bool {
    let identifier = Identifier::control(field, node.alias);
    io.control
        .push_back(frame_buffer(identifier, id.as_bytes()))
        .is_ok()
}

fn emit_identified(
    io: &mut LoginIo<'_>,
    node: &Node,
    mti: Mti,
    event_id: openlcb_core::event::EventId,
) -> bool {
    let Some(handle) = io.pool.allocate(PayloadClass::Basic) else {
        return false;
    };
    let msg = io.pool.get_mut(handle);
    msg.load_header(node.alias, node.id, Alias::NULL, NodeId::NULL, mti);
    msg.set_event_id(0, event_id).unwrap();
    if io.tx.push(handle).is_err() {
        io.pool.free(handle);
        return false;
    }
    true
}
