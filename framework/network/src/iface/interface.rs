use heapless::Deque;
use openlcb_core::buffer::{Fifo, Handle, Pool};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::{Node, NodeFlags, RunState};
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::can::{CONTROL_AMD, CONTROL_AMR, CONTROL_ERROR_INFO_0, CONTROL_RID};
use openlcb_defs::can::{
    CAN_MTI_PCER_PAYLOAD_FIRST, CAN_MTI_PCER_PAYLOAD_LAST, CAN_MTI_PCER_PAYLOAD_MIDDLE,
};
use openlcb_defs::{error, Mti};

use crate::config;
use crate::iface::alias_map::AliasMap;
use crate::iface::assembler::{Assembler, AssemblyError, Position};
use crate::iface::fragmenter::Fragmenter;
use crate::iface::login::{self, LoginIo};
use crate::phy::{Device, RxToken as _, TxToken as _};
use crate::wire::can::{frame_buffer, Frame, FrameBuffer, FrameClass, Identifier};

// Mti::SimpleNodeInfoReply in its 12-bit CAN form.
const CAN_MTI_SNIP_REPLY: u16 = 0xA08;

/// Optional application hooks. Never required for correct operation.
#[derive(Default, Clone, Copy)]
pub struct Callbacks {
    pub on_receive: Option<fn(Identifier, &[u8])>,
    pub on_transmit: Option<fn(Identifier, &[u8])>,
    pub on_alias_change: Option<fn(Alias, NodeId)>,
    /// Invoked with (error code, offending source alias) when inbound
    /// traffic is dropped or an error report frame arrives.
    pub on_error_report: Option<fn(u16, Alias)>,
}

/// The CAN transport interface: owns the alias table, the assembler, the
/// fragmenter and the frame queues, and drives every node's login.
///
/// `poll` performs one cooperative pass (drain inbound frames, advance
/// each login by at most one action, push outbound frames until the
/// driver fills up) and returns whether anything happened, so callers
/// loop while it reports progress.
pub struct Interface {
    alias_map: AliasMap,
    assembler: Assembler,
    fragmenter: Fragmenter,
    control_queue: Deque<FrameBuffer, { config::CONTROL_QUEUE_DEPTH }>,
    rx_fifo: Fifo<{ config::RX_FIFO_DEPTH }>,
    tx_fifo: Fifo<{ config::TX_FIFO_DEPTH }>,
    rx_paused: bool,
    pub callbacks: Callbacks,
}

impl Interface {
    pub fn new() -> Self {
        Self {
            alias_map: AliasMap::new(),
            assembler: Assembler::new(),
            fragmenter: Fragmenter::new(),
            control_queue: Deque::new(),
            rx_fifo: Fifo::new(),
            tx_fifo: Fifo::new(),
            rx_paused: false,
            callbacks: Callbacks::default(),
        }
    }

    /// The alias ownership table.
    pub fn alias_map(&self) -> &AliasMap {
        &self.alias_map
    }

    /// Stop draining the receive side while the caller touches shared
    /// buffers from another context.
    pub fn pause_rx(&mut self) {
        self.rx_paused = true;
    }

    pub fn resume_rx(&mut self) {
        self.rx_paused = false;
    }

    /// Take the next fully assembled inbound message.
    pub fn pop_received(&mut self) -> Option<Handle> {
        self.rx_fifo.pop()
    }

    /// Queue an assembled message for transmission. On a full queue the
    /// handle is handed back and the caller retries later.
    pub fn send(&mut self, handle: Handle) -> Result<(), Handle> {
        self.tx_fifo.push(handle)
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_fifo.len()
    }

    /// One cooperative pass over ingress, logins and egress.
    pub fn poll<D: Device>(&mut self, device: &mut D, pool: &mut Pool, nodes: &mut [Node]) -> bool {
        let mut did_something = false;
        did_something |= self.ingress(device, pool, nodes);
        did_something |= self.run_logins(pool, nodes);
        did_something |= self.egress(device, pool);
        did_something
    }

    fn ingress<D: Device>(&mut self, device: &mut D, pool: &mut Pool, nodes: &mut [Node]) -> bool {
        if self.rx_paused {
            return false;
        }
        let mut processed_any = false;
        while let Some(token) = device.receive() {
            token.consume(|bytes| self.process_frame(bytes, pool, nodes));
            processed_any = true;
        }
        processed_any
    }

    fn process_frame(&mut self, bytes: &[u8], pool: &mut Pool, nodes: &mut [Node]) {
        let frame = match Frame::new_checked(&bytes[..]) {
            Ok(frame) => frame,
            Err(_) => {
                net_trace!("iface: malformed frame");
                return;
            }
        };
        let ident = frame.identifier();
        if let Some(callback) = self.callbacks.on_receive {
            callback(ident, frame.payload());
        }
        if ident.is_openlcb_message() {
            self.process_openlcb_frame(&frame, pool);
        } else {
            self.process_control_frame(&frame, pool, nodes);
        }
    }

    // ---- CAN control frames ------------------------------------------

    fn process_control_frame(
        &mut self,
        frame: &Frame<&[u8]>,
        pool: &mut Pool,
        nodes: &mut [Node],
    ) {
        let ident = frame.identifier();
        let src = ident.source_alias();
        match ident.classify() {
            FrameClass::CheckId { .. } => self.handle_inbound_cid(src, nodes),
            FrameClass::ReserveId | FrameClass::AliasMapReset => {
                self.handle_hard_conflict(src, pool, nodes);
            }
            FrameClass::ErrorInformationReport { .. } => {
                self.handle_hard_conflict(src, pool, nodes);
                if let Some(callback) = self.callbacks.on_error_report {
                    let payload = frame.payload();
                    let code = if payload.len() >= 2 {
                        (u16::from(payload[0]) << 8) | u16::from(payload[1])
                    } else {
                        0
                    };
                    callback(code, src);
                }
            }
            FrameClass::AliasMapDefinition => {
                self.handle_hard_conflict(src, pool, nodes);
                if frame.payload().len() >= 6 {
                    let peer_id = NodeId::from_bytes(&frame.payload()[..6]);
                    self.check_duplicate_node_id(peer_id, src, pool, nodes);
                }
            }
            FrameClass::AliasMapEnquiry => {
                self.handle_hard_conflict(src, pool, nodes);
                self.answer_enquiry(frame, nodes);
            }
            FrameClass::ControlReserved => {}
            _ => {}
        }
    }

    /// A check-id naming an alias we hold: defend an owned alias with an
    /// RID; abandon a mere candidate and arbitrate again.
    fn handle_inbound_cid(&mut self, src: Alias, nodes: &mut [Node]) {
        for node in nodes.iter_mut() {
            if node.alias.is_null() || node.alias != src {
                continue;
            }
            if node.is_permitted() {
                let defense = frame_buffer(Identifier::control(CONTROL_RID, node.alias), &[]);
                if self.control_queue.push_back(defense).is_err() {
                    net_debug!("iface: control queue full, RID defense dropped");
                }
            } else if in_arbitration(node.run_state) {
                self.alias_map.unregister(node.alias);
                node.alias = Alias::NULL;
                node.run_state = RunState::GenerateSeed;
            }
        }
    }

    /// RID/AMD/AMR/AME/error-report naming an alias we hold means the
    /// alias is lost: retract it and log in again with a fresh one.
    fn handle_hard_conflict(&mut self, src: Alias, pool: &mut Pool, nodes: &mut [Node]) {
        for index in 0..nodes.len() {
            let node = &mut nodes[index];
            if node.alias.is_null() || node.alias != src {
                continue;
            }
            if node.is_permitted() {
                let amr = frame_buffer(
                    Identifier::control(CONTROL_AMR, node.alias),
                    node.id.as_bytes(),
                );
                let amr_sent = self.control_queue.push_back(amr).is_ok();
                self.alias_map.unregister(node.alias);
                release_node_buffers(node, pool);
                node.reset_for_relogin();
                if !amr_sent {
                    // Losing the retraction frame is not recoverable in
                    // place; restart the whole login from scratch.
                    node.run_state = RunState::Init;
                }
            } else if in_arbitration(node.run_state) {
                self.alias_map.unregister(node.alias);
                node.alias = Alias::NULL;
                node.run_state = RunState::GenerateSeed;
            }
        }
    }

    /// An AMD carrying our own node id from a different alias: a second
    /// physical node was configured with our id. Withdraw from the bus
    /// and stay out until someone fixes the configuration.
    fn check_duplicate_node_id(
        &mut self,
        peer_id: NodeId,
        src: Alias,
        pool: &mut Pool,
        nodes: &mut [Node],
    ) {
        for node in nodes.iter_mut() {
            if node.id != peer_id || node.alias == src {
                continue;
            }
            net_debug!("iface: duplicate node id on the wire");
            if node.is_permitted() {
                if let Some(handle) = pool.allocate(PayloadClass::Basic) {
                    let msg = pool.get_mut(handle);
                    msg.load_header(
                        node.alias,
                        node.id,
                        src,
                        NodeId::NULL,
                        Mti::TerminateDueToError,
                    );
                    msg.set_word(0, error::PERMANENT).unwrap();
                    if self.tx_fifo.push(handle).is_err() {
                        pool.free(handle);
                    }
                }
                let amr = frame_buffer(
                    Identifier::control(CONTROL_AMR, node.alias),
                    node.id.as_bytes(),
                );
                let _ = self.control_queue.push_back(amr);
                self.alias_map.unregister(node.alias);
            }
            release_node_buffers(node, pool);
            node.flags = NodeFlags::DUPLICATE_ID_DETECTED;
            node.alias = Alias::NULL;
            node.run_state = RunState::Inhibited;
            if let Some(callback) = self.callbacks.on_error_report {
                callback(error::PERMANENT, src);
            }
        }
    }

    /// Alias map enquiries: an empty one wants an AMD from every
    /// permitted node, a targeted one only from the named node.
    fn answer_enquiry(&mut self, frame: &Frame<&[u8]>, nodes: &mut [Node]) {
        let payload = frame.payload();
        let target = if payload.len() >= 6 {
            Some(NodeId::from_bytes(&payload[..6]))
        } else {
            None
        };
        for node in nodes.iter_mut() {
            if !node.is_permitted() {
                continue;
            }
            if let Some(id) = target {
                if node.id != id {
                    continue;
                }
            }
            let amd = frame_buffer(
                Identifier::control(CONTROL_AMD, node.alias),
                node.id.as_bytes(),
            );
            if self.control_queue.push_back(amd).is_err() {
                net_debug!("iface: control queue full, AMD reply dropped");
                break;
            }
        }
    }

    // ---- OpenLCB message frames --------------------------------------

    fn process_openlcb_frame(&mut self, frame: &Frame<&[u8]>, pool: &mut Pool) {
        let ident = frame.identifier();
        let src = ident.source_alias();
        let class = ident.classify();

        match class {
            FrameClass::Global => {
                let can_mti = ident.can_mti();
                let result = match can_mti {
                    CAN_MTI_PCER_PAYLOAD_FIRST => self.assembler.accept(
                        pool,
                        PayloadClass::Snip,
                        src,
                        Alias::NULL,
                        Mti::PcEventReportWithPayload,
                        frame.payload(),
                        Position::First,
                    ),
                    CAN_MTI_PCER_PAYLOAD_MIDDLE => self.assembler.accept(
                        pool,
                        PayloadClass::Snip,
                        src,
                        Alias::NULL,
                        Mti::PcEventReportWithPayload,
                        frame.payload(),
                        Position::Middle,
                    ),
                    CAN_MTI_PCER_PAYLOAD_LAST => self.assembler.accept(
                        pool,
                        PayloadClass::Snip,
                        src,
                        Alias::NULL,
                        Mti::PcEventReportWithPayload,
                        frame.payload(),
                        Position::Last,
                    ),
                    _ => self.assembler.accept(
                        pool,
                        PayloadClass::Basic,
                        src,
                        Alias::NULL,
                        Mti::from(can_mti),
                        frame.payload(),
                        Position::Only,
                    ),
                };
                self.finish_assembly(result, src, None, pool);
            }
            FrameClass::Addressed => {
                let Some(dest) = frame.dest_alias() else { return };
                let Some(mapping) = self.alias_map.find_by_alias(dest) else {
                    // Addressed to somebody else entirely.
                    return;
                };
                let dest_id = mapping.node_id;
                let can_mti = ident.can_mti();
                let mti = Mti::from(can_mti);
                let data = &frame.payload()[2..];
                let class = if can_mti == CAN_MTI_SNIP_REPLY {
                    PayloadClass::Snip
                } else {
                    PayloadClass::Basic
                };
                let result = match frame.framing() {
                    openlcb_defs::can::Framing::Only => {
                        if can_mti == CAN_MTI_SNIP_REPLY {
                            // Pre-framing-bit peers send SNIP replies as a
                            // run of only-frames.
                            self.assembler.accept_legacy_snip(pool, src, dest, data)
                        } else {
                            self.assembler
                                .accept(pool, class, src, dest, mti, data, Position::Only)
                        }
                    }
                    openlcb_defs::can::Framing::First => self
                        .assembler
                        .accept(pool, class, src, dest, mti, data, Position::First),
                    openlcb_defs::can::Framing::Middle => self
                        .assembler
                        .accept(pool, class, src, dest, mti, data, Position::Middle),
                    openlcb_defs::can::Framing::Last => self
                        .assembler
                        .accept(pool, class, src, dest, mti, data, Position::Last),
                };
                self.finish_assembly(result, src, Some((dest, dest_id)), pool);
            }
            FrameClass::DatagramOnly
            | FrameClass::DatagramFirst
            | FrameClass::DatagramMiddle
            | FrameClass::DatagramFinal => {
                let dest = ident.dest_alias();
                let Some(mapping) = self.alias_map.find_by_alias(dest) else {
                    return;
                };
                let dest_id = mapping.node_id;
                let position = match class {
                    FrameClass::DatagramOnly => Position::Only,
                    FrameClass::DatagramFirst => Position::First,
                    FrameClass::DatagramMiddle => Position::Middle,
                    _ => Position::Last,
                };
                let result = self.assembler.accept(
                    pool,
                    PayloadClass::Datagram,
                    src,
                    dest,
                    Mti::Datagram,
                    frame.payload(),
                    position,
                );
                self.finish_assembly(result, src, Some((dest, dest_id)), pool);
            }
            FrameClass::Stream => {
                let dest = ident.dest_alias();
                let Some(mapping) = self.alias_map.find_by_alias(dest) else {
                    return;
                };
                let dest_id = mapping.node_id;
                let result = self.assembler.accept(
                    pool,
                    PayloadClass::Stream,
                    src,
                    dest,
                    Mti::StreamDataSend,
                    frame.payload(),
                    Position::Only,
                );
                self.finish_assembly(result, src, Some((dest, dest_id)), pool);
            }
            FrameClass::Reserved => {}
            _ => {}
        }
    }

    fn finish_assembly(
        &mut self,
        result: Result<Option<Handle>, AssemblyError>,
        src: Alias,
        dest: Option<(Alias, NodeId)>,
        pool: &mut Pool,
    ) {
        match result {
            Ok(Some(handle)) => {
                if let Some((_, dest_id)) = dest {
                    pool.get_mut(handle).dest_id = dest_id;
                }
                if self.rx_fifo.push(handle).is_err() {
                    net_debug!("iface: rx fifo full, message dropped");
                    pool.free(handle);
                }
            }
            Ok(None) => {}
            Err(error) => {
                net_debug!("iface: assembly dropped");
                if let Some(callback) = self.callbacks.on_error_report {
                    callback(error.code(), src);
                }
                if let Some((dest_alias, _)) = dest {
                    let report = frame_buffer(
                        Identifier::control(CONTROL_ERROR_INFO_0, dest_alias),
                        &error.code().to_be_bytes(),
                    );
                    let _ = self.control_queue.push_back(report);
                }
            }
        }
    }

    // ---- login -------------------------------------------------------

    fn run_logins(&mut self, pool: &mut Pool, nodes: &mut [Node]) -> bool {
        let Self {
            alias_map,
            control_queue,
            tx_fifo,
            callbacks,
            ..
        } = self;
        let mut io = LoginIo {
            map: alias_map,
            control: control_queue,
            tx: tx_fifo,
            pool,
            on_alias_change: callbacks.on_alias_change,
        };
        let mut advanced = false;
        for node in nodes.iter_mut() {
            advanced |= login::run(node, &mut io);
        }
        advanced
    }

    // ---- egress ------------------------------------------------------

    fn egress<D: Device>(&mut self, device: &mut D, pool: &mut Pool) -> bool {
        let mut emitted_any = false;

        // Control frames jump the queue; login ordering depends on it.
        while let Some(frame) = self.control_queue.front() {
            let Some(token) = device.transmit() else {
                return emitted_any;
            };
            let sent = token.consume(frame.len(), |buffer| buffer.copy_from_slice(frame));
            if sent.is_none() {
                return emitted_any;
            }
            if let Some(callback) = self.callbacks.on_transmit {
                let parsed = Frame::new_unchecked(&frame[..]);
                callback(parsed.identifier(), parsed.payload());
            }
            self.control_queue.pop_front();
            emitted_any = true;
        }

        // Then one message at a time through the fragmenter; a partially
        // sent message always resumes before anything else goes out.
        loop {
            if self.fragmenter.is_idle() {
                match self.tx_fifo.pop() {
                    Some(handle) => self.fragmenter.begin(handle),
                    None => break,
                }
            }
            let Some(out) = self.fragmenter.build_next(pool) else {
                break;
            };
            let Some(token) = device.transmit() else {
                break;
            };
            if token
                .consume(out.buffer.len(), |buffer| {
                    buffer.copy_from_slice(&out.buffer)
                })
                .is_none()
            {
                break;
            }
            if let Some(callback) = self.callbacks.on_transmit {
                let parsed = Frame::new_unchecked(&out.buffer[..]);
                callback(parsed.identifier(), parsed.payload());
            }
            if let Some(done) = self.fragmenter.commit(&out) {
                pool.free(done);
            }
            emitted_any = true;
        }

        emitted_any
    }
}

impl Default for Interface {
    fn default() -> Self {
        Self::new()
    }
}

fn in_arbitration(state: RunState) -> bool {
    matches!(
        state,
        RunState::SendCid7
            | RunState::SendCid6
            | RunState::SendCid5
            | RunState::SendCid4
            | RunState::Wait200ms
            | RunState::SendRid
            | RunState::SendAmd
    )
}

fn release_node_buffers(node: &mut Node, pool: &mut Pool) {
    if let Some(handle) = node.last_received_datagram.take() {
        pool.free(handle);
    }
    if let Some(handle) = node.pending_datagram.take() {
        pool.free(handle);
    }
}
