#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Datagram handling and the memory configuration protocol.

Every datagram is acknowledged before its content is acted on; commands
that will produce a reply set the reply-pending bit in the ACK. The
command handlers never touch storage hardware themselves: bounds are
checked against the node's address-space descriptors, then the injected
[`ConfigurationStorage`] does the actual transfer.
*/

use heapless::Vec;
use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::handler::{allocate_reply, OutgoingSlot};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::{AddressSpace, Node, NodeFlags};
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::{config_cmd, config_options, error, MemorySpace, Mti, DATAGRAM_CONFIG_MEM};
use openlcb_persistence::{ConfigurationStorage, Error as StorageError};

/// Largest data block one read or write datagram can move.
pub const MAX_TRANSFER: usize = 64;

/// Exclusive configuration locks, one per local node.
const MAX_LOCKS: usize = 4;

/// The datagram / memory configuration handler.
pub struct Service {
    locks: Vec<Lock, MAX_LOCKS>,
    /// A datagram we transmitted was finally rejected: (peer, code).
    pub on_datagram_failed: Option<fn(Alias, u16)>,
}

#[derive(Debug, Clone, Copy)]
struct Lock {
    node: NodeId,
    owner: NodeId,
}

/// A parsed read or write request header.
#[derive(Debug, Clone, Copy)]
struct Request {
    command: u8,
    space: u8,
    address: u32,
    /// Octets before the data / count field: six for the short forms,
    /// seven when the space travels in byte six.
    header_len: usize,
}

fn parse_request(payload: &[u8]) -> Option<Request> {
    if payload.len() < 6 {
        return None;
    }
    let command = payload[1];
    let address = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
    match config_cmd::short_form_space(command) {
        Some(space) => Some(Request {
            command,
            space,
            address,
            header_len: 6,
        }),
        None => {
            if payload.len() < 7 {
                return None;
            }
            Some(Request {
                command,
                space: payload[6],
                address,
                header_len: 7,
            })
        }
    }
}

fn is_known_command(command: u8) -> bool {
    matches!(command & config_cmd::COMMAND_MASK, config_cmd::READ | config_cmd::WRITE)
        // Read/write replies from peers are recognized and ignored.
        || matches!(command & config_cmd::COMMAND_MASK, 0x10 | 0x18 | 0x50 | 0x58)
        || matches!(
            command,
            config_cmd::OPTIONS
                | config_cmd::OPTIONS_REPLY
                | config_cmd::GET_SPACE_INFO
                | config_cmd::GET_SPACE_INFO_REPLY_NOT_PRESENT
                | config_cmd::GET_SPACE_INFO_REPLY_PRESENT
                | config_cmd::RESERVE_LOCK
                | config_cmd::RESERVE_LOCK_REPLY
                | config_cmd::FREEZE
                | config_cmd::UNFREEZE
                | config_cmd::GET_UNIQUE_ID
                | config_cmd::GET_UNIQUE_ID_REPLY
                | config_cmd::UPDATE_COMPLETE
                | config_cmd::RESET_REBOOT
                | config_cmd::FACTORY_RESET
        )
}

fn produces_reply(command: u8) -> bool {
    matches!(command & config_cmd::COMMAND_MASK, config_cmd::READ | config_cmd::WRITE)
        || matches!(
            command,
            config_cmd::OPTIONS
                | config_cmd::GET_SPACE_INFO
                | config_cmd::RESERVE_LOCK
                | config_cmd::GET_UNIQUE_ID
        )
}

fn storage_error_code(error: StorageError) -> u16 {
    match error {
        StorageError::OutOfRange => error::ADDRESS_OUT_OF_BOUNDS,
        StorageError::ReadOnly => error::WRITE_TO_READ_ONLY,
        StorageError::Unsupported => error::ADDRESS_SPACE_UNKNOWN,
        StorageError::Storage => error::TEMPORARY,
    }
}

impl Service {
    pub fn new() -> Self {
        Self {
            locks: Vec::new(),
            on_datagram_failed: None,
        }
    }

    /// Entry point for an assembled datagram addressed to `node`.
    pub fn handle_datagram<S: ConfigurationStorage>(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        storage: &mut S,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, first, command) = {
            let msg = pool.get(incoming);
            let payload = msg.payload.as_slice();
            (
                msg.source_alias,
                msg.source_id,
                payload.first().copied(),
                payload.get(1).copied(),
            )
        };

        let (Some(first), Some(command)) = (first, command) else {
            self.reject(node, pool, peer_alias, peer_id, error::NOT_IMPLEMENTED_UNKNOWN_DATAGRAM_TYPE, out);
            return;
        };
        if first != DATAGRAM_CONFIG_MEM || !is_known_command(command) {
            self.reject(
                node,
                pool,
                peer_alias,
                peer_id,
                error::NOT_IMPLEMENTED_UNKNOWN_DATAGRAM_TYPE,
                out,
            );
            return;
        }

        // First pass acknowledges; the dispatcher calls again for the
        // command itself.
        if !node.flags.contains(NodeFlags::DATAGRAM_ACK_SENT) {
            let Some(handle) = allocate_reply(
                pool,
                node,
                peer_alias,
                peer_id,
                PayloadClass::Basic,
                Mti::DatagramReceivedOk,
            ) else {
                return;
            };
            let flags: u8 = if produces_reply(command) { 0x80 } else { 0x00 };
            pool.get_mut(handle).set_byte(0, flags).unwrap();
            out.set(handle);
            node.flags.insert(NodeFlags::DATAGRAM_ACK_SENT);
            out.enumerate = true;
            return;
        }
        node.flags.remove(NodeFlags::DATAGRAM_ACK_SENT);
        out.enumerate = false;

        match command & config_cmd::COMMAND_MASK {
            config_cmd::READ => {
                self.command_read(node, pool, storage, incoming, out);
                return;
            }
            config_cmd::WRITE => {
                self.command_write(node, pool, storage, incoming, out);
                return;
            }
            _ => {}
        }

        match command {
            config_cmd::OPTIONS => self.command_options(node, pool, incoming, out),
            config_cmd::GET_SPACE_INFO => self.command_space_info(node, pool, incoming, out),
            config_cmd::RESERVE_LOCK => self.command_lock(node, pool, incoming, out),
            config_cmd::GET_UNIQUE_ID => self.command_unique_id(node, pool, incoming, out),
            config_cmd::FREEZE => {
                let space = self.space_operand(pool, incoming);
                let _ = storage.freeze(node.id, space);
                node.flags.insert(NodeFlags::FIRMWARE_UPGRADE_ACTIVE);
            }
            config_cmd::UNFREEZE => {
                let space = self.space_operand(pool, incoming);
                let _ = storage.unfreeze(node.id, space);
                node.flags.remove(NodeFlags::FIRMWARE_UPGRADE_ACTIVE);
            }
            config_cmd::UPDATE_COMPLETE => storage.update_complete(node.id),
            config_cmd::RESET_REBOOT => storage.reboot(node.id),
            config_cmd::FACTORY_RESET => {
                let confirmed = {
                    let msg = pool.get(incoming);
                    msg.payload.len() >= 8 && msg.node_id_at(2) == node.id
                };
                if confirmed {
                    let _ = storage.factory_reset(node.id);
                }
            }
            // Replies from peers need no answer.
            _ => {}
        }
    }

    fn space_operand(&self, pool: &Pool, incoming: Handle) -> u8 {
        let msg = pool.get(incoming);
        if msg.payload.len() >= 3 {
            msg.byte_at(2)
        } else {
            MemorySpace::Configuration.into()
        }
    }

    fn command_read<S: ConfigurationStorage>(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        storage: &mut S,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, request, count, header): (_, _, _, _, Vec<u8, 7>) = {
            let msg = pool.get(incoming);
            let payload = msg.payload.as_slice();
            let Some(request) = parse_request(payload) else {
                return;
            };
            let count = payload
                .get(request.header_len)
                .copied()
                .unwrap_or(0)
                .min(MAX_TRANSFER as u8);
            (
                msg.source_alias,
                msg.source_id,
                request,
                count,
                Vec::from_slice(&payload[..request.header_len]).unwrap(),
            )
        };

        let space = match self.checked_space(node, request, false) {
            Ok(space) => space,
            Err(code) => {
                self.read_write_fail(node, pool, peer_alias, peer_id, &header, code, out);
                return;
            }
        };

        // Reads clip at the end of the space instead of failing.
        let available = (space.highest_address - request.address).saturating_add(1);
        let count = u32::from(count).min(available) as usize;

        let mut data = [0u8; MAX_TRANSFER];
        let produced = match MemorySpace::from(request.space) {
            MemorySpace::Cdi => {
                let cdi = node.parameters.cdi;
                let offset = request.address as usize;
                let take = count.min(cdi.len().saturating_sub(offset));
                data[..take].copy_from_slice(&cdi[offset..offset + take]);
                Ok(take)
            }
            MemorySpace::AcdiManufacturer => {
                let mut block = [0u8; 128];
                let len = acdi_manufacturer_block(node, &mut block);
                let offset = request.address as usize;
                let take = count.min(len.saturating_sub(offset));
                data[..take].copy_from_slice(&block[offset..offset + take]);
                Ok(take)
            }
            _ => storage.read(node.id, request.space, request.address, &mut data[..count]),
        };

        match produced {
            Ok(produced) => {
                let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
                    return;
                };
                let msg = pool.get_mut(handle);
                msg.set_bytes(0, &header).unwrap();
                msg.set_byte(1, request.command | config_cmd::OK_OFFSET).unwrap();
                msg.set_bytes(request.header_len, &data[..produced]).unwrap();
                out.set(handle);
            }
            Err(storage_error) => {
                self.read_write_fail(
                    node,
                    pool,
                    peer_alias,
                    peer_id,
                    &header,
                    storage_error_code(storage_error),
                    out,
                );
            }
        }
    }

    fn command_write<S: ConfigurationStorage>(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        storage: &mut S,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, request, data, header): (_, _, _, Vec<u8, MAX_TRANSFER>, Vec<u8, 7>) = {
            let msg = pool.get(incoming);
            let payload = msg.payload.as_slice();
            let Some(request) = parse_request(payload) else {
                return;
            };
            let data = &payload[request.header_len.min(payload.len())..];
            if data.len() > MAX_TRANSFER {
                return;
            }
            (
                msg.source_alias,
                msg.source_id,
                request,
                Vec::from_slice(data).unwrap(),
                Vec::from_slice(&payload[..request.header_len]).unwrap(),
            )
        };

        let result = match self.checked_space(node, request, true) {
            Ok(space) => {
                if request.address + data.len() as u32 > space.highest_address + 1 {
                    Err(error::ADDRESS_OUT_OF_BOUNDS)
                } else {
                    storage
                        .write(node.id, request.space, request.address, &data)
                        .map_err(storage_error_code)
                }
            }
            Err(code) => Err(code),
        };

        match result {
            Ok(()) => {
                let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
                    return;
                };
                let msg = pool.get_mut(handle);
                msg.set_bytes(0, &header).unwrap();
                msg.set_byte(1, request.command | config_cmd::OK_OFFSET).unwrap();
                out.set(handle);
            }
            Err(code) => {
                self.read_write_fail(node, pool, peer_alias, peer_id, &header, code, out)
            }
        }
    }

    /// Validate the space descriptor and the starting address.
    fn checked_space(
        &self,
        node: &Node,
        request: Request,
        writing: bool,
    ) -> Result<AddressSpace, u16> {
        let Some(space) = node.parameters.address_space(request.space) else {
            return Err(error::ADDRESS_SPACE_UNKNOWN);
        };
        if !space.present {
            return Err(error::ADDRESS_SPACE_UNKNOWN);
        }
        if writing && space.read_only {
            return Err(error::WRITE_TO_READ_ONLY);
        }
        if space.low_address_valid && request.address < space.low_address {
            return Err(error::ADDRESS_OUT_OF_BOUNDS);
        }
        if request.address > space.highest_address {
            return Err(error::ADDRESS_OUT_OF_BOUNDS);
        }
        Ok(*space)
    }

    #[allow(clippy::too_many_arguments)]
    fn read_write_fail(
        &self,
        node: &Node,
        pool: &mut Pool,
        peer_alias: Alias,
        peer_id: NodeId,
        header: &[u8],
        code: u16,
        out: &mut OutgoingSlot,
    ) {
        let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
            return;
        };
        let msg = pool.get_mut(handle);
        msg.set_bytes(0, header).unwrap();
        msg.set_byte(1, header[1] | config_cmd::FAIL_OFFSET).unwrap();
        msg.set_word(header.len(), code).unwrap();
        out.set(handle);
    }

    fn command_options(
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
        let options = &node.parameters.configuration_options;

        let mut available: u16 = 0;
        if options.write_under_mask {
            available |= config_options::WRITE_UNDER_MASK;
        }
        if options.unaligned_reads {
            available |= config_options::UNALIGNED_READS;
        }
        if options.unaligned_writes {
            available |= config_options::UNALIGNED_WRITES;
        }
        if options.read_manufacturer_acdi {
            available |= config_options::READ_FROM_MANUFACTURER_ACDI;
        }
        if options.read_user_acdi {
            available |= config_options::READ_FROM_USER_ACDI;
        }
        if options.write_user_acdi {
            available |= config_options::WRITE_TO_USER_ACDI;
        }
        if options.stream_read_write {
            available |= config_options::STREAM_READ_WRITE;
        }
        let mut write_lengths = config_options::WRITE_LENGTHS_BASE;
        if options.stream_read_write {
            write_lengths |= config_options::WRITE_LENGTH_STREAM;
        }

        let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
            return;
        };
        let msg = pool.get_mut(handle);
        msg.set_byte(0, DATAGRAM_CONFIG_MEM).unwrap();
        msg.set_byte(1, config_cmd::OPTIONS_REPLY).unwrap();
        msg.set_word(2, available).unwrap();
        msg.set_byte(4, write_lengths).unwrap();
        msg.set_byte(5, options.high_address_space).unwrap();
        msg.set_byte(6, options.low_address_space).unwrap();
        if !options.description.is_empty() {
            // An oversized description is dropped, not truncated.
            let _ = msg.set_str(7, options.description);
        }
        out.set(handle);
    }

    fn command_space_info(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, space_id) = {
            let msg = pool.get(incoming);
            if msg.payload.len() < 3 {
                return;
            }
            (msg.source_alias, msg.source_id, msg.byte_at(2))
        };
        let space = node.parameters.address_space(space_id).copied();

        let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
            return;
        };
        let msg = pool.get_mut(handle);
        msg.set_byte(0, DATAGRAM_CONFIG_MEM).unwrap();
        match space {
            Some(space) if space.present => {
                msg.set_byte(1, config_cmd::GET_SPACE_INFO_REPLY_PRESENT).unwrap();
                msg.set_byte(2, space_id).unwrap();
                msg.set_dword(3, space.highest_address).unwrap();
                let mut flags = 0u8;
                if space.read_only {
                    flags |= 0x01;
                }
                let mut offset = 8;
                if space.low_address_valid {
                    flags |= 0x02;
                    msg.set_dword(8, space.low_address).unwrap();
                    offset = 12;
                }
                msg.set_byte(7, flags).unwrap();
                if !space.description.is_empty() {
                    let _ = msg.set_str(offset, space.description);
                }
            }
            _ => {
                msg.set_byte(1, config_cmd::GET_SPACE_INFO_REPLY_NOT_PRESENT).unwrap();
                msg.set_byte(2, space_id).unwrap();
                // Fixed-size reply, zero padded.
                msg.set_byte(7, 0).unwrap();
            }
        }
        out.set(handle);
    }

    fn command_lock(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, requested) = {
            let msg = pool.get(incoming);
            if msg.payload.len() < 8 {
                return;
            }
            (msg.source_alias, msg.source_id, msg.node_id_at(2))
        };

        let current = self.lock_owner(node.id);
        let owner = if requested.is_null() {
            // Unlock, but only by the holder (or when free).
            if current.is_none() || current == Some(peer_id) || peer_id.is_null() {
                self.set_lock(node.id, NodeId::NULL);
                NodeId::NULL
            } else {
                current.unwrap()
            }
        } else if current.is_none() || current == Some(requested) {
            self.set_lock(node.id, requested);
            requested
        } else {
            current.unwrap()
        };

        let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
            return;
        };
        let msg = pool.get_mut(handle);
        msg.set_byte(0, DATAGRAM_CONFIG_MEM).unwrap();
        msg.set_byte(1, config_cmd::RESERVE_LOCK_REPLY).unwrap();
        msg.set_node_id(2, owner).unwrap();
        out.set(handle);
    }

    fn command_unique_id(
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
        let Some(handle) = self.datagram_reply(pool, node, peer_alias, peer_id) else {
            return;
        };
        let msg = pool.get_mut(handle);
        msg.set_byte(0, DATAGRAM_CONFIG_MEM).unwrap();
        msg.set_byte(1, config_cmd::GET_UNIQUE_ID_REPLY).unwrap();
        msg.set_node_id(2, node.id).unwrap();
        out.set(handle);
    }

    /// The lock table, exposed for the protocol layer's own checks.
    pub fn lock_owner(&self, node: NodeId) -> Option<NodeId> {
        self.locks
            .iter()
            .find(|lock| lock.node == node && !lock.owner.is_null())
            .map(|lock| lock.owner)
    }

    fn set_lock(&mut self, node: NodeId, owner: NodeId) {
        if let Some(lock) = self.locks.iter_mut().find(|lock| lock.node == node) {
            lock.owner = owner;
            return;
        }
        let _ = self.locks.push(Lock { node, owner });
    }

    fn datagram_reply(
        &self,
        pool: &mut Pool,
        node: &Node,
        peer_alias: Alias,
        peer_id: NodeId,
    ) -> Option<Handle> {
        allocate_reply(
            pool,
            node,
            peer_alias,
            peer_id,
            PayloadClass::Datagram,
            Mti::Datagram,
        )
    }

    fn reject(
        &self,
        node: &Node,
        pool: &mut Pool,
        peer_alias: Alias,
        peer_id: NodeId,
        code: u16,
        out: &mut OutgoingSlot,
    ) {
        let Some(handle) = allocate_reply(
            pool,
            node,
            peer_alias,
            peer_id,
            PayloadClass::Basic,
            Mti::DatagramRejected,
        ) else {
            return;
        };
        pool.get_mut(handle).set_word(0, code).unwrap();
        out.set(handle);
    }

    /// The peer acknowledged the datagram we sent it.
    pub fn handle_datagram_received_ok(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        _incoming: Handle,
    ) {
        if let Some(handle) = node.pending_datagram.take() {
            pool.free(handle);
        }
        node.datagram_resend_count = 0;
        node.flags.remove(NodeFlags::RESEND_DATAGRAM);
    }

    /// The peer rejected it: retry when allowed, otherwise give up and
    /// tell the application.
    pub fn handle_datagram_rejected(&mut self, node: &mut Node, pool: &mut Pool, incoming: Handle) {
        let (peer_alias, code) = {
            let msg = pool.get(incoming);
            let code = if msg.payload.len() >= 2 {
                msg.word_at(0)
            } else {
                error::PERMANENT
            };
            (msg.source_alias, code)
        };

        if node.pending_datagram.is_none() {
            return;
        }
        if error::is_resend_ok(code)
            && node.datagram_resend_count < openlcb_core::config::DATAGRAM_RESEND_LIMIT
        {
            node.datagram_resend_count += 1;
            node.flags.insert(NodeFlags::RESEND_DATAGRAM);
            return;
        }
        if let Some(handle) = node.pending_datagram.take() {
            pool.free(handle);
        }
        node.datagram_resend_count = 0;
        node.flags.remove(NodeFlags::RESEND_DATAGRAM);
        if let Some(callback) = self.on_datagram_failed {
            callback(peer_alias, code);
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

/// The manufacturer ACDI block: version octet then the four fixed
/// strings, each null terminated.
fn acdi_manufacturer_block(node: &Node, buffer: &mut [u8]) -> usize {
    let ident = node.parameters.snip;
    buffer[0] = openlcb_defs::snip::MANUFACTURER_VERSION;
    let mut offset = 1;
    for text in [
        ident.manufacturer,
        ident.model,
        ident.hardware_version,
        ident.software_version,
    ] {
        let bytes = text.as_bytes();
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
        offset += bytes.len();
        buffer[offset] = 0;
        offset += 1;
    }
    offset
}

#[cfg(test)]
mod test {
    use super::*;
    use openlcb_core::node::{
        AddressSpace, ConfigurationOptions, NodeParameters, RunState, SnipIdent,
    };
    use openlcb_defs::ProtocolSupport;
    use openlcb_persistence::RamStorage;

    static SPACES: [AddressSpace; 4] = [
        AddressSpace::read_only(0xFF, 0x1F, "cdi"),
        AddressSpace::read_write(0xFD, 0xFF, "config"),
        AddressSpace::read_only(0xFC, 0x7F, ""),
        AddressSpace::read_write(0xFB, 0x7F, ""),
    ];

    static PARAMS: NodeParameters = NodeParameters {
        snip: SnipIdent {
            manufacturer: "Basic OpenLcb Node",
            model: "Test",
            hardware_version: "0.0.1",
            software_version: "0.0.1",
        },
        protocol_support: ProtocolSupport::DATAGRAM
            .union(ProtocolSupport::MEMORY_CONFIGURATION),
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
        producer_events: &[],
        consumer_events: &[],
        producer_ranges: &[],
        consumer_ranges: &[],
    };

    fn test_node() -> Node {
        let mut node = Node::new(NodeId::from_u64(0x0501_0101_0707), &PARAMS);
        node.alias = Alias::new(0x6BE);
        node.flags = NodeFlags::PERMITTED | NodeFlags::INITIALIZED;
        node.run_state = RunState::Run;
        node
    }

    fn datagram(pool: &mut Pool, payload: &[u8]) -> Handle {
        let handle = pool.allocate(PayloadClass::Datagram).unwrap();
        let msg = pool.get_mut(handle);
        msg.load_header(
            Alias::new(0xAAA),
            NodeId::from_u64(0x0201_0000_0001),
            Alias::new(0x6BE),
            NodeId::from_u64(0x0501_0101_0707),
            Mti::Datagram,
        );
        msg.payload.extend_from_slice(payload).unwrap();
        handle
    }

    /// Run the two-phase handler: returns (ack payload, reply handle).
    fn run_command(
        service: &mut Service,
        node: &mut Node,
        pool: &mut Pool,
        storage: &mut RamStorage<256, 128>,
        payload: &[u8],
    ) -> (heapless::Vec<u8, 2>, Option<Handle>) {
        let incoming = datagram(pool, payload);
        let mut out = OutgoingSlot::new();
        service.handle_datagram(node, pool, storage, incoming, &mut out);

        let ack_handle = out.take().unwrap();
        let ack = pool.get(ack_handle);
        assert_eq!(ack.mti, Mti::DatagramReceivedOk);
        let ack_payload = heapless::Vec::from_slice(ack.payload.as_slice()).unwrap();
        assert!(out.enumerate);
        pool.free(ack_handle);

        service.handle_datagram(node, pool, storage, incoming, &mut out);
        assert!(!out.enumerate);
        pool.free(incoming);
        (ack_payload, out.take())
    }

    #[test]
    fn test_read_round_trip() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();
        let mut expected = [0u8; 8];
        for (i, byte) in expected.iter_mut().enumerate() {
            *byte = 0xE0 + i as u8;
        }
        storage.write(node.id, 0xFD, 0x10, &expected).unwrap();

        // Read eight octets at 0x10 of the configuration space.
        let (ack, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x43, 0x00, 0x00, 0x00, 0x10, 0x08],
        );
        assert_eq!(&ack[..], &[0x80]);

        let reply = pool.get(reply.unwrap());
        assert_eq!(reply.mti, Mti::Datagram);
        assert_eq!(reply.dest_alias, Alias::new(0xAAA));
        assert_eq!(
            &reply.payload.as_slice()[..6],
            &[0x20, 0x53, 0x00, 0x00, 0x00, 0x10]
        );
        assert_eq!(&reply.payload.as_slice()[6..], &expected);
    }

    #[test]
    fn test_read_unknown_space_fails() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x40, 0x00, 0x00, 0x00, 0x00, 0x42, 0x08],
        );
        let reply = pool.get(reply.unwrap());
        assert_eq!(reply.byte_at(1), 0x40 | config_cmd::FAIL_OFFSET);
        assert_eq!(reply.word_at(7), error::ADDRESS_SPACE_UNKNOWN);
    }

    #[test]
    fn test_write_then_read_back() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x03, 0x00, 0x00, 0x00, 0x20, 0xDE, 0xAD],
        );
        let reply_handle = reply.unwrap();
        assert_eq!(
            pool.get(reply_handle).payload.as_slice(),
            &[0x20, 0x13, 0x00, 0x00, 0x00, 0x20]
        );
        pool.free(reply_handle);

        let mut read_back = [0u8; 2];
        storage.read(node.id, 0xFD, 0x20, &mut read_back).unwrap();
        assert_eq!(read_back, [0xDE, 0xAD]);
    }

    #[test]
    fn test_write_to_read_only_space_fails() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x01, 0x00, 0x00, 0x00, 0x00, 0x55],
        );
        let reply = pool.get(reply.unwrap());
        assert_eq!(reply.byte_at(1), 0x01 | config_cmd::FAIL_OFFSET);
        assert_eq!(reply.word_at(6), error::WRITE_TO_READ_ONLY);
    }

    #[test]
    fn test_cdi_read_clips_at_end() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x41, 0x00, 0x00, 0x00, 0x1C, 0x20],
        );
        let reply = pool.get(reply.unwrap());
        // Four octets remain below the highest address 0x1F.
        assert_eq!(reply.payload.len(), 6 + 4);
        assert_eq!(&reply.payload.as_slice()[6..], &PARAMS.cdi[0x1C..0x20]);
    }

    #[test]
    fn test_options_reply_layout() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x80],
        );
        let reply = pool.get(reply.unwrap());
        assert_eq!(reply.byte_at(1), config_cmd::OPTIONS_REPLY);
        let available = reply.word_at(2);
        assert_ne!(available & config_options::UNALIGNED_READS, 0);
        assert_ne!(available & config_options::WRITE_TO_USER_ACDI, 0);
        assert_eq!(available & config_options::WRITE_UNDER_MASK, 0);
        assert_eq!(reply.byte_at(5), 0xFF);
        assert_eq!(reply.byte_at(6), 0xEF);
    }

    #[test]
    fn test_space_info_present_and_absent() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x84, 0xFD],
        );
        let handle = reply.unwrap();
        {
            let reply = pool.get(handle);
            assert_eq!(reply.byte_at(1), config_cmd::GET_SPACE_INFO_REPLY_PRESENT);
            assert_eq!(reply.byte_at(2), 0xFD);
            assert_eq!(reply.dword_at(3), 0xFF);
            assert_eq!(reply.byte_at(7) & 0x01, 0);
        }
        pool.free(handle);

        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, 0x84, 0x42],
        );
        let reply = pool.get(reply.unwrap());
        assert_eq!(
            reply.byte_at(1),
            config_cmd::GET_SPACE_INFO_REPLY_NOT_PRESENT
        );
        assert_eq!(reply.byte_at(2), 0x42);
    }

    #[test]
    fn test_lock_and_unlock() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let holder = [0x20, 0x88, 0x02, 0x01, 0x00, 0x00, 0x00, 0x01];
        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &holder,
        );
        let handle = reply.unwrap();
        assert_eq!(
            pool.get(handle).node_id_at(2),
            NodeId::from_u64(0x0201_0000_0001)
        );
        pool.free(handle);

        // A different holder cannot steal the lock.
        let thief = [0x20, 0x88, 0x02, 0x01, 0x00, 0x00, 0x00, 0x02];
        let (_, reply) =
            run_command(&mut service, &mut node, &mut pool, &mut storage, &thief);
        let handle = reply.unwrap();
        assert_eq!(
            pool.get(handle).node_id_at(2),
            NodeId::from_u64(0x0201_0000_0001)
        );
        pool.free(handle);

        // Null id releases it.
        let unlock = [0x20, 0x88, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let (_, reply) =
            run_command(&mut service, &mut node, &mut pool, &mut storage, &unlock);
        assert_eq!(pool.get(reply.unwrap()).node_id_at(2), NodeId::NULL);
        assert_eq!(service.lock_owner(node.id), None);
    }

    #[test]
    fn test_unknown_datagram_rejected_without_ack() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();
        let mut out = OutgoingSlot::new();

        let incoming = datagram(&mut pool, &[0x42, 0x01]);
        service.handle_datagram(&mut node, &mut pool, &mut storage, incoming, &mut out);
        let reply = pool.get(out.take().unwrap());
        assert_eq!(reply.mti, Mti::DatagramRejected);
        assert_eq!(
            reply.word_at(0),
            error::NOT_IMPLEMENTED_UNKNOWN_DATAGRAM_TYPE
        );
        assert!(!out.enumerate);
    }

    #[test]
    fn test_freeze_sets_upgrade_flag_without_reply() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();

        let (ack, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, config_cmd::FREEZE, 0xEF],
        );
        assert_eq!(&ack[..], &[0x00]);
        assert!(reply.is_none());
        assert!(node.flags.contains(NodeFlags::FIRMWARE_UPGRADE_ACTIVE));
        assert_eq!(storage.frozen_space(), Some(0xEF));
    }

    #[test]
    fn test_factory_reset_requires_matching_id() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 128>::new();
        storage.write(node.id, 0xFD, 0, &[0x77]).unwrap();

        // Wrong id: nothing happens.
        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &[0x20, config_cmd::FACTORY_RESET, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
        );
        assert!(reply.is_none());
        let mut byte = [0u8; 1];
        storage.read(node.id, 0xFD, 0, &mut byte).unwrap();
        assert_eq!(byte[0], 0x77);

        // Matching id wipes the configuration.
        let mut confirm = [0x20, config_cmd::FACTORY_RESET, 0, 0, 0, 0, 0, 0];
        confirm[2..8].copy_from_slice(node.id.as_bytes());
        let (_, reply) = run_command(
            &mut service,
            &mut node,
            &mut pool,
            &mut storage,
            &confirm,
        );
        assert!(reply.is_none());
        storage.read(node.id, 0xFD, 0, &mut byte).unwrap();
        assert_eq!(byte[0], 0);
    }

    #[test]
    fn test_rejected_with_resend_bit_flags_retry() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();

        let pending = pool.allocate(PayloadClass::Datagram).unwrap();
        node.pending_datagram = Some(pending);

        let rejection = datagram(&mut pool, &[]);
        {
            let msg = pool.get_mut(rejection);
            msg.mti = Mti::DatagramRejected;
            msg.payload
                .extend_from_slice(&error::BUFFER_UNAVAILABLE.to_be_bytes())
                .unwrap();
        }
        service.handle_datagram_rejected(&mut node, &mut pool, rejection);
        assert!(node.flags.contains(NodeFlags::RESEND_DATAGRAM));
        assert!(node.pending_datagram.is_some());
        assert_eq!(node.datagram_resend_count, 1);
    }

    #[test]
    fn test_rejected_permanent_frees_pending() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();

        let pending = pool.allocate(PayloadClass::Datagram).unwrap();
        node.pending_datagram = Some(pending);

        let rejection = datagram(&mut pool, &[]);
        {
            let msg = pool.get_mut(rejection);
            msg.mti = Mti::DatagramRejected;
            msg.payload
                .extend_from_slice(&error::WRITE_TO_READ_ONLY.to_be_bytes())
                .unwrap();
        }
        service.handle_datagram_rejected(&mut node, &mut pool, rejection);
        assert!(node.pending_datagram.is_none());
        assert_eq!(pool.refcount(pending), 0);
    }

    #[test]
    fn test_received_ok_completes_pending() {
        let mut service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();

        let pending = pool.allocate(PayloadClass::Datagram).unwrap();
        node.pending_datagram = Some(pending);

        let ok = datagram(&mut pool, &[]);
        pool.get_mut(ok).mti = Mti::DatagramReceivedOk;
        service.handle_datagram_received_ok(&mut node, &mut pool, ok);
        assert!(node.pending_datagram.is_none());
        assert_eq!(pool.stats(PayloadClass::Datagram).allocated, 1);
    }
}
