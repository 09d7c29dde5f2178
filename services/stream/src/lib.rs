#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Stream transport.

The negotiated-window handshake of S-9.7.4: an initiate request offers
a buffer size, the reply accepts the smaller of the peer's offer and
our stream buffer, data frames count against the window and each
exhausted window is answered with a proceed. One stream at a time.
*/

use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::handler::{allocate_reply, OutgoingSlot};
use openlcb_core::message::{PayloadClass, LEN_STREAM};
use openlcb_core::node::Node;
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::{error, Mti};

/// State of the one receive stream this service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveStream {
    peer: Alias,
    source_stream_id: u8,
    dest_stream_id: u8,
    window: u16,
    received_in_window: u16,
    total: u32,
}

/// The stream transport handler.
#[derive(Default)]
pub struct Service {
    active: Option<ActiveStream>,
    next_stream_id: u8,
    /// A window of stream data arrived: (node, data).
    pub on_stream_data: Option<fn(&mut Node, &[u8])>,
    /// The sender signalled completion: (node, total octets).
    pub on_stream_complete: Option<fn(&mut Node, u32)>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream Initiate Request: [buffer u16, flags, additional flags,
    /// source stream id]. Accept with our negotiated window, or reject
    /// while another stream is running.
    pub fn handle_initiate_request(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, offered, source_stream_id) = {
            let msg = pool.get(incoming);
            if msg.payload.len() < 5 {
                return;
            }
            (
                msg.source_alias,
                msg.source_id,
                msg.word_at(0),
                msg.byte_at(4),
            )
        };

        let accept = self.active.is_none();
        let window = offered.min(LEN_STREAM as u16);

        let Some(handle) = allocate_reply(
            pool,
            node,
            peer_alias,
            peer_id,
            PayloadClass::Basic,
            Mti::StreamInitiateReply,
        ) else {
            return;
        };
        let msg = pool.get_mut(handle);
        if accept {
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            let dest_stream_id = self.next_stream_id;
            msg.set_word(0, window).unwrap();
            // Flag 0x80: request accepted.
            msg.set_byte(2, 0x80).unwrap();
            msg.set_byte(3, 0x00).unwrap();
            msg.set_byte(4, source_stream_id).unwrap();
            msg.set_byte(5, dest_stream_id).unwrap();
            self.active = Some(ActiveStream {
                peer: peer_alias,
                source_stream_id,
                dest_stream_id,
                window,
                received_in_window: 0,
                total: 0,
            });
        } else {
            msg.set_word(0, 0).unwrap();
            msg.set_byte(2, 0x00).unwrap();
            msg.set_byte(3, 0x00).unwrap();
            msg.set_byte(4, source_stream_id).unwrap();
            msg.set_byte(5, error::BUFFER_UNAVAILABLE as u8).unwrap();
        }
        out.set(handle);
    }

    /// Stream data frames, counted against the window; an exhausted
    /// window triggers a proceed message.
    pub fn handle_data_send(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, data_len) = {
            let msg = pool.get(incoming);
            (msg.source_alias, msg.payload.len() as u16)
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.peer != peer_alias {
            return;
        }
        active.received_in_window += data_len;
        active.total += u32::from(data_len);

        if let Some(callback) = self.on_stream_data {
            let data = pool.get(incoming).payload.as_slice();
            callback(node, data);
        }

        if active.received_in_window >= active.window {
            active.received_in_window = 0;
            let (source_stream_id, dest_stream_id) =
                (active.source_stream_id, active.dest_stream_id);
            let Some(handle) = allocate_reply(
                pool,
                node,
                peer_alias,
                NodeId::NULL,
                PayloadClass::Basic,
                Mti::StreamDataProceed,
            ) else {
                return;
            };
            let msg = pool.get_mut(handle);
            msg.set_byte(0, source_stream_id).unwrap();
            msg.set_byte(1, dest_stream_id).unwrap();
            out.set(handle);
        }
    }

    /// Stream Data Complete closes the stream.
    pub fn handle_data_complete(&mut self, node: &mut Node, pool: &mut Pool, incoming: Handle) {
        let peer_alias = pool.get(incoming).source_alias;
        let Some(active) = self.active else {
            return;
        };
        if active.peer != peer_alias {
            return;
        }
        self.active = None;
        if let Some(callback) = self.on_stream_complete {
            callback(node, active.total);
        }
    }

    /// A peer's initiate reply or proceed for a stream we would be
    /// sending. Outbound streams are not initiated by this service, so
    /// these only feed the application hooks of a future sender.
    pub fn handle_initiate_reply(&mut self, _node: &mut Node, _pool: &mut Pool, _incoming: Handle) {}

    pub fn handle_data_proceed(&mut self, _node: &mut Node, _pool: &mut Pool, _incoming: Handle) {}
}
