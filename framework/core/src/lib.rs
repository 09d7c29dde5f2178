#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

#[cfg(test)]
extern crate alloc;

pub mod config {
    //! Compile-time sizing of the fixed storage in this crate.
    #![allow(unused)]

    /// Pool depths per payload class.
    pub const BASIC_POOL_DEPTH: usize = 10;
    pub const DATAGRAM_POOL_DEPTH: usize = 4;
    pub const SNIP_POOL_DEPTH: usize = 2;
    pub const STREAM_POOL_DEPTH: usize = 1;

    /// Capacity of each per-node event list.
    pub const MAX_EVENTS_PER_LIST: usize = 16;

    /// Datagram retransmissions before the failure is surfaced.
    pub const DATAGRAM_RESEND_LIMIT: u8 = 3;

    /// Ticks (100 ms each) a transmitted datagram may wait for its ACK.
    pub const DATAGRAM_REPLY_PENDING_TICKS: u16 = 30;
}

pub mod buffer;
pub mod event;
pub mod handler;
pub mod message;
pub mod node;
pub mod node_id;
