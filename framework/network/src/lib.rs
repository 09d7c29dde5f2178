#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

#[cfg(test)]
extern crate alloc;

#[macro_use]
mod macros;

pub mod config {
    //! Compile-time sizing of the interface queues.
    #![allow(unused)]

    /// Raw CAN control frames waiting for the driver.
    pub const CONTROL_QUEUE_DEPTH: usize = 8;

    /// Assembled messages waiting for the dispatcher.
    pub const RX_FIFO_DEPTH: usize = 8;

    /// Outgoing messages waiting for the fragmenter.
    pub const TX_FIFO_DEPTH: usize = 8;

    /// Concurrent multi-frame assemblies.
    pub const ASSEMBLY_DEPTH: usize = 4;

    /// Alias mapping table slots; bounds the local node count.
    pub const ALIAS_MAP_DEPTH: usize = 8;

    /// 100 ms ticks of bus silence before a candidate alias is claimed.
    pub const LOGIN_WAIT_TICKS: u16 = 2;
}

#[cfg(feature = "medium-can")]
pub mod iface;
pub mod phy;
pub mod wire;
