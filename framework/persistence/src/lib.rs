#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Configuration-memory backends.

The memory configuration protocol never touches hardware itself; it is
handed a [`ConfigurationStorage`] and calls it with (node, space,
offset, buffer) requests whose bounds the protocol layer has already
checked against the node's address-space descriptors. Implementations
decide the physical layout: a RAM block, an EEPROM region behind an
`embedded-storage` driver, a file on a host build.
*/

use core::fmt;

use openlcb_core::node_id::NodeId;

pub mod ram;
pub mod storage_backed;

pub use ram::RamStorage;
pub use storage_backed::StorageBacked;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The request runs past the end of the space.
    OutOfRange,
    /// The space rejects writes.
    ReadOnly,
    /// The backend does not implement this operation.
    Unsupported,
    /// The underlying driver failed.
    Storage,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfRange => write!(f, "out of range"),
            Error::ReadOnly => write!(f, "read only"),
            Error::Unsupported => write!(f, "unsupported"),
            Error::Storage => write!(f, "storage failure"),
        }
    }
}

/// The injected configuration-memory backend.
///
/// `read` returns the octet count actually produced, which may fall
/// short of the buffer at the end of a space. Operations a backend does
/// not care about fall through to `Unsupported` / no-ops.
pub trait ConfigurationStorage {
    fn read(
        &mut self,
        node: NodeId,
        space: u8,
        offset: u32,
        buffer: &mut [u8],
    ) -> Result<usize, Error>;

    fn write(&mut self, node: NodeId, space: u8, offset: u32, data: &[u8]) -> Result<(), Error>;

    /// Stop interpreting `space` at runtime, for firmware upload.
    fn freeze(&mut self, _node: NodeId, _space: u8) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn unfreeze(&mut self, _node: NodeId, _space: u8) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Apply configuration written since the last checkpoint.
    fn update_complete(&mut self, _node: NodeId) {}

    /// Restart the node. The default does nothing, which suits hosted
    /// test builds.
    fn reboot(&mut self, _node: NodeId) {}

    /// Restore every writable space to factory defaults.
    fn factory_reset(&mut self, _node: NodeId) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}
