use openlcb_core::node_id::NodeId;
use openlcb_defs::MemorySpace;

use crate::{ConfigurationStorage, Error};

/// A volatile backend holding the primary configuration space and the
/// user ACDI space in RAM. The natural choice for tests and for nodes
/// whose configuration does not survive power cycles anyway.
#[derive(Debug)]
pub struct RamStorage<const CONFIG: usize, const USER: usize> {
    config: [u8; CONFIG],
    user: [u8; USER],
    frozen_space: Option<u8>,
    reboot_requests: u32,
    update_requests: u32,
}

impl<const CONFIG: usize, const USER: usize> RamStorage<CONFIG, USER> {
    pub fn new() -> Self {
        Self {
            config: [0; CONFIG],
            user: [0; USER],
            frozen_space: None,
            reboot_requests: 0,
            update_requests: 0,
        }
    }

    fn region(&mut self, space: u8) -> Option<&mut [u8]> {
        match MemorySpace::from(space) {
            MemorySpace::Configuration | MemorySpace::All => Some(&mut self.config),
            MemorySpace::AcdiUser => Some(&mut self.user),
            _ => None,
        }
    }

    pub fn frozen_space(&self) -> Option<u8> {
        self.frozen_space
    }

    pub fn reboot_requests(&self) -> u32 {
        self.reboot_requests
    }

    pub fn update_requests(&self) -> u32 {
        self.update_requests
    }
}

impl<const CONFIG: usize, const USER: usize> Default for RamStorage<CONFIG, USER> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CONFIG: usize, const USER: usize> ConfigurationStorage for RamStorage<CONFIG, USER> {
    fn read(
        &mut self,
        _node: NodeId,
        space: u8,
        offset: u32,
        buffer: &mut [u8],
    ) -> Result<usize, Error> {
        let region = self.region(space).ok_or(Error::Unsupported)?;
        let offset = offset as usize;
        if offset >= region.len() {
            return Err(Error::OutOfRange);
        }
        let count = buffer.len().min(region.len() - offset);
        buffer[..count].copy_from_slice(&region[offset..offset + count]);
        Ok(count)
    }

    fn write(&mut self, _node: NodeId, space: u8, offset: u32, data: &[u8]) -> Result<(), Error> {
        let region = self.region(space).ok_or(Error::Unsupported)?;
        let offset = offset as usize;
        if offset + data.len() > region.len() {
            return Err(Error::OutOfRange);
        }
        region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn freeze(&mut self, _node: NodeId, space: u8) -> Result<(), Error> {
        self.frozen_space = Some(space);
        Ok(())
    }

    fn unfreeze(&mut self, _node: NodeId, space: u8) -> Result<(), Error> {
        if self.frozen_space == Some(space) {
            self.frozen_space = None;
        }
        Ok(())
    }

    fn update_complete(&mut self, _node: NodeId) {
        self.update_requests += 1;
    }

    fn reboot(&mut self, _node: NodeId) {
        self.reboot_requests += 1;
    }

    fn factory_reset(&mut self, _node: NodeId) -> Result<(), Error> {
        self.config.fill(0);
        self.user.fill(0);
        Ok(())
    }
}
