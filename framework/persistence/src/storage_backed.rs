use embedded_storage::{ReadStorage, Storage};
use openlcb_core::node_id::NodeId;
use openlcb_defs::MemorySpace;

use crate::{ConfigurationStorage, Error};

/// Region of the backing driver assigned to one memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub len: u32,
}

/// A backend that places the configuration and user-ACDI spaces inside
/// any `embedded-storage` driver (EEPROM, flash, a host file wrapper).
#[derive(Debug)]
pub struct StorageBacked<S> {
    driver: S,
    config: Region,
    user: Region,
}

impl<S: Storage> StorageBacked<S> {
    pub fn new(driver: S, config: Region, user: Region) -> Self {
        Self {
            driver,
            config,
            user,
        }
    }

    pub fn into_inner(self) -> S {
        self.driver
    }

    fn region(&self, space: u8) -> Option<Region> {
        match MemorySpace::from(space) {
            MemorySpace::Configuration | MemorySpace::All => Some(self.config),
            MemorySpace::AcdiUser => Some(self.user),
            _ => None,
        }
    }
}

impl<S: Storage> ConfigurationStorage for StorageBacked<S> {
    fn read(
        &mut self,
        _node: NodeId,
        space: u8,
        offset: u32,
        buffer: &mut [u8],
    ) -> Result<usize, Error> {
        let region = self.region(space).ok_or(Error::Unsupported)?;
        if offset >= region.len {
            return Err(Error::OutOfRange);
        }
        let count = (buffer.len() as u32).min(region.len - offset) as usize;
        self.driver
            .read(region.base + offset, &mut buffer[..count])
            .map_err(|_| Error::Storage)?;
        Ok(count)
    }

    fn write(&mut self, _node: NodeId, space: u8, offset: u32, data: &[u8]) -> Result<(), Error> {
        let region = self.region(space).ok_or(Error::Unsupported)?;
        if offset + data.len() as u32 > region.len {
            return Err(Error::OutOfRange);
        }
        self.driver
            .write(region.base + offset, data)
            .map_err(|_| Error::Storage)
    }

    fn factory_reset(&mut self, _node: NodeId) -> Result<(), Error> {
        let zero = [0u8; 16];
        for region in [self.config, self.user] {
            let mut offset = 0;
            while offset < region.len {
                let chunk = (region.len - offset).min(zero.len() as u32) as usize;
                self.driver
                    .write(region.base + offset, &zero[..chunk])
                    .map_err(|_| Error::Storage)?;
                offset += chunk as u32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A byte-array driver, enough to stand in for an EEPROM part.
    struct MemDriver {
        bytes: [u8; 256],
    }

    impl ReadStorage for MemDriver {
        type Error = ();

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            bytes.copy_from_slice(&self.bytes[offset..offset + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl Storage for MemDriver {
        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    const NODE: NodeId = NodeId::from_u64(0x0501_0101_0707);

    fn storage() -> StorageBacked<MemDriver> {
        StorageBacked::new(
            MemDriver { bytes: [0; 256] },
            Region { base: 0, len: 128 },
            Region {
                base: 128,
                len: 128,
            },
        )
    }

    #[test]
    fn test_spaces_map_to_disjoint_regions() {
        let mut backed = storage();
        backed.write(NODE, 0xFD, 0, &[0xAA]).unwrap();
        backed.write(NODE, 0xFB, 0, &[0xBB]).unwrap();
        let driver = backed.into_inner();
        assert_eq!(driver.bytes[0], 0xAA);
        assert_eq!(driver.bytes[128], 0xBB);
    }

    #[test]
    fn test_bounds_are_per_region() {
        let mut backed = storage();
        assert_eq!(
            backed.write(NODE, 0xFD, 120, &[0; 16]),
            Err(Error::OutOfRange)
        );
        let mut buffer = [0u8; 16];
        assert_eq!(backed.read(NODE, 0xFB, 120, &mut buffer), Ok(8));
    }
}
