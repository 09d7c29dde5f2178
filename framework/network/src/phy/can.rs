use core::cell::RefCell;
use core::fmt::Debug;

use byteorder::{ByteOrder, NetworkEndian};
use embedded_can::{Error, ExtendedId, Id};
use heapless::Vec;
use rclite::Rc;

use crate::phy;
use crate::wire::can::{FRAME_LEN, HEADER_LEN};

use super::{Device, DeviceCapabilities, Medium};

/// An embedded-can device driver wrapper.
///
/// OpenLCB uses 29-bit identifiers exclusively; standard-id and remote
/// frames seen on a shared bus are ignored.
#[derive(Debug)]
pub struct EmbeddedCan<D: embedded_can::nb::Can> {
    lower: Rc<RefCell<D>>,
}

impl<D: embedded_can::nb::Can> EmbeddedCan<D> {
    /// Creates an embedded-can device, bound to the given device driver.
    pub fn new(device: D) -> Self {
        EmbeddedCan {
            lower: Rc::new(RefCell::new(device)),
        }
    }
}

impl<D: embedded_can::nb::Can> Device for EmbeddedCan<D> {
    type RxToken<'a>
        = RxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<D>
    where
        Self: 'a;

    fn receive(&mut self) -> Option<Self::RxToken<'_>> {
        let mut lower = self.lower.borrow_mut();
        match lower.receive() {
            Ok(frame) => from_can_frame(frame).map(|buffer| RxToken { buffer }),
            Err(nb::Error::WouldBlock) => None,
            Err(nb::Error::Other(err)) => panic!("{}", err.kind()),
        }
    }

    fn transmit(&mut self) -> Option<Self::TxToken<'_>> {
        Some(TxToken {
            lower: self.lower.clone(),
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            medium: Medium::CAN,
            ..DeviceCapabilities::default()
        }
    }
}

#[doc(hidden)]
pub struct RxToken {
    buffer: Vec<u8, FRAME_LEN>,
}

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer[..])
    }
}

#[doc(hidden)]
pub struct TxToken<D: embedded_can::nb::Can> {
    lower: Rc<RefCell<D>>,
}

impl<D: embedded_can::nb::Can> phy::TxToken for TxToken<D> {
    fn consume<R, F>(self, len: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut lower = self.lower.borrow_mut();
        let mut buffer: Vec<u8, FRAME_LEN> = Vec::new();
        buffer.resize(len, 0).ok()?;
        let result = f(&mut buffer[..len]);
        match lower.transmit(&into_can_frame::<D::Frame>(&buffer[..len])) {
            Ok(_) => Some(result),
            Err(nb::Error::WouldBlock) => {
                net_debug!("phy: tx deferred, driver full");
                None
            }
            Err(nb::Error::Other(err)) => panic!("{}", err.kind()),
        }
    }
}

fn into_can_frame<T: embedded_can::Frame>(buffer: &[u8]) -> T {
    let raw = NetworkEndian::read_u32(buffer) & 0x1FFF_FFFF;
    let id = Id::Extended(ExtendedId::new(raw).unwrap());
    T::new(id, &buffer[HEADER_LEN..]).unwrap()
}

fn from_can_frame<T: embedded_can::Frame>(value: T) -> Option<Vec<u8, FRAME_LEN>> {
    if value.is_remote_frame() {
        // OpenLCB never uses RTR.
        return None;
    }
    match value.id() {
        Id::Extended(id) => {
            let mut data = Vec::<u8, FRAME_LEN>::new();
            data.resize(HEADER_LEN, 0).ok()?;
            NetworkEndian::write_u32(&mut data[0..HEADER_LEN], id.as_raw());
            if value.dlc() > 0 {
                data.extend_from_slice(value.data()).ok()?;
            }
            Some(data)
        }
        // Nodes should keep working even if the segment carries standard
        // frames from other protocols; simply ignore them.
        Id::Standard(_) => None,
    }
}

#[cfg(test)]
mod test {
    use embedded_can::{Frame, StandardId};

    use super::*;

    struct TestFrame {
        id: Id,
        remote: bool,
        data: Vec<u8, 8>,
    }

    impl Frame for TestFrame {
        fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
            Some(TestFrame {
                id: id.into(),
                remote: false,
                data: Vec::from_slice(data).unwrap(),
            })
        }

        fn new_remote(id: impl Into<Id>, _dlc: usize) -> Option<Self> {
            Some(TestFrame {
                id: id.into(),
                remote: true,
                data: Vec::new(),
            })
        }

        fn is_extended(&self) -> bool {
            matches!(self.id, Id::Extended(_))
        }

        fn is_remote_frame(&self) -> bool {
            self.remote
        }

        fn is_data_frame(&self) -> bool {
            !self.remote
        }

        fn id(&self) -> Id {
            self.id
        }

        fn dlc(&self) -> usize {
            self.data.len()
        }

        fn data(&self) -> &[u8] {
            &self.data
        }
    }

    #[test]
    fn test_into_can_frame() {
        let buffer = [
            0x19, 0xA0, 0x8A, 0xAA, // identifier
            0x0F, 0xFF, 0xCF, 0x60, // data
            0x56, 0x45, 0x23, 0x66, // data
        ];

        let frame = into_can_frame::<TestFrame>(&buffer);
        assert_eq!(
            frame.id(),
            Id::Extended(ExtendedId::new(0x19A0_8AAA).unwrap())
        );
        assert_eq!(frame.dlc(), 8);
        assert_eq!(
            frame.data(),
            &[0x0F, 0xFF, 0xCF, 0x60, 0x56, 0x45, 0x23, 0x66]
        );
    }

    #[test]
    fn test_from_can_frame_extended() {
        let frame = TestFrame::new(
            Id::Extended(ExtendedId::new(0x19A0_8AAA).unwrap()),
            &[0x0F, 0xFF],
        )
        .unwrap();

        let buffer = from_can_frame(frame).unwrap();
        assert_eq!(&buffer[..], &[0x19, 0xA0, 0x8A, 0xAA, 0x0F, 0xFF]);
    }

    #[test]
    fn test_from_can_frame_standard_is_ignored() {
        let frame = TestFrame::new(
            Id::Standard(StandardId::new(0x123).unwrap()),
            &[0x00],
        )
        .unwrap();
        assert!(from_can_frame(frame).is_none());
    }

    #[test]
    fn test_from_can_frame_remote_is_ignored() {
        let frame = TestFrame::new_remote(
            Id::Extended(ExtendedId::new(0x19A0_8AAA).unwrap()),
            0,
        )
        .unwrap();
        assert!(from_can_frame(frame).is_none());
    }
}
