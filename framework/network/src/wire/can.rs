use core::borrow::BorrowMut;
use core::fmt;

use arbitrary_int::{u12, u3};
use byteorder::{ByteOrder, NetworkEndian};
use openlcb_core::node_id::Alias;
use openlcb_defs::can::{
    self, FrameType, MASK_DEST_ADDRESS_PRESENT, MASK_VARIABLE_FIELD, OPENLCB_MESSAGE_BIT,
    RESERVED_TOP_BIT,
};

use super::{Error, Result};

/// The 29-bit extended CAN identifier of an OpenLCB frame.
///
/// Bit 28 is reserved (always one here), bit 27 separates OpenLCB message
/// frames from CAN control frames, bits 24..=26 carry the frame type or
/// check-id sequence, bits 12..=23 the variable field and bits 0..=11 the
/// source alias.
#[bitbybit::bitfield(u32)]
pub struct Identifier {
    #[bit(28, rw)]
    reserved: bool,
    #[bit(27, rw)]
    openlcb: bool,
    #[bits(24..=26, rw)]
    frame_type_bits: u3,
    #[bits(12..=23, rw)]
    variable_field: u12,
    #[bits(0..=11, rw)]
    alias_bits: u12,
}

/// What a received frame turned out to be, after splitting the identifier.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameClass {
    /// One of the four (historically seven) check-id frames.
    CheckId { sequence: u8 },
    ReserveId,
    AliasMapDefinition,
    AliasMapEnquiry,
    AliasMapReset,
    ErrorInformationReport { severity: u8 },
    ControlReserved,
    /// Unaddressed OpenLCB message frame.
    Global,
    /// Addressed OpenLCB message frame; destination in the payload prefix.
    Addressed,
    DatagramOnly,
    DatagramFirst,
    DatagramMiddle,
    DatagramFinal,
    Stream,
    Reserved,
}

impl Identifier {
    pub fn from_raw(raw: u32) -> Self {
        Self::new_with_raw_value(raw & 0x1FFF_FFFF)
    }

    pub const fn raw(&self) -> u32 {
        self.raw_value()
    }

    /// Build a CAN control frame identifier from a pre-shifted field value
    /// (one of the `openlcb_defs::can::CONTROL_*` constants or a check-id
    /// value OR'd with a node id slice).
    pub fn control(field: u32, source: Alias) -> Self {
        Self::from_raw(
            RESERVED_TOP_BIT | (field & MASK_VARIABLE_FIELD) | u32::from(source.value()),
        )
    }

    /// Build a global or addressed message frame identifier.
    pub fn message(can_mti: u16, source: Alias) -> Self {
        Self::from_raw(
            RESERVED_TOP_BIT
                | OPENLCB_MESSAGE_BIT
                | ((FrameType::GlobalAddressed as u32) << 24)
                | ((can_mti as u32 & 0xFFF) << 12)
                | u32::from(source.value()),
        )
    }

    /// Build a datagram or stream frame identifier; those carry the
    /// destination alias in the variable field.
    pub fn with_dest(frame_type: FrameType, dest: Alias, source: Alias) -> Self {
        Self::from_raw(
            RESERVED_TOP_BIT
                | OPENLCB_MESSAGE_BIT
                | ((frame_type as u32) << 24)
                | (u32::from(dest.value()) << 12)
                | u32::from(source.value()),
        )
    }

    pub fn source_alias(&self) -> Alias {
        Alias::new(self.alias_bits().value())
    }

    pub fn is_openlcb_message(&self) -> bool {
        self.openlcb()
    }

    /// The 12-bit CAN-MTI of a global or addressed frame.
    pub fn can_mti(&self) -> u16 {
        self.variable_field().value()
    }

    /// Destination alias of a datagram or stream frame.
    pub fn dest_alias(&self) -> Alias {
        Alias::new(self.variable_field().value())
    }

    /// Whether the payload starts with a two-octet destination prefix.
    pub fn dest_in_payload(&self) -> bool {
        self.raw() & MASK_DEST_ADDRESS_PRESENT != 0
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from(self.frame_type_bits().value())
    }

    pub fn classify(&self) -> FrameClass {
        if self.is_openlcb_message() {
            return match self.frame_type() {
                FrameType::GlobalAddressed => {
                    if self.dest_in_payload() {
                        FrameClass::Addressed
                    } else {
                        FrameClass::Global
                    }
                }
                FrameType::DatagramOnly => FrameClass::DatagramOnly,
                FrameType::DatagramFirst => FrameClass::DatagramFirst,
                FrameType::DatagramMiddle => FrameClass::DatagramMiddle,
                FrameType::DatagramFinal => FrameClass::DatagramFinal,
                FrameType::Stream => FrameClass::Stream,
                FrameType::Reserved0 | FrameType::Reserved6 => FrameClass::Reserved,
            };
        }

        let sequence = self.frame_type_bits().value();
        if sequence != 0 {
            return FrameClass::CheckId { sequence };
        }

        match u32::from(self.variable_field().value()) << 12 {
            can::CONTROL_RID => FrameClass::ReserveId,
            can::CONTROL_AMD => FrameClass::AliasMapDefinition,
            can::CONTROL_AME => FrameClass::AliasMapEnquiry,
            can::CONTROL_AMR => FrameClass::AliasMapReset,
            can::CONTROL_ERROR_INFO_0 => FrameClass::ErrorInformationReport { severity: 0 },
            can::CONTROL_ERROR_INFO_1 => FrameClass::ErrorInformationReport { severity: 1 },
            can::CONTROL_ERROR_INFO_2 => FrameClass::ErrorInformationReport { severity: 2 },
            can::CONTROL_ERROR_INFO_3 => FrameClass::ErrorInformationReport { severity: 3 },
            _ => FrameClass::ControlReserved,
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Identifier({:08X})", self.raw())
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for Identifier {}

#[cfg(feature = "defmt")]
impl defmt::Format for Identifier {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Identifier({=u32:08X})", self.raw())
    }
}

mod field {
    use crate::wire::field::*;

    // Four octets of big-endian extended identifier, then 0..=8 octets of
    // payload. This buffer is a convenient layout, not the bus bit image.
    pub const ID: Field = 0..4;
    pub const PAYLOAD: Rest = 4..;
}

/// The CAN header length.
pub const HEADER_LEN: usize = field::PAYLOAD.start;

/// Data octets a single frame can carry.
pub const MTU: usize = 8;

/// Largest buffer a frame can occupy.
pub const FRAME_LEN: usize = HEADER_LEN + MTU;

/// An owned frame buffer, sized for the worst case.
pub type FrameBuffer = heapless::Vec<u8, FRAME_LEN>;

/// Build an owned frame buffer from parts.
///
/// # Panics
/// The function panics if `payload` exceeds [`MTU`] octets.
pub fn frame_buffer(identifier: Identifier, payload: &[u8]) -> FrameBuffer {
    let mut buffer = FrameBuffer::new();
    buffer.resize(HEADER_LEN, 0).unwrap();
    NetworkEndian::write_u32(&mut buffer[field::ID], identifier.raw());
    buffer.extend_from_slice(payload).unwrap();
    buffer
}

/// A read/write wrapper around a CAN frame buffer.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Frame<T> {
    /// Construct a raw CAN frame without checking anything.
    pub const fn new_unchecked(buffer: T) -> Frame<T> {
        Frame { buffer }
    }

    /// Shorthand for a combination of [new_unchecked], [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Frame<T>> {
        let frame = Self::new_unchecked(buffer);
        frame.check_len()?;
        Ok(frame)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is too short or too long.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN || len - HEADER_LEN > MTU {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Consume the frame, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the length of a frame header.
    pub const fn header_len() -> usize {
        HEADER_LEN
    }

    /// Return the length of a buffer required to hold a frame with the
    /// payload of a given length.
    pub const fn buffer_len(payload_len: usize) -> usize {
        HEADER_LEN + payload_len
    }

    /// Return the identifier field.
    #[inline]
    pub fn identifier(&self) -> Identifier {
        Identifier::from_raw(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ID]))
    }

    /// Return the number of payload octets.
    #[inline]
    pub fn payload_count(&self) -> usize {
        self.buffer.as_ref().len() - HEADER_LEN
    }

    /// Destination alias, when this frame carries one.
    ///
    /// Addressed message frames keep it in the payload prefix; datagram
    /// and stream frames in the identifier.
    pub fn dest_alias(&self) -> Option<Alias> {
        let ident = self.identifier();
        match ident.classify() {
            FrameClass::Addressed => {
                let payload = &self.buffer.as_ref()[field::PAYLOAD];
                if payload.len() < 2 {
                    return None;
                }
                Some(Alias::new(
                    (u16::from(payload[0] & 0x0F) << 8) | u16::from(payload[1]),
                ))
            }
            FrameClass::DatagramOnly
            | FrameClass::DatagramFirst
            | FrameClass::DatagramMiddle
            | FrameClass::DatagramFinal
            | FrameClass::Stream => Some(ident.dest_alias()),
            _ => None,
        }
    }

    /// Framing bits of an addressed non-datagram frame.
    pub fn framing(&self) -> openlcb_defs::can::Framing {
        let payload = &self.buffer.as_ref()[field::PAYLOAD];
        if payload.is_empty() {
            return openlcb_defs::can::Framing::Only;
        }
        openlcb_defs::can::Framing::from(payload[0] & can::FRAMING_MASK)
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Frame<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[field::PAYLOAD]
    }
}

impl<T: AsRef<[u8]> + BorrowMut<[u8]>> Frame<T> {
    /// Set the identifier field.
    #[inline]
    pub fn set_identifier(&mut self, value: Identifier) {
        let data = self.buffer.borrow_mut();
        NetworkEndian::write_u32(&mut data[field::ID], value.raw());
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let data = self.buffer.borrow_mut();
        &mut data[field::PAYLOAD]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Frame<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Frame<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CAN {:08X} [{}]",
            self.identifier().raw(),
            self.payload_count()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use openlcb_defs::can::Framing;

    #[test]
    fn test_identifier_fields() {
        // SNIP reply from alias AAA: global/addressed frame, CAN-MTI A08.
        let ident = Identifier::from_raw(0x19A0_8AAA);
        assert!(ident.is_openlcb_message());
        assert_eq!(ident.frame_type(), FrameType::GlobalAddressed);
        assert_eq!(ident.can_mti(), 0xA08);
        assert_eq!(ident.source_alias(), Alias::new(0xAAA));
        assert!(ident.dest_in_payload());
        assert_eq!(ident.classify(), FrameClass::Addressed);
    }

    #[test]
    fn test_classify_global() {
        // Verified Node ID from alias 6BE: no destination.
        let ident = Identifier::from_raw(0x1917_06BE);
        assert_eq!(ident.classify(), FrameClass::Global);
        assert!(!ident.dest_in_payload());
    }

    #[test]
    fn test_classify_datagram() {
        let ident = Identifier::from_raw(0x1AFF_FAAA);
        assert_eq!(ident.classify(), FrameClass::DatagramOnly);
        assert_eq!(ident.dest_alias(), Alias::new(0xFFF));
        assert_eq!(ident.source_alias(), Alias::new(0xAAA));

        assert_eq!(
            Identifier::from_raw(0x1BFF_FAAA).classify(),
            FrameClass::DatagramFirst
        );
        assert_eq!(
            Identifier::from_raw(0x1CFF_FAAA).classify(),
            FrameClass::DatagramMiddle
        );
        assert_eq!(
            Identifier::from_raw(0x1DFF_FAAA).classify(),
            FrameClass::DatagramFinal
        );
    }

    #[test]
    fn test_classify_control_frames() {
        assert_eq!(
            Identifier::from_raw(0x1070_06BE).classify(),
            FrameClass::ReserveId
        );
        assert_eq!(
            Identifier::from_raw(0x1070_16BE).classify(),
            FrameClass::AliasMapDefinition
        );
        assert_eq!(
            Identifier::from_raw(0x1070_26BE).classify(),
            FrameClass::AliasMapEnquiry
        );
        assert_eq!(
            Identifier::from_raw(0x1070_36BE).classify(),
            FrameClass::AliasMapReset
        );
        assert_eq!(
            Identifier::from_raw(0x1071_26BE).classify(),
            FrameClass::ErrorInformationReport { severity: 2 }
        );
        assert_eq!(
            Identifier::from_raw(0x1705_0ABC).classify(),
            FrameClass::CheckId { sequence: 7 }
        );
        assert_eq!(
            Identifier::from_raw(0x1410_1ABC).classify(),
            FrameClass::CheckId { sequence: 4 }
        );
    }

    #[test]
    fn test_check_id_identifier_construction() {
        // CID7 for node 05.01.01.01.07.07 and candidate alias ABC carries
        // the top node id slice 0x050 in the variable field.
        let id_word: u64 = 0x0501_0101_0707;
        let slice = ((id_word >> 24) as u32) & 0xFFF0_00;
        let ident = Identifier::control(can::CONTROL_CID7 | slice, Alias::new(0xABC));
        assert_eq!(ident.raw(), 0x1705_0ABC);
    }

    #[test]
    fn test_frame_payload_and_dest() {
        // Addressed frame to FFF with framing First.
        let buffer = frame_buffer(
            Identifier::from_raw(0x19A0_8AAA),
            &[0x4F, 0xFF, 0x01, 0x02],
        );
        let frame = Frame::new_checked(&buffer[..]).unwrap();
        assert_eq!(frame.payload_count(), 4);
        assert_eq!(frame.dest_alias(), Some(Alias::new(0xFFF)));
        assert_eq!(frame.framing(), Framing::First);
        assert_eq!(frame.payload(), &[0x4F, 0xFF, 0x01, 0x02]);
    }

    #[test]
    fn test_dest_alias_from_identifier() {
        let buffer = frame_buffer(Identifier::from_raw(0x1AFF_FAAA), &[0x20, 0x53]);
        let frame = Frame::new_checked(&buffer[..]).unwrap();
        assert_eq!(frame.dest_alias(), Some(Alias::new(0xFFF)));
    }

    #[test]
    fn test_check_len() {
        assert!(Frame::new_checked(&[0u8; 3][..]).is_err());
        assert!(Frame::new_checked(&[0u8; 4][..]).is_ok());
        assert!(Frame::new_checked(&[0u8; 12][..]).is_ok());
        assert!(Frame::new_checked(&[0u8; 13][..]).is_err());
    }

    #[test]
    fn test_set_identifier() {
        let mut storage = [0u8; 6];
        let mut frame = Frame::new_unchecked(&mut storage[..]);
        frame.set_identifier(Identifier::message(0x490, Alias::new(0x123)));
        frame.payload_mut().copy_from_slice(&[0xAB, 0xCD]);
        let frame = Frame::new_unchecked(&storage[..]);
        assert_eq!(frame.identifier().raw(), 0x1949_0123);
        assert_eq!(frame.payload(), &[0xAB, 0xCD]);
    }
}
