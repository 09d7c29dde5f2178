//! CAN adaptation constants (S-9.7.2.1).
//!
//! A 29-bit extended identifier splits into a reserved top bit, an
//! OpenLCB/control discriminator, a three-bit frame type, a twelve-bit
//! variable field and the twelve-bit source alias. Control frames reuse
//! the frame-type bits as a check-id sequence number.

use num_enum::{FromPrimitive, IntoPrimitive};

/// Bit 28. Always set on frames emitted by this stack.
pub const RESERVED_TOP_BIT: u32 = 0x1000_0000;

/// Bit 27. Set on OpenLCB message frames, clear on CAN control frames.
pub const OPENLCB_MESSAGE_BIT: u32 = 0x0800_0000;

pub const MASK_FRAME_TYPE: u32 = 0x0F00_0000;
pub const MASK_FRAME_SEQUENCE: u32 = 0x0700_0000;
pub const MASK_VARIABLE_FIELD: u32 = 0x07FF_F000;
pub const MASK_CAN_MTI: u32 = 0x00FF_F000;
pub const MASK_SOURCE_ALIAS: u32 = 0x0000_0FFF;

/// Identifier bit telling that the first two payload octets carry the
/// destination alias (global/addressed and stream frame types only).
pub const MASK_DEST_ADDRESS_PRESENT: u32 = 0x0000_8000;

/// Frame type field of an OpenLCB message frame (identifier bits 24..=26).
#[derive(Debug, PartialEq, Eq, Clone, Copy, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    #[num_enum(default)]
    Reserved0 = 0,
    GlobalAddressed = 1,
    DatagramOnly = 2,
    DatagramFirst = 3,
    DatagramMiddle = 4,
    DatagramFinal = 5,
    Reserved6 = 6,
    Stream = 7,
}

impl FrameType {
    #[inline]
    pub fn is_datagram(self) -> bool {
        matches!(
            self,
            FrameType::DatagramOnly
                | FrameType::DatagramFirst
                | FrameType::DatagramMiddle
                | FrameType::DatagramFinal
        )
    }
}

/// Check-ID sequence values, pre-shifted into identifier position.
pub const CONTROL_CID7: u32 = 0x0700_0000;
pub const CONTROL_CID6: u32 = 0x0600_0000;
pub const CONTROL_CID5: u32 = 0x0500_0000;
pub const CONTROL_CID4: u32 = 0x0400_0000;
pub const CONTROL_CID3: u32 = 0x0300_0000;
pub const CONTROL_CID2: u32 = 0x0200_0000;
pub const CONTROL_CID1: u32 = 0x0100_0000;

/// Control frame variable-field values, pre-shifted into position.
pub const CONTROL_RID: u32 = 0x0070_0000;
pub const CONTROL_AMD: u32 = 0x0070_1000;
pub const CONTROL_AME: u32 = 0x0070_2000;
pub const CONTROL_AMR: u32 = 0x0070_3000;
pub const CONTROL_ERROR_INFO_0: u32 = 0x0071_0000;
pub const CONTROL_ERROR_INFO_1: u32 = 0x0071_1000;
pub const CONTROL_ERROR_INFO_2: u32 = 0x0071_2000;
pub const CONTROL_ERROR_INFO_3: u32 = 0x0071_3000;

/// Framing bits: upper two bits of the first payload octet of an addressed
/// non-datagram frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Framing {
    #[num_enum(default)]
    Only = 0x00,
    First = 0x40,
    Middle = 0xC0,
    Last = 0x80,
}

pub const FRAMING_MASK: u8 = 0xC0;

/// The PC-Event-Report-With-Payload CAN encoding: three dedicated CAN-MTIs
/// stand in for framing bits, because global frames carry no destination
/// prefix to put them in.
pub const CAN_MTI_PCER_PAYLOAD_FIRST: u16 = 0x5B5;
pub const CAN_MTI_PCER_PAYLOAD_MIDDLE: u16 = 0x5B6;
pub const CAN_MTI_PCER_PAYLOAD_LAST: u16 = 0x5B7;

/// Data octets available in one frame.
pub const FRAME_PAYLOAD_LEN: usize = 8;

/// Data octets available when a destination alias prefix is present.
pub const FRAME_PAYLOAD_LEN_ADDRESSED: usize = 6;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_type_decode() {
        assert_eq!(FrameType::from(1u8), FrameType::GlobalAddressed);
        assert_eq!(FrameType::from(7u8), FrameType::Stream);
        assert!(FrameType::DatagramMiddle.is_datagram());
        assert!(!FrameType::GlobalAddressed.is_datagram());
    }

    #[test]
    fn test_framing_decode() {
        assert_eq!(Framing::from(0x40u8), Framing::First);
        assert_eq!(Framing::from(0xC0u8), Framing::Middle);
        assert_eq!(Framing::from(0x80u8), Framing::Last);
        assert_eq!(Framing::from(0x00u8), Framing::Only);
    }

    #[test]
    fn test_control_fields_line_up_with_wire_examples() {
        // AMD claiming alias 0x6BE: identifier 0x107016BE.
        assert_eq!(RESERVED_TOP_BIT | CONTROL_AMD | 0x6BE, 0x107016BE);
        // AMR for the same alias: identifier 0x107036BE.
        assert_eq!(RESERVED_TOP_BIT | CONTROL_AMR | 0x6BE, 0x107036BE);
    }
}
