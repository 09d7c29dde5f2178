#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

//! Protocol constant tables for OpenLCB (NMRA S-9.7, "LCC").
//!
//! Everything in this crate is a plain value taken from the published
//! standards: message type indicators, CAN adaptation fields, memory
//! configuration commands, error codes. No behavior lives here.

use num_enum::{FromPrimitive, IntoPrimitive};

pub mod can;

/// 16-bit Message Type Indicator.
///
/// The set below covers the message network, event transport, datagram,
/// stream, SNIP and traction protocols. Anything else decodes to
/// [`Mti::Unknown`] and is answered with an Optional Interaction Rejected
/// carrying a not-implemented code.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mti {
    InitializationComplete = 0x0100,
    InitializationCompleteSimple = 0x0101,
    VerifyNodeIdAddressed = 0x0488,
    VerifyNodeIdGlobal = 0x0490,
    VerifiedNodeId = 0x0170,
    VerifiedNodeIdSimple = 0x0171,
    OptionalInteractionRejected = 0x0068,
    TerminateDueToError = 0x00A8,

    ProtocolSupportInquiry = 0x0828,
    ProtocolSupportReply = 0x0668,

    IdentifyConsumer = 0x08F4,
    ConsumerRangeIdentified = 0x04A4,
    ConsumerIdentifiedValid = 0x04C4,
    ConsumerIdentifiedInvalid = 0x04C5,
    ConsumerIdentifiedReserved = 0x04C6,
    ConsumerIdentifiedUnknown = 0x04C7,
    IdentifyProducer = 0x0914,
    ProducerRangeIdentified = 0x0524,
    ProducerIdentifiedValid = 0x0544,
    ProducerIdentifiedInvalid = 0x0545,
    ProducerIdentifiedReserved = 0x0546,
    ProducerIdentifiedUnknown = 0x0547,
    IdentifyEventsGlobal = 0x0970,
    IdentifyEventsAddressed = 0x0968,
    LearnEvent = 0x0594,
    PcEventReport = 0x05B4,
    PcEventReportWithPayload = 0x05B5,

    SimpleNodeInfoRequest = 0x0DE8,
    SimpleNodeInfoReply = 0x0A08,

    Datagram = 0x1C48,
    DatagramReceivedOk = 0x0A28,
    DatagramRejected = 0x0A48,

    StreamInitiateRequest = 0x0CC8,
    StreamInitiateReply = 0x0868,
    StreamDataSend = 0x1F88,
    StreamDataProceed = 0x0888,
    StreamDataComplete = 0x08A8,

    TractionControlCommand = 0x05EB,
    TractionControlReply = 0x01E9,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// MTI bit meaning "the first two payload octets carry a destination".
pub const MTI_ADDRESS_PRESENT: u16 = 0x0008;

/// MTI bit meaning "the payload starts with an event id".
pub const MTI_EVENT_PRESENT: u16 = 0x0004;

/// MTI bit meaning "simple-protocol node emitted this".
pub const MTI_SIMPLE_PROTOCOL: u16 = 0x0010;

impl Mti {
    /// Whether a message with this MTI is addressed to a single node.
    #[inline]
    pub fn is_addressed(self) -> bool {
        match self {
            // The datagram MTI carries no address bit; addressing is
            // implicit in its CAN adaptation.
            Mti::Datagram => true,
            other => u16::from(other) & MTI_ADDRESS_PRESENT != 0,
        }
    }

    /// Whether the payload of this MTI begins with an 8-octet event id.
    #[inline]
    pub fn has_event(self) -> bool {
        u16::from(self) & MTI_EVENT_PRESENT != 0
    }
}

bitflags::bitflags! {
    /// Protocol Support Inquiry reply bits (first three reply octets).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolSupport: u32 {
        const SIMPLE                  = 0x80_0000;
        const DATAGRAM                = 0x40_0000;
        const STREAM                  = 0x20_0000;
        const MEMORY_CONFIGURATION    = 0x10_0000;
        const RESERVATION             = 0x08_0000;
        const EVENT_EXCHANGE          = 0x04_0000;
        const IDENTIFICATION          = 0x02_0000;
        const TEACHING_LEARNING       = 0x01_0000;
        const REMOTE_BUTTON           = 0x00_8000;
        const ABBREVIATED_CDI         = 0x00_4000;
        const DISPLAY                 = 0x00_2000;
        const SIMPLE_NODE_INFO        = 0x00_1000;
        const CDI                     = 0x00_0800;
        const TRACTION_CONTROL        = 0x00_0400;
        const FUNCTION_DESCRIPTION    = 0x00_0200;
        const FUNCTION_CONFIGURATION  = 0x00_0040;
        const FIRMWARE_UPGRADE        = 0x00_0020;
        const FIRMWARE_UPGRADE_ACTIVE = 0x00_0010;
    }
}

/// Memory configuration address space identifiers.
#[derive(Debug, PartialEq, Eq, Clone, Copy, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemorySpace {
    /// Configuration description info, read-only XML.
    Cdi = 0xFF,
    /// Aggregated view over the whole addressable range.
    All = 0xFE,
    /// Primary read/write configuration storage.
    Configuration = 0xFD,
    /// Abbreviated CDI, manufacturer part (read-only).
    AcdiManufacturer = 0xFC,
    /// Abbreviated CDI, user part (read/write).
    AcdiUser = 0xFB,
    TractionFunctionDefinition = 0xFA,
    TractionFunctionConfiguration = 0xF9,
    Firmware = 0xEF,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Memory configuration protocol. Byte 0 of every such datagram.
pub const DATAGRAM_CONFIG_MEM: u8 = 0x20;

/// Memory configuration sub-commands (datagram byte 1).
///
/// Read/write commands encode a well-known address space in their low two
/// bits; `0b00` means the space travels in payload byte 6.
pub mod config_cmd {
    pub const WRITE: u8 = 0x00;
    pub const READ: u8 = 0x40;
    pub const OK_OFFSET: u8 = 0x10;
    pub const FAIL_OFFSET: u8 = 0x18;

    pub const SPACE_IN_BYTE_SIX: u8 = 0x00;
    pub const SPACE_MASK: u8 = 0x03;
    pub const COMMAND_MASK: u8 = !0x03;

    pub const OPTIONS: u8 = 0x80;
    pub const OPTIONS_REPLY: u8 = 0x82;
    pub const GET_SPACE_INFO: u8 = 0x84;
    pub const GET_SPACE_INFO_REPLY_NOT_PRESENT: u8 = 0x86;
    pub const GET_SPACE_INFO_REPLY_PRESENT: u8 = 0x87;
    pub const RESERVE_LOCK: u8 = 0x88;
    pub const RESERVE_LOCK_REPLY: u8 = 0x8A;
    pub const FREEZE: u8 = 0xA0;
    pub const UNFREEZE: u8 = 0xA1;
    pub const GET_UNIQUE_ID: u8 = 0xA8;
    pub const GET_UNIQUE_ID_REPLY: u8 = 0xAB;
    pub const UPDATE_COMPLETE: u8 = 0xA9;
    pub const RESET_REBOOT: u8 = 0xAA;
    pub const FACTORY_RESET: u8 = 0xAC;

    /// Decode the two-bit short-form space field of a read/write command.
    ///
    /// `0b01` selects CDI, `0b10` the all-space view and `0b11` primary
    /// configuration storage.
    pub fn short_form_space(command: u8) -> Option<u8> {
        match command & SPACE_MASK {
            0b01 => Some(0xFF),
            0b10 => Some(0xFE),
            0b11 => Some(0xFD),
            _ => None,
        }
    }
}

/// Options-reply "available commands" bits (datagram bytes 2..=3).
pub mod config_options {
    pub const WRITE_UNDER_MASK: u16 = 0x8000;
    pub const UNALIGNED_READS: u16 = 0x4000;
    pub const UNALIGNED_WRITES: u16 = 0x2000;
    pub const READ_FROM_MANUFACTURER_ACDI: u16 = 0x0800;
    pub const READ_FROM_USER_ACDI: u16 = 0x0400;
    pub const WRITE_TO_USER_ACDI: u16 = 0x0200;
    pub const STREAM_READ_WRITE: u16 = 0x0001;

    /// Write-length byte: 1, 2, 4 and arbitrary-count writes supported.
    pub const WRITE_LENGTHS_BASE: u8 = 0x80 | 0x40 | 0x20 | 0x02;
    pub const WRITE_LENGTH_STREAM: u8 = 0x01;
}

/// 16-bit error codes carried by datagram rejections, OIR, TDE and the
/// memory configuration failure replies.
pub mod error {
    /// Any `0x1xxx` code is permanent: resending the same request is futile.
    pub const PERMANENT: u16 = 0x1000;
    pub const SOURCE_NOT_PERMITTED: u16 = 0x1020;
    pub const NOT_IMPLEMENTED: u16 = 0x1040;
    pub const NOT_IMPLEMENTED_UNKNOWN_MTI: u16 = 0x1041;
    pub const NOT_IMPLEMENTED_UNKNOWN_DATAGRAM_TYPE: u16 = 0x1042;
    pub const NOT_IMPLEMENTED_UNKNOWN_STREAM_TYPE: u16 = 0x1043;
    pub const INVALID_ARGUMENTS: u16 = 0x1080;
    pub const ADDRESS_SPACE_UNKNOWN: u16 = 0x1081;
    pub const ADDRESS_OUT_OF_BOUNDS: u16 = 0x1082;
    pub const WRITE_TO_READ_ONLY: u16 = 0x1083;

    /// Any `0x2xxx` code is temporary: the peer may resend.
    pub const TEMPORARY: u16 = 0x2000;
    pub const TIMEOUT: u16 = 0x2010;
    pub const BUFFER_UNAVAILABLE: u16 = 0x2020;
    pub const OUT_OF_ORDER_MIDDLE_WITHOUT_START: u16 = 0x2041;
    pub const OUT_OF_ORDER_END_WITHOUT_START: u16 = 0x2042;
    pub const TRANSFER_ABORTED: u16 = 0x2080;

    /// Datagram-rejected bit meaning the sender should try again.
    pub const RESEND_OK_MASK: u16 = 0x2000;

    #[inline]
    pub fn is_resend_ok(code: u16) -> bool {
        code & RESEND_OK_MASK != 0
    }
}

/// Simple Node Ident Info layout versions.
pub mod snip {
    /// Leading octet of the manufacturer block: four strings follow.
    pub const MANUFACTURER_VERSION: u8 = 4;
    /// Leading octet of the user block: two strings follow.
    pub const USER_VERSION: u8 = 2;
    /// Nulls in a complete reply (four manufacturer + two user strings).
    pub const NULL_COUNT: u8 = 6;

    pub const MAX_MANUFACTURER_NAME: usize = 41;
    pub const MAX_MODEL_NAME: usize = 41;
    pub const MAX_HARDWARE_VERSION: usize = 21;
    pub const MAX_SOFTWARE_VERSION: usize = 21;
    pub const MAX_USER_NAME: usize = 63;
    pub const MAX_USER_DESCRIPTION: usize = 64;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mti_round_trip() {
        assert_eq!(u16::from(Mti::Datagram), 0x1C48);
        assert_eq!(Mti::from(0x0A08u16), Mti::SimpleNodeInfoReply);
        assert_eq!(Mti::from(0x0666u16), Mti::Unknown(0x0666));
        assert_eq!(u16::from(Mti::Unknown(0x0666)), 0x0666);
    }

    #[test]
    fn test_mti_addressing() {
        assert!(Mti::VerifyNodeIdAddressed.is_addressed());
        assert!(!Mti::VerifyNodeIdGlobal.is_addressed());
        assert!(Mti::Datagram.is_addressed());
        assert!(Mti::SimpleNodeInfoReply.is_addressed());
        assert!(!Mti::PcEventReport.is_addressed());
        assert!(Mti::PcEventReport.has_event());
        assert!(!Mti::SimpleNodeInfoRequest.has_event());
    }

    #[test]
    fn test_short_form_space() {
        assert_eq!(config_cmd::short_form_space(0x43), Some(0xFD));
        assert_eq!(config_cmd::short_form_space(0x42), Some(0xFE));
        assert_eq!(config_cmd::short_form_space(0x41), Some(0xFF));
        assert_eq!(config_cmd::short_form_space(0x40), None);
    }

    #[test]
    fn test_memory_space() {
        assert_eq!(MemorySpace::from(0xFDu8), MemorySpace::Configuration);
        assert_eq!(u8::from(MemorySpace::Firmware), 0xEF);
        assert_eq!(MemorySpace::from(0x42u8), MemorySpace::Other(0x42));
    }

    #[test]
    fn test_error_classes() {
        assert!(error::is_resend_ok(error::BUFFER_UNAVAILABLE));
        assert!(!error::is_resend_ok(error::WRITE_TO_READ_ONLY));
    }
}
