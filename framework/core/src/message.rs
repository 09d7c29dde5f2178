use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};
use heapless::Vec;
use num_enum::{FromPrimitive, IntoPrimitive};
use openlcb_defs::Mti;

use crate::event::EventId;
use crate::node_id::{Alias, NodeId};

/// Payload capacity per buffer class, in octets.
pub const LEN_BASIC: usize = 16;
pub const LEN_DATAGRAM: usize = 72;
pub const LEN_SNIP: usize = 253;
pub const LEN_STREAM: usize = 512;

/// The four message buffer classes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PayloadClass {
    #[num_enum(default)]
    Basic = 0,
    Datagram = 1,
    Snip = 2,
    Stream = 3,
}

impl PayloadClass {
    pub const fn capacity(self) -> usize {
        match self {
            PayloadClass::Basic => LEN_BASIC,
            PayloadClass::Datagram => LEN_DATAGRAM,
            PayloadClass::Snip => LEN_SNIP,
            PayloadClass::Stream => LEN_STREAM,
        }
    }
}

impl fmt::Display for PayloadClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Payload bytes would not fit the buffer class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Overflow;

impl fmt::Display for Overflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload overflow")
    }
}

/// Message payload storage, tagged by class so each pool element carries
/// exactly the room its class allows.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    Basic(Vec<u8, LEN_BASIC>),
    Datagram(Vec<u8, LEN_DATAGRAM>),
    Snip(Vec<u8, LEN_SNIP>),
    Stream(Vec<u8, LEN_STREAM>),
}

impl Payload {
    pub fn new(class: PayloadClass) -> Self {
        match class {
            PayloadClass::Basic => Payload::Basic(Vec::new()),
            PayloadClass::Datagram => Payload::Datagram(Vec::new()),
            PayloadClass::Snip => Payload::Snip(Vec::new()),
            PayloadClass::Stream => Payload::Stream(Vec::new()),
        }
    }

    pub fn class(&self) -> PayloadClass {
        match self {
            Payload::Basic(_) => PayloadClass::Basic,
            Payload::Datagram(_) => PayloadClass::Datagram,
            Payload::Snip(_) => PayloadClass::Snip,
            Payload::Stream(_) => PayloadClass::Stream,
        }
    }

    pub fn capacity(&self) -> usize {
        self.class().capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Basic(v) => v,
            Payload::Datagram(v) => v,
            Payload::Snip(v) => v,
            Payload::Stream(v) => v,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Payload::Basic(v) => v,
            Payload::Datagram(v) => v,
            Payload::Snip(v) => v,
            Payload::Stream(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            Payload::Basic(v) => v.clear(),
            Payload::Datagram(v) => v.clear(),
            Payload::Snip(v) => v.clear(),
            Payload::Stream(v) => v.clear(),
        }
    }

    pub fn push(&mut self, byte: u8) -> Result<(), Overflow> {
        match self {
            Payload::Basic(v) => v.push(byte).map_err(|_| Overflow),
            Payload::Datagram(v) => v.push(byte).map_err(|_| Overflow),
            Payload::Snip(v) => v.push(byte).map_err(|_| Overflow),
            Payload::Stream(v) => v.push(byte).map_err(|_| Overflow),
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), Overflow> {
        match self {
            Payload::Basic(v) => v.extend_from_slice(data).map_err(|_| Overflow),
            Payload::Datagram(v) => v.extend_from_slice(data).map_err(|_| Overflow),
            Payload::Snip(v) => v.extend_from_slice(data).map_err(|_| Overflow),
            Payload::Stream(v) => v.extend_from_slice(data).map_err(|_| Overflow),
        }
    }

    /// Zero-extend the payload so an offset write below is in bounds.
    fn ensure_len(&mut self, len: usize) -> Result<(), Overflow> {
        if self.len() >= len {
            return Ok(());
        }
        match self {
            Payload::Basic(v) => v.resize(len, 0).map_err(|_| Overflow),
            Payload::Datagram(v) => v.resize(len, 0).map_err(|_| Overflow),
            Payload::Snip(v) => v.resize(len, 0).map_err(|_| Overflow),
            Payload::Stream(v) => v.resize(len, 0).map_err(|_| Overflow),
        }
    }
}

/// A fully assembled OpenLCB message.
///
/// The alias fields are what travels on CAN; the full ids are filled in
/// when known (outgoing always, incoming when the mapping table has the
/// peer). `timer_ticks` ages a pending datagram transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    pub source_alias: Alias,
    pub source_id: NodeId,
    pub dest_alias: Alias,
    pub dest_id: NodeId,
    pub mti: Mti,
    pub payload: Payload,
    pub timer_ticks: u16,
    /// Set while a multi-frame assembly is still collecting frames.
    pub inprocess: bool,
}

impl Message {
    pub fn new(class: PayloadClass) -> Self {
        Self {
            source_alias: Alias::NULL,
            source_id: NodeId::NULL,
            dest_alias: Alias::NULL,
            dest_id: NodeId::NULL,
            mti: Mti::Unknown(0),
            payload: Payload::new(class),
            timer_ticks: 0,
            inprocess: false,
        }
    }

    /// Reset everything except the payload class.
    pub fn reset(&mut self) {
        self.source_alias = Alias::NULL;
        self.source_id = NodeId::NULL;
        self.dest_alias = Alias::NULL;
        self.dest_id = NodeId::NULL;
        self.mti = Mti::Unknown(0);
        self.payload.clear();
        self.timer_ticks = 0;
        self.inprocess = false;
    }

    /// Fill in the header fields in one go, clearing the payload.
    pub fn load_header(
        &mut self,
        source_alias: Alias,
        source_id: NodeId,
        dest_alias: Alias,
        dest_id: NodeId,
        mti: Mti,
    ) {
        self.source_alias = source_alias;
        self.source_id = source_id;
        self.dest_alias = dest_alias;
        self.dest_id = dest_id;
        self.mti = mti;
        self.payload.clear();
        self.timer_ticks = 0;
        self.inprocess = false;
    }

    pub fn is_addressed(&self) -> bool {
        self.mti.is_addressed()
    }

    // Big-endian payload codec. Writes zero-extend the payload up to the
    // target offset; reads panic when out of bounds, so handlers check
    // `payload.len()` against the layout they expect first.

    pub fn set_byte(&mut self, offset: usize, value: u8) -> Result<(), Overflow> {
        self.payload.ensure_len(offset + 1)?;
        self.payload.as_mut_slice()[offset] = value;
        Ok(())
    }

    pub fn set_word(&mut self, offset: usize, value: u16) -> Result<(), Overflow> {
        self.payload.ensure_len(offset + 2)?;
        NetworkEndian::write_u16(&mut self.payload.as_mut_slice()[offset..], value);
        Ok(())
    }

    pub fn set_dword(&mut self, offset: usize, value: u32) -> Result<(), Overflow> {
        self.payload.ensure_len(offset + 4)?;
        NetworkEndian::write_u32(&mut self.payload.as_mut_slice()[offset..], value);
        Ok(())
    }

    pub fn set_node_id(&mut self, offset: usize, value: NodeId) -> Result<(), Overflow> {
        self.payload.ensure_len(offset + 6)?;
        self.payload.as_mut_slice()[offset..offset + 6].copy_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn set_event_id(&mut self, offset: usize, value: EventId) -> Result<(), Overflow> {
        self.payload.ensure_len(offset + 8)?;
        self.payload.as_mut_slice()[offset..offset + 8].copy_from_slice(value.as_bytes());
        Ok(())
    }

    /// Write `text` and a terminating null. Returns the octet count written.
    pub fn set_str(&mut self, offset: usize, text: &str) -> Result<usize, Overflow> {
        let bytes = text.as_bytes();
        self.payload.ensure_len(offset + bytes.len() + 1)?;
        let slice = self.payload.as_mut_slice();
        slice[offset..offset + bytes.len()].copy_from_slice(bytes);
        slice[offset + bytes.len()] = 0;
        Ok(bytes.len() + 1)
    }

    pub fn set_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), Overflow> {
        self.payload.ensure_len(offset + data.len())?;
        self.payload.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// # Panics
    /// Panics if `offset` is past the payload end.
    pub fn byte_at(&self, offset: usize) -> u8 {
        self.payload.as_slice()[offset]
    }

    /// # Panics
    /// Panics if fewer than two octets remain at `offset`.
    pub fn word_at(&self, offset: usize) -> u16 {
        NetworkEndian::read_u16(&self.payload.as_slice()[offset..])
    }

    /// # Panics
    /// Panics if fewer than four octets remain at `offset`.
    pub fn dword_at(&self, offset: usize) -> u32 {
        NetworkEndian::read_u32(&self.payload.as_slice()[offset..])
    }

    /// # Panics
    /// Panics if fewer than six octets remain at `offset`.
    pub fn node_id_at(&self, offset: usize) -> NodeId {
        NodeId::from_bytes(&self.payload.as_slice()[offset..offset + 6])
    }

    /// # Panics
    /// Panics if fewer than eight octets remain at `offset`.
    pub fn event_id_at(&self, offset: usize) -> EventId {
        EventId::from_bytes(&self.payload.as_slice()[offset..offset + 8])
    }

    pub fn count_nulls(&self) -> usize {
        self.payload.as_slice().iter().filter(|&&b| b == 0).count()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {}->{} len={}",
            self.mti,
            self.source_alias,
            self.dest_alias,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_payload_class_capacities() {
        assert_eq!(Payload::new(PayloadClass::Basic).capacity(), 16);
        assert_eq!(Payload::new(PayloadClass::Datagram).capacity(), 72);
        assert_eq!(Payload::new(PayloadClass::Snip).capacity(), 253);
        assert_eq!(Payload::new(PayloadClass::Stream).capacity(), 512);
    }

    #[test]
    fn test_payload_overflow() {
        let mut payload = Payload::new(PayloadClass::Basic);
        assert!(payload.extend_from_slice(&[0u8; 16]).is_ok());
        assert_eq!(payload.push(0), Err(Overflow));
        assert_eq!(payload.extend_from_slice(&[0]), Err(Overflow));
        assert_eq!(payload.len(), 16);
    }

    #[test]
    fn test_word_round_trip() {
        let mut msg = Message::new(PayloadClass::Datagram);
        msg.set_word(6, 0xBEEF).unwrap();
        assert_eq!(msg.word_at(6), 0xBEEF);
        assert_eq!(msg.payload.len(), 8);
        // The skipped octets are zero-filled.
        assert_eq!(msg.byte_at(0), 0);
        msg.set_dword(0, 0x1234_5678).unwrap();
        assert_eq!(msg.dword_at(0), 0x1234_5678);
    }

    #[test]
    fn test_node_id_round_trip() {
        let mut msg = Message::new(PayloadClass::Basic);
        let id = NodeId::from_u64(0x0501_0101_0707);
        msg.set_node_id(0, id).unwrap();
        assert_eq!(msg.node_id_at(0), id);
        assert_eq!(msg.payload.len(), 6);
    }

    #[test]
    fn test_event_id_round_trip() {
        let mut msg = Message::new(PayloadClass::Basic);
        let id = EventId::from_u64(0x0501_0101_0707_0001);
        msg.set_event_id(0, id).unwrap();
        assert_eq!(msg.event_id_at(0), id);
        assert_eq!(msg.payload.len(), 8);
    }

    #[test]
    fn test_string_write_counts_null() {
        let mut msg = Message::new(PayloadClass::Snip);
        let written = msg.set_str(1, "Test").unwrap();
        assert_eq!(written, 5);
        assert_eq!(msg.payload.len(), 6);
        assert_eq!(msg.count_nulls(), 2);
    }

    #[test]
    fn test_load_header_clears_payload() {
        let mut msg = Message::new(PayloadClass::Basic);
        msg.set_byte(3, 0xAB).unwrap();
        msg.load_header(
            Alias::new(0x123),
            NodeId::from_u64(1),
            Alias::new(0x456),
            NodeId::from_u64(2),
            Mti::VerifiedNodeId,
        );
        assert!(msg.payload.is_empty());
        assert_eq!(msg.source_alias, Alias::new(0x123));
        assert_eq!(msg.mti, Mti::VerifiedNodeId);
    }
}
