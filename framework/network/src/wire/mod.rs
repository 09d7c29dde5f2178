use core::fmt;

mod field {
    #![allow(unused)]
    pub type Field = core::ops::Range<usize>;
    pub type Rest = core::ops::RangeFrom<usize>;
    pub type Single = usize;
}

#[cfg(feature = "medium-can")]
pub mod can;

#[cfg(feature = "medium-can")]
pub use self::can::{
    Frame as CanFrame, FrameClass, Identifier as CanIdentifier, FRAME_LEN as CAN_FRAME_LEN,
    HEADER_LEN as CAN_HEADER_LEN,
};

/// Parsing of a frame failed.
///
/// Either it's malformed, or not supported by this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
