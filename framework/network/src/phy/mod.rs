use cfg_if::cfg_if;

#[cfg(feature = "phy-embedded_can")]
pub mod can;

#[cfg(feature = "medium-can")]
pub mod loopback;

/// A description of device capabilities.
///
/// Higher-level protocols may use this information to determine how to behave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct DeviceCapabilities {
    /// Medium of the device.
    pub medium: Medium,
}

/// Type of medium of a device.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Medium {
    /// CAN medium. Devices of this type send and receive CAN frames.
    #[cfg(feature = "medium-can")]
    CAN,
}

impl Default for Medium {
    fn default() -> Medium {
        cfg_if! {
            if #[cfg(feature = "medium-can")] {
                Medium::CAN
            }
            else {
                compile_error!("No medium feature enabled");
            }
        }
    }
}

/// Interface for sending and receiving raw CAN frames.
///
/// This interface revolves around _tokens_, specialized types facilitating
/// the reception and transmission of individual frames. The `receive` and
/// `transmit` functions focus on token construction, while the actual
/// sending and receiving operations occur when the tokens are consumed.
pub trait Device {
    type RxToken<'a>: RxToken
    where
        Self: 'a;
    type TxToken<'a>: TxToken
    where
        Self: 'a;

    /// Create a receive token, when an inbound frame is waiting.
    fn receive(&mut self) -> Option<Self::RxToken<'_>>;

    /// Create a transmit token.
    ///
    /// Returning `None` is the "transmitter full" signal: the caller keeps
    /// its frame and retries on a later poll.
    fn transmit(&mut self) -> Option<Self::TxToken<'_>>;

    /// Get a description of device capabilities.
    fn capabilities(&self) -> DeviceCapabilities;
}

/// A token to receive a single frame.
pub trait RxToken {
    /// Utilize the token for receiving a singular frame.
    ///
    /// This method acquires the frame and subsequently invokes the provided
    /// closure `f` with its raw bytes as the argument.
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R;
}

/// A token to transmit a single frame.
pub trait TxToken {
    /// Utilize the token to dispatch a single frame.
    ///
    /// This method creates a transmit buffer of size `len` and invokes the
    /// supplied closure `f` with a mutable reference to it. The closure's
    /// responsibility is to construct a valid frame in the buffer. Upon the
    /// closure's completion, the buffer is handed to the driver.
    ///
    /// Returns `None` when the driver could not take the frame after all;
    /// the frame was not sent and the caller retries on a later poll.
    fn consume<R, F>(self, len: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut [u8]) -> R;
}
