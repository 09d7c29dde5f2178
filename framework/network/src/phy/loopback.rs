use heapless::Deque;

use crate::phy::{self, Device, DeviceCapabilities, Medium};
use crate::wire::can::FrameBuffer;

const QUEUE_DEPTH: usize = 16;

/// A software device: frames transmitted end up in an outbound queue the
/// test harness drains, frames injected appear on receive.
///
/// Useful for interface tests and host-side simulation. `block_tx`
/// reproduces a saturated driver so retry paths can be exercised.
#[derive(Debug, Default)]
pub struct Loopback {
    rx: Deque<FrameBuffer, QUEUE_DEPTH>,
    tx: Deque<FrameBuffer, QUEUE_DEPTH>,
    blocked: bool,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for reception on the next poll.
    pub fn inject(&mut self, frame: FrameBuffer) -> Result<(), FrameBuffer> {
        self.rx.push_back(frame)
    }

    /// Take the oldest transmitted frame.
    pub fn dequeue_tx(&mut self) -> Option<FrameBuffer> {
        self.tx.pop_front()
    }

    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    /// Make `transmit` report a full driver until unblocked.
    pub fn block_tx(&mut self, blocked: bool) {
        self.blocked = blocked;
    }
}

impl Device for Loopback {
    type RxToken<'a>
        = RxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self) -> Option<Self::RxToken<'_>> {
        self.rx.pop_front().map(|buffer| RxToken { buffer })
    }

    fn transmit(&mut self) -> Option<Self::TxToken<'_>> {
        if self.blocked || self.tx.is_full() {
            return None;
        }
        Some(TxToken { queue: &mut self.tx })
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
    buffer: FrameBuffer,
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
pub struct TxToken<'a> {
    queue: &'a mut Deque<FrameBuffer, QUEUE_DEPTH>,
}

impl<'a> phy::TxToken for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = FrameBuffer::new();
        buffer.resize(len, 0).ok()?;
        let result = f(&mut buffer[..]);
        self.queue.push_back(buffer).ok()?;
        Some(result)
    }
}
