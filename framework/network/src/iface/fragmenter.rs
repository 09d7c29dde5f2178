use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::message::Message;
use openlcb_defs::can::{
    self, FrameType, Framing, CAN_MTI_PCER_PAYLOAD_FIRST, CAN_MTI_PCER_PAYLOAD_LAST,
    CAN_MTI_PCER_PAYLOAD_MIDDLE,
};
use openlcb_defs::Mti;

use crate::wire::can::{frame_buffer, FrameBuffer, Identifier, MTU};

/// One frame ready for the driver, plus what committing it means.
#[derive(Debug)]
pub struct OutFrame {
    pub buffer: FrameBuffer,
    consumed: usize,
    last: bool,
}

/// Splits one outgoing message at a time into CAN frames.
///
/// The caller asks for the next frame, hands it to the driver, and
/// commits only when the driver accepted it; a full transmitter therefore
/// re-produces the identical frame on the next poll. One message finishes
/// before the next starts, so multi-frame messages never interleave on
/// the wire.
#[derive(Debug, Default)]
pub struct Fragmenter {
    current: Option<Progress>,
}

#[derive(Debug)]
struct Progress {
    handle: Handle,
    index: usize,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn current(&self) -> Option<Handle> {
        self.current.as_ref().map(|p| p.handle)
    }

    /// Start fragmenting a message. Only valid when idle.
    pub fn begin(&mut self, handle: Handle) {
        debug_assert!(self.is_idle());
        self.current = Some(Progress { handle, index: 0 });
    }

    /// Build the frame the wire wants next. `None` when idle.
    pub fn build_next(&self, pool: &Pool) -> Option<OutFrame> {
        let progress = self.current.as_ref()?;
        let msg = pool.get(progress.handle);
        Some(build_frame(msg, progress.index))
    }

    /// Record that `frame` reached the driver. Returns the handle of the
    /// finished message, to be released by the caller.
    pub fn commit(&mut self, frame: &OutFrame) -> Option<Handle> {
        let progress = self.current.as_mut().expect("commit without message");
        progress.index += frame.consumed;
        if frame.last {
            let handle = progress.handle;
            self.current = None;
            Some(handle)
        } else {
            None
        }
    }
}

fn build_frame(msg: &Message, index: usize) -> OutFrame {
    let payload = msg.payload.as_slice();
    let remaining = payload.len().saturating_sub(index);

    match msg.mti {
        Mti::Datagram => {
            let take = remaining.min(MTU);
            let frame_type = if index == 0 && remaining <= MTU {
                FrameType::DatagramOnly
            } else if index == 0 {
                FrameType::DatagramFirst
            } else if remaining <= MTU {
                FrameType::DatagramFinal
            } else {
                FrameType::DatagramMiddle
            };
            let identifier = Identifier::with_dest(frame_type, msg.dest_alias, msg.source_alias);
            OutFrame {
                buffer: frame_buffer(identifier, &payload[index..index + take]),
                consumed: take,
                last: take == remaining,
            }
        }
        Mti::StreamDataSend => {
            let take = remaining.min(MTU);
            let identifier =
                Identifier::with_dest(FrameType::Stream, msg.dest_alias, msg.source_alias);
            OutFrame {
                buffer: frame_buffer(identifier, &payload[index..index + take]),
                consumed: take,
                last: take == remaining,
            }
        }
        Mti::PcEventReportWithPayload => {
            // Global, so first/middle/last travel as dedicated CAN-MTIs
            // and every frame carries a full eight data octets.
            let take = remaining.min(MTU);
            let (can_mti, last) = if index == 0 {
                (CAN_MTI_PCER_PAYLOAD_FIRST, false)
            } else if remaining <= MTU {
                (CAN_MTI_PCER_PAYLOAD_LAST, true)
            } else {
                (CAN_MTI_PCER_PAYLOAD_MIDDLE, false)
            };
            let identifier = Identifier::message(can_mti, msg.source_alias);
            OutFrame {
                buffer: frame_buffer(identifier, &payload[index..index + take]),
                consumed: take,
                last,
            }
        }
        mti if mti.is_addressed() => {
            let take = remaining.min(can::FRAME_PAYLOAD_LEN_ADDRESSED);
            let framing = if index == 0 && remaining <= can::FRAME_PAYLOAD_LEN_ADDRESSED {
                Framing::Only
            } else if index == 0 {
                Framing::First
            } else if remaining <= can::FRAME_PAYLOAD_LEN_ADDRESSED {
                Framing::Last
            } else {
                Framing::Middle
            };
            let dest = msg.dest_alias.value();
            let identifier = Identifier::message(u16::from(mti) & 0xFFF, msg.source_alias);
            let mut buffer = frame_buffer(identifier, &[]);
            // Destination prefix: framing bits over the alias high nibble.
            buffer
                .push(u8::from(framing) | ((dest >> 8) as u8 & 0x0F))
                .unwrap();
            buffer.push(dest as u8).unwrap();
            buffer
                .extend_from_slice(&payload[index..index + take])
                .unwrap();
            OutFrame {
                buffer,
                consumed: take,
                last: take == remaining,
            }
        }
        mti => {
            // Global single-frame message.
            debug_assert!(payload.len() <= MTU);
            let take = remaining.min(MTU);
            let identifier = Identifier::message(u16::from(mti) & 0xFFF, msg.source_alias);
            OutFrame {
                buffer: frame_buffer(identifier, &payload[index..index + take]),
                consumed: take,
                last: true,
            }
        }
    }
}
