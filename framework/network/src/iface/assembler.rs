use core::fmt;

use heapless::Vec;
use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::message::PayloadClass;
use openlcb_core::node_id::Alias;
use openlcb_defs::{error, snip, Mti};

use crate::config;

/// Where a frame sits in its multi-frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Position {
    Only,
    First,
    Middle,
    Last,
}

/// Why an inbound frame was dropped instead of assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AssemblyError {
    /// Middle frame with no matching assembly in progress.
    OutOfOrderMiddle,
    /// Last frame with no matching assembly in progress.
    OutOfOrderEnd,
    /// No buffer of the required class was free.
    PoolExhausted,
    /// The sequence outgrew its buffer class.
    Overflow,
}

impl AssemblyError {
    /// The wire error code reported for this drop.
    pub fn code(&self) -> u16 {
        match self {
            AssemblyError::OutOfOrderMiddle => error::OUT_OF_ORDER_MIDDLE_WITHOUT_START,
            AssemblyError::OutOfOrderEnd => error::OUT_OF_ORDER_END_WITHOUT_START,
            AssemblyError::PoolExhausted => error::BUFFER_UNAVAILABLE,
            AssemblyError::Overflow => error::INVALID_ARGUMENTS,
        }
    }
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssemblyError::OutOfOrderMiddle => write!(f, "middle frame without start"),
            AssemblyError::OutOfOrderEnd => write!(f, "last frame without start"),
            AssemblyError::PoolExhausted => write!(f, "buffer pool exhausted"),
            AssemblyError::Overflow => write!(f, "assembly overflow"),
        }
    }
}

/// Combines first/middle/last frames into whole messages.
///
/// In-progress buffers are matched on (source alias, destination alias,
/// buffer class); sequences never interleave within that key.
#[derive(Debug, Default)]
pub struct Assembler {
    inprocess: Vec<Handle, { config::ASSEMBLY_DEPTH }>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, pool: &Pool, src: Alias, dst: Alias, class: PayloadClass) -> Option<usize> {
        self.inprocess.iter().position(|handle| {
            let msg = pool.get(*handle);
            handle.class() == class
                && msg.inprocess
                && msg.source_alias == src
                && msg.dest_alias == dst
        })
    }

    fn abandon(&mut self, pool: &mut Pool, index: usize) {
        let handle = self.inprocess.swap_remove(index);
        pool.free(handle);
    }

    fn start(
        &mut self,
        pool: &mut Pool,
        class: PayloadClass,
        src: Alias,
        dst: Alias,
        mti: Mti,
        data: &[u8],
    ) -> Result<Option<Handle>, AssemblyError> {
        let handle = pool.allocate(class).ok_or(AssemblyError::PoolExhausted)?;
        let msg = pool.get_mut(handle);
        msg.source_alias = src;
        msg.dest_alias = dst;
        msg.mti = mti;
        msg.inprocess = true;
        if msg.payload.extend_from_slice(data).is_err() {
            pool.free(handle);
            return Err(AssemblyError::Overflow);
        }
        if self.inprocess.push(handle).is_err() {
            pool.free(handle);
            return Err(AssemblyError::PoolExhausted);
        }
        Ok(None)
    }

    /// Feed one frame's worth of data. Returns the completed message
    /// handle once a sequence closes.
    pub fn accept(
        &mut self,
        pool: &mut Pool,
        class: PayloadClass,
        src: Alias,
        dst: Alias,
        mti: Mti,
        data: &[u8],
        position: Position,
    ) -> Result<Option<Handle>, AssemblyError> {
        match position {
            Position::Only => {
                let handle = pool.allocate(class).ok_or(AssemblyError::PoolExhausted)?;
                let msg = pool.get_mut(handle);
                msg.source_alias = src;
                msg.dest_alias = dst;
                msg.mti = mti;
                if msg.payload.extend_from_slice(data).is_err() {
                    pool.free(handle);
                    return Err(AssemblyError::Overflow);
                }
                Ok(Some(handle))
            }
            Position::First => {
                // A dangling start with the same key was abandoned by the
                // sender; reclaim it before starting over.
                if let Some(index) = self.find(pool, src, dst, class) {
                    self.abandon(pool, index);
                }
                self.start(pool, class, src, dst, mti, data)
            }
            Position::Middle => {
                let index = self
                    .find(pool, src, dst, class)
                    .ok_or(AssemblyError::OutOfOrderMiddle)?;
                let handle = self.inprocess[index];
                if pool.get_mut(handle).payload.extend_from_slice(data).is_err() {
                    self.abandon(pool, index);
                    return Err(AssemblyError::Overflow);
                }
                Ok(None)
            }
            Position::Last => {
                let index = self
                    .find(pool, src, dst, class)
                    .ok_or(AssemblyError::OutOfOrderEnd)?;
                let handle = self.inprocess[index];
                if pool.get_mut(handle).payload.extend_from_slice(data).is_err() {
                    self.abandon(pool, index);
                    return Err(AssemblyError::Overflow);
                }
                self.inprocess.swap_remove(index);
                pool.get_mut(handle).inprocess = false;
                Ok(Some(handle))
            }
        }
    }

    /// Reassemble a SNIP reply sent without framing bits.
    ///
    /// Such peers predate the framing-bit amendment: every frame looks
    /// like an only-frame. The reply layout itself marks the end, after
    /// six null terminators have arrived.
    pub fn accept_legacy_snip(
        &mut self,
        pool: &mut Pool,
        src: Alias,
        dst: Alias,
        data: &[u8],
    ) -> Result<Option<Handle>, AssemblyError> {
        let class = PayloadClass::Snip;
        let index = match self.find(pool, src, dst, class) {
            Some(index) => {
                let handle = self.inprocess[index];
                if pool.get_mut(handle).payload.extend_from_slice(data).is_err() {
                    self.abandon(pool, index);
                    return Err(AssemblyError::Overflow);
                }
                index
            }
            None => {
                self.start(pool, class, src, dst, Mti::SimpleNodeInfoReply, data)?;
                self.find(pool, src, dst, class)
                    .ok_or(AssemblyError::PoolExhausted)?
            }
        };
        Ok(self.finish_legacy_if_complete(pool, index))
    }

    fn finish_legacy_if_complete(&mut self, pool: &mut Pool, index: usize) -> Option<Handle> {
        let handle = self.inprocess[index];
        let msg = pool.get_mut(handle);
        if msg.count_nulls() >= usize::from(snip::NULL_COUNT) {
            msg.inprocess = false;
            self.inprocess.swap_remove(index);
            Some(handle)
        } else {
            None
        }
    }

    /// Drop every in-progress assembly, returning its storage.
    pub fn reset(&mut self, pool: &mut Pool) {
        while let Some(handle) = self.inprocess.pop() {
            pool.free(handle);
        }
    }

    pub fn inprocess_count(&self) -> usize {
        self.inprocess.len()
    }
}
