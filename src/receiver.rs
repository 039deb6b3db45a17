//! The consumer half of a message ring.
//!
//! The receive path never posts a verbs call to get at data: it busy-polls
//! its own registered ring until the framing of the next message validates,
//! copies the payload out, zeroes the consumed bytes and advances its
//! cursor. The cursor is stored into the local cursor cell on every
//! advance (the peer pulls it from there on demand) and pushed to the
//! peer's mirror cell whenever the delta since the last push grows past
//! the publish threshold, so the common case costs the sender no extra
//! round trip.

use crate::error::{Result, RingError};
use crate::memory_region::{CursorBlock, LocalMemoryRegion, RemoteRegion, CURSOR_MIRROR_OFFSET};
use crate::ring::{self, FrameStatus, HEADER_LEN};
use crate::work_request::{sge, SendWr, WorkRequestId, WrKind};
use crate::RingShared;
use clippy_utilities::Cast;
use std::hint;
use std::slice;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Reap the completion queue once per this many spin iterations while
/// blocked, enough to notice a broken queue pair without hammering the
/// shared reap mutex.
const SPINS_PER_REAP: u32 = 0x400;

/// The consumer state of one ring.
pub(crate) struct ReceivePath {
    /// Queue pair and completion bookkeeping shared with the send path
    shared: Arc<RingShared>,
    /// The local receive ring the peer writes into
    ring: LocalMemoryRegion,
    /// Local cursor block; its own cell carries our read cursor
    cursors: Arc<CursorBlock>,
    /// The peer's cursor block, target of cursor pushes
    remote_cursors: RemoteRegion,
    /// Ring size in bytes, power of two
    ring_size: u64,
    /// Consumer cursor, monotonically increasing
    read_pos: u64,
    /// Cursor value as of the last push to the peer
    last_published: u64,
    /// Push the cursor when the unpublished delta exceeds this
    publish_threshold: u64,
    /// A visible header whose footer stays invalid this long is an error
    torn_frame_timeout: Duration,
    /// Yield the CPU instead of spinning while waiting for data
    yield_while_waiting: bool,
    /// A fatal error was reported, every later receive fails
    broken: bool,
}

impl ReceivePath {
    /// Wire up the consumer half over its receive ring.
    pub(crate) fn new(
        shared: Arc<RingShared>,
        ring: LocalMemoryRegion,
        cursors: Arc<CursorBlock>,
        remote_cursors: RemoteRegion,
        publish_threshold: u64,
        torn_frame_timeout: Duration,
        yield_while_waiting: bool,
    ) -> Self {
        let ring_size: u64 = ring.len().cast();
        debug_assert!(ring_size.is_power_of_two());
        Self {
            shared,
            ring,
            cursors,
            remote_cursors,
            ring_size,
            read_pos: 0,
            last_published: 0,
            publish_threshold,
            torn_frame_timeout,
            yield_while_waiting,
            broken: false,
        }
    }

    /// Block until one message is available, copy it into `dst` and return
    /// its length.
    ///
    /// A destination smaller than the message fails with
    /// [`RingError::BufferTooSmall`] and leaves the message in the ring.
    pub(crate) fn receive(&mut self, dst: &mut [u8]) -> Result<usize> {
        if self.broken {
            return Err(RingError::ConnectionLost);
        }
        let mut torn_since: Option<Instant> = None;
        let mut spins: u32 = 0;
        loop {
            match ring::peek_frame(self.ring.as_slice(), self.read_pos) {
                FrameStatus::Ready { len, pad } => {
                    let needed: usize = len.cast();
                    if dst.len() < needed {
                        return Err(RingError::BufferTooSmall {
                            needed,
                            capacity: dst.len(),
                        });
                    }
                    self.consume(dst, len, pad)?;
                    return Ok(needed);
                }
                FrameStatus::Empty => {
                    torn_since = None;
                }
                status @ (FrameStatus::Torn | FrameStatus::Corrupt) => {
                    // A header without a valid footer, or header bytes that
                    // make no sense yet. In-order delivery makes both
                    // transient while a frame is still landing; a state
                    // that never clears means the peer is gone or
                    // misbehaving.
                    let now = Instant::now();
                    let since = *torn_since.get_or_insert(now);
                    if now.duration_since(since) >= self.torn_frame_timeout {
                        self.broken = true;
                        return Err(RingError::ProtocolError(
                            if status == FrameStatus::Torn {
                                "footer did not land within the torn-frame timeout"
                            } else {
                                "impossible length header in the ring"
                            },
                        ));
                    }
                }
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_REAP == 0
                && (self.shared.send_cq.reap(&self.shared.router).is_err()
                    || self.shared.tracker.is_broken())
            {
                self.broken = true;
                return Err(RingError::ConnectionLost);
            }
            if self.yield_while_waiting {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }

    /// Whether a complete message is visible right now. Never blocks.
    pub(crate) fn has_data(&self) -> bool {
        matches!(
            ring::peek_frame(self.ring.as_slice(), self.read_pos),
            FrameStatus::Ready { .. }
        )
    }

    /// Copy a validated frame out, zero it and advance the cursor.
    fn consume(&mut self, dst: &mut [u8], len: u32, pad: u64) -> Result<()> {
        let needed: usize = len.cast();
        let off: usize = ((self.read_pos + pad + HEADER_LEN) & (self.ring_size - 1)).cast();
        dst[..needed].copy_from_slice(&self.ring.as_slice()[off..off + needed]);

        {
            // SAFETY: the ring is owned by this path; the peer only writes
            // ahead of the write cursor, never into a consumed frame
            let buf = unsafe { slice::from_raw_parts_mut(self.ring.as_mut_ptr(), self.ring.len()) };
            ring::zero_consumed(buf, self.read_pos, len, pad);
        }

        self.read_pos += pad + ring::frame_span(len);
        self.cursors.store_read_pos(self.read_pos);
        if self.read_pos - self.last_published > self.publish_threshold {
            self.publish_cursor()?;
        }
        Ok(())
    }

    /// Push the read cursor to the peer's mirror cell.
    ///
    /// The source of the write is the local cursor cell itself; if the
    /// cursor advances between post and transmission the peer sees the
    /// newer value, which is just as correct.
    pub(crate) fn publish_cursor(&mut self) -> Result<()> {
        if self.broken {
            return Err(RingError::ConnectionLost);
        }
        let local = sge(self.cursors.own_addr(), 8, self.cursors.lkey());
        let mut wr = SendWr::new_write(
            vec![local],
            WorkRequestId::new(WrKind::CursorWrite),
            self.remote_cursors.at(CURSOR_MIRROR_OFFSET),
            self.remote_cursors.rkey,
            false,
        );
        self.shared.tracker.note_posted();
        if let Err(e) = self.shared.qp.post_send(&mut wr) {
            self.shared.tracker.note_post_failed();
            self.broken = true;
            return Err(RingError::PostSendFailed(e));
        }
        self.last_published = self.read_pos;
        if self.shared.send_cq.reap(&self.shared.router).is_err()
            || self.shared.tracker.is_broken()
        {
            self.broken = true;
            return Err(RingError::ConnectionLost);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReceivePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePath")
            .field("read_pos", &self.read_pos)
            .field("last_published", &self.last_published)
            .field("ring_size", &self.ring_size)
            .field("broken", &self.broken)
            .finish()
    }
}
