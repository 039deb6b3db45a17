//! The producer half of a message ring.
//!
//! One frame is one RDMA write into the peer's receive ring, posted as a
//! scatter/gather list of header, payload and footer. Below the inline
//! threshold the provider copies the bytes out of the descriptor during
//! the post; above it the frame is staged in a pre-registered scratch
//! region mirroring the ring layout, so no registration happens per send.
//!
//! Free space is `N - (write_pos - peer_read_pos)`, where `peer_read_pos`
//! is a cached lower bound on the peer's true cursor. When space runs out
//! the bound is refreshed once by an RDMA read of the peer's cursor cell;
//! if space is still short after that, the peer is genuinely behind and
//! the path busy-waits on the mirror cell, which the peer's push writes
//! keep up to date.

use crate::error::{Result, RingError};
use crate::memory_region::{CursorBlock, LocalMemoryRegion, RemoteRegion, CURSOR_OWN_OFFSET};
use crate::ring::{self, FOOTER_LEN, HEADER_LEN, VALIDITY_MASK, WRAP_MARKER};
use crate::work_request::{addr_of, sge, SendWr, WorkRequestId, WrKind};
use crate::RingShared;
use clippy_utilities::Cast;
use std::hint;
use std::slice;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Reap the completion queue once per this many spin iterations while
/// blocked, enough to notice error completions without hammering the
/// shared reap mutex.
const SPINS_PER_REAP: u32 = 0x400;

/// While blocked on ring space, pull the peer's cursor again after this
/// long without progress. The push path covers the common case; the slow
/// re-pull guarantees a blocked send observes any receive eventually, even
/// when the peer's unpublished delta stays under its push threshold.
const REFRESH_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// The producer state of one ring.
pub(crate) struct SendPath {
    /// Queue pair and completion bookkeeping shared with the receive path
    shared: Arc<RingShared>,
    /// Staging region, same size as the ring, registered once
    scratch: LocalMemoryRegion,
    /// Local cursor block; its mirror cell tracks the peer's read cursor
    cursors: Arc<CursorBlock>,
    /// The peer's receive ring
    remote_ring: RemoteRegion,
    /// The peer's cursor block
    remote_cursors: RemoteRegion,
    /// Ring size in bytes, power of two
    ring_size: u64,
    /// Producer cursor, monotonically increasing
    write_pos: u64,
    /// Cached lower bound on the peer's read cursor
    peer_read_pos: u64,
    /// Frames up to this counter span are posted inline
    inline_threshold: u64,
    /// Yield the CPU instead of spinning while blocked on ring space
    yield_while_waiting: bool,
    /// A fatal error was reported, every later send fails
    broken: bool,
}

impl SendPath {
    /// Wire up the producer half. The scratch region has the ring's size,
    /// which is where the path takes the ring geometry from.
    pub(crate) fn new(
        shared: Arc<RingShared>,
        scratch: LocalMemoryRegion,
        cursors: Arc<CursorBlock>,
        remote_ring: RemoteRegion,
        remote_cursors: RemoteRegion,
        inline_threshold: u64,
        yield_while_waiting: bool,
    ) -> Self {
        let ring_size: u64 = scratch.len().cast();
        debug_assert!(ring_size.is_power_of_two());
        Self {
            shared,
            scratch,
            cursors,
            remote_ring,
            remote_cursors,
            ring_size,
            write_pos: 0,
            peer_read_pos: 0,
            inline_threshold,
            yield_while_waiting,
            broken: false,
        }
    }

    /// Serialize one message into the peer's ring.
    ///
    /// Blocks until the frame fits and the work request is posted; remote
    /// completion is not awaited, the reliable-connected queue pair
    /// delivers posted writes in order.
    pub(crate) fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.broken {
            return Err(RingError::ConnectionLost);
        }
        if payload.is_empty() {
            return Err(RingError::ProtocolError("zero-length message"));
        }
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_e| RingError::ProtocolError("message length exceeds the frame header"))?;

        let span = ring::frame_span(len);
        let pad = self.reserve(span)?;
        let pos = self.write_pos + pad;

        if pad > 0 && ring::marker_required(pad) {
            self.post_marker()?;
        }
        if span <= self.inline_threshold {
            self.post_inline(pos, payload)?;
        } else {
            self.post_staged(pos, payload)?;
        }
        self.write_pos = pos + span;

        // Reap lazily: a frame posted into a dead connection surfaces as an
        // error completion on a later call at the latest.
        if self.shared.send_cq.reap(&self.shared.router).is_err()
            || self.shared.tracker.is_broken()
        {
            self.broken = true;
            return Err(RingError::ConnectionLost);
        }
        Ok(())
    }

    /// Block until `span` counter bytes (plus wrap padding) fit into the
    /// peer's ring. Returns the padding.
    fn reserve(&mut self, span: u64) -> Result<u64> {
        let pad = ring::wrap_padding(self.write_pos, span, self.ring_size);
        let need = pad + span;

        if self.free_space() >= need {
            return Ok(pad);
        }
        self.fold_mirror();
        if self.free_space() >= need {
            return Ok(pad);
        }

        // Refresh the bound once up front. If space is still short the
        // peer is genuinely behind: spin on the mirror cell, which its
        // push writes keep current, and fall back to a slow re-pull so a
        // receive below the peer's push threshold still unblocks us.
        self.refresh_peer_cursor()?;
        let mut last_refresh = Instant::now();
        let mut spins: u32 = 0;
        while self.free_space() < need {
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_REAP == 0 {
                if self.shared.send_cq.reap(&self.shared.router).is_err()
                    || self.shared.tracker.is_broken()
                {
                    self.broken = true;
                    return Err(RingError::ConnectionLost);
                }
                if last_refresh.elapsed() >= REFRESH_RETRY_INTERVAL {
                    self.refresh_peer_cursor()?;
                    last_refresh = Instant::now();
                }
            }
            if self.yield_while_waiting {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
            self.fold_mirror();
        }
        Ok(pad)
    }

    /// Bytes of the peer's ring not yet known to be consumed
    fn free_space(&self) -> u64 {
        self.ring_size - (self.write_pos - self.peer_read_pos)
    }

    /// Fold the mirror cell into the cached bound. The mirror is written by
    /// the device only and may lag the true cursor, never lead it.
    fn fold_mirror(&mut self) {
        let seen = self.cursors.peer_read_pos();
        if seen > self.write_pos {
            // A cursor ahead of our own writes cannot come from a
            // well-behaved peer. Keep the old bound.
            warn!(
                "peer cursor {} ahead of write cursor {}, ignoring",
                seen, self.write_pos
            );
            return;
        }
        if seen > self.peer_read_pos {
            self.peer_read_pos = seen;
        }
    }

    /// Pull the peer's cursor cell into the local mirror and block on the
    /// read completion.
    fn refresh_peer_cursor(&mut self) -> Result<()> {
        let before = self.shared.tracker.cursor_reads();
        let local = sge(self.cursors.mirror_addr(), 8, self.cursors.lkey());
        let mut wr = SendWr::new_read(
            local,
            WorkRequestId::new(WrKind::CursorRead),
            self.remote_cursors.at(CURSOR_OWN_OFFSET),
            self.remote_cursors.rkey,
        );
        self.shared.tracker.note_posted();
        if let Err(e) = self.shared.qp.post_send(&mut wr) {
            self.shared.tracker.note_post_failed();
            self.broken = true;
            return Err(RingError::PostSendFailed(e));
        }
        loop {
            if self.shared.send_cq.reap(&self.shared.router).is_err()
                || self.shared.tracker.is_broken()
            {
                self.broken = true;
                return Err(RingError::ConnectionLost);
            }
            if self.shared.tracker.cursor_reads() > before {
                break;
            }
            hint::spin_loop();
        }
        self.fold_mirror();
        Ok(())
    }

    /// Announce a skipped ring tail with the wrap marker.
    ///
    /// The marker goes through scratch rather than inline so it works on
    /// devices that granted no inline capacity at all.
    fn post_marker(&mut self) -> Result<()> {
        let off = self.write_pos & (self.ring_size - 1);
        self.scratch_mut()[off.cast::<usize>()..off.cast::<usize>() + 4]
            .copy_from_slice(&WRAP_MARKER.to_le_bytes());
        let sges = vec![sge(self.scratch.addr() + off, 4, self.scratch.lkey())];
        let wr = SendWr::new_write(
            sges,
            WorkRequestId::new(WrKind::MarkerWrite),
            self.remote_ring.at(off),
            self.remote_ring.rkey,
            false,
        );
        self.post(wr)
    }

    /// Post a frame inline: the provider copies header, payload and footer
    /// out of the descriptor during the post, no source registration
    /// involved.
    fn post_inline(&mut self, pos: u64, payload: &[u8]) -> Result<()> {
        let len: u32 = payload.len().cast();
        let header = len.to_le_bytes();
        let footer = (len ^ VALIDITY_MASK).to_le_bytes();
        let sges = vec![
            sge(addr_of(header.as_ptr()), 4, 0),
            sge(addr_of(payload.as_ptr()), len, 0),
            sge(addr_of(footer.as_ptr()), 4, 0),
        ];
        let off = pos & (self.ring_size - 1);
        let wr = SendWr::new_write(
            sges,
            WorkRequestId::new(WrKind::FrameWrite),
            self.remote_ring.at(off),
            self.remote_ring.rkey,
            true,
        );
        self.post(wr)
    }

    /// Post a frame out of the scratch region.
    ///
    /// The frame is staged at the scratch offset matching its ring
    /// position. Those bytes cannot belong to an in-flight request: reusing
    /// them requires the cursor to have lapped the ring once, which the
    /// peer only allows after consuming the frame the old request carried.
    fn post_staged(&mut self, pos: u64, payload: &[u8]) -> Result<()> {
        let len: u32 = payload.len().cast();
        let scratch_len = self.scratch.len();
        {
            // SAFETY: exclusive access, the region is owned by this path
            let buf = unsafe { slice::from_raw_parts_mut(self.scratch.as_mut_ptr(), scratch_len) };
            ring::encode_frame(buf, pos, payload);
        }
        let off = pos & (self.ring_size - 1);
        let base = self.scratch.addr() + off;
        let lkey = self.scratch.lkey();
        let sges = vec![
            sge(base, HEADER_LEN.cast(), lkey),
            sge(base + HEADER_LEN, len, lkey),
            sge(base + HEADER_LEN + u64::from(len), FOOTER_LEN.cast(), lkey),
        ];
        let wr = SendWr::new_write(
            sges,
            WorkRequestId::new(WrKind::FrameWrite),
            self.remote_ring.at(off),
            self.remote_ring.rkey,
            false,
        );
        self.post(wr)
    }

    /// Account and post one signaled work request.
    fn post(&mut self, mut wr: SendWr) -> Result<()> {
        self.shared.tracker.note_posted();
        if let Err(e) = self.shared.qp.post_send(&mut wr) {
            self.shared.tracker.note_post_failed();
            self.broken = true;
            return Err(RingError::PostSendFailed(e));
        }
        Ok(())
    }

    /// The scratch region as a mutable slice
    fn scratch_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access, the region is owned by this path
        unsafe { slice::from_raw_parts_mut(self.scratch.as_mut_ptr(), self.scratch.len()) }
    }
}

impl std::fmt::Debug for SendPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPath")
            .field("write_pos", &self.write_pos)
            .field("peer_read_pos", &self.peer_read_pos)
            .field("ring_size", &self.ring_size)
            .field("broken", &self.broken)
            .finish()
    }
}
