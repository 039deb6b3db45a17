use crate::context::{check_dev_cap, Context};
use crate::error::{log_last_os_err, log_ret_last_os_err};
use crate::work_request::WrKind;
use clippy_utilities::{Cast, OverflowArithmetic};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use rdma_sys::{ibv_cq, ibv_create_cq, ibv_destroy_cq, ibv_poll_cq, ibv_wc, ibv_wc_status};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::{fmt::Debug, io, mem, ptr::NonNull};
use thiserror::Error;
use tracing::{debug, error};

/// Minimum number of entries a completion queue will hold
pub(crate) const DEFAULT_CQ_SIZE: u32 = 1024;

/// Maximum number of completion queue entries polled in one reap
const MAX_POLL_CQE: usize = 32;

/// Completion queue wrapper.
///
/// The data path never sleeps in the kernel, so no completion channel is
/// attached; completions are drained by polling. Work completions of every
/// queue pair sharing this queue land here, which is why the reap runs under
/// a mutex and routes each entry to its owner by queue pair number.
pub(crate) struct CompletionQueue {
    /// Internal completion queue pointer
    inner_cq: NonNull<ibv_cq>,
    /// Poll buffer, its lock doubles as the reap mutex
    reap_buf: Mutex<Vec<ibv_wc>>,
}

impl CompletionQueue {
    /// Get the internal cq pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_cq {
        self.inner_cq.as_ptr()
    }

    /// Create a completion queue with room for `cq_size` entries.
    pub(crate) fn create(ctx: &Context, cq_size: u32) -> io::Result<Self> {
        check_dev_cap(&cq_size, &ctx.dev_attr().max_cqe.cast(), "max_cqe")?;

        // SAFETY: ffi, no completion channel and no user context
        let inner_cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_ptr(),
                cq_size.cast(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0_i32,
            )
        })
        .ok_or_else(|| log_ret_last_os_err("ibv_create_cq"))?;

        let mut buf = Vec::with_capacity(MAX_POLL_CQE);
        // SAFETY: POD FFI type, the poll call overwrites entries before use
        buf.resize_with(MAX_POLL_CQE, || unsafe { mem::zeroed::<ibv_wc>() });

        Ok(Self {
            inner_cq,
            reap_buf: Mutex::new(buf),
        })
    }

    /// Drain pending completions and credit them to their queue pairs.
    ///
    /// Returns the number of reaped completions. An empty queue is not an
    /// error. The router lookup happens while the reap mutex is held, so a
    /// tracker never sees completions out of poll order.
    pub(crate) fn reap(&self, router: &CompletionRouter) -> io::Result<usize> {
        let mut buf = self.reap_buf.lock();
        let mut total = 0_usize;
        loop {
            // SAFETY: ffi, `buf` holds MAX_POLL_CQE entries
            let polled =
                unsafe { ibv_poll_cq(self.as_ptr(), MAX_POLL_CQE.cast(), buf.as_mut_ptr()) };
            if polled < 0_i32 {
                return Err(log_ret_last_os_err("ibv_poll_cq"));
            }
            if polled == 0_i32 {
                return Ok(total);
            }
            let polled: usize = polled.cast();
            for wc in buf.iter().take(polled) {
                router.route(wc);
            }
            total = total.overflow_add(polled);
        }
    }
}

unsafe impl Sync for CompletionQueue {}

unsafe impl Send for CompletionQueue {}

impl Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("inner_cq", &self.inner_cq)
            .finish()
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_cq(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_destroy_cq");
        }
    }
}

/// Per queue pair completion bookkeeping.
///
/// Shared between the send path, the receive path and the reap; everything
/// is atomic because completions for one ring may be reaped from the thread
/// driving another ring.
#[derive(Debug, Default)]
pub(crate) struct QueuePairTracker {
    /// Signaled work requests posted but not yet reaped
    outstanding: AtomicU32,
    /// Number of completed cursor reads
    cursor_reads: AtomicU64,
    /// An error completion was observed for this queue pair
    broken: AtomicBool,
}

impl QueuePairTracker {
    /// Account one signaled work request about to be posted
    pub(crate) fn note_posted(&self) {
        let _prev = self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo `note_posted` after a failed post
    pub(crate) fn note_post_failed(&self) {
        let _prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Signaled work requests not yet reaped
    pub(crate) fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of completed cursor reads
    pub(crate) fn cursor_reads(&self) -> u64 {
        self.cursor_reads.load(Ordering::Acquire)
    }

    /// Whether an error completion was observed
    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Mark the queue pair as broken
    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

/// Routes work completions from a shared completion queue to the tracker of
/// the queue pair that produced them.
#[derive(Debug, Default)]
pub(crate) struct CompletionRouter {
    /// Trackers by queue pair number
    table: Mutex<HashMap<u32, Arc<QueuePairTracker>>>,
}

impl CompletionRouter {
    /// Create an empty router
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register the tracker of a freshly connected queue pair
    pub(crate) fn register(&self, qp_num: u32, tracker: Arc<QueuePairTracker>) {
        let _prev = self.table.lock().insert(qp_num, tracker);
    }

    /// Remove a queue pair's tracker at teardown
    pub(crate) fn deregister(&self, qp_num: u32) {
        let _prev = self.table.lock().remove(&qp_num);
    }

    /// Credit one work completion to its owner.
    fn route(&self, wc: &ibv_wc) {
        let tracker = match self.table.lock().get(&wc.qp_num) {
            Some(t) => Arc::<QueuePairTracker>::clone(t),
            None => {
                debug!("dropping completion for unknown qp {}", wc.qp_num);
                return;
            }
        };

        let kind = WrKind::of(wc.wr_id);
        if wc.status == ibv_wc_status::IBV_WC_SUCCESS {
            if kind == Some(WrKind::CursorRead) {
                let _prev = tracker.cursor_reads.fetch_add(1, Ordering::AcqRel);
            }
        } else {
            let err =
                CompletionError::from_u32(wc.status).unwrap_or(CompletionError::Unexpected);
            error!(
                "error completion on qp {}, wr_id {:#x}: {}",
                wc.qp_num, wc.wr_id, err
            );
            tracker.mark_broken();
        }
        // Priming receives flush only when the queue pair is already torn
        // down; they never count against the send-side drain.
        if kind != Some(WrKind::Prime) {
            let _prev = tracker.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Work completion status codes that indicate failure.
#[derive(Error, Debug, FromPrimitive, Copy, Clone)]
pub(crate) enum CompletionError {
    /// A posted work request exceeded a length limit of the port.
    #[error("local length error")]
    LocLenErr = 1,
    /// Internal queue pair consistency error.
    #[error("local queue pair operation error")]
    LocQpOpErr = 2,
    /// A scatter/gather entry referenced memory invalid for the operation.
    #[error("local protection error")]
    LocProtErr = 4,
    /// The work request was outstanding when the queue pair entered the
    /// error state.
    #[error("work request flushed")]
    WrFlushErr = 5,
    /// The responder rejected the request, usually missing access rights on
    /// the target region.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,
    /// Protection error on the remote buffer of a one-sided operation.
    #[error("remote access error")]
    RemAccessErr = 10,
    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = 11,
    /// The transport retry counter was exceeded, the remote side stopped
    /// acknowledging.
    #[error("transport retry counter exceeded")]
    RetryExc = 12,
    /// The remote receive queue was never armed.
    #[error("receiver-not-ready retry counter exceeded")]
    RnrRetryExc = 13,
    /// Any other status code.
    #[error("unexpected work completion status")]
    Unexpected = 100,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_accounting() {
        let tracker = QueuePairTracker::default();
        tracker.note_posted();
        tracker.note_posted();
        assert_eq!(tracker.outstanding(), 2);
        tracker.note_post_failed();
        assert_eq!(tracker.outstanding(), 1);
        assert!(!tracker.is_broken());
        tracker.mark_broken();
        assert!(tracker.is_broken());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            CompletionError::from_u32(12),
            Some(CompletionError::RetryExc)
        ));
        assert!(CompletionError::from_u32(9999).is_none());
    }
}
