//! Bounded frame queue between the decode worker and the playback controller.
//!
//! The queue is deliberately tiny (two frames by default): a full queue
//! suspends the decode worker, which keeps decoding paced to presentation.
//!
//! The pending seek target lives under the same mutex as the frames, so
//! [`FrameQueue::clear_and_seek`] empties the queue and publishes the target
//! in one critical section. A producer blocked in [`FrameQueue::push`] wakes,
//! sees the pending seek and discards its pre-seek frame instead of inserting
//! it.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::frame::FrameInfo;

/// Default number of decoded frames buffered ahead of presentation.
pub const DEFAULT_CAPACITY: usize = 2;

/// Result of a [`FrameQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was appended
    Queued,
    /// A seek is pending; the frame predates it and was dropped
    SeekPending,
    /// The queue was closed; the producer should exit
    Closed,
}

struct QueueState {
    frames: VecDeque<FrameInfo>,
    /// Target of the outstanding seek, if any. Later seeks overwrite it.
    seek_target: Option<f64>,
    closed: bool,
}

/// A thread-safe bounded FIFO of decoded frames.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when a frame is appended or the queue closes
    frame_available: Condvar,
    /// Signalled when a slot frees, a seek is requested or the queue closes
    space_available: Condvar,
}

impl FrameQueue {
    /// Creates a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                seek_target: None,
                closed: false,
            }),
            capacity,
            frame_available: Condvar::new(),
            space_available: Condvar::new(),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a frame, suspending while the queue is full.
    ///
    /// Wakes early when the queue is closed or a seek is requested; the frame
    /// is dropped in both cases.
    pub fn push(&self, frame: FrameInfo) -> PushOutcome {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.seek_target.is_some() {
                return PushOutcome::SeekPending;
            }
            if state.frames.len() < self.capacity {
                break;
            }
            self.space_available.wait(&mut state);
        }

        state.frames.push_back(frame);
        drop(state);
        self.frame_available.notify_one();
        PushOutcome::Queued
    }

    /// Removes the front frame, suspending until one is available.
    ///
    /// Returns None once the queue is closed and drained.
    pub fn pop(&self) -> Option<FrameInfo> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                drop(state);
                self.space_available.notify_one();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.frame_available.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameInfo> {
        let mut state = self.state.lock();
        if state.frames.is_empty() && !state.closed {
            let _ = self.frame_available.wait_for(&mut state, timeout);
        }
        let frame = state.frames.pop_front();
        drop(state);
        if frame.is_some() {
            self.space_available.notify_one();
        }
        frame
    }

    /// Removes the front frame without blocking.
    pub fn try_pop(&self) -> Option<FrameInfo> {
        let frame = self.state.lock().frames.pop_front();
        if frame.is_some() {
            self.space_available.notify_one();
        }
        frame
    }

    /// Removes the front frame if it is due at `time` seconds.
    ///
    /// The end-of-stream sentinel is always due. Never blocks.
    pub fn pop_due(&self, time: f64) -> Option<FrameInfo> {
        let mut state = self.state.lock();
        let due = state.frames.front().is_some_and(|f| f.pts() <= time);
        if !due {
            return None;
        }
        let frame = state.frames.pop_front();
        drop(state);
        self.space_available.notify_one();
        frame
    }

    /// Presentation time of the front frame.
    pub fn peek_pts(&self) -> Option<f64> {
        self.state.lock().frames.front().map(FrameInfo::pts)
    }

    /// Empties the queue and records `target` as the pending seek.
    ///
    /// Returns the discarded frames so the caller can drop them outside the
    /// lock. A previously pending target is overwritten.
    pub fn clear_and_seek(&self, target: f64) -> VecDeque<FrameInfo> {
        self.clear_and_seek_with(target, || ())
    }

    /// [`clear_and_seek`](Self::clear_and_seek), running `under_lock` inside
    /// the same critical section.
    pub fn clear_and_seek_with(
        &self,
        target: f64,
        under_lock: impl FnOnce(),
    ) -> VecDeque<FrameInfo> {
        let mut state = self.state.lock();
        if let Some(previous) = state.seek_target.replace(target) {
            tracing::debug!("FrameQueue: seek to {previous:.3}s superseded by {target:.3}s");
        }
        let dropped = std::mem::take(&mut state.frames);
        under_lock();
        drop(state);

        tracing::debug!(
            "FrameQueue::clear_and_seek({target:.3}): dropped {} frames",
            dropped.len()
        );
        self.space_available.notify_all();
        dropped
    }

    /// Takes the pending seek target, if any.
    pub fn take_pending_seek(&self) -> Option<f64> {
        self.state.lock().seek_target.take()
    }

    pub fn has_pending_seek(&self) -> bool {
        self.state.lock().seek_target.is_some()
    }

    /// Closes the queue and wakes every waiter.
    ///
    /// `under_lock` runs inside the critical section, so a state change made
    /// there is ordered before any waiter re-checks its predicate.
    pub fn close_with(&self, under_lock: impl FnOnce()) {
        let mut state = self.state.lock();
        state.closed = true;
        under_lock();
        drop(state);
        self.space_available.notify_all();
        self.frame_available.notify_all();
    }

    pub fn close(&self) {
        self.close_with(|| ());
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Reopens a closed queue for a new decode run, discarding leftovers.
    ///
    /// A pending seek survives so a restart can resume at the requested time.
    pub fn reopen(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = false;
        let dropped = state.frames.len();
        state.frames.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
