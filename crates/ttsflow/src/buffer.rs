//! Bounded, ordinal-ordered queue between the scheduler and the controller.

use crate::error::BufferError;
use crate::types::AudioFrame;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BufferState {
    frames: VecDeque<AudioFrame>,
    buffered_seconds: f64,
    next_ordinal: usize,
    complete: bool,
    closed: bool,
    peak_len: usize,
}

/// FIFO of ready [`AudioFrame`]s.
///
/// Capacity is a frame count and, optionally, a total duration. A single frame
/// longer than the duration limit is still accepted into an empty buffer so a
/// long chunk cannot wedge the stream. Frames must arrive in ordinal order
/// starting at 0.
#[derive(Debug)]
pub struct PlaybackBuffer {
    state: Mutex<BufferState>,
    not_full: Notify,
    not_empty: Notify,
    capacity_frames: usize,
    max_seconds: Option<f64>,
}

impl PlaybackBuffer {
    pub fn new(capacity_frames: usize, max_seconds: Option<f64>) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            capacity_frames: capacity_frames.max(1),
            max_seconds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push without waiting. A full buffer hands the frame back in
    /// [`BufferError::Full`].
    pub fn try_push(&self, frame: AudioFrame) -> Result<(), BufferError> {
        let mut state = self.lock();
        if state.closed || state.complete {
            return Err(BufferError::Closed(frame));
        }
        if frame.ordinal != state.next_ordinal {
            return Err(BufferError::OutOfOrder {
                expected: state.next_ordinal,
                received: frame.ordinal,
            });
        }
        if !self.has_room(&state, frame.duration()) {
            return Err(BufferError::Full(frame));
        }

        state.buffered_seconds += frame.duration();
        state.next_ordinal += 1;
        state.frames.push_back(frame);
        state.peak_len = state.peak_len.max(state.frames.len());
        drop(state);

        self.not_empty.notify_waiters();
        Ok(())
    }

    fn has_room(&self, state: &BufferState, duration: f64) -> bool {
        if state.frames.is_empty() {
            return true;
        }
        if state.frames.len() >= self.capacity_frames {
            return false;
        }
        match self.max_seconds {
            Some(max) => state.buffered_seconds + duration <= max,
            None => true,
        }
    }

    /// Push, suspending while the buffer is full.
    pub async fn push(&self, mut frame: AudioFrame) -> Result<(), BufferError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(frame) {
                Err(BufferError::Full(rejected)) => frame = rejected,
                other => return other,
            }
            notified.await;
        }
    }

    /// Pop the next frame without waiting
    pub fn try_pop(&self) -> Option<AudioFrame> {
        let mut state = self.lock();
        let frame = state.frames.pop_front()?;
        state.buffered_seconds = (state.buffered_seconds - frame.duration()).max(0.0);
        if state.frames.is_empty() {
            state.buffered_seconds = 0.0;
        }
        drop(state);

        self.not_full.notify_waiters();
        Some(frame)
    }

    /// Next frame in ordinal order. Returns `None` once the stream is marked
    /// complete and drained, or after [`close`](Self::close).
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            {
                let state = self.lock();
                if state.complete || state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// No more frames will be pushed. Idempotent.
    pub fn mark_complete(&self) {
        self.lock().complete = true;
        self.not_empty.notify_waiters();
    }

    /// Discard buffered frames and reject further pushes. Returns the number
    /// of frames discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            state.closed = true;
            state.buffered_seconds = 0.0;
            let discarded = state.frames.len();
            state.frames.clear();
            discarded
        };
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        discarded
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn buffered_seconds(&self) -> f64 {
        self.lock().buffered_seconds
    }

    /// Highest number of frames held at once
    pub fn peak_len(&self) -> usize {
        self.lock().peak_len
    }

    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(ordinal: usize, samples: usize) -> AudioFrame {
        AudioFrame {
            ordinal,
            text: format!("chunk {ordinal}"),
            samples: vec![0; samples],
            sample_rate: 1000,
            timings: Vec::new(),
        }
    }

    #[test]
    fn rejects_out_of_order_frames() {
        let buffer = PlaybackBuffer::new(4, None);
        buffer.try_push(frame(0, 10)).unwrap();
        match buffer.try_push(frame(2, 10)) {
            Err(BufferError::OutOfOrder { expected, received }) => {
                assert_eq!(expected, 1);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn full_buffer_returns_frame() {
        let buffer = PlaybackBuffer::new(1, None);
        buffer.try_push(frame(0, 10)).unwrap();
        match buffer.try_push(frame(1, 10)) {
            Err(BufferError::Full(rejected)) => assert_eq!(rejected.ordinal, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(buffer.peak_len(), 1);
    }

    #[test]
    fn duration_limit_admits_first_frame() {
        let buffer = PlaybackBuffer::new(8, Some(0.5));
        // 2 seconds at 1 kHz, larger than the limit on its own
        buffer.try_push(frame(0, 2000)).unwrap();
        assert!(matches!(
            buffer.try_push(frame(1, 100)),
            Err(BufferError::Full(_))
        ));
        assert!((buffer.buffered_seconds() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pop_returns_none_after_complete_and_drain() {
        let buffer = PlaybackBuffer::new(4, None);
        buffer.try_push(frame(0, 10)).unwrap();
        buffer.mark_complete();
        buffer.mark_complete();
        assert_eq!(buffer.pop().await.map(|f| f.ordinal), Some(0));
        assert!(buffer.pop().await.is_none());
        assert!(matches!(
            buffer.try_push(frame(1, 10)),
            Err(BufferError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn push_waits_for_room() {
        let buffer = Arc::new(PlaybackBuffer::new(1, None));
        buffer.try_push(frame(0, 10)).unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(frame(1, 10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(buffer.len(), 1);

        assert_eq!(buffer.pop().await.map(|f| f.ordinal), Some(0));
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.pop().await.map(|f| f.ordinal), Some(1));
        assert_eq!(buffer.peak_len(), 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer_and_producer() {
        let buffer = Arc::new(PlaybackBuffer::new(1, None));
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.try_push(frame(0, 10)).unwrap();
        assert_eq!(consumer.await.unwrap().map(|f| f.ordinal), Some(0));

        buffer.try_push(frame(1, 10)).unwrap();
        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(frame(2, 10)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(buffer.close(), 1);
        assert!(matches!(
            producer.await.unwrap(),
            Err(BufferError::Closed(_))
        ));
        assert!(buffer.pop().await.is_none());
    }
}
