//! # Playback Queue
//!
//! Schedules server audio back-to-back on the output context so consecutive
//! chunks play without gaps or clicks.
//!
//! ## Scheduling Rule:
//! Each chunk starts at `max(next_start, now)`, where `next_start` is the end
//! of the previously scheduled chunk. While audio keeps arriving faster than it
//! plays, chunks butt up against each other exactly; after an underrun the next
//! chunk starts immediately.
//!
//! ## Activity Edges:
//! `is_playing` becomes true when the first chunk is scheduled and false once
//! the clock passes the end of the last one. The engine polls [`AudioPlaybackQueue::poll`]
//! to observe the falling edge, which marks "AI finished speaking".
//!
//! Bad chunks (undecodable base64) and chunks arriving after the context was
//! closed are dropped without surfacing an error to the caller.

use crate::audio::codec::{duration_secs, pcm16_base64_to_float};
use crate::device::OutputContext;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Edges reported by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio started after silence.
    Started,
    /// Every scheduled chunk has finished playing.
    Drained,
}

/// Outcome of [`AudioPlaybackQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Scheduled; carries `Started` when this chunk ended a silence.
    Scheduled(Option<PlaybackEvent>),
    /// Dropped because it could not be decoded.
    Malformed,
    /// Dropped because the output context is gone.
    ContextClosed,
}

/// One chunk on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub end: f64,
}

/// Owner of the output context for one conversation.
pub struct AudioPlaybackQueue {
    context: Box<dyn OutputContext>,
    next_start: f64,
    scheduled: VecDeque<ScheduledChunk>,
    playing: bool,
    chunks_played: u64,
}

impl AudioPlaybackQueue {
    pub fn new(context: Box<dyn OutputContext>) -> Self {
        Self {
            context,
            next_start: 0.0,
            scheduled: VecDeque::new(),
            playing: false,
            chunks_played: 0,
        }
    }

    /// Decode a base64 PCM16 chunk and schedule it right after the previous one.
    pub fn enqueue(&mut self, chunk: &str, sample_rate: u32) -> EnqueueOutcome {
        if self.context.is_closed() {
            debug!("Output context closed, dropping late audio chunk");
            return EnqueueOutcome::ContextClosed;
        }

        let samples = match pcm16_base64_to_float(chunk) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping undecodable audio chunk: {}", e);
                return EnqueueOutcome::Malformed;
            }
        };
        if samples.is_empty() || sample_rate == 0 {
            return EnqueueOutcome::Malformed;
        }

        self.reap_finished();

        let now = self.context.current_time();
        let start = self.next_start.max(now);
        let end = start + duration_secs(samples.len(), sample_rate);

        if let Err(e) = self.context.schedule(samples, sample_rate, start) {
            debug!("Output refused chunk: {}", e);
            return EnqueueOutcome::ContextClosed;
        }

        self.scheduled.push_back(ScheduledChunk { start, end });
        self.next_start = end;

        if self.playing {
            EnqueueOutcome::Scheduled(None)
        } else {
            self.playing = true;
            EnqueueOutcome::Scheduled(Some(PlaybackEvent::Started))
        }
    }

    /// Stop whatever is audible and forget everything queued.
    ///
    /// Does not report `Drained`: a flush is an interruption, not the AI finishing.
    pub fn flush(&mut self) {
        if !self.scheduled.is_empty() {
            debug!(discarded = self.scheduled.len(), "Flushing playback queue");
        }
        self.context.stop_all();
        self.scheduled.clear();
        self.playing = false;
        self.next_start = self.context.current_time();
    }

    /// Drop finished chunks and report the falling edge once the queue drains.
    pub fn poll(&mut self) -> Option<PlaybackEvent> {
        self.reap_finished();
        if self.playing && self.scheduled.is_empty() {
            self.playing = false;
            return Some(PlaybackEvent::Drained);
        }
        None
    }

    /// Tear the output context down. Later chunks are silently dropped.
    pub fn close(&mut self) {
        self.flush();
        if let Err(e) = self.context.close() {
            warn!("Failed to close output context: {}", e);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn queued_chunks(&self) -> usize {
        self.scheduled.len()
    }

    pub fn chunks_played(&self) -> u64 {
        self.chunks_played
    }

    /// Seconds until the last scheduled chunk ends.
    pub fn remaining_secs(&self) -> f64 {
        (self.next_start - self.context.current_time()).max(0.0)
    }

    fn reap_finished(&mut self) {
        let now = self.context.current_time();
        while let Some(front) = self.scheduled.front() {
            if front.end <= now {
                self.scheduled.pop_front();
                self.chunks_played += 1;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::float_to_pcm16_base64;
    use crate::error::DeviceError;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Timeline {
        now: f64,
        starts: Vec<(f64, usize)>,
        stops: usize,
        closed: bool,
    }

    /// Output double whose clock the test moves by hand.
    struct ManualOutput(Arc<Mutex<Timeline>>);

    impl OutputContext for ManualOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }
        fn sample_rate(&self) -> u32 {
            24000
        }
        fn schedule(&mut self, samples: Vec<f32>, _rate: u32, start_at: f64) -> Result<(), DeviceError> {
            let mut t = self.0.lock().unwrap();
            if t.closed {
                return Err(DeviceError::Closed);
            }
            t.starts.push((start_at, samples.len()));
            Ok(())
        }
        fn stop_all(&mut self) {
            self.0.lock().unwrap().stops += 1;
        }
        fn close(&mut self) -> Result<(), DeviceError> {
            self.0.lock().unwrap().closed = true;
            Ok(())
        }
        fn is_closed(&self) -> bool {
            self.0.lock().unwrap().closed
        }
    }

    fn queue() -> (AudioPlaybackQueue, Arc<Mutex<Timeline>>) {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        (AudioPlaybackQueue::new(Box::new(ManualOutput(timeline.clone()))), timeline)
    }

    /// 0.1s of audio at 1kHz with a distinct level.
    fn chunk(level: f32) -> String {
        float_to_pcm16_base64(&vec![level; 100])
    }

    #[test]
    fn test_chunks_are_gapless_and_ordered() {
        let (mut q, timeline) = queue();
        for i in 0..5 {
            q.enqueue(&chunk(i as f32 / 10.0), 1000);
        }

        let starts = timeline.lock().unwrap().starts.clone();
        assert_eq!(starts.len(), 5);
        for pair in starts.windows(2) {
            let (prev_start, prev_len) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start >= prev_start);
            assert!((next_start - (prev_start + prev_len as f64 / 1000.0)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_started_and_drained_edges() {
        let (mut q, timeline) = queue();
        assert_eq!(q.enqueue(&chunk(0.1), 1000), EnqueueOutcome::Scheduled(Some(PlaybackEvent::Started)));
        assert_eq!(q.enqueue(&chunk(0.2), 1000), EnqueueOutcome::Scheduled(None));
        assert!(q.is_playing());

        timeline.lock().unwrap().now = 0.15;
        assert_eq!(q.poll(), None);
        assert_eq!(q.queued_chunks(), 1);

        timeline.lock().unwrap().now = 0.2;
        assert_eq!(q.poll(), Some(PlaybackEvent::Drained));
        assert!(!q.is_playing());
        assert_eq!(q.poll(), None);
        assert_eq!(q.chunks_played(), 2);
    }

    #[test]
    fn test_underrun_restarts_at_now() {
        let (mut q, timeline) = queue();
        q.enqueue(&chunk(0.1), 1000);
        timeline.lock().unwrap().now = 1.0;
        q.poll();
        q.enqueue(&chunk(0.2), 1000);
        let starts = timeline.lock().unwrap().starts.clone();
        assert_eq!(starts[1].0, 1.0);
    }

    #[test]
    fn test_flush_barge_in_clears_queue() {
        let (mut q, timeline) = queue();
        for _ in 0..3 {
            q.enqueue(&chunk(0.3), 1000);
        }
        assert_eq!(q.queued_chunks(), 3);

        q.flush();
        assert!(!q.is_playing());
        assert_eq!(q.queued_chunks(), 0);
        assert_eq!(timeline.lock().unwrap().stops, 1);
        // Flushing is not the AI finishing
        assert_eq!(q.poll(), None);
        assert_eq!(q.remaining_secs(), 0.0);
    }

    #[test]
    fn test_bad_chunk_does_not_break_queue() {
        let (mut q, _timeline) = queue();
        assert_eq!(q.enqueue("%%%not-base64%%%", 24000), EnqueueOutcome::Malformed);
        assert!(!q.is_playing());
        assert!(matches!(q.enqueue(&chunk(0.1), 1000), EnqueueOutcome::Scheduled(_)));
    }

    #[test]
    fn test_chunks_after_close_are_dropped() {
        let (mut q, timeline) = queue();
        q.close();
        assert_eq!(q.enqueue(&chunk(0.1), 1000), EnqueueOutcome::ContextClosed);
        assert!(timeline.lock().unwrap().starts.is_empty());
    }
}
