//! # Owned Timer Handles
//!
//! A [`Timer`] is a single pending deadline owned by the component it belongs
//! to. Arming spawns a sleeping task that delivers an event into the owner's
//! event channel; cancelling aborts that task.
//!
//! ## Stale Firings:
//! An event may already sit in the channel when the timer is cancelled or
//! re-armed. Every arm therefore gets a fresh generation number, carried inside
//! the event, and the owner calls [`Timer::accept`] before acting on it. Only
//! the generation of the current arm is accepted, and only once.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A cancellable one-shot timer that reports into an event channel.
#[derive(Debug)]
pub struct Timer<E> {
    events: mpsc::UnboundedSender<E>,
    task: Option<JoinHandle<()>>,
    generation: u64,
    armed: bool,
}

impl<E: Send + 'static> Timer<E> {
    pub fn new(events: mpsc::UnboundedSender<E>) -> Self {
        Self { events, task: None, generation: 0, armed: false }
    }

    /// Cancel any pending deadline and arm a new one `after` from now.
    ///
    /// `make_event` receives the generation of this arm and builds the event
    /// that will be delivered. Returns that generation.
    pub fn arm<F>(&mut self, after: Duration, make_event: F) -> u64
    where
        F: FnOnce(u64) -> E,
    {
        self.cancel();
        let generation = self.generation;
        let event = make_event(generation);
        let events = self.events.clone();

        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        }));
        self.armed = true;
        generation
    }

    /// Drop the pending deadline, if any. Events already delivered become stale.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.armed = false;
        self.generation += 1;
    }

    /// Claim a delivered firing. True only for the current arm's first delivery.
    pub fn accept(&mut self, generation: u64) -> bool {
        if self.armed && generation == self.generation {
            self.armed = false;
            self.task = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl<E> Drop for Timer<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(tx);
        let gen = timer.arm(Duration::from_secs(2), |g| g);
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, gen);
        assert!(timer.accept(fired));
        assert!(!timer.accept(fired));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut timer = Timer::new(tx);
        timer.arm(Duration::from_secs(1), |g| g);
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_queued_event_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(tx);
        let first = timer.arm(Duration::from_millis(10), |g| g);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The first event is already in the channel when we re-arm
        let second = timer.arm(Duration::from_millis(10), |g| g);
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued, first);
        assert!(!timer.accept(queued));

        let fresh = rx.recv().await.unwrap();
        assert_eq!(fresh, second);
        assert!(timer.accept(fresh));
    }
}
