use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tollgate_common::RateLimitTier;

/// Raised when a submission finds the queue already at `high_water`.
#[derive(Debug, Clone, Copy)]
pub struct QueueOverflow;

#[derive(Debug, Clone, Copy)]
pub struct LimiterSnapshot {
    pub running: u32,
    pub queued: u32,
    pub reservoir: u32,
}

struct State {
    reservoir: u32,
    running: u32,
    queue_len: u32,
    next_ticket: u64,
    serving_ticket: u64,
    last_activity: Instant,
}

/// One mutex-guarded `(reservoir, running, queue)` limiter with a single
/// background ticker for the hard reservoir refill.
///
/// The admission queue is modeled as a ticket counter rather than an actual
/// `VecDeque` of waiters: each caller takes a ticket on enqueue and is only
/// allowed to debit the reservoir once it is the ticket currently being
/// served, which gives strict FIFO order without needing to store waker
/// handles directly.
pub struct Limiter {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    max_concurrent: u32,
    high_water: u32,
    refresh_amount: u32,
}

/// Held by an admitted caller; releases its running-slot on drop so a panic
/// inside the metered work still frees the slot.
pub struct AdmitGuard {
    limiter: Arc<Limiter>,
}

impl Drop for AdmitGuard {
    fn drop(&mut self) {
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let mut state = limiter.state.lock().await;
            state.running = state.running.saturating_sub(1);
            state.last_activity = Instant::now();
            drop(state);
            limiter.notify.notify_waiters();
        });
    }
}

impl Limiter {
    pub fn spawn(name: impl Into<String>, tier: RateLimitTier) -> Arc<Self> {
        let limiter = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                reservoir: tier.requests_per_minute,
                running: 0,
                queue_len: 0,
                next_ticket: 0,
                serving_ticket: 0,
                last_activity: Instant::now(),
            }),
            notify: Notify::new(),
            max_concurrent: tier.concurrent_limit,
            high_water: tier.queue_size,
            refresh_amount: tier.requests_per_minute,
        });
        limiter.clone().spawn_refill_ticker();
        limiter
    }

    /// Enqueues the caller, blocks until admitted, and returns a guard that
    /// releases the running-slot on drop. Returns `QueueOverflow`
    /// synchronously if the queue was already full at enqueue time.
    ///
    /// If the returned future is dropped before completing, the enqueued
    /// ticket is retired without ever debiting the reservoir and without
    /// stalling tickets behind it (see `EnqueueGuard`).
    pub async fn admit(self: &Arc<Self>) -> Result<AdmitGuard, QueueOverflow> {
        let ticket = {
            let mut state = self.state.lock().await;
            if state.queue_len >= self.high_water {
                return Err(QueueOverflow);
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue_len += 1;
            ticket
        };
        let mut enqueued = EnqueueGuard {
            limiter: self.clone(),
            ticket,
            admitted: false,
        };

        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if ticket == state.serving_ticket
                    && state.reservoir >= 1
                    && state.running < self.max_concurrent
                {
                    state.reservoir -= 1;
                    state.running += 1;
                    state.queue_len -= 1;
                    state.serving_ticket += 1;
                    state.last_activity = Instant::now();
                    drop(state);
                    enqueued.admitted = true;
                    self.notify.notify_waiters();
                    return Ok(AdmitGuard {
                        limiter: self.clone(),
                    });
                }
            }
            notified.await;
        }
    }

    pub async fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock().await;
        LimiterSnapshot {
            running: state.running,
            queued: state.queue_len,
            reservoir: state.reservoir,
        }
    }

    pub fn idle_since(&self) -> Instant {
        // Best-effort snapshot without awaiting the lock; used only by the
        // reaper, which tolerates a stale read by a tick.
        self.state
            .try_lock()
            .map(|s| s.last_activity)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn is_quiescent(&self) -> bool {
        self.state
            .try_lock()
            .map(|s| s.running == 0 && s.queue_len == 0)
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn spawn_refill_ticker(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            // `interval`'s first tick completes immediately; consume it here
            // so the reservoir isn't reset right after construction.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut state = self.state.lock().await;
                state.reservoir = self.refresh_amount;
                drop(state);
                self.notify.notify_waiters();
            }
        });
    }
}

/// Retires a ticket on drop. If the holder was admitted, this is a no-op
/// (the ticket was already retired at admission time). If the holder was
/// cancelled while still waiting, this removes it from the queue count and,
/// if it held the front-of-line ticket, advances `serving_ticket` so the
/// next caller in line isn't stalled forever.
struct EnqueueGuard {
    limiter: Arc<Limiter>,
    ticket: u64,
    admitted: bool,
}

impl Drop for EnqueueGuard {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let limiter = self.limiter.clone();
        let ticket = self.ticket;
        tokio::spawn(async move {
            let mut state = limiter.state.lock().await;
            state.queue_len = state.queue_len.saturating_sub(1);
            if state.serving_ticket == ticket {
                state.serving_ticket += 1;
            }
            drop(state);
            limiter.notify.notify_waiters();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(rpm: u32, concurrent: u32, queue: u32) -> RateLimitTier {
        RateLimitTier {
            requests_per_minute: rpm,
            concurrent_limit: concurrent,
            queue_size: queue,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admits_up_to_concurrency_limit() {
        let limiter = Limiter::spawn("t", tier(100, 2, 10));
        let g1 = limiter.admit().await.unwrap();
        let g2 = limiter.admit().await.unwrap();
        let snap = limiter.snapshot().await;
        assert_eq!(snap.running, 2);
        drop(g1);
        drop(g2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflow_when_queue_full() {
        let limiter = Limiter::spawn("t", tier(100, 1, 1));
        let _g1 = limiter.admit().await.unwrap();
        // second caller occupies the one queue slot by awaiting in a task.
        let limiter2 = limiter.clone();
        let waiting = tokio::spawn(async move { limiter2.admit().await });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let overflowed = limiter.admit().await;
        assert!(overflowed.is_err());
        waiting.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reservoir_bounds_admissions() {
        let limiter = Limiter::spawn("t", tier(1, 5, 5));
        let g1 = limiter.admit().await.unwrap();
        drop(g1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = tokio::time::timeout(Duration::from_millis(50), limiter.admit()).await;
        assert!(result.is_err(), "second admission should block until refill");
    }
}
