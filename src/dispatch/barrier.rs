//! Completion barrier
//!
//! Counts the invocations a parallel dispatch has in flight and joins their
//! completion handles. The coordinator polls [`CompletionBarrier::next`]
//! alongside its event queue, so it keeps servicing notifications while the
//! barrier is armed.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;

use crate::channel::{Completion, InvocationHandle, Outcome};
use crate::common::{Error, Result};

/// Read-only view of the barrier, safe to share across tasks
#[derive(Debug, Default)]
pub struct BarrierProbe {
    armed: AtomicBool,
    outstanding: AtomicUsize,
}

impl BarrierProbe {
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

pub struct CompletionBarrier {
    armed: bool,
    outstanding: usize,
    function: String,
    /// Channels that have not reported yet
    remaining: BTreeSet<u8>,
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    /// Synthesized completions for channels given up on
    expired: VecDeque<Completion>,
    timeout: Option<Duration>,
    armed_at: Option<Instant>,
    probe: Arc<BarrierProbe>,
}

impl CompletionBarrier {
    /// A disarmed barrier; `timeout` bounds every armed wait
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            armed: false,
            outstanding: 0,
            function: String::new(),
            remaining: BTreeSet::new(),
            pending: FuturesUnordered::new(),
            expired: VecDeque::new(),
            timeout,
            armed_at: None,
            probe: Arc::new(BarrierProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<BarrierProbe> {
        self.probe.clone()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Expect one completion from each of `channels`
    ///
    /// An empty set leaves the barrier disarmed.
    pub fn arm(&mut self, function: &str, channels: &[u8]) -> Result<()> {
        if self.armed {
            return Err(Error::BarrierArmed(self.outstanding));
        }
        if channels.is_empty() {
            return Ok(());
        }

        self.remaining = channels.iter().copied().collect();
        self.outstanding = self.remaining.len();
        self.function = function.to_string();
        self.pending = FuturesUnordered::new();
        self.expired.clear();
        self.armed_at = Some(Instant::now());
        self.armed = true;
        self.publish();

        tracing::debug!(function, outstanding = self.outstanding, "Barrier armed");
        Ok(())
    }

    /// Join a completion handle returned by a channel invocation
    pub fn attach(&mut self, handle: InvocationHandle) {
        self.pending.push(handle.completion());
    }

    /// Record a completion that did not come through a handle
    pub fn attach_completion(&mut self, completion: Completion) {
        self.expired.push_back(completion);
    }

    /// Next counted completion; `None` once the barrier is disarmed
    ///
    /// Cancel safe: a completion is counted in the same poll that yields it.
    pub async fn next(&mut self) -> Option<Completion> {
        loop {
            if !self.armed {
                return None;
            }

            if let Some(completion) = self.expired.pop_front() {
                if let Some(c) = self.record(completion) {
                    return Some(c);
                }
                continue;
            }

            let next = match self.deadline() {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.give_up(Outcome::TimedOut);
                        continue;
                    }
                },
                None => self.pending.next().await,
            };

            match next {
                Some(completion) => {
                    if let Some(c) = self.record(completion) {
                        return Some(c);
                    }
                }
                // Armed for channels that never got a handle attached
                None => self.give_up(Outcome::Lost("no completion handle".to_string())),
            }
        }
    }

    /// Drain until disarmed; returns immediately when not armed
    pub async fn wait(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();
        while let Some(c) = self.next().await {
            completions.push(c);
        }
        completions
    }

    fn deadline(&self) -> Option<Instant> {
        match (self.timeout, self.armed_at) {
            (Some(timeout), Some(at)) => Some(at + timeout),
            _ => None,
        }
    }

    /// Count a completion exactly once per addressed channel
    fn record(&mut self, completion: Completion) -> Option<Completion> {
        if !self.remaining.remove(&completion.channel) {
            tracing::warn!(
                channel = completion.channel,
                function = %completion.function,
                "Ignoring completion from a channel the barrier is not waiting for"
            );
            return None;
        }

        self.outstanding -= 1;
        if self.outstanding == 0 {
            self.armed = false;
            self.armed_at = None;
            self.pending = FuturesUnordered::new();
            tracing::debug!(function = %self.function, "Barrier drained");
        }
        self.publish();
        Some(completion)
    }

    /// Stop waiting on the remaining channels, reporting each with `outcome`
    fn give_up(&mut self, outcome: Outcome) {
        let elapsed = self
            .armed_at
            .map(|at| at.elapsed())
            .unwrap_or_default();
        tracing::warn!(
            function = %self.function,
            channels = ?self.remaining,
            "Barrier giving up on channels: {}",
            outcome
        );

        self.pending = FuturesUnordered::new();
        // Later arrivals are ignored by `record`, nothing else is left to poll
        self.armed_at = None;
        for channel in &self.remaining {
            self.expired.push_back(Completion::new(
                *channel,
                &self.function,
                outcome.clone(),
                elapsed,
            ));
        }
    }

    fn publish(&self) {
        self.probe.armed.store(self.armed, Ordering::Release);
        self.probe
            .outstanding
            .store(self.outstanding, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn pending(channel: u8) -> (oneshot::Sender<Completion>, InvocationHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = InvocationHandle::Pending {
            channel,
            function: "f".to_string(),
            started: std::time::Instant::now(),
            receiver: rx,
        };
        (tx, handle)
    }

    fn done(channel: u8) -> Completion {
        Completion::new(channel, "f", Outcome::Passed, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_drains_after_exactly_k_in_any_order() {
        let mut barrier = CompletionBarrier::new(None);
        let probe = barrier.probe();
        barrier.arm("f", &[1, 2, 3]).unwrap();
        assert!(probe.is_armed());
        assert_eq!(probe.outstanding(), 3);

        let mut senders = Vec::new();
        for ch in [1, 2, 3] {
            let (tx, handle) = pending(ch);
            barrier.attach(handle);
            senders.push((ch, tx));
        }

        // Report out of order
        for (ch, tx) in senders.into_iter().rev() {
            tx.send(done(ch)).unwrap();
        }

        let completions = barrier.wait().await;
        assert_eq!(completions.len(), 3);
        assert!(!barrier.is_armed());
        assert!(!probe.is_armed());
        assert_eq!(probe.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_on_disarmed_returns_immediately() {
        let mut barrier = CompletionBarrier::new(None);
        assert!(barrier.wait().await.is_empty());
        assert!(barrier.next().await.is_none());
    }

    #[tokio::test]
    async fn test_arm_twice_rejected() {
        let mut barrier = CompletionBarrier::new(None);
        barrier.arm("f", &[1]).unwrap();
        assert!(matches!(barrier.arm("g", &[2]), Err(Error::BarrierArmed(1))));
    }

    #[tokio::test]
    async fn test_empty_arm_stays_disarmed() {
        let mut barrier = CompletionBarrier::new(None);
        barrier.arm("f", &[]).unwrap();
        assert!(!barrier.is_armed());
    }

    #[tokio::test]
    async fn test_duplicate_completion_counted_once() {
        let mut barrier = CompletionBarrier::new(None);
        barrier.arm("f", &[1, 2]).unwrap();
        barrier.attach(InvocationHandle::Ready(done(1)));
        barrier.attach(InvocationHandle::Ready(done(1)));
        let (tx, handle) = pending(2);
        barrier.attach(handle);

        let first = barrier.next().await.unwrap();
        assert_eq!(first.channel, 1);
        assert_eq!(barrier.outstanding(), 1);

        tx.send(done(2)).unwrap();
        let second = barrier.next().await.unwrap();
        assert_eq!(second.channel, 2);
        assert!(!barrier.is_armed());
    }

    #[tokio::test]
    async fn test_dropped_worker_reports_lost() {
        let mut barrier = CompletionBarrier::new(None);
        barrier.arm("f", &[4]).unwrap();
        let (tx, handle) = pending(4);
        barrier.attach(handle);
        drop(tx);

        let completion = barrier.next().await.unwrap();
        assert!(matches!(completion.outcome, Outcome::Lost(_)));
        assert!(!barrier.is_armed());
    }

    #[tokio::test]
    async fn test_timeout_reports_stalled_channels() {
        let mut barrier = CompletionBarrier::new(Some(Duration::from_millis(100)));
        barrier.arm("f", &[1, 2]).unwrap();
        barrier.attach(InvocationHandle::Ready(done(1)));
        let (_tx, handle) = pending(2);
        barrier.attach(handle);

        let completions = barrier.wait().await;
        assert_eq!(completions.len(), 2);
        let stalled = completions.iter().find(|c| c.channel == 2).unwrap();
        assert_eq!(stalled.outcome, Outcome::TimedOut);
        assert!(!barrier.is_armed());
    }
}
