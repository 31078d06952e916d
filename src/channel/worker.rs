//! Dedicated worker thread for one channel
//!
//! The worker owns the channel's context (and so its hardware) for its whole
//! life. Everything that touches the hardware is submitted as a job and runs
//! on the worker's own single-threaded runtime, one job at a time.

use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::ChannelContext;
use crate::common::{Error, Result};

/// How long shutdown waits for a worker to finish its last job
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A unit of work executed against the channel context
pub type Job = Box<dyn for<'a> FnOnce(&'a mut ChannelContext) -> BoxFuture<'a, ()> + Send>;

/// Box a closure as a [`Job`]
pub fn job<F>(f: F) -> Job
where
    F: for<'a> FnOnce(&'a mut ChannelContext) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

pub struct Worker {
    channel: u8,
    jobs: mpsc::UnboundedSender<Job>,
    thread: JoinHandle<()>,
}

impl Worker {
    /// Start the worker thread, moving the context onto it
    pub fn spawn(mut ctx: ChannelContext) -> Result<Self> {
        let channel = ctx.ordinal();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        let thread = std::thread::Builder::new()
            .name(format!("channel-{}", channel))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(channel, "Failed to start channel runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(async move {
                    while let Some(job) = queue.recv().await {
                        job(&mut ctx).await;
                    }
                    ctx.release().await;
                });

                tracing::debug!(channel, "Channel worker stopped");
            })?;

        Ok(Self {
            channel,
            jobs,
            thread,
        })
    }

    /// Queue a job; jobs run in submission order
    pub fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| Error::WorkerStopped(self.channel))
    }

    /// Close the queue and join the thread once the queued jobs are done
    pub async fn stop(self) {
        let Self {
            channel,
            jobs,
            thread,
        } = self;
        drop(jobs);

        let join = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(STOP_GRACE, join).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(_))) => tracing::error!(channel, "Channel worker panicked"),
            Ok(Err(e)) => tracing::error!(channel, "Failed to join channel worker: {}", e),
            Err(_) => tracing::warn!(
                channel,
                "Channel worker still busy after {:?}, leaving it behind",
                STOP_GRACE
            ),
        }
    }
}
