//! Dispatcher: routes a named function to the coordinator or to the channels
//!
//! Sequential functions run once, inline, holding the shared fixture
//! resource. Parallel functions are invoked on every active channel and the
//! completion barrier is armed with exactly the channels addressed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use super::barrier::{BarrierProbe, CompletionBarrier};
use super::registry::{Classification, FunctionKind, FunctionRegistry};
use crate::channel::{Channel, ChannelContext, Completion, Outcome, SharedResource};
use crate::common::{Error, Result};
use crate::coordinator::session::SessionInfo;

/// View of the fixture handed to sequential function bodies
pub struct FixtureContext<'a> {
    channels: &'a mut [Channel],
    session: &'a SessionInfo,
}

impl<'a> FixtureContext<'a> {
    pub fn new(channels: &'a mut [Channel], session: &'a SessionInfo) -> Self {
        Self { channels, session }
    }

    pub fn session(&self) -> &SessionInfo {
        self.session
    }

    /// Ordinals of channels that can take work
    pub fn active_channels(&self) -> Vec<u8> {
        self.channels
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.ordinal())
            .collect()
    }

    pub fn channel(&mut self, ordinal: u8) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.ordinal() == ordinal)
    }

    /// Run a job on a channel's worker and wait for it
    pub async fn on_channel<R, F>(&mut self, ordinal: u8, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'c> FnOnce(&'c mut ChannelContext) -> BoxFuture<'c, R> + Send + 'static,
    {
        let channel = self
            .channel(ordinal)
            .ok_or_else(|| Error::hardware(ordinal, "channel is not present in this fixture"))?;
        channel.run(f).await
    }

    /// Run a job on every active channel in turn
    ///
    /// A failing channel does not stop the others. A channel that lost its
    /// hardware is marked disconnected; the error names every failed ordinal.
    pub async fn on_each_active<F>(&mut self, function: &str, f: F) -> Result<()>
    where
        F: for<'c> FnOnce(&'c mut ChannelContext) -> BoxFuture<'c, Result<()>>
            + Clone
            + Send
            + 'static,
    {
        let mut failed = Vec::new();
        for ordinal in self.active_channels() {
            let Err(e) = self.on_channel(ordinal, f.clone()).await.and_then(|r| r) else {
                continue;
            };
            tracing::warn!(channel = ordinal, function, "Channel failed: {}", e);
            if e.is_device_lost() {
                if let Some(channel) = self.channel(ordinal) {
                    channel.mark_disconnected();
                }
            }
            failed.push(ordinal);
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::ChannelsFailed {
                function: function.to_string(),
                channels: failed,
            })
        }
    }
}

/// What a dispatch did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub function: String,
    pub classification: Classification,
    /// Channels invoked; empty for sequential functions
    pub addressed: Vec<u8>,
    /// Completions already counted during the dispatch itself
    pub settled: Vec<Completion>,
    /// Result of a sequential function
    pub outcome: Option<Outcome>,
    pub elapsed_ms: u64,
}

pub struct Dispatcher {
    registry: FunctionRegistry,
    channels: Vec<Channel>,
    barrier: CompletionBarrier,
    shared: SharedResource,
    invoke_stagger: Duration,
}

impl Dispatcher {
    pub fn new(
        channels: Vec<Channel>,
        shared: SharedResource,
        barrier_timeout: Option<Duration>,
        invoke_stagger: Duration,
    ) -> Self {
        Self {
            registry: FunctionRegistry::empty(),
            channels,
            barrier: CompletionBarrier::new(barrier_timeout),
            shared,
            invoke_stagger,
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Replace the registry wholesale
    pub fn set_registry(&mut self, registry: FunctionRegistry) -> Result<()> {
        if self.barrier.is_armed() {
            return Err(Error::BarrierArmed(self.barrier.outstanding()));
        }
        self.registry = registry;
        Ok(())
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    pub fn channel_mut(&mut self, ordinal: u8) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.ordinal() == ordinal)
    }

    pub fn channel_for_dut(&mut self, no: u32) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.owns_dut(no))
    }

    pub fn active_channels(&self) -> Vec<u8> {
        self.channels
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.ordinal())
            .collect()
    }

    pub fn shared_resource(&self) -> SharedResource {
        self.shared.clone()
    }

    pub fn barrier_probe(&self) -> Arc<BarrierProbe> {
        self.barrier.probe()
    }

    pub fn is_armed(&self) -> bool {
        self.barrier.is_armed()
    }

    /// Locate, classify and issue a function
    #[tracing::instrument(skip(self, session), fields(method = %self.registry.method()))]
    pub async fn dispatch(&mut self, name: &str, session: &SessionInfo) -> Result<DispatchReport> {
        if self.barrier.is_armed() {
            return Err(Error::BarrierArmed(self.barrier.outstanding()));
        }

        let kind = self.registry.resolve(name)?.kind.clone();
        let started = Instant::now();

        let report = match kind {
            FunctionKind::Sequential(function) => {
                let _resource = self
                    .shared
                    .clone()
                    .try_lock_owned()
                    .map_err(|_| Error::SequentialResourceBusy(name.to_string()))?;

                tracing::info!("Running sequential function");
                let mut fixture = FixtureContext::new(&mut self.channels, session);
                let outcome = match function.run(&mut fixture).await {
                    Ok(()) => Outcome::Passed,
                    Err(e) => {
                        tracing::warn!("Sequential function failed: {}", e);
                        Outcome::Failed(e.to_string())
                    }
                };

                DispatchReport {
                    function: name.to_string(),
                    classification: Classification::Sequential,
                    addressed: Vec::new(),
                    settled: Vec::new(),
                    outcome: Some(outcome),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            }
            FunctionKind::Parallel(function) => {
                let addressed = self.active_channels();
                self.barrier.arm(name, &addressed)?;
                tracing::info!(channels = ?addressed, "Invoking on active channels");

                for (i, ordinal) in addressed.iter().enumerate() {
                    if i > 0 && !self.invoke_stagger.is_zero() {
                        tokio::time::sleep(self.invoke_stagger).await;
                    }
                    let Some(channel) = self.channels.iter_mut().find(|c| c.ordinal() == *ordinal)
                    else {
                        continue;
                    };
                    match channel.invoke(name, function.clone()).await {
                        Ok(handle) => self.barrier.attach(handle),
                        Err(e) => {
                            tracing::warn!(channel = *ordinal, "Invocation not started: {}", e);
                            let outcome = if e.is_device_lost() {
                                Outcome::Lost(e.to_string())
                            } else {
                                Outcome::Failed(e.to_string())
                            };
                            self.barrier.attach_completion(Completion::new(
                                *ordinal,
                                name,
                                outcome,
                                Duration::ZERO,
                            ));
                        }
                    }
                }

                // Inline channels have already finished; count them now
                let mut settled = Vec::new();
                while let Some(Some(completion)) = self.barrier.next().now_or_never() {
                    self.settle(&completion);
                    settled.push(completion);
                }

                DispatchReport {
                    function: name.to_string(),
                    classification: Classification::PerChannelParallel,
                    addressed,
                    settled,
                    outcome: None,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        Ok(report)
    }

    /// Next completion of the armed barrier, applied to its channel
    ///
    /// Cancel safe.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        let completion = self.barrier.next().await?;
        self.settle(&completion);
        Some(completion)
    }

    fn settle(&mut self, completion: &Completion) {
        if let Some(channel) = self.channel_mut(completion.channel) {
            channel.complete(completion);
        }
    }

    /// Stop every channel worker and release the hardware
    pub async fn shutdown(self) {
        for channel in self.channels {
            channel.shutdown().await;
        }
    }
}
