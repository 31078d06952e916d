//! Fixture channels
//!
//! A channel pairs one debug probe with the device client of one carrier
//! board. In multithread mode it is pinned to a dedicated worker thread and
//! every operation against its hardware becomes a job on that worker; with
//! multithreading off the same jobs run inline on the caller.

pub mod dut;
mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::common::config::{ChannelConfig, ProvisioningConfig};
use crate::common::{Error, Result};
use crate::hw::{ChannelHardware, DeviceClient, ProbeController};

pub use dut::{DutBank, DutOutcome, DutRecord};
use worker::{job, Worker};

/// Lock on the fixture resource shared by all channels (power rail, programming mux)
pub type SharedResource = Arc<tokio::sync::Mutex<()>>;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Created, not opened yet
    Idle,
    /// Opening hardware handles
    Connecting,
    /// Ready for invocations
    Active,
    /// An invocation is outstanding
    Busy,
    /// Failed to open or lost contact; never addressed by a dispatch
    Disconnected,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "idle"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Active => write!(f, "active"),
            ChannelState::Busy => write!(f, "busy"),
            ChannelState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// How one invocation on one channel ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// The function reported an error; the channel stays usable
    Failed(String),
    /// The channel can no longer reach its hardware
    Lost(String),
    /// The barrier gave up waiting for this channel
    TimedOut,
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    /// The channel must not be addressed again
    pub fn disconnects(&self) -> bool {
        matches!(self, Outcome::Lost(_) | Outcome::TimedOut)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
            Outcome::Lost(reason) => write!(f, "lost: {}", reason),
            Outcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Completion notification of one channel invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub channel: u8,
    pub function: String,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
}

impl Completion {
    pub fn new(channel: u8, function: &str, outcome: Outcome, elapsed: Duration) -> Self {
        Self {
            channel,
            function: function.to_string(),
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Notifications raised by channels towards the coordinator
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Selection or detection state of a DUT changed
    DutChanged { channel: u8, dut: DutRecord },
    /// A DUT got its final verdict for this cycle
    DutFullyTested { channel: u8, dut: DutRecord },
    SequenceStarted { channel: u8, function: String },
    SequenceFinished {
        channel: u8,
        function: String,
        outcome: Outcome,
    },
}

/// Per-channel body of a parallel test function
#[async_trait]
pub trait ChannelFunction: Send + Sync {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()>;
}

/// Everything a job on a channel can reach
pub struct ChannelContext {
    ordinal: u8,
    pub probe: Box<dyn ProbeController>,
    pub device: Box<dyn DeviceClient>,
    pub duts: DutBank,
    provisioning: Arc<ProvisioningConfig>,
    shared: SharedResource,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelContext {
    pub fn new(
        config: &ChannelConfig,
        hardware: ChannelHardware,
        provisioning: Arc<ProvisioningConfig>,
        shared: SharedResource,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            ordinal: config.ordinal,
            probe: hardware.probe,
            device: hardware.device,
            duts: DutBank::new(config.ordinal, &config.duts),
            provisioning,
            shared,
            events,
        }
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn provisioning(&self) -> &ProvisioningConfig {
        &self.provisioning
    }

    /// The fixture-wide resource lock, for work that needs the shared rail or mux
    pub fn shared_resource(&self) -> SharedResource {
        self.shared.clone()
    }

    /// Send an event; a closed receiver means the coordinator is gone
    pub fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(channel = self.ordinal, "Coordinator gone, event dropped");
        }
    }

    /// Raise `DutChanged` for the DUT at `position`
    pub fn publish_dut(&self, position: u8) {
        if let Some(dut) = self.duts.at(position) {
            self.emit(ChannelEvent::DutChanged {
                channel: self.ordinal,
                dut: dut.clone(),
            });
        }
    }

    /// Raise `DutFullyTested` for the DUT at `position`
    pub fn publish_fully_tested(&self, position: u8) {
        if let Some(dut) = self.duts.at(position) {
            self.emit(ChannelEvent::DutFullyTested {
                channel: self.ordinal,
                dut: dut.clone(),
            });
        }
    }

    fn publish_all(&self, records: Vec<DutRecord>) {
        for dut in records {
            self.emit(ChannelEvent::DutChanged {
                channel: self.ordinal,
                dut,
            });
        }
    }

    pub fn set_dut_checked(&mut self, no: u32, checked: bool) -> Result<()> {
        let dut = self.duts.set_checked(no, checked)?;
        self.emit(ChannelEvent::DutChanged {
            channel: self.ordinal,
            dut,
        });
        Ok(())
    }

    pub fn select_all(&mut self) {
        let changed = self.duts.select_all();
        self.publish_all(changed);
    }

    pub fn reverse_selection(&mut self) {
        let changed = self.duts.reverse_selection();
        self.publish_all(changed);
    }

    pub fn reset_duts(&mut self) {
        let changed = self.duts.reset();
        self.publish_all(changed);
    }

    async fn open(&mut self) -> Result<()> {
        self.device.open().await?;
        self.probe.establish_connection().await
    }

    async fn release(&mut self) {
        if let Err(e) = self.probe.close().await {
            tracing::warn!(channel = self.ordinal, "Failed to close probe: {}", e);
        }
        if let Err(e) = self.device.close().await {
            tracing::warn!(channel = self.ordinal, "Failed to close device port: {}", e);
        }
    }
}

/// Run one function body on a context and describe how it ended
async fn execute(ctx: &mut ChannelContext, name: &str, function: &dyn ChannelFunction) -> Completion {
    let started = Instant::now();
    let channel = ctx.ordinal();
    ctx.emit(ChannelEvent::SequenceStarted {
        channel,
        function: name.to_string(),
    });

    let outcome = match function.run(ctx).await {
        Ok(()) => Outcome::Passed,
        Err(e) if e.is_device_lost() => Outcome::Lost(e.to_string()),
        Err(e) => Outcome::Failed(e.to_string()),
    };

    ctx.emit(ChannelEvent::SequenceFinished {
        channel,
        function: name.to_string(),
        outcome: outcome.clone(),
    });
    Completion::new(channel, name, outcome, started.elapsed())
}

/// Where a channel's completion will come from
pub enum InvocationHandle {
    /// Already finished (inline execution)
    Ready(Completion),
    /// Running on the channel worker
    Pending {
        channel: u8,
        function: String,
        started: Instant,
        receiver: oneshot::Receiver<Completion>,
    },
}

impl InvocationHandle {
    pub fn channel(&self) -> u8 {
        match self {
            InvocationHandle::Ready(c) => c.channel,
            InvocationHandle::Pending { channel, .. } => *channel,
        }
    }

    /// Future resolving to the completion; a worker that dies first yields `Lost`
    pub fn completion(self) -> BoxFuture<'static, Completion> {
        match self {
            InvocationHandle::Ready(c) => Box::pin(futures_util::future::ready(c)),
            InvocationHandle::Pending {
                channel,
                function,
                started,
                receiver,
            } => Box::pin(async move {
                receiver.await.unwrap_or_else(|_| {
                    Completion::new(
                        channel,
                        &function,
                        Outcome::Lost("channel worker stopped before reporting".to_string()),
                        started.elapsed(),
                    )
                })
            }),
        }
    }
}

enum Executor {
    Worker(Worker),
    Inline(Box<ChannelContext>),
}

/// Coordinator-side handle of a channel
pub struct Channel {
    ordinal: u8,
    port: String,
    probe_serial: String,
    duts: Vec<u32>,
    state: ChannelState,
    executor: Executor,
}

impl Channel {
    /// Create the channel, starting its worker when `multithread` is set
    pub fn new(config: &ChannelConfig, ctx: ChannelContext, multithread: bool) -> Result<Self> {
        let executor = if multithread {
            Executor::Worker(Worker::spawn(ctx)?)
        } else {
            Executor::Inline(Box::new(ctx))
        };

        Ok(Self {
            ordinal: config.ordinal,
            port: config.port.clone(),
            probe_serial: config.probe_serial.clone(),
            duts: config.duts.clone(),
            state: ChannelState::Idle,
            executor,
        })
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn probe_serial(&self) -> &str {
        &self.probe_serial
    }

    /// DUT numbers carried by this channel
    pub fn duts(&self) -> &[u32] {
        &self.duts
    }

    pub fn owns_dut(&self, no: u32) -> bool {
        self.duts.contains(&no)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ChannelState::Active
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self.executor, Executor::Worker(_))
    }

    /// Acquire the probe and serial handles
    #[tracing::instrument(skip(self), fields(channel = self.ordinal, port = %self.port))]
    pub async fn open(&mut self) -> Result<()> {
        self.state = ChannelState::Connecting;
        let ordinal = self.ordinal;

        let opened = self.run(|ctx| Box::pin(ctx.open())).await.and_then(|r| r);
        match opened {
            Ok(()) => {
                self.state = ChannelState::Active;
                tracing::info!("Channel open");
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Disconnected;
                Err(match e {
                    Error::Connection { .. } => e,
                    other => Error::connection(ordinal, other.to_string()),
                })
            }
        }
    }

    /// Run a job against the channel context and wait for its result
    ///
    /// On a worker the job is queued behind any outstanding invocation.
    pub async fn run<R, F>(&mut self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut ChannelContext) -> BoxFuture<'a, R> + Send + 'static,
    {
        match &mut self.executor {
            Executor::Inline(ctx) => Ok(f(ctx.as_mut()).await),
            Executor::Worker(worker) => {
                let (tx, rx) = oneshot::channel();
                worker.submit(job(move |ctx| {
                    Box::pin(async move {
                        let out = f(ctx).await;
                        let _ = tx.send(out);
                    })
                }))?;
                rx.await.map_err(|_| Error::WorkerStopped(self.ordinal))
            }
        }
    }

    /// Start one function on this channel
    ///
    /// Returns as soon as the work is queued on the worker; inline channels
    /// finish the work first and hand back a ready completion.
    pub async fn invoke(
        &mut self,
        name: &str,
        function: Arc<dyn ChannelFunction>,
    ) -> Result<InvocationHandle> {
        match self.state {
            ChannelState::Active => {}
            ChannelState::Busy => return Err(Error::ChannelBusy(self.ordinal)),
            other => {
                return Err(Error::invalid_transition(
                    &format!("invoke '{}' on channel {}", name, self.ordinal),
                    other,
                ))
            }
        }
        self.state = ChannelState::Busy;

        match &mut self.executor {
            Executor::Inline(ctx) => {
                let completion = execute(ctx.as_mut(), name, function.as_ref()).await;
                Ok(InvocationHandle::Ready(completion))
            }
            Executor::Worker(worker) => {
                let (tx, rx) = oneshot::channel();
                let function_name = name.to_string();
                let submitted = worker.submit(job(move |ctx| {
                    Box::pin(async move {
                        let completion = execute(ctx, &function_name, function.as_ref()).await;
                        let _ = tx.send(completion);
                    })
                }));
                if let Err(e) = submitted {
                    self.state = ChannelState::Disconnected;
                    return Err(e);
                }

                Ok(InvocationHandle::Pending {
                    channel: self.ordinal,
                    function: name.to_string(),
                    started: Instant::now(),
                    receiver: rx,
                })
            }
        }
    }

    /// Apply a completion to the channel state
    pub fn complete(&mut self, completion: &Completion) {
        if completion.outcome.disconnects() {
            tracing::warn!(
                channel = self.ordinal,
                "Channel disconnected: {}",
                completion.outcome
            );
            self.state = ChannelState::Disconnected;
        } else if self.state == ChannelState::Busy {
            self.state = ChannelState::Active;
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ChannelState::Disconnected;
    }

    /// Stop the worker and release the hardware
    pub async fn shutdown(self) {
        match self.executor {
            Executor::Worker(worker) => worker.stop().await,
            Executor::Inline(mut ctx) => ctx.release().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{SimChannelConfig, SimulationConfig};
    use crate::hw::sim::SimulatedProvider;
    use crate::hw::HardwareProvider;

    struct Noop;

    #[async_trait]
    impl ChannelFunction for Noop {
        async fn run(&self, _ctx: &mut ChannelContext) -> Result<()> {
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ChannelFunction for Broken {
        async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
            Err(Error::hardware(ctx.ordinal(), "no response"))
        }
    }

    fn make_channel(
        ordinal: u8,
        multithread: bool,
        faults: Vec<SimChannelConfig>,
    ) -> (Channel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let config = ChannelConfig {
            ordinal,
            enabled: true,
            probe_serial: String::new(),
            port: format!("sim{}", ordinal),
            duts: vec![1, 2],
        };
        let provider = SimulatedProvider::new(SimulationConfig {
            response_delay_ms: 0,
            channels: faults,
            ..Default::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ChannelContext::new(
            &config,
            provider.build(&config).unwrap(),
            Arc::new(ProvisioningConfig::default()),
            Arc::new(tokio::sync::Mutex::new(())),
            tx,
        );
        (Channel::new(&config, ctx, multithread).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_inline_invoke_is_ready() {
        let (mut channel, mut events) = make_channel(1, false, Vec::new());
        channel.open().await.unwrap();
        assert!(channel.is_active());

        let handle = channel.invoke("noop", Arc::new(Noop)).await.unwrap();
        assert!(matches!(handle, InvocationHandle::Ready(_)));
        assert_eq!(channel.state(), ChannelState::Busy);

        let completion = handle.completion().await;
        channel.complete(&completion);
        assert_eq!(completion.outcome, Outcome::Passed);
        assert!(channel.is_active());

        assert!(matches!(
            events.try_recv(),
            Ok(ChannelEvent::SequenceStarted { channel: 1, .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(ChannelEvent::SequenceFinished { channel: 1, .. })
        ));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_invoke_and_busy_rejection() {
        let (mut channel, _events) = make_channel(2, true, Vec::new());
        assert!(channel.is_threaded());
        channel.open().await.unwrap();

        let handle = channel.invoke("broken", Arc::new(Broken)).await.unwrap();
        assert!(matches!(
            channel.invoke("noop", Arc::new(Noop)).await,
            Err(Error::ChannelBusy(2))
        ));

        let completion = handle.completion().await;
        assert!(matches!(completion.outcome, Outcome::Failed(_)));
        channel.complete(&completion);
        assert!(channel.is_active());
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_open_disconnects() {
        let faults = vec![SimChannelConfig {
            ordinal: 3,
            fail_open: true,
            ..Default::default()
        }];
        let (mut channel, _events) = make_channel(3, true, faults);

        let err = channel.open().await.unwrap_err();
        assert!(matches!(err, Error::Connection { channel: 3, .. }));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.invoke("noop", Arc::new(Noop)).await.is_err());
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_selection_jobs_raise_dut_changed() {
        let (mut channel, mut events) = make_channel(1, true, Vec::new());
        channel.open().await.unwrap();

        channel
            .run(|ctx| Box::pin(async move { ctx.set_dut_checked(2, false) }))
            .await
            .unwrap()
            .unwrap();

        match events.try_recv() {
            Ok(ChannelEvent::DutChanged { dut, .. }) => {
                assert_eq!(dut.no, 2);
                assert!(!dut.checked);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        channel.shutdown().await;
    }
}
