//! Session coordinator
//!
//! Owns the dispatcher and the session aggregate. Every state transition
//! happens here, on one task; channel workers only talk back through the
//! event queue and their completion handles.

pub mod controls;
pub mod handle;
pub mod session;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::channel::{
    Channel, ChannelContext, ChannelEvent, ChannelState, Completion, DutRecord, SharedResource,
};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::dispatch::{BarrierProbe, DispatchReport, Dispatcher, FunctionInfo, FunctionRegistry};
use crate::hw::HardwareProvider;
use crate::methods::MethodLibrary;
use crate::store::{Checkpoint, RecordStore};

pub use controls::{Control, Controls};
pub use handle::CoordinatorHandle;
pub use session::{CoordinatorState, Session, SessionInfo, SessionRequest, SessionSummary};

/// How long a disconnected channel gets to reopen at session start
const REOPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel line of the status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub ordinal: u8,
    pub state: ChannelState,
    pub port: String,
    pub probe_serial: String,
    pub duts: Vec<u32>,
}

/// Everything the operator surface shows, republished on every change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: CoordinatorState,
    pub busy: bool,
    pub controls: Controls,
    pub barrier_armed: bool,
    pub outstanding: usize,
    pub multithread: bool,
    pub method: Option<String>,
    pub functions: Vec<FunctionInfo>,
    pub methods: Vec<String>,
    pub channels: Vec<ChannelStatus>,
    pub session: Option<SessionSummary>,
    pub duts: Vec<DutRecord>,
}

/// One dispatch and every completion it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub dispatch: DispatchReport,
    pub completions: Vec<Completion>,
}

impl StepReport {
    /// Channels that did not pass this step
    pub fn failed_channels(&self) -> Vec<u8> {
        self.completions
            .iter()
            .filter(|c| !c.outcome.is_passed())
            .map(|c| c.channel)
            .collect()
    }
}

/// Result of a full test cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u32,
    pub steps: Vec<StepReport>,
    /// DUTs recorded in the session after the cycle
    pub records: usize,
    pub passed: usize,
    /// Records still waiting for the store
    pub unsaved: usize,
}

enum Step {
    Event(ChannelEvent),
    Completion(Completion),
    Drained,
}

pub struct Coordinator {
    config: Arc<Config>,
    state: CoordinatorState,
    busy: bool,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    methods: MethodLibrary,
    store: Arc<dyn RecordStore>,
    session: Option<Session>,
    /// Latest record of every DUT, as published by the channels
    duts: BTreeMap<u32, DutRecord>,
    status: watch::Sender<StatusSnapshot>,
}

impl Coordinator {
    /// Build a channel for every enabled slot; slots whose hardware cannot be
    /// created are logged and left out
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn HardwareProvider>,
        methods: MethodLibrary,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let shared: SharedResource = Arc::new(tokio::sync::Mutex::new(()));
        let provisioning = Arc::new(config.provisioning.clone());
        let (events_tx, events) = mpsc::unbounded_channel();

        let mut channels = Vec::new();
        for slot in config.enabled_channels() {
            let hardware = match provider.build(slot) {
                Ok(hardware) => hardware,
                Err(e) => {
                    tracing::error!(channel = slot.ordinal, "Cannot create channel hardware: {}", e);
                    continue;
                }
            };
            let ctx = ChannelContext::new(
                slot,
                hardware,
                provisioning.clone(),
                shared.clone(),
                events_tx.clone(),
            );
            match Channel::new(slot, ctx, config.multithread) {
                Ok(channel) => channels.push(channel),
                Err(e) => tracing::error!(channel = slot.ordinal, "Cannot start channel: {}", e),
            }
        }

        let barrier_timeout = config.timing.barrier_timeout_secs.map(Duration::from_secs);
        let invoke_stagger = Duration::from_millis(config.timing.invoke_stagger_ms);
        let dispatcher = Dispatcher::new(channels, shared, barrier_timeout, invoke_stagger);

        let duts = initial_duts(dispatcher.channels());
        let (status, _) = watch::channel(StatusSnapshot {
            state: CoordinatorState::Idle,
            busy: false,
            controls: Controls::for_state(CoordinatorState::Idle, false),
            barrier_armed: false,
            outstanding: 0,
            multithread: config.multithread,
            method: None,
            functions: Vec::new(),
            methods: methods.names(),
            channels: Vec::new(),
            session: None,
            duts: Vec::new(),
        });

        let coordinator = Self {
            config,
            state: CoordinatorState::Idle,
            busy: false,
            dispatcher,
            events,
            methods,
            store,
            session: None,
            duts,
            status,
        };
        coordinator.publish();
        coordinator
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn barrier_probe(&self) -> Arc<BarrierProbe> {
        self.dispatcher.barrier_probe()
    }

    /// Receiver of the status snapshot, updated on every change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn dut(&self, no: u32) -> Option<&DutRecord> {
        self.duts.get(&no)
    }

    /// Open every channel, staggered; failures only affect their own channel
    #[tracing::instrument(skip(self))]
    pub async fn open_channels(&mut self) -> usize {
        let stagger = Duration::from_millis(self.config.timing.open_stagger_ms);
        for (i, channel) in self.dispatcher.channels_mut().iter_mut().enumerate() {
            if i > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            if let Err(e) = channel.open().await {
                tracing::error!(channel = channel.ordinal(), "{}", e);
            }
        }

        let active = self.dispatcher.active_channels();
        tracing::info!(channels = ?active, "Channels opened");
        self.publish();
        active.len()
    }

    /// Idle -> SessionActive; reconnects probes and detects DUTs
    #[tracing::instrument(skip(self, request), fields(operator = %request.operator, batch = %request.batch_number))]
    pub async fn start_new_session(&mut self, request: SessionRequest) -> Result<SessionSummary> {
        if self.state != CoordinatorState::Idle {
            return Err(Error::invalid_transition("start a new session", self.state));
        }
        let request = request.validated()?;

        self.set_busy(true);
        let started = self.open_session(request).await;
        self.set_busy(false);

        match started {
            Ok(summary) => Ok(summary),
            Err(e) => {
                tracing::warn!("Session not started: {}", e);
                self.session = None;
                if let Err(e) = self.dispatcher.set_registry(FunctionRegistry::empty()) {
                    tracing::warn!("Cannot clear function registry: {}", e);
                }
                self.state = CoordinatorState::Idle;
                self.publish();
                Err(e)
            }
        }
    }

    async fn open_session(&mut self, request: SessionRequest) -> Result<SessionSummary> {
        self.reconnect_probes().await;

        let method = if self.methods.contains(&self.config.cycle.default_method) {
            self.config.cycle.default_method.clone()
        } else {
            self.methods
                .first()
                .map(str::to_string)
                .ok_or_else(|| Error::MethodNotFound(self.config.cycle.default_method.clone()))?
        };

        self.session = Some(Session::new(request));
        self.state = CoordinatorState::SessionActive;
        self.apply_method(&method)?;
        tracing::info!(method = %method, "Session started");

        let detect = self.config.cycle.detect_function.clone();
        if self.dispatcher.registry().resolve(&detect).is_ok() {
            self.step(&detect).await?;
        } else {
            tracing::warn!(function = %detect, "Method has no detection function");
        }

        self.publish();
        self.session
            .as_ref()
            .map(Session::summary)
            .ok_or_else(|| Error::Internal("session vanished while starting".to_string()))
    }

    /// Re-establish the probe connection of every active channel
    async fn reconnect_probes(&mut self) {
        let stagger = Duration::from_millis(self.config.timing.open_stagger_ms);
        let mut first = true;
        for channel in self.dispatcher.channels_mut() {
            if channel.state() == ChannelState::Busy {
                continue;
            }
            if !first && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            first = false;

            let ordinal = channel.ordinal();
            if !channel.is_active() {
                // A worker still stuck in an earlier invocation never gets to the open
                match tokio::time::timeout(REOPEN_TIMEOUT, channel.open()).await {
                    Ok(Ok(())) => tracing::info!(channel = ordinal, "Channel reopened"),
                    Ok(Err(e)) => tracing::warn!(channel = ordinal, "Channel still unavailable: {}", e),
                    Err(_) => {
                        tracing::warn!(channel = ordinal, "Channel did not answer the reopen");
                        channel.mark_disconnected();
                    }
                }
                continue;
            }

            let reconnected = channel
                .run(|ctx| Box::pin(ctx.probe.establish_connection()))
                .await
                .and_then(|r| r);
            if let Err(e) = reconnected {
                tracing::error!(channel = ordinal, "Probe reconnect failed: {}", e);
                channel.mark_disconnected();
            }
        }
    }

    /// Swap the function registry for the one of `name`
    pub fn select_method(&mut self, name: &str) -> Result<Vec<FunctionInfo>> {
        if self.state != CoordinatorState::SessionActive {
            return Err(Error::invalid_transition("select a method", self.state));
        }
        self.apply_method(name)?;
        self.publish();
        Ok(self.dispatcher.registry().describe())
    }

    fn apply_method(&mut self, name: &str) -> Result<()> {
        let registry = self.methods.build(name)?;
        self.dispatcher.set_registry(registry)?;
        if let Some(session) = self.session.as_mut() {
            session.method = name.to_string();
        }
        tracing::debug!(method = name, "Method selected");
        Ok(())
    }

    /// Run one function of the current method
    #[tracing::instrument(skip(self))]
    pub async fn run_function(&mut self, name: &str) -> Result<StepReport> {
        if self.state != CoordinatorState::SessionActive {
            return Err(Error::invalid_transition(&format!("run '{}'", name), self.state));
        }
        self.dispatcher.registry().classify(name)?;

        self.enter(CoordinatorState::Testing);
        let report = self.step(name).await;
        self.enter(CoordinatorState::SessionActive);
        report
    }

    /// Detect, provision, settle and test every active channel
    #[tracing::instrument(skip(self))]
    pub async fn start_full_cycle(&mut self) -> Result<CycleReport> {
        if self.state != CoordinatorState::SessionActive {
            return Err(Error::invalid_transition("start a full cycle", self.state));
        }

        self.enter(CoordinatorState::Testing);
        let cycle = self.run_cycle().await;
        self.enter(CoordinatorState::SessionActive);

        if let Err(e) = &cycle {
            tracing::error!("Full cycle aborted: {}", e);
        }
        cycle
    }

    async fn run_cycle(&mut self) -> Result<CycleReport> {
        let cycle = self.config.cycle.clone();
        let settle = Duration::from_millis(self.config.timing.provision_settle_ms);
        let mut steps = Vec::with_capacity(3);

        steps.push(self.step(&cycle.detect_function).await?);
        steps.push(self.step(&cycle.provision_function).await?);
        self.settle_for(settle).await;
        self.persist(Checkpoint::Midpoint).await;

        steps.push(self.step(&cycle.test_function).await?);
        self.session
            .as_mut()
            .ok_or_else(|| Error::Internal("full cycle without a session".to_string()))?
            .cycles += 1;
        self.persist(Checkpoint::CycleComplete).await;

        let summary = self
            .session
            .as_ref()
            .map(Session::summary)
            .ok_or_else(|| Error::Internal("full cycle without a session".to_string()))?;
        tracing::info!(
            cycle = summary.cycles,
            records = summary.records,
            passed = summary.passed,
            "Full cycle finished"
        );

        Ok(CycleReport {
            cycle: summary.cycles,
            steps,
            records: summary.records,
            passed: summary.passed,
            unsaved: summary.unsaved,
        })
    }

    /// Dispatch one function and wait for the barrier it armed
    async fn step(&mut self, name: &str) -> Result<StepReport> {
        let info = self
            .session
            .as_ref()
            .map(Session::info)
            .unwrap_or_default();

        let dispatch = self.dispatcher.dispatch(name, &info).await?;
        let mut completions = dispatch.settled.clone();
        self.publish();
        completions.extend(self.wait_barrier().await);
        self.drain_events();

        let report = StepReport {
            dispatch,
            completions,
        };
        let failed = report.failed_channels();
        if !failed.is_empty() {
            tracing::warn!(function = name, channels = ?failed, "Function did not pass on every channel");
        }
        Ok(report)
    }

    /// Service channel events until the barrier drains
    ///
    /// Returns at once when nothing is armed.
    pub async fn wait_barrier(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();
        if !self.dispatcher.is_armed() {
            return completions;
        }

        loop {
            let step = tokio::select! {
                biased;
                Some(event) = self.events.recv() => Step::Event(event),
                completion = self.dispatcher.next_completion() => match completion {
                    Some(c) => Step::Completion(c),
                    None => Step::Drained,
                },
            };

            match step {
                Step::Event(event) => self.handle_event(event),
                Step::Completion(completion) => {
                    tracing::debug!(
                        channel = completion.channel,
                        function = %completion.function,
                        outcome = %completion.outcome,
                        "Channel reported"
                    );
                    completions.push(completion);
                }
                Step::Drained => break,
            }
            self.publish();
        }
        completions
    }

    /// Sleep while still taking in channel events
    async fn settle_for(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    self.publish();
                }
            }
        }
    }

    fn drain_events(&mut self) {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            changed = true;
        }
        if changed {
            self.publish();
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::DutChanged { dut, .. } => {
                self.duts.insert(dut.no, dut);
            }
            ChannelEvent::DutFullyTested { channel, dut } => {
                tracing::debug!(channel, dut = dut.no, outcome = %dut.outcome, "DUT result published");
                if let Some(session) = self.session.as_mut() {
                    session.record(dut.clone());
                }
                self.duts.insert(dut.no, dut);
            }
            ChannelEvent::SequenceStarted { channel, function } => {
                tracing::debug!(channel, function = %function, "Sequence started");
            }
            ChannelEvent::SequenceFinished {
                channel,
                function,
                outcome,
            } => {
                tracing::debug!(channel, function = %function, %outcome, "Sequence finished");
            }
        }
    }

    /// SessionActive -> Idle; a no-op when no session is open
    #[tracing::instrument(skip(self))]
    pub async fn finish_session(&mut self) -> Result<Option<SessionSummary>> {
        match self.state {
            CoordinatorState::Idle => return Ok(None),
            CoordinatorState::Testing => {
                return Err(Error::invalid_transition("finish the session", self.state))
            }
            CoordinatorState::SessionActive => {}
        }

        self.set_busy(true);
        self.persist(Checkpoint::SessionEnd).await;

        for channel in self.dispatcher.channels_mut() {
            if !channel.is_active() {
                continue;
            }
            let ordinal = channel.ordinal();
            if let Err(e) = channel
                .run(|ctx| Box::pin(async move { ctx.reset_duts() }))
                .await
            {
                tracing::warn!(channel = ordinal, "Cannot reset DUTs: {}", e);
            }
        }
        self.drain_events();

        let summary = self.session.take().map(|s| s.summary());
        self.dispatcher.set_registry(FunctionRegistry::empty())?;
        self.duts = initial_duts(self.dispatcher.channels());
        self.state = CoordinatorState::Idle;
        self.set_busy(false);

        if let Some(summary) = &summary {
            tracing::info!(
                session = %summary.id,
                cycles = summary.cycles,
                records = summary.records,
                unsaved = summary.unsaved,
                "Session finished"
            );
        }
        Ok(summary)
    }

    /// Check or uncheck one DUT on the channel that owns it
    pub async fn set_dut_checked(&mut self, no: u32, checked: bool) -> Result<()> {
        self.require_selection("change DUT selection")?;
        let channel = self
            .dispatcher
            .channel_for_dut(no)
            .ok_or(Error::DutNotFound(no))?;
        if channel.state() == ChannelState::Disconnected {
            return Err(Error::connection(channel.ordinal(), "channel is disconnected"));
        }
        channel
            .run(move |ctx| Box::pin(async move { ctx.set_dut_checked(no, checked) }))
            .await??;
        self.drain_events();
        Ok(())
    }

    pub async fn select_all(&mut self) -> Result<()> {
        self.require_selection("select all DUTs")?;
        for channel in self.dispatcher.channels_mut() {
            if channel.state() == ChannelState::Disconnected {
                continue;
            }
            channel
                .run(|ctx| Box::pin(async move { ctx.select_all() }))
                .await?;
        }
        self.drain_events();
        Ok(())
    }

    pub async fn reverse_selection(&mut self) -> Result<()> {
        self.require_selection("reverse DUT selection")?;
        for channel in self.dispatcher.channels_mut() {
            if channel.state() == ChannelState::Disconnected {
                continue;
            }
            channel
                .run(|ctx| Box::pin(async move { ctx.reverse_selection() }))
                .await?;
        }
        self.drain_events();
        Ok(())
    }

    fn require_selection(&self, action: &str) -> Result<()> {
        if self.state != CoordinatorState::SessionActive || self.busy {
            return Err(Error::invalid_transition(action, self.state));
        }
        Ok(())
    }

    /// Write unsaved records; a failed write keeps them for the next checkpoint
    async fn persist(&mut self, checkpoint: Checkpoint) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.unsaved_count() == 0 {
            return;
        }

        let written: Vec<DutRecord> = session.unsaved_records().into_iter().cloned().collect();
        match self.store.write_device_records(session, checkpoint).await {
            Ok(count) => {
                tracing::info!(%checkpoint, count, "DUT records persisted");
                if let Some(session) = self.session.as_mut() {
                    session.mark_saved(&written);
                }
            }
            Err(e) => {
                tracing::error!(
                    %checkpoint,
                    unsaved = written.len(),
                    "Cannot persist DUT records, keeping them for the next checkpoint: {}",
                    e
                );
            }
        }
        self.publish();
    }

    pub fn status(&self) -> StatusSnapshot {
        let probe = self.dispatcher.barrier_probe();
        let registry = self.dispatcher.registry();
        let method = self.session.as_ref().map(|_| registry.method().to_string());

        StatusSnapshot {
            state: self.state,
            busy: self.busy,
            controls: Controls::for_state(self.state, self.busy),
            barrier_armed: probe.is_armed(),
            outstanding: probe.outstanding(),
            multithread: self.config.multithread,
            method,
            functions: registry.describe(),
            methods: self.methods.names(),
            channels: self
                .dispatcher
                .channels()
                .iter()
                .map(|c| ChannelStatus {
                    ordinal: c.ordinal(),
                    state: c.state(),
                    port: c.port().to_string(),
                    probe_serial: c.probe_serial().to_string(),
                    duts: c.duts().to_vec(),
                })
                .collect(),
            session: self.session.as_ref().map(Session::summary),
            duts: self.duts.values().cloned().collect(),
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.status());
    }

    fn enter(&mut self, state: CoordinatorState) {
        tracing::debug!(from = %self.state, to = %state, "Coordinator state");
        self.state = state;
        self.publish();
    }

    fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
        self.publish();
    }

    /// Persist what is left and stop every channel
    pub async fn shutdown(mut self) {
        self.persist(Checkpoint::Shutdown).await;
        self.dispatcher.shutdown().await;
        tracing::info!("Coordinator stopped");
    }
}

fn initial_duts(channels: &[Channel]) -> BTreeMap<u32, DutRecord> {
    channels
        .iter()
        .flat_map(|c| {
            c.duts()
                .iter()
                .enumerate()
                .map(|(i, no)| (*no, DutRecord::new(c.ordinal(), (i + 1) as u8, *no)))
                .collect::<Vec<_>>()
        })
        .collect()
}
