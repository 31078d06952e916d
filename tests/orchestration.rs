//! Coordinator scenarios against the simulated fixture
//!
//! Each test builds a coordinator from a TOML configuration with the
//! simulated backend and drives it through sessions and cycles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fixture::channel::{ChannelContext, ChannelFunction, ChannelState, DutOutcome, Outcome};
use fixture::common::config::{ChannelConfig, Config};
use fixture::coordinator::{
    Control, Coordinator, CoordinatorHandle, CoordinatorState, SessionRequest,
};
use fixture::dispatch::{FixtureContext, FunctionRegistry, SequentialFunction};
use fixture::hw;
use fixture::hw::sim::SimulatedProvider;
use fixture::hw::{ChannelHardware, DeviceClient, HardwareProvider};
use fixture::methods::general::DetectDuts;
use fixture::methods::{MethodLibrary, OLC_ZHAGA_STD};
use fixture::store::{Checkpoint, MemoryRecordStore};
use fixture::Error;

/// Counts its runs and remembers which channels were idle when it started
#[derive(Clone, Default)]
struct Provision {
    runs: Arc<AtomicUsize>,
    active_at_start: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl SequentialFunction for Provision {
    async fn run(&self, fixture: &mut FixtureContext<'_>) -> fixture::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.active_at_start
            .lock()
            .unwrap()
            .push(fixture.active_channels());
        Ok(())
    }
}

/// Passes every selected DUT, optionally after a delay
struct PassAll {
    delay: Duration,
}

#[async_trait]
impl ChannelFunction for PassAll {
    async fn run(&self, ctx: &mut ChannelContext) -> fixture::Result<()> {
        tokio::time::sleep(self.delay).await;
        for position in ctx.duts.selected_positions() {
            if let Some(dut) = ctx.duts.at_mut(position) {
                dut.outcome = DutOutcome::Passed;
            }
            ctx.publish_fully_tested(position);
        }
        Ok(())
    }
}

fn bench_methods(provision: Provision, test_delay: Duration) -> MethodLibrary {
    MethodLibrary::new().with_method("Bench", move |name| {
        let mut registry = FunctionRegistry::new(name);
        registry.parallel("detect", DetectDuts)?;
        registry.sequential("provision", provision.clone())?;
        registry.parallel("test", PassAll { delay: test_delay })?;
        Ok(registry)
    })
}

const BENCH_CYCLE: &str = r#"
[cycle]
default_method = "Bench"
detect_function = "detect"
provision_function = "provision"
test_function = "test"
"#;

fn config(body: &str) -> Arc<Config> {
    build_config("", "", body)
}

fn config_with_timing(body: &str, timing: &str) -> Arc<Config> {
    build_config("", timing, body)
}

/// Zero delays everywhere; `top` holds root keys, which must precede any table
fn build_config(top: &str, timing: &str, body: &str) -> Arc<Config> {
    let text = format!(
        r#"
{}
[timing]
open_stagger_ms = 0
invoke_stagger_ms = 0
provision_settle_ms = 0
{}

[provisioning]
power_settle_ms = 0

[simulation]
response_delay_ms = 1

{}
"#,
        top, timing, body
    );
    Arc::new(Config::parse(&text).unwrap())
}

async fn coordinator(
    config: Arc<Config>,
    methods: MethodLibrary,
    store: Arc<MemoryRecordStore>,
) -> Coordinator {
    let provider = hw::provider(&config);
    let mut coordinator = Coordinator::new(config, provider, methods, store);
    coordinator.open_channels().await;
    coordinator
}

/// Carrier faults layered over the simulated backend
#[derive(Clone, Default)]
struct Faults {
    /// Channel and position whose power relay never closes
    stuck_relay: Option<(u8, u8)>,
    /// Channel whose carrier answers nothing while the flag is set
    unplugged: Option<(u8, Arc<AtomicBool>)>,
    /// Every successful power on, as (channel, position)
    powered: Arc<Mutex<Vec<(u8, u8)>>>,
}

struct FaultyProvider {
    inner: SimulatedProvider,
    faults: Faults,
}

impl HardwareProvider for FaultyProvider {
    fn build(&self, channel: &ChannelConfig) -> fixture::Result<ChannelHardware> {
        let hardware = self.inner.build(channel)?;
        Ok(ChannelHardware {
            probe: hardware.probe,
            device: Box::new(FaultyDevice {
                channel: channel.ordinal,
                inner: hardware.device,
                faults: self.faults.clone(),
            }),
        })
    }
}

struct FaultyDevice {
    channel: u8,
    inner: Box<dyn DeviceClient>,
    faults: Faults,
}

impl FaultyDevice {
    fn reachable(&self) -> fixture::Result<()> {
        match &self.faults.unplugged {
            Some((channel, flag)) if *channel == self.channel && flag.load(Ordering::SeqCst) => {
                Err(Error::DeviceLost {
                    channel: self.channel,
                    reason: "carrier unplugged".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceClient for FaultyDevice {
    fn port(&self) -> &str {
        self.inner.port()
    }

    async fn open(&mut self) -> fixture::Result<()> {
        self.inner.open().await
    }

    async fn close(&mut self) -> fixture::Result<()> {
        self.inner.close().await
    }

    async fn check_devices_present(&mut self) -> fixture::Result<Vec<u8>> {
        self.reachable()?;
        self.inner.check_devices_present().await
    }

    async fn power_on(&mut self, position: u8) -> fixture::Result<()> {
        self.reachable()?;
        if self.faults.stuck_relay == Some((self.channel, position)) {
            return Err(Error::hardware(self.channel, "relay did not close"));
        }
        self.inner.power_on(position).await?;
        self.faults
            .powered
            .lock()
            .unwrap()
            .push((self.channel, position));
        Ok(())
    }

    async fn power_off(&mut self, position: u8) -> fixture::Result<()> {
        self.reachable()?;
        self.inner.power_off(position).await
    }

    async fn switch_swd(&mut self, position: u8) -> fixture::Result<()> {
        self.reachable()?;
        self.inner.switch_swd(position).await
    }

    async fn query(&mut self, position: u8, command: &str) -> fixture::Result<Vec<String>> {
        self.reachable()?;
        self.inner.query(position, command).await
    }
}

async fn faulty_coordinator(
    config: Arc<Config>,
    methods: MethodLibrary,
    store: Arc<MemoryRecordStore>,
    faults: Faults,
) -> Coordinator {
    let provider = Arc::new(FaultyProvider {
        inner: SimulatedProvider::new(config.simulation.clone()),
        faults,
    });
    let mut coordinator = Coordinator::new(config, provider, methods, store);
    coordinator.open_channels().await;
    coordinator
}

fn request() -> SessionRequest {
    SessionRequest {
        operator: "Jane".to_string(),
        batch_number: "B-17".to_string(),
        batch_info: String::new(),
    }
}

#[tokio::test]
async fn test_failed_channel_excluded_and_provision_runs_once() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1, 2]

[[channels]]
ordinal = 2
duts = [3, 4]

[[channels]]
ordinal = 3
duts = [5, 6]

[[simulation.channels]]
ordinal = 2
fail_open = true
"#,
        BENCH_CYCLE
    ));
    let provision = Provision::default();
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(
        config,
        bench_methods(provision.clone(), Duration::ZERO),
        store.clone(),
    )
    .await;

    let channels = coordinator.status().channels;
    assert_eq!(channels[1].state, ChannelState::Disconnected);

    coordinator.start_new_session(request()).await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::SessionActive);

    let report = coordinator.start_full_cycle().await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::SessionActive);
    assert!(!coordinator.barrier_probe().is_armed());

    let detect = &report.steps[0];
    assert_eq!(detect.dispatch.addressed, vec![1, 3]);
    assert_eq!(detect.completions.len(), 2);
    assert!(detect.completions.iter().all(|c| c.outcome == Outcome::Passed));

    // Provision saw both channels back from detection, and ran once
    assert_eq!(provision.runs.load(Ordering::SeqCst), 1);
    assert_eq!(*provision.active_at_start.lock().unwrap(), vec![vec![1, 3]]);
    assert_eq!(report.steps[1].dispatch.outcome, Some(Outcome::Passed));

    let session = coordinator.session().unwrap();
    let mut numbers: Vec<u32> = session.records().map(|d| d.no).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2, 5, 6]);
    assert_eq!(session.cycles, 1);
    assert_eq!(session.unsaved_count(), 0);

    let written = store.written().await;
    assert!(written.iter().all(|(_, checkpoint)| *checkpoint == Checkpoint::CycleComplete));
    assert_eq!(written.len(), 4);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_single_channel_without_threads_settles_inside_dispatch() {
    let config = build_config(
        "multithread = false",
        "",
        &format!(
            r#"
{}
[[channels]]
ordinal = 1
duts = [1, 2, 3]
"#,
            BENCH_CYCLE
        ),
    );
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::ZERO),
        store,
    )
    .await;
    assert!(!coordinator.dispatcher().channels()[0].is_threaded());

    coordinator.start_new_session(request()).await.unwrap();
    let report = coordinator.run_function("detect").await.unwrap();

    assert_eq!(report.dispatch.settled.len(), 1);
    assert_eq!(report.completions.len(), 1);
    assert!(!coordinator.barrier_probe().is_armed());
    assert!(coordinator.wait_barrier().await.is_empty());
    assert!(coordinator.dut(3).unwrap().available);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_builtin_full_cycle_records_union_without_duplicates() {
    let config = config(
        r#"
[[channels]]
ordinal = 1
duts = [1, 2]

[[channels]]
ordinal = 2
duts = [3, 4]

[[simulation.channels]]
ordinal = 2
failing_checks = ["testDali"]
"#,
    );
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(config, MethodLibrary::builtin(), store.clone()).await;

    let summary = coordinator.start_new_session(request()).await.unwrap();
    assert_eq!(summary.method, OLC_ZHAGA_STD);

    coordinator.start_full_cycle().await.unwrap();
    let report = coordinator.start_full_cycle().await.unwrap();
    assert_eq!(report.cycle, 2);
    assert_eq!(report.records, 4);

    let session = coordinator.session().unwrap();
    let outcomes: Vec<(u32, DutOutcome)> = session.records().map(|d| (d.no, d.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            (1, DutOutcome::Passed),
            (2, DutOutcome::Passed),
            (3, DutOutcome::Failed),
            (4, DutOutcome::Failed),
        ]
    );
    let dut = coordinator.dut(1).unwrap();
    assert!(dut.flag("railtestLoaded"));
    assert!(dut.flag("softwareLoaded"));

    let closed = coordinator.finish_session().await.unwrap().unwrap();
    assert_eq!(closed.cycles, 2);
    assert_eq!(closed.unsaved, 0);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert!(!coordinator.dut(1).unwrap().available);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_transitions_outside_a_session() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1]
"#,
        BENCH_CYCLE
    ));
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::ZERO),
        store,
    )
    .await;

    assert!(coordinator.finish_session().await.unwrap().is_none());
    assert!(matches!(
        coordinator.start_full_cycle().await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        coordinator
            .start_new_session(SessionRequest {
                operator: "  ".to_string(),
                ..request()
            })
            .await,
        Err(Error::InvalidSessionInfo(_))
    ));
    assert_eq!(coordinator.state(), CoordinatorState::Idle);

    let status = coordinator.status();
    assert!(status.controls.is_enabled(Control::NewSession));
    assert!(!status.controls.is_enabled(Control::StartFullCycle));

    coordinator.start_new_session(request()).await.unwrap();
    assert!(matches!(
        coordinator.start_new_session(request()).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        coordinator.run_function("missing").await,
        Err(Error::FunctionNotFound { .. })
    ));
    assert!(matches!(
        coordinator.select_method("Nope"),
        Err(Error::MethodNotFound(_))
    ));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_entry_gate_rejects_second_action_while_testing() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1, 2]

[[channels]]
ordinal = 2
duts = [3, 4]
"#,
        BENCH_CYCLE
    ));
    let store = Arc::new(MemoryRecordStore::new());
    let coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::from_millis(300)),
        store,
    )
    .await;
    let (handle, task) = CoordinatorHandle::spawn(coordinator);

    handle.start_new_session(request()).await.unwrap();

    let cycle = tokio::spawn({
        let handle = handle.clone();
        async move { handle.start_full_cycle().await }
    });

    let mut watcher = handle.clone();
    loop {
        let status = watcher.changed().await.unwrap();
        if status.state == CoordinatorState::Testing {
            assert!(status.controls.iter().all(|(_, enabled)| !enabled));
            break;
        }
    }

    assert!(matches!(
        handle.start_full_cycle().await,
        Err(Error::ControlDisabled(_))
    ));
    assert!(matches!(
        handle.finish_session().await,
        Err(Error::ControlDisabled(_))
    ));
    assert!(matches!(
        handle.shutdown().await,
        Err(Error::ControlDisabled(_))
    ));

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(handle.status().state, CoordinatorState::SessionActive);
    assert!(!handle.barrier_armed());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_failed_writes_are_retried_at_next_checkpoint() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1, 2]
"#,
        BENCH_CYCLE
    ));
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::ZERO),
        store.clone(),
    )
    .await;

    coordinator.start_new_session(request()).await.unwrap();
    store.set_failing(true);
    let report = coordinator.start_full_cycle().await.unwrap();
    assert_eq!(report.records, 2);
    assert_eq!(report.unsaved, 2);
    assert!(store.written().await.is_empty());

    store.set_failing(false);
    let summary = coordinator.finish_session().await.unwrap().unwrap();
    assert_eq!(summary.unsaved, 0);
    assert_eq!(
        store.written().await,
        vec![(1, Checkpoint::SessionEnd), (2, Checkpoint::SessionEnd)]
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_barrier_timeout_disconnects_stalled_channel() {
    let config = config_with_timing(
        &format!(
            r#"
{}
[[channels]]
ordinal = 1
duts = [1]

[[channels]]
ordinal = 2
duts = [2]

[[simulation.channels]]
ordinal = 2
hang = true
"#,
            BENCH_CYCLE
        ),
        "barrier_timeout_secs = 1",
    );
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::ZERO),
        store,
    )
    .await;

    // Detection at session start stalls on channel 2 until the timeout
    coordinator.start_new_session(request()).await.unwrap();
    let channels = coordinator.status().channels;
    assert_eq!(channels[0].state, ChannelState::Active);
    assert_eq!(channels[1].state, ChannelState::Disconnected);

    let report = coordinator.run_function("detect").await.unwrap();
    assert_eq!(report.dispatch.addressed, vec![1]);
    assert!(!coordinator.barrier_probe().is_armed());

    // The stalled worker never finishes, so the coordinator is dropped
    // instead of shut down
}

#[tokio::test]
async fn test_selection_routed_to_owning_channel() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1, 2]

[[channels]]
ordinal = 2
duts = [3]
"#,
        BENCH_CYCLE
    ));
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::ZERO),
        store.clone(),
    )
    .await;

    assert!(matches!(
        coordinator.set_dut_checked(3, false).await,
        Err(Error::InvalidTransition { .. })
    ));

    coordinator.start_new_session(request()).await.unwrap();
    coordinator.set_dut_checked(3, false).await.unwrap();
    assert!(!coordinator.dut(3).unwrap().checked);
    assert!(matches!(
        coordinator.set_dut_checked(99, false).await,
        Err(Error::DutNotFound(99))
    ));

    // Unchecked DUTs are left out of the cycle
    coordinator.start_full_cycle().await.unwrap();
    let tested: Vec<u32> = coordinator.session().unwrap().records().map(|d| d.no).collect();
    assert_eq!(tested, vec![1, 2]);

    coordinator.reverse_selection().await.unwrap();
    assert!(coordinator.dut(3).unwrap().checked);
    assert!(!coordinator.dut(1).unwrap().checked);

    coordinator.select_all().await.unwrap();
    assert!((1..=3).all(|no| coordinator.dut(no).unwrap().checked));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_socket_fault_fails_only_that_dut() {
    let config = config(
        r#"
[[channels]]
ordinal = 1
duts = [1, 2]

[[channels]]
ordinal = 2
duts = [3, 4]
"#,
    );
    let faults = Faults {
        stuck_relay: Some((2, 2)),
        ..Default::default()
    };
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator =
        faulty_coordinator(config, MethodLibrary::builtin(), store, faults).await;

    coordinator.start_new_session(request()).await.unwrap();
    let report = coordinator.start_full_cycle().await.unwrap();

    let test = &report.steps[2];
    assert_eq!(test.completions.len(), 2);
    assert!(test.completions.iter().all(|c| c.outcome == Outcome::Passed));

    let session = coordinator.session().unwrap();
    let outcomes: Vec<(u32, DutOutcome)> = session.records().map(|d| (d.no, d.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            (1, DutOutcome::Passed),
            (2, DutOutcome::Passed),
            (3, DutOutcome::Passed),
            (4, DutOutcome::Failed),
        ]
    );

    let failed = session.records().find(|d| d.no == 4).unwrap();
    assert!(!failed.flag("railtestLoaded"));
    assert!(failed.errors.iter().any(|e| e.contains("relay did not close")));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_lost_channel_does_not_stop_shared_power_rail() {
    let config = config(
        r#"
[[channels]]
ordinal = 1
duts = [1]

[[channels]]
ordinal = 2
duts = [2]

[[channels]]
ordinal = 3
duts = [3]
"#,
    );
    let unplugged = Arc::new(AtomicBool::new(false));
    let faults = Faults {
        unplugged: Some((1, unplugged.clone())),
        ..Default::default()
    };
    let powered = faults.powered.clone();
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator =
        faulty_coordinator(config, MethodLibrary::builtin(), store, faults).await;

    coordinator.start_new_session(request()).await.unwrap();
    coordinator.run_function("Detect DUTs").await.unwrap();
    unplugged.store(true, Ordering::SeqCst);

    let report = coordinator.run_function("Supply power to DUTs").await.unwrap();
    match &report.dispatch.outcome {
        Some(Outcome::Failed(reason)) => assert!(reason.contains("[1]"), "{}", reason),
        other => panic!("expected a failed outcome, got {:?}", other),
    }
    assert_eq!(*powered.lock().unwrap(), vec![(2, 1), (3, 1)]);

    let states: Vec<ChannelState> = coordinator.status().channels.iter().map(|c| c.state).collect();
    assert_eq!(
        states,
        vec![ChannelState::Disconnected, ChannelState::Active, ChannelState::Active]
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_new_session_reopens_disconnected_channel() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1]

[[channels]]
ordinal = 2
duts = [2]
"#,
        BENCH_CYCLE
    ));
    let unplugged = Arc::new(AtomicBool::new(false));
    let faults = Faults {
        unplugged: Some((2, unplugged.clone())),
        ..Default::default()
    };
    let store = Arc::new(MemoryRecordStore::new());
    let mut coordinator = faulty_coordinator(
        config,
        bench_methods(Provision::default(), Duration::ZERO),
        store,
        faults,
    )
    .await;

    coordinator.start_new_session(request()).await.unwrap();
    unplugged.store(true, Ordering::SeqCst);
    let report = coordinator.run_function("detect").await.unwrap();
    assert_eq!(report.failed_channels(), vec![2]);
    assert_eq!(coordinator.status().channels[1].state, ChannelState::Disconnected);
    coordinator.finish_session().await.unwrap();

    // Carrier plugged back in between sessions
    unplugged.store(false, Ordering::SeqCst);
    coordinator.start_new_session(request()).await.unwrap();
    assert_eq!(coordinator.status().channels[1].state, ChannelState::Active);

    let report = coordinator.run_function("detect").await.unwrap();
    assert_eq!(report.dispatch.addressed, vec![1, 2]);
    assert!(coordinator.dut(2).unwrap().available);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_running_cycle() {
    let config = config(&format!(
        r#"
{}
[[channels]]
ordinal = 1
duts = [1, 2]
"#,
        BENCH_CYCLE
    ));
    let store = Arc::new(MemoryRecordStore::new());
    let coordinator = coordinator(
        config,
        bench_methods(Provision::default(), Duration::from_millis(300)),
        store.clone(),
    )
    .await;
    let (handle, task) = CoordinatorHandle::spawn(coordinator);
    handle.start_new_session(request()).await.unwrap();

    let cycle = tokio::spawn({
        let handle = handle.clone();
        async move { handle.start_full_cycle().await }
    });
    let mut watcher = handle.clone();
    while watcher.changed().await.unwrap().state != CoordinatorState::Testing {}

    assert!(matches!(
        handle.shutdown_when_idle(Duration::from_millis(20)).await,
        Err(Error::ControlDisabled(_))
    ));
    handle.shutdown_when_idle(Duration::from_secs(10)).await.unwrap();

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.records, 2);
    task.await.unwrap();
    assert_eq!(store.written().await.len(), 2);
}
