//! Cloneable front end of the coordinator task
//!
//! Interactive actions pass through one entry gate: while an action is in
//! flight every other interactive trigger is rejected with
//! [`Error::ControlDisabled`]. Status queries bypass the gate and read the
//! latest published snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Coordinator, CycleReport, SessionRequest, SessionSummary, StatusSnapshot, StepReport};
use crate::common::{Error, Result};
use crate::dispatch::{BarrierProbe, FunctionInfo};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Retry interval while waiting for the entry gate to open
const GATE_POLL: Duration = Duration::from_millis(100);

enum Action {
    StartSession(SessionRequest, Reply<SessionSummary>),
    FinishSession(Reply<Option<SessionSummary>>),
    SelectMethod(String, Reply<Vec<FunctionInfo>>),
    RunFunction(String, Reply<StepReport>),
    StartFullCycle(Reply<CycleReport>),
    SetDutChecked(u32, bool, Reply<()>),
    SelectAll(Reply<()>),
    ReverseSelection(Reply<()>),
    Shutdown(Reply<()>),
}

/// Holds the entry gate closed until dropped
struct ControlGate(Arc<AtomicBool>);

impl ControlGate {
    fn enter(gate: &Arc<AtomicBool>, action: &str) -> Result<Self> {
        gate.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ControlDisabled(action.to_string()))?;
        Ok(Self(gate.clone()))
    }
}

impl Drop for ControlGate {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An action plus the gate it holds; the coordinator task drops both when done
struct Envelope {
    action: Action,
    _gate: ControlGate,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    actions: mpsc::Sender<Envelope>,
    status: watch::Receiver<StatusSnapshot>,
    gate: Arc<AtomicBool>,
    barrier: Arc<BarrierProbe>,
}

impl CoordinatorHandle {
    /// Move the coordinator onto its own task
    pub fn spawn(coordinator: Coordinator) -> (Self, JoinHandle<()>) {
        let (actions, rx) = mpsc::channel(16);
        let handle = Self {
            actions,
            status: coordinator.subscribe(),
            gate: Arc::new(AtomicBool::new(false)),
            barrier: coordinator.barrier_probe(),
        };
        let task = tokio::spawn(serve(coordinator, rx));
        (handle, task)
    }

    /// Latest published snapshot
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn barrier_armed(&self) -> bool {
        self.barrier.is_armed()
    }

    /// An interactive action is in flight
    pub fn is_busy(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    /// Wait for the next snapshot change
    pub async fn changed(&mut self) -> Result<StatusSnapshot> {
        self.status
            .changed()
            .await
            .map_err(|_| Error::Internal("coordinator stopped".to_string()))?;
        Ok(self.status.borrow().clone())
    }

    async fn request<T>(&self, name: &str, action: impl FnOnce(Reply<T>) -> Action) -> Result<T> {
        let gate = ControlGate::enter(&self.gate, name)?;
        let (tx, rx) = oneshot::channel();
        self.actions
            .send(Envelope {
                action: action(tx),
                _gate: gate,
            })
            .await
            .map_err(|_| Error::Internal("coordinator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("coordinator dropped the request".to_string()))?
    }

    pub async fn start_new_session(&self, request: SessionRequest) -> Result<SessionSummary> {
        self.request("new session", |tx| Action::StartSession(request, tx))
            .await
    }

    pub async fn finish_session(&self) -> Result<Option<SessionSummary>> {
        self.request("finish session", Action::FinishSession).await
    }

    pub async fn select_method(&self, name: &str) -> Result<Vec<FunctionInfo>> {
        let name = name.to_string();
        self.request("select method", |tx| Action::SelectMethod(name, tx))
            .await
    }

    pub async fn run_function(&self, name: &str) -> Result<StepReport> {
        let name = name.to_string();
        self.request("start command", |tx| Action::RunFunction(name, tx))
            .await
    }

    pub async fn start_full_cycle(&self) -> Result<CycleReport> {
        self.request("start full cycle", Action::StartFullCycle).await
    }

    pub async fn set_dut_checked(&self, no: u32, checked: bool) -> Result<()> {
        self.request("DUT selection", |tx| Action::SetDutChecked(no, checked, tx))
            .await
    }

    pub async fn select_all(&self) -> Result<()> {
        self.request("DUT selection", Action::SelectAll).await
    }

    pub async fn reverse_selection(&self) -> Result<()> {
        self.request("DUT selection", Action::ReverseSelection).await
    }

    /// Stop the coordinator; rejected while another action runs
    pub async fn shutdown(&self) -> Result<()> {
        self.request("shutdown", Action::Shutdown).await
    }

    /// Stop the coordinator once the action in flight has finished
    ///
    /// Gives up with [`Error::ControlDisabled`] when the action is still
    /// running after `patience`.
    pub async fn shutdown_when_idle(&self, patience: Duration) -> Result<()> {
        let deadline = Instant::now() + patience;
        let mut status = self.status.clone();
        loop {
            match self.shutdown().await {
                Err(Error::ControlDisabled(action)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::ControlDisabled(action));
                    }
                    // The gate can open without a new snapshot, so poll as well
                    let _ = tokio::time::timeout(remaining.min(GATE_POLL), status.changed()).await;
                }
                other => return other,
            }
        }
    }
}

/// Send a reply once the gate is open again, so the caller can act on it at once
fn reply<T>(gate: ControlGate, tx: Reply<T>, result: Result<T>) {
    drop(gate);
    let _ = tx.send(result);
}

async fn serve(mut coordinator: Coordinator, mut actions: mpsc::Receiver<Envelope>) {
    while let Some(Envelope { action, _gate: gate }) = actions.recv().await {
        match action {
            Action::StartSession(request, tx) => {
                reply(gate, tx, coordinator.start_new_session(request).await)
            }
            Action::FinishSession(tx) => reply(gate, tx, coordinator.finish_session().await),
            Action::SelectMethod(name, tx) => reply(gate, tx, coordinator.select_method(&name)),
            Action::RunFunction(name, tx) => reply(gate, tx, coordinator.run_function(&name).await),
            Action::StartFullCycle(tx) => reply(gate, tx, coordinator.start_full_cycle().await),
            Action::SetDutChecked(no, checked, tx) => {
                reply(gate, tx, coordinator.set_dut_checked(no, checked).await)
            }
            Action::SelectAll(tx) => reply(gate, tx, coordinator.select_all().await),
            Action::ReverseSelection(tx) => reply(gate, tx, coordinator.reverse_selection().await),
            Action::Shutdown(tx) => {
                coordinator.shutdown().await;
                reply(gate, tx, Ok(()));
                return;
            }
        }
    }

    tracing::debug!("All coordinator handles dropped");
    coordinator.shutdown().await;
}
