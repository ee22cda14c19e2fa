//! Machine stage and readiness.
//!
//! The stage is derived from sequence, phase and task events on the event
//! stream. The stream is read from its oldest retained event once per process:
//! the watcher outlives controller restarts, since events scrolled out of the
//! buffer can't be replayed.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use keel_api::proto::events::{self as pb, SequenceAction, StepAction};
use keel_api::proto::ErrorCode;
use keel_api::EventPayload;
use keel_resources::config::MachineType;
use keel_resources::runtime::{MachineStage, MachineStatus, MachineStatusStatus, UnmetCondition};
use keel_resources::services::{NetworkStatus, NodeStatus, Nodename, PodPhase, Service, StaticPodStatus, TimeStatus};
use keel_runtime::{
    CancellationToken, Controller, ControllerResult, ControllerRuntime, EventStream, Input, Output, ResultExt, TailOption,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SEQUENCE_BOOT: &str = "boot";
const SEQUENCE_INITIALIZE: &str = "initialize";
const SEQUENCE_INSTALL: &str = "install";
const SEQUENCE_SHUTDOWN: &str = "shutdown";
const SEQUENCE_REBOOT: &str = "reboot";
const SEQUENCE_RESET: &str = "reset";
const UPGRADE_SEQUENCES: &[&str] = &["upgrade", "stageUpgrade", "maintenanceUpgrade"];

const PHASE_INSTALL: &str = "install";
const PHASE_KEXEC: &str = "kexec";
const TASK_MAINTENANCE: &str = "runningMaintenance";

/// Services which must be up on every machine.
pub const REQUIRED_SERVICES: &[&str] = &["apid", "machined", "kubelet"];
/// Services which must additionally be up on control plane machines.
pub const CONTROL_PLANE_SERVICES: &[&str] = &["etcd", "trustd"];

/// Folds machine events into a [`MachineStage`].
#[derive(Debug, Default, Clone)]
pub struct StageTracker {
    stage: MachineStage,
    sequence: String,
}

impl StageTracker {
    /// Current stage.
    pub fn stage(&self) -> MachineStage {
        self.stage
    }

    /// Applies one event; returns the new stage if it changed.
    pub fn observe(&mut self, payload: &EventPayload) -> Option<MachineStage> {
        let mut stage = self.stage;

        match payload {
            EventPayload::Sequence(ev) => {
                self.sequence = ev.sequence.clone();

                if ev.action == SequenceAction::Start as i32 {
                    match ev.sequence.as_str() {
                        SEQUENCE_BOOT | SEQUENCE_INITIALIZE => stage = MachineStage::Booting,
                        // install runs on every boot, its phases tell whether it does anything
                        SEQUENCE_INSTALL => {}
                        SEQUENCE_SHUTDOWN => stage = MachineStage::ShuttingDown,
                        SEQUENCE_RESET => stage = MachineStage::Resetting,
                        SEQUENCE_REBOOT => stage = MachineStage::Rebooting,
                        s if UPGRADE_SEQUENCES.contains(&s) => stage = MachineStage::Upgrading,
                        _ => {}
                    }
                } else if ev.action == SequenceAction::Noop as i32 {
                    if ev.error.as_ref().is_some_and(|e| e.code == ErrorCode::Fatal as i32) {
                        stage = MachineStage::Rebooting;
                    }
                } else if ev.action == SequenceAction::Stop as i32 {
                    if ev.sequence == SEQUENCE_BOOT && ev.error.is_none() {
                        stage = MachineStage::Running;
                    }
                    self.sequence.clear();
                }
            }
            EventPayload::Phase(ev) if ev.action == StepAction::Start as i32 => {
                let seq = self.sequence.as_str();
                if seq == SEQUENCE_INSTALL && ev.phase == PHASE_INSTALL {
                    stage = MachineStage::Installing;
                } else if (seq == SEQUENCE_INSTALL || UPGRADE_SEQUENCES.contains(&seq)) && ev.phase == PHASE_KEXEC {
                    stage = MachineStage::Rebooting;
                }
            }
            EventPayload::Task(ev) if ev.task == TASK_MAINTENANCE => {
                if ev.action == StepAction::Start as i32 {
                    stage = MachineStage::Maintenance;
                } else if ev.action == StepAction::Stop as i32 {
                    stage = MachineStage::Booting;
                }
            }
            _ => {}
        }

        if stage == self.stage {
            return None;
        }
        self.stage = stage;
        Some(stage)
    }
}

#[derive(Default)]
struct SharedStage {
    stage: Mutex<MachineStage>,
    changed: Notify,
}

type Check = fn(&ControllerRuntime) -> ControllerResult<Result<(), String>>;

fn time_check(r: &ControllerRuntime) -> ControllerResult<Result<(), String>> {
    Ok(match r.get::<TimeStatus>(TimeStatus::ID)? {
        None => Err("time status is not available".to_string()),
        Some(ts) if !ts.spec.synced => Err("time is not synced".to_string()),
        Some(_) => Ok(()),
    })
}

fn network_check(r: &ControllerRuntime) -> ControllerResult<Result<(), String>> {
    let Some(status) = r.get::<NetworkStatus>(NetworkStatus::ID)? else {
        return Ok(Err("network status is not available".to_string()));
    };

    let pending: Vec<&str> = [
        (status.spec.address_ready, "address"),
        (status.spec.connectivity_ready, "connectivity"),
        (status.spec.etc_files_ready, "etc-files"),
        (status.spec.hostname_ready, "hostname"),
    ]
    .into_iter()
    .filter(|(ready, _)| !ready)
    .map(|(_, name)| name)
    .collect();

    Ok(if pending.is_empty() {
        Ok(())
    } else {
        Err(format!("waiting on: {}", pending.join(", ")))
    })
}

fn services_check(required: Vec<&'static str>) -> impl Fn(&ControllerRuntime) -> ControllerResult<Result<(), String>> {
    move |r| {
        let mut problems = Vec::new();
        let mut running = BTreeSet::new();

        for svc in r.list::<Service>()? {
            if !svc.spec.running {
                problems.push(format!("{} not running", svc.id()));
                continue;
            }
            running.insert(svc.id().to_string());
            if !svc.spec.unknown && !svc.spec.healthy {
                problems.push(format!("{} not healthy", svc.id()));
            }
        }

        for name in &required {
            if !running.contains(*name) {
                problems.push(format!("{name} not running"));
            }
        }

        Ok(if problems.is_empty() { Ok(()) } else { Err(problems.join(", ")) })
    }
}

fn static_pods_check(r: &ControllerRuntime) -> ControllerResult<Result<(), String>> {
    let mut problems = Vec::new();

    for pod in r.list::<StaticPodStatus>()? {
        match pod.spec.phase {
            PodPhase::Pending => problems.push(format!("{} pending", pod.id())),
            PodPhase::Failed => problems.push(format!("{} failed", pod.id())),
            PodPhase::Unknown => problems.push(format!("{} unknown", pod.id())),
            PodPhase::Succeeded => {}
            PodPhase::Running if !pod.spec.ready => problems.push(format!("{} not ready", pod.id())),
            PodPhase::Running => {}
        }
    }

    Ok(if problems.is_empty() { Ok(()) } else { Err(problems.join(", ")) })
}

fn node_ready_check(r: &ControllerRuntime) -> ControllerResult<Result<(), String>> {
    let Some(nodename) = r.get::<Nodename>(Nodename::ID)? else {
        return Ok(Ok(()));
    };
    if nodename.spec.skip_node_registration {
        return Ok(Ok(()));
    }

    let name = &nodename.spec.nodename;
    Ok(match r.get::<NodeStatus>(name)? {
        None => Err(format!("node {name:?} status is not available yet")),
        Some(status) if !status.spec.node_ready => Err(format!("node {name:?} is not ready")),
        Some(_) => Ok(()),
    })
}

/// Evaluates the readiness checks for `stage`.
pub fn readiness(r: &ControllerRuntime, stage: MachineStage, control_plane: bool) -> ControllerResult<MachineStatusStatus> {
    if !matches!(stage, MachineStage::Booting | MachineStage::Running) {
        return Ok(MachineStatusStatus {
            ready: true,
            unmet_conditions: Vec::new(),
        });
    }

    let mut required = REQUIRED_SERVICES.to_vec();
    if control_plane {
        required.extend_from_slice(CONTROL_PLANE_SERVICES);
    }
    let services = services_check(required);

    let checks: [(&str, &dyn Fn(&ControllerRuntime) -> ControllerResult<Result<(), String>>); 5] = [
        ("time", &(time_check as Check)),
        ("network", &(network_check as Check)),
        ("services", &services),
        ("staticPods", &(static_pods_check as Check)),
        ("nodeReady", &(node_ready_check as Check)),
    ];

    let mut status = MachineStatusStatus {
        ready: true,
        unmet_conditions: Vec::new(),
    };

    for (name, check) in checks {
        if let Err(reason) = check(r)? {
            status.ready = false;
            status.unmet_conditions.push(UnmetCondition {
                name: name.to_string(),
                reason,
            });
        }
    }

    Ok(status)
}

/// Publishes [`MachineStatus`] from the event stream and the readiness checks.
pub struct MachineStatusController {
    events: EventStream<EventPayload>,
    shared: Arc<SharedStage>,
    watcher: Option<JoinHandle<()>>,
    announced: bool,
}

impl std::fmt::Debug for MachineStatusController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineStatusController")
            .field("stage", &*self.shared.stage.lock())
            .finish()
    }
}

impl Drop for MachineStatusController {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl MachineStatusController {
    /// Controller reading machine events from `events`.
    pub fn new(events: EventStream<EventPayload>) -> Self {
        MachineStatusController {
            events,
            shared: Arc::new(SharedStage::default()),
            watcher: None,
            announced: false,
        }
    }

    /// Stage derived so far.
    pub fn stage(&self) -> MachineStage {
        *self.shared.stage.lock()
    }

    fn ensure_watcher(&mut self) -> ControllerResult {
        if self.watcher.is_some() {
            return Ok(());
        }

        let mut watcher = self
            .events
            .watch(TailOption::TailEvents(-1))
            .context("watching machine events")?;
        let shared = Arc::clone(&self.shared);

        self.watcher = Some(tokio::spawn(async move {
            let mut tracker = StageTracker::default();
            while let Some(delivered) = watcher.recv().await {
                if let Some(stage) = tracker.observe(&delivered.event.payload) {
                    debug!(?stage, "machine stage changed");
                    *shared.stage.lock() = stage;
                    shared.changed.notify_one();
                }
            }
        }));

        Ok(())
    }

    /// Recomputes and writes the status for the current stage.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let stage = self.stage();
        let control_plane = r
            .get::<MachineType>(MachineType::ID)?
            .is_some_and(|mt| mt.spec.kind.is_control_plane());

        let status = readiness(r, stage, control_plane)?;
        let ready = status.ready;

        r.modify::<MachineStatus, _>(MachineStatus::ID, |ms| {
            ms.stage = stage;
            ms.status = status;
            Ok(())
        })?;

        if stage == MachineStage::Running && ready && !self.announced {
            self.announced = true;
            info!("machine is running and ready");
        }

        r.reset_restart_backoff();
        Ok(())
    }
}

#[async_trait]
impl Controller for MachineStatusController {
    fn name(&self) -> &str {
        "runtime.MachineStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<TimeStatus>().with_id(TimeStatus::ID),
            Input::weak::<NetworkStatus>().with_id(NetworkStatus::ID),
            Input::weak::<Service>(),
            Input::weak::<StaticPodStatus>(),
            Input::weak::<MachineType>().with_id(MachineType::ID),
            Input::weak::<Nodename>().with_id(Nodename::ID),
            Input::weak::<NodeStatus>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<MachineStatus>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        self.ensure_watcher()?;
        let shared = Arc::clone(&self.shared);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
                _ = shared.changed.notified() => {}
            }

            self.reconcile(r)?;
        }
    }
}

fn stage_to_wire(stage: MachineStage) -> pb::MachineStage {
    match stage {
        MachineStage::Unknown => pb::MachineStage::Unknown,
        MachineStage::Booting => pb::MachineStage::Booting,
        MachineStage::Installing => pb::MachineStage::Installing,
        MachineStage::Maintenance => pb::MachineStage::Maintenance,
        MachineStage::Running => pb::MachineStage::Running,
        MachineStage::Rebooting => pb::MachineStage::Rebooting,
        MachineStage::ShuttingDown => pb::MachineStage::ShuttingDown,
        MachineStage::Resetting => pb::MachineStage::Resetting,
        MachineStage::Upgrading => pb::MachineStage::Upgrading,
    }
}

/// Wire form of a machine status.
pub fn status_event(ms: &MachineStatus) -> pb::MachineStatusEvent {
    pb::MachineStatusEvent {
        stage: stage_to_wire(ms.stage) as i32,
        status: Some(pb::MachineStatus {
            ready: ms.status.ready,
            unmet_conditions: ms
                .status
                .unmet_conditions
                .iter()
                .map(|c| pb::UnmetCondition {
                    name: c.name.clone(),
                    reason: c.reason.clone(),
                })
                .collect(),
        }),
    }
}

/// Republishes every [`MachineStatus`] change on the event stream.
pub struct MachineStatusPublisher {
    events: EventStream<EventPayload>,
    last: Option<MachineStatus>,
}

impl std::fmt::Debug for MachineStatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineStatusPublisher").field("last", &self.last).finish()
    }
}

impl MachineStatusPublisher {
    /// Publisher onto `events`.
    pub fn new(events: EventStream<EventPayload>) -> Self {
        MachineStatusPublisher { events, last: None }
    }

    /// Publishes the status if it changed since the last call.
    pub fn reconcile(&mut self, r: &ControllerRuntime) -> ControllerResult<bool> {
        let Some(ms) = r.get::<MachineStatus>(MachineStatus::ID)? else {
            return Ok(false);
        };

        if self.last.as_ref() == Some(&ms.spec) {
            return Ok(false);
        }

        let id = self.events.publish(EventPayload::MachineStatus(status_event(&ms.spec)));
        debug!(event_id = %id, stage = ?ms.spec.stage, ready = ms.spec.status.ready, "published machine status");
        self.last = Some(ms.spec);

        Ok(true)
    }
}

#[async_trait]
impl Controller for MachineStatusPublisher {
    fn name(&self) -> &str {
        "runtime.MachineStatusPublisherController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<MachineStatus>().with_id(MachineStatus::ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
            }

            if let Err(err) = self.reconcile(r) {
                warn!(error = %err, "failed to publish machine status");
                return Err(err);
            }
        }
    }
}
