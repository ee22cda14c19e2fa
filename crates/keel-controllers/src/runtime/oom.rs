//! Userspace OOM handler: kills the highest ranked cgroup under sustained
//! memory pressure, before the kernel OOM killer has to.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use keel_expr::envs::{self, DEFAULT_OOM_CGROUP_RANKING, DEFAULT_OOM_TRIGGER};
use keel_expr::{Activation, Env, Expression, Value};
use keel_resources::runtime::{OOMAction, OOMProcess};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Output, ResultExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::{active_machine_config, machine_config_input};
use crate::sys::cgroups::{child_cgroups, cgroup_pids, kill_cgroup, read_memory_value, read_psi};
use crate::sys::pidfd::{cmdline, PidFd};

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Number of actions kept and published.
pub const ACTION_LOG_KEEP: usize = 10;

/// Subtrees sampled for pressure and memory, with their class (`None` for the root).
const PSI_SUBTREES: &[(&str, Option<i64>)] = &[
    ("", None),
    ("init", Some(4)),
    ("system", Some(4)),
    ("podruntime", Some(3)),
    ("kubepods/besteffort", Some(0)),
    ("kubepods/burstable", Some(1)),
    ("kubepods/guaranteed", Some(2)),
];

/// Directories whose children are ranked, in traversal order.
const RANKED_DIRS: &[(&str, i64)] = &[
    ("kubepods/besteffort", 0),
    ("kubepods/burstable", 1),
    ("kubepods/guaranteed", 2),
    ("podruntime", 3),
    ("system", 4),
];

/// A ranked cgroup.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCgroup {
    /// Absolute path.
    pub path: PathBuf,
    /// Class, see [`keel_expr::envs::CGROUP_CLASSES`].
    pub class: i64,
    /// Ranking score; higher is killed first.
    pub score: f64,
}

/// Picks the cgroup with the highest positive score; ties go to the first.
pub fn select_victim(ranking: &[RankedCgroup]) -> Option<&RankedCgroup> {
    let mut victim: Option<&RankedCgroup> = None;
    for cgroup in ranking {
        if cgroup.score <= 0.0 {
            continue;
        }
        if victim.map_or(true, |v| cgroup.score > v.score) {
            victim = Some(cgroup);
        }
    }
    victim
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Uint(u) => (*u).into(),
        Value::Double(d) => serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, Into::into),
        Value::String(s) => s.clone().into(),
        Value::Duration(nanos) => format!("{}s", *nanos as f64 / 1e9).into(),
        Value::List(items) => items.iter().map(to_json).collect::<Vec<_>>().into(),
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| {
                let key = match k {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key, to_json(v))
            })
            .collect::<serde_json::Map<_, _>>()
            .into(),
        Value::Optional(None) => serde_json::Value::Null,
        Value::Optional(Some(v)) => to_json(v),
    }
}

fn class_map(values: &BTreeMap<i64, f64>) -> Value {
    Value::Map(values.iter().map(|(class, v)| (Value::Int(*class), Value::Double(*v))).collect())
}

/// Samples pressure and memory, evaluates the trigger and kills.
pub struct OomController {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
    trigger_env: Env,
    ranking_env: Env,
    trigger: Expression,
    ranking: Expression,
    sample_interval: Duration,
    previous: HashMap<String, f64>,
    last_trigger: Option<Instant>,
    actions: VecDeque<(u64, OOMAction)>,
    next_action_id: u64,
}

impl std::fmt::Debug for OomController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OomController")
            .field("cgroup_root", &self.cgroup_root)
            .field("trigger", &self.trigger)
            .field("ranking", &self.ranking)
            .field("sample_interval", &self.sample_interval)
            .finish()
    }
}

impl OomController {
    /// Handler over the cgroup hierarchy at `cgroup_root`.
    pub fn new(cgroup_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> ControllerResult<Self> {
        let trigger_env = envs::oom_trigger();
        let ranking_env = envs::oom_cgroup_ranking();
        let trigger = Expression::compile(DEFAULT_OOM_TRIGGER, &trigger_env).context("default OOM trigger")?;
        let ranking =
            Expression::compile(DEFAULT_OOM_CGROUP_RANKING, &ranking_env).context("default OOM cgroup ranking")?;

        Ok(OomController {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
            trigger_env,
            ranking_env,
            trigger,
            ranking,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            previous: HashMap::new(),
            last_trigger: None,
            actions: VecDeque::new(),
            next_action_id: 0,
        })
    }

    /// Current sampling interval.
    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Picks up expressions and interval from the machine configuration.
    ///
    /// Expressions that don't check against their environment are ignored in
    /// favor of the defaults.
    pub fn apply_config(&mut self, r: &ControllerRuntime) -> ControllerResult {
        let oom = active_machine_config(r)?.and_then(|cfg| cfg.machine.oom.clone()).unwrap_or_default();

        let pick = |custom: Option<Expression>, default: &str, env: &Env, what: &str| -> ControllerResult<Expression> {
            if let Some(expr) = custom {
                match expr.check(env) {
                    Ok(()) => return Ok(expr),
                    Err(err) => warn!(expression = %expr, error = %err, "invalid OOM {what} expression, using default"),
                }
            }
            Expression::compile(default, env).with_context(|| format!("default OOM {what}"))
        };

        self.trigger = pick(oom.trigger_expression, DEFAULT_OOM_TRIGGER, &self.trigger_env, "trigger")?;
        self.ranking = pick(oom.cgroup_ranking_expression, DEFAULT_OOM_CGROUP_RANKING, &self.ranking_env, "ranking")?;
        self.sample_interval = oom
            .sample_interval
            .filter(|i| !i.is_zero())
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL);

        Ok(())
    }

    fn delta(&mut self, key: String, value: f64) -> f64 {
        let secs = self.sample_interval.as_secs_f64();
        let delta = match self.previous.get(&key) {
            Some(old) if secs > 0.0 => (value - old) / secs,
            _ => 0.0,
        };
        self.previous.insert(key, value);
        delta
    }

    /// Builds the trigger activation from the current cgroup state.
    pub fn sample(&mut self, now: Instant) -> std::io::Result<Activation> {
        let mut act = Activation::new();
        let mut qos: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();

        for (subtree, class) in PSI_SUBTREES {
            let dir = self.cgroup_root.join(subtree);
            let psi = read_psi(&dir)?.unwrap_or_default();

            for (name, value) in psi.named() {
                let delta = self.delta(format!("{subtree}/{name}"), value);
                match class {
                    None => {
                        act.insert(name, value);
                        act.insert(format!("d_{name}"), delta);
                    }
                    Some(class) => {
                        *qos.entry(format!("qos_{name}")).or_default().entry(*class).or_default() += value;
                        *qos.entry(format!("d_qos_{name}")).or_default().entry(*class).or_default() += delta;
                    }
                }
            }

            let Some(class) = class else {
                continue;
            };

            for (name, file) in [("current", "memory.current"), ("max", "memory.max"), ("peak", "memory.peak")] {
                let value = read_memory_value(&dir, file).ok().flatten().unwrap_or(0) as f64;
                let delta = self.delta(format!("{subtree}/memory_{name}"), value);
                *qos.entry(format!("qos_memory_{name}")).or_default().entry(*class).or_default() += value;
                *qos.entry(format!("d_qos_memory_{name}")).or_default().entry(*class).or_default() += delta;
            }
        }

        for (name, values) in &qos {
            act.insert(name.clone(), class_map(values));
        }

        let since = match self.last_trigger {
            Some(at) => now.saturating_duration_since(at),
            None => Duration::MAX,
        };
        act.insert("time_since_trigger", since);

        Ok(act)
    }

    /// Scores every ranked cgroup, in traversal order.
    pub fn rank(&self) -> Vec<RankedCgroup> {
        let mut ranking = Vec::new();

        for (dir, class) in RANKED_DIRS {
            let children = match child_cgroups(&self.cgroup_root.join(dir)) {
                Ok(children) => children,
                Err(err) => {
                    error!(dir, error = %err, "cannot list cgroup members");
                    continue;
                }
            };

            for path in children {
                let read = |file| read_memory_value(&path, file).ok().flatten();
                let act = Activation::new()
                    .bind("path", path.to_string_lossy().into_owned())
                    .bind("class", *class)
                    .bind("memory_current", read("memory.current"))
                    .bind("memory_max", read("memory.max"))
                    .bind("memory_peak", read("memory.peak"));

                match self.ranking.eval_double(&self.ranking_env, &act) {
                    Ok(score) => ranking.push(RankedCgroup {
                        path,
                        class: *class,
                        score,
                    }),
                    Err(err) => error!(cgroup = %path.display(), error = %err, "cannot score cgroup"),
                }
            }
        }

        ranking
    }

    fn reap(&self, cgroup: &Path) -> Vec<OOMProcess> {
        warn!(cgroup = %cgroup.display(), "sending SIGKILL to cgroup");

        let pids = cgroup_pids(cgroup).unwrap_or_else(|err| {
            error!(cgroup = %cgroup.display(), error = %err, "cannot list cgroup processes");
            Vec::new()
        });

        let mut processes = Vec::with_capacity(pids.len());
        let mut pidfds = Vec::with_capacity(pids.len());

        for pid in pids {
            processes.push(OOMProcess {
                pid,
                cmdline: cmdline(&self.proc_root, pid).unwrap_or_default(),
            });

            match PidFd::open(pid) {
                Ok(fd) => pidfds.push(fd),
                Err(err) => error!(pid, error = %err, "failed to open pidfd"),
            }
        }

        if let Err(err) = kill_cgroup(cgroup) {
            error!(cgroup = %cgroup.display(), error = %err, "failed to kill cgroup");
            return processes;
        }

        for fd in &pidfds {
            if let Err(err) = fd.release_memory() {
                error!(pid = fd.pid(), error = %err, "process_mrelease failed");
            }
        }

        processes
    }

    fn publish_actions(&self, r: &mut ControllerRuntime) -> ControllerResult {
        r.start_tracking_outputs();

        for (id, action) in &self.actions {
            r.modify::<OOMAction, _>(&id.to_string(), |a| {
                *a = action.clone();
                Ok(())
            })?;
        }

        r.cleanup_outputs::<OOMAction>()
    }

    /// One sampling tick. Returns the action taken, if any.
    pub fn tick(&mut self, r: &mut ControllerRuntime, now: Instant) -> ControllerResult<Option<OOMAction>> {
        let act = match self.sample(now) {
            Ok(act) => act,
            Err(err) => {
                error!(error = %err, "cannot sample memory pressure");
                return Ok(None);
            }
        };

        let triggered = match self.trigger.eval_bool(&self.trigger_env, &act) {
            Ok(triggered) => triggered,
            Err(err) => {
                error!(error = %err, "cannot evaluate OOM trigger");
                return Ok(None);
            }
        };

        if !triggered {
            return Ok(None);
        }

        info!("OOM handler triggered");
        self.last_trigger = Some(now);

        let ranking = self.rank();
        let Some(victim) = select_victim(&ranking) else {
            info!("no cgroup eligible for OOM kill");
            return Ok(None);
        };

        let processes = self.reap(&victim.path);
        let context: serde_json::Map<String, serde_json::Value> =
            act.iter().map(|(k, v)| (k.clone(), to_json(v))).collect();

        let action = OOMAction {
            trigger_context: serde_json::Value::Object(context).to_string(),
            score: victim.score,
            cgroup: victim.path.to_string_lossy().into_owned(),
            processes,
        };

        self.actions.push_back((self.next_action_id, action.clone()));
        self.next_action_id += 1;
        while self.actions.len() > ACTION_LOG_KEEP {
            self.actions.pop_front();
        }

        self.publish_actions(r)?;

        Ok(Some(action))
    }
}

#[async_trait]
impl Controller for OomController {
    fn name(&self) -> &str {
        "runtime.OOMController"
    }

    fn inputs(&self) -> Vec<keel_runtime::Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<OOMAction>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut period = self.sample_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.event() => {
                    self.apply_config(r)?;
                    if self.sample_interval != period {
                        period = self.sample_interval;
                        ticker = tokio::time::interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            self.tick(r, Instant::now())?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::testutil::{seed_config, standalone};
    use keel_resources::document::{MachineConfigDocument, OomDoc};
    use keel_state::{Kind, ResourceType};

    // Far above pid_max, so pidfd_open fails and nothing real is touched.
    const FAKE_PIDS: [i32; 2] = [2_000_000_001, 2_000_000_002];

    fn cgroup(root: &Path, rel: &str, current: u64, procs: &[i32]) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("memory.current"), format!("{current}\n")).unwrap();
        fs::write(dir.join("memory.max"), "max\n").unwrap();
        let procs: Vec<String> = procs.iter().map(|p| p.to_string()).collect();
        fs::write(dir.join("cgroup.procs"), procs.join("\n")).unwrap();
    }

    fn pressure(root: &Path, full_avg10: f64) {
        fs::write(
            root.join("memory.pressure"),
            format!("some avg10=0.00 avg60=0.00 avg300=0.00 total=0\nfull avg10={full_avg10:.2} avg60=0.00 avg300=0.00 total=0\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_select_victim_ties_go_first() {
        let ranked = |p: &str, score| RankedCgroup {
            path: PathBuf::from(p),
            class: 0,
            score,
        };
        let ranking = vec![ranked("a", 1.0), ranked("b", 5.0), ranked("c", 5.0), ranked("d", 0.0)];
        assert_eq!(select_victim(&ranking).unwrap().path, PathBuf::from("b"));
        assert!(select_victim(&[ranked("x", 0.0)]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_besteffort_pod_killed_first() {
        let cg = tempfile::tempdir().unwrap();
        let proc = tempfile::tempdir().unwrap();
        let root = cg.path();

        cgroup(root, "kubepods/besteffort/podA", 100 << 20, &FAKE_PIDS);
        cgroup(root, "kubepods/guaranteed/podB", 1 << 30, &[2_000_000_003]);
        cgroup(root, "runtime", 2 << 30, &[]);
        pressure(root, 50.0);

        fs::create_dir_all(proc.path().join(FAKE_PIDS[0].to_string())).unwrap();
        fs::write(proc.path().join(FAKE_PIDS[0].to_string()).join("cmdline"), b"sleep\x00inf\x00").unwrap();

        let (store, mut r) = standalone::<OOMAction>("runtime.OOMController");
        let mut ctrl = OomController::new(root, proc.path()).unwrap();

        let action = ctrl.tick(&mut r, Instant::now()).unwrap().unwrap();

        assert_eq!(action.cgroup, root.join("kubepods/besteffort/podA").to_string_lossy());
        let pids: Vec<i32> = action.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, FAKE_PIDS);
        assert_eq!(action.processes[0].cmdline, "sleep inf");
        assert_eq!(fs::read_to_string(root.join("kubepods/besteffort/podA/cgroup.kill")).unwrap(), "1");
        assert!(!root.join("kubepods/guaranteed/podB/cgroup.kill").exists());

        let context: serde_json::Value = serde_json::from_str(&action.trigger_context).unwrap();
        assert_eq!(context["memory_full_avg10"], 50.0);

        let published = store.get_typed::<OOMAction>("0").unwrap();
        assert_eq!(published.spec, action);

        // The default trigger holds off right after an action.
        assert!(ctrl.tick(&mut r, Instant::now()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_trigger_below_threshold() {
        let cg = tempfile::tempdir().unwrap();
        cgroup(cg.path(), "kubepods/besteffort/podA", 100 << 20, &[]);
        pressure(cg.path(), 1.0);

        let (_store, mut r) = standalone::<OOMAction>("runtime.OOMController");
        let mut ctrl = OomController::new(cg.path(), cg.path()).unwrap();
        assert!(ctrl.tick(&mut r, Instant::now()).unwrap().is_none());
        assert!(!cg.path().join("kubepods/besteffort/podA/cgroup.kill").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_log_bounded() {
        let cg = tempfile::tempdir().unwrap();
        cgroup(cg.path(), "kubepods/burstable/podA", 100 << 20, &[]);

        let (store, mut r) = standalone::<OOMAction>("runtime.OOMController");
        seed_config(&store, {
            let mut doc = MachineConfigDocument::default();
            doc.machine.oom = Some(OomDoc {
                trigger_expression: Some(Expression::new("true").unwrap()),
                cgroup_ranking_expression: None,
                sample_interval: Some(Duration::from_millis(100)),
            });
            doc
        });

        let mut ctrl = OomController::new(cg.path(), cg.path()).unwrap();
        ctrl.apply_config(&r).unwrap();
        assert_eq!(ctrl.sample_interval(), Duration::from_millis(100));

        for _ in 0..12 {
            assert!(ctrl.tick(&mut r, Instant::now()).unwrap().is_some());
        }

        let ids: Vec<String> = store
            .list(&Kind::new(OOMAction::NAMESPACE, OOMAction::TYPE))
            .iter()
            .map(|res| res.metadata().id().to_string())
            .collect();
        assert_eq!(ids.len(), ACTION_LOG_KEEP);
        assert!(!ids.contains(&"0".to_string()));
        assert!(ids.contains(&"11".to_string()));
    }
}
