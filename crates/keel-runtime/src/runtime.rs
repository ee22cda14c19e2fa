//! Controller registration, dependency validation and the per-controller run loop.

use std::collections::HashMap;
use std::sync::Arc;

use keel_state::{Event, Phase, Store, WatchScope};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::adapter::ControllerRuntime;
use crate::backoff::{Backoff, BackoffConfig};
use crate::controller::{Controller, Input, InputKind, Output, OutputKind};
use crate::error::RuntimeError;

struct Registered {
    name: String,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    controller: Box<dyn Controller>,
}

/// The controller runtime.
pub struct Runtime {
    store: Arc<Store>,
    backoff: BackoffConfig,
    controllers: Vec<Registered>,
}

impl Runtime {
    /// Creates a runtime over a store.
    pub fn new(store: Arc<Store>) -> Self {
        Runtime {
            store,
            backoff: BackoffConfig::default(),
            controllers: Vec::new(),
        }
    }

    /// Overrides the restart backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Names of registered controllers in registration order.
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.name.clone()).collect()
    }

    /// Registers a controller after validating its dependencies against the
    /// controllers registered so far.
    pub fn register<C: Controller>(&mut self, controller: C) -> Result<(), RuntimeError> {
        self.register_boxed(Box::new(controller))
    }

    /// Registers a boxed controller.
    pub fn register_boxed(&mut self, controller: Box<dyn Controller>) -> Result<(), RuntimeError> {
        let name = controller.name().to_string();
        let inputs = controller.inputs();
        let outputs = controller.outputs();

        if self.controllers.iter().any(|c| c.name == name) {
            return Err(RuntimeError::DuplicateController(name));
        }

        for input in &inputs {
            if !self.store.is_registered(&input.res_type) {
                return Err(RuntimeError::UndefinedKind {
                    controller: name,
                    res_type: input.res_type.clone(),
                });
            }
        }

        for output in &outputs {
            for other in &self.controllers {
                let Some(existing) = other.outputs.iter().find(|o| o.res_type == output.res_type) else {
                    continue;
                };

                if output.kind == OutputKind::Exclusive || existing.kind == OutputKind::Exclusive {
                    return Err(RuntimeError::OutputConflict {
                        res_type: output.res_type.clone(),
                        controller: name,
                        existing: other.name.clone(),
                    });
                }
            }
        }

        let mut graph: Vec<(&str, &[Input], &[Output])> = self
            .controllers
            .iter()
            .map(|c| (c.name.as_str(), c.inputs.as_slice(), c.outputs.as_slice()))
            .collect();
        graph.push((name.as_str(), inputs.as_slice(), outputs.as_slice()));

        if let Some(cycle) = find_strong_cycle(&graph) {
            return Err(RuntimeError::DependencyCycle(cycle));
        }

        debug!(controller = %name, "registered controller");

        self.controllers.push(Registered {
            name,
            inputs,
            outputs,
            controller,
        });

        Ok(())
    }

    /// Runs all registered controllers until the token is cancelled.
    pub async fn run(self, ctx: CancellationToken) -> Result<(), RuntimeError> {
        let mut tasks = JoinSet::new();

        info!(count = self.controllers.len(), "starting controller runtime");

        for registered in self.controllers {
            let (wake_tx, wake_rx) = mpsc::channel(1);
            let inputs = Arc::new(RwLock::new(registered.inputs));

            tasks.spawn(feed_events(
                ctx.clone(),
                Arc::clone(&self.store),
                registered.name.clone(),
                Arc::clone(&inputs),
                wake_tx.clone(),
            ));

            let adapter = ControllerRuntime::new(
                registered.name,
                Arc::clone(&self.store),
                inputs,
                registered.outputs,
                wake_tx,
                wake_rx,
            );

            tasks.spawn(run_controller(
                ctx.clone(),
                registered.controller,
                adapter,
                self.backoff.clone(),
            ));
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(error = %err, "controller task aborted");
            }
        }

        info!("controller runtime stopped");

        Ok(())
    }
}

/// Finds a cycle in the graph where an edge runs from a producer of a type to
/// every controller holding a strong input on that type.
fn find_strong_cycle(graph: &[(&str, &[Input], &[Output])]) -> Option<Vec<String>> {
    let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();

    for (from, (_, _, outputs)) in graph.iter().enumerate() {
        for (to, (_, inputs, _)) in graph.iter().enumerate() {
            let linked = inputs
                .iter()
                .filter(|i| i.kind == InputKind::Strong)
                .any(|i| outputs.iter().any(|o| o.res_type == i.res_type));
            if linked {
                edges.entry(from).or_default().push(to);
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(
        node: usize,
        edges: &HashMap<usize, Vec<usize>>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        path.push(node);

        for &next in edges.get(&node).map(Vec::as_slice).unwrap_or_default() {
            match marks[next] {
                Mark::Active => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; graph.len()];

    for node in 0..graph.len() {
        if marks[node] == Mark::New {
            let mut path = Vec::new();
            if let Some(cycle) = visit(node, &edges, &mut marks, &mut path) {
                return Some(cycle.into_iter().map(|i| graph[i].0.to_string()).collect());
            }
        }
    }

    None
}

/// Wakes a controller for every store event matching its inputs, and for its
/// own outputs which became ready to destroy.
async fn feed_events(
    ctx: CancellationToken,
    store: Arc<Store>,
    name: String,
    inputs: Arc<RwLock<Vec<Input>>>,
    wake_tx: mpsc::Sender<()>,
) {
    let mut watcher = store.watch(WatchScope::All);

    // initial reconcile
    let _ = wake_tx.try_send(());

    loop {
        let event = tokio::select! {
            _ = ctx.cancelled() => return,
            event = watcher.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        if wants(&name, &inputs.read(), &event) {
            // a full channel already holds a pending wakeup
            let _ = wake_tx.try_send(());
        }
    }
}

fn wants(name: &str, inputs: &[Input], event: &Event) -> bool {
    if inputs.iter().any(|i| i.wants(event)) {
        return true;
    }

    event.new.as_ref().is_some_and(|r| {
        let md = r.metadata();
        md.owner() == Some(name) && md.phase() == Phase::TearingDown && md.finalizers().is_empty()
    })
}

async fn run_controller(
    ctx: CancellationToken,
    mut controller: Box<dyn Controller>,
    mut adapter: ControllerRuntime,
    backoff: BackoffConfig,
) {
    let name = controller.name().to_string();
    let mut backoff = Backoff::new(backoff);

    loop {
        let span = info_span!("controller", controller = %name);
        let result = controller.run(&ctx, &mut adapter).instrument(span).await;

        if ctx.is_cancelled() {
            if let Err(err) = result {
                debug!(controller = %name, error = %err, "controller exited on shutdown with error");
            }
            break;
        }

        match result {
            Ok(()) => {
                debug!(controller = %name, "controller finished");
                break;
            }
            Err(err) => {
                if adapter.take_backoff_reset() {
                    backoff.reset();
                }

                let delay = backoff.next_delay();
                error!(controller = %name, error = %err, delay = ?delay, "controller failed, restarting");

                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                adapter.queue_reconcile();
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_state::ResourceType;
    use serde::Serialize;

    use crate::error::ControllerResult;

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct A;
    impl ResourceType for A {
        const TYPE: &'static str = "As.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct B;
    impl ResourceType for B {
        const TYPE: &'static str = "Bs.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    struct Stub {
        name: &'static str,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
    }

    #[async_trait]
    impl Controller for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn inputs(&self) -> Vec<Input> {
            self.inputs.clone()
        }

        fn outputs(&self) -> Vec<Output> {
            self.outputs.clone()
        }

        async fn run(&mut self, ctx: &CancellationToken, _r: &mut ControllerRuntime) -> ControllerResult {
            ctx.cancelled().await;
            Ok(())
        }
    }

    fn store() -> Arc<Store> {
        let store = Store::new();
        store.register::<A>();
        store.register::<B>();
        Arc::new(store)
    }

    #[test]
    fn test_duplicate_name() {
        let mut rt = Runtime::new(store());
        rt.register(Stub { name: "x", inputs: vec![], outputs: vec![] }).unwrap();
        let err = rt.register(Stub { name: "x", inputs: vec![], outputs: vec![] }).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateController(_)));
    }

    #[test]
    fn test_exclusive_conflict() {
        let mut rt = Runtime::new(store());
        rt.register(Stub { name: "x", inputs: vec![], outputs: vec![Output::exclusive::<A>()] }).unwrap();

        let err = rt
            .register(Stub { name: "y", inputs: vec![], outputs: vec![Output::shared::<A>()] })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::OutputConflict { .. }));
    }

    #[test]
    fn test_shared_outputs_coexist() {
        let mut rt = Runtime::new(store());
        rt.register(Stub { name: "x", inputs: vec![], outputs: vec![Output::shared::<A>()] }).unwrap();
        rt.register(Stub { name: "y", inputs: vec![], outputs: vec![Output::shared::<A>()] }).unwrap();
        assert_eq!(rt.controller_names(), vec!["x", "y"]);
    }

    #[test]
    fn test_undefined_kind() {
        let mut rt = Runtime::new(Arc::new(Store::new()));
        let err = rt
            .register(Stub { name: "x", inputs: vec![Input::weak::<A>()], outputs: vec![] })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UndefinedKind { .. }));
    }

    #[test]
    fn test_strong_cycle_rejected() {
        let mut rt = Runtime::new(store());
        rt.register(Stub {
            name: "x",
            inputs: vec![Input::strong::<B>()],
            outputs: vec![Output::exclusive::<A>()],
        })
        .unwrap();

        let err = rt
            .register(Stub {
                name: "y",
                inputs: vec![Input::strong::<A>()],
                outputs: vec![Output::exclusive::<B>()],
            })
            .unwrap_err();
        match err {
            RuntimeError::DependencyCycle(cycle) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"x".to_string()));
                assert!(cycle.contains(&"y".to_string()));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_weak_cycle_allowed() {
        let mut rt = Runtime::new(store());
        rt.register(Stub {
            name: "x",
            inputs: vec![Input::weak::<B>()],
            outputs: vec![Output::exclusive::<A>()],
        })
        .unwrap();
        rt.register(Stub {
            name: "y",
            inputs: vec![Input::strong::<A>()],
            outputs: vec![Output::exclusive::<B>()],
        })
        .unwrap();
    }
}
