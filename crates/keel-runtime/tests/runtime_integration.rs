//! End-to-end tests for the controller runtime: wakeups, output tracking,
//! restarts and cancellation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, ids, new_store, Desired, Item};
use keel_runtime::{
    BackoffConfig, CancellationToken, Controller, ControllerError, ControllerResult, ControllerRuntime, Input,
    Output, Runtime,
};
use keel_state::{Kind, Pointer, Resource};

struct FanOut {
    passes: Arc<AtomicUsize>,
}

#[async_trait]
impl Controller for FanOut {
    fn name(&self) -> &str {
        "test.FanOutController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<Desired>().with_id("desired")]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<Item>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.event() => {}
            }

            self.passes.fetch_add(1, Ordering::SeqCst);

            let desired = r.get::<Desired>("desired")?.map(|d| d.spec.items).unwrap_or_default();

            r.start_tracking_outputs();
            for name in desired {
                r.modify::<Item, _>(&name.clone(), |item| {
                    item.name = name;
                    Ok(())
                })?;
            }
            r.cleanup_outputs::<Item>()?;
        }
    }
}

fn set_desired(store: &keel_state::Store, items: &[&str]) {
    let spec = Desired {
        items: items.iter().map(|s| s.to_string()).collect(),
    };
    let ptr = Pointer::new("test", "Desireds.test.keel.dev", "desired");
    match store.get(&ptr) {
        Ok(mut current) => {
            current.set_spec(spec);
            store.update(current).unwrap();
        }
        Err(_) => {
            store.create(Resource::new("desired", spec)).unwrap();
        }
    }
}

#[tokio::test]
async fn test_fan_out_follows_desired_state() {
    let store = new_store();
    let passes = Arc::new(AtomicUsize::new(0));

    let mut runtime = Runtime::new(Arc::clone(&store));
    runtime.register(FanOut { passes: Arc::clone(&passes) }).unwrap();

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(ctx.clone()));

    set_desired(&store, &["a", "b", "c"]);
    let kind = Kind::new("test", "Items.test.keel.dev");
    assert!(eventually(|| store.list(&kind).len() == 3).await);

    set_desired(&store, &["b"]);
    assert!(
        eventually(|| {
            let items: Vec<_> = store.list(&kind).iter().map(|r| r.typed::<Item>().unwrap()).collect();
            ids(&items) == vec!["b"]
        })
        .await
    );

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_wakeups_coalesce() {
    let store = new_store();
    let passes = Arc::new(AtomicUsize::new(0));

    let mut runtime = Runtime::new(Arc::clone(&store));
    runtime.register(FanOut { passes: Arc::clone(&passes) }).unwrap();

    set_desired(&store, &[]);
    for i in 0..50 {
        let name = format!("i{i}");
        set_desired(&store, &[name.as_str()]);
    }

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(ctx.clone()));

    let kind = Kind::new("test", "Items.test.keel.dev");
    assert!(
        eventually(|| store
            .list(&kind)
            .first()
            .is_some_and(|r| r.metadata().id() == "i49"))
        .await
    );

    // 50 updates issued before start collapse into a handful of passes
    assert!(passes.load(Ordering::SeqCst) < 50);

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

struct Flaky {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Controller for Flaky {
    fn name(&self) -> &str {
        "test.FlakyController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 3 {
            r.reset_restart_backoff();
            return Err(ControllerError::Other(format!("attempt {attempt} failed")));
        }

        ctx.cancelled().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_restart_after_error() {
    let store = new_store();
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut runtime = Runtime::new(store).with_backoff(BackoffConfig {
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    });
    runtime.register(Flaky { attempts: Arc::clone(&attempts) }).unwrap();

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(ctx.clone()));

    assert!(eventually(|| attempts.load(Ordering::SeqCst) == 4).await);

    ctx.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

struct Finisher;

#[async_trait]
impl Controller for Finisher {
    fn name(&self) -> &str {
        "test.FinisherController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![]
    }

    async fn run(&mut self, _ctx: &CancellationToken, _r: &mut ControllerRuntime) -> ControllerResult {
        Ok(())
    }
}

#[tokio::test]
async fn test_cancellation_is_not_an_error() {
    let mut runtime = Runtime::new(new_store());
    runtime.register(Finisher).unwrap();
    runtime.register(FanOut { passes: Arc::new(AtomicUsize::new(0)) }).unwrap();

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(ctx.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}
