//! Integration tests for UnitManager against the in-memory control bus

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use unitctl_core::manager::START_TIMESTAMP_PROPERTY;
use unitctl_core::{
    Context, JobScript, JobVerb, MemoryBus, MemoryCall, UnitError, UnitManager, UnitManagerApi,
    UnitUpdate,
};

const UNIT_DUMMY: &str = "manager_dummy.service";

fn manager_with(ctx: &Context, setup: impl FnOnce(&MemoryBus)) -> UnitManager<MemoryBus> {
    let bus = MemoryBus::new();
    setup(&bus);
    UnitManager::new(ctx, bus)
}

async fn next_update(rx: &mut mpsc::Receiver<UnitUpdate>) -> UnitUpdate {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no status change within 5s")
        .expect("watch ended")
}

#[tokio::test]
async fn test_watch_sees_start_stop_and_restart() {
    let ctx = Context::background().with_timeout(Duration::from_secs(10));
    let mgr = manager_with(&ctx, |bus| bus.install_unit(UNIT_DUMMY));

    let (tx, mut rx) = mpsc::channel(1);
    let watcher = {
        let mgr = mgr.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { mgr.watch(&ctx, UNIT_DUMMY, Some(&tx)).await })
    };
    mgr.bus().wait_for_subscribers(1).await;

    mgr.start(&ctx, UNIT_DUMMY).await.unwrap();
    let started = next_update(&mut rx).await.expect("started unit must be loaded");
    assert_eq!(started.name, UNIT_DUMMY);
    assert_eq!(started.active_state, "active");

    mgr.stop(&ctx, UNIT_DUMMY).await.unwrap();
    assert!(next_update(&mut rx).await.is_none(), "stopped unit reports unloaded");

    mgr.restart(&ctx, UNIT_DUMMY).await.unwrap();
    let restarted = next_update(&mut rx).await.expect("restarted unit must be loaded");
    assert_eq!(restarted.name, UNIT_DUMMY);
    assert_eq!(restarted.active_state, "active");

    ctx.cancel();
    let err = watcher.await.unwrap().unwrap_err();
    assert!(matches!(err, UnitError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_restart_of_running_unit_reports_no_change() {
    let ctx = Context::background();
    let mgr = manager_with(&ctx, |bus| bus.install_active_unit(UNIT_DUMMY));

    let (tx, mut rx) = mpsc::channel(1);
    let watcher = {
        let mgr = mgr.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { mgr.watch(&ctx, UNIT_DUMMY, Some(&tx)).await })
    };
    mgr.bus().wait_for_subscribers(1).await;

    mgr.restart(&ctx, UNIT_DUMMY).await.unwrap();

    assert!(timeout(Duration::from_secs(1), rx.recv()).await.is_err());
    let verbs: Vec<JobVerb> = mgr
        .bus()
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MemoryCall::SubmitJob { verb, .. } => Some(verb),
            _ => None,
        })
        .collect();
    assert_eq!(verbs, vec![JobVerb::Reload, JobVerb::Restart]);

    ctx.cancel();
    let _ = watcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_of_unknown_unit_runs_until_deadline() {
    let ctx = Context::background().with_timeout(Duration::from_secs(5));
    let mgr = manager_with(&ctx, |_| {});
    let (tx, _rx) = mpsc::channel(1);

    let began = Instant::now();
    let err = mgr.watch(&ctx, "non-existing", Some(&tx)).await.unwrap_err();

    assert!(matches!(err, UnitError::DeadlineExceeded));
    assert!(began.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_watch_of_idle_unit_runs_until_deadline() {
    let ctx = Context::background().with_timeout(Duration::from_secs(5));
    let mgr = manager_with(&ctx, |bus| bus.install_unit(UNIT_DUMMY));
    let (tx, mut rx) = mpsc::channel(1);

    let began = Instant::now();
    let err = mgr.watch(&ctx, UNIT_DUMMY, Some(&tx)).await.unwrap_err();

    assert!(matches!(err, UnitError::DeadlineExceeded));
    assert!(began.elapsed() >= Duration::from_secs(5));
    assert!(rx.try_recv().is_err(), "an installed but idle unit reports nothing");
}

#[tokio::test]
async fn test_watch_without_channel_fails_immediately() {
    let ctx = Context::background();
    let mgr = manager_with(&ctx, |bus| bus.install_unit(UNIT_DUMMY));

    let err = mgr.watch(&ctx, UNIT_DUMMY, None).await.unwrap_err();

    assert!(matches!(err, UnitError::MissingChannel { .. }));
    assert!(mgr.bus().calls().is_empty());
}

#[tokio::test]
async fn test_uptime_of_running_unit() {
    let ctx = Context::background();
    let started = chrono::Utc::now() - chrono::Duration::seconds(90);
    let mgr = manager_with(&ctx, |bus| {
        bus.install_active_unit(UNIT_DUMMY);
        bus.set_property(
            UNIT_DUMMY,
            START_TIMESTAMP_PROPERTY,
            format!("@t {}", started.timestamp_micros()),
        );
    });

    let uptime = mgr.uptime(&ctx, UNIT_DUMMY).await.unwrap();

    assert!(uptime >= Duration::from_secs(90), "uptime {uptime:?}");
    assert!(uptime < Duration::from_secs(95), "uptime {uptime:?}");
}

#[tokio::test]
async fn test_uptime_rejects_untagged_garbage() {
    let ctx = Context::background();
    let mgr = manager_with(&ctx, |bus| {
        bus.set_property(UNIT_DUMMY, START_TIMESTAMP_PROPERTY, "@t soon");
    });

    let err = mgr.uptime(&ctx, UNIT_DUMMY).await.unwrap_err();
    assert!(matches!(err, UnitError::MalformedTimestamp { ref unit, ref value, .. }
        if unit == UNIT_DUMMY && value == "soon"));
    assert_eq!(err.unit(), Some(UNIT_DUMMY));
}

#[tokio::test]
async fn test_concurrent_jobs_resolve_independently() {
    let ctx = Context::background();
    let mgr = manager_with(&ctx, |bus| {
        bus.script_job("a.service", JobVerb::Start, JobScript::Hold);
        bus.script_job("b.service", JobVerb::Start, JobScript::Hold);
    });

    let spawn_start = |unit: &'static str| {
        let mgr = mgr.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { mgr.start(&ctx, unit).await })
    };
    let job_a = spawn_start("a.service");
    let job_b = spawn_start("b.service");
    while mgr.bus().pending_jobs() < 2 {
        tokio::task::yield_now().await;
    }

    assert!(mgr.bus().complete_pending("b.service", "done"));
    job_b.await.unwrap().unwrap();
    assert!(!job_a.is_finished());

    assert!(mgr.bus().complete_pending("a.service", "failed"));
    let err = job_a.await.unwrap().unwrap_err();
    assert!(matches!(err, UnitError::JobFailed { ref unit, ref result, .. }
        if unit == "a.service" && result == "failed"));
}

#[tokio::test]
async fn test_context_end_closes_bus_once() {
    let ctx = Context::background().with_cancel();
    let mgr = manager_with(&ctx, |bus| bus.install_unit(UNIT_DUMMY));
    let clone = mgr.clone();

    ctx.cancel();
    while mgr.bus().close_count() == 0 {
        tokio::task::yield_now().await;
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(clone.bus().close_count(), 1);
    assert!(!mgr.is_connected());

    let fresh = Context::background();
    let err = mgr.start(&fresh, UNIT_DUMMY).await.unwrap_err();
    assert!(matches!(err, UnitError::Disconnected { ref unit } if unit == UNIT_DUMMY));
    let err = mgr.uptime(&fresh, UNIT_DUMMY).await.unwrap_err();
    assert!(matches!(err, UnitError::Disconnected { ref unit } if unit == UNIT_DUMMY));
}

async fn start_through_api(api: &impl UnitManagerApi, ctx: &Context) -> Result<(), UnitError> {
    api.start(ctx, UNIT_DUMMY).await
}

#[tokio::test]
async fn test_manager_usable_through_api_trait() {
    let ctx = Context::background();
    let mgr = manager_with(&ctx, |bus| bus.install_unit(UNIT_DUMMY));

    start_through_api(&mgr, &ctx).await.unwrap();
    assert_eq!(mgr.bus().active_state(UNIT_DUMMY).as_deref(), Some("active"));
}
