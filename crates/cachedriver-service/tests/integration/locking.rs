use std::sync::Arc;
use std::time::Duration;

use cachedriver_service::ondemand::{
    OnDemandCacheResult, OnDemandCacheStatus, OnDemandMetrics, OnDemandResult, OnDemandType,
};
use cachedriver_test::{
    MetricsCapture, SchedulerCall, ScriptedScheduler, TestAgent, metric_names, setup,
};

use crate::{Fixture, PROVIDER, ids, payload, server_group_result};

fn agent(agent_type: &str, server_group: &str) -> TestAgent {
    TestAgent::new(PROVIDER, agent_type)
        .handling(OnDemandType::SERVER_GROUP, PROVIDER)
        .returning(server_group_result(agent_type, server_group, 1))
}

#[tokio::test]
async fn test_all_locks_held_elsewhere() {
    setup();

    let first = Arc::new(agent("ClusterCachingAgent", "app-v001"));
    let second = Arc::new(agent("ImageCachingAgent", "app-v001"));
    let fixture = Fixture::new(
        ScriptedScheduler::atomic().denying_locks(),
        &[first.clone(), second.clone()],
    );

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    assert_eq!(result, OnDemandCacheResult::pending(Default::default()));
    assert_eq!(first.invocations(), 0);
    assert_eq!(second.invocations(), 0);
    assert!(fixture.cache.calls().is_empty());
    assert_eq!(
        fixture.scheduler.calls(),
        vec![
            SchedulerCall::TryLock("ClusterCachingAgent".to_owned()),
            SchedulerCall::TryLock("ImageCachingAgent".to_owned()),
        ]
    );
}

#[tokio::test]
async fn test_one_lock_held_elsewhere() {
    setup();

    let busy = Arc::new(agent("ClusterCachingAgent", "app-v001"));
    let free = Arc::new(agent("ImageCachingAgent", "app-v002"));
    let fixture = Fixture::new(
        ScriptedScheduler::atomic().denying_lock_of("ClusterCachingAgent"),
        &[busy.clone(), free.clone()],
    );

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    // atomic writes are visible right away, so no identifiers are reported
    assert_eq!(result.status, OnDemandCacheStatus::Pending);
    assert!(result.cached_identifiers.is_empty());
    assert_eq!(busy.invocations(), 0);
    assert_eq!(free.invocations(), 1);
    assert_eq!(fixture.cache.ids("serverGroups"), ids(&["app-v002"]));
}

#[tokio::test]
async fn test_expired_lock_drops_result() {
    setup();

    let agent = Arc::new(agent("ClusterCachingAgent", "app-v001"));
    let fixture = Fixture::new(
        ScriptedScheduler::atomic().expiring_locks(),
        &[agent.clone()],
    );

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    assert_eq!(result.status, OnDemandCacheStatus::Pending);
    assert_eq!(agent.invocations(), 1);
    assert!(fixture.cache.calls().is_empty());
    // a lock which is not valid anymore belongs to someone else
    assert_eq!(
        fixture.scheduler.calls(),
        vec![
            SchedulerCall::TryLock("ClusterCachingAgent".to_owned()),
            SchedulerCall::LockValid("ClusterCachingAgent".to_owned()),
        ]
    );
}

#[tokio::test]
async fn test_uninstrumented_agent_releases_lock() {
    setup();

    let agent = Arc::new(agent("ClusterCachingAgent", "app-v001").without_metrics());
    let fixture = Fixture::new(ScriptedScheduler::atomic(), &[agent.clone()]);

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    assert_eq!(result, OnDemandCacheResult::successful());
    assert_eq!(agent.invocations(), 1);
    assert!(fixture.cache.calls().is_empty());
    assert_eq!(
        fixture.scheduler.calls().last(),
        Some(&SchedulerCall::TryRelease("ClusterCachingAgent".to_owned()))
    );
}

#[tokio::test]
async fn test_failed_release_after_write() {
    setup();

    let capture = MetricsCapture::new();
    let agent = Arc::new(
        agent("ClusterCachingAgent", "app-v001").with_metrics(
            OnDemandMetrics::new(PROVIDER, "ClusterCachingAgent", "ServerGroup")
                .with_client(capture.client()),
        ),
    );
    let fixture = Fixture::new(
        ScriptedScheduler::atomic().failing_release(),
        &[agent.clone()],
    );

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    // the data is written, but may have replaced newer data of a concurrent run
    assert_eq!(result, OnDemandCacheResult::successful());
    assert_eq!(fixture.cache.ids("serverGroups"), ids(&["app-v001"]));
    assert_eq!(
        metric_names(&capture.lines()),
        ["ondemand.count", "ondemand.cache_write", "ondemand.error"]
    );
}

#[tokio::test]
async fn test_non_atomic_scheduler_skips_locking() {
    setup();

    let agent = Arc::new(agent("ClusterCachingAgent", "app-v001"));
    let fixture = Fixture::new(
        ScriptedScheduler::non_atomic().denying_locks(),
        &[agent.clone()],
    );

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    assert_eq!(result.status, OnDemandCacheStatus::Pending);
    assert_eq!(agent.invocations(), 1);
    assert!(fixture.scheduler.calls().is_empty());
}

#[tokio::test]
async fn test_failed_release_without_changes() {
    setup();

    let capture = MetricsCapture::new();
    let agent = Arc::new(
        TestAgent::new(PROVIDER, "ClusterCachingAgent")
            .handling(OnDemandType::SERVER_GROUP, PROVIDER)
            .returning(OnDemandResult::new("ClusterCachingAgent"))
            .with_metrics(
                OnDemandMetrics::new(PROVIDER, "ClusterCachingAgent", "ServerGroup")
                    .with_client(capture.client()),
            ),
    );
    let fixture = Fixture::new(
        ScriptedScheduler::atomic().failing_release(),
        &[agent.clone()],
    );

    let result = fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    // nothing was written, so losing the lock cannot have overwritten anything
    assert_eq!(result, OnDemandCacheResult::successful());
    assert!(fixture.cache.calls().is_empty());
    assert_eq!(
        fixture.scheduler.calls().last(),
        Some(&SchedulerCall::TryRelease("ClusterCachingAgent".to_owned()))
    );
    assert_eq!(
        metric_names(&capture.lines()),
        ["ondemand.count", "ondemand.total"]
    );
}

#[tokio::test]
async fn test_total_run_time_includes_locking() {
    setup();

    let capture = MetricsCapture::new();
    let agent = Arc::new(
        agent("ClusterCachingAgent", "app-v001").with_metrics(
            OnDemandMetrics::new(PROVIDER, "ClusterCachingAgent", "ServerGroup")
                .with_client(capture.client()),
        ),
    );
    let fixture = Fixture::new(
        ScriptedScheduler::atomic().slow_locks(Duration::from_millis(50)),
        &[agent],
    );

    fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    let lines = capture.lines();
    let total = lines
        .iter()
        .find_map(|line| line.strip_prefix("test.ondemand.total:"))
        .and_then(|line| line.split('|').next())
        .map(|millis| millis.parse::<u64>().unwrap())
        .unwrap();
    assert!(total >= 50, "total run time was {total}ms");
}
