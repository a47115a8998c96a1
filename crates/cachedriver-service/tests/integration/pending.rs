use std::sync::Arc;

use serde_json::json;

use cachedriver_service::ondemand::OnDemandType;
use cachedriver_test::{Refresh, ScriptedScheduler, TestAgent, setup};

use crate::{Fixture, PROVIDER, payload};

fn storing_agent(agent_type: &str) -> Arc<TestAgent> {
    Arc::new(
        TestAgent::new(PROVIDER, agent_type)
            .handling(OnDemandType::SERVER_GROUP, PROVIDER)
            .refreshing(Refresh::NoResult)
            .storing_requests(),
    )
}

#[tokio::test]
async fn test_atomic_scheduler_has_nothing_pending() {
    setup();

    let fixture = Fixture::new(
        ScriptedScheduler::atomic(),
        &[storing_agent("ClusterCachingAgent")],
    );
    fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    let coordinator = &fixture.coordinator;
    assert!(
        coordinator
            .pending_on_demand_requests(&OnDemandType::SERVER_GROUP, PROVIDER)
            .await
            .is_empty()
    );
    assert!(
        coordinator
            .pending_on_demand_request(&OnDemandType::SERVER_GROUP, PROVIDER, "app-v001")
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_pending_requests() {
    setup();

    let fixture = Fixture::new(
        ScriptedScheduler::non_atomic(),
        &[storing_agent("ClusterCachingAgent")],
    );
    let coordinator = &fixture.coordinator;
    for server_group in ["app-v001", "app-v002"] {
        coordinator
            .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload(server_group))
            .await;
    }

    let pending = coordinator
        .pending_on_demand_requests(&OnDemandType::SERVER_GROUP, PROVIDER)
        .await;
    assert_eq!(pending, [payload("app-v001"), payload("app-v002")]);

    let request = coordinator
        .pending_on_demand_request(&OnDemandType::SERVER_GROUP, PROVIDER, "app-v002")
        .await;
    assert_eq!(request.unwrap()["serverGroupName"], json!("app-v002"));

    assert!(
        coordinator
            .pending_on_demand_request(&OnDemandType::SERVER_GROUP, PROVIDER, "app-v003")
            .await
            .is_none()
    );
    assert!(
        coordinator
            .pending_on_demand_requests(&OnDemandType::LOAD_BALANCER, PROVIDER)
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn test_pending_requests_of_all_agents() {
    setup();

    let fixture = Fixture::new(
        ScriptedScheduler::non_atomic(),
        &[
            storing_agent("ClusterCachingAgent"),
            storing_agent("ImageCachingAgent"),
        ],
    );
    fixture
        .coordinator
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;

    // both agents read the same provider cache
    let pending = fixture
        .coordinator
        .pending_on_demand_requests(&OnDemandType::SERVER_GROUP, PROVIDER)
        .await;
    assert_eq!(pending, [payload("app-v001"), payload("app-v001")]);
}
