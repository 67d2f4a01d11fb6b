use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use llmux_common::{PipelineError, codes};
use llmux_provider::{AuthMode, Capabilities, ProviderInstance};
use llmux_sched::{DedupCoordinator, Event, EventHub, OperationalEvent, PoolEntry};
use llmux_transform::Dialect;

fn instance(id: &str) -> ProviderInstance {
    ProviderInstance {
        id: id.to_string(),
        dialect: Dialect::OpenAi,
        endpoint: "https://api.example.test/v1".to_string(),
        default_model: "gpt-4".to_string(),
        supported_models: vec![],
        capabilities: Capabilities::default(),
        auth_mode: AuthMode::ApiKey,
    }
}

#[tokio::test]
async fn expired_entry_recovers_via_reaper_task() {
    let hub = EventHub::new(16);
    let mut rx = hub.subscribe();
    let coordinator = Arc::new(DedupCoordinator::new(hub.clone()));
    coordinator
        .clone()
        .spawn_reaper(Duration::from_millis(50));

    let entry = PoolEntry::new(instance("openai"), "gpt-4");
    let id = entry.composite_id.clone();
    coordinator.add_to_pool(entry).await;
    coordinator
        .add_to_blacklist(
            &id,
            "openai",
            PipelineError::new(codes::RATE_LIMIT_EXCEEDED, "429", "test"),
            Some(Duration::from_millis(30)),
            false,
        )
        .await;

    // pool add, then blacklist add (pool removal happens inside the same
    // critical section, before the add event).
    let mut saw_added = false;
    let deadline = Duration::from_millis(500);
    loop {
        let event = timeout(deadline, rx.recv()).await.unwrap().unwrap();
        match event {
            Event::Operational(OperationalEvent::BlacklistAdded { id: added, .. }) => {
                assert_eq!(added, id);
                saw_added = true;
            }
            Event::Operational(OperationalEvent::BlacklistExpired { id: expired }) => {
                assert_eq!(expired, id);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_added);

    // Reaper restored the displaced pool entry.
    let check = coordinator.check_duplicates(&id).await;
    assert!(check.in_pool && !check.in_blacklist);
}

#[tokio::test]
async fn membership_is_exact_before_the_reaper_runs() {
    let coordinator = Arc::new(DedupCoordinator::new(EventHub::new(16)));
    let entry = PoolEntry::new(instance("openai"), "gpt-4");
    let id = entry.composite_id.clone();
    coordinator.add_to_pool(entry).await;
    coordinator
        .add_to_blacklist(
            &id,
            "openai",
            PipelineError::new(codes::RATE_LIMIT_EXCEEDED, "429", "test"),
            Some(Duration::from_millis(20)),
            false,
        )
        .await;

    assert!(coordinator.is_blacklisted(&id).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    // No reaper running: the entry is still stored but no longer active.
    assert!(!coordinator.is_blacklisted(&id).await);
    assert!(coordinator.check_duplicates(&id).await.in_blacklist);
}
