//! End to end: config file -> bus -> orchestrator -> Solomon echo agent

mod common;

use common::{recv, wait_until, within};
use nexus::config::NexusConfig;
use nexus::coordination::{CorrelationId, LogFilter, LogOutcome, Message, MessageKind, Priority};
use nexus::orchestration::{BRIDGE_TOPIC, TaskHandoff};
use nexus::{
    AgentId, AgentOrchestrator, AgentSpec, AgentStatus, BuiltinLauncher, MessageBus,
    OrchestratorConfig, TaskStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn runtime(
    config: &NexusConfig,
    orchestrator_config: OrchestratorConfig,
) -> (MessageBus, AgentOrchestrator) {
    let log = config.log.open().await.unwrap();
    let bus = MessageBus::new(config.bus.to_bus_config(), log);
    bus.start();
    let launcher = Arc::new(BuiltinLauncher::new());
    let orchestrator = AgentOrchestrator::new(bus.clone(), launcher, orchestrator_config);
    orchestrator.start();
    for spec in &config.agents {
        orchestrator.spawn_agent(spec.clone()).unwrap();
    }
    (bus, orchestrator)
}

async fn stop(bus: MessageBus, orchestrator: AgentOrchestrator) {
    orchestrator.shutdown().await;
    bus.shutdown().await;
}

#[tokio::test]
async fn test_solomon_answers_ping_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nexus.toml");
    NexusConfig::sample().save_to_path(&path).await.unwrap();

    let config = NexusConfig::load(Some(path.as_path())).await.unwrap();
    let orchestrator_config = config.orchestrator.to_orchestrator_config();
    let (bus, orchestrator) = runtime(&config, orchestrator_config).await;

    let solomon = AgentId::from("solomon");
    let request = Message::builder("client")
        .kind(MessageKind::Request)
        .recipient(solomon.clone())
        .payload(json!("ping"))
        .build();
    let reply = within(
        Duration::from_secs(2),
        bus.publish_and_wait(request, Duration::from_secs(2)),
    )
    .await
    .unwrap();

    assert_eq!(reply.sender(), &solomon);
    assert_eq!(reply.payload(), &json!("pong"));
    assert_eq!(reply.error(), None);

    // The agent heartbeats its way to ACTIVE
    wait_until(Duration::from_secs(2), || {
        orchestrator.agent_status(&solomon) == Some(AgentStatus::Active)
    })
    .await;

    bus.flush_log().await;
    let resolved = bus
        .query_log(&LogFilter::default().with_outcome(LogOutcome::Resolved))
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].correlation_id, reply.correlation_id().cloned());

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_topic_request_reaches_solomon() {
    let config = NexusConfig::sample();
    let (bus, orchestrator) = runtime(&config, OrchestratorConfig::default()).await;

    let reply = bus
        .publish_and_wait(
            Message::builder("client")
                .topic("agents.solomon")
                .kind(MessageKind::Request)
                .payload(json!({"question": "anyone there?"}))
                .build(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload(), &json!({"question": "anyone there?"}));

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_topic_ping_with_caller_correlation_gets_pong() {
    let config = NexusConfig::sample();
    let (bus, orchestrator) = runtime(&config, OrchestratorConfig::default()).await;

    let request = Message::builder("caller")
        .topic("agents.solomon")
        .correlation_id("c1")
        .payload(json!("ping"))
        .build();
    let reply = within(
        Duration::from_secs(2),
        bus.publish_and_wait(request, Duration::from_secs(2)),
    )
    .await
    .unwrap();

    assert_eq!(reply.payload(), &json!("pong"));
    assert_eq!(reply.correlation_id(), Some(&CorrelationId::from("c1")));
    assert_eq!(reply.sender(), &AgentId::from("solomon"));

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_submitted_task_completes() {
    let config = NexusConfig::sample();
    let (bus, orchestrator) = runtime(&config, OrchestratorConfig::default()).await;
    let solomon = AgentId::from("solomon");

    let task_id = orchestrator.submit_task(&solomon, json!("ping")).unwrap();
    wait_until(Duration::from_secs(2), || {
        orchestrator
            .task_status(&task_id)
            .is_some_and(|record| record.status == TaskStatus::Completed)
    })
    .await;

    let record = orchestrator.task_status(&task_id).unwrap();
    assert_eq!(record.result, Some(json!("pong")));
    assert_eq!(record.agent_id, solomon);
    assert_eq!(orchestrator.pending_tasks(&solomon), 0);

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let config = NexusConfig {
        agents: vec![AgentSpec::new("sleeper", "delay").with_settings(json!({"delay_ms": 300}))],
        ..NexusConfig::default()
    };
    let (bus, orchestrator) = runtime(&config, OrchestratorConfig::default()).await;
    let sleeper = AgentId::from("sleeper");

    let busy = orchestrator.submit_task(&sleeper, json!(1)).unwrap();
    let queued = orchestrator.submit_task(&sleeper, json!(2)).unwrap();
    assert_eq!(orchestrator.pending_tasks(&sleeper), 2);

    assert_eq!(bus.pending_correlations(), 2);

    assert!(orchestrator.cancel_task(&queued).unwrap());
    assert_eq!(orchestrator.task_status(&queued).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(bus.pending_correlations(), 1);
    // Cancelling twice is a no-op
    assert!(!orchestrator.cancel_task(&queued).unwrap());

    wait_until(Duration::from_secs(2), || {
        orchestrator
            .task_status(&busy)
            .is_some_and(|record| record.status == TaskStatus::Completed)
    })
    .await;
    assert_eq!(orchestrator.task_status(&queued).unwrap().status, TaskStatus::Cancelled);

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_slow_task_times_out() {
    let config = NexusConfig {
        agents: vec![AgentSpec::new("sleeper", "delay").with_settings(json!({"delay_ms": 500}))],
        ..NexusConfig::default()
    };
    let orchestrator_config = OrchestratorConfig {
        task_timeout: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let (bus, orchestrator) = runtime(&config, orchestrator_config).await;

    let task_id = orchestrator
        .submit_task(&AgentId::from("sleeper"), json!("slow"))
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        orchestrator
            .task_status(&task_id)
            .is_some_and(|record| record.status == TaskStatus::TimedOut)
    })
    .await;
    assert!(orchestrator.task_status(&task_id).unwrap().error.is_some());

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_handoff_is_published_on_bridge_topic() {
    let config = NexusConfig::default();
    let (bus, orchestrator) = runtime(&config, OrchestratorConfig::default()).await;

    let bridge = AgentId::from("queue-bridge");
    let mut rx = bus.register_agent(&bridge, 8).unwrap();
    bus.subscribe(&bridge, BRIDGE_TOPIC).unwrap();

    let receipt = orchestrator
        .handoff_task("reports.generate", json!({"month": 3}), Priority::High)
        .unwrap();

    let message = recv(&mut rx).await;
    assert_eq!(message.id(), &receipt.message_id);
    assert_eq!(message.topic(), Some(BRIDGE_TOPIC));
    assert_eq!(message.priority(), Priority::High);

    let handoff: TaskHandoff = serde_json::from_value(message.payload().clone()).unwrap();
    assert_eq!(handoff.task_name, "reports.generate");
    assert_eq!(handoff.queue, "high");
    assert_eq!(handoff.args, json!({"month": 3}));

    stop(bus, orchestrator).await;
}

#[tokio::test]
async fn test_task_for_unknown_agent_is_rejected() {
    let config = NexusConfig::default();
    let (bus, orchestrator) = runtime(&config, OrchestratorConfig::default()).await;

    let err = orchestrator
        .submit_task(&AgentId::from("ghost"), json!(null))
        .unwrap_err();
    assert!(matches!(err, nexus::OrchestratorError::AgentNotFound(_)));

    stop(bus, orchestrator).await;
}
