//! Priority ordering, topic fan-out and system events

mod common;

use common::{fast_bus_config, recv, started_bus, wait_until};
use nexus::coordination::{
    LIFECYCLE_TOPIC, LogFilter, LogOutcome, Message, MessageBus, Priority, SystemEvent,
};
use nexus::{AgentId, MessageBusConfig};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_critical_overtakes_queued_low_priority() {
    // Queue everything before the dispatcher runs so ordering is decided by
    // the priority tiers alone.
    let bus = MessageBus::in_memory(MessageBusConfig::default());
    let agent = AgentId::from("worker");
    let mut rx = bus.register_agent(&agent, 16).unwrap();

    for n in 0..5 {
        bus.publish(
            Message::builder("caller")
                .recipient("worker")
                .priority(Priority::Low)
                .payload(json!(n))
                .build(),
        )
        .unwrap();
    }
    bus.publish(
        Message::builder("caller")
            .recipient("worker")
            .priority(Priority::Critical)
            .payload(json!("urgent"))
            .build(),
    )
    .unwrap();
    assert_eq!(bus.queue_depths(), [1, 0, 0, 5]);

    bus.start();

    let first = recv(&mut rx).await;
    assert_eq!(first.priority(), Priority::Critical);
    assert_eq!(first.payload(), &json!("urgent"));

    for n in 0..5 {
        let next = recv(&mut rx).await;
        assert_eq!(next.payload(), &json!(n), "LOW tier stays FIFO");
    }

    bus.shutdown().await;
}

#[tokio::test]
async fn test_topic_fan_out_reaches_only_matching_subscribers() {
    let bus = started_bus(fast_bus_config());
    let a = AgentId::from("a");
    let b = AgentId::from("b");
    let mut rx_a = bus.register_agent(&a, 8).unwrap();
    let mut rx_b = bus.register_agent(&b, 8).unwrap();
    bus.subscribe(&a, "x.*").unwrap();
    bus.subscribe(&b, "y.1").unwrap();

    let receipt = bus
        .publish(Message::to_topic("caller", "x.2", json!("for a")))
        .unwrap();

    let got = recv(&mut rx_a).await;
    assert_eq!(got.id(), &receipt.message_id);
    assert_eq!(got.topic(), Some("x.2"));

    bus.flush_log().await;
    assert!(rx_b.try_dequeue().is_none());

    let records = bus
        .query_log(&LogFilter::for_message(&receipt.message_id))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, LogOutcome::Routed);
    assert_eq!(records[0].recipients, vec![a.clone()]);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_delivers_one_copy_per_subscriber() {
    let bus = started_bus(fast_bus_config());
    let mut receivers = Vec::new();
    for name in ["r1", "r2", "r3"] {
        let id = AgentId::from(name);
        receivers.push(bus.register_agent(&id, 4).unwrap());
        bus.subscribe(&id, "news.**").unwrap();
    }

    bus.publish(Message::to_topic("caller", "news.sport.local", json!(1)))
        .unwrap();

    for rx in &mut receivers {
        assert_eq!(recv(rx).await.payload(), &json!(1));
    }
    wait_until(Duration::from_secs(1), || bus.metrics().delivered == 3).await;

    bus.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_topic_is_logged_unroutable() {
    let bus = started_bus(fast_bus_config());

    let receipt = bus
        .publish(Message::to_topic("caller", "nobody.listens", json!(null)))
        .unwrap();

    wait_until(Duration::from_secs(1), || bus.metrics().unroutable == 1).await;
    bus.flush_log().await;
    let records = bus
        .query_log(&LogFilter::for_message(&receipt.message_id))
        .await
        .unwrap();
    assert_eq!(records[0].outcome, LogOutcome::Unroutable);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_wildcard_publish_topic_is_rejected() {
    let bus = started_bus(fast_bus_config());
    assert!(bus
        .publish(Message::to_topic("caller", "x.*", json!(null)))
        .is_err());
    bus.shutdown().await;
}

#[tokio::test]
async fn test_expired_message_is_not_delivered() {
    let bus = MessageBus::in_memory(fast_bus_config());
    let agent = AgentId::from("late");
    let mut rx = bus.register_agent(&agent, 4).unwrap();

    let receipt = bus
        .publish(
            Message::builder("caller")
                .recipient("late")
                .ttl(Duration::from_millis(1))
                .payload(json!("stale"))
                .build(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.start();

    wait_until(Duration::from_secs(1), || bus.metrics().expired == 1).await;
    assert!(rx.try_dequeue().is_none());

    bus.flush_log().await;
    let records = bus
        .query_log(&LogFilter::for_message(&receipt.message_id).with_outcome(LogOutcome::Expired))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_system_events_reach_subscribers() {
    let bus = started_bus(fast_bus_config());
    let observer = AgentId::from("observer");
    let mut rx = bus.register_agent(&observer, 8).unwrap();
    bus.subscribe(&observer, "system.*").unwrap();

    bus.publish_event(SystemEvent::AgentRestarted {
        agent_id: AgentId::from("solomon"),
        restart_count: 2,
    })
    .unwrap();

    let message = recv(&mut rx).await;
    assert_eq!(message.topic(), Some(LIFECYCLE_TOPIC));
    assert_eq!(
        SystemEvent::from_message(&message),
        Some(SystemEvent::AgentRestarted {
            agent_id: AgentId::from("solomon"),
            restart_count: 2,
        })
    );

    bus.shutdown().await;
}
