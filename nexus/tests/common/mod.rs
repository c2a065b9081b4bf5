//! Shared helpers for integration tests

#![allow(dead_code)]

use nexus::coordination::{MailboxReceiver, Message, MessageBus, MessageBusConfig};
use std::future::Future;
use std::time::Duration;

/// Bus with short retry delays, already started
pub fn started_bus(config: MessageBusConfig) -> MessageBus {
    let bus = MessageBus::in_memory(config);
    bus.start();
    bus
}

pub fn fast_bus_config() -> MessageBusConfig {
    MessageBusConfig {
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(40),
        sweep_interval: Duration::from_millis(10),
        ..MessageBusConfig::default()
    }
}

/// Next message or panic after one second
pub async fn recv(rx: &mut MailboxReceiver) -> Message {
    tokio::time::timeout(Duration::from_secs(1), rx.dequeue())
        .await
        .expect("timed out waiting for message")
        .expect("mailbox closed")
}

/// Poll `condition` every few milliseconds until it holds
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Await a future that must finish within `timeout`
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("future did not complete in time")
}
