//! Gateway runtime tests
//!
//! Whole-process lifecycle with simulated PLCs and an in-memory broker.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use tokio::sync::oneshot;

use s7mqtt::devices::{command_topic, discovery_topic, state_topic};
use s7mqtt::runtime::run_gateway;
use s7mqtt::GatewayError;

use common::*;

#[tokio::test]
async fn test_gateway_runs_every_controller_until_shutdown() {
    let config = app_config(
        vec![
            controller_config(vec![light("light1")]),
            controller_config(vec![dimmer("dimmer1")]),
        ],
        20,
    );
    let messaging = MemoryMessaging::new();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let gateway = tokio::spawn(run_gateway(config, messaging.clone(), async move {
        let _ = stop_rx.await;
    }));

    let probe = messaging.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            !probe.published_to(&state_topic("light1")).is_empty()
                && !probe.published_to(&state_topic("dimmer1")).is_empty()
        })
        .await
    );
    assert_eq!(messaging.published_to(&discovery_topic("light1")).len(), 1);
    assert_eq!(messaging.published_to(&discovery_topic("dimmer1")).len(), 1);

    // Commands reach the simulated PLC and come back as state
    assert_eq!(messaging.deliver(&command_topic("light1"), "ON"), 1);
    assert!(
        wait_until(Duration::from_secs(2), || {
            probe
                .published_to(&state_topic("light1"))
                .iter()
                .any(|p| p.payload == "ON")
        })
        .await
    );

    stop_tx.send(()).unwrap();
    gateway.await.unwrap().unwrap();

    assert!(!messaging.is_connected());
    assert_eq!(messaging.connect_calls(), 1);
    assert_eq!(messaging.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_gateway_startup_is_all_or_nothing() {
    let config = app_config(
        vec![
            controller_config(vec![light("light1")]),
            controller_config(vec![dimmer("dimmer1")]),
        ],
        20,
    );
    let messaging = MemoryMessaging::new();
    messaging.fail_publish_on(Some(&discovery_topic("dimmer1")));

    let result = run_gateway(config, messaging.clone(), std::future::pending::<()>()).await;

    assert!(matches!(result, Err(GatewayError::MessagingError(_))));
    assert!(!messaging.is_connected());
    assert_eq!(messaging.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_gateway_fails_when_broker_unavailable() {
    let config = app_config(vec![controller_config(vec![light("light1")])], 20);
    // Already connected, so a second connect is refused
    let messaging = MemoryMessaging::connected();

    let result = run_gateway(config, messaging.clone(), std::future::pending::<()>()).await;

    assert!(matches!(result, Err(GatewayError::MessagingError(_))));
    assert!(messaging.published().is_empty());
}
