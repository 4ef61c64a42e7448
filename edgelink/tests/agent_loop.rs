//! End-to-end agent loop scenarios over the loopback transport.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{sleep, timeout};

use edgelink::actions::Action;
use edgelink::agent::{AgentBuilder, AgentConfig};
use edgelink::protocol;
use edgelink::transport::loopback::{LoopbackBroker, LoopbackTransport};
use edgelink::value::{DataType, TypedValue};

fn test_config(dir: &tempfile::TempDir) -> AgentConfig {
    let mut config = AgentConfig::new("dev1", "loopback");
    config.runtime_dir = dir.path().to_path_buf();
    config.persist_transfers = false;
    config
}

/// Collects publications on `api` into `published` until one carries the
/// wanted command, then removes and returns it. Other messages stay in the
/// buffer for later assertions.
async fn wait_for_command(
    broker: &LoopbackBroker,
    published: &mut Vec<Value>,
    command: &str,
) -> Value {
    let deadline = Duration::from_secs(10);
    timeout(deadline, async {
        loop {
            for (topic, payload) in broker.take_published() {
                if topic != protocol::API_TOPIC {
                    continue;
                }
                let root: Value =
                    serde_json::from_slice(&payload).expect("published payload must be JSON");
                let Some(object) = root.as_object() else { continue };
                published.extend(object.values().cloned());
            }
            if let Some(pos) = published
                .iter()
                .position(|body| body.get("command").and_then(Value::as_str) == Some(command))
            {
                return published.remove(pos);
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {command:?} published within {deadline:?}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mailbox_ack_path() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let agent = AgentBuilder::new(test_config(&dir))
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();

    handle
        .actions()
        .register(Action::callback("ping", |request| {
            request.set_out_parameter(
                "response",
                TypedValue::String("acknowledged".to_string()),
            );
            request.set_out_parameter(
                "time_stamp",
                TypedValue::String(protocol::format_timestamp(Utc::now())),
            );
            Ok(())
        }))
        .unwrap();

    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();

    // The mailbox poll right after connect proves the session is up and the
    // reply subscription is in place.
    wait_for_command(&broker, &mut published, "mailbox.check").await;

    broker.inject(
        "reply",
        br#"{"cmd":{"params":{"messages":[
            {"id":"r1","params":{"method":"ping","params":{}}}
        ]}}}"#,
    );

    let ack = wait_for_command(&broker, &mut published, "mailbox.ack").await;
    assert_eq!(ack["params"]["id"], "r1");
    assert_eq!(ack["params"]["errorCode"], 0);
    assert_eq!(ack["params"]["params"]["response"], "acknowledged");
    let stamp = ack["params"]["params"]["time_stamp"]
        .as_str()
        .expect("time_stamp must be present");
    protocol::parse_timestamp(stamp).expect("time_stamp must be RFC3339");

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_action_is_acked_with_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let agent = AgentBuilder::new(test_config(&dir))
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();
    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();

    wait_for_command(&broker, &mut published, "mailbox.check").await;
    broker.inject(
        "reply",
        br#"{"cmd":{"params":{"messages":[
            {"id":"r9","params":{"method":"no_such_action","params":{}}}
        ]}}}"#,
    );

    let ack = wait_for_command(&broker, &mut published, "mailbox.ack").await;
    assert_eq!(ack["params"]["id"], "r9");
    assert_ne!(ack["params"]["errorCode"], 0);
    assert!(ack["params"]["errorMessage"].as_str().is_some());

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mailbox_activity_triggers_poll() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let agent = AgentBuilder::new(test_config(&dir))
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();
    let thing_key = handle.thing_key();
    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();

    wait_for_command(&broker, &mut published, "mailbox.check").await;

    // A notification for another thing is ignored; ours triggers a poll.
    broker.inject(
        "notify/mailbox_activity",
        br#"{"thingKey":"somebody-else"}"#,
    );
    broker.inject(
        "notify/mailbox_activity",
        format!(r#"{{"thingKey":"{thing_key}"}}"#).as_bytes(),
    );

    wait_for_command(&broker, &mut published, "mailbox.check").await;

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_resubscribes_and_polls_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let agent = AgentBuilder::new(test_config(&dir))
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();
    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();

    wait_for_command(&broker, &mut published, "mailbox.check").await;
    assert_eq!(broker.connect_count(), 1);

    broker.drop_connection();

    // The scheduler reconnects on its own, re-subscribes to replies and
    // polls the mailbox again.
    wait_for_command(&broker, &mut published, "mailbox.check").await;
    assert!(broker.connect_count() >= 2);
    assert!(broker
        .subscriptions()
        .iter()
        .any(|filter| filter == protocol::REPLY_TOPIC_FILTER));

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn telemetry_flows_to_the_wire_by_type() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let agent = AgentBuilder::new(test_config(&dir))
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();

    handle.telemetry().register("temperature", DataType::F64).unwrap();
    handle.telemetry().register("firmware", DataType::String).unwrap();

    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();
    wait_for_command(&broker, &mut published, "mailbox.check").await;

    handle
        .telemetry()
        .publish("temperature", TypedValue::F64(21.5), &Default::default())
        .unwrap();
    handle
        .telemetry()
        .publish(
            "firmware",
            TypedValue::String("2.1.0".to_string()),
            &Default::default(),
        )
        .unwrap();

    let property = wait_for_command(&broker, &mut published, "property.publish").await;
    assert_eq!(property["params"]["key"], "temperature");
    assert_eq!(property["params"]["value"], 21.5);
    assert_eq!(property["params"]["thingKey"], handle.thing_key());
    assert!(property["params"]["ts"].as_str().is_some());

    let attribute = wait_for_command(&broker, &mut published, "attribute.publish").await;
    assert_eq!(attribute["params"]["key"], "firmware");
    assert_eq!(attribute["params"]["value"], "2.1.0");

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_deregisters_actions_unless_persistent() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let agent = AgentBuilder::new(test_config(&dir))
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();
    handle
        .actions()
        .register(Action::callback("ping", |_| Ok(())))
        .unwrap();

    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();
    wait_for_command(&broker, &mut published, "mailbox.check").await;

    handle.shutdown();
    task.await.unwrap().unwrap();
    assert!(handle.actions().is_empty());

    // With persistent actions configured, registrations survive shutdown.
    let dir = tempfile::tempdir().unwrap();
    let (transport, broker) = LoopbackTransport::new();
    let mut config = test_config(&dir);
    config.persistent_actions = true;
    let agent = AgentBuilder::new(config)
        .with_transport(Box::new(transport))
        .build()
        .await
        .unwrap();
    let handle = agent.handle();
    handle
        .actions()
        .register(Action::callback("ping", |_| Ok(())))
        .unwrap();

    let task = tokio::spawn(agent.run());
    let mut published = Vec::new();
    wait_for_command(&broker, &mut published, "mailbox.check").await;
    handle.shutdown();
    task.await.unwrap().unwrap();
    assert_eq!(handle.actions().len(), 1);
}
