#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use orchestrator::{Coordinator, CoordinatorConfig, State};
use plugin_api::message::InvocationRequest;
use serde_json::json;
use tokio::net::TcpListener;

async fn window(width: u16) -> (u16, u16) {
    let spare = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let min = spare.local_addr().unwrap().port();
    drop(spare);
    (min, min.saturating_add(width))
}

async fn wait_for_state(c: &Coordinator, wanted: State) -> bool {
    for _ in 0..100 {
        if c.brokers().await[0].state == wanted {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_plugin_lifecycle() {
    let (min, max) = window(40).await;
    let cfg = CoordinatorConfig::new([env!("CARGO_BIN_EXE_echo")], min, max);
    let c = Coordinator::new(cfg).unwrap();

    // 1) spinup
    let report = tokio::time::timeout(Duration::from_secs(20), c.start()).await.unwrap();
    assert!(report.is_ok(), "{:?}", report.messages);
    assert_eq!(report.messages[1], "Plugin echo successfully loaded.");

    let status = c.brokers().await.remove(0);
    let own_port = c.port().await.unwrap();
    assert_eq!(status.state, State::Connected);
    assert!((min..=max).contains(&status.port));
    assert_ne!(status.port, own_port);

    // 2) describe + run
    let description = c.describe("echo").await.unwrap();
    assert!(description.arguments.iter().any(|a| a.name == "series"));

    let series = c.invoke("echo", &InvocationRequest::new("ping").with_query("repeat", "2")).await.unwrap();
    assert_eq!(series[0].points[1], vec![json!(1), json!("ping")]);

    let err = c.invoke("echo", &InvocationRequest::default()).await.unwrap_err();
    assert_eq!(err, "nothing to echo, body is empty");
    assert_eq!(c.brokers().await[0].invocations, 2);

    // 3) crash detection
    let pid = status.pid.expect("running plugin has a pid");
    let killed = Command::new("kill").arg("-9").arg(pid.to_string()).status().unwrap();
    assert!(killed.success());
    assert!(wait_for_state(&c, State::None).await);

    let after = c.brokers().await.remove(0);
    assert_eq!((after.fail_count, after.port), (1, 0));
    assert_eq!(c.invoke("echo", &InvocationRequest::new("ping")).await.unwrap_err(), "Plugin not yet connected");

    // 4) relaunch on demand
    c.respawn("echo").await.unwrap();
    assert_eq!(c.brokers().await[0].state, State::Connected);
    assert!(c.invoke("echo", &InvocationRequest::new("again")).await.is_ok());

    c.shutdown().await;
    assert_eq!(c.brokers().await[0].state, State::None);
    assert_eq!(c.brokers().await[0].fail_count, 1);
}
