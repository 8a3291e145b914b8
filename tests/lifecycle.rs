// tests/lifecycle.rs
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use orchestrator::{BrokerError, Coordinator, CoordinatorConfig, OrchestratorError, State};
use plugin_api::message::InvocationRequest;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Writes an executable shell script named `name` into `dir`.
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A port window starting at a currently free port.
async fn window(width: u16) -> (u16, u16) {
    let spare = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let min = spare.local_addr().unwrap().port();
    drop(spare);
    (min, min.saturating_add(width))
}

async fn coordinator(plugins: &[PathBuf]) -> Coordinator {
    let (min, max) = window(30).await;
    Coordinator::new(CoordinatorConfig::new(plugins.to_vec(), min, max)).unwrap()
}

#[tokio::test]
async fn plugin_exiting_before_handshake_is_reported() {
    let dir = TempDir::new().unwrap();
    let crasher = script(dir.path(), "crasher", "exit 3");
    let c = coordinator(&[crasher]).await;

    let report = tokio::time::timeout(Duration::from_secs(10), c.start()).await.unwrap();
    assert_eq!(report.messages[1], "Plugin crasher could not be loaded: Plugin ended.");
    assert!(matches!(
        report.error,
        Some(OrchestratorError::Plugin { source: BrokerError::PluginEnded, .. })
    ));

    let status = &c.brokers().await[0];
    assert_eq!(status.state, State::None);
    assert_eq!(status.fail_count, 1);
    assert_eq!(status.port, 0);
    assert_eq!(status.last_error.as_deref(), Some("Plugin ended"));
}

#[tokio::test]
async fn silent_plugin_is_waited_for_until_it_ends() {
    let dir = TempDir::new().unwrap();
    let sleeper = script(dir.path(), "sleeper", "sleep 1");
    let c = coordinator(&[sleeper]).await;

    let started = std::time::Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(10), c.start()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(report.messages[1].ends_with("could not be loaded: Plugin ended."));
    assert_eq!(c.brokers().await[0].fail_count, 1);
}

#[tokio::test]
async fn plugin_receives_connection_environment() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("env.txt");
    let body = format!(
        "echo \"$ORCHESTRATOR_CONN_STRING $PLUGIN_MIN_PORT $PLUGIN_MAX_PORT\" > {}",
        dump.display()
    );
    let reporter = script(dir.path(), "reporter", &body);
    let c = coordinator(&[reporter]).await;

    c.start().await;
    let port = c.port().await.unwrap();
    let cfg = c.config();
    let seen = fs::read_to_string(&dump).unwrap();
    assert_eq!(seen.trim(), format!("127.0.0.1:{port} {} {}", cfg.min_port, cfg.max_port));
}

#[tokio::test]
async fn missing_and_unrunnable_plugins_do_not_stop_the_others() {
    let dir = TempDir::new().unwrap();
    let ghost = dir.path().join("ghost");
    let inert = dir.path().join("inert");
    fs::write(&inert, "not a program").unwrap();
    fs::set_permissions(&inert, fs::Permissions::from_mode(0o644)).unwrap();
    let crasher = script(dir.path(), "crasher", "exit 1");

    let c = coordinator(&[ghost, inert, crasher]).await;
    let report = c.start().await;

    assert_eq!(report.messages.len(), 5);
    assert!(report.messages[1].starts_with("Plugin ghost could not be loaded: plugin executable"));
    assert!(report.messages[2].starts_with("Plugin inert could not be loaded: could not start"));
    assert!(report.messages[3].starts_with("Plugin crasher could not be loaded"));
    assert_eq!(report.messages[4], "All plugins loaded");
    // first failure wins
    assert!(matches!(
        report.error,
        Some(OrchestratorError::Plugin { ref name, source: BrokerError::MissingExecutable { .. } }) if name == "ghost"
    ));
    assert!(c.brokers().await.iter().all(|s| s.state == State::None && s.fail_count == 1));
}

#[tokio::test]
async fn duplicate_names_keep_the_first_path() {
    let dir = TempDir::new().unwrap();
    let first = script(dir.path(), "twin", "exit 0");
    fs::create_dir(dir.path().join("other")).unwrap();
    let second = script(&dir.path().join("other"), "twin", "exit 0");

    let c = coordinator(&[first.clone(), second]).await;
    assert_eq!(c.registry().len(), 1);
    assert_eq!(c.registry().get("twin").unwrap().path(), first.as_path());
    let msg = c.registration_error().unwrap().to_string();
    assert!(msg.starts_with("Plugin 'twin' is already registered"), "{msg}");
}

#[tokio::test]
async fn calls_to_a_failed_plugin_are_refused() {
    let dir = TempDir::new().unwrap();
    let crasher = script(dir.path(), "crasher", "exit 0");
    let c = coordinator(&[crasher]).await;
    c.start().await;

    let err = c.invoke("crasher", &InvocationRequest::new("ping")).await.unwrap_err();
    assert_eq!(err, "Plugin not yet connected");

    // launching again counts a second failure
    let err = c.respawn("crasher").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Plugin { source: BrokerError::PluginEnded, .. }));
    assert_eq!(c.brokers().await[0].fail_count, 2);
}
