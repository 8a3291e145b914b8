use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use plugin_api::{
    message::{Description, InvocationRequest, InvocationResponse},
    net::join_host_port,
    plugin_runtime::{ENV_CONN_STRING, ENV_MAX_PORT, ENV_MIN_PORT},
    Method, RpcClient, RpcError,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    process::{Child, Command},
    sync::{oneshot, Mutex},
};
use tracing::{debug, info, warn};

use crate::{error::BrokerError, telemetry::Telemetry};

/// Lifecycle of one plugin process, as seen from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum State {
    /// Not running: never launched, or failed / ended.
    #[default]
    None,
    /// Process spawned, waiting for its handshake.
    Started,
    /// Handshake received, dialing back.
    Handshaked,
    /// RPC client established and verified with a ping.
    Connected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::None => "None",
            State::Started => "Started",
            State::Handshaked => "Handshaked",
            State::Connected => "Connected",
        };
        f.write_str(s)
    }
}

/// Environment handed to every launched plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub conn_string: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl LaunchEnv {
    pub fn vars(&self) -> [(&'static str, String); 3] {
        [
            (ENV_CONN_STRING, self.conn_string.clone()),
            (ENV_MIN_PORT, self.min_port.to_string()),
            (ENV_MAX_PORT, self.max_port.to_string()),
        ]
    }
}

/// Point-in-time view of a broker, for display and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BrokerStatus {
    pub name: String,
    pub path: String,
    pub port: u16,
    pub state: State,
    pub fail_count: u64,
    pub invocations: u64,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PLUGIN {}", self.name)?;
        writeln!(f, "    Path:   {}", self.path)?;
        writeln!(f, "    Port:   {}", self.port)?;
        writeln!(f, "    State:  {}", self.state)?;
        writeln!(f, "    Failed: {}", self.fail_count)?;
        write!(f, "    Runs:   {}", self.invocations)?;
        if let Some(err) = &self.last_error {
            write!(f, "\n    Error:  {err}")?;
        }
        Ok(())
    }
}

type Ready = oneshot::Sender<Result<(), BrokerError>>;

#[derive(Default)]
struct Inner {
    state: State,
    port: u16,
    client: Option<RpcClient>,
    fail_count: u64,
    invocations: u64,
    /// Bumped on every launch; a failure only applies to its own launch.
    generation: u64,
    pid: Option<u32>,
    last_error: Option<String>,
    last_failure: Option<DateTime<Utc>>,
    /// Wakes the caller of `spinup`, exactly once per launch.
    ready: Option<Ready>,
    /// Dropping this kills the child.
    kill: Option<oneshot::Sender<()>>,
}

/// Owns one plugin: its process, its state and the RPC client to it.
pub struct PluginBroker {
    name: String,
    path: PathBuf,
    telemetry: Telemetry,
    inner: Mutex<Inner>,
}

impl fmt::Debug for PluginBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBroker")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PluginBroker {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, telemetry: Telemetry) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            telemetry,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    pub async fn port(&self) -> u16 {
        self.inner.lock().await.port
    }

    pub async fn fail_count(&self) -> u64 {
        self.inner.lock().await.fail_count
    }

    pub async fn invocations(&self) -> u64 {
        self.inner.lock().await.invocations
    }

    pub async fn status(&self) -> BrokerStatus {
        let inner = self.inner.lock().await;
        BrokerStatus {
            name: self.name.clone(),
            path: self.path.display().to_string(),
            port: inner.port,
            state: inner.state,
            fail_count: inner.fail_count,
            invocations: inner.invocations,
            pid: inner.pid,
            last_error: inner.last_error.clone(),
            last_failure: inner.last_failure,
        }
    }

    // ---- lifecycle ----

    /// Launch the plugin and wait until it is connected or has failed.
    pub async fn spinup(self: &Arc<Self>, env: &LaunchEnv) -> Result<(), BrokerError> {
        let ready = self.launch(env).await?;
        match ready.await {
            Ok(outcome) => outcome,
            // the waker vanished without a verdict
            Err(_) => Err(BrokerError::PluginEnded),
        }
    }

    async fn launch(
        self: &Arc<Self>,
        env: &LaunchEnv,
    ) -> Result<oneshot::Receiver<Result<(), BrokerError>>, BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.state != State::None {
            return Err(BrokerError::AlreadyLaunched(self.name.clone()));
        }

        // 1) executable must exist
        if let Err(e) = tokio::fs::metadata(&self.path).await {
            let err = BrokerError::MissingExecutable {
                path: self.path.display().to_string(),
                message: e.to_string(),
            };
            self.reset(&mut inner, &err);
            return Err(err);
        }

        // 2) spawn with the connection environment
        let child = Command::new(&self.path)
            .envs(env.vars())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let err = BrokerError::Spawn {
                    path: self.path.display().to_string(),
                    message: e.to_string(),
                };
                self.reset(&mut inner, &err);
                return Err(err);
            }
        };

        // 3) arm the waker and the kill switch, then hand the child to its watcher
        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        inner.generation += 1;
        inner.state = State::Started;
        inner.pid = child.id();
        inner.ready = Some(ready_tx);
        inner.kill = Some(kill_tx);
        let generation = inner.generation;
        drop(inner);

        info!(plugin = %self.name, path = %self.path.display(), generation, "plugin launched");
        tokio::spawn(Arc::clone(self).watch(generation, child, kill_rx));
        Ok(ready_rx)
    }

    /// Waits for the child to exit, or kills it when the switch is dropped,
    /// then reports the end of this launch.
    async fn watch(self: Arc<Self>, generation: u64, mut child: Child, mut kill: oneshot::Receiver<()>) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill => {
                debug!(plugin = %self.name, "killing plugin process");
                if let Err(e) = child.start_kill() {
                    warn!(plugin = %self.name, "could not kill plugin: {e}");
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => info!(plugin = %self.name, "plugin process exited: {status}"),
            Err(e) => warn!(plugin = %self.name, "could not wait on plugin process: {e}"),
        }
        self.fail(generation, BrokerError::PluginEnded).await;
    }

    /// Applies a failure of launch `generation`, at most once.
    async fn fail(&self, generation: u64, err: BrokerError) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state == State::None {
            debug!(plugin = %self.name, generation, "ignoring stale failure: {err}");
            return;
        }
        warn!(plugin = %self.name, "plugin failed: {err}");
        self.reset(&mut inner, &err);
    }

    /// Kills a running plugin on request. Not counted as a failure.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == State::None {
            return;
        }
        info!(plugin = %self.name, "stopping plugin");
        inner.state = State::None;
        inner.port = 0;
        inner.client = None;
        inner.pid = None;
        inner.kill.take();
        if let Some(ready) = inner.ready.take() {
            let _ = ready.send(Err(BrokerError::PluginEnded));
        }
    }

    fn reset(&self, inner: &mut Inner, err: &BrokerError) {
        inner.state = State::None;
        inner.port = 0;
        inner.client = None;
        inner.pid = None;
        inner.fail_count += 1;
        inner.last_error = Some(err.to_string());
        inner.last_failure = Some(Utc::now());
        inner.kill.take();
        if let Some(ready) = inner.ready.take() {
            let _ = ready.send(Err(err.clone()));
        }
        self.telemetry.failure(&self.name);
    }

    // ---- handshake ----

    /// Called when the plugin announced its listener on `port`. Dials back
    /// to `host:port`, verifies the link with a ping and wakes `spinup`.
    pub async fn handshake(&self, port: u16, host: &str) -> Result<bool, BrokerError> {
        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.state != State::Started {
                return Err(BrokerError::UnexpectedHandshake {
                    name: self.name.clone(),
                    state: inner.state,
                });
            }
            inner.port = port;
            inner.state = State::Handshaked;
            inner.generation
        };
        info!(plugin = %self.name, port, "handshake received");

        let addr = join_host_port(host, port);
        let client = match RpcClient::connect(&addr).await {
            Ok(client) => client,
            Err(e) => {
                let err = BrokerError::Rpc(e);
                self.fail(generation, err.clone()).await;
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.state != State::Handshaked {
                return Err(BrokerError::PluginEnded);
            }
            inner.client = Some(client);
            inner.state = State::Connected;
        }

        let verdict = match self.ping().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BrokerError::PingFailed("plugin answered false".into())),
            Err(e) => Err(BrokerError::PingFailed(e.to_string())),
        };
        if let Err(err) = verdict {
            self.fail(generation, err.clone()).await;
            return Err(err);
        }

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Err(BrokerError::PluginEnded);
        }
        if let Some(ready) = inner.ready.take() {
            let _ = ready.send(Ok(()));
        }
        drop(inner);

        self.telemetry.spinup(&self.name);
        info!(plugin = %self.name, port, "plugin connected");
        Ok(true)
    }

    // ---- calls ----

    async fn connected_client(&self) -> Result<RpcClient, BrokerError> {
        let inner = self.inner.lock().await;
        match (inner.state, &inner.client) {
            (State::Connected, Some(client)) => Ok(client.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    pub async fn ping(&self) -> Result<bool, BrokerError> {
        let client = self.connected_client().await?;
        Ok(client.call(Method::Ping, None).await?)
    }

    pub async fn describe(&self) -> Result<Description, BrokerError> {
        let client = self.connected_client().await?;
        Ok(client.call(Method::Describe, None).await?)
    }

    /// Forward one invocation; counts it when the plugin answered.
    pub async fn run(&self, request: &InvocationRequest) -> Result<InvocationResponse, BrokerError> {
        let client = self.connected_client().await?;
        let params = serde_json::to_value(request).map_err(RpcError::from)?;
        let response: InvocationResponse = client.call(Method::Run, Some(params)).await?;
        self.inner.lock().await.invocations += 1;
        self.telemetry.invocation(&self.name);
        Ok(response)
    }
}

#[cfg(test)]
impl PluginBroker {
    /// Puts the broker into `Started` without a process, as `launch` would.
    pub(crate) async fn arm_for_test(&self) -> (u64, oneshot::Receiver<Result<(), BrokerError>>) {
        let mut inner = self.inner.lock().await;
        let (ready_tx, ready_rx) = oneshot::channel();
        inner.generation += 1;
        inner.state = State::Started;
        inner.ready = Some(ready_tx);
        (inner.generation, ready_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plugin_api::{
        message::Series,
        plugin_runtime::{Exposer, PluginService},
        server::{serve, RpcService, ServiceError},
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Shout;

    /// Answers every ping with `false`.
    struct Sulky;

    #[async_trait]
    impl RpcService for Sulky {
        async fn dispatch(&self, method: Method, _params: Option<Value>) -> Result<Value, ServiceError> {
            match method {
                Method::Ping => Ok(json!(false)),
                other => Err(ServiceError::Unsupported(other)),
            }
        }
    }

    #[async_trait]
    impl Exposer for Shout {
        async fn describe(&self) -> Description {
            Description { description: "shouts".into(), author: "tests".into(), version: "1".into(), arguments: vec![] }
        }
        async fn run(&self, request: InvocationRequest) -> InvocationResponse {
            InvocationResponse::ok(vec![Series { name: request.body.to_uppercase(), ..Default::default() }])
        }
    }

    fn broker(path: &str) -> Arc<PluginBroker> {
        Arc::new(PluginBroker::new("shout", path, Telemetry::new()))
    }

    async fn plugin_listener() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, Arc::new(PluginService::new(Shout))));
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn fresh_broker_is_not_connected() {
        let b = broker("/nowhere/shout");
        assert_eq!(b.state().await, State::None);
        assert_eq!(b.describe().await.unwrap_err(), BrokerError::NotConnected);
        assert_eq!(b.ping().await.unwrap_err(), BrokerError::NotConnected);
        let err = b.run(&InvocationRequest::new("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "Plugin not yet connected");
        assert_eq!(b.invocations().await, 0);
    }

    #[tokio::test]
    async fn missing_executable_fails_spinup() {
        let b = broker("/nowhere/shout");
        let env = LaunchEnv { conn_string: "127.0.0.1:9000".into(), min_port: 9001, max_port: 9010 };
        let err = b.spinup(&env).await.unwrap_err();
        assert!(matches!(err, BrokerError::MissingExecutable { .. }), "{err}");
        assert_eq!(b.state().await, State::None);
        assert_eq!(b.fail_count().await, 1);
        assert!(b.status().await.last_failure.is_some());
    }

    #[tokio::test]
    async fn handshake_connects_and_wakes_spinup() {
        let b = broker("/nowhere/shout");
        let (_, ready) = b.arm_for_test().await;
        let port = plugin_listener().await;

        assert!(b.handshake(port, "127.0.0.1").await.unwrap());
        assert_eq!(ready.await.unwrap(), Ok(()));
        assert_eq!(b.state().await, State::Connected);
        assert_eq!(b.port().await, port);

        assert_eq!(b.describe().await.unwrap().description, "shouts");
        let rsp = b.run(&InvocationRequest::new("hey")).await.unwrap();
        assert_eq!(rsp.series[0].name, "HEY");
        assert_eq!(b.invocations().await, 1);
    }

    #[tokio::test]
    async fn handshake_outside_started_is_rejected() {
        let b = broker("/nowhere/shout");
        let port = plugin_listener().await;
        let err = b.handshake(port, "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnexpectedHandshake { state: State::None, .. }));

        b.arm_for_test().await;
        b.handshake(port, "127.0.0.1").await.unwrap();
        let other = plugin_listener().await;
        let err = b.handshake(other, "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnexpectedHandshake { state: State::Connected, .. }));
        assert_eq!(b.port().await, port);
        assert_eq!(b.state().await, State::Connected);
    }

    #[tokio::test]
    async fn unreachable_plugin_fails_handshake() {
        let b = broker("/nowhere/shout");
        let (_, ready) = b.arm_for_test().await;
        let err = b.handshake(closed_port().await, "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, BrokerError::Rpc(RpcError::Connect { .. })));

        assert!(ready.await.unwrap().is_err());
        assert_eq!(b.state().await, State::None);
        assert_eq!(b.port().await, 0);
        assert_eq!(b.fail_count().await, 1);
    }

    #[tokio::test]
    async fn handshake_with_hung_up_plugin_leaves_broker_unconnected() {
        let b = broker("/nowhere/shout");
        let (_, ready) = b.arm_for_test().await;

        // accepts the dial-back, then drops the socket
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let outcome = tokio::time::timeout(Duration::from_secs(10), b.handshake(port, "127.0.0.1")).await.unwrap();
        let err = outcome.unwrap_err();
        assert!(matches!(err, BrokerError::PingFailed(_)), "{err}");

        assert!(matches!(ready.await.unwrap(), Err(BrokerError::PingFailed(_))));
        assert_eq!(b.state().await, State::None);
        assert_eq!(b.port().await, 0);
        assert_eq!(b.fail_count().await, 1);
        assert_eq!(b.describe().await.unwrap_err(), BrokerError::NotConnected);
    }

    #[tokio::test]
    async fn handshake_with_refused_ping_leaves_broker_unconnected() {
        let b = broker("/nowhere/shout");
        let (_, ready) = b.arm_for_test().await;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, Arc::new(Sulky)));

        let err = b.handshake(port, "127.0.0.1").await.unwrap_err();
        assert_eq!(err, BrokerError::PingFailed("plugin answered false".into()));
        assert!(ready.await.unwrap().is_err());
        assert_eq!(b.state().await, State::None);
        assert_eq!(b.port().await, 0);
        assert_eq!(b.fail_count().await, 1);
    }

    #[tokio::test]
    async fn failure_applies_once_per_launch() {
        let b = broker("/nowhere/shout");
        let (first, _ready) = b.arm_for_test().await;
        b.fail(first, BrokerError::PluginEnded).await;
        b.fail(first, BrokerError::PluginEnded).await;
        assert_eq!(b.fail_count().await, 1);

        // a late report from the first launch must not touch the second
        let (second, _ready) = b.arm_for_test().await;
        b.fail(first, BrokerError::PluginEnded).await;
        assert_eq!(b.state().await, State::Started);
        b.fail(second, BrokerError::PluginEnded).await;
        assert_eq!(b.state().await, State::None);
        assert_eq!(b.fail_count().await, 2);
    }

    #[tokio::test]
    async fn spinup_refuses_a_running_broker() {
        let b = broker("/nowhere/shout");
        b.arm_for_test().await;
        let env = LaunchEnv { conn_string: "127.0.0.1:9000".into(), min_port: 9001, max_port: 9010 };
        let err = b.spinup(&env).await.unwrap_err();
        assert_eq!(err, BrokerError::AlreadyLaunched("shout".into()));
        assert_eq!(b.fail_count().await, 0);
    }

    #[tokio::test]
    async fn stop_is_not_a_failure() {
        let b = broker("/nowhere/shout");
        let (generation, ready) = b.arm_for_test().await;
        b.stop().await;
        assert_eq!(ready.await.unwrap(), Err(BrokerError::PluginEnded));
        assert_eq!(b.state().await, State::None);

        // the watcher's report after the kill is stale
        b.fail(generation, BrokerError::PluginEnded).await;
        assert_eq!(b.fail_count().await, 0);
    }

    #[tokio::test]
    async fn status_renders_as_table() {
        let b = broker("./bin/shout");
        let text = b.status().await.to_string();
        assert!(text.starts_with("PLUGIN shout\n"));
        assert!(text.contains("State:  None"));
        assert!(text.contains("Path:   ./bin/shout"));
    }
}
