use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jsonrpc::{Id, Message, Method, Request, Response, RpcError};

/// Outbound half of a JSON-RPC connection.
///
/// Cheap to clone; every clone shares the same TCP stream. Calls may be issued
/// concurrently, responses are matched back to their caller by `id`.
#[derive(Clone, Debug)]
pub struct RpcClient {
    tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>,
}

impl RpcClient {
    /// Dial `addr` (`host:port`) and spawn the reader / writer tasks.
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await.map_err(|e| RpcError::Connect {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::from_stream(stream, addr.to_string()))
    }

    fn from_stream(stream: TcpStream, peer: String) -> Self {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<(Request, oneshot::Sender<Response>)>(32);
        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

        // track in-flight calls by encoded `id`
        let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

        // ── task that proxies rx → socket ───────────────────────────────
        {
            let inflight = Arc::clone(&inflight);
            let peer = peer.clone();
            tokio::spawn(async move {
                loop {
                    let (req, rsp_tx) = tokio::select! {
                        biased;
                        _ = &mut closed_rx => break,
                        next = rx.recv() => match next {
                            Some(next) => next,
                            None => break,
                        },
                    };
                    let line = match serde_json::to_string(&req) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(%peer, "could not encode `{}` request: {e}", req.method);
                            continue;
                        }
                    };
                    // remember responder
                    let key = req.id.as_ref().map(Id::key);
                    if let Some(key) = &key {
                        inflight.insert(key.clone(), rsp_tx);
                    }
                    let written = async {
                        write_half.write_all(line.as_bytes()).await?;
                        write_half.write_all(b"\n").await?;
                        write_half.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        debug!(%peer, "write failed: {e}");
                        if let Some(key) = key {
                            inflight.remove(&key);
                        }
                        break;
                    }
                }
                // dropping `rx` fails every queued call with `ConnectionClosed`;
                // a responder inserted after the reader's final clear goes here
                inflight.clear();
            });
        }

        // ── task that reads socket → routes Response ────────────────────
        {
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(%peer, "read failed: {e}");
                            break;
                        }
                    };
                    if line.trim().is_empty() { continue; }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Some((_, tx_rsp)) = inflight.remove(&rsp.id.key()) {
                                let _ = tx_rsp.send(rsp);
                            }
                        }
                        Ok(Message::Request(req)) => {
                            debug!(%peer, "ignoring `{}` request on a client connection", req.method);
                        }
                        Err(e) => warn!(%peer, "bad line from peer: {e}"),
                    }
                }
                let _ = closed_tx.send(());
                inflight.clear();
            });
        }

        Self { tx }
    }

    /// Send `method` with optional `params` and deserialize the result into `R`.
    pub async fn call<R>(&self, method: Method, params: Option<Value>) -> Result<R, RpcError>
    where
        R: DeserializeOwned,
    {
        let rsp = self.request(method, params).await?;
        if let Some(err) = rsp.error {
            return Err(RpcError::Remote { code: err.code, message: err.message });
        }
        Ok(serde_json::from_value(rsp.result.unwrap_or(Value::Null))?)
    }

    async fn request(&self, method: Method, params: Option<Value>) -> Result<Response, RpcError> {
        let id = Id::String(Uuid::new_v4().to_string());
        let req = Request::call(id, method, params);

        let (tx_rsp, rx_rsp) = oneshot::channel();
        self.tx
            .send((req, tx_rsp))
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;

        rx_rsp.await.map_err(|_| RpcError::ConnectionClosed)
    }
}
