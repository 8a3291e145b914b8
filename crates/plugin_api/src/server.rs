use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};

use crate::jsonrpc::{
    Id, Message, Method, Request, Response, APPLICATION_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR,
};

/// Error a service hands back instead of a result.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
    #[error("method `{0}` is not served here")]
    Unsupported(Method),
}

impl ServiceError {
    fn code(&self) -> i64 {
        match self {
            ServiceError::InvalidParams(_) => INVALID_PARAMS,
            ServiceError::Failed(_) => APPLICATION_ERROR,
            ServiceError::Unsupported(_) => METHOD_NOT_FOUND,
        }
    }
}

/// Anything that can answer JSON-RPC calls on a listener.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn dispatch(&self, method: Method, params: Option<Value>) -> Result<Value, ServiceError>;
}

/// Decode `params` into `T`; absent params decode from `null`.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ServiceError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| ServiceError::InvalidParams(e.to_string()))
}

/// Accept loop: every connection is served on its own task. Runs until the
/// task is aborted.
pub async fn serve<S: RpcService>(listener: TcpListener, service: Arc<S>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted rpc connection");
                let service = Arc::clone(&service);
                tokio::spawn(serve_connection(stream, service));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        }
    }
}

/// Reads requests line by line and dispatches each on its own task; responses
/// go back through a single writer.
async fn serve_connection<S: RpcService>(stream: TcpStream, service: Arc<S>) {
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut w = BufWriter::new(write_half);
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                debug!("rpc write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                debug!("rpc flush error");
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("rpc read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() { continue; }

        match serde_json::from_str::<Message>(&line) {
            Ok(Message::Request(req)) => {
                let service = Arc::clone(&service);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(rsp) = handle_request(service.as_ref(), req).await {
                        enqueue(&tx, rsp);
                    }
                });
            }
            Ok(Message::Response(_)) => { /* ignore stray responses */ }
            Err(e) => {
                enqueue(&tx, Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string()))));
            }
        }
    }
}

/// Serialises a `Response` and sends it to the writer queue.
fn enqueue(tx: &UnboundedSender<String>, rsp: Response) {
    match serde_json::to_string(&rsp) {
        Ok(line) => {
            let _ = tx.send(format!("{line}\n"));
        }
        Err(e) => error!("could not encode response: {e}"),
    }
}

/// Returns `None` for notifications.
async fn handle_request<S: RpcService + ?Sized>(service: &S, req: Request) -> Option<Response> {
    let Request { method, params, id, .. } = req;
    let outcome = match method.parse::<Method>() {
        Ok(m) => service.dispatch(m, params).await,
        Err(_) => {
            warn!("peer asked for unknown method `{method}`");
            let id = id?;
            return Some(Response::fail(id, METHOD_NOT_FOUND, "Method not found", Some(json!(method))));
        }
    };
    let id = id?;
    Some(match outcome {
        Ok(result) => Response::success(id, result),
        Err(e) => Response::fail(id, e.code(), e.to_string(), None),
    })
}
