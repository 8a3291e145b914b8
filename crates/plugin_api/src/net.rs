use thiserror::Error;
use tokio::net::TcpListener;
use tracing::trace;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },

    #[error("could not get TCP listener on {host} in {min}-{max}, maybe all ports are already used")]
    Exhausted { host: String, min: u16, max: u16 },
}

/// Binds the first free port in `[min, max]` on `host`, scanning upwards.
///
/// Both the orchestrator and every plugin draw their listener from the same
/// range this way.
pub async fn bind_in_range(host: &str, min: u16, max: u16) -> Result<(TcpListener, u16), BindError> {
    if min == 0 || min > max {
        return Err(BindError::InvalidRange { min, max });
    }
    for port in min..=max {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => trace!(%host, port, "port unavailable: {e}"),
        }
    }
    Err(BindError::Exhausted { host: host.to_string(), min, max })
}

/// Splits the host out of a `host:port` connection string, dropping the
/// brackets of an IPv6 literal.
pub fn host_of(conn_string: &str) -> Option<&str> {
    let (host, port) = conn_string.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(host.trim_start_matches('[').trim_end_matches(']'))
}

/// Formats `host` and `port` into something `TcpStream::connect` accepts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
