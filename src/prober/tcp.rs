//! TCP check

use std::io;

use tokio::net::TcpStream;
use tracing::trace;

use super::{ProbeError, policy};

/// Open a connection to `host:port` and close it again right away.
pub(super) async fn check_tcp(
    host: &str,
    port: u16,
    allow_private: bool,
) -> Result<(), ProbeError> {
    let addrs = policy::resolve(host, port).await?;
    if !allow_private {
        policy::ensure_allowed(&addrs)?;
    }

    let stream = TcpStream::connect(&addrs[..]).await.map_err(|e| match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeError::Refused(e.to_string()),
        io::ErrorKind::TimedOut => ProbeError::Network(format!("connect timed out: {e}")),
        _ => ProbeError::Network(e.to_string()),
    })?;

    trace!("connected to {:?}", stream.peer_addr().ok());
    drop(stream);

    Ok(())
}
