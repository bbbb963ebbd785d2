// =============================================================================
// TLS transport to the broker gateway
// =============================================================================

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tracing::info;

use crate::error::SessionError;

pub type BrokerReadHalf = ReadHalf<TlsStream<TcpStream>>;
pub type BrokerWriteHalf = WriteHalf<TlsStream<TcpStream>>;

/// Open a TLS connection to the broker and split it into read/write halves
/// for the session's reader and writer tasks.
pub async fn connect(host: &str, port: u16) -> Result<(BrokerReadHalf, BrokerWriteHalf), SessionError> {
    let connector = native_tls::TlsConnector::new()
        .map_err(|e| SessionError::Transport(format!("TLS connector init failed: {e}")))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| SessionError::Transport(format!("TCP connect to {host}:{port} failed: {e}")))?;

    // Ticks are tiny frames; never let Nagle sit on them.
    tcp.set_nodelay(true)
        .map_err(|e| SessionError::Transport(format!("set_nodelay failed: {e}")))?;

    let tls = connector
        .connect(host, tcp)
        .await
        .map_err(|e| SessionError::Transport(format!("TLS handshake with {host} failed: {e}")))?;

    info!(host = %host, port = port, "broker TLS connection established");
    Ok(tokio::io::split(tls))
}
