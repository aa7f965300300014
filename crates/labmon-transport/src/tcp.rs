//! Persistent TCP text transport.
//!
//! One TCP connection per session, opened on connect and reused for every
//! command until the session is closed. Commands go out newline-terminated;
//! replies are read up to the next newline. Every operation runs under the
//! configured deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use labmon_core::{TransportError, TransportErrorKind};

use crate::address::InstrumentAddress;
use crate::pool::TransportFactory;
use crate::Transport;

#[derive(Debug)]
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// TCP session speaking the line-oriented text protocol.
#[derive(Debug)]
pub struct TcpTextTransport {
    address: InstrumentAddress,
    deadline: Duration,
    // One in-flight request per session; the lock covers the full
    // send-then-read exchange so replies cannot interleave.
    connection: Mutex<Option<Connection>>,
}

impl TcpTextTransport {
    /// Open a session. Connect failures and connect timeouts both map to
    /// `Unreachable`.
    pub async fn connect(
        address: InstrumentAddress,
        deadline: Duration,
    ) -> Result<Self, TransportError> {
        let stream = timeout(deadline, TcpStream::connect(address.socket_addr()))
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Unreachable,
                    address.to_string(),
                    format!("connect timed out after {:?}", deadline),
                )
            })?
            .map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Unreachable,
                    address.to_string(),
                    e.to_string(),
                )
            })?;

        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        tracing::debug!(address = %address, "transport session opened");

        Ok(Self {
            address,
            deadline,
            connection: Mutex::new(Some(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
            })),
        })
    }

    fn closed_error(&self) -> TransportError {
        TransportError::new(
            TransportErrorKind::Unreachable,
            self.address.to_string(),
            "session is closed",
        )
    }

    fn timeout_error(&self, what: &str) -> TransportError {
        TransportError::new(
            TransportErrorKind::Timeout,
            self.address.to_string(),
            format!("{} timed out after {:?}", what, self.deadline),
        )
    }

    async fn send_line(
        &self,
        connection: &mut Connection,
        command: &str,
    ) -> Result<(), TransportError> {
        let mut line = command.as_bytes().to_vec();
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        timeout(self.deadline, async {
            connection.writer.write_all(&line).await?;
            connection.writer.flush().await
        })
        .await
        .map_err(|_| self.timeout_error("write"))?
        .map_err(|e| {
            TransportError::new(
                TransportErrorKind::Protocol,
                self.address.to_string(),
                e.to_string(),
            )
        })
    }
}

#[async_trait]
impl Transport for TcpTextTransport {
    async fn query(&self, command: &str) -> Result<String, TransportError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or_else(|| self.closed_error())?;

        self.send_line(connection, command).await?;

        let mut reply = String::new();
        let read = timeout(self.deadline, connection.reader.read_line(&mut reply))
            .await
            .map_err(|_| self.timeout_error("read"))?
            .map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Protocol,
                    self.address.to_string(),
                    e.to_string(),
                )
            })?;

        if read == 0 {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                self.address.to_string(),
                "connection closed before reply",
            ));
        }

        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn write(&self, command: &str) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.send_line(connection, command).await
    }

    async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            connection.writer.shutdown().await.ok();
            tracing::debug!(address = %self.address, "transport session closed");
        }
    }

    fn address(&self) -> &InstrumentAddress {
        &self.address
    }
}

/// Factory producing TCP sessions with a shared deadline.
#[derive(Clone)]
pub struct TcpTransportFactory {
    deadline: Duration,
}

impl TcpTransportFactory {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn connect(
        &self,
        address: &InstrumentAddress,
    ) -> Result<std::sync::Arc<dyn Transport>, TransportError> {
        let transport = TcpTextTransport::connect(address.clone(), self.deadline).await?;
        Ok(std::sync::Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn spawn_echo_instrument() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.ends_with('?') {
                            let reply = format!("reply:{}\n", line.trim_end_matches('?'));
                            if write_half.write_all(reply.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn query_round_trip_over_loopback() {
        let addr = spawn_echo_instrument().await;
        let address: InstrumentAddress =
            format!("127.0.0.1:{}/inst0", addr.port()).parse().unwrap();
        let transport = TcpTextTransport::connect(address, Duration::from_secs(2))
            .await
            .unwrap();

        let reply = transport.query("MEAS:VOLT?").await.unwrap();
        assert_eq!(reply, "reply:MEAS:VOLT");

        // Plain writes are fire-and-forget.
        transport.write("OUTP ON").await.unwrap();

        // The connection persists across commands.
        let reply = transport.query("MEAS:CURR?").await.unwrap();
        assert_eq!(reply, "reply:MEAS:CURR");

        transport.close().await;
        let err = transport.query("MEAS:VOLT?").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_unreachable() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let address: InstrumentAddress = format!("127.0.0.1:{}", port).parse().unwrap();
        let err = TcpTextTransport::connect(address, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn silent_peer_times_out_on_query() {
        // A listener that accepts but never replies.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let address: InstrumentAddress =
            format!("127.0.0.1:{}", addr.port()).parse().unwrap();
        let transport = TcpTextTransport::connect(address, Duration::from_millis(200))
            .await
            .unwrap();
        let err = transport.query("SLOW?").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Timeout);
    }
}
