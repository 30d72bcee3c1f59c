//! Minimal QMP client: newline-delimited JSON over the hypervisor's control
//! socket.
//!
//! The exchange is strictly lock-step: greeting, `qmp_capabilities` and its
//! acknowledgement, then one response line per command. Every read is bounded
//! by a short timeout.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::NidoError;
use crate::platform::ControlEndpoint;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Any bidirectional byte stream the client can run over.
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

pub struct QmpClient<S> {
    stream: BufReader<S>,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> QmpClient<S> {
    /// Read the greeting and negotiate capabilities.
    pub async fn handshake(stream: S, timeout: Duration) -> Result<Self, NidoError> {
        let mut client = Self {
            stream: BufReader::new(stream),
            timeout,
        };
        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(NidoError::ControlSocket {
                message: format!("unexpected greeting: {greeting}"),
            });
        }
        client.execute(&json!({ "execute": "qmp_capabilities" })).await?;
        Ok(client)
    }

    /// Send one command and read exactly one response line.
    pub async fn execute(&mut self, command: &Value) -> Result<Value, NidoError> {
        let mut line = command.to_string();
        line.push('\n');
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| NidoError::ControlSocket {
                message: format!("write failed: {e}"),
            })?;

        let reply = self.read_message().await?;
        if let Some(err) = reply.get("error") {
            return Err(NidoError::ControlSocket {
                message: format!("error response: {err}"),
            });
        }
        Ok(reply)
    }

    /// Press and release one key, named by its QEMU qcode (e.g. `ret`).
    pub async fn send_key(&mut self, qcode: &str) -> Result<(), NidoError> {
        self.execute(&json!({
            "execute": "send-key",
            "arguments": { "keys": [{ "type": "qcode", "data": qcode }] },
        }))
        .await
        .map(|_| ())
    }

    /// Ask the guest to power off via ACPI.
    pub async fn system_powerdown(&mut self) -> Result<(), NidoError> {
        self.execute(&json!({ "execute": "system_powerdown" }))
            .await
            .map(|_| ())
    }

    async fn read_message(&mut self) -> Result<Value, NidoError> {
        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.stream.read_line(&mut line))
            .await
            .map_err(|_| NidoError::ControlSocket {
                message: "timed out waiting for response".into(),
            })?
            .map_err(|e| NidoError::ControlSocket {
                message: format!("read failed: {e}"),
            })?;
        if read == 0 {
            return Err(NidoError::ControlSocket {
                message: "connection closed".into(),
            });
        }
        serde_json::from_str(&line).map_err(|e| NidoError::ControlSocket {
            message: format!("malformed response: {e}"),
        })
    }
}

/// Dial the endpoint and complete the handshake. A socket that is not open
/// yet is an error the caller is expected to shrug off.
pub async fn connect(
    endpoint: &ControlEndpoint,
    timeout: Duration,
) -> Result<QmpClient<Box<dyn ControlStream>>, NidoError> {
    let dial = async {
        let stream: Box<dyn ControlStream> = match endpoint {
            #[cfg(unix)]
            ControlEndpoint::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            ControlEndpoint::Unix(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this host",
                ));
            }
            ControlEndpoint::Tcp(port) => {
                Box::new(tokio::net::TcpStream::connect(("127.0.0.1", *port)).await?)
            }
        };
        Ok::<_, std::io::Error>(stream)
    };

    let stream = tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| NidoError::ControlSocket {
            message: format!("timed out connecting to {endpoint}"),
        })?
        .map_err(|e| NidoError::ControlSocket {
            message: format!("cannot connect to {endpoint}: {e}"),
        })?;

    QmpClient::handshake(stream, timeout).await
}
