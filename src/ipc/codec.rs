//! Newline-delimited JSON framing over async byte streams

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::IpcError;

/// Serialize one message as a single line, including the trailing newline
pub fn encode<T: Serialize>(message: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(message).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, IpcError> {
    serde_json::from_str(line.trim_end()).map_err(|source| IpcError::Decode {
        line: line.trim_end().to_string(),
        source,
    })
}

/// Drain `rx` into `writer` until the channel closes or the pipe breaks.
///
/// Dropping the writer on exit closes the stream, which the peer observes
/// as end of input.
pub fn spawn_writer<W, T>(mut writer: W, mut rx: mpsc::UnboundedReceiver<T>) -> JoinHandle<Result<(), IpcError>>
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = encode(&message)?;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        writer.shutdown().await.ok();
        Ok(())
    })
}

/// Decode lines from `reader` into `tx` until end of input.
///
/// Malformed lines are logged and skipped. When the stream ends the sender is
/// dropped, closing the channel: that is the disconnect signal.
pub fn spawn_reader<R, T>(reader: R, tx: mpsc::UnboundedSender<T>) -> JoinHandle<Result<(), IpcError>>
where
    R: AsyncRead + Unpin + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            match decode::<T>(&line) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        debug!("IPC receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed IPC line"),
            }
        }

        Ok(())
    })
}
