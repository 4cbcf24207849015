//! Newline-delimited JSON envelopes over byte streams.
//!
//! A child process talks to its master over stdin/stdout: one [`Envelope`] per
//! line. Nothing else may be written to stdout while the transport is live,
//! so logging has to go to stderr or a file.

use async_trait::async_trait;
use tokio::io::{
    self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::message::Envelope;
use crate::transport::{Transport, TransportError};

/// Writes envelopes as JSON lines through a dedicated writer task.
#[derive(Debug, Clone)]
pub struct LineTransport {
    identity: String,
    tx: UnboundedSender<String>,
}

impl LineTransport {
    /// Spawn the writer task over `writer`. The task ends when every clone of
    /// the transport is dropped or the writer fails.
    pub fn new<W>(identity: impl Into<String>, writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = tokio::spawn(async move {
            let mut w = BufWriter::new(writer);
            while let Some(line) = rx.recv().await {
                if let Err(e) = w.write_all(line.as_bytes()).await {
                    error!("envelope write error: {e}");
                    break;
                }
                if let Err(e) = w.flush().await {
                    error!("envelope flush error: {e}");
                    break;
                }
            }
        });
        (
            Self {
                identity: identity.into(),
                tx,
            },
            handle,
        )
    }

    /// Transport bound to this process's stdout.
    pub fn stdout(identity: impl Into<String>) -> (Self, JoinHandle<()>) {
        Self::new(identity, io::stdout())
    }
}

#[async_trait]
impl Transport for LineTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        self.tx
            .send(line)
            .map_err(|_| TransportError::Closed(self.identity.clone()))
    }
}

/// Read envelopes line by line until EOF, forwarding each to `sink`.
///
/// Blank lines are skipped; lines that are not valid envelopes (including
/// lines that are not UTF-8) are logged and skipped. Returns early (without
/// error) once `sink` is closed.
pub async fn read_envelopes<R>(
    reader: R,
    sink: UnboundedSender<Envelope>,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).split(b'\n');
    while let Some(line) = lines.next_segment().await? {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Envelope>(line) {
            Ok(envelope) => {
                if sink.send(envelope).is_err() {
                    break;
                }
            }
            Err(e) => warn!("dropping malformed envelope line: {e}"),
        }
    }
    Ok(())
}

/// [`read_envelopes`] over this process's stdin.
pub async fn read_stdin(sink: UnboundedSender<Envelope>) -> Result<(), TransportError> {
    read_envelopes(io::stdin(), sink).await
}
