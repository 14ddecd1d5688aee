//! russh-backed [`RemoteSession`].
//!
//! A russh channel delivers everything (stdout, stderr, request replies,
//! exit records) through one message queue. [`ChannelSession`] splits the
//! channel: a pump task owns the read half and fans messages out to two
//! byte streams, a reply queue and an exit-status watch, while the write
//! half stays with the session for exec, signal and close.
//!
//! The pump forwards into unbounded queues, so it never stops consuming the
//! channel because one stream's reader is slow or gone. Flow control is left
//! to the SSH window, which russh replenishes as messages are consumed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Sig, client};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::error::TransportError;
use super::transport::{OutputStream, RemoteSession};
use super::types::{ExitStatus, Signal};

/// Extended data type code for stderr in the SSH connection protocol.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

type Chunk = io::Result<Bytes>;

/// A session channel on a russh connection.
pub struct ChannelSession {
    writer: ChannelWriteHalf<client::Msg>,
    stdout: StdMutex<Option<OutputStream>>,
    stderr: StdMutex<Option<OutputStream>>,
    replies: Mutex<mpsc::UnboundedReceiver<bool>>,
    exit: watch::Receiver<Option<ExitStatus>>,
    closed: AtomicBool,
}

impl ChannelSession {
    /// Take ownership of an opened channel and start pumping its messages.
    pub(crate) fn new(channel: russh::Channel<client::Msg>) -> Self {
        let (reader, writer) = channel.split();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(pump(reader, stdout_tx, stderr_tx, reply_tx, exit_tx));

        Self {
            writer,
            stdout: StdMutex::new(Some(output_stream(stdout_rx))),
            stderr: StdMutex::new(Some(output_stream(stderr_rx))),
            replies: Mutex::new(reply_rx),
            exit: exit_rx,
            closed: AtomicBool::new(false),
        }
    }
}

/// Adapt a queue of chunks into an `AsyncRead`.
fn output_stream(mut chunks: mpsc::UnboundedReceiver<Chunk>) -> OutputStream {
    let chunks = stream::poll_fn(move |cx| chunks.poll_recv(cx));
    Box::pin(StreamReader::new(chunks))
}

fn forward(stream: &Option<mpsc::UnboundedSender<Chunk>>, data: &[u8]) {
    if let Some(tx) = stream {
        // A dropped reader just means nobody wants the rest of this stream
        let _ = tx.send(Ok(Bytes::copy_from_slice(data)));
    }
}

fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

/// Drain the read half until the channel closes.
///
/// EOF ends both streams. A channel that vanishes before EOF (connection
/// lost, handle dropped) fails whichever streams are still open.
async fn pump(
    mut reader: ChannelReadHalf,
    stdout: mpsc::UnboundedSender<Chunk>,
    stderr: mpsc::UnboundedSender<Chunk>,
    replies: mpsc::UnboundedSender<bool>,
    exit: watch::Sender<Option<ExitStatus>>,
) {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut closed_by_peer = false;

    while let Some(msg) = reader.wait().await {
        match msg {
            ChannelMsg::Data { data } => forward(&stdout, &data),
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == SSH_EXTENDED_DATA_STDERR {
                    forward(&stderr, &data);
                }
            }
            ChannelMsg::Success => {
                let _ = replies.send(true);
            }
            ChannelMsg::Failure => {
                let _ = replies.send(false);
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit.send_replace(Some(ExitStatus::Code(exit_status)));
            }
            ChannelMsg::ExitSignal {
                signal_name: signal,
                core_dumped,
                error_message,
                ..
            } => {
                exit.send_replace(Some(ExitStatus::Signal {
                    signal: signal_name(&signal),
                    core_dumped,
                    message: error_message,
                }));
            }
            ChannelMsg::Eof => {
                stdout = None;
                stderr = None;
            }
            ChannelMsg::Close => {
                closed_by_peer = true;
                break;
            }
            _ => {}
        }
    }

    if !closed_by_peer {
        debug!("Channel ended without close message");
        for tx in [stdout, stderr].into_iter().flatten() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel ended before end of stream",
            )));
        }
    }
}

#[async_trait]
impl RemoteSession for ChannelSession {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn exec(&self, command: &str) -> Result<(), TransportError> {
        self.writer.exec(true, command).await?;
        match self.replies.lock().await.recv().await {
            Some(true) => Ok(()),
            Some(false) => Err(TransportError::Rejected(format!(
                "exec request for {:?} refused",
                command
            ))),
            None => Err(TransportError::Closed),
        }
    }

    async fn wait(&self) -> Result<ExitStatus, TransportError> {
        let mut exit = self.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::Closed)?
            .clone();
        Ok(status.unwrap_or(ExitStatus::Missing))
    }

    async fn signal(&self, signal: Signal) -> Result<(), TransportError> {
        self.writer.signal(signal.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.writer.close().await?;
        Ok(())
    }
}
