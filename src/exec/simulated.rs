//! In-process SSH peer for tests.
//!
//! Implements the [`Transport`] / [`RemoteSession`] contract without any
//! network I/O. Output travels over bounded `tokio::io::duplex` pipes, so a
//! client that stops reading one stream stalls the scripted process exactly
//! like a real peer with a full channel window.
//!
//! Scripted commands:
//!
//! | command     | behaviour                                                  |
//! |-------------|------------------------------------------------------------|
//! | `echo ARGS` | writes `ARGS\n` to stdout, exits 0                         |
//! | `sleep N`   | waits N seconds; TERM/INT/HUP/KILL end it with 128+signo   |
//! | `flood N`   | writes N KiB to stdout and stderr, interleaved, exits 0    |
//! | `fail`      | writes a diagnostic to stderr, exits 127                   |
//! | `partial`   | writes some stdout, then resets the stream, exits 0        |
//! | `vanish`    | closes without an exit record                              |
//! | `exit N`    | exits N without output                                     |
//! | other       | `command not found` on stderr, exits 127                   |

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use russh::keys::{PrivateKey, PublicKey};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use super::error::{ExecError, TransportError};
use super::transport::{OutputStream, RemoteSession, Transport};
use super::types::{ExitStatus, Signal};

/// Capacity of each simulated output pipe.
const PIPE_CAPACITY: usize = 16 * 1024;

const FLOOD_CHUNK: usize = 1024;

/// What the peer observed, for assertions.
#[derive(Debug, Default)]
pub(crate) struct PeerLog {
    opened: AtomicUsize,
    closed: AtomicUsize,
    commands: StdMutex<Vec<String>>,
    signals: StdMutex<Vec<Signal>>,
}

impl PeerLog {
    pub(crate) fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn signals(&self) -> Vec<Signal> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Default)]
struct PeerState {
    authorized: Option<PublicKey>,
    reject_sessions: bool,
    reject_exec: bool,
    close_error: Option<String>,
    dropped: AtomicBool,
    connection: CancellationToken,
    log: PeerLog,
}

/// Builder and observer for a simulated peer.
#[derive(Debug, Default)]
pub(crate) struct SimulatedPeer {
    state: Arc<PeerState>,
}

impl SimulatedPeer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn configure(mut self, f: impl FnOnce(&mut PeerState)) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            f(state);
        }
        self
    }

    /// Only this key may connect through [`SimulatedPeer::connect`].
    pub(crate) fn authorized_key(self, key: PublicKey) -> Self {
        self.configure(|s| s.authorized = Some(key))
    }

    /// Refuse every channel-open request.
    pub(crate) fn reject_sessions(self) -> Self {
        self.configure(|s| s.reject_sessions = true)
    }

    /// Reply failure to every exec request.
    pub(crate) fn reject_exec(self) -> Self {
        self.configure(|s| s.reject_exec = true)
    }

    /// Report `message` as an I/O error from every session close.
    pub(crate) fn close_error(self, message: &str) -> Self {
        let message = message.to_string();
        self.configure(|s| s.close_error = Some(message))
    }

    pub(crate) fn log(&self) -> &PeerLog {
        &self.state.log
    }

    /// A transport without authentication.
    pub(crate) fn transport(&self) -> SimulatedTransport {
        SimulatedTransport {
            state: Arc::clone(&self.state),
        }
    }

    /// Authenticate `identity` and hand out a transport.
    pub(crate) fn connect(
        &self,
        user: &str,
        identity: &PrivateKey,
    ) -> Result<SimulatedTransport, ExecError> {
        match &self.state.authorized {
            Some(key) if key.key_data() == identity.public_key().key_data() => {
                Ok(self.transport())
            }
            _ => Err(ExecError::AuthRejected {
                user: user.to_string(),
            }),
        }
    }
}

/// Client end of a simulated connection.
#[derive(Debug, Clone)]
pub(crate) struct SimulatedTransport {
    state: Arc<PeerState>,
}

impl SimulatedTransport {
    /// Sever the connection: running commands lose their streams and exit
    /// records, new sessions are refused.
    pub(crate) fn drop_connection(&self) {
        self.state.dropped.store(true, Ordering::SeqCst);
        self.state.connection.cancel();
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        if self.state.dropped.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.state.reject_sessions {
            return Err(TransportError::Rejected(
                "administratively prohibited".to_string(),
            ));
        }
        self.state.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedSession::new(Arc::clone(&self.state))))
    }
}

/// Peer side of one session, handed to the script on exec.
struct ScriptIo {
    stdout: DuplexStream,
    stderr: DuplexStream,
    stdout_reset: Arc<AtomicBool>,
    signals: mpsc::UnboundedReceiver<Signal>,
    exit: watch::Sender<Option<ExitStatus>>,
}

pub(crate) struct SimulatedSession {
    state: Arc<PeerState>,
    stdout: StdMutex<Option<OutputStream>>,
    stderr: StdMutex<Option<OutputStream>>,
    io: StdMutex<Option<ScriptIo>>,
    signals: mpsc::UnboundedSender<Signal>,
    exit: watch::Receiver<Option<ExitStatus>>,
    abort: CancellationToken,
    closed: AtomicBool,
}

impl SimulatedSession {
    fn new(state: Arc<PeerState>) -> Self {
        let (stdout_peer, stdout_client) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_peer, stderr_client) = tokio::io::duplex(PIPE_CAPACITY);
        let stdout_reset = Arc::new(AtomicBool::new(false));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let abort = state.connection.child_token();

        Self {
            stdout: StdMutex::new(Some(client_stream(
                stdout_client,
                Arc::clone(&stdout_reset),
                Arc::clone(&state),
            ))),
            stderr: StdMutex::new(Some(client_stream(
                stderr_client,
                Arc::new(AtomicBool::new(false)),
                Arc::clone(&state),
            ))),
            io: StdMutex::new(Some(ScriptIo {
                stdout: stdout_peer,
                stderr: stderr_peer,
                stdout_reset,
                signals: signal_rx,
                exit: exit_tx,
            })),
            signals: signal_tx,
            exit: exit_rx,
            abort,
            closed: AtomicBool::new(false),
            state,
        }
    }
}

/// Pipe contents followed by an error if the stream was reset or the
/// connection dropped underneath it.
fn client_stream(pipe: DuplexStream, reset: Arc<AtomicBool>, state: Arc<PeerState>) -> OutputStream {
    let tail = reset_tail(reset, state);
    Box::pin(StreamReader::new(ReaderStream::new(pipe).chain(tail)))
}

fn reset_tail(
    reset: Arc<AtomicBool>,
    state: Arc<PeerState>,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    let check = async move {
        reset.load(Ordering::SeqCst) || state.dropped.load(Ordering::SeqCst)
    };
    stream::once(check).filter_map(|reset| async move {
        reset.then(|| {
            Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset by peer",
            ))
        })
    })
}

#[async_trait]
impl RemoteSession for SimulatedSession {
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
        if self.state.dropped.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.state.reject_exec {
            return Err(TransportError::Rejected(format!(
                "exec request for {:?} refused",
                command
            )));
        }
        let io = self
            .io
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Rejected("exec already requested".to_string()))?;

        self.state
            .log
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());

        let abort = self.abort.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = run_script(&command, io) => {}
            }
        });
        Ok(())
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
        if self.state.dropped.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.state
            .log
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);
        // The script may already have exited
        let _ = self.signals.send(signal);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.log.closed.fetch_add(1, Ordering::SeqCst);
        self.abort.cancel();
        self.io.lock().unwrap_or_else(PoisonError::into_inner).take();

        if self.state.dropped.load(Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection lost",
            )));
        }
        match &self.state.close_error {
            Some(message) => Err(TransportError::Io(io::Error::other(message.clone()))),
            None => Ok(()),
        }
    }
}

fn signal_number(signal: Signal) -> u32 {
    match signal {
        Signal::Hup => 1,
        Signal::Int => 2,
        Signal::Kill => 9,
        Signal::Term => 15,
    }
}

async fn run_script(command: &str, mut io: ScriptIo) {
    let (program, args) = command.split_once(' ').unwrap_or((command, ""));
    let status = match program {
        "echo" => {
            let _ = io.stdout.write_all(format!("{}\n", args).as_bytes()).await;
            Some(0)
        }
        "sleep" => {
            let seconds = args.trim().parse::<f64>().unwrap_or(0.0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => Some(0),
                Some(signal) = io.signals.recv() => Some(128 + signal_number(signal)),
            }
        }
        "flood" => {
            let kib = args.trim().parse::<usize>().unwrap_or(0);
            let out = [b'o'; FLOOD_CHUNK];
            let err = [b'e'; FLOOD_CHUNK];
            for _ in 0..kib {
                if io.stdout.write_all(&out).await.is_err() || io.stderr.write_all(&err).await.is_err() {
                    break;
                }
            }
            Some(0)
        }
        "fail" => {
            let _ = io.stderr.write_all(b"fail: simulated failure\n").await;
            Some(127)
        }
        "partial" => {
            let _ = io.stdout.write_all(b"partial output\n").await;
            io.stdout_reset.store(true, Ordering::SeqCst);
            Some(0)
        }
        "vanish" => None,
        "exit" => Some(args.trim().parse::<u32>().unwrap_or(1)),
        _ => {
            let _ = io
                .stderr
                .write_all(format!("sh: {}: command not found\n", program).as_bytes())
                .await;
            Some(127)
        }
    };

    let ScriptIo {
        mut stdout,
        mut stderr,
        exit,
        ..
    } = io;
    let _ = stdout.shutdown().await;
    let _ = stderr.shutdown().await;
    drop((stdout, stderr));

    if let Some(code) = status {
        exit.send_replace(Some(ExitStatus::Code(code)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(stream: &mut OutputStream) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    #[tokio::test]
    async fn test_echo_follows_exec_protocol() {
        let peer = SimulatedPeer::new();
        let mut session = peer.transport().open_session().await.unwrap();
        let mut stdout = session.take_stdout().unwrap();
        let mut stderr = session.take_stderr().unwrap();
        assert!(session.take_stdout().is_none());

        session.exec("echo test").await.unwrap();

        assert_eq!(read_all(&mut stdout).await.unwrap(), b"test\n");
        assert!(read_all(&mut stderr).await.unwrap().is_empty());
        assert_eq!(session.wait().await.unwrap(), ExitStatus::Code(0));
        assert_eq!(peer.log().commands(), vec!["echo test".to_string()]);
    }

    #[tokio::test]
    async fn test_term_ends_sleep_with_143() {
        let peer = SimulatedPeer::new();
        let session = peer.transport().open_session().await.unwrap();
        session.exec("sleep 10").await.unwrap();

        session.signal(Signal::Term).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(1), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ExitStatus::Code(143));
        assert_eq!(peer.log().signals(), vec![Signal::Term]);
    }

    #[tokio::test]
    async fn test_partial_resets_stdout() {
        let peer = SimulatedPeer::new();
        let mut session = peer.transport().open_session().await.unwrap();
        let mut stdout = session.take_stdout().unwrap();
        session.exec("partial").await.unwrap();

        let err = read_all(&mut stdout).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_vanish_reports_no_status() {
        let peer = SimulatedPeer::new();
        let session = peer.transport().open_session().await.unwrap();
        session.exec("vanish").await.unwrap();
        assert!(matches!(session.wait().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let peer = SimulatedPeer::new();
        let session = peer.transport().open_session().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(peer.log().sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_refuses_sessions() {
        let peer = SimulatedPeer::new();
        let transport = peer.transport();
        transport.drop_connection();
        assert!(matches!(
            transport.open_session().await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_connect_checks_identity() {
        let client = crate::exec::auth::parse_private_key(include_str!("testdata/client_ed25519")).unwrap();
        let stranger = crate::exec::auth::parse_private_key(include_str!("testdata/stranger_ed25519")).unwrap();
        let peer = SimulatedPeer::new().authorized_key(client.public_key().clone());

        assert!(peer.connect("deploy", &client).is_ok());
        let err = peer.connect("deploy", &stranger).unwrap_err();
        assert!(matches!(err, ExecError::AuthRejected { .. }));
    }
}
