//! Interactive SSH shell into a running instance.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use govm_common::{GovmError, Result};
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::Engine;
use crate::host;
use crate::terminal::{watch_resize, watch_termination, RawModeGuard, Terminal, WindowSize};

const STDIN_BUFFER: usize = 1024;
/// Reported when the remote shell dies from a signal.
const SIGNALLED_EXIT: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Eof,
}

/// One session channel on an established SSH connection.
#[async_trait]
pub trait ShellChannel: Send {
    async fn request_pty(&mut self, term: &str, size: WindowSize) -> Result<()>;
    async fn request_shell(&mut self) -> Result<()>;
    async fn window_change(&mut self, size: WindowSize) -> Result<()>;
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;
    async fn send_eof(&mut self) -> Result<()>;
    /// `None` once the channel is closed. Must be cancel safe.
    async fn next_event(&mut self) -> Option<Result<ChannelEvent>>;
}

fn transport(e: russh::Error) -> GovmError {
    GovmError::Transport(e.to_string())
}

pub struct RusshChannel {
    channel: russh::Channel<client::Msg>,
}

impl RusshChannel {
    pub fn new(channel: russh::Channel<client::Msg>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ShellChannel for RusshChannel {
    async fn request_pty(&mut self, term: &str, size: WindowSize) -> Result<()> {
        self.channel
            .request_pty(false, term, size.cols.into(), size.rows.into(), 0, 0, &[])
            .await
            .map_err(transport)
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.channel.request_shell(true).await.map_err(transport)
    }

    async fn window_change(&mut self, size: WindowSize) -> Result<()> {
        self.channel
            .window_change(size.cols.into(), size.rows.into(), 0, 0)
            .await
            .map_err(transport)
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await.map_err(transport)
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.channel.eof().await.map_err(transport)
    }

    async fn next_event(&mut self) -> Option<Result<ChannelEvent>> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(data.to_vec()),
                ChannelMsg::ExtendedData { data, ext: 1 } => ChannelEvent::Stderr(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    warn!(?signal_name, "Remote shell killed by signal");
                    ChannelEvent::ExitStatus(SIGNALLED_EXIT)
                }
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => return None,
                _ => continue,
            };
            return Some(Ok(event));
        }
    }
}

/// Guest host keys are regenerated on every boot and the guests sit on
/// private addresses, so any key is accepted.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GovmError::Auth(format!("cannot read key {}: {e}", path.display())))?;
    decode_secret_key(&contents, None)
        .map_err(|e| GovmError::Auth(format!("cannot parse key {}: {e}", path.display())))
}

/// Runs an interactive shell on `channel` until the remote side exits.
///
/// Requests a PTY matching `terminal`, switches it to raw mode and bridges
/// `stdin` to the channel and channel output to `stdout`/`stderr`. Each
/// event on `resize` becomes one window-change request. Cancelling
/// `shutdown` ends the session with [`GovmError::Interrupted`]. Raw mode is
/// restored exactly once on every exit path.
pub async fn run_session<C, R, W, E>(
    channel: &mut C,
    terminal: &dyn Terminal,
    resize: mpsc::UnboundedReceiver<()>,
    stdin: R,
    stdout: W,
    stderr: E,
    shutdown: CancellationToken,
) -> Result<u32>
where
    C: ShellChannel + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    if !terminal.is_tty() {
        return Err(GovmError::NotATty("stdin is not a terminal".to_string()));
    }

    let size = terminal.size()?;
    channel.request_pty(&terminal.term_type(), size).await?;

    let guard = RawModeGuard::enter(terminal)?;
    let result = bridge(channel, terminal, resize, stdin, stdout, stderr, shutdown).await;
    if let Err(e) = guard.restore() {
        warn!(error = %e, "Failed to restore terminal mode");
    }
    result
}

async fn bridge<C, R, W, E>(
    channel: &mut C,
    terminal: &dyn Terminal,
    mut resize: mpsc::UnboundedReceiver<()>,
    mut stdin: R,
    mut stdout: W,
    mut stderr: E,
    shutdown: CancellationToken,
) -> Result<u32>
where
    C: ShellChannel + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    channel.request_shell().await?;

    let mut buf = vec![0u8; STDIN_BUFFER];
    let mut stdin_open = true;
    let mut resize_open = true;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                return Err(GovmError::Interrupted(
                    "session terminated by signal".to_string(),
                ));
            }

            event = resize.recv(), if resize_open => match event {
                Some(()) => match terminal.size() {
                    Ok(size) => {
                        debug!(cols = size.cols, rows = size.rows, "Terminal resized");
                        channel.window_change(size).await?;
                    }
                    Err(e) => warn!(error = %e, "Could not read terminal size"),
                },
                None => resize_open = false,
            },

            event = channel.next_event() => match event {
                Some(Ok(ChannelEvent::Stdout(data))) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(Ok(ChannelEvent::Stderr(data))) => {
                    stderr.write_all(&data).await?;
                    stderr.flush().await?;
                }
                Some(Ok(ChannelEvent::ExitStatus(code))) => {
                    debug!(exit_status = code, "Remote shell exited");
                    return Ok(code);
                }
                Some(Ok(ChannelEvent::Eof)) => debug!("Remote sent EOF"),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(GovmError::Transport(
                        "channel closed without an exit status".to_string(),
                    ));
                }
            },

            read = stdin.read(&mut buf), if stdin_open => match read? {
                0 => {
                    stdin_open = false;
                    channel.send_eof().await?;
                }
                n => channel.send_data(&buf[..n]).await?,
            },
        }
    }
}

/// Opens an interactive shell on instance `id` as `user`, authenticating
/// with the private key at `key_file`. Returns the remote exit status.
#[instrument(skip(engine, terminal))]
pub async fn connect(
    engine: &Engine,
    namespace: &str,
    id: &str,
    user: &str,
    key_file: &str,
    terminal: &dyn Terminal,
) -> Result<u32> {
    let record = engine.resolve(namespace, id).await?;
    let ip = record
        .ip_address()
        .ok_or_else(|| GovmError::NotFound(format!("no IP address for {id}")))?
        .to_string();

    if !terminal.is_tty() {
        return Err(GovmError::NotATty("stdin is not a terminal".to_string()));
    }

    let key = load_private_key(&host::expand_home(key_file)).await?;

    let port = engine.config().ssh_port;
    let config = Arc::new(client::Config::default());
    let mut handle: Handle<AcceptAnyHostKey> = tokio::time::timeout(
        engine.config().ssh_timeout,
        client::connect(config, (ip.as_str(), port), AcceptAnyHostKey),
    )
    .await
    .map_err(|_| GovmError::Transport(format!("timed out connecting to {ip}:{port}")))?
    .map_err(transport)?;

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(transport)?
        .flatten();
    let auth = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(transport)?;
    if !auth.success() {
        return Err(GovmError::Auth(format!(
            "public key rejected for {user}@{ip}"
        )));
    }
    info!(%ip, %user, "SSH session established");

    let mut channel = RusshChannel::new(handle.channel_open_session().await.map_err(transport)?);

    let session_token = CancellationToken::new();
    let _stop_watchers = session_token.clone().drop_guard();
    let resize = watch_resize(session_token.child_token())?;
    watch_termination(session_token.clone())?;

    let status = run_session(
        &mut channel,
        terminal,
        resize,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
        session_token.clone(),
    )
    .await;

    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "Disconnect failed");
    }
    status
}
