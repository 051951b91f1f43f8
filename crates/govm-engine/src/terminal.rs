//! Host terminal handling for interactive shell sessions.

use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};

use crossterm::terminal;
use govm_common::{GovmError, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_TERM: &str = "xterm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

/// The local terminal a session is attached to.
pub trait Terminal: Send + Sync {
    fn is_tty(&self) -> bool;
    fn size(&self) -> io::Result<WindowSize>;
    /// Value for the PTY request, from `TERM`.
    fn term_type(&self) -> String;
    fn enable_raw_mode(&self) -> io::Result<()>;
    fn disable_raw_mode(&self) -> io::Result<()>;
}

/// The process's own stdin/stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdTerminal;

impl Terminal for StdTerminal {
    fn is_tty(&self) -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }

    fn size(&self) -> io::Result<WindowSize> {
        let (cols, rows) = terminal::size()?;
        Ok(WindowSize { cols, rows })
    }

    fn term_type(&self) -> String {
        std::env::var("TERM")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TERM.to_string())
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        terminal::enable_raw_mode()
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        terminal::disable_raw_mode()
    }
}

/// Raw mode for as long as the guard lives. The previous mode is restored
/// exactly once, by `restore` or on drop (including unwinding).
pub struct RawModeGuard<'a> {
    terminal: &'a dyn Terminal,
    restored: AtomicBool,
}

impl<'a> RawModeGuard<'a> {
    pub fn enter(terminal: &'a dyn Terminal) -> Result<Self> {
        if !terminal.is_tty() {
            return Err(GovmError::NotATty("stdin is not a terminal".to_string()));
        }
        terminal.enable_raw_mode()?;
        debug!("Terminal switched to raw mode");
        Ok(Self {
            terminal,
            restored: AtomicBool::new(false),
        })
    }

    pub fn restore(&self) -> io::Result<()> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.terminal.disable_raw_mode()
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Forwards SIGWINCH as unit events until `token` is cancelled or the
/// receiver is dropped. Consumers re-query the size themselves.
pub fn watch_resize(token: CancellationToken) -> io::Result<mpsc::UnboundedReceiver<()>> {
    let mut sigwinch = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = sigwinch.recv() => match received {
                    Some(()) => {
                        if tx.send(()).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("Resize watcher stopped");
    });

    Ok(rx)
}

/// Cancels `shutdown` on SIGTERM or SIGHUP. Exits quietly once `shutdown`
/// is cancelled for any other reason.
pub fn watch_termination(shutdown: CancellationToken) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                warn!("SIGTERM received, ending session");
                shutdown.cancel();
            }
            _ = sighup.recv() => {
                warn!("SIGHUP received, ending session");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    });

    Ok(())
}
