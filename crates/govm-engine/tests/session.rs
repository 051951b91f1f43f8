//! Shell session loop with a scripted channel and a fake terminal.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use govm_common::{GovmError, Result};
use govm_engine::session::{run_session, ChannelEvent, ShellChannel};
use govm_engine::terminal::{Terminal, WindowSize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SIZE: WindowSize = WindowSize { cols: 120, rows: 40 };

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelCall {
    Pty { term: String, size: WindowSize },
    Shell,
    WindowChange(WindowSize),
    Data(Vec<u8>),
    Eof,
}

#[derive(Default)]
struct MockChannel {
    events: VecDeque<Result<ChannelEvent>>,
    calls: Vec<ChannelCall>,
    /// Hold events back until stdin reaches EOF
    release_on_eof: bool,
    eof_sent: bool,
}

impl MockChannel {
    fn with_events(events: Vec<Result<ChannelEvent>>) -> Self {
        Self {
            events: events.into(),
            ..Default::default()
        }
    }

    fn window_changes(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, ChannelCall::WindowChange(_)))
            .count()
    }
}

#[async_trait]
impl ShellChannel for MockChannel {
    async fn request_pty(&mut self, term: &str, size: WindowSize) -> Result<()> {
        self.calls.push(ChannelCall::Pty {
            term: term.to_string(),
            size,
        });
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.calls.push(ChannelCall::Shell);
        Ok(())
    }

    async fn window_change(&mut self, size: WindowSize) -> Result<()> {
        self.calls.push(ChannelCall::WindowChange(size));
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.calls.push(ChannelCall::Data(data.to_vec()));
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.calls.push(ChannelCall::Eof);
        self.eof_sent = true;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Result<ChannelEvent>> {
        if self.release_on_eof && !self.eof_sent {
            return std::future::pending().await;
        }
        self.events.pop_front()
    }
}

#[derive(Default)]
struct MockTerminal {
    not_a_tty: bool,
    raw_enabled: AtomicUsize,
    raw_restored: AtomicUsize,
}

impl MockTerminal {
    fn restored(&self) -> usize {
        self.raw_restored.load(Ordering::SeqCst)
    }
}

impl Terminal for MockTerminal {
    fn is_tty(&self) -> bool {
        !self.not_a_tty
    }

    fn size(&self) -> io::Result<WindowSize> {
        Ok(SIZE)
    }

    fn term_type(&self) -> String {
        "xterm-256color".to_string()
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        self.raw_enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        self.raw_restored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A resize stream with `n` queued notifications and a closed producer.
fn resizes(n: usize) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    for _ in 0..n {
        tx.send(()).unwrap();
    }
    rx
}

async fn run(
    channel: &mut MockChannel,
    terminal: &MockTerminal,
    resize: mpsc::UnboundedReceiver<()>,
    stdin: &[u8],
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
    shutdown: CancellationToken,
) -> Result<u32> {
    run_session(channel, terminal, resize, stdin, stdout, stderr, shutdown).await
}

#[tokio::test]
async fn test_one_window_change_per_resize() {
    let mut channel = MockChannel::with_events(vec![
        Ok(ChannelEvent::Stdout(b"welcome\r\n".to_vec())),
        Ok(ChannelEvent::ExitStatus(0)),
    ]);
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());

    let status = run(
        &mut channel,
        &terminal,
        resizes(3),
        b"",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(status, 0);
    assert_eq!(channel.window_changes(), 3);
    assert!(channel
        .calls
        .iter()
        .filter(|c| matches!(c, ChannelCall::WindowChange(_)))
        .all(|c| *c == ChannelCall::WindowChange(SIZE)));
    assert_eq!(out, b"welcome\r\n");
    assert_eq!(terminal.restored(), 1);
}

#[tokio::test]
async fn test_no_resize_no_window_change() {
    let mut channel = MockChannel::with_events(vec![Ok(ChannelEvent::ExitStatus(0))]);
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());

    run(
        &mut channel,
        &terminal,
        resizes(0),
        b"",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(channel.window_changes(), 0);
    assert_eq!(
        channel.calls[0],
        ChannelCall::Pty {
            term: "xterm-256color".to_string(),
            size: SIZE,
        }
    );
    assert_eq!(channel.calls[1], ChannelCall::Shell);
}

#[tokio::test]
async fn test_non_zero_exit_status_is_returned() {
    let mut channel = MockChannel::with_events(vec![
        Ok(ChannelEvent::Stderr(b"bash: nope: command not found\r\n".to_vec())),
        Ok(ChannelEvent::Eof),
        Ok(ChannelEvent::ExitStatus(127)),
    ]);
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());

    let status = run(
        &mut channel,
        &terminal,
        resizes(0),
        b"",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(status, 127);
    assert!(out.is_empty());
    assert!(err.starts_with(b"bash: nope"));
    assert_eq!(terminal.restored(), 1);
}

#[tokio::test]
async fn test_channel_error_restores_terminal_once() {
    let mut channel = MockChannel::with_events(vec![Err(GovmError::Transport(
        "connection reset".to_string(),
    ))]);
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());

    let result = run(
        &mut channel,
        &terminal,
        resizes(1),
        b"",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(GovmError::Transport(_))));
    assert_eq!(terminal.raw_enabled.load(Ordering::SeqCst), 1);
    assert_eq!(terminal.restored(), 1);
}

#[tokio::test]
async fn test_closed_channel_without_status_is_an_error() {
    let mut channel = MockChannel::with_events(vec![Ok(ChannelEvent::Eof)]);
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());

    let result = run(
        &mut channel,
        &terminal,
        resizes(0),
        b"",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(GovmError::Transport(_))));
    assert_eq!(terminal.restored(), 1);
}

#[tokio::test]
async fn test_stdin_is_forwarded_then_eof() {
    let mut channel = MockChannel::with_events(vec![
        Ok(ChannelEvent::Stdout(b"file.txt\r\n".to_vec())),
        Ok(ChannelEvent::ExitStatus(0)),
    ]);
    channel.release_on_eof = true;
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());

    let status = run(
        &mut channel,
        &terminal,
        resizes(0),
        b"ls\n",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(status, 0);
    assert_eq!(
        channel.calls[2..],
        [ChannelCall::Data(b"ls\n".to_vec()), ChannelCall::Eof]
    );
    assert_eq!(out, b"file.txt\r\n");
}

#[tokio::test]
async fn test_not_a_tty_fails_before_any_request() {
    let mut channel = MockChannel::with_events(vec![Ok(ChannelEvent::ExitStatus(0))]);
    let terminal = MockTerminal {
        not_a_tty: true,
        ..Default::default()
    };
    let (mut out, mut err) = (Vec::new(), Vec::new());

    let result = run(
        &mut channel,
        &terminal,
        resizes(0),
        b"",
        &mut out,
        &mut err,
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(GovmError::NotATty(_))));
    assert!(channel.calls.is_empty());
    assert_eq!(terminal.raw_enabled.load(Ordering::SeqCst), 0);
    assert_eq!(terminal.restored(), 0);
}

#[tokio::test]
async fn test_termination_signal_interrupts_session() {
    let mut channel = MockChannel::with_events(vec![Ok(ChannelEvent::ExitStatus(0))]);
    let terminal = MockTerminal::default();
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = run(
        &mut channel,
        &terminal,
        resizes(2),
        b"",
        &mut out,
        &mut err,
        shutdown,
    )
    .await;

    assert!(matches!(result, Err(GovmError::Interrupted(_))));
    assert_eq!(channel.window_changes(), 0);
    assert_eq!(terminal.restored(), 1);
}
