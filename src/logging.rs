use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    io::{self, Write},
    sync::Arc,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing(verbose: bool) {
    TRACING_INIT.get_or_init(|| {
        let default_level = if verbose { Level::DEBUG } else { Level::INFO };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy()
        });

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Line sink for the output of supervised children. Every line is tagged
/// with the child's pid and the stream it came from.
#[derive(Clone)]
pub struct ChildOutput {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ChildOutput {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn emit(&self, line: OutputLine<'_>) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let formatted = line.format(&timestamp);
        let mut guard = self.sink.lock();
        guard
            .write_all(formatted.as_bytes())
            .with_context(|| format!("writing output line for pid {}", line.pid))?;
        guard.flush().context("flushing child output")
    }
}

impl std::fmt::Debug for ChildOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildOutput").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputLine<'a> {
    pub pid: u32,
    pub stream: OutputStream,
    pub message: &'a str,
}

impl<'a> OutputLine<'a> {
    pub fn new(pid: u32, stream: OutputStream, message: &'a str) -> Self {
        Self {
            pid,
            stream,
            message,
        }
    }

    fn format(&self, timestamp: &str) -> String {
        format!(
            "{timestamp} | {pid} | {stream:<6} | {message}\n",
            timestamp = timestamp,
            pid = self.pid,
            stream = self.stream.label(),
            message = sanitize_message(self.message)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn label(self) -> &'static str {
        match self {
            OutputStream::Stdout => "STDOUT",
            OutputStream::Stderr => "STDERR",
        }
    }
}

fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect()
}
