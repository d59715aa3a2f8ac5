//! Readiness detection over the daemon's unstructured log output
//!
//! The daemon has no structured startup protocol: it announces its control
//! API with a "starting web service ... addr=<ip:port>" log line and reports
//! startup failures as free text. [`ReadinessScanner`] turns raw output
//! chunks into [`ScanEvent`]s; [`await_ready`] drives it over a live stream.
//!
//! Chunks may split a line anywhere, so the scanner keeps the unterminated
//! tail of the previous chunk and matches against tail + chunk.

use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::BurrowError;

/// Size of each read from the daemon output
pub const CHUNK_SIZE: usize = 256;

/// Longest unterminated tail kept between chunks
const MAX_CARRY: usize = 4 * 1024;

/// The address must be followed by a non-digit so a port split across two
/// chunks is never captured truncated.
static READY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"starting web service.*?addr=(\S+:\d+)\D").expect("static regex pattern is valid")
});

static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\d{1,3}(?:\.\d{1,3}){3}|localhost|\[[0-9a-fA-F:]+\]):\d+")
        .expect("static regex pattern is valid")
});

static IN_USE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)address already in use").expect("static regex pattern is valid")
});

static SESSION_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"limited to (\d+) simultaneous \w*\s*(?:client )?session")
        .expect("static regex pattern is valid")
});

/// Classification of a chunk of daemon output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Control API is listening on this `host:port`
    Ready(String),
    /// Daemon could not bind its address
    PortInUse,
    /// Concurrent session ceiling reached
    SessionLimit(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Waiting,
    Ready,
    Failed,
}

/// Incremental matcher for the daemon's startup messages.
///
/// After the first `Ready` (or any failure) the scanner is no longer
/// authoritative and every later chunk yields `None`.
#[derive(Debug)]
pub struct ReadinessScanner {
    carry: String,
    state: ScanState,
}

impl Default for ReadinessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessScanner {
    pub fn new() -> Self {
        Self {
            carry: String::new(),
            state: ScanState::Waiting,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ScanState::Ready
    }

    /// Feed one chunk of output
    pub fn scan(&mut self, chunk: &[u8]) -> Option<ScanEvent> {
        if self.state != ScanState::Waiting {
            return None;
        }

        self.carry.push_str(&String::from_utf8_lossy(chunk));

        let event = classify(&self.carry);
        self.settle(&event);
        event
    }

    /// Signal end of output. An unterminated last line is matched as if a
    /// newline followed it.
    pub fn finish(&mut self) -> Option<ScanEvent> {
        if self.state != ScanState::Waiting || self.carry.is_empty() {
            return None;
        }

        self.carry.push('\n');
        let event = classify(&self.carry);
        self.settle(&event);
        self.carry.clear();
        event
    }

    fn settle(&mut self, event: &Option<ScanEvent>) {
        match event {
            Some(ScanEvent::Ready(_)) => {
                self.state = ScanState::Ready;
                self.carry.clear();
            }
            Some(_) => {
                self.state = ScanState::Failed;
                self.carry.clear();
            }
            None => self.trim_carry(),
        }
    }

    /// Keep only the unterminated last line, bounded in size
    fn trim_carry(&mut self) {
        if let Some(pos) = self.carry.rfind('\n') {
            self.carry.drain(..=pos);
        }
        if self.carry.len() > MAX_CARRY {
            let mut cut = self.carry.len() - MAX_CARRY;
            while !self.carry.is_char_boundary(cut) {
                cut += 1;
            }
            self.carry.drain(..cut);
        }
    }
}

/// Ready wins over failures seen in the same chunk: once the control API is
/// announced, later lines are informational.
fn classify(text: &str) -> Option<ScanEvent> {
    if let Some(addr) = READY
        .captures(text)
        .and_then(|caps| ADDRESS.find(&caps[1]).map(|m| m.as_str().to_string()))
    {
        return Some(ScanEvent::Ready(addr));
    }

    if IN_USE.is_match(text) {
        return Some(ScanEvent::PortInUse);
    }

    SESSION_LIMIT.captures(text).map(|caps| {
        let limit = caps[1].parse().unwrap_or(0);
        ScanEvent::SessionLimit(limit)
    })
}

/// Read `output` until the daemon reports readiness or a startup failure.
///
/// Returns the control API bind address. End of stream and read errors map
/// to [`BurrowError::ReadFailure`]; reads are never retried here.
pub async fn await_ready<R>(
    output: &mut R,
    cancel: &CancellationToken,
    echo: bool,
) -> Result<String, BurrowError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scanner = ReadinessScanner::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BurrowError::ReadFailure(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "readiness handshake cancelled",
                )));
            }
            read = output.read(&mut chunk) => read.map_err(BurrowError::ReadFailure)?,
        };

        if n == 0 {
            if let Some(event) = scanner.finish() {
                return outcome(event);
            }
            return Err(BurrowError::ReadFailure(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon output closed before readiness",
            )));
        }

        if echo {
            echo_chunk(&chunk[..n]);
        }

        if let Some(event) = scanner.scan(&chunk[..n]) {
            return outcome(event);
        }
    }
}

fn outcome(event: ScanEvent) -> Result<String, BurrowError> {
    match event {
        ScanEvent::Ready(addr) => {
            tracing::info!(control_addr = %addr, "Daemon control API ready");
            Ok(addr)
        }
        ScanEvent::PortInUse => {
            tracing::error!("Daemon address already in use");
            Err(BurrowError::PortInUse)
        }
        ScanEvent::SessionLimit(limit) => {
            tracing::error!(limit, "Daemon session limit reached");
            Err(BurrowError::SessionLimit { limit })
        }
    }
}

/// Keep consuming daemon output after the handshake so the pipe never fills
pub async fn drain<R>(mut output: R, echo: bool)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match output.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!("Daemon output closed");
                break;
            }
            Ok(n) => {
                if echo {
                    echo_chunk(&chunk[..n]);
                }
            }
            Err(e) => {
                tracing::debug!("Daemon output read error: {}", e);
                break;
            }
        }
    }
}

fn echo_chunk(chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    let text = text.trim_end();
    if !text.is_empty() {
        tracing::info!(target: "burrow_core::daemon", "{}", text);
    }
}
