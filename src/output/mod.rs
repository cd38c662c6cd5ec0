//! Report output: flat `key=value` records and the sinks they are sent to.
//!
//! Every emitted event is one newline-terminated line. Sinks count the lines
//! they accept so the report cycle can publish a per-cycle `send` figure.

pub mod record;

use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use record::{FieldValue, Record};

/// Destination for report lines.
///
/// Shared between the ingest loop and background workers, hence `&self`.
pub trait LineSink: Send + Sync {
    /// Send one line (without trailing newline).
    fn send(&self, line: &str) -> io::Result<()>;

    /// Lines accepted since the last [`LineSink::reset_sent`].
    fn sent(&self) -> usize;

    fn reset_sent(&self);
}

/// Sink writing newline-terminated lines to any writer.
#[derive(Debug)]
pub struct WriterSink<W> {
    out: Mutex<W>,
    sent: AtomicUsize,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            sent: AtomicUsize::new(0),
        }
    }
}

impl<W: Write + Send> LineSink for WriterSink<W> {
    fn send(&self, line: &str) -> io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::other("output writer poisoned"))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    fn reset_sent(&self) {
        self.sent.store(0, Ordering::Relaxed);
    }
}
