use crate::advertisement::Advertisement;
use crate::app::Scanner;
use crate::mac_address::MacAddress;
use crate::output::LineSink;
use crate::scanner::{Backend, ScanConfig, ScanError, ScanSession};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Sink keeping every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
    sent: AtomicUsize,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

impl LineSink for MemorySink {
    fn send(&self, line: &str) -> io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
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

/// Scanner replaying a fixed list of advertisements.
///
/// After the last advertisement the channel stays open for `hold`, then
/// closes. `None` keeps it open until the session is stopped.
#[derive(Debug)]
pub struct FakeScanner {
    advertisements: Mutex<Vec<Advertisement>>,
    hold: Option<Duration>,
    pub stopped: Arc<AtomicBool>,
}

impl FakeScanner {
    pub fn new(advertisements: Vec<Advertisement>) -> Self {
        Self {
            advertisements: Mutex::new(advertisements),
            hold: Some(Duration::ZERO),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn hold(mut self, hold: Option<Duration>) -> Self {
        self.hold = hold;
        self
    }
}

impl Scanner for FakeScanner {
    fn start_scan(
        &self,
        _backend: Backend,
        _config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>> {
        let advertisements = self.advertisements.lock().unwrap().clone();
        let hold = self.hold;
        let stopped = Arc::clone(&self.stopped);
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<Advertisement>(advertisements.len().max(1));
            let task = tokio::spawn(async move {
                for adv in advertisements {
                    let _ = tx.send(adv).await;
                }
                match hold {
                    Some(hold) => tokio::time::sleep(hold).await,
                    None => std::future::pending().await,
                }
                // drop tx to close channel
            });
            Ok(ScanSession::new(rx).on_stop(move || {
                task.abort();
                stopped.store(true, Ordering::SeqCst);
            }))
        })
    }
}
