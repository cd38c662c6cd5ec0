//! Core application runner for `bluescan`.
//!
//! This module is intentionally decoupled from process setup (logging,
//! signals, exit codes) so the ingest loop can be tested deterministically
//! with an injected scanner, sink and shutdown future.

use crate::advertisement::Advertisement;
use crate::beacon::BeaconWorkers;
use crate::decoder::AdvertisementDecoder;
use crate::motion::MotionSensorTracker;
use crate::output::{LineSink, Record};
use crate::registry::{
    DEFAULT_EPHEMERAL_WINDOW, DEFAULT_IMPORTANT_WINDOW, DeviceRegistry, EvictionPolicy,
};
use crate::report::{CycleStats, ReportCycle};
use crate::scanner::{Backend, ScanConfig, ScanError, ScanSession};
use clap::Parser;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Time given to beacon workers to finish at shutdown.
pub const WORKER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Passive BLE monitor emitting periodic device and sensor reports.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth adapter to monitor (hciN).
    #[arg(long, env = "BLUESCAN_ADAPTER", default_value = "hci0", value_parser = crate::scanner::parse_adapter)]
    pub adapter: String,

    /// Report interval.
    /// Accepts duration with suffix: 30s, 10m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, env = "BLUESCAN_INTERVAL", default_value = "600s", value_parser = parse_interval)]
    pub interval: Duration,

    /// Silence window before a device without name, fixed address or
    /// sensor payload is forgotten.
    #[arg(long, env = "BLUESCAN_EPHEMERAL_WINDOW", default_value = "910s", value_parser = parse_duration)]
    pub ephemeral_window: Duration,

    /// Silence window before any other device is forgotten.
    #[arg(long, env = "BLUESCAN_IMPORTANT_WINDOW", default_value = "48h", value_parser = parse_duration)]
    pub important_window: Duration,

    /// Report every address, including anonymous ones.
    #[arg(long, env = "BLUESCAN_ALL")]
    pub all: bool,

    /// Active scan mode (request scan responses).
    #[arg(long, env = "BLUESCAN_ACTIVE")]
    pub active: bool,

    /// Classify newly seen devices as iBeacon / Eddystone.
    #[arg(long, env = "BLUESCAN_BEACONS")]
    pub beacons: bool,

    /// Maximum number of concurrently running beacon classifiers.
    #[arg(long, env = "BLUESCAN_BEACON_WORKERS", default_value_t = 4)]
    pub beacon_workers: usize,

    /// Debug logging of decode failures and unrecognized data
    #[arg(short = 'v', long = "verbose", visible_alias = "debug", env = "BLUESCAN_DEBUG")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, env = "BLUESCAN_BACKEND", default_value_t, value_enum)]
    pub backend: Backend,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            interval: Duration::from_secs(600),
            ephemeral_window: DEFAULT_EPHEMERAL_WINDOW,
            important_window: DEFAULT_IMPORTANT_WINDOW,
            all: false,
            active: false,
            beacons: false,
            beacon_workers: 4,
            verbose: false,
            backend: Backend::default(),
        }
    }
}

impl Options {
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            adapter: self.adapter.clone(),
            active: self.active,
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            ephemeral_window: self.ephemeral_window,
            important_window: self.important_window,
        }
    }
}

/// Parse a duration string with optional unit suffix.
///
/// Supported formats:
/// - `500ms` - milliseconds
/// - `3s` - seconds
/// - `1m` - minutes
/// - `2h` - hours
/// - `10` - seconds (no suffix)
///
/// # Examples
///
/// ```
/// use bluescan::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let units: [(&str, fn(u64) -> Duration, &str); 4] = [
        ("ms", Duration::from_millis, "milliseconds"),
        ("h", |n| Duration::from_secs(n.saturating_mul(3600)), "hours"),
        ("m", |n| Duration::from_secs(n.saturating_mul(60)), "minutes"),
        ("s", Duration::from_secs, "seconds"),
    ];
    for (suffix, make, unit) in units {
        if let Some(num) = src.strip_suffix(suffix) {
            let n: u64 = num
                .trim()
                .parse()
                .map_err(|_| format!("invalid {}: {}", unit, num))?;
            return Ok(make(n));
        }
    }

    src.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("invalid duration: {}", src))
}

/// Like [`parse_duration`], refusing zero.
pub fn parse_interval(src: &str) -> Result<Duration, String> {
    match parse_duration(src)? {
        d if d.is_zero() => Err("interval must be greater than zero".to_string()),
        d => Ok(d),
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>> {
        Box::pin(async move { crate::scanner::start_scan(backend, &config).await })
    }
}

/// What [`Monitor::ingest`] did with an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Zero RSSI, dropped before decoding.
    Skipped,
    Created,
    Updated,
}

/// Device state plus everything needed to fold advertisements into it and
/// report on it.
pub struct Monitor {
    registry: Arc<DeviceRegistry>,
    decoder: AdvertisementDecoder,
    report: ReportCycle,
    sink: Arc<dyn LineSink>,
    total: u64,
    skipped: u64,
}

impl Monitor {
    pub fn new(options: &Options, sink: Arc<dyn LineSink>) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            decoder: AdvertisementDecoder::new(Arc::new(MotionSensorTracker::new())),
            report: ReportCycle::new(options.eviction_policy(), options.all, options.adapter.clone()),
            sink,
            total: 0,
            skipped: 0,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<MotionSensorTracker> {
        self.decoder.tracker()
    }

    /// Advertisements observed and zero-RSSI advertisements dropped.
    pub fn counters(&self) -> (u64, u64) {
        (self.total, self.skipped)
    }

    /// Fold one advertisement into the registry at `now` (unix seconds).
    ///
    /// Motion sensor `new` and `change` events are sent to the sink
    /// immediately.
    pub fn ingest(&mut self, adv: &Advertisement, now: i64) -> io::Result<Ingested> {
        if adv.rssi == 0 {
            self.skipped += 1;
            return Ok(Ingested::Skipped);
        }
        self.total += 1;

        let decoder = &self.decoder;
        let (created, motion_line) = self.registry.upsert(adv.address, adv.rssi, now, |record, created| {
            let line = decoder
                .decode(adv, record)
                .and_then(|event| event.line_event())
                .and_then(|event| {
                    let state = decoder.tracker().get(&record.address)?;
                    Some(Record::motion(record, &state, event).to_string())
                });
            (created, line)
        });

        if let Some(line) = motion_line {
            self.sink.send(&line)?;
        }
        if created {
            debug!(address = %adv.address, rssi = adv.rssi, "new device");
            Ok(Ingested::Created)
        } else {
            Ok(Ingested::Updated)
        }
    }

    /// Run one report cycle at `now` (unix seconds).
    pub fn report(&mut self, now: i64) -> io::Result<CycleStats> {
        let stats = CycleStats {
            total: self.total,
            skipped: self.skipped,
            ..CycleStats::default()
        };
        let outcome = self.report.run(
            now,
            &self.registry,
            self.decoder.tracker(),
            self.sink.as_ref(),
            stats,
        )?;
        for address in &outcome.evicted {
            self.decoder.forget(address);
        }
        Ok(outcome.stats)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Run the ingest loop until the scan ends or `shutdown` completes.
///
/// - Advertisements are folded into the registry as they arrive.
/// - Every `options.interval` a report cycle sends device, sensor and stats lines to `sink`.
/// - On exit the scan session is stopped and beacon workers are drained.
pub async fn run_with_io(
    options: Options,
    scanner: &dyn Scanner,
    sink: Arc<dyn LineSink>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let mut session = scanner
        .start_scan(options.backend, options.scan_config())
        .await?;
    info!(backend = %options.backend, adapter = %options.adapter, "scan started");

    let mut monitor = Monitor::new(&options, Arc::clone(&sink));
    let mut workers = options.beacons.then(|| {
        BeaconWorkers::new(
            Arc::clone(monitor.registry()),
            Arc::clone(&sink),
            options.beacon_workers,
        )
    });

    let mut ticker = tokio::time::interval_at(Instant::now() + options.interval, options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            adv = session.advertisements.recv() => {
                let Some(adv) = adv else {
                    info!("advertisement stream closed");
                    break Ok(());
                };
                match monitor.ingest(&adv, unix_now()) {
                    Ok(Ingested::Created) => {
                        if let Some(workers) = workers.as_mut() {
                            workers.spawn(adv);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => break Err(e.into()),
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = monitor.report(unix_now()) {
                    break Err(e.into());
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break Ok(());
            }
        }
    };

    session.stop();
    if let Some(workers) = workers {
        workers.drain(WORKER_DRAIN_GRACE).await;
    }
    result
}
