//! Integration benchmark for the ingest and report pipeline.
//!
//! Feeds advertisements through [`Monitor`] directly and through
//! `run_with_io` with a fake scanner, the same way the app tests do.

use bluescan::advertisement::{AdElement, Advertisement};
use bluescan::app::{Monitor, Options, Scanner, run_with_io};
use bluescan::sensors::omron::OMRON_COMPANY_CODE;
use bluescan::{AddressKind, Backend, MacAddress, ScanConfig, ScanError, ScanSession, WriterSink};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const OMRON_FRAME: [u8; 18] = [
    0x01, 0xc5, 0xa9, 0x09, 0xcd, 0x1a, 0x0d, 0x00, 0x26, 0x6c, 0x0f, 0x00, 0x3d, 0x13, 0x07, 0x00,
    0xc3, 0x01,
];

const METER_FRAME: [u8; 8] = [0x00, 0x0d, 0x54, 0x10, 0x64, 0x03, 0x92, 0x2c];

fn omron_adv(mac: MacAddress) -> Advertisement {
    Advertisement::new(mac, AddressKind::Random, -60)
        .with(AdElement::Flags(0x06))
        .with(AdElement::LocalName("Rbt".to_string()))
        .with(AdElement::ManufacturerData {
            company: OMRON_COMPANY_CODE,
            payload: OMRON_FRAME.to_vec(),
        })
}

fn meter_adv(mac: MacAddress) -> Advertisement {
    Advertisement::new(mac, AddressKind::Random, -75).with(AdElement::ServiceData(METER_FRAME.to_vec()))
}

/// A mixed population of sensors and anonymous phones.
fn population(size: u8) -> Vec<Advertisement> {
    (0..size)
        .map(|i| {
            let mac = MacAddress([0xC4, 0x7C, 0x8D, 0x6A, 0x11, i]);
            match i % 3 {
                0 => omron_adv(mac),
                1 => meter_adv(mac),
                _ => Advertisement::new(MacAddress([0x5A, 0x01, 0x02, 0x03, 0x04, i]), AddressKind::Random, -90),
            }
        })
        .collect()
}

/// A fake scanner that replays advertisements and closes the stream.
struct FakeScanner {
    advertisements: Vec<Advertisement>,
}

impl Scanner for FakeScanner {
    fn start_scan(
        &self,
        _backend: Backend,
        _config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>> {
        let advertisements = self.advertisements.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<Advertisement>(advertisements.len().max(1));
            tokio::spawn(async move {
                for adv in advertisements {
                    let _ = tx.send(adv).await;
                }
            });
            Ok(ScanSession::new(rx))
        })
    }
}

/// Benchmark ingest followed by one report cycle.
fn bench_monitor_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("monitor_cycle");

    for size in [1u8, 10, 100] {
        let advertisements = population(size);
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &advertisements, |b, advs| {
            b.iter(|| {
                let sink = Arc::new(WriterSink::new(Vec::<u8>::with_capacity(256 * advs.len())));
                let mut monitor = Monitor::new(&Options::default(), sink.clone());
                for adv in advs {
                    monitor.ingest(black_box(adv), 1_700_000_000).unwrap();
                }
                black_box(monitor.report(1_700_000_060).unwrap())
            })
        });
    }

    group.finish();
}

/// Benchmark the full run loop: scanner -> decode -> registry, until the stream ends.
fn bench_run_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_loop");
    let rt = Runtime::new().unwrap();

    let advertisements = population(100);
    group.throughput(Throughput::Elements(advertisements.len() as u64));
    group.bench_function("100_devices", |b| {
        b.iter(|| {
            let scanner = FakeScanner {
                advertisements: advertisements.clone(),
            };
            let sink = Arc::new(WriterSink::new(Vec::<u8>::new()));

            rt.block_on(async {
                run_with_io(Options::default(), &scanner, sink.clone(), std::future::pending())
                    .await
                    .unwrap();
            });

            black_box(sink)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_monitor_cycle, bench_run_loop);
criterion_main!(benches);
