//! Periodic eviction and differential reporting.

use crate::device::DeviceRecord;
use crate::mac_address::MacAddress;
use crate::motion::MotionSensorTracker;
use crate::output::{LineSink, Record};
use crate::registry::{DeviceRegistry, EvictionPolicy};
use crate::sensors::{self, SensorReading};
use crate::vendor;
use std::io;
use tracing::debug;

/// Counters collected over one report pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    /// Advertisements observed since start.
    pub total: u64,
    /// Zero-RSSI advertisements dropped since start.
    pub skipped: u64,
    /// Records that survived eviction.
    pub count: usize,
    pub new: usize,
    pub remove: usize,
    pub report: usize,
    pub junk: usize,
    /// Lines sent during the cycle, before the `Stats` line itself.
    pub send: usize,
    pub omron: usize,
    pub switchbot: usize,
}

impl CycleStats {
    pub fn record(&self, param: &str) -> Record {
        Record::new("Stats")
            .field("total", self.total)
            .field("count", self.count)
            .field("new", self.new)
            .field("remove", self.remove)
            .field("report", self.report)
            .field("junk", self.junk)
            .field("send", self.send)
            .field("param", param)
    }
}

/// Outcome of [`ReportCycle::run`].
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub stats: CycleStats,
    /// Addresses evicted this cycle, in order.
    pub evicted: Vec<MacAddress>,
}

/// Report pass state carried from one tick to the next.
#[derive(Debug, Clone)]
pub struct ReportCycle {
    policy: EvictionPolicy,
    include_all: bool,
    param: String,
    watermark: i64,
}

impl ReportCycle {
    /// `param` is echoed in the `Stats` line (the adapter name).
    pub fn new(policy: EvictionPolicy, include_all: bool, param: impl Into<String>) -> Self {
        Self {
            policy,
            include_all,
            param: param.into(),
            watermark: 0,
        }
    }

    /// Time of the previous cycle, zero before the first one.
    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    fn emit_device(
        &self,
        device: &DeviceRecord,
        stats: &mut CycleStats,
        sink: &dyn LineSink,
    ) -> io::Result<()> {
        if let Some(decoded) = sensors::decode_record(device) {
            match decoded {
                Ok(reading) => {
                    match reading {
                        SensorReading::OmronEnv(_) => stats.omron += 1,
                        SensorReading::SwitchBotEnv(_) | SensorReading::SwitchBotPlugMini(_) => {
                            stats.switchbot += 1
                        }
                    }
                    sink.send(&Record::sensor(device, &reading).to_string())?;
                }
                Err(e) => {
                    debug!(address = %device.address, "sensor payload not decoded: {}", e);
                }
            }
        }
        let line = Record::device(device, &vendor::vendor_label(device)).to_string();
        debug!("{}", line);
        sink.send(&line)
    }

    /// Run one report pass at `now`.
    ///
    /// Expired records are removed first (together with their motion state),
    /// then records active since the previous watermark are reported.
    pub fn run(
        &mut self,
        now: i64,
        registry: &DeviceRegistry,
        tracker: &MotionSensorTracker,
        sink: &dyn LineSink,
        mut stats: CycleStats,
    ) -> io::Result<CycleOutcome> {
        let evicted = registry.evict(now, &self.policy);
        for address in &evicted {
            tracker.forget(address);
        }
        stats.remove = evicted.len();

        for device in registry.snapshot() {
            stats.count += 1;
            if !self.include_all && !device.is_important() {
                stats.junk += 1;
                continue;
            }
            if device.last_seen < self.watermark {
                continue;
            }
            if device.first_seen > self.watermark {
                stats.new += 1;
            }
            self.emit_device(&device, &mut stats, sink)?;
            stats.report += 1;
        }

        for (address, state) in tracker.entries() {
            if let Some(device) = registry.get(&address) {
                sink.send(&Record::motion(&device, &state, "report").to_string())?;
            }
        }

        stats.send = sink.sent();
        sink.send(&stats.record(&self.param).to_string())?;
        debug!(
            total = stats.total,
            skip = stats.skipped,
            count = stats.count,
            new = stats.new,
            remove = stats.remove,
            omron = stats.omron,
            swbot = stats.switchbot,
            send = stats.send,
            report = stats.report,
            junk = stats.junk,
            "report cycle"
        );

        sink.reset_sent();
        self.watermark = now;
        Ok(CycleOutcome { stats, evicted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::AddressType;
    use crate::sensors::switchbot::MotionFrame;
    use crate::test_utils::MemorySink;

    const T0: i64 = 1_700_000_000;

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, last])
    }

    fn named(registry: &DeviceRegistry, last: u8, name: &str, now: i64) {
        registry.upsert(mac(last), -60, now, |d, _| d.name = name.to_string());
    }

    fn cycle() -> ReportCycle {
        ReportCycle::new(EvictionPolicy::default(), false, "hci0")
    }

    fn stats_line(sink: &MemorySink) -> String {
        sink.lines()
            .into_iter()
            .rev()
            .find(|l| l.starts_with("type=Stats"))
            .unwrap()
    }

    #[test]
    fn test_stats_record() {
        let stats = CycleStats {
            total: 10,
            count: 3,
            new: 2,
            remove: 1,
            report: 2,
            junk: 1,
            send: 4,
            ..CycleStats::default()
        };
        assert_eq!(
            stats.record("hci0").to_string(),
            "type=Stats,total=10,count=3,new=2,remove=1,report=2,junk=1,send=4,param=hci0"
        );
    }

    #[test]
    fn test_reports_important_counts_junk() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        named(&registry, 1, "sensor", T0);
        registry.upsert(mac(2), -80, T0, |_, _| ());

        let mut report = cycle();
        let outcome = report.run(T0 + 1, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        assert_eq!(outcome.stats.count, 2);
        assert_eq!(outcome.stats.junk, 1);
        assert_eq!(outcome.stats.report, 1);
        assert_eq!(outcome.stats.new, 1);
        assert_eq!(outcome.stats.send, 1);

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("type=Device,address=11:22:33:44:55:01,name=sensor,"));
        assert_eq!(report.watermark(), T0 + 1);
        assert_eq!(sink.sent(), 0);
    }

    #[test]
    fn test_include_all_reports_junk() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        registry.upsert(mac(2), -80, T0, |_, _| ());

        let mut report = ReportCycle::new(EvictionPolicy::default(), true, "hci0");
        let outcome = report.run(T0, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        assert_eq!(outcome.stats.junk, 0);
        assert_eq!(outcome.stats.report, 1);
    }

    #[test]
    fn test_quiet_cycle_reports_nothing_new() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        named(&registry, 1, "a", T0);
        named(&registry, 2, "b", T0);

        let mut report = cycle();
        report.run(T0 + 600, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        sink.clear();

        let outcome = report.run(T0 + 1200, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        assert_eq!(outcome.stats.new, 0);
        assert_eq!(outcome.stats.report, 0);
        assert_eq!(outcome.stats.count, 2);
        assert!(stats_line(&sink).contains(",new=0,"));
    }

    #[test]
    fn test_device_seen_again_is_reported_but_not_new() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        named(&registry, 1, "a", T0);

        let mut report = cycle();
        report.run(T0 + 600, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        named(&registry, 1, "a", T0 + 900);

        let outcome = report.run(T0 + 1200, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        assert_eq!(outcome.stats.report, 1);
        assert_eq!(outcome.stats.new, 0);
    }

    #[test]
    fn test_eviction_forgets_motion_state() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        registry.upsert(mac(3), -60, T0, |d, _| {
            d.address_type = Some(AddressType::RandomResolvable)
        });
        tracker.observe(
            mac(3),
            MotionFrame {
                moving: true,
                elapsed_secs: 0,
                battery: 90,
                light_detected: false,
            },
        );

        let mut report = cycle();
        let outcome = report.run(T0 + 3600, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        assert_eq!(outcome.evicted, vec![mac(3)]);
        assert_eq!(outcome.stats.remove, 1);
        assert!(tracker.is_empty());
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_sensor_line_precedes_device_line() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        registry.upsert(mac(4), -55, T0, |d, _| {
            d.env_payload = vec![0x00, 0x0d, 0x54, 0x10, 0x64, 0x0d, 0x91, 0x1e];
        });

        let mut report = cycle();
        let outcome = report.run(T0, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        let lines = sink.lines();
        assert!(lines[0].starts_with("type=SwitchBotEnv,address=11:22:33:44:55:04,"));
        assert!(lines[0].ends_with("temp=18.30,hum=30.00,bat=100"));
        assert!(lines[1].starts_with("type=Device,"));
        assert_eq!(outcome.stats.switchbot, 1);
        assert_eq!(outcome.stats.send, 2);
    }

    #[test]
    fn test_undecodable_payload_only_omits_sensor_line() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        registry.upsert(mac(5), -55, T0, |d, _| {
            d.manufacturer_code = 0x0969;
            d.env_payload = vec![0x80, 0x00];
        });

        let mut report = cycle();
        report.run(T0, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("type=Device,"));
    }

    #[test]
    fn test_motion_report_lines_for_live_devices() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        named(&registry, 6, "motion", T0);
        let frame = MotionFrame {
            moving: false,
            elapsed_secs: 120,
            battery: 70,
            light_detected: true,
        };
        tracker.observe(mac(6), frame);
        tracker.observe(mac(7), frame);

        let mut report = cycle();
        report.run(T0, &registry, &tracker, &sink, CycleStats::default()).unwrap();
        let motion: Vec<_> = sink
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("type=SwitchBotMotionSensor"))
            .collect();
        assert_eq!(motion.len(), 1);
        assert!(motion[0].contains("address=11:22:33:44:55:06,"));
        assert!(motion[0].ends_with("event=report,moving=false,lastMove=120,bat=70,light=true"));
    }

    #[test]
    fn test_totals_are_carried_into_stats_line() {
        let registry = DeviceRegistry::new();
        let tracker = MotionSensorTracker::new();
        let sink = MemorySink::default();
        let stats = CycleStats {
            total: 42,
            skipped: 3,
            ..CycleStats::default()
        };
        cycle().run(T0, &registry, &tracker, &sink, stats).unwrap();
        assert_eq!(
            stats_line(&sink),
            "type=Stats,total=42,count=0,new=0,remove=0,report=0,junk=0,send=0,param=hci0"
        );
    }
}
