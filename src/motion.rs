//! Edge-triggered state for motion sensors.

use crate::mac_address::MacAddress;
use crate::sensors::switchbot::MotionFrame;
use dashmap::DashMap;

/// Outcome of folding one motion frame into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    /// First frame for the address.
    New,
    /// `moving` flipped relative to the stored state.
    Change,
    Unchanged,
}

impl MotionEvent {
    /// `event` field value of the line announcing this outcome, if any.
    pub fn line_event(&self) -> Option<&'static str> {
        match self {
            MotionEvent::New => Some("new"),
            MotionEvent::Change => Some("change"),
            MotionEvent::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionState {
    pub moving: bool,
    /// Seconds since the last detected motion, as of the latest frame.
    pub last_move_elapsed: u32,
    pub battery: u8,
    pub light_detected: bool,
}

impl From<MotionFrame> for MotionState {
    fn from(frame: MotionFrame) -> Self {
        Self {
            moving: frame.moving,
            last_move_elapsed: frame.elapsed_secs,
            battery: frame.battery,
            light_detected: frame.light_detected,
        }
    }
}

/// Motion state per address.
///
/// Entries are dropped only when the owning device record is evicted.
#[derive(Debug, Default)]
pub struct MotionSensorTracker {
    states: DashMap<MacAddress, MotionState>,
}

impl MotionSensorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, address: MacAddress, frame: MotionFrame) -> MotionEvent {
        let next = MotionState::from(frame);
        match self.states.insert(address, next) {
            None => MotionEvent::New,
            Some(prev) if prev.moving != next.moving => MotionEvent::Change,
            Some(_) => MotionEvent::Unchanged,
        }
    }

    pub fn get(&self, address: &MacAddress) -> Option<MotionState> {
        self.states.get(address).map(|s| *s.value())
    }

    /// All tracked states, ordered by address.
    pub fn entries(&self) -> Vec<(MacAddress, MotionState)> {
        let mut entries: Vec<_> = self.states.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort_by_key(|(address, _)| *address);
        entries
    }

    pub fn forget(&self, address: &MacAddress) {
        self.states.remove(address);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
