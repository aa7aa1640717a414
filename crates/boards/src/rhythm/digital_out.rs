//! TTL output scheduling.
//!
//! Level changes are queued and applied once per streaming batch as a single
//! 16-bit TTL write. Timed pulses are explicit deadline entries: a trigger
//! queues the rising edge now and records when the falling edge is due.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::debug;

/// Lines addressable by the broadcast trigger.
pub const NUM_TRIGGER_LINES: u8 = 8;
pub const MIN_PULSE_MS: u64 = 10;
pub const MAX_PULSE_MS: u64 = 5000;

const BROADCAST_TARGET: &str = "ACQBOARD";
const BROADCAST_TRIGGER: &str = "TRIGGER";

/// A validated `ACQBOARD TRIGGER <line> <ms>` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerCommand {
    /// 0-based TTL line.
    pub line: u8,
    pub duration: Duration,
}

/// Parses a broadcast message. Anything malformed or out of range yields `None`.
pub fn parse_broadcast(message: &str) -> Option<TriggerCommand> {
    let parts: Vec<&str> = message.split_whitespace().collect();
    if parts.len() != 4
        || !parts[0].eq_ignore_ascii_case(BROADCAST_TARGET)
        || !parts[1].eq_ignore_ascii_case(BROADCAST_TRIGGER)
    {
        return None;
    }

    let line: i64 = parts[2].parse().ok()?;
    let duration_ms: u64 = parts[3].parse().ok()?;
    if !(1..=NUM_TRIGGER_LINES as i64).contains(&line) || !(MIN_PULSE_MS..=MAX_PULSE_MS).contains(&duration_ms) {
        return None;
    }

    Some(TriggerCommand { line: (line - 1) as u8, duration: Duration::from_millis(duration_ms) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelChange {
    line: u8,
    high: bool,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    line: u8,
    due: Instant,
}

/// Pending TTL level changes and pulse deadlines.
#[derive(Debug, Default)]
pub struct DigitalOutScheduler {
    commands: VecDeque<LevelChange>,
    deadlines: Vec<Deadline>,
    state: u16,
}

impl DigitalOutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `line` high now and low once `duration` has elapsed from `now`.
    /// Each trigger keeps its own deadline, even on a line already high.
    pub fn trigger(&mut self, line: u8, duration: Duration, now: Instant) {
        debug!("TTL line {} pulse for {:?}", line, duration);
        self.set_line(line, true);
        self.deadlines.push(Deadline { line, due: now + duration });
    }

    pub fn set_line(&mut self, line: u8, high: bool) {
        self.commands.push_back(LevelChange { line, high });
    }

    /// Moves expired deadlines into the queue and folds every queued change
    /// into the output word. Returns the word to write, or `None` when
    /// nothing changed hands this iteration.
    pub fn drain(&mut self, now: Instant) -> Option<u16> {
        let mut index = 0;
        while index < self.deadlines.len() {
            if self.deadlines[index].due <= now {
                let expired = self.deadlines.remove(index);
                self.commands.push_back(LevelChange { line: expired.line, high: false });
            } else {
                index += 1;
            }
        }

        if self.commands.is_empty() {
            return None;
        }
        while let Some(change) = self.commands.pop_front() {
            let bit = 1u16 << (change.line % 16);
            if change.high {
                self.state |= bit;
            } else {
                self.state &= !bit;
            }
        }
        Some(self.state)
    }

    /// Current output word.
    pub fn state(&self) -> u16 {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.commands.len() + self.deadlines.len()
    }

    /// Forgets the last written word without touching queued changes.
    pub fn reset_state(&mut self) {
        self.state = 0;
    }

    /// Drops queued changes and deadlines; the output word returns to 0.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.deadlines.clear();
        self.state = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_trigger() {
        assert_eq!(
            parse_broadcast("ACQBOARD TRIGGER 3 50"),
            Some(TriggerCommand { line: 2, duration: Duration::from_millis(50) })
        );
        assert_eq!(parse_broadcast("acqboard trigger 8 5000").map(|c| c.line), Some(7));
    }

    #[test]
    fn test_parse_rejects_out_of_range_and_malformed() {
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER 9 100"), None);
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER 0 100"), None);
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER 1 9"), None);
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER 1 5001"), None);
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER 1"), None);
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER 1 100 extra"), None);
        assert_eq!(parse_broadcast("OTHER TRIGGER 1 100"), None);
        assert_eq!(parse_broadcast("ACQBOARD TRIGGER x 100"), None);
    }

    #[test]
    fn test_pulse_goes_high_then_low_after_deadline() {
        let start = Instant::now();
        let mut scheduler = DigitalOutScheduler::new();
        scheduler.trigger(2, Duration::from_millis(50), start);

        assert_eq!(scheduler.drain(start), Some(0b100));
        assert_eq!(scheduler.drain(start + Duration::from_millis(49)), None);
        assert_eq!(scheduler.drain(start + Duration::from_millis(50)), Some(0));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_retrigger_keeps_independent_deadlines() {
        let start = Instant::now();
        let mut scheduler = DigitalOutScheduler::new();
        scheduler.trigger(1, Duration::from_millis(100), start);
        scheduler.trigger(1, Duration::from_millis(300), start + Duration::from_millis(50));
        scheduler.trigger(4, Duration::from_millis(200), start);
        assert_eq!(scheduler.drain(start + Duration::from_millis(60)), Some(0b1_0010));

        // first deadline on line 1 lowers it while the second is still pending
        assert_eq!(scheduler.drain(start + Duration::from_millis(100)), Some(0b1_0000));
        assert_eq!(scheduler.drain(start + Duration::from_millis(200)), Some(0));
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.drain(start + Duration::from_millis(350)), Some(0));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_clear_resets_state() {
        let now = Instant::now();
        let mut scheduler = DigitalOutScheduler::new();
        scheduler.trigger(0, Duration::from_millis(10), now);
        scheduler.drain(now);
        scheduler.clear();
        assert_eq!(scheduler.state(), 0);
        assert_eq!(scheduler.drain(now + Duration::from_secs(1)), None);
    }
}
