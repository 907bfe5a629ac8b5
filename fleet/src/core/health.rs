//! Two-strikes progress assessment over heartbeat samples.
//!
//! A sample records every progress signal the monitor could read on one poll.
//! A job is healthy as soon as any signal moves forward; it is stalled only
//! after two consecutive flat comparisons, and only when at least two
//! independent signals were available to compare.

use serde::{Deserialize, Serialize};

use crate::core::types::SignalSource;

/// Consecutive flat comparisons required before a job is declared stalled.
pub const STALL_STRIKES: u32 = 2;

/// Minimum number of comparable signals before staleness may be declared.
pub const MIN_SIGNALS: usize = 2;

/// One poll's worth of progress signals. `None` means the signal was
/// unavailable on this poll (e.g. no `/proc` on this platform).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub log_bytes: Option<u64>,
    pub log_modified_ms: Option<i64>,
    pub cpu_ticks: Option<u64>,
    pub mutation_count: Option<u64>,
}

/// Outcome of comparing a fresh sample against the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub stalled: bool,
    pub flat_streak: u32,
    pub progressed: Vec<SignalSource>,
}

/// Signals that advanced between `prev` and `next`.
///
/// Log activity counts any size change (rotation shrinks the file) or a newer
/// modification time. CPU time and mutation count only count when they grow.
pub fn progressed_signals(prev: &Sample, next: &Sample) -> Vec<SignalSource> {
    let mut out = Vec::new();
    let log_size_moved = matches!((prev.log_bytes, next.log_bytes), (Some(a), Some(b)) if a != b);
    let log_time_moved =
        matches!((prev.log_modified_ms, next.log_modified_ms), (Some(a), Some(b)) if b > a);
    if log_size_moved || log_time_moved {
        out.push(SignalSource::LogActivity);
    }
    if matches!((prev.cpu_ticks, next.cpu_ticks), (Some(a), Some(b)) if b > a) {
        out.push(SignalSource::ProcessCpuTime);
    }
    if matches!((prev.mutation_count, next.mutation_count), (Some(a), Some(b)) if b > a) {
        out.push(SignalSource::WorktreeMutation);
    }
    out
}

/// Number of signals readable in both samples.
pub fn comparable_signals(prev: &Sample, next: &Sample) -> usize {
    let log = (prev.log_bytes.is_some() && next.log_bytes.is_some())
        || (prev.log_modified_ms.is_some() && next.log_modified_ms.is_some());
    let cpu = prev.cpu_ticks.is_some() && next.cpu_ticks.is_some();
    let mutation = prev.mutation_count.is_some() && next.mutation_count.is_some();
    [log, cpu, mutation].into_iter().filter(|v| *v).count()
}

/// Assess `next` against the previous sample and the running flat streak.
pub fn assess(prev: Option<&Sample>, next: &Sample, flat_streak: u32) -> Assessment {
    let Some(prev) = prev else {
        return Assessment {
            stalled: false,
            flat_streak: 0,
            progressed: Vec::new(),
        };
    };

    let progressed = progressed_signals(prev, next);
    if !progressed.is_empty() {
        return Assessment {
            stalled: false,
            flat_streak: 0,
            progressed,
        };
    }

    let flat_streak = flat_streak.saturating_add(1);
    let enough_signals = comparable_signals(prev, next) >= MIN_SIGNALS;
    Assessment {
        stalled: enough_signals && flat_streak >= STALL_STRIKES,
        flat_streak,
        progressed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(log: u64, cpu: u64, mutations: u64) -> Sample {
        Sample {
            log_bytes: Some(log),
            log_modified_ms: Some(1_000),
            cpu_ticks: Some(cpu),
            mutation_count: Some(mutations),
        }
    }

    #[test]
    fn first_sample_is_healthy() {
        let a = assess(None, &sample(10, 5, 0), 0);
        assert!(!a.stalled);
        assert_eq!(a.flat_streak, 0);
    }

    #[test]
    fn single_flat_poll_is_not_a_stall() {
        let a = assess(Some(&sample(10, 5, 0)), &sample(10, 5, 0), 0);
        assert!(!a.stalled);
        assert_eq!(a.flat_streak, 1);
    }

    #[test]
    fn two_consecutive_flat_polls_stall() {
        let s0 = sample(10, 5, 0);
        let first = assess(Some(&s0), &s0, 0);
        let second = assess(Some(&s0), &s0, first.flat_streak);
        assert!(second.stalled);
        assert_eq!(second.flat_streak, 2);
    }

    #[test]
    fn cpu_progress_after_a_flat_poll_keeps_job_healthy() {
        let s0 = sample(10, 5, 0);
        let s1 = sample(10, 5, 0);
        let s2 = sample(10, 9, 0);
        let first = assess(Some(&s0), &s1, 0);
        assert_eq!(first.flat_streak, 1);
        let second = assess(Some(&s1), &s2, first.flat_streak);
        assert!(!second.stalled);
        assert_eq!(second.flat_streak, 0);
        assert_eq!(second.progressed, vec![SignalSource::ProcessCpuTime]);
    }

    #[test]
    fn log_silence_alone_does_not_stall_when_files_change() {
        let s0 = sample(10, 5, 3);
        let s1 = sample(10, 5, 4);
        let a = assess(Some(&s0), &s1, 1);
        assert!(!a.stalled);
        assert_eq!(a.progressed, vec![SignalSource::WorktreeMutation]);
    }

    #[test]
    fn log_rotation_counts_as_activity() {
        let a = assess(Some(&sample(500, 5, 0)), &sample(40, 5, 0), 1);
        assert_eq!(a.progressed, vec![SignalSource::LogActivity]);
    }

    #[test]
    fn one_signal_is_never_enough_to_stall() {
        let only_log = Sample {
            log_bytes: Some(10),
            log_modified_ms: Some(1),
            cpu_ticks: None,
            mutation_count: None,
        };
        let mut streak = 0;
        for _ in 0..5 {
            let a = assess(Some(&only_log), &only_log, streak);
            assert!(!a.stalled);
            streak = a.flat_streak;
        }
    }
}
