//! [`SummaryIndex`]: coarse time-bucketed counts for overview rendering,
//! plus the first/last/total counters the database exposes directly.

use crate::Time;

/// Aggregate counts for one bucket of one granularity level.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bucket {
    pub count: u32,
    pub approximate_duration: Time,
}

/// One power-of-two time granularity's worth of buckets.
struct Level {
    width: Time,
    buckets: Vec<Bucket>,
}

/// Maintains the first/last event time and total count for the whole
/// stream, plus coarse power-of-two buckets for fast overview rendering.
pub struct SummaryIndex {
    first_time: Option<Time>,
    last_time: Option<Time>,
    total_count: u64,
    levels: Vec<Level>,
    inserting: bool,
}

/// Smallest bucket width, in microseconds: about one second.
const BASE_WIDTH: Time = 1 << 20;

impl SummaryIndex {
    pub fn new(levels: usize) -> Self {
        let levels = (0..levels)
            .map(|i| Level { width: BASE_WIDTH << i, buckets: Vec::new() })
            .collect();
        SummaryIndex { first_time: None, last_time: None, total_count: 0, levels, inserting: false }
    }

    pub fn begin_inserting(&mut self) {
        debug_assert!(!self.inserting);
        self.inserting = true;
    }

    pub fn insert_event(&mut self, time: Time) {
        debug_assert!(self.inserting);
        self.first_time = Some(self.first_time.map_or(time, |t| t.min(time)));
        self.last_time = Some(self.last_time.map_or(time, |t| t.max(time)));
        self.total_count += 1;
        for level in &mut self.levels {
            let index = bucket_index(time, level.width);
            if index >= level.buckets.len() {
                level.buckets.resize(index + 1, Bucket::default());
            }
            level.buckets[index].count += 1;
        }
    }

    pub fn end_inserting(&mut self) {
        debug_assert!(self.inserting);
        self.inserting = false;
        for level in &mut self.levels {
            for bucket in &mut level.buckets {
                bucket.approximate_duration = level.width;
            }
        }
    }

    pub fn first_event_time(&self) -> Option<Time> {
        self.first_time
    }

    pub fn last_event_time(&self) -> Option<Time> {
        self.last_time
    }

    /// Total indexed events, including `INTERNAL` ones — callers wanting
    /// the user-visible count should use `Database::total_event_count`.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Iterates the buckets of the coarsest granularity level whose width
    /// is not larger than `max_width` that overlap `[t_start, t_end)`.
    pub fn for_each(&self, t_start: Time, t_end: Time, max_width: Time, mut f: impl FnMut(Time, &Bucket)) {
        let Some(level) = self
            .levels
            .iter()
            .filter(|l| l.width <= max_width)
            .max_by_key(|l| l.width)
            .or_else(|| self.levels.first())
        else {
            return;
        };
        let lo = bucket_index(t_start, level.width);
        let hi = bucket_index(t_end.saturating_sub(1), level.width);
        for index in lo..=hi {
            if let Some(bucket) = level.buckets.get(index) {
                f(index as Time * level.width, bucket);
            }
        }
    }
}

fn bucket_index(time: Time, width: Time) -> usize {
    (time.max(0) / width) as usize
}
