//! Per-Task Thread Data
//!
//! Every worker task owns a thread-data record: statistics counters, the
//! time bucket its run accounts against, and the measured run times. The
//! owning scene or view keeps a handle to each record and folds them
//! together when the statistics message is assembled.

use std::ops::AddAssign;
use std::sync::Arc;

use parking_lot::Mutex;

/// Which statistics bucket a task's elapsed time accounts against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeKind {
    #[default]
    Unknown,
    Parse,
    Bounding,
    Photon,
    Radiosity,
    Render,
}

impl TimeKind {
    pub const ALL: [TimeKind; 6] = [
        TimeKind::Unknown,
        TimeKind::Parse,
        TimeKind::Bounding,
        TimeKind::Photon,
        TimeKind::Radiosity,
        TimeKind::Render,
    ];
}

/// Render statistics counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub pixels: u64,
    pub samples: u64,
    pub supersampled_pixels: u64,
    pub rays: u64,
    pub photons_shot: u64,
    pub surface_photons_stored: u64,
    pub media_photons_stored: u64,
    pub radiosity_queries: u64,
    pub radiosity_reuses: u64,
}

impl AddAssign for RenderStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pixels += rhs.pixels;
        self.samples += rhs.samples;
        self.supersampled_pixels += rhs.supersampled_pixels;
        self.rays += rhs.rays;
        self.photons_shot += rhs.photons_shot;
        self.surface_photons_stored += rhs.surface_photons_stored;
        self.media_photons_stored += rhs.media_photons_stored;
        self.radiosity_queries += rhs.radiosity_queries;
        self.radiosity_reuses += rhs.radiosity_reuses;
    }
}

/// One task's accounting record.
#[derive(Debug, Default)]
pub struct ThreadData {
    pub stats: RenderStats,
    pub time_kind: TimeKind,
    /// Elapsed real time of the task's run in ms; -1 until finished.
    pub real_time_ms: i64,
    /// Elapsed thread CPU time in ms; -1 where unsupported.
    pub cpu_time_ms: i64,
}

impl ThreadData {
    #[must_use]
    pub fn shared() -> SharedThreadData {
        Arc::new(Mutex::new(ThreadData {
            real_time_ms: -1,
            cpu_time_ms: -1,
            ..ThreadData::default()
        }))
    }
}

pub type SharedThreadData = Arc<Mutex<ThreadData>>;

/// Aggregated run time per bucket: real time is the maximum across the
/// bucket's tasks (they ran concurrently), CPU time is the sum, and a
/// sample count records how many tasks contributed.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeData {
    pub real_time_ms: i64,
    pub cpu_time_ms: i64,
    pub samples: usize,
}

/// Folds thread-data records into per-bucket time aggregates.
#[must_use]
pub fn aggregate_times(records: &[SharedThreadData]) -> [TimeData; 6] {
    let mut buckets = [TimeData::default(); 6];
    for record in records {
        let data = record.lock();
        let slot = &mut buckets[data.time_kind as usize];
        slot.real_time_ms = slot.real_time_ms.max(data.real_time_ms);
        if data.cpu_time_ms >= 0 && slot.cpu_time_ms >= 0 {
            slot.cpu_time_ms += data.cpu_time_ms;
        } else {
            slot.cpu_time_ms = -1;
        }
        slot.samples += 1;
    }
    buckets
}

/// Folds statistics counters across all records.
#[must_use]
pub fn aggregate_stats(records: &[SharedThreadData]) -> RenderStats {
    let mut total = RenderStats::default();
    for record in records {
        total += record.lock().stats;
    }
    total
}
