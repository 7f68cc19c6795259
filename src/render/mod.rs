//! Render Stages
//!
//! The per-pixel sampling state machine, the radiosity pretrace driver,
//! and the contracts that plug the external ray kernel into them.
//!
//! The backend schedules pixels; it does not intersect rays. Each worker
//! task asks the scene's [`TracerFactory`] for a private [`PixelTracer`]
//! and drives it across tiles. The tracer reports back the auxiliary
//! signals the drivers need: per-tile radiosity query/reuse statistics
//! and the highest trace level reached.

pub mod radiosity;
pub mod radiosity_cache;
pub mod trace;

use std::sync::Arc;

use crate::color::RgbtColour;
use crate::scene::camera::Camera;
use crate::support::task::TaskContext;
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::view::ViewData;

/// Everything a tracer instance is bound to.
pub struct TracerContext {
    pub view: Arc<ViewData>,
    pub camera: Camera,
    /// False during radiosity pretrace when vain pretrace is disabled
    /// (the kernel may then skip non-radiosity work).
    pub final_trace: bool,
    pub seed: u64,
}

/// A per-worker pixel sampling kernel.
pub trait PixelTracer: Send {
    /// Traces one sample. Coordinates are continuous pixel positions;
    /// `width`/`height` describe the full image for ray setup.
    fn trace_pixel(&mut self, x: f64, y: f64, width: f64, height: f64) -> RgbtColour;

    /// Tile preamble. `seed_offset` is the tile serial in
    /// high-reproducibility mode (zero otherwise); `pretrace_step` is the
    /// radiosity pass for pretrace tiles (zero for final rendering).
    fn before_tile(&mut self, _seed_offset: u32, _pretrace_step: u32) {}

    /// Tile epilogue; flush per-thread radiosity samples here.
    fn after_tile(&mut self) {}

    /// Replaces the camera mid-run (real-time clockless animation).
    fn set_camera(&mut self, _camera: Camera) {}

    fn reset_top_level_stats(&mut self) {}

    /// (query count, reuse count) since the last reset.
    fn top_level_stats(&self) -> (u64, f64) {
        (0, 0.0)
    }

    fn highest_trace_level(&self) -> u32 {
        0
    }
}

/// Creates tracers; implemented by the intersection/shading kernel.
pub trait TracerFactory: Send + Sync {
    fn create_tracer(&self, ctx: TracerContext) -> Box<dyn PixelTracer>;
}

/// A stateless tracer over a plain function; the reference
/// implementation used by the test suites and simple embedders.
pub type TraceFn = Arc<dyn Fn(f64, f64, f64, f64) -> RgbtColour + Send + Sync>;

pub struct CallbackTracerFactory {
    f: TraceFn,
}

impl CallbackTracerFactory {
    #[must_use]
    pub fn new(f: TraceFn) -> Self {
        Self { f }
    }
}

struct CallbackTracer {
    f: TraceFn,
}

impl PixelTracer for CallbackTracer {
    fn trace_pixel(&mut self, x: f64, y: f64, width: f64, height: f64) -> RgbtColour {
        (self.f)(x, y, width, height)
    }
}

impl TracerFactory for CallbackTracerFactory {
    fn create_tracer(&self, _ctx: TracerContext) -> Box<dyn PixelTracer> {
        Box::new(CallbackTracer {
            f: Arc::clone(&self.f),
        })
    }
}

/// Copies the task's measured run times into its thread-data record.
pub(crate) fn record_task_times(ctx: &TaskContext, thread_data: &SharedThreadData, kind: TimeKind) {
    let mut data = thread_data.lock();
    data.time_kind = kind;
    data.real_time_ms = ctx.consumed_real_time_ms();
    data.cpu_time_ms = ctx.consumed_cpu_time_ms();
}
