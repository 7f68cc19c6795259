//! Radiosity Pretrace Driver
//!
//! Multi-pass adaptive pretrace over the tiles: every pass samples each
//! tile on a grid whose spacing halves per pass, and a tile subdivides
//! into sub-blocks wherever the radiosity cache reports poor sample
//! reuse. Per-tile progress between passes lives in the dispatcher's
//! carry-over slot.
//!
//! The jitter for a tile is drawn from a fixed table seeded by
//! (pass, tile), so the sample sequence is a pure function of the tile —
//! the basis of the high-reproducibility mode, which additionally pins
//! the nominal thread count and dispatches with a stride so neighbouring
//! tiles are never sampled concurrently.

use std::sync::Arc;

use glam::DVec2;

use crate::color::RgbtColour;
use crate::errors::Result;
use crate::render::{PixelTracer, TracerContext, record_task_times};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::view::ViewData;
use crate::view::dispatch::{BlockInfo, RadiosityBlockInfo};
use crate::math::RandomDoubleSequence;

/// First pretrace pass number handed to the tracer.
pub const PRETRACE_FIRST: u32 = 1;
/// Exclusive upper bound of pretrace pass numbers.
pub const PRETRACE_MAX: u32 = 16;

const JITTER_TABLE_SIZE: usize = 2047;

pub struct RadiosityTask {
    view: Arc<ViewData>,
    tracer: Box<dyn PixelTracer>,
    pretrace_step: u32,
    pretrace_step_count: u32,
    pretrace_start_size: f64,
    pretrace_end_size: f64,
    pretrace_coverage: f32,
    nominal_threads: u32,
    jitter_table: RandomDoubleSequence,
    thread_data: SharedThreadData,
}

impl RadiosityTask {
    #[must_use]
    pub fn new(
        view: Arc<ViewData>,
        pretrace_start_size: f64,
        pretrace_end_size: f64,
        pretrace_step: u32,
        pretrace_step_count: u32,
        nominal_threads: u32,
        thread_data: SharedThreadData,
        seed: u64,
    ) -> Self {
        let final_trace = view.scene_data.radiosity_settings.read().vain_pretrace;
        let pretrace_coverage = view.scene_data.radiosity_settings.read().pretrace_coverage;
        let tracer = view.scene_data.services.tracers.create_tracer(TracerContext {
            view: Arc::clone(&view),
            camera: *view.camera.read(),
            final_trace,
            seed,
        });
        Self {
            view,
            tracer,
            pretrace_step,
            pretrace_step_count,
            pretrace_start_size,
            pretrace_end_size,
            pretrace_coverage,
            nominal_threads,
            jitter_table: RandomDoubleSequence::new(-1.0, 1.0, JITTER_TABLE_SIZE),
            thread_data,
        }
    }
}

impl TaskPayload for RadiosityTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        let width = f64::from(self.view.width);
        let height = f64::from(self.view.height);

        let mut positions: Vec<DVec2> = Vec::new();
        let mut colors: Vec<RgbtColour> = Vec::new();

        let progress_weight_total = (4f32.powi(self.pretrace_step_count as i32) - 1.0) / 3.0;

        while let Some((rect, serial, info)) = self
            .view
            .dispatcher
            .next_rectangle_with_info(self.nominal_threads)
        {
            let mut block = match info {
                Some(BlockInfo::Radiosity(block)) => block,
                None => RadiosityBlockInfo::default(),
            };

            let pass = u32::from(block.pass);
            let pretrace_size = (self.pretrace_start_size * 0.5f64.powi(pass as i32))
                .max(self.pretrace_end_size);
            let next_pretrace_size = (self.pretrace_start_size * 0.5f64.powi(pass as i32 + 1))
                .max(self.pretrace_end_size);

            let seed_offset = if self.nominal_threads > 0 {
                serial % self.nominal_threads
            } else {
                0
            };
            self.tracer
                .before_tile(seed_offset, self.pretrace_step + pass);

            // Jitter must differ per pass and tile yet stay reproducible
            // across schedules.
            let mut jitter = self
                .jitter_table
                .generator(((self.pretrace_step + pass) * 17 + serial * 13) as usize);

            let next_px = (f64::from(rect.width()) / next_pretrace_size).ceil().max(1.0);
            let next_py = (f64::from(rect.height()) / next_pretrace_size).ceil().max(1.0);

            let start_x = ((f64::from(rect.left) - 0.5) / pretrace_size).ceil() * pretrace_size;
            let start_y = ((f64::from(rect.top) - 0.5) / pretrace_size).ceil() * pretrace_size;

            positions.clear();
            colors.clear();

            let sample_jitter = (pretrace_size / 2.0).min(1.0);
            let offset = (pretrace_size - 1.0) / 2.0;
            let sub_block_count = block.incomplete_sub_blocks.len();

            // For the next pass, subdivide only while that still leaves
            // at least 4x4 pixels per sub-block.
            let (sub_divide_x, sub_divide_y) = if self.pretrace_coverage != 0.0 {
                (
                    ((next_px / f64::from(u32::from(block.sub_block_count_x) * 4)).floor() as i64)
                        .max(1),
                    ((next_py / f64::from(u32::from(block.sub_block_count_y) * 4)).floor() as i64)
                        .max(1),
                )
            } else {
                (1, 1)
            };

            for _ in 0..sub_block_count {
                self.tracer.reset_top_level_stats();
                let mut pixel_count = 0u32;

                let (sub_x, sub_y) = block
                    .incomplete_sub_blocks
                    .front()
                    .copied()
                    .expect("sub-block queue non-empty within count");

                let sub_start_x = f64::from(rect.left)
                    + f64::from(rect.width()) * f64::from(sub_x)
                        / f64::from(block.sub_block_count_x);
                let sub_end_x =
                    sub_start_x + f64::from(rect.width()) / f64::from(block.sub_block_count_x);
                let sub_start_y = f64::from(rect.top)
                    + f64::from(rect.height()) * f64::from(sub_y)
                        / f64::from(block.sub_block_count_y);
                let sub_end_y =
                    sub_start_y + f64::from(rect.height()) / f64::from(block.sub_block_count_y);

                let mut y = start_y;
                while y < sub_end_y {
                    if y >= sub_start_y {
                        let mut x = start_x;
                        while x < sub_end_x {
                            if x >= sub_start_x {
                                let col = self.tracer.trace_pixel(
                                    x + offset + sample_jitter * jitter.next_value(),
                                    y + offset + sample_jitter * jitter.next_value(),
                                    width,
                                    height,
                                );
                                positions.push(DVec2::new(x, y));
                                colors.push(col);
                                pixel_count += 1;
                                ctx.cooperate()?;
                            }
                            x += pretrace_size;
                        }
                    }
                    y += pretrace_size;
                }

                let (query_count, reuse) = self.tracer.top_level_stats();

                // Subdivide while the square still needs samples: skip
                // squares that never query the cache (pure background)
                // or already reuse enough of it.
                let again = if pixel_count < 9 {
                    true
                } else if query_count == 0 {
                    false
                } else {
                    !(self.pretrace_coverage != 0.0
                        && reuse / query_count as f64 >= f64::from(self.pretrace_coverage))
                };

                block.incomplete_sub_blocks.pop_front();
                if again {
                    for div_y in 0..sub_divide_y {
                        for div_x in 0..sub_divide_x {
                            block.incomplete_sub_blocks.push_back((
                                (i64::from(sub_x) * sub_divide_x + div_x) as u16,
                                (i64::from(sub_y) * sub_divide_y + div_y) as u16,
                            ));
                        }
                    }
                }
            }

            self.thread_data.lock().stats.pixels += positions.len() as u64;
            self.tracer.after_tile();

            let mut progress_weight = 4f32.powi(pass as i32) / progress_weight_total;
            block.pass += 1;

            let carry_over = if u32::from(block.pass) < self.pretrace_step_count
                && !block.incomplete_sub_blocks.is_empty()
            {
                block.sub_block_count_x = (i64::from(block.sub_block_count_x) * sub_divide_x) as u16;
                block.sub_block_count_y = (i64::from(block.sub_block_count_y) * sub_divide_y) as u16;
                block.completion += progress_weight;
                Some(BlockInfo::Radiosity(block))
            } else {
                progress_weight = 1.0 - block.completion;
                None
            };

            if positions.is_empty() {
                self.view
                    .completed_rectangle_progress(rect, serial, progress_weight, carry_over);
            } else {
                self.view.completed_rectangle_sparse(
                    rect,
                    serial,
                    &positions,
                    &colors,
                    pretrace_size.ceil() as u32,
                    false,
                    false,
                    progress_weight,
                    carry_over,
                );
            }
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        record_task_times(ctx, &self.thread_data, TimeKind::Radiosity);
        Ok(())
    }
}
