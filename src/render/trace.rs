//! Per-Tile Sampling State Machine
//!
//! One trace task per worker thread; each repeatedly claims a tile from
//! the dispatcher and samples it with the selected method:
//!
//! - Method 0: one sample per pixel (optionally on a mosaic preview
//!   grid with corner skipping).
//! - Method 1: non-adaptive supersampling driven by colour distance to
//!   the top and left neighbours, with a one-pixel halo that is traced
//!   but flagged as already supersampled (it belongs to the neighbouring
//!   tile).
//! - Method 2: recursive adaptive supersampling over each pixel's corner
//!   grid.
//! - Method 3: stochastic sampling that draws jittered samples until a
//!   confidence interval derived from the 3x3 neighbourhood variance
//!   drops below the threshold.
//!
//! Colour distances are measured after encoding through the antialias
//! gamma curve so thresholds behave uniformly across brightness.

use std::sync::Arc;

use glam::DVec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::color::{GammaCurve, PreciseRgbt, RgbtColour, colour_distance};
use crate::errors::Result;
use crate::math::{jitter_2d, ndtri};
use crate::render::{PixelTracer, TracerContext, record_task_times};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::view::ViewData;

/// A tile buffer with a one-pixel frame on every side. Frame pixels can
/// be sampled and flagged like interior pixels but are not part of the
/// emitted tile.
struct HaloBlock {
    frame_pixels: Vec<RgbtColour>,
    pixels: Vec<RgbtColour>,
    frame_flags: Vec<bool>,
    flags: Vec<bool>,
    offset_x: i64,
    offset_y: i64,
    width: i64,
    height: i64,
}

impl HaloBlock {
    fn new(offset_x: i64, offset_y: i64, width: i64, height: i64) -> Self {
        let frame = (width as usize * 2) + (height as usize * 2) + 4;
        Self {
            frame_pixels: vec![RgbtColour::default(); frame],
            pixels: vec![RgbtColour::default(); width as usize * height as usize],
            frame_flags: vec![false; frame],
            flags: vec![false; width as usize * height as usize],
            offset_x,
            offset_y,
            width,
            height,
        }
    }

    /// Maps coordinates to an index: non-negative for interior pixels,
    /// `-1 - k` for the frame slot `k` (corners first, then edges).
    fn offset(&self, x: i64, y: i64) -> i64 {
        let mut x = x - self.offset_x;
        let mut y = y - self.offset_y;
        x = x.clamp(-1, self.width);
        y = y.clamp(-1, self.height);

        let (w, h) = (self.width, self.height);
        if x < 0 && y < 0 {
            -1
        } else if x >= w && y < 0 {
            -2
        } else if x < 0 && y >= h {
            -3
        } else if x >= w && y >= h {
            -4
        } else if x < 0 {
            -(4 + y)
        } else if y < 0 {
            -(4 + x + h)
        } else if x >= w {
            -(4 + y + h + w)
        } else if y >= h {
            -(4 + x + h + w + h)
        } else {
            x + y * w
        }
    }

    fn get(&self, x: i64, y: i64) -> RgbtColour {
        let off = self.offset(x, y);
        if off < 0 {
            self.frame_pixels[(-1 - off) as usize]
        } else {
            self.pixels[off as usize]
        }
    }

    fn set(&mut self, x: i64, y: i64, c: RgbtColour) {
        let off = self.offset(x, y);
        if off < 0 {
            self.frame_pixels[(-1 - off) as usize] = c;
        } else {
            self.pixels[off as usize] = c;
        }
    }

    fn flag(&self, x: i64, y: i64) -> bool {
        let off = self.offset(x, y);
        if off < 0 {
            self.frame_flags[(-1 - off) as usize]
        } else {
            self.flags[off as usize]
        }
    }

    fn set_flag(&mut self, x: i64, y: i64, f: bool) {
        let off = self.offset(x, y);
        if off < 0 {
            self.frame_flags[(-1 - off) as usize] = f;
        } else {
            self.flags[off as usize] = f;
        }
    }

    fn into_pixels(self) -> Vec<RgbtColour> {
        self.pixels
    }
}

/// Square sample buffer for the recursive subdivision of one pixel.
struct SubdivisionBuffer {
    colors: Vec<RgbtColour>,
    sampled: Vec<bool>,
    size: usize,
}

impl SubdivisionBuffer {
    fn new(size: usize) -> Self {
        Self {
            colors: vec![RgbtColour::default(); size * size],
            sampled: vec![false; size * size],
            size,
        }
    }

    fn clear(&mut self) {
        self.sampled.fill(false);
    }

    fn set_sample(&mut self, x: usize, y: usize, c: RgbtColour) {
        self.colors[x + y * self.size] = c;
        self.sampled[x + y * self.size] = true;
    }

    fn sampled(&self, x: usize, y: usize) -> bool {
        self.sampled[x + y * self.size]
    }

    fn get(&self, x: usize, y: usize) -> RgbtColour {
        self.colors[x + y * self.size]
    }
}

pub struct TraceTask {
    view: Arc<ViewData>,
    tracer: Box<dyn PixelTracer>,
    method: u32,
    jitter_scale: f64,
    aa_threshold: f64,
    aa_confidence: f64,
    aa_depth: u32,
    aa_gamma: GammaCurve,
    preview_size: u32,
    preview_skip_corner: bool,
    pass_contributes_to_image: bool,
    pass_completes_image: bool,
    high_reproducibility: bool,
    seed: u64,
    thread_data: SharedThreadData,
}

impl TraceTask {
    #[must_use]
    pub fn new(
        view: Arc<ViewData>,
        method: u32,
        jitter_scale: f64,
        aa_threshold: f64,
        aa_confidence: f64,
        aa_depth: u32,
        aa_gamma: GammaCurve,
        preview_size: u32,
        preview_skip_corner: bool,
        pass_contributes_to_image: bool,
        high_reproducibility: bool,
        thread_data: SharedThreadData,
        seed: u64,
    ) -> Self {
        let tracer = view.scene_data.services.tracers.create_tracer(TracerContext {
            view: Arc::clone(&view),
            camera: *view.camera.read(),
            final_trace: true,
            seed,
        });
        Self {
            view,
            tracer,
            method,
            jitter_scale,
            aa_threshold,
            aa_confidence,
            aa_depth,
            aa_gamma,
            preview_size,
            preview_skip_corner,
            pass_contributes_to_image,
            pass_completes_image: preview_size == 0
                || (preview_size == 1 && pass_contributes_to_image),
            high_reproducibility,
            seed,
            thread_data,
        }
    }

    fn image_size(&self) -> (f64, f64) {
        (f64::from(self.view.width), f64::from(self.view.height))
    }

    fn tile_seed_offset(&self, serial: u32) -> u32 {
        if self.high_reproducibility { serial } else { 0 }
    }

    fn add_stats(&self, pixels: u64, samples: u64, supersampled: u64) {
        let mut data = self.thread_data.lock();
        data.stats.pixels += pixels;
        data.stats.samples += samples;
        data.stats.supersampled_pixels += supersampled;
    }

    // Method 0, full resolution.
    fn simple_sampling(&mut self, ctx: &TaskContext) -> Result<()> {
        let (width, height) = self.image_size();
        let mut pixels: Vec<RgbtColour> = Vec::new();

        while let Some((rect, serial)) = self.view.dispatcher.next_rectangle() {
            self.tracer.before_tile(self.tile_seed_offset(serial), 0);

            pixels.clear();
            pixels.reserve(rect.area() as usize);
            let mut traced = 0u64;

            for y in rect.top..=rect.bottom {
                for x in rect.left..=rect.right {
                    let col = self.tracer.trace_pixel(
                        f64::from(x) + 0.5,
                        f64::from(y) + 0.5,
                        width,
                        height,
                    );
                    traced += 1;
                    pixels.push(col);
                    ctx.cooperate()?;
                }
            }

            self.tracer.after_tile();
            self.add_stats(traced, 0, 0);
            self.view.completed_rectangle(
                rect,
                serial,
                &pixels,
                1,
                self.pass_contributes_to_image,
                self.pass_completes_image,
            );
            ctx.cooperate()?;
        }
        Ok(())
    }

    // Method 0 on the mosaic preview grid.
    fn simple_sampling_preview(&mut self, ctx: &TaskContext) -> Result<()> {
        let (width, height) = self.image_size();
        let step = f64::from(self.preview_size);
        let mut positions: Vec<DVec2> = Vec::new();
        let mut colors: Vec<RgbtColour> = Vec::new();

        while let Some((rect, serial)) = self.view.dispatcher.next_rectangle() {
            self.tracer.before_tile(self.tile_seed_offset(serial), 0);

            positions.clear();
            colors.clear();
            let mut traced = 0u64;

            let mut y = f64::from(rect.top);
            while y <= f64::from(rect.bottom) {
                let mut x = f64::from(rect.left);
                while x <= f64::from(rect.right) {
                    // Corners of the previous, coarser pass were already
                    // traced; skip them.
                    if self.preview_skip_corner
                        && (x % (step * 2.0)).abs() < 1e-9
                        && (y % (step * 2.0)).abs() < 1e-9
                    {
                        x += step;
                        continue;
                    }

                    let col = self.tracer.trace_pixel(x + 0.5, y + 0.5, width, height);
                    traced += 1;
                    positions.push(DVec2::new(x, y));
                    colors.push(col);
                    ctx.cooperate()?;
                    x += step;
                }
                y += step;
            }

            self.tracer.after_tile();
            self.add_stats(traced, 0, 0);
            if !positions.is_empty() {
                self.view.completed_rectangle_sparse(
                    rect,
                    serial,
                    &positions,
                    &colors,
                    self.preview_size,
                    self.pass_contributes_to_image,
                    self.pass_completes_image,
                    1.0,
                    None,
                );
            } else {
                self.view
                    .completed_rectangle_progress(rect, serial, 1.0, None);
            }
            ctx.cooperate()?;
        }
        Ok(())
    }

    // Method 1: non-adaptive supersampling with a top/left halo.
    fn non_adaptive_supersampling(&mut self, ctx: &TaskContext) -> Result<()> {
        let (width, height) = self.image_size();
        let jitter_scale = self.jitter_scale / f64::from(self.aa_depth);

        while let Some((rect, serial)) = self.view.dispatcher.next_rectangle() {
            self.tracer.before_tile(self.tile_seed_offset(serial), 0);

            let mut pixels = HaloBlock::new(
                i64::from(rect.left),
                i64::from(rect.top),
                i64::from(rect.width()),
                i64::from(rect.height()),
            );
            let mut traced = 0u64;
            let mut samples = 0u64;
            let mut supersampled = 0u64;

            // The halo row above the tile is traced once and flagged as
            // already supersampled: it is finalised by the neighbouring
            // tile, and refining it here would double the work without
            // making both tiles agree in every case.
            for x in i64::from(rect.left)..=i64::from(rect.right) {
                let col = self.tracer.trace_pixel(
                    x as f64 + 0.5,
                    f64::from(rect.top) - 0.5,
                    width,
                    height,
                );
                traced += 1;
                pixels.set(x, i64::from(rect.top) - 1, col);
                pixels.set_flag(x, i64::from(rect.top) - 1, true);
                ctx.cooperate()?;
            }

            for y in i64::from(rect.top)..=i64::from(rect.bottom) {
                // Same for the pixel left of this row.
                let col = self.tracer.trace_pixel(
                    f64::from(rect.left) - 0.5,
                    y as f64 + 0.5,
                    width,
                    height,
                );
                traced += 1;
                pixels.set(i64::from(rect.left) - 1, y, col);
                pixels.set_flag(i64::from(rect.left) - 1, y, true);
                ctx.cooperate()?;

                for x in i64::from(rect.left)..=i64::from(rect.right) {
                    let col =
                        self.tracer
                            .trace_pixel(x as f64 + 0.5, y as f64 + 0.5, width, height);
                    traced += 1;
                    pixels.set(x, y, col);
                    ctx.cooperate()?;

                    let mut sample_left = !pixels.flag(x - 1, y);
                    let mut sample_top = !pixels.flag(x, y - 1);
                    let mut sample_current = true;

                    let left = pixels.get(x - 1, y);
                    let top = pixels.get(x, y - 1);
                    let current = pixels.get(x, y);

                    let gc_left = self.aa_gamma.encode(left);
                    let gc_top = self.aa_gamma.encode(top);
                    let gc_cur = self.aa_gamma.encode(current);

                    let left_diff =
                        f64::from(colour_distance(gc_left, gc_cur)) >= self.aa_threshold;
                    let top_diff = f64::from(colour_distance(gc_top, gc_cur)) >= self.aa_threshold;

                    sample_left = sample_left && left_diff;
                    sample_top = sample_top && top_diff;
                    sample_current = sample_current && (left_diff || top_diff);

                    if sample_left {
                        let refined = self.supersample_one_pixel(
                            x as f64 - 1.0,
                            y as f64,
                            left,
                            jitter_scale,
                            &mut samples,
                            ctx,
                        )?;
                        supersampled += 1;
                        pixels.set(x - 1, y, refined);
                        pixels.set_flag(x - 1, y, true);
                    }
                    if sample_top {
                        let refined = self.supersample_one_pixel(
                            x as f64,
                            y as f64 - 1.0,
                            top,
                            jitter_scale,
                            &mut samples,
                            ctx,
                        )?;
                        supersampled += 1;
                        pixels.set(x, y - 1, refined);
                        pixels.set_flag(x, y - 1, true);
                    }
                    if sample_current {
                        let refined = self.supersample_one_pixel(
                            x as f64,
                            y as f64,
                            current,
                            jitter_scale,
                            &mut samples,
                            ctx,
                        )?;
                        supersampled += 1;
                        pixels.set(x, y, refined);
                        pixels.set_flag(x, y, true);
                    }
                }
            }

            self.tracer.after_tile();
            self.add_stats(traced, samples, supersampled);
            self.view.completed_rectangle(
                rect,
                serial,
                &pixels.into_pixels(),
                1,
                self.pass_contributes_to_image,
                self.pass_completes_image,
            );
            ctx.cooperate()?;
        }
        Ok(())
    }

    /// Averages the initial sample with an aa_depth x aa_depth grid of
    /// extra samples (jittered when enabled).
    fn supersample_one_pixel(
        &mut self,
        x: f64,
        y: f64,
        initial: RgbtColour,
        jitter_scale: f64,
        samples: &mut u64,
        ctx: &TaskContext,
    ) -> Result<RgbtColour> {
        let (width, height) = self.image_size();
        let step = 1.0 / f64::from(self.aa_depth);
        let range = 0.5 - step * 0.5;
        let mut col = initial;

        let mut yy = -range;
        while yy <= range + 1e-9 {
            let mut xx = -range;
            while xx <= range + 1e-9 {
                let sample = if jitter_scale > 0.0 {
                    let (rx, ry) = jitter_2d(x + xx, y + yy);
                    self.tracer.trace_pixel(
                        x + 0.5 + xx + rx * jitter_scale,
                        y + 0.5 + yy + ry * jitter_scale,
                        width,
                        height,
                    )
                } else {
                    self.tracer
                        .trace_pixel(x + 0.5 + xx, y + 0.5 + yy, width, height)
                };
                col += sample;
                *samples += 1;
                ctx.cooperate()?;
                xx += step;
            }
            yy += step;
        }

        Ok(col / (self.aa_depth * self.aa_depth + 1) as f32)
    }

    // Method 2: recursive adaptive supersampling.
    fn adaptive_supersampling(&mut self, ctx: &TaskContext) -> Result<()> {
        let (width, height) = self.image_size();
        let subsize = 1usize << self.aa_depth;
        let mut buffer = SubdivisionBuffer::new(subsize + 1);
        let jitter_scale = self.jitter_scale / f64::from((1u32 << self.aa_depth) + 1);

        while let Some((rect, serial)) = self.view.dispatcher.next_rectangle() {
            self.tracer.before_tile(self.tile_seed_offset(serial), 0);

            let mut pixels = HaloBlock::new(
                i64::from(rect.left),
                i64::from(rect.top),
                i64::from(rect.width()),
                i64::from(rect.height()),
            );
            let mut traced = 0u64;
            let mut samples = 0u64;

            // Dense pass over the pixel corners; the extra right/bottom
            // row and column are the upper-left corners of the
            // neighbouring pixels.
            for y in i64::from(rect.top)..=i64::from(rect.bottom) + 1 {
                for x in i64::from(rect.left)..=i64::from(rect.right) + 1 {
                    let col = self
                        .tracer
                        .trace_pixel(x as f64, y as f64, width, height);
                    traced += 1;
                    pixels.set(x, y, col);
                    ctx.cooperate()?;
                }
            }

            for y in i64::from(rect.top)..=i64::from(rect.bottom) {
                for x in i64::from(rect.left)..=i64::from(rect.right) {
                    buffer.clear();
                    buffer.set_sample(0, 0, pixels.get(x, y));
                    buffer.set_sample(0, subsize, pixels.get(x, y + 1));
                    buffer.set_sample(subsize, 0, pixels.get(x + 1, y));
                    buffer.set_sample(subsize, subsize, pixels.get(x + 1, y + 1));

                    let refined = self.subdivide_one_pixel(
                        x as f64,
                        y as f64,
                        0.5,
                        0,
                        0,
                        subsize,
                        &mut buffer,
                        jitter_scale,
                        self.aa_depth as i32 - 1,
                        &mut samples,
                        ctx,
                    )?;
                    pixels.set(x, y, refined);
                    ctx.cooperate()?;
                }
            }

            self.tracer.after_tile();
            self.add_stats(traced, samples, 0);
            self.view.completed_rectangle(
                rect,
                serial,
                &pixels.into_pixels(),
                1,
                self.pass_contributes_to_image,
                self.pass_completes_image,
            );
            ctx.cooperate()?;
        }
        Ok(())
    }

    /// Samples the N/S/E/W/centre points of the current square if its
    /// corner colours diverge, then recurses into the four quadrants.
    fn subdivide_one_pixel(
        &mut self,
        x: f64,
        y: f64,
        d: f64,
        bx: usize,
        by: usize,
        bstep: usize,
        buffer: &mut SubdivisionBuffer,
        jitter_scale: f64,
        level: i32,
        samples: &mut u64,
        ctx: &TaskContext,
    ) -> Result<RgbtColour> {
        let (width, height) = self.image_size();
        let c00 = buffer.get(bx, by);
        let c02 = buffer.get(bx, by + bstep);
        let c20 = buffer.get(bx + bstep, by);
        let c22 = buffer.get(bx + bstep, by + bstep);
        let half = bstep / 2;

        let g00 = self.aa_gamma.encode(c00);
        let g02 = self.aa_gamma.encode(c02);
        let g20 = self.aa_gamma.encode(c20);
        let g22 = self.aa_gamma.encode(c22);

        let threshold = self.aa_threshold as f32;
        let diverged = colour_distance(g00, g02) >= threshold
            || colour_distance(g00, g20) >= threshold
            || colour_distance(g00, g22) >= threshold
            || colour_distance(g02, g20) >= threshold
            || colour_distance(g02, g22) >= threshold
            || colour_distance(g20, g22) >= threshold;

        if level <= 0 || !diverged {
            return Ok((c00 + c02 + c20 + c22) / 4.0);
        }

        let mut sample_point =
            |this: &mut Self, px: f64, py: f64, sx: usize, sy: usize, samples: &mut u64| -> Result<()> {
                if !buffer.sampled(sx, sy) {
                    let col = if jitter_scale > 0.0 {
                        let (rx, ry) = jitter_2d(px, py);
                        this.tracer.trace_pixel(
                            px + 0.5 + rx * jitter_scale,
                            py + 0.5 + ry * jitter_scale,
                            width,
                            height,
                        )
                    } else {
                        this.tracer.trace_pixel(px + 0.5, py + 0.5, width, height)
                    };
                    buffer.set_sample(sx, sy, col);
                    *samples += 1;
                    ctx.cooperate()?;
                }
                Ok(())
            };

        // West, north, east, south, centre.
        sample_point(self, x - d, y, bx, by + half, samples)?;
        sample_point(self, x, y - d, bx + half, by, samples)?;
        sample_point(self, x + d, y, bx + bstep, by + half, samples)?;
        sample_point(self, x, y + d, bx + half, by + bstep, samples)?;
        sample_point(self, x, y, bx + half, by + half, samples)?;

        let d2 = d * 0.5;
        let q00 = self.subdivide_one_pixel(
            x - d2,
            y - d2,
            d2,
            bx,
            by,
            half,
            buffer,
            jitter_scale,
            level - 1,
            samples,
            ctx,
        )?;
        let q01 = self.subdivide_one_pixel(
            x - d2,
            y + d2,
            d2,
            bx,
            by + half,
            half,
            buffer,
            jitter_scale,
            level - 1,
            samples,
            ctx,
        )?;
        let q10 = self.subdivide_one_pixel(
            x + d2,
            y - d2,
            d2,
            bx + half,
            by,
            half,
            buffer,
            jitter_scale,
            level - 1,
            samples,
            ctx,
        )?;
        let q11 = self.subdivide_one_pixel(
            x + d2,
            y + d2,
            d2,
            bx + half,
            by + half,
            half,
            buffer,
            jitter_scale,
            level - 1,
            samples,
            ctx,
        )?;

        Ok((q00 + q01 + q10 + q11) / 4.0)
    }

    // Method 3: stochastic confidence-driven sampling.
    fn stochastic_supersampling(&mut self, ctx: &TaskContext) -> Result<()> {
        let (width, height) = self.image_size();
        let min_samples = 1u32;
        let max_samples = (1u32 << (self.aa_depth * 2)).max(min_samples);

        let mut confidence_factor = Vec::with_capacity(max_samples as usize * 5);
        if max_samples > 1 {
            let z = ndtri((1.0 + self.aa_confidence) / 2.0);
            for n in 1..=(max_samples as usize * 5) {
                confidence_factor.push(z / (n as f64).sqrt());
            }
        } else {
            confidence_factor.push(0.0);
        }

        while let Some((rect, serial)) = self.view.dispatcher.next_rectangle() {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(u64::from(serial)));
            self.tracer.before_tile(self.tile_seed_offset(serial), 0);

            let area = rect.area() as usize;
            let rect_width = rect.width() as usize;
            let mut pixels: Vec<RgbtColour> = Vec::with_capacity(area);
            let mut sums: Vec<PreciseRgbt> = Vec::with_capacity(area);
            let mut sums_sqr: Vec<PreciseRgbt> = Vec::with_capacity(area);
            let mut counts: Vec<u32> = Vec::with_capacity(area);
            let mut traced = 0u64;
            let mut extra_samples = 0u64;

            loop {
                let mut sample_more = false;
                let mut index = 0usize;

                for y in rect.top..=rect.bottom {
                    for x in rect.left..=rect.right {
                        let mut neighbor_sum = PreciseRgbt::default();
                        let mut neighbor_sum_sqr = PreciseRgbt::default();
                        let mut neighbor_samples = 0u32;
                        let mut samples = 0u32;

                        if index < counts.len() {
                            samples = counts[index];
                            neighbor_sum = sums[index];
                            neighbor_sum_sqr = sums_sqr[index];
                            neighbor_samples = counts[index];
                        }

                        // Neighbours outside the tile simply do not count.
                        if x > rect.left && index >= 1 {
                            let i2 = index - 1;
                            neighbor_sum += sums[i2];
                            neighbor_sum_sqr += sums_sqr[i2];
                            neighbor_samples += counts[i2];
                        }
                        if y > rect.top && index >= rect_width {
                            let i2 = index - rect_width;
                            neighbor_sum += sums[i2];
                            neighbor_sum_sqr += sums_sqr[i2];
                            neighbor_samples += counts[i2];
                        }
                        if x < rect.right && index + 1 < counts.len() {
                            let i2 = index + 1;
                            neighbor_sum += sums[i2];
                            neighbor_sum_sqr += sums_sqr[i2];
                            neighbor_samples += counts[i2];
                        }
                        if y < rect.bottom && index + rect_width < counts.len() {
                            let i2 = index + rect_width;
                            neighbor_sum += sums[i2];
                            neighbor_sum_sqr += sums_sqr[i2];
                            neighbor_samples += counts[i2];
                        }

                        loop {
                            if samples >= min_samples {
                                if samples >= max_samples {
                                    break;
                                }
                                let variance = (neighbor_sum_sqr
                                    - neighbor_sum.sqr() / f64::from(neighbor_samples))
                                    / f64::from(neighbor_samples - 1);
                                let cf_index = ((neighbor_samples - 1) as usize)
                                    .min(confidence_factor.len() - 1);
                                let confidence_delta = variance.sqrt() * confidence_factor[cf_index];
                                if confidence_delta.sum() <= self.aa_threshold {
                                    break;
                                }
                            }

                            let jx = rng.random::<f64>() - 0.5;
                            let jy = rng.random::<f64>() - 0.5;
                            let col_raw = self.tracer.trace_pixel(
                                f64::from(x) + 0.5 + jx,
                                f64::from(y) + 0.5 + jy,
                                width,
                                height,
                            );
                            let col = PreciseRgbt::from(self.aa_gamma.encode(col_raw));
                            let col_sqr = col.sqr();

                            if index >= counts.len() {
                                traced += 1;
                                pixels.push(col_raw);
                                sums.push(col);
                                sums_sqr.push(col_sqr);
                                counts.push(1);
                            } else {
                                extra_samples += 1;
                                pixels[index] += col_raw;
                                sums[index] += col;
                                sums_sqr[index] += col_sqr;
                                counts[index] += 1;
                            }

                            neighbor_sum += col;
                            neighbor_sum_sqr += col_sqr;
                            neighbor_samples += 1;
                            samples += 1;

                            // Any new sample can change the neighbourhood
                            // variance of adjacent pixels.
                            sample_more = true;

                            ctx.cooperate()?;

                            if samples >= min_samples {
                                break;
                            }
                        }

                        index += 1;
                    }
                }

                if !sample_more {
                    break;
                }
            }

            for (pixel, count) in pixels.iter_mut().zip(&counts) {
                *pixel /= *count as f32;
            }

            self.tracer.after_tile();
            self.add_stats(traced, extra_samples, 0);
            self.view.completed_rectangle(
                rect,
                serial,
                &pixels,
                1,
                self.pass_contributes_to_image,
                self.pass_completes_image,
            );
            ctx.cooperate()?;
        }
        Ok(())
    }
}

impl TaskPayload for TraceTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        loop {
            match self.method {
                0 => {
                    if self.preview_size > 0 {
                        self.simple_sampling_preview(ctx)?;
                    } else {
                        self.simple_sampling(ctx)?;
                    }
                }
                1 => self.non_adaptive_supersampling(ctx)?,
                2 => self.adaptive_supersampling(ctx)?,
                _ => self.stochastic_supersampling(ctx)?,
            }

            if !self.view.is_real_time() {
                break;
            }
            // Real-time mode renders frames until cancelled: meet the
            // other workers at the frame barrier, then go again.
            let Some(rtr) = self.view.rtr_data() else {
                break;
            };
            let next_camera = rtr.completed_frame(&self.view);
            ctx.cooperate()?;
            if let Some(camera) = next_camera {
                self.tracer.set_camera(camera);
            }
        }

        self.view
            .set_highest_trace_level(self.tracer.highest_trace_level());
        Ok(())
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        record_task_times(ctx, &self.thread_data, TimeKind::Render);
        Ok(())
    }
}
