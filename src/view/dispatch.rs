//! Tile Dispatcher
//!
//! Enumerates the tiles of the render area in a configurable order and
//! hands them to worker tasks. The traversal order is a pure bijection
//! from serial numbers onto the tile grid (six patterns, optionally
//! composed with a coprime clock step), so every block is visited exactly
//! once per lap.
//!
//! Three block-ID sets steer dispatch: the skip list (blocks completed by
//! a prior aborted render), the busy set (dispatched, not yet reported
//! complete), and the postponed set (withheld by the stride-avoidance
//! rule so multi-pass stages do not sample neighbouring tiles
//! concurrently). A per-block carry-over slot preserves state between
//! passes of the same stage.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::math::RectInt;

/// Per-tile carry-over state preserved across passes. Opaque to the
/// dispatcher: it stores and returns the payload without looking inside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockInfo {
    Radiosity(RadiosityBlockInfo),
}

/// Radiosity pretrace carry-over: which pass the tile is on, the current
/// sub-block grid, accumulated completion, and the sub-blocks that still
/// need sampling.
#[derive(Clone, Debug, PartialEq)]
pub struct RadiosityBlockInfo {
    pub pass: u16,
    pub sub_block_count_x: u16,
    pub sub_block_count_y: u16,
    pub completion: f32,
    pub incomplete_sub_blocks: VecDeque<(u16, u16)>,
}

impl Default for RadiosityBlockInfo {
    fn default() -> Self {
        Self {
            pass: 0,
            sub_block_count_x: 1,
            sub_block_count_y: 1,
            completion: 0.0,
            incomplete_sub_blocks: VecDeque::from([(0, 0)]),
        }
    }
}

impl Eq for RadiosityBlockInfo {}

/// Tile grid geometry, fixed for the duration of a render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGeometry {
    pub render_area: RectInt,
    pub block_size: u32,
    pub block_width: u32,
    pub block_height: u32,
    /// Traversal pattern selector, 0..=5.
    pub pattern: u32,
    /// Coprime clock step; 0 disables clock arithmetic.
    pub step: u32,
}

impl TileGeometry {
    #[must_use]
    pub fn new(render_area: RectInt, block_size: u32, pattern: u32, step: u32) -> Self {
        let block_width = render_area.width().div_ceil(block_size);
        let block_height = render_area.height().div_ceil(block_size);
        Self {
            render_area,
            block_size,
            block_width,
            block_height,
            pattern,
            step,
        }
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_width * self.block_height
    }

    /// Maps a block serial to grid coordinates through the traversal
    /// pattern. A bijection from `[0, W*H)` onto the grid for every
    /// pattern and every step coprime with `W*H`.
    #[must_use]
    pub fn block_xy(&self, serial: u32) -> (u32, u32) {
        let w = u64::from(self.block_width);
        let h = u64::from(self.block_height);
        let size = w * h;
        let mut nb = u64::from(serial);

        if self.step > 1 {
            // Clock arithmetic: multiplication by a unit modulo W*H
            // permutes the serials.
            nb = (nb * u64::from(self.step)) % size;
        }

        // Halve-and-mirror: even indices walk inward from the low edge,
        // odd indices from the high edge.
        let fold = |v: u64, extent: u64| -> u64 {
            if v & 1 == 1 { extent - 1 - v / 2 } else { v / 2 }
        };

        let (x, y) = match self.pattern {
            1 => (nb / h, nb % h),
            2 => {
                let x = nb % w;
                let y = nb / w;
                (fold(x, w), fold(y, h))
            }
            3 => {
                let r = size - 1 - nb;
                let x = r % w;
                let y = r / w;
                (fold(x, w), fold(y, h))
            }
            4 => {
                let x = nb / h;
                let y = nb % h;
                (fold(x, w), fold(y, h))
            }
            5 => {
                let r = size - 1 - nb;
                let x = r / h;
                let y = r % h;
                (fold(x, w), fold(y, h))
            }
            _ => (nb % w, nb / w),
        };
        (x as u32, y as u32)
    }

    /// The pixel rectangle of a block, clipped to the render area.
    #[must_use]
    pub fn block_rect(&self, serial: u32) -> RectInt {
        let (bx, by) = self.block_xy(serial);
        let area = self.render_area;
        RectInt {
            left: area.left + bx * self.block_size,
            right: (area.left + (bx + 1) * self.block_size - 1).min(area.right),
            top: area.top + by * self.block_size,
            bottom: (area.top + (by + 1) * self.block_size - 1).min(area.bottom),
        }
    }
}

struct DispatchState {
    next_block: u32,
    completed_first_pass: bool,
    skip: FxHashSet<u32>,
    busy: FxHashSet<u32>,
    postponed: FxHashSet<u32>,
    info: Vec<Option<BlockInfo>>,
    pixels_pending: u64,
    pixels_completed: u64,
}

/// Progress counters snapshot taken when a rectangle completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_pixels: u64,
    pub pixels_pending: u64,
    pub pixels_completed: u64,
}

pub struct TileDispatcher {
    geometry: Mutex<TileGeometry>,
    state: Mutex<DispatchState>,
}

impl TileDispatcher {
    #[must_use]
    pub fn new(geometry: TileGeometry) -> Self {
        let blocks = geometry.block_count() as usize;
        Self {
            geometry: Mutex::new(geometry),
            state: Mutex::new(DispatchState {
                next_block: 0,
                completed_first_pass: false,
                skip: FxHashSet::default(),
                busy: FxHashSet::default(),
                postponed: FxHashSet::default(),
                info: std::iter::repeat_with(|| None).take(blocks).collect(),
                pixels_pending: 0,
                pixels_completed: 0,
            }),
        }
    }

    /// Replaces the geometry and clears all per-block state; used once
    /// per `start_render` after the options are known.
    pub fn configure(&self, geometry: TileGeometry) {
        let blocks = geometry.block_count() as usize;
        *self.geometry.lock() = geometry;
        let mut state = self.state.lock();
        state.next_block = 0;
        state.completed_first_pass = false;
        state.skip.clear();
        state.busy.clear();
        state.postponed.clear();
        state.info = std::iter::repeat_with(|| None).take(blocks).collect();
        state.pixels_pending = 0;
        state.pixels_completed = 0;
    }

    #[must_use]
    pub fn geometry(&self) -> TileGeometry {
        *self.geometry.lock()
    }

    /// Single-pass dispatch: returns the next block not on the skip
    /// list, consuming skip entries as it passes them. No wrap-around;
    /// `None` once the lap is complete.
    pub fn next_rectangle(&self) -> Option<(RectInt, u32)> {
        let geometry = *self.geometry.lock();
        let size = geometry.block_count();
        let mut state = self.state.lock();

        loop {
            if state.next_block >= size {
                return None;
            }
            let candidate = state.next_block;
            if state.skip.is_empty() || !state.skip.contains(&candidate) {
                break;
            }
            state.skip.remove(&candidate);
            state.next_block += 1;
        }

        let serial = state.next_block;
        state.next_block += 1;

        let rect = geometry.block_rect(serial);
        state.pixels_pending += rect.area();
        state.busy.insert(serial);
        Some((rect, serial))
    }

    /// Multi-pass dispatch with carry-over and stride avoidance.
    ///
    /// With `stride == 0` the traversal wraps: the first wrap marks the
    /// first pass complete, and later laps revisit only blocks that still
    /// carry info. With `stride > 0` the traversal does not wrap, and a
    /// candidate whose distance to any busy block is a multiple of the
    /// stride is postponed until the conflicting block completes.
    pub fn next_rectangle_with_info(
        &self,
        stride: u32,
    ) -> Option<(RectInt, u32, Option<BlockInfo>)> {
        let geometry = *self.geometry.lock();
        let size = geometry.block_count();
        let mut state = self.state.lock();

        let serial;
        if stride != 0 {
            let old_next_block = state.next_block;

            let postponed_pick = state.postponed.iter().copied().find(|&id| {
                !state
                    .busy
                    .iter()
                    .any(|&busy| id >= busy && (id - busy) % stride == 0)
            });

            if let Some(id) = postponed_pick {
                state.postponed.remove(&id);
                serial = id;
            } else {
                let mut newly_postponed: Vec<u32> = Vec::new();
                loop {
                    if state.next_block >= size {
                        // Nothing dispatchable this call; restart the walk
                        // from the same position next time. The locally
                        // postponed candidates are rediscovered then.
                        state.next_block = old_next_block;
                        return None;
                    }
                    let candidate = state.next_block;
                    if state.skip.is_empty() || !state.skip.contains(&candidate) {
                        let avoid = state
                            .busy
                            .iter()
                            .any(|&busy| candidate >= busy && (candidate - busy) % stride == 0);
                        if avoid {
                            newly_postponed.push(candidate);
                        } else {
                            serial = candidate;
                            state.next_block += 1;
                            break;
                        }
                    }
                    state.next_block += 1;
                }
                for id in newly_postponed {
                    state.postponed.insert(id);
                }
            }
        } else {
            let old_next_block = state.next_block;
            // Bounded to two laps: everything rejected twice means there
            // is nothing left to dispatch.
            let mut remaining = u64::from(size) * 2 + 2;
            loop {
                if state.next_block >= size {
                    state.next_block = 0;
                    state.completed_first_pass = true;
                }
                let candidate = state.next_block;
                let revisitable =
                    !state.completed_first_pass || state.info[candidate as usize].is_some();
                if revisitable
                    && (state.skip.is_empty() || !state.skip.contains(&candidate))
                    && (state.busy.is_empty() || !state.busy.contains(&candidate))
                {
                    serial = candidate;
                    state.next_block += 1;
                    break;
                }
                state.next_block += 1;
                remaining -= 1;
                if state.next_block == old_next_block || remaining == 0 {
                    return None;
                }
            }
        }

        let rect = geometry.block_rect(serial);
        state.pixels_pending += rect.area();
        state.busy.insert(serial);
        let info = state.info[serial as usize].take();
        Some((rect, serial, info))
    }

    /// Marks a block complete: removes it from the busy set, stores the
    /// carry-over payload, and advances the pixel accounting.
    pub fn completed(
        &self,
        rect: RectInt,
        serial: u32,
        completion: f32,
        info: Option<BlockInfo>,
    ) -> ProgressSnapshot {
        let geometry = *self.geometry.lock();
        let mut state = self.state.lock();
        state.busy.remove(&serial);
        state.info[serial as usize] = info;
        state.pixels_completed += (rect.area() as f64 * f64::from(completion)) as u64;
        ProgressSnapshot {
            total_pixels: geometry.render_area.area(),
            pixels_pending: (state.pixels_pending + rect.area())
                .saturating_sub(state.pixels_completed),
            pixels_completed: state.pixels_completed,
        }
    }

    /// Replaces the skip list and restarts the traversal; used between
    /// stages that share the dispatcher.
    pub fn set_next_rectangle(&self, skip: FxHashSet<u32>, first_block: u32) {
        let mut state = self.state.lock();
        state.skip = skip;
        state.busy.clear();
        state.postponed.clear();
        state.next_block = first_block;
        state.completed_first_pass = false;
        state.pixels_completed = 0;
    }

    #[must_use]
    pub fn completed_first_pass(&self) -> bool {
        self.state.lock().completed_first_pass
    }

    #[must_use]
    pub fn busy_blocks(&self) -> Vec<u32> {
        self.state.lock().busy.iter().copied().collect()
    }

    #[must_use]
    pub fn pixels_completed(&self) -> u64 {
        self.state.lock().pixels_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::reduce_to_coprime;

    fn geometry(w: u32, h: u32, bs: u32, pattern: u32, step: u32) -> TileGeometry {
        TileGeometry::new(RectInt::new(0, 0, w - 1, h - 1), bs, pattern, step)
    }

    #[test]
    fn patterns_are_bijections() {
        for pattern in 0..=5 {
            for (w, h) in [(1u32, 1u32), (4, 3), (5, 5), (7, 2), (1, 9)] {
                let size = w * h;
                for raw_step in [0u32, 1, 2, 3, 7] {
                    let step = if raw_step == 0 {
                        0
                    } else {
                        reduce_to_coprime(raw_step, size)
                    };
                    let geo = TileGeometry {
                        render_area: RectInt::new(0, 0, w * 8 - 1, h * 8 - 1),
                        block_size: 8,
                        block_width: w,
                        block_height: h,
                        pattern,
                        step,
                    };
                    let mut seen = FxHashSet::default();
                    for serial in 0..size {
                        let (x, y) = geo.block_xy(serial);
                        assert!(x < w && y < h, "pattern {pattern} out of grid");
                        assert!(
                            seen.insert((x, y)),
                            "pattern {pattern} ({w}x{h}, step {step}) revisits ({x},{y})"
                        );
                    }
                    assert_eq!(seen.len(), size as usize);
                }
            }
        }
    }

    #[test]
    fn one_lap_covers_the_render_area_exactly() {
        // 20x13 is deliberately not a multiple of the block size.
        let dispatcher = TileDispatcher::new(geometry(20, 13, 8, 2, 0));
        let mut covered = vec![0u32; 20 * 13];
        let mut serials = FxHashSet::default();
        while let Some((rect, serial)) = dispatcher.next_rectangle() {
            assert!(serials.insert(serial));
            for y in rect.top..=rect.bottom {
                for x in rect.left..=rect.right {
                    covered[(y * 20 + x) as usize] += 1;
                }
            }
            dispatcher.completed(rect, serial, 1.0, None);
        }
        assert!(covered.iter().all(|&c| c == 1), "every pixel exactly once");
        assert_eq!(serials.len(), 3 * 2);
    }

    #[test]
    fn skip_list_blocks_are_never_dispatched() {
        let dispatcher = TileDispatcher::new(geometry(16, 16, 8, 0, 0));
        let mut skip = FxHashSet::default();
        skip.insert(1);
        skip.insert(3);
        dispatcher.set_next_rectangle(skip, 0);
        let mut seen = Vec::new();
        while let Some((rect, serial)) = dispatcher.next_rectangle() {
            seen.push(serial);
            dispatcher.completed(rect, serial, 1.0, None);
        }
        assert_eq!(seen, vec![0, 2]);
    }

    #[test]
    fn first_block_offset_skips_earlier_serials() {
        let dispatcher = TileDispatcher::new(geometry(32, 8, 8, 0, 0));
        dispatcher.set_next_rectangle(FxHashSet::default(), 2);
        let mut seen = Vec::new();
        while let Some((rect, serial)) = dispatcher.next_rectangle() {
            seen.push(serial);
            dispatcher.completed(rect, serial, 1.0, None);
        }
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn wrap_revisits_only_blocks_with_carry_over() {
        let dispatcher = TileDispatcher::new(geometry(16, 16, 8, 0, 0));
        // First pass: keep carry-over only on block 2.
        let mut first = Vec::new();
        for _ in 0..4 {
            let (rect, serial, info) = dispatcher.next_rectangle_with_info(0).unwrap();
            assert!(info.is_none());
            first.push(serial);
            let carry = (serial == 2).then(|| BlockInfo::Radiosity(RadiosityBlockInfo::default()));
            dispatcher.completed(rect, serial, 0.5, carry);
        }
        assert_eq!(first, vec![0, 1, 2, 3]);

        // Second pass only returns block 2, with its payload.
        let (rect, serial, info) = dispatcher.next_rectangle_with_info(0).unwrap();
        assert_eq!(serial, 2);
        assert!(matches!(info, Some(BlockInfo::Radiosity(_))));
        assert!(dispatcher.completed_first_pass());
        dispatcher.completed(rect, serial, 0.5, None);

        assert!(dispatcher.next_rectangle_with_info(0).is_none());
    }

    #[test]
    fn stride_avoidance_postpones_conflicting_blocks() {
        // One row of 8 blocks, stride 2: while block 0 is busy, even
        // serials conflict (distance divisible by 2) and get postponed.
        let dispatcher = TileDispatcher::new(geometry(64, 1, 8, 0, 0));
        let stride = 2;

        let (r0, s0, _) = dispatcher.next_rectangle_with_info(stride).unwrap();
        assert_eq!(s0, 0);
        let (r1, s1, _) = dispatcher.next_rectangle_with_info(stride).unwrap();
        assert_eq!(s1, 1);

        // Both parities busy: everything else conflicts.
        assert!(dispatcher.next_rectangle_with_info(stride).is_none());

        dispatcher.completed(r0, s0, 1.0, None);
        let (r2, s2, _) = dispatcher.next_rectangle_with_info(stride).unwrap();
        assert_eq!(s2 % 2, 0, "freed parity is dispatched next");

        dispatcher.completed(r1, s1, 1.0, None);
        dispatcher.completed(r2, s2, 1.0, None);

        // Drain; at no point may two busy blocks share a residue class.
        let mut outstanding: Vec<(RectInt, u32)> = Vec::new();
        let mut dispatched = vec![s0, s1, s2];
        while let Some((rect, serial, _)) = dispatcher.next_rectangle_with_info(stride) {
            dispatched.push(serial);
            outstanding.push((rect, serial));
            let busy = dispatcher.busy_blocks();
            for &a in &busy {
                for &b in &busy {
                    if a != b {
                        assert_ne!((a.max(b) - a.min(b)) % stride, 0);
                    }
                }
            }
            if outstanding.len() == 2 {
                for (rect, serial) in outstanding.drain(..) {
                    dispatcher.completed(rect, serial, 1.0, None);
                }
            }
        }
        for (rect, serial) in outstanding.drain(..) {
            dispatcher.completed(rect, serial, 1.0, None);
        }
        dispatched.sort_unstable();
        assert_eq!(dispatched, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn pixel_accounting_sums_to_the_render_area() {
        let dispatcher = TileDispatcher::new(geometry(20, 13, 8, 3, 0));
        let mut sum = 0.0f64;
        while let Some((rect, serial)) = dispatcher.next_rectangle() {
            let snapshot = dispatcher.completed(rect, serial, 1.0, None);
            sum += rect.area() as f64;
            assert!(snapshot.pixels_completed <= snapshot.total_pixels);
        }
        assert!((sum - f64::from(20u32 * 13)).abs() < f64::EPSILON);
        assert_eq!(dispatcher.pixels_completed(), 20 * 13);
    }
}
