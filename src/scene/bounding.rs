//! Bounding Stage
//!
//! Runs after parsing: partitions the object list (finite objects first),
//! records the object statistics, and builds the slab hierarchy used for
//! point containment queries such as the camera-inside-object warning.
//! The bounding stage always runs, even with bounding disabled, because
//! it also produces the object counts reported in parser statistics.

use std::sync::Arc;

use glam::DVec3;

use crate::errors::Result;
use crate::scene::{ObjectFlags, SceneData, SceneObject};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};

/// Axis-aligned box over an object's bounding sphere.
#[derive(Clone, Copy, Debug)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    #[must_use]
    pub fn of_object(object: &SceneObject) -> Self {
        let r = DVec3::splat(object.radius);
        Self {
            min: object.centre - r,
            max: object.centre + r,
        }
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[must_use]
    pub fn contains(&self, p: DVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    #[must_use]
    fn longest_axis(&self) -> usize {
        let d = self.max - self.min;
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }
}

/// A slab hierarchy over the finite objects, built by median split on the
/// longest axis. Leaves index into the scene's object list.
#[derive(Clone, Debug)]
pub struct SlabTree {
    pub bbox: Aabb,
    kind: SlabKind,
}

#[derive(Clone, Debug)]
enum SlabKind {
    Leaf(usize),
    Branch(Vec<SlabTree>),
}

const SLAB_LEAF_FANOUT: usize = 4;

impl SlabTree {
    /// Builds the tree over the finite prefix of the object list.
    #[must_use]
    pub fn build(objects: &[SceneObject], finite_count: usize) -> Option<Self> {
        let mut entries: Vec<(usize, Aabb)> = objects[..finite_count]
            .iter()
            .enumerate()
            .map(|(i, o)| (i, Aabb::of_object(o)))
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(Self::build_range(&mut entries))
    }

    fn build_range(entries: &mut [(usize, Aabb)]) -> Self {
        let bbox = entries
            .iter()
            .map(|(_, b)| *b)
            .reduce(Aabb::union)
            .expect("non-empty range");

        if entries.len() <= SLAB_LEAF_FANOUT {
            let children = entries
                .iter()
                .map(|(i, b)| SlabTree {
                    bbox: *b,
                    kind: SlabKind::Leaf(*i),
                })
                .collect();
            return SlabTree {
                bbox,
                kind: SlabKind::Branch(children),
            };
        }

        let axis = bbox.longest_axis();
        let mid = entries.len() / 2;
        entries.select_nth_unstable_by(mid, |a, b| {
            let ca = (a.1.min[axis] + a.1.max[axis]) * 0.5;
            let cb = (b.1.min[axis] + b.1.max[axis]) * 0.5;
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });
        let (lo, hi) = entries.split_at_mut(mid);
        SlabTree {
            bbox,
            kind: SlabKind::Branch(vec![Self::build_range(lo), Self::build_range(hi)]),
        }
    }

    /// True when the point lies inside any bounded object that has a
    /// defined interior.
    #[must_use]
    pub fn contains_interior_point(&self, objects: &[SceneObject], p: DVec3) -> bool {
        if !self.bbox.contains(p) {
            return false;
        }
        match &self.kind {
            SlabKind::Leaf(index) => {
                let object = &objects[*index];
                object
                    .inside
                    .as_ref()
                    .is_some_and(|inside| inside(p))
            }
            SlabKind::Branch(children) => children
                .iter()
                .any(|child| child.contains_interior_point(objects, p)),
        }
    }
}

/// The bounding task: partition, count, and build the hierarchy.
pub struct BoundingTask {
    scene: Arc<SceneData>,
    threshold: u32,
    thread_data: SharedThreadData,
}

impl BoundingTask {
    #[must_use]
    pub fn new(scene: Arc<SceneData>, threshold: u32, thread_data: SharedThreadData) -> Self {
        Self {
            scene,
            threshold,
            thread_data,
        }
    }
}

impl TaskPayload for BoundingTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        ctx.cooperate()?;

        let requested_method = self.scene.options.read().bounding_method;
        let mut contents = self.scene.contents.write();

        // Finite objects first; the infinite-object statistic excludes
        // light-source geometry.
        let objects = std::mem::take(&mut contents.objects);
        let (finite, infinite): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .partition(|o| !o.flags.contains(ObjectFlags::INFINITE));
        let infinite_lights = infinite
            .iter()
            .filter(|o| o.flags.contains(ObjectFlags::LIGHT_SOURCE))
            .count();

        contents.finite_count = finite.len();
        contents.infinite_count = infinite.len() - infinite_lights;
        contents.objects = finite;
        contents.objects.extend(infinite);

        let total = contents.objects.len();
        if total < self.threshold as usize || requested_method == 0 {
            contents.bounding_method = 0;
            contents.bounding_slabs = None;
            log::debug!("bounding skipped for {total} objects (threshold {})", self.threshold);
            return Ok(());
        }

        // Both the slab method and the BSP method feed the same point
        // containment queries here; tree construction heuristics beyond
        // the median split live in the intersection kernel.
        contents.bounding_method = requested_method;
        let finite_count = contents.finite_count;
        contents.bounding_slabs = SlabTree::build(&contents.objects, finite_count);
        Ok(())
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        let mut data = self.thread_data.lock();
        data.time_kind = TimeKind::Bounding;
        data.real_time_ms = ctx.consumed_real_time_ms();
        data.cpu_time_ms = ctx.consumed_cpu_time_ms();
        Ok(())
    }
}
