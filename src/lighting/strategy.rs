//! Photon Shooting Strategy
//!
//! The strategy stage enumerates every (light, target) pair that can
//! receive photons, derives the shooting geometry for each, and slices
//! the latitude range into work units. Units live in the strategy object
//! (which outlives all shooter workers) and are popped one at a time
//! under a mutex, giving cheap work stealing across shooters.

use std::collections::VecDeque;
use std::sync::Arc;

use glam::DVec3;
use parking_lot::Mutex;

use crate::errors::Result;
use crate::messages::factory::{MessageFactory, WarningLevel};
use crate::render::record_task_times;
use crate::scene::{
    LightKind, LightSource, ObjectFlags, SceneObject, for_each_photon_target, merged_photon_flags,
};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::view::ViewData;

/// Maximum latitude steps covered by one work unit; larger combos are
/// sliced so several shooters can share them.
const MAX_THETA_STEPS_PER_UNIT: u32 = 32;

/// The photon-relevant view of a target object.
#[derive(Clone, Debug)]
pub struct TargetInfo {
    pub name: String,
    pub centre: DVec3,
    pub radius: f64,
    pub density: f64,
    pub flags: ObjectFlags,
}

impl From<&SceneObject> for TargetInfo {
    fn from(object: &SceneObject) -> Self {
        Self {
            name: object.name.clone(),
            centre: object.centre,
            radius: object.radius,
            density: object.photon_density,
            flags: object.flags,
        }
    }
}

/// Orthonormal-ish shooting frame from a light toward a target.
#[derive(Clone, Copy, Debug)]
pub struct ShootingDirection {
    /// Unit vector from the light centre toward the target centre.
    pub toctr: DVec3,
    /// Distance between the centres.
    pub dist: f64,
    /// Target bounding-sphere radius.
    pub rad: f64,
    /// A unit vector perpendicular to `toctr`.
    pub left: DVec3,
    /// The light centre (plane anchor for parallel lights).
    pub ctr: DVec3,
}

impl ShootingDirection {
    #[must_use]
    pub fn new(light: &LightSource, target: &TargetInfo) -> Self {
        let to_target = target.centre - light.centre;
        let dist = to_target.length();
        let toctr = if dist > 1e-12 {
            to_target / dist
        } else {
            DVec3::Z
        };
        let up = if toctr.y.abs() < 0.999 {
            DVec3::Y
        } else {
            DVec3::X
        };
        let left = toctr.cross(up).normalize();
        Self {
            toctr,
            dist,
            rad: target.radius,
            left,
            ctr: light.centre,
        }
    }
}

/// One (light, target) pair with the derived angular parameters.
#[derive(Clone, Debug)]
pub struct LightTargetCombo {
    pub light: LightSource,
    pub target: TargetInfo,
    pub shooting: ShootingDirection,
    pub merged_flags: ObjectFlags,
    pub min_theta: f64,
    pub max_theta: f64,
    pub dtheta: f64,
    pub photon_spread: f64,
}

impl LightTargetCombo {
    #[must_use]
    pub fn new(
        light: &LightSource,
        target: &SceneObject,
        default_flags: ObjectFlags,
        surface_separation: f64,
    ) -> Self {
        let target_info = TargetInfo::from(target);
        let shooting = ShootingDirection::new(light, &target_info);
        let merged = merged_photon_flags(default_flags, light, target);

        let mut spread = target_info.density * surface_separation;
        let (min_theta, max_theta);
        if light.parallel {
            // For parallel lights the latitude is really a radius across
            // the target's disc.
            min_theta = 0.0;
            max_theta = shooting.rad.max(0.0);
        } else {
            min_theta = 0.0;
            if shooting.dist <= shooting.rad || shooting.dist <= 1e-12 {
                // Light inside the bounding sphere: shoot everywhere.
                max_theta = std::f64::consts::PI;
            } else {
                max_theta = (shooting.rad / shooting.dist).min(1.0).asin();
            }
            // Separation at unit distance.
            spread /= shooting.dist.max(1e-12);
        }
        let dtheta = spread.max(1e-6);

        Self {
            light: light.clone(),
            target: target_info,
            shooting,
            merged_flags: merged,
            min_theta,
            max_theta,
            dtheta,
            photon_spread: spread,
        }
    }
}

/// A contiguous latitude slice of one combo, processed by exactly one
/// shooter worker.
#[derive(Clone, Debug)]
pub struct PhotonShootingUnit {
    pub combo: Arc<LightTargetCombo>,
    pub theta_min: f64,
    pub theta_max: f64,
}

#[derive(Default)]
pub struct PhotonShootingStrategy {
    units: Mutex<VecDeque<PhotonShootingUnit>>,
}

impl PhotonShootingStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the work units for one (light, target) combination.
    pub fn create_units_for_combo(&self, combo: LightTargetCombo) {
        if !combo.merged_flags.photons_enabled() {
            return;
        }
        let combo = Arc::new(combo);
        let slice = combo.dtheta * f64::from(MAX_THETA_STEPS_PER_UNIT);
        let mut units = self.units.lock();
        let mut theta = combo.min_theta;
        while theta < combo.max_theta {
            let end = (theta + slice).min(combo.max_theta);
            units.push_back(PhotonShootingUnit {
                combo: Arc::clone(&combo),
                theta_min: theta,
                theta_max: end,
            });
            theta = end;
        }
    }

    /// Pops the next unit; shooters call this until drained.
    #[must_use]
    pub fn next_unit(&self) -> Option<PhotonShootingUnit> {
        self.units.lock().pop_front()
    }

    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.lock().len()
    }
}

/// The strategy stage task: enumerate combos, warn about awkward light
/// shapes, fill the unit queue.
pub struct PhotonStrategyTask {
    view: Arc<ViewData>,
    strategy: Arc<PhotonShootingStrategy>,
    messages: Arc<MessageFactory>,
    thread_data: SharedThreadData,
}

impl PhotonStrategyTask {
    #[must_use]
    pub fn new(
        view: Arc<ViewData>,
        strategy: Arc<PhotonShootingStrategy>,
        messages: Arc<MessageFactory>,
        thread_data: SharedThreadData,
    ) -> Self {
        Self {
            view,
            strategy,
            messages,
            thread_data,
        }
    }
}

impl TaskPayload for PhotonStrategyTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        let scene = &self.view.scene_data;
        if !scene.photon_settings.read().enabled {
            return Ok(());
        }
        ctx.cooperate()?;

        let separation = scene.photon_settings.read().surface_separation;
        let contents = scene.contents.read();

        for light in &contents.lights {
            if light.kind == LightKind::Fill {
                continue;
            }
            if light.kind == LightKind::Cylinder && !light.parallel {
                self.messages.warning(
                    WarningLevel::General,
                    "Cylinder lights should be parallel when used with photons.",
                );
            }

            for_each_photon_target(&contents.objects, &mut |target| {
                self.strategy.create_units_for_combo(LightTargetCombo::new(
                    light,
                    target,
                    contents.default_photon_flags,
                    separation,
                ));
                ctx.cooperate()
            })?;

            ctx.cooperate()?;
        }

        log::debug!(
            "photon strategy queued {} work units",
            self.strategy.unit_count()
        );
        ctx.cooperate()
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        record_task_times(ctx, &self.thread_data, TimeKind::Photon);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(radius: f64, dist: f64) -> SceneObject {
        let mut o = SceneObject::named("target");
        o.flags = ObjectFlags::PHOTON_TARGET | ObjectFlags::PHOTON_REFLECTION_ON;
        o.centre = DVec3::new(0.0, 0.0, dist);
        o.radius = radius;
        o
    }

    #[test]
    fn combo_angles_subtend_the_bounding_sphere() {
        let light = LightSource::point_at(DVec3::ZERO);
        let combo = LightTargetCombo::new(&light, &target(1.0, 10.0), ObjectFlags::empty(), 1.0);
        assert!((combo.max_theta - (1.0f64 / 10.0).asin()).abs() < 1e-12);
        assert!(combo.min_theta.abs() < f64::EPSILON);
        // Spread is measured at unit distance.
        assert!((combo.photon_spread - 0.1).abs() < 1e-12);
    }

    #[test]
    fn light_inside_bounding_sphere_shoots_everywhere() {
        let light = LightSource::point_at(DVec3::ZERO);
        let combo = LightTargetCombo::new(&light, &target(5.0, 1.0), ObjectFlags::empty(), 1.0);
        assert!((combo.max_theta - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn units_cover_the_full_range_once() {
        let strategy = PhotonShootingStrategy::new();
        let light = LightSource::point_at(DVec3::ZERO);
        let combo = LightTargetCombo::new(&light, &target(4.0, 5.0), ObjectFlags::empty(), 0.05);
        let max_theta = combo.max_theta;
        strategy.create_units_for_combo(combo);
        assert!(strategy.unit_count() > 1);

        let mut covered = 0.0;
        let mut last_end = 0.0;
        while let Some(unit) = strategy.next_unit() {
            assert!((unit.theta_min - last_end).abs() < 1e-12, "contiguous slices");
            covered += unit.theta_max - unit.theta_min;
            last_end = unit.theta_max;
        }
        assert!((covered - max_theta).abs() < 1e-9);
    }

    #[test]
    fn disabled_photon_flags_produce_no_units() {
        let strategy = PhotonShootingStrategy::new();
        let light = LightSource::point_at(DVec3::ZERO);
        let mut object = target(1.0, 10.0);
        object.flags = ObjectFlags::PHOTON_TARGET; // no reflection/refraction bits
        strategy.create_units_for_combo(LightTargetCombo::new(
            &light,
            &object,
            ObjectFlags::empty(),
            1.0,
        ));
        assert_eq!(strategy.unit_count(), 0);
    }
}
