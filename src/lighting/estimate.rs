//! Photon Count Estimation
//!
//! The first photon stage walks the scene without tracing a single ray:
//! for every (light, target) pair that can receive photons it estimates
//! the number of photons the shooting loops would emit, then rescales
//! the global surface separation so the expected total matches the
//! requested surface photon count.

use std::f64::consts::PI;
use std::sync::Arc;

use crate::errors::Result;
use crate::render::record_task_times;
use crate::scene::{LightKind, ObjectFlags, for_each_photon_target, merged_photon_flags};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::view::ViewData;
use super::strategy::{ShootingDirection, TargetInfo};

pub struct PhotonEstimationTask {
    view: Arc<ViewData>,
    thread_data: SharedThreadData,
    photon_count_estimate: f64,
}

impl PhotonEstimationTask {
    #[must_use]
    pub fn new(view: Arc<ViewData>, thread_data: SharedThreadData) -> Self {
        Self {
            view,
            thread_data,
            photon_count_estimate: 0.0,
        }
    }

    #[must_use]
    pub fn estimate(&self) -> f64 {
        self.photon_count_estimate
    }
}

impl TaskPayload for PhotonEstimationTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        let scene = &self.view.scene_data;
        {
            let settings = scene.photon_settings.read();
            if !settings.enabled || settings.surface_count == 0 {
                return Ok(());
            }
        }
        ctx.cooperate()?;

        let separation = scene.photon_settings.read().surface_separation;
        let contents = scene.contents.read();
        let mut estimate = 0.0f64;

        for light in &contents.lights {
            if light.kind == LightKind::Fill {
                continue;
            }
            for_each_photon_target(&contents.objects, &mut |target| {
                let merged = merged_photon_flags(contents.default_photon_flags, light, target);
                if !merged.photons_enabled() {
                    return Ok(());
                }

                let target_info = TargetInfo::from(target);
                let shooting = ShootingDirection::new(light, &target_info);

                // Expected ring count over the target's solid angle: the
                // subtended radius divided by the spacing, squared, times
                // pi.
                let spacing = target.photon_density * separation;
                if spacing <= 0.0 {
                    return Ok(());
                }
                let mut x = shooting.rad / spacing;
                x = x * x * PI;

                if merged.refraction_photons() && merged.reflection_photons() {
                    // Both contributions roughly half again as many rays.
                    x *= 1.5;
                }
                if !merged.contains(ObjectFlags::IGNORE_PHOTONS) && merged.refraction_photons() {
                    if merged.reflection_photons() {
                        x *= 3.0;
                    } else {
                        x *= 2.0;
                    }
                }
                // Roughly half the rays hit the target.
                x *= 0.5;

                estimate += x;
                ctx.cooperate()
            })?;
        }
        drop(contents);

        self.photon_count_estimate = estimate;

        let mut settings = scene.photon_settings.write();
        let factor = (estimate / f64::from(settings.surface_count)).sqrt();
        if factor.is_finite() && factor > 0.0 {
            settings.surface_separation *= factor;
        }
        log::debug!(
            "photon estimate {:.0}, surface separation now {:.6}",
            estimate,
            settings.surface_separation
        );

        ctx.cooperate()
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        record_task_times(ctx, &self.thread_data, TimeKind::Photon);
        Ok(())
    }
}
