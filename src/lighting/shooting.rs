//! Photon Shooting Workers
//!
//! N shooter tasks run concurrently, popping work units from the shared
//! strategy. Each unit is a latitude slice of one (light, target) combo;
//! the worker walks its rings, spacing longitude samples by
//! `dtheta / sin(theta)` (or `dtheta / radius` for parallel lights),
//! jitters every ray, expands area lights into an origin grid, applies
//! the spot/cylinder attenuation, and hands the ray to the photon kernel
//! with the worker's private maps.
//!
//! Once the target has been hit at least once, a completely hitless ring
//! past the auto-stop fraction of the maximum latitude ends the combo
//! early.

use std::f64::consts::PI;
use std::sync::Arc;

use glam::{DQuat, DVec3};
use parking_lot::Mutex;

use crate::backend::egress;
use crate::errors::Result;
use crate::math::RandomDoubleSequence;
use crate::messages::{Attr, Message, MessageClass, MessageIdent};
use crate::render::record_task_times;
use crate::scene::{LightKind, LightSource};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::support::timer::TaskTimer;
use crate::view::ViewData;
use super::photon_map::PhotonMap;
use super::strategy::{PhotonShootingStrategy, PhotonShootingUnit};
use super::{PhotonKernel, PhotonKernelContext, PhotonRay, cubic_spline};

const RNG_TABLE_SIZE: usize = 32768;
const PROGRESS_INTERVAL_MS: i64 = 1000;

pub struct PhotonShootingTask {
    view: Arc<ViewData>,
    strategy: Arc<PhotonShootingStrategy>,
    kernel: Box<dyn PhotonKernel>,
    surface_map: Arc<Mutex<PhotonMap>>,
    media_map: Arc<Mutex<PhotonMap>>,
    rng_table: RandomDoubleSequence,
    rng_seed: usize,
    jitter: f64,
    autostop_percent: f64,
    timer: TaskTimer,
    thread_data: SharedThreadData,
}

impl PhotonShootingTask {
    #[must_use]
    pub fn new(
        view: Arc<ViewData>,
        strategy: Arc<PhotonShootingStrategy>,
        surface_map: Arc<Mutex<PhotonMap>>,
        media_map: Arc<Mutex<PhotonMap>>,
        thread_data: SharedThreadData,
        seed: u64,
    ) -> Self {
        let scene = Arc::clone(&view.scene_data);
        let (jitter, autostop_percent) = {
            let settings = scene.photon_settings.read();
            (settings.jitter, settings.autostop_percent)
        };
        let kernel = scene.services.photons.create_kernel(PhotonKernelContext {
            scene: Arc::clone(&scene),
            surface_map: Arc::clone(&surface_map),
            media_map: Arc::clone(&media_map),
            max_trace_level: scene.photon_max_trace_level(),
            adc_bailout: scene.photon_adc_bailout(),
            seed,
        });
        Self {
            view,
            strategy,
            kernel,
            surface_map,
            media_map,
            rng_table: RandomDoubleSequence::new(0.0, 1.0, RNG_TABLE_SIZE),
            rng_seed: seed as usize,
            jitter,
            autostop_percent,
            timer: TaskTimer::new(),
            thread_data,
        }
    }

    fn send_progress(&mut self) {
        if self.timer.elapsed_real_ms() <= PROGRESS_INTERVAL_MS {
            return;
        }
        self.timer.reset();
        let count = self.surface_map.lock().len() + self.media_map.lock().len();
        let mut msg = Message::new(MessageClass::ViewOutput, MessageIdent::Progress);
        msg.set_int(Attr::CurrentPhotonCount, count as i64);
        egress::send_view_output(
            &*self.view.scene_data.bus,
            self.view.view_id,
            self.view.scene_data.backend_address,
            self.view.scene_data.frontend_address,
            MessageIdent::Progress,
            msg,
        );
    }

    fn shoot_unit(&mut self, unit: &PhotonShootingUnit, ctx: &TaskContext) -> Result<()> {
        let combo = &*unit.combo;
        if !combo.merged_flags.photons_enabled() {
            return Ok(());
        }

        let mut rng = self.rng_table.generator(self.rng_seed);
        let colour = combo.light.colour;
        let mut ray_counter = 0u64;
        let mut hit_at_least_once = false;

        let mut theta = unit.theta_min;
        while theta < unit.theta_max {
            ctx.cooperate()?;
            self.send_progress();
            let mut ring_hit = false;

            let dphi = if theta < 1e-9 {
                2.0 * PI
            } else if combo.light.parallel {
                // For parallel lights theta really means a radius.
                combo.dtheta / theta
            } else {
                combo.dtheta / theta.sin()
            };

            let min_phi = -PI + dphi * rng.next_value() * 0.5;
            let max_phi = PI - dphi / 2.0 + (min_phi + PI);

            let mut phi = min_phi;
            while phi < max_phi {
                let jit_phi = phi + dphi * (rng.next_value() - 0.5) * self.jitter;
                let jit_theta = theta + combo.dtheta * (rng.next_value() - 0.5) * self.jitter;

                let area_grid = combo.light.area.filter(|_| {
                    combo.light.photon_area_light && !combo.light.parallel
                });
                let (x_samples, y_samples) =
                    area_grid.map_or((1, 1), |a| (a.size1.max(1), a.size2.max(1)));

                for area_x in 0..x_samples {
                    for area_y in 0..y_samples {
                        let mut origin = combo.light.centre;
                        if let Some(area) = area_grid {
                            // Jittered sample inside this grid cell.
                            origin += area.axis1
                                * ((f64::from(area_x) + rng.next_value()) / f64::from(x_samples)
                                    - 0.5)
                                + area.axis2
                                    * ((f64::from(area_y) + rng.next_value())
                                        / f64::from(y_samples)
                                        - 0.5);
                        }

                        let direction;
                        let mut dist_from_centre = 0.0;
                        if combo.light.parallel {
                            direction = combo.light.direction;

                            // Project the target centre onto the plane
                            // through the light, then move out along the
                            // rotated left vector by the ring radius.
                            let a = direction.dot(combo.shooting.toctr);
                            origin = combo.shooting.ctr
                                + direction * (-a * combo.shooting.dist);
                            let spoke = combo.shooting.left * jit_theta;
                            let rot = DQuat::from_axis_angle(direction, jit_phi);
                            origin += rot * spoke;

                            if combo.light.kind == LightKind::Cylinder {
                                dist_from_centre = (origin - combo.light.centre).length();
                            }
                        } else {
                            let (st, ct) = jit_theta.sin_cos();
                            let v = combo.shooting.left * -st + combo.shooting.toctr * ct;
                            let rot = DQuat::from_axis_angle(combo.shooting.toctr, jit_phi);
                            direction = rot * v;
                        }

                        let mut attenuation =
                            compute_attenuation(&combo.light, direction, dist_from_centre);

                        self.thread_data.lock().stats.photons_shot += 1;

                        // Spread one photon's energy across the area
                        // light's sample grid.
                        attenuation /= f64::from(x_samples * y_samples);
                        if attenuation < 1e-5 {
                            continue;
                        }

                        let photon_colour = colour * attenuation as f32;
                        let ray = PhotonRay { origin, direction };
                        if self.kernel.trace_photon(&ray, photon_colour, &combo.target) {
                            ring_hit = true;
                        }

                        ray_counter += 1;
                        if ray_counter % 100 == 0 {
                            ctx.cooperate()?;
                            self.send_progress();
                        }
                    }
                }

                phi += dphi;
            }

            if ring_hit {
                hit_at_least_once = true;
            }
            // A hitless ring past the auto-stop latitude means the rest
            // of the cone misses too.
            if hit_at_least_once && !ring_hit && theta > self.autostop_percent * combo.max_theta {
                break;
            }

            theta += combo.dtheta;
        }
        Ok(())
    }
}

impl TaskPayload for PhotonShootingTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        if !self.view.scene_data.photon_settings.read().enabled {
            return Ok(());
        }
        ctx.cooperate()?;

        while let Some(unit) = self.strategy.next_unit() {
            self.shoot_unit(&unit, ctx)?;
        }

        self.send_progress();
        ctx.cooperate()
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        {
            let mut data = self.thread_data.lock();
            data.stats.surface_photons_stored = self.surface_map.lock().len() as u64;
            data.stats.media_photons_stored = self.media_map.lock().len() as u64;
        }
        record_task_times(ctx, &self.thread_data, TimeKind::Photon);
        Ok(())
    }
}

/// Spot and cylinder attenuation; point and fill lights pass photons
/// through unattenuated.
#[must_use]
pub fn compute_attenuation(light: &LightSource, direction: DVec3, dist_from_centre: f64) -> f64 {
    match light.kind {
        LightKind::Spot => {
            let cos_theta = direction.dot(light.direction);
            if cos_theta > 0.0 {
                let mut attenuation = cos_theta.powf(light.coeff);
                if light.radius > 0.0 {
                    attenuation *= cubic_spline(light.falloff, light.radius, cos_theta);
                }
                attenuation
            } else {
                0.0
            }
        }
        LightKind::Cylinder => {
            let k = direction.dot(light.direction);
            if k > 0.0 && dist_from_centre < light.falloff {
                let dist = 1.0 - dist_from_centre / light.falloff;
                let mut attenuation = dist.powf(light.coeff);
                if light.radius > 0.0 && dist_from_centre > light.radius {
                    attenuation *= cubic_spline(0.0, 1.0 - light.radius / light.falloff, dist);
                }
                attenuation
            } else {
                0.0
            }
        }
        LightKind::Point | LightKind::Fill => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot() -> LightSource {
        let mut light = LightSource::point_at(DVec3::ZERO);
        light.kind = LightKind::Spot;
        light.direction = DVec3::Z;
        light.coeff = 2.0;
        light.radius = 0.95;
        light.falloff = 0.8;
        light
    }

    #[test]
    fn spot_attenuation_peaks_on_axis_and_dies_behind() {
        let light = spot();
        let on_axis = compute_attenuation(&light, DVec3::Z, 0.0);
        assert!((on_axis - 1.0).abs() < 1e-12);
        assert_eq!(compute_attenuation(&light, -DVec3::Z, 0.0), 0.0);

        // Inside the falloff cone but outside the hotspot: attenuated.
        let slanted = DVec3::new(0.0, 0.35, 0.936_75).normalize();
        let a = compute_attenuation(&light, slanted, 0.0);
        assert!(a > 0.0 && a < on_axis);
    }

    #[test]
    fn cylinder_attenuation_depends_on_distance() {
        let mut light = LightSource::point_at(DVec3::ZERO);
        light.kind = LightKind::Cylinder;
        light.parallel = true;
        light.direction = DVec3::Z;
        light.coeff = 1.0;
        light.radius = 0.0;
        light.falloff = 2.0;

        let near = compute_attenuation(&light, DVec3::Z, 0.5);
        let far = compute_attenuation(&light, DVec3::Z, 1.5);
        assert!(near > far);
        assert_eq!(compute_attenuation(&light, DVec3::Z, 2.5), 0.0);
    }
}
