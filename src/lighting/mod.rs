//! Photon Pipeline
//!
//! Four stages composed on the view's task queue, separated by sync
//! barriers: estimate the photon budget, build work units per
//! (light, target) combination, shoot photons from N workers, then merge
//! the per-worker maps and sort them into kd-trees. Loading a photon file
//! from disk short-circuits straight to the sort stage.
//!
//! Photon ray traversal itself belongs to the external kernel; the
//! [`PhotonKernel`] contract receives each ray with its starting energy
//! and deposits whatever photons result into the worker's private maps.

pub mod estimate;
pub mod photon_map;
pub mod shooting;
pub mod sorting;
pub mod strategy;

use std::sync::Arc;

use glam::DVec3;
use parking_lot::Mutex;

use crate::color::RgbColour;
use crate::scene::SceneData;
use photon_map::PhotonMap;
use strategy::TargetInfo;

/// A photon ray leaving a light source.
#[derive(Clone, Copy, Debug)]
pub struct PhotonRay {
    pub origin: DVec3,
    pub direction: DVec3,
}

/// Everything a photon kernel instance is bound to. The maps are the
/// worker's private stores; only the merge stage reads them afterwards.
pub struct PhotonKernelContext {
    pub scene: Arc<SceneData>,
    pub surface_map: Arc<Mutex<PhotonMap>>,
    pub media_map: Arc<Mutex<PhotonMap>>,
    pub max_trace_level: u32,
    pub adc_bailout: f64,
    pub seed: u64,
}

/// Per-worker photon traversal kernel.
pub trait PhotonKernel: Send {
    /// Traces one photon through the scene, depositing hits into the
    /// worker's maps. Returns whether the target object was hit (drives
    /// the auto-stop heuristic).
    fn trace_photon(&mut self, ray: &PhotonRay, colour: RgbColour, target: &TargetInfo) -> bool;
}

/// Creates photon kernels; implemented by the intersection/shading
/// kernel.
pub trait PhotonKernelFactory: Send + Sync {
    fn create_kernel(&self, ctx: PhotonKernelContext) -> Box<dyn PhotonKernel>;
}

/// Kernel over a plain function; the reference implementation used by
/// the test suites.
pub type PhotonTraceFn = Arc<
    dyn Fn(&PhotonRay, RgbColour, &TargetInfo, &Mutex<PhotonMap>, &Mutex<PhotonMap>) -> bool
        + Send
        + Sync,
>;

pub struct CallbackPhotonKernelFactory {
    f: PhotonTraceFn,
}

impl CallbackPhotonKernelFactory {
    #[must_use]
    pub fn new(f: PhotonTraceFn) -> Self {
        Self { f }
    }
}

struct CallbackPhotonKernel {
    f: PhotonTraceFn,
    surface_map: Arc<Mutex<PhotonMap>>,
    media_map: Arc<Mutex<PhotonMap>>,
}

impl PhotonKernel for CallbackPhotonKernel {
    fn trace_photon(&mut self, ray: &PhotonRay, colour: RgbColour, target: &TargetInfo) -> bool {
        (self.f)(ray, colour, target, &self.surface_map, &self.media_map)
    }
}

impl PhotonKernelFactory for CallbackPhotonKernelFactory {
    fn create_kernel(&self, ctx: PhotonKernelContext) -> Box<dyn PhotonKernel> {
        Box::new(CallbackPhotonKernel {
            f: Arc::clone(&self.f),
            surface_map: ctx.surface_map,
            media_map: ctx.media_map,
        })
    }
}

/// Smooth cubic falloff between an inner full-intensity bound and an
/// outer zero bound, evaluated at `value`.
#[must_use]
pub fn cubic_spline(low: f64, high: f64, value: f64) -> f64 {
    if value <= low {
        return 0.0;
    }
    if value >= high {
        return 1.0;
    }
    let t = (value - low) / (high - low);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubic_spline_is_clamped_and_smooth() {
        assert_eq!(cubic_spline(0.2, 0.8, 0.1), 0.0);
        assert_eq!(cubic_spline(0.2, 0.8, 0.9), 1.0);
        let mid = cubic_spline(0.0, 1.0, 0.5);
        assert!((mid - 0.5).abs() < 1e-12);
        // Monotone within the span.
        let mut last = 0.0;
        for i in 0..=10 {
            let v = cubic_spline(0.0, 1.0, f64::from(i) / 10.0);
            assert!(v >= last);
            last = v;
        }
    }
}
