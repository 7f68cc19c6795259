//! Scene Model
//!
//! [`SceneData`] is the shared state behind one scene: parse options,
//! parsed contents (objects, lights, cameras), photon and radiosity
//! settings, the global photon maps, and the collaborator services that
//! plug the parser and ray kernels into the pipeline.
//!
//! Contents are written only by the parser and bounding tasks; once
//! parsing reports done, they are read-only for the remainder of the
//! scene's lifetime and views hold shared ownership.

pub mod bounding;
pub mod camera;
pub mod parser;
#[allow(clippy::module_inception)]
pub mod scene;

use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use glam::DVec3;
use parking_lot::{Mutex, RwLock};

use crate::color::{RgbColour, RgbtColour};
use crate::errors::Result;
use crate::lighting::PhotonKernelFactory;
use crate::lighting::photon_map::PhotonMap;
use crate::messages::bus::MessageSink;
use crate::messages::{Address, Attr, Message, MessageClass, MessageIdent, Value};
use crate::render::TracerFactory;
use camera::Camera;

pub type SceneId = u32;
pub type ViewId = u32;

bitflags! {
    /// Object classification and photon-interaction flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        const INFINITE             = 1 << 0;
        const LIGHT_SOURCE         = 1 << 1;
        const COMPOUND             = 1 << 2;
        const PHOTON_TARGET        = 1 << 3;
        const NO_GLOBAL_LIGHTS     = 1 << 4;
        const PHOTON_REFLECTION_ON  = 1 << 5;
        const PHOTON_REFLECTION_OFF = 1 << 6;
        const PHOTON_REFRACTION_ON  = 1 << 7;
        const PHOTON_REFRACTION_OFF = 1 << 8;
        const IGNORE_PHOTONS       = 1 << 9;
    }
}

impl ObjectFlags {
    /// Whether the merged flag set allows any photon contribution.
    #[must_use]
    pub fn photons_enabled(self) -> bool {
        self.refraction_photons() || self.reflection_photons()
    }

    #[must_use]
    pub fn reflection_photons(self) -> bool {
        self.contains(Self::PHOTON_REFLECTION_ON) && !self.contains(Self::PHOTON_REFLECTION_OFF)
    }

    #[must_use]
    pub fn refraction_photons(self) -> bool {
        self.contains(Self::PHOTON_REFRACTION_ON) && !self.contains(Self::PHOTON_REFRACTION_OFF)
    }
}

/// Inside test supplied by the geometry kernel for objects with interiors.
pub type InsideFn = Arc<dyn Fn(DVec3) -> bool + Send + Sync>;

/// One scene object as seen by the backend: classification flags, the
/// bounding sphere used by photon targeting, and the optional interior
/// test used for the camera-inside warning. Shape and shading stay inside
/// the external kernels.
#[derive(Clone)]
pub struct SceneObject {
    pub name: String,
    pub flags: ObjectFlags,
    pub photon_density: f64,
    pub centre: DVec3,
    pub radius: f64,
    pub inside: Option<InsideFn>,
    pub children: Vec<SceneObject>,
    /// Per-view warning emitted at render shutdown (e.g. an autodetected
    /// gradient bound worth persisting into the scene file).
    pub shutdown_warning: Option<String>,
}

impl SceneObject {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: ObjectFlags::empty(),
            photon_density: 1.0,
            centre: DVec3::ZERO,
            radius: 1.0,
            inside: None,
            children: Vec::new(),
            shutdown_warning: None,
        }
    }

    #[must_use]
    pub fn has_interior(&self) -> bool {
        self.inside.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightKind {
    Point,
    Spot,
    Cylinder,
    /// Fill lights never shoot photons.
    Fill,
}

#[derive(Clone, Copy, Debug)]
pub struct AreaLight {
    pub axis1: DVec3,
    pub axis2: DVec3,
    pub size1: u32,
    pub size2: u32,
}

#[derive(Clone, Debug)]
pub struct LightSource {
    pub kind: LightKind,
    pub parallel: bool,
    pub centre: DVec3,
    pub direction: DVec3,
    pub colour: RgbColour,
    /// Spot/cylinder falloff exponent.
    pub coeff: f64,
    /// Inner (full-intensity) radius; cosine for spots, distance for
    /// cylinders.
    pub radius: f64,
    /// Outer falloff bound; cosine for spots, distance for cylinders.
    pub falloff: f64,
    pub area: Option<AreaLight>,
    pub photon_area_light: bool,
    pub photon_flags: ObjectFlags,
}

impl LightSource {
    #[must_use]
    pub fn point_at(centre: DVec3) -> Self {
        Self {
            kind: LightKind::Point,
            parallel: false,
            centre,
            direction: DVec3::Z,
            colour: RgbColour::WHITE,
            coeff: 0.0,
            radius: 0.0,
            falloff: 0.0,
            area: None,
            photon_area_light: false,
            photon_flags: ObjectFlags::empty(),
        }
    }
}

/// Merge order for photon flags: scene defaults, then the light, then the
/// target object. Later entries can only add bits, so an explicit OFF on
/// the object always wins over an ON inherited from the light.
#[must_use]
pub fn merged_photon_flags(
    scene_default: ObjectFlags,
    light: &LightSource,
    target: &SceneObject,
) -> ObjectFlags {
    scene_default | light.photon_flags | target.flags
}

#[derive(Clone, Debug)]
pub struct PhotonSettings {
    pub enabled: bool,
    /// Requested surface photon count; zero disables estimation.
    pub surface_count: u32,
    pub surface_separation: f64,
    pub jitter: f64,
    /// Negative means "use the parsed scene limit".
    pub max_trace_level: i32,
    /// Negative means "use the parsed scene bailout".
    pub adc_bailout: f64,
    /// Fraction of the maximum latitude past which a hitless ring stops
    /// the shooting loop.
    pub autostop_percent: f64,
    pub file_name: Option<PathBuf>,
    pub load_file: bool,
    pub gather_min: u32,
    pub gather_max: u32,
}

impl Default for PhotonSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            surface_count: 0,
            surface_separation: 1.0,
            jitter: 0.4,
            max_trace_level: -1,
            adc_bailout: -1.0,
            autostop_percent: 0.5,
            file_name: None,
            load_file: false,
            gather_min: 20,
            gather_max: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RadiositySettings {
    pub enabled: bool,
    /// Pretrace start/end sizes as fractions of the larger image side.
    pub pretrace_start: f64,
    pub pretrace_end: f64,
    /// Adaptive pretrace coverage target; zero disables sub-block
    /// subdivision.
    pub pretrace_coverage: f32,
    /// Whether the pretrace also renders non-radiosity features.
    pub vain_pretrace: bool,
    pub count: u32,
    pub error_bound: f64,
    pub recursion_limit: u32,
}

impl Default for RadiositySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pretrace_start: 0.08,
            pretrace_end: 0.04,
            pretrace_coverage: 0.0,
            vain_pretrace: true,
            count: 35,
            error_bound: 1.8,
            recursion_limit: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GammaSettings {
    pub working_gamma: Option<f32>,
    pub legacy_mode: i32,
}

/// Feature flags derived from the 0..9 quality level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityFlags {
    pub level: u32,
    pub ambient_only: bool,
    pub quick_colour: bool,
    pub shadows: bool,
    pub area_lights: bool,
    pub full_textures: bool,
    pub reflections: bool,
    pub refractions: bool,
    pub media: bool,
    pub radiosity: bool,
    pub photons: bool,
    pub subsurface: bool,
}

impl QualityFlags {
    #[must_use]
    pub fn from_level(level: u32) -> Self {
        let level = level.min(9);
        Self {
            level,
            ambient_only: level == 0,
            quick_colour: level <= 5,
            shadows: level >= 4,
            area_lights: level >= 5,
            full_textures: level >= 6,
            reflections: level >= 8,
            refractions: level >= 8,
            media: level >= 9,
            radiosity: level >= 9,
            photons: level >= 9,
            subsurface: level >= 9,
        }
    }
}

impl Default for QualityFlags {
    fn default() -> Self {
        Self::from_level(9)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeclaredValue {
    Float(f64),
    Str(String),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BspTunables {
    pub max_depth: u32,
    pub isect_cost: f32,
    pub base_access_cost: f32,
    pub child_access_cost: f32,
    pub miss_chance: f32,
}

/// Options recognised on `StartParser`.
#[derive(Clone, Debug)]
pub struct SceneOptions {
    pub language_version: u32,
    pub language_version_set: bool,
    pub warning_level: u32,
    pub input_file: String,
    pub header_file: String,
    pub aspect_ratio: f64,
    pub default_file_type: i32,
    pub clockless_animation: bool,
    pub split_unions: bool,
    pub remove_bounds: bool,
    /// 0 = off, 1 = slab hierarchy, 2 = BSP.
    pub bounding_method: u8,
    pub output_alpha: bool,
    pub bsp: BspTunables,
    pub real_time_raytracing: bool,
    pub declared: Vec<(String, DeclaredValue)>,
    pub clock: Option<f64>,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            language_version: 380,
            language_version_set: false,
            warning_level: 9,
            input_file: "object.pov".into(),
            header_file: String::new(),
            aspect_ratio: 160.0 / 120.0,
            default_file_type: 0,
            clockless_animation: false,
            split_unions: false,
            remove_bounds: true,
            bounding_method: 1,
            output_alpha: false,
            bsp: BspTunables::default(),
            real_time_raytracing: false,
            declared: Vec::new(),
            clock: None,
        }
    }
}

/// Everything the parser and bounding stages produce.
#[derive(Clone, Default)]
pub struct SceneContents {
    pub objects: Vec<SceneObject>,
    pub lights: Vec<LightSource>,
    pub cameras: Vec<Camera>,
    pub parsed_camera: Camera,
    pub background: RgbtColour,
    pub gamma: GammaSettings,
    pub parsed_max_trace_level: u32,
    pub parsed_adc_bailout: f64,
    /// Scene-wide photon flag defaults merged into every combo.
    pub default_photon_flags: ObjectFlags,
    pub finite_count: usize,
    pub infinite_count: usize,
    /// Effective bounding method after the bounding stage (0 when the
    /// scene fell below the threshold).
    pub bounding_method: u8,
    pub bounding_slabs: Option<bounding::SlabTree>,
}

/// Collaborator services plugged in by the embedder.
#[derive(Clone)]
pub struct BackendServices {
    pub parser: Arc<dyn parser::SceneParser>,
    pub tracers: Arc<dyn TracerFactory>,
    pub photons: Arc<dyn PhotonKernelFactory>,
}

/// Shared per-scene state.
pub struct SceneData {
    pub scene_id: SceneId,
    pub backend_address: Address,
    pub frontend_address: Address,
    pub bus: Arc<dyn MessageSink>,
    pub services: BackendServices,
    pub options: RwLock<SceneOptions>,
    pub contents: RwLock<SceneContents>,
    pub photon_settings: RwLock<PhotonSettings>,
    pub radiosity_settings: RwLock<RadiositySettings>,
    pub surface_photon_map: Mutex<PhotonMap>,
    pub media_photon_map: Mutex<PhotonMap>,
}

impl SceneData {
    #[must_use]
    pub fn new(
        scene_id: SceneId,
        backend_address: Address,
        frontend_address: Address,
        bus: Arc<dyn MessageSink>,
        services: BackendServices,
    ) -> Arc<Self> {
        Arc::new(Self {
            scene_id,
            backend_address,
            frontend_address,
            bus,
            services,
            options: RwLock::new(SceneOptions::default()),
            contents: RwLock::new(SceneContents::default()),
            photon_settings: RwLock::new(PhotonSettings::default()),
            radiosity_settings: RwLock::new(RadiositySettings::default()),
            surface_photon_map: Mutex::new(PhotonMap::new()),
            media_photon_map: Mutex::new(PhotonMap::new()),
        })
    }

    /// Resolves a logical file name through the front-end: sends the
    /// candidate list and returns the front-end's choice (empty if none).
    pub fn find_file(&self, candidates: &[String]) -> Result<String> {
        let mut msg = Message::new(MessageClass::FileAccess, MessageIdent::FindFile)
            .with_source(self.backend_address)
            .with_dest(self.frontend_address);
        msg.set_int(Attr::SceneId, i64::from(self.scene_id));
        msg.set(
            Attr::ReadFile,
            Value::List(candidates.iter().cloned().map(Value::Str).collect()),
        );
        let reply = self.bus.request(msg)?;
        Ok(reply.try_get_str(Attr::ReadFile, ""))
    }

    /// Resolves a logical name to a local path or a URL via the
    /// front-end. URLs are expected to have been downloaded into the
    /// returned local file by the front-end.
    pub fn read_file(&self, name: &str) -> Result<(String, String)> {
        let mut msg = Message::new(MessageClass::FileAccess, MessageIdent::ReadFile)
            .with_source(self.backend_address)
            .with_dest(self.frontend_address);
        msg.set_int(Attr::SceneId, i64::from(self.scene_id));
        msg.set_str(Attr::ReadFile, name);
        let reply = self.bus.request(msg)?;
        Ok((
            reply.try_get_str(Attr::LocalFile, ""),
            reply.try_get_str(Attr::FileUrl, ""),
        ))
    }

    /// Notifies the front-end that an output file was created.
    pub fn send_created_file(&self, name: &str) {
        let mut msg = Message::new(MessageClass::FileAccess, MessageIdent::CreatedFile)
            .with_source(self.backend_address)
            .with_dest(self.frontend_address);
        msg.set_int(Attr::SceneId, i64::from(self.scene_id));
        msg.set_str(Attr::CreatedFile, name);
        if self.bus.send(msg).is_err() {
            log::debug!("created-file notification dropped: transport closed");
        }
    }

    /// Effective photon trace depth: settings override or parsed value.
    #[must_use]
    pub fn photon_max_trace_level(&self) -> u32 {
        let settings = self.photon_settings.read();
        if settings.max_trace_level >= 0 {
            settings.max_trace_level as u32
        } else {
            self.contents.read().parsed_max_trace_level
        }
    }

    /// Effective photon ADC bailout: settings override or parsed value.
    #[must_use]
    pub fn photon_adc_bailout(&self) -> f64 {
        let settings = self.photon_settings.read();
        if settings.adc_bailout >= 0.0 {
            settings.adc_bailout
        } else {
            self.contents.read().parsed_adc_bailout
        }
    }
}

impl std::fmt::Debug for SceneData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneData")
            .field("scene_id", &self.scene_id)
            .finish_non_exhaustive()
    }
}

/// Walks an object list depth-first, visiting photon-target leaves the
/// way the photon stages enumerate them: compound objects recurse into
/// their children, light-source geometry is skipped.
pub fn for_each_photon_target<E>(
    objects: &[SceneObject],
    visit: &mut impl FnMut(&SceneObject) -> std::result::Result<(), E>,
) -> std::result::Result<(), E> {
    for object in objects {
        if object.flags.contains(ObjectFlags::PHOTON_TARGET)
            && !object.flags.contains(ObjectFlags::LIGHT_SOURCE)
        {
            if !object.flags.contains(ObjectFlags::NO_GLOBAL_LIGHTS) {
                visit(object)?;
            }
        } else if object.flags.contains(ObjectFlags::COMPOUND) {
            for_each_photon_target(&object.children, visit)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_thresholds() {
        let q0 = QualityFlags::from_level(0);
        assert!(q0.ambient_only);
        assert!(!q0.shadows);
        let q5 = QualityFlags::from_level(5);
        assert!(q5.shadows && q5.area_lights && !q5.reflections);
        let q9 = QualityFlags::from_level(9);
        assert!(q9.radiosity && q9.photons && q9.media);
        // Values above the clip range behave like 9.
        assert_eq!(QualityFlags::from_level(42), q9);
    }

    #[test]
    fn photon_flag_merge_on_off_pairs() {
        let mut light = LightSource::point_at(DVec3::ZERO);
        light.photon_flags = ObjectFlags::PHOTON_REFLECTION_ON;
        let mut target = SceneObject::named("box");
        target.flags = ObjectFlags::PHOTON_TARGET;
        let merged = merged_photon_flags(ObjectFlags::empty(), &light, &target);
        assert!(merged.photons_enabled());

        target.flags |= ObjectFlags::PHOTON_REFLECTION_OFF;
        let merged = merged_photon_flags(ObjectFlags::empty(), &light, &target);
        assert!(!merged.photons_enabled());
    }

    #[test]
    fn photon_target_walk_recurses_into_compounds() {
        let mut leaf = SceneObject::named("leaf");
        leaf.flags = ObjectFlags::PHOTON_TARGET;
        let mut skipped = SceneObject::named("unlit");
        skipped.flags = ObjectFlags::PHOTON_TARGET | ObjectFlags::NO_GLOBAL_LIGHTS;
        let mut group = SceneObject::named("group");
        group.flags = ObjectFlags::COMPOUND;
        group.children = vec![leaf, skipped];

        let mut seen = Vec::new();
        let _ = for_each_photon_target::<()>(&[group], &mut |o| {
            seen.push(o.name.clone());
            Ok(())
        });
        assert_eq!(seen, vec!["leaf".to_owned()]);
    }
}
