//! Parser Stage
//!
//! The scene description parser is an external collaborator; this module
//! defines its contract and the task that runs it on the pipeline. The
//! parser receives the scene handle (for options and file-resolution
//! RPCs), a message factory for diagnostics, and the task context for
//! cooperative cancellation.

use std::sync::Arc;

use crate::color::RgbtColour;
use crate::errors::Result;
use crate::messages::factory::MessageFactory;
use crate::scene::camera::Camera;
use crate::scene::{
    GammaSettings, LightSource, ObjectFlags, PhotonSettings, RadiositySettings, SceneData,
    SceneObject,
};
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};

/// Everything a successful parse produces.
#[derive(Clone)]
pub struct ParsedScene {
    pub objects: Vec<SceneObject>,
    pub lights: Vec<LightSource>,
    pub cameras: Vec<Camera>,
    pub camera: Camera,
    pub background: RgbtColour,
    pub gamma: GammaSettings,
    pub max_trace_level: u32,
    pub adc_bailout: f64,
    pub default_photon_flags: ObjectFlags,
    pub photon_settings: PhotonSettings,
    pub radiosity_settings: RadiositySettings,
}

impl Default for ParsedScene {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            lights: Vec::new(),
            cameras: Vec::new(),
            camera: Camera::default(),
            // Fully transparent background; composited at parse end when
            // no alpha channel is requested.
            background: RgbtColour::new(0.0, 0.0, 0.0, 1.0),
            gamma: GammaSettings::default(),
            max_trace_level: 5,
            adc_bailout: 1.0 / 255.0,
            default_photon_flags: ObjectFlags::empty(),
            photon_settings: PhotonSettings::default(),
            radiosity_settings: RadiositySettings::default(),
        }
    }
}

/// The parser contract.
pub trait SceneParser: Send + Sync {
    fn parse(
        &self,
        scene: &SceneData,
        messages: &MessageFactory,
        ctx: &TaskContext,
    ) -> Result<ParsedScene>;
}

/// A parser that returns a prebuilt scene; the reference implementation
/// for embedders that assemble scenes programmatically, and the workhorse
/// of the test suites.
pub struct FixedSceneParser {
    scene: ParsedScene,
}

impl FixedSceneParser {
    #[must_use]
    pub fn new(scene: ParsedScene) -> Self {
        Self { scene }
    }
}

impl SceneParser for FixedSceneParser {
    fn parse(
        &self,
        _scene: &SceneData,
        _messages: &MessageFactory,
        ctx: &TaskContext,
    ) -> Result<ParsedScene> {
        ctx.cooperate()?;
        Ok(self.scene.clone())
    }
}

/// Runs the parser and installs its output into the scene.
pub struct ParserTask {
    scene: Arc<SceneData>,
    messages: Arc<MessageFactory>,
    thread_data: SharedThreadData,
}

impl ParserTask {
    #[must_use]
    pub fn new(
        scene: Arc<SceneData>,
        messages: Arc<MessageFactory>,
        thread_data: SharedThreadData,
    ) -> Self {
        Self {
            scene,
            messages,
            thread_data,
        }
    }
}

impl TaskPayload for ParserTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        let parser = Arc::clone(&self.scene.services.parser);
        let mut parsed = parser.parse(&self.scene, &self.messages, ctx)?;

        let output_alpha = self.scene.options.read().output_alpha;
        if !output_alpha {
            // No alpha channel requested: composite the background
            // against opaque black.
            parsed.background.transm = 0.0;
        }

        let mut contents = self.scene.contents.write();
        contents.objects = parsed.objects;
        contents.lights = parsed.lights;
        contents.parsed_camera = parsed.camera;
        contents.cameras = if parsed.cameras.is_empty() {
            vec![parsed.camera]
        } else {
            parsed.cameras
        };
        contents.background = parsed.background;
        contents.gamma = parsed.gamma;
        contents.parsed_max_trace_level = parsed.max_trace_level;
        contents.parsed_adc_bailout = parsed.adc_bailout;
        contents.default_photon_flags = parsed.default_photon_flags;
        drop(contents);

        *self.scene.photon_settings.write() = parsed.photon_settings;
        *self.scene.radiosity_settings.write() = parsed.radiosity_settings;

        log::debug!(
            "scene {} parsed: {} objects, {} lights",
            self.scene.scene_id,
            self.scene.contents.read().objects.len(),
            self.scene.contents.read().lights.len()
        );
        Ok(())
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        let mut data = self.thread_data.lock();
        data.time_kind = TimeKind::Parse;
        data.real_time_ms = ctx.consumed_real_time_ms();
        data.cpu_time_ms = ctx.consumed_cpu_time_ms();
        Ok(())
    }
}
