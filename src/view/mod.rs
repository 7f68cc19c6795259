//! View Lifecycle
//!
//! A [`View`] renders one (scene, camera, width, height) combination. It
//! owns the render task queue, a control thread that drains it, the
//! shared [`ViewData`] (tile dispatcher, camera, radiosity cache), and
//! the per-task accounting records folded into the final statistics.
//!
//! `start_render` translates the option message into the staged pipeline:
//! photons, radiosity pretrace, the mosaic preview cascade, the final
//! trace pass, shutdown warnings, statistics, and the done message —
//! every stage separated by barriers, with a dispatcher reset function
//! between stages that share the tile traversal.

pub mod dispatch;
pub mod rtr;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glam::DVec2;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;

use crate::backend::egress;
use crate::color::{GammaCurve, RgbtColour};
use crate::errors::{Failure, RenderError, Result, codes};
use crate::lighting::estimate::PhotonEstimationTask;
use crate::lighting::photon_map::PhotonMap;
use crate::lighting::shooting::PhotonShootingTask;
use crate::lighting::sorting::PhotonSortingTask;
use crate::lighting::strategy::{PhotonShootingStrategy, PhotonStrategyTask};
use crate::math::{RectInt, make_power_of_two, reduce_to_coprime};
use crate::messages::factory::{MessageFactory, WarningLevel};
use crate::messages::{Attr, Message, MessageClass, MessageIdent, Value};
use crate::render::radiosity::{PRETRACE_FIRST, PRETRACE_MAX, RadiosityTask};
use crate::render::radiosity_cache::RadiosityCache;
use crate::render::trace::TraceTask;
use crate::scene::camera::{Camera, LookAtOutcome};
use crate::scene::{QualityFlags, SceneData, ViewId};
use crate::support::queue::TaskQueue;
use crate::support::task::{FatalErrorSink, Task};
use crate::support::thread_data::{
    SharedThreadData, ThreadData, TimeKind, aggregate_stats, aggregate_times,
};
use dispatch::{TileDispatcher, TileGeometry};
use rtr::RtrData;

const DEFAULT_BLOCK_SIZE: u32 = 32;
const CONTROL_IDLE: Duration = Duration::from_millis(50);

fn clip<T: PartialOrd>(v: T, lo: T, hi: T) -> T {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

/// Shared per-render state for one view.
pub struct ViewData {
    pub view_id: ViewId,
    pub scene_data: Arc<SceneData>,
    pub width: u32,
    pub height: u32,
    pub dispatcher: TileDispatcher,
    pub quality: RwLock<QualityFlags>,
    pub camera: RwLock<Camera>,
    pub radiosity_cache: Arc<RadiosityCache>,
    highest_trace_level: AtomicU32,
    real_time: AtomicBool,
    stochastic_seed: AtomicU64,
    rtr: RwLock<Option<Arc<RtrData>>>,
}

impl ViewData {
    #[must_use]
    pub fn new(scene_data: Arc<SceneData>, width: u32, height: u32, view_id: ViewId) -> Arc<Self> {
        let geometry = TileGeometry::new(
            RectInt::new(0, 0, width.max(1) - 1, height.max(1) - 1),
            DEFAULT_BLOCK_SIZE.min(width.max(4)).max(4),
            0,
            0,
        );
        Arc::new(Self {
            view_id,
            scene_data,
            width,
            height,
            dispatcher: TileDispatcher::new(geometry),
            quality: RwLock::new(QualityFlags::default()),
            camera: RwLock::new(Camera::default()),
            radiosity_cache: Arc::new(RadiosityCache::new()),
            highest_trace_level: AtomicU32::new(0),
            real_time: AtomicBool::new(false),
            stochastic_seed: AtomicU64::new(0),
            rtr: RwLock::new(None),
        })
    }

    /// Monotone maximum across all trace workers; guarded separately
    /// from the dispatcher state.
    pub fn set_highest_trace_level(&self, level: u32) {
        self.highest_trace_level.fetch_max(level, Ordering::Relaxed);
    }

    #[must_use]
    pub fn highest_trace_level(&self) -> u32 {
        self.highest_trace_level.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_real_time(&self) -> bool {
        self.real_time.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rtr_data(&self) -> Option<Arc<RtrData>> {
        self.rtr.read().clone()
    }

    /// Base seed for the stochastic sampler; per-tile generators add the
    /// tile serial.
    #[must_use]
    pub fn stochastic_seed(&self) -> u64 {
        self.stochastic_seed.load(Ordering::Relaxed)
    }

    /// Completion of a dense tile: emits a `PixelBlockSet` (or stores the
    /// tile into the real-time frame buffer) and updates progress.
    pub fn completed_rectangle(
        &self,
        rect: RectInt,
        serial: u32,
        pixels: &[RgbtColour],
        size: u32,
        relevant: bool,
        complete: bool,
    ) {
        if self.is_real_time() {
            if let Some(rtr) = self.rtr_data() {
                rtr.store_rectangle(rect, pixels);
            }
        } else {
            let mut msg = Message::new(MessageClass::ViewImage, MessageIdent::PixelBlockSet)
                .with_source(self.scene_data.backend_address)
                .with_dest(self.scene_data.frontend_address);
            let mut floats = Vec::with_capacity(pixels.len() * 5);
            for c in pixels {
                floats.extend_from_slice(&[c.red, c.green, c.blue, 0.0, c.transm]);
            }
            msg.set(Attr::PixelBlock, Value::FloatList(floats));
            if relevant {
                msg.set_void(Attr::PixelFinal);
            }
            if complete {
                // Only completely rendered blocks carry an id; continue
                // trace uses it to identify blocks it can skip.
                msg.set_int(Attr::PixelId, i64::from(serial));
            }
            msg.set_int(Attr::PixelSize, i64::from(size));
            msg.set_int(Attr::Left, i64::from(rect.left));
            msg.set_int(Attr::Top, i64::from(rect.top));
            msg.set_int(Attr::Right, i64::from(rect.right));
            msg.set_int(Attr::Bottom, i64::from(rect.bottom));
            msg.set_int(Attr::ViewId, i64::from(self.view_id));
            if self.scene_data.bus.send(msg).is_err() {
                log::debug!("pixel block dropped: transport closed");
            }
        }

        self.completed_rectangle_progress(rect, serial, 1.0, None);
    }

    /// Completion of a sparse tile (preview mosaics, radiosity
    /// pretrace): emits a `PixelSet` of positions and colours.
    pub fn completed_rectangle_sparse(
        &self,
        rect: RectInt,
        serial: u32,
        positions: &[DVec2],
        colors: &[RgbtColour],
        size: u32,
        relevant: bool,
        complete: bool,
        completion: f32,
        info: Option<dispatch::BlockInfo>,
    ) {
        debug_assert_eq!(positions.len(), colors.len());
        let mut msg = Message::new(MessageClass::ViewImage, MessageIdent::PixelSet)
            .with_source(self.scene_data.backend_address)
            .with_dest(self.scene_data.frontend_address);
        let mut position_ints = Vec::with_capacity(positions.len() * 2);
        for p in positions {
            position_ints.push(p.x as i64);
            position_ints.push(p.y as i64);
        }
        let mut floats = Vec::with_capacity(colors.len() * 5);
        for c in colors {
            floats.extend_from_slice(&[c.red, c.green, c.blue, 0.0, c.transm]);
        }
        msg.set(Attr::PixelPositions, Value::IntList(position_ints));
        msg.set(Attr::PixelColors, Value::FloatList(floats));
        if relevant {
            msg.set_void(Attr::PixelFinal);
        }
        if complete {
            msg.set_int(Attr::PixelId, i64::from(serial));
        }
        msg.set_int(Attr::PixelSize, i64::from(size));
        msg.set_int(Attr::ViewId, i64::from(self.view_id));
        if self.scene_data.bus.send(msg).is_err() {
            log::debug!("pixel set dropped: transport closed");
        }

        self.completed_rectangle_progress(rect, serial, completion, info);
    }

    /// Progress-only completion: dispatcher bookkeeping plus a progress
    /// message (suppressed in real-time mode, where progress is
    /// per-frame).
    pub fn completed_rectangle_progress(
        &self,
        rect: RectInt,
        serial: u32,
        completion: f32,
        info: Option<dispatch::BlockInfo>,
    ) {
        let snapshot = self.dispatcher.completed(rect, serial, completion, info);
        if self.is_real_time() {
            return;
        }
        let mut msg = Message::new(MessageClass::ViewOutput, MessageIdent::Progress);
        msg.set_int(Attr::Pixels, snapshot.total_pixels as i64);
        msg.set_int(Attr::PixelsPending, snapshot.pixels_pending as i64);
        msg.set_int(Attr::PixelsCompleted, snapshot.pixels_completed as i64);
        egress::send_view_output(
            &*self.scene_data.bus,
            self.view_id,
            self.scene_data.backend_address,
            self.scene_data.frontend_address,
            MessageIdent::Progress,
            msg,
        );
    }

    /// True when the point sits inside any object with a defined
    /// interior; uses the bounding hierarchy when one was built.
    #[must_use]
    pub fn camera_inside_object(&self, point: glam::DVec3) -> bool {
        let contents = self.scene_data.contents.read();
        if let Some(tree) = &contents.bounding_slabs {
            if tree.contains_interior_point(&contents.objects, point) {
                return true;
            }
            // Infinite objects sit outside the tree.
            return contents.objects[contents.finite_count..]
                .iter()
                .any(|o| o.inside.as_ref().is_some_and(|inside| inside(point)));
        }
        contents
            .objects
            .iter()
            .any(|o| o.inside.as_ref().is_some_and(|inside| inside(point)))
    }
}

impl std::fmt::Debug for ViewData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewData")
            .field("view_id", &self.view_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

pub struct View {
    data: Arc<ViewData>,
    render_tasks: Arc<TaskQueue>,
    stop_requested: Arc<AtomicBool>,
    control_thread: Mutex<Option<JoinHandle<()>>>,
    thread_data: Arc<Mutex<Vec<SharedThreadData>>>,
    messages: Arc<MessageFactory>,
}

impl View {
    #[must_use]
    pub fn new(scene_data: Arc<SceneData>, width: u32, height: u32, view_id: ViewId) -> Self {
        let messages = Arc::new(MessageFactory::new(
            scene_data.options.read().warning_level,
            "Render",
            scene_data.backend_address,
            scene_data.frontend_address,
            scene_data.scene_id,
            view_id,
            Arc::clone(&scene_data.bus),
        ));
        Self {
            render_tasks: Arc::new(TaskQueue::new(Arc::clone(&scene_data.bus))),
            data: ViewData::new(scene_data, width, height, view_id),
            stop_requested: Arc::new(AtomicBool::new(false)),
            control_thread: Mutex::new(None),
            thread_data: Arc::new(Mutex::new(Vec::new())),
            messages,
        }
    }

    #[must_use]
    pub fn view_data(&self) -> &Arc<ViewData> {
        &self.data
    }

    fn fatal_sink(&self) -> FatalErrorSink {
        let messages = Arc::clone(&self.messages);
        Arc::new(move |err| messages.fatal(err))
    }

    fn track(&self, data: &SharedThreadData) {
        self.thread_data.lock().push(Arc::clone(data));
    }

    /// Parses render options and schedules the full render pipeline.
    pub fn start_render(&self, opts: &Message) -> Result<()> {
        {
            let mut control = self.control_thread.lock();
            if control.is_none() {
                let queue = Arc::clone(&self.render_tasks);
                let stop = Arc::clone(&self.stop_requested);
                let data = Arc::clone(&self.data);
                *control = Some(
                    std::thread::Builder::new()
                        .name(format!("prism-view-{}", self.data.view_id))
                        .spawn(move || control_loop(&queue, &stop, &data))
                        .expect("control thread spawn"),
                );
            }
        }

        let quality = QualityFlags::from_level(clip(opts.try_get_int(Attr::Quality, 9), 0, 9) as u32);
        *self.data.quality.write() = quality;

        let mut tracing_method = 0u32;
        if opts.try_get_bool(Attr::Antialias, false) {
            tracing_method = clip(opts.try_get_int(Attr::SamplingMethod, 1), 0, 3) as u32;
        }

        let aa_depth = clip(opts.try_get_int(Attr::AntialiasDepth, 3), 1, 9) as u32;
        let aa_threshold = clip(opts.try_get_float(Attr::AntialiasThreshold, 0.3), 0.0, 1.0);
        let aa_confidence = clip(opts.try_get_float(Attr::AntialiasConfidence, 0.9), 0.0, 1.0);
        let jitter_scale = if opts.try_get_bool(Attr::Jitter, true) {
            clip(opts.try_get_float(Attr::JitterAmount, 1.0), 0.0, 1.0)
        } else {
            0.0
        };

        let aa_gamma_value = opts.try_get_float(Attr::AntialiasGamma, 2.5);
        // Distance tests run in an encoded space: the antialias gamma
        // when one is given, else the scene's working gamma, else linear.
        let aa_gamma = {
            let working = self.data.scene_data.contents.read().gamma.working_gamma;
            if aa_gamma_value > 0.0 {
                GammaCurve::power_law(aa_gamma_value as f32)
            } else {
                working.map_or(GammaCurve::IDENTITY, GammaCurve::power_law)
            }
        };

        let mut preview_start_size =
            make_power_of_two(clip(opts.try_get_int(Attr::PreviewStartSize, 1), 1, 64) as u32);
        let mut preview_end_size = make_power_of_two(clip(
            opts.try_get_int(Attr::PreviewEndSize, 1),
            1,
            i64::from(preview_start_size),
        ) as u32);
        if preview_end_size == 2 && tracing_method == 0 {
            // Render every pixel exactly once.
            preview_end_size = 1;
        }

        let high_reproducibility = opts.try_get_bool(Attr::HighReproducibility, false);

        let mut seed = opts.try_get_int(Attr::StochasticSeed, 0) as u64;
        if seed == 0 {
            seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1);
        }
        self.data.stochastic_seed.store(seed, Ordering::Relaxed);

        // Radiosity cache persistence.
        let load_cache = opts.try_get_bool(Attr::RadiosityFromFile, false);
        let save_cache = opts.try_get_bool(Attr::RadiosityToFile, false);
        if load_cache || save_cache {
            let cache_file =
                PathBuf::from(opts.try_get_str(Attr::RadiosityFileName, "object.rca"));
            let mut loaded = false;
            if load_cache {
                loaded = match self.data.radiosity_cache.load(&cache_file) {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        self.messages.warning(
                            WarningLevel::General,
                            &format!("Could not load radiosity cache: {e}"),
                        );
                        false
                    }
                };
            }
            if save_cache {
                self.data
                    .radiosity_cache
                    .init_autosave(cache_file, loaded);
            }
        }

        {
            let mut settings = self.data.scene_data.radiosity_settings.write();
            settings.vain_pretrace = opts.try_get_bool(Attr::RadiosityVainPretrace, true);
            settings.enabled = settings.enabled && quality.radiosity;
        }
        {
            let parsed_level = self.data.scene_data.contents.read().parsed_max_trace_level;
            let parsed_bailout = self.data.scene_data.contents.read().parsed_adc_bailout;
            let mut settings = self.data.scene_data.photon_settings.write();
            settings.enabled = settings.enabled && quality.photons;
            if settings.max_trace_level < 0 {
                settings.max_trace_level = parsed_level as i32;
            }
            if settings.adc_bailout < 0.0 {
                settings.adc_bailout = parsed_bailout;
            }
        }

        // Render area: fractional values select a proportion of the
        // image, anything else is a one-based absolute pixel coordinate.
        let width = self.data.width;
        let height = self.data.height;
        let ra_left = opts.try_get_float(Attr::Left, 1.0);
        let ra_top = opts.try_get_float(Attr::Top, 1.0);
        let ra_right = opts.try_get_float(Attr::Right, f64::from(width));
        let ra_bottom = opts.try_get_float(Attr::Bottom, f64::from(height));

        let left = if (0.0..1.0).contains(&ra_left) {
            (f64::from(width) * ra_left) as i64
        } else {
            ra_left as i64 - 1
        };
        let top = if (0.0..1.0).contains(&ra_top) {
            (f64::from(height) * ra_top) as i64
        } else {
            (ra_top - 1.0) as i64
        };
        let right = if (0.0..=1.0).contains(&ra_right) {
            (f64::from(width) * ra_right) as i64 - 1
        } else {
            (ra_right - 1.0) as i64
        };
        let bottom = if (0.0..=1.0).contains(&ra_bottom) {
            (f64::from(height) * ra_bottom) as i64 - 1
        } else {
            (ra_bottom - 1.0) as i64
        };

        if left < 0 || top < 0 || left >= i64::from(width) || top >= i64::from(height) {
            return Err(RenderError::Param("invalid start column or row".into()));
        }
        if right < left || bottom < top || right >= i64::from(width) || bottom >= i64::from(height)
        {
            return Err(RenderError::Param("invalid end column or row".into()));
        }
        let render_area = RectInt::new(left as u32, top as u32, right as u32, bottom as u32);

        let mut block_size = opts.try_get_int(Attr::RenderBlockSize, 32) as u32;
        block_size = block_size.max(4);
        block_size = block_size.min(render_area.width().max(render_area.height()));

        let pattern = clip(opts.try_get_int(Attr::RenderPattern, 0), 0, 5) as u32;
        let geometry = TileGeometry::new(render_area, block_size, pattern, 0);
        let mut step = opts.try_get_int(Attr::RenderBlockStep, 0) as u32;
        if step > 0 {
            step = reduce_to_coprime(step, geometry.block_count());
        }
        let geometry = TileGeometry { step, ..geometry };
        self.data.dispatcher.configure(geometry);

        // Continue trace: first block plus the already-rendered ids.
        let next_block = opts.try_get_int(Attr::PixelId, 0).max(0) as u32;
        let mut skip_list = FxHashSet::default();
        for id in opts.get_int_list(Attr::PixelSkipList) {
            skip_list.insert(id as u32);
        }
        let skip_shared = Arc::new(skip_list);
        self.data
            .dispatcher
            .set_next_rectangle((*skip_shared).clone(), next_block);

        let max_render_threads = opts.try_get_int(Attr::MaxRenderThreads, 1).max(1) as u32;

        let real_time = opts.try_get_bool(Attr::RealTimeRaytracing, false);
        self.data.real_time.store(real_time, Ordering::Relaxed);
        if real_time {
            *self.data.rtr.write() = Some(Arc::new(RtrData::new(width, height, max_render_threads)));
        }

        self.apply_camera(opts);

        if self
            .data
            .camera_inside_object(self.data.camera.read().location)
        {
            self.messages.warning(
                WarningLevel::General,
                "Camera is inside a non-hollow object. Fog and participating media may not work as expected.",
            );
        }

        if preview_end_size > 1 && tracing_method == 0 {
            self.messages.warning(
                WarningLevel::Advice,
                "A mosaic preview end size of one performs best when rendering without anti-aliasing.",
            );
        }

        self.schedule_photons(max_render_threads, seed);
        self.schedule_radiosity(
            max_render_threads,
            high_reproducibility,
            seed,
            &skip_shared,
            next_block,
        );

        // The sampling passes: preview cascade, then the final trace.
        let trace_params = TraceParams {
            jitter_scale,
            aa_threshold,
            aa_confidence,
            aa_depth,
            aa_gamma,
            high_reproducibility,
            seed,
        };

        if preview_start_size > 1 {
            // When the mosaic goes all the way down to single-pixel size
            // without anti-aliasing, the last stage is the final image.
            let preview_is_final_pass = preview_end_size == 1 && tracing_method == 0;

            self.schedule_trace_batch(
                max_render_threads,
                &trace_params,
                TracePass {
                    method: 0,
                    preview_size: preview_start_size,
                    skip_corner: false,
                    contributes: preview_is_final_pass,
                },
            );

            let mut step_size = preview_start_size >> 1;
            while step_size >= preview_end_size && step_size >= 1 {
                self.append_dispatcher_reset(&skip_shared, next_block);
                self.schedule_trace_batch(
                    max_render_threads,
                    &trace_params,
                    TracePass {
                        method: 0,
                        preview_size: step_size,
                        skip_corner: true,
                        contributes: preview_is_final_pass,
                    },
                );
                step_size >>= 1;
            }

            if !preview_is_final_pass {
                self.append_dispatcher_reset(&skip_shared, next_block);
                self.schedule_trace_batch(
                    max_render_threads,
                    &trace_params,
                    TracePass {
                        method: tracing_method,
                        preview_size: 0,
                        skip_corner: false,
                        contributes: true,
                    },
                );
            }
        } else {
            self.schedule_trace_batch(
                max_render_threads,
                &trace_params,
                TracePass {
                    method: tracing_method,
                    preview_size: 0,
                    skip_corner: false,
                    contributes: true,
                },
            );
        }

        self.render_tasks.append_sync();

        // Per-object shutdown warnings (e.g. autodetected bounds worth
        // writing back into the scene).
        let data = Arc::clone(&self.data);
        let messages = Arc::clone(&self.messages);
        self.render_tasks.append_function(move |_q| {
            dispatch_shutdown_messages(&data, &messages);
        });
        self.render_tasks.append_sync();

        let data = Arc::clone(&self.data);
        let thread_data = Arc::clone(&self.thread_data);
        self.render_tasks
            .append_function(move |_q| send_statistics(&data, &thread_data));

        let mut done = Message::new(MessageClass::ViewOutput, MessageIdent::Done)
            .with_source(self.data.scene_data.backend_address)
            .with_dest(self.data.scene_data.frontend_address);
        done.set_int(Attr::ViewId, i64::from(self.data.view_id));
        self.render_tasks.append_message(done);

        Ok(())
    }

    fn apply_camera(&self, opts: &Message) {
        let parsed = self.data.scene_data.contents.read().parsed_camera;
        let mut camera = parsed;

        if let Some(override_attrs) = opts.get_object(Attr::SceneCamera) {
            let vec_of = |key: Attr| -> Option<glam::DVec3> {
                match override_attrs.get(&key) {
                    Some(Value::Vec3(v)) => Some(glam::DVec3::from_array(*v)),
                    _ => None,
                }
            };
            if let Some(v) = vec_of(Attr::CameraLocation) {
                camera.location = v;
            }
            if let Some(v) = vec_of(Attr::CameraDirection) {
                camera.direction = v;
            }
            if let Some(v) = vec_of(Attr::CameraUp) {
                camera.up = v;
            }
            if let Some(v) = vec_of(Attr::CameraRight) {
                camera.right = v;
            }
            if let Some(v) = vec_of(Attr::CameraSky) {
                camera.sky = v;
            }
            let had_look_at = vec_of(Attr::CameraLookAt).inspect(|v| camera.look_at = *v);

            if had_look_at.is_some() {
                match camera.apply_look_at() {
                    LookAtOutcome::Applied => {}
                    LookAtOutcome::DegenerateDirection => self.messages.warning(
                        WarningLevel::General,
                        "Camera location and look_at point must be different.",
                    ),
                    LookAtOutcome::RightRestored => self.messages.warning(
                        WarningLevel::General,
                        "Camera location to look_at direction and sky direction should be different.\nUsing default/supplied right vector instead.",
                    ),
                }
            }
        }

        *self.data.camera.write() = camera;
    }

    fn schedule_photons(&self, max_render_threads: u32, seed: u64) {
        let scene = &self.data.scene_data;
        if !scene.photon_settings.read().enabled {
            return;
        }

        let (load_file, file_name) = {
            let settings = scene.photon_settings.read();
            (settings.load_file, settings.file_name.clone())
        };

        if load_file && file_name.is_some() {
            // Loading from disk replaces estimate, strategy and shooting;
            // the sorting task reads the file and rebuilds the kd-trees.
            let sort_data = ThreadData::shared();
            self.track(&sort_data);
            self.render_tasks.append_task(Task::new(
                "photon-sort",
                Box::new(PhotonSortingTask::load_from_file(
                    Arc::clone(&self.data),
                    Arc::clone(&self.messages),
                    sort_data,
                    seed,
                )),
                self.fatal_sink(),
            ));
            self.render_tasks.append_sync();
            return;
        }

        let strategy = Arc::new(PhotonShootingStrategy::new());

        let estimate_data = ThreadData::shared();
        self.track(&estimate_data);
        self.render_tasks.append_task(Task::new(
            "photon-estimate",
            Box::new(PhotonEstimationTask::new(
                Arc::clone(&self.data),
                estimate_data,
            )),
            self.fatal_sink(),
        ));
        self.render_tasks.append_sync();

        let strategy_data = ThreadData::shared();
        self.track(&strategy_data);
        self.render_tasks.append_task(Task::new(
            "photon-strategy",
            Box::new(PhotonStrategyTask::new(
                Arc::clone(&self.data),
                Arc::clone(&strategy),
                Arc::clone(&self.messages),
                strategy_data,
            )),
            self.fatal_sink(),
        ));
        self.render_tasks.append_sync();

        let mut surface_maps = Vec::new();
        let mut media_maps = Vec::new();
        for worker in 0..max_render_threads {
            let surface_map = Arc::new(Mutex::new(PhotonMap::new()));
            let media_map = Arc::new(Mutex::new(PhotonMap::new()));
            surface_maps.push(Arc::clone(&surface_map));
            media_maps.push(Arc::clone(&media_map));

            let shoot_data = ThreadData::shared();
            self.track(&shoot_data);
            self.render_tasks.append_task(Task::new(
                "photon-shoot",
                Box::new(PhotonShootingTask::new(
                    Arc::clone(&self.data),
                    Arc::clone(&strategy),
                    surface_map,
                    media_map,
                    shoot_data,
                    seed.wrapping_add(u64::from(worker)),
                )),
                self.fatal_sink(),
            ));
        }
        self.render_tasks.append_sync();

        let sort_data = ThreadData::shared();
        self.track(&sort_data);
        self.render_tasks.append_task(Task::new(
            "photon-sort",
            Box::new(PhotonSortingTask::new(
                Arc::clone(&self.data),
                surface_maps,
                media_maps,
                Arc::clone(&self.messages),
                sort_data,
                seed,
            )),
            self.fatal_sink(),
        ));
        self.render_tasks.append_sync();
    }

    fn schedule_radiosity(
        &self,
        max_render_threads: u32,
        high_reproducibility: bool,
        seed: u64,
        skip_list: &Arc<FxHashSet<u32>>,
        first_block: u32,
    ) {
        let scene = &self.data.scene_data;
        if !scene.radiosity_settings.read().enabled {
            return;
        }

        let (pretrace_start, pretrace_end) = {
            let settings = scene.radiosity_settings.read();
            (settings.pretrace_start, settings.pretrace_end)
        };

        let max_side = f64::from(self.data.width.max(self.data.height));
        let mut start_size = max_side * pretrace_start;
        let mut end_size = max_side * pretrace_end;
        if end_size < 1.0 {
            end_size = 1.0;
            self.messages.warning(
                WarningLevel::General,
                &format!(
                    "Radiosity pretrace end too low for the selected resolution. Pretrace will be\nstopped early, corresponding to a value of {:.6}.",
                    end_size / max_side
                ),
            );
        }

        let mut steps =
            (((start_size / end_size).ln() / 2f64.ln() + (1.0 - 1e-10)).floor() as i64 + 1).max(0);
        let max_steps = i64::from(PRETRACE_MAX - PRETRACE_FIRST - 1);
        if steps > max_steps {
            steps = max_steps;
            start_size = end_size * 2f64.powi(steps as i32);
            self.messages.warning(
                WarningLevel::General,
                &format!(
                    "Too many radiosity pretrace steps. Pretrace will be started late,\ncorresponding to a value of {start_size:.6}."
                ),
            );
        }

        if high_reproducibility {
            let mut nominal_threads = 1u32;
            let mut step_size = start_size;
            for step in 0..steps as u32 {
                let actual_threads = nominal_threads.min(max_render_threads);
                let actual_size = step_size.max(end_size);

                for _ in 0..actual_threads {
                    let rad_data = ThreadData::shared();
                    self.track(&rad_data);
                    self.render_tasks.append_task(Task::new(
                        "radiosity",
                        Box::new(RadiosityTask::new(
                            Arc::clone(&self.data),
                            actual_size,
                            actual_size,
                            PRETRACE_FIRST + step,
                            1,
                            nominal_threads,
                            rad_data,
                            seed,
                        )),
                        self.fatal_sink(),
                    ));
                }
                self.render_tasks.append_sync();
                self.append_dispatcher_reset(skip_list, first_block);

                step_size *= 0.5;
                nominal_threads *= 2;
            }
        } else if steps > 0 {
            for _ in 0..max_render_threads {
                let rad_data = ThreadData::shared();
                self.track(&rad_data);
                self.render_tasks.append_task(Task::new(
                    "radiosity",
                    Box::new(RadiosityTask::new(
                        Arc::clone(&self.data),
                        start_size,
                        end_size,
                        PRETRACE_FIRST,
                        steps as u32,
                        0,
                        rad_data,
                        seed,
                    )),
                    self.fatal_sink(),
                ));
            }
            self.render_tasks.append_sync();
            self.append_dispatcher_reset(skip_list, first_block);
        }
    }

    /// Appends a dispatcher reset followed by a barrier so the next
    /// stage's workers observe a clean traversal.
    fn append_dispatcher_reset(&self, skip_list: &Arc<FxHashSet<u32>>, first_block: u32) {
        let data = Arc::clone(&self.data);
        let skip = Arc::clone(skip_list);
        self.render_tasks.append_function(move |_q| {
            data.dispatcher.set_next_rectangle((*skip).clone(), first_block);
        });
        self.render_tasks.append_sync();
    }

    fn schedule_trace_batch(&self, count: u32, params: &TraceParams, pass: TracePass) {
        for _ in 0..count {
            let trace_data = ThreadData::shared();
            self.track(&trace_data);
            self.render_tasks.append_task(Task::new(
                "trace",
                Box::new(TraceTask::new(
                    Arc::clone(&self.data),
                    pass.method,
                    params.jitter_scale,
                    params.aa_threshold,
                    params.aa_confidence,
                    params.aa_depth,
                    params.aa_gamma,
                    pass.preview_size,
                    pass.skip_corner,
                    pass.contributes,
                    params.high_reproducibility,
                    trace_data,
                    params.seed,
                )),
                self.fatal_sink(),
            ));
        }
    }

    pub fn stop_render(&self) {
        self.render_tasks.stop();
        egress::send_view_failed_result(
            &*self.data.scene_data.bus,
            self.data.view_id,
            &Failure::from_code(codes::USER_ABORT),
            self.data.scene_data.backend_address,
            self.data.scene_data.frontend_address,
        );
    }

    pub fn pause_render(&self) {
        self.render_tasks.pause();
    }

    pub fn resume_render(&self) {
        self.render_tasks.resume();
    }

    #[must_use]
    pub fn is_rendering(&self) -> bool {
        self.render_tasks.is_running()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.render_tasks.is_paused()
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.render_tasks.failed()
    }
}

impl Drop for View {
    fn drop(&mut self) {
        // Raise the stop flag before stopping the queue so the control
        // loop cannot re-enter a blocking process call.
        self.stop_requested.store(true, Ordering::SeqCst);
        self.render_tasks.stop();
        if let Some(handle) = self.control_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct TraceParams {
    jitter_scale: f64,
    aa_threshold: f64,
    aa_confidence: f64,
    aa_depth: u32,
    aa_gamma: GammaCurve,
    high_reproducibility: bool,
    seed: u64,
}

struct TracePass {
    method: u32,
    preview_size: u32,
    skip_corner: bool,
    contributes: bool,
}

fn control_loop(queue: &Arc<TaskQueue>, stop: &Arc<AtomicBool>, data: &Arc<ViewData>) {
    let mut sent_failed_result = false;

    while !stop.load(Ordering::SeqCst) {
        while queue.process() && !stop.load(Ordering::SeqCst) {}

        if queue.is_done() && queue.failed() && !sent_failed_result {
            let failure = queue
                .failure()
                .unwrap_or_else(|| Failure::from_code(codes::UNCATEGORIZED));
            egress::send_view_failed_result(
                &*data.scene_data.bus,
                data.view_id,
                &failure,
                data.scene_data.backend_address,
                data.scene_data.frontend_address,
            );
            sent_failed_result = true;
        }

        if !stop.load(Ordering::SeqCst) {
            std::thread::yield_now();
            std::thread::sleep(CONTROL_IDLE);
        }
    }
}

fn dispatch_shutdown_messages(data: &Arc<ViewData>, messages: &Arc<MessageFactory>) {
    let contents = data.scene_data.contents.read();
    for object in &contents.objects {
        if let Some(warning) = &object.shutdown_warning {
            messages.warning(WarningLevel::General, warning);
        }
    }
}

fn send_statistics(data: &Arc<ViewData>, thread_data: &Arc<Mutex<Vec<SharedThreadData>>>) {
    let mut records = thread_data.lock();
    let stats = aggregate_stats(&records);
    let buckets = aggregate_times(&records);

    let mut msg = Message::new(MessageClass::ViewOutput, MessageIdent::RenderStatistics);
    msg.set_int(Attr::Width, i64::from(data.width));
    msg.set_int(Attr::Height, i64::from(data.height));
    msg.set_int(Attr::Pixels, stats.pixels as i64);
    msg.set_int(Attr::PixelSamples, stats.samples as i64);
    msg.set_int(Attr::SupersampledPixels, stats.supersampled_pixels as i64);
    msg.set_int(Attr::Rays, stats.rays as i64);
    msg.set_int(Attr::PhotonsShot, stats.photons_shot as i64);
    msg.set_int(Attr::PhotonsStored, stats.surface_photons_stored as i64);
    msg.set_int(Attr::MediaPhotonsStored, stats.media_photons_stored as i64);
    msg.set_int(Attr::TraceLevel, i64::from(data.highest_trace_level()));
    msg.set_int(
        Attr::MaxTraceLevel,
        i64::from(data.scene_data.contents.read().parsed_max_trace_level),
    );

    for (kind, key) in [
        (TimeKind::Photon, Attr::PhotonTime),
        (TimeKind::Radiosity, Attr::RadiosityTime),
        (TimeKind::Render, Attr::TraceTime),
    ] {
        let bucket = buckets[kind as usize];
        if bucket.samples > 0 {
            let mut elapsed = crate::messages::Attributes::default();
            elapsed.insert(Attr::RealTime, Value::Int(bucket.real_time_ms));
            if bucket.cpu_time_ms >= 0 {
                elapsed.insert(Attr::CpuTime, Value::Int(bucket.cpu_time_ms));
            }
            elapsed.insert(Attr::TimeSamples, Value::Int(bucket.samples as i64));
            msg.set(key, Value::Object(elapsed));
        }
    }

    egress::send_view_output(
        &*data.scene_data.bus,
        data.view_id,
        data.scene_data.backend_address,
        data.scene_data.frontend_address,
        MessageIdent::RenderStatistics,
        msg,
    );

    if let Err(e) = data.radiosity_cache.flush_autosave() {
        log::warn!("radiosity cache autosave failed: {e}");
    }

    records.clear();
}
