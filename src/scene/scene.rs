//! Scene Lifecycle
//!
//! A [`Scene`] owns the parser task queue and a control thread that
//! drains it. `start_parser` translates the option message into scene
//! options and schedules the pipeline: parse, barrier, bounding, two
//! barriers, statistics, done message. A scene can only be parsed once;
//! views can be created only after a successful parse.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::egress;
use crate::errors::{Failure, RenderError, Result, codes};
use crate::messages::factory::MessageFactory;
use crate::messages::{Attr, Message, MessageIdent, Value};
use crate::scene::bounding::BoundingTask;
use crate::scene::parser::ParserTask;
use crate::scene::{BackendServices, DeclaredValue, SceneData, SceneId, SceneOptions, ViewId};
use crate::support::queue::TaskQueue;
use crate::support::task::{FatalErrorSink, Task};
use crate::support::thread_data::{SharedThreadData, ThreadData, TimeKind, aggregate_times};
use crate::view::View;

const DEFAULT_BOUNDING_THRESHOLD: i64 = 3;
const BOUNDING_THRESHOLD_MAX: i64 = 32767;
const CONTROL_IDLE: Duration = Duration::from_millis(10);

fn clip<T: PartialOrd>(v: T, lo: T, hi: T) -> T {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

pub struct Scene {
    scene_data: Arc<SceneData>,
    parser_tasks: Arc<TaskQueue>,
    stop_requested: Arc<AtomicBool>,
    control_thread: Mutex<Option<JoinHandle<()>>>,
    thread_data: Arc<Mutex<Vec<SharedThreadData>>>,
    messages: Mutex<Arc<MessageFactory>>,
}

impl Scene {
    #[must_use]
    pub fn new(
        backend_address: u64,
        frontend_address: u64,
        scene_id: SceneId,
        bus: Arc<dyn crate::messages::bus::MessageSink>,
        services: BackendServices,
    ) -> Self {
        let scene_data = SceneData::new(
            scene_id,
            backend_address,
            frontend_address,
            Arc::clone(&bus),
            services,
        );
        let messages = Arc::new(MessageFactory::new(
            9,
            "Parse",
            backend_address,
            frontend_address,
            scene_id,
            0,
            bus,
        ));
        Self {
            parser_tasks: Arc::new(TaskQueue::new(Arc::clone(&scene_data.bus))),
            scene_data,
            stop_requested: Arc::new(AtomicBool::new(false)),
            control_thread: Mutex::new(None),
            thread_data: Arc::new(Mutex::new(Vec::new())),
            messages: Mutex::new(messages),
        }
    }

    #[must_use]
    pub fn scene_data(&self) -> &Arc<SceneData> {
        &self.scene_data
    }

    #[must_use]
    pub fn frontend_address(&self) -> u64 {
        self.scene_data.frontend_address
    }

    fn fatal_sink(&self) -> FatalErrorSink {
        let messages = Arc::clone(&self.messages.lock());
        Arc::new(move |err| messages.fatal(err))
    }

    /// Parses options and schedules the parse pipeline. A second call is
    /// ignored: a scene can only be parsed once.
    pub fn start_parser(&self, opts: &Message) {
        {
            let mut control = self.control_thread.lock();
            if control.is_some() {
                return;
            }
            let queue = Arc::clone(&self.parser_tasks);
            let stop = Arc::clone(&self.stop_requested);
            let scene_data = Arc::clone(&self.scene_data);
            *control = Some(
                std::thread::Builder::new()
                    .name(format!("prism-scene-{}", self.scene_data.scene_id))
                    .spawn(move || control_loop(&queue, &stop, &scene_data))
                    .expect("control thread spawn"),
            );
        }

        self.apply_parser_options(opts);

        // Rebind the message factory to the freshly parsed warning level.
        {
            let warning_level = self.scene_data.options.read().warning_level;
            *self.messages.lock() = Arc::new(MessageFactory::new(
                warning_level,
                "Parse",
                self.scene_data.backend_address,
                self.scene_data.frontend_address,
                self.scene_data.scene_id,
                0,
                Arc::clone(&self.scene_data.bus),
            ));
        }

        let parse_data = ThreadData::shared();
        let bound_data = ThreadData::shared();
        self.thread_data.lock().push(Arc::clone(&parse_data));
        self.thread_data.lock().push(Arc::clone(&bound_data));

        let threshold = clip(
            opts.try_get_int(Attr::BoundingThreshold, DEFAULT_BOUNDING_THRESHOLD),
            1,
            BOUNDING_THRESHOLD_MAX,
        ) as u32;

        // Parse.
        self.parser_tasks.append_task(Task::new(
            "parse",
            Box::new(ParserTask::new(
                Arc::clone(&self.scene_data),
                Arc::clone(&self.messages.lock()),
                parse_data,
            )),
            self.fatal_sink(),
        ));
        self.parser_tasks.append_sync();

        // Bounding always runs; it also produces the object statistics.
        self.parser_tasks.append_task(Task::new(
            "bounding",
            Box::new(BoundingTask::new(
                Arc::clone(&self.scene_data),
                threshold,
                bound_data,
            )),
            self.fatal_sink(),
        ));
        self.parser_tasks.append_sync();
        self.parser_tasks.append_sync();

        let scene_data = Arc::clone(&self.scene_data);
        let thread_data = Arc::clone(&self.thread_data);
        self.parser_tasks
            .append_function(move |_q| send_statistics(&scene_data, &thread_data));

        let scene_data = Arc::clone(&self.scene_data);
        self.parser_tasks
            .append_function(move |_q| send_done_message(&scene_data));
    }

    fn apply_parser_options(&self, opts: &Message) {
        let mut options = SceneOptions::default();

        if opts.exists(Attr::Version) {
            let v = opts.try_get_float(Attr::Version, 3.8);
            options.language_version = clip((v * 100.0 + 0.5) as i64, 100, 10000) as u32;
            options.language_version_set = true;
        }

        options.warning_level = clip(opts.try_get_int(Attr::WarningLevel, 9), 0, 9) as u32;
        options.input_file = opts.try_get_str(Attr::InputFile, "object.pov");
        options.header_file = opts.try_get_str(Attr::IncludeHeader, "");

        let width = opts.try_get_float(Attr::Width, 160.0);
        let height = opts.try_get_float(Attr::Height, 120.0);
        options.aspect_ratio = width / height;

        options.default_file_type = opts.try_get_int(Attr::OutputFileType, 0) as i32;
        options.clockless_animation = opts.try_get_bool(Attr::ClocklessAnimation, false);
        options.split_unions = opts.try_get_bool(Attr::SplitUnions, false);
        options.remove_bounds = opts.try_get_bool(Attr::RemoveBounds, true);
        options.bounding_method = clip(opts.try_get_int(Attr::BoundingMethod, 1), 1, 2) as u8;
        if !opts.try_get_bool(Attr::Bounding, true) {
            options.bounding_method = 0;
        }

        options.output_alpha = opts.try_get_bool(Attr::OutputAlpha, false);

        // Zero tells the tree code to use its internal default; the miss
        // chance saturates just below one.
        options.bsp.max_depth = opts.try_get_int(Attr::BspMaxDepth, 0).max(0) as u32;
        options.bsp.isect_cost = opts.try_get_float(Attr::BspIsectCost, 0.0).max(0.0) as f32;
        options.bsp.base_access_cost =
            opts.try_get_float(Attr::BspBaseAccessCost, 0.0).max(0.0) as f32;
        options.bsp.child_access_cost =
            opts.try_get_float(Attr::BspChildAccessCost, 0.0).max(0.0) as f32;
        options.bsp.miss_chance =
            clip(opts.try_get_float(Attr::BspMissChance, 0.0), 0.0, 1.0 - 1e-6) as f32;

        options.real_time_raytracing = opts.try_get_bool(Attr::RealTimeRaytracing, false);

        if let Some(Value::List(declares)) = opts.get(Attr::Declare) {
            for entry in declares {
                let Value::Object(attrs) = entry else {
                    continue;
                };
                let Some(Value::Str(identifier)) = attrs.get(&Attr::Identifier) else {
                    continue;
                };
                let value = match attrs.get(&Attr::Value) {
                    Some(Value::Float(v)) => DeclaredValue::Float(*v),
                    Some(Value::Int(v)) => DeclaredValue::Float(*v as f64),
                    Some(Value::Str(s)) => DeclaredValue::Str(s.clone()),
                    _ => continue,
                };
                options.declared.push((identifier.clone(), value));
            }
        }

        if opts.exists(Attr::Clock) {
            options.clock = Some(opts.try_get_float(Attr::Clock, 0.0));
        }

        *self.scene_data.options.write() = options;
    }

    pub fn stop_parser(&self) {
        self.parser_tasks.stop();
        egress::send_scene_failed_result(
            &*self.scene_data.bus,
            self.scene_data.scene_id,
            &Failure::from_code(codes::USER_ABORT),
            self.scene_data.backend_address,
            self.scene_data.frontend_address,
        );
    }

    pub fn pause_parser(&self) {
        self.parser_tasks.pause();
    }

    pub fn resume_parser(&self) {
        self.parser_tasks.resume();
    }

    #[must_use]
    pub fn is_parsing(&self) -> bool {
        self.parser_tasks.is_running()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.parser_tasks.is_paused()
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.parser_tasks.failed()
    }

    /// True once the parse pipeline has fully drained.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.control_thread.lock().is_some() && self.parser_tasks.is_done()
    }

    /// Creates a view over this scene; fails with `NotNow` unless parsing
    /// finished successfully.
    pub fn new_view(&self, width: u32, height: u32, view_id: ViewId) -> Result<View> {
        if !self.is_done() || self.failed() {
            return Err(RenderError::NotNow);
        }
        Ok(View::new(
            Arc::clone(&self.scene_data),
            width,
            height,
            view_id,
        ))
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        // Order matters: raise the stop flag before stopping the queue so
        // the control loop cannot re-enter a blocking process call.
        self.stop_requested.store(true, Ordering::SeqCst);
        self.parser_tasks.stop();
        if let Some(handle) = self.control_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn control_loop(queue: &Arc<TaskQueue>, stop: &Arc<AtomicBool>, scene_data: &Arc<SceneData>) {
    let mut sent_failed_result = false;

    while !stop.load(Ordering::SeqCst) {
        while queue.process() && !stop.load(Ordering::SeqCst) {}

        if queue.is_done() && queue.failed() && !sent_failed_result {
            let failure = queue
                .failure()
                .unwrap_or_else(|| Failure::from_code(codes::UNCATEGORIZED));
            egress::send_scene_failed_result(
                &*scene_data.bus,
                scene_data.scene_id,
                &failure,
                scene_data.backend_address,
                scene_data.frontend_address,
            );
            sent_failed_result = true;
        }

        if !stop.load(Ordering::SeqCst) {
            std::thread::yield_now();
            std::thread::sleep(CONTROL_IDLE);
        }
    }
}

fn send_statistics(scene_data: &Arc<SceneData>, thread_data: &Arc<Mutex<Vec<SharedThreadData>>>) {
    let mut records = thread_data.lock();
    let buckets = aggregate_times(&records);

    let mut msg = Message::new(
        crate::messages::MessageClass::SceneOutput,
        MessageIdent::ParserStatistics,
    );
    {
        let contents = scene_data.contents.read();
        msg.set_int(Attr::FiniteObjects, contents.finite_count as i64);
        msg.set_int(Attr::InfiniteObjects, contents.infinite_count as i64);
        msg.set_int(Attr::LightSources, contents.lights.len() as i64);
        msg.set_int(Attr::Cameras, contents.cameras.len() as i64);
    }

    for (kind, key) in [
        (TimeKind::Parse, Attr::ParseTime),
        (TimeKind::Bounding, Attr::BoundingTime),
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

    egress::send_scene_output(
        &*scene_data.bus,
        scene_data.scene_id,
        scene_data.backend_address,
        scene_data.frontend_address,
        MessageIdent::ParserStatistics,
        msg,
    );

    records.clear();
}

fn send_done_message(scene_data: &Arc<SceneData>) {
    let mut msg = Message::new(
        crate::messages::MessageClass::SceneOutput,
        MessageIdent::Done,
    );
    let gamma = scene_data.contents.read().gamma;
    msg.set_int(Attr::LegacyGammaMode, i64::from(gamma.legacy_mode));
    if let Some(working) = gamma.working_gamma {
        msg.set_float(Attr::WorkingGamma, f64::from(working));
    }
    egress::send_scene_output(
        &*scene_data.bus,
        scene_data.scene_id,
        scene_data.backend_address,
        scene_data.frontend_address,
        MessageIdent::Done,
        msg,
    );
}
