//! Shared test harness: an in-process front-end wired to a backend with
//! pluggable parser, tracer and photon kernels.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prism::lighting::CallbackPhotonKernelFactory;
use prism::messages::bus::ChannelBus;
use prism::render::CallbackTracerFactory;
use prism::scene::parser::{FixedSceneParser, ParsedScene};
use prism::scene::{BackendServices, SceneId, ViewId};
use prism::{Address, Attr, Message, MessageClass, MessageIdent, RenderBackend, RgbtColour};

pub const BACKEND_ADDRESS: Address = 1;
pub const FRONTEND_ADDRESS: Address = 7;
pub const INTRUDER_ADDRESS: Address = 13;

/// Counts every traced sample alongside a colour function.
pub struct RayCounter {
    pub rays: Arc<AtomicU64>,
}

impl RayCounter {
    pub fn count(&self) -> u64 {
        self.rays.load(Ordering::SeqCst)
    }
}

pub struct TestFrontend {
    pub backend: RenderBackend,
    pub rx: flume::Receiver<Message>,
    pub reply_tx: flume::Sender<Message>,
}

pub fn services(
    scene: ParsedScene,
    tracer: impl Fn(f64, f64, f64, f64) -> RgbtColour + Send + Sync + 'static,
) -> BackendServices {
    BackendServices {
        parser: Arc::new(FixedSceneParser::new(scene)),
        tracers: Arc::new(CallbackTracerFactory::new(Arc::new(tracer))),
        photons: Arc::new(CallbackPhotonKernelFactory::new(Arc::new(
            |_ray, _colour, _target, _surface, _media| false,
        ))),
    }
}

pub fn harness(services: BackendServices) -> TestFrontend {
    static LOG_INIT: std::sync::Once = std::sync::Once::new();
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });

    let (bus, rx, reply_tx) = ChannelBus::endpoint();
    let backend = RenderBackend::new(
        Arc::new(bus),
        BACKEND_ADDRESS,
        Arc::new(|addr| addr == FRONTEND_ADDRESS),
        services,
    );
    TestFrontend {
        backend,
        rx,
        reply_tx,
    }
}

/// A tracer that counts rays and delegates to a colour function.
pub fn counting_tracer(
    colour: impl Fn(f64, f64) -> RgbtColour + Send + Sync + 'static,
) -> (
    impl Fn(f64, f64, f64, f64) -> RgbtColour + Send + Sync + 'static,
    RayCounter,
) {
    let rays = Arc::new(AtomicU64::new(0));
    let counter = RayCounter {
        rays: Arc::clone(&rays),
    };
    let tracer = move |x: f64, y: f64, _w: f64, _h: f64| {
        rays.fetch_add(1, Ordering::SeqCst);
        colour(x, y)
    };
    (tracer, counter)
}

impl TestFrontend {
    pub fn request(&mut self, class: MessageClass, ident: MessageIdent) -> Message {
        Message::new(class, ident)
            .with_source(FRONTEND_ADDRESS)
            .with_dest(BACKEND_ADDRESS)
    }

    pub fn send(&mut self, msg: Message) {
        self.backend.handle_message(&msg);
    }

    /// Blocks until a message with the given class/ident arrives,
    /// discarding everything else on the way.
    pub fn wait_for(&self, class: MessageClass, ident: MessageIdent) -> Message {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for message");
            let msg = self
                .rx
                .recv_timeout(remaining)
                .expect("message channel drained before the expected message");
            if msg.class == class && msg.ident == ident {
                return msg;
            }
        }
    }

    /// Collects messages until one matches class/ident; returns
    /// (collected, terminal).
    pub fn collect_until(
        &self,
        class: MessageClass,
        ident: MessageIdent,
    ) -> (Vec<Message>, Message) {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut collected = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out collecting messages");
            let msg = self
                .rx
                .recv_timeout(remaining)
                .expect("message channel drained before the terminal message");
            if msg.class == class && msg.ident == ident {
                return (collected, msg);
            }
            collected.push(msg);
        }
    }

    pub fn drain(&self) -> Vec<Message> {
        let mut drained = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            drained.push(msg);
        }
        drained
    }

    pub fn create_scene(&mut self) -> SceneId {
        let msg = self.request(MessageClass::BackendControl, MessageIdent::CreateScene);
        self.send(msg);
        let reply = self.wait_for(MessageClass::BackendControl, MessageIdent::Done);
        reply.try_get_int(Attr::SceneId, 0) as SceneId
    }

    /// Starts the parser and waits for the scene's Done message.
    pub fn parse_scene(&mut self, scene_id: SceneId) {
        let mut msg = self.request(MessageClass::SceneControl, MessageIdent::StartParser);
        msg.set_int(Attr::SceneId, i64::from(scene_id));
        self.send(msg);
        self.wait_for(MessageClass::SceneOutput, MessageIdent::Done);
    }

    pub fn create_view(&mut self, scene_id: SceneId, width: u32, height: u32) -> ViewId {
        let mut msg = self.request(MessageClass::SceneControl, MessageIdent::CreateView);
        msg.set_int(Attr::SceneId, i64::from(scene_id));
        msg.set_int(Attr::Width, i64::from(width));
        msg.set_int(Attr::Height, i64::from(height));
        self.send(msg);
        let reply = self.wait_for(MessageClass::SceneControl, MessageIdent::Done);
        reply.try_get_int(Attr::ViewId, 0) as ViewId
    }

    pub fn start_render(&mut self, view_id: ViewId, configure: impl FnOnce(&mut Message)) {
        let mut msg = self.request(MessageClass::ViewControl, MessageIdent::StartRender);
        msg.set_int(Attr::ViewId, i64::from(view_id));
        configure(&mut msg);
        self.send(msg);
    }

    /// Runs a render to completion; returns every message produced up to
    /// (excluding) the view Done.
    pub fn render_to_done(
        &mut self,
        view_id: ViewId,
        configure: impl FnOnce(&mut Message),
    ) -> Vec<Message> {
        self.start_render(view_id, configure);
        let (messages, _done) = self.collect_until(MessageClass::ViewOutput, MessageIdent::Done);
        messages
    }
}

/// Counts messages matching a predicate.
pub fn count_messages(messages: &[Message], pred: impl Fn(&Message) -> bool) -> usize {
    messages.iter().filter(|m| pred(m)).count()
}
