//! Backend Controller
//!
//! The single per-process entry point for control messages. It validates
//! that every request comes from the connected front-end, maps scene and
//! view identifiers onto live objects, and dispatches lifecycle and
//! start/stop/pause/resume requests to them.
//!
//! Identifier bookkeeping uses two maps (id to scene, id to view) plus
//! two indices (scene to its views, view to its scene); a scene cannot
//! close while any of its views is still open.

pub mod egress;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::{Failure, RenderError, Result, codes};
use crate::messages::bus::MessageSink;
use crate::messages::{Address, Attr, Message, MessageClass, MessageIdent};
use crate::scene::scene::Scene;
use crate::scene::{BackendServices, SceneId, ViewId};
use crate::view::View;

/// Front-end address validation hook.
pub type AddressValidator = Arc<dyn Fn(Address) -> bool + Send + Sync>;

pub struct RenderBackend {
    bus: Arc<dyn MessageSink>,
    backend_address: Address,
    validate_frontend_address: AddressValidator,
    scenes: FxHashMap<SceneId, Arc<Scene>>,
    views: FxHashMap<ViewId, Arc<View>>,
    scene_views: FxHashMap<SceneId, FxHashSet<ViewId>>,
    view_scene: FxHashMap<ViewId, SceneId>,
    scene_counter: SceneId,
    view_counter: ViewId,
    services: BackendServices,
}

impl RenderBackend {
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageSink>,
        backend_address: Address,
        validate_frontend_address: AddressValidator,
        services: BackendServices,
    ) -> Self {
        Self {
            bus,
            backend_address,
            validate_frontend_address,
            scenes: FxHashMap::default(),
            views: FxHashMap::default(),
            scene_views: FxHashMap::default(),
            view_scene: FxHashMap::default(),
            scene_counter: 0,
            view_counter: 0,
            services,
        }
    }

    #[must_use]
    pub fn scene(&self, id: SceneId) -> Option<&Arc<Scene>> {
        self.scenes.get(&id)
    }

    #[must_use]
    pub fn view(&self, id: ViewId) -> Option<&Arc<View>> {
        self.views.get(&id)
    }

    /// Dispatches one ingress message.
    pub fn handle_message(&mut self, msg: &Message) {
        match (msg.class, msg.ident) {
            (MessageClass::BackendControl, MessageIdent::CreateScene) => self.create_scene(msg),
            (MessageClass::BackendControl, MessageIdent::CloseScene) => self.close_scene(msg),
            (MessageClass::SceneControl, MessageIdent::CreateView) => self.create_view(msg),
            (MessageClass::SceneControl, MessageIdent::CloseView) => self.close_view(msg),
            (MessageClass::SceneControl, MessageIdent::StartParser) => self.start_parser(msg),
            (MessageClass::SceneControl, MessageIdent::StopParser) => {
                self.scene_request(msg, |scene| {
                    if !scene.is_parsing() && !scene.is_paused() {
                        return Err(RenderError::NotNow);
                    }
                    scene.stop_parser();
                    Ok(())
                });
            }
            (MessageClass::SceneControl, MessageIdent::PauseParser) => {
                self.scene_request(msg, |scene| {
                    if !scene.is_parsing() && !scene.is_paused() {
                        return Err(RenderError::NotNow);
                    }
                    scene.pause_parser();
                    Ok(())
                });
            }
            (MessageClass::SceneControl, MessageIdent::ResumeParser) => {
                self.scene_request(msg, |scene| {
                    if !scene.is_parsing() && !scene.is_paused() {
                        return Err(RenderError::NotNow);
                    }
                    scene.resume_parser();
                    Ok(())
                });
            }
            (MessageClass::ViewControl, MessageIdent::StartRender) => self.start_render(msg),
            (MessageClass::ViewControl, MessageIdent::StopRender) => {
                self.view_request(msg, |view| {
                    if !view.is_rendering() && !view.is_paused() {
                        return Err(RenderError::NotNow);
                    }
                    view.stop_render();
                    Ok(())
                });
            }
            (MessageClass::ViewControl, MessageIdent::PauseRender) => {
                self.view_request(msg, |view| {
                    if !view.is_rendering() && !view.is_paused() {
                        return Err(RenderError::NotNow);
                    }
                    view.pause_render();
                    Ok(())
                });
            }
            (MessageClass::ViewControl, MessageIdent::ResumeRender) => {
                self.view_request(msg, |view| {
                    if !view.is_rendering() && !view.is_paused() {
                        return Err(RenderError::NotNow);
                    }
                    view.resume_render();
                    Ok(())
                });
            }
            (MessageClass::FileAccess, MessageIdent::ReadFile) => {
                if self.validate(msg) {
                    self.reply_failed(msg, &Failure::from_code(codes::CANNOT_HANDLE_REQUEST));
                }
            }
            _ => {
                log::debug!(
                    "unhandled message {:?}/{:?} from {}",
                    msg.class,
                    msg.ident,
                    msg.source
                );
                if self.validate(msg) {
                    self.reply_failed(msg, &Failure::from_code(codes::CANNOT_HANDLE_REQUEST));
                }
            }
        }
    }

    fn validate(&self, msg: &Message) -> bool {
        if (self.validate_frontend_address)(msg.source) {
            true
        } else {
            self.reply_failed(msg, &Failure::from_code(codes::AUTHORISATION));
            false
        }
    }

    fn reply_done(&self, request: &Message, set: impl FnOnce(&mut Message)) {
        let mut reply = request.done_reply();
        reply.source = self.backend_address;
        set(&mut reply);
        if self.bus.send(reply).is_err() {
            log::debug!("done reply dropped: transport closed");
        }
    }

    fn reply_failed(&self, request: &Message, failure: &Failure) {
        let mut reply = request.failed_reply(failure);
        reply.source = self.backend_address;
        if self.bus.send(reply).is_err() {
            log::debug!("failed reply dropped: transport closed");
        }
    }

    fn create_scene(&mut self, msg: &Message) {
        if !self.validate(msg) {
            return;
        }

        let scene_id = self.scene_counter + 1;
        let scene = Arc::new(Scene::new(
            self.backend_address,
            msg.source,
            scene_id,
            Arc::clone(&self.bus),
            self.services.clone(),
        ));
        self.scene_counter = scene_id;

        self.scenes.insert(scene_id, scene);
        self.scene_views.insert(scene_id, FxHashSet::default());

        self.reply_done(msg, |reply| {
            reply.set_int(Attr::SceneId, i64::from(scene_id));
        });
    }

    fn close_scene(&mut self, msg: &Message) {
        if !self.validate(msg) {
            return;
        }

        let scene_id = msg.try_get_int(Attr::SceneId, 0) as SceneId;
        if !self.scenes.contains_key(&scene_id) {
            self.reply_failed(msg, &Failure::from_code(codes::INVALID_IDENTIFIER));
            return;
        }
        if self
            .scene_views
            .get(&scene_id)
            .is_some_and(|views| !views.is_empty())
        {
            self.reply_failed(msg, &Failure::from_code(codes::NOT_NOW));
            return;
        }

        self.scenes.remove(&scene_id);
        self.scene_views.remove(&scene_id);
        self.reply_done(msg, |_| {});
    }

    fn create_view(&mut self, msg: &Message) {
        if !self.validate(msg) {
            return;
        }

        let scene_id = msg.try_get_int(Attr::SceneId, 0) as SceneId;
        let Some(scene) = self.scenes.get(&scene_id) else {
            self.reply_failed(msg, &Failure::from_code(codes::INVALID_IDENTIFIER));
            return;
        };

        let width = msg.try_get_int(Attr::Width, 160).max(1) as u32;
        let height = msg.try_get_int(Attr::Height, 120).max(1) as u32;
        let view_id = self.view_counter + 1;

        match scene.new_view(width, height, view_id) {
            Ok(view) => {
                self.view_counter = view_id;
                self.views.insert(view_id, Arc::new(view));
                self.view_scene.insert(view_id, scene_id);
                self.scene_views.entry(scene_id).or_default().insert(view_id);
                self.reply_done(msg, |reply| {
                    reply.set_int(Attr::ViewId, i64::from(view_id));
                });
            }
            Err(e) => self.reply_failed(msg, &e.failure()),
        }
    }

    fn close_view(&mut self, msg: &Message) {
        if !self.validate(msg) {
            return;
        }

        let view_id = msg.try_get_int(Attr::ViewId, 0) as ViewId;
        if !self.views.contains_key(&view_id) {
            self.reply_failed(msg, &Failure::from_code(codes::INVALID_IDENTIFIER));
            return;
        }

        self.views.remove(&view_id);
        if let Some(scene_id) = self.view_scene.remove(&view_id) {
            if let Some(views) = self.scene_views.get_mut(&scene_id) {
                views.remove(&view_id);
            }
        }
        self.reply_done(msg, |_| {});
    }

    /// Start requests report failures asynchronously as scene output
    /// rather than as a direct reply.
    fn start_parser(&mut self, msg: &Message) {
        let scene_id = msg.try_get_int(Attr::SceneId, 0) as SceneId;

        let outcome: Result<()> = (|| {
            if !(self.validate_frontend_address)(msg.source) {
                return Err(RenderError::Authorisation);
            }
            let scene = self
                .scenes
                .get(&scene_id)
                .ok_or(RenderError::InvalidIdentifier)?;
            scene.start_parser(msg);
            Ok(())
        })();

        if let Err(e) = outcome {
            egress::send_scene_failed_result(
                &*self.bus,
                scene_id,
                &e.failure(),
                self.backend_address,
                msg.source,
            );
        }
    }

    fn start_render(&mut self, msg: &Message) {
        let view_id = msg.try_get_int(Attr::ViewId, 0) as ViewId;

        let outcome: Result<()> = (|| {
            if !(self.validate_frontend_address)(msg.source) {
                return Err(RenderError::Authorisation);
            }
            let view = self
                .views
                .get(&view_id)
                .ok_or(RenderError::InvalidIdentifier)?;
            if view.is_rendering() {
                return Err(RenderError::NotNow);
            }
            view.start_render(msg)
        })();

        if let Err(e) = outcome {
            egress::send_view_failed_result(
                &*self.bus,
                view_id,
                &e.failure(),
                self.backend_address,
                msg.source,
            );
        }
    }

    fn scene_request(&mut self, msg: &Message, f: impl FnOnce(&Scene) -> Result<()>) {
        if !self.validate(msg) {
            return;
        }
        let scene_id = msg.try_get_int(Attr::SceneId, 0) as SceneId;
        let Some(scene) = self.scenes.get(&scene_id) else {
            self.reply_failed(msg, &Failure::from_code(codes::INVALID_IDENTIFIER));
            return;
        };
        match f(scene) {
            Ok(()) => self.reply_done(msg, |_| {}),
            Err(e) => self.reply_failed(msg, &e.failure()),
        }
    }

    fn view_request(&mut self, msg: &Message, f: impl FnOnce(&View) -> Result<()>) {
        if !self.validate(msg) {
            return;
        }
        let view_id = msg.try_get_int(Attr::ViewId, 0) as ViewId;
        let Some(view) = self.views.get(&view_id) else {
            self.reply_failed(msg, &Failure::from_code(codes::INVALID_IDENTIFIER));
            return;
        };
        match f(view) {
            Ok(()) => self.reply_done(msg, |_| {}),
            Err(e) => self.reply_failed(msg, &e.failure()),
        }
    }
}
