#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]

pub mod backend;
pub mod color;
pub mod errors;
pub mod lighting;
pub mod math;
pub mod messages;
pub mod render;
pub mod scene;
pub mod support;
pub mod view;

pub use backend::RenderBackend;
pub use color::{GammaCurve, RgbColour, RgbtColour};
pub use errors::{RenderError, Result};
pub use math::RectInt;
pub use messages::bus::{ChannelBus, MessageSink};
pub use messages::{Address, Attr, Message, MessageClass, MessageIdent, Value};
pub use render::{CallbackTracerFactory, PixelTracer, TracerFactory};
pub use scene::parser::{FixedSceneParser, ParsedScene, SceneParser};
pub use scene::scene::Scene;
pub use scene::{BackendServices, QualityFlags, SceneData, SceneId, ViewId};
pub use support::queue::TaskQueue;
pub use support::task::{Task, TaskContext, TaskPayload};
pub use view::dispatch::{TileDispatcher, TileGeometry};
pub use view::{View, ViewData};
