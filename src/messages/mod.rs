//! Control Protocol Messages
//!
//! All communication between the front-end and the backend is typed
//! messages. Each message has a class, an identifier, a source address, a
//! destination address, and an attribute dictionary.
//!
//! Ingress classes carry control requests (`BackendControl`,
//! `SceneControl`, `ViewControl`); egress classes carry results, progress
//! and pixels (`SceneOutput`, `ViewOutput`, `ViewImage`); `FileAccess` is a
//! bidirectional RPC channel for file resolution.

pub mod bus;
pub mod factory;

use rustc_hash::FxHashMap;

use crate::errors::Failure;

/// A transport endpoint identifier. Zero is never a valid address.
pub type Address = u64;

pub const INVALID_ADDRESS: Address = 0;

/// Message classes used by the backend core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageClass {
    BackendControl,
    SceneControl,
    ViewControl,
    SceneOutput,
    ViewOutput,
    ViewImage,
    FileAccess,
}

/// Message identifiers (per class; the pairing is conventional).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageIdent {
    CreateScene,
    CloseScene,
    CreateView,
    CloseView,
    StartParser,
    StopParser,
    PauseParser,
    ResumeParser,
    StartRender,
    StopRender,
    PauseRender,
    ResumeRender,
    Done,
    Failed,
    Error,
    FatalError,
    Warning,
    Progress,
    ParserStatistics,
    RenderStatistics,
    PixelBlockSet,
    PixelSet,
    ReadFile,
    FindFile,
    CreatedFile,
}

/// Attribute keys for the message dictionaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attr {
    SceneId,
    ViewId,
    Width,
    Height,
    ErrorNumber,
    EnglishText,
    Warning,
    Error,
    FileName,
    Line,
    Column,
    FilePosition,
    // Pixel payloads
    PixelBlock,
    PixelPositions,
    PixelColors,
    PixelFinal,
    PixelId,
    PixelSize,
    Left,
    Top,
    Right,
    Bottom,
    // Progress
    Pixels,
    PixelsPending,
    PixelsCompleted,
    CurrentPhotonCount,
    RealTime,
    CpuTime,
    TimeSamples,
    // Parser options
    Version,
    WarningLevel,
    InputFile,
    IncludeHeader,
    OutputFileType,
    ClocklessAnimation,
    SplitUnions,
    RemoveBounds,
    Bounding,
    BoundingMethod,
    BoundingThreshold,
    OutputAlpha,
    BspMaxDepth,
    BspIsectCost,
    BspBaseAccessCost,
    BspChildAccessCost,
    BspMissChance,
    RealTimeRaytracing,
    Declare,
    Identifier,
    Value,
    Clock,
    // Render options
    Quality,
    Antialias,
    SamplingMethod,
    AntialiasDepth,
    AntialiasThreshold,
    AntialiasConfidence,
    Jitter,
    JitterAmount,
    AntialiasGamma,
    PreviewStartSize,
    PreviewEndSize,
    HighReproducibility,
    StochasticSeed,
    RadiosityFromFile,
    RadiosityToFile,
    RadiosityFileName,
    RadiosityVainPretrace,
    RenderBlockSize,
    RenderPattern,
    RenderBlockStep,
    PixelSkipList,
    MaxRenderThreads,
    SceneCamera,
    CameraLocation,
    CameraDirection,
    CameraUp,
    CameraRight,
    CameraSky,
    CameraLookAt,
    // Statistics
    FiniteObjects,
    InfiniteObjects,
    LightSources,
    Cameras,
    ParseTime,
    BoundingTime,
    PhotonTime,
    RadiosityTime,
    TraceTime,
    PixelSamples,
    SupersampledPixels,
    Rays,
    PhotonsShot,
    PhotonsStored,
    MediaPhotonsStored,
    TraceLevel,
    MaxTraceLevel,
    WorkingGamma,
    LegacyGammaMode,
    // File access
    ReadFile,
    LocalFile,
    FileUrl,
    CreatedFile,
}

/// Attribute values.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f32>),
    Vec3([f64; 3]),
    Object(Attributes),
    List(Vec<Value>),
}

pub type Attributes = FxHashMap<Attr, Value>;

/// A typed protocol message.
#[derive(Clone, Debug)]
pub struct Message {
    pub class: MessageClass,
    pub ident: MessageIdent,
    pub source: Address,
    pub dest: Address,
    pub attrs: Attributes,
}

impl Message {
    #[must_use]
    pub fn new(class: MessageClass, ident: MessageIdent) -> Self {
        Self {
            class,
            ident,
            source: INVALID_ADDRESS,
            dest: INVALID_ADDRESS,
            attrs: Attributes::default(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_dest(mut self, dest: Address) -> Self {
        self.dest = dest;
        self
    }

    pub fn set(&mut self, key: Attr, value: Value) -> &mut Self {
        self.attrs.insert(key, value);
        self
    }

    pub fn set_bool(&mut self, key: Attr, v: bool) -> &mut Self {
        self.set(key, Value::Bool(v))
    }

    pub fn set_int(&mut self, key: Attr, v: i64) -> &mut Self {
        self.set(key, Value::Int(v))
    }

    pub fn set_float(&mut self, key: Attr, v: f64) -> &mut Self {
        self.set(key, Value::Float(v))
    }

    pub fn set_str(&mut self, key: Attr, v: impl Into<String>) -> &mut Self {
        self.set(key, Value::Str(v.into()))
    }

    /// Marks a void attribute (presence is the payload).
    pub fn set_void(&mut self, key: Attr) -> &mut Self {
        self.set(key, Value::Bool(true))
    }

    #[must_use]
    pub fn exists(&self, key: Attr) -> bool {
        self.attrs.contains_key(&key)
    }

    #[must_use]
    pub fn get(&self, key: Attr) -> Option<&Value> {
        self.attrs.get(&key)
    }

    /// Integer lookup with numeric coercion from floats.
    #[must_use]
    pub fn try_get_int(&self, key: Attr, default: i64) -> i64 {
        match self.attrs.get(&key) {
            Some(Value::Int(v)) => *v,
            Some(Value::Float(v)) => *v as i64,
            Some(Value::Bool(v)) => i64::from(*v),
            _ => default,
        }
    }

    /// Float lookup with numeric coercion from integers.
    #[must_use]
    pub fn try_get_float(&self, key: Attr, default: f64) -> f64 {
        match self.attrs.get(&key) {
            Some(Value::Float(v)) => *v,
            Some(Value::Int(v)) => *v as f64,
            _ => default,
        }
    }

    #[must_use]
    pub fn try_get_bool(&self, key: Attr, default: bool) -> bool {
        match self.attrs.get(&key) {
            Some(Value::Bool(v)) => *v,
            Some(Value::Int(v)) => *v != 0,
            _ => default,
        }
    }

    #[must_use]
    pub fn try_get_str(&self, key: Attr, default: &str) -> String {
        match self.attrs.get(&key) {
            Some(Value::Str(v)) => v.clone(),
            _ => default.to_owned(),
        }
    }

    #[must_use]
    pub fn get_int_list(&self, key: Attr) -> Vec<i64> {
        match self.attrs.get(&key) {
            Some(Value::IntList(v)) => v.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn get_vec3(&self, key: Attr) -> Option<[f64; 3]> {
        match self.attrs.get(&key) {
            Some(Value::Vec3(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_object(&self, key: Attr) -> Option<&Attributes> {
        match self.attrs.get(&key) {
            Some(Value::Object(o)) => Some(o),
            _ => None,
        }
    }

    /// Builds a `Done` reply to this message, preserving the class.
    #[must_use]
    pub fn done_reply(&self) -> Message {
        Message::new(self.class, MessageIdent::Done)
            .with_source(self.dest)
            .with_dest(self.source)
    }

    /// Builds a `Failed` reply to this message, preserving the class.
    #[must_use]
    pub fn failed_reply(&self, failure: &Failure) -> Message {
        let mut msg = Message::new(self.class, MessageIdent::Failed)
            .with_source(self.dest)
            .with_dest(self.source);
        msg.set_int(Attr::ErrorNumber, i64::from(failure.code));
        msg.set_str(Attr::EnglishText, failure.text.clone());
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_between_int_and_float() {
        let mut msg = Message::new(MessageClass::ViewControl, MessageIdent::StartRender);
        msg.set_float(Attr::Quality, 7.0);
        msg.set_int(Attr::Width, 320);
        assert_eq!(msg.try_get_int(Attr::Quality, 9), 7);
        assert!((msg.try_get_float(Attr::Width, 0.0) - 320.0).abs() < f64::EPSILON);
        assert_eq!(msg.try_get_int(Attr::Height, 120), 120);
    }

    #[test]
    fn failed_reply_swaps_addresses_and_carries_code() {
        let req = Message::new(MessageClass::BackendControl, MessageIdent::CreateScene)
            .with_source(7)
            .with_dest(1);
        let failure = Failure::from_code(crate::errors::codes::NOT_NOW);
        let reply = req.failed_reply(&failure);
        assert_eq!(reply.source, 1);
        assert_eq!(reply.dest, 7);
        assert_eq!(reply.ident, MessageIdent::Failed);
        assert_eq!(reply.try_get_int(Attr::ErrorNumber, 0), 2);
    }
}
