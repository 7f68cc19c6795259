//! Stage Message Factory
//!
//! Warnings, possible errors and fatal errors are sent through a factory
//! bound to one scene or view. The factory filters warnings by the scene's
//! warning level, tags every message with the owning identifiers, and
//! guards fatal delivery so that a single failure observed by several
//! tasks produces exactly one `Error` message on the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::RenderError;
use crate::messages::bus::MessageSink;
use crate::messages::{Address, Attr, Message, MessageClass, MessageIdent};

/// Severity of a non-fatal diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarningLevel {
    /// Language-version or portability advice.
    Advice = 5,
    /// General warnings.
    General = 9,
}

/// Optional source-file position carried on parser diagnostics.
#[derive(Clone, Debug, Default)]
pub struct SourcePosition {
    pub file: Option<String>,
    pub line: Option<i64>,
    pub column: Option<i64>,
    pub offset: Option<i64>,
}

pub struct MessageFactory {
    warning_level: u32,
    stage: &'static str,
    source: Address,
    dest: Address,
    scene_id: u32,
    view_id: u32,
    bus: Arc<dyn MessageSink>,
    fatal_sent: AtomicBool,
}

impl MessageFactory {
    #[must_use]
    pub fn new(
        warning_level: u32,
        stage: &'static str,
        source: Address,
        dest: Address,
        scene_id: u32,
        view_id: u32,
        bus: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            warning_level,
            stage,
            source,
            dest,
            scene_id,
            view_id,
            bus,
            fatal_sent: AtomicBool::new(false),
        }
    }

    /// The stage name this factory reports for (e.g. "Parse", "Render").
    #[must_use]
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    fn base_message(&self, ident: MessageIdent) -> Message {
        let class = if self.view_id != 0 {
            MessageClass::ViewOutput
        } else {
            MessageClass::SceneOutput
        };
        let mut msg = Message::new(class, ident)
            .with_source(self.source)
            .with_dest(self.dest);
        if self.view_id != 0 {
            msg.set_int(Attr::ViewId, i64::from(self.view_id));
        } else {
            msg.set_int(Attr::SceneId, i64::from(self.scene_id));
        }
        msg
    }

    fn set_position(msg: &mut Message, pos: &SourcePosition) {
        if let Some(file) = &pos.file {
            msg.set_str(Attr::FileName, file.clone());
        }
        if let Some(line) = pos.line {
            msg.set_int(Attr::Line, line);
        }
        if let Some(column) = pos.column {
            msg.set_int(Attr::Column, column);
        }
        if let Some(offset) = pos.offset {
            msg.set_int(Attr::FilePosition, offset);
        }
    }

    /// Sends a warning unless suppressed by the warning level.
    pub fn warning(&self, level: WarningLevel, text: &str) {
        self.warning_at(level, text, &SourcePosition::default());
    }

    pub fn warning_at(&self, level: WarningLevel, text: &str, pos: &SourcePosition) {
        if (level as u32) > self.warning_level {
            return;
        }
        let mut msg = self.base_message(MessageIdent::Warning);
        msg.set_int(Attr::Warning, level as i64);
        msg.set_str(Attr::EnglishText, text);
        Self::set_position(&mut msg, pos);
        if self.bus.send(msg).is_err() {
            log::debug!("[{}] warning dropped: transport closed", self.stage);
        }
    }

    /// Sends an `Error` message without fatal semantics.
    pub fn possible_error(&self, text: &str) {
        let mut msg = self.base_message(MessageIdent::Error);
        msg.set_int(Attr::Error, 0);
        msg.set_str(Attr::EnglishText, text);
        let _ = self.bus.send(msg);
    }

    /// Sends a fatal `Error` message and returns the error for propagation.
    ///
    /// The returned error tears the task down through the normal failure
    /// path; the notified guard keeps the fatal sink from re-sending it.
    #[must_use]
    pub fn error(&self, err: RenderError, pos: &SourcePosition) -> RenderError {
        self.deliver_fatal(&err, pos);
        err
    }

    /// The fatal-error sink entry point: delivers the message unless this
    /// factory already notified the front-end.
    pub fn fatal(&self, err: &RenderError) {
        self.deliver_fatal(err, &SourcePosition::default());
    }

    fn deliver_fatal(&self, err: &RenderError, pos: &SourcePosition) {
        if err.is_stop() {
            return;
        }
        if self.fatal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut msg = self.base_message(MessageIdent::Error);
        msg.set_int(Attr::Error, i64::from(err.code()));
        msg.set_str(Attr::EnglishText, err.to_string());
        Self::set_position(&mut msg, pos);
        if self.bus.send(msg).is_err() {
            log::warn!("[{}] fatal error message dropped: transport closed", self.stage);
        }
    }

    /// Whether a fatal error was already delivered through this factory.
    #[must_use]
    pub fn fatal_already_sent(&self) -> bool {
        self.fatal_sent.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::bus::ChannelBus;

    fn factory_with_bus(level: u32) -> (MessageFactory, flume::Receiver<Message>) {
        let (bus, rx, _tx) = ChannelBus::endpoint();
        let factory = MessageFactory::new(level, "Test", 1, 2, 3, 0, Arc::new(bus));
        (factory, rx)
    }

    #[test]
    fn warnings_respect_the_warning_level() {
        let (factory, rx) = factory_with_bus(5);
        factory.warning(WarningLevel::General, "too chatty");
        factory.warning(WarningLevel::Advice, "kept");
        let only = rx.try_recv().unwrap();
        assert_eq!(only.try_get_str(Attr::EnglishText, ""), "kept");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fatal_errors_are_delivered_once() {
        let (factory, rx) = factory_with_bus(9);
        factory.fatal(&RenderError::OutOfMemory);
        factory.fatal(&RenderError::OutOfMemory);
        assert_eq!(rx.try_recv().unwrap().ident, MessageIdent::Error);
        assert!(rx.try_recv().is_err());
        assert!(factory.fatal_already_sent());
    }

    #[test]
    fn stop_markers_never_reach_the_front_end() {
        let (factory, rx) = factory_with_bus(9);
        factory.fatal(&RenderError::Stopped);
        assert!(rx.try_recv().is_err());
        assert!(!factory.fatal_already_sent());
    }
}
