//! Egress Message Builders
//!
//! Result, progress and output messages sent from the backend toward the
//! front-end. Scenes, views and tasks all funnel their outbound traffic
//! through these helpers so identifiers and addressing stay consistent.

use crate::errors::Failure;
use crate::messages::bus::MessageSink;
use crate::messages::{Address, Attr, Message, MessageClass, MessageIdent};
use crate::scene::{SceneId, ViewId};

fn send(bus: &dyn MessageSink, msg: Message) {
    if bus.send(msg).is_err() {
        log::debug!("egress message dropped: transport closed");
    }
}

/// Wraps an attribute payload as scene output with the given identifier.
pub fn send_scene_output(
    bus: &dyn MessageSink,
    scene_id: SceneId,
    source: Address,
    dest: Address,
    ident: MessageIdent,
    mut msg: Message,
) {
    msg.class = MessageClass::SceneOutput;
    msg.ident = ident;
    msg.source = source;
    msg.dest = dest;
    msg.set_int(Attr::SceneId, i64::from(scene_id));
    send(bus, msg);
}

/// Wraps an attribute payload as view output with the given identifier.
pub fn send_view_output(
    bus: &dyn MessageSink,
    view_id: ViewId,
    source: Address,
    dest: Address,
    ident: MessageIdent,
    mut msg: Message,
) {
    msg.class = MessageClass::ViewOutput;
    msg.ident = ident;
    msg.source = source;
    msg.dest = dest;
    msg.set_int(Attr::ViewId, i64::from(view_id));
    send(bus, msg);
}

pub fn send_scene_success_result(
    bus: &dyn MessageSink,
    scene_id: SceneId,
    source: Address,
    dest: Address,
) {
    let mut msg = Message::new(MessageClass::SceneOutput, MessageIdent::Done)
        .with_source(source)
        .with_dest(dest);
    msg.set_int(Attr::SceneId, i64::from(scene_id));
    send(bus, msg);
}

pub fn send_scene_failed_result(
    bus: &dyn MessageSink,
    scene_id: SceneId,
    failure: &Failure,
    source: Address,
    dest: Address,
) {
    let mut msg = Message::new(MessageClass::SceneOutput, MessageIdent::Failed)
        .with_source(source)
        .with_dest(dest);
    msg.set_int(Attr::SceneId, i64::from(scene_id));
    msg.set_int(Attr::ErrorNumber, i64::from(failure.code));
    msg.set_str(Attr::EnglishText, failure.text.clone());
    send(bus, msg);
}

pub fn send_view_success_result(
    bus: &dyn MessageSink,
    view_id: ViewId,
    source: Address,
    dest: Address,
) {
    let mut msg = Message::new(MessageClass::ViewOutput, MessageIdent::Done)
        .with_source(source)
        .with_dest(dest);
    msg.set_int(Attr::ViewId, i64::from(view_id));
    send(bus, msg);
}

pub fn send_view_failed_result(
    bus: &dyn MessageSink,
    view_id: ViewId,
    failure: &Failure,
    source: Address,
    dest: Address,
) {
    let mut msg = Message::new(MessageClass::ViewOutput, MessageIdent::Failed)
        .with_source(source)
        .with_dest(dest);
    msg.set_int(Attr::ViewId, i64::from(view_id));
    msg.set_int(Attr::ErrorNumber, i64::from(failure.code));
    msg.set_str(Attr::EnglishText, failure.text.clone());
    send(bus, msg);
}
