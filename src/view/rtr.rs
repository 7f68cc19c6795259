//! Real-Time Raytracing Frame Barrier
//!
//! In real-time mode every trace worker renders tiles into a shared
//! full-frame buffer instead of emitting per-tile messages. At frame end
//! the workers synchronise on a condition variable: the last arriver
//! resets the dispatcher, publishes the frame as a single pixel-block
//! message, and releases the rest. The wait is bounded at three seconds
//! so a cancelled render cannot strand a worker on the barrier.
//!
//! Under clockless animation the released workers pick the next camera
//! from the scene's camera list, cycling per frame.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use crate::math::RectInt;
use crate::backend::egress;
use crate::color::RgbtColour;
use crate::messages::{Attr, Message, MessageClass, MessageIdent, Value};
use crate::scene::camera::Camera;
use crate::view::ViewData;

const FRAME_WAIT: Duration = Duration::from_secs(3);

/// Floats per pixel in the frame buffer (R, G, B, reserved, T).
const PIXEL_STRIDE: usize = 5;

struct Counters {
    threads_completed: u32,
    frames: u64,
    pixels_completed: u64,
}

pub struct RtrData {
    width: u32,
    height: u32,
    num_threads: u32,
    pixels: Mutex<Vec<f32>>,
    counters: Mutex<Counters>,
    event: Condvar,
}

impl RtrData {
    #[must_use]
    pub fn new(width: u32, height: u32, num_threads: u32) -> Self {
        Self {
            width,
            height,
            num_threads,
            pixels: Mutex::new(vec![0.0; width as usize * height as usize * PIXEL_STRIDE]),
            counters: Mutex::new(Counters {
                threads_completed: 0,
                frames: 0,
                pixels_completed: 0,
            }),
            event: Condvar::new(),
        }
    }

    /// Copies a completed tile into the frame buffer.
    pub fn store_rectangle(&self, rect: RectInt, pixels: &[RgbtColour]) {
        debug_assert_eq!(pixels.len() as u64, rect.area());
        let mut buffer = self.pixels.lock();
        let width = self.width as usize;
        let mut i = 0;
        for y in rect.top..=rect.bottom {
            for x in rect.left..=rect.right {
                let offset = (y as usize * width + x as usize) * PIXEL_STRIDE;
                let c = pixels[i];
                buffer[offset] = c.red;
                buffer[offset + 1] = c.green;
                buffer[offset + 2] = c.blue;
                buffer[offset + 3] = 0.0;
                buffer[offset + 4] = c.transm;
                i += 1;
            }
        }
    }

    /// Frame barrier: blocks until every worker arrives. The last arriver
    /// resets the dispatcher, emits the full frame plus a progress
    /// update, and releases the others.
    ///
    /// Returns the camera for the next frame under clockless animation.
    pub fn completed_frame(&self, view: &ViewData) -> Option<Camera> {
        let mut counters = self.counters.lock();

        let cameras = view.scene_data.contents.read().cameras.clone();
        let clockless = view.scene_data.options.read().clockless_animation;

        counters.threads_completed += 1;
        if counters.threads_completed >= self.num_threads {
            view.dispatcher.set_next_rectangle(FxHashSet::default(), 0);

            counters.threads_completed = 0;
            counters.frames += 1;
            counters.pixels_completed += u64::from(self.width) * u64::from(self.height);
            let frames = counters.frames;
            let pixels_completed = counters.pixels_completed;
            self.event.notify_all();

            let mut msg = Message::new(MessageClass::ViewImage, MessageIdent::PixelBlockSet)
                .with_source(view.scene_data.backend_address)
                .with_dest(view.scene_data.frontend_address);
            msg.set(
                Attr::PixelBlock,
                Value::FloatList(self.pixels.lock().clone()),
            );
            msg.set_int(Attr::PixelSize, 1);
            msg.set_int(Attr::Left, 0);
            msg.set_int(Attr::Top, 0);
            msg.set_int(Attr::Right, i64::from(self.width) - 1);
            msg.set_int(Attr::Bottom, i64::from(self.height) - 1);
            msg.set_int(Attr::ViewId, i64::from(view.view_id));
            if view.scene_data.bus.send(msg).is_err() {
                log::debug!("real-time frame dropped: transport closed");
            }

            let mut progress = Message::new(MessageClass::ViewOutput, MessageIdent::Progress);
            progress.set_int(
                Attr::Pixels,
                i64::from(self.width) * i64::from(self.height),
            );
            progress.set_int(Attr::PixelsPending, 0);
            progress.set_int(Attr::PixelsCompleted, pixels_completed as i64);
            egress::send_view_output(
                &*view.scene_data.bus,
                view.view_id,
                view.scene_data.backend_address,
                view.scene_data.frontend_address,
                MessageIdent::Progress,
                progress,
            );

            return next_camera(clockless, &cameras, frames);
        }

        // Timed wait so a cancelled render does not strand us here; on a
        // timeout, withdraw this arrival and let the caller's cooperate
        // point observe the stop.
        let frames_before = counters.frames;
        if self
            .event
            .wait_for(&mut counters, FRAME_WAIT)
            .timed_out()
            && counters.frames == frames_before
        {
            counters.threads_completed = counters.threads_completed.saturating_sub(1);
        }

        let frames = counters.frames;
        next_camera(clockless, &cameras, frames)
    }
}

fn next_camera(clockless: bool, cameras: &[Camera], frame: u64) -> Option<Camera> {
    if clockless && !cameras.is_empty() {
        Some(cameras[(frame % cameras.len() as u64) as usize])
    } else {
        None
    }
}
