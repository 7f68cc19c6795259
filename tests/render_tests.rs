//! End-To-End Render Tests
//!
//! Tests for:
//! - Minimal render: tile count, ray count, statistics, done message
//! - Continue trace: skip list honoured, half the rays
//! - Mosaic preview cascade
//! - The supersampling methods (non-adaptive, adaptive, stochastic)
//! - Progress accounting

mod common;

use common::{count_messages, counting_tracer, harness, services};
use prism::scene::parser::ParsedScene;
use prism::{Attr, MessageClass, MessageIdent, RgbtColour};

fn flat_grey() -> ParsedScene {
    ParsedScene::default()
}

/// A hard vertical edge to provoke the antialiasing methods.
fn edge_colour(x: f64, _y: f64) -> RgbtColour {
    if x < 8.0 {
        RgbtColour::rgb(1.0, 1.0, 1.0)
    } else {
        RgbtColour::rgb(0.0, 0.0, 0.0)
    }
}

#[test]
fn minimal_render_dispatches_four_tiles() {
    let (tracer, rays) = counting_tracer(|_, _| RgbtColour::rgb(0.5, 0.5, 0.5));
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 16, 16);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
        msg.set_int(Attr::MaxRenderThreads, 1);
    });

    // Four complete blocks, each with an id and marked final.
    let blocks: Vec<_> = messages
        .iter()
        .filter(|m| m.ident == MessageIdent::PixelBlockSet)
        .collect();
    assert_eq!(blocks.len(), 4);
    let mut ids: Vec<i64> = blocks
        .iter()
        .map(|m| m.try_get_int(Attr::PixelId, -1))
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3], "single-thread dispatch order");
    ids.sort_unstable();
    assert!(blocks.iter().all(|m| m.exists(Attr::PixelFinal)));

    assert_eq!(rays.count(), 256);

    let stats = messages
        .iter()
        .find(|m| m.ident == MessageIdent::RenderStatistics)
        .expect("render statistics");
    assert_eq!(stats.try_get_int(Attr::Pixels, 0), 256);
    assert_eq!(stats.try_get_int(Attr::Width, 0), 16);
}

#[test]
fn continue_trace_skips_finished_blocks() {
    let (tracer, rays) = counting_tracer(|_, _| RgbtColour::rgb(0.5, 0.5, 0.5));
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 16, 16);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
        msg.set_int(Attr::MaxRenderThreads, 1);
        msg.set_int(Attr::PixelId, 0);
        msg.set(
            Attr::PixelSkipList,
            prism::Value::IntList(vec![1, 3]),
        );
    });

    let ids: Vec<i64> = messages
        .iter()
        .filter(|m| m.ident == MessageIdent::PixelBlockSet)
        .map(|m| m.try_get_int(Attr::PixelId, -1))
        .collect();
    assert_eq!(ids, vec![0, 2]);
    assert_eq!(rays.count(), 128);

    let stats = messages
        .iter()
        .find(|m| m.ident == MessageIdent::RenderStatistics)
        .expect("render statistics");
    assert_eq!(stats.try_get_int(Attr::Pixels, 0), 128);
}

#[test]
fn continue_trace_renders_identical_pixels() {
    // The blocks rendered on resume must be bit-identical to a full
    // render's blocks.
    let run = |skip: Vec<i64>| {
        let (tracer, _rays) = counting_tracer(|x, y| {
            RgbtColour::rgb((x / 16.0) as f32, (y / 16.0) as f32, 0.25)
        });
        let mut frontend = harness(services(flat_grey(), tracer));
        let scene_id = frontend.create_scene();
        frontend.parse_scene(scene_id);
        let view_id = frontend.create_view(scene_id, 16, 16);
        let messages = frontend.render_to_done(view_id, |msg| {
            msg.set_int(Attr::RenderBlockSize, 8);
            if !skip.is_empty() {
                msg.set(Attr::PixelSkipList, prism::Value::IntList(skip));
            }
        });
        let mut blocks: Vec<(i64, Vec<f32>)> = messages
            .iter()
            .filter(|m| m.ident == MessageIdent::PixelBlockSet)
            .map(|m| {
                let id = m.try_get_int(Attr::PixelId, -1);
                let pixels = match m.get(Attr::PixelBlock) {
                    Some(prism::Value::FloatList(v)) => v.clone(),
                    _ => Vec::new(),
                };
                (id, pixels)
            })
            .collect();
        blocks.sort_by_key(|(id, _)| *id);
        blocks
    };

    let full = run(vec![]);
    let resumed = run(vec![0, 2]);
    assert_eq!(resumed.len(), 2);
    for (id, pixels) in &resumed {
        let (_, reference) = full.iter().find(|(fid, _)| fid == id).unwrap();
        assert_eq!(pixels, reference, "block {id} differs after resume");
    }
}

#[test]
fn mosaic_preview_cascade_emits_sparse_then_final_pixels() {
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::rgb(0.1, 0.2, 0.3));
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 16, 16);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
        msg.set_int(Attr::PreviewStartSize, 8);
        msg.set_int(Attr::PreviewEndSize, 2); // folded to 1 without AA
    });

    let sparse = count_messages(&messages, |m| m.ident == MessageIdent::PixelSet);
    assert!(sparse > 0, "mosaic passes produce sparse pixel sets");

    // With the cascade reaching single-pixel size and no antialiasing,
    // the mosaic stages are the image: their pixels are marked final,
    // and only the size-1 stage carries block ids.
    let finals = messages
        .iter()
        .filter(|m| m.ident == MessageIdent::PixelSet && m.exists(Attr::PixelFinal))
        .count();
    assert!(finals > 0);
    let with_ids = messages
        .iter()
        .filter(|m| m.ident == MessageIdent::PixelSet && m.exists(Attr::PixelId))
        .count();
    assert_eq!(with_ids, 4, "one complete block per tile at full resolution");

    // Corner skipping: total sampled positions equal one sample per
    // pixel across the cascade (sizes 8, 4, 2, 1 with skip-corner).
    let total_positions: usize = messages
        .iter()
        .filter(|m| m.ident == MessageIdent::PixelSet)
        .map(|m| match m.get(Attr::PixelPositions) {
            Some(prism::Value::IntList(v)) => v.len() / 2,
            _ => 0,
        })
        .sum();
    assert_eq!(total_positions, 256);
}

#[test]
fn non_adaptive_supersampling_refines_the_edge() {
    let (tracer, rays) = counting_tracer(edge_colour);
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 16, 16);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
        msg.set_bool(Attr::Antialias, true);
        msg.set_int(Attr::SamplingMethod, 1);
        msg.set_int(Attr::AntialiasDepth, 2);
        msg.set_float(Attr::AntialiasThreshold, 0.1);
    });

    // Halo rows plus per-pixel samples: strictly more rays than pixels.
    assert!(rays.count() > 256);

    let stats = messages
        .iter()
        .find(|m| m.ident == MessageIdent::RenderStatistics)
        .expect("render statistics");
    assert!(stats.try_get_int(Attr::SupersampledPixels, 0) > 0);
    assert!(stats.try_get_int(Attr::PixelSamples, 0) > 0);
}

fn run_adaptive(colour: impl Fn(f64, f64) -> RgbtColour + Send + Sync + 'static) -> u64 {
    let (tracer, rays) = counting_tracer(colour);
    let mut frontend = harness(services(flat_grey(), tracer));
    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 16, 16);
    frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
        msg.set_bool(Attr::Antialias, true);
        msg.set_int(Attr::SamplingMethod, 2);
        msg.set_int(Attr::AntialiasDepth, 2);
        msg.set_float(Attr::AntialiasThreshold, 0.2);
    });
    rays.count()
}

#[test]
fn adaptive_supersampling_subdivides_only_near_contrast() {
    let edge_rays = run_adaptive(edge_colour);
    let flat_rays = run_adaptive(|_, _| RgbtColour::rgb(0.5, 0.5, 0.5));

    // The contrasty image needs extra subdivision samples; the flat one
    // samples only the corner grid.
    assert!(edge_rays > flat_rays);
    // Flat image: (w+1)x(h+1) corners per 8x8 tile, four tiles.
    assert_eq!(flat_rays, 4 * 81);
}

#[test]
fn stochastic_supersampling_terminates_and_completes() {
    // A noisy image keeps the variance high; the sampler must still
    // stop at the per-pixel maximum.
    let (tracer, rays) = counting_tracer(|x, y| {
        let noise = ((x * 13.0 + y * 7.0).sin() * 0.5 + 0.5) as f32;
        RgbtColour::rgb(noise, 1.0 - noise, 0.5)
    });
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 8, 8);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
        msg.set_bool(Attr::Antialias, true);
        msg.set_int(Attr::SamplingMethod, 3);
        msg.set_int(Attr::AntialiasDepth, 2);
        msg.set_float(Attr::AntialiasThreshold, 0.05);
        msg.set_float(Attr::AntialiasConfidence, 0.9);
        msg.set_int(Attr::StochasticSeed, 42);
    });

    // At most maxSamples = 4^depth per pixel.
    assert!(rays.count() <= 64 * 16);
    assert!(rays.count() >= 64);
    assert_eq!(
        count_messages(&messages, |m| m.ident == MessageIdent::PixelBlockSet),
        1
    );
}

#[test]
fn progress_accounting_reaches_the_full_area() {
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::rgb(0.5, 0.5, 0.5));
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 20, 13);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::RenderBlockSize, 8);
    });

    let last_progress = messages
        .iter()
        .rev()
        .find(|m| m.ident == MessageIdent::Progress)
        .expect("progress messages");
    assert_eq!(last_progress.try_get_int(Attr::PixelsCompleted, 0), 20 * 13);
    assert_eq!(last_progress.try_get_int(Attr::Pixels, 0), 20 * 13);
}

#[test]
fn invalid_render_area_fails_the_view() {
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::default());
    let mut frontend = harness(services(flat_grey(), tracer));

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 16, 16);

    frontend.start_render(view_id, |msg| {
        msg.set_float(Attr::Left, 100.0);
        msg.set_float(Attr::Right, 200.0);
    });
    let failed = frontend.wait_for(MessageClass::ViewOutput, MessageIdent::Failed);
    assert_eq!(
        failed.try_get_int(Attr::ErrorNumber, 0),
        i64::from(prism::errors::codes::PARAM)
    );
}
