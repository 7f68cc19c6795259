//! Photon Pipeline Tests
//!
//! Tests for:
//! - The full estimate → strategise → shoot → sort pipeline
//! - Per-worker map merging into the scene maps
//! - Photon file persistence and the load-from-file shortcut
//! - The estimation stage's surface-separation adjustment

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{counting_tracer, harness, services};
use glam::DVec3;
use prism::lighting::CallbackPhotonKernelFactory;
use prism::lighting::photon_map::Photon;
use prism::scene::parser::ParsedScene;
use prism::scene::{LightSource, ObjectFlags, SceneObject};
use prism::{Attr, MessageIdent, RgbtColour};

/// A scene with one point light and one photon target.
fn photon_scene() -> ParsedScene {
    let mut scene = ParsedScene::default();

    let mut target = SceneObject::named("caustic-glass");
    target.flags = ObjectFlags::PHOTON_TARGET | ObjectFlags::PHOTON_REFLECTION_ON;
    target.centre = DVec3::new(0.0, 0.0, 10.0);
    target.radius = 1.0;
    scene.objects.push(target);

    scene.lights.push(LightSource::point_at(DVec3::ZERO));

    scene.photon_settings.enabled = true;
    scene.photon_settings.surface_count = 100;
    scene.photon_settings.surface_separation = 0.05;
    scene
}

/// A kernel that stores one surface photon per ray and always reports a
/// target hit.
fn depositing_kernel(deposits: Arc<AtomicU64>) -> CallbackPhotonKernelFactory {
    CallbackPhotonKernelFactory::new(Arc::new(move |ray, colour, _target, surface, _media| {
        let mut map = surface.lock();
        map.push(Photon {
            position: [
                ray.origin.x as f32,
                ray.origin.y as f32,
                (ray.origin.z + ray.direction.z) as f32,
            ],
            power: [colour.red, colour.green, colour.blue],
            ..Photon::default()
        });
        deposits.fetch_add(1, Ordering::SeqCst);
        true
    }))
}

#[test]
fn full_pipeline_shoots_and_sorts_photons() {
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::default());
    let deposits = Arc::new(AtomicU64::new(0));
    let mut services = services(photon_scene(), tracer);
    services.photons = Arc::new(depositing_kernel(Arc::clone(&deposits)));
    let mut frontend = harness(services);

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 8, 8);

    let messages = frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::MaxRenderThreads, 2);
    });

    assert!(deposits.load(Ordering::SeqCst) > 0, "photons were deposited");

    // Worker maps were merged into the scene's global surface map.
    let scene = frontend.backend.scene(scene_id).expect("live scene");
    let surface = scene.scene_data().surface_photon_map.lock();
    assert_eq!(surface.len() as u64, deposits.load(Ordering::SeqCst));
    assert!(surface.gather_options().min_gather_rad > 0.0);

    let stats = messages
        .iter()
        .find(|m| m.ident == MessageIdent::RenderStatistics)
        .expect("render statistics");
    assert!(stats.try_get_int(Attr::PhotonsShot, 0) > 0);
    assert!(stats.try_get_int(Attr::PhotonsStored, 0) > 0);
}

#[test]
fn estimation_widens_the_surface_separation() {
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::default());
    let deposits = Arc::new(AtomicU64::new(0));
    let mut services = services(photon_scene(), tracer);
    services.photons = Arc::new(depositing_kernel(deposits));
    let mut frontend = harness(services);

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 8, 8);
    frontend.render_to_done(view_id, |_msg| {});

    // Requested count is far below what the initial separation would
    // produce, so the estimate pushes the separation up.
    let scene = frontend.backend.scene(scene_id).expect("live scene");
    let separation = scene.scene_data().photon_settings.read().surface_separation;
    assert!(separation > 0.05);
}

#[test]
fn photon_load_skips_shooting_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let photon_file = dir.path().join("caustics.ph");

    // First render: shoot and save.
    {
        let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::default());
        let deposits = Arc::new(AtomicU64::new(0));
        let mut scene = photon_scene();
        scene.photon_settings.file_name = Some(photon_file.clone());
        let mut services = services(scene, tracer);
        services.photons = Arc::new(depositing_kernel(deposits));
        let mut frontend = harness(services);

        let scene_id = frontend.create_scene();
        frontend.parse_scene(scene_id);
        let view_id = frontend.create_view(scene_id, 8, 8);
        frontend.render_to_done(view_id, |_msg| {});
        assert!(photon_file.exists(), "photon map saved to disk");
    }

    // Second render: load the file; the kernel must never run.
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::default());
    let deposits = Arc::new(AtomicU64::new(0));
    let mut scene = photon_scene();
    scene.photon_settings.file_name = Some(photon_file.clone());
    scene.photon_settings.load_file = true;
    let mut services = services(scene, tracer);
    services.photons = Arc::new(depositing_kernel(Arc::clone(&deposits)));
    let mut frontend = harness(services);

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 8, 8);
    let messages = frontend.render_to_done(view_id, |_msg| {});

    assert_eq!(
        deposits.load(Ordering::SeqCst),
        0,
        "no shooting when loading from file"
    );
    let stats = messages
        .iter()
        .find(|m| m.ident == MessageIdent::RenderStatistics)
        .expect("render statistics");
    assert_eq!(stats.try_get_int(Attr::PhotonsShot, 0), 0);

    let scene = frontend.backend.scene(scene_id).expect("live scene");
    let surface = scene.scene_data().surface_photon_map.lock();
    assert!(!surface.is_empty(), "maps rebuilt from the file");
    assert!(surface.gather_options().min_gather_rad > 0.0);
}

#[test]
fn quality_below_nine_disables_photons() {
    let (tracer, _rays) = counting_tracer(|_, _| RgbtColour::default());
    let deposits = Arc::new(AtomicU64::new(0));
    let mut services = services(photon_scene(), tracer);
    services.photons = Arc::new(depositing_kernel(Arc::clone(&deposits)));
    let mut frontend = harness(services);

    let scene_id = frontend.create_scene();
    frontend.parse_scene(scene_id);
    let view_id = frontend.create_view(scene_id, 8, 8);
    frontend.render_to_done(view_id, |msg| {
        msg.set_int(Attr::Quality, 8);
    });

    assert_eq!(deposits.load(Ordering::SeqCst), 0);
}
