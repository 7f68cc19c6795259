//! Photon Sort/Merge Stage
//!
//! The last photon stage runs alone after the shooters' barrier: it
//! merges every worker's private maps into the scene's global surface
//! and media maps, balances each into a kd-tree, derives the gather
//! options, and handles disk persistence. When the settings ask to load
//! a photon file instead, this task is the only photon stage scheduled:
//! it reads the maps back and rebuilds the trees directly.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::{RenderError, Result};
use crate::messages::factory::{MessageFactory, SourcePosition, WarningLevel};
use crate::render::record_task_times;
use crate::support::task::{TaskContext, TaskPayload};
use crate::support::thread_data::{SharedThreadData, TimeKind};
use crate::view::ViewData;
use super::photon_map::{PhotonMap, load_maps, save_maps};

pub struct PhotonSortingTask {
    view: Arc<ViewData>,
    surface_maps: Vec<Arc<Mutex<PhotonMap>>>,
    media_maps: Vec<Arc<Mutex<PhotonMap>>>,
    messages: Arc<MessageFactory>,
    thread_data: SharedThreadData,
    /// True when the task reads the maps from disk instead of merging
    /// worker output.
    load_mode: bool,
    #[allow(dead_code)]
    seed: u64,
}

impl PhotonSortingTask {
    #[must_use]
    pub fn new(
        view: Arc<ViewData>,
        surface_maps: Vec<Arc<Mutex<PhotonMap>>>,
        media_maps: Vec<Arc<Mutex<PhotonMap>>>,
        messages: Arc<MessageFactory>,
        thread_data: SharedThreadData,
        seed: u64,
    ) -> Self {
        Self {
            view,
            surface_maps,
            media_maps,
            messages,
            thread_data,
            load_mode: false,
            seed,
        }
    }

    /// Variant used when the photon settings request loading from disk:
    /// no worker maps exist, the file is the only input.
    #[must_use]
    pub fn load_from_file(
        view: Arc<ViewData>,
        messages: Arc<MessageFactory>,
        thread_data: SharedThreadData,
        seed: u64,
    ) -> Self {
        Self {
            view,
            surface_maps: Vec::new(),
            media_maps: Vec::new(),
            messages,
            thread_data,
            load_mode: true,
            seed,
        }
    }

    fn sort_photon_maps(&mut self, ctx: &TaskContext) -> Result<()> {
        let scene = &self.view.scene_data;
        let settings = scene.photon_settings.read().clone();

        {
            let mut surface = scene.surface_photon_map.lock();
            for map in &self.surface_maps {
                surface.merge(&map.lock());
            }
        }
        {
            let mut media = scene.media_photon_map.lock();
            for map in &self.media_maps {
                media.merge(&map.lock());
            }
        }
        ctx.cooperate()?;

        let mut surface = scene.surface_photon_map.lock();
        if !surface.is_empty() {
            surface.build_tree();
            surface.set_gather_options(&settings, false);
        }
        let mut media = scene.media_photon_map.lock();
        if !media.is_empty() {
            media.build_tree();
            media.set_gather_options(&settings, true);
        }

        let total = surface.len() + media.len();
        log::debug!("photon maps sorted: {} surface, {} media", surface.len(), media.len());

        if let Some(path) = settings.file_name.as_ref().filter(|_| !settings.load_file) {
            if total > 0 {
                if surface.is_empty() {
                    self.messages
                        .possible_error("Photon map for surface is empty.");
                }
                if media.is_empty() {
                    self.messages.possible_error("Photon map for media is empty.");
                }
                if save_maps(path, &surface, &media).is_err() {
                    self.messages
                        .warning(WarningLevel::General, "Could not save photon map.");
                }
            } else {
                self.messages.warning(
                    WarningLevel::General,
                    "Could not save photon map - no photons!",
                );
            }
        }
        Ok(())
    }

    fn load_photon_maps(&mut self, ctx: &TaskContext) -> Result<()> {
        let scene = &self.view.scene_data;
        let settings = scene.photon_settings.read().clone();
        let Some(path) = settings.file_name.as_ref() else {
            return Err(RenderError::Param("photon load without a file name".into()));
        };

        self.messages.warning(
            WarningLevel::General,
            &format!("Starting the load of photon file {}", path.display()),
        );

        match load_maps(path) {
            Ok((surface, media)) => {
                ctx.cooperate()?;
                {
                    let mut map = scene.surface_photon_map.lock();
                    *map = surface;
                    if !map.is_empty() {
                        map.build_tree();
                        map.set_gather_options(&settings, false);
                    }
                }
                {
                    let mut map = scene.media_photon_map.lock();
                    *map = media;
                    if !map.is_empty() {
                        map.build_tree();
                        map.set_gather_options(&settings, true);
                    }
                }
                Ok(())
            }
            Err(_) => Err(self.messages.error(
                RenderError::CannotOpenFile(format!(
                    "Could not load photon map ({})",
                    path.display()
                )),
                &SourcePosition::default(),
            )),
        }
    }
}

impl TaskPayload for PhotonSortingTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        if !self.view.scene_data.photon_settings.read().enabled {
            return Ok(());
        }
        ctx.cooperate()?;

        if self.load_mode {
            self.load_photon_maps(ctx)?;
        } else {
            self.sort_photon_maps(ctx)?;
        }

        ctx.cooperate()
    }

    fn finish(&mut self, ctx: &TaskContext) -> Result<()> {
        record_task_times(ctx, &self.thread_data, TimeKind::Photon);
        Ok(())
    }
}
