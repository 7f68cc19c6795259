//! Photon Map
//!
//! An append-only store of photon records, organised as a list of
//! exponentially growing blocks so workers can append without
//! reallocation spikes. After shooting, the merge stage folds all worker
//! maps into the scene's global maps, balances each into a left-complete
//! kd-tree by median split, and derives the gather options from the
//! populated map.
//!
//! The on-disk layout is a record count followed by the raw fixed-size
//! records, one map after another (surface, then media).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::errors::{RenderError, Result};
use crate::scene::PhotonSettings;

/// One stored photon: position, packed power, the kd-tree split axis and
/// the packed incidence direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Photon {
    pub position: [f32; 3],
    pub power: [f32; 3],
    /// kd-tree split axis (0/1/2) once the tree is built.
    pub info: u8,
    /// Packed spherical incidence direction.
    pub theta: u8,
    pub phi: u8,
    pub pad: u8,
}

const FIRST_BLOCK_SIZE: usize = 256;

/// Gather parameters derived from the populated map.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GatherOptions {
    pub min_gather_rad: f64,
    pub min_gather_rad_mult: f64,
    pub gather_rad_step: f64,
    pub gather_num_steps: u32,
}

#[derive(Default)]
pub struct PhotonMap {
    blocks: Vec<Vec<Photon>>,
    num_photons: usize,
    gather: GatherOptions,
}

impl PhotonMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num_photons
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_photons == 0
    }

    #[must_use]
    pub fn gather_options(&self) -> GatherOptions {
        self.gather
    }

    /// Appends a photon; amortised allocation-free thanks to doubling
    /// block sizes.
    pub fn push(&mut self, photon: Photon) {
        let needs_block = match self.blocks.last() {
            None => true,
            Some(block) => block.len() == block.capacity(),
        };
        if needs_block {
            let capacity = self
                .blocks
                .last()
                .map_or(FIRST_BLOCK_SIZE, |b| b.capacity() * 2);
            self.blocks.push(Vec::with_capacity(capacity));
        }
        self.blocks
            .last_mut()
            .expect("block allocated above")
            .push(photon);
        self.num_photons += 1;
    }

    /// Allocates a default photon and returns it for in-place fill.
    pub fn allocate(&mut self) -> &mut Photon {
        self.push(Photon::default());
        self.blocks
            .last_mut()
            .and_then(|b| b.last_mut())
            .expect("just pushed")
    }

    #[must_use]
    pub fn get(&self, mut index: usize) -> Option<&Photon> {
        for block in &self.blocks {
            if index < block.len() {
                return Some(&block[index]);
            }
            index -= block.len();
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &Photon> {
        self.blocks.iter().flatten()
    }

    /// Folds another map's photons into this one.
    pub fn merge(&mut self, other: &PhotonMap) {
        for photon in other.iter() {
            self.push(*photon);
        }
    }

    /// Balances the map into a left-complete kd-tree by median split,
    /// recording the split axis on each median record. The build is
    /// out-of-place: block storage is flattened into a single array.
    pub fn build_tree(&mut self) {
        let mut photons: Vec<Photon> = self.iter().copied().collect();
        if !photons.is_empty() {
            build_range(&mut photons);
        }
        self.blocks = vec![photons];
    }

    /// Derives the gather options from the populated map: the initial
    /// gather radius scales with the mean photon spacing implied by the
    /// map density, and the step schedule expands toward the configured
    /// maximum gather count.
    pub fn set_gather_options(&mut self, settings: &PhotonSettings, media: bool) {
        if self.num_photons == 0 {
            self.gather = GatherOptions::default();
            return;
        }
        let separation = settings.surface_separation.max(1e-6);
        let density_radius = separation * (f64::from(settings.gather_min.max(1))).sqrt();
        let mult = if media { 2.0 } else { 1.0 };
        let num_steps = 2 + (f64::from(settings.gather_max.max(1)) / f64::from(settings.gather_min.max(1)))
            .log2()
            .ceil()
            .max(0.0) as u32;
        self.gather = GatherOptions {
            min_gather_rad: density_radius * mult,
            min_gather_rad_mult: mult,
            gather_rad_step: 1.5,
            gather_num_steps: num_steps,
        };
    }

    /// Writes the map as a count prefix followed by raw records.
    pub fn save_into(&self, file: &mut File) -> Result<()> {
        let count = self.num_photons as u32;
        file.write_all(&count.to_le_bytes())?;
        for block in &self.blocks {
            file.write_all(bytemuck::cast_slice(block))?;
        }
        Ok(())
    }

    /// Reads a count-prefixed map section.
    pub fn load_from(file: &mut File) -> Result<Self> {
        let mut count_bytes = [0u8; 4];
        file.read_exact(&mut count_bytes)?;
        let count = u32::from_le_bytes(count_bytes) as usize;

        let mut map = Self::new();
        let mut record = [0u8; std::mem::size_of::<Photon>()];
        for _ in 0..count {
            file.read_exact(&mut record)?;
            map.push(*bytemuck::from_bytes(&record));
        }
        Ok(map)
    }
}

/// Saves the surface and media maps to one file.
pub fn save_maps(path: &Path, surface: &PhotonMap, media: &PhotonMap) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|_| RenderError::CannotOpenFile(path.display().to_string()))?;
    surface.save_into(&mut file)?;
    media.save_into(&mut file)?;
    Ok(())
}

/// Loads the surface and media maps from one file. A file with only a
/// surface section yields an empty media map.
pub fn load_maps(path: &Path) -> Result<(PhotonMap, PhotonMap)> {
    let mut file = File::open(path)
        .map_err(|_| RenderError::CannotOpenFile(path.display().to_string()))?;
    let surface = PhotonMap::load_from(&mut file)?;
    let media = match PhotonMap::load_from(&mut file) {
        Ok(map) => map,
        Err(RenderError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            PhotonMap::new()
        }
        Err(e) => return Err(e),
    };
    Ok((surface, media))
}

fn largest_extent_axis(photons: &[Photon]) -> usize {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for p in photons {
        for axis in 0..3 {
            min[axis] = min[axis].min(p.position[axis]);
            max[axis] = max[axis].max(p.position[axis]);
        }
    }
    let extent = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
    if extent[0] >= extent[1] && extent[0] >= extent[2] {
        0
    } else if extent[1] >= extent[2] {
        1
    } else {
        2
    }
}

fn build_range(photons: &mut [Photon]) {
    if photons.len() <= 1 {
        return;
    }
    let axis = largest_extent_axis(photons);
    let mid = photons.len() / 2;
    photons.select_nth_unstable_by(mid, |a, b| {
        a.position[axis]
            .partial_cmp(&b.position[axis])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    photons[mid].info = axis as u8;
    let (lo, hi) = photons.split_at_mut(mid);
    build_range(lo);
    build_range(&mut hi[1..]);
}
