//! Radiosity Sample Cache
//!
//! Append-only store of diffuse interreflection samples keyed by
//! position and recursion depth. Trace workers gather from it constantly
//! but append rarely, so writers queue their new samples thread-locally
//! and flush at tile boundaries; the cache itself only takes the write
//! lock on flush.
//!
//! Persistence supports the continue-trace feature: the cache can be
//! primed from a previous render's file and autosaves its growth so an
//! aborted render can resume without re-learning the scene's lighting.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::errors::{RenderError, Result};

/// One cached radiosity sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadiositySample {
    pub position: [f64; 3],
    pub depth: u8,
    pub colour: [f32; 3],
    pub radius: f64,
}

struct Autosave {
    path: PathBuf,
    /// Samples already on disk; flush appends everything beyond this.
    written: usize,
}

#[derive(Default)]
pub struct RadiosityCache {
    samples: RwLock<Vec<RadiositySample>>,
    autosave: Mutex<Option<Autosave>>,
}

impl RadiosityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// Appends a worker's queued samples; called at tile boundaries.
    pub fn add_samples(&self, samples: &[RadiositySample]) {
        if samples.is_empty() {
            return;
        }
        self.samples.write().extend_from_slice(samples);
    }

    /// Read access for gather implementations.
    pub fn with_samples<R>(&self, f: impl FnOnce(&[RadiositySample]) -> R) -> R {
        f(&self.samples.read())
    }

    /// Primes the cache from a file. Returns `false` (without touching
    /// the cache) when the file does not exist.
    pub fn load(&self, path: &Path) -> Result<bool> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(_) => return Err(RenderError::CannotOpenFile(path.display().to_string())),
        };
        let reader = BufReader::new(file);
        let mut loaded = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: RadiositySample = serde_json::from_str(&line)
                .map_err(|e| RenderError::Uncategorized(format!("bad radiosity cache: {e}")))?;
            loaded.push(sample);
        }
        let count = loaded.len();
        let mut samples = self.samples.write();
        samples.extend(loaded);
        log::debug!("radiosity cache primed with {count} samples");
        Ok(true)
    }

    /// Arms autosave to the given file. With `keep_existing` the file's
    /// current contents stay (the cache was just loaded from it);
    /// otherwise the next flush rewrites it.
    pub fn init_autosave(&self, path: PathBuf, keep_existing: bool) {
        let written = if keep_existing { self.len() } else { 0 };
        *self.autosave.lock() = Some(Autosave { path, written });
    }

    /// Appends all not-yet-written samples to the autosave file. A no-op
    /// when autosave is not armed.
    pub fn flush_autosave(&self) -> Result<()> {
        let mut autosave = self.autosave.lock();
        let Some(state) = autosave.as_mut() else {
            return Ok(());
        };
        let samples = self.samples.read();
        if samples.len() <= state.written {
            return Ok(());
        }

        let file = if state.written == 0 {
            File::create(&state.path)
        } else {
            File::options().append(true).open(&state.path)
        }
        .map_err(|_| RenderError::CannotOpenFile(state.path.display().to_string()))?;

        let mut writer = BufWriter::new(file);
        for sample in &samples[state.written..] {
            let line = serde_json::to_string(sample)
                .map_err(|e| RenderError::Uncategorized(format!("cache encode: {e}")))?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        state.written = samples.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(x: f64, depth: u8) -> RadiositySample {
        RadiositySample {
            position: [x, 0.0, 0.0],
            depth,
            colour: [0.5, 0.5, 0.5],
            radius: 1.0,
        }
    }

    #[test]
    fn flush_appends_only_new_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.rca");

        let cache = RadiosityCache::new();
        cache.init_autosave(path.clone(), false);
        cache.add_samples(&[sample(1.0, 0), sample(2.0, 1)]);
        cache.flush_autosave().unwrap();
        cache.add_samples(&[sample(3.0, 0)]);
        cache.flush_autosave().unwrap();

        let reloaded = RadiosityCache::new();
        assert!(reloaded.load(&path).unwrap());
        assert_eq!(reloaded.len(), 3);
        reloaded.with_samples(|s| {
            assert_eq!(s[2].position[0], 3.0);
        });
    }

    #[test]
    fn load_missing_file_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RadiosityCache::new();
        assert!(!cache.load(&dir.path().join("absent.rca")).unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn autosave_after_load_keeps_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.rca");

        let first = RadiosityCache::new();
        first.init_autosave(path.clone(), false);
        first.add_samples(&[sample(1.0, 0)]);
        first.flush_autosave().unwrap();

        let second = RadiosityCache::new();
        assert!(second.load(&path).unwrap());
        second.init_autosave(path.clone(), true);
        second.add_samples(&[sample(2.0, 0)]);
        second.flush_autosave().unwrap();

        let third = RadiosityCache::new();
        assert!(third.load(&path).unwrap());
        assert_eq!(third.len(), 2);
    }
}
