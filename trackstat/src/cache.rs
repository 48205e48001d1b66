//! Explicit, caller-owned cache of derived tracks.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::locator::{ActivityLocator, LoadedTrack};
use crate::{PipelineParams, Result, TrackError};

/// Identity of a track source. File keys change whenever the file is
/// rewritten; content keys whenever the bytes change.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceKey {
    File {
        path: PathBuf,
        size: u64,
        modified: (u64, u32),
    },
    Content(String),
}

impl SourceKey {
    pub fn for_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|source| TrackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let dur = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Ok(SourceKey::File {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: (dur.as_secs(), dur.subsec_nanos()),
        })
    }

    pub fn for_bytes(bytes: &[u8]) -> Self {
        SourceKey::Content(sha256_hex(bytes))
    }
}

/// Cache identity: the source plus a digest of the parameters the track was
/// derived with. The same file under different params is a different entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: SourceKey,
    params: String,
}

impl CacheKey {
    pub fn new(source: SourceKey, params: &PipelineParams) -> Result<Self> {
        Ok(Self {
            source,
            params: params_hash(params)?,
        })
    }
}

fn params_hash(params: &PipelineParams) -> Result<String> {
    let json = serde_json::to_vec(params)
        .map_err(|err| TrackError::InvalidParameter(format!("unserializable params: {err}")))?;
    Ok(sha256_hex(&json))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// In-memory store of derived tracks for embedding callers that serve the
/// same activities repeatedly, such as a dashboard backend. Nothing in the
/// library caches implicitly; the owner decides what to keep and when to
/// [`invalidate`](TrackCache::invalidate).
#[derive(Debug, Default)]
pub struct TrackCache {
    entries: HashMap<CacheKey, Arc<LoadedTrack>>,
}

impl TrackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<LoadedTrack>> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: CacheKey, track: LoadedTrack) -> Arc<LoadedTrack> {
        let track = Arc::new(track);
        self.entries.insert(key, Arc::clone(&track));
        track
    }

    /// Return the cached track or run `load` and remember its result.
    /// Errors are not cached.
    pub fn get_or_load<F>(&mut self, key: CacheKey, load: F) -> Result<Arc<LoadedTrack>>
    where
        F: FnOnce() -> Result<LoadedTrack>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let track = load()?;
        Ok(self.insert(key, track))
    }

    /// Load an activity through `locator`, keyed on its file metadata and
    /// `params`.
    /// A missing file is `Ok(None)` and leaves the cache untouched.
    pub fn load_activity(
        &mut self,
        locator: &ActivityLocator,
        filename: &str,
        params: &PipelineParams,
    ) -> Result<Option<Arc<LoadedTrack>>> {
        let source = match SourceKey::for_path(locator.resolve(filename)) {
            Ok(source) => source,
            Err(TrackError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };
        let key = CacheKey::new(source, params)?;
        if let Some(hit) = self.get(&key) {
            return Ok(Some(hit));
        }
        match locator.load(filename, params)? {
            Some(track) => Ok(Some(self.insert(key, track))),
            None => Ok(None),
        }
    }

    /// Drop every entry derived from `source`, whatever its params.
    /// Returns the number of entries removed.
    pub fn invalidate(&mut self, source: &SourceKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.source != source);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
