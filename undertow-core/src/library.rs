//! Media library and per-user preferences
//!
//! The streaming service only needs to look tracks up, read stored format
//! preferences and record plays. `InMemoryLibrary` backs all three with maps
//! loaded from a JSON catalog.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::media::{MediaResource, ResourceId, UserId};
use crate::negotiation::ClientPreferences;

/// Errors that can occur during library access
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Library backend error: {reason}")]
    Backend { reason: String },
}

/// Track lookup and playback bookkeeping.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Looks up a track by id.
    ///
    /// # Errors
    /// - `LibraryError::NotFound` - No track with this id
    async fn track(&self, id: ResourceId) -> Result<MediaResource, LibraryError>;

    /// Increments the play count and updates last-played on both the track
    /// and the user.
    ///
    /// # Errors
    /// - `LibraryError::NotFound` - No track with this id
    async fn record_play(
        &self,
        id: ResourceId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), LibraryError>;
}

/// Stored format preferences per user.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Preferences for `user`; a user without stored preferences gets the default.
    ///
    /// # Errors
    /// - `LibraryError::Backend` - Preferences could not be read
    async fn preferences_for(&self, user: &UserId) -> Result<ClientPreferences, LibraryError>;
}

/// Play statistics of a track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlayStats {
    pub play_count: u64,
    pub last_played: Option<DateTime<Utc>>,
}

/// Most recent play of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastPlay {
    pub track: ResourceId,
    pub at: DateTime<Utc>,
}

/// On-disk catalog format.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tracks: Vec<MediaResource>,
    #[serde(default)]
    pub preferences: HashMap<String, ClientPreferences>,
}

/// In-memory library and preference store.
#[derive(Debug, Default)]
pub struct InMemoryLibrary {
    tracks: RwLock<HashMap<ResourceId, MediaResource>>,
    preferences: RwLock<HashMap<UserId, ClientPreferences>>,
    plays: RwLock<HashMap<ResourceId, PlayStats>>,
    last_plays: RwLock<HashMap<UserId, LastPlay>>,
}

impl InMemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a library from a parsed catalog.
    pub fn from_catalog(catalog: Catalog) -> Self {
        let library = Self::new();
        for track in catalog.tracks {
            library.insert_track(track);
        }
        for (user, preferences) in catalog.preferences {
            library.set_preferences(UserId::new(user), preferences);
        }
        library
    }

    /// Loads a JSON catalog file.
    ///
    /// # Errors
    /// - `LibraryError::Backend` - File unreadable or not a valid catalog
    pub async fn load(path: &Path) -> Result<Self, LibraryError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| LibraryError::Backend {
                    reason: format!("reading catalog {}: {}", path.display(), e),
                })?;
        let catalog: Catalog =
            serde_json::from_str(&content).map_err(|e| LibraryError::Backend {
                reason: format!("parsing catalog {}: {}", path.display(), e),
            })?;

        let library = Self::from_catalog(catalog);
        tracing::info!(
            "Loaded {} tracks from catalog {}",
            library.track_count(),
            path.display()
        );
        Ok(library)
    }

    pub fn insert_track(&self, track: MediaResource) {
        self.tracks.write().insert(track.id, track);
    }

    pub fn set_preferences(&self, user: UserId, preferences: ClientPreferences) {
        self.preferences.write().insert(user, preferences);
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn all_tracks(&self) -> Vec<MediaResource> {
        self.tracks.read().values().cloned().collect()
    }

    pub fn play_stats(&self, id: ResourceId) -> PlayStats {
        self.plays.read().get(&id).cloned().unwrap_or_default()
    }

    pub fn last_play_of(&self, user: &UserId) -> Option<LastPlay> {
        self.last_plays.read().get(user).cloned()
    }
}

#[async_trait]
impl MediaLibrary for InMemoryLibrary {
    async fn track(&self, id: ResourceId) -> Result<MediaResource, LibraryError> {
        self.tracks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| LibraryError::NotFound {
                kind: "Track",
                id: id.to_string(),
            })
    }

    async fn record_play(
        &self,
        id: ResourceId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), LibraryError> {
        if !self.tracks.read().contains_key(&id) {
            return Err(LibraryError::NotFound {
                kind: "Track",
                id: id.to_string(),
            });
        }

        {
            let mut plays = self.plays.write();
            let stats = plays.entry(id).or_default();
            stats.play_count += 1;
            stats.last_played = Some(at);
        }
        self.last_plays
            .write()
            .insert(user.clone(), LastPlay { track: id, at });

        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for InMemoryLibrary {
    async fn preferences_for(&self, user: &UserId) -> Result<ClientPreferences, LibraryError> {
        Ok(self
            .preferences
            .read()
            .get(user)
            .cloned()
            .unwrap_or_default())
    }
}
