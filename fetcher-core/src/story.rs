use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which fetcher invocation mode a story should use on its next attempt.
///
/// `Force` may be set manually (never happens in this system) or
/// auto-promoted by a worker when the fetcher reports a
/// [`crate::outcome::FetcherOutcome::ForceIndicated`] result (spec §4.4,
/// §4.8). Promotion never resets `attempts` (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    Update,
    Force,
}

/// Last known outcome for a story, surfaced in health/notification text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastStatus {
    Success,
    Transient(String),
    FinalPending,
    GivenUp,
}

/// The atomic unit of work carried through every channel (spec §3).
///
/// Identity for deduplication/hashing is `(url, site, library_id)` — *not*
/// `attempts`, `behavior`, `last_status`, or `next_attempt_at`, which all
/// mutate as the story moves through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub url: String,
    pub site: String,
    pub library_id: Option<String>,
    pub behavior: Behavior,
    pub attempts: u32,
    pub last_status: Option<LastStatus>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Story {
    /// A freshly ingested story: zero attempts, `update` behavior.
    pub fn new(url: String, site: String) -> Self {
        Self {
            url,
            site,
            library_id: None,
            behavior: Behavior::Update,
            attempts: 0,
            last_status: None,
            next_attempt_at: None,
        }
    }

    pub fn identity(&self) -> StoryIdentity<'_> {
        StoryIdentity {
            url: &self.url,
            site: &self.site,
            library_id: self.library_id.as_deref(),
        }
    }

    /// Promote to `force` without touching `attempts` (spec §9).
    pub fn promote_to_force(&mut self) {
        self.behavior = Behavior::Force;
    }
}

/// Borrowed identity view used as the [`crate::active_set::ActiveSet`] and
/// coordinator-backlog dedup key (spec §3: "Equality and hashing:
/// `(url, site, library_id)`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoryIdentity<'a> {
    pub url: &'a str,
    pub site: &'a str,
    pub library_id: Option<&'a str>,
}

impl StoryIdentity<'_> {
    pub fn to_owned_key(self) -> StoryKey {
        StoryKey {
            url: self.url.to_string(),
            site: self.site.to_string(),
            library_id: self.library_id.map(str::to_string),
        }
    }
}

/// Owned form of [`StoryIdentity`], suitable as a map/set key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoryKey {
    pub url: String,
    pub site: String,
    pub library_id: Option<String>,
}

impl From<&Story> for StoryKey {
    fn from(s: &Story) -> Self {
        s.identity().to_owned_key()
    }
}

impl PartialEq for Story {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for Story {}

impl Hash for Story {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}
