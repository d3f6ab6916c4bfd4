//! Consumer progress tracking: a persisted `name -> sequence` mapping.

use async_trait::async_trait;

use crate::error::StoreError;

/// The last global sequence a named consumer has fully processed.
///
/// Bookmarks advance only after an event has been processed, which is
/// what gives downstream delivery its at-least-once guarantee: a crash
/// between processing and saving re-delivers that event on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bookmark {
    /// Last processed global sequence; zero for a consumer that has not
    /// processed anything yet.
    pub sequence: i64,
}

impl Bookmark {
    /// A bookmark at the given sequence.
    pub fn at(sequence: i64) -> Self {
        Self { sequence }
    }
}

/// Persisted mapping from consumer name to bookmark.
///
/// Reads and writes are independently transactional; there is no
/// cross-consumer ordering, and racing writers on one name resolve as
/// last-writer-wins.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// The bookmark for `name`. Unknown names read as sequence zero.
    async fn bookmark_for(&self, name: &str) -> Result<Bookmark, StoreError>;

    /// Insert or update the bookmark for `name`.
    async fn save(&self, name: &str, bookmark: Bookmark) -> Result<(), StoreError>;
}
