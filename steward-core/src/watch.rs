//! Types for the watch protocol
//!
//! A watch is resumable from a resource version; if that version is no longer retained
//! by the store an [`WatchEvent::Error`] with code 410 is sent and the client must relist.
use crate::{error::ErrorResponse, object::DynamicObject};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A raw event returned from a watch query
#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K = DynamicObject> {
    /// Object was added
    Added(K),
    /// Object was modified
    Modified(K),
    /// Object was deleted
    Deleted(K),
    /// Progress marker carrying only a resource version
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

impl<K> Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(_) => write!(f, "Bookmark event"),
            WatchEvent::Error(e) => write!(f, "Error event: {e:?}"),
        }
    }
}

/// Progress marker for [`WatchEvent::Bookmark`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// The version the watch has progressed to
    pub resource_version: String,
}
