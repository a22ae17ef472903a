//! Classification of user-supplied channel and video references.
//!
//! Accepted inputs, checked in this order:
//!
//! | Input                                         | Result                  |
//! |-----------------------------------------------|-------------------------|
//! | `https://www.youtube.com/watch?v=ID&t=1`       | `Video("ID")`           |
//! | `https://youtu.be/ID`, `.../shorts/ID`         | `Video("ID")`           |
//! | `https://www.youtube.com/channel/UC.../videos` | `ChannelId("UC...")`    |
//! | `https://www.youtube.com/@name/videos`, `@name`| `Handle("name")`        |
//! | `https://www.youtube.com/c/name`, `/user/name` | `CustomPath("name")`    |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const WATCH_MARKER: &str = "watch?v=";
const SHORT_HOST_MARKER: &str = "youtu.be/";
const SHORTS_MARKER: &str = "/shorts/";
const CHANNEL_MARKER: &str = "channel/";
const LEGACY_MARKERS: [&str; 2] = ["/c/", "/user/"];

/// A parsed reference to a channel or a single video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelReference {
    /// A single video.
    Video(String),
    /// An explicit channel ID.
    ChannelId(String),
    /// An `@handle`.
    Handle(String),
    /// A legacy `/c/` or `/user/` path.
    CustomPath(String),
}

impl ChannelReference {
    /// Classify `input`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReference`] when the input matches none of the
    /// supported forms or the identifier part is empty.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidReference("reference is empty".to_string()));
        }

        let invalid = || Error::InvalidReference(input.to_string());

        if let Some(rest) = after(input, WATCH_MARKER) {
            return non_empty(until(rest, &['&', '#'])).map(Self::Video).ok_or_else(invalid);
        }

        for marker in [SHORT_HOST_MARKER, SHORTS_MARKER] {
            if let Some(rest) = after(input, marker) {
                return non_empty(until(rest, &['?', '&', '#', '/']))
                    .map(Self::Video)
                    .ok_or_else(invalid);
            }
        }

        if let Some(rest) = after(input, CHANNEL_MARKER) {
            return non_empty(until(rest, &['/', '?', '#']))
                .map(Self::ChannelId)
                .ok_or_else(invalid);
        }

        if let Some(at) = input.rfind('@') {
            let handle = input[at + 1..].trim_matches('/');
            return non_empty(until(handle, &['/', '?', '#']))
                .map(Self::Handle)
                .ok_or_else(invalid);
        }

        for marker in LEGACY_MARKERS {
            if let Some(rest) = after(input, marker) {
                return non_empty(until(rest, &['/', '?', '#']))
                    .map(Self::CustomPath)
                    .ok_or_else(invalid);
            }
        }

        Err(invalid())
    }

    /// Whether the reference resolves without a remote lookup.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Video(_) | Self::ChannelId(_))
    }
}

impl fmt::Display for ChannelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video(id) => write!(f, "video {id}"),
            Self::ChannelId(id) => write!(f, "channel {id}"),
            Self::Handle(name) => write!(f, "@{name}"),
            Self::CustomPath(name) => write!(f, "custom path {name}"),
        }
    }
}

/// Kind of entity a reference resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    /// A single video.
    Video,
    /// A channel.
    Channel,
}

/// A reference resolved to a concrete ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedReference {
    /// Video or channel ID.
    pub id: String,
    /// What the ID identifies.
    pub kind: ReferenceKind,
}

impl ResolvedReference {
    /// A resolved video.
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ReferenceKind::Video,
        }
    }

    /// A resolved channel.
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ReferenceKind::Channel,
        }
    }
}

fn after<'a>(input: &'a str, marker: &str) -> Option<&'a str> {
    input.find(marker).map(|pos| &input[pos + marker.len()..])
}

fn until<'a>(input: &'a str, stops: &[char]) -> &'a str {
    let end = input.find(stops).unwrap_or(input.len());
    input[..end].trim()
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
