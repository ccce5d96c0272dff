//! Playlist and track references.
//!
//! The backend addresses everything through `spotify:` URIs. Playlists are the
//! entities this crate reads and mutates; tracks (and local-file tracks) are the
//! items stored inside them. Anything else is recognised only so the caller can
//! be told it pointed at the wrong kind of thing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SCHEME: &str = "spotify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Playlist,
    Track,
    LocalTrack,
    Album,
    Artist,
    User,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkKind::Playlist => "playlist",
            LinkKind::Track => "track",
            LinkKind::LocalTrack => "local track",
            LinkKind::Album => "album",
            LinkKind::Artist => "artist",
            LinkKind::User => "user",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Link not found")]
    Unrecognised(String),
    #[error("expected a {expected} link, found a {found} link")]
    WrongKind { expected: LinkKind, found: LinkKind },
}

/// Classifies a URI, returning `None` when it is not a link at all.
pub fn classify(uri: &str) -> Option<LinkKind> {
    let parts: Vec<&str> = uri.split(':').collect();
    if parts.first() != Some(&SCHEME) {
        return None;
    }

    match parts.as_slice() {
        [_, "track", id] if is_id(id) => Some(LinkKind::Track),
        [_, "album", id] if is_id(id) => Some(LinkKind::Album),
        [_, "artist", id] if is_id(id) => Some(LinkKind::Artist),
        [_, "playlist", id] if is_id(id) => Some(LinkKind::Playlist),
        [_, "user", user, "playlist", id] if !user.is_empty() && is_id(id) => {
            Some(LinkKind::Playlist)
        }
        [_, "user", user, "starred"] if !user.is_empty() => Some(LinkKind::Playlist),
        [_, "user", user] if !user.is_empty() => Some(LinkKind::User),
        // spotify:local:<artist>:<album>:<title>:<seconds>
        [_, "local", _, _, title, seconds]
            if !title.is_empty() && seconds.parse::<u32>().is_ok() =>
        {
            Some(LinkKind::LocalTrack)
        }
        _ => None,
    }
}

fn is_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn expect_kind(uri: &str, accept: &[LinkKind], expected: LinkKind) -> Result<(), LinkError> {
    match classify(uri) {
        None => Err(LinkError::Unrecognised(uri.to_string())),
        Some(kind) if accept.contains(&kind) => Ok(()),
        Some(found) => Err(LinkError::WrongKind { expected, found }),
    }
}

/// Reference to a playlist held by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityRef(String);

impl EntityRef {
    pub fn parse(uri: &str) -> Result<Self, LinkError> {
        expect_kind(uri, &[LinkKind::Playlist], LinkKind::Playlist)?;
        Ok(Self(uri.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One element of a playlist. Compared by URI only; duplicates are meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Item(String);

impl Item {
    pub fn parse(uri: &str) -> Result<Self, LinkError> {
        expect_kind(uri, &[LinkKind::Track, LinkKind::LocalTrack], LinkKind::Track)?;
        Ok(Self(uri.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_link {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = LinkError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = LinkError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }
    };
}

string_link!(EntityRef);
string_link!(Item);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_link_shapes() {
        assert_eq!(
            classify("spotify:user:alice:playlist:3Lk8sTq0"),
            Some(LinkKind::Playlist)
        );
        assert_eq!(classify("spotify:playlist:37i9dQZF1DX"), Some(LinkKind::Playlist));
        assert_eq!(classify("spotify:user:alice:starred"), Some(LinkKind::Playlist));
        assert_eq!(classify("spotify:track:6rqhFgbbKwnb9M"), Some(LinkKind::Track));
        assert_eq!(
            classify("spotify:local:Artist:Album:Title:215"),
            Some(LinkKind::LocalTrack)
        );
        assert_eq!(classify("spotify:album:2noRn2Aes5aoNV"), Some(LinkKind::Album));
        assert_eq!(classify("spotify:user:alice"), Some(LinkKind::User));
    }

    #[test]
    fn rejects_malformed_links() {
        assert_eq!(classify(""), None);
        assert_eq!(classify("http://open.spotify.com/track/abc"), None);
        assert_eq!(classify("spotify:track:"), None);
        assert_eq!(classify("spotify:track:has space"), None);
        assert_eq!(classify("spotify:user::playlist:abc"), None);
        assert_eq!(classify("spotify:local:a:b:c:notanumber"), None);
    }

    #[test]
    fn entity_ref_requires_a_playlist() {
        assert!(EntityRef::parse("spotify:user:alice:playlist:abc").is_ok());
        let err = EntityRef::parse("spotify:track:abc").unwrap_err();
        assert_eq!(
            err,
            LinkError::WrongKind {
                expected: LinkKind::Playlist,
                found: LinkKind::Track
            }
        );
        assert!(matches!(
            EntityRef::parse("garbage"),
            Err(LinkError::Unrecognised(_))
        ));
    }

    #[test]
    fn items_accept_tracks_and_local_tracks() {
        assert!(Item::parse("spotify:track:abc").is_ok());
        assert!(Item::parse("spotify:local:a:b:c:10").is_ok());
        assert!(Item::parse("spotify:playlist:abc").is_err());
    }

    #[test]
    fn serde_validates_on_the_way_in() {
        let item: Item = serde_json::from_str("\"spotify:track:abc\"").unwrap();
        assert_eq!(item.as_str(), "spotify:track:abc");
        assert!(serde_json::from_str::<Item>("\"spotify:album:abc\"").is_err());
        assert_eq!(serde_json::to_string(&item).unwrap(), "\"spotify:track:abc\"");
    }
}
