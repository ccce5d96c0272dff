//! Playlists the simulated service starts with.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracklist_core::link::LinkError;
use tracklist_core::{EntityRef, Item, PlaylistSeed};

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to read fixture {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid fixture {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("fixture lists {0} more than once")]
    Duplicate(EntityRef),
}

pub fn load(path: &Path) -> Result<Vec<PlaylistSeed>, FixtureError> {
    let raw = std::fs::read_to_string(path).map_err(|source| FixtureError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let seeds: Vec<PlaylistSeed> =
        serde_json::from_str(&raw).map_err(|source| FixtureError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    check_unique(&seeds)?;
    Ok(seeds)
}

fn check_unique(seeds: &[PlaylistSeed]) -> Result<(), FixtureError> {
    let mut seen = HashSet::new();
    for seed in seeds {
        if !seen.insert(&seed.uri) {
            return Err(FixtureError::Duplicate(seed.uri.clone()));
        }
    }
    Ok(())
}

/// Used when no fixture is given.
pub fn demo() -> Result<Vec<PlaylistSeed>, LinkError> {
    let track = |id: &str| Item::parse(&format!("spotify:track:{id}"));
    Ok(vec![
        PlaylistSeed::new(
            EntityRef::parse("spotify:user:demo:playlist:4hOKQuZbraPDIfaGbM3lKI")?,
            "Demo mix",
        )
        .with_creator("demo")
        .with_tracks(vec![
            track("6JEK0CvvjDjjMUBFoXShNZ")?,
            track("4uLU6hMCjMI75M1A2tKUQC")?,
            track("1301WleyT98MSxVHPZCA6M")?,
        ]),
        PlaylistSeed::new(
            EntityRef::parse("spotify:user:demo:playlist:1cLsQKYdeQ2Bp0i3Ikvyfb")?,
            "Shared scratchpad",
        )
        .with_creator("demo")
        .collaborative(true),
    ])
}
