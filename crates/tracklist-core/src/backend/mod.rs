//! The primitive surface of the session-oriented playlist service.
//!
//! The service never answers a call with the final state. Loads and mutations
//! are acknowledged immediately and completed later, announced through events
//! that surface only when the owner of the loop calls [`Backend::process_events`].
//! The service's own worker threads never touch loop state; they raise a
//! [`WakeSignal`] and wait to be pumped.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

use crate::link::{EntityRef, Item};

/// Identifies one opened view of a playlist. Every open yields a fresh handle,
/// even when the playlist behind it is already loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Errors reported by the backend. Messages are surfaced verbatim to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Invalid indices")]
    InvalidIndices,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Resource not loaded yet")]
    NotLoaded,
    #[error("Invalid playlist handle")]
    UnknownHandle,
    #[error("Playlist not found")]
    NotFound,
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Bad username and/or password")]
    BadCredentials,
    #[error("Disconnected from service")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    Loaded,
    MutationSettled,
    /// The backend gave up on the entity; nothing further will arrive for it.
    Failed(BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub handle: HandleId,
    pub event: EntityEvent,
}

impl Notification {
    pub fn new(handle: HandleId, event: EntityEvent) -> Self {
        Self { handle, event }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(Result<(), BackendError>),
    /// Unrecoverable; the loop must log out and exit with a failure status.
    TerminalError(BackendError),
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Entity(Notification),
    Session(SessionEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistMeta {
    pub uri: EntityRef,
    pub title: String,
    pub creator: String,
    pub collaborative: bool,
}

pub trait Backend {
    /// Starts session establishment; completion arrives as [`SessionEvent::LoggedIn`].
    fn login(&mut self);

    /// Starts session teardown; completion arrives as [`SessionEvent::LoggedOut`].
    fn logout(&mut self);

    /// Opens a fresh handle for `entity`, kicking off a load if needed.
    fn open(&mut self, entity: &EntityRef) -> Result<HandleId, BackendError>;

    fn release(&mut self, handle: HandleId);

    fn is_loaded(&self, handle: HandleId) -> bool;

    /// The error a finished load ended with. No further event arrives for
    /// such a playlist.
    fn load_error(&self, handle: HandleId) -> Option<BackendError>;

    fn metadata(&self, handle: HandleId) -> Result<PlaylistMeta, BackendError>;

    fn current_items(&self, handle: HandleId) -> Result<Vec<Item>, BackendError>;

    fn insert_items(
        &mut self,
        handle: HandleId,
        index: usize,
        items: &[Item],
    ) -> Result<(), BackendError>;

    fn remove_items(&mut self, handle: HandleId, indices: &[usize]) -> Result<(), BackendError>;

    /// True while a submitted mutation has not yet been confirmed.
    fn has_pending_changes(&self, handle: HandleId) -> bool;

    /// Runs one round of internal work, appending whatever became observable
    /// to `events`. Returns how long the caller may wait before pumping again;
    /// `Duration::ZERO` means more work is ready right now.
    fn process_events(&mut self, events: &mut Vec<BackendEvent>) -> Duration;
}

/// Edge-triggered wake-up raised from backend threads.
///
/// Raising only stores a permit; repeated raises before the loop notices
/// collapse into a single wake-up.
#[derive(Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.notify.notify_one();
    }

    pub async fn raised(&self) {
        self.notify.notified().await;
    }
}

impl fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeSignal").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(5)]
    async fn wake_signal_crosses_threads_and_coalesces() {
        let wake = WakeSignal::new();
        let remote = wake.clone();
        std::thread::spawn(move || {
            remote.raise();
            remote.raise();
        })
        .join()
        .expect("raiser thread");

        wake.raised().await;
        let second = tokio::time::timeout(Duration::from_millis(20), wake.raised()).await;
        assert!(second.is_err(), "two raises should collapse into one wake-up");
    }
}
