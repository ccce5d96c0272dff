//! In-process stand-in for the playlist service.
//!
//! Reproduces the timing contract the rest of the crate has to cope with:
//! logins, loads and mutations are accepted immediately and complete a
//! configurable number of pumps later, other clients can edit a playlist at any
//! point, and the session can die underneath everything.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use super::{
    Backend, BackendError, BackendEvent, EntityEvent, HandleId, Notification, PlaylistMeta,
    SessionEvent, WakeSignal,
};
use crate::link::{EntityRef, Item};

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub login_delay_ticks: u32,
    pub load_delay_ticks: u32,
    pub settle_delay_ticks: u32,
    /// Pump cadence requested while scheduled work is outstanding.
    pub tick: Duration,
    /// Pump cadence requested when nothing is scheduled.
    pub idle: Duration,
    pub max_events_per_pump: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            login_delay_ticks: 1,
            load_delay_ticks: 2,
            settle_delay_ticks: 1,
            tick: Duration::from_millis(10),
            idle: Duration::from_secs(1),
            max_events_per_pump: 16,
        }
    }
}

/// Initial contents of one playlist; also the shape of fixture files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlaylistSeed {
    pub uri: EntityRef,
    pub title: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub collaborative: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub tracks: Vec<Item>,
}

impl PlaylistSeed {
    pub fn new(uri: EntityRef, title: impl Into<String>) -> Self {
        Self {
            uri,
            title: title.into(),
            creator: String::new(),
            collaborative: false,
            read_only: false,
            tracks: Vec::new(),
        }
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn with_tracks(mut self, tracks: Vec<Item>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn collaborative(mut self, collaborative: bool) -> Self {
        self.collaborative = collaborative;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed(BackendError),
}

#[derive(Debug)]
struct PlaylistRecord {
    meta: PlaylistMeta,
    items: Vec<Item>,
    load: LoadState,
    pending_updates: u32,
    read_only: bool,
}

#[derive(Debug)]
enum Action {
    CompleteLogin,
    CompleteLogout,
    CompleteLoad(EntityRef),
    Settle(EntityRef),
    FailEntity(EntityRef, BackendError),
    FailSession(BackendError),
}

#[derive(Debug)]
struct Scheduled {
    due: u64,
    action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    LoggedOut,
    LoggingIn,
    LoggedIn,
    LoggingOut,
}

#[derive(Debug)]
pub struct MemoryBackend {
    config: MemoryConfig,
    wake: WakeSignal,
    phase: SessionPhase,
    login_error: Option<BackendError>,
    playlists: HashMap<EntityRef, PlaylistRecord>,
    handles: HashMap<HandleId, EntityRef>,
    next_handle: u64,
    tick: u64,
    scheduled: Vec<Scheduled>,
    outbox: VecDeque<BackendEvent>,
    rejections: VecDeque<BackendError>,
}

impl MemoryBackend {
    pub fn new(wake: WakeSignal, config: MemoryConfig) -> Self {
        Self {
            config,
            wake,
            phase: SessionPhase::LoggedOut,
            login_error: None,
            playlists: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            tick: 0,
            scheduled: Vec::new(),
            outbox: VecDeque::new(),
            rejections: VecDeque::new(),
        }
    }

    pub fn with_playlist(mut self, seed: PlaylistSeed) -> Self {
        self.insert_playlist(seed);
        self
    }

    pub fn with_playlists(mut self, seeds: impl IntoIterator<Item = PlaylistSeed>) -> Self {
        for seed in seeds {
            self.insert_playlist(seed);
        }
        self
    }

    /// Makes the next login attempt fail with `error`.
    pub fn with_login_error(mut self, error: BackendError) -> Self {
        self.login_error = Some(error);
        self
    }

    pub fn insert_playlist(&mut self, seed: PlaylistSeed) {
        let record = PlaylistRecord {
            meta: PlaylistMeta {
                uri: seed.uri.clone(),
                title: seed.title,
                creator: seed.creator,
                collaborative: seed.collaborative,
            },
            items: seed.tracks,
            load: LoadState::Unloaded,
            pending_updates: 0,
            read_only: seed.read_only,
        };
        self.playlists.insert(seed.uri, record);
    }

    /// Applies an edit made by some other client of the service.
    pub fn external_insert(
        &mut self,
        entity: &EntityRef,
        index: usize,
        items: &[Item],
    ) -> Result<(), BackendError> {
        let record = self.playlists.get_mut(entity).ok_or(BackendError::NotFound)?;
        if index > record.items.len() {
            return Err(BackendError::InvalidIndices);
        }
        record.items.splice(index..index, items.iter().cloned());
        record.pending_updates += 1;
        debug!(entity = %entity, index, count = items.len(), "external insert");
        self.schedule(self.config.settle_delay_ticks, Action::Settle(entity.clone()));
        Ok(())
    }

    pub fn external_remove(
        &mut self,
        entity: &EntityRef,
        indices: &[usize],
    ) -> Result<(), BackendError> {
        let record = self.playlists.get_mut(entity).ok_or(BackendError::NotFound)?;
        remove_indices(&mut record.items, indices)?;
        record.pending_updates += 1;
        debug!(entity = %entity, count = indices.len(), "external remove");
        self.schedule(self.config.settle_delay_ticks, Action::Settle(entity.clone()));
        Ok(())
    }

    /// The next mutation submitted through a handle fails with `error`.
    pub fn reject_next_mutation(&mut self, error: BackendError) {
        self.rejections.push_back(error);
    }

    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) {
        if let Some(record) = self.playlists.get_mut(entity) {
            record.read_only = read_only;
        }
    }

    /// Makes a pending or future load of `entity` fail on the next pump.
    pub fn fail_load(&mut self, entity: &EntityRef, error: BackendError) {
        self.schedule(0, Action::FailEntity(entity.clone(), error));
    }

    /// Kills the session on the next pump.
    pub fn fail_session(&mut self, error: BackendError) {
        self.schedule(0, Action::FailSession(error));
    }

    pub fn items(&self, entity: &EntityRef) -> Option<&[Item]> {
        self.playlists.get(entity).map(|r| r.items.as_slice())
    }

    pub fn pending_updates(&self, entity: &EntityRef) -> u32 {
        self.playlists
            .get(entity)
            .map(|r| r.pending_updates)
            .unwrap_or(0)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn is_logged_in(&self) -> bool {
        self.phase == SessionPhase::LoggedIn
    }

    fn schedule(&mut self, delay_ticks: u32, action: Action) {
        let due = self.tick + u64::from(delay_ticks.max(1));
        trace!(due, ?action, "scheduled backend work");
        self.scheduled.push(Scheduled { due, action });
        self.wake.raise();
    }

    fn record(&self, handle: HandleId) -> Result<&PlaylistRecord, BackendError> {
        let entity = self.handles.get(&handle).ok_or(BackendError::UnknownHandle)?;
        self.playlists.get(entity).ok_or(BackendError::UnknownHandle)
    }

    fn loaded_record(&self, handle: HandleId) -> Result<&PlaylistRecord, BackendError> {
        let record = self.record(handle)?;
        match &record.load {
            LoadState::Loaded => Ok(record),
            LoadState::Failed(err) => Err(err.clone()),
            LoadState::Unloaded | LoadState::Loading => Err(BackendError::NotLoaded),
        }
    }

    fn mutable_record(
        &mut self,
        handle: HandleId,
    ) -> Result<(EntityRef, &mut PlaylistRecord), BackendError> {
        let entity = self
            .handles
            .get(&handle)
            .cloned()
            .ok_or(BackendError::UnknownHandle)?;
        let record = self
            .playlists
            .get_mut(&entity)
            .ok_or(BackendError::UnknownHandle)?;
        match &record.load {
            LoadState::Loaded => {}
            LoadState::Failed(err) => return Err(err.clone()),
            LoadState::Unloaded | LoadState::Loading => return Err(BackendError::NotLoaded),
        }
        if let Some(err) = self.rejections.pop_front() {
            return Err(err);
        }
        if record.read_only {
            return Err(BackendError::PermissionDenied);
        }
        Ok((entity, record))
    }

    fn broadcast(&mut self, entity: &EntityRef, event: EntityEvent) {
        let mut targets: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, e)| *e == entity)
            .map(|(h, _)| *h)
            .collect();
        targets.sort();
        for handle in targets {
            self.outbox
                .push_back(BackendEvent::Entity(Notification::new(handle, event.clone())));
        }
    }

    fn fire(&mut self, action: Action) {
        match action {
            Action::CompleteLogin => {
                let result = match self.login_error.take() {
                    Some(err) => {
                        self.phase = SessionPhase::LoggedOut;
                        Err(err)
                    }
                    None => {
                        self.phase = SessionPhase::LoggedIn;
                        Ok(())
                    }
                };
                self.outbox
                    .push_back(BackendEvent::Session(SessionEvent::LoggedIn(result)));
            }
            Action::CompleteLogout => {
                self.phase = SessionPhase::LoggedOut;
                self.outbox
                    .push_back(BackendEvent::Session(SessionEvent::LoggedOut));
            }
            Action::CompleteLoad(entity) => {
                let Some(record) = self.playlists.get_mut(&entity) else {
                    return;
                };
                if record.load != LoadState::Loading {
                    return;
                }
                record.load = LoadState::Loaded;
                debug!(entity = %entity, tracks = record.items.len(), "playlist loaded");
                self.broadcast(&entity, EntityEvent::Loaded);
            }
            Action::Settle(entity) => {
                let Some(record) = self.playlists.get_mut(&entity) else {
                    return;
                };
                record.pending_updates = record.pending_updates.saturating_sub(1);
                self.broadcast(&entity, EntityEvent::MutationSettled);
            }
            Action::FailEntity(entity, err) => {
                let Some(record) = self.playlists.get_mut(&entity) else {
                    return;
                };
                record.load = LoadState::Failed(err.clone());
                self.broadcast(&entity, EntityEvent::Failed(err));
            }
            Action::FailSession(err) => {
                self.outbox
                    .push_back(BackendEvent::Session(SessionEvent::TerminalError(err)));
            }
        }
    }
}

fn remove_indices(items: &mut Vec<Item>, indices: &[usize]) -> Result<(), BackendError> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.is_empty()
        || sorted.len() != indices.len()
        || sorted.last().is_some_and(|&last| last >= items.len())
    {
        return Err(BackendError::InvalidIndices);
    }
    for index in sorted.into_iter().rev() {
        items.remove(index);
    }
    Ok(())
}

impl Backend for MemoryBackend {
    fn login(&mut self) {
        if self.phase != SessionPhase::LoggedOut {
            return;
        }
        self.phase = SessionPhase::LoggingIn;
        self.schedule(self.config.login_delay_ticks, Action::CompleteLogin);
    }

    fn logout(&mut self) {
        if self.phase == SessionPhase::LoggingOut {
            return;
        }
        self.phase = SessionPhase::LoggingOut;
        self.schedule(1, Action::CompleteLogout);
    }

    fn open(&mut self, entity: &EntityRef) -> Result<HandleId, BackendError> {
        if self.phase != SessionPhase::LoggedIn {
            return Err(BackendError::NotLoggedIn);
        }
        let record = self
            .playlists
            .get_mut(entity)
            .ok_or(BackendError::NotFound)?;
        let start_load = record.load == LoadState::Unloaded;
        if start_load {
            record.load = LoadState::Loading;
        }

        let handle = HandleId::new(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, entity.clone());
        if start_load {
            self.schedule(
                self.config.load_delay_ticks,
                Action::CompleteLoad(entity.clone()),
            );
        }
        Ok(handle)
    }

    fn release(&mut self, handle: HandleId) {
        self.handles.remove(&handle);
    }

    fn is_loaded(&self, handle: HandleId) -> bool {
        self.record(handle)
            .map(|r| r.load == LoadState::Loaded)
            .unwrap_or(false)
    }

    fn load_error(&self, handle: HandleId) -> Option<BackendError> {
        match &self.record(handle).ok()?.load {
            LoadState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    fn metadata(&self, handle: HandleId) -> Result<PlaylistMeta, BackendError> {
        self.loaded_record(handle).map(|r| r.meta.clone())
    }

    fn current_items(&self, handle: HandleId) -> Result<Vec<Item>, BackendError> {
        self.loaded_record(handle).map(|r| r.items.clone())
    }

    fn insert_items(
        &mut self,
        handle: HandleId,
        index: usize,
        items: &[Item],
    ) -> Result<(), BackendError> {
        let (entity, record) = self.mutable_record(handle)?;
        if index > record.items.len() {
            return Err(BackendError::InvalidIndices);
        }
        record.items.splice(index..index, items.iter().cloned());
        record.pending_updates += 1;
        self.schedule(self.config.settle_delay_ticks, Action::Settle(entity));
        Ok(())
    }

    fn remove_items(&mut self, handle: HandleId, indices: &[usize]) -> Result<(), BackendError> {
        let (entity, record) = self.mutable_record(handle)?;
        remove_indices(&mut record.items, indices)?;
        record.pending_updates += 1;
        self.schedule(self.config.settle_delay_ticks, Action::Settle(entity));
        Ok(())
    }

    fn has_pending_changes(&self, handle: HandleId) -> bool {
        self.record(handle)
            .map(|r| r.pending_updates > 0)
            .unwrap_or(false)
    }

    fn process_events(&mut self, events: &mut Vec<BackendEvent>) -> Duration {
        self.tick += 1;
        let now = self.tick;
        let (ready, waiting): (Vec<Scheduled>, Vec<Scheduled>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|s| s.due <= now);
        self.scheduled = waiting;
        for scheduled in ready {
            self.fire(scheduled.action);
        }

        let take = self.outbox.len().min(self.config.max_events_per_pump.max(1));
        events.extend(self.outbox.drain(..take));

        if !self.outbox.is_empty() {
            Duration::ZERO
        } else if !self.scheduled.is_empty() {
            self.config.tick
        } else {
            self.config.idle
        }
    }
}
