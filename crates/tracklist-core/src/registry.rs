//! One-shot continuations parked on backend handles.
//!
//! Each handle owns at most one slot. A registration is removed from its slot
//! before its continuation runs, so a repeated notification for the same handle
//! finds nothing to fire.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use crate::backend::{Backend, BackendError, EntityEvent, HandleId, Notification};

/// The state a continuation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Loaded,
    /// No submitted mutation is still unconfirmed.
    Settled,
}

impl Condition {
    pub fn is_met<B: Backend + ?Sized>(self, backend: &B, handle: HandleId) -> bool {
        match self {
            Condition::Loaded => backend.is_loaded(handle),
            Condition::Settled => !backend.has_pending_changes(handle),
        }
    }

    fn triggered_by(self, event: &EntityEvent) -> bool {
        matches!(
            (self, event),
            (Condition::Loaded, EntityEvent::Loaded)
                | (Condition::Settled, EntityEvent::MutationSettled)
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Loaded => f.write_str("loaded"),
            Condition::Settled => f.write_str("settled"),
        }
    }
}

/// Outcome handed to a continuation. Failure and expiry still count as
/// delivery; the registration is gone either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed(BackendError),
    TimedOut(Condition),
}

pub type OnReady<C> = Box<dyn FnOnce(&mut C, HandleId, Readiness)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

pub struct Registration<C> {
    handle: HandleId,
    condition: Condition,
    token: Token,
    deadline: Option<Instant>,
    on_ready: OnReady<C>,
}

impl<C> Registration<C> {
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Consumes the registration; the continuation cannot run twice.
    pub fn fire(self, ctx: &mut C, readiness: Readiness) {
        trace!(
            handle = %self.handle,
            condition = %self.condition,
            ?readiness,
            "continuation fired"
        );
        (self.on_ready)(ctx, self.handle, readiness)
    }
}

impl<C> fmt::Debug for Registration<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .field("condition", &self.condition)
            .field("token", &self.token)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a continuation is already parked on {0}")]
    SlotTaken(HandleId),
}

/// A registration the registry refused; the continuation is handed back so
/// the caller can still answer through it.
pub struct Rejected<C> {
    pub error: RegistryError,
    pub registration: Registration<C>,
}

impl<C> fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("registration", &self.registration)
            .finish()
    }
}

pub struct Registry<C> {
    slots: HashMap<HandleId, Registration<C>>,
    due: VecDeque<(HandleId, Token)>,
    next_token: u64,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            due: VecDeque::new(),
            next_token: 0,
        }
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        handle: HandleId,
        condition: Condition,
        deadline: Option<Instant>,
        on_ready: OnReady<C>,
    ) -> Result<Token, Rejected<C>> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let registration = Registration {
            handle,
            condition,
            token,
            deadline,
            on_ready,
        };
        if self.slots.contains_key(&handle) {
            return Err(Rejected {
                error: RegistryError::SlotTaken(handle),
                registration,
            });
        }
        self.slots.insert(handle, registration);
        Ok(token)
    }

    /// Queues a registration whose condition already holds. It is handed out
    /// by [`Registry::take_due`] unless something else fires it first.
    pub fn mark_due(&mut self, handle: HandleId, token: Token) {
        self.due.push_back((handle, token));
    }

    pub fn take_due(&mut self) -> Option<Registration<C>> {
        while let Some((handle, token)) = self.due.pop_front() {
            if self.slots.get(&handle).is_some_and(|r| r.token == token) {
                return self.slots.remove(&handle);
            }
        }
        None
    }

    /// Routes one backend notification. `is_met` re-checks the condition
    /// against the backend, since a notification alone is not proof.
    pub fn on_event(
        &mut self,
        notification: &Notification,
        is_met: impl FnOnce(Condition) -> bool,
    ) -> Option<(Registration<C>, Readiness)> {
        let condition = self.slots.get(&notification.handle)?.condition;
        let readiness = match &notification.event {
            EntityEvent::Failed(err) => Readiness::Failed(err.clone()),
            event if condition.triggered_by(event) && is_met(condition) => Readiness::Ready,
            _ => return None,
        };
        let registration = self.slots.remove(&notification.handle)?;
        Some((registration, readiness))
    }

    /// Detaches every registration whose deadline is at or before `now`,
    /// oldest registration first.
    pub fn expire(&mut self, now: Instant) -> Vec<(Registration<C>, Readiness)> {
        let mut expired: Vec<HandleId> = self
            .slots
            .values()
            .filter(|r| r.deadline.is_some_and(|d| d <= now))
            .map(|r| r.handle)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        expired.sort_by_key(|h| self.slots[h].token);
        expired
            .into_iter()
            .filter_map(|h| self.slots.remove(&h))
            .map(|r| {
                let readiness = Readiness::TimedOut(r.condition);
                (r, readiness)
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().filter_map(|r| r.deadline).min()
    }

    /// Drops every parked continuation without running it.
    pub fn teardown(&mut self) -> usize {
        self.due.clear();
        let dropped = self.slots.len();
        self.slots.clear();
        dropped
    }

    pub fn is_parked(&self, handle: HandleId) -> bool {
        self.slots.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<C> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("parked", &self.slots.len())
            .field("due", &self.due.len())
            .finish()
    }
}
