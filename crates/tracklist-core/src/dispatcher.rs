//! Request lifecycle on the loop thread.
//!
//! Every request opens its own handle, parks until the playlist is loaded,
//! runs its operation and releases the handle again, answering exactly once.

use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::applicator::PatchBoard;
use crate::backend::{Backend, BackendError, BackendEvent, HandleId, Notification, SessionEvent};
use crate::config::BridgeConfig;
use crate::diff::DiffScratch;
use crate::link::EntityRef;
use crate::registry::{Condition, Readiness, Registry};
use crate::request::{Operation, Request, RequestError};
use crate::response::{PlaylistView, Reply, Response};

/// What one pump left for the loop to act on.
#[derive(Debug)]
pub struct PumpOutcome {
    pub next_timeout: Duration,
    pub session_events: Vec<SessionEvent>,
}

pub struct Dispatcher<B: Backend + 'static> {
    backend: B,
    pub(crate) registry: Registry<Dispatcher<B>>,
    pub(crate) patches: PatchBoard,
    pub(crate) scratch: DiffScratch,
    pub(crate) config: BridgeConfig,
    events: Vec<BackendEvent>,
}

pub(crate) fn readiness_result(readiness: Readiness) -> Result<(), RequestError> {
    match readiness {
        Readiness::Ready => Ok(()),
        Readiness::Failed(err) => Err(RequestError::Backend(err)),
        Readiness::TimedOut(_) => Err(RequestError::TimedOut),
    }
}

impl<B: Backend + 'static> Dispatcher<B> {
    pub fn new(backend: B, config: BridgeConfig) -> Self {
        Self {
            backend,
            registry: Registry::new(),
            patches: PatchBoard::default(),
            scratch: DiffScratch::new(),
            config,
            events: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn parked(&self) -> usize {
        self.registry.len()
    }

    pub fn handle(&mut self, request: Request, reply: Reply) {
        let Request { entity, operation } = request;
        counter!("tracklist_requests_total", 1, "op" => operation.label());

        let entity = match EntityRef::parse(&entity) {
            Ok(entity) => entity,
            Err(err) => return self.reject(reply, err.into()),
        };
        let handle = match self.backend.open(&entity) {
            Ok(handle) => handle,
            Err(err) => return self.reject(reply, err.into()),
        };
        debug!(%entity, %handle, op = operation.label(), "request accepted");

        self.await_condition(handle, Condition::Loaded, move |this, handle, readiness| {
            match readiness_result(readiness) {
                Ok(()) => this.run_operation(entity, handle, operation, reply),
                Err(err) => this.fail(handle, reply, err),
            }
        });
        self.run_due();
    }

    /// Parks `on_ready` until `condition` holds for `handle`. A condition that
    /// already holds is queued for the next [`Dispatcher::run_due`]; a load
    /// that already failed is answered at once.
    pub(crate) fn await_condition<F>(&mut self, handle: HandleId, condition: Condition, on_ready: F)
    where
        F: FnOnce(&mut Self, HandleId, Readiness) + 'static,
    {
        if condition == Condition::Loaded {
            if let Some(err) = self.backend.load_error(handle) {
                debug!(%handle, error = %err, "playlist already failed to load");
                return on_ready(self, handle, Readiness::Failed(err));
            }
        }
        let deadline = self
            .config
            .continuation_timeout
            .map(|timeout| Instant::now() + timeout);
        match self
            .registry
            .register(handle, condition, deadline, Box::new(on_ready))
        {
            Ok(token) => {
                if condition.is_met(&self.backend, handle) {
                    self.registry.mark_due(handle, token);
                }
            }
            Err(rejected) => {
                warn!(error = %rejected.error, "refusing second continuation");
                let message = rejected.error.to_string();
                rejected
                    .registration
                    .fire(self, Readiness::Failed(BackendError::Other(message)));
            }
        }
        gauge!("tracklist_parked_continuations", self.registry.len() as f64);
    }

    /// Runs continuations whose condition held when they were parked, including
    /// any queued by the continuations themselves.
    pub fn run_due(&mut self) {
        while let Some(registration) = self.registry.take_due() {
            registration.fire(self, Readiness::Ready);
        }
    }

    pub fn deliver(&mut self, notification: Notification) {
        let backend = &self.backend;
        let fired = self.registry.on_event(&notification, |condition| {
            condition.is_met(backend, notification.handle)
        });
        if let Some((registration, readiness)) = fired {
            registration.fire(self, readiness);
        }
    }

    /// Drains the backend until it asks for a pause, routing what surfaces.
    pub fn pump(&mut self) -> PumpOutcome {
        let mut session_events = Vec::new();
        let mut iterations = 0u32;
        let next_timeout = loop {
            iterations += 1;
            let mut events = std::mem::take(&mut self.events);
            let timeout = self.backend.process_events(&mut events);
            for event in events.drain(..) {
                match event {
                    BackendEvent::Entity(notification) => self.deliver(notification),
                    BackendEvent::Session(event) => session_events.push(event),
                }
            }
            self.events = events;
            self.run_due();

            if !timeout.is_zero() {
                break timeout;
            }
            if iterations >= self.config.max_pump_iterations {
                break Duration::ZERO;
            }
        };
        counter!("tracklist_pump_iterations_total", u64::from(iterations));
        self.expire(Instant::now());
        PumpOutcome {
            next_timeout,
            session_events,
        }
    }

    /// Answers continuations whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        for (registration, readiness) in self.registry.expire(now) {
            warn!(
                handle = %registration.handle(),
                condition = %registration.condition(),
                "continuation timed out"
            );
            counter!("tracklist_continuations_expired_total", 1);
            registration.fire(self, readiness);
        }
        self.run_due();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_deadline()
    }

    /// Drops every parked continuation and queued patch; their requesters
    /// observe a closed reply channel.
    pub fn teardown(&mut self) {
        let parked = self.registry.teardown();
        let queued = self.patches.clear();
        if parked + queued > 0 {
            info!(parked, queued, "dropping outstanding requests");
        }
        gauge!("tracklist_parked_continuations", 0.0);
    }

    fn run_operation(
        &mut self,
        entity: EntityRef,
        handle: HandleId,
        operation: Operation,
        reply: Reply,
    ) {
        match operation {
            Operation::Get => self.respond_view(handle, reply),
            Operation::GetField(field) => match self.backend.metadata(handle) {
                Ok(meta) => {
                    self.backend.release(handle);
                    reply.send(Response::field(field, &meta));
                }
                Err(err) => self.fail(handle, reply, err.into()),
            },
            Operation::AddItems { items, .. } if items.is_empty() => {
                self.respond_view(handle, reply)
            }
            Operation::AddItems { index, items } => {
                let submitted = self.backend.insert_items(handle, index, &items);
                self.after_mutation(handle, submitted, reply);
            }
            Operation::RemoveItems { index, count } => {
                let submitted = self.remove_range(handle, index, count);
                self.after_mutation(handle, submitted, reply);
            }
            Operation::Patch { desired } if desired.is_empty() => self.respond_view(handle, reply),
            Operation::Patch { desired } => self.admit_patch(entity, handle, desired, reply),
        }
    }

    /// The range is checked against the live list before any index is built.
    fn remove_range(
        &mut self,
        handle: HandleId,
        index: usize,
        count: usize,
    ) -> Result<(), BackendError> {
        let len = self.backend.current_items(handle)?.len();
        match index.checked_add(count) {
            Some(end) if end <= len => {
                let indices: Vec<usize> = (index..end).collect();
                self.backend.remove_items(handle, &indices)
            }
            _ => Err(BackendError::InvalidIndices),
        }
    }

    fn after_mutation(
        &mut self,
        handle: HandleId,
        submitted: Result<(), BackendError>,
        reply: Reply,
    ) {
        if let Err(err) = submitted {
            return self.fail(handle, reply, err.into());
        }
        self.await_condition(handle, Condition::Settled, move |this, handle, readiness| {
            match readiness_result(readiness) {
                Ok(()) => this.respond_view(handle, reply),
                Err(err) => this.fail(handle, reply, err),
            }
        });
    }

    pub(crate) fn respond_view(&mut self, handle: HandleId, reply: Reply) {
        let view = self
            .backend
            .metadata(handle)
            .and_then(|meta| Ok(PlaylistView::new(meta, self.backend.current_items(handle)?)));
        match view {
            Ok(view) => {
                self.backend.release(handle);
                reply.send(Response::playlist(view));
            }
            Err(err) => self.fail(handle, reply, err.into()),
        }
    }

    pub(crate) fn fail(&mut self, handle: HandleId, reply: Reply, err: RequestError) {
        self.backend.release(handle);
        self.reject(reply, err);
    }

    fn reject(&mut self, reply: Reply, err: RequestError) {
        debug!(error = %err, "request failed");
        counter!("tracklist_request_errors_total", 1, "kind" => err.kind());
        reply.send(Response::from_error(&err));
    }
}
