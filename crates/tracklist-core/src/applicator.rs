//! Drives a desired item list onto a live playlist.
//!
//! One operation is submitted at a time. After each settlement the live list is
//! compared with the list the script predicted; any difference means something
//! else touched the playlist and the rest of the script is thrown away and
//! recomputed against what is actually there.

use std::collections::{HashMap, VecDeque};

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::backend::{Backend, HandleId};
use crate::diff::{self, DiffScratch, EditOp};
use crate::dispatcher::{readiness_result, Dispatcher};
use crate::link::{EntityRef, Item};
use crate::registry::Condition;
use crate::request::RequestError;
use crate::response::Reply;

/// A patch request whose playlist is loaded but whose turn has not come.
#[derive(Debug)]
pub struct PendingPatch {
    pub handle: HandleId,
    pub desired: Vec<Item>,
    pub reply: Reply,
}

#[derive(Debug)]
pub enum Admission {
    Start(PendingPatch),
    Queued { position: usize },
}

#[derive(Debug, Default)]
struct Lane {
    queue: VecDeque<PendingPatch>,
}

/// At most one in-flight patch per playlist; later ones wait in arrival order.
#[derive(Debug, Default)]
pub struct PatchBoard {
    lanes: HashMap<EntityRef, Lane>,
}

impl PatchBoard {
    pub fn admit(&mut self, entity: &EntityRef, patch: PendingPatch) -> Admission {
        match self.lanes.get_mut(entity) {
            Some(lane) => {
                lane.queue.push_back(patch);
                Admission::Queued {
                    position: lane.queue.len(),
                }
            }
            None => {
                self.lanes.insert(entity.clone(), Lane::default());
                Admission::Start(patch)
            }
        }
    }

    /// Marks the in-flight patch for `entity` finished and hands out the next
    /// one, which becomes in-flight in turn.
    pub fn complete(&mut self, entity: &EntityRef) -> Option<PendingPatch> {
        let lane = self.lanes.get_mut(entity)?;
        let next = lane.queue.pop_front();
        if next.is_none() {
            self.lanes.remove(entity);
        }
        next
    }

    pub fn is_active(&self, entity: &EntityRef) -> bool {
        self.lanes.contains_key(entity)
    }

    /// Forgets every lane, dropping queued patches. Returns how many were queued.
    pub fn clear(&mut self) -> usize {
        self.lanes.drain().map(|(_, lane)| lane.queue.len()).sum()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// The live list matches the desired one.
    Done,
    Submit(EditOp<Item>),
    /// Too many re-diff rounds; the playlist keeps moving underneath.
    Exhausted,
}

#[derive(Debug)]
pub struct InFlightPatch {
    entity: EntityRef,
    handle: HandleId,
    desired: Vec<Item>,
    script: VecDeque<EditOp<Item>>,
    expected: Option<Vec<Item>>,
    rounds: u32,
    submitted: u32,
}

impl InFlightPatch {
    pub fn new(entity: EntityRef, handle: HandleId, desired: Vec<Item>) -> Self {
        Self {
            entity,
            handle,
            desired,
            script: VecDeque::new(),
            expected: None,
            rounds: 0,
            submitted: 0,
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Picks the next operation given the live list. The remaining script is
    /// reused only while the live list is exactly what it predicted.
    pub fn next_step(
        &mut self,
        current: &[Item],
        scratch: &mut DiffScratch,
        max_rounds: u32,
    ) -> Step {
        if current == self.desired.as_slice() {
            return Step::Done;
        }

        let on_track = self.expected.as_deref() == Some(current);
        if !on_track && self.expected.is_some() {
            debug!(entity = %self.entity, "playlist changed underneath the patch");
        }
        if !on_track || self.script.is_empty() {
            if self.rounds >= max_rounds {
                return Step::Exhausted;
            }
            self.rounds += 1;
            let script = diff::compute_with(scratch, current, &self.desired);
            debug!(
                entity = %self.entity,
                round = self.rounds,
                ops = script.len(),
                "computed edit script\n{}",
                script.listing(current)
            );
            self.script = script.into_ops().into();
        }

        let Some(op) = self.script.pop_front() else {
            return Step::Exhausted;
        };
        let mut expected = current.to_vec();
        self.expected = op.apply_to(&mut expected).ok().map(|()| expected);
        self.submitted += 1;
        Step::Submit(op)
    }
}

impl<B: Backend + 'static> Dispatcher<B> {
    pub(crate) fn admit_patch(
        &mut self,
        entity: EntityRef,
        handle: HandleId,
        desired: Vec<Item>,
        reply: Reply,
    ) {
        let pending = PendingPatch {
            handle,
            desired,
            reply,
        };
        match self.patches.admit(&entity, pending) {
            Admission::Start(pending) => self.start_patch(entity, pending),
            Admission::Queued { position } => {
                counter!("tracklist_patches_queued_total", 1);
                debug!(%entity, %handle, position, "patch queued behind in-flight patch");
            }
        }
    }

    fn start_patch(&mut self, entity: EntityRef, pending: PendingPatch) {
        let PendingPatch {
            handle,
            desired,
            reply,
        } = pending;
        debug!(%entity, %handle, items = desired.len(), "patch started");
        self.drive_patch(InFlightPatch::new(entity, handle, desired), reply);
    }

    fn drive_patch(&mut self, mut patch: InFlightPatch, reply: Reply) {
        let current = match self.backend().current_items(patch.handle) {
            Ok(current) => current,
            Err(err) => return self.abort_patch(patch, reply, err.into()),
        };
        let max_rounds = self.config.max_patch_rounds;
        let op = match patch.next_step(&current, &mut self.scratch, max_rounds) {
            Step::Done => return self.finish_patch(patch, reply),
            Step::Exhausted => return self.abort_patch(patch, reply, RequestError::PatchDiverged),
            Step::Submit(op) => op,
        };

        let handle = patch.handle;
        let submitted = match &op {
            EditOp::Remove { index, count } => {
                let indices: Vec<usize> = (*index..index + count).collect();
                self.backend_mut().remove_items(handle, &indices)
            }
            EditOp::Insert { index, items } => {
                self.backend_mut().insert_items(handle, *index, items)
            }
        };
        if let Err(err) = submitted {
            return self.abort_patch(patch, reply, err.into());
        }

        self.await_condition(handle, Condition::Settled, move |this, _, readiness| {
            match readiness_result(readiness) {
                Ok(()) => this.drive_patch(patch, reply),
                Err(err) => this.abort_patch(patch, reply, err),
            }
        });
    }

    fn finish_patch(&mut self, patch: InFlightPatch, reply: Reply) {
        info!(
            entity = %patch.entity,
            rounds = patch.rounds,
            ops = patch.submitted,
            "patch applied"
        );
        histogram!("tracklist_patch_rounds", f64::from(patch.rounds));
        self.respond_view(patch.handle, reply);
        self.start_next_patch(&patch.entity);
    }

    fn abort_patch(&mut self, patch: InFlightPatch, reply: Reply, err: RequestError) {
        warn!(
            entity = %patch.entity,
            rounds = patch.rounds,
            ops = patch.submitted,
            error = %err,
            "patch aborted"
        );
        self.fail(patch.handle, reply, err);
        self.start_next_patch(&patch.entity);
    }

    fn start_next_patch(&mut self, entity: &EntityRef) {
        if let Some(next) = self.patches.complete(entity) {
            self.start_patch(entity.clone(), next);
        }
    }
}
