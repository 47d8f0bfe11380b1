//! Per-user admin verification with supersession.
//!
//! Starting a verification for a user aborts the one already in flight. Each
//! start takes a fresh generation from a tracker-wide counter, and a task only
//! publishes its result when its generation is still current, so a superseded
//! result is never observed. Generations are never reused, even after a slot
//! is removed and recreated.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

use super::{AdminResolution, AdminRoleResolver, ResolutionReason};
use crate::gateway::session::Session;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationState {
    Idle,
    Verifying,
    Done(AdminResolution),
}

struct Slot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
    state: watch::Sender<VerificationState>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish `resolution` if `generation` still owns the slot. Returns whether
/// it did.
fn publish(slots: &Slots, user_id: &str, generation: u64, resolution: AdminResolution) -> bool {
    let mut slots = lock(slots);
    let current = slots
        .get(user_id)
        .is_some_and(|slot| slot.generation == generation);
    if !current {
        debug!("Discarding superseded admin verification");
        return false;
    }
    if let Some(slot) = slots.remove(user_id) {
        slot.state.send_replace(VerificationState::Done(resolution));
    }
    true
}

pub struct AdminStatusTracker {
    resolver: Arc<AdminRoleResolver>,
    slots: Slots,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for AdminStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminStatusTracker").finish_non_exhaustive()
    }
}

impl AdminStatusTracker {
    #[must_use]
    pub fn new(resolver: Arc<AdminRoleResolver>) -> Self {
        Self {
            resolver,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start verifying the session owner, superseding any verification in
    /// flight for the same user. With `force` the cached status is dropped
    /// first.
    pub fn start(&self, session: Session, force: bool) -> watch::Receiver<VerificationState> {
        let user_id = session.user_id.clone();
        let mut slots = lock(&self.slots);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let slot = slots.entry(user_id.clone()).or_insert_with(|| Slot {
            generation: 0,
            handle: None,
            state: watch::channel(VerificationState::Idle).0,
        });

        slot.generation = generation;
        if let Some(previous) = slot.handle.take() {
            debug!("Superseding in-flight admin verification");
            previous.abort();
        }
        slot.state.send_replace(VerificationState::Verifying);
        let receiver = slot.state.subscribe();

        let resolver = Arc::clone(&self.resolver);
        let task_slots = Arc::clone(&self.slots);
        slot.handle = Some(tokio::spawn(async move {
            if force {
                resolver.invalidate(&user_id).await;
            }
            let resolution = resolver.resolve(Some(&session), &user_id).await;
            publish(&task_slots, &user_id, generation, resolution);
        }));
        receiver
    }

    /// Verify and wait for the result.
    pub async fn verify(&self, session: Session, force: bool) -> AdminResolution {
        let mut receiver = self.start(session, force);
        let outcome = receiver
            .wait_for(|state| matches!(state, VerificationState::Done(_)))
            .await
            .map(|state| (*state).clone());
        match outcome {
            Ok(VerificationState::Done(resolution)) => resolution,
            // Superseded before finishing.
            _ => AdminResolution::denied(
                ResolutionReason::Unavailable,
                Some("verification superseded".to_string()),
            ),
        }
    }

    /// Current state of the verification for `user_id`.
    #[must_use]
    pub fn state(&self, user_id: &str) -> VerificationState {
        lock(&self.slots)
            .get(user_id)
            .map_or(VerificationState::Idle, |slot| slot.state.borrow().clone())
    }

    /// Abort the verification in flight for `user_id`, if any.
    #[cfg(test)]
    pub(crate) fn cancel(&self, user_id: &str) {
        if let Some(slot) = lock(&self.slots).remove(user_id) {
            if let Some(handle) = slot.handle {
                handle.abort();
            }
        }
    }
}
