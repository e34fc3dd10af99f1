mod conflict;
mod error;
mod mutations;
pub mod policy;
mod queries;
mod reviews;

pub use conflict::{booked_ranges, find_conflict, has_conflict};
pub use error::EngineError;
pub use reviews::calculate_reputation_score;

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::observability::{COMMANDS_TOTAL, COMMAND_DURATION_SECONDS, SIDE_EFFECT_FAILURES_TOTAL};
use crate::store::Collaborators;

/// Borrower's reservation request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReservation {
    pub tool_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPhoto {
    pub kind: PhotoKind,
    pub url: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Rating arrives as a raw number and is validated as an integer from 1 to 5.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReview {
    pub rating: f64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Which side of a loan the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Party {
    Borrower,
    Owner,
}

/// Reservation lifecycle orchestrator.
///
/// Each command resolves the caller, loads current state through the
/// collaborators, validates, writes the new state with a conditional update,
/// then fires notifications without waiting on them.
pub struct Engine {
    pub(super) collab: Collaborators,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes conflict-checked writes per tool within this process.
    tool_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes reputation recomputes per reviewee, so a slow recompute
    /// cannot overwrite a score computed from a newer review list.
    reputation_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(collab: Collaborators, clock: Arc<dyn Clock>) -> Self {
        Self {
            collab,
            clock,
            tool_locks: DashMap::new(),
            reputation_locks: DashMap::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// External identity → internal user. Unknown identities are not authorized.
    pub async fn resolve_caller(&self, external_id: &str) -> Result<UserProfile, EngineError> {
        self.collab
            .identity
            .resolve(external_id)
            .await?
            .ok_or(EngineError::NotAuthorized("unknown caller"))
    }

    pub(super) async fn load_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.collab
            .reservations
            .get_reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) async fn load_tool(&self, id: Ulid) -> Result<Tool, EngineError> {
        self.collab
            .tools
            .get_tool(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Load the reservation and its tool, and place the caller on one side.
    pub(super) async fn load_for_party(
        &self,
        caller: &UserProfile,
        reservation_id: Ulid,
    ) -> Result<(Reservation, Tool, Option<Party>), EngineError> {
        let reservation = self.load_reservation(reservation_id).await?;
        let tool = self.load_tool(reservation.tool_id).await?;
        let party = party_of(caller.id, &reservation, &tool);
        Ok((reservation, tool, party))
    }

    pub(super) async fn lock_tool(&self, tool_id: Ulid) -> OwnedMutexGuard<()> {
        lock_key(&self.tool_locks, tool_id).await
    }

    pub(super) async fn lock_reputation(&self, user_id: Ulid) -> OwnedMutexGuard<()> {
        lock_key(&self.reputation_locks, user_id).await
    }

    /// Conditional write: succeeds only if the stored status is still the one
    /// this command validated against.
    pub(super) async fn commit(
        &self,
        reservation: &Reservation,
        patch: ReservationPatch,
        action: &'static str,
    ) -> Result<Reservation, EngineError> {
        self.collab
            .reservations
            .update_reservation(reservation.id, reservation.status, patch)
            .await
            .map_err(|e| match e {
                crate::store::StoreError::StatusMismatch { current, .. } => {
                    EngineError::InvalidStateTransition { action, current }
                }
                other => other.into(),
            })
    }

    /// Fire-and-forget delivery. Failures are logged and counted, never returned.
    pub(super) fn dispatch(&self, request: NotificationRequest) {
        let sink = self.collab.notifier.clone();
        tokio::spawn(async move {
            let kind = request.kind;
            let user_id = request.user_id;
            if let Err(e) = sink.notify(request).await {
                warn!("notification {} to {user_id} failed: {e}", kind.as_str());
                metrics::counter!(SIDE_EFFECT_FAILURES_TOTAL, "effect" => "notify").increment(1);
            }
        });
    }
}

async fn lock_key(locks: &DashMap<Ulid, Arc<Mutex<()>>>, key: Ulid) -> OwnedMutexGuard<()> {
    let lock = locks
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    lock.lock_owned().await
}

pub(crate) fn party_of(user_id: Ulid, reservation: &Reservation, tool: &Tool) -> Option<Party> {
    if user_id == reservation.borrower_id {
        Some(Party::Borrower)
    } else if user_id == tool.owner_id {
        Some(Party::Owner)
    } else {
        None
    }
}

pub(crate) fn tool_label(tool: &Tool) -> String {
    tool.name.clone().unwrap_or_else(|| format!("tool {}", tool.id))
}

pub(crate) fn user_label(user: &UserProfile) -> &str {
    user.display_name.as_deref().unwrap_or("Someone")
}

/// Record outcome and latency of one command.
pub(crate) fn observe<T>(
    command: &'static str,
    started: Instant,
    result: Result<T, EngineError>,
) -> Result<T, EngineError> {
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(COMMANDS_TOTAL, "command" => command, "status" => status).increment(1);
    metrics::histogram!(COMMAND_DURATION_SECONDS, "command" => command)
        .record(started.elapsed().as_secs_f64());
    result
}
