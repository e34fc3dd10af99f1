use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_PHOTOS_PER_RESERVATION;
use crate::model::*;
use crate::wal::Wal;

use super::writer::{wal_writer_loop, WalCommand, WalStats};
use super::*;

/// DashMap-backed implementation of every storage collaborator.
///
/// With a WAL attached (`open`), each mutation is durably appended before it
/// becomes visible; replay on open rebuilds the maps.
pub struct InMemoryStore {
    tools: DashMap<Ulid, Tool>,
    users: DashMap<Ulid, UserProfile>,
    identities: DashMap<String, Ulid>,
    reservations: DashMap<Ulid, Reservation>,
    by_tool: DashMap<Ulid, Vec<Ulid>>,
    by_borrower: DashMap<Ulid, Vec<Ulid>>,
    photos: DashMap<Ulid, Vec<LoanPhoto>>,
    /// Keyed by (reservation, reviewer); the key is the uniqueness constraint.
    reviews: DashMap<(Ulid, Ulid), Review>,
    reviews_for: DashMap<Ulid, Vec<(Ulid, Ulid)>>,
    reputation: DashMap<Ulid, f64>,
    /// Shared by every write, exclusive for compaction, so a snapshot never
    /// misses an event still in flight to the WAL.
    commit: RwLock<()>,
    /// Per-key guards for check-and-write sequences. Reservations, their
    /// photos and their reviews share the reservation id as key.
    row_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Volatile store with no WAL.
    pub fn new() -> Self {
        Self::with_wal(None)
    }

    fn with_wal(wal_tx: Option<mpsc::Sender<WalCommand>>) -> Self {
        Self {
            tools: DashMap::new(),
            users: DashMap::new(),
            identities: DashMap::new(),
            reservations: DashMap::new(),
            by_tool: DashMap::new(),
            by_borrower: DashMap::new(),
            photos: DashMap::new(),
            reviews: DashMap::new(),
            reviews_for: DashMap::new(),
            reputation: DashMap::new(),
            commit: RwLock::new(()),
            row_locks: DashMap::new(),
            wal_tx,
        }
    }

    /// Replay `wal_path` and keep appending to it. Must run inside a tokio
    /// runtime: the group-commit writer is spawned here.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));

        let store = Self::with_wal(Some(tx));
        for event in &events {
            store.apply(event);
        }
        tracing::info!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(store)
    }

    async fn persist(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn lock_row(&self, id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self
            .row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn persist_and_apply(&self, event: Event) -> Result<(), StoreError> {
        self.persist(&event).await?;
        self.apply(&event);
        Ok(())
    }

    /// Fold one event into the maps. Shared by replay and the live path.
    fn apply(&self, event: &Event) {
        match event {
            Event::ToolUpserted(tool) => {
                self.tools.insert(tool.id, tool.clone());
            }
            Event::UserUpserted(user) => {
                if let Some(previous) = self.users.insert(user.id, user.clone())
                    && previous.external_id != user.external_id
                {
                    self.identities.remove(&previous.external_id);
                }
                self.identities.insert(user.external_id.clone(), user.id);
            }
            Event::ReservationCreated(r) => {
                self.by_tool.entry(r.tool_id).or_default().push(r.id);
                self.by_borrower.entry(r.borrower_id).or_default().push(r.id);
                self.reservations.insert(r.id, r.clone());
            }
            Event::ReservationUpdated { id, patch } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    patch.apply(&mut r);
                }
            }
            Event::PhotoRecorded(photo) => {
                self.photos
                    .entry(photo.reservation_id)
                    .or_default()
                    .push(photo.clone());
            }
            Event::ReviewRecorded(review) => {
                let key = (review.reservation_id, review.reviewer_id);
                self.reviews.insert(key, review.clone());
                self.reviews_for.entry(review.reviewee_id).or_default().push(key);
            }
            Event::ReputationSet { user_id, score } => {
                self.reputation.insert(*user_id, *score);
            }
        }
    }

    // ── Catalog & identity seeding ───────────────────────────

    pub async fn upsert_tool(&self, tool: Tool) -> Result<(), StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(tool.id).await;
        self.persist_and_apply(Event::ToolUpserted(tool)).await
    }

    pub async fn upsert_user(&self, user: UserProfile) -> Result<(), StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(user.id).await;
        self.persist_and_apply(Event::UserUpserted(user)).await
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserProfile> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    // ── Compaction ───────────────────────────────────────────

    /// Minimal event sequence that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.tools.iter().map(|e| Event::ToolUpserted(e.value().clone())));
        events.extend(self.users.iter().map(|e| Event::UserUpserted(e.value().clone())));

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(reservations.into_iter().map(Event::ReservationCreated));

        for entry in self.photos.iter() {
            events.extend(entry.value().iter().cloned().map(Event::PhotoRecorded));
        }
        events.extend(self.reviews.iter().map(|e| Event::ReviewRecorded(e.value().clone())));
        events.extend(self.reputation.iter().map(|e| Event::ReputationSet {
            user_id: *e.key(),
            score: *e.value(),
        }));
        events
    }

    /// Rewrite the WAL from `snapshot`. No-op for a volatile store.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        // Exclusive: no write lands between snapshot and swap.
        let _guard = self.commit.write().await;
        let events = self.snapshot();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_stats().await.appends_since_compact
    }

    /// Zeroed for a volatile store.
    pub async fn wal_stats(&self) -> WalStats {
        let Some(wal_tx) = &self.wal_tx else {
            return WalStats::default();
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx.send(WalCommand::Stats { response: tx }).await.is_err() {
            return WalStats::default();
        }
        rx.await.unwrap_or_default()
    }

    fn collect_reservations(&self, ids: Option<Vec<Ulid>>) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = ids
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|e| e.value().clone()))
            .collect();
        out.sort_by_key(|r| (r.start_date, r.id));
        out
    }
}

#[async_trait]
impl ToolCatalog for InMemoryStore {
    async fn get_tool(&self, id: Ulid) -> Result<Option<Tool>, StoreError> {
        Ok(self.tools.get(&id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.get(&id).map(|e| e.value().clone()))
    }

    async fn list_reservations_for_tool(&self, tool_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        let ids = self.by_tool.get(&tool_id).map(|e| e.value().clone());
        Ok(self.collect_reservations(ids))
    }

    async fn list_reservations_for_borrower(
        &self,
        borrower_id: Ulid,
    ) -> Result<Vec<Reservation>, StoreError> {
        let ids = self.by_borrower.get(&borrower_id).map(|e| e.value().clone());
        Ok(self.collect_reservations(ids))
    }

    async fn create_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(reservation.id).await;
        if self.reservations.contains_key(&reservation.id) {
            return Err(StoreError::AlreadyExists(reservation.id));
        }
        self.persist_and_apply(Event::ReservationCreated(reservation)).await
    }

    async fn update_reservation(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        patch: ReservationPatch,
    ) -> Result<Reservation, StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(id).await;
        let mut updated = self
            .reservations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        if updated.status != expected {
            return Err(StoreError::StatusMismatch {
                expected,
                current: updated.status,
            });
        }
        patch.apply(&mut updated);
        self.persist_and_apply(Event::ReservationUpdated { id, patch }).await?;
        Ok(updated)
    }
}

#[async_trait]
impl PhotoStore for InMemoryStore {
    async fn list_photos(
        &self,
        reservation_id: Ulid,
        kind: Option<PhotoKind>,
    ) -> Result<Vec<LoanPhoto>, StoreError> {
        let photos = self
            .photos
            .get(&reservation_id)
            .map(|e| {
                e.value()
                    .iter()
                    .filter(|p| kind.is_none_or(|k| p.kind == k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(photos)
    }

    async fn create_photo(&self, photo: LoanPhoto) -> Result<(), StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(photo.reservation_id).await;
        let count = self
            .photos
            .get(&photo.reservation_id)
            .map_or(0, |e| e.value().len());
        if count >= MAX_PHOTOS_PER_RESERVATION {
            return Err(StoreError::LimitExceeded("too many photos on reservation"));
        }
        self.persist_and_apply(Event::PhotoRecorded(photo)).await
    }
}

#[async_trait]
impl ReviewStore for InMemoryStore {
    async fn get_review_for(
        &self,
        reservation_id: Ulid,
        reviewer_id: Ulid,
    ) -> Result<Option<Review>, StoreError> {
        Ok(self
            .reviews
            .get(&(reservation_id, reviewer_id))
            .map(|e| e.value().clone()))
    }

    async fn create_review(&self, review: Review) -> Result<(), StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(review.reservation_id).await;
        if self
            .reviews
            .contains_key(&(review.reservation_id, review.reviewer_id))
        {
            return Err(StoreError::DuplicateReview);
        }
        self.persist_and_apply(Event::ReviewRecorded(review)).await
    }

    async fn list_reviews_for(&self, user_id: Ulid) -> Result<Vec<Review>, StoreError> {
        let keys = self
            .reviews_for
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut reviews: Vec<Review> = keys
            .iter()
            .filter_map(|k| self.reviews.get(k).map(|e| e.value().clone()))
            .collect();
        reviews.sort_by_key(|r| r.created_at);
        Ok(reviews)
    }
}

#[async_trait]
impl IdentityResolver for InMemoryStore {
    async fn resolve(&self, external_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let Some(id) = self.identities.get(external_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.get_user(&id))
    }
}

#[async_trait]
impl ReputationStore for InMemoryStore {
    async fn set_reputation_score(&self, user_id: Ulid, score: f64) -> Result<(), StoreError> {
        let _commit = self.commit.read().await;
        let _row = self.lock_row(user_id).await;
        self.persist_and_apply(Event::ReputationSet { user_id, score }).await
    }

    async fn reputation_score(&self, user_id: Ulid) -> Result<Option<f64>, StoreError> {
        Ok(self.reputation.get(&user_id).map(|e| *e.value()))
    }
}
