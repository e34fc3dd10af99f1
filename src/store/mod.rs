//! Collaborator interfaces consumed by the lifecycle engine, plus the
//! in-process implementation used by the server and the tests.

mod memory;
mod writer;

pub use memory::InMemoryStore;
pub use writer::WalStats;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Conditional update lost: the stored status is no longer the expected one.
    #[error("expected status {expected}, found {current}")]
    StatusMismatch {
        expected: ReservationStatus,
        current: ReservationStatus,
    },
    #[error("review already recorded for this reviewer")]
    DuplicateReview,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn get_tool(&self, id: Ulid) -> Result<Option<Tool>, StoreError>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    async fn list_reservations_for_tool(&self, tool_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    async fn list_reservations_for_borrower(
        &self,
        borrower_id: Ulid,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn create_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;

    /// Apply `patch` only if the stored status still equals `expected`.
    async fn update_reservation(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        patch: ReservationPatch,
    ) -> Result<Reservation, StoreError>;
}

#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn list_photos(
        &self,
        reservation_id: Ulid,
        kind: Option<PhotoKind>,
    ) -> Result<Vec<LoanPhoto>, StoreError>;

    async fn create_photo(&self, photo: LoanPhoto) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn get_review_for(
        &self,
        reservation_id: Ulid,
        reviewer_id: Ulid,
    ) -> Result<Option<Review>, StoreError>;

    /// Fails with `DuplicateReview` if (reservation, reviewer) already has one.
    async fn create_review(&self, review: Review) -> Result<(), StoreError>;

    async fn list_reviews_for(&self, user_id: Ulid) -> Result<Vec<Review>, StoreError>;
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, external_id: &str) -> Result<Option<UserProfile>, StoreError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReputationStore: Send + Sync {
    async fn set_reputation_score(&self, user_id: Ulid, score: f64) -> Result<(), StoreError>;

    async fn reputation_score(&self, user_id: Ulid) -> Result<Option<f64>, StoreError>;
}

/// Everything the engine talks to, bundled for construction.
#[derive(Clone)]
pub struct Collaborators {
    pub tools: Arc<dyn ToolCatalog>,
    pub reservations: Arc<dyn ReservationStore>,
    pub photos: Arc<dyn PhotoStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub identity: Arc<dyn IdentityResolver>,
    pub notifier: Arc<dyn NotificationSink>,
    pub reputation: Arc<dyn ReputationStore>,
}

impl Collaborators {
    /// Wire every storage role to one `InMemoryStore` and notifications to a hub.
    pub fn in_memory(store: Arc<InMemoryStore>, hub: Arc<NotifyHub>) -> Self {
        Self {
            tools: store.clone(),
            reservations: store.clone(),
            photos: store.clone(),
            reviews: store.clone(),
            identity: store.clone(),
            notifier: hub,
            reputation: store,
        }
    }
}
