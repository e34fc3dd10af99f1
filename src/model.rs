use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock timestamp used for every audit field.
pub type Timestamp = DateTime<Utc>;

/// Inclusive calendar-date range `[start, end]`. No time component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: ranges that share a boundary day overlap.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

// ── Tools ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Available,
    Unavailable,
    Archived,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Available => "available",
            ToolStatus::Unavailable => "unavailable",
            ToolStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry as seen by the lifecycle engine. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub id: Ulid,
    pub owner_id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    pub status: ToolStatus,
    /// Minimum whole days between today and the loan start.
    #[serde(default)]
    pub advance_notice_days: i64,
    /// Longest loan, counted inclusively in days.
    pub max_loan_days: i64,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Declined,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Declined => "declined",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Declined | ReservationStatus::Cancelled
        )
    }

    /// Statuses that hold the tool's calendar.
    pub fn blocks_dates(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::Active
        )
    }

    /// Forward-only transition table.
    ///
    /// - Pending → Confirmed | Declined | Cancelled
    /// - Confirmed → Active | Cancelled
    /// - Active → Completed
    pub fn can_transition_to(&self, target: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, target),
            (Pending, Confirmed)
                | (Pending, Declined)
                | (Pending, Cancelled)
                | (Confirmed, Active)
                | (Confirmed, Cancelled)
                | (Active, Completed)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub tool_id: Ulid,
    pub borrower_id: Ulid,
    pub status: ReservationStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub note: Option<String>,
    pub owner_note: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub pickup_confirmed_at: Option<Timestamp>,
    pub return_confirmed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Reservation {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

/// Partial update applied by the reservation store. `None` leaves a field alone.
///
/// Confirmation timestamps are set-once: a patch never overwrites or clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPatch {
    pub status: Option<ReservationStatus>,
    pub range: Option<DateRange>,
    pub owner_note: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub pickup_confirmed_at: Option<Timestamp>,
    pub return_confirmed_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl ReservationPatch {
    pub fn status(status: ReservationStatus, at: Timestamp) -> Self {
        Self {
            status: Some(status),
            updated_at: Some(at),
            ..Self::default()
        }
    }

    pub fn apply(&self, r: &mut Reservation) {
        if let Some(status) = self.status {
            r.status = status;
        }
        if let Some(range) = self.range {
            r.start_date = range.start;
            r.end_date = range.end;
        }
        if let Some(note) = &self.owner_note {
            r.owner_note = Some(note.clone());
        }
        if let Some(reason) = &self.cancel_reason {
            r.cancel_reason = Some(reason.clone());
        }
        if let Some(by) = self.cancelled_by {
            r.cancelled_by = Some(by);
        }
        if r.pickup_confirmed_at.is_none() {
            r.pickup_confirmed_at = self.pickup_confirmed_at;
        }
        if r.return_confirmed_at.is_none() {
            r.return_confirmed_at = self.return_confirmed_at;
        }
        if let Some(at) = self.updated_at {
            r.updated_at = at;
        }
    }
}

// ── Photos & reviews ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoKind {
    Before,
    After,
}

impl PhotoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoKind::Before => "before",
            PhotoKind::After => "after",
        }
    }
}

impl fmt::Display for PhotoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition evidence for a loan. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanPhoto {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub kind: PhotoKind,
    pub url: String,
    pub uploader_id: Ulid,
    pub notes: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub reviewer_id: Ulid,
    pub reviewee_id: Ulid,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: Timestamp,
}

// ── Users & notifications ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Ulid,
    /// Identity issued by the auth provider.
    pub external_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReservationRequested,
    ReservationRescheduled,
    ReservationApproved,
    ReservationDeclined,
    ReservationCancelled,
    PickupConfirmed,
    ReturnConfirmed,
    ReviewReceived,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReservationRequested => "reservation_requested",
            NotificationKind::ReservationRescheduled => "reservation_rescheduled",
            NotificationKind::ReservationApproved => "reservation_approved",
            NotificationKind::ReservationDeclined => "reservation_declined",
            NotificationKind::ReservationCancelled => "reservation_cancelled",
            NotificationKind::PickupConfirmed => "pickup_confirmed",
            NotificationKind::ReturnConfirmed => "return_confirmed",
            NotificationKind::ReviewReceived => "review_received",
        }
    }
}

/// What the engine asks the sink to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_id: Option<Ulid>,
}

/// A delivered notification, owned by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_id: Option<Ulid>,
    pub read: bool,
    pub created_at: Timestamp,
}

// ── WAL records ──────────────────────────────────────────────────

/// Store mutations as recorded in the WAL, one record per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ToolUpserted(Tool),
    UserUpserted(UserProfile),
    ReservationCreated(Reservation),
    ReservationUpdated {
        id: Ulid,
        patch: ReservationPatch,
    },
    PhotoRecorded(LoanPhoto),
    ReviewRecorded(Review),
    ReputationSet {
        user_id: Ulid,
        score: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn range_days_inclusive() {
        assert_eq!(DateRange::new(d(2026, 3, 1), d(2026, 3, 1)).days(), 1);
        assert_eq!(DateRange::new(d(2026, 3, 1), d(2026, 3, 7)).days(), 7);
        assert_eq!(DateRange::new(d(2026, 2, 27), d(2026, 3, 2)).days(), 4);
    }

    #[test]
    fn range_overlap_is_inclusive() {
        let a = DateRange::new(d(2026, 3, 1), d(2026, 3, 5));
        let touching = DateRange::new(d(2026, 3, 5), d(2026, 3, 9));
        let adjacent = DateRange::new(d(2026, 3, 6), d(2026, 3, 9));
        assert!(a.overlaps(&touching));
        assert!(touching.overlaps(&a));
        assert!(!a.overlaps(&adjacent)); // next day is free
        assert!(a.contains(d(2026, 3, 5)));
        assert!(!a.contains(d(2026, 3, 6)));
    }

    #[test]
    fn transition_table() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Declined));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Active));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Completed));

        assert!(!Confirmed.can_transition_to(Confirmed));
        assert!(!Active.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Pending));
        for terminal in [Completed, Declined, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.blocks_dates());
            for target in [Pending, Confirmed, Active, Completed, Declined, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn patch_never_clears_confirmation_timestamps() {
        let now = Utc::now();
        let mut r = Reservation {
            id: Ulid::new(),
            tool_id: Ulid::new(),
            borrower_id: Ulid::new(),
            status: ReservationStatus::Active,
            start_date: d(2026, 3, 1),
            end_date: d(2026, 3, 2),
            note: None,
            owner_note: None,
            cancel_reason: None,
            cancelled_by: None,
            pickup_confirmed_at: Some(now),
            return_confirmed_at: None,
            created_at: now,
            updated_at: now,
        };
        let later = now + chrono::Duration::hours(3);
        let patch = ReservationPatch {
            pickup_confirmed_at: Some(later),
            return_confirmed_at: Some(later),
            ..ReservationPatch::status(ReservationStatus::Completed, later)
        };
        patch.apply(&mut r);
        assert_eq!(r.pickup_confirmed_at, Some(now));
        assert_eq!(r.return_confirmed_at, Some(later));
        assert_eq!(r.status, ReservationStatus::Completed);
        assert_eq!(r.updated_at, later);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ReservationStatus::Confirmed).unwrap();
        assert_eq!(json, "\"confirmed\"");
        let kind: PhotoKind = serde_json::from_str("\"after\"").unwrap();
        assert_eq!(kind, PhotoKind::After);
    }
}
