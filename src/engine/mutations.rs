use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::find_conflict;
use super::policy::{clean_text, required_reason, validate_reservation, validate_transition};
use super::{
    observe, tool_label, user_label, Engine, EngineError, NewPhoto, NewReservation, Party,
};

impl Engine {
    /// Borrower requests a tool for `[start_date, end_date]`. Lands in `pending`.
    pub async fn create_reservation(
        &self,
        caller: &str,
        request: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        observe("create_reservation", started, self.do_create(caller, request).await)
    }

    async fn do_create(&self, caller: &str, request: NewReservation) -> Result<Reservation, EngineError> {
        let borrower = self.resolve_caller(caller).await?;
        let tool = self.load_tool(request.tool_id).await?;
        let note = clean_text(request.note, MAX_NOTE_LEN, "note too long")?;
        let range = validate_reservation(
            &tool,
            borrower.id,
            request.start_date,
            request.end_date,
            self.clock.today(),
        )?;

        let _tool_guard = self.lock_tool(tool.id).await;
        self.ensure_dates_free(&tool, range, None).await?;

        let now = self.clock.now();
        let reservation = Reservation {
            id: Ulid::new(),
            tool_id: tool.id,
            borrower_id: borrower.id,
            status: ReservationStatus::Pending,
            start_date: range.start,
            end_date: range.end,
            note,
            owner_note: None,
            cancel_reason: None,
            cancelled_by: None,
            pickup_confirmed_at: None,
            return_confirmed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.collab
            .reservations
            .create_reservation(reservation.clone())
            .await?;
        info!(
            "reservation {} requested: tool {} by {} ({} to {})",
            reservation.id, tool.id, borrower.id, range.start, range.end
        );

        self.dispatch(NotificationRequest {
            user_id: tool.owner_id,
            kind: NotificationKind::ReservationRequested,
            title: "New reservation request".into(),
            message: format!(
                "{} wants to borrow {} from {} to {}",
                user_label(&borrower),
                tool_label(&tool),
                range.start,
                range.end
            ),
            related_id: Some(reservation.id),
        });
        Ok(reservation)
    }

    /// Borrower moves the dates of a still-pending request. Runs the full
    /// policy again and checks conflicts against everything but itself.
    pub async fn reschedule(
        &self,
        caller: &str,
        reservation_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self
            .do_reschedule(caller, reservation_id, start_date, end_date)
            .await;
        observe("reschedule", started, result)
    }

    async fn do_reschedule(
        &self,
        caller: &str,
        reservation_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party != Some(Party::Borrower) {
            return Err(EngineError::NotAuthorized("only the borrower can reschedule"));
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                action: "reschedule",
                current: reservation.status,
            });
        }
        let range = validate_reservation(&tool, user.id, start_date, end_date, self.clock.today())?;

        let _tool_guard = self.lock_tool(tool.id).await;
        self.ensure_dates_free(&tool, range, Some(reservation.id)).await?;

        let patch = ReservationPatch {
            range: Some(range),
            updated_at: Some(self.clock.now()),
            ..ReservationPatch::default()
        };
        let updated = self.commit(&reservation, patch, "reschedule").await?;
        info!("reservation {} rescheduled to {} through {}", updated.id, range.start, range.end);

        self.dispatch(NotificationRequest {
            user_id: tool.owner_id,
            kind: NotificationKind::ReservationRescheduled,
            title: "Reservation dates changed".into(),
            message: format!(
                "{} changed their request for {} to {} through {}",
                user_label(&user),
                tool_label(&tool),
                range.start,
                range.end
            ),
            related_id: Some(updated.id),
        });
        Ok(updated)
    }

    /// Owner accepts a pending request. Conflicts are checked again here: another
    /// request for the same dates may have been approved since this one was made.
    pub async fn approve(&self, caller: &str, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        observe("approve", started, self.do_approve(caller, reservation_id).await)
    }

    async fn do_approve(&self, caller: &str, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party != Some(Party::Owner) {
            return Err(EngineError::NotAuthorized("only the tool owner can approve"));
        }
        validate_transition(reservation.status, ReservationStatus::Confirmed, "approve")?;

        let _tool_guard = self.lock_tool(tool.id).await;
        self.ensure_dates_free(&tool, reservation.range(), Some(reservation.id))
            .await?;

        let patch = ReservationPatch::status(ReservationStatus::Confirmed, self.clock.now());
        let updated = self.commit(&reservation, patch, "approve").await?;
        info!("reservation {} approved", updated.id);

        self.dispatch(NotificationRequest {
            user_id: updated.borrower_id,
            kind: NotificationKind::ReservationApproved,
            title: "Reservation approved".into(),
            message: format!(
                "Your reservation for {} from {} to {} was approved",
                tool_label(&tool),
                updated.start_date,
                updated.end_date
            ),
            related_id: Some(updated.id),
        });
        Ok(updated)
    }

    /// Owner turns down a pending request. The reason is kept as the owner note
    /// and forwarded to the borrower.
    pub async fn decline(
        &self,
        caller: &str,
        reservation_id: Ulid,
        reason: String,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        observe("decline", started, self.do_decline(caller, reservation_id, reason).await)
    }

    async fn do_decline(
        &self,
        caller: &str,
        reservation_id: Ulid,
        reason: String,
    ) -> Result<Reservation, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party != Some(Party::Owner) {
            return Err(EngineError::NotAuthorized("only the tool owner can decline"));
        }
        validate_transition(reservation.status, ReservationStatus::Declined, "decline")?;
        let reason = required_reason(reason)?;

        let patch = ReservationPatch {
            owner_note: Some(reason.clone()),
            ..ReservationPatch::status(ReservationStatus::Declined, self.clock.now())
        };
        let updated = self.commit(&reservation, patch, "decline").await?;
        info!("reservation {} declined", updated.id);

        self.dispatch(NotificationRequest {
            user_id: updated.borrower_id,
            kind: NotificationKind::ReservationDeclined,
            title: "Reservation declined".into(),
            message: format!(
                "Your reservation for {} was declined: {reason}",
                tool_label(&tool)
            ),
            related_id: Some(updated.id),
        });
        Ok(updated)
    }

    /// Either party withdraws a pending or confirmed reservation; the other
    /// party is told.
    pub async fn cancel(
        &self,
        caller: &str,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        observe("cancel", started, self.do_cancel(caller, reservation_id, reason).await)
    }

    async fn do_cancel(
        &self,
        caller: &str,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, tool, party) = self.load_for_party(&user, reservation_id).await?;
        let Some(party) = party else {
            return Err(EngineError::NotAuthorized("only the borrower or the tool owner can cancel"));
        };
        validate_transition(reservation.status, ReservationStatus::Cancelled, "cancel")?;
        let reason = clean_text(reason, MAX_REASON_LEN, "reason too long")?;

        let patch = ReservationPatch {
            cancel_reason: reason.clone(),
            cancelled_by: Some(user.id),
            ..ReservationPatch::status(ReservationStatus::Cancelled, self.clock.now())
        };
        let updated = self.commit(&reservation, patch, "cancel").await?;
        info!("reservation {} cancelled by {:?}", updated.id, party);

        let (recipient, who) = match party {
            Party::Borrower => (tool.owner_id, "The borrower"),
            Party::Owner => (updated.borrower_id, "The owner"),
        };
        let mut message = format!(
            "{who} cancelled the reservation for {} from {} to {}",
            tool_label(&tool),
            updated.start_date,
            updated.end_date
        );
        if let Some(reason) = &reason {
            message.push_str(&format!(": {reason}"));
        }
        self.dispatch(NotificationRequest {
            user_id: recipient,
            kind: NotificationKind::ReservationCancelled,
            title: "Reservation cancelled".into(),
            message,
            related_id: Some(updated.id),
        });
        Ok(updated)
    }

    /// Borrower collects the tool. Needs at least one `before` photo on record.
    pub async fn confirm_pickup(&self, caller: &str, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self
            .do_confirm_handover(caller, reservation_id, Handover::Pickup)
            .await;
        observe("confirm_pickup", started, result)
    }

    /// Borrower hands the tool back. Needs at least one `after` photo on record.
    pub async fn confirm_return(&self, caller: &str, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self
            .do_confirm_handover(caller, reservation_id, Handover::Return)
            .await;
        observe("confirm_return", started, result)
    }

    async fn do_confirm_handover(
        &self,
        caller: &str,
        reservation_id: Ulid,
        handover: Handover,
    ) -> Result<Reservation, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party != Some(Party::Borrower) {
            return Err(EngineError::NotAuthorized(handover.borrower_only()));
        }
        validate_transition(reservation.status, handover.target(), handover.action())?;

        // Read on every call: the gate must see photos added a moment ago.
        let photos = self
            .collab
            .photos
            .list_photos(reservation.id, Some(handover.photo_kind()))
            .await?;
        if photos.is_empty() {
            return Err(EngineError::MissingRequiredPhoto(handover.photo_kind()));
        }

        let now = self.clock.now();
        let mut patch = ReservationPatch::status(handover.target(), now);
        match handover {
            Handover::Pickup => patch.pickup_confirmed_at = Some(now),
            Handover::Return => patch.return_confirmed_at = Some(now),
        }
        let updated = self.commit(&reservation, patch, handover.action()).await?;
        info!("reservation {} is now {}", updated.id, updated.status);

        let (kind, title, verb) = match handover {
            Handover::Pickup => (NotificationKind::PickupConfirmed, "Tool picked up", "picked up"),
            Handover::Return => (NotificationKind::ReturnConfirmed, "Tool returned", "returned"),
        };
        self.dispatch(NotificationRequest {
            user_id: tool.owner_id,
            kind,
            title: title.into(),
            message: format!("{} {verb} {}", user_label(&user), tool_label(&tool)),
            related_id: Some(updated.id),
        });
        Ok(updated)
    }

    /// Record condition evidence. Either party may add photos until the
    /// reservation reaches a terminal state.
    pub async fn record_photo(
        &self,
        caller: &str,
        reservation_id: Ulid,
        photo: NewPhoto,
    ) -> Result<LoanPhoto, EngineError> {
        let started = Instant::now();
        observe("record_photo", started, self.do_record_photo(caller, reservation_id, photo).await)
    }

    async fn do_record_photo(
        &self,
        caller: &str,
        reservation_id: Ulid,
        photo: NewPhoto,
    ) -> Result<LoanPhoto, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, _tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party.is_none() {
            return Err(EngineError::NotAuthorized("only the borrower or the tool owner can add photos"));
        }
        if reservation.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                action: "add photos to",
                current: reservation.status,
            });
        }
        let url = clean_text(Some(photo.url), MAX_URL_LEN, "photo url too long")?
            .ok_or(EngineError::InvalidInput("photo url is required"))?;
        let notes = clean_text(photo.notes, MAX_PHOTO_NOTES_LEN, "photo notes too long")?;

        let record = LoanPhoto {
            id: Ulid::new(),
            reservation_id: reservation.id,
            kind: photo.kind,
            url,
            uploader_id: user.id,
            notes,
            created_at: self.clock.now(),
        };
        self.collab.photos.create_photo(record.clone()).await?;
        debug!("{} photo {} recorded for reservation {}", record.kind, record.id, reservation.id);
        Ok(record)
    }

    /// `DateConflict` if any date-holding reservation on the tool overlaps `range`.
    async fn ensure_dates_free(
        &self,
        tool: &Tool,
        range: DateRange,
        exclude_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let existing = self
            .collab
            .reservations
            .list_reservations_for_tool(tool.id)
            .await?;
        if let Some(conflict) = find_conflict(tool.id, range.start, range.end, &existing, exclude_id) {
            debug!(
                "tool {} dates {} to {} collide with reservation {} ({})",
                tool.id, range.start, range.end, conflict.id, conflict.status
            );
            return Err(EngineError::DateConflict(conflict.id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Handover {
    Pickup,
    Return,
}

impl Handover {
    fn target(self) -> ReservationStatus {
        match self {
            Handover::Pickup => ReservationStatus::Active,
            Handover::Return => ReservationStatus::Completed,
        }
    }

    fn photo_kind(self) -> PhotoKind {
        match self {
            Handover::Pickup => PhotoKind::Before,
            Handover::Return => PhotoKind::After,
        }
    }

    fn action(self) -> &'static str {
        match self {
            Handover::Pickup => "confirm pickup for",
            Handover::Return => "confirm return for",
        }
    }

    fn borrower_only(self) -> &'static str {
        match self {
            Handover::Pickup => "only the borrower can confirm pickup",
            Handover::Return => "only the borrower can confirm return",
        }
    }
}
