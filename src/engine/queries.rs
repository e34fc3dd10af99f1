use ulid::Ulid;

use crate::model::*;

use super::conflict::booked_ranges;
use super::{Engine, EngineError};

impl Engine {
    /// Visible to the borrower and the tool owner only.
    pub async fn get_reservation(&self, caller: &str, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, _tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party.is_none() {
            return Err(EngineError::NotAuthorized("not a party to this reservation"));
        }
        Ok(reservation)
    }

    /// Every reservation on a tool, for its owner.
    pub async fn list_reservations_for_tool(
        &self,
        caller: &str,
        tool_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let tool = self.load_tool(tool_id).await?;
        if tool.owner_id != user.id {
            return Err(EngineError::NotAuthorized("only the tool owner can list its reservations"));
        }
        Ok(self
            .collab
            .reservations
            .list_reservations_for_tool(tool_id)
            .await?)
    }

    /// Reservations the caller made as a borrower.
    pub async fn list_my_reservations(&self, caller: &str) -> Result<Vec<Reservation>, EngineError> {
        let user = self.resolve_caller(caller).await?;
        Ok(self
            .collab
            .reservations
            .list_reservations_for_borrower(user.id)
            .await?)
    }

    /// Date ranges a tool is already held for. Any caller may ask.
    pub async fn booked_ranges(&self, caller: &str, tool_id: Ulid) -> Result<Vec<DateRange>, EngineError> {
        self.resolve_caller(caller).await?;
        let tool = self.load_tool(tool_id).await?;
        let existing = self
            .collab
            .reservations
            .list_reservations_for_tool(tool.id)
            .await?;
        Ok(booked_ranges(tool.id, &existing))
    }

    pub async fn list_photos(
        &self,
        caller: &str,
        reservation_id: Ulid,
        kind: Option<PhotoKind>,
    ) -> Result<Vec<LoanPhoto>, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let (reservation, _tool, party) = self.load_for_party(&user, reservation_id).await?;
        if party.is_none() {
            return Err(EngineError::NotAuthorized("not a party to this reservation"));
        }
        Ok(self.collab.photos.list_photos(reservation.id, kind).await?)
    }

    /// Public: reviews addressed to a user.
    pub async fn list_reviews_for(&self, caller: &str, user_id: Ulid) -> Result<Vec<Review>, EngineError> {
        self.resolve_caller(caller).await?;
        Ok(self.collab.reviews.list_reviews_for(user_id).await?)
    }

    /// Stored aggregate score; 0 for users nobody has reviewed yet.
    pub async fn reputation_of(&self, caller: &str, user_id: Ulid) -> Result<f64, EngineError> {
        self.resolve_caller(caller).await?;
        Ok(self
            .collab
            .reputation
            .reputation_score(user_id)
            .await?
            .unwrap_or(0.0))
    }
}
