use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_COMMENT_LEN;
use crate::model::*;
use crate::observability::SIDE_EFFECT_FAILURES_TOTAL;

use super::policy::{clean_text, validate_rating};
use super::{observe, tool_label, user_label, Engine, EngineError, NewReview, Party};

/// Mean rating rounded to one decimal place; 0 when there are no ratings.
pub fn calculate_reputation_score(ratings: impl IntoIterator<Item = u8>) -> f64 {
    let (sum, count) = ratings
        .into_iter()
        .fold((0u64, 0u64), |(sum, count), r| (sum + u64::from(r), count + 1));
    if count == 0 {
        return 0.0;
    }
    // Integer arithmetic keeps the result independent of summation order.
    let tenths = (sum * 100 / count + 5) / 10;
    tenths as f64 / 10.0
}

impl Engine {
    /// One party reviews the other after a completed loan. The reviewee is
    /// always the counterparty of the caller.
    pub async fn create_review(
        &self,
        caller: &str,
        reservation_id: Ulid,
        review: NewReview,
    ) -> Result<Review, EngineError> {
        let started = Instant::now();
        observe("create_review", started, self.do_create_review(caller, reservation_id, review).await)
    }

    async fn do_create_review(
        &self,
        caller: &str,
        reservation_id: Ulid,
        review: NewReview,
    ) -> Result<Review, EngineError> {
        let reviewer = self.resolve_caller(caller).await?;
        let (reservation, tool, party) = self.load_for_party(&reviewer, reservation_id).await?;
        let reviewee_id = match party {
            Some(Party::Borrower) => tool.owner_id,
            Some(Party::Owner) => reservation.borrower_id,
            None => {
                return Err(EngineError::NotAuthorized(
                    "only the borrower or the tool owner can review",
                ));
            }
        };
        if reservation.status != ReservationStatus::Completed {
            return Err(EngineError::InvalidStateTransition {
                action: "review",
                current: reservation.status,
            });
        }
        let rating = validate_rating(review.rating)?;
        let comment = clean_text(review.comment, MAX_COMMENT_LEN, "comment too long")?;

        if self
            .collab
            .reviews
            .get_review_for(reservation.id, reviewer.id)
            .await?
            .is_some()
        {
            return Err(EngineError::DuplicateReview);
        }

        let record = Review {
            id: Ulid::new(),
            reservation_id: reservation.id,
            reviewer_id: reviewer.id,
            reviewee_id,
            rating,
            comment,
            created_at: self.clock.now(),
        };
        // The store enforces uniqueness too; a concurrent duplicate loses here.
        self.collab.reviews.create_review(record.clone()).await?;
        info!("review {} recorded for reservation {}", record.id, reservation.id);

        self.recompute_reputation(reviewee_id).await;
        self.dispatch(NotificationRequest {
            user_id: reviewee_id,
            kind: NotificationKind::ReviewReceived,
            title: "New review".into(),
            message: format!(
                "{} left you a {rating}-star review for {}",
                user_label(&reviewer),
                tool_label(&tool)
            ),
            related_id: Some(reservation.id),
        });
        Ok(record)
    }

    /// Refresh a user's aggregate score from every review addressed to them.
    /// Failures are logged; the review itself stands.
    pub async fn recompute_reputation(&self, user_id: Ulid) {
        let _guard = self.lock_reputation(user_id).await;
        let reviews = match self.collab.reviews.list_reviews_for(user_id).await {
            Ok(reviews) => reviews,
            Err(e) => {
                warn!("reputation recompute for {user_id} skipped: {e}");
                metrics::counter!(SIDE_EFFECT_FAILURES_TOTAL, "effect" => "reputation").increment(1);
                return;
            }
        };
        let score = calculate_reputation_score(reviews.iter().map(|r| r.rating));
        if let Err(e) = self
            .collab
            .reputation
            .set_reputation_score(user_id, score)
            .await
        {
            warn!("storing reputation {score} for {user_id} failed: {e}");
            metrics::counter!(SIDE_EFFECT_FAILURES_TOTAL, "effect" => "reputation").increment(1);
        }
    }
}
