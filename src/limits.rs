//! Hard limits on free-text fields and per-entity collections.

/// Borrower note attached to a reservation request.
pub const MAX_NOTE_LEN: usize = 2_000;

/// Decline / cancel reason.
pub const MAX_REASON_LEN: usize = 1_000;

/// Review comment.
pub const MAX_COMMENT_LEN: usize = 4_000;

/// Stored photo reference.
pub const MAX_URL_LEN: usize = 2_048;

/// Notes attached to a loan photo.
pub const MAX_PHOTO_NOTES_LEN: usize = 1_000;

/// Photos recorded against a single reservation.
pub const MAX_PHOTOS_PER_RESERVATION: usize = 64;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Notifications retained per user inbox; oldest are dropped first.
pub const MAX_INBOX_LEN: usize = 500;

/// Largest single WAL record. Bigger length prefixes on replay are treated
/// as corruption.
pub const MAX_WAL_RECORD_LEN: usize = 1024 * 1024;
