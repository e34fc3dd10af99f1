use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// First reservation on `tool_id` that holds dates overlapping `[start, end]`.
///
/// Only pending, confirmed and active reservations hold dates. Ranges are
/// inclusive, so sharing a boundary day is a conflict. `exclude_id` skips the
/// reservation being re-validated.
pub fn find_conflict<'a>(
    tool_id: Ulid,
    start: NaiveDate,
    end: NaiveDate,
    existing: impl IntoIterator<Item = &'a Reservation>,
    exclude_id: Option<Ulid>,
) -> Option<&'a Reservation> {
    let candidate = DateRange { start, end };
    existing.into_iter().find(|r| {
        r.tool_id == tool_id
            && Some(r.id) != exclude_id
            && r.status.blocks_dates()
            && r.range().overlaps(&candidate)
    })
}

pub fn has_conflict<'a>(
    tool_id: Ulid,
    start: NaiveDate,
    end: NaiveDate,
    existing: impl IntoIterator<Item = &'a Reservation>,
    exclude_id: Option<Ulid>,
) -> bool {
    find_conflict(tool_id, start, end, existing, exclude_id).is_some()
}

/// Date ranges currently held on a tool, merged and sorted.
pub fn booked_ranges<'a>(
    tool_id: Ulid,
    existing: impl IntoIterator<Item = &'a Reservation>,
) -> Vec<DateRange> {
    let mut ranges: Vec<DateRange> = existing
        .into_iter()
        .filter(|r| r.tool_id == tool_id && r.status.blocks_dates())
        .map(Reservation::range)
        .collect();
    ranges.sort_by_key(|r| r.start);

    let mut merged: Vec<DateRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            // Touching or next-day ranges form one continuous block.
            Some(last) if range.start <= last.end.succ_opt().unwrap_or(last.end) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}
