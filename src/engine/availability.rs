use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Decide whether a room is free for the desired stay.
///
/// Counts active bookings (Pending, Confirmed, CheckedIn) whose half-open
/// stay overlaps the desired one; the room is available iff that count is
/// zero. Touching boundaries (a checkout on the desired check-in day) do not
/// overlap, so same-day turnover works.
///
/// `exclude` skips one booking id — used when amending a booking so it does
/// not conflict with its own current row.
///
/// An inverted or empty desired range yields `false` (fail closed), never a
/// panic: callers validate ranges, but a raw caller must not be able to
/// sneak past the overlap test with garbage input.
pub fn is_available(rs: &RoomState, desired: &StayRange, exclude: Option<Ulid>) -> bool {
    if desired.check_in >= desired.check_out {
        return false;
    }
    !rs.overlapping(desired)
        .any(|b| b.status.is_active() && Some(b.id) != exclude)
}

/// Active stays inside `window`, clamped to it and sorted by check-in.
fn active_stays_clamped(rs: &RoomState, window: &StayRange) -> Vec<StayRange> {
    let mut stays: Vec<StayRange> = rs
        .overlapping(window)
        .filter(|b| b.status.is_active())
        .map(|b| {
            StayRange::new(
                b.stay.check_in.max(window.check_in),
                b.stay.check_out.min(window.check_out),
            )
        })
        .collect();
    stays.sort_by_key(|s| s.check_in);
    stays
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_overlapping(sorted: &[StayRange]) -> Vec<StayRange> {
    let mut merged: Vec<StayRange> = Vec::new();
    for &stay in sorted {
        if let Some(last) = merged.last_mut()
            && stay.check_in <= last.check_out
        {
            last.check_out = last.check_out.max(stay.check_out);
            continue;
        }
        merged.push(stay);
    }
    merged
}

/// The free gaps of a room inside a query window: the window minus every
/// active booking. Used by the reporting/console surface.
pub fn free_ranges(rs: &RoomState, window: &StayRange) -> Vec<StayRange> {
    if window.check_in >= window.check_out {
        return Vec::new();
    }
    let occupied = merge_overlapping(&active_stays_clamped(rs, window));

    let mut free = Vec::new();
    let mut cursor = window.check_in;
    for occ in &occupied {
        if occ.check_in > cursor {
            free.push(StayRange::new(cursor, occ.check_in));
        }
        cursor = cursor.max(occ.check_out);
    }
    if cursor < window.check_out {
        free.push(StayRange::new(cursor, window.check_out));
    }
    free
}
