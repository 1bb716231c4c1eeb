//! Flow control of incremental tag queries.
//!
//! Both functions here are pure. Given the result of one query cycle they
//! decide whether to run the next cycle now, later or never, and where the
//! next cycle starts.

use crate::types::OrderingNr;

/// What a tailing query does after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// Query again immediately; the last page was full.
    Continue,
    /// Wait for the refresh interval, then query again.
    ContinueDelayed,
    /// The query is complete.
    Stop,
}

/// Decides the next step after a cycle returned rows at `offsets`.
///
/// `target` is the upper bound of a current query and `None` for a live one.
/// `max_ordering` is the tracker value the cycle was bounded by.
pub fn next_step(
    target: Option<OrderingNr>,
    batch_size: usize,
    max_ordering: OrderingNr,
    offsets: &[OrderingNr],
) -> FlowControl {
    let has_more = offsets.len() >= batch_size;

    if let Some(target) = target {
        if !has_more && target <= max_ordering {
            return FlowControl::Stop;
        }
        if offsets.iter().any(|offset| *offset >= target) {
            return FlowControl::Stop;
        }
    }

    if has_more {
        FlowControl::Continue
    } else {
        FlowControl::ContinueDelayed
    }
}

/// Cursor for the next cycle. Never lower than `from`.
///
/// An empty cycle skips straight to `max_ordering` since everything up to it
/// is known to be complete.
pub fn advance_cursor(
    from: OrderingNr,
    max_ordering: OrderingNr,
    offsets: &[OrderingNr],
) -> OrderingNr {
    offsets
        .iter()
        .copied()
        .max()
        .map_or_else(|| from.max(max_ordering), |last| from.max(last))
}
