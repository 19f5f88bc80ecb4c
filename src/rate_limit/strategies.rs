//! Token-bucket math.
//!
//! Refill is lazy: nothing ticks in the background, the elapsed time since the last
//! refill is converted into whole intervals whenever a decision is made. Partial
//! intervals are never credited and never discarded; `last_refilled_at` only moves
//! forward by whole intervals so the leftover phase carries into the next request.

use crate::clock::{from_nanos, to_nanos};
use crate::rate_limit::codec::BucketState;
use crate::rate_limit::params::BucketParams;
use crate::rate_limit::Decision;

/// Result of the refill step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    pub state: BucketState,
    /// Whole intervals credited.
    pub intervals: u128,
    /// Nanoseconds by which `now` trails `last_refilled_at`, if it does.
    pub clock_behind_nanos: Option<i128>,
}

/// Result of a full decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// State to persist under the request's storage key.
    pub state: BucketState,
    pub clock_behind_nanos: Option<i128>,
}

/// Credit the whole intervals elapsed since `state.last_refilled_at`.
///
/// A `now` earlier than the last refill credits nothing; clock regression never adds
/// or removes tokens.
pub fn refill(params: &BucketParams, state: BucketState) -> Refill {
    let last = to_nanos(state.last_refilled_at);
    let elapsed = to_nanos(params.now) - last;
    if elapsed <= 0 {
        return Refill {
            state,
            intervals: 0,
            clock_behind_nanos: (elapsed < 0).then_some(-elapsed),
        };
    }

    // Validation guarantees an interval of at least one second.
    let interval = params.refill_interval.as_nanos().max(1) as i128;
    let intervals = elapsed / interval;
    let credited = (intervals as u128).saturating_mul(u128::from(params.refill_amount));
    let remaining = (u128::from(state.remaining).saturating_add(credited))
        .min(u128::from(params.capacity)) as u32;
    // last + intervals * interval <= now, so it always fits.
    let last_refilled_at = from_nanos(last + intervals * interval).unwrap_or(params.now);

    Refill {
        state: BucketState { remaining, last_refilled_at, ..state },
        intervals: intervals as u128,
        clock_behind_nanos: None,
    }
}

/// Consume one token if there is one. Always stamps `last_reduced_at`.
pub fn reduce(params: &BucketParams, state: &mut BucketState) -> Decision {
    state.last_reduced_at = params.now;
    if state.remaining == 0 {
        Decision::Denied { remaining: 0 }
    } else {
        state.remaining -= 1;
        Decision::Allowed { remaining: state.remaining }
    }
}

/// Refill then decide. A missing `existing` state starts as a full bucket at `now`.
///
/// Pure and total: no I/O, no clock reads, no failure modes.
pub fn decide(params: &BucketParams, existing: Option<BucketState>) -> Evaluation {
    let Refill { mut state, clock_behind_nanos, .. } = match existing {
        Some(state) => refill(params, state),
        None => Refill {
            state: BucketState::full(params.capacity, params.now),
            intervals: 0,
            clock_behind_nanos: None,
        },
    };
    let decision = reduce(params, &mut state);
    Evaluation { decision, state, clock_behind_nanos }
}
