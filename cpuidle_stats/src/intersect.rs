//! Intersection of idle intervals.
//!
//! A core is idle when all its hardware threads are idle at the same time, and
//! a cluster is idle when all its cores are. Both are computed by intersecting
//! the interval lists of the children, state by state.

use std::collections::TryReserveError;
use std::convert::Infallible;

use log::debug;

use crate::stats::{CstateTable, Interval, StateStats};

/// Overlap of two intervals, if it is not empty.
fn overlap(a: &Interval, b: &Interval) -> Option<Interval> {
    Interval::closed(a.begin.max(b.begin), a.end.min(b.end))
}

/// Walks two sorted, internally disjoint interval lists and passes every
/// non-empty overlap to `emit`, in chronological order.
fn sweep<E>(a: &[Interval], b: &[Interval], mut emit: impl FnMut(&Interval, &Interval, Interval) -> Result<(), E>) -> Result<(), E> {
    // lower bound in `b` for the next interval of `a`, never moves backward
    let mut index = 0;

    for x in a {
        for (j, y) in b.iter().enumerate().skip(index) {
            // intervals are ordered, nothing further in `b` can overlap `x`
            if x.end < y.begin {
                break;
            }

            // `y` ends before `x`, hence before everything after `x` too
            if x.begin > y.end {
                index = j;
            }

            if let Some(o) = overlap(x, y) {
                emit(x, y, o)?;
            }
        }
    }
    Ok(())
}

/// Returns the sorted list of the non-empty overlaps between `a` and `b`.
///
/// Both inputs must be sorted by `begin` and free of overlaps, which is always
/// the case for the intervals of a single CPU.
pub fn intersect(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let mut result = Vec::new();
    let swept = sweep(a, b, |_, _, o| {
        result.push(o);
        Ok::<(), Infallible>(())
    });
    match swept {
        Ok(()) => result,
        Err(never) => match never {},
    }
}

/// Folds [`intersect`] over all the lists, left to right.
pub fn intersect_many(lists: &[&[Interval]]) -> Vec<Interval> {
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    let mut acc = first.to_vec();
    for list in rest {
        if acc.is_empty() {
            break;
        }
        acc = intersect(&acc, list);
    }
    acc
}

/// Intersects the intervals of two states, computing the statistics of the
/// overlaps as they are found.
pub fn intersect_states(a: &StateStats, b: &StateStats) -> Result<StateStats, TryReserveError> {
    let mut result = StateStats::new(a.name.clone());
    sweep(&a.intervals, &b.intervals, |x, y, o| {
        debug!(
            "Intersect [{}: {:.6}-{:.6}] with [{}: {:.6}-{:.6}] => {:.6}-{:.6} (+{:.6})",
            a.name, x.begin, x.end, b.name, y.begin, y.end, o.begin, o.end, o.duration_us
        );
        result.push(o)
    })?;
    Ok(result)
}

/// Intersects one state across several children. The name of the result is
/// taken from the first child.
fn intersect_all_states(states: &[&StateStats]) -> Result<StateStats, TryReserveError> {
    let Some((first, rest)) = states.split_first() else {
        return Ok(StateStats::new(String::new()));
    };
    let mut acc = (*first).clone();
    for state in rest {
        if acc.intervals.is_empty() {
            break;
        }
        acc = intersect_states(&acc, state)?;
    }
    Ok(acc)
}

/// Builds the idle states of a parent node from the tables of its children.
///
/// Every state index up to the highest `state_max` of the children is
/// computed. If a child never entered a state, the parent never was in that
/// state either, and the result is empty (but still named after the first
/// child that has the state).
pub fn merge_tables(children: &[&CstateTable]) -> Result<CstateTable, TryReserveError> {
    let mut merged = CstateTable::default();
    let Some(state_max) = children.iter().filter_map(|c| c.state_max()).max() else {
        return Ok(merged);
    };

    for id in 0..=state_max {
        let Some(name) = children.iter().find_map(|c| c.get(id)).map(|s| s.name.clone()) else {
            // no child knows this state
            continue;
        };

        let states: Option<Vec<&StateStats>> = children.iter().map(|c| c.get(id)).collect();
        let mut state = match states {
            Some(states) => intersect_all_states(&states)?,
            None => StateStats::new(String::new()),
        };
        state.name = name;
        merged.insert(id, state);
    }
    Ok(merged)
}
