//! Effect executor: drives a reducer until no actions remain.
//!
//! Each job owns its own reducer state, so the executor runs the
//! `action → reducer → effects → action` feedback loop inline on the caller's
//! task instead of spawning. Effects are still described by the reducer and
//! executed here, which keeps the reducer pure and testable.

use std::collections::VecDeque;
use syncflow_core::effect::Effect;
use syncflow_core::reducer::Reducer;

/// Run `action` through `reducer`, executing effects and feeding produced
/// actions back until the loop settles.
///
/// Returns the number of actions reduced.
pub async fn run_to_completion<R>(
    reducer: &R,
    state: &mut R::State,
    action: R::Action,
    env: &R::Environment,
) -> usize
where
    R: Reducer,
{
    let mut pending = VecDeque::from([action]);
    let mut reduced = 0;

    while let Some(action) = pending.pop_front() {
        reduced += 1;
        for effect in reducer.reduce(state, action, env) {
            match effect {
                Effect::None => {},
                Effect::Future(fut) => {
                    tracing::trace!("Executing Effect::Future");
                    pending.extend(fut.await);
                },
            }
        }
    }

    reduced
}
