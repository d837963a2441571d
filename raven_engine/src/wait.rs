//! Cooperative blocking waits.
//!
//! Scripts may block on host-side conditions (currently the yes/no prompt).
//! The wait is a busy-poll loop that yields exactly one host frame per
//! iteration and honours the host's termination predicate as cancellation.
//! Cancellation wins over completion: once the predicate reports true the
//! completion check is never consulted again.

use crate::diag;
use crate::host::HostApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    Cancelled,
}

/// Core wait loop: cancellation first, then completion, then one yielded
/// frame.
pub(crate) fn run_wait<T>(
    mut terminating: impl FnMut() -> bool,
    mut poll: impl FnMut() -> Option<T>,
    mut advance: impl FnMut(),
) -> WaitOutcome<T> {
    loop {
        if terminating() {
            return WaitOutcome::Cancelled;
        }
        if let Some(value) = poll() {
            return WaitOutcome::Ready(value);
        }
        advance();
    }
}

/// Block until the player answers the open yes/no prompt. Cancellation is
/// reported as `Cancelled` ("no answer"), never as an error.
pub fn wait_yes_no(api: &HostApi, quest: &str) -> WaitOutcome<bool> {
    let (Some(poll_prompt), Some(advance_frame)) = (api.poll_prompt, api.advance_frame) else {
        diag!("quest '{quest}': prompt bindings unavailable; treating the wait as cancelled");
        return WaitOutcome::Cancelled;
    };
    let terminating = api.thread_terminating;
    run_wait(
        move || terminating.map(|f| unsafe { f() != 0 }).unwrap_or(false),
        move || match unsafe { poll_prompt() } {
            -1 => None,
            0 => Some(false),
            _ => Some(true),
        },
        move || unsafe { advance_frame() },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn ready_value_passes_through() {
        let polls = Cell::new(0);
        let outcome = run_wait(
            || false,
            || {
                polls.set(polls.get() + 1);
                (polls.get() == 3).then_some("done")
            },
            || {},
        );
        assert_eq!(outcome, WaitOutcome::Ready("done"));
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn cancellation_stops_within_one_yield_and_skips_the_poll() {
        let frames = Cell::new(0);
        let polls = Cell::new(0);
        let outcome: WaitOutcome<()> = run_wait(
            || frames.get() >= 3,
            || {
                polls.set(polls.get() + 1);
                None
            },
            || frames.set(frames.get() + 1),
        );
        assert_eq!(outcome, WaitOutcome::Cancelled);
        // Three polled iterations, then the predicate fires before the
        // fourth poll would run.
        assert_eq!(polls.get(), 3);
        assert_eq!(frames.get(), 3);
    }

    #[test]
    fn cancellation_beats_a_simultaneously_ready_condition() {
        let outcome: WaitOutcome<bool> = run_wait(|| true, || Some(true), || {});
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[test]
    fn missing_prompt_bindings_degrade_to_cancelled() {
        let api = crate::host::HostApi::unresolved();
        assert_eq!(wait_yes_no(&api, "embers"), WaitOutcome::Cancelled);
    }

    #[test]
    fn prompt_answers_map_onto_yes_and_no() {
        use std::sync::atomic::{AtomicI32, Ordering};
        static ANSWER: AtomicI32 = AtomicI32::new(-1);
        unsafe extern "C" fn poll() -> i32 {
            ANSWER.load(Ordering::Relaxed)
        }
        unsafe extern "C" fn advance() {
            // One frame later the player answers "no".
            ANSWER.store(0, Ordering::Relaxed);
        }
        let mut api = crate::host::HostApi::unresolved();
        api.poll_prompt = Some(poll);
        api.advance_frame = Some(advance);
        ANSWER.store(-1, Ordering::Relaxed);
        assert_eq!(wait_yes_no(&api, "embers"), WaitOutcome::Ready(false));
        ANSWER.store(1, Ordering::Relaxed);
        assert_eq!(wait_yes_no(&api, "embers"), WaitOutcome::Ready(true));
    }
}
