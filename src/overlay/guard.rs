// One-shot initialization latch with reset semantics.
//
// Both the per-network sandbox bring-up and the per-subnet device bring-up
// must run at most once per join epoch, and every concurrent joiner has to
// observe the same outcome. The latch stores the initializer's result; reset
// rearms it and may only be called by the leave path while it holds the
// network lock at a join count of zero.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::overlay::error::OverlayResult;

#[derive(Debug)]
enum GuardState {
    Idle,
    Running,
    Done(OverlayResult<()>),
}

/// A resettable once-latch for sandbox initialization.
#[derive(Debug)]
pub(crate) struct InitGuard {
    state: Mutex<GuardState>,
    done: Notify,
}

impl InitGuard {
    pub(crate) fn new() -> Self {
        InitGuard {
            state: Mutex::new(GuardState::Idle),
            done: Notify::new(),
        }
    }

    /// Run `init` if no caller has run it since the last reset; otherwise wait
    /// for the in-flight run and return its stored outcome.
    pub(crate) async fn run_once<F, Fut>(&self, init: F) -> OverlayResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OverlayResult<()>>,
    {
        enum Step {
            Return(OverlayResult<()>),
            Wait,
            Init,
        }

        loop {
            let mut notified = Box::pin(self.done.notified());
            let step = {
                let mut state = self.state.lock();
                match &*state {
                    GuardState::Done(outcome) => Step::Return(outcome.clone()),
                    GuardState::Idle => {
                        *state = GuardState::Running;
                        Step::Init
                    }
                    GuardState::Running => {
                        // Register for the wakeup before releasing the lock so
                        // a finishing initializer cannot slip past us.
                        notified.as_mut().enable();
                        Step::Wait
                    }
                }
            };

            match step {
                Step::Return(outcome) => return outcome,
                Step::Wait => {
                    notified.await;
                    continue;
                }
                Step::Init => {}
            }

            // We won the race and are the single initializer.
            let outcome = init().await;
            *self.state.lock() = GuardState::Done(outcome.clone());
            self.done.notify_waiters();
            return outcome;
        }
    }

    /// Rearm the latch. Caller must hold the network lock with joinCnt == 0,
    /// which guarantees no initializer is in flight.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        debug_assert!(
            !matches!(*state, GuardState::Running),
            "guard reset while an initializer is running"
        );
        *state = GuardState::Idle;
    }
}
