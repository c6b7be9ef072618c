//! The restart state machine described in §4.2. Kept free of I/O so it
//! can be unit tested directly; `master::mod` drives it from the tick
//! loop and performs the actual spawning/signaling each transition
//! implies.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    /// A restart has been requested; the new child has not been spawned yet.
    Upgrading,
    /// The new child has been spawned and we're waiting for its `ready`.
    Overlapped,
    /// The new child is `ready`; the old child has been told to
    /// terminate and we're waiting for it to go away (or time out).
    Draining,
}

/// Events that can move the restart state machine. Kept separate from
/// the master's full event enum so the transition table below reads as
/// a pure function of (state, event) -> state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartEvent {
    /// `restart_signal` received, fetcher swapped with a restart trigger,
    /// or the child asked for one via `RestartRequest`.
    Trigger,
    /// The master has spawned the new generation's child.
    SpawnedNew,
    /// The new child's `ready` message arrived.
    NewReady,
    /// The new child exited before sending `ready`.
    NewDiedBeforeReady,
    /// The old child has exited and been reaped.
    OldExited,
    /// `terminate_timeout` elapsed while draining.
    DrainTimedOut,
}

/// What the master should *do* as a side effect of a transition, beyond
/// just updating its own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    None,
    /// Coalesce: a restart is already in flight, remember one more is
    /// queued, but don't start a second one now.
    Coalesce,
    SpawnNewGeneration,
    TerminateOldGeneration,
    KillOldGeneration,
    /// The new child died before becoming ready; log it and fall back to
    /// the still-running old child.
    AbortRestart,
}

impl RestartState {
    /// Applies one event, returning the next state and the action the
    /// caller should take.
    pub fn apply(self, event: RestartEvent) -> (RestartState, RestartAction) {
        use RestartAction::*;
        use RestartEvent::*;
        use RestartState::*;

        match (self, event) {
            (Idle, Trigger) => (Upgrading, SpawnNewGeneration),
            (Upgrading, Trigger) | (Overlapped, Trigger) | (Draining, Trigger) => {
                (self, Coalesce)
            }

            (Upgrading, SpawnedNew) => (Overlapped, None),
            (Overlapped, NewReady) => (Draining, TerminateOldGeneration),
            (Upgrading, NewDiedBeforeReady) => (Idle, AbortRestart),
            (Overlapped, NewDiedBeforeReady) => (Idle, AbortRestart),

            (Draining, OldExited) => (Idle, None),
            (Draining, DrainTimedOut) => (Draining, KillOldGeneration),

            // Any other (state, event) pair isn't reachable given how
            // the master drives this machine; treat it as a no-op
            // rather than panicking, since a stray duplicate event
            // (e.g. two OldExited notifications racing a SIGCHLD reap)
            // must never crash the master.
            (state, _) => (state, None),
        }
    }

    /// Whether a restart is currently in flight (anything but `Idle`).
    pub fn in_flight(self) -> bool {
        self != RestartState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RestartAction::*;
    use RestartEvent::*;
    use RestartState::*;

    #[test]
    fn full_happy_path() {
        let mut state = Idle;

        let (next, action) = state.apply(Trigger);
        assert_eq!((next, action), (Upgrading, SpawnNewGeneration));
        state = next;

        let (next, action) = state.apply(SpawnedNew);
        assert_eq!((next, action), (Overlapped, None));
        state = next;

        let (next, action) = state.apply(NewReady);
        assert_eq!((next, action), (Draining, TerminateOldGeneration));
        state = next;

        let (next, action) = state.apply(OldExited);
        assert_eq!((next, action), (Idle, None));
    }

    #[test]
    fn trigger_while_in_flight_coalesces() {
        let state = Upgrading;
        assert_eq!(state.apply(Trigger), (Upgrading, Coalesce));

        let state = Overlapped;
        assert_eq!(state.apply(Trigger), (Overlapped, Coalesce));

        let state = Draining;
        assert_eq!(state.apply(Trigger), (Draining, Coalesce));
    }

    #[test]
    fn new_child_dying_before_ready_aborts_to_idle() {
        let state = Overlapped;
        assert_eq!(
            state.apply(NewDiedBeforeReady),
            (Idle, AbortRestart)
        );
    }

    #[test]
    fn new_child_failing_to_spawn_also_aborts_to_idle() {
        // A non-gen-1 spawn failure delivers `NewDiedBeforeReady` while
        // still in `Upgrading` (the child never got far enough to emit
        // `SpawnedNew`); this must abort the restart exactly like a
        // child that spawned and then died before `ready`, or the
        // machine wedges in `Upgrading` forever.
        let state = Upgrading;
        assert_eq!(
            state.apply(NewDiedBeforeReady),
            (Idle, AbortRestart)
        );
    }

    #[test]
    fn drain_timeout_escalates_to_kill_but_stays_draining() {
        let state = Draining;
        assert_eq!(state.apply(DrainTimedOut), (Draining, KillOldGeneration));
    }

    #[test]
    fn in_flight_is_false_only_when_idle() {
        assert!(!Idle.in_flight());
        assert!(Upgrading.in_flight());
        assert!(Overlapped.in_flight());
        assert!(Draining.in_flight());
    }
}
