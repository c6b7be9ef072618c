//! The supervisor itself: binds listeners, spawns children, runs the
//! restart state machine, and is transparent to whatever process manager
//! is watching its own PID.

mod child;
pub mod restart;
mod signals;

use std::process::ExitStatus;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use relaunch_protocol::Message;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{fetch_and_swap, SwapOutcome};
use crate::listener::ListenerSet;
use crate::logging;
use child::{ChildRecord, ChildState};
use restart::{RestartAction, RestartEvent, RestartState};

/// How often the tick loop wakes even with nothing in its event queue,
/// so that timeouts (terminate-timeout, fetch polling) are re-checked
/// promptly instead of only when some other event happens to arrive.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded grace period a child gets to exit on its own after the
/// master forwards `SIGTERM`/`SIGINT`, before the master escalates to
/// `SIGKILL` and exits anyway. Not user-tunable -- `terminate_timeout`
/// is the one configurable deadline per §5; this is one of the
/// "sensible internal defaults" for everything else.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

enum Event {
    Signal(Signal),
    ChildMessage { generation: u64, msg: Message },
    ChildChannelClosed { generation: u64 },
    ChildExited { generation: u64, status: std::io::Result<ExitStatus> },
    FetchOutcome(Result<SwapOutcome>),
}

/// Runs the master supervisor to completion. Returns the exit code the
/// host `main` should pass to `std::process::exit`: either the status
/// it forwards from an unexpectedly-exited child, or 0 after a clean
/// shutdown via `SIGTERM`/`SIGINT`.
pub fn run(mut config: Config) -> Result<i32> {
    logging::init_if_unset(config.debug);

    let binary_path = crate::config::current_binary_path().map_err(Error::Io)?;
    let listeners = ListenerSet::bind(&config.addresses)?;

    if listeners.is_empty() && config.fetcher.is_none() {
        log::warn!(
            "no addresses configured and no fetcher set; this supervisor will only mirror its child's exit code"
        );
    }

    let (events_tx, events_rx) = mpsc::channel::<Event>();

    signals::install(signal_bridge(events_tx.clone()))?;

    let fetcher = config.fetcher.take();
    if let Some(mut fetcher) = fetcher {
        let binary_path = binary_path.clone();
        let pre_upgrade_check = config.pre_upgrade_check.clone();
        let events_tx = events_tx.clone();
        std::thread::Builder::new()
            .name("relaunch-fetcher".into())
            .spawn(move || loop {
                let outcome =
                    fetch_and_swap(&binary_path, fetcher.as_mut(), pre_upgrade_check.as_ref());
                let interval = fetcher.poll_interval();
                let _ = events_tx.send(Event::FetchOutcome(outcome));
                std::thread::sleep(interval);
            })
            .map_err(Error::Io)?;
    }

    let mut master = MasterState {
        config,
        binary_path,
        listeners,
        next_generation: 1,
        active: None,
        incoming: None,
        draining: None,
        restart_state: RestartState::Idle,
        restart_pending: false,
        events_tx,
        shutting_down: false,
        shutdown_deadline: None,
    };

    master.spawn_generation()?;

    master.run_loop(events_rx)
}

/// Adapts a `Sender<Event>` into the plain `Sender<Signal>` the signal
/// reader thread speaks, without that module needing to know about
/// `Event`.
fn signal_bridge(events_tx: Sender<Event>) -> Sender<Signal> {
    let (tx, rx) = mpsc::channel::<Signal>();
    std::thread::spawn(move || {
        while let Ok(sig) = rx.recv() {
            if events_tx.send(Event::Signal(sig)).is_err() {
                break;
            }
        }
    });
    tx
}

struct MasterState {
    config: Config,
    binary_path: std::path::PathBuf,
    listeners: ListenerSet,
    next_generation: u64,
    /// The generation currently serving traffic (holds the listener FDs
    /// everyone treats as "live").
    active: Option<ChildRecord>,
    /// The not-yet-ready replacement spawned during `upgrading`/`overlapped`.
    incoming: Option<ChildRecord>,
    /// The just-replaced generation, draining during the overlap window.
    draining: Option<(ChildRecord, Instant)>,
    restart_state: RestartState,
    /// A second trigger arrived while a restart was already in flight.
    restart_pending: bool,
    events_tx: Sender<Event>,
    shutting_down: bool,
    /// Set when a `SIGTERM`/`SIGINT` shutdown is waiting on a child to
    /// exit on its own; once it elapses the master escalates to
    /// `SIGKILL` rather than hanging indefinitely on an unresponsive
    /// child.
    shutdown_deadline: Option<Instant>,
}

impl MasterState {
    fn run_loop(mut self, events_rx: Receiver<Event>) -> Result<i32> {
        loop {
            let event = match events_rx.recv_timeout(TICK_INTERVAL) {
                Ok(event) => Some(event),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Bootstrap("event channel disconnected".into()))
                }
            };

            if let Some(event) = event {
                if let Some(exit_code) = self.handle_event(event)? {
                    return Ok(exit_code);
                }
            }

            if let Some(exit_code) = self.check_drain_timeout()? {
                return Ok(exit_code);
            }

            if let Some(exit_code) = self.check_shutdown_timeout()? {
                return Ok(exit_code);
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<Option<i32>> {
        match event {
            Event::Signal(sig) => self.handle_signal(sig),
            Event::ChildMessage { generation, msg } => self.handle_child_message(generation, msg),
            Event::ChildChannelClosed { generation } => {
                log::debug!("[gen {}] control channel closed", generation);
                Ok(None)
            }
            Event::ChildExited { generation, status } => {
                self.handle_child_exited(generation, status)
            }
            Event::FetchOutcome(outcome) => {
                self.handle_fetch_outcome(outcome);
                Ok(None)
            }
        }
    }

    /// The generation that should currently be receiving forwarded
    /// signals: the incoming one if it exists (it's further along than
    /// whatever is draining), else the active one.
    fn front_child(&self) -> Option<&ChildRecord> {
        self.incoming.as_ref().or(self.active.as_ref())
    }

    fn handle_signal(&mut self, sig: Signal) -> Result<Option<i32>> {
        if sig == Signal::SIGCHLD {
            // Reaping happens via the per-child wait thread; nothing to
            // do here beyond having woken the loop.
            return Ok(None);
        }

        if sig == self.config.restart_signal {
            self.trigger_restart();
            return Ok(None);
        }

        if sig == Signal::SIGTERM || sig == Signal::SIGINT {
            return self.begin_shutdown();
        }

        if let Some(child) = self.front_child() {
            if let Err(err) = child::send_signal(child.pid, sig) {
                log::warn!("failed to forward {:?} to active child: {}", sig, err);
            }
        }
        Ok(None)
    }

    fn begin_shutdown(&mut self) -> Result<Option<i32>> {
        self.shutting_down = true;
        let mut any_live = false;
        for child in [self.incoming.as_mut(), self.active.as_mut()]
            .into_iter()
            .flatten()
        {
            log::info!("[gen {}] forwarding shutdown", child.generation);
            let _ = child.channel.send(Message::Terminate);
            any_live = true;
        }
        if !any_live {
            return Ok(Some(0));
        }
        self.shutdown_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
        Ok(None)
    }

    fn handle_child_message(&mut self, generation: u64, msg: Message) -> Result<Option<i32>> {
        match msg {
            Message::Ready => {
                let is_incoming = self
                    .incoming
                    .as_ref()
                    .map(|c| c.generation == generation)
                    .unwrap_or(false);
                if is_incoming {
                    if let Some(child) = &mut self.incoming {
                        child.state = ChildState::Ready;
                    }
                    log::info!("{}", logging::preamble(generation, "ready"));
                    let (next, action) = self.restart_state.apply(RestartEvent::NewReady);
                    self.restart_state = next;
                    self.apply_restart_action(action)?;
                } else if generation == 1 {
                    // The very first generation has no predecessor to
                    // drain; `ready` here is purely informational.
                    log::info!("{}", logging::preamble(generation, "ready"));
                }
            }
            Message::RestartRequest => {
                log::info!("[gen {}] requested a restart", generation);
                self.trigger_restart();
            }
            Message::Terminated => {
                log::info!("[gen {}] reported clean termination", generation);
            }
            Message::Terminate => {
                log::warn!(
                    "[gen {}] sent master-only message {:?}, ignoring",
                    generation,
                    msg
                );
            }
            Message::Unknown(kind) => {
                log::warn!("[gen {}] sent unknown message kind {}", generation, kind);
            }
        }
        Ok(None)
    }

    fn handle_child_exited(
        &mut self,
        generation: u64,
        status: std::io::Result<ExitStatus>,
    ) -> Result<Option<i32>> {
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                log::error!("[gen {}] failed to reap child: {}", generation, err);
                return Ok(None);
            }
        };

        if let Some((draining, _)) = &self.draining {
            if draining.generation == generation {
                log::info!(
                    "{}",
                    logging::preamble(generation, "old generation exited, drain complete")
                );
                self.draining = None;
                let (next, action) = self.restart_state.apply(RestartEvent::OldExited);
                self.restart_state = next;
                self.apply_restart_action(action)?;
                self.maybe_start_pending_restart();
                return Ok(None);
            }
        }

        let was_incoming = self
            .incoming
            .as_ref()
            .map(|c| c.generation == generation)
            .unwrap_or(false);
        if was_incoming {
            self.incoming = None;
            log::warn!(
                "{}",
                logging::preamble_alarm(
                    generation,
                    "new generation died before becoming ready, aborting restart"
                )
            );
            let (next, action) = self.restart_state.apply(RestartEvent::NewDiedBeforeReady);
            self.restart_state = next;
            self.apply_restart_action(action)?;
            return Ok(None);
        }

        let was_active = self
            .active
            .as_ref()
            .map(|c| c.generation == generation)
            .unwrap_or(false);
        if was_active {
            self.active = None;

            if self.shutting_down {
                return Ok(Some(status_to_code(status)));
            }

            log::warn!(
                "{}",
                logging::preamble_alarm(generation, &format!("exited unexpectedly with {:?}", status))
            );
            return Ok(Some(status_to_code(status)));
        }

        log::debug!(
            "[gen {}] exit event for unknown/already-handled child",
            generation
        );
        Ok(None)
    }

    fn handle_fetch_outcome(&mut self, outcome: Result<SwapOutcome>) {
        match outcome {
            Ok(SwapOutcome::NoChange) => {}
            Ok(SwapOutcome::Rejected) => {
                log::warn!("fetched candidate rejected during validation");
            }
            Ok(SwapOutcome::Swapped { hash }) => {
                log::info!("binary swapped on disk, new sha256 {}", hash);
                if !self.config.no_restart_after_fetch {
                    self.trigger_restart();
                }
            }
            Err(err) => {
                log::warn!("fetch-and-swap attempt failed: {}", err);
            }
        }
    }

    fn trigger_restart(&mut self) {
        let (next, action) = self.restart_state.apply(RestartEvent::Trigger);
        self.restart_state = next;
        match action {
            RestartAction::Coalesce => {
                self.restart_pending = true;
                log::debug!("restart trigger coalesced into in-flight restart");
            }
            other => {
                if let Err(err) = self.apply_restart_action(other) {
                    log::error!("failed to act on restart trigger: {}", err);
                }
            }
        }
    }

    fn apply_restart_action(&mut self, action: RestartAction) -> Result<()> {
        match action {
            RestartAction::None | RestartAction::Coalesce => Ok(()),
            RestartAction::SpawnNewGeneration => self.spawn_generation(),
            RestartAction::TerminateOldGeneration => {
                if let Some(mut old) = self.active.take() {
                    old.state = ChildState::Terminating;
                    let _ = old.channel.send(Message::Terminate);
                    log::info!(
                        "{}",
                        logging::preamble(old.generation, "sent terminate, draining")
                    );
                    self.draining = Some((old, Instant::now()));
                }
                // The incoming generation is now the one serving traffic.
                self.active = self.incoming.take();
                Ok(())
            }
            RestartAction::KillOldGeneration => {
                if let Some((child, _)) = &self.draining {
                    log::warn!(
                        "{}",
                        logging::preamble_alarm(
                            child.generation,
                            "terminate_timeout elapsed, sending SIGKILL"
                        )
                    );
                    let _ = child::send_signal(child.pid, Signal::SIGKILL);
                }
                Ok(())
            }
            RestartAction::AbortRestart => {
                self.maybe_start_pending_restart();
                Ok(())
            }
        }
    }

    fn check_drain_timeout(&mut self) -> Result<Option<i32>> {
        if let Some((_, started)) = &self.draining {
            if started.elapsed() >= self.config.terminate_timeout {
                let (next, action) = self.restart_state.apply(RestartEvent::DrainTimedOut);
                self.restart_state = next;
                self.apply_restart_action(action)?;
            }
        }
        Ok(None)
    }

    /// Escalates a `SIGTERM`/`SIGINT` shutdown to `SIGKILL` once
    /// `SHUTDOWN_GRACE` elapses without the child exiting on its own, per
    /// §4.2's "wait ... within a bounded grace period, then exit." The
    /// actual exit code is produced once the kill is reaped and reported
    /// through the ordinary `ChildExited` path; this only unwedges a
    /// child that ignores `Terminate`.
    fn check_shutdown_timeout(&mut self) -> Result<Option<i32>> {
        let elapsed = self
            .shutdown_deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);
        if !elapsed {
            return Ok(None);
        }
        self.shutdown_deadline = None;

        for child in [self.incoming.as_ref(), self.active.as_ref()]
            .into_iter()
            .flatten()
        {
            log::warn!(
                "{}",
                logging::preamble_alarm(
                    child.generation,
                    "shutdown grace period elapsed, sending SIGKILL"
                )
            );
            let _ = child::send_signal(child.pid, Signal::SIGKILL);
        }
        if let Some((draining, _)) = &self.draining {
            log::warn!(
                "{}",
                logging::preamble_alarm(
                    draining.generation,
                    "shutdown grace period elapsed, sending SIGKILL"
                )
            );
            let _ = child::send_signal(draining.pid, Signal::SIGKILL);
        }
        Ok(None)
    }

    fn maybe_start_pending_restart(&mut self) {
        if self.restart_pending && self.restart_state == RestartState::Idle {
            self.restart_pending = false;
            self.trigger_restart();
        }
    }

    /// Spawns a new generation. For generation 1 this becomes `active`
    /// directly (there is nothing to overlap with); for every later
    /// generation it becomes `incoming` until it reports `ready`.
    fn spawn_generation(&mut self) -> Result<()> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let is_first = generation == 1;

        let events_tx = self.events_tx.clone();
        let on_exit_tx = self.events_tx.clone();
        let close_tx = self.events_tx.clone();
        let msg_generation = generation;
        let close_generation = generation;

        let record = child::spawn(
            &self.binary_path,
            generation,
            &self.listeners.raw_fds(),
            move |generation, status| {
                let _ = on_exit_tx.send(Event::ChildExited { generation, status });
            },
            move |msg| {
                let _ = events_tx.send(Event::ChildMessage {
                    generation: msg_generation,
                    msg,
                });
            },
            move || {
                let _ = close_tx.send(Event::ChildChannelClosed {
                    generation: close_generation,
                });
            },
        );

        match record {
            Ok(record) => {
                log::info!(
                    "{}",
                    logging::preamble(generation, &format!("spawned, pid {}", record.pid))
                );
                if is_first {
                    self.active = Some(record);
                } else {
                    self.incoming = Some(record);
                    let (next, action) = self.restart_state.apply(RestartEvent::SpawnedNew);
                    self.restart_state = next;
                    self.apply_restart_action(action)?;
                }
                Ok(())
            }
            Err(err) => {
                if is_first {
                    Err(err)
                } else {
                    log::error!("[gen {}] failed to spawn: {}", generation, err);
                    let (next, action) = self.restart_state.apply(RestartEvent::NewDiedBeforeReady);
                    self.restart_state = next;
                    self.apply_restart_action(action)?;
                    Ok(())
                }
            }
        }
    }
}

fn status_to_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            return code;
        }
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}
