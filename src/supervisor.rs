//! Program execution supervisor
//!
//! Drives one submitted program at a time from `Sending` to a terminal state.
//! The submitted text is rewritten so the program raises a start and a finish
//! output bit register; a monitor task polls telemetry and decides, in order
//! of precedence: safety stop, finish, stall, execution error.
//!
//! Every submission gets its own stop flag, wake-up and reset guard, so a
//! monitor that belongs to an aborted submission can never move the state of
//! the next one, and the reset program goes out at most once per submission.

use crate::events::ProgramEvent;
use crate::program::{inject_sentinels, reset_program};
use crate::snapshot::Snapshot;
use crate::{Result, URError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where telemetry samples come from
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Next sample; a stale or failed sample still counts as a poll
    async fn sample(&self) -> Result<Snapshot>;
}

/// Where program text goes
#[async_trait]
pub trait ScriptSink: Send + Sync {
    async fn send_program(&self, program: &str) -> Result<()>;
}

/// Pause and resume of the running program
#[async_trait]
pub trait ProgramControl: Send + Sync {
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
}

/// Lifecycle of a submitted program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    Idle,
    Sending,
    Running,
    Finished,
    Stalled,
    SafetyStopped,
    ExecutionError,
}

impl ProgramState {
    /// A monitor task is (or is about to be) polling
    pub fn is_active(self) -> bool {
        matches!(self, ProgramState::Sending | ProgramState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgramState::Finished | ProgramState::Stalled | ProgramState::SafetyStopped | ProgramState::ExecutionError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    /// Program characters granted per poll before a missing start bit counts as a stall
    pub chars_per_poll: usize,
    /// Consecutive polls with the start bit set but no program running before giving up
    pub max_not_running_polls: u32,
    pub abort_timeout: Duration,
    pub start_register: u32,
    pub finish_register: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            chars_per_poll: 50,
            max_not_running_polls: 10,
            abort_timeout: Duration::from_secs(5),
            start_register: 0,
            finish_register: 1,
        }
    }
}

impl SupervisorSettings {
    /// Polls without a start bit after which a program of `chars` characters is stalled
    pub fn stall_threshold(&self, chars: usize) -> u32 {
        let per_poll = self.chars_per_poll.max(1);
        let polls = chars.div_ceil(per_poll).max(1);
        u32::try_from(polls).unwrap_or(u32::MAX)
    }
}

/// The bits one poll looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub start: bool,
    pub finish: bool,
    pub program_running: bool,
    pub safety_stopped: bool,
    /// Nothing fresh arrived; only the counters move
    pub stale: bool,
}

impl Observation {
    pub fn from_snapshot(snapshot: &Snapshot, settings: &SupervisorSettings) -> Self {
        if snapshot.stale || !snapshot.has_data() {
            return Self::stale();
        }
        Self {
            start: snapshot.output_bit(settings.start_register).unwrap_or(false),
            finish: snapshot.output_bit(settings.finish_register).unwrap_or(false),
            // Without the status word there is no evidence the program stopped
            program_running: snapshot.robot_status().map_or(true, |s| s.program_running),
            safety_stopped: snapshot.safety_status().is_some_and(|s| s.stopped_due_to_safety),
            stale: false,
        }
    }

    pub fn stale() -> Self {
        Self {
            stale: true,
            ..Self::default()
        }
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Continue,
    Started,
    Finished,
    Stalled,
    SafetyStopped,
    ExecutionError,
}

/// Pure polling state machine of one submission
#[derive(Debug, Clone)]
pub struct PollTracker {
    running: bool,
    stall_threshold: u32,
    max_not_running: u32,
    not_started: u32,
    not_running: u32,
    stale_streak: u32,
}

impl PollTracker {
    pub fn new(stall_threshold: u32, max_not_running: u32) -> Self {
        Self {
            running: false,
            stall_threshold: stall_threshold.max(1),
            max_not_running,
            not_started: 0,
            not_running: 0,
            stale_streak: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Consecutive polls without fresh telemetry
    pub fn stale_streak(&self) -> u32 {
        self.stale_streak
    }

    /// Classify one poll.
    ///
    /// Stale polls only count toward a stall; once running, the last fresh
    /// classification holds until telemetry returns.
    pub fn observe(&mut self, obs: &Observation, paused: bool) -> PollDecision {
        if obs.stale {
            self.stale_streak = self.stale_streak.saturating_add(1);
            if self.running {
                return PollDecision::Continue;
            }
            return self.count_missed_poll(paused);
        }
        self.stale_streak = 0;
        if obs.safety_stopped {
            return PollDecision::SafetyStopped;
        }
        if obs.start && obs.finish {
            return PollDecision::Finished;
        }

        if !self.running {
            if obs.start {
                self.running = true;
                self.not_running = 0;
                return PollDecision::Started;
            }
            return self.count_missed_poll(paused);
        }

        if obs.start && obs.program_running {
            self.not_running = 0;
            PollDecision::Continue
        } else {
            self.count_missed_poll(paused)
        }
    }

    /// Advance the counter of the current phase
    fn count_missed_poll(&mut self, paused: bool) -> PollDecision {
        if !self.running {
            self.not_started += 1;
            if self.not_started >= self.stall_threshold {
                return PollDecision::Stalled;
            }
        } else if !paused {
            self.not_running += 1;
            if self.not_running > self.max_not_running {
                return PollDecision::ExecutionError;
            }
        }
        PollDecision::Continue
    }
}

/// Per-submission bookkeeping
struct Submission {
    id: u64,
    chars: usize,
    stop: AtomicBool,
    wake: Notify,
    reset_sent: AtomicBool,
    /// Held by `submit` from the program send until the monitor is in place
    sending: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Submission {
    fn new(id: u64, chars: usize) -> Self {
        Self {
            id,
            chars,
            stop: AtomicBool::new(false),
            wake: Notify::new(),
            reset_sent: AtomicBool::new(false),
            sending: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(None),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn take_monitor(&self) -> Option<JoinHandle<()>> {
        self.monitor.lock().ok().and_then(|mut m| m.take())
    }
}

struct Inner {
    telemetry: Arc<dyn TelemetrySource>,
    script: Arc<dyn ScriptSink>,
    control: Option<Arc<dyn ProgramControl>>,
    settings: SupervisorSettings,
    state: watch::Sender<ProgramState>,
    events: broadcast::Sender<ProgramEvent>,
    submit_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Submission>>>,
    next_id: AtomicU64,
    paused: AtomicBool,
    needs_recovery: AtomicBool,
    last_event: Mutex<Option<ProgramEvent>>,
}

impl Inner {
    fn current(&self) -> Option<Arc<Submission>> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    fn is_current(&self, id: u64) -> bool {
        self.current().is_some_and(|s| s.id == id)
    }

    fn state(&self) -> ProgramState {
        *self.state.borrow()
    }

    /// Move submission `id` to `to`. Ignored if `id` is no longer the current submission.
    fn transition(&self, id: u64, to: ProgramState, message: &str) {
        if !self.is_current(id) {
            debug!(submission = id, to = ?to, "Ignoring transition of a replaced submission");
            return;
        }
        let from = self.state.send_replace(to);
        let paused = self.paused.load(Ordering::Acquire);

        match to {
            ProgramState::SafetyStopped | ProgramState::ExecutionError | ProgramState::Stalled => {
                warn!(submission = id, from = ?from, to = ?to, "{}", message)
            }
            _ => info!(submission = id, from = ?from, to = ?to, "{}", message),
        }
        self.record(ProgramEvent::new(id, to, paused, message));
    }

    fn record(&self, event: ProgramEvent) {
        let _ = self.events.send(event.clone());
        if let Ok(mut last) = self.last_event.lock() {
            *last = Some(event);
        }
    }

    /// Send the reset program once per submission
    async fn send_reset(&self, submission: &Submission) {
        if submission
            .reset_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reset = reset_program(self.settings.start_register, self.settings.finish_register);
        match self.script.send_program(&reset).await {
            Ok(()) => debug!(submission = submission.id, "Reset program sent"),
            Err(e) => error!(submission = submission.id, "Failed to send reset program: {}", e),
        }
    }

    /// Sleep one poll interval unless the submission is stopped first
    async fn pause_between_polls(&self, submission: &Submission) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => {}
            _ = submission.wake.notified() => {}
        }
    }

    async fn monitor(self: Arc<Self>, submission: Arc<Submission>) {
        let mut tracker = PollTracker::new(
            self.settings.stall_threshold(submission.chars),
            self.settings.max_not_running_polls,
        );
        debug!(submission = submission.id, "Monitor started");

        while !submission.stopped() {
            self.pause_between_polls(&submission).await;
            if submission.stopped() {
                break;
            }

            let sampled = tokio::select! {
                sampled = self.telemetry.sample() => sampled,
                _ = submission.wake.notified() => break,
            };
            if submission.stopped() {
                break;
            }

            let observation = match sampled {
                Ok(snapshot) => Observation::from_snapshot(&snapshot, &self.settings),
                Err(e) => {
                    debug!(submission = submission.id, "Telemetry sample failed: {}", e);
                    Observation::stale()
                }
            };

            let paused = self.paused.load(Ordering::Acquire);
            let decision = tracker.observe(&observation, paused);
            let outage = tracker.is_running() && tracker.stale_streak() == self.settings.max_not_running_polls.saturating_add(1);
            if observation.stale && outage {
                warn!(
                    submission = submission.id,
                    polls = tracker.stale_streak(),
                    "No fresh telemetry; holding last known program state"
                );
            }
            match decision {
                PollDecision::Continue => {}
                PollDecision::Started => {
                    self.transition(submission.id, ProgramState::Running, "Program started");
                }
                PollDecision::Finished => {
                    self.transition(submission.id, ProgramState::Finished, "Program finished");
                    self.send_reset(&submission).await;
                    break;
                }
                PollDecision::Stalled => {
                    self.transition(submission.id, ProgramState::Stalled, "Program never started");
                    self.send_reset(&submission).await;
                    break;
                }
                PollDecision::ExecutionError => {
                    self.transition(
                        submission.id,
                        ProgramState::ExecutionError,
                        "Controller stopped running the program before it finished",
                    );
                    self.send_reset(&submission).await;
                    break;
                }
                PollDecision::SafetyStopped => {
                    if self.is_current(submission.id) {
                        self.needs_recovery.store(true, Ordering::Release);
                    }
                    self.transition(submission.id, ProgramState::SafetyStopped, "Safety stop reported");
                    break;
                }
            }
        }
        debug!(submission = submission.id, "Monitor stopped");
    }

    async fn abort(&self) -> Result<()> {
        if !self.state().is_active() {
            return Ok(());
        }
        let Some(submission) = self.current() else {
            return Ok(());
        };

        info!(submission = submission.id, "Aborting program");
        submission.request_stop();

        // The reset must reach the controller after the program it clears
        if tokio::time::timeout(self.settings.abort_timeout, submission.sending.lock()).await.is_err() {
            warn!(submission = submission.id, "Program send did not finish within {:?}", self.settings.abort_timeout);
        }

        if let Some(handle) = submission.take_monitor() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.settings.abort_timeout, handle).await.is_err() {
                warn!(submission = submission.id, "Monitor did not stop within {:?}", self.settings.abort_timeout);
                abort.abort();
            }
        }

        self.send_reset(&submission).await;
        self.paused.store(false, Ordering::Release);
        self.transition(submission.id, ProgramState::Idle, "Program aborted");
        Ok(())
    }
}

/// Supervises submitted programs
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        script: Arc<dyn ScriptSink>,
        control: Option<Arc<dyn ProgramControl>>,
        settings: SupervisorSettings,
    ) -> Self {
        let (state, _) = watch::channel(ProgramState::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                telemetry,
                script,
                control,
                settings,
                state,
                events,
                submit_lock: tokio::sync::Mutex::new(()),
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                needs_recovery: AtomicBool::new(false),
                last_event: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Submit a program and return its submission id once it is sent.
    ///
    /// A program still sending or running is aborted first. An `abort` that
    /// lands during the send waits for it, and the submit then fails with
    /// `InvalidState`.
    pub async fn submit(&self, program: &str) -> Result<u64> {
        let inner = &self.inner;
        let _submit = inner.submit_lock.lock().await;

        if inner.needs_recovery.load(Ordering::Acquire) {
            return Err(URError::RecoveryRequired);
        }
        if inner.state().is_active() {
            info!("Replacing active program");
            inner.abort().await?;
        }

        let id = inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let chars = program.chars().count();
        let rewritten = inject_sentinels(program, inner.settings.start_register, inner.settings.finish_register);
        let submission = Arc::new(Submission::new(id, chars));
        let _sending = submission.sending.lock().await;

        if let Ok(mut current) = inner.current.lock() {
            *current = Some(Arc::clone(&submission));
        }
        inner.paused.store(false, Ordering::Release);
        inner.transition(id, ProgramState::Sending, "Sending program");

        if let Err(e) = inner.script.send_program(&rewritten).await {
            inner.transition(id, ProgramState::Idle, "Program could not be sent");
            return Err(e);
        }
        if submission.stopped() {
            info!(submission = id, "Program aborted while sending");
            return Err(URError::InvalidState("program aborted while sending".to_string()));
        }

        let handle = tokio::spawn(Arc::clone(inner).monitor(Arc::clone(&submission)));
        if let Ok(mut monitor) = submission.monitor.lock() {
            *monitor = Some(handle);
        }
        info!(submission = id, chars, "Program submitted");
        Ok(id)
    }

    /// Stop the active program and return to `Idle`. A no-op unless sending or running.
    pub async fn abort(&self) -> Result<()> {
        self.inner.abort().await
    }

    pub async fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state() != ProgramState::Running {
            return Err(URError::InvalidState(format!("cannot pause while {:?}", inner.state())));
        }
        if inner.paused.load(Ordering::Acquire) {
            return Ok(());
        }
        let control = inner
            .control
            .as_ref()
            .ok_or_else(|| URError::InvalidState("no program control available".to_string()))?;
        control.pause().await?;
        inner.paused.store(true, Ordering::Release);

        if let Some(submission) = inner.current() {
            inner.record(ProgramEvent::new(submission.id, inner.state(), true, "Program paused"));
            info!(submission = submission.id, "Program paused");
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.paused.load(Ordering::Acquire) {
            return Err(URError::InvalidState("program is not paused".to_string()));
        }
        let control = inner
            .control
            .as_ref()
            .ok_or_else(|| URError::InvalidState("no program control available".to_string()))?;
        control.resume().await?;
        inner.paused.store(false, Ordering::Release);

        if let Some(submission) = inner.current() {
            inner.record(ProgramEvent::new(submission.id, inner.state(), false, "Program resumed"));
            info!(submission = submission.id, "Program resumed");
        }
        Ok(())
    }

    /// Clear an unrecovered safety stop, reset the sentinel registers and return to `Idle`
    pub async fn recover(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.needs_recovery.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(submission) = inner.current() {
            inner.send_reset(&submission).await;
            inner.paused.store(false, Ordering::Release);
            inner.transition(submission.id, ProgramState::Idle, "Recovered from safety stop");
        }
        inner.needs_recovery.store(false, Ordering::Release);
        Ok(())
    }

    /// Wait until nothing is sending or running and return the resulting state
    pub async fn wait(&self, timeout: Duration) -> Result<ProgramState> {
        let mut rx = self.inner.state.subscribe();
        let waited = match tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_active())).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(URError::InvalidState("supervisor dropped".to_string())),
            Err(_) => Err(URError::Timeout(format!("program still {:?} after {:?}", self.state(), timeout))),
        };
        waited
    }

    /// Submit and wait
    pub async fn run(&self, program: &str, timeout: Duration) -> Result<ProgramState> {
        self.submit(program).await?;
        self.wait(timeout).await
    }

    pub fn state(&self) -> ProgramState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgramState> {
        self.inner.state.subscribe()
    }

    /// Every lifecycle event from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgramEvent> {
        self.inner.events.subscribe()
    }

    pub fn current_submission(&self) -> Option<u64> {
        self.inner.current().map(|s| s.id)
    }

    pub fn is_program_running(&self) -> bool {
        self.state() == ProgramState::Running
    }

    pub fn has_execution_error(&self) -> bool {
        self.state() == ProgramState::ExecutionError
    }

    pub fn is_safety_stopped(&self) -> bool {
        self.inner.needs_recovery.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn last_event(&self) -> Option<ProgramEvent> {
        self.inner.last_event.lock().ok().and_then(|e| e.clone())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(submission) = self.inner.current() {
            submission.request_stop();
            if let Some(handle) = submission.take_monitor() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(start: bool, finish: bool, program_running: bool) -> Observation {
        Observation {
            start,
            finish,
            program_running,
            ..Observation::default()
        }
    }

    #[test]
    fn test_stall_threshold() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.stall_threshold(0), 1);
        assert_eq!(settings.stall_threshold(50), 1);
        assert_eq!(settings.stall_threshold(51), 2);
        assert_eq!(settings.stall_threshold(100), 2);
    }

    #[test]
    fn test_hundred_char_program_stalls_on_second_poll() {
        let mut tracker = PollTracker::new(SupervisorSettings::default().stall_threshold(100), 10);
        assert_eq!(tracker.observe(&seen(false, false, false), false), PollDecision::Continue);
        assert_eq!(tracker.observe(&seen(false, false, false), false), PollDecision::Stalled);
    }

    #[test]
    fn test_start_then_finish() {
        let mut tracker = PollTracker::new(2, 10);
        assert_eq!(tracker.observe(&seen(true, false, true), false), PollDecision::Started);
        assert!(tracker.is_running());
        assert_eq!(tracker.observe(&seen(true, false, true), false), PollDecision::Continue);
        assert_eq!(tracker.observe(&seen(true, true, false), false), PollDecision::Finished);
    }

    #[test]
    fn test_safety_stop_takes_precedence() {
        let mut tracker = PollTracker::new(1, 10);
        let obs = Observation {
            safety_stopped: true,
            ..seen(true, true, false)
        };
        assert_eq!(tracker.observe(&obs, false), PollDecision::SafetyStopped);
    }

    #[test]
    fn test_execution_error_after_more_than_max_polls() {
        let mut tracker = PollTracker::new(1, 10);
        assert_eq!(tracker.observe(&seen(true, false, true), false), PollDecision::Started);
        for _ in 0..10 {
            assert_eq!(tracker.observe(&seen(true, false, false), false), PollDecision::Continue);
        }
        assert_eq!(tracker.observe(&seen(true, false, false), false), PollDecision::ExecutionError);
    }

    #[test]
    fn test_paused_polls_do_not_count() {
        let mut tracker = PollTracker::new(1, 2);
        tracker.observe(&seen(true, false, true), false);
        for _ in 0..20 {
            assert_eq!(tracker.observe(&seen(true, false, false), true), PollDecision::Continue);
        }
        tracker.observe(&seen(true, false, false), false);
        tracker.observe(&seen(true, false, false), false);
        assert_eq!(tracker.observe(&seen(true, false, false), false), PollDecision::ExecutionError);
    }

    #[test]
    fn test_running_poll_resets_counter() {
        let mut tracker = PollTracker::new(1, 2);
        tracker.observe(&seen(true, false, true), false);
        tracker.observe(&seen(true, false, false), false);
        tracker.observe(&seen(true, false, false), false);
        assert_eq!(tracker.observe(&seen(true, false, true), false), PollDecision::Continue);
        tracker.observe(&seen(true, false, false), false);
        tracker.observe(&seen(true, false, false), false);
        assert_eq!(tracker.observe(&seen(true, false, false), false), PollDecision::ExecutionError);
    }

    #[test]
    fn test_stale_polls_only_count_toward_a_stall() {
        let mut tracker = PollTracker::new(3, 1);
        assert_eq!(tracker.observe(&Observation::stale(), false), PollDecision::Continue);
        assert_eq!(tracker.observe(&Observation::stale(), false), PollDecision::Continue);
        assert_eq!(tracker.observe(&seen(true, false, true), false), PollDecision::Started);
        for _ in 0..10 {
            assert_eq!(tracker.observe(&Observation::stale(), false), PollDecision::Continue);
        }
        assert_eq!(tracker.stale_streak(), 10);
        assert_eq!(tracker.observe(&seen(true, false, true), false), PollDecision::Continue);
        assert_eq!(tracker.stale_streak(), 0);
        assert_eq!(tracker.observe(&seen(true, true, false), false), PollDecision::Finished);

        let mut tracker = PollTracker::new(2, 1);
        tracker.observe(&Observation::stale(), false);
        assert_eq!(tracker.observe(&Observation::stale(), false), PollDecision::Stalled);
    }

    #[test]
    fn test_dropped_start_bit_counts_as_not_running() {
        let mut tracker = PollTracker::new(1, 0);
        tracker.observe(&seen(true, false, true), false);
        assert_eq!(tracker.observe(&seen(false, false, true), false), PollDecision::ExecutionError);
    }
}
