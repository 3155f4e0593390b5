mod common;

use async_trait::async_trait;
use common::{eventually, Bits, SimRobot};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use urctl::supervisor::{ProgramControl, ScriptSink, TelemetrySource};
use urctl::{ProgramState, Supervisor, SupervisorSettings, URError};

const PROGRAM: &str = "def pick():\n  movej([0,0,0,0,0,0])\nend\n";

const RUNNING: Bits = Bits { start: true, finish: false, running: true, safety: false, stale: false };
const STARTED_IDLE: Bits = Bits { start: true, finish: false, running: false, safety: false, stale: false };
const FINISHED: Bits = Bits { start: true, finish: true, running: false, safety: false, stale: false };
const SAFETY: Bits = Bits { start: true, finish: false, running: false, safety: true, stale: false };
const NOTHING: Bits = Bits { start: false, finish: false, running: false, safety: false, stale: false };

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        poll_interval: Duration::from_millis(10),
        max_not_running_polls: 2,
        abort_timeout: Duration::from_secs(1),
        ..SupervisorSettings::default()
    }
}

fn supervisor(robot: &Arc<SimRobot>, control: Option<Arc<dyn ProgramControl>>, settings: SupervisorSettings) -> Supervisor {
    Supervisor::new(
        Arc::clone(robot) as Arc<dyn TelemetrySource>,
        Arc::clone(robot) as Arc<dyn ScriptSink>,
        control,
        settings,
    )
}

#[derive(Default)]
struct CountingControl {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

#[async_trait]
impl ProgramControl for CountingControl {
    async fn pause(&self) -> urctl::Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> urctl::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenSink;

#[async_trait]
impl ScriptSink for BrokenSink {
    async fn send_program(&self, _program: &str) -> urctl::Result<()> {
        Err(URError::TransientIo("script port closed".to_string()))
    }
}

/// Script sink that takes a while to deliver programs and logs what arrived
#[derive(Default)]
struct SlowSink {
    delivered: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl ScriptSink for SlowSink {
    async fn send_program(&self, program: &str) -> urctl::Result<()> {
        if program.contains("def reset_register") {
            self.delivered.lock().unwrap().push("reset");
        } else {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.delivered.lock().unwrap().push("program");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_program_runs_to_finish_with_one_reset() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING, RUNNING, FINISHED]);
    let supervisor = supervisor(&robot, None, fast_settings());
    let mut events = supervisor.subscribe_events();

    let state = supervisor.run(PROGRAM, Duration::from_secs(5)).await.unwrap();
    assert_eq!(state, ProgramState::Finished);
    assert!(eventually(Duration::from_secs(1), || robot.resets() == 1).await);

    let sent = robot.sent();
    assert!(sent[0].contains("write_output_boolean_register(0, True)"));
    assert!(sent[0].contains("write_output_boolean_register(1, True)"));

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        states.push(event.state);
    }
    assert_eq!(states, vec![ProgramState::Sending, ProgramState::Running, ProgramState::Finished]);
    assert_eq!(supervisor.last_event().unwrap().submission_id, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(robot.resets(), 1);
}

#[tokio::test]
async fn test_hundred_char_program_stalls_after_two_samples() {
    let robot = SimRobot::new();
    robot.script(&[NOTHING]);
    let supervisor = supervisor(&robot, None, fast_settings());

    let program = format!("def p():\n  {}\nend", "x".repeat(85));
    assert_eq!(program.chars().count(), 100);

    let state = supervisor.run(&program, Duration::from_secs(5)).await.unwrap();
    assert_eq!(state, ProgramState::Stalled);
    assert!(eventually(Duration::from_secs(1), || robot.resets() == 1).await);
    assert_eq!(robot.samples(), 2);
}

#[tokio::test]
async fn test_safety_stop_requires_recovery() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING, SAFETY]);
    let supervisor = supervisor(&robot, None, fast_settings());

    let state = supervisor.run(PROGRAM, Duration::from_secs(5)).await.unwrap();
    assert_eq!(state, ProgramState::SafetyStopped);
    assert!(supervisor.is_safety_stopped());
    assert_eq!(robot.resets(), 0);

    assert!(matches!(supervisor.submit(PROGRAM).await, Err(URError::RecoveryRequired)));
    assert_eq!(robot.sent().len(), 1);

    supervisor.recover().await.unwrap();
    assert_eq!(supervisor.state(), ProgramState::Idle);
    assert!(!supervisor.is_safety_stopped());
    assert_eq!(robot.resets(), 1);

    robot.script(&[RUNNING, FINISHED]);
    let state = supervisor.run(PROGRAM, Duration::from_secs(5)).await.unwrap();
    assert_eq!(state, ProgramState::Finished);
}

#[tokio::test]
async fn test_execution_error_when_program_stops_running() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING, STARTED_IDLE]);
    let supervisor = supervisor(&robot, None, fast_settings());

    let state = supervisor.run(PROGRAM, Duration::from_secs(5)).await.unwrap();
    assert_eq!(state, ProgramState::ExecutionError);
    assert!(supervisor.has_execution_error());
    assert!(eventually(Duration::from_secs(1), || robot.resets() == 1).await);
    // one start poll plus max_not_running_polls + 1 misses
    assert_eq!(robot.samples(), 4);
}

#[tokio::test]
async fn test_concurrent_submits_abort_the_first_once() {
    let robot = SimRobot::new();
    robot.script(&[NOTHING]);
    let settings = SupervisorSettings {
        poll_interval: Duration::from_secs(10),
        ..fast_settings()
    };
    let supervisor = supervisor(&robot, None, settings);

    let (first, second) = tokio::join!(
        supervisor.submit("def a():\n  sleep(1)\nend\n"),
        supervisor.submit("def b():\n  sleep(2)\nend\n")
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first, second);

    let sent = robot.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[0].contains("write_output_boolean_register(0, True)"));
    assert!(sent[1].contains("def reset_register"));
    assert!(sent[2].contains("write_output_boolean_register(0, True)"));
    assert_ne!(sent[0], sent[2]);

    assert_eq!(supervisor.current_submission(), Some(first.max(second)));
    assert_eq!(supervisor.state(), ProgramState::Sending);
    assert_eq!(robot.samples(), 0);

    supervisor.abort().await.unwrap();
    assert_eq!(supervisor.state(), ProgramState::Idle);
    assert_eq!(robot.resets(), 2);

    supervisor.abort().await.unwrap();
    assert_eq!(robot.resets(), 2);
}

#[tokio::test]
async fn test_pause_holds_the_not_running_counter() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING, RUNNING, RUNNING, STARTED_IDLE]);
    let control = Arc::new(CountingControl::default());
    let supervisor = supervisor(&robot, Some(Arc::clone(&control) as Arc<dyn ProgramControl>), fast_settings());

    assert!(matches!(supervisor.pause().await, Err(URError::InvalidState(_))));

    supervisor.submit(PROGRAM).await.unwrap();
    let mut state = supervisor.subscribe();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ProgramState::Running))
        .await
        .unwrap()
        .unwrap();

    supervisor.pause().await.unwrap();
    assert!(supervisor.is_paused());
    assert_eq!(control.pauses.load(Ordering::SeqCst), 1);

    let before = robot.samples();
    assert!(eventually(Duration::from_secs(2), || robot.samples() >= before + 10).await);
    assert_eq!(supervisor.state(), ProgramState::Running);

    supervisor.resume().await.unwrap();
    assert!(!supervisor.is_paused());
    assert_eq!(control.resumes.load(Ordering::SeqCst), 1);
    assert!(matches!(supervisor.resume().await, Err(URError::InvalidState(_))));

    let state = supervisor.wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(state, ProgramState::ExecutionError);
}

#[tokio::test]
async fn test_send_failure_returns_to_idle() {
    let robot = SimRobot::new();
    let supervisor = Supervisor::new(
        Arc::clone(&robot) as Arc<dyn TelemetrySource>,
        Arc::new(BrokenSink),
        None,
        fast_settings(),
    );

    assert!(matches!(supervisor.submit(PROGRAM).await, Err(URError::TransientIo(_))));
    assert_eq!(supervisor.state(), ProgramState::Idle);
    assert_eq!(robot.samples(), 0);
}

#[tokio::test]
async fn test_wait_times_out_while_running() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING]);
    let supervisor = supervisor(&robot, None, fast_settings());

    supervisor.submit(PROGRAM).await.unwrap();
    assert!(matches!(
        supervisor.wait(Duration::from_millis(100)).await,
        Err(URError::Timeout(_))
    ));
    assert!(supervisor.is_program_running());

    supervisor.abort().await.unwrap();
    assert_eq!(supervisor.state(), ProgramState::Idle);
    assert!(eventually(Duration::from_secs(1), || robot.resets() == 1).await);
}

#[tokio::test]
async fn test_abort_while_sending_resets_after_the_program() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING]);
    let sink = Arc::new(SlowSink::default());
    let supervisor = Supervisor::new(
        Arc::clone(&robot) as Arc<dyn TelemetrySource>,
        Arc::clone(&sink) as Arc<dyn ScriptSink>,
        None,
        fast_settings(),
    );

    let (submitted, aborted) = tokio::join!(supervisor.submit(PROGRAM), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.state(), ProgramState::Sending);
        supervisor.abort().await
    });

    aborted.unwrap();
    assert!(matches!(submitted, Err(URError::InvalidState(_))));
    assert_eq!(*sink.delivered.lock().unwrap(), vec!["program", "reset"]);
    assert_eq!(supervisor.state(), ProgramState::Idle);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(robot.samples(), 0);
    assert_eq!(supervisor.state(), ProgramState::Idle);
}

#[tokio::test]
async fn test_telemetry_outage_while_running_is_not_an_execution_error() {
    let robot = SimRobot::new();
    robot.script(&[RUNNING, RUNNING.as_stale()]);
    let supervisor = supervisor(&robot, None, fast_settings());

    supervisor.submit(PROGRAM).await.unwrap();
    // well past max_not_running_polls worth of stale samples
    assert!(eventually(Duration::from_secs(2), || robot.samples() >= 10).await);
    assert_eq!(supervisor.state(), ProgramState::Running);
    assert_eq!(robot.resets(), 0);

    robot.script(&[FINISHED]);
    let state = supervisor.wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(state, ProgramState::Finished);
    assert!(eventually(Duration::from_secs(1), || robot.resets() == 1).await);
}
