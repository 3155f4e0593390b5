//! In-process stand-ins for the robot controller

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use urctl::recipe::{Recipe, TypeTag, Value};
use urctl::rtde::{self, MessageType};
use urctl::snapshot::Snapshot;
use urctl::supervisor::{ScriptSink, TelemetrySource};
use urctl::{RobotStatusBits, SafetyStatus};

pub const OUTPUT_ID: u8 = 1;
pub const INPUT_ID: u8 = 2;

#[derive(Clone, Default)]
struct Shared {
    sample: Arc<Mutex<Option<Vec<Value>>>>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
    unknown_field: Option<String>,
    quiet: Arc<AtomicBool>,
    hang_up: Arc<Notify>,
}

/// RTDE controller answering the handshake and streaming one configurable sample
pub struct FakeController {
    port: u16,
    shared: Shared,
    task: JoinHandle<()>,
}

impl FakeController {
    pub async fn start(output: Recipe, input: Recipe) -> Self {
        Self::start_with(output, input, None).await
    }

    /// Answers NOT_FOUND for `field` in any setup request
    pub async fn rejecting(output: Recipe, input: Recipe, field: &str) -> Self {
        Self::start_with(output, input, Some(field.to_string())).await
    }

    async fn start_with(output: Recipe, input: Recipe, unknown_field: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Shared {
            unknown_field,
            ..Shared::default()
        };
        let output = Arc::new(output);
        let input = Arc::new(input);

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&output), Arc::clone(&input), accept_shared.clone()));
            }
        });

        Self { port, shared, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Values streamed in every data package from now on
    pub fn set_sample(&self, values: Vec<Value>) {
        *self.shared.sample.lock().unwrap() = Some(values);
    }

    /// Payloads of every data package the client sent
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Stop or restart streaming data packages on every connection
    pub fn set_quiet(&self, quiet: bool) {
        self.shared.quiet.store(quiet, Ordering::SeqCst);
    }

    /// Close every open client connection; new ones are still accepted
    pub fn hang_up(&self) {
        self.shared.hang_up.notify_waiters();
    }
}

impl Drop for FakeController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn setup_answer(id: u8, recipe: &Recipe, names: &[u8], unknown: Option<&str>) -> Vec<u8> {
    let names = String::from_utf8_lossy(names);
    let types: Vec<&str> = names
        .split(',')
        .map(|name| match recipe.type_of(name) {
            Some(_) if unknown == Some(name) => rtde::NOT_FOUND,
            Some(kind) => kind.as_str(),
            None => rtde::NOT_FOUND,
        })
        .collect();
    let mut payload = vec![id];
    payload.extend_from_slice(types.join(",").as_bytes());
    payload
}

async fn serve(socket: TcpStream, output: Arc<Recipe>, input: Arc<Recipe>, shared: Shared) {
    let (mut reader, mut writer) = socket.into_split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(frame) = rtde::read_frame_from(&mut reader).await {
            if frames_tx.send(frame).is_err() {
                break;
            }
        }
    });

    let unknown = shared.unknown_field.as_deref();
    let mut started = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(8));

    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                let Some(frame) = frame else { break };
                let reply = match frame.kind {
                    MessageType::RequestProtocolVersion => Some(vec![1]),
                    MessageType::GetUrControlVersion => {
                        Some([5u32, 12, 0, 1].iter().flat_map(|v| v.to_be_bytes()).collect())
                    }
                    MessageType::ControlPackageSetupOutputs => {
                        Some(setup_answer(OUTPUT_ID, &output, &frame.payload[8..], unknown))
                    }
                    MessageType::ControlPackageSetupInputs => {
                        Some(setup_answer(INPUT_ID, &input, &frame.payload, unknown))
                    }
                    MessageType::ControlPackageStart => {
                        started = true;
                        Some(vec![1])
                    }
                    MessageType::ControlPackagePause => {
                        started = false;
                        Some(vec![1])
                    }
                    MessageType::DataPackage => {
                        shared.received.lock().unwrap().push(frame.payload);
                        None
                    }
                    MessageType::TextMessage => None,
                };
                if let Some(payload) = reply {
                    if rtde::write_frame_to(&mut writer, frame.kind, &payload).await.is_err() {
                        break;
                    }
                }
            }
            _ = shared.hang_up.notified() => break,
            _ = ticker.tick(), if started => {
                if shared.quiet.load(Ordering::SeqCst) {
                    continue;
                }
                let values = shared.sample.lock().unwrap().clone();
                if let Some(values) = values {
                    let payload = rtde::encode_data_package(OUTPUT_ID, &output, &values).unwrap();
                    if rtde::write_frame_to(&mut writer, MessageType::DataPackage, &payload).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Output recipe carrying everything the supervisor reads
pub fn supervisor_recipe() -> Arc<Recipe> {
    Arc::new(
        Recipe::from_pairs(&[
            ("output_bit_registers0_to_31", TypeTag::Uint32),
            ("robot_status_bits", TypeTag::Uint32),
            ("safety_status_bits", TypeTag::Uint32),
        ])
        .unwrap(),
    )
}

/// What the simulated robot reports on one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bits {
    pub start: bool,
    pub finish: bool,
    pub running: bool,
    pub safety: bool,
    /// Served as a stale copy, as when RTDE stops delivering
    pub stale: bool,
}

impl Bits {
    pub fn snapshot(self, sequence: u64) -> Snapshot {
        let registers = (self.start as u32) | ((self.finish as u32) << 1);
        let status = if self.running { RobotStatusBits::PROGRAM_RUNNING } else { 0 };
        let safety = if self.safety { SafetyStatus::STOPPED_DUE_TO_SAFETY } else { 0 };
        let snapshot = Snapshot::from_values(
            supervisor_recipe(),
            vec![Value::Uint32(registers), Value::Uint32(status), Value::Uint32(safety)],
            sequence,
        )
        .unwrap();
        if self.stale {
            snapshot.into_stale()
        } else {
            snapshot
        }
    }

    pub fn as_stale(self) -> Self {
        Self { stale: true, ..self }
    }
}

/// Telemetry and script sink of a scripted robot.
///
/// Each sample pops the next scripted poll; once the script runs out the last
/// one repeats.
#[derive(Default)]
pub struct SimRobot {
    polls: Mutex<Vec<Bits>>,
    last: Mutex<Bits>,
    samples: AtomicUsize,
    sent: Mutex<Vec<String>>,
}

impl SimRobot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, polls: &[Bits]) {
        let mut queue = self.polls.lock().unwrap();
        queue.clear();
        queue.extend(polls.iter().rev().copied());
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Programs sent that clear the sentinel registers
    pub fn resets(&self) -> usize {
        self.sent().iter().filter(|p| p.contains("def reset_register")).count()
    }
}

#[async_trait]
impl TelemetrySource for SimRobot {
    async fn sample(&self) -> urctl::Result<Snapshot> {
        let sequence = self.samples.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let bits = match self.polls.lock().unwrap().pop() {
            Some(bits) => {
                *self.last.lock().unwrap() = bits;
                bits
            }
            None => *self.last.lock().unwrap(),
        };
        Ok(bits.snapshot(sequence))
    }
}

#[async_trait]
impl ScriptSink for SimRobot {
    async fn send_program(&self, program: &str) -> urctl::Result<()> {
        self.sent.lock().unwrap().push(program.to_string());
        Ok(())
    }
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
