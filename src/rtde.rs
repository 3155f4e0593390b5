//! RTDE (Real-Time Data Exchange) wire layer, protocol version 2
//!
//! Every message is a 3 byte header (big-endian u16 size including the header,
//! then a u8 type) followed by a big-endian payload. This module only frames,
//! negotiates and converts between data packages and typed values; the cyclic
//! exchange lives in [`crate::session`].

use crate::connection::Connector;
use crate::recipe::{Recipe, TypeTag, Value};
use crate::{Result, URError};
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: u16 = 2;
pub const HEADER_SIZE: usize = 3;

/// Setup reply type entry meaning the controller does not know the field
pub const NOT_FOUND: &str = "NOT_FOUND";

/// Setup reply type entry meaning another client already writes the field
pub const IN_USE: &str = "IN_USE";

/// RTDE message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RequestProtocolVersion = 86,
    GetUrControlVersion = 118,
    TextMessage = 77,
    DataPackage = 85,
    ControlPackageSetupOutputs = 79,
    ControlPackageSetupInputs = 73,
    ControlPackageStart = 83,
    ControlPackagePause = 80,
}

impl TryFrom<u8> for MessageType {
    type Error = URError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            86 => Ok(MessageType::RequestProtocolVersion),
            118 => Ok(MessageType::GetUrControlVersion),
            77 => Ok(MessageType::TextMessage),
            85 => Ok(MessageType::DataPackage),
            79 => Ok(MessageType::ControlPackageSetupOutputs),
            73 => Ok(MessageType::ControlPackageSetupInputs),
            83 => Ok(MessageType::ControlPackageStart),
            80 => Ok(MessageType::ControlPackagePause),
            _ => Err(URError::Protocol(format!("Unknown message type: {}", raw))),
        }
    }
}

/// One decoded RTDE message
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

/// Frame `payload` with the RTDE header
pub fn encode_frame(kind: MessageType, payload: &[u8]) -> Result<Vec<u8>> {
    let size = u16::try_from(payload.len() + HEADER_SIZE)
        .map_err(|_| URError::Protocol(format!("Payload of {} bytes does not fit in one frame", payload.len())))?;
    let mut frame = Vec::with_capacity(size as usize);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a header into (payload length, message type)
pub fn parse_header(header: [u8; HEADER_SIZE]) -> Result<(usize, MessageType)> {
    let size = u16::from_be_bytes([header[0], header[1]]) as usize;
    if size < HEADER_SIZE {
        return Err(URError::Protocol(format!("Frame size {} is smaller than the header", size)));
    }
    Ok((size - HEADER_SIZE, MessageType::try_from(header[2])?))
}

/// Read one frame from any async reader
pub async fn read_frame_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (len, kind) = parse_header(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

/// Write one frame to any async writer
pub async fn write_frame_to<W: AsyncWrite + Unpin>(writer: &mut W, kind: MessageType, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(kind, payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    writer.write_all(&frame).await
}

/// Read one frame through a connector
pub async fn read_frame(connector: &Connector, limit: Duration) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    connector.read_exact(&mut header, limit).await?;
    let (len, kind) = parse_header(header)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        connector.read_exact(&mut payload, limit).await?;
    }
    Ok(Frame { kind, payload })
}

/// Send one frame through a connector
pub async fn send_frame(connector: &Connector, kind: MessageType, payload: &[u8], limit: Duration) -> Result<()> {
    let frame = encode_frame(kind, payload)?;
    connector.write_all(&frame, limit).await
}

/// Text message pushed by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMessage {
    pub level: u8,
    pub source: String,
    pub message: String,
}

/// Decode a v2 text message (`len, message, len, source, level`)
pub fn decode_text_message(payload: &[u8]) -> TextMessage {
    fn take_str(payload: &[u8], at: usize) -> Option<(String, usize)> {
        let len = *payload.get(at)? as usize;
        let bytes = payload.get(at + 1..at + 1 + len)?;
        Some((String::from_utf8_lossy(bytes).into_owned(), at + 1 + len))
    }

    let parsed = take_str(payload, 0).and_then(|(message, next)| {
        let (source, next) = take_str(payload, next)?;
        let level = *payload.get(next)?;
        Some(TextMessage { level, source, message })
    });

    parsed.unwrap_or_else(|| TextMessage {
        level: 0,
        source: String::new(),
        message: String::from_utf8_lossy(payload).into_owned(),
    })
}

/// Log a controller text message at a matching level
pub fn log_text_message(text: &TextMessage) {
    match text.level {
        0 | 1 => warn!(source = %text.source, level = text.level, "Controller: {}", text.message),
        2 => info!(source = %text.source, "Controller: {}", text.message),
        _ => debug!(source = %text.source, level = text.level, "Controller: {}", text.message),
    }
}

/// Controller software version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerVersion {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
    pub build: u32,
}

impl std::fmt::Display for ControllerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.bugfix, self.build)
    }
}

fn read_be<const N: usize>(data: &[u8], offset: &mut usize, what: &str) -> Result<[u8; N]> {
    let bytes = data
        .get(*offset..*offset + N)
        .ok_or_else(|| URError::Protocol(format!("Insufficient data for {}", what)))?;
    *offset += N;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

pub fn decode_controller_version(payload: &[u8]) -> Result<ControllerVersion> {
    let mut offset = 0;
    let mut next = || read_be::<4>(payload, &mut offset, "controller version").map(u32::from_be_bytes);
    Ok(ControllerVersion {
        major: next()?,
        minor: next()?,
        bugfix: next()?,
        build: next()?,
    })
}

/// Result of a complete handshake
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub output_id: u8,
    pub input_id: Option<u8>,
    pub controller_version: Option<ControllerVersion>,
}

/// Check a setup reply against the requested recipe and return its recipe id.
///
/// Any `NOT_FOUND`/`IN_USE` entry, a count mismatch or a type different from
/// the requested one rejects the recipe.
pub fn parse_setup_reply(recipe: &Recipe, payload: &[u8]) -> Result<u8> {
    let (&id, types) = payload
        .split_first()
        .ok_or_else(|| URError::Protocol("Empty setup reply".to_string()))?;
    let types = String::from_utf8_lossy(types);
    let types: Vec<&str> = types.split(',').map(str::trim).collect();

    if types.len() != recipe.len() {
        return Err(URError::RecipeRejected(format!(
            "Controller answered {} types for {} fields",
            types.len(),
            recipe.len()
        )));
    }

    for (field, answered) in recipe.fields().iter().zip(&types) {
        if *answered == NOT_FOUND || *answered == IN_USE {
            return Err(URError::RecipeRejected(format!("{}: {}", field.name, answered)));
        }
        let answered_tag: TypeTag = answered
            .parse()
            .map_err(|_| URError::RecipeRejected(format!("{}: unknown type {}", field.name, answered)))?;
        if answered_tag != field.kind {
            return Err(URError::RecipeRejected(format!(
                "{}: requested {}, controller reports {}",
                field.name, field.kind, answered_tag
            )));
        }
    }

    if id == 0 {
        return Err(URError::RecipeRejected("Controller returned recipe id 0".to_string()));
    }
    Ok(id)
}

/// Recipes that can travel in data packages only contain fixed-size types
pub fn check_transportable(recipe: &Recipe) -> Result<()> {
    if recipe.is_empty() {
        return Err(URError::Config("Recipe is empty".to_string()));
    }
    for field in recipe.fields() {
        if field.kind.wire_size().is_none() {
            return Err(URError::RecipeRejected(format!(
                "{} has type {} which cannot be carried in a data package",
                field.name, field.kind
            )));
        }
    }
    Ok(())
}

/// Decode a data package body (after the recipe id byte)
pub fn decode_values(recipe: &Recipe, data: &[u8]) -> Result<Vec<Value>> {
    let mut offset = 0;
    let mut values = Vec::with_capacity(recipe.len());

    for field in recipe.fields() {
        let name = field.name.as_str();
        let value = match field.kind {
            TypeTag::Bool => Value::Bool(read_be::<1>(data, &mut offset, name)?[0] != 0),
            TypeTag::Uint8 => Value::Uint8(read_be::<1>(data, &mut offset, name)?[0]),
            TypeTag::Uint32 => Value::Uint32(u32::from_be_bytes(read_be(data, &mut offset, name)?)),
            TypeTag::Uint64 => Value::Uint64(u64::from_be_bytes(read_be(data, &mut offset, name)?)),
            TypeTag::Int32 => Value::Int32(i32::from_be_bytes(read_be(data, &mut offset, name)?)),
            TypeTag::Double => Value::Double(f64::from_be_bytes(read_be(data, &mut offset, name)?)),
            TypeTag::Vector3d => {
                let mut v = [0.0; 3];
                for slot in v.iter_mut() {
                    *slot = f64::from_be_bytes(read_be(data, &mut offset, name)?);
                }
                Value::Vector3d(v)
            }
            TypeTag::Vector6d => {
                let mut v = [0.0; 6];
                for slot in v.iter_mut() {
                    *slot = f64::from_be_bytes(read_be(data, &mut offset, name)?);
                }
                Value::Vector6d(v)
            }
            TypeTag::Vector6int32 => {
                let mut v = [0; 6];
                for slot in v.iter_mut() {
                    *slot = i32::from_be_bytes(read_be(data, &mut offset, name)?);
                }
                Value::Vector6int32(v)
            }
            TypeTag::String => {
                return Err(URError::Protocol(format!("{} is a STRING field", name)));
            }
        };
        values.push(value);
    }

    if offset != data.len() {
        return Err(URError::Protocol(format!(
            "Data package has {} trailing bytes",
            data.len() - offset
        )));
    }
    Ok(values)
}

/// Encode values aligned with `recipe` into a data package body
pub fn encode_values(recipe: &Recipe, values: &[Value]) -> Result<Vec<u8>> {
    if values.len() != recipe.len() {
        return Err(URError::InvalidState(format!(
            "{} values for a recipe of {} fields",
            values.len(),
            recipe.len()
        )));
    }

    let mut out = Vec::new();
    for (field, value) in recipe.fields().iter().zip(values) {
        match (field.kind, value) {
            (TypeTag::Bool, Value::Bool(b)) => out.push(*b as u8),
            (TypeTag::Uint8, Value::Uint8(v)) => out.push(*v),
            (TypeTag::Uint32, Value::Uint32(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (TypeTag::Uint64, Value::Uint64(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (TypeTag::Int32, Value::Int32(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (TypeTag::Double, Value::Double(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (TypeTag::Vector3d, Value::Vector3d(v)) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            (TypeTag::Vector6d, Value::Vector6d(v)) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            (TypeTag::Vector6int32, Value::Vector6int32(v)) => {
                v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes()))
            }
            (expected, actual) => {
                return Err(URError::TypeMismatch {
                    field: field.name.clone(),
                    expected: expected.to_string(),
                    actual: actual.type_tag().to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// Build the body of an outgoing data package
pub fn encode_data_package(recipe_id: u8, recipe: &Recipe, values: &[Value]) -> Result<Vec<u8>> {
    let mut payload = vec![recipe_id];
    payload.extend(encode_values(recipe, values)?);
    Ok(payload)
}

/// Wait for the reply of type `expected`, logging text messages and dropping
/// stray data packages that arrive in between
async fn expect_reply(connector: &Connector, expected: MessageType, limit: Duration) -> Result<Vec<u8>> {
    loop {
        let frame = read_frame(connector, limit).await?;
        match frame.kind {
            kind if kind == expected => return Ok(frame.payload),
            MessageType::TextMessage => log_text_message(&decode_text_message(&frame.payload)),
            MessageType::DataPackage => debug!("Dropping data package received during handshake"),
            other => {
                return Err(URError::Protocol(format!("Expected {:?}, received {:?}", expected, other)));
            }
        }
    }
}

fn accepted(payload: &[u8]) -> bool {
    payload.first().copied() == Some(1)
}

pub async fn request_protocol_version(connector: &Connector, version: u16, limit: Duration) -> Result<()> {
    send_frame(connector, MessageType::RequestProtocolVersion, &version.to_be_bytes(), limit).await?;
    let reply = expect_reply(connector, MessageType::RequestProtocolVersion, limit).await?;
    if accepted(&reply) {
        Ok(())
    } else {
        Err(URError::Protocol(format!("Controller refused protocol version {}", version)))
    }
}

pub async fn get_controller_version(connector: &Connector, limit: Duration) -> Result<ControllerVersion> {
    send_frame(connector, MessageType::GetUrControlVersion, &[], limit).await?;
    let reply = expect_reply(connector, MessageType::GetUrControlVersion, limit).await?;
    decode_controller_version(&reply)
}

pub async fn setup_outputs(connector: &Connector, recipe: &Recipe, frequency: f64, limit: Duration) -> Result<u8> {
    check_transportable(recipe)?;
    let mut payload = frequency.to_be_bytes().to_vec();
    payload.extend_from_slice(recipe.names().join(",").as_bytes());
    send_frame(connector, MessageType::ControlPackageSetupOutputs, &payload, limit).await?;
    let reply = expect_reply(connector, MessageType::ControlPackageSetupOutputs, limit).await?;
    parse_setup_reply(recipe, &reply)
}

pub async fn setup_inputs(connector: &Connector, recipe: &Recipe, limit: Duration) -> Result<u8> {
    check_transportable(recipe)?;
    let payload = recipe.names().join(",");
    send_frame(connector, MessageType::ControlPackageSetupInputs, payload.as_bytes(), limit).await?;
    let reply = expect_reply(connector, MessageType::ControlPackageSetupInputs, limit).await?;
    parse_setup_reply(recipe, &reply)
}

pub async fn start(connector: &Connector, limit: Duration) -> Result<()> {
    send_frame(connector, MessageType::ControlPackageStart, &[], limit).await?;
    let reply = expect_reply(connector, MessageType::ControlPackageStart, limit).await?;
    if accepted(&reply) {
        Ok(())
    } else {
        Err(URError::Protocol("Controller refused to start synchronization".to_string()))
    }
}

pub async fn pause(connector: &Connector, limit: Duration) -> Result<()> {
    send_frame(connector, MessageType::ControlPackagePause, &[], limit).await?;
    let reply = expect_reply(connector, MessageType::ControlPackagePause, limit).await?;
    if accepted(&reply) {
        Ok(())
    } else {
        Err(URError::Protocol("Controller refused to pause synchronization".to_string()))
    }
}

/// Full handshake: protocol version, controller version, output and input setup, start
pub async fn negotiate(
    connector: &Connector,
    output: &Recipe,
    input: Option<&Recipe>,
    protocol_version: u16,
    frequency: f64,
    limit: Duration,
) -> Result<Negotiated> {
    request_protocol_version(connector, protocol_version, limit).await?;

    let controller_version = match get_controller_version(connector, limit).await {
        Ok(version) => {
            info!(version = %version, "Controller version");
            Some(version)
        }
        Err(URError::Protocol(e)) => {
            warn!("Could not decode controller version: {}", e);
            None
        }
        Err(e) => return Err(e),
    };

    let output_id = setup_outputs(connector, output, frequency, limit).await?;
    debug!(recipe_id = output_id, fields = output.len(), "Output recipe accepted");

    let input_id = match input {
        Some(recipe) if !recipe.is_empty() => {
            let id = setup_inputs(connector, recipe, limit).await?;
            debug!(recipe_id = id, fields = recipe.len(), "Input recipe accepted");
            Some(id)
        }
        _ => None,
    };

    start(connector, limit).await?;
    info!(output_id, ?input_id, frequency, "RTDE synchronization started");

    Ok(Negotiated {
        output_id,
        input_id,
        controller_version,
    })
}
