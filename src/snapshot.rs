//! Telemetry snapshots and the setpoint buffer
//!
//! Both are vectors aligned with a negotiated recipe. Names are resolved
//! through the recipe's lookup table, so a field that was never negotiated can
//! neither be read from a snapshot nor written to the buffer.

use crate::recipe::{Recipe, TypeTag, Value};
use crate::registers::{
    bit_at, encode_mask_and_value, DigitalIo, MaskedBits, RegisterBank, RobotStatusBits, SafetyStatus,
};
use crate::{Result, URError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TIMESTAMP: &str = "timestamp";
pub const ACTUAL_Q: &str = "actual_q";
pub const ACTUAL_TCP_POSE: &str = "actual_TCP_pose";
pub const ROBOT_MODE: &str = "robot_mode";
pub const SAFETY_MODE: &str = "safety_mode";
pub const RUNTIME_STATE: &str = "runtime_state";
pub const ROBOT_STATUS_BITS: &str = "robot_status_bits";
pub const SAFETY_STATUS_BITS: &str = "safety_status_bits";
pub const DIGITAL_INPUT_BITS: &str = "actual_digital_input_bits";
pub const DIGITAL_OUTPUT_BITS: &str = "actual_digital_output_bits";
pub const SPEED_SLIDER_MASK: &str = "speed_slider_mask";
pub const SPEED_SLIDER_FRACTION: &str = "speed_slider_fraction";

/// One decoded telemetry sample
#[derive(Debug, Clone)]
pub struct Snapshot {
    recipe: Arc<Recipe>,
    values: Vec<Value>,
    /// Monotonic per session; 0 means nothing has been received yet
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    /// Set when the sample is a repeat of an older one because nothing new arrived in time
    pub stale: bool,
}

impl Snapshot {
    /// Placeholder before the first data package
    pub fn empty(recipe: Arc<Recipe>) -> Self {
        Self {
            recipe,
            values: Vec::new(),
            sequence: 0,
            received_at: Utc::now(),
            stale: false,
        }
    }

    pub fn from_values(recipe: Arc<Recipe>, values: Vec<Value>, sequence: u64) -> Result<Self> {
        if values.len() != recipe.len() {
            return Err(URError::Protocol(format!(
                "{} values for an output recipe of {} fields",
                values.len(),
                recipe.len()
            )));
        }
        Ok(Self {
            recipe,
            values,
            sequence,
            received_at: Utc::now(),
            stale: false,
        })
    }

    /// Copy of this snapshot marked stale
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    pub fn recipe(&self) -> &Arc<Recipe> {
        &self.recipe
    }

    pub fn has_data(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.recipe.slot(name).and_then(|slot| self.values.get(slot))
    }

    /// All fields by name, for JSON output
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.recipe
            .fields()
            .iter()
            .zip(&self.values)
            .map(|(field, value)| (field.name.clone(), value.clone()))
            .collect()
    }

    pub fn double(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Unsigned integer fields widened to u64
    pub fn word(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            Value::Uint8(v) => Some(*v as u64),
            Value::Uint32(v) => Some(*v as u64),
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name)?.as_bool()
    }

    pub fn vector6d(&self, name: &str) -> Option<[f64; 6]> {
        match self.get(name)? {
            Value::Vector6d(v) => Some(*v),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.double(TIMESTAMP)
    }

    pub fn actual_q(&self) -> Option<[f64; 6]> {
        self.vector6d(ACTUAL_Q)
    }

    pub fn actual_tcp_pose(&self) -> Option<[f64; 6]> {
        self.vector6d(ACTUAL_TCP_POSE)
    }

    pub fn robot_mode(&self) -> Option<i32> {
        self.int(ROBOT_MODE)
    }

    pub fn safety_mode(&self) -> Option<i32> {
        self.int(SAFETY_MODE)
    }

    pub fn runtime_state(&self) -> Option<u32> {
        self.word(RUNTIME_STATE).map(|v| v as u32)
    }

    pub fn safety_status(&self) -> Option<SafetyStatus> {
        self.word(SAFETY_STATUS_BITS).map(|bits| SafetyStatus::from_bits(bits as u32))
    }

    pub fn robot_status(&self) -> Option<RobotStatusBits> {
        self.word(ROBOT_STATUS_BITS).map(|bits| RobotStatusBits::from_bits(bits as u32))
    }

    pub fn digital_input(&self, io: DigitalIo) -> Option<bool> {
        self.word(DIGITAL_INPUT_BITS).map(|word| io.read(word))
    }

    pub fn digital_output(&self, io: DigitalIo) -> Option<bool> {
        self.word(DIGITAL_OUTPUT_BITS).map(|word| io.read(word))
    }

    /// Bit register `index` of `bank`, `None` if its field was not negotiated
    pub fn bit_register(&self, bank: RegisterBank, index: u32) -> Option<bool> {
        match index {
            0..=63 => {
                let field = bank.bit_word_field(index)?;
                self.word(&field).map(|word| bit_at(word, index % 32))
            }
            64..=127 => self.flag(&bank.bit_field(index)?),
            _ => None,
        }
    }

    pub fn output_bit(&self, index: u32) -> Option<bool> {
        self.bit_register(RegisterBank::Output, index)
    }

    pub fn int_register(&self, bank: RegisterBank, index: u32) -> Option<i32> {
        self.int(&bank.int_field(index)?)
    }

    pub fn double_register(&self, bank: RegisterBank, index: u32) -> Option<f64> {
        self.double(&bank.double_field(index)?)
    }

    pub fn bit_registers(&self, bank: RegisterBank) -> BitRegisterView {
        let mut bits = [None; 128];
        for (index, bit) in bits.iter_mut().enumerate() {
            *bit = self.bit_register(bank, index as u32);
        }
        BitRegisterView { bits }
    }
}

/// All 128 bit registers of one bank as seen in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRegisterView {
    bits: [Option<bool>; 128],
}

impl BitRegisterView {
    pub fn get(&self, index: u32) -> Option<bool> {
        self.bits.get(index as usize).copied().flatten()
    }

    /// Indices that read as true
    pub fn set_indices(&self) -> Vec<u32> {
        (0..128u32).filter(|i| self.get(*i) == Some(true)).collect()
    }
}

/// Values sent to the controller in the next push, aligned with the input recipe
#[derive(Debug, Clone)]
pub struct SetpointBuffer {
    recipe: Arc<Recipe>,
    values: Vec<Value>,
}

impl SetpointBuffer {
    pub fn new(recipe: Arc<Recipe>) -> Self {
        let values = recipe.default_values();
        Self { recipe, values }
    }

    pub fn recipe(&self) -> &Arc<Recipe> {
        &self.recipe
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.recipe.slot(name).and_then(|slot| self.values.get(slot))
    }

    /// Write one field. Unknown names and wrong types are refused.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let slot = self
            .recipe
            .slot(name)
            .ok_or_else(|| URError::UnknownField(name.to_string()))?;
        let expected = self.recipe.fields()[slot].kind;
        if value.type_tag() != expected {
            return Err(URError::TypeMismatch {
                field: name.to_string(),
                expected: expected.to_string(),
                actual: value.type_tag().to_string(),
            });
        }
        self.values[slot] = value;
        Ok(())
    }

    /// Write an unsigned integer into whatever unsigned type the field was declared with
    fn set_word(&mut self, name: &str, word: u64) -> Result<()> {
        let kind = self
            .recipe
            .type_of(name)
            .ok_or_else(|| URError::UnknownField(name.to_string()))?;
        let value = match kind {
            TypeTag::Uint8 => Value::Uint8(word as u8),
            TypeTag::Uint32 => Value::Uint32(word as u32),
            TypeTag::Uint64 => Value::Uint64(word),
            other => {
                return Err(URError::TypeMismatch {
                    field: name.to_string(),
                    expected: "unsigned integer".to_string(),
                    actual: other.to_string(),
                });
            }
        };
        self.set(name, value)
    }

    fn word(&self, name: &str) -> u64 {
        self.get(name).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn set_input_bit_register(&mut self, index: u32, on: bool) -> Result<()> {
        match index {
            0..=63 => {
                let field = RegisterBank::Input
                    .bit_word_field(index)
                    .ok_or_else(|| URError::InvalidState(format!("bit register {} out of range", index)))?;
                let write = encode_mask_and_value(index % 32, on)?;
                let word = write.apply(self.word(&field));
                self.set_word(&field, word)
            }
            64..=127 => {
                let field = RegisterBank::Input
                    .bit_field(index)
                    .ok_or_else(|| URError::InvalidState(format!("bit register {} out of range", index)))?;
                self.set(&field, Value::Bool(on))
            }
            _ => Err(URError::InvalidState(format!("bit register {} out of range 0..128", index))),
        }
    }

    pub fn set_int_register(&mut self, index: u32, value: i32) -> Result<()> {
        let field = RegisterBank::Input
            .int_field(index)
            .ok_or_else(|| URError::InvalidState(format!("int register {} out of range 0..48", index)))?;
        self.set(&field, Value::Int32(value))
    }

    pub fn set_double_register(&mut self, index: u32, value: f64) -> Result<()> {
        let field = RegisterBank::Input
            .double_field(index)
            .ok_or_else(|| URError::InvalidState(format!("double register {} out of range 0..48", index)))?;
        self.set(&field, Value::Double(value))
    }

    /// Drive one digital output through its group's mask/value pair.
    /// Bits already selected by earlier writes stay selected.
    pub fn set_digital_output(&mut self, io: DigitalIo, on: bool) -> Result<()> {
        let (mask_field, value_field) = io.group.output_fields();
        let current = MaskedBits {
            mask: self.word(mask_field),
            value: self.word(value_field),
        };
        let merged = current.merge(&encode_mask_and_value(io.channel, on)?);
        self.set_word(mask_field, merged.mask)?;
        self.set_word(value_field, merged.value)
    }

    /// Forget every pending digital output write of `io`'s group
    pub fn clear_digital_outputs(&mut self, io: DigitalIo) -> Result<()> {
        let (mask_field, value_field) = io.group.output_fields();
        self.set_word(mask_field, 0)?;
        self.set_word(value_field, 0)
    }

    /// Set the speed slider to `fraction` (clamped to 0..=1)
    pub fn set_speed_slider(&mut self, fraction: f64) -> Result<()> {
        self.set_word(SPEED_SLIDER_MASK, 1)?;
        self.set(SPEED_SLIDER_FRACTION, Value::Double(fraction.clamp(0.0, 1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::IoGroup;

    fn output_recipe() -> Arc<Recipe> {
        Arc::new(
            Recipe::from_pairs(&[
                ("timestamp", TypeTag::Double),
                ("actual_q", TypeTag::Vector6d),
                ("robot_status_bits", TypeTag::Uint32),
                ("safety_status_bits", TypeTag::Uint32),
                ("output_bit_registers0_to_31", TypeTag::Uint32),
                ("output_bit_registers32_to_63", TypeTag::Uint32),
                ("output_bit_register_70", TypeTag::Bool),
                ("actual_digital_output_bits", TypeTag::Uint64),
            ])
            .unwrap(),
        )
    }

    fn input_recipe() -> Arc<Recipe> {
        Arc::new(
            Recipe::from_pairs(&[
                ("input_bit_registers0_to_31", TypeTag::Uint32),
                ("input_bit_register_64", TypeTag::Bool),
                ("input_int_register_0", TypeTag::Int32),
                ("input_double_register_3", TypeTag::Double),
                ("standard_digital_output_mask", TypeTag::Uint8),
                ("standard_digital_output", TypeTag::Uint8),
                ("speed_slider_mask", TypeTag::Uint32),
                ("speed_slider_fraction", TypeTag::Double),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_snapshot_accessors() {
        let snapshot = Snapshot::from_values(
            output_recipe(),
            vec![
                Value::Double(3.5),
                Value::Vector6d([1.0; 6]),
                Value::Uint32(RobotStatusBits::PROGRAM_RUNNING),
                Value::Uint32(SafetyStatus::STOPPED_DUE_TO_SAFETY),
                Value::Uint32(0b11),
                Value::Uint32(1 << 4),
                Value::Bool(true),
                Value::Uint64(1 << 17),
            ],
            1,
        )
        .unwrap();

        assert_eq!(snapshot.timestamp(), Some(3.5));
        assert_eq!(snapshot.actual_q(), Some([1.0; 6]));
        assert!(snapshot.robot_status().unwrap().program_running);
        assert!(snapshot.safety_status().unwrap().stopped_due_to_safety);
        assert_eq!(snapshot.output_bit(0), Some(true));
        assert_eq!(snapshot.output_bit(1), Some(true));
        assert_eq!(snapshot.output_bit(2), Some(false));
        assert_eq!(snapshot.output_bit(36), Some(true));
        assert_eq!(snapshot.output_bit(70), Some(true));
        assert_eq!(snapshot.output_bit(71), None);
        assert_eq!(snapshot.digital_output(DigitalIo::tool(1).unwrap()), Some(true));
        assert_eq!(snapshot.robot_mode(), None);

        let view = snapshot.bit_registers(RegisterBank::Output);
        assert_eq!(view.set_indices(), vec![0, 1, 36, 70]);
    }

    #[test]
    fn test_snapshot_never_exposes_unnegotiated_fields() {
        let snapshot = Snapshot::empty(output_recipe());
        assert!(!snapshot.has_data());
        assert_eq!(snapshot.timestamp(), None);
        assert!(snapshot.get("actual_TCP_pose").is_none());
        assert!(Snapshot::from_values(output_recipe(), vec![Value::Double(1.0)], 1).is_err());
    }

    #[test]
    fn test_setpoint_lookup_boundary() {
        let mut buffer = SetpointBuffer::new(input_recipe());
        assert!(matches!(
            buffer.set("input_int_register_1", Value::Int32(1)),
            Err(URError::UnknownField(_))
        ));
        assert!(matches!(
            buffer.set("input_int_register_0", Value::Double(1.0)),
            Err(URError::TypeMismatch { .. })
        ));
        buffer.set_int_register(0, 42).unwrap();
        buffer.set_double_register(3, 0.5).unwrap();
        assert_eq!(buffer.get("input_int_register_0"), Some(&Value::Int32(42)));
        assert_eq!(buffer.get("input_double_register_3"), Some(&Value::Double(0.5)));
        assert!(buffer.set_double_register(48, 0.5).is_err());
    }

    #[test]
    fn test_input_bit_registers() {
        let mut buffer = SetpointBuffer::new(input_recipe());
        buffer.set_input_bit_register(3, true).unwrap();
        buffer.set_input_bit_register(5, true).unwrap();
        buffer.set_input_bit_register(3, false).unwrap();
        assert_eq!(buffer.get("input_bit_registers0_to_31"), Some(&Value::Uint32(1 << 5)));

        buffer.set_input_bit_register(64, true).unwrap();
        assert_eq!(buffer.get("input_bit_register_64"), Some(&Value::Bool(true)));
        assert!(matches!(buffer.set_input_bit_register(40, true), Err(URError::UnknownField(_))));
        assert!(buffer.set_input_bit_register(128, true).is_err());
    }

    #[test]
    fn test_digital_outputs_merge_masks() {
        let mut buffer = SetpointBuffer::new(input_recipe());
        buffer.set_digital_output(DigitalIo::standard(1).unwrap(), true).unwrap();
        buffer.set_digital_output(DigitalIo::standard(4).unwrap(), false).unwrap();
        assert_eq!(buffer.get("standard_digital_output_mask"), Some(&Value::Uint8(0b1_0010)));
        assert_eq!(buffer.get("standard_digital_output"), Some(&Value::Uint8(0b10)));

        let tool = DigitalIo::new(IoGroup::Tool, 0).unwrap();
        assert!(matches!(buffer.set_digital_output(tool, true), Err(URError::UnknownField(_))));

        buffer.clear_digital_outputs(DigitalIo::standard(0).unwrap()).unwrap();
        assert_eq!(buffer.get("standard_digital_output_mask"), Some(&Value::Uint8(0)));
    }

    #[test]
    fn test_speed_slider() {
        let mut buffer = SetpointBuffer::new(input_recipe());
        buffer.set_speed_slider(1.7).unwrap();
        assert_eq!(buffer.get("speed_slider_mask"), Some(&Value::Uint32(1)));
        assert_eq!(buffer.get("speed_slider_fraction"), Some(&Value::Double(1.0)));
    }
}
