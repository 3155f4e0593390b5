//! Register codec
//!
//! Pure functions mapping bit-packed RTDE register words to booleans and back.
//! Nothing in here holds state; every view is recomputed from the latest
//! snapshot.

use crate::{Result, URError};
use serde::Serialize;

/// Decode the low `width` bits of `value`. Bit `i` is true iff `(value >> i) & 1 == 1`.
pub fn decode_bitfield(value: u64, width: usize) -> Vec<bool> {
    (0..width.min(64)).map(|i| bit_at(value, i as u32)).collect()
}

/// Decode a 64 bit logical register split across two 32 bit words
pub fn decode_split_bitfield(low: u32, high: u32) -> [bool; 64] {
    let mut bits = [false; 64];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = if i < 32 {
            bit_at(low as u64, i as u32)
        } else {
            bit_at(high as u64, (i - 32) as u32)
        };
    }
    bits
}

/// Single bit of a register word. Indices past 63 read as false.
pub fn bit_at(value: u64, index: u32) -> bool {
    index < 64 && (value >> index) & 1 == 1
}

/// Return `value` with bit `index` set
pub fn set_bit(value: u64, index: u32) -> u64 {
    if index < 64 {
        value | (1u64 << index)
    } else {
        value
    }
}

/// Mask/value pair written to a setpoint's mask and value registers.
///
/// The controller applies only the bits selected by `mask`, so a write never
/// disturbs the other outputs sharing the word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskedBits {
    pub mask: u64,
    pub value: u64,
}

impl MaskedBits {
    /// What the controller does with the pair: untouched bits keep their old state
    pub fn apply(&self, register: u64) -> u64 {
        (register & !self.mask) | (self.value & self.mask)
    }

    /// Merge two writes into one pair; later bits win
    pub fn merge(&self, other: &MaskedBits) -> MaskedBits {
        MaskedBits {
            mask: self.mask | other.mask,
            value: (self.value & !other.mask) | (other.value & other.mask),
        }
    }
}

/// Build the mask/value pair that drives bit `index` to `on`
pub fn encode_mask_and_value(index: u32, on: bool) -> Result<MaskedBits> {
    if index >= 64 {
        return Err(URError::InvalidState(format!("bit index {} out of range 0..64", index)));
    }
    let mask = 1u64 << index;
    Ok(MaskedBits {
        mask,
        value: if on { mask } else { 0 },
    })
}

/// Digital I/O group in the controller's 64 bit digital I/O word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoGroup {
    Standard,
    Configurable,
    Tool,
}

impl IoGroup {
    /// (first physical bit, number of channels) of the group
    const fn layout(self) -> (u32, u32) {
        match self {
            IoGroup::Standard => (0, 8),
            IoGroup::Configurable => (8, 8),
            IoGroup::Tool => (16, 2),
        }
    }

    pub fn channels(self) -> u32 {
        self.layout().1
    }

    /// Setpoint (mask field, value field) that drives outputs of this group
    pub fn output_fields(self) -> (&'static str, &'static str) {
        match self {
            IoGroup::Standard => ("standard_digital_output_mask", "standard_digital_output"),
            IoGroup::Configurable => ("configurable_digital_output_mask", "configurable_digital_output"),
            IoGroup::Tool => ("tool_digital_output_mask", "tool_digital_output"),
        }
    }
}

/// One digital I/O channel, addressed by group and channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DigitalIo {
    pub group: IoGroup,
    pub channel: u32,
}

impl DigitalIo {
    pub fn new(group: IoGroup, channel: u32) -> Result<Self> {
        if channel >= group.channels() {
            return Err(URError::InvalidState(format!(
                "{:?} digital I/O has channels 0..{}, got {}",
                group,
                group.channels(),
                channel
            )));
        }
        Ok(Self { group, channel })
    }

    pub fn standard(channel: u32) -> Result<Self> {
        Self::new(IoGroup::Standard, channel)
    }

    pub fn configurable(channel: u32) -> Result<Self> {
        Self::new(IoGroup::Configurable, channel)
    }

    pub fn tool(channel: u32) -> Result<Self> {
        Self::new(IoGroup::Tool, channel)
    }

    /// Physical bit in `actual_digital_input_bits` / `actual_digital_output_bits`
    pub fn bit(&self) -> u32 {
        self.group.layout().0 + self.channel
    }

    /// Read this channel from a digital I/O word
    pub fn read(&self, word: u64) -> bool {
        bit_at(word, self.bit())
    }
}

/// Decoded `safety_status_bits`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SafetyStatus {
    pub normal_mode: bool,
    pub reduced_mode: bool,
    pub protective_stopped: bool,
    pub recovery_mode: bool,
    pub safeguard_stopped: bool,
    pub system_emergency_stopped: bool,
    pub robot_emergency_stopped: bool,
    pub emergency_stopped: bool,
    pub violation: bool,
    pub fault: bool,
    pub stopped_due_to_safety: bool,
}

impl SafetyStatus {
    pub const STOPPED_DUE_TO_SAFETY: u32 = 1 << 10;

    pub fn from_bits(bits: u32) -> Self {
        let bit = |i| bit_at(bits as u64, i);
        Self {
            normal_mode: bit(0),
            reduced_mode: bit(1),
            protective_stopped: bit(2),
            recovery_mode: bit(3),
            safeguard_stopped: bit(4),
            system_emergency_stopped: bit(5),
            robot_emergency_stopped: bit(6),
            emergency_stopped: bit(7),
            violation: bit(8),
            fault: bit(9),
            stopped_due_to_safety: bit(10),
        }
    }
}

/// Decoded `robot_status_bits`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RobotStatusBits {
    pub power_on: bool,
    pub program_running: bool,
    pub teach_button_pressed: bool,
    pub power_button_pressed: bool,
}

impl RobotStatusBits {
    pub const PROGRAM_RUNNING: u32 = 1 << 1;

    pub fn from_bits(bits: u32) -> Self {
        let bit = |i| bit_at(bits as u64, i);
        Self {
            power_on: bit(0),
            program_running: bit(1),
            teach_button_pressed: bit(2),
            power_button_pressed: bit(3),
        }
    }
}

/// Direction of a register bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBank {
    Input,
    Output,
}

impl RegisterBank {
    fn prefix(self) -> &'static str {
        match self {
            RegisterBank::Input => "input",
            RegisterBank::Output => "output",
        }
    }

    /// Word field carrying bit registers 0-31 or 32-63
    pub fn bit_word_field(self, index: u32) -> Option<String> {
        match index {
            0..=31 => Some(format!("{}_bit_registers0_to_31", self.prefix())),
            32..=63 => Some(format!("{}_bit_registers32_to_63", self.prefix())),
            _ => None,
        }
    }

    /// Per-index BOOL field for bit registers 64-127
    pub fn bit_field(self, index: u32) -> Option<String> {
        (64..128).contains(&index).then(|| format!("{}_bit_register_{}", self.prefix(), index))
    }

    pub fn int_field(self, index: u32) -> Option<String> {
        (index < 48).then(|| format!("{}_int_register_{}", self.prefix(), index))
    }

    pub fn double_field(self, index: u32) -> Option<String> {
        (index < 48).then(|| format!("{}_double_register_{}", self.prefix(), index))
    }
}

/// Split a numbered register field name such as `input_int_register_5` into (stem, index)
pub fn parse_numbered_field(name: &str) -> Option<(&str, u32)> {
    let (stem, digits) = name.rsplit_once('_')?;
    if !stem.ends_with("_register") {
        return None;
    }
    digits.parse().ok().map(|index| (stem, index))
}
