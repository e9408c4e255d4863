//! Versioned machine snapshot tree.
//!
//! A snapshot holds one [`DeviceState`] per device, matched by name on
//! restore. Registers are stored as text. Memory blocks use a compacting
//! encoding: a run of at least [`COUNT_LIMIT`] equal bytes becomes one
//! `(count, value)` record and everything else is emitted as literal hex.

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Write as _};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const SNAPSHOT_VERSION: &str = "2.0";

/// Shortest run of equal bytes that is stored as a counted record
pub const COUNT_LIMIT: usize = 7;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    Version { expected: String, found: String },
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error("bad hex data '{0}'")]
    BadHex(String),
    #[error("bad repeat count {0}")]
    BadCount(usize),
    #[error("block '{block}' overflows: {needed} bytes for a {size}-byte block")]
    BlockOverflow {
        block: String,
        needed: usize,
        size: usize,
    },
    #[error("register '{0}' missing from device '{1}'")]
    MissingRegister(String, String),
    #[error("register '{register}' has bad value '{value}'")]
    BadRegister { register: String, value: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub hardware: String,
    pub devices: Vec<DeviceState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registers: Vec<RegisterState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<BlockState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterState {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub name: String,
    pub bytes: Vec<BytesRecord>,
}

/// One element of an encoded block: literal hex, or `count` repetitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytesRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub data: String,
}

impl BytesRecord {
    pub fn literal(data: String) -> Self {
        BytesRecord { count: None, data }
    }

    pub fn run(count: usize, value: u8) -> Self {
        BytesRecord {
            count: Some(count),
            data: format!("{:02x}", value),
        }
    }
}

impl Snapshot {
    pub fn new(hardware: &str) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            hardware: hardware.to_string(),
            devices: Vec::new(),
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceState> {
        self.devices.iter().find(|device| device.name == name)
    }

    pub fn check_version(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            debug!("snapshot version mismatch: {}", self.version);
            return Err(SnapshotError::Version {
                expected: SNAPSHOT_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and version-check a snapshot
    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_json::from_str(text)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let text = fs::read_to_string(path)?;
        Snapshot::from_json(&text)
    }
}

impl DeviceState {
    pub fn new(name: &str) -> Self {
        DeviceState {
            name: name.to_string(),
            ..DeviceState::default()
        }
    }

    /// Store a register, replacing an earlier value of the same name
    pub fn put<T: Display>(&mut self, name: &str, value: T) {
        let value = value.to_string();
        match self.registers.iter_mut().find(|r| r.name == name) {
            Some(register) => register.value = value,
            None => self.registers.push(RegisterState {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.registers
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.value.as_str())
    }

    /// Parse a register that must be present
    pub fn read<T: FromStr>(&self, name: &str) -> Result<T, SnapshotError> {
        let value = self
            .get(name)
            .ok_or_else(|| SnapshotError::MissingRegister(name.to_string(), self.name.clone()))?;
        value.parse().map_err(|_| SnapshotError::BadRegister {
            register: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a register into `target` if present; absent registers leave it alone
    pub fn restore<T: FromStr>(&self, name: &str, target: &mut T) -> Result<(), SnapshotError> {
        if self.get(name).is_some() {
            *target = self.read(name)?;
        }
        Ok(())
    }

    pub fn put_block(&mut self, name: &str, data: &[u8]) {
        self.blocks.retain(|block| block.name != name);
        self.blocks.push(BlockState {
            name: name.to_string(),
            bytes: encode_block(data),
        });
    }

    pub fn block(&self, name: &str) -> Option<&BlockState> {
        self.blocks.iter().find(|block| block.name == name)
    }

    /// Decode block `name` into `target` if present
    pub fn restore_block(&self, name: &str, target: &mut [u8]) -> Result<(), SnapshotError> {
        match self.block(name) {
            Some(block) => decode_block(block, target),
            None => Ok(()),
        }
    }
}

/// Compact `data` into literal and counted records
pub fn encode_block(data: &[u8]) -> Vec<BytesRecord> {
    let mut records = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < data.len() {
        let value = data[i];
        let run = data[i..].iter().take_while(|&&b| b == value).count();
        if run >= COUNT_LIMIT {
            if !literal.is_empty() {
                records.push(BytesRecord::literal(std::mem::take(&mut literal)));
            }
            trace!("run of {} x {:02x}", run, value);
            records.push(BytesRecord::run(run, value));
            i += run;
        } else {
            let _ = write!(literal, "{:02x}", value);
            i += 1;
        }
    }
    if !literal.is_empty() {
        records.push(BytesRecord::literal(literal));
    }
    records
}

fn parse_hex(text: &str) -> Result<Vec<u8>, SnapshotError> {
    let text = text.trim();
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(SnapshotError::BadHex(text.to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| SnapshotError::BadHex(text.to_string()))
        })
        .collect()
}

/// Expand `block` into `target` starting at offset 0.
/// Nothing is written unless the whole block decodes.
pub fn decode_block(block: &BlockState, target: &mut [u8]) -> Result<(), SnapshotError> {
    let mut scratch = target.to_vec();
    let mut position = 0;

    for record in &block.bytes {
        let count = record.count.unwrap_or(1);
        if count == 0 {
            return Err(SnapshotError::BadCount(count));
        }
        let bytes = parse_hex(&record.data)?;
        if bytes.is_empty() && record.count.is_some() {
            return Err(SnapshotError::Malformed(format!(
                "block '{}' repeats an empty record {} times",
                block.name, count
            )));
        }
        let needed = bytes
            .len()
            .checked_mul(count)
            .and_then(|length| length.checked_add(position))
            .unwrap_or(usize::MAX);
        if needed > scratch.len() {
            return Err(SnapshotError::BlockOverflow {
                block: block.name.clone(),
                needed,
                size: scratch.len(),
            });
        }
        for _ in 0..count {
            scratch[position..position + bytes.len()].copy_from_slice(&bytes);
            position += bytes.len();
        }
    }

    target.copy_from_slice(&scratch);
    trace!("block '{}' restored, {} bytes", block.name, position);
    Ok(())
}
