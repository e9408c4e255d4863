//! # JSON Machine Configuration
//!
//! Machines are described in JSON and assembled by [`MachineFactory`],
//! which keeps a registry of device constructors keyed by type name.
//!
//! ## Configuration File Format
//!
//! ```json
//! {
//!   "name": "Trainer",
//!   "cpu": "i8080",
//!   "clock_hz": 2000000,
//!   "tick_ms": 10,
//!   "memory": {"start_rom": 0, "start_ram": 8},
//!   "program": {"origin": 0, "hex": "3e05d31076"},
//!   "devices": [
//!     {"type": "output_latch", "name": "LEDS"},
//!     {"type": "down_counter", "name": "TIMER"}
//!   ],
//!   "nodes": [["LEDS.Q0", "TIMER.CLK"]],
//!   "ports": [{"device": "LEDS", "base": 16, "direction": "output"}]
//! }
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use retro_sim::system_config::MachineFactory;
//!
//! let factory = MachineFactory::new();
//! let mut machine = factory.build_from_file("machines/trainer.json").expect("bad machine");
//! machine.reset();
//! machine.run_tick();
//! ```

use crate::component::Device;
use crate::components::clock::{FrequencyDivider, FrequencyGenerator};
use crate::components::cpu::{Intel8080, Processor, ZilogZ80};
use crate::components::io::{Intel8255, OutputLatch};
use crate::components::logic::{FixedPin, Gate};
use crate::components::memory::{MappedMemory, SimpleMemory};
use crate::components::timer::DownCounter;
use crate::connection::WiringError;
use crate::hardware::Hardware;
use crate::pin::Edge;
use crate::ports::{PortDirection, PORT_COUNT};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Name given to the processor of every configured machine
pub const CPU_NAME: &str = "CPU";

/// Name given to the main memory of every configured machine
pub const MEMORY_NAME: &str = "MEMORY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse machine config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read machine config: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("device '{device}': property '{property}' is missing")]
    MissingProperty { device: String, property: String },
    #[error("device '{device}': property '{property}' is invalid")]
    BadProperty { device: String, property: String },
    #[error("bad pin reference '{0}', expected DEVICE.PIN")]
    BadPinReference(String),
    #[error("ports {base}..{base}+{span} of '{device}' exceed the port space")]
    PortRange { device: String, base: u8, span: u8 },
    #[error("memory boundaries beyond 64 KiB: rom {start_rom}, ram {start_ram}")]
    BadMemory { start_rom: usize, start_ram: usize },
    #[error("bad program image: {0}")]
    BadProgram(String),
    #[error(transparent)]
    Wiring(#[from] WiringError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuKind {
    #[serde(rename = "i8080")]
    I8080,
    #[serde(rename = "z80")]
    Z80,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cpu: CpuKind,
    #[serde(default = "default_clock_hz")]
    pub clock_hz: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_speed_multiplier")]
    pub speed_multiplier: f64,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub program: Option<ProgramConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub nodes: Vec<Vec<String>>,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

fn default_clock_hz() -> u64 {
    2_000_000
}

fn default_tick_ms() -> u64 {
    10
}

fn default_speed_multiplier() -> f64 {
    1.0
}

/// ROM window `[start_rom, start_ram)` in KiB; the default is all RAM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub start_rom: usize,
    pub start_ram: usize,
    /// Use a `MappedMemory` with an `ALL_RAM` control pin
    #[serde(default)]
    pub mapped: bool,
    /// Hex image shadowing the bottom of memory while `ALL_RAM` is low;
    /// implies `mapped`
    #[serde(default)]
    pub overlay: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            start_rom: 64,
            start_ram: 64,
            mapped: false,
            overlay: None,
        }
    }
}

/// Image loaded into memory before the first reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    #[serde(default)]
    pub origin: u16,
    pub hex: String,
}

impl ProgramConfig {
    pub fn bytes(&self) -> Result<Vec<u8>, ConfigError> {
        parse_image(&self.hex)
    }
}

/// Hex digits to bytes; whitespace between digits is ignored
pub fn parse_image(hex: &str) -> Result<Vec<u8>, ConfigError> {
    let text: String = hex.split_whitespace().collect();
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(ConfigError::BadProgram("odd number of hex digits".to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| ConfigError::BadProgram(format!("bad hex at offset {}", i)))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl DeviceConfig {
    fn bad(&self, property: &str) -> ConfigError {
        ConfigError::BadProperty {
            device: self.name.clone(),
            property: property.to_string(),
        }
    }

    /// Unsigned property, `default` when absent
    pub fn u64_or(&self, property: &str, default: u64) -> Result<u64, ConfigError> {
        match self.properties.get(property) {
            Some(value) => value.as_u64().ok_or_else(|| self.bad(property)),
            None => Ok(default),
        }
    }

    pub fn required_u64(&self, property: &str) -> Result<u64, ConfigError> {
        self.properties
            .get(property)
            .ok_or_else(|| ConfigError::MissingProperty {
                device: self.name.clone(),
                property: property.to_string(),
            })?
            .as_u64()
            .ok_or_else(|| self.bad(property))
    }

    /// Strictly positive property, `default` when absent
    pub fn positive_or(&self, property: &str, default: u64) -> Result<u64, ConfigError> {
        match self.u64_or(property, default)? {
            0 => Err(self.bad(property)),
            value => Ok(value),
        }
    }

    pub fn str_or<'a>(&'a self, property: &str, default: &'a str) -> Result<&'a str, ConfigError> {
        match self.properties.get(property) {
            Some(value) => value.as_str().ok_or_else(|| self.bad(property)),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub device: String,
    pub base: u8,
    #[serde(default = "default_span")]
    pub span: u8,
    #[serde(default = "default_direction")]
    pub direction: PortDirection,
}

fn default_span() -> u8 {
    1
}

fn default_direction() -> PortDirection {
    PortDirection::Both
}

impl MachineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        MachineConfig::from_json(&text)
    }

    /// Processor cycles executed per tick at the configured speed
    pub fn cycles_per_tick(&self) -> u64 {
        let cycles = self.clock_hz as f64 * self.tick_ms as f64 / 1000.0 * self.speed_multiplier;
        cycles.round().max(0.0) as u64
    }
}

/// Split `"DEVICE.PIN"` at its last dot
pub fn split_pin_reference(reference: &str) -> Result<(&str, &str), ConfigError> {
    match reference.rsplit_once('.') {
        Some((device, pin)) if !device.is_empty() && !pin.is_empty() => Ok((device, pin)),
        _ => Err(ConfigError::BadPinReference(reference.to_string())),
    }
}

pub type DeviceConstructor = fn(&DeviceConfig) -> Result<Box<dyn Device>, ConfigError>;

/// Builds [`Hardware`] from a [`MachineConfig`]
pub struct MachineFactory {
    registry: HashMap<String, DeviceConstructor>,
}

impl Default for MachineFactory {
    fn default() -> Self {
        MachineFactory::new()
    }
}

impl MachineFactory {
    pub fn new() -> Self {
        let mut factory = MachineFactory {
            registry: HashMap::new(),
        };
        factory.register_default_devices();
        factory
    }

    /// Add or replace the constructor for `kind`
    pub fn register(&mut self, kind: &str, constructor: DeviceConstructor) {
        self.registry.insert(kind.to_string(), constructor);
    }

    pub fn device_types(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.registry.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    fn register_default_devices(&mut self) {
        self.register("fixed_pin", |config| {
            let level = config.u64_or("level", 1)?;
            Ok(Box::new(FixedPin::new(&config.name, (level != 0) as u8)))
        });

        self.register("nand", |config| {
            let inputs = config.positive_or("inputs", 2)?;
            Ok(Box::new(Gate::nand(&config.name, inputs as usize)))
        });

        self.register("inverter", |config| Ok(Box::new(Gate::inverter(&config.name))));

        self.register("nor", |config| {
            let inputs = config.positive_or("inputs", 2)?;
            Ok(Box::new(Gate::nor(&config.name, inputs as usize)))
        });

        self.register("xnor", |config| {
            let inputs = config.positive_or("inputs", 2)?;
            Ok(Box::new(Gate::xnor(&config.name, inputs as usize)))
        });

        self.register("output_latch", |config| {
            Ok(Box::new(OutputLatch::new(&config.name)))
        });

        self.register("down_counter", |config| {
            Ok(Box::new(DownCounter::new(&config.name)))
        });

        self.register("frequency_generator", |config| {
            let off = config.required_u64("off")?;
            let on = config.required_u64("on")?;
            if off == 0 {
                return Err(config.bad("off"));
            }
            if on == 0 {
                return Err(config.bad("on"));
            }
            Ok(Box::new(FrequencyGenerator::new(&config.name, off, on)))
        });

        self.register("frequency_divider", |config| {
            let ratio = config.positive_or("ratio", 2)?;
            let ratio = u32::try_from(ratio).map_err(|_| config.bad("ratio"))?;
            let edge = match config.str_or("edge", "rising")? {
                "rising" => Edge::Rising,
                "falling" => Edge::Falling,
                _ => return Err(config.bad("edge")),
            };
            Ok(Box::new(FrequencyDivider::new(&config.name, ratio, edge)))
        });

        self.register("intel_8255", |config| {
            Ok(Box::new(Intel8255::new(&config.name)))
        });
    }

    fn build_memory(config: &MachineConfig) -> Result<Box<dyn Device>, ConfigError> {
        let MemoryConfig {
            start_rom,
            start_ram,
            mapped,
            ref overlay,
        } = config.memory;
        if start_rom > 64 || start_ram > 64 {
            return Err(ConfigError::BadMemory {
                start_rom,
                start_ram,
            });
        }
        let program = match &config.program {
            Some(program) => Some((program.origin, program.bytes()?)),
            None => None,
        };

        if mapped || overlay.is_some() {
            let mut memory = MappedMemory::new(MEMORY_NAME, start_rom, start_ram);
            if let Some(overlay) = overlay {
                let image = parse_image(overlay)?;
                if image.len() > 0x10000 {
                    return Err(ConfigError::BadProgram("overlay larger than 64 KiB".to_string()));
                }
                memory = memory.with_overlay(image);
            }
            if let Some((origin, bytes)) = program {
                memory.inner_mut().load(origin, &bytes);
            }
            Ok(Box::new(memory))
        } else {
            let mut memory = SimpleMemory::new(MEMORY_NAME, start_rom, start_ram);
            if let Some((origin, bytes)) = program {
                memory.load(origin, &bytes);
            }
            Ok(Box::new(memory))
        }
    }

    /// Assemble a machine. The result has not been reset yet.
    pub fn build(&self, config: &MachineConfig) -> Result<Hardware, ConfigError> {
        let processor: Box<dyn Processor> = match config.cpu {
            CpuKind::I8080 => Box::new(Intel8080::new(CPU_NAME)),
            CpuKind::Z80 => Box::new(ZilogZ80::new(CPU_NAME)),
        };
        let mut hardware = Hardware::new(&config.name, processor);
        hardware.add_memory(Self::build_memory(config)?);

        for device in &config.devices {
            let constructor = self
                .registry
                .get(&device.kind)
                .ok_or_else(|| ConfigError::UnknownDeviceType(device.kind.clone()))?;
            hardware.add_device(constructor(device)?);
        }

        for node in &config.nodes {
            let pins = node
                .iter()
                .map(|reference| split_pin_reference(reference))
                .collect::<Result<Vec<_>, _>>()?;
            hardware.connect(&pins)?;
        }

        for port in &config.ports {
            let element = hardware
                .device_id(&port.device)
                .ok_or_else(|| ConfigError::UnknownDevice(port.device.clone()))?;
            if port.span == 0 || port.base as usize + port.span as usize > PORT_COUNT {
                return Err(ConfigError::PortRange {
                    device: port.device.clone(),
                    base: port.base,
                    span: port.span,
                });
            }
            hardware.map_ports(element, port.base, port.span, port.direction);
        }

        hardware.set_cycles_per_tick(config.cycles_per_tick());
        debug!(
            "built machine '{}' with {} devices, {} cycles per tick",
            config.name,
            hardware.members().len(),
            hardware.cycles_per_tick()
        );
        Ok(hardware)
    }

    pub fn build_from_json(&self, text: &str) -> Result<Hardware, ConfigError> {
        self.build(&MachineConfig::from_json(text)?)
    }

    pub fn build_from_file<P: AsRef<Path>>(&self, path: P) -> Result<Hardware, ConfigError> {
        self.build(&MachineConfig::from_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DeviceState;

    const TRAINER: &str = r#"{
        "name": "Trainer",
        "cpu": "i8080",
        "clock_hz": 2000000,
        "tick_ms": 10,
        "memory": {"start_rom": 0, "start_ram": 1},
        "program": {"origin": 0, "hex": "3e a5 d3 10 76"},
        "devices": [
            {"type": "output_latch", "name": "LEDS"},
            {"type": "inverter", "name": "INV"},
            {"type": "nand", "name": "GATE", "properties": {"inputs": 2}}
        ],
        "nodes": [["LEDS.Q0", "INV.IN0"], ["INV.OUT", "GATE.IN0"]],
        "ports": [{"device": "LEDS", "base": 16, "direction": "output"}]
    }"#;

    #[test]
    fn test_parse_defaults() {
        let config = MachineConfig::from_json(r#"{"name": "Bare", "cpu": "z80"}"#).unwrap();
        assert_eq!(config.cpu, CpuKind::Z80);
        assert_eq!(config.clock_hz, 2_000_000);
        assert_eq!(config.cycles_per_tick(), 20_000);
        assert!(config.devices.is_empty());
        assert_eq!(config.memory.start_rom, 64);
    }

    #[test]
    fn test_cycles_per_tick_scales() {
        let mut config = MachineConfig::from_json(TRAINER).unwrap();
        config.speed_multiplier = 2.5;
        assert_eq!(config.cycles_per_tick(), 50_000);
    }

    #[test]
    fn test_program_hex() {
        let program = ProgramConfig {
            origin: 0,
            hex: "3e a5\nd310".to_string(),
        };
        assert_eq!(program.bytes().unwrap(), vec![0x3e, 0xa5, 0xd3, 0x10]);
        let odd = ProgramConfig {
            origin: 0,
            hex: "3e5".to_string(),
        };
        assert!(matches!(odd.bytes(), Err(ConfigError::BadProgram(_))));
    }

    #[test]
    fn test_pin_references() {
        assert_eq!(split_pin_reference("LEDS.Q0").unwrap(), ("LEDS", "Q0"));
        assert_eq!(split_pin_reference("A.B.OUT").unwrap(), ("A.B", "OUT"));
        assert!(split_pin_reference("LEDS").is_err());
        assert!(split_pin_reference(".Q0").is_err());
    }

    #[test]
    fn test_build_and_run() {
        let factory = MachineFactory::new();
        let mut machine = factory.build_from_json(TRAINER).unwrap();
        assert_eq!(machine.cycles_per_tick(), 20_000);
        machine.reset();
        machine.run_tick();
        assert!(machine.processor().is_halted());

        let leds = machine.device_id("LEDS").unwrap();
        let mut state = DeviceState::new("LEDS");
        machine.bus().device(leds).marshal(&mut state, 0);
        assert_eq!(state.get("REGISTER"), Some("165"));

        let q0 = machine.bus().pin("LEDS", "Q0").unwrap();
        let inv = machine.bus().pin("INV", "OUT").unwrap();
        assert_eq!(machine.bus().level(q0), 1);
        assert_eq!(machine.bus().level(inv), 0);
    }

    #[test]
    fn test_unknown_device_type() {
        let text = r#"{"name": "X", "cpu": "i8080", "devices": [{"type": "tape", "name": "T"}]}"#;
        let result = MachineFactory::new().build_from_json(text);
        assert!(matches!(result, Err(ConfigError::UnknownDeviceType(kind)) if kind == "tape"));
    }

    #[test]
    fn test_bad_properties() {
        let text = r#"{"name": "X", "cpu": "z80",
            "devices": [{"type": "frequency_generator", "name": "OSC", "properties": {"off": 10}}]}"#;
        assert!(matches!(
            MachineFactory::new().build_from_json(text),
            Err(ConfigError::MissingProperty { .. })
        ));

        let text = r#"{"name": "X", "cpu": "z80",
            "devices": [{"type": "frequency_divider", "name": "DIV", "properties": {"edge": "up"}}]}"#;
        assert!(matches!(
            MachineFactory::new().build_from_json(text),
            Err(ConfigError::BadProperty { .. })
        ));
    }

    #[test]
    fn test_wiring_errors_surface() {
        let text = r#"{"name": "X", "cpu": "i8080",
            "devices": [{"type": "fixed_pin", "name": "VCC"}],
            "nodes": [["VCC.OUT"], ["VCC.OUT"]]}"#;
        assert!(matches!(
            MachineFactory::new().build_from_json(text),
            Err(ConfigError::Wiring(WiringError::AlreadyConnected(..)))
        ));
    }

    #[test]
    fn test_port_range_checked() {
        let text = r#"{"name": "X", "cpu": "i8080",
            "devices": [{"type": "intel_8255", "name": "PPI"}],
            "ports": [{"device": "PPI", "base": 254, "span": 4}]}"#;
        assert!(matches!(
            MachineFactory::new().build_from_json(text),
            Err(ConfigError::PortRange { .. })
        ));
    }

    #[test]
    fn test_custom_device_type() {
        let mut factory = MachineFactory::new();
        factory.register("ground", |config| Ok(Box::new(FixedPin::new(&config.name, 0))));
        assert!(factory.device_types().contains(&"ground"));
        let text = r#"{"name": "X", "cpu": "i8080", "devices": [{"type": "ground", "name": "GND"}]}"#;
        assert!(factory.build_from_json(text).is_ok());
    }
}
