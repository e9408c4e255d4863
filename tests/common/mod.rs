//! Mock devices and machine builders shared by the integration tests
#![allow(dead_code)]

use retro_sim::component::{Device, IoElement, Signals};
use retro_sim::components::cpu::{Intel8080, ZilogZ80};
use retro_sim::components::memory::SimpleMemory;
use retro_sim::pin::PinValue;
use retro_sim::Hardware;
use std::cell::RefCell;
use std::rc::Rc;

/// One-pin driver controlled through a port.
///
/// Writing `0` or `1` drives that level, any other value releases the pin.
/// Reading the port returns the level of the net the pin sits on.
pub struct MockDriver {
    name: String,
    value: PinValue,
}

impl MockDriver {
    pub fn new(name: &str, value: PinValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

impl Device for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["OUT".to_string()]
    }

    fn query(&self, _pin: usize) -> PinValue {
        self.value
    }

    fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
        Some(self)
    }
}

impl IoElement for MockDriver {
    fn port_input(&mut self, _port: u8, signals: &mut Signals) -> u8 {
        signals.query_node(0)
    }

    fn port_output(&mut self, _port: u8, data: u8, signals: &mut Signals) {
        self.value = match data {
            0 => PinValue::Low,
            1 => PinValue::High,
            _ => PinValue::HighZ,
        };
        signals.notify_change_node(0);
    }
}

/// A delivered scheduler callback: `(parameter, delay, clock)`
pub type Firing = (i64, u64, u64);

/// Books events through its port and records every delivery.
///
/// A write of `n` schedules an event `n` cycles ahead with parameter `n`;
/// a write of zero cancels everything pending.
pub struct MockTicker {
    name: String,
    log: Rc<RefCell<Vec<Firing>>>,
}

impl MockTicker {
    pub fn new(name: &str) -> (Self, Rc<RefCell<Vec<Firing>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                name: name.to_string(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl Device for MockTicker {
    fn name(&self) -> &str {
        &self.name
    }

    fn perform_scheduled_event(&mut self, parameter: i64, delay: u64, signals: &mut Signals) {
        self.log
            .borrow_mut()
            .push((parameter, delay, signals.system_clock()));
    }

    fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
        Some(self)
    }
}

impl IoElement for MockTicker {
    fn port_input(&mut self, _port: u8, signals: &mut Signals) -> u8 {
        signals.remaining_time().map_or(0xff, |time| time.min(0xfe) as u8)
    }

    fn port_output(&mut self, _port: u8, data: u8, signals: &mut Signals) {
        if data == 0 {
            signals.cancel_all();
        } else {
            signals.schedule(data as u64, data as i64);
        }
    }
}

/// 8080 machine with 64 KiB of RAM holding `program` at address 0
pub fn machine_8080(program: &[u8]) -> Hardware {
    let mut hardware = Hardware::new("TEST", Box::new(Intel8080::new("CPU")));
    let mut memory = SimpleMemory::ram("MEMORY");
    memory.load(0, program);
    hardware.add_memory(Box::new(memory));
    hardware.set_cycles_per_tick(1000);
    hardware
}

/// Z80 machine with 64 KiB of RAM holding `program` at address 0
pub fn machine_z80(program: &[u8]) -> Hardware {
    let mut hardware = Hardware::new("TEST", Box::new(ZilogZ80::new("CPU")));
    let mut memory = SimpleMemory::ram("MEMORY");
    memory.load(0, program);
    hardware.add_memory(Box::new(memory));
    hardware.set_cycles_per_tick(1000);
    hardware
}

/// Register `name` of the device called `device`, as snapshot text
pub fn register(hardware: &Hardware, device: &str, name: &str) -> Option<String> {
    let id = hardware.device_id(device)?;
    let mut state = retro_sim::DeviceState::new(device);
    hardware
        .bus()
        .device(id)
        .marshal(&mut state, hardware.processor().system_clock());
    state.get(name).map(str::to_string)
}
