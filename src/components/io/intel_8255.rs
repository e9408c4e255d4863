//! Intel 8255 programmable peripheral interface, mode 0.
//!
//! Pins `PA0..PA7`, `PB0..PB7`, `PC0..PC7` (indices 0-23). Ports A, B,
//! upper C and lower C are each either inputs or outputs as selected by the
//! control word. Input pins are tri-stated and read their nets; output pins
//! drive the port latch. Port offset 3 takes control words and port C
//! bit set/reset commands.

use crate::component::{Device, IoElement, Signals};
use crate::pin::PinValue;
use crate::snapshot::{DeviceState, SnapshotError};
use log::{debug, warn};

/// Every port an input, mode 0
pub const RESET_CONTROL: u8 = 0x9b;

const PORT_A_INPUT: u8 = 0x10;
const PORT_C_UPPER_INPUT: u8 = 0x08;
const PORT_B_INPUT: u8 = 0x02;
const PORT_C_LOWER_INPUT: u8 = 0x01;

pub struct Intel8255 {
    name: String,
    latches: [u8; 3], // Output latches of ports A, B and C
    control: u8,
}

impl Intel8255 {
    pub const PORT_A: u8 = 0;
    pub const PORT_B: u8 = 1;
    pub const PORT_C: u8 = 2;
    pub const CONTROL: u8 = 3;

    pub fn new(name: &str) -> Self {
        Intel8255 {
            name: name.to_string(),
            latches: [0; 3],
            control: RESET_CONTROL,
        }
    }

    pub fn control(&self) -> u8 {
        self.control
    }

    /// Bit mask of port `port` pins currently configured as inputs
    fn input_mask(&self, port: usize) -> u8 {
        match port {
            0 if self.control & PORT_A_INPUT != 0 => 0xff,
            1 if self.control & PORT_B_INPUT != 0 => 0xff,
            2 => {
                let mut mask = 0;
                if self.control & PORT_C_UPPER_INPUT != 0 {
                    mask |= 0xf0;
                }
                if self.control & PORT_C_LOWER_INPUT != 0 {
                    mask |= 0x0f;
                }
                mask
            }
            _ => 0,
        }
    }

    fn read_port(&self, port: usize, signals: &Signals) -> u8 {
        let inputs = self.input_mask(port);
        let mut value = self.latches[port] & !inputs;
        for bit in 0..8 {
            if inputs & (1 << bit) != 0 && signals.query_node(port * 8 + bit) != 0 {
                value |= 1 << bit;
            }
        }
        value
    }

    fn notify_port(&self, port: usize, signals: &mut Signals) {
        for bit in 0..8 {
            signals.notify_change_node(port * 8 + bit);
        }
    }

    fn write_control(&mut self, data: u8, signals: &mut Signals) {
        if data & 0x80 == 0 {
            let bit = (data >> 1) & 0x07;
            if data & 1 != 0 {
                self.latches[2] |= 1 << bit;
            } else {
                self.latches[2] &= !(1 << bit);
            }
            signals.notify_change_node(16 + bit as usize);
            return;
        }
        if data & 0x64 != 0 {
            warn!(
                "{}: mode {:02x} not supported, using mode 0",
                self.name, data
            );
        }
        // a mode set clears every output latch
        self.control = data;
        self.latches = [0; 3];
        for port in 0..3 {
            self.notify_port(port, signals);
        }
        debug!("{}: control word {:02x}", self.name, data);
    }
}

impl Device for Intel8255 {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        ["PA", "PB", "PC"]
            .iter()
            .flat_map(|port| (0..8).map(move |bit| format!("{}{}", port, bit)))
            .collect()
    }

    fn reset(&mut self, signals: &mut Signals) {
        self.control = RESET_CONTROL;
        self.latches = [0; 3];
        for port in 0..3 {
            self.notify_port(port, signals);
        }
    }

    fn query(&self, pin: usize) -> PinValue {
        let port = pin / 8;
        let bit = pin % 8;
        if port > 2 || self.input_mask(port) & (1 << bit) != 0 {
            PinValue::HighZ
        } else {
            PinValue::from_level((self.latches[port] >> bit) & 1)
        }
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put("A", self.latches[0]);
        state.put("B", self.latches[1]);
        state.put("C", self.latches[2]);
        state.put("CONTROL", self.control);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        let control: u8 = state.read("CONTROL")?;
        if control & 0x80 == 0 {
            return Err(SnapshotError::BadRegister {
                register: "CONTROL".to_string(),
                value: control.to_string(),
            });
        }
        self.latches = [state.read("A")?, state.read("B")?, state.read("C")?];
        self.control = control;
        Ok(())
    }

    fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
        Some(self)
    }
}

impl IoElement for Intel8255 {
    fn port_input(&mut self, port: u8, signals: &mut Signals) -> u8 {
        match port & 0x03 {
            Self::CONTROL => 0xff,
            register => self.read_port(register as usize, signals),
        }
    }

    fn port_output(&mut self, port: u8, data: u8, signals: &mut Signals) {
        match port & 0x03 {
            Self::CONTROL => self.write_control(data, signals),
            register => {
                let register = register as usize;
                self.latches[register] = data;
                self.notify_port(register, signals);
            }
        }
    }
}
