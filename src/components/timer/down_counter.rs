use crate::component::{Device, IoElement, Signals};
use crate::pin::PinValue;
use crate::snapshot::{DeviceState, SnapshotError};
use log::trace;

/// Loadable down counter.
///
/// Writing the port loads the count and raises `OUT`. Every rising edge on
/// `CLK` while `GATE` is high decrements the count, and `OUT` drops on the
/// pulse that reaches zero. It stays low until the next load.
pub struct DownCounter {
    name: String,
    count: u8,
    clock: u8, // Last level seen on CLK
    gate: u8,
}

impl DownCounter {
    pub const CLK: usize = 0;
    pub const GATE: usize = 1;
    pub const OUT: usize = 2;

    pub fn new(name: &str) -> Self {
        DownCounter {
            name: name.to_string(),
            count: 0,
            clock: 1,
            gate: 1,
        }
    }

    fn output(&self) -> u8 {
        (self.count != 0) as u8
    }
}

impl Device for DownCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["CLK".to_string(), "GATE".to_string(), "OUT".to_string()]
    }

    fn reset(&mut self, signals: &mut Signals) {
        self.count = 0;
        self.clock = signals.query_node(Self::CLK);
        self.gate = signals.query_node(Self::GATE);
    }

    fn query(&self, pin: usize) -> PinValue {
        match pin {
            Self::OUT => PinValue::from_level(self.output()),
            _ => PinValue::HighZ,
        }
    }

    fn notify_change(&mut self, pin: usize, level: u8, signals: &mut Signals) {
        match pin {
            Self::CLK => {
                if self.clock == 0 && level != 0 && self.gate != 0 && self.count != 0 {
                    self.count -= 1;
                    if self.count == 0 {
                        trace!("{} reached terminal count", self.name);
                        signals.notify_change_node(Self::OUT);
                    }
                }
                self.clock = level;
            }
            Self::GATE => self.gate = level,
            _ => {}
        }
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put("COUNT", self.count);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        self.count = state.read("COUNT")?;
        Ok(())
    }

    fn post_unmarshal(&mut self, signals: &mut Signals) {
        self.clock = signals.query_node(Self::CLK);
        self.gate = signals.query_node(Self::GATE);
    }

    fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
        Some(self)
    }
}

impl IoElement for DownCounter {
    fn port_input(&mut self, _port: u8, _signals: &mut Signals) -> u8 {
        self.count
    }

    fn port_output(&mut self, _port: u8, data: u8, signals: &mut Signals) {
        let before = self.output();
        self.count = data;
        if self.output() != before {
            signals.notify_change_node(Self::OUT);
        }
    }
}
