use crate::component::{Device, Signals};
use crate::pin::{Edge, PinValue};
use crate::snapshot::{DeviceState, SnapshotError};

/// Toggles its output every `ratio` matching edges on the input
pub struct FrequencyDivider {
    name: String,
    ratio: u32,
    edge: Edge,
    input: u8,
    counter: u32,
    output: u8,
}

impl FrequencyDivider {
    pub const IN: usize = 0;
    pub const OUT: usize = 1;

    pub fn new(name: &str, ratio: u32, edge: Edge) -> Self {
        assert!(ratio > 0, "division ratio must be positive");
        FrequencyDivider {
            name: name.to_string(),
            ratio,
            edge,
            input: 1,
            counter: 0,
            output: 0,
        }
    }
}

impl Device for FrequencyDivider {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["IN".to_string(), "OUT".to_string()]
    }

    fn reset(&mut self, signals: &mut Signals) {
        self.counter = 0;
        self.output = 0;
        self.input = signals.query_node(Self::IN);
    }

    fn query(&self, pin: usize) -> PinValue {
        match pin {
            Self::OUT => PinValue::from_level(self.output),
            _ => PinValue::HighZ,
        }
    }

    fn notify_change(&mut self, pin: usize, level: u8, signals: &mut Signals) {
        if pin != Self::IN {
            return;
        }
        if self.edge.matches(self.input, level) {
            self.counter += 1;
            if self.counter == self.ratio {
                self.counter = 0;
                self.output ^= 1;
                signals.notify_change_node(Self::OUT);
            }
        }
        self.input = level;
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put("OUTPUT", self.output);
        state.put("COUNTER", self.counter);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        self.output = (state.read::<u8>("OUTPUT")? != 0) as u8;
        let counter: u32 = state.read("COUNTER")?;
        if counter >= self.ratio {
            return Err(SnapshotError::BadRegister {
                register: "COUNTER".to_string(),
                value: counter.to_string(),
            });
        }
        self.counter = counter;
        Ok(())
    }

    fn post_unmarshal(&mut self, signals: &mut Signals) {
        self.input = signals.query_node(Self::IN);
    }
}
