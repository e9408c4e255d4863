use crate::component::{Device, IoElement, Signals};
use crate::pin::PinValue;
use crate::snapshot::{DeviceState, SnapshotError};

/// Eight-bit write-only latch driving pins `Q0..Q7`
pub struct OutputLatch {
    name: String,
    register: u8,
}

impl OutputLatch {
    pub fn new(name: &str) -> Self {
        OutputLatch {
            name: name.to_string(),
            register: 0,
        }
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    fn notify_all(&self, signals: &mut Signals) {
        for pin in 0..8 {
            signals.notify_change_node(pin);
        }
    }
}

impl Device for OutputLatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        (0..8).map(|bit| format!("Q{}", bit)).collect()
    }

    fn reset(&mut self, signals: &mut Signals) {
        self.register = 0;
        self.notify_all(signals);
    }

    fn query(&self, pin: usize) -> PinValue {
        PinValue::from_level((self.register >> pin) & 1)
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put("REGISTER", self.register);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        self.register = state.read("REGISTER")?;
        Ok(())
    }

    fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
        Some(self)
    }
}

impl IoElement for OutputLatch {
    fn port_input(&mut self, _port: u8, _signals: &mut Signals) -> u8 {
        0xff
    }

    fn port_output(&mut self, _port: u8, data: u8, signals: &mut Signals) {
        self.register = data;
        self.notify_all(signals);
    }
}
