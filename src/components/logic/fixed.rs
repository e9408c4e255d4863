use crate::component::Device;
use crate::pin::PinValue;
use crate::snapshot::{DeviceState, SnapshotError};

/// A pin tied to a constant level (pull-up, ground, jumper)
pub struct FixedPin {
    name: String,
    level: u8,
}

impl FixedPin {
    pub const OUT: usize = 0;

    pub fn new(name: &str, level: u8) -> Self {
        FixedPin {
            name: name.to_string(),
            level: (level != 0) as u8,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

impl Device for FixedPin {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["OUT".to_string()]
    }

    fn query(&self, _pin: usize) -> PinValue {
        PinValue::from_level(self.level)
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put("LEVEL", self.level);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        state.restore("LEVEL", &mut self.level)?;
        self.level = (self.level != 0) as u8;
        Ok(())
    }
}
