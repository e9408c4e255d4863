use crate::component::{Device, Signals};
use crate::pin::PinValue;
use crate::snapshot::{DeviceState, SnapshotError};
use log::trace;

/// Astable square-wave source timed in CPU cycles.
/// The output stays low for `off` cycles, then high for `on` cycles.
pub struct FrequencyGenerator {
    name: String,
    off_period: u64,
    on_period: u64,
    output: u8,
    next_event: Option<u64>, // Target cycle of the pending toggle
    remaining: u64,          // Cycles to the next toggle, from a snapshot
}

impl FrequencyGenerator {
    pub const OUT: usize = 0;

    pub fn new(name: &str, off_period: u64, on_period: u64) -> Self {
        assert!(
            off_period > 0 && on_period > 0,
            "generator periods must be positive"
        );
        FrequencyGenerator {
            name: name.to_string(),
            off_period,
            on_period,
            output: 0,
            next_event: None,
            remaining: off_period,
        }
    }

    pub fn off_period(&self) -> u64 {
        self.off_period
    }

    pub fn on_period(&self) -> u64 {
        self.on_period
    }

    fn arm(&mut self, time: u64, signals: &mut Signals) {
        signals.schedule_at(time, 0);
        self.next_event = Some(time);
    }
}

impl Device for FrequencyGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["OUT".to_string()]
    }

    fn reset(&mut self, signals: &mut Signals) {
        signals.cancel_all();
        self.output = 0;
        signals.notify_change_node(Self::OUT);
        let time = signals.system_clock() + self.off_period;
        self.arm(time, signals);
        trace!("{} reset", self.name);
    }

    fn query(&self, _pin: usize) -> PinValue {
        PinValue::from_level(self.output)
    }

    fn perform_scheduled_event(&mut self, _parameter: i64, delay: u64, signals: &mut Signals) {
        self.output ^= 1;
        signals.notify_change_node(Self::OUT);
        let period = if self.output == 0 {
            self.off_period
        } else {
            self.on_period
        };
        // count from the nominal edge, not from the late delivery
        let time = signals.system_clock() - delay + period;
        self.arm(time, signals);
    }

    fn marshal(&self, state: &mut DeviceState, clock: u64) {
        state.put("OFF", self.off_period);
        state.put("ON", self.on_period);
        let remaining = self
            .next_event
            .map_or(self.remaining, |time| time.saturating_sub(clock));
        state.put("COUNTER", remaining);
        state.put("OUTPUT", self.output);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        let off: u64 = state.read("OFF")?;
        let on: u64 = state.read("ON")?;
        if off == 0 || on == 0 {
            return Err(SnapshotError::BadRegister {
                register: "OFF/ON".to_string(),
                value: format!("{}/{}", off, on),
            });
        }
        self.off_period = off;
        self.on_period = on;
        self.remaining = state.read("COUNTER")?;
        self.output = (state.read::<u8>("OUTPUT")? != 0) as u8;
        self.next_event = None;
        Ok(())
    }

    fn post_unmarshal(&mut self, signals: &mut Signals) {
        signals.cancel_all();
        let time = signals.system_clock() + self.remaining;
        self.arm(time, signals);
    }
}
