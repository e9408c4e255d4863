use crate::connection::Net;
use crate::pin::{PinId, PinValue};
use crate::scheduler::Scheduler;
use crate::snapshot::{DeviceState, SnapshotError};
use crate::types::DeviceId;

/// Handle a device uses to reach its nets and the scheduler while it is
/// being called by the bus. Pins reported through `notify_change_node`
/// are propagated by the bus as soon as the device call returns.
pub struct Signals<'a> {
    owner: DeviceId,
    net: &'a Net,
    scheduler: &'a mut Scheduler,
    changed: &'a mut Vec<PinId>,
}

impl<'a> Signals<'a> {
    pub fn new(
        owner: DeviceId,
        net: &'a Net,
        scheduler: &'a mut Scheduler,
        changed: &'a mut Vec<PinId>,
    ) -> Self {
        Signals {
            owner,
            net,
            scheduler,
            changed,
        }
    }

    pub fn owner(&self) -> DeviceId {
        self.owner
    }

    /// Mark `pin` of this device as asserting a new value
    pub fn notify_change_node(&mut self, pin: usize) {
        let id = PinId::new(self.owner, pin);
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }

    /// Resolved level of the net `pin` of this device is attached to
    pub fn query_node(&self, pin: usize) -> u8 {
        self.net.level_of(PinId::new(self.owner, pin))
    }

    /// Whether anything actively drives the net `pin` sits on; a floating
    /// net reads 1 through `query_node` but is not driven
    pub fn is_driven(&self, pin: usize) -> bool {
        self.net.is_driven(PinId::new(self.owner, pin))
    }

    pub fn is_connected(&self, pin: usize) -> bool {
        self.net.node_of(PinId::new(self.owner, pin)).is_some()
    }

    pub fn system_clock(&self) -> u64 {
        self.scheduler.now()
    }

    /// Book a callback `delay` cycles from now; returns the target cycle
    pub fn schedule(&mut self, delay: u64, parameter: i64) -> u64 {
        self.scheduler.schedule_relative(self.owner, delay, parameter)
    }

    pub fn schedule_at(&mut self, time: u64, parameter: i64) {
        self.scheduler.schedule_absolute(self.owner, time, parameter);
    }

    pub fn cancel_all(&mut self) -> usize {
        self.scheduler.cancel_all(self.owner)
    }

    pub fn remaining_time(&self) -> Option<u64> {
        self.scheduler.remaining_time(self.owner)
    }
}

/// A simulated chip or logical unit living in the bus arena.
///
/// Pins are addressed by index into `pin_names`. Every method has a
/// do-nothing default so simple devices only implement what they use.
pub trait Device {
    fn name(&self) -> &str;

    fn pin_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn pin_index(&self, name: &str) -> Option<usize> {
        self.pin_names().iter().position(|pin| pin == name)
    }

    /// Restore power-on state; the bus re-announces every pin afterwards
    fn reset(&mut self, _signals: &mut Signals) {}

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    /// Record state; `clock` is the current cycle, for devices holding
    /// pending scheduler events
    fn marshal(&self, _state: &mut DeviceState, _clock: u64) {}

    fn unmarshal(&mut self, _state: &DeviceState) -> Result<(), SnapshotError> {
        Ok(())
    }

    /// Called once every device has been unmarshalled, for devices the
    /// snapshot had an entry for
    fn post_unmarshal(&mut self, _signals: &mut Signals) {}

    /// Value this device currently asserts on `pin`
    fn query(&self, _pin: usize) -> PinValue {
        PinValue::HighZ
    }

    /// The net `pin` is attached to resolved to a new `level`
    fn notify_change(&mut self, _pin: usize, _level: u8, _signals: &mut Signals) {}

    fn perform_scheduled_event(&mut self, _parameter: i64, _delay: u64, _signals: &mut Signals) {}

    fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
        None
    }

    fn as_memory(&self) -> Option<&dyn Memory> {
        None
    }

    fn as_memory_mut(&mut self) -> Option<&mut dyn Memory> {
        None
    }
}

/// Port-mapped I/O capability
pub trait IoElement {
    fn port_input(&mut self, port: u8, signals: &mut Signals) -> u8;
    fn port_output(&mut self, port: u8, data: u8, signals: &mut Signals);
}

/// Byte-addressable space seen by a processor
pub trait Memory {
    fn get_byte(&mut self, address: u16) -> u8;
    fn set_byte(&mut self, address: u16, data: u8);

    /// Read without side effects, for debuggers and disassembly
    fn peek(&self, address: u16) -> u8;

    fn block_names(&self) -> Vec<String>;
    fn block(&self, name: &str) -> Option<&[u8]>;
    fn block_mut(&mut self, name: &str) -> Option<&mut [u8]>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blank;

    impl Device for Blank {
        fn name(&self) -> &str {
            "BLANK"
        }
        fn pin_names(&self) -> Vec<String> {
            vec!["A".to_string(), "B".to_string()]
        }
    }

    #[test]
    fn test_device_defaults() {
        let mut device = Blank;
        assert_eq!(device.pin_index("B"), Some(1));
        assert_eq!(device.pin_index("C"), None);
        assert_eq!(device.query(0), PinValue::HighZ);
        assert!(device.as_io_element().is_none());
        assert!(device.as_memory().is_none());
    }

    #[test]
    fn test_signals_collects_changes_once() {
        let net = Net::new();
        let mut scheduler = Scheduler::new();
        let mut changed = Vec::new();
        let mut signals = Signals::new(DeviceId(3), &net, &mut scheduler, &mut changed);
        signals.notify_change_node(1);
        signals.notify_change_node(1);
        assert_eq!(signals.query_node(1), 1);
        assert!(!signals.is_connected(1));
        assert!(!signals.is_driven(1));
        assert_eq!(signals.schedule(10, 0), 10);
        assert_eq!(signals.remaining_time(), Some(10));
        assert_eq!(changed, vec![PinId::new(DeviceId(3), 1)]);
    }
}
