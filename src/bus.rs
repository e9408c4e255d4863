//! The simulation context shared by every device of one machine.
//!
//! The bus owns the device arena, the net table and the cycle scheduler.
//! Devices never hold references to each other; they reach the outside
//! world only through the [`Signals`] handle the bus lends them, and every
//! pin they mark as changed is propagated synchronously, depth first,
//! before the call that caused it returns.

use crate::component::{Device, Memory, Signals};
use crate::connection::{Net, WiringError};
use crate::pin::PinId;
use crate::ports::{PortTable, IDLE_PORT_VALUE};
use crate::scheduler::Scheduler;
use crate::types::{DeviceId, NodeId};
use log::{trace, warn};
use std::collections::HashMap;

/// Nesting limit for notification cascades; a combinational loop with no
/// stable state would otherwise recurse forever
pub const MAX_CASCADE_DEPTH: usize = 256;

/// Value seen on the data bus when no memory is attached
pub const FLOATING_BUS: u8 = 0xff;

#[derive(Default)]
pub struct Bus {
    devices: Vec<Box<dyn Device>>,
    names: HashMap<String, DeviceId>,
    net: Net,
    scheduler: Scheduler,
    memory: Option<DeviceId>,
    depth: usize,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }

    /// Place a device in the arena
    pub fn add_device(&mut self, device: Box<dyn Device>) -> DeviceId {
        let id = DeviceId(self.devices.len());
        let name = device.name().to_string();
        if self.names.contains_key(&name) {
            warn!("duplicate device name '{}', lookups keep the first one", name);
        } else {
            self.names.insert(name, id);
        }
        self.devices.push(device);
        id
    }

    pub fn device(&self, id: DeviceId) -> &dyn Device {
        self.devices[id.index()].as_ref()
    }

    pub fn device_mut(&mut self, id: DeviceId) -> &mut dyn Device {
        self.devices[id.index()].as_mut()
    }

    pub fn device_id(&self, name: &str) -> Option<DeviceId> {
        self.names.get(name).copied()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.devices.len()).map(DeviceId)
    }

    /// Resolve `device.pin` names to a pin address
    pub fn pin(&self, device: &str, pin: &str) -> Result<PinId, WiringError> {
        let id = self
            .device_id(device)
            .ok_or_else(|| WiringError::UnknownDeviceName(device.to_string()))?;
        let index = self
            .device(id)
            .pin_index(pin)
            .ok_or_else(|| WiringError::UnknownPin {
                device: device.to_string(),
                pin: pin.to_string(),
            })?;
        Ok(PinId::new(id, index))
    }

    /// Wire `pins` into one node and settle it
    pub fn connect(&mut self, pins: &[PinId]) -> Result<NodeId, WiringError> {
        for pin in pins {
            let device = self
                .devices
                .get(pin.device.index())
                .ok_or(WiringError::UnknownDevice(pin.device))?;
            if pin.pin >= device.pin_names().len() {
                return Err(WiringError::UnknownPin {
                    device: device.name().to_string(),
                    pin: pin.pin.to_string(),
                });
            }
        }
        let node = self.net.connect(pins)?;
        self.notify_node(node);
        Ok(node)
    }

    /// Wire pins given as `(device, pin)` name pairs
    pub fn connect_named(&mut self, pins: &[(&str, &str)]) -> Result<NodeId, WiringError> {
        let ids = pins
            .iter()
            .map(|(device, pin)| self.pin(device, pin))
            .collect::<Result<Vec<_>, _>>()?;
        self.connect(&ids)
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Resolved level on the net of `pin` (1 when unconnected)
    pub fn level(&self, pin: PinId) -> u8 {
        self.net.level_of(pin)
    }

    /// Call into a device with a signals handle, then propagate whatever
    /// pins it changed
    pub fn drive<R, F>(&mut self, id: DeviceId, f: F) -> R
    where
        F: FnOnce(&mut dyn Device, &mut Signals) -> R,
    {
        let mut changed = Vec::new();
        let result = {
            let device = self.devices[id.index()].as_mut();
            let mut signals = Signals::new(id, &self.net, &mut self.scheduler, &mut changed);
            f(device, &mut signals)
        };
        self.propagate(changed);
        result
    }

    /// Re-resolve the nets of `pins`
    pub fn propagate(&mut self, pins: Vec<PinId>) {
        for pin in pins {
            if let Some(node) = self.net.node_of(pin) {
                self.notify_node(node);
            }
        }
    }

    /// Resolve `node` and, if its level changed, notify every member pin.
    ///
    /// Past [`MAX_CASCADE_DEPTH`] the node is left unresolved, keeping its
    /// old cached level, so the next change on it is announced in full.
    pub fn notify_node(&mut self, node: NodeId) {
        if self.depth >= MAX_CASCADE_DEPTH {
            warn!(
                "notification cascade deeper than {} at node {}, dropped",
                MAX_CASCADE_DEPTH,
                node.index()
            );
            return;
        }
        let devices = &self.devices;
        let Some(level) = self
            .net
            .resolve(node, |pin| devices[pin.device.index()].query(pin.pin))
        else {
            return;
        };

        self.depth += 1;
        let members = self.net.members(node).to_vec();
        for pin in members {
            // a nested cascade already announced a newer level to everyone
            if self.net.level(node) != Some(level) {
                break;
            }
            self.drive(pin.device, |device, signals| {
                device.notify_change(pin.pin, level, signals)
            });
        }
        self.depth -= 1;
    }

    /// Forget all resolved levels and resolve every node again
    pub fn settle_all(&mut self) {
        self.net.invalidate_all();
        let nodes: Vec<NodeId> = self.net.node_ids().collect();
        for node in nodes {
            self.notify_node(node);
        }
    }

    fn all_pins(&self, id: DeviceId) -> Vec<PinId> {
        (0..self.devices[id.index()].pin_names().len())
            .map(|pin| PinId::new(id, pin))
            .collect()
    }

    /// Reset one device and re-announce all of its pins
    pub fn reset_device(&mut self, id: DeviceId) {
        self.drive(id, |device, signals| device.reset(signals));
        let pins = self.all_pins(id);
        self.propagate(pins);
    }

    pub fn post_unmarshal_device(&mut self, id: DeviceId) {
        self.drive(id, |device, signals| device.post_unmarshal(signals));
        let pins = self.all_pins(id);
        self.propagate(pins);
    }

    /// Fire every scheduled event due at cycle `now`
    pub fn run_schedule(&mut self, now: u64) {
        self.scheduler.advance_to(now);
        while let Some(event) = self.scheduler.pop_due(now) {
            trace!(
                "event for {} fired {} cycles late",
                event.owner,
                event.delay
            );
            self.drive(event.owner, |device, signals| {
                device.perform_scheduled_event(event.parameter, event.delay, signals)
            });
        }
    }

    /// Use device `id` as the processor's address space
    pub fn attach_memory(&mut self, id: DeviceId) {
        self.memory = Some(id);
    }

    pub fn memory_id(&self) -> Option<DeviceId> {
        self.memory
    }

    pub fn memory(&self) -> Option<&dyn Memory> {
        self.devices[self.memory?.index()].as_memory()
    }

    pub fn memory_mut(&mut self) -> Option<&mut dyn Memory> {
        let id = self.memory?;
        self.devices[id.index()].as_memory_mut()
    }

    pub fn read_byte(&mut self, address: u16) -> u8 {
        match self.memory_mut() {
            Some(memory) => memory.get_byte(address),
            None => FLOATING_BUS,
        }
    }

    pub fn write_byte(&mut self, address: u16, data: u8) {
        if let Some(memory) = self.memory_mut() {
            memory.set_byte(address, data);
        }
    }

    pub fn peek(&self, address: u16) -> u8 {
        self.memory()
            .map_or(FLOATING_BUS, |memory| memory.peek(address))
    }

    /// Read a port; every registered element's value is ANDed onto an idle bus
    pub fn port_input(&mut self, ports: &PortTable, port: u8) -> u8 {
        let mut value = IDLE_PORT_VALUE;
        for &id in ports.inputs(port) {
            value &= self.drive(id, |device, signals| match device.as_io_element() {
                Some(element) => element.port_input(port, signals),
                None => IDLE_PORT_VALUE,
            });
        }
        value
    }

    /// Write a port; unregistered ports drop the write
    pub fn port_output(&mut self, ports: &PortTable, port: u8, data: u8) {
        for &id in ports.outputs(port) {
            self.drive(id, |device, signals| {
                if let Some(element) = device.as_io_element() {
                    element.port_output(port, data, signals);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::IoElement;
    use crate::pin::PinValue;

    /// Drives one pin from bit 0 of a port write
    struct Driver {
        name: String,
        level: PinValue,
    }

    impl Driver {
        fn new(name: &str, level: PinValue) -> Self {
            Driver {
                name: name.to_string(),
                level,
            }
        }
    }

    impl Device for Driver {
        fn name(&self) -> &str {
            &self.name
        }
        fn pin_names(&self) -> Vec<String> {
            vec!["OUT".to_string()]
        }
        fn query(&self, _pin: usize) -> PinValue {
            self.level
        }
        fn as_io_element(&mut self) -> Option<&mut dyn IoElement> {
            Some(self)
        }
    }

    impl IoElement for Driver {
        fn port_input(&mut self, _port: u8, _signals: &mut Signals) -> u8 {
            0x0f
        }
        fn port_output(&mut self, _port: u8, data: u8, signals: &mut Signals) {
            self.level = PinValue::from_level(data & 1);
            signals.notify_change_node(0);
        }
    }

    #[test]
    fn test_connect_resolves_wired_and() {
        let mut bus = Bus::new();
        let a = bus.add_device(Box::new(Driver::new("A", PinValue::High)));
        let b = bus.add_device(Box::new(Driver::new("B", PinValue::Low)));
        let node = bus.connect(&[PinId::new(a, 0), PinId::new(b, 0)]).unwrap();
        assert_eq!(bus.net().level(node), Some(0));
        assert_eq!(bus.level(PinId::new(a, 0)), 0);
        assert_eq!(bus.device_id("B"), Some(b));
    }

    #[test]
    fn test_connect_checks_pins() {
        let mut bus = Bus::new();
        let a = bus.add_device(Box::new(Driver::new("A", PinValue::High)));
        assert!(matches!(
            bus.connect(&[PinId::new(a, 3)]),
            Err(WiringError::UnknownPin { .. })
        ));
        assert!(matches!(
            bus.connect(&[PinId::new(DeviceId(9), 0)]),
            Err(WiringError::UnknownDevice(_))
        ));
        assert!(matches!(
            bus.connect_named(&[("A", "IN")]),
            Err(WiringError::UnknownPin { .. })
        ));
        assert!(bus.connect_named(&[("A", "OUT")]).is_ok());
    }

    #[test]
    fn test_port_dispatch_and_cascade() {
        let mut bus = Bus::new();
        let a = bus.add_device(Box::new(Driver::new("A", PinValue::High)));
        let b = bus.add_device(Box::new(Driver::new("B", PinValue::High)));
        let node = bus.connect(&[PinId::new(a, 0), PinId::new(b, 0)]).unwrap();

        let mut ports = PortTable::new();
        ports.add_output(0x40, a);
        ports.add_input(0x40, a);

        bus.port_output(&ports, 0x40, 0x00);
        assert_eq!(bus.net().level(node), Some(0));
        bus.port_output(&ports, 0x40, 0x01);
        assert_eq!(bus.net().level(node), Some(1));

        assert_eq!(bus.port_input(&ports, 0x40), 0x0f);
        assert_eq!(bus.port_input(&ports, 0x41), IDLE_PORT_VALUE);
        bus.port_output(&ports, 0x41, 0x00);
        assert_eq!(bus.net().level(node), Some(1));
    }

    /// Inverter whose output is wired back to its own input
    struct Ring {
        output: u8,
    }

    impl Device for Ring {
        fn name(&self) -> &str {
            "RING"
        }
        fn pin_names(&self) -> Vec<String> {
            vec!["IO".to_string()]
        }
        fn query(&self, _pin: usize) -> PinValue {
            PinValue::from_level(self.output)
        }
        fn notify_change(&mut self, _pin: usize, level: u8, signals: &mut Signals) {
            self.output = (level == 0) as u8;
            signals.notify_change_node(0);
        }
    }

    #[test]
    fn test_runaway_cascade_is_cut_off() {
        let mut bus = Bus::new();
        let ring = bus.add_device(Box::new(Ring { output: 1 }));
        let node = bus.connect(&[PinId::new(ring, 0)]).unwrap();

        // the cut happens before resolving, so the cache lags one step
        // behind what the ring now drives
        let cached = bus.net().level(node);
        let driven = bus.device(ring).query(0).level();
        assert_ne!(cached, Some(driven));
        assert_eq!(bus.depth, 0);

        bus.notify_node(node);
        assert_eq!(bus.depth, 0);
    }

    #[test]
    fn test_memoryless_bus_floats() {
        let mut bus = Bus::new();
        assert_eq!(bus.read_byte(0x1234), FLOATING_BUS);
        bus.write_byte(0x1234, 0);
        assert_eq!(bus.peek(0x1234), FLOATING_BUS);
    }
}
