//! A complete machine: one processor, the bus it drives and the devices
//! plugged into it.
//!
//! `Hardware` owns the lifecycle: ordered reset, nested suspension,
//! snapshot save/restore by device name and tick-sized execution.

use crate::bus::Bus;
use crate::component::Device;
use crate::components::cpu::{Processor, StopReason};
use crate::connection::WiringError;
use crate::ports::PortDirection;
use crate::snapshot::{DeviceState, Snapshot, SnapshotError};
use crate::types::{DeviceId, InstructionKind, NodeId};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::path::Path;

pub struct Hardware {
    name: String,
    bus: Bus,
    processor: Box<dyn Processor>,
    members: Vec<DeviceId>, // Reset and snapshot order
    suspensions: u32,
    cycles_per_tick: u64,
}

impl Hardware {
    pub fn new(name: &str, processor: Box<dyn Processor>) -> Self {
        Hardware {
            name: name.to_string(),
            bus: Bus::new(),
            processor,
            members: Vec::new(),
            suspensions: 0,
            cycles_per_tick: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    pub fn processor_mut(&mut self) -> &mut dyn Processor {
        self.processor.as_mut()
    }

    /// Both halves at once, for driving the processor by hand
    pub fn split_mut(&mut self) -> (&mut dyn Processor, &mut Bus) {
        (self.processor.as_mut(), &mut self.bus)
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) -> DeviceId {
        let id = self.bus.add_device(device);
        debug!("{}: added {} as {}", self.name, self.bus.device(id).name(), id);
        self.members.push(id);
        id
    }

    /// Add a device and make it the processor's address space
    pub fn add_memory(&mut self, device: Box<dyn Device>) -> DeviceId {
        let id = self.add_device(device);
        self.bus.attach_memory(id);
        id
    }

    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }

    pub fn device_id(&self, name: &str) -> Option<DeviceId> {
        self.bus.device_id(name)
    }

    /// Wire `(device, pin)` pairs into one node
    pub fn connect(&mut self, pins: &[(&str, &str)]) -> Result<NodeId, WiringError> {
        self.bus.connect_named(pins)
    }

    /// Give an I/O element a contiguous port range
    pub fn map_ports(&mut self, element: DeviceId, base: u8, span: u8, direction: PortDirection) {
        trace!(
            "{}: {} mapped at {:02x}+{}",
            self.name,
            element,
            base,
            span
        );
        self.processor.ports_mut().bind(element, base, span, direction);
    }

    /// Move an element's port range to `new_base`; false if it has none
    pub fn reconnect(&mut self, element: DeviceId, new_base: u8) -> bool {
        let moved = self.processor.ports_mut().reconnect(element, new_base);
        if !moved {
            warn!("{}: {} has no port range to move", self.name, element);
        }
        moved
    }

    pub fn cycles_per_tick(&self) -> u64 {
        self.cycles_per_tick
    }

    pub fn set_cycles_per_tick(&mut self, cycles: u64) {
        self.cycles_per_tick = cycles;
    }

    /// Reset the processor, then every device in order, then let the
    /// nets settle
    pub fn reset(&mut self) {
        debug!("{}: reset", self.name);
        self.sync_scheduler();
        self.processor.reset();
        for &id in &self.members {
            self.bus.reset_device(id);
        }
        self.bus.settle_all();
    }

    /// Bring the scheduler up to the processor clock, so devices booking
    /// events outside `exec` count from the same cycle the processor shows
    fn sync_scheduler(&mut self) {
        let clock = self.processor.system_clock();
        self.bus.scheduler_mut().advance_to(clock);
    }

    /// Suspensions nest; only the outermost one reaches the members
    pub fn suspend(&mut self) {
        self.suspensions += 1;
        if self.suspensions > 1 {
            return;
        }
        debug!("{}: suspended", self.name);
        self.processor.suspend();
        for &id in &self.members {
            self.bus.device_mut(id).suspend();
        }
    }

    pub fn resume(&mut self) {
        match self.suspensions {
            0 => warn!("{}: resume without suspend", self.name),
            1 => {
                self.suspensions = 0;
                debug!("{}: resumed", self.name);
                self.processor.resume();
                for &id in &self.members {
                    self.bus.device_mut(id).resume();
                }
            }
            _ => self.suspensions -= 1,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspensions > 0
    }

    /// Run one tick's worth of cycles
    pub fn run_tick(&mut self) -> StopReason {
        if self.is_suspended() {
            return StopReason::Suspended;
        }
        let cycles = self.cycles_per_tick;
        self.processor.run(&mut self.bus, cycles)
    }

    pub fn exec(
        &mut self,
        cycles: u64,
        mask: InstructionKind,
        breakpoints: &HashSet<u16>,
    ) -> StopReason {
        self.processor.exec(&mut self.bus, cycles, mask, breakpoints)
    }

    /// Capture the processor and every device
    pub fn marshal(&self) -> Snapshot {
        let mut snapshot = Snapshot::new(&self.name);
        let mut state = DeviceState::new(self.processor.name());
        self.processor.marshal(&mut state);
        snapshot.devices.push(state);

        let clock = self.processor.system_clock();
        for &id in &self.members {
            let device = self.bus.device(id);
            let mut state = DeviceState::new(device.name());
            device.marshal(&mut state, clock);
            snapshot.devices.push(state);
        }
        snapshot
    }

    /// Restore from `snapshot`, matching devices by name.
    ///
    /// Devices without an entry keep their state and entries without a
    /// device are skipped. A failing device aborts the restore; devices
    /// restored before it are not rolled back.
    pub fn unmarshal(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        snapshot.check_version()?;
        if snapshot.hardware != self.name {
            debug!(
                "{}: restoring a snapshot taken from '{}'",
                self.name, snapshot.hardware
            );
        }

        self.sync_scheduler();
        match snapshot.device(self.processor.name()) {
            Some(state) => self.processor.unmarshal(state)?,
            None => debug!("{}: snapshot has no processor state", self.name),
        }
        let mut restored = Vec::new();
        for &id in &self.members {
            let name = self.bus.device(id).name().to_string();
            match snapshot.device(&name) {
                Some(state) => {
                    self.bus.device_mut(id).unmarshal(state)?;
                    restored.push(id);
                }
                None => debug!("{}: snapshot has no state for {}", self.name, name),
            }
        }
        for state in &snapshot.devices {
            if state.name != self.processor.name() && self.bus.device_id(&state.name).is_none() {
                debug!("{}: ignoring snapshot entry {}", self.name, state.name);
            }
        }

        for id in restored {
            self.bus.post_unmarshal_device(id);
        }
        self.bus.settle_all();
        Ok(())
    }

    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        self.marshal().save(path)
    }

    pub fn load_snapshot<P: AsRef<Path>>(&mut self, path: P) -> Result<(), SnapshotError> {
        let snapshot = Snapshot::load(path)?;
        self.unmarshal(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::cpu::Intel8080;
    use crate::components::io::OutputLatch;
    use crate::components::logic::{FixedPin, Probe};
    use crate::components::memory::SimpleMemory;

    fn machine(program: &[u8]) -> Hardware {
        let mut hardware = Hardware::new("TEST", Box::new(Intel8080::new("CPU")));
        let mut memory = SimpleMemory::ram("MEMORY");
        memory.load(0, program);
        hardware.add_memory(Box::new(memory));
        hardware.set_cycles_per_tick(100);
        hardware
    }

    #[test]
    fn test_reset_announces_power_up_levels() {
        let mut hardware = machine(&[]);
        hardware.add_device(Box::new(FixedPin::new("LOW", 0)));
        let (probe, log) = Probe::new("PROBE");
        hardware.add_device(Box::new(probe));
        hardware.connect(&[("LOW", "OUT"), ("PROBE", "IN")]).unwrap();
        log.clear();

        hardware.reset();
        assert_eq!(log.last(), Some(0));
    }

    #[test]
    fn test_nested_suspension() {
        let mut hardware = machine(&[0x00; 16]);
        hardware.suspend();
        hardware.suspend();
        assert_eq!(hardware.run_tick(), StopReason::Suspended);
        hardware.resume();
        assert!(hardware.is_suspended());
        assert!(hardware.processor().is_suspended());
        hardware.resume();
        assert!(!hardware.processor().is_suspended());
        assert_eq!(hardware.run_tick(), StopReason::Budget);
        assert!(hardware.processor().system_clock() >= 100);
    }

    #[test]
    fn test_snapshot_round_trip() {
        // MVI A,0x21; OUT 0x40; HLT
        let mut hardware = machine(&[0x3e, 0x21, 0xd3, 0x40, 0x76]);
        let latch = hardware.add_device(Box::new(OutputLatch::new("LATCH")));
        hardware.map_ports(latch, 0x40, 1, PortDirection::Output);
        hardware.reset();
        hardware.run_tick();

        let json = hardware.marshal().to_json().unwrap();
        let snapshot = Snapshot::from_json(&json).unwrap();
        assert_eq!(snapshot.device("LATCH").unwrap().get("REGISTER"), Some("33"));

        let mut copy = machine(&[]);
        copy.add_device(Box::new(OutputLatch::new("LATCH")));
        copy.unmarshal(&snapshot).unwrap();
        assert_eq!(copy.processor().state_string(), hardware.processor().state_string());
        assert_eq!(copy.bus().peek(0x0002), 0xd3);
        let restored = copy.marshal();
        assert_eq!(restored.device("LATCH"), snapshot.device("LATCH"));
    }

    #[test]
    fn test_unmarshal_skips_unknown_devices() {
        let hardware = machine(&[0x76]);
        let mut snapshot = hardware.marshal();
        let mut extra = DeviceState::new("GHOST");
        extra.put("X", 1);
        snapshot.devices.push(extra);

        let mut copy = machine(&[]);
        assert!(copy.unmarshal(&snapshot).is_ok());
    }

    #[test]
    fn test_unmarshal_rejects_other_versions() {
        let hardware = machine(&[]);
        let mut snapshot = hardware.marshal();
        snapshot.version = "1.0".to_string();
        let mut copy = machine(&[]);
        assert!(matches!(
            copy.unmarshal(&snapshot),
            Err(SnapshotError::Version { .. })
        ));
    }

    #[test]
    fn test_reconnect_moves_port_range() {
        // MVI A,7; OUT 0x10; OUT 0x20
        let mut hardware = machine(&[0x3e, 0x07, 0xd3, 0x10, 0xd3, 0x20]);
        let latch = hardware.add_device(Box::new(OutputLatch::new("LATCH")));
        hardware.map_ports(latch, 0x10, 1, PortDirection::Output);
        assert!(hardware.reconnect(latch, 0x20));

        let (cpu, bus) = hardware.split_mut();
        cpu.step(bus);
        cpu.step(bus);
        let mut state = DeviceState::new("LATCH");
        bus.device(latch).marshal(&mut state, 0);
        assert_eq!(state.get("REGISTER"), Some("0"));

        cpu.step(bus);
        bus.device(latch).marshal(&mut state, 0);
        assert_eq!(state.get("REGISTER"), Some("7"));
    }
}
