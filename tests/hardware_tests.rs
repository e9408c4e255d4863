//! Machine-level lifecycle: power-up state of the memory overlay,
//! suspension, breakpoints in running loops and snapshot timing

mod common;

use common::*;
use retro_sim::components::clock::FrequencyGenerator;
use retro_sim::components::cpu::Intel8080;
use retro_sim::components::io::{Intel8255, OutputLatch};
use retro_sim::components::memory::MappedMemory;
use retro_sim::{Hardware, InstructionKind, PortDirection, StopReason};
use std::collections::HashSet;

fn write_port(hardware: &mut Hardware, port: u8, data: u8) {
    let (cpu, bus) = hardware.split_mut();
    bus.port_output(cpu.ports(), port, data);
}

fn idle(hardware: &mut Hardware, cycles: u64) {
    let (cpu, bus) = hardware.split_mut();
    cpu.idle(bus, cycles);
}

#[cfg(test)]
mod overlay_tests {
    use super::*;

    /// All-RAM machine whose first 256 bytes are shadowed by a 0xAA overlay
    fn overlay_machine() -> Hardware {
        let mut hardware = Hardware::new("PMD", Box::new(Intel8080::new("CPU")));
        let memory = MappedMemory::new("MEMORY", 64, 64).with_overlay(vec![0xaa; 0x100]);
        hardware.add_memory(Box::new(memory));
        let pio = hardware.add_device(Box::new(Intel8255::new("PIO")));
        hardware.map_ports(pio, 0xf4, 4, PortDirection::Both);
        hardware
    }

    #[test]
    fn test_floating_all_ram_keeps_overlay_at_power_up() {
        let mut hardware = overlay_machine();
        hardware.connect(&[("PIO", "PC4"), ("MEMORY", "ALL_RAM")]).unwrap();
        hardware.reset();
        assert_eq!(hardware.bus().peek(0x0010), 0xaa);
    }

    #[test]
    fn test_unconnected_all_ram_keeps_overlay() {
        let mut hardware = overlay_machine();
        hardware.reset();
        assert_eq!(hardware.bus().peek(0x0010), 0xaa);
    }

    #[test]
    fn test_port_c_switches_overlay() {
        let mut hardware = overlay_machine();
        hardware.connect(&[("PIO", "PC4"), ("MEMORY", "ALL_RAM")]).unwrap();
        hardware.reset();

        // every port output, latches cleared: PC4 driven low
        write_port(&mut hardware, 0xf7, 0x80);
        assert_eq!(hardware.bus().peek(0x0010), 0xaa);

        // bit set PC4
        write_port(&mut hardware, 0xf7, 0x09);
        assert_eq!(hardware.bus().peek(0x0010), 0x00);

        // back to inputs: the pin floats and the overlay returns
        write_port(&mut hardware, 0xf7, 0x9b);
        assert_eq!(hardware.bus().peek(0x0010), 0xaa);
    }

    #[test]
    fn test_reset_restores_overlay() {
        let mut hardware = overlay_machine();
        hardware.connect(&[("PIO", "PC4"), ("MEMORY", "ALL_RAM")]).unwrap();
        hardware.reset();
        write_port(&mut hardware, 0xf7, 0x80);
        write_port(&mut hardware, 0xf7, 0x09);
        assert_eq!(hardware.bus().peek(0x0010), 0x00);

        hardware.reset();
        assert_eq!(hardware.bus().peek(0x0010), 0xaa);
    }
}

#[cfg(test)]
mod execution_tests {
    use super::*;

    // MVI A,0; loop: INR A; OUT 10h; JMP loop
    const COUNT_LOOP: [u8; 8] = [0x3e, 0x00, 0x3c, 0xd3, 0x10, 0xc3, 0x02, 0x00];

    #[test]
    fn test_breakpoint_on_loop_head() {
        let mut hardware = machine_8080(&COUNT_LOOP);
        let leds = hardware.add_device(Box::new(OutputLatch::new("LEDS")));
        hardware.map_ports(leds, 0x10, 1, PortDirection::Output);
        hardware.reset();
        let breakpoints: HashSet<u16> = [0x0002].into_iter().collect();

        // only MVI ran: nothing reached the latch yet
        let reason = hardware.exec(1000, InstructionKind::NONE, &breakpoints);
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(hardware.processor().pc(), 0x0002);
        assert_eq!(hardware.processor().system_clock(), 7);
        assert_eq!(register(&hardware, "LEDS", "REGISTER").as_deref(), Some("0"));

        // one full pass: INR, OUT, JMP
        for pass in 1..=3 {
            let reason = hardware.exec(1000, InstructionKind::NONE, &breakpoints);
            assert_eq!(reason, StopReason::Breakpoint);
            assert_eq!(hardware.processor().pc(), 0x0002);
            assert_eq!(hardware.processor().system_clock(), 7 + 25 * pass);
            let expected = pass.to_string();
            assert_eq!(
                register(&hardware, "LEDS", "REGISTER").as_deref(),
                Some(expected.as_str())
            );
        }
    }

    #[test]
    fn test_breakpoint_wins_over_exhausted_budget() {
        let mut hardware = machine_8080(&[0x00; 16]);
        hardware.reset();
        let breakpoints: HashSet<u16> = [0x0002].into_iter().collect();
        let reason = hardware.exec(8, InstructionKind::NONE, &breakpoints);
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(hardware.processor().system_clock(), 8);
    }

    #[test]
    fn test_suspended_machine_stands_still() {
        let mut hardware = machine_8080(&[0x00; 64]);
        let (ticker, log) = MockTicker::new("TICKER");
        let ticker = hardware.add_device(Box::new(ticker));
        hardware.map_ports(ticker, 0x40, 1, PortDirection::Output);
        hardware.reset();
        write_port(&mut hardware, 0x40, 10);

        hardware.suspend();
        assert_eq!(hardware.run_tick(), StopReason::Suspended);
        idle(&mut hardware, 50);
        {
            let (cpu, bus) = hardware.split_mut();
            assert_eq!(cpu.step(bus), StopReason::Suspended);
        }
        assert_eq!(hardware.processor().system_clock(), 0);
        assert_eq!(hardware.processor().pc(), 0x0000);
        assert!(log.borrow().is_empty());
        assert_eq!(hardware.bus().scheduler().pending(), 1);

        hardware.resume();
        idle(&mut hardware, 10);
        assert_eq!(*log.borrow(), vec![(10, 0, 10)]);
    }
}

#[cfg(test)]
mod snapshot_timing_tests {
    use super::*;

    fn oscillator_machine() -> Hardware {
        let mut hardware = machine_8080(&[0x00; 64]);
        hardware.add_device(Box::new(FrequencyGenerator::new("OSC", 100, 100)));
        hardware.reset();
        hardware
    }

    #[test]
    fn test_round_trip_after_exec_keeps_phase() {
        let mut hardware = oscillator_machine();
        // eight NOPs overshoot the budget by two cycles
        hardware.exec(30, InstructionKind::NONE, &HashSet::new());
        assert_eq!(hardware.processor().system_clock(), 32);
        assert_eq!(hardware.bus().scheduler().now(), 32);
        assert_eq!(register(&hardware, "OSC", "COUNTER").as_deref(), Some("68"));

        let snapshot = hardware.marshal();
        hardware.unmarshal(&snapshot).unwrap();
        assert_eq!(register(&hardware, "OSC", "COUNTER").as_deref(), Some("68"));
    }

    #[test]
    fn test_device_missing_from_snapshot_keeps_its_event() {
        let mut hardware = oscillator_machine();
        idle(&mut hardware, 30);
        let mut snapshot = hardware.marshal();
        snapshot.devices.retain(|device| device.name != "OSC");

        hardware.unmarshal(&snapshot).unwrap();
        assert_eq!(register(&hardware, "OSC", "COUNTER").as_deref(), Some("70"));
        assert_eq!(hardware.bus().scheduler().pending(), 1);
    }
}
