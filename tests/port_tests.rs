//! Port dispatch: idle reads, dropped writes, shared ports and moving an
//! element's port range at run time

mod common;

use common::*;
use retro_sim::components::io::{Intel8255, OutputLatch};
use retro_sim::components::logic::{FixedPin, Probe};
use retro_sim::components::timer::DownCounter;
use retro_sim::{Hardware, PortDirection};

fn write_port(hardware: &mut Hardware, port: u8, data: u8) {
    let (cpu, bus) = hardware.split_mut();
    bus.port_output(cpu.ports(), port, data);
}

fn read_port(hardware: &mut Hardware, port: u8) -> u8 {
    let (cpu, bus) = hardware.split_mut();
    bus.port_input(cpu.ports(), port)
}

#[test]
fn test_unregistered_port_reads_ff_from_program() {
    // LD A,0; IN A,(77h); OUT (10h),A; OUT (55h),A; HALT
    let mut hardware = machine_z80(&[0x3e, 0x00, 0xdb, 0x77, 0xd3, 0x10, 0xd3, 0x55, 0x76]);
    let latch = hardware.add_device(Box::new(OutputLatch::new("LATCH")));
    hardware.map_ports(latch, 0x10, 1, PortDirection::Output);
    hardware.reset();
    hardware.run_tick();

    assert!(hardware.processor().is_halted());
    assert_eq!(register(&hardware, "LATCH", "REGISTER").as_deref(), Some("255"));
}

#[test]
fn test_output_only_element_is_not_read() {
    let mut hardware = machine_8080(&[]);
    let timer = hardware.add_device(Box::new(DownCounter::new("TIMER")));
    hardware.map_ports(timer, 0x20, 1, PortDirection::Output);
    write_port(&mut hardware, 0x20, 0x12);
    assert_eq!(register(&hardware, "TIMER", "COUNT").as_deref(), Some("18"));
    assert_eq!(read_port(&mut hardware, 0x20), 0xff);
}

#[test]
fn test_shared_input_port_ands_values() {
    let mut hardware = machine_8080(&[]);
    let first = hardware.add_device(Box::new(DownCounter::new("FIRST")));
    let second = hardware.add_device(Box::new(DownCounter::new("SECOND")));
    hardware.map_ports(first, 0x20, 1, PortDirection::Both);
    hardware.map_ports(second, 0x21, 1, PortDirection::Both);
    hardware.processor_mut().add_io_input(0x22, first);
    hardware.processor_mut().add_io_input(0x22, second);

    write_port(&mut hardware, 0x20, 0x0f);
    write_port(&mut hardware, 0x21, 0x3c);
    assert_eq!(read_port(&mut hardware, 0x22), 0x0c);

    hardware.processor_mut().remove_io_input(0x22, first);
    assert_eq!(read_port(&mut hardware, 0x22), 0x3c);
    hardware.processor_mut().clear_io_input(0x22);
    assert_eq!(read_port(&mut hardware, 0x22), 0xff);
}

fn ppi_machine() -> (Hardware, retro_sim::components::logic::ProbeLog) {
    let mut hardware = machine_8080(&[]);
    let ppi = hardware.add_device(Box::new(Intel8255::new("PPI")));
    hardware.add_device(Box::new(FixedPin::new("GND", 0)));
    let (probe, log) = Probe::new("PROBE");
    hardware.add_device(Box::new(probe));
    hardware.map_ports(ppi, 0x80, 4, PortDirection::Both);
    hardware.connect(&[("PPI", "PA0"), ("PROBE", "IN")]).unwrap();
    hardware.connect(&[("PPI", "PB0"), ("GND", "OUT")]).unwrap();
    hardware.reset();
    (hardware, log)
}

#[test]
fn test_ppi_ports() {
    let (mut hardware, log) = ppi_machine();
    // port A output, everything else input
    write_port(&mut hardware, 0x83, 0x8b);
    write_port(&mut hardware, 0x80, 0x55);
    assert_eq!(log.last(), Some(1));
    assert_eq!(read_port(&mut hardware, 0x80), 0x55);
    assert_eq!(read_port(&mut hardware, 0x81), 0xfe);

    write_port(&mut hardware, 0x80, 0x54);
    assert_eq!(log.last(), Some(0));
}

#[test]
fn test_reconnect_moves_ppi() {
    let (mut hardware, log) = ppi_machine();
    let ppi = hardware.device_id("PPI").unwrap();
    write_port(&mut hardware, 0x83, 0x8b);
    assert!(hardware.reconnect(ppi, 0x40));

    write_port(&mut hardware, 0x80, 0x01);
    assert_eq!(log.last(), Some(0));
    assert_eq!(read_port(&mut hardware, 0x81), 0xff);
    assert_eq!(read_port(&mut hardware, 0x41), 0xfe);

    write_port(&mut hardware, 0x40, 0x01);
    assert_eq!(log.last(), Some(1));
    let binding = hardware.processor().ports().binding(ppi).unwrap();
    assert_eq!((binding.base, binding.span), (0x40, 4));
}

#[test]
fn test_reconnect_unbound_element() {
    let mut hardware = machine_8080(&[]);
    let latch = hardware.add_device(Box::new(OutputLatch::new("LATCH")));
    assert!(!hardware.reconnect(latch, 0x10));
    hardware.map_ports(latch, 0x10, 1, PortDirection::Output);
    assert!(hardware.reconnect(latch, 0x10));
}
