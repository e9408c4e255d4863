use log::{LevelFilter, Log, Metadata, Record};
use retro_sim::components::cpu::StopReason;
use retro_sim::system_config::MachineFactory;
use retro_sim::Hardware;
use std::time::Instant;

/// Counts to ten on a down counter clocked by bit 0 of an output latch:
///
/// ```text
/// 0000 3e 0a      MVI A,10
/// 0002 d3 20      OUT 20h
/// 0004 af         XRA A
/// 0005 3c         INR A
/// 0006 d3 10      OUT 10h
/// 0008 db 20      IN 20h
/// 000a b7         ORA A
/// 000b c2 05 00   JNZ 0005h
/// 000e 76         HLT
/// ```
const DEMO_MACHINE: &str = r#"{
    "name": "Counter Demo",
    "description": "8080 trainer with a latch and a down counter",
    "cpu": "i8080",
    "clock_hz": 2000000,
    "tick_ms": 1,
    "memory": {"start_rom": 0, "start_ram": 1},
    "program": {"origin": 0, "hex": "3e0a d320 af 3c d310 db20 b7 c20500 76"},
    "devices": [
        {"type": "output_latch", "name": "LEDS"},
        {"type": "down_counter", "name": "TIMER"}
    ],
    "nodes": [["LEDS.Q0", "TIMER.CLK"]],
    "ports": [
        {"device": "LEDS", "base": 16, "direction": "output"},
        {"device": "TIMER", "base": 32}
    ]
}"#;

const MAX_TICKS: usize = 100;

/// Minimal stderr sink for the `log` facade
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|arg| arg == "-v" || arg == "--verbose");
    let path = args.iter().find(|arg| !arg.starts_with('-'));

    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    println!("Retro Sim - 8-bit Hardware Simulation Core");
    println!("==========================================");

    let factory = MachineFactory::new();
    let built = match path {
        Some(path) => factory.build_from_file(path),
        None => factory.build_from_json(DEMO_MACHINE),
    };
    let mut machine = match built {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("Failed to build machine: {}", e);
            std::process::exit(1);
        }
    };

    println!("Machine: {}", machine.name());
    println!("  Devices: {}", machine.members().len());
    println!("  Cycles per tick: {}", machine.cycles_per_tick());
    println!();

    machine.reset();
    run(&mut machine);
}

fn run(machine: &mut Hardware) {
    let start_time = Instant::now();
    let mut ticks = 0;
    let mut reason = StopReason::Budget;

    while ticks < MAX_TICKS {
        reason = machine.run_tick();
        ticks += 1;
        if reason != StopReason::Budget || machine.processor().is_halted() {
            break;
        }
    }

    println!("Stopped after {} ticks ({:?})", ticks, reason);
    println!("  {}", machine.processor().state_string());
    println!("  Clock: {} cycles", machine.processor().system_clock());

    for &id in machine.members() {
        let device = machine.bus().device(id);
        let mut state = retro_sim::DeviceState::new(device.name());
        device.marshal(&mut state, machine.processor().system_clock());
        let registers: Vec<String> = state
            .registers
            .iter()
            .map(|register| format!("{}={}", register.name, register.value))
            .collect();
        if !registers.is_empty() {
            println!("  {}: {}", device.name(), registers.join(" "));
        }
    }

    match machine.marshal().to_json() {
        Ok(json) => println!("Snapshot size: {} bytes", json.len()),
        Err(e) => eprintln!("Failed to serialize snapshot: {}", e),
    }
    println!("Elapsed: {:?}", start_time.elapsed());
}
