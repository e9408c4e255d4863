//! Combinational gates built on the pin/node layer.
//!
//! Pins `0..n` are inputs named `IN0..`, pin `n` is the output `OUT`.

use crate::component::{Device, Signals};
use crate::pin::PinValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Nand,
    Nor,
    Xnor,
}

impl GateKind {
    fn eval(&self, inputs: &[u8]) -> u8 {
        match self {
            GateKind::Nand => inputs.iter().any(|&level| level == 0) as u8,
            GateKind::Nor => inputs.iter().all(|&level| level == 0) as u8,
            GateKind::Xnor => (inputs.iter().filter(|&&level| level != 0).count() % 2 == 0) as u8,
        }
    }
}

pub struct Gate {
    name: String,
    kind: GateKind,
    inputs: Vec<u8>, // Last level seen on each input net
    output: u8,
}

impl Gate {
    pub fn new(name: &str, kind: GateKind, inputs: usize) -> Self {
        assert!(inputs > 0, "a gate needs at least one input");
        let levels = vec![1; inputs];
        let output = kind.eval(&levels);
        Gate {
            name: name.to_string(),
            kind,
            inputs: levels,
            output,
        }
    }

    pub fn nand(name: &str, inputs: usize) -> Self {
        Gate::new(name, GateKind::Nand, inputs)
    }

    /// One-input NAND
    pub fn inverter(name: &str) -> Self {
        Gate::new(name, GateKind::Nand, 1)
    }

    pub fn nor(name: &str, inputs: usize) -> Self {
        Gate::new(name, GateKind::Nor, inputs)
    }

    pub fn xnor(name: &str, inputs: usize) -> Self {
        Gate::new(name, GateKind::Xnor, inputs)
    }

    pub fn output_pin(&self) -> usize {
        self.inputs.len()
    }

    fn update(&mut self, signals: &mut Signals) {
        let output = self.kind.eval(&self.inputs);
        if output != self.output {
            self.output = output;
            signals.notify_change_node(self.output_pin());
        }
    }
}

impl Device for Gate {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..self.inputs.len()).map(|i| format!("IN{}", i)).collect();
        names.push("OUT".to_string());
        names
    }

    fn reset(&mut self, signals: &mut Signals) {
        for (pin, level) in self.inputs.iter_mut().enumerate() {
            *level = signals.query_node(pin);
        }
        self.output = self.kind.eval(&self.inputs);
    }

    fn post_unmarshal(&mut self, signals: &mut Signals) {
        self.reset(signals);
    }

    fn query(&self, pin: usize) -> PinValue {
        if pin == self.output_pin() {
            PinValue::from_level(self.output)
        } else {
            PinValue::HighZ
        }
    }

    fn notify_change(&mut self, pin: usize, level: u8, signals: &mut Signals) {
        if pin < self.inputs.len() {
            self.inputs[pin] = level;
            self.update(signals);
        }
    }
}
