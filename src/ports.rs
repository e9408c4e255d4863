//! Port-mapped I/O dispatch table.
//!
//! 256 input and 256 output ports, each with any number of registered
//! elements. Peripherals usually claim a contiguous range from a base
//! port through [`PortTable::bind`] and can later be moved with
//! [`PortTable::reconnect`].

use crate::types::DeviceId;
use log::debug;
use serde::{Deserialize, Serialize};

pub const PORT_COUNT: usize = 256;

/// Value read from a port nobody drives
pub const IDLE_PORT_VALUE: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
    Both,
}

impl PortDirection {
    fn has_input(&self) -> bool {
        matches!(self, PortDirection::Input | PortDirection::Both)
    }

    fn has_output(&self) -> bool {
        matches!(self, PortDirection::Output | PortDirection::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub element: DeviceId,
    pub base: u8,
    pub span: u8,
    pub direction: PortDirection,
}

impl PortBinding {
    fn ports(&self) -> impl Iterator<Item = u8> {
        let base = self.base;
        (0..self.span).map(move |offset| base.wrapping_add(offset))
    }
}

#[derive(Debug, Clone)]
pub struct PortTable {
    inputs: Vec<Vec<DeviceId>>,
    outputs: Vec<Vec<DeviceId>>,
    bindings: Vec<PortBinding>,
}

impl Default for PortTable {
    fn default() -> Self {
        PortTable::new()
    }
}

impl PortTable {
    pub fn new() -> Self {
        PortTable {
            inputs: vec![Vec::new(); PORT_COUNT],
            outputs: vec![Vec::new(); PORT_COUNT],
            bindings: Vec::new(),
        }
    }

    pub fn add_input(&mut self, port: u8, element: DeviceId) {
        let list = &mut self.inputs[port as usize];
        if !list.contains(&element) {
            list.push(element);
        }
    }

    pub fn add_output(&mut self, port: u8, element: DeviceId) {
        let list = &mut self.outputs[port as usize];
        if !list.contains(&element) {
            list.push(element);
        }
    }

    pub fn remove_input(&mut self, port: u8, element: DeviceId) {
        self.inputs[port as usize].retain(|id| *id != element);
    }

    pub fn remove_output(&mut self, port: u8, element: DeviceId) {
        self.outputs[port as usize].retain(|id| *id != element);
    }

    pub fn clear_input(&mut self, port: u8) {
        self.inputs[port as usize].clear();
    }

    pub fn clear_output(&mut self, port: u8) {
        self.outputs[port as usize].clear();
    }

    pub fn inputs(&self, port: u8) -> &[DeviceId] {
        &self.inputs[port as usize]
    }

    pub fn outputs(&self, port: u8) -> &[DeviceId] {
        &self.outputs[port as usize]
    }

    /// Register `element` on `span` ports starting at `base`.
    /// A previous binding of the same element is replaced.
    pub fn bind(&mut self, element: DeviceId, base: u8, span: u8, direction: PortDirection) {
        assert!(
            span > 0 && base as usize + span as usize <= PORT_COUNT,
            "port range {:02x}+{} out of the port space",
            base,
            span
        );
        self.unbind(element);
        let binding = PortBinding {
            element,
            base,
            span,
            direction,
        };
        self.register(&binding);
        self.bindings.push(binding);
        debug!(
            "element {} bound to ports {:02x}..{:02x}",
            element,
            base,
            base as usize + span as usize - 1
        );
    }

    pub fn unbind(&mut self, element: DeviceId) {
        if let Some(index) = self.bindings.iter().position(|b| b.element == element) {
            let binding = self.bindings.remove(index);
            self.deregister(&binding);
        }
    }

    pub fn binding(&self, element: DeviceId) -> Option<&PortBinding> {
        self.bindings.iter().find(|b| b.element == element)
    }

    /// Move a bound element to a new base port.
    /// Returns false if the element has no binding.
    pub fn reconnect(&mut self, element: DeviceId, new_base: u8) -> bool {
        let Some(index) = self.bindings.iter().position(|b| b.element == element) else {
            return false;
        };
        let binding = self.bindings[index];
        if binding.base == new_base {
            debug!("element {}: reconnection not required", element);
            return true;
        }
        assert!(
            new_base as usize + binding.span as usize <= PORT_COUNT,
            "port range {:02x}+{} out of the port space",
            new_base,
            binding.span
        );
        self.deregister(&binding);
        let moved = PortBinding {
            base: new_base,
            ..binding
        };
        self.register(&moved);
        self.bindings[index] = moved;
        debug!(
            "element {} reconnected from {:02x} to {:02x}",
            element, binding.base, new_base
        );
        true
    }

    fn register(&mut self, binding: &PortBinding) {
        for port in binding.ports() {
            if binding.direction.has_input() {
                self.add_input(port, binding.element);
            }
            if binding.direction.has_output() {
                self.add_output(port, binding.element);
            }
        }
    }

    fn deregister(&mut self, binding: &PortBinding) {
        for port in binding.ports() {
            self.remove_input(port, binding.element);
            self.remove_output(port, binding.element);
        }
    }
}
