//! Electrical nets ("nodes") joining device pins.
//!
//! Membership is fixed when a node is created. Resolution is a wired-AND:
//! any pin asserting 0 pulls the net low, tri-stated pins do not take part,
//! and a net nobody drives floats high. A floating net is still told apart
//! from one actively driven high, and going from one to the other counts
//! as a change.

use crate::pin::{PinId, PinValue};
use crate::types::{DeviceId, NodeId};
use log::trace;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WiringError {
    #[error("a node needs at least one pin")]
    EmptyNode,
    #[error("pin {0} is already connected to node {1}")]
    AlreadyConnected(PinId, usize),
    #[error("pin {0} appears more than once in the same node")]
    Duplicate(PinId),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("device '{device}' has no pin '{pin}'")]
    UnknownPin { device: String, pin: String },
    #[error("no device named '{0}'")]
    UnknownDeviceName(String),
}

/// Combine the levels asserted on one net
pub fn wired_and<I>(values: I) -> u8
where
    I: IntoIterator<Item = PinValue>,
{
    let mut level = 1;
    for value in values {
        if value == PinValue::Low {
            level = 0;
        }
    }
    level
}

#[derive(Debug, Clone)]
struct Node {
    pins: Vec<PinId>,
    level: Option<u8>, // Last resolved level, None before first resolution
    driven: bool,
}

/// Table of all nodes of one machine plus the pin -> node index
#[derive(Debug, Default)]
pub struct Net {
    nodes: Vec<Node>,
    membership: HashMap<PinId, NodeId>,
}

impl Net {
    pub fn new() -> Self {
        Net::default()
    }

    /// Create a node joining `pins`
    pub fn connect(&mut self, pins: &[PinId]) -> Result<NodeId, WiringError> {
        if pins.is_empty() {
            return Err(WiringError::EmptyNode);
        }
        for (i, pin) in pins.iter().enumerate() {
            if let Some(node) = self.membership.get(pin) {
                return Err(WiringError::AlreadyConnected(*pin, node.index()));
            }
            if pins[..i].contains(pin) {
                return Err(WiringError::Duplicate(*pin));
            }
        }

        let id = NodeId(self.nodes.len());
        for pin in pins {
            self.membership.insert(*pin, id);
        }
        self.nodes.push(Node {
            pins: pins.to_vec(),
            level: None,
            driven: false,
        });
        trace!("node {} created with {} pins", id.index(), pins.len());
        Ok(id)
    }

    pub fn node_of(&self, pin: PinId) -> Option<NodeId> {
        self.membership.get(&pin).copied()
    }

    pub fn members(&self, node: NodeId) -> &[PinId] {
        &self.nodes[node.index()].pins
    }

    pub fn level(&self, node: NodeId) -> Option<u8> {
        self.nodes[node.index()].level
    }

    /// Level seen on `pin`'s net; an unconnected or unresolved pin reads 1
    pub fn level_of(&self, pin: PinId) -> u8 {
        self.node_of(pin)
            .and_then(|node| self.level(node))
            .unwrap_or(1)
    }

    /// True when some pin on `pin`'s net asserts a level instead of
    /// floating; unconnected and unresolved pins are not driven
    pub fn is_driven(&self, pin: PinId) -> bool {
        self.node_of(pin)
            .is_some_and(|node| self.nodes[node.index()].driven)
    }

    /// Recompute the level of `node` from its pins.
    /// Returns the new level only when it, or whether anything drives the
    /// node, differs from the cached state.
    pub fn resolve<F>(&mut self, node: NodeId, mut query: F) -> Option<u8>
    where
        F: FnMut(PinId) -> PinValue,
    {
        let entry = &mut self.nodes[node.index()];
        let values: Vec<PinValue> = entry.pins.iter().map(|pin| query(*pin)).collect();
        let level = wired_and(values.iter().copied());
        let driven = values.iter().any(|value| *value != PinValue::HighZ);
        if entry.level == Some(level) && entry.driven == driven {
            return None;
        }
        trace!(
            "node {} resolved to {}{}",
            node.index(),
            level,
            if driven { "" } else { " (floating)" }
        );
        entry.level = Some(level);
        entry.driven = driven;
        Some(level)
    }

    /// Forget every cached level so the next resolution notifies all members
    pub fn invalidate_all(&mut self) {
        for node in &mut self.nodes {
            node.level = None;
            node.driven = false;
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }
}
