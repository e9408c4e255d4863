use crate::types::DeviceId;
use std::fmt;

/// Level asserted by a pin on its net
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinValue {
    Low,
    High,
    HighZ, // Tri-state, does not drive the net
}

impl PinValue {
    /// Any non-zero level is High
    pub fn from_level(level: u8) -> Self {
        if level != 0 {
            PinValue::High
        } else {
            PinValue::Low
        }
    }

    /// Normalized 0/1 level as seen by a consumer; a floating pin reads 1
    pub fn level(&self) -> u8 {
        match self {
            PinValue::Low => 0,
            PinValue::High | PinValue::HighZ => 1,
        }
    }

    pub fn is_driving(&self) -> bool {
        *self != PinValue::HighZ
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            PinValue::Low => '0',
            PinValue::High => '1',
            PinValue::HighZ => 'Z',
        };
        write!(f, "{}", symbol)
    }
}

/// Address of one pin: pin number `pin` of device `device`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PinId {
    pub device: DeviceId,
    pub pin: usize,
}

impl PinId {
    pub fn new(device: DeviceId, pin: usize) -> Self {
        PinId { device, pin }
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.pin)
    }
}

/// Edge sensitivity for clocked inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Whether the transition `from -> to` is this edge
    pub fn matches(&self, from: u8, to: u8) -> bool {
        match self {
            Edge::Rising => from == 0 && to != 0,
            Edge::Falling => from != 0 && to == 0,
        }
    }
}
