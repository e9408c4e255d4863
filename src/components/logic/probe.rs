use crate::component::{Device, Signals};
use std::cell::RefCell;
use std::rc::Rc;

/// Shared record of every level a probe was told about
#[derive(Debug, Clone, Default)]
pub struct ProbeLog(Rc<RefCell<Vec<u8>>>);

impl ProbeLog {
    pub fn levels(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn last(&self) -> Option<u8> {
        self.0.borrow().last().copied()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// Passive sink on one net; never drives it
pub struct Probe {
    name: String,
    log: ProbeLog,
}

impl Probe {
    pub const IN: usize = 0;

    pub fn new(name: &str) -> (Self, ProbeLog) {
        let log = ProbeLog::default();
        (
            Probe {
                name: name.to_string(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl Device for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["IN".to_string()]
    }

    fn notify_change(&mut self, _pin: usize, level: u8, _signals: &mut Signals) {
        self.log.0.borrow_mut().push(level);
    }
}
