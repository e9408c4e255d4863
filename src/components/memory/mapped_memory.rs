use super::simple_memory::{SimpleMemory, COMBINED_BLOCK};
use crate::component::{Device, Memory, Signals};
use crate::snapshot::{DeviceState, SnapshotError};
use log::debug;

/// Reads pass through this hook: `(address, data) -> data`
pub type ReadListener = Box<dyn FnMut(u16, u8) -> u8>;

/// Called after every accepted write with `(address, old, new)`
pub type WriteListener = Box<dyn FnMut(u16, u8, u8)>;

pub const ROM_BLOCK: &str = "ROM";

/// [`SimpleMemory`] with access hooks and a switchable ROM overlay.
///
/// Unless the `ALL_RAM` pin is actively driven high the overlay image
/// shadows the bottom of the address space for reads; writes there still
/// land in the RAM below. A floating `ALL_RAM` keeps the overlay in.
pub struct MappedMemory {
    memory: SimpleMemory,
    overlay: Vec<u8>,
    all_ram: bool,
    read_listener: Option<ReadListener>,
    write_listener: Option<WriteListener>,
}

impl MappedMemory {
    pub const ALL_RAM: usize = 0;

    pub fn new(name: &str, start_rom_kib: usize, start_ram_kib: usize) -> Self {
        MappedMemory {
            memory: SimpleMemory::new(name, start_rom_kib, start_ram_kib),
            overlay: Vec::new(),
            all_ram: false,
            read_listener: None,
            write_listener: None,
        }
    }

    /// Install a ROM image shadowing addresses `0..rom.len()`
    pub fn with_overlay(mut self, rom: Vec<u8>) -> Self {
        assert!(rom.len() <= 0x10000, "overlay larger than the address space");
        self.overlay = rom;
        self
    }

    pub fn set_read_listener(&mut self, listener: ReadListener) {
        self.read_listener = Some(listener);
    }

    pub fn set_write_listener(&mut self, listener: WriteListener) {
        self.write_listener = Some(listener);
    }

    pub fn clear_listeners(&mut self) {
        self.read_listener = None;
        self.write_listener = None;
    }

    pub fn is_all_ram(&self) -> bool {
        self.all_ram
    }

    pub fn inner(&self) -> &SimpleMemory {
        &self.memory
    }

    pub fn inner_mut(&mut self) -> &mut SimpleMemory {
        &mut self.memory
    }

    fn shadowed(&self, address: u16) -> Option<u8> {
        if self.all_ram {
            None
        } else {
            self.overlay.get(address as usize).copied()
        }
    }
}

impl Memory for MappedMemory {
    fn get_byte(&mut self, address: u16) -> u8 {
        let data = match self.shadowed(address) {
            Some(data) => data,
            None => self.memory.get_byte(address),
        };
        match self.read_listener.as_mut() {
            Some(listener) => listener(address, data),
            None => data,
        }
    }

    fn set_byte(&mut self, address: u16, data: u8) {
        if let Some(old) = self.memory.write(address, data) {
            if let Some(listener) = self.write_listener.as_mut() {
                listener(address, old, data);
            }
        }
    }

    fn peek(&self, address: u16) -> u8 {
        self.shadowed(address)
            .unwrap_or_else(|| self.memory.peek(address))
    }

    fn block_names(&self) -> Vec<String> {
        let mut names = self.memory.block_names();
        if !self.overlay.is_empty() {
            names.push(ROM_BLOCK.to_string());
        }
        names
    }

    fn block(&self, name: &str) -> Option<&[u8]> {
        if name == ROM_BLOCK && !self.overlay.is_empty() {
            return Some(&self.overlay);
        }
        self.memory.block(name)
    }

    fn block_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        if name == ROM_BLOCK && !self.overlay.is_empty() {
            return Some(&mut self.overlay);
        }
        self.memory.block_mut(name)
    }
}

impl Device for MappedMemory {
    fn name(&self) -> &str {
        self.memory.name()
    }

    fn pin_names(&self) -> Vec<String> {
        vec!["ALL_RAM".to_string()]
    }

    /// Powers up with the overlay in; the settle after reset announces
    /// whatever drives `ALL_RAM`
    fn reset(&mut self, _signals: &mut Signals) {
        self.all_ram = false;
    }

    fn notify_change(&mut self, pin: usize, level: u8, signals: &mut Signals) {
        let all_ram = level != 0 && signals.is_driven(Self::ALL_RAM);
        if pin == Self::ALL_RAM && self.all_ram != all_ram {
            self.all_ram = all_ram;
            debug!("{}: all-RAM mode {}", self.memory.name(), self.all_ram);
        }
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put_block(COMBINED_BLOCK, self.memory.data());
        if !self.overlay.is_empty() {
            state.put_block(ROM_BLOCK, &self.overlay);
        }
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        state.restore_block(COMBINED_BLOCK, self.memory.data_mut())?;
        state.restore_block(ROM_BLOCK, &mut self.overlay)
    }

    fn post_unmarshal(&mut self, signals: &mut Signals) {
        self.all_ram = signals.is_driven(Self::ALL_RAM) && signals.query_node(Self::ALL_RAM) != 0;
    }

    fn as_memory(&self) -> Option<&dyn Memory> {
        Some(self)
    }

    fn as_memory_mut(&mut self) -> Option<&mut dyn Memory> {
        Some(self)
    }
}
