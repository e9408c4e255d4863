use super::MEMORY_SIZE;
use crate::component::{Device, Memory};
use crate::snapshot::{DeviceState, SnapshotError};
use log::trace;

pub const COMBINED_BLOCK: &str = "COMBINED";

/// Flat 64 KiB memory with one write-protected window.
///
/// Addresses in `[start_rom, start_ram)` (both given in KiB) are ROM:
/// writes there are dropped, everything else is RAM.
pub struct SimpleMemory {
    name: String,
    data: Vec<u8>,
    start_rom: usize,
    start_ram: usize,
}

impl SimpleMemory {
    pub fn new(name: &str, start_rom_kib: usize, start_ram_kib: usize) -> Self {
        assert!(
            start_rom_kib <= 64 && start_ram_kib <= 64,
            "memory boundaries beyond 64 KiB"
        );
        SimpleMemory {
            name: name.to_string(),
            data: vec![0u8; MEMORY_SIZE],
            start_rom: start_rom_kib * 0x400,
            start_ram: start_ram_kib * 0x400,
        }
    }

    /// All RAM, no protected window
    pub fn ram(name: &str) -> Self {
        SimpleMemory::new(name, 64, 64)
    }

    pub fn is_writable(&self, address: u16) -> bool {
        let address = address as usize;
        address < self.start_rom || address >= self.start_ram
    }

    /// Bulk load bypassing write protection (ROM images, program loaders)
    pub fn load(&mut self, address: u16, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.data[(address as usize + offset) & 0xffff] = *byte;
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Store `data` if the address is writable; returns the previous byte
    /// when the write went through
    pub(crate) fn write(&mut self, address: u16, data: u8) -> Option<u8> {
        if self.is_writable(address) {
            let old = self.data[address as usize];
            self.data[address as usize] = data;
            Some(old)
        } else {
            trace!("{}: write denied at {:04x}", self.name, address);
            None
        }
    }
}

impl Memory for SimpleMemory {
    fn get_byte(&mut self, address: u16) -> u8 {
        self.data[address as usize]
    }

    fn set_byte(&mut self, address: u16, data: u8) {
        self.write(address, data);
    }

    fn peek(&self, address: u16) -> u8 {
        self.data[address as usize]
    }

    fn block_names(&self) -> Vec<String> {
        vec![COMBINED_BLOCK.to_string()]
    }

    fn block(&self, name: &str) -> Option<&[u8]> {
        (name == COMBINED_BLOCK).then_some(self.data.as_slice())
    }

    fn block_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        (name == COMBINED_BLOCK).then_some(self.data.as_mut_slice())
    }
}

impl Device for SimpleMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn marshal(&self, state: &mut DeviceState, _clock: u64) {
        state.put_block(COMBINED_BLOCK, &self.data);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        state.restore_block(COMBINED_BLOCK, &mut self.data)
    }

    fn as_memory(&self) -> Option<&dyn Memory> {
        Some(self)
    }

    fn as_memory_mut(&mut self) -> Option<&mut dyn Memory> {
        Some(self)
    }
}
