//! Guest linear memory as seen by the CPU core.

/// Little-endian byte-addressed guest memory.
///
/// Accesses are infallible; page protection is enforced by the memory subsystem, not by the CPU
/// core. `is_readable` is only consulted by diagnostics that must not touch unmapped memory.
pub trait GuestMemory {
    fn read_u8(&self, addr: u32) -> u8;
    fn write_u8(&mut self, addr: u32, value: u8);

    fn is_readable(&self, _addr: u32, _len: u32) -> bool {
        true
    }

    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }

    fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.read_u8(addr),
            self.read_u8(addr.wrapping_add(1)),
            self.read_u8(addr.wrapping_add(2)),
            self.read_u8(addr.wrapping_add(3)),
        ])
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), b);
        }
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), b);
        }
    }
}

/// Contiguous memory starting at linear address 0.
///
/// Reads beyond the end return zero and writes beyond the end are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copies `data` in at `addr`, truncating at the end of memory.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = (addr as usize).min(self.bytes.len());
        let end = start.saturating_add(data.len()).min(self.bytes.len());
        self.bytes[start..end].copy_from_slice(&data[..end - start]);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl GuestMemory for FlatMemory {
    fn read_u8(&self, addr: u32) -> u8 {
        self.bytes.get(addr as usize).copied().unwrap_or(0)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        if let Some(b) = self.bytes.get_mut(addr as usize) {
            *b = value;
        }
    }

    fn is_readable(&self, addr: u32, len: u32) -> bool {
        (addr as usize)
            .checked_add(len as usize)
            .is_some_and(|end| end <= self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_round_trip() {
        let mut mem = FlatMemory::new(16);
        mem.write_u32(4, 0xDEAD_BEEF);
        assert_eq!(mem.read_u8(4), 0xEF);
        assert_eq!(mem.read_u16(6), 0xDEAD);
        assert_eq!(mem.read_u32(4), 0xDEAD_BEEF);
    }

    #[test]
    fn out_of_range_accesses_are_inert() {
        let mut mem = FlatMemory::new(4);
        mem.write_u32(2, 0x1122_3344);
        assert_eq!(mem.as_slice(), &[0, 0, 0x44, 0x33]);
        assert_eq!(mem.read_u8(100), 0);
        assert!(mem.is_readable(0, 4));
        assert!(!mem.is_readable(1, 4));

        mem.load(3, &[9, 9, 9]);
        assert_eq!(mem.read_u8(3), 9);
    }
}
