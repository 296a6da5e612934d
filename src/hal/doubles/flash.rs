use super::error::FakeError;
use crate::hal::flash;
use std::ops::{Add, Sub};

#[derive(Copy, Clone, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct Address(pub u32);

/// Every mutation attempted on a [`FakeFlash`], in order of arrival.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Write { address: Address, length: usize },
    Erase { address: Address, length: usize },
}

enum Budget {
    Full,
    Torn,
    Dead,
}

/// In-memory flash with real device semantics: erases happen in whole
/// sectors, writes must be aligned and can only clear bits, and power
/// can be cut mid-operation to leave a torn result behind.
#[derive(Clone)]
pub struct FakeFlash {
    base: Address,
    data: Vec<u8>,
    sector_size: usize,
    alignment: usize,
    erased: u8,
    operations: Vec<Operation>,
    power_cut: Option<usize>,
    dead: bool,
}

impl FakeFlash {
    pub fn new(base: Address, size: usize, sector_size: usize, alignment: usize) -> FakeFlash {
        Self::with_erased_value(base, size, sector_size, alignment, 0xFF)
    }

    pub fn with_erased_value(
        base: Address,
        size: usize,
        sector_size: usize,
        alignment: usize,
        erased: u8,
    ) -> FakeFlash {
        assert!(size % sector_size == 0, "size must be a whole number of sectors");
        assert!(sector_size % alignment == 0, "sectors must hold whole write units");
        FakeFlash {
            base,
            data: vec![erased; size],
            sector_size,
            alignment,
            erased,
            operations: Vec::new(),
            power_cut: None,
            dead: false,
        }
    }

    /// Schedules a power cut: `count` further mutations complete, and
    /// the one after that is left half applied.
    pub fn cut_power_after(&mut self, count: usize) {
        self.power_cut = Some(count);
    }

    /// Brings a dead fake back to life, torn state and all.
    pub fn restore_power(&mut self) {
        self.power_cut = None;
        self.dead = false;
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn clear_operations(&mut self) {
        self.operations.clear();
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, address: Address) -> usize {
        assert!(address >= self.base, "address below device start");
        address - self.base
    }

    fn budget(&mut self) -> Budget {
        if self.dead {
            return Budget::Dead;
        }
        match self.power_cut.as_mut() {
            None => Budget::Full,
            Some(0) => {
                self.dead = true;
                Budget::Torn
            }
            Some(remaining) => {
                *remaining -= 1;
                Budget::Full
            }
        }
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) {
        let erased = self.erased;
        for (index, value) in bytes.iter().copied().enumerate() {
            let cell = &mut self.data[offset + index];
            // Programming can only move bits away from the erased
            // state, never back
            assert!(
                (*cell ^ erased) & !(value ^ erased) == 0,
                "write reverts programmed bits at offset {:#x} (flash must be erased first)",
                offset + index
            );
            *cell = value;
        }
    }
}

impl flash::Geometry for FakeFlash {
    fn write_alignment(&self) -> usize {
        self.alignment
    }
    fn sector_size(&self) -> usize {
        self.sector_size
    }
    fn erased_value(&self) -> u8 {
        self.erased
    }
}

impl flash::ReadWrite for FakeFlash {
    type Error = FakeError;
    type Address = Address;

    fn read(&mut self, address: Self::Address, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        if self.dead {
            return Err(nb::Error::Other(FakeError));
        }
        let offset = self.offset(address);
        assert!(offset + bytes.len() <= self.data.len(), "read past device end");
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }

    fn write(&mut self, address: Self::Address, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        let offset = self.offset(address);
        assert!(offset % self.alignment == 0, "unaligned write address");
        assert!(bytes.len() % self.alignment == 0, "unaligned write length");
        assert!(offset + bytes.len() <= self.data.len(), "write past device end");
        self.operations.push(Operation::Write { address, length: bytes.len() });
        match self.budget() {
            Budget::Dead => Err(nb::Error::Other(FakeError)),
            Budget::Full => {
                self.program(offset, bytes);
                Ok(())
            }
            Budget::Torn => {
                self.program(offset, &bytes[..bytes.len() / 2]);
                Err(nb::Error::Other(FakeError))
            }
        }
    }

    fn erase(&mut self, address: Self::Address, length: usize) -> nb::Result<(), Self::Error> {
        let offset = self.offset(address);
        assert!(offset % self.sector_size == 0, "erase off a sector boundary");
        assert!(length % self.sector_size == 0, "erase of partial sectors");
        assert!(offset + length <= self.data.len(), "erase past device end");
        self.operations.push(Operation::Erase { address, length });
        let erased = self.erased;
        match self.budget() {
            Budget::Dead => Err(nb::Error::Other(FakeError)),
            Budget::Full => {
                self.data[offset..offset + length].fill(erased);
                Ok(())
            }
            Budget::Torn => {
                self.data[offset..offset + length / 2].fill(erased);
                Err(nb::Error::Other(FakeError))
            }
        }
    }

    fn range(&self) -> (Self::Address, Self::Address) {
        (self.base, self.base + self.data.len())
    }
}

impl Add<usize> for Address {
    type Output = Address;
    fn add(self, rhs: usize) -> Self::Output {
        Address(self.0 + rhs as u32)
    }
}

impl Sub<usize> for Address {
    type Output = Address;
    fn sub(self, rhs: usize) -> Self::Output {
        Address(self.0.saturating_sub(rhs as u32))
    }
}

impl Sub<Address> for Address {
    type Output = usize;
    fn sub(self, rhs: Address) -> Self::Output {
        self.0.saturating_sub(rhs.0) as usize
    }
}

impl From<Address> for usize {
    fn from(address: Address) -> Self {
        address.0 as usize
    }
}
