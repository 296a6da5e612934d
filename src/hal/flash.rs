use crate::utilities::memory::Address;
use core::fmt;

/// Physical layout of a flash device as seen by the update machinery.
/// Every slot handed to the bootloader must sit on a device with a
/// uniform sector size and write alignment.
pub trait Geometry {
    /// Smallest write granularity, in bytes.
    fn write_alignment(&self) -> usize;
    /// Smallest erase granularity, in bytes.
    fn sector_size(&self) -> usize;
    /// Value every byte assumes after an erase (commonly 0xFF).
    fn erased_value(&self) -> u8;
}

/// Reads, writes and erases ranges of bytes, generic over an address.
///
/// Writes must target erased locations; drivers are not required to
/// read-modify-write around partially programmed words. Erases must
/// start and end on sector boundaries.
pub trait ReadWrite: Geometry {
    type Error: Clone + Copy + fmt::Debug;
    type Address: Address;
    fn read(&mut self, address: Self::Address, bytes: &mut [u8]) -> nb::Result<(), Self::Error>;
    fn write(&mut self, address: Self::Address, bytes: &[u8]) -> nb::Result<(), Self::Error>;
    fn erase(&mut self, address: Self::Address, length: usize) -> nb::Result<(), Self::Error>;
    fn range(&self) -> (Self::Address, Self::Address);
}
