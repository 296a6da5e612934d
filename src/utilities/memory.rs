//! Utilities to manipulate generic memory
#![macro_use]

#[macro_export]
macro_rules! kb {
    ($val:expr) => {
        $val * 1024
    };
}
#[macro_export]
macro_rules! mb {
    ($val:expr) => {
        $val * 1024 * 1024
    };
}

/// Generic address for the purpose of this module's methods.
/// Anything that can be offset by a usize, converted back into one,
/// and copied around works as an address.
pub trait Address: Copy + core::ops::Add<usize, Output = Self> + Into<usize> {}
impl<A> Address for A where A: Copy + core::ops::Add<usize, Output = A> + Into<usize> {}

/// Abstract region that can contain addresses
pub trait Region<A: Address> {
    fn contains(&self, address: A) -> bool;
}

/// Reads a little endian u16 at `offset`. Panics if the slice is too
/// short to hold it.
pub fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Reads a little endian u32 at `offset`. Panics if the slice is too
/// short to hold it.
pub fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// Writes `value` as little endian bytes at `offset`. Panics if the
/// slice is too short to hold it.
pub fn write_u16_le(value: u16, bytes: &mut [u8], offset: usize) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Writes `value` as little endian bytes at `offset`. Panics if the
/// slice is too short to hold it.
pub fn write_u32_le(value: u32, bytes: &mut [u8], offset: usize) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Rounds `value` down to the nearest multiple of `alignment`.
/// `alignment` must not be zero.
pub fn align_down(value: usize, alignment: usize) -> usize {
    value - (value % alignment)
}

/// Rounds `value` up to the nearest multiple of `alignment`.
/// `alignment` must not be zero.
pub fn align_up(value: usize, alignment: usize) -> usize {
    align_down(value + alignment - 1, alignment)
}

#[cfg(not(target_arch = "arm"))]
#[doc(hidden)]
pub mod doubles {
    use super::*;
    pub type FakeAddress = usize;

    #[derive(Debug, PartialEq)]
    pub struct FakeRegion {
        pub start: FakeAddress,
        pub size: usize,
    }

    impl Region<FakeAddress> for FakeRegion {
        fn contains(&self, address: FakeAddress) -> bool {
            (self.start <= address) && ((self.start + self.size) > address)
        }
    }
}
