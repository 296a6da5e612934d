//! Hardware Abstraction Layer, containing interfaces
//! for low level drivers.

pub mod counter;
pub mod flash;

#[cfg(not(target_arch = "arm"))]
#[doc(hidden)]
pub mod doubles;
