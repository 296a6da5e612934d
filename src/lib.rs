//! Slot selection and crash safe firmware update core for dual bank
//! MCU bootloaders.
//!
//! The crate decides which of two firmware slots to boot, stages
//! updates between them, and survives power loss at any point of the
//! process. It is hardware agnostic: the application supplies a flash
//! driver, an image validator and a monotonic counter through the
//! traits under [`hal`], and receives back the address of the image
//! to hand control to.
//!
//! Four update strategies are supported. The sector swap keeps the
//! previous firmware recoverable and drives a trailer state machine
//! at the end of each slot; overwrite trades that safety for
//! simplicity; the address driven strategies (direct XIP and RAM
//! load) never move images and instead track the active slot in a
//! small replicated parameter store.
#![cfg_attr(test, allow(unused_imports))]
#![cfg_attr(target_arch = "arm", no_std)]

extern crate static_assertions;

#[macro_use]
pub mod utilities {
    pub mod memory;
}

pub mod hal;
pub mod devices;
pub mod error;

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

// With defmt disabled the logging statements compile to nothing, so
// the crate links on hosted targets without a global logger.
#[cfg(not(feature = "defmt"))]
pub(crate) mod log {
    macro_rules! info {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use info;

    macro_rules! warner {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use warner as warn;
}
