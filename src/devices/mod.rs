//! Complex modules with business logic related to the problem
//! domain, that lay on top of abstract drivers. Devices are
//! generic over the interfaces in [`crate::hal`], while chip and
//! board specifics stay on the application's side of that boundary.

pub mod boot_params;
pub mod image;
pub mod loader;
pub mod swap;
pub mod trailer;

/// General purpose traits that summarize requirements on devices.
pub mod traits {
    use crate::error;
    use crate::hal::{counter, flash};
    use marker_blanket::marker_blanket;

    /// A supported flash must be able to read, write, erase in whole
    /// sectors, and report errors to the bootloader.
    #[marker_blanket]
    pub trait Flash: flash::ReadWrite<Error: error::Convertible> {}

    /// A supported security counter must track a monotonic value per
    /// image and report errors to the bootloader.
    #[marker_blanket]
    pub trait Counter: counter::SecurityCounter<Error: error::Convertible> {}
}
