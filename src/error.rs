//! Error types shared across the bootloader core.

/// Top level error type for the bootloader core. Carrier variants
/// wrap a textual description supplied by the layer that produced
/// them; the bare variants describe logic failures detected by the
/// update and selection machinery itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Error caused by a low level peripheral driver
    DriverError(&'static str),
    /// Error caused by a faulty configuration
    ConfigurationError(&'static str),
    /// Error caused by a high level device driver
    DeviceError(&'static str),
    SlotEmpty,
    HeaderInvalid,
    ImageTooBig,
    /// On-flash bookkeeping contradicts itself. Booting must not
    /// proceed until an operator intervenes.
    StateInconsistent,
    /// The boot parameter store could not name a usable slot.
    RecoveryFailed,
    /// Nothing is wrong yet, but the caller must reset the device and
    /// run the boot sequence again before any slot can be trusted.
    RebootNeeded,
    NoBootableImage,
}

pub trait Convertible {
    fn into(self) -> Error;
}
impl<T: Convertible> From<T> for Error {
    fn from(t: T) -> Self {
        t.into()
    }
}
