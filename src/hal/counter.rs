use core::fmt;

/// Monotonic security counter backing hardware rollback protection,
/// typically fuses or a protected flash area.
///
/// Counters are tracked per logical image. A counter that was never
/// written reports zero.
pub trait SecurityCounter {
    type Error: Clone + Copy + fmt::Debug;
    fn get(&mut self, image_index: u8) -> Result<u32, Self::Error>;
    /// Stores a new counter value. The bootloader only ever calls
    /// this with values above the currently stored one.
    fn update(&mut self, image_index: u8, value: u32) -> Result<(), Self::Error>;
}
