//! Trailer bookkeeping at the tail of every image slot.
//!
//! The trailer is the persistent half of the swap state machine: a
//! magic that marks requests, two single byte flags that record
//! confirmation and completion, the byte count of an armed swap, and
//! a run of status cells that make the swap resumable. All fields
//! occupy whole write units so every transition is a single program
//! operation, and erased fields decode to their own distinct states.
//!
//! Layout, measured from the end of the slot and growing downwards:
//! magic, image_ok, copy_done, swap_info, swap_size, status cells.

use crate::devices::image::Slot;
use crate::devices::swap::SwapType;
use crate::devices::traits::Flash;
use crate::error::Error;
use crate::utilities::memory::{align_down, align_up, read_u32_le, write_u32_le};
use nb::block;

pub const MAGIC_SIZE: usize = 16;

/// Random sequence marking a trailer as carrying a request. Written
/// last when arming, so a torn request is indistinguishable from no
/// request at all.
pub const BOOT_MAGIC: [u8; MAGIC_SIZE] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79,
    0x80,
];

const FLAG_SET: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MagicState {
    Unset,
    Good,
    Bad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlagState {
    Unset,
    Set,
    Bad,
}

/// Decoded snapshot of one slot's trailer fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapState {
    pub magic: MagicState,
    /// Transition recorded in the swap_info byte; [`SwapType::None`]
    /// when the byte is erased.
    pub swap: SwapType,
    /// Logical image the swap_info byte belongs to.
    pub image_index: u8,
    pub image_ok: FlagState,
    pub copy_done: FlagState,
}

/// What an interrupted or finished update left behind, derived from
/// the trailer as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootStatus {
    /// No update underway.
    Reset,
    /// An armed update stopped partway; `units_done` work units are
    /// already on flash and must not be repeated blindly.
    InProgress { units_done: usize, swap_size: u32, swap: SwapType, image_index: u8 },
}

/// Accessor for the trailer of one slot. Holds offsets and geometry;
/// the flash itself is borrowed per call.
pub struct Trailer<F: Flash> {
    slot: Slot<F::Address>,
    alignment: usize,
    sector_size: usize,
    erased: u8,
    capacity: usize,
}

impl<F: Flash> Trailer<F> {
    pub fn new(flash: &F, slot: Slot<F::Address>) -> Result<Self, Error> {
        let alignment = flash.write_alignment();
        let sector_size = flash.sector_size();
        if alignment == 0 || MAGIC_SIZE % alignment != 0 {
            return Err(Error::ConfigurationError(
                "write alignment must divide the trailer magic size",
            ));
        }
        if sector_size == 0 || sector_size % alignment != 0 {
            return Err(Error::ConfigurationError("sectors must hold whole write units"));
        }
        if slot.size == 0 || slot.size % sector_size != 0 {
            return Err(Error::ConfigurationError("slots must span whole sectors"));
        }

        let capacity = 3 * (slot.size / sector_size);
        let size =
            MAGIC_SIZE + 3 * alignment + align_up(4, alignment) + capacity * alignment;
        if size > slot.size {
            return Err(Error::ConfigurationError("slot too small to hold its own trailer"));
        }

        Ok(Trailer { slot, alignment, sector_size, erased: flash.erased_value(), capacity })
    }

    pub fn slot(&self) -> Slot<F::Address> {
        self.slot
    }

    /// Bytes the trailer occupies at the tail of the slot.
    pub fn size(&self) -> usize {
        MAGIC_SIZE + 3 * self.alignment + self.swap_size_unit() + self.capacity * self.alignment
    }

    /// Whole sectors the trailer touches; image content must stay
    /// below them for the trailer to be erasable on its own.
    pub fn sectors(&self) -> usize {
        align_up(self.size(), self.sector_size) / self.sector_size
    }

    /// Units of swap progress the status area can record.
    pub fn cell_capacity(&self) -> usize {
        self.capacity
    }

    pub fn read_state(&self, flash: &mut F) -> Result<SwapState, Error> {
        let mut magic = [0u8; MAGIC_SIZE];
        block!(flash.read(self.slot.location + self.magic_offset(), &mut magic))?;
        let magic = if magic.iter().all(|byte| *byte == self.erased) {
            MagicState::Unset
        } else if magic == BOOT_MAGIC {
            MagicState::Good
        } else {
            MagicState::Bad
        };

        let image_ok = self.read_flag(flash, self.image_ok_offset())?;
        let copy_done = self.read_flag(flash, self.copy_done_offset())?;

        let info = self.read_byte(flash, self.swap_info_offset())?;
        let (swap, image_index) = if info == self.erased {
            (SwapType::None, 0)
        } else {
            (SwapType::from_nibble(info & 0x0F), info >> 4)
        };

        Ok(SwapState { magic, swap, image_index, image_ok, copy_done })
    }

    /// Collapses the trailer into what it means for this boot: either
    /// nothing is underway, or an armed update must be resumed at a
    /// specific unit.
    pub fn read_status(&self, flash: &mut F) -> Result<BootStatus, Error> {
        let state = self.read_state(flash)?;
        if state.copy_done == FlagState::Set || state.swap == SwapType::None {
            return Ok(BootStatus::Reset);
        }
        // The size is written strictly before the swap_info byte, so
        // an armed trailer without one is corrupt, not torn.
        let swap_size = self.read_swap_size(flash)?.ok_or(Error::StateInconsistent)?;
        let units_done = self.units_recorded(flash)?;
        Ok(BootStatus::InProgress {
            units_done,
            swap_size,
            swap: state.swap,
            image_index: state.image_index,
        })
    }

    /// Requests an upgrade from this slot: confirmation first when
    /// permanent, the magic strictly last so a torn request stays
    /// invisible.
    pub fn set_pending(&self, flash: &mut F, permanent: bool) -> Result<(), Error> {
        if permanent {
            self.write_image_ok(flash)?;
        }
        self.write_magic(flash)
    }

    pub fn write_magic(&self, flash: &mut F) -> Result<(), Error> {
        block!(flash.write(self.slot.location + self.magic_offset(), &BOOT_MAGIC))?;
        Ok(())
    }

    pub fn write_image_ok(&self, flash: &mut F) -> Result<(), Error> {
        self.write_field(flash, self.image_ok_offset(), FLAG_SET)
    }

    pub fn write_copy_done(&self, flash: &mut F) -> Result<(), Error> {
        self.write_field(flash, self.copy_done_offset(), FLAG_SET)
    }

    pub fn write_swap_info(
        &self,
        flash: &mut F,
        swap: SwapType,
        image_index: u8,
    ) -> Result<(), Error> {
        self.write_field(flash, self.swap_info_offset(), (image_index << 4) | swap.nibble())
    }

    pub fn write_swap_size(&self, flash: &mut F, size: u32) -> Result<(), Error> {
        let mut unit = [self.erased; MAGIC_SIZE];
        write_u32_le(size, &mut unit, 0);
        let offset = self.swap_size_offset();
        block!(flash.write(self.slot.location + offset, &unit[..self.swap_size_unit()]))?;
        Ok(())
    }

    pub fn read_swap_size(&self, flash: &mut F) -> Result<Option<u32>, Error> {
        let mut bytes = [0u8; 4];
        block!(flash.read(self.slot.location + self.swap_size_offset(), &mut bytes))?;
        if bytes.iter().all(|byte| *byte == self.erased) {
            return Ok(None);
        }
        Ok(Some(read_u32_le(&bytes, 0)))
    }

    /// Marks one unit of swap work as complete. Cells are written in
    /// ascending order, one per unit, after the unit's flash
    /// mutations have all landed.
    pub fn record_unit(&self, flash: &mut F, unit: usize) -> Result<(), Error> {
        if unit >= self.capacity {
            return Err(Error::DeviceError("swap status area overflow"));
        }
        self.write_field(flash, self.cell_offset(unit), !self.erased)
    }

    /// Completed units according to the status area: the index of the
    /// first cell still reading as erased.
    pub fn units_recorded(&self, flash: &mut F) -> Result<usize, Error> {
        for index in 0..self.capacity {
            if self.read_byte(flash, self.cell_offset(index))? == self.erased {
                return Ok(index);
            }
        }
        Ok(self.capacity)
    }

    /// Erases every sector the trailer touches.
    pub fn erase(&self, flash: &mut F) -> Result<(), Error> {
        let length = self.sectors() * self.sector_size;
        block!(flash.erase(self.slot.location + (self.slot.size - length), length))?;
        Ok(())
    }

    fn magic_offset(&self) -> usize {
        self.slot.size - MAGIC_SIZE
    }

    fn image_ok_offset(&self) -> usize {
        align_down(self.magic_offset() - self.alignment, self.alignment)
    }

    fn copy_done_offset(&self) -> usize {
        self.image_ok_offset() - self.alignment
    }

    fn swap_info_offset(&self) -> usize {
        self.copy_done_offset() - self.alignment
    }

    fn swap_size_unit(&self) -> usize {
        align_up(4, self.alignment)
    }

    fn swap_size_offset(&self) -> usize {
        self.swap_info_offset() - self.swap_size_unit()
    }

    fn cell_offset(&self, index: usize) -> usize {
        self.swap_size_offset() - (self.capacity - index) * self.alignment
    }

    fn write_field(&self, flash: &mut F, offset: usize, value: u8) -> Result<(), Error> {
        let mut unit = [self.erased; MAGIC_SIZE];
        unit[0] = value;
        block!(flash.write(self.slot.location + offset, &unit[..self.alignment]))?;
        Ok(())
    }

    fn read_flag(&self, flash: &mut F, offset: usize) -> Result<FlagState, Error> {
        let byte = self.read_byte(flash, offset)?;
        Ok(if byte == self.erased {
            FlagState::Unset
        } else if byte == FLAG_SET {
            FlagState::Set
        } else {
            FlagState::Bad
        })
    }

    fn read_byte(&self, flash: &mut F, offset: usize) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        block!(flash.read(self.slot.location + offset, &mut byte))?;
        Ok(byte[0])
    }
}
