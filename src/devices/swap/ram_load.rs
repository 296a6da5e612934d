//! Copying the active image into RAM for execution there.
//!
//! Instead of rearranging flash, this strategy reads the chosen
//! image into a caller supplied RAM window at the load address its
//! header demands. Flash is never written, so there is no crash
//! recovery to speak of; a reset simply loads again.

use super::{Job, Strategy, UpdateStrategy};
use crate::devices::traits::Flash;
use crate::error::Error;
use crate::log;
use nb::block;

/// RAM window images may be loaded into. `base` is the absolute
/// address of the first byte of `memory`, used to translate the load
/// addresses found in image headers.
pub struct RamRegion<'a> {
    pub base: usize,
    pub memory: &'a mut [u8],
}

pub struct RamLoad;

impl Strategy for RamLoad {
    const KIND: UpdateStrategy = UpdateStrategy::RamLoad;

    fn execute<F: Flash>(
        &mut self,
        flash: &mut F,
        job: &Job<F::Address>,
        _scratch: &mut [u8],
        ram: Option<&mut RamRegion<'_>>,
    ) -> Result<(), Error> {
        let ram = ram.ok_or(Error::ConfigurationError("RAM loading requires a RAM region"))?;
        if !job.header.ram_loadable() {
            return Err(Error::HeaderInvalid);
        }

        let slot = job.pair.slot(job.active_slot);
        let load_addr = job.header.load_addr as usize;
        if load_addr < ram.base {
            return Err(Error::HeaderInvalid);
        }
        let offset = load_addr - ram.base;
        let end = offset.checked_add(job.header.loaded_size()).ok_or(Error::ImageTooBig)?;
        if end > ram.memory.len() {
            return Err(Error::ImageTooBig);
        }

        log::info!("loading the image into its RAM execution address");
        block!(flash.read(slot.location, &mut ram.memory[offset..end]))?;
        Ok(())
    }
}
