//! One way replacement of the boot image by the staged one.
//!
//! Overwriting trades the ability to revert for simplicity and wear:
//! no spare sector, no status cells, half the copying of a swap. The
//! staged image is copied down sector by sector with just in time
//! erases, and afterwards both slots' bookkeeping is wiped so the
//! request cannot re-arm and no stale trailer state can resurrect.

use super::{copy_range, Job, RamRegion, Strategy, SwapType, UpdateStrategy};
use crate::devices::trailer::Trailer;
use crate::devices::traits::Flash;
use crate::error::Error;
use crate::log;
use core::cmp::min;
use nb::block;

pub struct Overwrite;

impl Strategy for Overwrite {
    const KIND: UpdateStrategy = UpdateStrategy::Overwrite;

    fn execute<F: Flash>(
        &mut self,
        flash: &mut F,
        job: &Job<F::Address>,
        scratch: &mut [u8],
        _ram: Option<&mut RamRegion<'_>>,
    ) -> Result<(), Error> {
        match job.swap {
            SwapType::None => Ok(()),
            // A trial period makes no sense when the old image is
            // destroyed, so tests collapse into permanent upgrades.
            SwapType::Test | SwapType::Permanent => run(flash, job, scratch),
            // Nothing left to restore from.
            SwapType::Revert | SwapType::Panic => Err(Error::StateInconsistent),
        }
    }
}

fn run<F: Flash>(flash: &mut F, job: &Job<F::Address>, scratch: &mut [u8]) -> Result<(), Error> {
    let primary = job.pair.primary;
    let secondary = job.pair.secondary;
    let trailer_primary = Trailer::new(flash, primary)?;
    let trailer_secondary = Trailer::new(flash, secondary)?;

    let sector = flash.sector_size();
    let length = job.swap_size as usize;
    let sectors = (length + sector - 1) / sector;
    if sectors + trailer_primary.sectors() > primary.size / sector {
        return Err(Error::ImageTooBig);
    }

    log::info!("overwriting the boot image with the staged one");
    let mut index = 0usize;
    while index < length {
        let chunk = min(sector, length - index);
        block!(flash.erase(primary.location + index, sector))?;
        copy_range(flash, secondary.location + index, primary.location + index, chunk, scratch)?;
        index += sector;
    }

    // Stale state under the new image must not resurrect as a
    // request or a revert on some later boot.
    trailer_primary.erase(flash)?;

    // Retire the staged copy: without its header it can never be
    // validated again, and without its trailer it requests nothing.
    block!(flash.erase(secondary.location, sector))?;
    trailer_secondary.erase(flash)?;
    Ok(())
}
