//! Resumable sector by sector swap of the two slots of a pair.
//!
//! The swap runs as a fixed schedule of units, three per sector of
//! swapped content. A move phase first shifts the boot image up one
//! sector, top down, freeing the lowest sector; the swap phase then
//! walks upwards, pulling each staged sector down and crossing the
//! displaced boot sector over. One status cell is recorded after
//! each unit, so an interrupted run can resume at the exact unit it
//! died in: every unit rereads only sources that later units have
//! not yet destroyed, which makes blind replay of the last unit
//! safe.

use super::{copy_range, Job, RamRegion, Strategy, SwapType, UpdateStrategy};
use crate::devices::trailer::Trailer;
use crate::devices::traits::Flash;
use crate::error::Error;
use crate::log;
use nb::block;

pub struct SectorSwap;

impl Strategy for SectorSwap {
    const KIND: UpdateStrategy = UpdateStrategy::Swap;

    fn execute<F: Flash>(
        &mut self,
        flash: &mut F,
        job: &Job<F::Address>,
        scratch: &mut [u8],
        _ram: Option<&mut RamRegion<'_>>,
    ) -> Result<(), Error> {
        match job.swap {
            SwapType::None => Ok(()),
            SwapType::Test | SwapType::Permanent | SwapType::Revert => run(flash, job, scratch),
            SwapType::Panic => Err(Error::StateInconsistent),
        }
    }
}

fn run<F: Flash>(flash: &mut F, job: &Job<F::Address>, scratch: &mut [u8]) -> Result<(), Error> {
    let primary = job.pair.primary;
    let secondary = job.pair.secondary;
    let trailer_primary = Trailer::new(flash, primary)?;
    let trailer_secondary = Trailer::new(flash, secondary)?;

    let sector = flash.sector_size();
    let swap_size = job.swap_size as usize;
    let units_per_phase = (swap_size + sector - 1) / sector;
    let total_units = 3 * units_per_phase;

    if total_units > trailer_primary.cell_capacity() {
        return Err(Error::ImageTooBig);
    }
    // The move phase needs one spare sector above the boot image, and
    // both trailers must stay clear of the swapped content.
    if units_per_phase + 1 + trailer_primary.sectors() > primary.size / sector
        || units_per_phase + trailer_secondary.sectors() > secondary.size / sector
    {
        return Err(Error::ImageTooBig);
    }

    let first_unit = match job.resume_units {
        Some(units) => {
            log::info!("resuming an interrupted swap");
            units
        }
        None => {
            arm(flash, &trailer_primary, &trailer_secondary, job)?;
            0
        }
    };

    for unit in first_unit..total_units {
        perform_unit(flash, job, unit, units_per_phase, sector, scratch)?;
        trailer_primary.record_unit(flash, unit)?;
    }

    // Completion: magic first, confirmation for transitions that
    // carry it, copy_done strictly last.
    trailer_primary.write_magic(flash)?;
    if matches!(job.swap, SwapType::Permanent | SwapType::Revert) {
        trailer_primary.write_image_ok(flash)?;
    }
    trailer_primary.write_copy_done(flash)?;
    log::info!("slot swap complete");
    Ok(())
}

/// Arms the trailer for a fresh swap. The swap_info write at the end
/// is the commit point: a crash anywhere before it leaves a device
/// that boots as if no swap was ever requested.
fn arm<F: Flash>(
    flash: &mut F,
    trailer_primary: &Trailer<F>,
    trailer_secondary: &Trailer<F>,
    job: &Job<F::Address>,
) -> Result<(), Error> {
    trailer_primary.erase(flash)?;
    trailer_primary.write_swap_size(flash, job.swap_size)?;
    trailer_secondary.erase(flash)?;
    trailer_primary.write_swap_info(flash, job.swap, job.pair.image_index)?;
    Ok(())
}

fn perform_unit<F: Flash>(
    flash: &mut F,
    job: &Job<F::Address>,
    unit: usize,
    units_per_phase: usize,
    sector: usize,
    scratch: &mut [u8],
) -> Result<(), Error> {
    let primary = job.pair.primary.location;
    let secondary = job.pair.secondary.location;

    if unit < units_per_phase {
        // Move phase, top down.
        let index = units_per_phase - 1 - unit;
        let destination = primary + (index + 1) * sector;
        block!(flash.erase(destination, sector))?;
        copy_range(flash, primary + index * sector, destination, sector, scratch)
    } else {
        let step = unit - units_per_phase;
        let index = step / 2;
        if step % 2 == 0 {
            // Staged sector comes down into the boot slot.
            block!(flash.erase(primary + index * sector, sector))?;
            copy_range(flash, secondary + index * sector, primary + index * sector, sector, scratch)
        } else {
            // Displaced boot sector crosses over into the staging slot.
            block!(flash.erase(secondary + index * sector, sector))?;
            copy_range(
                flash,
                primary + (index + 1) * sector,
                secondary + index * sector,
                sector,
                scratch,
            )
        }
    }
}
