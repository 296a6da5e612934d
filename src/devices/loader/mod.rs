//! Generic boot loader core.
//!
//! The loader ties the other devices together: it owns one full boot
//! pass, from recovering interrupted updates through arbitration,
//! validation and execution of the chosen strategy, down to the final
//! answer of where execution should continue. It is generic over the
//! flash, the application supplied validator, the security counter
//! and the update strategy; chip and board specifics stay with the
//! application.

use super::boot_params::{ParamStore, Selection, MAX_IMAGES};
use super::image::{self, ImageHeader, ImageValidator, Slot, SlotPair, Verdict};
use super::swap::{resolve, Job, RamRegion, Strategy, SwapType, UpdateStrategy};
use super::trailer::{BootStatus, FlagState, Trailer, MAGIC_SIZE};
use super::traits::{Counter, Flash};
use crate::error::Error;
use crate::log;
use core::cmp::max;

mod addressed;
mod swapped;

/// Slots, partitions and peripherals one boot pass works with,
/// borrowed from the application for the duration of the pass.
pub struct LoaderContext<'a, F: Flash, V: ImageValidator<F>, C: Counter> {
    pub flash: &'a mut F,
    /// One pair per logical image, numbered from zero. The response
    /// always refers to image zero; further pairs are updated and
    /// validated alongside it.
    pub images: &'a [SlotPair<F::Address>],
    pub validator: &'a mut V,
    pub counter: &'a mut C,
    /// Replicated parameter partition; required by the address driven
    /// strategies and ignored by the copying ones.
    pub params: Option<ParamStore<F>>,
    /// Working memory for flash copies and validation.
    pub scratch: &'a mut [u8],
    /// Execution window for RAM loaded images.
    pub ram: Option<RamRegion<'a>>,
}

/// Where execution continues after a successful pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootResponse {
    /// Flash device holding the bootable image.
    pub device_id: u8,
    /// Offset of the image on that device, or the RAM address it was
    /// loaded to.
    pub image_offset: usize,
    pub header: ImageHeader,
}

pub struct Loader<'a, F: Flash, V: ImageValidator<F>, C: Counter, S: Strategy> {
    pub(crate) ctx: LoaderContext<'a, F, V, C>,
    strategy: S,
}

const MAX_REGIONS: usize = 2 * MAX_IMAGES + 1;

impl<'a, F: Flash, V: ImageValidator<F>, C: Counter, S: Strategy> Loader<'a, F, V, C, S> {
    /// Checks the whole memory layout up front so the boot paths can
    /// trust it: geometry that divides evenly, slots inside the
    /// device, no overlaps, and a scratch buffer the copying
    /// strategies can work with.
    pub fn new(ctx: LoaderContext<'a, F, V, C>, strategy: S) -> Result<Self, Error> {
        let alignment = ctx.flash.write_alignment();
        let sector_size = ctx.flash.sector_size();
        if alignment == 0 || MAGIC_SIZE % alignment != 0 {
            return Err(Error::ConfigurationError(
                "write alignment must divide the trailer magic size",
            ));
        }
        if sector_size == 0 || sector_size % alignment != 0 {
            return Err(Error::ConfigurationError("sectors must hold whole write units"));
        }
        if ctx.images.is_empty() || ctx.images.len() > MAX_IMAGES {
            return Err(Error::ConfigurationError("unsupported number of image pairs"));
        }
        if ctx.scratch.len() < alignment {
            return Err(Error::ConfigurationError("scratch buffer smaller than one write unit"));
        }

        let (start, end) = ctx.flash.range();
        let (start, end): (usize, usize) = (start.into(), end.into());
        let mut regions = [(0usize, 0usize); MAX_REGIONS];
        let mut count = 0;
        for (index, pair) in ctx.images.iter().enumerate() {
            if pair.image_index != index as u8 {
                return Err(Error::ConfigurationError("image pairs must be numbered in order"));
            }
            for slot in [pair.primary, pair.secondary] {
                let location: usize = slot.location.into();
                if slot.size == 0 || slot.size % sector_size != 0 || location % sector_size != 0 {
                    return Err(Error::ConfigurationError("slots must span whole sectors"));
                }
                if location < start || location + slot.size > end {
                    return Err(Error::ConfigurationError("slot outside the flash device"));
                }
                regions[count] = (location, slot.size);
                count += 1;
            }
        }
        if let Some(params) = &ctx.params {
            regions[count] = (params.partition.location.into(), params.partition.size);
            count += 1;
        }
        for first in 0..count {
            for second in (first + 1)..count {
                let (a, a_size) = regions[first];
                let (b, b_size) = regions[second];
                if a < b + b_size && b < a + a_size {
                    return Err(Error::ConfigurationError("memory regions overlap"));
                }
            }
        }

        Ok(Loader { ctx, strategy })
    }

    /// Runs one full boot pass and reports where execution should
    /// continue. What gets written to flash along the way depends
    /// entirely on what the persistent state asked for.
    pub fn boot(&mut self) -> Result<BootResponse, Error> {
        match S::KIND {
            UpdateStrategy::Overwrite | UpdateStrategy::Swap => self.boot_swapped(),
            UpdateStrategy::RamLoad | UpdateStrategy::DirectXip => self.boot_addressed(),
        }
    }
}

/// Failure modes that condemn a slot's content rather than the
/// device or the configuration.
fn data_error(error: &Error) -> bool {
    matches!(error, Error::SlotEmpty | Error::HeaderInvalid | Error::ImageTooBig)
}

/// Runs the validator twice and requires both verdicts to agree.
/// Deterministic validators always do; a split verdict means a
/// transient fault or an active glitch attack, neither of which this
/// boot can recover from.
fn validate_twice<F: Flash, V: ImageValidator<F>>(
    flash: &mut F,
    validator: &mut V,
    slot: Slot<F::Address>,
    header: &ImageHeader,
    image_index: u8,
    scratch: &mut [u8],
) -> Result<Verdict, Error> {
    let first = validator.validate(flash, slot, header, image_index, scratch)?;
    let second = validator.validate(flash, slot, header, image_index, scratch)?;
    if first != second {
        return Err(Error::StateInconsistent);
    }
    Ok(first)
}

/// Anti rollback gate: an image with a security counter below the
/// stored one may neither run nor be installed. Images without a
/// counter record only pass on devices that never stored one.
fn check_rollback<F: Flash>(
    flash: &mut F,
    slot: Slot<F::Address>,
    header: &ImageHeader,
    stored: u32,
) -> Result<bool, Error> {
    match image::security_counter(flash, slot, header) {
        Ok(Some(value)) => Ok(value >= stored),
        Ok(None) => Ok(stored == 0),
        Err(error) if data_error(&error) => Ok(false),
        Err(error) => Err(error),
    }
}

/// Raises the stored security counter to the image's, once the image
/// has earned it. Never lowers it.
fn update_counter_to_image<F: Flash, C: Counter>(
    flash: &mut F,
    counter: &mut C,
    slot: Slot<F::Address>,
    header: &ImageHeader,
    image_index: u8,
) -> Result<(), Error> {
    let stored = counter.get(image_index)?;
    if let Some(value) = image::security_counter(flash, slot, header)? {
        if value > stored {
            log::info!("raising the stored security counter");
            counter.update(image_index, value)?;
        }
    }
    Ok(())
}
