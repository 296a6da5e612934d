use super::*;

impl<'a, F: Flash, V: ImageValidator<F>, C: Counter, S: Strategy> Loader<'a, F, V, C, S> {
    /// Boot path for the copying strategies: finish interrupted work,
    /// arbitrate pending requests from the trailers, carry out the
    /// decision, then insist the boot slot proves itself.
    pub(super) fn boot_swapped(&mut self) -> Result<BootResponse, Error> {
        let LoaderContext { flash, images, validator, counter, scratch, .. } = &mut self.ctx;
        let flash = &mut **flash;
        let scratch = &mut **scratch;
        let validator = &mut **validator;
        let counter = &mut **counter;
        let images = *images;

        let mut response = None;
        for pair in images {
            let trailer_primary = Trailer::new(flash, pair.primary)?;
            let trailer_secondary = Trailer::new(flash, pair.secondary)?;

            match trailer_primary.read_status(flash)? {
                BootStatus::InProgress { units_done, swap_size, swap, image_index } => {
                    if swap == SwapType::Panic
                        || image_index != pair.image_index
                        || S::KIND != UpdateStrategy::Swap
                    {
                        return Err(Error::StateInconsistent);
                    }
                    // Finish first, and skip arbitration afterwards: a
                    // freshly completed trailer reads like a revert
                    // candidate, and the trial boot has not happened
                    // yet.
                    log::warn!("finishing a swap interrupted by reset");
                    let job = Job::resumed(*pair, swap, swap_size, units_done);
                    self.strategy.execute(flash, &job, scratch, None)?;
                }
                BootStatus::Reset => {
                    let primary_state = trailer_primary.read_state(flash)?;
                    let secondary_state = trailer_secondary.read_state(flash)?;
                    let decision = resolve(&primary_state, &secondary_state);
                    let job = match decision {
                        SwapType::None => None,
                        SwapType::Panic => return Err(Error::StateInconsistent),
                        SwapType::Test | SwapType::Permanent => assess_upgrade(
                            flash, validator, counter, pair, decision, S::KIND, scratch,
                        )?,
                        SwapType::Revert => {
                            // Only a completed swap can leave the revert
                            // pattern behind; any other strategy finding
                            // it means foreign state.
                            if S::KIND != UpdateStrategy::Swap {
                                return Err(Error::StateInconsistent);
                            }
                            assess_revert(flash, validator, &trailer_primary, pair, scratch)?
                        }
                    };
                    if let Some(job) = job {
                        self.strategy.execute(flash, &job, scratch, None)?;
                    }
                }
            }

            // Whatever the decision did, the primary slot is now the
            // boot candidate.
            let header = match image::header_at(flash, pair.primary) {
                Ok(header) => header,
                Err(error) if data_error(&error) => return Err(Error::NoBootableImage),
                Err(error) => return Err(error),
            };
            if validate_twice(flash, validator, pair.primary, &header, pair.image_index, scratch)?
                != Verdict::Approved
            {
                return Err(Error::NoBootableImage);
            }

            // Trial images must confirm before the stored counter
            // moves. Overwrite keeps no trial state: every approved
            // boot counts as confirmed, so a raise interrupted by
            // reset completes on the next pass.
            let confirmed = match S::KIND {
                UpdateStrategy::Overwrite => true,
                _ => trailer_primary.read_state(flash)?.image_ok == FlagState::Set,
            };
            if confirmed {
                update_counter_to_image(flash, counter, pair.primary, &header, pair.image_index)?;
            }

            if pair.image_index == 0 {
                response = Some(BootResponse {
                    device_id: pair.primary.device_id,
                    image_offset: pair.primary.location.into(),
                    header,
                });
            }
        }
        response.ok_or(Error::NoBootableImage)
    }
}

/// Decides whether a pending upgrade request should actually run,
/// retiring the request whenever the staged image cannot be trusted
/// so it cannot wedge every later boot.
fn assess_upgrade<F: Flash, V: ImageValidator<F>, C: Counter>(
    flash: &mut F,
    validator: &mut V,
    counter: &mut C,
    pair: &SlotPair<F::Address>,
    swap: SwapType,
    kind: UpdateStrategy,
    scratch: &mut [u8],
) -> Result<Option<Job<F::Address>>, Error> {
    let header = match image::header_at(flash, pair.secondary) {
        Ok(header) => header,
        Err(error) if data_error(&error) => {
            log::warn!("staged image is unreadable; retiring the request");
            image::erase_slot(flash, pair.secondary)?;
            return Ok(None);
        }
        Err(error) => return Err(error),
    };

    #[cfg(feature = "downgrade-prevention")]
    match image::header_at(flash, pair.primary) {
        Ok(current)
            if header.version.compare(&current.version) == core::cmp::Ordering::Less =>
        {
            log::warn!("staged image is older than the running one; retiring the request");
            image::erase_slot(flash, pair.secondary)?;
            return Ok(None);
        }
        Err(error) if !data_error(&error) => return Err(error),
        _ => {}
    }

    let total_secondary = match image::total_size(flash, pair.secondary, &header) {
        Ok(size) => size,
        Err(error) if data_error(&error) => {
            log::warn!("staged image is unreadable; retiring the request");
            image::erase_slot(flash, pair.secondary)?;
            return Ok(None);
        }
        Err(error) => return Err(error),
    };

    if validate_twice(flash, validator, pair.secondary, &header, pair.image_index, scratch)?
        != Verdict::Approved
    {
        log::warn!("staged image failed validation; retiring the request");
        image::erase_slot(flash, pair.secondary)?;
        return Ok(None);
    }

    let stored = counter.get(pair.image_index)?;
    if !check_rollback(flash, pair.secondary, &header, stored)? {
        log::warn!("staged image refused by rollback protection");
        image::erase_slot(flash, pair.secondary)?;
        return Ok(None);
    }

    // A swap must carry the larger of the two footprints; an
    // overwrite only ever copies the staged one.
    let swap_size = match kind {
        UpdateStrategy::Swap => max(total_secondary, footprint_or_zero(flash, pair.primary)?),
        _ => total_secondary,
    } as u32;

    Ok(Some(Job { pair: *pair, header, swap, swap_size, resume_units: None, active_slot: 0 }))
}

/// Decides whether an unconfirmed upgrade should roll back. A revert
/// that cannot restore anything coherent is skipped, keeping the
/// unconfirmed image rather than trading it for junk.
fn assess_revert<F: Flash, V: ImageValidator<F>>(
    flash: &mut F,
    validator: &mut V,
    trailer_primary: &Trailer<F>,
    pair: &SlotPair<F::Address>,
    scratch: &mut [u8],
) -> Result<Option<Job<F::Address>>, Error> {
    let header = match image::header_at(flash, pair.secondary) {
        Ok(header) => header,
        Err(error) if data_error(&error) => {
            log::warn!("nothing coherent to revert to; keeping the unconfirmed image");
            return Ok(None);
        }
        Err(error) => return Err(error),
    };
    if validate_twice(flash, validator, pair.secondary, &header, pair.image_index, scratch)?
        != Verdict::Approved
    {
        log::warn!("revert source failed validation; keeping the unconfirmed image");
        return Ok(None);
    }

    // The size armed for the original swap is still in the trailer;
    // recompute from the slots if it is somehow gone.
    let swap_size = match trailer_primary.read_swap_size(flash)? {
        Some(size) => size,
        None => max(
            footprint_or_zero(flash, pair.secondary)?,
            footprint_or_zero(flash, pair.primary)?,
        ) as u32,
    };

    Ok(Some(Job {
        pair: *pair,
        header,
        swap: SwapType::Revert,
        swap_size,
        resume_units: None,
        active_slot: 0,
    }))
}

/// Total footprint of the image in `slot`, or zero when the slot
/// holds nothing coherent. Device errors still propagate.
fn footprint_or_zero<F: Flash>(flash: &mut F, slot: Slot<F::Address>) -> Result<usize, Error> {
    let header = match image::header_at(flash, slot) {
        Ok(header) => header,
        Err(error) if data_error(&error) => return Ok(0),
        Err(error) => return Err(error),
    };
    match image::total_size(flash, slot, &header) {
        Ok(size) => Ok(size),
        Err(error) if data_error(&error) => Ok(0),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::image::doubles::{write_image, FakeImage, FakeValidator, ValidatorScript};
    use crate::devices::image::Version;
    use crate::devices::swap::{Overwrite, SectorSwap};
    use crate::hal::doubles::counter::FakeCounter;
    use crate::hal::doubles::flash::{Address, FakeFlash};
    use crate::hal::flash::ReadWrite;

    const SECTOR: usize = 512;
    const SLOT_SIZE: usize = 4 * SECTOR;
    const SECONDARY: u32 = SLOT_SIZE as u32;

    fn pair() -> SlotPair<Address> {
        SlotPair {
            image_index: 0,
            primary: Slot { device_id: 0, location: Address(0), size: SLOT_SIZE },
            secondary: Slot { device_id: 0, location: Address(SECONDARY), size: SLOT_SIZE },
        }
    }

    fn flash() -> FakeFlash {
        FakeFlash::new(Address(0), 2 * SLOT_SIZE, SECTOR, 4)
    }

    fn current_image() -> FakeImage {
        FakeImage {
            version: Version { major: 1, minor: 1, revision: 0, build: 0 },
            ..FakeImage::default()
        }
    }

    fn staged_image() -> FakeImage {
        FakeImage {
            version: Version { major: 1, minor: 2, revision: 0, build: 0 },
            security_counter: Some(7),
            ..FakeImage::default()
        }
    }

    fn boot_with<S: Strategy>(
        flash: &mut FakeFlash,
        strategy: S,
        validator: &mut FakeValidator,
        counter: &mut FakeCounter,
    ) -> Result<BootResponse, Error> {
        let images = [pair()];
        let mut scratch = [0u8; 256];
        let ctx = LoaderContext {
            flash,
            images: &images,
            validator,
            counter,
            params: None,
            scratch: &mut scratch,
            ram: None,
        };
        Loader::new(ctx, strategy)?.boot()
    }

    #[test]
    fn a_staged_trial_image_swaps_in_and_reverts_when_never_confirmed() {
        // Given a running image and a staged trial upgrade
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        let staging_trailer = Trailer::new(&flash, pair().secondary).unwrap();
        staging_trailer.set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the trial image runs, but the counter holds back
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(response.image_offset, 0);
        assert!(counter.updates.is_empty());

        // When it boots again without the firmware confirming
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the original image is back
        assert_eq!(response.header.version, current_image().version);
        assert!(counter.updates.is_empty());
    }

    #[test]
    fn a_confirmed_upgrade_stays_and_raises_the_counter() {
        // Given a trial upgrade that has swapped in
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();
        boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // When the new firmware marks itself good and the device boots
        Trailer::new(&flash, pair().primary).unwrap().write_image_ok(&mut flash).unwrap();
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then no revert happens and the counter catches up, once
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);
    }

    #[test]
    fn a_permanent_request_installs_already_confirmed() {
        // Given an upgrade staged as permanent
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, true).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots twice
        let first = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();
        let second = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the upgrade sticks without any confirmation step
        assert_eq!(first.header.version, staged_image().version);
        assert_eq!(second.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);
    }

    #[test]
    fn an_unreadable_staged_request_is_retired() {
        // Given a request whose staged image is garbage
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        nb::block!(flash.write(Address(SECONDARY), &[0xAA; 32])).unwrap();
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the old image runs and the staging slot is wiped clean
        assert_eq!(response.header.version, current_image().version);
        assert!(flash.data()[SLOT_SIZE..].iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn split_validator_verdicts_halt_the_boot() {
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::new(ValidatorScript::Alternating);
        let mut counter = FakeCounter::new();

        let result = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter);

        assert_eq!(result.unwrap_err(), Error::StateInconsistent);
    }

    #[test]
    fn rollback_protection_refuses_stale_counters() {
        // Given a staged image whose counter is below the stored one
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::with_stored([10, 0]);

        // When the device boots
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the request is retired and the old image keeps running
        assert_eq!(response.header.version, current_image().version);
        assert!(counter.updates.is_empty());
        assert!(flash.data()[SLOT_SIZE..].iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn interrupted_swaps_finish_before_the_image_runs() {
        // Given a swap that died partway through
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();
        flash.clear_operations();
        flash.cut_power_after(10);
        boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap_err();
        flash.restore_power();

        // When the device boots again
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the swap completed and the trial image runs
        assert_eq!(response.header.version, staged_image().version);

        // And the trial still reverts if never confirmed
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();
        assert_eq!(response.header.version, current_image().version);
    }

    #[test]
    fn overwrite_installs_in_one_boot_and_retires_everything() {
        // Given a staged upgrade under the overwrite strategy
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response = boot_with(&mut flash, Overwrite, &mut validator, &mut counter).unwrap();

        // Then the new image runs, already committed
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);

        // And the next boot finds nothing left to do
        let response = boot_with(&mut flash, Overwrite, &mut validator, &mut counter).unwrap();
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);
    }

    #[test]
    fn a_plain_overwrite_boot_catches_up_a_missed_counter_raise() {
        // Given an installed image whose counter raise was lost to a
        // reset just after the staging slot was retired
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &staged_image());
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots with nothing staged
        let response = boot_with(&mut flash, Overwrite, &mut validator, &mut counter).unwrap();

        // Then the stored counter catches up to the image
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);
    }

    #[test]
    fn a_fresh_install_lands_in_an_empty_boot_slot() {
        // Given a blank boot slot and a staged permanent image
        let mut flash = flash();
        write_image(&mut flash, pair().secondary, &staged_image());
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, true).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the staged image is installed and committed
        assert_eq!(response.header.version, staged_image().version);
        assert_eq!(counter.updates, vec![(0, 7)]);
    }

    #[test]
    fn an_empty_device_has_nothing_to_boot() {
        let mut flash = flash();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        let result = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter);

        assert_eq!(result.unwrap_err(), Error::NoBootableImage);
    }

    #[cfg(feature = "downgrade-prevention")]
    #[test]
    fn older_staged_images_are_refused() {
        // Given a staged image older than the running one
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &current_image());
        let older = FakeImage {
            version: Version { major: 1, minor: 0, revision: 0, build: 0 },
            ..FakeImage::default()
        };
        write_image(&mut flash, pair().secondary, &older);
        Trailer::new(&flash, pair().secondary).unwrap().set_pending(&mut flash, false).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response = boot_with(&mut flash, SectorSwap, &mut validator, &mut counter).unwrap();

        // Then the downgrade is refused and retired
        assert_eq!(response.header.version, current_image().version);
        assert!(flash.data()[SLOT_SIZE..].iter().all(|byte| *byte == 0xFF));
    }
}
