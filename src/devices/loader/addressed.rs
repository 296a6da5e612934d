use super::*;

impl<'a, F: Flash, V: ImageValidator<F>, C: Counter, S: Strategy> Loader<'a, F, V, C, S> {
    /// Boot path for the address driven strategies: the parameter
    /// store names the active slot, the loader proves the image there
    /// is sound, and a failed candidate costs one failover to the
    /// other slot instead of the whole boot.
    pub(super) fn boot_addressed(&mut self) -> Result<BootResponse, Error> {
        let LoaderContext { flash, images, validator, counter, params, scratch, ram } =
            &mut self.ctx;
        let flash = &mut **flash;
        let scratch = &mut **scratch;
        let validator = &mut **validator;
        let counter = &mut **counter;
        let images = *images;

        // The parameter store names one active slot for the whole
        // device.
        if images.len() != 1 {
            return Err(Error::ConfigurationError(
                "address driven strategies boot a single image pair",
            ));
        }
        let pair = images[0];
        let params = params
            .as_ref()
            .ok_or(Error::ConfigurationError("boot parameter partition not configured"))?;

        let (mut candidate, recovering) = match params.select(flash, images)? {
            Selection::Active { slot, .. } => (slot, false),
            Selection::NeedsRecovery => {
                log::warn!("rebuilding boot parameters from the installed images");
                (params.recovery_candidate(flash, &pair)?, true)
            }
            Selection::RebootAndRetry => return Err(Error::RebootNeeded),
        };

        let mut switched = false;
        for _attempt in 0..2 {
            let header = match attempt_candidate(
                flash,
                validator,
                counter,
                &mut self.strategy,
                &pair,
                candidate,
                scratch,
                ram.as_mut(),
            )? {
                Some(header) => header,
                None => {
                    candidate = 1 - candidate;
                    switched = true;
                    continue;
                }
            };

            if recovering {
                params.write_recovery(flash, candidate)?;
            } else if switched {
                log::info!("failing over to the other slot");
                params.commit_active(flash, candidate)?;
            }

            let slot = pair.slot(candidate);
            update_counter_to_image(flash, counter, slot, &header, pair.image_index)?;
            let image_offset = match S::KIND {
                UpdateStrategy::RamLoad => header.load_addr as usize,
                _ => slot.location.into(),
            };
            return Ok(BootResponse { device_id: slot.device_id, image_offset, header });
        }
        Err(Error::NoBootableImage)
    }
}

/// Tries to make one slot bootable. `Ok(None)` condemns the
/// candidate and asks the caller to fail over; hard faults still
/// abort the whole pass.
fn attempt_candidate<F: Flash, V: ImageValidator<F>, C: Counter, S: Strategy>(
    flash: &mut F,
    validator: &mut V,
    counter: &mut C,
    strategy: &mut S,
    pair: &SlotPair<F::Address>,
    candidate: u8,
    scratch: &mut [u8],
    ram: Option<&mut RamRegion<'_>>,
) -> Result<Option<ImageHeader>, Error> {
    let slot = pair.slot(candidate);
    let header = match image::header_at(flash, slot) {
        Ok(header) => header,
        Err(error) if data_error(&error) => {
            log::warn!("the named slot holds no readable image");
            return Ok(None);
        }
        Err(error) => return Err(error),
    };
    if validate_twice(flash, validator, slot, &header, pair.image_index, scratch)?
        != Verdict::Approved
    {
        log::warn!("the named image failed validation");
        return Ok(None);
    }
    let stored = counter.get(pair.image_index)?;
    if !check_rollback(flash, slot, &header, stored)? {
        log::warn!("the named image is refused by rollback protection");
        return Ok(None);
    }

    let job = Job {
        pair: *pair,
        header,
        swap: SwapType::None,
        swap_size: 0,
        resume_units: None,
        active_slot: candidate,
    };
    match strategy.execute(flash, &job, scratch, ram) {
        Ok(()) => Ok(Some(header)),
        Err(Error::HeaderInvalid) | Err(Error::ImageTooBig) => {
            log::warn!("the named image does not fit its execution window");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::boot_params::{Partition, REPLICA_SIZE};
    use crate::devices::image::doubles::{write_image, FakeImage, FakeValidator, ValidatorScript};
    use crate::devices::image::{Version, FLAG_RAM_LOAD};
    use crate::devices::swap::{DirectXip, RamLoad};
    use crate::hal::doubles::counter::FakeCounter;
    use crate::hal::doubles::flash::{Address, FakeFlash};

    const SECTOR: usize = 512;
    const SLOT_SIZE: usize = 4 * SECTOR;
    const PARTITION: u32 = 2 * SLOT_SIZE as u32;
    const RAM_BASE: usize = 0x2000_0000;

    fn pair() -> SlotPair<Address> {
        SlotPair {
            image_index: 0,
            primary: Slot { device_id: 0, location: Address(0), size: SLOT_SIZE },
            secondary: Slot { device_id: 0, location: Address(SLOT_SIZE as u32), size: SLOT_SIZE },
        }
    }

    fn partition() -> Partition<Address> {
        Partition { location: Address(PARTITION), size: 2 * REPLICA_SIZE }
    }

    fn flash() -> FakeFlash {
        FakeFlash::new(Address(0), 2 * SLOT_SIZE + 2 * REPLICA_SIZE, SECTOR, 4)
    }

    fn store(flash: &FakeFlash) -> ParamStore<FakeFlash> {
        ParamStore::new(flash, partition(), [0, SLOT_SIZE as u32]).unwrap()
    }

    fn image(major: u8, minor: u8) -> FakeImage {
        FakeImage {
            version: Version { major, minor, revision: 0, build: 0 },
            ..FakeImage::default()
        }
    }

    fn boot_with<S: Strategy>(
        flash: &mut FakeFlash,
        strategy: S,
        validator: &mut FakeValidator,
        counter: &mut FakeCounter,
        ram: Option<RamRegion<'_>>,
    ) -> Result<BootResponse, Error> {
        let images = [pair()];
        let mut scratch = [0u8; 256];
        let params = Some(store(flash));
        let ctx = LoaderContext {
            flash,
            images: &images,
            validator,
            counter,
            params,
            scratch: &mut scratch,
            ram,
        };
        Loader::new(ctx, strategy)?.boot()
    }

    #[test]
    fn direct_xip_boots_the_slot_the_parameters_name() {
        // Given two installed images and parameters naming the second
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &image(1, 1));
        let newer = FakeImage { security_counter: Some(3), ..image(1, 2) };
        write_image(&mut flash, pair().secondary, &newer);
        store(&flash).write_recovery(&mut flash, 1).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response =
            boot_with(&mut flash, DirectXip, &mut validator, &mut counter, None).unwrap();

        // Then execution continues in place, in the named slot
        assert_eq!(response.image_offset, SLOT_SIZE);
        assert_eq!(response.header.version, Version { major: 1, minor: 2, revision: 0, build: 0 });
        assert_eq!(counter.updates, vec![(0, 3)]);
    }

    #[test]
    fn a_dead_active_image_fails_over_and_commits() {
        // Given parameters naming a slot that holds nothing
        let mut flash = flash();
        write_image(&mut flash, pair().secondary, &image(1, 2));
        store(&flash).write_recovery(&mut flash, 0).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response =
            boot_with(&mut flash, DirectXip, &mut validator, &mut counter, None).unwrap();

        // Then the other slot runs and the switch is made permanent
        assert_eq!(response.image_offset, SLOT_SIZE);
        let store = store(&flash);
        let selection = store.select(&mut flash, &[pair()]).unwrap();
        assert_eq!(selection, Selection::Active { slot: 1, replica: 1, healed: false });
    }

    #[test]
    fn a_rejected_image_fails_over() {
        // Given an active image the validator condemns
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &image(1, 1));
        write_image(&mut flash, pair().secondary, &image(1, 2));
        store(&flash).write_recovery(&mut flash, 0).unwrap();
        let mut validator = FakeValidator::new(ValidatorScript::RejectAt(0));
        let mut counter = FakeCounter::new();

        // When the device boots
        let response =
            boot_with(&mut flash, DirectXip, &mut validator, &mut counter, None).unwrap();

        // Then the healthy slot runs instead
        assert_eq!(response.image_offset, SLOT_SIZE);
        assert_eq!(response.header.version, Version { major: 1, minor: 2, revision: 0, build: 0 });
    }

    #[test]
    fn recovery_rebuilds_the_partition_from_installed_images() {
        // Given installed images but a blank parameter partition
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &image(1, 3));
        write_image(&mut flash, pair().secondary, &image(1, 2));
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        // When the device boots
        let response =
            boot_with(&mut flash, DirectXip, &mut validator, &mut counter, None).unwrap();

        // Then the newer image runs and fresh parameters record it
        assert_eq!(response.image_offset, 0);
        assert_eq!(response.header.version, Version { major: 1, minor: 3, revision: 0, build: 0 });
        let store = store(&flash);
        let selection = store.select(&mut flash, &[pair()]).unwrap();
        assert_eq!(selection, Selection::Active { slot: 0, replica: 0, healed: false });
    }

    #[test]
    fn an_unprogrammed_device_asks_for_a_reboot() {
        let mut flash = flash();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        let result = boot_with(&mut flash, DirectXip, &mut validator, &mut counter, None);

        assert_eq!(result.unwrap_err(), Error::RebootNeeded);
    }

    #[test]
    fn ram_load_places_the_image_at_its_load_address() {
        // Given a RAM loadable image and a window that fits it
        let mut flash = flash();
        let loadable = FakeImage {
            flags: FLAG_RAM_LOAD,
            load_addr: (RAM_BASE + 256) as u32,
            ..image(1, 1)
        };
        write_image(&mut flash, pair().primary, &loadable);
        store(&flash).write_recovery(&mut flash, 0).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();
        let mut memory = [0u8; 2048];

        // When the device boots
        let ram = RamRegion { base: RAM_BASE, memory: &mut memory };
        let response =
            boot_with(&mut flash, RamLoad, &mut validator, &mut counter, Some(ram)).unwrap();

        // Then execution continues at the load address, and the image
        // bytes are there
        assert_eq!(response.image_offset, RAM_BASE + 256);
        assert_eq!(&memory[256..408], &flash.data()[..152]);
    }

    #[test]
    fn ram_load_without_a_window_is_a_configuration_error() {
        let mut flash = flash();
        let loadable =
            FakeImage { flags: FLAG_RAM_LOAD, load_addr: RAM_BASE as u32, ..image(1, 1) };
        write_image(&mut flash, pair().primary, &loadable);
        store(&flash).write_recovery(&mut flash, 0).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();

        let result = boot_with(&mut flash, RamLoad, &mut validator, &mut counter, None);

        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn addressed_strategies_require_the_parameter_store() {
        let mut flash = flash();
        write_image(&mut flash, pair().primary, &image(1, 1));
        let images = [pair()];
        let mut scratch = [0u8; 256];
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();
        let ctx = LoaderContext {
            flash: &mut flash,
            images: &images,
            validator: &mut validator,
            counter: &mut counter,
            params: None,
            scratch: &mut scratch,
            ram: None,
        };

        let result = Loader::new(ctx, DirectXip).unwrap().boot();

        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn images_that_do_not_fit_the_window_fail_over() {
        // Given a named image whose load address overflows the window
        let mut flash = flash();
        let overflowing = FakeImage {
            flags: FLAG_RAM_LOAD,
            load_addr: (RAM_BASE + 1984) as u32,
            ..image(1, 1)
        };
        let fitting =
            FakeImage { flags: FLAG_RAM_LOAD, load_addr: RAM_BASE as u32, ..image(1, 2) };
        write_image(&mut flash, pair().primary, &overflowing);
        write_image(&mut flash, pair().secondary, &fitting);
        store(&flash).write_recovery(&mut flash, 0).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::new();
        let mut memory = [0u8; 2048];

        // When the device boots
        let ram = RamRegion { base: RAM_BASE, memory: &mut memory };
        let response =
            boot_with(&mut flash, RamLoad, &mut validator, &mut counter, Some(ram)).unwrap();

        // Then the image that fits runs instead
        assert_eq!(response.image_offset, RAM_BASE);
        assert_eq!(&memory[..152], &flash.data()[SLOT_SIZE..SLOT_SIZE + 152]);
        let store = store(&flash);
        let selection = store.select(&mut flash, &[pair()]).unwrap();
        assert_eq!(selection, Selection::Active { slot: 1, replica: 1, healed: false });
    }

    #[test]
    fn rollback_protection_gates_the_addressed_paths() {
        // Given a named image with a stale security counter
        let mut flash = flash();
        let stale = FakeImage { security_counter: Some(7), ..image(1, 1) };
        let fresh = FakeImage { security_counter: Some(12), ..image(1, 2) };
        write_image(&mut flash, pair().primary, &stale);
        write_image(&mut flash, pair().secondary, &fresh);
        store(&flash).write_recovery(&mut flash, 0).unwrap();
        let mut validator = FakeValidator::accept_all();
        let mut counter = FakeCounter::with_stored([10, 0]);

        // When the device boots
        let response =
            boot_with(&mut flash, DirectXip, &mut validator, &mut counter, None).unwrap();

        // Then only the fresh image is allowed to run
        assert_eq!(response.image_offset, SLOT_SIZE);
        assert_eq!(counter.updates, vec![(0, 12)]);
    }
}
