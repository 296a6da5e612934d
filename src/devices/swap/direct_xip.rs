//! Executing the active image in place.
//!
//! Both slots hold directly bootable images and the boot parameter
//! store decides which one runs, so there is nothing to copy and
//! nothing to arm. The strategy exists so the loader can dispatch
//! address driven selection the same way it dispatches the copying
//! strategies.

use super::{Job, RamRegion, Strategy, UpdateStrategy};
use crate::devices::traits::Flash;
use crate::error::Error;

pub struct DirectXip;

impl Strategy for DirectXip {
    const KIND: UpdateStrategy = UpdateStrategy::DirectXip;

    fn execute<F: Flash>(
        &mut self,
        _flash: &mut F,
        _job: &Job<F::Address>,
        _scratch: &mut [u8],
        _ram: Option<&mut RamRegion<'_>>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::image::{ImageHeader, Slot, SlotPair, Version};
    use crate::devices::swap::SwapType;
    use crate::hal::doubles::flash::{Address, FakeFlash};

    #[test]
    fn executing_in_place_touches_nothing() {
        let mut flash = FakeFlash::new(Address(0), 4096, 512, 4);
        let mut scratch = [0u8; 64];
        let job = Job {
            pair: SlotPair {
                image_index: 0,
                primary: Slot { device_id: 0, location: Address(0), size: 2048 },
                secondary: Slot { device_id: 0, location: Address(2048), size: 2048 },
            },
            header: ImageHeader {
                load_addr: 0,
                header_size: 32,
                protect_tlv_size: 0,
                image_size: 100,
                flags: 0,
                version: Version { major: 1, minor: 0, revision: 0, build: 0 },
            },
            swap: SwapType::None,
            swap_size: 0,
            resume_units: None,
            active_slot: 1,
        };

        DirectXip.execute(&mut flash, &job, &mut scratch, None).unwrap();

        assert!(flash.operations().is_empty());
    }
}
