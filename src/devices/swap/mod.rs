//! Update strategies and the decision logic that arms them.
//!
//! The decision half of this module turns a pair of trailer states
//! into a [`SwapType`] through a priority ordered rule table, the
//! same way the arbitration is specified for swap based update
//! schemes. The strategy half carries out the armed work: moving,
//! overwriting or loading images, resumable where the scheme calls
//! for it.

mod direct_xip;
mod overwrite;
mod ram_load;
mod sector_swap;

pub use direct_xip::DirectXip;
pub use overwrite::Overwrite;
pub use ram_load::{RamLoad, RamRegion};
pub use sector_swap::SectorSwap;

use crate::devices::image::{ImageHeader, SlotPair, Version};
use crate::devices::trailer::{FlagState, MagicState, SwapState};
use crate::devices::traits::Flash;
use crate::error::Error;
use crate::utilities::memory::{align_down, align_up, Address};
use core::cmp::min;
use nb::block;

/// The four ways a staged image can reach execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateStrategy {
    /// The staged image replaces the boot image outright.
    Overwrite,
    /// Boot and staged images trade places sector by sector, keeping
    /// the previous firmware recoverable.
    Swap,
    /// Images execute from RAM; flash slots are never rearranged.
    RamLoad,
    /// Images execute in place from whichever slot holds them.
    DirectXip,
}

/// Kind of transition recorded in, or derived from, slot trailers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapType {
    /// No transition; boot the primary slot as it stands.
    None,
    /// Upgrade that must be confirmed by the new firmware, and is
    /// rolled back on the boot after next otherwise.
    Test,
    /// Upgrade confirmed in advance.
    Permanent,
    /// Restoration of the previous firmware.
    Revert,
    /// The trailer encodes a transition this code does not know,
    /// which means the flash cannot be trusted.
    Panic,
}

impl SwapType {
    pub(crate) fn nibble(self) -> u8 {
        match self {
            SwapType::None => 1,
            SwapType::Test => 2,
            SwapType::Permanent => 3,
            SwapType::Revert => 4,
            SwapType::Panic => 0xF,
        }
    }

    pub(crate) fn from_nibble(nibble: u8) -> SwapType {
        match nibble {
            1 => SwapType::None,
            2 => SwapType::Test,
            3 => SwapType::Permanent,
            4 => SwapType::Revert,
            _ => SwapType::Panic,
        }
    }
}

/// Pattern a rule may hold against a trailer magic field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MagicMatch {
    Any,
    Is(MagicState),
}

impl MagicMatch {
    fn matches(self, state: MagicState) -> bool {
        match self {
            MagicMatch::Any => true,
            MagicMatch::Is(expected) => state == expected,
        }
    }
}

/// Pattern a rule may hold against a trailer flag field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlagMatch {
    Any,
    Is(FlagState),
}

impl FlagMatch {
    fn matches(self, state: FlagState) -> bool {
        match self {
            FlagMatch::Any => true,
            FlagMatch::Is(expected) => state == expected,
        }
    }
}

struct Rule {
    magic_primary: MagicMatch,
    magic_secondary: MagicMatch,
    image_ok_primary: FlagMatch,
    image_ok_secondary: FlagMatch,
    copy_done_primary: FlagMatch,
    outcome: SwapType,
}

/// Arbitration table, checked top to bottom with the first matching
/// row winning. Anything no row covers means normal boot.
const RULES: [Rule; 3] = [
    // A good magic in the secondary slot is an upgrade request;
    // image_ok decides whether it still needs a trial period.
    Rule {
        magic_primary: MagicMatch::Any,
        magic_secondary: MagicMatch::Is(MagicState::Good),
        image_ok_primary: FlagMatch::Any,
        image_ok_secondary: FlagMatch::Is(FlagState::Unset),
        copy_done_primary: FlagMatch::Any,
        outcome: SwapType::Test,
    },
    Rule {
        magic_primary: MagicMatch::Any,
        magic_secondary: MagicMatch::Is(MagicState::Good),
        image_ok_primary: FlagMatch::Any,
        image_ok_secondary: FlagMatch::Is(FlagState::Set),
        copy_done_primary: FlagMatch::Any,
        outcome: SwapType::Permanent,
    },
    // A completed swap whose trial image never confirmed itself gets
    // rolled back. The unset image_ok is what distinguishes it from a
    // confirmed upgrade that must stay put.
    Rule {
        magic_primary: MagicMatch::Is(MagicState::Good),
        magic_secondary: MagicMatch::Is(MagicState::Unset),
        image_ok_primary: FlagMatch::Is(FlagState::Unset),
        image_ok_secondary: FlagMatch::Any,
        copy_done_primary: FlagMatch::Is(FlagState::Set),
        outcome: SwapType::Revert,
    },
];

/// Decides the transition implied by the two trailers of a slot
/// pair. Outcomes outside the upgrade set collapse to
/// [`SwapType::Panic`] rather than reaching the executors.
pub fn resolve(primary: &SwapState, secondary: &SwapState) -> SwapType {
    for rule in &RULES {
        if rule.magic_primary.matches(primary.magic)
            && rule.magic_secondary.matches(secondary.magic)
            && rule.image_ok_primary.matches(primary.image_ok)
            && rule.image_ok_secondary.matches(secondary.image_ok)
            && rule.copy_done_primary.matches(primary.copy_done)
        {
            return match rule.outcome {
                SwapType::Test | SwapType::Permanent | SwapType::Revert => rule.outcome,
                _ => SwapType::Panic,
            };
        }
    }
    SwapType::None
}

/// One armed piece of update work, handed to a strategy to execute.
pub struct Job<A: Address> {
    /// The slot pair being operated on.
    pub pair: SlotPair<A>,
    /// Header of the image being staged or loaded.
    pub header: ImageHeader,
    /// Transition decided by [`resolve`] or recovered from an
    /// interrupted run.
    pub swap: SwapType,
    /// Bytes that must change slots; the footprint of the larger of
    /// the two images involved.
    pub swap_size: u32,
    /// Units already completed by an interrupted run, if resuming.
    pub resume_units: Option<usize>,
    /// Slot to load or boot, for address based strategies.
    pub active_slot: u8,
}

impl<A: Address> Job<A> {
    /// Job rebuilt from trailer state alone, to finish a run a reset
    /// interrupted. Mid swap neither slot holds a readable header, so
    /// a blank one stands in; the copying strategies never look at it.
    pub fn resumed(pair: SlotPair<A>, swap: SwapType, swap_size: u32, units_done: usize) -> Self {
        Job {
            pair,
            header: ImageHeader {
                load_addr: 0,
                header_size: 0,
                protect_tlv_size: 0,
                image_size: 0,
                flags: 0,
                version: Version { major: 0, minor: 0, revision: 0, build: 0 },
            },
            swap,
            swap_size,
            resume_units: Some(units_done),
            active_slot: 0,
        }
    }
}

/// An update strategy. Implementations carry out the flash and RAM
/// mutations for one job; deciding and arming jobs stays with the
/// loader.
pub trait Strategy {
    const KIND: UpdateStrategy;

    fn execute<F: Flash>(
        &mut self,
        flash: &mut F,
        job: &Job<F::Address>,
        scratch: &mut [u8],
        ram: Option<&mut RamRegion<'_>>,
    ) -> Result<(), Error>;
}

/// Copies a flash range through `scratch`, padding the final write up
/// to the device alignment with erased bytes. The destination must be
/// erased beforehand.
pub(crate) fn copy_range<F: Flash>(
    flash: &mut F,
    from: F::Address,
    to: F::Address,
    length: usize,
    scratch: &mut [u8],
) -> Result<(), Error> {
    let alignment = flash.write_alignment();
    let erased = flash.erased_value();
    let usable = align_down(scratch.len(), alignment);
    if usable == 0 {
        return Err(Error::ConfigurationError("scratch buffer smaller than one write unit"));
    }

    let mut index = 0usize;
    while index < length {
        let chunk = min(usable, length - index);
        let padded = align_up(chunk, alignment);
        block!(flash.read(from + index, &mut scratch[..chunk]))?;
        scratch[chunk..padded].fill(erased);
        block!(flash.write(to + index, &scratch[..padded]))?;
        index += chunk;
    }
    Ok(())
}
