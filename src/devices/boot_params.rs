//! Replicated boot parameter store for the address driven strategies.
//!
//! Two fixed size replicas live in their own flash partition, one at
//! the start of each half. Each holds one CRC sealed record naming
//! the active slot.
//! Commits always rewrite the replica *not* currently in use, so a
//! reset in the middle of a commit leaves the previous record intact;
//! version numbers then tell the survivors apart. A replica that fails
//! its checks is healed from the valid one on the next selection.

use crate::devices::image::{
    self, decode_version, Slot, SlotPair, Version, VERSION_OFFSET,
};
use crate::devices::traits::Flash;
use crate::error::Error;
use crate::log;
use crate::utilities::memory::{align_up, read_u32_le, write_u32_le, Address, Region};
use core::cmp::Ordering;
use crc::crc32;
use nb::block;
use static_assertions::const_assert;

/// Flash reserved for each replica, regardless of record size.
pub const REPLICA_SIZE: usize = kb!(4);
/// Image pairs a record can describe.
pub const MAX_IMAGES: usize = 2;

/// Serialized record footprint.
///
/// Little endian layout: crc `u32` at 0 (sealing everything after
/// itself), version `u32` at 4, format `u32` at 8, active slot `u8`
/// at 12, one pinned slot address `u32` per image from 13, app count
/// `u8` at 21, [`APP_ENTRIES`] name/index entries from 22, resource
/// index `u8` at 73.
const RECORD_SIZE: usize = 74;
const PADDED_RECORD_MAX: usize = 128;
const_assert!(RECORD_SIZE <= PADDED_RECORD_MAX);
const APP_ENTRIES: usize = 3;
const APP_NAME_SIZE: usize = 16;
const CURRENT_FORMAT: u32 = 1;
/// Reads as the version of an erased replica; never written.
const VERSION_SENTINEL: u32 = 0xFFFF_FFFF;

/// Dedicated flash area holding both parameter replicas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition<A: Address> {
    pub location: A,
    pub size: usize,
}

impl<A: Address> Region<A> for Partition<A> {
    fn contains(&self, address: A) -> bool {
        let start: usize = self.location.into();
        let address: usize = address.into();
        (address >= start) && (address < start + self.size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppEntry {
    pub name: [u8; APP_NAME_SIZE],
    pub use_index: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootRecord {
    pub version: u32,
    pub format_version: u32,
    pub active_slot: u8,
    pub addresses: [u32; MAX_IMAGES],
    pub app_count: u8,
    pub apps: [AppEntry; APP_ENTRIES],
    pub resource_active: u8,
}

/// Outcome of reading the parameter partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Selection {
    /// A valid record names the slot to run from.
    Active { slot: u8, replica: usize, healed: bool },
    /// Neither replica decodes but images are installed; a fresh
    /// record must be rebuilt from whatever the slots hold.
    NeedsRecovery,
    /// Neither replica decodes and the slots read blank. There is
    /// nothing to rebuild from, so a transient fault is the better
    /// bet and the caller should reset and try again.
    RebootAndRetry,
}

pub struct ParamStore<F: Flash> {
    pub partition: Partition<F::Address>,
    expected: [u32; MAX_IMAGES],
}

impl<F: Flash> ParamStore<F> {
    /// `expected` pins the slot base addresses the records must name;
    /// a record written for a different memory map never validates.
    pub fn new(
        flash: &F,
        partition: Partition<F::Address>,
        expected: [u32; MAX_IMAGES],
    ) -> Result<Self, Error> {
        let sector_size = flash.sector_size();
        let base: usize = partition.location.into();
        if REPLICA_SIZE % sector_size != 0
            || base % sector_size != 0
            || (partition.size / 2) % sector_size != 0
        {
            return Err(Error::ConfigurationError("parameter partition is not sector aligned"));
        }
        if partition.size < 2 * REPLICA_SIZE {
            return Err(Error::ConfigurationError("partition too small for two parameter replicas"));
        }
        if align_up(RECORD_SIZE, flash.write_alignment()) > PADDED_RECORD_MAX {
            return Err(Error::ConfigurationError("write alignment too coarse for a parameter record"));
        }
        Ok(Self { partition, expected })
    }

    /// Decides which slot to boot from, healing a corrupt replica
    /// from its valid twin along the way.
    pub fn select(
        &self,
        flash: &mut F,
        images: &[SlotPair<F::Address>],
    ) -> Result<Selection, Error> {
        let first = self.read_record(flash, 0)?;
        let second = self.read_record(flash, 1)?;
        match (first, second) {
            (Some(first), Some(second)) => {
                let replica = if newer(second.version, first.version) { 1 } else { 0 };
                let record = if replica == 0 { first } else { second };
                Ok(Selection::Active { slot: record.active_slot, replica, healed: false })
            }
            (Some(record), None) => {
                log::info!("healing the stale boot parameter replica");
                self.write_record(flash, 1, &record)?;
                Ok(Selection::Active { slot: record.active_slot, replica: 0, healed: true })
            }
            (None, Some(record)) => {
                log::info!("healing the stale boot parameter replica");
                self.write_record(flash, 0, &record)?;
                Ok(Selection::Active { slot: record.active_slot, replica: 1, healed: true })
            }
            (None, None) => {
                let pair =
                    images.first().ok_or(Error::ConfigurationError("no image slots configured"))?;
                let blank = image::slot_blank(flash, pair.primary)?
                    && image::slot_blank(flash, pair.secondary)?;
                if blank {
                    Ok(Selection::RebootAndRetry)
                } else {
                    log::warn!("both boot parameter replicas are invalid");
                    Ok(Selection::NeedsRecovery)
                }
            }
        }
    }

    /// Records `active_slot` by rewriting the replica not currently
    /// in use. The in-use replica is untouched, so interrupting the
    /// commit at any point leaves the previous selection readable.
    pub fn commit_active(&self, flash: &mut F, active_slot: u8) -> Result<(), Error> {
        let first = self.read_record(flash, 0)?;
        let second = self.read_record(flash, 1)?;
        let (current, in_use) = match (&first, &second) {
            (Some(first), Some(second)) => {
                if newer(second.version, first.version) {
                    (second, 1)
                } else {
                    (first, 0)
                }
            }
            (Some(first), None) => (first, 0),
            (None, Some(second)) => (second, 1),
            (None, None) => return Err(Error::StateInconsistent),
        };
        let record = BootRecord {
            version: next_version(current.version),
            format_version: CURRENT_FORMAT,
            active_slot,
            addresses: self.expected,
            ..*current
        };
        self.write_record(flash, 1 - in_use, &record)
    }

    /// Rebuilds the partition from scratch around `active_slot`. Both
    /// replicas are written, so only used when no valid record exists.
    pub fn write_recovery(&self, flash: &mut F, active_slot: u8) -> Result<(), Error> {
        let record = BootRecord {
            version: 1,
            format_version: CURRENT_FORMAT,
            active_slot,
            addresses: self.expected,
            app_count: 0,
            apps: [AppEntry { name: [0u8; APP_NAME_SIZE], use_index: 0 }; APP_ENTRIES],
            resource_active: 0,
        };
        self.write_record(flash, 0, &record)?;
        self.write_record(flash, 1, &record)
    }

    /// Picks the slot a recovery record should name: whichever holds
    /// the newer image version, ties going to the primary.
    pub fn recovery_candidate(
        &self,
        flash: &mut F,
        pair: &SlotPair<F::Address>,
    ) -> Result<u8, Error> {
        let primary = slot_version(flash, pair.primary)?;
        let secondary = slot_version(flash, pair.secondary)?;
        match (primary, secondary) {
            (None, None) => Err(Error::RecoveryFailed),
            (Some(_), None) => Ok(0),
            (None, Some(_)) => Ok(1),
            (Some(primary), Some(secondary)) => {
                Ok(if secondary.compare(&primary) == Ordering::Greater { 1 } else { 0 })
            }
        }
    }

    // Each replica occupies the front of one half of the partition.
    fn replica_location(&self, replica: usize) -> F::Address {
        self.partition.location + replica * (self.partition.size / 2)
    }

    /// Reads one replica, returning `None` unless the record seals
    /// correctly and matches this store's pinned memory map.
    fn read_record(&self, flash: &mut F, replica: usize) -> Result<Option<BootRecord>, Error> {
        let mut bytes = [0u8; RECORD_SIZE];
        block!(flash.read(self.replica_location(replica), &mut bytes))?;
        if crc32::checksum_ieee(&bytes[4..]) != read_u32_le(&bytes, 0) {
            return Ok(None);
        }
        let record = decode_record(&bytes);
        let valid = record.format_version != 0
            && record.active_slot < 2
            && record.addresses == self.expected;
        Ok(valid.then_some(record))
    }

    fn write_record(&self, flash: &mut F, replica: usize, record: &BootRecord) -> Result<(), Error> {
        let mut bytes = [0u8; RECORD_SIZE];
        encode_record(record, &mut bytes);

        let padded = align_up(RECORD_SIZE, flash.write_alignment());
        let mut buffer = [flash.erased_value(); PADDED_RECORD_MAX];
        buffer[..RECORD_SIZE].copy_from_slice(&bytes);

        let location = self.replica_location(replica);
        block!(flash.erase(location, REPLICA_SIZE))?;
        block!(flash.write(location, &buffer[..padded]))?;
        Ok(())
    }
}

/// Plain comparison with one carve-out: the erased sentinel always
/// loses, so a half provisioned partition defers to the written side.
fn newer(candidate: u32, incumbent: u32) -> bool {
    match (candidate == VERSION_SENTINEL, incumbent == VERSION_SENTINEL) {
        (true, _) => false,
        (false, true) => true,
        (false, false) => candidate > incumbent,
    }
}

fn next_version(version: u32) -> u32 {
    match version.wrapping_add(1) {
        VERSION_SENTINEL => 0,
        next => next,
    }
}

fn slot_version<F: Flash>(flash: &mut F, slot: Slot<F::Address>) -> Result<Option<Version>, Error> {
    if image::slot_blank(flash, slot)? {
        return Ok(None);
    }
    let mut bytes = [0u8; 8];
    block!(flash.read(slot.location + VERSION_OFFSET, &mut bytes))?;
    Ok(Some(decode_version(&bytes)))
}

fn decode_record(bytes: &[u8; RECORD_SIZE]) -> BootRecord {
    let mut addresses = [0u32; MAX_IMAGES];
    for (index, address) in addresses.iter_mut().enumerate() {
        *address = read_u32_le(bytes, 13 + 4 * index);
    }
    let mut apps = [AppEntry { name: [0u8; APP_NAME_SIZE], use_index: 0 }; APP_ENTRIES];
    for (index, app) in apps.iter_mut().enumerate() {
        let base = 22 + index * (APP_NAME_SIZE + 1);
        app.name.copy_from_slice(&bytes[base..base + APP_NAME_SIZE]);
        app.use_index = bytes[base + APP_NAME_SIZE];
    }
    BootRecord {
        version: read_u32_le(bytes, 4),
        format_version: read_u32_le(bytes, 8),
        active_slot: bytes[12],
        addresses,
        app_count: bytes[21],
        apps,
        resource_active: bytes[73],
    }
}

fn encode_record(record: &BootRecord, bytes: &mut [u8; RECORD_SIZE]) {
    write_u32_le(record.version, bytes, 4);
    write_u32_le(record.format_version, bytes, 8);
    bytes[12] = record.active_slot;
    for (index, address) in record.addresses.iter().enumerate() {
        write_u32_le(*address, bytes, 13 + 4 * index);
    }
    bytes[21] = record.app_count;
    for (index, app) in record.apps.iter().enumerate() {
        let base = 22 + index * (APP_NAME_SIZE + 1);
        bytes[base..base + APP_NAME_SIZE].copy_from_slice(&app.name);
        bytes[base + APP_NAME_SIZE] = app.use_index;
    }
    bytes[73] = record.resource_active;
    let crc = crc32::checksum_ieee(&bytes[4..]);
    write_u32_le(crc, bytes, 0);
}
