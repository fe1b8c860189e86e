//! A/B slot metadata store, kept in misc
use std::fmt;

use crc32fast::Hasher;
use log::{debug, error, info, warn};
use zerocopy::byteorder::{big_endian, little_endian};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::*;
use crate::error::{IoError, IoResult};
use crate::ops::AvbOps;

/// Per-slot boot state, 4 bytes on disk
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SlotData {
    pub priority: u8,
    pub tries_remaining: u8,
    pub successful_boot: u8,
    reserved: [u8; 1],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unbootable,
    BootableUntried,
    BootableSuccessful,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match self {
            SlotState::Unbootable => "unbootable",
            SlotState::BootableUntried => "bootable (untried)",
            SlotState::BootableSuccessful => "bootable (successful)",
        })
    }
}

impl SlotData {
    pub fn new(priority: u8, tries_remaining: u8, successful_boot: bool) -> Self {
        SlotData { priority, tries_remaining, successful_boot: successful_boot as u8, reserved: [0] }
    }

    pub fn is_bootable(&self) -> bool {
        self.priority > 0 && (self.successful_boot != 0 || self.tries_remaining > 0)
    }

    pub fn set_unbootable(&mut self) {
        self.priority = 0;
        self.tries_remaining = 0;
        self.successful_boot = 0;
    }

    /// True when the slot still has priority but has burnt all its tries
    pub fn tries_exhausted(&self) -> bool {
        self.priority > 0 && self.tries_remaining == 0 && self.successful_boot == 0
    }

    /// Collapse every unbootable or illegal state into the canonical
    /// unbootable one (priority=0, tries_remaining=0, successful_boot=0).
    pub fn normalize(&mut self) {
        if self.priority > 0 {
            if self.tries_exhausted() {
                self.set_unbootable();
            }
            // mark_slot_successful() clears tries_remaining when it sets successful_boot
            if self.tries_remaining > 0 && self.successful_boot != 0 {
                self.set_unbootable();
            }
        } else {
            self.set_unbootable();
        }
    }

    pub fn state(&self) -> SlotState {
        if !self.is_bootable() {
            SlotState::Unbootable
        } else if self.successful_boot != 0 {
            SlotState::BootableSuccessful
        } else {
            SlotState::BootableUntried
        }
    }
}

/// Why an on-disk record was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataCorruption {
    BadMagic,
    UnsupportedVersion(u8),
    CrcMismatch { stored: u32, computed: u32 },
}

impl fmt::Display for MetadataCorruption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetadataCorruption::BadMagic => write!(f, "Magic is incorrect"),
            MetadataCorruption::UnsupportedVersion(v) => write!(f, "No support for given major version {}", v),
            MetadataCorruption::CrcMismatch { stored, computed } => {
                write!(f, "CRC32 does not match (stored {:#010x}, computed {:#010x})", stored, computed)
            }
        }
    }
}

/// A/B metadata record, 32 bytes, CRC32 trailer stored big-endian
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AbData {
    pub magic: [u8; 4],
    pub version_major: u8,
    pub version_minor: u8,
    reserved1: [u8; 2],
    pub slots: [SlotData; 2],
    reserved2: [u8; 12],
    crc32: big_endian::U32,
}

pub const AB_DATA_SIZE: usize = std::mem::size_of::<AbData>();

impl Default for AbData {
    /// Fresh metadata: slot a preferred, both slots untried
    fn default() -> Self {
        AbData {
            magic: *AB_MAGIC,
            version_major: AB_MAJOR_VERSION,
            version_minor: AB_MINOR_VERSION,
            reserved1: [0; 2],
            slots: [
                SlotData::new(AB_MAX_PRIORITY, AB_MAX_TRIES_REMAINING, false),
                SlotData::new(AB_MAX_PRIORITY - 1, AB_MAX_TRIES_REMAINING, false),
            ],
            reserved2: [0; 12],
            crc32: big_endian::U32::new(0),
        }
    }
}

impl fmt::Display for AbData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Version: {}.{}", self.version_major, self.version_minor)?;
        for (suffix, slot) in AB_SLOT_SUFFIXES.iter().zip(self.slots.iter()) {
            writeln!(f, "Slot {} : priority {}, tries remaining {}, successful boot {} -> {}",
                   suffix, slot.priority, slot.tries_remaining, slot.successful_boot, slot.state())?;
        }
        Ok(())
    }
}

impl AbData {
    fn compute_crc(bytes: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..AB_DATA_SIZE - 4]);
        hasher.finalize()
    }

    /// Validate a serialized record: magic, major version, then CRC32 over
    /// everything except the trailer.
    pub fn verify_from_bytes(bytes: &[u8]) -> Result<AbData, MetadataCorruption> {
        let data = AbData::read_from_prefix(bytes).map(|(d, _)| d).map_err(|_| MetadataCorruption::BadMagic)?;
        if &data.magic != AB_MAGIC {
            return Err(MetadataCorruption::BadMagic);
        }
        if data.version_major > AB_MAJOR_VERSION {
            return Err(MetadataCorruption::UnsupportedVersion(data.version_major));
        }
        let computed = AbData::compute_crc(data.as_bytes());
        let stored = data.crc32.get();
        if stored != computed {
            return Err(MetadataCorruption::CrcMismatch { stored, computed });
        }
        Ok(data)
    }

    /// Serialize with a freshly computed CRC32
    pub fn to_disk_bytes(&self) -> [u8; AB_DATA_SIZE] {
        let mut out = *self;
        out.crc32 = big_endian::U32::new(AbData::compute_crc(self.as_bytes()));
        let mut bytes = [0u8; AB_DATA_SIZE];
        bytes.copy_from_slice(out.as_bytes());
        bytes
    }

    pub fn normalize(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.normalize();
        }
    }

    /// Slot with the higher priority, ties resolve to slot b
    pub fn active_slot_by_priority(&self) -> usize {
        if self.slots[0].priority > self.slots[1].priority { 0 } else { 1 }
    }
}

/// Read the record from misc. A corrupt record is replaced by the default
/// one, which is written back immediately.
pub fn ab_data_read(ops: &mut dyn AvbOps) -> IoResult<AbData> {
    let mut serialized = [0u8; AB_DATA_SIZE];
    let num_read = match ops.read_from_partition(MISC_PARTITION_NAME, AB_METADATA_MISC_PARTITION_OFFSET, &mut serialized) {
        Err(IoError::Oom) => return Err(IoError::Oom),
        Err(_) => {
            error!("Error reading A/B metadata.");
            return Err(IoError::Io);
        }
        Ok(n) => n,
    };
    if num_read != AB_DATA_SIZE {
        error!("Error reading A/B metadata: short read ({} bytes).", num_read);
        return Err(IoError::Io);
    }
    match AbData::verify_from_bytes(&serialized) {
        Ok(data) => Ok(data),
        Err(why) => {
            error!("{}. Error validating A/B metadata from disk. Resetting and writing new A/B metadata to disk.", why);
            let data = AbData::default();
            ab_data_write(ops, &data)?;
            Ok(data)
        }
    }
}

pub fn ab_data_write(ops: &mut dyn AvbOps, data: &AbData) -> IoResult<()> {
    let serialized = data.to_disk_bytes();
    match ops.write_to_partition(MISC_PARTITION_NAME, AB_METADATA_MISC_PARTITION_OFFSET, &serialized) {
        Ok(()) => Ok(()),
        Err(IoError::Oom) => Err(IoError::Oom),
        Err(_) => {
            error!("Error writing A/B metadata.");
            Err(IoError::Io)
        }
    }
}

/// Load metadata and return (normalized, as loaded)
pub fn load_metadata(ops: &mut dyn AvbOps) -> IoResult<(AbData, AbData)> {
    let mut ab_data = ab_data_read(ops).map_err(|e| {
        error!("I/O error while loading A/B metadata.");
        e
    })?;
    let ab_data_orig = ab_data;
    let source_slot = ab_data.active_slot_by_priority();
    for (idx, slot) in ab_data.slots.iter_mut().enumerate() {
        let exhausted = slot.tries_exhausted();
        slot.normalize();
        if exhausted && ops.virtual_ab_enabled() {
            cancel_virtual_ab_update(ops, idx, source_slot);
        }
    }
    Ok((ab_data, ab_data_orig))
}

/// Persist only when the record differs from what was loaded
pub fn save_metadata_if_changed(ops: &mut dyn AvbOps, ab_data: &AbData, ab_data_orig: &AbData) -> IoResult<()> {
    if ab_data.as_bytes() != ab_data_orig.as_bytes() {
        debug!("Writing A/B metadata to disk.");
        return ab_data_write(ops, ab_data);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    None = 0,
    Unknown = 1,
    Snapshotted = 2,
    Merging = 3,
    Cancelled = 4,
}

/// Virtual A/B state shared with Android's update engine
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct VirtualAbMessage {
    pub version: u8,
    magic: little_endian::U32,
    pub merge_status: u8,
    pub source_slot: u8,
    reserved: [u8; 57],
}

impl VirtualAbMessage {
    pub fn new(source_slot: u8) -> Self {
        VirtualAbMessage {
            version: MAX_VIRTUAL_AB_MESSAGE_VERSION,
            magic: little_endian::U32::new(MISC_VIRTUAL_AB_MAGIC_HEADER),
            merge_status: MergeStatus::None as u8,
            source_slot,
            reserved: [0; 57],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == MISC_VIRTUAL_AB_MAGIC_HEADER
            && self.version <= MAX_VIRTUAL_AB_MESSAGE_VERSION
            && self.merge_status <= MergeStatus::Cancelled as u8
            && (self.source_slot as usize) < AB_SLOT_SUFFIXES.len()
    }
}

pub fn save_virtual_ab_msg(ops: &mut dyn AvbOps, msg: &VirtualAbMessage) -> IoResult<()> {
    if !msg.is_valid() {
        warn!("Invalid Virtual A/B message passed for saving!");
        return Err(IoError::Io);
    }
    ops.write_to_partition(MISC_PARTITION_NAME, SYSTEM_SPACE_OFFSET_IN_MISC, msg.as_bytes())
        .map_err(|e| {
            warn!("Failed to write Virtual A/B message to /misc!");
            e
        })
}

/// Load the message, re-initializing it when it does not validate
pub fn load_virtual_ab_msg(ops: &mut dyn AvbOps, current_slot: usize) -> IoResult<VirtualAbMessage> {
    let mut raw = [0u8; std::mem::size_of::<VirtualAbMessage>()];
    let n = ops.read_from_partition(MISC_PARTITION_NAME, SYSTEM_SPACE_OFFSET_IN_MISC, &mut raw)?;
    if n != raw.len() {
        return Err(IoError::Io);
    }
    let msg = VirtualAbMessage::read_from_bytes(&raw[..]).map_err(|_| IoError::Io)?;
    if msg.is_valid() {
        return Ok(msg);
    }
    info!("Invalid Virtual A/B message in /misc, re-init this...");
    let msg = VirtualAbMessage::new(current_slot as u8);
    save_virtual_ab_msg(ops, &msg)?;
    Ok(msg)
}

/// A snapshot-merge in progress forbids wiping userdata/metadata
pub fn virtual_ab_is_in_progress(ops: &mut dyn AvbOps, current_slot: usize) -> bool {
    match load_virtual_ab_msg(ops, current_slot) {
        Ok(msg) => {
            msg.merge_status == MergeStatus::Merging as u8
                || (msg.merge_status == MergeStatus::Snapshotted as u8 && msg.source_slot as usize != current_slot)
        }
        Err(_) => {
            warn!("Failed to load /misc while checking Virtual A/B state");
            false
        }
    }
}

/// The updated slot failed to boot: drop the pending snapshot update
fn cancel_virtual_ab_update(ops: &mut dyn AvbOps, failed_slot: usize, current_slot: usize) {
    let mut msg = match load_virtual_ab_msg(ops, current_slot) {
        Ok(msg) => msg,
        Err(_) => {
            warn!("Failed to load /misc from MMC");
            return;
        }
    };
    if msg.merge_status == MergeStatus::Snapshotted as u8 && msg.source_slot as usize != failed_slot {
        msg.merge_status = MergeStatus::Cancelled as u8;
        if save_virtual_ab_msg(ops, &msg).is_ok() {
            info!("Virtual update for slot {} cancelled", failed_slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test::FakeAvbOps;

    fn store(ops: &mut FakeAvbOps, data: &AbData) {
        let bytes = data.to_disk_bytes();
        let off = AB_METADATA_MISC_PARTITION_OFFSET as usize;
        ops.partitions.get_mut("misc").unwrap()[off..off + AB_DATA_SIZE].copy_from_slice(&bytes);
    }

    #[test]
    fn record_is_32_bytes() {
        assert_eq!(AB_DATA_SIZE, 32);
        assert_eq!(std::mem::size_of::<VirtualAbMessage>(), 64);
    }

    #[test]
    fn default_prefers_slot_a() {
        let data = AbData::default();
        assert_eq!(data.slots[0], SlotData::new(15, 7, false));
        assert_eq!(data.slots[1], SlotData::new(14, 7, false));
        assert_eq!(data.active_slot_by_priority(), 0);
    }

    #[test]
    fn normalize_is_idempotent() {
        for priority in 0..=16u8 {
            for tries in 0..=8u8 {
                for successful in 0..=2u8 {
                    let mut slot = SlotData { priority, tries_remaining: tries, successful_boot: successful, reserved: [0] };
                    slot.normalize();
                    let once = slot;
                    slot.normalize();
                    assert_eq!(once, slot);
                    if !once.is_bootable() {
                        assert_eq!(once, SlotData::new(0, 0, false));
                    }
                }
            }
        }
    }

    #[test]
    fn normalize_rejects_successful_with_tries() {
        let mut slot = SlotData::new(10, 3, true);
        slot.normalize();
        assert_eq!(slot.state(), SlotState::Unbootable);
    }

    #[test]
    fn decrementing_tries_never_makes_a_slot_bootable() {
        for priority in 0..=15u8 {
            for tries in 1..=7u8 {
                for successful in [false, true] {
                    let before = SlotData::new(priority, tries, successful);
                    let mut after = before;
                    after.tries_remaining -= 1;
                    assert!(!after.is_bootable() || before.is_bootable());
                }
            }
        }
    }

    #[test]
    fn crc_is_stored_big_endian() {
        let data = AbData::default();
        let bytes = data.to_disk_bytes();
        let crc = crc32fast::hash(&bytes[..28]);
        assert_eq!(&bytes[28..], &crc.to_be_bytes());
        assert_eq!(AbData::verify_from_bytes(&bytes).unwrap().slots, data.slots);
    }

    #[test]
    fn corrupt_record_is_reset_and_persisted() {
        let mut ops = FakeAvbOps::new();
        let data = ab_data_read(&mut ops).unwrap();
        assert_eq!(data.slots, AbData::default().slots);
        assert_eq!(ops.misc_writes, 1);
        // now valid, no further write
        ab_data_read(&mut ops).unwrap();
        assert_eq!(ops.misc_writes, 1);
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let mut bytes = AbData::default().to_disk_bytes();
        bytes[8] = 3;
        assert!(matches!(AbData::verify_from_bytes(&bytes), Err(MetadataCorruption::CrcMismatch { .. })));
        bytes[4] = AB_MAJOR_VERSION + 1;
        assert_eq!(AbData::verify_from_bytes(&bytes), Err(MetadataCorruption::UnsupportedVersion(2)));
    }

    #[test]
    fn read_failure_is_io_error() {
        let mut ops = FakeAvbOps::new();
        ops.partitions.remove("misc");
        assert_eq!(ab_data_read(&mut ops), Err(IoError::Io));
    }

    #[test]
    fn save_skips_identical_record() {
        let mut ops = FakeAvbOps::new();
        let data = AbData::default();
        save_metadata_if_changed(&mut ops, &data, &data).unwrap();
        assert_eq!(ops.misc_writes, 0);
        let mut changed = data;
        changed.slots[0].tries_remaining = 6;
        save_metadata_if_changed(&mut ops, &changed, &data).unwrap();
        assert_eq!(ops.misc_writes, 1);
    }

    #[test]
    fn exhausted_slot_cancels_snapshot_from_other_slot() {
        let mut ops = FakeAvbOps::new();
        ops.virtual_ab = true;
        let mut data = AbData::default();
        data.slots[1] = SlotData::new(15, 0, false);
        data.slots[0] = SlotData::new(14, 0, true);
        store(&mut ops, &data);
        let mut msg = VirtualAbMessage::new(0);
        msg.merge_status = MergeStatus::Snapshotted as u8;
        save_virtual_ab_msg(&mut ops, &msg).unwrap();

        let (normalized, _) = load_metadata(&mut ops).unwrap();
        assert_eq!(normalized.slots[1].state(), SlotState::Unbootable);
        let msg = load_virtual_ab_msg(&mut ops, 0).unwrap();
        assert_eq!(msg.merge_status, MergeStatus::Cancelled as u8);
    }

    #[test]
    fn invalid_virtual_ab_message_is_reinitialized() {
        let mut ops = FakeAvbOps::new();
        let msg = load_virtual_ab_msg(&mut ops, 1).unwrap();
        assert!(msg.is_valid());
        assert_eq!(msg.source_slot, 1);
        assert!(!virtual_ab_is_in_progress(&mut ops, 1));
    }
}
