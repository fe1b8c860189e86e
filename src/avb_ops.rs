//! `AvbOps` backed by a GPT disk image.

use log::{debug, warn};

use crate::config::AvbConfig;
use crate::constants::AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS;
use crate::error::{IoError, IoResult};
use crate::gpt_helper::{DiskError, MmcDisk};
use crate::ops::{
    AvbOps, HashtreeErrorMode, PartitionData, SlotVerification, SlotVerifyData, SlotVerifyFlags, SlotVerifyResult,
};

/// Rollback indexes and lock state live in memory; there is no secure
/// world on the host.
pub struct DiskAvbOps {
    disk: MmcDisk,
    unlocked: bool,
    assume_verified: bool,
    virtual_ab: bool,
    rollback: [u64; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS],
}

impl DiskAvbOps {
    pub fn new(disk: MmcDisk, cfg: &AvbConfig) -> Self {
        let mut rollback = [0u64; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS];
        for (slot, value) in rollback.iter_mut().zip(cfg.rollback_indexes.iter()) {
            *slot = *value;
        }
        DiskAvbOps {
            disk,
            unlocked: cfg.unlocked,
            assume_verified: cfg.assume_verified,
            virtual_ab: cfg.virtual_ab,
            rollback,
        }
    }

    pub fn disk(&mut self) -> &mut MmcDisk {
        &mut self.disk
    }

    pub fn rollback_indexes(&self) -> &[u64] {
        &self.rollback
    }

    fn load_partition(&mut self, name: &str) -> Result<Option<Vec<u8>>, DiskError> {
        match self.disk.read_whole_partition(name) {
            Ok(data) => Ok(Some(data)),
            Err(DiskError::NoSuchPartition(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AvbOps for DiskAvbOps {
    fn read_from_partition(&mut self, partition: &str, offset: i64, buffer: &mut [u8]) -> IoResult<usize> {
        Ok(self.disk.read_partition(partition, offset, buffer)?)
    }

    fn write_to_partition(&mut self, partition: &str, offset: i64, data: &[u8]) -> IoResult<()> {
        Ok(self.disk.write_partition(partition, offset, data)?)
    }

    fn read_rollback_index(&mut self, location: usize) -> IoResult<u64> {
        self.rollback.get(location).copied().ok_or(IoError::Io)
    }

    fn write_rollback_index(&mut self, location: usize, value: u64) -> IoResult<()> {
        let slot = self.rollback.get_mut(location).ok_or(IoError::Io)?;
        *slot = value;
        Ok(())
    }

    fn read_is_device_unlocked(&mut self) -> IoResult<bool> {
        Ok(self.unlocked)
    }

    /// Loads `<partition><suffix>` for every requested partition. There are
    /// no keys on the host, so images count as unverified unless the
    /// configuration says to trust them.
    fn slot_verify(
        &mut self,
        requested_partitions: &[&str],
        ab_suffix: &str,
        flags: SlotVerifyFlags,
        _hashtree_error_mode: HashtreeErrorMode,
    ) -> SlotVerification {
        let result = if self.assume_verified { SlotVerifyResult::Ok } else { SlotVerifyResult::ErrorVerification };
        if result != SlotVerifyResult::Ok && !flags.contains(SlotVerifyFlags::ALLOW_VERIFICATION_ERROR) {
            return SlotVerification { result, data: None };
        }

        let mut data = SlotVerifyData::new(ab_suffix);
        data.cmdline = format!(
            "androidboot.vbmeta.device_state={}",
            if self.unlocked { "unlocked" } else { "locked" }
        );
        for name in requested_partitions {
            let full = format!("{}{}", name, ab_suffix);
            match self.load_partition(&full) {
                Ok(Some(image)) => {
                    debug!("loaded {} ({} bytes)", full, image.len());
                    data.loaded_partitions.push(PartitionData { partition_name: full, data: image });
                }
                Ok(None) => warn!("partition {} not found", full),
                Err(e) => {
                    warn!("loading {} failed: {}", full, e);
                    return SlotVerification { result: SlotVerifyResult::ErrorIo, data: None };
                }
            }
        }
        SlotVerification { result, data: Some(data) }
    }

    fn virtual_ab_enabled(&self) -> bool {
        self.virtual_ab
    }
}
