//! Collaborator interfaces consumed by the boot core.
//!
//! The A/B flow, the boot policy wrapper and the boot image assembler never
//! touch storage, secure storage or the console directly; everything goes
//! through the traits below so the board code (or a test fake) decides how.

use std::fmt;

use bitflags::bitflags;

use crate::constants::AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS;
use crate::error::IoResult;

bitflags! {
    /// Flags forwarded to the slot verifier
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotVerifyFlags: u32 {
        const ALLOW_VERIFICATION_ERROR = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashtreeErrorMode {
    RestartAndInvalidate,
    Restart,
    Eio,
    Logging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotVerifyResult {
    Ok,
    ErrorOom,
    ErrorIo,
    ErrorVerification,
    ErrorRollbackIndex,
    ErrorPublicKeyRejected,
    ErrorInvalidMetadata,
    ErrorUnsupportedVersion,
    ErrorInvalidArgument,
}

impl fmt::Display for SlotVerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match self {
            SlotVerifyResult::Ok => "OK",
            SlotVerifyResult::ErrorOom => "ERROR_OOM",
            SlotVerifyResult::ErrorIo => "ERROR_IO",
            SlotVerifyResult::ErrorVerification => "ERROR_VERIFICATION",
            SlotVerifyResult::ErrorRollbackIndex => "ERROR_ROLLBACK_INDEX",
            SlotVerifyResult::ErrorPublicKeyRejected => "ERROR_PUBLIC_KEY_REJECTED",
            SlotVerifyResult::ErrorInvalidMetadata => "ERROR_INVALID_METADATA",
            SlotVerifyResult::ErrorUnsupportedVersion => "ERROR_UNSUPPORTED_VERSION",
            SlotVerifyResult::ErrorInvalidArgument => "ERROR_INVALID_ARGUMENT",
        })
    }
}

/// A partition image loaded (and possibly verified) by the slot verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionData {
    pub partition_name: String,
    pub data: Vec<u8>,
}

/// Per-slot verification output. Dropping it releases the loaded images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotVerifyData {
    pub ab_suffix: String,
    pub cmdline: String,
    pub loaded_partitions: Vec<PartitionData>,
    pub rollback_indexes: [u64; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS],
}

impl SlotVerifyData {
    pub fn new(ab_suffix: &str) -> Self {
        SlotVerifyData {
            ab_suffix: ab_suffix.to_string(),
            cmdline: String::new(),
            loaded_partitions: Vec::new(),
            rollback_indexes: [0; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS],
        }
    }

    /// Find a loaded partition by its name without the slot suffix
    pub fn partition(&self, name: &str) -> Option<&PartitionData> {
        self.loaded_partitions.iter().find(|p| {
            p.partition_name == name
                || p.partition_name.strip_suffix(self.ab_suffix.as_str()) == Some(name)
        })
    }
}

/// What the verifier hands back: a result code and, when the result is
/// usable (OK or an allowed verification error), the slot data.
#[derive(Debug)]
pub struct SlotVerification {
    pub result: SlotVerifyResult,
    pub data: Option<SlotVerifyData>,
}

/// Storage, secure storage and chain-of-trust callbacks
pub trait AvbOps {
    /// Reads from a named partition. A negative offset counts from the end.
    fn read_from_partition(&mut self, partition: &str, offset: i64, buffer: &mut [u8]) -> IoResult<usize>;

    fn write_to_partition(&mut self, partition: &str, offset: i64, data: &[u8]) -> IoResult<()>;

    fn read_rollback_index(&mut self, location: usize) -> IoResult<u64>;

    fn write_rollback_index(&mut self, location: usize, value: u64) -> IoResult<()>;

    fn read_is_device_unlocked(&mut self) -> IoResult<bool>;

    /// Cryptographic verification of one slot, treated as a black box
    fn slot_verify(
        &mut self,
        requested_partitions: &[&str],
        ab_suffix: &str,
        flags: SlotVerifyFlags,
        hashtree_error_mode: HashtreeErrorMode,
    ) -> SlotVerification;

    fn virtual_ab_enabled(&self) -> bool {
        false
    }
}

/// Serial console as seen by the boot countdown
pub trait Console {
    /// True when a key press is pending
    fn tstc(&mut self) -> bool;

    fn getc(&mut self) -> Option<u8>;

    fn mdelay(&mut self, ms: u64);
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::error::IoError;

    pub(crate) const FAKE_MISC_SIZE: usize = 64 * 1024;

    /// In-memory AVB operations. Partitions are plain byte vectors.
    pub(crate) struct FakeAvbOps {
        pub partitions: HashMap<String, Vec<u8>>,
        pub misc_writes: usize,
        pub fail_writes: Option<IoError>,
        pub rollback: [u64; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS],
        pub rollback_writes: usize,
        pub unlocked: bool,
        pub verify_results: HashMap<String, SlotVerifyResult>,
        pub slot_rollback: HashMap<String, [u64; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS]>,
        pub verify_calls: Vec<String>,
        /// Slots that verify but come back without data
        pub withhold_data: Vec<String>,
        pub virtual_ab: bool,
    }

    impl FakeAvbOps {
        pub(crate) fn new() -> Self {
            let mut partitions = HashMap::new();
            partitions.insert("misc".to_string(), vec![0u8; FAKE_MISC_SIZE]);
            FakeAvbOps {
                partitions,
                misc_writes: 0,
                fail_writes: None,
                rollback: [0; AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS],
                rollback_writes: 0,
                unlocked: false,
                verify_results: HashMap::new(),
                slot_rollback: HashMap::new(),
                verify_calls: Vec::new(),
                withhold_data: Vec::new(),
                virtual_ab: false,
            }
        }

        pub(crate) fn misc(&self) -> &[u8] {
            &self.partitions["misc"]
        }

        fn range(&self, partition: &str, offset: i64, len: usize) -> IoResult<(usize, usize)> {
            let part = self.partitions.get(partition).ok_or(IoError::NoSuchPartition)?;
            let start = if offset < 0 {
                part.len().checked_sub(offset.unsigned_abs() as usize).ok_or(IoError::RangeOutsidePartition)?
            } else {
                offset as usize
            };
            if start > part.len() {
                return Err(IoError::RangeOutsidePartition);
            }
            Ok((start, std::cmp::min(start + len, part.len())))
        }
    }

    impl AvbOps for FakeAvbOps {
        fn read_from_partition(&mut self, partition: &str, offset: i64, buffer: &mut [u8]) -> IoResult<usize> {
            let (start, end) = self.range(partition, offset, buffer.len())?;
            let part = &self.partitions[partition];
            buffer[..end - start].copy_from_slice(&part[start..end]);
            Ok(end - start)
        }

        fn write_to_partition(&mut self, partition: &str, offset: i64, data: &[u8]) -> IoResult<()> {
            if let Some(err) = self.fail_writes {
                return Err(err);
            }
            let (start, end) = self.range(partition, offset, data.len())?;
            if end - start != data.len() {
                return Err(IoError::RangeOutsidePartition);
            }
            if partition == "misc" {
                self.misc_writes += 1;
            }
            if let Some(part) = self.partitions.get_mut(partition) {
                part[start..end].copy_from_slice(data);
            }
            Ok(())
        }

        fn read_rollback_index(&mut self, location: usize) -> IoResult<u64> {
            self.rollback.get(location).copied().ok_or(IoError::Io)
        }

        fn write_rollback_index(&mut self, location: usize, value: u64) -> IoResult<()> {
            self.rollback_writes += 1;
            *self.rollback.get_mut(location).ok_or(IoError::Io)? = value;
            Ok(())
        }

        fn read_is_device_unlocked(&mut self) -> IoResult<bool> {
            Ok(self.unlocked)
        }

        fn slot_verify(
            &mut self,
            requested_partitions: &[&str],
            ab_suffix: &str,
            flags: SlotVerifyFlags,
            _hashtree_error_mode: HashtreeErrorMode,
        ) -> SlotVerification {
            self.verify_calls.push(ab_suffix.to_string());
            let result = self.verify_results.get(ab_suffix).copied().unwrap_or(SlotVerifyResult::Ok);
            let allowed = matches!(
                result,
                SlotVerifyResult::ErrorVerification
                    | SlotVerifyResult::ErrorRollbackIndex
                    | SlotVerifyResult::ErrorPublicKeyRejected
            ) && flags.contains(SlotVerifyFlags::ALLOW_VERIFICATION_ERROR);
            if (result != SlotVerifyResult::Ok && !allowed) || self.withhold_data.iter().any(|s| s == ab_suffix) {
                return SlotVerification { result, data: None };
            }
            let mut data = SlotVerifyData::new(ab_suffix);
            data.cmdline = format!("dm=fake{}", ab_suffix);
            if let Some(indexes) = self.slot_rollback.get(ab_suffix) {
                data.rollback_indexes = *indexes;
            }
            for name in requested_partitions {
                let full = format!("{}{}", name, ab_suffix);
                if let Some(image) = self.partitions.get(&full) {
                    data.loaded_partitions.push(PartitionData { partition_name: full, data: image.clone() });
                }
            }
            SlotVerification { result, data: Some(data) }
        }

        fn virtual_ab_enabled(&self) -> bool {
            self.virtual_ab
        }
    }

    /// Console that reports a key press after a number of polls
    pub(crate) struct FakeConsole {
        pub key_after_polls: Option<usize>,
        pub polls: usize,
        pub delayed_ms: u64,
        pub pending: VecDeque<u8>,
    }

    impl FakeConsole {
        pub(crate) fn new(key_after_polls: Option<usize>) -> Self {
            FakeConsole { key_after_polls, polls: 0, delayed_ms: 0, pending: VecDeque::new() }
        }
    }

    impl Console for FakeConsole {
        fn tstc(&mut self) -> bool {
            self.polls += 1;
            if self.key_after_polls == Some(self.polls) {
                self.pending.push_back(b' ');
            }
            !self.pending.is_empty()
        }

        fn getc(&mut self) -> Option<u8> {
            self.pending.pop_front()
        }

        fn mdelay(&mut self, ms: u64) {
            self.delayed_ms += ms;
        }
    }
}
