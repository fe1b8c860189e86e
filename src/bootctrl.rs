//! A/B slot selection, after libavb_ab
use std::fmt;

use log::{debug, error};

use crate::constants::*;
use crate::error::{AbFlowError, IoError, IoResult};
use crate::metadata::{load_metadata, save_metadata_if_changed, AbData};
use crate::ops::{AvbOps, HashtreeErrorMode, SlotVerifyData, SlotVerifyFlags, SlotVerifyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbFlowStatus {
    Ok,
    OkWithVerificationError,
}

impl fmt::Display for AbFlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AbFlowStatus::Ok => write!(f, "OK"),
            AbFlowStatus::OkWithVerificationError => write!(f, "OK_WITH_VERIFICATION_ERROR"),
        }
    }
}

/// The selected slot. Owns the verification data of the winner only.
#[derive(Debug)]
pub struct AbFlowOutcome {
    pub status: AbFlowStatus,
    pub slot_index: usize,
    pub data: SlotVerifyData,
}

impl AbFlowOutcome {
    pub fn slot_suffix(&self) -> &'static str {
        AB_SLOT_SUFFIXES[self.slot_index]
    }
}

/// Parse "a", "b", "_a", "_b" or "0", "1" into a slot index
pub fn slot_index_from_name(name: &str) -> Option<usize> {
    match name.trim_start_matches('_') {
        "a" | "A" | "0" => Some(0),
        "b" | "B" | "1" => Some(1),
        _ => None,
    }
}

/// Highest priority bootable slot, slot a wins ties
pub fn get_bootable_slot(ab_data: &AbData) -> Result<usize, AbFlowError> {
    let a = ab_data.slots[0].is_bootable();
    let b = ab_data.slots[1].is_bootable();
    match (a, b) {
        (true, true) if ab_data.slots[1].priority > ab_data.slots[0].priority => Ok(1),
        (true, _) => Ok(0),
        (false, true) => Ok(1),
        (false, false) => {
            error!("No bootable slots found.");
            Err(AbFlowError::NoBootableSlots)
        }
    }
}

fn update_rollback_indexes(ops: &mut dyn AvbOps, slot_data: &[Option<SlotVerifyData>; 2]) -> Result<(), AbFlowError> {
    for n in 0..AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS {
        let value = match (&slot_data[0], &slot_data[1]) {
            (Some(a), Some(b)) => a.rollback_indexes[n].min(b.rollback_indexes[n]),
            (Some(a), None) => a.rollback_indexes[n],
            (None, Some(b)) => b.rollback_indexes[n],
            (None, None) => 0,
        };
        if value == 0 {
            continue;
        }
        let current = ops.read_rollback_index(n).map_err(|e| {
            if e != IoError::Oom {
                error!("Error getting rollback index for slot.");
            }
            AbFlowError::from(e)
        })?;
        // stored indexes only ever move forward
        if value > current {
            ops.write_rollback_index(n, value).map_err(|e| {
                if e != IoError::Oom {
                    error!("Error setting stored rollback index.");
                }
                AbFlowError::from(e)
            })?;
        }
    }
    Ok(())
}

fn select_slot(
    ops: &mut dyn AvbOps,
    ab_data: &mut AbData,
    requested_partitions: &[&str],
    flags: SlotVerifyFlags,
    hashtree_error_mode: HashtreeErrorMode,
) -> Result<AbFlowOutcome, AbFlowError> {
    let mut slot_data: [Option<SlotVerifyData>; 2] = [None, None];
    let mut saw_and_allowed_verification_error = false;

    for n in 0..2 {
        if !ab_data.slots[n].is_bootable() {
            continue;
        }
        let suffix = AB_SLOT_SUFFIXES[n];
        let verification = ops.slot_verify(requested_partitions, suffix, flags, hashtree_error_mode);
        let set_slot_unbootable = match verification.result {
            SlotVerifyResult::ErrorOom => return Err(AbFlowError::Oom),
            SlotVerifyResult::ErrorIo => return Err(AbFlowError::Io),
            SlotVerifyResult::ErrorInvalidArgument => return Err(AbFlowError::InvalidArgument),
            SlotVerifyResult::Ok => false,
            // fatal even when verification errors are allowed
            SlotVerifyResult::ErrorInvalidMetadata | SlotVerifyResult::ErrorUnsupportedVersion => true,
            SlotVerifyResult::ErrorVerification
            | SlotVerifyResult::ErrorRollbackIndex
            | SlotVerifyResult::ErrorPublicKeyRejected => {
                if flags.contains(SlotVerifyFlags::ALLOW_VERIFICATION_ERROR) {
                    debug!("Allowing slot {} which verified with result {} because ALLOW_VERIFICATION_ERROR is set.",
                           suffix, verification.result);
                    saw_and_allowed_verification_error = true;
                    false
                } else {
                    true
                }
            }
        };
        match (set_slot_unbootable, verification.data) {
            (false, Some(data)) => slot_data[n] = Some(data),
            (false, None) => {
                error!("Slot {} verified with result {} but returned no data - setting unbootable.",
                       suffix, verification.result);
                ab_data.slots[n].set_unbootable();
            }
            (true, _) => {
                error!("Error verifying slot {} with result {} - setting unbootable.", suffix, verification.result);
                ab_data.slots[n].set_unbootable();
            }
        }
    }

    let slot_index = get_bootable_slot(ab_data)?;
    update_rollback_indexes(ops, &slot_data)?;

    // still bootable here means the verify data was kept
    let Some(data) = slot_data[slot_index].take() else {
        return Err(AbFlowError::NoBootableSlots);
    };
    let status = if saw_and_allowed_verification_error {
        AbFlowStatus::OkWithVerificationError
    } else {
        AbFlowStatus::Ok
    };

    let slot = &mut ab_data.slots[slot_index];
    if slot.successful_boot == 0 && slot.tries_remaining > 0 {
        slot.tries_remaining -= 1;
    }
    Ok(AbFlowOutcome { status, slot_index, data })
}

/// Pick, verify and commit to a slot. Metadata changes are persisted on
/// every exit path; if that write fails the selection is discarded.
pub fn avb_ab_flow(
    ops: &mut dyn AvbOps,
    requested_partitions: &[&str],
    flags: SlotVerifyFlags,
    hashtree_error_mode: HashtreeErrorMode,
) -> Result<AbFlowOutcome, AbFlowError> {
    let (mut ab_data, ab_data_orig) = load_metadata(ops)?;
    let ret = select_slot(ops, &mut ab_data, requested_partitions, flags, hashtree_error_mode);
    save_metadata_if_changed(ops, &ab_data, &ab_data_orig)?;
    ret
}

pub fn flow_result_to_string(result: &Result<AbFlowOutcome, AbFlowError>) -> String {
    match result {
        Ok(outcome) => outcome.status.to_string(),
        Err(e) => e.to_string(),
    }
}

fn check_slot(slot_number: usize) -> IoResult<()> {
    if slot_number >= AB_SLOT_SUFFIXES.len() {
        error!("Invalid slot number {}", slot_number);
        return Err(IoError::Io);
    }
    Ok(())
}

/// Top priority, max tries, not yet successful. The other slot is pushed
/// below max priority.
pub fn mark_slot_active(ops: &mut dyn AvbOps, slot_number: usize) -> IoResult<()> {
    check_slot(slot_number)?;
    let (mut ab_data, ab_data_orig) = load_metadata(ops)?;
    let slot = &mut ab_data.slots[slot_number];
    slot.priority = AB_MAX_PRIORITY;
    slot.tries_remaining = AB_MAX_TRIES_REMAINING;
    slot.successful_boot = 0;

    let other = &mut ab_data.slots[1 - slot_number];
    if other.priority == AB_MAX_PRIORITY {
        other.priority = AB_MAX_PRIORITY - 1;
    }
    save_metadata_if_changed(ops, &ab_data, &ab_data_orig)
}

pub fn mark_slot_unbootable(ops: &mut dyn AvbOps, slot_number: usize) -> IoResult<()> {
    check_slot(slot_number)?;
    let (mut ab_data, ab_data_orig) = load_metadata(ops)?;
    ab_data.slots[slot_number].set_unbootable();
    save_metadata_if_changed(ops, &ab_data, &ab_data_orig)
}

/// No-op (besides normalization) when the slot is not bootable
pub fn mark_slot_successful(ops: &mut dyn AvbOps, slot_number: usize) -> IoResult<()> {
    check_slot(slot_number)?;
    let (mut ab_data, ab_data_orig) = load_metadata(ops)?;
    if !ab_data.slots[slot_number].is_bootable() {
        error!("Cannot mark unbootable slot as successful.");
        return save_metadata_if_changed(ops, &ab_data, &ab_data_orig);
    }
    ab_data.slots[slot_number].tries_remaining = 0;
    ab_data.slots[slot_number].successful_boot = 1;
    save_metadata_if_changed(ops, &ab_data, &ab_data_orig)
}

/// Normalized metadata; the bool is true when normalization changed it
pub fn ab_get_metadata(ops: &mut dyn AvbOps) -> IoResult<(AbData, bool)> {
    let (ab_data, ab_data_orig) = load_metadata(ops)?;
    Ok((ab_data, ab_data != ab_data_orig))
}
