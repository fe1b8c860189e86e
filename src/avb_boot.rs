//! Verified boot policy around the A/B flow: retry counter compensation,
//! the unlocked-device abort window and the RAM boot source.

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use thiserror::Error;
use zerocopy::FromBytes;

use crate::boot_android::{do_boot_android_img_from_ram, BootImages, StagedBoot};
use crate::bootargs::append_arg;
use crate::bootctrl::{avb_ab_flow, flow_result_to_string, AbFlowStatus};
use crate::bootimg::{android_image_check_header, ImageError, VendorBootImgHdrV3, BOOT_IMG_HDR_V3_SIZE};
use crate::config::BoardConfig;
use crate::constants::*;
use crate::env::Environment;
use crate::error::{AbFlowError, IoResult};
use crate::metadata::{ab_data_read, ab_data_write};
use crate::ops::{AvbOps, Console, HashtreeErrorMode, SlotVerifyFlags};
use crate::sysmem::SysMem;

/// Reasons the boot is halted. None of them falls back to another image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("Error determining whether device is unlocked.")]
    UnlockState,
    #[error("Fastboot boot not supported in locked state!")]
    RamBootLocked,
    #[error("Failed to update metadata boot retry counter!")]
    RetryCounter,
    #[error("Verification Error in Locked State!")]
    VerificationLocked,
    #[error("Booting halted by user request")]
    UserAbort,
    #[error("Android boot partition is not found")]
    NoBootPartition,
    #[error("Vendor boot partition is not found")]
    NoVendorBootPartition,
    #[error("Dtbo partition is not found")]
    NoDtboPartition,
    #[error("OOM error while doing A/B select flow.")]
    FlowOom,
    #[error("I/O error while doing A/B select flow.")]
    FlowIo,
    #[error("No bootable slots - enter repair mode")]
    NoBootableSlots,
    #[error("Invalid Argument error while doing A/B select flow.")]
    FlowInvalidArgument,
    #[error(transparent)]
    Image(#[from] ImageError),
}

impl From<AbFlowError> for BootError {
    fn from(err: AbFlowError) -> Self {
        match err {
            AbFlowError::Oom => BootError::FlowOom,
            AbFlowError::Io => BootError::FlowIo,
            AbFlowError::NoBootableSlots => BootError::NoBootableSlots,
            AbFlowError::InvalidArgument => BootError::FlowInvalidArgument,
        }
    }
}

/// Where the boot image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSource {
    Mmc(i32),
    /// Boot image already staged in memory by `fastboot boot`
    Ram(u64),
}

impl BootSource {
    pub fn device(&self) -> i32 {
        match self {
            BootSource::Mmc(dev) => *dev,
            BootSource::Ram(_) => VIRT_BOOT_DEVICE,
        }
    }
}

/// Everything `avb_main` works on
pub struct BootContext<'a> {
    pub ops: &'a mut dyn AvbOps,
    pub console: &'a mut dyn Console,
    pub mem: &'a mut SysMem,
    pub env: &'a mut Environment,
    pub board: &'a BoardConfig,
    /// The stage before us already took one try off the active slot
    pub upstream_decrements_tries: bool,
}

/// Give back the try the previous boot stage consumed, so a broken slot
/// still gets the full number of attempts. Leaves successful slots and
/// counters at zero or at the maximum alone.
pub fn inc_metadata_tries_remaining(ops: &mut dyn AvbOps) -> IoResult<()> {
    let mut ab_data = ab_data_read(ops).map_err(|e| {
        error!("I/O error while loading A/B metadata.");
        e
    })?;
    let active = ab_data.active_slot_by_priority();
    let slot = &mut ab_data.slots[active];
    if slot.successful_boot == 0 && slot.tries_remaining != 0 && slot.tries_remaining < AB_MAX_TRIES_REMAINING {
        slot.tries_remaining += 1;
        ab_data_write(ops, &ab_data).map_err(|e| {
            error!("I/O error while writing A/B metadata.");
            e
        })?;
    }
    Ok(())
}

/// Seconds to wait for a key press, from env `avb_delay`
pub fn avb_delay(env: &Environment) -> i64 {
    env.get("avb_delay")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(DEFAULT_AVB_DELAY)
}

const POLL_INTERVAL_MS: u64 = 10;
const TICK_MS: u64 = 1000;

/// Count down `delay` seconds. Returns true when a key was pressed, which
/// is consumed.
pub fn abort_countdown(console: &mut dyn Console, delay: i64) -> bool {
    let ticks = delay.max(0) as u64;
    let pb = ProgressBar::new(ticks);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:20.yellow}] {pos}/{len}s")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message("OS was not verified! Press any key to halt booting!..");

    for _ in 0..ticks {
        let mut waited = 0;
        while waited < TICK_MS {
            if console.tstc() {
                let _ = console.getc();
                pb.abandon_with_message("aborted");
                return true;
            }
            console.mdelay(POLL_INTERVAL_MS);
            waited += POLL_INTERVAL_MS;
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    false
}

/// Point a RAM-staged vendor boot image at the fixed load addresses
pub fn do_correct_boot_address(vendor_boot: &mut [u8]) {
    if let Ok((hdr, _)) = VendorBootImgHdrV3::mut_from_prefix(vendor_boot) {
        hdr.correct_boot_address();
    }
}

/// Boot image staged at `addr`, sized from its own header
fn ram_boot_image(mem: &SysMem, addr: u64) -> Vec<u8> {
    let head = mem.read(addr, BOOT_IMG_HDR_V3_SIZE);
    match android_image_check_header(&head) {
        Ok(hdr) => mem.read(addr, hdr.image_size() as usize),
        Err(_) => head,
    }
}

/// Select and verify a slot, then stage its images for the kernel
pub fn avb_main(ctx: &mut BootContext, source: BootSource) -> Result<StagedBoot, BootError> {
    let delay = avb_delay(ctx.env);

    let unlocked = ctx.ops.read_is_device_unlocked().map_err(|_| BootError::UnlockState)?;
    info!("read_is_device_unlocked() ops returned that device is {}", if unlocked { "UNLOCKED" } else { "LOCKED" });
    info!("boot_device = {}", source.device());

    let mut requested: &[&str] = &REQUESTED_PARTITIONS;
    let mut ram_boot = None;
    if let BootSource::Ram(addr) = source {
        info!("setting ram partition..");
        if !unlocked {
            return Err(BootError::RamBootLocked);
        }
        requested = &REQUESTED_PARTITIONS[1..];
        ram_boot = Some(ram_boot_image(ctx.mem, addr));
    }

    let flags = if unlocked { SlotVerifyFlags::ALLOW_VERIFICATION_ERROR } else { SlotVerifyFlags::empty() };

    if ctx.upstream_decrements_tries && inc_metadata_tries_remaining(ctx.ops).is_err() {
        return Err(BootError::RetryCounter);
    }

    let result = avb_ab_flow(ctx.ops, requested, flags, HashtreeErrorMode::RestartAndInvalidate);
    info!("avb_ab_flow() returned {}", flow_result_to_string(&result));
    let outcome = result?;

    if outcome.status == AbFlowStatus::OkWithVerificationError {
        if !unlocked {
            return Err(BootError::VerificationLocked);
        }
        if abort_countdown(ctx.console, delay) {
            return Err(BootError::UserAbort);
        }
    }

    let data = &outcome.data;
    info!("slot_suffix:    {}", data.ab_suffix);
    info!("cmdline:        {}", data.cmdline);

    let state = if outcome.status == AbFlowStatus::Ok { "green" } else { "orange" };
    append_arg(ctx.env, &data.cmdline);
    append_arg(ctx.env, &format!("androidboot.verifiedbootstate={}", state));
    append_arg(ctx.env, &format!("androidboot.slot_suffix={}", data.ab_suffix));

    let boot = match ram_boot.as_deref() {
        Some(image) => Some(image),
        None => data.partition("boot").map(|p| p.data.as_slice()),
    };
    let mut vendor_boot = data.partition("vendor_boot").map(|p| p.data.clone());
    let dtbo = data.partition("dtbo").map(|p| p.data.as_slice());

    let boot = boot.ok_or(BootError::NoBootPartition)?;
    let vendor_boot = vendor_boot.as_mut().ok_or(BootError::NoVendorBootPartition)?;
    let dtbo = dtbo.ok_or(BootError::NoDtboPartition)?;

    if ram_boot.is_some() {
        do_correct_boot_address(vendor_boot);
    }

    let images = BootImages { boot, vendor_boot: vendor_boot.as_slice(), dtbo: Some(dtbo) };
    let staged = do_boot_android_img_from_ram(ctx.ops, ctx.mem, ctx.env, ctx.board, &images)?;
    if staged.overlays_applied == 0 {
        warn!("booting without device tree overlays");
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootctrl::ab_get_metadata;
    use crate::bootimg::{build_boot_image, build_vendor_boot_image, vendor_image_check_header};
    use crate::dt_table::build_dt_table;
    use crate::fdt::{Fdt, Node};
    use crate::metadata::{AbData, SlotData};
    use crate::ops::test::{FakeAvbOps, FakeConsole};
    use crate::ops::SlotVerifyResult;

    fn vendor_image() -> Vec<u8> {
        let base = Fdt::new(Node::new("").with_prop("model", b"Renesas base\0".to_vec())).to_bytes().unwrap();
        let table = build_dt_table(&[(RCAR_GENERIC_PLAT_ID, base)], 2048);
        let hdr = VendorBootImgHdrV3::new(2048, 0x4808_0000, 0x4a18_0000, 0x4800_0000, "salvator", "");
        build_vendor_boot_image(hdr, &[0xcc; 10], &table)
    }

    fn ops_with_images(slots: [SlotData; 2]) -> FakeAvbOps {
        let mut ops = FakeAvbOps::new();
        let mut data = AbData::default();
        data.slots = slots;
        ab_data_write(&mut ops, &data).unwrap();
        ops.misc_writes = 0;
        for suffix in AB_SLOT_SUFFIXES {
            ops.partitions.insert(format!("boot{}", suffix), build_boot_image(&[0xaa; 100], &[0xbb; 100], ""));
            ops.partitions.insert(format!("vendor_boot{}", suffix), vendor_image());
            ops.partitions.insert(format!("dtbo{}", suffix), build_dt_table(&[], 2048));
        }
        ops
    }

    fn run(ops: &mut FakeAvbOps, console: &mut FakeConsole, mem: &mut SysMem, env: &mut Environment, source: BootSource) -> Result<StagedBoot, BootError> {
        let board = BoardConfig::default();
        let mut ctx = BootContext { ops, console, mem, env, board: &board, upstream_decrements_tries: true };
        avb_main(&mut ctx, source)
    }

    #[test]
    fn tries_compensation() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        inc_metadata_tries_remaining(&mut ops).unwrap();
        assert_eq!(ab_data_read(&mut ops).unwrap().slots[0].tries_remaining, 4);

        for (tries, successful) in [(0, false), (7, false), (3, true)] {
            let mut ops = ops_with_images([SlotData::new(15, tries, successful), SlotData::new(0, 0, false)]);
            let before = ops.misc_writes;
            inc_metadata_tries_remaining(&mut ops).unwrap();
            assert_eq!(ops.misc_writes, before);
        }
    }

    #[test]
    fn locked_boot_from_mmc() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        let mut env: Environment = [("bootargs", "quiet")].into_iter().collect();
        let mut mem = SysMem::new();
        let mut console = FakeConsole::new(None);
        let staged = run(&mut ops, &mut console, &mut mem, &mut env, BootSource::Mmc(1)).unwrap();
        assert_eq!(staged.kernel_addr, 0x4808_0000);
        // +1 for the upstream decrement, -1 for this boot
        let (ab, _) = ab_get_metadata(&mut ops).unwrap();
        assert_eq!(ab.slots[0].tries_remaining, 3);
        let bootargs = env.get("bootargs").unwrap();
        assert!(bootargs.contains("quiet dm=fake_a androidboot.verifiedbootstate=green androidboot.slot_suffix=_a"));
        assert_eq!(console.polls, 0);
    }

    #[test]
    fn locked_device_rejects_ram_boot() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        let mut console = FakeConsole::new(None);
        let err = run(&mut ops, &mut console, &mut SysMem::new(), &mut Environment::new(), BootSource::Ram(0x5000_0000));
        assert_eq!(err.unwrap_err(), BootError::RamBootLocked);
        assert_eq!(ops.misc_writes, 0);
    }

    #[test]
    fn unlocked_verification_error_counts_down() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        ops.unlocked = true;
        ops.verify_results.insert("_a".to_string(), SlotVerifyResult::ErrorVerification);
        let mut env: Environment = [("avb_delay", "2")].into_iter().collect();
        let mut console = FakeConsole::new(None);
        let staged = run(&mut ops, &mut console, &mut SysMem::new(), &mut env, BootSource::Mmc(1));
        assert!(staged.is_ok());
        assert_eq!(console.delayed_ms, 2000);
        assert!(env.get("bootargs").unwrap().contains("androidboot.verifiedbootstate=orange"));
    }

    #[test]
    fn key_press_halts_boot() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        ops.unlocked = true;
        ops.verify_results.insert("_a".to_string(), SlotVerifyResult::ErrorVerification);
        let mut console = FakeConsole::new(Some(150));
        let err = run(&mut ops, &mut console, &mut SysMem::new(), &mut Environment::new(), BootSource::Mmc(1));
        assert_eq!(err.unwrap_err(), BootError::UserAbort);
        assert!(console.pending.is_empty());
        assert_eq!(console.delayed_ms, 1490);
    }

    #[test]
    fn no_bootable_slots_is_fatal() {
        let mut ops = ops_with_images([SlotData::new(0, 0, false), SlotData::new(0, 0, false)]);
        let mut console = FakeConsole::new(None);
        let err = run(&mut ops, &mut console, &mut SysMem::new(), &mut Environment::new(), BootSource::Mmc(1));
        let err = err.unwrap_err();
        assert_eq!(err, BootError::NoBootableSlots);
        assert_eq!(err.to_string(), "No bootable slots - enter repair mode");
    }

    #[test]
    fn missing_dtbo_partition() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        ops.partitions.remove("dtbo_a");
        let mut console = FakeConsole::new(None);
        let err = run(&mut ops, &mut console, &mut SysMem::new(), &mut Environment::new(), BootSource::Mmc(1));
        assert_eq!(err.unwrap_err(), BootError::NoDtboPartition);
    }

    #[test]
    fn ram_boot_uses_staged_image_and_default_addresses() {
        let mut ops = ops_with_images([SlotData::new(15, 3, false), SlotData::new(0, 0, false)]);
        ops.unlocked = true;
        // vendor image asks for other addresses, RAM boot overrides them
        let hdr = VendorBootImgHdrV3::new(2048, 0x4900_0000, 0x4b00_0000, 0x4700_0000, "salvator", "");
        let table = build_dt_table(&[(RCAR_GENERIC_PLAT_ID, Fdt::new(Node::new("")).to_bytes().unwrap())], 2048);
        ops.partitions.insert("vendor_boot_a".to_string(), build_vendor_boot_image(hdr, &[0xcc; 10], &table));
        ops.partitions.remove("boot_a");

        let mut mem = SysMem::new();
        mem.write(0x5800_0000, &build_boot_image(&[0x11; 300], &[0x22; 30], ""));
        let mut console = FakeConsole::new(None);
        let staged = run(&mut ops, &mut console, &mut mem, &mut Environment::new(), BootSource::Ram(0x5800_0000)).unwrap();
        assert_eq!(staged.kernel_addr, VIRT_SYS_LOAD_ADDR as u64);
        assert_eq!(staged.ramdisk_addr, DEFAULT_RD_ADDR as u64);
        assert_eq!(staged.dtb_addr, DEFAULT_SECOND_ADDR);
        assert_eq!(mem.read(VIRT_SYS_LOAD_ADDR as u64, 300), vec![0x11; 300]);
    }

    #[test]
    fn correct_boot_address_rewrites_header() {
        let mut image = vendor_image();
        do_correct_boot_address(&mut image);
        let hdr = vendor_image_check_header(&image).unwrap();
        assert_eq!(hdr.kernel_addr.get(), VIRT_SYS_LOAD_ADDR);
        assert_eq!(hdr.ramdisk_addr.get(), DEFAULT_RD_ADDR);
        assert_eq!(hdr.dtb_addr.get(), DEFAULT_SECOND_ADDR);
    }

    #[test]
    fn delay_from_env() {
        assert_eq!(avb_delay(&Environment::new()), DEFAULT_AVB_DELAY);
        let env: Environment = [("avb_delay", "-1")].into_iter().collect();
        assert_eq!(avb_delay(&env), -1);
    }
}
