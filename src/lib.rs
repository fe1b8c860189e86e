pub mod avb_boot;
pub mod avb_ops;
pub mod bcb;
pub mod boot_android;
pub mod bootargs;
pub mod bootctrl;
pub mod bootimg;
pub mod config;
pub mod constants;
pub mod device_tree;
pub mod dt_table;
pub mod env;
pub mod error;
pub mod fdt;
pub mod fdt_overlay;
pub mod gpt_helper;
pub mod metadata;
pub mod ops;
pub mod sysmem;
mod math_support;

use std::fmt::Write;

use log::{error, info};

use crate::avb_boot::{avb_main, BootContext, BootSource};
use crate::bcb::load_android_bootloader_params;
use crate::boot_android::StagedBoot;
use crate::bootctrl::{ab_get_metadata, mark_slot_active, mark_slot_successful, mark_slot_unbootable, slot_index_from_name};
use crate::config::Config;
use crate::constants::*;
use crate::dt_table::DtTable;
use crate::env::Environment;
use crate::error::IoResult;
use crate::gpt_helper::{load_dt_table_from_part, MmcDisk};
use crate::ops::{AvbOps, Console};
use crate::sysmem::SysMem;

/// Command table return convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdRet {
    Success,
    Failure,
    Usage,
}

impl CmdRet {
    pub fn code(&self) -> i32 {
        match self {
            CmdRet::Success => 0,
            CmdRet::Failure => 1,
            CmdRet::Usage => -1,
        }
    }
}

/// Leading digits of `s` in `base`, 0 when there are none
fn simple_strtoul(s: &str, base: u32) -> u64 {
    let s = s.trim();
    let s = if base == 16 { s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s) } else { s };
    let end = s.find(|c: char| !c.is_digit(base)).unwrap_or(s.len());
    u64::from_str_radix(&s[..end], base).unwrap_or(0)
}

/// `boota <mmc_dev> [mmc_part] <addr> [avb]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootaArgs {
    pub dev: i32,
    pub part: Option<String>,
    pub addr: u64,
}

impl BootaArgs {
    pub fn source(&self) -> BootSource {
        match self.part.as_deref() {
            Some(VIRT_BOOT_PARTITION) => BootSource::Ram(self.addr),
            _ => BootSource::Mmc(self.dev),
        }
    }
}

pub fn parse_boota_args(args: &[&str]) -> Result<BootaArgs, CmdRet> {
    if args.len() < 2 {
        return Err(CmdRet::Usage);
    }
    let dev = simple_strtoul(args[0], 10) as i32;
    let mut rest = &args[1..];
    let mut part = None;
    if rest[0].starts_with(|c: char| c.is_ascii_alphabetic()) {
        part = Some(rest[0].to_string());
        rest = &rest[1..];
    }
    let addr = rest.first().map(|a| simple_strtoul(a, 16)).ok_or(CmdRet::Usage)?;
    Ok(BootaArgs { dev, part, addr })
}

/// Run the verified boot and stage the selected slot. The caller hands the
/// result to booti.
pub fn do_boota(
    ops: &mut dyn AvbOps,
    console: &mut dyn Console,
    mem: &mut SysMem,
    env: &mut Environment,
    config: &Config,
    args: &[&str],
) -> Result<StagedBoot, CmdRet> {
    let args = parse_boota_args(args)?;
    if let Some(mode) = load_android_bootloader_params(ops, env) {
        info!("bootmode: {}", mode);
    }
    info!("AVB verification is ON ..");
    let mut ctx = BootContext {
        ops,
        console,
        mem,
        env,
        board: &config.board,
        upstream_decrements_tries: config.avb.upstream_decrements_tries,
    };
    match avb_main(&mut ctx, args.source()) {
        Ok(staged) => {
            info!("{}", staged.booti_args());
            Ok(staged)
        }
        Err(e) => {
            error!("{}", e);
            error!("ERROR: Boot Failed!");
            Err(CmdRet::Failure)
        }
    }
}

/// The overlay listing of a DTBO table image
pub fn format_dtboinfo(table: &[u8]) -> String {
    let mut out = String::new();
    let infos = DtTable::new(table).map(|t| t.get_dt_info()).unwrap_or_default();
    let _ = writeln!(out, "Available overlays:\n");
    let _ = writeln!(out, "\tIndex {:>14} {:>16}\n", "Name", "Board Id");
    for info in infos {
        let _ = writeln!(out, "\t  {}  -  {:>16}  -  {:#x}", info.idx, info.name, info.id);
    }
    out
}

/// `dtboinfo [a|b]`
pub fn do_dtboinfo(disk: &mut MmcDisk, slot: Option<&str>) -> CmdRet {
    let part = match slot {
        None => "dtbo_a",
        Some(s) if s.starts_with('a') => "dtbo_a",
        Some(s) if s.starts_with('b') => "dtbo_b",
        Some(_) => return CmdRet::Usage,
    };
    let table = load_dt_table_from_part(disk, part).unwrap_or_default();
    print!("{}", format_dtboinfo(&table));
    CmdRet::Success
}

/// Slot table as `list` prints it
pub fn format_slots(ops: &mut dyn AvbOps) -> IoResult<String> {
    let (ab_data, normalized) = ab_get_metadata(ops)?;
    let mut out = ab_data.to_string();
    if normalized {
        out.push_str("(normalized, not yet written back)\n");
    }
    let _ = writeln!(out, "Active slot: {}", AB_SLOT_SUFFIXES[ab_data.active_slot_by_priority()]);
    Ok(out)
}

pub fn list_slots(ops: &mut dyn AvbOps) -> CmdRet {
    match format_slots(ops) {
        Ok(text) => {
            print!("{}", text);
            CmdRet::Success
        }
        Err(e) => {
            error!("Error reading A/B metadata: {}", e);
            CmdRet::Failure
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    Activate,
    MarkSuccessful,
    MarkUnbootable,
}

/// `switch`, `mark-successful` and `mark-unbootable`
pub fn do_slot_action(ops: &mut dyn AvbOps, action: SlotAction, slot: &str) -> CmdRet {
    let Some(index) = slot_index_from_name(slot) else {
        error!("Invalid slot '{}'", slot);
        return CmdRet::Usage;
    };
    let ret = match action {
        SlotAction::Activate => mark_slot_active(ops, index),
        SlotAction::MarkSuccessful => mark_slot_successful(ops, index),
        SlotAction::MarkUnbootable => mark_slot_unbootable(ops, index),
    };
    match ret {
        Ok(()) => {
            info!("{:?} slot {}", action, AB_SLOT_SUFFIXES[index]);
            CmdRet::Success
        }
        Err(e) => {
            error!("Error updating A/B metadata: {}", e);
            CmdRet::Failure
        }
    }
}
