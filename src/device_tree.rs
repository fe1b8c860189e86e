//! Boot DTB composition: pick the base tree for this platform, merge the
//! requested overlays on top of it and stage the result in memory.

use log::{error, info, warn};
use rand::Rng;
use thiserror::Error;

use crate::bootargs::add_dtbo_index;
use crate::config::{BoardConfig, DramMode, Soc};
use crate::constants::*;
use crate::dt_table::{DtTable, DtTableEntry, DtTableError};
use crate::env::Environment;
use crate::fdt::{Fdt, FdtError};
use crate::fdt_overlay::overlay_apply;
use crate::sysmem::SysMem;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceTreeError {
    #[error("No proper FDT entry found for current platform id={0:x}")]
    NoPlatformEntry(u32),
    #[error(transparent)]
    Table(#[from] DtTableError),
    #[error(transparent)]
    Fdt(#[from] FdtError),
}

/// Overlay indices requested by `androidboot.dtbo_idx=i,j,k` in `bootargs`,
/// at most `max_size` of them.
pub fn get_overlay_order(bootargs: &str, max_size: usize) -> Vec<u32> {
    let mut order = Vec::new();
    if max_size == 0 {
        warn!("Wrong parameters for determining right overlay order");
        return order;
    }
    let Some(pos) = bootargs.find(DTBO_IDX_PARAM) else {
        return order;
    };
    let Some(mut iter) = bootargs[pos + DTBO_IDX_PARAM.len()..].strip_prefix('=') else {
        warn!("After \"{}\" must be '=' symbol", DTBO_IDX_PARAM);
        return order;
    };

    while iter.starts_with(|c: char| c.is_ascii_digit()) {
        let end = iter.find(|c: char| !c.is_ascii_digit()).unwrap_or(iter.len());
        // saturate like strtoul on overflow
        order.push(iter[..end].parse::<u32>().unwrap_or(u32::MAX));
        iter = &iter[end..];
        match iter.strip_prefix(',') {
            Some(rest) if order.len() < max_size => iter = rest,
            _ => break,
        }
    }

    if order.is_empty() {
        warn!("Invalid idx from \"{}\" parameter", DTBO_IDX_PARAM);
    }
    order
}

/// Resolve an overlay index: the entry at exactly `index` must be built
/// for `plat_id` (or for every platform).
fn resolve_overlay<'a>(dto: &DtTable<'a>, plat_id: u32, index: u32) -> Option<&'a DtTableEntry> {
    match dto.find(plat_id, index as usize) {
        Some((found, entry)) if found == index as usize => Some(entry),
        _ => None,
    }
}

/// Upper bound of the composed tree: the base size plus the size of every
/// requested overlay that resolves for the base entry id. Overlays after a
/// failing one are still counted.
pub fn calculate_max_dt_size(base: &DtTableEntry, dto: &DtTable, order: &[u32]) -> usize {
    let base_id = base.id.get();
    order
        .iter()
        .filter_map(|&idx| resolve_overlay(dto, base_id, idx))
        .fold(base.dt_size.get() as usize, |size, entry| size + entry.dt_size.get() as usize)
}

/// Result of an overlay pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayReport {
    /// Overlays applied, a prefix of the requested order
    pub applied: usize,
    pub max_dt_size: usize,
    /// Size of the composed blob written back
    pub dt_size: usize,
}

/// Apply the overlays named in `bootargs`, in order, to the tree at
/// `load_addr`. The first overlay that does not resolve, does not fit or
/// does not apply ends the pass; everything applied before it is kept.
pub fn apply_all_overlays(
    mem: &mut SysMem,
    load_addr: u64,
    base: &DtTableEntry,
    dto: &DtTable,
    plat_id: u32,
    bootargs: &str,
) -> OverlayReport {
    let mut report = OverlayReport { applied: 0, max_dt_size: 0, dt_size: base.dt_size.get() as usize };
    let order = get_overlay_order(bootargs, dto.entry_count());
    if order.is_empty() {
        return report;
    }
    report.max_dt_size = calculate_max_dt_size(base, dto, &order);

    let base_blob = mem.read(load_addr, base.dt_size.get() as usize);
    let mut merged = match Fdt::from_bytes(&base_blob) {
        Ok(fdt) => fdt,
        Err(e) => {
            error!("ERROR, base device tree is unusable: {}", e);
            return report;
        }
    };

    for &idx in &order {
        let Some(entry) = resolve_overlay(dto, plat_id, idx) else {
            warn!("Overlay with idx = {} is not for [{:#x}] platform", idx, plat_id);
            break;
        };
        let overlay = match dto
            .load_dt(idx as usize)
            .map_err(DeviceTreeError::from)
            .and_then(|blob| Fdt::from_bytes(blob).map_err(DeviceTreeError::from))
        {
            Ok(overlay) => overlay,
            Err(e) => {
                error!("ERROR, due applying overlay with idx {}: {}", idx, e);
                break;
            }
        };

        let needed = match merged.packed_size() {
            Ok(size) if size + entry.dt_size.get() as usize <= report.max_dt_size => {
                size + entry.dt_size.get() as usize
            }
            _ => {
                error!("ERROR, due to resizing device tree");
                break;
            }
        };

        let mut candidate = merged.clone();
        let applied = overlay_apply(&mut candidate, overlay).and_then(|_| {
            let size = candidate.packed_size()?;
            if size > needed {
                return Err(FdtError::NoSpace { needed: size, available: needed });
            }
            Ok(())
        });
        if let Err(e) = applied {
            error!("ERROR, due applying overlay with idx {}: {}", idx, e);
            break;
        }
        merged = candidate;
        report.applied += 1;
    }

    if report.applied > 0 {
        match merged.to_bytes() {
            Ok(blob) => {
                report.dt_size = blob.len();
                mem.write(load_addr, &blob);
            }
            Err(e) => {
                error!("ERROR, can't write back the merged device tree: {}", e);
                report.applied = 0;
            }
        }
    }
    report
}

/// Overlays every boot of this board needs, ahead of the user list
pub fn mandatory_overlays(board: &BoardConfig) -> Vec<u32> {
    let mut indices = Vec::new();
    let plat_id = board.plat_id();
    let dram_overlays = board.soc == Soc::R8a7795
        && match board.dram_mode {
            DramMode::Auto => board.dram_arg1 == BOARDCNF_8GBIT_2RANK,
            DramMode::Map4_2 => true,
            DramMode::Default => false,
        };
    if dram_overlays {
        let (v3, v2) = board.h3_plat_ids();
        if plat_id == v3 {
            indices.extend([V3_PLATID_DTBO_NUM, V3_INFO_DTBO_NUM]);
        } else if plat_id == v2 {
            indices.extend([V2_PLATID_DTBO_NUM, V2_INFO_DTBO_NUM]);
        }
    }
    if board.adsp {
        indices.push(ADSP_DTBO_NUM);
    }
    if board.product_partition {
        indices.push(PARTITIONS_DTBO_NUM);
    }
    indices.push(LVDS_PANEL_DTBO_NUM);
    indices
}

/// Stage the base DTB for this platform at `load_addr` and merge the
/// overlays on top of it. Only a missing or broken base table is an
/// error; overlay problems are logged and the boot goes on.
pub fn load_dt_with_overlays(
    mem: &mut SysMem,
    load_addr: u64,
    dt_tbl: &[u8],
    dto_tbl: Option<&[u8]>,
    board: &BoardConfig,
    env: &mut Environment,
) -> Result<OverlayReport, DeviceTreeError> {
    let plat_id = board.plat_id();
    let dt = DtTable::new(dt_tbl)?;
    let Some((base_idx, base)) = dt.find(plat_id, 0) else {
        error!("ERROR: No proper FDT entry found for current platform id={:x}", plat_id);
        return Err(DeviceTreeError::NoPlatformEntry(plat_id));
    };

    add_dtbo_index(env, &mandatory_overlays(board));

    let base_blob = dt.load_dt(base_idx)?;
    mem.write(load_addr, base_blob);

    let Some(dto_tbl) = dto_tbl else {
        info!("DTO table is NULL, load without DT overlays");
        return Ok(OverlayReport { applied: 0, max_dt_size: 0, dt_size: base_blob.len() });
    };
    let report = match DtTable::new(dto_tbl) {
        Ok(dto) => {
            let bootargs = env.get("bootargs").unwrap_or("").to_string();
            apply_all_overlays(mem, load_addr, base, &dto, plat_id, &bootargs)
        }
        Err(e) => {
            warn!("DTO table unusable ({}), load without DT overlays", e);
            OverlayReport { applied: 0, max_dt_size: 0, dt_size: base_blob.len() }
        }
    };
    info!("Applied {} overlay(s)", report.applied);
    Ok(report)
}

/// Put a fresh `/chosen/kaslr-seed` into the staged tree. Failures only warn.
pub fn fdt_fixup_kaslr(mem: &mut SysMem, dtb_addr: u64, dt_size: usize) {
    let blob = mem.read(dtb_addr, dt_size);
    let mut fdt = match Fdt::from_bytes(&blob) {
        Ok(fdt) => fdt,
        Err(e) => {
            warn!("kaslr-seed: can't parse staged device tree: {}", e);
            return;
        }
    };
    let mut seed = [0u8; 8];
    rand::rng().fill(&mut seed[..]);
    fdt.find_or_add_node("/chosen").set_property("kaslr-seed", seed.to_vec());
    match fdt.to_bytes() {
        Ok(blob) => mem.write(dtb_addr, &blob),
        Err(e) => warn!("kaslr-seed: can't write staged device tree: {}", e),
    }
}

/// Staged device tree at `addr`, if there is a valid one
pub fn staged_fdt(mem: &SysMem, addr: u64) -> Option<Fdt> {
    let header = mem.read(addr, crate::fdt::FDT_HEADER_SIZE);
    let size = crate::fdt::totalsize(&header)?;
    Fdt::from_bytes(&mem.read(addr, size)).ok()
}
