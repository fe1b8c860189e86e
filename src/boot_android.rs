//! Stage a verified boot / vendor_boot / dtbo triple into memory for the
//! kernel: unpack the kernel, concatenate the ramdisks, compose the DTB and
//! finish the kernel command line.

use std::fmt;
use std::io::Read;

use flate2::read::GzDecoder;
use log::{info, warn};
use zerocopy::FromBytes;

use crate::bcb::resolve_bootreason;
use crate::bootargs::{
    set_blkdevparts_args, set_board_id_args, set_bootreason_args, set_cpu_revision_args, set_fakertc_args,
};
use crate::bootimg::{android_image_check_header, vendor_image_check_header, ImageError, LegacyImageHeader};
use crate::config::BoardConfig;
use crate::constants::*;
use crate::device_tree::{fdt_fixup_kaslr, load_dt_with_overlays, staged_fdt};
use crate::env::Environment;
use crate::math_support::{align_up, div_round_up};
use crate::ops::AvbOps;
use crate::sysmem::SysMem;

/// Images the A/B flow handed over
#[derive(Debug, Clone, Copy)]
pub struct BootImages<'a> {
    pub boot: &'a [u8],
    pub vendor_boot: &'a [u8],
    pub dtbo: Option<&'a [u8]>,
}

/// Where everything ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBoot {
    pub kernel_addr: u64,
    pub kernel_size: u64,
    /// Vendor ramdisk followed by the generic ramdisk
    pub ramdisk_addr: u64,
    pub ramdisk_size: u64,
    pub dtb_addr: u64,
    pub dtb_size: u64,
    pub overlays_applied: usize,
}

/// Arguments of the booti handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootiArgs {
    pub kernel: String,
    pub ramdisk: String,
    pub fdt: String,
}

impl StagedBoot {
    pub fn booti_args(&self) -> BootiArgs {
        BootiArgs {
            kernel: format!("{:08x}", self.kernel_addr),
            ramdisk: format!("{:08x}", self.ramdisk_addr),
            fdt: format!("{:016x}", self.dtb_addr),
        }
    }
}

impl fmt::Display for BootiArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "booti {} {} {}", self.kernel, self.ramdisk, self.fdt)
    }
}

fn region<'a>(data: &'a [u8], offset: u64, len: u64, what: &'static str) -> Result<&'a [u8], ImageError> {
    let start = usize::try_from(offset).map_err(|_| ImageError::Truncated(what))?;
    let end = start.checked_add(len as usize).ok_or(ImageError::Truncated(what))?;
    data.get(start..end).ok_or(ImageError::Truncated(what))
}

/// `len` bytes at `offset`, cut short at the end of the image. Used for
/// page-aligned copies whose tail padding may be missing.
fn padded_region(data: &[u8], offset: u64, len: u64) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(len as usize).min(data.len());
    &data[start..end]
}

/// Kernel payload, skipping a legacy uImage header when there is one
fn kernel_payload(kernel: &[u8]) -> &[u8] {
    if let Ok((ih, rest)) = LegacyImageHeader::read_from_prefix(kernel) {
        if ih.ih_magic.get() == IH_MAGIC {
            let size = (ih.ih_size.get() as usize).min(rest.len());
            return &rest[..size];
        }
    }
    kernel
}

fn le16_magic(data: &[u8]) -> Option<u16> {
    data.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_bounded<R: Read>(reader: R, space: u64) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(space + 1).read_to_end(&mut out)?;
    Ok(out)
}

/// Unpack (gzip, LZ4 frame) the kernel, or copy `plain` when it is not
/// compressed.
fn unpack_kernel(payload: &[u8], plain: &[u8], space: u64) -> Result<Vec<u8>, ImageError> {
    match le16_magic(payload) {
        Some(GZIP_MAGIC) => {
            let out = read_bounded(GzDecoder::new(payload), space).map_err(|e| ImageError::Gunzip(e.to_string()))?;
            if out.len() as u64 > space {
                return Err(ImageError::KernelTooLarge(space));
            }
            info!("Unzipped kernel image size: {}", out.len());
            Ok(out)
        }
        Some(LZ4_MAGIC) => {
            let out = read_bounded(lz4_flex::frame::FrameDecoder::new(payload), space)
                .map_err(|e| ImageError::Lz4(e.to_string()))?;
            if out.len() as u64 > space {
                return Err(ImageError::KernelTooLarge(space));
            }
            info!("LZ4 decompressed kernel image size: {}", out.len());
            Ok(out)
        }
        _ => {
            let out = plain.to_vec();
            if out.len() as u64 > space {
                warn!("kernel image ({:#x} bytes) is larger than the space below ramdisk ({:#x})", out.len(), space);
            }
            Ok(out)
        }
    }
}

/// Append the boot and vendor command lines to `bootargs`
fn append_image_cmdlines(env: &mut Environment, gki: &str, vendor: &str) {
    if gki.is_empty() {
        info!("GKI command line is empty");
    } else {
        info!("GKI command line: {}", gki);
    }
    if vendor.is_empty() {
        info!("Vendor command line is empty");
    } else {
        info!("Vendor command line: {}", vendor);
    }
    let parts: Vec<&str> = [env.get("bootargs").unwrap_or(""), gki, vendor]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let bootargs = parts.join(" ");
    env.set("bootargs", &bootargs);
}

/// Validate both headers, then stage kernel, ramdisks and DTB at the
/// addresses of the vendor header. Header problems fail before anything
/// is written to memory.
pub fn do_boot_android_img_from_ram(
    ops: &mut dyn AvbOps,
    mem: &mut SysMem,
    env: &mut Environment,
    board: &BoardConfig,
    images: &BootImages,
) -> Result<StagedBoot, ImageError> {
    let hdr = android_image_check_header(images.boot).map_err(|e| {
        warn!("Error: {}", e);
        e
    })?;
    let vhdr = vendor_image_check_header(images.vendor_boot).map_err(|e| {
        warn!("Error: {}", e);
        e
    })?;

    set_board_id_args(env, board.plat_id());
    set_cpu_revision_args(env, board);
    set_blkdevparts_args(env, board);
    set_fakertc_args(env);

    if hdr.kernel_size.get() == 0
        || hdr.ramdisk_size.get() == 0
        || vhdr.vendor_ramdisk_size.get() == 0
        || vhdr.dtb_size.get() == 0
    {
        warn!("Error: {}", ImageError::MissingComponent);
        return Err(ImageError::MissingComponent);
    }

    let kernel_addr = vhdr.kernel_addr.get() as u64;
    let ramdisk_addr = vhdr.ramdisk_addr.get() as u64;
    let dtb_addr = vhdr.dtb_addr.get();
    let page_size = vhdr.page_size.get() as u64;

    let product = vhdr.name_str();
    if !product.is_empty() {
        info!("Product name: {}", product);
    }
    info!(
        "Kernel load addr {:#010x} size {} KiB",
        kernel_addr,
        div_round_up(hdr.kernel_size.get() as u64, 1024)
    );
    if vhdr.kernel_addr.get() == ANDROID_IMAGE_DEFAULT_KERNEL_ADDR {
        warn!("kernel address is the mkbootimg default, the kernel is still copied there");
    }
    append_image_cmdlines(env, &hdr.cmdline_str(), &vhdr.cmdline_str());

    // everything in the boot image is page aligned
    let kernel_size = align_up(hdr.kernel_size.get() as u64, BOOT_IMAGE_HEADER_V3_PAGESIZE);
    let kernel = region(images.boot, hdr.kernel_offset(), hdr.kernel_size.get() as u64, "kernel")?;
    let payload = kernel_payload(kernel);
    let plain = if payload.len() == kernel.len() {
        padded_region(images.boot, hdr.kernel_offset(), kernel_size)
    } else {
        payload
    };

    let kernel_space = if kernel_addr < ramdisk_addr {
        ramdisk_addr - kernel_addr
    } else if kernel_addr < board.text_base {
        board.text_base - kernel_addr
    } else {
        KERNEL_UNPACKED_LIMIT
    };

    let vendor_ramdisk_offset = vhdr.vendor_ramdisk_offset();
    let vendor_ramdisk_raw = vhdr.vendor_ramdisk_size.get() as u64;
    let vendor_ramdisk_size = align_up(vendor_ramdisk_raw, page_size);
    region(images.vendor_boot, vendor_ramdisk_offset, vendor_ramdisk_raw, "vendor ramdisk")?;
    let ramdisk_raw = hdr.ramdisk_size.get() as u64;
    let ramdisk_size = align_up(ramdisk_raw, BOOT_IMAGE_HEADER_V3_PAGESIZE);
    region(images.boot, hdr.ramdisk_offset(), ramdisk_raw, "ramdisk")?;
    let dt_tbl = region(images.vendor_boot, vhdr.dtb_offset(), vhdr.dtb_size.get() as u64, "dtb")?;

    let unpacked = unpack_kernel(payload, plain, kernel_space)?;
    mem.write(kernel_addr, &unpacked);
    info!(
        "kernel offset = {:x}, size = {:#x}, address {:#x}",
        hdr.kernel_offset(),
        unpacked.len(),
        kernel_addr
    );

    // vendor ramdisk first, the generic one right after it so the kernel
    // unpacks the generic tree on top of the vendor tree
    info!(
        "vendor ramdisk offset = {:x}, size = {:#x}, address = {:#x}",
        vendor_ramdisk_offset, vendor_ramdisk_size, ramdisk_addr
    );
    mem.write(ramdisk_addr, padded_region(images.vendor_boot, vendor_ramdisk_offset, vendor_ramdisk_size));
    info!(
        "android ramdisk offset = {:x}, size = {:#x}, address = {:#x}",
        hdr.ramdisk_offset(),
        ramdisk_size,
        ramdisk_addr + vendor_ramdisk_raw
    );
    mem.write(ramdisk_addr + vendor_ramdisk_raw, padded_region(images.boot, hdr.ramdisk_offset(), ramdisk_size));

    let result = load_dt_with_overlays(mem, dtb_addr, dt_tbl, images.dtbo, board, env);
    let dt_size = match &result {
        Ok(report) => report.dt_size,
        Err(_) => crate::fdt::totalsize(&mem.read(dtb_addr, crate::fdt::FDT_HEADER_SIZE)).unwrap_or(0),
    };
    if dt_size > 0 {
        fdt_fixup_kaslr(mem, dtb_addr, dt_size);
    }
    let report = result?;

    let fdt = staged_fdt(mem, dtb_addr);
    let reason = resolve_bootreason(ops, mem, fdt.as_ref());
    set_bootreason_args(env, &reason);

    let concatenated = ramdisk_raw + vendor_ramdisk_raw;
    info!(
        "Concatenated RAM disk load addr {:#010x} size {} KiB",
        ramdisk_addr,
        div_round_up(concatenated, 1024)
    );

    Ok(StagedBoot {
        kernel_addr,
        kernel_size: unpacked.len() as u64,
        ramdisk_addr,
        ramdisk_size: concatenated,
        dtb_addr,
        dtb_size: staged_fdt(mem, dtb_addr)
            .and_then(|f| f.packed_size().ok())
            .unwrap_or(report.dt_size) as u64,
        overlays_applied: report.applied,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::bootimg::{build_boot_image, build_vendor_boot_image, VendorBootImgHdrV3};
    use crate::dt_table::build_dt_table;
    use crate::fdt::{str_value, Fdt, Node};
    use crate::ops::test::FakeAvbOps;
    use zerocopy::IntoBytes;

    const KERNEL_ADDR: u32 = 0x4808_0000;
    const RAMDISK_ADDR: u32 = 0x4a18_0000;
    const DTB_ADDR: u64 = 0x4800_0000;

    fn dtb_table() -> Vec<u8> {
        let base = Fdt::new(Node::new("").with_prop("model", str_value("Renesas H3ULCB"))).to_bytes().unwrap();
        build_dt_table(&[(RCAR_GENERIC_PLAT_ID, base)], 2048)
    }

    fn vendor_image(vendor_ramdisk: &[u8]) -> Vec<u8> {
        let hdr = VendorBootImgHdrV3::new(2048, KERNEL_ADDR, RAMDISK_ADDR, DTB_ADDR, "r8a7795", "androidboot.hardware=salvator");
        build_vendor_boot_image(hdr, vendor_ramdisk, &dtb_table())
    }

    fn stage(boot: &[u8], vendor: &[u8], env: &mut Environment) -> (SysMem, Result<StagedBoot, ImageError>) {
        let mut ops = FakeAvbOps::new();
        let mut mem = SysMem::new();
        let images = BootImages { boot, vendor_boot: vendor, dtbo: None };
        let result = do_boot_android_img_from_ram(&mut ops, &mut mem, env, &BoardConfig::default(), &images);
        (mem, result)
    }

    #[test]
    fn corrupted_magic_stages_nothing() {
        let mut boot = build_boot_image(&[0xaa; 100], &[0xbb; 100], "");
        boot[3] ^= 0xff;
        let mut env = Environment::new();
        let (mem, result) = stage(&boot, &vendor_image(&[0xcc; 10]), &mut env);
        assert_eq!(result.unwrap_err(), ImageError::BadBootMagic);
        assert_eq!(mem.bytes_written(), 0);
        assert_eq!(env.get("bootargs"), None);

        let boot = build_boot_image(&[0xaa; 100], &[0xbb; 100], "");
        let mut vendor = vendor_image(&[0xcc; 10]);
        vendor[0] = 0;
        let (mem, result) = stage(&boot, &vendor, &mut env);
        assert_eq!(result.unwrap_err(), ImageError::BadVendorMagic);
        assert_eq!(mem.bytes_written(), 0);
    }

    #[test]
    fn missing_ramdisk_is_rejected() {
        let boot = build_boot_image(&[0xaa; 100], &[], "");
        let mut env = Environment::new();
        let (mem, result) = stage(&boot, &vendor_image(&[0xcc; 10]), &mut env);
        assert_eq!(result.unwrap_err(), ImageError::MissingComponent);
        assert_eq!(mem.bytes_written(), 0);
    }

    #[test]
    fn stages_plain_kernel_and_concatenated_ramdisk() {
        let boot = build_boot_image(&[0xaa; 5000], &[0xbb; 300], "console=ttySC0");
        let mut env: Environment = [("bootargs", "quiet")].into_iter().collect();
        let (mem, result) = stage(&boot, &vendor_image(&[0xcc; 10]), &mut env);
        let staged = result.unwrap();

        assert_eq!(staged.kernel_addr, KERNEL_ADDR as u64);
        assert_eq!(staged.kernel_size, 8192);
        assert_eq!(mem.read(KERNEL_ADDR as u64, 5000), vec![0xaa; 5000]);
        assert_eq!(staged.ramdisk_size, 310);
        assert_eq!(mem.read(RAMDISK_ADDR as u64, 10), vec![0xcc; 10]);
        assert_eq!(mem.read(RAMDISK_ADDR as u64 + 10, 300), vec![0xbb; 300]);
        assert_eq!(staged_fdt(&mem, DTB_ADDR).unwrap().model(), Some("Renesas H3ULCB"));
        assert!(staged_fdt(&mem, DTB_ADDR).unwrap().getprop("/chosen", "kaslr-seed").is_some());

        let bootargs = env.get("bootargs").unwrap();
        assert!(bootargs.starts_with("androidboot.bootreason=unknown init_time=1563524000 "));
        assert!(bootargs.contains("androidboot.board_id=0xb779530 quiet console=ttySC0 androidboot.hardware=salvator"));
        assert!(bootargs.ends_with("androidboot.dtbo_idx=5,6"));
        assert_eq!(staged.booti_args().to_string(), "booti 48080000 4a180000 0000000048000000");
    }

    #[test]
    fn gzip_kernel_is_unpacked() {
        let kernel = vec![0x5a; 20000];
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&kernel).unwrap();
        let boot = build_boot_image(&gz.finish().unwrap(), &[0xbb; 16], "");
        let mut env = Environment::new();
        let (mem, result) = stage(&boot, &vendor_image(&[0xcc; 16]), &mut env);
        assert_eq!(result.unwrap().kernel_size, 20000);
        assert_eq!(mem.read(KERNEL_ADDR as u64, 20000), kernel);
    }

    #[test]
    fn lz4_kernel_is_unpacked() {
        let kernel: Vec<u8> = (0..30000u32).map(|i| (i % 251) as u8).collect();
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(&kernel).unwrap();
        let boot = build_boot_image(&enc.finish().unwrap(), &[0xbb; 16], "");
        let mut env = Environment::new();
        let (mem, result) = stage(&boot, &vendor_image(&[0xcc; 16]), &mut env);
        assert_eq!(result.unwrap().kernel_size, 30000);
        assert_eq!(mem.read(KERNEL_ADDR as u64, 30000), kernel);
    }

    #[test]
    fn legacy_uimage_payload() {
        let mut ih = LegacyImageHeader::read_from_bytes(&[0u8; IH_HEADER_SIZE][..]).unwrap();
        ih.ih_magic = IH_MAGIC.into();
        ih.ih_size = 100u32.into();
        let mut kernel = ih.as_bytes().to_vec();
        kernel.extend_from_slice(&[0x77; 100]);
        assert_eq!(kernel_payload(&kernel), &[0x77; 100][..]);
        assert_eq!(kernel_payload(&[1, 2, 3]), &[1, 2, 3][..]);
    }

    #[test]
    fn oversized_gzip_kernel_fails() {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&[0u8; 4096]).unwrap();
        let payload = gz.finish().unwrap();
        assert_eq!(unpack_kernel(&payload, &payload, 1000).unwrap_err(), ImageError::KernelTooLarge(1000));
    }
}
