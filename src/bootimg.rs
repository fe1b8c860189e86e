//! Android boot image v3 and vendor boot image v3 headers.

use std::fmt;

use thiserror::Error;
use zerocopy::byteorder::{big_endian, little_endian};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::*;
use crate::device_tree::DeviceTreeError;
use crate::math_support::align_up;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("android boot header magic is invalid")]
    BadBootMagic,
    #[error("android boot header version is invalid ({0})")]
    BadBootVersion(u32),
    #[error("vendor boot header magic is invalid")]
    BadVendorMagic,
    #[error("vendor boot header version is invalid ({0})")]
    BadVendorVersion(u32),
    #[error("kernel, ramdisk, vendor ramdisk or DTB are absent, check images")]
    MissingComponent,
    #[error("{0} region is outside the image")]
    Truncated(&'static str),
    #[error("Kernel unzip error: {0}")]
    Gunzip(String),
    #[error("Kernel LZ4 decompression error: {0}")]
    Lz4(String),
    #[error("unpacked kernel does not fit in {0:#x} bytes")]
    KernelTooLarge(u64),
    #[error(transparent)]
    DeviceTree(#[from] DeviceTreeError),
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BootImgHdrV3 {
    pub magic: [u8; 8],
    pub kernel_size: little_endian::U32,
    pub ramdisk_size: little_endian::U32,
    /// (A << 25) | (B << 18) | (C << 11) | (Y << 4) | M
    pub os_version: little_endian::U32,
    pub header_size: little_endian::U32,
    pub reserved: [little_endian::U32; 4],
    pub header_version: little_endian::U32,
    pub cmdline: [u8; BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE],
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct VendorBootImgHdrV3 {
    pub magic: [u8; 8],
    pub header_version: little_endian::U32,
    pub page_size: little_endian::U32,
    pub kernel_addr: little_endian::U32,
    pub ramdisk_addr: little_endian::U32,
    pub vendor_ramdisk_size: little_endian::U32,
    pub cmdline: [u8; VENDOR_BOOT_ARGS_SIZE],
    pub tags_addr: little_endian::U32,
    pub name: [u8; VENDOR_BOOT_NAME_SIZE],
    pub header_size: little_endian::U32,
    pub dtb_size: little_endian::U32,
    pub dtb_addr: little_endian::U64,
}

pub const BOOT_IMG_HDR_V3_SIZE: usize = std::mem::size_of::<BootImgHdrV3>();
pub const VENDOR_BOOT_IMG_HDR_V3_SIZE: usize = std::mem::size_of::<VendorBootImgHdrV3>();

/// Legacy U-Boot image header, only the fields needed to find the payload
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LegacyImageHeader {
    pub ih_magic: big_endian::U32,
    pub ih_hcrc: big_endian::U32,
    pub ih_time: big_endian::U32,
    pub ih_size: big_endian::U32,
    pub ih_load: big_endian::U32,
    pub ih_ep: big_endian::U32,
    pub ih_dcrc: big_endian::U32,
    pub ih_os: u8,
    pub ih_arch: u8,
    pub ih_type: u8,
    pub ih_comp: u8,
    pub ih_name: [u8; 32],
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn copy_c_str(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

/// Magic and version check of a boot image header
pub fn android_image_check_header(data: &[u8]) -> Result<&BootImgHdrV3, ImageError> {
    let (hdr, _) = BootImgHdrV3::ref_from_prefix(data).map_err(|_| ImageError::BadBootMagic)?;
    if &hdr.magic != BOOT_MAGIC {
        return Err(ImageError::BadBootMagic);
    }
    if hdr.header_version.get() != 3 {
        return Err(ImageError::BadBootVersion(hdr.header_version.get()));
    }
    Ok(hdr)
}

/// Magic and version check of a vendor boot image header
pub fn vendor_image_check_header(data: &[u8]) -> Result<&VendorBootImgHdrV3, ImageError> {
    let (hdr, _) = VendorBootImgHdrV3::ref_from_prefix(data).map_err(|_| ImageError::BadVendorMagic)?;
    if &hdr.magic != VENDOR_BOOT_MAGIC {
        return Err(ImageError::BadVendorMagic);
    }
    if hdr.header_version.get() != 3 {
        return Err(ImageError::BadVendorVersion(hdr.header_version.get()));
    }
    Ok(hdr)
}

impl BootImgHdrV3 {
    pub fn new(kernel_size: u32, ramdisk_size: u32, os_version: u32, cmdline: &str) -> Self {
        let mut hdr = BootImgHdrV3::new_zeroed();
        hdr.magic = *BOOT_MAGIC;
        hdr.kernel_size = kernel_size.into();
        hdr.ramdisk_size = ramdisk_size.into();
        hdr.os_version = os_version.into();
        hdr.header_size = (BOOT_IMG_HDR_V3_SIZE as u32).into();
        hdr.header_version = 3u32.into();
        copy_c_str(&mut hdr.cmdline, cmdline);
        hdr
    }

    pub fn cmdline_str(&self) -> String {
        c_str(&self.cmdline)
    }

    /// Offset of the kernel inside the image
    pub fn kernel_offset(&self) -> u64 {
        BOOT_IMAGE_HEADER_V3_PAGESIZE
    }

    /// Offset of the generic ramdisk inside the image
    pub fn ramdisk_offset(&self) -> u64 {
        self.kernel_offset() + align_up(self.kernel_size.get() as u64, BOOT_IMAGE_HEADER_V3_PAGESIZE)
    }

    /// Size of the whole image, like android_image_get_end()
    pub fn image_size(&self) -> u64 {
        self.ramdisk_offset() + align_up(self.ramdisk_size.get() as u64, BOOT_IMAGE_HEADER_V3_PAGESIZE)
    }

    /// ((A, B, C), (year, month))
    pub fn os_version_parts(&self) -> ((u32, u32, u32), (u32, u32)) {
        let os_ver = self.os_version.get() >> 11;
        let os_lvl = self.os_version.get() & ((1 << 11) - 1);
        (
            ((os_ver >> 14) & 0x7f, (os_ver >> 7) & 0x7f, os_ver & 0x7f),
            ((os_lvl >> 4) + 2000, os_lvl & 0x0f),
        )
    }
}

impl fmt::Display for BootImgHdrV3 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ((a, b, c), (year, month)) = self.os_version_parts();
        writeln!(f, "Android image properties:")?;
        writeln!(f, "   kernel size:          {:x}", self.kernel_size.get())?;
        writeln!(f, "   ramdisk size:         {:x}", self.ramdisk_size.get())?;
        writeln!(
            f,
            "   os_version:           {:x} (ver: {}.{}.{}, level: {}.{})",
            self.os_version.get(),
            a,
            b,
            c,
            year,
            month
        )?;
        writeln!(f, "   cmdline:              {}", self.cmdline_str())?;
        write!(f, "   header_version:       {}", self.header_version.get())
    }
}

impl VendorBootImgHdrV3 {
    pub fn new(page_size: u32, kernel_addr: u32, ramdisk_addr: u32, dtb_addr: u64, name: &str, cmdline: &str) -> Self {
        let mut hdr = VendorBootImgHdrV3::new_zeroed();
        hdr.magic = *VENDOR_BOOT_MAGIC;
        hdr.header_version = 3u32.into();
        hdr.page_size = page_size.into();
        hdr.kernel_addr = kernel_addr.into();
        hdr.ramdisk_addr = ramdisk_addr.into();
        hdr.dtb_addr = dtb_addr.into();
        hdr.header_size = (VENDOR_BOOT_IMG_HDR_V3_SIZE as u32).into();
        copy_c_str(&mut hdr.name, name);
        copy_c_str(&mut hdr.cmdline, cmdline);
        hdr
    }

    pub fn cmdline_str(&self) -> String {
        c_str(&self.cmdline)
    }

    pub fn name_str(&self) -> String {
        c_str(&self.name)
    }

    fn page(&self) -> u64 {
        self.page_size.get() as u64
    }

    pub fn vendor_ramdisk_offset(&self) -> u64 {
        align_up(VENDOR_BOOT_IMAGE_HEADER_V3_SIZE, self.page())
    }

    /// Offset of the DTB table that follows the vendor ramdisk
    pub fn dtb_offset(&self) -> u64 {
        self.vendor_ramdisk_offset() + align_up(self.vendor_ramdisk_size.get() as u64, self.page())
    }

    pub fn image_size(&self) -> u64 {
        self.dtb_offset() + align_up(self.dtb_size.get() as u64, self.page())
    }

    /// Point the image at the fixed RAM-boot load addresses
    pub fn correct_boot_address(&mut self) {
        self.kernel_addr = VIRT_SYS_LOAD_ADDR.into();
        self.ramdisk_addr = DEFAULT_RD_ADDR.into();
        self.dtb_addr = DEFAULT_SECOND_ADDR.into();
    }
}

impl fmt::Display for VendorBootImgHdrV3 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Vendor image properties:")?;
        writeln!(f, "   kernel address:       {:x}", self.kernel_addr.get())?;
        writeln!(f, "   ramdisk address:      {:x}", self.ramdisk_addr.get())?;
        writeln!(f, "   vendor_ramdisk_size:  {:x}", self.vendor_ramdisk_size.get())?;
        writeln!(f, "   tags address:         {:x}", self.tags_addr.get())?;
        writeln!(f, "   page size:            {:x}", self.page_size.get())?;
        writeln!(f, "   name:                 {}", self.name_str())?;
        writeln!(f, "   cmdline:              {}", self.cmdline_str())?;
        writeln!(f, "   header_version:       {}", self.header_version.get())?;
        writeln!(f, "   dtb size:             {:x}", self.dtb_size.get())?;
        write!(f, "   dtb addr:             {:x}", self.dtb_addr.get())
    }
}

fn pad_to(out: &mut Vec<u8>, align: u64) {
    let len = align_up(out.len() as u64, align) as usize;
    out.resize(len, 0);
}

/// Lay out a boot image: header page, kernel, ramdisk
pub fn build_boot_image(kernel: &[u8], ramdisk: &[u8], cmdline: &str) -> Vec<u8> {
    let hdr = BootImgHdrV3::new(kernel.len() as u32, ramdisk.len() as u32, 0, cmdline);
    let mut out = hdr.as_bytes().to_vec();
    pad_to(&mut out, BOOT_IMAGE_HEADER_V3_PAGESIZE);
    out.extend_from_slice(kernel);
    pad_to(&mut out, BOOT_IMAGE_HEADER_V3_PAGESIZE);
    out.extend_from_slice(ramdisk);
    pad_to(&mut out, BOOT_IMAGE_HEADER_V3_PAGESIZE);
    out
}

/// Lay out a vendor boot image: header, vendor ramdisk, DTB table
pub fn build_vendor_boot_image(mut hdr: VendorBootImgHdrV3, vendor_ramdisk: &[u8], dtb: &[u8]) -> Vec<u8> {
    let page = hdr.page_size.get() as u64;
    hdr.vendor_ramdisk_size = (vendor_ramdisk.len() as u32).into();
    hdr.dtb_size = (dtb.len() as u32).into();
    let mut out = hdr.as_bytes().to_vec();
    pad_to(&mut out, page);
    out.extend_from_slice(vendor_ramdisk);
    pad_to(&mut out, page);
    out.extend_from_slice(dtb);
    pad_to(&mut out, page);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(BOOT_IMG_HDR_V3_SIZE, 1580);
        assert_eq!(VENDOR_BOOT_IMG_HDR_V3_SIZE, VENDOR_BOOT_IMAGE_HEADER_V3_SIZE as usize);
        assert_eq!(std::mem::size_of::<LegacyImageHeader>(), IH_HEADER_SIZE);
    }

    #[test]
    fn header_checks() {
        let img = build_boot_image(&[1; 10], &[2; 10], "");
        assert!(android_image_check_header(&img).is_ok());
        let mut bad = img.clone();
        bad[0] = b'X';
        assert_eq!(android_image_check_header(&bad).unwrap_err(), ImageError::BadBootMagic);
        let mut bad = img;
        bad[40] = 2;
        assert_eq!(android_image_check_header(&bad).unwrap_err(), ImageError::BadBootVersion(2));
        assert_eq!(android_image_check_header(&[0u8; 16]).unwrap_err(), ImageError::BadBootMagic);

        let hdr = VendorBootImgHdrV3::new(2048, 0x4808_0000, 0x4a18_0000, 0x4800_0000, "h3ulcb", "");
        let vimg = build_vendor_boot_image(hdr, &[3; 5], &[4; 5]);
        assert!(vendor_image_check_header(&vimg).is_ok());
        assert_eq!(vendor_image_check_header(&img_with_magic(b"VNDRBOOX")).unwrap_err(), ImageError::BadVendorMagic);
    }

    fn img_with_magic(magic: &[u8; 8]) -> Vec<u8> {
        let mut v = vec![0u8; VENDOR_BOOT_IMG_HDR_V3_SIZE];
        v[..8].copy_from_slice(magic);
        v
    }

    #[test]
    fn region_offsets() {
        let img = build_boot_image(&[1; 5000], &[2; 10], "");
        let hdr = android_image_check_header(&img).unwrap();
        assert_eq!(hdr.ramdisk_offset(), 4096 + 8192);
        assert_eq!(hdr.image_size(), img.len() as u64);

        let hdr = VendorBootImgHdrV3::new(2048, 0, 0, 0, "", "");
        let vimg = build_vendor_boot_image(hdr, &[3; 2049], &[4; 5]);
        let vhdr = vendor_image_check_header(&vimg).unwrap();
        assert_eq!(vhdr.vendor_ramdisk_offset(), 4096);
        assert_eq!(vhdr.dtb_offset(), 4096 + 4096);
        assert_eq!(vimg[vhdr.dtb_offset() as usize], 4);
        assert_eq!(vhdr.image_size(), vimg.len() as u64);
    }

    #[test]
    fn os_version_and_dump() {
        // Android 11.0.0, 2021-05
        let os_version = (11 << 25) | (21 << 4) | 5;
        let hdr = BootImgHdrV3::new(0x10, 0x20, os_version, "console=ttySC0");
        assert_eq!(hdr.os_version_parts(), ((11, 0, 0), (2021, 5)));
        let dump = hdr.to_string();
        assert!(dump.contains("(ver: 11.0.0, level: 2021.5)"));
        assert!(dump.contains("cmdline:              console=ttySC0"));

        let mut vhdr = VendorBootImgHdrV3::new(4096, 1, 2, 3, "r8a7795", "");
        vhdr.correct_boot_address();
        assert_eq!(vhdr.kernel_addr.get(), VIRT_SYS_LOAD_ADDR);
        assert_eq!(vhdr.dtb_addr.get(), DEFAULT_SECOND_ADDR);
        assert!(vhdr.to_string().contains("name:                 r8a7795"));
    }
}
