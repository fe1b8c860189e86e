/// A/B metadata lives right after `struct bootloader_message` in misc
pub const MISC_PARTITION_NAME: &str = "misc";
pub const AB_METADATA_MISC_PARTITION_OFFSET: i64 = 2048;
pub const AB_MAGIC: &[u8; 4] = b"\0AB0";
pub const AB_MAJOR_VERSION: u8 = 1;
pub const AB_MINOR_VERSION: u8 = 0;
pub const AB_MAX_PRIORITY: u8 = 15;
pub const AB_MAX_TRIES_REMAINING: u8 = 7;
pub const AB_SLOT_SUFFIXES: [&str; 2] = ["_a", "_b"];

/// Virtual A/B message, see bootable/recovery/bootloader_message
pub const SYSTEM_SPACE_OFFSET_IN_MISC: i64 = 32 * 1024;
pub const MISC_VIRTUAL_AB_MAGIC_HEADER: u32 = 0x5674_0AB0;
pub const MAX_VIRTUAL_AB_MESSAGE_VERSION: u8 = 2;

pub const AVB_MAX_NUMBER_OF_ROLLBACK_INDEX_LOCATIONS: usize = 32;

pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
pub const VENDOR_BOOT_MAGIC: &[u8; 8] = b"VNDRBOOT";
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;
pub const VENDOR_BOOT_ARGS_SIZE: usize = 2048;
pub const VENDOR_BOOT_NAME_SIZE: usize = 16;
pub const BOOT_IMAGE_HEADER_V3_PAGESIZE: u64 = 4096;
pub const VENDOR_BOOT_IMAGE_HEADER_V3_SIZE: u64 = 2112;
pub const ANDROID_IMAGE_DEFAULT_KERNEL_ADDR: u32 = 0x1000_8000;

/// Legacy U-Boot image header magic and size
pub const IH_MAGIC: u32 = 0x2705_1956;
pub const IH_HEADER_SIZE: usize = 64;

pub const GZIP_MAGIC: u16 = 0x8B1F;
pub const LZ4_MAGIC: u16 = 0x2204;

/// Unpacked kernel must fit below ramdisk_addr
pub const KERNEL_UNPACKED_LIMIT: u64 = 0x108_0000;

/// Load addresses used when the image was staged by `fastboot boot`
pub const VIRT_BOOT_DEVICE: i32 = -1;
pub const VIRT_BOOT_PARTITION: &str = "RAM";
pub const VIRT_SYS_LOAD_ADDR: u32 = 0x4808_0000;
pub const DEFAULT_RD_ADDR: u32 = 0x4a18_0000;
pub const DEFAULT_SECOND_ADDR: u64 = 0x4800_0800;
pub const FASTBOOT_FLASH_MMC_DEV: i32 = 1;

pub const DEFAULT_AVB_DELAY: i64 = 5;
pub const RTC_TIME_SEC: u64 = 1_563_524_000;
pub const DEFAULT_TEXT_BASE: u64 = 0x5000_0000;

pub const DT_TABLE_MAGIC: u32 = 0xd7b7_ab1e;
pub const FDT_MAGIC: u32 = 0xd00d_feed;

/// Device tree id: <board id><SiP><revision>
pub const RCAR_GENERIC_PLAT_ID: u32 = 0x0077_9000;

pub const V3_PLATID_DTBO_NUM: u32 = 0;
pub const V2_PLATID_DTBO_NUM: u32 = 1;
pub const V3_INFO_DTBO_NUM: u32 = 2;
pub const V2_INFO_DTBO_NUM: u32 = 3;
pub const ADSP_DTBO_NUM: u32 = 4;
pub const PARTITIONS_DTBO_NUM: u32 = 5;
pub const LVDS_PANEL_DTBO_NUM: u32 = 6;

pub const ULCB_H3V3_PLAT_ID: u32 = 0x0b77_9530;
pub const ULCB_H3V2_PLAT_ID: u32 = 0x0b77_9520;
pub const SALVATOR_X_H3V3_PLAT_ID: u32 = 0x0477_9530;
pub const SALVATOR_X_H3V2_PLAT_ID: u32 = 0x0477_9520;
/// BL2 passes this in arg1 for H3 ver.2.0+ SiP, 8Gbit 2 rank
pub const BOARDCNF_8GBIT_2RANK: u32 = 8;

pub const DTBO_IDX_PARAM: &str = "androidboot.dtbo_idx";
pub const KERNEL_CMDLINE_SIZE: usize = 2048;

pub const BOOTREASON_MIN_LEN: usize = 2;
pub const BOOTREASON_MAX_LEN: usize = 128;
pub const RAMBOOTREASON_NODE: &str = "/reserved-memory/rambootreason";

pub const REQUESTED_PARTITIONS: [&str; 3] = ["boot", "vendor_boot", "dtbo"];
