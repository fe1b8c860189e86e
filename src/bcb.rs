//! Bootloader control block (`struct bootloader_message` at the start of
//! misc) and the boot reason records left by the previous kernel.

use std::fmt;

use log::{error, info, warn};
use zerocopy::byteorder::little_endian;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::*;
use crate::env::Environment;
use crate::error::{IoError, IoResult};
use crate::fdt::Fdt;
use crate::ops::AvbOps;
use crate::sysmem::SysMem;

#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BootloaderMessage {
    pub command: [u8; 32],
    pub status: [u8; 32],
    pub recovery: [u8; 768],
    pub stage: [u8; 32],
    pub reserved: [u8; 1184],
}

pub const BOOTLOADER_MESSAGE_SIZE: usize = std::mem::size_of::<BootloaderMessage>();

fn c_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

impl BootloaderMessage {
    pub fn command_str(&self) -> &str {
        c_str(&self.command)
    }
}

/// Boot reason record: a NUL-terminated reason and a CRC32 over all 128
/// reason bytes
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BootreasonMessage {
    pub reason: [u8; BOOTREASON_MAX_LEN],
    pub crc: little_endian::U32,
}

pub const BOOTREASON_MESSAGE_SIZE: usize = std::mem::size_of::<BootreasonMessage>();

impl BootreasonMessage {
    pub fn new(reason: &str) -> Self {
        let mut msg = BootreasonMessage::new_zeroed();
        let n = reason.len().min(BOOTREASON_MAX_LEN - 1);
        msg.reason[..n].copy_from_slice(&reason.as_bytes()[..n]);
        msg.crc = crc32fast::hash(&msg.reason).into();
        msg
    }

    /// The reason, if the record is intact and of a sane length
    pub fn valid_reason(&self) -> Option<String> {
        if crc32fast::hash(&self.reason) != self.crc.get() {
            return None;
        }
        let len = self.reason.iter().position(|&b| b == 0)?;
        if len <= BOOTREASON_MIN_LEN || len >= BOOTREASON_MAX_LEN {
            return None;
        }
        std::str::from_utf8(&self.reason[..len]).ok().map(str::to_string)
    }
}

pub fn get_bootloader_message(ops: &mut dyn AvbOps) -> IoResult<BootloaderMessage> {
    let mut raw = vec![0u8; BOOTLOADER_MESSAGE_SIZE];
    let n = ops.read_from_partition(MISC_PARTITION_NAME, 0, &mut raw)?;
    if n != BOOTLOADER_MESSAGE_SIZE {
        return Err(IoError::Io);
    }
    BootloaderMessage::read_from_bytes(&raw[..]).map_err(|_| IoError::Io)
}

pub fn set_bootloader_message(ops: &mut dyn AvbOps, bcb: &BootloaderMessage) -> IoResult<()> {
    ops.write_to_partition(MISC_PARTITION_NAME, 0, bcb.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Android,
    Fastboot,
    Recovery,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match self {
            BootMode::Android => "android",
            BootMode::Fastboot => "fastboot",
            BootMode::Recovery => "recovery",
        })
    }
}

/// Pick the boot mode from the BCB command and store it in env `bootmode`
pub fn load_android_bootloader_params(ops: &mut dyn AvbOps, env: &mut Environment) -> Option<BootMode> {
    let mut bcb = match get_bootloader_message(ops) {
        Ok(bcb) => bcb,
        Err(_) => {
            error!("Failed to read Android bootloader record.");
            return None;
        }
    };
    let command = bcb.command_str().to_string();
    let mode = if command.contains("bootloader") {
        if bcb.status[0] != 0 && bcb.status[0] != 255 {
            let status = c_str(&bcb.status);
            info!("Boot status: {}", status);
            if !status.starts_with("OKAY") {
                warn!("ERROR! Last operation has failed!");
            }
        }
        // only the recovery part of the message is cleared
        bcb.command.fill(0);
        bcb.status.fill(0);
        bcb.recovery.fill(0);
        if set_bootloader_message(ops, &bcb).is_err() {
            error!("Error writing bcb!");
        }
        BootMode::Fastboot
    } else {
        // command is "reason[,subreason[,details]]"
        let reason = command.split(',').next().unwrap_or("");
        if reason.contains("recovery") {
            BootMode::Recovery
        } else {
            BootMode::Android
        }
    };
    info!("Setting bootmode '{}'", mode);
    env.set("bootmode", &mode.to_string());
    Some(mode)
}

/// Address of the RAM boot reason buffer, from the `reg` property of
/// /reserved-memory/rambootreason
pub fn rambootreason_addr(fdt: &Fdt) -> Option<u64> {
    let node = fdt.node(RAMBOOTREASON_NODE)?;
    let parent = RAMBOOTREASON_NODE.rsplit_once('/').map(|(p, _)| p).unwrap_or("/");
    let cells = fdt
        .getprop(parent, "#address-cells")
        .and_then(|p| p.as_u32())
        .unwrap_or(2) as usize;
    let reg = node.property("reg")?.as_u32_list();
    if cells == 0 || cells > 2 || reg.len() < cells {
        return None;
    }
    Some(reg[..cells].iter().fold(0u64, |acc, c| (acc << 32) | *c as u64))
}

/// Consume the boot reason written to RAM by the previous kernel. The
/// buffer is cleared whether or not it was valid.
pub fn take_bootreason_from_ram(mem: &mut SysMem, addr: u64) -> Option<String> {
    let raw = mem.read(addr, BOOTREASON_MESSAGE_SIZE);
    mem.fill(addr, BOOTREASON_MESSAGE_SIZE, 0);
    BootreasonMessage::read_from_bytes(&raw[..]).ok()?.valid_reason()
}

/// Consume the boot reason stored in the reserved area of the BCB
pub fn take_bootreason_from_bcb(ops: &mut dyn AvbOps) -> Option<String> {
    let mut bcb = get_bootloader_message(ops).ok()?;
    let (msg, _) = BootreasonMessage::read_from_prefix(&bcb.reserved[..]).ok()?;
    let reason = msg.valid_reason()?;
    bcb.reserved.fill(0);
    if set_bootloader_message(ops, &bcb).is_err() {
        warn!("Failed to clear boot reason in bcb");
    }
    Some(reason)
}

/// RAM first, then BCB, then "unknown"
pub fn resolve_bootreason(ops: &mut dyn AvbOps, mem: &mut SysMem, fdt: Option<&Fdt>) -> String {
    if let Some(addr) = fdt.and_then(rambootreason_addr) {
        if let Some(reason) = take_bootreason_from_ram(mem, addr) {
            return reason;
        }
    }
    take_bootreason_from_bcb(ops).unwrap_or_else(|| "unknown".to_string())
}
