//! GPT partitioned MMC image: partition lookup and block I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use gpt::disk::LogicalBlockSize;
use gpt::GptConfig;
use log::{debug, error, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::error::IoError;
use crate::math_support::{check_any_overlaps, check_interval_state, Interval, IntervalState};

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("reading partition table failed: {0}")]
    Gpt(#[from] gpt::GptError),
    #[error("unsupported block size {0}")]
    BlockSize(u64),
    #[error("Can't read '{0}' part")]
    NoSuchPartition(String),
    #[error("range outside partition '{0}'")]
    RangeOutsidePartition(String),
}

impl From<DiskError> for IoError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::NoSuchPartition(_) => IoError::NoSuchPartition,
            DiskError::RangeOutsidePartition(_) => IoError::RangeOutsidePartition,
            _ => IoError::Io,
        }
    }
}

/// `disk_partition_t`: start and size in blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub start: u64,
    pub size: u64,
    pub blksz: u64,
    pub uuid: Uuid,
}

impl PartitionInfo {
    pub fn size_bytes(&self) -> u64 {
        self.size * self.blksz
    }

    fn byte_interval(&self) -> Option<Interval> {
        Interval::with_len(self.start * self.blksz, self.size_bytes())
    }
}

pub fn logical_block_size(block_size: u64) -> Result<LogicalBlockSize, DiskError> {
    match block_size {
        512 => Ok(LogicalBlockSize::Lb512),
        4096 => Ok(LogicalBlockSize::Lb4096),
        other => Err(DiskError::BlockSize(other)),
    }
}

/// A disk image with a GPT, standing in for the eMMC user area
#[derive(Debug)]
pub struct MmcDisk {
    file: File,
    blksz: u64,
    partitions: Vec<PartitionInfo>,
}

impl MmcDisk {
    pub fn open<P: AsRef<Path>>(path: P, block_size: u64) -> Result<MmcDisk, DiskError> {
        let lb = logical_block_size(block_size)?;
        let gpt_disk = GptConfig::new().writable(false).logical_block_size(lb).open(path.as_ref())?;
        let partitions: Vec<PartitionInfo> = gpt_disk
            .partitions()
            .values()
            .filter(|p| p.is_used())
            .map(|p| PartitionInfo {
                name: p.name.clone(),
                start: p.first_lba,
                size: p.last_lba - p.first_lba + 1,
                blksz: block_size,
                uuid: p.part_guid,
            })
            .collect();
        let mut intervals: Vec<Interval> = partitions.iter().filter_map(|p| p.byte_interval()).collect();
        if check_any_overlaps(&mut intervals) {
            warn!("partitions of {} overlap", path.as_ref().display());
        }
        for p in &partitions {
            debug!("{}: start {:#x} size {:#x} uuid {}", p.name, p.start, p.size, p.uuid);
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(MmcDisk { file, blksz: block_size, partitions })
    }

    pub fn block_size(&self) -> u64 {
        self.blksz
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    pub fn part_get_info_by_name(&self, name: &str) -> Result<&PartitionInfo, DiskError> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| DiskError::NoSuchPartition(name.to_string()))
    }

    /// Read whole blocks starting at `start` (in blocks). Returns the
    /// number of blocks read.
    pub fn blk_dread(&mut self, start: u64, buf: &mut [u8]) -> Result<u64, DiskError> {
        self.file.seek(SeekFrom::Start(start * self.blksz))?;
        self.file.read_exact(buf)?;
        Ok(buf.len() as u64 / self.blksz)
    }

    pub fn blk_dwrite(&mut self, start: u64, buf: &[u8]) -> Result<u64, DiskError> {
        self.file.seek(SeekFrom::Start(start * self.blksz))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(buf.len() as u64 / self.blksz)
    }

    /// Absolute byte range of `len` bytes at `offset` inside `name`. A
    /// negative offset counts from the end of the partition.
    fn resolve(&self, name: &str, offset: i64, len: usize) -> Result<(u64, usize), DiskError> {
        let part = self.part_get_info_by_name(name)?;
        let outside = || DiskError::RangeOutsidePartition(name.to_string());
        let rel = if offset < 0 {
            part.size_bytes().checked_sub(offset.unsigned_abs()).ok_or_else(outside)?
        } else {
            offset as u64
        };
        let part_range = part.byte_interval().ok_or_else(outside)?;
        let start = part_range.get_start() + rel;
        if len == 0 {
            return if rel <= part.size_bytes() { Ok((start, 0)) } else { Err(outside()) };
        }
        // reads are cut short at the partition end, like the AVB ops do
        let len = (len as u64).min(part.size_bytes().saturating_sub(rel));
        let request = Interval::with_len(start, len).ok_or_else(outside)?;
        match check_interval_state(&request, &part_range) {
            IntervalState::Subset | IntervalState::Equal => Ok((start, len as usize)),
            _ => Err(outside()),
        }
    }

    /// Read up to `buf.len()` bytes of a partition, returns the count read
    pub fn read_partition(&mut self, name: &str, offset: i64, buf: &mut [u8]) -> Result<usize, DiskError> {
        let (start, len) = self.resolve(name, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut buf[..len])?;
        Ok(len)
    }

    /// Write all of `data`; short writes are an error
    pub fn write_partition(&mut self, name: &str, offset: i64, data: &[u8]) -> Result<(), DiskError> {
        let (start, len) = self.resolve(name, offset, data.len())?;
        if len != data.len() {
            return Err(DiskError::RangeOutsidePartition(name.to_string()));
        }
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }

    /// Whole partition contents
    pub fn read_whole_partition(&mut self, name: &str) -> Result<Vec<u8>, DiskError> {
        let part = self.part_get_info_by_name(name)?.clone();
        let mut buf = vec![0u8; part.size_bytes() as usize];
        let blocks = self.blk_dread(part.start, &mut buf)?;
        if blocks != part.size {
            return Err(DiskError::NoSuchPartition(name.to_string()));
        }
        Ok(buf)
    }
}

/// Read a DTBO partition into memory
pub fn load_dt_table_from_part(disk: &mut MmcDisk, dtbo_part_name: &str) -> Result<Vec<u8>, DiskError> {
    let info = disk.part_get_info_by_name(dtbo_part_name).map_err(|e| {
        error!("ERROR: Can't read '{}' part", dtbo_part_name);
        e
    })?;
    info!(
        "{}: fdt overlay block offset = {:#x}, size = {}",
        dtbo_part_name, info.start, info.size
    );
    disk.read_whole_partition(dtbo_part_name).map_err(|e| {
        error!("ERROR: Can't read '{}' part", dtbo_part_name);
        e
    })
}
