//! DTB/DTBO partition images in the mkdtboimg format: a big-endian table
//! header, an array of fixed-size entries and the blobs they point at.

use log::error;
use thiserror::Error;
use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::{DT_TABLE_MAGIC, RCAR_GENERIC_PLAT_ID};
use crate::fdt::Fdt;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DtTableError {
    #[error("Invalid FDT table found (magic {0:#x})")]
    BadMagic(u32),
    #[error("Unsupported FDT table found (entry size {0})")]
    UnsupportedEntrySize(u32),
    #[error("FDT table truncated")]
    Truncated,
    #[error("entry {0} points outside the table")]
    EntryOutOfRange(usize),
}

#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct DtTableHeader {
    pub magic: big_endian::U32,
    pub total_size: big_endian::U32,
    pub header_size: big_endian::U32,
    pub dt_entry_size: big_endian::U32,
    pub dt_entry_count: big_endian::U32,
    pub dt_entries_offset: big_endian::U32,
    pub page_size: big_endian::U32,
    pub version: big_endian::U32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct DtTableEntry {
    pub dt_size: big_endian::U32,
    pub dt_offset: big_endian::U32,
    pub id: big_endian::U32,
    pub rev: big_endian::U32,
    pub custom: [big_endian::U32; 4],
}

pub const DT_TABLE_HEADER_SIZE: usize = std::mem::size_of::<DtTableHeader>();
pub const DT_TABLE_ENTRY_SIZE: usize = std::mem::size_of::<DtTableEntry>();

/// Validated view of a table image
#[derive(Debug, Clone, Copy)]
pub struct DtTable<'a> {
    data: &'a [u8],
    header: &'a DtTableHeader,
}

/// One line of `dtboinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTreeInfo {
    pub idx: usize,
    pub name: String,
    pub id: u32,
}

/// Magic and entry size sanity check of a table image
pub fn check_fdt_header(data: &[u8]) -> Result<&DtTableHeader, DtTableError> {
    let (header, _) = DtTableHeader::ref_from_prefix(data).map_err(|_| DtTableError::Truncated)?;
    if header.magic.get() != DT_TABLE_MAGIC {
        error!("ERROR: Invalid FDT table found ({:#x})", header.magic.get());
        return Err(DtTableError::BadMagic(header.magic.get()));
    }
    if header.dt_entry_size.get() as usize != DT_TABLE_ENTRY_SIZE {
        error!("ERROR: Unsupported FDT table found");
        return Err(DtTableError::UnsupportedEntrySize(header.dt_entry_size.get()));
    }
    Ok(header)
}

impl<'a> DtTable<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, DtTableError> {
        let header = check_fdt_header(data)?;
        let table = DtTable { data, header };
        let end = table.entries_offset() + table.entry_count() * DT_TABLE_ENTRY_SIZE;
        if end > data.len() {
            return Err(DtTableError::Truncated);
        }
        Ok(table)
    }

    pub fn header(&self) -> &'a DtTableHeader {
        self.header
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn entry_count(&self) -> usize {
        self.header().dt_entry_count.get() as usize
    }

    fn entries_offset(&self) -> usize {
        self.header().dt_entries_offset.get() as usize
    }

    pub fn entry(&self, index: usize) -> Option<&'a DtTableEntry> {
        if index >= self.entry_count() {
            return None;
        }
        let off = self.entries_offset() + index * DT_TABLE_ENTRY_SIZE;
        DtTableEntry::ref_from_prefix(self.data.get(off..)?).ok().map(|(e, _)| e)
    }

    pub fn entries(&self) -> impl Iterator<Item = &'a DtTableEntry> + '_ {
        (0..self.entry_count()).filter_map(move |i| self.entry(i))
    }

    /// Scan from `start` for an entry built for `plat_id` or for every
    /// platform. Returns the entry and its index.
    pub fn find(&self, plat_id: u32, start: usize) -> Option<(usize, &'a DtTableEntry)> {
        (start..self.entry_count()).find_map(|i| {
            let entry = self.entry(i)?;
            let id = entry.id.get();
            (id == plat_id || id == RCAR_GENERIC_PLAT_ID).then_some((i, entry))
        })
    }

    /// The blob an entry points at
    pub fn load_dt(&self, index: usize) -> Result<&'a [u8], DtTableError> {
        let entry = self.entry(index).ok_or(DtTableError::EntryOutOfRange(index))?;
        let off = entry.dt_offset.get() as usize;
        let size = entry.dt_size.get() as usize;
        self.data.get(off..off + size).ok_or(DtTableError::EntryOutOfRange(index))
    }

    /// Index, name and board id of every entry
    pub fn get_dt_info(&self) -> Vec<DeviceTreeInfo> {
        (0..self.entry_count())
            .filter_map(|idx| {
                let entry = self.entry(idx)?;
                let name = self
                    .load_dt(idx)
                    .ok()
                    .and_then(|blob| Fdt::from_bytes(blob).ok())
                    .and_then(|fdt| fdt.model().map(str::to_string))
                    .unwrap_or_else(|| "-".to_string());
                Some(DeviceTreeInfo { idx, name, id: entry.id.get() })
            })
            .collect()
    }
}

/// Table lookup with an in/out start index: on success `dt_num` is moved
/// to the matching entry.
pub fn find_fdt_from_table<'a>(table: &'a [u8], plat_id: u32, dt_num: Option<&mut usize>) -> Option<&'a DtTableEntry> {
    let table = DtTable::new(table).ok()?;
    let start = dt_num.as_ref().map(|n| **n).unwrap_or(0);
    let (idx, entry) = table.find(plat_id, start)?;
    if let Some(n) = dt_num {
        *n = idx;
    }
    Some(entry)
}

/// Assemble a table image, used by tests and image tooling
pub fn build_dt_table(blobs: &[(u32, Vec<u8>)], page_size: u32) -> Vec<u8> {
    let entries_offset = DT_TABLE_HEADER_SIZE;
    let mut offset = entries_offset + blobs.len() * DT_TABLE_ENTRY_SIZE;
    let mut entries = Vec::new();
    for (id, blob) in blobs {
        let entry = DtTableEntry {
            dt_size: (blob.len() as u32).into(),
            dt_offset: (offset as u32).into(),
            id: (*id).into(),
            rev: big_endian::U32::ZERO,
            custom: [big_endian::U32::ZERO; 4],
        };
        entries.extend_from_slice(entry.as_bytes());
        offset += blob.len();
    }
    let header = DtTableHeader {
        magic: DT_TABLE_MAGIC.into(),
        total_size: (offset as u32).into(),
        header_size: (DT_TABLE_HEADER_SIZE as u32).into(),
        dt_entry_size: (DT_TABLE_ENTRY_SIZE as u32).into(),
        dt_entry_count: (blobs.len() as u32).into(),
        dt_entries_offset: (entries_offset as u32).into(),
        page_size: page_size.into(),
        version: big_endian::U32::ZERO,
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(&entries);
    for (_, blob) in blobs {
        out.extend_from_slice(blob);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::{str_value, Node};

    fn blob(model: &str) -> Vec<u8> {
        Fdt::new(Node::new("").with_prop("model", str_value(model))).to_bytes().unwrap()
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(DT_TABLE_HEADER_SIZE, 32);
        assert_eq!(DT_TABLE_ENTRY_SIZE, 32);
    }

    #[test]
    fn find_resumes_from_start_index() {
        let table = build_dt_table(
            &[(0x0b77_9530, blob("a")), (0x0477_9520, blob("b")), (RCAR_GENERIC_PLAT_ID, blob("c"))],
            2048,
        );
        let mut n = 0;
        assert!(find_fdt_from_table(&table, 0x0b77_9530, Some(&mut n)).is_some());
        assert_eq!(n, 0);
        n = 1;
        let entry = find_fdt_from_table(&table, 0x0b77_9530, Some(&mut n)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(entry.id.get(), RCAR_GENERIC_PLAT_ID);
        assert!(find_fdt_from_table(&table, 0x0b77_9530, None).is_some());
    }

    #[test]
    fn not_found_leaves_index() {
        let table = build_dt_table(&[(0x0477_9520, blob("b"))], 2048);
        let mut n = 0;
        assert!(find_fdt_from_table(&table, 0x0b77_9530, Some(&mut n)).is_none());
        assert_eq!(n, 0);
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut table = build_dt_table(&[(1, blob("x"))], 2048);
        table[0] = 0;
        assert!(matches!(DtTable::new(&table), Err(DtTableError::BadMagic(_))));
        assert!(find_fdt_from_table(&table, 1, None).is_none());
        let mut table = build_dt_table(&[(1, blob("x"))], 2048);
        table[15] = 16;
        assert_eq!(DtTable::new(&table).unwrap_err(), DtTableError::UnsupportedEntrySize(16));
    }

    #[test]
    fn dt_info_lists_models() {
        let table = build_dt_table(&[(0x0b77_9530, blob("H3ULCB")), (7, vec![0u8; 8])], 2048);
        let info = DtTable::new(&table).unwrap().get_dt_info();
        assert_eq!(info[0], DeviceTreeInfo { idx: 0, name: "H3ULCB".to_string(), id: 0x0b77_9530 });
        assert_eq!(info[1].name, "-");
    }
}
