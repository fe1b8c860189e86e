//! Flattened device tree: parse a blob into an owned tree, edit it and
//! flatten it back.
//!
//! Blobs are read with the `fdt` crate once the structure block has passed
//! a full, non-recursive check, and written with `vm_fdt`. Only what the
//! boot path needs is kept: the memory reservation map, nodes and
//! properties.

use ::fdt::node::FdtNode;
use ::fdt::Fdt as FdtBlob;
use thiserror::Error;
use vm_fdt::{FdtReserveEntry, FdtWriter};
use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::FDT_MAGIC;

const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Deepest nesting accepted from a blob
pub const FDT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FdtError {
    #[error("FDT_ERR_TRUNCATED")]
    Truncated,
    #[error("FDT_ERR_BADMAGIC")]
    BadMagic,
    #[error("FDT_ERR_BADVERSION")]
    BadVersion,
    #[error("FDT_ERR_BADSTRUCTURE")]
    BadStructure,
    #[error("FDT_ERR_BADPATH: {0}")]
    BadPath(String),
    #[error("FDT_ERR_NOTFOUND: {0}")]
    NotFound(String),
    #[error("FDT_ERR_NOSPACE: need {needed} bytes, have {available}")]
    NoSpace { needed: usize, available: usize },
    #[error("FDT_ERR_BADPHANDLE")]
    BadPhandle,
    #[error("FDT_ERR_NOPHANDLES")]
    NoPhandles,
    #[error("FDT_ERR_BADOVERLAY: {0}")]
    BadOverlay(String),
    #[error("FDT_ERR_BADVALUE: {0}")]
    BadValue(String),
    #[error("FDT_ERR_BADLAYOUT: {0}")]
    Layout(String),
}

impl From<vm_fdt::Error> for FdtError {
    fn from(e: vm_fdt::Error) -> Self {
        FdtError::Layout(e.to_string())
    }
}

pub type FdtResult<T> = Result<T, FdtError>;

#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct FdtHeader {
    pub magic: big_endian::U32,
    pub totalsize: big_endian::U32,
    pub off_dt_struct: big_endian::U32,
    pub off_dt_strings: big_endian::U32,
    pub off_mem_rsvmap: big_endian::U32,
    pub version: big_endian::U32,
    pub last_comp_version: big_endian::U32,
    pub boot_cpuid_phys: big_endian::U32,
    pub size_dt_strings: big_endian::U32,
    pub size_dt_struct: big_endian::U32,
}

pub const FDT_HEADER_SIZE: usize = std::mem::size_of::<FdtHeader>();

/// Validate the header of a blob, like fdt_check_header()
pub fn check_header(data: &[u8]) -> FdtResult<&FdtHeader> {
    let (header, _) = FdtHeader::ref_from_prefix(data).map_err(|_| FdtError::Truncated)?;
    if header.magic.get() != FDT_MAGIC {
        return Err(FdtError::BadMagic);
    }
    if header.version.get() < FDT_LAST_COMP_VERSION || header.last_comp_version.get() > FDT_VERSION {
        return Err(FdtError::BadVersion);
    }
    let totalsize = header.totalsize.get() as usize;
    if totalsize < FDT_HEADER_SIZE || totalsize > data.len() {
        return Err(FdtError::Truncated);
    }
    let struct_end = header.off_dt_struct.get() as usize + header.size_dt_struct.get() as usize;
    let strings_end = header.off_dt_strings.get() as usize + header.size_dt_strings.get() as usize;
    if struct_end > totalsize || strings_end > totalsize || (header.off_mem_rsvmap.get() as usize) > totalsize {
        return Err(FdtError::Truncated);
    }
    Ok(header)
}

/// fdt_totalsize() of a blob, or None when the header is unusable
pub fn totalsize(data: &[u8]) -> Option<usize> {
    let (header, _) = FdtHeader::ref_from_prefix(data).ok()?;
    if header.magic.get() != FDT_MAGIC {
        return None;
    }
    Some(header.totalsize.get() as usize)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

impl Property {
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// First NUL-terminated string of the value
    pub fn as_str(&self) -> Option<&str> {
        let end = self.value.iter().position(|&b| b == 0).unwrap_or(self.value.len());
        std::str::from_utf8(&self.value[..end]).ok()
    }

    /// All NUL-separated strings of the value
    pub fn as_str_list(&self) -> Vec<&str> {
        self.value
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .filter_map(|s| std::str::from_utf8(s).ok())
            .collect()
    }

    pub fn as_u32_list(&self) -> Vec<u32> {
        self.value
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

pub fn u32_value(v: u32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub fn str_value(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Node { name: name.to_string(), properties: Vec::new(), children: Vec::new() }
    }

    pub fn with_prop(mut self, name: &str, value: Vec<u8>) -> Self {
        self.set_property(name, value);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    pub fn set_property(&mut self, name: &str, value: Vec<u8>) {
        match self.property_mut(name) {
            Some(p) => p.value = value,
            None => self.properties.push(Property { name: name.to_string(), value }),
        }
    }

    /// "phandle", falling back to the legacy "linux,phandle"
    pub fn phandle(&self) -> Option<u32> {
        self.property("phandle")
            .or_else(|| self.property("linux,phandle"))
            .and_then(|p| p.as_u32())
    }

    fn child_index(&self, name: &str) -> Option<usize> {
        if let Some(i) = self.children.iter().position(|c| c.name == name) {
            return Some(i);
        }
        // unit address may be left out
        if !name.contains('@') {
            return self.children.iter().position(|c| c.name.split('@').next() == Some(name));
        }
        None
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.child_index(name).map(|i| &self.children[i])
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.child_index(name).map(move |i| &mut self.children[i])
    }

    pub fn find_or_add_child(&mut self, name: &str) -> &mut Node {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(i) => i,
            None => {
                self.children.push(Node::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut Node)) {
        f(self);
        for child in self.children.iter_mut() {
            child.for_each_mut(f);
        }
    }

    fn max_phandle(&self) -> u32 {
        let own = match self.phandle() {
            Some(p) if p != u32::MAX => p,
            _ => 0,
        };
        self.children.iter().map(|c| c.max_phandle()).fold(own, u32::max)
    }

    fn path_of_phandle(&self, phandle: u32, prefix: &str) -> Option<String> {
        for child in &self.children {
            let path = format!("{}/{}", prefix, child.name);
            if child.phandle() == Some(phandle) {
                return Some(path);
            }
            if let Some(found) = child.path_of_phandle(phandle, &path) {
                return Some(found);
            }
        }
        None
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// An owned device tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fdt {
    pub boot_cpuid_phys: u32,
    pub reserve_map: Vec<(u64, u64)>,
    pub root: Node,
}

impl Default for Fdt {
    fn default() -> Self {
        Fdt { boot_cpuid_phys: 0, reserve_map: Vec::new(), root: Node::new("") }
    }
}

fn cstr_at(data: &[u8], start: usize) -> FdtResult<usize> {
    let rest = data.get(start..).ok_or(FdtError::Truncated)?;
    let len = rest.iter().position(|&b| b == 0).ok_or(FdtError::Truncated)?;
    std::str::from_utf8(&rest[..len]).map_err(|_| FdtError::BadStructure)?;
    Ok(len)
}

/// One pass over the whole blob, like fdt_check_full(): tokens, names and
/// property values stay in bounds, nodes balance and nest no deeper than
/// [`FDT_MAX_DEPTH`].
pub fn check_full(data: &[u8]) -> FdtResult<()> {
    let header = check_header(data)?;

    let mut off = header.off_mem_rsvmap.get() as usize;
    loop {
        let entry = data.get(off..off + 16).ok_or(FdtError::Truncated)?;
        if entry.iter().all(|&b| b == 0) {
            break;
        }
        off += 16;
    }

    let s_off = header.off_dt_struct.get() as usize;
    let str_off = header.off_dt_strings.get() as usize;
    let block = &data[s_off..s_off + header.size_dt_struct.get() as usize];
    let strings = &data[str_off..str_off + header.size_dt_strings.get() as usize];

    let mut pos = 0;
    let next_u32 = |pos: &mut usize| -> FdtResult<u32> {
        let bytes = block.get(*pos..*pos + 4).ok_or(FdtError::Truncated)?;
        *pos += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };
    let mut depth = 0usize;
    let mut root_done = false;
    // properties come before subnodes
    let mut after_end = false;
    loop {
        match next_u32(&mut pos)? {
            FDT_BEGIN_NODE => {
                if root_done {
                    return Err(FdtError::BadStructure);
                }
                after_end = false;
                depth += 1;
                if depth > FDT_MAX_DEPTH {
                    return Err(FdtError::BadStructure);
                }
                let len = cstr_at(block, pos)?;
                pos = (pos + len + 1 + 3) & !3;
            }
            FDT_END_NODE => {
                depth = depth.checked_sub(1).ok_or(FdtError::BadStructure)?;
                root_done = depth == 0;
                after_end = true;
            }
            FDT_PROP => {
                if depth == 0 || after_end {
                    return Err(FdtError::BadStructure);
                }
                let len = next_u32(&mut pos)? as usize;
                let nameoff = next_u32(&mut pos)? as usize;
                block.get(pos..pos + len).ok_or(FdtError::Truncated)?;
                cstr_at(strings, nameoff)?;
                pos = (pos + len + 3) & !3;
            }
            FDT_NOP => {}
            FDT_END if root_done => return Ok(()),
            _ => return Err(FdtError::BadStructure),
        }
    }
}

fn read_node(name: &str, node: FdtNode<'_, '_>) -> Node {
    Node {
        name: name.to_string(),
        properties: node
            .properties()
            .map(|p| Property { name: p.name.to_string(), value: p.value.to_vec() })
            .collect(),
        children: node.children().map(|child| read_node(child.name, child)).collect(),
    }
}

fn write_node(writer: &mut FdtWriter, name: &str, node: &Node) -> FdtResult<()> {
    let handle = writer.begin_node(name)?;
    for prop in &node.properties {
        writer.property(&prop.name, &prop.value)?;
    }
    for child in &node.children {
        write_node(writer, &child.name, child)?;
    }
    writer.end_node(handle)?;
    Ok(())
}

impl Fdt {
    pub fn new(root: Node) -> Self {
        Fdt { root, ..Fdt::default() }
    }

    pub fn from_bytes(data: &[u8]) -> FdtResult<Fdt> {
        check_full(data)?;
        let header = check_header(data)?;
        let blob = FdtBlob::new(data).map_err(|_| FdtError::BadStructure)?;
        let reserve_map = blob
            .memory_reservations()
            .map(|r| (r.address() as usize as u64, r.size() as u64))
            .collect();
        let root = blob.find_node("/").ok_or(FdtError::BadStructure)?;
        Ok(Fdt { boot_cpuid_phys: header.boot_cpuid_phys.get(), reserve_map, root: read_node("", root) })
    }

    /// Serialize as a compact blob
    pub fn to_bytes(&self) -> FdtResult<Vec<u8>> {
        let reserved = self
            .reserve_map
            .iter()
            .map(|&(address, size)| FdtReserveEntry::new(address, size))
            .collect::<Result<Vec<_>, _>>()?;
        let mut writer = FdtWriter::new_with_mem_reserv(&reserved)?;
        writer.set_boot_cpuid_phys(self.boot_cpuid_phys);
        write_node(&mut writer, "", &self.root)?;
        Ok(writer.finish()?)
    }

    pub fn packed_size(&self) -> FdtResult<usize> {
        Ok(self.to_bytes()?.len())
    }

    /// Resolve a path or an alias to an absolute path
    pub fn resolve_path(&self, path: &str) -> FdtResult<String> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let (alias, rest) = match path.find('/') {
            Some(i) => (&path[..i], &path[i..]),
            None => (path, ""),
        };
        let target = self
            .root
            .child("aliases")
            .and_then(|a| a.property(alias))
            .and_then(|p| p.as_str())
            .ok_or_else(|| FdtError::BadPath(path.to_string()))?;
        Ok(format!("{}{}", target, rest))
    }

    pub fn node(&self, path: &str) -> Option<&Node> {
        let path = self.resolve_path(path).ok()?;
        let mut node = &self.root;
        for comp in split_path(&path) {
            node = node.child(comp)?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let path = self.resolve_path(path).ok()?;
        let mut node = &mut self.root;
        for comp in split_path(&path) {
            node = node.child_mut(comp)?;
        }
        Some(node)
    }

    /// Like fdt_find_or_add_subnode() along the whole path
    pub fn find_or_add_node(&mut self, path: &str) -> &mut Node {
        let mut node = &mut self.root;
        for comp in split_path(path) {
            node = node.find_or_add_child(comp);
        }
        node
    }

    pub fn setprop(&mut self, path: &str, name: &str, value: Vec<u8>) -> FdtResult<()> {
        let node = self.node_mut(path).ok_or_else(|| FdtError::NotFound(path.to_string()))?;
        node.set_property(name, value);
        Ok(())
    }

    pub fn getprop(&self, path: &str, name: &str) -> Option<&Property> {
        self.node(path)?.property(name)
    }

    /// Largest phandle in use, 0 when there is none
    pub fn max_phandle(&self) -> u32 {
        self.root.max_phandle()
    }

    pub fn path_of_phandle(&self, phandle: u32) -> Option<String> {
        if self.root.phandle() == Some(phandle) {
            return Some("/".to_string());
        }
        self.root.path_of_phandle(phandle, "")
    }

    pub(crate) fn for_each_node_mut(&mut self, f: &mut dyn FnMut(&mut Node)) {
        self.root.for_each_mut(f);
    }

    /// Model string of the root node, else its first compatible
    pub fn model(&self) -> Option<&str> {
        self.root
            .property("model")
            .and_then(|p| p.as_str())
            .or_else(|| self.root.property("compatible").and_then(|p| p.as_str()))
    }
}
