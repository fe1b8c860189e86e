//! Sparse physical address space where boot artifacts are staged.

use std::collections::BTreeMap;

const PAGE_SIZE: u64 = 4096;

/// Unwritten memory reads back as zeroes
#[derive(Debug, Default)]
pub struct SysMem {
    pages: BTreeMap<u64, Box<[u8]>>,
    bytes_written: u64,
}

impl SysMem {
    pub fn new() -> Self {
        SysMem::default()
    }

    /// Total number of bytes ever stored, used to prove that nothing was staged
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn page_mut(&mut self, page: u64) -> &mut [u8] {
        self.pages.entry(page).or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr + done as u64;
            let page = cur / PAGE_SIZE;
            let off = (cur % PAGE_SIZE) as usize;
            let n = std::cmp::min(PAGE_SIZE as usize - off, data.len() - done);
            self.page_mut(page)[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        self.bytes_written += data.len() as u64;
    }

    pub fn read_into(&self, addr: u64, out: &mut [u8]) {
        let mut done = 0usize;
        while done < out.len() {
            let cur = addr + done as u64;
            let page = cur / PAGE_SIZE;
            let off = (cur % PAGE_SIZE) as usize;
            let n = std::cmp::min(PAGE_SIZE as usize - off, out.len() - done);
            match self.pages.get(&page) {
                Some(p) => out[done..done + n].copy_from_slice(&p[off..off + n]),
                None => out[done..done + n].fill(0),
            }
            done += n;
        }
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(addr, &mut out);
        out
    }

    pub fn fill(&mut self, addr: u64, len: usize, value: u8) {
        self.write(addr, &vec![value; len]);
    }

    pub fn read_u32_le(&self, addr: u64) -> u32 {
        let mut b = [0u8; 4];
        self.read_into(addr, &mut b);
        u32::from_le_bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_across_pages() {
        let mut mem = SysMem::new();
        let data: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        mem.write(0x4800_0ff0, &data);
        assert_eq!(mem.read(0x4800_0ff0, data.len()), data);
        assert_eq!(mem.bytes_written(), 10000);
    }

    #[test]
    fn untouched_memory_is_zero() {
        let mut mem = SysMem::new();
        assert_eq!(mem.read(0x1000, 8), vec![0u8; 8]);
        mem.fill(0x1002, 2, 0xaa);
        assert_eq!(mem.read(0x1000, 5), vec![0, 0, 0xaa, 0xaa, 0]);
        mem.write(0x2000, &0x1234_5678u32.to_le_bytes());
        assert_eq!(mem.read_u32_le(0x2000), 0x1234_5678);
    }
}
