//! Guest address space of the reference machine.

use crate::target::TargetError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fmt,
    io::{self, Read},
};

/// Kind of a guest memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Read by the program or the debugger
    Load,
    /// Write by the program, honours read-only regions
    Store,
    /// Write by the debugger, may patch read-only regions
    Patch,
}

/// One contiguous, owned chunk of guest memory
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First guest address
    pub vm_addr: u64,
    /// Contents
    pub data: Vec<u8>,
    /// Whether the program may store into the region
    pub writable: bool,
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion {{ vm_addr: {:#x}, len: {:#x}, writable: {} }}",
            self.vm_addr,
            self.data.len(),
            self.writable
        )
    }
}

impl MemoryRegion {
    /// Region the program can only read
    pub fn new_readonly(data: &[u8], vm_addr: u64) -> Self {
        Self {
            vm_addr,
            data: data.to_vec(),
            writable: false,
        }
    }

    /// Region the program can read and write
    pub fn new_writable(data: Vec<u8>, vm_addr: u64) -> Self {
        Self {
            vm_addr,
            data,
            writable: true,
        }
    }

    /// Zero filled writable region
    pub fn new_zeroed(len: usize, vm_addr: u64) -> Self {
        Self::new_writable(vec![0; len], vm_addr)
    }

    /// One past the last guest address
    pub fn vm_addr_end(&self) -> u64 {
        self.vm_addr.saturating_add(self.data.len() as u64)
    }

    /// Offset of `[vm_addr, vm_addr + len)` inside the region
    fn offset_of(&self, vm_addr: u64, len: usize) -> Option<usize> {
        let end = vm_addr.checked_add(len as u64)?;
        (vm_addr >= self.vm_addr && end <= self.vm_addr_end())
            .then(|| (vm_addr - self.vm_addr) as usize)
    }
}

/// Set of non-overlapping regions, sorted by address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMapping {
    regions: Vec<MemoryRegion>,
}

impl MemoryMapping {
    /// Builds a mapping, rejecting overlapping regions
    pub fn new(mut regions: Vec<MemoryRegion>) -> Result<Self, TargetError> {
        regions.sort_by_key(|region| region.vm_addr);
        for pair in regions.windows(2) {
            if pair[0].vm_addr_end() > pair[1].vm_addr {
                return Err(TargetError::MemoryAccess {
                    address: pair[1].vm_addr,
                    len: pair[1].data.len(),
                });
            }
        }
        Ok(Self { regions })
    }

    /// Mapped regions in address order
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn find(&self, vm_addr: u64, len: usize) -> Option<(usize, usize)> {
        let index = self
            .regions
            .partition_point(|region| region.vm_addr <= vm_addr)
            .checked_sub(1)?;
        let offset = self.regions[index].offset_of(vm_addr, len)?;
        Some((index, offset))
    }

    /// Whether the whole range is mapped and allowed for `access`
    pub fn is_accessible(&self, access: AccessType, vm_addr: u64, len: usize) -> bool {
        match self.find(vm_addr, len) {
            Some((index, _)) => access != AccessType::Store || self.regions[index].writable,
            None => false,
        }
    }

    /// Copies guest memory into `buf`
    pub fn load(&self, vm_addr: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        let (index, offset) = self.find(vm_addr, buf.len()).ok_or(TargetError::MemoryAccess {
            address: vm_addr,
            len: buf.len(),
        })?;
        buf.copy_from_slice(&self.regions[index].data[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copies `data` into guest memory
    pub fn store(&mut self, access: AccessType, vm_addr: u64, data: &[u8]) -> Result<(), TargetError> {
        let fault = TargetError::MemoryAccess {
            address: vm_addr,
            len: data.len(),
        };
        let (index, offset) = self.find(vm_addr, data.len()).ok_or(fault.clone())?;
        let region = &mut self.regions[index];
        if access == AccessType::Store && !region.writable {
            return Err(fault);
        }
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Serializes every region
    pub fn write_to(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.regions.len() as u32)?;
        for region in &self.regions {
            writer.write_u64::<LittleEndian>(region.vm_addr)?;
            writer.write_u64::<LittleEndian>(region.data.len() as u64)?;
            writer.write_u8(u8::from(region.writable))?;
            writer.write_all(&region.data)?;
        }
        Ok(())
    }

    /// Reads a mapping written by [`Self::write_to`]
    pub fn read_from(reader: &mut dyn io::Read) -> io::Result<Self> {
        let count = reader.read_u32::<LittleEndian>()?;
        let mut regions = Vec::new();
        for _ in 0..count {
            let vm_addr = reader.read_u64::<LittleEndian>()?;
            let len = reader.read_u64::<LittleEndian>()?;
            let writable = reader.read_u8()? != 0;
            let mut data = Vec::new();
            Read::take(&mut *reader, len).read_to_end(&mut data)?;
            if data.len() as u64 != len {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            regions.push(MemoryRegion {
                vm_addr,
                data,
                writable,
            });
        }
        Self::new(regions).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapping() -> MemoryMapping {
        MemoryMapping::new(vec![
            MemoryRegion::new_zeroed(0x100, 0x2000),
            MemoryRegion::new_readonly(&[1, 2, 3, 4], 0x1000),
        ])
        .unwrap()
    }

    #[test]
    fn test_load_and_store() {
        let mut mapping = mapping();
        let mut buf = [0u8; 2];
        mapping.load(0x1001, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);

        mapping.store(AccessType::Store, 0x20fe, &[9, 9]).unwrap();
        mapping.load(0x20fe, &mut buf).unwrap();
        assert_eq!(buf, [9, 9]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut mapping = mapping();
        let mut buf = [0u8; 4];
        assert!(mapping.load(0x1002, &mut buf).is_err());
        assert!(mapping.load(0x0fff, &mut buf).is_err());
        assert!(mapping.store(AccessType::Store, 0x20ff, &[0, 0]).is_err());
        assert!(!mapping.is_accessible(AccessType::Load, u64::MAX, 2));
    }

    #[test]
    fn test_readonly_needs_patch_access() {
        let mut mapping = mapping();
        assert!(mapping.store(AccessType::Store, 0x1000, &[7]).is_err());
        mapping.store(AccessType::Patch, 0x1000, &[7]).unwrap();
        let mut buf = [0u8; 1];
        mapping.load(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [7]);
    }

    #[test]
    fn test_overlap_rejected() {
        assert!(MemoryMapping::new(vec![
            MemoryRegion::new_zeroed(0x10, 0x0),
            MemoryRegion::new_zeroed(0x10, 0x8),
        ])
        .is_err());
    }

    #[test]
    fn test_serialization() {
        let mapping = mapping();
        let mut bytes = Vec::new();
        mapping.write_to(&mut bytes).unwrap();
        let restored = MemoryMapping::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored, mapping);
    }
}
