//! Loads RV64 programs for the reference machine.
//!
//! ELF executables are mapped segment by segment from their `PT_LOAD`
//! program headers; flat binaries are mapped read-only at a fixed address.

use crate::memory_region::MemoryRegion;
use goblin::elf::{
    header::{EM_RISCV, ET_DYN, ET_EXEC},
    program_header::{PF_W, PF_X, PT_LOAD},
    Elf,
};

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ElfError {
    /// Failed to parse ELF file
    #[error("Failed to parse ELF file: {0}")]
    FailedToParse(String),
    /// Entrypoint out of bounds
    #[error("Entrypoint out of bounds")]
    EntrypointOutOfBounds,
    /// Incompatible ELF: wrong endianess
    #[error("Incompatible ELF: wrong endianess")]
    WrongEndianess,
    /// Incompatible ELF: wrong machine
    #[error("Incompatible ELF: wrong machine")]
    WrongMachine,
    /// Incompatible ELF: wrong class
    #[error("Incompatible ELF: wrong class")]
    WrongClass,
    /// Incompatible ELF: wrong type
    #[error("Incompatible ELF: wrong type")]
    WrongType,
    /// Invalid program header
    #[error("Invalid ELF program header")]
    InvalidProgramHeader,
    /// No loadable segments
    #[error("No loadable segments")]
    NoLoadableSegments,
    /// Offset or value is out of bounds
    #[error("Offset or value is out of bounds")]
    ValueOutOfBounds,
}

/// Default load address of flat binaries
pub const MM_TEXT_START: u64 = 0x1_0000;

/// A program ready to be mapped into the reference machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    regions: Vec<MemoryRegion>,
    entry: u64,
}

impl Executable {
    /// Parses an RV64 ELF executable
    pub fn load(bytes: &[u8]) -> Result<Self, ElfError> {
        let elf = Elf::parse(bytes).map_err(|err| ElfError::FailedToParse(err.to_string()))?;
        if !elf.is_64 {
            return Err(ElfError::WrongClass);
        }
        if !elf.little_endian {
            return Err(ElfError::WrongEndianess);
        }
        if elf.header.e_machine != EM_RISCV {
            return Err(ElfError::WrongMachine);
        }
        if elf.header.e_type != ET_EXEC && elf.header.e_type != ET_DYN {
            return Err(ElfError::WrongType);
        }

        let mut regions = Vec::new();
        let mut entry_mapped = false;
        for header in elf.program_headers.iter().filter(|header| header.p_type == PT_LOAD) {
            if header.p_filesz > header.p_memsz {
                return Err(ElfError::InvalidProgramHeader);
            }
            let file = bytes
                .get(header.file_range())
                .ok_or(ElfError::InvalidProgramHeader)?;
            let memsz = usize::try_from(header.p_memsz).map_err(|_| ElfError::ValueOutOfBounds)?;
            let mut data = file.to_vec();
            data.resize(memsz, 0);
            let vm_addr = header.p_vaddr;
            vm_addr
                .checked_add(header.p_memsz)
                .ok_or(ElfError::ValueOutOfBounds)?;

            let region = if header.p_flags & PF_W != 0 {
                MemoryRegion::new_writable(data, vm_addr)
            } else {
                MemoryRegion::new_readonly(&data, vm_addr)
            };
            if header.p_flags & PF_X != 0
                && elf.entry >= vm_addr
                && elf.entry < region.vm_addr_end()
            {
                entry_mapped = true;
            }
            log::debug!("ELF: mapping {region:?}");
            regions.push(region);
        }
        if regions.is_empty() {
            return Err(ElfError::NoLoadableSegments);
        }
        if !entry_mapped {
            return Err(ElfError::EntrypointOutOfBounds);
        }
        Ok(Self {
            regions,
            entry: elf.entry,
        })
    }

    /// Maps raw machine code read-only at `vm_addr`, entering at its first byte
    pub fn from_text_bytes(text: &[u8], vm_addr: u64) -> Result<Self, ElfError> {
        if text.is_empty() {
            return Err(ElfError::EntrypointOutOfBounds);
        }
        vm_addr
            .checked_add(text.len() as u64)
            .ok_or(ElfError::ValueOutOfBounds)?;
        Ok(Self {
            regions: vec![MemoryRegion::new_readonly(text, vm_addr)],
            entry: vm_addr,
        })
    }

    /// Loads an ELF file, or a flat binary if `bytes` has no ELF magic
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ElfError> {
        if bytes.starts_with(b"\x7fELF") {
            Self::load(bytes)
        } else {
            Self::from_text_bytes(bytes, MM_TEXT_START)
        }
    }

    /// Entry point
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Segments in file order
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Hands over the segments
    pub fn into_regions(self) -> Vec<MemoryRegion> {
        self.regions
    }
}
