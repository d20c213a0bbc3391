//! ELF program-header extraction.
//!
//! Only `PT_LOAD` segments matter. Each is placed at its physical address;
//! memory beyond the file-backed bytes (BSS) is zero.

use log::debug;
use xmas_elf::ElfFile;
use xmas_elf::program::{ProgramHeader, Type};

use crate::error::{Error, Result};

/// ELF identification bytes.
pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Largest image the loader can address (16 MiB - 1).
pub const MAX_IMAGE_SIZE: usize = 0xFF_FFFF;

/// One loadable segment, zero-filled out to its memory size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Physical load address.
    pub address: u32,
    /// Segment contents, `mem_size` bytes long.
    pub data: Vec<u8>,
}

/// Whether `data` carries the ELF magic.
pub fn has_elf_magic(data: &[u8]) -> bool {
    data.starts_with(ELF_MAGIC)
}

/// Parse `data` as ELF. `Ok(None)` means the header is not plausible ELF and
/// the caller should treat the file as raw.
pub fn parse(data: &[u8]) -> Result<Option<ElfFile<'_>>> {
    if !has_elf_magic(data) {
        return Ok(None);
    }
    let Ok(elf) = ElfFile::new(data) else {
        return Ok(None);
    };
    let pt2 = &elf.header.pt2;
    let table_end = u64::from(pt2.ph_count()) * u64::from(pt2.ph_entry_size()) + pt2.ph_offset();
    if table_end > data.len() as u64 {
        return Err(Error::InvalidElf(format!(
            "program header table ends at {table_end:#x}, past end of file"
        )));
    }
    Ok(Some(elf))
}

/// Collect every `PT_LOAD` segment in file order.
pub fn load_segments(elf: &ElfFile<'_>) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for index in 0..elf.header.pt2.ph_count() {
        let header = elf
            .program_header(index)
            .map_err(|e| Error::InvalidElf(format!("program header {index}: {e}")))?;
        if header.get_type() != Ok(Type::Load) {
            continue;
        }
        segments.push(read_segment(elf, index, header)?);
    }
    Ok(segments)
}

fn read_segment(elf: &ElfFile<'_>, index: u16, header: ProgramHeader<'_>) -> Result<Segment> {
    let file_size = header.file_size();
    let mem_size = header.mem_size();
    if mem_size < file_size {
        return Err(Error::InvalidElf(format!(
            "segment {index}: file size {file_size:#x} exceeds memory size {mem_size:#x}"
        )));
    }
    if mem_size > MAX_IMAGE_SIZE as u64 {
        return Err(Error::ImageTooLarge {
            size: usize::try_from(mem_size).unwrap_or(usize::MAX),
            limit: MAX_IMAGE_SIZE,
        });
    }
    let address = u32::try_from(header.physical_addr()).map_err(|_| {
        Error::InvalidElf(format!(
            "segment {index}: address {:#x} beyond 32 bits",
            header.physical_addr()
        ))
    })?;

    let start = usize::try_from(header.offset()).unwrap_or(usize::MAX);
    let end = start.saturating_add(usize::try_from(file_size).unwrap_or(usize::MAX));
    let bytes = elf.input.get(start..end).ok_or_else(|| {
        Error::InvalidElf(format!("segment {index}: file data out of range"))
    })?;

    let mut data = vec![0u8; usize::try_from(mem_size).unwrap_or(usize::MAX)];
    data[..bytes.len()].copy_from_slice(bytes);
    debug!(
        "ELF segment {index}: {} bytes ({} from file) at {address:#x}",
        data.len(),
        bytes.len()
    );
    Ok(Segment { address, data })
}

/// Lay segments out in one zero-filled buffer spanning
/// `min(paddr) .. max(paddr + memsz)`. Returns the base address and buffer.
pub fn flatten(segments: &[Segment]) -> Result<(u32, Vec<u8>)> {
    let Some(base) = segments.iter().map(|s| s.address).min() else {
        return Err(Error::InvalidElf("no loadable segments".into()));
    };
    let top = segments
        .iter()
        .map(|s| u64::from(s.address) + s.data.len() as u64)
        .max()
        .unwrap_or(u64::from(base));
    let size = usize::try_from(top - u64::from(base)).unwrap_or(usize::MAX);
    if size > MAX_IMAGE_SIZE {
        return Err(Error::ImageTooLarge {
            size,
            limit: MAX_IMAGE_SIZE,
        });
    }

    let mut image = vec![0u8; size];
    for segment in segments {
        let offset = (segment.address - base) as usize;
        image[offset..offset + segment.data.len()].copy_from_slice(&segment.data);
    }
    Ok((base, image))
}
