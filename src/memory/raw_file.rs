use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::{GuestTransport, Registers, TransportError};

/// Hardcoded register values used by the raw-file transport.
///
/// `libvirt_client.c`'s `file_get_registers` returns these same constants
/// unconditionally rather than inspecting the dump: the raw-file transport
/// exists to replay a captured memory image, and the image is paired with a
/// known CR3/IDTR from the guest it was taken from. Preserved as-is; a real
/// deployment would pass these alongside the dump rather than inventing a
/// way to read live registers out of a static file.
const FIXED_CR3: u64 = 0x19872000;
const FIXED_IDTR: u64 = 0xffffffffff528000;
const FIXED_CR4: u64 = 0;

/// Reads guest-physical memory out of a flat memory-dump file by treating
/// guest-physical address as byte offset.
pub struct RawFile {
    file: Option<File>,
}

impl RawFile {
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = File::open(path)?;
        Ok(Self { file: Some(file) })
    }
}

impl GuestTransport for RawFile {
    fn read_raw(&mut self, paddr: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        file.seek(SeekFrom::Start(paddr))?;
        let mut buf = vec![0u8; len];
        let mut total = 0;
        loop {
            if total == len {
                break;
            }
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                // Partial read at EOF is reported, not retried.
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn registers(&mut self) -> Result<Registers, TransportError> {
        if self.file.is_none() {
            return Err(TransportError::Closed);
        }
        Ok(Registers {
            idtr: FIXED_IDTR,
            cr3: FIXED_CR3,
            cr4: FIXED_CR4,
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.file = None;
        Ok(())
    }
}
