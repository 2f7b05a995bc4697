//! Reads and parses the kernel's embedded VMCOREINFO blob: a newline
//! separated `KEY=value` text stream describing struct sizes and member
//! offsets, needed by the lockless printk decoder.
//!
//! Grounded on `printk.c`'s `vmcoreinfo_init`/`datatype_info`/`offsets_init`.

use std::collections::HashMap;

use log::info;

use crate::error::{Error, Result};
use crate::memory::GuestMemoryProvider;
use crate::paging::{AddressKind, PagingEngine};
use crate::symbols::SymbolMap;

/// `vmcoreinfo_size` is masked to 13 bits, capping the blob at 8191 bytes.
const SIZE_MASK: u64 = (1 << 13) - 1;

/// Little-endian reinterpretation of the ASCII bytes `"OSRELEAS"`. Some
/// older kernels declare `vmcoreinfo_data` as an inline array rather than a
/// pointer; reading the first 8 bytes at the symbol's runtime address and
/// finding this magic means the symbol *is* the blob, not a pointer to it.
const OSRELEASE_ARRAY_MAGIC: u64 = 0x5341454c4552534f;

pub struct VmcoreinfoMap {
    entries: HashMap<String, String>,
}

impl VmcoreinfoMap {
    pub fn load(
        provider: &mut GuestMemoryProvider,
        paging: &mut PagingEngine,
        symbols: &SymbolMap,
    ) -> Result<Self> {
        let blob_vaddr = Self::resolve_blob_address(provider, paging, symbols)?;

        let raw_size = u64::from_le_bytes(
            symbols
                .read_symbol(paging, provider, "vmcoreinfo_size", 8)?
                .try_into()
                .map_err(|_| Error::VmcoreinfoMissing("vmcoreinfo_size read was short".into()))?,
        );
        let size = (raw_size & SIZE_MASK) as usize;

        let blob = paging.readmem(provider, blob_vaddr, AddressKind::Kvaddr, size)?;
        let text = String::from_utf8_lossy(&blob);

        let mut entries = HashMap::new();
        for line in text.split(['\n', '\0']) {
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.to_string(), value.to_string());
            }
        }

        if let Some(release) = entries.get("OSRELEASE") {
            info!("guest kernel release: {release}");
        }

        Ok(Self { entries })
    }

    fn resolve_blob_address(
        provider: &mut GuestMemoryProvider,
        paging: &mut PagingEngine,
        symbols: &SymbolMap,
    ) -> Result<u64> {
        let runtime_vaddr = symbols.runtime_vaddr("vmcoreinfo_data")?;
        let first_bytes = symbols.read_symbol(paging, provider, "vmcoreinfo_data", 8)?;
        let first_u64 = u64::from_le_bytes(
            first_bytes
                .try_into()
                .map_err(|_| Error::VmcoreinfoMissing("vmcoreinfo_data read was short".into()))?,
        );

        if first_u64 == OSRELEASE_ARRAY_MAGIC {
            Ok(runtime_vaddr)
        } else {
            Ok(first_u64)
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn os_release(&self) -> Option<&str> {
        self.get("OSRELEASE")
    }

    /// `SIZE(T)` lookup, e.g. `size_of("printk_info")`.
    pub fn size_of(&self, type_name: &str) -> Result<u64> {
        let key = format!("SIZE({type_name})");
        self.entries
            .get(&key)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::VmcoreinfoMissing(key))
    }

    /// `OFFSET(T.M)` lookup, e.g. `offset_of("prb_desc_ring", "count_bits")`.
    pub fn offset_of(&self, type_name: &str, member: &str) -> Result<u64> {
        let key = format!("OFFSET({type_name}.{member})");
        self.entries
            .get(&key)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::VmcoreinfoMissing(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_map(entries: &[(&str, &str)]) -> VmcoreinfoMap {
        VmcoreinfoMap {
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_size_and_offset_keys() {
        let map = fixture_map(&[
            ("SIZE(printk_info)", "48"),
            ("OFFSET(prb_desc_ring.count_bits)", "0"),
            ("OSRELEASE", "5.15.0-generic"),
        ]);
        assert_eq!(map.size_of("printk_info").unwrap(), 48);
        assert_eq!(map.offset_of("prb_desc_ring", "count_bits").unwrap(), 0);
        assert_eq!(map.os_release(), Some("5.15.0-generic"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let map = fixture_map(&[]);
        assert!(map.size_of("printk_info").is_err());
    }
}
