//! Parses a `System.map`-format symbol table and resolves the small,
//! allow-listed set of symbols the rest of the engine needs.
//!
//! Grounded on `symbols.c`: the same allow-list, the same hash index
//! formula, and first-insertion-wins semantics on duplicate names within a
//! bucket chain.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::warn;

use crate::error::{Error, Result};
use crate::memory::GuestMemoryProvider;
use crate::paging::{AddressKind, PagingEngine};

/// Symbol names the engine ever looks up. Anything else in `System.map` is
/// parsed and discarded.
const ALLOWED_SYMBOLS: &[&str] = &[
    "log_first_idx",
    "log_next_idx",
    "log_buf",
    "log_end",
    "log_buf_len",
    "divide_error",
    "asm_exc_divide_error",
    "idt_table",
    "vmcoreinfo_data",
    "vmcoreinfo_size",
    "page_offset_base",
    "vmalloc_base",
    "prb",
];

const HASH_BUCKETS: usize = 512;

fn hash_index(name: &str) -> usize {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return 0;
    }
    let first = bytes[0] as i32;
    let last = bytes[bytes.len() - 1] as i32;
    let mid = bytes[bytes.len() / 2] as i32;
    ((first ^ (last * mid)).rem_euclid(HASH_BUCKETS as i32)) as usize
}

/// A bucketed hash table of resolved symbols, mirroring `symname_hash` in
/// the original tool. `HashMap` would be the obvious idiomatic choice on
/// its own, but the lookup contract here (first-insertion-wins on
/// duplicate names, intentionally not "last wins") is part of the observed
/// behavior, so duplicates are tracked explicitly rather than silently
/// overwritten by a second `insert`.
pub struct SymbolMap {
    buckets: Vec<Vec<(String, u64)>>,
    /// `relocate` as set by the KASLR resolver; `None` until then, at which
    /// point `read_symbol` starts applying it.
    relocate: Option<u64>,
}

impl SymbolMap {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut map = Self {
            buckets: (0..HASH_BUCKETS).map(|_| Vec::new()).collect(),
            relocate: None,
        };
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let Some(addr_str) = fields.next() else {
                continue;
            };
            let Some(_kind) = fields.next() else {
                continue;
            };
            let Some(name) = fields.next() else {
                continue;
            };
            let Ok(addr) = u64::from_str_radix(addr_str, 16) else {
                continue;
            };
            if ALLOWED_SYMBOLS.contains(&name) {
                map.install(name, addr);
            }
        }
        Ok(map)
    }

    fn install(&mut self, name: &str, value: u64) {
        let idx = hash_index(name);
        let bucket = &mut self.buckets[idx];
        if !bucket.iter().any(|(n, _)| n == name) {
            bucket.push((name.to_string(), value));
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.buckets[hash_index(name)]
            .iter()
            .any(|(n, _)| n == name)
    }

    pub fn value(&self, name: &str) -> Result<u64> {
        self.buckets[hash_index(name)]
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| Error::SymbolMissing(name.to_string()))
    }

    /// Sets `relocate` once KASLR resolution completes. Reads issued before
    /// this point (there should be none) are unaffected.
    pub fn set_relocate(&mut self, relocate: u64) {
        self.relocate = Some(relocate);
    }

    /// The runtime virtual address of `name`: its `System.map` value with
    /// `relocate` applied, once KASLR resolution has set it.
    pub fn runtime_vaddr(&self, name: &str) -> Result<u64> {
        let vaddr = self.value(name)?;
        Ok(match self.relocate {
            Some(relocate) => vaddr.wrapping_sub(relocate),
            None => vaddr,
        })
    }

    /// Reads `size` bytes at the runtime virtual address of `name`,
    /// applying `relocate` if it has been set. Soft failure (symbol
    /// missing) is surfaced as `Error::SymbolMissing`; callers on a
    /// selector path may choose to log and fall through instead of
    /// propagating it.
    pub fn read_symbol(
        &self,
        paging: &mut PagingEngine,
        provider: &mut GuestMemoryProvider,
        name: &str,
        size: usize,
    ) -> Result<Vec<u8>> {
        let runtime_vaddr = self.runtime_vaddr(name)?;
        paging
            .readmem(provider, runtime_vaddr, AddressKind::Kvaddr, size)
            .map_err(|e| {
                warn!("failed to read symbol {name}: {e}");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_index_matches_formula() {
        // "prb": p=0x70, r=0x72, b=0x62; last='b', mid = bytes[len/2] = bytes[1] = 'r'
        let expected = (b'p' as i32 ^ (b'b' as i32 * b'r' as i32)).rem_euclid(512) as usize;
        assert_eq!(hash_index("prb"), expected);
    }

    #[test]
    fn loads_only_allow_listed_symbols() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "ffffffff81000000 T divide_error").unwrap();
        writeln!(f, "ffffffff81000100 T not_a_tracked_symbol").unwrap();
        writeln!(f, "ffffffff82000000 T idt_table").unwrap();
        let map = SymbolMap::load(f.path()).unwrap();
        assert!(map.exists("divide_error"));
        assert!(map.exists("idt_table"));
        assert!(!map.exists("not_a_tracked_symbol"));
        assert_eq!(map.value("divide_error").unwrap(), 0xffffffff81000000);
    }

    #[test]
    fn first_insertion_wins_on_duplicate_name() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "ffffffff81000000 T prb").unwrap();
        writeln!(f, "ffffffff89999999 T prb").unwrap();
        let map = SymbolMap::load(f.path()).unwrap();
        assert_eq!(map.value("prb").unwrap(), 0xffffffff81000000);
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let map = SymbolMap::load(f.path()).unwrap();
        assert!(map.value("prb").is_err());
    }
}
