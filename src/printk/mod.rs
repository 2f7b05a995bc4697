//! Detects which of the three in-kernel printk log representations the
//! guest uses and decodes it into timestamped text.
//!
//! Grounded on `main.c`'s mode-selection cascade and
//! `dump_variable_length_record_log`, and `printk.c`'s legacy walk and
//! `dump_lockless_record_log`.

mod lockless;

use std::fs;

use log::info;

use crate::error::Result;
use crate::memory::GuestMemoryProvider;
use crate::paging::{AddressKind, PagingEngine};
use crate::symbols::SymbolMap;
use crate::vmcoreinfo::VmcoreinfoMap;

/// `log_buf_len` is masked with `(1<<20) | ((1<<20)-1)` = `0x1FFFFF`,
/// capping the buffer at just under 2 MiB. Unusual, but preserved exactly
/// rather than "fixed" to a plain power-of-two mask. Applied in both the
/// legacy and variable-length paths, as the original does in each.
const LOG_BUF_LEN_MASK: u32 = 0x1FFFFF;

/// Record header layout for the variable-length buffer: ts_nsec(8) +
/// len(2) + text_len(2) + dict_len(2) + facility(1) + flags/level(1).
const VARLEN_RECORD_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Lockless,
    VariableLength,
    Legacy,
}

/// Probes the Symbol Map in priority order: lockless ring, then
/// variable-length buffer, then legacy contiguous buffer.
pub fn select_mode(symbols: &SymbolMap) -> Mode {
    if symbols.exists("prb") {
        Mode::Lockless
    } else if symbols.exists("log_first_idx") && symbols.exists("log_next_idx") {
        Mode::VariableLength
    } else {
        Mode::Legacy
    }
}

/// Replaces any byte that is neither ASCII-graphic nor ASCII-whitespace
/// with `.`, matching the output contract in the external interfaces.
fn filter_byte(b: u8) -> char {
    if b.is_ascii_graphic() || b.is_ascii_whitespace() {
        b as char
    } else {
        '.'
    }
}

pub fn decode(
    provider: &mut GuestMemoryProvider,
    paging: &mut PagingEngine,
    symbols: &SymbolMap,
    vmcoreinfo: Option<&VmcoreinfoMap>,
) -> Result<String> {
    match select_mode(symbols) {
        Mode::Lockless => {
            let vmcoreinfo = vmcoreinfo.ok_or_else(|| {
                crate::error::Error::VmcoreinfoMissing(
                    "lockless decoder selected but VMCOREINFO was not loaded".into(),
                )
            })?;
            info!("printk mode: lockless descriptor ring");
            lockless::decode(provider, paging, symbols, vmcoreinfo)
        }
        Mode::VariableLength => {
            info!("printk mode: variable-length record buffer");
            decode_variable_length(provider, paging, symbols)
        }
        Mode::Legacy => {
            info!("printk mode: legacy contiguous text buffer");
            decode_legacy(provider, paging, symbols)
        }
    }
}

fn log_buf_bytes(
    provider: &mut GuestMemoryProvider,
    paging: &mut PagingEngine,
    symbols: &SymbolMap,
    len: usize,
) -> Result<Vec<u8>> {
    let log_buf_ptr = u64::from_le_bytes(
        symbols
            .read_symbol(paging, provider, "log_buf", 8)?
            .try_into()
            .unwrap(),
    );
    paging.readmem(provider, log_buf_ptr, AddressKind::Kvaddr, len)
}

/// Reads the entire `log_buf` and walks it byte-by-byte. Only a NUL byte
/// ends a line (emitting one newline, only if something was written since
/// the last one); a non-NUL, non-ASCII byte (`>= 0x80`) is silently
/// dropped and has no effect on line state, matching `ascii()`'s signed-char
/// range check in the original rather than treating it as a boundary.
fn decode_legacy(
    provider: &mut GuestMemoryProvider,
    paging: &mut PagingEngine,
    symbols: &SymbolMap,
) -> Result<String> {
    let log_buf_len_raw = u32::from_le_bytes(
        symbols
            .read_symbol(paging, provider, "log_buf_len", 4)?
            .try_into()
            .unwrap(),
    );
    let len = (log_buf_len_raw & LOG_BUF_LEN_MASK) as usize;

    let buf = log_buf_bytes(provider, paging, symbols, len)?;

    // Supplemental: dump the raw captured bytes to dmesg.data, as the
    // original tool's legacy path does via write_data_to_file.
    if let Err(e) = fs::write("dmesg.data", &buf) {
        log::warn!("failed to write dmesg.data: {e}");
    }

    let mut out = String::new();
    let mut next_line = false;
    for &b in &buf {
        if b != 0 {
            if b < 0x80 {
                out.push(b as char);
                next_line = true;
            }
            // Non-ASCII, non-NUL: dropped, `next_line` untouched.
        } else if next_line {
            out.push('\n');
            next_line = false;
        }
    }
    if next_line {
        out.push('\n');
    }
    Ok(out)
}

/// Iterates the ring of fixed-layout records between `log_first_idx` and
/// `log_next_idx`. Preserves the source's early-truncation behavior: the
/// loop stops as soon as `idx >= log_buf_len`, even mid-legitimate-wrap.
fn decode_variable_length(
    provider: &mut GuestMemoryProvider,
    paging: &mut PagingEngine,
    symbols: &SymbolMap,
) -> Result<String> {
    let log_first_idx = u32::from_le_bytes(
        symbols
            .read_symbol(paging, provider, "log_first_idx", 4)?
            .try_into()
            .unwrap(),
    ) as usize;
    let log_next_idx = u32::from_le_bytes(
        symbols
            .read_symbol(paging, provider, "log_next_idx", 4)?
            .try_into()
            .unwrap(),
    ) as usize;
    let log_buf_len = (u32::from_le_bytes(
        symbols
            .read_symbol(paging, provider, "log_buf_len", 4)?
            .try_into()
            .unwrap(),
    ) & LOG_BUF_LEN_MASK) as usize;

    let buf = log_buf_bytes(provider, paging, symbols, log_buf_len)?;

    let mut out = String::new();
    let mut idx = log_first_idx;
    while idx != log_next_idx {
        if idx + VARLEN_RECORD_HEADER_SIZE > buf.len() {
            break;
        }
        let ts_nsec = u64::from_le_bytes(buf[idx..idx + 8].try_into().unwrap());
        let len = u16::from_le_bytes(buf[idx + 8..idx + 10].try_into().unwrap());
        let text_len = u16::from_le_bytes(buf[idx + 10..idx + 12].try_into().unwrap()) as usize;

        if len == 0 {
            // Ring wrap sentinel.
            idx = 0;
            continue;
        }

        let text_start = idx + VARLEN_RECORD_HEADER_SIZE;
        let text_end = (text_start + text_len).min(buf.len());
        let secs = ts_nsec / 1_000_000_000;
        let micros = (ts_nsec % 1_000_000_000) / 1000;
        out.push_str(&format!("[{secs:5}.{micros:06}] "));
        if let Some(text) = buf.get(text_start..text_end) {
            for &b in text {
                out.push(filter_byte(b));
            }
        }
        out.push('\n');

        idx += len as usize;
        if idx >= log_buf_len {
            break;
        }
    }
    Ok(out)
}
