//! Decodes the lockless printk descriptor ring (kernels >= v5.10).
//!
//! Grounded on `printk.c`'s `dump_lockless_record_log`/`dump_record`: the
//! `printk_ringbuffer` struct's two embedded sub-structures (`desc_ring`,
//! `text_data_ring`) are read as one blob and sliced by VMCOREINFO offset;
//! the `descs`, `infos`, and `data` pointers found inside that blob are
//! each read from the guest as their own separate, full-size snapshot.

use crate::error::{Error, Result};
use crate::memory::GuestMemoryProvider;
use crate::paging::{AddressKind, PagingEngine};
use crate::symbols::SymbolMap;
use crate::vmcoreinfo::VmcoreinfoMap;

use super::filter_byte;

/// The top two bits of `state_var` are flags; the rest is the descriptor's
/// identity. `DESC_ID_MASK` keeps everything but those two bits.
const DESC_ID_MASK: u64 = !(3u64 << 62);

/// `printk_info.ts_nsec`/`.text_len` and `prb_desc.{state_var,text_blk_lpos}`
/// offsets are ABI-stable across the kernel versions this decoder targets
/// and aren't exposed through VMCOREINFO, so (like the original tool) they
/// are hardcoded rather than derived.
const PRINTK_INFO_TS_NSEC_OFFSET: usize = 8;
const PRINTK_INFO_TEXT_LEN_OFFSET: usize = 16;
const PRB_DESC_STATE_VAR_OFFSET: usize = 0;
const PRB_DESC_TEXT_BLK_BEGIN_OFFSET: usize = 8;
const PRB_DESC_TEXT_BLK_NEXT_OFFSET: usize = 16;

/// A descriptor's state, encoded in the top two bits of `state_var`.
/// Printable only in `Committed` or `Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    Reserved,
    Committed,
    Finalized,
    Reusable,
    /// `id`'s low bits didn't match `state_var`'s identity bits: the
    /// descriptor has been recycled since this `id` was computed.
    Miss,
}

fn desc_state(id: u64, state_var: u64) -> DescState {
    if id & DESC_ID_MASK != state_var & DESC_ID_MASK {
        return DescState::Miss;
    }
    match (state_var >> 62) & 0x3 {
        0 => DescState::Reserved,
        1 => DescState::Committed,
        2 => DescState::Finalized,
        _ => DescState::Reusable,
    }
}

/// A one-shot snapshot of the pieces of `printk_ringbuffer` the decoder
/// needs: the descriptor count, the raw descriptor/info/data arrays, and
/// the byte size of the data ring. Created and dropped within a single
/// decode pass.
struct PrbMap {
    count: u64,
    desc_size: usize,
    info_size: usize,
    data_size: u64,
    descs: Vec<u8>,
    infos: Vec<u8>,
    data: Vec<u8>,
    head_id: u64,
    tail_id: u64,
}

impl PrbMap {
    fn snapshot(
        provider: &mut GuestMemoryProvider,
        paging: &mut PagingEngine,
        symbols: &SymbolMap,
        vmcoreinfo: &VmcoreinfoMap,
    ) -> Result<Self> {
        let prb_vaddr = u64::from_le_bytes(
            symbols
                .read_symbol(paging, provider, "prb", 8)?
                .try_into()
                .map_err(|_| Error::DecoderInconsistent("short read of `prb` pointer".into()))?,
        );

        let prb_size = vmcoreinfo.size_of("printk_ringbuffer")? as usize;
        let prb_blob = paging.readmem(provider, prb_vaddr, AddressKind::Kvaddr, prb_size)?;

        let desc_ring_off = vmcoreinfo.offset_of("printk_ringbuffer", "desc_ring")? as usize;
        let text_data_ring_off =
            vmcoreinfo.offset_of("printk_ringbuffer", "text_data_ring")? as usize;

        let desc_ring = &prb_blob[desc_ring_off..];
        let count_bits_off = vmcoreinfo.offset_of("prb_desc_ring", "count_bits")? as usize;
        let count_bits = read_u32(desc_ring, count_bits_off)?;
        let count = 1u64 << count_bits;

        let descs_ptr_off = vmcoreinfo.offset_of("prb_desc_ring", "descs")? as usize;
        let descs_ptr = read_u64(desc_ring, descs_ptr_off)?;
        let infos_ptr_off = vmcoreinfo.offset_of("prb_desc_ring", "infos")? as usize;
        let infos_ptr = read_u64(desc_ring, infos_ptr_off)?;
        let head_id_off = vmcoreinfo.offset_of("prb_desc_ring", "head_id")? as usize;
        let head_id = read_u64(desc_ring, head_id_off)?;
        let tail_id_off = vmcoreinfo.offset_of("prb_desc_ring", "tail_id")? as usize;
        let tail_id = read_u64(desc_ring, tail_id_off)?;

        let text_data_ring = &prb_blob[text_data_ring_off..];
        let size_bits_off = vmcoreinfo.offset_of("prb_data_ring", "size_bits")? as usize;
        let size_bits = read_u32(text_data_ring, size_bits_off)?;
        let data_size = 1u64 << size_bits;
        let data_ptr_off = vmcoreinfo.offset_of("prb_data_ring", "data")? as usize;
        let data_ptr = read_u64(text_data_ring, data_ptr_off)?;

        let desc_size = vmcoreinfo.size_of("prb_desc")? as usize;
        let info_size = vmcoreinfo.size_of("printk_info")? as usize;

        let descs = paging.readmem(
            provider,
            descs_ptr,
            AddressKind::Kvaddr,
            desc_size * count as usize,
        )?;
        let infos = paging.readmem(
            provider,
            infos_ptr,
            AddressKind::Kvaddr,
            info_size * count as usize,
        )?;
        let data = paging.readmem(provider, data_ptr, AddressKind::Kvaddr, data_size as usize)?;

        Ok(Self {
            count,
            desc_size,
            info_size,
            data_size,
            descs,
            infos,
            data,
            head_id,
            tail_id,
        })
    }

    fn decode_record(&self, id: u64) -> Option<String> {
        let slot = (id % self.count) as usize;
        let desc_off = slot * self.desc_size;
        let state_var = read_u64(&self.descs, desc_off + PRB_DESC_STATE_VAR_OFFSET).ok()?;

        match desc_state(id, state_var) {
            DescState::Committed | DescState::Finalized => {}
            _ => return None,
        }

        let info_off = slot * self.info_size;
        let ts_nsec = read_u64(&self.infos, info_off + PRINTK_INFO_TS_NSEC_OFFSET).ok()?;
        let text_len = read_u16(&self.infos, info_off + PRINTK_INFO_TEXT_LEN_OFFSET).ok()? as u64;

        let mut begin =
            read_u64(&self.descs, desc_off + PRB_DESC_TEXT_BLK_BEGIN_OFFSET).ok()? % self.data_size;
        let next =
            read_u64(&self.descs, desc_off + PRB_DESC_TEXT_BLK_NEXT_OFFSET).ok()? % self.data_size;

        let secs = ts_nsec / 1_000_000_000;
        let micros = (ts_nsec % 1_000_000_000) / 1000;
        let mut line = format!("[{secs:5}.{micros:06}] ");

        if begin == next {
            line.push('\n');
            return Some(line);
        }

        if begin > next {
            begin = 0;
        }
        begin += 8; // skip the in-ring block header (owning descriptor id).

        let avail = next.saturating_sub(begin);
        let text_len = text_len.min(avail);

        let start = begin as usize;
        let end = (begin + text_len).min(self.data_size) as usize;
        if let Some(bytes) = self.data.get(start..end) {
            for &b in bytes {
                line.push(filter_byte(b));
            }
        }
        line.push('\n');
        Some(line)
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::DecoderInconsistent(format!("short read at offset {offset}")))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    buf.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| Error::DecoderInconsistent(format!("short read at offset {offset}")))
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    buf.get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or_else(|| Error::DecoderInconsistent(format!("short read at offset {offset}")))
}

/// Decodes every printable descriptor from `tail_id` to `head_id`
/// inclusive.
pub fn decode(
    provider: &mut GuestMemoryProvider,
    paging: &mut PagingEngine,
    symbols: &SymbolMap,
    vmcoreinfo: &VmcoreinfoMap,
) -> Result<String> {
    let prb = PrbMap::snapshot(provider, paging, symbols, vmcoreinfo)?;

    let mut out = String::new();
    let mut id = prb.tail_id;
    loop {
        if let Some(line) = prb.decode_record(id) {
            out.push_str(&line);
        }
        if id == prb.head_id {
            break;
        }
        id = (id + 1) & DESC_ID_MASK;
    }
    Ok(out)
}
