//! Derives `kaslr_offset` and `phys_base` by correlating the guest's live
//! IDTR with a known `System.map` symbol.
//!
//! Grounded on `main.c`'s `calc_kaslr_offset`/`derive_kaslr_offset` and
//! `x86_64_post_reloc`.

use log::info;

use crate::error::{Error, Result};
use crate::memory::GuestMemoryProvider;
use crate::paging::{AddressKind, PagingEngine};
use crate::symbols::SymbolMap;

const PTI_BIT: u64 = 1 << 12;
const START_KERNEL_MAP: u64 = 0xffffffff80000000;

/// Result of a successful KASLR resolution, applied to [`PagingEngine`]'s
/// `MachineSpec` and [`SymbolMap`]'s relocation by the caller.
#[derive(Debug, Clone, Copy)]
pub struct KaslrResolution {
    pub kaslr_offset: u64,
    pub phys_base: u64,
    pub relocate: u64,
}

/// Runs the KASLR-reconciliation algorithm and returns the derived offsets.
/// Any memory read failure aborts with a fatal diagnostic; no partial
/// state is returned.
pub fn resolve(
    provider: &mut GuestMemoryProvider,
    paging: &mut PagingEngine,
    symbols: &SymbolMap,
    cr3: u64,
    idtr: u64,
) -> Result<KaslrResolution> {
    let divide_error_vmlinux = if symbols.exists("asm_exc_divide_error") {
        symbols.value("asm_exc_divide_error")?
    } else {
        symbols.value("divide_error")?
    };
    let idt_table_vmlinux = symbols.value("idt_table")?;

    // Step 1-2: clear PCID bits and the PTI user/kernel root-table bit,
    // then prime the PGD cache slot directly from the resulting base.
    let pgd = cr3 & !(0xFFF | PTI_BIT);
    paging.prime_pgd(provider, pgd)?;

    // Step 3: translate the live IDTR (kernel-virtual) to physical.
    let idtr_paddr = paging.kvtop(provider, cr3, idtr)?;

    // Step 4: read the 16-byte gate_desc at idtr_paddr and reassemble the
    // packed offset fields into the divide-error ISR's runtime address.
    let gate_desc = paging.readmem(provider, idtr_paddr, AddressKind::Physaddr, 16)?;
    let divide_error_vmcore = parse_gate_desc_offset(&gate_desc)?;

    // Step 5-6.
    let kaslr_offset = divide_error_vmcore.wrapping_sub(divide_error_vmlinux);
    let phys_base = idtr_paddr.wrapping_sub(
        idt_table_vmlinux
            .wrapping_add(kaslr_offset)
            .wrapping_sub(START_KERNEL_MAP),
    );

    // Step 7: relocate = -kaslr_offset, two's-complement, via wrapping
    // negation rather than signed arithmetic.
    let relocate = kaslr_offset.wrapping_neg();

    info!("kaslr_offset={kaslr_offset:#x} phys_base={phys_base:#x}");

    Ok(KaslrResolution {
        kaslr_offset,
        phys_base,
        relocate,
    })
}

/// A `gate_desc` is a 16-byte x86_64 interrupt gate descriptor. The ISR
/// entry point is packed across three non-contiguous 16-bit/16-bit/32-bit
/// fields: offset_low at bytes [0:2), offset_middle at [6:8), offset_high
/// at [8:12).
fn parse_gate_desc_offset(gate_desc: &[u8]) -> Result<u64> {
    if gate_desc.len() < 16 {
        return Err(Error::TranslationFailed {
            kind: "gate_desc",
            addr: gate_desc.len() as u64,
        });
    }
    let offset_low = u16::from_le_bytes(gate_desc[0..2].try_into().unwrap()) as u64;
    let offset_middle = u16::from_le_bytes(gate_desc[6..8].try_into().unwrap()) as u64;
    let offset_high = u32::from_le_bytes(gate_desc[8..12].try_into().unwrap()) as u64;
    Ok((offset_high << 32) | (offset_middle << 16) | offset_low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GuestTransport, Registers, TransportError};
    use crate::paging::MachineSpec;
    use std::collections::HashMap;

    struct FakePhysMem {
        pages: HashMap<u64, Vec<u8>>,
    }

    impl GuestTransport for FakePhysMem {
        fn read_raw(&mut self, paddr: u64, len: usize) -> Result<Vec<u8>, TransportError> {
            let page_base = paddr & !0xFFF;
            let page = self
                .pages
                .get(&page_base)
                .cloned()
                .unwrap_or(vec![0u8; 4096]);
            let offset = (paddr - page_base) as usize;
            Ok(page[offset..offset + len].to_vec())
        }

        fn registers(&mut self) -> Result<Registers, TransportError> {
            Ok(Registers {
                idtr: 0,
                cr3: 0,
                cr4: 0,
            })
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn set_entry(page: &mut [u8], index: usize, value: u64) {
        page[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn parses_gate_desc_offset() {
        // offset 0xffffffff83000000 packed as low/middle/high.
        let offset: u64 = 0xffffffff83000000;
        let mut gate = vec![0u8; 16];
        gate[0..2].copy_from_slice(&((offset & 0xFFFF) as u16).to_le_bytes());
        gate[6..8].copy_from_slice((((offset >> 16) & 0xFFFF) as u16).to_le_bytes().as_slice());
        gate[8..12].copy_from_slice(&(((offset >> 32) & 0xFFFFFFFF) as u32).to_le_bytes());
        assert_eq!(parse_gate_desc_offset(&gate).unwrap(), offset);
    }

    #[test]
    fn resolves_kaslr_offset_and_phys_base_per_fixture() {
        // Scenario 4 from the testable-properties scenario list, with
        // idtr_paddr adjusted from the scenario's literal 0x4000000 to
        // 0x5000000: per the step-6 formula, idtr_paddr = 0x4000000 would
        // self-consistently yield phys_base = 0, not the scenario's stated
        // 0x1000000. 0x5000000 is the value that actually satisfies the
        // formula for the scenario's stated kaslr_offset/phys_base pair.
        let divide_error_vmlinux = 0xffffffff81000000u64;
        let divide_error_runtime = 0xffffffff83000000u64;
        let idt_table_vmlinux = 0xffffffff82000000u64;
        let idtr = 0xffffffff84000000u64;
        let idtr_paddr = 0x5000000u64;
        let cr3 = 0x1000u64;

        let pgd_base = cr3 & !0xFFF;
        let mut pages = HashMap::new();
        let mut pgd = vec![0u8; 4096];
        set_entry(&mut pgd, ((idtr >> 39) & 511) as usize, 0x2000);
        pages.insert(pgd_base, pgd);
        let mut pud = vec![0u8; 4096];
        set_entry(&mut pud, ((idtr >> 30) & 511) as usize, 0x3000);
        pages.insert(0x2000, pud);
        let mut pmd = vec![0u8; 4096];
        set_entry(&mut pmd, ((idtr >> 21) & 511) as usize, 0x4000);
        pages.insert(0x3000, pmd);
        let mut pte = vec![0u8; 4096];
        let pte_base_phys = idtr_paddr & !0xFFF;
        set_entry(&mut pte, ((idtr >> 12) & 511) as usize, pte_base_phys);
        pages.insert(0x4000, pte);

        // Place the 16-byte gate_desc at idtr_paddr, packing
        // divide_error_runtime's offset fields.
        let mut gate_page = vec![0u8; 4096];
        let off = idtr_paddr as usize % 4096;
        gate_page[off..off + 2]
            .copy_from_slice(&((divide_error_runtime & 0xFFFF) as u16).to_le_bytes());
        gate_page[off + 6..off + 8]
            .copy_from_slice(&(((divide_error_runtime >> 16) & 0xFFFF) as u16).to_le_bytes());
        gate_page[off + 8..off + 12]
            .copy_from_slice(&(((divide_error_runtime >> 32) & 0xFFFFFFFF) as u32).to_le_bytes());
        pages.insert(pte_base_phys, gate_page);

        let transport = FakePhysMem { pages };
        let mut provider = GuestMemoryProvider::new(Box::new(transport));
        let mut paging = PagingEngine::new(MachineSpec::default());

        let mut map_file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(map_file, "ffffffff81000000 T divide_error").unwrap();
        writeln!(map_file, "ffffffff82000000 T idt_table").unwrap();
        let symbols = SymbolMap::load(map_file.path()).unwrap();

        let res = resolve(&mut provider, &mut paging, &symbols, cr3, idtr).unwrap();
        assert_eq!(res.kaslr_offset, 0x2000000);
        assert_eq!(res.phys_base, 0x1000000);
        assert_eq!(res.kaslr_offset.wrapping_add(res.relocate), 0);
    }
}
