//! Drives the full orchestrator (KASLR resolution through legacy-mode
//! decode) against a synthetic raw-file guest image, exercising the same
//! code path `main` does for a paused-guest snapshot.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use dmesg_extract::orchestrator;

const START_KERNEL_MAP: u64 = 0xffffffff80000000;

fn write_u64_at(file: &mut File, paddr: u64, offset_in_page: usize, value: u64) {
    file.seek(SeekFrom::Start(paddr + offset_in_page as u64))
        .unwrap();
    file.write_all(&value.to_le_bytes()).unwrap();
}

fn set_pte_entry(file: &mut File, table_base: u64, index: usize, value: u64) {
    write_u64_at(file, table_base, index * 8, value);
}

#[test]
fn decodes_legacy_log_from_a_raw_file_snapshot_end_to_end() {
    // Registers RawFile reports unconditionally (see raw_file.rs).
    let cr3 = 0x19872000u64;
    let idtr = 0xffffffffff528000u64;

    let pgd_base = cr3; // already 4K-aligned, no PTI bit set
    let pud_base = 0x19873000u64;
    let pmd_base = 0x19874000u64;
    let pte_base = 0x19875000u64;
    let idtr_paddr = 0x19876000u64; // idtr's low 12 bits are already 0

    let kaslr_offset = 0x2000000u64;
    let divide_error_vmlinux = 0xffffffff81000000u64;
    let idt_table_vmlinux = 0xffffffff82000000u64;
    let divide_error_runtime = divide_error_vmlinux.wrapping_add(kaslr_offset);

    // phys_base per the kaslr resolver's step-6 formula, computed here only
    // to know where to place the log_buf fixture bytes.
    let phys_base = idtr_paddr.wrapping_sub(
        idt_table_vmlinux
            .wrapping_add(kaslr_offset)
            .wrapping_sub(START_KERNEL_MAP),
    );

    let log_buf_runtime = START_KERNEL_MAP + 0x1000;
    let log_buf_len_runtime = START_KERNEL_MAP + 0x2000;
    let log_buf_vmlinux = log_buf_runtime.wrapping_sub(kaslr_offset);
    let log_buf_len_vmlinux = log_buf_len_runtime.wrapping_sub(kaslr_offset);

    let log_buf_phys = (log_buf_runtime - START_KERNEL_MAP) + phys_base;
    let log_buf_len_phys = (log_buf_len_runtime - START_KERNEL_MAP) + phys_base;

    let mut image = tempfile::NamedTempFile::new().unwrap();
    let file = image.as_file_mut();
    file.set_len(0x19880000).unwrap();

    // A non-NUL, non-printable leading byte so the classifier can't
    // mistake this binary image for the text System.map.
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&[0xFFu8; 16]).unwrap();

    // Walk pgd -> pud -> pmd -> pte for `idtr`.
    let pgd_index = ((idtr >> 39) & 511) as usize;
    let pud_index = ((idtr >> 30) & 511) as usize;
    let pmd_index = ((idtr >> 21) & 511) as usize;
    let pte_index = ((idtr >> 12) & 511) as usize;
    set_pte_entry(&mut file, pgd_base, pgd_index, pud_base);
    set_pte_entry(&mut file, pud_base, pud_index, pmd_base);
    set_pte_entry(&mut file, pmd_base, pmd_index, pte_base);
    set_pte_entry(&mut file, pte_base, pte_index, idtr_paddr & !0xFFF);

    // The 16-byte gate_desc at idtr_paddr, packing divide_error_runtime.
    file.seek(SeekFrom::Start(idtr_paddr)).unwrap();
    file.write_all(&((divide_error_runtime & 0xFFFF) as u16).to_le_bytes())
        .unwrap();
    file.seek(SeekFrom::Start(idtr_paddr + 6)).unwrap();
    file.write_all(&(((divide_error_runtime >> 16) & 0xFFFF) as u16).to_le_bytes())
        .unwrap();
    file.seek(SeekFrom::Start(idtr_paddr + 8)).unwrap();
    file.write_all(&(((divide_error_runtime >> 32) & 0xFFFFFFFF) as u32).to_le_bytes())
        .unwrap();

    // log_buf_len: a little-endian u32 holding the text length.
    let text = b"hello from the guest\0";
    file.seek(SeekFrom::Start(log_buf_len_phys)).unwrap();
    file.write_all(&(text.len() as u32).to_le_bytes()).unwrap();

    // log_buf: the legacy contiguous text buffer itself.
    file.seek(SeekFrom::Start(log_buf_phys)).unwrap();
    file.write_all(text).unwrap();

    let mut system_map = tempfile::NamedTempFile::new().unwrap();
    writeln!(system_map, "{divide_error_vmlinux:x} T divide_error").unwrap();
    writeln!(system_map, "{idt_table_vmlinux:x} T idt_table").unwrap();
    writeln!(system_map, "{log_buf_vmlinux:x} T log_buf").unwrap();
    writeln!(system_map, "{log_buf_len_vmlinux:x} T log_buf_len").unwrap();

    let out = orchestrator::run(system_map.path(), image.path().to_str().unwrap()).unwrap();
    assert_eq!(out, "hello from the guest\n");

    std::fs::remove_file("dmesg.data").ok();
}
