//! Composes the Guest Memory Provider, Symbol Map, KASLR Resolver, VMCOREINFO
//! loader, and printk decoder into a single snapshot run.
//!
//! Grounded on `main.c`'s `main`, which runs the same nine steps serially.

use std::path::Path;

use log::{info, warn};

use crate::context::Context;
use crate::error::Result;
use crate::kaslr;
use crate::memory::{open_transport, GuestMemoryProvider};
use crate::printk;
use crate::symbols::SymbolMap;
use crate::vmcoreinfo::VmcoreinfoMap;

/// Runs steps 1-9 and returns the fully decoded kernel log text.
pub fn run(system_map: &Path, guest_access: &str) -> Result<String> {
    info!("guest: {guest_access}");
    info!("System.map: {}", system_map.display());

    // 1-2: classify the access argument and build the provider.
    let transport = open_transport(guest_access)?;
    let provider = GuestMemoryProvider::new(transport);

    // 3: load System.map.
    let symbols = SymbolMap::load(system_map)?;

    // 4: MachineSpec defaults are set by Context::new.
    let mut ctx = Context::new(provider, symbols);

    // 5: run the KASLR resolver against the live registers.
    let regs = ctx.provider.registers()?;
    let resolution = kaslr::resolve(&mut ctx.provider, &mut ctx.paging, &ctx.symbols, regs.cr3, regs.idtr)?;
    ctx.paging.spec.phys_base = resolution.phys_base;
    ctx.symbols.set_relocate(resolution.relocate);

    // 6: page_offset_base override, if the guest kernel exports it.
    if ctx.symbols.exists("page_offset_base") {
        match ctx.symbols.read_symbol(&mut ctx.paging, &mut ctx.provider, "page_offset_base", 8) {
            Ok(bytes) => {
                let page_offset = u64::from_le_bytes(bytes.try_into().unwrap());
                ctx.paging.spec.page_offset = page_offset;
            }
            Err(e) => warn!("page_offset_base override unavailable: {e}"),
        }
    }

    // 7: load VMCOREINFO; only the lockless path requires it to succeed.
    ctx.vmcoreinfo = match VmcoreinfoMap::load(&mut ctx.provider, &mut ctx.paging, &ctx.symbols) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!("VMCOREINFO unavailable: {e}");
            None
        }
    };

    // 8: probe and run the appropriate printk decoder.
    let text = printk::decode(
        &mut ctx.provider,
        &mut ctx.paging,
        &ctx.symbols,
        ctx.vmcoreinfo.as_ref(),
    )?;

    // 9: release resources.
    ctx.close()?;

    Ok(text)
}
