//! Bundles the state a single run threads through every component, in
//! place of the process-wide globals (`pc->machine_specified`, the
//! Symbol Map singleton, …) the original tool kept.

use crate::error::Result;
use crate::memory::GuestMemoryProvider;
use crate::paging::{MachineSpec, PagingEngine};
use crate::symbols::SymbolMap;
use crate::vmcoreinfo::VmcoreinfoMap;

/// Everything a run needs after `System.map` is loaded and the guest
/// transport is open, but before KASLR resolution has run.
pub struct Context {
    pub provider: GuestMemoryProvider,
    pub paging: PagingEngine,
    pub symbols: SymbolMap,
    pub vmcoreinfo: Option<VmcoreinfoMap>,
}

impl Context {
    pub fn new(provider: GuestMemoryProvider, symbols: SymbolMap) -> Self {
        Self {
            provider,
            paging: PagingEngine::new(MachineSpec::default()),
            symbols,
            vmcoreinfo: None,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.provider.close()?;
        Ok(())
    }
}
