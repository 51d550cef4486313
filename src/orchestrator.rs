//! Install Orchestrator (C8): the process-wide singleton tying the bootstrap
//! drivers, the dynamic loader installer and the resolver cache into three
//! idempotent entry points.
//!
//! Grounded on `loader.cpp`'s `Loader::Bootstrap`/`Load`/`Install` (the
//! `ddxt!hello` probe, the create-on-first-use/destroy-on-failure lifecycle)
//! and SPEC_FULL.md §4.7's `OnceCell<Mutex<Option<Orchestrator>>>` mechanics.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;

use crate::bootstrap;
use crate::dynloader;
use crate::exports;
use crate::facade::{DebuggerFacade, Request};
use crate::resolver::ResolverCache;
use crate::wire;
use crate::Error;

/// The three precompiled machine-code blobs this crate never embeds or
/// fabricates (§1): the Stage-1 bootstrap, the Stage-2 bootstrap, and the
/// bundled dynamic loader DLL, supplied by the orchestrator's caller.
#[derive(Clone)]
pub struct BootstrapPayloads {
    /// Stage-1 payload, patched into `DmResumeThread`.
    pub l1: Vec<u8>,
    /// Stage-2 payload, uploaded and invoked by L1.
    pub l2: Vec<u8>,
    /// The bundled dynamic loader DLL, installed once L2 is running.
    pub dynamic_loader: Vec<u8>,
}

/// Process-wide installer state: a resolver cache plus whether the console's
/// loader is known to be running.
pub struct Orchestrator {
    cache: ResolverCache,
}

impl Orchestrator {
    fn new() -> Self {
        Orchestrator { cache: ResolverCache::new() }
    }

    fn probe_hello(facade: &dyn DebuggerFacade) -> bool {
        facade.send_command_sync(&Request::Text(wire::HELLO_COMMAND.to_string())).status.is_ok()
    }

    fn run_bootstrap(&mut self, facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads) -> Result<(), Error> {
        let dm_resume_thread = self.cache.resolve(facade, "xbdm.dll", bootstrap::DM_RESUME_THREAD_ORDINAL)?;
        let xbdm_base = self.cache.base_address(facade, "xbdm.dll")?;

        let dm_free_pool_ordinal = exports::xbdm_exports()["_DmFreePool@4"];
        let dm_allocate_pool_with_tag_ordinal = exports::xbdm_exports()["_DmAllocatePoolWithTag@8"];
        let dm_register_command_processor_ordinal = exports::xbdm_exports()["_DmRegisterCommandProcessor@8"];

        let dm_free_pool = self.cache.resolve(facade, "xbdm.dll", dm_free_pool_ordinal)?;
        let dm_allocate_pool_with_tag = self.cache.resolve(facade, "xbdm.dll", dm_allocate_pool_with_tag_ordinal)?;
        let dm_register_command_processor =
            self.cache.resolve(facade, "xbdm.dll", dm_register_command_processor_ordinal)?;

        log::debug!("bootstrapping against xbdm.dll at {xbdm_base:#x}, DmResumeThread at {dm_resume_thread:#x}");

        bootstrap::run(
            facade,
            dm_resume_thread,
            dm_free_pool,
            dm_allocate_pool_with_tag,
            dm_register_command_processor,
            &payloads.l1,
            &payloads.l2,
        )?;

        dynloader::install(facade, &mut self.cache, &payloads.dynamic_loader, "bundled dynamic loader")?;

        Ok(())
    }

    /// Bootstrap the console if it is not already running a dynamic loader,
    /// tearing down process-wide state on failure.
    pub fn bootstrap(facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads) -> bool {
        if Self::probe_hello(facade) {
            log::debug!("ddxt!hello succeeded - dynamic loader already installed");
            let _ = singleton().lock().unwrap().get_or_insert_with(Orchestrator::new);
            return true;
        }

        let mut guard = singleton().lock().unwrap();
        let mut orchestrator = guard.take().unwrap_or_else(Orchestrator::new);

        match orchestrator.run_bootstrap(facade, payloads) {
            Ok(()) => {
                *guard = Some(orchestrator);
                true
            }
            Err(err) => {
                log::error!("bootstrap failed: {err}");
                *guard = None;
                false
            }
        }
    }

    /// Read `path` from local disk and install it as a DynDXT.
    pub fn load(facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads, path: &Path) -> bool {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("failed to read {}: {err}", path.display());
                return false;
            }
        };
        Self::install(facade, payloads, &bytes)
    }

    /// Bootstrap if necessary, then upload `bytes` as a DynDXT via `ddxt!load`.
    pub fn install(facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads, bytes: &[u8]) -> bool {
        if !Self::bootstrap(facade, payloads) {
            log::error!("failed to bootstrap handler loader");
            return false;
        }

        let response = facade.send_command_sync(&Request::TextWithBinary(wire::LOAD_COMMAND.to_string(), bytes.to_vec()));
        if !response.status.is_ok() {
            log::error!("ddxt!load failed");
            return false;
        }
        true
    }
}

fn singleton() -> &'static Mutex<Option<Orchestrator>> {
    static SINGLETON: OnceCell<Mutex<Option<Orchestrator>>> = OnceCell::new();
    SINGLETON.get_or_init(|| Mutex::new(None))
}

/// Free-function mirror of [`Orchestrator::bootstrap`], for callers that
/// only ever deal with one console and don't want to name the type.
pub fn bootstrap(facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads) -> bool {
    Orchestrator::bootstrap(facade, payloads)
}

/// Free-function mirror of [`Orchestrator::load`].
pub fn load(facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads, path: &Path) -> bool {
    Orchestrator::load(facade, payloads, path)
}

/// Free-function mirror of [`Orchestrator::install`].
pub fn install(facade: &dyn DebuggerFacade, payloads: &BootstrapPayloads, bytes: &[u8]) -> bool {
    Orchestrator::install(facade, payloads, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{ModuleDescriptor, Response};
    use std::cell::RefCell;

    struct HelloFacade {
        writes: RefCell<u32>,
        resumes: RefCell<u32>,
    }

    impl DebuggerFacade for HelloFacade {
        fn get_memory(&self, _addr: u32, _len: u32) -> Option<Vec<u8>> {
            None
        }
        fn set_memory(&self, _addr: u32, _bytes: &[u8]) -> bool {
            *self.writes.borrow_mut() += 1;
            true
        }
        fn get_dword(&self, _addr: u32) -> Option<u32> {
            None
        }
        fn resume(&self, _parameter: u32) -> bool {
            *self.resumes.borrow_mut() += 1;
            true
        }
        fn get_module(&self, _name: &str) -> Option<ModuleDescriptor> {
            None
        }
        fn send_command_sync(&self, request: &Request) -> Response {
            if request.command() == wire::HELLO_COMMAND {
                Response::ok()
            } else {
                Response::error()
            }
        }
    }

    #[test]
    fn s5_bootstrap_idempotence_on_hello_ok() {
        let facade = HelloFacade { writes: RefCell::new(0), resumes: RefCell::new(0) };
        let payloads = BootstrapPayloads { l1: vec![], l2: vec![], dynamic_loader: vec![] };
        assert!(Orchestrator::bootstrap(&facade, &payloads));
        assert_eq!(*facade.writes.borrow(), 0);
        assert_eq!(*facade.resumes.borrow(), 0);
    }
}
