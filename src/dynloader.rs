//! Dynamic Loader Installer (C7): parses a PE32 DLL (the bundled dynamic
//! loader itself, or any later user DLL), resolves its imports in bulk via
//! the running console's `ldxt!r` command processor, allocates and relocates
//! it, and uploads it.
//!
//! Grounded on `loader.cpp`'s `InstallDynamicDXTLoader`/`ResolveImports`/
//! `L2BootstrapAllocate`/`L2BootstrapInstall`.

use crate::facade::{DebuggerFacade, Request};
use crate::library::DxtLibrary;
use crate::resolver::ResolverCache;
use crate::wire::{self, ResolutionTable, ResolveRequest};
use crate::Error;

/// Key identifying one import slot to resolve: (dll name, slot index within
/// that dll's import vector).
type ImportKey = (String, usize);

fn send_text(facade: &dyn DebuggerFacade, command: String) -> Result<String, Error> {
    let response = facade.send_command_sync(&Request::Text(command.clone()));
    if !response.status.is_ok() {
        return Err(Error::TransportFailure { detail: format!("command '{command}' failed") });
    }
    response.text().ok_or_else(|| Error::MalformedResponse(format!("no text body for '{command}'")))
}

fn resolve_imports(facade: &dyn DebuggerFacade, cache: &mut ResolverCache, lib: &mut DxtLibrary) -> Result<(), Error> {
    let dll_names: Vec<String> = lib.imports_ref().keys().cloned().collect();

    for dll_name in dll_names {
        let base = cache.base_address(facade, &dll_name)?;

        let mut table: ResolutionTable<ImportKey> = ResolutionTable::new();
        let imports = lib.imports().get_mut(&dll_name).expect("dll present");

        for (index, import) in imports.iter_mut().enumerate() {
            let ordinal = match &import.import_name {
                Some(name) => cache.ordinal_for_name(&dll_name, name)?,
                None => import.ordinal,
            };

            if let Some(address) = cache.cached_export(&dll_name, ordinal) {
                import.resolved_address = address;
                continue;
            }

            table.entry(base).or_default().push(ResolveRequest { ordinal, key: (dll_name.clone(), index) });
        }

        if table.values().all(|v| v.is_empty()) {
            continue;
        }

        for group in wire::split_resolution_table(&table) {
            let command = wire::build_resolve_command(&group);
            let expected: usize = group.values().map(|v| v.len()).sum();

            let response = facade.send_command_sync(&Request::BinaryQuery(command.clone()));
            if !response.status.is_ok() {
                return Err(Error::TransportFailure { detail: format!("bulk resolve '{command}' failed") });
            }
            let binary = response
                .binary()
                .ok_or_else(|| Error::MalformedResponse(format!("no binary body for '{command}'")))?;
            let addresses = wire::parse_resolve_response(binary, expected)?;

            let mut cursor = 0usize;
            for (&group_base, requests) in &group {
                for request in requests {
                    let address = addresses[cursor];
                    cursor += 1;
                    if address == 0 {
                        return Err(Error::ResolutionFailure {
                            module: format!("{group_base:#x}"),
                            locator: format!("ordinal {}", request.ordinal),
                        });
                    }
                    cache.cache_export(&dll_name, request.ordinal, address);
                    let (name, slot_index) = &request.key;
                    lib.imports().get_mut(name).expect("dll present")[*slot_index].resolved_address = address;
                }
            }
        }
    }

    Ok(())
}

/// Install `dll_bytes` through an already-running dynamic loader: resolve
/// every import, allocate room on the console, relocate, and upload.
pub fn install(facade: &dyn DebuggerFacade, cache: &mut ResolverCache, dll_bytes: &[u8], label: &str) -> Result<(), Error> {
    let mut lib = DxtLibrary::parse(dll_bytes, label)?;

    resolve_imports(facade, cache, &mut lib)?;

    let allocate_command = wire::build_allocate_command(lib.image_size());
    let response_text = send_text(facade, allocate_command)?;
    let target = wire::parse_allocate_response(&response_text)?;

    lib.relocate(target)?;

    let tls = lib.tls_initializers()?;
    if !tls.is_empty() {
        return Err(Error::UnsupportedFeature("TLS unsupported"));
    }

    let install_command = wire::build_install_command(lib.entrypoint());
    let response = facade.send_command_sync(&Request::TextWithBinary(install_command.clone(), lib.image().to_vec()));
    if !response.status.is_ok() {
        return Err(Error::TransportFailure { detail: format!("'{install_command}' failed") });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{ModuleDescriptor, Response, Status};
    use crate::library::fixtures::{build, FixtureOptions};
    use std::cell::RefCell;

    struct FakeFacade {
        module_base: u32,
        export_address: u32,
        allocate_base: u32,
        sent: RefCell<Vec<String>>,
    }

    impl DebuggerFacade for FakeFacade {
        fn get_memory(&self, _addr: u32, _len: u32) -> Option<Vec<u8>> {
            None
        }
        fn set_memory(&self, _addr: u32, _bytes: &[u8]) -> bool {
            true
        }
        fn get_dword(&self, _addr: u32) -> Option<u32> {
            None
        }
        fn resume(&self, _parameter: u32) -> bool {
            false
        }
        fn get_module(&self, name: &str) -> Option<ModuleDescriptor> {
            Some(ModuleDescriptor {
                name: name.to_string(),
                base_address: self.module_base,
                size: 0x10000,
                checksum: 0,
                timestamp: 0,
                is_tls: false,
                is_xbe: false,
            })
        }
        fn send_command_sync(&self, request: &Request) -> Response {
            self.sent.borrow_mut().push(request.command().to_string());
            if request.command().starts_with("ldxt!r") {
                Response { status: Status::OkBinary, body: crate::facade::ResponseBody::Binary(self.export_address.to_le_bytes().to_vec()) }
            } else if request.command().starts_with("ldxt!a") {
                Response::ok_text(format!("base=0x{:08x}", self.allocate_base))
            } else if request.command().starts_with("ldxt!i") {
                Response::ok()
            } else {
                Response::error()
            }
        }
    }

    #[test]
    fn installs_fixture_dll_through_bulk_resolution() {
        let bytes = build(&FixtureOptions::default());
        let facade = FakeFacade {
            module_base: 0x9000_0000,
            export_address: 0xBEEF_0000,
            allocate_base: 0x7000_0000,
            sent: RefCell::new(Vec::new()),
        };
        let mut cache = ResolverCache::new();
        install(&facade, &mut cache, &bytes, "fixture").unwrap();

        let sent = facade.sent.borrow();
        assert!(sent.iter().any(|c| c.starts_with("ldxt!r")));
        assert!(sent.iter().any(|c| c.starts_with("ldxt!a")));
        assert!(sent.iter().any(|c| c.starts_with("ldxt!i")));
    }

    #[test]
    fn refuses_tls_dll() {
        let bytes = build(&FixtureOptions { with_tls: true, ..Default::default() });
        let facade = FakeFacade {
            module_base: 0x9000_0000,
            export_address: 0xBEEF_0000,
            allocate_base: 0x7000_0000,
            sent: RefCell::new(Vec::new()),
        };
        let mut cache = ResolverCache::new();
        let err = install(&facade, &mut cache, &bytes, "fixture-tls").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }
}
