//! Remote Export Resolver (C3): resolves an ordinal in a remote module's
//! export directory to an absolute address, by walking the PE export
//! directory with a handful of `GetDWORD` calls - never by reading the
//! module's bytes locally.
//!
//! The address-table walk below is transcribed from `dll_linker.cpp`'s
//! `GetExportAddress`, offset for offset.

use std::collections::HashMap;

use crate::exports;
use crate::facade::DebuggerFacade;
use crate::Error;

const PE_HEADER_POINTER: u32 = 0x3C;
const EXPORT_TABLE_OFFSET: u32 = 0x78;
const EXPORT_NUM_FUNCTIONS_OFFSET: u32 = 0x14;
const EXPORT_DIRECTORY_ADDRESS_OF_FUNCTIONS_OFFSET: u32 = 0x1C;

fn get_dword(facade: &dyn DebuggerFacade, addr: u32, what: &str) -> Result<u32, Error> {
    facade.get_dword(addr).ok_or_else(|| Error::TransportFailure {
        detail: format!("GetDWORD({addr:#x}) failed while {what}"),
    })
}

/// Resolve `ordinal` (1-based) against the export directory of the module
/// whose image starts at `image_base`, performing no caching of its own.
pub fn resolve_ordinal(facade: &dyn DebuggerFacade, image_base: u32, ordinal: u32) -> Result<u32, Error> {
    if ordinal == 0 {
        return Err(Error::ResolutionFailure {
            module: format!("{image_base:#x}"),
            locator: "ordinal 0".to_string(),
        });
    }

    let pe_header = get_dword(facade, image_base + PE_HEADER_POINTER, "reading PE header offset")?;
    let export_table = get_dword(
        facade,
        image_base + pe_header + EXPORT_TABLE_OFFSET,
        "reading export table offset",
    )?;
    let export_table_base = image_base.wrapping_add(export_table);

    let num_exports = get_dword(
        facade,
        export_table_base + EXPORT_NUM_FUNCTIONS_OFFSET,
        "reading export count",
    )?;

    let index = ordinal - 1;
    if index >= num_exports {
        return Err(Error::ResolutionFailure {
            module: format!("{image_base:#x}"),
            locator: format!("ordinal {ordinal}"),
        });
    }

    let address_of_functions = get_dword(
        facade,
        export_table_base + EXPORT_DIRECTORY_ADDRESS_OF_FUNCTIONS_OFFSET,
        "reading address-of-functions RVA",
    )?;

    let function_rva = get_dword(
        facade,
        image_base + address_of_functions + index * 4,
        "reading function RVA",
    )?;

    Ok(image_base.wrapping_add(function_rva))
}

/// Per-process cache of module base addresses, resolved ordinal->address
/// tables, and export name->ordinal tables. A cache hit for `(module, ordinal)`
/// performs zero `GetDWORD` calls (§8 invariant 6).
#[derive(Default)]
pub struct ResolverCache {
    module_base: HashMap<String, u32>,
    module_exports: HashMap<String, HashMap<u32, u32>>,
    module_export_names: HashMap<String, HashMap<String, u32>>,
}

impl ResolverCache {
    /// A fresh cache, seeded with the known `xbdm.dll`/`xboxkrnl.exe` name
    /// tables from [`crate::exports`].
    pub fn new() -> Self {
        let mut cache = ResolverCache::default();
        cache.module_export_names.insert("xbdm.dll".to_string(), exports::xbdm_exports());
        cache
            .module_export_names
            .insert("xboxkrnl.exe".to_string(), exports::xboxkrnl_exports());
        cache
    }

    /// The cached base address of `module`, fetching and caching it via
    /// [`DebuggerFacade::get_module`] if this is the first lookup.
    pub fn base_address(&mut self, facade: &dyn DebuggerFacade, module: &str) -> Result<u32, Error> {
        if let Some(&base) = self.module_base.get(module) {
            return Ok(base);
        }
        let descriptor = facade.get_module(module).ok_or_else(|| Error::TransportFailure {
            detail: format!("GetModule({module}) failed"),
        })?;
        self.module_base.insert(module.to_string(), descriptor.base_address);
        self.module_exports.entry(module.to_string()).or_default();
        Ok(descriptor.base_address)
    }

    /// Resolve `name` against `module`'s export-name table, without touching
    /// the console - fails if no name table is registered for `module`.
    pub fn ordinal_for_name(&self, module: &str, name: &str) -> Result<u32, Error> {
        let table = self
            .module_export_names
            .get(module)
            .ok_or_else(|| Error::ResolutionFailure {
                module: module.to_string(),
                locator: format!("name {name} (no name table for module)"),
            })?;
        table.get(name).copied().ok_or_else(|| Error::ResolutionFailure {
            module: module.to_string(),
            locator: format!("name {name}"),
        })
    }

    /// A cached resolution for `(module, ordinal)`, if any - without touching the console.
    pub fn cached_export(&self, module: &str, ordinal: u32) -> Option<u32> {
        self.module_exports.get(module).and_then(|t| t.get(&ordinal)).copied()
    }

    /// Record a resolution obtained through some other channel (e.g. the
    /// bulk `ldxt!r` protocol in [`crate::dynloader`]) into the cache.
    pub fn cache_export(&mut self, module: &str, ordinal: u32, address: u32) {
        self.module_exports.entry(module.to_string()).or_default().insert(ordinal, address);
    }

    /// Resolve `ordinal` in `module`, consulting the cache first.
    pub fn resolve(&mut self, facade: &dyn DebuggerFacade, module: &str, ordinal: u32) -> Result<u32, Error> {
        let base = self.base_address(facade, module)?;
        if let Some(&address) = self.module_exports.get(module).and_then(|t| t.get(&ordinal)) {
            return Ok(address);
        }

        let address = resolve_ordinal(facade, base, ordinal)?;
        self.module_exports.entry(module.to_string()).or_default().insert(ordinal, address);
        Ok(address)
    }
}
