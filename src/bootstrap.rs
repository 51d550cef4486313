//! Stage-1 and Stage-2 Bootstrap Drivers (C5, C6): the two code implants that
//! turn a bare XBDM connection into a console that understands `ldxt!`
//! commands.
//!
//! Grounded on `loader.cpp`'s `InjectLoader`/`InstallL2Loader`/
//! `L1BootstrapAllocatePool`/`SetL1LoaderExecuteMode`/`InvokeL1Bootstrap`.
//! The precompiled L1/L2 machine-code blobs are caller-supplied byte slices
//! (§1: "explicitly out of scope... emitting/building the pre-compiled Xbox
//! machine-code payloads"); this module only patches, uploads and drives them.

use crate::facade::DebuggerFacade;
use crate::Error;

/// `xbdm.dll` ordinal of `DmResumeThread`, the function L1 temporarily replaces.
pub const DM_RESUME_THREAD_ORDINAL: u32 = 35;

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().unwrap())
}

/// RAII guard over the window in which `DmResumeThread` holds the L1 payload.
/// `Drop` restores the saved original bytes unconditionally, so any early `?`
/// return while the window is open still leaves XBDM's `DmResumeThread`
/// byte-identical to how it was found.
pub struct L1Window<'a> {
    facade: &'a dyn DebuggerFacade,
    dm_resume_thread: u32,
    original_bytes: Vec<u8>,
    io_cell_address: u32,
}

impl<'a> L1Window<'a> {
    /// Save `DmResumeThread`'s current bytes and patch in the L1 payload.
    /// The IO cell is the last 4 bytes of `l1_payload`, at a known absolute
    /// address once patched in.
    pub fn open(facade: &'a dyn DebuggerFacade, dm_resume_thread: u32, l1_payload: &[u8]) -> Result<Self, Error> {
        if l1_payload.len() < 4 {
            return Err(Error::UnsupportedFeature("L1 payload must be at least 4 bytes (IO cell)"));
        }

        let original_bytes = facade
            .get_memory(dm_resume_thread, l1_payload.len() as u32)
            .ok_or_else(|| Error::TransportFailure {
                detail: "failed to read original DmResumeThread bytes".to_string(),
            })?;

        if !facade.set_memory(dm_resume_thread, l1_payload) {
            return Err(Error::TransportFailure {
                detail: "failed to patch DmResumeThread with L1 payload".to_string(),
            });
        }

        let io_cell_address = dm_resume_thread + l1_payload.len() as u32 - 4;

        Ok(L1Window { facade, dm_resume_thread, original_bytes, io_cell_address })
    }

    /// Primitive 1: allocate `size` bytes of pool via L1, returning the
    /// allocated address. Zero is a failure.
    pub fn allocate_pool(&self, size: u32, dm_allocate_pool_with_tag: u32) -> Result<u32, Error> {
        if !self.facade.set_memory(self.io_cell_address, &size.to_le_bytes()) {
            return Err(Error::TransportFailure { detail: "failed to set allocation size".to_string() });
        }

        if !self.facade.resume(dm_allocate_pool_with_tag) {
            return Err(Error::TransportFailure { detail: "L1 resume (allocate) failed".to_string() });
        }

        let address = self
            .facade
            .get_dword(self.io_cell_address)
            .ok_or_else(|| Error::TransportFailure { detail: "failed to read allocated address".to_string() })?;

        if address == 0 {
            return Err(Error::RemoteAllocationFailure { size });
        }

        Ok(address)
    }

    /// Primitive 2: switch L1 into "treat next Resume parameter as a function
    /// pointer to call" mode.
    pub fn set_execute_mode(&self) -> Result<(), Error> {
        if !self.facade.set_memory(self.io_cell_address, &0u32.to_le_bytes()) {
            return Err(Error::TransportFailure { detail: "failed to set L1 execute mode".to_string() });
        }
        Ok(())
    }

    /// Primitive 3: with L1 in execute mode, transfer control to `target`.
    pub fn invoke(&self, target: u32) -> Result<(), Error> {
        if !self.facade.resume(target) {
            return Err(Error::TransportFailure { detail: "L1 resume (invoke) failed".to_string() });
        }
        Ok(())
    }
}

impl Drop for L1Window<'_> {
    fn drop(&mut self) {
        if !self.facade.set_memory(self.dm_resume_thread, &self.original_bytes) {
            log::error!(
                "failed to restore original DmResumeThread bytes at {:#x} - xbdm.dll is left patched",
                self.dm_resume_thread
            );
        }
    }
}

/// Patch the L2 payload's last-12-bytes import table placeholder with the
/// three resolved `xbdm.dll` addresses, in the fixed order
/// [`crate::exports::STAGE2_IMPORTS`] declares.
pub fn patch_l2_imports(l2_payload: &mut [u8], dm_free_pool: u32, dm_allocate_pool_with_tag: u32, dm_register_command_processor: u32) -> Result<(), Error> {
    if l2_payload.len() < 12 {
        return Err(Error::UnsupportedFeature("L2 payload must be at least 12 bytes (import table)"));
    }
    let start = l2_payload.len() - 12;
    l2_payload[start..start + 4].copy_from_slice(&dm_free_pool.to_le_bytes());
    l2_payload[start + 4..start + 8].copy_from_slice(&dm_allocate_pool_with_tag.to_le_bytes());
    l2_payload[start + 8..start + 12].copy_from_slice(&dm_register_command_processor.to_le_bytes());
    Ok(())
}

/// Run the full C5 → C6 sequence: patch `DmResumeThread` with `l1_payload`,
/// allocate room for `l2_payload`, upload it, and invoke its entrypoint - all
/// inside a single [`L1Window`] so original bytes are restored regardless of
/// outcome.
pub fn run(
    facade: &dyn DebuggerFacade,
    dm_resume_thread: u32,
    dm_free_pool: u32,
    dm_allocate_pool_with_tag: u32,
    dm_register_command_processor: u32,
    l1_payload: &[u8],
    l2_payload: &[u8],
) -> Result<(), Error> {
    let mut l2_payload = l2_payload.to_vec();
    patch_l2_imports(&mut l2_payload, dm_free_pool, dm_allocate_pool_with_tag, dm_register_command_processor)?;

    let window = L1Window::open(facade, dm_resume_thread, l1_payload)?;

    let l2_entrypoint = window.allocate_pool(l2_payload.len() as u32, dm_allocate_pool_with_tag)?;

    if !facade.set_memory(l2_entrypoint, &l2_payload) {
        return Err(Error::TransportFailure { detail: "failed to upload L2 bootstrap payload".to_string() });
    }

    window.set_execute_mode()?;
    window.invoke(l2_entrypoint)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{ModuleDescriptor, Request, Response};
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockFacade {
        memory: RefCell<HashMap<u32, Vec<u8>>>,
        resumes: RefCell<Vec<u32>>,
        next_allocation: u32,
    }

    impl MockFacade {
        fn write(&self, addr: u32, bytes: &[u8]) {
            self.memory.borrow_mut().insert(addr, bytes.to_vec());
        }
    }

    impl DebuggerFacade for MockFacade {
        fn get_memory(&self, addr: u32, len: u32) -> Option<Vec<u8>> {
            let mem = self.memory.borrow();
            let bytes = mem.get(&addr)?;
            if bytes.len() < len as usize {
                let mut padded = bytes.clone();
                padded.resize(len as usize, 0);
                return Some(padded);
            }
            Some(bytes[..len as usize].to_vec())
        }
        fn set_memory(&self, addr: u32, bytes: &[u8]) -> bool {
            self.write(addr, bytes);
            true
        }
        fn get_dword(&self, addr: u32) -> Option<u32> {
            let mem = self.memory.borrow();
            let bytes = mem.get(&addr)?;
            Some(read_u32_le(&bytes[..4]))
        }
        fn resume(&self, parameter: u32) -> bool {
            self.resumes.borrow_mut().push(parameter);
            // Simulate L1: when asked to allocate, write a deterministic
            // address into the io cell (last word of whatever occupies
            // dm_resume_thread).
            if parameter == 0xA110CA7E {
                let addr = *self
                    .memory
                    .borrow()
                    .keys()
                    .find(|&&k| k == DM_RESUME_THREAD)
                    .unwrap_or(&DM_RESUME_THREAD);
                let len = self.memory.borrow().get(&addr).map(|v| v.len()).unwrap_or(0);
                if len >= 4 {
                    let io_cell = addr + len as u32 - 4;
                    self.write(io_cell, &self.next_allocation.to_le_bytes());
                }
            }
            true
        }
        fn get_module(&self, _name: &str) -> Option<ModuleDescriptor> {
            None
        }
        fn send_command_sync(&self, _request: &Request) -> Response {
            Response::error()
        }
    }

    const DM_RESUME_THREAD: u32 = 0x8001_0000;

    #[test]
    fn s4_l1_allocate_and_teardown_restores_original_bytes() {
        let facade = MockFacade { next_allocation: 0xDEAD_BEEF, ..Default::default() };
        let original = vec![0xAAu8; 16];
        facade.write(DM_RESUME_THREAD, &original);

        let l1_payload = vec![0x90u8; 16];
        {
            let window = L1Window::open(&facade, DM_RESUME_THREAD, &l1_payload).unwrap();
            let allocated = window.allocate_pool(0x100, 0xA110CA7E).unwrap();
            assert_eq!(allocated, 0xDEAD_BEEF);
        }

        let restored = facade.get_memory(DM_RESUME_THREAD, 16).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn rejects_short_l1_payload() {
        let facade = MockFacade::default();
        let err = L1Window::open(&facade, DM_RESUME_THREAD, &[0u8; 2]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }

    #[test]
    fn patch_l2_imports_writes_addresses_in_order() {
        let mut payload = vec![0u8; 20];
        patch_l2_imports(&mut payload, 0x1000_0001, 0x1000_0002, 0x1000_0003).unwrap();
        let tail = &payload[8..];
        assert_eq!(read_u32_le(&tail[0..4]), 0x1000_0001);
        assert_eq!(read_u32_le(&tail[4..8]), 0x1000_0002);
        assert_eq!(read_u32_le(&tail[8..12]), 0x1000_0003);
    }
}
