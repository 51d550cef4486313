//! The PE Image Loader (C2): parses a PE32 DLL, materializes its image,
//! relocates it against a caller-chosen base, and patches every import slot.
//!
//! This module performs no I/O; it is pure data transformation, callable
//! without a [`crate::facade::DebuggerFacade`] at all. All console I/O lives
//! in [`crate::resolver`], [`crate::bootstrap`], [`crate::dynloader`] and
//! [`crate::orchestrator`].

use std::collections::BTreeMap;

use crate::pe::{import, relocation, tls, parse_portable_executable};
use crate::pe::import::LibraryImport;
use crate::Error;

/// A parsed, materializable PE32 DLL image - the "DXT Library" of the data model.
pub struct DxtLibrary {
    path: String,
    image: Vec<u8>,
    imports: BTreeMap<String, Vec<LibraryImport>>,
    relocations: Vec<u8>,
    entrypoint_rva: u32,
    tls_dir_rva: u32,
    tls_dir_size: u32,
    image_base: u32,
}

impl DxtLibrary {
    /// Parse a PE32 DLL from `bytes`. `path` is a logical label used only
    /// for diagnostics (a file path, or e.g. `"bundled dynamic loader"`).
    pub fn parse(bytes: &[u8], path: &str) -> Result<Self, Error> {
        let pe = parse_portable_executable(bytes, path)?;
        if !pe.is_supported_i386_pe32() {
            return Err(Error::UnsupportedImage {
                path: path.to_string(),
                detail: "only 32-bit, Machine=I386 PE32 images are supported".to_string(),
            });
        }
        let optional = pe.optional_header_32.expect("checked by is_supported_i386_pe32");

        let image_size = optional.size_of_image;
        let mut image = vec![0u8; image_size as usize];

        for section in &pe.section_table {
            let virtual_address = section.virtual_address;
            let raw_size = section.size_of_raw_data;
            let virtual_size = section.virtual_size;
            let copy_len = if virtual_size != 0 { raw_size.min(virtual_size) } else { raw_size };

            if copy_len == 0 {
                continue;
            }

            let dest_end = virtual_address as u64 + copy_len as u64;
            if dest_end > image_size as u64 {
                return Err(Error::SectionOutOfImage {
                    path: path.to_string(),
                    name: section.get_name().unwrap_or_default(),
                    rva: virtual_address,
                    size: copy_len,
                    image_size,
                });
            }

            let src_start = section.pointer_to_raw_data as usize;
            let src_end = src_start + copy_len as usize;
            let src = bytes.get(src_start..src_end).ok_or_else(|| {
                Error::SectionOutOfImage {
                    path: path.to_string(),
                    name: section.get_name().unwrap_or_default(),
                    rva: virtual_address,
                    size: copy_len,
                    image_size,
                }
            })?;

            image[virtual_address as usize..virtual_address as usize + copy_len as usize]
                .copy_from_slice(src);
        }

        let data_directories = optional.data_directories;
        let imports = import::parse_import_directory(
            &image,
            data_directories.import_table.virtual_address,
            data_directories.import_table.size,
            path,
        )?;

        let reloc_dir = data_directories.base_relocation_table;
        let relocations = if reloc_dir.size == 0 {
            Vec::new()
        } else {
            let start = reloc_dir.virtual_address as usize;
            let end = start + reloc_dir.size as usize;
            image
                .get(start..end)
                .ok_or_else(|| Error::offset_out_of_range(start, image.len()))?
                .to_vec()
        };

        Ok(DxtLibrary {
            path: path.to_string(),
            image,
            imports,
            relocations,
            entrypoint_rva: optional.address_of_entry_point,
            tls_dir_rva: data_directories.tls_table.virtual_address,
            tls_dir_size: data_directories.tls_table.size,
            image_base: optional.image_base,
        })
    }

    /// `SizeOfImage` - the size the image must be allocated at on the console.
    pub fn image_size(&self) -> u32 {
        self.image.len() as u32
    }

    /// The current image base: as declared in the header until [`Self::relocate`] runs.
    pub fn image_base(&self) -> u32 {
        self.image_base
    }

    /// Mutable access to every DLL's import list, keyed by DLL name. Callers
    /// (the resolver) fill in `resolved_address` before calling [`Self::relocate`].
    pub fn imports(&mut self) -> &mut BTreeMap<String, Vec<LibraryImport>> {
        &mut self.imports
    }

    /// Read-only access to the import map.
    pub fn imports_ref(&self) -> &BTreeMap<String, Vec<LibraryImport>> {
        &self.imports
    }

    /// The materialized image, ready to upload once [`Self::relocate`] has run.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Number of imports with `resolved_address == 0`.
    fn unresolved_count(&self) -> usize {
        self.imports
            .values()
            .flat_map(|v| v.iter())
            .filter(|i| i.resolved_address == 0)
            .count()
    }

    /// Patch every import slot, then apply base relocations for a load at
    /// `new_base`. Fails (without mutating `image`) if any import is still
    /// unresolved.
    pub fn relocate(&mut self, new_base: u32) -> Result<(), Error> {
        let unresolved = self.unresolved_count();
        if unresolved > 0 {
            return Err(Error::UnresolvedImports { path: self.path.clone(), count: unresolved });
        }

        for import in self.imports.values().flat_map(|v| v.iter()) {
            let slot = import.iat_slot_rva as usize;
            self.image
                .get_mut(slot..slot + 4)
                .ok_or_else(|| Error::offset_out_of_range(slot, self.image.len()))?
                .copy_from_slice(&import.resolved_address.to_le_bytes());
        }

        let delta = new_base as i64 - self.image_base as i64;
        relocation::apply_relocations(&mut self.image, &self.relocations, delta)?;

        self.image_base = new_base;
        Ok(())
    }

    /// Absolute entrypoint address: `AddressOfEntryPoint + image_base`.
    /// Meaningful before relocation too (using the declared base).
    pub fn entrypoint(&self) -> u32 {
        self.image_base.wrapping_add(self.entrypoint_rva)
    }

    /// Absolute addresses of any TLS initializer callbacks. Never invoked by
    /// this loader (§1 Non-goal) - only used to detect and refuse TLS DLLs.
    pub fn tls_initializers(&self) -> Result<Vec<u32>, Error> {
        tls::parse_tls_initializers(&self.image, self.tls_dir_rva, self.tls_dir_size, self.image_base)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A minimal, hand-assembled PE32 DLL used across this crate's tests:
    //! one `.text` section, one import (`ordinal 1` from `FAKE.dll`), an
    //! optional `.reloc` directory, and a caller-supplied entrypoint.

    pub struct FixtureOptions {
        pub declared_base: u32,
        pub entry_rva: u32,
        pub reloc_page_offsets: Vec<u16>,
        pub with_tls: bool,
    }

    impl Default for FixtureOptions {
        fn default() -> Self {
            FixtureOptions {
                declared_base: 0x1_0000,
                entry_rva: 0x1000,
                reloc_page_offsets: vec![0x10],
                with_tls: false,
            }
        }
    }

    pub fn build(options: &FixtureOptions) -> Vec<u8> {
        const FILE_ALIGN: u32 = 0x200;
        const SECTION_ALIGN: u32 = 0x1000;
        const HEADERS_SIZE: u32 = 0x400;

        let text_rva = SECTION_ALIGN;
        let iat_rva = text_rva + 0x200;
        let reloc_rva = text_rva + 0x400;

        // Layout of the one import: FAKE.dll, ordinal 1, ordinal thunk.
        let descriptor_rva = iat_rva;
        let int_rva = iat_rva + 0x40;
        let name_rva = iat_rva + 0x60;
        let iat_slot_rva = iat_rva + 0x80;

        let reloc_entries_len = {
            let mut len = options.reloc_page_offsets.len() * 2;
            if len % 4 != 0 {
                len += 2;
            }
            len
        };
        let reloc_size = if options.reloc_page_offsets.is_empty() {
            0
        } else {
            8 + reloc_entries_len as u32
        };

        let tls_dir_rva = iat_rva + 0xA0;
        let tls_callback_array_rva = iat_rva + 0xC0;

        let section_size = 0x1000u32;
        let size_of_image = text_rva + section_size;

        let mut file = vec![0u8; HEADERS_SIZE as usize];
        file[0x3c..0x3e].copy_from_slice(&0x80u16.to_le_bytes());
        file[0x80..0x84].copy_from_slice(b"PE\0\0");
        // COFF header at 0x84 (20 bytes): machine=I386, sections=1, size_of_optional_header=224.
        file[0x84..0x86].copy_from_slice(&0x14cu16.to_le_bytes());
        file[0x86..0x88].copy_from_slice(&1u16.to_le_bytes());
        file[0x94..0x96].copy_from_slice(&224u16.to_le_bytes());

        // Optional header at 0xA4, PE32, 224 bytes (96 fixed + 16*8 data directories).
        let opt = 0xA4usize;
        file[opt..opt + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
        file[opt + 16..opt + 20].copy_from_slice(&options.entry_rva.to_le_bytes());
        file[opt + 28..opt + 32].copy_from_slice(&options.declared_base.to_le_bytes());
        file[opt + 32..opt + 36].copy_from_slice(&SECTION_ALIGN.to_le_bytes());
        file[opt + 36..opt + 40].copy_from_slice(&FILE_ALIGN.to_le_bytes());
        file[opt + 56..opt + 60].copy_from_slice(&size_of_image.to_le_bytes());
        file[opt + 60..opt + 64].copy_from_slice(&HEADERS_SIZE.to_le_bytes());
        file[opt + 92..opt + 96].copy_from_slice(&16u32.to_le_bytes());

        let data_dirs = opt + 96;
        // Import table: directory index 1.
        file[data_dirs + 8..data_dirs + 12].copy_from_slice(&descriptor_rva.to_le_bytes());
        file[data_dirs + 12..data_dirs + 16].copy_from_slice(&20u32.to_le_bytes());
        // Base relocation table: directory index 5.
        if reloc_size > 0 {
            file[data_dirs + 40..data_dirs + 44].copy_from_slice(&reloc_rva.to_le_bytes());
            file[data_dirs + 44..data_dirs + 48].copy_from_slice(&reloc_size.to_le_bytes());
        }
        // TLS table: directory index 9.
        if options.with_tls {
            file[data_dirs + 72..data_dirs + 76].copy_from_slice(&tls_dir_rva.to_le_bytes());
            file[data_dirs + 76..data_dirs + 80].copy_from_slice(&24u32.to_le_bytes());
        }

        // Section header table at opt+224 (one entry, 40 bytes).
        let section_header = opt + 224;
        file[section_header..section_header + 8].copy_from_slice(b".text\0\0\0");
        file[section_header + 8..section_header + 12].copy_from_slice(&section_size.to_le_bytes());
        file[section_header + 12..section_header + 16].copy_from_slice(&text_rva.to_le_bytes());
        file[section_header + 16..section_header + 20].copy_from_slice(&section_size.to_le_bytes());
        file[section_header + 20..section_header + 24].copy_from_slice(&HEADERS_SIZE.to_le_bytes());

        // Section raw data, appended after the headers.
        let mut section_data = vec![0u8; section_size as usize];

        let rel = |rva: u32| (rva - text_rva) as usize;

        // Import descriptor.
        section_data[rel(descriptor_rva)..rel(descriptor_rva) + 4]
            .copy_from_slice(&int_rva.to_le_bytes());
        section_data[rel(descriptor_rva) + 12..rel(descriptor_rva) + 16]
            .copy_from_slice(&name_rva.to_le_bytes());
        section_data[rel(descriptor_rva) + 16..rel(descriptor_rva) + 20]
            .copy_from_slice(&iat_slot_rva.to_le_bytes());
        // INT: one ordinal thunk (ordinal 1), then terminator.
        section_data[rel(int_rva)..rel(int_rva) + 4]
            .copy_from_slice(&(0x8000_0001u32).to_le_bytes());
        // DLL name.
        section_data[rel(name_rva)..rel(name_rva) + 9].copy_from_slice(b"FAKE.dll\0");

        // .reloc directory content, relative to the same section for simplicity.
        if reloc_size > 0 {
            let reloc_off = rel(reloc_rva);
            section_data[reloc_off..reloc_off + 4].copy_from_slice(&text_rva.to_le_bytes());
            section_data[reloc_off + 4..reloc_off + 8].copy_from_slice(&reloc_size.to_le_bytes());
            let mut entry_off = reloc_off + 8;
            for &page_offset in &options.reloc_page_offsets {
                let entry = (3u16 << 12) | (page_offset & 0x0FFF);
                section_data[entry_off..entry_off + 2].copy_from_slice(&entry.to_le_bytes());
                entry_off += 2;
            }
        }

        if options.with_tls {
            let tls_off = rel(tls_dir_rva);
            let callback_va = options.declared_base + tls_callback_array_rva;
            section_data[tls_off + 12..tls_off + 16].copy_from_slice(&callback_va.to_le_bytes());
            let cb_off = rel(tls_callback_array_rva);
            section_data[cb_off..cb_off + 4]
                .copy_from_slice(&(options.declared_base + 0x2000).to_le_bytes());
        }

        file.extend_from_slice(&section_data);
        file
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{build, FixtureOptions};
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn s1_parse_relocate_entrypoint() {
        let bytes = build(&FixtureOptions { entry_rva: 0x1000, declared_base: 0xF00D, ..Default::default() });
        let mut lib = DxtLibrary::parse(&bytes, "s1").unwrap();
        assert_eq!(lib.entrypoint(), 0xF00D + 0x1000);

        // Relocate fails: the one import is still unresolved.
        assert!(lib.relocate(0xF00D).is_err());
        assert_eq!(lib.image_base(), 0xF00D);

        for imports in lib.imports().values_mut() {
            for import in imports.iter_mut() {
                import.resolved_address = 0x0BADF00D;
            }
        }

        lib.relocate(0xF00D).unwrap();
        assert_eq!(lib.entrypoint(), 0x1000D);
    }

    #[test]
    fn relocate_refuses_unresolved_imports_without_mutating_image() {
        let bytes = build(&FixtureOptions::default());
        let mut lib = DxtLibrary::parse(&bytes, "precondition").unwrap();
        let before = lib.image().to_vec();
        assert!(lib.relocate(0x2_0000).is_err());
        assert_eq!(lib.image(), before.as_slice());
    }

    #[test]
    fn tls_initializers_detected() {
        let bytes = build(&FixtureOptions { with_tls: true, ..Default::default() });
        let mut lib = DxtLibrary::parse(&bytes, "tls").unwrap();
        for imports in lib.imports().values_mut() {
            for import in imports.iter_mut() {
                import.resolved_address = 0x1234;
            }
        }
        lib.relocate(lib.image_base()).unwrap();
        let callbacks = lib.tls_initializers().unwrap();
        assert_eq!(callbacks.len(), 1);
    }

    proptest! {
        #[test]
        fn relocation_linearity(b1 in 0x1_0000u32..0x8000_0000, delta in 1u32..0x1000_0000) {
            let b2 = b1.wrapping_add(delta);
            let bytes = build(&FixtureOptions { declared_base: b1, ..Default::default() });

            let mut lib1 = DxtLibrary::parse(&bytes, "lin1").unwrap();
            let mut lib2 = DxtLibrary::parse(&bytes, "lin2").unwrap();
            for lib in [&mut lib1, &mut lib2] {
                for imports in lib.imports().values_mut() {
                    for import in imports.iter_mut() {
                        import.resolved_address = b1;
                    }
                }
            }
            lib1.relocate(b1).unwrap();
            lib2.relocate(b2).unwrap();

            // The reloc'd page offset (0x10) lives at RVA text_rva + 0x10.
            let rva = 0x1000 + 0x10;
            let w1 = u32::from_le_bytes(lib1.image()[rva..rva + 4].try_into().unwrap());
            let w2 = u32::from_le_bytes(lib2.image()[rva..rva + 4].try_into().unwrap());
            prop_assert_eq!(w2.wrapping_sub(w1), b2.wrapping_sub(b1));
        }

        #[test]
        fn entrypoint_translation(base in 0u32..0xFFFF_0000) {
            let bytes = build(&FixtureOptions { entry_rva: 0x1000, declared_base: 0x1_0000, ..Default::default() });
            let mut lib = DxtLibrary::parse(&bytes, "entry").unwrap();
            for imports in lib.imports().values_mut() {
                for import in imports.iter_mut() {
                    import.resolved_address = base;
                }
            }
            lib.relocate(base).unwrap();
            prop_assert_eq!(lib.entrypoint(), base.wrapping_add(0x1000));
        }
    }
}
