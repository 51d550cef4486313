//! Import directory parsing.
//!
//! Walks `IMAGE_IMPORT_DESCRIPTOR` entries and their thunk arrays directly
//! inside an already-materialized image buffer (RVAs are valid offsets into
//! that buffer once sections have been copied to their virtual addresses).

use std::collections::BTreeMap;

use crate::Error;

/// High bit of a 32-bit thunk: set when the thunk encodes an ordinal rather
/// than a hint/name RVA.
const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;

/// One unresolved import slot.
///
/// Invariant: if `import_name` is `Some`, it overrides `ordinal` during
/// resolution; otherwise `ordinal` is used. `resolved_address` starts at
/// zero and must be non-zero before [`crate::library::DxtLibrary::relocate`]
/// will proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryImport {
    /// 1-based export ordinal to resolve against, when `import_name` is `None`.
    pub ordinal: u32,
    /// Import-by-name, when the thunk carried a hint/name RVA instead of an ordinal.
    pub import_name: Option<String>,
    /// RVA (within the materialized image) of the 4-byte IAT slot to patch.
    pub iat_slot_rva: u32,
    /// Resolved absolute address; zero until a resolver fills it in.
    pub resolved_address: u32,
}

impl LibraryImport {
    /// The ordinal or name this import resolves against, for diagnostics.
    pub fn locator(&self) -> String {
        match &self.import_name {
            Some(name) => format!("name {name}"),
            None => format!("ordinal {}", self.ordinal),
        }
    }
}

struct ImportDescriptor {
    original_first_thunk: u32,
    name_rva: u32,
    first_thunk: u32,
}

fn read_u32(image: &[u8], rva: u32) -> Result<u32, Error> {
    let offset = rva as usize;
    image
        .get(offset..offset + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| Error::offset_out_of_range(offset, image.len()))
}

fn read_u16(image: &[u8], rva: u32) -> Result<u16, Error> {
    let offset = rva as usize;
    image
        .get(offset..offset + 2)
        .map(|s| u16::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| Error::offset_out_of_range(offset, image.len()))
}

fn read_cstr(image: &[u8], rva: u32, path: &str) -> Result<String, Error> {
    let start = rva as usize;
    let bytes = image
        .get(start..)
        .ok_or_else(|| Error::offset_out_of_range(start, image.len()))?;
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::UnresolvableImportName { path: path.to_string(), rva })?;
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| Error::UnresolvableImportName { path: path.to_string(), rva })
}

fn read_descriptor(image: &[u8], rva: u32) -> Result<ImportDescriptor, Error> {
    Ok(ImportDescriptor {
        original_first_thunk: read_u32(image, rva)?,
        name_rva: read_u32(image, rva + 12)?,
        first_thunk: read_u32(image, rva + 16)?,
    })
}

/// Parse the import directory into a `DLL name -> [LibraryImport]` map.
///
/// `import_table_rva` is the `DataDirectories::import_table.virtual_address`
/// of the image; zero (or a zero-size directory) means "no imports".
pub fn parse_import_directory(
    image: &[u8],
    import_table_rva: u32,
    import_table_size: u32,
    path: &str,
) -> Result<BTreeMap<String, Vec<LibraryImport>>, Error> {
    let mut imports = BTreeMap::new();
    if import_table_rva == 0 || import_table_size == 0 {
        return Ok(imports);
    }

    let mut descriptor_rva = import_table_rva;
    const DESCRIPTOR_SIZE: u32 = 20;
    loop {
        let descriptor = read_descriptor(image, descriptor_rva)?;
        if descriptor.original_first_thunk == 0
            && descriptor.name_rva == 0
            && descriptor.first_thunk == 0
        {
            break;
        }

        let dll_name = read_cstr(image, descriptor.name_rva, path)?;

        // Prefer the original thunk table (INT) if present - it is never
        // overwritten by the loader - falling back to the IAT itself.
        let thunk_table_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        };

        let mut slot_list = Vec::new();
        let mut index = 0u32;
        loop {
            let thunk = read_u32(image, thunk_table_rva + index * 4)?;
            if thunk == 0 {
                break;
            }

            let iat_slot_rva = descriptor.first_thunk + index * 4;
            let import = if thunk & IMAGE_ORDINAL_FLAG32 != 0 {
                LibraryImport {
                    ordinal: thunk & 0xFFFF,
                    import_name: None,
                    iat_slot_rva,
                    resolved_address: 0,
                }
            } else {
                let name = read_cstr(image, thunk + 2, path)?;
                LibraryImport {
                    ordinal: 0,
                    import_name: Some(name),
                    iat_slot_rva,
                    resolved_address: 0,
                }
            };
            slot_list.push(import);
            index += 1;
        }

        imports.entry(dll_name).or_insert_with(Vec::new).extend(slot_list);
        descriptor_rva += DESCRIPTOR_SIZE;
    }

    Ok(imports)
}
