//! TLS directory parsing.
//!
//! This loader never invokes TLS initializers (§1 Non-goals: "TLS-callback
//! execution") - it only extracts their addresses so [`crate::library`] can
//! refuse to install a DLL that declares them (§4.6, §8 S6).

use crate::Error;

/// Size, in bytes, of `IMAGE_TLS_DIRECTORY32`.
const TLS_DIRECTORY32_SIZE: u32 = 24;

fn read_u32(image: &[u8], rva: u32) -> Result<u32, Error> {
    let offset = rva as usize;
    image
        .get(offset..offset + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| Error::offset_out_of_range(offset, image.len()))
}

/// Parse the TLS directory (if present) into a list of absolute callback
/// addresses. `image_base` is the *current* (post-relocation) base, used to
/// translate the `AddressOfCallBacks` VA into an RVA into `image`.
pub fn parse_tls_initializers(
    image: &[u8],
    tls_dir_rva: u32,
    tls_dir_size: u32,
    image_base: u32,
) -> Result<Vec<u32>, Error> {
    if tls_dir_rva == 0 || tls_dir_size < TLS_DIRECTORY32_SIZE {
        return Ok(Vec::new());
    }

    let address_of_callbacks_va = read_u32(image, tls_dir_rva + 12)?;
    if address_of_callbacks_va == 0 {
        return Ok(Vec::new());
    }

    let callback_array_rva = address_of_callbacks_va.wrapping_sub(image_base);
    let mut callbacks = Vec::new();
    let mut offset = callback_array_rva;
    loop {
        let callback_va = read_u32(image, offset)?;
        if callback_va == 0 {
            break;
        }
        callbacks.push(callback_va);
        offset += 4;
    }

    Ok(callbacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_directory_yields_empty() {
        let image = vec![0u8; 0x100];
        assert_eq!(parse_tls_initializers(&image, 0, 0, 0x1000).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn parses_callback_array() {
        let mut image = vec![0u8; 0x200];
        let tls_dir_rva = 0x20u32;
        let image_base = 0x1000u32;
        let callback_array_rva = 0x100u32;
        image[(tls_dir_rva + 12) as usize..(tls_dir_rva + 16) as usize]
            .copy_from_slice(&(image_base + callback_array_rva).to_le_bytes());
        image[callback_array_rva as usize..callback_array_rva as usize + 4]
            .copy_from_slice(&0x1234_5678u32.to_le_bytes());

        let callbacks = parse_tls_initializers(&image, tls_dir_rva, 24, image_base).unwrap();
        assert_eq!(callbacks, vec![0x1234_5678]);
    }
}
