//! Wire-level building blocks for the `ldxt!`/`ddxt!` command set (C4 Bulk
//! Resolution Protocol, plus the allocate/install/hello commands used by
//! [`crate::bootstrap`], [`crate::dynloader`] and [`crate::orchestrator`]).
//!
//! Grounded on `ResolveExportList.cpp`/`.h` (command grammar and binary
//! response shape) and `loader.cpp`'s `SplitResolutionTable`/`L2BootstrapAllocate`/
//! `L2BootstrapInstall` (the exact command strings and splitting algorithm).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::Error;

/// Transport-defined maximum command length this loader will ever build a
/// single `ldxt!r` command up to. The original project reads this from its
/// transport layer; here it is a named, overridable constant since no
/// transport is in scope (§9 Open Question 1).
pub const MAXIMUM_SEND_LENGTH: usize = 2048;

/// `sizeof("ldxt!r")`, including the terminating NUL - matches the original's
/// `#define COMMAND_LEN sizeof("ldxt!r")`.
const COMMAND_LEN: usize = 7;

/// Length of a single `" b=0x00000000"` or `" o=0x00000000"` token.
pub const ADDR_LEN: usize = 13;

fn hex(value: u32) -> String {
    format!("0x{value:08X}")
}

/// One export to resolve: an ordinal plus the caller-supplied key used to
/// match the response back to a particular import slot.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<K> {
    /// Ordinal to resolve against the owning module base.
    pub ordinal: u32,
    /// Opaque key the caller uses to find this entry again in the response.
    pub key: K,
}

/// A resolution table: module base address -> ordinals to resolve against it.
pub type ResolutionTable<K> = BTreeMap<u32, Vec<ResolveRequest<K>>>;

/// Split a resolution table into groups that each fit within
/// [`MAXIMUM_SEND_LENGTH`] once rendered as an `ldxt!r` command, preserving
/// submission order within and across groups (§8 invariant 5).
pub fn split_resolution_table<K: Clone>(table: &ResolutionTable<K>) -> Vec<ResolutionTable<K>> {
    let mut groups: Vec<ResolutionTable<K>> = Vec::new();
    let mut remaining = MAXIMUM_SEND_LENGTH.saturating_sub(COMMAND_LEN);
    groups.push(ResolutionTable::new());

    for (&base, requests) in table {
        remaining = remaining.saturating_sub(ADDR_LEN);
        groups.last_mut().unwrap().entry(base).or_default();

        for request in requests {
            remaining = remaining.saturating_sub(ADDR_LEN);
            groups.last_mut().unwrap().get_mut(&base).unwrap().push(request.clone());

            if remaining <= ADDR_LEN {
                remaining = MAXIMUM_SEND_LENGTH.saturating_sub(COMMAND_LEN);
                groups.push(ResolutionTable::new());
                groups.last_mut().unwrap().entry(base).or_default();
            }
        }
    }

    groups.retain(|g| g.values().any(|v| !v.is_empty()));
    groups
}

/// Build the `ldxt!r` command text for one (already-split) resolution table group.
pub fn build_resolve_command<K>(group: &ResolutionTable<K>) -> String {
    let mut command = String::from("ldxt!r");
    for (base, requests) in group {
        if requests.is_empty() {
            continue;
        }
        let _ = write!(command, " b={}", hex(*base));
        for request in requests {
            let _ = write!(command, " o={}", hex(request.ordinal));
        }
    }
    command
}

/// Parse a flat vector of little-endian `u32` addresses out of a bulk
/// resolution reply, in the same order the requests were submitted.
pub fn parse_resolve_response(binary: &[u8], expected_count: usize) -> Result<Vec<u32>, Error> {
    if binary.len() != expected_count * 4 {
        return Err(Error::MalformedResponse(format!(
            "expected {} bytes ({} addresses), got {}",
            expected_count * 4,
            expected_count,
            binary.len()
        )));
    }
    Ok(binary
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

/// Build the `ldxt!a s=<hex>` allocation request command.
pub fn build_allocate_command(size: u32) -> String {
    format!("ldxt!a s={}", hex(size))
}

/// Parse the `base=<hex>` response to an allocation request.
pub fn parse_allocate_response(text: &str) -> Result<u32, Error> {
    let base_param = text
        .find("base=")
        .ok_or_else(|| Error::MalformedResponse(format!("no base= in '{text}'")))?;
    let value = &text[base_param + "base=".len()..];
    let value = value.split_whitespace().next().unwrap_or(value);
    let value = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(value, 16)
        .map_err(|_| Error::MalformedResponse(format!("invalid base= value in '{text}'")))
}

/// Build the `ldxt!i e=<hex>` install command text (the binary image is sent
/// as the command's accompanying payload via [`crate::facade::Request::TextWithBinary`]).
pub fn build_install_command(entrypoint: u32) -> String {
    format!("ldxt!i e={}", hex(entrypoint))
}

/// The probe command used to detect an already-running dynamic loader.
pub const HELLO_COMMAND: &str = "ddxt!hello";

/// The command used to upload a fully-linked DynDXT to a running loader.
pub const LOAD_COMMAND: &str = "ddxt!load";

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table_of(entries: &[(u32, &[u32])]) -> ResolutionTable<u32> {
        let mut table = ResolutionTable::new();
        for &(base, ordinals) in entries {
            table.insert(
                base,
                ordinals
                    .iter()
                    .map(|&o| ResolveRequest { ordinal: o, key: o })
                    .collect(),
            );
        }
        table
    }

    #[test]
    fn allocate_roundtrip() {
        let command = build_allocate_command(0x1234);
        assert_eq!(command, "ldxt!a s=0x00001234");
        assert_eq!(parse_allocate_response("base=0x00987654").unwrap(), 0x00987654);
    }

    #[test]
    fn resolve_command_grammar() {
        let table = table_of(&[(0x1000, &[1, 2]), (0x2000, &[3])]);
        let command = build_resolve_command(&table);
        assert_eq!(command, "ldxt!r b=0x00001000 o=0x00000001 o=0x00000002 b=0x00002000 o=0x00000003");
    }

    #[test]
    fn split_preserves_order_and_bounds_length() {
        let mut ordinals = Vec::new();
        for i in 0..400u32 {
            ordinals.push(i + 1);
        }
        let table = table_of(&[(0x1000, &ordinals)]);
        let groups = split_resolution_table(&table);
        assert!(groups.len() > 1);

        let mut seen = Vec::new();
        for group in &groups {
            let command = build_resolve_command(group);
            assert!(command.len() <= MAXIMUM_SEND_LENGTH);
            for requests in group.values() {
                seen.extend(requests.iter().map(|r| r.ordinal));
            }
        }
        assert_eq!(seen, ordinals);
    }

    #[test]
    fn parse_response_matches_request_count() {
        let addrs: Vec<u32> = vec![0x1111_1111, 0x2222_2222, 0x3333_3333];
        let mut binary = Vec::new();
        for a in &addrs {
            binary.extend_from_slice(&a.to_le_bytes());
        }
        assert_eq!(parse_resolve_response(&binary, 3).unwrap(), addrs);
        assert!(parse_resolve_response(&binary, 2).is_err());
    }

    proptest! {
        #[test]
        fn command_length_never_exceeds_maximum(
            bases in proptest::collection::vec(0u32..0xFFFF_0000, 1..20),
            ordinals_per_base in 1usize..50,
        ) {
            let mut table = ResolutionTable::new();
            for (i, base) in bases.into_iter().enumerate() {
                let requests = (0..ordinals_per_base as u32)
                    .map(|o| ResolveRequest { ordinal: o + 1, key: (i as u32, o) })
                    .collect();
                table.insert(base, requests);
            }
            let groups = split_resolution_table(&table);
            for group in &groups {
                let command = build_resolve_command(group);
                prop_assert!(command.len() <= MAXIMUM_SEND_LENGTH);
            }
        }
    }
}
