//! Crate-wide error type.
//!
//! Every fallible operation in this crate - PE parsing, relocation, remote
//! export resolution, bootstrap, install - returns `Result<T, Error>`.
//! The [`crate::orchestrator`] entry points collapse this into the single
//! boolean the design calls for, logging the variant via the `log` facade
//! before doing so.

/// Every error kind the core recognizes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A slice index fell outside the bounds of the buffer being parsed.
    #[error("offset {offset:#x} is out of range for a buffer of {len} bytes")]
    OffsetOutOfRange {
        /// Offset that was requested.
        offset: usize,
        /// Length of the buffer that was indexed.
        len: usize,
    },
    /// The DOS/NT header signature did not match `"PE\0\0"`.
    #[error("missing or malformed PE header in {path}")]
    MissingPeHeader {
        /// Logical path label supplied by the caller.
        path: String,
    },
    /// The COFF file header failed to parse.
    #[error("malformed COFF header")]
    BadCoffHeader,
    /// The optional header failed to parse, or declared an unsupported magic.
    #[error("malformed or unsupported optional header")]
    BadOptionalHeader,
    /// The image declared a machine type or bitness this loader does not support.
    #[error("{path}: unsupported machine/bitness ({detail})")]
    UnsupportedImage {
        /// Logical path label supplied by the caller.
        path: String,
        /// Human-readable detail (e.g. "PE32+ images are not supported").
        detail: String,
    },
    /// A section's raw data would write outside the allocated image buffer.
    #[error("section {name} in {path} lies outside the image (rva {rva:#x}, size {size:#x}, image size {image_size:#x})")]
    SectionOutOfImage {
        /// Logical path label supplied by the caller.
        path: String,
        /// Section name, lossily decoded.
        name: String,
        /// Virtual address the section claims.
        rva: u32,
        /// Raw/virtual size of the section.
        size: u32,
        /// Declared `SizeOfImage`.
        image_size: u32,
    },
    /// An import descriptor's `Name` RVA did not point at a valid C string.
    #[error("unresolvable import descriptor name in {path} at rva {rva:#x}")]
    UnresolvableImportName {
        /// Logical path label supplied by the caller.
        path: String,
        /// RVA that could not be read as a name.
        rva: u32,
    },
    /// A base relocation entry used a type this loader does not implement.
    #[error("unsupported relocation type {relocation_type:#x} at rva {rva:#x}")]
    UnsupportedRelocationType {
        /// The relocation type nibble (`IMAGE_REL_BASED_*`).
        relocation_type: u16,
        /// RVA the relocation entry targets.
        rva: u32,
    },
    /// `relocate` was called while one or more imports still had `resolved_address == 0`.
    #[error("cannot relocate {path}: {count} import(s) are unresolved")]
    UnresolvedImports {
        /// Logical path label supplied by the caller.
        path: String,
        /// Number of imports still at `resolved_address == 0`.
        count: usize,
    },
    /// A `GetMemory`/`GetDWORD`/`SetMemory`/`Resume`/`GetModule`/`SendCommandSync`
    /// call against the Debugger Façade failed.
    #[error("transport operation failed: {detail}")]
    TransportFailure {
        /// Human-readable detail of which façade call failed.
        detail: String,
    },
    /// Export resolution failed: unknown module base, out-of-range ordinal,
    /// unresolved name, or a zero address after a successful bulk reply.
    #[error("failed to resolve export {locator} in module {module}")]
    ResolutionFailure {
        /// Module the export was looked up against.
        module: String,
        /// `"ordinal N"` or `"name X"`, whichever the caller used.
        locator: String,
    },
    /// A remote pool allocation (via L1 or `ldxt!a`) returned a null address.
    #[error("remote allocation of {size} byte(s) failed")]
    RemoteAllocationFailure {
        /// Size of the failed allocation request.
        size: u32,
    },
    /// The image uses a feature this loader deliberately does not support.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
    /// A console wire response did not have the expected shape (status,
    /// binary length, or text grammar).
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl Error {
    pub(crate) fn offset_out_of_range(offset: usize, len: usize) -> Self {
        Error::OffsetOutOfRange { offset, len }
    }
}
