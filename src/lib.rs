//! # xbdm-dyndxt-loader
//!
//! Core logic for remotely installing a "dynamic loader" DXT on an original
//! Xbox running the XBDM debug monitor, and for using that loader to install
//! further DLLs without rebooting the console.
//!
//! This crate implements the pure, transport-independent core: PE32 parsing
//! and relocation ([`pe`], [`library`]), remote export resolution ([`resolver`],
//! [`exports`]), the bulk resolution wire protocol ([`wire`]), the two-stage
//! bootstrap that gets a loader running on the console at all ([`bootstrap`]),
//! the dynamic-loader installer built on top of it ([`dynloader`]), and the
//! process-wide orchestrator that ties these into three idempotent operations
//! ([`orchestrator`]). All console I/O happens through [`facade::DebuggerFacade`],
//! which the caller implements against its own transport; this crate never
//! opens a socket itself.

#![warn(missing_docs)]

/// Crate-wide error type.
pub mod error;
pub use error::Error;

/// The Debugger Façade: the only seam between this crate and a live console.
pub mod facade;

/// COFF file header definitions and helper functions
pub mod coff;
/// Optional header definitions and helper functions
pub mod optional;
/// Section header definitions and helper functions
pub mod section;
/// PE32 header parsing, plus import/relocation/TLS directory parsing.
pub mod pe;

/// The PE Image Loader (C2): materializes a parsed image, relocates it, and
/// patches its import slots.
pub mod library;

/// Known export ordinal tables for `xbdm.dll` and `xboxkrnl.exe` (C1).
pub mod exports;

/// Remote export resolution (C3) and the per-process resolver cache.
pub mod resolver;

/// Wire-level building blocks for the bulk resolution protocol (C4) and the
/// other `ldxt!`/`ddxt!` commands.
pub mod wire;

/// Stage-1 and Stage-2 bootstrap drivers (C5, C6).
pub mod bootstrap;

/// Dynamic Loader Installer (C7): installs further DLLs through a running loader.
pub mod dynloader;

/// Install Orchestrator (C8): the process-wide singleton and its three
/// idempotent entry points (`bootstrap`, `load`, `install`).
pub mod orchestrator;

pub(crate) mod prelude;
