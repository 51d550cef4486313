//! The Debugger Façade: the crate's only seam to the outside world.
//!
//! Everything in §1's "Explicitly out of scope" list - the transport, the
//! XBDM wire protocol's framing, the socket - lives behind this trait.
//! Callers implement it against whatever transport they have; this crate
//! only ever calls through it.

/// Information about a module loaded on the remote console, as reported by
/// the façade's module-walk command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Module name, e.g. `"xbdm.dll"`.
    pub name: String,
    /// Base virtual address the module is loaded at.
    pub base_address: u32,
    /// Size in bytes of the loaded image.
    pub size: u32,
    /// Image checksum, as reported by the console.
    pub checksum: u32,
    /// Link timestamp, as reported by the console.
    pub timestamp: u32,
    /// Whether the module declares thread-local storage.
    pub is_tls: bool,
    /// Whether this module descriptor is for the running XBE, not a DLL.
    pub is_xbe: bool,
}

/// Status of a `send_command_sync` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The command succeeded.
    Ok,
    /// The command succeeded and carries a binary body.
    OkBinary,
    /// The command failed.
    Error,
}

impl Status {
    /// `true` for either OK variant.
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::OkBinary)
    }
}

/// Body of a `send_command_sync` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No body (status-only reply).
    None,
    /// A single line of text.
    Text(String),
    /// Several lines of text (e.g. `ddxt!load`'s multiline reply).
    MultilineText(Vec<String>),
    /// A length-prefixed binary blob (e.g. `ldxt!r`'s address vector).
    Binary(Vec<u8>),
}

/// Response to a `send_command_sync` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status of the command.
    pub status: Status,
    /// Body of the reply.
    pub body: ResponseBody,
}

impl Response {
    /// Build an `OK`, bodyless response - the common case for fire-and-forget commands.
    pub fn ok() -> Self {
        Response { status: Status::Ok, body: ResponseBody::None }
    }

    /// Build an `Error`, bodyless response.
    pub fn error() -> Self {
        Response { status: Status::Error, body: ResponseBody::None }
    }

    /// Build an OK response carrying a single line of text.
    pub fn ok_text(text: impl Into<String>) -> Self {
        Response { status: Status::Ok, body: ResponseBody::Text(text.into()) }
    }

    /// Build an OK-binary response carrying a binary blob.
    pub fn ok_binary(data: Vec<u8>) -> Self {
        Response { status: Status::OkBinary, body: ResponseBody::Binary(data) }
    }

    /// The text body, if any - flattening `Text`/`MultilineText` into one string.
    pub fn text(&self) -> Option<String> {
        match &self.body {
            ResponseBody::Text(s) => Some(s.clone()),
            ResponseBody::MultilineText(lines) => Some(lines.join("\n")),
            _ => None,
        }
    }

    /// The binary body, if any.
    pub fn binary(&self) -> Option<&[u8]> {
        match &self.body {
            ResponseBody::Binary(data) => Some(data),
            _ => None,
        }
    }
}

/// A request to send to the console, as a tagged variant (§9 design note:
/// "Typed commands").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A plain text command, e.g. `"ddxt!hello"`.
    Text(String),
    /// A text command followed by a binary payload, e.g. `ldxt!i`/`ddxt!load`.
    TextWithBinary(String, Vec<u8>),
    /// A text command expected to produce a binary reply, e.g. `ldxt!r`.
    BinaryQuery(String),
}

impl Request {
    /// The command text, regardless of variant.
    pub fn command(&self) -> &str {
        match self {
            Request::Text(s) => s,
            Request::TextWithBinary(s, _) => s,
            Request::BinaryQuery(s) => s,
        }
    }
}

/// The console interface this crate is built against (§6 "Debugger Façade
/// (consumed)"). Implemented by the caller's transport layer; this crate
/// never implements it for production use, only for tests (`MockFacade`).
pub trait DebuggerFacade {
    /// Read `len` bytes starting at `addr`, or `None` on transport failure.
    fn get_memory(&self, addr: u32, len: u32) -> Option<Vec<u8>>;

    /// Write `bytes` starting at `addr`, returning whether it succeeded.
    /// Chunking at a transport-defined maximum is the implementer's concern;
    /// this crate calls it with whatever slice it has in hand.
    fn set_memory(&self, addr: u32, bytes: &[u8]) -> bool;

    /// Read one little-endian `u32` at `addr`, or `None` on transport failure.
    fn get_dword(&self, addr: u32) -> Option<u32>;

    /// Resume a thread such that the patched entrypoint sees `parameter` as
    /// its argument. Returns whether the resume succeeded.
    fn resume(&self, parameter: u32) -> bool;

    /// Look up a loaded module by name.
    fn get_module(&self, name: &str) -> Option<ModuleDescriptor>;

    /// Generic command dispatch.
    fn send_command_sync(&self, request: &Request) -> Response;
}
