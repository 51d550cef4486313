//! Small set of imports shared by every `pe` submodule.
pub(crate) use core::mem::size_of;
