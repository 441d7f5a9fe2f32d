// #![warn(missing_docs)]

//! Rust implementation of the PVA protocol server core.
//!
//! This crate is a pure-rust implementation of the server side of the
//! [PVA protocol] used for structured telemetry in EPICS control systems.
//! It does not depend on the C++ [pvxs] or [epics-base] projects at all.
//!
//! Two subsystems make up the core:
//! - The self-describing value codec: every value travels with a recursive
//!   type description ([`FieldDesc`]), and payloads can be sent whole or as
//!   bitset-gated deltas. See [`data`] and [`encoding`].
//! - The server spine: UDP search/beacon discovery plus a registry of named
//!   [`Source`]s that claim PV names. See [`server`].
//!
//! TCP per-connection channel handling sits above this crate; a [`Source`]
//! that claims a name is the hand-off point.
//!
//! [PVA protocol]:
//!     https://docs.epics-controls.org/en/latest/pv-access/protocol.html
//! [pvxs]: https://github.com/epics-base/pvxs
//! [epics-base]: https://github.com/epics-base/epics-base

pub mod bitset;
pub mod buffer;
pub mod data;
pub mod encoding;
pub mod messages;
pub mod server;
pub mod source;
mod utils;

pub use bitset::BitSet;
pub use data::{
    AccessError, ArrayValue, FieldDesc, FieldStorage, TypeCache, TypeCode, TypeDef, Value,
};
pub use server::{Config, Server, ServerError};
pub use source::{SearchName, SearchOperation, Source};
