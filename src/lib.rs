//! Offline analysis of CIL collaboration traffic captures
//!
//! The pipeline runs in three layers, leaves first:
//!
//! 1. [`capture`] reads a PCAP file and emits per-connection TCP payload
//!    fragments, chronologically interleaved across connections as they
//!    were recorded.
//! 2. [`flow`] demultiplexes fragments into per-flow byte streams and
//!    drives the [`framing`] decoder, which validates each stream's ZMQ
//!    greeting and extracts length-prefixed frames.
//! 3. [`cil`] decodes frame payloads into protocol messages, which the
//!    [`check`] layer evaluates against the collaboration rules.
//!
//! Everything is synchronous and pull-based: each layer exposes a `read`
//! that returns the next item or `None` at end of capture. Per-flow
//! failures (a stream that is not ZMQ, a frame that is not a protocol
//! message) are logged and skipped, never fatal.

pub mod capture;
pub mod check;
pub mod cil;
pub mod config;
pub mod error;
pub mod flow;
pub mod framing;

pub use capture::{Fragment, FragmentSource, PcapFragmentSource};
pub use check::{AllClientsCheck, AllLinksCheck, ValidationWindow};
pub use cil::{CilReader, MessageRecord};
pub use config::Config;
pub use error::{CilscopeError, Result};
pub use flow::{Frame, FrameReader};
