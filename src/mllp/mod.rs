//! Minimal Lower Layer Protocol (MLLP) framing.
//!
//! MLLP delimits HL7 messages on a byte stream by wrapping each one with a
//! start block and an end block followed by a carriage return.
//!
//! ## Frame Format
//!
//! ```text
//! <VT> payload bytes <FS><CR>
//!
//! VT = 0x0B (start block)
//! FS = 0x1C (end block)
//! CR = 0x0D (terminator)
//! ```
//!
//! The payload is opaque to the codec. A payload containing `FS` cannot be
//! represented unambiguously; the wire protocol has no escaping, so the codec
//! encodes it as given and the receiver will split early.
//!
//! ## Streaming
//!
//! `codec::try_extract` is called on everything buffered so far and reports
//! how many bytes a complete frame consumed, so several frames on one
//! connection can be pulled out one after another.

pub mod codec;

pub use codec::{encode, try_extract, try_extract_final, ParseResult};
