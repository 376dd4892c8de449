//! Reassembly of notification fragments into complete response segments.
//!
//! Notifications arrive as arbitrary slices of a segment. The assembler
//! keeps one rolling buffer: a fragment that starts with the protocol's
//! segment header replaces whatever was buffered, anything else is appended
//! to an in-progress segment or dropped. Once the buffered bytes reach the
//! matching response's declared length and the trailing additive checksum
//! verifies, the segment is handed back and the buffer flushed.

use log::warn;

use crate::binary::{self, checksum};
use crate::protocol::ProtocolSpec;

/// The rolling reassembly buffer. One per session.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial segment.
    pub fn flush(&mut self) {
        self.buffer.clear();
    }

    /// Feed one notification fragment. Returns a complete, checksum-verified
    /// segment when this fragment finishes one; the internal buffer is
    /// flushed whenever a segment is returned or fails its checksum.
    pub fn push(&mut self, protocol: &ProtocolSpec, fragment: &[u8]) -> Option<Vec<u8>> {
        let header = &protocol.segment_header;

        if fragment.starts_with(header) {
            if !self.buffer.is_empty() {
                warn!(
                    "segment header received mid-frame, dropping {} buffered bytes",
                    self.buffer.len()
                );
                self.buffer.clear();
            }
            self.buffer.extend_from_slice(fragment);
        } else if self.buffer.starts_with(header) {
            self.buffer.extend_from_slice(fragment);
        } else {
            warn!(
                "dropping {}-byte fragment with no segment in progress: {}",
                fragment.len(),
                binary::hex_string(fragment)
            );
            return None;
        }

        // The signature byte follows the header.
        let type_at = header.len();
        let signature = *self.buffer.get(type_at)?;
        let response = protocol.response_by_signature(&[signature])?;

        if self.buffer.len() < response.length {
            return None;
        }
        if self.buffer.len() > response.length {
            warn!(
                "segment {} is {} bytes, {} over its declared length",
                response.name,
                self.buffer.len(),
                self.buffer.len() - response.length
            );
        }

        let segment = std::mem::take(&mut self.buffer);
        let last = segment[segment.len() - 1];
        let calculated = checksum(&segment[..segment.len() - 1]);
        if last != calculated {
            warn!(
                "checksum mismatch on {}: calculated {} received {}",
                response.name,
                binary::hex_byte(calculated),
                binary::hex_byte(last)
            );
            return None;
        }

        Some(segment)
    }
}
