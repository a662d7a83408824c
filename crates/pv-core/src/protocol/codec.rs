//! Binary codec for message headers and the small fixed payloads.
//!
//! Wire format of the legacy header:
//! ```text
//! [command:2][payload_size:2][data_type:2][element_count:2][cid:4][available:4]
//! ```
//! The large-array form stores `0xFFFF` in `payload_size` and `0` in
//! `element_count`, then appends `[payload_size:4][element_count:4]`.
//! All multi-byte integers are big-endian and every payload is padded with
//! zeros to a multiple of 8 bytes.

use thiserror::Error;

use crate::protocol::messages::{
    Header, MonitorRequest, HEADER_SIZE, LARGE_HEADER_SIZE, LARGE_PAYLOAD_MARKER,
    MONITOR_REQUEST_SIZE,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The command code is not one the receiver handles.
    #[error("unknown command: {0}")]
    UnknownCommand(u16),

    /// The peer's minor protocol version is not served.
    #[error("unsupported protocol minor version: {0}")]
    UnsupportedVersion(u16),

    /// The payload could not be parsed (field value out of range, bad name, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The declared payload size does not match the bytes available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// A TCP message whose total size is not a multiple of 8.
    #[error("misaligned message of {0} bytes")]
    Misaligned(usize),
}

// ── Sizing ────────────────────────────────────────────────────────────────────

/// Rounds `n` up to the next multiple of 8.
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Whether a message with these sizes needs the large-array header.
pub fn needs_large_header(payload_size: u32, element_count: u32) -> bool {
    payload_size >= u32::from(LARGE_PAYLOAD_MARKER) || element_count >= 0xFFFF
}

/// Encoded header length for a message with these sizes.
pub fn header_len(payload_size: u32, element_count: u32) -> usize {
    if needs_large_header(payload_size, element_count) {
        LARGE_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Writes `header` to the start of `out`, choosing the wire form from its
/// sizes, and returns the number of bytes written.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `out` cannot hold the header.
pub fn encode_header_into(header: &Header, out: &mut [u8]) -> Result<usize, ProtocolError> {
    let large = needs_large_header(header.payload_size, header.element_count);
    encode_header_form(header, large, out)
}

/// Writes `header` in the given wire form.  A header that was reserved in
/// the large form keeps it even after its payload shrinks.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `out` cannot hold the
/// header, or [`ProtocolError::MalformedPayload`] if the sizes do not fit the
/// legacy form.
pub fn encode_header_form(header: &Header, large: bool, out: &mut [u8]) -> Result<usize, ProtocolError> {
    let len = if large { LARGE_HEADER_SIZE } else { HEADER_SIZE };
    if out.len() < len {
        return Err(ProtocolError::InsufficientData {
            needed: len,
            available: out.len(),
        });
    }
    if !large && needs_large_header(header.payload_size, header.element_count) {
        return Err(ProtocolError::MalformedPayload(format!(
            "size {} / count {} needs the large header",
            header.payload_size, header.element_count
        )));
    }

    let (size16, count16) = if large {
        (LARGE_PAYLOAD_MARKER, 0u16)
    } else {
        (header.payload_size as u16, header.element_count as u16)
    };

    out[0..2].copy_from_slice(&header.command.to_be_bytes());
    out[2..4].copy_from_slice(&size16.to_be_bytes());
    out[4..6].copy_from_slice(&header.data_type.to_be_bytes());
    out[6..8].copy_from_slice(&count16.to_be_bytes());
    out[8..12].copy_from_slice(&header.cid.to_be_bytes());
    out[12..16].copy_from_slice(&header.available.to_be_bytes());
    if large {
        out[16..20].copy_from_slice(&header.payload_size.to_be_bytes());
        out[20..24].copy_from_slice(&header.element_count.to_be_bytes());
    }
    Ok(len)
}

/// Encodes `header` into a fresh vector.
pub fn encode_header(header: &Header) -> Vec<u8> {
    let mut buf = vec![0u8; header_len(header.payload_size, header.element_count)];
    // The buffer is sized from the same header, so this cannot fail.
    let _ = encode_header_into(header, &mut buf);
    buf
}

/// Decodes one header from the beginning of `bytes`.
///
/// `large_ok` states whether the sender may use the large-array form.  A
/// `0xFFFF` size from a sender that may not is taken literally.
///
/// Returns the header and the number of header bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when the header is incomplete.
///
/// # Examples
///
/// ```rust
/// use pv_core::protocol::{decode_header, encode_header, Command, Header};
///
/// let hdr = Header::new(Command::Echo).with_cid(7);
/// let bytes = encode_header(&hdr);
/// let (decoded, n) = decode_header(&bytes, true).unwrap();
/// assert_eq!(decoded, hdr);
/// assert_eq!(n, 16);
/// ```
pub fn decode_header(bytes: &[u8], large_ok: bool) -> Result<(Header, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let mut header = Header {
        command: read_u16(bytes, 0)?,
        payload_size: u32::from(read_u16(bytes, 2)?),
        data_type: read_u16(bytes, 4)?,
        element_count: u32::from(read_u16(bytes, 6)?),
        cid: read_u32(bytes, 8)?,
        available: read_u32(bytes, 12)?,
    };

    if large_ok && header.payload_size == u32::from(LARGE_PAYLOAD_MARKER) {
        if bytes.len() < LARGE_HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: LARGE_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        header.payload_size = read_u32(bytes, 16)?;
        header.element_count = read_u32(bytes, 20)?;
        return Ok((header, LARGE_HEADER_SIZE));
    }
    Ok((header, HEADER_SIZE))
}

/// Encodes a complete message: `header` with its `payload_size` replaced by
/// the padded length of `payload`, followed by the zero-padded payload.
pub fn encode_message(header: &Header, payload: &[u8]) -> Vec<u8> {
    let padded = align8(payload.len());
    let header = Header {
        payload_size: padded as u32,
        ..*header
    };
    let mut buf = encode_header(&header);
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + (padded - payload.len()), 0);
    buf
}

/// Decodes one complete message from the beginning of `bytes`.
///
/// Returns the header, its payload and the total bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] for a short header and
/// [`ProtocolError::PayloadLengthMismatch`] for a short payload.
pub fn decode_message(bytes: &[u8], large_ok: bool) -> Result<(Header, &[u8], usize), ProtocolError> {
    let (header, hdr_len) = decode_header(bytes, large_ok)?;
    let declared = header.payload_size as usize;
    let available = bytes.len() - hdr_len;
    if available < declared {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            available,
        });
    }
    Ok((header, &bytes[hdr_len..hdr_len + declared], hdr_len + declared))
}

// ── Names ─────────────────────────────────────────────────────────────────────

/// Reads a NUL-terminated name from a payload.  A payload without a NUL is
/// taken whole.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the name is not UTF-8.
pub fn read_name(payload: &[u8]) -> Result<&str, ProtocolError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid name: {e}")))
}

/// Encodes `name` as a NUL-terminated payload padded to 8 bytes.
pub fn name_payload(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(align8(name.len() + 1));
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.resize(align8(buf.len()), 0);
    buf
}

// ── Monitor request ───────────────────────────────────────────────────────────

/// Decodes the 16-byte EVENT_ADD payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the payload is short.
pub fn decode_monitor_request(payload: &[u8]) -> Result<MonitorRequest, ProtocolError> {
    require_len(payload, MONITOR_REQUEST_SIZE, "monitor request")?;
    Ok(MonitorRequest {
        low: f32::from_bits(read_u32(payload, 0)?),
        high: f32::from_bits(read_u32(payload, 4)?),
        to: f32::from_bits(read_u32(payload, 8)?),
        mask: read_u16(payload, 12)?,
    })
}

/// Encodes the 16-byte EVENT_ADD payload.
pub fn encode_monitor_request(req: &MonitorRequest) -> [u8; MONITOR_REQUEST_SIZE] {
    let mut buf = [0u8; MONITOR_REQUEST_SIZE];
    buf[0..4].copy_from_slice(&req.low.to_bits().to_be_bytes());
    buf[4..8].copy_from_slice(&req.high.to_bits().to_be_bytes());
    buf[8..12].copy_from_slice(&req.to.to_bits().to_be_bytes());
    buf[12..14].copy_from_slice(&req.mask.to_be_bytes());
    buf
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::InsufficientData {
            needed: offset + 2,
            available: buf.len(),
        });
    }
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    if buf.len() < offset + 4 {
        return Err(ProtocolError::InsufficientData {
            needed: offset + 4,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{event_mask, Command};

    #[test]
    fn test_large_form_is_kept_when_requested() {
        // Arrange
        let hdr = Header::new(Command::ReadNotify).with_payload_size(8).with_element_count(1);
        let mut out = [0u8; LARGE_HEADER_SIZE];

        // Act
        let n = encode_header_form(&hdr, true, &mut out).unwrap();

        // Assert
        assert_eq!(n, LARGE_HEADER_SIZE);
        assert_eq!(decode_header(&out, true).unwrap(), (hdr, LARGE_HEADER_SIZE));
    }

    #[test]
    fn test_legacy_form_rejects_large_sizes() {
        let hdr = Header::new(Command::ReadNotify).with_element_count(0x10000);
        let mut out = [0u8; LARGE_HEADER_SIZE];
        assert!(encode_header_form(&hdr, false, &mut out).is_err());
    }

    #[test]
    fn test_align8_rounds_up_to_multiple_of_eight() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn test_small_header_uses_legacy_form() {
        // Arrange
        let hdr = Header::new(Command::ReadNotify)
            .with_payload_size(8)
            .with_data_type(6)
            .with_element_count(1)
            .with_cid(0x0102_0304)
            .with_available(0xAABB_CCDD);

        // Act
        let bytes = encode_header(&hdr);

        // Assert
        assert_eq!(
            bytes,
            vec![
                0x00, 0x0F, 0x00, 0x08, 0x00, 0x06, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0xAA,
                0xBB, 0xCC, 0xDD
            ]
        );
    }

    #[test]
    fn test_large_payload_uses_extended_form() {
        // Arrange
        let hdr = Header::new(Command::ReadNotify)
            .with_payload_size(0x2_0000)
            .with_element_count(0x4000);

        // Act
        let bytes = encode_header(&hdr);

        // Assert
        assert_eq!(bytes.len(), LARGE_HEADER_SIZE);
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(&bytes[6..8], &[0x00, 0x00]);
        let (decoded, n) = decode_header(&bytes, true).unwrap();
        assert_eq!(n, LARGE_HEADER_SIZE);
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_element_count_at_limit_forces_extended_form() {
        let hdr = Header::new(Command::EventAdd).with_element_count(0xFFFF);
        assert_eq!(encode_header(&hdr).len(), LARGE_HEADER_SIZE);
    }

    #[test]
    fn test_marker_from_old_peer_is_taken_literally() {
        // Arrange
        let mut bytes = encode_header(&Header::new(Command::Write).with_payload_size(8));
        bytes[2] = 0xFF;
        bytes[3] = 0xFF;

        // Act
        let (decoded, n) = decode_header(&bytes, false).unwrap();

        // Assert
        assert_eq!(n, HEADER_SIZE);
        assert_eq!(decoded.payload_size, 0xFFFF);
    }

    #[test]
    fn test_short_header_reports_insufficient_data() {
        let err = decode_header(&[0u8; 10], true).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InsufficientData {
                needed: 16,
                available: 10
            }
        );
    }

    #[test]
    fn test_partial_large_header_reports_insufficient_data() {
        let bytes = encode_header(&Header::new(Command::Write).with_payload_size(0x10_0000));
        let err = decode_header(&bytes[..20], true).unwrap_err();
        assert!(matches!(err, ProtocolError::InsufficientData { needed: 24, .. }));
    }

    #[test]
    fn test_encode_message_pads_payload_with_zeros() {
        // Arrange
        let hdr = Header::new(Command::Search).with_cid(7);

        // Act
        let bytes = encode_message(&hdr, b"abc");

        // Assert
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[2..4], &[0, 8]);
        assert_eq!(&bytes[16..24], b"abc\0\0\0\0\0");
    }

    #[test]
    fn test_decode_message_detects_truncated_payload() {
        let mut bytes = encode_message(&Header::new(Command::Echo), &[1u8; 16]);
        bytes.truncate(20);
        let err = decode_message(&bytes, true).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PayloadLengthMismatch {
                declared: 16,
                available: 4
            }
        );
    }

    #[test]
    fn test_read_name_stops_at_nul() {
        assert_eq!(read_name(b"pump:speed\0\0\0\0\0\0").unwrap(), "pump:speed");
        assert_eq!(read_name(b"no-terminator").unwrap(), "no-terminator");
        assert_eq!(read_name(b"\0\0\0\0\0\0\0\0").unwrap(), "");
    }

    #[test]
    fn test_read_name_rejects_invalid_utf8() {
        assert!(matches!(
            read_name(&[0xFF, 0xFE, 0]),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_name_payload_is_nul_terminated_and_aligned() {
        let p = name_payload("abcdefgh");
        assert_eq!(p.len(), 16);
        assert_eq!(p[8], 0);
    }

    #[test]
    fn test_monitor_request_mask_is_read_at_offset_twelve() {
        // Arrange
        let req = MonitorRequest {
            low: 0.0,
            high: 0.0,
            to: 0.0,
            mask: event_mask::VALUE | event_mask::ALARM,
        };
        let bytes = encode_monitor_request(&req);

        // Act
        let decoded = decode_monitor_request(&bytes).unwrap();

        // Assert
        assert_eq!(bytes[13], 0x05);
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_short_monitor_request_is_malformed() {
        assert!(matches!(
            decode_monitor_request(&[0u8; 12]),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
