//! Wire-format definitions for TinyTP PDUs.
//!
//! Two PDUs exist on the wire:
//! - the **Connect PDU**, carried as user data of the link-level connect and
//!   accept primitives, and
//! - the **Data PDU**, carried by every link-level put.
//!
//! No I/O happens here.  Decoding works in place on a [`Segment`]: the header
//! bytes are hidden and the payload is left at the front of the visible
//! region, ready for the client.
//!
//! # Connect PDU
//!
//! ```text
//!   7   6 . . . . . 0
//! +---+---------------+-------------+----------------------+-----------+
//! | P | initial credit| param len   | params (id, len, val)| user data |
//! +---+---------------+-------------+----------------------+-----------+
//!                      \_________ only when P = 1 _________/
//! ```
//!
//! The only parameter used is `MaxSduSize` (id `0x01`), a big-endian integer
//! of 1 to 4 bytes.
//!
//! # Data PDU
//!
//! ```text
//!   7   6 . . . . . 0
//! +---+---------------+-------------+
//! | M |    credit     |  payload    |
//! +---+---------------+-------------+
//! ```
//!
//! `M` (more) is set on every fragment of a segmented SDU except the last.

use thiserror::Error;

use crate::segment::Segment;

/// Byte length of the Data PDU header.
pub const DATA_HEADER_LEN: usize = 1;

/// Largest credit value a single PDU can carry (7-bit field).
pub const MAX_CREDIT: u8 = 0x7F;

/// Parameter identifier of `MaxSduSize` in the Connect PDU.
pub const PI_MAX_SDU_SIZE: u8 = 0x01;

// Bit 7 of the first octet: `P` in a Connect PDU, `M` in a Data PDU.
const FLAG_BIT: u8 = 0x80;
const CREDIT_MASK: u8 = 0x7F;

/// Errors that can arise when parsing a PDU.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduError {
    /// Zero-length buffer; not even the first octet is present.
    #[error("empty PDU")]
    Empty,
    /// The parameter list claims more bytes than the PDU holds.
    #[error("parameter list truncated (needs {needed} byte(s), {available} available)")]
    Truncated { needed: usize, available: usize },
    /// A parameter runs past the parameter list or has an unusable width.
    #[error("malformed parameter {0:#04x}")]
    Malformed(u8),
    /// No hidden headroom to prepend a Data PDU header into.
    #[error("segment has no headroom for a PDU header")]
    NoHeadroom,
}

// ---------------------------------------------------------------------------
// Connect PDU
// ---------------------------------------------------------------------------

/// Parameters carried by a Connect PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectParams {
    /// Credit granted to the peer by this PDU (7 bits).
    pub initial_credit: u8,
    /// Largest SDU the sender will reassemble; `0` means SAR disabled and
    /// no parameter list is emitted.
    pub max_sdu_size: u32,
}

/// Encode a Connect PDU with `user_data` appended verbatim.
pub fn encode_connect(params: ConnectParams, user_data: &[u8]) -> Segment {
    let mut buf = Vec::with_capacity(8 + user_data.len());
    let credit = params.initial_credit & CREDIT_MASK;

    if params.max_sdu_size == 0 {
        buf.push(credit);
    } else {
        let value = params.max_sdu_size.to_be_bytes();
        // Minimal big-endian width, 1..=4 bytes.
        let skip = value.iter().take_while(|&&b| b == 0).count().min(3);
        let value = &value[skip..];

        buf.push(FLAG_BIT | credit);
        buf.push((2 + value.len()) as u8);
        buf.push(PI_MAX_SDU_SIZE);
        buf.push(value.len() as u8);
        buf.extend_from_slice(value);
    }
    buf.extend_from_slice(user_data);
    Segment::from_vec(buf)
}

/// Parse a Connect PDU in place.
///
/// On success the header and parameter list are hidden and `seg`'s visible
/// region is exactly the peer's user data.  A `MaxSduSize` of zero is treated
/// as absent.
pub fn decode_connect(seg: &mut Segment) -> Result<ConnectParams, PduError> {
    let bytes = seg.as_slice();
    let first = *bytes.first().ok_or(PduError::Empty)?;
    let mut params = ConnectParams {
        initial_credit: first & CREDIT_MASK,
        max_sdu_size: 0,
    };

    let mut header_len = 1;
    if first & FLAG_BIT != 0 {
        let list_len = *bytes.get(1).ok_or(PduError::Truncated {
            needed: 1,
            available: 0,
        })? as usize;
        let available = bytes.len() - 2;
        if list_len > available {
            return Err(PduError::Truncated {
                needed: list_len,
                available,
            });
        }
        params.max_sdu_size = parse_parameters(&bytes[2..2 + list_len])?;
        header_len = 2 + list_len;
    }

    seg.hide_from_start(header_len);
    seg.rewind();
    Ok(params)
}

/// Walk a `(id, len, value)` list and return the `MaxSduSize` value, or 0.
fn parse_parameters(mut list: &[u8]) -> Result<u32, PduError> {
    let mut max_sdu = 0;
    while !list.is_empty() {
        let id = list[0];
        let len = *list.get(1).ok_or(PduError::Malformed(id))? as usize;
        let value = list.get(2..2 + len).ok_or(PduError::Malformed(id))?;

        if id == PI_MAX_SDU_SIZE {
            if value.is_empty() || value.len() > 4 {
                return Err(PduError::Malformed(id));
            }
            max_sdu = value.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        } else {
            log::trace!("[ttp:pdu] skipping unknown connect parameter {id:#04x}");
        }
        list = &list[2 + len..];
    }
    Ok(max_sdu)
}

// ---------------------------------------------------------------------------
// Data PDU
// ---------------------------------------------------------------------------

/// The single octet leading every Data PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHeader {
    /// More fragments of the same SDU follow.
    pub more: bool,
    /// Credit granted to the peer (7 bits).
    pub credit: u8,
}

impl DataHeader {
    fn to_byte(self) -> u8 {
        (if self.more { FLAG_BIT } else { 0 }) | (self.credit & CREDIT_MASK)
    }

    fn from_byte(b: u8) -> Self {
        Self {
            more: b & FLAG_BIT != 0,
            credit: b & CREDIT_MASK,
        }
    }
}

/// Copy `payload` into a new segment that keeps [`DATA_HEADER_LEN`] bytes of
/// headroom for [`write_data_header`].
pub fn data_segment(payload: &[u8]) -> Segment {
    Segment::with_headroom(DATA_HEADER_LEN, payload)
}

/// Prepend a Data PDU header into the headroom of `seg`.
pub fn write_data_header(seg: &mut Segment, header: DataHeader) -> Result<(), PduError> {
    seg.reveal_from_start(DATA_HEADER_LEN)
        .map_err(|_| PduError::NoHeadroom)?;
    seg.put_u8(header.to_byte())
        .map_err(|_| PduError::NoHeadroom)?;
    seg.rewind();
    Ok(())
}

/// Encode a complete Data PDU.  An empty `payload` yields a dataless PDU.
pub fn encode_data(header: DataHeader, payload: &[u8]) -> Segment {
    let mut seg = data_segment(payload);
    // A fresh data segment always has the header's headroom.
    if let Err(e) = write_data_header(&mut seg, header) {
        log::error!("[ttp:pdu] {e}");
    }
    seg
}

/// Parse a Data PDU in place, leaving only the payload visible.
pub fn decode_data(seg: &mut Segment) -> Result<DataHeader, PduError> {
    seg.rewind();
    let first = seg.get_u8().map_err(|_| PduError::Empty)?;
    seg.hide_from_start(DATA_HEADER_LEN);
    seg.rewind();
    Ok(DataHeader::from_byte(first))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
