// ABOUTME: Wire record definitions for the vsock-shell protocol
// ABOUTME: Covers the 12-byte header layout, record type enum, and text payload conventions

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Magic number stamped on every record header.
pub const PROTOCOL_MAGIC: u32 = 0xCAFE_BABE;

/// Fixed header size: magic + type + payload length, each a little-endian u32.
pub const HEADER_SIZE: usize = 12;

/// Largest payload a single record may carry.
pub const MAX_PAYLOAD: usize = 4096;

/// Record type identifiers as they appear on the wire.
///
/// The numeric values are part of the protocol; both peers reject values
/// outside this table. Direction notes:
/// - client → server: `OpenBash`, `OpenCmd`, `WindowSize`, `ClientData`,
///   `FileUploadStart`, `FileDownloadStart`
/// - server → client: `PtyData`, `ClientEnd`, `FileReadySend`, `FileReadyRecv`
/// - both: `FileData`, `FileDataBegin`, `FileDataEnd`, `FileDataEndAck`
#[derive(TryFromPrimitive)]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Raw PTY output relayed to the client.
    PtyData = 0x07,
    /// Open an interactive shell session.
    OpenBash = 0x08,
    /// Open a one-shot command session; payload is the command line.
    OpenCmd = 0x09,
    /// Terminal window dimensions, u16×4 little-endian.
    WindowSize = 0x0A,
    /// Raw keystrokes destined for the PTY.
    ClientData = 0x0B,
    /// The session is closing.
    ClientEnd = 0x0C,
    /// Request to upload a file; payload is `"<src> <dest>"`.
    FileUploadStart = 0x0D,
    /// Request to download a file; payload is `"<src> <dest>"`.
    FileDownloadStart = 0x0E,
    /// Server verdict on an upload request: `"OK ..."` or `"KO <reason>"`.
    FileReadySend = 0x0F,
    /// Server verdict on a download request, same encoding.
    FileReadyRecv = 0x10,
    /// One chunk of file bytes, 1..=4096.
    FileData = 0x11,
    /// End of the file byte stream.
    FileDataEnd = 0x12,
    /// Start of the file byte stream.
    FileDataBegin = 0x13,
    /// Acknowledgement that the receiving side closed its file.
    FileDataEndAck = 0x14,
}

/// One protocol record: a type tag plus its payload.
///
/// Payloads are detached from the receive buffer as owned [`Bytes`], so a
/// record stays valid after the decoder reclaims its buffer space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub payload: Bytes,
}

impl Record {
    pub fn new(record_type: RecordType, payload: Bytes) -> Self {
        Self {
            record_type,
            payload,
        }
    }

    pub fn open_bash() -> Self {
        Self::new(RecordType::OpenBash, Bytes::new())
    }

    pub fn open_cmd(command: &str) -> Self {
        Self::new(RecordType::OpenCmd, encode_text(command))
    }

    pub fn window_size(size: WindowSize) -> Self {
        Self::new(RecordType::WindowSize, Bytes::copy_from_slice(&size.encode()))
    }

    pub fn client_data(data: &[u8]) -> Self {
        Self::new(RecordType::ClientData, Bytes::copy_from_slice(data))
    }

    pub fn pty_data(data: &[u8]) -> Self {
        Self::new(RecordType::PtyData, Bytes::copy_from_slice(data))
    }

    pub fn client_end() -> Self {
        Self::new(RecordType::ClientEnd, Bytes::new())
    }

    pub fn upload_start(source: &str, dest: &str) -> Self {
        Self::new(
            RecordType::FileUploadStart,
            encode_text(&format!("{source} {dest}")),
        )
    }

    pub fn download_start(source: &str, dest: &str) -> Self {
        Self::new(
            RecordType::FileDownloadStart,
            encode_text(&format!("{source} {dest}")),
        )
    }

    pub fn ready_send(reply: &ReadyReply) -> Self {
        Self::new(RecordType::FileReadySend, encode_text(&reply.to_wire()))
    }

    pub fn ready_recv(reply: &ReadyReply) -> Self {
        Self::new(RecordType::FileReadyRecv, encode_text(&reply.to_wire()))
    }

    pub fn file_data(data: &[u8]) -> Self {
        Self::new(RecordType::FileData, Bytes::copy_from_slice(data))
    }

    pub fn file_data_begin() -> Self {
        Self::new(RecordType::FileDataBegin, Bytes::new())
    }

    pub fn file_data_end() -> Self {
        Self::new(RecordType::FileDataEnd, Bytes::new())
    }

    pub fn file_data_end_ack() -> Self {
        Self::new(RecordType::FileDataEndAck, Bytes::new())
    }

    /// Size of this record once framed: header plus payload.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode the framed record into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PROTOCOL_MAGIC);
        buf.put_u32_le(self.record_type as u32);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// Terminal dimensions as carried by a `WindowSize` record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

impl WindowSize {
    /// Wire size of the payload: four little-endian u16 fields.
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..2].copy_from_slice(&self.rows.to_le_bytes());
        out[2..4].copy_from_slice(&self.cols.to_le_bytes());
        out[4..6].copy_from_slice(&self.xpixel.to_le_bytes());
        out[6..8].copy_from_slice(&self.ypixel.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() != Self::WIRE_SIZE {
            return Err(PayloadError::BadLength {
                what: "window size",
                expected: Self::WIRE_SIZE,
                actual: payload.len(),
            });
        }
        let u16_at = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
        Ok(Self {
            rows: u16_at(0),
            cols: u16_at(2),
            xpixel: u16_at(4),
            ypixel: u16_at(6),
        })
    }

    pub fn from_winsize(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            xpixel: ws.ws_xpixel,
            ypixel: ws.ws_ypixel,
        }
    }

    pub fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.xpixel,
            ws_ypixel: self.ypixel,
        }
    }
}

/// Server verdict on a transfer request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadyReply {
    /// The transfer may proceed; carries the echoed `"<src> <dest>"` pair.
    Ok(String),
    /// The transfer was refused for the given reason.
    Refused(String),
}

impl ReadyReply {
    pub fn ok(source: &str, dest: &str) -> Self {
        Self::Ok(format!("{source} {dest}"))
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self::Refused(reason.into())
    }

    fn to_wire(&self) -> String {
        match self {
            Self::Ok(detail) => format!("OK {detail}"),
            Self::Refused(reason) => format!("KO {reason}"),
        }
    }

    /// Parse a ready reply payload.
    ///
    /// The `OK` token must match exactly: either the whole payload or
    /// followed by a space. A payload merely starting with the letters
    /// `OK` (say, `OKAY`) is rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        let text = decode_text(payload)?;
        if text == "OK" {
            return Ok(Self::Ok(String::new()));
        }
        if let Some(detail) = text.strip_prefix("OK ") {
            return Ok(Self::Ok(detail.to_string()));
        }
        if text == "KO" {
            return Ok(Self::Refused(String::new()));
        }
        if let Some(reason) = text.strip_prefix("KO ") {
            return Ok(Self::Refused(reason.to_string()));
        }
        Err(PayloadError::Malformed("ready reply"))
    }
}

/// Errors raised while interpreting record payloads.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{what} payload must be {expected} bytes, got {actual}")]
    BadLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// Encode a text payload with the protocol's trailing NUL.
pub fn encode_text(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Decode a NUL-terminated text payload.
///
/// A single trailing NUL is stripped when present; embedded NULs are
/// rejected.
pub fn decode_text(payload: &[u8]) -> Result<&str, PayloadError> {
    let text = match payload.last() {
        Some(0) => &payload[..payload.len() - 1],
        _ => payload,
    };
    if text.contains(&0) {
        return Err(PayloadError::Malformed("text"));
    }
    std::str::from_utf8(text).map_err(|_| PayloadError::NotUtf8)
}

/// Split a `"<src> <dest>"` request payload on the first space.
pub fn split_path_pair(text: &str) -> Option<(&str, &str)> {
    let (source, dest) = text.split_once(' ')?;
    if source.is_empty() || dest.is_empty() {
        return None;
    }
    Some((source, dest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_roundtrip() {
        for raw in 0x07u32..=0x14 {
            let ty = RecordType::try_from(raw).unwrap();
            assert_eq!(ty as u32, raw);
        }
        assert!(RecordType::try_from(0x06u32).is_err());
        assert!(RecordType::try_from(0x15u32).is_err());
    }

    #[test]
    fn window_size_roundtrip() {
        let size = WindowSize {
            rows: 40,
            cols: 120,
            xpixel: 960,
            ypixel: 640,
        };
        let decoded = WindowSize::decode(&size.encode()).unwrap();
        assert_eq!(size, decoded);
    }

    #[test]
    fn window_size_rejects_short_payload() {
        assert!(WindowSize::decode(&[0u8; 7]).is_err());
        assert!(WindowSize::decode(&[0u8; 9]).is_err());
    }

    #[test]
    fn text_payloads_are_nul_terminated() {
        let rec = Record::open_cmd("ls -la");
        assert_eq!(rec.payload.as_ref(), b"ls -la\0");
        assert_eq!(decode_text(&rec.payload).unwrap(), "ls -la");
    }

    #[test]
    fn decode_text_rejects_embedded_nul() {
        assert!(decode_text(b"a\0b\0").is_err());
    }

    #[test]
    fn ready_reply_requires_exact_ok_token() {
        let ok = Record::ready_send(&ReadyReply::ok("/a", "/b"));
        assert_eq!(
            ReadyReply::parse(&ok.payload).unwrap(),
            ReadyReply::Ok("/a /b".to_string())
        );

        let ko = Record::ready_recv(&ReadyReply::refused("no such file"));
        assert_eq!(
            ReadyReply::parse(&ko.payload).unwrap(),
            ReadyReply::Refused("no such file".to_string())
        );

        assert!(ReadyReply::parse(b"OKAY /a /b\0").is_err());
        assert!(ReadyReply::parse(b"sure\0").is_err());
    }

    #[test]
    fn path_pair_splits_on_first_space() {
        assert_eq!(
            split_path_pair("/tmp/a /tmp/b c"),
            Some(("/tmp/a", "/tmp/b c"))
        );
        assert_eq!(split_path_pair("alone"), None);
        assert_eq!(split_path_pair(" lead"), None);
    }

    #[test]
    fn encode_matches_header_layout() {
        let rec = Record::file_data(b"abc");
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 3);
        assert_eq!(&buf[0..4], &PROTOCOL_MAGIC.to_le_bytes());
        assert_eq!(&buf[4..8], &(RecordType::FileData as u32).to_le_bytes());
        assert_eq!(&buf[8..12], &3u32.to_le_bytes());
        assert_eq!(&buf[12..], b"abc");
    }
}
