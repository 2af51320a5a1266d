// ABOUTME: Per-connection frame queue: RX assembly buffer plus TX ring with saturation
// ABOUTME: Assembles typed records out of arbitrary stream chunking and buffers outbound traffic

use std::os::fd::{AsRawFd, BorrowedFd};

use bytes::Bytes;
use nix::errno::Errno;
use nix::unistd;
use thiserror::Error;

use crate::record::{HEADER_SIZE, MAX_PAYLOAD, PROTOCOL_MAGIC, Record, RecordType};

/// RX assembly buffer capacity. A linear buffer, compacted after each
/// consumed record.
pub const RX_CAPACITY: usize = 100 * 1024;

/// TX ring capacity.
pub const TX_CAPACITY: usize = 1024 * 1024;

/// Pending bytes above this mark the queue as saturated.
pub const SATURATION_THRESHOLD: usize = TX_CAPACITY / 2;

/// Errors surfaced by the frame queue.
///
/// `BufferFull` asks the caller to back off and retry after a flush; the
/// other variants are fatal for the connection they occur on. The queue
/// never closes file descriptors; its owner does.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("TX ring full: need {need} contiguous bytes, have {have}")]
    BufferFull { need: usize, have: usize },

    #[error("invalid protocol magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("payload length {0} exceeds the {MAX_PAYLOAD}-byte limit")]
    InvalidLength(u32),

    #[error("unknown record type {0:#06x}")]
    UnknownType(u32),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Outcome of a single receive attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Receive {
    /// Bytes were appended to the RX buffer.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// The peer closed its end of the stream.
    Closed,
}

/// Framing buffer pair for one stream socket.
///
/// The queue is owned by the session (server) or driver (client) using the
/// socket; its lifetime is the connection's. Outbound records are framed
/// into a ring flushed with single contiguous writes; inbound chunks are
/// assembled in a linear buffer until a whole record is available.
///
/// Records are never split across the ring's wrap seam: an enqueue fails
/// with `BufferFull` when the contiguous run is too small, even if
/// non-contiguous space would suffice. This under-uses the ring but keeps
/// records un-fragmented and the flush a single write. Both offsets reset
/// to zero whenever the ring drains, so seam waste only persists while
/// bytes are in flight.
#[derive(Debug)]
pub struct FrameQueue {
    rx: Box<[u8]>,
    rx_len: usize,
    tx: Box<[u8]>,
    tx_start: usize,
    tx_end: usize,
    tx_pending: usize,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            rx: vec![0u8; RX_CAPACITY].into_boxed_slice(),
            rx_len: 0,
            tx: vec![0u8; TX_CAPACITY].into_boxed_slice(),
            tx_start: 0,
            tx_end: 0,
            tx_pending: 0,
        }
    }

    /// Frame `record` into the TX ring.
    pub fn enqueue(&mut self, record: &Record) -> Result<(), QueueError> {
        let payload = record.payload.as_ref();
        if payload.len() > MAX_PAYLOAD {
            return Err(QueueError::InvalidLength(payload.len() as u32));
        }

        if self.tx_pending == 0 {
            self.tx_start = 0;
            self.tx_end = 0;
        }

        let need = HEADER_SIZE + payload.len();
        let have = self.contiguous_free();
        if need > have {
            return Err(QueueError::BufferFull { need, have });
        }

        let at = self.tx_end;
        self.tx[at..at + 4].copy_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        self.tx[at + 4..at + 8].copy_from_slice(&(record.record_type as u32).to_le_bytes());
        self.tx[at + 8..at + 12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.tx[at + HEADER_SIZE..at + need].copy_from_slice(payload);

        self.tx_end = at + need;
        if self.tx_end == TX_CAPACITY {
            self.tx_end = 0;
        }
        self.tx_pending += need;
        Ok(())
    }

    /// Whether a record with `payload_len` bytes would fit right now.
    ///
    /// Producers that read data destructively (a file, a PTY) check this
    /// before reading so no bytes are picked up that cannot be framed.
    pub fn can_accept(&self, payload_len: usize) -> bool {
        HEADER_SIZE + payload_len <= self.contiguous_free()
    }

    /// The contiguous run available at the write position.
    ///
    /// An empty ring counts as full capacity: enqueue resets both offsets
    /// to zero before writing. A completely full ring has none; otherwise
    /// the run ends at the buffer edge (non-wrap case) or at the unflushed
    /// data (wrap case).
    fn contiguous_free(&self) -> usize {
        if self.tx_pending == 0 {
            TX_CAPACITY
        } else if self.tx_pending == TX_CAPACITY {
            0
        } else if self.tx_end >= self.tx_start {
            TX_CAPACITY - self.tx_end
        } else {
            self.tx_start - self.tx_end
        }
    }

    /// Bytes framed but not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.tx_pending
    }

    pub fn has_pending(&self) -> bool {
        self.tx_pending > 0
    }

    /// The cooperative backpressure signal: more than half the ring is
    /// pending. A hint, not a hard cap; enqueues only fail on contiguous
    /// space exhaustion.
    pub fn is_saturated(&self) -> bool {
        self.tx_pending > SATURATION_THRESHOLD
    }

    /// Write the contiguous run at the front of the ring to `fd` once.
    ///
    /// Partial progress advances the start offset; `EAGAIN` and `EINTR`
    /// are no-ops; any other error is logged and swallowed, since the next
    /// read on the socket will detect the dead peer.
    pub fn flush(&mut self, fd: BorrowedFd<'_>) {
        if self.tx_pending == 0 {
            return;
        }

        let run = if self.tx_end > self.tx_start {
            self.tx_end - self.tx_start
        } else {
            TX_CAPACITY - self.tx_start
        };

        match unistd::write(fd, &self.tx[self.tx_start..self.tx_start + run]) {
            Ok(written) => {
                self.tx_start += written;
                if self.tx_start == TX_CAPACITY {
                    self.tx_start = 0;
                }
                self.tx_pending -= written;
                if self.tx_pending == 0 {
                    self.tx_start = 0;
                    self.tx_end = 0;
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(err) => {
                tracing::warn!(error = %err, "socket write failed, deferring to read path");
            }
        }
    }

    /// Read once from `fd` into the RX buffer tail.
    pub fn receive(&mut self, fd: BorrowedFd<'_>) -> Result<Receive, QueueError> {
        if self.rx_len == RX_CAPACITY {
            // No room until buffered records are consumed.
            return Ok(Receive::WouldBlock);
        }

        match unistd::read(fd.as_raw_fd(), &mut self.rx[self.rx_len..]) {
            Ok(0) => Ok(Receive::Closed),
            Ok(count) => {
                self.rx_len += count;
                Ok(Receive::Data(count))
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(Receive::WouldBlock),
            Err(err) => Err(QueueError::Transport(err.into())),
        }
    }

    /// Pop the next complete record from the RX buffer, if any.
    ///
    /// A header whose magic differs from the protocol's aborts the
    /// connection; so do oversized lengths and unknown type values.
    pub fn next_record(&mut self) -> Result<Option<Record>, QueueError> {
        if self.rx_len < HEADER_SIZE {
            return Ok(None);
        }

        let u32_at =
            |buf: &[u8], i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        let magic = u32_at(&self.rx[..], 0);
        if magic != PROTOCOL_MAGIC {
            return Err(QueueError::InvalidMagic(magic));
        }

        let raw_type = u32_at(&self.rx[..], 4);
        let length = u32_at(&self.rx[..], 8);
        if length as usize > MAX_PAYLOAD {
            return Err(QueueError::InvalidLength(length));
        }

        let total = HEADER_SIZE + length as usize;
        if self.rx_len < total {
            return Ok(None);
        }

        let record_type =
            RecordType::try_from(raw_type).map_err(|_| QueueError::UnknownType(raw_type))?;
        let payload = Bytes::copy_from_slice(&self.rx[HEADER_SIZE..total]);

        // Shift the tail down over the consumed record.
        self.rx.copy_within(total..self.rx_len, 0);
        self.rx_len -= total;

        Ok(Some(Record::new(record_type, payload)))
    }

    /// Bytes currently buffered on the receive side.
    pub fn rx_buffered(&self) -> usize {
        self.rx_len
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, OwnedFd};

    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

    fn nonblocking_pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap()
    }

    fn drain_into(queue: &mut FrameQueue, fd: BorrowedFd<'_>) {
        loop {
            match queue.receive(fd).unwrap() {
                Receive::Data(_) => {}
                Receive::WouldBlock | Receive::Closed => break,
            }
        }
    }

    #[test]
    fn enqueue_flush_decode_identity() {
        let (a, b) = nonblocking_pair();
        let mut tx = FrameQueue::new();
        let mut rx = FrameQueue::new();

        let records = vec![
            Record::open_bash(),
            Record::open_cmd("printf abc"),
            Record::client_data(b"echo hi\n"),
            Record::file_data(&[0xA5; MAX_PAYLOAD]),
            Record::client_end(),
        ];
        for rec in &records {
            tx.enqueue(rec).unwrap();
        }
        while tx.has_pending() {
            tx.flush(a.as_fd());
        }

        drain_into(&mut rx, b.as_fd());
        for expected in &records {
            let got = rx.next_record().unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(rx.next_record().unwrap().is_none());
        assert_eq!(rx.rx_buffered(), 0);
    }

    #[test]
    fn wrong_magic_aborts_with_zero_records() {
        let (a, b) = nonblocking_pair();
        let mut rx = FrameQueue::new();

        let mut bad = Vec::new();
        bad.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        bad.extend_from_slice(&(RecordType::ClientEnd as u32).to_le_bytes());
        bad.extend_from_slice(&0u32.to_le_bytes());
        unistd::write(a.as_fd(), &bad).unwrap();

        drain_into(&mut rx, b.as_fd());
        assert!(matches!(
            rx.next_record(),
            Err(QueueError::InvalidMagic(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let (a, b) = nonblocking_pair();
        let mut rx = FrameQueue::new();

        let mut bad = Vec::new();
        bad.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        bad.extend_from_slice(&(RecordType::FileData as u32).to_le_bytes());
        bad.extend_from_slice(&(MAX_PAYLOAD as u32 + 1).to_le_bytes());
        unistd::write(a.as_fd(), &bad).unwrap();

        drain_into(&mut rx, b.as_fd());
        assert!(matches!(
            rx.next_record(),
            Err(QueueError::InvalidLength(4097))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let (a, b) = nonblocking_pair();
        let mut rx = FrameQueue::new();

        let mut bad = Vec::new();
        bad.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        bad.extend_from_slice(&0x99u32.to_le_bytes());
        bad.extend_from_slice(&0u32.to_le_bytes());
        unistd::write(a.as_fd(), &bad).unwrap();

        drain_into(&mut rx, b.as_fd());
        assert!(matches!(
            rx.next_record(),
            Err(QueueError::UnknownType(0x99))
        ));
    }

    #[test]
    fn partial_header_and_payload_wait_for_more_bytes() {
        let (a, b) = nonblocking_pair();
        let mut rx = FrameQueue::new();

        let rec = Record::client_data(b"hello");
        let mut wire = bytes::BytesMut::new();
        rec.encode(&mut wire);

        // One byte at a time: no record may surface before the last byte.
        for (i, byte) in wire.iter().enumerate() {
            unistd::write(a.as_fd(), std::slice::from_ref(byte)).unwrap();
            drain_into(&mut rx, b.as_fd());
            if i + 1 < wire.len() {
                assert!(rx.next_record().unwrap().is_none());
            }
        }
        assert_eq!(rx.next_record().unwrap().unwrap(), rec);
    }

    #[test]
    fn saturation_is_a_hint_not_a_cap() {
        let mut tx = FrameQueue::new();
        let chunk = Record::file_data(&[0u8; MAX_PAYLOAD]);
        while !tx.is_saturated() {
            tx.enqueue(&chunk).unwrap();
        }
        // Past the saturation mark, a max-size record may still fit.
        assert!(tx.can_accept(MAX_PAYLOAD));
        tx.enqueue(&chunk).unwrap();
        assert!(tx.pending_bytes() <= TX_CAPACITY);
    }

    #[test]
    fn buffer_full_only_on_contiguous_exhaustion() {
        let mut tx = FrameQueue::new();
        let chunk = Record::file_data(&[0u8; MAX_PAYLOAD]);
        let mut queued = 0usize;
        loop {
            match tx.enqueue(&chunk) {
                Ok(()) => queued += chunk.encoded_len(),
                Err(QueueError::BufferFull { need, have }) => {
                    assert!(have < need);
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(tx.pending_bytes(), queued);
        assert!(tx.pending_bytes() <= TX_CAPACITY);

        // Smaller records can still use the remaining contiguous run.
        if tx.can_accept(0) {
            tx.enqueue(&Record::client_end()).unwrap();
        }
    }

    #[test]
    fn ring_resets_when_drained() {
        let (a, b) = nonblocking_pair();
        let mut tx = FrameQueue::new();
        let mut sink = [0u8; 65536];

        // Push the offsets deep into the ring, then drain completely.
        for _ in 0..100 {
            tx.enqueue(&Record::file_data(&[7u8; MAX_PAYLOAD])).unwrap();
            while tx.has_pending() {
                tx.flush(a.as_fd());
                while let Ok(n) = unistd::read(b.as_raw_fd(), &mut sink) {
                    if n == 0 {
                        break;
                    }
                }
            }
        }
        // A drained ring accepts a maximal contiguous burst again.
        assert!(tx.can_accept(MAX_PAYLOAD));
        assert_eq!(tx.pending_bytes(), 0);
    }
}
