//! Double-buffered handoff between the sampling routine and the streaming loop.
//!
//! Two fixed buffers of `N + 3` words. The [`ChunkWriter`] (real-time side) fills
//! one while the [`ChunkReader`] (polling side) drains the other. When the write
//! buffer is full the writer swaps the designation and raises the ready flag as its
//! last store; the reader only touches the send buffer after observing the flag
//! (acquire) and hands it back by clearing the flag (release).
//!
//! If a buffer fills while the previous one is still waiting to be sent, the
//! writer keeps its designation, discards the fill, and counts an overrun. The
//! number of fills discarded since the last handoff travels with the next ready
//! buffer, and the reader skips that many sequence numbers so the host sees the
//! gap exactly where the data went missing.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;

use crate::errors::{PhotometryError, Result};
use crate::hardware::HostLink;
use crate::protocol::{checksum, TRAILER_WORDS};

struct Shared {
    buffers: [Box<[AtomicU16]>; 2],
    data_len: usize,
    /// Index of the buffer currently being written.
    write_buf: AtomicUsize,
    ready: AtomicBool,
    /// Fills discarded just before the ready buffer; written only while `ready` is clear.
    skipped: AtomicU32,
    overruns: AtomicU32,
}

/// Allocate the buffer pair for chunks of `buffer_size` samples.
pub fn exchange(buffer_size: usize) -> Result<(ChunkWriter, ChunkReader)> {
    if buffer_size == 0 || buffer_size % 2 != 0 {
        return Err(PhotometryError::InvalidBufferSize(buffer_size));
    }
    let words = buffer_size + TRAILER_WORDS;
    let alloc = || (0..words).map(|_| AtomicU16::new(0)).collect::<Box<[_]>>();
    let shared = Arc::new(Shared {
        buffers: [alloc(), alloc()],
        data_len: buffer_size,
        write_buf: AtomicUsize::new(0),
        ready: AtomicBool::new(false),
        skipped: AtomicU32::new(0),
        overruns: AtomicU32::new(0),
    });

    let writer = ChunkWriter {
        shared: Arc::clone(&shared),
        write_buf: 0,
        write_ind: 0,
        discarded: 0,
    };
    let reader = ChunkReader {
        shared,
        sequence: 0,
        frame: Vec::with_capacity(words * 2),
    };
    Ok((writer, reader))
}

/// Producer half, owned by the sampling routine.
pub struct ChunkWriter {
    shared: Arc<Shared>,
    write_buf: usize,
    write_ind: usize,
    discarded: u32,
}

impl ChunkWriter {
    /// Index the next word will be written to.
    #[inline]
    pub fn write_index(&self) -> usize {
        self.write_ind
    }

    /// Store a sample word. Returns `true` if it completed a chunk that is now
    /// ready to send.
    #[inline]
    pub fn push(&mut self, word: u16) -> bool {
        self.shared.buffers[self.write_buf][self.write_ind].store(word, Ordering::Relaxed);
        self.write_ind = (self.write_ind + 1) % self.shared.data_len;
        if self.write_ind == 0 {
            self.complete()
        } else {
            false
        }
    }

    fn complete(&mut self) -> bool {
        let shared = &*self.shared;
        if shared.ready.load(Ordering::Acquire) {
            self.discarded = self.discarded.wrapping_add(1);
            shared.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.write_buf = 1 - self.write_buf;
        shared.write_buf.store(self.write_buf, Ordering::Relaxed);
        shared.skipped.store(self.discarded, Ordering::Relaxed);
        self.discarded = 0;
        shared.ready.store(true, Ordering::Release);
        true
    }
}

/// Consumer half, owned by the streaming loop.
pub struct ChunkReader {
    shared: Arc<Shared>,
    sequence: u16,
    frame: Vec<u8>,
}

impl ChunkReader {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Sequence number of the last chunk sent (0 before the first).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Buffers discarded because the previous chunk had not been sent in time.
    pub fn overruns(&self) -> u32 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// Send the ready chunk, if any. Returns its sequence number.
    ///
    /// The send buffer is serialised and released before the (slow) transmit, so
    /// the sampling routine gets the whole transmit time to fill the other buffer.
    pub fn send_ready<L>(&mut self, link: &mut L) -> io::Result<Option<u16>>
    where
        L: HostLink + ?Sized,
    {
        if !self.is_ready() {
            return Ok(None);
        }

        let shared = &*self.shared;
        let dropped = shared.skipped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(
                "Buffer overrun: {} chunk(s) discarded after chunk {}",
                dropped, self.sequence
            );
        }
        self.sequence = self
            .sequence
            .wrapping_add(1)
            .wrapping_add(dropped as u16);

        let send_buf = &shared.buffers[1 - shared.write_buf.load(Ordering::Relaxed)];
        let n = shared.data_len;
        let sum = checksum(send_buf[..n].iter().map(|w| w.load(Ordering::Relaxed)));
        send_buf[n].store(self.sequence, Ordering::Relaxed);
        send_buf[n + 1].store(sum, Ordering::Relaxed);
        send_buf[n + 2].store(0, Ordering::Relaxed);

        self.frame.clear();
        for word in send_buf.iter() {
            self.frame
                .extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        shared.ready.store(false, Ordering::Release);

        link.send(&self.frame)?;
        Ok(Some(self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::chunk_len_bytes;
    use crate::sim::MemoryLink;

    fn words(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_rejects_odd_or_empty_buffers() {
        assert!(matches!(exchange(0), Err(PhotometryError::InvalidBufferSize(0))));
        assert!(matches!(exchange(7), Err(PhotometryError::InvalidBufferSize(7))));
    }

    #[test]
    fn test_nothing_sent_until_full() {
        let (mut writer, mut reader) = exchange(4).unwrap();
        let mut link = MemoryLink::new();
        for w in 0..3 {
            assert!(!writer.push(w));
        }
        assert_eq!(reader.send_ready(&mut link).unwrap(), None);
        assert!(link.outbound().is_empty());
        assert!(writer.push(3));
        assert!(reader.is_ready());
    }

    #[test]
    fn test_chunk_layout() {
        let (mut writer, mut reader) = exchange(4).unwrap();
        let mut link = MemoryLink::new();
        for w in [10, 20, 30, 0xFFFF] {
            writer.push(w);
        }
        assert_eq!(reader.send_ready(&mut link).unwrap(), Some(1));
        assert!(!reader.is_ready());

        let sent = link.take_outbound();
        assert_eq!(sent.len(), chunk_len_bytes(4));
        // 10 + 20 + 30 + 0xFFFF = 0x1003B → 0x003B
        assert_eq!(words(&sent), vec![10, 20, 30, 0xFFFF, 1, 0x003B, 0]);
    }

    #[test]
    fn test_checksums_for_zero_max_and_mixed_data() {
        let n = 64;
        let (mut writer, mut reader) = exchange(n).unwrap();
        let mut link = MemoryLink::new();

        let patterns: Vec<Vec<u16>> = vec![
            vec![0; n],
            vec![u16::MAX; n],
            (0..n as u32).map(|i| (i.wrapping_mul(40_503).wrapping_add(17) % 65_536) as u16).collect(),
        ];
        for data in &patterns {
            for &w in data {
                writer.push(w);
            }
            reader.send_ready(&mut link).unwrap();
            let sent = words(&link.take_outbound());
            let wide: u32 = data.iter().map(|&w| u32::from(w)).sum();
            assert_eq!(&sent[..n], &data[..]);
            assert_eq!(sent[n + 1], (wide % 65_536) as u16);
            assert_eq!(sent[n + 2], 0);
        }
    }

    #[test]
    fn test_buffers_alternate_and_sequence_increments() {
        let (mut writer, mut reader) = exchange(2).unwrap();
        let mut link = MemoryLink::new();
        for chunk in 0..5u16 {
            writer.push(chunk * 2);
            writer.push(chunk * 2 + 1);
            assert_eq!(reader.send_ready(&mut link).unwrap(), Some(chunk + 1));
            let sent = words(&link.take_outbound());
            assert_eq!(&sent[..2], &[chunk * 2, chunk * 2 + 1]);
        }
        assert_eq!(reader.overruns(), 0);
    }

    #[test]
    fn test_overrun_keeps_pending_chunk_and_skips_sequence() {
        let (mut writer, mut reader) = exchange(2).unwrap();
        let mut link = MemoryLink::new();

        writer.push(1);
        assert!(writer.push(2));
        // Reader is late: the next fill is discarded, not swapped in.
        writer.push(3);
        assert!(!writer.push(4));
        assert_eq!(reader.overruns(), 1);

        // The pending chunk keeps its number; the gap follows it.
        assert_eq!(reader.send_ready(&mut link).unwrap(), Some(1));
        let sent = words(&link.take_outbound());
        assert_eq!(&sent[..2], &[1, 2]);

        writer.push(5);
        assert!(writer.push(6));
        assert_eq!(reader.send_ready(&mut link).unwrap(), Some(3));
        assert_eq!(&words(&link.take_outbound())[..2], &[5, 6]);

        writer.push(7);
        assert!(writer.push(8));
        assert_eq!(reader.send_ready(&mut link).unwrap(), Some(4));
        assert_eq!(reader.overruns(), 1);
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut writer, mut reader) = exchange(2).unwrap();
        let mut link = MemoryLink::new();
        reader.sequence = u16::MAX;
        writer.push(0);
        writer.push(0);
        assert_eq!(reader.send_ready(&mut link).unwrap(), Some(0));
    }
}
