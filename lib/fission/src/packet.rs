use crate::shared::{ErrorType, SockError, SockResult};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;

/// The largest slice handed to the write hook in one call. File packets are
/// streamed through a scratch buffer of this size so memory stays bounded
/// regardless of file length.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Maximum number of packets a single connection may have queued. Exceeding
/// the cap surfaces `QueueFull` to the writer.
pub const QUEUE_LIMIT: usize = 4096;

/// The payload carried by a packet. Memory packets own (possibly shared)
/// bytes; file packets stream a descriptor range. Either way the resource
/// is released when the packet is dropped.
pub enum PacketData {
    Memory(Bytes),
    File(File),
}

/// One unit on a connection's write queue.
pub struct Packet {
    data: PacketData,
    offset: u64,
    remaining: u64,
}

impl Packet {
    /// Builds a memory packet over `offset..offset + length` of `bytes`.
    /// `length` of zero means "to the end of the buffer".
    pub fn memory(bytes: Bytes, offset: u64, length: u64) -> SockResult<Packet> {
        let total = bytes.len() as u64;

        if offset > total {
            return Err(SockError::Fatal(ErrorType::Capacity));
        }

        let remaining = match length {
            0 => total - offset,
            len if offset + len <= total => len,
            _ => return Err(SockError::Fatal(ErrorType::Capacity)),
        };

        Ok(Packet {
            data: PacketData::Memory(bytes),
            offset,
            remaining,
        })
    }

    /// Builds a file packet sending `length` bytes starting at `offset`.
    pub fn file(file: File, offset: u64, length: u64) -> Packet {
        Packet {
            data: PacketData::File(file),
            offset,
            remaining: length,
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Produces the next chunk of at most `BLOCK_SIZE` bytes. Memory chunks
    /// are zero-copy slices of the shared buffer; file chunks are read into
    /// `scratch` at the packet's current offset.
    pub fn chunk<'a>(&self, scratch: &'a mut [u8; BLOCK_SIZE]) -> SockResult<Chunk<'a>> {
        let want = self.remaining.min(BLOCK_SIZE as u64) as usize;

        match &self.data {
            PacketData::Memory(bytes) => {
                let start = self.offset as usize;
                Ok(Chunk::Memory(bytes.slice(start..start + want)))
            }
            PacketData::File(file) => {
                let read = file.read_at(&mut scratch[..want], self.offset)?;

                if read == 0 {
                    // Early EOF: the caller asked for more than the file
                    // holds. Treat the packet as exhausted.
                    return Err(SockError::Fatal(ErrorType::Eof));
                }

                Ok(Chunk::File(&scratch[..read]))
            }
        }
    }

    /// Advances the packet cursor after `written` bytes were accepted by
    /// the write hook.
    #[inline]
    pub fn advance(&mut self, written: u64) {
        debug_assert!(written <= self.remaining);
        self.offset += written;
        self.remaining -= written;
    }
}

pub enum Chunk<'a> {
    Memory(Bytes),
    File(&'a [u8]),
}

impl<'a> Chunk<'a> {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Memory(bytes) => &bytes[..],
            Chunk::File(slice) => slice,
        }
    }
}

/// The per-connection packet queue. Urgent packets are inserted after the
/// in-flight head (a partially written packet is never preempted), all
/// others are appended at the tail.
pub struct PacketQueue {
    packets: VecDeque<Packet>,
    head_started: bool,
}

impl PacketQueue {
    #[inline]
    pub fn new() -> PacketQueue {
        PacketQueue {
            packets: VecDeque::new(),
            head_started: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Enqueues a packet, honouring the urgent flag and the queue cap.
    pub fn push(&mut self, packet: Packet, urgent: bool) -> SockResult<()> {
        if self.packets.len() >= QUEUE_LIMIT {
            return Err(SockError::QueueFull);
        }

        if urgent {
            let at = if self.head_started && !self.packets.is_empty() {
                1
            } else {
                0
            };
            self.packets.insert(at, packet);
        } else {
            self.packets.push_back(packet);
        }

        Ok(())
    }

    /// Borrows the head packet for chunk production.
    #[inline]
    pub fn head(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    /// Records that the head packet was partially transmitted, pinning it
    /// against urgent insertion.
    #[inline]
    pub fn mark_head_started(&mut self) {
        self.head_started = true;
    }

    /// Drops the completed head packet.
    #[inline]
    pub fn pop_head(&mut self) -> Option<Packet> {
        self.head_started = false;
        self.packets.pop_front()
    }

    /// Discards the whole queue, releasing every packet's resources.
    #[inline]
    pub fn clear(&mut self) {
        self.head_started = false;
        self.packets.clear();
    }
}
