//! Per-stream reassembly and send-queue buffers (section 4.B), grounded in
//! the original `MozQuicStreamChunk`/`MozQuicStreamIn`/`MozQuicStreamOut`.

use crate::result::{QuicheError, QuicheResult};

/// Maximum payload carried by a single chunk.
pub const MSS: usize = 16384;

/// An immutable span of stream bytes, plus retransmit bookkeeping once it
/// has been handed to the reliability queue (section 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub stream_id: u32,
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
    pub packet_number: Option<u64>,
    pub transmit_count: u16,
    pub retransmitted: bool,
}

impl StreamChunk {
    pub fn new(stream_id: u32, offset: u64, data: Vec<u8>, fin: bool) -> Self {
        Self {
            stream_id,
            offset,
            data,
            fin,
            packet_number: None,
            transmit_count: 0,
            retransmitted: false,
        }
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Produces the retransmit clone: a fresh carrier for the same bytes,
    /// distinct from the original so the original is never sent twice.
    pub fn retransmit_clone(&self) -> Self {
        Self {
            stream_id: self.stream_id,
            offset: self.offset,
            data: self.data.clone(),
            fin: self.fin,
            packet_number: None,
            transmit_count: self.transmit_count,
            retransmitted: false,
        }
    }
}

/// Receive-side reassembly buffer for one stream.
#[derive(Debug, Default)]
pub struct StreamIn {
    absorbed: u64,
    fin_offset: Option<u64>,
    fin_recvd: bool,
    fin_given_to_app: bool,
    available: Vec<StreamChunk>,
}

impl StreamIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a chunk, trimming any prefix already delivered or already
    /// queued, and coalescing it into sorted, disjoint order.
    pub fn supply(&mut self, mut chunk: StreamChunk) -> QuicheResult<()> {
        if chunk.end_offset() <= self.absorbed {
            return Ok(());
        }
        if chunk.offset < self.absorbed {
            let trim = (self.absorbed - chunk.offset) as usize;
            chunk.data.drain(0..trim);
            chunk.offset = self.absorbed;
        }

        if chunk.fin {
            if let Some(existing_fin) = self.fin_offset {
                if chunk.end_offset() != existing_fin {
                    return Err(QuicheError::protocol(
                        "stream fin offset mismatch between chunks",
                    ));
                }
            }
            self.fin_offset = Some(chunk.end_offset());
            self.fin_recvd = true;
        } else if let Some(fin_offset) = self.fin_offset {
            if chunk.end_offset() > fin_offset {
                return Err(QuicheError::protocol(
                    "stream data extends past declared fin offset",
                ));
            }
        }

        let insert_at = self
            .available
            .iter()
            .position(|existing| existing.offset >= chunk.offset)
            .unwrap_or(self.available.len());

        if let Some(prev) = insert_at.checked_sub(1).and_then(|i| self.available.get(i)) {
            if prev.end_offset() >= chunk.end_offset() {
                return Ok(());
            }
            if prev.end_offset() > chunk.offset {
                let trim = (prev.end_offset() - chunk.offset) as usize;
                chunk.data.drain(0..trim);
                chunk.offset = prev.end_offset();
            }
        }

        if let Some(next) = self.available.get(insert_at) {
            if chunk.end_offset() > next.offset {
                if next.offset <= chunk.offset {
                    return Ok(());
                }
                let new_len = (next.offset - chunk.offset) as usize;
                chunk.data.truncate(new_len);
            }
        }

        if chunk.data.is_empty() {
            return Ok(());
        }
        self.available.insert(insert_at, chunk);
        Ok(())
    }

    /// Delivers up to `avail` contiguous bytes starting at the absorbed
    /// offset. Returns the delivered bytes and whether fin was reached.
    pub fn read(&mut self, avail: usize) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        while let Some(front) = self.available.first() {
            if front.offset != self.absorbed {
                break;
            }
            if out.len() >= avail {
                break;
            }
            let take = (avail - out.len()).min(front.data.len());
            if take == front.data.len() {
                let chunk = self.available.remove(0);
                self.absorbed += chunk.data.len() as u64;
                out.extend(chunk.data);
            } else {
                out.extend_from_slice(&front.data[..take]);
                self.absorbed += take as u64;
                let front = &mut self.available[0];
                front.data.drain(0..take);
                front.offset += take as u64;
                break;
            }
        }

        let fin = self.fin_offset == Some(self.absorbed);
        if fin {
            self.fin_given_to_app = true;
        }
        (out, fin)
    }

    pub fn empty(&self) -> bool {
        self.available.is_empty()
    }

    pub fn done(&self) -> bool {
        self.fin_offset == Some(self.absorbed) && self.fin_given_to_app
    }
}

/// Send-side buffer for one stream: assigns sequential offsets and breaks
/// writes into MSS-sized chunks.
#[derive(Debug)]
pub struct StreamOut {
    stream_id: u32,
    next_offset: u64,
    fin_written: bool,
}

impl StreamOut {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            next_offset: 0,
            fin_written: false,
        }
    }

    /// Splits `data` into <= MSS chunks with sequential offsets, marking fin
    /// on the final chunk iff `fin` is set. The caller enqueues the
    /// returned chunks onto the connection's unwritten queue.
    pub fn write(&mut self, data: &[u8], fin: bool) -> QuicheResult<Vec<StreamChunk>> {
        if self.fin_written {
            return Err(QuicheError::misuse("write after stream fin"));
        }

        let mut chunks = Vec::new();
        if data.is_empty() {
            if fin {
                chunks.push(StreamChunk::new(self.stream_id, self.next_offset, vec![], true));
                self.fin_written = true;
            }
            return Ok(chunks);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(MSS);
            let (piece, remainder) = rest.split_at(take);
            let is_last = remainder.is_empty();
            chunks.push(StreamChunk::new(
                self.stream_id,
                self.next_offset,
                piece.to_vec(),
                is_last && fin,
            ));
            self.next_offset += piece.len() as u64;
            rest = remainder;
        }
        if fin {
            self.fin_written = true;
        }
        Ok(chunks)
    }

    pub fn end_stream(&mut self) -> QuicheResult<Vec<StreamChunk>> {
        self.write(&[], true)
    }

    pub fn done(&self) -> bool {
        self.fin_written
    }
}

/// A stream's in-side and out-side together (section 3).
#[derive(Debug)]
pub struct StreamPair {
    pub stream_id: u32,
    pub out: StreamOut,
    pub in_: StreamIn,
}

impl StreamPair {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            out: StreamOut::new(stream_id),
            in_: StreamIn::new(),
        }
    }

    /// All data and fin given to the application, and all written data has
    /// been transmitted (emptied from the unwritten/unacked queues by the
    /// caller). `outbound_drained` captures that last condition, since the
    /// reliability queues live on the connection, not the stream.
    pub fn done(&self, outbound_drained: bool) -> bool {
        self.in_.done() && self.out.done() && outbound_drained
    }
}

/// The first client-initiated application stream ID. Stream 0 is reserved
/// for the handshake and excluded from this allocator (section 9, resolved
/// open question i).
pub const FIRST_CLIENT_STREAM_ID: u32 = 3;
/// The first server-initiated application stream ID.
pub const FIRST_SERVER_STREAM_ID: u32 = 2;
/// Both allocators step by 4 to keep client streams odd and server streams
/// even while skipping stream 0.
pub const STREAM_ID_STEP: u32 = 4;
