// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound framing.
//!
//! A [`Packer`] turns a list of byte spans into one framed [`Buffer`]. The
//! backing storage comes from a [`BufferAllocator`], either plain heap
//! allocation or a shared [`MemoryPool`].

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::error;

use super::frame::HeaderWidth;
use crate::message::Buffer;
use crate::utils::MemoryPool;
use crate::AppError::FramingOverflow;
use crate::AppResult;

/// Where packed buffers get their storage from.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, len: usize) -> BytesMut;

    /// Takes back storage of a buffer that has been written out.
    fn release(&self, _block: BytesMut) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> BytesMut {
        BytesMut::with_capacity(len)
    }
}

#[derive(Debug, Clone)]
pub struct PooledAllocator {
    pool: Arc<MemoryPool>,
}

impl PooledAllocator {
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        PooledAllocator { pool }
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }
}

impl BufferAllocator for PooledAllocator {
    fn allocate(&self, len: usize) -> BytesMut {
        self.pool.checkout(len)
    }

    fn release(&self, block: BytesMut) {
        self.pool.checkin(block);
    }
}

pub trait Packer: Send + Sync + fmt::Debug {
    /// Frames `spans` (in argument order) into one buffer. With `native` set
    /// no header/prefix/suffix is written.
    ///
    /// An empty payload yields an empty buffer.
    fn pack(&self, spans: &[&[u8]], native: bool) -> AppResult<Buffer>;

    /// The payload of an already framed message, without re-parsing it.
    fn raw_data<'a>(&self, msg: &'a [u8]) -> &'a [u8];

    /// Largest payload one framed message can carry.
    fn max_msg_size(&self) -> usize;

    fn reset(&self) {}

    /// Hands the storage of a written buffer back to the allocator.
    fn recycle(&self, _buffer: Buffer) {}
}

/// Computes `pre_len + Σ lens`, failing when the running sum wraps or exceeds
/// `capacity`.
pub(crate) fn msg_size_check<I>(pre_len: usize, lens: I, capacity: usize) -> AppResult<usize>
where
    I: IntoIterator<Item = usize>,
{
    let mut total_len = pre_len;
    for len in lens {
        total_len = match total_len.checked_add(len) {
            Some(total) if total <= capacity => total,
            _ => {
                error!("pack msg error: length exceeded the message buffer size {}", capacity);
                return Err(FramingOverflow(format!(
                    "message length exceeded the message buffer size {}",
                    capacity
                )));
            }
        };
    }
    if total_len > capacity {
        return Err(FramingOverflow(format!(
            "framing overhead {} exceeded the message buffer size {}",
            pre_len, capacity
        )));
    }
    Ok(total_len)
}

fn fill_spans(msg: &mut BytesMut, spans: &[&[u8]]) {
    for span in spans {
        msg.put_slice(span);
    }
}

/// Protocol: `[length][body]`, length counts the header too.
#[derive(Debug)]
pub struct LengthPrefixedPacker {
    header: HeaderWidth,
    capacity: usize,
    allocator: Arc<dyn BufferAllocator>,
}

impl LengthPrefixedPacker {
    pub fn new(header: HeaderWidth, capacity: usize) -> Self {
        Self::with_allocator(header, capacity, Arc::new(HeapAllocator))
    }

    pub fn with_allocator(
        header: HeaderWidth,
        capacity: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        LengthPrefixedPacker {
            header,
            capacity,
            allocator,
        }
    }
}

impl Packer for LengthPrefixedPacker {
    fn pack(&self, spans: &[&[u8]], native: bool) -> AppResult<Buffer> {
        let pre_len = if native { 0 } else { self.header.len() };
        let total_len = msg_size_check(pre_len, spans.iter().map(|s| s.len()), self.capacity)?;
        if total_len == pre_len {
            return Ok(Buffer::new());
        }
        if !native && total_len as u64 > self.header.max_frame_len() {
            error!("pack msg error: length exceeded the header's range!");
            return Err(FramingOverflow(format!(
                "frame length {} exceeded the {} byte header's range",
                total_len,
                self.header.len()
            )));
        }

        let mut msg = self.allocator.allocate(total_len);
        if !native {
            self.header.put(&mut msg, total_len);
        }
        fill_spans(&mut msg, spans);
        Ok(Buffer::from(msg))
    }

    fn raw_data<'a>(&self, msg: &'a [u8]) -> &'a [u8] {
        msg.get(self.header.len()..).unwrap_or_default()
    }

    fn max_msg_size(&self) -> usize {
        let max = (self.capacity as u64).min(self.header.max_frame_len()) as usize;
        max.saturating_sub(self.header.len())
    }

    fn recycle(&self, buffer: Buffer) {
        self.allocator.release(buffer.into_inner());
    }
}

/// Protocol: `[prefix][body][suffix]`.
#[derive(Debug)]
pub struct PrefixSuffixPacker {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    capacity: usize,
    allocator: Arc<dyn BufferAllocator>,
}

impl PrefixSuffixPacker {
    pub fn new(prefix: &[u8], suffix: &[u8], capacity: usize) -> AppResult<Self> {
        if suffix.is_empty() || prefix.len() + suffix.len() >= capacity {
            return Err(crate::AppError::InvalidValue(format!(
                "invalid prefix({})/suffix({}) for message buffer size {}",
                prefix.len(),
                suffix.len(),
                capacity
            )));
        }
        Ok(PrefixSuffixPacker {
            prefix: prefix.to_vec(),
            suffix: suffix.to_vec(),
            capacity,
            allocator: Arc::new(HeapAllocator),
        })
    }

    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn suffix(&self) -> &[u8] {
        &self.suffix
    }
}

impl Packer for PrefixSuffixPacker {
    fn pack(&self, spans: &[&[u8]], native: bool) -> AppResult<Buffer> {
        let pre_len = if native {
            0
        } else {
            self.prefix.len() + self.suffix.len()
        };
        let total_len = msg_size_check(pre_len, spans.iter().map(|s| s.len()), self.capacity)?;
        if total_len == pre_len {
            return Ok(Buffer::new());
        }

        let mut msg = self.allocator.allocate(total_len);
        if !native {
            msg.put_slice(&self.prefix);
        }
        fill_spans(&mut msg, spans);
        if !native {
            msg.put_slice(&self.suffix);
        }
        Ok(Buffer::from(msg))
    }

    fn raw_data<'a>(&self, msg: &'a [u8]) -> &'a [u8] {
        let end = msg.len().saturating_sub(self.suffix.len());
        msg.get(self.prefix.len()..end).unwrap_or_default()
    }

    fn max_msg_size(&self) -> usize {
        self.capacity - self.prefix.len() - self.suffix.len()
    }

    fn recycle(&self, buffer: Buffer) {
        self.allocator.release(buffer.into_inner());
    }
}

/// Protocol: none, spans are concatenated. `native` has no effect.
#[derive(Debug)]
pub struct RawPacker {
    capacity: usize,
    allocator: Arc<dyn BufferAllocator>,
}

impl RawPacker {
    pub fn new(capacity: usize) -> Self {
        Self::with_allocator(capacity, Arc::new(HeapAllocator))
    }

    pub fn with_allocator(capacity: usize, allocator: Arc<dyn BufferAllocator>) -> Self {
        RawPacker {
            capacity,
            allocator,
        }
    }
}

impl Packer for RawPacker {
    fn pack(&self, spans: &[&[u8]], _native: bool) -> AppResult<Buffer> {
        let total_len = msg_size_check(0, spans.iter().map(|s| s.len()), self.capacity)?;
        if total_len == 0 {
            return Ok(Buffer::new());
        }
        let mut msg = self.allocator.allocate(total_len);
        fill_spans(&mut msg, spans);
        Ok(Buffer::from(msg))
    }

    fn raw_data<'a>(&self, msg: &'a [u8]) -> &'a [u8] {
        msg
    }

    fn max_msg_size(&self) -> usize {
        self.capacity
    }

    fn recycle(&self, buffer: Buffer) {
        self.allocator.release(buffer.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    #[test]
    fn test_length_prefixed_concrete_bytes() {
        let packer = LengthPrefixedPacker::new(HeaderWidth::Two, 4000);
        let msg = packer.pack(&[b"AB", b"CD"], false).unwrap();
        // the header counts itself
        assert_eq!(msg.data(), &[0x00, 0x06, b'A', b'B', b'C', b'D']);
        assert_eq!(packer.raw_data(&msg), b"ABCD");
    }

    #[test]
    fn test_length_prefixed_native_has_no_header() {
        let packer = LengthPrefixedPacker::new(HeaderWidth::Four, 4000);
        let msg = packer.pack(&[b"AB", b"CD"], true).unwrap();
        assert_eq!(msg.data(), b"ABCD");
    }

    #[test]
    fn test_capacity_overflow() {
        let packer = LengthPrefixedPacker::new(HeaderWidth::Two, 8);
        let result = packer.pack(&[b"abc", b"defg"], false);
        assert!(matches!(result, Err(AppError::FramingOverflow(_))));

        // the same payload fits once the header is not counted
        assert_eq!(packer.pack(&[b"abc", b"defg"], true).unwrap().len(), 7);
    }

    #[test]
    fn test_header_range_overflow() {
        let packer = LengthPrefixedPacker::new(HeaderWidth::Two, 100_000);
        let payload = vec![7u8; 65_534];
        let result = packer.pack(&[&payload], false);
        assert!(matches!(result, Err(AppError::FramingOverflow(_))));

        let payload = vec![7u8; 65_533];
        let msg = packer.pack(&[&payload], false).unwrap();
        assert_eq!(msg.len(), 65_535);
        assert_eq!(&msg[..2], &[0xff, 0xff]);
    }

    #[test]
    fn test_wrapping_sum_is_rejected() {
        let result = msg_size_check(2, [usize::MAX - 1, 4], usize::MAX);
        assert!(matches!(result, Err(AppError::FramingOverflow(_))));
        assert_eq!(msg_size_check(2, [3, 4], 9).unwrap(), 9);
    }

    #[test]
    fn test_empty_payload_packs_to_empty_buffer() {
        let packer = LengthPrefixedPacker::new(HeaderWidth::Two, 64);
        assert!(packer.pack(&[], false).unwrap().is_empty());
        assert!(packer.pack(&[b""], true).unwrap().is_empty());
    }

    #[test]
    fn test_prefix_suffix() {
        let packer = PrefixSuffixPacker::new(b"<<", b">>", 64).unwrap();
        let msg = packer.pack(&[b"hi"], false).unwrap();
        assert_eq!(msg.data(), b"<<hi>>");
        assert_eq!(packer.raw_data(&msg), b"hi");
        assert_eq!(packer.max_msg_size(), 60);
        assert!(PrefixSuffixPacker::new(b"<<", b"", 64).is_err());
    }

    #[test]
    fn test_raw_concatenation() {
        let packer = RawPacker::new(16);
        let msg = packer.pack(&[b"ab", b"", b"cd"], false).unwrap();
        assert_eq!(msg.data(), b"abcd");
        assert!(packer.pack(&[&[0u8; 17]], false).is_err());
    }

    #[test]
    fn test_pooled_allocator_recycles() {
        let pool = Arc::new(MemoryPool::new(8));
        let allocator = Arc::new(PooledAllocator::new(pool.clone()));
        let packer = LengthPrefixedPacker::with_allocator(HeaderWidth::Two, 4000, allocator);

        let msg = packer.pack(&[b"pooled"], false).unwrap();
        packer.recycle(msg);
        assert_eq!(pool.idle_blocks(), 1);

        let msg = packer.pack(&[b"again"], false).unwrap();
        assert_eq!(packer.raw_data(&msg), b"again");
        assert_eq!(pool.hits(), 1);
    }
}
