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

//! Inbound framing.
//!
//! An [`Unpacker`] owns a fixed-capacity scratch buffer. The read loop asks
//! it where to put arriving bytes ([`Unpacker::next_receive_region`]), how
//! many more are needed before decoding makes sense
//! ([`Unpacker::bytes_needed`]), and finally turns the buffered bytes into
//! messages ([`Unpacker::decode`]). A trailing partial frame stays buffered,
//! moved to the front of the scratch buffer, until the next round.

use std::collections::VecDeque;
use std::fmt;

use super::frame::HeaderWidth;
use crate::message::{Buffer, InMessage};
use crate::AppError::InvalidValue;
use crate::AppResult;

pub trait Unpacker: Send + fmt::Debug {
    /// Drops every buffered byte and partial-frame state.
    fn reset(&mut self);

    /// Where the transport should write newly arrived bytes: right after the
    /// buffered partial frame, up to the scratch capacity.
    fn next_receive_region(&mut self) -> &mut [u8];

    /// How many more bytes to read before decoding, given `received` bytes
    /// landed in the current region. `0` means "decode now".
    fn bytes_needed(&mut self, received: usize) -> usize;

    /// Extracts every complete frame, in arrival order. Returns `false` if
    /// the stream violates the protocol; frames before the violation are
    /// still pushed.
    fn decode(&mut self, received: usize, messages: &mut VecDeque<InMessage>) -> bool;

    /// Bytes buffered but not turned into messages yet. After a failed
    /// `decode` this starts at the offending frame.
    fn buffered(&self) -> &[u8];
}

/// Moves `buf[from..to]` to the front and returns its length.
fn compact(buf: &mut [u8], from: usize, to: usize) -> usize {
    if from > 0 && to > from {
        buf.copy_within(from..to, 0);
    }
    to - from
}

/// Protocol: `[length][body]`, see [`super::LengthPrefixedPacker`].
pub struct LengthPrefixedUnpacker {
    header: HeaderWidth,
    raw_buff: Box<[u8]>,
    remain_len: usize,
    // total length of the frame at the start of `raw_buff`, once its header is read
    cur_msg_len: Option<usize>,
}

impl LengthPrefixedUnpacker {
    pub fn new(header: HeaderWidth, capacity: usize) -> Self {
        LengthPrefixedUnpacker {
            header,
            raw_buff: vec![0u8; capacity].into_boxed_slice(),
            remain_len: 0,
            cur_msg_len: None,
        }
    }

    fn valid_frame_len(&self, frame_len: usize) -> bool {
        frame_len > self.header.len() && frame_len <= self.raw_buff.len()
    }
}

impl Unpacker for LengthPrefixedUnpacker {
    fn reset(&mut self) {
        self.remain_len = 0;
        self.cur_msg_len = None;
    }

    fn next_receive_region(&mut self) -> &mut [u8] {
        &mut self.raw_buff[self.remain_len..]
    }

    fn bytes_needed(&mut self, received: usize) -> usize {
        let data_len = self.remain_len + received;
        let frame_len = match self.cur_msg_len {
            Some(frame_len) => frame_len,
            None => {
                let head_len = self.header.len();
                if data_len < head_len {
                    return head_len - data_len;
                }
                let frame_len = self.header.get(&self.raw_buff[..head_len]);
                self.cur_msg_len = Some(frame_len);
                frame_len
            }
        };
        if !self.valid_frame_len(frame_len) {
            // let decode report it
            return 0;
        }
        frame_len.saturating_sub(data_len)
    }

    fn decode(&mut self, received: usize, messages: &mut VecDeque<InMessage>) -> bool {
        let head_len = self.header.len();
        let total = self.remain_len + received;
        let mut offset = 0;
        let mut unpack_ok = true;

        loop {
            let available = total - offset;
            let frame_len = match self.cur_msg_len {
                Some(frame_len) => frame_len,
                None if available >= head_len => {
                    let frame_len = self.header.get(&self.raw_buff[offset..offset + head_len]);
                    self.cur_msg_len = Some(frame_len);
                    frame_len
                }
                None => break,
            };
            if !self.valid_frame_len(frame_len) {
                unpack_ok = false;
                break;
            }
            if available < frame_len {
                break;
            }
            let body = &self.raw_buff[offset + head_len..offset + frame_len];
            messages.push_back(InMessage::new(Buffer::from(body)));
            offset += frame_len;
            self.cur_msg_len = None;
        }

        self.remain_len = compact(&mut self.raw_buff, offset, total);
        unpack_ok
    }

    fn buffered(&self) -> &[u8] {
        &self.raw_buff[..self.remain_len]
    }
}

impl fmt::Debug for LengthPrefixedUnpacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthPrefixedUnpacker")
            .field("header", &self.header)
            .field("capacity", &self.raw_buff.len())
            .field("remain_len", &self.remain_len)
            .field("cur_msg_len", &self.cur_msg_len)
            .finish()
    }
}

/// Protocol: `[prefix][body][suffix]`, see [`super::PrefixSuffixPacker`].
pub struct PrefixSuffixUnpacker {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    raw_buff: Box<[u8]>,
    remain_len: usize,
}

impl PrefixSuffixUnpacker {
    pub fn new(prefix: &[u8], suffix: &[u8], capacity: usize) -> AppResult<Self> {
        if suffix.is_empty() || prefix.len() + suffix.len() >= capacity {
            return Err(InvalidValue(format!(
                "invalid prefix({})/suffix({}) for message buffer size {}",
                prefix.len(),
                suffix.len(),
                capacity
            )));
        }
        Ok(PrefixSuffixUnpacker {
            prefix: prefix.to_vec(),
            suffix: suffix.to_vec(),
            raw_buff: vec![0u8; capacity].into_boxed_slice(),
            remain_len: 0,
        })
    }

    /// Position of the suffix inside `frame`, searching after the prefix.
    fn find_suffix(&self, frame: &[u8]) -> Option<usize> {
        frame
            .get(self.prefix.len()..)?
            .windows(self.suffix.len())
            .position(|window| window == self.suffix.as_slice())
    }
}

impl Unpacker for PrefixSuffixUnpacker {
    fn reset(&mut self) {
        self.remain_len = 0;
    }

    fn next_receive_region(&mut self) -> &mut [u8] {
        &mut self.raw_buff[self.remain_len..]
    }

    fn bytes_needed(&mut self, received: usize) -> usize {
        let data_len = self.remain_len + received;
        let min_len = self.prefix.len() + self.suffix.len();
        if data_len < min_len {
            return min_len - data_len;
        }
        let data = &self.raw_buff[..data_len];
        if !data.starts_with(&self.prefix)
            || self.find_suffix(data).is_some()
            || data_len >= self.raw_buff.len()
        {
            0
        } else {
            1
        }
    }

    fn decode(&mut self, received: usize, messages: &mut VecDeque<InMessage>) -> bool {
        let total = self.remain_len + received;
        let min_len = self.prefix.len() + self.suffix.len();
        let mut offset = 0;
        let mut unpack_ok = true;

        while total - offset >= min_len {
            let frame = &self.raw_buff[offset..total];
            if !frame.starts_with(&self.prefix) {
                unpack_ok = false;
                break;
            }
            match self.find_suffix(frame) {
                Some(pos) => {
                    let body_start = offset + self.prefix.len();
                    let body = &self.raw_buff[body_start..body_start + pos];
                    messages.push_back(InMessage::new(Buffer::from(body)));
                    offset = body_start + pos + self.suffix.len();
                }
                None => {
                    // a frame filling the whole scratch buffer can never complete
                    if offset == 0 && total == self.raw_buff.len() {
                        unpack_ok = false;
                    }
                    break;
                }
            }
        }

        self.remain_len = compact(&mut self.raw_buff, offset, total);
        unpack_ok
    }

    fn buffered(&self) -> &[u8] {
        &self.raw_buff[..self.remain_len]
    }
}

impl fmt::Debug for PrefixSuffixUnpacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixSuffixUnpacker")
            .field("prefix_len", &self.prefix.len())
            .field("suffix_len", &self.suffix.len())
            .field("capacity", &self.raw_buff.len())
            .field("remain_len", &self.remain_len)
            .finish()
    }
}

/// Protocol: none. Whatever one read delivers becomes one message.
pub struct StreamUnpacker {
    raw_buff: Box<[u8]>,
}

impl StreamUnpacker {
    pub fn new(capacity: usize) -> Self {
        StreamUnpacker {
            raw_buff: vec![0u8; capacity].into_boxed_slice(),
        }
    }
}

impl Unpacker for StreamUnpacker {
    fn reset(&mut self) {}

    fn next_receive_region(&mut self) -> &mut [u8] {
        &mut self.raw_buff[..]
    }

    fn bytes_needed(&mut self, received: usize) -> usize {
        if received > 0 {
            0
        } else {
            1
        }
    }

    fn decode(&mut self, received: usize, messages: &mut VecDeque<InMessage>) -> bool {
        if received > 0 {
            messages.push_back(InMessage::new(Buffer::from(&self.raw_buff[..received])));
        }
        true
    }

    fn buffered(&self) -> &[u8] {
        &[]
    }
}

impl fmt::Debug for StreamUnpacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamUnpacker")
            .field("capacity", &self.raw_buff.len())
            .finish()
    }
}
