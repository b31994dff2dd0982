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

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::packer::{
    BufferAllocator, LengthPrefixedPacker, Packer, PrefixSuffixPacker, RawPacker,
};
use super::unpacker::{LengthPrefixedUnpacker, PrefixSuffixUnpacker, StreamUnpacker, Unpacker};
use crate::AppError::InvalidValue;
use crate::AppResult;

/// Width of the big-endian length header used by length-prefixed framing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum HeaderWidth {
    #[default]
    Two,
    Four,
}

impl HeaderWidth {
    pub const fn len(self) -> usize {
        match self {
            HeaderWidth::Two => 2,
            HeaderWidth::Four => 4,
        }
    }

    /// Largest frame length the header can carry.
    pub const fn max_frame_len(self) -> u64 {
        match self {
            HeaderWidth::Two => u16::MAX as u64,
            HeaderWidth::Four => u32::MAX as u64,
        }
    }

    /// Writes `frame_len` in network byte order. The caller has already
    /// checked it against [`HeaderWidth::max_frame_len`].
    pub(crate) fn put(self, dst: &mut BytesMut, frame_len: usize) {
        match self {
            HeaderWidth::Two => dst.put_u16(frame_len as u16),
            HeaderWidth::Four => dst.put_u32(frame_len as u32),
        }
    }

    /// Reads a header from the first `len()` bytes of `src`.
    pub(crate) fn get(self, src: &[u8]) -> usize {
        match self {
            HeaderWidth::Two => u16::from_be_bytes([src[0], src[1]]) as usize,
            HeaderWidth::Four => u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize,
        }
    }
}

impl TryFrom<u8> for HeaderWidth {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(HeaderWidth::Two),
            4 => Ok(HeaderWidth::Four),
            other => Err(format!("header width must be 2 or 4 bytes, got {}", other)),
        }
    }
}

impl From<HeaderWidth> for u8 {
    fn from(value: HeaderWidth) -> Self {
        value.len() as u8
    }
}

/// Wire format of one connection.
///
/// ```toml
/// [connection.framing]
/// protocol = "length_prefixed"
/// header = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Framing {
    /// `[header][payload]`, the header holds the total frame length.
    LengthPrefixed {
        #[serde(default)]
        header: HeaderWidth,
    },
    /// `[prefix][payload][suffix]`, the suffix terminates a frame.
    PrefixSuffix {
        #[serde(default)]
        prefix: String,
        suffix: String,
    },
    /// No framing at all, the stream is forwarded as it arrives.
    Raw,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::LengthPrefixed {
            header: HeaderWidth::default(),
        }
    }
}

impl Framing {
    /// Checks the descriptor against a scratch/frame capacity.
    pub fn validate(&self, capacity: usize) -> AppResult<()> {
        if capacity == 0 {
            return Err(InvalidValue("message buffer size must be bigger than zero".into()));
        }
        match self {
            Framing::LengthPrefixed { header } => {
                if capacity <= header.len() {
                    return Err(InvalidValue(format!(
                        "message buffer size {} cannot hold a {} byte header",
                        capacity,
                        header.len()
                    )));
                }
            }
            Framing::PrefixSuffix { prefix, suffix } => {
                if suffix.is_empty() {
                    return Err(InvalidValue("suffix must not be empty".into()));
                }
                if prefix.len() + suffix.len() >= capacity {
                    return Err(InvalidValue(format!(
                        "prefix and suffix ({} bytes) must be shorter than message buffer size {}",
                        prefix.len() + suffix.len(),
                        capacity
                    )));
                }
            }
            Framing::Raw => {}
        }
        Ok(())
    }

    pub fn packer(
        &self,
        capacity: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> AppResult<Arc<dyn Packer>> {
        self.validate(capacity)?;
        let packer: Arc<dyn Packer> = match self {
            Framing::LengthPrefixed { header } => {
                Arc::new(LengthPrefixedPacker::with_allocator(*header, capacity, allocator))
            }
            Framing::PrefixSuffix { prefix, suffix } => Arc::new(
                PrefixSuffixPacker::new(prefix.as_bytes(), suffix.as_bytes(), capacity)?
                    .allocator(allocator),
            ),
            Framing::Raw => Arc::new(RawPacker::with_allocator(capacity, allocator)),
        };
        Ok(packer)
    }

    pub fn unpacker(&self, capacity: usize) -> AppResult<Box<dyn Unpacker>> {
        self.validate(capacity)?;
        let unpacker: Box<dyn Unpacker> = match self {
            Framing::LengthPrefixed { header } => {
                Box::new(LengthPrefixedUnpacker::new(*header, capacity))
            }
            Framing::PrefixSuffix { prefix, suffix } => Box::new(PrefixSuffixUnpacker::new(
                prefix.as_bytes(),
                suffix.as_bytes(),
                capacity,
            )?),
            Framing::Raw => Box::new(StreamUnpacker::new(capacity)),
        };
        Ok(unpacker)
    }
}
