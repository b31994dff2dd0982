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

use std::fmt;
use std::ops::Deref;

use bytes::BytesMut;

/// An owned, contiguous run of bytes.
///
/// A `Buffer` has exactly one owner at a time; handing it to another holder
/// is a move (or [`Buffer::take`], which leaves an empty buffer behind).
/// There is deliberately no `Clone`.
#[derive(Default, PartialEq, Eq)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            inner: BytesMut::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Moves the bytes out, leaving this buffer empty.
    pub fn take(&mut self) -> Buffer {
        std::mem::take(self)
    }

    /// Gives up the backing storage, e.g. to return it to a memory pool.
    pub fn into_inner(self) -> BytesMut {
        self.inner
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl From<BytesMut> for Buffer {
    fn from(inner: BytesMut) -> Self {
        Buffer { inner }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Buffer {
            inner: BytesMut::from(&value[..]),
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(value: &[u8]) -> Self {
        Buffer {
            inner: BytesMut::from(value),
        }
    }
}

impl From<&str> for Buffer {
    fn from(value: &str) -> Self {
        Buffer::from(value.as_bytes())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}
