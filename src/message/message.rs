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

use std::ops::Deref;
use std::time::Instant;

use super::Buffer;

/// A decoded inbound message.
///
/// `begin_time` is the moment the unpacker produced it; dispatch latency is
/// measured from there.
#[derive(Debug)]
pub struct InMessage {
    buffer: Buffer,
    begin_time: Instant,
}

impl InMessage {
    pub fn new(buffer: Buffer) -> Self {
        InMessage {
            buffer,
            begin_time: Instant::now(),
        }
    }

    pub fn begin_time(&self) -> Instant {
        self.begin_time
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Moves the payload out, e.g. to echo it back without copying.
    pub fn take_buffer(&mut self) -> Buffer {
        self.buffer.take()
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

impl Deref for InMessage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

/// A packed outbound message waiting in (or travelling through) the send
/// pipeline.
#[derive(Debug)]
pub struct OutMessage {
    buffer: Buffer,
    begin_time: Instant,
}

impl OutMessage {
    pub fn new(buffer: Buffer) -> Self {
        OutMessage {
            buffer,
            begin_time: Instant::now(),
        }
    }

    pub fn begin_time(&self) -> Instant {
        self.begin_time
    }

    /// Re-stamps the message; done for the head of a batch when its write is
    /// issued so send latency excludes the time spent queued.
    pub fn restart(&mut self) {
        self.begin_time = Instant::now();
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

impl Deref for OutMessage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}
