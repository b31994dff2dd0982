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

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

/// A free list of reusable byte blocks.
///
/// `checkout` hands out the smallest idle block that is large enough, or
/// allocates a new one. Blocks come back through `checkin`; at most
/// `max_idle_blocks` are kept, the rest are freed.
#[derive(Debug)]
pub struct MemoryPool {
    blocks: Mutex<Vec<BytesMut>>,
    max_idle_blocks: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryPool {
    pub fn new(max_idle_blocks: usize) -> Self {
        MemoryPool {
            blocks: Mutex::new(Vec::with_capacity(max_idle_blocks)),
            max_idle_blocks,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn checkout(&self, len: usize) -> BytesMut {
        let reused = {
            let mut blocks = self.blocks.lock();
            let best = blocks
                .iter()
                .enumerate()
                .filter(|(_, block)| block.capacity() >= len)
                .min_by_key(|(_, block)| block.capacity())
                .map(|(index, _)| index);
            best.map(|index| blocks.swap_remove(index))
        };

        match reused {
            Some(block) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                block
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!("memory pool miss, allocate {} bytes", len);
                BytesMut::with_capacity(len)
            }
        }
    }

    pub fn checkin(&self, mut block: BytesMut) {
        block.clear();
        if block.capacity() == 0 {
            return;
        }
        let mut blocks = self.blocks.lock();
        if blocks.len() < self.max_idle_blocks {
            blocks.push(block);
        }
    }

    pub fn idle_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
