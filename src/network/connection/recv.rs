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

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use super::{BoxedReader, Connection};
use crate::network::Unpacker;
use crate::service::Shutdown;
use crate::AppError;

impl Connection {
    /// Reads until the transport fails or the connection is cancelled.
    ///
    /// Each round reads until the unpacker reports a boundary, decodes the
    /// bytes, then dispatches what was decoded.
    pub(super) async fn recv_loop(
        self: Arc<Self>,
        mut reader: BoxedReader,
        mut unpacker: Box<dyn Unpacker>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let replacement = self.unpacker.lock().take();
            if let Some(replacement) = replacement {
                debug!(connection_id = self.id, "unpacker replaced");
                unpacker = replacement;
            }

            if !self.wait_for_backlog_room(&mut shutdown).await {
                let err = io::Error::new(io::ErrorKind::ConnectionAborted, "read cancelled by shutdown");
                self.handler.on_recv_error(&self, &err);
                break;
            }

            if unpacker.next_receive_region().is_empty() {
                self.unpack_error(unpacker.as_mut());
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.recv() => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "read cancelled by shutdown",
                )),
                res = read_until_boundary(&mut reader, unpacker.as_mut()) => res,
            };
            match result {
                Ok(received) => self.recv_handler(received, unpacker.as_mut()),
                Err(err) => {
                    self.handler.on_recv_error(&self, &err);
                    break;
                }
            }
        }

        let mut slot = self.unpacker.lock();
        if slot.is_none() {
            *slot = Some(unpacker);
        }
        trace!(connection_id = self.id, "receive loop exited");
    }

    /// Pauses reading while the backlog is full. Returns false when cancelled.
    async fn wait_for_backlog_room(&self, shutdown: &mut Shutdown) -> bool {
        let interval = self.config.msg_handling_interval();
        let begin = Instant::now();
        let mut paused = false;
        while self.backlog_msg_num() >= self.config.max_msg_num {
            paused = true;
            tokio::select! {
                biased;
                _ = shutdown.recv() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if paused {
            self.stat.lock().recv_idle_sum += begin.elapsed();
        }
        true
    }

    fn recv_handler(self: &Arc<Self>, received: usize, unpacker: &mut dyn Unpacker) {
        let mut messages = VecDeque::new();
        let unpack_ok = unpacker.decode(received, &mut messages);
        if !messages.is_empty() {
            {
                let mut stat = self.stat.lock();
                stat.recv_msg_sum += messages.len() as u64;
                stat.recv_byte_sum += messages.iter().map(|m| m.len() as u64).sum::<u64>();
            }
            self.recv_state.lock().delivery.extend(messages);
        }
        self.dispatch_msg();

        if !unpack_ok {
            self.unpack_error(unpacker);
        }
    }

    fn unpack_error(self: &Arc<Self>, unpacker: &mut dyn Unpacker) {
        let err = AppError::UnpackProtocolError(format!(
            "{} bytes can not be framed",
            unpacker.buffered().len()
        ));
        warn!(connection_id = self.id, "{}", err);
        self.handler.on_unpack_error(self, unpacker.buffered());
        unpacker.reset();
    }

    /// Delivers decoded messages in order, immediately when possible and
    /// through the backlog otherwise.
    fn dispatch_msg(self: &Arc<Self>) {
        loop {
            let next = {
                let mut recv = self.recv_state.lock();
                if recv.suspended || recv.handling || !recv.backlog.is_empty() {
                    let pending = std::mem::take(&mut recv.delivery);
                    recv.backlog.extend(pending);
                    None
                } else {
                    recv.delivery.pop_front()
                }
            };
            let Some(mut msg) = next else {
                break;
            };

            let begin = Instant::now();
            let handled = self.handler.on_message(self, &mut msg);
            self.stat.lock().handle_time_sum += begin.elapsed();
            if !handled {
                self.recv_state.lock().backlog.push_back(msg);
            }
        }
        self.start_backlog_handler();
    }

    fn start_backlog_handler(self: &Arc<Self>) {
        let Some(runtime) = self.runtime_handle() else {
            return;
        };
        {
            let mut recv = self.recv_state.lock();
            if recv.handling || recv.backlog.is_empty() {
                return;
            }
            recv.handling = true;
        }
        let shutdown = self.subscribe_shutdown();
        self.spawn_on(&runtime, self.clone().handle_backlog(shutdown));
    }

    /// Offers backlogged messages to `on_message_buffered`, retrying a
    /// refused one every `msg_handling_interval`. Once the connection is down
    /// the remaining messages are offered one last time with `link_down`.
    async fn handle_backlog(self: Arc<Self>, mut shutdown: Shutdown) {
        let interval = self.config.msg_handling_interval();
        loop {
            let next = {
                let mut recv = self.recv_state.lock();
                let msg = recv.backlog.pop_front();
                if msg.is_none() {
                    recv.handling = false;
                }
                msg
            };
            let Some(mut msg) = next else {
                break;
            };

            let link_down = shutdown.is_shutdown();
            let begin = Instant::now();
            let handled = self.handler.on_message_buffered(&self, &mut msg, link_down);
            self.stat.lock().handle_time_sum += begin.elapsed();
            if handled || link_down {
                continue;
            }

            self.recv_state.lock().backlog.push_front(msg);
            tokio::select! {
                biased;
                _ = shutdown.recv() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Holds messages back from immediate delivery; they accumulate in the
    /// backlog instead.
    pub fn suspend_dispatch(&self) {
        self.recv_state.lock().suspended = true;
    }

    pub fn resume_dispatch(&self) {
        self.recv_state.lock().suspended = false;
    }
}

/// Reads into the unpacker's region until it needs no more bytes or the
/// region is full. A peer close is reported as `UnexpectedEof`.
async fn read_until_boundary(
    reader: &mut BoxedReader,
    unpacker: &mut dyn Unpacker,
) -> io::Result<usize> {
    let mut received = 0;
    loop {
        let region = unpacker.next_receive_region();
        let capacity = region.len();
        let n = reader.read(&mut region[received..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        received += n;
        if received == capacity || unpacker.bytes_needed(received) == 0 {
            return Ok(received);
        }
    }
}
