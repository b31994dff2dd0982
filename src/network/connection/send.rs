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

use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::{BoxedWriter, Connection, SendState, ShutdownState};
use crate::message::{Buffer, OutMessage};
use crate::service::Shutdown;
use crate::{AppError, AppResult};

/// How spans are turned into a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    /// Framed by the connection's packer.
    Framed,
    /// Concatenated and sent as is.
    Native,
}

impl Connection {
    /// Packs `spans` into one message and queues it.
    ///
    /// Fails with [`AppError::QueueFull`] when the queue is at capacity and
    /// `can_overflow` is false, with [`AppError::ShuttingDown`] once shutdown
    /// has begun, and with [`AppError::FramingOverflow`] when the message
    /// cannot be framed. An empty message succeeds without queuing anything.
    pub fn send_msg(
        self: &Arc<Self>,
        spans: &[&[u8]],
        mode: PackMode,
        can_overflow: bool,
    ) -> AppResult<()> {
        if self.is_shutting_down() {
            return Err(AppError::ShuttingDown);
        }
        let packer = self.packer();
        let mut send = self.send_state.lock();
        if !can_overflow && send.queue.len() >= self.config.max_msg_num {
            return Err(AppError::QueueFull(self.config.max_msg_num));
        }
        let buffer = packer.pack(spans, mode == PackMode::Native)?;
        self.enqueue(&mut send, buffer);
        Ok(())
    }

    pub fn send(self: &Arc<Self>, spans: &[&[u8]], can_overflow: bool) -> AppResult<()> {
        self.send_msg(spans, PackMode::Framed, can_overflow)
    }

    pub fn send_native(self: &Arc<Self>, spans: &[&[u8]], can_overflow: bool) -> AppResult<()> {
        self.send_msg(spans, PackMode::Native, can_overflow)
    }

    /// Like [`send`](Self::send), but waits for room in the queue.
    pub async fn safe_send(self: &Arc<Self>, spans: &[&[u8]], can_overflow: bool) -> AppResult<()> {
        self.safe_send_msg(spans, PackMode::Framed, can_overflow)
            .await
    }

    pub async fn safe_send_native(
        self: &Arc<Self>,
        spans: &[&[u8]],
        can_overflow: bool,
    ) -> AppResult<()> {
        self.safe_send_msg(spans, PackMode::Native, can_overflow)
            .await
    }

    /// Retries on a full queue every `safe_send_interval` for as long as
    /// sending is allowed.
    pub async fn safe_send_msg(
        self: &Arc<Self>,
        spans: &[&[u8]],
        mode: PackMode,
        can_overflow: bool,
    ) -> AppResult<()> {
        let interval = self.config.safe_send_interval();
        loop {
            match self.send_msg(spans, mode, can_overflow) {
                Err(AppError::QueueFull(capacity)) => {
                    if self.is_shutting_down() {
                        return Err(AppError::ShuttingDown);
                    }
                    if !self.is_started() {
                        // nothing drains the queue until the connection starts
                        return Err(AppError::QueueFull(capacity));
                    }
                    trace!(connection_id = self.id, "send queue full, retry later");
                    tokio::time::sleep(interval).await;
                }
                result => return result,
            }
        }
    }

    /// Queues an already packed buffer.
    pub fn direct_send(self: &Arc<Self>, buffer: Buffer, can_overflow: bool) -> AppResult<()> {
        if self.is_shutting_down() {
            return Err(AppError::ShuttingDown);
        }
        let mut send = self.send_state.lock();
        if !can_overflow && send.queue.len() >= self.config.max_msg_num {
            return Err(AppError::QueueFull(self.config.max_msg_num));
        }
        self.enqueue(&mut send, buffer);
        Ok(())
    }

    fn enqueue(self: &Arc<Self>, send: &mut SendState, buffer: Buffer) {
        if buffer.is_empty() {
            return;
        }
        send.queue.push_back(OutMessage::new(buffer));
        self.do_send_msg(send);
    }

    /// Starts a batch write unless one is outstanding. Returns whether a
    /// write is in flight afterwards.
    pub(super) fn do_send_msg(self: &Arc<Self>, send: &mut SendState) -> bool {
        if send.sending || send.queue.is_empty() || !self.is_send_allowed() {
            return send.sending;
        }
        let Some(runtime) = self.runtime_handle() else {
            return false;
        };
        let Some(writer) = send.writer.take() else {
            return false;
        };

        // one message per write when every completion is reported
        let max_send_size = if self.config.want_msg_send_notify {
            0
        } else {
            self.config.max_send_size
        };
        let now = Instant::now();
        let mut size = 0;
        let mut delay = Duration::ZERO;
        let mut batch = Vec::new();
        while let Some(msg) = send.queue.pop_front() {
            size += msg.len();
            delay += now.saturating_duration_since(msg.begin_time());
            batch.push(msg);
            if size >= max_send_size {
                break;
            }
        }
        self.stat.lock().send_delay_sum += delay;
        if let Some(head) = batch.first_mut() {
            head.restart();
        }

        send.sending = true;
        let shutdown = self.subscribe_shutdown();
        self.spawn_on(&runtime, self.clone().write_batch(writer, batch, shutdown));
        true
    }

    async fn write_batch(
        self: Arc<Self>,
        mut writer: BoxedWriter,
        batch: Vec<OutMessage>,
        mut shutdown: Shutdown,
    ) {
        let result = tokio::select! {
            biased;
            _ = shutdown.recv() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "write cancelled by shutdown",
            )),
            res = write_all_vectored(&mut writer, &batch) => res,
        };
        self.send_handler(writer, batch, result);
    }

    fn send_handler(
        self: &Arc<Self>,
        writer: BoxedWriter,
        batch: Vec<OutMessage>,
        result: io::Result<usize>,
    ) {
        match &result {
            Ok(bytes) => {
                if let Some(head) = batch.first() {
                    let mut stat = self.stat.lock();
                    stat.send_time_sum += head.begin_time().elapsed();
                    stat.send_byte_sum += *bytes as u64;
                    stat.send_msg_sum += batch.len() as u64;
                }
                if self.config.want_msg_send_notify {
                    if let Some(head) = batch.first() {
                        self.handler.on_message_sent(self, head);
                    }
                }
                if self.config.want_all_msg_send_notify && self.pending_send_msg_num() == 0 {
                    if let Some(last) = batch.last() {
                        self.handler.on_all_sent(self, last);
                    }
                }
            }
            Err(err) => self.handler.on_send_error(self, err),
        }

        let packer = self.packer();
        for msg in batch {
            packer.recycle(msg.into_buffer());
        }

        let mut send = self.send_state.lock();
        send.sending = false;
        match self.shutdown_state() {
            ShutdownState::Active => {
                send.writer = Some(writer);
                if result.is_ok() {
                    self.do_send_msg(&mut send);
                }
            }
            ShutdownState::GracefulPending => {
                drop(send);
                self.spawn_half_close(writer);
            }
            ShutdownState::Closed => {
                drop(send);
                self.spawn_close_writer(writer);
            }
        }
    }
}

/// Writes every message of the batch in order, as few syscalls as the
/// transport allows.
async fn write_all_vectored(writer: &mut BoxedWriter, batch: &[OutMessage]) -> io::Result<usize> {
    let mut index = 0;
    let mut offset = 0;
    let mut written = 0;
    while index < batch.len() {
        if offset == batch[index].len() {
            index += 1;
            offset = 0;
            continue;
        }
        let slices: Vec<IoSlice<'_>> = std::iter::once(IoSlice::new(&batch[index][offset..]))
            .chain(batch[index + 1..].iter().map(|msg| IoSlice::new(&msg[..])))
            .collect();
        let mut n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write whole batch",
            ));
        }
        written += n;
        while n > 0 && index < batch.len() {
            let left = batch[index].len() - offset;
            if n >= left {
                n -= left;
                index += 1;
                offset = 0;
            } else {
                offset += n;
                n = 0;
            }
        }
    }
    writer.flush().await?;
    trace!(bytes = written, messages = batch.len(), "batch written");
    Ok(written)
}
