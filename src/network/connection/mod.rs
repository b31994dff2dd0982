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

//! The connection engine.
//!
//! A [`Connection`] owns one byte-stream transport split into a read half and
//! a write half. Sending goes through a bounded FIFO queue drained by at most
//! one outstanding batch write; receiving runs a read loop that frames bytes
//! through an [`Unpacker`] and dispatches messages to a [`MessageHandler`],
//! with a backlog for congestion control. Shutdown is either forced (cancel
//! everything, idempotent) or graceful (half-close, then wait for the peer).

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::packer::{BufferAllocator, HeapAllocator, Packer};
use super::unpacker::Unpacker;
use super::{MessageHandler, Statistic};
use crate::message::{InMessage, OutMessage};
use crate::service::{Shutdown, ShutdownTrigger};
use crate::{AppError, AppResult, ConnectionConfig};

mod recv;
mod send;
mod shutdown;

pub use send::PackMode;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Active = 0,
    GracefulPending = 1,
    Closed = 2,
}

impl From<u8> for ShutdownState {
    fn from(value: u8) -> Self {
        match value {
            0 => ShutdownState::Active,
            1 => ShutdownState::GracefulPending,
            _ => ShutdownState::Closed,
        }
    }
}

struct SendState {
    queue: VecDeque<OutMessage>,
    /// A batch write is outstanding; the writer is away with it.
    sending: bool,
    writer: Option<BoxedWriter>,
}

struct RecvState {
    /// Decoded in the current read round, not yet dispatched.
    delivery: VecDeque<InMessage>,
    /// Refused or held back messages, retried by the backlog handler.
    backlog: VecDeque<InMessage>,
    suspended: bool,
    /// The backlog handler task is running.
    handling: bool,
}

pub struct Connection {
    id: u64,
    config: ConnectionConfig,
    handler: Arc<dyn MessageHandler>,

    packer: RwLock<Arc<dyn Packer>>,
    /// Idle unpacker, or a replacement waiting for the next read round.
    unpacker: Mutex<Option<Box<dyn Unpacker>>>,

    send_state: Mutex<SendState>,
    recv_state: Mutex<RecvState>,
    stat: Mutex<Statistic>,

    state: AtomicU8,
    // serializes the transitions out of Active
    shutdown_lock: Mutex<()>,
    shutdown_trigger: Mutex<ShutdownTrigger>,

    runtime: Mutex<Option<Handle>>,
    started: AtomicBool,
    async_calls: AtomicUsize,
}

/// Decrements the outstanding-task count when a spawned task ends, however it
/// ends.
struct AsyncCallGuard(Arc<Connection>);

impl Drop for AsyncCallGuard {
    fn drop(&mut self) {
        self.0.async_calls.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Connection {
    pub fn new(
        id: u64,
        config: ConnectionConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> AppResult<Arc<Connection>> {
        Self::with_allocator(id, config, handler, Arc::new(HeapAllocator))
    }

    /// Like [`new`](Self::new), with outgoing buffers drawn from `allocator`.
    pub fn with_allocator(
        id: u64,
        config: ConnectionConfig,
        handler: Arc<dyn MessageHandler>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> AppResult<Arc<Connection>> {
        config.validate()?;
        let packer = config.framing.packer(config.msg_buffer_size, allocator)?;
        let unpacker = config.framing.unpacker(config.msg_buffer_size)?;

        Ok(Arc::new(Connection {
            id,
            handler,
            packer: RwLock::new(packer),
            unpacker: Mutex::new(Some(unpacker)),
            send_state: Mutex::new(SendState {
                queue: VecDeque::new(),
                sending: false,
                writer: None,
            }),
            recv_state: Mutex::new(RecvState {
                delivery: VecDeque::new(),
                backlog: VecDeque::new(),
                suspended: false,
                handling: false,
            }),
            stat: Mutex::new(Statistic::default()),
            state: AtomicU8::new(ShutdownState::Active as u8),
            shutdown_lock: Mutex::new(()),
            shutdown_trigger: Mutex::new(ShutdownTrigger::new()),
            runtime: Mutex::new(None),
            started: AtomicBool::new(false),
            async_calls: AtomicUsize::new(0),
            config,
        }))
    }

    /// Attaches the transport and starts the receive loop. Messages queued
    /// before the start are flushed right away.
    ///
    /// Must be called from within a tokio runtime; the runtime is captured so
    /// that later operations may be invoked from any thread.
    pub fn start<R, W>(self: &Arc<Self>, reader: R, writer: W) -> AppResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| {
            AppError::IllegalStateError(format!("connection started outside a runtime: {}", e))
        })?;
        if self.shutdown_state() != ShutdownState::Active {
            return Err(AppError::ShuttingDown);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::IllegalStateError(format!(
                "connection {} already started",
                self.id
            )));
        }
        let unpacker = self.unpacker.lock().take();
        let Some(unpacker) = unpacker else {
            self.started.store(false, Ordering::Release);
            return Err(AppError::IllegalStateError(format!(
                "connection {} still has a receive loop running",
                self.id
            )));
        };
        *self.runtime.lock() = Some(runtime.clone());

        let shutdown = self.subscribe_shutdown();
        self.spawn_on(
            &runtime,
            self.clone().recv_loop(Box::new(reader), unpacker, shutdown),
        );
        {
            let mut send = self.send_state.lock();
            send.writer = Some(Box::new(writer));
            self.do_send_msg(&mut send);
        }
        debug!(connection_id = self.id, "connection started");
        Ok(())
    }

    pub fn start_tcp(self: &Arc<Self>, stream: TcpStream) -> AppResult<()> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(connection_id = self.id, "set nodelay failed: {}", e);
        }
        let (reader, writer) = stream.into_split();
        self.start(reader, writer)
    }

    /// Returns a closed connection to its initial state so it can be started
    /// again on a new transport.
    pub fn reset(&self) -> AppResult<()> {
        let _guard = self.shutdown_lock.lock();
        let outstanding = self.async_calls.load(Ordering::Acquire);
        if self.is_started() || outstanding > 0 {
            return Err(AppError::IllegalStateError(format!(
                "connection {} is still in use, {} outstanding operations",
                self.id, outstanding
            )));
        }

        *self.shutdown_trigger.lock() = ShutdownTrigger::new();
        {
            let packer = self.packer();
            let mut send = self.send_state.lock();
            for msg in send.queue.drain(..) {
                packer.recycle(msg.into_buffer());
            }
            send.sending = false;
            send.writer = None;
            packer.reset();
        }
        {
            let mut recv = self.recv_state.lock();
            recv.delivery.clear();
            recv.backlog.clear();
            recv.suspended = false;
            recv.handling = false;
        }
        if let Some(unpacker) = self.unpacker.lock().as_mut() {
            unpacker.reset();
        }
        *self.stat.lock() = Statistic::default();
        self.state
            .store(ShutdownState::Active as u8, Ordering::Release);
        debug!(connection_id = self.id, "connection reset");
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn packer(&self) -> Arc<dyn Packer> {
        self.packer.read().clone()
    }

    /// Takes effect for the next message packed.
    pub fn set_packer(&self, packer: Arc<dyn Packer>) {
        *self.packer.write() = packer;
    }

    /// Takes effect at the next read round; bytes buffered in the current
    /// unpacker are dropped with it.
    pub fn set_unpacker(&self, unpacker: Box<dyn Unpacker>) {
        *self.unpacker.lock() = Some(unpacker);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        ShutdownState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_state() != ShutdownState::Active
    }

    /// Sending is allowed while started and not shutting down.
    pub fn is_send_allowed(&self) -> bool {
        self.is_started() && !self.is_shutting_down()
    }

    pub fn is_sending(&self) -> bool {
        self.send_state.lock().sending
    }

    pub fn pending_send_msg_num(&self) -> usize {
        self.send_state.lock().queue.len()
    }

    pub fn backlog_msg_num(&self) -> usize {
        self.recv_state.lock().backlog.len()
    }

    pub fn is_dispatch_suspended(&self) -> bool {
        self.recv_state.lock().suspended
    }

    pub fn statistic(&self) -> Statistic {
        *self.stat.lock()
    }

    /// True when nothing references the connection's machinery any more:
    /// not started, no graceful shutdown in progress, no task outstanding.
    pub fn obsoleted(&self) -> bool {
        self.shutdown_state() != ShutdownState::GracefulPending
            && !self.is_started()
            && self.async_calls.load(Ordering::Acquire) == 0
    }

    fn subscribe_shutdown(&self) -> Shutdown {
        self.shutdown_trigger.lock().subscribe()
    }

    fn runtime_handle(&self) -> Option<Handle> {
        self.runtime.lock().clone()
    }

    fn spawn_on<F>(self: &Arc<Self>, runtime: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.async_calls.fetch_add(1, Ordering::AcqRel);
        let guard = AsyncCallGuard(self.clone());
        runtime.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.shutdown_state())
            .field("started", &self.is_started())
            .field("async_calls", &self.async_calls.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(connection_id = self.id, "connection dropped");
    }
}
