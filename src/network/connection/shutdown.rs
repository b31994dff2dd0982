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

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BoxedWriter, Connection, ShutdownState};
use crate::service::Shutdown;
use crate::AppError;

enum GracefulStart {
    Rejected,
    Escalated,
    Pending,
}

impl Connection {
    /// Cancels every outstanding operation, closes the transport and calls
    /// `on_close`. Calling it again once closed does nothing.
    pub fn force_shutdown(self: &Arc<Self>) {
        if self.shutdown_state() == ShutdownState::Closed {
            return;
        }
        {
            let _guard = self.shutdown_lock.lock();
            if self.shutdown_state() == ShutdownState::Closed {
                return;
            }
            self.state
                .store(ShutdownState::Closed as u8, Ordering::Release);
            self.shutdown_trigger.lock().trigger();
            self.started.store(false, Ordering::Release);

            // an in-flight write hands the writer back to its completion
            let writer = self.send_state.lock().writer.take();
            if let Some(writer) = writer {
                self.spawn_close_writer(writer);
            }
        }
        info!(connection_id = self.id, "connection closed");
        self.handler.on_close(self);
    }

    /// Half-closes the outbound direction and lets the peer finish.
    ///
    /// Returns false if a shutdown is already in progress or when the
    /// half-close is impossible (escalated to a forced shutdown). Otherwise
    /// with `sync` false it returns true right away; with `sync` true it
    /// waits until the connection closes, forcing the shutdown once
    /// `graceful_shutdown_timeout` expires, and returns false.
    pub async fn graceful_shutdown(self: &Arc<Self>, sync: bool) -> bool {
        match self.begin_graceful_shutdown() {
            GracefulStart::Rejected | GracefulStart::Escalated => return false,
            GracefulStart::Pending => {}
        }
        if !sync {
            return true;
        }

        let budget = self.config.graceful_shutdown_timeout();
        let poll = self.config.graceful_shutdown_poll();
        let begin = Instant::now();
        while self.shutdown_state() == ShutdownState::GracefulPending {
            if begin.elapsed() >= budget {
                let err = AppError::ShutdownTimeout(budget.as_millis() as u64);
                info!(connection_id = self.id, "{}, force shutdown", err);
                self.force_shutdown();
                break;
            }
            tokio::time::sleep(poll).await;
        }
        false
    }

    fn begin_graceful_shutdown(self: &Arc<Self>) -> GracefulStart {
        let writer = {
            let _guard = self.shutdown_lock.lock();
            if self.is_shutting_down() {
                return GracefulStart::Rejected;
            }
            self.state
                .store(ShutdownState::GracefulPending as u8, Ordering::Release);
            let mut send = self.send_state.lock();
            if send.sending {
                // the write completion half-closes once the writer is back
                debug!(connection_id = self.id, "half-close deferred to write completion");
                return GracefulStart::Pending;
            }
            send.writer.take()
        };

        match writer {
            Some(writer) => {
                self.spawn_half_close(writer);
                GracefulStart::Pending
            }
            None => {
                info!(connection_id = self.id, "graceful shutdown is impossible, no transport");
                self.force_shutdown();
                GracefulStart::Escalated
            }
        }
    }

    pub(super) fn spawn_half_close(self: &Arc<Self>, writer: BoxedWriter) {
        let Some(runtime) = self.runtime_handle() else {
            self.force_shutdown();
            return;
        };
        let shutdown = self.subscribe_shutdown();
        self.spawn_on(&runtime, self.clone().half_close(writer, shutdown));
    }

    async fn half_close(self: Arc<Self>, mut writer: BoxedWriter, mut shutdown: Shutdown) {
        let result = tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            res = writer.shutdown() => res,
        };
        match result {
            Ok(()) => debug!(connection_id = self.id, "outbound direction closed, waiting for peer"),
            Err(err) => {
                info!(connection_id = self.id, "graceful shutdown is impossible: {}", err);
                self.force_shutdown();
            }
        }
    }

    /// Shuts the writer down in the background once the connection closed.
    pub(super) fn spawn_close_writer(self: &Arc<Self>, mut writer: BoxedWriter) {
        let Some(runtime) = self.runtime_handle() else {
            return;
        };
        let budget = self.config.graceful_shutdown_timeout();
        let id = self.id;
        self.spawn_on(&runtime, async move {
            match tokio::time::timeout(budget, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(connection_id = id, "close transport: {}", err),
                Err(_) => warn!(connection_id = id, "close transport timed out"),
            }
        });
    }
}
