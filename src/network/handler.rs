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

use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::Connection;
use crate::message::{InMessage, OutMessage};

/// Application hooks of a [`Connection`].
///
/// Every hook runs on a runtime worker with no engine lock held, so hooks may
/// call back into the connection (send, suspend dispatch, shut down).
pub trait MessageHandler: Send + Sync + 'static {
    /// Gate for freshly accepted connections; `false` drops the socket
    /// without starting it.
    fn on_accept(&self, _conn: &Arc<Connection>) -> bool {
        true
    }

    /// Immediate delivery. Returning `false` keeps the message (and
    /// everything decoded after it) in the backlog, which is then handed to
    /// [`on_message_buffered`](Self::on_message_buffered) periodically.
    fn on_message(&self, conn: &Arc<Connection>, msg: &mut InMessage) -> bool {
        debug!(connection_id = conn.id(), len = msg.len(), "message received");
        true
    }

    /// Delivery from the backlog. `link_down` is true once the connection
    /// has shut down; the message is dropped afterwards whatever the answer.
    fn on_message_buffered(
        &self,
        conn: &Arc<Connection>,
        msg: &mut InMessage,
        link_down: bool,
    ) -> bool {
        debug!(
            connection_id = conn.id(),
            len = msg.len(),
            link_down,
            "buffered message received"
        );
        true
    }

    /// The peer violated the framing; `partial` holds the bytes starting at
    /// the offending frame. The unpacker is reset afterwards and receiving
    /// goes on.
    fn on_unpack_error(&self, conn: &Arc<Connection>, partial: &[u8]) {
        warn!(
            connection_id = conn.id(),
            discarded = partial.len(),
            "unpack error, discard buffered data"
        );
    }

    /// A read failed; this includes the peer closing its side and reads
    /// cancelled by shutdown. The receive loop has already stopped.
    fn on_recv_error(&self, conn: &Arc<Connection>, err: &io::Error) {
        match err.kind() {
            io::ErrorKind::ConnectionAborted => {}
            io::ErrorKind::UnexpectedEof => {
                info!(connection_id = conn.id(), "connection closed by peer")
            }
            _ => error!(connection_id = conn.id(), "recv error: {}", err),
        }
        conn.force_shutdown();
    }

    /// A batch write failed. The batch is discarded; queued messages stay.
    fn on_send_error(&self, conn: &Arc<Connection>, err: &io::Error) {
        if err.kind() != io::ErrorKind::ConnectionAborted {
            error!(connection_id = conn.id(), "send error: {}", err);
        }
    }

    /// Per-message completion, when `want_msg_send_notify` is on.
    fn on_message_sent(&self, _conn: &Arc<Connection>, _msg: &OutMessage) {}

    /// The send queue drained, when `want_all_msg_send_notify` is on.
    fn on_all_sent(&self, _conn: &Arc<Connection>, _msg: &OutMessage) {}

    /// Called once for every completed forced shutdown.
    fn on_close(&self, conn: &Arc<Connection>) {
        debug!(connection_id = conn.id(), "on_close");
    }
}
