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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use super::{ServerConfig, Shutdown};
use crate::network::{BufferAllocator, Connection, MessageHandler, PooledAllocator, Statistic};
use crate::utils::MemoryPool;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// a live connection and the permit it holds against `max_connection`
type Registry = DashMap<u64, (Arc<Connection>, OwnedSemaphorePermit)>;

/// Accepts TCP connections and runs a [`Connection`] for each of them.
///
/// Connections that have shut down stay registered until the periodic
/// reclaim notices they are obsolete; their permit is released then.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn MessageHandler>,
    allocator: Arc<PooledAllocator>,
    limit_connections: Arc<Semaphore>,
    connections: Arc<Registry>,
}

impl Server {
    pub async fn bind(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> AppResult<Server> {
        config.connection.validate()?;
        let addr = format!("{}:{}", config.network.ip, config.network.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::TransportError(format!("bind {}: {}", addr, e)))?;
        info!("server listening on {}", addr);

        let pool = Arc::new(MemoryPool::new(config.network.memory_pool_blocks));
        Ok(Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(config.network.max_connection)),
            handler,
            allocator: Arc::new(PooledAllocator::new(pool)),
            connections: Arc::new(DashMap::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` fires.
    ///
    /// Each accepted socket gets a fresh connection id. The handler's
    /// `on_accept` may refuse it, in which case the socket is dropped
    /// unstarted. Returns an error only when accepting keeps failing.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, shutdown: Shutdown) -> AppResult<()> {
        self.spawn_reclaim(shutdown.clone());
        let mut shutdown = shutdown;

        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => permit
                    .map_err(|e| AppError::IllegalStateError(format!("connection limiter: {}", e)))?,
                _ = shutdown.recv() => break,
            };
            let socket = tokio::select! {
                socket = self.accept() => socket?,
                _ = shutdown.recv() => break,
            };

            let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            let allocator: Arc<dyn BufferAllocator> = self.allocator.clone();
            let conn = Connection::with_allocator(
                id,
                self.config.connection.clone(),
                self.handler.clone(),
                allocator,
            )?;
            if !self.handler.on_accept(&conn) {
                debug!(connection_id = id, "connection refused by handler");
                continue;
            }
            if let Err(e) = conn.start_tcp(socket) {
                error!(connection_id = id, "start connection failed: {}", e);
                continue;
            }
            debug!(connection_id = id, "accept new connection");
            self.connections.insert(id, (conn, permit));
        }
        debug!("server exit accept loop");
        Ok(())
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(err.to_string()));
                    }
                    error!("accept error: {}, retry in {}s", err, backoff);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    fn spawn_reclaim(&self, mut shutdown: Shutdown) {
        let connections = self.connections.clone();
        let interval = Duration::from_secs(self.config.network.reclaim_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = time::sleep(interval) => {}
                }
                let reclaimed = reclaim(&connections);
                if reclaimed > 0 {
                    debug!("reclaimed {} closed connections", reclaimed);
                }
            }
            debug!("reclaim task exited");
        });
    }

    /// Drops closed connections from the registry.
    pub fn reclaim(&self) -> usize {
        reclaim(&self.connections)
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Registered connections that are closed and wait for the next reclaim.
    pub fn invalid_size(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().0.obsoleted())
            .count()
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().0.clone())
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        self.allocator.pool()
    }

    /// Sum of the statistics of every registered connection.
    pub fn statistic(&self) -> Statistic {
        self.connections
            .iter()
            .fold(Statistic::default(), |sum, entry| sum + entry.value().0.statistic())
    }

    /// Shuts every registered connection down; graceful shutdowns run
    /// concurrently and each waits up to its configured timeout.
    pub async fn shutdown_all(&self, graceful: bool) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect();
        info!("shut down {} connections, graceful: {}", connections.len(), graceful);

        if !graceful {
            for conn in connections {
                conn.force_shutdown();
            }
            return;
        }
        let waiters: Vec<_> = connections
            .into_iter()
            .map(|conn| tokio::spawn(async move { conn.graceful_shutdown(true).await }))
            .collect();
        for waiter in waiters {
            if let Err(e) = waiter.await {
                error!("graceful shutdown task failed: {}", e);
            }
        }
    }
}

fn reclaim(connections: &Registry) -> usize {
    let before = connections.len();
    connections.retain(|_, (conn, _)| !conn.obsoleted());
    before.saturating_sub(connections.len())
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
