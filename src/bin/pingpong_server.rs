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

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use stonenet::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, Connection, Framing,
    InMessage, MessageHandler, Server, ServerConfig, ShutdownTrigger, GLOBAL_CONFIG,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version, about = "Echoes every message back to its sender")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// worker threads of the runtime
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=16))]
    pub threads: u16,
    /// overrides `network.port`
    #[arg(short, long)]
    pub port: Option<u16>,
    /// overrides `network.ip`
    #[arg(long)]
    pub ip: Option<String>,
    /// write logs to hourly rolling files in this directory as well
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Sends every received message back.
///
/// When the send queue is full the message is refused and immediate
/// delivery is suspended, which parks everything arriving afterwards in the
/// connection's backlog. The first buffered message that can be echoed
/// again resumes immediate delivery.
struct EchoHandler {
    /// Raw framing: a received buffer already is its own wire message.
    move_back: bool,
}

impl EchoHandler {
    fn new(framing: &Framing) -> Self {
        EchoHandler {
            move_back: *framing == Framing::Raw,
        }
    }

    fn echo(&self, conn: &Arc<Connection>, msg: &mut InMessage) -> AppResult<()> {
        if !self.move_back {
            return conn.send(&[&msg[..]], false);
        }
        // a refused message is offered again later, keep its bytes until then
        let capacity = conn.config().max_msg_num;
        if conn.pending_send_msg_num() >= capacity {
            return Err(AppError::QueueFull(capacity));
        }
        conn.direct_send(msg.take_buffer(), true)
    }
}

impl MessageHandler for EchoHandler {
    fn on_message(&self, conn: &Arc<Connection>, msg: &mut InMessage) -> bool {
        match self.echo(conn, msg) {
            Ok(()) => true,
            Err(e) if e.is_backpressure() => {
                conn.suspend_dispatch();
                false
            }
            Err(e) => {
                error!(connection_id = conn.id(), "echo failed: {}", e);
                true
            }
        }
    }

    fn on_message_buffered(&self, conn: &Arc<Connection>, msg: &mut InMessage, link_down: bool) -> bool {
        if link_down {
            return true;
        }
        match self.echo(conn, msg) {
            Ok(()) => {
                conn.resume_dispatch();
                true
            }
            Err(e) if e.is_backpressure() => false,
            Err(e) => {
                error!(connection_id = conn.id(), "echo failed: {}", e);
                true
            }
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();

    let mut server_config = match &commandline.conf {
        Some(path) => ServerConfig::set_up_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = commandline.port {
        server_config.network.port = port;
    }
    if let Some(ip) = &commandline.ip {
        server_config.network.ip = ip.clone();
    }
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, level)?),
        None => {
            setup_local_tracing(level)?;
            None
        }
    };

    GLOBAL_CONFIG
        .set(server_config)
        .map_err(|_| AppError::IllegalStateError("config already installed".into()))?;

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(commandline.threads as usize)
        .thread_name("pingpong-worker")
        .enable_all()
        .build()?;
    rt.block_on(serve(global_config().clone()))
}

async fn serve(config: ServerConfig) -> AppResult<()> {
    let handler = Arc::new(EchoHandler::new(&config.connection.framing));
    let server = Arc::new(Server::bind(config, handler).await?);
    let trigger = ShutdownTrigger::new();
    let accept = {
        let server = server.clone();
        let shutdown = trigger.subscribe();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    println!("type `status` for statistics, `quit` to stop");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("received ctrl-c");
                break;
            }
            line = lines.next_line() => match line? {
                Some(cmd) => match cmd.trim() {
                    "quit" => break,
                    "status" => println!(
                        "connections: {}, invalid connections: {}, pooled blocks: {}\n{}",
                        server.size(),
                        server.invalid_size(),
                        server.memory_pool().idle_blocks(),
                        server.statistic()
                    ),
                    "" => {}
                    other => println!("unknown command `{}`, try `status` or `quit`", other),
                },
                None => {
                    // stdin closed, only a signal can stop us now
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            }
        }
    }

    trigger.trigger();
    server.shutdown_all(true).await;
    match accept.await {
        Ok(result) => result?,
        Err(e) => error!("accept task failed: {}", e),
    }
    info!("pingpong server stopped");
    Ok(())
}
