mod message;
mod network;
mod service;
mod utils;

pub use message::{Buffer, InMessage, OutMessage};
pub use network::{
    BoxedReader, BoxedWriter, BufferAllocator, Connection, Framing, HeaderWidth, HeapAllocator,
    LengthPrefixedPacker, LengthPrefixedUnpacker, MessageHandler, PackMode, Packer,
    PooledAllocator, PrefixSuffixPacker, PrefixSuffixUnpacker, RawPacker, ShutdownState,
    Statistic, StreamUnpacker, Unpacker,
};
pub use service::GLOBAL_CONFIG;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, ConnectionConfig,
    NetworkConfig, Server, ServerConfig, Shutdown, ShutdownTrigger, TracingGuard,
};
pub use utils::MemoryPool;
