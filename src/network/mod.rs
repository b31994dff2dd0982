//! Network layer.
//!
//! - [`Framing`], [`Packer`] and [`Unpacker`]: turning messages into bytes
//!   and back
//! - [`Connection`]: the per-transport engine with its send queue, receive
//!   loop and shutdown machinery
//! - [`MessageHandler`]: application hooks called by a connection
//! - [`Statistic`]: per-connection counters

pub use connection::{BoxedReader, BoxedWriter, Connection, PackMode, ShutdownState};
pub use frame::{Framing, HeaderWidth};
pub use handler::MessageHandler;
pub use packer::{
    BufferAllocator, HeapAllocator, LengthPrefixedPacker, Packer, PooledAllocator,
    PrefixSuffixPacker, RawPacker,
};
pub use statistic::Statistic;
pub use unpacker::{LengthPrefixedUnpacker, PrefixSuffixUnpacker, StreamUnpacker, Unpacker};

mod connection;
mod frame;
mod handler;
mod packer;
mod statistic;
mod unpacker;
