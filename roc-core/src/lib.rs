//! Hardware-agnostic core of a DMA channel driver for two families of
//! PCIe data-acquisition cards. Everything that talks to an actual device
//! sits behind [`card::CardBackend`] and [`bar::Bar`]; this crate owns
//! channel lifecycle, locking, buffer/descriptor bookkeeping, and the two
//! engines' push/arrival state machines.

pub mod bar;
pub mod buffer;
pub mod card;
pub mod channel;
pub mod config;
pub mod engine;
pub mod engine_a;
pub mod engine_b;
pub mod error;
pub mod lock;
pub mod registers;
pub mod reset;
pub mod spqueue;
pub mod types;

pub use card::{CardBackend, CardDescriptor, CardHandle};
pub use channel::{BufferParameters, ChannelBase, ChannelParameters};
pub use error::{Error, Result};
pub use types::{
    CardFamily, CardId, DataSource, DmaState, FirmwareInfo, GeneratorPattern, LoopbackMode,
    PciAddress, ReadoutMode, ResetLevel, Superpage,
};
