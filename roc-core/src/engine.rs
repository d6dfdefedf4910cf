use crate::engine_a::EngineA;
use crate::engine_b::EngineB;
use crate::error::Result;
use crate::types::{DmaState, ResetLevel, Superpage};

/// The two DMA engines share one capability set but nothing in their
/// implementation, so they're composed as a tagged variant rather than
/// through a trait object: each family's push/arrival logic reads its own
/// register layout and ring structure, and a shared trait would either
/// leak one family's details into the other's impl or force a lowest-
/// common-denominator interface. A channel only ever has one engine for
/// its whole lifetime, so the dispatch cost of a match is negligible.
///
/// Model B's engine is general enough to drive several links at once, but
/// a channel always represents exactly one of them -- `link` pins the
/// one this channel pushes to and reads from.
pub enum Engine {
    A(Box<EngineA>),
    B { engine: Box<EngineB>, link: u32 },
}

impl Engine {
    pub fn dma_state(&self) -> DmaState {
        match self {
            Engine::A(e) => e.dma_state(),
            Engine::B { engine, .. } => engine.dma_state(),
        }
    }

    pub fn start_dma(&mut self) -> Result<()> {
        match self {
            Engine::A(e) => e.start_dma(),
            Engine::B { engine, .. } => engine.start_dma(),
        }
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        match self {
            Engine::A(e) => e.stop_dma(),
            Engine::B { engine, .. } => engine.stop_dma(),
        }
    }

    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        match self {
            Engine::A(e) => e.reset_channel(level),
            Engine::B { engine, .. } => engine.reset_channel(level),
        }
    }

    pub fn push_superpage(
        &mut self,
        offset: usize,
        size: usize,
        buffer_size: usize,
        bus_address: u64,
    ) -> Result<()> {
        match self {
            Engine::A(e) => e.push_superpage(offset, size, buffer_size, bus_address),
            Engine::B { engine, link } => {
                engine.push_superpage(*link, offset, size, buffer_size, bus_address)
            }
        }
    }

    pub fn fill_superpages(&mut self) -> Result<()> {
        match self {
            Engine::A(e) => e.fill_superpages(),
            Engine::B { engine, .. } => engine.fill_superpages(),
        }
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        match self {
            Engine::A(e) => e.get_superpage(),
            Engine::B { engine, link } => engine.get_superpage(*link),
        }
    }

    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        match self {
            Engine::A(e) => e.pop_superpage(),
            Engine::B { engine, link } => engine.pop_superpage(*link),
        }
    }

    pub fn transfer_queue_available(&self) -> Result<usize> {
        match self {
            Engine::A(e) => Ok(e.transfer_queue_available()),
            Engine::B { engine, link } => engine.transfer_queue_available(*link),
        }
    }

    pub fn ready_queue_size(&self) -> Result<usize> {
        match self {
            Engine::A(e) => Ok(e.ready_queue_size()),
            Engine::B { engine, link } => engine.ready_queue_size(*link),
        }
    }
}
