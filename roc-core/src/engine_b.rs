use crate::bar::{descriptor_release_fence, Bar};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::registers::b as reg;
use crate::spqueue::SpQueue;
use crate::types::{DataSource, DmaState, GeneratorPattern, LoopbackMode, ReadoutMode, ResetLevel, Superpage};

/// Descriptor table depth: 128 status words / descriptors shared across up
/// to 32 links, 4 descriptors each.
pub const DESCRIPTOR_TABLE_SIZE: usize = 128;
pub const MAX_LINKS: usize = 32;
const SLOTS_PER_LINK: usize = DESCRIPTOR_TABLE_SIZE / MAX_LINKS;

const DMA_START_REQUIRED_SUPERPAGES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Pending,
    Running,
}

struct Link {
    sp_queue: SpQueue,
    descriptor_base: usize,
}

/// Drives model B's per-link descriptor table: each enabled link in
/// `link_mask` gets its own 4-slot window of the shared 128-entry table and
/// its own `SpQueue`.
pub struct EngineB {
    control: Box<dyn Bar>,
    config: EngineConfig,
    links: Vec<(u32, Link)>,
    run_state: RunState,
}

impl EngineB {
    pub fn new(control: Box<dyn Bar>, config: EngineConfig, sp_queue_capacity: usize) -> Self {
        let mut links = Vec::new();
        for link in 0..MAX_LINKS as u32 {
            if config.link_mask & (1 << link) == 0 {
                continue;
            }
            links.push((
                link,
                Link {
                    sp_queue: SpQueue::new(sp_queue_capacity),
                    descriptor_base: link as usize * SLOTS_PER_LINK,
                },
            ));
        }
        Self {
            control,
            config,
            links,
            run_state: RunState::Stopped,
        }
    }

    fn link_mut(&mut self, link: u32) -> Result<&mut Link> {
        self.links
            .iter_mut()
            .find(|(id, _)| *id == link)
            .map(|(_, l)| l)
            .ok_or(Error::BadParameter {
                key: "link".into(),
                reason: format!("link {link} is not enabled in the configured link mask"),
            })
    }

    fn link(&self, link: u32) -> Result<&Link> {
        self.links
            .iter()
            .find(|(id, _)| *id == link)
            .map(|(_, l)| l)
            .ok_or(Error::BadParameter {
                key: "link".into(),
                reason: format!("link {link} is not enabled in the configured link mask"),
            })
    }

    pub fn dma_state(&self) -> DmaState {
        match self.run_state {
            RunState::Stopped => DmaState::Stopped,
            RunState::Pending | RunState::Running => DmaState::Started,
        }
    }

    pub fn transfer_queue_available(&self, link: u32) -> Result<usize> {
        Ok(self.link(link)?.sp_queue.available())
    }

    pub fn ready_queue_size(&self, link: u32) -> Result<usize> {
        Ok(self.link(link)?.sp_queue.filled_len())
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
        tracing::debug!("clearing data emulator control");
        self.control.write32(reg::DATA_EMULATOR_CONTROL, 0);
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
                self.control.write32(reg::RESET_CONTROL, reg::RESET_BIT_ENGINE | reg::RESET_BIT_COUNTER);
                for (_, link) in &mut self.links {
                    link.sp_queue.clear();
                }
                Ok(())
            }
            ResetStep::ResetDiu | ResetStep::ResetSiu | ResetStep::ResetRorc => {
                tracing::debug!(?step, "issuing downstream reset command");
                Ok(())
            }
        }
    }

    /// Validates and enqueues a superpage for one link: size
    /// must be a multiple of 32 KiB, offset 32-bit aligned.
    pub fn push_superpage(
        &mut self,
        link: u32,
        offset: usize,
        size: usize,
        buffer_size: usize,
        bus_address: u64,
    ) -> Result<()> {
        const ALIGN: usize = 32 * 1024;
        if size == 0 || size % ALIGN != 0 {
            return Err(Error::BadSuperpage {
                reason: format!("model B superpage size {size} must be a nonzero multiple of {ALIGN} bytes"),
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

        let page_size = self.config.page_size as usize;
        let max_pages = (size / page_size) as u32;

        // A superpage can span far more pages than the 4 descriptor slots
        // a link owns; `fill_one_link` programs it onto the card a chunk
        // of at most `SLOTS_PER_LINK` pages at a time, so there is nothing
        // to reject here beyond the parameter checks above.
        let link_ref = self.link_mut(link)?;
        link_ref
            .sp_queue
            .add(Superpage::new(offset, size), bus_address, max_pages)?;

        if self.run_state == RunState::Pending && self.total_queued() >= DMA_START_REQUIRED_SUPERPAGES {
            self.run_start_sequence()?;
        }
        Ok(())
    }

    fn total_queued(&self) -> usize {
        self.links.iter().map(|(_, l)| l.sp_queue.len()).sum()
    }

    /// Runs engine B's deferred start sequence: data source, loopback,
    /// generator, and per-link descriptor bases are configured, then the
    /// data emulator (or external datapath) is enabled.
    fn run_start_sequence(&mut self) -> Result<()> {
        self.apply_reset_step(crate::reset::ResetStep::ResetDmaEngine)?;

        let datapath_mode = match self.config.readout_mode {
            ReadoutMode::Continuous => 0u32,
            ReadoutMode::Packet => 1u32,
        };
        let source_bit = match self.config.data_source {
            DataSource::External => 0u32,
            DataSource::Internal => 1u32,
        };
        self.control
            .write32(reg::DMA_CONFIGURATION, datapath_mode | (source_bit << 1));

        if self.config.generator_enabled {
            let pattern_bits = match self.config.generator_pattern {
                GeneratorPattern::Incremental => 0u32,
                GeneratorPattern::Alternating => 1u32,
                GeneratorPattern::Constant => 2u32,
                GeneratorPattern::Random => 3u32,
            };
            tracing::debug!(
                pattern = pattern_bits,
                data_size = self.config.generator_data_size,
                "arming internal data emulator"
            );
            if self.config.loopback_mode == LoopbackMode::Diu {
                tracing::debug!("routing emulator output through the DIU loopback mux");
            }
            self.control.write32(
                reg::DATA_EMULATOR_CONTROL,
                reg::EMULATOR_BIT_READY | reg::EMULATOR_BIT_GENERATOR_START,
            );
        } else {
            self.control.write32(reg::DATA_EMULATOR_CONTROL, reg::EMULATOR_BIT_READY);
        }

        self.run_state = RunState::Running;
        Ok(())
    }

    /// Polls each enabled link's descriptor status words; a status of `1`
    /// means the corresponding page has arrived.
    pub fn fill_superpages(&mut self) -> Result<()> {
        if self.run_state == RunState::Pending && self.total_queued() >= DMA_START_REQUIRED_SUPERPAGES {
            self.run_start_sequence()?;
        }
        if self.run_state != RunState::Running {
            return Ok(());
        }

        let page_size = self.config.page_size as usize;
        let link_ids: Vec<u32> = self.links.iter().map(|(id, _)| *id).collect();
        for link in link_ids {
            self.fill_one_link(link, page_size)?;
        }
        Ok(())
    }

    fn fill_one_link(&mut self, link: u32, page_size: usize) -> Result<()> {
        self.program_next_chunk(link, page_size)?;
        self.poll_arrivals(link, page_size)
    }

    /// Programs at most `SLOTS_PER_LINK` pages of the pushing-front
    /// superpage onto the card: address registers for the chunk's first
    /// page, then pages-available/index packed into one register write.
    fn program_next_chunk(&mut self, link: u32, page_size: usize) -> Result<()> {
        let descriptor_base = self.link(link)?.descriptor_base;
        let Some(id) = self.link(link)?.sp_queue.pushing_front() else {
            return Ok(());
        };
        let entry = *self.link(link)?.sp_queue.entry(id);
        if entry.is_pushed() {
            self.link_mut(link)?.sp_queue.remove_from_pushing()?;
            return Ok(());
        }

        let chunk = entry.unpushed_pages().min(SLOTS_PER_LINK as u32);
        let chunk_bus_address = entry.bus_address + entry.pushed_pages() as u64 * page_size as u64;
        let slot_index = entry.pushed_pages() as usize % SLOTS_PER_LINK;

        self.control.write32(
            reg::ADDRESS_HIGH_BYTE / 4 + descriptor_base,
            (chunk_bus_address >> 32) as u32,
        );
        self.control.write32(
            reg::ADDRESS_LOW_BYTE / 4 + descriptor_base,
            (chunk_bus_address & 0xffff_ffff) as u32,
        );
        descriptor_release_fence();
        self.control.write32(
            reg::PAGES_AVAILABLE_AND_INDEX_BYTE / 4 + descriptor_base,
            (slot_index as u32 & 0xf) | (chunk << 4),
        );

        let link_ref = self.link_mut(link)?;
        let e = link_ref.sp_queue.entry_mut(id);
        e.set_pushed_pages(e.pushed_pages() + chunk);
        if e.is_pushed() {
            link_ref.sp_queue.remove_from_pushing()?;
        }
        Ok(())
    }

    /// Polls the link's single STATUS register (bit k = slot k available)
    /// and advances the arrivals-front entry's `received` count one slot
    /// at a time, acknowledging each bit as it's consumed.
    fn poll_arrivals(&mut self, link: u32, page_size: usize) -> Result<()> {
        let link_index = self.link(link)?.descriptor_base / SLOTS_PER_LINK;
        let mut status = self.control.read32(reg::STATUS_BYTE / 4 + link_index);
        loop {
            let Some(id) = self.link(link)?.sp_queue.arrivals_front() else {
                break;
            };
            let entry = *self.link(link)?.sp_queue.entry(id);
            let next_page = entry.superpage.received / page_size;
            if next_page >= entry.pushed_pages() as usize {
                break;
            }
            let slot = next_page % SLOTS_PER_LINK;
            if (status >> slot) & 1 == 0 {
                break;
            }
            status &= !(1 << slot);
            self.control.write32(reg::STATUS_BYTE / 4 + link_index, status);

            let link_ref = self.link_mut(link)?;
            let e = link_ref.sp_queue.entry_mut(id);
            e.superpage.received += page_size;
            if e.superpage.received >= e.superpage.size {
                e.superpage.ready = true;
                link_ref.sp_queue.promote_arrivals_to_filled()?;
            }
        }
        Ok(())
    }

    pub fn get_superpage(&self, link: u32) -> Result<Superpage> {
        let l = self.link(link)?;
        let id = l.sp_queue.front_id().ok_or(Error::QueueEmpty)?;
        Ok(l.sp_queue.entry(id).superpage)
    }

    pub fn pop_superpage(&mut self, link: u32) -> Result<Superpage> {
        Ok(self.link_mut(link)?.sp_queue.pop_filled()?.superpage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_per_link_matches_descriptor_table_layout() {
        assert_eq!(SLOTS_PER_LINK, 4);
        assert_eq!(SLOTS_PER_LINK * MAX_LINKS, DESCRIPTOR_TABLE_SIZE);
    }
}
