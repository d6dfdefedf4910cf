use crate::types::{DataSource, GeneratorPattern, LoopbackMode, ReadoutMode, ResetLevel};

/// Default DMA page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

/// Engine-agnostic configuration derived from `ChannelParameters`. Both
/// `EngineA` and `EngineB` are built from one of these; fields the other
/// family ignores are simply unused (model A has no `readout_mode`/
/// `link_mask`, model B has no DIU/SIU loopback distinction beyond what
/// `LoopbackMode` already encodes).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: u32,
    pub generator_enabled: bool,
    pub generator_pattern: GeneratorPattern,
    pub generator_data_size: u32,
    pub loopback_mode: LoopbackMode,
    pub data_source: DataSource,
    pub initial_reset_level: ResetLevel,
    pub readout_mode: ReadoutMode,
    pub link_mask: u32,
    pub rdyrx_suppressed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            generator_enabled: false,
            generator_pattern: GeneratorPattern::Incremental,
            generator_data_size: DEFAULT_PAGE_SIZE,
            loopback_mode: LoopbackMode::None,
            data_source: DataSource::External,
            initial_reset_level: ResetLevel::Internal,
            readout_mode: ReadoutMode::Continuous,
            link_mask: 1,
            rdyrx_suppressed: false,
        }
    }
}
