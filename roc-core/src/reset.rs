use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::types::{LoopbackMode, ResetLevel};

const SIU_SETTLE: Duration = Duration::from_millis(100);
const RORC_SETTLE: Duration = Duration::from_millis(100);

/// Individual hardware actions a reset sequence can ask the engine to
/// perform. The sequencing itself (which steps, in which order, with which
/// delays) is shared between families; what each step actually writes to
/// the BAR is family-specific, so it's left to the caller's closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    ResetDmaEngine,
    ResetDiu,
    ResetSiu,
    ResetRorc,
}

/// Runs one of the three reset depths, calling `apply` for each hardware
/// step in order:
///
/// - `Nothing`: no steps at all.
/// - `Internal`: just `ResetDmaEngine` (clears the Free-FIFO/descriptor
///   ring and the DMA block).
/// - `InternalDiuSiu`: `ResetDmaEngine`, then (only when the loopback mode
///   actually routes through the downstream link, i.e. `Siu` or `Diu` — not
///   `None` and not `Internal`) DIU, then a settle delay and SIU+DIU again
///   (skipped when the loopback mode is `Diu`, since that path never reaches
///   the SIU), then RORC. A final settle delay always runs after the
///   depth-appropriate steps, matching the fixed post-reset wait the
///   hardware contract requires regardless of which branch ran.
pub fn run_sequence(
    level: ResetLevel,
    loopback_mode: LoopbackMode,
    mut apply: impl FnMut(ResetStep) -> Result<()>,
) -> Result<()> {
    match level {
        ResetLevel::Nothing => Ok(()),
        ResetLevel::Internal => apply(ResetStep::ResetDmaEngine),
        ResetLevel::InternalDiuSiu => {
            apply(ResetStep::ResetDmaEngine)?;
            if matches!(loopback_mode, LoopbackMode::Siu | LoopbackMode::Diu) {
                apply(ResetStep::ResetDiu)?;
                if loopback_mode != LoopbackMode::Diu {
                    thread::sleep(SIU_SETTLE);
                    apply(ResetStep::ResetSiu)?;
                    apply(ResetStep::ResetDiu)?;
                }
                apply(ResetStep::ResetRorc)?;
            }
            thread::sleep(RORC_SETTLE);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_runs_no_steps() {
        let mut steps = Vec::new();
        run_sequence(ResetLevel::Nothing, LoopbackMode::None, |s| {
            steps.push(s);
            Ok(())
        })
        .unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn internal_runs_only_dma_engine_reset() {
        let mut steps = Vec::new();
        run_sequence(ResetLevel::Internal, LoopbackMode::None, |s| {
            steps.push(s);
            Ok(())
        })
        .unwrap();
        assert_eq!(steps, vec![ResetStep::ResetDmaEngine]);
    }

    #[test]
    fn internal_diu_siu_skips_the_downstream_arm_under_internal_loopback() {
        let mut steps = Vec::new();
        run_sequence(ResetLevel::InternalDiuSiu, LoopbackMode::Internal, |s| {
            steps.push(s);
            Ok(())
        })
        .unwrap();
        assert_eq!(steps, vec![ResetStep::ResetDmaEngine]);
    }

    #[test]
    fn internal_diu_siu_skips_siu_under_diu_loopback() {
        let mut steps = Vec::new();
        run_sequence(ResetLevel::InternalDiuSiu, LoopbackMode::Diu, |s| {
            steps.push(s);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            steps,
            vec![ResetStep::ResetDmaEngine, ResetStep::ResetDiu, ResetStep::ResetRorc]
        );
    }

    #[test]
    fn internal_diu_siu_includes_siu_under_siu_loopback() {
        let mut steps = Vec::new();
        run_sequence(ResetLevel::InternalDiuSiu, LoopbackMode::Siu, |s| {
            steps.push(s);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            steps,
            vec![
                ResetStep::ResetDmaEngine,
                ResetStep::ResetDiu,
                ResetStep::ResetSiu,
                ResetStep::ResetDiu,
                ResetStep::ResetRorc,
            ]
        );
    }

    #[test]
    fn internal_diu_siu_skips_the_downstream_arm_when_loopback_is_none() {
        let mut steps = Vec::new();
        run_sequence(ResetLevel::InternalDiuSiu, LoopbackMode::None, |s| {
            steps.push(s);
            Ok(())
        })
        .unwrap();
        assert_eq!(steps, vec![ResetStep::ResetDmaEngine]);
    }
}
