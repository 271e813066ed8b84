//! Per-phase delay tables: the small constant "fast" table used for everyday
//! simulation, and the "realtime" table keyed by `(controller, density)` that
//! approximates real HP 7970-series mechanics.
//!
//! All delays are in abstract ticks; the host CPU emulator decides what a
//! tick means in wall-clock terms. This crate never assumes a unit itself.

use crate::config::{ControllerType, Density, TimingMode};

/// One row of the delay table, covering every phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayTable {
    /// Added at Start before a rewind begins.
    pub rewind_start: u32,
    /// Ticks per inch of tape while rewinding.
    pub rewind_rate: u32,
    /// Added at Stop once a rewind reaches load point.
    pub rewind_stop: u32,
    /// Added at Start instead of `ir_start` when beginning from load point.
    pub bot_start: u32,
    /// Inter-record-gap traverse/stop delay; also the default command-reject
    /// interrupt delay.
    pub ir_start: u32,
    /// Ticks per byte transferred or traversed.
    pub data_xfer: u32,
    /// Fixed per-command overhead, added at every Start.
    pub overhead: u32,
}

impl DelayTable {
    /// Small constant delays used by default; fast enough that a simulated
    /// session completes promptly regardless of record size.
    pub const FAST: DelayTable = DelayTable {
        rewind_start: 10,
        rewind_rate: 1,
        rewind_stop: 10,
        bot_start: 5,
        ir_start: 5,
        data_xfer: 1,
        overhead: 2,
    };

    /// Approximate realtime values for `(controller, density)`. HP-1000
    /// controllers are single-density by construction (NRZI or PE only); the
    /// HP3000 and HP-IB controllers are dual-density and the table is keyed on
    /// the density actually in use.
    pub fn realtime(controller: ControllerType, density: Density) -> DelayTable {
        match (controller, density) {
            (ControllerType::Nrzi1000, _) | (_, Density::Nrzi800) => DelayTable {
                rewind_start: 75_000,
                rewind_rate: 420,
                rewind_stop: 8_000,
                bot_start: 26_000,
                ir_start: 2_000,
                data_xfer: 208, // 800 bpi @ 75 in/s: ~1/(800*75) s/byte
                overhead: 1_000,
            },
            (ControllerType::Pe1000, _) | (_, Density::Pe1600) => DelayTable {
                rewind_start: 75_000,
                rewind_rate: 420,
                rewind_stop: 8_000,
                bot_start: 26_000,
                ir_start: 1_500,
                data_xfer: 104, // 1600 bpi @ 75 in/s
                overhead: 1_000,
            },
        }
    }

    /// Selects the table in force for a given configuration.
    pub fn active(mode: TimingMode, controller: ControllerType, density: Density) -> DelayTable {
        match mode {
            TimingMode::Fast => DelayTable::FAST,
            TimingMode::Realtime => DelayTable::realtime(controller, density),
        }
    }

    /// Delay for entering Start: overhead plus the appropriate gap-start term.
    pub fn start_delay(&self, at_load_point: bool, is_rewind: bool) -> u32 {
        let gap = if is_rewind {
            self.rewind_start
        } else if at_load_point {
            self.bot_start
        } else {
            self.ir_start
        };
        self.overhead + gap
    }

    /// Delay for Traverse: proportional to the gap length traversed.
    pub fn traverse_delay(&self, gaplen: u32) -> u32 {
        gaplen.saturating_mul(self.data_xfer)
    }

    /// Delay for a non-transferring Data phase (e.g. space commands
    /// traversing record bytes with no host transfer).
    pub fn data_skip_delay(&self, length: u32) -> u32 {
        length.saturating_mul(self.data_xfer)
    }

    /// Stop-phase delay, optionally extended by the remaining unconsumed
    /// record length when the host ended the channel early.
    pub fn stop_delay(&self, early_end_remaining: u32) -> u32 {
        self.ir_start + early_end_remaining.saturating_mul(self.data_xfer)
    }

    /// Delay for a rewind traversing `inches` of tape, plus the stop latency.
    pub fn rewind_traverse_delay(&self, inches: u32) -> u32 {
        inches.saturating_mul(self.rewind_rate)
    }
}
