//! Status-bit aggregation and the controller-specific bit layout.
//!
//! Status reported to the host merges three sources: persistent
//! controller status, persistent unit status, and unit status computed
//! dynamically from drive state at the instant of the request. The bit
//! positions are controller-specific; [`StatusWord::encode`] is the one place
//! that knows the layout, so nothing else in the crate does bit arithmetic on
//! status.

use crate::config::ControllerType;

/// Sticky status carried on the controller across commands, cleared by
/// `Clear_Controller` / master reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerStatus {
    pub interface_busy: bool,
    pub command_rejected: bool,
    pub data_error: bool,
    pub end_of_file: bool,
    pub odd_length: bool,
    pub tape_runaway: bool,
    pub timing_error: bool,
}

impl ControllerStatus {
    pub fn clear(&mut self) {
        *self = ControllerStatus::default();
    }
}

/// Sticky status carried on a drive unit, set by backend results and
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitStatus {
    pub write_protected: bool,
    pub write_status: bool,
    pub density_1600: bool,
}

/// The 3-bit encoded-error field, wire-complemented for the HP3000 variant
/// wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedError {
    NoError,
    TapeError,
    Reserved,
    TimingError,
    Runaway,
    Reject,
    TransferError,
    UnitInterrupt,
}

impl EncodedError {
    fn raw_bits(self) -> u8 {
        match self {
            EncodedError::NoError => 0b000,
            EncodedError::TapeError => 0b010,
            EncodedError::Reserved => 0b001,
            EncodedError::TimingError => 0b011,
            EncodedError::Runaway => 0b100,
            EncodedError::Reject => 0b101,
            EncodedError::TransferError => 0b110,
            EncodedError::UnitInterrupt => 0b111,
        }
    }

    /// The 3-bit field as it appears on the wire: complemented for HP3000,
    /// plain elsewhere.
    pub fn wire_bits(self, controller_type: ControllerType) -> u8 {
        let raw = self.raw_bits();
        match controller_type {
            ControllerType::Hp3000 => (!raw) & 0b111,
            _ => raw,
        }
    }
}

/// Everything needed to merge and encode one status word.
pub struct StatusInputs {
    pub controller_type: ControllerType,
    pub controller: ControllerStatus,
    pub unit: UnitStatus,
    pub unit_selected: u8,
    pub unit_online: bool,
    pub unit_rewinding: bool,
    pub unit_ready: bool,
    pub unit_busy: bool,
    pub at_load_point: bool,
    pub at_end_of_tape: bool,
    pub tape_mark_seen: bool,
    pub sio_ok: bool,
    pub interrupt_requested: bool,
    pub error: EncodedError,
}

/// A fully merged 16-bit status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// Bit layout, MSB to LSB, for the HP3000 variant, the only one fully
    /// pinned down (bit positions are controller-specific and
    /// implementers must represent this as a table). Other controller types
    /// reuse the same layout rather than carrying a second table; resolved
    /// open question, documented in DESIGN.md.
    pub fn encode(inputs: &StatusInputs) -> StatusWord {
        let mut bits: u16 = 0;

        let mut set = |bit: u8, cond: bool| {
            if cond {
                bits |= 1 << bit;
            }
        };

        set(15, inputs.sio_ok);
        set(14, inputs.controller.odd_length);
        set(13, inputs.interrupt_requested);
        bits |= ((inputs.unit_selected & 0x3) as u16) << 11;
        set(10, inputs.at_end_of_tape);
        set(9, inputs.unit.write_protected);
        set(8, inputs.unit_ready);
        set(7, inputs.at_load_point);
        set(6, inputs.unit.density_1600);
        set(5, inputs.unit.write_status);
        set(4, inputs.tape_mark_seen);

        let error_bits = inputs.error.wire_bits(inputs.controller_type) as u16;
        bits |= error_bits << 1;

        // bit 0: 9-track/7-track, always 0 (this core only models 9-track).
        StatusWord(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

/// Picks the [`EncodedError`] to report for the current controller status
/// a fatal unit-interrupt-class condition never coexists with a
/// reject, so priority only matters among the recoverable conditions that
/// can be set together (timing-error discovered alongside others at Stop).
pub fn select_error(status: &ControllerStatus) -> EncodedError {
    if status.command_rejected {
        EncodedError::Reject
    } else if status.tape_runaway {
        EncodedError::Runaway
    } else if status.timing_error {
        EncodedError::TimingError
    } else if status.data_error {
        EncodedError::TapeError
    } else {
        EncodedError::NoError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> StatusInputs {
        StatusInputs {
            controller_type: ControllerType::Hp3000,
            controller: ControllerStatus::default(),
            unit: UnitStatus::default(),
            unit_selected: 0,
            unit_online: true,
            unit_rewinding: false,
            unit_ready: true,
            unit_busy: false,
            at_load_point: true,
            at_end_of_tape: false,
            tape_mark_seen: false,
            sio_ok: true,
            interrupt_requested: false,
            error: EncodedError::NoError,
        }
    }

    #[test]
    fn no_error_complements_to_all_ones_on_hp3000() {
        // raw bits for NoError are 0b000; complemented on the wire is 0b111.
        let inputs = base_inputs();
        let word = StatusWord::encode(&inputs);
        assert_eq!((word.bits() >> 1) & 0b111, 0b111);
    }

    #[test]
    fn no_error_passes_through_uncomplemented_off_hp3000() {
        let mut inputs = base_inputs();
        inputs.controller_type = ControllerType::Nrzi1000;
        let word = StatusWord::encode(&inputs);
        assert_eq!((word.bits() >> 1) & 0b111, 0b000);
    }

    #[test]
    fn reject_error_is_complemented_on_hp3000() {
        let mut inputs = base_inputs();
        inputs.error = EncodedError::Reject;
        let word = StatusWord::encode(&inputs);
        // raw bits for Reject are 0b101; complemented is 0b010.
        assert_eq!((word.bits() >> 1) & 0b111, 0b010);
    }

    #[test]
    fn unit_selected_field_round_trips() {
        let mut inputs = base_inputs();
        inputs.unit_selected = 3;
        let word = StatusWord::encode(&inputs);
        assert_eq!((word.bits() >> 11) & 0b11, 3);
    }

    #[test]
    fn select_error_prioritizes_reject() {
        let mut status = ControllerStatus::default();
        status.command_rejected = true;
        status.timing_error = true;
        assert_eq!(select_error(&status), EncodedError::Reject);
    }

    #[test]
    fn select_error_falls_back_to_no_error() {
        assert_eq!(
            select_error(&ControllerStatus::default()),
            EncodedError::NoError
        );
    }
}
