//! Tape controller opcodes, their classification, and control-word decoding.
//!
//! Only the word layout is pinned down: bits 6-7 carry a unit number, bits 8-11
//! must be zero, and bits 12-15 carry a 4-bit command code. Because the opcode set
//! has more members than fit in 13 usable codes (codes 1-3 are reserved), two
//! auxiliary bits act as family modifiers: bit 5 distinguishes Record/File and
//! Write_Gap/Write_Gap_and_File_Mark variants, bit 4 distinguishes Rewind from
//! Rewind_Offline. This resolution is recorded in DESIGN.md.

use crate::config::ControllerType;

/// A tape controller command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    SelectUnit0,
    SelectUnit1,
    SelectUnit2,
    SelectUnit3,
    ClearController,
    ReadRecord,
    ReadRecordWithCrcc,
    ReadRecordBackward,
    ReadFileForward,
    WriteRecord,
    WriteRecordWithoutParity,
    WriteFileMark,
    WriteGap,
    WriteGapAndFileMark,
    ForwardSpaceRecord,
    ForwardSpaceFile,
    BackspaceRecord,
    BackspaceFile,
    Rewind,
    RewindOffline,
    /// Reserved code, or a code decoded with nonzero reserved bits.
    Invalid,
}

/// Broad classification used for validation and timing lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    Control,
    Read,
    Write,
    Rewind,
}

/// Static properties of an opcode: classification, whether the drive must be
/// ready (online and not rewinding), whether it transfers data, and whether it
/// is defined for each of the four controller types.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeProps {
    pub class: CommandClass,
    pub requires_ready: bool,
    pub transfers_data: bool,
    valid: [bool; 4],
}

impl OpcodeProps {
    /// Controller-type order matches [`ControllerType`]'s declaration order.
    pub fn valid_for(&self, controller_type: ControllerType) -> bool {
        self.valid[controller_type as usize]
    }
}

/// `[NRZI-1000, PE-1000, HP3000, HPIB]`
const Y4: [bool; 4] = [true, true, true, true];
const NN_Y_N: [bool; 4] = [false, false, true, false];
const YY_N_N: [bool; 4] = [true, true, false, false];

impl Opcode {
    pub fn props(self) -> OpcodeProps {
        use CommandClass::*;
        match self {
            Opcode::SelectUnit0
            | Opcode::SelectUnit1
            | Opcode::SelectUnit2
            | Opcode::SelectUnit3 => OpcodeProps {
                class: Control,
                requires_ready: false,
                transfers_data: false,
                valid: Y4,
            },
            Opcode::ClearController => OpcodeProps {
                class: Control,
                requires_ready: false,
                transfers_data: false,
                valid: YY_N_N,
            },
            Opcode::ReadRecord => OpcodeProps {
                class: Read,
                requires_ready: true,
                transfers_data: true,
                valid: Y4,
            },
            Opcode::ReadRecordWithCrcc => OpcodeProps {
                class: Read,
                requires_ready: true,
                transfers_data: true,
                valid: NN_Y_N,
            },
            Opcode::ReadRecordBackward => OpcodeProps {
                class: Read,
                requires_ready: true,
                transfers_data: true,
                valid: YY_N_N,
            },
            Opcode::ReadFileForward => OpcodeProps {
                class: Read,
                requires_ready: true,
                transfers_data: true,
                valid: YY_N_N,
            },
            Opcode::WriteRecord => OpcodeProps {
                class: Write,
                requires_ready: true,
                transfers_data: true,
                valid: Y4,
            },
            Opcode::WriteRecordWithoutParity => OpcodeProps {
                class: Write,
                requires_ready: true,
                transfers_data: true,
                valid: NN_Y_N,
            },
            Opcode::WriteFileMark => OpcodeProps {
                class: Write,
                requires_ready: true,
                transfers_data: false,
                valid: Y4,
            },
            Opcode::WriteGap => OpcodeProps {
                class: Write,
                requires_ready: true,
                transfers_data: false,
                valid: Y4,
            },
            Opcode::WriteGapAndFileMark => OpcodeProps {
                class: Write,
                requires_ready: true,
                transfers_data: false,
                valid: YY_N_N,
            },
            Opcode::ForwardSpaceRecord
            | Opcode::ForwardSpaceFile
            | Opcode::BackspaceRecord
            | Opcode::BackspaceFile => OpcodeProps {
                class: Control,
                requires_ready: true,
                transfers_data: false,
                valid: Y4,
            },
            Opcode::Rewind | Opcode::RewindOffline => OpcodeProps {
                class: Rewind,
                requires_ready: true,
                transfers_data: false,
                valid: Y4,
            },
            Opcode::Invalid => OpcodeProps {
                class: Control,
                requires_ready: false,
                transfers_data: false,
                valid: [false; 4],
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::SelectUnit0 => "Select Unit 0",
            Opcode::SelectUnit1 => "Select Unit 1",
            Opcode::SelectUnit2 => "Select Unit 2",
            Opcode::SelectUnit3 => "Select Unit 3",
            Opcode::ClearController => "Clear Controller",
            Opcode::ReadRecord => "Read Record",
            Opcode::ReadRecordWithCrcc => "Read Record with CRCC",
            Opcode::ReadRecordBackward => "Read Record Backward",
            Opcode::ReadFileForward => "Read File Forward",
            Opcode::WriteRecord => "Write Record",
            Opcode::WriteRecordWithoutParity => "Write Record without Parity",
            Opcode::WriteFileMark => "Write File Mark",
            Opcode::WriteGap => "Write Gap",
            Opcode::WriteGapAndFileMark => "Write Gap and File Mark",
            Opcode::ForwardSpaceRecord => "Forward Space Record",
            Opcode::ForwardSpaceFile => "Forward Space File",
            Opcode::BackspaceRecord => "Backspace Record",
            Opcode::BackspaceFile => "Backspace File",
            Opcode::Rewind => "Rewind",
            Opcode::RewindOffline => "Rewind Offline",
            Opcode::Invalid => "(invalid opcode)",
        }
    }
}

/// A decoded SIO control word: target unit and requested opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    pub unit: u8,
    pub opcode: Opcode,
}

/// Decodes a 16-bit SIO control word (word 2): bits 6-7 unit number,
/// bits 8-11 must be zero, bits 12-15 command code. Never fails: reserved codes
/// or nonzero reserved bits decode to [`Opcode::Invalid`], matching the
/// hardware's command-reject-by-degrading behavior rather than raising an error.
pub fn decode_control_word(word: u16) -> DecodedCommand {
    let unit = ((word >> 6) & 0x3) as u8;
    let reserved = (word >> 8) & 0xF;
    let code = (word >> 12) & 0xF;
    let file_modifier = (word >> 5) & 0x1 != 0;
    let offline_modifier = (word >> 4) & 0x1 != 0;

    if reserved != 0 || (1..=3).contains(&code) {
        return DecodedCommand {
            unit,
            opcode: Opcode::Invalid,
        };
    }

    let opcode = match code {
        0 => Opcode::ClearController,
        4 => match unit {
            0 => Opcode::SelectUnit0,
            1 => Opcode::SelectUnit1,
            2 => Opcode::SelectUnit2,
            _ => Opcode::SelectUnit3,
        },
        5 => Opcode::ReadRecord,
        6 => Opcode::ReadRecordWithCrcc,
        7 => Opcode::ReadRecordBackward,
        8 => Opcode::ReadFileForward,
        9 => Opcode::WriteRecord,
        10 => Opcode::WriteRecordWithoutParity,
        11 => Opcode::WriteFileMark,
        12 => {
            if file_modifier {
                Opcode::WriteGapAndFileMark
            } else {
                Opcode::WriteGap
            }
        }
        13 => {
            if file_modifier {
                Opcode::ForwardSpaceFile
            } else {
                Opcode::ForwardSpaceRecord
            }
        }
        14 => {
            if file_modifier {
                Opcode::BackspaceFile
            } else {
                Opcode::BackspaceRecord
            }
        }
        15 => {
            if offline_modifier {
                Opcode::RewindOffline
            } else {
                Opcode::Rewind
            }
        }
        _ => Opcode::Invalid,
    };

    DecodedCommand { unit, opcode }
}
