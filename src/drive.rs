//! Drive unit state.

use crate::config::DriveConfig;
use crate::opcode::Opcode;
use crate::status::UnitStatus;

/// A drive's position within a command's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Wait,
    Start,
    Traverse,
    Data,
    Stop,
    Error,
}

/// One of up to four tape transports attached to a controller.
pub struct DriveUnit<B> {
    pub config: DriveConfig,
    pub online: bool,
    pub write_protected: bool,
    pub rewinding: bool,
    pub opcode: Opcode,
    pub phase: Phase,
    pub status: UnitStatus,
    pub position: u64,
    /// Sticky drive-attention flag, set on a rewind completion or an
    /// offline-to-online transition.
    pub attention: bool,
    /// Tape position recorded at command start, used to compute gap length
    /// for the interpolation clear performs in realtime mode.
    pub initial_position: u64,
    /// Erase-gap bytes traversed on the most recent backend call.
    pub gaplen: u32,
    /// CRCC/LRCC word pending emission as a single out-of-band `IFIN`
    /// (realtime NRZI `Read_Record`, which reports the trailer without
    /// counting it into the record length). `None` otherwise.
    pub pending_extra_word: Option<u16>,
    /// Sticky latch for an overrun/timing violation observed mid-transfer,
    /// folded into controller status when the command reaches Stop.
    pub overrun_seen: bool,
    pub image: Option<B>,
}

impl<B: crate::backend::TapeBackend> DriveUnit<B> {
    pub fn new(config: DriveConfig) -> Self {
        Self {
            config,
            online: false,
            write_protected: false,
            rewinding: false,
            opcode: Opcode::Invalid,
            phase: Phase::Idle,
            status: UnitStatus::default(),
            position: 0,
            attention: false,
            initial_position: 0,
            gaplen: 0,
            pending_extra_word: None,
            overrun_seen: false,
            image: None,
        }
    }

    /// Mounts `image`, transitioning offline -> online and raising
    /// attention.
    pub fn attach(&mut self, image: B, read_only: bool) {
        self.image = Some(image);
        self.write_protected = read_only;
        self.status.write_protected = read_only;
        self.set_online(true);
    }

    pub fn detach(&mut self) {
        self.image = None;
        self.online = false;
    }

    /// Toggles online/offline; the offline->online edge sets attention.
    pub fn set_online(&mut self, online: bool) {
        if online && !self.online {
            self.attention = true;
        }
        self.online = online;
    }

    /// A command classified "requires ready" needs the drive online and not
    /// mid-rewind.
    pub fn ready(&self) -> bool {
        self.online && !self.rewinding
    }

    pub fn at_load_point(&self) -> bool {
        self.position == 0
    }

    pub fn at_end_of_tape(&self) -> bool {
        match self.config.capacity_bytes() {
            Some(cap) => self.position >= cap,
            None => false,
        }
    }

    /// Resets transient per-command fields without touching persistent
    /// online/write-protect/image state. Used by controller clear.
    pub fn reset_command_state(&mut self) {
        self.phase = Phase::Idle;
        self.opcode = Opcode::Invalid;
        self.gaplen = 0;
        self.pending_extra_word = None;
        self.overrun_seen = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{Density, DriveModel};

    fn drive() -> DriveUnit<MemoryBackend> {
        DriveUnit::new(DriveConfig::new(DriveModel::Hp7970B, Density::Nrzi800).unwrap())
    }

    #[test]
    fn attach_goes_online_and_sets_attention() {
        let mut drive = drive();
        drive.attach(MemoryBackend::new(), false);
        assert!(drive.online);
        assert!(drive.attention);
        assert!(!drive.write_protected);
    }

    #[test]
    fn attach_read_only_sets_write_protect() {
        let mut drive = drive();
        drive.attach(MemoryBackend::new(), true);
        assert!(drive.write_protected);
        assert!(drive.status.write_protected);
    }

    #[test]
    fn detach_goes_offline_and_drops_image() {
        let mut drive = drive();
        drive.attach(MemoryBackend::new(), false);
        drive.detach();
        assert!(!drive.online);
        assert!(drive.image.is_none());
    }

    #[test]
    fn set_online_false_then_true_raises_attention_only_on_rising_edge() {
        let mut drive = drive();
        drive.attention = false;
        drive.set_online(false);
        assert!(!drive.attention);
        drive.set_online(true);
        assert!(drive.attention);
    }

    #[test]
    fn ready_requires_online_and_not_rewinding() {
        let mut drive = drive();
        assert!(!drive.ready());
        drive.attach(MemoryBackend::new(), false);
        assert!(drive.ready());
        drive.rewinding = true;
        assert!(!drive.ready());
    }
}
