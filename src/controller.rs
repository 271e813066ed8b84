//! The controller core: the command/phase state machine shared by all
//! four controller variants, independent of any particular host bus.
//!
//! [`Controller::step`] is the single synchronous entry point. It never
//! blocks and never calls back into itself; a command that needs mechanical
//! time schedules a future [`crate::scheduler::Scheduler`] event and returns
//! immediately. The host interface shim (`crate::shim`) is the only caller.

use log::{debug, trace, warn};

use crate::backend::{CallKind, Outcome, TapeBackend, MARKER_SIZE};
use crate::buffer::RecordBuffer;
use crate::config::{ControllerConfig, ControllerType, Density, TimingMode};
use crate::drive::{DriveUnit, Phase};
use crate::error::{AttachError, BackendError, ConfigError, SimError};
use crate::opcode::{decode_control_word, CommandClass, Opcode};
use crate::scheduler::{Scheduler, CONTROLLER_UNIT};
use crate::status::{select_error, ControllerStatus, StatusInputs, StatusWord};
use crate::timing::DelayTable;

/// Overall controller occupancy. Only one foreground command may hold the
/// shared [`RecordBuffer`] at a time; rewinds are deliberately excluded from
/// this and run against their own unit state while the controller stays
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Busy,
    DeviceEnd,
    Error,
}

/// Command classification carried by `ControllerFn::Ifgtc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Read,
    Write,
    Control,
    Rewind,
}

impl From<CommandClass> for Classification {
    fn from(class: CommandClass) -> Self {
        match class {
            CommandClass::Read => Classification::Read,
            CommandClass::Write => Classification::Write,
            CommandClass::Control => Classification::Control,
            CommandClass::Rewind => Classification::Rewind,
        }
    }
}

/// The function-bus replacement for a packed `function_bits | data_bits`
/// word: a sum type carrying whatever payload the function needs, returned
/// in order from [`Controller::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerFn {
    /// Controller offers a read-data word. Host must latch it.
    Ifin(u16),
    /// Controller has consumed a write-data word from its buffer.
    Ifout,
    /// A new command has been accepted.
    Ifgtc(Classification),
    /// Request the host to initiate a channel transfer cycle.
    Rqsrv,
    /// Device-ended the transfer (short record, tape mark, end of medium).
    Dvend,
    /// Request an interrupt.
    Stint,
    /// A drive has raised attention; carries its unit index.
    Dattn(u8),
    /// A fatal backend condition; carries the error kind.
    Scpe(SimError),
}

/// Host-side flag set presented to the controller on every [`Controller::step`]
/// call.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFlags {
    pub intok: bool,
    pub cmrdy: bool,
    pub cmxeq: bool,
    pub dtrdy: bool,
    pub eod: bool,
    pub ovrun: bool,
    pub xfrng: bool,
}

/// The controller core: one command buffer and up to four drives, shared
/// across all controller variants.
pub struct Controller<B> {
    config: ControllerConfig,
    state: ControllerState,
    status: ControllerStatus,
    unit_selected: u8,
    unit_attention: u8,
    buffer: RecordBuffer,
    units: [DriveUnit<B>; 4],
    scheduler: Scheduler,
    active_unit: Option<usize>,
}

impl<B: TapeBackend> Controller<B> {
    pub fn new(config: ControllerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let units = config.drives.clone().map(DriveUnit::new);
        Ok(Self {
            config,
            state: ControllerState::Idle,
            status: ControllerStatus::default(),
            unit_selected: 0,
            unit_attention: 0,
            buffer: RecordBuffer::new(),
            units,
            scheduler: Scheduler::new(),
            active_unit: None,
        })
    }

    pub fn controller_type(&self) -> ControllerType {
        self.config.controller_type
    }

    pub fn unit_selected(&self) -> u8 {
        self.unit_selected
    }

    /// Whether a DRESETINT should immediately re-poll for pending attention
    /// (resolved open question, per-configuration override).
    pub fn config_poll_on_reset_interrupt(&self) -> bool {
        self.config.poll_on_reset_interrupt
    }

    pub fn unit(&self, index: usize) -> &DriveUnit<B> {
        &self.units[index]
    }

    // -- attach/detach/online, mirroring DriveUnit's own lifecycle calls ---

    pub fn attach(&mut self, unit: usize, image: B, read_only: bool) -> Result<(), AttachError> {
        if unit >= self.units.len() {
            return Err(AttachError::DriveIndexOutOfRange(unit));
        }
        if self.units[unit].rewinding {
            return Err(AttachError::Rewinding);
        }
        self.units[unit].attach(image, read_only);
        self.unit_attention |= 1 << unit;
        Ok(())
    }

    pub fn detach(&mut self, unit: usize) {
        if unit < self.units.len() {
            self.units[unit].detach();
            self.scheduler.cancel(unit);
        }
    }

    pub fn set_online(&mut self, unit: usize, online: bool) {
        if unit < self.units.len() {
            let was_online = self.units[unit].online;
            self.units[unit].set_online(online);
            if online && !was_online {
                self.unit_attention |= 1 << unit;
            }
        }
    }

    /// Merges controller, unit, and dynamic status for the currently
    /// selected unit. `interrupt_requested` and `sio_ok` are owned by
    /// the host shim, not the core, so the caller supplies them.
    pub fn status_word(&self, interrupt_requested: bool, sio_ok: bool) -> StatusWord {
        let unit = &self.units[self.unit_selected as usize];
        let inputs = StatusInputs {
            controller_type: self.config.controller_type,
            controller: self.status,
            unit: unit.status,
            unit_selected: self.unit_selected,
            unit_online: unit.online,
            unit_rewinding: unit.rewinding,
            unit_ready: unit.ready(),
            unit_busy: self.active_unit == Some(self.unit_selected as usize),
            at_load_point: unit.at_load_point(),
            at_end_of_tape: unit.at_end_of_tape(),
            tape_mark_seen: self.status.end_of_file,
            sio_ok,
            interrupt_requested,
            error: select_error(&self.status),
        };
        StatusWord::encode(&inputs)
    }

    // -- the tick/step entry point --------------------------------------

    /// Advances the controller one event. `event_unit` is `Some` only when
    /// the scheduler has fired an event for that unit; it is never used to
    /// signal a host-side flag change (see [`Controller::begin_transfer_cycle`]
    /// for that path).
    pub fn step(
        &mut self,
        event_unit: Option<usize>,
        flags: HostFlags,
        data_in: u16,
    ) -> Vec<ControllerFn> {
        let mut out = Vec::new();

        if flags.xfrng {
            trace!("step: XFRNG asserted, no work until cleared");
            return out;
        }

        if let Some(unit) = event_unit {
            out.extend(self.continue_command(unit, flags, data_in));
        } else if flags.cmrdy || flags.cmxeq {
            out.extend(self.start_command(data_in));
        }

        if matches!(self.state, ControllerState::Idle)
            && flags.intok
            && self.config.controller_type == ControllerType::Hp3000
        {
            out.extend(self.poll_drives());
        }

        out
    }

    /// Ticks remaining until the next scheduled unit event, if any. A host
    /// driving simulated time can jump the clock straight there instead
    /// of single-stepping it one tick at a time.
    pub fn ticks_until_next_event(&self) -> Option<u32> {
        self.scheduler
            .next_due()
            .map(|due| due.saturating_sub(self.scheduler.now()) as u32)
    }

    /// Advances simulated time by `ticks` and delivers every event that
    /// becomes due in scheduler order, each through [`Controller::step`]
    /// (events on distinct units are ordered by scheduled tick, ties
    /// broken by unit index). This is the host's clock-advance call; `step`
    /// with `event_unit: Some(_)` is what actually runs when one fires.
    pub fn advance(&mut self, ticks: u64, flags: HostFlags, data_in: u16) -> Vec<ControllerFn> {
        let due = self.scheduler.advance(ticks);
        let mut out = Vec::new();
        for unit in due {
            out.extend(self.step(Some(unit), flags, data_in));
        }
        out
    }

    /// Called by the shim on a scheduler event for the pseudo-unit used to
    /// deliver the command-reject interrupt, and on real unit events.
    fn continue_command(
        &mut self,
        unit: usize,
        flags: HostFlags,
        data_in: u16,
    ) -> Vec<ControllerFn> {
        if unit == CONTROLLER_UNIT {
            self.state = ControllerState::Idle;
            debug!("command-reject interrupt delivered");
            return vec![ControllerFn::Stint];
        }

        if matches!(self.units[unit].opcode, Opcode::Rewind | Opcode::RewindOffline) {
            return self.continue_rewind(unit);
        }

        match self.units[unit].phase {
            Phase::Start => self.continue_start(unit),
            Phase::Traverse => self.continue_traverse(unit),
            Phase::Data => self.continue_data(unit, flags, data_in),
            Phase::Stop => self.continue_stop(unit),
            Phase::Wait | Phase::Idle | Phase::Error => Vec::new(),
        }
    }

    /// Scans `unit_attention` for the lowest-numbered set bit and clears it
    /// (deterministic, numerically-lowest-first ordering).
    fn poll_drives(&mut self) -> Vec<ControllerFn> {
        for i in 0..self.units.len() as u8 {
            if self.unit_attention & (1 << i) != 0 {
                self.unit_attention &= !(1 << i);
                trace!("poll_drives: attention from unit {i}");
                return vec![ControllerFn::Dattn(i)];
            }
        }
        Vec::new()
    }

    // -- command validation and dispatch -----------------------------------

    fn start_command(&mut self, data_in: u16) -> Vec<ControllerFn> {
        let decoded = decode_control_word(data_in);
        let opcode = decoded.opcode;
        let unit = decoded.unit as usize;
        let props = opcode.props();

        let reject = opcode == Opcode::Invalid
            || !props.valid_for(self.config.controller_type)
            || (props.requires_ready && !self.units[unit].ready())
            || (props.class == CommandClass::Write && self.units[unit].write_protected)
            || (matches!(self.state, ControllerState::Busy) && opcode != Opcode::ClearController);

        if reject {
            warn!("command reject: {} on unit {unit}", opcode.name());
            return self.reject_command();
        }

        debug!("accepted {} on unit {unit}", opcode.name());
        self.status.command_rejected = false;

        match opcode {
            Opcode::SelectUnit0 | Opcode::SelectUnit1 | Opcode::SelectUnit2 | Opcode::SelectUnit3 => {
                self.unit_selected = decoded.unit;
                vec![ControllerFn::Ifgtc(Classification::Control), ControllerFn::Rqsrv]
            }
            Opcode::ClearController => {
                self.clear();
                vec![ControllerFn::Ifgtc(Classification::Control), ControllerFn::Rqsrv]
            }
            Opcode::Rewind | Opcode::RewindOffline => {
                self.unit_selected = decoded.unit;
                self.begin_rewind(unit, opcode);
                vec![ControllerFn::Ifgtc(Classification::Rewind), ControllerFn::Rqsrv]
            }
            _ => {
                self.unit_selected = decoded.unit;
                self.begin_command(unit, opcode);
                vec![
                    ControllerFn::Ifgtc(Classification::from(props.class)),
                    ControllerFn::Rqsrv,
                ]
            }
        }
    }

    fn reject_command(&mut self) -> Vec<ControllerFn> {
        self.status.command_rejected = true;
        let delay = self
            .config
            .reject_interrupt_delay_ticks
            .unwrap_or_else(|| self.delay_table(self.unit_selected as usize).ir_start);
        self.scheduler.schedule(CONTROLLER_UNIT, delay);
        Vec::new()
    }

    /// Sets up a non-rewind command: foreground transfer commands enter
    /// `Wait` (resumed by [`Controller::begin_transfer_cycle`]); everything
    /// else enters `Start` directly, scheduled on the normal event path.
    fn begin_command(&mut self, unit: usize, opcode: Opcode) {
        self.state = ControllerState::Busy;
        self.active_unit = Some(unit);
        self.buffer.reset();

        let drive = &mut self.units[unit];
        drive.opcode = opcode;
        drive.initial_position = drive.position;
        drive.gaplen = 0;
        drive.overrun_seen = false;
        drive.pending_extra_word = None;

        if opcode.props().transfers_data {
            drive.phase = Phase::Wait;
        } else {
            drive.phase = Phase::Start;
            let at_load_point = drive.at_load_point();
            let delay = self.delay_table(unit).start_delay(at_load_point, false);
            self.scheduler.schedule(unit, delay);
        }
    }

    fn begin_rewind(&mut self, unit: usize, opcode: Opcode) {
        let drive = &mut self.units[unit];
        drive.opcode = opcode;
        drive.rewinding = true;
        drive.phase = Phase::Start;
        drive.initial_position = drive.position;

        let inches = bytes_to_inches(drive.position, drive.config.density);
        let table = self.delay_table(unit);
        let delay = table.start_delay(false, true) + table.rewind_traverse_delay(inches);
        self.scheduler.schedule(unit, delay);
    }

    // -- the Wait -> Start transition for transfer commands -----------------

    /// Exits `Wait` phase for a data-transferring command. Called directly by
    /// the host shim on the channel-start signal (TOGGLEINXFER/TOGGLEOUTXFER
    /// rising edge), not through [`Controller::step`]'s scheduled-event path:
    /// this phase resumes by calling straight into the phase continuation
    /// routine from the interface handler rather than arming a timer (see
    /// DESIGN.md).
    pub fn begin_transfer_cycle(&mut self, unit: usize) -> Vec<ControllerFn> {
        if self.units[unit].phase != Phase::Wait {
            return Vec::new();
        }
        self.units[unit].phase = Phase::Start;

        match self.units[unit].opcode {
            Opcode::ReadRecord | Opcode::ReadRecordWithCrcc | Opcode::ReadFileForward => {
                self.do_read(unit, false)
            }
            Opcode::ReadRecordBackward => self.do_read(unit, true),
            Opcode::WriteRecord | Opcode::WriteRecordWithoutParity => self.do_write_start(unit),
            _ => Vec::new(),
        }
    }

    /// Pulls the next word out of the record buffer for a Read transfer.
    /// Called by the shim on PREADSTB.
    pub fn next_read_word(&mut self, unit: usize) -> Option<u16> {
        if self.units[unit].phase != Phase::Data {
            return None;
        }
        let hi = self.buffer.take_byte()?;
        if self.config.controller_type == ControllerType::HpIb {
            Some(hi as u16)
        } else {
            let lo = self.buffer.take_byte().unwrap_or(0);
            Some(((hi as u16) << 8) | lo as u16)
        }
    }

    /// Accepts one word from a Write transfer into the record buffer. Called
    /// by the shim on PWRITESTB. Returns `false` if the buffer is full.
    pub fn accept_write_word(&mut self, unit: usize, word: u16) -> bool {
        if self.units[unit].phase != Phase::Data {
            return false;
        }
        if self.config.controller_type == ControllerType::HpIb {
            self.buffer.put_byte(word as u8)
        } else {
            let hi = (word >> 8) as u8;
            let lo = (word & 0xFF) as u8;
            self.buffer.put_byte(hi) && self.buffer.put_byte(lo)
        }
    }

    /// Ends a Data-phase transfer (host dropped EOD, or the channel reported
    /// an overrun), scheduling the Stop-phase delay. Called by the shim on
    /// the channel-stop signal.
    pub fn end_transfer(&mut self, unit: usize, flags: HostFlags) -> Vec<ControllerFn> {
        if self.units[unit].phase != Phase::Data {
            return Vec::new();
        }
        if flags.ovrun {
            self.units[unit].overrun_seen = true;
        }
        let remaining = if flags.eod {
            self.buffer.remaining() as u32
        } else {
            0
        };
        self.units[unit].phase = Phase::Stop;
        let delay = self.delay_table(unit).stop_delay(remaining);
        self.scheduler.schedule(unit, delay);

        if remaining > 0 {
            vec![ControllerFn::Dvend]
        } else {
            Vec::new()
        }
    }

    // -- phase engine (the authoritative transition table) ------------------

    fn continue_start(&mut self, unit: usize) -> Vec<ControllerFn> {
        match self.units[unit].opcode {
            Opcode::WriteFileMark => self.do_write_gap_then_mark(unit, false),
            Opcode::WriteGap => self.do_write_gap(unit),
            Opcode::WriteGapAndFileMark => self.do_write_gap_then_mark(unit, true),
            Opcode::ForwardSpaceRecord => self.do_space(unit, true, false),
            Opcode::ForwardSpaceFile => self.do_space(unit, true, true),
            Opcode::BackspaceRecord => self.do_space(unit, false, false),
            Opcode::BackspaceFile => self.do_space(unit, false, true),
            _ => Vec::new(),
        }
    }

    fn continue_traverse(&mut self, unit: usize) -> Vec<ControllerFn> {
        let transfers = self.units[unit].opcode.props().transfers_data;
        self.units[unit].phase = Phase::Data;
        if !transfers {
            let gaplen = self.units[unit].gaplen.max(1);
            let delay = self.delay_table(unit).data_skip_delay(gaplen);
            self.scheduler.schedule(unit, delay);
        }
        Vec::new()
    }

    /// Only reached by commands that schedule a Data-phase event themselves
    /// (everything except the host-driven transfer commands, which leave
    /// `Data` through [`Controller::end_transfer`]).
    fn continue_data(&mut self, unit: usize, _flags: HostFlags, _data_in: u16) -> Vec<ControllerFn> {
        if matches!(
            self.units[unit].opcode,
            Opcode::WriteFileMark | Opcode::WriteGapAndFileMark
        ) {
            if let Err(e) = self.write_backend(unit, |b| b.write_tape_mark()) {
                return self.fail_command(unit, e);
            }
        }

        self.units[unit].phase = Phase::Stop;
        let delay = self.delay_table(unit).ir_start;
        self.scheduler.schedule(unit, delay);
        Vec::new()
    }

    fn continue_stop(&mut self, unit: usize) -> Vec<ControllerFn> {
        if self.units[unit].opcode == Opcode::WriteRecordWithoutParity {
            let raw = self.buffer.as_slice().to_vec();
            let (data, parity_bad) = degrade_without_parity(&raw);
            let bad = self.units[unit].overrun_seen || parity_bad;
            if let Err(e) = self.write_backend(unit, |b| b.write_record(&data, bad)) {
                return self.fail_command(unit, e);
            }
        } else if self.units[unit].opcode == Opcode::WriteRecord {
            let bad = self.units[unit].overrun_seen;
            let data = self.buffer.as_slice().to_vec();
            if let Err(e) = self.write_backend(unit, |b| b.write_record(&data, bad)) {
                return self.fail_command(unit, e);
            }
        }

        if self.units[unit].overrun_seen {
            self.status.timing_error = true;
            warn!("overrun on unit {unit}, timing error latched");
        }

        let mut out = Vec::new();
        if let Some(word) = self.units[unit].pending_extra_word.take() {
            // The CRCC/LRCC trailer for a plain Read_Record at NRZI density:
            // delivered once, out of band, with no preceding Rqsrv.
            out.push(ControllerFn::Ifin(word));
        }

        self.finish_command(unit);
        out.push(ControllerFn::Stint);
        out
    }

    fn continue_rewind(&mut self, unit: usize) -> Vec<ControllerFn> {
        match self.units[unit].phase {
            Phase::Start => match self.write_backend(unit, |b| b.rewind()) {
                Ok(_) => {
                    self.units[unit].phase = Phase::Stop;
                    let delay = self.delay_table(unit).rewind_stop;
                    self.scheduler.schedule(unit, delay);
                    Vec::new()
                }
                Err(e) => {
                    self.units[unit].rewinding = false;
                    self.units[unit].phase = Phase::Error;
                    vec![ControllerFn::Scpe(e)]
                }
            },
            Phase::Stop => {
                self.units[unit].rewinding = false;
                self.units[unit].phase = Phase::Idle;
                if self.units[unit].opcode == Opcode::RewindOffline {
                    self.units[unit].online = false;
                }
                self.units[unit].attention = true;
                self.unit_attention |= 1 << unit;
                debug!("rewind complete on unit {unit}");
                vec![ControllerFn::Dattn(unit as u8)]
            }
            _ => Vec::new(),
        }
    }

    // -- opcode-specific Start actions ---------------------------------------

    fn do_read(&mut self, unit: usize, reverse: bool) -> Vec<ControllerFn> {
        let kind = if reverse {
            CallKind::ReadReverse
        } else {
            CallKind::ReadForward
        };
        match self.backend_call(unit, kind) {
            Ok((Outcome::Record { data, .. }, gaplen)) => self.finish_read(unit, data, gaplen, false),
            Ok((Outcome::BadRecord { data, .. }, gaplen)) => self.finish_read(unit, data, gaplen, true),
            Ok((Outcome::TapeMark, _)) => {
                self.status.end_of_file = true;
                if self.config.controller_type == ControllerType::Nrzi1000 {
                    self.status.odd_length = true;
                }
                self.finish_command(unit);
                vec![ControllerFn::Dvend]
            }
            Ok((Outcome::EndOfMedium, _)) => {
                self.status.end_of_file = true;
                if self.config.controller_type == ControllerType::Nrzi1000 {
                    self.status.odd_length = true;
                }
                self.finish_command(unit);
                vec![ControllerFn::Dvend]
            }
            Ok((Outcome::Done, _)) => Vec::new(),
            Err(e) => self.fail_command(unit, e),
        }
    }

    fn finish_read(&mut self, unit: usize, data: Vec<u8>, gaplen: u32, bad: bool) -> Vec<ControllerFn> {
        self.buffer.load(&data);
        if bad {
            self.status.data_error = true;
        }
        self.apply_crcc_if_needed(unit);

        self.units[unit].gaplen = gaplen;
        if gaplen > 0 {
            self.units[unit].phase = Phase::Traverse;
            let delay = self.delay_table(unit).traverse_delay(gaplen);
            self.scheduler.schedule(unit, delay);
        } else {
            self.units[unit].phase = Phase::Data;
        }
        Vec::new()
    }

    /// Computes and appends the CRCC/LRCC trailer for a successful read at
    /// NRZI density: counted into the record for
    /// `Read_Record_with_CRCC`, otherwise delivered as a single out-of-band
    /// extra word.
    fn apply_crcc_if_needed(&mut self, unit: usize) {
        if self.units[unit].config.density != Density::Nrzi800 {
            return;
        }
        let crcc = crate::crc::compute(self.buffer.as_slice());
        if self.units[unit].opcode == Opcode::ReadRecordWithCrcc {
            self.buffer.append_crcc_trailer(crcc, true);
        } else {
            let word = ((crcc.crc & 0xFF) << 8) | (crcc.lrc & 0xFF);
            self.units[unit].pending_extra_word = Some(word);
        }
    }

    fn do_write_start(&mut self, unit: usize) -> Vec<ControllerFn> {
        let at_bot = self.units[unit].at_load_point();
        if at_bot && self.config.timing == TimingMode::Realtime {
            self.do_write_gap(unit)
        } else {
            self.units[unit].phase = Phase::Data;
            Vec::new()
        }
    }

    fn do_write_gap(&mut self, unit: usize) -> Vec<ControllerFn> {
        let gap_len = self.units[unit]
            .config
            .model
            .gap_length(self.units[unit].config.density);
        match self.write_backend(unit, |b| b.write_gap(gap_len)) {
            Ok(_) => {
                self.units[unit].gaplen = gap_len;
                self.units[unit].phase = Phase::Traverse;
                let delay = self.delay_table(unit).traverse_delay(gap_len);
                self.scheduler.schedule(unit, delay);
                Vec::new()
            }
            Err(e) => self.fail_command(unit, e),
        }
    }

    fn do_write_gap_then_mark(&mut self, unit: usize, with_gap: bool) -> Vec<ControllerFn> {
        let at_bot = self.units[unit].at_load_point();
        if with_gap || (at_bot && self.config.timing == TimingMode::Realtime) {
            self.do_write_gap(unit)
        } else {
            self.units[unit].phase = Phase::Data;
            let delay = self.delay_table(unit).overhead;
            self.scheduler.schedule(unit, delay);
            Vec::new()
        }
    }

    fn do_space(&mut self, unit: usize, forward: bool, whole_file: bool) -> Vec<ControllerFn> {
        let kind = if forward {
            CallKind::SpaceForward
        } else {
            CallKind::SpaceReverse
        };

        loop {
            match self.backend_call(unit, kind) {
                Ok((Outcome::TapeMark, _)) => {
                    self.status.end_of_file = true;
                    self.finish_command(unit);
                    return if whole_file {
                        vec![ControllerFn::Stint]
                    } else {
                        vec![ControllerFn::Dvend]
                    };
                }
                Ok((Outcome::EndOfMedium, _)) => {
                    self.status.end_of_file = true;
                    if self.config.controller_type == ControllerType::Nrzi1000 {
                        self.status.odd_length = true;
                    }
                    self.finish_command(unit);
                    return vec![ControllerFn::Dvend];
                }
                Ok((Outcome::Record { .. }, gaplen)) | Ok((Outcome::BadRecord { .. }, gaplen)) => {
                    if whole_file {
                        continue;
                    }
                    self.units[unit].gaplen = gaplen;
                    self.units[unit].phase = Phase::Traverse;
                    let delay = self.delay_table(unit).traverse_delay(gaplen);
                    self.scheduler.schedule(unit, delay);
                    return Vec::new();
                }
                Ok((Outcome::Done, _)) => return Vec::new(),
                Err(e) => return self.fail_command(unit, e),
            }
        }
    }

    // -- controller clear ----------------------------------------------------

    /// Aborts every non-rewinding unit's in-progress command and resets
    /// sticky controller status. Rewinds continue to completion in the
    /// background.
    pub fn clear(&mut self) {
        for unit in 0..self.units.len() {
            if self.units[unit].rewinding || matches!(self.units[unit].phase, Phase::Idle) {
                continue;
            }
            self.abort_unit(unit);
            self.scheduler.cancel(unit);
        }
        self.scheduler.cancel(CONTROLLER_UNIT);
        self.status.clear();
        self.state = ControllerState::Idle;
        self.active_unit = None;
    }

    fn abort_unit(&mut self, unit: usize) {
        let opcode = self.units[unit].opcode;
        let phase = self.units[unit].phase;

        if matches!(opcode, Opcode::WriteRecord | Opcode::WriteRecordWithoutParity)
            && matches!(phase, Phase::Data | Phase::Stop)
            && self.buffer.length() > 0
        {
            let data = self.buffer.as_slice().to_vec();
            let _ = self.write_backend(unit, |b| b.write_record(&data, true));
        }

        if matches!(phase, Phase::Traverse) && self.config.timing == TimingMode::Realtime {
            if let Some(remaining) = self.scheduler.remaining(unit) {
                let xfer = self.delay_table(unit).data_xfer.max(1);
                let partial = self.units[unit].gaplen.saturating_sub(remaining / xfer);
                let initial = self.units[unit].initial_position;
                self.units[unit].position = initial.saturating_add(partial as u64);
            }
        }

        self.units[unit].reset_command_state();
    }

    fn finish_command(&mut self, unit: usize) {
        self.units[unit].phase = Phase::Idle;
        if self.active_unit == Some(unit) {
            self.active_unit = None;
            self.state = ControllerState::Idle;
        }
    }

    fn fail_command(&mut self, unit: usize, err: SimError) -> Vec<ControllerFn> {
        match err {
            SimError::Unattached | SimError::WriteProtected => {
                self.status.command_rejected = true;
            }
            _ => {
                self.status.data_error = true;
            }
        }
        self.units[unit].phase = Phase::Error;
        self.finish_command(unit);
        vec![ControllerFn::Scpe(err)]
    }

    // -- backend adapter ------------------------------------------------------

    fn delay_table(&self, unit: usize) -> DelayTable {
        DelayTable::active(
            self.config.timing,
            self.config.controller_type,
            self.units[unit].config.density,
        )
    }

    fn backend_call(&mut self, unit: usize, kind: CallKind) -> Result<(Outcome, u32), SimError> {
        let before = self.units[unit].position;
        let outcome = {
            let drive = &mut self.units[unit];
            let image = drive.image.as_mut().ok_or(SimError::Unattached)?;
            let result = match kind {
                CallKind::SpaceForward => image.space_forward(),
                CallKind::SpaceReverse => image.space_reverse(),
                CallKind::ReadForward => image.read_forward(),
                CallKind::ReadReverse => image.read_reverse(),
                CallKind::Rewind => image.rewind(),
                CallKind::WriteRecord | CallKind::WriteGap | CallKind::WriteTapeMark => {
                    unreachable!("write calls go through write_backend")
                }
            };
            result.map_err(|e: BackendError| SimError::from(&e))?
        };
        let after = self.units[unit]
            .image
            .as_ref()
            .expect("checked above")
            .position();
        self.units[unit].position = after;
        Ok((outcome.clone(), gap_length(before, after, kind, &outcome)))
    }

    fn write_backend<F>(&mut self, unit: usize, f: F) -> Result<Outcome, SimError>
    where
        F: FnOnce(&mut B) -> Result<Outcome, BackendError>,
    {
        let drive = &mut self.units[unit];
        let image = drive.image.as_mut().ok_or(SimError::Unattached)?;
        let outcome = f(image).map_err(|e| SimError::from(&e))?;
        drive.position = image.position();
        Ok(outcome)
    }
}

/// Degrades `Write_Record_without_Parity` to something the image format can
/// actually represent: the image has no per-byte parity channel, so a
/// simulated parity dropout is modelled by dropping null bytes from the
/// record (what a real drive would see as "no flux transition, no bit") and
/// flagging the record bad if any surviving byte looks even-parity (the
/// condition the diagnostic command is meant to provoke). See DESIGN.md.
fn degrade_without_parity(data: &[u8]) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(data.len());
    let mut bad = false;
    for &byte in data {
        if byte == 0 {
            continue;
        }
        if byte.count_ones() % 2 == 0 {
            bad = true;
        }
        out.push(byte);
    }
    (out, bad)
}

/// Inches of tape implied by a byte position at the given density, used to
/// size the rewind traverse delay.
fn bytes_to_inches(position: u64, density: Density) -> u32 {
    let bpi = match density {
        Density::Nrzi800 => 800u64,
        Density::Pe1600 => 1600u64,
    };
    (position / bpi) as u32
}

/// The backend adapter's gap-length computation: the raw position
/// delta, minus the framed record length for calls that carry a data record.
fn gap_length(before: u64, after: u64, kind: CallKind, outcome: &Outcome) -> u32 {
    let delta = after.abs_diff(before);
    if !kind.produces_data() {
        return delta as u32;
    }
    let record_len = match outcome {
        Outcome::Record { record_len, .. } | Outcome::BadRecord { record_len, .. } => *record_len,
        _ => 0,
    };
    let aligned = record_len + (record_len & 1);
    let framed = aligned as u64 + 2 * MARKER_SIZE as u64;
    delta.saturating_sub(framed) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{ControllerType, Density, DriveModel};
    use crate::opcode::decode_control_word;

    fn controller() -> Controller<MemoryBackend> {
        let config = ControllerConfig::new(ControllerType::Hp3000);
        Controller::new(config).unwrap()
    }

    fn select_unit_word(unit: u8) -> u16 {
        (4u16 << 12) | ((unit as u16) << 6)
    }

    fn read_word() -> u16 {
        5u16 << 12
    }

    fn write_word() -> u16 {
        9u16 << 12
    }

    fn write_without_parity_word() -> u16 {
        10u16 << 12
    }

    #[test]
    fn select_unit_completes_immediately() {
        let mut ctl = controller();
        let funcs = ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            select_unit_word(2),
        );
        assert_eq!(ctl.unit_selected(), 2);
        assert!(funcs.contains(&ControllerFn::Ifgtc(Classification::Control)));
        assert!(funcs.contains(&ControllerFn::Rqsrv));
    }

    #[test]
    fn unready_drive_rejects_and_schedules_interrupt() {
        let mut ctl = controller();
        let funcs = ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            read_word(),
        );
        assert!(funcs.is_empty());
        assert!(ctl.status.command_rejected);
        assert!(ctl.scheduler.is_pending(CONTROLLER_UNIT));
    }

    #[test]
    fn write_protected_drive_rejects_write() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::write_protected(true), true).unwrap();
        let funcs = ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            write_word(),
        );
        assert!(funcs.is_empty());
        assert!(ctl.status.command_rejected);
    }

    #[test]
    fn write_then_read_round_trips_through_the_buffer() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::new(), false).unwrap();

        // Write_Record: accepted, Wait phase until the shim starts the
        // channel transfer.
        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            write_word(),
        );
        assert_eq!(ctl.units[0].phase, Phase::Wait);

        ctl.begin_transfer_cycle(0);
        assert_eq!(ctl.units[0].phase, Phase::Data);

        assert!(ctl.accept_write_word(0, 0x4142));
        assert!(ctl.accept_write_word(0, 0x4300));

        let funcs = ctl.end_transfer(
            0,
            HostFlags {
                eod: true,
                ..Default::default()
            },
        );
        assert!(funcs.contains(&ControllerFn::Dvend));
        assert_eq!(ctl.units[0].phase, Phase::Stop);

        // Advance past the Stop delay; continue_stop flushes to the backend.
        let fired = ctl.scheduler.advance(10_000);
        assert!(fired.contains(&0));
        let funcs = ctl.continue_command(0, HostFlags::default(), 0);
        assert!(funcs.contains(&ControllerFn::Stint));
        assert_eq!(ctl.units[0].phase, Phase::Idle);

        // Now read it back.
        ctl.units[0].position = 0;
        ctl.units[0].image.as_mut().unwrap().rewind().unwrap();
        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            read_word(),
        );
        let funcs = ctl.begin_transfer_cycle(0);
        assert!(funcs.is_empty());
        assert_eq!(ctl.units[0].phase, Phase::Data);
        assert_eq!(ctl.next_read_word(0), Some(0x4142));
        assert_eq!(ctl.next_read_word(0), Some(0x4300));
    }

    #[test]
    fn rewind_runs_without_holding_the_controller_busy() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::new(), false).unwrap();
        ctl.units[0].position = 800; // off load point

        let funcs = ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            15u16 << 12,
        );
        assert!(funcs.contains(&ControllerFn::Ifgtc(Classification::Rewind)));
        assert!(matches!(ctl.state, ControllerState::Idle));
        assert!(ctl.units[0].rewinding);

        ctl.scheduler.advance(100_000);
        let funcs = ctl.continue_command(0, HostFlags::default(), 0);
        assert!(funcs.is_empty()); // Start -> Stop, no function yet

        ctl.scheduler.advance(100_000);
        let funcs = ctl.continue_command(0, HostFlags::default(), 0);
        assert_eq!(funcs, vec![ControllerFn::Dattn(0)]);
        assert!(!ctl.units[0].rewinding);
    }

    #[test]
    fn clear_controller_aborts_busy_unit_and_resets_status() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::new(), false).unwrap();
        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            read_word(),
        );
        assert!(matches!(ctl.state, ControllerState::Busy));

        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            0, // Clear_Controller
        );
        assert!(matches!(ctl.state, ControllerState::Idle));
        assert_eq!(ctl.units[0].phase, Phase::Idle);
    }

    #[test]
    fn poll_drives_picks_lowest_numbered_attention_bit() {
        let mut ctl = controller();
        ctl.unit_attention = 0b0110;
        let funcs = ctl.poll_drives();
        assert_eq!(funcs, vec![ControllerFn::Dattn(1)]);
        assert_eq!(ctl.unit_attention, 0b0100);
    }

    #[test]
    fn advance_delivers_due_events_through_step() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::new(), false).unwrap();
        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            write_word(),
        );
        ctl.begin_transfer_cycle(0);
        ctl.accept_write_word(0, 0x4142);
        ctl.end_transfer(
            0,
            HostFlags {
                eod: true,
                ..Default::default()
            },
        );
        assert_eq!(ctl.units[0].phase, Phase::Stop);

        let ticks = ctl.ticks_until_next_event().unwrap();
        let funcs = ctl.advance(ticks, HostFlags::default(), 0);
        assert!(funcs.contains(&ControllerFn::Stint));
        assert_eq!(ctl.units[0].phase, Phase::Idle);
    }

    #[test]
    fn decode_and_accept_clear_controller() {
        let decoded = decode_control_word(0);
        assert_eq!(decoded.opcode, Opcode::ClearController);
    }

    #[test]
    fn plain_read_record_delivers_crcc_trailer_as_an_unsolicited_extra_word() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::new(), false).unwrap();
        ctl.units[0]
            .image
            .as_mut()
            .unwrap()
            .write_record(&[1, 2, 3, 4], false)
            .unwrap();
        ctl.units[0].image.as_mut().unwrap().rewind().unwrap();
        ctl.units[0].position = 0;

        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            read_word(),
        );
        ctl.begin_transfer_cycle(0);
        assert_eq!(ctl.next_read_word(0), Some(0x0102));
        assert_eq!(ctl.next_read_word(0), Some(0x0304));

        ctl.end_transfer(
            0,
            HostFlags {
                eod: true,
                ..Default::default()
            },
        );
        ctl.scheduler.advance(10_000);
        let funcs = ctl.continue_command(0, HostFlags::default(), 0);
        assert!(matches!(funcs[0], ControllerFn::Ifin(_)));
        assert!(funcs.contains(&ControllerFn::Stint));
    }

    #[test]
    fn write_without_parity_drops_null_bytes_and_flags_even_parity_bad() {
        let mut ctl = controller();
        ctl.attach(0, MemoryBackend::new(), false).unwrap();

        ctl.step(
            None,
            HostFlags {
                cmrdy: true,
                cmxeq: true,
                ..Default::default()
            },
            write_without_parity_word(),
        );
        ctl.begin_transfer_cycle(0);
        // 0x00 bytes are dropped; 0x01 (odd parity) survives untouched;
        // 0x03 (two set bits, even parity) flags the record bad.
        ctl.accept_write_word(0, 0x0100);
        ctl.accept_write_word(0, 0x0300);
        ctl.end_transfer(
            0,
            HostFlags {
                eod: true,
                ..Default::default()
            },
        );
        ctl.scheduler.advance(10_000);
        ctl.continue_command(0, HostFlags::default(), 0);

        ctl.units[0].position = 0;
        ctl.units[0].image.as_mut().unwrap().rewind().unwrap();
        let outcome = ctl.units[0].image.as_mut().unwrap().read_forward().unwrap();
        match outcome {
            Outcome::BadRecord { data, .. } => assert_eq!(data, vec![0x01, 0x03]),
            other => panic!("expected a bad record, got {other:?}"),
        }
    }
}
