//! HP3000 host interface shim.
//!
//! Translates the channel's fixed signal set into calls against
//! [`crate::controller::Controller`], and the controller's [`ControllerFn`]
//! output back into outbound host signals. This is the only thing in the
//! crate that knows the HP3000 channel protocol; the controller core has no
//! notion of SIO/CIO at all.

use log::{debug, trace};

use crate::backend::TapeBackend;
use crate::controller::{Classification, Controller, ControllerFn, HostFlags};
use crate::opcode::{self, CommandClass, Opcode};

/// Outbound host signals, plus the 16-bit data value that rides with
/// some of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Intack(u8),
    Intpollout,
    Intreq,
    Sr(u8),
    Devend,
    Jmpmet,
    Data(u16),
}

/// The shim's own latches: two-state flip-flops not modelled anywhere in the
/// controller core.
#[derive(Debug, Clone, Copy, Default)]
struct Latches {
    sio_busy: bool,
    channel_sr: bool,
    device_sr: bool,
    input_xfer: bool,
    output_xfer: bool,
    interrupt_mask: bool,
    interrupt_request: bool,
    interrupt_active: bool,
    unit_interrupt: bool,
    device_end: bool,
    xfer_error: bool,
}

/// The HP3000 host interface shim, owning one [`Controller`] plus the
/// latches, data register, and command classification the channel protocol
/// needs on top of it.
pub struct Hp3000Shim<B> {
    controller: Controller<B>,
    latches: Latches,
    data_buffer: u16,
    attention_unit: Option<u8>,
    command_class: Option<Classification>,
    device_number: u8,
}

impl<B: TapeBackend> Hp3000Shim<B> {
    pub fn new(controller: Controller<B>, device_number: u8) -> Self {
        Self {
            controller,
            latches: Latches::default(),
            data_buffer: 0,
            attention_unit: None,
            command_class: None,
            device_number,
        }
    }

    pub fn controller(&self) -> &Controller<B> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller<B> {
        &mut self.controller
    }

    fn host_flags(&self) -> HostFlags {
        HostFlags {
            intok: !self.latches.interrupt_request && !self.latches.sio_busy,
            cmrdy: false,
            cmxeq: false,
            dtrdy: false,
            eod: false,
            ovrun: false,
            xfrng: self.latches.xfer_error,
        }
    }

    /// Turns one batch of `ControllerFn`s into the outbound signals and
    /// latch updates they imply.
    fn absorb(&mut self, funcs: Vec<ControllerFn>) -> Vec<HostSignal> {
        let mut out = Vec::new();
        for func in funcs {
            match func {
                ControllerFn::Ifin(word) => {
                    self.data_buffer = word;
                    out.push(HostSignal::Data(word));
                }
                ControllerFn::Ifout => {}
                ControllerFn::Ifgtc(class) => {
                    self.command_class = Some(class);
                }
                ControllerFn::Rqsrv => {
                    self.latches.channel_sr = true;
                    out.push(HostSignal::Sr(self.device_number));
                }
                ControllerFn::Dvend => {
                    self.latches.device_end = true;
                    out.push(HostSignal::Devend);
                }
                ControllerFn::Stint => {
                    self.latches.interrupt_request = true;
                    if self.latches.interrupt_mask {
                        out.push(HostSignal::Intreq);
                    }
                }
                ControllerFn::Dattn(unit) => {
                    self.attention_unit = Some(unit);
                    self.latches.unit_interrupt = true;
                    self.latches.interrupt_request = true;
                    if self.latches.interrupt_mask {
                        out.push(HostSignal::Intreq);
                    }
                }
                ControllerFn::Scpe(err) => {
                    debug!("backend error surfaced to host: {err:?}");
                    self.latches.interrupt_request = true;
                    if self.latches.interrupt_mask {
                        out.push(HostSignal::Intreq);
                    }
                }
            }
        }
        out
    }

    // -- simulated-time clock, driven by the host -----------------------------

    /// Ticks remaining until the controller's next scheduled unit event, if
    /// any. The host's clock loop uses this to jump straight to the next
    /// interesting moment instead of single-stepping.
    pub fn ticks_until_next_event(&self) -> Option<u32> {
        self.controller.ticks_until_next_event()
    }

    /// Advances simulated time by `ticks`, delivering whatever unit events
    /// become due and turning the resulting `ControllerFn`s into outbound
    /// host signals.
    pub fn advance(&mut self, ticks: u64) -> Vec<HostSignal> {
        let flags = self.host_flags();
        let funcs = self.controller.advance(ticks, flags, 0);
        self.absorb(funcs)
    }

    // -- inbound signal handlers ---------------------------------------------

    pub fn intpollin(&mut self) -> Vec<HostSignal> {
        if self.latches.interrupt_request {
            self.latches.interrupt_request = false;
            self.latches.interrupt_active = true;
            vec![HostSignal::Intack(self.device_number), HostSignal::Data(self.device_number as u16 * 4)]
        } else {
            vec![HostSignal::Intpollout]
        }
    }

    pub fn setint(&mut self) -> Vec<HostSignal> {
        self.latches.interrupt_request = true;
        if self.latches.interrupt_mask {
            vec![HostSignal::Intreq]
        } else {
            Vec::new()
        }
    }

    pub fn dresetint(&mut self) -> Vec<HostSignal> {
        self.latches.interrupt_active = false;
        self.latches.unit_interrupt = false;
        let poll_on_reset = self.controller.config_poll_on_reset_interrupt();
        if poll_on_reset {
            let flags = self.host_flags();
            let funcs = self.controller.step(None, flags, 0);
            return self.absorb(funcs);
        }
        Vec::new()
    }

    pub fn dsetmask(&mut self, mask_set: bool) {
        self.latches.interrupt_mask = mask_set;
    }

    /// DCONTSTB: bit 0 master-reset, bit 1 reset-interrupt.
    pub fn dcontstb(&mut self, word: u16) -> Vec<HostSignal> {
        let mut out = Vec::new();
        if word & 0x1 != 0 {
            trace!("DCONTSTB master reset");
            self.controller.clear();
            self.latches = Latches::default();
            self.command_class = None;
            self.attention_unit = None;
        }
        if word & 0x2 != 0 {
            self.latches.interrupt_request = false;
        }
        out.extend(Vec::new());
        out
    }

    /// PSTATSTB/DSTATSTB: emit the merged status word.
    pub fn statstb(&mut self) -> HostSignal {
        let word = self
            .controller
            .status_word(self.latches.interrupt_request, !self.latches.sio_busy);
        HostSignal::Data(word.bits())
    }

    pub fn dstartio(&mut self) -> Vec<HostSignal> {
        self.latches.sio_busy = true;
        vec![HostSignal::Sr(self.device_number)]
    }

    pub fn acksr(&mut self) {
        self.latches.device_sr = false;
    }

    pub fn togglesr(&mut self) {
        self.latches.channel_sr = !self.latches.channel_sr;
    }

    pub fn togglesiook(&mut self) -> Vec<HostSignal> {
        self.latches.sio_busy = !self.latches.sio_busy;
        if !self.latches.sio_busy {
            let flags = self.host_flags();
            let funcs = self.controller.step(None, flags, 0);
            self.absorb(funcs)
        } else {
            Vec::new()
        }
    }

    /// TOGGLEINXFER: toggles `input_xfer`; a rising edge with a Read command
    /// queued starts the channel transfer cycle directly against the
    /// controller's Wait-phase unit (see `Controller::begin_transfer_cycle`).
    pub fn toggleinxfer(&mut self) -> Vec<HostSignal> {
        let rising = !self.latches.input_xfer;
        self.latches.input_xfer = true;

        if rising && matches!(self.command_class, Some(Classification::Read)) {
            let unit = self.controller.unit_selected() as usize;
            let funcs = self.controller.begin_transfer_cycle(unit);
            self.absorb(funcs)
        } else {
            self.latches.input_xfer = false;
            self.latches.device_end = false;
            Vec::new()
        }
    }

    pub fn toggleoutxfer(&mut self) -> Vec<HostSignal> {
        let rising = !self.latches.output_xfer;
        self.latches.output_xfer = true;

        if rising && matches!(self.command_class, Some(Classification::Write)) {
            let unit = self.controller.unit_selected() as usize;
            let funcs = self.controller.begin_transfer_cycle(unit);
            self.absorb(funcs)
        } else {
            self.latches.output_xfer = false;
            Vec::new()
        }
    }

    /// Falling-edge variant of TOGGLEINXFER/TOGGLEOUTXFER: ends the channel
    /// transfer cycle, optionally asserting EOD.
    pub fn end_transfer(&mut self, eod: bool, overrun: bool) -> Vec<HostSignal> {
        self.latches.input_xfer = false;
        self.latches.output_xfer = false;
        let unit = self.controller.unit_selected() as usize;
        let flags = HostFlags {
            eod,
            ovrun: overrun,
            ..self.host_flags()
        };
        let funcs = self.controller.end_transfer(unit, flags);
        self.absorb(funcs)
    }

    pub fn pcmd1(&mut self) {
        self.latches.device_sr = true;
    }

    /// PCONTSTB: decodes the control word, latches the opcode, and dispatches
    /// to the controller unless an interrupt is already pending.
    pub fn pcontstb(&mut self, word: u16) -> Vec<HostSignal> {
        self.data_buffer = word;
        self.latches.unit_interrupt = false;

        if self.latches.interrupt_request {
            return Vec::new();
        }

        let flags = HostFlags {
            cmrdy: true,
            cmxeq: true,
            ..self.host_flags()
        };
        let funcs = self.controller.step(None, flags, word);
        self.absorb(funcs)
    }

    /// READNEXTWD: if a device-end is pending at the start of a transfer, the
    /// controller rejects; otherwise the latch simply clears.
    pub fn readnextwd(&mut self, transfer_start: bool) -> Vec<HostSignal> {
        if self.latches.device_end && transfer_start {
            let flags = self.host_flags();
            let funcs = self.controller.step(None, flags, 0);
            self.absorb(funcs)
        } else {
            self.latches.device_end = false;
            Vec::new()
        }
    }

    pub fn preadstb(&mut self) -> Vec<HostSignal> {
        if self.latches.device_end {
            vec![HostSignal::Devend, HostSignal::Data(self.device_number as u16 * 4)]
        } else {
            let unit = self.controller.unit_selected() as usize;
            let word = self.controller.next_read_word(unit).unwrap_or(0);
            self.data_buffer = word;
            vec![HostSignal::Data(word)]
        }
    }

    pub fn pwritestb(&mut self, word: u16) {
        self.data_buffer = word;
        let unit = self.controller.unit_selected() as usize;
        self.controller.accept_write_word(unit, word);
    }

    pub fn devnodb(&self) -> HostSignal {
        HostSignal::Data(self.device_number as u16 * 4)
    }

    pub fn xfererror(&mut self) -> Vec<HostSignal> {
        self.latches.xfer_error = true;
        let flags = self.host_flags();
        let funcs = self.controller.step(None, flags, 0);
        let mut out = self.absorb(funcs);

        self.latches.input_xfer = false;
        self.latches.output_xfer = false;
        self.latches.interrupt_request = true;
        if self.latches.interrupt_mask {
            out.push(HostSignal::Intreq);
        }
        out
    }

    pub fn chanso(&self) -> Vec<HostSignal> {
        let mut out = Vec::new();
        if self.latches.channel_sr || self.latches.device_sr {
            out.push(HostSignal::Sr(self.device_number));
        }
        out.push(HostSignal::Jmpmet);
        out
    }

    /// Decodes a pending control word without side effects, for diagnostics.
    pub fn peek_opcode(&self) -> Opcode {
        opcode::decode_control_word(self.data_buffer).opcode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{ControllerConfig, ControllerType};

    fn shim() -> Hp3000Shim<MemoryBackend> {
        let controller = Controller::new(ControllerConfig::new(ControllerType::Hp3000)).unwrap();
        Hp3000Shim::new(controller, 0)
    }

    #[test]
    fn intpollin_without_pending_request_passes_through() {
        let mut shim = shim();
        assert_eq!(shim.intpollin(), vec![HostSignal::Intpollout]);
    }

    #[test]
    fn setint_raises_intreq_when_mask_set() {
        let mut shim = shim();
        shim.dsetmask(true);
        assert_eq!(shim.setint(), vec![HostSignal::Intreq]);
    }

    #[test]
    fn select_then_read_on_empty_tape_reports_eof() {
        let mut shim = shim();
        shim.controller.attach(0, MemoryBackend::new(), false).unwrap();

        shim.pcontstb((4u16 << 12) | (0u16 << 6)); // SelectUnit0
        let funcs = shim.pcontstb(5u16 << 12); // ReadRecord
        assert!(funcs.iter().any(|s| matches!(s, HostSignal::Sr(_))));

        shim.toggleinxfer();
        let status = shim.statstb();
        if let HostSignal::Data(bits) = status {
            assert_ne!(bits & (1 << 4), 0); // end-of-file bit set
        } else {
            panic!("expected status data");
        }
    }

    #[test]
    fn advance_runs_the_scheduled_stop_phase_through_to_completion() {
        let mut shim = shim();
        shim.controller.attach(0, MemoryBackend::new(), false).unwrap();

        shim.pcontstb((4u16 << 12) | (0u16 << 6)); // SelectUnit0
        shim.pcontstb(9u16 << 12); // WriteRecord
        shim.toggleoutxfer();
        shim.pwritestb(0x4142);
        shim.end_transfer(true, false);

        let ticks = shim.ticks_until_next_event().unwrap();
        shim.advance(ticks);
        assert!(shim.latches.interrupt_request);
        assert!(shim.ticks_until_next_event().is_none());
    }

    #[test]
    fn master_reset_clears_latches_and_controller() {
        let mut shim = shim();
        shim.latches.interrupt_request = true;
        shim.dcontstb(0x1);
        assert!(!shim.latches.interrupt_request);
    }
}
