//! End-to-end scenarios against [`Hp3000Shim`], driven purely through the
//! channel signal entry points a real SIO microcode routine would call.

use hp_tapelib::backend::MemoryBackend;
use hp_tapelib::config::{ControllerConfig, ControllerType};
use hp_tapelib::controller::Controller;
use hp_tapelib::drive::Phase;
use hp_tapelib::shim::{HostSignal, Hp3000Shim};

fn shim() -> Hp3000Shim<MemoryBackend> {
    let controller = Controller::new(ControllerConfig::new(ControllerType::Hp3000)).unwrap();
    Hp3000Shim::new(controller, 0)
}

fn select_word(unit: u16) -> u16 {
    (4u16 << 12) | (unit << 6)
}

fn write_word() -> u16 {
    9u16 << 12
}

fn read_word() -> u16 {
    5u16 << 12
}

fn rewind_word(unit: u16) -> u16 {
    (15u16 << 12) | (unit << 6)
}

fn drain(shim: &mut Hp3000Shim<MemoryBackend>) {
    while let Some(ticks) = shim.ticks_until_next_event() {
        shim.advance(ticks.max(1) as u64);
    }
}

#[test]
fn write_then_read_round_trip_through_channel_signals() {
    let mut shim = shim();
    shim.controller_mut().attach(0, MemoryBackend::new(), false).unwrap();

    shim.pcontstb(select_word(0));
    shim.pcontstb(write_word());
    shim.toggleoutxfer();
    shim.pwritestb(0x4142);
    shim.pwritestb(0x4344);
    shim.end_transfer(true, false);
    drain(&mut shim);
    assert_eq!(shim.controller().unit(0).phase, Phase::Idle);

    shim.pcontstb(rewind_word(0));
    drain(&mut shim);
    assert!(!shim.controller().unit(0).rewinding);

    shim.pcontstb(select_word(0));
    shim.pcontstb(read_word());
    shim.toggleinxfer();
    drain(&mut shim);

    assert_eq!(shim.preadstb(), vec![HostSignal::Data(0x4142)]);
    assert_eq!(shim.preadstb(), vec![HostSignal::Data(0x4344)]);
}

#[test]
fn master_reset_mid_write_returns_the_drive_to_idle() {
    let mut shim = shim();
    shim.controller_mut().attach(0, MemoryBackend::new(), false).unwrap();

    shim.pcontstb(select_word(0));
    shim.pcontstb(write_word());
    shim.toggleoutxfer();
    shim.pwritestb(0x4142);
    assert_eq!(shim.controller().unit(0).phase, Phase::Data);

    shim.dcontstb(0x1); // master reset, mid-transfer
    assert_eq!(shim.controller().unit(0).phase, Phase::Idle);

    // The channel is free to start a fresh command right away.
    let funcs = shim.pcontstb(select_word(0));
    assert!(funcs.iter().any(|s| matches!(s, HostSignal::Sr(_))));
}

#[test]
fn attention_interrupt_is_delivered_through_poll_and_intpollin() {
    let mut shim = shim();
    shim.controller_mut().attach(0, MemoryBackend::new(), false).unwrap();
    shim.dsetmask(true);

    shim.togglesiook(); // sio_busy false -> true, no dispatch yet
    let signals = shim.togglesiook(); // true -> false, dispatches the drive-attention poll
    assert!(signals.iter().any(|s| matches!(s, HostSignal::Intreq)));

    assert_eq!(
        shim.intpollin(),
        vec![HostSignal::Intack(0), HostSignal::Data(0)]
    );
}

#[test]
fn read_on_an_unattached_drive_is_rejected_not_hung() {
    let mut shim = shim();

    let funcs = shim.pcontstb(select_word(0));
    assert!(funcs.iter().any(|s| matches!(s, HostSignal::Sr(_))));

    let funcs = shim.pcontstb(read_word());
    assert!(funcs.is_empty()); // not ready: rejected, no Sr

    drain(&mut shim);
    assert!(shim.statstb() != HostSignal::Sr(0)); // sanity: status is a Data signal
}
