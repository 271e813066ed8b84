//! Event scheduler: each of the four drives (plus one pseudo-unit used for
//! the HP3000 command-reject interrupt delay) has at most one pending timed
//! event, matching the `wait` field on [`crate::drive::DriveUnit`] ("next
//! scheduled event delay in abstract ticks, sentinel = not scheduled"). This
//! is the explicit, inspectable analogue of the event queue pattern used by
//! timed peripherals elsewhere, generalized to carry unit indices instead of
//! reaching into global unit tables.

/// Index of the pseudo-unit used to schedule the HP3000 command-reject
/// interrupt without consuming a real drive's `wait` slot.
pub const CONTROLLER_UNIT: usize = 4;

const SLOTS: usize = 5;

/// A logical clock plus one optional due-tick per unit slot.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    now: u64,
    due: [Option<u64>; SLOTS],
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            now: 0,
            due: [None; SLOTS],
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedules `unit`'s event `delay_ticks` from now, overwriting any
    /// previously pending event for that unit (a unit only ever has one
    /// outstanding event per the data model).
    pub fn schedule(&mut self, unit: usize, delay_ticks: u32) {
        self.due[unit] = Some(self.now + delay_ticks as u64);
    }

    /// Cancels `unit`'s pending event, if any.
    pub fn cancel(&mut self, unit: usize) {
        self.due[unit] = None;
    }

    pub fn is_pending(&self, unit: usize) -> bool {
        self.due[unit].is_some()
    }

    /// The soonest due tick across every pending event, if any. Lets a
    /// caller driving simulated time jump straight to the next event instead
    /// of single-stepping the clock.
    pub fn next_due(&self) -> Option<u64> {
        self.due.iter().flatten().min().copied()
    }

    /// Ticks remaining until `unit`'s event, or `None` if nothing is
    /// scheduled. Used to interpolate tape position on controller clear.
    pub fn remaining(&self, unit: usize) -> Option<u32> {
        self.due[unit].map(|t| t.saturating_sub(self.now) as u32)
    }

    /// Advances the clock by `ticks` and returns every unit whose event is
    /// now due, ordered by (due tick, unit index ascending) per the
    /// ordering guarantees above.
    pub fn advance(&mut self, ticks: u64) -> Vec<usize> {
        self.now += ticks;

        let mut fired: Vec<(u64, usize)> = self
            .due
            .iter()
            .enumerate()
            .filter_map(|(unit, due)| due.filter(|&t| t <= self.now).map(|t| (t, unit)))
            .collect();
        fired.sort_unstable();

        for &(_, unit) in &fired {
            self.due[unit] = None;
        }

        fired.into_iter().map(|(_, unit)| unit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_tick_then_unit_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(2, 10);
        scheduler.schedule(0, 5);
        scheduler.schedule(1, 5);

        let fired = scheduler.advance(10);
        assert_eq!(fired, vec![0, 1, 2]);
    }

    #[test]
    fn cancel_removes_pending_event() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(1, 5);
        scheduler.cancel(1);
        assert!(!scheduler.is_pending(1));
        assert!(scheduler.advance(100).is_empty());
    }

    #[test]
    fn rescheduling_overwrites_previous_event() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(0, 5);
        scheduler.schedule(0, 20);
        assert!(scheduler.advance(10).is_empty());
        assert_eq!(scheduler.advance(15), vec![0]);
    }

    #[test]
    fn next_due_reports_the_soonest_pending_event() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(2, 30);
        scheduler.schedule(0, 10);
        assert_eq!(scheduler.next_due(), Some(10));
    }

    #[test]
    fn next_due_is_none_when_nothing_pending() {
        assert_eq!(Scheduler::new().next_due(), None);
    }

    #[test]
    fn controller_pseudo_unit_is_a_distinct_slot() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(CONTROLLER_UNIT, 1);
        scheduler.schedule(0, 1);
        let fired = scheduler.advance(1);
        assert_eq!(fired, vec![0, CONTROLLER_UNIT]);
    }
}
