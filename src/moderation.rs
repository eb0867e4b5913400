/*!
# Interrupt Moderation

Two wake sources feed one deferred run: the backend's event channel
interrupt and the deadline timer. Both go through a single pending slot:

- an interrupt wake replaces a pending timer wake,
- a timer wake is dropped if anything is already pending,
- whoever moves the slot away from empty has to queue the run.

So a run is never queued twice, and a run started by an interrupt is never
mistaken for a timer run.

Between runs the frontend asks the backend to hold off notifying until
`threshold` responses are published. The threshold follows an EWMA of the
pages consumed per run and is reset whenever the deadline timer had to step in.
*/

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const WAKE_NONE: u8 = 0;
const WAKE_INTERRUPT: u8 = 1;
const WAKE_TIMER: u8 = 2;

/// Fixed-point scale of the EWMA.
const EWMA_SCALE: u32 = 128;

/// What woke the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    Interrupt,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedState {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug, Default)]
pub(crate) struct WakeSlot {
    pending: AtomicU8,
    running: AtomicBool,
}

impl WakeSlot {
    /// Returns `true` if the caller must queue a run.
    pub(crate) fn wake_interrupt(&self) -> bool {
        match self.pending.swap(WAKE_INTERRUPT, Ordering::AcqRel) {
            WAKE_NONE => true,
            WAKE_TIMER => {
                log::trace!("interrupt replaces pending timer wake");
                false
            }
            _ => false,
        }
    }

    /// Returns `true` if the caller must queue a run.
    ///
    /// Any pending wake supersedes the timer, with or without interrupt
    /// moderation. Without moderation the deadline is only armed for a
    /// stalled split, and the pending run resumes that split anyway.
    pub(crate) fn wake_timer(&self) -> bool {
        self.pending
            .compare_exchange(WAKE_NONE, WAKE_TIMER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the pending wake for a run that is starting now.
    pub(crate) fn begin(&self) -> Option<WakeSource> {
        let source = match self.pending.swap(WAKE_NONE, Ordering::AcqRel) {
            WAKE_INTERRUPT => WakeSource::Interrupt,
            WAKE_TIMER => WakeSource::Timer,
            _ => return None,
        };
        self.running.store(true, Ordering::Release);
        Some(source)
    }

    pub(crate) fn end(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn state(&self) -> SchedState {
        if self.running.load(Ordering::Acquire) {
            SchedState::Running
        } else if self.pending.load(Ordering::Acquire) != WAKE_NONE {
            SchedState::Scheduled
        } else {
            SchedState::Idle
        }
    }
}

/// Average pages consumed per run, scaled by 128.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Ewma {
    avg: u32,
}

impl Ewma {
    pub(crate) fn sample(&mut self, pages: u32) {
        if pages > 0 {
            self.avg = (self.avg * 7 + pages * EWMA_SCALE) / 8;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.avg = 0;
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> u32 {
        self.avg
    }

    /// Responses to wait for before the next notification.
    pub(crate) fn threshold(&self, cap: u32) -> u32 {
        (self.avg * 3 / 4 / EWMA_SCALE).clamp(1, cap.max(1))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interrupt_replaces_timer() {
        let slot = WakeSlot::default();
        assert_eq!(slot.state(), SchedState::Idle);
        assert!(slot.wake_timer());
        assert_eq!(slot.state(), SchedState::Scheduled);
        // already queued by the timer
        assert!(!slot.wake_interrupt());
        assert_eq!(slot.begin(), Some(WakeSource::Interrupt));
        assert_eq!(slot.state(), SchedState::Running);
        slot.end();
        assert_eq!(slot.begin(), None);
    }

    #[test]
    fn timer_superseded_by_pending_wake() {
        let slot = WakeSlot::default();
        assert!(slot.wake_interrupt());
        assert!(!slot.wake_timer());
        assert!(!slot.wake_interrupt());
        assert_eq!(slot.begin(), Some(WakeSource::Interrupt));
        // a wake during the run queues the next one
        assert!(slot.wake_timer());
        slot.end();
        assert_eq!(slot.state(), SchedState::Scheduled);
        assert_eq!(slot.begin(), Some(WakeSource::Timer));
    }

    #[test]
    fn ewma_threshold() {
        let mut ewma = Ewma::default();
        assert_eq!(ewma.threshold(128), 1);
        ewma.sample(0);
        assert_eq!(ewma.value(), 0);
        ewma.sample(64);
        assert_eq!(ewma.value(), 64 * 128 / 8);
        for _ in 0..100 {
            ewma.sample(64);
        }
        // converges to 64 pages, 3/4 of which is 48
        assert!((46..=48).contains(&ewma.threshold(128)), "{}", ewma.threshold(128));
        assert_eq!(ewma.threshold(16), 16);
        ewma.reset();
        assert_eq!(ewma.threshold(128), 1);
    }
}
