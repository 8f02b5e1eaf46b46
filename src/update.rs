//! Update coalescer: folds every change notification raised between two
//! ticks into one global flush.
//!
//! Per-playlist change windows live on the playlists themselves
//! (`Playlist::accumulate_update`); this type tracks the global level, the
//! flush deadline the ticker thread sleeps towards, and the deduplicated
//! scan-complete flag.

use std::time::{Duration, Instant};

use crate::protocol::UpdateLevel;

/// What one flush publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Flush {
    pub(crate) level: Option<UpdateLevel>,
    pub(crate) scan_complete: bool,
}

impl Flush {
    pub(crate) fn is_empty(&self) -> bool {
        self.level.is_none() && !self.scan_complete
    }
}

#[derive(Debug)]
pub(crate) struct UpdateCoalescer {
    level: Option<UpdateLevel>,
    /// The pending flush was scheduled with the slower scan delay.
    delayed: bool,
    deadline: Option<Instant>,
    scan_complete_pending: bool,
    delay: Duration,
    scan_delay: Duration,
}

impl UpdateCoalescer {
    pub(crate) fn new(delay: Duration, scan_delay: Duration) -> Self {
        Self {
            level: None,
            delayed: false,
            deadline: None,
            scan_complete_pending: false,
            delay,
            scan_delay,
        }
    }

    pub(crate) fn set_delays(&mut self, delay: Duration, scan_delay: Duration) {
        self.delay = delay;
        self.scan_delay = scan_delay;
    }

    pub(crate) fn level(&self) -> Option<UpdateLevel> {
        self.level
    }

    /// Records a change. `delayable` is true for scan results arriving while
    /// their playlist is still scanning; those batch on the slower delay.
    /// Returns true when the flush deadline moved and the ticker must wake.
    pub(crate) fn queue(&mut self, level: UpdateLevel, delayable: bool) -> bool {
        let mut rescheduled = false;
        if delayable {
            if self.level.is_none() {
                self.deadline = Some(Instant::now() + self.scan_delay);
                self.delayed = true;
                rescheduled = true;
            }
        } else if self.level.is_none() || self.delayed {
            self.deadline = Some(Instant::now() + self.delay);
            self.delayed = false;
            rescheduled = true;
        }
        self.level = Some(self.level.map_or(level, |current| current.max(level)));
        rescheduled
    }

    /// Brings a delayed flush forward to now.
    fn hurry(&mut self) -> bool {
        if !self.delayed {
            return false;
        }
        self.deadline = Some(Instant::now());
        self.delayed = false;
        true
    }

    /// Arms the scan-complete notification. Repeated requests before the
    /// next flush collapse into one.
    pub(crate) fn queue_scan_complete(&mut self) -> bool {
        self.scan_complete_pending = true;
        let hurried = self.hurry();
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now());
            return true;
        }
        hurried
    }

    /// Time left until the pending flush; `None` when nothing is scheduled.
    pub(crate) fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub(crate) fn take(&mut self) -> Flush {
        let flush = Flush {
            level: self.level.take(),
            scan_complete: std::mem::take(&mut self.scan_complete_pending),
        };
        self.delayed = false;
        self.deadline = None;
        flush
    }

    /// Drops everything queued without publishing it.
    pub(crate) fn cancel(&mut self) {
        self.take();
    }
}
