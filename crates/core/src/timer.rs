//! Queue-backed timers.
//!
//! A timer does not call into the state machine; when it fires it enqueues
//! its event onto the owning manager's queue, so expiry is processed with
//! the same single-writer discipline as every other event.

use crate::{Event, EventSender};
use crossbeam::channel::{unbounded, Receiver as ChannelReceiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A resettable one-shot timer delivering an [`Event`] on expiry.
pub trait Timer: Send {
    /// Arm the timer, replacing any pending deadline.
    fn reset(&mut self, after: Duration, event: Event);

    /// Arm the timer only if no deadline is already pending.
    fn soft_reset(&mut self, after: Duration, event: Event);

    /// Disarm the timer without firing.
    fn stop(&mut self);

    /// Permanently shut the timer down.
    fn halt(&mut self);
}

/// Creates timers bound to some event destination.
pub trait TimerFactory {
    /// Create a stopped timer.
    fn create_timer(&self) -> Box<dyn Timer>;
}

enum TimerCmd {
    Reset { after: Duration, event: Event },
    SoftReset { after: Duration, event: Event },
    Stop,
    Halt,
}

/// Timer that fires into a manager's event queue from its own thread.
pub struct QueueTimer {
    cmd_tx: Sender<TimerCmd>,
    handle: Option<JoinHandle<()>>,
}

impl QueueTimer {
    fn new(events_tx: EventSender) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let handle = std::thread::spawn(move || run_timer(cmd_rx, events_tx));
        Self {
            cmd_tx,
            handle: Some(handle),
        }
    }
}

impl Timer for QueueTimer {
    fn reset(&mut self, after: Duration, event: Event) {
        let _ = self.cmd_tx.send(TimerCmd::Reset { after, event });
    }

    fn soft_reset(&mut self, after: Duration, event: Event) {
        let _ = self.cmd_tx.send(TimerCmd::SoftReset { after, event });
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(TimerCmd::Stop);
    }

    fn halt(&mut self) {
        let _ = self.cmd_tx.send(TimerCmd::Halt);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QueueTimer {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_timer(cmd_rx: ChannelReceiver<TimerCmd>, events_tx: EventSender) {
    let mut pending: Option<(Instant, Event)> = None;
    loop {
        let cmd = match &pending {
            Some((deadline, _)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match cmd_rx.recv_timeout(remaining) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some((_, event)) = pending.take() {
                            let _ = events_tx.send(event);
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match cmd_rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            },
        };

        match cmd {
            TimerCmd::Reset { after, event } => {
                pending = Some((Instant::now() + after, event));
            }
            TimerCmd::SoftReset { after, event } => {
                if pending.is_none() {
                    pending = Some((Instant::now() + after, event));
                }
            }
            TimerCmd::Stop => pending = None,
            TimerCmd::Halt => return,
        }
    }
}

/// Factory for [`QueueTimer`]s bound to one manager's queue.
#[derive(Clone)]
pub struct QueueTimerFactory {
    events_tx: EventSender,
}

impl QueueTimerFactory {
    pub(crate) fn new(events_tx: EventSender) -> Self {
        Self { events_tx }
    }
}

impl TimerFactory for QueueTimerFactory {
    fn create_timer(&self) -> Box<dyn Timer> {
        Box::new(QueueTimer::new(self.events_tx.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timer_fires_once() {
        let (tx, rx) = unbounded();
        let factory = QueueTimerFactory::new(tx);
        let mut timer = factory.create_timer();

        timer.reset(Duration::from_millis(10), Event::BatchTimeout);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::BatchTimeout
        );
        // One-shot: nothing further arrives.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_stop_disarms() {
        let (tx, rx) = unbounded();
        let factory = QueueTimerFactory::new(tx);
        let mut timer = factory.create_timer();

        timer.reset(Duration::from_millis(50), Event::RequestTimeout);
        timer.stop();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_soft_reset_keeps_existing_deadline() {
        let (tx, rx) = unbounded();
        let factory = QueueTimerFactory::new(tx);
        let mut timer = factory.create_timer();

        timer.reset(Duration::from_millis(10), Event::RequestTimeout);
        // Armed, so the soft reset with a long deadline must not displace it.
        timer.soft_reset(Duration::from_secs(60), Event::BatchTimeout);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::RequestTimeout
        );
    }
}
