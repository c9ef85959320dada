//! The event manager: one consumer thread serializing all state transitions.

use crate::timer::QueueTimerFactory;
use crate::{Event, Receiver};
use crossbeam::channel::{unbounded, Receiver as ChannelReceiver, Sender};
use crossbeam::select;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Write handle for enqueueing events onto a manager's queue.
///
/// Cheap to clone; any number of producers may enqueue concurrently. No
/// ordering is guaranteed between producers, but delivery to the receiver
/// is exactly the enqueue order of the manager's channel.
pub type EventSender = Sender<Event>;

/// Run a receiver's event chain to completion.
///
/// If processing an event returns a follow-up event, the follow-up is
/// processed immediately on the same thread, before anything else.
pub fn deliver_chain(receiver: &mut dyn Receiver, event: Event) {
    let mut next = Some(event);
    while let Some(e) = next {
        next = receiver.process_event(e);
    }
}

/// Serializes concurrent event submissions into a single ordered stream
/// delivered to one [`Receiver`] on a dedicated thread.
///
/// Usage: [`Manager::set_receiver`], then [`Manager::start`], then hand out
/// [`Manager::queue`] clones to producers. [`Manager::halt`] is cooperative
/// and idempotent; it lets the in-flight event chain finish, so state after
/// halt is always a fully-applied snapshot.
pub struct Manager {
    events_tx: EventSender,
    events_rx: Option<ChannelReceiver<Event>>,
    exit_tx: Sender<()>,
    exit_rx: Option<ChannelReceiver<()>>,
    receiver: Option<Box<dyn Receiver>>,
    handle: Option<JoinHandle<()>>,
    halted: bool,
}

impl Manager {
    /// Create a manager with an empty queue and no receiver.
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        Self {
            events_tx,
            events_rx: Some(events_rx),
            exit_tx,
            exit_rx: Some(exit_rx),
            receiver: None,
            handle: None,
            halted: false,
        }
    }

    /// Get a write handle to the event queue.
    pub fn queue(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Get a factory for timers that fire into this manager's queue.
    pub fn timer_factory(&self) -> QueueTimerFactory {
        QueueTimerFactory::new(self.events_tx.clone())
    }

    /// Set the destination for events. Must be called before [`Manager::start`].
    pub fn set_receiver(&mut self, receiver: Box<dyn Receiver>) {
        self.receiver = Some(receiver);
    }

    /// Spawn the consumer thread.
    pub fn start(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            error!("start called before set_receiver, event loop not started");
            return;
        };
        let Some(events_rx) = self.events_rx.take() else {
            warn!("event manager already started");
            return;
        };
        let exit_rx = self.exit_rx.take().unwrap_or_else(|| unbounded().1);

        self.handle = Some(std::thread::spawn(move || loop {
            select! {
                recv(events_rx) -> event => match event {
                    Ok(event) => deliver_chain(receiver.as_mut(), event),
                    Err(_) => break,
                },
                recv(exit_rx) -> _ => {
                    debug!("event loop told to exit");
                    break;
                }
            }
        }));
    }

    /// Stop the consumer thread after its current event chain completes.
    ///
    /// Idempotent: a second halt is a logged no-op.
    pub fn halt(&mut self) {
        if self.halted {
            warn!("attempted to halt an event manager twice");
            return;
        }
        self.halted = true;
        let _ = self.exit_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_messages::Message;
    use crossbeam::channel::{unbounded, Sender};
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Receiver that reports every processed payload and chains [1] -> [2].
    struct ChainingReceiver {
        seen: Sender<Vec<u8>>,
    }

    impl Receiver for ChainingReceiver {
        fn process_event(&mut self, event: Event) -> Option<Event> {
            let Event::Incoming(Message::ChainTransaction(payload)) = event else {
                return None;
            };
            let _ = self.seen.send(payload.clone());
            if payload == [1] {
                return Some(Event::Incoming(Message::ChainTransaction(vec![2])));
            }
            None
        }
    }

    fn tx_event(byte: u8) -> Event {
        Event::Incoming(Message::ChainTransaction(vec![byte]))
    }

    #[test]
    fn test_chained_event_precedes_queued_events() {
        let (seen_tx, seen_rx) = unbounded();
        let mut manager = Manager::new();
        manager.set_receiver(Box::new(ChainingReceiver { seen: seen_tx }));
        manager.start();

        let queue = manager.queue();
        // Event [1] synthesizes [2]; [3] is already queued behind it.
        queue.send(tx_event(1)).unwrap();
        queue.send(tx_event(3)).unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(seen_rx.recv_timeout(timeout).unwrap(), vec![1]);
        assert_eq!(seen_rx.recv_timeout(timeout).unwrap(), vec![2]);
        assert_eq!(seen_rx.recv_timeout(timeout).unwrap(), vec![3]);

        manager.halt();
    }

    #[test]
    #[traced_test]
    fn test_double_halt_warns_and_does_not_panic() {
        let (seen_tx, _seen_rx) = unbounded();
        let mut manager = Manager::new();
        manager.set_receiver(Box::new(ChainingReceiver { seen: seen_tx }));
        manager.start();

        manager.halt();
        manager.halt();

        assert!(logs_contain("attempted to halt an event manager twice"));
    }

    #[test]
    #[traced_test]
    fn test_start_without_receiver_is_refused() {
        let mut manager = Manager::new();
        manager.start();
        assert!(logs_contain("start called before set_receiver"));
        manager.halt();
    }
}
