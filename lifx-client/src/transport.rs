use lifx_core::{BuildOptions, Message, RawMessage};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

/// A subscriber predicate: return `true` to receive a given packet.
pub type Predicate = Box<dyn Fn(&RawMessage) -> bool + Send + Sync>;
/// A subscriber handler, invoked with the sender's address and the decoded packet.
pub type Handler = Box<dyn Fn(SocketAddr, &RawMessage) + Send + Sync>;

/// An opaque handle returned by [Transport::register_packet_handler], used to
/// [deregister][Transport::deregister] a subscriber later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(usize);

struct Subscription {
    predicate: Predicate,
    handler: Handler,
}

/// Owns a single UDP socket bound to a configurable address with broadcast enabled, a
/// dedicated receive-loop worker, and an ordered registry of filtered subscribers.
///
/// No parsing or session logic lives here: this is the multiplexer described by the
/// component design's "Transport" responsibility, nothing more.
pub struct Transport {
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
    subscribers: Mutex<Vec<Option<Arc<Subscription>>>>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, broadcast_addr: SocketAddr) -> io::Result<Arc<Transport>> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_broadcast(true)?;
        Ok(Arc::new(Transport {
            socket,
            broadcast_addr,
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    /// Registers a subscriber and returns an opaque token for later [deregister][Self::deregister].
    ///
    /// `predicate` of `None` means accept-all. Subscribers are dispatched in registration order.
    pub fn register_packet_handler(
        &self,
        predicate: Option<Predicate>,
        handler: Handler,
    ) -> SubscriptionToken {
        let predicate = predicate.unwrap_or_else(|| Box::new(|_: &RawMessage| true));
        let sub = Arc::new(Subscription { predicate, handler });

        let mut subs = self.subscribers.lock().unwrap();
        let idx = subs.len();
        subs.push(Some(sub));
        SubscriptionToken(idx)
    }

    /// Removes a previously registered subscriber. A no-op if already removed.
    pub fn deregister(&self, token: SubscriptionToken) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(slot) = subs.get_mut(token.0) {
            *slot = None;
        }
    }

    /// Encodes `raw` via the codec and sends it to `addr`.
    pub fn send_packet(&self, addr: SocketAddr, raw: &RawMessage) -> Result<(), lifx_core::Error> {
        let bytes = raw.pack()?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    /// Sends a tagged `GetService` packet to the configured broadcast address.
    pub fn send_discovery(&self, source: u32, sequence: u8) -> Result<(), lifx_core::Error> {
        let options = BuildOptions {
            target: None,
            ack_required: false,
            res_required: true,
            sequence,
            source,
        };
        let raw = RawMessage::build(&options, Message::GetService)?;
        self.send_packet(self.broadcast_addr, &raw)
    }

    /// Spawns the dedicated receive-loop worker as a daemon thread.
    ///
    /// The thread is never joined; it runs until the process exits, matching the rest of
    /// this crate's daemonic-worker model (see [crate::client::Client]).
    pub fn spawn_receive_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        thread::spawn(move || this.receive_loop());
    }

    fn receive_loop(&self) {
        let mut buf = [0u8; 1500];
        loop {
            let (n, addr) = match self.socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "receive loop: recv_from failed");
                    continue;
                }
            };
            if n == 0 {
                continue;
            }
            let raw = match RawMessage::unpack(&buf[..n]) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::trace!(error = %e, %addr, "dropping malformed packet");
                    continue;
                }
            };
            self.dispatch(addr, &raw);
        }
    }

    /// Fans `raw` out to every subscriber whose predicate accepts it.
    ///
    /// Subscribers are snapshotted (an `Arc` clone per entry, not the boxed closures
    /// themselves) before any handler runs, so a handler that registers or deregisters a
    /// subscriber — as the [Client][crate::client::Client]'s own `StateService` subscriber
    /// does — cannot deadlock on `subscribers`. A handler that panics is caught and logged;
    /// it does not stop the loop or skip the remaining subscribers.
    fn dispatch(&self, addr: SocketAddr, raw: &RawMessage) {
        let snapshot: Vec<Arc<Subscription>> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter().flatten().cloned().collect()
        };

        for sub in snapshot {
            if !(sub.predicate)(raw) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(addr, raw)));
            if outcome.is_err() {
                tracing::warn!(%addr, typ = raw.protocol_header.typ, "packet handler panicked; isolating and continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn local_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn a_packet_whose_size_field_is_wrong_never_reaches_a_subscriber() {
        // receive_loop only ever calls dispatch() with the result of a successful
        // RawMessage::unpack; a packet with a mismatched size field fails to unpack at all,
        // so it can never reach a subscriber regardless of predicate.
        let raw = RawMessage::build(&BuildOptions::default(), Message::GetService).unwrap();
        let mut bytes = raw.pack().unwrap();
        bytes.push(0); // frame.size no longer matches the packet length
        assert!(RawMessage::unpack(&bytes).is_err());
    }

    #[test]
    fn a_panicking_handler_does_not_prevent_later_handlers_from_running() {
        let transport = Transport::new(local_addr(0), local_addr(56700)).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = Arc::clone(&seen);

        transport.register_packet_handler(None, Box::new(|_, _| panic!("boom")));
        transport.register_packet_handler(
            None,
            Box::new(move |_, _| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let raw = RawMessage::build(&BuildOptions::default(), Message::GetService).unwrap();
        let addr = local_addr(1);
        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        transport.dispatch(addr, &raw);
        panic::set_hook(prev_hook);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_handler_that_registers_a_new_subscriber_does_not_deadlock() {
        // Mirrors the Client's StateService subscriber, which registers a new per-device
        // subscriber from within its own handler. dispatch() must have released its lock
        // on `subscribers` before invoking any handler, or this would deadlock.
        let transport = Transport::new(local_addr(0), local_addr(56700)).unwrap();
        let transport = Arc::new(transport);
        let inner = Arc::clone(&transport);
        let registered = Arc::new(AtomicU32::new(0));
        let registered2 = Arc::clone(&registered);

        transport.register_packet_handler(
            None,
            Box::new(move |_, _| {
                let registered3 = Arc::clone(&registered2);
                inner.register_packet_handler(
                    None,
                    Box::new(move |_, _| {
                        registered3.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        let raw = RawMessage::build(&BuildOptions::default(), Message::GetService).unwrap();
        transport.dispatch(local_addr(2), &raw);
        // The newly registered subscriber didn't exist for this dispatch round, only the
        // registration itself needed to complete without deadlocking.
        assert_eq!(registered.load(Ordering::SeqCst), 0);

        transport.dispatch(local_addr(2), &raw);
        assert_eq!(registered.load(Ordering::SeqCst), 1);
    }
}
