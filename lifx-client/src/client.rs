use crate::device::{Device, DeviceInner};
use crate::error::Result;
use crate::group::{Group, GroupKind};
use crate::timer::RepeatTimer;
use crate::transport::Transport;
use lifx_core::{Message, RawMessage};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Construction-time configuration for a [Client]. `Default` matches the concrete values
/// named in the crate's component design, not the conflicting ranges mentioned elsewhere.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub bind_addr: SocketAddr,
    pub broadcast_addr: SocketAddr,
    pub discovery_interval: Duration,
    pub device_poll_interval: Duration,
    pub missed_polls: u32,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            broadcast_addr: "255.255.255.255:56700".parse().unwrap(),
            discovery_interval: Duration::from_secs(60),
            device_poll_interval: Duration::from_secs(5),
            missed_polls: 3,
        }
    }
}

/// Per-call override for a [Device] request primitive's timeout and retransmit count.
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub retransmits: u32,
}

impl Default for RequestOptions {
    fn default() -> RequestOptions {
        RequestOptions {
            timeout: Duration::from_secs(2),
            retransmits: 10,
        }
    }
}

pub(crate) struct ClientShared {
    transport: Arc<Transport>,
    source: u32,
    sequence: AtomicU8,
    options: ClientOptions,
    devices: Mutex<HashMap<u64, Arc<DeviceInner>>>,
    groups: Mutex<HashSet<[u8; 16]>>,
    locations: Mutex<HashSet<[u8; 16]>>,
}

impl ClientShared {
    pub(crate) fn source(&self) -> u32 {
        self.source
    }

    pub(crate) fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send_packet(&self, addr: SocketAddr, raw: &RawMessage) -> Result<()> {
        self.transport.send_packet(addr, raw)?;
        Ok(())
    }

    fn device_handle(self: &Arc<Self>, inner: Arc<DeviceInner>) -> Device {
        Device {
            inner,
            client: ClientHandle(Arc::clone(self)),
        }
    }

    /// Known devices seen within `max_seen`, sorted by id. Shared by [Client::devices] and
    /// [crate::group::Group::members], which resolves membership dynamically through this
    /// same registry rather than caching it.
    pub(crate) fn device_views(self: &Arc<Self>, max_seen: Duration) -> Vec<Device> {
        let registry = self.devices.lock().unwrap();
        let mut devices: Vec<Device> = registry
            .values()
            .filter(|inner| inner.seen_ago() < max_seen)
            .map(|inner| self.device_handle(Arc::clone(inner)))
            .collect();
        devices.sort_by_key(|d| d.id());
        devices
    }

    pub(crate) fn default_max_seen(&self) -> Duration {
        self.options.device_poll_interval * self.options.missed_polls
    }
}

/// A small cloneable handle back to the owning [Client]'s shared state, given to every
/// [Device] so it can allocate sequence numbers and send packets without holding a `Device`
/// (and so without forming an ownership cycle through the transport's subscriber closures,
/// which instead hold a `Weak<ClientShared>`).
#[derive(Clone)]
pub(crate) struct ClientHandle(Arc<ClientShared>);

impl ClientHandle {
    pub(crate) fn source(&self) -> u32 {
        self.0.source()
    }

    pub(crate) fn next_sequence(&self) -> u8 {
        self.0.next_sequence()
    }

    pub(crate) fn send_packet(&self, addr: SocketAddr, raw: &RawMessage) -> Result<()> {
        self.0.send_packet(addr, raw)
    }
}

/// Discovers and tracks LIFX bulbs on the local network and routes requests to them.
///
/// Owns the UDP transport, the device registry, and the discovery/poll repeating timers.
/// Construction registers the three inbound subscribers described in the crate's component
/// design, sends an immediate discovery broadcast, and starts both timers.
pub struct Client {
    shared: Arc<ClientShared>,
    _discovery_timer: RepeatTimer,
    _poll_timer: RepeatTimer,
}

impl Client {
    pub fn new(options: ClientOptions) -> Result<Client> {
        let transport = Transport::new(options.bind_addr, options.broadcast_addr)?;
        transport.spawn_receive_loop();

        let shared = Arc::new(ClientShared {
            transport,
            source: random_source(),
            sequence: AtomicU8::new(0),
            options,
            devices: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            locations: Mutex::new(HashSet::new()),
        });

        register_state_service_subscriber(&shared);
        register_state_group_subscriber(&shared);
        register_state_location_subscriber(&shared);

        let client = Client {
            shared: Arc::clone(&shared),
            _discovery_timer: start_discovery_timer(&shared),
            _poll_timer: start_poll_timer(&shared),
        };
        client.discover()?;
        Ok(client)
    }

    pub fn discover(&self) -> Result<()> {
        let sequence = self.shared.next_sequence();
        self.shared.transport.send_discovery(self.shared.source, sequence)?;
        Ok(())
    }

    /// Sends an unsolicited poll to every device that's due (`seen_ago > device_poll_interval
    /// − 1s`); the response refreshes `last_seen` through the normal inbound path.
    pub fn poll_devices(&self) -> Result<()> {
        let due = self
            .shared
            .options
            .device_poll_interval
            .saturating_sub(Duration::from_secs(1));
        for device in self.devices(None) {
            if device.seen_ago() > due {
                device.send_poll_packet()?;
            }
        }
        Ok(())
    }

    /// Devices seen within `max_seen` (default `missed_polls × device_poll_interval`),
    /// sorted by device id.
    pub fn devices(&self, max_seen: Option<Duration>) -> Vec<Device> {
        let max_seen = max_seen.unwrap_or_else(|| self.shared.default_max_seen());
        self.shared.device_views(max_seen)
    }

    pub fn by_id(&self, id: u64) -> Option<Device> {
        self.devices(None).into_iter().find(|d| d.id() == id)
    }

    pub fn by_label(&self, label: &str) -> Vec<Device> {
        self.devices(None)
            .into_iter()
            .filter(|d| d.label().map(|l| l == label).unwrap_or(false))
            .collect()
    }

    pub fn by_power(&self, on: bool) -> Vec<Device> {
        self.devices(None)
            .into_iter()
            .filter(|d| d.power().map(|p| p == on).unwrap_or(false))
            .collect()
    }

    pub fn by_group_id(&self, group_id: [u8; 16]) -> Vec<Device> {
        self.devices(None)
            .into_iter()
            .filter(|d| d.group_id().map(|g| g == group_id).unwrap_or(false))
            .collect()
    }

    pub fn by_location_id(&self, location_id: [u8; 16]) -> Vec<Device> {
        self.devices(None)
            .into_iter()
            .filter(|d| d.location_id().map(|l| l == location_id).unwrap_or(false))
            .collect()
    }

    /// Every group id seen so far, each as a view resolved dynamically from the current
    /// device registry — a [Group] caches nothing; see [crate::group] for why.
    pub fn groups(&self) -> Vec<Group> {
        self.shared
            .groups
            .lock()
            .unwrap()
            .iter()
            .map(|&id| Group::new(GroupKind::Group, id, Arc::downgrade(&self.shared)))
            .collect()
    }

    pub fn locations(&self) -> Vec<Group> {
        self.shared
            .locations
            .lock()
            .unwrap()
            .iter()
            .map(|&id| Group::new(GroupKind::Location, id, Arc::downgrade(&self.shared)))
            .collect()
    }
}

fn random_source() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    // No external RNG dependency is carried solely for this: one 64-bit hash of the
    // process's random `HashMap` seed gives a uniformly distributed u32 cheaply.
    let raw = RandomState::new().build_hasher().finish();
    let scaled = (raw % u32::MAX as u64) as u32;
    scaled.max(1)
}

fn register_state_service_subscriber(shared: &Arc<ClientShared>) {
    let weak: Weak<ClientShared> = Arc::downgrade(shared);
    let transport = Arc::clone(&shared.transport);
    transport.register_packet_handler(
        Some(Box::new(|raw: &RawMessage| raw.protocol_header.typ == 3)),
        Box::new(move |addr, raw| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let id = raw.frame_addr.target;
            let is_new = {
                let mut registry = shared.devices.lock().unwrap();
                if registry.contains_key(&id) {
                    false
                } else {
                    registry.insert(id, Arc::new(DeviceInner::new(id, addr)));
                    true
                }
            };
            if is_new {
                register_per_device_subscriber(&shared, id);
                if let Some(inner) = shared.devices.lock().unwrap().get(&id).cloned() {
                    inner.update_addr(addr);
                    inner.on_packet(raw);
                }
            }
        }),
    );
}

fn register_per_device_subscriber(shared: &Arc<ClientShared>, id: u64) {
    let weak: Weak<ClientShared> = Arc::downgrade(shared);
    shared.transport.register_packet_handler(
        Some(Box::new(move |raw: &RawMessage| {
            raw.frame_addr.target == id && is_device_reply_type(raw.protocol_header.typ)
        })),
        Box::new(move |addr, raw| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Some(inner) = shared.devices.lock().unwrap().get(&id).cloned() {
                inner.update_addr(addr);
                inner.on_packet(raw);
            }
        }),
    );
}

/// Matches ACKNOWLEDGEMENT, ECHO_RESPONSE, and every `STATE*` reply type this crate's codec
/// knows about.
fn is_device_reply_type(typ: u16) -> bool {
    matches!(
        typ,
        3 | 13 | 15 | 17 | 19 | 22 | 25 | 33 | 35 | 45 | 50 | 53 | 59 | 107 | 118 | 121 | 144
            | 147 | 149 | 503 | 506 | 509 | 512 | 818
    )
}

/// Records a group id the first time any device reports membership in it. No label or
/// membership state is cached here — [Group][crate::group::Group] resolves both dynamically
/// through the device registry, so this subscriber only needs to remember that the id exists.
fn register_state_group_subscriber(shared: &Arc<ClientShared>) {
    let weak: Weak<ClientShared> = Arc::downgrade(shared);
    shared.transport.register_packet_handler(
        Some(Box::new(|raw: &RawMessage| raw.protocol_header.typ == 53)),
        Box::new(move |_addr, raw| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Ok(Message::StateGroup { group, .. }) = Message::from_raw(raw) {
                shared.groups.lock().unwrap().insert(group.0);
            }
        }),
    );
}

fn register_state_location_subscriber(shared: &Arc<ClientShared>) {
    let weak: Weak<ClientShared> = Arc::downgrade(shared);
    shared.transport.register_packet_handler(
        Some(Box::new(|raw: &RawMessage| raw.protocol_header.typ == 50)),
        Box::new(move |_addr, raw| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Ok(Message::StateLocation { location, .. }) = Message::from_raw(raw) {
                shared.locations.lock().unwrap().insert(location.0);
            }
        }),
    );
}

fn start_discovery_timer(shared: &Arc<ClientShared>) -> RepeatTimer {
    let weak: Weak<ClientShared> = Arc::downgrade(shared);
    let interval = shared.options.discovery_interval;
    RepeatTimer::start(interval, move || {
        if let Some(shared) = weak.upgrade() {
            let sequence = shared.next_sequence();
            if let Err(e) = shared.transport.send_discovery(shared.source, sequence) {
                tracing::warn!(error = %e, "periodic discovery send failed");
            }
        }
    })
}

fn start_poll_timer(shared: &Arc<ClientShared>) -> RepeatTimer {
    let weak: Weak<ClientShared> = Arc::downgrade(shared);
    let interval = shared.options.device_poll_interval;
    RepeatTimer::start(interval, move || {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let due = shared
            .options
            .device_poll_interval
            .saturating_sub(Duration::from_secs(1));
        let devices: Vec<Arc<DeviceInner>> = shared.devices.lock().unwrap().values().cloned().collect();
        for inner in devices {
            if inner.seen_ago() > due {
                let device = shared.device_handle(inner);
                if let Err(e) = device.send_poll_packet() {
                    tracing::warn!(error = %e, "device poll send failed");
                }
            }
        }
    })
}

#[cfg(test)]
impl Client {
    /// Registers a fake device directly into the registry, bypassing discovery, so tests can
    /// exercise request primitives against an address nothing is listening on.
    fn insert_test_device(&self, id: u64, addr: SocketAddr) -> Device {
        let inner = Arc::new(DeviceInner::new(id, addr));
        self.shared
            .devices
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&inner));
        self.shared.device_handle(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn is_device_reply_type_accepts_acknowledgement_and_echo_response() {
        assert!(is_device_reply_type(45));
        assert!(is_device_reply_type(59));
        assert!(!is_device_reply_type(20)); // GetPower is a request, never a reply
    }

    #[test]
    fn random_source_is_never_zero() {
        for _ in 0..64 {
            assert!(random_source() >= 1);
        }
    }

    #[test]
    fn sequence_allocator_wraps_through_every_value_cyclically() {
        let client = ClientShared {
            transport: Transport::new("127.0.0.1:0".parse().unwrap(), "127.0.0.1:1".parse().unwrap()).unwrap(),
            source: 1,
            sequence: AtomicU8::new(0),
            options: ClientOptions::default(),
            devices: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            locations: Mutex::new(HashSet::new()),
        };
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(client.next_sequence());
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(client.next_sequence(), 0); // wrapped back around
    }

    #[test]
    fn a_request_against_an_unreachable_device_times_out_within_its_budget() {
        let client = Client::new(ClientOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            broadcast_addr: "127.0.0.1:1".parse().unwrap(),
            discovery_interval: Duration::from_secs(3600),
            device_poll_interval: Duration::from_secs(3600),
            missed_polls: 3,
        })
        .unwrap();
        let device = client.insert_test_device(0x0102030405, "127.0.0.1:1".parse().unwrap());

        let start = Instant::now();
        let err = device.label().unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, crate::error::Error::Timeout { .. }));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }
}
