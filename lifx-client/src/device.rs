use crate::client::{ClientHandle, RequestOptions};
use crate::color::Color;
use crate::error::{Error, Result};
use lifx_core::{BuildOptions, EchoPayload, LifxString, Message, PowerLevel, RawMessage};
use std::collections::HashMap;
use std::ffi::CString;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_TRANSITION_MS: u32 = 200;

/// A one-shot wakeable: the device's inbound subscriber deposits the reply here and
/// notifies; the caller in `_block_for` waits on it with a timeout.
struct Waiter {
    reply: Mutex<Option<RawMessage>>,
    condvar: Condvar,
}

/// Per-device state shared between the Client's registry and every outstanding `Device`
/// handle for that id. Lives for the duration of the process once the device is first seen.
pub(crate) struct DeviceInner {
    pub(crate) id: u64,
    addr: Mutex<SocketAddr>,
    services: Mutex<HashMap<u8, u32>>,
    last_seen: Mutex<Instant>,
    pending: Mutex<HashMap<u8, Arc<Waiter>>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl DeviceInner {
    pub(crate) fn new(id: u64, addr: SocketAddr) -> DeviceInner {
        DeviceInner {
            id,
            addr: Mutex::new(addr),
            services: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
            pending: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn seen_ago(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        *self.addr.lock().unwrap()
    }

    pub(crate) fn update_addr(&self, addr: SocketAddr) {
        *self.addr.lock().unwrap() = addr;
    }

    /// Called by the Client's per-device subscriber for every packet addressed to this id.
    pub(crate) fn on_packet(&self, raw: &RawMessage) {
        *self.last_seen.lock().unwrap() = Instant::now();

        const STATE_SERVICE: u16 = 3;
        if raw.protocol_header.typ == STATE_SERVICE {
            if let Ok(Message::StateService { service, port }) = Message::from_raw(raw) {
                self.services.lock().unwrap().insert(service as u8, port);
            }
        }

        let seq = raw.frame_addr.sequence;
        let waiter = self.pending.lock().unwrap().get(&seq).cloned();
        if let Some(waiter) = waiter {
            *waiter.reply.lock().unwrap() = Some(raw.clone());
            waiter.condvar.notify_all();
        }
    }
}

/// A handle to a single known bulb. Cheap to clone: both fields are `Arc`-backed.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
    pub(crate) client: ClientHandle,
}

impl Device {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mac(&self) -> String {
        lifx_core::mac_string(self.inner.id)
    }

    pub fn seen_ago(&self) -> Duration {
        self.inner.seen_ago()
    }

    /// `(sent_count, dropped_count)` snapshot; local only, no network round-trip.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.inner.sent.load(Ordering::Relaxed),
            self.inner.dropped.load(Ordering::Relaxed),
        )
    }

    pub fn label(&self) -> Result<String> {
        let reply = self.block_for(false, true, Message::GetLabel, RequestOptions::default())?;
        match reply {
            Some(raw) => match Message::from_raw(&raw)? {
                Message::StateLabel { label } => Ok(lifx_core::bytes_to_label(label.cstr().to_bytes())),
                _ => Ok(String::new()),
            },
            None => Ok(String::new()),
        }
    }

    pub fn set_label(&self, label: &str) -> Result<()> {
        let label = str_to_lifx_string(label);
        self.block_for(true, false, Message::SetLabel { label }, RequestOptions::default())?;
        Ok(())
    }

    pub fn power(&self) -> Result<bool> {
        let reply = self.block_for(false, true, Message::GetPower, RequestOptions::default())?;
        match reply {
            Some(raw) => match Message::from_raw(&raw)? {
                Message::StatePower { level } => Ok(level > 0),
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    pub fn set_power(&self, on: bool) -> Result<()> {
        self.fade_power(on, 0)
    }

    pub fn fade_power(&self, on: bool, duration_ms: u32) -> Result<()> {
        let level = if on { PowerLevel::Enabled } else { PowerLevel::Standby };
        self.block_for(
            true,
            false,
            Message::LightSetPower {
                level: level as u16,
                duration: duration_ms,
            },
            RequestOptions::default(),
        )?;
        Ok(())
    }

    pub fn power_toggle(&self, duration_ms: u32) -> Result<()> {
        let on = self.power()?;
        self.fade_power(!on, duration_ms)
    }

    pub fn color(&self) -> Result<Color> {
        let reply = self.block_for(false, true, Message::LightGet, RequestOptions::default())?;
        match reply {
            Some(raw) => match Message::from_raw(&raw)? {
                Message::LightState { color, .. } => Ok(Color::from(color)),
                _ => Ok(Color {
                    hue: 0.0,
                    saturation: 0.0,
                    brightness: 0.0,
                    kelvin: 0,
                }),
            },
            None => Ok(Color {
                hue: 0.0,
                saturation: 0.0,
                brightness: 0.0,
                kelvin: 0,
            }),
        }
    }

    pub fn set_color(&self, color: Color) -> Result<()> {
        self.fade_color(color, DEFAULT_TRANSITION_MS)
    }

    pub fn fade_color(&self, color: Color, duration_ms: u32) -> Result<()> {
        self.block_for(
            true,
            false,
            Message::LightSetColor {
                reserved: 0,
                color: color.into(),
                duration: duration_ms,
            },
            RequestOptions::default(),
        )?;
        Ok(())
    }

    pub fn set_hue(&self, hue: f64) -> Result<()> {
        let mut c = self.color()?;
        c.hue = hue;
        self.set_color(c)
    }

    pub fn set_saturation(&self, saturation: f64) -> Result<()> {
        let mut c = self.color()?;
        c.saturation = saturation;
        self.set_color(c)
    }

    pub fn set_brightness(&self, brightness: f64) -> Result<()> {
        let mut c = self.color()?;
        c.brightness = brightness;
        self.set_color(c)
    }

    pub fn set_kelvin(&self, kelvin: u16) -> Result<()> {
        let mut c = self.color()?;
        c.kelvin = kelvin;
        self.set_color(c)
    }

    pub fn host_firmware(&self) -> Result<String> {
        let reply = self.block_for(false, true, Message::GetHostFirmware, RequestOptions::default())?;
        self.firmware_version_string(reply)
    }

    pub fn wifi_firmware(&self) -> Result<String> {
        let reply = self.block_for(false, true, Message::GetWifiFirmware, RequestOptions::default())?;
        self.firmware_version_string(reply)
    }

    fn firmware_version_string(&self, reply: Option<RawMessage>) -> Result<String> {
        let version = match reply.map(|raw| Message::from_raw(&raw)) {
            Some(Ok(Message::StateHostFirmware {
                version_major,
                version_minor,
                ..
            }))
            | Some(Ok(Message::StateWifiFirmware {
                version_major,
                version_minor,
                ..
            })) => ((version_major as u32) << 16) | version_minor as u32,
            _ => return Ok(String::new()),
        };
        Ok(lifx_core::version_string(version))
    }

    /// Round-trip time for an echo request/response, in seconds.
    pub fn latency(&self) -> Result<f64> {
        let start = Instant::now();
        self.block_for(
            false,
            true,
            Message::EchoRequest {
                payload: EchoPayload([0u8; 64]),
            },
            RequestOptions::default(),
        )?;
        Ok(start.elapsed().as_secs_f64())
    }

    pub fn group_id(&self) -> Result<[u8; 16]> {
        let reply = self.block_for(false, true, Message::GetGroup, RequestOptions::default())?;
        match reply.map(|raw| Message::from_raw(&raw)) {
            Some(Ok(Message::StateGroup { group, .. })) => Ok(group.0),
            _ => Ok([0; 16]),
        }
    }

    pub fn location_id(&self) -> Result<[u8; 16]> {
        let reply = self.block_for(false, true, Message::GetLocation, RequestOptions::default())?;
        match reply.map(|raw| Message::from_raw(&raw)) {
            Some(Ok(Message::StateLocation { location, .. })) => Ok(location.0),
            _ => Ok([0; 16]),
        }
    }

    /// `(label, updated_at)` as reported by this member's own `STATE_GROUP` reply; used by
    /// [crate::group::Group::label] to pick the newest label across all members.
    pub(crate) fn group_label_state(&self) -> Result<(String, u64)> {
        let reply = self.block_for(false, true, Message::GetGroup, RequestOptions::default())?;
        match reply.map(|raw| Message::from_raw(&raw)) {
            Some(Ok(Message::StateGroup { label, updated_at, .. })) => {
                Ok((lifx_core::bytes_to_label(label.cstr().to_bytes()), updated_at))
            }
            _ => Ok((String::new(), 0)),
        }
    }

    /// `(label, updated_at)` as reported by this member's own `STATE_LOCATION` reply.
    pub(crate) fn location_label_state(&self) -> Result<(String, u64)> {
        let reply = self.block_for(false, true, Message::GetLocation, RequestOptions::default())?;
        match reply.map(|raw| Message::from_raw(&raw)) {
            Some(Ok(Message::StateLocation { label, updated_at, .. })) => {
                Ok((lifx_core::bytes_to_label(label.cstr().to_bytes()), updated_at))
            }
            _ => Ok((String::new(), 0)),
        }
    }

    /// Sends GET_SERVICE without waiting for a reply; the response (if any) refreshes
    /// `last_seen` through the normal inbound path.
    pub(crate) fn send_poll_packet(&self) -> Result<()> {
        let seq = self.client.next_sequence();
        let options = BuildOptions {
            target: Some(self.inner.id),
            ack_required: false,
            res_required: true,
            sequence: seq,
            source: self.client.source(),
        };
        let raw = RawMessage::build(&options, Message::GetService)?;
        self.client.send_packet(self.inner.addr(), &raw)?;
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The core request/response primitive. Forbids requesting both an ack and a response
    /// on the same call (see the crate's design notes); retransmits up to 10 times,
    /// subdividing `timeout` evenly, counting every retry past the first as a dropped
    /// packet.
    fn block_for(
        &self,
        need_ack: bool,
        need_res: bool,
        message: Message,
        opts: RequestOptions,
    ) -> Result<Option<RawMessage>> {
        if need_ack && need_res {
            return Err(Error::AckAndResponseBothRequested);
        }
        if !need_ack && !need_res {
            self.send_once(false, false, message)?;
            return Ok(None);
        }

        let retransmits = opts.retransmits.max(1);
        let sub_timeout = opts.timeout / retransmits;
        let waiter = Arc::new(Waiter {
            reply: Mutex::new(None),
            condvar: Condvar::new(),
        });

        let sequence = self.client.next_sequence();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(sequence, Arc::clone(&waiter));

        let result = (|| {
            for attempt in 0..retransmits {
                if attempt > 0 {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(device = %self.mac(), attempt, "retransmitting");
                }

                self.send_once_with_sequence(need_ack, need_res, message.clone(), sequence)?;

                let mut guard = waiter.reply.lock().unwrap();
                while guard.is_none() {
                    let (new_guard, timed_out) =
                        waiter.condvar.wait_timeout(guard, sub_timeout).unwrap();
                    guard = new_guard;
                    if timed_out.timed_out() {
                        break;
                    }
                }
                let reply = guard.take();
                drop(guard);
                if reply.is_some() {
                    return Ok(reply);
                }
            }

            Err(Error::Timeout {
                device: self.inner.id,
                timeout: opts.timeout,
                retransmits,
            })
        })();

        self.inner.pending.lock().unwrap().remove(&sequence);
        result
    }

    fn send_once(&self, ack_required: bool, res_required: bool, message: Message) -> Result<()> {
        let sequence = self.client.next_sequence();
        self.send_once_with_sequence(ack_required, res_required, message, sequence)
    }

    fn send_once_with_sequence(
        &self,
        ack_required: bool,
        res_required: bool,
        message: Message,
        sequence: u8,
    ) -> Result<()> {
        let options = BuildOptions {
            target: Some(self.inner.id),
            ack_required,
            res_required,
            sequence,
            source: self.client.source(),
        };
        let raw = RawMessage::build(&options, message)?;
        self.client.send_packet(self.inner.addr(), &raw)?;
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn str_to_lifx_string(s: &str) -> LifxString {
    let filtered: Vec<u8> = s.bytes().filter(|&b| b != 0).take(31).collect();
    let cstring = CString::new(filtered).unwrap_or_default();
    LifxString::new(&cstring)
}
