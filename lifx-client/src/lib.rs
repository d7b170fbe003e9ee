//! A session-layer client for discovering and controlling LIFX bulbs on your LAN.
//!
//! [lifx-core] handles the wire protocol; this crate handles everything above it: a UDP
//! transport with a filtered pub/sub dispatcher, a repeating discovery/poll timer, a device
//! registry keyed by target id, and request/response correlation over the protocol's 8-bit
//! sequence numbers. [Group] is a read-only view over whichever devices currently report the
//! same group or location id — it resolves membership and label fresh on every call rather
//! than caching what it last saw broadcast.
//!
//! # Levels
//!
//!  * [Transport] is the low-level multiplexer: send raw packets, subscribe to filtered
//!    inbound traffic. Most users won't need this directly.
//!  * [Client] discovers bulbs, keeps the device registry warm, and hands out [Device] and
//!    [Group] handles.
//!  * [Device] is the per-bulb request/response API: labels, power, color, firmware
//!    versions, group/location membership.

mod client;
mod color;
mod device;
mod error;
mod group;
mod timer;
mod transport;

pub use client::{Client, ClientOptions, RequestOptions};
pub use color::Color;
pub use device::Device;
pub use error::{Error, Result};
pub use group::Group;
pub use transport::{Handler, Predicate, SubscriptionToken, Transport};
