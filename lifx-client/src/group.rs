use crate::client::ClientShared;
use crate::color::Color;
use crate::device::Device;
use crate::error::Result;
use std::sync::Weak;

/// Whether a [Group] view resolves `GetGroup`/`StateGroup` or `GetLocation`/`StateLocation`
/// against its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupKind {
    Group,
    Location,
}

/// A read-only view over every device reporting the same group or location id.
///
/// A `Group` owns only its id, a kind discriminator, and a [Weak] back-reference to the
/// owning [Client][crate::client::Client] — it caches no membership or label state itself.
/// Both are resolved fresh on every call: membership by asking the client's device registry
/// which devices currently report this id, and the label by asking every current member for
/// its own last-known label and picking whichever carries the highest `updated_at`. This
/// means a `Group` stays correct across devices joining, leaving, or renaming the group
/// without needing to observe every `STATE_GROUP`/`STATE_LOCATION` broadcast itself.
#[derive(Clone)]
pub struct Group {
    kind: GroupKind,
    id: [u8; 16],
    client: Weak<ClientShared>,
}

impl Group {
    pub(crate) fn new(kind: GroupKind, id: [u8; 16], client: Weak<ClientShared>) -> Group {
        Group { kind, id, client }
    }

    pub fn id(&self) -> [u8; 16] {
        self.id
    }

    /// Devices currently reporting membership in this group or location. Empty if the
    /// owning client has been dropped.
    pub fn members(&self) -> Vec<Device> {
        let Some(shared) = self.client.upgrade() else {
            return Vec::new();
        };
        let max_seen = shared.default_max_seen();
        shared
            .device_views(max_seen)
            .into_iter()
            .filter(|d| self.matches(d))
            .collect()
    }

    /// The label reported by the member with the highest `updated_at`, or an empty string
    /// if there are no members (or none answer in time).
    pub fn label(&self) -> Result<String> {
        let mut newest: Option<(String, u64)> = None;
        for member in self.members() {
            let state = match self.kind {
                GroupKind::Group => member.group_label_state(),
                GroupKind::Location => member.location_label_state(),
            };
            if let Ok((label, updated_at)) = state {
                if newest.as_ref().map(|(_, u)| updated_at > *u).unwrap_or(true) {
                    newest = Some((label, updated_at));
                }
            }
        }
        Ok(newest.map(|(label, _)| label).unwrap_or_default())
    }

    /// Sets every current member's power, one device at a time.
    pub fn fade_power(&self, on: bool, duration_ms: u32) -> Result<()> {
        for member in self.members() {
            member.fade_power(on, duration_ms)?;
        }
        Ok(())
    }

    pub fn power_toggle(&self, duration_ms: u32) -> Result<()> {
        for member in self.members() {
            member.power_toggle(duration_ms)?;
        }
        Ok(())
    }

    /// Sets every current member's color, one device at a time.
    pub fn fade_color(&self, color: Color, duration_ms: u32) -> Result<()> {
        for member in self.members() {
            member.fade_color(color, duration_ms)?;
        }
        Ok(())
    }

    fn matches(&self, device: &Device) -> bool {
        match self.kind {
            GroupKind::Group => device.group_id().map(|g| g == self.id).unwrap_or(false),
            GroupKind::Location => device.location_id().map(|l| l == self.id).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_is_empty_once_the_owning_client_is_dropped() {
        let group = Group::new(GroupKind::Group, [0u8; 16], Weak::new());
        assert!(group.members().is_empty());
    }

    #[test]
    fn label_is_empty_string_with_no_members() {
        let group = Group::new(GroupKind::Location, [1u8; 16], Weak::new());
        assert_eq!(group.label().unwrap(), "");
    }
}
