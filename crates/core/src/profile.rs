//! Link profiles: what differs between the ways readings reach us.
//!
//! The connection state machine is the same for every device; a profile only
//! answers three questions. Does the peripheral need an unlock challenge after
//! connecting? How are its notifications cut into fragments? Are readings
//! pushed over BLE or polled from a relay service?

use crate::crypto::{decrypt_frame, streaming_unlock_payload, STREAM_FRAME_LEN, STREAM_PAYLOAD_LEN};
use crate::error::Result;
use crate::reassembly::FragmentLayout;
use crate::sensor::SensorIdentity;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Sensor streaming service.
pub const DIRECT_SERVICE: Uuid = Uuid::from_u128(0x0000FDE3_0000_1000_8000_00805F9B34FB);
/// Unlock challenge characteristic.
pub const DIRECT_WRITE: Uuid = Uuid::from_u128(0x0000F001_0000_1000_8000_00805F9B34FB);
/// Reading notifications.
pub const DIRECT_NOTIFY: Uuid = Uuid::from_u128(0x0000F002_0000_1000_8000_00805F9B34FB);

/// Nordic UART service used by bridge transmitters.
pub const BRIDGE_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const BRIDGE_WRITE: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const BRIDGE_NOTIFY: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Fragment lengths of a direct sensor notification burst.
pub const DIRECT_FRAGMENTS: [usize; 3] = [20, 18, 8];

/// Opaque peripheral identifier assigned by the central.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub name: Option<String>,
    /// Hardware address, `AA:BB:..` upper case, when the platform exposes it
    pub address: Option<String>,
    pub services: Vec<Uuid>,
}

/// GATT endpoints of a BLE profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIds {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

/// How readings arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Notifications on the profile's notify characteristic
    Subscribe,
    /// Periodic requests to a relay service
    Poll { interval: Duration },
}

/// Inputs to the unlock challenge.
#[derive(Debug, Clone, Copy)]
pub struct UnlockContext<'a> {
    pub identity: &'a SensorIdentity,
    pub enable_time: u32,
    pub unlock_count: u32,
}

/// Capabilities that vary between link variants.
pub trait LinkProfile: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    fn delivery(&self) -> Delivery;

    /// GATT endpoints; `None` for links without a radio.
    fn services(&self) -> Option<ServiceIds>;

    /// Bytes to write after connecting, or `None` if no unlock is needed.
    fn derive_unlock(&self, _context: &UnlockContext<'_>) -> Option<Vec<u8>> {
        None
    }

    /// Notification layout; `None` for links without notifications.
    fn fragment_layout(&self) -> Option<FragmentLayout> {
        None
    }

    /// Turn a reassembled payload into a decrypted frame.
    fn decode_payload(&self, identity: &SensorIdentity, payload: &[u8]) -> Result<[u8; STREAM_FRAME_LEN]> {
        decrypt_frame(&identity.uid, payload)
    }

    /// Whether a scan result is the peripheral we are looking for.
    fn matches(&self, advertisement: &Advertisement, expected_address: Option<&str>) -> bool {
        let Some(ids) = self.services() else {
            return false;
        };
        if !advertisement.services.is_empty() && !advertisement.services.contains(&ids.service) {
            return false;
        }
        match (expected_address, advertisement.address.as_deref()) {
            (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Connection needs a credential handshake rather than a radio connection.
    fn needs_login(&self) -> bool {
        matches!(self.delivery(), Delivery::Poll { .. })
    }
}

/// BLE address a sensor advertises with: its first six UID bytes, reversed.
pub fn sensor_address(identity: &SensorIdentity) -> String {
    let uid = identity.uid.as_bytes();
    uid[..6]
        .iter()
        .rev()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The sensor itself, unlocked during pairing.
#[derive(Debug, Clone, Default)]
pub struct DirectProfile;

impl LinkProfile for DirectProfile {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn delivery(&self) -> Delivery {
        Delivery::Subscribe
    }

    fn services(&self) -> Option<ServiceIds> {
        Some(ServiceIds {
            service: DIRECT_SERVICE,
            write: DIRECT_WRITE,
            notify: DIRECT_NOTIFY,
        })
    }

    fn derive_unlock(&self, context: &UnlockContext<'_>) -> Option<Vec<u8>> {
        Some(streaming_unlock_payload(context.identity, context.enable_time, context.unlock_count).to_vec())
    }

    fn fragment_layout(&self) -> Option<FragmentLayout> {
        Some(FragmentLayout::new(DIRECT_FRAGMENTS.to_vec()))
    }
}

/// A transmitter clipped onto the sensor that forwards its payloads whole.
#[derive(Debug, Clone, Default)]
pub struct BridgeProfile;

impl LinkProfile for BridgeProfile {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn delivery(&self) -> Delivery {
        Delivery::Subscribe
    }

    fn services(&self) -> Option<ServiceIds> {
        Some(ServiceIds {
            service: BRIDGE_SERVICE,
            write: BRIDGE_WRITE,
            notify: BRIDGE_NOTIFY,
        })
    }

    fn fragment_layout(&self) -> Option<FragmentLayout> {
        Some(FragmentLayout::single(STREAM_PAYLOAD_LEN))
    }
}

/// Readings fetched from a cloud relay account.
#[derive(Debug, Clone)]
pub struct RelayProfile {
    pub interval: Duration,
}

impl Default for RelayProfile {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl LinkProfile for RelayProfile {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn delivery(&self) -> Delivery {
        Delivery::Poll {
            interval: self.interval,
        }
    }

    fn services(&self) -> Option<ServiceIds> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{PatchInfo, SensorUid};

    fn identity() -> SensorIdentity {
        SensorIdentity::new(
            SensorUid([0x15, 0x8A, 0x3B, 0x01, 0x00, 0xA0, 0x07, 0xE0]),
            PatchInfo([0x9D, 0x08, 0x30, 0x01, 0x76, 0x25]),
        )
    }

    #[test]
    fn test_uuid_constants() {
        assert_eq!(DIRECT_SERVICE.to_string(), "0000fde3-0000-1000-8000-00805f9b34fb");
        assert_eq!(DIRECT_NOTIFY.to_string(), "0000f002-0000-1000-8000-00805f9b34fb");
        assert_eq!(BRIDGE_SERVICE.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(BRIDGE_NOTIFY.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn test_capabilities() {
        let direct = DirectProfile;
        let context = UnlockContext {
            identity: &identity(),
            enable_time: 42,
            unlock_count: 1,
        };
        assert_eq!(direct.derive_unlock(&context).map(|p| p.len()), Some(12));
        assert_eq!(direct.fragment_layout().unwrap().total_len(), 46);
        assert!(!direct.needs_login());

        assert!(BridgeProfile.derive_unlock(&context).is_none());
        assert_eq!(BridgeProfile.fragment_layout().unwrap().fragment_count(), 1);

        let relay = RelayProfile::default();
        assert!(relay.needs_login());
        assert!(relay.services().is_none());
    }

    #[test]
    fn test_address_filter() {
        let address = sensor_address(&identity());
        assert_eq!(address, "A0:00:01:3B:8A:15");

        let advertisement = Advertisement {
            id: PeripheralId("p1".into()),
            name: Some("ABBOTT3MH00AAAAA".into()),
            address: Some(address.to_lowercase()),
            services: vec![DIRECT_SERVICE],
        };
        assert!(DirectProfile.matches(&advertisement, Some(&address)));
        assert!(!DirectProfile.matches(&advertisement, Some("00:00:00:00:00:00")));
        assert!(!BridgeProfile.matches(&advertisement, None));
        assert!(!RelayProfile::default().matches(&advertisement, None));
    }
}
