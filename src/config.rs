use crate::drivers::net::virtio::features::{Features, MANDATORY_FEATURES};

/// Link speed in Mbit/s reported when the device announces zero or an implausible value.
pub(crate) const DEFAULT_LINK_SPEED: u32 = 10_000;

/// MTU used when `VIRTIO_NET_F_MTU` has not been negotiated.
pub(crate) const DEFAULT_MTU: u16 = 1500;

pub(crate) const ETHERNET_HEADER_LEN: u32 = 14;

pub(crate) const VLAN_HEADER_LEN: u32 = 4;

/// Number of multicast addresses the adapter announces to its owner.
pub(crate) const MULTICAST_LIST_SIZE: usize = 32;

/// Largest segmentation offload the adapter accepts.
pub(crate) const MAX_LSO_SIZE: u32 = 0xf800;

pub(crate) const MIN_LSO_SEGMENTS: u32 = 2;

/// Upper bound for the number of fragments of a single transmitted packet.
pub(crate) const MAX_TX_FRAGMENTS: u16 = 10;

/// Default limit for the number of queue pairs that are used when
/// `VIRTIO_NET_F_MQ` has been negotiated.
pub const MAX_QUEUE_PAIRS: u16 = 16;

/// Size of the interrupt table the host framework hands to the adapter.
///
/// One message per transmit and receive queue plus one for the control queue.
pub const MAX_INTERRUPTS: usize = 2 * MAX_QUEUE_PAIRS as usize + 1;

/// Operator supplied settings, consulted during bring-up.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
	/// Locally administered MAC address. Replaces the device MAC as current address,
	/// the permanent address is still taken from the device.
	pub mac_override: Option<[u8; 6]>,
	/// Features the device has to offer, otherwise bring-up is aborted.
	pub mandatory_features: Features,
	/// Allows acknowledging `VIRTIO_NET_F_RSS`.
	pub rss_allowed: bool,
	/// Limits the number of active queue pairs if `VIRTIO_NET_F_MQ` has been negotiated.
	pub max_queue_pairs: u16,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		Self {
			mac_override: None,
			mandatory_features: MANDATORY_FEATURES,
			rss_allowed: true,
			max_queue_pairs: MAX_QUEUE_PAIRS,
		}
	}
}
