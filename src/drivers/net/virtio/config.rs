//! Reading the device specific configuration of a network device.
//!
//! Which part of the configuration space is defined depends on the negotiated
//! features. The driver only reads the prefix the features make valid.

use core::mem::{offset_of, size_of};

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use super::error::VirtioNetError;
use super::features::{Features, NegotiatedFeatures};
use crate::config::DEFAULT_LINK_SPEED;
use crate::drivers::virtio::transport::Transport;

/// Layout of `virtio_net_config`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug)]
#[repr(C)]
struct RawNetConfig {
	mac: [u8; 6],
	status: U16,
	max_virtqueue_pairs: U16,
	mtu: U16,
	speed: U32,
	duplex: u8,
	rss_max_key_size: u8,
	rss_max_indirection_table_length: U16,
	supported_hash_types: U32,
}

/// Bytes through `max_virtqueue_pairs`, always defined.
pub const BASE_CONFIG_LEN: usize = offset_of!(RawNetConfig, mtu);
/// Bytes through `mtu`, defined with [`Features::MTU`].
pub const MTU_CONFIG_LEN: usize = offset_of!(RawNetConfig, speed);
/// Bytes through `duplex`, defined with [`Features::SPEED_DUPLEX`].
pub const SPEED_DUPLEX_CONFIG_LEN: usize = offset_of!(RawNetConfig, rss_max_key_size);
/// The complete structure, defined with [`Features::RSS`] or [`Features::HASH_REPORT`].
pub const FULL_CONFIG_LEN: usize = size_of::<RawNetConfig>();

const STATUS_OFFSET: usize = offset_of!(RawNetConfig, status);

bitflags! {
	/// Content of the `status` field.
	#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
	pub struct LinkStatus: u16 {
		const LINK_UP = 1;
		const ANNOUNCE = 2;
	}
}

#[derive(FromPrimitive, IntoPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Duplex {
	Half = 0,
	Full = 1,
	#[num_enum(default)]
	Unknown = 0xff,
}

/// Device configuration as seen by the driver.
///
/// Fields the negotiated features leave undefined are zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
	pub mac: [u8; 6],
	pub status: LinkStatus,
	pub max_virtqueue_pairs: u16,
	pub mtu: u16,
	/// Link speed in Mbit/s.
	pub speed: u32,
	pub duplex: Duplex,
	pub rss_max_key_size: u8,
	pub rss_max_indirection_table_length: u16,
	pub supported_hash_types: u32,
}

/// Returns the number of configuration bytes `features` make valid.
pub fn allowed_config_len(features: Features) -> usize {
	let mut len = BASE_CONFIG_LEN;
	if features.contains(Features::MTU) {
		len = MTU_CONFIG_LEN;
	}
	if features.contains(Features::SPEED_DUPLEX) {
		len = SPEED_DUPLEX_CONFIG_LEN;
	}
	if features.intersects(Features::RSS | Features::HASH_REPORT) {
		len = FULL_CONFIG_LEN;
	}
	len
}

/// Reads the configuration with a single access to the device.
pub fn read_config<T: Transport>(
	transport: &T,
	negotiated: &NegotiatedFeatures,
) -> Result<DeviceConfig, VirtioNetError> {
	let features = negotiated.guest;
	let len = allowed_config_len(features);

	let mut raw = RawNetConfig::new_zeroed();
	transport
		.read_config(0, &mut raw.as_mut_bytes()[..len])
		.map_err(|source| VirtioNetError::ConfigReadFailure { len, source })?;
	trace!("Read {len} bytes of device configuration: {raw:?}");

	let gated = |feature: Features| features.intersects(feature);

	let mut config = DeviceConfig {
		mac: raw.mac,
		status: LinkStatus::empty(),
		max_virtqueue_pairs: 0,
		mtu: 0,
		speed: 0,
		duplex: Duplex::Unknown,
		rss_max_key_size: 0,
		rss_max_indirection_table_length: 0,
		supported_hash_types: 0,
	};

	if gated(Features::STATUS) {
		config.status = LinkStatus::from_bits_retain(raw.status.get());
	}
	if gated(Features::MQ) {
		config.max_virtqueue_pairs = raw.max_virtqueue_pairs.get();
	}
	if gated(Features::MTU) {
		config.mtu = raw.mtu.get();
	}
	if gated(Features::SPEED_DUPLEX) {
		config.speed = raw.speed.get();
		config.duplex = Duplex::from(raw.duplex);
	}
	if gated(Features::RSS) {
		config.rss_max_key_size = raw.rss_max_key_size;
		config.rss_max_indirection_table_length = raw.rss_max_indirection_table_length.get();
	}
	if gated(Features::RSS | Features::HASH_REPORT) {
		config.supported_hash_types = raw.supported_hash_types.get();
	}

	if config.speed == 0 || config.speed > i32::MAX as u32 {
		debug!(
			"Device reports link speed {}, assuming {DEFAULT_LINK_SPEED} Mbit/s full duplex",
			config.speed
		);
		config.speed = DEFAULT_LINK_SPEED;
		config.duplex = Duplex::Full;
	}

	Ok(config)
}

/// Reads the current link status.
///
/// Without [`Features::STATUS`] the link is always considered up.
pub fn read_link_status<T: Transport>(
	transport: &T,
	negotiated: &NegotiatedFeatures,
) -> Result<LinkStatus, VirtioNetError> {
	if !negotiated.has(Features::STATUS) {
		return Ok(LinkStatus::LINK_UP);
	}

	let mut status = U16::ZERO;
	transport
		.read_config(STATUS_OFFSET, status.as_mut_bytes())
		.map_err(|source| VirtioNetError::ConfigReadFailure {
			len: size_of::<U16>(),
			source,
		})?;

	Ok(LinkStatus::from_bits_retain(status.get()))
}
