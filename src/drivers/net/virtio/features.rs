//! Feature negotiation between the network driver and the device.

use core::mem;

use bitflags::bitflags;
pub use virtio::net::F as Features;
use virtio::{DeviceStatus, FeatureBits, le128};

use super::error::VirtioNetError;
use crate::config::AdapterConfig;
use crate::drivers::virtio::transport::Transport;

/// Control channel RX extra mode support.
///
/// The bit is missing in [`virtio::net::F`], it depends on [`Features::CTRL_VQ`].
pub const CTRL_RX_EXTRA: Features = Features::from_bits_retain(le128::from_ne(1 << 20));

/// Features a device has to offer to be driven by this driver.
pub const MANDATORY_FEATURES: Features = Features::VERSION_1
	.union(Features::INDIRECT_DESC)
	.union(Features::STATUS)
	.union(Features::CTRL_VQ);

bitflags! {
	/// Capabilities of the adapter that follow from the negotiated features.
	#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
	pub struct AdapterFlags: u16 {
		const CHECKSUM = 1 << 0;
		const CONTROL_QUEUE = 1 << 1;
		const MAC_CONFIG = 1 << 2;
		const PROMISCUOUS = 1 << 3;
		const EXT_PACKET_FILTERS = 1 << 4;
		const TSO4 = 1 << 5;
		const TSO6 = 1 << 6;
		const MQ = 1 << 7;
		const RSS = 1 << 8;
		const HASH = 1 << 9;
	}
}

/// Outcome of a successful negotiation. Immutable for the lifetime of the adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NegotiatedFeatures {
	/// Features offered by the device.
	pub host: Features,
	/// Features acknowledged by the driver, always a subset of `host`.
	pub guest: Features,
	pub flags: AdapterFlags,
	/// Size of the header that precedes every packet in the rings.
	pub header_size: usize,
}

impl NegotiatedFeatures {
	pub fn has(&self, feature: Features) -> bool {
		self.guest.contains(feature)
	}
}

/// Chooses the features the driver acknowledges.
#[derive(Clone, Debug)]
pub struct FeatureNegotiator {
	mandatory: Features,
	rss_allowed: bool,
}

impl FeatureNegotiator {
	pub fn new(config: &AdapterConfig) -> Self {
		Self {
			mandatory: config.mandatory_features,
			rss_allowed: config.rss_allowed,
		}
	}

	/// Computes the acknowledged feature set for the offered `host` features
	/// without touching the device.
	pub fn select(&self, host: Features) -> Result<NegotiatedFeatures, VirtioNetError> {
		let missing = self.mandatory.difference(host);
		if !missing.is_empty() {
			return Err(VirtioNetError::MandatoryFeatureMissing(missing));
		}

		let mut guest = self.mandatory;
		let mut flags = AdapterFlags::empty();
		let mut ack = |feature: Features| {
			if host.contains(feature) {
				guest.insert(feature);
				true
			} else {
				false
			}
		};

		ack(Features::VERSION_1);
		ack(Features::INDIRECT_DESC);
		ack(Features::STATUS);
		ack(Features::MAC);
		ack(Features::MTU);
		ack(Features::SPEED_DUPLEX);
		ack(Features::GUEST_CSUM);

		if ack(Features::CSUM) {
			flags.insert(AdapterFlags::CHECKSUM);
			flags.set(AdapterFlags::TSO4, ack(Features::HOST_TSO4));
			flags.set(AdapterFlags::TSO6, ack(Features::HOST_TSO6));
		}

		if ack(Features::CTRL_VQ) {
			flags.insert(AdapterFlags::CONTROL_QUEUE);
			flags.set(AdapterFlags::MAC_CONFIG, ack(Features::CTRL_MAC_ADDR));
			flags.set(AdapterFlags::PROMISCUOUS, ack(Features::CTRL_RX));
			flags.set(AdapterFlags::EXT_PACKET_FILTERS, ack(CTRL_RX_EXTRA));
			flags.set(AdapterFlags::MQ, ack(Features::MQ));
			if self.rss_allowed {
				flags.set(AdapterFlags::RSS, ack(Features::RSS));
			}
		}

		flags.set(AdapterFlags::HASH, ack(Features::HASH_REPORT));
		debug_assert!(guest.requirements_satisfied(), "{guest:?}");

		let header_size = if flags.contains(AdapterFlags::HASH) {
			mem::size_of::<virtio::net::Hdr>() + mem::size_of::<virtio::net::HdrHashReport>()
		} else {
			mem::size_of::<virtio::net::Hdr>()
		};

		Ok(NegotiatedFeatures {
			host,
			guest,
			flags,
			header_size,
		})
	}

	/// Negotiates the features with the device.
	///
	/// The acknowledged features are written exactly once. Afterwards FEATURES_OK
	/// is set and read back, a device that does not accept the set clears it again.
	pub fn negotiate<T: Transport>(&self, transport: &T) -> Result<NegotiatedFeatures, VirtioNetError> {
		let host = Features::from(transport.device_features());
		debug!("Device offers features {host:?}");

		let negotiated = match self.select(host) {
			Ok(negotiated) => negotiated,
			Err(err) => {
				error!("Device features {host:?} do not satisfy the driver: {err}");
				return Err(err);
			}
		};

		transport.set_driver_features(negotiated.guest.into())?;

		// Indicates the device, that the current feature set is final for the driver
		// and will not be changed.
		transport.add_status(DeviceStatus::FEATURES_OK);

		// Checks if the device has accepted final set. This finishes feature negotiation.
		if !transport.status().contains(DeviceStatus::FEATURES_OK) {
			error!("Device rejected features {:?}", negotiated.guest);
			return Err(VirtioNetError::FeaturesRejected(negotiated.guest));
		}

		info!("Features have been negotiated: {:?}", negotiated.guest);
		Ok(negotiated)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::drivers::virtio::transport::fake::FakeTransport;

	fn negotiator() -> FeatureNegotiator {
		FeatureNegotiator::new(&AdapterConfig::default())
	}

	#[test]
	fn requirements_follow_the_control_queue() {
		assert!(Features::CSUM.requirements_satisfied());
		assert!(!Features::MQ.requirements_satisfied());
		assert!((Features::MQ | Features::CTRL_VQ).requirements_satisfied());
		assert!(!Features::HOST_TSO4.requirements_satisfied());
		assert!((Features::HOST_TSO4 | Features::HOST_TSO6 | Features::CSUM).requirements_satisfied());
	}

	#[test]
	fn missing_mandatory_feature_is_reported() {
		let host = Features::VERSION_1 | Features::INDIRECT_DESC | Features::STATUS;
		assert_eq!(
			negotiator().select(host),
			Err(VirtioNetError::MandatoryFeatureMissing(Features::CTRL_VQ))
		);
	}

	#[test]
	fn missing_mandatory_feature_writes_nothing() {
		let transport = FakeTransport::new((Features::VERSION_1 | Features::STATUS).into());

		let err = negotiator().negotiate(&transport).unwrap_err();

		assert_eq!(
			err,
			VirtioNetError::MandatoryFeatureMissing(Features::INDIRECT_DESC | Features::CTRL_VQ)
		);
		let state = transport.state();
		assert!(state.feature_writes.is_empty());
		assert!(!state.status.contains(DeviceStatus::FEATURES_OK));
	}

	#[test]
	fn negotiated_is_subset_of_host() {
		let optional = [
			Features::CSUM,
			Features::HOST_TSO4,
			Features::HOST_TSO6,
			Features::MAC,
			Features::MTU,
			Features::CTRL_RX,
			Features::MQ,
			Features::RSS,
			Features::HASH_REPORT,
		];

		for mask in 0u32..(1 << optional.len()) {
			let mut host = MANDATORY_FEATURES | Features::GUEST_TSO4 | Features::RING_PACKED;
			for (bit, feature) in optional.iter().enumerate() {
				if mask & (1 << bit) != 0 {
					host |= *feature;
				}
			}

			let negotiated = negotiator().select(host).unwrap();
			assert!(host.contains(negotiated.guest), "{host:?}");
			assert!(negotiated.guest.requirements_satisfied(), "{host:?}");
			if negotiated.guest.intersects(Features::HOST_TSO4 | Features::HOST_TSO6) {
				assert!(negotiated.guest.contains(Features::CSUM));
			}
			assert!(!negotiated.guest.contains(Features::GUEST_TSO4));
		}
	}

	#[test]
	fn guest_checksum_is_acknowledged_when_offered() {
		let negotiated = negotiator().select(MANDATORY_FEATURES).unwrap();
		assert!(!negotiated.has(Features::GUEST_CSUM));

		let negotiated = negotiator()
			.select(MANDATORY_FEATURES | Features::GUEST_CSUM | Features::GUEST_TSO4)
			.unwrap();
		assert!(negotiated.has(Features::GUEST_CSUM));
		assert!(!negotiated.has(Features::GUEST_TSO4));
	}

	#[test]
	fn tso_requires_checksum() {
		let host = MANDATORY_FEATURES | Features::HOST_TSO4 | Features::HOST_TSO6;
		let negotiated = negotiator().select(host).unwrap();

		assert!(!negotiated.has(Features::HOST_TSO4));
		assert!(!negotiated.flags.intersects(AdapterFlags::TSO4 | AdapterFlags::TSO6));

		let negotiated = negotiator().select(host | Features::CSUM).unwrap();
		assert!(negotiated.has(Features::HOST_TSO4 | Features::HOST_TSO6));
		assert!(negotiated.flags.contains(AdapterFlags::CHECKSUM | AdapterFlags::TSO4 | AdapterFlags::TSO6));
	}

	#[test]
	fn control_queue_gates_its_extensions() {
		let config = AdapterConfig {
			mandatory_features: Features::VERSION_1 | Features::INDIRECT_DESC,
			..AdapterConfig::default()
		};
		let host = Features::VERSION_1
			| Features::INDIRECT_DESC
			| Features::CTRL_MAC_ADDR
			| Features::CTRL_RX
			| CTRL_RX_EXTRA
			| Features::MQ
			| Features::RSS;

		let negotiated = FeatureNegotiator::new(&config).select(host).unwrap();
		assert_eq!(negotiated.guest, Features::VERSION_1 | Features::INDIRECT_DESC);
		assert!(negotiated.flags.is_empty());

		let negotiated = FeatureNegotiator::new(&config)
			.select(host | Features::CTRL_VQ)
			.unwrap();
		assert!(negotiated.flags.contains(
			AdapterFlags::CONTROL_QUEUE
				| AdapterFlags::MAC_CONFIG
				| AdapterFlags::PROMISCUOUS
				| AdapterFlags::EXT_PACKET_FILTERS
				| AdapterFlags::MQ
				| AdapterFlags::RSS
		));
	}

	#[test]
	fn rss_can_be_disallowed() {
		let config = AdapterConfig {
			rss_allowed: false,
			..AdapterConfig::default()
		};
		let host = MANDATORY_FEATURES | Features::RSS | Features::MQ;

		let negotiated = FeatureNegotiator::new(&config).select(host).unwrap();
		assert!(!negotiated.has(Features::RSS));
		assert!(negotiated.has(Features::MQ));
	}

	#[test]
	fn header_size_grows_with_hash_report() {
		let negotiated = negotiator().select(MANDATORY_FEATURES).unwrap();
		assert_eq!(negotiated.header_size, 12);

		let negotiated = negotiator()
			.select(MANDATORY_FEATURES | Features::HASH_REPORT)
			.unwrap();
		assert_eq!(negotiated.header_size, 20);
		assert!(negotiated.flags.contains(AdapterFlags::HASH));
	}

	#[test]
	fn negotiate_writes_once_and_sets_features_ok() {
		let host = MANDATORY_FEATURES | Features::CSUM | Features::MAC;
		let transport = FakeTransport::new(host.into());
		transport.initialize().unwrap();

		let negotiated = negotiator().negotiate(&transport).unwrap();

		let state = transport.state();
		assert_eq!(state.feature_writes, [virtio::F::from(negotiated.guest)]);
		assert!(state.status.contains(
			DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK
		));
	}

	#[test]
	fn upper_feature_word_reaches_the_device() {
		let host = MANDATORY_FEATURES | Features::SPEED_DUPLEX | Features::HASH_REPORT;
		let transport = FakeTransport::new(host.into());

		let negotiated = negotiator().negotiate(&transport).unwrap();

		assert_eq!(negotiated.host, host);
		assert!(negotiated.has(Features::VERSION_1 | Features::SPEED_DUPLEX | Features::HASH_REPORT));
		let written = Features::from(transport.state().feature_writes[0]);
		assert_eq!(written, negotiated.guest);
	}

	#[test]
	fn rejected_features_are_reported() {
		let transport = FakeTransport::new(MANDATORY_FEATURES.into());
		transport.state().clear_features_ok = true;

		assert_eq!(
			negotiator().negotiate(&transport),
			Err(VirtioNetError::FeaturesRejected(MANDATORY_FEATURES))
		);
		assert_eq!(transport.state().feature_writes.len(), 1);
	}
}
