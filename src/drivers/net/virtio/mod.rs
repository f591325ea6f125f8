//! A module containing a virtio network driver.
//!
//! [`NetAdapter`] brings the device up in a fixed order: features are negotiated
//! before the configuration is read, interrupts are validated before any queue binds
//! a message, and the control queue is prepared before data queues are admitted.

pub mod config;
pub mod features;
pub mod interrupts;
pub mod queues;

use alloc::collections::BTreeSet;
use alloc::sync::Arc;

use bitflags::bitflags;
use hermit_sync::SpinMutex;
use virtio::DeviceStatus;

use self::config::{DeviceConfig, Duplex, LinkStatus};
use self::error::VirtioNetError;
use self::features::{AdapterFlags, FeatureNegotiator, Features, NegotiatedFeatures};
use self::interrupts::{InterruptRegistry, InterruptSlot, QueueTarget};
use self::queues::{Control, ControlQueue, Queue, QueueTopology, Rx, RxQueue, Tx, TxQueue};
use crate::config::{
	AdapterConfig, DEFAULT_MTU, ETHERNET_HEADER_LEN, MAX_LSO_SIZE, MAX_TX_FRAGMENTS,
	MIN_LSO_SEGMENTS, MULTICAST_LIST_SIZE, VLAN_HEADER_LEN,
};
use crate::drivers::virtio::transport::{Device, Transport};
use crate::drivers::virtio::virtqueue::VqIndex;

/// Ring the transmit fragment hint is taken from.
const TX_HINT_QUEUE: u16 = 1;
/// Ring the receive fragment hint is taken from.
const RX_HINT_QUEUE: u16 = 0;

/// State shared between the adapter and its queues.
///
/// Written once during bring-up, afterwards only the set of claimed rings changes.
pub(crate) struct Shared<T: Transport> {
	device: Device<T>,
	pub(crate) negotiated: NegotiatedFeatures,
	pub(crate) config: DeviceConfig,
	pub(crate) topology: QueueTopology,
	pub(crate) registry: InterruptRegistry,
	claimed: SpinMutex<BTreeSet<u16>>,
}

impl<T: Transport> Shared<T> {
	pub(crate) fn transport(&self) -> &T {
		&self.device
	}

	/// Marks ring `index` as used. Returns `false` if it already is.
	pub(crate) fn claim(&self, index: u16) -> bool {
		self.claimed.lock().insert(index)
	}

	pub(crate) fn unclaim(&self, index: u16) {
		self.claimed.lock().remove(&index);
	}

	fn claimed_queues(&self) -> usize {
		self.claimed.lock().len()
	}
}

bitflags! {
	/// Receive filters the device can apply.
	#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
	pub struct PacketFilters: u8 {
		const DIRECTED = 1 << 0;
		const MULTICAST = 1 << 1;
		const ALL_MULTICAST = 1 << 2;
		const BROADCAST = 1 << 3;
		const PROMISCUOUS = 1 << 4;
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LsoCapabilities {
	pub ipv4: bool,
	pub ipv6: bool,
	pub max_size: u32,
	pub min_segments: u32,
}

/// Properties of the adapter announced to its owner once bring-up succeeded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
	/// Link speed in bit/s.
	pub link_speed: u64,
	pub duplex: Duplex,
	pub tx_checksum: bool,
	pub rx_checksum: bool,
	pub lso: Option<LsoCapabilities>,
	pub packet_filters: PacketFilters,
	pub multicast_list_size: usize,
	pub mtu: u16,
	pub max_frame_size: u32,
	pub header_size: usize,
	pub active_queue_pairs: u16,
	pub tx_ring_size: u16,
	pub rx_ring_size: u16,
	pub max_tx_fragments: u16,
	pub permanent_mac: [u8; 6],
	pub current_mac: [u8; 6],
}

impl Capabilities {
	fn new<T: Transport>(shared: &Shared<T>, current_mac: [u8; 6]) -> Self {
		let flags = shared.negotiated.flags;

		let mut packet_filters = PacketFilters::empty();
		if flags.contains(AdapterFlags::PROMISCUOUS) {
			packet_filters |= PacketFilters::PROMISCUOUS | PacketFilters::ALL_MULTICAST;
		}
		if flags.contains(AdapterFlags::EXT_PACKET_FILTERS) {
			packet_filters |=
				PacketFilters::DIRECTED | PacketFilters::MULTICAST | PacketFilters::BROADCAST;
		}

		let lso = flags
			.intersects(AdapterFlags::TSO4 | AdapterFlags::TSO6)
			.then(|| LsoCapabilities {
				ipv4: flags.contains(AdapterFlags::TSO4),
				ipv6: flags.contains(AdapterFlags::TSO6),
				max_size: MAX_LSO_SIZE,
				min_segments: MIN_LSO_SEGMENTS,
			});

		let mtu = if shared.negotiated.has(Features::MTU) && shared.config.mtu != 0 {
			shared.config.mtu
		} else {
			DEFAULT_MTU
		};
		let header_size = shared.negotiated.header_size;
		let max_frame_size =
			u32::from(mtu) + ETHERNET_HEADER_LEN + VLAN_HEADER_LEN + header_size as u32;

		Self {
			link_speed: u64::from(shared.config.speed) * 1_000_000,
			duplex: shared.config.duplex,
			tx_checksum: flags.contains(AdapterFlags::CHECKSUM),
			rx_checksum: shared.negotiated.has(Features::GUEST_CSUM),
			lso,
			packet_filters,
			multicast_list_size: MULTICAST_LIST_SIZE,
			mtu,
			max_frame_size,
			header_size,
			active_queue_pairs: shared.topology.active_queue_pairs(),
			tx_ring_size: expected_queue_size(shared.transport(), TX_HINT_QUEUE),
			rx_ring_size: expected_queue_size(shared.transport(), RX_HINT_QUEUE),
			max_tx_fragments: MAX_TX_FRAGMENTS,
			permanent_mac: shared.config.mac,
			current_mac,
		}
	}

	fn print_information(&self) {
		infoheader!(" VIRTIO NETWORK ADAPTER ");
		infoentry!("Permanent MAC", "{:02x?}", self.permanent_mac);
		infoentry!("Current MAC", "{:02x?}", self.current_mac);
		infoentry!("Link speed", "{} Mbit/s, {:?} duplex", self.link_speed / 1_000_000, self.duplex);
		infoentry!("MTU", self.mtu);
		infoentry!("Max frame size", self.max_frame_size);
		infoentry!("Header size", self.header_size);
		infoentry!("Queue pairs", self.active_queue_pairs);
		infoentry!("Ring sizes", "tx {}, rx {}", self.tx_ring_size, self.rx_ring_size);
		infoentry!("Checksum offload", "tx {}, rx {}", self.tx_checksum, self.rx_checksum);
		infoentry!("Segmentation offload", "{:?}", self.lso);
		infoentry!("Packet filters", "{:?}", self.packet_filters);
		infofooter!();
	}
}

fn expected_queue_size<T: Transport>(transport: &T, index: u16) -> u16 {
	transport
		.query_queue_allocation(VqIndex::from(index))
		.map_or(0, |allocation| allocation.num_entries)
}

/// Link state reported on power transitions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
	Connected { speed: u64, duplex: Duplex },
	Disconnected,
	Unknown,
}

/// Marks the device as failed and hands back `err`. The device is shut down once
/// the last reference to it is dropped.
fn fail<T: Transport>(device: &Device<T>, err: VirtioNetError) -> VirtioNetError {
	error!("Bring-up of virtio network device failed: {err}");
	device.fail();
	err
}

/// A virtio network adapter that completed bring-up.
///
/// Transmit and receive queues are created on request and keep the device alive.
/// The device is shut down when the adapter and all of its queues are gone.
pub struct NetAdapter<T: Transport> {
	// Dropped before `shared`, the control ring is deleted before the shutdown.
	ctrl_vq: Option<ControlQueue<T>>,
	shared: Arc<Shared<T>>,
	current_mac: [u8; 6],
	capabilities: Capabilities,
}

impl<T: Transport> NetAdapter<T> {
	/// Brings the device up until the data queues can be created.
	///
	/// Any failure marks the device as failed and shuts it down before returning.
	pub fn prepare_hardware(
		transport: T,
		slots: &[InterruptSlot],
		config: AdapterConfig,
	) -> Result<Self, VirtioNetError> {
		let device = Device::new(transport);

		device
			.initialize()
			.map_err(|err| fail(&device, err.into()))?;

		let negotiated = FeatureNegotiator::new(&config)
			.negotiate(&*device)
			.map_err(|err| fail(&device, err))?;

		let device_config =
			config::read_config(&*device, &negotiated).map_err(|err| fail(&device, err))?;

		let current_mac = config.mac_override.unwrap_or(device_config.mac);
		if config.mac_override.is_some() {
			info!("Using locally administered MAC address {current_mac:02x?}");
		}

		let topology = QueueTopology::from_device(&negotiated, &device_config, &config);
		let registry =
			InterruptRegistry::new(slots, topology).map_err(|err| fail(&device, err))?;

		let shared = Arc::new(Shared {
			device,
			negotiated,
			config: device_config,
			topology,
			registry,
			claimed: SpinMutex::new(BTreeSet::new()),
		});

		let ctrl_vq = if negotiated.has(Features::CTRL_VQ) {
			let mut queue = ControlQueue::prepare(Control, Arc::clone(&shared))
				.and_then(|mut queue| {
					queue.start()?;
					Ok(queue)
				})
				.map_err(|err| fail(&shared.device, err))?;
			queue.enable_notification(true);
			Some(queue)
		} else {
			warn!("Device has no control queue");
			None
		};

		let capabilities = Capabilities::new(&shared, current_mac);
		capabilities.print_information();

		shared.device.add_status(DeviceStatus::DRIVER_OK);

		Ok(Self {
			ctrl_vq,
			shared,
			current_mac,
			capabilities,
		})
	}

	/// Creates transmit queue `id`. A failure only affects this queue.
	pub fn create_tx_queue(&self, id: u16) -> Result<TxQueue<T>, VirtioNetError> {
		self.create_queue(Tx { id })
	}

	/// Creates receive queue `id`. A failure only affects this queue.
	pub fn create_rx_queue(&self, id: u16) -> Result<RxQueue<T>, VirtioNetError> {
		self.create_queue(Rx { id })
	}

	fn create_queue<K: queues::NetQueue>(&self, kind: K) -> Result<Queue<T, K>, VirtioNetError> {
		let target = kind.target();
		Queue::prepare(kind, Arc::clone(&self.shared)).inspect_err(|err| {
			warn!("Unable to create queue {target:?}: {err}");
		})
	}

	/// Releases the device. The control queue is destroyed first, the transport is shut
	/// down as soon as no data queue refers to the device anymore.
	pub fn release_hardware(self) {
		let control_queues = usize::from(self.ctrl_vq.is_some());
		let data_queues = self.shared.claimed_queues().saturating_sub(control_queues);
		if data_queues > 0 {
			warn!("Releasing virtio network device with {data_queues} data queues alive");
		}
		info!("Release virtio network device");
	}

	/// Entering the working state, reports the current link state.
	pub fn on_d0(&self) -> Result<LinkState, VirtioNetError> {
		let status = config::read_link_status(self.shared.transport(), &self.shared.negotiated)?;

		let state = if status.contains(LinkStatus::LINK_UP) {
			LinkState::Connected {
				speed: self.capabilities.link_speed,
				duplex: self.shared.config.duplex,
			}
		} else {
			LinkState::Disconnected
		};
		info!("Virtio network link: {state:?}");
		Ok(state)
	}

	/// Leaving the working state, the link state becomes unknown.
	pub fn on_dx(&self) -> LinkState {
		LinkState::Unknown
	}

	/// Number of entries of ring `index`, zero if the device does not report it.
	pub fn expected_queue_size(&self, index: u16) -> u16 {
		expected_queue_size(self.shared.transport(), index)
	}

	pub fn capabilities(&self) -> &Capabilities {
		&self.capabilities
	}

	pub fn negotiated(&self) -> &NegotiatedFeatures {
		&self.shared.negotiated
	}

	pub fn device_config(&self) -> &DeviceConfig {
		&self.shared.config
	}

	pub fn topology(&self) -> &QueueTopology {
		&self.shared.topology
	}

	/// The control queue, if the device provides one.
	pub fn control_queue(&self) -> Option<&ControlQueue<T>> {
		self.ctrl_vq.as_ref()
	}

	pub fn permanent_mac(&self) -> [u8; 6] {
		self.shared.config.mac
	}

	pub fn current_mac(&self) -> [u8; 6] {
		self.current_mac
	}

	pub fn interrupts(&self) -> &InterruptRegistry {
		&self.shared.registry
	}

	/// Decides in interrupt context whether `message` belongs to the adapter.
	pub fn on_interrupt_isr(&self, message: u16) -> bool {
		self.shared.registry.on_isr(message)
	}

	/// Names the queue to advance for `message`.
	pub fn on_interrupt_dpc(&self, message: u16) -> Option<QueueTarget> {
		self.shared.registry.on_dpc(message)
	}

	pub fn enable_interrupt(&self, message: u16) -> bool {
		self.shared.registry.enable(message)
	}

	pub fn disable_interrupt(&self, message: u16) -> bool {
		self.shared.registry.disable(message)
	}
}

pub mod error {
	use num_enum::{IntoPrimitive, TryFromPrimitive};
	use thiserror::Error;

	use super::features::Features;
	use crate::drivers::virtio::transport::TransportError;
	use crate::drivers::virtio::virtqueue::error::VirtqError;

	/// Reason a queue could not be prepared.
	#[derive(IntoPrimitive, TryFromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
	#[repr(u8)]
	pub enum PrepareFailure {
		/// The logical queue is not part of the topology.
		IndexOutOfRange = 1,
		/// The device does not provide the ring or reports no size for it.
		RingNotFound = 2,
		/// Bookkeeping memory for the ring could not be allocated.
		AllocationFailure = 3,
		/// No interrupt message could be bound to the ring.
		VectorBindFailure = 4,
		/// Another live queue already uses the ring.
		AlreadyClaimed = 5,
	}

	/// Network drivers error enum.
	#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
	pub enum VirtioNetError {
		#[error("device lacks mandatory features {0:?}")]
		MandatoryFeatureMissing(Features),
		#[error("device did not accept the features {0:?}")]
		FeaturesRejected(Features),
		#[error("reading {len} bytes of the device configuration failed")]
		ConfigReadFailure { len: usize, source: TransportError },
		#[error("{available} interrupts available, {required} required")]
		InsufficientInterrupts { available: usize, required: usize },
		#[error("preparing virtqueue {index} failed: {reason:?}")]
		QueuePrepareFailure { index: u16, reason: PrepareFailure },
		#[error("out of memory")]
		ResourceExhausted,
		#[error(transparent)]
		Queue(#[from] VirtqError),
		#[error(transparent)]
		Transport(#[from] TransportError),
	}
}
