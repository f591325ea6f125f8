//! Transmit, receive and control queues of the network device.
//!
//! All three kinds share the lifecycle of [`VirtQueue`]. They differ in how the
//! ring index and the interrupt message are derived and which packet extensions
//! the data path has to register for them.

use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;

use super::Shared;
use super::config::DeviceConfig;
use super::error::{PrepareFailure, VirtioNetError};
use super::features::{AdapterFlags, Features, NegotiatedFeatures};
use super::interrupts::QueueTarget;
use crate::config::{AdapterConfig, MAX_QUEUE_PAIRS};
use crate::drivers::virtio::transport::Transport;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::drivers::virtio::virtqueue::{QueueState, VirtQueue, VqIndex, VqSize};

/// Largest number of queue pairs whose control queue index still fits into 16 bits.
const MAX_DEVICE_QUEUE_PAIRS: u16 = 0x7fff;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Direction {
	Rx = 0,
	Tx = 1,
}

/// Assignment of hardware rings to logical queues.
///
/// Receive and transmit rings alternate, `index = id * 2 + direction`, the control
/// queue follows the last pair the device provides.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
	max_queue_pairs: u16,
	active_queue_pairs: u16,
}

impl QueueTopology {
	pub fn new(max_queue_pairs: u16, active_queue_pairs: u16) -> Self {
		let max_queue_pairs = max_queue_pairs.clamp(1, MAX_DEVICE_QUEUE_PAIRS);
		Self {
			max_queue_pairs,
			active_queue_pairs: active_queue_pairs.clamp(1, max_queue_pairs),
		}
	}

	/// Derives the topology from the negotiated features and the device configuration.
	///
	/// Without [`Features::MQ`] the device provides exactly one pair. The active pairs
	/// never exceed [`MAX_QUEUE_PAIRS`], the interrupt table holds no more messages.
	pub fn from_device(
		negotiated: &NegotiatedFeatures,
		config: &DeviceConfig,
		adapter: &AdapterConfig,
	) -> Self {
		if negotiated.has(Features::MQ) {
			let max = config.max_virtqueue_pairs.clamp(1, MAX_DEVICE_QUEUE_PAIRS);
			let limit = adapter.max_queue_pairs.min(MAX_QUEUE_PAIRS);
			Self::new(max, max.min(limit))
		} else {
			Self::new(1, 1)
		}
	}

	pub fn max_queue_pairs(&self) -> u16 {
		self.max_queue_pairs
	}

	pub fn active_queue_pairs(&self) -> u16 {
		self.active_queue_pairs
	}

	pub fn control_index(&self) -> VqIndex {
		VqIndex::from(self.max_queue_pairs * 2)
	}

	/// Number of rings the device provides, data rings and the control ring.
	pub fn total_queues(&self) -> u16 {
		self.max_queue_pairs * 2 + 1
	}

	/// Ring index of a data queue or `None` if `id` is not an active pair.
	pub fn ring_index(&self, direction: Direction, id: u16) -> Option<VqIndex> {
		if id < self.active_queue_pairs {
			Some(VqIndex::from(id * 2 + direction as u16))
		} else {
			None
		}
	}

	/// Number of interrupt messages the topology needs.
	pub fn required_interrupts(&self) -> usize {
		usize::from(self.active_queue_pairs) * 2 + 1
	}

	/// Interrupt slot of the control queue, the last one that is guaranteed to exist.
	pub fn control_vector_slot(&self) -> usize {
		usize::from(self.active_queue_pairs) * 2
	}

	/// Queue served by interrupt slot `slot`.
	pub fn target_of_slot(&self, slot: usize) -> Option<QueueTarget> {
		let control = self.control_vector_slot();
		if slot < control {
			let id = u16::try_from(slot / 2).ok()?;
			if slot % 2 == Direction::Rx as usize {
				Some(QueueTarget::Rx(id))
			} else {
				Some(QueueTarget::Tx(id))
			}
		} else if slot == control {
			Some(QueueTarget::Control)
		} else {
			None
		}
	}
}

bitflags! {
	/// Per packet metadata the data path of a queue makes use of.
	#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
	pub struct PacketExtensions: u8 {
		const CHECKSUM = 1 << 0;
		const LSO = 1 << 1;
		const VIRTUAL_ADDRESS = 1 << 2;
		const LOGICAL_ADDRESS = 1 << 3;
	}
}

/// The kind of a network queue.
pub trait NetQueue: Send + fmt::Debug {
	const NAME: &'static str;

	/// Ring index, not yet checked against the topology.
	fn raw_index(&self, topology: &QueueTopology) -> u32;

	/// Whether the queue is part of `topology`.
	fn in_range(&self, topology: &QueueTopology) -> bool;

	/// Interrupt slot whose message the ring is bound to.
	fn vector_slot(&self, topology: &QueueTopology) -> usize;

	fn extensions(&self, flags: AdapterFlags) -> PacketExtensions;

	fn target(&self) -> QueueTarget;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tx {
	pub id: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rx {
	pub id: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Control;

fn data_index(direction: Direction, id: u16) -> u32 {
	u32::from(id) * 2 + direction as u32
}

impl NetQueue for Tx {
	const NAME: &'static str = "tx";

	fn raw_index(&self, _topology: &QueueTopology) -> u32 {
		data_index(Direction::Tx, self.id)
	}

	fn in_range(&self, topology: &QueueTopology) -> bool {
		topology.ring_index(Direction::Tx, self.id).is_some()
	}

	fn vector_slot(&self, topology: &QueueTopology) -> usize {
		self.raw_index(topology) as usize
	}

	fn extensions(&self, flags: AdapterFlags) -> PacketExtensions {
		let mut extensions = PacketExtensions::VIRTUAL_ADDRESS | PacketExtensions::LOGICAL_ADDRESS;
		extensions.set(
			PacketExtensions::CHECKSUM,
			flags.contains(AdapterFlags::CHECKSUM),
		);
		extensions.set(
			PacketExtensions::LSO,
			flags.intersects(AdapterFlags::TSO4 | AdapterFlags::TSO6),
		);
		extensions
	}

	fn target(&self) -> QueueTarget {
		QueueTarget::Tx(self.id)
	}
}

impl NetQueue for Rx {
	const NAME: &'static str = "rx";

	fn raw_index(&self, _topology: &QueueTopology) -> u32 {
		data_index(Direction::Rx, self.id)
	}

	fn in_range(&self, topology: &QueueTopology) -> bool {
		topology.ring_index(Direction::Rx, self.id).is_some()
	}

	fn vector_slot(&self, topology: &QueueTopology) -> usize {
		self.raw_index(topology) as usize
	}

	fn extensions(&self, flags: AdapterFlags) -> PacketExtensions {
		let mut extensions = PacketExtensions::LOGICAL_ADDRESS;
		extensions.set(
			PacketExtensions::CHECKSUM,
			flags.contains(AdapterFlags::CHECKSUM),
		);
		extensions
	}

	fn target(&self) -> QueueTarget {
		QueueTarget::Rx(self.id)
	}
}

impl NetQueue for Control {
	const NAME: &'static str = "control";

	fn raw_index(&self, topology: &QueueTopology) -> u32 {
		u32::from(u16::from(topology.control_index()))
	}

	fn in_range(&self, _topology: &QueueTopology) -> bool {
		true
	}

	fn vector_slot(&self, topology: &QueueTopology) -> usize {
		topology.control_vector_slot()
	}

	fn extensions(&self, _flags: AdapterFlags) -> PacketExtensions {
		PacketExtensions::empty()
	}

	fn target(&self) -> QueueTarget {
		QueueTarget::Control
	}
}

/// A network queue bound to its hardware ring.
///
/// The queue keeps the adapter state alive. Dropping the queue destroys the ring.
pub struct Queue<T: Transport, K: NetQueue> {
	kind: K,
	vq: VirtQueue<T::Ring>,
	extensions: PacketExtensions,
	shared: Arc<Shared<T>>,
}

pub type TxQueue<T> = Queue<T, Tx>;
pub type RxQueue<T> = Queue<T, Rx>;
pub type ControlQueue<T> = Queue<T, Control>;

fn prepare_failure(index: u16, reason: PrepareFailure) -> VirtioNetError {
	VirtioNetError::QueuePrepareFailure { index, reason }
}

impl<T: Transport, K: NetQueue> Queue<T, K> {
	/// Claims the ring of `kind` and binds it to its interrupt message.
	///
	/// A failure leaves neither a claimed index nor an acquired ring behind.
	pub(crate) fn prepare(kind: K, shared: Arc<Shared<T>>) -> Result<Self, VirtioNetError> {
		let topology = shared.topology;
		let index = u16::try_from(kind.raw_index(&topology)).unwrap_or(u16::MAX);

		if !kind.in_range(&topology) {
			debug!(
				"{} queue {kind:?} is outside of {} active pairs",
				K::NAME,
				topology.active_queue_pairs()
			);
			return Err(prepare_failure(index, PrepareFailure::IndexOutOfRange));
		}

		if !shared.claim(index) {
			return Err(prepare_failure(index, PrepareFailure::AlreadyClaimed));
		}

		let Some(message) = shared.registry.message_for(kind.vector_slot(&topology)) else {
			shared.unclaim(index);
			return Err(prepare_failure(index, PrepareFailure::VectorBindFailure));
		};

		let mut vq = VirtQueue::new(VqIndex::from(index));
		if let Err(err) = vq.init_queue(shared.transport(), message) {
			shared.unclaim(index);
			let reason = match err {
				VirtqError::QueueNotExisting(_) => PrepareFailure::RingNotFound,
				VirtqError::AllocationError(_) => PrepareFailure::AllocationFailure,
				VirtqError::VectorBinding { .. } => PrepareFailure::VectorBindFailure,
				VirtqError::InvalidState { .. } => return Err(err.into()),
			};
			return Err(prepare_failure(index, reason));
		}

		let extensions = kind.extensions(shared.negotiated.flags);
		debug!(
			"Prepared {} queue at index {index} with {} entries, message {message}, extensions {extensions:?}",
			K::NAME,
			u16::from(vq.size())
		);

		Ok(Self {
			kind,
			vq,
			extensions,
			shared,
		})
	}

	pub fn start(&mut self) -> Result<(), VirtqError> {
		self.vq.start()
	}

	pub fn stop(&mut self) -> Result<(), VirtqError> {
		self.vq.stop()
	}

	pub fn enable_notification(&mut self, enable: bool) {
		self.vq.enable_notification(enable);
	}

	pub fn advance(&mut self) -> Result<(), VirtqError> {
		self.vq.advance()
	}

	/// Returns the ring to the device. Only the first call has an effect.
	pub fn destroy(&mut self) {
		if self.vq.state() == QueueState::Destroyed {
			return;
		}
		self.vq.destroy(self.shared.transport());
		self.shared.unclaim(self.index().into());
	}

	pub fn kind(&self) -> &K {
		&self.kind
	}

	pub fn target(&self) -> QueueTarget {
		self.kind.target()
	}

	pub fn index(&self) -> VqIndex {
		self.vq.index()
	}

	pub fn size(&self) -> VqSize {
		self.vq.size()
	}

	pub fn vector(&self) -> u16 {
		self.vq.vector()
	}

	pub fn state(&self) -> QueueState {
		self.vq.state()
	}

	pub fn notifications_enabled(&self) -> bool {
		self.vq.notifications_enabled()
	}

	/// Packet extensions the data path has to register for this queue.
	pub fn extensions(&self) -> PacketExtensions {
		self.extensions
	}
}

impl<T: Transport, K: NetQueue> Drop for Queue<T, K> {
	fn drop(&mut self) {
		self.destroy();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::MAX_INTERRUPTS;
	use crate::drivers::net::virtio::config::{Duplex, LinkStatus};
	use crate::drivers::net::virtio::features::{FeatureNegotiator, MANDATORY_FEATURES};

	#[test]
	fn data_indices_are_interleaved() {
		let topology = QueueTopology::new(4, 4);

		for id in 0..4 {
			let rx = u16::from(topology.ring_index(Direction::Rx, id).unwrap());
			let tx = u16::from(topology.ring_index(Direction::Tx, id).unwrap());
			assert_eq!(tx, rx + 1);
			assert_eq!(rx, id * 2);
			assert!(tx < u16::from(topology.control_index()));
		}
		assert_eq!(u16::from(topology.control_index()), 8);
		assert_eq!(topology.total_queues(), 9);
	}

	#[test]
	fn inactive_pairs_have_no_index() {
		let topology = QueueTopology::new(4, 2);

		assert!(topology.ring_index(Direction::Rx, 1).is_some());
		assert_eq!(topology.ring_index(Direction::Rx, 2), None);
		assert_eq!(topology.ring_index(Direction::Tx, 4), None);
		assert_eq!(u16::from(topology.control_index()), 8);
		assert_eq!(topology.required_interrupts(), 5);
		assert_eq!(topology.control_vector_slot(), 4);
	}

	#[test]
	fn topology_is_clamped() {
		let topology = QueueTopology::new(0, 3);
		assert_eq!(topology.max_queue_pairs(), 1);
		assert_eq!(topology.active_queue_pairs(), 1);

		let topology = QueueTopology::new(u16::MAX, u16::MAX);
		assert_eq!(u16::from(topology.control_index()), 0xfffe);
	}

	#[test]
	fn active_pairs_fit_the_interrupt_table() {
		let negotiated = FeatureNegotiator::new(&AdapterConfig::default())
			.select(MANDATORY_FEATURES | Features::MQ)
			.unwrap();
		let config = DeviceConfig {
			mac: [0; 6],
			status: LinkStatus::LINK_UP,
			max_virtqueue_pairs: 20,
			mtu: 0,
			speed: 10_000,
			duplex: Duplex::Full,
			rss_max_key_size: 0,
			rss_max_indirection_table_length: 0,
			supported_hash_types: 0,
		};
		let adapter = AdapterConfig {
			max_queue_pairs: 20,
			..AdapterConfig::default()
		};

		let topology = QueueTopology::from_device(&negotiated, &config, &adapter);

		assert_eq!(topology.max_queue_pairs(), 20);
		assert_eq!(topology.active_queue_pairs(), MAX_QUEUE_PAIRS);
		assert_eq!(topology.required_interrupts(), MAX_INTERRUPTS);
		assert_eq!(u16::from(topology.control_index()), 40);
	}

	#[test]
	fn slots_map_back_to_queues() {
		let topology = QueueTopology::new(2, 2);

		assert_eq!(topology.target_of_slot(0), Some(QueueTarget::Rx(0)));
		assert_eq!(topology.target_of_slot(1), Some(QueueTarget::Tx(0)));
		assert_eq!(topology.target_of_slot(3), Some(QueueTarget::Tx(1)));
		assert_eq!(topology.target_of_slot(4), Some(QueueTarget::Control));
		assert_eq!(topology.target_of_slot(5), None);
	}

	#[test]
	fn extensions_follow_capabilities() {
		let none = AdapterFlags::empty();
		let offloads = AdapterFlags::CHECKSUM | AdapterFlags::TSO4;

		assert_eq!(
			Tx { id: 0 }.extensions(none),
			PacketExtensions::VIRTUAL_ADDRESS | PacketExtensions::LOGICAL_ADDRESS
		);
		assert_eq!(
			Tx { id: 0 }.extensions(offloads),
			PacketExtensions::all()
		);
		assert_eq!(Rx { id: 0 }.extensions(none), PacketExtensions::LOGICAL_ADDRESS);
		assert_eq!(
			Rx { id: 0 }.extensions(offloads),
			PacketExtensions::LOGICAL_ADDRESS | PacketExtensions::CHECKSUM
		);
		assert!(Control.extensions(offloads).is_empty());
	}
}
