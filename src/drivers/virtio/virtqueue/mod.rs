//! This module contains Virtio's virtqueue.
//!
//! A [VirtQueue] owns exactly one hardware ring of the device together with the
//! interrupt vector the ring is bound to and the memory the driver keeps for the
//! ring's descriptors. The specific network queues build on top of it.

use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use self::error::VirtqError;
use super::transport::Transport;

/// A u16 newtype. If instantiated via ``VqIndex::from(T)``, the newtype is ensured to be
/// smaller-equal to `min(u16::MAX , T::MAX)`.
///
/// Currently implements `From<u16>` and `From<u32>`.
#[derive(Copy, Clone, Debug, PartialOrd, Ord, PartialEq, Eq)]
pub struct VqIndex(u16);

impl From<u16> for VqIndex {
	fn from(val: u16) -> Self {
		VqIndex(val)
	}
}

impl From<VqIndex> for u16 {
	fn from(i: VqIndex) -> Self {
		i.0
	}
}

impl From<u32> for VqIndex {
	fn from(val: u32) -> Self {
		match u16::try_from(val) {
			Ok(val) => VqIndex(val),
			Err(_) => VqIndex(u16::MAX),
		}
	}
}

/// A u16 newtype. If instantiated via ``VqSize::from(T)``, the newtype is ensured to be
/// smaller-equal to `min(u16::MAX , T::MAX)`.
///
/// Currently implements `From<u16>` and `From<u32>`.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Eq)]
pub struct VqSize(u16);

impl From<u16> for VqSize {
	fn from(val: u16) -> Self {
		VqSize(val)
	}
}

impl From<u32> for VqSize {
	fn from(val: u32) -> Self {
		match u16::try_from(val) {
			Ok(val) => VqSize(val),
			Err(_) => VqSize(u16::MAX),
		}
	}
}

impl From<VqSize> for u16 {
	fn from(val: VqSize) -> Self {
		val.0
	}
}

/// Lifecycle of a virtqueue.
///
/// ```text
/// Created -> Prepared -> Started <-> Stopped
///                 \          \          \
///                  +----------+----------+--> Destroyed
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
	Created,
	Prepared,
	Started,
	Stopped,
	Destroyed,
}

/// Descriptor ids and bookkeeping memory of one ring.
///
/// Both are reserved up front, the pool never grows after construction.
struct MemPool {
	/// Free descriptor ids.
	pool: Vec<u16>,
	heap: Vec<u8>,
	limit: u16,
}

impl MemPool {
	/// Returns a new instance, with a pool of the specified size and `heap_size`
	/// zeroed bytes of bookkeeping memory.
	fn try_new(size: u16, heap_size: usize) -> Result<MemPool, TryReserveError> {
		let mut heap = Vec::new();
		heap.try_reserve_exact(heap_size)?;
		heap.resize(heap_size, 0);

		let mut pool = Vec::new();
		pool.try_reserve_exact(usize::from(size))?;
		pool.extend(1..=size);

		Ok(MemPool {
			pool,
			heap,
			limit: size,
		})
	}

	fn available(&self) -> usize {
		self.pool.len()
	}
}

/// A hardware ring together with its interrupt binding.
///
/// The ring handle is held as long as the queue is prepared. [`VirtQueue::destroy`]
/// hands it back to the device, afterwards the queue is unusable.
pub struct VirtQueue<R> {
	index: VqIndex,
	size: VqSize,
	vector: u16,
	ring: Option<R>,
	mem_pool: Option<MemPool>,
	state: QueueState,
	notifications: bool,
}

impl<R> VirtQueue<R> {
	pub fn new(index: VqIndex) -> Self {
		Self {
			index,
			size: VqSize(0),
			vector: 0,
			ring: None,
			mem_pool: None,
			state: QueueState::Created,
			notifications: false,
		}
	}

	/// Attaches the queue to the ring of the device and binds the ring to `vector`.
	///
	/// On failure every acquired resource is released again and the queue remains
	/// in [`QueueState::Created`].
	pub fn init_queue<T>(&mut self, transport: &T, vector: u16) -> Result<(), VirtqError>
	where
		T: Transport<Ring = R>,
	{
		self.expect_state("init", &[QueueState::Created])?;
		let index = u16::from(self.index);

		let ring = transport
			.find_queue(self.index)
			.map_err(|_| VirtqError::QueueNotExisting(index))?;

		let size = transport.queue_size(&ring);
		if u16::from(size) == 0 {
			transport.delete_queue(ring);
			return Err(VirtqError::QueueNotExisting(index));
		}

		let allocation = match transport.query_queue_allocation(self.index) {
			Ok(allocation) => allocation,
			Err(_) => {
				transport.delete_queue(ring);
				return Err(VirtqError::QueueNotExisting(index));
			}
		};

		let mem_pool = match MemPool::try_new(size.into(), allocation.heap_size) {
			Ok(pool) => pool,
			Err(err) => {
				warn!("Unable to allocate bookkeeping for virtqueue {index}: {err}");
				transport.delete_queue(ring);
				return Err(VirtqError::AllocationError(index));
			}
		};

		if let Err(err) = transport.set_queue_vector(&ring, vector) {
			warn!("Unable to bind virtqueue {index} to vector {vector:#x}: {err}");
			transport.delete_queue(ring);
			return Err(VirtqError::VectorBinding { index, vector });
		}

		trace!(
			"Virtqueue {index} initialized with {} entries on vector {vector:#x}",
			u16::from(size)
		);

		self.size = size;
		self.vector = vector;
		self.ring = Some(ring);
		self.mem_pool = Some(mem_pool);
		self.state = QueueState::Prepared;
		Ok(())
	}

	/// Lets the queue take part in notification processing.
	pub fn start(&mut self) -> Result<(), VirtqError> {
		self.expect_state("start", &[QueueState::Prepared, QueueState::Stopped])?;
		self.state = QueueState::Started;
		Ok(())
	}

	/// Stops notification processing. Stopping a stopped queue has no effect.
	pub fn stop(&mut self) -> Result<(), VirtqError> {
		if self.state == QueueState::Stopped {
			return Ok(());
		}
		self.expect_state("stop", &[QueueState::Started])?;
		self.state = QueueState::Stopped;
		Ok(())
	}

	/// Requests or suppresses notifications for completed buffers.
	///
	/// The device may ignore the request, so it only serves as a hint.
	pub fn enable_notification(&mut self, enable: bool) {
		self.notifications = enable;
	}

	/// Processes the completions signalled by the device.
	pub fn advance(&mut self) -> Result<(), VirtqError> {
		self.expect_state("advance", &[QueueState::Started])?;
		trace!("Advance virtqueue {}", self.index.0);
		Ok(())
	}

	/// Releases the ring. Only the first call has an effect.
	pub fn destroy<T>(&mut self, transport: &T)
	where
		T: Transport<Ring = R>,
	{
		if let Some(ring) = self.ring.take() {
			debug!("Delete virtqueue {}", self.index.0);
			transport.delete_queue(ring);
		}
		self.mem_pool = None;
		self.notifications = false;
		self.state = QueueState::Destroyed;
	}

	pub fn index(&self) -> VqIndex {
		self.index
	}

	pub fn size(&self) -> VqSize {
		self.size
	}

	pub fn vector(&self) -> u16 {
		self.vector
	}

	pub fn state(&self) -> QueueState {
		self.state
	}

	pub fn notifications_enabled(&self) -> bool {
		self.notifications
	}

	/// Number of descriptor ids that are not in use.
	pub fn free_descriptors(&self) -> usize {
		self.mem_pool.as_ref().map_or(0, MemPool::available)
	}

	/// Bytes of bookkeeping memory held for the ring.
	pub fn reserved_bytes(&self) -> usize {
		self.mem_pool.as_ref().map_or(0, |pool| pool.heap.len())
	}

	/// Highest descriptor id of the ring.
	pub fn descriptor_limit(&self) -> u16 {
		self.mem_pool.as_ref().map_or(0, |pool| pool.limit)
	}

	fn expect_state(&self, op: &'static str, allowed: &[QueueState]) -> Result<(), VirtqError> {
		if allowed.contains(&self.state) {
			Ok(())
		} else {
			Err(VirtqError::InvalidState {
				op,
				state: self.state,
			})
		}
	}
}

pub mod error {
	use thiserror::Error;

	use super::QueueState;

	#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
	pub enum VirtqError {
		/// The operation is not permitted in the current state of the queue.
		#[error("cannot {op} virtqueue in state {state:?}")]
		InvalidState {
			op: &'static str,
			state: QueueState,
		},
		/// Selected queue does not exist or
		/// is not known to the device and hence can not be used
		#[error("virtqueue {0} does not exist")]
		QueueNotExisting(u16),
		#[error("bookkeeping for virtqueue {0} could not be allocated")]
		AllocationError(u16),
		#[error("virtqueue {index} could not be bound to vector {vector:#x}")]
		VectorBinding { index: u16, vector: u16 },
	}
}
