//! Common code for integration tests.
//!
//! [`Device`] emulates a virtio network device behind the [`Transport`] trait and
//! records the accesses of the driver.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use virtio::DeviceStatus;
use virtio_net_adapter::{QueueAllocation, Transport, TransportError, VqIndex, VqSize};

pub const RING_SIZE: u16 = 256;

#[derive(Default)]
pub struct Accesses {
	pub status: DeviceStatus,
	pub driver_features: Vec<virtio::F>,
	pub config_reads: Vec<(usize, usize)>,
	pub live: BTreeSet<u16>,
	pub vectors: BTreeMap<u16, u16>,
	pub deleted: Vec<u16>,
	pub shutdowns: usize,
}

#[derive(Clone)]
pub struct Device {
	features: virtio::F,
	rings: u16,
	config: [u8; 24],
	accesses: Arc<Mutex<Accesses>>,
}

impl Device {
	/// A device with `max_queue_pairs` queue pairs and the given MAC.
	pub fn new(features: virtio::F, max_queue_pairs: u16, mac: [u8; 6]) -> Self {
		let mut config = [0; 24];
		config[..6].copy_from_slice(&mac);
		config[6..8].copy_from_slice(&1u16.to_le_bytes());
		config[8..10].copy_from_slice(&max_queue_pairs.to_le_bytes());
		Self {
			features,
			rings: max_queue_pairs * 2 + 1,
			config,
			accesses: Arc::default(),
		}
	}

	pub fn accesses(&self) -> MutexGuard<'_, Accesses> {
		self.accesses.lock().unwrap()
	}
}

pub struct Ring(u16);

impl Transport for Device {
	type Ring = Ring;

	fn reset(&self) -> Result<(), TransportError> {
		self.accesses().status = DeviceStatus::empty();
		Ok(())
	}

	fn shutdown(&self) {
		let mut accesses = self.accesses();
		accesses.shutdowns += 1;
		accesses.status = DeviceStatus::empty();
	}

	fn status(&self) -> DeviceStatus {
		self.accesses().status
	}

	fn set_status(&self, status: DeviceStatus) {
		self.accesses().status = status;
	}

	fn device_features(&self) -> virtio::F {
		self.features
	}

	fn set_driver_features(&self, features: virtio::F) -> Result<(), TransportError> {
		self.accesses().driver_features.push(features);
		Ok(())
	}

	fn read_config(&self, offset: usize, buf: &mut [u8]) -> Result<(), TransportError> {
		self.accesses().config_reads.push((offset, buf.len()));
		let src = self
			.config
			.get(offset..offset + buf.len())
			.ok_or(TransportError::OutOfRange {
				offset,
				len: buf.len(),
			})?;
		buf.copy_from_slice(src);
		Ok(())
	}

	fn query_queue_allocation(&self, index: VqIndex) -> Result<QueueAllocation, TransportError> {
		let index = u16::from(index);
		if index >= self.rings {
			return Err(TransportError::NoQueue(index));
		}
		Ok(QueueAllocation {
			num_entries: RING_SIZE,
			ring_size: usize::from(RING_SIZE) * 16,
			heap_size: usize::from(RING_SIZE) * 16,
		})
	}

	fn find_queue(&self, index: VqIndex) -> Result<Ring, TransportError> {
		let index = u16::from(index);
		if index >= self.rings {
			return Err(TransportError::NoQueue(index));
		}
		self.accesses().live.insert(index);
		Ok(Ring(index))
	}

	fn queue_size(&self, _ring: &Ring) -> VqSize {
		VqSize::from(RING_SIZE)
	}

	fn set_queue_vector(&self, ring: &Ring, vector: u16) -> Result<(), TransportError> {
		self.accesses().vectors.insert(ring.0, vector);
		Ok(())
	}

	fn delete_queue(&self, ring: Ring) {
		let mut accesses = self.accesses();
		accesses.live.remove(&ring.0);
		accesses.deleted.push(ring.0);
	}
}
