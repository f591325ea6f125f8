//! Access to a virtio device, independent of the underlying bus.
//!
//! The drivers never touch registers themselves. Everything they need from the device,
//! status handshake, feature words, the device specific configuration space and the
//! virtqueue registers, goes through an implementation of [`Transport`].

use core::ops::Deref;

use virtio::DeviceStatus;

pub use self::error::TransportError;
use crate::drivers::virtio::virtqueue::{VqIndex, VqSize};

/// Memory requirements of a single virtqueue as reported by the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueAllocation {
	/// Number of ring entries.
	pub num_entries: u16,
	/// Size of the ring memory in bytes.
	pub ring_size: usize,
	/// Size of the bookkeeping memory the driver has to provide in bytes.
	pub heap_size: usize,
}

/// Bus specific access to a virtio device.
pub trait Transport: Send + Sync {
	/// Handle to a hardware ring that was found on the device.
	type Ring: Send;

	/// Resets the device and waits until the reset has been acknowledged.
	fn reset(&self) -> Result<(), TransportError>;

	/// Returns the device into its reset state and releases all bus resources.
	fn shutdown(&self);

	fn status(&self) -> DeviceStatus;

	/// Overwrites the complete device status.
	fn set_status(&self, status: DeviceStatus);

	/// Returns the features offered by the device.
	///
	/// Buses expose the features as 32 bit words, implementations assemble them
	/// like `virtio::F::from_bits_retain(u128::from(word).into())`.
	fn device_features(&self) -> virtio::F;

	/// Writes the features accepted by the driver.
	fn set_driver_features(&self, features: virtio::F) -> Result<(), TransportError>;

	/// Reads `buf.len()` bytes of the device specific configuration starting at `offset`.
	fn read_config(&self, offset: usize, buf: &mut [u8]) -> Result<(), TransportError>;

	/// Queries how much memory the queue at `index` requires.
	fn query_queue_allocation(&self, index: VqIndex) -> Result<QueueAllocation, TransportError>;

	/// Looks up the hardware ring at `index`.
	fn find_queue(&self, index: VqIndex) -> Result<Self::Ring, TransportError>;

	/// Size of the ring, as fixed by the device. A size of zero marks a ring
	/// the device does not provide.
	fn queue_size(&self, ring: &Self::Ring) -> VqSize;

	/// Routes the interrupts of `ring` to the message `vector`.
	fn set_queue_vector(&self, ring: &Self::Ring, vector: u16) -> Result<(), TransportError>;

	/// Hands the ring back to the device.
	fn delete_queue(&self, ring: Self::Ring);

	/// Resets the device and announces the driver.
	fn initialize(&self) -> Result<(), TransportError> {
		self.reset()?;

		// Indicate device, that OS noticed it
		self.add_status(DeviceStatus::ACKNOWLEDGE);

		// Indicate device, that driver is able to handle it
		self.add_status(DeviceStatus::DRIVER);

		Ok(())
	}

	/// Sets `bits` in the device status while keeping the already set bits.
	fn add_status(&self, bits: DeviceStatus) {
		let status = self.status();
		self.set_status(status | bits);
	}
}

/// Owns a transport for the lifetime of a driver and shuts the device down
/// once it is dropped.
pub struct Device<T: Transport> {
	transport: T,
}

impl<T: Transport> Device<T> {
	pub fn new(transport: T) -> Self {
		Self { transport }
	}

	/// Marks the device as failed. The device is shut down when the handle is dropped.
	pub fn fail(&self) {
		self.transport.add_status(DeviceStatus::FAILED);
	}
}

impl<T: Transport> Deref for Device<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.transport
	}
}

impl<T: Transport> Drop for Device<T> {
	fn drop(&mut self) {
		debug!("Shut down virtio device");
		self.transport.shutdown();
	}
}

pub mod error {
	use thiserror::Error;

	#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
	pub enum TransportError {
		#[error("device did not leave the reset state")]
		NotReady,
		#[error("device does not provide a virtqueue with index {0}")]
		NoQueue(u16),
		#[error("access of {len} bytes at offset {offset:#x} exceeds the configuration space")]
		OutOfRange { offset: usize, len: usize },
		#[error("device rejected interrupt vector {0:#x}")]
		VectorRejected(u16),
		#[error("unknown transport failure")]
		General,
	}
}
