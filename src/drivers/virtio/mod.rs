//! A module containing virtios core infrastructure.
//!
//! The module contains the transport abstraction and the virtqueue lifecycle
//! shared by all virtio drivers.
pub mod transport;
pub mod virtqueue;

pub mod error {
	pub use super::transport::error::TransportError;
	pub use super::virtqueue::error::VirtqError;
}
