//! Feature negotiation and virtqueue lifecycle for virtio network adapters.
//!
//! The crate drives the bring-up of a virtio-net device up to the point where the
//! data path can attach: it negotiates feature bits, reads the device configuration,
//! validates the interrupt allocation, prepares the control queue and afterwards admits
//! transmit and receive queues on demand.
//!
//! Access to the device itself is abstracted by the [`Transport`] trait.

#![warn(clippy::all)]
#![allow(clippy::redundant_field_names)]
#![allow(clippy::identity_op)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::tabs_in_doc_comments)]
#![no_std]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate std;

#[macro_use]
mod logging;

pub mod config;
pub mod drivers;

pub use crate::config::AdapterConfig;
pub use crate::drivers::net::virtio::config::{DeviceConfig, Duplex, LinkStatus};
pub use crate::drivers::net::virtio::error::{PrepareFailure, VirtioNetError};
pub use crate::drivers::net::virtio::features::{
	AdapterFlags, CTRL_RX_EXTRA, Features, NegotiatedFeatures,
};
pub use crate::drivers::net::virtio::interrupts::{InterruptRegistry, InterruptSlot, QueueTarget};
pub use crate::drivers::net::virtio::queues::{
	ControlQueue, Direction, PacketExtensions, QueueTopology, RxQueue, TxQueue,
};
pub use crate::drivers::net::virtio::{
	Capabilities, LinkState, LsoCapabilities, NetAdapter, PacketFilters,
};
pub use crate::drivers::virtio::transport::{QueueAllocation, Transport, TransportError};
pub use crate::drivers::virtio::virtqueue::{QueueState, VqIndex, VqSize};
