//! Network drivers.

pub mod virtio;
