//! A module containing the drivers and the infrastructure shared between them.

pub mod net;
pub mod virtio;
