//! Interrupt messages assigned to the adapter and their routing to queues.
//!
//! The routing functions run in interrupt context. They neither allocate nor
//! block, the per message enable state is kept in atomics.

use core::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

use super::error::VirtioNetError;
use super::queues::QueueTopology;
use crate::config::MAX_INTERRUPTS;

const SLOT_INLINE_SIZE: usize = 8;

/// One interrupt message provided by the platform.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InterruptSlot {
	/// Message number the device signals.
	pub message_number: u16,
	/// Platform vector behind the message. Zero marks an unassigned slot.
	pub vector: u32,
}

impl InterruptSlot {
	pub const fn new(message_number: u16, vector: u32) -> Self {
		Self {
			message_number,
			vector,
		}
	}

	pub fn is_assigned(&self) -> bool {
		self.vector != 0
	}
}

/// Queue an interrupt message belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueTarget {
	Rx(u16),
	Tx(u16),
	Control,
}

/// Counts the usable slots and checks that they cover `active_queue_pairs`.
///
/// Slots are packed to the front, the first unassigned slot ends the table.
pub fn check_interrupts(
	slots: &[InterruptSlot],
	active_queue_pairs: u16,
) -> Result<usize, VirtioNetError> {
	let available = slots
		.iter()
		.take(MAX_INTERRUPTS)
		.take_while(|slot| slot.is_assigned())
		.count();
	let required = usize::from(active_queue_pairs) * 2 + 1;

	if available < required {
		error!("{available} interrupts available, {active_queue_pairs} queue pairs need {required}");
		return Err(VirtioNetError::InsufficientInterrupts {
			available,
			required,
		});
	}

	Ok(available)
}

/// The validated interrupt slots of an adapter.
pub struct InterruptRegistry {
	slots: SmallVec<[InterruptSlot; SLOT_INLINE_SIZE]>,
	enabled: SmallVec<[AtomicBool; SLOT_INLINE_SIZE]>,
	topology: QueueTopology,
}

impl InterruptRegistry {
	/// Records the usable slots. Fails if they do not suffice for `topology`.
	///
	/// Every message starts disabled.
	pub fn new(slots: &[InterruptSlot], topology: QueueTopology) -> Result<Self, VirtioNetError> {
		let available = check_interrupts(slots, topology.active_queue_pairs())?;

		let mut valid = SmallVec::new_const();
		valid
			.try_reserve_exact(available)
			.map_err(|_| VirtioNetError::ResourceExhausted)?;
		valid.extend_from_slice(&slots[..available]);

		let mut enabled = SmallVec::new_const();
		enabled
			.try_reserve_exact(available)
			.map_err(|_| VirtioNetError::ResourceExhausted)?;
		enabled.extend((0..available).map(|_| AtomicBool::new(false)));

		for (slot, interrupt) in valid.iter().enumerate() {
			trace!(
				"Interrupt slot {slot}: message {}, vector {:#x}",
				interrupt.message_number, interrupt.vector
			);
		}

		Ok(Self {
			slots: valid,
			enabled,
			topology,
		})
	}

	/// Number of usable slots.
	pub fn available(&self) -> usize {
		self.slots.len()
	}

	/// Message number of slot `slot`.
	pub fn message_for(&self, slot: usize) -> Option<u16> {
		self.slots.get(slot).map(|slot| slot.message_number)
	}

	fn slot_of(&self, message: u16) -> Option<usize> {
		self.slots
			.iter()
			.position(|slot| slot.message_number == message)
	}

	/// Allows delivery of `message`. Returns `false` for unknown messages.
	pub fn enable(&self, message: u16) -> bool {
		self.set_enabled(message, true)
	}

	/// Suppresses delivery of `message`. Returns `false` for unknown messages.
	pub fn disable(&self, message: u16) -> bool {
		self.set_enabled(message, false)
	}

	fn set_enabled(&self, message: u16, enable: bool) -> bool {
		match self.slot_of(message) {
			Some(slot) => {
				self.enabled[slot].store(enable, Ordering::Release);
				true
			}
			None => false,
		}
	}

	pub fn is_enabled(&self, message: u16) -> bool {
		self.slot_of(message)
			.is_some_and(|slot| self.enabled[slot].load(Ordering::Acquire))
	}

	/// Decides whether the adapter claims `message`.
	pub fn on_isr(&self, message: u16) -> bool {
		self.is_enabled(message)
	}

	/// Names the queue that has to be advanced for `message`.
	pub fn on_dpc(&self, message: u16) -> Option<QueueTarget> {
		self.slot_of(message)
			.and_then(|slot| self.topology.target_of_slot(slot))
	}
}
