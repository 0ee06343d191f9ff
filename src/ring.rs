//! Fixed-capacity buffer rings shared with the radio hardware.
//!
//! Each slot carries an explicit ownership status; the status field is the
//! only synchronization between interrupt and task context, so software must
//! never read a hardware-owned slot's payload. Hardware-side transitions are
//! exposed as `hw_*` methods for the interrupt glue (and for mock radios in
//! tests).

use crate::types::{RawTicks, MAX_DATA_PAYLOAD};

/// Receive slots per ring.
pub const RX_RING_LEN: usize = 20;
/// Transmit slots per ring.
pub const TX_RING_LEN: usize = 12;
/// Receive slot payload capacity: header (2) + payload + appended status.
pub const RX_SLOT_LEN: usize = 64;

/// Slot ownership.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotStatus {
    /// Unused, available to software.
    Free,
    /// Handed to the hardware; payload must not be read.
    HwOwned,
    /// Finished by the hardware, not yet consumed by software.
    SwUnread,
    /// Consumed by the hardware, waiting to be reclaimed.
    Released,
}

/// Logical link identifier of a data-channel PDU.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Llid {
    /// Continuation fragment of a message.
    DataCont = 1,
    /// Start of a message, or a complete message.
    DataStart = 2,
    /// Link-control PDU.
    Control = 3,
}

impl Llid {
    pub fn from_bits(bits: u8) -> Option<Llid> {
        match bits {
            1 => Some(Llid::DataCont),
            2 => Some(Llid::DataStart),
            3 => Some(Llid::Control),
            _ => None,
        }
    }
}

/// One receive slot.
pub struct RxSlot {
    status: SlotStatus,
    len: u8,
    /// Raw timer value captured by the hardware at packet receipt.
    timestamp: RawTicks,
    data: [u8; RX_SLOT_LEN],
}

impl RxSlot {
    const fn new() -> Self {
        Self {
            status: SlotStatus::HwOwned,
            len: 0,
            timestamp: 0,
            data: [0; RX_SLOT_LEN],
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn timestamp(&self) -> RawTicks {
        self.timestamp
    }

    /// Payload of a finished slot. Empty unless software owns the slot.
    pub fn payload(&self) -> &[u8] {
        if self.status == SlotStatus::SwUnread {
            &self.data[..self.len as usize]
        } else {
            &[]
        }
    }
}

/// Circular receive ring. All slots start hardware-owned; the hardware fills
/// them in ring order and software consumes them strictly from the cursor,
/// no gap-skipping.
pub struct RxRing {
    slots: [RxSlot; RX_RING_LEN],
    /// Next slot software will consume.
    cursor: usize,
    /// Next slot the hardware will fill.
    hw_cursor: usize,
}

impl RxRing {
    pub fn new() -> Self {
        Self {
            slots: [const { RxSlot::new() }; RX_RING_LEN],
            cursor: 0,
            hw_cursor: 0,
        }
    }

    /// Index of the next finished slot, if the slot at the cursor is ready.
    pub fn next_finished(&self) -> Option<usize> {
        if self.slots[self.cursor].status == SlotStatus::SwUnread {
            Some(self.cursor)
        } else {
            None
        }
    }

    pub fn slot(&self, index: usize) -> &RxSlot {
        &self.slots[index]
    }

    /// Return a consumed slot to the hardware and advance the cursor.
    pub fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.len = 0;
        slot.status = SlotStatus::HwOwned;
        if index == self.cursor {
            self.cursor = (self.cursor + 1) % RX_RING_LEN;
        }
    }

    /// Hardware-side: finish the next hardware-owned slot with a received
    /// frame. Returns `false` if the ring is saturated or the frame does not
    /// fit.
    pub fn hw_complete(&mut self, frame: &[u8], timestamp: RawTicks) -> bool {
        if frame.len() > RX_SLOT_LEN {
            return false;
        }
        let slot = &mut self.slots[self.hw_cursor];
        if slot.status != SlotStatus::HwOwned {
            return false;
        }
        slot.data[..frame.len()].copy_from_slice(frame);
        slot.len = frame.len() as u8;
        slot.timestamp = timestamp;
        slot.status = SlotStatus::SwUnread;
        self.hw_cursor = (self.hw_cursor + 1) % RX_RING_LEN;
        true
    }
}

impl Default for RxRing {
    fn default() -> Self {
        Self::new()
    }
}

/// One transmit slot. The queued flag tracks hand-over to the radio command
/// queue, distinct from the hardware ownership status.
pub struct TxSlot {
    status: SlotStatus,
    queued: bool,
    llid: Llid,
    len: u8,
    data: [u8; MAX_DATA_PAYLOAD],
}

impl TxSlot {
    const fn new() -> Self {
        Self {
            status: SlotStatus::Free,
            queued: false,
            llid: Llid::DataStart,
            len: 0,
            data: [0; MAX_DATA_PAYLOAD],
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn llid(&self) -> Llid {
        self.llid
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Transmit ring. Slots are acquired by software, consumed by the hardware
/// during connection events, and reclaimed after completion.
pub struct TxRing {
    slots: [TxSlot; TX_RING_LEN],
}

impl TxRing {
    pub fn new() -> Self {
        Self {
            slots: [const { TxSlot::new() }; TX_RING_LEN],
        }
    }

    /// Claim the lowest-index free slot. `None` means the ring is saturated
    /// and the caller must apply backpressure.
    pub fn acquire_free(&mut self) -> Option<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.status == SlotStatus::Free {
                slot.status = SlotStatus::HwOwned;
                slot.queued = false;
                slot.len = 0;
                return Some(i);
            }
        }
        None
    }

    /// Fill a previously acquired slot.
    pub fn write(&mut self, index: usize, llid: Llid, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_DATA_PAYLOAD);
        let slot = &mut self.slots[index];
        slot.llid = llid;
        slot.len = payload.len() as u8;
        slot.data[..payload.len()].copy_from_slice(payload);
    }

    /// Acquire and fill in one step.
    pub fn enqueue(&mut self, llid: Llid, payload: &[u8]) -> Option<usize> {
        let i = self.acquire_free()?;
        self.write(i, llid, payload);
        Some(i)
    }

    pub fn count_free(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Free)
            .count()
    }

    /// Whether any entry is waiting to be transmitted.
    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|s| s.status == SlotStatus::HwOwned)
    }

    pub fn slot(&self, index: usize) -> &TxSlot {
        &self.slots[index]
    }

    /// Hand all not-yet-queued entries to the radio command queue. Called by
    /// the command-construction layer; returns how many were newly queued.
    pub fn queue_pending(&mut self) -> usize {
        let mut queued = 0;
        for slot in self.slots.iter_mut() {
            if slot.status == SlotStatus::HwOwned && !slot.queued {
                slot.queued = true;
                queued += 1;
            }
        }
        queued
    }

    /// Reclaim every hardware-consumed entry. Returns the number freed.
    pub fn release_finished(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if slot.status == SlotStatus::Released {
                slot.status = SlotStatus::Free;
                slot.queued = false;
                slot.len = 0;
                freed += 1;
            }
        }
        freed
    }

    /// Release one slot back to free, regardless of state.
    pub fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Free;
        slot.queued = false;
        slot.len = 0;
    }

    /// Abort path: partially-completed entries go back to free rather than
    /// staying hardware-owned.
    pub fn release_all(&mut self) {
        for i in 0..TX_RING_LEN {
            self.release(i);
        }
    }

    /// Hardware-side: mark every queued entry as consumed.
    pub fn hw_finish_queued(&mut self) -> usize {
        let mut finished = 0;
        for slot in self.slots.iter_mut() {
            if slot.status == SlotStatus::HwOwned && slot.queued {
                slot.status = SlotStatus::Released;
                finished += 1;
            }
        }
        finished
    }
}

impl Default for TxRing {
    fn default() -> Self {
        Self::new()
    }
}
