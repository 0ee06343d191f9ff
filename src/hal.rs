//! Hardware seam: opaque command construction, the command doorbell with its
//! bounded immediate-acknowledgement wait, interrupt mask control and the
//! one-shot event timer.
//!
//! The wire bit-layout of radio commands is entirely the implementor's
//! concern; this crate only hands over the role parameters and the buffer
//! rings the operation is allowed to touch.

use crate::channel::ChannelMap;
use crate::ring::{RxRing, TxRing};
use crate::types::{DeviceAddress, Error, RawTicks};

/// Completion-signal sources, as a bitmask so one operation can wait on
/// several at once.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrqMask(pub u32);

impl IrqMask {
    pub const NONE: IrqMask = IrqMask(0);
    /// Last radio operation ran to completion.
    pub const COMMAND_DONE: IrqMask = IrqMask(1 << 0);
    /// A receive ring entry was finished by the hardware.
    pub const RX_ENTRY_DONE: IrqMask = IrqMask(1 << 1);
    /// Internal hardware error.
    pub const INTERNAL_ERROR: IrqMask = IrqMask(1 << 2);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: IrqMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: IrqMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: IrqMask) -> IrqMask {
        IrqMask(self.0 | other.0)
    }

    pub const fn difference(self, other: IrqMask) -> IrqMask {
        IrqMask(self.0 & !other.0)
    }
}

/// Immediate low-level acknowledgement of a submitted command.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdAck {
    /// Command accepted by the command engine.
    Done,
    /// Command rejected, with the raw acknowledgement status.
    Rejected(u8),
    /// The acknowledgement register never left pending within the spin bound.
    Timeout,
}

impl CmdAck {
    pub fn ok(self) -> bool {
        matches!(self, CmdAck::Done)
    }

    pub fn error(self) -> Error {
        match self {
            CmdAck::Done => Error::Busy,
            CmdAck::Rejected(_) => Error::InvalidParameter,
            CmdAck::Timeout => Error::HardwareTimeout,
        }
    }
}

/// Final status of a radio operation, read back after completion.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdStatus {
    Idle,
    Pending,
    Active,
    /// Operation ended normally.
    DoneOk,
    /// Initiator operation ended with a transmitted connect request.
    DoneConnect,
    /// No packet within the receive window.
    DoneRxTimeout,
    /// Sync word never seen.
    DoneNoSync,
    /// Operation was stopped by an abort request.
    DoneAborted,
    /// Any other status value.
    Other(u16),
}

impl CmdStatus {
    pub fn ok(self) -> bool {
        matches!(self, CmdStatus::DoneOk | CmdStatus::DoneConnect)
    }
}

/// Per-operation output readback.
#[derive(Copy, Clone, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventReport {
    /// Whether the hardware captured a sync-word timestamp this event.
    pub timestamp_valid: bool,
    /// Raw timer value at the first received sync word.
    pub timestamp: RawTicks,
}

/// One advertising-channel operation.
pub struct AdvChannelOp<'a> {
    /// Advertising channel index, 37..=39.
    pub channel: u8,
    pub own_addr: DeviceAddress,
    pub adv_data: &'a [u8],
    pub scan_rsp_data: &'a [u8],
}

/// One peripheral-role connection event.
pub struct SlaveEventOp {
    pub channel: u8,
    pub access_address: u32,
    pub crc_init: [u8; 3],
    /// Transmit window size in radio ticks.
    pub window_size: RawTicks,
    pub window_widening: RawTicks,
    /// Absolute (raw timer) start trigger, widening already subtracted.
    pub start: RawTicks,
    /// First event after activation; the hardware seeds sequence state.
    pub first_packet: bool,
}

/// One central-role connection event.
pub struct MasterEventOp {
    pub channel: u8,
    pub access_address: u32,
    pub crc_init: [u8; 3],
    /// Absolute (raw timer) start trigger.
    pub start: RawTicks,
    /// Relative end bound in radio ticks, so a stalling peer cannot hold the
    /// radio past it.
    pub max_event_ticks: RawTicks,
    pub first_packet: bool,
    /// Listen for resynchronization without handing over transmit entries.
    pub listen_only: bool,
}

/// One initiator (scan + connect request) operation.
pub struct InitiatorOp {
    /// Advertising channel to listen on.
    pub channel: u8,
    pub own_addr: DeviceAddress,
    pub peer: DeviceAddress,
    /// Connection parameters carried in the connect request.
    pub access_address: u32,
    pub crc_init: [u8; 3],
    /// 1.25 ms units.
    pub win_size: u8,
    /// 1.25 ms units.
    pub win_offset: u16,
    /// 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units.
    pub timeout: u16,
    pub channel_map: ChannelMap,
    pub hop: u8,
}

/// The radio command and hardware-control layer.
///
/// An implementation owns one command buffer; `build_*` fills it and
/// [`submit`](RadioHal::submit) rings the doorbell, busy-waiting only for the
/// immediate acknowledgement, never for full completion.
pub trait RadioHal {
    /// Whether the radio power domain is up and registers can be touched.
    fn is_accessible(&self) -> bool;

    fn power_on(&mut self) -> Result<(), Error>;
    fn power_off(&mut self);

    /// Direct read of the free-running radio timer.
    fn read_ticks(&self) -> RawTicks;

    fn build_advertiser(&mut self, op: &AdvChannelOp<'_>, rx: &mut RxRing);
    fn build_initiator(&mut self, op: &InitiatorOp, rx: &mut RxRing);
    fn build_slave(&mut self, op: &SlaveEventOp, rx: &mut RxRing, tx: &mut TxRing);
    fn build_master(&mut self, op: &MasterEventOp, rx: &mut RxRing, tx: &mut TxRing);
    /// Abort request for the operation currently in flight.
    fn build_stop(&mut self);

    /// Submit the built command and wait (bounded) for the immediate
    /// acknowledgement.
    fn submit(&mut self) -> CmdAck;

    /// Status field of the last submitted radio operation.
    fn op_status(&self) -> CmdStatus;

    /// Output readback of the last submitted radio operation.
    fn op_report(&self) -> EventReport;

    fn enabled_irqs(&self) -> IrqMask;
    /// Arm the given completion sources without disturbing others.
    fn enable_irqs(&mut self, mask: IrqMask);
    fn disable_irqs(&mut self, mask: IrqMask);

    /// Arm the one-shot event timer to fire at the given raw timer value.
    /// A new call replaces any pending compare.
    fn arm_event_timer(&mut self, at: RawTicks);
    fn cancel_event_timer(&mut self);
}
