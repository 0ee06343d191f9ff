//! Single-outstanding-command gate between task-level callers and
//! interrupt-level completions.
//!
//! A command completes after two signals: the immediate doorbell
//! acknowledgement and the completion interrupt named at issue time. The
//! four-state handshake guarantees the completion is reported exactly once,
//! never before both signals (a failed acknowledgement short-circuits the
//! wait). Re-issuing from within completion handling is legal: the gate is
//! back to idle before the completion is handed out.

use crate::hal::{CmdAck, IrqMask, RadioHal};
use crate::types::{ConnHandle, Error};

/// Identifies which operation a completion belongs to. The controller routes
/// completions by tag; this plays the role a callback-plus-context pair
/// would, without storing closures.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpTag {
    /// Advertising operation on the given advertising channel.
    AdvChannel(u8),
    /// Initiator scan/connect operation.
    Initiate,
    /// Scheduled connection event.
    ConnEvent(ConnHandle),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Handshake {
    Idle,
    /// Command written, no signal observed yet.
    Issued,
    /// One of the two required signals observed.
    FirstSignal,
    /// Both signals observed; transient, reset before the completion is
    /// reported.
    Done,
}

/// A finished command, handed back to the issuer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    pub tag: OpTag,
    pub ack: CmdAck,
}

pub struct AsyncDispatch {
    state: Handshake,
    tag: Option<OpTag>,
    mask: IrqMask,
    /// Sources we armed ourselves (and must not leave enabled for others).
    armed: IrqMask,
    ack: CmdAck,
}

impl AsyncDispatch {
    pub const fn new() -> Self {
        Self {
            state: Handshake::Idle,
            tag: None,
            mask: IrqMask::NONE,
            armed: IrqMask::NONE,
            ack: CmdAck::Done,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, Handshake::Idle)
    }

    /// Submit the command currently built in the hardware layer.
    ///
    /// `completion_mask` names the interrupt source(s) that signal full
    /// completion; an empty mask means the acknowledgement alone completes
    /// the command. Fails with [`Error::Busy`] while a command is
    /// outstanding or the radio is inaccessible.
    ///
    /// Returns `Ok(Some(_))` when the command completed (or failed) within
    /// the call itself.
    pub fn issue<H: RadioHal>(
        &mut self,
        hal: &mut H,
        tag: OpTag,
        completion_mask: IrqMask,
    ) -> Result<Option<Completion>, Error> {
        if !self.is_idle() || !hal.is_accessible() {
            return Err(Error::Busy);
        }

        // Arm only the sources not already enabled, so flags of unrelated
        // armed interrupts are left alone.
        let to_arm = completion_mask.difference(hal.enabled_irqs());
        if !to_arm.is_empty() {
            hal.enable_irqs(to_arm);
        }
        self.armed = to_arm;
        self.state = Handshake::Issued;
        self.tag = Some(tag);
        self.mask = completion_mask;

        let ack = hal.submit();
        Ok(self.on_ack(hal, ack))
    }

    /// The immediate acknowledgement signal.
    fn on_ack<H: RadioHal>(&mut self, hal: &mut H, ack: CmdAck) -> Option<Completion> {
        if self.is_idle() {
            return None;
        }
        self.ack = ack;

        if !ack.ok() {
            // Short-circuit: a failed acknowledgement completes immediately.
            hal.disable_irqs(self.armed);
            warn!("command rejected: {}", ack);
            return self.finish();
        }
        if self.mask.is_empty() {
            return self.finish();
        }
        match self.state {
            Handshake::Issued => {
                self.state = Handshake::FirstSignal;
                None
            }
            Handshake::FirstSignal => self.finish(),
            _ => None,
        }
    }

    /// Completion interrupt(s) fired. Returns the finished command once both
    /// required signals have been observed.
    pub fn on_irq<H: RadioHal>(&mut self, hal: &mut H, fired: IrqMask) -> Option<Completion> {
        if self.is_idle() || !fired.intersects(self.mask) {
            return None;
        }
        // Disarm only the source(s) armed for this command; sources that
        // were already enabled for other consumers stay enabled.
        hal.disable_irqs(self.armed);
        match self.state {
            Handshake::Issued => {
                self.state = Handshake::FirstSignal;
                None
            }
            Handshake::FirstSignal => self.finish(),
            _ => None,
        }
    }

    /// Both signals observed: reset to idle, then report. The reset-first
    /// order is what makes re-issue from completion handling legal.
    fn finish(&mut self) -> Option<Completion> {
        self.state = Handshake::Done;
        let tag = self.tag.take()?;
        let ack = self.ack;
        self.state = Handshake::Idle;
        self.mask = IrqMask::NONE;
        self.armed = IrqMask::NONE;
        Some(Completion { tag, ack })
    }
}

impl Default for AsyncDispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{
        AdvChannelOp, CmdStatus, EventReport, InitiatorOp, MasterEventOp, SlaveEventOp,
    };
    use crate::ring::{RxRing, TxRing};
    use crate::types::RawTicks;

    /// Radio stub: scripted acknowledgement, records the interrupt mask.
    struct StubRadio {
        ack: CmdAck,
        enabled: IrqMask,
        submits: usize,
        accessible: bool,
    }

    impl StubRadio {
        fn new() -> Self {
            Self {
                ack: CmdAck::Done,
                enabled: IrqMask::NONE,
                submits: 0,
                accessible: true,
            }
        }
    }

    impl RadioHal for StubRadio {
        fn is_accessible(&self) -> bool {
            self.accessible
        }
        fn power_on(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn power_off(&mut self) {}
        fn read_ticks(&self) -> RawTicks {
            0
        }
        fn build_advertiser(&mut self, _: &AdvChannelOp<'_>, _: &mut RxRing) {}
        fn build_initiator(&mut self, _: &InitiatorOp, _: &mut RxRing) {}
        fn build_slave(&mut self, _: &SlaveEventOp, _: &mut RxRing, _: &mut TxRing) {}
        fn build_master(&mut self, _: &MasterEventOp, _: &mut RxRing, _: &mut TxRing) {}
        fn build_stop(&mut self) {}
        fn submit(&mut self) -> CmdAck {
            self.submits += 1;
            self.ack
        }
        fn op_status(&self) -> CmdStatus {
            CmdStatus::DoneOk
        }
        fn op_report(&self) -> EventReport {
            EventReport::default()
        }
        fn enabled_irqs(&self) -> IrqMask {
            self.enabled
        }
        fn enable_irqs(&mut self, mask: IrqMask) {
            self.enabled = self.enabled.union(mask);
        }
        fn disable_irqs(&mut self, mask: IrqMask) {
            self.enabled = self.enabled.difference(mask);
        }
        fn arm_event_timer(&mut self, _: RawTicks) {}
        fn cancel_event_timer(&mut self) {}
    }

    #[test]
    fn completes_after_ack_and_irq() {
        let mut hal = StubRadio::new();
        let mut d = AsyncDispatch::new();
        let r = d
            .issue(&mut hal, OpTag::ConnEvent(ConnHandle(3)), IrqMask::COMMAND_DONE)
            .unwrap();
        // Ack alone must not complete the command.
        assert!(r.is_none());
        assert!(hal.enabled.contains(IrqMask::COMMAND_DONE));
        let c = d.on_irq(&mut hal, IrqMask::COMMAND_DONE).unwrap();
        assert_eq!(c.tag, OpTag::ConnEvent(ConnHandle(3)));
        assert!(c.ack.ok());
        assert!(d.is_idle());
        // The completion source was disarmed again.
        assert!(!hal.enabled.contains(IrqMask::COMMAND_DONE));
    }

    #[test]
    fn fires_exactly_once() {
        let mut hal = StubRadio::new();
        let mut d = AsyncDispatch::new();
        d.issue(&mut hal, OpTag::Initiate, IrqMask::COMMAND_DONE)
            .unwrap();
        assert!(d.on_irq(&mut hal, IrqMask::COMMAND_DONE).is_some());
        // Spurious repeat of the same interrupt: nothing outstanding.
        assert!(d.on_irq(&mut hal, IrqMask::COMMAND_DONE).is_none());
    }

    #[test]
    fn empty_mask_completes_on_ack() {
        let mut hal = StubRadio::new();
        let mut d = AsyncDispatch::new();
        let c = d.issue(&mut hal, OpTag::ConnEvent(ConnHandle(3)), IrqMask::NONE).unwrap();
        assert_eq!(c.unwrap().tag, OpTag::ConnEvent(ConnHandle(3)));
        assert!(d.is_idle());
    }

    #[test]
    fn failed_ack_short_circuits() {
        let mut hal = StubRadio::new();
        hal.ack = CmdAck::Rejected(0x86);
        let mut d = AsyncDispatch::new();
        let c = d
            .issue(&mut hal, OpTag::AdvChannel(37), IrqMask::COMMAND_DONE)
            .unwrap()
            .unwrap();
        assert_eq!(c.ack, CmdAck::Rejected(0x86));
        assert!(d.is_idle());
        // The source armed for this command was disarmed again.
        assert!(!hal.enabled.contains(IrqMask::COMMAND_DONE));
    }

    #[test]
    fn busy_while_outstanding() {
        let mut hal = StubRadio::new();
        let mut d = AsyncDispatch::new();
        d.issue(&mut hal, OpTag::Initiate, IrqMask::COMMAND_DONE)
            .unwrap();
        assert_eq!(
            d.issue(&mut hal, OpTag::ConnEvent(ConnHandle(3)), IrqMask::COMMAND_DONE),
            Err(Error::Busy)
        );
        // Finish the first; the gate opens again.
        d.on_irq(&mut hal, IrqMask::COMMAND_DONE).unwrap();
        assert!(d
            .issue(&mut hal, OpTag::ConnEvent(ConnHandle(3)), IrqMask::COMMAND_DONE)
            .is_ok());
    }

    #[test]
    fn busy_when_inaccessible() {
        let mut hal = StubRadio::new();
        hal.accessible = false;
        let mut d = AsyncDispatch::new();
        assert_eq!(
            d.issue(&mut hal, OpTag::ConnEvent(ConnHandle(3)), IrqMask::NONE),
            Err(Error::Busy)
        );
        assert_eq!(hal.submits, 0);
    }

    #[test]
    fn already_enabled_sources_not_rearmed() {
        let mut hal = StubRadio::new();
        hal.enabled = IrqMask::RX_ENTRY_DONE;
        let mut d = AsyncDispatch::new();
        d.issue(
            &mut hal,
            OpTag::ConnEvent(ConnHandle(0)),
            IrqMask::COMMAND_DONE.union(IrqMask::RX_ENTRY_DONE),
        )
        .unwrap();
        // Only COMMAND_DONE was newly armed; RX_ENTRY_DONE stayed as it was.
        assert!(hal.enabled.contains(IrqMask::RX_ENTRY_DONE));
        assert!(hal.enabled.contains(IrqMask::COMMAND_DONE));
        let c = d.on_irq(&mut hal, IrqMask::COMMAND_DONE);
        assert!(c.is_some());
        // Completion disarms only what this command armed itself.
        assert!(hal.enabled.contains(IrqMask::RX_ENTRY_DONE));
        assert!(!hal.enabled.contains(IrqMask::COMMAND_DONE));
    }

    #[test]
    fn unrelated_irq_ignored() {
        let mut hal = StubRadio::new();
        let mut d = AsyncDispatch::new();
        d.issue(&mut hal, OpTag::Initiate, IrqMask::COMMAND_DONE)
            .unwrap();
        assert!(d.on_irq(&mut hal, IrqMask::RX_ENTRY_DONE).is_none());
        assert!(!d.is_idle());
    }
}
