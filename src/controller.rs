//! Top-level link-layer controller: role lifecycle, the foreground-owner
//! token, completion routing and the task-level ingress points.
//!
//! Exactly one role (advertising, initiating, or one scheduled connection)
//! owns the radio at a time. The embedding wires [`LinkLayer::timer_fired`]
//! and [`LinkLayer::radio_irq`] to its interrupt handlers and calls
//! [`LinkLayer::process`] from its background task whenever
//! [`LinkLayer::has_work`] reports pending receive-side work.

use heapless::Vec;

use crate::adv::AdvertisingSession;
use crate::conn::{ConnState, ConnectRequest, ConnectionContext, PendingParams, Role};
use crate::dispatch::{AsyncDispatch, Completion, OpTag};
use crate::hal::{
    AdvChannelOp, CmdAck, CmdStatus, InitiatorOp, IrqMask, MasterEventOp, RadioHal, SlaveEventOp,
};
use crate::initiator::{ConnectParams, InitiatorSession};
use crate::llcp::{self, DataHeader, Outcome};
use crate::ring::{Llid, RX_SLOT_LEN};
use crate::timebase::{TimeBase, RANGE};
use crate::types::{
    ConnHandle, DeviceAddress, DisconnectReason, Error, EventSink, ExtTicks, LinkEvent,
    RadioResult, RawTicks, WINDOW_WIDENING, MAX_DATA_PAYLOAD,
};

/// Size of the connection table.
pub const MAX_CONNECTIONS: usize = 4;

/// Advertising-channel PDU type of a connect request.
const PDU_TYPE_CONNECT_IND: u8 = 0x05;

/// Reason code carried in a locally initiated terminate indication.
const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Tunables. The defaults reproduce the observed production timing.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Events below this counter always participate, so a fresh connection
    /// synchronizes quickly regardless of latency.
    pub early_sync_events: u16,
    /// Relative end bound of a central-role event, in radio ticks.
    pub master_event_bound: RawTicks,
    /// Post-wrap correction window of the time base, in ticks.
    pub wrap_guard: ExtTicks,
    /// Backwards jitter tolerated before a smaller timer sample counts as a
    /// wrap.
    pub wrap_debounce: RawTicks,
    /// Iteration bound for the immediate-acknowledgement busy-wait inside
    /// [`RadioHal::submit`]; implementations read it via
    /// [`LinkLayer::config`].
    pub ack_spin_bound: u32,
    /// Events between a transmitted connection-update request and its
    /// instant.
    pub update_instant_offset: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            early_sync_events: 16,
            // 10 ms.
            master_event_bound: 40_000,
            wrap_guard: 1 << 30,
            wrap_debounce: 4096,
            ack_spin_bound: 50_000,
            update_instant_offset: 6,
        }
    }
}

/// Who currently owns the radio.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Foreground {
    Idle,
    Advertising,
    Initiating,
    Conn(ConnHandle),
}

/// What the armed one-shot timer is for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum TimerTarget {
    None,
    AdvEvent,
    ConnEvent(ConnHandle),
}

/// Deferred role stop, resolved when the in-flight operation completes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum StopAction {
    EndAdvertising,
    EndInitiating,
    Disconnect(ConnHandle),
}

fn ext_to_raw(t: ExtTicks) -> RawTicks {
    (t % RANGE) as RawTicks
}

pub struct LinkLayer<H: RadioHal> {
    hal: H,
    cfg: Config,
    timebase: TimeBase,
    dispatch: AsyncDispatch,
    adv: Option<AdvertisingSession>,
    initiator: Option<InitiatorSession>,
    conns: Vec<ConnectionContext, MAX_CONNECTIONS>,
    foreground: Foreground,
    timer_target: TimerTarget,
    stop_pending: Option<StopAction>,
    next_handle: u8,
    powered: bool,
    work_pending: bool,
}

impl<H: RadioHal> LinkLayer<H> {
    pub fn new(hal: H, cfg: Config) -> Self {
        let timebase = TimeBase::new(cfg.wrap_guard, cfg.wrap_debounce);
        Self {
            hal,
            cfg,
            timebase,
            dispatch: AsyncDispatch::new(),
            adv: None,
            initiator: None,
            conns: Vec::new(),
            foreground: Foreground::Idle,
            timer_target: TimerTarget::None,
            stop_pending: None,
            next_handle: 0,
            powered: false,
            work_pending: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn is_connected(&self, handle: ConnHandle) -> bool {
        self.index_of(handle).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Receive-side work is waiting for [`process`](Self::process).
    pub fn has_work(&self) -> bool {
        self.work_pending
    }

    /// Periodic wrap polling; call at an interval well below the timer wrap
    /// period.
    pub fn poll_time(&mut self) {
        let t = self.hal.read_ticks();
        self.timebase.check_wrap(t, self.powered);
    }

    /// Power the radio down. Refused while any role owns it.
    pub fn power_down(&mut self) -> RadioResult {
        if self.foreground != Foreground::Idle || !self.dispatch.is_idle() {
            return RadioResult::InUse;
        }
        if self.powered {
            self.hal.power_off();
            self.powered = false;
            info!("radio powered off");
        }
        RadioResult::Ok
    }

    // ---- role start/stop -------------------------------------------------

    /// Start advertising. `interval` in 0.625 ms units; `channels` is the
    /// advertising-channel enable bitmap of [`crate::adv`].
    pub fn start_advertising(
        &mut self,
        own_addr: DeviceAddress,
        interval: u16,
        channels: u8,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
    ) -> RadioResult {
        if self.foreground != Foreground::Idle {
            return RadioResult::InUse;
        }
        let mut session = match AdvertisingSession::new(own_addr, interval, channels) {
            Ok(s) => s,
            Err(e) => return e.into(),
        };
        if let Err(e) = session
            .set_adv_data(adv_data)
            .and_then(|_| session.set_scan_rsp_data(scan_rsp_data))
        {
            return e.into();
        }
        if let Err(e) = self.ensure_powered() {
            return e.into();
        }
        let first = session.first_channel();
        self.adv = Some(session);
        self.foreground = Foreground::Advertising;
        match self.issue_adv_op(first) {
            Ok(None) => RadioResult::Ok,
            Ok(Some(c)) => {
                // Rejected at the doorbell.
                self.end_advertising();
                c.ack.error().into()
            }
            Err(e) => {
                self.end_advertising();
                e.into()
            }
        }
    }

    pub fn stop_advertising(&mut self) -> RadioResult {
        if self.adv.is_none() {
            return RadioResult::Ok;
        }
        if self.dispatch.is_idle() {
            self.end_advertising();
        } else {
            // Abort the in-flight advertising operation; teardown completes
            // at its completion callback.
            self.stop_pending = Some(StopAction::EndAdvertising);
            self.submit_abort();
        }
        RadioResult::Ok
    }

    /// Scan for `peer` and connect with the given parameters.
    pub fn create_connection(
        &mut self,
        own_addr: DeviceAddress,
        peer: DeviceAddress,
        params: &ConnectParams,
    ) -> RadioResult {
        if self.foreground != Foreground::Idle || self.conns.is_full() {
            return RadioResult::InUse;
        }
        let session = match InitiatorSession::new(own_addr, peer, params) {
            Ok(s) => s,
            Err(e) => return e.into(),
        };
        if let Err(e) = self.ensure_powered() {
            return e.into();
        }
        self.initiator = Some(session);
        self.foreground = Foreground::Initiating;
        match self.issue_initiator_op() {
            Ok(None) => RadioResult::Ok,
            Ok(Some(c)) => {
                self.end_initiating();
                c.ack.error().into()
            }
            Err(e) => {
                self.end_initiating();
                e.into()
            }
        }
    }

    /// Scan for `peer` and connect with default parameters.
    pub fn start_initiating(&mut self, own_addr: DeviceAddress, peer: DeviceAddress) -> RadioResult {
        self.create_connection(own_addr, peer, &ConnectParams::default())
    }

    /// Give up an unfinished connection attempt.
    pub fn stop_initiating(&mut self) -> RadioResult {
        if self.initiator.is_none() {
            return RadioResult::Ok;
        }
        if self.dispatch.is_idle() {
            self.end_initiating();
        } else {
            self.stop_pending = Some(StopAction::EndInitiating);
            self.submit_abort();
        }
        RadioResult::Ok
    }

    /// Central role only: request new connection parameters. The instant is
    /// chosen [`Config::update_instant_offset`] events ahead.
    pub fn connection_update(&mut self, handle: ConnHandle, params: &ConnectParams) -> RadioResult {
        if !(6..=3200).contains(&params.interval)
            || !(10..=3200).contains(&params.timeout)
            || params.latency >= 500
        {
            return RadioResult::InvalidValue;
        }
        let offset = self.cfg.update_instant_offset;
        let Some(ctx) = self.conn_mut(handle) else {
            return RadioResult::InvalidValue;
        };
        if ctx.role() != Role::Central {
            return RadioResult::NotSupported;
        }
        if ctx.pending_params.is_some() {
            return RadioResult::InUse;
        }
        let p = PendingParams {
            win_size: 2,
            win_offset: 1,
            interval: params.interval,
            latency: params.latency,
            timeout: params.timeout,
            instant: ctx.event_counter().wrapping_add(offset),
        };
        let mut pdu = [0u8; 12];
        llcp::encode_connection_update(&p, &mut pdu);
        if ctx.tx_ring_mut().enqueue(Llid::Control, &pdu).is_none() {
            return RadioResult::InUse;
        }
        match ctx.set_pending_params(p) {
            Ok(()) => RadioResult::Ok,
            Err(e) => e.into(),
        }
    }

    /// Tear a connection down. A terminate indication is queued so it gets
    /// one transmission opportunity; the context is released when the next
    /// event for it completes (immediately aborted if one is in flight).
    pub fn disconnect(&mut self, handle: ConnHandle) -> RadioResult {
        let in_event = {
            let Some(ctx) = self.conn_mut(handle) else {
                return RadioResult::InvalidValue;
            };
            let pdu = llcp::encode_terminate(REASON_REMOTE_USER_TERMINATED);
            let _ = ctx.tx_ring_mut().enqueue(Llid::Control, &pdu);
            ctx.state == ConnState::InEvent
        };
        self.stop_pending = Some(StopAction::Disconnect(handle));
        if in_event {
            self.submit_abort();
        }
        RadioResult::Ok
    }

    /// Queue an outbound message, fragmented into data PDUs. All-or-nothing:
    /// fails with `InUse` if the transmit ring cannot hold every fragment.
    pub fn send_on_connection(&mut self, handle: ConnHandle, data: &[u8]) -> RadioResult {
        if data.is_empty() {
            return RadioResult::InvalidValue;
        }
        let Some(ctx) = self.conn_mut(handle) else {
            return RadioResult::InvalidValue;
        };
        // Fragments plus, for an exact multiple of the PDU size, an empty
        // terminator so the receiver sees a short final fragment.
        let needed = data.len() / MAX_DATA_PAYLOAD + 1;
        if ctx.tx.count_free() < needed {
            return RadioResult::InUse;
        }
        let mut llid = Llid::DataStart;
        for chunk in data.chunks(MAX_DATA_PAYLOAD) {
            let _ = ctx.tx.enqueue(llid, chunk);
            llid = Llid::DataCont;
        }
        if data.len() % MAX_DATA_PAYLOAD == 0 {
            let _ = ctx.tx.enqueue(Llid::DataCont, &[]);
        }
        RadioResult::Ok
    }

    // ---- ingress ---------------------------------------------------------

    /// One-shot timer interrupt.
    pub fn timer_fired(&mut self, sink: &mut impl EventSink) {
        let now = self.hal.read_ticks();
        self.timebase.check_wrap(now, self.powered);
        match self.timer_target {
            TimerTarget::None => {}
            TimerTarget::AdvEvent => {
                if self.adv.is_some() {
                    let first = match self.adv.as_ref() {
                        Some(s) => s.first_channel(),
                        None => return,
                    };
                    match self.issue_adv_op(first) {
                        Ok(None) => {}
                        Ok(Some(c)) => self.on_complete(c, sink),
                        Err(_) => {
                            warn!("advertising event not issued");
                            self.rearm_adv_interval();
                        }
                    }
                }
            }
            TimerTarget::ConnEvent(handle) => self.run_connection_event(handle, now, sink),
        }
    }

    /// Radio interrupt, with the fired source mask.
    pub fn radio_irq(&mut self, fired: IrqMask, sink: &mut impl EventSink) {
        if fired.contains(IrqMask::RX_ENTRY_DONE) {
            self.work_pending = true;
        }
        if fired.contains(IrqMask::INTERNAL_ERROR) {
            error!("radio internal error");
        }
        if let Some(c) = self.dispatch.on_irq(&mut self.hal, fired) {
            self.on_complete(c, sink);
        }
    }

    /// Cooperative background step: drain receive rings, run link-control
    /// processing, deliver upper-layer events.
    pub fn process(&mut self, sink: &mut impl EventSink) {
        self.work_pending = false;
        self.drain_connect_requests(sink);
        self.drain_connection_rx(sink);
    }

    // ---- scheduling ------------------------------------------------------

    fn run_connection_event(&mut self, handle: ConnHandle, now: RawTicks, sink: &mut impl EventSink) {
        let Some(idx) = self.index_of(handle) else {
            return;
        };
        let early = self.cfg.early_sync_events;
        let plan = {
            let ctx = &mut self.conns[idx];
            ctx.plan_event(&self.timebase, now, early)
        };

        // Re-arm for the next event before touching the radio; scheduling
        // continues even if this event cannot be issued.
        let next = ext_to_raw(self.conns[idx].next_wake);
        self.hal.arm_event_timer(next);
        self.timer_target = TimerTarget::ConnEvent(handle);

        if let Some((interval, latency, timeout)) = plan.params_applied {
            sink.event(LinkEvent::ParamsUpdated {
                handle,
                interval,
                latency,
                timeout,
            });
        }
        if !plan.participate {
            trace!("conn {}: event skipped", handle.0);
            return;
        }

        {
            let ctx = &mut self.conns[idx];
            match ctx.role() {
                Role::Peripheral => {
                    let op = SlaveEventOp {
                        channel: plan.channel,
                        access_address: ctx.access_address,
                        crc_init: ctx.crc_init,
                        window_size: ctx.win_size,
                        window_widening: WINDOW_WIDENING,
                        start: ext_to_raw(plan.wake),
                        first_packet: plan.first_packet,
                    };
                    let (rx, tx) = (&mut ctx.rx, &mut ctx.tx);
                    self.hal.build_slave(&op, rx, tx);
                }
                Role::Central => {
                    let op = MasterEventOp {
                        channel: plan.channel,
                        access_address: ctx.access_address,
                        crc_init: ctx.crc_init,
                        start: ext_to_raw(plan.wake),
                        max_event_ticks: self.cfg.master_event_bound,
                        first_packet: plan.first_packet,
                        listen_only: plan.suppress_tx,
                    };
                    let (rx, tx) = (&mut ctx.rx, &mut ctx.tx);
                    self.hal.build_master(&op, rx, tx);
                }
            }
            ctx.state = ConnState::InEvent;
        }
        match self.dispatch.issue(
            &mut self.hal,
            OpTag::ConnEvent(handle),
            IrqMask::COMMAND_DONE,
        ) {
            Ok(None) => {}
            Ok(Some(c)) => self.on_complete(c, sink),
            Err(_) => {
                warn!("conn {}: event not issued, radio busy", handle.0);
                self.conns[idx].state = ConnState::Scheduled;
            }
        }
    }

    fn issue_adv_op(&mut self, channel: u8) -> Result<Option<Completion>, Error> {
        {
            let adv = self.adv.as_mut().ok_or(Error::Busy)?;
            let op = AdvChannelOp {
                channel,
                own_addr: adv.own_addr,
                adv_data: &adv.adv_data,
                scan_rsp_data: &adv.scan_rsp_data,
            };
            self.hal.build_advertiser(&op, &mut adv.rx);
        }
        self.dispatch
            .issue(&mut self.hal, OpTag::AdvChannel(channel), IrqMask::COMMAND_DONE)
    }

    fn issue_initiator_op(&mut self) -> Result<Option<Completion>, Error> {
        {
            let s = self.initiator.as_mut().ok_or(Error::Busy)?;
            let r = &s.request;
            let op = InitiatorOp {
                channel: s.scan_channel,
                own_addr: r.initiator,
                peer: r.advertiser,
                access_address: r.access_address,
                crc_init: r.crc_init,
                win_size: r.win_size,
                win_offset: r.win_offset,
                interval: r.interval,
                latency: r.latency,
                timeout: r.timeout,
                channel_map: r.channel_map,
                hop: r.hop,
            };
            self.hal.build_initiator(&op, &mut s.rx);
        }
        self.dispatch
            .issue(&mut self.hal, OpTag::Initiate, IrqMask::COMMAND_DONE)
    }

    /// Direct abort of the in-flight operation. Immediate command: it
    /// completes on its acknowledgement, and the aborted operation then posts
    /// its own completion with an aborted status.
    fn submit_abort(&mut self) {
        self.hal.build_stop();
        let ack = self.hal.submit();
        if !ack.ok() {
            warn!("abort rejected: {}", ack);
        }
    }

    // ---- completion routing ----------------------------------------------

    fn on_complete(&mut self, c: Completion, sink: &mut impl EventSink) {
        match c.tag {
            OpTag::AdvChannel(ch) => self.on_adv_complete(ch, c.ack, sink),
            OpTag::Initiate => self.on_initiate_complete(c.ack, sink),
            OpTag::ConnEvent(h) => self.on_conn_event_complete(h, c.ack, sink),
        }
    }

    fn on_adv_complete(&mut self, channel: u8, ack: CmdAck, sink: &mut impl EventSink) {
        if self.stop_pending == Some(StopAction::EndAdvertising) {
            self.stop_pending = None;
            self.end_advertising();
            return;
        }
        if self.adv.is_none() {
            return;
        }
        // A connect request may be waiting in the session's receive ring.
        self.work_pending = true;
        if !ack.ok() {
            warn!("advertising stopped: {}", ack);
            self.end_advertising();
            return;
        }
        let next = self.adv.as_ref().and_then(|s| s.channel_after(channel));
        match next {
            Some(ch) => match self.issue_adv_op(ch) {
                Ok(None) => {}
                Ok(Some(c)) => self.on_complete(c, sink),
                Err(_) => self.rearm_adv_interval(),
            },
            None => self.rearm_adv_interval(),
        }
    }

    fn rearm_adv_interval(&mut self) {
        let Some(interval) = self.adv.as_ref().map(|s| s.interval_ticks()) else {
            return;
        };
        let at = self.hal.read_ticks().wrapping_add(interval);
        self.hal.arm_event_timer(at);
        self.timer_target = TimerTarget::AdvEvent;
    }

    fn on_initiate_complete(&mut self, ack: CmdAck, sink: &mut impl EventSink) {
        if self.stop_pending == Some(StopAction::EndInitiating) {
            self.stop_pending = None;
            self.end_initiating();
            return;
        }
        if self.initiator.is_none() {
            return;
        }
        if !ack.ok() {
            warn!("initiating stopped: {}", ack);
            self.end_initiating();
            return;
        }
        if self.hal.op_status() == CmdStatus::DoneConnect {
            self.promote_initiator(sink);
            return;
        }
        // Empty scan window: hop to the next advertising channel and retry.
        if let Some(s) = self.initiator.as_mut() {
            s.hop_scan_channel();
        }
        match self.issue_initiator_op() {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => {
                warn!("initiator retry failed");
                self.end_initiating();
            }
        }
    }

    fn promote_initiator(&mut self, sink: &mut impl EventSink) {
        let now = self.hal.read_ticks();
        let report = self.hal.op_report();
        let sent_at = if report.timestamp_valid {
            self.timebase.reconcile(report.timestamp, now)
        } else {
            self.timebase.extended_now(now)
        };
        let Some(session) = self.initiator.take() else {
            return;
        };
        let handle = self.alloc_handle();
        let ctx = ConnectionContext::from_initiation(handle, session.peer(), &session.request, sent_at);
        let next = ext_to_raw(ctx.next_wake);
        let peer = ctx.peer();
        if self.conns.push(ctx).is_err() {
            warn!("connection table full");
            self.foreground = Foreground::Idle;
            return;
        }
        self.foreground = Foreground::Conn(handle);
        self.timer_target = TimerTarget::ConnEvent(handle);
        self.hal.arm_event_timer(next);
        info!("conn {}: established as central", handle.0);
        sink.event(LinkEvent::ConnectionEstablished { handle, peer });
    }

    fn on_conn_event_complete(&mut self, handle: ConnHandle, ack: CmdAck, sink: &mut impl EventSink) {
        let Some(idx) = self.index_of(handle) else {
            return;
        };
        let status = self.hal.op_status();
        let report = self.hal.op_report();
        let now = self.timebase.extended_now(self.hal.read_ticks());
        let ok = ack.ok() && status.ok();

        let released = self.conns[idx].tx.release_finished();
        if released > 0 {
            sink.event(LinkEvent::TransmitComplete { handle, released });
        }
        self.work_pending = true;

        let result = self.conns[idx].note_event_result(ok, now, &report);

        if self.stop_pending == Some(StopAction::Disconnect(handle)) {
            self.stop_pending = None;
            self.teardown(idx, DisconnectReason::LocalRequest, sink);
            return;
        }
        if result.is_err() {
            warn!("conn {}: supervision timeout", handle.0);
            self.teardown(idx, DisconnectReason::SupervisionTimeout, sink);
        }
    }

    // ---- receive-side processing -----------------------------------------

    fn drain_connect_requests(&mut self, sink: &mut impl EventSink) {
        let now_raw = self.hal.read_ticks();
        let mut promoted: Option<(ConnectRequest, RawTicks)> = None;
        if let Some(adv) = self.adv.as_mut() {
            while let Some(i) = adv.rx.next_finished() {
                let mut buf = [0u8; RX_SLOT_LEN];
                let (len, ts) = {
                    let slot = adv.rx.slot(i);
                    let p = slot.payload();
                    buf[..p.len()].copy_from_slice(p);
                    (p.len(), slot.timestamp())
                };
                adv.rx.release(i);
                if len < 2 + ConnectRequest::BODY_LEN || buf[0] & 0x0F != PDU_TYPE_CONNECT_IND {
                    continue;
                }
                match ConnectRequest::parse(&buf[2..len]) {
                    Ok(req) => {
                        promoted = Some((req, ts));
                        break;
                    }
                    Err(_) => warn!("malformed connect request dropped"),
                }
            }
        }
        let Some((req, ts)) = promoted else {
            return;
        };
        let received_at = self.timebase.reconcile(ts, now_raw);
        let handle = self.alloc_handle();
        let ctx = ConnectionContext::from_connect_request(handle, &req, received_at);
        let next = ext_to_raw(ctx.next_wake);
        let peer = ctx.peer();
        if self.conns.push(ctx).is_err() {
            warn!("connection table full, connect request dropped");
            return;
        }
        // The advertising session is consumed by the promotion.
        self.adv = None;
        self.foreground = Foreground::Conn(handle);
        self.timer_target = TimerTarget::ConnEvent(handle);
        self.hal.arm_event_timer(next);
        info!("conn {}: established as peripheral", handle.0);
        sink.event(LinkEvent::ConnectionEstablished { handle, peer });
    }

    fn drain_connection_rx(&mut self, sink: &mut impl EventSink) {
        let now_raw = self.hal.read_ticks();
        let mut idx = 0;
        while idx < self.conns.len() {
            let handle = self.conns[idx].handle();
            let mut terminate: Option<u8> = None;
            let mut param_req: Option<ConnectParams> = None;
            loop {
                let mut buf = [0u8; RX_SLOT_LEN];
                let (len, ts) = {
                    let ctx = &mut self.conns[idx];
                    let Some(i) = ctx.rx.next_finished() else {
                        break;
                    };
                    let (len, ts) = {
                        let slot = ctx.rx.slot(i);
                        let p = slot.payload();
                        buf[..p.len()].copy_from_slice(p);
                        (p.len(), slot.timestamp())
                    };
                    ctx.rx.release(i);
                    (len, ts)
                };
                if len < 2 {
                    continue;
                }
                let header = DataHeader::new_with_raw_value(buf[0]);
                let plen = (buf[1] as usize).min(len - 2);
                let payload = &buf[2..2 + plen];
                match header.llid_kind() {
                    Some(Llid::Control) => {
                        match llcp::process(&mut self.conns[idx], payload) {
                            Ok(Outcome::Terminate { reason }) => {
                                terminate = Some(reason);
                                break;
                            }
                            Ok(Outcome::ParamRequest {
                                interval,
                                latency,
                                timeout,
                            }) => {
                                param_req = Some(ConnectParams {
                                    interval,
                                    latency,
                                    timeout,
                                });
                            }
                            Ok(Outcome::None) => {}
                            Err(_) => warn!("conn {}: malformed control pdu", handle.0),
                        }
                    }
                    Some(llid) => {
                        let complete = {
                            let ctx = &mut self.conns[idx];
                            if llid == Llid::DataStart {
                                ctx.assembly.clear();
                                ctx.assembly_ts = self.timebase.reconcile(ts, now_raw);
                            }
                            if ctx.assembly.extend_from_slice(payload).is_err() {
                                warn!("conn {}: reassembly overflow, message dropped", handle.0);
                                ctx.assembly.clear();
                                false
                            } else {
                                // MD clear or a short fragment terminates the
                                // message.
                                !header.md() || plen < MAX_DATA_PAYLOAD
                            }
                        };
                        if complete && !self.conns[idx].assembly.is_empty() {
                            let ctx = &self.conns[idx];
                            sink.event(LinkEvent::DataReceived {
                                handle,
                                data: &ctx.assembly,
                                timestamp: ctx.assembly_ts,
                            });
                            self.conns[idx].assembly.clear();
                        }
                    }
                    None => warn!("conn {}: reserved llid dropped", handle.0),
                }
            }
            if let Some(p) = param_req {
                if self.conns[idx].role() == Role::Central {
                    let _ = self.connection_update(handle, &p);
                }
            }
            if let Some(reason) = terminate {
                info!("conn {}: terminated by peer, reason {:#x}", handle.0, reason);
                self.teardown(idx, DisconnectReason::PeerTerminated(reason), sink);
                // swap_remove moved another context into this index.
                continue;
            }
            idx += 1;
        }
    }

    // ---- lifecycle helpers -----------------------------------------------

    fn teardown(&mut self, idx: usize, reason: DisconnectReason, sink: &mut impl EventSink) {
        let mut ctx = self.conns.swap_remove(idx);
        ctx.tx.release_all();
        let handle = ctx.handle();
        if self.foreground == Foreground::Conn(handle) {
            self.foreground = Foreground::Idle;
        }
        if self.timer_target == TimerTarget::ConnEvent(handle) {
            self.hal.cancel_event_timer();
            self.timer_target = TimerTarget::None;
        }
        sink.event(LinkEvent::Disconnected { handle, reason });
    }

    fn end_advertising(&mut self) {
        self.adv = None;
        if self.foreground == Foreground::Advertising {
            self.foreground = Foreground::Idle;
        }
        if self.timer_target == TimerTarget::AdvEvent {
            self.hal.cancel_event_timer();
            self.timer_target = TimerTarget::None;
        }
    }

    fn end_initiating(&mut self) {
        self.initiator = None;
        if self.foreground == Foreground::Initiating {
            self.foreground = Foreground::Idle;
        }
    }

    fn ensure_powered(&mut self) -> Result<(), Error> {
        if !self.powered {
            self.hal.power_on()?;
            self.powered = true;
            let t = self.hal.read_ticks();
            self.timebase.check_wrap(t, true);
            info!("radio powered on");
        }
        Ok(())
    }

    fn index_of(&self, handle: ConnHandle) -> Option<usize> {
        self.conns.iter().position(|c| c.handle() == handle)
    }

    fn conn_mut(&mut self, handle: ConnHandle) -> Option<&mut ConnectionContext> {
        self.conns.iter_mut().find(|c| c.handle() == handle)
    }

    fn alloc_handle(&mut self) -> ConnHandle {
        loop {
            let h = ConnHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if self.index_of(h).is_none() {
                return h;
            }
        }
    }
}
