//! Per-connection state and the per-event scheduling logic.
//!
//! One [`ConnectionContext`] exists per active connection. The scheduler owns
//! it exclusively once activated; everything here is plain state driven by
//! the controller's timer and completion paths.

use heapless::Vec;

use crate::channel::{self, ChannelMap};
use crate::hal::EventReport;
use crate::ring::{RxRing, TxRing};
use crate::timebase::TimeBase;
use crate::types::{
    ConnHandle, DeviceAddress, Error, ExtTicks, RawTicks, CONN_EVENT_DELAY, TICKS_PER_CONN_UNIT,
    TICKS_PER_TIMEOUT_UNIT, WINDOW_WIDENING,
};

/// Transmit windows at or below this offset start too early to arm the
/// radio in time; the first connection event is skipped and the anchor moves
/// to the second window.
const EARLY_WINDOW_FLOOR: u32 = 60_000;

/// Reassembly capacity for inbound messages.
const ASSEMBLY_LEN: usize = 255;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Central,
    Peripheral,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnState {
    /// Populated but not yet scheduled.
    Idle,
    /// Waiting for the next event timer.
    Scheduled,
    /// A radio operation for this connection is in flight.
    InEvent,
    Terminated,
}

/// A connection-parameter update waiting for its instant.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingParams {
    /// 1.25 ms units.
    pub win_size: u8,
    /// 1.25 ms units.
    pub win_offset: u16,
    /// 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units.
    pub timeout: u16,
    /// Event counter value at which the update takes effect.
    pub instant: u16,
}

/// A channel-map update waiting for its instant.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingChannelMap {
    pub map: ChannelMap,
    pub instant: u16,
}

/// Decoded connect request (advertising-channel PDU body).
#[derive(Copy, Clone, Debug)]
pub struct ConnectRequest {
    pub initiator: DeviceAddress,
    pub advertiser: DeviceAddress,
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
    pub sca: u8,
}

impl ConnectRequest {
    pub const BODY_LEN: usize = 34;

    /// Parse the 34-byte body: initiator address, advertiser address, then
    /// the link-layer data block.
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        if body.len() < Self::BODY_LEN {
            return Err(Error::ProtocolViolation);
        }
        let mut initiator = [0; 6];
        let mut advertiser = [0; 6];
        // Addresses arrive most-significant byte first.
        for i in 0..6 {
            initiator[i] = body[5 - i];
            advertiser[i] = body[11 - i];
        }
        let d = &body[12..];
        let access_address = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
        let crc_init = [d[4], d[5], d[6]];
        let win_size = d[7];
        let win_offset = u16::from_le_bytes([d[8], d[9]]);
        let interval = u16::from_le_bytes([d[10], d[11]]);
        let latency = u16::from_le_bytes([d[12], d[13]]);
        let timeout = u16::from_le_bytes([d[14], d[15]]);
        let mut map_bits = 0u64;
        for i in 0..5 {
            map_bits |= (d[16 + i] as u64) << (8 * i);
        }
        let channel_map = ChannelMap::from_mask(map_bits);
        let hop = d[21] & 0x1F;
        let sca = (d[21] >> 5) & 0x07;

        if interval == 0 || !(5..=16).contains(&hop) || channel_map.used_count() == 0 {
            return Err(Error::ProtocolViolation);
        }
        Ok(Self {
            initiator: DeviceAddress(initiator),
            advertiser: DeviceAddress(advertiser),
            access_address,
            crc_init,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            hop,
            sca,
        })
    }
}

/// What the scheduler decided for one connection event.
#[derive(Copy, Clone, Debug)]
pub struct EventPlan {
    /// Extended start time of this event.
    pub wake: ExtTicks,
    pub participate: bool,
    pub channel: u8,
    /// First event after activation; sequence state must be seeded.
    pub first_packet: bool,
    /// Central role only: listen without handing over transmit entries.
    pub suppress_tx: bool,
    /// `(interval, latency, timeout)` in protocol units, set when a pending
    /// parameter update took effect this event.
    pub params_applied: Option<(u16, u16, u16)>,
}

pub struct ConnectionContext {
    pub(crate) handle: ConnHandle,
    pub(crate) peer: DeviceAddress,
    pub(crate) role: Role,
    pub(crate) state: ConnState,

    pub(crate) access_address: u32,
    pub(crate) crc_init: [u8; 3],
    /// Radio ticks.
    pub(crate) win_size: u32,
    pub(crate) win_offset: u32,
    pub(crate) interval: u32,
    pub(crate) latency: u16,
    /// Radio ticks.
    pub(crate) timeout: ExtTicks,

    /// Last known anchor point (extended time).
    pub(crate) anchor: ExtTicks,
    pub(crate) next_wake: ExtTicks,
    /// Extended time of the last event that completed normally.
    pub(crate) last_sync: ExtTicks,
    /// Whether the first radio operation for this connection was planned.
    pub(crate) started: bool,
    pub(crate) event_counter: u16,
    /// Valid hardware timestamp reported by the previous event.
    pub(crate) last_timestamp: Option<RawTicks>,

    pub(crate) channel_map: ChannelMap,
    pub(crate) unmapped_channel: u8,
    pub(crate) data_channel: u8,
    pub(crate) hop: u8,

    pub(crate) pending_params: Option<PendingParams>,
    pub(crate) pending_map: Option<PendingChannelMap>,

    /// Peripheral role: consecutive deliberately skipped events.
    pub(crate) skipped_events: u16,
    /// Consecutive events without synchronization.
    pub(crate) sync_misses: u16,

    pub(crate) rx: RxRing,
    pub(crate) tx: TxRing,

    /// Inbound message reassembly.
    pub(crate) assembly: Vec<u8, ASSEMBLY_LEN>,
    pub(crate) assembly_ts: ExtTicks,
}

impl ConnectionContext {
    /// Activate a peripheral-role connection from a received connect
    /// request. `received_at` is the reconciled timestamp of the request.
    pub fn from_connect_request(
        handle: ConnHandle,
        req: &ConnectRequest,
        received_at: ExtTicks,
    ) -> Self {
        let mut ctx = Self::raw(handle, req.initiator, Role::Peripheral);
        ctx.access_address = req.access_address;
        ctx.crc_init = req.crc_init;
        ctx.win_size = req.win_size as u32 * TICKS_PER_CONN_UNIT;
        ctx.win_offset = req.win_offset as u32 * TICKS_PER_CONN_UNIT;
        ctx.interval = req.interval as u32 * TICKS_PER_CONN_UNIT;
        ctx.latency = req.latency;
        ctx.timeout = req.timeout as ExtTicks * TICKS_PER_TIMEOUT_UNIT as ExtTicks;
        ctx.channel_map = req.channel_map;
        ctx.hop = req.hop;
        ctx.anchor = received_at + CONN_EVENT_DELAY as ExtTicks;
        if ctx.win_offset <= EARLY_WINDOW_FLOOR {
            // First window opens too early to arm the radio; skip the first
            // event entirely: anchor on the second window, count the skipped
            // event and hop past its channel.
            ctx.anchor += ctx.interval as ExtTicks;
            ctx.event_counter = 1;
            let (unmapped, mapped) =
                channel::select(ctx.unmapped_channel, ctx.hop, &ctx.channel_map);
            ctx.unmapped_channel = unmapped;
            ctx.data_channel = mapped;
        }
        ctx.last_sync = ctx.anchor;
        ctx.next_wake =
            ctx.anchor + ctx.win_offset as ExtTicks - WINDOW_WIDENING as ExtTicks;
        ctx.state = ConnState::Scheduled;
        ctx
    }

    /// Activate a central-role connection from a transmitted connect
    /// request. `req` holds the parameters we sent; `sent_at` the reconciled
    /// timestamp of the request.
    pub fn from_initiation(
        handle: ConnHandle,
        peer: DeviceAddress,
        req: &ConnectRequest,
        sent_at: ExtTicks,
    ) -> Self {
        let mut ctx = Self::from_connect_request(handle, req, sent_at);
        ctx.handle = handle;
        ctx.peer = peer;
        ctx.role = Role::Central;
        // No window widening on the central side.
        ctx.next_wake = ctx.anchor + ctx.win_offset as ExtTicks;
        ctx
    }

    fn raw(handle: ConnHandle, peer: DeviceAddress, role: Role) -> Self {
        Self {
            handle,
            peer,
            role,
            state: ConnState::Idle,
            access_address: 0,
            crc_init: [0; 3],
            win_size: 0,
            win_offset: 0,
            interval: 0,
            latency: 0,
            timeout: 0,
            anchor: 0,
            next_wake: 0,
            last_sync: 0,
            started: false,
            event_counter: 0,
            last_timestamp: None,
            channel_map: ChannelMap::all(),
            unmapped_channel: 0,
            data_channel: 0,
            hop: 7,
            pending_params: None,
            pending_map: None,
            skipped_events: 0,
            sync_misses: 0,
            rx: RxRing::new(),
            tx: TxRing::new(),
            assembly: Vec::new(),
            assembly_ts: 0,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn peer(&self) -> DeviceAddress {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn event_counter(&self) -> u16 {
        self.event_counter
    }

    pub fn rx_ring_mut(&mut self) -> &mut RxRing {
        &mut self.rx
    }

    pub fn tx_ring_mut(&mut self) -> &mut TxRing {
        &mut self.tx
    }

    fn widening(&self) -> ExtTicks {
        match self.role {
            Role::Peripheral => WINDOW_WIDENING as ExtTicks,
            Role::Central => 0,
        }
    }

    /// Run the per-event bookkeeping for the event whose timer just fired:
    /// count the event, apply pending updates whose instant arrived, hop the
    /// data channel and decide participation. Returns the plan; the caller
    /// issues the radio operation and re-arms the timer at
    /// [`next_wake`](Self::next_wake).
    pub fn plan_event(&mut self, tb: &TimeBase, now: RawTicks, early_sync_events: u16) -> EventPlan {
        let widening = self.widening();
        let mut wake = self.next_wake;
        let mut first_packet = false;
        if !self.started {
            // First event: skip the nominal window, anchor afresh.
            self.started = true;
            wake = self.anchor + self.win_offset as ExtTicks - widening;
            first_packet = true;
        }
        self.event_counter = self.event_counter.wrapping_add(1);

        let mut params_applied = None;
        let update_due =
            matches!(self.pending_params, Some(p) if p.instant == self.event_counter);
        if update_due {
            if let Some(p) = self.pending_params.take() {
                self.apply_params(&p);
                // The new timing starts one transmit-window offset after the
                // instant's event.
                self.next_wake = wake + self.interval as ExtTicks + self.win_offset as ExtTicks;
                params_applied = Some((p.interval, p.latency, p.timeout));
                info!(
                    "conn {}: params updated at event {}",
                    self.handle.0, self.event_counter
                );
            }
        } else if let Some(ts) = self.last_timestamp {
            self.next_wake = tb.reconcile(ts, now) + self.interval as ExtTicks - widening;
        } else {
            self.next_wake = wake + self.interval as ExtTicks;
        }
        self.last_timestamp = None;

        if let Some(m) = self.pending_map {
            if m.instant == self.event_counter {
                self.channel_map = m.map;
                self.pending_map = None;
                info!(
                    "conn {}: channel map updated at event {}",
                    self.handle.0, self.event_counter
                );
            }
        }

        let (unmapped, mapped) = channel::select(self.unmapped_channel, self.hop, &self.channel_map);
        self.unmapped_channel = unmapped;
        self.data_channel = mapped;

        let (participate, suppress_tx) = match self.role {
            Role::Peripheral => {
                let go = self.tx.has_pending()
                    || self.skipped_events >= self.latency
                    || self.event_counter < early_sync_events;
                (go, false)
            }
            // The central participates in every event; past the latency
            // budget it keeps listening for resynchronization but stops
            // handing over transmit entries.
            Role::Central => (true, self.sync_misses > self.latency),
        };
        if participate {
            self.skipped_events = 0;
        } else {
            self.skipped_events = self.skipped_events.saturating_add(1);
        }

        EventPlan {
            wake,
            participate,
            channel: mapped,
            first_packet,
            suppress_tx,
            params_applied,
        }
    }

    fn apply_params(&mut self, p: &PendingParams) {
        self.win_size = p.win_size as u32 * TICKS_PER_CONN_UNIT;
        self.win_offset = p.win_offset as u32 * TICKS_PER_CONN_UNIT;
        self.interval = p.interval as u32 * TICKS_PER_CONN_UNIT;
        self.latency = p.latency;
        self.timeout = p.timeout as ExtTicks * TICKS_PER_TIMEOUT_UNIT as ExtTicks;
    }

    /// Record the outcome of a completed radio operation for this
    /// connection. A failure past the supervision timeout reports
    /// [`Error::SynchronizationLost`]; single misses are absorbed.
    pub fn note_event_result(
        &mut self,
        ok: bool,
        now: ExtTicks,
        report: &EventReport,
    ) -> Result<(), Error> {
        self.state = ConnState::Scheduled;
        if ok {
            self.last_sync = now;
            self.sync_misses = 0;
            if report.timestamp_valid {
                self.last_timestamp = Some(report.timestamp);
                self.anchor = now;
            }
            Ok(())
        } else {
            self.sync_misses = self.sync_misses.saturating_add(1);
            self.last_timestamp = None;
            if now.saturating_sub(self.last_sync) > self.timeout {
                Err(Error::SynchronizationLost)
            } else {
                Ok(())
            }
        }
    }

    /// Record a peer-requested connection-parameter update. At most one may
    /// be outstanding; a second request before the instant is a protocol
    /// violation.
    pub fn set_pending_params(&mut self, p: PendingParams) -> Result<(), Error> {
        if self.pending_params.is_some() {
            return Err(Error::ProtocolViolation);
        }
        self.pending_params = Some(p);
        Ok(())
    }

    /// Record a pending channel-map update.
    pub fn set_pending_map(&mut self, m: PendingChannelMap) -> Result<(), Error> {
        if m.map.used_count() == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.pending_map.is_some() {
            return Err(Error::ProtocolViolation);
        }
        self.pending_map = Some(m);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> ConnectRequest {
        ConnectRequest {
            initiator: DeviceAddress([1, 2, 3, 4, 5, 6]),
            advertiser: DeviceAddress([7, 8, 9, 10, 11, 12]),
            access_address: 0x5033_AB12,
            crc_init: [0x11, 0x22, 0x33],
            win_size: 2,
            win_offset: 50,
            interval: 30,
            latency: 0,
            timeout: 600,
            channel_map: ChannelMap::all(),
            hop: 7,
            sca: 0,
        }
    }

    fn peripheral() -> ConnectionContext {
        ConnectionContext::from_connect_request(ConnHandle(0), &test_request(), 1_000_000)
    }

    fn tb() -> TimeBase {
        TimeBase::new(1 << 30, 4096)
    }

    #[test]
    fn parse_connect_request_round_trip() {
        let mut body = [0u8; ConnectRequest::BODY_LEN];
        body[..6].copy_from_slice(&[6, 5, 4, 3, 2, 1]);
        body[6..12].copy_from_slice(&[12, 11, 10, 9, 8, 7]);
        body[12..16].copy_from_slice(&0x5033_AB12u32.to_le_bytes());
        body[16..19].copy_from_slice(&[0x11, 0x22, 0x33]);
        body[19] = 2; // win size
        body[20..22].copy_from_slice(&50u16.to_le_bytes());
        body[22..24].copy_from_slice(&30u16.to_le_bytes());
        body[24..26].copy_from_slice(&0u16.to_le_bytes());
        body[26..28].copy_from_slice(&600u16.to_le_bytes());
        body[28..33].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        body[33] = 7; // hop 7, sca 0

        let req = ConnectRequest::parse(&body).unwrap();
        assert_eq!(req.initiator, DeviceAddress([1, 2, 3, 4, 5, 6]));
        assert_eq!(req.advertiser, DeviceAddress([7, 8, 9, 10, 11, 12]));
        assert_eq!(req.access_address, 0x5033_AB12);
        assert_eq!(req.interval, 30);
        assert_eq!(req.timeout, 600);
        assert_eq!(req.channel_map.used_count(), 37);
        assert_eq!(req.hop, 7);
    }

    #[test]
    fn parse_rejects_bad_hop_and_short_body() {
        assert!(matches!(
            ConnectRequest::parse(&[0u8; 10]),
            Err(Error::ProtocolViolation)
        ));
        let mut body = [0u8; ConnectRequest::BODY_LEN];
        body[22] = 30; // interval
        body[28] = 0xFF; // some used channels
        body[33] = 2; // hop below range
        assert!(ConnectRequest::parse(&body).is_err());
    }

    #[test]
    fn first_event_recomputes_from_anchor() {
        let mut ctx = peripheral();
        let plan = ctx.plan_event(&tb(), 0, 16);
        assert!(plan.first_packet);
        assert_eq!(ctx.event_counter, 1);
        // anchor + win_offset - widening
        let expected = ctx.anchor + 50 * 5000 - 3000;
        assert_eq!(plan.wake, expected);
        // No timestamp yet: fallback to wake + interval.
        assert_eq!(ctx.next_wake, expected + 30 * 5000);
    }

    #[test]
    fn pending_params_applied_exactly_once_at_instant() {
        let mut ctx = peripheral();
        ctx.set_pending_params(PendingParams {
            win_size: 2,
            win_offset: 10,
            interval: 60,
            latency: 1,
            timeout: 400,
            instant: 5,
        })
        .unwrap();

        let old_interval = ctx.interval;
        for event in 1..=10u16 {
            let plan = ctx.plan_event(&tb(), 0, 16);
            assert_eq!(ctx.event_counter, event);
            if event < 5 {
                assert!(plan.params_applied.is_none());
                assert_eq!(ctx.interval, old_interval);
            } else if event == 5 {
                assert_eq!(plan.params_applied, Some((60, 1, 400)));
                assert_eq!(ctx.interval, 60 * 5000);
                assert_eq!(ctx.latency, 1);
                assert!(ctx.pending_params.is_none());
                // Extra interval + window offset folded into the next wake.
                assert_eq!(
                    ctx.next_wake,
                    plan.wake + (60 * 5000 + 10 * 5000) as ExtTicks
                );
            } else {
                // Never applied a second time.
                assert!(plan.params_applied.is_none());
                assert_eq!(ctx.interval, 60 * 5000);
            }
        }
    }

    #[test]
    fn second_pending_update_before_instant_rejected() {
        let mut ctx = peripheral();
        let p = PendingParams {
            win_size: 1,
            win_offset: 0,
            interval: 24,
            latency: 0,
            timeout: 300,
            instant: 9,
        };
        ctx.set_pending_params(p).unwrap();
        assert_eq!(ctx.set_pending_params(p), Err(Error::ProtocolViolation));
    }

    #[test]
    fn channel_map_update_applied_at_instant() {
        let mut ctx = peripheral();
        let narrow = ChannelMap::from_mask(0x1FF);
        ctx.set_pending_map(PendingChannelMap {
            map: narrow,
            instant: 3,
        })
        .unwrap();
        for _ in 1..=2 {
            ctx.plan_event(&tb(), 0, 16);
            assert_eq!(ctx.channel_map.used_count(), 37);
        }
        let plan = ctx.plan_event(&tb(), 0, 16);
        assert_eq!(ctx.channel_map, narrow);
        assert!(ctx.pending_map.is_none());
        // The post-update hop already lands in the narrow map.
        assert!(narrow.is_used(plan.channel));
    }

    #[test]
    fn peripheral_skips_up_to_latency_when_idle() {
        let mut ctx = peripheral();
        ctx.latency = 2;
        // Early threshold of 1 disables the early-connection override from
        // event 1 on.
        let early = 1;
        let p1 = ctx.plan_event(&tb(), 0, early);
        assert!(!p1.participate);
        let p2 = ctx.plan_event(&tb(), 0, early);
        assert!(!p2.participate);
        // Skipped-event budget reached: must participate.
        let p3 = ctx.plan_event(&tb(), 0, early);
        assert!(p3.participate);
        assert_eq!(ctx.skipped_events, 0);
    }

    #[test]
    fn queued_tx_forces_participation() {
        let mut ctx = peripheral();
        ctx.latency = 10;
        ctx.tx.enqueue(crate::ring::Llid::DataStart, b"x").unwrap();
        let plan = ctx.plan_event(&tb(), 0, 1);
        assert!(plan.participate);
    }

    #[test]
    fn central_participates_unconditionally_but_mutes_tx() {
        let req = test_request();
        let mut ctx =
            ConnectionContext::from_initiation(ConnHandle(1), req.initiator, &req, 2_000_000);
        ctx.latency = 1;
        ctx.sync_misses = 2;
        let plan = ctx.plan_event(&tb(), 0, 16);
        assert!(plan.participate);
        assert!(plan.suppress_tx);
    }

    #[test]
    fn timestamp_correction_drives_next_wake() {
        let mut ctx = peripheral();
        ctx.plan_event(&tb(), 0, 16);
        let report = EventReport {
            timestamp_valid: true,
            timestamp: 9_000_000,
        };
        ctx.note_event_result(true, 9_100_000, &report).unwrap();
        let tbase = tb();
        ctx.plan_event(&tbase, 9_200_000, 16);
        assert_eq!(
            ctx.next_wake,
            9_000_000 + (30 * 5000) as ExtTicks - 3000
        );
    }

    #[test]
    fn supervision_timeout_reported_once_budget_exceeded() {
        let mut ctx = peripheral();
        let report = EventReport::default();
        // timeout = 600 * 10 ms = 24_000_000 ticks past last_sync.
        let start = ctx.last_sync;
        assert!(ctx
            .note_event_result(false, start + 1_000_000, &report)
            .is_ok());
        assert_eq!(
            ctx.note_event_result(false, start + ctx.timeout + 1, &report),
            Err(Error::SynchronizationLost)
        );
    }

    #[test]
    fn early_window_moves_anchor_one_interval() {
        let mut req = test_request();
        req.win_offset = 4; // 20_000 ticks, below the floor
        let ctx = ConnectionContext::from_connect_request(ConnHandle(0), &req, 1_000_000);
        let base = 1_000_000 + CONN_EVENT_DELAY as ExtTicks;
        assert_eq!(ctx.anchor, base + (30 * 5000) as ExtTicks);
    }

    #[test]
    fn early_window_counts_and_hops_the_skipped_event() {
        let mut req = test_request();
        req.win_offset = 4; // below the floor
        let mut ctx = ConnectionContext::from_connect_request(ConnHandle(0), &req, 1_000_000);
        // The skipped first event is counted and its channel consumed.
        assert_eq!(ctx.event_counter, 1);
        assert_eq!(ctx.data_channel, 7);

        let plan = ctx.plan_event(&tb(), 0, 16);
        assert!(plan.first_packet);
        assert_eq!(ctx.event_counter, 2);
        // Two hops from channel 0: the first executed event runs on the
        // second hop's channel.
        assert_eq!(plan.channel, 14);
        assert_eq!(plan.wake, ctx.anchor + (4 * 5000) as ExtTicks - 3000);
    }
}
