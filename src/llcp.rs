//! In-band link-control message processing.
//!
//! Control PDUs arrive on the data channel with LLID 3. Updates with an
//! instant are only recorded here; they take effect in the per-event
//! scheduling when the live event counter reaches the instant.

use arbitrary_int::u2;
use bitbybit::bitfield;

use crate::channel::ChannelMap;
use crate::conn::{ConnectionContext, PendingChannelMap, PendingParams, Role};
use crate::ring::Llid;
use crate::types::Error;

pub const LL_CONNECTION_UPDATE_REQ: u8 = 0x00;
pub const LL_CHANNEL_MAP_REQ: u8 = 0x01;
pub const LL_TERMINATE_IND: u8 = 0x02;
pub const LL_FEATURE_REQ: u8 = 0x08;
pub const LL_FEATURE_RSP: u8 = 0x09;
pub const LL_VERSION_IND: u8 = 0x0C;
pub const LL_CONNECTION_PARAM_REQ: u8 = 0x0F;

/// Link-layer version 4.1.
pub const VERSION: u8 = 0x07;
pub const COMPANY_ID: u16 = 0xFFFF;
pub const SUBVERSION: u16 = 0xBEEF;

/// First byte of every data-channel PDU.
#[bitfield(u8, default = 0)]
pub struct DataHeader {
    #[bits(0..=1, rw)]
    pub llid: u2,
    #[bit(2, rw)]
    pub nesn: bool,
    #[bit(3, rw)]
    pub sn: bool,
    /// More data follows within the same connection event.
    #[bit(4, rw)]
    pub md: bool,
}

impl DataHeader {
    pub fn llid_kind(&self) -> Option<Llid> {
        Llid::from_bits(self.llid().value())
    }

    pub fn for_llid(llid: Llid) -> Self {
        Self::DEFAULT.with_llid(u2::new(llid as u8))
    }
}

/// What the controller must do after a control PDU was processed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    None,
    /// Peer tears the connection down with this reason code.
    Terminate { reason: u8 },
    /// Peer-initiated parameter negotiation, forwarded to the
    /// connection-update path with the peer's minimum-interval proposal.
    ParamRequest {
        interval: u16,
        latency: u16,
        timeout: u16,
    },
}

/// An instant is valid while it is strictly ahead of the live counter,
/// within half the counter range.
fn instant_ahead(instant: u16, counter: u16) -> bool {
    let delta = instant.wrapping_sub(counter);
    delta != 0 && delta < 0x8000
}

fn respond(ctx: &mut ConnectionContext, payload: &[u8]) {
    // A saturated transmit ring drops the response; the peer retries.
    if ctx.tx_ring_mut().enqueue(Llid::Control, payload).is_none() {
        warn!("control response dropped, transmit ring full");
    }
}

/// Process one control PDU (opcode plus payload, data header already
/// stripped). Malformed or role-invalid messages are dropped with
/// [`Error::ProtocolViolation`]; the connection continues.
pub fn process(ctx: &mut ConnectionContext, pdu: &[u8]) -> Result<Outcome, Error> {
    let (&opcode, body) = pdu.split_first().ok_or(Error::ProtocolViolation)?;
    match opcode {
        LL_CONNECTION_UPDATE_REQ => {
            // Only the central may drive a connection update.
            if ctx.role() == Role::Central || body.len() < 11 {
                return Err(Error::ProtocolViolation);
            }
            let instant = u16::from_le_bytes([body[9], body[10]]);
            if !instant_ahead(instant, ctx.event_counter()) {
                return Err(Error::ProtocolViolation);
            }
            ctx.set_pending_params(PendingParams {
                win_size: body[0],
                win_offset: u16::from_le_bytes([body[1], body[2]]),
                interval: u16::from_le_bytes([body[3], body[4]]),
                latency: u16::from_le_bytes([body[5], body[6]]),
                timeout: u16::from_le_bytes([body[7], body[8]]),
                instant,
            })?;
            debug!("ll: connection update pending, instant {}", instant);
            Ok(Outcome::None)
        }
        LL_CHANNEL_MAP_REQ => {
            if ctx.role() == Role::Central || body.len() < 7 {
                return Err(Error::ProtocolViolation);
            }
            let mut bits = 0u64;
            for i in 0..5 {
                bits |= (body[i] as u64) << (8 * i);
            }
            let instant = u16::from_le_bytes([body[5], body[6]]);
            if !instant_ahead(instant, ctx.event_counter()) {
                return Err(Error::ProtocolViolation);
            }
            ctx.set_pending_map(PendingChannelMap {
                map: ChannelMap::from_mask(bits),
                instant,
            })?;
            debug!("ll: channel map pending, instant {}", instant);
            Ok(Outcome::None)
        }
        LL_TERMINATE_IND => {
            let reason = body.first().copied().ok_or(Error::ProtocolViolation)?;
            Ok(Outcome::Terminate { reason })
        }
        LL_FEATURE_REQ => {
            // No optional features supported.
            let mut rsp = [0u8; 9];
            rsp[0] = LL_FEATURE_RSP;
            respond(ctx, &rsp);
            Ok(Outcome::None)
        }
        LL_VERSION_IND => {
            let mut rsp = [0u8; 6];
            rsp[0] = LL_VERSION_IND;
            rsp[1] = VERSION;
            rsp[2..4].copy_from_slice(&COMPANY_ID.to_le_bytes());
            rsp[4..6].copy_from_slice(&SUBVERSION.to_le_bytes());
            respond(ctx, &rsp);
            Ok(Outcome::None)
        }
        LL_CONNECTION_PARAM_REQ => {
            if body.len() < 8 {
                return Err(Error::ProtocolViolation);
            }
            Ok(Outcome::ParamRequest {
                interval: u16::from_le_bytes([body[0], body[1]]),
                latency: u16::from_le_bytes([body[4], body[5]]),
                timeout: u16::from_le_bytes([body[6], body[7]]),
            })
        }
        other => {
            debug!("ll: unsupported control opcode {:#x}", other);
            Ok(Outcome::None)
        }
    }
}

/// Serialize a connection-update request for the central to transmit.
pub fn encode_connection_update(p: &PendingParams, out: &mut [u8; 12]) {
    out[0] = LL_CONNECTION_UPDATE_REQ;
    out[1] = p.win_size;
    out[2..4].copy_from_slice(&p.win_offset.to_le_bytes());
    out[4..6].copy_from_slice(&p.interval.to_le_bytes());
    out[6..8].copy_from_slice(&p.latency.to_le_bytes());
    out[8..10].copy_from_slice(&p.timeout.to_le_bytes());
    out[10..12].copy_from_slice(&p.instant.to_le_bytes());
}

/// Serialize a local terminate indication.
pub fn encode_terminate(reason: u8) -> [u8; 2] {
    [LL_TERMINATE_IND, reason]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnectRequest;
    use crate::ring::SlotStatus;
    use crate::types::{ConnHandle, DeviceAddress};

    fn peripheral() -> ConnectionContext {
        let req = ConnectRequest {
            initiator: DeviceAddress([1, 2, 3, 4, 5, 6]),
            advertiser: DeviceAddress([7, 8, 9, 10, 11, 12]),
            access_address: 0x1234_5678,
            crc_init: [1, 2, 3],
            win_size: 2,
            win_offset: 50,
            interval: 30,
            latency: 0,
            timeout: 600,
            channel_map: ChannelMap::all(),
            hop: 7,
            sca: 0,
        };
        ConnectionContext::from_connect_request(ConnHandle(0), &req, 0)
    }

    fn queued_control_payload(ctx: &mut ConnectionContext) -> &[u8] {
        let tx = ctx.tx_ring_mut();
        assert_eq!(tx.slot(0).status(), SlotStatus::HwOwned);
        assert_eq!(tx.slot(0).llid(), Llid::Control);
        tx.slot(0).payload()
    }

    #[test]
    fn data_header_round_trip() {
        let h = DataHeader::for_llid(Llid::Control).with_sn(true).with_md(true);
        let raw = h.raw_value();
        let back = DataHeader::new_with_raw_value(raw);
        assert_eq!(back.llid_kind(), Some(Llid::Control));
        assert!(back.sn());
        assert!(back.md());
        assert!(!back.nesn());
    }

    #[test]
    fn connection_update_recorded_not_applied() {
        let mut ctx = peripheral();
        let old_interval_ticks = 30 * 5000;
        let mut pdu = [0u8; 12];
        encode_connection_update(
            &PendingParams {
                win_size: 1,
                win_offset: 10,
                interval: 60,
                latency: 2,
                timeout: 400,
                instant: 8,
            },
            &mut pdu,
        );
        assert_eq!(process(&mut ctx, &pdu), Ok(Outcome::None));
        // Recorded as pending only; live timing untouched.
        assert_eq!(ctx.interval, old_interval_ticks);
        let p = ctx.pending_params.unwrap();
        assert_eq!(p.interval, 60);
        assert_eq!(p.instant, 8);
    }

    #[test]
    fn update_on_central_is_violation() {
        let req = ConnectRequest {
            initiator: DeviceAddress::default(),
            advertiser: DeviceAddress::default(),
            access_address: 1,
            crc_init: [0; 3],
            win_size: 1,
            win_offset: 40,
            interval: 30,
            latency: 0,
            timeout: 600,
            channel_map: ChannelMap::all(),
            hop: 9,
            sca: 0,
        };
        let mut ctx =
            ConnectionContext::from_initiation(ConnHandle(1), req.initiator, &req, 0);
        let mut pdu = [0u8; 12];
        encode_connection_update(
            &PendingParams {
                win_size: 1,
                win_offset: 0,
                interval: 24,
                latency: 0,
                timeout: 100,
                instant: 5,
            },
            &mut pdu,
        );
        assert_eq!(process(&mut ctx, &pdu), Err(Error::ProtocolViolation));
    }

    #[test]
    fn stale_instant_rejected() {
        let mut ctx = peripheral();
        let mut pdu = [0u8; 12];
        encode_connection_update(
            &PendingParams {
                win_size: 1,
                win_offset: 0,
                interval: 24,
                latency: 0,
                timeout: 100,
                instant: 0, // equals the live counter
            },
            &mut pdu,
        );
        assert_eq!(process(&mut ctx, &pdu), Err(Error::ProtocolViolation));
        assert!(ctx.pending_params.is_none());
    }

    #[test]
    fn channel_map_request_recorded() {
        let mut ctx = peripheral();
        let mut pdu = [0u8; 8];
        pdu[0] = LL_CHANNEL_MAP_REQ;
        pdu[1..6].copy_from_slice(&[0xFF, 0x01, 0, 0, 0]);
        pdu[6..8].copy_from_slice(&4u16.to_le_bytes());
        assert_eq!(process(&mut ctx, &pdu), Ok(Outcome::None));
        let m = ctx.pending_map.unwrap();
        assert_eq!(m.map.used_count(), 9);
        assert_eq!(m.instant, 4);
        // Live map untouched until the instant.
        assert_eq!(ctx.channel_map.used_count(), 37);
    }

    #[test]
    fn terminate_reports_reason() {
        let mut ctx = peripheral();
        assert_eq!(
            process(&mut ctx, &[LL_TERMINATE_IND, 0x13]),
            Ok(Outcome::Terminate { reason: 0x13 })
        );
    }

    #[test]
    fn feature_request_answered_with_empty_set() {
        let mut ctx = peripheral();
        let mut pdu = [0u8; 9];
        pdu[0] = LL_FEATURE_REQ;
        pdu[1] = 0xFF;
        assert_eq!(process(&mut ctx, &pdu), Ok(Outcome::None));
        let rsp = queued_control_payload(&mut ctx);
        assert_eq!(rsp[0], LL_FEATURE_RSP);
        assert_eq!(&rsp[1..], &[0u8; 8]);
    }

    #[test]
    fn version_answered_with_fixed_identity() {
        let mut ctx = peripheral();
        let pdu = [LL_VERSION_IND, 0x06, 0x0F, 0x00, 0x00, 0x22];
        assert_eq!(process(&mut ctx, &pdu), Ok(Outcome::None));
        let rsp = queued_control_payload(&mut ctx);
        assert_eq!(rsp, &[LL_VERSION_IND, 0x07, 0xFF, 0xFF, 0xEF, 0xBE]);
    }

    #[test]
    fn param_request_forwards_minimum_interval() {
        let mut ctx = peripheral();
        let mut pdu = [0u8; 24];
        pdu[0] = LL_CONNECTION_PARAM_REQ;
        pdu[1..3].copy_from_slice(&24u16.to_le_bytes()); // interval min
        pdu[3..5].copy_from_slice(&40u16.to_le_bytes()); // interval max
        pdu[5..7].copy_from_slice(&1u16.to_le_bytes()); // latency
        pdu[7..9].copy_from_slice(&300u16.to_le_bytes()); // timeout
        assert_eq!(
            process(&mut ctx, &pdu),
            Ok(Outcome::ParamRequest {
                interval: 24,
                latency: 1,
                timeout: 300,
            })
        );
    }

    #[test]
    fn unknown_opcode_is_dropped_quietly() {
        let mut ctx = peripheral();
        assert_eq!(process(&mut ctx, &[0x3A, 1, 2, 3]), Ok(Outcome::None));
        assert!(!ctx.tx_ring_mut().has_pending());
    }

    #[test]
    fn empty_pdu_is_violation() {
        let mut ctx = peripheral();
        assert_eq!(process(&mut ctx, &[]), Err(Error::ProtocolViolation));
    }
}
