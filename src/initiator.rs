//! Initiator role session: scan the advertising channels for one peer and
//! transmit a connect request, then promote to a central-role connection.

use crate::channel::ChannelMap;
use crate::conn::ConnectRequest;
use crate::ring::RxRing;
use crate::types::{DeviceAddress, Error};

/// Caller-chosen parameters of the connection to be created.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectParams {
    /// 1.25 ms units, 6..=3200.
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units, 10..=3200.
    pub timeout: u16,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            interval: 40,
            latency: 0,
            timeout: 200,
        }
    }
}

pub struct InitiatorSession {
    pub(crate) request: ConnectRequest,
    /// Advertising channel currently scanned.
    pub(crate) scan_channel: u8,
    pub(crate) rx: RxRing,
}

impl InitiatorSession {
    pub fn new(
        own_addr: DeviceAddress,
        peer: DeviceAddress,
        params: &ConnectParams,
    ) -> Result<Self, Error> {
        if !(6..=3200).contains(&params.interval)
            || !(10..=3200).contains(&params.timeout)
            || params.latency >= 500
        {
            return Err(Error::InvalidParameter);
        }
        let access_address = derive_access_address(&own_addr, &peer);
        let request = ConnectRequest {
            initiator: own_addr,
            advertiser: peer,
            access_address,
            crc_init: [
                (access_address >> 8) as u8,
                (access_address >> 16) as u8,
                (access_address >> 24) as u8,
            ],
            win_size: 2,
            // Comfortably past the turnaround floor.
            win_offset: 13,
            interval: params.interval,
            latency: params.latency,
            timeout: params.timeout,
            channel_map: ChannelMap::all(),
            hop: 7,
            sca: 0,
        };
        Ok(Self {
            request,
            scan_channel: 37,
            rx: RxRing::new(),
        })
    }

    pub fn peer(&self) -> DeviceAddress {
        self.request.advertiser
    }

    /// Advance to the next advertising channel after an empty scan window.
    pub fn hop_scan_channel(&mut self) {
        self.scan_channel = match self.scan_channel {
            37 => 38,
            38 => 39,
            _ => 37,
        };
    }
}

/// Deterministic per-pair access address. Mixes both device addresses
/// through a 64-bit finalizer; the result is never the advertising access
/// address and never all-zero.
fn derive_access_address(own: &DeviceAddress, peer: &DeviceAddress) -> u32 {
    let mut x = 0u64;
    for (i, &b) in own.0.iter().chain(peer.0.iter()).enumerate() {
        x ^= (b as u64) << ((i % 8) * 8);
        x = x.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        x ^= x >> 29;
    }
    let aa = (x as u32) ^ ((x >> 32) as u32);
    if aa == 0 || aa == 0x8E89_BED6 {
        0x5A5A_5A5A
    } else {
        aa
    }
}
