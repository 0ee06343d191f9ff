//! Advertiser role session.
//!
//! One advertising event transmits on every enabled advertising channel in
//! ascending order, one radio operation per channel chained through command
//! completions, then the interval timer is re-armed.

use heapless::Vec;

use crate::ring::RxRing;
use crate::types::{DeviceAddress, Error, RawTicks, TICKS_PER_ADV_UNIT};

/// Advertising channel indices.
pub const ADV_CHANNEL_MIN: u8 = 37;
pub const ADV_CHANNEL_MAX: u8 = 39;

/// Maximum advertising / scan-response payload.
pub const ADV_DATA_LEN: usize = 31;

/// Channel enable bits, bit 0 = channel 37.
pub const CHANNEL_37: u8 = 1 << 0;
pub const CHANNEL_38: u8 = 1 << 1;
pub const CHANNEL_39: u8 = 1 << 2;
pub const ALL_CHANNELS: u8 = CHANNEL_37 | CHANNEL_38 | CHANNEL_39;

pub struct AdvertisingSession {
    pub(crate) own_addr: DeviceAddress,
    /// Advertising interval in radio ticks.
    pub(crate) interval: RawTicks,
    /// Enabled-channel bitmap.
    pub(crate) channels: u8,
    pub(crate) adv_data: Vec<u8, ADV_DATA_LEN>,
    pub(crate) scan_rsp_data: Vec<u8, ADV_DATA_LEN>,
    /// Connect requests land here.
    pub(crate) rx: RxRing,
}

impl AdvertisingSession {
    /// `interval` in 0.625 ms advertising units, 0x20..=0x4000.
    pub fn new(
        own_addr: DeviceAddress,
        interval: u16,
        channels: u8,
    ) -> Result<Self, Error> {
        if !(0x20..=0x4000).contains(&interval) {
            return Err(Error::InvalidParameter);
        }
        if channels == 0 || channels & !ALL_CHANNELS != 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(Self {
            own_addr,
            interval: interval as RawTicks * TICKS_PER_ADV_UNIT,
            channels,
            adv_data: Vec::new(),
            scan_rsp_data: Vec::new(),
            rx: RxRing::new(),
        })
    }

    pub fn set_adv_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.adv_data.clear();
        self.adv_data
            .extend_from_slice(data)
            .map_err(|_| Error::InvalidParameter)
    }

    pub fn set_scan_rsp_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.scan_rsp_data.clear();
        self.scan_rsp_data
            .extend_from_slice(data)
            .map_err(|_| Error::InvalidParameter)
    }

    pub fn interval_ticks(&self) -> RawTicks {
        self.interval
    }

    /// First enabled channel of an advertising event.
    pub fn first_channel(&self) -> u8 {
        self.next_enabled(ADV_CHANNEL_MIN)
            .unwrap_or(ADV_CHANNEL_MAX)
    }

    /// Next enabled channel strictly after `channel`, within this event.
    pub fn channel_after(&self, channel: u8) -> Option<u8> {
        if channel >= ADV_CHANNEL_MAX {
            return None;
        }
        self.next_enabled(channel + 1)
    }

    fn next_enabled(&self, from: u8) -> Option<u8> {
        (from..=ADV_CHANNEL_MAX).find(|c| self.channels & (1 << (c - ADV_CHANNEL_MIN)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(channels: u8) -> AdvertisingSession {
        AdvertisingSession::new(DeviceAddress([1, 2, 3, 4, 5, 6]), 0x20, channels).unwrap()
    }

    #[test]
    fn interval_converted_to_ticks() {
        let s = session(ALL_CHANNELS);
        assert_eq!(s.interval_ticks(), 0x20 * 2500);
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let addr = DeviceAddress::default();
        assert!(AdvertisingSession::new(addr, 0x1F, ALL_CHANNELS).is_err());
        assert!(AdvertisingSession::new(addr, 0x4001, ALL_CHANNELS).is_err());
        assert!(AdvertisingSession::new(addr, 0x20, 0).is_err());
        assert!(AdvertisingSession::new(addr, 0x20, 0b1000).is_err());
    }

    #[test]
    fn chains_all_enabled_channels_ascending() {
        let s = session(ALL_CHANNELS);
        assert_eq!(s.first_channel(), 37);
        assert_eq!(s.channel_after(37), Some(38));
        assert_eq!(s.channel_after(38), Some(39));
        assert_eq!(s.channel_after(39), None);
    }

    #[test]
    fn skips_disabled_channels() {
        let s = session(CHANNEL_37 | CHANNEL_39);
        assert_eq!(s.first_channel(), 37);
        assert_eq!(s.channel_after(37), Some(39));
        assert_eq!(s.channel_after(39), None);

        let only_39 = session(CHANNEL_39);
        assert_eq!(only_39.first_channel(), 39);
        assert_eq!(only_39.channel_after(39), None);
    }

    #[test]
    fn adv_data_bounded_at_31_bytes() {
        let mut s = session(ALL_CHANNELS);
        assert!(s.set_adv_data(&[0; 31]).is_ok());
        assert_eq!(s.set_adv_data(&[0; 32]), Err(Error::InvalidParameter));
    }
}
