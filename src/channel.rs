//! Data-channel map and the per-event hopping selection.

/// Number of data channels.
pub const NUM_DATA_CHANNELS: u8 = 37;

const CHANNEL_MASK: u64 = (1u64 << NUM_DATA_CHANNELS) - 1;

/// The set of data channels in use on a connection.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMap {
    mask: u64,
    used: u8,
}

impl ChannelMap {
    /// Build from a raw 37-bit mask; higher bits are ignored.
    pub fn from_mask(mask: u64) -> Self {
        let mask = mask & CHANNEL_MASK;
        Self {
            mask,
            used: mask.count_ones() as u8,
        }
    }

    /// All 37 data channels marked used.
    pub const fn all() -> Self {
        Self {
            mask: CHANNEL_MASK,
            used: NUM_DATA_CHANNELS,
        }
    }

    pub fn is_used(&self, channel: u8) -> bool {
        channel < NUM_DATA_CHANNELS && self.mask & (1u64 << channel) != 0
    }

    pub fn used_count(&self) -> u8 {
        self.used
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }
}

/// Select the data channel for the next connection event.
///
/// Returns `(new_unmapped, mapped)`. The unmapped channel advances by the
/// per-connection hop increment modulo 37; if it is not in the used set, it
/// remaps to the n-th used channel counting from channel 0, where
/// `n = new_unmapped % used_count`.
///
/// Must be called exactly once per connection event, after any channel-map
/// update whose instant has arrived has been applied.
pub fn select(unmapped: u8, hop: u8, map: &ChannelMap) -> (u8, u8) {
    let next = (unmapped + hop) % NUM_DATA_CHANNELS;
    if map.is_used(next) {
        return (next, next);
    }
    debug_assert!(map.used_count() > 0);
    if map.used_count() == 0 {
        return (next, next);
    }
    let remap_index = next % map.used_count();
    let mut seen = 0;
    for ch in 0..NUM_DATA_CHANNELS {
        if map.is_used(ch) {
            if seen == remap_index {
                return (next, ch);
            }
            seen += 1;
        }
    }
    // Unreachable with a non-empty map.
    (next, next)
}
