//! Shared protocol types, time units and the caller-facing result/error sets.

/// Raw value of the radio's free-running 4 MHz timer (0.25 µs per tick).
/// Wraps silently every 2^32 ticks (about 18 minutes).
pub type RawTicks = u32;

/// Monotonic extended timestamp in radio ticks, produced by
/// [`crate::timebase::TimeBase`].
pub type ExtTicks = u64;

/// Radio ticks per 1.25 ms connection-timing unit.
pub const TICKS_PER_CONN_UNIT: u32 = 5000;
/// Radio ticks per 0.625 ms advertising-interval unit.
pub const TICKS_PER_ADV_UNIT: u32 = 2500;
/// Radio ticks per 10 ms supervision-timeout unit.
pub const TICKS_PER_TIMEOUT_UNIT: u32 = 40_000;

/// Window widening margin applied by the peripheral role (0.75 ms).
pub const WINDOW_WIDENING: u32 = 3000;
/// Mandatory delay between the end of the connect request and the start of
/// the first transmit window (1.25 ms).
pub const CONN_EVENT_DELAY: u32 = 5000;

/// Maximum payload of a single data-channel PDU.
pub const MAX_DATA_PAYLOAD: usize = 27;

/// A 48-bit device address, little-endian byte order.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceAddress(pub [u8; 6]);

/// Locally assigned handle identifying an active connection.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u8);

/// Result enumeration returned from every public entry point.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioResult {
    Ok,
    /// The radio needs a power cycle before the request can succeed.
    RequireCycle,
    NotSupported,
    InvalidValue,
    /// The resource is already owned; retry or queue.
    InUse,
    Error,
}

/// Internal failure taxonomy.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A command is already outstanding or the radio is inaccessible.
    Busy,
    /// Value out of protocol range.
    InvalidParameter,
    /// The immediate acknowledgement wait exceeded its bound.
    HardwareTimeout,
    /// Unexpected or malformed in-band control message. The connection
    /// continues; the message is dropped.
    ProtocolViolation,
    /// Consecutive missed events exceeded the latency budget.
    SynchronizationLost,
}

impl From<Error> for RadioResult {
    fn from(e: Error) -> Self {
        match e {
            Error::Busy => RadioResult::InUse,
            Error::InvalidParameter => RadioResult::InvalidValue,
            Error::HardwareTimeout => RadioResult::RequireCycle,
            Error::ProtocolViolation | Error::SynchronizationLost => RadioResult::Error,
        }
    }
}

/// Why a connection went away.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// No valid event within the supervision timeout.
    SupervisionTimeout,
    /// The peer sent a terminate indication with this error code.
    PeerTerminated(u8),
    /// Local `disconnect` request.
    LocalRequest,
}

/// Notification delivered to the upper layer.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkEvent<'a> {
    /// A complete inbound message, with the reconciled receive timestamp of
    /// its first fragment.
    DataReceived {
        handle: ConnHandle,
        data: &'a [u8],
        timestamp: ExtTicks,
    },
    /// `released` transmit entries completed and returned to the free pool.
    TransmitComplete { handle: ConnHandle, released: usize },
    ConnectionEstablished {
        handle: ConnHandle,
        peer: DeviceAddress,
    },
    /// A pending connection-parameter update took effect at its instant.
    /// Units: interval 1.25 ms, timeout 10 ms.
    ParamsUpdated {
        handle: ConnHandle,
        interval: u16,
        latency: u16,
        timeout: u16,
    },
    Disconnected {
        handle: ConnHandle,
        reason: DisconnectReason,
    },
}

/// Upper-layer sink for [`LinkEvent`] notifications.
pub trait EventSink {
    fn event(&mut self, event: LinkEvent<'_>);
}

impl<F: FnMut(LinkEvent<'_>)> EventSink for F {
    fn event(&mut self, event: LinkEvent<'_>) {
        self(event)
    }
}
