//! The unit that travels inside a frame.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::CorrelationId;
use crate::version;

/// A payload tagged with the call it belongs to.
///
/// Calls are multiplexed on one connection, so the correlation id in the
/// header is also the stream id.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    pub header: EnvelopeHeader,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps the first frame of a new call.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self::with_header(EnvelopeHeader::new(), payload)
    }

    /// Wraps a later frame of the call `correlation_id`.
    #[must_use]
    pub fn for_call(correlation_id: CorrelationId, payload: T) -> Self {
        Self::with_header(EnvelopeHeader::for_call(correlation_id), payload)
    }

    const fn with_header(header: EnvelopeHeader, payload: T) -> Self {
        Self { header, payload }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u16,
    pub correlation_id: CorrelationId,
    /// Send time, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Absolute deadline in the same clock. Read only from the opening frame.
    pub deadline_ns: Option<u64>,
}

impl EnvelopeHeader {
    #[must_use]
    pub fn new() -> Self {
        Self::for_call(CorrelationId::new())
    }

    #[must_use]
    pub fn for_call(correlation_id: CorrelationId) -> Self {
        Self {
            version: version::CURRENT,
            correlation_id,
            timestamp_ns: unix_nanos(),
            deadline_ns: None,
        }
    }

    /// Gives the call `timeout` counted from this header's timestamp.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let budget = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        Self {
            deadline_ns: Some(self.timestamp_ns.saturating_add(budget)),
            ..self
        }
    }

    #[must_use]
    pub fn is_compatible(&self) -> bool {
        (version::MIN_SUPPORTED..=version::CURRENT).contains(&self.version)
    }

    /// True once the deadline has passed. Headers without one never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self.deadline_ns, Some(deadline) if unix_nanos() > deadline)
    }
}

impl Default for EnvelopeHeader {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn later_frames_reuse_the_call_id() {
        let open = Envelope::new(1u8);
        let next = Envelope::for_call(open.header.correlation_id, 2u8);
        assert_eq!(open.header.correlation_id, next.header.correlation_id);
        assert_ne!(open.header.correlation_id, Envelope::new(3u8).header.correlation_id);
        assert_eq!(next.header.deadline_ns, None);
    }

    #[test]
    fn deadline_is_relative_to_the_timestamp() {
        let header = EnvelopeHeader::new().with_timeout(Duration::from_secs(5));
        assert_eq!(header.deadline_ns, Some(header.timestamp_ns + 5_000_000_000));
        assert!(!header.is_expired());
    }

    #[test]
    fn elapsed_deadline_expires() {
        let header = EnvelopeHeader {
            deadline_ns: Some(unix_nanos().saturating_sub(1_000_000_000)),
            ..EnvelopeHeader::default()
        };
        assert!(header.is_expired());
    }

    #[test]
    fn version_zero_is_incompatible() {
        assert!(EnvelopeHeader::new().is_compatible());
        let header = EnvelopeHeader {
            version: 0,
            ..EnvelopeHeader::default()
        };
        assert!(!header.is_compatible());
    }
}
