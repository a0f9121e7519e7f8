// ABOUTME: Fragment and Frame data types exchanged between transports, worker and callers
// ABOUTME: A fragment is one timestamped transport read; a frame is the assembled caller-visible unit

use bytes::{Bytes, BytesMut};
use std::ops::RangeBounds;
use std::time::Duration;
use tokio::time::Instant;

/// One atomic chunk of bytes observed on a transport, with the monotonic
/// timestamp at which it was read.
///
/// Fragments are immutable. Slicing a fragment yields a fragment that shares
/// the original timestamp: the timestamp marks when the bytes were observed,
/// not when a subrange was carved out of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    data: Bytes,
    timestamp: Instant,
}

impl Fragment {
    pub fn new(data: impl Into<Bytes>, timestamp: Instant) -> Self {
        Self {
            data: data.into(),
            timestamp,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a sub-fragment sharing this fragment's timestamp.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Fragment {
        Fragment {
            data: self.data.slice(range),
            timestamp: self.timestamp,
        }
    }

    /// Replaces the payload while keeping the observation timestamp. Used by
    /// the worker when deferred bytes are re-fed as the next fragment.
    pub(crate) fn with_data(&self, data: Bytes) -> Fragment {
        Fragment {
            data,
            timestamp: self.timestamp,
        }
    }
}

/// The stop-condition variant that closed a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Termination,
    Length,
    Continuation,
    Total,
    FragmentBoundary,
}

/// A completed read unit: one or more fragments closed by a stop condition,
/// or an empty frame produced by a response timeout with the
/// `ReturnEmpty` action.
///
/// The frame payload is exactly the concatenation of its fragments' bytes,
/// and fragment timestamps are monotonically non-decreasing.
#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) stop_timestamp: Instant,
    pub(crate) stop_kind: Option<StopKind>,
    pub(crate) previous_buffer_used: bool,
    pub(crate) response_delay: Option<Duration>,
}

impl Frame {
    /// An empty frame, used when a response timeout resolves to
    /// `ReturnEmpty` instead of an error.
    pub(crate) fn empty(now: Instant) -> Frame {
        Frame {
            fragments: Vec::new(),
            stop_timestamp: now,
            stop_kind: None,
            previous_buffer_used: false,
            response_delay: None,
        }
    }

    /// The frame payload: concatenated fragment bytes.
    pub fn payload(&self) -> Bytes {
        match self.fragments.as_slice() {
            [] => Bytes::new(),
            [single] => single.data().clone(),
            many => {
                let total = many.iter().map(Fragment::len).sum();
                let mut buf = BytesMut::with_capacity(total);
                for fragment in many {
                    buf.extend_from_slice(fragment.data());
                }
                buf.freeze()
            }
        }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Timestamp at which the closing stop condition fired (or the response
    /// timeout elapsed, for empty frames).
    pub fn stop_timestamp(&self) -> Instant {
        self.stop_timestamp
    }

    /// Which stop condition closed this frame. `None` for empty frames
    /// produced by a response timeout.
    pub fn stop_kind(&self) -> Option<StopKind> {
        self.stop_kind
    }

    /// True when deferred bytes carried over from a previous frame seeded
    /// this one.
    pub fn previous_buffer_used(&self) -> bool {
        self.previous_buffer_used
    }

    /// Time between the last write on this adapter and this frame's first
    /// fragment. `None` when no write preceded the frame or the first
    /// fragment predates the write.
    pub fn response_delay(&self) -> Option<Duration> {
        self.response_delay
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(Fragment::is_empty)
    }

    pub fn len(&self) -> usize {
        self.fragments.iter().map(Fragment::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_shares_timestamp() {
        let ts = Instant::now();
        let fragment = Fragment::new(&b"HELLO"[..], ts);
        let head = fragment.slice(..2);

        assert_eq!(head.data().as_ref(), b"HE");
        assert_eq!(head.timestamp(), ts);
    }

    #[test]
    fn payload_concatenates_fragments() {
        let ts = Instant::now();
        let frame = Frame {
            fragments: vec![
                Fragment::new(&b"AB"[..], ts),
                Fragment::new(&b""[..], ts),
                Fragment::new(&b"CDE"[..], ts),
            ],
            stop_timestamp: ts,
            stop_kind: Some(StopKind::Length),
            previous_buffer_used: false,
            response_delay: None,
        };

        assert_eq!(frame.payload().as_ref(), b"ABCDE");
        assert_eq!(frame.len(), 5);
        assert!(!frame.is_empty());
    }

    #[test]
    fn empty_frame_has_no_stop_kind() {
        let frame = Frame::empty(Instant::now());
        assert!(frame.is_empty());
        assert_eq!(frame.stop_kind(), None);
        assert_eq!(frame.payload().len(), 0);
    }
}
