// ABOUTME: Stop conditions decide where one frame ends inside the incoming fragment stream
// ABOUTME: Each variant carries its own per-frame state behind an init/evaluate/flush contract

use crate::fragment::{Fragment, StopKind};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// A rule that closes a frame.
///
/// Stop conditions are installed on an adapter (or passed per read as an
/// override) and evaluated by the worker against every incoming fragment, in
/// install order; the first condition reporting a stop closes the frame and
/// its [`StopKind`] is recorded on it.
///
/// Byte-triggered variants (`Termination`, `Length`) may split a fragment:
/// the bytes up to the stop point are kept in the closing frame, the rest is
/// deferred and becomes the first input of the next frame. Time-triggered
/// variants (`Continuation`, `Total`) never carve bytes; they schedule worker
/// wakeups instead.
#[derive(Debug, Clone)]
pub enum StopCondition {
    /// Fires when `sequence` appears in the stream. The matched sequence is
    /// kept in the frame; protocol layers strip it if needed. Matching is
    /// transparent to fragmentation: a sequence split across fragments is
    /// still found.
    Termination {
        sequence: Bytes,
        failure: Vec<usize>,
        matched: usize,
    },
    /// Fires when the frame has accumulated `limit` bytes since the frame
    /// started; excess bytes are deferred.
    Length { limit: usize, received: usize },
    /// Fires when the gap since the last fragment reaches `gap`, once at
    /// least one fragment has been received.
    Continuation {
        gap: Duration,
        deadline: Option<Instant>,
    },
    /// Fires when `window` has elapsed since the frame's first fragment.
    Total {
        window: Duration,
        deadline: Option<Instant>,
    },
    /// Fires at every fragment boundary: one fragment, one frame.
    FragmentBoundary,
}

/// Outcome of evaluating one fragment against one stop condition.
#[derive(Debug)]
pub(crate) struct Evaluation {
    pub stop: bool,
    /// Bytes to append to the current frame.
    pub kept: Bytes,
    /// Bytes past the stop point, carried over beyond this frame.
    pub deferred: Bytes,
    /// Absolute time at which the worker must wake up even without data.
    pub wakeup: Option<Instant>,
}

impl Evaluation {
    fn pass(fragment: &Fragment, wakeup: Option<Instant>) -> Evaluation {
        Evaluation {
            stop: false,
            kept: fragment.data().clone(),
            deferred: Bytes::new(),
            wakeup,
        }
    }

    fn stop_whole(fragment: &Fragment) -> Evaluation {
        Evaluation {
            stop: true,
            kept: fragment.data().clone(),
            deferred: Bytes::new(),
            wakeup: None,
        }
    }
}

impl StopCondition {
    /// Stop once `sequence` has been seen.
    pub fn termination(sequence: impl Into<Bytes>) -> StopCondition {
        let sequence = sequence.into();
        let failure = failure_table(&sequence);
        StopCondition::Termination {
            sequence,
            failure,
            matched: 0,
        }
    }

    /// Stop once the frame holds `limit` bytes; at least one byte is always
    /// consumed per frame.
    pub fn length(limit: usize) -> StopCondition {
        StopCondition::Length {
            limit: limit.max(1),
            received: 0,
        }
    }

    /// Stop when the device has been quiet for `gap` between fragments.
    pub fn continuation(gap: Duration) -> StopCondition {
        StopCondition::Continuation { gap, deadline: None }
    }

    /// Stop when the frame has been open for `window`.
    pub fn total(window: Duration) -> StopCondition {
        StopCondition::Total {
            window,
            deadline: None,
        }
    }

    /// Stop at every fragment boundary.
    pub fn fragment_boundary() -> StopCondition {
        StopCondition::FragmentBoundary
    }

    pub fn kind(&self) -> StopKind {
        match self {
            StopCondition::Termination { .. } => StopKind::Termination,
            StopCondition::Length { .. } => StopKind::Length,
            StopCondition::Continuation { .. } => StopKind::Continuation,
            StopCondition::Total { .. } => StopKind::Total,
            StopCondition::FragmentBoundary => StopKind::FragmentBoundary,
        }
    }

    /// Called when a new frame is about to receive its first fragment.
    pub(crate) fn init(&mut self, now: Instant) {
        match self {
            StopCondition::Termination { matched, .. } => *matched = 0,
            StopCondition::Length { received, .. } => *received = 0,
            StopCondition::Continuation { deadline, .. } => *deadline = None,
            StopCondition::Total { window, deadline } => *deadline = Some(now + *window),
            StopCondition::FragmentBoundary => {}
        }
    }

    /// Resets all per-frame state.
    pub(crate) fn flush(&mut self) {
        match self {
            StopCondition::Termination { matched, .. } => *matched = 0,
            StopCondition::Length { received, .. } => *received = 0,
            StopCondition::Continuation { deadline, .. } => *deadline = None,
            StopCondition::Total { deadline, .. } => *deadline = None,
            StopCondition::FragmentBoundary => {}
        }
    }

    /// Evaluates one incoming fragment.
    pub(crate) fn evaluate(&mut self, fragment: &Fragment) -> Evaluation {
        match self {
            StopCondition::Termination {
                sequence,
                failure,
                matched,
            } => {
                if sequence.is_empty() {
                    return Evaluation::pass(fragment, None);
                }
                let data = fragment.data();
                for (i, &byte) in data.iter().enumerate() {
                    while *matched > 0 && byte != sequence[*matched] {
                        *matched = failure[*matched - 1];
                    }
                    if byte == sequence[*matched] {
                        *matched += 1;
                    }
                    if *matched == sequence.len() {
                        let end = i + 1;
                        *matched = 0;
                        return Evaluation {
                            stop: true,
                            kept: data.slice(..end),
                            deferred: data.slice(end..),
                            wakeup: None,
                        };
                    }
                }
                Evaluation::pass(fragment, None)
            }
            StopCondition::Length { limit, received } => {
                let data = fragment.data();
                let remaining = limit.saturating_sub(*received);
                if data.len() >= remaining {
                    *received = *limit;
                    Evaluation {
                        stop: true,
                        kept: data.slice(..remaining),
                        deferred: data.slice(remaining..),
                        wakeup: None,
                    }
                } else {
                    *received += data.len();
                    Evaluation::pass(fragment, None)
                }
            }
            StopCondition::Continuation { gap, deadline } => {
                if deadline.is_some_and(|d| fragment.timestamp() >= d) {
                    Evaluation::stop_whole(fragment)
                } else {
                    let next = fragment.timestamp() + *gap;
                    *deadline = Some(next);
                    Evaluation::pass(fragment, Some(next))
                }
            }
            StopCondition::Total { deadline, .. } => {
                if deadline.is_some_and(|d| fragment.timestamp() >= d) {
                    Evaluation::stop_whole(fragment)
                } else {
                    Evaluation::pass(fragment, *deadline)
                }
            }
            StopCondition::FragmentBoundary => Evaluation::stop_whole(fragment),
        }
    }

    /// The currently scheduled wakeup, if this condition needs one.
    pub(crate) fn wakeup(&self) -> Option<Instant> {
        match self {
            StopCondition::Continuation { deadline, .. }
            | StopCondition::Total { deadline, .. } => *deadline,
            _ => None,
        }
    }

    /// True when this condition's deadline has elapsed.
    pub(crate) fn due(&self, now: Instant) -> bool {
        self.wakeup().is_some_and(|d| now >= d)
    }
}

/// KMP failure table: `failure[i]` is the length of the longest proper prefix
/// of `sequence[..=i]` that is also a suffix of it. Lets the matcher resume
/// correctly when a partial terminator straddles a fragment boundary.
fn failure_table(sequence: &[u8]) -> Vec<usize> {
    let mut failure = vec![0usize; sequence.len()];
    let mut k = 0;
    for i in 1..sequence.len() {
        while k > 0 && sequence[i] != sequence[k] {
            k = failure[k - 1];
        }
        if sequence[i] == sequence[k] {
            k += 1;
        }
        failure[i] = k;
    }
    failure
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(data: &[u8]) -> Fragment {
        Fragment::new(data.to_vec(), Instant::now())
    }

    /// Runs `chunks` through a condition and collects completed frame
    /// payloads, re-feeding deferred bytes like the worker does.
    fn frames_for(condition: &mut StopCondition, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        let mut started = false;
        for chunk in chunks {
            let mut pending = Bytes::copy_from_slice(chunk);
            loop {
                if !started {
                    condition.init(Instant::now());
                    started = true;
                }
                let eval = condition.evaluate(&fragment(&pending));
                current.extend_from_slice(&eval.kept);
                if !eval.stop {
                    break;
                }
                frames.push(std::mem::take(&mut current));
                condition.flush();
                started = false;
                if eval.deferred.is_empty() {
                    break;
                }
                pending = eval.deferred;
            }
        }
        frames
    }

    #[test]
    fn termination_single_fragment() {
        let mut cond = StopCondition::termination(&b"\r\n"[..]);
        let frames = frames_for(&mut cond, &[b"ABC\r\nDEF\r\n"]);
        assert_eq!(frames, vec![b"ABC\r\n".to_vec(), b"DEF\r\n".to_vec()]);
    }

    #[test]
    fn termination_split_across_fragments() {
        let mut cond = StopCondition::termination(&b"\r\n"[..]);
        let frames = frames_for(&mut cond, &[b"ABC\r", b"\nDEF\r\n"]);
        assert_eq!(frames, vec![b"ABC\r\n".to_vec(), b"DEF\r\n".to_vec()]);
    }

    #[test]
    fn termination_is_fragmentation_transparent() {
        let stream = b"one##two##partial#not##";
        let reference = {
            let mut cond = StopCondition::termination(&b"##"[..]);
            frames_for(&mut cond, &[stream])
        };
        // Every two-way split of the stream yields the same frames.
        for split in 0..stream.len() {
            let mut cond = StopCondition::termination(&b"##"[..]);
            let frames = frames_for(&mut cond, &[&stream[..split], &stream[split..]]);
            assert_eq!(frames, reference, "split at {split}");
        }
    }

    #[test]
    fn termination_overlapping_prefix_across_boundary() {
        // Stream "aaab" contains "aab" starting inside the partially matched
        // prefix; the matcher must fall back, not restart.
        let mut cond = StopCondition::termination(&b"aab"[..]);
        let frames = frames_for(&mut cond, &[b"aa", b"ab"]);
        assert_eq!(frames, vec![b"aaab".to_vec()]);
    }

    #[test]
    fn length_carves_exactly() {
        let mut cond = StopCondition::length(5);
        cond.init(Instant::now());
        let eval = cond.evaluate(&fragment(b"ABCDEFGH"));
        assert!(eval.stop);
        assert_eq!(eval.kept.as_ref(), b"ABCDE");
        assert_eq!(eval.deferred.as_ref(), b"FGH");
    }

    #[test]
    fn length_accumulates_across_fragments() {
        let mut cond = StopCondition::length(4);
        cond.init(Instant::now());
        let eval = cond.evaluate(&fragment(b"AB"));
        assert!(!eval.stop);
        assert_eq!(eval.kept.as_ref(), b"AB");
        let eval = cond.evaluate(&fragment(b"CDE"));
        assert!(eval.stop);
        assert_eq!(eval.kept.as_ref(), b"CD");
        assert_eq!(eval.deferred.as_ref(), b"E");
    }

    #[test]
    fn continuation_schedules_and_fires() {
        let gap = Duration::from_millis(50);
        let mut cond = StopCondition::continuation(gap);
        let start = Instant::now();
        cond.init(start);

        let first = Fragment::new(&b"X"[..], start);
        let eval = cond.evaluate(&first);
        assert!(!eval.stop);
        assert_eq!(eval.wakeup, Some(start + gap));
        assert!(cond.due(start + gap));
        assert!(!cond.due(start + gap / 2));

        // A fragment arriving after the deadline closes the frame.
        let late = Fragment::new(&b"Y"[..], start + gap * 2);
        let eval = cond.evaluate(&late);
        assert!(eval.stop);
    }

    #[test]
    fn total_bounds_frame_duration() {
        let window = Duration::from_millis(80);
        let mut cond = StopCondition::total(window);
        let start = Instant::now();
        cond.init(start);

        let eval = cond.evaluate(&Fragment::new(&b"A"[..], start));
        assert!(!eval.stop);
        assert_eq!(eval.wakeup, Some(start + window));

        let eval = cond.evaluate(&Fragment::new(&b"B"[..], start + window));
        assert!(eval.stop);
        assert_eq!(eval.kept.as_ref(), b"B");
    }

    #[test]
    fn fragment_boundary_stops_every_time() {
        let mut cond = StopCondition::fragment_boundary();
        cond.init(Instant::now());
        let eval = cond.evaluate(&fragment(b"chunk"));
        assert!(eval.stop);
        assert_eq!(eval.kept.as_ref(), b"chunk");
        assert!(eval.deferred.is_empty());
    }
}
