//! Outbound frame queue with single write in flight and duplicate suppression.

use crate::{EngineError, EngineResult};
use dkey_frame::{CommandFrame, CommandType};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// An encoded frame waiting for, or occupying, the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Type of the frame, for logs and completion events.
    pub command_type: CommandType,
    /// Encoded bytes to write.
    pub bytes: Vec<u8>,
    /// Whether completion is reported to the application.
    pub notify: bool,
}

/// FIFO of encoded frames. Only one frame is written at a time; the next
/// one is released when the transport reports completion.
#[derive(Debug)]
pub struct Dispatcher {
    queue: VecDeque<Outbound>,
    in_flight: Option<Outbound>,
    recent: VecDeque<(CommandFrame, Instant)>,
    dedup_window: Duration,
    max_queue: usize,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(dedup_window: Duration, max_queue: usize) -> Self {
        Dispatcher {
            queue: VecDeque::new(),
            in_flight: None,
            recent: VecDeque::new(),
            dedup_window,
            max_queue,
        }
    }

    /// Whether `frame` repeats a command sent inside the dedup window.
    ///
    /// `Retry` frames are never duplicates.
    pub fn is_duplicate(&mut self, frame: &CommandFrame, now: Instant) -> bool {
        while let Some((_, at)) = self.recent.front() {
            if now.saturating_duration_since(*at) < self.dedup_window {
                break;
            }
            self.recent.pop_front();
        }
        frame.command_type != CommandType::Retry
            && self.recent.iter().any(|(sent, _)| sent == frame)
    }

    /// Remember `frame` for duplicate suppression.
    pub fn remember(&mut self, frame: CommandFrame, now: Instant) {
        if frame.command_type != CommandType::Retry && !self.dedup_window.is_zero() {
            self.recent.push_back((frame, now));
        }
    }

    /// Queue an encoded frame.
    pub fn enqueue(&mut self, outbound: Outbound) -> EngineResult<()> {
        if self.queue.len() >= self.max_queue {
            return Err(EngineError::QueueFull(self.max_queue));
        }
        self.queue.push_back(outbound);
        Ok(())
    }

    /// If nothing is in flight, move the next queued frame in flight and
    /// return its bytes for writing.
    pub fn next_to_write(&mut self) -> Option<Vec<u8>> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        let bytes = next.bytes.clone();
        self.in_flight = Some(next);
        Some(bytes)
    }

    /// Release the in-flight frame after the transport finished with it.
    pub fn complete(&mut self) -> Option<Outbound> {
        self.in_flight.take()
    }

    /// Type of the in-flight frame.
    pub fn in_flight(&self) -> Option<CommandType> {
        self.in_flight.as_ref().map(|o| o.command_type)
    }

    /// Frames waiting behind the in-flight one.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Drop everything, returning the frames whose completion was owed to
    /// the application.
    pub fn clear(&mut self) -> Vec<Outbound> {
        self.recent.clear();
        self.in_flight
            .take()
            .into_iter()
            .chain(self.queue.drain(..))
            .filter(|o| o.notify)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dkey_frame::PermissionMask;

    fn outbound(tag: u8) -> Outbound {
        Outbound {
            command_type: CommandType::Transfer,
            bytes: vec![tag],
            notify: true,
        }
    }

    #[test]
    fn test_single_write_in_flight() {
        let mut d = Dispatcher::new(Duration::from_millis(500), 8);
        d.enqueue(outbound(1)).unwrap();
        d.enqueue(outbound(2)).unwrap();

        assert_eq!(d.next_to_write(), Some(vec![1]));
        assert_eq!(d.next_to_write(), None);
        assert_eq!(d.complete().map(|o| o.bytes), Some(vec![1]));
        assert_eq!(d.next_to_write(), Some(vec![2]));
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn test_queue_limit() {
        let mut d = Dispatcher::new(Duration::ZERO, 1);
        d.enqueue(outbound(1)).unwrap();
        assert_eq!(d.enqueue(outbound(2)), Err(EngineError::QueueFull(1)));
    }

    #[test]
    fn test_dedup_window() {
        let mut d = Dispatcher::new(Duration::from_millis(500), 8);
        let frame = CommandFrame::control(PermissionMask::parse_hex("0x01").unwrap(), vec![0x10]);
        let t0 = Instant::now();

        assert!(!d.is_duplicate(&frame, t0));
        d.remember(frame.clone(), t0);
        assert!(d.is_duplicate(&frame, t0 + Duration::from_millis(100)));
        assert!(!d.is_duplicate(&CommandFrame::retry_of(&frame), t0));
        assert!(!d.is_duplicate(&frame, t0 + Duration::from_millis(600)));
    }

    #[test]
    fn test_clear_reports_owed_completions() {
        let mut d = Dispatcher::new(Duration::ZERO, 8);
        d.enqueue(outbound(1)).unwrap();
        d.enqueue(Outbound {
            notify: false,
            ..outbound(2)
        })
        .unwrap();
        d.enqueue(outbound(3)).unwrap();
        d.next_to_write();

        let owed: Vec<_> = d.clear().into_iter().map(|o| o.bytes[0]).collect();
        assert_eq!(owed, vec![1, 3]);
        assert_eq!(d.in_flight(), None);
    }
}
