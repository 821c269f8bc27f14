//! Collaborator traits: the radio, the clock and the data-plane buffers.
//!
//! These allow the MAC layer to run over:
//! - real transceivers (802.15.4, sub-GHz FSK) or a simulated medium
//! - hardware timers or simulated time
//! - whatever per-stream ring buffers the application provides

use core::future::Future;

use crate::config::RadioConfig;
use crate::packet::Packet;
use crate::time::Timestamp;
use crate::types::{Rssi, StreamId};

/// Metadata of a successful reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written into the receive buffer.
    pub size: usize,
    /// Start-of-frame timestamp in local time, if the radio captured one.
    pub timestamp: Option<Timestamp>,
    pub rssi: Rssi,
}

/// A receive that produced no usable frame.
///
/// Neither variant is fatal; both count as "no packet this slot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("receive deadline passed")]
    Timeout,
    #[error("radio fault during receive")]
    Other,
}

/// Half-duplex packet radio.
///
/// # Example
///
/// ```
/// use embassy_futures::block_on;
/// use tdmesh::traits::test_impls::MockRadio;
/// use tdmesh::traits::{Radio, RecvError};
/// use tdmesh::Timestamp;
///
/// let mut radio = MockRadio::new();
/// radio.push_rx(&[1, 2, 3], Some(Timestamp::from_micros(10)), -60);
///
/// let mut buf = [0u8; 16];
/// let rx = block_on(radio.recv(&mut buf, None)).unwrap();
/// assert_eq!(&buf[..rx.size], &[1, 2, 3]);
///
/// // Nothing scripted: the receive times out.
/// assert_eq!(block_on(radio.recv(&mut buf, None)), Err(RecvError::Timeout));
/// ```
pub trait Radio {
    type SendFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    type RecvFuture<'a>: Future<Output = Result<Received, RecvError>>
    where
        Self: 'a;

    fn configure(&mut self, config: &RadioConfig);

    fn turn_on(&mut self);

    fn turn_off(&mut self);

    /// Transmit `data` so that the frame starts at `at`.
    fn send_at<'a>(&'a mut self, data: &'a [u8], at: Timestamp) -> Self::SendFuture<'a>;

    /// Receive one frame into `buf`, giving up at `deadline` (`None` waits forever).
    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        deadline: Option<Timestamp>,
    ) -> Self::RecvFuture<'a>;
}

/// Local time source.
///
/// # Example (embedded with embassy)
///
/// ```text
/// struct EmbassyClock;
///
/// impl Clock for EmbassyClock {
///     type SleepFuture<'a> = embassy_time::Timer;
///
///     fn now(&self) -> Timestamp {
///         Timestamp::from_micros(embassy_time::Instant::now().as_micros())
///     }
///
///     fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
///         embassy_time::Timer::at(embassy_time::Instant::from_micros(time.as_micros()))
///     }
/// }
/// ```
pub trait Clock {
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    fn now(&self) -> Timestamp;

    /// Completes once local time reaches `time`.
    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Per-stream data-plane buffers, owned by the application.
pub trait StreamBuffers {
    /// Next packet to transmit for `stream`, if any.
    fn outgoing(&mut self, stream: StreamId) -> Option<Packet>;

    /// Hand a received packet to `stream`'s sink. An empty packet marks a lost slot.
    fn deliver(&mut self, stream: StreamId, packet: Packet);
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::collections::VecDeque;
    use alloc::vec::Vec;
    use core::cell::Cell;
    use core::future::{ready, Ready};

    use hashbrown::HashMap;

    use super::*;

    /// Scripted radio: receives pop from a queue, sends are recorded.
    #[derive(Default)]
    pub struct MockRadio {
        inbox: VecDeque<Result<(Vec<u8>, Received), RecvError>>,
        sent: Vec<(Vec<u8>, Timestamp)>,
        on: bool,
        config: Option<RadioConfig>,
        recv_calls: usize,
    }

    impl MockRadio {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a frame for the next receive.
        pub fn push_rx(&mut self, data: &[u8], timestamp: Option<Timestamp>, rssi: Rssi) {
            let rx = Received {
                size: data.len(),
                timestamp,
                rssi,
            };
            self.inbox.push_back(Ok((data.to_vec(), rx)));
        }

        /// Queue a failed receive.
        pub fn push_error(&mut self, err: RecvError) {
            self.inbox.push_back(Err(err));
        }

        /// Drain recorded transmissions.
        pub fn take_sent(&mut self) -> Vec<(Vec<u8>, Timestamp)> {
            core::mem::take(&mut self.sent)
        }

        pub fn is_on(&self) -> bool {
            self.on
        }

        pub fn configured(&self) -> Option<&RadioConfig> {
            self.config.as_ref()
        }

        pub fn recv_calls(&self) -> usize {
            self.recv_calls
        }

        pub fn pending_rx(&self) -> usize {
            self.inbox.len()
        }
    }

    impl Radio for MockRadio {
        type SendFuture<'a> = Ready<()>;
        type RecvFuture<'a> = Ready<Result<Received, RecvError>>;

        fn configure(&mut self, config: &RadioConfig) {
            self.config = Some(*config);
        }

        fn turn_on(&mut self) {
            self.on = true;
        }

        fn turn_off(&mut self) {
            self.on = false;
        }

        fn send_at<'a>(&'a mut self, data: &'a [u8], at: Timestamp) -> Self::SendFuture<'a> {
            self.sent.push((data.to_vec(), at));
            ready(())
        }

        fn recv<'a>(
            &'a mut self,
            buf: &'a mut [u8],
            _deadline: Option<Timestamp>,
        ) -> Self::RecvFuture<'a> {
            self.recv_calls += 1;
            let result = match self.inbox.pop_front() {
                Some(Ok((data, mut rx))) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    rx.size = len;
                    Ok(rx)
                }
                Some(Err(err)) => Err(err),
                None => Err(RecvError::Timeout),
            };
            ready(result)
        }
    }

    /// Mock clock: sleeping jumps the clock forward to the wake instant.
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Timestamp) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        pub fn advance(&self, duration: crate::time::Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
            if time > self.current.get() {
                self.current.set(time);
            }
            ready(())
        }
    }

    /// In-memory stream buffers.
    #[derive(Default)]
    pub struct MockBuffers {
        outgoing: HashMap<StreamId, VecDeque<Packet>>,
        delivered: Vec<(StreamId, Packet)>,
    }

    impl MockBuffers {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_outgoing(&mut self, stream: StreamId, packet: Packet) {
            self.outgoing.entry(stream).or_default().push_back(packet);
        }

        pub fn take_delivered(&mut self) -> Vec<(StreamId, Packet)> {
            core::mem::take(&mut self.delivered)
        }
    }

    impl StreamBuffers for MockBuffers {
        fn outgoing(&mut self, stream: StreamId) -> Option<Packet> {
            self.outgoing.get_mut(&stream)?.pop_front()
        }

        fn deliver(&mut self, stream: StreamId, packet: Packet) {
            self.delivered.push((stream, packet));
        }
    }
}
