//! FLOPSYNC-2 clock correction controller.
//!
//! Input is the timing error `e = measured - expected` of each sync packet
//! arrival, in nanoseconds. Output is the correction to add to the next
//! expected arrival, plus a receiver window sized from the recent error
//! spread (three standard deviations, clamped to the configured bounds).
//!
//! The controller is the discrete-time loop
//!
//! ```text
//! u(k) = 2u(k-1) - u(k-2) + 1.875 e(k) - 2.578125 e(k-1) + 0.947265625 e(k-2)
//! ```
//!
//! with state kept multiplied by 512 so it runs on integers. The first sample
//! after a reset takes a deadbeat step instead so that a constant drift is
//! cancelled after two packets.

use crate::time::Duration;

/// Samples per receiver window update.
const WINDOW_SAMPLES: u8 = 8;

/// Fixed-point scale of the controller state.
const SCALE: i64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preinit {
    /// No sample since reset.
    Fresh,
    /// Deadbeat step taken.
    Seeded,
    Running,
}

#[derive(Debug, Clone)]
pub struct Flopsync2 {
    uo: i64,
    uoo: i64,
    eo: i64,
    eoo: i64,
    sum: i64,
    square_sum: i128,
    count: u8,
    preinit: Preinit,
    window: i64,
    min_window: i64,
    max_window: i64,
}

impl Flopsync2 {
    pub fn new(min_window: Duration, max_window: Duration) -> Self {
        let max_window = max_window.as_signed_nanos();
        Self {
            uo: 0,
            uoo: 0,
            eo: 0,
            eoo: 0,
            sum: 0,
            square_sum: 0,
            count: 0,
            preinit: Preinit::Fresh,
            window: max_window,
            min_window: min_window.as_signed_nanos(),
            max_window,
        }
    }

    /// Forget all history; the window goes back to its maximum.
    pub fn reset(&mut self) {
        *self = Self::new(
            Duration::from_nanos(self.min_window as u64),
            Duration::from_nanos(self.max_window as u64),
        );
    }

    /// Feed the error of a received packet. Returns (correction ns, window).
    pub fn compute_correction(&mut self, e: i64) -> (i64, Duration) {
        match self.preinit {
            Preinit::Fresh => {
                self.preinit = Preinit::Seeded;
                self.eo = e;
                self.uo = 2 * SCALE * e;
                self.uoo = SCALE * e;
                return (self.clamp(2 * e), self.receiver_window());
            }
            Preinit::Seeded => self.settle(),
            Preinit::Running => {}
        }

        let u = 2 * self.uo - self.uoo + 960 * e - 1320 * self.eo + 485 * self.eoo;
        self.uoo = self.uo;
        self.uo = u;
        self.eoo = self.eo;
        self.eo = e;

        self.update_window(e);
        (self.clamp(Self::quantize(u)), self.receiver_window())
    }

    /// A packet was lost: keep the last correction, double the window.
    pub fn lost_packet(&mut self) -> (i64, Duration) {
        if self.preinit == Preinit::Seeded {
            self.settle();
        }
        self.window = (2 * self.window).min(self.max_window);
        (self.correction(), self.receiver_window())
    }

    /// Correction currently applied each period.
    pub fn correction(&self) -> i64 {
        self.clamp(Self::quantize(self.uo))
    }

    pub fn receiver_window(&self) -> Duration {
        Duration::from_nanos(self.window.max(0) as u64)
    }

    fn settle(&mut self) {
        self.preinit = Preinit::Running;
        self.eo = 0;
        self.uo /= 2;
    }

    fn update_window(&mut self, e: i64) {
        self.sum += e;
        self.square_sum += (e as i128) * (e as i128);
        self.count += 1;
        if self.count < WINDOW_SAMPLES {
            return;
        }
        let n = WINDOW_SAMPLES as i128;
        let average = self.sum as i128 / n;
        let variance = (self.square_sum / n - average * average).max(0) as u128;
        let stddev = variance.isqrt() as i64;
        self.window = (3 * stddev).clamp(self.min_window, self.max_window);
        self.sum = 0;
        self.square_sum = 0;
        self.count = 0;
    }

    fn quantize(u: i64) -> i64 {
        let half = if u >= 0 { SCALE / 2 } else { -SCALE / 2 };
        (u + half) / SCALE
    }

    fn clamp(&self, correction: i64) -> i64 {
        correction.clamp(-self.max_window, self.max_window)
    }
}
