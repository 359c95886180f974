//! Per-channel live-plot buffering.
//!
//! Samples are collected in a small fill batch of `fill` samples.  When the
//! batch is full it is moved into the display window in one step, the oldest
//! samples are dropped so the window never exceeds `window` samples, and a
//! [`PlotFlush`] carrying the whole window is returned for the UI.
//!
//! Memory per channel is bounded by `fill + window` regardless of how long a
//! plotting session runs.

use std::collections::VecDeque;

/// One flush of a channel's display window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotFlush {
    pub channel: usize,
    /// The most recent `window` (or fewer) samples, oldest first.
    pub samples: Vec<i16>,
    /// Absolute index of `samples[0]` in the channel's sample stream:
    /// `cursor − window`, clamped at 0.
    pub start: u64,
}

#[derive(Debug, Clone)]
pub struct PlotWindow {
    channel: usize,
    fill: Vec<i16>,
    fill_capacity: usize,
    display: VecDeque<i16>,
    window: usize,
    /// Total samples pushed since the last reset.
    cursor: u64,
}

impl PlotWindow {
    /// Both sizes must be non-zero; `SessionConfig::validate` guarantees
    /// this for windows built by the router.
    pub fn new(channel: usize, fill_capacity: usize, window: usize) -> Self {
        Self {
            channel,
            fill: Vec::with_capacity(fill_capacity),
            fill_capacity,
            display: VecDeque::with_capacity(window + fill_capacity),
            window,
            cursor: 0,
        }
    }

    /// Append one sample.  Returns the flushed window when the fill batch
    /// completes.
    pub fn push(&mut self, sample: i16) -> Option<PlotFlush> {
        self.fill.push(sample);
        self.cursor += 1;
        if self.fill.len() < self.fill_capacity {
            return None;
        }

        self.display.extend(self.fill.drain(..));
        let excess = self.display.len().saturating_sub(self.window);
        self.display.drain(..excess);

        Some(PlotFlush {
            channel: self.channel,
            samples: self.display.iter().copied().collect(),
            start: self.cursor.saturating_sub(self.window as u64),
        })
    }

    /// Current display window, oldest first.
    pub fn display(&self) -> impl Iterator<Item = i16> + '_ {
        self.display.iter().copied()
    }

    pub fn display_len(&self) -> usize {
        self.display.len()
    }

    pub fn fill_len(&self) -> usize {
        self.fill.len()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn reset(&mut self) {
        self.fill.clear();
        self.display.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_every_fill_batch_and_caps_the_window() {
        let mut w = PlotWindow::new(1, 2, 4);
        let mut flushes = Vec::new();
        for s in 1..=6 {
            if let Some(f) = w.push(s) {
                assert!(f.samples.len() <= 4);
                flushes.push(f);
            }
        }
        assert_eq!(flushes.len(), 3);
        assert_eq!(flushes[0].samples, vec![1, 2]);
        assert_eq!(flushes[1].samples, vec![1, 2, 3, 4]);
        assert_eq!(flushes[2].samples, vec![3, 4, 5, 6]);
        assert_eq!(w.display().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn start_offset_tracks_cursor() {
        let mut w = PlotWindow::new(2, 2, 4);
        let starts: Vec<u64> = (1..=8).filter_map(|s| w.push(s)).map(|f| f.start).collect();
        assert_eq!(starts, vec![0, 0, 2, 4]);
        assert_eq!(w.cursor(), 8);
    }

    #[test]
    fn partial_batch_is_not_displayed() {
        let mut w = PlotWindow::new(1, 3, 10);
        assert!(w.push(7).is_none());
        assert!(w.push(8).is_none());
        assert_eq!(w.fill_len(), 2);
        assert_eq!(w.display_len(), 0);
    }

    #[test]
    fn flush_carries_channel() {
        let mut w = PlotWindow::new(5, 1, 1);
        assert_eq!(w.push(9).unwrap().channel, 5);
    }

    #[test]
    fn memory_stays_bounded_over_long_runs() {
        let mut w = PlotWindow::new(1, 7, 50);
        for i in 0..10_000 {
            w.push((i % 100) as i16);
            assert!(w.display_len() <= 50);
            assert!(w.fill_len() < 7);
        }
        let tail: Vec<i16> = (9_950..9_996).map(|i| (i % 100) as i16).collect();
        let shown: Vec<i16> = w.display().collect();
        // 9_996 samples flushed so far (multiple of 7 below 10_000).
        assert_eq!(&shown[4..], &tail[..]);
    }

    #[test]
    fn reset_clears_state() {
        let mut w = PlotWindow::new(1, 2, 4);
        for s in 0..5 {
            w.push(s);
        }
        w.reset();
        assert_eq!(w.cursor(), 0);
        assert_eq!(w.fill_len(), 0);
        assert_eq!(w.display_len(), 0);
    }
}
