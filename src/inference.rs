//! Fixed-shape inference windows and the all-channels-full barrier.
//!
//! An [`InferenceSession`] owns one preallocated [`InferenceBuffer`] per
//! model input channel.  Samples fill each buffer independently; extra
//! samples for a buffer that is already full are dropped.  The moment every
//! buffer is full the session assembles one `[1, channels, samples]` tensor,
//! resets all buffers to empty and hands the tensor back to the caller.
//!
//! Because the reset happens in the same call that fires the barrier, the
//! barrier cannot fire again until every buffer has gone through
//! empty → filling → full once more.

use crate::error::{Result, ShioError};

// ── Buffer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Filling,
    Full,
}

#[derive(Debug, Clone)]
pub struct InferenceBuffer {
    samples: Box<[i16]>,
    write_index: usize,
    state: BufferState,
}

impl InferenceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity].into_boxed_slice(),
            write_index: 0,
            state: BufferState::Empty,
        }
    }

    /// Store one sample.  Returns `false` when the buffer is already full
    /// and the sample was dropped.
    pub fn push(&mut self, sample: i16) -> bool {
        if self.state == BufferState::Full {
            return false;
        }
        self.samples[self.write_index] = sample;
        self.write_index += 1;
        self.state = if self.write_index == self.samples.len() {
            BufferState::Full
        } else {
            BufferState::Filling
        };
        true
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn is_full(&self) -> bool {
        self.state == BufferState::Full
    }

    /// Samples written so far, oldest first.
    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.write_index]
    }

    pub fn reset(&mut self) {
        self.write_index = 0;
        self.state = BufferState::Empty;
    }
}

// ── Tensor ────────────────────────────────────────────────────────────────────

/// Model input of shape `[1, channels, samples_per_channel]`, channel-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceInput {
    channels: usize,
    samples_per_channel: usize,
    data: Vec<i32>,
}

impl InferenceInput {
    pub fn new(channels: usize, samples_per_channel: usize, data: Vec<i32>) -> Result<Self> {
        let expected = channels * samples_per_channel;
        if data.len() != expected {
            return Err(ShioError::InvalidShape {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            channels,
            samples_per_channel,
            data,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        [1, self.channels, self.samples_per_channel]
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    /// The samples of one channel (0-based).
    pub fn channel(&self, index: usize) -> Option<&[i32]> {
        if index >= self.channels {
            return None;
        }
        let start = index * self.samples_per_channel;
        Some(&self.data[start..start + self.samples_per_channel])
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InferenceSession {
    buffers: Vec<InferenceBuffer>,
    samples_per_channel: usize,
    cycles: u64,
}

impl InferenceSession {
    pub fn new(channels: usize, samples_per_channel: usize) -> Self {
        Self {
            buffers: (0..channels)
                .map(|_| InferenceBuffer::new(samples_per_channel))
                .collect(),
            samples_per_channel,
            cycles: 0,
        }
    }

    /// Route one sample to buffer `index` (0-based) and check the barrier.
    ///
    /// Returns the assembled tensor exactly when this sample completed the
    /// last non-full buffer.  Samples for an index outside the session are
    /// ignored.
    pub fn push(&mut self, index: usize, sample: i16) -> Option<InferenceInput> {
        let buffer = self.buffers.get_mut(index)?;
        if !buffer.push(sample) {
            return None;
        }
        if !self.is_complete() {
            return None;
        }

        let data: Vec<i32> = self
            .buffers
            .iter()
            .flat_map(|b| b.samples().iter().map(|&s| i32::from(s)))
            .collect();
        self.reset();
        self.cycles += 1;
        Some(InferenceInput {
            channels: self.buffers.len(),
            samples_per_channel: self.samples_per_channel,
            data,
        })
    }

    /// `true` when every buffer is full.
    pub fn is_complete(&self) -> bool {
        !self.buffers.is_empty() && self.buffers.iter().all(InferenceBuffer::is_full)
    }

    pub fn reset(&mut self) {
        for b in &mut self.buffers {
            b.reset();
        }
    }

    pub fn buffer(&self, index: usize) -> Option<&InferenceBuffer> {
        self.buffers.get(index)
    }

    pub fn channels(&self) -> usize {
        self.buffers.len()
    }

    /// Number of times the barrier has fired.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// The inference collaborator.
///
/// Called off the packet path on a blocking thread; implementations may take
/// as long as they need, but the session gives up after its configured
/// timeout and treats that as a failed call.
pub trait InferenceModel: Send {
    fn infer(&mut self, input: &InferenceInput) -> Result<Vec<i32>>;
}

impl<F> InferenceModel for F
where
    F: FnMut(&InferenceInput) -> Result<Vec<i32>> + Send,
{
    fn infer(&mut self, input: &InferenceInput) -> Result<Vec<i32>> {
        self(input)
    }
}

/// Reference model: one output per channel, the mean sample value.
///
/// Stands in for a trained network when running the CLI or simulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanModel;

impl InferenceModel for MeanModel {
    fn infer(&mut self, input: &InferenceInput) -> Result<Vec<i32>> {
        let [_, channels, n] = input.shape();
        if n == 0 {
            return Err(ShioError::Inference("empty channel window".into()));
        }
        Ok((0..channels)
            .filter_map(|c| input.channel(c))
            .map(|s| (s.iter().map(|&v| i64::from(v)).sum::<i64>() / n as i64) as i32)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_fills_then_drops() {
        let mut b = InferenceBuffer::new(3);
        assert_eq!(b.state(), BufferState::Empty);
        assert!(b.push(1));
        assert_eq!(b.state(), BufferState::Filling);
        assert!(b.push(2));
        assert!(b.push(3));
        assert_eq!(b.state(), BufferState::Full);
        assert_eq!(b.write_index(), 3);
        assert!(!b.push(4));
        assert_eq!(b.write_index(), 3);
        assert_eq!(b.samples(), &[1, 2, 3]);
    }

    #[test]
    fn partial_fills_never_fire() {
        let mut s = InferenceSession::new(2, 4);
        for v in 0..3 {
            assert!(s.push(0, v).is_none());
        }
        for v in 0..4 {
            assert!(s.push(1, v).is_none());
        }
        assert_eq!(s.buffer(0).unwrap().state(), BufferState::Filling);
        assert_eq!(s.buffer(1).unwrap().state(), BufferState::Full);
        assert_eq!(s.cycles(), 0);
    }

    #[test]
    fn barrier_fires_once_and_resets() {
        let mut s = InferenceSession::new(2, 4);
        for v in [10, 11, 12] {
            assert!(s.push(0, v).is_none());
        }
        for v in [20, 21, 22, 23] {
            assert!(s.push(1, v).is_none());
        }
        let input = s.push(0, 13).expect("barrier fires on the last sample");
        assert_eq!(input.shape(), [1, 2, 4]);
        assert_eq!(input.data(), &[10, 11, 12, 13, 20, 21, 22, 23]);
        assert_eq!(s.cycles(), 1);

        for i in 0..2 {
            let b = s.buffer(i).unwrap();
            assert_eq!(b.state(), BufferState::Empty);
            assert_eq!(b.write_index(), 0);
        }

        assert!(s.push(1, 30).is_none());
        assert_eq!(s.buffer(1).unwrap().state(), BufferState::Filling);
        assert_eq!(s.buffer(0).unwrap().state(), BufferState::Empty);
    }

    #[test]
    fn overflow_on_full_channel_does_not_refire() {
        let mut s = InferenceSession::new(2, 2);
        s.push(0, 1);
        s.push(0, 2);
        // channel 0 is full; further samples are dropped
        for v in 0..10 {
            assert!(s.push(0, v).is_none());
        }
        s.push(1, 5);
        let input = s.push(1, 6).unwrap();
        assert_eq!(input.channel(0).unwrap(), &[1, 2]);
        assert_eq!(input.channel(1).unwrap(), &[5, 6]);
        assert_eq!(s.cycles(), 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut s = InferenceSession::new(2, 4);
        s.push(0, 1);
        s.push(1, 1);
        s.reset();
        s.reset();
        for i in 0..2 {
            let b = s.buffer(i).unwrap();
            assert_eq!(b.state(), BufferState::Empty);
            assert_eq!(b.write_index(), 0);
        }
    }

    #[test]
    fn out_of_range_channel_is_ignored() {
        let mut s = InferenceSession::new(2, 1);
        assert!(s.push(2, 7).is_none());
        assert_eq!(s.buffer(0).unwrap().state(), BufferState::Empty);
    }

    #[test]
    fn input_rejects_wrong_shape() {
        assert!(matches!(
            InferenceInput::new(2, 3, vec![0; 5]),
            Err(ShioError::InvalidShape { expected: 6, actual: 5 })
        ));
        assert!(InferenceInput::new(2, 3, vec![0; 6]).is_ok());
    }

    #[test]
    fn mean_model_averages_each_channel() {
        let input = InferenceInput::new(2, 2, vec![2, 4, -10, -20]).unwrap();
        assert_eq!(MeanModel.infer(&input).unwrap(), vec![3, -15]);
    }

    #[test]
    fn closures_are_models() {
        let mut calls = 0;
        let mut model = |i: &InferenceInput| {
            calls += 1;
            Ok::<_, ShioError>(vec![i.data().len() as i32])
        };
        let input = InferenceInput::new(1, 3, vec![0; 3]).unwrap();
        assert_eq!(model.infer(&input).unwrap(), vec![3]);
        drop(model);
        assert_eq!(calls, 1);
    }
}
