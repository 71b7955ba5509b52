//! Host audio services used by the pipelines
//!
//! The capture and playback pipelines only see these traits. [`super::engine`]
//! implements them on top of cpal; tests substitute in-memory versions.

use super::error::AudioError;

/// A block of interleaved samples queued to an output voice
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Sample data (interleaved format)
    pub data: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create an empty buffer
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            data: Vec::new(),
            channels,
            sample_rate,
        }
    }

    /// Replace the contents, reusing the allocation
    pub fn set_data(&mut self, samples: &[f32]) {
        self.data.clear();
        self.data.extend_from_slice(samples);
    }

    /// Number of samples per channel
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// Playback state of an output voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Never played
    #[default]
    Initial,
    /// Consuming queued buffers
    Playing,
    /// Ran out of queued buffers
    Stopped,
}

/// A playback voice fed with a queue of buffers
///
/// Buffers stay counted in [`OutputVoice::buffers_queued`] until they are
/// reclaimed with [`OutputVoice::unqueue_processed`].
pub trait OutputVoice: Send {
    /// Append a buffer to the play queue
    fn queue(&mut self, buffer: AudioBuffer);

    /// Take back one buffer that has finished playing
    fn unqueue_processed(&mut self) -> Option<AudioBuffer>;

    /// Buffers queued, including processed ones not yet reclaimed
    fn buffers_queued(&self) -> usize;

    /// Buffers that finished playing
    fn buffers_processed(&self) -> usize;

    /// Start consuming the queue
    fn play(&mut self) -> Result<(), AudioError>;

    /// Current state
    fn state(&self) -> VoiceState;
}

/// An open capture device
pub trait CaptureDevice: Send {
    /// Begin capturing into the device buffer
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop capturing and discard anything not yet read
    fn stop(&mut self);

    /// Interleaved samples ready to be read
    fn available_samples(&self) -> usize;

    /// Read up to `buffer.len()` interleaved samples, returning the count read
    fn capture_samples(&mut self, buffer: &mut [f32]) -> usize;
}
