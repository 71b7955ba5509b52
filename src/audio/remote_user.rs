//! Per-participant receive pipeline
//!
//! Incoming packets are decoded into a fixed-depth jitter buffer. Playback only
//! starts once the buffer has filled to its target depth, then a 1 ms update loop
//! moves chunks into the output voice while keeping at most `depth` buffers queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, info, trace, warn};

use super::backend::{AudioBuffer, OutputVoice, VoiceState};
use super::codec::{create_codec, AudioCodec, CodecConfig};
use super::device::DeviceId;
use super::engine::{CpalVoice, StreamFormat};
use super::error::AudioError;

/// Default jitter buffer depth in frames
pub const DEFAULT_JITTER_BUFFER_SIZE: usize = 3;

/// Interval of the playback update loop
const UPDATE_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one [`JitterPlayback::update`] tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Waiting for the jitter buffer to fill
    Buffering,
    /// Nothing decoded is waiting
    Empty,
    /// The output voice already holds `depth` buffers
    Saturated,
    /// One chunk was queued; `started` is set when playback was (re)started
    Queued { started: bool },
}

/// Jitter buffer feeding one output voice
pub struct JitterPlayback {
    chunks: HeapRb<Vec<f32>>,
    depth: usize,
    buffering: bool,
    decoder: Box<dyn AudioCodec>,
    voice: Box<dyn OutputVoice>,
    channels: u16,
    sample_rate: u32,
}

impl JitterPlayback {
    /// Create a pipeline holding up to `depth` decoded chunks (at least 1)
    pub fn new(
        decoder: Box<dyn AudioCodec>,
        voice: Box<dyn OutputVoice>,
        depth: usize,
        channels: u16,
        sample_rate: u32,
    ) -> Self {
        let depth = depth.max(1);
        Self {
            chunks: HeapRb::new(depth),
            depth,
            buffering: true,
            decoder,
            voice,
            channels,
            sample_rate,
        }
    }

    /// Decode a packet into the jitter buffer, dropping the oldest chunk when full
    pub fn put_packet(&mut self, packet: &[u8]) -> Result<(), AudioError> {
        let pcm = self.decoder.decode(packet)?;
        if self.chunks.push_overwrite(pcm).is_some() {
            trace!("Jitter buffer full, dropped oldest chunk");
        }

        if self.buffering && self.chunks.occupied_len() >= self.depth {
            self.buffering = false;
            debug!("Jitter buffer filled ({} chunks)", self.depth);
        }
        Ok(())
    }

    /// Move at most one chunk to the output voice
    pub fn update(&mut self) -> Result<UpdateOutcome, AudioError> {
        if self.buffering {
            return Ok(UpdateOutcome::Buffering);
        }

        if self.chunks.is_empty() {
            // Ran dry: refill before playing again
            if self.voice.state() == VoiceState::Stopped {
                self.buffering = true;
                debug!("Playback ran dry, buffering");
                return Ok(UpdateOutcome::Buffering);
            }
            return Ok(UpdateOutcome::Empty);
        }

        let reclaimed = if self.voice.buffers_processed() > 0 {
            self.voice.unqueue_processed()
        } else {
            None
        };
        let mut buffer = match reclaimed {
            Some(buffer) => buffer,
            None if self.voice.buffers_queued() < self.depth => {
                AudioBuffer::new(self.channels, self.sample_rate)
            }
            None => return Ok(UpdateOutcome::Saturated),
        };

        let Some(chunk) = self.chunks.try_pop() else {
            return Ok(UpdateOutcome::Empty);
        };
        buffer.set_data(&chunk);
        self.voice.queue(buffer);

        let started = matches!(
            self.voice.state(),
            VoiceState::Initial | VoiceState::Stopped
        );
        if started {
            self.voice.play()?;
        }
        Ok(UpdateOutcome::Queued { started })
    }

    /// Whether playback is waiting for the buffer to fill
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Decoded chunks waiting to be queued
    pub fn buffered_chunks(&self) -> usize {
        self.chunks.occupied_len()
    }

    /// Target depth of the jitter buffer
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// A remote participant with its own playback thread
pub struct RemoteUser {
    id: u16,
    display_name: String,
    playback: Arc<Mutex<JitterPlayback>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RemoteUser {
    /// Start the playback loop for a participant
    pub fn spawn(
        id: u16,
        display_name: impl Into<String>,
        playback: JitterPlayback,
    ) -> Result<Self, AudioError> {
        let display_name = display_name.into();
        let depth = playback.depth();
        let playback = Arc::new(Mutex::new(playback));
        let running = Arc::new(AtomicBool::new(true));

        let loop_playback = playback.clone();
        let loop_running = running.clone();
        let handle = thread::Builder::new()
            .name(format!("remote-user-{}", id))
            .spawn(move || {
                let mut play_failed = false;
                while loop_running.load(Ordering::SeqCst) {
                    // Guard dropped before sleeping
                    let result = loop_playback.lock().update();
                    match result {
                        Ok(_) => play_failed = false,
                        Err(e) => {
                            if !play_failed {
                                warn!("Playback failed for user {}: {}", id, e);
                                play_failed = true;
                            }
                        }
                    }
                    thread::sleep(UPDATE_INTERVAL);
                }
            })?;

        info!(
            "Remote user {} ({}) joined playback, jitter depth {}",
            id, display_name, depth
        );

        Ok(Self {
            id,
            display_name,
            playback,
            running,
            handle: Some(handle),
        })
    }

    /// Open the output device and decoder for a participant and start playback
    pub fn open(
        id: u16,
        display_name: impl Into<String>,
        output_device: Option<&DeviceId>,
        codec: &CodecConfig,
        jitter_buffer_size: usize,
    ) -> Result<Self, AudioError> {
        let format = StreamFormat {
            sample_rate: codec.sample_rate,
            channels: codec.channels,
            frame_size: codec.frame_size,
        };
        let voice = CpalVoice::open(output_device, &format)?;
        let decoder = create_codec(codec)?;

        let playback = JitterPlayback::new(
            decoder,
            Box::new(voice),
            jitter_buffer_size,
            codec.channels,
            codec.sample_rate,
        );
        Self::spawn(id, display_name, playback)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Feed one encoded frame; undecodable packets are dropped
    pub fn put_packet(&self, packet: &[u8]) {
        if let Err(e) = self.playback.lock().put_packet(packet) {
            debug!("Dropping packet for user {}: {}", self.id, e);
        }
    }

    /// Whether playback is waiting for the buffer to fill
    pub fn is_buffering(&self) -> bool {
        self.playback.lock().is_buffering()
    }

    /// Stop the playback loop and wait for it to exit
    pub fn destroy(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Playback thread for user {} panicked", self.id);
            }
            info!("Remote user {} ({}) left playback", self.id, self.display_name);
        }
    }
}

impl Drop for RemoteUser {
    fn drop(&mut self) {
        self.destroy();
    }
}
