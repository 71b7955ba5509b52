//! cpal-backed capture device and output voice
//!
//! cpal streams cannot move between threads, so each open stream lives on its own
//! keeper thread that builds it, plays it and drops it when told to stop. The
//! handles returned here only hold shared buffers and the keeper, and are Send.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use tracing::{debug, error, info, warn};

use super::backend::{AudioBuffer, CaptureDevice, OutputVoice, VoiceState};
use super::device::{find_input_device, find_output_device, DeviceId};
use super::error::AudioError;

/// Stream format shared by capture and playback
#[derive(Debug, Clone)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Frame size in samples per channel
    pub frame_size: usize,
}

impl StreamFormat {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: BufferSize::Default,
        }
    }
}

/// Owns a cpal stream on a dedicated thread
struct StreamKeeper {
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamKeeper {
    /// Build and start a stream on a new thread, waiting until it is playing
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| AudioError::StreamError(e.to_string()))?;
                    Ok(stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Returns on stop or when the keeper handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamError("Stream thread exited".into()))
            }
        }
    }
}

impl Drop for StreamKeeper {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Microphone capture into a lock-free ring buffer
pub struct CpalCapture {
    device_id: Option<DeviceId>,
    format: StreamFormat,
    consumer: Option<HeapCons<f32>>,
    keeper: Option<StreamKeeper>,
}

impl CpalCapture {
    /// Prepare capture from a device (None = system default); nothing is opened until `start`
    pub fn new(device_id: Option<DeviceId>, format: StreamFormat) -> Self {
        Self {
            device_id,
            format,
            consumer: None,
            keeper: None,
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.keeper.is_some() {
            return Ok(());
        }

        // Room for a few frames so a late reader does not lose audio
        let capacity = self.format.frame_size * self.format.channels as usize * 4;
        let (mut producer, consumer) = HeapRb::<f32>::new(capacity).split();

        let device_id = self.device_id.clone();
        let config = self.format.stream_config();
        let keeper = StreamKeeper::spawn("capture-stream", move || {
            let device = find_input_device(device_id.as_ref())?;
            info!(
                "Starting capture on device: {}",
                device.name().unwrap_or_default()
            );

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Newest samples are dropped if the reader falls behind
                        producer.push_slice(data);
                    },
                    |err| error!("Capture stream error: {:?}", err),
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))
        })?;

        self.consumer = Some(consumer);
        self.keeper = Some(keeper);
        debug!("Capture started with format: {:?}", self.format);
        Ok(())
    }

    fn stop(&mut self) {
        if self.keeper.take().is_some() {
            info!("Capture stopped");
        }
        self.consumer = None;
    }

    fn available_samples(&self) -> usize {
        self.consumer
            .as_ref()
            .map(|consumer| consumer.occupied_len())
            .unwrap_or(0)
    }

    fn capture_samples(&mut self, buffer: &mut [f32]) -> usize {
        match self.consumer.as_mut() {
            Some(consumer) => consumer.pop_slice(buffer),
            None => 0,
        }
    }
}

/// Buffer queue drained by the output callback
#[derive(Default)]
struct VoiceQueue {
    queued: VecDeque<AudioBuffer>,
    /// Read position inside the front buffer
    cursor: usize,
    processed: VecDeque<AudioBuffer>,
    state: VoiceState,
}

impl VoiceQueue {
    fn render(&mut self, out: &mut [f32]) {
        let mut written = 0;
        if self.state == VoiceState::Playing {
            while written < out.len() {
                let Some(front) = self.queued.front() else {
                    self.state = VoiceState::Stopped;
                    break;
                };

                let remaining = &front.data[self.cursor..];
                let n = remaining.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&remaining[..n]);
                written += n;
                self.cursor += n;

                if self.cursor >= front.data.len() {
                    if let Some(done) = self.queued.pop_front() {
                        self.processed.push_back(done);
                    }
                    self.cursor = 0;
                }
            }
        }
        out[written..].fill(0.0);
    }
}

/// Speaker output fed with queued buffers
pub struct CpalVoice {
    queue: Arc<Mutex<VoiceQueue>>,
    _keeper: StreamKeeper,
}

impl CpalVoice {
    /// Open an output stream on a device (None = system default)
    pub fn open(device_id: Option<&DeviceId>, format: &StreamFormat) -> Result<Self, AudioError> {
        let queue = Arc::new(Mutex::new(VoiceQueue::default()));
        let callback_queue = queue.clone();
        let device_id = device_id.cloned();
        let config = format.stream_config();

        let keeper = StreamKeeper::spawn("playback-stream", move || {
            let device = find_output_device(device_id.as_ref())?;
            info!(
                "Starting playback on device: {}",
                device.name().unwrap_or_default()
            );

            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        // Never block the real-time callback
                        match callback_queue.try_lock() {
                            Some(mut queue) => queue.render(data),
                            None => data.fill(0.0),
                        }
                    },
                    |err| error!("Playback stream error: {:?}", err),
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))
        })?;

        Ok(Self {
            queue,
            _keeper: keeper,
        })
    }
}

impl OutputVoice for CpalVoice {
    fn queue(&mut self, buffer: AudioBuffer) {
        self.queue.lock().queued.push_back(buffer);
    }

    fn unqueue_processed(&mut self) -> Option<AudioBuffer> {
        self.queue.lock().processed.pop_front()
    }

    fn buffers_queued(&self) -> usize {
        let queue = self.queue.lock();
        queue.queued.len() + queue.processed.len()
    }

    fn buffers_processed(&self) -> usize {
        self.queue.lock().processed.len()
    }

    fn play(&mut self) -> Result<(), AudioError> {
        let mut queue = self.queue.lock();
        queue.state = if queue.queued.is_empty() {
            warn!("Play requested with nothing queued");
            VoiceState::Stopped
        } else {
            VoiceState::Playing
        };
        Ok(())
    }

    fn state(&self) -> VoiceState {
        self.queue.lock().state
    }
}
