//! Capture, encode and hand off voice frames
//!
//! A [`Transmitter`] owns a capture device and an encoder on its own thread. While
//! transmitting is enabled it reads whole frames from the device, encodes them and
//! passes each packet to a sink (normally `Client::send_audio`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::backend::CaptureDevice;
use super::codec::AudioCodec;
use super::error::AudioError;

/// Poll interval while transmitting is off
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Poll interval while transmitting
const ACTIVE_POLL: Duration = Duration::from_millis(4);

/// Voice capture pipeline
pub struct Transmitter {
    running: Arc<AtomicBool>,
    transmitting: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Transmitter {
    /// Start the capture thread; transmitting starts disabled
    ///
    /// `samples_per_frame` is the interleaved sample count of one codec frame.
    pub fn spawn<S>(
        capture: Box<dyn CaptureDevice>,
        codec: Box<dyn AudioCodec>,
        samples_per_frame: usize,
        sink: S,
    ) -> Result<Self, AudioError>
    where
        S: FnMut(Vec<u8>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let transmitting = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            capture,
            codec,
            frame: vec![0.0; samples_per_frame],
            sink,
            running: running.clone(),
            transmitting: transmitting.clone(),
        };

        let handle = thread::Builder::new()
            .name("transmitter".to_string())
            .spawn(move || worker.run())?;

        info!("Transmitter started ({} samples per frame)", samples_per_frame);

        Ok(Self {
            running,
            transmitting,
            handle: Some(handle),
        })
    }

    /// Enable or disable sending (push-to-talk)
    pub fn set_transmitting(&self, transmitting: bool) {
        self.transmitting.store(transmitting, Ordering::SeqCst);
    }

    /// Whether sending is enabled
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    /// Stop the capture thread and wait for it to exit
    pub fn destroy(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Transmitter thread panicked");
            }
            info!("Transmitter stopped");
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Worker<S> {
    capture: Box<dyn CaptureDevice>,
    codec: Box<dyn AudioCodec>,
    frame: Vec<f32>,
    sink: S,
    running: Arc<AtomicBool>,
    transmitting: Arc<AtomicBool>,
}

impl<S: FnMut(Vec<u8>)> Worker<S> {
    fn active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.transmitting.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        let mut start_failed = false;

        while self.running.load(Ordering::SeqCst) {
            if !self.transmitting.load(Ordering::SeqCst) {
                thread::sleep(IDLE_POLL);
                continue;
            }

            if let Err(e) = self.capture.start() {
                if !start_failed {
                    warn!("Capture device unavailable: {}", e);
                    start_failed = true;
                }
                thread::sleep(IDLE_POLL);
                continue;
            }
            start_failed = false;
            debug!("Capture running");

            while self.active() {
                self.drain_frames();
                thread::sleep(ACTIVE_POLL);
            }

            self.capture.stop();
            debug!("Capture paused");
        }
    }

    /// Encode every complete frame currently available
    fn drain_frames(&mut self) {
        let needed = self.frame.len();
        if needed == 0 {
            return;
        }

        while self.capture.available_samples() >= needed {
            let read = self.capture.capture_samples(&mut self.frame);
            if read < needed {
                break;
            }

            match self.codec.encode(&self.frame) {
                Ok(packet) => {
                    trace!("Encoded frame: {} bytes", packet.len());
                    (self.sink)(packet);
                }
                Err(e) => debug!("Dropping frame: {}", e),
            }
        }
    }
}
