//! Per-modality consumer loops that pull decoded buffers out of a session.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{backend::BufferFill, player::PlaybackSession, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Audio,
    Image,
}

impl Modality {
    pub fn label(self) -> &'static str {
        match self {
            Modality::Audio => "audio",
            Modality::Image => "image",
        }
    }
}

/// Destination of decoded buffers, e.g. an audio device or a render surface.
pub trait FrameSink: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Called once when the worker exits.
    fn end_of_stream(&mut self) {}
}

/// A thread pulling one modality from a session into a [`FrameSink`].
///
/// The worker only holds the session weakly between pulls. It exits on the
/// end-of-stream sentinel, on a sink failure, once the session is gone or
/// after [`OutputWorker::request_stop`].
pub struct OutputWorker {
    modality: Modality,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<u64>>>,
}

impl OutputWorker {
    pub fn spawn(
        name: String,
        session: Weak<PlaybackSession>,
        modality: Modality,
        buffer_len: usize,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || run(session, modality, vec![0; buffer_len], sink, stop))?
        };
        Ok(Self {
            modality,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Flags the loop to exit after its current pull returns.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the loop to exit. A worker asked to join itself, as happens
    /// when it drops the last reference to its session, is left detached.
    pub fn join(self) -> Option<u64> {
        let handle = self.handle.lock().take()?;
        if handle.thread().id() == thread::current().id() {
            return None;
        }
        match handle.join() {
            Ok(buffers) => Some(buffers),
            Err(_) => {
                error!(modality = self.modality.label(), "output worker panicked");
                None
            }
        }
    }
}

impl std::fmt::Debug for OutputWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputWorker")
            .field("modality", &self.modality)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn run(
    session: Weak<PlaybackSession>,
    modality: Modality,
    mut buffer: Vec<u8>,
    mut sink: Box<dyn FrameSink>,
    stop: Arc<AtomicBool>,
) -> u64 {
    let mut buffers = 0_u64;
    while !stop.load(Ordering::Acquire) {
        let Some(session) = session.upgrade() else {
            break;
        };
        let fill = match modality {
            Modality::Audio => session.update_audio_data(&mut buffer),
            Modality::Image => session.update_image_data(&mut buffer),
        };
        drop(session);

        match fill {
            Ok(BufferFill::Data(0)) => thread::yield_now(),
            Ok(BufferFill::Data(len)) => {
                let len = len.min(buffer.len());
                if let Err(err) = sink.write(&buffer[..len]) {
                    warn!(modality = modality.label(), %err, "output sink failed");
                    break;
                }
                buffers += 1;
            }
            Ok(BufferFill::EndOfStream) => break,
            Err(err) => {
                debug!(modality = modality.label(), %err, "output pull rejected");
                break;
            }
        }
    }
    sink.end_of_stream();
    debug!(modality = modality.label(), buffers, "output worker exiting");
    buffers
}
