//! Boundary to the native decoding backend.
//!
//! A backend is an opaque decoding/rendering session. Every primitive
//! returns a [`StatusCode`] on failure; the playback session translates
//! those into [`crate::PlayerError`] values and posts them through the event
//! queue. Backends report asynchronous state changes through the
//! [`EventSink`] handed to [`NativeBackend::init`] and never call listeners
//! directly.

pub mod ffi;
pub mod simulated;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{config::SessionConfig, events::EventSink};

pub use ffi::{FfiBackend, NativeVTable};
pub use simulated::{BackendCall, SimulatedBackend, SimulatedMedia, SimulatedProbe};

/// Integer status returned by native entry points. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);
    /// Generic failure inside the orchestration layer.
    pub const INTERNAL: StatusCode = StatusCode(-1);
    pub const UNSUPPORTED: StatusCode = StatusCode(2001);
    pub const INVALID_WINDOW: StatusCode = StatusCode(2002);
    pub const DISPOSED: StatusCode = StatusCode(2003);
    pub const HALTED: StatusCode = StatusCode(2004);
    /// The failure was already delivered through the native error callback.
    pub const REPORTED: StatusCode = StatusCode(2005);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Converts a raw native return value into a `Result`.
    pub fn check(raw: i32) -> NativeResult<()> {
        if raw == 0 {
            Ok(())
        } else {
            Err(StatusCode(raw))
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a native primitive.
pub type NativeResult<T> = std::result::Result<T, StatusCode>;

/// Seek precision requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Decode up to the exact target frame.
    Accurate,
    /// Jump to a nearby key frame.
    Fast,
}

impl SeekMode {
    pub const ACCURATE_FLAG: i32 = 0x01;
    pub const FAST_FLAG: i32 = 0x10;

    pub fn flags(self) -> i32 {
        match self {
            SeekMode::Accurate => Self::ACCURATE_FLAG,
            SeekMode::Fast => Self::FAST_FLAG,
        }
    }

    pub fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            Self::ACCURATE_FLAG => Some(SeekMode::Accurate),
            Self::FAST_FLAG => Some(SeekMode::Fast),
            _ => None,
        }
    }

    /// Accurate when not playing or when the rate lies in `[-1, 0]`,
    /// fast for forward and fast-reverse playback.
    pub fn for_playback(is_playing: bool, rate: f32) -> Self {
        if !is_playing || (-1.0..=0.0).contains(&rate) {
            SeekMode::Accurate
        } else {
            SeekMode::Fast
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    PcmSigned,
    PcmUnsigned,
}

/// PCM layout of decoded audio buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_size_bits: u16,
    pub encoding: SampleEncoding,
    pub big_endian: bool,
}

impl AudioFormat {
    /// 16-bit signed mono at 44.1 kHz.
    pub fn mono() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            sample_size_bits: 16,
            encoding: SampleEncoding::PcmSigned,
            big_endian: false,
        }
    }

    pub fn frame_size(&self) -> usize {
        usize::from(self.channels) * usize::from(self.sample_size_bits).div_ceil(8)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::mono()
    }
}

/// Pixel layout of decoded image buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    #[default]
    Rgb24,
    Gray8,
}

impl ColorSpace {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorSpace::Rgb24 => 3,
            ColorSpace::Gray8 => 1,
        }
    }
}

/// Raw native rendering surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub u64);

/// Everything the backend needs to create a session.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub path: String,
    pub audio_format: AudioFormat,
    pub color_space: ColorSpace,
    pub audio_buffer_size: usize,
    pub window: Option<WindowHandle>,
}

impl OpenRequest {
    pub fn new(path: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            path: path.into(),
            audio_format: config.audio_format,
            color_space: config.color_space,
            audio_buffer_size: config.audio_buffer_size,
            window: None,
        }
    }

    pub fn with_window(mut self, window: WindowHandle) -> Self {
        self.window = Some(window);
        self
    }
}

/// Outcome of a pull from the backend's output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFill {
    /// The first `n` bytes of the buffer hold fresh data.
    Data(usize),
    /// Sentinel: the backend will not produce more data for this modality.
    EndOfStream,
}

/// Primitive operations of one native decoding session.
///
/// Implementations must tolerate calls from several threads at once: the
/// command path, the output workers and the periodic poller all share the
/// handle. `init` and `dispose` are the only operations that need exclusive
/// access and the session guarantees `dispose` runs exactly once.
pub trait NativeBackend: Send + Sync {
    fn init(&mut self, request: &OpenRequest, events: EventSink) -> NativeResult<()>;
    fn dispose(&mut self);

    fn play(&self) -> NativeResult<()>;
    fn pause(&self) -> NativeResult<()>;
    fn stop(&self) -> NativeResult<()>;
    fn step_forward(&self) -> NativeResult<()>;
    fn step_backward(&self) -> NativeResult<()>;
    /// Asks the backend to wind down and hand sentinel buffers to any
    /// blocked output pulls.
    fn finish(&self) -> NativeResult<()>;
    fn seek(&self, time: f64, mode: SeekMode) -> NativeResult<()>;

    fn rate(&self) -> NativeResult<f32>;
    fn set_rate(&self, rate: f32) -> NativeResult<()>;
    fn rate_supported(&self, rate: f32) -> NativeResult<bool> {
        Ok(rate.is_finite())
    }

    fn volume(&self) -> NativeResult<f32>;
    fn set_volume(&self, volume: f32) -> NativeResult<()>;
    fn balance(&self) -> NativeResult<f32> {
        Err(StatusCode::UNSUPPORTED)
    }
    fn set_balance(&self, _balance: f32) -> NativeResult<()> {
        Err(StatusCode::UNSUPPORTED)
    }
    fn audio_sync_delay(&self) -> NativeResult<i64>;
    fn set_audio_sync_delay(&self, delay_ms: i64) -> NativeResult<()>;

    /// Seconds; negative when not known yet.
    fn presentation_time(&self) -> NativeResult<f64>;
    fn fps(&self) -> NativeResult<f64>;
    /// Seconds; negative when the stream length is unknown.
    fn duration(&self) -> NativeResult<f64>;
    fn image_width(&self) -> NativeResult<u32>;
    fn image_height(&self) -> NativeResult<u32>;
    fn audio_format(&self) -> NativeResult<AudioFormat>;
    fn color_space(&self) -> NativeResult<ColorSpace>;
    fn has_audio(&self) -> NativeResult<bool>;
    fn has_image(&self) -> NativeResult<bool>;

    /// Blocks until decoded audio is available or the stream ends.
    fn update_audio_data(&self, buffer: &mut [u8]) -> NativeResult<BufferFill>;
    /// Blocks until a decoded image is available or the stream ends.
    fn update_image_data(&self, buffer: &mut [u8]) -> NativeResult<BufferFill>;
}
