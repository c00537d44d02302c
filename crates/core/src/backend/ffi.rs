//! Adapter over a C decoding library described by a table of entry points.
//!
//! The library reports asynchronous state changes through two callbacks.
//! Both trampolines only translate the raw codes into events on the
//! session's queue, so no listener code ever runs on a native call stack.

use std::{
    ffi::{c_char, c_void, CString},
    ptr,
    sync::atomic::{AtomicI32, Ordering},
};

use tracing::{debug, warn};

use super::{
    AudioFormat, BufferFill, ColorSpace, NativeBackend, NativeResult, OpenRequest, SampleEncoding,
    SeekMode, StatusCode,
};
use crate::events::EventSink;

pub type NativeHandle = *mut c_void;
pub type StateCallback = unsafe extern "C" fn(context: *mut c_void, code: i32, time: f64);
pub type ErrorCallback = unsafe extern "C" fn(context: *mut c_void, code: i32);

type Command = unsafe extern "C" fn(NativeHandle) -> i32;
type Getter<T> = unsafe extern "C" fn(NativeHandle, *mut T) -> i32;
type Pull = unsafe extern "C" fn(NativeHandle, *mut u8, usize, *mut usize) -> i32;

/// Status a buffer pull returns once the modality has no more data.
pub const END_OF_STREAM: i32 = 1;

pub const COLOR_SPACE_RGB24: i32 = 0;
pub const COLOR_SPACE_GRAY8: i32 = 1;

#[repr(C)]
pub struct NativeInitParams {
    pub path: *const c_char,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_size_bits: u16,
    pub signed_samples: u8,
    pub big_endian: u8,
    pub color_space: i32,
    pub audio_buffer_size: usize,
    /// Zero when no rendering surface is attached.
    pub window: u64,
    pub context: *mut c_void,
    pub on_state: StateCallback,
    pub on_error: ErrorCallback,
}

/// Entry points of the native library. Balance control is optional.
#[derive(Clone, Copy)]
pub struct NativeVTable {
    pub init: unsafe extern "C" fn(*const NativeInitParams, *mut NativeHandle) -> i32,
    pub dispose: unsafe extern "C" fn(NativeHandle),
    pub play: Command,
    pub pause: Command,
    pub stop: Command,
    pub step_forward: Command,
    pub step_backward: Command,
    pub finish: Command,
    pub seek: unsafe extern "C" fn(NativeHandle, f64, i32) -> i32,
    pub get_rate: Getter<f32>,
    pub set_rate: unsafe extern "C" fn(NativeHandle, f32) -> i32,
    pub get_volume: Getter<f32>,
    pub set_volume: unsafe extern "C" fn(NativeHandle, f32) -> i32,
    pub get_balance: Option<Getter<f32>>,
    pub set_balance: Option<unsafe extern "C" fn(NativeHandle, f32) -> i32>,
    pub get_audio_sync_delay: Getter<i64>,
    pub set_audio_sync_delay: unsafe extern "C" fn(NativeHandle, i64) -> i32,
    pub get_presentation_time: Getter<f64>,
    pub get_fps: Getter<f64>,
    pub get_duration: Getter<f64>,
    pub get_image_width: Getter<i32>,
    pub get_image_height: Getter<i32>,
    pub has_audio: Getter<i32>,
    pub has_image: Getter<i32>,
    pub update_audio_data: Pull,
    pub update_image_data: Pull,
}

impl std::fmt::Debug for NativeVTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeVTable")
            .field("balance", &self.get_balance.is_some())
            .finish_non_exhaustive()
    }
}

/// Callback context handed to the native side.
///
/// `last_error` remembers the code of the most recent error callback so a
/// call that both fires `on_error` and returns the same status is reported
/// once, through the callback.
struct CallbackContext {
    sink: EventSink,
    last_error: AtomicI32,
}

unsafe extern "C" fn forward_state(context: *mut c_void, code: i32, time: f64) {
    // SAFETY: `context` is the boxed context created in `init`, which
    // outlives the native handle.
    if let Some(context) = unsafe { (context as *const CallbackContext).as_ref() } {
        context.sink.post_native_state(code, time);
    }
}

unsafe extern "C" fn forward_error(context: *mut c_void, code: i32) {
    // SAFETY: see `forward_state`.
    if let Some(context) = unsafe { (context as *const CallbackContext).as_ref() } {
        context.last_error.store(code, Ordering::Release);
        context.sink.post_native_error(code);
    }
}

/// [`NativeBackend`] backed by a C library.
#[derive(Debug)]
pub struct FfiBackend {
    vtable: NativeVTable,
    handle: NativeHandle,
    context: *mut CallbackContext,
    request: Option<OpenRequest>,
}

// SAFETY: the native library accepts calls on its handle from any thread and
// the callback context is only read through shared references.
unsafe impl Send for FfiBackend {}
unsafe impl Sync for FfiBackend {}

impl FfiBackend {
    /// # Safety
    ///
    /// Every entry point in `vtable` must follow the documented native
    /// contract: handles stay valid until `dispose`, out-pointers are written
    /// only on success and callbacks stop before `dispose` returns.
    pub unsafe fn new(vtable: NativeVTable) -> Self {
        Self {
            vtable,
            handle: ptr::null_mut(),
            context: ptr::null_mut(),
            request: None,
        }
    }

    /// Returns the handle for a new call and forgets earlier error callbacks.
    fn live(&self) -> NativeResult<NativeHandle> {
        if self.handle.is_null() {
            return Err(StatusCode::DISPOSED);
        }
        if let Some(context) = self.callback_context() {
            context.last_error.store(0, Ordering::Release);
        }
        Ok(self.handle)
    }

    fn callback_context(&self) -> Option<&CallbackContext> {
        // SAFETY: non-null only between `init` and `release_context`, both of
        // which take `&mut self`.
        unsafe { self.context.as_ref() }
    }

    /// Like [`StatusCode::check`], but a failure the library already raised
    /// through `on_error` becomes [`StatusCode::REPORTED`].
    fn checked(&self, raw: i32) -> NativeResult<()> {
        if raw == 0 {
            return Ok(());
        }
        let reported = self
            .callback_context()
            .is_some_and(|context| context.last_error.swap(0, Ordering::AcqRel) == raw);
        if reported {
            debug!(status = raw, "failure already raised through the error callback");
            Err(StatusCode::REPORTED)
        } else {
            Err(StatusCode(raw))
        }
    }

    fn command(&self, entry: Command) -> NativeResult<()> {
        let handle = self.live()?;
        // SAFETY: `handle` is live and the entry point comes from the vtable.
        self.checked(unsafe { entry(handle) })
    }

    fn get<T: Default>(&self, entry: Getter<T>) -> NativeResult<T> {
        let handle = self.live()?;
        let mut out = T::default();
        // SAFETY: `out` is a valid, writable location for the whole call.
        self.checked(unsafe { entry(handle, &mut out) })?;
        Ok(out)
    }

    fn pull(&self, entry: Pull, buffer: &mut [u8]) -> NativeResult<BufferFill> {
        let handle = self.live()?;
        let mut written = 0_usize;
        // SAFETY: the native side writes at most `buffer.len()` bytes.
        let status = unsafe { entry(handle, buffer.as_mut_ptr(), buffer.len(), &mut written) };
        match status {
            END_OF_STREAM => Ok(BufferFill::EndOfStream),
            raw => self.checked(raw).map(|()| BufferFill::Data(written.min(buffer.len()))),
        }
    }

    fn release_context(&mut self) {
        if !self.context.is_null() {
            // SAFETY: created by `Box::into_raw` in `init` and released once.
            drop(unsafe { Box::from_raw(self.context) });
            self.context = ptr::null_mut();
        }
    }
}

impl NativeBackend for FfiBackend {
    fn init(&mut self, request: &OpenRequest, events: EventSink) -> NativeResult<()> {
        let path = CString::new(request.path.as_str()).map_err(|_| {
            warn!(path = %request.path, "media path contains an interior NUL");
            StatusCode::INTERNAL
        })?;
        self.release_context();
        self.context = Box::into_raw(Box::new(CallbackContext {
            sink: events,
            last_error: AtomicI32::new(0),
        }));

        let format = request.audio_format;
        let params = NativeInitParams {
            path: path.as_ptr(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            sample_size_bits: format.sample_size_bits,
            signed_samples: u8::from(format.encoding == SampleEncoding::PcmSigned),
            big_endian: u8::from(format.big_endian),
            color_space: match request.color_space {
                ColorSpace::Rgb24 => COLOR_SPACE_RGB24,
                ColorSpace::Gray8 => COLOR_SPACE_GRAY8,
            },
            audio_buffer_size: request.audio_buffer_size,
            window: request.window.map_or(0, |window| window.0),
            context: self.context.cast(),
            on_state: forward_state,
            on_error: forward_error,
        };

        let mut handle = ptr::null_mut();
        // SAFETY: `params` and `path` outlive the call; `handle` is writable.
        let status = unsafe { (self.vtable.init)(&params, &mut handle) };
        if let Err(status) = StatusCode::check(status) {
            self.release_context();
            return Err(status);
        }
        if handle.is_null() {
            self.release_context();
            return Err(StatusCode::INTERNAL);
        }
        self.handle = handle;
        self.request = Some(request.clone());
        debug!(path = %request.path, "native session created");
        Ok(())
    }

    fn dispose(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: the handle is live and is never used again.
            unsafe { (self.vtable.dispose)(self.handle) };
            self.handle = ptr::null_mut();
        }
        self.release_context();
    }

    fn play(&self) -> NativeResult<()> {
        self.command(self.vtable.play)
    }

    fn pause(&self) -> NativeResult<()> {
        self.command(self.vtable.pause)
    }

    fn stop(&self) -> NativeResult<()> {
        self.command(self.vtable.stop)
    }

    fn step_forward(&self) -> NativeResult<()> {
        self.command(self.vtable.step_forward)
    }

    fn step_backward(&self) -> NativeResult<()> {
        self.command(self.vtable.step_backward)
    }

    fn finish(&self) -> NativeResult<()> {
        self.command(self.vtable.finish)
    }

    fn seek(&self, time: f64, mode: SeekMode) -> NativeResult<()> {
        let handle = self.live()?;
        // SAFETY: live handle.
        self.checked(unsafe { (self.vtable.seek)(handle, time, mode.flags()) })
    }

    fn rate(&self) -> NativeResult<f32> {
        self.get(self.vtable.get_rate)
    }

    fn set_rate(&self, rate: f32) -> NativeResult<()> {
        let handle = self.live()?;
        // SAFETY: live handle.
        self.checked(unsafe { (self.vtable.set_rate)(handle, rate) })
    }

    fn volume(&self) -> NativeResult<f32> {
        self.get(self.vtable.get_volume)
    }

    fn set_volume(&self, volume: f32) -> NativeResult<()> {
        let handle = self.live()?;
        // SAFETY: live handle.
        self.checked(unsafe { (self.vtable.set_volume)(handle, volume) })
    }

    fn balance(&self) -> NativeResult<f32> {
        let entry = self.vtable.get_balance.ok_or(StatusCode::UNSUPPORTED)?;
        self.get(entry)
    }

    fn set_balance(&self, balance: f32) -> NativeResult<()> {
        let entry = self.vtable.set_balance.ok_or(StatusCode::UNSUPPORTED)?;
        let handle = self.live()?;
        // SAFETY: live handle.
        self.checked(unsafe { entry(handle, balance) })
    }

    fn audio_sync_delay(&self) -> NativeResult<i64> {
        self.get(self.vtable.get_audio_sync_delay)
    }

    fn set_audio_sync_delay(&self, delay_ms: i64) -> NativeResult<()> {
        let handle = self.live()?;
        // SAFETY: live handle.
        self.checked(unsafe { (self.vtable.set_audio_sync_delay)(handle, delay_ms) })
    }

    fn presentation_time(&self) -> NativeResult<f64> {
        self.get(self.vtable.get_presentation_time)
    }

    fn fps(&self) -> NativeResult<f64> {
        self.get(self.vtable.get_fps)
    }

    fn duration(&self) -> NativeResult<f64> {
        self.get(self.vtable.get_duration)
    }

    fn image_width(&self) -> NativeResult<u32> {
        let width = self.get(self.vtable.get_image_width)?;
        u32::try_from(width).map_err(|_| StatusCode::INTERNAL)
    }

    fn image_height(&self) -> NativeResult<u32> {
        let height = self.get(self.vtable.get_image_height)?;
        u32::try_from(height).map_err(|_| StatusCode::INTERNAL)
    }

    /// The library decodes into the requested layout.
    fn audio_format(&self) -> NativeResult<AudioFormat> {
        self.live()?;
        Ok(self
            .request
            .as_ref()
            .map(|request| request.audio_format)
            .unwrap_or_default())
    }

    fn color_space(&self) -> NativeResult<ColorSpace> {
        self.live()?;
        Ok(self
            .request
            .as_ref()
            .map(|request| request.color_space)
            .unwrap_or_default())
    }

    fn has_audio(&self) -> NativeResult<bool> {
        Ok(self.get(self.vtable.has_audio)? != 0)
    }

    fn has_image(&self) -> NativeResult<bool> {
        Ok(self.get(self.vtable.has_image)? != 0)
    }

    fn update_audio_data(&self, buffer: &mut [u8]) -> NativeResult<BufferFill> {
        self.pull(self.vtable.update_audio_data, buffer)
    }

    fn update_image_data(&self, buffer: &mut [u8]) -> NativeResult<BufferFill> {
        self.pull(self.vtable.update_image_data, buffer)
    }
}

impl Drop for FfiBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}
