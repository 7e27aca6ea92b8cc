// C-compatible FFI bindings.
//
// Safety requirements:
// - All pointers must be non-null unless documented otherwise
// - Instance pointers must come from `cadenza_open`/`cadenza_substate` and
//   be released with `cadenza_close`
// - String parameters must be valid null-terminated UTF-8
//
// Handle-returning functions return the handle (>= 0) or a negated
// `ErrorCode`. Status functions return 0 or a negated `ErrorCode`.

use std::ffi::{CStr, c_char, c_void};
use std::slice;

use log::debug;

use crate::audio_buffer::AudioBuffer;
use crate::config::{Config, StateFlags};
use crate::error::{Error, ErrorCode, Result};
use crate::fixed::Args;
use crate::handle::Handle;
use crate::object::ObjectKind;
use crate::property::Property;
use crate::state::State;
use crate::table::Released;
use crate::wave::{WaveFlags, WaveKind};

// Logger subsystem identifier
#[cfg(feature = "ios")]
const LOG_SUBSYSTEM: &str = "org.cadenza.engine";

// ═══════════════════════════════════════════════════════════════════════════
// Logger Initialization
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize platform logging.
///
/// With the `ios` feature this installs the unified logger, so messages show
/// up in Console.app and Xcode's debug console. Otherwise it does nothing
/// and the host is expected to install its own `log` backend.
#[unsafe(no_mangle)]
pub extern "C" fn cadenza_init_logger() {
    #[cfg(feature = "ios")]
    {
        use log::LevelFilter;
        use oslog::OsLogger;

        OsLogger::new(LOG_SUBSYSTEM)
            .level_filter(LevelFilter::Debug)
            .init()
            .ok();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Opaque Types
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque engine instance.
pub struct CadenzaState {
    inner: State,
}

/// Instance configuration.
#[repr(C)]
pub struct CadenzaConfig {
    pub sample_rate: u32,
    /// Frames per block.
    pub buffer: u32,
    pub channels: u32,
    /// `StateFlags` bits.
    pub flags: u32,
    pub max_voices: u32,
    pub queue_capacity: u32,
}

impl Default for CadenzaConfig {
    fn default() -> Self {
        let config = Config::default();
        Self {
            sample_rate: config.sample_rate,
            buffer: config.buffer as u32,
            channels: config.channels as u32,
            flags: config.flags.0,
            max_voices: config.max_voices as u32,
            queue_capacity: config.queue_capacity as u32,
        }
    }
}

impl From<&CadenzaConfig> for Config {
    fn from(c: &CadenzaConfig) -> Self {
        Config::new()
            .with_sample_rate(c.sample_rate)
            .with_buffer(c.buffer as usize)
            .with_channels(c.channels as usize)
            .with_flags(StateFlags(c.flags))
            .with_max_voices(c.max_voices as usize)
            .with_queue_capacity(c.queue_capacity as usize)
    }
}

/// Engine counters (for meters and displays).
#[repr(C)]
pub struct CadenzaReadback {
    pub sample_position: u64,
    pub active_voices: u32,
    pub free_voices: u32,
    pub total_voices: u32,
    /// Percent of the block period.
    pub cpu_load_avg: u32,
    pub cpu_load_max: u32,
    /// Microseconds per block.
    pub cpu_time_avg: u32,
    pub cpu_time_max: u32,
    pub instructions: u64,
}

/// Reads a voice's output after each fragment.
pub type CadenzaTapFn =
    extern "C" fn(samples: *const f32, frames: u32, channels: u32, user: *mut c_void);

/// Processes a voice's output in place after each fragment.
pub type CadenzaInsertFn =
    extern "C" fn(samples: *mut f32, frames: u32, channels: u32, user: *mut c_void);

/// Caller context for callbacks; the caller vouches it may cross threads.
struct UserData(*mut c_void);

unsafe impl Send for UserData {}

impl UserData {
    #[inline]
    fn get(&self) -> *mut c_void {
        self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

#[inline]
fn fail(e: Error) -> i32 {
    debug!("ffi call failed: {e}");
    -(e.code() as i32)
}

#[inline]
fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

#[inline]
fn encode(result: Result<Handle>) -> i32 {
    match result {
        Ok(h) => h.to_raw(),
        Err(e) => fail(e),
    }
}

#[inline]
fn handle(raw: i32) -> Result<Handle> {
    Handle::from_raw(raw).ok_or(Error::InvalidHandle)
}

/// Borrow the instance behind `state`.
///
/// # Safety
/// `state` must be null or a live pointer from `cadenza_open`/`cadenza_substate`.
unsafe fn instance<'a>(state: *const CadenzaState) -> Result<&'a State> {
    unsafe { state.as_ref() }
        .map(|s| &s.inner)
        .ok_or(Error::InvalidHandle)
}

/// # Safety
/// Same as [`instance`], and no other reference to the instance may be live.
unsafe fn instance_mut<'a>(state: *mut CadenzaState) -> Result<&'a mut State> {
    unsafe { state.as_mut() }
        .map(|s| &mut s.inner)
        .ok_or(Error::InvalidHandle)
}

/// # Safety
/// `ptr` must be null or a valid null-terminated string.
unsafe fn opt_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| Error::NotSupported("string is not UTF-8"))
}

/// # Safety
/// `ptr` must be a valid null-terminated string.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Result<&'a str> {
    unsafe { opt_str(ptr) }?.ok_or(Error::NotFound)
}

/// # Safety
/// `args` must point to `count` values, or be null with `count == 0`.
unsafe fn raw_args(args: *const i32, count: u32) -> Result<Args> {
    if count == 0 {
        return Ok(Args::EMPTY);
    }
    if args.is_null() {
        return Err(Error::ArgCount {
            expected: 0,
            got: count as usize,
        });
    }
    Args::from_raw(unsafe { slice::from_raw_parts(args, count as usize) })
}

/// Copy `s` into `buf` (truncated, always terminated when `len > 0`) and
/// return its full length.
///
/// # Safety
/// `buf` must be null or valid for `len` bytes.
unsafe fn write_str(s: &str, buf: *mut c_char, len: usize) -> i32 {
    if !buf.is_null() && len > 0 {
        let n = s.len().min(len - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr().cast::<c_char>(), buf, n);
            *buf.add(n) = 0;
        }
    }
    s.len().min(i32::MAX as usize) as i32
}

fn kind_code(kind: ObjectKind) -> i32 {
    match kind {
        ObjectKind::Bank => 0,
        ObjectKind::Wave => 1,
        ObjectKind::Program => 2,
        ObjectKind::String => 3,
        ObjectKind::Voice => 4,
    }
}

fn wave_kind(kind: i32) -> Result<WaveKind> {
    match kind {
        0 => Ok(WaveKind::Wave),
        1 => Ok(WaveKind::MipWave),
        _ => Err(Error::IndexRange),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Instances
// ═══════════════════════════════════════════════════════════════════════════

/// Get the default configuration values.
#[unsafe(no_mangle)]
pub extern "C" fn cadenza_default_config() -> CadenzaConfig {
    CadenzaConfig::default()
}

/// Open a master instance. `config` may be NULL for defaults.
///
/// # Safety
/// `out_state` must be valid for writes; `config` must be NULL or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_open(
    config: *const CadenzaConfig,
    out_state: *mut *mut CadenzaState,
) -> i32 {
    if out_state.is_null() {
        return fail(Error::InvalidHandle);
    }
    let config = match unsafe { config.as_ref() } {
        Some(c) => Config::from(c),
        None => Config::default(),
    };
    match State::open(config) {
        Ok(inner) => {
            unsafe { *out_state = Box::into_raw(Box::new(CadenzaState { inner })) };
            0
        }
        Err(e) => fail(e),
    }
}

/// Open a substate of `state`. `config` may be NULL for defaults.
///
/// # Safety
/// `state` must be a live instance; `out_state` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_substate(
    state: *const CadenzaState,
    config: *const CadenzaConfig,
    out_state: *mut *mut CadenzaState,
) -> i32 {
    if out_state.is_null() {
        return fail(Error::InvalidHandle);
    }
    let config = match unsafe { config.as_ref() } {
        Some(c) => Config::from(c),
        None => Config::default(),
    };
    let result = unsafe { instance(state) }.and_then(|s| s.substate(config));
    match result {
        Ok(inner) => {
            unsafe { *out_state = Box::into_raw(Box::new(CadenzaState { inner })) };
            0
        }
        Err(e) => fail(e),
    }
}

/// Close an instance and free it. Closing a master closes its substates,
/// which must still be freed with this function.
///
/// # Safety
/// `state` must be NULL or a pointer not yet passed to `cadenza_close`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_close(state: *mut CadenzaState) {
    if !state.is_null() {
        let state = unsafe { Box::from_raw(state) };
        drop(state.inner.close());
    }
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_root_voice(state: *const CadenzaState) -> i32 {
    encode(unsafe { instance(state) }.map(State::root_voice))
}

/// Apply pending engine notices.
///
/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_poll(state: *const CadenzaState) {
    if let Ok(s) = unsafe { instance(state) } {
        s.poll();
    }
}

/// Render `frames` frames into `out` (planar, `channels * frames` samples).
/// Offline instances only. Returns the number of samples written.
///
/// # Safety
/// `state` must be a live instance; `out` must be valid for `len` floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_run(
    state: *const CadenzaState,
    frames: u32,
    out: *mut f32,
    len: u32,
) -> i32 {
    let s = match unsafe { instance(state) } {
        Ok(s) => s,
        Err(e) => return fail(e),
    };
    if out.is_null() || (len as usize) < frames as usize * s.channels() {
        return fail(Error::IndexRange);
    }
    let mut rendered = Vec::new();
    if let Err(e) = s.run(frames as usize, &mut rendered) {
        return fail(e);
    }
    unsafe { std::ptr::copy_nonoverlapping(rendered.as_ptr(), out, rendered.len()) };
    rendered.len() as i32
}

/// Snapshot of the engine counters. Zeroed for a NULL instance.
///
/// # Safety
/// `state` must be NULL or a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_readback(state: *const CadenzaState) -> CadenzaReadback {
    let r = unsafe { instance(state) }
        .map(State::readback)
        .unwrap_or_default();
    CadenzaReadback {
        sample_position: r.sample_position,
        active_voices: r.active_voices,
        free_voices: r.free_voices,
        total_voices: r.total_voices,
        cpu_load_avg: r.cpu_load_avg,
        cpu_load_max: r.cpu_load_max,
        cpu_time_avg: r.cpu_time_avg,
        cpu_time_max: r.cpu_time_max,
        instructions: r.instructions,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Objects
// ═══════════════════════════════════════════════════════════════════════════

/// Object type code (0 bank, 1 wave, 2 program, 3 string, 4 voice).
///
/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_type_of(state: *const CadenzaState, h: i32) -> i32 {
    let result = unsafe { instance(state) }.and_then(|s| s.type_of(handle(h)?));
    match result {
        Ok(kind) => kind_code(kind),
        Err(e) => fail(e),
    }
}

/// Static name of a type code, or NULL.
#[unsafe(no_mangle)]
pub extern "C" fn cadenza_type_name(kind: i32) -> *const c_char {
    match kind {
        0 => c"bank".as_ptr(),
        1 => c"wave".as_ptr(),
        2 => c"program".as_ptr(),
        3 => c"string".as_ptr(),
        4 => c"voice".as_ptr(),
        _ => std::ptr::null(),
    }
}

/// Copy the description of an error code into `buf`.
///
/// # Safety
/// `buf` must be NULL or valid for `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_error_string(code: i32, buf: *mut c_char, len: u32) -> i32 {
    let text = code
        .checked_abs()
        .and_then(ErrorCode::from_i32)
        .map_or("unknown error", ErrorCode::description);
    unsafe { write_str(text, buf, len as usize) }
}

/// Copy the object's name into `buf`; returns its length or `-NoName`.
///
/// # Safety
/// `state` must be a live instance; `buf` must be NULL or valid for `len`
/// bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_name(
    state: *const CadenzaState,
    h: i32,
    buf: *mut c_char,
    len: u32,
) -> i32 {
    let result = unsafe { instance(state) }
        .and_then(|s| s.name(handle(h)?))
        .and_then(|name| name.ok_or(Error::NoName));
    match result {
        Ok(name) => unsafe { write_str(&name, buf, len as usize) },
        Err(e) => fail(e),
    }
}

/// Copy a human readable description of the object into `buf`.
///
/// # Safety
/// `state` must be a live instance; `buf` must be NULL or valid for `len`
/// bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_describe(
    state: *const CadenzaState,
    h: i32,
    buf: *mut c_char,
    len: u32,
) -> i32 {
    match unsafe { instance(state) }.and_then(|s| s.describe(handle(h)?)) {
        Ok(text) => unsafe { write_str(&text, buf, len as usize) },
        Err(e) => fail(e),
    }
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_retain(state: *const CadenzaState, h: i32) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| s.retain(handle(h)?)))
}

/// Drop a reference. Returns `-Refused` for voices the engine still runs;
/// their handle is recycled once the engine lets go.
///
/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_release(state: *const CadenzaState, h: i32) -> i32 {
    match unsafe { instance(state) }.and_then(|s| s.release(handle(h)?)) {
        Ok(Released::Deferred) => -(ErrorCode::Refused as i32),
        Ok(_) => 0,
        Err(e) => fail(e),
    }
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_assign(state: *const CadenzaState, owner: i32, h: i32) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| s.assign(handle(owner)?, handle(h)?)))
}

/// Assign `h` to `owner` and export it. A NULL `name` uses the object's own
/// name.
///
/// # Safety
/// `state` must be a live instance; `name` must be NULL or a valid string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_export(
    state: *const CadenzaState,
    owner: i32,
    h: i32,
    name: *const c_char,
) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| {
        let name = unsafe { opt_str(name) }?;
        s.export(handle(owner)?, handle(h)?, name)
    }))
}

/// # Safety
/// `state` must be a live instance; `name` must be NULL or a valid string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_new_bank(state: *const CadenzaState, name: *const c_char) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| s.new_bank(unsafe { opt_str(name) }?)))
}

/// # Safety
/// `state` must be a live instance; `text` must be a valid string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_new_string(state: *const CadenzaState, text: *const c_char) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| s.new_string(unsafe { str_arg(text) }?)))
}

/// Create an empty wave. `kind` is 0 (plain) or 1 (mip-mapped); a `period`
/// of 0 tunes it to the instance's sample rate.
///
/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_new_wave(
    state: *const CadenzaState,
    kind: i32,
    period: u32,
    flags: u32,
) -> i32 {
    encode(
        unsafe { instance(state) }
            .and_then(|s| s.new_wave(wave_kind(kind)?, period, WaveFlags(flags))),
    )
}

/// Append `count` mono frames to a writable object.
///
/// # Safety
/// `state` must be a live instance; `frames` must be valid for `count`
/// floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_write(
    state: *const CadenzaState,
    h: i32,
    frames: *const f32,
    count: u32,
) -> i32 {
    if frames.is_null() && count > 0 {
        return fail(Error::IndexRange);
    }
    let frames = match count {
        0 => &[][..],
        n => unsafe { slice::from_raw_parts(frames, n as usize) },
    };
    status(unsafe { instance(state) }.and_then(|s| s.write(handle(h)?, frames)))
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_flush(state: *const CadenzaState, h: i32) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| s.flush(handle(h)?)))
}

/// Compile a script file into a new bank.
///
/// # Safety
/// `state` must be a live instance; `path` must be a valid string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_load(state: *const CadenzaState, path: *const c_char) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| s.load(unsafe { str_arg(path) }?)))
}

/// Compile script source into a new bank called `name`.
///
/// # Safety
/// `state` must be a live instance; `source` and `name` must be valid
/// strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_load_string(
    state: *const CadenzaState,
    source: *const c_char,
    name: *const c_char,
) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| {
        let source = unsafe { str_arg(source) }?;
        let name = unsafe { opt_str(name) }?.unwrap_or("script");
        s.load_string(source, name)
    }))
}

/// Release every object the instance family created and still holds.
/// Returns the number released.
///
/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_unload_all(state: *const CadenzaState) -> i32 {
    match unsafe { instance(state) } {
        Ok(s) => s.unload_all().min(i32::MAX as usize) as i32,
        Err(e) => fail(e),
    }
}

/// Resolve a `/` separated export path.
///
/// # Safety
/// `state` must be a live instance; `path` must be a valid string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_get(
    state: *const CadenzaState,
    node: i32,
    path: *const c_char,
) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| s.get(handle(node)?, unsafe { str_arg(path) }?)))
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_get_export(
    state: *const CadenzaState,
    node: i32,
    index: u32,
) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| s.get_export(handle(node)?, index as usize)))
}

/// # Safety
/// `state` must be a live instance; `buf` must be NULL or valid for `len`
/// bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_get_export_name(
    state: *const CadenzaState,
    node: i32,
    index: u32,
    buf: *mut c_char,
    len: u32,
) -> i32 {
    match unsafe { instance(state) }.and_then(|s| s.get_export_name(handle(node)?, index as usize))
    {
        Ok(name) => unsafe { write_str(&name, buf, len as usize) },
        Err(e) => fail(e),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Timing
// ═══════════════════════════════════════════════════════════════════════════

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_now(state: *mut CadenzaState) {
    if let Ok(s) = unsafe { instance_mut(state) } {
        s.now();
    }
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_wait(state: *mut CadenzaState, ms: f32) {
    if let Ok(s) = unsafe { instance_mut(state) } {
        s.wait(ms);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Voices
// ═══════════════════════════════════════════════════════════════════════════

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_new_group(state: *const CadenzaState, parent: i32) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| s.new_group(handle(parent)?)))
}

/// Start `program` under `parent` with 16:16 fixed-point arguments.
///
/// # Safety
/// `state` must be a live instance; `args` must be valid for `count`
/// values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_start(
    state: *const CadenzaState,
    parent: i32,
    program: i32,
    args: *const i32,
    count: u32,
) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| {
        let args = unsafe { raw_args(args, count) }?;
        s.start(handle(parent)?, handle(program)?, &args)
    }))
}

/// Like `cadenza_start`, without a handle for the new voice.
///
/// # Safety
/// `state` must be a live instance; `args` must be valid for `count`
/// values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_play(
    state: *const CadenzaState,
    parent: i32,
    program: i32,
    args: *const i32,
    count: u32,
) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| {
        let args = unsafe { raw_args(args, count) }?;
        s.play(handle(parent)?, handle(program)?, &args)
    }))
}

/// # Safety
/// `state` must be a live instance; `args` must be valid for `count`
/// values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_send(
    state: *const CadenzaState,
    voice: i32,
    entry: u32,
    args: *const i32,
    count: u32,
) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| {
        let args = unsafe { raw_args(args, count) }?;
        s.send(handle(voice)?, entry as usize, &args)
    }))
}

/// # Safety
/// `state` must be a live instance; `args` must be valid for `count`
/// values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_send_children(
    state: *const CadenzaState,
    voice: i32,
    entry: u32,
    args: *const i32,
    count: u32,
) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| {
        let args = unsafe { raw_args(args, count) }?;
        s.send_children(handle(voice)?, entry as usize, &args)
    }))
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_kill(state: *const CadenzaState, voice: i32) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| s.kill(handle(voice)?)))
}

/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_kill_children(state: *const CadenzaState, voice: i32) -> i32 {
    status(unsafe { instance(state) }.and_then(|s| s.kill_children(handle(voice)?)))
}

/// Call `callback` with the voice's output after each fragment. The
/// callback runs in the audio context.
///
/// # Safety
/// `state` must be a live instance; `user` must stay valid, and be usable
/// from the audio thread, for as long as the voice runs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_tap(
    state: *const CadenzaState,
    voice: i32,
    callback: CadenzaTapFn,
    user: *mut c_void,
) -> i32 {
    let user = UserData(user);
    status(unsafe { instance(state) }.and_then(|s| {
        s.tap(
            handle(voice)?,
            Box::new(move |io: &AudioBuffer| {
                callback(
                    io.data.as_ptr(),
                    io.frames as u32,
                    io.channels as u32,
                    user.get(),
                )
            }),
        )
    }))
}

/// Let `callback` process the voice's output in place after each fragment.
///
/// # Safety
/// Same as `cadenza_tap`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_insert(
    state: *const CadenzaState,
    voice: i32,
    callback: CadenzaInsertFn,
    user: *mut c_void,
) -> i32 {
    let user = UserData(user);
    status(unsafe { instance(state) }.and_then(|s| {
        s.insert(
            handle(voice)?,
            Box::new(move |io: &mut AudioBuffer| {
                callback(
                    io.data.as_mut_ptr(),
                    io.frames as u32,
                    io.channels as u32,
                    user.get(),
                )
            }),
        )
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Properties
// ═══════════════════════════════════════════════════════════════════════════

/// Read a property into `out`. Instance properties ignore `h`; pass -1.
///
/// # Safety
/// `state` must be a live instance; `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_get_property(
    state: *const CadenzaState,
    h: i32,
    property: i32,
    out: *mut i32,
) -> i32 {
    if out.is_null() {
        return fail(Error::IndexRange);
    }
    let result = unsafe { instance(state) }.and_then(|s| {
        let property = Property::from_id(property).ok_or(Error::IndexRange)?;
        s.get_property(Handle::from_raw(h), property)
    });
    match result {
        Ok(value) => {
            unsafe { *out = value };
            0
        }
        Err(e) => fail(e),
    }
}

/// Write a property. Instance properties ignore `h`; pass -1.
///
/// # Safety
/// `state` must be a live instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_set_property(
    state: *mut CadenzaState,
    h: i32,
    property: i32,
    value: i32,
) -> i32 {
    status(unsafe { instance_mut(state) }.and_then(|s| {
        let property = Property::from_id(property).ok_or(Error::IndexRange)?;
        s.set_property(Handle::from_raw(h), property, value)
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Offline Rendering
// ═══════════════════════════════════════════════════════════════════════════

/// Render `program` into `sink`. A `length` of 0 renders until silence.
/// Returns the number of frames rendered or a negated error code.
///
/// # Safety
/// `state` must be a live instance; `args` must be valid for `count`
/// values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_render(
    state: *const CadenzaState,
    sink: i32,
    sample_rate: u32,
    length: u64,
    program: i32,
    args: *const i32,
    count: u32,
) -> i64 {
    let result = unsafe { instance(state) }.and_then(|s| {
        let args = unsafe { raw_args(args, count) }?;
        s.render(handle(sink)?, sample_rate, length, handle(program)?, &args)
    });
    match result {
        Ok(frames) => frames.min(i64::MAX as u64) as i64,
        Err(e) => i64::from(fail(e)),
    }
}

/// Render `program` into a new, flushed wave and return its handle.
///
/// # Safety
/// `state` must be a live instance; `args` must be valid for `count`
/// values.
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadenza_render_to_new_wave(
    state: *const CadenzaState,
    kind: i32,
    period: u32,
    flags: u32,
    sample_rate: u32,
    length: u64,
    program: i32,
    args: *const i32,
    count: u32,
) -> i32 {
    encode(unsafe { instance(state) }.and_then(|s| {
        let args = unsafe { raw_args(args, count) }?;
        s.render_to_new_wave(
            wave_kind(kind)?,
            period,
            WaveFlags(flags),
            sample_rate,
            length,
            handle(program)?,
            &args,
        )
    }))
}
