//! C-ABI surface the host loads this core through: the virtual-file paths
//! of §6, one function per path operation, in a handle-plus-status-code
//! style with a thread-local last-error cell.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::tsb::PlayerState;
use crate::Engine;

// ============================================================================
// Error codes
// ============================================================================

pub const TSENGINE_OK: i32 = 0;
pub const TSENGINE_ERROR_HANDLE: i32 = 1;
pub const TSENGINE_ERROR_MEM: i32 = 2;
pub const TSENGINE_ERROR_PATH: i32 = 3;
pub const TSENGINE_ERROR_POSITION: i32 = 4;
pub const TSENGINE_ERROR_NOTAVAIL: i32 = 5;
pub const TSENGINE_ERROR_UNKNOWN: i32 = -1;

use std::cell::Cell;
thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(TSENGINE_OK) };
}

fn set_error(error: i32) {
    LAST_ERROR.with(|e| e.set(error));
}

/// Get the last error code set on this thread.
#[no_mangle]
pub extern "system" fn TSENGINE_ErrorGetCode() -> i32 {
    LAST_ERROR.with(|e| e.get())
}

// ============================================================================
// Player-state constants, mirroring `PlayerState` for the host side of the
// `player_state0` file (the text form is used by the VFS, this numeric form
// by callers that prefer it).
// ============================================================================

pub const TSENGINE_STATE_UNDEF: i32 = 0;
pub const TSENGINE_STATE_READY: i32 = 1;
pub const TSENGINE_STATE_PLAYING: i32 = 2;
pub const TSENGINE_STATE_PAUSED: i32 = 3;

fn state_to_i32(state: PlayerState) -> i32 {
    match state {
        PlayerState::Undef => TSENGINE_STATE_UNDEF,
        PlayerState::Ready => TSENGINE_STATE_READY,
        PlayerState::Playing => TSENGINE_STATE_PLAYING,
        PlayerState::Paused => TSENGINE_STATE_PAUSED,
    }
}

fn state_from_i32(state: i32) -> Option<PlayerState> {
    match state {
        TSENGINE_STATE_UNDEF => Some(PlayerState::Undef),
        TSENGINE_STATE_READY => Some(PlayerState::Ready),
        TSENGINE_STATE_PLAYING => Some(PlayerState::Playing),
        TSENGINE_STATE_PAUSED => Some(PlayerState::Paused),
        _ => None,
    }
}

/// Copy `s` into `buf` (capacity `buf_len`, including the terminating nul).
/// Returns the number of bytes written excluding the nul, or a negative
/// error code if `buf` is too small.
unsafe fn write_cstr(buf: *mut c_char, buf_len: usize, s: &str) -> i32 {
    if buf.is_null() || buf_len == 0 {
        set_error(TSENGINE_ERROR_MEM);
        return -1;
    }
    let bytes = s.as_bytes();
    if bytes.len() + 1 > buf_len {
        set_error(TSENGINE_ERROR_MEM);
        return -1;
    }
    let dst = std::slice::from_raw_parts_mut(buf as *mut u8, buf_len);
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()] = 0;
    bytes.len() as i32
}

unsafe fn read_cstr<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn engine_ref<'a>(handle: *mut c_void) -> Option<&'a Engine> {
    if handle.is_null() {
        set_error(TSENGINE_ERROR_HANDLE);
        return None;
    }
    Some(&*(handle as *const Engine))
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Install the `log` backend once per process. Safe to call repeatedly:
/// `try_init` no-ops if a logger (ours or the host's) is already set.
fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .try_init();
}

/// Create the engine from the process environment (`STREAM_TYPE`, §6).
///
/// # Returns
/// Opaque handle, or null on a configuration error (`TSENGINE_ErrorGetCode`
/// reports `TSENGINE_ERROR_NOTAVAIL` in that case).
#[no_mangle]
pub extern "system" fn TSENGINE_Create() -> *mut c_void {
    init_logging();
    match Engine::from_env() {
        Ok(engine) => Arc::into_raw(engine) as *mut c_void,
        Err(e) => {
            log::warn!("ffi: engine init failed: {e}");
            set_error(TSENGINE_ERROR_NOTAVAIL);
            std::ptr::null_mut()
        }
    }
}

/// Create the engine from caller-supplied defaults, for hosts that don't
/// drive configuration through the environment.
#[no_mangle]
pub extern "system" fn TSENGINE_CreateDefault() -> *mut c_void {
    init_logging();
    Arc::into_raw(Engine::new(EngineConfig::default())) as *mut c_void
}

/// Release the engine and stop its threads.
#[no_mangle]
pub unsafe extern "system" fn TSENGINE_Free(handle: *mut c_void) -> i32 {
    if handle.is_null() {
        set_error(TSENGINE_ERROR_HANDLE);
        return 0;
    }
    drop(Arc::from_raw(handle as *const Engine));
    1
}

// ============================================================================
// chan_select0 / chan_select_timestamp0
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_SetChannel(
    handle: *mut c_void,
    uri: *const c_char,
) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    let Some(uri) = read_cstr(uri) else {
        set_error(TSENGINE_ERROR_PATH);
        return 0;
    };
    if engine.open_channel(uri) {
        1
    } else {
        0
    }
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_SetInterface(
    handle: *mut c_void,
    iface: *const c_char,
) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    let Some(iface) = read_cstr(iface) else {
        set_error(TSENGINE_ERROR_PATH);
        return 0;
    };
    engine.set_interface(iface);
    1
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetChanSelectTimestamp(handle: *mut c_void) -> i64 {
    match engine_ref(handle) {
        Some(engine) => engine.chan_select_timestamp_ms() as i64,
        None => -1,
    }
}

// ============================================================================
// stream0.ts
// ============================================================================

/// Reported size of `stream0.ts`: an "infinite" seekable file, §6.
#[no_mangle]
pub extern "system" fn TSENGINE_GetStreamSize() -> i64 {
    i64::MAX
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_OpenReadHandle(handle: *mut c_void) -> u64 {
    match engine_ref(handle) {
        Some(engine) => engine.new_read_handle(),
        None => 0,
    }
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_CloseReadHandle(handle: *mut c_void, read_handle: u64) {
    if let Some(engine) = engine_ref(handle) {
        engine.release_read_handle(read_handle);
    }
}

/// Read up to `len` bytes of `stream0.ts` into `buf` for `read_handle`.
///
/// # Returns
/// Bytes copied (may be `0` with no data currently available), or `-1` on
/// an invalid handle.
#[no_mangle]
pub unsafe extern "system" fn TSENGINE_Read(
    handle: *mut c_void,
    read_handle: u64,
    buf: *mut u8,
    len: usize,
) -> i64 {
    let Some(engine) = engine_ref(handle) else { return -1 };
    if buf.is_null() {
        set_error(TSENGINE_ERROR_MEM);
        return -1;
    }
    let dst = std::slice::from_raw_parts_mut(buf, len);
    engine.read_stream(read_handle, dst) as i64
}

// ============================================================================
// player_state0
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetPlayerState(handle: *mut c_void) -> i32 {
    match engine_ref(handle) {
        Some(engine) => state_to_i32(engine.player_state()),
        None => -1,
    }
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_SetPlayerState(handle: *mut c_void, state: i32) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    let Some(state) = state_from_i32(state) else {
        set_error(TSENGINE_ERROR_PATH);
        return 0;
    };
    engine.set_player_state(state);
    1
}

// ============================================================================
// seek0
// ============================================================================

/// `"cur,max,off,actual,capacity"`, §6.
#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetSeek(
    handle: *mut c_void,
    buf: *mut c_char,
    buf_len: usize,
) -> i32 {
    let Some(engine) = engine_ref(handle) else { return -1 };
    write_cstr(buf, buf_len, &engine.seek_status())
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_SetSeek(handle: *mut c_void, seconds: u64) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    match engine.set_seek_seconds(seconds) {
        Ok(()) => 1,
        Err(e) => {
            log::debug!("ffi: seek clamped: {e}");
            set_error(TSENGINE_ERROR_POSITION);
            0
        }
    }
}

// ============================================================================
// trick_play0
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetTrickPlay(handle: *mut c_void) -> i16 {
    match engine_ref(handle) {
        Some(engine) => engine.trick_play_speed(),
        None => 0,
    }
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_SetTrickPlay(handle: *mut c_void, speed: i16) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    engine.set_trick_play_speed(speed);
    1
}

// ============================================================================
// flush0
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_RaiseFlush(handle: *mut c_void) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    engine.raise_flush();
    1
}

// ============================================================================
// drm0 / ecm0 / pat0 / pmt0
// ============================================================================

/// `drm0` read: JSON `{channel, ecm, pat, pmt, clear}`, §6.
#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetDrm(
    _handle: *mut c_void,
    buf: *mut c_char,
    buf_len: usize,
) -> i32 {
    let value = crate::mvar::read(crate::mvar::ids::DRM0);
    let json = match value {
        crate::mvar::MvarValue::Json(v) => v.to_string(),
        _ => "{}".to_string(),
    };
    write_cstr(buf, buf_len, &json)
}

fn mvar_bytes(id: &str) -> Vec<u8> {
    match crate::mvar::read(id) {
        crate::mvar::MvarValue::Bytes(b) => b,
        _ => Vec::new(),
    }
}

unsafe fn write_raw(buf: *mut u8, buf_len: usize, bytes: &[u8]) -> i64 {
    if buf.is_null() {
        set_error(TSENGINE_ERROR_MEM);
        return -1;
    }
    let n = bytes.len().min(buf_len);
    std::slice::from_raw_parts_mut(buf, buf_len)[..n].copy_from_slice(&bytes[..n]);
    n as i64
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetEcm(
    _handle: *mut c_void,
    buf: *mut u8,
    buf_len: usize,
) -> i64 {
    write_raw(buf, buf_len, &mvar_bytes(crate::mvar::ids::ECM0))
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetPat(
    _handle: *mut c_void,
    buf: *mut u8,
    buf_len: usize,
) -> i64 {
    write_raw(buf, buf_len, &mvar_bytes(crate::mvar::ids::PAT0))
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetPmt(
    _handle: *mut c_void,
    buf: *mut u8,
    buf_len: usize,
) -> i64 {
    write_raw(buf, buf_len, &mvar_bytes(crate::mvar::ids::PMT0))
}

// ============================================================================
// cdm_ready0
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetCdmReady(handle: *mut c_void) -> i32 {
    match engine_ref(handle) {
        Some(engine) => engine.cdm_ready() as i32,
        None => -1,
    }
}

/// Writing anything other than `"1"` is a no-op, per §6.
#[no_mangle]
pub unsafe extern "system" fn TSENGINE_SetCdmReady(handle: *mut c_void, value: *const c_char) -> i32 {
    let Some(engine) = engine_ref(handle) else { return 0 };
    if read_cstr(value) == Some("1") {
        engine.set_cdm_ready();
        1
    } else {
        0
    }
}

// ============================================================================
// stream_status
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetStreamStatus(
    handle: *mut c_void,
    buf: *mut c_char,
    buf_len: usize,
) -> i32 {
    let Some(engine) = engine_ref(handle) else { return -1 };
    write_cstr(buf, buf_len, &engine.stream_status())
}

// ============================================================================
// pidfile / sw_version / model / stats — informational, no handle needed
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetSwVersion(buf: *mut c_char, buf_len: usize) -> i32 {
    write_cstr(buf, buf_len, env!("CARGO_PKG_VERSION"))
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetModel(buf: *mut c_char, buf_len: usize) -> i32 {
    write_cstr(buf, buf_len, env!("CARGO_PKG_NAME"))
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetPidfile(buf: *mut c_char, buf_len: usize) -> i32 {
    write_cstr(buf, buf_len, &std::process::id().to_string())
}

#[no_mangle]
pub unsafe extern "system" fn TSENGINE_GetStats(
    handle: *mut c_void,
    buf: *mut c_char,
    buf_len: usize,
) -> i32 {
    let Some(engine) = engine_ref(handle) else { return -1 };
    let json = serde_json::json!({
        "player_state": state_to_i32(engine.player_state()),
        "trick_play": engine.trick_play_speed(),
        "stream_status": engine.stream_status(),
    })
    .to_string();
    write_cstr(buf, buf_len, &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_and_channel_switch_round_trip() {
        let handle = TSENGINE_CreateDefault();
        assert!(!handle.is_null());
        unsafe {
            let uri = std::ffi::CString::new("239.1.1.1:9000").unwrap();
            // No real socket in a unit test environment; connect() may fail,
            // but the call must not crash and must report failure cleanly.
            let _ = TSENGINE_SetChannel(handle, uri.as_ptr());
            assert_eq!(TSENGINE_GetStreamSize(), i64::MAX);
            assert_eq!(TSENGINE_Free(handle), 1);
        }
    }

    #[test]
    fn stats_json_round_trips_through_buffer() {
        let handle = TSENGINE_CreateDefault();
        let mut buf = [0i8; 256];
        unsafe {
            let n = TSENGINE_GetStats(handle, buf.as_mut_ptr(), buf.len());
            assert!(n > 0);
            let s = CStr::from_ptr(buf.as_ptr()).to_str().unwrap();
            assert!(s.contains("player_state"));
            TSENGINE_Free(handle);
        }
    }

    #[test]
    fn undersized_buffer_reports_mem_error() {
        let handle = TSENGINE_CreateDefault();
        let mut buf = [0i8; 1];
        unsafe {
            let n = TSENGINE_GetStats(handle, buf.as_mut_ptr(), buf.len());
            assert_eq!(n, -1);
            assert_eq!(TSENGINE_ErrorGetCode(), TSENGINE_ERROR_MEM);
            TSENGINE_Free(handle);
        }
    }
}
