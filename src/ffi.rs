//! FFI bindings for Synheart Coach
//!
//! C-compatible functions for driving the engine from a host app. All inputs
//! and outputs are JSON in null-terminated C strings. Returned strings are
//! allocated here and must be freed with `coach_free_string`.
//!
//! Sessions created over FFI run in standard mode: the host has no way to
//! hand a network transport across this boundary.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use serde::Serialize;
use tokio::runtime::Runtime;

use crate::aggregator::{SignalAggregator, SignalInputs};
use crate::classifier::RuleClassifier;
use crate::config::{EngineConfig, EngineMode};
use crate::error::CoachError;
use crate::session::CoachingSession;
use crate::types::{ChildProfile, FeatureSnapshot};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn to_json_cstr<T: Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Parse an optional JSON config; NULL means defaults
unsafe fn config_from_ptr(ptr: *const c_char) -> Result<EngineConfig, CoachError> {
    match cstr_to_string(ptr) {
        Some(json) => EngineConfig::from_json(&json),
        None => Ok(EngineConfig::default()),
    }
}

// ============================================================================
// Stateless API
// ============================================================================

/// Classify a single snapshot with the rule-based classifier.
///
/// # Safety
/// - `snapshot_json` must be a valid null-terminated C string.
/// - `config_json` may be NULL for default thresholds.
/// - Returns a newly allocated decision JSON string; free with `coach_free_string`.
/// - Returns NULL on error; call `coach_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn coach_classify_json(
    snapshot_json: *const c_char,
    config_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let json_str = match cstr_to_string(snapshot_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid snapshot string pointer");
            return ptr::null_mut();
        }
    };

    let config = match config_from_ptr(config_json) {
        Ok(c) => c,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    match FeatureSnapshot::from_json(&json_str) {
        Ok(snapshot) => to_json_cstr(&RuleClassifier::new(config.thresholds).classify(&snapshot)),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Session API
// ============================================================================

/// Opaque handle to a coaching session
pub struct CoachSessionHandle {
    runtime: Runtime,
    aggregator: SignalAggregator,
    session: CoachingSession,
}

/// Start a standard-mode coaching session.
///
/// # Safety
/// - `config_json` and `profile_json` may be NULL for defaults.
/// - Returns a pointer that must be freed with `coach_session_free`.
/// - Returns NULL on error (including a personalized-mode config).
#[no_mangle]
pub unsafe extern "C" fn coach_session_new(
    config_json: *const c_char,
    profile_json: *const c_char,
) -> *mut CoachSessionHandle {
    clear_last_error();

    let config = match config_from_ptr(config_json) {
        Ok(c) => c,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };
    if config.mode == EngineMode::Personalized {
        set_last_error("Personalized mode is not available over FFI");
        return ptr::null_mut();
    }

    let profile = match cstr_to_string(profile_json) {
        Some(json) => match ChildProfile::from_json(&json) {
            Ok(p) => p,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        },
        None => ChildProfile::default(),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            set_last_error(&CoachError::Runtime(e.to_string()).to_string());
            return ptr::null_mut();
        }
    };

    let aggregator = SignalAggregator::from_config(&config);
    match CoachingSession::new(config, profile) {
        Ok(session) => Box::into_raw(Box::new(CoachSessionHandle {
            runtime,
            aggregator,
            session,
        })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Process one snapshot and return the tick output JSON.
///
/// # Safety
/// - `session` must be a valid pointer returned by `coach_session_new`.
/// - `snapshot_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `coach_free_string`.
/// - Returns NULL on error; call `coach_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn coach_session_tick(
    session: *mut CoachSessionHandle,
    snapshot_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }
    let handle = &mut *session;

    let json_str = match cstr_to_string(snapshot_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid snapshot string pointer");
            return ptr::null_mut();
        }
    };

    let snapshot = match FeatureSnapshot::from_json(&json_str) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    tick_json(handle, &snapshot)
}

/// Aggregate one tick of raw extractor outputs and process it.
///
/// Ticks are numbered by the session's aggregator starting at 0, so a
/// session should be fed either snapshots or inputs, not both.
///
/// # Safety
/// - `session` must be a valid pointer returned by `coach_session_new`.
/// - `inputs_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `coach_free_string`.
/// - Returns NULL on error; call `coach_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn coach_session_tick_inputs(
    session: *mut CoachSessionHandle,
    inputs_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }
    let handle = &mut *session;

    let json_str = match cstr_to_string(inputs_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid inputs string pointer");
            return ptr::null_mut();
        }
    };

    let inputs: SignalInputs = match serde_json::from_str(&json_str) {
        Ok(i) => i,
        Err(e) => {
            set_last_error(&CoachError::from(e).to_string());
            return ptr::null_mut();
        }
    };

    let snapshot = handle.aggregator.aggregate(inputs).snapshot;
    tick_json(handle, &snapshot)
}

fn tick_json(handle: &mut CoachSessionHandle, snapshot: &FeatureSnapshot) -> *mut c_char {
    let CoachSessionHandle { runtime, session, .. } = handle;
    match runtime.block_on(session.process_tick(snapshot)) {
        Ok(output) => to_json_cstr(&output),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Current session aggregate as JSON.
///
/// # Safety
/// - `session` must be a valid pointer returned by `coach_session_new`.
/// - Returns a newly allocated string that must be freed with `coach_free_string`.
#[no_mangle]
pub unsafe extern "C" fn coach_session_summary(session: *mut CoachSessionHandle) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }

    to_json_cstr(&(*session).session.summary())
}

/// End and free a session.
///
/// # Safety
/// - `session` must be a valid pointer returned by `coach_session_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn coach_session_free(session: *mut CoachSessionHandle) {
    if !session.is_null() {
        let mut handle = Box::from_raw(session);
        handle.session.end();
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Coach functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Coach function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn coach_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Coach function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn coach_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the Coach library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn coach_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
