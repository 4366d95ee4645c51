//! Activity probe for macOS using IOKit HIDIdleTime and the CoreGraphics
//! session dictionary.

use anyhow::{Context, Result};
use core_foundation::base::{CFType, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;

use super::{ActivityProbe, RawSample};
use crate::error::ProbeUnavailable;

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOServiceGetMatchingService(main_port: u32, matching: core_foundation::base::CFTypeRef) -> u32;
    fn IOServiceMatching(name: *const std::os::raw::c_char) -> core_foundation::base::CFTypeRef;
    fn IORegistryEntryCreateCFProperty(
        entry: u32,
        key: core_foundation::string::CFStringRef,
        allocator: core_foundation::base::CFAllocatorRef,
        options: u32,
    ) -> core_foundation::base::CFTypeRef;
    fn IOObjectRelease(object: u32) -> i32;
}

#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {
    fn CGSessionCopyCurrentDictionary() -> CFDictionaryRef;
}

/// Probe backed by IOKit and the window server session.
pub struct NativeProbe;

impl NativeProbe {
    pub fn new() -> Result<Self> {
        system_idle_millis()
            .map_err(|e| anyhow::anyhow!(e))
            .context("IOHIDSystem idle time not available")?;
        Ok(Self)
    }
}

impl ActivityProbe for NativeProbe {
    fn sample(&self) -> RawSample {
        let session = session_dictionary();
        let (locked, session_id) = match session {
            Some(dict) => (Ok(screen_locked(&dict)), session_id(&dict)),
            None => {
                let e = ProbeUnavailable::new("session", "no window server session");
                (Err(e.clone()), Err(e))
            }
        };

        RawSample::collect(system_idle_millis(), locked, session_id, None)
    }
}

/// Milliseconds since the last HID event, from IOHIDSystem's HIDIdleTime.
fn system_idle_millis() -> Result<u64, ProbeUnavailable> {
    let unavailable = |reason: &str| ProbeUnavailable::new("idle", reason);

    unsafe {
        let service_name = std::ffi::CString::new("IOHIDSystem").map_err(|e| unavailable(&e.to_string()))?;
        let matching = IOServiceMatching(service_name.as_ptr());
        if matching.is_null() {
            return Err(unavailable("IOServiceMatching returned null"));
        }

        // IOServiceGetMatchingService consumes the matching dictionary
        let service = IOServiceGetMatchingService(0, matching);
        if service == 0 {
            return Err(unavailable("IOHIDSystem service not found"));
        }

        let key = CFString::new("HIDIdleTime");
        let property = IORegistryEntryCreateCFProperty(service, key.as_concrete_TypeRef(), std::ptr::null(), 0);

        IOObjectRelease(service);

        if property.is_null() {
            return Err(unavailable("HIDIdleTime property missing"));
        }

        // nanoseconds
        let number: CFNumber = CFNumber::wrap_under_create_rule(property as *mut _);
        let nanos = number.to_i64().ok_or_else(|| unavailable("HIDIdleTime is not an integer"))?;

        Ok(nanos.max(0) as u64 / 1_000_000)
    }
}

fn session_dictionary() -> Option<CFDictionary<CFString, CFType>> {
    unsafe {
        let dict = CGSessionCopyCurrentDictionary();
        if dict.is_null() {
            None
        } else {
            Some(CFDictionary::wrap_under_create_rule(dict))
        }
    }
}

fn screen_locked(dict: &CFDictionary<CFString, CFType>) -> bool {
    // The key is only present while the screen is locked.
    dict.find(CFString::from_static_string("CGSSessionScreenIsLocked"))
        .and_then(|value| value.downcast::<CFBoolean>())
        .map(bool::from)
        .unwrap_or(false)
}

fn session_id(dict: &CFDictionary<CFString, CFType>) -> Result<String, ProbeUnavailable> {
    dict.find(CFString::from_static_string("kCGSSessionIDKey"))
        .and_then(|value| value.downcast::<CFNumber>())
        .and_then(|n| n.to_i64())
        .map(|id| id.to_string())
        .ok_or_else(|| ProbeUnavailable::new("session", "kCGSSessionIDKey missing"))
}
