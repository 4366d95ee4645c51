//! Activity probe for Windows using GetLastInputInfo and the WTS session APIs.

use anyhow::Result;
use windows::Win32::System::RemoteDesktop::WTSGetActiveConsoleSessionId;
use windows::Win32::System::StationsAndDesktops::{
    CloseDesktop, OpenInputDesktop, SwitchDesktop, DESKTOP_CONTROL_FLAGS, DESKTOP_SWITCHDESKTOP,
};
use windows::Win32::System::SystemInformation::GetTickCount;
use windows::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowTextW};

use super::{ActivityProbe, RawSample};
use crate::error::ProbeUnavailable;

/// Returned by WTSGetActiveConsoleSessionId when no session is attached.
const NO_CONSOLE_SESSION: u32 = 0xFFFF_FFFF;

/// Probe backed by the Win32 input and desktop APIs.
pub struct NativeProbe;

impl NativeProbe {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl ActivityProbe for NativeProbe {
    fn sample(&self) -> RawSample {
        RawSample::collect(
            system_idle_millis(),
            Ok(input_desktop_locked()),
            active_session_id(),
            foreground_window_title(),
        )
    }
}

fn system_idle_millis() -> Result<u64, ProbeUnavailable> {
    unsafe {
        let mut last_input = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };

        if GetLastInputInfo(&mut last_input).as_bool() {
            let current_tick = GetTickCount();
            Ok(u64::from(current_tick.wrapping_sub(last_input.dwTime)))
        } else {
            Err(ProbeUnavailable::new("idle", "GetLastInputInfo failed"))
        }
    }
}

/// The input desktop cannot be switched to while the workstation is locked.
fn input_desktop_locked() -> bool {
    unsafe {
        match OpenInputDesktop(DESKTOP_CONTROL_FLAGS(0), false, DESKTOP_SWITCHDESKTOP) {
            Ok(desktop) => {
                let switchable = SwitchDesktop(desktop).is_ok();
                let _ = CloseDesktop(desktop);
                !switchable
            }
            Err(_) => true,
        }
    }
}

fn active_session_id() -> Result<String, ProbeUnavailable> {
    let id = unsafe { WTSGetActiveConsoleSessionId() };
    if id == NO_CONSOLE_SESSION {
        Err(ProbeUnavailable::new("session", "no active console session"))
    } else {
        Ok(id.to_string())
    }
}

fn foreground_window_title() -> Option<String> {
    unsafe {
        let hwnd = GetForegroundWindow();
        if hwnd.0.is_null() {
            return None;
        }
        let mut buf = [0u16; 512];
        let len = GetWindowTextW(hwnd, &mut buf);
        if len <= 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..len as usize]))
    }
}
