//! Activity probe for Linux using the X11 XScreenSaver extension.

use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::screensaver::ConnectionExt as ScreensaverConnectionExt;
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt as XprotoConnectionExt, Window};
use x11rb::rust_connection::RustConnection;

use super::{ActivityProbe, RawSample};
use crate::error::ProbeUnavailable;

/// `ScreenSaver` state value for an active (blanked/locked) screen.
const SCREENSAVER_ON: u8 = 1;

/// Probe backed by the X11 display named in `DISPLAY`.
///
/// A fresh connection is opened for every sample so a restarted display
/// server only costs one unknown sample.
pub struct NativeProbe;

impl NativeProbe {
    /// Create the probe, verifying that the screensaver extension answers.
    pub fn new() -> Result<Self> {
        let (conn, root) = connect().context("Failed to connect to X11 display. Is DISPLAY set?")?;

        conn.screensaver_query_info(root)
            .context("XScreenSaver extension not available")?
            .reply()
            .context("Failed to query XScreenSaver info")?;

        Ok(Self)
    }
}

impl ActivityProbe for NativeProbe {
    fn sample(&self) -> RawSample {
        let (conn, root) = match connect() {
            Ok(c) => c,
            Err(e) => return RawSample::unknown(ProbeUnavailable::new("display", e)),
        };

        let info = conn
            .screensaver_query_info(root)
            .map_err(|e| ProbeUnavailable::new("screensaver", e))
            .and_then(|cookie| cookie.reply().map_err(|e| ProbeUnavailable::new("screensaver", e)));

        let (idle, locked) = match info {
            Ok(reply) => (
                Ok(u64::from(reply.ms_since_user_input)),
                Ok(u8::from(reply.state) == SCREENSAVER_ON),
            ),
            Err(e) => (Err(e.clone()), Err(e)),
        };

        RawSample::collect(idle, locked, active_session_id(), foreground_window_title(&conn, root))
    }
}

fn connect() -> Result<(RustConnection, Window)> {
    let (conn, screen_num) = RustConnection::connect(None)?;
    let root = conn
        .setup()
        .roots
        .get(screen_num)
        .map(|screen| screen.root)
        .context("X11 screen missing from setup")?;
    Ok((conn, root))
}

fn active_session_id() -> Result<String, ProbeUnavailable> {
    std::env::var("XDG_SESSION_ID")
        .or_else(|_| std::env::var("DISPLAY"))
        .map_err(|e| ProbeUnavailable::new("session", e))
}

/// Title of the window named by `_NET_ACTIVE_WINDOW`, if the window manager
/// publishes one.
fn foreground_window_title(conn: &RustConnection, root: Window) -> Option<String> {
    let atom = |name: &[u8]| -> Option<u32> {
        Some(conn.intern_atom(false, name).ok()?.reply().ok()?.atom)
    };

    let active = atom(b"_NET_ACTIVE_WINDOW")?;
    let wm_name = atom(b"_NET_WM_NAME")?;
    let utf8 = atom(b"UTF8_STRING")?;

    let window = conn
        .get_property(false, root, active, AtomEnum::WINDOW, 0, 1)
        .ok()?
        .reply()
        .ok()?
        .value32()?
        .next()
        .filter(|&w| w != 0)?;

    let title = conn
        .get_property(false, window, wm_name, utf8, 0, 256)
        .ok()?
        .reply()
        .ok()?;

    Some(String::from_utf8_lossy(&title.value).into_owned())
}
