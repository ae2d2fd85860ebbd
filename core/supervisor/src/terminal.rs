//! Controlling-terminal mode as a scoped resource.
//!
//! `TerminalGuard` switches the terminal to raw passthrough and puts it back on
//! drop. A panic hook performs the same restoration first, so a fault anywhere
//! in the process still leaves the user with a usable shell.

use crossterm::{cursor, execute, style, terminal};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tracing::{debug, warn};

// Normal cursor keys and the primary screen buffer; crossterm has no command
// for the former and the child may have used the legacy 47 variant.
const RESET_MODES: &[u8] = b"\x1b[?1l\x1b[?47l";

static RAW_MODE_ACTIVE: AtomicBool = AtomicBool::new(false);
static PANIC_HOOK: Once = Once::new();

pub struct TerminalGuard {
    _private: (),
}

impl TerminalGuard {
    /// Enter raw mode. Failure is not fatal: relaying still works, echo may
    /// just be imperfect.
    pub fn acquire() -> Self {
        install_panic_hook();
        let raw = match terminal::enable_raw_mode() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Raw mode unavailable; continuing without it");
                false
            }
        };
        RAW_MODE_ACTIVE.store(raw, Ordering::SeqCst);
        debug!(raw, "Terminal acquired");
        Self { _private: () }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        restore();
    }
}

/// Current terminal size as (cols, rows), with a conventional fallback.
pub fn size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => (80, 24),
    }
}

/// Put the terminal back: raw mode off, SGR reset, cursor visible, main screen.
/// Safe to call more than once.
pub fn restore() {
    if RAW_MODE_ACTIVE.swap(false, Ordering::SeqCst) {
        let _ = terminal::disable_raw_mode();
    }
    let mut stdout = io::stdout();
    let _ = execute!(
        stdout,
        style::ResetColor,
        style::SetAttribute(style::Attribute::Reset),
        cursor::Show,
        terminal::LeaveAlternateScreen
    );
    let _ = stdout.write_all(RESET_MODES);
    let _ = stdout.flush();
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            restore();
            tracing::error!(panic = %info, "cc-supervisor panicked");
            previous(info);
        }));
    });
}
