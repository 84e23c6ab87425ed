//! Platform support.
//!
//! Whether the engine can run is decided once per process, the first time
//! anything asks, from the target OS and architecture and the
//! `WAFBIND_DISABLED` environment flag. Every later check returns the same
//! answer, so a `Handle` on an unsupported platform fails immediately and
//! always with the same reason.

use crate::Error;
use once_cell::sync::Lazy;
use std::env;

/// Environment flag that turns the engine off on an otherwise supported platform.
pub const DISABLED_ENV: &str = "WAFBIND_DISABLED";

const SUPPORTED_OS: &[&str] = &["linux", "macos"];
const SUPPORTED_ARCH: &[&str] = &["x86_64", "aarch64"];

static UNSUPPORTED_REASON: Lazy<Option<String>> = Lazy::new(|| {
    let flag = env::var(DISABLED_ENV).ok();
    let reason = probe(env::consts::OS, env::consts::ARCH, flag.as_deref());
    if let Some(reason) = &reason {
        tracing::debug!(%reason, "waf engine unavailable");
    }
    reason
});

/// Why the engine cannot run on `os`/`arch` with the disable flag set to `flag`, if it cannot.
fn probe(os: &str, arch: &str, flag: Option<&str>) -> Option<String> {
    if !SUPPORTED_OS.contains(&os) || !SUPPORTED_ARCH.contains(&arch) {
        return Some(format!("the target operating-system {os} or architecture {arch} are not supported"));
    }
    match flag.map(str::trim) {
        None | Some("" | "0" | "false") => None,
        Some(_) => Some(format!("the waf engine was disabled by the {DISABLED_ENV} environment variable")),
    }
}

pub(crate) fn ensure_supported() -> Result<(), Error> {
    match UNSUPPORTED_REASON.as_deref() {
        Some(reason) => Err(Error::Unsupported(reason)),
        None => Ok(()),
    }
}

/// Ok when the engine can be used on this platform.
pub fn health() -> Result<(), Error> {
    ensure_supported()
}

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
