//! Version banner, printed once at startup.
//!
//! Grounded on `version.c`'s `get_version_text`.

pub fn version_text() -> String {
    format!("Version {}\n\n", env!("CARGO_PKG_VERSION"))
}
