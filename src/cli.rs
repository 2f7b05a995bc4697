//! Argument parsing and the order-auto-detection rule: of the two
//! positional arguments, whichever is a regular file whose first 1 KiB
//! looks like text is `System.map`; the other is the guest-access handle.
//!
//! Grounded on `main.c`'s `is_text_file`/`main` argument handling.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "dmesg-extract", about = "Extract the kernel log from a guest without running code inside it")]
pub struct Cli {
    /// Guest access handle or System.map path (order auto-detected).
    pub first: String,
    /// Guest access handle or System.map path (order auto-detected).
    pub second: String,
}

/// The two positional arguments, sorted into their roles.
pub struct Args {
    pub system_map: PathBuf,
    pub guest_access: String,
}

const TEXT_PROBE_BYTES: usize = 1024;

/// A regular file whose first KiB is entirely printable ASCII, whitespace,
/// or NUL is treated as text; anything else (binary image, socket, missing
/// file) is not.
fn is_text_file(path: &str) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buf = [0u8; TEXT_PROBE_BYTES];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    buf[..n]
        .iter()
        .all(|&b| b == 0 || b.is_ascii_graphic() || b.is_ascii_whitespace())
}

fn is_regular_file(path: &str) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

impl Cli {
    pub fn classify(self) -> Result<Args> {
        let (system_map, guest_access) = if is_regular_file(&self.first) && is_text_file(&self.first) {
            (self.first, self.second)
        } else if is_regular_file(&self.second) && is_text_file(&self.second) {
            (self.second, self.first)
        } else {
            return Err(Error::InvalidArguments(
                "System.map file not found among the given arguments".into(),
            ));
        };
        Ok(Args {
            system_map: Path::new(&system_map).to_path_buf(),
            guest_access,
        })
    }
}
