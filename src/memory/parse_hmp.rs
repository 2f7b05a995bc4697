//! Parsing helpers for QEMU's Human Monitor Protocol text responses.
//!
//! Shared by the libvirt and QMP transports, both of which ultimately drive
//! the guest through HMP commands (`info registers`, `xp`) and have to pick
//! register values and hex dumps back out of loosely formatted text.

/// Scans `text` for `key` and parses the hex digits that follow it, skipping
/// over any `=` or whitespace in between.
///
/// This replaces the original tool's `strtok`-style line splitting with a
/// single substring scan that tolerates whatever separator QEMU puts between
/// the register name and its value across versions.
pub fn extract_register(text: &str, key: &str) -> Option<u64> {
    let idx = text.find(key)?;
    let rest = &text[idx + key.len()..];
    let rest = rest.trim_start_matches(|c: char| c == '=' || c.is_whitespace());
    let hex_len = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    if hex_len == 0 {
        return None;
    }
    u64::from_str_radix(&rest[..hex_len], 16).ok()
}

/// Parses an `xp /Nxw` style dump: each line is `ADDR: 0xWWWWWWWW ...` with
/// four little-endian 32-bit words per line. Returns the words' bytes in
/// address order.
pub fn parse_word_dump(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else { continue };
        if !first.ends_with(':') {
            continue;
        }
        for tok in tokens {
            let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) else {
                continue;
            };
            let Ok(word) = u32::from_str_radix(hex, 16) else {
                continue;
            };
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}

/// Parses an `xp /Nxb` style dump: each line is `ADDR: 0xBB ...` with one
/// byte per token.
pub fn parse_byte_dump(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else { continue };
        if !first.ends_with(':') {
            continue;
        }
        for tok in tokens {
            let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) else {
                continue;
            };
            let Ok(byte) = u8::from_str_radix(hex, 16) else {
                continue;
            };
            out.push(byte);
        }
    }
    out
}

/// Finds the *last* `0x`/`0X`-prefixed hex token in `text` and parses it.
///
/// Grounded on `parse_hmp.c`'s `hmp_gpa2hva`, which scans an `xp` response
/// for physical address 0 and takes the final hex literal as the
/// corresponding host-virtual address. Not used by the core decode path;
/// kept as a reusable, tested building block per the supplemental GPA->HVA
/// helper.
pub fn find_last_hex_token(text: &str) -> Option<u64> {
    let mut last = None;
    let mut rest = text;
    while let Some(pos) = rest.find("0x").or_else(|| rest.find("0X")) {
        let candidate = &rest[pos + 2..];
        let hex_len = candidate
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(candidate.len());
        if hex_len > 0 {
            if let Ok(v) = u64::from_str_radix(&candidate[..hex_len], 16) {
                last = Some(v);
            }
        }
        rest = &candidate[hex_len.max(1).min(candidate.len())..];
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_register_with_equals() {
        let text = "RAX=0000000000000000 RBX=ffffffff81000000 CR3=0000000019872000 CR4=00000000";
        assert_eq!(extract_register(text, "CR3"), Some(0x19872000));
        assert_eq!(extract_register(text, "CR4"), Some(0));
    }

    #[test]
    fn extracts_register_with_spaces() {
        let text = "IDT=     ffffffffff528000 00000fff";
        assert_eq!(extract_register(text, "IDT"), Some(0xffffffffff528000));
    }

    #[test]
    fn missing_register_is_none() {
        assert_eq!(extract_register("no registers here", "CR3"), None);
    }

    #[test]
    fn parses_word_dump() {
        let text = "0000000000001000: 0x04030201 0x08070605 0x0c0b0a09 0x100f0e0d\n";
        let bytes = parse_word_dump(text);
        assert_eq!(
            bytes,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );
    }

    #[test]
    fn parses_byte_dump() {
        let text = "0000000000002000: 0x01 0x02 0x03 0x04 0x05 0x06 0x07 0x08\n";
        let bytes = parse_byte_dump(text);
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn finds_last_hex_token() {
        let text = "Physical address 0x0 maps to host virtual 0x7f1234560000\n";
        assert_eq!(find_last_hex_token(text), Some(0x7f1234560000));
    }
}
