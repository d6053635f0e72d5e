use std::fmt::Write;

/// Renders a datagram as hex plus printable ASCII, 16 bytes per line, for
///  diagnosing malformed packets in log output.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for chunk in data.chunks(16) {
        for b in chunk {
            let _ = write!(out, "{:02x} ", b);
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("| ");
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}
