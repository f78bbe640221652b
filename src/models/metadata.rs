use bytesize::ByteSize;

/// Parses labels such as `"1.1 GB"` or `"529 MiB"` into bytes.
pub fn parse_size_label(label: &str) -> Option<u64> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<ByteSize>().ok().map(|size| size.as_u64())
}

pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

pub fn format_speed(bytes_per_second: f64) -> String {
    if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
        return "0 B/s".into();
    }
    format!("{}/s", format_bytes(bytes_per_second as u64))
}
