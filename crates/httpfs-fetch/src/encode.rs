//! URL assembly for remote file paths.

/// Join a base URL and a file path, percent-encoding the path.
///
/// Alphanumerics plus `_`, `.` and `/` pass through; every other byte is
/// escaped as `%XX`. The base is assumed to be pre-encoded.
pub fn encode_url(base: &str, path: &str) -> String {
    let mut url = String::with_capacity(base.len() + path.len());
    url.push_str(base);
    if !path.starts_with('/') {
        url.push('/');
    }
    for &b in path.as_bytes() {
        if needs_escape(b) {
            url.push('%');
            url.push_str(&format!("{:02X}", b));
        } else {
            url.push(b as char);
        }
    }
    url
}

fn needs_escape(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'/')
}
