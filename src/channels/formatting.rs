//! Small text helpers for the Telegram channel: HTML escaping, filename
//! sanitation, and human-readable sizes/durations for status messages.

pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Strip path separators, null bytes and traversal sequences from a declared
/// filename, and cap its length while preserving the extension.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && *c != '\0')
        .collect();
    let sanitized = sanitized.replace("..", "");
    let sanitized = sanitized.trim().to_string();
    let sanitized = if sanitized.is_empty() {
        "download".to_string()
    } else {
        sanitized
    };
    if sanitized.len() <= 200 {
        sanitized
    } else if let Some(dot_pos) = sanitized.rfind('.') {
        let ext = &sanitized[dot_pos..];
        if ext.len() < 20 {
            let stem_len = 200 - ext.len();
            format!("{}{}", &sanitized[..stem_len], ext)
        } else {
            sanitized[..200].to_string()
        }
    } else {
        sanitized[..200].to_string()
    }
}

/// "5.00 GB", "12.3 MB", "812 KB", "64 B".
pub(crate) fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.0} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// "1h 4m 9s", "2m 30s", "45s".
pub(crate) fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_entities() {
        assert_eq!(html_escape("<a & b>"), "&lt;a &amp; b&gt;");
    }

    #[test]
    fn sanitize_strips_separators_and_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("a/b\\c.mkv"), "abc.mkv");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("movie.mkv"), "movie.mkv");
    }

    #[test]
    fn sanitize_preserves_extension_when_capping() {
        let long = format!("{}.mkv", "x".repeat(300));
        let out = sanitize_filename(&long);
        assert_eq!(out.len(), 200);
        assert!(out.ends_with(".mkv"));
    }

    #[test]
    fn sizes_pick_a_sensible_unit() {
        assert_eq!(format_size(64), "64 B");
        assert_eq!(format_size(812 * 1024), "812 KB");
        assert_eq!(format_size(5_000_000_000), "4.66 GB");
    }

    #[test]
    fn durations_drop_leading_zero_units() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(150), "2m 30s");
        assert_eq!(format_duration(3849), "1h 4m 9s");
    }
}
