use std::fs;
use std::io::Read;
use std::path::Path;

/// Stored inputs and outputs are cut to this many bytes.
pub const TRUNCATE_LIMIT: usize = 500;
pub const TRUNCATED_MARKER: &str = "\n(truncated)";

pub fn gen_random_id(length: u32) -> String {
    (0..length)
        .map(|_| {
            let idx = fastrand::u32(0..36);
            char::from_digit(idx, 36).unwrap_or('0')
        })
        .collect()
}

pub fn truncate_text(content: &[u8]) -> String {
    if content.len() <= TRUNCATE_LIMIT {
        return String::from_utf8_lossy(content).into_owned();
    }
    let mut text = String::from_utf8_lossy(&content[..TRUNCATE_LIMIT]).into_owned();
    text.push_str(TRUNCATED_MARKER);
    text
}

/// Reads at most the truncation limit from `path`. A missing file reads as empty.
pub fn read_truncated(path: &Path) -> std::io::Result<String> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let mut buffer = Vec::with_capacity(TRUNCATE_LIMIT + 1);
    file.take(TRUNCATE_LIMIT as u64 + 1).read_to_end(&mut buffer)?;
    Ok(truncate_text(&buffer))
}

/// Formats a score the way it appears in a simple verdict: `50`, `33.33`.
pub fn format_score(score: f64) -> String {
    let rounded = (score * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        let text = format!("{:.2}", rounded);
        text.trim_end_matches('0').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_use_base36() {
        let id = gen_random_id(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn short_text_is_kept() {
        assert_eq!(truncate_text(b"1 2\n"), "1 2\n");
        assert_eq!(truncate_text(&[b'a'; 500]).len(), 500);
    }

    #[test]
    fn long_text_is_cut_with_marker() {
        let text = truncate_text(&[b'x'; 2000]);
        assert!(text.ends_with("(truncated)"));
        assert_eq!(text.len(), TRUNCATE_LIMIT + TRUNCATED_MARKER.len());
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_truncated(&dir.path().join("nope")).unwrap(), "");
    }

    #[test]
    fn scores_format_compactly() {
        assert_eq!(format_score(100.0), "100");
        assert_eq!(format_score(0.0), "0");
        assert_eq!(format_score(33.3333), "33.33");
        assert_eq!(format_score(12.5), "12.5");
    }
}
