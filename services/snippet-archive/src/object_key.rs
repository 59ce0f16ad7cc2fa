use crate::config::KeyStrategy;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Derive the object key for an uploaded file.
///
/// Client-supplied names never reach the bucket verbatim: the generated
/// strategy only keeps a sanitized extension, and the file-name strategy
/// replaces everything outside `[A-Za-z0-9._-]`.
///
/// Key formats:
/// - `Generated`: `snippets/{yyyy}/{mm}/{dd}/{uuid}.{ext}`
/// - `FileName`: `{sanitized_name}`
pub fn object_key(
    strategy: KeyStrategy,
    file_name: &str,
    content_type: &str,
    now: DateTime<Utc>,
) -> String {
    let extension = file_extension(file_name)
        .or_else(|| extension_for_content_type(content_type).map(str::to_string));

    match strategy {
        KeyStrategy::Generated => {
            let id = Uuid::new_v4();
            match extension {
                Some(ext) => format!("snippets/{}/{}.{}", now.format("%Y/%m/%d"), id, ext),
                None => format!("snippets/{}/{}", now.format("%Y/%m/%d"), id),
            }
        }
        KeyStrategy::FileName => {
            let name = sanitize_file_name(file_name);
            if name.is_empty() {
                // Nothing usable survived sanitization
                object_key(KeyStrategy::Generated, file_name, content_type, now)
            } else {
                name
            }
        }
    }
}

/// Sanitize a file name so it is a single, non-hidden key segment
pub fn sanitize_file_name(name: &str) -> String {
    // Browsers on Windows may still send a full path
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let sanitized: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    sanitized.trim_start_matches('.').to_string()
}

/// Lowercased alphanumeric extension of a file name
fn file_extension(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 10 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/bmp" => Some("bmp"),
        "image/svg+xml" => Some("svg"),
        _ => None,
    }
}

/// Content type for a file name when the client did not declare one
pub fn content_type_for(file_name: &str) -> &'static str {
    match file_extension(file_name).as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
    }

    #[test]
    fn test_generated_key_is_partitioned_by_date() {
        let key = object_key(KeyStrategy::Generated, "My Snippet.PNG", "image/png", now());

        assert!(key.starts_with("snippets/2024/01/15/"));
        assert!(key.ends_with(".png"));
        let id = key
            .trim_start_matches("snippets/2024/01/15/")
            .trim_end_matches(".png");
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_generated_keys_do_not_collide() {
        let a = object_key(KeyStrategy::Generated, "a.png", "image/png", now());
        let b = object_key(KeyStrategy::Generated, "a.png", "image/png", now());
        assert_ne!(a, b);
    }

    #[test]
    fn test_generated_key_falls_back_to_content_type() {
        let key = object_key(KeyStrategy::Generated, "snippet", "image/jpeg", now());
        assert!(key.ends_with(".jpg"));

        let key = object_key(KeyStrategy::Generated, "snippet", "text/plain", now());
        assert!(!key.contains('.'));
    }

    #[test]
    fn test_file_name_key_keeps_plain_names() {
        assert_eq!(
            object_key(KeyStrategy::FileName, "a.png", "image/png", now()),
            "a.png"
        );
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\shot.png"), "shot.png");
        assert_eq!(sanitize_file_name("hello world?.png"), "hello_world_.png");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(".."), "");
    }

    #[test]
    fn test_file_name_key_never_empty() {
        let key = object_key(KeyStrategy::FileName, "..", "image/png", now());
        assert!(key.starts_with("snippets/2024/01/15/"));
    }

    #[test]
    fn test_file_extension_rejects_odd_suffixes() {
        assert_eq!(file_extension("a.tar.GZ"), Some("gz".to_string()));
        assert_eq!(file_extension(".bashrc"), None);
        assert_eq!(file_extension("a.p%ng"), None);
        assert_eq!(file_extension("noext"), None);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.unknown"), "application/octet-stream");
    }
}
