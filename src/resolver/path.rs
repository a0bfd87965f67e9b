use std::path::{Path, PathBuf};

/// Prefixes stripped before any I/O.
const EXTENDED_UNC_PREFIXES: [&str; 2] = [r"\\?\UNC\", "//?/UNC/"];
const EXTENDED_PREFIXES: [&str; 2] = [r"\\?\", "//?/"];
const FILE_SCHEME: &str = "file://";

/// Normalizes a raw record path. Returns `None` for empty input.
///
/// Trims whitespace and strips `file://` schemes and Windows
/// extended-length prefixes (`\\?\C:\...` becomes `C:\...`,
/// `\\?\UNC\server\share` becomes `\\server\share`). A path that is not
/// valid UTF-8 is returned unchanged, since none of those forms can apply.
pub fn normalize_path(raw: impl AsRef<Path>) -> Option<PathBuf> {
    let raw = raw.as_ref();
    match raw.to_str() {
        Some(s) => normalize_str(s),
        None => Some(raw.to_path_buf()),
    }
}

fn normalize_str(raw: &str) -> Option<PathBuf> {
    let mut s = raw.trim();
    if let Some(rest) = strip_prefix_ignore_case(s, FILE_SCHEME) {
        s = rest;
        // file:///C:/x keeps the drive letter, file:///home/x keeps the root.
        if has_drive_after_slash(s) {
            s = &s[1..];
        }
    }

    let normalized = if let Some(rest) = EXTENDED_UNC_PREFIXES
        .iter()
        .find_map(|p| strip_prefix_ignore_case(s, p))
    {
        format!(r"\\{}", rest)
    } else if let Some(rest) = EXTENDED_PREFIXES.iter().find_map(|p| s.strip_prefix(p)) {
        rest.to_string()
    } else {
        s.to_string()
    };

    let normalized = normalized.trim();
    if normalized.is_empty() {
        None
    } else {
        Some(PathBuf::from(normalized))
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn has_drive_after_slash(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 3 && b[0] == b'/' && b[1].is_ascii_alphabetic() && b[2] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trims_whitespace() {
        assert_eq!(normalize_path("  /a/b.jpg \n"), Some(PathBuf::from("/a/b.jpg")));
    }

    #[test]
    fn test_empty_paths() {
        assert_eq!(normalize_path(""), None);
        assert_eq!(normalize_path("   "), None);
        assert_eq!(normalize_path(r"\\?\"), None);
    }

    #[test]
    fn test_strips_extended_length_prefix() {
        assert_eq!(
            normalize_path(r"\\?\C:\Pictures\a.png"),
            Some(PathBuf::from(r"C:\Pictures\a.png"))
        );
        assert_eq!(
            normalize_path(r"\\?\UNC\server\share\a.png"),
            Some(PathBuf::from(r"\\server\share\a.png"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_pass_through() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw = Path::new(OsStr::from_bytes(b"/img/caf\xe9.png"));
        assert_eq!(normalize_path(raw), Some(raw.to_path_buf()));
    }

    #[test]
    fn test_strips_file_scheme() {
        assert_eq!(normalize_path("file:///home/u/a.jpg"), Some(PathBuf::from("/home/u/a.jpg")));
        assert_eq!(normalize_path("FILE:///C:/x/a.jpg"), Some(PathBuf::from("C:/x/a.jpg")));
    }
}
