/// Longest identifier accepted for a resumable upload session.
pub const MAX_UPLOAD_ID_LEN: usize = 128;

/// Upload identifiers double as temp file names, so they are limited to
/// ASCII alphanumerics, `-` and `_`.
pub fn is_valid_upload_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_UPLOAD_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Strips client-side directories and characters that are unsafe in a
/// filename. Browsers on Windows used to send the full local path.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    }
}

/// Turns a filename into a URL-safe object name: lower case, runs of
/// anything outside `[a-z0-9._]` collapsed to a single `-`.
pub fn normalize_object_name(filename: &str) -> String {
    let mut name = String::with_capacity(filename.len());
    let mut last_dash = true;

    for c in sanitize_filename(filename).chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            name.push(c);
            last_dash = false;
        } else if !last_dash {
            name.push('-');
            last_dash = true;
        }
    }

    let name = name.trim_matches(|c| c == '-' || c == '.');
    if name.is_empty() {
        "file".to_string()
    } else {
        name.to_string()
    }
}

/// First name derived from `base` that `taken` does not report as used:
/// `photo.png`, `photo-1.png`, `photo-2.png`, ...
pub fn choose_unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }

    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => (&base[..idx], &base[idx..]),
        _ => (base, ""),
    };

    (1..)
        .map(|n| format!("{stem}-{n}{ext}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// MIME type guessed from the filename extension, or an empty string.
pub fn guess_content_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_default()
}
