// Media type detection for cached content: magic bytes first, then the file name.

pub const GENERIC_MEDIA_TYPE: &str = "application/octet-stream";

/// Bytes inspected when sniffing content.
pub const SNIFF_LEN: usize = 8192;

const EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", "application/vnd.ms-powerpoint"),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("txt", "text/plain"),
    ("rtf", "application/rtf"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("m4a", "audio/mp4"),
    ("flac", "audio/flac"),
    ("mp4", "video/mp4"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("js", "text/javascript"),
    ("css", "text/css"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("json", "application/json"),
    ("xml", "text/xml"),
    ("csv", "text/csv"),
    ("md", "text/markdown"),
    ("py", "text/x-python"),
    ("c", "text/x-csrc"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("7z", "application/x-7z-compressed"),
    ("bin", GENERIC_MEDIA_TYPE),
];

/// Extensions whose content is never text, even when labelled `text/*`.
const BINARY_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "pdf", "mp3", "wav", "mp4", "avi", "mov", "zip",
    "doc", "docx", "xls", "xlsx", "ppt", "pptx",
];

/// Detect a media type from the leading bytes of a file.
pub fn sniff(header: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"PK\x05\x06", "application/zip"),
        (b"\x1f\x8b\x08", "application/gzip"),
        (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
        (b"OggS", "application/ogg"),
        (b"ID3", "audio/mpeg"),
        (b"fLaC", "audio/flac"),
        (b"\x1a\x45\xdf\xa3", "video/webm"),
    ];

    if header.is_empty() {
        return None;
    }
    if let Some((_, media_type)) = SIGNATURES.iter().find(|(sig, _)| header.starts_with(sig)) {
        return Some(*media_type);
    }

    // RIFF containers: bytes 8..12 name the format.
    if header.len() >= 12 && &header[0..4] == b"RIFF" {
        match &header[8..12] {
            b"WEBP" => return Some("image/webp"),
            b"WAVE" => return Some("audio/wav"),
            b"AVI " => return Some("video/x-msvideo"),
            _ => {}
        }
    }

    // ISO BMFF: bytes 4..8 == "ftyp"
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        return Some(match &header[8..12] {
            b"qt  " => "video/quicktime",
            b"M4A " => "audio/mp4",
            _ => "video/mp4",
        });
    }

    looks_like_text(header).then_some("text/plain")
}

fn looks_like_text(sample: &[u8]) -> bool {
    let sample = &sample[..sample.len().min(SNIFF_LEN)];
    if std::str::from_utf8(sample).is_ok() {
        return !sample.contains(&0);
    }
    let binary = sample
        .iter()
        .filter(|&&b| !matches!(b, 7..=10 | 12 | 13 | 27 | 32..=126))
        .count();
    binary * 10 < sample.len()
}

fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Infer a media type from a file name's extension.
pub fn from_extension(name: &str) -> Option<&'static str> {
    let ext = extension_of(name)?;
    EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, media_type)| *media_type)
}

/// Preferred extension (with the dot) for a media type, `.bin` when unknown.
///
/// The first matching row of the extension table wins, so `image/jpeg` maps to `.jpg`.
pub fn extension_for(media_type: &str) -> String {
    let ext = match media_type {
        "application/ogg" => "ogg",
        other => EXTENSIONS
            .iter()
            .find(|(_, m)| *m == other)
            .map(|(e, _)| *e)
            .unwrap_or("bin"),
    };
    format!(".{}", ext)
}

pub fn is_generic(media_type: &str) -> bool {
    let trimmed = media_type.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(GENERIC_MEDIA_TYPE)
}

/// Whether a declared media type should be replaced by a better guess.
///
/// Generic types are always replaced. A `text/*` label on a file whose name
/// has a known binary extension is replaced as well.
pub fn should_correct(declared: &str, name: Option<&str>) -> bool {
    if is_generic(declared) {
        return true;
    }
    let binary_name = name
        .and_then(extension_of)
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.as_str()));
    binary_name && declared.starts_with("text/")
}

/// Settle the media type of newly ingested bytes.
pub fn resolve(declared: Option<&str>, name: Option<&str>, header: &[u8]) -> String {
    if let Some(declared) = declared {
        if !should_correct(declared, name) {
            return declared.trim().to_string();
        }
    }
    sniff(header)
        .or_else(|| name.and_then(from_extension))
        .unwrap_or(GENERIC_MEDIA_TYPE)
        .to_string()
}

/// Replacement for a media type in an outgoing reference, or `None` to keep it.
pub fn corrected(current: Option<&str>, known: &str, name: Option<&str>) -> Option<String> {
    match current {
        Some(current) if current == known => None,
        Some(current) if !should_correct(current, name) => None,
        _ if is_generic(known) => None,
        _ => Some(known.to_string()),
    }
}

/// Display name for content ingested without one: `file_<fp8><ext>`.
pub fn fallback_name(fingerprint: &str, media_type: &str) -> String {
    let short = fingerprint.get(..8).unwrap_or(fingerprint);
    format!("file_{}{}", short, extension_for(media_type))
}

/// Strip any directory components from a caller-supplied file name.
pub fn normalize_name(name: Option<&str>) -> Option<String> {
    let base = name?.rsplit(['/', '\\']).next()?.trim();
    (!base.is_empty()).then(|| base.to_string())
}
