//! Media classification and embedded metadata extraction.
//!
//! Classification works on the file extension first and falls back to a
//! magic-byte sniff of the first bytes. Embedded metadata is read with
//! `kamadak-exif`, only from containers where the EXIF block is located
//! without reading the whole file (JPEG, HEIF, PNG, WebP). Every failure here
//! is non-fatal: callers fall back to filesystem timestamps.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use exif::{In, Tag, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::trace;

use crate::model::MediaType;

/// Placeholder for template fields that cannot be resolved.
pub const UNKNOWN_FIELD: &str = "unknown";

const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jpe", "jfif", "png", "gif", "bmp", "tif", "tiff", "webp", "heic", "heif",
    "avif", "raw", "cr2", "cr3", "crw", "nef", "nrw", "arw", "srf", "sr2", "dng", "orf", "pef",
    "raf", "rw2", "x3f", "3fr", "erf", "kdc", "mrw", "srw",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "mpg", "mpeg", "3gp", "wmv", "flv", "webm", "m4v", "vob", "ogv",
    "mts", "m2ts", "mxf", "insv", "lrv", "360",
];

/// Video extensions also used by text files; the content must agree.
const CONTENT_CHECKED_VIDEO_EXTENSIONS: &[&str] = &["ts"];

/// First byte of every MPEG transport stream packet.
const MPEG_TS_SYNC: u8 = 0x47;

/// Containers kamadak-exif parses incrementally.
const EXIF_CONTAINERS: &[&str] = &["jpg", "jpeg", "jpe", "jfif", "heic", "heif", "avif", "png", "webp"];

/// Capture-time tags in order of preference.
const TIME_TAGS: [Tag; 3] = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime];

/// Classify a file by its extension alone.
pub fn classify_extension(path: &Path) -> Option<MediaType> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Video)
    } else {
        None
    }
}

/// Classify leading file bytes by magic number.
pub fn sniff_bytes(head: &[u8]) -> Option<MediaType> {
    if head.starts_with(&[0xFF, 0xD8, 0xFF])
        || head.starts_with(b"\x89PNG\r\n\x1a\n")
        || head.starts_with(b"II*\0")
        || head.starts_with(b"MM\0*")
        || head.starts_with(b"GIF8")
    {
        return Some(MediaType::Photo);
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" {
        return match &head[8..12] {
            b"WEBP" => Some(MediaType::Photo),
            b"AVI " => Some(MediaType::Video),
            _ => None,
        };
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"heic" | b"heix" | b"mif1" | b"msf1" | b"avif" => Some(MediaType::Photo),
            _ => Some(MediaType::Video),
        };
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(MediaType::Video);
    }
    None
}

/// Classify a file: extension first, then content sniff.
///
/// Unreadable or unrecognised files are `Other`.
pub fn classify(path: &Path) -> MediaType {
    if let Some(kind) = classify_extension(path) {
        return kind;
    }
    let transport_stream = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| CONTENT_CHECKED_VIDEO_EXTENSIONS.contains(&e.as_str()));

    let mut head = [0u8; 16];
    let read = File::open(path).and_then(|mut f| read_up_to(&mut f, &mut head));
    match read {
        Ok(n) if transport_stream && n > 0 && head[0] == MPEG_TS_SYNC => MediaType::Video,
        Ok(n) => sniff_bytes(&head[..n]).unwrap_or(MediaType::Other),
        Err(_) => MediaType::Other,
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Metadata read from an embedded EXIF block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedMetadata {
    pub captured: Option<NaiveDateTime>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens: Option<String>,
}

/// Read embedded metadata, if the container supports cheap EXIF access.
///
/// Returns `None` when the format is unsupported or the file has no EXIF.
pub fn read_embedded(path: &Path) -> Option<EmbeddedMetadata> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    if !EXIF_CONTAINERS.contains(&ext.as_str()) {
        return None;
    }

    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(e) => {
            trace!("No EXIF in {}: {}", path.display(), e);
            return None;
        }
    };

    let captured = TIME_TAGS.iter().find_map(|tag| {
        let field = exif.get_field(*tag, In::PRIMARY)?;
        match &field.value {
            Value::Ascii(values) => values.first().and_then(|raw| parse_exif_datetime(raw)),
            _ => None,
        }
    });

    let text = |tag: Tag| -> Option<String> {
        let field = exif.get_field(tag, In::PRIMARY)?;
        match &field.value {
            Value::Ascii(values) => values
                .first()
                .map(|raw| String::from_utf8_lossy(raw).trim_matches(char::from(0)).trim().to_string())
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    };

    Some(EmbeddedMetadata {
        captured,
        make: text(Tag::Make),
        model: text(Tag::Model),
        lens: text(Tag::LensModel),
    })
}

/// Parse an EXIF `YYYY:MM:DD HH:MM:SS` value.
pub fn parse_exif_datetime(raw: &[u8]) -> Option<NaiveDateTime> {
    let dt = exif::DateTime::from_ascii(raw).ok()?;
    NaiveDate::from_ymd_opt(dt.year.into(), dt.month.into(), dt.day.into())?.and_hms_opt(
        dt.hour.into(),
        dt.minute.into(),
        dt.second.into(),
    )
}

/// Build the template field map of an item.
pub fn build_fields(
    relative_path: &Path,
    captured: NaiveDateTime,
    media_type: MediaType,
    volume_label: &str,
    embedded: Option<&EmbeddedMetadata>,
) -> BTreeMap<String, String> {
    use chrono::Datelike;

    let mut fields = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        if !value.is_empty() {
            fields.insert(key.to_string(), value);
        }
    };

    put("year", format!("{:04}", captured.year()));
    put("month", format!("{:02}", captured.month()));
    put("day", format!("{:02}", captured.day()));
    put("hour", format!("{:02}", captured.hour()));
    put("minute", format!("{:02}", captured.minute()));
    put("date", captured.format("%Y-%m-%d").to_string());
    put("type", media_type.to_string());

    if let Some(name) = relative_path.file_name() {
        put("name", name.to_string_lossy().into_owned());
    }
    if let Some(stem) = relative_path.file_stem() {
        put("stem", stem.to_string_lossy().into_owned());
    }
    if let Some(ext) = relative_path.extension() {
        put("extension", ext.to_string_lossy().to_lowercase());
    }
    if let Some(folder) = relative_path.parent().and_then(|p| p.file_name()) {
        put("folder", folder.to_string_lossy().into_owned());
    }
    put("volume", volume_label.to_string());

    if let Some(meta) = embedded {
        if let Some(make) = &meta.make {
            put("make", make.clone());
        }
        if let Some(model) = &meta.model {
            put("model", model.clone());
        }
        if let Some(lens) = &meta.lens {
            put("lens", lens.clone());
        }
    }

    fields
}
