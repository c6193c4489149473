//! Body decoding and markup cleanup.
//!
//! Detection order: BOM, declared transport charset, `<meta>` charset in the
//! first 4096 bytes, then a fixed ladder of strict decodes (UTF-8, Shift_JIS,
//! EUC-JP). A weak transport charset (ISO-8859-1 / ASCII, usually a server
//! default) is only tried after the ladder. Lossy UTF-8 is the last resort.

use std::sync::LazyLock;

use encoding_rs::{DecoderResult, EUC_JP, Encoding, SHIFT_JIS, UTF_8};
use regex::Regex;
use tracing::debug;

/// How much of the body is scanned for a `<meta>` charset.
const META_SCAN_BYTES: usize = 4096;

/// Encodings tried, in order, when nothing declared works.
fn fallback_ladder() -> [&'static Encoding; 3] {
    [UTF_8, SHIFT_JIS, EUC_JP]
}

/// Labels that servers send by default and that say little about the body.
const WEAK_LABELS: &[&str] = &["iso-8859-1", "latin1", "latin-1", "us-ascii", "ascii"];

static META_CHARSET: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r#"(?i)<meta[^>]+charset=["']?([a-z0-9_-]+)"#).expect("valid regex")
});

static META_CONTENT_CHARSET: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r#"(?i)content=["'][^"']*charset=([a-z0-9_-]+)"#)
        .expect("valid regex")
});

static XML_PROLOG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\?xml[^>]*\?>").expect("valid regex"));

static DOCTYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<!DOCTYPE[^>]*>").expect("valid regex"));

/// Extract the `charset` parameter of a `Content-Type` header value.
pub fn charset_from_content_type(header: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Charset declared by a `<meta>` tag near the top of the document.
fn meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(META_SCAN_BYTES)];
    let caps = META_CHARSET
        .captures(head)
        .or_else(|| META_CONTENT_CHARSET.captures(head))?;
    Encoding::for_label(caps.get(1)?.as_bytes())
}

/// Decode without replacement. `complete` is false for truncated bodies so
/// a multi-byte sequence cut at the end is not counted as malformed.
fn strict_decode(encoding: &'static Encoding, bytes: &[u8], complete: bool) -> Option<String> {
    let mut decoder = encoding.new_decoder_without_bom_handling();
    let capacity = decoder.max_utf8_buffer_length_without_replacement(bytes.len())?;
    let mut out = String::with_capacity(capacity);
    let (result, _read) = decoder.decode_to_string_without_replacement(bytes, &mut out, complete);
    matches!(result, DecoderResult::InputEmpty).then_some(out)
}

/// Turn a response body into text.
pub fn decode_body(bytes: &[u8], transport_charset: Option<&str>, truncated: bool) -> String {
    let complete = !truncated;

    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        if let Some(text) = strict_decode(encoding, &bytes[bom_len..], complete) {
            debug!(encoding = encoding.name(), "decoded via BOM");
            return text;
        }
    }

    let (strong, weak) = match transport_charset {
        Some(label) if WEAK_LABELS.contains(&label.to_ascii_lowercase().as_str()) => {
            (None, Encoding::for_label(label.as_bytes()))
        }
        Some(label) => (Encoding::for_label(label.as_bytes()), None),
        None => (None, None),
    };

    let candidates = strong
        .into_iter()
        .chain(meta_charset(bytes))
        .chain(fallback_ladder())
        .chain(weak);

    for encoding in candidates {
        if let Some(text) = strict_decode(encoding, bytes, complete) {
            debug!(encoding = encoding.name(), "decoded body");
            return text;
        }
    }

    debug!("no encoding decoded cleanly; using lossy UTF-8");
    UTF_8.decode_without_bom_handling(bytes).0.into_owned()
}

/// Drop the first XML prolog and DOCTYPE, which trip up lenient parsing.
pub fn clean_markup(text: &str) -> String {
    let text = XML_PROLOG.replace(text, "");
    DOCTYPE.replace(&text, "").into_owned()
}
