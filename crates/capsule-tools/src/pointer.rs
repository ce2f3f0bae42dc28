//! Evidence pointer codec.
//!
//! A pointer names one versioned evidence fragment:
//! `ev://<collection>/<doc>#<fragment>?v=<hash>`, each part percent-encoded.

use std::sync::OnceLock;

use capsule_core::error::{CapsuleError, Result};

pub const SCHEME: &str = "ev://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub collection: String,
    pub doc: String,
    pub fragment: String,
    /// Empty when the pointer carries no `v=` parameter.
    pub version: String,
}

pub fn encode_pointer(collection: &str, doc: &str, fragment: &str, hash: &str) -> String {
    format!(
        "{}{}/{}#{}?v={}",
        SCHEME,
        urlencoding::encode(collection),
        urlencoding::encode(doc),
        urlencoding::encode(fragment),
        urlencoding::encode(hash)
    )
}

pub fn parse_pointer(raw: &str) -> Result<Pointer> {
    let rest = raw
        .strip_prefix(SCHEME)
        .ok_or_else(|| bad(raw, "missing ev:// scheme"))?;

    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, q),
        None => (rest, ""),
    };
    let (collection, doc_frag) = path
        .split_once('/')
        .ok_or_else(|| bad(raw, "missing document segment"))?;
    let (doc, fragment) = match doc_frag.split_once('#') {
        Some((d, f)) => (d, f),
        None => (doc_frag, ""),
    };
    if collection.is_empty() || doc.is_empty() {
        return Err(bad(raw, "empty collection or document"));
    }

    let version = query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == "v")
        .map(|(_, v)| v)
        .unwrap_or("");

    Ok(Pointer {
        collection: decode(raw, collection)?,
        doc: decode(raw, doc)?,
        fragment: decode(raw, fragment)?,
        version: decode(raw, version)?,
    })
}

/// Pointer-shaped tokens (`ev://…`) in free text, in order of appearance.
pub fn scan_pointers(text: &str) -> Vec<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"ev://[^\s\]\)]+").expect("static pointer pattern")
    });
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
        .collect()
}

/// `[ref:ev://…]` citation markers in a rendered draft.
pub fn scan_ref_markers(text: &str) -> Vec<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"\[ref:(ev://[^\]\s]+)\]").expect("static ref pattern")
    });
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn decode(raw: &str, part: &str) -> Result<String> {
    urlencoding::decode(part)
        .map(|s| s.into_owned())
        .map_err(|_| bad(raw, "invalid percent-encoding"))
}

fn bad(raw: &str, reason: &str) -> CapsuleError {
    CapsuleError::ToolValidation(format!("bad pointer '{}': {}", raw, reason))
}
