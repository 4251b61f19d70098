//! Stable file identity.
//!
//! The id is a pure function of the descriptor, so re-selecting the same file
//! after a reload yields the id of its restored ghost record.

use sha2::{Digest, Sha256};

/// Inputs that determine a file's identity
#[derive(Debug, Clone, Copy)]
pub struct IdentityParts<'a> {
    pub instance_id: &'a str,
    pub name: &'a str,
    pub mime_type: &'a str,
    pub relative_path: Option<&'a str>,
    pub size: Option<u64>,
    pub last_modified: Option<i64>,
    pub source: &'a str,
}

/// `<instance>-<slug>-<12 hex chars of sha256>`
pub fn generate_file_id(parts: &IdentityParts<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.name.to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(parts.mime_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(parts.relative_path.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    if let Some(size) = parts.size {
        hasher.update(size.to_le_bytes());
    }
    hasher.update([0u8]);
    if let Some(modified) = parts.last_modified {
        hasher.update(modified.to_le_bytes());
    }
    hasher.update([0u8]);
    hasher.update(parts.source.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}-{}-{}", parts.instance_id, slug(parts.name), &digest[..12])
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("file");
    }
    out.truncate(40);
    out
}
