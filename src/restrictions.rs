//! Per-file and aggregate restriction checks.
//!
//! Per-file failures exclude a single file; aggregate failures invalidate the
//! whole incoming batch. The minimum file count is only checked when an
//! upload starts.

use crate::error::{RestrictionError, RestrictionKind};
use crate::state::{FileMap, FileRecord};
use serde::{Deserialize, Serialize};

/// Configured constraints. `None` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Restrictions {
    pub max_file_size: Option<u64>,
    pub min_file_size: Option<u64>,
    pub max_total_file_size: Option<u64>,
    pub max_number_of_files: Option<usize>,
    pub min_number_of_files: Option<usize>,
    /// Exact MIME types, wildcards like `image/*`, or extensions like `.pdf`
    pub allowed_file_types: Option<Vec<String>>,
    pub required_meta_fields: Option<Vec<String>>,
}

impl Restrictions {
    /// Shallow merge; fields set in `patch` win
    pub fn merge(&mut self, patch: Restrictions) {
        if patch.max_file_size.is_some() {
            self.max_file_size = patch.max_file_size;
        }
        if patch.min_file_size.is_some() {
            self.min_file_size = patch.min_file_size;
        }
        if patch.max_total_file_size.is_some() {
            self.max_total_file_size = patch.max_total_file_size;
        }
        if patch.max_number_of_files.is_some() {
            self.max_number_of_files = patch.max_number_of_files;
        }
        if patch.min_number_of_files.is_some() {
            self.min_number_of_files = patch.min_number_of_files;
        }
        if patch.allowed_file_types.is_some() {
            self.allowed_file_types = patch.allowed_file_types;
        }
        if patch.required_meta_fields.is_some() {
            self.required_meta_fields = patch.required_meta_fields;
        }
    }
}

/// Outcome of a required-metadata check
#[derive(Debug, Clone, PartialEq)]
pub struct MissingMetaFields {
    pub missing_fields: Vec<String>,
    pub error: RestrictionError,
}

#[derive(Debug, Clone, Default)]
pub struct Restricter {
    restrictions: Restrictions,
}

impl Restricter {
    pub fn new(restrictions: Restrictions) -> Self {
        Self { restrictions }
    }

    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    /// Size bounds and allowed-type membership for one file
    pub fn validate_single_file(&self, file: &FileRecord) -> Result<(), RestrictionError> {
        let r = &self.restrictions;

        if let Some(allowed) = r.allowed_file_types.as_ref().filter(|t| !t.is_empty()) {
            if !allowed.iter().any(|pattern| type_matches(file, pattern)) {
                return Err(RestrictionError::new(
                    RestrictionKind::FileType,
                    format!("You can only upload: {}", allowed.join(", ")),
                )
                .for_file(&file.id, &file.name));
            }
        }

        if let (Some(max), Some(size)) = (r.max_file_size, file.size) {
            if size > max {
                return Err(RestrictionError::new(
                    RestrictionKind::MaxFileSize,
                    format!(
                        "{} exceeds maximum allowed size of {}",
                        file.name,
                        format_bytes(max)
                    ),
                )
                .for_file(&file.id, &file.name));
            }
        }

        if let (Some(min), Some(size)) = (r.min_file_size, file.size) {
            if size < min {
                return Err(RestrictionError::new(
                    RestrictionKind::MinFileSize,
                    format!(
                        "This file is smaller than the allowed size of {}",
                        format_bytes(min)
                    ),
                )
                .for_file(&file.id, &file.name));
            }
        }

        Ok(())
    }

    /// File count and combined size across existing and incoming files
    pub fn validate_aggregate<'a, I>(
        &self,
        existing: I,
        adding: &[FileRecord],
    ) -> Result<(), RestrictionError>
    where
        I: IntoIterator<Item = &'a FileRecord>,
    {
        let r = &self.restrictions;
        let existing: Vec<&FileRecord> = existing.into_iter().collect();

        if let Some(max_files) = r.max_number_of_files {
            let non_ghost = existing.iter().filter(|f| !f.is_ghost).count();
            if non_ghost + adding.len() > max_files {
                return Err(RestrictionError::new(
                    RestrictionKind::MaxNumberOfFiles,
                    format!("You can only upload {} {}", max_files, plural(max_files)),
                ));
            }
        }

        if let Some(max_total) = r.max_total_file_size {
            let mut total: u64 = existing.iter().filter_map(|f| f.size).sum();
            for file in adding {
                if let Some(size) = file.size {
                    total = total.saturating_add(size);
                    if total > max_total {
                        return Err(RestrictionError::new(
                            RestrictionKind::MaxTotalFileSize,
                            format!(
                                "You selected {} of files, but maximum allowed size is {}",
                                format_bytes(total),
                                format_bytes(max_total)
                            ),
                        )
                        .for_file(&file.id, &file.name));
                    }
                }
            }
        }

        Ok(())
    }

    /// Checked at upload start, never at add time
    pub fn validate_min_number_of_files(&self, files: &FileMap) -> Result<(), RestrictionError> {
        if let Some(min) = self.restrictions.min_number_of_files {
            if files.len() < min {
                return Err(RestrictionError::new(
                    RestrictionKind::MinNumberOfFiles,
                    format!("You have to select at least {} {}", min, plural(min)),
                ));
            }
        }
        Ok(())
    }

    /// A field is missing when the key is absent or its value is the empty string
    pub fn get_missing_required_meta_fields(&self, file: &FileRecord) -> MissingMetaFields {
        let missing_fields: Vec<String> = self
            .restrictions
            .required_meta_fields
            .iter()
            .flatten()
            .filter(|key| match file.meta.get(key.as_str()) {
                None => true,
                Some(serde_json::Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .cloned()
            .collect();

        let error = RestrictionError::new(
            RestrictionKind::MissingRequiredMeta {
                fields: missing_fields.clone(),
            },
            format!("Missing required meta fields in {}", file.name),
        )
        .for_file(&file.id, &file.name);

        MissingMetaFields {
            missing_fields,
            error,
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        "file"
    } else {
        "files"
    }
}

fn type_matches(file: &FileRecord, pattern: &str) -> bool {
    if pattern.contains('/') {
        if file.mime_type.is_empty() {
            return false;
        }
        // drop parameters such as "; charset=utf-8"
        let mime = file
            .mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let pattern = pattern.to_ascii_lowercase();
        return match pattern.strip_suffix('*') {
            Some(prefix) => mime.starts_with(prefix),
            None => mime == pattern,
        };
    }

    if let Some(ext) = pattern.strip_prefix('.') {
        return !file.extension.is_empty() && file.extension.eq_ignore_ascii_case(ext);
    }

    false
}

/// Human readable size in binary units, e.g. "1.5 MB"
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut exponent = 0usize;
    let mut value = bytes as f64;
    while value >= 1024.0 && exponent < UNITS.len() - 1 {
        value /= 1024.0;
        exponent += 1;
    }

    if value >= 10.0 || exponent == 0 {
        format!("{} {}", value.round(), UNITS[exponent])
    } else {
        let rounded = (value * 10.0).round() / 10.0;
        if rounded.fract() == 0.0 {
            format!("{} {}", rounded, UNITS[exponent])
        } else {
            format!("{:.1} {}", rounded, UNITS[exponent])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FileProgress, Meta};

    fn file(name: &str, mime: &str, size: Option<u64>) -> FileRecord {
        let extension = name.rsplit_once('.').map(|(_, e)| e.to_string()).unwrap_or_default();
        FileRecord {
            id: format!("id-{}", name),
            name: name.to_string(),
            extension,
            mime_type: mime.to_string(),
            size,
            source: String::new(),
            meta: Meta::new(),
            data: None,
            progress: FileProgress::not_started(size),
            is_remote: false,
            remote: None,
            is_ghost: false,
            is_paused: false,
            error: None,
            upload_url: None,
            response: None,
            relative_path: None,
            missing_required_meta_fields: Vec::new(),
        }
    }

    fn restricter(r: Restrictions) -> Restricter {
        Restricter::new(r)
    }

    #[test]
    fn test_allowed_types_wildcard_exact_and_extension() {
        let r = restricter(Restrictions {
            allowed_file_types: Some(vec!["image/*".into(), "application/pdf".into(), ".TXT".into()]),
            ..Default::default()
        });

        assert!(r.validate_single_file(&file("a.png", "image/png", Some(1))).is_ok());
        assert!(r.validate_single_file(&file("a.pdf", "application/pdf", Some(1))).is_ok());
        assert!(r.validate_single_file(&file("notes.txt", "", Some(1))).is_ok());
        assert!(r
            .validate_single_file(&file("a.jpg", "image/jpeg; charset=binary", Some(1)))
            .is_ok());

        let err = r
            .validate_single_file(&file("a.mp4", "video/mp4", Some(1)))
            .unwrap_err();
        assert_eq!(err.kind, RestrictionKind::FileType);
        assert_eq!(err.message, "You can only upload: image/*, application/pdf, .TXT");
        assert_eq!(err.file_id.as_deref(), Some("id-a.mp4"));
    }

    #[test]
    fn test_size_bounds_skip_unknown_size() {
        let r = restricter(Restrictions {
            max_file_size: Some(1024),
            min_file_size: Some(10),
            ..Default::default()
        });

        let err = r.validate_single_file(&file("big.bin", "", Some(2048))).unwrap_err();
        assert_eq!(err.message, "big.bin exceeds maximum allowed size of 1 KB");

        let err = r.validate_single_file(&file("tiny.bin", "", Some(1))).unwrap_err();
        assert_eq!(err.kind, RestrictionKind::MinFileSize);

        assert!(r.validate_single_file(&file("stream.bin", "", None)).is_ok());
    }

    #[test]
    fn test_aggregate_count_ignores_ghosts() {
        let r = restricter(Restrictions {
            max_number_of_files: Some(2),
            ..Default::default()
        });
        let mut ghost = file("ghost.txt", "text/plain", Some(1));
        ghost.is_ghost = true;
        let existing = [file("one.txt", "text/plain", Some(1)), ghost];

        assert!(r
            .validate_aggregate(existing.iter(), &[file("two.txt", "text/plain", Some(1))])
            .is_ok());

        let err = r
            .validate_aggregate(
                existing.iter(),
                &[file("two.txt", "", Some(1)), file("three.txt", "", Some(1))],
            )
            .unwrap_err();
        assert_eq!(err.message, "You can only upload 2 files");
        assert!(err.is_aggregate());
    }

    #[test]
    fn test_aggregate_total_size() {
        let r = restricter(Restrictions {
            max_total_file_size: Some(100),
            ..Default::default()
        });
        let existing = [file("a", "", Some(60))];

        let err = r
            .validate_aggregate(existing.iter(), &[file("b", "", None), file("c", "", Some(50))])
            .unwrap_err();
        assert_eq!(err.kind, RestrictionKind::MaxTotalFileSize);
        assert_eq!(err.file_name.as_deref(), Some("c"));
    }

    #[test]
    fn test_min_number_of_files() {
        let r = restricter(Restrictions {
            min_number_of_files: Some(1),
            ..Default::default()
        });
        let err = r.validate_min_number_of_files(&FileMap::new()).unwrap_err();
        assert_eq!(err.message, "You have to select at least 1 file");
    }

    #[test]
    fn test_missing_required_meta_fields() {
        let r = restricter(Restrictions {
            required_meta_fields: Some(vec!["caption".into(), "license".into(), "author".into()]),
            ..Default::default()
        });
        let mut f = file("photo.jpg", "image/jpeg", Some(5));
        f.meta.insert("caption".into(), serde_json::json!(""));
        f.meta.insert("license".into(), serde_json::json!("CC-BY"));

        let missing = r.get_missing_required_meta_fields(&f);
        assert_eq!(missing.missing_fields, vec!["caption", "author"]);
        assert_eq!(missing.error.message, "Missing required meta fields in photo.jpg");
    }

    #[test]
    fn test_merge_keeps_unpatched_fields() {
        let mut r = Restrictions {
            max_file_size: Some(10),
            max_number_of_files: Some(3),
            ..Default::default()
        };
        r.merge(Restrictions {
            max_number_of_files: Some(5),
            ..Default::default()
        });
        assert_eq!(r.max_file_size, Some(10));
        assert_eq!(r.max_number_of_files, Some(5));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1000), "1000 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10 MB");
    }
}
