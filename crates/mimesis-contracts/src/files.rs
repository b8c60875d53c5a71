use std::fmt;

use serde::{Deserialize, Serialize};

pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const ACCEPTED_MIME_TYPES: [&str; 3] = ["image/png", "image/jpeg", "application/x-figma"];
pub const DESIGN_FILE_MIME: &str = "application/x-figma";
pub const DESIGN_FILE_SUFFIX: &str = ".fig";

/// What the picker hands us before any bytes are read. MIME is optional
/// because pickers report design files inconsistently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCandidate {
    pub name: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadRejection {
    TooLarge { size_bytes: u64 },
    UnsupportedType { mime_type: Option<String> },
}

impl fmt::Display for UploadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadRejection::TooLarge { .. } => {
                write!(f, "File is too large. Maximum size is 10MB.")
            }
            UploadRejection::UnsupportedType { .. } => {
                write!(f, "Invalid file type. Please upload a PNG, JPG, or FIG file.")
            }
        }
    }
}

pub fn validate_candidate(candidate: &FileCandidate) -> Result<(), UploadRejection> {
    if candidate.size_bytes > MAX_UPLOAD_BYTES {
        return Err(UploadRejection::TooLarge {
            size_bytes: candidate.size_bytes,
        });
    }

    let mime_allowed = candidate
        .mime_type
        .as_deref()
        .map(|mime| ACCEPTED_MIME_TYPES.contains(&mime))
        .unwrap_or(false);
    // .fig extension fallback: pickers often omit or mangle the design MIME.
    let is_design_file = candidate
        .name
        .to_ascii_lowercase()
        .ends_with(DESIGN_FILE_SUFFIX);
    if !mime_allowed && !is_design_file {
        return Err(UploadRejection::UnsupportedType {
            mime_type: candidate.mime_type.clone(),
        });
    }

    Ok(())
}

pub fn mime_for_file_name(name: &str) -> Option<&'static str> {
    let lowered = name.to_ascii_lowercase();
    let extension = lowered.rsplit_once('.').map(|(_, ext)| ext)?;
    match extension {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "fig" => Some(DESIGN_FILE_MIME),
        _ => None,
    }
}

pub fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}
