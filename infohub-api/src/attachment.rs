use uuid::Uuid;

use crate::{Error, PostId, Time, UserId};

pub const MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;
pub const MAX_PHOTO_SIZE: u64 = 20 * 1024 * 1024;
pub const MAX_FILES_PER_POST: usize = 3;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", // images
    ".mp4", ".avi", ".mov", ".webm", // videos
    ".mp3", ".wav", ".ogg", // audio
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".txt", ".csv", // documents
];

pub const PHOTO_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "image/gif",
];

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AttachmentId(pub Uuid);

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub owner_id: UserId,
    pub post_id: PostId,
    /// Where the file is served from, `/uploads/<stored name>`
    pub file_url: String,
    /// Name the file was uploaded with
    pub file_name: String,
    pub file_type: String,
    pub file_size: Option<i64>,
    pub created_at: Time,
}

/// Lowercased extension of `name`, including the leading dot
pub fn file_extension(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(i) if i + 1 == name.len() => None,
        Some(i) => Some(name[i..].to_lowercase()),
    }
}

/// Checks an upload against the attachment rules, in the order the client
/// expects them to be reported. Returns the extension the file should be
/// stored under.
pub fn check_upload(name: &str, size: u64, existing: usize) -> Result<String, Error> {
    crate::validate_string(name)?;
    if size > MAX_FILE_SIZE {
        return Err(Error::FileTooLarge {
            limit: MAX_FILE_SIZE,
        });
    }
    let ext = file_extension(name)
        .filter(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| Error::InvalidFileType(String::from(name)))?;
    if existing >= MAX_FILES_PER_POST {
        return Err(Error::AttachmentLimitReached(MAX_FILES_PER_POST));
    }
    Ok(ext)
}

pub fn check_photo(content_type: &str, size: u64) -> Result<(), Error> {
    if size > MAX_PHOTO_SIZE {
        return Err(Error::FileTooLarge {
            limit: MAX_PHOTO_SIZE,
        });
    }
    if !PHOTO_CONTENT_TYPES.contains(&content_type.to_lowercase().as_str()) {
        return Err(Error::InvalidFileType(String::from(content_type)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions() {
        assert_eq!(file_extension("report.PDF").as_deref(), Some(".pdf"));
        assert_eq!(file_extension("archive.tar.gz").as_deref(), Some(".gz"));
        assert_eq!(file_extension("C:\\Users\\me\\pic.Jpeg").as_deref(), Some(".jpeg"));
        assert_eq!(file_extension("dir.d/README"), None);
        assert_eq!(file_extension(".bashrc"), None);
        assert_eq!(file_extension("trailing."), None);
        assert_eq!(file_extension(""), None);
    }

    #[test]
    fn upload_rules_apply_in_order() {
        assert_eq!(check_upload("diagram.SVG", 10, 0).unwrap(), ".svg");
        assert_eq!(check_upload("notes.txt", MAX_FILE_SIZE, 2).unwrap(), ".txt");
        assert_eq!(
            check_upload("script.exe", MAX_FILE_SIZE + 1, 3),
            Err(Error::FileTooLarge {
                limit: MAX_FILE_SIZE
            })
        );
        assert_eq!(
            check_upload("script.exe", 10, 3),
            Err(Error::InvalidFileType(String::from("script.exe")))
        );
        assert_eq!(
            check_upload("slides.pdf", 10, 3),
            Err(Error::AttachmentLimitReached(MAX_FILES_PER_POST))
        );
    }

    #[test]
    fn photos() {
        check_photo("image/png", 1024).unwrap();
        check_photo("IMAGE/JPEG", MAX_PHOTO_SIZE).unwrap();
        assert!(matches!(
            check_photo("image/svg+xml", 1024),
            Err(Error::InvalidFileType(_))
        ));
        assert!(matches!(
            check_photo("image/png", MAX_PHOTO_SIZE + 1),
            Err(Error::FileTooLarge { .. })
        ));
    }
}
