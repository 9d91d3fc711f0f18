//! Source expansion: files, folders and clipboard payloads into upload items

use super::plan::PartRange;
use super::types::TransferSource;
use crate::error::{StorageError, StorageResult};
use crate::providers::ObjectBody;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Where an item's bytes come from.
#[derive(Debug, Clone)]
pub enum Payload {
    File(PathBuf),
    Inline(Bytes),
}

/// One object to upload.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub filename: String,
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub payload: Payload,
}

impl UploadItem {
    pub fn body(&self) -> ObjectBody {
        match &self.payload {
            Payload::File(path) => ObjectBody::File {
                path: path.clone(),
                len: self.size,
            },
            Payload::Inline(bytes) => ObjectBody::Bytes(bytes.clone()),
        }
    }
}

impl Payload {
    /// Bytes of one part. Files are opened per part so parts can be read
    /// concurrently.
    pub async fn read_part(&self, range: &PartRange) -> StorageResult<Bytes> {
        match self {
            Payload::Inline(bytes) => {
                let start = range.offset as usize;
                let end = start + range.len as usize;
                if end > bytes.len() {
                    return Err(StorageError::Validation(format!(
                        "part {} extends past the end of the payload",
                        range.number
                    )));
                }
                Ok(bytes.slice(start..end))
            }
            Payload::File(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(range.offset)).await?;
                let mut buffer = vec![0u8; range.len as usize];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

/// Join a remote prefix and a relative name with single `/` separators.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

pub fn guess_content_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn file_name(path: &Path) -> StorageResult<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| StorageError::Validation(format!("{} has no file name", path.display())))
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Expand a source into upload items. Folder entries are sorted by their
/// relative path and keyed as `<remote_path>/<folder>/<relative path>`.
pub async fn expand(source: &TransferSource, remote_path: &str) -> StorageResult<Vec<UploadItem>> {
    match source {
        TransferSource::File(path) => {
            let metadata = tokio::fs::metadata(path).await?;
            if !metadata.is_file() {
                return Err(StorageError::Validation(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            let filename = file_name(path)?;
            Ok(vec![UploadItem {
                key: join_key(remote_path, &filename),
                content_type: guess_content_type(&filename),
                size: metadata.len(),
                payload: Payload::File(path.clone()),
                filename,
            }])
        }
        TransferSource::Folder(root) => expand_folder(root, remote_path).await,
        TransferSource::Text { content, filename } => Ok(vec![UploadItem {
            key: join_key(remote_path, filename),
            filename: filename.clone(),
            size: content.len() as u64,
            content_type: TEXT_CONTENT_TYPE.to_string(),
            payload: Payload::Inline(Bytes::from(content.clone())),
        }]),
        TransferSource::Image { bytes, filename } => Ok(vec![UploadItem {
            key: join_key(remote_path, filename),
            filename: filename.clone(),
            size: bytes.len() as u64,
            content_type: guess_content_type(filename),
            payload: Payload::Inline(bytes.clone()),
        }]),
    }
}

async fn expand_folder(root: &Path, remote_path: &str) -> StorageResult<Vec<UploadItem>> {
    let folder_name = file_name(root)?;
    let mut files: Vec<(String, PathBuf, u64)> = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, relative)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                continue;
            }
            let child_relative = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), child_relative));
            } else if file_type.is_file() {
                let size = entry.metadata().await?.len();
                files.push((child_relative, entry.path(), size));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    let prefix = join_key(remote_path, &folder_name);
    Ok(files
        .into_iter()
        .map(|(relative, path, size)| {
            let filename = relative.rsplit('/').next().unwrap_or(&relative).to_string();
            UploadItem {
                key: join_key(&prefix, &relative),
                content_type: guess_content_type(&filename),
                filename,
                size,
                payload: Payload::File(path),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_join_with_single_slash() {
        assert_eq!(join_key("", "a.png"), "a.png");
        assert_eq!(join_key("/photos/", "a.png"), "photos/a.png");
        assert_eq!(join_key("photos", "/2024/a.png"), "photos/2024/a.png");
    }

    #[test]
    fn content_type_is_guessed_from_name() {
        assert_eq!(guess_content_type("cat.png"), "image/png");
        assert_eq!(guess_content_type("archive.unknownext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn folder_expands_sorted_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("site");
        std::fs::create_dir_all(root.join("css")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("index.html"), b"<html></html>").unwrap();
        std::fs::write(root.join("css/main.css"), b"body{}").unwrap();
        std::fs::write(root.join(".DS_Store"), b"x").unwrap();
        std::fs::write(root.join(".git/HEAD"), b"ref").unwrap();

        let items = expand(&TransferSource::Folder(root), "public").await.unwrap();
        let keys: Vec<_> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, ["public/site/css/main.css", "public/site/index.html"]);
        assert_eq!(items[0].content_type, "text/css");
        assert_eq!(items[1].size, 13);
    }

    #[tokio::test]
    async fn inline_text_uses_text_content_type() {
        let source = TransferSource::Text {
            content: "hello".to_string(),
            filename: "note.txt".to_string(),
        };
        let items = expand(&source, "").await.unwrap();
        assert_eq!(items[0].key, "note.txt");
        assert_eq!(items[0].content_type, TEXT_CONTENT_TYPE);
        assert_eq!(items[0].size, 5);
    }

    #[tokio::test]
    async fn file_parts_are_read_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let payload = Payload::File(path);
        let part = payload
            .read_part(&PartRange { number: 2, offset: 4, len: 3 })
            .await
            .unwrap();
        assert_eq!(&part[..], b"456");

        let inline = Payload::Inline(Bytes::from_static(b"0123456789"));
        assert!(inline
            .read_part(&PartRange { number: 9, offset: 8, len: 5 })
            .await
            .is_err());
    }
}
