//! Google Drive v3 API client.
//!
//! Every call takes the bearer credential explicitly so the request engine
//! can retry it with a refreshed token.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use unidrive_common::{DrivePath, Error, Result};

use crate::adapter::{FileEntry, FileHash, ListOrder, OrderBy};
use crate::http::{check_response, read_json, send_error, status_error};

/// Google Drive API base URL.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str =
    "id,name,mimeType,size,createdTime,modifiedTime,parents,md5Checksum,sha1Checksum,sha256Checksum,thumbnailLink,trashed";
const BOUNDARY: &str = "UniDriveBoundary";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub sha1_checksum: Option<String>,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
    #[serde(default)]
    pub thumbnail_link: Option<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }

    /// Convert to a generic entry at `path`.
    pub fn to_entry(&self, path: DrivePath) -> FileEntry {
        let entry = if self.is_folder() {
            FileEntry::folder(path)
        } else {
            let hash = FileHash {
                md5: self.md5_checksum.clone(),
                sha1: self.sha1_checksum.clone(),
                sha256: self.sha256_checksum.clone(),
            };
            FileEntry::file(path, self.size_bytes().unwrap_or(0)).with_hash(hash)
        };
        let mut entry = entry
            .with_remote_id(self.id.clone())
            .with_times(self.created_time, self.modified_time)
            .with_thumbnail(self.thumbnail_link.clone());
        // Vendor names may contain '/', which the path keeps encoded
        entry.name = self.name.clone();
        entry
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Account details from the `about` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct About {
    pub user: AboutUser,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutUser {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

/// `orderBy` parameter for a listing order.
pub fn order_by_param(order: &ListOrder) -> String {
    let field = match order.order_by {
        OrderBy::Name => "name",
        OrderBy::Size => "quotaBytesUsed",
        OrderBy::Modified => "modifiedTime",
    };
    if order.order_desc {
        format!("folder,{} desc", field)
    } else {
        format!("folder,{}", field)
    }
}

/// Escape a name for use inside a `q` string literal.
fn escape_query(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Build a `multipart/related` body with JSON metadata and the content.
pub fn multipart_body(metadata: &serde_json::Value, data: &[u8]) -> Vec<u8> {
    let metadata_json = metadata.to_string();
    let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);

    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata_json.as_bytes());
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}--", BOUNDARY).as_bytes());
    body
}

/// Google Drive API client.
#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(http: Client, api_base: Option<&str>, upload_base: Option<&str>) -> Self {
        Self {
            http,
            api_base: api_base.unwrap_or(DRIVE_API_BASE).trim_end_matches('/').to_string(),
            upload_base: upload_base
                .unwrap_or(DRIVE_UPLOAD_BASE)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// Media URL for a file's content.
    pub fn media_url(&self, file_id: &str) -> String {
        format!("{}/files/{}?alt=media", self.api_base, file_id)
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    /// Check the status and decode a JSON body.
    ///
    /// Drive reports rate limiting as 403, which is retryable.
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
        if response.status() == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            if body.contains("ateLimitExceeded") {
                return Err(Error::Network(format!("Rate limited: {}", body)));
            }
            return Err(status_error(StatusCode::FORBIDDEN, &body));
        }
        read_json(response).await
    }

    /// Account details.
    pub async fn about(&self, token: &str) -> Result<About> {
        let response = self
            .http
            .get(format!("{}/about", self.api_base))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", "user(displayName,emailAddress)")])
            .send()
            .await
            .map_err(|e| send_error("Failed to get account", e))?;
        Self::handle_response(response).await
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, token: &str, file_id: &str) -> Result<DriveFile> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| send_error("Failed to get file", e))?;
        Self::handle_response(response).await
    }

    /// List a folder, following `nextPageToken` until exhausted.
    pub async fn list_folder(
        &self,
        token: &str,
        folder_id: &str,
        order: &ListOrder,
    ) -> Result<Vec<DriveFile>> {
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let fields = format!("files({}),nextPageToken", FILE_FIELDS);
        let order_by = order_by_param(order);

        loop {
            let mut request = self
                .http
                .get(format!("{}/files", self.api_base))
                .header(header::AUTHORIZATION, Self::bearer(token))
                .query(&[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("orderBy", order_by.as_str()),
                    ("pageSize", "1000"),
                ]);

            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| send_error("Failed to list folder", e))?;

            let page: FileListResponse = Self::handle_response(response).await?;
            all_files.extend(page.files);

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(all_files)
    }

    /// Find a child by exact name.
    pub async fn find_child(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent_id)
        );
        let fields = format!("files({})", FILE_FIELDS);

        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "1"),
            ])
            .send()
            .await
            .map_err(|e| send_error("Failed to find file", e))?;

        let page: FileListResponse = Self::handle_response(response).await?;
        Ok(page.files.into_iter().next())
    }

    /// Create a folder.
    pub async fn create_folder(&self, token: &str, name: &str, parent_id: &str) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| send_error("Failed to create folder", e))?;
        Self::handle_response(response).await
    }

    /// Upload a small file in one multipart request.
    pub async fn upload_simple(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
        data: &[u8],
    ) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(multipart_body(&metadata, data))
            .send()
            .await
            .map_err(|e| send_error("Failed to upload file", e))?;
        Self::handle_response(response).await
    }

    /// Start a resumable upload session; returns the session URI.
    pub async fn start_resumable(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
        total_size: u64,
    ) -> Result<String> {
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header("X-Upload-Content-Length", total_size.to_string())
            .query(&[("uploadType", "resumable")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| send_error("Failed to start resumable upload", e))?;

        let response = check_response(response).await?;

        // Extract upload URI from Location header
        response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Vendor("No upload URI in response".to_string()))?
            .to_str()
            .map(str::to_string)
            .map_err(|e| Error::Vendor(format!("Invalid upload URI: {}", e)))
    }

    /// Upload one chunk; `Some` once Drive reports the file complete.
    pub async fn upload_chunk(
        &self,
        token: &str,
        upload_uri: &str,
        data: Bytes,
        start_byte: u64,
        total_size: u64,
    ) -> Result<Option<DriveFile>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| send_error("Failed to upload chunk", e))?;

        Self::resumable_status(response).await
    }

    /// Ask a resumable session whether the file is complete.
    pub async fn upload_status(
        &self,
        token: &str,
        upload_uri: &str,
        total_size: u64,
    ) -> Result<Option<DriveFile>> {
        let response = self
            .http
            .put(upload_uri)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(header::CONTENT_LENGTH, "0")
            .header(header::CONTENT_RANGE, format!("bytes */{}", total_size))
            .send()
            .await
            .map_err(|e| send_error("Failed to query upload", e))?;

        Self::resumable_status(response).await
    }

    async fn resumable_status(response: Response) -> Result<Option<DriveFile>> {
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(Some(Self::handle_response(response).await?)),
            // 308 Resume Incomplete
            StatusCode::PERMANENT_REDIRECT => Ok(None),
            _ => {
                Self::handle_response::<serde_json::Value>(response).await?;
                Ok(None)
            }
        }
    }

    /// Permanently delete a file or folder.
    pub async fn delete(&self, token: &str, file_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/files/{}", self.api_base, file_id))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .send()
            .await
            .map_err(|e| send_error("Failed to delete file", e))?;
        check_response(response).await.map(|_| ())
    }

    /// Move and/or rename a file.
    pub async fn move_file(
        &self,
        token: &str,
        file_id: &str,
        new_name: Option<&str>,
        new_parent: Option<&str>,
        current_parents: &[String],
    ) -> Result<DriveFile> {
        let mut metadata = serde_json::json!({});
        if let Some(name) = new_name {
            metadata["name"] = serde_json::json!(name);
        }

        let mut request = self
            .http
            .patch(format!("{}/files/{}", self.api_base, file_id))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)]);

        // Handle parent change
        if let Some(new_parent_id) = new_parent {
            request = request.query(&[("addParents", new_parent_id)]);
            if !current_parents.is_empty() {
                request = request.query(&[("removeParents", current_parents.join(","))]);
            }
        }

        let response = request
            .json(&metadata)
            .send()
            .await
            .map_err(|e| send_error("Failed to move file", e))?;
        Self::handle_response(response).await
    }

    /// Copy a file into `parent_id` under `new_name`.
    pub async fn copy_file(
        &self,
        token: &str,
        file_id: &str,
        new_name: &str,
        parent_id: &str,
    ) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": new_name,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(format!("{}/files/{}/copy", self.api_base, file_id))
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| send_error("Failed to copy file", e))?;
        Self::handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drive_file(mime: &str, size: Option<&str>) -> DriveFile {
        serde_json::from_value(json!({
            "id": "abc123",
            "name": "a/b.txt",
            "mimeType": mime,
            "size": size,
            "md5Checksum": "md5hash",
        }))
        .unwrap()
    }

    #[test]
    fn test_drive_file_is_folder() {
        assert!(drive_file(FOLDER_MIME, None).is_folder());
        assert!(!drive_file("text/plain", Some("1024")).is_folder());
    }

    #[test]
    fn test_drive_file_size_bytes() {
        assert_eq!(drive_file("text/plain", Some("12345")).size_bytes(), Some(12345));
        assert_eq!(drive_file(FOLDER_MIME, None).size_bytes(), None);
    }

    #[test]
    fn test_to_entry_keeps_vendor_name() {
        let file = drive_file("text/plain", Some("100"));
        let path = DrivePath::parse("/docs/a%2Fb.txt").unwrap();
        let entry = file.to_entry(path);
        assert_eq!(entry.name, "a/b.txt");
        assert_eq!(entry.size, 100);
        assert_eq!(entry.remote_id.as_deref(), Some("abc123"));
        assert_eq!(entry.hash.unwrap().md5.as_deref(), Some("md5hash"));
    }

    #[test]
    fn test_list_response_decoding() {
        let page: FileListResponse = serde_json::from_value(json!({
            "files": [{"id": "1", "name": "x", "mimeType": FOLDER_MIME}],
            "nextPageToken": "p2"
        }))
        .unwrap();
        assert_eq!(page.files.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
    }

    #[test]
    fn test_order_by_param() {
        assert_eq!(order_by_param(&ListOrder::default()), "folder,name");
        let desc = ListOrder {
            order_by: OrderBy::Modified,
            order_desc: true,
        };
        assert_eq!(order_by_param(&desc), "folder,modifiedTime desc");
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("it's"), "it\\'s");
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_body(&json!({"name": "f"}), b"DATA");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--UniDriveBoundary\r\n"));
        assert!(text.contains("{\"name\":\"f\"}"));
        assert!(text.contains("\r\n\r\nDATA\r\n"));
        assert!(text.ends_with("--UniDriveBoundary--"));
    }

    #[test]
    fn test_media_url() {
        let client = DriveClient::new(Client::new(), Some("https://example.test/drive/v3/"), None);
        assert_eq!(
            client.media_url("id1"),
            "https://example.test/drive/v3/files/id1?alt=media"
        );
    }
}
