//! Baidu Netdisk xpan/pcs client.
//!
//! Baidu reports most failures as HTTP 200 with a non-zero `errno` in the
//! body, so every response is decoded through [`decode`].

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use unidrive_common::{DrivePath, Error, Result};

use crate::adapter::{FileEntry, FileHash, ListOrder, OrderBy};
use crate::http::{send_error, status_error};

/// xpan REST base URL.
pub const PAN_API_BASE: &str = "https://pan.baidu.com/rest/2.0/xpan";
/// PCS slice upload base URL.
pub const PCS_UPLOAD_BASE: &str = "https://d.pcs.baidu.com/rest/2.0/pcs";
/// Baidu only serves `dlink` downloads to this user agent.
pub const DOWNLOAD_USER_AGENT: &str = "pan.baidu.com";

const PAGE_LIMIT: usize = 1000;

/// Classify a non-zero Baidu `errno`.
pub fn errno_error(errno: i64, detail: &str) -> Error {
    match errno {
        -6 | 110 | 111 => Error::Auth(format!("Baidu errno {}: access token rejected", errno)),
        -9 | 31066 => Error::NotFound(format!("Baidu errno {}: {}", errno, detail)),
        -8 | 31061 => Error::AlreadyExists(format!("Baidu errno {}: {}", errno, detail)),
        31034 | 20012 => Error::Network(format!("Baidu errno {}: rate limited", errno)),
        _ => Error::Vendor(format!("Baidu errno {}: {}", errno, detail)),
    }
}

/// Read a Baidu response, honoring both HTTP status and body error codes.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| send_error("Failed to read response", e))?;

    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) if !status.is_success() => return Err(status_error(status, &text)),
        Err(e) => return Err(Error::Vendor(format!("Failed to parse response: {}", e))),
    };

    let code = value
        .get("errno")
        .or_else(|| value.get("error_code"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if code != 0 {
        let detail = value
            .get("errmsg")
            .or_else(|| value.get("error_msg"))
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        return Err(errno_error(code, detail));
    }
    if !status.is_success() {
        return Err(status_error(status, &text));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::Vendor(format!("Unexpected response shape: {}", e)))
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

/// File metadata from list/create responses.
#[derive(Debug, Clone, Deserialize)]
pub struct BaiduFile {
    pub fs_id: u64,
    pub path: String,
    #[serde(default)]
    pub server_filename: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub isdir: u8,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default, alias = "ctime")]
    pub server_ctime: Option<i64>,
    #[serde(default, alias = "mtime")]
    pub server_mtime: Option<i64>,
    #[serde(default)]
    pub thumbs: Option<HashMap<String, String>>,
}

impl BaiduFile {
    pub fn is_folder(&self) -> bool {
        self.isdir == 1
    }

    /// Display name; create responses omit `server_filename`.
    pub fn name(&self) -> &str {
        match &self.server_filename {
            Some(name) => name,
            None => self.path.rsplit('/').next().unwrap_or(&self.path),
        }
    }

    pub fn to_entry(&self, path: DrivePath) -> FileEntry {
        let entry = if self.is_folder() {
            FileEntry::folder(path)
        } else {
            let hash = FileHash {
                md5: self.md5.clone(),
                sha1: None,
                sha256: None,
            };
            FileEntry::file(path, self.size).with_hash(hash)
        };
        let thumbnail = self
            .thumbs
            .as_ref()
            .and_then(|t| t.get("url3").or_else(|| t.get("url1")).cloned());
        let mut entry = entry
            .with_remote_id(self.fs_id.to_string())
            .with_times(timestamp(self.server_ctime), timestamp(self.server_mtime))
            .with_thumbnail(thumbnail);
        entry.name = self.name().to_string();
        entry
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    list: Vec<BaiduFile>,
}

/// Account details from `uinfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub baidu_name: Option<String>,
    /// 0 normal, 1 member, 2 super member.
    #[serde(default)]
    pub vip_type: u8,
}

/// Download metadata from `filemetas`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    pub fs_id: u64,
    #[serde(default)]
    pub dlink: Option<String>,
    #[serde(default)]
    pub isdir: u8,
}

#[derive(Debug, Deserialize)]
struct MetasResponse {
    #[serde(default)]
    list: Vec<FileMeta>,
}

/// Result of a `filemanager` call.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerResponse {
    /// Present when Baidu chose to run the operation in the background.
    #[serde(default)]
    pub taskid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PrecreateResponse {
    #[serde(default)]
    uploadid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SliceResponse {
    md5: String,
}

#[derive(Debug, Deserialize)]
struct RapidResponse {
    #[serde(default)]
    info: Option<BaiduFile>,
}

/// Filemanager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerOp {
    Copy,
    Move,
    Delete,
}

impl ManagerOp {
    fn as_str(self) -> &'static str {
        match self {
            ManagerOp::Copy => "copy",
            ManagerOp::Move => "move",
            ManagerOp::Delete => "delete",
        }
    }
}

fn order_param(order: &ListOrder) -> &'static str {
    match order.order_by {
        OrderBy::Name => "name",
        OrderBy::Size => "size",
        OrderBy::Modified => "time",
    }
}

/// Split an absolute remote path into parent and name.
pub fn split_remote(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

/// Baidu Netdisk API client.
#[derive(Clone)]
pub struct PanClient {
    http: Client,
    api_base: String,
    upload_base: String,
}

impl PanClient {
    pub fn new(http: Client, api_base: Option<&str>, upload_base: Option<&str>) -> Self {
        Self {
            http,
            api_base: api_base.unwrap_or(PAN_API_BASE).to_string(),
            upload_base: upload_base.unwrap_or(PCS_UPLOAD_BASE).to_string(),
        }
    }

    fn pan(&self, endpoint: &str) -> String {
        format!("{}/{}", self.api_base, endpoint)
    }

    /// Account tier and name.
    pub async fn uinfo(&self, token: &str) -> Result<UserInfo> {
        let response = self
            .http
            .get(self.pan("nas"))
            .query(&[("method", "uinfo"), ("access_token", token)])
            .send()
            .await
            .map_err(|e| send_error("Failed to fetch account info", e))?;
        decode(response).await
    }

    /// List one directory, paging with `start`/`limit` until a short page.
    pub async fn list(&self, token: &str, dir: &str, order: &ListOrder) -> Result<Vec<BaiduFile>> {
        let mut all = Vec::new();
        let desc = if order.order_desc { "1" } else { "0" };
        loop {
            let start = all.len().to_string();
            let limit = PAGE_LIMIT.to_string();
            let response = self
                .http
                .get(self.pan("file"))
                .query(&[
                    ("method", "list"),
                    ("access_token", token),
                    ("dir", dir),
                    ("order", order_param(order)),
                    ("desc", desc),
                    ("start", start.as_str()),
                    ("limit", limit.as_str()),
                    ("web", "1"),
                ])
                .send()
                .await
                .map_err(|e| send_error("Failed to list directory", e))?;

            let page: ListResponse = decode(response).await?;
            let count = page.list.len();
            all.extend(page.list);
            if count < PAGE_LIMIT {
                break;
            }
        }
        Ok(all)
    }

    /// Find a direct child of `dir` by exact name.
    pub async fn find_child(&self, token: &str, dir: &str, name: &str) -> Result<Option<BaiduFile>> {
        let children = self.list(token, dir, &ListOrder::default()).await?;
        Ok(children.into_iter().find(|f| f.name() == name))
    }

    /// Fetch download metadata including `dlink`.
    pub async fn filemetas(&self, token: &str, fs_ids: &[u64]) -> Result<Vec<FileMeta>> {
        let fsids = serde_json::to_string(fs_ids)?;
        let response = self
            .http
            .get(self.pan("multimedia"))
            .query(&[
                ("method", "filemetas"),
                ("access_token", token),
                ("fsids", fsids.as_str()),
                ("dlink", "1"),
            ])
            .send()
            .await
            .map_err(|e| send_error("Failed to fetch file metas", e))?;
        let metas: MetasResponse = decode(response).await?;
        Ok(metas.list)
    }

    /// Run a copy, move or delete. `async=1` lets Baidu decide whether to
    /// return a task id.
    pub async fn filemanager(&self, token: &str, op: ManagerOp, filelist: &Value) -> Result<ManagerResponse> {
        let filelist = filelist.to_string();
        let response = self
            .http
            .post(self.pan("file"))
            .query(&[
                ("method", "filemanager"),
                ("access_token", token),
                ("opera", op.as_str()),
            ])
            .form(&[("async", "1"), ("filelist", filelist.as_str()), ("ondup", "fail")])
            .send()
            .await
            .map_err(|e| send_error("Failed to manage file", e))?;
        decode(response).await
    }

    /// Create a directory; fails if the path is taken.
    pub async fn create_dir(&self, token: &str, path: &str) -> Result<BaiduFile> {
        let response = self
            .http
            .post(self.pan("file"))
            .query(&[("method", "create"), ("access_token", token)])
            .form(&[("path", path), ("isdir", "1"), ("rtype", "0")])
            .send()
            .await
            .map_err(|e| send_error("Failed to create directory", e))?;
        decode(response).await
    }

    /// Existence probe by content MD5 and first-256 KiB MD5.
    pub async fn rapid_upload(
        &self,
        token: &str,
        path: &str,
        size: u64,
        content_md5: &str,
        slice_md5: &str,
    ) -> Result<Option<BaiduFile>> {
        let size = size.to_string();
        let response = self
            .http
            .post(self.pan("file"))
            .query(&[("method", "rapidupload"), ("access_token", token)])
            .form(&[
                ("path", path),
                ("content-length", size.as_str()),
                ("content-md5", content_md5),
                ("slice-md5", slice_md5),
                ("rtype", "3"),
            ])
            .send()
            .await
            .map_err(|e| send_error("Failed to probe rapid upload", e))?;

        match decode::<RapidResponse>(response).await {
            Ok(hit) => Ok(hit.info),
            // Content unknown to Baidu
            Err(Error::Vendor(msg)) if msg.contains("errno 404") || msg.contains("errno 31079") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Open an upload session for `block_list` slice hashes; returns the
    /// upload id.
    pub async fn precreate(
        &self,
        token: &str,
        path: &str,
        size: u64,
        block_list: &[String],
        content_md5: &str,
        slice_md5: &str,
    ) -> Result<String> {
        let size = size.to_string();
        let blocks = json!(block_list).to_string();
        let response = self
            .http
            .post(self.pan("file"))
            .query(&[("method", "precreate"), ("access_token", token)])
            .form(&[
                ("path", path),
                ("size", size.as_str()),
                ("isdir", "0"),
                ("autoinit", "1"),
                ("rtype", "3"),
                ("block_list", blocks.as_str()),
                ("content-md5", content_md5),
                ("slice-md5", slice_md5),
            ])
            .send()
            .await
            .map_err(|e| send_error("Failed to precreate upload", e))?;

        let reply: PrecreateResponse = decode(response).await?;
        reply
            .uploadid
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Vendor("precreate returned no upload id".to_string()))
    }

    /// Upload slice `partseq`; returns the MD5 Baidu computed for it.
    pub async fn upload_slice(
        &self,
        token: &str,
        path: &str,
        upload_id: &str,
        partseq: usize,
        data: Bytes,
    ) -> Result<String> {
        let partseq = partseq.to_string();
        let form = Form::new().part("file", Part::stream(data).file_name("blob"));
        let response = self
            .http
            .post(format!("{}/superfile2", self.upload_base))
            .query(&[
                ("method", "upload"),
                ("access_token", token),
                ("type", "tmpfile"),
                ("path", path),
                ("uploadid", upload_id),
                ("partseq", partseq.as_str()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(|e| send_error("Failed to upload slice", e))?;

        let reply: SliceResponse = decode(response).await?;
        Ok(reply.md5)
    }

    /// Assemble uploaded slices into the final file.
    pub async fn create_file(
        &self,
        token: &str,
        path: &str,
        size: u64,
        upload_id: &str,
        block_list: &[String],
    ) -> Result<BaiduFile> {
        let size = size.to_string();
        let blocks = json!(block_list).to_string();
        let response = self
            .http
            .post(self.pan("file"))
            .query(&[("method", "create"), ("access_token", token)])
            .form(&[
                ("path", path),
                ("size", size.as_str()),
                ("isdir", "0"),
                ("rtype", "3"),
                ("uploadid", upload_id),
                ("block_list", blocks.as_str()),
            ])
            .send()
            .await
            .map_err(|e| send_error("Failed to create file", e))?;
        decode(response).await
    }
}
