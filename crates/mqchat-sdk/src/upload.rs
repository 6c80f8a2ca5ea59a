//! 附件上传
//!
//! 发送编排只依赖 [`FileUploader`]：上传本地文件、返回远端地址、可取消。
//! [`HttpFileUploader`] 是基于 reqwest multipart 的实现。

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;
use reqwest::{multipart, Client};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{MqChatError, Result};

/// 上传进度回调，参数为 0-100 的百分比
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// 上传请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub message_id: String,
    pub local_path: PathBuf,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub file_size: u64,
}

impl UploadRequest {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(message_id: S, local_path: P, file_size: u64) -> Self {
        let local_path = local_path.into();
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Self {
            message_id: message_id.into(),
            local_path,
            file_name,
            mime_type: None,
            file_size,
        }
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[async_trait]
pub trait FileUploader: Send + Sync {
    /// 上传文件，返回远端地址
    async fn upload_file(&self, request: &UploadRequest, progress: ProgressCallback) -> Result<String>;

    /// 取消进行中的上传
    fn cancel_upload(&self);
}

/// 上传接口的响应
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileUploadResponse {
    pub file_url: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

const CHUNK_SIZE: usize = 64 * 1024;

/// HTTP multipart 上传
pub struct HttpFileUploader {
    client: Client,
    upload_url: String,
    upload_token: Option<String>,
    current: Mutex<Option<CancellationToken>>,
}

impl HttpFileUploader {
    pub fn new<S: Into<String>>(upload_url: S, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| MqChatError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let upload_url = upload_url.into();
        info!("✅ 上传客户端已创建: {}", upload_url);
        Ok(Self {
            client,
            upload_url,
            upload_token: None,
            current: Mutex::new(None),
        })
    }

    /// 每次上传附带的 `X-Upload-Token`
    pub fn with_upload_token<S: Into<String>>(mut self, token: S) -> Self {
        self.upload_token = Some(token.into());
        self
    }

    async fn send(&self, request: &UploadRequest, progress: ProgressCallback) -> Result<String> {
        let data = tokio::fs::read(&request.local_path)
            .await
            .map_err(|e| MqChatError::UploadFailure(format!("读取文件失败: {}: {}", request.local_path.display(), e)))?;
        let total = data.len() as u64;
        info!("📤 开始上传文件: {} ({} bytes)", request.local_path.display(), total);

        let mime_type = request
            .mime_type
            .clone()
            .unwrap_or_else(|| detect_mime_type(&request.local_path));

        progress(0);
        let body = progress_stream(Bytes::from(data), progress.clone());
        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(request.file_name.clone())
            .mime_str(&mime_type)
            .map_err(|e| MqChatError::UploadFailure(format!("创建 multipart part 失败: {}", e)))?;
        let form = multipart::Form::new()
            .text("message_id", request.message_id.clone())
            .part("file", part);

        let mut builder = self.client.post(&self.upload_url).multipart(form);
        if let Some(token) = &self.upload_token {
            builder = builder.header("X-Upload-Token", token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MqChatError::UploadFailure(format!("上传请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 上传失败，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(MqChatError::UploadFailure(format!(
                "HTTP {} ({})",
                status, error_text
            )));
        }

        let result: FileUploadResponse = response
            .json()
            .await
            .map_err(|e| MqChatError::UploadFailure(format!("解析上传响应失败: {}", e)))?;
        progress(100);
        info!("✅ 文件上传成功: {}", result.file_url);
        Ok(result.file_url)
    }
}

#[async_trait]
impl FileUploader for HttpFileUploader {
    async fn upload_file(&self, request: &UploadRequest, progress: ProgressCallback) -> Result<String> {
        let token = CancellationToken::new();
        let replaced = self.current.lock().replace(token.clone()).is_some();
        if replaced {
            warn!("⚠️ 上一个上传仍在进行，新的上传覆盖取消句柄");
        }

        let result = tokio::select! {
            _ = token.cancelled() => Err(MqChatError::Canceled(format!("上传已取消: {}", request.message_id))),
            result = self.send(request, progress) => result,
        };

        self.current.lock().take();
        result
    }

    fn cancel_upload(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            info!("取消进行中的上传");
            token.cancel();
        }
    }
}

/// 按块输出文件内容，每输出一块报告一次进度
fn progress_stream(
    data: Bytes,
    progress: ProgressCallback,
) -> impl futures_util::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let total = data.len();
    let chunks: Vec<Bytes> = (0..total)
        .step_by(CHUNK_SIZE)
        .map(|start| data.slice(start..(start + CHUNK_SIZE).min(total)))
        .collect();

    let mut sent = 0usize;
    stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len();
        // 100 留给服务端响应之后
        progress(percent(sent as u64, total as u64).min(99));
        Ok(chunk)
    }))
}

pub(crate) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

fn detect_mime_type(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "aac" | "m4a" => "audio/aac",
        "amr" => "audio/amr",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
    .to_string()
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU8, Ordering};

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 200), 0);
        assert_eq!(percent(100, 200), 50);
        assert_eq!(percent(300, 200), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_detect_mime_type() {
        assert_eq!(detect_mime_type(Path::new("a/photo.JPG")), "image/jpeg");
        assert_eq!(detect_mime_type(Path::new("voice.amr")), "audio/amr");
        assert_eq!(detect_mime_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_request_file_name() {
        let request = UploadRequest::new("m1", "/tmp/dir/report.pdf", 10);
        assert_eq!(request.file_name, "report.pdf");
        assert!(request.mime_type.is_none());
    }

    #[tokio::test]
    async fn test_progress_stream_reports_chunks() {
        let last = Arc::new(AtomicU8::new(0));
        let seen = last.clone();
        let data = Bytes::from(vec![7u8; CHUNK_SIZE * 2 + 10]);
        let chunks: Vec<_> = progress_stream(data, Arc::new(move |p| seen.store(p, Ordering::SeqCst)))
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].as_ref().unwrap().len(), 10);
        assert_eq!(last.load(Ordering::SeqCst), 99);
    }

    #[tokio::test]
    async fn test_missing_file_is_upload_failure() {
        let uploader = HttpFileUploader::new("http://127.0.0.1:9/upload", Duration::from_secs(2)).unwrap();
        let request = UploadRequest::new("m1", "/definitely/not/here.png", 10);
        let result = uploader.upload_file(&request, Arc::new(|_| {})).await;
        assert!(matches!(result, Err(MqChatError::UploadFailure(_))));
        // 上传结束后取消句柄被清理
        uploader.cancel_upload();
        assert!(uploader.current.lock().is_none());
    }

    #[tokio::test]
    async fn test_scripted_uploader_cancel() {
        let uploader = Arc::new(test_helpers::ScriptedUploader::new());
        *uploader.delay.lock() = Duration::from_secs(5);

        let task = {
            let uploader = uploader.clone();
            tokio::spawn(async move {
                let request = UploadRequest::new("m1", "/tmp/a.png", 10);
                uploader.upload_file(&request, Arc::new(|_| {})).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        uploader.cancel_upload();
        assert!(matches!(task.await.unwrap(), Err(MqChatError::Canceled(_))));
    }
}
