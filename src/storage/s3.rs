use super::{
    ByteStream, Client, ClientContent, ContentStream, ContentType, GetOptions, ListOptions,
    PutOptions, RemoveOptions, StatOptions, WriteOptions, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::config::StorageConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator};
use std::collections::HashMap;
use std::time::Duration;

/// 超过该大小的对象使用分片上传
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
const MULTIPART_CHUNK: usize = 8 * 1024 * 1024;
/// 下载时每次范围请求的大小
const READ_CHUNK: usize = 8 * 1024 * 1024;

/// S3 客户端，绑定到一个存储桶和可选前缀
pub struct S3Client {
    operator: Operator,
    /// 以存储桶为根，用于服务端复制
    bucket_operator: Operator,
    prefix: String,
    name: String,
    endpoint_id: String,
}

impl S3Client {
    pub fn new(
        config: &StorageConfig,
        bucket: &str,
        prefix: Option<&str>,
        write: &WriteOptions,
    ) -> Result<Self, ClientError> {
        if bucket.is_empty() {
            return Err(ClientError::BucketNameEmpty);
        }

        let prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p))
            .unwrap_or_default();

        let operator = Self::build_operator(config, bucket, &prefix, write)?;
        let bucket_operator = Self::build_operator(config, bucket, "", write)?;

        let name = format!("s3://{}/{}", bucket, prefix.trim_end_matches('/'))
            .trim_end_matches('/')
            .to_string();
        let endpoint_id = format!(
            "s3:{}/{}",
            config.endpoint.as_deref().unwrap_or("aws"),
            bucket
        );

        Ok(Self {
            operator,
            bucket_operator,
            prefix,
            name,
            endpoint_id,
        })
    }

    fn build_operator(
        config: &StorageConfig,
        bucket: &str,
        root: &str,
        write: &WriteOptions,
    ) -> Result<Operator, ClientError> {
        use opendal::services::S3;

        let region = config.region.as_deref().unwrap_or("us-east-1");
        let mut builder = S3::default().bucket(bucket).region(region);

        if let Some(ak) = config.access_key.as_deref() {
            builder = builder.access_key_id(ak);
        }
        if let Some(sk) = config.secret_key.as_deref() {
            builder = builder.secret_access_key(sk);
        }
        if let Some(ep) = config.endpoint.as_deref() {
            builder = builder.endpoint(ep);
        }
        if !root.is_empty() {
            builder = builder.root(root);
        }
        if let Some(sc) = write.storage_class.as_deref() {
            builder = builder.default_storage_class(sc);
        }
        // 每个上传请求（包括每个分片）附带 CRC32C，由服务端校验
        if write.checksum {
            builder = builder.checksum_algorithm("crc32c");
        }

        // 添加超时层
        Ok(Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish())
    }

    fn content_from_metadata(path: &str, meta: &Metadata) -> ClientContent {
        let url = path.trim_start_matches('/').to_string();
        if meta.is_dir() {
            return ClientContent::folder(url.trim_end_matches('/'));
        }
        ClientContent {
            url,
            size: meta.content_length(),
            time: meta.last_modified().unwrap_or_default(),
            content_type: ContentType::File,
            etag: meta.etag().map(|s| s.trim_matches('"').to_string()),
            version_id: meta.version().map(|v| v.to_string()),
            storage_class: None,
            user_metadata: meta
                .user_metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            is_delete_marker: false,
        }
    }
}

#[async_trait]
impl Client for S3Client {
    fn url(&self) -> &str {
        &self.name
    }

    fn endpoint_id(&self) -> String {
        self.endpoint_id.clone()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    fn listing_has_metadata(&self) -> bool {
        false
    }

    async fn list(&self, opts: ListOptions) -> Result<ContentStream, ClientError> {
        if opts.include_versions {
            return Err(ClientError::NotImplemented("S3 版本列举".to_string()));
        }

        // 使用 lister_with 进行递归列表，S3 返回结果按 key 字典序排列
        let lister = self
            .operator
            .lister_with("")
            .recursive(opts.recursive)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag)
            .await?;

        let stream = lister
            .map_err(ClientError::from)
            .try_filter_map(move |entry| {
                let path = entry.path().to_string();
                let keep = !(path.is_empty() || path == "/")
                    && !(opts.recursive && entry.metadata().is_dir());
                let content = keep.then(|| Self::content_from_metadata(&path, entry.metadata()));
                futures::future::ready(Ok(content))
            });

        Ok(stream.boxed())
    }

    async fn stat(&self, path: &str, opts: StatOptions) -> Result<ClientContent, ClientError> {
        let target = if path.is_empty() { "/" } else { path };
        let mut future = self.operator.stat_with(target);
        if let Some(version) = opts.version_id.as_deref() {
            future = future.version(version);
        }
        let meta = future.await?;
        Ok(Self::content_from_metadata(path, &meta))
    }

    async fn get(&self, path: &str, opts: GetOptions) -> Result<ByteStream, ClientError> {
        let mut future = self.operator.reader_with(path);
        if let Some(version) = opts.version_id.as_deref() {
            future = future.version(version);
        }
        let reader = future.chunk(READ_CHUNK).await?;
        // 边下载边产出数据块，传输计数随数据流推进
        let stream = reader.into_bytes_stream(..).await?;
        Ok(stream.map_err(ClientError::from).boxed())
    }

    async fn put(
        &self,
        path: &str,
        mut data: ByteStream,
        size: u64,
        opts: PutOptions,
    ) -> Result<u64, ClientError> {
        let mut future = self.operator.writer_with(path);
        if !opts.disable_multipart && size > MULTIPART_THRESHOLD {
            future = future.chunk(MULTIPART_CHUNK);
        }
        if !opts.user_metadata.is_empty() {
            let meta: HashMap<String, String> = opts.user_metadata.into_iter().collect();
            future = future.user_metadata(meta);
        }
        let mut writer = future.await?;

        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            match chunk {
                Ok(chunk) => {
                    written += chunk.len() as u64;
                    writer.write(chunk).await?;
                }
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e);
                }
            }
        }
        writer.close().await?;
        Ok(written)
    }

    async fn copy(
        &self,
        source_path: &str,
        target_path: &str,
        opts: PutOptions,
    ) -> Result<(), ClientError> {
        // 服务端复制不能附加元数据，交给调用方改为下载上传
        if !opts.user_metadata.is_empty() {
            return Err(ClientError::NotImplemented("带元数据的服务端复制".to_string()));
        }
        let target = self.full_key(target_path);
        self.bucket_operator.copy(source_path, &target).await?;
        Ok(())
    }

    async fn remove(&self, paths: Vec<String>, opts: RemoveOptions) -> Vec<(String, ClientError)> {
        let mut failed = Vec::new();
        for path in paths {
            let result = if opts.is_bucket {
                self.operator.remove_all(&path).await
            } else {
                // S3 删除不存在的文件不会报错
                self.operator.delete(&path).await
            };
            if let Err(e) = result {
                failed.push((path, ClientError::from(e)));
            }
        }
        failed
    }

    async fn make_bucket(&self, bucket: &str, _region: &str) -> Result<(), ClientError> {
        Err(ClientError::NotImplemented(format!(
            "创建存储桶 `{}`",
            bucket
        )))
    }
}
