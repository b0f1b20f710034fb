use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt};
use xxhash_rust::xxh3::Xxh3;

/// Part size used when streaming blobs to S3 (10 MB).
pub const PART_SIZE: usize = 10 * 1024 * 1024;

pub struct UploadResult {
    pub hash: String,
    pub size: i64,
    pub key: String,
}

/// Blob storage behind the content factories.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Streams `reader` to `key`, returning its size and xxh3 hash.
    async fn upload_stream_with_hash<'a>(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<UploadResult>;
    async fn delete_file(&self, key: &str) -> Result<()>;
}

pub struct S3StorageService {
    client: Client,
    bucket: String,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn put_single(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }
}

/// Fills `buffer` from `reader` until it is full or the reader is drained.
async fn fill_buffer<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buffer.len() {
        let read = reader.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    Ok(n)
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn upload_stream_with_hash<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<UploadResult> {
        let mut hasher = Xxh3::new();
        let mut buffer = vec![0u8; PART_SIZE];

        // Anything that fits in one part skips the multipart dance.
        let first = fill_buffer(&mut reader, &mut buffer).await?;
        hasher.update(&buffer[..first]);
        if first < PART_SIZE {
            self.put_single(key, buffer[..first].to_vec()).await?;
            return Ok(UploadResult {
                hash: format!("{:016x}", hasher.digest()),
                size: first as i64,
                key: key.to_string(),
            });
        }

        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("No upload ID"))?;
        let mut chunk_index = 1;
        let mut completed_parts = Vec::new();
        let mut total_size = 0i64;
        let mut n = first;

        while n > 0 {
            total_size += n as i64;
            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(chunk_index)
                .send()
                .await?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(chunk_index)
                    .build(),
            );
            chunk_index += 1;

            n = fill_buffer(&mut reader, &mut buffer).await?;
            hasher.update(&buffer[..n]);
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await?;

        Ok(UploadResult {
            hash: format!("{:016x}", hasher.digest()),
            size: total_size,
            key: key.to_string(),
        })
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }
}
