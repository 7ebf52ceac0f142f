use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use tokio::io::AsyncReadExt as _;

use super::PushError;

/// Content encodings accepted on push requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentEncoding {
    /// No encoding.
    Identity,

    /// gzip.
    Gzip,

    /// Snappy, block format.
    Snappy,
}

impl ContentEncoding {
    /// Maps a `Content-Encoding` header value. Unknown or missing values are treated as identity.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => Self::Gzip,
            Some("snappy") => Self::Snappy,
            _ => Self::Identity,
        }
    }
}

/// Decodes a request body according to its content encoding, refusing to inflate past `limit` bytes.
pub async fn decode_body(body: Bytes, encoding: ContentEncoding, limit: usize) -> Result<Bytes, PushError> {
    match encoding {
        ContentEncoding::Identity => Ok(body),
        ContentEncoding::Gzip => {
            let mut decoder = GzipDecoder::new(&body[..]).take(limit as u64 + 1);
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .await
                .map_err(|e| PushError::InvalidBody {
                    reason: format!("invalid gzip body: {}", e),
                })?;
            check_limit(decoded.len(), limit)?;
            Ok(decoded.into())
        }
        ContentEncoding::Snappy => {
            let decoded_len = snap::raw::decompress_len(&body).map_err(|e| PushError::InvalidBody {
                reason: format!("invalid snappy body: {}", e),
            })?;
            check_limit(decoded_len, limit)?;

            let decoded = snap::raw::Decoder::new()
                .decompress_vec(&body)
                .map_err(|e| PushError::InvalidBody {
                    reason: format!("invalid snappy body: {}", e),
                })?;
            Ok(decoded.into())
        }
    }
}

fn check_limit(len: usize, limit: usize) -> Result<(), PushError> {
    if len > limit {
        return Err(PushError::InvalidBody {
            reason: format!("decoded body exceeds {} bytes", limit),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt as _;

    use super::*;

    const LIMIT: usize = 1 << 20;

    async fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner().into()
    }

    #[test]
    fn header_mapping() {
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_header(Some("GZIP")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some(" snappy ")), ContentEncoding::Snappy);
        assert_eq!(ContentEncoding::from_header(Some("br")), ContentEncoding::Identity);
    }

    #[tokio::test]
    async fn gzip_bodies_are_inflated() {
        let body = gzip(b"up 1\n").await;
        let decoded = decode_body(body, ContentEncoding::Gzip, LIMIT).await.unwrap();
        assert_eq!(&decoded[..], b"up 1\n");
    }

    #[tokio::test]
    async fn snappy_bodies_are_inflated() {
        let body = snap::raw::Encoder::new().compress_vec(b"up 1\n").unwrap();
        let decoded = decode_body(body.into(), ContentEncoding::Snappy, LIMIT).await.unwrap();
        assert_eq!(&decoded[..], b"up 1\n");
    }

    #[tokio::test]
    async fn corrupt_bodies_are_rejected() {
        let garbage = Bytes::from_static(b"definitely not compressed");
        assert!(matches!(
            decode_body(garbage.clone(), ContentEncoding::Gzip, LIMIT).await,
            Err(PushError::InvalidBody { .. })
        ));
        assert!(matches!(
            decode_body(garbage, ContentEncoding::Snappy, LIMIT).await,
            Err(PushError::InvalidBody { .. })
        ));
    }

    #[tokio::test]
    async fn inflation_is_bounded() {
        let body = gzip(&[b'a'; 4096]).await;
        assert!(matches!(
            decode_body(body, ContentEncoding::Gzip, 1024).await,
            Err(PushError::InvalidBody { .. })
        ));

        let body = snap::raw::Encoder::new().compress_vec(&[b'a'; 4096]).unwrap();
        assert!(matches!(
            decode_body(body.into(), ContentEncoding::Snappy, 1024).await,
            Err(PushError::InvalidBody { .. })
        ));
    }
}
