use std::io;

use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use snafu::Snafu;
use tokio::io::AsyncWriteExt as _;
use tracing::trace;

use crate::point::{write_line_protocol, Point};

const SCRATCH_BUF_CAPACITY: usize = 4096;

/// Request encoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RequestError {
    /// A single point encodes to more than the maximum body size, so no chunking can make it fit.
    #[snafu(display(
        "PayloadTooLarge: point '{}' encodes to {} bytes, exceeding the maximum body size of {} bytes.",
        measurement,
        encoded_size,
        limit
    ))]
    PointTooLarge {
        /// Measurement of the rejected point.
        measurement: String,

        /// Size of the encoded point, in bytes.
        encoded_size: usize,

        /// Configured maximum raw body size, in bytes.
        limit: usize,
    },
}

/// An encoded upload body.
#[derive(Clone, Debug)]
pub struct EncodedBody {
    /// Body bytes as sent, compressed if `gzipped` is set.
    pub payload: Bytes,

    /// Size of the body before compression.
    pub raw_size: usize,

    /// Whether `payload` is gzip-compressed.
    pub gzipped: bool,

    /// Number of points encoded in the body.
    pub point_count: usize,
}

/// Bodies produced from one flush, plus any points that could not be encoded.
#[derive(Debug, Default)]
pub(crate) struct EncodedRequests {
    pub bodies: Vec<EncodedBody>,
    pub rejected: Vec<RequestError>,
}

/// Splits points into line protocol bodies no larger than the maximum raw body size.
pub(crate) struct RequestBuilder {
    max_raw_body_size: usize,
    gzip_min_size: usize,
    scratch: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(max_raw_body_size: usize, gzip_min_size: usize) -> Self {
        Self {
            max_raw_body_size: max_raw_body_size.max(1),
            gzip_min_size,
            scratch: Vec::with_capacity(SCRATCH_BUF_CAPACITY),
        }
    }

    /// Encodes `points` in order into one or more bodies.
    ///
    /// # Errors
    ///
    /// If compressing a body fails, an error is returned and nothing from this flush should be sent.
    pub async fn build(&mut self, points: &[Point]) -> io::Result<EncodedRequests> {
        let mut requests = EncodedRequests::default();
        let mut body = Vec::new();
        let mut body_points = 0;

        for point in points {
            self.scratch.clear();
            write_line_protocol(point, &mut self.scratch);
            self.scratch.push(b'\n');

            if self.scratch.len() > self.max_raw_body_size {
                requests.rejected.push(RequestError::PointTooLarge {
                    measurement: point.measurement().to_string(),
                    encoded_size: self.scratch.len(),
                    limit: self.max_raw_body_size,
                });
                continue;
            }

            if body.len() + self.scratch.len() > self.max_raw_body_size {
                let full = std::mem::take(&mut body);
                requests.bodies.push(self.finish(full, body_points).await?);
                body_points = 0;
            }

            body.extend_from_slice(&self.scratch);
            body_points += 1;
        }

        if body_points > 0 {
            requests.bodies.push(self.finish(body, body_points).await?);
        }

        Ok(requests)
    }

    async fn finish(&self, raw: Vec<u8>, point_count: usize) -> io::Result<EncodedBody> {
        let raw_size = raw.len();
        if raw_size < self.gzip_min_size {
            return Ok(EncodedBody {
                payload: Bytes::from(raw),
                raw_size,
                gzipped: false,
                point_count,
            });
        }

        let mut encoder = GzipEncoder::new(Vec::with_capacity(raw_size / 4));
        encoder.write_all(&raw).await?;
        encoder.shutdown().await?;
        let compressed = encoder.into_inner();
        trace!(raw_size, compressed_size = compressed.len(), "Compressed request body.");

        Ok(EncodedBody {
            payload: Bytes::from(compressed),
            raw_size,
            gzipped: true,
            point_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_compression::tokio::bufread::GzipDecoder;
    use tokio::io::AsyncReadExt as _;

    use super::*;
    use crate::point::Category;

    fn point(seq: i64) -> Point {
        Point::builder("cpu", Category::Metric)
            .tag("host", "h1")
            .field("seq", seq)
            .timestamp_ns(1_000 + seq)
            .build()
            .unwrap()
    }

    fn encoded_len(point: &Point) -> usize {
        let mut buf = Vec::new();
        write_line_protocol(point, &mut buf);
        buf.len() + 1
    }

    #[tokio::test]
    async fn small_flush_is_one_plain_body() {
        let mut builder = RequestBuilder::new(10_000, 1024);
        let points = vec![point(1), point(2)];
        let requests = builder.build(&points).await.unwrap();

        assert!(requests.rejected.is_empty());
        assert_eq!(requests.bodies.len(), 1);

        let body = &requests.bodies[0];
        assert!(!body.gzipped);
        assert_eq!(body.point_count, 2);
        assert_eq!(
            std::str::from_utf8(&body.payload).unwrap(),
            "cpu,host=h1 seq=1i 1001\ncpu,host=h1 seq=2i 1002\n"
        );
    }

    #[tokio::test]
    async fn large_flush_is_chunked_under_limit_in_order() {
        let points: Vec<_> = (0..10).map(point).collect();
        let line = encoded_len(&points[0]);
        let mut builder = RequestBuilder::new(line * 3, usize::MAX);

        let requests = builder.build(&points).await.unwrap();
        assert_eq!(requests.bodies.len(), 4);
        assert!(requests.bodies.iter().all(|b| b.raw_size <= line * 3));
        assert_eq!(requests.bodies.iter().map(|b| b.point_count).sum::<usize>(), 10);

        let joined: String = requests
            .bodies
            .iter()
            .map(|b| std::str::from_utf8(&b.payload).unwrap().to_string())
            .collect();
        let seqs: Vec<_> = joined
            .lines()
            .map(|l| l.split(' ').nth(1).unwrap().to_string())
            .collect();
        let expected: Vec<_> = (0..10).map(|i| format!("seq={}i", i)).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn oversized_point_is_rejected_and_others_kept() {
        let big = Point::builder("log", Category::Logging)
            .field("message", "x".repeat(512))
            .timestamp_ns(1)
            .build()
            .unwrap();
        let small = point(1);
        let limit = encoded_len(&small) * 2;
        let mut builder = RequestBuilder::new(limit, usize::MAX);

        let requests = builder.build(&[small, big]).await.unwrap();
        assert_eq!(requests.bodies.len(), 1);
        assert_eq!(requests.bodies[0].point_count, 1);
        assert!(matches!(
            &requests.rejected[..],
            [RequestError::PointTooLarge { measurement, .. }] if measurement == "log"
        ));
    }

    #[tokio::test]
    async fn bodies_above_threshold_are_gzipped() {
        let points: Vec<_> = (0..50).map(point).collect();
        let mut builder = RequestBuilder::new(1_000_000, 64);

        let requests = builder.build(&points).await.unwrap();
        let body = &requests.bodies[0];
        assert!(body.gzipped);
        assert!(body.payload.len() < body.raw_size);

        let mut decoder = GzipDecoder::new(&body.payload[..]);
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).await.unwrap();
        assert_eq!(raw.len(), body.raw_size);
        assert_eq!(raw.lines().count(), 50);
    }
}
