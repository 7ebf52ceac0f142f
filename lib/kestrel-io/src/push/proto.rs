//! Prometheus client data model (`io.prometheus.client`), as used by the delimited protobuf exposition format.

use bytes::Buf;
use prost::Message;

use super::{path::is_valid_label_name, text::Sample, PushError};

#[derive(Clone, PartialEq, Message)]
pub struct LabelPair {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Gauge {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Counter {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Quantile {
    #[prost(double, optional, tag = "1")]
    pub quantile: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Summary {
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub sample_sum: Option<f64>,
    #[prost(message, repeated, tag = "3")]
    pub quantile: Vec<Quantile>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Untyped {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Bucket {
    #[prost(uint64, optional, tag = "1")]
    pub cumulative_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub upper_bound: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub cumulative_count_float: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Histogram {
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: Option<u64>,
    #[prost(double, optional, tag = "4")]
    pub sample_count_float: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub sample_sum: Option<f64>,
    #[prost(message, repeated, tag = "3")]
    pub bucket: Vec<Bucket>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Metric {
    #[prost(message, repeated, tag = "1")]
    pub label: Vec<LabelPair>,
    #[prost(message, optional, tag = "2")]
    pub gauge: Option<Gauge>,
    #[prost(message, optional, tag = "3")]
    pub counter: Option<Counter>,
    #[prost(message, optional, tag = "4")]
    pub summary: Option<Summary>,
    #[prost(message, optional, tag = "5")]
    pub untyped: Option<Untyped>,
    #[prost(message, optional, tag = "7")]
    pub histogram: Option<Histogram>,
    #[prost(int64, optional, tag = "6")]
    pub timestamp_ms: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MetricFamily {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub help: Option<String>,
    #[prost(enumeration = "MetricType", optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(message, repeated, tag = "4")]
    pub metric: Vec<Metric>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    Counter = 0,
    Gauge = 1,
    Summary = 2,
    Untyped = 3,
    Histogram = 4,
    GaugeHistogram = 5,
}

/// Decodes a body of length-delimited `MetricFamily` messages into flat samples.
pub fn parse_delimited(mut body: &[u8]) -> Result<Vec<Sample>, PushError> {
    let mut samples = Vec::new();
    while body.has_remaining() {
        let family = MetricFamily::decode_length_delimited(&mut body).map_err(|e| PushError::InvalidBody {
            reason: format!("invalid protobuf metric family: {}", e),
        })?;
        expand_family(family, &mut samples)?;
    }
    Ok(samples)
}

fn expand_family(family: MetricFamily, samples: &mut Vec<Sample>) -> Result<(), PushError> {
    let name = family.name.unwrap_or_default();
    if name.is_empty() {
        return Err(PushError::InvalidBody {
            reason: "metric family without a name".to_string(),
        });
    }
    let kind = family
        .r#type
        .and_then(|t| MetricType::try_from(t).ok())
        .unwrap_or(MetricType::Untyped);

    for metric in family.metric {
        let labels = metric
            .label
            .into_iter()
            .map(|pair| {
                let label = pair.name.unwrap_or_default();
                if !is_valid_label_name(&label) {
                    return Err(PushError::InvalidBody {
                        reason: format!("metric '{}' has invalid label name '{}'", name, label),
                    });
                }
                Ok((label, pair.value.unwrap_or_default()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ts = metric.timestamp_ms;
        let mut emit = |suffix: &str, extra: Option<(&str, String)>, value: f64| {
            let mut labels = labels.clone();
            if let Some((key, value)) = extra {
                labels.push((key.to_string(), value));
            }
            samples.push(Sample {
                name: format!("{}{}", name, suffix),
                labels,
                value,
                timestamp_ms: ts,
            });
        };

        match kind {
            MetricType::Counter => {
                if let Some(value) = metric.counter.and_then(|c| c.value) {
                    emit("", None, value);
                }
            }
            MetricType::Gauge => {
                if let Some(value) = metric.gauge.and_then(|g| g.value) {
                    emit("", None, value);
                }
            }
            MetricType::Untyped => {
                if let Some(value) = metric.untyped.and_then(|u| u.value) {
                    emit("", None, value);
                }
            }
            MetricType::Summary => {
                let Some(summary) = metric.summary else { continue };
                for quantile in &summary.quantile {
                    if let (Some(q), Some(value)) = (quantile.quantile, quantile.value) {
                        emit("", Some(("quantile", format_float(q))), value);
                    }
                }
                emit("_sum", None, summary.sample_sum.unwrap_or_default());
                emit("_count", None, summary.sample_count.unwrap_or_default() as f64);
            }
            MetricType::Histogram | MetricType::GaugeHistogram => {
                let Some(histogram) = metric.histogram else { continue };
                let count = histogram
                    .sample_count_float
                    .unwrap_or(histogram.sample_count.unwrap_or_default() as f64);

                let mut saw_inf = false;
                for bucket in &histogram.bucket {
                    let Some(upper) = bucket.upper_bound else { continue };
                    saw_inf |= upper == f64::INFINITY;
                    let cumulative = bucket
                        .cumulative_count_float
                        .unwrap_or(bucket.cumulative_count.unwrap_or_default() as f64);
                    emit("_bucket", Some(("le", format_float(upper))), cumulative);
                }
                if !saw_inf {
                    emit("_bucket", Some(("le", "+Inf".to_string())), count);
                }
                emit("_sum", None, histogram.sample_sum.unwrap_or_default());
                emit("_count", None, count);
            }
        }
    }
    Ok(())
}

/// Formats a float the way the text exposition format spells it.
pub fn format_float(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if value.is_nan() {
        "NaN".to_string()
    } else {
        value.to_string()
    }
}
