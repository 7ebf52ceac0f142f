use std::collections::BTreeMap;

use indexmap::IndexMap;
use kestrel_core::{
    point::{Category, Point},
    pooling::{PointBuffer, PointPool},
};
use snafu::ResultExt as _;

use super::{path::GroupingKey, text::Sample, InvalidPoint, PushError};

/// How pushed metric names map onto measurements and fields.
#[derive(Clone, Debug, Default)]
pub struct Naming {
    /// Prepended to every measurement.
    pub measurement_prefix: Option<String>,

    /// Measurement used for every sample, with the full metric name as the field.
    pub measurement_name: Option<String>,
}

impl Naming {
    fn split<'a>(&'a self, metric: &'a str) -> (String, &'a str) {
        let (measurement, field) = match self.measurement_name.as_deref() {
            Some(name) => (name, metric),
            None => match metric.split_once('_') {
                Some((measurement, field)) if !measurement.is_empty() && !field.is_empty() => (measurement, field),
                _ => (metric, metric),
            },
        };

        let measurement = match self.measurement_prefix.as_deref() {
            Some(prefix) => format!("{}{}", prefix, measurement),
            None => measurement.to_string(),
        };
        (measurement, field)
    }
}

type SeriesKey = (String, BTreeMap<String, String>, i64);

/// Result of converting one push.
pub struct Converted {
    /// Points to feed.
    pub points: PointBuffer,

    /// Samples dropped because their value was NaN or infinite.
    pub skipped: usize,
}

/// Converts samples into metric points.
///
/// Each sample is tagged with its own labels, then the job, then the path labels, so the grouping key wins over
/// labels in the body. Labels with empty values are left out, and an empty path label also removes the body label of
/// the same name. Samples sharing a measurement, tag set and timestamp become one point with several fields.
/// Samples without a timestamp are stamped with `now_ns`.
pub fn convert_samples(
    samples: Vec<Sample>, key: &GroupingKey, naming: &Naming, pool: &PointPool, now_ns: i64,
) -> Result<Converted, PushError> {
    let mut series: IndexMap<SeriesKey, IndexMap<String, f64>> = IndexMap::new();
    let mut skipped = 0;

    for sample in samples {
        if !sample.value.is_finite() {
            skipped += 1;
            continue;
        }

        let (measurement, field) = naming.split(&sample.name);
        // An empty label value means the label is absent.
        let mut tags = sample
            .labels
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .cloned()
            .collect::<BTreeMap<_, _>>();
        tags.insert("job".to_string(), key.job.clone());
        for (k, v) in &key.labels {
            if v.is_empty() {
                tags.remove(k);
            } else {
                tags.insert(k.clone(), v.clone());
            }
        }

        let timestamp_ns = sample
            .timestamp_ms
            .map_or(now_ns, |ms| ms.saturating_mul(1_000_000));

        series
            .entry((measurement, tags, timestamp_ns))
            .or_default()
            .insert(field.to_string(), sample.value);
    }

    let mut points = pool.acquire(series.len());
    for ((measurement, tags, timestamp_ns), fields) in series {
        let point = fields
            .into_iter()
            .fold(Point::builder(measurement, Category::Metric), |builder, (field, value)| {
                builder.field(field, value)
            })
            .tags(tags)
            .timestamp_ns(timestamp_ns)
            .build()
            .context(InvalidPoint)?;
        points.push(point);
    }

    Ok(Converted { points, skipped })
}

#[cfg(test)]
mod tests {
    use kestrel_core::point::{write_line_protocol, FieldValue};

    use super::*;

    fn sample(name: &str, labels: &[(&str, &str)], value: f64, timestamp_ms: Option<i64>) -> Sample {
        Sample {
            name: name.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            value,
            timestamp_ms,
        }
    }

    fn key(job: &str, labels: &[(&str, &str)]) -> GroupingKey {
        GroupingKey {
            job: job.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn splits_names_and_merges_series() {
        let pool = PointPool::new(4);
        let samples = vec![
            sample("cpu_usage", &[("core", "0")], 0.5, None),
            sample("cpu_idle", &[("core", "0")], 0.4, None),
            sample("cpu_usage", &[("core", "1")], 0.7, None),
            sample("uptime", &[], 42.0, Some(1_000)),
        ];

        let converted = convert_samples(samples, &key("node", &[]), &Naming::default(), &pool, 7).unwrap();
        let points = &converted.points;
        assert_eq!(points.len(), 3);

        assert_eq!(points[0].measurement(), "cpu");
        assert_eq!(points[0].tag("core"), Some("0"));
        assert_eq!(points[0].tag("job"), Some("node"));
        assert_eq!(points[0].field("usage"), Some(&FieldValue::Float(0.5)));
        assert_eq!(points[0].field("idle"), Some(&FieldValue::Float(0.4)));
        assert_eq!(points[0].timestamp_ns(), 7);

        assert_eq!(points[1].tag("core"), Some("1"));

        assert_eq!(points[2].measurement(), "uptime");
        assert_eq!(points[2].field("uptime"), Some(&FieldValue::Float(42.0)));
        assert_eq!(points[2].timestamp_ns(), 1_000_000_000);
    }

    #[test]
    fn naming_overrides() {
        let pool = PointPool::new(4);
        let naming = Naming {
            measurement_prefix: Some("push_".to_string()),
            measurement_name: Some("batch".to_string()),
        };
        let samples = vec![sample("jobs_processed_total", &[], 3.0, None)];

        let converted = convert_samples(samples, &key("etl", &[]), &naming, &pool, 1).unwrap();
        assert_eq!(converted.points[0].measurement(), "push_batch");
        assert_eq!(
            converted.points[0].field("jobs_processed_total"),
            Some(&FieldValue::Float(3.0))
        );

        let naming = Naming {
            measurement_prefix: Some("push_".to_string()),
            measurement_name: None,
        };
        let samples = vec![sample("_leading_underscore", &[], 1.0, None)];
        let converted = convert_samples(samples, &key("etl", &[]), &naming, &pool, 1).unwrap();
        assert_eq!(converted.points[0].measurement(), "push__leading_underscore");
        assert!(converted.points[0].field("_leading_underscore").is_some());
    }

    #[test]
    fn path_labels_override_body_labels() {
        let pool = PointPool::new(4);
        let samples = vec![sample("queue_depth", &[("instance", "body"), ("job", "body")], 5.0, None)];

        let converted = convert_samples(samples, &key("worker", &[("instance", "path")]), &Naming::default(), &pool, 1)
            .unwrap();
        let point = &converted.points[0];
        assert_eq!(point.tag("instance"), Some("path"));
        assert_eq!(point.tag("job"), Some("worker"));
    }

    #[test]
    fn empty_label_values_are_absent() {
        let pool = PointPool::new(4);
        let samples = vec![sample("up", &[("foo", ""), ("instance", "body"), ("zone", "a")], 1.0, Some(1))];

        let converted = convert_samples(samples, &key("batch", &[("instance", "")]), &Naming::default(), &pool, 1)
            .unwrap();
        let point = &converted.points[0];
        assert_eq!(point.tag("foo"), None);
        assert_eq!(point.tag("instance"), None);
        assert_eq!(point.tag("zone"), Some("a"));
        assert_eq!(point.tag("job"), Some("batch"));

        let mut buf = Vec::new();
        write_line_protocol(point, &mut buf);
        assert_eq!(String::from_utf8(buf).unwrap(), "up,job=batch,zone=a up=1.0 1000000");
    }

    #[test]
    fn non_finite_samples_are_skipped() {
        let pool = PointPool::new(4);
        let samples = vec![
            sample("a_b", &[], f64::NAN, None),
            sample("a_c", &[], f64::INFINITY, None),
            sample("a_d", &[], 1.0, None),
        ];

        let converted = convert_samples(samples, &key("j", &[]), &Naming::default(), &pool, 1).unwrap();
        assert_eq!(converted.skipped, 2);
        assert_eq!(converted.points.len(), 1);
        assert_eq!(converted.points[0].fields().len(), 1);
    }
}
