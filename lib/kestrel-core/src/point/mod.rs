//! Points and their categories.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

mod line_protocol;
pub use self::line_protocol::write_line_protocol;

/// Data-kind classification of a point.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Time series metrics.
    Metric,

    /// Host and resource object snapshots.
    Object,

    /// User-defined object snapshots.
    #[serde(rename = "custom_object")]
    CustomObject,

    /// Log records.
    Logging,

    /// Trace spans.
    Tracing,

    /// Discrete events.
    KeyEvent,

    /// Network flow data.
    Network,

    /// Security findings.
    Security,

    /// Real user monitoring data.
    Rum,

    /// Profiling data.
    Profiling,
}

impl Category {
    /// Every category, in index order.
    pub const ALL: [Category; 10] = [
        Category::Metric,
        Category::Object,
        Category::CustomObject,
        Category::Logging,
        Category::Tracing,
        Category::KeyEvent,
        Category::Network,
        Category::Security,
        Category::Rum,
        Category::Profiling,
    ];

    /// Returns the short name of the category.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Category::Metric => "metric",
            Category::Object => "object",
            Category::CustomObject => "custom_object",
            Category::Logging => "logging",
            Category::Tracing => "tracing",
            Category::KeyEvent => "keyevent",
            Category::Network => "network",
            Category::Security => "security",
            Category::Rum => "rum",
            Category::Profiling => "profiling",
        }
    }

    /// Returns the upload path for the category.
    pub const fn upload_path(&self) -> &'static str {
        match self {
            Category::Metric => "/v1/write/metric",
            Category::Object => "/v1/write/object",
            Category::CustomObject => "/v1/write/custom_object",
            Category::Logging => "/v1/write/logging",
            Category::Tracing => "/v1/write/tracing",
            Category::KeyEvent => "/v1/write/keyevent",
            Category::Network => "/v1/write/network",
            Category::Security => "/v1/write/security",
            Category::Rum => "/v1/write/rum",
            Category::Profiling => "/v1/write/profiling",
        }
    }

    /// Returns the position of the category within [`Category::ALL`].
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a category name is not recognized.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown category '{}'.", name))]
pub struct UnknownCategory {
    /// The unrecognized name.
    pub name: String,
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == s || category.upload_path() == s)
            .ok_or_else(|| UnknownCategory { name: s.to_string() })
    }
}

/// A typed field value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Signed integer.
    Int(i64),

    /// Unsigned integer.
    UInt(u64),

    /// Floating-point number.
    Float(f64),

    /// Boolean.
    Bool(bool),

    /// String.
    String(String),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UInt(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// Point construction error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PointError {
    /// The measurement name was empty.
    #[snafu(display("Measurement name must not be empty."))]
    EmptyMeasurement,

    /// No fields were given.
    #[snafu(display("Point '{}' has no fields.", measurement))]
    NoFields {
        /// Measurement of the rejected point.
        measurement: String,
    },

    /// A float field was NaN or infinite.
    #[snafu(display("Field '{}' of point '{}' is not a finite number.", field, measurement))]
    NonFiniteField {
        /// Measurement of the rejected point.
        measurement: String,

        /// Name of the offending field.
        field: String,
    },
}

/// A single timestamped, tagged observation.
///
/// Points are immutable once built, apart from tag adjustments made by the pipeline itself (global tags and filter
/// rules).
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    measurement: String,
    category: Category,
    tags: BTreeMap<String, String>,
    fields: IndexMap<String, FieldValue>,
    timestamp_ns: i64,
}

impl Point {
    /// Starts building a point.
    pub fn builder<S: Into<String>>(measurement: S, category: Category) -> PointBuilder {
        PointBuilder {
            measurement: measurement.into(),
            category,
            tags: BTreeMap::new(),
            fields: IndexMap::new(),
            timestamp_ns: None,
        }
    }

    /// Returns the measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Returns the category.
    pub fn category(&self) -> Category {
        self.category
    }

    /// Returns the tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Returns the value of the given tag, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Returns the fields, in insertion order.
    pub fn fields(&self) -> &IndexMap<String, FieldValue> {
        &self.fields
    }

    /// Returns the value of the given field, if present.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Returns the timestamp, in nanoseconds since the Unix epoch.
    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    pub(crate) fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.insert(key.to_string(), value.to_string());
    }

    pub(crate) fn insert_tag_if_absent(&mut self, key: &str, value: &str) {
        if !self.tags.contains_key(key) {
            self.tags.insert(key.to_string(), value.to_string());
        }
    }
}

/// Builder for [`Point`].
#[derive(Debug)]
pub struct PointBuilder {
    measurement: String,
    category: Category,
    tags: BTreeMap<String, String>,
    fields: IndexMap<String, FieldValue>,
    timestamp_ns: Option<i64>,
}

impl PointBuilder {
    /// Adds a tag. A later tag with the same key replaces the earlier one.
    pub fn tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds every tag from the iterator.
    pub fn tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    /// Adds a field. A later field with the same key replaces the earlier one.
    pub fn field<K: Into<String>, V: Into<FieldValue>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Sets the timestamp, in nanoseconds since the Unix epoch.
    ///
    /// Defaults to the time [`build`][Self::build] is called.
    pub fn timestamp_ns(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = Some(timestamp_ns);
        self
    }

    /// Builds the point.
    ///
    /// # Errors
    ///
    /// If the measurement is empty, no fields were added, or a float field is not finite, an error is returned.
    pub fn build(self) -> Result<Point, PointError> {
        if self.measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }

        if self.fields.is_empty() {
            return Err(PointError::NoFields {
                measurement: self.measurement,
            });
        }

        let non_finite = self
            .fields
            .iter()
            .find(|(_, value)| matches!(value, FieldValue::Float(f) if !f.is_finite()))
            .map(|(key, _)| key.clone());
        if let Some(field) = non_finite {
            return Err(PointError::NonFiniteField {
                measurement: self.measurement,
                field,
            });
        }

        Ok(Point {
            measurement: self.measurement,
            category: self.category,
            tags: self.tags,
            fields: self.fields,
            timestamp_ns: self.timestamp_ns.unwrap_or_else(unix_now_ns),
        })
    }
}

/// Returns the current time, in nanoseconds since the Unix epoch.
pub fn unix_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_short_name_and_upload_path() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
            assert_eq!(category.upload_path().parse::<Category>().unwrap(), category);
        }
        assert!("metrics".parse::<Category>().is_err());
    }

    #[test]
    fn category_index_matches_position() {
        for (i, category) in Category::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn category_serde_uses_short_name() {
        let parsed: Vec<Category> = serde_yaml::from_str("[metric, custom_object, keyevent, rum]").unwrap();
        assert_eq!(
            parsed,
            vec![Category::Metric, Category::CustomObject, Category::KeyEvent, Category::Rum]
        );
    }

    #[test]
    fn tags_are_last_write_wins() {
        let point = Point::builder("cpu", Category::Metric)
            .tag("host", "a")
            .tag("host", "b")
            .field("usage", 1.5)
            .build()
            .unwrap();
        assert_eq!(point.tag("host"), Some("b"));
        assert_eq!(point.tags().len(), 1);
    }

    #[test]
    fn point_requires_fields() {
        let err = Point::builder("cpu", Category::Metric).build().unwrap_err();
        assert!(matches!(err, PointError::NoFields { .. }));
    }

    #[test]
    fn point_requires_measurement() {
        let err = Point::builder("", Category::Metric).field("x", 1i64).build().unwrap_err();
        assert!(matches!(err, PointError::EmptyMeasurement));
    }

    #[test]
    fn point_rejects_non_finite_floats() {
        let err = Point::builder("cpu", Category::Metric)
            .field("ok", 1.0)
            .field("bad", f64::NAN)
            .build()
            .unwrap_err();
        match err {
            PointError::NonFiniteField { field, .. } => assert_eq!(field, "bad"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let point = Point::builder("cpu", Category::Metric)
            .field("usage", 1i64)
            .timestamp_ns(42)
            .build()
            .unwrap();
        assert_eq!(point.timestamp_ns(), 42);
    }

    #[test]
    fn pipeline_tag_helpers() {
        let mut point = Point::builder("cpu", Category::Metric)
            .tag("host", "a")
            .field("usage", 1i64)
            .build()
            .unwrap();

        point.insert_tag_if_absent("host", "global");
        point.insert_tag_if_absent("env", "prod");
        assert_eq!(point.tag("host"), Some("a"));
        assert_eq!(point.tag("env"), Some("prod"));

        point.set_tag("host", "rewritten");
        assert_eq!(point.tag("host"), Some("rewritten"));
    }
}
