//! Declarative point filtering applied at flush time.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

use crate::point::{Category, Point};

/// Filter rule compilation error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum FilterError {
    /// A rule contained an invalid regular expression.
    #[snafu(display("Filter rule #{} has an invalid pattern '{}': {}", rule, pattern, source))]
    InvalidPattern {
        /// Position of the rule in the configured list.
        rule: usize,

        /// The offending pattern.
        pattern: String,

        /// Regex compilation error.
        source: regex::Error,
    },
}

/// What happens to a point matched by a rule.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Remove the point from the batch.
    Drop,

    /// Add or overwrite a tag.
    Tag {
        /// Tag key.
        key: String,

        /// Tag value.
        value: String,
    },
}

/// A filter rule as written in configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct FilterRuleConfig {
    /// Restricts the rule to one category.
    #[serde(default)]
    pub category: Option<Category>,

    /// Regular expression the measurement must match.
    #[serde(default)]
    pub measurement: Option<String>,

    /// Tags that must be present, each matching its regular expression.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Fields that must be present.
    #[serde(default)]
    pub fields: Vec<String>,

    /// Action taken on matching points.
    pub action: FilterAction,
}

#[derive(Debug)]
struct FilterRule {
    category: Option<Category>,
    measurement: Option<Regex>,
    tags: Vec<(String, Regex)>,
    fields: Vec<String>,
    action: FilterAction,
}

impl FilterRule {
    fn compile(rule: usize, config: &FilterRuleConfig) -> Result<Self, FilterError> {
        let measurement = config
            .measurement
            .as_deref()
            .map(|pattern| Regex::new(pattern).context(InvalidPattern { rule, pattern }))
            .transpose()?;

        let tags = config
            .tags
            .iter()
            .map(|(key, pattern)| {
                Regex::new(pattern)
                    .context(InvalidPattern { rule, pattern })
                    .map(|regex| (key.clone(), regex))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            category: config.category,
            measurement,
            tags,
            fields: config.fields.clone(),
            action: config.action.clone(),
        })
    }

    fn matches(&self, point: &Point) -> bool {
        if self.category.is_some_and(|category| category != point.category()) {
            return false;
        }

        if let Some(measurement) = &self.measurement {
            if !measurement.is_match(point.measurement()) {
                return false;
            }
        }

        let tags_match = self
            .tags
            .iter()
            .all(|(key, pattern)| point.tag(key).is_some_and(|value| pattern.is_match(value)));

        tags_match && self.fields.iter().all(|field| point.field(field).is_some())
    }
}

/// An ordered set of filter rules.
///
/// Rules are evaluated in order for every point. Every matching tag rule is applied; the first matching drop rule
/// removes the point and stops evaluation.
#[derive(Debug, Default)]
pub struct FilterEngine {
    rules: Vec<FilterRule>,
}

impl FilterEngine {
    /// Compiles the configured rules.
    ///
    /// # Errors
    ///
    /// If any rule contains an invalid regular expression, an error is returned.
    pub fn from_config(rules: &[FilterRuleConfig]) -> Result<Self, FilterError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| FilterRule::compile(i, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Returns `true` if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the rules to `points` in place, preserving the order of kept points.
    ///
    /// Returns the number of points dropped.
    pub fn apply(&self, points: &mut Vec<Point>) -> usize {
        if self.rules.is_empty() {
            return 0;
        }

        let before = points.len();
        points.retain_mut(|point| self.keep(point));
        before - points.len()
    }

    fn keep(&self, point: &mut Point) -> bool {
        for rule in &self.rules {
            if !rule.matches(point) {
                continue;
            }

            match &rule.action {
                FilterAction::Drop => return false,
                FilterAction::Tag { key, value } => point.set_tag(key, value),
            }
        }
        true
    }
}
