use std::collections::HashSet;

use nom::{
    bytes::complete::{tag, take_till1, take_while, take_while1},
    character::complete::{char, i64 as parse_i64, satisfy, space0, space1},
    combinator::{all_consuming, map_res, opt, recognize},
    error::{Error, ErrorKind},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult, Parser as _,
};

use super::PushError;

const METRIC_TYPES: &[&str] = &["counter", "gauge", "histogram", "summary", "untyped"];

/// A single exposition sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Metric name, including any `_bucket`/`_sum`/`_count` suffix.
    pub name: String,

    /// Labels in exposition order.
    pub labels: Vec<(String, String)>,

    /// Sample value.
    pub value: f64,

    /// Timestamp in milliseconds since the Unix epoch, if the sample carried one.
    pub timestamp_ms: Option<i64>,
}

/// Parses a body in the Prometheus text exposition format.
///
/// `# HELP` lines and other comments are skipped. `# TYPE` lines are validated but otherwise carry no meaning here,
/// since histogram and summary series already spell out their suffixes and labels.
pub fn parse_text(body: &str) -> Result<Vec<Sample>, PushError> {
    let mut samples = Vec::new();
    let mut typed = HashSet::new();

    for (index, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let invalid = |reason: &str| PushError::InvalidBody {
            reason: format!("line {}: {}", index + 1, reason),
        };

        if let Some(comment) = line.strip_prefix('#') {
            if let Ok((_, (name, kind))) = type_line(comment) {
                if !METRIC_TYPES.contains(&kind) {
                    return Err(invalid(&format!("unknown metric type '{}'", kind)));
                }
                if !typed.insert(name.to_string()) {
                    return Err(invalid(&format!("second TYPE line for metric '{}'", name)));
                }
            }
            continue;
        }

        match sample_line(line) {
            Ok((_, sample)) => samples.push(sample),
            Err(_) => return Err(invalid(&format!("malformed sample '{}'", line))),
        }
    }

    Ok(samples)
}

fn type_line(input: &str) -> IResult<&str, (&str, &str)> {
    all_consuming(preceded(
        (space0, tag("TYPE"), space1),
        separated_pair(metric_name, space1, terminated(take_while1(|c: char| !c.is_whitespace()), space0)),
    ))
    .parse(input)
}

fn metric_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == ':'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':'),
    ))
    .parse(input)
}

fn label_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

/// A double-quoted label value with `\\`, `\"` and `\n` escapes.
fn label_value(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"').parse(input)?;
    let mut value = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(nom::Err::Error(Error::new(rest, ErrorKind::Char))),
            Some('"') => return Ok((&rest[1..], value)),
            Some('\\') => {
                match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(c @ ('\\' | '"')) => value.push(c),
                    _ => return Err(nom::Err::Error(Error::new(rest, ErrorKind::Escaped))),
                }
                rest = &rest[2..];
            }
            Some(c) => {
                value.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

fn label_pair(input: &str) -> IResult<&str, (String, String)> {
    separated_pair(
        preceded(space0, label_name),
        (space0, char('='), space0),
        label_value,
    )
    .map(|(name, value)| (name.to_string(), value))
    .parse(input)
}

fn labels(input: &str) -> IResult<&str, Vec<(String, String)>> {
    delimited(
        char('{'),
        terminated(
            separated_list0((space0, char(',')), label_pair),
            opt((space0, char(','))),
        ),
        (space0, char('}')),
    )
    .parse(input)
}

fn sample_value(input: &str) -> IResult<&str, f64> {
    map_res(take_till1(|c: char| c.is_whitespace()), |raw: &str| match raw {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => raw.parse::<f64>(),
    })
    .parse(input)
}

fn sample_line(input: &str) -> IResult<&str, Sample> {
    all_consuming((
        metric_name,
        opt(labels),
        preceded(space1, sample_value),
        opt(preceded(space1, parse_i64)),
        space0,
    ))
    .map(|(name, labels, value, timestamp_ms, _)| Sample {
        name: name.to_string(),
        labels: labels.unwrap_or_default(),
        value,
        timestamp_ms,
    })
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_of(sample: &Sample) -> Vec<(&str, &str)> {
        sample.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    #[test]
    fn parses_exposition_body() {
        let body = "\
# HELP http_requests_total The total number of HTTP requests.
# TYPE http_requests_total counter
http_requests_total{method=\"post\",code=\"200\"} 1027 1395066363000
http_requests_total{method=\"post\",code=\"400\"}    3 1395066363000

# A plain comment.
metric_without_timestamp_and_labels 12.47
msdos_file_access_time_seconds{path=\"C:\\\\DIR\\\\FILE.TXT\",error=\"Cannot find file:\\n\\\"FILE.TXT\\\"\"} 1.458255915e9
";
        let samples = parse_text(body).unwrap();
        assert_eq!(samples.len(), 4);

        assert_eq!(samples[0].name, "http_requests_total");
        assert_eq!(labels_of(&samples[0]), vec![("method", "post"), ("code", "200")]);
        assert_eq!(samples[0].value, 1027.0);
        assert_eq!(samples[0].timestamp_ms, Some(1395066363000));
        assert_eq!(samples[1].value, 3.0);

        assert!(samples[2].labels.is_empty());
        assert_eq!(samples[2].timestamp_ms, None);

        assert_eq!(
            labels_of(&samples[3]),
            vec![("path", "C:\\DIR\\FILE.TXT"), ("error", "Cannot find file:\n\"FILE.TXT\"")]
        );
        assert_eq!(samples[3].value, 1.458255915e9);
    }

    #[test]
    fn special_values_and_trailing_commas() {
        let body = "a_bucket{le=\"+Inf\",} +Inf\nb -Inf\nc NaN\nd{ x = \"1\" , y=\"\" } -0.5 -10\n";
        let samples = parse_text(body).unwrap();
        assert_eq!(samples[0].value, f64::INFINITY);
        assert_eq!(labels_of(&samples[0]), vec![("le", "+Inf")]);
        assert_eq!(samples[1].value, f64::NEG_INFINITY);
        assert!(samples[2].value.is_nan());
        assert_eq!(labels_of(&samples[3]), vec![("x", "1"), ("y", "")]);
        assert_eq!(samples[3].value, -0.5);
        assert_eq!(samples[3].timestamp_ms, Some(-10));
    }

    #[test]
    fn malformed_lines_are_rejected_with_line_numbers() {
        for (body, line) in [
            ("ok 1\nbroken\n", 2),
            ("9starts_with_digit 1\n", 1),
            ("m{label=unquoted} 1\n", 1),
            ("m{label=\"unterminated} 1\n", 1),
            ("m 1 not_a_timestamp\n", 1),
            ("m abc\n", 1),
            ("# TYPE m bogus\nm 1\n", 1),
            ("# TYPE m gauge\n# TYPE m counter\n", 2),
        ] {
            match parse_text(body) {
                Err(PushError::InvalidBody { reason }) => {
                    assert!(reason.starts_with(&format!("line {}:", line)), "{:?} gave {}", body, reason)
                }
                other => panic!("{:?} should be rejected, got {:?}", body, other),
            }
        }
    }
}
