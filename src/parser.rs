//! StatsD line protocol parser.
//!
//! Turns one trimmed line into typed [`Sample`]s. A line may carry several
//! values for one bucket (`cpu:1|c:2|c`), and when the DataDog extensions
//! are enabled, `#tag` and `c:<container id>` pipe segments are consumed
//! before value parsing.

use smallvec::SmallVec;
use snafu::Snafu;
use tracing::{debug, error};

use crate::metric::{MetricType, Sample, SampleValue, TagMap};

/// Parser switches derived from the service configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub datadog_extensions: bool,
    pub datadog_keep_container_tag: bool,
}

/// Line-level parse failure. Logged by the worker and dropped; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ParseError {
    #[snafu(display("splitting ':', unable to parse metric: {line}"))]
    MissingValueSeparator { line: String },

    #[snafu(display("splitting '|', unable to parse metric: {component}"))]
    MalformedComponent { component: String },

    #[snafu(display("metric type {symbol:?} unsupported"))]
    UnsupportedMetricType { symbol: String },

    #[snafu(display("+- values are only supported for gauges and counters: {component}"))]
    MisplacedSign { component: String },

    #[snafu(display("unable to parse {value:?} as a number"))]
    MalformedValue { value: String },
}

/// Parses one StatsD line into samples, one per `:`-separated value.
pub fn parse_line(line: &str, options: ParseOptions) -> Result<SmallVec<[Sample; 1]>, ParseError> {
    let mut line_tags = TagMap::new();
    let stripped;
    let line = if options.datadog_extensions {
        stripped = strip_datadog_segments(line, options, &mut line_tags);
        stripped.as_str()
    } else {
        line
    };

    let mut bits = line.split(':');
    let bucket = bits.next().unwrap_or_default();
    let components: Vec<&str> = bits.collect();
    if components.is_empty() {
        return MissingValueSeparatorSnafu { line }.fail();
    }

    let mut samples = SmallVec::new();
    for component in components {
        let pipesplit: Vec<&str> = component.split('|').collect();
        if pipesplit.len() < 2 {
            return MalformedComponentSnafu { component }.fail();
        }

        let mut sample_rate = None;
        if let Some(&segment) = pipesplit.get(2) {
            if segment.len() > 1 && segment.starts_with('@') {
                match segment[1..].parse::<f64>() {
                    Ok(rate) => sample_rate = Some(rate),
                    Err(error) => {
                        // Bad rates are ignored, not rejected; the value
                        // still counts, just unscaled.
                        error!(message = "Parsing sample rate failed.", segment, %error);
                    }
                }
            } else {
                debug!(
                    message = "Sample rate must be in a format like @0.1; ignoring.",
                    segment
                );
            }
        }

        let raw = pipesplit[0];
        let symbol = pipesplit[1];
        let mtype = MetricType::from_symbol(symbol)
            .ok_or_else(|| ParseError::UnsupportedMetricType {
                symbol: symbol.to_owned(),
            })?;

        let additive = raw.starts_with('+') || raw.starts_with('-');
        if additive && !matches!(mtype, MetricType::Gauge | MetricType::Counter) {
            return MisplacedSignSnafu { component }.fail();
        }

        let value = match mtype {
            MetricType::Gauge
            | MetricType::Timing
            | MetricType::Histogram
            | MetricType::Distribution => {
                let parsed = raw
                    .parse::<f64>()
                    .map_err(|_| ParseError::MalformedValue {
                        value: raw.to_owned(),
                    })?;
                SampleValue::Float(parsed)
            }
            MetricType::Counter => {
                let parsed = match raw.parse::<i64>() {
                    Ok(value) => value,
                    Err(_) => raw
                        .parse::<f64>()
                        .map_err(|_| ParseError::MalformedValue {
                            value: raw.to_owned(),
                        })? as i64,
                };
                let scaled = match sample_rate {
                    Some(rate) if rate != 0.0 => (parsed as f64 / rate).round() as i64,
                    _ => parsed,
                };
                SampleValue::Signed(scaled)
            }
            MetricType::Set => SampleValue::Text(raw.to_owned()),
        };

        samples.push(Sample {
            bucket: bucket.to_owned(),
            value,
            mtype,
            additive,
            sample_rate,
            line_tags: line_tags.clone(),
        });
    }

    Ok(samples)
}

/// Removes `#taglist` and `c:<id>` pipe segments from the line, collecting
/// their tags, and rebuilds the line without them.
fn strip_datadog_segments(line: &str, options: ParseOptions, tags: &mut TagMap) -> String {
    let mut kept = Vec::new();
    for segment in line.split('|') {
        if let Some(taglist) = segment.strip_prefix('#') {
            parse_datadog_tags(tags, taglist);
        } else if let Some(container_id) = segment.strip_prefix("c:") {
            if options.datadog_keep_container_tag {
                tags.insert("container".to_owned(), container_id.to_owned());
            }
        } else {
            kept.push(segment);
        }
    }
    kept.join("|")
}

/// Parses a DataDog tag list (`key:value,bare,other:x`). Bare keys and empty
/// values get the value `"true"`; tags with an empty key are dropped.
pub(crate) fn parse_datadog_tags(tags: &mut TagMap, list: &str) {
    for entry in list.split(',') {
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.split_once(':') {
            Some((key, value)) if !value.is_empty() => (key, value),
            Some((key, _)) => (key, "true"),
            None => (entry, "true"),
        };
        if !key.is_empty() {
            tags.insert(key.to_owned(), value.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datadog() -> ParseOptions {
        ParseOptions {
            datadog_extensions: true,
            datadog_keep_container_tag: false,
        }
    }

    fn single(line: &str, options: ParseOptions) -> Sample {
        let samples = parse_line(line, options).expect("line should parse");
        assert_eq!(samples.len(), 1, "expected exactly one sample");
        samples.into_iter().next().unwrap()
    }

    #[test]
    fn basic_counter() {
        let sample = single("foo:1|c", ParseOptions::default());
        assert_eq!(sample.bucket, "foo");
        assert_eq!(sample.mtype, MetricType::Counter);
        assert_eq!(sample.value, SampleValue::Signed(1));
        assert!(!sample.additive);
        assert_eq!(sample.sample_rate, None);
    }

    #[test]
    fn counter_sample_rate_scales_the_value() {
        let sample = single("users.online:1|c|@0.5", ParseOptions::default());
        assert_eq!(sample.value, SampleValue::Signed(2));
        assert_eq!(sample.sample_rate, Some(0.5));
    }

    #[test]
    fn zero_sample_rate_does_not_scale() {
        let sample = single("bar:2|c|@0", ParseOptions::default());
        assert_eq!(sample.value, SampleValue::Signed(2));
    }

    #[test]
    fn malformed_sample_rate_is_ignored() {
        let sample = single("bar:2|c|@banana", ParseOptions::default());
        assert_eq!(sample.value, SampleValue::Signed(2));
        assert_eq!(sample.sample_rate, None);
    }

    #[test]
    fn counter_float_values_truncate() {
        let sample = single("floats:3.75|c", ParseOptions::default());
        assert_eq!(sample.value, SampleValue::Signed(3));
    }

    #[test]
    fn signed_gauges_are_additive() {
        let plus = single("load:+5|g", ParseOptions::default());
        assert!(plus.additive);
        assert_eq!(plus.value, SampleValue::Float(5.0));

        let minus = single("load:-10|g", ParseOptions::default());
        assert!(minus.additive);
        assert_eq!(minus.value, SampleValue::Float(-10.0));

        let plain = single("load:42|g", ParseOptions::default());
        assert!(!plain.additive);
        assert_eq!(plain.value, SampleValue::Float(42.0));
    }

    #[test]
    fn sets_keep_the_raw_string() {
        let sample = single("users:alice|s", ParseOptions::default());
        assert_eq!(sample.mtype, MetricType::Set);
        assert_eq!(sample.value, SampleValue::Text("alice".to_owned()));
    }

    #[test]
    fn timings_histograms_and_distributions_parse_as_floats() {
        for (line, mtype) in [
            ("rt:320|ms", MetricType::Timing),
            ("rt:320|h", MetricType::Histogram),
            ("rt:320|d", MetricType::Distribution),
        ] {
            let sample = single(line, ParseOptions::default());
            assert_eq!(sample.mtype, mtype);
            assert_eq!(sample.value, SampleValue::Float(320.0));
        }
    }

    #[test]
    fn one_bucket_many_values() {
        let samples = parse_line("cpu:42|c:11|c:5|ms", ParseOptions::default()).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|sample| sample.bucket == "cpu"));
        assert_eq!(samples[0].value, SampleValue::Signed(42));
        assert_eq!(samples[1].value, SampleValue::Signed(11));
        assert_eq!(samples[2].value, SampleValue::Float(5.0));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            parse_line("no-colon-here", ParseOptions::default()),
            Err(ParseError::MissingValueSeparator { .. })
        ));
        assert!(matches!(
            parse_line("foo:1", ParseOptions::default()),
            Err(ParseError::MalformedComponent { .. })
        ));
        assert!(matches!(
            parse_line("foo:1|x", ParseOptions::default()),
            Err(ParseError::UnsupportedMetricType { .. })
        ));
        assert!(matches!(
            parse_line("foo:abc|g", ParseOptions::default()),
            Err(ParseError::MalformedValue { .. })
        ));
    }

    #[test]
    fn sign_prefix_only_for_gauges_and_counters() {
        assert!(parse_line("load:+5|g", ParseOptions::default()).is_ok());
        assert!(parse_line("hits:-3|c", ParseOptions::default()).is_ok());
        assert!(matches!(
            parse_line("rt:+100|ms", ParseOptions::default()),
            Err(ParseError::MisplacedSign { .. })
        ));
        assert!(matches!(
            parse_line("users:-x|s", ParseOptions::default()),
            Err(ParseError::MisplacedSign { .. })
        ));
    }

    #[test]
    fn datadog_tags_are_stripped_and_collected() {
        let sample = single("users.online:1|c|@0.5|#country:china,environment:production", datadog());
        assert_eq!(sample.value, SampleValue::Signed(2));
        assert_eq!(sample.line_tags.get("country").unwrap(), "china");
        assert_eq!(sample.line_tags.get("environment").unwrap(), "production");
    }

    #[test]
    fn datadog_bare_tags_get_a_true_value() {
        let sample = single("foo:1|c|#sometagwithnovalue,e:", datadog());
        assert_eq!(sample.line_tags.get("sometagwithnovalue").unwrap(), "true");
        assert_eq!(sample.line_tags.get("e").unwrap(), "true");
    }

    #[test]
    fn container_segment_honors_the_keep_switch() {
        let kept = single(
            "foo:1|c|c:83c0a99c0a54c0c187f461c7980e9b57f3f6a8b0c918c8d93df19a9de6f3fe1d",
            ParseOptions {
                datadog_extensions: true,
                datadog_keep_container_tag: true,
            },
        );
        assert_eq!(
            kept.line_tags.get("container").unwrap(),
            "83c0a99c0a54c0c187f461c7980e9b57f3f6a8b0c918c8d93df19a9de6f3fe1d"
        );

        let dropped = single("foo:1|c|c:83c0a99c", datadog());
        assert!(dropped.line_tags.is_empty());
    }

    #[test]
    fn datadog_segments_ignored_when_extensions_are_off() {
        let sample = single("foo:1|c|#country:china", ParseOptions::default());
        assert!(sample.line_tags.is_empty());
    }
}
