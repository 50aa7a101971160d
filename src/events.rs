//! DataDog event lines (`_e{...}`).
//!
//! Events bypass the aggregation caches entirely: a parsed event is emitted
//! through the sink immediately, under its title as the measurement name.
//! Parse failures are logged by the worker and never abort a batch.

use chrono::{DateTime, TimeZone, Utc};
use snafu::Snafu;
use std::collections::HashMap;

use crate::metric::{FieldValue, TagMap};
use crate::parser::parse_datadog_tags;
use crate::sink::MetricSink;

const PRIORITY_NORMAL: &str = "normal";
const PRIORITY_LOW: &str = "low";

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum EventError {
    #[snafu(display("invalid event message format: {message}"))]
    Malformed { message: String },

    #[snafu(display("invalid event message format: empty title or text"))]
    EmptyTitleOrText,

    #[snafu(display("too short metadata field: {field}"))]
    ShortMetadataField { field: String },

    #[snafu(display("unknown metadata type: {field}"))]
    UnknownMetadataField { field: String },
}

/// Parses one `_e{<title len>,<text len>}:<title>|<text>|...` line and emits
/// it through the sink. `source_address` becomes the `source` tag unless the
/// event carries its own `h:` hostname.
pub fn parse_event_line(
    now: DateTime<Utc>,
    line: &str,
    source_address: &str,
    sink: &dyn MetricSink,
) -> Result<(), EventError> {
    let (header, body) = match line.split_once(':') {
        Some((header, body)) if header.len() >= 7 && body.len() >= 3 => (header, body),
        _ => return MalformedSnafu { message: line }.fail(),
    };

    // The header is `_e{<title len>,<text len>}`.
    let (title_len, text_len) = {
        let inner = &header[3..];
        let (title_raw, text_raw) = inner
            .split_once(',')
            .ok_or_else(|| EventError::Malformed {
                message: line.to_owned(),
            })?;
        let title_len: usize = title_raw.parse().map_err(|_| EventError::Malformed {
            message: format!("could not parse title length {title_raw:?}"),
        })?;
        let text_raw = text_raw.strip_suffix('}').ok_or_else(|| EventError::Malformed {
            message: line.to_owned(),
        })?;
        let text_len: usize = text_raw.parse().map_err(|_| EventError::Malformed {
            message: format!("could not parse text length {text_raw:?}"),
        })?;
        (title_len, text_len)
    };

    // Subtraction-free bounds check: the declared lengths come straight off
    // the wire and must not overflow the sum.
    if body.len() < title_len || body.len() - title_len <= text_len {
        return MalformedSnafu {
            message: "message too short",
        }
        .fail();
    }
    let title = body.get(..title_len).ok_or(EventError::EmptyTitleOrText)?;
    let text = body
        .get(title_len + 1..title_len + 1 + text_len)
        .ok_or(EventError::EmptyTitleOrText)?;
    let metadata = body.get(title_len + 1 + text_len..).unwrap_or_default();
    if title.is_empty() || text.is_empty() {
        return EmptyTitleOrTextSnafu.fail();
    }

    let mut fields: HashMap<String, FieldValue> = HashMap::new();
    fields.insert("alert_type".to_owned(), FieldValue::from("info"));
    fields.insert(
        "text".to_owned(),
        FieldValue::Text(text.replace("\\n", "\n")),
    );
    fields.insert("priority".to_owned(), FieldValue::from(PRIORITY_NORMAL));

    let mut tags = TagMap::new();
    if !source_address.is_empty() {
        // `host` is commonly reserved downstream, so the peer goes in `source`.
        tags.insert("source".to_owned(), source_address.to_owned());
    }

    let mut timestamp = now;

    if metadata.len() >= 2 {
        for segment in metadata.get(1..).unwrap_or_default().split('|') {
            if segment.len() < 2 {
                return ShortMetadataFieldSnafu { field: segment }.fail();
            }
            match &segment.as_bytes()[..2] {
                b"d:" => {
                    if let Ok(seconds) = segment[2..].parse::<i64>() {
                        if let Some(parsed) = Utc.timestamp_opt(seconds, 0).single() {
                            timestamp = parsed;
                        }
                    }
                }
                b"p:" => match &segment[2..] {
                    PRIORITY_LOW => {
                        fields.insert("priority".to_owned(), FieldValue::from(PRIORITY_LOW));
                    }
                    PRIORITY_NORMAL => {}
                    _ => continue,
                },
                b"h:" => {
                    tags.insert("source".to_owned(), segment[2..].to_owned());
                }
                b"t:" => match &segment[2..] {
                    kind @ ("error" | "warning" | "success" | "info") => {
                        fields.insert("alert_type".to_owned(), FieldValue::from(kind));
                    }
                    _ => continue,
                },
                b"k:" => {
                    tags.insert("aggregation_key".to_owned(), segment[2..].to_owned());
                }
                b"s:" => {
                    fields.insert(
                        "source_type_name".to_owned(),
                        FieldValue::Text(segment[2..].to_owned()),
                    );
                }
                _ => {
                    if let Some(taglist) = segment.strip_prefix('#') {
                        parse_datadog_tags(&mut tags, taglist);
                    } else {
                        return UnknownMetadataFieldSnafu { field: segment }.fail();
                    }
                }
            }
        }
    }

    sink.add_fields(title, fields, tags, timestamp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;

    fn parse(line: &str) -> Result<CollectingSink, EventError> {
        let sink = CollectingSink::new();
        parse_event_line(Utc::now(), line, "10.0.0.1", &sink)?;
        Ok(sink)
    }

    #[test]
    fn minimal_event() {
        let sink = parse("_e{5,4}:title|text").unwrap();
        let records = sink.take_records();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.measurement, "title");
        assert_eq!(record.fields.get("text").unwrap(), &FieldValue::from("text"));
        assert_eq!(
            record.fields.get("alert_type").unwrap(),
            &FieldValue::from("info")
        );
        assert_eq!(
            record.fields.get("priority").unwrap(),
            &FieldValue::from("normal")
        );
        assert_eq!(record.tags.get("source").unwrap(), "10.0.0.1");
    }

    #[test]
    fn event_with_all_metadata() {
        let sink = parse(
            "_e{5,4}:title|text|d:1725000000|p:low|h:web01|t:error|k:checkout|s:nagios|#env:prod,canary",
        )
        .unwrap();
        let records = sink.take_records();
        let record = &records[0];

        assert_eq!(
            record.fields.get("priority").unwrap(),
            &FieldValue::from("low")
        );
        assert_eq!(
            record.fields.get("alert_type").unwrap(),
            &FieldValue::from("error")
        );
        assert_eq!(
            record.fields.get("source_type_name").unwrap(),
            &FieldValue::from("nagios")
        );
        assert_eq!(record.tags.get("source").unwrap(), "web01");
        assert_eq!(record.tags.get("aggregation_key").unwrap(), "checkout");
        assert_eq!(record.tags.get("env").unwrap(), "prod");
        assert_eq!(record.tags.get("canary").unwrap(), "true");
        assert_eq!(record.timestamp.timestamp(), 1_725_000_000);
    }

    #[test]
    fn escaped_newlines_are_unescaped() {
        let sink = parse("_e{5,9}:title|line1\\nx2").unwrap();
        let records = sink.take_records();
        assert_eq!(
            records[0].fields.get("text").unwrap(),
            &FieldValue::Text("line1\nx2".to_owned())
        );
    }

    #[test]
    fn unknown_priority_and_alert_type_fall_back_to_defaults() {
        let sink = parse("_e{5,4}:title|text|p:urgent|t:panic").unwrap();
        let records = sink.take_records();
        assert_eq!(
            records[0].fields.get("priority").unwrap(),
            &FieldValue::from("normal")
        );
        assert_eq!(
            records[0].fields.get("alert_type").unwrap(),
            &FieldValue::from("info")
        );
    }

    #[test]
    fn rejects_malformed_events() {
        assert!(matches!(parse("_e"), Err(EventError::Malformed { .. })));
        assert!(matches!(
            parse("_e{x,4}:title|text"),
            Err(EventError::Malformed { .. })
        ));
        assert!(matches!(
            parse("_e{50,4}:title|text"),
            Err(EventError::Malformed { .. })
        ));
        // Declared lengths near usize::MAX must error, not overflow.
        assert!(matches!(
            parse("_e{18446744073709551615,5}:title|text"),
            Err(EventError::Malformed { .. })
        ));
        assert!(matches!(
            parse("_e{5,18446744073709551615}:title|text"),
            Err(EventError::Malformed { .. })
        ));
        assert!(matches!(
            parse("_e{5,4}:title|text|q"),
            Err(EventError::ShortMetadataField { .. })
        ));
        assert!(matches!(
            parse("_e{5,4}:title|text|wat:ever"),
            Err(EventError::UnknownMetadataField { .. })
        ));
    }
}
