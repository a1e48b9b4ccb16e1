use crate::config::FieldType;
use crate::rules::LogRule;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A typed value destined for one sink column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
    Boolean(bool),
}

/// One fully mapped record, tagged with the table it belongs to.
///
/// Fields with no match in the parsed input are simply absent; the sink
/// inserts NULL for columns a record does not carry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub table: String,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Accepted datetime shapes, tried in order; first match wins.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Projects parsed fields onto the rule's target schema.
///
/// A field that fails coercion is dropped and logged; the record survives
/// with its remaining fields. A record that ends up with zero fields is
/// discarded by returning `None`. Pure function of its inputs.
pub fn apply_mappings(fields: &HashMap<String, String>, rule: &LogRule) -> Option<ParsedRecord> {
    let mut out = BTreeMap::new();
    for mapping in &rule.mappings {
        let Some(raw) = fields.get(&mapping.source_field) else {
            continue;
        };
        match coerce(raw, mapping.field_type) {
            Some(value) => {
                out.insert(mapping.target_field.clone(), value);
            }
            None => {
                debug!(
                    source_field = %mapping.source_field,
                    target_field = %mapping.target_field,
                    value = %raw,
                    "field coercion failed; dropping field"
                );
            }
        }
    }

    if out.is_empty() {
        return None;
    }
    Some(ParsedRecord {
        table: rule.table.clone(),
        fields: out,
    })
}

/// Converts one textual value to the declared target type. `None` means the
/// value could not be represented and the field should be omitted.
pub fn coerce(raw: &str, field_type: FieldType) -> Option<FieldValue> {
    match field_type {
        FieldType::String => Some(FieldValue::Text(raw.to_string())),
        FieldType::Int => raw.trim().parse::<i64>().ok().map(FieldValue::Integer),
        FieldType::Float => raw.trim().parse::<f64>().ok().map(FieldValue::Float),
        FieldType::Datetime => parse_datetime(raw.trim()).map(FieldValue::Timestamp),
        // Membership test, never fails: anything outside the truthy set is false.
        FieldType::Bool => {
            let lowered = raw.trim().to_ascii_lowercase();
            Some(FieldValue::Boolean(matches!(
                lowered.as_str(),
                "true" | "1" | "yes" | "y"
            )))
        }
    }
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::test_support::rule_set;
    use crate::rules::RuleSet;
    use chrono::{NaiveDate, Timelike};
    use std::path::Path;

    fn mapping_rules() -> RuleSet {
        rule_set(
            r"app\.log$",
            "app_logs",
            &[
                ("status", "response_status", FieldType::Int),
                ("ts", "log_time", FieldType::Datetime),
                ("secure", "is_secure", FieldType::Bool),
            ],
        )
    }

    fn rule(rules: &RuleSet) -> &crate::rules::LogRule {
        rules.match_path(Path::new("app.log")).expect("rule")
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn maps_declared_fields_and_drops_unmapped_ones() {
        let rules = mapping_rules();
        let record = apply_mappings(&fields(&[("status", "200"), ("ip", "1.2.3.4")]), rule(&rules))
            .expect("record");
        assert_eq!(record.table, "app_logs");
        assert_eq!(record.fields.len(), 1);
        assert_eq!(
            record.fields.get("response_status"),
            Some(&FieldValue::Integer(200))
        );
    }

    #[test]
    fn coercion_failure_drops_field_not_record() {
        let rules = mapping_rules();
        let record = apply_mappings(
            &fields(&[("status", "not-a-number"), ("secure", "yes")]),
            rule(&rules),
        )
        .expect("record");
        assert!(!record.fields.contains_key("response_status"));
        assert_eq!(
            record.fields.get("is_secure"),
            Some(&FieldValue::Boolean(true))
        );
    }

    #[test]
    fn record_with_zero_mapped_fields_is_discarded() {
        let rules = mapping_rules();
        assert!(apply_mappings(&fields(&[("status", "oops")]), rule(&rules)).is_none());
        assert!(apply_mappings(&fields(&[("unrelated", "1")]), rule(&rules)).is_none());
    }

    #[test]
    fn mapping_is_idempotent() {
        let rules = mapping_rules();
        let input = fields(&[
            ("status", "503"),
            ("ts", "2023-01-01 10:00:00"),
            ("secure", "no"),
        ]);
        let first = apply_mappings(&input, rule(&rules)).expect("record");
        let second = apply_mappings(&input, rule(&rules)).expect("record");
        assert_eq!(first, second);
    }

    #[test]
    fn bool_membership_is_case_insensitive_and_total() {
        for truthy in ["true", "TRUE", "1", "Yes", "y"] {
            assert_eq!(
                coerce(truthy, FieldType::Bool),
                Some(FieldValue::Boolean(true)),
                "{truthy} should be true"
            );
        }
        for falsy in ["false", "0", "no", "maybe", ""] {
            assert_eq!(
                coerce(falsy, FieldType::Bool),
                Some(FieldValue::Boolean(false)),
                "{falsy} should be false"
            );
        }
    }

    #[test]
    fn datetime_accepts_each_configured_format() {
        let expected = NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        for input in [
            "2023-01-01 10:00:00",
            "2023-01-01T10:00:00",
            "2023/01/01 10:00:00",
        ] {
            assert_eq!(
                coerce(input, FieldType::Datetime),
                Some(FieldValue::Timestamp(expected)),
                "{input} should parse"
            );
        }

        let Some(FieldValue::Timestamp(with_micros)) =
            coerce("2023-01-01 10:00:00.123456", FieldType::Datetime)
        else {
            panic!("fractional seconds should parse");
        };
        assert_eq!(with_micros.nanosecond(), 123_456_000);
    }

    #[test]
    fn unparsable_datetime_is_dropped() {
        assert_eq!(coerce("01/02/2023", FieldType::Datetime), None);
        assert_eq!(coerce("yesterday", FieldType::Datetime), None);
    }

    #[test]
    fn numeric_coercions_trim_but_stay_strict() {
        assert_eq!(coerce(" 42 ", FieldType::Int), Some(FieldValue::Integer(42)));
        assert_eq!(coerce("4.5", FieldType::Int), None);
        assert_eq!(coerce("4.5", FieldType::Float), Some(FieldValue::Float(4.5)));
        assert_eq!(coerce("", FieldType::Float), None);
    }
}
