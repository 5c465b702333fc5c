//! Bracketed argument lists carried by host-event records.
//!
//! Grammar:
//!
//! ```text
//! list  := "[" "]" | "[" item ("," item)* "]"
//! item  := bool | int | float | text
//! ```
//!
//! Items are trimmed. `true`/`false` are booleans, anything `i64` accepts is an
//! integer, any finite `f64` is a float, and everything else is kept as raw
//! text. Brackets are not allowed inside an item.

use crate::Primitive;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgsError {
    #[error("argument list must start with '['")]
    MissingOpen,
    #[error("argument list must end with ']'")]
    MissingClose,
    #[error("nested bracket in argument {index}")]
    NestedBracket { index: usize },
}

pub fn parse_args(input: &str) -> Result<Vec<Primitive>, ArgsError> {
    let trimmed = input.trim();
    let inner = trimmed
        .strip_prefix('[')
        .ok_or(ArgsError::MissingOpen)?
        .strip_suffix(']')
        .ok_or(ArgsError::MissingClose)?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .enumerate()
        .map(|(index, item)| {
            if item.contains('[') || item.contains(']') {
                return Err(ArgsError::NestedBracket { index });
            }
            Ok(parse_scalar(item))
        })
        .collect()
}

pub fn parse_scalar(raw: &str) -> Primitive {
    let item = raw.trim();
    match item {
        "true" => return Primitive::Bool(true),
        "false" => return Primitive::Bool(false),
        _ => {}
    }
    if let Ok(value) = item.parse::<i64>() {
        return Primitive::Int(value);
    }
    if let Ok(value) = item.parse::<f64>() {
        if value.is_finite() {
            return Primitive::Float(value);
        }
    }
    Primitive::Text(item.to_string())
}

pub fn format_args(values: &[Primitive]) -> String {
    let items: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_mixed_literals() {
        let parsed = parse_args("[stageA, 3, -1.25, true, false, two words]").expect("parse");
        assert_eq!(
            parsed,
            vec![
                Primitive::Text("stageA".to_string()),
                Primitive::Int(3),
                Primitive::Float(-1.25),
                Primitive::Bool(true),
                Primitive::Bool(false),
                Primitive::Text("two words".to_string()),
            ]
        );
    }

    #[test]
    fn empty_list_forms() {
        assert!(parse_args("[]").expect("empty").is_empty());
        assert!(parse_args("  [ ]  ").expect("blank").is_empty());
    }

    #[test]
    fn non_finite_numbers_stay_text() {
        assert_eq!(
            parse_args("[NaN, inf]").expect("parse"),
            vec![
                Primitive::Text("NaN".to_string()),
                Primitive::Text("inf".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_unbalanced_and_nested_lists() {
        assert_eq!(parse_args("a, b]"), Err(ArgsError::MissingOpen));
        assert_eq!(parse_args("[a, b"), Err(ArgsError::MissingClose));
        assert_eq!(
            parse_args("[a, [b]]"),
            Err(ArgsError::NestedBracket { index: 1 })
        );
    }

    #[test]
    fn formats_in_list_syntax() {
        let values = vec![
            Primitive::Text("stageA".to_string()),
            Primitive::Int(7),
            Primitive::Float(0.5),
            Primitive::Bool(true),
        ];
        assert_eq!(format_args(&values), "[stageA, 7, 0.5, true]");
        assert_eq!(format_args(&[]), "[]");
    }

    fn primitive_strategy() -> impl Strategy<Value = Primitive> {
        prop_oneof![
            any::<bool>().prop_map(Primitive::Bool),
            any::<i64>().prop_map(Primitive::Int),
            (-1.0e12f64..1.0e12f64).prop_map(Primitive::Float),
            "[a-zA-Z_][a-zA-Z0-9_ .:-]{0,16}[a-zA-Z0-9_]"
                .prop_filter("text must not read back as another literal", |text| {
                    matches!(parse_scalar(text), Primitive::Text(_))
                })
                .prop_map(Primitive::Text),
        ]
    }

    proptest! {
        #[test]
        fn property_format_then_parse_round_trips(
            values in prop::collection::vec(primitive_strategy(), 0..8)
        ) {
            let rendered = format_args(&values);
            let parsed = parse_args(&rendered).expect("rendered list parses");
            prop_assert_eq!(parsed, values);
        }

        #[test]
        fn property_parser_never_panics(input in any::<String>()) {
            let _ = parse_args(&input);
        }

        #[test]
        fn property_bracketed_input_without_nesting_always_parses(body in "[^\\[\\]]{0,64}") {
            let input = format!("[{body}]");
            let parsed = parse_args(&input).expect("flat list parses");
            if body.trim().is_empty() {
                prop_assert!(parsed.is_empty());
            } else {
                prop_assert_eq!(parsed.len(), body.split(',').count());
            }
        }
    }
}
