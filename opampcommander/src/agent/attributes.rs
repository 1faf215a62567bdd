use opamp_proto::proto::{AnyValue, KeyValue, any_value};

/// Flattens a reported attribute list into string values. Scalar values keep
/// their natural representation; nested arrays and key-value lists are
/// rendered as JSON so they stay searchable.
pub fn flatten(attributes: &[KeyValue]) -> std::collections::BTreeMap<String, String> {
    attributes
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|value| (kv.key.clone(), render(value)))
        })
        .collect()
}

fn render(value: &AnyValue) -> String {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::BytesValue(bytes)) => {
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        }
        Some(any_value::Value::ArrayValue(array)) => {
            let rendered: Vec<String> = array.values.iter().map(render).collect();
            serde_json::to_string(&rendered).unwrap_or_default()
        }
        Some(any_value::Value::KvlistValue(list)) => {
            let rendered: std::collections::BTreeMap<String, String> = list
                .values
                .iter()
                .filter_map(|kv| kv.value.as_ref().map(|v| (kv.key.clone(), render(v))))
                .collect();
            serde_json::to_string(&rendered).unwrap_or_default()
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opamp_proto::proto::KeyValueList;

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    #[test]
    fn test_flatten_scalars() {
        let attrs = vec![
            string_attr("service.name", "otelcol"),
            KeyValue {
                key: "pid".to_string(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::IntValue(1234)),
                }),
            },
        ];
        let flat = flatten(&attrs);
        assert_eq!(flat.get("service.name"), Some(&"otelcol".to_string()));
        assert_eq!(flat.get("pid"), Some(&"1234".to_string()));
    }

    #[test]
    fn test_flatten_nested_kvlist_as_json() {
        let attrs = vec![KeyValue {
            key: "host".to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::KvlistValue(KeyValueList {
                    values: vec![string_attr("name", "ip-10-0-0-1")],
                })),
            }),
        }];
        let flat = flatten(&attrs);
        assert_eq!(flat.get("host"), Some(&r#"{"name":"ip-10-0-0-1"}"#.to_string()));
    }

    #[test]
    fn test_valueless_attributes_are_dropped() {
        let attrs = vec![KeyValue {
            key: "empty".to_string(),
            value: None,
        }];
        assert!(flatten(&attrs).is_empty());
    }
}
