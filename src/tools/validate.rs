//! 参数校验：JSON Schema 子集
//!
//! 支持 type（含类型数组）、properties、required、enum、additionalProperties: false、
//! items，以及嵌套对象/数组。未识别的关键字忽略。

use serde_json::Value;

/// 按 schema 校验参数；失败时返回带路径的原因
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    validate_at(schema, args, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(|t| t.as_str())
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(format!(
                "{path}: expected {}, got {}",
                expected,
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} not in {}", Value::Array(allowed.clone())));
        }
    }

    if let Value::Object(obj) = value {
        let properties = schema.get("properties").and_then(|p| p.as_object());

        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(|r| r.as_str()) {
                if obj.get(name).map_or(true, |v| v.is_null()) && !property_allows_null(properties, name) {
                    return Err(format!("{path}: missing required field '{name}'"));
                }
            }
        }

        if let Some(props) = properties {
            for (name, sub) in obj {
                match props.get(name) {
                    Some(sub_schema) => validate_at(sub_schema, sub, &format!("{path}.{name}"))?,
                    None => {
                        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                            return Err(format!("{path}: unexpected field '{name}'"));
                        }
                    }
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn property_allows_null(properties: Option<&serde_json::Map<String, Value>>, name: &str) -> bool {
    let Some(ty) = properties.and_then(|p| p.get(name)).and_then(|s| s.get("type")) else {
        return false;
    };
    match ty {
        Value::String(t) => t == "null",
        Value::Array(types) => types.iter().any(|t| t == "null"),
        _ => false,
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
