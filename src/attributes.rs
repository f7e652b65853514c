use serde_json::Value;

/// Schema-less map of user attributes used for targeting and hashing.
///
/// Values can be any JSON value: strings, numbers, booleans, arrays, or nested objects. Nested
/// values are addressed with dot-separated paths (`"company.size"`) in conditions.
///
/// # Examples
/// ```
/// # use growthbook::Attributes;
/// let attributes: Attributes = serde_json::json!({
///     "id": "user-123",
///     "country": "US",
///     "company": { "size": 42 },
/// })
/// .as_object()
/// .cloned()
/// .unwrap_or_default();
/// ```
pub type Attributes = serde_json::Map<String, Value>;

/// Anything conditions can be evaluated against.
pub(crate) trait AttributeSource {
    /// Look up a dot-separated path. Returns `None` when any segment is absent.
    fn lookup(&self, path: &str) -> Option<&Value>;
}

impl AttributeSource for Value {
    fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, step)
    }
}

impl AttributeSource for Attributes {
    fn lookup(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let value = self.get(head)?;
        match rest {
            Some(rest) => rest.split('.').try_fold(value, step),
            None => Some(value),
        }
    }
}

fn step<'a>(current: &'a Value, part: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => items.get(part.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Truthiness with the semantics shared by all GrowthBook SDKs: `null`, `false`, `0`, `NaN`
/// and `""` are falsy, everything else (including empty arrays and objects) is truthy.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Format a number the way JSON payload authors expect: integral values have no fractional
/// part (`3`, not `3.0`).
pub(crate) fn number_to_string(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        let f = n.as_f64().unwrap_or(f64::NAN);
        if f.fract() == 0.0 && f.abs() < 1e21 {
            format!("{}", f as i64)
        } else {
            format!("{f}")
        }
    }
}

/// Return the string used as hash input for an attribute, or `None` if the attribute is
/// missing or falsy (such users cannot be bucketed).
pub(crate) fn to_hash_value(value: Option<&Value>) -> Option<String> {
    if !is_truthy(value) {
        return None;
    }
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(number_to_string(n)),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// String coercion used by literal string comparisons in conditions.
pub(crate) fn coerce_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_owned(),
        Some(Value::Null) => "null".to_owned(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => number_to_string(n),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => coerce_string(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_owned(),
    }
}

/// Numeric coercion used by literal number comparisons in conditions. Returns `NaN` when the
/// value has no numeric interpretation.
pub(crate) fn coerce_number(value: Option<&Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Array(items)) => match items.as_slice() {
            [] => 0.0,
            [single] => coerce_number(Some(single)),
            _ => f64::NAN,
        },
        Some(Value::Object(_)) => f64::NAN,
    }
}
