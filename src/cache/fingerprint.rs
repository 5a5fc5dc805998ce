//! Content-derived request keys.
//!
//! A fingerprint is the only correlation token the service echoes back, so
//! it must be a pure function of the method and its parameters: the same
//! logical request always yields the same `(primary_key, param_key)` pair no
//! matter how the parameters were ordered.

use std::fmt;

use serde_json::{Map, Value};

/// Parameters that shape the primary key or the transport and are therefore
/// excluded from the parameter key.
pub const STRUCTURAL_PARAMS: [&str; 5] = [
    "security_id",
    "as_of_date",
    "api_method",
    "input_file",
    "output_file",
];

/// Parameter key used when a request carries no non-structural parameters.
pub const NO_PARAMS: &str = "NONE";

/// Rendering of a missing or null parameter value.
const NONE_LITERAL: &str = "None";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    primary_key: String,
    param_key: String,
}

impl Fingerprint {
    pub fn new(primary_key: impl Into<String>, param_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            param_key: param_key.into(),
        }
    }

    /// Derive the fingerprint of `method` called with `params`.
    ///
    /// Requests about a security key on `"{security_id}:{as_of_date}:{method}"`;
    /// everything else keys on the method alone.
    pub fn compute(method: &str, params: &Map<String, Value>) -> Self {
        let primary_key = match params.get("security_id") {
            Some(security_id) if is_present(security_id) => format!(
                "{}:{}:{}",
                render_value(security_id),
                params
                    .get("as_of_date")
                    .map(render_value)
                    .unwrap_or_else(|| NONE_LITERAL.to_string()),
                method
            ),
            _ => method.to_string(),
        };

        let mut remaining: Vec<(&String, &Value)> = params
            .iter()
            .filter(|(name, _)| !STRUCTURAL_PARAMS.contains(&name.as_str()))
            .collect();
        remaining.sort_by(|a, b| a.0.cmp(b.0));

        let param_key = if remaining.is_empty() {
            NO_PARAMS.to_string()
        } else {
            remaining
                .iter()
                .map(|(name, value)| format!("{}:{}", name, render_value(value)))
                .collect::<Vec<_>>()
                .join(",")
        };

        Self {
            primary_key,
            param_key,
        }
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn param_key(&self) -> &str {
        &self.param_key
    }

    /// Security id encoded in the primary key, if any.
    pub fn security_id(&self) -> Option<&str> {
        let mut parts = self.primary_key.splitn(3, ':');
        let first = parts.next()?;
        // A bare method name has no separators.
        parts.next()?;
        parts.next()?;
        Some(first)
    }

    /// Wire form: `[null, primary_key, param_key]`.
    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            Value::Null,
            Value::String(self.primary_key.clone()),
            Value::String(self.param_key.clone()),
        ])
    }

    /// Parse the wire form; the trailing two string elements are the key.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let tail = match items.len() {
            2 => &items[..],
            3 => &items[1..],
            _ => return None,
        };
        Some(Self::new(tail[0].as_str()?, tail[1].as_str()?))
    }

    /// Parse a key as written in a result file's `cache_key` column.
    ///
    /// Accepts the JSON wire form as well as the Python list repr
    /// (`[None, 'a', 'b']`) some result writers emit.
    pub fn from_cell(cell: &str) -> Option<Self> {
        let trimmed = cell.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Self::from_wire(&value);
        }
        let mut items = parse_python_list(trimmed)?;
        if !(2..=3).contains(&items.len()) {
            return None;
        }
        let param_key = items.pop()??;
        let primary_key = items.pop()??;
        Some(Self::new(primary_key, param_key))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.primary_key, self.param_key)
    }
}

/// Render a parameter value the way it appears inside a key.
///
/// Strings are raw, numbers and booleans use their JSON spelling, null is
/// `None`, and containers are compact JSON with sorted object keys.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => NONE_LITERAL.to_string(),
        other => other.to_string(),
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Minimal parser for a Python list of `None` and quoted strings.
fn parse_python_list(input: &str) -> Option<Vec<Option<String>>> {
    let inner = input.strip_prefix('[')?.strip_suffix(']')?;
    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        match chars.peek().copied() {
            None => break,
            Some(quote @ ('\'' | '"')) => {
                chars.next();
                let mut item = String::new();
                loop {
                    match chars.next()? {
                        '\\' => item.push(chars.next()?),
                        c if c == quote => break,
                        c => item.push(c),
                    }
                }
                items.push(Some(item));
            }
            Some('N') => {
                let word: String = chars.by_ref().take(4).collect();
                if word != NONE_LITERAL {
                    return None;
                }
                items.push(None);
            }
            Some(_) => return None,
        }
    }
    Some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn security_requests_key_on_security_date_and_method() {
        let fp = Fingerprint::compute(
            "get_security_reference_data",
            &params(json!({"security_id": "USQ98418AH10", "as_of_date": "2021-01-01"})),
        );
        assert_eq!(
            fp.primary_key(),
            "USQ98418AH10:2021-01-01:get_security_reference_data"
        );
        assert_eq!(fp.param_key(), NO_PARAMS);
        assert_eq!(fp.security_id(), Some("USQ98418AH10"));
    }

    #[test]
    fn missing_as_of_date_renders_as_none() {
        let fp = Fingerprint::compute("get_security_cpr", &params(json!({"security_id": "X", "price": 100.0})));
        assert_eq!(fp.primary_key(), "X:None:get_security_cpr");
        assert_eq!(fp.param_key(), "price:100.0");
    }

    #[test]
    fn method_only_requests_key_on_method() {
        let fp = Fingerprint::compute("list_api_functions", &Map::new());
        assert_eq!(fp.primary_key(), "list_api_functions");
        assert_eq!(fp.param_key(), NO_PARAMS);
        assert_eq!(fp.security_id(), None);
    }

    #[test]
    fn parameter_order_does_not_change_fingerprint() {
        let mut forward = Map::new();
        forward.insert("s0".into(), json!(101));
        forward.insert("k".into(), json!(100));
        forward.insert("r".into(), json!(0.01));
        let mut backward = Map::new();
        backward.insert("r".into(), json!(0.01));
        backward.insert("k".into(), json!(100));
        backward.insert("s0".into(), json!(101));

        let a = Fingerprint::compute("calculate_greeks", &forward);
        let b = Fingerprint::compute("calculate_greeks", &backward);
        assert_eq!(a, b);
        assert_eq!(a.param_key(), "k:100,r:0.01,s0:101");
    }

    #[test]
    fn structural_parameters_are_excluded() {
        let fp = Fingerprint::compute(
            "get_curve",
            &params(json!({"api_method": "get_curve", "input_file": "in.csv", "output_file": "out.csv", "currency": "USD"})),
        );
        assert_eq!(fp.param_key(), "currency:USD");
    }

    #[rstest]
    #[case::string(json!("abc"), "abc")]
    #[case::integer(json!(5), "5")]
    #[case::float(json!(0.25), "0.25")]
    #[case::boolean(json!(true), "true")]
    #[case::null(json!(null), "None")]
    #[case::list(json!([1, "a"]), "[1,\"a\"]")]
    #[case::object(json!({"b": 1, "a": 2}), "{\"a\":2,\"b\":1}")]
    fn values_render_deterministically(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(render_value(&value), expected);
    }

    #[test]
    fn wire_form_is_null_primary_param() {
        let fp = Fingerprint::new("A:None:m", "x:1");
        assert_eq!(fp.to_wire(), json!([null, "A:None:m", "x:1"]));
        assert_eq!(Fingerprint::from_wire(&fp.to_wire()), Some(fp));
    }

    #[test]
    fn from_wire_rejects_other_shapes() {
        assert_eq!(Fingerprint::from_wire(&json!("A")), None);
        assert_eq!(Fingerprint::from_wire(&json!([null, 1, "x"])), None);
        assert_eq!(Fingerprint::from_wire(&json!([1, 2, 3, 4])), None);
    }

    #[rstest]
    #[case::json_compact(r#"[null,"A:None:m","x:1"]"#)]
    #[case::json_spaced(r#"[null, "A:None:m", "x:1"]"#)]
    #[case::python_repr("[None, 'A:None:m', 'x:1']")]
    #[case::python_double_quotes(r#"[None, "A:None:m", "x:1"]"#)]
    fn cell_forms_parse_to_same_key(#[case] cell: &str) {
        assert_eq!(
            Fingerprint::from_cell(cell),
            Some(Fingerprint::new("A:None:m", "x:1"))
        );
    }

    #[test]
    fn python_repr_handles_escaped_quotes() {
        let fp = Fingerprint::from_cell(r"[None, 'm', 'name:O\'Brien']").unwrap();
        assert_eq!(fp.param_key(), "name:O'Brien");
    }

    #[test]
    fn garbage_cell_is_rejected() {
        assert_eq!(Fingerprint::from_cell("not a key"), None);
        assert_eq!(Fingerprint::from_cell("[Nope, 'a', 'b']"), None);
    }
}
