// Built-in Functions
// The whitelist of functions callable from gate expressions and templates

use crate::expression::evaluator::{EvalError, ExpressionContext};
use crate::value::Value;

/// Registry of built-in functions
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    /// Allowed argument count as `(min, max)`; `None` for unknown functions.
    /// A `max` of `None` means variadic.
    pub fn arity(name: &str) -> Option<(usize, Option<usize>)> {
        let arity = match name.to_lowercase().as_str() {
            "always" | "success" | "failure" | "cancelled" => (0, Some(0)),
            "contains" | "startswith" | "endswith" => (2, Some(2)),
            "format" => (1, None),
            "join" => (1, Some(2)),
            "tojson" => (1, Some(1)),
            _ => return None,
        };
        Some(arity)
    }

    /// Whether the function reports on run or job status
    pub fn is_status_function(name: &str) -> bool {
        matches!(
            name.to_lowercase().as_str(),
            "always" | "success" | "failure" | "cancelled"
        )
    }

    /// Call a built-in function
    pub fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &ExpressionContext,
    ) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            // Status functions (context-aware)
            "always" => Ok(Value::Bool(true)),
            "success" => Ok(Value::Bool(context.status.success)),
            "failure" => Ok(Value::Bool(context.status.failure)),
            "cancelled" => Ok(Value::Bool(context.status.cancelled)),

            // String and collection functions
            "contains" => self.fn_contains(args),
            "startswith" => self.fn_startswith(args),
            "endswith" => self.fn_endswith(args),
            "format" => self.fn_format(args),
            "join" => self.fn_join(args),

            // Conversion functions
            "tojson" => self.fn_to_json(args),

            _ => Err(EvalError::new(format!("unknown function: {}", name))),
        }
    }

    fn fn_contains(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, "contains")?;

        match (&args[0], &args[1]) {
            (Value::Array(arr), needle) => Ok(Value::Bool(
                arr.iter().any(|item| values_equal(item, needle)),
            )),
            (Value::Object(_), _) => Err(EvalError::new(
                "contains() requires a string or an array as first argument",
            )),
            (haystack, needle) => Ok(Value::Bool(
                haystack
                    .as_string()
                    .to_lowercase()
                    .contains(&needle.as_string().to_lowercase()),
            )),
        }
    }

    fn fn_startswith(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, "startsWith")?;
        let s = args[0].as_string().to_lowercase();
        let prefix = args[1].as_string().to_lowercase();
        Ok(Value::Bool(s.starts_with(&prefix)))
    }

    fn fn_endswith(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, "endsWith")?;
        let s = args[0].as_string().to_lowercase();
        let suffix = args[1].as_string().to_lowercase();
        Ok(Value::Bool(s.ends_with(&suffix)))
    }

    /// `format('{0} on {1}', a, b)`; `{{` and `}}` produce literal braces
    fn fn_format(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        let Some((template, rest)) = args.split_first() else {
            return Err(EvalError::new("format() requires at least 1 argument"));
        };

        let template = template.as_string();
        let mut result = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    result.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    result.push('}');
                }
                '{' => {
                    let mut digits = String::new();
                    while let Some(&c) = chars.peek() {
                        if c == '}' {
                            break;
                        }
                        digits.push(c);
                        chars.next();
                    }
                    if chars.next() != Some('}') {
                        return Err(EvalError::new("format(): unclosed placeholder"));
                    }
                    let index: usize = digits.trim().parse().map_err(|_| {
                        EvalError::new(format!("format(): invalid placeholder '{{{}}}'", digits))
                    })?;
                    let arg = rest.get(index).ok_or_else(|| {
                        EvalError::new(format!(
                            "format(): placeholder {{{}}} has no argument",
                            index
                        ))
                    })?;
                    result.push_str(&arg.as_string());
                }
                _ => result.push(ch),
            }
        }

        Ok(Value::String(result))
    }

    fn fn_join(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        let separator = args.get(1).map(|v| v.as_string()).unwrap_or_else(|| ",".to_string());

        match args.first() {
            Some(Value::Array(arr)) => {
                let strings: Vec<String> = arr.iter().map(|v| v.as_string()).collect();
                Ok(Value::String(strings.join(&separator)))
            }
            Some(other) => Ok(Value::String(other.as_string())),
            None => Err(EvalError::new("join() requires at least 1 argument")),
        }
    }

    fn fn_to_json(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 1, "toJSON")?;
        Ok(Value::String(args[0].to_json()))
    }

    fn require_args(&self, args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
        if args.len() != count {
            return Err(EvalError::new(format!(
                "{}() requires {} argument(s), got {}",
                name,
                count,
                args.len()
            )));
        }
        Ok(())
    }
}

impl Default for BuiltinFunctions {
    fn default() -> Self {
        Self::new()
    }
}

/// Loose equality used by `==`, `!=` and `contains()`.
///
/// Strings compare case-insensitively; numbers and booleans coerce against
/// strings.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => b
            .trim()
            .parse::<f64>()
            .map(|n| (a - n).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            let b_lower = b.to_lowercase();
            (*a && b_lower == "true") || (!*a && b_lower == "false")
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => false,
    }
}
