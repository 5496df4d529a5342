// Expression Evaluator
// Evaluates gate expressions and templates against an explicit context snapshot

use crate::expression::functions::{values_equal, BuiltinFunctions};
use crate::expression::lexer::{extract_templates, strip_template, TemplatePart};
use crate::expression::parser::{
    BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart, UnaryOp,
};
use crate::value::Value;

use std::collections::BTreeMap;
use std::fmt;

/// Evaluation error
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Either stage of expression handling can fail
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error(transparent)]
    Parse(#[from] ParseExprError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Snapshot of everything an expression may read
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    /// Run metadata: event.name, event.ref, event.sha, event.actor
    pub event: EventContext,

    /// Merged environment visible at this scope
    pub env: BTreeMap<String, String>,

    /// Matrix values of the current job instance
    pub matrix: BTreeMap<String, Value>,

    /// Results of the direct dependencies, keyed as written in `needs`
    pub needs: BTreeMap<String, NeedContext>,

    /// Earlier steps of the current job, keyed by step id
    pub steps: BTreeMap<String, StepContext>,

    /// Current job, available inside steps
    pub job: Option<JobStatusContext>,

    /// What the status functions report
    pub status: StatusContext,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    pub name: String,
    pub git_ref: String,
    pub sha: String,
    pub actor: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeedContext {
    pub result: String,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepContext {
    pub outcome: String,
    pub conclusion: String,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatusContext {
    pub status: String,
}

/// Answers for `success()`, `failure()` and `cancelled()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusContext {
    pub success: bool,
    pub failure: bool,
    pub cancelled: bool,
}

impl Default for StatusContext {
    fn default() -> Self {
        Self {
            success: true,
            failure: false,
            cancelled: false,
        }
    }
}

/// Expression evaluator
pub struct Evaluator<'a> {
    context: &'a ExpressionContext,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext) -> Self {
        Self {
            context,
            functions: BuiltinFunctions::new(),
        }
    }

    /// Evaluate an expression
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Reference(reference) => self.eval_reference(reference),

            Expr::FunctionCall { name, args } => self.eval_function(name, args),

            Expr::Unary { op, expr } => {
                let val = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!val.is_truthy())),
                }
            }

            Expr::Binary { op, left, right } => {
                // Short-circuit evaluation for && and ||
                match op {
                    BinaryOp::And => {
                        let left_val = self.eval(left)?;
                        if !left_val.is_truthy() {
                            return Ok(Value::Bool(false));
                        }
                        let right_val = self.eval(right)?;
                        Ok(Value::Bool(right_val.is_truthy()))
                    }
                    BinaryOp::Or => {
                        let left_val = self.eval(left)?;
                        if left_val.is_truthy() {
                            return Ok(Value::Bool(true));
                        }
                        let right_val = self.eval(right)?;
                        Ok(Value::Bool(right_val.is_truthy()))
                    }
                    _ => {
                        let left_val = self.eval(left)?;
                        let right_val = self.eval(right)?;
                        self.eval_binary(*op, &left_val, &right_val)
                    }
                }
            }
        }
    }

    fn eval_reference(&self, reference: &Reference) -> Result<Value, EvalError> {
        let mut current: Option<Value> = None;

        for (i, part) in reference.parts.iter().enumerate() {
            let next = match (part, current.take()) {
                (ReferencePart::Property(name), None) if i == 0 => self.lookup_context(name)?,
                (ReferencePart::Property(name), Some(obj)) => {
                    self.eval_member(&obj, name, reference)?
                }
                (ReferencePart::Index(index_expr), Some(obj)) => {
                    let index = self.eval(index_expr)?;
                    self.eval_index(&obj, &index, reference)?
                }
                _ => return Err(EvalError::new("invalid reference")),
            };
            current = Some(next);
        }

        current.ok_or_else(|| EvalError::new("empty reference"))
    }

    fn lookup_context(&self, name: &str) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            "event" => {
                let event = &self.context.event;
                Ok([
                    ("name", event.name.as_str()),
                    ("ref", event.git_ref.as_str()),
                    ("sha", event.sha.as_str()),
                    ("actor", event.actor.as_str()),
                ]
                .into_iter()
                .collect())
            }
            "env" => Ok(string_map(&self.context.env)),
            "matrix" => Ok(Value::Object(self.context.matrix.clone())),
            "needs" => Ok(Value::Object(
                self.context
                    .needs
                    .iter()
                    .map(|(k, need)| {
                        let value: Value = [
                            ("result", Value::from(need.result.as_str())),
                            ("outputs", string_map(&need.outputs)),
                        ]
                        .into_iter()
                        .collect();
                        (k.clone(), value)
                    })
                    .collect(),
            )),
            "steps" => Ok(Value::Object(
                self.context
                    .steps
                    .iter()
                    .map(|(k, step)| {
                        let value: Value = [
                            ("outcome", Value::from(step.outcome.as_str())),
                            ("conclusion", Value::from(step.conclusion.as_str())),
                            ("outputs", string_map(&step.outputs)),
                        ]
                        .into_iter()
                        .collect();
                        (k.clone(), value)
                    })
                    .collect(),
            )),
            "job" => match &self.context.job {
                Some(job) => Ok([("status", job.status.as_str())].into_iter().collect()),
                None => Err(EvalError::new("'job' is not available in this context")),
            },
            _ => Err(EvalError::new(format!("unknown context: {}", name))),
        }
    }

    fn eval_function(&self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let evaluated_args: Result<Vec<Value>, EvalError> =
            args.iter().map(|a| self.eval(a)).collect();
        self.functions.call(name, evaluated_args?, self.context)
    }

    fn eval_index(
        &self,
        object: &Value,
        index: &Value,
        reference: &Reference,
    ) -> Result<Value, EvalError> {
        match (object, index) {
            (Value::Array(arr), Value::Number(n)) if *n >= 0.0 => {
                arr.get(*n as usize).cloned().ok_or_else(|| {
                    EvalError::new(format!("index {} out of bounds in '{}'", n, reference))
                })
            }
            (Value::Object(_), key) => self.eval_member(object, &key.as_string(), reference),
            _ => Err(EvalError::new(format!(
                "cannot index {} with {} in '{}'",
                object.type_name(),
                index.type_name(),
                reference
            ))),
        }
    }

    fn eval_member(
        &self,
        object: &Value,
        property: &str,
        reference: &Reference,
    ) -> Result<Value, EvalError> {
        match object {
            Value::Object(map) => map.get(property).cloned().ok_or_else(|| {
                EvalError::new(format!("'{}' not found in '{}'", property, reference))
            }),
            _ => Err(EvalError::new(format!(
                "cannot access property '{}' on {} in '{}'",
                property,
                object.type_name(),
                reference
            ))),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
            BinaryOp::Lt => self.eval_comparison(left, right, |a, b| a < b),
            BinaryOp::Le => self.eval_comparison(left, right, |a, b| a <= b),
            BinaryOp::Gt => self.eval_comparison(left, right, |a, b| a > b),
            BinaryOp::Ge => self.eval_comparison(left, right, |a, b| a >= b),

            // Logical (handled in eval() for short-circuit)
            BinaryOp::And | BinaryOp::Or => unreachable!("handled in eval()"),
        }
    }

    fn eval_comparison<F>(&self, left: &Value, right: &Value, op: F) -> Result<Value, EvalError>
    where
        F: FnOnce(f64, f64) -> bool,
    {
        let not_comparable = || {
            EvalError::new(format!(
                "cannot compare {} with {}",
                left.type_name(),
                right.type_name()
            ))
        };

        let a = comparable_number(left).ok_or_else(not_comparable)?;
        let b = comparable_number(right).ok_or_else(not_comparable)?;
        Ok(Value::Bool(op(a, b)))
    }
}

fn comparable_number(value: &Value) -> Option<f64> {
    match value {
        Value::Array(_) | Value::Object(_) => None,
        other => other.as_number(),
    }
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    map.iter().map(|(k, v)| (k.clone(), v.as_str())).collect()
}

/// High-level expression engine over a borrowed context
pub struct ExpressionEngine<'a> {
    context: &'a ExpressionContext,
}

impl<'a> ExpressionEngine<'a> {
    pub fn new(context: &'a ExpressionContext) -> Self {
        Self { context }
    }

    /// Evaluate an expression written bare or wrapped in `${{ }}`
    pub fn evaluate(&self, expr: &str) -> Result<Value, ExpressionError> {
        let ast = ExprParser::parse_str(strip_template(expr))?;
        Ok(Evaluator::new(self.context).eval(&ast)?)
    }

    pub fn evaluate_bool(&self, expr: &str) -> Result<bool, ExpressionError> {
        Ok(self.evaluate(expr)?.is_truthy())
    }

    /// Decide a job or step gate.
    ///
    /// Without a condition the gate is `success()`, or `always()` for
    /// `run_always` jobs. A condition that calls no status function is
    /// evaluated as `success() && (condition)` unless `run_always` is set.
    pub fn evaluate_gate(
        &self,
        condition: Option<&str>,
        run_always: bool,
    ) -> Result<bool, ExpressionError> {
        let Some(condition) = condition.filter(|c| !c.trim().is_empty()) else {
            return Ok(run_always || self.context.status.success);
        };

        let ast = ExprParser::parse_str(strip_template(condition))?;

        if !run_always && !ast.uses_status_function() && !self.context.status.success {
            return Ok(false);
        }

        Ok(Evaluator::new(self.context).eval(&ast)?.is_truthy())
    }

    /// Replace every `${{ expr }}` in `template` with its string value
    pub fn interpolate(&self, template: &str) -> Result<String, ExpressionError> {
        let mut result = String::with_capacity(template.len());

        for part in extract_templates(template) {
            match part {
                TemplatePart::Text(text) => result.push_str(&text),
                TemplatePart::Expression(expr) => {
                    let ast = ExprParser::parse_str(&expr)?;
                    let value = Evaluator::new(self.context).eval(&ast)?;
                    result.push_str(&value.as_string());
                }
            }
        }

        Ok(result)
    }
}

/// Parse a gate condition without evaluating it
pub fn parse_condition(condition: &str) -> Result<Expr, ParseExprError> {
    ExprParser::parse_str(strip_template(condition))
}

/// Parse every `${{ }}` expression embedded in a template
pub fn parse_template(template: &str) -> Result<Vec<Expr>, ParseExprError> {
    extract_templates(template)
        .into_iter()
        .filter_map(|part| match part {
            TemplatePart::Expression(expr) => Some(ExprParser::parse_str(&expr)),
            TemplatePart::Text(_) => None,
        })
        .collect()
}
