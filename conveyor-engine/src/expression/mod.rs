// Expression Engine Module
// Gate conditions and ${{ }} templates over a restricted expression language

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    parse_condition, parse_template, EvalError, Evaluator, EventContext, ExpressionContext,
    ExpressionEngine, ExpressionError, JobStatusContext, NeedContext, StatusContext, StepContext,
};
pub use functions::BuiltinFunctions;
pub use lexer::{extract_templates, LexError, Lexer, TemplatePart, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart, UnaryOp};
