// Expression Parser
// Parses gate expression tokens into a restricted AST

use crate::expression::functions::BuiltinFunctions;
use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Abstract Syntax Tree node for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Null literal
    Null,

    /// Boolean literal
    Bool(bool),

    /// Number literal
    Number(f64),

    /// String literal
    String(String),

    /// Context reference: needs.build.result, env['NAME']
    Reference(Reference),

    /// Whitelisted function call: success(), contains(a, b)
    FunctionCall { name: String, args: Vec<Expr> },

    /// Unary operation: !expr
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Binary operation: a == b, a && b
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Whether any status function (`always`, `success`, `failure`,
    /// `cancelled`) appears anywhere in the expression
    pub fn uses_status_function(&self) -> bool {
        match self {
            Expr::FunctionCall { name, args } => {
                BuiltinFunctions::is_status_function(name)
                    || args.iter().any(Expr::uses_status_function)
            }
            Expr::Unary { expr, .. } => expr.uses_status_function(),
            Expr::Binary { left, right, .. } => {
                left.uses_status_function() || right.uses_status_function()
            }
            Expr::Reference(reference) => reference.parts.iter().any(|part| match part {
                ReferencePart::Index(index) => index.uses_status_function(),
                ReferencePart::Property(_) => false,
            }),
            _ => false,
        }
    }
}

/// Reference to a context value
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<ReferencePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferencePart {
    /// Property access by name
    Property(String),
    /// Index access by key
    Index(Box<Expr>),
}

impl Reference {
    pub fn new(name: String) -> Self {
        Self {
            parts: vec![ReferencePart::Property(name)],
        }
    }

    pub fn with_property(mut self, name: String) -> Self {
        self.parts.push(ReferencePart::Property(name));
        self
    }

    pub fn with_index(mut self, index: Expr) -> Self {
        self.parts.push(ReferencePart::Index(Box::new(index)));
        self
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            match part {
                ReferencePart::Property(name) if i == 0 => write!(f, "{}", name)?,
                ReferencePart::Property(name) => write!(f, ".{}", name)?,
                ReferencePart::Index(expr) => match expr.as_ref() {
                    Expr::String(s) => write!(f, "['{}']", s)?,
                    Expr::Number(n) => write!(f, "[{}]", n)?,
                    _ => write!(f, "[..]")?,
                },
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not, // !
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Comparison
    Eq, // ==
    Ne, // !=
    Lt, // <
    Le, // <=
    Gt, // >
    Ge, // >=

    // Logical
    And, // &&
    Or,  // ||
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Le => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Ge => write!(f, ">="),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}

/// Parser error
#[derive(Debug, Clone, PartialEq)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Recursive descent parser for gate expressions
pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse expression from string
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let mut lexer = Lexer::new(input);
        let tokens = lexer.tokenize()?;
        let mut parser = Self::new(tokens);
        parser.parse()
    }

    /// Parse the token stream into an expression
    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        if self.is_at_end() {
            return Err(self.error("empty expression"));
        }

        let expr = self.parse_or()?;

        if !self.is_at_end() {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Equality: == !=
    // 4. Comparison: < <= > >=
    // 5. Unary: !
    // 6. Postfix: . [] ()

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_equality()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };

            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        match self.peek().clone() {
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            Token::Identifier(name) => {
                let start = self.position;
                self.advance();

                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    self.check_function(&name, args.len(), start)?;
                    return Ok(Expr::FunctionCall { name, args });
                }

                let mut reference = Reference::new(name);

                while self.check(&Token::Dot) || self.check(&Token::LBracket) {
                    if self.check(&Token::Dot) {
                        self.advance();
                        let Token::Identifier(prop) = self.advance().clone() else {
                            return Err(self.error("expected property name after '.'"));
                        };
                        reference = reference.with_property(prop);
                    } else {
                        self.advance();
                        let index = self.parse_or()?;
                        self.expect(&Token::RBracket, "expected ']'")?;
                        reference = reference.with_index(index);
                    }
                }

                Ok(Expr::Reference(reference))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            token => Err(self.error(&format!("unexpected token: {}", token))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&Token::LParen, "expected '('")?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_or()?);

            while self.check(&Token::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }

        self.expect(&Token::RParen, "expected ')'")?;
        Ok(args)
    }

    fn check_function(
        &self,
        name: &str,
        arg_count: usize,
        position: usize,
    ) -> Result<(), ParseExprError> {
        let Some((min, max)) = BuiltinFunctions::arity(name) else {
            return Err(ParseExprError {
                message: format!("unknown function: {}", name),
                position,
            });
        };

        let too_many = max.is_some_and(|max| arg_count > max);
        if arg_count < min || too_many {
            let expected = match max {
                Some(max) if max == min => format!("{}", min),
                Some(max) => format!("{} to {}", min, max),
                None => format!("at least {}", min),
            };
            return Err(ParseExprError {
                message: format!(
                    "{}() expects {} argument(s), got {}",
                    name, expected, arg_count
                ),
                position,
            });
        }

        Ok(())
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseExprError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.tokens.len() || matches!(self.peek(), Token::Eof)
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(ExprParser::parse_str("null").unwrap(), Expr::Null);
        assert_eq!(ExprParser::parse_str("true").unwrap(), Expr::Bool(true));
        assert_eq!(ExprParser::parse_str("42").unwrap(), Expr::Number(42.0));
        assert_eq!(
            ExprParser::parse_str("'hello'").unwrap(),
            Expr::String("hello".to_string())
        );
    }

    #[test]
    fn test_parse_reference_with_index() {
        let expr = ExprParser::parse_str("needs['build'].outputs.version").unwrap();
        let Expr::Reference(reference) = expr else {
            panic!("expected reference");
        };
        assert_eq!(reference.parts.len(), 4);
        assert_eq!(reference.to_string(), "needs['build'].outputs.version");
    }

    #[test]
    fn test_parse_operator_precedence() {
        // && binds tighter than ||
        let expr = ExprParser::parse_str("a || b && c").unwrap();

        let Expr::Binary {
            op: BinaryOp::Or,
            right,
            ..
        } = expr
        else {
            panic!("expected or expression");
        };
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = ExprParser::parse_str("(a || b) && c").unwrap();
        let Expr::Binary {
            op: BinaryOp::And,
            left,
            ..
        } = expr
        else {
            panic!("expected and expression");
        };
        assert!(matches!(
            *left,
            Expr::Binary {
                op: BinaryOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_gate_expression() {
        let expr = ExprParser::parse_str(
            "success() && startsWith(event.ref, 'refs/tags/') && matrix.os != 'windows'",
        )
        .unwrap();
        assert!(expr.uses_status_function());
    }

    #[test]
    fn test_unknown_function_is_parse_error() {
        let err = ExprParser::parse_str("eval('rm -rf /')").unwrap_err();
        assert!(err.message.contains("unknown function"));
    }

    #[test]
    fn test_wrong_arity_is_parse_error() {
        let err = ExprParser::parse_str("contains('abc')").unwrap_err();
        assert!(err.message.contains("expects 2"));
        assert!(ExprParser::parse_str("always(1)").is_err());
        assert!(ExprParser::parse_str("format()").is_err());
    }

    #[test]
    fn test_function_names_are_case_insensitive() {
        assert!(ExprParser::parse_str("ALWAYS()").is_ok());
        assert!(ExprParser::parse_str("toJson(matrix)").is_ok());
    }

    #[test]
    fn test_status_function_detection() {
        let plain = ExprParser::parse_str("env.DEPLOY == 'true'").unwrap();
        assert!(!plain.uses_status_function());

        let nested = ExprParser::parse_str("!(cancelled())").unwrap();
        assert!(nested.uses_status_function());
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(ExprParser::parse_str("a b").is_err());
        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("(a").is_err());
    }
}
