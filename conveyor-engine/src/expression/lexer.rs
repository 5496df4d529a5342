// Expression Lexer
// Tokenizes gate expressions and splits ${{ }} templates out of plain text

use std::fmt;

/// Tokens of the gate expression language
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    // Identifiers and references
    Identifier(String),

    // Operators
    Eq,    // ==
    Ne,    // !=
    Lt,    // <
    Le,    // <=
    Gt,    // >
    Ge,    // >=
    And,   // &&
    Or,    // ||
    Not,   // !
    Dot,   // .
    Comma, // ,

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lex error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input, always ending with `Token::Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),

            '=' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Eq)
                } else {
                    Err(self.error("expected '==' operator", pos))
                }
            }
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Not)
                }
            }
            '<' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Le)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ge)
                } else {
                    Ok(Token::Gt)
                }
            }
            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    Ok(Token::And)
                } else {
                    Err(self.error("expected '&&' operator", pos))
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    Ok(Token::Or)
                } else {
                    Err(self.error("expected '||' operator", pos))
                }
            }

            '\'' => self.read_string(),
            '0'..='9' => self.read_number(false),
            '-' => {
                self.advance();
                match self.peek_char() {
                    Some(c) if c.is_ascii_digit() => self.read_number(true),
                    _ => Err(self.error("unexpected character: '-'", pos)),
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => self.read_identifier(),

            _ => Err(self.error(&format!("unexpected character: '{}'", ch), pos)),
        }
    }

    fn single(&mut self, token: Token) -> Result<Token, LexError> {
        self.advance();
        Ok(token)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn error(&self, message: &str, position: usize) -> LexError {
        LexError {
            message: message.to_string(),
            position,
        }
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // opening quote

        let mut value = String::new();

        loop {
            match self.chars.peek() {
                Some(&(_, '\'')) => {
                    self.advance();
                    // '' is an escaped quote
                    if self.peek_char() == Some('\'') {
                        value.push('\'');
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(&(_, ch)) => {
                    value.push(ch);
                    self.advance();
                }
                None => return Err(self.error("unterminated string", start)),
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self, negative: bool) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();
        if negative {
            num_str.push('-');
        }

        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() {
                num_str.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        // Only treat '.' as a decimal point when a digit follows it
        if self.peek_char() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some(&(_, c)) if c.is_ascii_digit()) {
                num_str.push('.');
                self.advance();
                while let Some(ch) = self.peek_char() {
                    if ch.is_ascii_digit() {
                        num_str.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(&format!("invalid number: {}", num_str), start))
    }

    fn read_identifier(&mut self) -> Result<Token, LexError> {
        let mut ident = String::new();

        // Job and step ids may contain dashes (`needs.build-linux.result`)
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let token = match ident.to_lowercase().as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        };

        Ok(token)
    }
}

/// A piece of a templated string
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Plain text copied as-is
    Text(String),
    /// The inner source of a `${{ expression }}`
    Expression(String),
}

/// Split a string into plain text and `${{ }}` expressions.
///
/// An unterminated `${{` is kept as text.
pub fn extract_templates(input: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut rest = input;
    let mut text = String::new();

    while let Some(start) = rest.find("${{") {
        let after_open = &rest[start + 3..];
        match find_template_close(after_open) {
            Some(end) => {
                text.push_str(&rest[..start]);
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                parts.push(TemplatePart::Expression(after_open[..end].trim().to_string()));
                rest = &after_open[end + 2..];
            }
            None => break,
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }

    parts
}

/// Strip a single `${{ }}` wrapper around a whole expression, if present
pub fn strip_template(input: &str) -> &str {
    let trimmed = input.trim();
    if let Some(inner) = trimmed
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        if !inner.contains("${{") {
            return inner.trim();
        }
    }
    trimmed
}

fn find_template_close(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && i + 1 < bytes.len() && bytes[i + 1] == b'}' => return Some(i),
            _ => {}
        }
        i += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_lexer_comparison_operators() {
        assert_eq!(
            lex("== != < <= > >="),
            vec![
                Token::Eq,
                Token::Ne,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_logical_operators() {
        assert_eq!(
            lex("a && !b || c"),
            vec![
                Token::Identifier("a".into()),
                Token::And,
                Token::Not,
                Token::Identifier("b".into()),
                Token::Or,
                Token::Identifier("c".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_escaped_string() {
        assert_eq!(
            lex("'it''s'"),
            vec![Token::String("it's".into()), Token::Eof]
        );
    }

    #[test]
    fn test_lexer_numbers() {
        assert_eq!(lex("42"), vec![Token::Number(42.0), Token::Eof]);
        assert_eq!(lex("3.25"), vec![Token::Number(3.25), Token::Eof]);
        assert_eq!(lex("-1"), vec![Token::Number(-1.0), Token::Eof]);
    }

    #[test]
    fn test_lexer_dashed_identifiers() {
        assert_eq!(
            lex("needs.build-linux.result"),
            vec![
                Token::Identifier("needs".into()),
                Token::Dot,
                Token::Identifier("build-linux".into()),
                Token::Dot,
                Token::Identifier("result".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_keywords_are_case_insensitive() {
        assert_eq!(
            lex("TRUE False null"),
            vec![Token::True, Token::False, Token::Null, Token::Eof]
        );
    }

    #[test]
    fn test_lexer_rejects_single_ampersand() {
        let err = Lexer::new("a & b").tokenize().unwrap_err();
        assert_eq!(err.position, 2);
    }

    #[test]
    fn test_lexer_unterminated_string() {
        assert!(Lexer::new("'open").tokenize().is_err());
    }

    #[test]
    fn test_extract_templates_mixed() {
        let parts = extract_templates("deploy ${{ matrix.os }} at ${{ event.sha }}!");
        assert_eq!(
            parts,
            vec![
                TemplatePart::Text("deploy ".into()),
                TemplatePart::Expression("matrix.os".into()),
                TemplatePart::Text(" at ".into()),
                TemplatePart::Expression("event.sha".into()),
                TemplatePart::Text("!".into()),
            ]
        );
    }

    #[test]
    fn test_extract_templates_braces_inside_string() {
        let parts = extract_templates("${{ format('{0}}}', 'x') }}");
        assert_eq!(
            parts,
            vec![TemplatePart::Expression("format('{0}}}', 'x')".into())]
        );
    }

    #[test]
    fn test_extract_templates_unterminated_is_text() {
        assert_eq!(
            extract_templates("echo ${{ oops"),
            vec![TemplatePart::Text("echo ${{ oops".into())]
        );
    }

    #[test]
    fn test_strip_template() {
        assert_eq!(strip_template("${{ success() }}"), "success()");
        assert_eq!(strip_template("  failure() "), "failure()");
    }
}
