//! Tokenizer for generated Python source.
//!
//! The lexer groups tokens into logical lines (physical lines joined by open
//! brackets or backslash continuations) and records each line's indentation
//! column. It reports the syntax errors that are detectable at the token
//! level: unterminated strings, unbalanced brackets and stray characters.
//!
//! Replacement fields of f-strings are not tokenized in place; their source
//! text is collected separately so the validator can scan them as
//! independent expressions.

use std::fmt;

/// Python hard keywords.
pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const THREE_CHAR_OPS: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];

const TWO_CHAR_OPS: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "<<", ">>", "->", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "@=", ":=",
];

const ONE_CHAR_OPS: &str = "+-*/%@&|^~<>()[]{},:.;=";

const TAB_SIZE: usize = 8;

/// Category of a lexical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Keyword,
    Number,
    Str,
    Op,
}

/// A single lexical token with the physical line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
        }
    }

    /// Returns true if this is the operator `op`.
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    /// Returns true if this is the keyword `kw`.
    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == kw
    }

    /// Tokens that can end an operand: names, literals and closing brackets.
    pub fn ends_operand(&self) -> bool {
        match self.kind {
            TokenKind::Name | TokenKind::Number | TokenKind::Str => true,
            TokenKind::Keyword => matches!(self.text.as_str(), "True" | "False" | "None"),
            TokenKind::Op => matches!(self.text.as_str(), ")" | "]" | "}"),
        }
    }

    /// Tokens that start a fresh operand without an operator in between.
    pub fn starts_operand(&self) -> bool {
        match self.kind {
            TokenKind::Name | TokenKind::Number | TokenKind::Str => true,
            TokenKind::Keyword => matches!(self.text.as_str(), "True" | "False" | "None"),
            TokenKind::Op => false,
        }
    }
}

/// One logical line of source.
#[derive(Debug, Clone)]
pub struct LogicalLine {
    pub indent: usize,
    pub line: usize,
    pub tokens: Vec<Token>,
}

/// A syntax error detected while tokenizing or parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub message: String,
    pub line: usize,
}

impl SyntaxIssue {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {})", self.message, self.line)
    }
}

/// Output of tokenization.
#[derive(Debug, Clone, Default)]
pub struct TokenizedSource {
    pub lines: Vec<LogicalLine>,
    /// Source text of every f-string replacement field, with its line.
    pub embedded: Vec<(String, usize)>,
}

/// Tokenizes Python source into logical lines.
pub fn tokenize(source: &str) -> Result<TokenizedSource, SyntaxIssue> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    brackets: Vec<(char, usize)>,
    out: TokenizedSource,
    current: Vec<Token>,
    current_indent: usize,
    current_line: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            brackets: Vec::new(),
            out: TokenizedSource::default(),
            current: Vec::new(),
            current_indent: 0,
            current_line: 1,
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Result<TokenizedSource, SyntaxIssue> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.brackets.is_empty() {
                if !self.begin_line() {
                    continue;
                }
                at_line_start = false;
            }

            let c = self.chars[self.pos];
            match c {
                ' ' | '\t' | '\x0c' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' => {
                    let next = self.peek(1);
                    let after = self.peek(2);
                    if next == Some('\n') {
                        self.pos += 2;
                        self.line += 1;
                    } else if next == Some('\r') && after == Some('\n') {
                        self.pos += 3;
                        self.line += 1;
                    } else {
                        return Err(SyntaxIssue::new(
                            "unexpected character after line continuation character",
                            self.line,
                        ));
                    }
                }
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.brackets.is_empty() {
                        self.flush_line();
                        at_line_start = true;
                    }
                }
                '\'' | '"' => self.lex_string(String::new())?,
                c if c.is_ascii_digit() => self.lex_number(),
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.lex_number(),
                c if c == '_' || c.is_alphabetic() => self.lex_name()?,
                _ => self.lex_op()?,
            }
        }

        if let Some((open, line)) = self.brackets.last() {
            return Err(SyntaxIssue::new(format!("'{}' was never closed", open), *line));
        }

        self.flush_line();
        Ok(self.out)
    }

    /// Measures indentation at the start of a physical line. Returns false
    /// when the line is blank or a comment and has been consumed.
    fn begin_line(&mut self) -> bool {
        let mut col = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => col += 1,
                '\t' => col = (col / TAB_SIZE + 1) * TAB_SIZE,
                '\x0c' => col = 0,
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek(0) {
            None => false,
            Some('#') => {
                self.skip_comment();
                false
            }
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                false
            }
            Some('\r') if self.peek(1) == Some('\n') => {
                self.pos += 2;
                self.line += 1;
                false
            }
            Some(_) => {
                self.current_indent = col;
                self.current_line = self.line;
                true
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn flush_line(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.out.lines.push(LogicalLine {
            indent: self.current_indent,
            line: self.current_line,
            tokens: std::mem::take(&mut self.current),
        });
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>, line: usize) {
        self.current.push(Token::new(kind, text, line));
    }

    fn lex_name(&mut self) -> Result<(), SyntaxIssue> {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c == '_' || c.is_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(0), Some('\'') | Some('"')) && is_string_prefix(&text) {
            return self.lex_string(text);
        }

        let kind = if KEYWORDS.contains(&text.as_str()) {
            TokenKind::Keyword
        } else {
            TokenKind::Name
        };
        let line = self.line;
        self.push(kind, text, line);
        Ok(())
    }

    fn lex_number(&mut self) {
        let start = self.pos;
        let line = self.line;
        let hex = self.peek(0) == Some('0') && matches!(self.peek(1), Some('x') | Some('X'));
        while let Some(c) = self.peek(0) {
            let exponent_sign = (c == '+' || c == '-')
                && !hex
                && self.pos > start
                && matches!(self.chars[self.pos - 1], 'e' | 'E');
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        self.push(TokenKind::Number, text, line);
    }

    fn lex_string(&mut self, prefix: String) -> Result<(), SyntaxIssue> {
        let start_line = self.line;
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        let raw = prefix.to_ascii_lowercase().contains('r');
        let formatted = prefix.to_ascii_lowercase().contains('f');

        self.pos += if triple { 3 } else { 1 };
        let body_start = self.pos;

        loop {
            let Some(c) = self.peek(0) else {
                let message = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(SyntaxIssue::new(message, start_line));
            };

            if c == '\\' {
                if self.peek(1) == Some('\n') {
                    self.line += 1;
                }
                self.pos += 2;
                continue;
            }

            if c == '\n' {
                if !triple {
                    return Err(SyntaxIssue::new("unterminated string literal", start_line));
                }
                self.line += 1;
                self.pos += 1;
                continue;
            }

            if c == quote {
                if !triple {
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    break;
                }
            }
            self.pos += 1;
        }

        let body: String = self.chars[body_start..self.pos].iter().collect();
        self.pos += if triple { 3 } else { 1 };

        if formatted {
            collect_replacement_fields(&body, start_line, raw, &mut self.out.embedded);
        }

        let mut text = prefix;
        text.push(quote);
        text.push_str(&body);
        text.push(quote);
        self.push(TokenKind::Str, text, start_line);
        Ok(())
    }

    fn lex_op(&mut self) -> Result<(), SyntaxIssue> {
        let line = self.line;
        let rest: String = self.chars[self.pos..(self.pos + 3).min(self.chars.len())]
            .iter()
            .collect();

        for op in THREE_CHAR_OPS {
            if rest.starts_with(op) {
                self.pos += 3;
                self.push(TokenKind::Op, *op, line);
                return Ok(());
            }
        }
        for op in TWO_CHAR_OPS {
            if rest.starts_with(op) {
                self.pos += 2;
                self.push(TokenKind::Op, *op, line);
                return Ok(());
            }
        }

        let c = self.chars[self.pos];
        if !ONE_CHAR_OPS.contains(c) {
            return Err(SyntaxIssue::new(
                format!("invalid character '{}'", c),
                line,
            ));
        }

        match c {
            '(' | '[' | '{' => self.brackets.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    None => {
                        return Err(SyntaxIssue::new(format!("unmatched '{}'", c), line));
                    }
                    Some((open, _)) if open != expected => {
                        return Err(SyntaxIssue::new(
                            format!(
                                "closing parenthesis '{}' does not match opening parenthesis '{}'",
                                c, open
                            ),
                            line,
                        ));
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }

        self.pos += 1;
        self.push(TokenKind::Op, c.to_string(), line);
        Ok(())
    }
}

fn is_string_prefix(text: &str) -> bool {
    matches!(
        text.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

/// Extracts the expression text of every `{...}` field in an f-string body,
/// including fields nested in format specs.
fn collect_replacement_fields(
    body: &str,
    line: usize,
    raw: bool,
    out: &mut Vec<(String, usize)>,
) {
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if !raw => i += 2,
            '{' if chars.get(i + 1) == Some(&'{') => i += 2,
            '{' => {
                let (expr, spec, next) = split_field(&chars, i + 1);
                let expr = expr.trim();
                let expr = expr.strip_suffix('=').map(str::trim_end).unwrap_or(expr);
                if !expr.is_empty() {
                    out.push((expr.to_string(), line));
                }
                if let Some(spec) = spec {
                    collect_replacement_fields(&spec, line, raw, out);
                }
                i = next;
            }
            _ => i += 1,
        }
    }
}

/// Splits one replacement field starting after its `{` into the expression
/// and optional format spec. Returns the index just past the closing `}`.
fn split_field(chars: &[char], start: usize) -> (String, Option<String>, usize) {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    let mut expr_end: Option<usize> = None;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '}' => {
                let expr: String = chars[start..expr_end.unwrap_or(i)].iter().collect();
                return (expr, None, i + 1);
            }
            '!' if depth == 0 && expr_end.is_none() && chars.get(i + 1) != Some(&'=') => {
                expr_end = Some(i);
            }
            ':' if depth == 0 => {
                // the spec may hold nested fields; scan it with brace counting
                let mut nested = 0usize;
                let mut j = i + 1;
                while j < chars.len() {
                    match chars[j] {
                        '{' => nested += 1,
                        '}' if nested > 0 => nested -= 1,
                        '}' => break,
                        _ => {}
                    }
                    j += 1;
                }
                let expr: String = chars[start..expr_end.unwrap_or(i)].iter().collect();
                let spec: String = chars[i + 1..j.min(chars.len())].iter().collect();
                return (expr, Some(spec), j + 1);
            }
            _ => {}
        }
        i += 1;
    }

    let expr: String = chars[start..expr_end.unwrap_or(chars.len())].iter().collect();
    (expr, None, chars.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(line: &LogicalLine) -> Vec<&str> {
        line.tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn test_logical_lines_join_brackets() {
        let src = "x = foo(1,\n        2)\ny = 3\n";
        let out = tokenize(src).unwrap();
        assert_eq!(out.lines.len(), 2);
        assert_eq!(texts(&out.lines[0]), vec!["x", "=", "foo", "(", "1", ",", "2", ")"]);
        assert_eq!(out.lines[1].line, 3);
    }

    #[test]
    fn test_backslash_continuation() {
        let out = tokenize("total = 1 + \\\n    2\n").unwrap();
        assert_eq!(out.lines.len(), 1);
        assert_eq!(out.lines[0].tokens.len(), 5);
    }

    #[test]
    fn test_indentation_and_comments() {
        let src = "if x:\n    # comment only\n\n    y = 1\n";
        let out = tokenize(src).unwrap();
        assert_eq!(out.lines.len(), 2);
        assert_eq!(out.lines[0].indent, 0);
        assert_eq!(out.lines[1].indent, 4);
    }

    #[test]
    fn test_keywords_and_names() {
        let out = tokenize("import pandas as pd\n").unwrap();
        let kinds: Vec<TokenKind> = out.lines[0].tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TokenKind::Keyword, TokenKind::Name, TokenKind::Keyword, TokenKind::Name]
        );
    }

    #[test]
    fn test_strings_with_prefixes() {
        let out = tokenize("a = rb'\\d+'\nb = \"\"\"multi\nline\"\"\"\n").unwrap();
        assert_eq!(out.lines.len(), 2);
        assert_eq!(out.lines[0].tokens[2].kind, TokenKind::Str);
        assert_eq!(out.lines[1].tokens[2].kind, TokenKind::Str);
    }

    #[test]
    fn test_fstring_fields_collected() {
        let out = tokenize("msg = f\"{df.shape} {{literal}} {value:{width}.2f} {x=}\"\n").unwrap();
        let fields: Vec<&str> = out.embedded.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(fields, vec!["df.shape", "value", "width", "x"]);
    }

    #[test]
    fn test_numbers() {
        let out = tokenize("a = 1.5e-3 + 0xFF + .5 + 1_000j\n").unwrap();
        let numbers: Vec<&str> = out.lines[0]
            .tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Number)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(numbers, vec!["1.5e-3", "0xFF", ".5", "1_000j"]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x = 'abc\n").unwrap_err();
        assert_eq!(err.message, "unterminated string literal");
        assert_eq!(err.line, 1);

        let err = tokenize("x = \"\"\"never closed\n").unwrap_err();
        assert_eq!(err.message, "unterminated triple-quoted string literal");
    }

    #[test]
    fn test_bracket_errors() {
        let err = tokenize("print((1, 2)\n").unwrap_err();
        assert_eq!(err.message, "'(' was never closed");

        let err = tokenize("x = [1, 2)\n").unwrap_err();
        assert!(err.message.contains("does not match"));

        let err = tokenize("x = 1)\n").unwrap_err();
        assert_eq!(err.message, "unmatched ')'");
    }

    #[test]
    fn test_invalid_character() {
        let err = tokenize("x = $y\n").unwrap_err();
        assert_eq!(err.message, "invalid character '$'");
    }

    #[test]
    fn test_operators_longest_match() {
        let out = tokenize("x **= 2; y //= 3; z = a != b\n").unwrap();
        let ops: Vec<&str> = out.lines[0]
            .tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Op)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec!["**=", ";", "//=", ";", "=", "!="]);
    }
}
