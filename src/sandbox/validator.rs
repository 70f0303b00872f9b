//! Static validation of generated Python code.
//!
//! Code is tokenized, its block structure checked, and every simple
//! statement scanned for calls, attribute accesses and imports that the
//! sandbox refuses to run. The deny-lists are enforcing; the import
//! allow-list is advisory and only produces warnings.

use serde::Serialize;

use super::lexer::{tokenize, LogicalLine, SyntaxIssue, Token, TokenKind, TokenizedSource};

/// Names that may not be called directly.
pub const FORBIDDEN_CALLS: &[&str] = &["exec", "eval", "compile", "__import__", "breakpoint", "input"];

/// Attributes that may not be accessed on any object.
pub const FORBIDDEN_ATTRIBUTES: &[&str] = &[
    "system", "popen", "spawn", "execv", "kill", "remove", "rmdir", "rmtree",
];

/// Top-level packages that may not be imported.
pub const FORBIDDEN_IMPORTS: &[&str] = &[
    "subprocess",
    "shutil",
    "socket",
    "http",
    "urllib",
    "requests",
    "httpx",
    "ftplib",
    "smtplib",
    "ctypes",
    "multiprocessing",
    "threading",
    "signal",
];

/// Packages expected in generated ML code. Anything else is a warning.
pub const ALLOWED_IMPORTS: &[&str] = &[
    "pandas",
    "numpy",
    "sklearn",
    "scikit-learn",
    "xgboost",
    "lightgbm",
    "optuna",
    "matplotlib",
    "seaborn",
    "scipy",
    "joblib",
    "json",
    "math",
    "statistics",
    "collections",
    "itertools",
    "functools",
    "datetime",
    "pathlib",
    "os",
    "warnings",
    "typing",
    "dataclasses",
    "re",
    "io",
    "csv",
    "pickle",
];

/// Double-underscore attributes that remain accessible.
pub const SAFE_DUNDERS: &[&str] = &["__name__", "__init__", "__class__", "__dict__", "__len__"];

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "try", "except", "finally", "with", "def", "class",
];

/// Outcome of validating one block of code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationReport {
    /// Rejection reason, `None` when the code may run.
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    fn rejected(error: String) -> Self {
        Self {
            error: Some(error),
            warnings: Vec::new(),
        }
    }
}

/// Validates Python source before execution.
pub fn validate_code(code: &str) -> ValidationReport {
    let source = match tokenize(code) {
        Ok(source) => source,
        Err(issue) => return ValidationReport::rejected(syntax_error(&issue)),
    };

    if let Err(issue) = check_structure(&source.lines) {
        return ValidationReport::rejected(syntax_error(&issue));
    }

    // Fields must parse on their own before anything is scanned.
    let mut embedded = Vec::with_capacity(source.embedded.len());
    if let Err(issue) = tokenize_fields(&source.embedded, &mut embedded) {
        return ValidationReport::rejected(syntax_error(&issue));
    }

    let mut warnings = Vec::new();
    for line in &source.lines {
        for statement in split_statements(&line.tokens) {
            if let Err(error) = scan_statement(statement, &mut warnings) {
                return ValidationReport::rejected(error);
            }
        }
    }

    for tokens in &embedded {
        for line in &tokens.lines {
            if let Err(error) = scan_tokens(&line.tokens) {
                return ValidationReport::rejected(error);
            }
        }
    }

    ValidationReport {
        error: None,
        warnings,
    }
}

/// Tokenizes every f-string replacement field, including fields of
/// f-strings nested inside other fields. Nested fields report the line of
/// the outermost string.
fn tokenize_fields(
    fields: &[(String, usize)],
    out: &mut Vec<TokenizedSource>,
) -> Result<(), SyntaxIssue> {
    for (expr, line) in fields {
        let tokens = tokenize(expr)
            .map_err(|issue| SyntaxIssue::new(format!("f-string: {}", issue.message), *line))?;
        let nested: Vec<(String, usize)> = tokens
            .embedded
            .iter()
            .map(|(inner, _)| (inner.clone(), *line))
            .collect();
        out.push(tokens);
        tokenize_fields(&nested, out)?;
    }
    Ok(())
}

fn syntax_error(issue: &SyntaxIssue) -> String {
    format!("SyntaxError: {}", issue)
}

fn is_compound_header(tokens: &[Token]) -> bool {
    let Some(first) = tokens.first() else {
        return false;
    };
    if first.kind == TokenKind::Keyword {
        if COMPOUND_KEYWORDS.contains(&first.text.as_str()) {
            return true;
        }
        if first.text == "async" {
            return tokens
                .get(1)
                .is_some_and(|t| t.is_keyword("def") || t.is_keyword("for") || t.is_keyword("with"));
        }
    }
    // soft keywords only open a block when the line ends with a colon
    first.kind == TokenKind::Name
        && matches!(first.text.as_str(), "match" | "case")
        && tokens.len() > 1
        && tokens.last().is_some_and(|t| t.is_op(":"))
        && !tokens[1].is_op("=")
        && !tokens[1].is_op(".")
        && !tokens[1].is_op("(")
}

/// Index of the colon that closes a compound statement header.
fn header_colon(tokens: &[Token]) -> Option<usize> {
    let mut depth = 0usize;
    let mut pending_lambdas = 0usize;
    for (i, tok) in tokens.iter().enumerate() {
        if tok.kind == TokenKind::Op {
            match tok.text.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                ":" if depth == 0 => {
                    if pending_lambdas > 0 {
                        pending_lambdas -= 1;
                    } else {
                        return Some(i);
                    }
                }
                _ => {}
            }
        } else if depth == 0 && tok.is_keyword("lambda") {
            pending_lambdas += 1;
        }
    }
    None
}

/// Keyword of a compound statement header, `async` prefix dropped.
fn block_keyword(tokens: &[Token]) -> Option<&str> {
    if !is_compound_header(tokens) {
        return None;
    }
    match tokens[0].text.as_str() {
        "async" => tokens.get(1).map(|t| t.text.as_str()),
        other => Some(other),
    }
}

/// Headers a continuation clause may directly follow at its own level.
fn continues(keyword: &str) -> Option<&'static [&'static str]> {
    match keyword {
        "elif" => Some(&["if", "elif"]),
        "else" => Some(&["if", "elif", "for", "while", "except"]),
        "except" => Some(&["try", "except"]),
        "finally" => Some(&["try", "except", "else"]),
        _ => None,
    }
}

fn check_structure(lines: &[LogicalLine]) -> Result<(), SyntaxIssue> {
    let mut indents = vec![0usize];
    // last compound keyword seen at each open indentation level
    let mut headers: Vec<Option<String>> = vec![None];
    let mut open_block: Option<(String, usize)> = None;

    for line in lines {
        let top = indents.last().copied().unwrap_or(0);

        if let Some((keyword, header_line)) = open_block.take() {
            if line.indent <= top {
                return Err(SyntaxIssue::new(
                    format!(
                        "expected an indented block after '{}' statement on line {}",
                        keyword, header_line
                    ),
                    line.line,
                ));
            }
            indents.push(line.indent);
            headers.push(None);
        } else if line.indent > top {
            return Err(SyntaxIssue::new("unexpected indent", line.line));
        } else if line.indent < top {
            while indents.last().is_some_and(|&i| i > line.indent) {
                indents.pop();
                headers.pop();
            }
            if indents.last().copied() != Some(line.indent) {
                return Err(SyntaxIssue::new(
                    "unindent does not match any outer indentation level",
                    line.line,
                ));
            }
        }

        check_line(line)?;

        let tokens = &line.tokens;
        let keyword = block_keyword(tokens);
        if let Some(allowed) = keyword.and_then(continues) {
            let previous = headers.last().and_then(|h| h.as_deref());
            if !previous.is_some_and(|p| allowed.contains(&p)) {
                return Err(SyntaxIssue::new("invalid syntax", line.line));
            }
        }

        if let Some(keyword) = keyword {
            let colon = header_colon(tokens).ok_or_else(|| SyntaxIssue::new("expected ':'", line.line))?;
            if colon == tokens.len() - 1 {
                open_block = Some((keyword.to_string(), line.line));
            }
        } else if tokens.last().is_some_and(|t| t.is_op(":")) {
            return Err(SyntaxIssue::new("invalid syntax", line.line));
        }
        if let Some(slot) = headers.last_mut() {
            *slot = keyword.map(str::to_string);
        }
    }

    if let Some((keyword, header_line)) = open_block {
        return Err(SyntaxIssue::new(
            format!(
                "expected an indented block after '{}' statement on line {}",
                keyword, header_line
            ),
            header_line,
        ));
    }

    Ok(())
}

/// Token-level checks inside one logical line.
fn check_line(line: &LogicalLine) -> Result<(), SyntaxIssue> {
    let tokens = &line.tokens;

    if let Some(last) = tokens.last() {
        let star_import = last.is_op("*")
            && tokens.len() >= 2
            && tokens[tokens.len() - 2].is_keyword("import");
        let dangling = last.kind == TokenKind::Op
            && !star_import
            && !matches!(last.text.as_str(), ")" | "]" | "}" | "," | ":" | ";" | "...");
        let bare_keyword = last.kind == TokenKind::Keyword
            && matches!(
                last.text.as_str(),
                "and" | "or" | "not" | "in" | "is" | "if" | "else" | "elif" | "for" | "while"
                    | "with" | "import" | "from" | "as" | "lambda" | "del" | "assert"
                    | "global" | "nonlocal" | "await"
            );
        if dangling || bare_keyword {
            return Err(SyntaxIssue::new("invalid syntax", last.line));
        }
    }

    check_walrus(tokens)?;

    let soft_start = tokens.first().is_some_and(|t| {
        t.kind == TokenKind::Name && matches!(t.text.as_str(), "match" | "case" | "type")
    });

    for (i, pair) in tokens.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        if i == 0 && soft_start {
            continue;
        }
        if prev.kind == TokenKind::Str && next.kind == TokenKind::Str {
            continue;
        }
        if prev.ends_operand() && next.starts_operand() {
            let message = if prev.kind == TokenKind::Name && prev.text == "print" {
                "Missing parentheses in call to 'print'"
            } else {
                "invalid syntax"
            };
            return Err(SyntaxIssue::new(message, next.line));
        }
    }

    Ok(())
}

/// An unparenthesized `:=` is only valid in an `if`, `elif` or `while`
/// condition.
fn check_walrus(tokens: &[Token]) -> Result<(), SyntaxIssue> {
    let condition_end = match tokens.first() {
        Some(t) if t.is_keyword("if") || t.is_keyword("elif") || t.is_keyword("while") => {
            header_colon(tokens).unwrap_or(0)
        }
        _ => 0,
    };
    let mut depth = 0usize;
    for (i, tok) in tokens.iter().enumerate() {
        if tok.kind != TokenKind::Op {
            continue;
        }
        match tok.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth = depth.saturating_sub(1),
            ":=" if depth == 0 && i >= condition_end => {
                return Err(SyntaxIssue::new("invalid syntax", tok.line));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Splits a logical line into simple statements: on `;` at bracket depth
/// zero and after the colon of an inline compound header.
fn split_statements(tokens: &[Token]) -> Vec<&[Token]> {
    let mut statements = Vec::new();
    let mut rest = tokens;

    while !rest.is_empty() {
        if is_compound_header(rest) {
            if let Some(colon) = header_colon(rest) {
                statements.push(&rest[..colon]);
                rest = &rest[colon + 1..];
                continue;
            }
        }

        let mut depth = 0usize;
        let mut end = rest.len();
        for (i, tok) in rest.iter().enumerate() {
            if tok.kind != TokenKind::Op {
                continue;
            }
            match tok.text.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                ";" if depth == 0 => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        statements.push(&rest[..end]);
        rest = if end < rest.len() { &rest[end + 1..] } else { &[] };
    }

    statements.into_iter().filter(|s| !s.is_empty()).collect()
}

fn scan_statement(tokens: &[Token], warnings: &mut Vec<String>) -> Result<(), String> {
    match tokens.first() {
        Some(t) if t.is_keyword("import") => check_import(tokens, warnings),
        Some(t) if t.is_keyword("from") => check_from_import(tokens, warnings),
        _ => scan_tokens(tokens),
    }
}

/// Checks calls, attribute accesses and dunder accesses in an expression or
/// non-import statement.
fn scan_tokens(tokens: &[Token]) -> Result<(), String> {
    for (i, tok) in tokens.iter().enumerate() {
        let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
        let next = tokens.get(i + 1);

        if tok.kind == TokenKind::Name
            && FORBIDDEN_CALLS.contains(&tok.text.as_str())
            && next.is_some_and(|n| n.is_op("("))
            && !prev.is_some_and(|p| p.is_op(".") || p.is_keyword("def") || p.is_keyword("class"))
        {
            return Err(format!("Forbidden function call: {}()", tok.text));
        }

        if tok.is_op(".") {
            if let Some(attr) = next.filter(|n| matches!(n.kind, TokenKind::Name | TokenKind::Keyword)) {
                check_attribute(&attr.text)?;
            }
        }
    }
    Ok(())
}

fn check_attribute(attr: &str) -> Result<(), String> {
    if FORBIDDEN_ATTRIBUTES.contains(&attr) {
        return Err(format!("Forbidden attribute access: .{}", attr));
    }
    if attr.starts_with("__") && !SAFE_DUNDERS.contains(&attr) {
        return Err(format!("Forbidden dunder access: .{}", attr));
    }
    Ok(())
}

fn check_module(module: &str, warnings: &mut Vec<String>) -> Result<(), String> {
    let root = module.split('.').next().unwrap_or(module);
    if FORBIDDEN_IMPORTS.contains(&root) {
        return Err(format!("Forbidden import: {}", module));
    }
    if !ALLOWED_IMPORTS.contains(&root) {
        warnings.push(format!("Unrecognized import: {}", module));
    }
    Ok(())
}

/// Reads a dotted name starting at `pos`, returning it and the next index.
fn dotted_name(tokens: &[Token], mut pos: usize) -> Option<(String, usize)> {
    let first = tokens.get(pos).filter(|t| t.kind == TokenKind::Name)?;
    let mut name = first.text.clone();
    pos += 1;
    while tokens.get(pos).is_some_and(|t| t.is_op(".")) {
        let part = tokens.get(pos + 1).filter(|t| t.kind == TokenKind::Name)?;
        name.push('.');
        name.push_str(&part.text);
        pos += 2;
    }
    Some((name, pos))
}

fn invalid_import(tokens: &[Token]) -> String {
    let line = tokens.first().map(|t| t.line).unwrap_or(1);
    syntax_error(&SyntaxIssue::new("invalid syntax", line))
}

/// `import a.b as c, d`
fn check_import(tokens: &[Token], warnings: &mut Vec<String>) -> Result<(), String> {
    let mut pos = 1;
    loop {
        let (module, next) = dotted_name(tokens, pos).ok_or_else(|| invalid_import(tokens))?;
        check_module(&module, warnings)?;
        pos = next;
        if tokens.get(pos).is_some_and(|t| t.is_keyword("as")) {
            if !tokens.get(pos + 1).is_some_and(|t| t.kind == TokenKind::Name) {
                return Err(invalid_import(tokens));
            }
            pos += 2;
        }
        match tokens.get(pos) {
            None => return Ok(()),
            Some(t) if t.is_op(",") => pos += 1,
            Some(_) => return Err(invalid_import(tokens)),
        }
    }
}

/// `from pkg.mod import a as b, c` and relative forms.
fn check_from_import(tokens: &[Token], warnings: &mut Vec<String>) -> Result<(), String> {
    let mut pos = 1;
    while tokens.get(pos).is_some_and(|t| t.is_op(".") || t.is_op("...")) {
        pos += 1;
    }
    let relative = pos > 1;

    match dotted_name(tokens, pos) {
        Some((module, next)) => {
            check_module(&module, warnings)?;
            pos = next;
        }
        None if relative => {}
        None => return Err(invalid_import(tokens)),
    }

    if !tokens.get(pos).is_some_and(|t| t.is_keyword("import")) {
        return Err(invalid_import(tokens));
    }
    pos += 1;

    let names: Vec<&Token> = tokens[pos..]
        .iter()
        .filter(|t| !t.is_op("(") && !t.is_op(")"))
        .collect();
    if names.is_empty() {
        return Err(invalid_import(tokens));
    }
    if names.len() == 1 && names[0].is_op("*") {
        return Ok(());
    }

    let mut expect_name = true;
    let mut after_as = false;
    for tok in names {
        if expect_name {
            if tok.kind != TokenKind::Name {
                return Err(invalid_import(tokens));
            }
            if !after_as {
                check_attribute(&tok.text)?;
            }
            expect_name = false;
            after_as = false;
        } else if tok.is_keyword("as") {
            expect_name = true;
            after_as = true;
        } else if tok.is_op(",") {
            expect_name = true;
        } else {
            return Err(invalid_import(tokens));
        }
    }
    Ok(())
}
