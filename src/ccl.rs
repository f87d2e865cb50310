//! Covenant Constraint Language (CCL) parser and evaluator.
//!
//! CCL is the small DSL covenants carry to express behavioral constraints.
//! Three statement forms:
//!
//! - `permit <action> on <resource> [when <cond>] [severity <sev>]`
//! - `deny <action> on <resource> [when <cond>] [severity <sev>]`
//! - `limit <action> <count> per <period> <unit> [severity <sev>]`
//!
//! Evaluation semantics: default deny, most specific matching rule wins,
//! deny wins over permit at equal specificity.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Severity attached to a rule or carried by breach evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The three CCL statement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Permit,
    Deny,
    Limit,
}

/// Comparators usable in `when` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    Matches,
}

impl Comparator {
    fn from_token(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "in" => Some(Self::In),
            "contains" => Some(Self::Contains),
            "matches" => Some(Self::Matches),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::Contains => "contains",
            Self::Matches => "matches",
        }
    }
}

/// A condition comparing a dot-path into the evaluation context to a literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    pub value: Value,
}

/// One parsed CCL statement.
///
/// `count` and `period_seconds` are set only for limit statements; limits
/// carry the `**` resource so every rule has a non-empty pattern pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub action: String,
    pub resource: String,
    pub condition: Option<Condition>,
    pub severity: Option<Severity>,
    pub count: Option<u64>,
    pub period_seconds: Option<u64>,
}

impl std::fmt::Display for Statement {
    /// Renders the statement as CCL source text.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serialize_statement(self))
    }
}

/// A parsed CCL document.
///
/// `statements` preserves source order for serialization round-trips; the
/// grouped vectors are what evaluation walks.
#[derive(Debug, Clone)]
pub struct CclDocument {
    pub statements: Vec<Statement>,
    pub permits: Vec<Statement>,
    pub denies: Vec<Statement>,
    pub limits: Vec<Statement>,
}

/// Result of evaluating a policy against an (action, resource, context).
#[derive(Debug)]
pub struct Evaluation {
    pub permitted: bool,
    pub reason: String,
    pub matched_rule: Option<Statement>,
    pub severity: Option<Severity>,
}

/// Result of checking an action against its rate limit.
#[derive(Debug)]
pub struct RateLimitResult {
    pub exceeded: bool,
    pub remaining: u64,
    pub limit: u64,
}

/// One narrowing violation: a child rule and the parent rule it contradicts.
#[derive(Debug)]
pub struct NarrowingViolation {
    pub child_rule: String,
    pub parent_rule: Option<String>,
    pub message: String,
}

/// Result of validating that a child policy only narrows its parent.
#[derive(Debug)]
pub struct NarrowingResult {
    pub valid: bool,
    pub violations: Vec<NarrowingViolation>,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenType {
    Permit,
    Deny,
    Limit,
    On,
    When,
    Severity,
    Per,
    TimeUnit,
    Identifier,
    Number,
    StringLit,
    Operator,
    Dot,
    Wildcard,
    DoubleWildcard,
    LBracket,
    RBracket,
    Comma,
    Newline,
    Comment,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    token_type: TokenType,
    value: String,
    line: usize,
    column: usize,
}

fn keyword_type(word: &str) -> Option<TokenType> {
    match word {
        "permit" => Some(TokenType::Permit),
        "deny" => Some(TokenType::Deny),
        "limit" => Some(TokenType::Limit),
        "on" => Some(TokenType::On),
        "when" => Some(TokenType::When),
        "severity" => Some(TokenType::Severity),
        "per" => Some(TokenType::Per),
        "second" | "seconds" | "minute" | "minutes" | "hour" | "hours" | "day" | "days" => {
            Some(TokenType::TimeUnit)
        }
        _ => None,
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut pos = 0;
    let mut line = 1;
    let mut column = 1;

    while pos < chars.len() {
        let ch = chars[pos];

        if ch == ' ' || ch == '\t' || ch == '\r' {
            pos += 1;
            column += 1;
            continue;
        }

        if ch == '\n' {
            if tokens
                .last()
                .is_some_and(|t| t.token_type != TokenType::Newline)
            {
                tokens.push(Token {
                    token_type: TokenType::Newline,
                    value: "\n".to_string(),
                    line,
                    column,
                });
            }
            pos += 1;
            line += 1;
            column = 1;
            continue;
        }

        // Comment runs to end of line.
        if ch == '#' {
            let start_col = column;
            let mut comment = String::new();
            while pos < chars.len() && chars[pos] != '\n' {
                comment.push(chars[pos]);
                pos += 1;
                column += 1;
            }
            tokens.push(Token {
                token_type: TokenType::Comment,
                value: comment,
                line,
                column: start_col,
            });
            continue;
        }

        // Single-quoted string.
        if ch == '\'' {
            let start_line = line;
            let start_col = column;
            pos += 1;
            column += 1;
            let mut s = String::new();
            while pos < chars.len() && chars[pos] != '\'' {
                if chars[pos] == '\n' {
                    line += 1;
                    column = 0;
                }
                s.push(chars[pos]);
                pos += 1;
                column += 1;
            }
            if pos >= chars.len() {
                return Err(Error::Parse {
                    line: start_line,
                    column: start_col,
                    reason: "unterminated string literal".to_string(),
                });
            }
            pos += 1;
            column += 1;
            tokens.push(Token {
                token_type: TokenType::StringLit,
                value: s,
                line: start_line,
                column: start_col,
            });
            continue;
        }

        if let Some(tt) = match ch {
            '[' => Some(TokenType::LBracket),
            ']' => Some(TokenType::RBracket),
            ',' => Some(TokenType::Comma),
            '.' => Some(TokenType::Dot),
            _ => None,
        } {
            tokens.push(Token {
                token_type: tt,
                value: ch.to_string(),
                line,
                column,
            });
            pos += 1;
            column += 1;
            continue;
        }

        // Symbolic comparators: != <= >= < > =
        if ch == '!' || ch == '<' || ch == '>' || ch == '=' {
            let start_col = column;
            let two = if pos + 1 < chars.len() && chars[pos + 1] == '=' {
                Some(format!("{ch}="))
            } else {
                None
            };
            let op = match (ch, two) {
                ('!', Some(op)) => op,
                ('!', None) => {
                    return Err(Error::Parse {
                        line,
                        column,
                        reason: "unexpected character '!'".to_string(),
                    })
                }
                (_, Some(op)) => op,
                (_, None) => ch.to_string(),
            };
            pos += op.len();
            column += op.len();
            tokens.push(Token {
                token_type: TokenType::Operator,
                value: op,
                line,
                column: start_col,
            });
            continue;
        }

        // Wildcards: ** then *
        if ch == '*' {
            let start_col = column;
            if pos + 1 < chars.len() && chars[pos + 1] == '*' {
                pos += 2;
                column += 2;
                tokens.push(Token {
                    token_type: TokenType::DoubleWildcard,
                    value: "**".to_string(),
                    line,
                    column: start_col,
                });
            } else {
                pos += 1;
                column += 1;
                tokens.push(Token {
                    token_type: TokenType::Wildcard,
                    value: "*".to_string(),
                    line,
                    column: start_col,
                });
            }
            continue;
        }

        if ch.is_ascii_digit() {
            let start_col = column;
            let mut num = String::new();
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                num.push(chars[pos]);
                pos += 1;
                column += 1;
            }
            tokens.push(Token {
                token_type: TokenType::Number,
                value: num,
                line,
                column: start_col,
            });
            continue;
        }

        // Identifiers, keywords, and word comparators.
        if ch.is_ascii_alphabetic() || ch == '_' {
            let start_col = column;
            let mut ident = String::new();
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
                ident.push(chars[pos]);
                pos += 1;
                column += 1;
            }

            if matches!(ident.as_str(), "in" | "contains" | "matches") {
                tokens.push(Token {
                    token_type: TokenType::Operator,
                    value: ident,
                    line,
                    column: start_col,
                });
                continue;
            }

            if let Some(kw) = keyword_type(&ident.to_lowercase()) {
                tokens.push(Token {
                    token_type: kw,
                    value: ident,
                    line,
                    column: start_col,
                });
                continue;
            }

            tokens.push(Token {
                token_type: TokenType::Identifier,
                value: ident,
                line,
                column: start_col,
            });
            continue;
        }

        // Bare resource path starting with a slash.
        if ch == '/' {
            let start_col = column;
            let mut path = String::new();
            while pos < chars.len() && !chars[pos].is_ascii_whitespace() {
                path.push(chars[pos]);
                pos += 1;
                column += 1;
            }
            tokens.push(Token {
                token_type: TokenType::StringLit,
                value: path,
                line,
                column: start_col,
            });
            continue;
        }

        return Err(Error::Parse {
            line,
            column,
            reason: format!("unexpected character '{ch}'"),
        });
    }

    tokens.push(Token {
        token_type: TokenType::Eof,
        value: String::new(),
        line,
        column,
    });

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("tokenizer always emits EOF"))
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tt: &TokenType) -> bool {
        self.current().token_type == *tt
    }

    fn error(&self, reason: String) -> Error {
        Error::Parse {
            line: self.current().line,
            column: self.current().column,
            reason,
        }
    }

    fn expect(&mut self, tt: &TokenType, what: &str) -> Result<Token, Error> {
        if self.check(tt) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {what}, got '{}'", self.current().value)))
        }
    }

    fn is_at_end(&self) -> bool {
        self.current().token_type == TokenType::Eof
    }

    fn skip_trivia(&mut self) {
        while matches!(
            self.current().token_type,
            TokenType::Newline | TokenType::Comment
        ) {
            self.pos += 1;
        }
    }

    fn parse(&mut self) -> Result<CclDocument, Error> {
        let mut statements = Vec::new();
        self.skip_trivia();
        while !self.is_at_end() {
            statements.push(self.parse_statement()?);
            self.skip_trivia();
        }
        Ok(build_document(statements))
    }

    fn parse_statement(&mut self) -> Result<Statement, Error> {
        match self.current().token_type {
            TokenType::Permit | TokenType::Deny => self.parse_permit_deny(),
            TokenType::Limit => self.parse_limit(),
            _ => Err(self.error(format!(
                "expected statement keyword (permit, deny, or limit), got '{}'",
                self.current().value
            ))),
        }
    }

    fn parse_permit_deny(&mut self) -> Result<Statement, Error> {
        let keyword = self.advance();
        let kind = if keyword.token_type == TokenType::Permit {
            StatementKind::Permit
        } else {
            StatementKind::Deny
        };

        let action = self.parse_action()?;
        self.expect(&TokenType::On, "'on' after action")?;
        let resource = self.parse_resource()?;

        let condition = if self.check(&TokenType::When) {
            self.advance();
            Some(self.parse_condition()?)
        } else {
            None
        };

        let severity = self.parse_optional_severity()?;

        Ok(Statement {
            kind,
            action,
            resource,
            condition,
            severity,
            count: None,
            period_seconds: None,
        })
    }

    fn parse_limit(&mut self) -> Result<Statement, Error> {
        self.advance(); // 'limit'
        let action = self.parse_action()?;

        let count_tok = self.expect(&TokenType::Number, "count after action in limit")?;
        let count: u64 = count_tok
            .value
            .parse()
            .map_err(|_| self.error(format!("invalid limit count '{}'", count_tok.value)))?;

        self.expect(&TokenType::Per, "'per' in limit statement")?;

        let period_tok = self.expect(&TokenType::Number, "period after 'per'")?;
        let period: u64 = period_tok
            .value
            .parse()
            .map_err(|_| self.error(format!("invalid limit period '{}'", period_tok.value)))?;

        let unit_tok = self.expect(
            &TokenType::TimeUnit,
            "time unit (seconds, minutes, hours, days)",
        )?;
        let period_seconds = period.saturating_mul(time_unit_seconds(&unit_tok.value.to_lowercase()));

        let severity = self.parse_optional_severity()?;

        Ok(Statement {
            kind: StatementKind::Limit,
            action,
            resource: "**".to_string(),
            condition: None,
            severity,
            count: Some(count),
            period_seconds: Some(period_seconds),
        })
    }

    fn parse_optional_severity(&mut self) -> Result<Option<Severity>, Error> {
        if !self.check(&TokenType::Severity) {
            return Ok(None);
        }
        self.advance();
        let level = self.expect(&TokenType::Identifier, "severity level")?;
        Severity::from_keyword(&level.value).map(Some).ok_or_else(|| {
            Error::Parse {
                line: level.line,
                column: level.column,
                reason: format!(
                    "unknown severity '{}' (expected low, medium, high, or critical)",
                    level.value
                ),
            }
        })
    }

    fn parse_action(&mut self) -> Result<String, Error> {
        let mut parts = Vec::new();

        match self.current().token_type {
            TokenType::DoubleWildcard => {
                self.advance();
                return Ok("**".to_string());
            }
            TokenType::Wildcard => {
                parts.push("*".to_string());
                self.advance();
            }
            TokenType::Identifier => parts.push(self.advance().value),
            _ => {
                return Err(self.error(format!(
                    "expected action identifier, got '{}'",
                    self.current().value
                )))
            }
        }

        while self.check(&TokenType::Dot) {
            self.advance();
            match self.current().token_type {
                TokenType::Identifier => parts.push(self.advance().value),
                TokenType::Wildcard => {
                    parts.push("*".to_string());
                    self.advance();
                }
                TokenType::DoubleWildcard => {
                    parts.push("**".to_string());
                    self.advance();
                }
                _ => {
                    return Err(self.error(format!(
                        "expected identifier or wildcard after dot, got '{}'",
                        self.current().value
                    )))
                }
            }
        }

        Ok(parts.join("."))
    }

    fn parse_resource(&mut self) -> Result<String, Error> {
        match self.current().token_type {
            TokenType::StringLit | TokenType::Identifier => Ok(self.advance().value),
            TokenType::Wildcard => {
                self.advance();
                Ok("*".to_string())
            }
            TokenType::DoubleWildcard => {
                self.advance();
                Ok("**".to_string())
            }
            _ => Err(self.error(format!(
                "expected resource pattern, got '{}'",
                self.current().value
            ))),
        }
    }

    fn parse_condition(&mut self) -> Result<Condition, Error> {
        // `severity` lexes as a keyword, which doubles as the reserved-name
        // check the grammar requires.
        if self.check(&TokenType::Severity) {
            return Err(self.error(
                "'severity' is a reserved keyword and cannot be used as a condition variable"
                    .to_string(),
            ));
        }

        let field = self.parse_field()?;

        if !self.check(&TokenType::Operator) {
            return Err(self.error(format!(
                "expected comparator after '{field}', got '{}'",
                self.current().value
            )));
        }
        let op_tok = self.advance();
        let comparator = Comparator::from_token(&op_tok.value).ok_or(Error::Parse {
            line: op_tok.line,
            column: op_tok.column,
            reason: format!("unknown comparator '{}'", op_tok.value),
        })?;

        let value = self.parse_value()?;

        Ok(Condition {
            field,
            comparator,
            value,
        })
    }

    fn parse_field(&mut self) -> Result<String, Error> {
        let first = self.expect(&TokenType::Identifier, "condition variable")?;
        let mut field = first.value;

        while self.check(&TokenType::Dot) {
            self.advance();
            let seg = self.expect(&TokenType::Identifier, "identifier after dot")?;
            field.push('.');
            field.push_str(&seg.value);
        }

        Ok(field)
    }

    fn parse_value(&mut self) -> Result<Value, Error> {
        match self.current().token_type {
            TokenType::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenType::RBracket) {
                    items.push(self.parse_scalar()?);
                    if self.check(&TokenType::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(&TokenType::RBracket, "']' closing list literal")?;
                Ok(Value::Array(items))
            }
            _ => self.parse_scalar(),
        }
    }

    fn parse_scalar(&mut self) -> Result<Value, Error> {
        match self.current().token_type {
            TokenType::StringLit => Ok(Value::String(self.advance().value)),
            TokenType::Number => {
                let tok = self.advance();
                let n: i64 = tok
                    .value
                    .parse()
                    .map_err(|_| self.error(format!("invalid number '{}'", tok.value)))?;
                Ok(Value::Number(n.into()))
            }
            TokenType::Identifier => {
                let tok = self.advance();
                match tok.value.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Ok(Value::String(tok.value)),
                }
            }
            _ => Err(self.error(format!(
                "expected literal value, got '{}'",
                self.current().value
            ))),
        }
    }
}

fn time_unit_seconds(unit: &str) -> u64 {
    match unit {
        "minute" | "minutes" => 60,
        "hour" | "hours" => 3600,
        "day" | "days" => 86400,
        _ => 1,
    }
}

fn build_document(statements: Vec<Statement>) -> CclDocument {
    let mut permits = Vec::new();
    let mut denies = Vec::new();
    let mut limits = Vec::new();

    for stmt in &statements {
        match stmt.kind {
            StatementKind::Permit => permits.push(stmt.clone()),
            StatementKind::Deny => denies.push(stmt.clone()),
            StatementKind::Limit => limits.push(stmt.clone()),
        }
    }

    CclDocument {
        statements,
        permits,
        denies,
        limits,
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse CCL source text.
///
/// # Errors
/// Returns `Error::Parse` naming the offending line and column.
///
/// # Example
/// ```
/// use pactum::ccl::parse;
/// let doc = parse("permit read on '/data/**'").unwrap();
/// assert_eq!(doc.permits.len(), 1);
/// ```
pub fn parse(source: &str) -> Result<CclDocument, Error> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    parser.parse()
}

/// Match an action string against a dot-separated pattern.
///
/// - exact equality matches
/// - `**` matches any action
/// - a trailing `.*` matches any action under the prefix (any depth)
/// - a non-trailing `*` matches exactly one dot segment
///
/// Matching is case-sensitive.
pub fn match_action(pattern: &str, action: &str) -> bool {
    if pattern == action || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        if !prefix.contains('*') {
            return action
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.'));
        }
    }
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let action_parts: Vec<&str> = action.split('.').collect();
    match_segments(&pattern_parts, &action_parts)
}

/// Match a resource path against a slash-separated pattern.
///
/// - exact equality matches
/// - `**` matches any resource
/// - a trailing `/**` matches the directory itself and any descendant
/// - `*` matches exactly one path segment
///
/// Leading and trailing slashes are normalized away. Case-sensitive.
pub fn match_resource(pattern: &str, resource: &str) -> bool {
    if pattern == resource || pattern == "**" {
        return true;
    }
    let norm_pattern = pattern.trim_matches('/');
    let norm_resource = resource.trim_matches('/');
    if norm_pattern == "**" {
        return true;
    }
    if norm_pattern.is_empty() || norm_resource.is_empty() {
        return norm_pattern.is_empty() && norm_resource.is_empty();
    }
    let pattern_parts: Vec<&str> = norm_pattern.split('/').collect();
    let resource_parts: Vec<&str> = norm_resource.split('/').collect();
    match_segments(&pattern_parts, &resource_parts)
}

/// Segment matcher: `*` matches one segment, `**` zero or more.
fn match_segments(pattern: &[&str], target: &[&str]) -> bool {
    if let Some((&head, rest)) = pattern.split_first() {
        if head == "**" {
            if match_segments(rest, target) {
                return true;
            }
            return match target.split_first() {
                Some((_, t_rest)) => match_segments(pattern, t_rest),
                None => false,
            };
        }
        match target.split_first() {
            Some((&t_head, t_rest)) => {
                (head == "*" || head == t_head) && match_segments(rest, t_rest)
            }
            None => false,
        }
    } else {
        target.is_empty()
    }
}

/// Specificity score for an (action, resource) pattern pair.
///
/// Per segment: literal 2, `*` 1, `**` 0. Exact patterns therefore score
/// highest and bare `**` scores zero; the score is a total order for any
/// fixed pattern pair.
fn specificity(action_pattern: &str, resource_pattern: &str) -> i32 {
    let mut score = 0i32;
    for part in action_pattern.split('.') {
        score += segment_score(part);
    }
    let norm = resource_pattern.trim_matches('/');
    if !norm.is_empty() {
        for part in norm.split('/') {
            score += segment_score(part);
        }
    }
    score
}

fn segment_score(segment: &str) -> i32 {
    match segment {
        "**" => 0,
        "*" => 1,
        _ => 2,
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Resolve a dot-path (`payload.contains_pii`) into a context object.
fn resolve_context_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (value_as_f64(a), value_as_f64(b)) {
        return x == y;
    }
    a == b
}

fn evaluate_condition(condition: &Condition, context: &Value) -> bool {
    let Some(actual) = resolve_context_path(context, &condition.field) else {
        return false;
    };

    match condition.comparator {
        Comparator::Eq => values_equal(actual, &condition.value),
        Comparator::Ne => !values_equal(actual, &condition.value),
        Comparator::Lt | Comparator::Le | Comparator::Gt | Comparator::Ge => {
            match (value_as_f64(actual), value_as_f64(&condition.value)) {
                (Some(a), Some(b)) => match condition.comparator {
                    Comparator::Lt => a < b,
                    Comparator::Le => a <= b,
                    Comparator::Gt => a > b,
                    _ => a >= b,
                },
                _ => false,
            }
        }
        Comparator::In => condition
            .value
            .as_array()
            .is_some_and(|items| items.iter().any(|v| values_equal(actual, v))),
        Comparator::Contains => match (actual, &condition.value) {
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
            _ => false,
        },
        Comparator::Matches => match (actual.as_str(), condition.value.as_str()) {
            (Some(text), Some(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false),
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a policy against an action/resource pair in a context.
///
/// Resolution order:
/// 1. Collect permit and deny rules whose patterns match and whose
///    condition, if any, evaluates true. Missing context values make a
///    condition false.
/// 2. No candidates: default deny with reason `"no matching rule"`.
/// 3. Otherwise the single most specific rule wins; at equal specificity
///    deny wins over permit.
pub fn evaluate(doc: &CclDocument, action: &str, resource: &str, context: &Value) -> Evaluation {
    let mut candidates: Vec<&Statement> = Vec::new();

    for stmt in doc.permits.iter().chain(doc.denies.iter()) {
        if match_action(&stmt.action, action)
            && match_resource(&stmt.resource, resource)
            && stmt
                .condition
                .as_ref()
                .map_or(true, |c| evaluate_condition(c, context))
        {
            candidates.push(stmt);
        }
    }

    if candidates.is_empty() {
        return Evaluation {
            permitted: false,
            reason: "no matching rule".to_string(),
            matched_rule: None,
            severity: None,
        };
    }

    candidates.sort_by(|a, b| {
        specificity(&b.action, &b.resource)
            .cmp(&specificity(&a.action, &a.resource))
            .then_with(|| {
                let a_deny = a.kind == StatementKind::Deny;
                let b_deny = b.kind == StatementKind::Deny;
                b_deny.cmp(&a_deny)
            })
    });

    let winner = candidates[0];
    Evaluation {
        permitted: winner.kind == StatementKind::Permit,
        reason: format!("matched rule: {}", serialize_statement(winner)),
        matched_rule: Some(winner.clone()),
        severity: winner.severity,
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// Check an action against the most specific matching limit statement.
///
/// The caller owns the observation window and supplies the count it has
/// seen inside it; this function only applies the declared ceiling.
pub fn check_rate_limit(doc: &CclDocument, action: &str, used_count: u64) -> RateLimitResult {
    let mut matched: Option<&Statement> = None;
    let mut best = -1i32;

    for stmt in &doc.limits {
        if match_action(&stmt.action, action) {
            let spec = specificity(&stmt.action, "");
            if spec > best {
                best = spec;
                matched = Some(stmt);
            }
        }
    }

    let Some(stmt) = matched else {
        return RateLimitResult {
            exceeded: false,
            remaining: u64::MAX,
            limit: 0,
        };
    };

    let limit = stmt.count.unwrap_or(0);
    RateLimitResult {
        exceeded: used_count >= limit,
        remaining: limit.saturating_sub(used_count),
        limit,
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge two policies with deny-wins semantics preserved.
///
/// Permit and deny statements are the union of both sides, `a`'s first,
/// deduplicated on exact serialized text. Limits on the same action keep
/// the more restrictive side: counts are normalized to a per-second rate
/// and the lower rate wins (the lower count breaks rate ties).
pub fn merge(a: &CclDocument, b: &CclDocument) -> CclDocument {
    let mut statements: Vec<Statement> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for stmt in a.statements.iter().chain(b.statements.iter()) {
        if stmt.kind == StatementKind::Limit {
            continue;
        }
        if seen.insert(serialize_statement(stmt)) {
            statements.push(stmt.clone());
        }
    }

    let mut limits: Vec<Statement> = Vec::new();
    for stmt in a.limits.iter().chain(b.limits.iter()) {
        if let Some(existing) = limits.iter_mut().find(|l| l.action == stmt.action) {
            if limit_rate(stmt) < limit_rate(existing)
                || (limit_rate(stmt) == limit_rate(existing) && stmt.count < existing.count)
            {
                *existing = stmt.clone();
            }
        } else {
            limits.push(stmt.clone());
        }
    }
    statements.extend(limits);

    build_document(statements)
}

/// Allowed executions per second, for comparing limit restrictiveness.
fn limit_rate(stmt: &Statement) -> f64 {
    let count = stmt.count.unwrap_or(0) as f64;
    let period = stmt.period_seconds.unwrap_or(1).max(1) as f64;
    count / period
}

// ---------------------------------------------------------------------------
// Narrowing validation
// ---------------------------------------------------------------------------

/// Validate that a child policy only narrows (restricts) its parent.
///
/// A child permit is a violation when it overlaps any parent deny, or
/// when the parent declares permits and the child permit is not a
/// pattern-subset of any of them. Overlap and subset tests over wildcard
/// sets are conservative: anything undecidable is flagged.
pub fn validate_narrowing(parent: &CclDocument, child: &CclDocument) -> NarrowingResult {
    let mut violations = Vec::new();

    for child_permit in &child.permits {
        for parent_deny in &parent.denies {
            if patterns_overlap(&child_permit.action, &parent_deny.action)
                && patterns_overlap(&child_permit.resource, &parent_deny.resource)
            {
                violations.push(NarrowingViolation {
                    child_rule: serialize_statement(child_permit),
                    parent_rule: Some(serialize_statement(parent_deny)),
                    message: format!(
                        "child permits '{}' on '{}', which the parent denies",
                        child_permit.action, child_permit.resource
                    ),
                });
            }
        }

        if !parent.permits.is_empty() {
            let covered = parent.permits.iter().any(|parent_permit| {
                is_subset_pattern(&child_permit.action, &parent_permit.action, '.')
                    && is_subset_pattern(&child_permit.resource, &parent_permit.resource, '/')
            });
            if !covered {
                violations.push(NarrowingViolation {
                    child_rule: serialize_statement(child_permit),
                    parent_rule: None,
                    message: format!(
                        "child permit '{}' on '{}' is not covered by any parent permit",
                        child_permit.action, child_permit.resource
                    ),
                });
            }
        }
    }

    NarrowingResult {
        valid: violations.is_empty(),
        violations,
    }
}

/// Whether two patterns can match at least one common string.
fn patterns_overlap(pattern1: &str, pattern2: &str) -> bool {
    if pattern1 == "**" || pattern2 == "**" || pattern1 == "*" || pattern2 == "*" {
        return true;
    }
    if pattern1 == pattern2 {
        return true;
    }

    // Probe each pattern with a concrete instance of the other.
    let concrete1 = pattern1.replace("**", "x").replace('*', "x");
    let concrete2 = pattern2.replace("**", "x").replace('*', "x");

    if pattern1.contains('/') || pattern2.contains('/') {
        match_resource(pattern1, &concrete2) || match_resource(pattern2, &concrete1)
    } else {
        match_action(pattern1, &concrete2) || match_action(pattern2, &concrete1)
    }
}

/// Whether every string `child` matches is also matched by `parent`.
fn is_subset_pattern(child: &str, parent: &str, separator: char) -> bool {
    if parent == "**" {
        return true;
    }
    if child == "**" {
        return false;
    }

    let child_parts: Vec<&str> = child.split(separator).filter(|p| !p.is_empty()).collect();
    let parent_parts: Vec<&str> = parent.split(separator).filter(|p| !p.is_empty()).collect();
    is_subset_segments(&child_parts, &parent_parts)
}

fn is_subset_segments(child: &[&str], parent: &[&str]) -> bool {
    match (child.split_first(), parent.split_first()) {
        (None, None) => true,
        (None, Some(_)) => parent.iter().all(|p| *p == "**"),
        (Some(_), None) => false,
        (Some((&c, c_rest)), Some((&p, p_rest))) => {
            if p == "**" {
                // Parent ** absorbs zero or more child segments.
                return is_subset_segments(child, p_rest) || is_subset_segments(c_rest, parent);
            }
            if c == "**" {
                // Child ** is broader than any bounded parent segment.
                return false;
            }
            if p == "*" {
                // Parent * covers a single child segment, wildcard or not.
                return is_subset_segments(c_rest, p_rest);
            }
            if c == "*" {
                // Child * is broader than a literal parent segment.
                return false;
            }
            c == p && is_subset_segments(c_rest, p_rest)
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a policy back to CCL source, preserving statement order.
///
/// Comments and original whitespace are not reproduced; the output
/// re-parses to an evaluation-equivalent document.
pub fn serialize(doc: &CclDocument) -> String {
    doc.statements
        .iter()
        .map(serialize_statement)
        .collect::<Vec<_>>()
        .join("\n")
}

fn serialize_statement(stmt: &Statement) -> String {
    match stmt.kind {
        StatementKind::Permit | StatementKind::Deny => {
            let keyword = if stmt.kind == StatementKind::Permit {
                "permit"
            } else {
                "deny"
            };
            let mut line = format!("{keyword} {} on '{}'", stmt.action, stmt.resource);
            if let Some(cond) = &stmt.condition {
                line.push_str(&format!(
                    " when {} {} {}",
                    cond.field,
                    cond.comparator.as_str(),
                    serialize_value(&cond.value)
                ));
            }
            if let Some(sev) = stmt.severity {
                line.push_str(&format!(" severity {sev}"));
            }
            line
        }
        StatementKind::Limit => {
            let count = stmt.count.unwrap_or(0);
            let (period, unit) = largest_exact_unit(stmt.period_seconds.unwrap_or(0));
            let mut line = format!("limit {} {} per {} {}", stmt.action, count, period, unit);
            if let Some(sev) = stmt.severity {
                line.push_str(&format!(" severity {sev}"));
            }
            line
        }
    }
}

fn serialize_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(serialize_value).collect();
            format!("[{}]", inner.join(", "))
        }
        other => other.to_string(),
    }
}

fn largest_exact_unit(seconds: u64) -> (u64, &'static str) {
    if seconds > 0 && seconds % 86400 == 0 {
        (seconds / 86400, "days")
    } else if seconds > 0 && seconds % 3600 == 0 {
        (seconds / 3600, "hours")
    } else if seconds > 0 && seconds % 60 == 0 {
        (seconds / 60, "minutes")
    } else {
        (seconds, "seconds")
    }
}
