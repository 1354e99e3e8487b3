// SPDX-License-Identifier: MIT
//! Mock data templates.
//!
//! Any configured string containing `{{` and `}}` is a template. Each `{{ ... }}`
//! expression calls a function from a fake-data vocabulary and is replaced by its
//! result; text outside the delimiters is copied as-is:
//!
//! ```text
//! "{{FirstName}} {{LastName}}"          -> "Ada Lovelace"
//! "{{Number 1 24}}"                     -> "17"
//! "{{RandomString (SliceString \"GET\" \"POST\")}}" -> "POST"
//! ```
//!
//! Every expansion in a run draws from one [`MockSession`], so a fixed seed makes
//! the whole run reproducible. [`MockEngine::reshuffle`] swaps in a fresh session.
//!
//! # Vocabulary
//! * people: `Name`, `FirstName`, `LastName`, `Gender`, `Email`, `Username`,
//!   `Phone`, `SSN`, `CreditCardNumber`, `JobTitle`, `Company`
//! * places: `Street`, `StreetName`, `City`, `State`, `Country`, `Zip`,
//!   `Latitude`, `Longitude`
//! * internet: `IPv4Address`, `IPv6Address`, `MacAddress`, `DomainName`, `URL`,
//!   `UserAgent`, `HTTPMethod`, `HTTPStatusCode`, `UUID`
//! * text: `Word`, `LoremIpsumWord`, `Sentence [words]`, `Paragraph`, `Letter`,
//!   `LetterN n`, `Digit`, `DigitN n`, `LogLevel`, `Color`
//! * numbers: `Number min max`, `IntRange min max`, `Float64Range min max`,
//!   `Float64`, `Int`, `Bool`, `Date`
//! * choices: `RandomString list`, `RandomInt list`, `SliceString a b ...`,
//!   `SliceInt a b ...`
//!
//! Function names may carry a leading `.` (`{{.FirstName}}`).
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fake::faker::address::en::{CityName, CountryName, StateName, StreetName, ZipCode};
use fake::faker::company::en::CompanyName;
use fake::faker::creditcard::en::CreditCardNumber;
use fake::faker::internet::en::{DomainSuffix, IPv4, IPv6, MACAddress, SafeEmail, UserAgent, Username};
use fake::faker::job::en::Title as JobTitle;
use fake::faker::lorem::en::{Paragraph, Sentence, Word};
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

/// Opening template delimiter.
pub const TEMPLATE_OPEN: &str = "{{";
/// Closing template delimiter.
pub const TEMPLATE_CLOSE: &str = "}}";

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];
const HTTP_STATUS_CODES: &[i64] = &[200, 201, 204, 301, 302, 304, 400, 401, 403, 404, 409, 429, 500, 502, 503];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal"];
const COLORS: &[&str] = &["Red", "Green", "Blue", "Yellow", "Purple", "Orange", "Black", "White", "Gray"];
const GENDERS: &[&str] = &["male", "female"];
// 2000-01-01T00:00:00Z
const EARLIEST_DATE_SECS: u64 = 946_684_800;

/// Returns true when `value` contains both template delimiters.
pub fn is_template(value: &str) -> bool {
    value.contains(TEMPLATE_OPEN) && value.contains(TEMPLATE_CLOSE)
}

/// Template parsing or evaluation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MockError {
    #[error("mock template processing failed: unterminated `{{{{` at byte {0}")]
    Unterminated(usize),
    #[error("mock template processing failed: empty expression")]
    EmptyExpression,
    #[error("mock template processing failed: {0}")]
    Syntax(String),
    #[error("mock template processing failed: unknown function {0:?}")]
    UnknownFunction(String),
    #[error("mock template processing failed: {function}: {reason}")]
    InvalidArguments { function: String, reason: String },
}

/// One pseudo-random sequence shared by every expansion until the next reshuffle.
#[derive(Debug)]
pub struct MockSession {
    seed: u64,
    rng: Mutex<StdRng>,
}

impl MockSession {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Seed this session's sequence started from.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Expands mock templates from a shared, seedable random source.
///
/// The current session sits behind a read/write lock: expansions take a short
/// read lock to clone the session handle and evaluate outside of it, while
/// [`MockEngine::reshuffle`] swaps the handle under the write lock.
#[derive(Debug)]
pub struct MockEngine {
    session: RwLock<Arc<MockSession>>,
}

impl MockEngine {
    /// Creates an engine seeded with `seed`; `0` picks a random seed.
    pub fn new(seed: u64) -> Self {
        let seed = if seed == 0 { fresh_seed() } else { seed };
        Self {
            session: RwLock::new(Arc::new(MockSession::new(seed))),
        }
    }

    /// Starts a fresh pseudo-random sequence.
    pub fn reshuffle(&self) {
        let next = Arc::new(MockSession::new(fresh_seed()));
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Returns the session currently used for expansions.
    pub fn session(&self) -> Arc<MockSession> {
        Arc::clone(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Expands `template`. Strings without both delimiters are returned unchanged.
    ///
    /// # Errors
    /// Returns [`MockError`] for malformed templates, unknown functions or bad arguments.
    pub fn expand(&self, template: &str) -> Result<String, MockError> {
        if !is_template(template) {
            return Ok(template.to_owned());
        }
        let segments = parse(template)?;
        let session = self.session();
        let mut rng = session.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::with_capacity(template.len());
        for segment in &segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&eval(expr, &mut rng)?.to_string()),
            }
        }
        Ok(out)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(0)
    }
}

fn fresh_seed() -> u64 {
    // Never 0, which callers use to mean "pick one".
    rand::random::<u64>().max(1)
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(Expr),
}

#[derive(Debug, PartialEq)]
struct Expr {
    function: String,
    args: Vec<Arg>,
}

#[derive(Debug, PartialEq)]
enum Arg {
    Int(i64),
    Float(f64),
    Str(String),
    Call(Expr),
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, MockError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;
    while let Some(start) = rest.find(TEMPLATE_OPEN) {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let body_start = start + TEMPLATE_OPEN.len();
        let body_len = rest[body_start..]
            .find(TEMPLATE_CLOSE)
            .ok_or(MockError::Unterminated(offset + start))?;
        let body = &rest[body_start..body_start + body_len];
        segments.push(Segment::Expr(parse_expression(body)?));
        let consumed = body_start + body_len + TEMPLATE_CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn parse_expression(body: &str) -> Result<Expr, MockError> {
    let mut parser = Parser {
        tokens: tokenize(body)?,
        pos: 0,
    };
    let expr = parser.expr()?;
    match parser.next() {
        None => Ok(expr),
        Some(token) => Err(MockError::Syntax(format!("unexpected `{token}` in {body:?}"))),
    }
}

fn tokenize(body: &str) -> Result<Vec<Token>, MockError> {
    let mut tokens = Vec::new();
    let mut chars = body.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\\')) => {
                            if let Some((_, escaped)) = chars.next() {
                                literal.push(escaped);
                            }
                        }
                        Some((_, '"')) => break,
                        Some((_, ch)) => literal.push(ch),
                        None => return Err(MockError::Syntax(format!("unterminated string literal in {body:?}"))),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            _ => {
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '"') {
                        break;
                    }
                    chars.next();
                }
                let end = chars.peek().map_or(body.len(), |&(end, _)| end);
                tokens.push(classify(&body[start..end]));
            }
        }
    }
    Ok(tokens)
}

fn classify(word: &str) -> Token {
    if let Ok(v) = word.parse::<i64>() {
        return Token::Int(v);
    }
    let numeric = word.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '-' | '+'));
    if numeric {
        if let Ok(v) = word.parse::<f64>() {
            return Token::Float(v);
        }
    }
    Token::Ident(word.trim_start_matches('.').to_owned())
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Expr, MockError> {
        let function = match self.next() {
            Some(Token::Ident(name)) => name.clone(),
            Some(other) => return Err(MockError::Syntax(format!("expected a function name, found `{other}`"))),
            None => return Err(MockError::EmptyExpression),
        };
        let mut args = Vec::new();
        while let Some(token) = self.peek() {
            if *token == Token::Close {
                break;
            }
            args.push(self.arg()?);
        }
        Ok(Expr { function, args })
    }

    fn arg(&mut self) -> Result<Arg, MockError> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Arg::Int(*v)),
            Some(Token::Float(v)) => Ok(Arg::Float(*v)),
            Some(Token::Str(s)) => Ok(Arg::Str(s.clone())),
            Some(Token::Ident(name)) => Ok(Arg::Call(Expr {
                function: name.clone(),
                args: Vec::new(),
            })),
            Some(Token::Open) => {
                let expr = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(Arg::Call(expr)),
                    _ => Err(MockError::Syntax(format!("missing `)` after {}", expr.function))),
                }
            }
            Some(Token::Close) => Err(MockError::Syntax("unexpected `)`".to_owned())),
            None => Err(MockError::EmptyExpression),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

fn invalid(function: &str, reason: impl Into<String>) -> MockError {
    MockError::InvalidArguments {
        function: function.to_owned(),
        reason: reason.into(),
    }
}

fn eval(expr: &Expr, rng: &mut StdRng) -> Result<Value, MockError> {
    let args = expr
        .args
        .iter()
        .map(|arg| match arg {
            Arg::Int(v) => Ok(Value::Int(*v)),
            Arg::Float(v) => Ok(Value::Float(*v)),
            Arg::Str(s) => Ok(Value::Str(s.clone())),
            Arg::Call(inner) => eval(inner, rng),
        })
        .collect::<Result<Vec<_>, _>>()?;
    call(&expr.function, &args, rng)
}

fn call(function: &str, args: &[Value], rng: &mut StdRng) -> Result<Value, MockError> {
    let text = |s: String| Ok(Value::Str(s));
    match function {
        "Name" => text(Name().fake_with_rng(rng)),
        "FirstName" => text(FirstName().fake_with_rng(rng)),
        "LastName" => text(LastName().fake_with_rng(rng)),
        "Gender" => text(pick(GENDERS, rng).to_string()),
        "Email" => text(SafeEmail().fake_with_rng(rng)),
        "Username" => text(Username().fake_with_rng(rng)),
        "Phone" => text(PhoneNumber().fake_with_rng(rng)),
        "SSN" => text(format!(
            "{:03}-{:02}-{:04}",
            rng.random_range(1..=899),
            rng.random_range(1..=99),
            rng.random_range(1..=9999)
        )),
        "CreditCardNumber" => text(CreditCardNumber().fake_with_rng(rng)),
        "JobTitle" => text(JobTitle().fake_with_rng(rng)),
        "Company" => text(CompanyName().fake_with_rng(rng)),
        "Street" => {
            let name: String = StreetName().fake_with_rng(rng);
            text(format!("{} {name}", rng.random_range(1..=9999)))
        }
        "StreetName" => text(StreetName().fake_with_rng(rng)),
        "City" => text(CityName().fake_with_rng(rng)),
        "State" => text(StateName().fake_with_rng(rng)),
        "Country" => text(CountryName().fake_with_rng(rng)),
        "Zip" => text(ZipCode().fake_with_rng(rng)),
        "Latitude" => Ok(Value::Float(round6(rng.random_range(-90.0..=90.0)))),
        "Longitude" => Ok(Value::Float(round6(rng.random_range(-180.0..=180.0)))),
        "IPv4Address" => text(IPv4().fake_with_rng(rng)),
        "IPv6Address" => text(IPv6().fake_with_rng(rng)),
        "MacAddress" => text(MACAddress().fake_with_rng(rng)),
        "DomainName" => {
            let word: String = Word().fake_with_rng(rng);
            let suffix: String = DomainSuffix().fake_with_rng(rng);
            text(format!("{word}.{suffix}"))
        }
        "URL" => {
            let host: String = Word().fake_with_rng(rng);
            let suffix: String = DomainSuffix().fake_with_rng(rng);
            let path: String = Word().fake_with_rng(rng);
            text(format!("https://www.{host}.{suffix}/{path}"))
        }
        "UserAgent" => text(UserAgent().fake_with_rng(rng)),
        "HTTPMethod" => text(pick(HTTP_METHODS, rng).to_string()),
        "HTTPStatusCode" => Ok(Value::Int(*pick(HTTP_STATUS_CODES, rng))),
        "UUID" => text(uuid::Builder::from_random_bytes(rng.random()).into_uuid().to_string()),
        "Word" | "LoremIpsumWord" => text(Word().fake_with_rng(rng)),
        "Sentence" => {
            let words = match args.first() {
                Some(_) => usize_arg(function, args, 0)?.max(1),
                None => rng.random_range(4..=10),
            };
            text(Sentence(words..words + 1).fake_with_rng(rng))
        }
        "Paragraph" => text(Paragraph(2..5).fake_with_rng(rng)),
        "Letter" => text(random_chars(rng, 1, b'a'..=b'z')),
        "LetterN" => text(random_chars(rng, usize_arg(function, args, 0)?, b'a'..=b'z')),
        "Digit" => text(random_chars(rng, 1, b'0'..=b'9')),
        "DigitN" => text(random_chars(rng, usize_arg(function, args, 0)?, b'0'..=b'9')),
        "LogLevel" => text(pick(LOG_LEVELS, rng).to_string()),
        "Color" => text(pick(COLORS, rng).to_string()),
        "Number" | "IntRange" => {
            let (min, max) = (int_arg(function, args, 0)?, int_arg(function, args, 1)?);
            if min > max {
                return Err(invalid(function, format!("min {min} is greater than max {max}")));
            }
            Ok(Value::Int(rng.random_range(min..=max)))
        }
        "Int" => Ok(Value::Int(rng.random_range(0..=i64::from(i32::MAX)))),
        "Float64" => Ok(Value::Float(rng.random::<f64>())),
        "Float64Range" => {
            let (min, max) = (float_arg(function, args, 0)?, float_arg(function, args, 1)?);
            if min > max {
                return Err(invalid(function, format!("min {min} is greater than max {max}")));
            }
            if !(max - min).is_finite() {
                return Err(invalid(function, format!("range [{min}, {max}] is not finite")));
            }
            let range = Uniform::new_inclusive(min, max).map_err(|e| invalid(function, e.to_string()))?;
            Ok(Value::Float(range.sample(rng)))
        }
        "Bool" | "Boolean" => Ok(Value::Bool(rng.random_bool(0.5))),
        "Date" => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(EARLIEST_DATE_SECS)
                .max(EARLIEST_DATE_SECS);
            let at = UNIX_EPOCH + Duration::from_secs(rng.random_range(EARLIEST_DATE_SECS..=now));
            text(humantime::format_rfc3339_seconds(at).to_string())
        }
        "SliceString" => Ok(Value::List(args.iter().map(|v| Value::Str(v.to_string())).collect())),
        "SliceInt" => (0..args.len())
            .map(|i| int_arg(function, args, i).map(Value::Int))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        "RandomString" | "RandomInt" => {
            let choices = match args {
                [Value::List(items)] => items.as_slice(),
                items => items,
            };
            let choice = choices
                .choose(rng)
                .ok_or_else(|| invalid(function, "expected at least one choice"))?;
            match (function, choice) {
                ("RandomInt", Value::Int(_)) | ("RandomString", _) => Ok(choice.clone()),
                _ => Err(invalid(function, format!("{choice} is not an integer"))),
            }
        }
        other => Err(MockError::UnknownFunction(other.to_owned())),
    }
}

fn pick<'a, T>(choices: &'a [T], rng: &mut StdRng) -> &'a T {
    &choices[rng.random_range(0..choices.len())]
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn random_chars(rng: &mut StdRng, n: usize, range: std::ops::RangeInclusive<u8>) -> String {
    (0..n).map(|_| char::from(rng.random_range(range.clone()))).collect()
}

fn int_arg(function: &str, args: &[Value], index: usize) -> Result<i64, MockError> {
    match args.get(index) {
        Some(Value::Int(v)) => Ok(*v),
        Some(Value::Str(s)) => s
            .parse()
            .map_err(|_| invalid(function, format!("argument {} ({s:?}) is not an integer", index + 1))),
        Some(other) => Err(invalid(function, format!("argument {} ({other}) is not an integer", index + 1))),
        None => Err(invalid(function, format!("missing argument {}", index + 1))),
    }
}

fn usize_arg(function: &str, args: &[Value], index: usize) -> Result<usize, MockError> {
    let v = int_arg(function, args, index)?;
    usize::try_from(v).map_err(|_| invalid(function, format!("argument {} must not be negative", index + 1)))
}

fn float_arg(function: &str, args: &[Value], index: usize) -> Result<f64, MockError> {
    match args.get(index) {
        Some(Value::Float(v)) => Ok(*v),
        Some(Value::Int(v)) => Ok(*v as f64),
        Some(other) => Err(invalid(function, format!("argument {} ({other}) is not a number", index + 1))),
        None => Err(invalid(function, format!("missing argument {}", index + 1))),
    }
}
