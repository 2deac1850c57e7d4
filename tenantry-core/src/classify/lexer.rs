//! Lexer for the subset of PostgreSQL syntax the classifier needs.
//!
//! Only the lexical structure matters here: where words, quoted
//! identifiers, literals and punctuation start and end. Strings, dollar
//! quoted bodies and comments are consumed whole so that keywords inside them
//! are never mistaken for statement structure.

/// A lexical token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// Unquoted word (keyword or identifier), as written.
    Word(String),
    /// Double-quoted identifier, unescaped.
    Quoted(String),
    /// String, dollar-quoted or numeric literal. Strings are unescaped.
    Literal(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Semicolon,
    /// Any other character (operators, `*`, parameters).
    Other(char),
}

impl Token {
    /// Check if the token is the given keyword.
    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    /// Identifier value with PostgreSQL case folding applied.
    pub(crate) fn identifier(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_ascii_lowercase()),
            Token::Quoted(q) => Some(q.clone()),
            _ => None,
        }
    }
}

/// A token with its byte span in the source.
#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Tokenize a statement or script. Comments are dropped.
pub(crate) fn tokenize(sql: &str) -> Vec<Spanned> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let start = i;

        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = skip_block_comment(bytes, i);
            continue;
        }

        let token = match b {
            b'\'' => {
                let (value, end) = scan_quoted(sql, i, b'\'', false);
                i = end;
                Token::Literal(value)
            }
            b'"' => {
                let (value, end) = scan_quoted(sql, i, b'"', false);
                i = end;
                Token::Quoted(value)
            }
            b'e' | b'E' if bytes.get(i + 1) == Some(&b'\'') => {
                let (value, end) = scan_quoted(sql, i + 1, b'\'', true);
                i = end;
                Token::Literal(value)
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag_end) => {
                    let tag = &sql[i..tag_end];
                    let body_start = tag_end;
                    match sql[body_start..].find(tag) {
                        Some(offset) => {
                            i = body_start + offset + tag.len();
                            Token::Literal(sql[body_start..body_start + offset].to_string())
                        }
                        None => {
                            i = bytes.len();
                            Token::Literal(sql[body_start..].to_string())
                        }
                    }
                }
                None => {
                    i += 1;
                    Token::Other('$')
                }
            },
            b'0'..=b'9' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
                Token::Literal(sql[start..i].to_string())
            }
            b'.' => {
                i += 1;
                Token::Dot
            }
            b',' => {
                i += 1;
                Token::Comma
            }
            b'(' => {
                i += 1;
                Token::LParen
            }
            b')' => {
                i += 1;
                Token::RParen
            }
            b';' => {
                i += 1;
                Token::Semicolon
            }
            _ if is_word_start(b) => {
                while i < bytes.len() && is_word_continue(bytes[i]) {
                    i += 1;
                }
                Token::Word(sql[start..i].to_string())
            }
            _ => {
                // Step over a whole character so spans stay on char boundaries.
                let ch = sql[i..].chars().next().unwrap_or('?');
                i += ch.len_utf8();
                Token::Other(ch)
            }
        };

        tokens.push(Spanned {
            token,
            start,
            end: i,
        });
    }

    tokens
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_word_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], mut i: usize) -> usize {
    let mut depth = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    i
}

/// Scan a quoted run starting at the opening quote. Returns the unescaped
/// value and the index just past the closing quote.
fn scan_quoted(sql: &str, open: usize, quote: u8, backslash_escapes: bool) -> (String, usize) {
    let bytes = sql.as_bytes();
    let mut value = Vec::new();
    let mut i = open + 1;

    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' && i + 1 < bytes.len() {
            value.push(bytes[i + 1]);
            i += 2;
        } else if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                value.push(quote);
                i += 2;
            } else {
                return (String::from_utf8_lossy(&value).into_owned(), i + 1);
            }
        } else {
            value.push(b);
            i += 1;
        }
    }

    (String::from_utf8_lossy(&value).into_owned(), i)
}

/// If a dollar-quote tag (`$$` or `$tag$`) starts at `i`, return the index
/// just past it.
fn dollar_tag(bytes: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    if bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1)
}

/// Split a script into statements on top-level semicolons.
///
/// Semicolons inside strings, quoted identifiers, dollar-quoted bodies and
/// comments do not split. Empty statements are dropped.
///
/// ```rust
/// use tenantry_core::split_statements;
///
/// let script = "CREATE TABLE a (x text DEFAULT ';'); -- done;\nDROP TABLE b;";
/// assert_eq!(
///     split_statements(script),
///     vec!["CREATE TABLE a (x text DEFAULT ';')", "-- done;\nDROP TABLE b"],
/// );
/// ```
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut segment_start = 0;
    let mut has_tokens = false;

    for spanned in tokenize(script) {
        if spanned.token == Token::Semicolon {
            if has_tokens {
                statements.push(script[segment_start..spanned.start].trim().to_string());
            }
            segment_start = spanned.end;
            has_tokens = false;
        } else {
            has_tokens = true;
        }
    }

    if has_tokens {
        statements.push(script[segment_start..].trim().to_string());
    }

    statements
}
