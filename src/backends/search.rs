//! Search syntax understood by the SQLite store.
//!
//! Terms are separated by whitespace and all of them must match. Double quotes group
//! text containing spaces, a leading `-` negates a term, and `*` is a wildcard.
//!
//! | term              | matches                                          |
//! |-------------------|--------------------------------------------------|
//! | `*`, `deck:*`     | every note                                       |
//! | `deck:Name`       | notes with a card in `Name` or one of its children |
//! | `note:Basic`      | notes of the `Basic` note type                   |
//! | `tag:verb`        | notes tagged `verb` (or `verb::*`)               |
//! | `nid:1,2`         | notes by id                                      |
//! | `Front:dog`       | notes whose `Front` field is exactly `dog`       |
//! | `dog`             | notes with `dog` anywhere in a field             |
//!
//! Matching is case-insensitive.

use super::{CollectionError, Result};
use regex::Regex;

/// Case-insensitive pattern where `*` stands for any run of characters
#[derive(Debug, Clone)]
pub struct Glob(Regex);

impl Glob {
    /// Matches the whole of a value
    ///
    /// # Errors
    ///
    /// `QuerySyntaxError` if the pattern is too large to compile
    pub fn new(pattern: &str) -> Result<Self> {
        Self::build(pattern, "")
    }

    /// Matches a `::` separated name or anything nested below it
    ///
    /// # Errors
    ///
    /// `QuerySyntaxError` if the pattern is too large to compile
    pub fn tree(pattern: &str) -> Result<Self> {
        Self::build(pattern, "(?:::.*)?")
    }

    fn build(pattern: &str, suffix: &str) -> Result<Self> {
        let body = regex::escape(pattern).replace(r"\*", ".*");
        Regex::new(&format!("(?is)^{body}{suffix}$"))
            .map(Self)
            .map_err(|e| syntax_error(format!("unusable pattern '{pattern}': {e}")))
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for Glob {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    All,
    Deck(Glob),
    NoteType(Glob),
    Tag(Glob),
    NoteIds(Vec<i64>),
    Field { name: String, value: Glob },
    Text(Glob),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub negated: bool,
    pub matcher: Matcher,
}

/// Everything a term can inspect about one note
pub struct Candidate<'a> {
    pub id: i64,
    pub notetype: &'a str,
    pub field_names: &'a [String],
    pub fields: &'a [String],
    pub tags: &'a [String],
    pub decks: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    terms: Vec<SearchTerm>,
}

impl Search {
    /// Parses a query string. An empty query matches every note.
    ///
    /// # Errors
    ///
    /// `QuerySyntaxError` for unbalanced quotes, a bare `-`, an empty `deck:`, `note:`
    /// or `tag:` value, or a non-numeric `nid:` list.
    pub fn parse(query: &str) -> Result<Self> {
        let terms = tokenize(query)?
            .into_iter()
            .map(parse_term)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }

    #[must_use]
    pub fn terms(&self) -> &[SearchTerm] {
        &self.terms
    }

    #[must_use]
    pub fn matches(&self, candidate: &Candidate<'_>) -> bool {
        self.terms
            .iter()
            .all(|term| term.matcher.matches(candidate) != term.negated)
    }
}

impl Matcher {
    fn matches(&self, c: &Candidate<'_>) -> bool {
        match self {
            Self::All => true,
            Self::Deck(deck) => c.decks.iter().any(|d| deck.is_match(d)),
            Self::NoteType(name) => name.is_match(c.notetype),
            Self::Tag(tag) => c.tags.iter().any(|t| tag.is_match(t)),
            Self::NoteIds(ids) => ids.contains(&c.id),
            Self::Field { name, value } => c
                .field_names
                .iter()
                .position(|f| f.eq_ignore_ascii_case(name))
                .and_then(|idx| c.fields.get(idx))
                .is_some_and(|v| value.is_match(v)),
            Self::Text(text) => c.fields.iter().any(|v| text.is_match(v)),
        }
    }
}

struct Token {
    negated: bool,
    text: String,
}

fn syntax_error(msg: impl Into<String>) -> CollectionError {
    CollectionError::QuerySyntaxError(msg.into())
}

// Split on unquoted whitespace; a `-` before anything else in a token negates it
fn tokenize(query: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current: Option<Token> = None;
    let mut in_quotes = false;

    for ch in query.chars() {
        if ch.is_whitespace() && !in_quotes {
            tokens.extend(current.take());
            continue;
        }

        let token = current.get_or_insert_with(|| Token {
            negated: false,
            text: String::new(),
        });
        match ch {
            '"' => in_quotes = !in_quotes,
            '-' if !in_quotes && !token.negated && token.text.is_empty() => token.negated = true,
            _ => token.text.push(ch),
        }
    }

    if in_quotes {
        return Err(syntax_error(format!("unbalanced quote in '{query}'")));
    }
    tokens.extend(current);
    Ok(tokens)
}

fn parse_term(token: Token) -> Result<SearchTerm> {
    let Token { negated, text } = token;
    if text.is_empty() {
        return Err(syntax_error(if negated {
            "'-' must be followed by a search term"
        } else {
            "empty search term"
        }));
    }

    let matcher = match text.split_once(':') {
        Some((prefix, value)) if !prefix.is_empty() => match prefix.to_lowercase().as_str() {
            "deck" if value == "*" => Matcher::All,
            "deck" => Matcher::Deck(Glob::tree(required(prefix, value)?)?),
            "note" => Matcher::NoteType(Glob::new(required(prefix, value)?)?),
            "tag" => Matcher::Tag(Glob::tree(required(prefix, value)?)?),
            "nid" => Matcher::NoteIds(parse_ids(value)?),
            _ => Matcher::Field {
                name: prefix.to_string(),
                value: Glob::new(value)?,
            },
        },
        _ if text == "*" => Matcher::All,
        _ => Matcher::Text(Glob::new(&format!("*{text}*"))?),
    };

    Ok(SearchTerm { negated, matcher })
}

fn required<'a>(prefix: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() {
        Err(syntax_error(format!("'{prefix}:' needs a value")))
    } else {
        Ok(value)
    }
}

fn parse_ids(value: &str) -> Result<Vec<i64>> {
    value
        .split(',')
        .map(|id| {
            id.trim()
                .parse::<i64>()
                .map_err(|_| syntax_error(format!("'{id}' is not a note ID")))
        })
        .collect()
}
