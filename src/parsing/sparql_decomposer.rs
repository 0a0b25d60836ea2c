//! Decomposition of continuous SPARQL queries into atomic queries.
//!
//! The accepted form is a SELECT whose WHERE clause holds one GRAPH block of
//! triple patterns, optionally preceded by PREFIX declarations:
//!
//! ```text
//! PREFIX ex: <http://example.org/>
//! SELECT ?g ?temp WHERE {
//!     GRAPH ?g { ?sensor ex:observes ex:room1 . ?sensor ex:value ?temp }
//! }
//! ```

use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::Node;
use crate::parsing::continuous_query::{AtomicQuery, ContinuousQuery, TermPattern, TriplePattern};

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecompositionError {
    #[error("malformed query: {0}")]
    Syntax(String),
    #[error("undeclared prefix: {0}")]
    UnknownPrefix(String),
    #[error("the query has no triple pattern")]
    NoPattern,
    #[error("unsupported term in {position} position: {term}")]
    UnsupportedTerm { position: &'static str, term: String },
}

/// Turns a continuous query text into its ordered atomic queries.
pub trait Decomposer: Send + Sync {
    fn parse(&self, query: &str) -> Result<ContinuousQuery, DecompositionError>;

    fn decompose(&self, query: &str) -> Result<Vec<AtomicQuery>, DecompositionError> {
        Ok(self.parse(query)?.atomic_queries())
    }
}

pub struct SparqlDecomposer {
    prefix_regex: Regex,
    query_regex: Regex,
    token_regex: Regex,
}

impl SparqlDecomposer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(SparqlDecomposer {
            prefix_regex: Regex::new(r"(?i)^\s*PREFIX\s+([A-Za-z][\w-]*)?:\s*<([^>]*)>")?,
            query_regex: Regex::new(
                r"(?is)^\s*SELECT\s+(?:DISTINCT\s+)?(.+?)\s*WHERE\s*\{\s*GRAPH\s+(\S+)\s*\{(.*)\}\s*\}\s*$",
            )?,
            token_regex: Regex::new(
                r#"<[^>\s]*>|"(?:[^"\\]|\\.)*"(?:\^\^(?:<[^>]*>|[A-Za-z][\w-]*:[\w-]*)|@[A-Za-z][\w-]*)?|[?$][A-Za-z_][\w]*|[A-Za-z][\w-]*:[\w-]*(?:\.[\w-]+)*|:[\w-]+|\ba\b|[.;,]|\S+"#,
            )?,
        })
    }

    fn strip_prefixes<'a>(
        &self,
        query: &'a str,
        prefixes: &mut HashMap<String, String>,
    ) -> &'a str {
        let mut rest = query;
        while let Some(captures) = self.prefix_regex.captures(rest) {
            let name = captures.get(1).map_or("", |m| m.as_str()).to_string();
            let namespace = captures.get(2).map_or("", |m| m.as_str()).to_string();
            prefixes.insert(name, namespace);
            let end = captures.get(0).map_or(0, |m| m.end());
            rest = &rest[end..];
        }
        rest
    }

    fn parse_term(
        &self,
        token: &str,
        prefixes: &HashMap<String, String>,
        position: &'static str,
    ) -> Result<TermPattern, DecompositionError> {
        if let Some(name) = token.strip_prefix('?').or_else(|| token.strip_prefix('$')) {
            return Ok(TermPattern::variable(name));
        }
        if let Some(iri) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            return Ok(TermPattern::Constant(Node::iri(iri)));
        }
        if token.starts_with('"') {
            if position == "graph" || position == "predicate" {
                return Err(DecompositionError::UnsupportedTerm { position, term: token.to_string() });
            }
            return Ok(TermPattern::Constant(Node::literal(unescape_literal(token)?)));
        }
        if token == "a" && position == "predicate" {
            return Ok(TermPattern::Constant(Node::iri(RDF_TYPE)));
        }
        if let Some((prefix, local)) = token.split_once(':') {
            let namespace = prefixes
                .get(prefix)
                .ok_or_else(|| DecompositionError::UnknownPrefix(prefix.to_string()))?;
            return Ok(TermPattern::Constant(Node::iri(format!("{}{}", namespace, local))));
        }
        Err(DecompositionError::UnsupportedTerm { position, term: token.to_string() })
    }

    fn parse_patterns(
        &self,
        body: &str,
        prefixes: &HashMap<String, String>,
    ) -> Result<Vec<TriplePattern>, DecompositionError> {
        let tokens: Vec<&str> = self.token_regex.find_iter(body).map(|m| m.as_str()).collect();
        let mut patterns = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut subject: Option<TermPattern> = None;
        let mut predicate: Option<TermPattern> = None;

        for token in tokens {
            match token {
                "." | ";" | "," => {
                    // `;` keeps the subject, `,` keeps subject and predicate
                    if !current.is_empty() {
                        patterns.push(self.complete_pattern(
                            &current,
                            subject.as_ref(),
                            predicate.as_ref(),
                            prefixes,
                        )?);
                        let last = patterns.last().cloned().ok_or(DecompositionError::NoPattern)?;
                        subject = Some(last.subject);
                        predicate = Some(last.predicate);
                        current.clear();
                    } else if token != "." {
                        return Err(DecompositionError::Syntax(format!("unexpected '{}'", token)));
                    }
                    match token {
                        "." => {
                            subject = None;
                            predicate = None;
                        }
                        ";" => predicate = None,
                        _ => {}
                    }
                }
                _ => current.push(token),
            }
        }
        if !current.is_empty() {
            patterns.push(self.complete_pattern(
                &current,
                subject.as_ref(),
                predicate.as_ref(),
                prefixes,
            )?);
        }
        if patterns.is_empty() {
            return Err(DecompositionError::NoPattern);
        }
        Ok(patterns)
    }

    fn complete_pattern(
        &self,
        tokens: &[&str],
        subject: Option<&TermPattern>,
        predicate: Option<&TermPattern>,
        prefixes: &HashMap<String, String>,
    ) -> Result<TriplePattern, DecompositionError> {
        let (s, p, o) = match (tokens, subject, predicate) {
            ([s, p, o], None, None) => (
                self.parse_term(s, prefixes, "subject")?,
                self.parse_term(p, prefixes, "predicate")?,
                self.parse_term(o, prefixes, "object")?,
            ),
            ([p, o], Some(s), None) => (
                s.clone(),
                self.parse_term(p, prefixes, "predicate")?,
                self.parse_term(o, prefixes, "object")?,
            ),
            ([o], Some(s), Some(p)) => (s.clone(), p.clone(), self.parse_term(o, prefixes, "object")?),
            _ => {
                return Err(DecompositionError::Syntax(format!(
                    "cannot read a triple pattern from '{}'",
                    tokens.join(" ")
                )))
            }
        };
        if matches!(s, TermPattern::Constant(Node::Literal(_))) {
            return Err(DecompositionError::UnsupportedTerm { position: "subject", term: s.to_string() });
        }
        Ok(TriplePattern { subject: s, predicate: p, object: o })
    }

    fn parse_result_vars(
        &self,
        projection: &str,
        patterns: &[TriplePattern],
        graph: &TermPattern,
    ) -> Result<Vec<String>, DecompositionError> {
        if projection.trim() == "*" {
            let mut vars: Vec<String> = Vec::new();
            let terms = std::iter::once(graph)
                .chain(patterns.iter().flat_map(|p| [&p.subject, &p.predicate, &p.object]));
            for name in terms.filter_map(TermPattern::as_variable) {
                if !vars.iter().any(|v| v == name) {
                    vars.push(name.to_string());
                }
            }
            return Ok(vars);
        }

        projection
            .split_whitespace()
            .map(|token| {
                token
                    .strip_prefix('?')
                    .or_else(|| token.strip_prefix('$'))
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        DecompositionError::Syntax(format!("invalid result variable '{}'", token))
                    })
            })
            .collect()
    }
}

impl Decomposer for SparqlDecomposer {
    fn parse(&self, query: &str) -> Result<ContinuousQuery, DecompositionError> {
        let mut prefixes = HashMap::new();
        let body = self.strip_prefixes(query, &mut prefixes);

        let captures = self.query_regex.captures(body).ok_or_else(|| {
            DecompositionError::Syntax("expected SELECT ... WHERE { GRAPH ... { ... } }".to_string())
        })?;
        let projection = captures.get(1).map_or("", |m| m.as_str());
        let graph_token = captures.get(2).map_or("", |m| m.as_str());
        let where_body = captures.get(3).map_or("", |m| m.as_str());

        let graph = self.parse_term(graph_token, &prefixes, "graph")?;
        let patterns = self.parse_patterns(where_body, &prefixes)?;
        let result_vars = self.parse_result_vars(projection, &patterns, &graph)?;

        Ok(ContinuousQuery { result_vars, graph, patterns })
    }
}

/// Lexical form of a quoted literal; datatype and language tag are dropped.
fn unescape_literal(token: &str) -> Result<String, DecompositionError> {
    let closing = token
        .rfind('"')
        .filter(|&idx| idx > 0)
        .ok_or_else(|| DecompositionError::Syntax(format!("unterminated literal {}", token)))?;
    let mut value = String::new();
    let mut chars = token[1..closing].chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some(other) => value.push(other),
                None => {}
            }
        } else {
            value.push(c);
        }
    }
    Ok(value)
}
