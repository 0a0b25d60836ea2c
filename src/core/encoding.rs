//! Encoding utilities: semantic element mapping, meta graphs, hashing and the
//! wire codec used between peers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::{Node, Quadruple};

/// Separator between the base graph and the provenance parts of a meta graph
pub const META_GRAPH_SEPARATOR: &str = "/$";

/// Number of value bytes folded into one coordinate element
pub const ELEMENT_BYTES: usize = 8;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("bincode: {0}")]
    Bincode(String),
    #[error("json: {0}")]
    Json(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        CodecError::Bincode(err.to_string())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err.to_string())
    }
}

/// Encode a message for one overlay hop
pub fn encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a message received from an overlay hop
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Render `graph/$time/$source`; an absent source is written as `null`.
pub fn meta_graph_value(graph: &str, time: u64, source: Option<&str>) -> String {
    format!(
        "{graph}{sep}{time}{sep}{source}",
        sep = META_GRAPH_SEPARATOR,
        source = source.unwrap_or("null")
    )
}

/// Split a meta graph into (base graph, publication time, source).
pub fn parse_meta_graph(value: &str) -> Option<(String, u64, Option<String>)> {
    let mut parts = value.rsplitn(3, META_GRAPH_SEPARATOR);
    let source = parts.next()?;
    let time = parts.next()?.parse::<u64>().ok()?;
    let base = parts.next()?;
    let source = (source != "null").then(|| source.to_string());
    Some((base.to_string(), time, source))
}

pub fn hash_quadruple(quadruple: &Quadruple) -> String {
    let mut hasher = Sha256::new();
    hasher.update(quadruple.meta_graph().as_str().as_bytes());
    for node in &quadruple.components()[1..] {
        hasher.update([0u8]);
        hasher.update(node.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Strip the namespace of an IRI so that values sharing a vocabulary do not
/// all land on the same coordinate.
pub fn strip_prefix(value: &str) -> &str {
    let mut value = value;
    if value.ends_with('/') || value.ends_with('#') {
        value = &value[..value.len() - 1];
    }
    let slash = value.rfind('/');
    let sharp = value.rfind('#');
    let scheme_len = scheme_length(value);

    if let Some(scheme_len) = scheme_len {
        let authority_start = scheme_len + 3;
        if slash.map_or(true, |idx| idx < authority_start) && sharp.is_none() {
            if let Some(www) = value.find("www.") {
                return &value[www + 4..];
            }
            return value.get(authority_start..).unwrap_or(value);
        }
    }

    match (slash, sharp) {
        (Some(s), Some(h)) if s > h => &value[s + 1..],
        (Some(_), Some(h)) => &value[h + 1..],
        (Some(s), None) => &value[s + 1..],
        (None, Some(h)) => &value[h + 1..],
        (None, None) => value,
    }
}

fn scheme_length(value: &str) -> Option<usize> {
    let colon = value.find(':')?;
    let scheme = &value[..colon];
    let mut chars = scheme.chars();
    let valid = chars.next().map_or(false, |c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(colon)
}

/// The value a term contributes to a coordinate, before folding into an element.
pub fn semantic_value(node: &Node) -> &str {
    match node {
        Node::Iri(value) => match value.strip_prefix("_:") {
            Some(blank) => blank,
            None => strip_prefix(value),
        },
        Node::Literal(value) => value,
    }
}

/// Fold the first bytes of a term's semantic value into a big-endian integer.
pub fn element_value(node: &Node) -> u64 {
    let bytes = semantic_value(node).as_bytes();
    let mut buffer = [0u8; ELEMENT_BYTES];
    let len = bytes.len().min(ELEMENT_BYTES);
    buffer[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("http://example.org/people/alice"), "alice");
        assert_eq!(strip_prefix("http://example.org/people/alice/"), "alice");
        assert_eq!(strip_prefix("http://xmlns.com/foaf/0.1#name"), "name");
        assert_eq!(strip_prefix("http://www.inria.fr"), "inria.fr");
        assert_eq!(strip_prefix("http://inria.fr"), "inria.fr");
        assert_eq!(strip_prefix("plain"), "plain");
    }

    #[test]
    fn test_element_value_orders_like_strings() {
        let a = element_value(&Node::literal("alice"));
        let b = element_value(&Node::literal("bob"));
        assert!(a < b);
        assert_eq!(element_value(&Node::literal("")), 0);
        assert_eq!(
            element_value(&Node::iri("http://ex.org/abcdefghij")),
            element_value(&Node::literal("abcdefgh"))
        );
    }

    #[test]
    fn test_parse_meta_graph() {
        let value = meta_graph_value("http://ex.org/g", 10, None);
        assert_eq!(parse_meta_graph(&value), Some(("http://ex.org/g".to_string(), 10, None)));
        assert_eq!(parse_meta_graph("http://ex.org/g"), None);
        assert_eq!(parse_meta_graph("http://ex.org/g/$abc/$x"), None);
    }

    #[test]
    fn test_hash_depends_on_publication_time() {
        let q = Quadruple::new(
            Node::iri("http://ex.org/g"),
            Node::iri("http://ex.org/s"),
            Node::iri("http://ex.org/p"),
            Node::literal("o"),
        );
        let h1 = hash_quadruple(&q.clone().with_publication_time(1));
        let h2 = hash_quadruple(&q.with_publication_time(2));
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, h2);
    }
}
