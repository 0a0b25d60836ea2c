use crate::core::{Node, Quadruple};

/// Parse a line of N-Quads/N-Triples into a Quadruple.
///
/// A leading integer is read as the publication time. Triples without a graph
/// are placed in `default_graph`. Typed and language-tagged literals keep their
/// lexical form only.
pub fn parse_nquad_line(line: &str, default_graph: &str) -> Result<Quadruple, String> {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return Err("Empty line".to_string());
    }
    if trimmed.starts_with('#') {
        return Err("Comment line".to_string());
    }

    let trimmed = trimmed.trim_end_matches('.').trim();

    let (publication_time, remaining) = parse_optional_timestamp(trimmed);
    let (subject, remaining) = parse_uri(remaining, "subject")?;
    let (predicate, remaining) = parse_uri(remaining, "predicate")?;
    let (object, remaining) = parse_object(remaining)?;

    let graph = if remaining.trim().is_empty() {
        default_graph.to_string()
    } else {
        parse_uri(remaining, "graph")?.0
    };

    let quadruple = Quadruple::new(Node::Iri(graph), Node::Iri(subject), Node::Iri(predicate), object);
    Ok(match publication_time {
        Some(time) => quadruple.with_publication_time(time),
        None => quadruple,
    })
}

fn parse_optional_timestamp(input: &str) -> (Option<u64>, &str) {
    let input = input.trim_start();

    if let Some(space_idx) = input.find(char::is_whitespace) {
        if let Ok(ts) = input[..space_idx].parse::<u64>() {
            return (Some(ts), input[space_idx..].trim_start());
        }
    }
    (None, input)
}

/// Parse a URI enclosed in angle brackets
fn parse_uri<'a>(input: &'a str, field_name: &str) -> Result<(String, &'a str), String> {
    let input = input.trim_start();

    if !input.starts_with('<') {
        return Err(format!("Expected '<' for {} URI, got: {}", field_name, input));
    }

    let end_idx = input
        .find('>')
        .ok_or_else(|| format!("Missing closing '>' for {} URI", field_name))?;

    Ok((input[1..end_idx].to_string(), input[end_idx + 1..].trim_start()))
}

fn parse_object(input: &str) -> Result<(Node, &str), String> {
    let input = input.trim_start();

    if input.starts_with('<') {
        let (uri, rest) = parse_uri(input, "object")?;
        return Ok((Node::Iri(uri), rest));
    }

    if input.starts_with('"') {
        let (value, rest) = parse_literal(input)?;
        return Ok((Node::Literal(value), rest));
    }

    Err(format!("Invalid object format: {}", input))
}

fn parse_literal(input: &str) -> Result<(String, &str), String> {
    let mut value = String::new();
    let mut escaped = false;
    let mut end_idx = None;

    for (idx, c) in input.char_indices().skip(1) {
        match (escaped, c) {
            (true, 'n') => value.push('\n'),
            (true, 't') => value.push('\t'),
            (true, other) => value.push(other),
            (false, '\\') => {
                escaped = true;
                continue;
            }
            (false, '"') => {
                end_idx = Some(idx);
                break;
            }
            (false, other) => value.push(other),
        }
        escaped = false;
    }

    let end_idx = end_idx.ok_or_else(|| "Missing closing quote for literal".to_string())?;
    let after_quote = input[end_idx + 1..].trim_start();

    // datatype or language tag
    let remaining = if let Some(after_caret) = after_quote.strip_prefix("^^") {
        parse_uri(after_caret, "datatype")?.1
    } else if let Some(after_at) = after_quote.strip_prefix('@') {
        let lang_end = after_at.find(char::is_whitespace).unwrap_or(after_at.len());
        after_at[lang_end..].trim_start()
    } else {
        after_quote
    };

    Ok((value, remaining))
}
