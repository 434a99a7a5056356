//! Line scanner for agent files.
//!
//! Grammar (surface syntax, fixed by this crate):
//!
//! ```text
//! file    := (blank | comment | block)*
//! block   := header NEWLINE body "@end"
//! header  := "@" kind [ "(" params ")" ] [ "->" ident ]
//! params  := key "=" value ("," key "=" value)*
//! value   := quoted-string | number | "true" | "false"
//! comment := "#" ... (top level only; body lines are kept verbatim)
//! ```
//!
//! Inside a body, any line that parses as a header opens a nested block and
//! must be closed by its own `@end`; the top-level parser only needs this to
//! find the matching terminator, since compound bodies are re-parsed lazily
//! by the executor with this same function.

use std::collections::BTreeMap;

use crate::block::{Block, BlockKind, ParamValue};
use crate::error::ParseError;

/// Parses an agent file into an ordered list of blocks.
pub fn parse_agent_file(input: &str) -> Result<Vec<Block>, ParseError> {
    let lines: Vec<&str> = input.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        let line_no = i + 1;

        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }
        if trimmed == "@end" {
            return Err(ParseError::StrayEnd { line: line_no });
        }
        if !trimmed.starts_with('@') {
            return Err(ParseError::ContentOutsideBlock { line: line_no });
        }

        let header = parse_header(trimmed, line_no)?;
        let (body_lines, end_line) = collect_body(&lines, i + 1, line_no, header.kind)?;
        blocks.push(Block {
            kind: header.kind,
            params: header.params,
            body: body_lines.join("\n"),
            output_var: header.output_var,
            line_range: (line_no, end_line),
        });
        i = end_line; // end_line is 1-based; resume after it
    }

    Ok(blocks)
}

struct Header {
    kind: BlockKind,
    params: BTreeMap<String, ParamValue>,
    output_var: Option<String>,
}

/// Collects body lines for a block whose header sits at `header_line`,
/// returning `(body, end_line)` where `end_line` is the 1-based line of the
/// matching `@end`.
fn collect_body(
    lines: &[&str],
    start: usize,
    header_line: usize,
    kind: BlockKind,
) -> Result<(Vec<String>, usize), ParseError> {
    let mut depth = 1usize;
    let mut body = Vec::new();
    for (offset, raw) in lines[start..].iter().enumerate() {
        let trimmed = raw.trim();
        if trimmed == "@end" {
            depth -= 1;
            if depth == 0 {
                return Ok((body, start + offset + 1));
            }
        } else if looks_like_header(trimmed) {
            depth += 1;
        }
        body.push((*raw).to_string());
    }
    Err(ParseError::Unterminated {
        start: header_line,
        end: lines.len(),
        kind: kind.as_str().to_string(),
    })
}

/// A line opens a nested block when it starts with `@` + a known kind followed
/// by `(`, whitespace, `->`, or end of line.
fn looks_like_header(trimmed: &str) -> bool {
    let Some(rest) = trimmed.strip_prefix('@') else {
        return false;
    };
    let ident: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if ident.parse::<BlockKind>().is_err() {
        return false;
    }
    let after = &rest[ident.len()..];
    after.is_empty() || after.starts_with('(') || after.starts_with(char::is_whitespace)
}

fn parse_header(line: &str, line_no: usize) -> Result<Header, ParseError> {
    let rest = &line[1..]; // skip '@'
    let ident: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if ident.is_empty() {
        return Err(ParseError::MalformedHeader {
            line: line_no,
            reason: "missing block kind after '@'".to_string(),
        });
    }
    let kind: BlockKind = ident
        .parse()
        .map_err(|k| ParseError::UnknownKind { line: line_no, kind: k })?;

    let mut rest = rest[ident.len()..].trim_start();
    let mut params = BTreeMap::new();
    if rest.starts_with('(') {
        let close = matching_paren(rest).ok_or_else(|| ParseError::MalformedHeader {
            line: line_no,
            reason: "unclosed '(' in block header".to_string(),
        })?;
        params = parse_params(&rest[1..close], line_no)?;
        rest = rest[close + 1..].trim_start();
    }

    let output_var = if let Some(tail) = rest.strip_prefix("->") {
        let name = tail.trim();
        if !is_ident(name) || name.starts_with('_') {
            return Err(ParseError::InvalidOutputVar {
                line: line_no,
                name: name.to_string(),
            });
        }
        Some(name.to_string())
    } else if rest.is_empty() {
        None
    } else {
        return Err(ParseError::MalformedHeader {
            line: line_no,
            reason: format!("unexpected trailing text '{rest}'"),
        });
    };

    Ok(Header {
        kind,
        params,
        output_var,
    })
}

/// Index of the `)` that closes the leading `(`, respecting quoted strings.
fn matching_paren(s: &str) -> Option<usize> {
    let mut in_str = false;
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            ')' => return Some(idx),
            _ => {}
        }
    }
    None
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_params(s: &str, line_no: usize) -> Result<BTreeMap<String, ParamValue>, ParseError> {
    let mut params = BTreeMap::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or_else(|| ParseError::InvalidParam {
            line: line_no,
            reason: format!("expected key=value, got '{rest}'"),
        })?;
        let key = rest[..eq].trim();
        if !is_ident(key) {
            return Err(ParseError::InvalidParam {
                line: line_no,
                reason: format!("invalid parameter name '{key}'"),
            });
        }
        rest = rest[eq + 1..].trim_start();
        let (value, consumed) = parse_value(rest, line_no)?;
        if params.insert(key.to_string(), value).is_some() {
            return Err(ParseError::InvalidParam {
                line: line_no,
                reason: format!("duplicate parameter '{key}'"),
            });
        }
        rest = rest[consumed..].trim_start();
        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma.trim_start();
            if rest.is_empty() {
                return Err(ParseError::InvalidParam {
                    line: line_no,
                    reason: "trailing comma".to_string(),
                });
            }
        } else if !rest.is_empty() {
            return Err(ParseError::InvalidParam {
                line: line_no,
                reason: format!("expected ',' before '{rest}'"),
            });
        }
    }
    Ok(params)
}

/// Parses one value at the head of `s`; returns the value and bytes consumed.
fn parse_value(s: &str, line_no: usize) -> Result<(ParamValue, usize), ParseError> {
    if let Some(inner) = s.strip_prefix('"') {
        let mut out = String::new();
        let mut escaped = false;
        for (idx, c) in inner.char_indices() {
            if escaped {
                out.push(match c {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return Ok((ParamValue::Str(out), idx + 2));
            } else {
                out.push(c);
            }
        }
        return Err(ParseError::InvalidParam {
            line: line_no,
            reason: "unterminated string".to_string(),
        });
    }

    let end = s
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(s.len());
    let token = &s[..end];
    let value = match token {
        "true" => ParamValue::Bool(true),
        "false" => ParamValue::Bool(false),
        _ => token
            .parse::<f64>()
            .map(ParamValue::Number)
            .map_err(|_| ParseError::InvalidParam {
                line: line_no,
                reason: format!("unrecognized value '{token}'"),
            })?,
    };
    Ok((value, end))
}
