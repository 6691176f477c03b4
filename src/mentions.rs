//! `@filename.ext` mentions inside a query.
//!
//! The query text is the only record of which files are attached. The file
//! list sent with a request is derived from it at submit time, and toggling a
//! file in a picker edits the text, so the two can never disagree.

const BLANKS: [char; 2] = [' ', '\t'];

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Mention tokens as `(byte_start, byte_end, file_name)`, `@` included in the span.
fn scan(query: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut prev: Option<char> = None;
    for (start, c) in query.char_indices() {
        let boundary = prev.is_none_or(char::is_whitespace);
        prev = Some(c);
        if c != '@' || !boundary {
            continue;
        }
        let rest = &query[start + 1..];
        let len = rest.find(|ch: char| !is_name_char(ch)).unwrap_or(rest.len());
        // Sentence punctuation after a mention is not part of the name.
        let name = rest[..len].trim_end_matches('.');
        if name.contains('.') && !name.starts_with('.') {
            found.push((start, start + 1 + name.len(), name));
        }
    }
    found
}

/// Files mentioned in `query`, first-mention order, without duplicates.
#[must_use]
pub fn extract_mentions(query: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for (_, _, name) in scan(query) {
        if !files.iter().any(|f| f == name) {
            files.push(name.to_owned());
        }
    }
    files
}

#[must_use]
pub fn has_mention(query: &str, file: &str) -> bool {
    scan(query).iter().any(|(_, _, name)| *name == file)
}

/// Add `@file` to the query, or remove every mention of it if present.
#[must_use]
pub fn toggle_mention(query: &str, file: &str) -> String {
    let spans: Vec<_> = scan(query)
        .into_iter()
        .filter(|(_, _, name)| *name == file)
        .collect();

    if spans.is_empty() {
        let trimmed = query.trim_end();
        if trimmed.is_empty() {
            return format!("@{file} ");
        }
        return format!("{trimmed} @{file} ");
    }

    // Each removal takes the blanks after the mention, or before it at the
    // end of a line. Newlines and indentation elsewhere are kept.
    let mut out = String::with_capacity(query.len());
    let mut cursor = 0;
    for (start, end, _) in spans {
        let after = &query[end..];
        let trailing = after.len() - after.trim_start_matches(BLANKS).len();
        if trailing > 0 {
            out.push_str(&query[cursor..start]);
            cursor = end + trailing;
        } else {
            out.push_str(query[cursor..start].trim_end_matches(BLANKS));
            cursor = end;
        }
    }
    out.push_str(&query[cursor..]);
    out
}

#[cfg(test)]
#[path = "mentions_test.rs"]
mod tests;
