//! Minimal SSML tokenization: enough to split documents at tag boundaries and
//! to reduce markup to speakable text. Not a validating XML parser.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagKind {
    Open,
    Close,
    SelfClosing,
    /// Comments, processing instructions, doctype
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag<'a> {
    pub raw: &'a str,
    pub name: &'a str,
    pub kind: TagKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Text(&'a str),
    Tag(Tag<'a>),
}

/// Split markup into text runs and tags, each paired with its byte offset.
pub(crate) fn tokenize(input: &str) -> Vec<(usize, Token<'_>)> {
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(rel) = input[cursor..].find('<') {
        let lt = cursor + rel;
        let Some(tag) = parse_tag(&input[lt..]) else {
            cursor = lt + 1;
            continue;
        };
        if lt > text_start {
            tokens.push((text_start, Token::Text(&input[text_start..lt])));
        }
        cursor = lt + tag.raw.len();
        text_start = cursor;
        tokens.push((lt, Token::Tag(tag)));
    }
    if text_start < input.len() {
        tokens.push((text_start, Token::Text(&input[text_start..])));
    }
    tokens
}

fn parse_tag(input: &str) -> Option<Tag<'_>> {
    let mut chars = input.chars().skip(1);
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '/' || first == '!' || first == '?') {
        return None;
    }

    if input.starts_with("<!--") {
        let end = input.find("-->")? + 3;
        return Some(Tag {
            raw: &input[..end],
            name: "",
            kind: TagKind::Meta,
        });
    }

    let end = find_tag_end(input)?;
    let raw = &input[..end];
    let inner = &raw[1..raw.len() - 1];

    let (kind, body) = if first == '!' || first == '?' {
        (TagKind::Meta, "")
    } else if let Some(rest) = inner.strip_prefix('/') {
        (TagKind::Close, rest)
    } else if let Some(rest) = inner.strip_suffix('/') {
        (TagKind::SelfClosing, rest)
    } else {
        (TagKind::Open, inner)
    };
    let name_end = body
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(body.len());

    Some(Tag {
        raw,
        name: &body[..name_end],
        kind,
    })
}

/// Index one past the closing `>`, skipping `>` inside quoted attribute values.
fn find_tag_end(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (index, c) in input.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '>') => return Some(index + 1),
            (None, '<') => return None,
            _ => {}
        }
    }
    None
}

/// Tags after which speech has a natural boundary
pub(crate) fn is_break_tag(name: &str) -> bool {
    matches!(name, "break" | "p" | "s" | "paragraph" | "sentence")
}

/// Reduce markup to speakable text and decode the predefined XML entities.
pub fn strip_tags(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    for (_, token) in tokenize(input) {
        match token {
            Token::Text(text) => out.push_str(&decode_entities(text)),
            Token::Tag(tag) if is_break_tag(tag.name) => out.push(' '),
            Token::Tag(_) => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_tags_and_text() {
        let tokens = tokenize("<speak>Hi <break time=\"1s\"/>there</speak>");
        let kinds: Vec<_> = tokens
            .iter()
            .map(|(_, t)| match t {
                Token::Text(text) => format!("text:{text}"),
                Token::Tag(tag) => format!("{:?}:{}", tag.kind, tag.name),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "Open:speak",
                "text:Hi ",
                "SelfClosing:break",
                "text:there",
                "Close:speak"
            ]
        );
        assert_eq!(tokens[2].0, 10);
    }

    #[test]
    fn quoted_gt_does_not_end_tag() {
        let tokens = tokenize("<mark name=\"a>b\"/>x");
        match tokens[0].1 {
            Token::Tag(tag) => {
                assert_eq!(tag.raw, "<mark name=\"a>b\"/>");
                assert_eq!(tag.kind, TagKind::SelfClosing);
            }
            other => panic!("unexpected token: {other:?}"),
        }
    }

    #[test]
    fn lone_angle_bracket_is_text() {
        assert_eq!(strip_tags("5 < 6 and 7 > 3"), "5 < 6 and 7 > 3");
    }

    #[test]
    fn strips_markup_and_entities() {
        assert_eq!(
            strip_tags("<speak><!-- note -->AT&amp;T <emphasis>rocks</emphasis></speak>"),
            "AT&T rocks"
        );
        assert_eq!(strip_tags("one<break/>two"), "one two");
    }
}
