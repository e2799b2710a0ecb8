//! Sentence-level chunking of utterances.
//!
//! Plain text is split after sentence-ending punctuation. SSML is split at the
//! same points and at hard break tags, never inside a tag; every SSML chunk is
//! re-wrapped as a standalone `<speak>` document with the elements that were
//! open at the split closed and reopened. A chunk that reaches `max_chars`
//! without a boundary is cut at the last whitespace.

use crate::ssml::{TagKind, Token, is_break_tag, tokenize};
use crate::types::{ContentKind, Utterance};
use std::ops::Range;

const SENTENCE_END: &[char] = &['.', '!', '?', '…', '。', '！', '？'];
const CLOSING_PUNCT: &[char] = &['"', '\'', ')', ']', '”', '’', '»'];

/// A schedulable piece of an utterance, before synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Position in the utterance; defines playback order
    pub ordinal: usize,
    /// Text (or standalone SSML document) sent to the adapter
    pub text: String,
    /// Byte range of the source content this chunk covers
    pub span: Range<usize>,
}

/// Splits utterance content into ordered chunks
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
}

impl Chunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn split(&self, utterance: &Utterance) -> Vec<ChunkSpec> {
        match utterance.kind() {
            ContentKind::Plain => self.split_plain(utterance.content()),
            ContentKind::Ssml => self.split_ssml(utterance.content()),
        }
    }

    pub fn split_plain(&self, text: &str) -> Vec<ChunkSpec> {
        let mut chunks = Vec::new();
        for sentence in sentence_ranges(text) {
            for piece in self.bound_length(text, sentence) {
                let trimmed = trim_range(text, piece);
                let content = &text[trimmed.clone()];
                if content.chars().any(char::is_alphanumeric) {
                    chunks.push(ChunkSpec {
                        ordinal: chunks.len(),
                        text: content.to_string(),
                        span: trimmed,
                    });
                }
            }
        }
        chunks
    }

    /// Cut `range` into pieces of at most `max_chars` characters, preferring whitespace.
    fn bound_length(&self, text: &str, range: Range<usize>) -> Vec<Range<usize>> {
        let mut pieces = Vec::new();
        let mut start = range.start;
        loop {
            let rest = &text[start..range.end];
            start += rest.len() - rest.trim_start().len();
            let rest = &text[start..range.end];
            if rest.chars().count() <= self.max_chars {
                pieces.push(start..range.end);
                return pieces;
            }

            let byte_at = |n: usize| {
                rest.char_indices()
                    .nth(n)
                    .map(|(i, _)| start + i)
                    .unwrap_or(range.end)
            };
            let hard_cut = byte_at(self.max_chars);
            // One extra char so a space right after the limit still counts
            let window_end = byte_at(self.max_chars + 1);
            let cut = text[start..window_end]
                .rfind(char::is_whitespace)
                .map(|i| start + i)
                .filter(|&i| i > start)
                .unwrap_or(hard_cut);
            pieces.push(start..cut);
            start = cut;
        }
    }

    pub fn split_ssml(&self, document: &str) -> Vec<ChunkSpec> {
        let mut builder = SsmlChunkBuilder::new(self.max_chars);
        for (offset, token) in tokenize(document) {
            match token {
                Token::Tag(tag) if tag.name.eq_ignore_ascii_case("speak") => match tag.kind {
                    TagKind::Open if builder.speak_open.is_none() => {
                        builder.speak_open = Some(tag.raw.to_string());
                    }
                    _ => {}
                },
                Token::Tag(tag) if tag.kind == TagKind::Meta => {}
                Token::Tag(tag) => {
                    builder.push_markup(tag.raw, offset);
                    match tag.kind {
                        TagKind::Open => builder.open.push(OpenElement {
                            name: tag.name.to_string(),
                            raw: tag.raw.to_string(),
                        }),
                        TagKind::Close => builder.close_element(tag.name),
                        _ => {}
                    }
                    if is_break_tag(tag.name) && tag.kind != TagKind::Open {
                        builder.boundary();
                    }
                }
                Token::Text(text) => builder.push_text(text, offset),
            }
        }
        builder.finish()
    }
}

#[derive(Debug, Clone)]
struct OpenElement {
    name: String,
    raw: String,
}

struct SsmlChunkBuilder {
    max_chars: usize,
    speak_open: Option<String>,
    /// Elements open at the current position
    open: Vec<OpenElement>,
    /// Elements that were open when the current chunk started
    prefix: Vec<OpenElement>,
    body: String,
    visible_chars: usize,
    span: Option<Range<usize>>,
    chunks: Vec<ChunkSpec>,
}

impl SsmlChunkBuilder {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            speak_open: None,
            open: Vec::new(),
            prefix: Vec::new(),
            body: String::new(),
            visible_chars: 0,
            span: None,
            chunks: Vec::new(),
        }
    }

    fn extend_span(&mut self, range: Range<usize>) {
        self.span = Some(match self.span.take() {
            Some(span) => span.start..range.end,
            None => range,
        });
    }

    fn push_markup(&mut self, raw: &str, offset: usize) {
        self.body.push_str(raw);
        self.extend_span(offset..offset + raw.len());
    }

    fn close_element(&mut self, name: &str) {
        if let Some(index) = self.open.iter().rposition(|el| el.name == name) {
            self.open.truncate(index);
        }
    }

    fn push_text(&mut self, text: &str, offset: usize) {
        // Cut candidates as (byte offset in body, byte offset in source).
        // Only positions inside this text run are used, so the open-element
        // stack is the same on both sides of a cut.
        let mut run_start = Some((self.body.len(), offset)).filter(|(pos, _)| *pos > 0);
        let mut last_ws: Option<(usize, usize)> = None;
        let mut chars = text.char_indices().peekable();

        while let Some((index, c)) = chars.next() {
            let body_pos = self.body.len();
            let char_end = offset + index + c.len_utf8();
            self.body.push(c);
            self.extend_span(offset + index..char_end);
            self.visible_chars += 1;
            if c.is_whitespace() && body_pos > 0 {
                last_ws = Some((body_pos, offset + index));
            }

            let next = chars.peek().map(|(_, c)| *c);
            let closes_sentence = SENTENCE_END.contains(&c) || CLOSING_PUNCT.contains(&c);
            let sentence_end = closes_sentence
                && self.body_ends_sentence()
                && next.is_none_or(char::is_whitespace);
            if sentence_end {
                if self.boundary() {
                    run_start = None;
                    last_ws = None;
                }
                continue;
            }

            if self.visible_chars >= self.max_chars && next.is_some() && !self.inside_entity() {
                let emitted = match last_ws.or(run_start) {
                    Some((cut, source_cut)) => self.cut_at(cut, source_cut, char_end),
                    None => self.boundary(),
                };
                if emitted {
                    run_start = None;
                    last_ws = None;
                }
            }
        }
    }

    /// Emit everything before `cut`, keeping the rest as the start of the next chunk
    fn cut_at(&mut self, cut: usize, source_cut: usize, source_end: usize) -> bool {
        let carry = self.body.split_off(cut);
        let span = self.span.take();
        self.span = span.clone().map(|span| span.start..source_cut);
        if self.boundary() {
            self.visible_chars = carry.chars().count();
            self.span = Some(source_cut..source_end).filter(|_| !carry.trim().is_empty());
            self.body = carry;
            true
        } else {
            self.body.push_str(&carry);
            self.span = span;
            false
        }
    }

    /// Body ends in the middle of an `&...;` entity
    fn inside_entity(&self) -> bool {
        match self.body.rfind('&') {
            Some(amp) => {
                let tail = &self.body[amp..];
                !tail.contains(';') && tail.len() <= 8 && !tail.contains(char::is_whitespace)
            }
            None => false,
        }
    }

    /// Sentence punctuation, optionally followed by closing quotes/brackets
    fn body_ends_sentence(&self) -> bool {
        let trimmed = self.body.trim_end_matches(CLOSING_PUNCT);
        trimmed.ends_with(SENTENCE_END)
    }

    fn has_speech(&self) -> bool {
        let mut spoken = false;
        for (_, token) in tokenize(&self.body) {
            if let Token::Text(text) = token {
                if text.chars().any(char::is_alphanumeric) {
                    spoken = true;
                    break;
                }
            }
        }
        spoken
    }

    /// Emit the current body as a chunk. Bodies without speech are carried
    /// into the next chunk so their markup (pauses, open elements) survives.
    fn boundary(&mut self) -> bool {
        if !self.has_speech() {
            return false;
        }

        // Elements closed right at the start of the body need not be reopened
        let mut prefix = self.prefix.as_slice();
        let mut body = self.body.trim();
        while let Some((last, rest)) = prefix.split_last() {
            let closer = format!("</{}>", last.name);
            match body.strip_prefix(closer.as_str()) {
                Some(after) => {
                    body = after.trim_start();
                    prefix = rest;
                }
                None => break,
            }
        }

        let mut text = self
            .speak_open
            .clone()
            .unwrap_or_else(|| "<speak>".to_string());
        for element in prefix {
            text.push_str(&element.raw);
        }
        text.push_str(body);
        for element in self.open.iter().rev() {
            text.push_str("</");
            text.push_str(&element.name);
            text.push('>');
        }
        text.push_str("</speak>");

        self.chunks.push(ChunkSpec {
            ordinal: self.chunks.len(),
            text,
            span: self.span.take().unwrap_or(0..0),
        });
        self.body.clear();
        self.visible_chars = 0;
        self.prefix = self.open.clone();
        true
    }

    fn finish(mut self) -> Vec<ChunkSpec> {
        self.boundary();
        self.chunks
    }
}

/// Byte ranges of sentences, boundaries placed after terminal punctuation
/// (plus closing quotes) that is followed by whitespace or the end of text.
fn sentence_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        if !SENTENCE_END.contains(&c) {
            continue;
        }
        let mut end = index + c.len_utf8();
        while let Some(&(next_index, next)) = chars.peek() {
            if SENTENCE_END.contains(&next) || CLOSING_PUNCT.contains(&next) {
                end = next_index + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
        if at_boundary {
            ranges.push(start..end);
            start = end;
        }
    }
    if start < text.len() {
        ranges.push(start..text.len());
    }
    ranges
}

fn trim_range(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return range.start..range.start;
    }
    range.start + leading..range.end - trailing
}
