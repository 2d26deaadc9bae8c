//! Pattern-matching reader over a source buffer.
//!
//! The matcher is the single lexical primitive the parser is built on.
//! A pattern is a runtime string of literal text and placeholders:
//!
//! * `%w`: word, an alphanumeric/underscore run not starting with a digit
//! * `%i`: integer
//! * `%r` / `%d`: real/decimal number
//! * `%f`: float literal (`1.5`, `2f`, `-0.25f`)
//! * `%a`: alphabetic run
//! * `%s`: balanced run up to the next un-nested occurrence of whatever
//!   follows in the pattern; never stops inside open braces or a quote
//! * `%c`: a single character
//! * `%0`: end-of-input assertion
//! * `%|`: alternation separator
//!
//! Matching either consumes an entire alternative or restores the read
//! cursor exactly; a malformed pattern or structurally unbalanced input
//! is reported as [`MatchError::Input`], distinct from an ordinary
//! [`MatchError::NotFound`]. Captures are slices borrowed from the
//! source buffer.

use crate::ast::Span;
use log::trace;
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit1},
    combinator::{opt, recognize},
    multi::many0,
    sequence::{pair, tuple},
    IResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    /// No alternative matched; the cursor was restored.
    NotFound,
    /// Malformed pattern or unbalanced input; hard error for the caller.
    Input,
}

/// A placeholder capture: a slice of the source buffer plus its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture<'src> {
    pub text: &'src str,
    pub span: Span,
}

/// One element of a tokenized pattern alternative.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Elem<'p> {
    Word(&'p str),
    Punct(&'p str),
    Sep,
    PlaceWord,
    PlaceInt,
    PlaceReal,
    PlaceFloat,
    PlaceAlpha,
    PlaceBalanced,
    PlaceChar,
    PlaceEnd,
}

/// Two-character operators that single-character delimiters must not
/// split. `a <= b` scanned for `=` skips the `=` inside `<=`.
const TWO_CHAR_OPS: [&str; 4] = ["==", "!=", "<=", ">="];

pub struct Matcher<'src> {
    src: &'src str,
    base: usize,
    pos: usize,
    case_sensitive: bool,
}

impl<'src> Matcher<'src> {
    pub fn new(src: &'src str) -> Self {
        Matcher {
            src,
            base: 0,
            pos: 0,
            case_sensitive: true,
        }
    }

    /// A matcher over a sub-slice of a larger buffer; captures report
    /// spans offset by `base` so they stay valid against the full buffer.
    pub fn with_offset(src: &'src str, base: usize) -> Self {
        Matcher {
            src,
            base,
            pos: 0,
            case_sensitive: true,
        }
    }

    pub fn set_case_sensitive(&mut self, on: bool) {
        self.case_sensitive = on;
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn global_pos(&self) -> usize {
        self.base + self.pos
    }

    pub fn rest(&self) -> &'src str {
        &self.src[self.pos..]
    }

    /// True once only whitespace remains.
    pub fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.src.len()
    }

    /// Try each `%|`-separated alternative left to right against the
    /// current read position. Returns the index of the first alternative
    /// that matches in full; the cursor is restored on any failure.
    pub fn try_match(
        &mut self,
        pattern: &str,
        caps: &mut Vec<Capture<'src>>,
    ) -> Result<usize, MatchError> {
        let start = self.pos;
        let cap_base = caps.len();

        for (index, alternative) in pattern.split("%|").enumerate() {
            let elems = tokenize_alternative(alternative)?;
            match self.match_alternative(&elems, caps) {
                Ok(()) => {
                    trace!("matched alternative {} of `{}`", index, pattern);
                    return Ok(index);
                }
                Err(MatchError::NotFound) => {
                    self.pos = start;
                    caps.truncate(cap_base);
                }
                Err(MatchError::Input) => {
                    self.pos = start;
                    caps.truncate(cap_base);
                    return Err(MatchError::Input);
                }
            }
        }

        self.pos = start;
        Err(MatchError::NotFound)
    }

    fn match_alternative(
        &mut self,
        elems: &[Elem],
        caps: &mut Vec<Capture<'src>>,
    ) -> Result<(), MatchError> {
        let mut pending_sep = false;
        let mut prev_word = false;

        let mut i = 0;
        while i < elems.len() {
            let elem = elems[i];
            if elem == Elem::Sep {
                pending_sep = true;
                i += 1;
                continue;
            }

            let skipped = self.skip_whitespace();
            // A pattern-level separator after a word literal demands a
            // real word boundary: `return x` yes, `returnx` no.
            if pending_sep && prev_word && skipped == 0 {
                if self.peek_char().map_or(false, is_word_char) {
                    return Err(MatchError::NotFound);
                }
            }
            pending_sep = false;

            match elem {
                Elem::Sep => unreachable!(),
                Elem::Word(w) => {
                    self.match_word_literal(w)?;
                    prev_word = true;
                }
                Elem::Punct(p) => {
                    self.match_punct_literal(p)?;
                    prev_word = false;
                }
                Elem::PlaceWord => {
                    caps.push(self.take_with(word_lit)?);
                    prev_word = true;
                }
                Elem::PlaceInt => {
                    caps.push(self.take_with(int_lit)?);
                    prev_word = true;
                }
                Elem::PlaceReal => {
                    caps.push(self.take_with(real_lit)?);
                    prev_word = true;
                }
                Elem::PlaceFloat => {
                    caps.push(self.take_with(float_lit)?);
                    prev_word = true;
                }
                Elem::PlaceAlpha => {
                    caps.push(self.take_with(alpha_lit)?);
                    prev_word = true;
                }
                Elem::PlaceChar => {
                    let ch = self.peek_char().ok_or(MatchError::NotFound)?;
                    let len = ch.len_utf8();
                    caps.push(self.capture(self.pos, self.pos + len));
                    self.pos += len;
                    prev_word = is_word_char(ch);
                }
                Elem::PlaceEnd => {
                    if self.pos < self.src.len() {
                        return Err(MatchError::NotFound);
                    }
                    prev_word = false;
                }
                Elem::PlaceBalanced => {
                    let delim = elems[i + 1..].iter().find(|e| !matches!(**e, Elem::Sep));
                    let delim = match delim {
                        Some(Elem::Word(w)) => Some((*w, true)),
                        Some(Elem::Punct(p)) => Some((*p, false)),
                        Some(Elem::PlaceEnd) | None => None,
                        // `%s` must be followed by literal text or the end
                        // of the alternative; anything else is a grammar
                        // bug in the pattern.
                        Some(_) => return Err(MatchError::Input),
                    };
                    let end = self.scan_balanced(self.pos, delim)?;
                    caps.push(self.capture_trimmed(self.pos, end));
                    self.pos = end;
                    prev_word = false;
                }
            }
            i += 1;
        }

        Ok(())
    }

    /// Scan forward from `from` for the next un-nested occurrence of
    /// `delim`, tracking brace nesting and quote state. Returns the
    /// position just before the delimiter, the buffer end when `delim`
    /// is `None`, or an error: `NotFound` when the delimiter never
    /// appears, `Input` when the input itself is unbalanced.
    fn scan_balanced(
        &self,
        from: usize,
        delim: Option<(&str, bool)>,
    ) -> Result<usize, MatchError> {
        let mut depth: u32 = 0;
        let mut in_quote = false;

        for (off, ch) in self.src[from..].char_indices() {
            let here = from + off;

            if depth == 0 {
                if let Some((text, is_word)) = delim {
                    let quote_ok = !in_quote || text.starts_with('"');
                    if quote_ok
                        && self.literal_at(here, text)
                        && !embedded_in_operator(self.src, here, text)
                        && (!is_word || word_bounded(self.src, here, text))
                    {
                        return Ok(here);
                    }
                }
            }

            if ch == '"' {
                in_quote = !in_quote;
                continue;
            }
            if in_quote {
                continue;
            }
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => {
                    if depth == 0 {
                        return Err(MatchError::Input);
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }

        if depth != 0 || in_quote {
            return Err(MatchError::Input);
        }
        match delim {
            None => Ok(self.src.len()),
            Some(_) => Err(MatchError::NotFound),
        }
    }

    fn match_word_literal(&mut self, w: &str) -> Result<(), MatchError> {
        if !self.literal_at(self.pos, w) {
            return Err(MatchError::NotFound);
        }
        // The literal must end at a word boundary: `if` must not match
        // the head of `iffy`.
        let after = self.pos + w.len();
        if self.src[after..].chars().next().map_or(false, is_word_char) {
            return Err(MatchError::NotFound);
        }
        self.pos = after;
        Ok(())
    }

    fn match_punct_literal(&mut self, p: &str) -> Result<(), MatchError> {
        if !self.literal_at(self.pos, p) {
            return Err(MatchError::NotFound);
        }
        if embedded_in_operator(self.src, self.pos, p) {
            return Err(MatchError::NotFound);
        }
        self.pos += p.len();
        Ok(())
    }

    fn literal_at(&self, pos: usize, text: &str) -> bool {
        let end = pos + text.len();
        if end > self.src.len() || !self.src.is_char_boundary(end) {
            return false;
        }
        let slice = &self.src[pos..end];
        if self.case_sensitive {
            slice == text
        } else {
            slice.eq_ignore_ascii_case(text)
        }
    }

    fn take_with(
        &mut self,
        f: impl Fn(&str) -> IResult<&str, &str>,
    ) -> Result<Capture<'src>, MatchError> {
        let rest: &'src str = &self.src[self.pos..];
        match f(rest) {
            Ok((_, text)) => {
                let cap = self.capture(self.pos, self.pos + text.len());
                self.pos += text.len();
                Ok(cap)
            }
            Err(_) => Err(MatchError::NotFound),
        }
    }

    fn capture(&self, start: usize, end: usize) -> Capture<'src> {
        Capture {
            text: &self.src[start..end],
            span: Span::new(self.base + start, self.base + end),
        }
    }

    /// Capture with surrounding whitespace trimmed off both the text and
    /// the span.
    fn capture_trimmed(&self, start: usize, end: usize) -> Capture<'src> {
        let raw = &self.src[start..end];
        let trimmed = raw.trim_start();
        let lead = raw.len() - trimmed.len();
        let trimmed = trimmed.trim_end();
        let s = start + lead;
        self.capture(s, s + trimmed.len())
    }

    pub fn skip_whitespace(&mut self) -> usize {
        let before = self.pos;
        while let Some(ch) = self.peek_char() {
            if !ch.is_whitespace() {
                break;
            }
            self.pos += ch.len_utf8();
        }
        self.pos - before
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    /// Error recovery: advance past the next top-level `;`, or to the
    /// end of the buffer. Never fails; nesting and quotes are tracked so
    /// the skip does not stop inside a block.
    pub fn skip_statement(&mut self) {
        let mut depth: u32 = 0;
        let mut in_quote = false;
        while let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
            if ch == '"' {
                in_quote = !in_quote;
                continue;
            }
            if in_quote {
                continue;
            }
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => {
                    depth = depth.saturating_sub(1);
                    // A block closing back to the top level ends the
                    // statement as surely as a `;` does.
                    if ch == '}' && depth == 0 {
                        return;
                    }
                }
                ';' if depth == 0 => return,
                _ => {}
            }
        }
    }
}

/// Find the first un-nested occurrence of `op` in `src` at or after
/// `from`, applying the same brace/quote tracking and two-character
/// operator guard as `%s` scanning. `Ok(None)` when absent; `Input`
/// when the slice itself is unbalanced.
pub fn find_top_level_from(
    src: &str,
    op: &str,
    from: usize,
) -> Result<Option<usize>, MatchError> {
    let mut depth: u32 = 0;
    let mut in_quote = false;

    for (off, ch) in src[from..].char_indices() {
        let here = from + off;

        if depth == 0
            && !in_quote
            && src[here..].starts_with(op)
            && !embedded_in_operator(src, here, op)
        {
            return Ok(Some(here));
        }

        if ch == '"' {
            in_quote = !in_quote;
            continue;
        }
        if in_quote {
            continue;
        }
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                if depth == 0 {
                    return Err(MatchError::Input);
                }
                depth -= 1;
            }
            _ => {}
        }
    }

    if depth != 0 || in_quote {
        return Err(MatchError::Input);
    }
    Ok(None)
}

pub fn find_top_level(src: &str, op: &str) -> Result<Option<usize>, MatchError> {
    find_top_level_from(src, op, 0)
}

/// True when matching `text` at `pos` would split a two-character
/// operator: `=` inside `==`/`<=`/`>=`/`!=`, `<` or `>` inside `<=`/`>=`.
fn embedded_in_operator(src: &str, pos: usize, text: &str) -> bool {
    let next = src[pos + text.len()..].chars().next();
    let prev = src[..pos].chars().next_back();
    match text {
        "=" => next == Some('=') || matches!(prev, Some('=') | Some('<') | Some('>') | Some('!')),
        "<" | ">" => next == Some('='),
        _ => false,
    }
}

fn word_bounded(src: &str, pos: usize, text: &str) -> bool {
    let prev_ok = !src[..pos].chars().next_back().map_or(false, is_word_char);
    let next_ok = !src[pos + text.len()..]
        .chars()
        .next()
        .map_or(false, is_word_char);
    prev_ok && next_ok
}

pub fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Split one alternative into elements, validating that the literal text
/// of the pattern itself is balanced; an unbalanced pattern is a
/// grammar bug and reports `Input`, never `NotFound`.
fn tokenize_alternative(alternative: &str) -> Result<Vec<Elem<'_>>, MatchError> {
    let mut elems = Vec::new();
    let mut depth: i32 = 0;
    let mut quotes = 0usize;
    let mut rest = alternative;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('%') {
            let place = after.chars().next().ok_or(MatchError::Input)?;
            elems.push(match place {
                'w' => Elem::PlaceWord,
                'i' => Elem::PlaceInt,
                'r' | 'd' => Elem::PlaceReal,
                'f' => Elem::PlaceFloat,
                'a' => Elem::PlaceAlpha,
                's' => Elem::PlaceBalanced,
                'c' => Elem::PlaceChar,
                '0' => Elem::PlaceEnd,
                _ => return Err(MatchError::Input),
            });
            rest = &after[place.len_utf8()..];
            continue;
        }

        let ch = rest.chars().next().unwrap();
        if ch.is_whitespace() {
            if elems.last() != Some(&Elem::Sep) {
                elems.push(Elem::Sep);
            }
            rest = rest.trim_start();
            continue;
        }

        if is_word_char(ch) {
            let len = rest
                .char_indices()
                .find(|&(_, c)| !is_word_char(c))
                .map_or(rest.len(), |(i, _)| i);
            elems.push(Elem::Word(&rest[..len]));
            rest = &rest[len..];
            continue;
        }

        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '"' => quotes += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(MatchError::Input);
        }

        let two = TWO_CHAR_OPS.iter().find(|op| rest.starts_with(**op));
        let len = two.map_or(ch.len_utf8(), |op| op.len());
        elems.push(Elem::Punct(&rest[..len]));
        rest = &rest[len..];
    }

    if depth != 0 || quotes % 2 != 0 {
        return Err(MatchError::Input);
    }
    Ok(elems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_and_int_placeholders() {
        let mut m = Matcher::new("count = 42;");
        let mut caps = Vec::new();
        let idx = m.try_match("%w=%i;", &mut caps).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(caps[0].text, "count");
        assert_eq!(caps[1].text, "42");
        assert_eq!(caps[0].span, Span::new(0, 5));
    }

    #[test]
    fn test_alternation_returns_first_matching_index() {
        let mut m = Matcher::new("abc");
        let mut caps = Vec::new();
        let idx = m.try_match("%i%0 %| %w%0", &mut caps).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(caps[0].text, "abc");
    }

    #[test]
    fn test_rollback_on_not_found() {
        let mut m = Matcher::new("hello world");
        let mut caps = Vec::new();
        assert_eq!(m.try_match("%i", &mut caps), Err(MatchError::NotFound));
        assert_eq!(m.pos(), 0);
        assert!(caps.is_empty());
        // The cursor is intact, so a matching pattern still works.
        assert!(m.try_match("%w %w%0", &mut caps).is_ok());
    }

    #[test]
    fn test_rollback_on_input_error() {
        let mut m = Matcher::new("float a = (1 + 2;");
        let mut caps = Vec::new();
        assert_eq!(m.try_match("%w %w=%s;", &mut caps), Err(MatchError::Input));
        assert_eq!(m.pos(), 0);
        assert!(caps.is_empty());
    }

    #[test]
    fn test_balanced_capture_skips_nested_delimiters() {
        let mut m = Matcher::new("f(a, (b; c)); tail");
        let mut caps = Vec::new();
        m.try_match("%s;", &mut caps).unwrap();
        assert_eq!(caps[0].text, "f(a, (b; c))");
        let open = caps[0].text.matches('(').count();
        let close = caps[0].text.matches(')').count();
        assert_eq!(open, close);
    }

    #[test]
    fn test_balanced_capture_ignores_quoted_delimiters() {
        let mut m = Matcher::new("\"a;b\";");
        let mut caps = Vec::new();
        m.try_match("%s;", &mut caps).unwrap();
        assert_eq!(caps[0].text, "\"a;b\"");
    }

    #[test]
    fn test_stray_closer_is_input_error() {
        let mut m = Matcher::new("a) ;");
        let mut caps = Vec::new();
        assert_eq!(m.try_match("%s;", &mut caps), Err(MatchError::Input));
    }

    #[test]
    fn test_malformed_pattern_is_input_error() {
        let mut m = Matcher::new("anything");
        let mut caps = Vec::new();
        assert_eq!(m.try_match("(%s%0", &mut caps), Err(MatchError::Input));
        assert_eq!(m.try_match("%q", &mut caps), Err(MatchError::Input));
    }

    #[test]
    fn test_word_requires_boundary_after_keyword() {
        let mut m = Matcher::new("returnx;");
        let mut caps = Vec::new();
        let idx = m.try_match("return %s; %| %s;", &mut caps).unwrap();
        assert_eq!(idx, 1, "`returnx` must not match the keyword form");
        assert_eq!(caps[0].text, "returnx");
    }

    #[test]
    fn test_empty_balanced_capture() {
        let mut m = Matcher::new("()");
        let mut caps = Vec::new();
        m.try_match("(%s)%0", &mut caps).unwrap();
        assert_eq!(caps[0].text, "");
    }

    #[test]
    fn test_float_and_real_placeholders() {
        let mut m = Matcher::new("3.25f");
        let mut caps = Vec::new();
        m.try_match("%f%0", &mut caps).unwrap();
        assert_eq!(caps[0].text, "3.25f");

        let mut m = Matcher::new("-1.5");
        let mut caps = Vec::new();
        m.try_match("%r%0", &mut caps).unwrap();
        assert_eq!(caps[0].text, "-1.5");
    }

    #[test]
    fn test_int_rejects_trailing_fraction_with_end_assertion() {
        let mut m = Matcher::new("1.5");
        let mut caps = Vec::new();
        assert_eq!(m.try_match("%i%0", &mut caps), Err(MatchError::NotFound));
    }

    #[test]
    fn test_single_char_placeholder() {
        let mut m = Matcher::new("+ rest");
        let mut caps = Vec::new();
        m.try_match("%c", &mut caps).unwrap();
        assert_eq!(caps[0].text, "+");
    }

    #[test]
    fn test_case_insensitive_mode() {
        let mut m = Matcher::new("FLOAT x;");
        m.set_case_sensitive(false);
        let mut caps = Vec::new();
        assert!(m.try_match("float %w;", &mut caps).is_ok());
        assert_eq!(caps[0].text, "x");
    }

    #[test]
    fn test_whitespace_collapses_between_tokens() {
        let mut m = Matcher::new("if   ( x )   { y; }");
        let mut caps = Vec::new();
        m.try_match("if(%s){%s}", &mut caps).unwrap();
        assert_eq!(caps[0].text, "x");
        assert_eq!(caps[1].text, "y;");
    }

    #[test]
    fn test_find_top_level_skips_nested_and_embedded() {
        assert_eq!(find_top_level("a + (b + c)", "+").unwrap(), Some(2));
        assert_eq!(find_top_level("(a + b)", "+").unwrap(), None);
        // `=` inside `<=` is not an assignment.
        assert_eq!(find_top_level("a <= b", "=").unwrap(), None);
        assert_eq!(find_top_level("a = b", "=").unwrap(), Some(2));
        assert_eq!(find_top_level("a < b", "<").unwrap(), Some(2));
        assert_eq!(find_top_level("a <= b", "<").unwrap(), None);
        assert!(find_top_level("a)", "+").is_err());
    }

    #[test]
    fn test_skip_statement_recovery() {
        let mut m = Matcher::new("garbage stuff; next");
        m.skip_statement();
        assert_eq!(m.rest(), " next");

        // A closing block ends the statement too.
        let mut m = Matcher::new("else { a; b; } float y;");
        m.skip_statement();
        assert_eq!(m.rest(), " float y;");
    }

    #[test]
    fn test_import_path_capture_through_quotes() {
        let mut m = Matcher::new("import\"lib/common.gl\"");
        let mut caps = Vec::new();
        m.try_match("import\"%s\"", &mut caps).unwrap();
        assert_eq!(caps[0].text, "lib/common.gl");
    }
}

fn word_lit(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn alpha_lit(input: &str) -> IResult<&str, &str> {
    alpha1(input)
}

fn int_lit(input: &str) -> IResult<&str, &str> {
    recognize(pair(opt(char('-')), digit1))(input)
}

fn real_lit(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
    )))(input)
}

fn float_lit(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
        opt(char('f')),
    )))(input)
}
