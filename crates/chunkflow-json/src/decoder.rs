//! Resumable scanner that finds value boundaries in concatenated JSON.
//!
//! The scanner never builds values itself. It tracks just enough structure
//! (open containers, whether it is inside a string, number or literal) to
//! know where each top-level value ends, and validates that structure on
//! the way. Complete value slices are handed to `serde_json` afterwards.

use bytes::{Bytes, BytesMut};
use chunkflow_core::{DecoderConfig, Separator};
use serde::de::DeserializeOwned;

use crate::JsonError;

/// One complete top-level value, as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    /// Byte offset of the value's first byte in the decoded body.
    pub offset: u64,
    pub bytes: Bytes,
}

impl RawValue {
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, JsonError> {
        serde_json::from_slice(&self.bytes).map_err(|e| JsonError::parse(self.offset, e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Array,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Backslash,
    /// Hex digits still expected in a `\uXXXX` escape.
    Unicode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Number {
    Minus,
    Zero,
    Int,
    Dot,
    Frac,
    Exp,
    ExpSign,
    ExpDigits,
}

impl Number {
    fn is_complete(self) -> bool {
        matches!(self, Self::Zero | Self::Int | Self::Frac | Self::ExpDigits)
    }

    /// Next state on `b`, or `None` if `b` cannot continue the number.
    fn advance(self, b: u8) -> Option<Self> {
        use Number::*;
        match (self, b) {
            (Minus, b'0') => Some(Zero),
            (Minus | Int, b'1'..=b'9') | (Int, b'0') => Some(Int),
            (Zero | Int, b'.') => Some(Dot),
            (Dot | Frac, b'0'..=b'9') => Some(Frac),
            (Zero | Int | Frac, b'e' | b'E') => Some(Exp),
            (Exp, b'+' | b'-') => Some(ExpSign),
            (Exp | ExpSign | ExpDigits, b'0'..=b'9') => Some(ExpDigits),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Outside any value; whitespace and separators only.
    Between,
    /// After `:` or `,` in an array.
    Value,
    /// Right after `[`.
    ArrayStart,
    /// Right after `{`.
    ObjectStart,
    /// After `,` in an object.
    Key,
    Colon,
    /// After a value nested in a container.
    AfterValue,
    Str { key: bool, escape: Escape },
    Number(Number),
    Literal { word: &'static [u8], matched: usize },
}

/// What the scanner did with one byte.
enum Step {
    Next,
    /// The byte ended a nested number and must be scanned again.
    Reprocess,
    /// The byte completed a top-level value.
    Emit,
    /// A top-level number ended just before this byte, which must be
    /// scanned again.
    EmitBefore,
}

/// Scanner state carried across chunk boundaries.
#[derive(Debug, Clone)]
pub struct ParserState {
    stack: Vec<Container>,
    mode: Mode,
    offset: u64,
    value_offset: u64,
    values: u64,
    saw_whitespace: bool,
    saw_newline: bool,
}

impl ParserState {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            mode: Mode::Between,
            offset: 0,
            value_offset: 0,
            values: 0,
            saw_whitespace: false,
            saw_newline: false,
        }
    }

    /// Open containers around the current position.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Total bytes scanned so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of top-level values completed so far.
    pub fn values(&self) -> u64 {
        self.values
    }

    /// Whether the input so far ends on a value boundary.
    pub fn is_between_values(&self) -> bool {
        self.mode == Mode::Between
    }
}

/// Incremental decoder for a concatenation of JSON values.
///
/// Feed it chunks in order; every value whose last byte is in a chunk is
/// returned by that call. A value split across chunks is held in a partial
/// buffer until it completes. Output is independent of how the input is
/// split.
#[derive(Debug)]
pub struct Decoder {
    state: ParserState,
    partial: BytesMut,
    config: DecoderConfig,
    failed: bool,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            state: ParserState::new(),
            partial: BytesMut::new(),
            config,
            failed: false,
        }
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    /// Scan `chunk`, appending every value it completes to `out`.
    ///
    /// Values completed before an error in the same chunk are still
    /// appended. After an error the decoder is unusable.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<RawValue>) -> Result<(), JsonError> {
        if self.failed {
            return Err(JsonError::parse(self.state.offset, "decoder already failed"));
        }
        let result = self.scan(chunk, out);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Signal end of input.
    ///
    /// A trailing top-level number has no terminator and completes here.
    /// Ending anywhere inside a value fails with
    /// [`JsonError::UnexpectedEof`].
    pub fn finish(&mut self, out: &mut Vec<RawValue>) -> Result<(), JsonError> {
        if self.failed {
            return Err(JsonError::parse(self.state.offset, "decoder already failed"));
        }
        match self.state.mode {
            Mode::Between => Ok(()),
            Mode::Number(n) if n.is_complete() && self.state.stack.is_empty() => {
                self.state.mode = Mode::Between;
                self.emit(&[], out);
                Ok(())
            }
            _ => {
                self.failed = true;
                Err(JsonError::UnexpectedEof {
                    offset: self.state.offset,
                })
            }
        }
    }

    fn scan(&mut self, chunk: &[u8], out: &mut Vec<RawValue>) -> Result<(), JsonError> {
        let base = self.state.offset;
        // Where the current top-level value's bytes start in this chunk.
        let mut segment = 0;
        let mut i = 0;
        while i < chunk.len() {
            let b = chunk[i];
            let at = base + i as u64;

            if self.state.mode == Mode::Between {
                if is_whitespace(b) {
                    self.state.saw_whitespace = true;
                    self.state.saw_newline |= b == b'\n';
                    i += 1;
                    continue;
                }
                self.check_separator(at)?;
                segment = i;
                self.state.value_offset = at;
            }

            let step = self.step(b, at)?;
            if !matches!(step, Step::EmitBefore) {
                self.check_size(i + 1 - segment)?;
            }
            match step {
                Step::Next => i += 1,
                Step::Reprocess => {}
                Step::Emit => {
                    i += 1;
                    self.emit(&chunk[segment..i], out);
                }
                Step::EmitBefore => self.emit(&chunk[segment..i], out),
            }
        }
        if self.state.mode != Mode::Between {
            self.partial.extend_from_slice(&chunk[segment..]);
        }
        self.state.offset = base + chunk.len() as u64;
        Ok(())
    }

    fn step(&mut self, b: u8, at: u64) -> Result<Step, JsonError> {
        match self.state.mode {
            Mode::Between => self.begin_value(b, at),
            Mode::Value => {
                if is_whitespace(b) {
                    return Ok(Step::Next);
                }
                self.begin_value(b, at)
            }
            Mode::ArrayStart => match b {
                _ if is_whitespace(b) => Ok(Step::Next),
                b']' => self.close(b, at),
                _ => self.begin_value(b, at),
            },
            Mode::ObjectStart => match b {
                _ if is_whitespace(b) => Ok(Step::Next),
                b'"' => self.enter_key(),
                b'}' => self.close(b, at),
                _ => Err(unexpected(at, b, "expected object key or '}'")),
            },
            Mode::Key => match b {
                _ if is_whitespace(b) => Ok(Step::Next),
                b'"' => self.enter_key(),
                _ => Err(unexpected(at, b, "expected object key")),
            },
            Mode::Colon => match b {
                _ if is_whitespace(b) => Ok(Step::Next),
                b':' => {
                    self.state.mode = Mode::Value;
                    Ok(Step::Next)
                }
                _ => Err(unexpected(at, b, "expected ':' after object key")),
            },
            Mode::AfterValue => match b {
                _ if is_whitespace(b) => Ok(Step::Next),
                b',' => {
                    self.state.mode = match self.state.stack.last() {
                        Some(Container::Object) => Mode::Key,
                        _ => Mode::Value,
                    };
                    Ok(Step::Next)
                }
                b']' | b'}' => self.close(b, at),
                _ => Err(unexpected(at, b, "expected ',' or closing bracket")),
            },
            Mode::Str { key, escape } => self.string_byte(key, escape, b, at),
            Mode::Number(n) => match n.advance(b) {
                Some(next) => {
                    self.state.mode = Mode::Number(next);
                    Ok(Step::Next)
                }
                None if n.is_complete() => Ok(match self.complete_value() {
                    Step::Emit => Step::EmitBefore,
                    _ => Step::Reprocess,
                }),
                None => Err(unexpected(at, b, "incomplete number")),
            },
            Mode::Literal { word, matched } => {
                if word[matched] != b {
                    return Err(unexpected(at, b, "invalid literal"));
                }
                if matched + 1 == word.len() {
                    return Ok(self.complete_value());
                }
                self.state.mode = Mode::Literal {
                    word,
                    matched: matched + 1,
                };
                Ok(Step::Next)
            }
        }
    }

    fn begin_value(&mut self, b: u8, at: u64) -> Result<Step, JsonError> {
        self.state.mode = match b {
            b'{' => {
                self.push(Container::Object, at)?;
                Mode::ObjectStart
            }
            b'[' => {
                self.push(Container::Array, at)?;
                Mode::ArrayStart
            }
            b'"' => Mode::Str {
                key: false,
                escape: Escape::None,
            },
            b'-' => Mode::Number(Number::Minus),
            b'0' => Mode::Number(Number::Zero),
            b'1'..=b'9' => Mode::Number(Number::Int),
            b't' => Mode::Literal { word: b"true", matched: 1 },
            b'f' => Mode::Literal { word: b"false", matched: 1 },
            b'n' => Mode::Literal { word: b"null", matched: 1 },
            _ => return Err(unexpected(at, b, "expected a value")),
        };
        Ok(Step::Next)
    }

    fn enter_key(&mut self) -> Result<Step, JsonError> {
        self.state.mode = Mode::Str {
            key: true,
            escape: Escape::None,
        };
        Ok(Step::Next)
    }

    fn string_byte(&mut self, key: bool, escape: Escape, b: u8, at: u64) -> Result<Step, JsonError> {
        let escape = match escape {
            Escape::None => match b {
                b'"' if key => {
                    self.state.mode = Mode::Colon;
                    return Ok(Step::Next);
                }
                b'"' => return Ok(self.complete_value()),
                b'\\' => Escape::Backslash,
                0x00..=0x1f => return Err(unexpected(at, b, "control character in string")),
                _ => Escape::None,
            },
            Escape::Backslash => match b {
                b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => Escape::None,
                b'u' => Escape::Unicode(4),
                _ => return Err(unexpected(at, b, "invalid escape")),
            },
            Escape::Unicode(left) if b.is_ascii_hexdigit() => match left {
                1 => Escape::None,
                n => Escape::Unicode(n - 1),
            },
            Escape::Unicode(_) => return Err(unexpected(at, b, "invalid unicode escape")),
        };
        self.state.mode = Mode::Str { key, escape };
        Ok(Step::Next)
    }

    fn push(&mut self, container: Container, at: u64) -> Result<(), JsonError> {
        if self.state.stack.len() >= self.config.max_depth {
            return Err(JsonError::parse(
                at,
                format!("nesting deeper than {} levels", self.config.max_depth),
            ));
        }
        self.state.stack.push(container);
        Ok(())
    }

    fn close(&mut self, b: u8, at: u64) -> Result<Step, JsonError> {
        let expected = if b == b']' {
            Container::Array
        } else {
            Container::Object
        };
        match self.state.stack.pop() {
            Some(open) if open == expected => Ok(self.complete_value()),
            Some(_) => Err(unexpected(at, b, "mismatched closing bracket")),
            None => Err(unexpected(at, b, "unmatched closing bracket")),
        }
    }

    fn complete_value(&mut self) -> Step {
        if self.state.stack.is_empty() {
            self.state.mode = Mode::Between;
            Step::Emit
        } else {
            self.state.mode = Mode::AfterValue;
            Step::Next
        }
    }

    fn check_separator(&self, at: u64) -> Result<(), JsonError> {
        if self.state.values == 0 {
            return Ok(());
        }
        match self.config.separator {
            Separator::Optional => Ok(()),
            Separator::Whitespace if !self.state.saw_whitespace => {
                Err(JsonError::parse(at, "expected whitespace between values"))
            }
            Separator::Newline if !self.state.saw_newline => {
                Err(JsonError::parse(at, "expected newline between values"))
            }
            _ => Ok(()),
        }
    }

    fn check_size(&self, in_chunk: usize) -> Result<(), JsonError> {
        if self.partial.len() + in_chunk > self.config.max_value_size {
            return Err(JsonError::ValueTooLarge {
                offset: self.state.value_offset,
                limit: self.config.max_value_size,
            });
        }
        Ok(())
    }

    fn emit(&mut self, tail: &[u8], out: &mut Vec<RawValue>) {
        let bytes = if self.partial.is_empty() {
            Bytes::copy_from_slice(tail)
        } else {
            self.partial.extend_from_slice(tail);
            self.partial.split().freeze()
        };
        out.push(RawValue {
            offset: self.state.value_offset,
            bytes,
        });
        self.state.values += 1;
        self.state.saw_whitespace = false;
        self.state.saw_newline = false;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

/// Decode every value in a complete buffer.
pub fn decode_slice<T: DeserializeOwned>(input: &[u8], config: &DecoderConfig) -> Result<Vec<T>, JsonError> {
    let mut decoder = Decoder::new(config.clone());
    let mut raw = Vec::new();
    decoder.feed(input, &mut raw)?;
    decoder.finish(&mut raw)?;
    raw.iter().map(RawValue::deserialize).collect()
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn unexpected(at: u64, b: u8, context: &str) -> JsonError {
    let found = if b.is_ascii_graphic() {
        format!("'{}'", b as char)
    } else {
        format!("byte 0x{b:02x}")
    };
    JsonError::parse(at, format!("{context}, found {found}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&[u8]], config: DecoderConfig) -> Result<Vec<RawValue>, JsonError> {
        let mut decoder = Decoder::new(config);
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.feed(chunk, &mut out)?;
        }
        decoder.finish(&mut out)?;
        Ok(out)
    }

    fn texts(values: &[RawValue]) -> Vec<&str> {
        values
            .iter()
            .map(|v| std::str::from_utf8(&v.bytes).unwrap())
            .collect()
    }

    #[test]
    fn value_split_across_chunks() {
        let mut decoder = Decoder::default();
        let mut out = Vec::new();

        decoder.feed(br#"{"a":1}{"#, &mut out).unwrap();
        assert_eq!(texts(&out), vec![r#"{"a":1}"#]);

        decoder.feed(br#""b":2}"#, &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(texts(&out), vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert_eq!(out[1].offset, 7);
    }

    #[test]
    fn eof_inside_value() {
        let mut decoder = Decoder::default();
        let mut out = Vec::new();
        decoder.feed(br#"{"a":1"#, &mut out).unwrap();
        let err = decoder.finish(&mut out).unwrap_err();
        assert!(matches!(err, JsonError::UnexpectedEof { offset: 6 }));
        assert!(out.is_empty());
    }

    #[test]
    fn scalars_at_top_level() {
        let out = feed_all(&[br#"1 "two" true null -3.5e2 [] {}"#], DecoderConfig::default()).unwrap();
        assert_eq!(texts(&out), vec!["1", r#""two""#, "true", "null", "-3.5e2", "[]", "{}"]);
    }

    #[test]
    fn top_level_number_completes_at_terminator() {
        let mut decoder = Decoder::default();
        let mut out = Vec::new();
        decoder.feed(b"12", &mut out).unwrap();
        assert!(out.is_empty(), "a number may continue in the next chunk");
        decoder.feed(b"3[", &mut out).unwrap();
        assert_eq!(texts(&out), vec!["123"]);
        decoder.feed(b"]45", &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(texts(&out), vec!["123", "[]", "45"]);
    }

    #[test]
    fn strings_with_escapes_and_brackets() {
        let out = feed_all(
            &[br#"{"k":"a \"}\" \\ \u00e9 ]["}"#, br#"["\n"]"#],
            DecoderConfig::default(),
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        let first: serde_json::Value = out[0].deserialize().unwrap();
        assert_eq!(first["k"], "a \"}\" \\ \u{e9} ][");
    }

    #[test]
    fn structural_errors() {
        let cases = [
            ("[1,}", "expected a value"),
            ("[1}", "mismatched"),
            ("}", "expected a value"),
            (r#"{"a" 1}"#, "expected ':'"),
            (r#"{1:2}"#, "expected object key"),
            ("[1 2]", "expected ','"),
            ("tru ", "invalid literal"),
            (r#""\x""#, "invalid escape"),
            (r#""\u12G4""#, "invalid unicode escape"),
            ("\"a\u{1}\"", "control character"),
            ("[-]", "incomplete number"),
            ("[1.]", "incomplete number"),
        ];
        for (input, expected) in cases {
            let err = feed_all(&[input.as_bytes()], DecoderConfig::default()).unwrap_err();
            match err {
                JsonError::Parse { reason, .. } => assert!(
                    reason.contains(expected),
                    "{input:?}: {reason:?} should mention {expected:?}"
                ),
                other => panic!("{input:?}: unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn error_offset_is_absolute() {
        let mut decoder = Decoder::default();
        let mut out = Vec::new();
        decoder.feed(b"[1,2]  ", &mut out).unwrap();
        let err = decoder.feed(b"[3;]", &mut out).unwrap_err();
        assert!(matches!(err, JsonError::Parse { offset: 9, .. }));
        assert!(decoder.feed(b"[]", &mut out).is_err());
    }

    #[test]
    fn values_before_error_are_kept() {
        let mut decoder = Decoder::default();
        let mut out = Vec::new();
        assert!(decoder.feed(b"{}[]]", &mut out).is_err());
        assert_eq!(texts(&out), vec!["{}", "[]"]);
    }

    #[test]
    fn depth_limit() {
        let config = DecoderConfig {
            max_depth: 3,
            ..DecoderConfig::default()
        };
        assert!(feed_all(&[b"[[[1]]]"], config.clone()).is_ok());
        let err = feed_all(&[b"[[[[1]]]]"], config).unwrap_err();
        assert!(matches!(err, JsonError::Parse { offset: 3, .. }));
    }

    #[test]
    fn value_size_limit_spans_chunks() {
        let config = DecoderConfig {
            max_value_size: 8,
            ..DecoderConfig::default()
        };
        assert!(feed_all(&[b"[1,2,", b"3]"], config.clone()).is_ok());
        let err = feed_all(&[b"  [1,2,3,", b"4,5]"], config).unwrap_err();
        assert!(matches!(err, JsonError::ValueTooLarge { offset: 2, limit: 8 }));
    }

    #[test]
    fn whitespace_separator_policy() {
        let config = DecoderConfig {
            separator: Separator::Whitespace,
            ..DecoderConfig::default()
        };
        assert_eq!(feed_all(&[b"1 2\t{}"], config.clone()).unwrap().len(), 3);
        let err = feed_all(&[b"{} {}{}"], config).unwrap_err();
        assert!(matches!(err, JsonError::Parse { offset: 5, .. }));
    }

    #[test]
    fn newline_separator_policy() {
        let config = DecoderConfig {
            separator: Separator::Newline,
            ..DecoderConfig::default()
        };
        assert_eq!(
            feed_all(&[b"{\"n\":1}\r\n{\"n\":2}\n", b"{\"n\":3}"], config.clone())
                .unwrap()
                .len(),
            3
        );
        assert!(feed_all(&[b"{} {}"], config).is_err());
    }

    #[test]
    fn serde_failure_reports_value_offset() {
        #[derive(Debug, serde::Deserialize)]
        struct Tick {
            #[allow(dead_code)]
            n: u32,
        }
        let err = decode_slice::<Tick>(br#"{"n":1} {"n":"x"}"#, &DecoderConfig::default()).unwrap_err();
        assert!(matches!(err, JsonError::Parse { offset: 8, .. }));
    }

    #[test]
    fn state_reports_progress() {
        let mut decoder = Decoder::default();
        let mut out = Vec::new();
        decoder.feed(br#"{"a":[1,"#, &mut out).unwrap();
        assert_eq!(decoder.state().depth(), 2);
        assert!(!decoder.state().is_between_values());
        decoder.feed(b"2]} ", &mut out).unwrap();
        assert_eq!(decoder.state().depth(), 0);
        assert_eq!(decoder.state().values(), 1);
        assert_eq!(decoder.state().offset(), 12);
    }

    #[test]
    fn split_invariance_over_every_two_way_split() {
        let input: &[u8] =
            br#"{"id":1,"tags":["a","b\"c"],"n":-0.5e+3} 42 "sA" [true,false,null]{"x":{}}7"#;
        let whole = feed_all(&[input], DecoderConfig::default()).unwrap();
        assert_eq!(whole.len(), 6);

        for split in 0..=input.len() {
            let (a, b) = input.split_at(split);
            let parts = feed_all(&[a, b], DecoderConfig::default()).unwrap();
            assert_eq!(parts, whole, "split at {split}");
        }
        let bytewise: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(feed_all(&bytewise, DecoderConfig::default()).unwrap(), whole);
    }
}
