//! Boundary-aware splitting of one giant JSON array into its elements.
//!
//! The splitter consumes decompressed byte chunks and emits each top-level
//! array member as raw text, in document order, without the enclosing
//! `[`/`]`/`,`. The scan is byte-by-byte and its state lives in one small
//! [`ScanState`] value, so where the upstream chunks happen to split can
//! never move an element boundary.

use std::mem;

use log::debug;

use crate::{core::stage::ChunkRead, error::PipelineError};

/// Default size of the decompressed chunk buffer.
pub const DEFAULT_CHUNK_CAPACITY: usize = 64 * 1024;

/// The only state that survives a chunk boundary: bracket/brace nesting
/// depth relative to the inside of the outer array, whether the scanner is
/// inside a string literal, whether a backslash escape is pending, and the
/// partially accumulated element. Bounded by the largest single record,
/// never by the dataset.
#[derive(Debug, Default)]
struct ScanState {
    depth: u32,
    in_string: bool,
    escape_pending: bool,
    element: Vec<u8>,
}

/// Pull-based splitter: each [`read`](ElementSplitter::read) consumes just
/// enough upstream input to produce the next element, so total resident
/// memory stays at one in-flight element plus one chunk buffer.
pub struct ElementSplitter<C> {
    chunks: C,
    buf: Vec<u8>,
    filled: usize,
    pos: usize,
    state: ScanState,
    /// Decompressed bytes consumed so far.
    offset: u64,
    /// Complete elements emitted so far.
    index: usize,
    /// The outer `[` has been consumed.
    opened: bool,
    /// The outer `]` has been consumed.
    closed: bool,
}

impl<C: ChunkRead> ElementSplitter<C> {
    pub fn new(chunks: C) -> Self {
        Self::with_capacity(chunks, DEFAULT_CHUNK_CAPACITY)
    }

    pub fn with_capacity(chunks: C, capacity: usize) -> Self {
        Self {
            chunks,
            buf: vec![0; capacity.max(1)],
            filled: 0,
            pos: 0,
            state: ScanState::default(),
            offset: 0,
            index: 0,
            opened: false,
            closed: false,
        }
    }

    /// Decompressed byte offset of the scan head.
    pub fn bytes_consumed(&self) -> u64 {
        self.offset
    }

    /// Number of complete elements emitted so far.
    pub fn elements_emitted(&self) -> usize {
        self.index
    }

    /// Pulls the next element. `Ok(None)` after the closing `]` and any
    /// trailing whitespace have been consumed.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        loop {
            if self.pos == self.filled {
                let n = self.chunks.read_chunk(&mut self.buf)?;
                if n == 0 {
                    return self.finish_at_eof();
                }
                self.filled = n;
                self.pos = 0;
            }

            while self.pos < self.filled {
                let byte = self.buf[self.pos];
                self.pos += 1;
                self.offset += 1;
                if let Some(element) = self.scan_byte(byte)? {
                    return Ok(Some(element));
                }
            }
        }
    }

    fn scan_byte(&mut self, byte: u8) -> Result<Option<Vec<u8>>, PipelineError> {
        if !self.opened {
            if byte.is_ascii_whitespace() {
                return Ok(None);
            }
            if byte == b'[' {
                self.opened = true;
                return Ok(None);
            }
            return Err(self.malformed(format!(
                "document does not open with '[', found '{}'",
                byte.escape_ascii()
            )));
        }

        if self.closed {
            if byte.is_ascii_whitespace() {
                return Ok(None);
            }
            return Err(self.malformed("trailing data after the closing ']'"));
        }

        if self.state.in_string {
            if self.state.escape_pending {
                // standard JSON escapes only; anything else would make the
                // string-state tracker guess, so refuse instead of mis-splitting
                if !matches!(byte, b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' | b'u') {
                    return Err(self.malformed(format!(
                        "unsupported escape sequence '\\{}' in string",
                        byte.escape_ascii()
                    )));
                }
                self.state.escape_pending = false;
                self.state.element.push(byte);
                return Ok(None);
            }
            match byte {
                b'\\' => self.state.escape_pending = true,
                b'"' => self.state.in_string = false,
                _ => {}
            }
            self.state.element.push(byte);
            return Ok(None);
        }

        match byte {
            b'"' => {
                self.state.in_string = true;
                self.state.element.push(byte);
                Ok(None)
            }
            b'{' | b'[' => {
                self.state.depth += 1;
                self.state.element.push(byte);
                Ok(None)
            }
            b'}' => {
                if self.state.depth == 0 {
                    return Err(self.malformed("nesting depth went negative: unmatched '}'"));
                }
                self.state.depth -= 1;
                self.state.element.push(byte);
                Ok(None)
            }
            b']' => {
                if self.state.depth == 0 {
                    self.closed = true;
                    debug!(
                        "end of array after {} elements, {} bytes",
                        self.index, self.offset
                    );
                    return self.take_element(true);
                }
                self.state.depth -= 1;
                self.state.element.push(byte);
                Ok(None)
            }
            b',' if self.state.depth == 0 => self.take_element(false),
            // structural newlines are dropped so each element is one line;
            // JSON strings cannot contain a raw newline, so nothing is lost
            b'\n' | b'\r' => Ok(None),
            _ => {
                self.state.element.push(byte);
                Ok(None)
            }
        }
    }

    /// Finalizes the accumulated bytes as one element. At a `,` an empty
    /// accumulation is malformed; at the closing `]` it is only legal for
    /// the empty array (an empty slot after a comma is a trailing comma).
    fn take_element(&mut self, at_close: bool) -> Result<Option<Vec<u8>>, PipelineError> {
        let element = trim_ascii(mem::take(&mut self.state.element));
        if element.is_empty() {
            if at_close && self.index == 0 {
                return Ok(None);
            }
            let what = if at_close { "trailing comma before ']'" } else { "empty element before ','" };
            return Err(self.malformed(what));
        }
        self.index += 1;
        Ok(Some(element))
    }

    fn finish_at_eof(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        if self.closed {
            return Ok(None);
        }
        // any bytes buffered for an incomplete final element are discarded,
        // never emitted as a partial record
        self.state.element.clear();
        if !self.opened {
            return Err(self.malformed("empty input, expected a JSON array"));
        }
        Err(self.malformed("unexpected end of input inside the array (truncated dump)"))
    }

    fn malformed(&self, detail: impl Into<String>) -> PipelineError {
        PipelineError::MalformedArray {
            offset: self.offset,
            index: self.index,
            detail: detail.into(),
        }
    }
}

impl<C: ChunkRead> Iterator for ElementSplitter<C> {
    type Item = Result<Vec<u8>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

fn trim_ascii(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last().is_some_and(|b| b.is_ascii_whitespace()) {
        bytes.pop();
    }
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    if start > 0 {
        bytes.drain(..start);
    }
    bytes
}

/// Builder with the splitter's single knob, the chunk buffer capacity.
#[derive(Default)]
pub struct ElementSplitterBuilder {
    capacity: Option<usize>,
}

impl ElementSplitterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn from_chunk_reader<C: ChunkRead>(self, chunks: C) -> ElementSplitter<C> {
        ElementSplitter::with_capacity(chunks, self.capacity.unwrap_or(DEFAULT_CHUNK_CAPACITY))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{ElementSplitter, ElementSplitterBuilder};
    use crate::{core::stage::IoChunkReader, error::PipelineError};

    fn splitter(input: &str, capacity: usize) -> ElementSplitter<IoChunkReader<Cursor<Vec<u8>>>> {
        ElementSplitterBuilder::new()
            .capacity(capacity)
            .from_chunk_reader(IoChunkReader::new(Cursor::new(input.as_bytes().to_vec())))
    }

    fn split_all(input: &str, capacity: usize) -> Result<Vec<String>, PipelineError> {
        let mut out = Vec::new();
        let mut s = splitter(input, capacity);
        while let Some(element) = s.read()? {
            out.push(String::from_utf8(element).expect("elements are valid utf8"));
        }
        Ok(out)
    }

    #[test]
    fn splits_a_flat_array_of_objects() -> anyhow::Result<()> {
        let elements = split_all(r#"[{"id":"Q1"},{"id":"Q2"},{"id":"Q3"}]"#, 64)?;
        assert_eq!(elements, vec![r#"{"id":"Q1"}"#, r#"{"id":"Q2"}"#, r#"{"id":"Q3"}"#]);
        Ok(())
    }

    #[test]
    fn preserves_document_order_and_counts() -> anyhow::Result<()> {
        let input = r#"[1, 2, 3, "four", null, true, [5, 6], {"seven": 8}]"#;
        let elements = split_all(input, 64)?;
        assert_eq!(elements.len(), 8);
        assert_eq!(elements[0], "1");
        assert_eq!(elements[3], r#""four""#);
        assert_eq!(elements[6], "[5, 6]");
        assert_eq!(elements[7], r#"{"seven": 8}"#);
        Ok(())
    }

    #[test]
    fn dump_style_input_with_newlines_yields_single_line_elements() -> anyhow::Result<()> {
        let input = "[\n{\"id\":\"Q1\",\n \"labels\":{}},\n{\"id\":\"Q2\"}\n]\n";
        let elements = split_all(input, 8)?;
        assert_eq!(elements, vec!["{\"id\":\"Q1\", \"labels\":{}}", "{\"id\":\"Q2\"}"]);
        assert!(elements.iter().all(|e| !e.contains('\n')));
        Ok(())
    }

    #[test]
    fn nested_structures_do_not_end_elements_early() -> anyhow::Result<()> {
        let input = r#"[{"claims":{"P31":[{"mainsnak":{"datavalue":[1,[2,{"x":[]}]]}}]}},{"a":[[],{}]}]"#;
        let elements = split_all(input, 16)?;
        assert_eq!(elements.len(), 2);
        for element in &elements {
            // round-trip property: every element re-parses standalone
            serde_json::from_str::<serde_json::Value>(element)?;
        }
        Ok(())
    }

    #[test]
    fn string_state_honors_escaped_quotes_and_backslashes() -> anyhow::Result<()> {
        // "a\"b" keeps a quote inside the string, "c\\" ends the string
        // with an escaped backslash right before the quote
        let input = r#"[{"label":"a\"b,}]"},{"path":"c\\"},"{not,json]"]"#;
        let elements = split_all(input, 8)?;
        assert_eq!(
            elements,
            vec![r#"{"label":"a\"b,}]"}"#, r#"{"path":"c\\"}"#, r#""{not,json]""#]
        );
        for element in &elements {
            serde_json::from_str::<serde_json::Value>(element)?;
        }
        Ok(())
    }

    #[test]
    fn splitting_is_chunk_boundary_independent() -> anyhow::Result<()> {
        let input = r#"[{"id":"Q1","labels":{"en":{"value":"uni\"verse"}}},{"id":"Q2","n":[1,2,3]},"tail"]"#;
        let reference = split_all(input, 64 * 1024)?;
        for capacity in [1, 2, 3, 5, 7, 11, 13, 64] {
            assert_eq!(split_all(input, capacity)?, reference, "capacity {capacity}");
        }
        Ok(())
    }

    #[test]
    fn concatenating_elements_rebuilds_an_equivalent_array() -> anyhow::Result<()> {
        let input = r#"[ {"a": 1} , [2, 3],  "x" , null ]"#;
        let elements = split_all(input, 4)?;
        let rebuilt = format!("[{}]", elements.join(","));
        let original: serde_json::Value = serde_json::from_str(input)?;
        let round_tripped: serde_json::Value = serde_json::from_str(&rebuilt)?;
        assert_eq!(original, round_tripped);
        Ok(())
    }

    #[test]
    fn empty_array_yields_no_elements() -> anyhow::Result<()> {
        assert_eq!(split_all("[]", 4)?, Vec::<String>::new());
        assert_eq!(split_all("[ \n ]\n", 4)?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn truncation_yields_the_complete_prefix_then_fails() {
        let input = r#"[{"id":"Q1"},{"id":"Q2"},{"id":"Q3"#; // cut mid-element
        let mut s = splitter(input, 8);

        let mut complete = Vec::new();
        let err = loop {
            match s.read() {
                Ok(Some(element)) => complete.push(String::from_utf8(element).unwrap()),
                Ok(None) => panic!("truncated input must not end cleanly"),
                Err(err) => break err,
            }
        };

        // the correct prefix of complete elements, zero partial records
        assert_eq!(complete, vec![r#"{"id":"Q1"}"#, r#"{"id":"Q2"}"#]);
        match err {
            PipelineError::MalformedArray { index, .. } => assert_eq!(index, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn document_not_opening_with_bracket_is_malformed() {
        let err = split_all(r#"{"id":"Q1"}"#, 8).expect_err("object is not an array");
        assert!(matches!(err, PipelineError::MalformedArray { .. }));

        let err = split_all("", 8).expect_err("empty input");
        assert!(matches!(err, PipelineError::MalformedArray { .. }));
    }

    #[test]
    fn negative_depth_is_malformed() {
        let err = split_all("[}]", 8).expect_err("unmatched brace");
        match err {
            PipelineError::MalformedArray { detail, .. } => {
                assert!(detail.contains("negative"), "{detail}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn trailing_comma_and_empty_slots_are_malformed() {
        assert!(split_all(r#"[{"a":1},]"#, 8).is_err());
        assert!(split_all("[,1]", 8).is_err());
    }

    #[test]
    fn trailing_garbage_after_close_is_malformed() {
        let err = split_all("[1] oops", 8).expect_err("trailing data");
        assert!(matches!(err, PipelineError::MalformedArray { .. }));
        // trailing whitespace is fine
        assert_eq!(split_all("[1] \n", 8).unwrap(), vec!["1"]);
    }

    #[test]
    fn unclassifiable_escape_fails_loudly() {
        let err = split_all(r#"["a\q"]"#, 8).expect_err("bad escape");
        match err {
            PipelineError::MalformedArray { detail, .. } => {
                assert!(detail.contains("escape"), "{detail}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn elements_larger_than_the_chunk_buffer_accumulate_across_chunks() -> anyhow::Result<()> {
        let big = "x".repeat(10_000);
        let input = format!(r#"[{{"id":"Q1","text":"{big}"}},{{"id":"Q2"}}]"#);
        let elements = split_all(&input, 64)?;
        assert_eq!(elements.len(), 2);
        assert!(elements[0].len() > 10_000);
        serde_json::from_str::<serde_json::Value>(&elements[0])?;
        Ok(())
    }

    #[test]
    fn offsets_and_counts_are_tracked() -> anyhow::Result<()> {
        let input = r#"[{"a":1},{"b":2}]"#;
        let mut s = splitter(input, 8);
        while s.read()?.is_some() {}
        assert_eq!(s.elements_emitted(), 2);
        assert_eq!(s.bytes_consumed(), input.len() as u64);
        Ok(())
    }
}
