//! TaskPaper outline library.
//! Parsing is a single forward pass over the text: segment lines, measure tab depth,
//! pull inline tags, classify each line, and attach it to the tree by indentation.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::ops::Index;

    /* ------------------------------- IDs ------------------------------- */

    /// Arena index of an item inside the `Document` that produced it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub(crate) usize);

    impl ItemId {
        pub fn index(self) -> usize {
            self.0
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Byte span into the document source, `start..end`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn new(start: usize, end: usize) -> Self {
            debug_assert!(start <= end, "inverted range {start}..{end}");
            Self { start, end }
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }

        /// True when `other` lies entirely inside `self`.
        pub fn contains(&self, other: &SourceRange) -> bool {
            self.start <= other.start && other.end <= self.end
        }

        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            &source[self.start..self.end]
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ItemKind {
        /// Header line ending with `:`.
        Project,
        /// Line opening with `-`, `+` or `*` and one whitespace character.
        Task,
        /// Anything else, blank lines included.
        Note,
    }

    impl ItemKind {
        pub fn label(self) -> &'static str {
            match self {
                ItemKind::Project => "project",
                ItemKind::Task => "task",
                ItemKind::Note => "note",
            }
        }
    }

    impl fmt::Display for ItemKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    /// Inline tag `@name` or `@name(value)`.
    ///
    /// `source_range` covers the whole match, including the whitespace run in
    /// front of the `@` and the closing parenthesis.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Attribute {
        pub name: String,
        /// `None` for a bare tag and for an empty `()`.
        pub value: Option<String>,
        pub source_range: SourceRange,
    }

    impl Attribute {
        pub fn new(name: impl Into<String>, value: Option<&str>, source_range: SourceRange) -> Self {
            Self {
                name: name.into(),
                value: value.filter(|v| !v.is_empty()).map(str::to_string),
                source_range,
            }
        }

        /// Tag names compare ASCII case-insensitively.
        pub fn is_named(&self, name: &str) -> bool {
            self.name.eq_ignore_ascii_case(name)
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One outline line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Item {
        pub(crate) id: ItemId,
        pub(crate) kind: ItemKind,
        /// Leading tab count on the line.
        pub(crate) depth: usize,
        /// Zero-based line number in the (possibly normalized) source.
        pub(crate) line: usize,
        pub(crate) source_range: SourceRange,
        pub(crate) content_range: SourceRange,
        pub(crate) attributes: Vec<Attribute>,
        pub(crate) children: Vec<ItemId>,
        pub(crate) parent: Option<ItemId>,
    }

    impl Item {
        pub fn id(&self) -> ItemId {
            self.id
        }

        pub fn kind(&self) -> ItemKind {
            self.kind
        }

        pub fn depth(&self) -> usize {
            self.depth
        }

        pub fn line(&self) -> usize {
            self.line
        }

        /// Span of the whole line, indentation included, terminator excluded.
        pub fn source_range(&self) -> SourceRange {
            self.source_range
        }

        /// Span of the display text: no indentation, bullet, project colon or trailing tags.
        pub fn content_range(&self) -> SourceRange {
            self.content_range
        }

        pub fn attributes(&self) -> &[Attribute] {
            &self.attributes
        }

        pub fn children(&self) -> &[ItemId] {
            &self.children
        }

        pub fn parent(&self) -> Option<ItemId> {
            self.parent
        }

        /// First tag with the given name.
        pub fn attribute(&self, name: &str) -> Option<&Attribute> {
            self.attributes.iter().find(|a| a.is_named(name))
        }

        pub fn has_tag(&self, name: &str) -> bool {
            self.attribute(name).is_some()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: the parsed outline plus the text its ranges point into.
    ///
    /// Items live in an arena in document order; containers refer to children by `ItemId`.
    /// Nothing mutates a document after parsing, so it can be shared freely across threads.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Document {
        source: String,
        items: Vec<Item>,
        roots: Vec<ItemId>,
    }

    impl Document {
        pub(crate) fn from_parts(source: String, items: Vec<Item>, roots: Vec<ItemId>) -> Self {
            Self {
                source,
                items,
                roots,
            }
        }

        /// Parse with default options.
        pub fn parse(input: &str) -> Self {
            crate::parser::parse_taskpaper(input, &crate::parser::ParseOptions::default())
        }

        /// Text the ranges refer to. Differs from the input when line endings were normalized.
        pub fn source(&self) -> &str {
            &self.source
        }

        /// Total item count, descendants included.
        pub fn len(&self) -> usize {
            self.items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.items.is_empty()
        }

        pub fn root_ids(&self) -> &[ItemId] {
            &self.roots
        }

        /// Top-level items.
        pub fn items(&self) -> impl Iterator<Item = &Item> + '_ {
            self.roots.iter().map(|id| &self.items[id.0])
        }

        /// Every item in document (line) order.
        pub fn iter(&self) -> impl Iterator<Item = &Item> + '_ {
            self.items.iter()
        }

        pub fn get(&self, id: ItemId) -> Option<&Item> {
            self.items.get(id.0)
        }

        pub fn children(&self, id: ItemId) -> impl Iterator<Item = &Item> + '_ {
            self.items[id.0]
                .children
                .iter()
                .map(|child| &self.items[child.0])
        }

        pub fn parent(&self, id: ItemId) -> Option<&Item> {
            self.items[id.0].parent.map(|p| &self.items[p.0])
        }

        pub fn content(&self, id: ItemId) -> &str {
            self.items[id.0].content_range.slice(&self.source)
        }

        pub fn source_line(&self, id: ItemId) -> &str {
            self.items[id.0].source_range.slice(&self.source)
        }

        /// Depth-first pre-order walk yielding each item with its tree level (roots are 0).
        pub fn walk(&self) -> Walk<'_> {
            Walk {
                doc: self,
                stack: self.roots.iter().rev().map(|id| (*id, 0)).collect(),
            }
        }
    }

    impl Index<ItemId> for Document {
        type Output = Item;

        fn index(&self, id: ItemId) -> &Item {
            &self.items[id.0]
        }
    }

    pub struct Walk<'a> {
        doc: &'a Document,
        stack: Vec<(ItemId, usize)>,
    }

    impl<'a> Iterator for Walk<'a> {
        type Item = (&'a Item, usize);

        fn next(&mut self) -> Option<Self::Item> {
            let (id, level) = self.stack.pop()?;
            let item = &self.doc.items[id.0];
            self.stack
                .extend(item.children.iter().rev().map(|child| (*child, level + 1)));
            Some((item, level))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_values_normalize_to_none() {
            let range = SourceRange::new(0, 4);
            assert_eq!(Attribute::new("x", Some(""), range).value, None);
            assert_eq!(
                Attribute::new("x", Some("1"), range).value.as_deref(),
                Some("1")
            );
        }

        #[test]
        fn tag_names_ignore_ascii_case() {
            let attr = Attribute::new("Done", None, SourceRange::new(0, 5));
            assert!(attr.is_named("done"));
            assert!(attr.is_named("DONE"));
            assert!(!attr.is_named("don"));
        }

        #[test]
        fn range_containment() {
            let outer = SourceRange::new(2, 10);
            assert!(outer.contains(&SourceRange::new(2, 10)));
            assert!(outer.contains(&SourceRange::new(4, 4)));
            assert!(!outer.contains(&SourceRange::new(1, 5)));
            assert_eq!(outer.len(), 8);
            assert_eq!(outer.slice("0123456789AB"), "23456789");
        }
    }
}

pub mod lines {
    //! Line segmentation and indentation.
    //!
    //! Terminators are `\n`, `\r\n` and `\r`. A line's range never includes its
    //! terminator, so everything downstream works on terminator-free spans.
    //! A trailing terminator does not open an extra empty line.

    use crate::core::SourceRange;
    use serde::{Deserialize, Serialize};
    use std::borrow::Cow;
    use std::iter::FusedIterator;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum LineEnding {
        Lf,
        CrLf,
        Cr,
    }

    impl LineEnding {
        pub fn byte_len(self) -> usize {
            match self {
                LineEnding::CrLf => 2,
                LineEnding::Lf | LineEnding::Cr => 1,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Line<'a> {
        /// Zero-based line number.
        pub index: usize,
        pub range: SourceRange,
        /// `None` only for a final line that runs to end of input.
        pub ending: Option<LineEnding>,
        pub text: &'a str,
    }

    pub fn lines(source: &str) -> Lines<'_> {
        Lines {
            source,
            pos: 0,
            index: 0,
        }
    }

    pub struct Lines<'a> {
        source: &'a str,
        pos: usize,
        index: usize,
    }

    impl<'a> Iterator for Lines<'a> {
        type Item = Line<'a>;

        fn next(&mut self) -> Option<Line<'a>> {
            if self.pos >= self.source.len() {
                return None;
            }
            let rest = &self.source.as_bytes()[self.pos..];
            let (len, ending) = match rest.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(n) if rest[n] == b'\r' && rest.get(n + 1) == Some(&b'\n') => {
                    (n, Some(LineEnding::CrLf))
                }
                Some(n) if rest[n] == b'\r' => (n, Some(LineEnding::Cr)),
                Some(n) => (n, Some(LineEnding::Lf)),
                None => (rest.len(), None),
            };

            let range = SourceRange::new(self.pos, self.pos + len);
            let line = Line {
                index: self.index,
                range,
                ending,
                text: range.slice(self.source),
            };
            self.pos = range.end + ending.map_or(0, LineEnding::byte_len);
            self.index += 1;
            Some(line)
        }
    }

    impl FusedIterator for Lines<'_> {}

    /// Rewrite `\r\n` and lone `\r` to `\n`. Borrows when there is nothing to rewrite.
    pub fn normalize_line_endings(input: &str) -> Cow<'_, str> {
        if !input.contains('\r') {
            return Cow::Borrowed(input);
        }
        Cow::Owned(input.replace("\r\n", "\n").replace('\r', "\n"))
    }

    /// Leading tab count. Spaces are not indentation.
    pub fn indent_depth(line: &str) -> usize {
        line.bytes().take_while(|b| *b == b'\t').count()
    }

}

pub mod tags {
    //! Inline tag scanning and the trailing-tag trim.
    //!
    //! A tag is: line start or a whitespace run (part of the match), `@`, one or more
    //! ASCII letters/digits, an optional `(value)` without nested parentheses, and
    //! then end of line or whitespace (not part of the match).

    use crate::core::{Attribute, SourceRange};
    use nom::{
        IResult,
        bytes::complete::{take_while, take_while1},
        character::complete::char,
        combinator::opt,
        error::VerboseError,
        sequence::{delimited, pair},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// All tags on `line`, left to right. `offset` is the line's start in the document.
    pub fn extract_tags(line: &str, offset: usize) -> Vec<Attribute> {
        let mut out = Vec::new();
        let mut cursor = 0;

        while let Some(found) = line[cursor..].find('@') {
            let at = cursor + found;
            let Some(start) = boundary_start(line, cursor, at) else {
                cursor = at + 1;
                continue;
            };

            match tag_body(&line[at + 1..]) {
                Ok((rest, (name, value))) if at_boundary(rest) => {
                    let end = line.len() - rest.len();
                    out.push(Attribute::new(
                        name,
                        value,
                        SourceRange::new(offset + start, offset + end),
                    ));
                    cursor = end;
                }
                _ => cursor = at + 1,
            }
        }

        out
    }

    /// The contiguous run of tags that ends exactly at `body.end`, clamped to `body`.
    ///
    /// Tags chain only when one ends where the next begins; the first gap stops the walk.
    pub fn trailing_tag_range(tags: &[Attribute], body: SourceRange) -> Option<SourceRange> {
        let last = tags.last()?;
        if last.source_range.end != body.end {
            return None;
        }

        let mut trail = last.source_range;
        for attr in tags.iter().rev().skip(1) {
            if attr.source_range.end != trail.start {
                break;
            }
            trail.start = attr.source_range.start;
        }

        // A tag right after the indentation claims the tabs as its leading whitespace.
        trail.start = trail.start.max(body.start);
        Some(trail)
    }

    /// Where a tag whose `@` sits at `at` would start, if the `@` is on a boundary.
    fn boundary_start(line: &str, floor: usize, at: usize) -> Option<usize> {
        if at == 0 {
            return Some(0);
        }
        let before = &line[..at];
        if !before.ends_with(char::is_whitespace) {
            return None;
        }
        let run_start = before.trim_end_matches(char::is_whitespace).len();
        Some(run_start.max(floor))
    }

    fn at_boundary(rest: &str) -> bool {
        rest.is_empty() || rest.starts_with(char::is_whitespace)
    }

    fn tag_body(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        pair(tag_name, opt(tag_value))(i)
    }

    fn tag_name(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_ascii_alphanumeric())(i)
    }

    fn tag_value(i: &str) -> PResult<'_, &str> {
        delimited(
            char('('),
            take_while(|c: char| c != '(' && c != ')'),
            char(')'),
        )(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn names(line: &str) -> Vec<(String, Option<String>)> {
            extract_tags(line, 0)
                .into_iter()
                .map(|a| (a.name, a.value))
                .collect()
        }

        fn tag(name: &str, value: Option<&str>) -> (String, Option<String>) {
            (name.to_string(), value.map(str::to_string))
        }

        #[test]
        fn bare_and_valued_tags() {
            assert_eq!(
                names("- buy milk @done @priority(high)"),
                vec![tag("done", None), tag("priority", Some("high"))]
            );
        }

        #[test]
        fn spans_include_leading_whitespace_run() {
            let tags = extract_tags("x  @a(1) @b", 10);
            assert_eq!(tags[0].source_range, SourceRange::new(11, 18));
            assert_eq!(tags[1].source_range, SourceRange::new(18, 21));
        }

        #[test]
        fn tag_at_line_start_and_after_tabs() {
            let tags = extract_tags("@today", 0);
            assert_eq!(tags[0].source_range, SourceRange::new(0, 6));
            let tags = extract_tags("\t\t@a", 0);
            assert_eq!(tags[0].source_range, SourceRange::new(0, 4));
        }

        #[test]
        fn rejects_tags_without_boundaries() {
            assert!(names("mail me@example.com").is_empty());
            assert!(names("@a@b").is_empty());
            assert!(names("@due(soon)x").is_empty());
            assert!(names("@due(unclosed").is_empty());
            assert!(names("@ alone").is_empty());
            assert!(names("@under_score").is_empty());
        }

        #[test]
        fn values_are_opaque_text() {
            assert_eq!(
                names("@due(next week) @who(@bob)"),
                vec![tag("due", Some("next week")), tag("who", Some("@bob"))]
            );
            assert_eq!(names("@x()"), vec![tag("x", None)]);
        }

        #[test]
        fn scanning_resumes_after_a_failed_candidate() {
            assert_eq!(names("x @(oops) @ok"), vec![tag("ok", None)]);
            assert_eq!(names("@1(  @b"), vec![tag("b", None)]);
        }

        #[test]
        fn names_keep_their_case() {
            assert_eq!(names("@Flag"), vec![tag("Flag", None)]);
        }

        #[test]
        fn trailing_chain_collects_adjacent_tags() {
            let line = "- buy milk @done @priority(high)";
            let tags = extract_tags(line, 0);
            let body = SourceRange::new(0, line.len());
            assert_eq!(
                trailing_tag_range(&tags, body),
                Some(SourceRange::new(10, line.len()))
            );
        }

        #[test]
        fn trailing_chain_stops_at_gap() {
            let line = "x @a y @b";
            let tags = extract_tags(line, 0);
            let body = SourceRange::new(0, line.len());
            assert_eq!(
                trailing_tag_range(&tags, body),
                Some(SourceRange::new(6, line.len()))
            );
        }

        #[test]
        fn no_trim_when_last_tag_is_not_at_end() {
            let line = "call @bob about taxes";
            let tags = extract_tags(line, 0);
            assert_eq!(tags.len(), 1);
            assert_eq!(
                trailing_tag_range(&tags, SourceRange::new(0, line.len())),
                None
            );
            assert_eq!(trailing_tag_range(&[], SourceRange::new(0, 0)), None);
        }

        #[test]
        fn trim_is_clamped_to_body() {
            let line = "\t@a";
            let tags = extract_tags(line, 0);
            assert_eq!(
                trailing_tag_range(&tags, SourceRange::new(1, 3)),
                Some(SourceRange::new(1, 3))
            );
        }
    }
}

pub mod parser {
    //! Single-pass outline parser.
    //!
    //! Per line: measure the tab depth, extract tags from the full line, trim the
    //! trailing tag chain off the body, classify the body, then attach the item along
    //! the right spine of the tree built so far. Parsing never fails; every line
    //! becomes exactly one item.

    use crate::core::*;
    use crate::lines::{self, Line};
    use crate::tags;
    use log::{debug, trace};
    use serde::{Deserialize, Serialize};
    use std::borrow::Cow;

    /* ------------------------------- Options ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ParseOptions {
        /// Rewrite `\r\n` and `\r` to `\n` before parsing. Ranges then index the rewritten text.
        pub normalize_line_endings: bool,
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Parse TaskPaper text into a document.
    pub fn parse_taskpaper(input: &str, options: &ParseOptions) -> Document {
        let source = if options.normalize_line_endings {
            lines::normalize_line_endings(input)
        } else {
            Cow::Borrowed(input)
        };

        let mut builder = OutlineBuilder::default();
        for line in lines::lines(&source) {
            let parsed = parse_line(&line);
            trace!(
                "event=parse_line module=parser line={} depth={} kind={} tags={}",
                line.index,
                parsed.depth,
                parsed.kind,
                parsed.attributes.len()
            );
            builder.attach(parsed);
        }

        debug!(
            "event=parse module=parser status=ok bytes={} items={} roots={} normalized={}",
            source.len(),
            builder.items.len(),
            builder.roots.len(),
            options.normalize_line_endings
        );
        builder.finish(source.into_owned())
    }

    /* ----------------------------- Per line ----------------------------- */

    #[derive(Debug)]
    struct ParsedLine {
        kind: ItemKind,
        depth: usize,
        line: usize,
        source_range: SourceRange,
        content_range: SourceRange,
        attributes: Vec<Attribute>,
    }

    fn parse_line(line: &Line<'_>) -> ParsedLine {
        let depth = lines::indent_depth(line.text);
        let mut body = SourceRange::new(line.range.start + depth, line.range.end);

        let attributes = tags::extract_tags(line.text, line.range.start);
        if let Some(trail) = tags::trailing_tag_range(&attributes, body) {
            body.end = trail.start;
        }

        let body_text = &line.text[body.start - line.range.start..body.end - line.range.start];
        let (kind, content_range) = classify(body_text, body);

        debug_assert!(
            line.range.contains(&content_range),
            "content {content_range:?} escapes line {:?}",
            line.range
        );

        ParsedLine {
            kind,
            depth,
            line: line.index,
            source_range: line.range,
            content_range,
            attributes,
        }
    }

    /// Kind and content span of a body (indentation, terminator and trailing tags already gone).
    ///
    /// Task wins over project; a body that is neither is a note.
    fn classify(body_text: &str, body: SourceRange) -> (ItemKind, SourceRange) {
        if let Some(marker) = task_marker_len(body_text) {
            return (ItemKind::Task, SourceRange::new(body.start + marker, body.end));
        }
        if body_text.ends_with(':') {
            return (ItemKind::Project, SourceRange::new(body.start, body.end - 1));
        }
        (ItemKind::Note, body)
    }

    /// Byte length of a `- `, `+ ` or `* ` prefix (any single whitespace character).
    fn task_marker_len(body: &str) -> Option<usize> {
        let mut chars = body.chars();
        match (chars.next(), chars.next()) {
            (Some('-' | '+' | '*'), Some(ws)) if ws.is_whitespace() => Some(1 + ws.len_utf8()),
            _ => None,
        }
    }

    /* --------------------------- Tree building --------------------------- */

    /// Builds the arena. `spine` holds the current path: the last root, its last child,
    /// and so on, so `spine[k]` is the container reached after descending `k` levels.
    #[derive(Debug, Default)]
    struct OutlineBuilder {
        items: Vec<Item>,
        roots: Vec<ItemId>,
        spine: Vec<ItemId>,
    }

    impl OutlineBuilder {
        /// Attach under the deepest spine item not deeper than `depth - 1`.
        /// Over-indented lines collapse onto the end of the spine; depth 0 always starts a root.
        fn attach(&mut self, line: ParsedLine) -> ItemId {
            let id = ItemId(self.items.len());
            let level = line.depth.min(self.spine.len());
            let parent = level.checked_sub(1).map(|k| self.spine[k]);

            self.spine.truncate(level);
            self.spine.push(id);
            match parent {
                Some(p) => self.items[p.0].children.push(id),
                None => self.roots.push(id),
            }

            self.items.push(Item {
                id,
                kind: line.kind,
                depth: line.depth,
                line: line.line,
                source_range: line.source_range,
                content_range: line.content_range,
                attributes: line.attributes,
                children: Vec::new(),
                parent,
            });
            id
        }

        fn finish(self, source: String) -> Document {
            Document::from_parts(source, self.items, self.roots)
        }
    }

}

pub mod storage {
    //! Loading documents from disk. Parsing is infallible; only I/O, encoding and the
    //! optional size bound can fail here.

    use crate::core::Document;
    use crate::parser::{ParseOptions, parse_taskpaper};
    use anyhow::{Context, Result};
    use log::info;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Loader configuration, readable from a JSON file.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct LoadOptions {
        pub parse: ParseOptions,
        /// Refuse files larger than this many bytes.
        pub max_input_bytes: Option<u64>,
    }

    impl LoadOptions {
        pub fn from_json_file(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading options {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing options {:?}", path))
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum LoadError {
        #[error("{path:?} is {size} bytes, over the {limit} byte input limit")]
        TooLarge { path: PathBuf, size: u64, limit: u64 },
        #[error("{path:?} is not valid UTF-8")]
        NotUtf8 {
            path: PathBuf,
            #[source]
            source: std::string::FromUtf8Error,
        },
    }

    #[derive(Debug, Clone)]
    pub struct LoadedDocument {
        pub path: PathBuf,
        pub document: Document,
    }

    pub trait TaskPaperLoader {
        fn load_file(&self, path: &Path) -> Result<LoadedDocument>;
    }

    /// Reads whole files from the local filesystem.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FsLoader {
        pub options: LoadOptions,
    }

    impl FsLoader {
        pub fn new(options: LoadOptions) -> Self {
            Self { options }
        }
    }

    impl TaskPaperLoader for FsLoader {
        fn load_file(&self, path: &Path) -> Result<LoadedDocument> {
            if let Some(limit) = self.options.max_input_bytes {
                let size = fs::metadata(path)
                    .with_context(|| format!("reading metadata for {:?}", path))?
                    .len();
                if size > limit {
                    return Err(LoadError::TooLarge {
                        path: path.to_path_buf(),
                        size,
                        limit,
                    }
                    .into());
                }
            }

            let bytes = fs::read(path).with_context(|| format!("reading {:?}", path))?;
            let text = String::from_utf8(bytes).map_err(|source| LoadError::NotUtf8 {
                path: path.to_path_buf(),
                source,
            })?;
            let document = parse_taskpaper(&text, &self.options.parse);
            info!(
                "event=load_file module=storage status=ok bytes={} items={}",
                text.len(),
                document.len()
            );

            Ok(LoadedDocument {
                path: path.to_path_buf(),
                document,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn loads_and_parses_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("list.taskpaper");
            fs::write(&path, "Inbox:\r\n\t- one\r\n").expect("write");

            let loader = FsLoader::new(LoadOptions {
                parse: ParseOptions {
                    normalize_line_endings: true,
                },
                max_input_bytes: None,
            });
            let loaded = loader.load_file(&path).expect("load");
            assert_eq!(loaded.path, path);
            assert_eq!(loaded.document.len(), 2);
            assert_eq!(loaded.document.source(), "Inbox:\n\t- one\n");
        }

        #[test]
        fn rejects_oversized_input() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("big.taskpaper");
            fs::write(&path, "- 0123456789").expect("write");

            let loader = FsLoader::new(LoadOptions {
                max_input_bytes: Some(4),
                ..LoadOptions::default()
            });
            let err = loader.load_file(&path).expect_err("too large");
            assert!(matches!(
                err.downcast_ref::<LoadError>(),
                Some(LoadError::TooLarge {
                    size: 12,
                    limit: 4,
                    ..
                })
            ));
        }

        #[test]
        fn rejects_invalid_utf8() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("bad.taskpaper");
            fs::write(&path, b"- \xff\xfe").expect("write");

            let err = FsLoader::default().load_file(&path).expect_err("not utf8");
            assert!(matches!(
                err.downcast_ref::<LoadError>(),
                Some(LoadError::NotUtf8 { .. })
            ));
        }

        #[test]
        fn options_from_partial_json() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("options.json");
            fs::write(&path, r#"{ "parse": { "normalize_line_endings": true } }"#)
                .expect("write");

            let options = LoadOptions::from_json_file(&path).expect("options");
            assert!(options.parse.normalize_line_endings);
            assert_eq!(options.max_input_bytes, None);
        }
    }
}

pub mod projectors {
    pub mod outline_projector {
        //! Owned, nested view of a document for JSON output and display.

        use crate::core::*;
        use serde::Serialize;
        use std::fmt::Write;

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct TagView {
            pub name: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            pub value: Option<String>,
        }

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct OutlineNode {
            pub kind: ItemKind,
            pub depth: usize,
            /// Position in the tree; differs from `depth` for collapsed lines.
            pub level: usize,
            pub line: usize,
            pub text: String,
            pub tags: Vec<TagView>,
            pub source_range: SourceRange,
            pub content_range: SourceRange,
            pub children: Vec<OutlineNode>,
        }

        pub fn project_document(doc: &Document) -> Vec<OutlineNode> {
            doc.items().map(|item| project_item(doc, item, 0)).collect()
        }

        fn project_item(doc: &Document, item: &Item, level: usize) -> OutlineNode {
            OutlineNode {
                kind: item.kind(),
                depth: item.depth(),
                level,
                line: item.line(),
                text: doc.content(item.id()).to_string(),
                tags: item
                    .attributes()
                    .iter()
                    .map(|a| TagView {
                        name: a.name.clone(),
                        value: a.value.clone(),
                    })
                    .collect(),
                source_range: item.source_range(),
                content_range: item.content_range(),
                children: doc
                    .children(item.id())
                    .map(|child| project_item(doc, child, level + 1))
                    .collect(),
            }
        }

        /// One line per item, two spaces per tree level: `task "buy milk" @done`.
        pub fn render_text(doc: &Document) -> String {
            let mut out = String::new();
            for (item, level) in doc.walk() {
                let _ = write!(
                    out,
                    "{}{} {:?}",
                    "  ".repeat(level),
                    item.kind(),
                    doc.content(item.id())
                );
                for attr in item.attributes() {
                    match &attr.value {
                        Some(v) => {
                            let _ = write!(out, " @{}({})", attr.name, v);
                        }
                        None => {
                            let _ = write!(out, " @{}", attr.name);
                        }
                    }
                }
                out.push('\n');
            }
            out
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            #[test]
            fn nests_children_and_keeps_tags() {
                let doc = Document::parse("Home:\n\t- sink @due(sat)\n\t\tneeds wrench");
                let nodes = project_document(&doc);
                assert_eq!(nodes.len(), 1);
                let task = &nodes[0].children[0];
                assert_eq!(task.text, "sink");
                assert_eq!(task.level, 1);
                assert_eq!(
                    task.tags,
                    vec![TagView {
                        name: "due".into(),
                        value: Some("sat".into())
                    }]
                );
                assert_eq!(task.children[0].kind, ItemKind::Note);
            }

            #[test]
            fn json_shape() {
                let doc = Document::parse("- a @x");
                let json = serde_json::to_value(project_document(&doc)).expect("json");
                assert_eq!(json[0]["kind"], "task");
                assert_eq!(json[0]["text"], "a");
                assert_eq!(json[0]["tags"][0]["name"], "x");
                assert!(json[0]["tags"][0].get("value").is_none());
            }

            #[test]
            fn text_rendering() {
                let doc = Document::parse("P:\n\t- t @a(1) @b");
                assert_eq!(render_text(&doc), "project \"P\"\n  task \"t\" @a(1) @b\n");
            }
        }
    }

    pub mod tag_projector {
        //! Tag lookups over a parsed document.

        use crate::core::*;
        use indexmap::IndexMap;
        use serde::Serialize;

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct TagOccurrence {
            pub item: ItemId,
            pub kind: ItemKind,
            pub line: usize,
            /// Name as written.
            pub name: String,
            pub value: Option<String>,
            pub text: String,
        }

        /// Occurrences grouped by lowercased tag name, in first-seen order.
        pub fn tag_index(doc: &Document) -> IndexMap<String, Vec<TagOccurrence>> {
            let mut index: IndexMap<String, Vec<TagOccurrence>> = IndexMap::new();
            for item in doc.iter() {
                for attr in item.attributes() {
                    index
                        .entry(attr.name.to_ascii_lowercase())
                        .or_default()
                        .push(TagOccurrence {
                            item: item.id(),
                            kind: item.kind(),
                            line: item.line(),
                            name: attr.name.clone(),
                            value: attr.value.clone(),
                            text: doc.content(item.id()).to_string(),
                        });
                }
            }
            index
        }

        /// Items carrying `name`, optionally restricted to tags whose value equals `value`.
        pub fn items_with_tag<'a>(
            doc: &'a Document,
            name: &str,
            value: Option<&str>,
        ) -> Vec<&'a Item> {
            doc.iter()
                .filter(|item| {
                    item.attributes().iter().any(|a| {
                        a.is_named(name) && value.is_none_or(|v| a.value.as_deref() == Some(v))
                    })
                })
                .collect()
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            const LIST: &str = "Work:\n\t- report @Due(mon) @flag\n\t- email @due(tue)\nHome:\n\t- sink @flag";

            #[test]
            fn groups_case_insensitively_in_first_seen_order() {
                let doc = Document::parse(LIST);
                let index = tag_index(&doc);
                let keys: Vec<_> = index.keys().map(String::as_str).collect();
                assert_eq!(keys, vec!["due", "flag"]);
                let due = &index["due"];
                assert_eq!(due.len(), 2);
                assert_eq!(due[0].name, "Due");
                assert_eq!(due[0].text, "report");
                assert_eq!(due[1].value.as_deref(), Some("tue"));
                assert_eq!(index["flag"][1].line, 4);
            }

            #[test]
            fn filters_by_name_and_value() {
                let doc = Document::parse(LIST);
                let flagged: Vec<_> = items_with_tag(&doc, "FLAG", None)
                    .into_iter()
                    .map(|i| doc.content(i.id()))
                    .collect();
                assert_eq!(flagged, vec!["report", "sink"]);

                let tuesday = items_with_tag(&doc, "due", Some("tue"));
                assert_eq!(tuesday.len(), 1);
                assert_eq!(doc.content(tuesday[0].id()), "email");
                assert!(items_with_tag(&doc, "missing", None).is_empty());
            }
        }
    }
}

pub use crate::core::{Attribute, Document, Item, ItemId, ItemKind, SourceRange};
pub use parser::{ParseOptions, parse_taskpaper};
pub use storage::{FsLoader, LoadOptions, TaskPaperLoader};
