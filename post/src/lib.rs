//! Content core for the consulting site's blog: heading/TOC extraction over post HTML
//! and the embed block used by the admin editor.
//! The core stays pure; `blog`, `storage` and `config` layer the CMS pieces on top.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Runtime identity of a document node. Regenerated on every load, never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub Uuid);

    impl NodeId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for NodeId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Identity of one mounted editor instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EditorId(pub Uuid);

    impl EditorId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for EditorId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    /* ------------------------------ Headings ------------------------------ */

    /// One entry of an in-page table of contents.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeadingDescriptor {
        pub id: String,
        pub text: String,
        /// 2 or 3.
        pub level: u8,
    }

    /// Annotated content plus the headings found in it, in document order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Toc {
        pub content: String,
        pub headings: Vec<HeadingDescriptor>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EditError {
        #[error("position {pos} is past the end of the document (length {len})")]
        OutOfBounds { pos: usize, len: usize },
        #[error("position {0} is not a node boundary")]
        NotABoundary(usize),
        #[error("range {from}..{to} does not cover exactly one node")]
        RangeMismatch { from: usize, to: usize },
        #[error("node at position {0} is not an embed block")]
        NotAnEmbed(usize),
    }
}

pub mod toc {
    //! Heading/TOC extraction over post HTML.
    //!
    //! Both walkers implement [`HtmlWalker`]. `DomWalker` drives lol_html's element
    //! rewriter, so untouched bytes are emitted verbatim; `PatternWalker` approximates
    //! the same walk with regexes. Numbering lives in [`IdAssigner`] so the two agree.

    use crate::core::{HeadingDescriptor, Toc};
    use lol_html::{RewriteStrSettings, element, rewrite_str, text};
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::{cell::RefCell, collections::BTreeSet, fmt, ops::Range, str::FromStr, sync::LazyLock};
    use tracing::{debug, warn};

    /// How many headings the on-page navigation shows.
    pub const TOC_PREVIEW_LIMIT: usize = 3;

    const ID_PREFIX: &str = "heading-";

    #[derive(Debug, thiserror::Error)]
    pub enum WalkError {
        #[error("html rewrite failed: {0}")]
        Rewrite(#[from] lol_html::errors::RewritingError),
    }

    /* ------------------------------ Contract ------------------------------ */

    /// Walks `h2`/`h3` headings of an HTML string in document order.
    pub trait HtmlWalker {
        fn name(&self) -> &'static str;

        /// Every non-empty `id` attribute present in `html`, on any element.
        fn element_ids(&self, html: &str) -> Result<BTreeSet<String>, WalkError>;

        /// Visit headings in order, writing the id chosen by `ids` into every
        /// heading that lacks one.
        fn walk(&self, html: &str, ids: &mut IdAssigner) -> Result<Toc, WalkError>;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum WalkerKind {
        #[default]
        Dom,
        Pattern,
    }

    impl WalkerKind {
        pub fn walker(self) -> Box<dyn HtmlWalker> {
            match self {
                Self::Dom => Box::new(DomWalker),
                Self::Pattern => Box::new(PatternWalker),
            }
        }
    }

    impl fmt::Display for WalkerKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Dom => f.write_str("dom"),
                Self::Pattern => f.write_str("pattern"),
            }
        }
    }

    impl FromStr for WalkerKind {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "dom" => Ok(Self::Dom),
                "pattern" => Ok(Self::Pattern),
                other => Err(format!("unknown walker {other:?} (expected dom or pattern)")),
            }
        }
    }

    /* ------------------------------ Id policy ------------------------------ */

    /// Chooses heading ids: `heading-{index}` by encounter order across both levels,
    /// existing ids kept, generated ids steered clear of ids already in the content.
    #[derive(Debug, Default)]
    pub struct IdAssigner {
        next_index: usize,
        taken: BTreeSet<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Assigned {
        pub id: String,
        /// True when the id must be written into the element.
        pub generated: bool,
    }

    impl IdAssigner {
        pub fn new(reserved: BTreeSet<String>) -> Self {
            Self {
                next_index: 0,
                taken: reserved,
            }
        }

        pub fn assign(&mut self, existing: Option<&str>) -> Assigned {
            let index = self.next_index;
            self.next_index += 1;

            if let Some(id) = existing.filter(|id| !id.trim().is_empty()) {
                return Assigned {
                    id: id.to_string(),
                    generated: false,
                };
            }

            let base = format!("{ID_PREFIX}{index}");
            let mut candidate = base.clone();
            let mut suffix = 1;
            while self.taken.contains(&candidate) {
                candidate = format!("{base}-{suffix}");
                suffix += 1;
            }
            self.taken.insert(candidate.clone());
            Assigned {
                id: candidate,
                generated: true,
            }
        }
    }

    /* ---------------------------- Public entry points ---------------------------- */

    /// Annotate every `h2`/`h3` with an id and collect the table of contents.
    ///
    /// Never fails: if the walker errors, the original content comes back unchanged
    /// with no headings.
    pub fn extract_headings(html: &str, walker: &dyn HtmlWalker) -> Toc {
        match try_extract(html, walker) {
            Ok(toc) => {
                debug!(
                    walker = walker.name(),
                    headings = toc.headings.len(),
                    "extracted headings"
                );
                toc
            }
            Err(err) => {
                warn!(
                    walker = walker.name(),
                    error = %err,
                    "heading extraction failed, returning content unchanged"
                );
                Toc {
                    content: html.to_string(),
                    headings: Vec::new(),
                }
            }
        }
    }

    /// The first `limit` headings, for compact on-page navigation.
    pub fn compact_toc(headings: &[HeadingDescriptor], limit: usize) -> &[HeadingDescriptor] {
        &headings[..headings.len().min(limit)]
    }

    fn try_extract(html: &str, walker: &dyn HtmlWalker) -> Result<Toc, WalkError> {
        let reserved = walker.element_ids(html)?;
        let mut ids = IdAssigner::new(reserved);
        walker.walk(html, &mut ids)
    }

    /// Display text of a heading: entities decoded, whitespace collapsed.
    fn heading_text(raw: &str) -> String {
        let decoded = html_escape::decode_html_entities(raw);
        let mut out = String::with_capacity(decoded.len());
        for word in decoded.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
        out
    }

    /* ------------------------------ DomWalker ------------------------------ */

    /// Tokenizer-backed walker built on lol_html's streaming element rewriter.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct DomWalker;

    struct OpenHeading {
        id: String,
        level: u8,
        raw_text: String,
    }

    impl HtmlWalker for DomWalker {
        fn name(&self) -> &'static str {
            "dom"
        }

        fn element_ids(&self, html: &str) -> Result<BTreeSet<String>, WalkError> {
            let ids = RefCell::new(BTreeSet::new());
            rewrite_str(
                html,
                RewriteStrSettings {
                    element_content_handlers: vec![element!("[id]", |el| {
                        if let Some(id) = el.get_attribute("id").filter(|id| !id.trim().is_empty())
                        {
                            ids.borrow_mut().insert(id);
                        }
                        Ok(())
                    })],
                    ..RewriteStrSettings::default()
                },
            )?;
            Ok(ids.into_inner())
        }

        fn walk(&self, html: &str, ids: &mut IdAssigner) -> Result<Toc, WalkError> {
            let open: RefCell<Vec<OpenHeading>> = RefCell::new(Vec::new());
            let content = rewrite_str(
                html,
                RewriteStrSettings {
                    element_content_handlers: vec![
                        element!("h2, h3", |el| {
                            let level = if el.tag_name() == "h2" { 2 } else { 3 };
                            let existing = el.get_attribute("id");
                            let assigned = ids.assign(existing.as_deref());
                            if assigned.generated {
                                el.set_attribute("id", &assigned.id)?;
                            }
                            open.borrow_mut().push(OpenHeading {
                                id: assigned.id,
                                level,
                                raw_text: String::new(),
                            });
                            Ok(())
                        }),
                        text!("h2, h3", |chunk| {
                            if let Some(current) = open.borrow_mut().last_mut() {
                                current.raw_text.push_str(chunk.as_str());
                            }
                            Ok(())
                        }),
                    ],
                    ..RewriteStrSettings::default()
                },
            )?;

            let headings = open
                .into_inner()
                .into_iter()
                .map(|h| HeadingDescriptor {
                    text: heading_text(&h.raw_text),
                    id: h.id,
                    level: h.level,
                })
                .collect();
            Ok(Toc { content, headings })
        }
    }

    /* ---------------------------- PatternWalker ---------------------------- */

    // Attribute text up to the closing `>`, stepping over quoted values.
    static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?is)<h([23])((?:\s(?:[^>"']|"[^"]*"|'[^']*')*)?)>(.*?)</h([23])\s*>"#)
            .expect("heading regex")
    });
    static OPEN_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?s)<[A-Za-z][A-Za-z0-9-]*((?:\s(?:[^>"']|"[^"]*"|'[^']*')*)?)>"#)
            .expect("open tag regex")
    });
    static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"([^\s"'=<>/`]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
            .expect("attribute regex")
    });
    // Comments and raw-text elements; tags inside them are text.
    static OPAQUE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(concat!(
            r"(?is)<!--.*?(?:-->|\z)",
            r"|<script\b.*?(?:</script\s*>|\z)",
            r"|<style\b.*?(?:</style\s*>|\z)",
            r"|<textarea\b.*?(?:</textarea\s*>|\z)",
            r"|<title\b.*?(?:</title\s*>|\z)",
        ))
        .expect("opaque span regex")
    });
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));

    /// Regex approximation of the heading walk for hosts without a tokenizer.
    ///
    /// Matches `<h2 ...>...</h2>` / `<h3 ...>...</h3>` substrings; a match whose closing
    /// level differs from its opening level is not treated as a heading.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PatternWalker;

    /// Span and value of the `id` attribute in an opening tag's attribute text.
    fn id_attribute(attrs: &str) -> Option<(Range<usize>, &str)> {
        ATTR_RE.captures_iter(attrs).find_map(|caps| {
            let whole = caps.get(0)?;
            if !caps.get(1)?.as_str().eq_ignore_ascii_case("id") {
                return None;
            }
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());
            Some((whole.range(), value))
        })
    }

    fn opaque_spans(html: &str) -> Vec<Range<usize>> {
        OPAQUE_RE.find_iter(html).map(|m| m.range()).collect()
    }

    fn in_spans(spans: &[Range<usize>], pos: usize) -> Option<&Range<usize>> {
        spans.iter().find(|span| span.contains(&pos))
    }

    impl HtmlWalker for PatternWalker {
        fn name(&self) -> &'static str {
            "pattern"
        }

        fn element_ids(&self, html: &str) -> Result<BTreeSet<String>, WalkError> {
            let opaque = opaque_spans(html);
            Ok(OPEN_TAG_RE
                .captures_iter(html)
                .filter(|caps| caps.get(0).is_some_and(|m| in_spans(&opaque, m.start()).is_none()))
                .filter_map(|caps| {
                    let attrs = caps.get(1)?;
                    id_attribute(attrs.as_str()).map(|(_, id)| id.to_string())
                })
                .filter(|id| !id.trim().is_empty())
                .collect())
        }

        fn walk(&self, html: &str, ids: &mut IdAssigner) -> Result<Toc, WalkError> {
            let mut content = String::with_capacity(html.len() + 32);
            let mut headings = Vec::new();
            let mut last = 0;
            let opaque = opaque_spans(html);
            let mut from = 0;

            while let Some(caps) = HEADING_RE.captures_at(html, from) {
                let (Some(whole), Some(open), Some(inner), Some(close)) =
                    (caps.get(0), caps.get(1), caps.get(3), caps.get(4))
                else {
                    break;
                };
                if let Some(span) = in_spans(&opaque, whole.start()) {
                    from = span.end;
                    continue;
                }
                from = whole.end();
                if open.as_str() != close.as_str() {
                    continue;
                }

                let level: u8 = if open.as_str() == "2" { 2 } else { 3 };
                let attrs = caps.get(2).map_or("", |m| m.as_str());
                let existing = id_attribute(attrs);
                let assigned = ids.assign(existing.as_ref().map(|(_, id)| *id));

                if assigned.generated {
                    // An empty id="" is dropped so the element carries a single id.
                    let kept = match &existing {
                        Some((span, _)) => {
                            format!("{}{}", attrs[..span.start].trim_end(), &attrs[span.end..])
                        }
                        None => attrs.to_string(),
                    };
                    content.push_str(&html[last..whole.start()]);
                    content.push_str(&format!(
                        "<h{level}{} id=\"{}\">",
                        kept.trim_end(),
                        assigned.id
                    ));
                    content.push_str(&html[inner.start()..whole.end()]);
                    last = whole.end();
                }

                let stripped = TAG_RE.replace_all(inner.as_str(), "");
                headings.push(HeadingDescriptor {
                    id: assigned.id,
                    text: heading_text(&stripped),
                    level,
                });
            }

            content.push_str(&html[last..]);
            Ok(Toc { content, headings })
        }
    }

}

pub mod document {
    //! Block document model for post content.
    //!
    //! Content is a flat run of nodes: verbatim HTML chunks and embed blocks.
    //! Positions are byte offsets into the serialized document and every node spans
    //! exactly its serialized length, so `Document::len()` is the length of the
    //! stored content string.

    use crate::core::{EditError, NodeId};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, tag_no_case, take_while, take_while1},
        character::complete::{char, multispace0, multispace1},
        combinator::{opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        multi::many0,
        sequence::{delimited, preceded, tuple},
    };

    pub const EMBED_TYPE: &str = "embed";
    const EMBED_OPEN: &str = "<div data-type=\"embed\">";
    const EMBED_CLOSE: &str = "</div>";

    /* ------------------------------ Node specs ------------------------------ */

    /// Static description of a node type, as registered with the editor host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeSpec {
        pub name: &'static str,
        pub group: &'static str,
        /// Content is opaque to text editing; the node cannot be entered or split.
        pub atom: bool,
        pub draggable: bool,
        pub selectable: bool,
    }

    pub const EMBED_SPEC: NodeSpec = NodeSpec {
        name: EMBED_TYPE,
        group: "block",
        atom: true,
        draggable: true,
        selectable: true,
    };

    pub const HTML_SPEC: NodeSpec = NodeSpec {
        name: "html",
        group: "block",
        atom: false,
        draggable: false,
        selectable: false,
    };

    /* -------------------------------- Nodes -------------------------------- */

    /// Block holding a raw HTML fragment (iframes, widgets). The fragment is opaque.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EmbedNode {
        pub id: NodeId,
        pub content: String,
    }

    impl EmbedNode {
        pub fn new(content: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                content: content.into(),
            }
        }

        pub fn size(&self) -> usize {
            EMBED_OPEN.len() + self.content.len() + EMBED_CLOSE.len()
        }

        pub fn to_html(&self) -> String {
            let mut out = String::with_capacity(self.size());
            self.write_html(&mut out);
            out
        }

        fn write_html(&self, out: &mut String) {
            out.push_str(EMBED_OPEN);
            out.push_str(&self.content);
            out.push_str(EMBED_CLOSE);
        }
    }

    /// Verbatim HTML between embed blocks.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HtmlNode {
        pub id: NodeId,
        pub raw: String,
    }

    impl HtmlNode {
        pub fn new(raw: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                raw: raw.into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Node {
        Html(HtmlNode),
        Embed(EmbedNode),
    }

    impl Node {
        pub fn embed(content: impl Into<String>) -> Self {
            Self::Embed(EmbedNode::new(content))
        }

        pub fn html(raw: impl Into<String>) -> Self {
            Self::Html(HtmlNode::new(raw))
        }

        pub fn id(&self) -> NodeId {
            match self {
                Self::Html(node) => node.id,
                Self::Embed(node) => node.id,
            }
        }

        pub fn spec(&self) -> &'static NodeSpec {
            match self {
                Self::Html(_) => &HTML_SPEC,
                Self::Embed(_) => &EMBED_SPEC,
            }
        }

        /// Serialized length, which is also the node's span in document positions.
        pub fn size(&self) -> usize {
            match self {
                Self::Html(node) => node.raw.len(),
                Self::Embed(node) => node.size(),
            }
        }

        pub fn as_embed(&self) -> Option<&EmbedNode> {
            match self {
                Self::Embed(node) => Some(node),
                Self::Html(_) => None,
            }
        }

        fn write_html(&self, out: &mut String) {
            match self {
                Self::Html(node) => out.push_str(&node.raw),
                Self::Embed(node) => node.write_html(out),
            }
        }
    }

    /* ------------------------------ Document ------------------------------ */

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Document {
        nodes: Vec<Node>,
    }

    impl Document {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_nodes(nodes: Vec<Node>) -> Self {
            Self { nodes }
        }

        pub fn nodes(&self) -> &[Node] {
            &self.nodes
        }

        pub fn len(&self) -> usize {
            self.nodes.iter().map(Node::size).sum()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Current start position of a node, resolved from scratch on every call.
        pub fn position_of(&self, id: NodeId) -> Option<usize> {
            let mut pos = 0;
            for node in &self.nodes {
                if node.id() == id {
                    return Some(pos);
                }
                pos += node.size();
            }
            None
        }

        pub fn node(&self, id: NodeId) -> Option<&Node> {
            self.nodes.iter().find(|node| node.id() == id)
        }

        /// The node starting exactly at `pos`.
        pub fn node_at(&self, pos: usize) -> Option<&Node> {
            self.index_at(pos).map(|idx| &self.nodes[idx])
        }

        /// Embed blocks with their current positions, in document order.
        pub fn embeds(&self) -> impl Iterator<Item = (usize, &EmbedNode)> {
            self.nodes
                .iter()
                .scan(0usize, |pos, node| {
                    let start = *pos;
                    *pos += node.size();
                    Some((start, node))
                })
                .filter_map(|(start, node)| node.as_embed().map(|embed| (start, embed)))
        }

        pub fn to_html(&self) -> String {
            let mut out = String::with_capacity(self.len());
            for node in &self.nodes {
                node.write_html(&mut out);
            }
            out
        }

        /// Apply every step or none of them.
        pub fn apply_transaction(&mut self, tr: &Transaction) -> Result<(), EditError> {
            let mut next = self.clone();
            for step in tr.steps() {
                next.apply(step.clone())?;
            }
            *self = next;
            Ok(())
        }

        pub fn apply(&mut self, step: Step) -> Result<(), EditError> {
            match step {
                Step::Insert { at, node } => {
                    let idx = self.boundary_index(at)?;
                    self.nodes.insert(idx, node);
                }
                Step::Replace { from, to, node } => {
                    let idx = self.exact_span(from, to)?;
                    self.nodes[idx] = node;
                }
                Step::Delete { from, to } => {
                    let idx = self.exact_span(from, to)?;
                    self.nodes.remove(idx);
                }
            }
            Ok(())
        }

        fn index_at(&self, pos: usize) -> Option<usize> {
            let mut start = 0;
            for (idx, node) in self.nodes.iter().enumerate() {
                if start == pos {
                    return Some(idx);
                }
                if start > pos {
                    return None;
                }
                start += node.size();
            }
            None
        }

        fn boundary_index(&self, pos: usize) -> Result<usize, EditError> {
            let len = self.len();
            if pos > len {
                return Err(EditError::OutOfBounds { pos, len });
            }
            if pos == len {
                return Ok(self.nodes.len());
            }
            self.index_at(pos).ok_or(EditError::NotABoundary(pos))
        }

        /// Index of the node whose span is exactly `from..to`.
        fn exact_span(&self, from: usize, to: usize) -> Result<usize, EditError> {
            let len = self.len();
            if from > len || to > len {
                return Err(EditError::OutOfBounds {
                    pos: from.max(to),
                    len,
                });
            }
            match self.index_at(from) {
                Some(idx) if from + self.nodes[idx].size() == to => Ok(idx),
                _ => Err(EditError::RangeMismatch { from, to }),
            }
        }
    }

    /* ---------------------------- Transactions ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Step {
        /// Insert at a node boundary.
        Insert { at: usize, node: Node },
        /// Swap the node spanning exactly `from..to` for `node`.
        Replace { from: usize, to: usize, node: Node },
        /// Remove the node spanning exactly `from..to`.
        Delete { from: usize, to: usize },
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Transaction {
        steps: Vec<Step>,
    }

    impl Transaction {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn step(mut self, step: Step) -> Self {
            self.steps.push(step);
            self
        }

        pub fn steps(&self) -> &[Step] {
            &self.steps
        }

        pub fn is_empty(&self) -> bool {
            self.steps.is_empty()
        }
    }

    /* ---------------------------- Parse / serialize ---------------------------- */

    /// Load stored content. Every `<div data-type="embed">` becomes an embed block
    /// holding its inner HTML verbatim; everything else is kept as HTML chunks.
    /// Never fails: an unclosed embed div stays plain HTML.
    pub fn parse_document(input: &str) -> Document {
        let mut nodes = Vec::new();
        let mut chunk_start = 0;
        let mut cursor = 0;

        while let Some(offset) = input[cursor..].find('<') {
            let at = cursor + offset;
            if let Some(len) = opaque_span(&input[at..]) {
                cursor = at + len;
                continue;
            }
            match embed_block(&input[at..]) {
                Ok((rest, inner)) => {
                    if chunk_start < at {
                        nodes.push(Node::html(&input[chunk_start..at]));
                    }
                    nodes.push(Node::embed(inner));
                    cursor = input.len() - rest.len();
                    chunk_start = cursor;
                }
                Err(_) => cursor = at + 1,
            }
        }

        if chunk_start < input.len() {
            nodes.push(Node::html(&input[chunk_start..]));
        }
        Document { nodes }
    }

    pub fn serialize_document(doc: &Document) -> String {
        doc.to_html()
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn fail<'a, T>(i: &'a str, context: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(context))],
        }))
    }

    /// `<div ... data-type="embed" ...>inner</div>`, yielding `inner`.
    fn embed_block(i: &str) -> PResult<'_, &str> {
        let (i, attrs) = open_div(i)?;
        let is_embed = attrs.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("data-type") && *value == Some(EMBED_TYPE)
        });
        if !is_embed {
            return fail(i, "not-embed");
        }
        balanced_div_body(i)
    }

    fn open_div(i: &str) -> PResult<'_, Vec<(&str, Option<&str>)>> {
        let (i, _) = tag_no_case("<div")(i)?;
        let (i, attrs) = many0(preceded(multispace1, attribute))(i)?;
        let (i, _) = multispace0(i)?;
        let (i, _) = char('>')(i)?;
        Ok((i, attrs))
    }

    fn closing_div(i: &str) -> PResult<'_, &str> {
        recognize(tuple((tag_no_case("</div"), multispace0, char('>'))))(i)
    }

    fn attribute(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (i, name) = take_while1(|c: char| {
            !c.is_whitespace() && !matches!(c, '=' | '>' | '/' | '"' | '\'')
        })(i)?;
        let (i, value) = opt(preceded(
            tuple((multispace0, char('='), multispace0)),
            attribute_value,
        ))(i)?;
        Ok((i, (name, value)))
    }

    fn attribute_value(i: &str) -> PResult<'_, &str> {
        alt((
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            take_while1(|c: char| !c.is_whitespace() && c != '>'),
        ))(i)
    }

    /// Everything up to the `</div>` that balances the already consumed opening tag.
    fn balanced_div_body(input: &str) -> PResult<'_, &str> {
        let mut depth = 1usize;
        let mut cursor = 0;
        while let Some(offset) = input[cursor..].find('<') {
            let at = cursor + offset;
            let tail = &input[at..];
            if let Some(len) = opaque_span(tail) {
                cursor = at + len;
            } else if let Ok((rest, _)) = closing_div(tail) {
                depth -= 1;
                if depth == 0 {
                    return Ok((rest, &input[..at]));
                }
                cursor = input.len() - rest.len();
            } else if let Ok((rest, _)) = open_div(tail) {
                depth += 1;
                cursor = input.len() - rest.len();
            } else {
                cursor = at + 1;
            }
        }
        fail(input, "unclosed-embed")
    }

    /// Length of the comment or raw-text element (`script`, `style`, `textarea`,
    /// `title`) starting at `i`. Their bodies are text, so tag scans step over them
    /// whole. An unterminated one runs to the end of input.
    fn opaque_span(i: &str) -> Option<usize> {
        if let Ok((body, _)) = comment_open(i) {
            let end = body.find("-->").map_or(body.len(), |at| at + "-->".len());
            return Some(i.len() - body.len() + end);
        }
        let (body, name) = raw_text_open(i).ok()?;
        let end = end_tag_offset(body, name).unwrap_or(body.len());
        Some(i.len() - body.len() + end)
    }

    fn comment_open(i: &str) -> PResult<'_, &str> {
        tag("<!--")(i)
    }

    fn raw_text_open(i: &str) -> PResult<'_, &str> {
        let (i, _) = char('<')(i)?;
        let (i, name) = alt((
            tag_no_case("script"),
            tag_no_case("style"),
            tag_no_case("textarea"),
            tag_no_case("title"),
        ))(i)?;
        let (i, _) = many0(preceded(multispace1, attribute))(i)?;
        let (i, _) = multispace0(i)?;
        let (i, _) = opt(char('/'))(i)?;
        let (i, _) = char('>')(i)?;
        Ok((i, name))
    }

    /// Offset just past the `</name ...>` that ends a raw-text body, ignoring case.
    fn end_tag_offset(body: &str, name: &str) -> Option<usize> {
        let lower = body.to_ascii_lowercase();
        let needle = format!("</{}", name.to_ascii_lowercase());
        let mut from = 0;
        while let Some(found) = lower[from..].find(&needle) {
            let after = from + found + needle.len();
            if lower[after..].starts_with(|c: char| c == '>' || c == '/' || c.is_whitespace()) {
                return lower[after..].find('>').map(|gt| after + gt + 1);
            }
            from = after;
        }
        None
    }

}

pub mod editor {
    //! Editor host for embed blocks: node views, the per-editor edit surface
    //! registry and command dispatch.
    //!
    //! An embed goes Inserted -> Displayed -> Editing -> Updated or Deleted. Every
    //! change is a [`Command`] turned into a [`Transaction`] against the current
    //! document, so positions are always resolved at the moment of use.

    use crate::core::{EditError, EditorId, NodeId};
    use crate::document::{Document, EMBED_SPEC, Node, Step, Transaction, parse_document};
    use indexmap::IndexMap;
    use tracing::debug;

    /* ------------------------------ Edit surface ------------------------------ */

    /// What an edit surface needs to show an embed for editing.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EditRequest {
        pub editor: EditorId,
        pub node: NodeId,
        /// Position at the time Edit was clicked. Informational only.
        pub pos: usize,
        pub content: String,
    }

    impl EditRequest {
        /// The command that saves `content` into the node this request was opened for.
        pub fn confirm(&self, content: impl Into<String>) -> Command {
            Command::UpdateEmbed {
                node: self.node,
                content: content.into(),
            }
        }
    }

    /// Host-side editing UI (modal, prompt, staged file). Opening is fire-and-forget;
    /// the surface answers later by dispatching [`EditRequest::confirm`].
    pub trait EditSurface {
        fn open(&mut self, request: EditRequest);
    }

    /// Edit surfaces keyed by the editor instance they serve.
    #[derive(Default)]
    pub struct SurfaceRegistry {
        surfaces: IndexMap<EditorId, Box<dyn EditSurface>>,
    }

    impl SurfaceRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns the surface previously registered for `editor`, if any.
        pub fn register(
            &mut self,
            editor: EditorId,
            surface: Box<dyn EditSurface>,
        ) -> Option<Box<dyn EditSurface>> {
            debug!(%editor, "edit surface registered");
            self.surfaces.insert(editor, surface)
        }

        pub fn unregister(&mut self, editor: EditorId) -> Option<Box<dyn EditSurface>> {
            let removed = self.surfaces.shift_remove(&editor);
            if removed.is_some() {
                debug!(%editor, "edit surface unregistered");
            }
            removed
        }

        pub fn is_registered(&self, editor: EditorId) -> bool {
            self.surfaces.contains_key(&editor)
        }

        pub fn len(&self) -> usize {
            self.surfaces.len()
        }

        pub fn is_empty(&self) -> bool {
            self.surfaces.is_empty()
        }

        pub fn surface_mut(&mut self, editor: EditorId) -> Option<&mut Box<dyn EditSurface>> {
            self.surfaces.get_mut(&editor)
        }
    }

    /* -------------------------------- Commands -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// Paste-code workflow: a new embed at a node boundary.
        InsertEmbed { at: usize, content: String },
        UpdateEmbed { node: NodeId, content: String },
        DeleteEmbed { node: NodeId },
    }

    impl Command {
        /// Build the transaction for the document as it is now.
        /// `Ok(None)` when the target node no longer exists.
        fn transaction(&self, doc: &Document) -> Result<Option<Transaction>, EditError> {
            let tr = match self {
                Self::InsertEmbed { at, content } => Transaction::new().step(Step::Insert {
                    at: *at,
                    node: Node::embed(content.as_str()),
                }),
                Self::UpdateEmbed { node, content } => {
                    let Some((from, size)) = resolve_embed(doc, *node)? else {
                        return Ok(None);
                    };
                    Transaction::new().step(Step::Replace {
                        from,
                        to: from + size,
                        node: Node::embed(content.as_str()),
                    })
                }
                Self::DeleteEmbed { node } => {
                    let Some((from, size)) = resolve_embed(doc, *node)? else {
                        return Ok(None);
                    };
                    Transaction::new().step(Step::Delete {
                        from,
                        to: from + size,
                    })
                }
            };
            Ok(Some(tr))
        }
    }

    fn resolve_embed(doc: &Document, id: NodeId) -> Result<Option<(usize, usize)>, EditError> {
        let (Some(pos), Some(node)) = (doc.position_of(id), doc.node(id)) else {
            return Ok(None);
        };
        match node.as_embed() {
            Some(embed) => Ok(Some((pos, embed.size()))),
            None => Err(EditError::NotAnEmbed(pos)),
        }
    }

    /* --------------------------------- Editor --------------------------------- */

    type Listener = Box<dyn FnMut(&Transaction, &Document)>;

    pub struct Editor {
        id: EditorId,
        doc: Document,
        listeners: Vec<Listener>,
    }

    impl Editor {
        pub fn new(doc: Document) -> Self {
            Self {
                id: EditorId::new(),
                doc,
                listeners: Vec::new(),
            }
        }

        pub fn from_html(html: &str) -> Self {
            Self::new(parse_document(html))
        }

        pub fn id(&self) -> EditorId {
            self.id
        }

        pub fn document(&self) -> &Document {
            &self.doc
        }

        pub fn to_html(&self) -> String {
            self.doc.to_html()
        }

        pub fn mount(&self, registry: &mut SurfaceRegistry, surface: Box<dyn EditSurface>) {
            registry.register(self.id, surface);
        }

        pub fn unmount(&self, registry: &mut SurfaceRegistry) {
            registry.unregister(self.id);
        }

        /// Called after every applied transaction, in subscription order.
        pub fn subscribe(&mut self, listener: impl FnMut(&Transaction, &Document) + 'static) {
            self.listeners.push(Box::new(listener));
        }

        pub fn embed_views(&self) -> Vec<EmbedView> {
            self.doc
                .embeds()
                .map(|(_, embed)| EmbedView {
                    editor: self.id,
                    node: embed.id,
                })
                .collect()
        }

        pub fn view_for(&self, node: NodeId) -> Option<EmbedView> {
            self.doc.node(node)?.as_embed()?;
            Some(EmbedView {
                editor: self.id,
                node,
            })
        }

        /// Apply `command`. Returns the applied transaction, or `None` when the
        /// command targeted a node that is gone.
        pub fn dispatch(&mut self, command: Command) -> Result<Option<Transaction>, EditError> {
            let Some(tr) = command.transaction(&self.doc)? else {
                debug!(editor = %self.id, ?command, "stale node, command ignored");
                return Ok(None);
            };
            self.doc.apply_transaction(&tr)?;
            debug!(
                editor = %self.id,
                steps = tr.steps().len(),
                len = self.doc.len(),
                "transaction applied"
            );
            for listener in &mut self.listeners {
                listener(&tr, &self.doc);
            }
            Ok(Some(tr))
        }
    }

    /* -------------------------------- Node view -------------------------------- */

    /// Display handle for one embed in one editor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EmbedView {
        pub editor: EditorId,
        pub node: NodeId,
    }

    impl EmbedView {
        pub fn position(&self, editor: &Editor) -> Option<usize> {
            if editor.id() != self.editor {
                return None;
            }
            editor.document().position_of(self.node)
        }

        /// Non-editable wrapper with header controls and a live preview of the
        /// fragment. `None` once the node is gone.
        pub fn render(&self, editor: &Editor) -> Option<String> {
            let embed = editor.document().node(self.node)?.as_embed()?;
            let drag = if EMBED_SPEC.draggable {
                r#" draggable="true""#
            } else {
                ""
            };
            let handle = if EMBED_SPEC.draggable {
                r#"<span class="embed-block__handle" data-drag-handle></span>"#
            } else {
                ""
            };
            Some(format!(
                concat!(
                    r#"<div class="embed-block" data-node-view="{name}" data-node-id="{id}" contenteditable="false"{drag}>"#,
                    r#"<div class="embed-block__header">{handle}<span class="embed-block__label">Embed</span>"#,
                    r#"<button type="button" data-action="edit">Edit</button>"#,
                    r#"<button type="button" data-action="delete">Delete</button></div>"#,
                    r#"<div class="embed-block__preview">{content}</div></div>"#,
                ),
                name = EMBED_SPEC.name,
                id = self.node,
                drag = drag,
                handle = handle,
                content = embed.content,
            ))
        }

        /// Hand the node to this editor's edit surface. False when the node is gone
        /// or no surface is mounted for the editor.
        pub fn click_edit(&self, editor: &Editor, registry: &mut SurfaceRegistry) -> bool {
            let Some(pos) = self.position(editor) else {
                debug!(node = %self.node, "edit on stale node");
                return false;
            };
            let Some(content) = editor
                .document()
                .node(self.node)
                .and_then(Node::as_embed)
                .map(|embed| embed.content.clone())
            else {
                return false;
            };
            let Some(surface) = registry.surface_mut(self.editor) else {
                debug!(editor = %self.editor, "no edit surface mounted");
                return false;
            };
            surface.open(EditRequest {
                editor: self.editor,
                node: self.node,
                pos,
                content,
            });
            true
        }

        pub fn click_delete(&self, editor: &mut Editor) -> Result<bool, EditError> {
            if editor.id() != self.editor {
                return Ok(false);
            }
            let applied = editor.dispatch(Command::DeleteEmbed { node: self.node })?;
            Ok(applied.is_some())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::{cell::RefCell, rc::Rc};

        const CONTENT: &str = "<p>Intro</p>\
            <div data-type=\"embed\">A</div>\
            <p>Middle</p>\
            <div data-type=\"embed\"><script src=\"w.js\"></script></div>\
            <p>Outro</p>";

        #[derive(Clone, Default)]
        struct Recording(Rc<RefCell<Vec<EditRequest>>>);

        impl EditSurface for Recording {
            fn open(&mut self, request: EditRequest) {
                self.0.borrow_mut().push(request);
            }
        }

        impl Recording {
            fn take(&self) -> Vec<EditRequest> {
                self.0.borrow_mut().drain(..).collect()
            }
        }

        fn mounted(html: &str) -> (Editor, SurfaceRegistry, Recording) {
            let editor = Editor::from_html(html);
            let mut registry = SurfaceRegistry::new();
            let surface = Recording::default();
            editor.mount(&mut registry, Box::new(surface.clone()));
            (editor, registry, surface)
        }

        #[test]
        fn edit_then_confirm_replaces_only_that_span() {
            let (mut editor, mut registry, surface) = mounted(CONTENT);
            let view = editor.embed_views()[1];
            let before: Vec<Node> = editor.document().nodes().to_vec();
            let old_len = editor.document().len();

            assert!(view.click_edit(&editor, &mut registry));
            let request = surface.take().pop().expect("request");
            assert_eq!(request.content, "<script src=\"w.js\"></script>");
            assert_eq!(request.pos, editor.document().position_of(view.node).unwrap());

            let new_content = r#"<iframe src="https://example.com"></iframe>"#;
            editor
                .dispatch(request.confirm(new_content))
                .expect("update")
                .expect("applied");

            let after = editor.document().nodes();
            assert_eq!(after.len(), before.len());
            assert_eq!(
                editor.document().len() as isize - old_len as isize,
                new_content.len() as isize - request.content.len() as isize
            );
            for (idx, (b, a)) in before.iter().zip(after).enumerate() {
                if idx == 3 {
                    assert_ne!(a.id(), b.id());
                    assert_eq!(a.as_embed().map(|e| e.content.as_str()), Some(new_content));
                } else {
                    assert_eq!(a, b);
                }
            }
            assert!(editor.view_for(view.node).is_none());
        }

        #[test]
        fn confirm_resolves_the_node_again_after_earlier_edits() {
            let (mut editor, mut registry, surface) = mounted(CONTENT);
            let view = editor.embed_views()[0];
            assert!(view.click_edit(&editor, &mut registry));
            let request = surface.take().pop().expect("request");

            editor
                .dispatch(Command::InsertEmbed {
                    at: 0,
                    content: "<hr>".into(),
                })
                .expect("insert");
            assert_ne!(view.position(&editor), Some(request.pos));

            editor.dispatch(request.confirm("B")).expect("update");
            let contents: Vec<_> = editor
                .document()
                .embeds()
                .map(|(_, e)| e.content.clone())
                .collect();
            assert_eq!(contents, ["<hr>", "B", "<script src=\"w.js\"></script>"]);
            assert!(editor.to_html().starts_with("<div data-type=\"embed\"><hr></div><p>Intro</p>"));
        }

        #[test]
        fn delete_removes_exactly_the_clicked_embed() {
            let (mut editor, _registry, _surface) = mounted(CONTENT);
            let views = editor.embed_views();

            assert!(views[0].click_delete(&mut editor).expect("delete"));
            assert_eq!(
                editor.to_html(),
                "<p>Intro</p><p>Middle</p>\
                 <div data-type=\"embed\"><script src=\"w.js\"></script></div><p>Outro</p>"
            );
            assert_eq!(editor.embed_views(), vec![views[1]]);
        }

        #[test]
        fn stale_views_are_no_ops() {
            let (mut editor, mut registry, surface) = mounted(CONTENT);
            let view = editor.embed_views()[0];
            assert!(view.click_delete(&mut editor).expect("delete"));
            let snapshot = editor.to_html();

            assert!(!view.click_edit(&editor, &mut registry));
            assert!(surface.take().is_empty());
            assert!(!view.click_delete(&mut editor).expect("stale delete"));
            assert_eq!(
                editor.dispatch(Command::UpdateEmbed {
                    node: view.node,
                    content: "late".into(),
                }),
                Ok(None)
            );
            assert!(view.render(&editor).is_none());
            assert_eq!(editor.to_html(), snapshot);
        }

        #[test]
        fn each_editor_reaches_only_its_own_surface() {
            let first = Editor::from_html(CONTENT);
            let second = Editor::from_html("<div data-type=\"embed\">other</div>");
            let mut registry = SurfaceRegistry::new();
            let (a, b) = (Recording::default(), Recording::default());
            first.mount(&mut registry, Box::new(a.clone()));
            second.mount(&mut registry, Box::new(b.clone()));
            assert_eq!(registry.len(), 2);

            assert!(second.embed_views()[0].click_edit(&second, &mut registry));
            assert!(a.take().is_empty());
            let requests = b.take();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].editor, second.id());
            assert_eq!(requests[0].content, "other");

            // A view is bound to the editor that created it.
            assert!(!first.embed_views()[0].click_edit(&second, &mut registry));

            first.unmount(&mut registry);
            assert!(!registry.is_registered(first.id()));
            assert!(!first.embed_views()[0].click_edit(&first, &mut registry));
            assert!(second.embed_views()[0].click_edit(&second, &mut registry));
        }

        #[test]
        fn every_listener_sees_applied_transactions() {
            let mut editor = Editor::from_html(CONTENT);
            let seen = Rc::new(RefCell::new(Vec::new()));
            for tag in ["first", "second"] {
                let seen = Rc::clone(&seen);
                editor.subscribe(move |tr, doc| {
                    seen.borrow_mut().push((tag, tr.steps().len(), doc.len()));
                });
            }

            let node = editor.embed_views()[0].node;
            editor
                .dispatch(Command::DeleteEmbed { node })
                .expect("delete");
            editor
                .dispatch(Command::DeleteEmbed { node })
                .expect("stale delete");

            let len = editor.document().len();
            assert_eq!(*seen.borrow(), vec![("first", 1, len), ("second", 1, len)]);
        }

        #[test]
        fn insert_rejects_positions_inside_nodes() {
            let mut editor = Editor::from_html(CONTENT);
            let before = editor.to_html();
            assert_eq!(
                editor.dispatch(Command::InsertEmbed {
                    at: 2,
                    content: "x".into(),
                }),
                Err(EditError::NotABoundary(2))
            );
            assert!(matches!(
                editor.dispatch(Command::InsertEmbed {
                    at: before.len() + 1,
                    content: "x".into(),
                }),
                Err(EditError::OutOfBounds { .. })
            ));
            assert_eq!(editor.to_html(), before);
        }

        #[test]
        fn commands_on_plain_html_nodes_are_rejected() {
            let mut editor = Editor::from_html(CONTENT);
            let html_node = editor.document().nodes()[0].id();
            assert_eq!(
                editor.dispatch(Command::DeleteEmbed { node: html_node }),
                Err(EditError::NotAnEmbed(0))
            );
            assert!(editor.view_for(html_node).is_none());
        }

        #[test]
        fn rendered_view_is_locked_and_previews_verbatim() {
            let editor = Editor::from_html(CONTENT);
            let view = editor.embed_views()[1];
            let html = view.render(&editor).expect("render");
            assert!(html.contains(r#"contenteditable="false""#));
            assert!(html.contains(r#"draggable="true""#));
            assert!(html.contains(r#"data-action="edit""#));
            assert!(html.contains(r#"data-action="delete""#));
            assert!(html.contains("<script src=\"w.js\"></script>"));
            assert!(!html.contains("data-type="));
        }
    }
}

pub mod blog {
    use crate::core::HeadingDescriptor;
    use crate::toc::{TOC_PREVIEW_LIMIT, WalkerKind, compact_toc, extract_headings};
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use tracing::debug;
    use uuid::Uuid;

    /* ------------------------------ Localized text ------------------------------ */

    /// Locale code -> text, in authoring order.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Localized(IndexMap<String, String>);

    impl Localized {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, locale: impl Into<String>, text: impl Into<String>) -> Self {
            self.insert(locale, text);
            self
        }

        pub fn insert(&mut self, locale: impl Into<String>, text: impl Into<String>) {
            self.0.insert(locale.into(), text.into());
        }

        pub fn get(&self, locale: &str) -> Option<&str> {
            self.0.get(locale).map(String::as_str)
        }

        /// `locale`, else `fallback`, else the first entry. Yields the locale used.
        pub fn resolve<'a>(&'a self, locale: &'a str, fallback: &'a str) -> Option<(&'a str, &'a str)> {
            if let Some(text) = self.get(locale) {
                return Some((locale, text));
            }
            if let Some(text) = self.get(fallback) {
                return Some((fallback, text));
            }
            self.0.first().map(|(l, t)| (l.as_str(), t.as_str()))
        }

        pub fn locales(&self) -> impl Iterator<Item = &str> {
            self.0.keys().map(String::as_str)
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }
    }

    /* ---------------------------------- Posts ---------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum PostStatus {
        #[default]
        Draft,
        Published,
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Post {
        pub id: Uuid,
        pub slug: String,
        pub title: Localized,
        #[serde(default)]
        pub excerpt: Localized,
        /// Stored HTML, embed blocks included.
        pub content: Localized,
        #[serde(default)]
        pub status: PostStatus,
        pub published_at: Option<DateTime<Utc>>,
        pub updated_at: DateTime<Utc>,
        pub category: Option<String>,
        #[serde(default)]
        pub tags: Vec<String>,
        pub cover_image: Option<String>,
    }

    impl Post {
        /// A draft titled `title` in `locale`, slugged from the title.
        pub fn new(locale: &str, title: &str) -> Self {
            let id = Uuid::new_v4();
            let mut slug = slugify(title);
            if slug.is_empty() {
                slug = format!("post-{}", &id.simple().to_string()[..8]);
            }
            Self {
                id,
                slug,
                title: Localized::new().with(locale, title),
                excerpt: Localized::new(),
                content: Localized::new(),
                status: PostStatus::Draft,
                published_at: None,
                updated_at: Utc::now(),
                category: None,
                tags: Vec::new(),
                cover_image: None,
            }
        }

        pub fn is_published(&self) -> bool {
            self.status == PostStatus::Published
        }

        /// Keeps the first publication date when republishing.
        pub fn publish(&mut self, at: DateTime<Utc>) {
            self.status = PostStatus::Published;
            self.published_at.get_or_insert(at);
            self.updated_at = at;
        }
    }

    /* -------------------------------- Taxonomy -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Category {
        pub slug: String,
        pub name: Localized,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Tag {
        pub slug: String,
        pub name: Localized,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Taxonomy {
        #[serde(default)]
        pub categories: Vec<Category>,
        #[serde(default)]
        pub tags: Vec<Tag>,
    }

    impl Taxonomy {
        pub fn category(&self, slug: &str) -> Option<&Category> {
            self.categories.iter().find(|c| c.slug == slug)
        }

        pub fn tag(&self, slug: &str) -> Option<&Tag> {
            self.tags.iter().find(|t| t.slug == slug)
        }
    }

    /// Lowercase ASCII words joined by `-`. Anything else separates words.
    pub fn slugify(title: &str) -> String {
        let mut slug = String::with_capacity(title.len());
        for c in title.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        slug
    }

    /* -------------------------------- Rendering -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderOptions {
        pub walker: WalkerKind,
        pub toc_limit: usize,
    }

    impl Default for RenderOptions {
        fn default() -> Self {
            Self {
                walker: WalkerKind::default(),
                toc_limit: TOC_PREVIEW_LIMIT,
            }
        }
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct RenderedPost {
        pub slug: String,
        /// Locale the content was actually taken from.
        pub locale: String,
        pub title: String,
        pub excerpt: Option<String>,
        pub html: String,
        /// Compact navigation.
        pub toc: Vec<HeadingDescriptor>,
        pub headings: Vec<HeadingDescriptor>,
        pub published_at: Option<DateTime<Utc>>,
    }

    /// Public page payload for `post` in `locale`, falling back to `fallback`.
    /// Embed blocks pass through untouched.
    pub fn render_post(
        post: &Post,
        locale: &str,
        fallback: &str,
        options: &RenderOptions,
    ) -> RenderedPost {
        let (used, content) = post
            .content
            .resolve(locale, fallback)
            .unwrap_or((locale, ""));
        let walker = options.walker.walker();
        let toc = extract_headings(content, walker.as_ref());
        debug!(slug = %post.slug, locale = used, walker = %options.walker, "rendered post");

        RenderedPost {
            slug: post.slug.clone(),
            locale: used.to_string(),
            title: post
                .title
                .resolve(used, fallback)
                .map(|(_, t)| t.to_string())
                .unwrap_or_else(|| post.slug.clone()),
            excerpt: post.excerpt.resolve(used, fallback).map(|(_, t)| t.to_string()),
            toc: compact_toc(&toc.headings, options.toc_limit).to_vec(),
            headings: toc.headings,
            html: toc.content,
            published_at: post.published_at,
        }
    }

}

pub mod storage {
    use crate::blog::{Post, Taxonomy};
    use anyhow::{Context, Result, bail};
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const TAXONOMY_FILE: &str = "taxonomy.json";

    pub trait PostRepository {
        /// Newest first; undated drafts last.
        fn list(&self) -> Result<Vec<Post>>;
        fn load(&self, slug: &str) -> Result<Option<Post>>;
        fn save(&self, post: &Post) -> Result<()>;
        /// True when a post was removed.
        fn delete(&self, slug: &str) -> Result<bool>;
        fn taxonomy(&self) -> Result<Taxonomy>;
    }

    /// One pretty-printed JSON file per post under `root`, plus `taxonomy.json`.
    #[derive(Debug, Clone)]
    pub struct FsPostRepository {
        root: PathBuf,
    }

    impl FsPostRepository {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn save_taxonomy(&self, taxonomy: &Taxonomy) -> Result<()> {
            self.write_json(&self.root.join(TAXONOMY_FILE), taxonomy)
        }

        fn path_for(&self, slug: &str) -> Result<PathBuf> {
            validate_slug(slug)?;
            Ok(self.root.join(format!("{slug}.json")))
        }

        fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
            fs::create_dir_all(&self.root)
                .with_context(|| format!("creating {}", self.root.display()))?;
            let mut json = serde_json::to_string_pretty(value)?;
            json.push('\n');
            fs::write(path, json).with_context(|| format!("writing {}", path.display()))
        }
    }

    fn validate_slug(slug: &str) -> Result<()> {
        if slug.is_empty()
            || slug.starts_with('-')
            || !slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            bail!("invalid slug {slug:?}");
        }
        if format!("{slug}.json") == TAXONOMY_FILE {
            bail!("slug {slug:?} is reserved");
        }
        Ok(())
    }

    fn read_post(path: &Path) -> Result<Post> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    impl PostRepository for FsPostRepository {
        fn list(&self) -> Result<Vec<Post>> {
            let entries = match fs::read_dir(&self.root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => {
                    return Err(err).with_context(|| format!("listing {}", self.root.display()));
                }
            };

            let mut posts = Vec::new();
            for entry in entries {
                let path = entry?.path();
                let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
                let is_taxonomy = path.file_name().and_then(|n| n.to_str()) == Some(TAXONOMY_FILE);
                if path.is_file() && is_json && !is_taxonomy {
                    posts.push(read_post(&path)?);
                }
            }
            posts.sort_by(|a, b| {
                b.published_at
                    .cmp(&a.published_at)
                    .then_with(|| a.slug.cmp(&b.slug))
            });
            debug!(root = %self.root.display(), posts = posts.len(), "listed posts");
            Ok(posts)
        }

        fn load(&self, slug: &str) -> Result<Option<Post>> {
            let path = self.path_for(slug)?;
            if !path.exists() {
                return Ok(None);
            }
            read_post(&path).map(Some)
        }

        fn save(&self, post: &Post) -> Result<()> {
            let path = self.path_for(&post.slug)?;
            self.write_json(&path, post)?;
            debug!(slug = %post.slug, path = %path.display(), "saved post");
            Ok(())
        }

        fn delete(&self, slug: &str) -> Result<bool> {
            let path = self.path_for(slug)?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err).with_context(|| format!("deleting {}", path.display())),
            }
        }

        fn taxonomy(&self) -> Result<Taxonomy> {
            let path = self.root.join(TAXONOMY_FILE);
            if !path.exists() {
                return Ok(Taxonomy::default());
            }
            let text =
                fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::blog::{Category, Localized};
        use chrono::{TimeZone, Utc};
        use tempfile::tempdir;

        fn dated(title: &str, day: Option<u32>) -> Post {
            let mut post = Post::new("en", title);
            if let Some(day) = day {
                post.publish(Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap());
            }
            post
        }

        #[test]
        fn save_load_and_delete() {
            let dir = tempdir().unwrap();
            let repo = FsPostRepository::new(dir.path().join("posts"));
            let mut post = dated("Hello World", Some(2));
            post.content.insert("en", "<div data-type=\"embed\"><iframe></iframe></div>");

            repo.save(&post).unwrap();
            assert!(dir.path().join("posts/hello-world.json").is_file());
            assert_eq!(repo.load("hello-world").unwrap(), Some(post));
            assert_eq!(repo.load("missing").unwrap(), None);

            assert!(repo.delete("hello-world").unwrap());
            assert!(!repo.delete("hello-world").unwrap());
            assert!(repo.list().unwrap().is_empty());
        }

        #[test]
        fn list_orders_newest_first_then_by_slug() {
            let dir = tempdir().unwrap();
            let repo = FsPostRepository::new(dir.path());
            for post in [
                dated("Older", Some(1)),
                dated("Draft B", None),
                dated("Newer", Some(9)),
                dated("Draft A", None),
            ] {
                repo.save(&post).unwrap();
            }
            repo.save_taxonomy(&Taxonomy::default()).unwrap();
            fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

            let slugs: Vec<_> = repo.list().unwrap().into_iter().map(|p| p.slug).collect();
            assert_eq!(slugs, ["newer", "older", "draft-a", "draft-b"]);
        }

        #[test]
        fn missing_root_lists_nothing() {
            let dir = tempdir().unwrap();
            let repo = FsPostRepository::new(dir.path().join("nope"));
            assert!(repo.list().unwrap().is_empty());
            assert_eq!(repo.taxonomy().unwrap(), Taxonomy::default());
        }

        #[test]
        fn taxonomy_round_trips() {
            let dir = tempdir().unwrap();
            let repo = FsPostRepository::new(dir.path());
            let taxonomy = Taxonomy {
                categories: vec![Category {
                    slug: "engineering".into(),
                    name: Localized::new().with("en", "Engineering"),
                }],
                tags: Vec::new(),
            };
            repo.save_taxonomy(&taxonomy).unwrap();
            let loaded = repo.taxonomy().unwrap();
            assert_eq!(loaded, taxonomy);
            assert!(loaded.category("engineering").is_some());
        }

        #[test]
        fn unsafe_slugs_are_rejected() {
            let dir = tempdir().unwrap();
            let repo = FsPostRepository::new(dir.path());
            for slug in ["", "../etc", "Upper", "-lead", "taxonomy", "a/b"] {
                assert!(repo.load(slug).is_err(), "{slug:?} accepted");
            }
            let mut post = dated("ok", None);
            post.slug = "../escape".into();
            let err = repo.save(&post).unwrap_err();
            assert!(err.to_string().contains("invalid slug"));
        }

        #[test]
        fn corrupt_files_name_the_path() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("broken.json"), "{not json").unwrap();
            let repo = FsPostRepository::new(dir.path());
            let err = repo.load("broken").unwrap_err();
            assert!(format!("{err:#}").contains("broken.json"));
        }
    }
}

pub mod config {
    //! `post.toml` loading.
    //!
    //! Priority: explicit `--config` path, then `POST_CONFIG`, then `./post.toml`
    //! when present, then built-in defaults.

    use crate::blog::RenderOptions;
    use crate::toc::{TOC_PREVIEW_LIMIT, WalkerKind};
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{
        env, fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const CONFIG_ENV: &str = "POST_CONFIG";
    pub const DEFAULT_CONFIG_FILE: &str = "post.toml";

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PostConfig {
        pub content: ContentConfig,
        pub toc: TocConfig,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ContentConfig {
        /// Directory of post JSON files.
        pub posts_dir: PathBuf,
        pub default_locale: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TocConfig {
        pub walker: WalkerKind,
        pub preview_limit: usize,
    }

    impl Default for ContentConfig {
        fn default() -> Self {
            Self {
                posts_dir: PathBuf::from("posts"),
                default_locale: "en".to_string(),
            }
        }
    }

    impl Default for TocConfig {
        fn default() -> Self {
            Self {
                walker: WalkerKind::default(),
                preview_limit: TOC_PREVIEW_LIMIT,
            }
        }
    }

    impl PostConfig {
        pub fn load(explicit: Option<&Path>) -> Result<Self> {
            let env_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
            match resolve_config_path(explicit, env_path, Path::new(".")) {
                Some(path) => Self::from_file(&path),
                None => {
                    debug!("no config file, using defaults");
                    Ok(Self::default())
                }
            }
        }

        pub fn from_file(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config = Self::from_toml_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
            debug!(path = %path.display(), "loaded config");
            Ok(config)
        }

        pub fn from_toml_str(text: &str) -> Result<Self> {
            Ok(toml::from_str(text)?)
        }

        pub fn to_toml_string(&self) -> Result<String> {
            Ok(toml::to_string_pretty(self)?)
        }

        pub fn render_options(&self) -> RenderOptions {
            RenderOptions {
                walker: self.toc.walker,
                toc_limit: self.toc.preview_limit,
            }
        }
    }

    /// Which file to read, if any. An empty env value counts as unset.
    pub fn resolve_config_path(
        explicit: Option<&Path>,
        env_path: Option<PathBuf>,
        cwd: &Path,
    ) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = env_path.filter(|p| !p.as_os_str().is_empty()) {
            return Some(path);
        }
        let local = cwd.join(DEFAULT_CONFIG_FILE);
        local.is_file().then_some(local)
    }

}

pub use crate::core::{EditError, EditorId, HeadingDescriptor, NodeId, Toc};
pub use blog::{Post, RenderOptions, RenderedPost, render_post};
pub use config::PostConfig;
pub use document::{Document, parse_document, serialize_document};
pub use editor::{Command, Editor, EmbedView, SurfaceRegistry};
pub use storage::{FsPostRepository, PostRepository};
pub use toc::{HtmlWalker, WalkerKind, compact_toc, extract_headings};
