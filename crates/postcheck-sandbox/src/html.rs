//! Minimal HTML document model for `pm.parseHTML` and `pm.response.html()`.
//!
//! The parser is lenient: it never fails, recovers from stray end tags, and
//! closes whatever is left open at end of input. Documents are arenas of
//! nodes addressed by [`NodeId`]; the JS side holds `(document, node)` handles
//! and asks the host for snapshots and selector matches.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Index of a node within its [`Document`].
pub type NodeId = usize;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

/// Errors from parsing a CSS selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// The selector (or one of its comma groups) is empty.
    #[error("empty selector")]
    Empty,
    /// A character that cannot start or continue a selector.
    #[error("unexpected character '{ch}' at position {pos} in selector")]
    Unexpected {
        /// The offending character.
        ch: char,
        /// Character position.
        pos: usize,
    },
    /// An `[attr` without a closing bracket.
    #[error("unterminated attribute selector")]
    UnterminatedAttribute,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A parsed HTML document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

/// Serializable view of one element handed to the JS surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
    /// Node handle.
    pub node: NodeId,
    /// Upper-case tag name.
    pub tag_name: String,
    /// `id` attribute or `""`.
    pub id: String,
    /// `class` attribute or `""`.
    pub class_name: String,
    /// All attributes.
    pub attributes: BTreeMap<String, String>,
    /// Concatenated descendant text.
    pub text_content: String,
    /// Serialized children.
    #[serde(rename = "innerHTML")]
    pub inner_html: String,
    /// Serialized element.
    #[serde(rename = "outerHTML")]
    pub outer_html: String,
}

impl Document {
    /// The document node.
    pub const ROOT: NodeId = 0;

    /// Parse markup. Never fails.
    pub fn parse(markup: &str) -> Self {
        let mut builder = TreeBuilder {
            doc: Document {
                nodes: vec![Node {
                    kind: NodeKind::Document,
                    parent: None,
                    children: Vec::new(),
                }],
            },
            open: vec![Self::ROOT],
        };
        builder.run(markup);
        builder.doc
    }

    fn is_element(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(id).map(|n| &n.kind),
            Some(NodeKind::Element { .. })
        )
    }

    fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Whether `id` names a node of this document.
    pub fn contains(&self, id: NodeId) -> bool {
        id < self.nodes.len()
    }

    /// Attribute value of an element.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Element children of `id`, in document order.
    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(id)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|&c| self.is_element(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Concatenated text of `id` and its descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Comment(_) => {}
            _ => {
                for &child in &node.children {
                    self.collect_text(child, out);
                }
            }
        }
    }

    /// Serialized children of `id`.
    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let Some(node) = self.nodes.get(id) {
            let raw = self.tag(id).is_some_and(|t| RAW_TEXT_ELEMENTS.contains(&t));
            for &child in &node.children {
                self.serialize(child, raw, &mut out);
            }
        }
        out
    }

    /// Serialized `id`, including its own tag.
    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.serialize(id, false, &mut out);
        out
    }

    fn serialize(&self, id: NodeId, raw_text: bool, out: &mut String) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Document => {
                for &child in &node.children {
                    self.serialize(child, false, out);
                }
            }
            NodeKind::Text(text) if raw_text => out.push_str(text),
            NodeKind::Text(text) => escape_into(text, false, out),
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    escape_into(value, true, out);
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                let raw = RAW_TEXT_ELEMENTS.contains(&tag.as_str());
                for &child in &node.children {
                    self.serialize(child, raw, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }

    /// Snapshot of an element for the JS surface.
    pub fn snapshot(&self, id: NodeId) -> Option<ElementSnapshot> {
        let NodeKind::Element { tag, attrs } = &self.nodes.get(id)?.kind else {
            return None;
        };
        Some(ElementSnapshot {
            node: id,
            tag_name: tag.to_ascii_uppercase(),
            id: self.attribute(id, "id").unwrap_or_default().to_string(),
            class_name: self.attribute(id, "class").unwrap_or_default().to_string(),
            attributes: attrs.iter().cloned().collect(),
            text_content: self.text_content(id),
            inner_html: self.inner_html(id),
            outer_html: self.outer_html(id),
        })
    }

    /// Elements under `scope` (excluding `scope`) matching `selector`, in
    /// document order. With `all == false` at most one is returned.
    pub fn select(
        &self,
        scope: NodeId,
        selector: &str,
        all: bool,
    ) -> Result<Vec<NodeId>, SelectorError> {
        let groups = parse_selector(selector)?;
        let mut matches = Vec::new();
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(scope)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if self.is_element(id) && groups.iter().any(|g| self.matches_complex(id, g)) {
                matches.push(id);
                if !all {
                    break;
                }
            }
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        Ok(matches)
    }

    fn matches_compound(&self, id: NodeId, compound: &Compound) -> bool {
        let Some(tag) = self.tag(id) else {
            return false;
        };
        if let Some(want) = &compound.tag {
            if want != "*" && !want.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(want) = &compound.id {
            if self.attribute(id, "id") != Some(want.as_str()) {
                return false;
            }
        }
        if !compound.classes.is_empty() {
            let class_attr = self.attribute(id, "class").unwrap_or_default();
            if !compound
                .classes
                .iter()
                .all(|c| class_attr.split_ascii_whitespace().any(|have| have == c))
            {
                return false;
            }
        }
        compound.attrs.iter().all(|a| match (&a.value, self.attribute(id, &a.name)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(want), Some(have)) => want == have,
        })
    }

    fn matches_complex(&self, id: NodeId, selector: &ComplexSelector) -> bool {
        self.matches_from(id, &selector.parts, selector.parts.len() - 1)
    }

    fn matches_from(&self, id: NodeId, parts: &[(Combinator, Compound)], index: usize) -> bool {
        let (combinator, compound) = &parts[index];
        if !self.matches_compound(id, compound) {
            return false;
        }
        if index == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => self
                .nodes[id]
                .parent
                .is_some_and(|p| self.matches_from(p, parts, index - 1)),
            Combinator::Descendant => {
                let mut ancestor = self.nodes[id].parent;
                while let Some(a) = ancestor {
                    if self.matches_from(a, parts, index - 1) {
                        return true;
                    }
                    ancestor = self.nodes[a].parent;
                }
                false
            }
        }
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

struct TreeBuilder {
    doc: Document,
    open: Vec<NodeId>,
}

impl TreeBuilder {
    fn current(&self) -> NodeId {
        self.open.last().copied().unwrap_or(Document::ROOT)
    }

    fn append(&mut self, kind: NodeKind) -> NodeId {
        let parent = self.current();
        let id = self.doc.nodes.len();
        self.doc.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.doc.nodes[parent].children.push(id);
        id
    }

    fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let parent = self.current();
        if let Some(&last) = self.doc.nodes[parent].children.last() {
            if let NodeKind::Text(existing) = &mut self.doc.nodes[last].kind {
                existing.push_str(text);
                return;
            }
        }
        self.append(NodeKind::Text(text.to_string()));
    }

    fn close(&mut self, tag: &str) {
        if let Some(pos) = self
            .open
            .iter()
            .rposition(|&id| self.doc.tag(id) == Some(tag))
        {
            self.open.truncate(pos);
        }
    }

    fn close_implied(&mut self, tag: &str) {
        let closes: &[&str] = match tag {
            "li" => &["li"],
            "p" => &["p"],
            "option" => &["option"],
            "tr" => &["tr", "td", "th"],
            "td" | "th" => &["td", "th"],
            "dt" | "dd" => &["dt", "dd"],
            _ => return,
        };
        if let Some(current) = self.doc.tag(self.current()) {
            if closes.contains(&current) {
                self.open.pop();
            }
        }
    }

    fn run(&mut self, input: &str) {
        let mut rest = input;
        while !rest.is_empty() {
            let Some(lt) = rest.find('<') else {
                self.append_text(&decode_entities(rest));
                break;
            };
            self.append_text(&decode_entities(&rest[..lt]));
            rest = &rest[lt..];

            if let Some(body) = rest.strip_prefix("<!--") {
                let end = body.find("-->").unwrap_or(body.len());
                self.append(NodeKind::Comment(body[..end].to_string()));
                rest = body.get(end + 3..).unwrap_or("");
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                let end = rest.find('>').map_or(rest.len(), |e| e + 1);
                rest = &rest[end..];
            } else if let Some(body) = rest.strip_prefix("</") {
                let end = body.find('>').unwrap_or(body.len());
                let name = body[..end].trim().to_ascii_lowercase();
                self.close(&name);
                rest = body.get(end + 1..).unwrap_or("");
            } else if rest[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
                rest = self.start_tag(&rest[1..]);
            } else {
                self.append_text("<");
                rest = &rest[1..];
            }
        }
    }

    /// Parse a start tag from just after `<`. Returns the remaining input.
    fn start_tag<'a>(&mut self, input: &'a str) -> &'a str {
        let name_end = input
            .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
            .unwrap_or(input.len());
        let tag = input[..name_end].to_ascii_lowercase();
        let mut rest = &input[name_end..];
        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            if let Some(after) = rest.strip_prefix('>') {
                rest = after;
                break;
            }
            if let Some(after) = rest.strip_prefix("/>") {
                self_closing = true;
                rest = after;
                break;
            }
            if let Some(after) = rest.strip_prefix('/') {
                rest = after;
                continue;
            }
            let attr_end = rest
                .find(|c: char| c.is_ascii_whitespace() || c == '=' || c == '>' || c == '/')
                .unwrap_or(rest.len());
            let name = rest[..attr_end].to_ascii_lowercase();
            rest = rest[attr_end..].trim_start();
            let mut value = String::new();
            if let Some(after) = rest.strip_prefix('=') {
                let after = after.trim_start();
                if let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') {
                    let body = &after[1..];
                    let end = body.find(quote).unwrap_or(body.len());
                    value = decode_entities(&body[..end]);
                    rest = body.get(end + 1..).unwrap_or("");
                } else {
                    let end = after
                        .find(|c: char| c.is_ascii_whitespace() || c == '>')
                        .unwrap_or(after.len());
                    value = decode_entities(&after[..end]);
                    rest = &after[end..];
                }
            }
            if !name.is_empty() && !attrs.iter().any(|(k, _)| *k == name) {
                attrs.push((name, value));
            }
        }

        self.close_implied(&tag);
        let id = self.append(NodeKind::Element {
            tag: tag.clone(),
            attrs,
        });
        if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
            return rest;
        }
        if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            let close = format!("</{tag}");
            let end = rest
                .to_ascii_lowercase()
                .find(&close)
                .unwrap_or(rest.len());
            if end > 0 {
                let text = if tag == "textarea" || tag == "title" {
                    decode_entities(&rest[..end])
                } else {
                    rest[..end].to_string()
                };
                self.open.push(id);
                self.append_text(&text);
                self.open.pop();
            }
            let after = &rest[end..];
            return after.find('>').map_or("", |gt| &after[gt + 1..]);
        }
        self.open.push(id);
        rest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default)]
struct AttrSelector {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrSelector>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attrs.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ComplexSelector {
    parts: Vec<(Combinator, Compound)>,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn parse_selector(input: &str) -> Result<Vec<ComplexSelector>, SelectorError> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut groups = Vec::new();
    let mut parts: Vec<(Combinator, Compound)> = Vec::new();
    let mut current = Compound::default();
    let mut pending = Combinator::Descendant;

    let ident = |pos: &mut usize| -> String {
        let start = *pos;
        while *pos < chars.len() && is_ident_char(chars[*pos]) {
            *pos += 1;
        }
        chars[start..*pos].iter().collect()
    };

    let finish_compound =
        |parts: &mut Vec<(Combinator, Compound)>, current: &mut Compound, comb: Combinator| {
            if !current.is_empty() {
                parts.push((comb, std::mem::take(current)));
            }
        };

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            c if c.is_whitespace() || c == '>' || c == ',' => {
                let had_compound = !current.is_empty();
                finish_compound(&mut parts, &mut current, pending);
                let mut child = false;
                let mut comma = false;
                while pos < chars.len() {
                    match chars[pos] {
                        w if w.is_whitespace() => {}
                        '>' => child = true,
                        ',' => comma = true,
                        _ => break,
                    }
                    pos += 1;
                }
                if comma {
                    if parts.is_empty() || child {
                        return Err(SelectorError::Empty);
                    }
                    groups.push(ComplexSelector {
                        parts: std::mem::take(&mut parts),
                    });
                    pending = Combinator::Descendant;
                } else {
                    if child && !had_compound {
                        return Err(SelectorError::Unexpected { ch: '>', pos });
                    }
                    pending = if child {
                        Combinator::Child
                    } else {
                        Combinator::Descendant
                    };
                }
            }
            '*' => {
                current.tag = Some("*".into());
                pos += 1;
            }
            '#' | '.' => {
                pos += 1;
                let name = ident(&mut pos);
                if name.is_empty() {
                    return Err(SelectorError::Unexpected { ch: c, pos: pos - 1 });
                }
                if c == '#' {
                    current.id = Some(name);
                } else {
                    current.classes.push(name);
                }
            }
            '[' => {
                pos += 1;
                let close = chars[pos..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .ok_or(SelectorError::UnterminatedAttribute)?;
                let body: String = chars[pos..pos + close].iter().collect();
                let (name, value) = match body.split_once('=') {
                    Some((n, v)) => {
                        let v = v.trim();
                        let v = v
                            .strip_prefix('"')
                            .and_then(|s| s.strip_suffix('"'))
                            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                            .unwrap_or(v);
                        (n.trim().to_string(), Some(v.to_string()))
                    }
                    None => (body.trim().to_string(), None),
                };
                if name.is_empty() || !name.chars().all(is_ident_char) {
                    return Err(SelectorError::Unexpected { ch: '[', pos: pos - 1 });
                }
                current.attrs.push(AttrSelector { name, value });
                pos += close + 1;
            }
            c if is_ident_char(c) => {
                current.tag = Some(ident(&mut pos).to_ascii_lowercase());
            }
            other => return Err(SelectorError::Unexpected { ch: other, pos }),
        }
    }
    finish_compound(&mut parts, &mut current, pending);
    if parts.is_empty() {
        return Err(SelectorError::Empty);
    }
    groups.push(ComplexSelector { parts });
    Ok(groups)
}
