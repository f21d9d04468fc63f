//! Namespace-aware XML document tree.
//!
//! The tree is built from `quick-xml` events. It keeps the lexical prefix of
//! every element and attribute (canonicalization has to reproduce them) next
//! to the resolved namespace URI, and it records which attributes have been
//! tagged as identifier-typed so that `#id` fragment references resolve.
//!
//! Parsing is hardened for attacker-supplied input: document type
//! declarations are rejected outright (no entity expansion), and the number
//! of nodes and the nesting depth are bounded by [`ParseLimits`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use quick_xml::{
    Reader,
    escape::unescape,
    events::{BytesStart, Event},
};

/// The namespace bound to the reserved `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Errors raised while building a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XmlError {
    #[error("XML syntax error at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    #[error("document type declarations are not allowed")]
    DoctypeForbidden,

    #[error("undeclared namespace prefix '{0}'")]
    UnboundPrefix(String),

    #[error("invalid namespace declaration: {0}")]
    InvalidNamespace(String),

    #[error("invalid character data: {0}")]
    InvalidText(String),

    #[error("document has no root element")]
    NoRootElement,

    #[error("unexpected content outside the root element")]
    ContentOutsideRoot,

    #[error("document exceeds the limit of {0} nodes")]
    TooManyNodes(usize),

    #[error("document exceeds the nesting depth limit of {0}")]
    TooDeep(usize),

    #[error("ID value '{0}' is used by more than one element")]
    DuplicateId(String),
}

/// Resource bounds applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Maximum number of nodes (elements, text, comments, PIs).
    pub max_nodes: usize,
    /// Maximum element nesting depth.
    pub max_depth: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_nodes: 100_000,
            max_depth: 128,
        }
    }
}

/// Index of a node inside its [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub enum NodeKind {
    Element(Element),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone)]
pub struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn as_element(&self) -> Option<&Element> {
        match &self.kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }
}

/// An element with its lexical name, resolved namespace and attributes.
#[derive(Debug, Clone)]
pub struct Element {
    prefix: Option<String>,
    local_name: String,
    namespace: Option<String>,
    attributes: Vec<Attribute>,
    /// In-scope namespace bindings keyed by prefix. The default namespace is
    /// keyed by `""`; `xmlns=""` binds it to the empty string.
    namespaces: Arc<BTreeMap<String, String>>,
}

impl Element {
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The name as written in the source (`prefix:local` or `local`).
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local_name),
            None => self.local_name.clone(),
        }
    }

    /// Whether this element is `{namespace}local_name`.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name && self.namespace.as_deref() == Some(namespace)
    }

    /// Attributes excluding namespace declarations.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Value of the un-namespaced attribute `name`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local_name == name)
            .map(|a| a.value.as_str())
    }

    pub fn namespaces_in_scope(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    /// The attribute tagged as this element's identifier, if any.
    pub fn id_attribute(&self) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_id)
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    prefix: Option<String>,
    local_name: String,
    namespace: Option<String>,
    value: String,
    is_id: bool,
}

impl Attribute {
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local_name),
            None => self.local_name.clone(),
        }
    }

    /// Whether this attribute has been tagged as identifier-typed.
    pub fn is_id(&self) -> bool {
        self.is_id
    }
}

/// A parsed XML document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    ids: HashMap<String, NodeId>,
}

impl Document {
    /// Parse with the default [`ParseLimits`].
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        Self::parse_with_limits(xml, ParseLimits::default())
    }

    pub fn parse_with_limits(xml: &str, limits: ParseLimits) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        let mut builder = TreeBuilder::new(limits);

        loop {
            let event = reader.read_event().map_err(|e| XmlError::Syntax {
                position: reader.buffer_position(),
                message: e.to_string(),
            })?;

            match event {
                Event::Decl(_) => {}
                Event::DocType(_) => return Err(XmlError::DoctypeForbidden),
                Event::Start(start) => builder.open(&start, false)?,
                Event::Empty(start) => builder.open(&start, true)?,
                Event::End(_) => builder.close(),
                Event::Text(text) => {
                    let raw = utf8(&text)?;
                    if builder.outside_root() {
                        if !raw.trim().is_empty() {
                            return Err(XmlError::ContentOutsideRoot);
                        }
                        continue;
                    }
                    let normalized = normalize_line_endings(raw);
                    let value = unescape(&normalized)
                        .map_err(|e| XmlError::InvalidText(e.to_string()))?;
                    builder.text(&value)?;
                }
                Event::CData(data) => {
                    if builder.outside_root() {
                        return Err(XmlError::ContentOutsideRoot);
                    }
                    builder.text(&normalize_line_endings(utf8(&data)?))?;
                }
                Event::Comment(comment) => {
                    // Comments outside the root element never take part in
                    // any canonicalized subtree.
                    if !builder.outside_root() {
                        let value = normalize_line_endings(utf8(&comment)?);
                        builder.leaf(NodeKind::Comment(value))?;
                    }
                }
                Event::PI(pi) => {
                    if !builder.outside_root() {
                        let target = utf8(pi.target())?.to_string();
                        let data = normalize_line_endings(utf8(pi.content())?.trim_start());
                        builder.leaf(NodeKind::ProcessingInstruction { target, data })?;
                    }
                }
                Event::Eof => break,
            }
        }

        builder.finish()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The element stored at `id`, or `None` for non-element nodes.
    pub fn element(&self, id: NodeId) -> Option<&Element> {
        self.node(id).as_element()
    }

    /// All nodes below `id` (inclusive) in document order.
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        Descendants {
            document: self,
            stack: vec![id],
        }
    }

    /// Child elements of `id`.
    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id)
            .children
            .iter()
            .copied()
            .filter(|child| self.element(*child).is_some())
    }

    /// First child element named `{namespace}local_name`.
    pub fn find_child(&self, id: NodeId, namespace: &str, local_name: &str) -> Option<NodeId> {
        self.child_elements(id)
            .find(|child| self.element(*child).is_some_and(|e| e.is(namespace, local_name)))
    }

    /// First element named `{namespace}local_name` below `id`, in document order.
    pub fn find_descendant(
        &self,
        id: NodeId,
        namespace: &str,
        local_name: &str,
    ) -> Option<NodeId> {
        self.descendants(id)
            .find(|node| self.element(*node).is_some_and(|e| e.is(namespace, local_name)))
    }

    /// Concatenated text of all text nodes below `id`.
    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .filter_map(|node| match &self.node(node).kind {
                NodeKind::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Character data of a simple-content element: its direct text children,
    /// with comments and processing instructions skipped.
    ///
    /// `None` when the element has element children, so values read from a
    /// signed element cannot pick up text from a nested subtree.
    pub fn leaf_text(&self, id: NodeId) -> Option<String> {
        let mut text = String::new();
        for child in &self.node(id).children {
            match &self.node(*child).kind {
                NodeKind::Text(value) => text.push_str(value),
                NodeKind::Element(_) => return None,
                NodeKind::Comment(_) | NodeKind::ProcessingInstruction { .. } => {}
            }
        }
        Some(text)
    }

    /// Tag every attribute whose un-namespaced name is in `names` as the
    /// identifier-typed attribute of its element, over the whole document.
    ///
    /// Returns the number of tagged elements. Fails if two elements carry the
    /// same identifier value, since a fragment reference would be ambiguous.
    pub fn tag_id_attributes(&mut self, names: &[String]) -> Result<usize, XmlError> {
        let mut ids = HashMap::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let NodeKind::Element(element) = &mut node.kind else {
                continue;
            };
            let Some(attribute) = element.attributes.iter_mut().find(|a| {
                a.namespace.is_none() && names.iter().any(|name| *name == a.local_name)
            }) else {
                continue;
            };
            if ids.insert(attribute.value.clone(), NodeId(index)).is_some() {
                return Err(XmlError::DuplicateId(attribute.value.clone()));
            }
            attribute.is_id = true;
        }
        let tagged = ids.len();
        self.ids = ids;
        Ok(tagged)
    }

    /// Resolve an identifier previously tagged by [`Self::tag_id_attributes`].
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.ids.get(id).copied()
    }
}

/// Pre-order iterator returned by [`Document::descendants`].
pub struct Descendants<'a> {
    document: &'a Document,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.document.node(id).children.iter().rev().copied());
        Some(id)
    }
}

struct TreeBuilder {
    limits: ParseLimits,
    nodes: Vec<Node>,
    open: Vec<NodeId>,
    root: Option<NodeId>,
    base_namespaces: Arc<BTreeMap<String, String>>,
}

impl TreeBuilder {
    fn new(limits: ParseLimits) -> Self {
        let base = BTreeMap::from([("xml".to_string(), XML_NAMESPACE.to_string())]);
        Self {
            limits,
            nodes: Vec::new(),
            open: Vec::new(),
            root: None,
            base_namespaces: Arc::new(base),
        }
    }

    fn outside_root(&self) -> bool {
        self.open.is_empty()
    }

    fn push(&mut self, kind: NodeKind) -> Result<NodeId, XmlError> {
        if self.nodes.len() >= self.limits.max_nodes {
            return Err(XmlError::TooManyNodes(self.limits.max_nodes));
        }
        let id = NodeId(self.nodes.len());
        let parent = self.open.last().copied();
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            kind,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        Ok(id)
    }

    fn leaf(&mut self, kind: NodeKind) -> Result<(), XmlError> {
        self.push(kind).map(|_| ())
    }

    fn text(&mut self, value: &str) -> Result<(), XmlError> {
        // Adjacent text and CDATA sections form a single text node.
        if let Some(parent) = self.open.last()
            && let Some(last) = self.nodes[parent.0].children.last().copied()
            && let NodeKind::Text(existing) = &mut self.nodes[last.0].kind
        {
            existing.push_str(value);
            return Ok(());
        }
        self.leaf(NodeKind::Text(value.to_string()))
    }

    fn open(&mut self, start: &BytesStart<'_>, empty: bool) -> Result<(), XmlError> {
        if self.open.is_empty() && self.root.is_some() {
            return Err(XmlError::ContentOutsideRoot);
        }
        if self.open.len() >= self.limits.max_depth {
            return Err(XmlError::TooDeep(self.limits.max_depth));
        }

        let inherited = match self.open.last() {
            Some(parent) => match &self.nodes[parent.0].kind {
                NodeKind::Element(element) => element.namespaces.clone(),
                _ => self.base_namespaces.clone(),
            },
            None => self.base_namespaces.clone(),
        };

        let mut declarations: Vec<(String, String)> = Vec::new();
        let mut raw_attributes: Vec<(Option<String>, String, String)> = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| XmlError::Syntax {
                position: 0,
                message: e.to_string(),
            })?;
            let key = utf8(attribute.key.as_ref())?;
            let value = attribute_value(utf8(&attribute.value)?)?;
            match split_qname(key) {
                (None, "xmlns") => declarations.push((String::new(), value)),
                (Some("xmlns"), prefix) => {
                    if value.is_empty() {
                        return Err(XmlError::InvalidNamespace(format!(
                            "prefix '{prefix}' cannot be undeclared"
                        )));
                    }
                    if prefix == "xmlns" || (prefix == "xml" && value != XML_NAMESPACE) {
                        return Err(XmlError::InvalidNamespace(format!(
                            "reserved prefix '{prefix}'"
                        )));
                    }
                    declarations.push((prefix.to_string(), value));
                }
                (prefix, local) => {
                    raw_attributes.push((prefix.map(str::to_string), local.to_string(), value))
                }
            }
        }

        let namespaces = if declarations.is_empty() {
            inherited
        } else {
            let mut scope = (*inherited).clone();
            scope.extend(declarations);
            Arc::new(scope)
        };

        let qname = start.name();
        let name = utf8(qname.as_ref())?;
        let (prefix, local_name) = split_qname(name);
        let namespace = resolve(&namespaces, prefix)?;

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (prefix, local_name, value) in raw_attributes {
            let namespace = match prefix.as_deref() {
                Some(p) => resolve(&namespaces, Some(p))?,
                None => None,
            };
            attributes.push(Attribute {
                prefix,
                local_name,
                namespace,
                value,
                is_id: false,
            });
        }

        let id = self.push(NodeKind::Element(Element {
            prefix: prefix.map(str::to_string),
            local_name: local_name.to_string(),
            namespace,
            attributes,
            namespaces,
        }))?;

        if self.open.is_empty() {
            self.root = Some(id);
        }
        if !empty {
            self.open.push(id);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.open.pop();
    }

    fn finish(self) -> Result<Document, XmlError> {
        let root = self.root.ok_or(XmlError::NoRootElement)?;
        if !self.open.is_empty() {
            return Err(XmlError::Syntax {
                position: 0,
                message: "unclosed element at end of input".to_string(),
            });
        }
        Ok(Document {
            nodes: self.nodes,
            root,
            ids: HashMap::new(),
        })
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(|e| XmlError::InvalidText(e.to_string()))
}

fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}

fn resolve(
    namespaces: &BTreeMap<String, String>,
    prefix: Option<&str>,
) -> Result<Option<String>, XmlError> {
    match prefix {
        Some(prefix) => namespaces
            .get(prefix)
            .map(|uri| Some(uri.clone()))
            .ok_or_else(|| XmlError::UnboundPrefix(prefix.to_string())),
        None => Ok(namespaces.get("").filter(|uri| !uri.is_empty()).cloned()),
    }
}

/// Line-ending normalization (XML 1.0 §2.11).
fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Attribute-value normalization for CDATA attributes (XML 1.0 §3.3.3):
/// literal whitespace characters become spaces before references are
/// expanded, so `&#10;` survives as a line feed.
fn attribute_value(raw: &str) -> Result<String, XmlError> {
    let normalized: String = normalize_line_endings(raw)
        .chars()
        .map(|c| if matches!(c, '\n' | '\t') { ' ' } else { c })
        .collect();
    unescape(&normalized)
        .map(|value| value.into_owned())
        .map_err(|e| XmlError::InvalidText(e.to_string()))
}
