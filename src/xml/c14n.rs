//! Canonical XML 1.0 and Exclusive XML Canonicalization 1.0 serializers.
//!
//! Both operate on a document subset rooted at an apex element, optionally
//! excluding one subtree (the enveloped signature).

use std::collections::BTreeMap;

use super::document::{Document, Element, NodeId, NodeKind, XML_NAMESPACE};

pub const C14N_10: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_10_WITH_COMMENTS: &str =
    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub const EXC_C14N_10: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXC_C14N_10_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C14nAlgorithm {
    Inclusive,
    InclusiveWithComments,
    Exclusive,
    ExclusiveWithComments,
}

impl C14nAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            C14N_10 => Some(Self::Inclusive),
            C14N_10_WITH_COMMENTS => Some(Self::InclusiveWithComments),
            EXC_C14N_10 => Some(Self::Exclusive),
            EXC_C14N_10_WITH_COMMENTS => Some(Self::ExclusiveWithComments),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::Inclusive => C14N_10,
            Self::InclusiveWithComments => C14N_10_WITH_COMMENTS,
            Self::Exclusive => EXC_C14N_10,
            Self::ExclusiveWithComments => EXC_C14N_10_WITH_COMMENTS,
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive | Self::ExclusiveWithComments)
    }

    pub fn with_comments(self) -> bool {
        matches!(self, Self::InclusiveWithComments | Self::ExclusiveWithComments)
    }
}

/// Serializes a document subset in canonical form.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    algorithm: C14nAlgorithm,
    inclusive_prefixes: Vec<String>,
    exclude: Option<NodeId>,
    comments: bool,
}

impl Canonicalizer {
    pub fn new(algorithm: C14nAlgorithm) -> Self {
        Self {
            algorithm,
            inclusive_prefixes: Vec::new(),
            exclude: None,
            comments: algorithm.with_comments(),
        }
    }

    /// Prefixes handled with inclusive rules under exclusive canonicalization
    /// (the `InclusiveNamespaces PrefixList`). `#default` names the default
    /// namespace. Ignored by the inclusive algorithms.
    pub fn with_inclusive_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inclusive_prefixes = prefixes
            .into_iter()
            .map(|p| match p.as_ref() {
                "#default" => String::new(),
                other => other.to_string(),
            })
            .collect();
        self
    }

    /// Leave the subtree rooted at `node` out of the output.
    pub fn excluding(mut self, node: NodeId) -> Self {
        self.exclude = Some(node);
        self
    }

    /// Drop comments even for a `#WithComments` algorithm. Same-document
    /// references (`""`, `#id`) select a node-set without comments.
    pub fn without_comments(mut self) -> Self {
        self.comments = false;
        self
    }

    pub fn canonicalize(&self, document: &Document, apex: NodeId) -> String {
        let mut out = String::new();
        self.write_node(document, apex, &BTreeMap::new(), true, &mut out);
        out
    }

    fn write_node(
        &self,
        document: &Document,
        id: NodeId,
        rendered: &BTreeMap<String, String>,
        is_apex: bool,
        out: &mut String,
    ) {
        if self.exclude == Some(id) {
            return;
        }
        match document.node(id).kind() {
            NodeKind::Element(element) => {
                self.write_element(document, id, element, rendered, is_apex, out)
            }
            NodeKind::Text(text) => escape_text(text, out),
            NodeKind::Comment(comment) => {
                if self.comments {
                    out.push_str("<!--");
                    out.push_str(comment);
                    out.push_str("-->");
                }
            }
            NodeKind::ProcessingInstruction { target, data } => {
                out.push_str("<?");
                out.push_str(target);
                if !data.is_empty() {
                    out.push(' ');
                    out.push_str(data);
                }
                out.push_str("?>");
            }
        }
    }

    fn write_element(
        &self,
        document: &Document,
        id: NodeId,
        element: &Element,
        rendered: &BTreeMap<String, String>,
        is_apex: bool,
        out: &mut String,
    ) {
        let declarations = self.namespace_declarations(element, rendered);
        let name = element.qualified_name();

        out.push('<');
        out.push_str(&name);
        for (prefix, uri) in &declarations {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            escape_attribute(uri, out);
            out.push('"');
        }

        let mut attributes: Vec<(&str, &str, String, &str)> = element
            .attributes()
            .iter()
            .map(|a| {
                (
                    a.namespace().unwrap_or(""),
                    a.local_name(),
                    a.qualified_name(),
                    a.value(),
                )
            })
            .collect();
        if is_apex && !self.algorithm.is_exclusive() {
            inherit_xml_attributes(document, id, &mut attributes);
        }
        attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for (_, _, qname, value) in &attributes {
            out.push(' ');
            out.push_str(qname);
            out.push_str("=\"");
            escape_attribute(value, out);
            out.push('"');
        }
        out.push('>');

        let scope;
        let rendered = if declarations.is_empty() {
            rendered
        } else {
            let mut extended = rendered.clone();
            extended.extend(declarations);
            scope = extended;
            &scope
        };
        for child in document.node(id).children() {
            self.write_node(document, *child, rendered, false, out);
        }

        out.push_str("</");
        out.push_str(&name);
        out.push('>');
    }

    /// Namespace declarations to emit on `element`, sorted by prefix with the
    /// default namespace first.
    fn namespace_declarations(
        &self,
        element: &Element,
        rendered: &BTreeMap<String, String>,
    ) -> Vec<(String, String)> {
        let in_scope = element.namespaces_in_scope();
        let mut wanted: BTreeMap<String, String> = BTreeMap::new();

        if self.algorithm.is_exclusive() {
            let utilized = std::iter::once(element.prefix().unwrap_or(""))
                .chain(element.attributes().iter().filter_map(|a| a.prefix()))
                .chain(self.inclusive_prefixes.iter().map(String::as_str));
            for prefix in utilized {
                if prefix == "xml" {
                    continue;
                }
                match in_scope.get(prefix) {
                    Some(uri) => {
                        wanted.insert(prefix.to_string(), uri.clone());
                    }
                    None if prefix.is_empty() => {
                        wanted.insert(String::new(), String::new());
                    }
                    None => {}
                }
            }
        } else {
            for (prefix, uri) in in_scope {
                if prefix != "xml" {
                    wanted.insert(prefix.clone(), uri.clone());
                }
            }
            wanted.entry(String::new()).or_default();
        }

        wanted
            .into_iter()
            .filter(|(prefix, uri)| match rendered.get(prefix) {
                Some(current) => current != uri,
                // An empty default only needs emitting to undo a rendered one.
                None => !(prefix.is_empty() && uri.is_empty()),
            })
            .collect()
    }
}

/// Canonical XML 1.0 carries `xml:*` attributes of omitted ancestors onto
/// the apex element; the nearest ancestor wins.
fn inherit_xml_attributes<'a>(
    document: &'a Document,
    apex: NodeId,
    attributes: &mut Vec<(&'a str, &'a str, String, &'a str)>,
) {
    let mut current = document.node(apex).parent();
    while let Some(id) = current {
        if let Some(ancestor) = document.element(id) {
            for attribute in ancestor.attributes() {
                if attribute.namespace() != Some(XML_NAMESPACE) {
                    continue;
                }
                let present = attributes
                    .iter()
                    .any(|a| a.0 == XML_NAMESPACE && a.1 == attribute.local_name());
                if !present {
                    attributes.push((
                        XML_NAMESPACE,
                        attribute.local_name(),
                        attribute.qualified_name(),
                        attribute.value(),
                    ));
                }
            }
        }
        current = document.node(id).parent();
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn canonical(xml: &str, algorithm: C14nAlgorithm) -> String {
        let doc = Document::parse(xml).unwrap();
        Canonicalizer::new(algorithm).canonicalize(&doc, doc.root())
    }

    fn canonical_subtree(xml: &str, local_name: &str, canonicalizer: &Canonicalizer) -> String {
        let doc = Document::parse(xml).unwrap();
        let node = doc
            .descendants(doc.root())
            .find(|n| {
                doc.element(*n)
                    .is_some_and(|e| e.local_name() == local_name)
            })
            .unwrap();
        canonicalizer.canonicalize(&doc, node)
    }

    #[test]
    fn test_empty_elements_and_attribute_order() {
        let xml = r#"<doc xmlns:b="urn:b" xmlns:a="urn:a" z="1" b:y="2" a:x="3" y='"q"'><e/></doc>"#;
        assert_eq!(
            canonical(xml, C14nAlgorithm::Inclusive),
            r#"<doc xmlns:a="urn:a" xmlns:b="urn:b" y="&quot;q&quot;" z="1" a:x="3" b:y="2"><e></e></doc>"#
        );
    }

    #[test]
    fn test_character_escaping() {
        let xml = "<a t=\"&lt;&amp;&gt;&#9;&#13;\">&lt;&amp;&gt;&quot;&#13;</a>";
        assert_eq!(
            canonical(xml, C14nAlgorithm::Inclusive),
            "<a t=\"&lt;&amp;>&#x9;&#xD;\">&lt;&amp;&gt;\"&#xD;</a>"
        );
    }

    #[test]
    fn test_declaration_and_outer_comments_are_dropped() {
        let xml = "<?xml version=\"1.0\"?>\n<!-- outside -->\n<a><!-- in --><?pi  data ?></a>";
        assert_eq!(
            canonical(xml, C14nAlgorithm::Inclusive),
            "<a><?pi data ?></a>"
        );
        assert_eq!(
            canonical(xml, C14nAlgorithm::InclusiveWithComments),
            "<a><!-- in --><?pi data ?></a>"
        );
    }

    #[test]
    fn test_superfluous_declarations_are_removed() {
        let xml = r#"<a xmlns="urn:x" xmlns:p="urn:p"><b xmlns="urn:x"><p:c xmlns:p="urn:p"/></b></a>"#;
        assert_eq!(
            canonical(xml, C14nAlgorithm::Inclusive),
            r#"<a xmlns="urn:x" xmlns:p="urn:p"><b><p:c></p:c></b></a>"#
        );
    }

    #[test]
    fn test_default_namespace_undeclaration() {
        let xml = r#"<a xmlns="urn:x"><b xmlns=""><c xmlns=""/></b></a>"#;
        assert_eq!(
            canonical(xml, C14nAlgorithm::Inclusive),
            r#"<a xmlns="urn:x"><b xmlns=""><c></c></b></a>"#
        );
    }

    #[test]
    fn test_inclusive_subset_carries_inherited_context() {
        let xml = r#"<r xmlns:p="urn:p" xmlns:unused="urn:u" xml:lang="en"><p:s ID="1">v</p:s></r>"#;
        let c = Canonicalizer::new(C14nAlgorithm::Inclusive);
        assert_eq!(
            canonical_subtree(xml, "s", &c),
            r#"<p:s xmlns:p="urn:p" xmlns:unused="urn:u" ID="1" xml:lang="en">v</p:s>"#
        );
    }

    #[test]
    fn test_exclusive_subset_renders_only_utilized_namespaces() {
        let xml = r#"<r xmlns:p="urn:p" xmlns:unused="urn:u" xmlns:q="urn:q" xml:lang="en"><p:s ID="1"><q:t/><p:u/></p:s></r>"#;
        let c = Canonicalizer::new(C14nAlgorithm::Exclusive);
        assert_eq!(
            canonical_subtree(xml, "s", &c),
            r#"<p:s xmlns:p="urn:p" ID="1"><q:t xmlns:q="urn:q"></q:t><p:u></p:u></p:s>"#
        );
    }

    #[test]
    fn test_exclusive_inclusive_prefix_list() {
        let xml = r#"<r xmlns:p="urn:p" xmlns:unused="urn:u" xmlns="urn:d"><p:s/></r>"#;
        let c = Canonicalizer::new(C14nAlgorithm::Exclusive)
            .with_inclusive_prefixes(["unused", "#default"]);
        assert_eq!(
            canonical_subtree(xml, "s", &c),
            r#"<p:s xmlns="urn:d" xmlns:p="urn:p" xmlns:unused="urn:u"></p:s>"#
        );
    }

    #[test]
    fn test_exclusive_redeclares_in_sibling_subtrees() {
        let xml = r#"<r xmlns:q="urn:q"><a><q:b/></a><c><q:d/></c></r>"#;
        assert_eq!(
            canonical(xml, C14nAlgorithm::Exclusive),
            r#"<r><a><q:b xmlns:q="urn:q"></q:b></a><c><q:d xmlns:q="urn:q"></q:d></c></r>"#
        );
    }

    #[test]
    fn test_excluded_subtree_is_omitted() {
        let xml = "<a>\n  <keep/>\n  <drop><x/></drop>\n</a>";
        let doc = Document::parse(xml).unwrap();
        let drop = doc
            .descendants(doc.root())
            .find(|n| doc.element(*n).is_some_and(|e| e.local_name() == "drop"))
            .unwrap();
        let out = Canonicalizer::new(C14nAlgorithm::Exclusive)
            .excluding(drop)
            .canonicalize(&doc, doc.root());
        assert_eq!(out, "<a>\n  <keep></keep>\n  \n</a>");
    }

    #[rstest]
    #[case(C14nAlgorithm::InclusiveWithComments)]
    #[case(C14nAlgorithm::ExclusiveWithComments)]
    fn test_without_comments_overrides_algorithm(#[case] algorithm: C14nAlgorithm) {
        let doc = Document::parse("<a><!--c-->t</a>").unwrap();
        let c = Canonicalizer::new(algorithm);
        assert_eq!(c.canonicalize(&doc, doc.root()), "<a><!--c-->t</a>");
        assert_eq!(
            c.without_comments().canonicalize(&doc, doc.root()),
            "<a>t</a>"
        );
    }

    #[rstest]
    #[case(C14N_10, C14nAlgorithm::Inclusive)]
    #[case(C14N_10_WITH_COMMENTS, C14nAlgorithm::InclusiveWithComments)]
    #[case(EXC_C14N_10, C14nAlgorithm::Exclusive)]
    #[case(EXC_C14N_10_WITH_COMMENTS, C14nAlgorithm::ExclusiveWithComments)]
    fn test_algorithm_uris(#[case] uri: &str, #[case] algorithm: C14nAlgorithm) {
        assert_eq!(C14nAlgorithm::from_uri(uri), Some(algorithm));
        assert_eq!(algorithm.uri(), uri);
    }

    #[test]
    fn test_unknown_algorithm_uri() {
        assert_eq!(
            C14nAlgorithm::from_uri("http://www.w3.org/2006/12/xml-c14n11"),
            None
        );
    }
}
