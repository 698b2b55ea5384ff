//! Tree-sitter integration for Java sources
//!
//! The control flow builder consumes the tree read-only. Everything it needs
//! from the grammar lives here: parsing, node handles, procedure discovery
//! and the incomplete-code check.

mod procedures;

pub use procedures::{procedures, Procedure, ProcedureKind};

use std::fmt;

use tree_sitter::{Node, Parser, Tree};

use crate::errors::{FlowError, Result};

/// A parsed Java compilation unit.
pub struct JavaSource {
    tree: Tree,
    source: String,
}

impl JavaSource {
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    pub fn text(&self) -> &str {
        &self.source
    }

    pub fn bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }

    /// All procedure-like fragments of the file, in source order.
    pub fn procedures(&self) -> Vec<Procedure<'_>> {
        procedures(self.root(), self.bytes())
    }

    /// First procedure whose display name or bare name equals `name`.
    pub fn procedure(&self, name: &str) -> Option<Procedure<'_>> {
        self.procedures()
            .into_iter()
            .find(|p| p.name == name || p.name.rsplit('.').next() == Some(name))
    }

    /// Check if the whole tree contains parse errors
    pub fn has_parse_errors(&self) -> bool {
        self.root().has_error()
    }
}

/// Parse Java source code into a tree-sitter AST
pub fn parse_java(content: &str) -> Result<JavaSource> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_java::LANGUAGE.into())
        .map_err(|e| FlowError::parse(format!("Failed to set tree-sitter language: {e}")))?;

    let tree = parser
        .parse(content, None)
        .ok_or_else(|| FlowError::parse("Failed to parse source code"))?;

    Ok(JavaSource {
        tree,
        source: content.to_string(),
    })
}

/// Copyable identity of a syntax node.
///
/// Tree-sitter node ids are unique within a live tree; the kind and byte
/// range are carried along so a handle stays meaningful in diagnostics and
/// is unlikely to alias a node of a different tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SyntaxRef {
    pub id: usize,
    pub kind: &'static str,
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-indexed
    pub line: usize,
}

impl SyntaxRef {
    pub fn of(node: Node<'_>) -> Self {
        Self {
            id: node.id(),
            kind: node.kind(),
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            line: node.start_position().row + 1,
        }
    }

    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        source.get(self.start_byte..self.end_byte).unwrap_or("")
    }
}

impl fmt::Display for SyntaxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}..{} (line {})",
            self.kind, self.start_byte, self.end_byte, self.line
        )
    }
}

impl<'tree> From<Node<'tree>> for SyntaxRef {
    fn from(node: Node<'tree>) -> Self {
        Self::of(node)
    }
}

/// Get text for a tree-sitter node
pub fn node_text<'a>(node: Node<'_>, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

/// Named children, with comments filtered out.
pub fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| !is_comment(*child))
        .collect()
}

/// All children (named and anonymous), in order.
pub fn children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

pub fn children_by_field<'tree>(node: Node<'tree>, field: &str) -> Vec<Node<'tree>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

pub fn first_child_of_kind<'tree>(node: Node<'tree>, kind: &str) -> Option<Node<'tree>> {
    named_children(node).into_iter().find(|c| c.kind() == kind)
}

pub fn is_comment(node: Node<'_>) -> bool {
    matches!(node.kind(), "line_comment" | "block_comment" | "comment")
}

/// Strip `( … )` wrappers.
pub fn skip_parens(mut node: Node<'_>) -> Node<'_> {
    while node.kind() == "parenthesized_expression" {
        match named_children(node).into_iter().next() {
            Some(inner) => node = inner,
            None => break,
        }
    }
    node
}

/// Last segment of a possibly qualified, possibly generic type name.
///
/// `java.io.IOException` and `Foo<Bar>` become `IOException` and `Foo`.
pub fn simple_type_name(text: &str) -> String {
    let without_generics = text.split('<').next().unwrap_or(text);
    without_generics
        .rsplit('.')
        .next()
        .unwrap_or(without_generics)
        .trim()
        .to_string()
}

/// Find the first node that makes `node` unsuitable for flow construction.
///
/// A single `MISSING ";"` that closes its parent is tolerated; any `ERROR`
/// node, any other missing token, or a second missing semicolon is not.
pub fn find_incomplete_code(node: Node<'_>) -> Option<Node<'_>> {
    if !node.has_error() {
        return None;
    }
    let mut tolerated_semicolon = false;
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if current.is_error() {
            return Some(current);
        }
        if current.is_missing() {
            let trailing = current.kind() == ";"
                && current.next_sibling().is_none()
                && current.parent().is_some();
            if trailing && !tolerated_semicolon {
                tolerated_semicolon = true;
                continue;
            }
            return Some(current);
        }
        if current.has_error() {
            let mut kids = children(current);
            kids.reverse();
            stack.extend(kids);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_simple_class() {
        let source = parse_java("class A { void m() { int x = 1; } }").unwrap();
        assert!(!source.has_parse_errors());
        assert_eq!(source.root().kind(), "program");
    }

    #[test]
    fn test_simple_type_name_strips_qualifiers_and_generics() {
        assert_eq!(simple_type_name("java.io.IOException"), "IOException");
        assert_eq!(simple_type_name("List<String>"), "List");
        assert_eq!(simple_type_name("E"), "E");
    }

    #[test]
    fn test_complete_code_has_no_incomplete_node() {
        let source = parse_java(indoc! {"
            class A {
                void m() {
                    foo();
                }
            }
        "})
        .unwrap();
        assert!(find_incomplete_code(source.root()).is_none());
    }

    #[test]
    fn test_single_missing_semicolon_is_tolerated() {
        let source = parse_java(indoc! {"
            class A {
                void m() {
                    int x = 1
                }
            }
        "})
        .unwrap();
        let method = source.procedure("m").unwrap();
        assert!(find_incomplete_code(method.node).is_none());
    }

    #[test]
    fn test_garbage_is_reported() {
        let source = parse_java(indoc! {"
            class A {
                void m() {
                    if (x { ) ) foo(;
                }
            }
        "})
        .unwrap();
        assert!(find_incomplete_code(source.root()).is_some());
    }

    #[test]
    fn test_syntax_ref_text() {
        let text = "class A { void m() { go(); } }";
        let source = parse_java(text).unwrap();
        let method = source.procedure("m").unwrap();
        let handle = SyntaxRef::of(method.node);
        assert_eq!(handle.kind, "method_declaration");
        assert!(handle.text(text).starts_with("void m()"));
        assert_eq!(handle.line, 1);
    }
}
