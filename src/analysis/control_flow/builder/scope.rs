//! Lexical scopes and name resolution for the builder.

use std::collections::{HashMap, HashSet};

use tree_sitter::Node;

use super::constants::Constant;
use crate::analysis::control_flow::instruction::Variable;
use crate::syntax::{children, node_text};

#[derive(Debug, Clone)]
pub(super) struct Declared {
    pub(super) variable: Variable,
    /// Simple names of the caught types, for catch parameters.
    pub(super) catch_types: Vec<String>,
    /// Value of a `final` local with a constant initializer.
    pub(super) constant: Option<Constant>,
}

#[derive(Debug, Default)]
pub(super) struct ScopeStack {
    frames: Vec<HashMap<String, Declared>>,
}

impl ScopeStack {
    pub(super) fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub(super) fn pop(&mut self) {
        self.frames.pop();
    }

    pub(super) fn declare(&mut self, name: &str, declared: Declared) {
        if self.frames.is_empty() {
            self.push();
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), declared);
        }
    }

    pub(super) fn resolve(&self, name: &str) -> Option<&Declared> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }
}

fn is_name_field(node: Node<'_>, parent: Node<'_>) -> bool {
    parent.child_by_field_name("name") == Some(node)
}

/// Whether `identifier` introduces a new name rather than using one.
pub(super) fn is_declaration_name(identifier: Node<'_>) -> bool {
    let Some(parent) = identifier.parent() else {
        return false;
    };
    match parent.kind() {
        "variable_declarator" | "formal_parameter" | "catch_formal_parameter"
        | "enhanced_for_statement" | "resource" | "instanceof_expression"
        | "spread_parameter" | "record_pattern_component" => is_name_field(identifier, parent),
        "inferred_parameters" | "type_pattern" => true,
        "lambda_expression" => parent.child_by_field_name("parameters") == Some(identifier),
        _ => false,
    }
}

/// Whether `identifier` reads or writes a variable.
pub(super) fn is_reference(identifier: Node<'_>) -> bool {
    if is_declaration_name(identifier) {
        return false;
    }
    let Some(parent) = identifier.parent() else {
        return true;
    };
    match parent.kind() {
        "method_invocation" => !is_name_field(identifier, parent),
        "field_access" => parent.child_by_field_name("field") != Some(identifier),
        "method_reference" => {
            let mut cursor = parent.walk();
            let first = parent.named_children(&mut cursor).next();
            first == Some(identifier)
        }
        "labeled_statement" | "break_statement" | "continue_statement" => false,
        "method_declaration" | "class_declaration" | "interface_declaration"
        | "enum_declaration" | "record_declaration" | "constructor_declaration"
        | "enum_constant" | "annotation" | "marker_annotation" | "element_value_pair"
        | "scoped_identifier" => false,
        _ => true,
    }
}

/// Names read from an enclosing scope by a nested body, in source order.
///
/// Names declared anywhere inside the body are excluded, shadowed or not.
pub(super) fn captured_names(body: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut identifiers = Vec::new();
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        if node.kind() == "identifier" {
            identifiers.push(node);
            continue;
        }
        let mut kids = children(node);
        kids.reverse();
        stack.extend(kids);
    }

    let declared: HashSet<&str> = identifiers
        .iter()
        .filter(|id| is_declaration_name(**id))
        .map(|id| node_text(*id, source))
        .collect();

    let mut seen = HashSet::new();
    identifiers
        .iter()
        .filter(|id| is_reference(**id))
        .map(|id| node_text(*id, source))
        .filter(|name| !declared.contains(name))
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::control_flow::instruction::VariableKind;
    use crate::syntax::{parse_java, SyntaxRef};

    #[test]
    fn test_inner_scope_shadows_outer() {
        let source = parse_java("class A { void m() {} }").unwrap();
        let decl = SyntaxRef::of(source.root());
        let mut scopes = ScopeStack::default();
        scopes.push();
        scopes.declare(
            "x",
            Declared {
                variable: Variable::local("x", VariableKind::Parameter, decl),
                catch_types: Vec::new(),
                constant: None,
            },
        );
        scopes.push();
        scopes.declare(
            "x",
            Declared {
                variable: Variable::local("x", VariableKind::Local, decl),
                catch_types: Vec::new(),
                constant: None,
            },
        );
        assert_eq!(
            scopes.resolve("x").map(|d| d.variable.kind),
            Some(VariableKind::Local)
        );
        scopes.pop();
        assert_eq!(
            scopes.resolve("x").map(|d| d.variable.kind),
            Some(VariableKind::Parameter)
        );
        scopes.pop();
        assert!(scopes.resolve("x").is_none());
    }

    #[test]
    fn test_captured_names_skip_inner_declarations_and_method_names() {
        let text = "class A { void m() { Runnable r = () -> { int y = x + z; log(y); }; } }";
        let source = parse_java(text).unwrap();
        let lambda = source.procedure("lambda$1").unwrap();
        let names = captured_names(lambda.node, source.bytes());
        assert_eq!(names, vec!["x".to_string(), "z".to_string()]);
    }
}
