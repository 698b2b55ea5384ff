//! Discovery of procedure-like fragments in a compilation unit.

use tree_sitter::Node;

use super::{named_children, node_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    Method,
    Constructor,
    StaticInitializer,
    InstanceInitializer,
    Lambda,
}

/// A fragment that can be handed to the flow builder.
#[derive(Debug, Clone)]
pub struct Procedure<'tree> {
    pub node: Node<'tree>,
    pub kind: ProcedureKind,
    pub name: String,
}

/// Collect every procedure under `root`, in source order.
///
/// Names are qualified by the enclosing type names, e.g. `Outer.Inner.run`.
pub fn procedures<'tree>(root: Node<'tree>, source: &[u8]) -> Vec<Procedure<'tree>> {
    let mut out = Vec::new();
    let mut owners = Vec::new();
    collect(root, source, &mut owners, &mut out);
    out
}

fn collect<'tree>(
    node: Node<'tree>,
    source: &[u8],
    owners: &mut Vec<String>,
    out: &mut Vec<Procedure<'tree>>,
) {
    let kind = node.kind();
    let mut pushed_owner = false;

    match kind {
        "class_declaration" | "interface_declaration" | "enum_declaration"
        | "record_declaration" | "annotation_type_declaration" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())
                .unwrap_or_else(|| "<unnamed>".to_string());
            owners.push(name);
            pushed_owner = true;
        }
        "object_creation_expression" => {
            if named_children(node).iter().any(|c| c.kind() == "class_body") {
                owners.push("<anonymous>".to_string());
                pushed_owner = true;
            }
        }
        "method_declaration" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source))
                .unwrap_or("<unnamed>");
            push(out, node, ProcedureKind::Method, owners, name);
        }
        "constructor_declaration" | "compact_constructor_declaration" => {
            push(out, node, ProcedureKind::Constructor, owners, "<init>");
        }
        "static_initializer" => {
            push(out, node, ProcedureKind::StaticInitializer, owners, "<clinit>");
        }
        "block" if node.parent().map(|p| p.kind()) == Some("class_body") => {
            push(out, node, ProcedureKind::InstanceInitializer, owners, "<init-block>");
        }
        "lambda_expression" => {
            let label = format!("lambda${}", node.start_position().row + 1);
            push(out, node, ProcedureKind::Lambda, owners, &label);
        }
        _ => {}
    }

    for child in named_children(node) {
        collect(child, source, owners, out);
    }

    if pushed_owner {
        owners.pop();
    }
}

fn push<'tree>(
    out: &mut Vec<Procedure<'tree>>,
    node: Node<'tree>,
    kind: ProcedureKind,
    owners: &[String],
    name: &str,
) {
    let mut qualified = owners.join(".");
    if !qualified.is_empty() {
        qualified.push('.');
    }
    qualified.push_str(name);
    out.push(Procedure {
        node,
        kind,
        name: qualified,
    });
}
