// Shared helpers for ctrlflow integration tests
#![allow(dead_code)]

use ctrlflow::{
    build_flow, parse_java, Cancellation, ControlFlow, FlowOptions, FlowPolicy, JavaSource,
    LocalVariablesPolicy,
};
use tree_sitter::Node;

/// Wrap method declarations in a class so they parse as a compilation unit.
pub fn in_class(members: &str) -> String {
    format!("class T {{\n{members}\n}}")
}

pub fn parse(members: &str) -> JavaSource {
    parse_java(&in_class(members)).expect("source should parse")
}

pub fn build(source: &JavaSource, method: &str, options: FlowOptions) -> ControlFlow {
    build_with(source, method, &LocalVariablesPolicy, options)
}

pub fn build_with(
    source: &JavaSource,
    method: &str,
    policy: &dyn FlowPolicy,
    options: FlowOptions,
) -> ControlFlow {
    let procedure = source
        .procedure(method)
        .unwrap_or_else(|| panic!("no procedure named {method}"));
    build_flow(
        procedure.node,
        source.bytes(),
        policy,
        options,
        &Cancellation::new(),
    )
    .expect("flow should build")
}

/// The flow of `m` in `members`, with default options.
pub fn flow_of(members: &str) -> ControlFlow {
    build(&parse(members), "m", FlowOptions::default())
}

pub fn listing(flow: &ControlFlow) -> Vec<String> {
    (0..flow.size()).map(|i| flow.render(i)).collect()
}

/// Every node of `kind` under `root`, in pre-order.
pub fn nodes_of_kind<'tree>(root: Node<'tree>, kind: &str) -> Vec<Node<'tree>> {
    let mut found = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.kind() == kind {
            found.push(node);
        }
        let mut cursor = node.walk();
        let mut kids: Vec<Node<'tree>> = node.named_children(&mut cursor).collect();
        kids.reverse();
        stack.extend(kids);
    }
    found
}

/// Index of the first instruction whose listing text is `text`.
pub fn index_of(flow: &ControlFlow, text: &str) -> usize {
    (0..flow.size())
        .find(|i| flow.render(*i) == text)
        .unwrap_or_else(|| panic!("no `{text}` in\n{flow}"))
}
