mod common;

use std::collections::HashMap;

use common::{build, index_of, listing, nodes_of_kind, parse};
use ctrlflow::{reachable, reachable_assuming, FlowOptions, Instruction, SyntaxRef};
use indoc::indoc;
use pretty_assertions::assert_eq;
use tree_sitter::Node;

const MIXED: &str = indoc! {"
    int m(int a, boolean c, int[] xs) {
        int total = 0;
        outer:
        for (int i = 0; i < a; i++) {
            if (c) { continue; }
            for (int x : xs) {
                if (x < 0) break outer;
                total += x;
            }
        }
        do { total--; } while (total > 100);
        switch (a) {
            case 1: total = 1;
            case 2: { total = 2; break; }
            default: ;
        }
        try {
            synchronized (this) { total = use(total); }
        } catch (IllegalStateException e) {
            throw e;
        } finally {
            ;
        }
        assert total >= 0;
        return total;
    }
"};

fn is_statement(kind: &str) -> bool {
    kind.ends_with("_statement")
        || matches!(kind, "block" | "local_variable_declaration" | "switch_expression")
}

fn inside_nested_body(node: Node<'_>, fragment: Node<'_>) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if parent.id() == fragment.id() {
            return false;
        }
        if matches!(parent.kind(), "lambda_expression" | "class_body") {
            return true;
        }
        current = parent.parent();
    }
    false
}

fn statements<'tree>(fragment: Node<'tree>) -> Vec<Node<'tree>> {
    let mut out = Vec::new();
    let mut stack = vec![fragment];
    while let Some(node) = stack.pop() {
        if is_statement(node.kind()) && !inside_nested_body(node, fragment) {
            out.push(node);
        }
        let mut cursor = node.walk();
        stack.extend(node.named_children(&mut cursor));
    }
    out
}

#[test]
fn every_statement_owns_a_non_empty_range() {
    let source = parse(MIXED);
    let method = source.procedure("m").unwrap();
    for options in [FlowOptions::default(), FlowOptions::default().with_folding(false)] {
        let flow = build(&source, "m", options);
        for statement in statements(method.node) {
            let (start, end) = flow
                .range_of(statement)
                .unwrap_or_else(|| panic!("no range for {}", SyntaxRef::of(statement)));
            assert!(start < end, "empty range for {}", SyntaxRef::of(statement));
        }
    }
}

#[test]
fn empty_statements_still_get_an_instruction() {
    let source = parse("void m() { {} {} }");
    let flow = build(&source, "m", FlowOptions::default());
    assert_eq!(listing(&flow), vec!["EMPTY", "EMPTY"]);
}

#[test]
fn every_jump_lands_inside_the_flow_or_on_its_exit() {
    let source = parse(MIXED);
    let flow = build(&source, "m", FlowOptions::default());
    for (index, instruction) in flow.instructions().enumerate() {
        if let Some(offset) = instruction.offset() {
            assert!(offset <= flow.size(), "{index}: {instruction:?}");
        }
        if let Instruction::Call { offset, proc_end } = instruction {
            assert!(offset <= proc_end && proc_end <= flow.size());
        }
    }
}

#[test]
fn finally_body_is_lowered_once_and_entered_by_call() {
    let source = parse("int m() { int x; try { return 1; } finally { x = 2; } }");
    let flow = build(&source, "m", FlowOptions::default());

    let writes: Vec<usize> = (0..flow.size())
        .filter(|i| flow.render(*i) == "WRITE x")
        .collect();
    assert_eq!(writes.len(), 1, "{flow}");
    let write = writes[0];

    let calls: Vec<(usize, usize, usize)> = flow
        .instructions()
        .enumerate()
        .filter_map(|(i, instruction)| match instruction {
            Instruction::Call { offset, proc_end } => Some((i, offset, proc_end)),
            _ => None,
        })
        .collect();
    assert!(!calls.is_empty());
    for (_, offset, proc_end) in &calls {
        assert!(*offset <= write && write < *proc_end);
    }

    let returns: Vec<(usize, usize)> = flow
        .instructions()
        .filter_map(|instruction| match instruction {
            Instruction::Return { offset, call } => Some((offset, call)),
            _ => None,
        })
        .collect();
    assert_eq!(returns.len(), calls.len());
    for (call, _, _) in &calls {
        assert!(returns.contains(&(call + 1, *call)));
    }

    // the return path resumes at the method's own return
    let resumed_at_return = calls.iter().any(|(call, _, _)| {
        matches!(
            flow.instruction(call + 1),
            Some(Instruction::GoTo { is_return: true, .. })
        )
    });
    assert!(resumed_at_return, "{flow}");

    let result = reachable(&flow);
    assert!(result.is_reachable(write));
    assert!(result.exit_reachable());
}

/// Index of the conditional jump taken on the value of `name`.
fn branch_on(flow: &ctrlflow::ControlFlow, text: &str, name: &str) -> SyntaxRef {
    flow.instructions()
        .find_map(|instruction| match instruction {
            Instruction::ConditionalGoTo {
                condition: Some(condition),
                ..
            } if condition.text(text) == name => Some(condition),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no branch on {name} in\n{flow}"))
}

#[test]
fn and_skips_right_operand_when_left_is_false() {
    let source = parse("void m(boolean a, boolean b) { if (a && b) { go(); } }");
    let flow = build(&source, "m", FlowOptions::default());
    let a = branch_on(&flow, source.text(), "a");
    let read_b = index_of(&flow, "READ b");
    let then = index_of(&flow, "SIMPLE");

    let when_false = reachable_assuming(&flow, &HashMap::from([(a, false)]));
    assert!(!when_false.is_reachable(read_b));
    assert!(!when_false.is_reachable(then));
    assert!(when_false.exit_reachable());

    let when_true = reachable_assuming(&flow, &HashMap::from([(a, true)]));
    assert!(when_true.is_reachable(read_b));
}

#[test]
fn or_skips_right_operand_when_left_is_true() {
    let source = parse("void m(boolean a, boolean b) { if (a || b) { go(); } }");
    let flow = build(&source, "m", FlowOptions::default());
    let a = branch_on(&flow, source.text(), "a");
    let read_b = index_of(&flow, "READ b");
    let then = index_of(&flow, "SIMPLE");

    let when_true = reachable_assuming(&flow, &HashMap::from([(a, true)]));
    assert!(!when_true.is_reachable(read_b));
    assert!(when_true.is_reachable(then));
}

#[test]
fn building_twice_gives_the_same_flow() {
    let source = parse(MIXED);
    let first = build(&source, "m", FlowOptions::default());
    let second = build(&source, "m", FlowOptions::default());
    assert!(first.same_structure(&second));
    assert_eq!(listing(&first), listing(&second));
}

#[test]
fn folding_without_constants_matches_unfolded_build() {
    let source = parse(MIXED);
    let folded = build(&source, "m", FlowOptions::default());
    assert!(!folded.constant_condition_occurred());
    let unfolded = build(&source, "m", FlowOptions::default().with_folding(false));
    assert!(folded.same_structure(&unfolded));
}

#[test]
fn constant_if_makes_else_unreachable() {
    let source = parse("void m() { if (true) { a(); } else { b(); } }");
    let flow = build(&source, "m", FlowOptions::default());
    assert!(flow.constant_condition_occurred());

    let method = source.procedure("m").unwrap();
    let blocks = nodes_of_kind(method.node, "block");
    // method body, then branch, else branch
    let (else_start, else_end) = flow.range_of(blocks[2]).unwrap();
    let result = reachable(&flow);
    for index in else_start..else_end {
        assert!(!result.is_reachable(index), "{flow}");
    }

    let unfolded = build(&source, "m", FlowOptions::default().with_folding(false));
    assert!(!unfolded.constant_condition_occurred());
    assert!(reachable(&unfolded).unreachable().next().is_none());
}

#[test]
fn break_out_of_infinite_loop_targets_the_loop_end() {
    let source = parse("void m(boolean c) { while (true) { if (c) break; } done(); }");
    let flow = build(&source, "m", FlowOptions::default());
    let method = source.procedure("m").unwrap();
    let while_node = nodes_of_kind(method.node, "while_statement")[0];
    let break_node = nodes_of_kind(method.node, "break_statement")[0];
    let (_, loop_end) = flow.range_of(while_node).unwrap();
    let (break_start, _) = flow.range_of(break_node).unwrap();

    assert_eq!(flow.instruction(break_start).and_then(|i| i.offset()), Some(loop_end));
    assert_eq!(flow.render(loop_end), "SIMPLE");
    assert!(reachable(&flow).is_reachable(loop_end));
}

#[test]
fn throw_goes_to_matching_catch_and_finally_still_runs() {
    let source = parse("void m() { try { throw new E(); } catch (E e) { } finally { f(); } }");
    let flow = build(&source, "m", FlowOptions::default());
    let method = source.procedure("m").unwrap();
    let catch_clause = nodes_of_kind(method.node, "catch_clause")[0];
    let finally_clause = nodes_of_kind(method.node, "finally_clause")[0];
    let throw_node = nodes_of_kind(method.node, "throw_statement")[0];

    let catch_start = flow.start_offset(catch_clause).unwrap();
    let (throw_start, throw_end) = flow.range_of(throw_node).unwrap();
    let thrown_to: Vec<usize> = (throw_start..throw_end)
        .filter_map(|i| match flow.instruction(i) {
            Some(Instruction::ThrowTo { offset }) => Some(offset),
            Some(Instruction::ConditionalThrowTo { offset, .. }) => Some(offset),
            _ => None,
        })
        .collect();
    assert!(thrown_to.contains(&catch_start), "{flow}");

    let (finally_start, finally_end) = flow.range_of(finally_clause).unwrap();
    let result = reachable(&flow);
    assert!((finally_start..finally_end).any(|i| result.is_reachable(i)));
    assert!(result.exit_reachable());
}

#[test]
fn nested_finally_blocks_are_each_lowered_once() {
    let source = parse(indoc! {"
        void m(boolean c) {
            while (c) {
                try {
                    try {
                        if (c) break;
                        work();
                    } finally {
                        inner();
                    }
                } finally {
                    outer();
                }
            }
        }
    "});
    let flow = build(&source, "m", FlowOptions::default());
    let method = source.procedure("m").unwrap();
    for finally_clause in nodes_of_kind(method.node, "finally_clause") {
        let (start, end) = flow.range_of(finally_clause).unwrap();
        assert!(start < end);
    }
    let calls = flow
        .instructions()
        .filter(|i| matches!(i, Instruction::Call { .. }))
        .count();
    let returns = flow
        .instructions()
        .filter(|i| matches!(i, Instruction::Return { .. }))
        .count();
    assert_eq!(calls, returns);
    assert!(reachable(&flow).exit_reachable());
}
