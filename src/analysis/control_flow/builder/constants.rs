//! Compile-time constant expressions.
//!
//! Covers literals, `final` locals with constant initializers and the
//! operators Java allows in constant expressions. Integer arithmetic wraps
//! at the width of its promoted type. Anything else, including casts and
//! fields, is not a constant here.

use tree_sitter::Node;

use crate::syntax::{children, named_children, node_text};

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Constant {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f64),
    Char(char),
    Str(String),
}

#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i32),
    Long(i64),
    Float(f64),
}

impl Numeric {
    fn as_i64(self) -> i64 {
        match self {
            Numeric::Int(v) => i64::from(v),
            Numeric::Long(v) => v,
            Numeric::Float(v) => v as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(v) => f64::from(v),
            Numeric::Long(v) => v as f64,
            Numeric::Float(v) => v,
        }
    }
}

impl Constant {
    fn numeric(&self) -> Option<Numeric> {
        match *self {
            Constant::Int(v) => Some(Numeric::Int(v)),
            Constant::Long(v) => Some(Numeric::Long(v)),
            Constant::Float(v) => Some(Numeric::Float(v)),
            Constant::Char(c) => Some(Numeric::Int(c as i32)),
            Constant::Bool(_) | Constant::Str(_) => None,
        }
    }

    /// Text of the value when concatenated to a string.
    fn concat_text(&self) -> Option<String> {
        match self {
            Constant::Bool(v) => Some(v.to_string()),
            Constant::Int(v) => Some(v.to_string()),
            Constant::Long(v) => Some(v.to_string()),
            Constant::Char(c) => Some(c.to_string()),
            Constant::Str(s) => Some(s.clone()),
            // Java and Rust print doubles differently
            Constant::Float(_) => None,
        }
    }

    /// Convert an initializer to the declared type of a `final` local.
    pub(super) fn coerce(self, type_name: &str) -> Option<Constant> {
        match (type_name, self) {
            ("boolean", value @ Constant::Bool(_)) => Some(value),
            ("String", value @ Constant::Str(_)) => Some(value),
            ("int" | "short" | "byte", Constant::Int(v)) => Some(Constant::Int(v)),
            ("int" | "short" | "byte", Constant::Char(c)) => Some(Constant::Int(c as i32)),
            ("char", value @ Constant::Char(_)) => Some(value),
            ("char", Constant::Int(v)) => u32::try_from(v).ok().and_then(char::from_u32).map(Constant::Char),
            ("long", value) => value.numeric().and_then(|n| match n {
                Numeric::Float(_) => None,
                other => Some(Constant::Long(other.as_i64())),
            }),
            ("float" | "double", value) => value.numeric().map(|n| Constant::Float(n.as_f64())),
            _ => None,
        }
    }
}

fn operator(node: Node<'_>) -> Option<&'static str> {
    node.child_by_field_name("operator").map(|op| op.kind())
}

/// Value of `node` when it is a constant expression.
///
/// `lookup` resolves simple names to the constants they are bound to.
pub(super) fn evaluate(
    node: Node<'_>,
    source: &[u8],
    lookup: &dyn Fn(&str) -> Option<Constant>,
) -> Option<Constant> {
    let eval = |child: Node<'_>| evaluate(child, source, lookup);
    match node.kind() {
        "true" => Some(Constant::Bool(true)),
        "false" => Some(Constant::Bool(false)),
        "decimal_integer_literal" | "hex_integer_literal" | "octal_integer_literal"
        | "binary_integer_literal" => parse_integer(node_text(node, source)),
        "decimal_floating_point_literal" => parse_float(node_text(node, source)),
        "character_literal" => parse_char(node_text(node, source)),
        "string_literal" => parse_string(node_text(node, source)),
        "identifier" => lookup(node_text(node, source)),
        "parenthesized_expression" => named_children(node).into_iter().next().and_then(eval),
        "unary_expression" => unary(operator(node)?, eval(node.child_by_field_name("operand")?)?),
        "binary_expression" => {
            let left = eval(node.child_by_field_name("left")?)?;
            let right = eval(node.child_by_field_name("right")?)?;
            binary(operator(node)?, left, right)
        }
        "ternary_expression" => match eval(node.child_by_field_name("condition")?)? {
            Constant::Bool(true) => eval(node.child_by_field_name("consequence")?),
            Constant::Bool(false) => eval(node.child_by_field_name("alternative")?),
            _ => None,
        },
        _ => None,
    }
}

/// Truth value of `node` when it is a boolean constant expression.
pub(super) fn condition_value(
    node: Node<'_>,
    source: &[u8],
    lookup: &dyn Fn(&str) -> Option<Constant>,
) -> Option<bool> {
    match evaluate(node, source, lookup)? {
        Constant::Bool(value) => Some(value),
        _ => None,
    }
}

/// Declared type of a `final` local declaration of a constant-capable type.
pub(super) fn final_constant_type<'s>(declaration: Node<'_>, source: &'s [u8]) -> Option<&'s str> {
    let is_final = children(declaration)
        .into_iter()
        .filter(|child| child.kind() == "modifiers")
        .any(|modifiers| children(modifiers).iter().any(|m| m.kind() == "final"));
    if !is_final {
        return None;
    }
    let ty = declaration.child_by_field_name("type")?;
    match ty.kind() {
        "integral_type" | "floating_point_type" | "boolean_type" => Some(node_text(ty, source)),
        "type_identifier" if node_text(ty, source) == "String" => Some("String"),
        _ => None,
    }
}

fn unary(op: &str, value: Constant) -> Option<Constant> {
    match (op, value) {
        ("!", Constant::Bool(v)) => Some(Constant::Bool(!v)),
        ("-" | "+" | "~", value) => {
            let n = value.numeric()?;
            match (op, n) {
                ("+", _) => Some(from_numeric(n)),
                ("-", Numeric::Int(v)) => Some(Constant::Int(v.wrapping_neg())),
                ("-", Numeric::Long(v)) => Some(Constant::Long(v.wrapping_neg())),
                ("-", Numeric::Float(v)) => Some(Constant::Float(-v)),
                ("~", Numeric::Int(v)) => Some(Constant::Int(!v)),
                ("~", Numeric::Long(v)) => Some(Constant::Long(!v)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn from_numeric(n: Numeric) -> Constant {
    match n {
        Numeric::Int(v) => Constant::Int(v),
        Numeric::Long(v) => Constant::Long(v),
        Numeric::Float(v) => Constant::Float(v),
    }
}

fn binary(op: &str, left: Constant, right: Constant) -> Option<Constant> {
    if let (Constant::Bool(l), Constant::Bool(r)) = (&left, &right) {
        let (l, r) = (*l, *r);
        return match op {
            "&&" | "&" => Some(Constant::Bool(l && r)),
            "||" | "|" => Some(Constant::Bool(l || r)),
            "==" => Some(Constant::Bool(l == r)),
            "!=" | "^" => Some(Constant::Bool(l != r)),
            _ => None,
        };
    }
    if let (Constant::Str(l), Constant::Str(r)) = (&left, &right) {
        match op {
            "==" => return Some(Constant::Bool(l == r)),
            "!=" => return Some(Constant::Bool(l != r)),
            _ => {}
        }
    }
    if op == "+" && (matches!(left, Constant::Str(_)) || matches!(right, Constant::Str(_))) {
        return Some(Constant::Str(left.concat_text()? + &right.concat_text()?));
    }

    let (l, r) = (left.numeric()?, right.numeric()?);
    if matches!(op, "<<" | ">>" | ">>>") {
        return shift(op, l, r.as_i64());
    }
    match (l, r) {
        (Numeric::Float(_), _) | (_, Numeric::Float(_)) => floating(op, l.as_f64(), r.as_f64()),
        (Numeric::Long(_), _) | (_, Numeric::Long(_)) => integral(op, l.as_i64(), r.as_i64()),
        (Numeric::Int(_), Numeric::Int(_)) => match integral(op, l.as_i64(), r.as_i64())? {
            Constant::Long(v) => Some(Constant::Int(v as i32)),
            other => Some(other),
        },
    }
}

/// Operators on two integers in 64-bit arithmetic; `int` results are
/// narrowed by the caller, which matches 32-bit wrapping.
fn integral(op: &str, l: i64, r: i64) -> Option<Constant> {
    let value = match op {
        "+" => l.wrapping_add(r),
        "-" => l.wrapping_sub(r),
        "*" => l.wrapping_mul(r),
        "/" => l.checked_div(r).or_else(|| (r == -1).then(|| l.wrapping_neg()))?,
        "%" => l.checked_rem(r).or_else(|| (r == -1).then_some(0))?,
        "&" => l & r,
        "|" => l | r,
        "^" => l ^ r,
        _ => return compare(op, l.cmp(&r).into()),
    };
    Some(Constant::Long(value))
}

fn floating(op: &str, l: f64, r: f64) -> Option<Constant> {
    let value = match op {
        "+" => l + r,
        "-" => l - r,
        "*" => l * r,
        "/" => l / r,
        "%" => l % r,
        _ => return compare(op, l.partial_cmp(&r)),
    };
    Some(Constant::Float(value))
}

fn compare(op: &str, ordering: Option<std::cmp::Ordering>) -> Option<Constant> {
    use std::cmp::Ordering::{Equal, Greater, Less};
    // NaN compares false except for `!=`
    let result = match (op, ordering) {
        ("==", o) => o == Some(Equal),
        ("!=", o) => o != Some(Equal),
        ("<", o) => o == Some(Less),
        ("<=", o) => matches!(o, Some(Less | Equal)),
        (">", o) => o == Some(Greater),
        (">=", o) => matches!(o, Some(Greater | Equal)),
        _ => return None,
    };
    Some(Constant::Bool(result))
}

fn shift(op: &str, value: Numeric, distance: i64) -> Option<Constant> {
    match value {
        Numeric::Int(v) => {
            let s = (distance & 31) as u32;
            Some(Constant::Int(match op {
                "<<" => v.wrapping_shl(s),
                ">>" => v.wrapping_shr(s),
                _ => ((v as u32) >> s) as i32,
            }))
        }
        Numeric::Long(v) => {
            let s = (distance & 63) as u32;
            Some(Constant::Long(match op {
                "<<" => v.wrapping_shl(s),
                ">>" => v.wrapping_shr(s),
                _ => ((v as u64) >> s) as i64,
            }))
        }
        Numeric::Float(_) => None,
    }
}

fn parse_integer(text: &str) -> Option<Constant> {
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    let is_long = digits.ends_with(&['l', 'L'][..]);
    let lower = digits.trim_end_matches(&['l', 'L'][..]).to_ascii_lowercase();
    let raw = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()?
    } else if lower.len() > 1 && lower.starts_with('0') {
        u64::from_str_radix(&lower[1..], 8).ok()?
    } else {
        lower.parse::<u64>().ok()?
    };
    if is_long {
        Some(Constant::Long(raw as i64))
    } else {
        // 2147483648 only appears under unary minus, where wrapping gives MIN
        u32::try_from(raw).ok().map(|v| Constant::Int(v as i32))
    }
}

fn parse_float(text: &str) -> Option<Constant> {
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    let digits = digits.trim_end_matches(&['f', 'F', 'd', 'D'][..]);
    digits.parse::<f64>().ok().map(Constant::Float)
}

fn parse_char(text: &str) -> Option<Constant> {
    let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut chars = unescape(inner)?.into_iter();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(Constant::Char(c)),
        _ => None,
    }
}

fn parse_string(text: &str) -> Option<Constant> {
    if text.starts_with("\"\"\"") {
        return None;
    }
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    unescape(inner).map(|chars| Constant::Str(chars.into_iter().collect()))
}

fn unescape(text: &str) -> Option<Vec<char>> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            's' => ' ',
            'u' => {
                while chars.peek() == Some(&'u') {
                    chars.next();
                }
                let hex: String = chars.by_ref().take(4).collect();
                char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?
            }
            digit @ '0'..='7' => {
                let mut value = digit.to_digit(8)?;
                let max_len = if digit <= '3' { 3 } else { 2 };
                for _ in 1..max_len {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                char::from_u32(value)?
            }
            other => other,
        };
        out.push(escaped);
    }
    Some(out)
}
