use crate::ir::{Affine, IndexVar};

pub(super) fn format_f32(value: f32) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-INFINITY".to_string()
        } else {
            "INFINITY".to_string()
        }
    } else {
        let base = value.to_string();
        let needs_decimal = !base.contains('.') && !base.contains('e') && !base.contains('E');
        let suffix = if needs_decimal { ".0f" } else { "f" };
        format!("{base}{suffix}")
    }
}

pub(super) fn format_f64(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-INFINITY".to_string()
        } else {
            "INFINITY".to_string()
        }
    } else {
        // Debug formatting always keeps a decimal point or exponent and round-trips exactly.
        format!("{value:?}")
    }
}

/// Renders `offset + sum(coefficient * var)` with the given loop variable names.
pub(super) fn affine_expr(index: &Affine, pure: &[String], reduction: &[String]) -> String {
    let mut expr = String::new();
    for &(var, coefficient) in &index.terms {
        let name = match var {
            IndexVar::Pure(dim) => &pure[dim],
            IndexVar::Reduction(id) => &reduction[id],
        };
        let term = match coefficient {
            1 => name.clone(),
            _ => format!("{coefficient} * {name}"),
        };
        if expr.is_empty() {
            expr = term;
        } else {
            expr = format!("{expr} + {term}");
        }
    }
    match (expr.is_empty(), index.offset) {
        (true, offset) => offset.to_string(),
        (false, 0) => expr,
        (false, offset) if offset < 0 => format!("{expr} - {}", -offset),
        (false, offset) => format!("{expr} + {offset}"),
    }
}

pub(super) fn linear_index_expr(dims: &[usize], indices: &[String]) -> String {
    if dims.is_empty() {
        return "0".to_string();
    }
    let first = &indices[0];
    let mut expr = format!("({first})");
    for (dim, idx) in dims.iter().skip(1).zip(indices.iter().skip(1)) {
        expr = format!("({expr} * {dim} + ({idx}))");
    }
    expr
}

/// Opens one `for` per extent, with `pragma(depth)` lines placed above each loop.
///
/// Returns the indent of the loop body; close the nest with [`close_loops`].
pub(super) fn open_loops<F>(
    module: &mut String,
    dims: &[usize],
    indent: usize,
    names: &[String],
    mut pragma: F,
) -> usize
where
    F: FnMut(usize) -> Option<String>,
{
    for (depth, extent) in dims.iter().enumerate() {
        if let Some(line) = pragma(depth) {
            push_line(module, indent + depth, &line);
        }
        let name = &names[depth];
        push_line(
            module,
            indent + depth,
            &format!("for (ptrdiff_t {name} = 0; {name} < {extent}; ++{name}) {{"),
        );
    }
    indent + dims.len()
}

pub(super) fn close_loops(module: &mut String, depth: usize, indent: usize) {
    for level in (0..depth).rev() {
        push_line(module, indent + level, "}");
    }
}

pub(super) fn push_line(module: &mut String, indent: usize, line: &str) {
    push_block(module, indent, line);
}

pub(super) fn push_block(module: &mut String, indent: usize, block: &str) {
    if block.is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
    let mut lines: Vec<&str> = block.split('\n').collect();
    if matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    if matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }

    let min_indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.chars().take_while(|c| *c == ' ' || *c == '\t').count())
        .min()
        .unwrap_or(0);

    for line in lines {
        let trimmed = line.get(min_indent..).unwrap_or("");
        if trimmed.trim().is_empty() {
            module.push('\n');
            continue;
        }
        module.push_str(&pad);
        module.push_str(trimmed);
        module.push('\n');
    }
}
