//! C translation unit emission for a scheduled [`Program`].
//!
//! The unit exports a single entry point:
//!
//! ```c
//! int dnnc_entry(const void* const* inputs, const void* const* params, void* const* outputs);
//! ```
//!
//! Buffers are bound positionally: `inputs` follows the group's external list, `params` the
//! flattened parameter slots, `outputs` the group's output list. Scratch buffers for
//! intermediate funcs are allocated and released inside the call. A nonzero return means an
//! allocation failed.

mod utils;

use std::collections::HashMap;

use dnnc::backend::{BackendError, BackendResult};
use dnnc::tensor::DType;

use crate::dtype::{c_type, lowest_literal, math_suffix, unsigned_c_type};
use crate::ir::{
    BinaryOp, CompareOp, Cond, Expr, Func, FuncId, Program, ReduceOp, ReductionDomain, Source,
    Storage, UnaryOp,
};

use utils::{
    affine_expr, close_loops, format_f32, format_f64, linear_index_expr, open_loops, push_block,
    push_line,
};

pub const ENTRY_SYMBOL: &str = "dnnc_entry";

pub fn emit_program(program: &Program, group: &str) -> BackendResult<String> {
    let buffers = buffer_names(program);
    let mut module = String::new();
    push_block(
        &mut module,
        0,
        r#"
        #include <float.h>
        #include <math.h>
        #include <stddef.h>
        #include <stdint.h>
        #include <stdlib.h>
        "#,
    );
    module.push('\n');
    push_line(&mut module, 0, &format!("/* group {group} */"));
    push_line(
        &mut module,
        0,
        &format!(
            "int {ENTRY_SYMBOL}(const void* const* inputs, const void* const* params, void* const* outputs) {{"
        ),
    );

    for (slot, decl) in program.inputs.iter().enumerate() {
        let ty = c_type(decl.dtype);
        push_line(
            &mut module,
            1,
            &format!("const {ty}* in{slot} = (const {ty}*)inputs[{slot}];"),
        );
    }
    for (slot, decl) in program.params.iter().enumerate() {
        let ty = c_type(decl.dtype);
        push_line(
            &mut module,
            1,
            &format!("const {ty}* p{slot} = (const {ty}*)params[{slot}];"),
        );
    }
    for (slot, func) in program.outputs() {
        let ty = c_type(func.dtype);
        push_line(
            &mut module,
            1,
            &format!("{ty}* out{slot} = ({ty}*)outputs[{slot}];"),
        );
    }

    let scratch: Vec<&Func> = program
        .funcs
        .iter()
        .filter(|func| func.storage == Storage::Scratch)
        .collect();
    push_line(&mut module, 1, "int status = 0;");
    for func in &scratch {
        let ty = c_type(func.dtype);
        push_line(&mut module, 1, &format!("{ty}* {} = NULL;", buffers[&func.id]));
    }
    for func in &scratch {
        let name = &buffers[&func.id];
        let ty = c_type(func.dtype);
        let len = dnnc::tensor::element_count(&func.dims);
        push_block(
            &mut module,
            1,
            &format!(
                r#"
                {name} = ({ty}*)malloc({len} * sizeof({ty}));
                if ({name} == NULL) {{
                  status = 1;
                  goto cleanup;
                }}
                "#
            ),
        );
    }

    for func in &program.funcs {
        module.push('\n');
        emit_func(&mut module, func, &buffers)?;
    }

    module.push('\n');
    if !scratch.is_empty() {
        push_line(&mut module, 0, "cleanup:");
    }
    for func in scratch.iter().rev() {
        push_line(&mut module, 1, &format!("free({});", buffers[&func.id]));
    }
    push_line(&mut module, 1, "return status;");
    push_line(&mut module, 0, "}");
    Ok(module)
}

fn buffer_names(program: &Program) -> HashMap<FuncId, String> {
    program
        .funcs
        .iter()
        .map(|func| {
            let name = match func.storage {
                Storage::Output(slot) => format!("out{slot}"),
                Storage::Scratch => format!("s{}", func.id.0),
            };
            (func.id, name)
        })
        .collect()
}

fn emit_func(
    module: &mut String,
    func: &Func,
    buffers: &HashMap<FuncId, String>,
) -> BackendResult<()> {
    push_line(module, 1, &format!("/* {} */", func.name));
    let pure: Vec<String> = (0..func.dims.len()).map(|i| format!("v{i}")).collect();
    let innermost = func.dims.len().saturating_sub(1);
    let schedule = func.schedule;
    let indent = open_loops(module, &func.dims, 1, &pure, |depth| match schedule.parallel {
        Some((start, 1)) if start == depth => Some("#pragma omp parallel for".to_string()),
        Some((start, count)) if start == depth => {
            Some(format!("#pragma omp parallel for collapse({count})"))
        }
        _ if schedule.vectorize && depth == innermost => Some("#pragma omp simd".to_string()),
        _ => None,
    });

    let mut emitter = BodyEmitter {
        buffers,
        pure: &pure,
        reduction: Vec::new(),
        temps: 0,
    };
    let value = emitter.expr(module, indent, &func.body, func.dtype)?;
    let target = linear_index_expr(&func.dims, &pure);
    push_line(
        module,
        indent,
        &format!("{}[{target}] = {value};", buffers[&func.id]),
    );
    close_loops(module, func.dims.len(), 1);
    Ok(())
}

/// Renders scalar expressions, hoisting reductions into loops placed before the use.
struct BodyEmitter<'a> {
    buffers: &'a HashMap<FuncId, String>,
    pure: &'a [String],
    reduction: Vec<String>,
    temps: usize,
}

impl BodyEmitter<'_> {
    fn fresh(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}{}", self.temps);
        self.temps += 1;
        name
    }

    fn source(&self, source: Source) -> String {
        match source {
            Source::Input(slot) => format!("in{slot}"),
            Source::Param(slot) => format!("p{slot}"),
            Source::Func(id) => self.buffers[&id].clone(),
        }
    }

    fn expr(
        &mut self,
        module: &mut String,
        indent: usize,
        expr: &Expr,
        dtype: DType,
    ) -> BackendResult<String> {
        Ok(match expr {
            Expr::Const(value) => literal(*value, dtype),
            Expr::Lowest => lowest_literal(dtype).to_string(),
            Expr::Load {
                source,
                view,
                index,
            } => {
                let indices: Vec<String> = index
                    .iter()
                    .map(|index| affine_expr(index, self.pure, &self.reduction))
                    .collect();
                format!(
                    "{}[{}]",
                    self.source(*source),
                    linear_index_expr(view, &indices)
                )
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.expr(module, indent, lhs, dtype)?;
                let rhs = self.expr(module, indent, rhs, dtype)?;
                binary(*op, &lhs, &rhs, dtype)?
            }
            Expr::Unary(op, value) => {
                require_float(dtype, "unary math")?;
                let value = self.expr(module, indent, value, dtype)?;
                let name = match op {
                    UnaryOp::Exp => "exp",
                    UnaryOp::Sqrt => "sqrt",
                };
                format!("{name}{}({value})", math_suffix(dtype))
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.cond(module, indent, cond, dtype)?;
                let then = self.expr(module, indent, then, dtype)?;
                let otherwise = self.expr(module, indent, otherwise, dtype)?;
                format!("(({cond}) ? ({then}) : ({otherwise}))")
            }
            Expr::Reduce {
                op,
                domain,
                init,
                body,
            } => self.reduce(module, indent, *op, domain, init, body, dtype)?,
            Expr::Cast { from, to, value } => {
                let value = self.expr(module, indent, value, *from)?;
                format!("(({})({value}))", c_type(*to))
            }
        })
    }

    fn cond(
        &mut self,
        module: &mut String,
        indent: usize,
        cond: &Cond,
        dtype: DType,
    ) -> BackendResult<String> {
        Ok(match cond {
            Cond::InRange { index, lo, hi } => {
                let index = affine_expr(index, self.pure, &self.reduction);
                format!("({index}) >= {lo} && ({index}) < {hi}")
            }
            Cond::Compare(op, lhs, rhs) => {
                let lhs = self.expr(module, indent, lhs, dtype)?;
                let rhs = self.expr(module, indent, rhs, dtype)?;
                let op = match op {
                    CompareOp::Gt => ">",
                    CompareOp::Ne => "!=",
                };
                format!("({lhs}) {op} ({rhs})")
            }
            Cond::All(conds) if conds.is_empty() => "1".to_string(),
            Cond::All(conds) => {
                let mut parts = Vec::with_capacity(conds.len());
                for cond in conds {
                    parts.push(format!("({})", self.cond(module, indent, cond, dtype)?));
                }
                parts.join(" && ")
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &mut self,
        module: &mut String,
        indent: usize,
        op: ReduceOp,
        domain: &[ReductionDomain],
        init: &Expr,
        body: &Expr,
        dtype: DType,
    ) -> BackendResult<String> {
        let ty = c_type(dtype);
        let acc = self.fresh("acc");
        let init = self.expr(module, indent, init, dtype)?;
        push_line(module, indent, &format!("{ty} {acc} = {init};"));

        let outer = std::mem::take(&mut self.reduction);
        let width = domain.iter().map(|d| d.var + 1).max().unwrap_or(0);
        let stem = self.fresh("k");
        self.reduction = (0..width).map(|var| format!("{stem}_{var}")).collect();
        let names: Vec<String> = domain
            .iter()
            .map(|d| self.reduction[d.var].clone())
            .collect();
        let extents: Vec<usize> = domain.iter().map(|d| d.extent).collect();
        let inner = open_loops(module, &extents, indent, &names, |_| None);

        let value = self.expr(module, inner, body, dtype)?;
        let update = match op {
            ReduceOp::Sum => format!("{acc} = {};", binary(BinaryOp::Add, &acc, &value, dtype)?),
            ReduceOp::Max => {
                let tap = self.fresh("t");
                push_line(module, inner, &format!("const {ty} {tap} = {value};"));
                format!("{acc} = {tap} > {acc} ? {tap} : {acc};")
            }
        };
        push_line(module, inner, &update);
        close_loops(module, extents.len(), indent);
        self.reduction = outer;
        Ok(acc)
    }
}

fn require_float(dtype: DType, what: &'static str) -> BackendResult<()> {
    if dtype.is_float() {
        Ok(())
    } else {
        Err(BackendError::unsupported(
            "codegen",
            format!("{what} on {dtype} elements"),
        ))
    }
}

fn literal(value: f64, dtype: DType) -> String {
    match dtype {
        DType::F32 => format_f32(value as f32),
        DType::F64 => format_f64(value),
        _ => format!("(({}){})", c_type(dtype), value as i64),
    }
}

fn binary(op: BinaryOp, lhs: &str, rhs: &str, dtype: DType) -> BackendResult<String> {
    Ok(match op {
        BinaryOp::Add => match unsigned_c_type(dtype) {
            Some(unsigned) => format!(
                "(({})(({unsigned})({lhs}) + ({unsigned})({rhs})))",
                c_type(dtype)
            ),
            None => format!("({lhs} + {rhs})"),
        },
        BinaryOp::Sub => format!("({lhs} - {rhs})"),
        BinaryOp::Mul => format!("({lhs} * {rhs})"),
        BinaryOp::Div => format!("({lhs} / {rhs})"),
        BinaryOp::Pow => {
            require_float(dtype, "pow")?;
            format!("pow{}({lhs}, {rhs})", math_suffix(dtype))
        }
    })
}
