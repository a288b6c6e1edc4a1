//! Lowering of a planned group into loop-nest funcs.
//!
//! Every op becomes one func defining its value, except softmax which needs four passes and data
//! ops that are only read, which bind straight to their caller buffer.

use std::collections::HashMap;
use std::ops::Range;

use dnnc::backend::{BackendError, BackendResult, GroupView};
use dnnc::ops::shape::same_padding;
use dnnc::ops::{
    AffineSpec, BatchNormSpec, Conv2dSpec, LrnSpec, OpId, OpKind, OpNode, Pool2dSpec, PoolKind,
};
use dnnc::tensor::DType;

use crate::ir::{
    Affine, BinaryOp, BufferDecl, CompareOp, Cond, Expr, Func, FuncId, Program, ReduceOp,
    ReductionDomain, Schedule, Source, Storage, UnaryOp,
};

/// A lowered group plus the bookkeeping needed to bind buffers at run time.
#[derive(Debug, Clone)]
pub struct Lowered {
    pub program: Program,
    /// Flattened parameter slots owned by each op, in plan order.
    pub param_slots: Vec<(OpId, Range<usize>)>,
    /// Op behind each output buffer, in the plan's output order.
    pub outputs: Vec<OpId>,
}

/// Buffer read by the op being lowered, with the extents used to index it.
#[derive(Debug, Clone)]
struct Operand {
    source: Source,
    dims: Vec<usize>,
}

impl Operand {
    fn new(source: Source, dims: &[usize]) -> Self {
        Operand {
            source,
            dims: dims.to_vec(),
        }
    }

    fn at(&self, index: Vec<Affine>) -> Expr {
        Expr::load(self.source, &self.dims, index)
    }

    fn identity(&self) -> Expr {
        self.at(Affine::identity(self.dims.len()))
    }

    /// Load indexed by the channel loop only.
    fn per_channel(&self) -> Expr {
        self.at(vec![Affine::pure(1)])
    }
}

/// Func body waiting for its id and storage.
struct Stage {
    suffix: Option<&'static str>,
    dims: Vec<usize>,
    body: Expr,
}

impl Stage {
    fn value(dims: &[usize], body: Expr) -> Self {
        Stage {
            suffix: None,
            dims: dims.to_vec(),
            body,
        }
    }

    fn scratch(suffix: &'static str, dims: &[usize], body: Expr) -> Self {
        Stage {
            suffix: Some(suffix),
            dims: dims.to_vec(),
            body,
        }
    }
}

pub fn lower_group(group: &GroupView<'_>) -> BackendResult<Lowered> {
    let mut lowering = Lowering {
        group,
        funcs: Vec::new(),
        values: HashMap::new(),
        params: Vec::new(),
        param_slots: Vec::new(),
    };
    for (id, node) in group.ordered() {
        lowering.lower_op(id, node)?;
    }

    let inputs = group
        .plan
        .external
        .iter()
        .map(|&id| {
            let node = group.node(id);
            BufferDecl {
                dtype: node.dtype(),
                dims: node.dims().to_vec(),
            }
        })
        .collect();

    Ok(Lowered {
        program: Program {
            inputs,
            params: lowering.params,
            funcs: lowering.funcs,
        },
        param_slots: lowering.param_slots,
        outputs: group.plan.outputs.clone(),
    })
}

struct Lowering<'a, 'g> {
    group: &'a GroupView<'g>,
    funcs: Vec<Func>,
    values: HashMap<OpId, Source>,
    params: Vec<BufferDecl>,
    param_slots: Vec<(OpId, Range<usize>)>,
}

impl Lowering<'_, '_> {
    fn external(&self, id: OpId) -> BackendResult<Source> {
        self.group.external_slot(id).map(Source::Input).ok_or_else(|| {
            BackendError::compile(format!(
                "{} is read by {} but is not one of its external inputs",
                self.group.node(id).name(),
                self.group.name
            ))
        })
    }

    fn operand(&self, id: OpId) -> BackendResult<Operand> {
        let source = match self.values.get(&id) {
            Some(&source) => source,
            None => self.external(id)?,
        };
        Ok(Operand::new(source, self.group.node(id).dims()))
    }

    fn bind_params(&mut self, id: OpId, node: &OpNode) -> Vec<Operand> {
        let first = self.params.len();
        let mut operands = Vec::with_capacity(node.params().len());
        for param in node.params() {
            operands.push(Operand::new(
                Source::Param(self.params.len()),
                param.dims(),
            ));
            self.params.push(BufferDecl {
                dtype: param.dtype(),
                dims: param.dims().to_vec(),
            });
        }
        if !operands.is_empty() {
            self.param_slots.push((id, first..self.params.len()));
        }
        operands
    }

    fn lower_op(&mut self, id: OpId, node: &OpNode) -> BackendResult<()> {
        let inputs = node
            .inputs()
            .iter()
            .map(|&input| self.operand(input))
            .collect::<BackendResult<Vec<_>>>()?;
        let params = self.bind_params(id, node);
        let out = node.dims();
        let base = self.funcs.len();

        let stages = match node.kind() {
            OpKind::Data(_) => {
                let source = self.external(id)?;
                if !self.group.plan.is_output(id) {
                    self.values.insert(id, source);
                    return Ok(());
                }
                vec![Stage::value(out, Operand::new(source, out).identity())]
            }
            OpKind::Affine(spec) => vec![lower_affine(spec, &inputs[0], &params, out)],
            OpKind::Conv2d(spec) => vec![lower_conv2d(spec, &inputs[0], &params, out)],
            OpKind::Pool2d(spec) => vec![lower_pool2d(spec, &inputs[0], out)],
            OpKind::Relu(spec) => vec![lower_relu(spec.slope, node.dtype(), &inputs[0], out)],
            OpKind::Softmax => lower_softmax(&inputs[0], base),
            OpKind::Lrn(spec) => vec![lower_lrn(spec, &inputs[0], out)],
            OpKind::Concat => vec![lower_concat(&inputs, out)],
            OpKind::Flatten => {
                // Row-major storage makes flatten a reinterpretation of the input buffer.
                let view = Operand::new(inputs[0].source, out);
                vec![Stage::value(out, view.identity())]
            }
            OpKind::Sum => {
                let body = inputs
                    .iter()
                    .map(Operand::identity)
                    .reduce(Expr::add)
                    .ok_or_else(|| {
                        BackendError::compile(format!("sum {} has no inputs", node.name()))
                    })?;
                vec![Stage::value(out, body)]
            }
            OpKind::BatchNorm(spec) => vec![lower_batch_norm(spec, &inputs[0], &params, out)],
            OpKind::Scale(_) => {
                let scaled = Expr::mul(inputs[0].identity(), params[0].per_channel());
                let body = match params.get(1) {
                    Some(beta) => Expr::add(scaled, beta.per_channel()),
                    None => scaled,
                };
                vec![Stage::value(out, body)]
            }
        };

        self.push_stages(id, node, stages);
        Ok(())
    }

    fn push_stages(&mut self, id: OpId, node: &OpNode, stages: Vec<Stage>) {
        let output_slot = self.group.plan.outputs.iter().position(|&o| o == id);
        let stem = c_identifier(node.name());
        for stage in stages {
            let func_id = FuncId(self.funcs.len());
            let is_value = stage.suffix.is_none();
            let storage = match output_slot {
                Some(slot) if is_value => Storage::Output(slot),
                _ => Storage::Scratch,
            };
            let name = match stage.suffix {
                Some(suffix) => format!("f{}_{stem}_{suffix}", func_id.0),
                None => format!("f{}_{stem}", func_id.0),
            };
            self.funcs.push(Func {
                id: func_id,
                name,
                op: is_value.then_some(id),
                dtype: node.dtype(),
                dims: stage.dims,
                body: stage.body,
                storage,
                schedule: Schedule::default(),
            });
            if is_value {
                self.values.insert(id, Source::Func(func_id));
            }
        }
    }
}

/// Maps an op name onto a C identifier fragment.
fn c_identifier(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

fn pure(dim: usize) -> Affine {
    Affine::pure(dim)
}

fn rvar(id: usize) -> Affine {
    Affine::reduction(id)
}

fn domain(extents: &[usize]) -> Vec<ReductionDomain> {
    extents
        .iter()
        .enumerate()
        .map(|(var, &extent)| ReductionDomain { var, extent })
        .collect()
}

fn lower_affine(spec: &AffineSpec, x: &Operand, params: &[Operand], out: &[usize]) -> Stage {
    let dot = Expr::reduce(
        ReduceOp::Sum,
        domain(&[x.dims[1]]),
        Expr::Const(0.0),
        Expr::mul(
            x.at(vec![pure(0), rvar(0)]),
            params[0].at(vec![pure(1), rvar(0)]),
        ),
    );
    let body = if spec.bias {
        Expr::add(dot, params[1].per_channel())
    } else {
        dot
    };
    Stage::value(out, body)
}

/// Element of an NCHW input at `(n, c, y, x)`, zero outside the image.
fn spatial_tap(input: &Operand, n: Affine, c: Affine, y: Affine, x: Affine) -> Expr {
    let (height, width) = (input.dims[2], input.dims[3]);
    Expr::guarded(
        vec![
            Cond::in_bounds(y.clone(), height),
            Cond::in_bounds(x.clone(), width),
        ],
        input.at(vec![n, c, y, x]),
    )
}

/// `out * stride + tap - pad` along one spatial axis.
fn window_axis(dim: usize, stride: usize, tap: usize, window: usize) -> Affine {
    pure(dim)
        .scaled(stride as i64)
        .plus(rvar(tap))
        .shifted(-(same_padding(window) as i64))
}

fn lower_conv2d(spec: &Conv2dSpec, x: &Operand, params: &[Operand], out: &[usize]) -> Stage {
    let y = window_axis(2, spec.stride_h, 1, spec.filter_h);
    let col = window_axis(3, spec.stride_w, 2, spec.filter_w);
    let product = Expr::mul(
        spatial_tap(x, pure(0), rvar(0), y, col),
        params[0].at(vec![pure(1), rvar(0), rvar(1), rvar(2)]),
    );
    let acc = Expr::reduce(
        ReduceOp::Sum,
        domain(&[x.dims[1], spec.filter_h, spec.filter_w]),
        Expr::Const(0.0),
        product,
    );
    let body = if spec.bias {
        Expr::add(acc, params[1].per_channel())
    } else {
        acc
    };
    Stage::value(out, body)
}

fn lower_pool2d(spec: &Pool2dSpec, x: &Operand, out: &[usize]) -> Stage {
    let y = window_axis(2, spec.stride_h, 0, spec.pool_h);
    let col = window_axis(3, spec.stride_w, 1, spec.pool_w);
    let tap = spatial_tap(x, pure(0), pure(1), y, col);
    let window = domain(&[spec.pool_h, spec.pool_w]);

    let body = match spec.kind {
        PoolKind::Max => Expr::reduce(ReduceOp::Max, window, Expr::Lowest, tap),
        PoolKind::Average => Expr::div(
            Expr::reduce(ReduceOp::Sum, window, Expr::Const(0.0), tap),
            Expr::Const((spec.pool_h * spec.pool_w) as f64),
        ),
    };
    Stage::value(out, body)
}

fn lower_relu(slope: f32, dtype: DType, x: &Operand, out: &[usize]) -> Stage {
    let value = x.identity();
    let slope = Expr::Const(slope as f64);
    let leaked = if dtype.is_float() {
        Expr::mul(value.clone(), slope)
    } else {
        // Integer inputs are scaled in single precision and truncated back.
        let widened = Expr::cast(dtype, DType::F32, value.clone());
        Expr::cast(DType::F32, dtype, Expr::mul(widened, slope))
    };
    let positive = Cond::Compare(
        CompareOp::Gt,
        Box::new(value.clone()),
        Box::new(Expr::Const(0.0)),
    );
    Stage::value(out, Expr::select(positive, value, leaked))
}

/// Row max, shifted exponentials, row sum, then normalization; `base` is the id of the first.
fn lower_softmax(x: &Operand, base: usize) -> Vec<Stage> {
    let (rows, classes) = (x.dims[0], x.dims[1]);
    let row_max = Operand::new(Source::Func(FuncId(base)), &[rows]);
    let exps = Operand::new(Source::Func(FuncId(base + 1)), &[rows, classes]);
    let row_sum = Operand::new(Source::Func(FuncId(base + 2)), &[rows]);

    vec![
        Stage::scratch(
            "max",
            &[rows],
            Expr::reduce(
                ReduceOp::Max,
                domain(&[classes]),
                Expr::Lowest,
                x.at(vec![pure(0), rvar(0)]),
            ),
        ),
        Stage::scratch(
            "exp",
            &[rows, classes],
            Expr::unary(
                UnaryOp::Exp,
                Expr::sub(x.identity(), row_max.at(vec![pure(0)])),
            ),
        ),
        Stage::scratch(
            "sum",
            &[rows],
            Expr::reduce(
                ReduceOp::Sum,
                domain(&[classes]),
                Expr::Const(0.0),
                exps.at(vec![pure(0), rvar(0)]),
            ),
        ),
        Stage::value(
            &[rows, classes],
            Expr::div(exps.identity(), row_sum.at(vec![pure(0)])),
        ),
    ]
}

fn lower_lrn(spec: &LrnSpec, x: &Operand, out: &[usize]) -> Stage {
    let neighbour = pure(1)
        .plus(rvar(0))
        .shifted(-((spec.window / 2) as i64));
    let value = x.at(vec![pure(0), neighbour.clone(), pure(2), pure(3)]);
    let squares = Expr::reduce(
        ReduceOp::Sum,
        domain(&[spec.window]),
        Expr::Const(0.0),
        Expr::guarded(
            vec![Cond::in_bounds(neighbour, x.dims[1])],
            Expr::mul(value.clone(), value),
        ),
    );
    let alpha = (spec.alpha / spec.window as f32) as f64;
    let denominator = Expr::binary(
        BinaryOp::Pow,
        Expr::add(
            Expr::Const(spec.k as f64),
            Expr::mul(Expr::Const(alpha), squares),
        ),
        Expr::Const(spec.beta as f64),
    );
    Stage::value(out, Expr::div(x.identity(), denominator))
}

/// Nested selects over channel ranges, last input innermost.
fn lower_concat(inputs: &[Operand], out: &[usize]) -> Stage {
    let mut ranges = Vec::with_capacity(inputs.len());
    let mut start = 0i64;
    for input in inputs {
        let end = start + input.dims[1] as i64;
        ranges.push(start..end);
        start = end;
    }
    let pick = |input: &Operand, offset: i64| {
        input.at(vec![pure(0), pure(1).shifted(-offset), pure(2), pure(3)])
    };

    let mut pairs = inputs.iter().zip(ranges).rev();
    let mut body = match pairs.next() {
        Some((input, range)) => pick(input, range.start),
        None => Expr::Const(0.0),
    };
    for (input, range) in pairs {
        let cond = Cond::InRange {
            index: pure(1),
            lo: range.start,
            hi: range.end,
        };
        body = Expr::select(cond, pick(input, range.start), body);
    }
    Stage::value(out, body)
}

fn lower_batch_norm(
    spec: &BatchNormSpec,
    x: &Operand,
    params: &[Operand],
    out: &[usize],
) -> Stage {
    let factor = params[2].at(vec![Affine::constant(0)]);
    let inverse = Expr::select(
        Cond::Compare(
            CompareOp::Ne,
            Box::new(factor.clone()),
            Box::new(Expr::Const(0.0)),
        ),
        Expr::div(Expr::Const(1.0), factor),
        Expr::Const(0.0),
    );
    let centred = Expr::sub(
        x.identity(),
        Expr::mul(params[0].per_channel(), inverse.clone()),
    );
    let spread = Expr::unary(
        UnaryOp::Sqrt,
        Expr::add(
            Expr::mul(params[1].per_channel(), inverse),
            Expr::Const(spec.epsilon as f64),
        ),
    );
    Stage::value(out, Expr::div(centred, spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use dnnc::backend::TargetArch;
    use dnnc::graph::plan_group;
    use dnnc::{ExecutionStrategy, Graph, GroupId};

    fn lowered(graph: &Graph, group: GroupId, outputs: &[&str]) -> Lowered {
        let requested: HashSet<OpId> = outputs
            .iter()
            .map(|name| graph.op_id(name).unwrap())
            .collect();
        let members = graph.group(group).unwrap().members();
        let plan = plan_group(graph.arena(), group, members, &requested).unwrap();
        let view = GroupView {
            id: group,
            name: "g",
            target: TargetArch::Cpu,
            plan: &plan,
            arena: graph.arena(),
        };
        lower_group(&view).unwrap()
    }

    fn classifier() -> (Graph, GroupId) {
        let mut graph = Graph::new();
        let g = graph.add_group(ExecutionStrategy::Compiled, TargetArch::Cpu);
        let x = graph
            .add_op("x", OpKind::data(&[2, 5], DType::F32), &[], g)
            .unwrap();
        let fc = graph.add_op("fc", OpKind::affine(3), &[x], g).unwrap();
        graph.add_op("prob", OpKind::Softmax, &[fc], g).unwrap();
        (graph, g)
    }

    #[test]
    fn softmax_expands_into_four_funcs() {
        let (graph, g) = classifier();
        let lowered = lowered(&graph, g, &["prob"]);
        let names: Vec<&str> = lowered
            .program
            .funcs
            .iter()
            .map(|func| func.name.as_str())
            .collect();
        assert_eq!(
            names,
            ["f0_fc", "f1_prob_max", "f2_prob_exp", "f3_prob_sum", "f4_prob"]
        );
        let outputs: Vec<_> = lowered
            .program
            .outputs()
            .map(|(slot, func)| (slot, func.id))
            .collect();
        assert_eq!(outputs, [(0, FuncId(4))]);
        assert_eq!(lowered.program.func(FuncId(2)).dims, [2, 3]);
        assert_eq!(lowered.program.func(FuncId(1)).op, None);
    }

    #[test]
    fn read_only_data_ops_bind_to_caller_buffers() {
        let (graph, g) = classifier();
        let lowered = lowered(&graph, g, &["prob"]);
        assert_eq!(lowered.program.inputs.len(), 1);
        let Expr::Binary(BinaryOp::Add, dot, _) = &lowered.program.funcs[0].body else {
            panic!("affine with bias should end in an add");
        };
        let Expr::Reduce { body, .. } = dot.as_ref() else {
            panic!("affine should reduce over its inputs");
        };
        let Expr::Binary(BinaryOp::Mul, lhs, _) = body.as_ref() else {
            panic!("dot product should multiply");
        };
        assert!(matches!(
            lhs.as_ref(),
            Expr::Load {
                source: Source::Input(0),
                ..
            }
        ));
    }

    #[test]
    fn requested_data_ops_are_copied_to_an_output() {
        let (graph, g) = classifier();
        let lowered = lowered(&graph, g, &["x", "prob"]);
        let first = &lowered.program.funcs[0];
        assert_eq!(first.name, "f0_x");
        assert!(matches!(first.storage, Storage::Output(_)));
    }

    #[test]
    fn params_are_flattened_in_plan_order() {
        let (graph, g) = classifier();
        let lowered = lowered(&graph, g, &["prob"]);
        let fc = graph.op_id("fc").unwrap();
        assert_eq!(lowered.param_slots, [(fc, 0..2)]);
        assert_eq!(lowered.program.params[0].dims, [3, 5]);
        assert_eq!(lowered.program.params[1].dims, [3]);
    }
}
