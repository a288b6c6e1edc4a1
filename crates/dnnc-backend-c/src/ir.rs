//! Loop-nest IR produced by lowering and consumed by C code generation.
//!
//! A [`Func`] defines every element of one dense buffer with a scalar [`Expr`] over the pure loop
//! variables of its output extents. Reductions introduce their own bounded loop variables.

use dnnc::ops::OpId;
use dnnc::tensor::DType;

/// Position of a func in [`Program::funcs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub usize);

/// Where a load reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Caller-bound tensor, indexed like the plan's external list.
    Input(usize),
    /// Parameter tensor, indexed over the flattened parameter slots of the group.
    Param(usize),
    /// Buffer computed by an earlier func.
    Func(FuncId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexVar {
    /// Loop over output dimension `n`.
    Pure(usize),
    /// Loop introduced by the `n`-th reduction of the func.
    Reduction(usize),
}

/// `offset + sum(coefficient * var)` over integer loop variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Affine {
    pub terms: Vec<(IndexVar, i64)>,
    pub offset: i64,
}

impl Affine {
    pub fn constant(offset: i64) -> Self {
        Affine {
            terms: Vec::new(),
            offset,
        }
    }

    pub fn pure(dim: usize) -> Self {
        Affine {
            terms: vec![(IndexVar::Pure(dim), 1)],
            offset: 0,
        }
    }

    pub fn reduction(id: usize) -> Self {
        Affine {
            terms: vec![(IndexVar::Reduction(id), 1)],
            offset: 0,
        }
    }

    pub fn scaled(mut self, factor: i64) -> Self {
        for (_, coefficient) in &mut self.terms {
            *coefficient *= factor;
        }
        self.offset *= factor;
        self
    }

    pub fn plus(mut self, other: Affine) -> Self {
        self.terms.extend(other.terms);
        self.offset += other.offset;
        self
    }

    pub fn shifted(mut self, delta: i64) -> Self {
        self.offset += delta;
        self
    }

    /// Identity indices `[v0, v1, ..]` for a buffer of `rank` dimensions.
    pub fn identity(rank: usize) -> Vec<Affine> {
        (0..rank).map(Affine::pure).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Exp,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    /// `lo <= index < hi`.
    InRange { index: Affine, lo: i64, hi: i64 },
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    All(Vec<Cond>),
}

impl Cond {
    pub fn in_bounds(index: Affine, extent: usize) -> Self {
        Cond::InRange {
            index,
            lo: 0,
            hi: extent as i64,
        }
    }
}

/// One reduction loop: `var` runs over `0..extent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionDomain {
    pub var: usize,
    pub extent: usize,
}

/// Scalar expression evaluated once per output element.
///
/// Arithmetic happens in the element type of the enclosing func unless a [`Expr::Cast`] says
/// otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    /// Smallest finite value of the current element type.
    Lowest,
    Load {
        source: Source,
        /// Extents used to linearize `index`; may reshape the source buffer.
        view: Vec<usize>,
        index: Vec<Affine>,
    },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Select {
        cond: Cond,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Reduce {
        op: ReduceOp,
        domain: Vec<ReductionDomain>,
        init: Box<Expr>,
        body: Box<Expr>,
    },
    Cast {
        from: DType,
        to: DType,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn load(source: Source, view: &[usize], index: Vec<Affine>) -> Self {
        Expr::Load {
            source,
            view: view.to_vec(),
            index,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn unary(op: UnaryOp, value: Expr) -> Self {
        Expr::Unary(op, Box::new(value))
    }

    pub fn select(cond: Cond, then: Expr, otherwise: Expr) -> Self {
        Expr::Select {
            cond,
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn reduce(op: ReduceOp, domain: Vec<ReductionDomain>, init: Expr, body: Expr) -> Self {
        Expr::Reduce {
            op,
            domain,
            init: Box::new(init),
            body: Box::new(body),
        }
    }

    pub fn cast(from: DType, to: DType, value: Expr) -> Self {
        Expr::Cast {
            from,
            to,
            value: Box::new(value),
        }
    }

    /// Zero outside `conds`, `value` inside.
    pub fn guarded(conds: Vec<Cond>, value: Expr) -> Self {
        Self::select(Cond::All(conds), value, Expr::Const(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Backend-owned buffer at this position of the plan's output list.
    Output(usize),
    /// Allocated and freed by the generated entrypoint.
    Scratch,
}

/// Loop annotations chosen by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Outermost loop that gets a parallel-for pragma, with the number of loops collapsed into it.
    pub parallel: Option<(usize, usize)>,
    /// Vectorize the innermost loop.
    pub vectorize: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    pub id: FuncId,
    /// C identifier stem, unique within the program.
    pub name: String,
    /// Op whose value this func materializes, if it is the op's final func.
    pub op: Option<OpId>,
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub body: Expr,
    pub storage: Storage,
    pub schedule: Schedule,
}

/// Element type and extents of a caller-bound or parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDecl {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl BufferDecl {
    pub fn len(&self) -> usize {
        dnnc::tensor::element_count(&self.dims)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the code generator needs for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub inputs: Vec<BufferDecl>,
    pub params: Vec<BufferDecl>,
    pub funcs: Vec<Func>,
}

impl Program {
    pub fn func(&self, id: FuncId) -> &Func {
        &self.funcs[id.0]
    }

    pub fn outputs(&self) -> impl Iterator<Item = (usize, &Func)> {
        self.funcs.iter().filter_map(|func| match func.storage {
            Storage::Output(slot) => Some((slot, func)),
            Storage::Scratch => None,
        })
    }
}
