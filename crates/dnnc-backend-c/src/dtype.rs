use dnnc::tensor::DType;

pub(crate) fn c_type(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float",
        DType::F64 => "double",
        DType::I8 => "int8_t",
        DType::I16 => "int16_t",
        DType::I32 => "int32_t",
        DType::I64 => "int64_t",
        DType::U8 => "uint8_t",
        DType::U16 => "uint16_t",
        DType::U32 => "uint32_t",
        DType::U64 => "uint64_t",
    }
}

/// Unsigned type of the same width; signed addition goes through it so overflow wraps.
pub(crate) fn unsigned_c_type(dtype: DType) -> Option<&'static str> {
    match dtype {
        DType::I8 => Some("uint8_t"),
        DType::I16 => Some("uint16_t"),
        DType::I32 => Some("uint32_t"),
        DType::I64 => Some("uint64_t"),
        _ => None,
    }
}

/// Suffix selecting the libm variant for `dtype`: `expf` for floats, `exp` for doubles.
pub(crate) fn math_suffix(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f",
        _ => "",
    }
}

/// Smallest finite value as a C expression.
pub(crate) fn lowest_literal(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "-FLT_MAX",
        DType::F64 => "-DBL_MAX",
        DType::I8 => "INT8_MIN",
        DType::I16 => "INT16_MIN",
        DType::I32 => "INT32_MIN",
        DType::I64 => "INT64_MIN",
        DType::U8 | DType::U16 | DType::U32 | DType::U64 => "0",
    }
}
