//! Reader and writer for the flat parameter file format.
//!
//! Layout, every integer and float in the host's native byte order:
//!
//! ```text
//! u64 record_count
//! record_count x {
//!     u64 name_len, name bytes, u64 tensor_count
//!     tensor_count x { i32 rank, i32 extent[rank], f32 data[product(extent)] }
//! }
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};

use crate::params::Params;
use crate::tensor::{Tensor, TensorValue, MAX_RANK};

pub fn save_params(path: impl AsRef<Path>, params: &Params) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_params(&mut writer, params)?;
    writer.flush()?;
    Ok(())
}

pub fn load_params(path: impl AsRef<Path>) -> Result<Params> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_params(&mut BufReader::new(file))
}

/// Serializes `params`. Only `f32` tensors are representable.
pub fn write_params(writer: &mut impl Write, params: &Params) -> Result<()> {
    writer.write_all(&(params.len() as u64).to_ne_bytes())?;
    for (name, tensors) in params {
        writer.write_all(&(name.len() as u64).to_ne_bytes())?;
        writer.write_all(name.as_bytes())?;
        writer.write_all(&(tensors.len() as u64).to_ne_bytes())?;
        for (slot, value) in tensors.iter().enumerate() {
            let tensor = value.try_as_tensor::<f32>().ok_or_else(|| {
                anyhow!(
                    "parameter {name}[{slot}] is {}, only f32 tensors can be saved",
                    value.dtype()
                )
            })?;
            ensure!(tensor.rank() > 0, "parameter {name}[{slot}] is an empty tensor");
            writer.write_all(&(tensor.rank() as i32).to_ne_bytes())?;
            for &extent in tensor.dims() {
                let extent = i32::try_from(extent)
                    .map_err(|_| anyhow!("parameter {name}[{slot}] extent {extent} overflows i32"))?;
                writer.write_all(&extent.to_ne_bytes())?;
            }
            writer.write_all(bytemuck::cast_slice(tensor.data()))?;
        }
    }
    Ok(())
}

pub fn read_params(reader: &mut impl Read) -> Result<Params> {
    let record_count = read_u64(reader)?;
    let mut params = Params::new();
    for _ in 0..record_count {
        let name_len = read_u64(reader)?;
        let name_bytes = read_exactly(reader, name_len)
            .with_context(|| format!("reading a {name_len}-byte record name"))?;
        let name = String::from_utf8(name_bytes)?;

        let tensor_count = read_u64(reader)?;
        let mut tensors = Vec::new();
        for slot in 0..tensor_count {
            let rank = read_i32(reader)?;
            ensure!(
                (1..=MAX_RANK as i32).contains(&rank),
                "parameter {name}[{slot}] has unsupported rank {rank}"
            );
            let mut dims = Vec::with_capacity(rank as usize);
            for _ in 0..rank {
                let extent = read_i32(reader)?;
                if extent < 0 {
                    bail!("parameter {name}[{slot}] has negative extent {extent}");
                }
                dims.push(extent as usize);
            }
            let byte_len = dims
                .iter()
                .try_fold(std::mem::size_of::<f32>(), |acc, &extent| acc.checked_mul(extent))
                .ok_or_else(|| anyhow!("parameter {name}[{slot}] extents {dims:?} overflow"))?;
            let bytes = read_exactly(reader, byte_len as u64)
                .with_context(|| format!("reading parameter {name}[{slot}]"))?;
            let data: Vec<f32> = bytes
                .chunks_exact(std::mem::size_of::<f32>())
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect();
            tensors.push(TensorValue::from(Tensor::from_vec(&dims, data)?));
        }
        if params.insert(name.clone(), tensors).is_some() {
            bail!("parameter file repeats record {name}");
        }
    }
    Ok(params)
}

/// Reads `len` bytes, growing the buffer only as data arrives.
fn read_exactly(reader: &mut impl Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    ensure!(
        buf.len() as u64 == len,
        "unexpected end of file: wanted {len} bytes, found {}",
        buf.len()
    );
    Ok(buf)
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_i32(reader: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn sample() -> Params {
        let mut params = Params::new();
        params.insert(
            "conv1".to_string(),
            vec![
                TensorValue::from(
                    Tensor::from_vec(&[2, 1, 1, 2], vec![1.0f32, -2.0, 3.5, 4.0]).unwrap(),
                ),
                TensorValue::from(Tensor::from_vec(&[2], vec![0.5f32, -0.5]).unwrap()),
            ],
        );
        params.insert(
            "fc".to_string(),
            vec![TensorValue::from(Tensor::full(&[3, 4], 0.25f32))],
        );
        params
    }

    #[test]
    fn params_survive_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let params = sample();
        save_params(&path, &params).unwrap();
        let loaded = load_params(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn layout_matches_the_documented_byte_sequence() {
        let mut params = Params::new();
        params.insert(
            "b".to_string(),
            vec![TensorValue::from(Tensor::from_vec(&[2], vec![1.0f32, 2.0]).unwrap())],
        );
        let mut bytes = Vec::new();
        write_params(&mut bytes, &params).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u64.to_ne_bytes());
        expected.extend_from_slice(&1u64.to_ne_bytes());
        expected.extend_from_slice(b"b");
        expected.extend_from_slice(&1u64.to_ne_bytes());
        expected.extend_from_slice(&1i32.to_ne_bytes());
        expected.extend_from_slice(&2i32.to_ne_bytes());
        expected.extend_from_slice(&1.0f32.to_ne_bytes());
        expected.extend_from_slice(&2.0f32.to_ne_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn non_f32_parameters_are_rejected() {
        let mut params = Params::new();
        params.insert("w".to_string(), vec![TensorValue::zeros(DType::F64, &[2])]);
        let mut bytes = Vec::new();
        let err = write_params(&mut bytes, &params).unwrap_err();
        assert!(err.to_string().contains("only f32"), "{err}");
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut bytes = Vec::new();
        write_params(&mut bytes, &sample()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(read_params(&mut bytes.as_slice()).is_err());
    }

    fn header(name: &[u8], name_len: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_ne_bytes());
        bytes.extend_from_slice(&name_len.to_ne_bytes());
        bytes.extend_from_slice(name);
        bytes
    }

    #[test]
    fn oversized_name_length_is_an_error() {
        let bytes = header(b"w", u64::MAX / 2);
        let err = read_params(&mut bytes.as_slice()).unwrap_err();
        assert!(format!("{err:#}").contains("unexpected end of file"), "{err:#}");
    }

    #[test]
    fn overflowing_extents_are_an_error() {
        let mut bytes = header(b"w", 1);
        bytes.extend_from_slice(&1u64.to_ne_bytes());
        bytes.extend_from_slice(&4i32.to_ne_bytes());
        for _ in 0..4 {
            bytes.extend_from_slice(&i32::MAX.to_ne_bytes());
        }
        let err = read_params(&mut bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("overflow"), "{err}");
    }

    #[test]
    fn rank_zero_is_rejected() {
        let mut bytes = header(b"w", 1);
        bytes.extend_from_slice(&1u64.to_ne_bytes());
        bytes.extend_from_slice(&0i32.to_ne_bytes());
        let err = read_params(&mut bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("unsupported rank 0"), "{err}");
    }
}
