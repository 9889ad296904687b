//! Pure numeric processing kernels (spec §4.E): raw-byte-to-`f64` conversion, resampling, and
//! windowed aggregation. Every function here is a free function over borrowed slices — no
//! allocation, no I/O, no async. The source controller and read scheduler in `nexus-engine`
//! are the only callers; this crate knows nothing about catalogs, pipes, or caches.

use nexus_core::{NexusDataType, NexusError, NexusResult, RepresentationKind};

/// Step 1 of spec §4.D's read pipeline: decode `data` (raw bytes, native byte order) into
/// `f64`, mapping any element whose `status` byte is `0` to `NaN`. `status.len()` is the
/// element count; `data.len()` must be exactly `status.len() * dtype.element_size()`.
pub fn convert_to_f64(
    data: &[u8],
    status: &[u8],
    dtype: NexusDataType,
    out: &mut [f64],
) -> NexusResult<()> {
    let element_size = dtype.element_size();
    require(data.len() == status.len() * element_size, "data length does not match status length and element size")?;
    require(out.len() == status.len(), "output length does not match status length")?;

    for (i, &valid) in status.iter().enumerate() {
        out[i] = if valid == 0 {
            f64::NAN
        } else {
            decode_numeric(&data[i * element_size..(i + 1) * element_size], dtype)
        };
    }
    Ok(())
}

/// Upsample `input` by repeating each sample `ratio` times, skipping the first `skip_leading`
/// repeats of the conceptual `input.len() * ratio`-long sequence so the output begins exactly
/// at the caller's requested boundary (spec §4.D, scenario 2 in spec §8).
pub fn resample(input: &[f64], ratio: usize, skip_leading: usize, out: &mut [f64]) -> NexusResult<()> {
    require(ratio > 0, "resample ratio must be positive")?;
    require(
        skip_leading + out.len() <= input.len() * ratio,
        "resample window exceeds available repeated samples",
    )?;

    for (i, slot) in out.iter_mut().enumerate() {
        let repeated_index = skip_leading + i;
        *slot = input[repeated_index / ratio];
    }
    Ok(())
}

/// Downsample `data`/`status` into `out`, one output element per `block_size`-element window
/// (spec §4.D step 4). `kind` must not be `Original` or `Resampled`.
///
/// `Min`/`Max`/`Mean`/`Std`/`Rms`/`Sum`/`MeanPolarDeg` skip `NaN` inputs (a window with no
/// valid samples yields `NaN`). `MinBitwise`/`MaxBitwise` instead fold the *raw* unsigned bit
/// patterns of valid elements and reinterpret the result in `dtype`'s encoding (spec §8:
/// "operate on raw integer bit patterns before NaN mapping").
pub fn aggregate(
    data: &[u8],
    status: &[u8],
    dtype: NexusDataType,
    kind: RepresentationKind,
    block_size: usize,
    out: &mut [f64],
) -> NexusResult<()> {
    require(kind.is_aggregation(), "aggregate called with a non-aggregating kind")?;
    require(block_size >= 2, "aggregation block size must cover at least two samples")?;
    let element_size = dtype.element_size();
    require(data.len() == status.len() * element_size, "data length does not match status length and element size")?;
    require(status.len() % block_size == 0, "element count is not a multiple of the aggregation block size")?;
    let window_count = status.len() / block_size;
    require(out.len() == window_count, "output length does not match window count")?;

    for (w, slot) in out.iter_mut().enumerate() {
        let window = w * block_size..(w + 1) * block_size;
        *slot = if kind.is_bitwise() {
            aggregate_bitwise(data, status, dtype, kind, window)
        } else {
            aggregate_numeric(data, status, dtype, kind, window)
        };
    }
    Ok(())
}

fn aggregate_bitwise(
    data: &[u8],
    status: &[u8],
    dtype: NexusDataType,
    kind: RepresentationKind,
    window: std::ops::Range<usize>,
) -> f64 {
    let element_size = dtype.element_size();
    let mut acc: Option<u64> = None;
    for i in window {
        if status[i] == 0 {
            continue;
        }
        let bits = raw_bits(&data[i * element_size..(i + 1) * element_size], dtype);
        acc = Some(match acc {
            None => bits,
            Some(a) => match kind {
                RepresentationKind::MinBitwise => a & bits,
                RepresentationKind::MaxBitwise => a | bits,
                _ => unreachable!("aggregate_bitwise called with a non-bitwise kind"),
            },
        });
    }
    match acc {
        None => f64::NAN,
        Some(bits) => bits_to_value(bits, dtype),
    }
}

fn aggregate_numeric(
    data: &[u8],
    status: &[u8],
    dtype: NexusDataType,
    kind: RepresentationKind,
    window: std::ops::Range<usize>,
) -> f64 {
    let element_size = dtype.element_size();
    let values = window
        .clone()
        .filter(|&i| status[i] != 0)
        .map(|i| decode_numeric(&data[i * element_size..(i + 1) * element_size], dtype));

    match kind {
        RepresentationKind::Mean => mean(values),
        RepresentationKind::MeanPolarDeg => mean_polar_degrees(values),
        RepresentationKind::Min => values.fold(f64::NAN, |acc, v| if acc.is_nan() || v < acc { v } else { acc }),
        RepresentationKind::Max => values.fold(f64::NAN, |acc, v| if acc.is_nan() || v > acc { v } else { acc }),
        RepresentationKind::Sum => {
            let mut any = false;
            let total = values.fold(0.0, |acc, v| {
                any = true;
                acc + v
            });
            if any { total } else { f64::NAN }
        }
        RepresentationKind::Std => std_sample(values),
        RepresentationKind::Rms => rms(values),
        _ => unreachable!("aggregate_numeric called with a non-numeric-reducer kind"),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { f64::NAN } else { sum / f64::from(count) }
}

fn rms(values: impl Iterator<Item = f64>) -> f64 {
    let (sum_sq, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v * v, count + 1));
    if count == 0 { f64::NAN } else { (sum_sq / f64::from(count)).sqrt() }
}

fn std_sample(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.len() < 2 {
        return f64::NAN;
    }
    let n = collected.len() as f64;
    let mean = collected.iter().sum::<f64>() / n;
    let variance = collected.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Circular mean in degrees (spec §9 open question on `MeanPolarDeg`): convert each valid
/// sample to radians, average its unit vector, and convert the resultant angle back to
/// degrees in `(-180, 180]`. This matches the independent-reference definition of a circular
/// mean rather than a naive arithmetic mean of the degree values, which would be wrong across
/// the 0/360 boundary.
fn mean_polar_degrees(values: impl Iterator<Item = f64>) -> f64 {
    let (sin_sum, cos_sum, count) = values.fold((0.0, 0.0, 0u32), |(s, c, n), deg| {
        let rad = deg.to_radians();
        (s + rad.sin(), c + rad.cos(), n + 1)
    });
    if count == 0 {
        return f64::NAN;
    }
    sin_sum.atan2(cos_sum).to_degrees()
}

fn decode_numeric(bytes: &[u8], dtype: NexusDataType) -> f64 {
    match dtype {
        NexusDataType::U8 => bytes[0] as f64,
        NexusDataType::I8 => bytes[0] as i8 as f64,
        NexusDataType::U16 => u16::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::I16 => i16::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::U32 => u32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::I32 => i32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::U64 => u64::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::I64 => i64::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::F32 => f32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        NexusDataType::F64 => f64::from_ne_bytes(bytes.try_into().unwrap()),
    }
}

/// Zero-extends an element's raw bytes into a `u64` bit pattern, for bitwise reducers.
fn raw_bits(bytes: &[u8], dtype: NexusDataType) -> u64 {
    match dtype {
        NexusDataType::U8 | NexusDataType::I8 => bytes[0] as u64,
        NexusDataType::U16 | NexusDataType::I16 => u16::from_ne_bytes(bytes.try_into().unwrap()) as u64,
        NexusDataType::U32 | NexusDataType::I32 => u32::from_ne_bytes(bytes.try_into().unwrap()) as u64,
        NexusDataType::F32 => u32::from_ne_bytes(bytes.try_into().unwrap()) as u64,
        NexusDataType::U64 | NexusDataType::I64 => u64::from_ne_bytes(bytes.try_into().unwrap()),
        NexusDataType::F64 => u64::from_ne_bytes(bytes.try_into().unwrap()),
    }
}

/// Reinterprets a folded bit pattern back into `dtype`'s numeric domain: float types are
/// bit-cast, integer types are numerically promoted (the bits *are* the unsigned value).
fn bits_to_value(bits: u64, dtype: NexusDataType) -> f64 {
    match dtype {
        NexusDataType::F32 => f32::from_bits(bits as u32) as f64,
        NexusDataType::F64 => f64::from_bits(bits),
        _ => bits as f64,
    }
}

fn require(condition: bool, message: &str) -> NexusResult<()> {
    if condition {
        Ok(())
    } else {
        Err(NexusError::Validation(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_bytes_f64(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn round_trip_aggregation_mean() {
        // 10 one-second samples aggregated into a single 10s mean.
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let data = le_bytes_f64(&values);
        let status = vec![1u8; 10];
        let mut out = [0.0; 1];
        aggregate(&data, &status, NexusDataType::F64, RepresentationKind::Mean, 10, &mut out).unwrap();
        assert!((out[0] - 5.5).abs() < 1e-9);
    }

    #[test]
    fn aggregation_skips_nan_inputs() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let data = le_bytes_f64(&values);
        let status = vec![1u8, 0u8, 1u8, 1u8];
        let mut out = [0.0; 1];
        aggregate(&data, &status, NexusDataType::F64, RepresentationKind::Mean, 4, &mut out).unwrap();
        assert!((out[0] - (1.0 + 3.0 + 4.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn aggregation_all_invalid_window_yields_nan() {
        let values = [1.0, 2.0];
        let data = le_bytes_f64(&values);
        let status = vec![0u8, 0u8];
        let mut out = [0.0; 1];
        aggregate(&data, &status, NexusDataType::F64, RepresentationKind::Sum, 2, &mut out).unwrap();
        assert!(out[0].is_nan());
    }

    #[test]
    fn bitwise_min_operates_on_raw_bits() {
        let values: Vec<u32> = vec![0b1100, 0b1010];
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let status = vec![1u8, 1u8];
        let mut out = [0.0; 1];
        aggregate(&data, &status, NexusDataType::U32, RepresentationKind::MinBitwise, 2, &mut out).unwrap();
        assert_eq!(out[0] as u32, 0b1000);
    }

    #[test]
    fn resample_boundary_matches_scenario() {
        // base period 1s, target period 100ms => ratio 10. Request window begins 200ms past
        // the first base sample's start and needs 15 target samples (1.5s).
        let input = [0.0, 1.0];
        let mut out = [0.0; 15];
        resample(&input, 10, 2, &mut out).unwrap();
        let expected = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        assert_eq!(out, expected);
    }

    #[test]
    fn mean_polar_deg_wraps_across_zero() {
        let values = [350.0, 10.0];
        let data = le_bytes_f64(&values);
        let status = vec![1u8, 1u8];
        let mut out = [0.0; 1];
        aggregate(&data, &status, NexusDataType::F64, RepresentationKind::MeanPolarDeg, 2, &mut out).unwrap();
        // A naive arithmetic mean would give 180; the circular mean is 0.
        assert!(out[0].abs() < 1e-9);
    }

    #[test]
    fn std_uses_sample_denominator() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let data = le_bytes_f64(&values);
        let status = vec![1u8; 8];
        let mut out = [0.0; 1];
        aggregate(&data, &status, NexusDataType::F64, RepresentationKind::Std, 8, &mut out).unwrap();
        assert!((out[0] - 2.138_089_935_3).abs() < 1e-6);
    }
}
