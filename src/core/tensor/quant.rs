//! Row codecs for the three stored element encodings.
//!
//! Q4_0 stores blocks of [`QK4_0`] values as an f16 scale followed by
//! sixteen bytes of nibbles. Byte `j` holds element `j` in its low nibble and
//! element `j + 16` in its high nibble; a nibble `q` decodes to `(q - 8) * d`.

use super::DType;
use byteorder::{ByteOrder, LittleEndian};
use half::f16;

pub const QK4_0: usize = 32;
pub const Q4_0_BLOCK_BYTES: usize = 2 + QK4_0 / 2;

/// Decodes one row of `out.len()` elements from `bytes`.
pub fn decode_row(dtype: DType, bytes: &[u8], out: &mut [f32]) {
    match dtype {
        DType::F32 => LittleEndian::read_f32_into(&bytes[..out.len() * 4], out),
        DType::F16 => {
            for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *dst = f16::from_bits(LittleEndian::read_u16(src)).to_f32();
            }
        }
        DType::Q4_0 => dequantize_row_q4_0(bytes, out),
    }
}

/// Appends the encoding of `row` to `dst`.
pub fn encode_row(dtype: DType, row: &[f32], dst: &mut Vec<u8>) {
    match dtype {
        DType::F32 => {
            let start = dst.len();
            dst.resize(start + row.len() * 4, 0);
            LittleEndian::write_f32_into(row, &mut dst[start..]);
        }
        DType::F16 => {
            for &v in row {
                let mut buf = [0u8; 2];
                LittleEndian::write_u16(&mut buf, f16::from_f32(v).to_bits());
                dst.extend_from_slice(&buf);
            }
        }
        DType::Q4_0 => quantize_row_q4_0(row, dst),
    }
}

fn dequantize_row_q4_0(bytes: &[u8], out: &mut [f32]) {
    let n = out.len();
    for (block_idx, block) in bytes.chunks_exact(Q4_0_BLOCK_BYTES).enumerate() {
        let base = block_idx * QK4_0;
        if base >= n {
            break;
        }
        let d = f16::from_bits(LittleEndian::read_u16(&block[..2])).to_f32();
        let qs = &block[2..];
        for (j, &q) in qs.iter().enumerate() {
            let lo = base + j;
            let hi = base + j + QK4_0 / 2;
            if lo < n {
                out[lo] = ((q & 0x0F) as i32 - 8) as f32 * d;
            }
            if hi < n {
                out[hi] = ((q >> 4) as i32 - 8) as f32 * d;
            }
        }
    }
}

fn quantize_row_q4_0(row: &[f32], dst: &mut Vec<u8>) {
    for chunk in row.chunks(QK4_0) {
        let mut block = [0.0f32; QK4_0];
        block[..chunk.len()].copy_from_slice(chunk);

        // Scale so that the value with the largest magnitude maps to -8.
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in &block {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, f16::from_f32(d).to_bits());
        dst.extend_from_slice(&buf);

        for j in 0..QK4_0 / 2 {
            let q0 = ((block[j] * id + 8.5) as i32).clamp(0, 15) as u8;
            let q1 = ((block[j + QK4_0 / 2] * id + 8.5) as i32).clamp(0, 15) as u8;
            dst.push(q0 | (q1 << 4));
        }
    }
}
