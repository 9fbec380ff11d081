//! Produces model files in the format [`crate::infra::loader`] reads.

use crate::core::model::{HParams, TensorRegistry};
use crate::core::tensor::{quant, DType};
use crate::core::{NerError, Result};
use crate::infra::loader::{MAX_DIMS, MODEL_MAGIC};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

struct Record {
    name: String,
    dtype: DType,
    dims: Vec<usize>,
    payload: Vec<u8>,
}

/// Builder for a model file: header, vocabulary, then tensor records in the
/// order they were added.
pub struct ModelWriter {
    hparams: HParams,
    vocab: Vec<String>,
    records: Vec<Record>,
}

impl ModelWriter {
    pub fn new(hparams: HParams) -> Self {
        Self {
            hparams,
            vocab: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn vocab<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vocab = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a record, encoding `values` (row-major, `dims[0]` contiguous) as `dtype`.
    pub fn tensor(mut self, name: &str, dtype: DType, dims: &[usize], values: &[f32]) -> Result<Self> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(NerError::format(format!("cannot write {} with {} dims", name, dims.len())));
        }
        let numel: usize = dims.iter().product();
        if values.len() != numel {
            return Err(NerError::BufferTooSmall {
                needed: numel,
                got: values.len(),
            });
        }
        let mut payload = Vec::with_capacity(dtype.row_bytes(dims[0]) * (numel / dims[0].max(1)));
        for row in values.chunks(dims[0].max(1)) {
            quant::encode_row(dtype, row, &mut payload);
        }
        self.records.push(Record {
            name: name.to_string(),
            dtype,
            dims: dims.to_vec(),
            payload,
        });
        Ok(self)
    }

    /// Adds a record for every tensor the hyperparameters declare, in their
    /// declared encodings, with values from `init(name, numel)`.
    pub fn all_tensors<F>(mut self, mut init: F) -> Result<Self>
    where
        F: FnMut(&str, usize) -> Vec<f32>,
    {
        let registry = TensorRegistry::for_hparams(&self.hparams);
        for name in registry.names() {
            let Some(tensor) = registry.get(name) else {
                continue;
            };
            let values = init(name, tensor.numel());
            self = self.tensor(name, tensor.dtype(), tensor.shape().dims(), &values)?;
        }
        Ok(self)
    }

    pub fn write_to<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(MODEL_MAGIC)?;
        for field in self.hparams.to_header() {
            out.write_i32::<LittleEndian>(field)?;
        }
        for entry in &self.vocab {
            out.write_u32::<LittleEndian>(entry.len() as u32)?;
            out.write_all(entry.as_bytes())?;
        }
        for record in &self.records {
            out.write_i32::<LittleEndian>(record.dims.len() as i32)?;
            out.write_i32::<LittleEndian>(record.name.len() as i32)?;
            out.write_i32::<LittleEndian>(record.dtype.tag())?;
            for &d in &record.dims {
                out.write_i32::<LittleEndian>(d as i32)?;
            }
            out.write_all(record.name.as_bytes())?;
            out.write_all(&record.payload)?;
        }
        out.flush()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)
            .map_err(|e| NerError::format(format!("failed to serialize model: {}", e)))?;
        Ok(bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |source| NerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        self.write_to(BufWriter::new(file)).map_err(io_err)?;
        tracing::info!("wrote model with {} tensors to {}", self.records.len(), path.display());
        Ok(())
    }
}
