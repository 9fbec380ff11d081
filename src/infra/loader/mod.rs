//! Reader for the binary model format.
//!
//! Layout (little-endian): magic, eight i32 hyperparameters, `n_vocab`
//! length-prefixed vocabulary entries, then tensor records until end of
//! stream. Each record is `n_dims, name_len, dtype, dims[n_dims], name,
//! payload`, with the payload length implied by dtype and dims.

use crate::core::model::{HParams, Model, TensorRegistry};
use crate::core::tensor::{quant, DType, Shape, Tensor};
use crate::core::tokenizer::Vocabulary;
use crate::core::{NerError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Instant;

pub const MODEL_MAGIC: u32 = 0x6767_6d6c;
pub const MAX_DIMS: usize = 4;

/// Header of one tensor record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl RecordHeader {
    pub fn payload_len(&self) -> Result<usize> {
        Shape::from_slice(&self.dims)
            .checked_nbytes(self.dtype)
            .ok_or_else(|| {
                NerError::format(format!(
                    "tensor '{}' with dims {:?} is too large",
                    self.name, self.dims
                ))
            })
    }
}

enum Scan<T> {
    Item(T),
    End,
    Truncated,
}

pub struct ModelLoader<'p> {
    path: &'p Path,
}

/// Opens `path` and reads a full model from it.
pub fn load_model(path: &Path) -> Result<Model> {
    let file = File::open(path).map_err(|source| NerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_model(BufReader::new(file), path)
}

/// Reads a model from `reader`; `path` is only used in diagnostics.
pub fn read_model<R: Read>(reader: R, path: &Path) -> Result<Model> {
    ModelLoader { path }.read(reader)
}

impl<'p> ModelLoader<'p> {
    fn read<R: Read>(&self, mut reader: R) -> Result<Model> {
        let started = Instant::now();

        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| NerError::from_read(e, self.path, "magic"))?;
        if magic != MODEL_MAGIC {
            return Err(NerError::format(format!(
                "bad magic: expected 0x{:08x}, got 0x{:08x}",
                MODEL_MAGIC, magic
            )));
        }

        let hparams = self.read_hparams(&mut reader)?;
        tracing::info!(
            "model hparams: n_vocab = {}, n_max_tokens = {}, n_embd = {}, n_intermediate = {}, n_head = {}, n_layer = {}, quant = {}, n_labels = {}",
            hparams.n_vocab,
            hparams.n_max_tokens,
            hparams.n_embd,
            hparams.n_intermediate,
            hparams.n_head,
            hparams.n_layer,
            hparams.quant,
            hparams.n_labels
        );

        let vocab = self.read_vocab(&mut reader, hparams.n_vocab)?;
        tracing::info!(
            "vocabulary: {} whole words, {} continuation pieces",
            vocab.word_count(),
            vocab.subword_count()
        );

        let mut registry = TensorRegistry::for_hparams(&hparams);
        self.read_tensors(&mut reader, &mut registry)?;

        let missing = registry.unpopulated();
        if !missing.is_empty() {
            tracing::warn!(
                "{} of {} tensors missing from file and left zeroed (first: {})",
                missing.len(),
                registry.len(),
                missing[0]
            );
        }
        tracing::info!(
            "loaded {}/{} tensors in {:?}",
            registry.populated(),
            registry.len(),
            started.elapsed()
        );

        let weights = registry.into_weights(&hparams)?;
        Ok(Model::new(hparams, vocab, weights))
    }

    fn read_hparams<R: Read>(&self, reader: &mut R) -> Result<HParams> {
        let mut raw = [0i32; HParams::FIELD_COUNT];
        reader
            .read_i32_into::<LittleEndian>(&mut raw)
            .map_err(|e| NerError::from_read(e, self.path, "header"))?;
        HParams::from_header(raw)
    }

    fn read_vocab<R: Read>(&self, reader: &mut R, n_vocab: usize) -> Result<Vocabulary> {
        let mut entries = Vec::with_capacity(n_vocab.min(1 << 20));
        for i in 0..n_vocab {
            let len = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| NerError::from_read(e, self.path, "vocabulary"))?;
            let mut bytes = Vec::new();
            let got = reader
                .by_ref()
                .take(u64::from(len))
                .read_to_end(&mut bytes)
                .map_err(|e| NerError::from_read(e, self.path, "vocabulary"))?;
            if got != len as usize {
                return Err(NerError::format(format!(
                    "unexpected end of file in vocabulary entry {} of {}",
                    i, n_vocab
                )));
            }
            entries.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        Vocabulary::from_entries(entries)
    }

    fn read_tensors<R: Read>(&self, reader: &mut R, registry: &mut TensorRegistry) -> Result<()> {
        loop {
            let header = match self.read_record_header(reader)? {
                Scan::Item(header) => header,
                Scan::End => return Ok(()),
                Scan::Truncated => {
                    tracing::warn!("model file ends inside a tensor record header; stopping scan");
                    return Ok(());
                }
            };
            let len = header.payload_len()?;

            let Some(tensor) = registry.get(&header.name) else {
                tracing::debug!("skipping unknown tensor '{}' ({} bytes)", header.name, len);
                let skipped = io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())
                    .map_err(|source| self.io_error(source))?;
                if skipped < len as u64 {
                    tracing::warn!("model file ends inside tensor '{}'; stopping scan", header.name);
                    return Ok(());
                }
                continue;
            };

            if tensor.shape().dims() != header.dims.as_slice() {
                return Err(NerError::TensorMismatch {
                    name: header.name,
                    expected: format!("{} {}", tensor.dtype(), tensor.shape()),
                    found: format!("{} {:?}", header.dtype, header.dims),
                });
            }
            let convert = tensor.dtype() != header.dtype;

            let Some(tensor) = registry.fill(&header.name) else {
                continue;
            };
            let read = if convert {
                tracing::debug!(
                    "converting tensor '{}' from {} to {}",
                    header.name,
                    header.dtype,
                    tensor.dtype()
                );
                self.read_converted(reader, header.dtype, tensor)
            } else {
                reader.read_exact(tensor.bytes_mut())
            };
            match read {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("model file ends inside tensor '{}'; stopping scan", header.name);
                    return Ok(());
                }
                Err(source) => return Err(self.io_error(source)),
            }
        }
    }

    /// Reads a payload stored as `from` row by row and re-encodes it into
    /// `tensor`'s own dtype.
    fn read_converted<R: Read>(&self, reader: &mut R, from: DType, tensor: &mut Tensor) -> io::Result<()> {
        let ne0 = tensor.ne0();
        let dtype = tensor.dtype();
        let mut raw = vec![0u8; from.row_bytes(ne0)];
        let mut values = vec![0.0f32; ne0];
        let mut encoded = Vec::with_capacity(dtype.row_bytes(ne0));
        for dst in tensor.bytes_mut().chunks_mut(dtype.row_bytes(ne0)) {
            reader.read_exact(&mut raw)?;
            quant::decode_row(from, &raw, &mut values);
            encoded.clear();
            quant::encode_row(dtype, &values, &mut encoded);
            dst.copy_from_slice(&encoded);
        }
        Ok(())
    }

    fn read_record_header<R: Read>(&self, reader: &mut R) -> Result<Scan<RecordHeader>> {
        let mut fixed = [0u8; 12];
        match self.fill(reader, &mut fixed)? {
            0 => return Ok(Scan::End),
            12 => {}
            _ => return Ok(Scan::Truncated),
        }
        let mut fields = &fixed[..];
        let n_dims = fields.read_i32::<LittleEndian>().map_err(|e| self.io_error(e))?;
        let name_len = fields.read_i32::<LittleEndian>().map_err(|e| self.io_error(e))?;
        let tag = fields.read_i32::<LittleEndian>().map_err(|e| self.io_error(e))?;

        if n_dims < 1 || n_dims as usize > MAX_DIMS {
            return Err(NerError::format(format!("tensor record with {} dimensions", n_dims)));
        }
        if name_len < 0 {
            return Err(NerError::format(format!("tensor record with name length {}", name_len)));
        }
        let dtype = DType::from_tag(tag)
            .ok_or_else(|| NerError::format(format!("tensor record with unknown dtype {}", tag)))?;

        let mut raw_dims = vec![0u8; n_dims as usize * 4];
        if self.fill(reader, &mut raw_dims)? < raw_dims.len() {
            return Ok(Scan::Truncated);
        }
        let mut dims = Vec::with_capacity(n_dims as usize);
        for chunk in raw_dims.chunks_exact(4) {
            let d = (&chunk[..]).read_i32::<LittleEndian>().map_err(|e| self.io_error(e))?;
            if d < 1 {
                return Err(NerError::format(format!("tensor record with dimension {}", d)));
            }
            dims.push(d as usize);
        }

        let mut name = Vec::new();
        let got = reader
            .by_ref()
            .take(name_len as u64)
            .read_to_end(&mut name)
            .map_err(|e| self.io_error(e))?;
        if got < name_len as usize {
            return Ok(Scan::Truncated);
        }

        Ok(Scan::Item(RecordHeader {
            name: String::from_utf8_lossy(&name).into_owned(),
            dtype,
            dims,
        }))
    }

    /// Reads until `buf` is full or the stream ends; returns the bytes read.
    fn fill<R: Read>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            }
        }
        Ok(filled)
    }

    fn io_error(&self, source: io::Error) -> NerError {
        NerError::Io {
            path: self.path.to_path_buf(),
            source,
        }
    }
}
