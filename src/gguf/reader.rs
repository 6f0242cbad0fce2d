//! Memory-mapped GGUF reader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use super::GgmlType;
use crate::quantization::RawData;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const DEFAULT_ALIGNMENT: u64 = 32;
const MAX_DIMS: usize = 4;
const MAX_ARRAY_DEPTH: usize = 4;

/// Typed metadata value from the GGUF header
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    /// Integer view of unsigned/signed scalar values
    pub fn to_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One named tensor in a GGUF container.
#[derive(Debug, Clone)]
pub struct TensorRecord {
    /// Tensor name
    pub name: String,
    /// Encoded payload, borrowed from the mapped file
    pub data: RawData,
    /// Quantization tag
    pub ggml_type: GgmlType,
    /// Dimensions as stored in the container (innermost first)
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone)]
struct TensorInfo {
    name: String,
    shape: Vec<usize>,
    ggml_type: GgmlType,
    /// Absolute byte range in the file
    start: usize,
    len: usize,
}

/// Reader over a memory-mapped GGUF file.
pub struct GgufReader {
    path: PathBuf,
    mmap: Arc<Mmap>,
    version: u32,
    alignment: u64,
    metadata: BTreeMap<String, MetadataValue>,
    tensors: Vec<TensorInfo>,
}

impl GgufReader {
    /// Map and parse a GGUF file
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Opening GGUF container: {:?}", path);

        let file = std::fs::File::open(path).map_err(|e| container_error(path, e.to_string()))?;
        // The mapping is read-only and lives as long as any tensor referencing it.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| container_error(path, e.to_string()))?;

        let header = parse(&mmap).map_err(|reason| container_error(path, reason))?;

        tracing::debug!(
            "GGUF v{} with {} tensors, {} metadata entries",
            header.version,
            header.tensors.len(),
            header.metadata.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap: Arc::new(mmap),
            version: header.version,
            alignment: header.alignment,
            metadata: header.metadata,
            tensors: header.tensors,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Data-section alignment in bytes
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }

    /// Value of `general.architecture`, if present
    pub fn architecture(&self) -> Option<&str> {
        self.metadata.get("general.architecture").and_then(MetadataValue::as_str)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Size of the mapped file in bytes
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    /// Tensor records in file order. Payloads share the mapping, nothing is copied.
    pub fn records(&self) -> impl Iterator<Item = TensorRecord> + '_ {
        let backing: Arc<dyn AsRef<[u8]> + Send + Sync> = self.mmap.clone();
        self.tensors.iter().map(move |info| TensorRecord {
            name: info.name.clone(),
            data: RawData::slice(backing.clone(), info.start, info.len),
            ggml_type: info.ggml_type,
            shape: info.shape.clone(),
        })
    }
}

impl std::fmt::Debug for GgufReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufReader")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("num_tensors", &self.tensors.len())
            .finish()
    }
}

fn container_error(path: &Path, reason: String) -> crate::GgufError {
    crate::GgufError::ContainerRead {
        path: path.display().to_string(),
        reason,
    }
}

struct Header {
    version: u32,
    alignment: u64,
    metadata: BTreeMap<String, MetadataValue>,
    tensors: Vec<TensorInfo>,
}

struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| format!("unexpected end of file at offset {}", self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize, String> {
        let n = self.u64()?;
        usize::try_from(n).map_err(|_| format!("length {} does not fit in memory", n))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid UTF-8 string: {}", e))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn value(&mut self, value_type: u32, depth: usize) -> Result<MetadataValue, String> {
        let value = match value_type {
            0 => MetadataValue::U8(self.u8()?),
            1 => MetadataValue::I8(self.u8()? as i8),
            2 => MetadataValue::U16(self.u16()?),
            3 => MetadataValue::I16(self.u16()? as i16),
            4 => MetadataValue::U32(self.u32()?),
            5 => MetadataValue::I32(self.u32()? as i32),
            6 => MetadataValue::F32(f32::from_bits(self.u32()?)),
            7 => MetadataValue::Bool(self.u8()? != 0),
            8 => MetadataValue::String(self.string()?),
            9 => {
                if depth >= MAX_ARRAY_DEPTH {
                    return Err("metadata arrays nested too deeply".to_string());
                }
                let inner = self.u32()?;
                let len = self.len()?;
                if len > self.remaining() {
                    return Err(format!("metadata array length {} exceeds file size", len));
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(inner, depth + 1)?);
                }
                MetadataValue::Array(items)
            }
            10 => MetadataValue::U64(self.u64()?),
            11 => MetadataValue::I64(self.u64()? as i64),
            12 => MetadataValue::F64(f64::from_bits(self.u64()?)),
            other => return Err(format!("unknown metadata value type {}", other)),
        };
        Ok(value)
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    match value % alignment {
        0 => value,
        rem => value + (alignment - rem),
    }
}

fn parse(data: &[u8]) -> Result<Header, String> {
    let mut cur = ByteCursor::new(data);

    if cur.take(4).map_err(|_| "file too small for GGUF header".to_string())? != GGUF_MAGIC {
        return Err("invalid GGUF magic".to_string());
    }
    let version = cur.u32()?;
    if !(2..=3).contains(&version) {
        return Err(format!("unsupported GGUF version {}", version));
    }
    let tensor_count = cur.len()?;
    let metadata_count = cur.len()?;

    let mut metadata = BTreeMap::new();
    for _ in 0..metadata_count {
        let key = cur.string()?;
        let value_type = cur.u32()?;
        let value = cur.value(value_type, 0)?;
        metadata.insert(key, value);
    }

    let alignment = match metadata.get("general.alignment") {
        Some(value) => value
            .to_u64()
            .filter(|&a| a > 0 && a.is_power_of_two())
            .ok_or_else(|| format!("invalid general.alignment {:?}", value))?,
        None => DEFAULT_ALIGNMENT,
    };

    // (name, dims, type, relative offset)
    let mut raw_infos = Vec::with_capacity(tensor_count.min(cur.remaining()));
    for _ in 0..tensor_count {
        let name = cur.string()?;
        let n_dims = cur.u32()? as usize;
        if n_dims > MAX_DIMS {
            return Err(format!("tensor '{}' has {} dimensions", name, n_dims));
        }
        let mut shape = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            shape.push(cur.len()?);
        }
        let type_id = cur.u32()?;
        let ggml_type = GgmlType::from_u32(type_id)
            .ok_or_else(|| format!("tensor '{}' has unknown type id {}", name, type_id))?;
        let offset = cur.len()?;
        raw_infos.push((name, shape, ggml_type, offset));
    }

    let data_start = align_up(cur.pos, alignment as usize);

    let mut tensors = Vec::with_capacity(raw_infos.len());
    for (name, shape, ggml_type, offset) in raw_infos {
        if offset % alignment as usize != 0 {
            return Err(format!("tensor '{}' offset {} is not aligned", name, offset));
        }
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| format!("tensor '{}' element count overflows", name))?;
        let block = ggml_type.block_size();
        if shape.first().is_some_and(|d| d % block != 0) {
            return Err(format!(
                "tensor '{}' row length {} is not a multiple of the {} block size {}",
                name, shape[0], ggml_type, block
            ));
        }
        let len = ggml_type.byte_size(elements).ok_or_else(|| {
            format!(
                "tensor '{}' has {} elements, not a multiple of the {} block size {}",
                name,
                elements,
                ggml_type,
                block
            )
        })?;
        let start = data_start
            .checked_add(offset)
            .filter(|start| start.checked_add(len).is_some_and(|end| end <= data.len()))
            .ok_or_else(|| format!("tensor '{}' data lies outside the file", name))?;

        tensors.push(TensorInfo {
            name,
            shape,
            ggml_type,
            start,
            len,
        });
    }

    Ok(Header {
        version,
        alignment,
        metadata,
        tensors,
    })
}
