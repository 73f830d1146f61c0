//! Module containing the container codec: serialization, deserialization,
//! header validation and the lazy tensor views.
use crate::lib::{Cow, HashMap, String, ToString, Vec};
use crate::slice::{InvalidSlice, SliceIterator, TensorIndexer};
use crate::varint::{self, VarintError};
use core::fmt::Display;
use core::str::Utf8Error;
use sha2::{Digest, Sha256};
#[cfg(feature = "std")]
use std::{io::Write, path::Path};

const MAX_HEADER_SIZE: usize = 100 * 1024 * 1024;
const N_LEN: usize = size_of::<u64>();
const FORMAT_VERSION: u8 = 0;

/// Possible errors that could occur while reading
/// A bintensors file.
#[derive(Debug)]
pub enum BinTensorError {
    /// The buffer is smaller than the 8-byte length prefix
    HeaderTooSmall,
    /// The header is larger than the configured maximum (100 MiB by default),
    /// which is considered too large
    HeaderTooLarge,
    /// The declared header length exceeds the buffer, or the total prefix +
    /// header length is not 8-byte aligned, or the header content stops short
    /// of what its own counts declare
    InvalidHeaderLength,
    /// The format version byte is not one this crate understands
    InvalidFormatVersion(u8),
    /// A length, count, dimension or offset in the header is not a valid varint
    InvalidVarint(VarintError),
    /// The dtype code is not part of the registry
    UnknownDtype(u8),
    /// A tensor shape breaks the rank or dimension limits, or its element
    /// count overflows
    InvalidShape,
    /// The header declares more descriptors than the configured maximum
    TooManyDescriptors(usize),
    /// The header declares more metadata entries than the configured maximum
    TooManyMetadataEntries(usize),
    /// The offsets declared for tensor with name `String` in the header are invalid
    InvalidOffset(String),
    /// Two tensors share the same name
    DuplicateName(String),
    /// The descriptor at this index is not referenced by exactly one name
    MissingDescriptor(usize),
    /// The name map references a descriptor index that does not exist
    IndexOutOfRange(usize),
    /// A name or metadata string is not valid UTF-8
    InvalidUtf8(Utf8Error),
    /// The tensor name was not found in the archive
    TensorNotFound(String),
    /// The follow tensor cannot be created because the buffer size doesn't match shape + dtype
    InvalidTensorView(Dtype, Vec<usize>, usize),
    /// IoError
    #[cfg(feature = "std")]
    IoError(std::io::Error),
}

#[cfg(feature = "std")]
impl From<std::io::Error> for BinTensorError {
    fn from(error: std::io::Error) -> BinTensorError {
        BinTensorError::IoError(error)
    }
}

impl From<VarintError> for BinTensorError {
    fn from(error: VarintError) -> BinTensorError {
        BinTensorError::InvalidVarint(error)
    }
}

impl Display for BinTensorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use BinTensorError::*;

        match self {
            HeaderTooSmall => write!(f, "header too small"),
            HeaderTooLarge => write!(f, "header too large"),
            InvalidHeaderLength => write!(f, "invalid header length"),
            InvalidFormatVersion(version) => write!(f, "unsupported format version {version}"),
            InvalidVarint(error) => write!(f, "invalid varint in header: {error}"),
            UnknownDtype(code) => write!(f, "unknown dtype code {code}"),
            InvalidShape => write!(f, "invalid shape, rank or dimension over the limit or overflowing"),
            TooManyDescriptors(n) => write!(f, "header declares {n} tensors, over the limit"),
            TooManyMetadataEntries(n) => write!(f, "header declares {n} metadata entries, over the limit"),
            InvalidOffset(name) => write!(f, "invalid offset for tensor `{name}`"),
            DuplicateName(name) => write!(f, "duplicate tensor name `{name}`"),
            MissingDescriptor(index) => {
                write!(f, "descriptor {index} is not referenced by exactly one name")
            }
            IndexOutOfRange(index) => write!(f, "descriptor index {index} out of range"),
            InvalidUtf8(error) => write!(f, "invalid UTF-8 in header: {error}"),
            TensorNotFound(name) => write!(f, "tensor `{name}` not found"),
            InvalidTensorView(dtype, shape, n_bytes) => {
                write!(f, "tensor of type {dtype} and shape (")?;
                for (i, &dim) in shape.iter().enumerate() {
                    write!(f, "{sep}{dim}", sep = if i == 0 { "" } else { ", " })?;
                }
                write!(f, ") can't be created from {n_bytes} bytes")
            }
            #[cfg(feature = "std")]
            IoError(error) => write!(f, "I/O error: {error}"),
        }
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for BinTensorError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            BinTensorError::InvalidUtf8(source) => Some(source),
            BinTensorError::InvalidVarint(source) => Some(source),
            _ => None,
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BinTensorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BinTensorError::InvalidUtf8(source) => Some(source),
            BinTensorError::InvalidVarint(source) => Some(source),
            BinTensorError::IoError(source) => Some(source),
            _ => None,
        }
    }
}

/// Limits enforced while parsing a header from untrusted input.
///
/// The defaults are deliberately generous for real model files while keeping
/// a hostile header from driving allocations: counts are checked before the
/// corresponding table is materialized.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum number of bytes the header may declare (default 100 MiB)
    pub max_header_bytes: usize,
    /// Maximum number of tensor descriptors (default 2^20)
    pub max_descriptors: usize,
    /// Maximum tensor rank (default 8)
    pub max_rank: usize,
    /// Maximum size of a single dimension (default 2^62)
    pub max_dim: u64,
    /// Maximum number of metadata entries (default 2^16)
    pub max_metadata_entries: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: MAX_HEADER_SIZE,
            max_descriptors: 1 << 20,
            max_rank: 8,
            max_dim: 1 << 62,
            max_metadata_entries: 1 << 16,
        }
    }
}

struct PreparedData {
    n: u64,
    header_bytes: Vec<u8>,
    offset: usize,
}

/// The trait necessary to enable bintensors to serialize a tensor
/// If you have an owned tensor like this:
///
/// ```rust
/// use bintensors::tensor::{View, Dtype};
/// use std::borrow::Cow;
/// struct Tensor{ dtype: MyDtype, shape: Vec<usize>, data: Vec<u8>}
///
/// # type MyDtype = Dtype;
/// impl<'data> View for &'data Tensor{
///    fn dtype(&self) -> Dtype{
///        self.dtype.into()
///    }
///    fn shape(&self) -> &[usize]{
///         &self.shape
///    }
///    fn data(&self) -> Cow<'_, [u8]>{
///        (&self.data).into()
///    }
///    fn data_len(&self) -> usize{
///        self.data.len()
///    }
/// }
/// ```
///
/// For a borrowed tensor:
///
/// ```rust
/// use bintensors::tensor::{View, Dtype};
/// use std::borrow::Cow;
/// struct Tensor<'data>{ dtype: MyDtype, shape: Vec<usize>, data: &'data[u8]}
///
/// # type MyDtype = Dtype;
/// impl<'data> View for Tensor<'data>{
///    fn dtype(&self) -> Dtype{
///        self.dtype.into()
///    }
///    fn shape(&self) -> &[usize]{
///         &self.shape
///    }
///    fn data(&self) -> Cow<'_, [u8]>{
///        self.data.into()
///    }
///    fn data_len(&self) -> usize{
///        self.data.len()
///    }
/// }
/// ```
///
/// Now if you have some unknown buffer that could be on GPU for instance,
/// you can implement the trait to return an owned local buffer containing the data
/// on CPU (needed to write on disk)
/// ```rust
/// use bintensors::tensor::{View, Dtype};
/// use std::borrow::Cow;
///
/// # type MyDtype = Dtype;
/// # type OpaqueGpu = Vec<u8>;
/// struct Tensor{ dtype: MyDtype, shape: Vec<usize>, data: OpaqueGpu }
///
/// impl View for Tensor{
///    fn dtype(&self) -> Dtype{
///        self.dtype.into()
///    }
///    fn shape(&self) -> &[usize]{
///         &self.shape
///    }
///    fn data(&self) -> Cow<'_, [u8]>{
///        // This copies data from GPU to CPU.
///        let data: Vec<u8> = self.data.to_vec();
///        data.into()
///    }
///    fn data_len(&self) -> usize{
///        let n: usize = self.shape.iter().product();
///        let bytes_per_element = self.dtype.size();
///        n * bytes_per_element
///    }
/// }
/// ```
pub trait View {
    /// The `Dtype` of the tensor
    fn dtype(&self) -> Dtype;
    /// The shape of the tensor
    fn shape(&self) -> &[usize];
    /// The data of the tensor
    fn data(&self) -> Cow<'_, [u8]>;
    /// The length of the data, in bytes.
    /// This is necessary as this might be faster to get than `data().len()`
    /// for instance for tensors residing in GPU.
    fn data_len(&self) -> usize;
}

fn checked_data_len<V: View>(tensor: &V) -> Result<usize, BinTensorError> {
    let n_elements: u64 = tensor
        .shape()
        .iter()
        .try_fold(1u64, |acc, &dim| acc.checked_mul(dim as u64))
        .ok_or(BinTensorError::InvalidShape)?;
    let n_bytes = n_elements
        .checked_mul(tensor.dtype().size() as u64)
        .ok_or(BinTensorError::InvalidShape)?;
    let n = tensor.data_len();
    if n as u64 != n_bytes {
        return Err(BinTensorError::InvalidTensorView(
            tensor.dtype(),
            tensor.shape().to_vec(),
            n,
        ));
    }
    Ok(n)
}

fn prepare<S, V, I>(
    data: I,
    data_info: Option<HashMap<String, String>>,
) -> Result<(PreparedData, Vec<V>), BinTensorError>
where
    S: AsRef<str>,
    V: View,
    I: IntoIterator<Item = (S, V)>,
{
    // Descriptor order is the caller's iteration order; feeding entries from
    // an order-preserving container makes the output reproducible.
    let mut tensors: Vec<V> = Vec::new();
    let mut hmetadata = Vec::new();
    let mut offset = 0;

    for (name, tensor) in data {
        let n = checked_data_len(&tensor)?;
        let tensor_info = TensorInfo {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            data_offsets: (offset, offset + n),
        };
        offset += n;
        hmetadata.push((name.as_ref().to_string(), tensor_info));
        tensors.push(tensor);
    }

    let metadata: Metadata = Metadata::new(data_info, hmetadata)?;
    let mut metadata_buf = metadata.to_bytes();

    // Force alignment to 8 bytes.
    let aligned_metadata_len = metadata_buf.len().next_multiple_of(N_LEN);
    metadata_buf.resize(aligned_metadata_len, b' ');

    Ok((
        PreparedData {
            n: aligned_metadata_len as u64,
            header_bytes: metadata_buf,
            offset,
        },
        tensors,
    ))
}

/// Serialize to an owned byte buffer the dictionnary of tensors.
pub fn serialize<S: AsRef<str>, V: View, I: IntoIterator<Item = (S, V)>>(
    data: I,
    data_info: Option<HashMap<String, String>>,
) -> Result<Vec<u8>, BinTensorError> {
    let (
        PreparedData {
            n,
            header_bytes,
            offset,
        },
        tensors,
    ) = prepare(data, data_info)?;

    if n > MAX_HEADER_SIZE as u64 {
        return Err(BinTensorError::HeaderTooLarge);
    }

    let expected_size = N_LEN + header_bytes.len() + offset;
    let mut buffer: Vec<u8> = Vec::with_capacity(expected_size);
    buffer.extend(n.to_le_bytes());
    buffer.extend(header_bytes);
    for tensor in tensors {
        buffer.extend(tensor.data().as_ref());
    }
    Ok(buffer)
}

/// Serialize to an owned byte buffer the dictionnary of tensors, and return
/// the SHA-256 digest of that buffer alongside it.
///
/// The digest covers the entire serialized stream: length prefix, header and
/// payload. Any independent SHA-256 implementation run over the returned
/// bytes yields the same 32-byte value.
pub fn serialize_checksum<S: AsRef<str>, V: View, I: IntoIterator<Item = (S, V)>>(
    data: I,
    data_info: Option<HashMap<String, String>>,
) -> Result<([u8; 32], Vec<u8>), BinTensorError> {
    let buffer = serialize(data, data_info)?;
    let digest: [u8; 32] = Sha256::digest(&buffer).into();
    Ok((digest, buffer))
}

#[cfg(feature = "std")]
fn buffered_write_to_file<V: View>(
    path: impl AsRef<Path>,
    n: u64,
    header_bytes: &[u8],
    tensors: &[V],
    total_size: usize,
) -> Result<(), BinTensorError> {
    let file = std::fs::File::create(path)?;

    file.set_len(total_size as u64)?;

    // Write with direct I/O (bypassing the page cache) using F_NOCACHE.
    #[cfg(target_os = "macos")]
    unsafe {
        use std::os::fd::AsRawFd;

        libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1);
    }

    let mut f = std::io::BufWriter::with_capacity(1024 * 1024, file);

    f.write_all(n.to_le_bytes().as_ref())?;
    f.write_all(header_bytes)?;
    for tensor in tensors {
        f.write_all(tensor.data().as_ref())?;
    }

    f.flush()?;

    Ok(())
}

/// Serialize to a regular file the dictionnary of tensors.
/// Writing directly to file reduces the need to allocate the whole amount to
/// memory.
#[cfg(feature = "std")]
pub fn serialize_to_file<S, V, I>(
    data: I,
    data_info: Option<HashMap<String, String>>,
    filename: &std::path::Path,
) -> Result<(), BinTensorError>
where
    S: AsRef<str>,
    V: View,
    I: IntoIterator<Item = (S, V)>,
{
    let (
        PreparedData {
            n,
            header_bytes,
            offset,
            ..
        },
        tensors,
    ) = prepare(data, data_info)?;

    if n > MAX_HEADER_SIZE as u64 {
        return Err(BinTensorError::HeaderTooLarge);
    }

    let total_size = N_LEN + header_bytes.len() + offset;

    buffered_write_to_file(filename, n, &header_bytes, &tensors, total_size)?;

    Ok(())
}

/// A structure owning some metadata to lookup tensors on a shared `data`
/// byte-buffer (not owned).
#[derive(Debug)]
pub struct BinTensors<'data> {
    metadata: Metadata,
    data: &'data [u8],
}

impl<'data> BinTensors<'data> {
    /// Given a byte-buffer representing the whole bintensors file
    /// parses the header, and returns the size of the header + the parsed data,
    /// using the default [`Limits`].
    pub fn read_metadata(buffer: &'data [u8]) -> Result<(usize, Metadata), BinTensorError> {
        Self::read_metadata_with(buffer, &Limits::default())
    }

    /// Given a byte-buffer representing the whole bintensors file
    /// parses the header, and returns the size of the header + the parsed data.
    ///
    /// The declared header length is checked against the buffer *before* the
    /// header is touched, and against `limits.max_header_bytes` before
    /// anything is allocated, so a small file cannot declare a giant header.
    pub fn read_metadata_with(
        buffer: &'data [u8],
        limits: &Limits,
    ) -> Result<(usize, Metadata), BinTensorError> {
        let buffer_len = buffer.len();
        let Some(header_size_bytes) = buffer.get(..N_LEN) else {
            return Err(BinTensorError::HeaderTooSmall);
        };
        let arr: [u8; N_LEN] = header_size_bytes
            .try_into()
            .expect("this can't fail due to how `header_size_bytes` is defined above");
        let declared = u64::from_le_bytes(arr);

        if declared > (buffer_len - N_LEN) as u64 {
            return Err(BinTensorError::InvalidHeaderLength);
        }
        let n = declared as usize;
        if n > limits.max_header_bytes {
            return Err(BinTensorError::HeaderTooLarge);
        }
        if (n + N_LEN) % N_LEN != 0 {
            return Err(BinTensorError::InvalidHeaderLength);
        }

        let metadata = Metadata::from_bytes(&buffer[N_LEN..N_LEN + n], limits)?;
        metadata.validate(buffer_len - N_LEN - n)?;

        Ok((n, metadata))
    }

    /// Given a byte-buffer representing the whole bintensors file
    /// parses it and returns the Deserialized form (No Tensor allocation).
    ///
    /// ```
    /// use bintensors::tensor::{serialize, BinTensors, Dtype, TensorView};
    ///
    /// let raw = [0u8; 16];
    /// let weight = TensorView::new(Dtype::I32, vec![2, 2], &raw).unwrap();
    /// let serialized = serialize([("test", &weight)], None).unwrap();
    /// let tensors = BinTensors::deserialize(&serialized).unwrap();
    /// let tensor = tensors.tensor("test").unwrap();
    /// assert_eq!(tensor.shape(), &[2, 2]);
    /// ```
    pub fn deserialize(buffer: &'data [u8]) -> Result<Self, BinTensorError> {
        Self::deserialize_with(buffer, &Limits::default())
    }

    /// Same as [`BinTensors::deserialize`] with caller-provided [`Limits`].
    pub fn deserialize_with(
        buffer: &'data [u8],
        limits: &Limits,
    ) -> Result<Self, BinTensorError> {
        let (n, metadata) = BinTensors::read_metadata_with(buffer, limits)?;
        let data = &buffer[N_LEN + n..];
        Ok(Self { metadata, data })
    }

    /// Returns the tensors contained within the BinTensors.
    /// The tensors returned are merely views and the data is not owned by this
    /// structure.
    pub fn tensors(&self) -> Vec<(String, TensorView<'data>)> {
        let mut tensors = Vec::with_capacity(self.metadata.names.len());
        for name in &self.metadata.names {
            let index = self.metadata.index_map[name];
            let info = &self.metadata.tensors[index];
            let tensorview = TensorView {
                dtype: info.dtype,
                shape: info.shape.clone(),
                data: &self.data[info.data_offsets.0..info.data_offsets.1],
            };
            tensors.push((name.to_string(), tensorview));
        }
        tensors
    }

    /// Returns an iterator over the tensors contained within the BinTensors,
    /// in name-map insertion order.
    /// The tensors returned are merely views and the data is not owned by this
    /// structure.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorView<'data>)> {
        self.metadata.names.iter().map(|name| {
            let index = self.metadata.index_map[name];
            let info = &self.metadata.tensors[index];
            (
                name.as_str(),
                TensorView {
                    dtype: info.dtype,
                    shape: info.shape.clone(),
                    data: &self.data[info.data_offsets.0..info.data_offsets.1],
                },
            )
        })
    }

    /// Allow the user to get a specific tensor within the BinTensors.
    /// The tensor returned is merely a view and the data is not owned by this
    /// structure.
    pub fn tensor(&self, tensor_name: &str) -> Result<TensorView<'data>, BinTensorError> {
        self.metadata.tensor_view(tensor_name, self.data)
    }

    /// Return the names of the tensors within the BinTensors, in name-map
    /// insertion order, which is the order the tensors were declared in at
    /// serialization time.
    pub fn names(&self) -> Vec<&'_ str> {
        self.metadata.names.iter().map(String::as_str).collect()
    }

    /// Return the names of the tensors sorted by their offset into the
    /// payload, the order a streaming reader encounters them in.
    pub fn offset_keys(&self) -> Vec<String> {
        self.metadata.offset_keys()
    }

    /// Whether a tensor with this name is present.
    pub fn contains(&self, tensor_name: &str) -> bool {
        self.metadata.info(tensor_name).is_some()
    }

    /// The textual metadata stored in the header, if any.
    pub fn metadata(&self) -> &Option<HashMap<String, String>> {
        self.metadata.metadata()
    }

    /// Return how many tensors are currently stored within the BinTensors.
    #[inline]
    pub fn len(&self) -> usize {
        self.metadata.tensors.len()
    }

    /// Indicate if the BinTensors contains or not any tensor.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.tensors.is_empty()
    }
}

/// A bintensors file opened through a memory mapping.
///
/// The header is parsed and validated when the file is opened; afterwards
/// reads can no longer fail for validation reasons. The handle keeps the
/// mapping (and through it the file) alive for its own lifetime and is safe
/// to share across threads for concurrent reads.
///
/// The mapping is read-only, but the operating system does not stop other
/// processes from truncating or rewriting the underlying file; doing so while
/// this handle is alive is undefined behavior.
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct BinTensorsFile {
    metadata: Metadata,
    /// Start of the payload region inside the mapping.
    offset: usize,
    mmap: memmap2::Mmap,
}

#[cfg(feature = "std")]
impl BinTensorsFile {
    /// Open and validate a bintensors file with the default [`Limits`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BinTensorError> {
        Self::open_with(path, &Limits::default())
    }

    /// Open and validate a bintensors file.
    pub fn open_with(path: impl AsRef<Path>, limits: &Limits) -> Result<Self, BinTensorError> {
        let file = std::fs::File::open(path)?;
        if file.metadata()?.len() < N_LEN as u64 {
            return Err(BinTensorError::HeaderTooSmall);
        }
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
        let (n, metadata) = BinTensors::read_metadata_with(&mmap, limits)?;
        Ok(Self {
            metadata,
            offset: N_LEN + n,
            mmap,
        })
    }

    fn data(&self) -> &[u8] {
        &self.mmap[self.offset..]
    }

    /// Allow the user to get a specific tensor within the file.
    /// The tensor returned is a view over the mapping; no bytes are copied.
    pub fn tensor(&self, tensor_name: &str) -> Result<TensorView<'_>, BinTensorError> {
        self.metadata.tensor_view(tensor_name, self.data())
    }

    /// Returns the tensors contained within the file.
    pub fn tensors(&self) -> Vec<(String, TensorView<'_>)> {
        let data = self.data();
        let mut tensors = Vec::with_capacity(self.metadata.names.len());
        for name in &self.metadata.names {
            let index = self.metadata.index_map[name];
            let info = &self.metadata.tensors[index];
            let tensorview = TensorView {
                dtype: info.dtype,
                shape: info.shape.clone(),
                data: &data[info.data_offsets.0..info.data_offsets.1],
            };
            tensors.push((name.to_string(), tensorview));
        }
        tensors
    }

    /// Return the names of the tensors within the file, in name-map insertion
    /// order.
    pub fn names(&self) -> Vec<&'_ str> {
        self.metadata.names.iter().map(String::as_str).collect()
    }

    /// Return the names of the tensors sorted by their offset into the
    /// payload.
    pub fn offset_keys(&self) -> Vec<String> {
        self.metadata.offset_keys()
    }

    /// Whether a tensor with this name is present.
    pub fn contains(&self, tensor_name: &str) -> bool {
        self.metadata.info(tensor_name).is_some()
    }

    /// The textual metadata stored in the header, if any.
    pub fn metadata(&self) -> &Option<HashMap<String, String>> {
        self.metadata.metadata()
    }

    /// Return how many tensors are currently stored within the file.
    #[inline]
    pub fn len(&self) -> usize {
        self.metadata.tensors.len()
    }

    /// Indicate if the file contains or not any tensor.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.tensors.is_empty()
    }
}

/// Open a bintensors file, memory-map it, and validate the header.
///
/// ```
/// use bintensors::tensor::{safe_open, serialize_to_file, Dtype, TensorView};
///
/// let raw = [0u8; 8];
/// let bias = TensorView::new(Dtype::F32, vec![2], &raw).unwrap();
/// let path = std::env::temp_dir().join("model.bt");
/// serialize_to_file([("bias", &bias)], None, &path).unwrap();
/// let tensors = safe_open(&path).unwrap();
/// assert_eq!(tensors.names(), ["bias"]);
/// # std::fs::remove_file(&path).ok();
/// ```
#[cfg(feature = "std")]
pub fn safe_open(path: impl AsRef<Path>) -> Result<BinTensorsFile, BinTensorError> {
    BinTensorsFile::open(path)
}

/// The stuct representing the header of bintensors files which allow
/// indexing into the raw byte-buffer array and how to interpret it.
#[derive(Debug, Clone)]
pub struct Metadata {
    metadata: Option<HashMap<String, String>>,
    tensors: Vec<TensorInfo>,
    index_map: HashMap<String, usize>,
    /// Tensor names in name-map order; `index_map` resolves each to its
    /// descriptor.
    names: Vec<String>,
}

/// Bounds-checked cursor over the raw header bytes.
struct HeaderReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    fn read_u8(&mut self) -> Result<u8, BinTensorError> {
        let &byte = self
            .buffer
            .get(self.position)
            .ok_or(BinTensorError::InvalidHeaderLength)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_varint(&mut self) -> Result<u64, BinTensorError> {
        let (value, read) = varint::decode(&self.buffer[self.position..])?;
        self.position += read;
        Ok(value)
    }

    /// Reads a varint that is used as an in-memory count or offset, so it
    /// must also fit in `usize`.
    fn read_len(&mut self) -> Result<usize, BinTensorError> {
        usize::try_from(self.read_varint()?).map_err(|_| BinTensorError::InvalidHeaderLength)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BinTensorError> {
        let stop = self
            .position
            .checked_add(len)
            .ok_or(BinTensorError::InvalidHeaderLength)?;
        let bytes = self
            .buffer
            .get(self.position..stop)
            .ok_or(BinTensorError::InvalidHeaderLength)?;
        self.position = stop;
        Ok(bytes)
    }

    fn read_str(&mut self, len: usize) -> Result<&'a str, BinTensorError> {
        core::str::from_utf8(self.read_bytes(len)?).map_err(BinTensorError::InvalidUtf8)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }
}

impl Metadata {
    /// Creates a new metadata structure.
    /// May fail if there is incorrect data in the tensor info, notably
    /// duplicate names or offsets which do not tile the data buffer.
    pub fn new(
        metadata: Option<HashMap<String, String>>,
        tensors: Vec<(String, TensorInfo)>,
    ) -> Result<Self, BinTensorError> {
        let mut index_map = HashMap::with_capacity(tensors.len());
        let mut names = Vec::with_capacity(tensors.len());
        let mut infos = Vec::with_capacity(tensors.len());

        for (index, (name, info)) in tensors.into_iter().enumerate() {
            if index_map.insert(name.clone(), index).is_some() {
                return Err(BinTensorError::DuplicateName(name));
            }
            names.push(name);
            infos.push(info);
        }

        let metadata = Self {
            metadata,
            tensors: infos,
            index_map,
            names,
        };
        metadata.validate(metadata.data_len())?;
        Ok(metadata)
    }

    /// Parses the header content (everything after the length prefix,
    /// including the alignment padding).
    fn from_bytes(buffer: &[u8], limits: &Limits) -> Result<Self, BinTensorError> {
        let mut r = HeaderReader::new(buffer);

        let version = r.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(BinTensorError::InvalidFormatVersion(version));
        }

        let n_tensors = r.read_len()?;
        if n_tensors > limits.max_descriptors {
            return Err(BinTensorError::TooManyDescriptors(n_tensors));
        }
        // A descriptor takes at least four header bytes, which bounds the
        // preallocation by the header itself.
        let mut tensors = Vec::with_capacity(n_tensors.min(r.remaining().len() / 4));
        for _ in 0..n_tensors {
            let code = r.read_u8()?;
            let dtype = Dtype::try_from(code)?;
            let rank = r.read_len()?;
            if rank > limits.max_rank {
                return Err(BinTensorError::InvalidShape);
            }
            let mut shape = Vec::with_capacity(rank);
            for _ in 0..rank {
                let dim = r.read_varint()?;
                if dim > limits.max_dim {
                    return Err(BinTensorError::InvalidShape);
                }
                shape.push(usize::try_from(dim).map_err(|_| BinTensorError::InvalidShape)?);
            }
            let start = r.read_len()?;
            let stop = r.read_len()?;
            tensors.push(TensorInfo {
                dtype,
                shape,
                data_offsets: (start, stop),
            });
        }

        let n_names = r.read_len()?;
        let mut index_map = HashMap::with_capacity(n_names.min(r.remaining().len() / 2));
        let mut names = Vec::with_capacity(n_names.min(r.remaining().len() / 2));
        let mut covered = vec![false; n_tensors];
        for _ in 0..n_names {
            let len = r.read_len()?;
            let name = r.read_str(len)?;
            let index = r.read_len()?;
            if index >= n_tensors {
                return Err(BinTensorError::IndexOutOfRange(index));
            }
            if index_map.insert(name.to_string(), index).is_some() {
                return Err(BinTensorError::DuplicateName(name.to_string()));
            }
            if covered[index] {
                return Err(BinTensorError::MissingDescriptor(index));
            }
            covered[index] = true;
            names.push(name.to_string());
        }
        if let Some(index) = covered.iter().position(|&seen| !seen) {
            return Err(BinTensorError::MissingDescriptor(index));
        }

        // The metadata count is always present, 0 standing for "none".
        let n_meta = r.read_len()?;
        let metadata = if n_meta == 0 {
            None
        } else {
            if n_meta > limits.max_metadata_entries {
                return Err(BinTensorError::TooManyMetadataEntries(n_meta));
            }
            let mut map = HashMap::with_capacity(n_meta.min(r.remaining().len() / 2));
            for _ in 0..n_meta {
                let k_len = r.read_len()?;
                let key = r.read_str(k_len)?.to_string();
                let v_len = r.read_len()?;
                let value = r.read_str(v_len)?.to_string();
                map.insert(key, value);
            }
            Some(map)
        };

        // Whatever is left can only be alignment padding.
        let padding = r.remaining();
        if padding.len() >= N_LEN || padding.iter().any(|&byte| byte != b' ' && byte != 0) {
            return Err(BinTensorError::InvalidHeaderLength);
        }

        Ok(Self {
            metadata,
            tensors,
            index_map,
            names,
        })
    }

    /// Encodes the header content (unpadded).
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 16 * self.tensors.len());
        buf.push(FORMAT_VERSION);

        varint::encode(self.tensors.len() as u64, &mut buf);
        for info in &self.tensors {
            buf.push(info.dtype.into());
            varint::encode(info.shape.len() as u64, &mut buf);
            for &dim in &info.shape {
                varint::encode(dim as u64, &mut buf);
            }
            varint::encode(info.data_offsets.0 as u64, &mut buf);
            varint::encode(info.data_offsets.1 as u64, &mut buf);
        }

        varint::encode(self.names.len() as u64, &mut buf);
        for name in &self.names {
            varint::encode(name.len() as u64, &mut buf);
            buf.extend(name.as_bytes());
            varint::encode(self.index_map[name] as u64, &mut buf);
        }

        match &self.metadata {
            Some(metadata) => {
                varint::encode(metadata.len() as u64, &mut buf);
                // Sorted so repeated serialization is byte-identical.
                let mut entries: Vec<_> = metadata.iter().collect();
                entries.sort_by(|(left, _), (right, _)| left.cmp(right));
                for (key, value) in entries {
                    varint::encode(key.len() as u64, &mut buf);
                    buf.extend(key.as_bytes());
                    varint::encode(value.len() as u64, &mut buf);
                    buf.extend(value.as_bytes());
                }
            }
            None => varint::encode(0, &mut buf),
        }

        buf
    }

    fn validate(&self, payload_len: usize) -> Result<(), BinTensorError> {
        for (i, info) in self.tensors.iter().enumerate() {
            let (s, e) = info.data_offsets;
            if s > e {
                return Err(BinTensorError::InvalidOffset(self.tensor_name(i)));
            }
            let n_elements: u64 = info
                .shape
                .iter()
                .try_fold(1u64, |acc, &dim| acc.checked_mul(dim as u64))
                .ok_or(BinTensorError::InvalidShape)?;
            let n_bytes = n_elements
                .checked_mul(info.dtype.size() as u64)
                .ok_or(BinTensorError::InvalidShape)?;
            if (e - s) as u64 != n_bytes {
                return Err(BinTensorError::InvalidOffset(self.tensor_name(i)));
            }
        }

        // Ranges sorted by begin must be disjoint, at most 7 alignment bytes
        // apart, and end inside the payload.
        let mut order: Vec<usize> = (0..self.tensors.len()).collect();
        order.sort_unstable_by_key(|&i| self.tensors[i].data_offsets);
        let mut cursor = 0usize;
        for &i in &order {
            let (s, e) = self.tensors[i].data_offsets;
            if s < cursor || s - cursor >= N_LEN {
                return Err(BinTensorError::InvalidOffset(self.tensor_name(i)));
            }
            cursor = e;
        }
        if cursor > payload_len {
            let last = order
                .last()
                .map(|&i| self.tensor_name(i))
                .unwrap_or_else(|| "no_tensor".to_string());
            return Err(BinTensorError::InvalidOffset(last));
        }
        Ok(())
    }

    fn tensor_name(&self, index: usize) -> String {
        self.index_map
            .iter()
            .find_map(|(name, &i)| if i == index { Some(name.clone()) } else { None })
            .unwrap_or_else(|| "no_tensor".to_string())
    }

    fn tensor_view<'data>(
        &self,
        tensor_name: &str,
        data: &'data [u8],
    ) -> Result<TensorView<'data>, BinTensorError> {
        let &index = self
            .index_map
            .get(tensor_name)
            .ok_or_else(|| BinTensorError::TensorNotFound(tensor_name.to_string()))?;
        let info = &self.tensors[index];
        Ok(TensorView {
            dtype: info.dtype,
            shape: info.shape.clone(),
            data: &data[info.data_offsets.0..info.data_offsets.1],
        })
    }

    /// Gives back the tensor metadata
    pub fn info(&self, name: &str) -> Option<&TensorInfo> {
        let &index = self.index_map.get(name)?;
        self.tensors.get(index)
    }

    /// Gives back the tensor metadata
    pub fn tensors(&self) -> HashMap<String, &TensorInfo> {
        self.index_map
            .iter()
            .map(|(tensor_name, &index)| (tensor_name.clone(), &self.tensors[index]))
            .collect()
    }

    /// Gives back the tensor names ordered by offset
    pub fn offset_keys(&self) -> Vec<String> {
        let mut index_vec: Vec<_> = self.index_map.iter().collect();
        index_vec.sort_by_key(|&(_, &index)| self.tensors[index].data_offsets.0);
        index_vec.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Gives the size of the content buffer in bytes.
    pub fn data_len(&self) -> usize {
        self.tensors
            .iter()
            .map(|info| info.data_offsets.1)
            .max()
            .unwrap_or(0)
    }

    /// Gives back the tensor metadata
    pub fn metadata(&self) -> &Option<HashMap<String, String>> {
        &self.metadata
    }
}

/// A view of a Tensor within the file.
/// Contains references to data within the full byte-buffer
/// And is thus a readable view of a single tensor
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TensorView<'data> {
    dtype: Dtype,
    shape: Vec<usize>,
    data: &'data [u8],
}

impl View for &TensorView<'_> {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        self.data.into()
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

impl View for TensorView<'_> {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        self.data.into()
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

impl<'data> TensorView<'data> {
    /// Create new tensor view
    pub fn new(
        dtype: Dtype,
        shape: Vec<usize>,
        data: &'data [u8],
    ) -> Result<Self, BinTensorError> {
        let n_elements: u64 = shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim as u64))
            .ok_or(BinTensorError::InvalidShape)?;
        let n_bytes = n_elements
            .checked_mul(dtype.size() as u64)
            .ok_or(BinTensorError::InvalidShape)?;

        if data.len() as u64 != n_bytes {
            Err(BinTensorError::InvalidTensorView(dtype, shape, data.len()))
        } else {
            Ok(Self { dtype, shape, data })
        }
    }

    /// The current tensor dtype
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// The current tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The current tensor byte-buffer
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The various pieces of the data buffer according to the asked slice
    pub fn sliced_data(
        &'data self,
        slices: &[TensorIndexer],
    ) -> Result<SliceIterator<'data>, InvalidSlice> {
        SliceIterator::new(self, slices)
    }
}

/// A single tensor information.
/// Endianness is assumed to be little endian
/// Ordering is assumed to be 'C'.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// The type of each element of the tensor
    pub dtype: Dtype,
    /// The shape of the tensor
    pub shape: Vec<usize>,
    /// The offsets to find the data within the byte-buffer array.
    pub data_offsets: (usize, usize),
}

/// The various available dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum Dtype {
    /// Boolean type
    BOL,
    /// Unsigned byte
    U8,
    /// Signed byte
    I8,
    /// FP8 <https://arxiv.org/pdf/2209.05433.pdf>_
    #[allow(non_camel_case_types)]
    F8_E5M2,
    /// FP8 <https://arxiv.org/pdf/2209.05433.pdf>_
    #[allow(non_camel_case_types)]
    F8_E4M3,
    /// Signed integer (16-bit)
    I16,
    /// Unsigned integer (16-bit)
    U16,
    /// Half-precision floating point
    F16,
    /// Brain floating point
    BF16,
    /// Signed integer (32-bit)
    I32,
    /// Unsigned integer (32-bit)
    U32,
    /// Floating point (32-bit)
    F32,
    /// Floating point (64-bit)
    F64,
    /// Signed integer (64-bit)
    I64,
    /// Unsigned integer (64-bit)
    U64,
}

impl From<Dtype> for u8 {
    fn from(dtype: Dtype) -> u8 {
        match dtype {
            Dtype::BOL => 0,
            Dtype::U8 => 1,
            Dtype::I8 => 2,
            Dtype::F8_E5M2 => 3,
            Dtype::F8_E4M3 => 4,
            Dtype::I16 => 5,
            Dtype::U16 => 6,
            Dtype::F16 => 7,
            Dtype::BF16 => 8,
            Dtype::I32 => 9,
            Dtype::U32 => 10,
            Dtype::F32 => 11,
            Dtype::F64 => 12,
            Dtype::I64 => 13,
            // 14 is reserved.
            Dtype::U64 => 15,
        }
    }
}

impl TryFrom<u8> for Dtype {
    type Error = BinTensorError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Dtype::BOL),
            1 => Ok(Dtype::U8),
            2 => Ok(Dtype::I8),
            3 => Ok(Dtype::F8_E5M2),
            4 => Ok(Dtype::F8_E4M3),
            5 => Ok(Dtype::I16),
            6 => Ok(Dtype::U16),
            7 => Ok(Dtype::F16),
            8 => Ok(Dtype::BF16),
            9 => Ok(Dtype::I32),
            10 => Ok(Dtype::U32),
            11 => Ok(Dtype::F32),
            12 => Ok(Dtype::F64),
            13 => Ok(Dtype::I64),
            15 => Ok(Dtype::U64),
            code => Err(BinTensorError::UnknownDtype(code)),
        }
    }
}

impl Dtype {
    /// Gives out the size (in bytes) of 1 element of this dtype.
    pub fn size(&self) -> usize {
        match self {
            Dtype::BOL => 1,
            Dtype::U8 => 1,
            Dtype::I8 => 1,
            Dtype::F8_E5M2 => 1,
            Dtype::F8_E4M3 => 1,
            Dtype::I16 => 2,
            Dtype::U16 => 2,
            Dtype::F16 => 2,
            Dtype::BF16 => 2,
            Dtype::I32 => 4,
            Dtype::U32 => 4,
            Dtype::F32 => 4,
            Dtype::F64 => 8,
            Dtype::I64 => 8,
            Dtype::U64 => 8,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match *self {
            Dtype::BOL => "BOL",
            Dtype::U8 => "U8",
            Dtype::I8 => "I8",
            Dtype::F8_E5M2 => "F8_E5M2",
            Dtype::F8_E4M3 => "F8_E4M3",
            Dtype::I16 => "I16",
            Dtype::U16 => "U16",
            Dtype::F16 => "F16",
            Dtype::BF16 => "BF16",
            Dtype::I32 => "I32",
            Dtype::U32 => "U32",
            Dtype::F32 => "F32",
            Dtype::F64 => "F64",
            Dtype::I64 => "I64",
            Dtype::U64 => "U64",
        })
    }
}
