//! Bounds-checked access to a guest's exported linear memory.
//!
//! All pointer+length marshaling between host functions and the guest goes
//! through [`GuestMemory`]; nothing else touches `Memory::data` directly.

use wasmtime::{AsContext, AsContextMut, Caller, Memory};

use super::abi;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("range {ptr}+{len} is outside guest memory ({size} bytes)")]
    OutOfBounds { ptr: u32, len: u32, size: usize },

    #[error("guest bytes are not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Clone, Copy)]
pub struct GuestMemory {
    memory: Memory,
}

impl GuestMemory {
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// The calling instance's `memory` export, if it has one.
    pub fn from_caller<T>(caller: &mut Caller<'_, T>) -> Option<Self> {
        caller
            .get_export("memory")
            .and_then(|export| export.into_memory())
            .map(Self::new)
    }

    fn check(&self, store: impl AsContext, ptr: u32, len: usize) -> Result<usize, MemoryError> {
        let size = self.memory.data_size(&store);
        let start = ptr as usize;
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start),
            _ => Err(MemoryError::OutOfBounds {
                ptr,
                len: len as u32,
                size,
            }),
        }
    }

    pub fn read_bytes(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        let start = self.check(&store, ptr, len as usize)?;
        let data = self.memory.data(&store);
        Ok(data[start..start + len as usize].to_vec())
    }

    pub fn read_string(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<String, MemoryError> {
        let bytes = self.read_bytes(store, ptr, len)?;
        String::from_utf8(bytes).map_err(|_| MemoryError::InvalidUtf8)
    }

    pub fn write_bytes(&self, mut store: impl AsContextMut, ptr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let start = self.check(&store, ptr, data.len())?;
        self.memory.data_mut(&mut store)[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Two-phase delivery of a host-side buffer into guest memory.
///
/// `buf_len == 0` probes the required size. A non-zero buffer smaller than
/// `data` yields `BUFFER_TOO_SMALL`; otherwise the bytes are written and
/// their length returned.
pub fn deliver(
    memory: Option<GuestMemory>,
    store: impl AsContextMut,
    buf_ptr: u32,
    buf_len: u32,
    data: &[u8],
) -> u32 {
    let size = data.len() as u32;
    if buf_len == 0 {
        return size;
    }
    if buf_len < size {
        return abi::BUFFER_TOO_SMALL;
    }
    let Some(memory) = memory else {
        return abi::WRITE_FAILED;
    };
    match memory.write_bytes(store, buf_ptr, data) {
        Ok(()) => size,
        Err(e) => {
            tracing::warn!("[HostBridge] Failed to write result into guest memory: {}", e);
            abi::WRITE_FAILED
        }
    }
}
