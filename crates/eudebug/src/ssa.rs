//! Cached state-save area headers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use eudebug_sip::{StateSaveAreaHeader, VersionHeader};
use tracing::{debug, info, warn};

use crate::backend::{GpuMemory, MemoryHandle};
use crate::error::{DebugError, Result};

#[derive(Clone, Debug)]
enum CachedHeader {
    Valid(Arc<StateSaveAreaHeader>),
    /// A header was read and rejected; it is not re-read.
    Invalid,
}

/// Parsed headers keyed by `(memory handle, state-save area GPU VA)`.
#[derive(Debug, Default)]
pub struct StateSaveAreaCache {
    entries: HashMap<(MemoryHandle, u64), CachedHeader>,
    dumped: bool,
}

impl StateSaveAreaCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn get(&self, handle: MemoryHandle, gpu_va: u64) -> Option<Arc<StateSaveAreaHeader>> {
        match self.entries.get(&(handle, gpu_va)) {
            Some(CachedHeader::Valid(header)) => Some(header.clone()),
            _ => None,
        }
    }

    /// Returns the header at `gpu_va`, reading and validating it on first use.
    ///
    /// A header that fails validation is remembered as unavailable. Memory read failures are
    /// not cached.
    pub fn get_or_load<M: GpuMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        handle: MemoryHandle,
        gpu_va: u64,
        dump_to: Option<&Path>,
    ) -> Result<Arc<StateSaveAreaHeader>> {
        match self.entries.get(&(handle, gpu_va)) {
            Some(CachedHeader::Valid(header)) => return Ok(header.clone()),
            Some(CachedHeader::Invalid) => {
                return Err(DebugError::NotAvailable("state save area is invalid"))
            }
            None => {}
        }

        let mut prefix = [0u8; VersionHeader::SIZE_BYTES];
        mem.read_gpu_memory(handle, gpu_va, &mut prefix)?;
        let size = match VersionHeader::decode_from_le_bytes(&prefix)
            .ok_or(eudebug_sip::SipError::InvalidMagic)
            .and_then(|version| version.validate().map(|_| version.header_size_bytes()))
        {
            Ok(size) => size,
            Err(err) => return Err(self.reject(handle, gpu_va, err)),
        };

        let mut raw = vec![0u8; size];
        mem.read_gpu_memory(handle, gpu_va, &mut raw)?;
        let header = match StateSaveAreaHeader::parse(&raw) {
            Ok(header) => Arc::new(header),
            Err(err) => return Err(self.reject(handle, gpu_va, err)),
        };

        info!(
            %handle,
            gpu_va = format_args!("{gpu_va:#x}"),
            version = %header.version.version,
            "state save area header loaded"
        );
        if let Some(path) = dump_to {
            self.dump(path, &raw);
        }
        self.entries
            .insert((handle, gpu_va), CachedHeader::Valid(header.clone()));
        Ok(header)
    }

    fn reject(
        &mut self,
        handle: MemoryHandle,
        gpu_va: u64,
        err: eudebug_sip::SipError,
    ) -> DebugError {
        warn!(%handle, gpu_va = format_args!("{gpu_va:#x}"), %err, "rejecting state save area");
        self.entries.insert((handle, gpu_va), CachedHeader::Invalid);
        DebugError::NotAvailable("state save area is invalid")
    }

    fn dump(&mut self, path: &Path, raw: &[u8]) {
        if self.dumped {
            return;
        }
        self.dumped = true;
        match std::fs::write(path, raw) {
            Ok(()) => debug!(path = %path.display(), len = raw.len(), "dumped debug surface"),
            Err(err) => warn!(path = %path.display(), %err, "failed to dump debug surface"),
        }
    }
}
