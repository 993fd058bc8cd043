//! Register set access: slot-resident sets, packed sets and the computed sets (SBA, scratch,
//! mode flags).

use eudebug_sip::header::SCRATCH_REGISTER_COUNT;
use eudebug_sip::{
    pack_registers, packed_window, unpack_registers, ImplicitArgs, RegsetDesc, RegsetFlags,
    RegsetType, RenderSurfaceState, SbaTrackedAddresses, SipError,
};
use tracing::{debug, trace};

use crate::backend::{DebugBackend, GpuMemory, MemoryHandle};
use crate::error::{DebugError, Result};
use crate::session::DebugSession;
use crate::topology::{ThreadId, ThreadPattern};

/// GRF r0 dwords holding the implicit-args GPU VA (low, high).
const IMPLICIT_ARGS_PTR_DWORDS: (usize, usize) = (14, 15);

pub(crate) enum RegisterIo<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl RegisterIo<'_> {
    fn len(&self) -> usize {
        match self {
            RegisterIo::Read(buf) => buf.len(),
            RegisterIo::Write(buf) => buf.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterSetProperties {
    pub ty: RegsetType,
    pub flags: RegsetFlags,
    pub count: u32,
    pub bit_size: u32,
    pub byte_size: u32,
}

impl RegisterSetProperties {
    fn new(ty: RegsetType, desc: &RegsetDesc) -> Self {
        Self {
            ty,
            flags: ty.flags(),
            count: u32::from(desc.num),
            bit_size: u32::from(desc.bits),
            byte_size: u32::from(desc.bytes),
        }
    }
}

fn check_range(desc: &RegsetDesc, start: u32, count: u32) -> Result<()> {
    if start >= u32::from(desc.num) {
        return Err(DebugError::InvalidArgument("register start is out of range"));
    }
    if u64::from(start) + u64::from(count) > u64::from(desc.num) {
        return Err(DebugError::InvalidArgument("register count is out of range"));
    }
    Ok(())
}

fn dword(buf: &[u8], index: usize) -> u32 {
    let off = index * 4;
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn copy_out_u64(values: &[u64], start: u32, count: u32, out: &mut [u8]) -> Result<()> {
    let needed = count as usize * 8;
    if out.len() < needed {
        return Err(DebugError::InvalidArgument("register buffer is too small"));
    }
    let values = &values[start as usize..(start + count) as usize];
    for (chunk, value) in out.chunks_exact_mut(8).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

impl<B: DebugBackend> DebugSession<B> {
    /// Reads `count` registers of set `ty` starting at `start` from a stopped thread.
    pub fn read_registers(
        &mut self,
        thread: ThreadPattern,
        ty: u32,
        start: u32,
        count: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let ty = RegsetType::from_raw(ty)
            .ok_or(DebugError::InvalidArgument("unknown register set type"))?;
        let id = self.stopped_thread(&thread)?;
        match ty {
            RegsetType::Sba => self.read_sba_registers(&id, start, count, out),
            RegsetType::ThreadScratch => self.read_thread_scratch_registers(&id, start, count, out),
            RegsetType::DebugScratch => self.read_debug_scratch_registers(&id, start, count, out),
            RegsetType::ModeFlags => self.read_mode_flags(&id, start, count, out),
            _ => {
                let desc = self.resolve_regset(&id, ty)?;
                self.registers_access_helper(&id, &desc, start, count, RegisterIo::Read(out))
            }
        }
    }

    /// Writes `count` registers of set `ty` starting at `start` into a stopped thread.
    pub fn write_registers(
        &mut self,
        thread: ThreadPattern,
        ty: u32,
        start: u32,
        count: u32,
        input: &[u8],
    ) -> Result<()> {
        let ty = RegsetType::from_raw(ty)
            .ok_or(DebugError::InvalidArgument("unknown register set type"))?;
        let id = self.stopped_thread(&thread)?;
        if !ty.flags().contains(RegsetFlags::WRITABLE) {
            return Err(DebugError::InvalidArgument("register set is read-only"));
        }
        let desc = self.resolve_regset(&id, ty)?;
        self.registers_access_helper(&id, &desc, start, count, RegisterIo::Write(input))
    }

    /// Register sets exposed by the attached context's state-save area.
    pub fn get_register_set_properties(&mut self) -> Result<Vec<RegisterSetProperties>> {
        let handle = self.backend.default_memory_handle();
        self.register_set_properties(handle)
    }

    /// Register sets of one stopped thread's context.
    pub fn get_thread_register_set_properties(
        &mut self,
        thread: ThreadPattern,
    ) -> Result<Vec<RegisterSetProperties>> {
        let id = self.stopped_thread(&thread)?;
        let handle = self.thread_handle(&id);
        self.register_set_properties(handle)
    }

    fn register_set_properties(&mut self, handle: MemoryHandle) -> Result<Vec<RegisterSetProperties>> {
        let (_, header) = self.state_save_area(handle)?;
        let description = self.description();
        Ok(RegsetType::ALL
            .into_iter()
            .filter_map(|ty| {
                header
                    .regset(ty, description)
                    .filter(|desc| !desc.is_empty())
                    .map(|desc| RegisterSetProperties::new(ty, &desc))
            })
            .collect())
    }

    fn resolve_regset(&mut self, id: &ThreadId, ty: RegsetType) -> Result<RegsetDesc> {
        let handle = self.thread_handle(id);
        let (_, header) = self.state_save_area(handle)?;
        header
            .regset(ty, self.description())
            .ok_or(DebugError::InvalidArgument(
                "register set is not supported by this state save area",
            ))
    }

    /// Reads register `index` of set `ty` as raw bytes.
    pub(crate) fn read_register_raw(
        &mut self,
        id: &ThreadId,
        ty: RegsetType,
        index: u32,
    ) -> Result<Vec<u8>> {
        let desc = self.resolve_regset(id, ty)?;
        let mut buf = vec![0u8; usize::from(desc.bytes)];
        self.registers_access_helper(id, &desc, index, 1, RegisterIo::Read(&mut buf))?;
        Ok(buf)
    }

    /// Moves registers `[start, start + count)` of `desc` between `io` and the thread's slot.
    ///
    /// Range checks happen before any GPU access.
    pub(crate) fn registers_access_helper(
        &mut self,
        id: &ThreadId,
        desc: &RegsetDesc,
        start: u32,
        count: u32,
        io: RegisterIo<'_>,
    ) -> Result<()> {
        check_range(desc, start, count)?;
        if io.len() < desc.span_bytes(count) as usize {
            return Err(DebugError::InvalidArgument("register buffer is too small"));
        }
        if desc.is_packed() {
            return self.registers_access_helper_packed(id, desc, start, count, io);
        }

        let handle = self.thread_handle(id);
        let (ssa_va, header) = self.state_save_area(handle)?;
        self.check_slot_ident(id, handle, ssa_va, &header)?;
        let va = self.slot_gpu_va(ssa_va, &header, id)?
            + u64::from(desc.offset)
            + u64::from(start) * u64::from(desc.bytes);
        let len = desc.span_bytes(count) as usize;
        trace!(thread = %id, gpu_va = format_args!("{va:#x}"), len, "register access");
        match io {
            RegisterIo::Read(buf) => self.backend.read_gpu_memory(handle, va, &mut buf[..len])?,
            RegisterIo::Write(buf) => self.backend.write_gpu_memory(handle, va, &buf[..len])?,
        }
        Ok(())
    }

    fn registers_access_helper_packed(
        &mut self,
        id: &ThreadId,
        desc: &RegsetDesc,
        start: u32,
        count: u32,
        io: RegisterIo<'_>,
    ) -> Result<()> {
        let window = packed_window(desc, start, count).map_err(|err| {
            debug!(thread = %id, %err, "bad packed register window");
            DebugError::InvalidArgument("packed register window is invalid")
        })?;
        let handle = self.thread_handle(id);
        let (ssa_va, header) = self.state_save_area(handle)?;
        self.check_slot_ident(id, handle, ssa_va, &header)?;
        let va = self.slot_gpu_va(ssa_va, &header, id)?
            + u64::from(desc.offset)
            + window.byte_offset(desc);

        let mut raw = vec![0u8; window.byte_len(desc)];
        self.backend.read_gpu_memory(handle, va, &mut raw)?;
        match io {
            RegisterIo::Read(out) => unpack_registers(desc, &window, &raw, start, count, out)?,
            RegisterIo::Write(input) => {
                pack_registers(desc, &window, input, start, count, &mut raw)?;
                self.backend.write_gpu_memory(handle, va, &raw)?;
            }
        }
        Ok(())
    }

    fn synthetic_desc(&mut self, id: &ThreadId, ty: RegsetType) -> Result<RegsetDesc> {
        self.resolve_regset(id, ty)
    }

    fn read_sba_registers(
        &mut self,
        id: &ThreadId,
        start: u32,
        count: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let desc = self.synthetic_desc(id, RegsetType::Sba)?;
        check_range(&desc, start, count)?;
        let values = self.sba_values(id)?;
        copy_out_u64(&values, start, count, out)
    }

    /// General, surface, dynamic, indirect-object, instruction, bindless surface, bindless
    /// sampler, binding table and scratch base addresses.
    fn sba_values(&mut self, id: &ThreadId) -> Result<[u64; 9]> {
        let handle = self.thread_handle(id);
        let sba_va = self.backend.sba_tracking_gpu_va(handle);
        if sba_va == 0 {
            return Err(DebugError::Unknown("sba tracking buffer is unavailable"));
        }
        let mut raw = [0u8; SbaTrackedAddresses::SIZE_BYTES];
        self.backend.read_gpu_memory(handle, sba_va, &mut raw)?;
        let sba = SbaTrackedAddresses::decode_from_le_bytes(&raw)?;

        let r0 = self.read_register_raw(id, RegsetType::Grf, 0)?;
        if r0.len() < 24 {
            return Err(DebugError::Unknown("grf register is too small"));
        }
        let r0_4 = u64::from(dword(&r0, 4));
        let r0_5 = u64::from(dword(&r0, 5));

        let binding_table = ((r0_4 >> 5) << 5) + sba.surface_state_base;
        let scratch = if self.device.scratch_via_surface_state {
            let rss_offset = (r0_5 >> 10) << 6;
            if rss_offset == 0 {
                0
            } else {
                let rss = self.read_render_surface_state(handle, rss_offset + sba.surface_state_base)?;
                let base = rss.base_address();
                if base == 0 {
                    0
                } else {
                    base + self
                        .device
                        .per_thread_scratch_offset(u64::from(rss.surface_pitch), id)
                }
            }
        } else {
            let pointer = (r0_5 >> 10) << 10;
            if pointer == 0 {
                0
            } else {
                pointer + sba.general_state_base
            }
        };

        Ok([
            sba.general_state_base,
            sba.surface_state_base,
            sba.dynamic_state_base,
            sba.indirect_object_base,
            sba.instruction_base,
            sba.bindless_surface_state_base,
            sba.bindless_sampler_state_base,
            binding_table,
            scratch,
        ])
    }

    fn read_render_surface_state(
        &mut self,
        handle: MemoryHandle,
        gpu_va: u64,
    ) -> Result<RenderSurfaceState> {
        let mut raw = [0u8; RenderSurfaceState::SIZE_BYTES];
        self.backend.read_gpu_memory(handle, gpu_va, &mut raw)?;
        RenderSurfaceState::decode_from_le_bytes(&raw)
            .ok_or(DebugError::Unknown("render surface state is truncated"))
    }

    fn read_thread_scratch_registers(
        &mut self,
        id: &ThreadId,
        start: u32,
        count: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let desc = self.synthetic_desc(id, RegsetType::ThreadScratch)?;
        check_range(&desc, start, count)?;
        let values = self.thread_scratch_values(id)?;
        copy_out_u64(&values, start, count, out)
    }

    /// Scratch base of each scratch slot, recovered through the kernel's implicit args.
    fn thread_scratch_values(&mut self, id: &ThreadId) -> Result<[u64; SCRATCH_REGISTER_COUNT as usize]> {
        let mut values = [0u64; SCRATCH_REGISTER_COUNT as usize];
        let r0 = self.read_register_raw(id, RegsetType::Grf, 0)?;
        let (lo, hi) = IMPLICIT_ARGS_PTR_DWORDS;
        if r0.len() < (hi + 1) * 4 {
            return Err(DebugError::UnsupportedFeature(
                "grf r0 does not carry an implicit args pointer",
            ));
        }
        let implicit_args_va = u64::from(dword(&r0, lo)) | (u64::from(dword(&r0, hi)) << 32);
        if implicit_args_va == 0 {
            return Ok(values);
        }

        let handle = self.thread_handle(id);
        let mut prefix = [0u8; ImplicitArgs::PREFIX_SIZE];
        self.backend
            .read_gpu_memory(handle, implicit_args_va, &mut prefix)?;
        let size = ImplicitArgs::struct_size_for(&prefix).map_err(|err| match err {
            SipError::UnsupportedImplicitArgsVersion(0) => DebugError::UnsupportedVersion(0),
            _ => DebugError::UnsupportedFeature("implicit args version is not supported"),
        })?;
        let mut raw = vec![0u8; size];
        self.backend
            .read_gpu_memory(handle, implicit_args_va, &mut raw)?;
        let scratch_ptr = ImplicitArgs::decode_from_le_bytes(&raw)?.scratch_ptr();
        if scratch_ptr == 0 {
            return Ok(values);
        }

        for (i, value) in values.iter_mut().enumerate() {
            let rss_va = scratch_ptr + (i * RenderSurfaceState::SIZE_BYTES) as u64;
            let rss = self.read_render_surface_state(handle, rss_va)?;
            let base = rss.base_address();
            if base != 0 {
                *value = base
                    + self
                        .device
                        .per_thread_scratch_offset(u64::from(rss.surface_pitch), id);
            }
        }
        Ok(values)
    }

    fn read_debug_scratch_registers(
        &mut self,
        id: &ThreadId,
        start: u32,
        count: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let desc = self.synthetic_desc(id, RegsetType::DebugScratch)?;
        check_range(&desc, start, count)?;
        let handle = self.thread_handle(id);
        let (va, size) = self.backend.debug_scratch_area(handle).unwrap_or((0, 0));
        copy_out_u64(&[va, size], start, count, out)
    }

    fn read_mode_flags(
        &mut self,
        id: &ThreadId,
        start: u32,
        count: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let desc = self.synthetic_desc(id, RegsetType::ModeFlags)?;
        check_range(&desc, start, count)?;
        if count == 0 {
            return Ok(());
        }
        if out.len() < 4 {
            return Err(DebugError::InvalidArgument("register buffer is too small"));
        }
        let handle = self.thread_handle(id);
        let (_, header) = self.state_save_area(handle)?;
        out[..4].copy_from_slice(&header.mode_flags().to_le_bytes());
        Ok(())
    }
}
