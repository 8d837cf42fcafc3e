//! Virtual CPU lifecycle, the run loop, and state servicing.

use crate::cpuid::GuestCpuid;
use crate::ept::{invept, EptTree};
use crate::interrupt::{can_inject_interrupt, PendingEntryEvent, PendingInterrupts};
use crate::memory::{Gpa, GpaSpace, Gva};
use crate::mmio::{self, Decoded, FetchCache, PostMmio, PostOp, SegBases};
use crate::paging::{self, PagingView};
use crate::tunnel::{ExitStatus, FastMmioPayload, IoPayload, MmioPayload, Tunnel};
use crate::vmexit::{self, msr::GuestMsrs, ExitAction, ExitInfo};
use crate::vmx::controls::{
    EntryCtls, EptViolationQual, ExitCtls, InterruptionInfo, Interruptibility, PinBasedCtls,
    PrimaryCtls, SecondaryCtls,
};
use crate::vmx::entry::{asm_vmexit_handler, asm_vmxrun, gpr, GuestGprs, HostState, VmxRunResult};
use crate::vmx::percpu::{self, VcpuKey};
use crate::vmx::vmcs::{instruction_error, ActiveVmcs, Field, Vmcs};
use crate::{Error, Result};
use alloc::sync::Arc;
use core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use haxhal::x86::{self, sgdt, sidt, Cr0, Cr4, HostSelectors, Msr, Rflags};
use haxhal::SpinLock;

/// One guest segment register image (the `SET_REGS` wire layout).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct SegmentDesc {
    pub selector: u16,
    pub _pad: u16,
    pub limit: u32,
    pub base: u64,
    pub ar: u32,
    pub _pad2: u32,
}

/// A descriptor-table register image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct DescTable {
    pub base: u64,
    pub limit: u32,
    pub _pad: u32,
}

/// Full architectural state exchanged with `SET_REGS`/`GET_REGS` and
/// cached between exits.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct VcpuState {
    pub gprs: GuestGprs,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub cs: SegmentDesc,
    pub ss: SegmentDesc,
    pub ds: SegmentDesc,
    pub es: SegmentDesc,
    pub fs: SegmentDesc,
    pub gs: SegmentDesc,
    pub ldt: SegmentDesc,
    pub tr: SegmentDesc,
    pub gdt: DescTable,
    pub idt: DescTable,
}

impl VcpuState {
    /// Power-on reset state: real mode at the architectural reset vector.
    pub fn at_reset() -> Self {
        let data = SegmentDesc {
            limit: 0xffff,
            ar: 0x93,
            ..SegmentDesc::default()
        };
        Self {
            rip: 0xfff0,
            rflags: 0x2,
            cr0: 0x6000_0010,
            dr6: 0xffff_0ff0,
            dr7: 0x400,
            cs: SegmentDesc {
                selector: 0xf000,
                base: 0xffff_0000,
                limit: 0xffff,
                ar: 0x9b,
                ..SegmentDesc::default()
            },
            ss: data,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ldt: SegmentDesc {
                limit: 0xffff,
                ar: 0x82,
                ..SegmentDesc::default()
            },
            tr: SegmentDesc {
                limit: 0xffff,
                ar: 0x8b,
                ..SegmentDesc::default()
            },
            gdt: DescTable {
                limit: 0xffff,
                ..DescTable::default()
            },
            idt: DescTable {
                limit: 0xffff,
                ..DescTable::default()
            },
            ..Self::default()
        }
    }
}

/// The 512-byte FXSAVE image exchanged with `SET_FPU`/`GET_FPU`.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct FpuState {
    pub image: [u8; 512],
}

impl Default for FpuState {
    fn default() -> Self {
        let mut image = [0u8; 512];
        // FCW = 0x37f, MXCSR = 0x1f80.
        image[0] = 0x7f;
        image[1] = 0x03;
        image[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
        Self { image }
    }
}

/// I/O completion staged until user space re-enters.
#[derive(Clone, Copy, Debug)]
pub enum PendingIo {
    /// IN into AL/AX/EAX: copy the buffer to RAX on re-entry.
    RegIn { size: u8 },
    /// INS: copy the buffer into guest memory on re-entry.
    StringIn { va: u64, count: u64, size: u8, df: bool },
}

/// Guest-state fields whose VMCS images are stale and must be written on
/// the next entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PendingVmcsWrites {
    pub rip: Option<u64>,
    pub rflags: Option<u64>,
    pub cr0: Option<u64>,
    pub cr3: Option<u64>,
    pub cr4: Option<u64>,
    pub efer: Option<u64>,
    pub dr7: Option<u64>,
    pub fs_base: Option<u64>,
    pub gs_base: Option<u64>,
    pub pdptes: Option<[u64; 4]>,
    pub interruptibility: Option<u32>,
    pub primary_ctls_set: u32,
    pub primary_ctls_clear: u32,
    /// Rewrite the whole guest-state area (first entry, `SET_REGS`).
    pub full_state: bool,
}

const FLAG_PAUSED: u32 = 1 << 0;
const FLAG_PANICKED: u32 = 1 << 1;
const FLAG_IS_RUNNING: u32 = 1 << 2;
const FLAG_CUR_STATE_VALID: u32 = 1 << 4;

const NO_CPU: usize = usize::MAX;

const CR0_PE: u64 = 1 << 0;
const CR0_TS: u64 = 1 << 3;
const EFER_LMA: u64 = 1 << 10;
const RFLAGS_TF: u64 = 1 << 8;
const RFLAGS_VM: u64 = 1 << 17;
const AR_L: u32 = 1 << 13;
const AR_D: u32 = 1 << 14;

/// vCPU state shared with threads that do not hold the vCPU lock: pause,
/// panic, and the pending-interrupt queue.
pub struct VcpuShared {
    flags: AtomicU32,
    running_cpu: AtomicUsize,
    pub pending: PendingInterrupts,
}

impl VcpuShared {
    pub(crate) fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            running_cpu: AtomicUsize::new(NO_CPU),
            pending: PendingInterrupts::new(),
        }
    }

    /// Whether the vCPU hit a guest-fatal condition; sticky.
    pub fn is_panicked(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_PANICKED != 0
    }

    pub(crate) fn set_panicked(&self) {
        self.flags.fetch_or(FLAG_PANICKED, Ordering::SeqCst);
    }

    /// Whether the vCPU is paused.
    pub fn is_paused(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_PAUSED != 0
    }

    /// Pause: any in-flight guest entry is kicked out with an empty IPI
    /// (the IPI forces an external-interrupt VM exit).
    pub fn pause(&self) {
        self.flags.fetch_or(FLAG_PAUSED, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.kick();
    }

    /// Resume a paused vCPU.
    pub fn unpause(&self) {
        self.flags.fetch_and(!FLAG_PAUSED, Ordering::SeqCst);
    }

    /// Eject the vCPU from its current pCPU without pausing it (used when
    /// the owning thread must migrate).
    pub fn takeoff(&self) {
        self.kick();
    }

    /// Enqueue an external interrupt (the `INTERRUPT` ioctl).
    pub fn interrupt(&self, vector: u8) {
        self.pending.enqueue(vector);
    }

    fn kick(&self) {
        let cpu = self.running_cpu.load(Ordering::SeqCst);
        if cpu != NO_CPU {
            haxhal::host().kick_cpu(cpu);
        }
    }
}

/// A virtual CPU. Heavyweight operations (run, regs, MSRs) happen under
/// the per-vCPU lock; cross-thread signals go through [`VcpuShared`].
pub struct Vcpu {
    pub vcpu_id: u32,
    pub vm_id: u32,
    shared: Arc<VcpuShared>,
    vmcs: Vmcs,
    /// Cached architectural state, authoritative between entries.
    pub state: VcpuState,
    pub msrs: GuestMsrs,
    fpu: FpuState,
    cpuid: Arc<SpinLock<GuestCpuid>>,
    gpa_space: Arc<GpaSpace>,
    ept: Arc<EptTree>,
    entry_event: PendingEntryEvent,
    pending_writes: PendingVmcsWrites,
    vpid: u16,
    launched: bool,
    vmcs_initialized: bool,
    last_reason: u32,
    tunnel: Option<Tunnel>,
    post_mmio: Option<PostMmio>,
    pending_io: Option<PendingIo>,
    fetch_cache: FetchCache,
    /// MMIO-to-MMIO copies negotiated via the version handshake.
    pub mmio_extra: bool,
    exception_bitmap: u32,
}

impl Vcpu {
    pub(crate) fn new(
        vm_id: u32,
        vcpu_id: u32,
        vpid: u16,
        revision_id: u32,
        shared: Arc<VcpuShared>,
        gpa_space: Arc<GpaSpace>,
        ept: Arc<EptTree>,
        cpuid: Arc<SpinLock<GuestCpuid>>,
    ) -> Result<Self> {
        Ok(Self {
            vcpu_id,
            vm_id,
            shared,
            vmcs: Vmcs::new(revision_id)?,
            state: VcpuState::at_reset(),
            msrs: GuestMsrs::at_reset(),
            fpu: FpuState::default(),
            cpuid,
            gpa_space,
            ept,
            entry_event: PendingEntryEvent::default(),
            pending_writes: PendingVmcsWrites {
                full_state: true,
                ..PendingVmcsWrites::default()
            },
            vpid,
            launched: false,
            vmcs_initialized: false,
            last_reason: 0,
            tunnel: None,
            post_mmio: None,
            pending_io: None,
            fetch_cache: FetchCache::default(),
            mmio_extra: false,
            exception_bitmap: 1 << 18, // #MC
        })
    }

    fn key(&self) -> VcpuKey {
        (self.vm_id, self.vcpu_id)
    }

    /// The cross-thread control block.
    pub fn shared(&self) -> &Arc<VcpuShared> {
        &self.shared
    }

    /// Whether the vCPU hit a guest-fatal condition.
    pub fn is_panicked(&self) -> bool {
        self.shared.is_panicked()
    }

    pub(crate) fn set_panicked(&self) {
        self.shared.set_panicked();
    }

    // -- accessors for the exit handlers -----------------------------------

    pub(crate) fn gpa_space(&self) -> &GpaSpace {
        &self.gpa_space
    }

    pub(crate) fn ept_tree(&self) -> &EptTree {
        &self.ept
    }

    pub(crate) fn guest_cpuid(&self, function: u32, index: u32) -> x86::CpuidArgs {
        self.cpuid.lock().execute(function, index)
    }

    pub(crate) fn has_pending_interrupt(&self) -> bool {
        self.shared.pending.any_pending() || self.entry_event.is_injected()
    }

    pub(crate) fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) {
        self.entry_event.inject_exception(vector, error_code);
    }

    pub(crate) fn advance_rip(&mut self, exit: &ExitInfo) {
        // Completing an instruction breaks STI/MOV-SS blocking.
        let interruptibility = exit.interruptibility()
            - (Interruptibility::STI_BLOCKING | Interruptibility::MOV_SS_BLOCKING);
        self.pending_writes.interruptibility = Some(interruptibility.bits());
        self.advance_rip_by(exit.instruction_length as u64);
    }

    pub(crate) fn advance_rip_by(&mut self, len: u64) {
        self.state.rip = self.state.rip.wrapping_add(len);
        self.pending_writes.rip = Some(self.state.rip);
    }

    pub(crate) fn invalidate_fetch_cache(&mut self) {
        self.fetch_cache.invalidate();
    }

    pub(crate) fn clear_cr0_ts(&mut self) {
        self.set_guest_cr0(self.state.cr0 & !CR0_TS);
        // Stop trapping #NM now that the guest owns the FPU again.
        self.exception_bitmap &= !(1 << 7);
    }

    pub(crate) fn set_guest_cr0(&mut self, value: u64) {
        self.state.cr0 = value;
        self.pending_writes.cr0 = Some(value);
    }

    pub(crate) fn set_guest_cr3(&mut self, value: u64) {
        self.state.cr3 = value;
        self.pending_writes.cr3 = Some(value);
        self.fetch_cache.invalidate();
    }

    pub(crate) fn set_guest_cr4(&mut self, value: u64) {
        self.state.cr4 = value;
        self.pending_writes.cr4 = Some(value);
    }

    pub(crate) fn set_guest_efer(&mut self, value: u64) {
        self.msrs.efer = value;
        self.pending_writes.efer = Some(value);
    }

    pub(crate) fn set_guest_pdptes(&mut self, pdptes: [u64; 4]) {
        self.pending_writes.pdptes = Some(pdptes);
    }

    pub(crate) fn stage_dr7(&mut self) {
        self.pending_writes.dr7 = Some(self.state.dr7);
    }

    pub(crate) fn stage_fs_base(&mut self) {
        self.pending_writes.fs_base = Some(self.state.fs.base);
    }

    pub(crate) fn stage_gs_base(&mut self) {
        self.pending_writes.gs_base = Some(self.state.gs.base);
    }

    pub(crate) fn unrestricted_guest(&self) -> bool {
        crate::probe::global_caps().map_or(false, |c| c.supports_ept_ug())
    }

    pub(crate) fn clear_interrupt_window_request(&mut self) {
        self.pending_writes.primary_ctls_clear |= PrimaryCtls::INTERRUPT_WINDOW_EXITING.bits();
    }

    pub(crate) fn request_interrupt_window(&mut self) {
        self.pending_writes.primary_ctls_set |= PrimaryCtls::INTERRUPT_WINDOW_EXITING.bits();
    }

    pub(crate) fn debug_armed(&self) -> bool {
        self.exception_bitmap & ((1 << 1) | (1 << 3)) != 0
            || self.state.rflags & RFLAGS_TF != 0
    }

    // -- tunnel -------------------------------------------------------------

    /// First call allocates the dual-mapped tunnel and the I/O buffer; the
    /// returned triple is `(tunnel UVA, io-buffer UVA, tunnel size)`.
    pub fn setup_tunnel(&mut self) -> Result<(u64, u64, u32)> {
        if self.tunnel.is_none() {
            self.tunnel = Some(Tunnel::new()?);
        }
        let t = self.tunnel.as_ref().ok_or(Error::NoMemory)?;
        Ok((t.user_va(), t.io_user_va(), t.size() as u32))
    }

    fn tunnel(&self) -> Result<&Tunnel> {
        self.tunnel.as_ref().ok_or(Error::InvalidParam)
    }

    pub(crate) fn tunnel_exit(&self, status: ExitStatus) {
        if let Ok(t) = self.tunnel() {
            t.set_exit(self.last_reason, status);
        }
    }

    pub(crate) fn set_io_exit(&mut self, io: IoPayload) {
        if let Ok(t) = self.tunnel() {
            t.page().payload.io = io;
            t.set_exit(self.last_reason, ExitStatus::Io);
        }
    }

    pub(crate) fn report_protection_fault(&mut self, gfn: u64, qual: EptViolationQual) {
        if let Ok(t) = self.tunnel() {
            t.page().payload.pagefault = crate::tunnel::PageFaultPayload {
                gpa: gfn << 12,
                access: qual.raw() as u32 & 0x7,
                pad: 0,
            };
            t.set_exit(self.last_reason, ExitStatus::PageFault);
        }
    }

    pub(crate) fn report_debug_exit(&mut self, _exit: &ExitInfo) {
        if let Ok(t) = self.tunnel() {
            t.page().payload.debug = crate::tunnel::DebugPayload {
                rip: self.state.rip,
                dr6: self.state.dr6,
                dr7: self.state.dr7,
            };
            t.set_exit(self.last_reason, ExitStatus::Debug);
        }
    }

    pub(crate) fn io_buf_len(&self) -> usize {
        self.tunnel().map(|t| t.io_buf().len()).unwrap_or(0)
    }

    pub(crate) fn io_buf_write(&mut self, data: &[u8]) {
        self.io_buf_write_at(0, data)
    }

    pub(crate) fn io_buf_write_at(&mut self, offset: usize, data: &[u8]) {
        if let Ok(t) = self.tunnel() {
            t.io_buf()[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    pub(crate) fn set_pending_io(&mut self, io: PendingIo) {
        self.pending_io = Some(io);
    }

    // -- guest memory helpers ----------------------------------------------

    fn paging_view(&self) -> PagingView {
        PagingView {
            cr0: self.state.cr0,
            cr3: self.state.cr3,
            cr4: self.state.cr4,
            efer: self.msrs.efer,
        }
    }

    fn translate(&self, gva: Gva) -> Result<Gpa> {
        paging::gva_to_gpa(&self.gpa_space, &self.paging_view(), gva)
    }

    /// Read guest memory by virtual address, page by page.
    pub(crate) fn read_guest_virtual(&self, va: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let gva = Gva::new(va + done as u64).ok_or(Error::InvalidParam)?;
            let n = (0x1000 - gva.page_offset() as usize).min(buf.len() - done);
            let gpa = self.translate(gva)?;
            if self.gpa_space.read_data(gpa, &mut buf[done..done + n])? != n {
                return Err(Error::InvalidParam);
            }
            done += n;
        }
        Ok(())
    }

    /// Write guest memory by virtual address, page by page.
    pub(crate) fn write_guest_virtual(&self, va: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let gva = Gva::new(va + done as u64).ok_or(Error::InvalidParam)?;
            let n = (0x1000 - gva.page_offset() as usize).min(buf.len() - done);
            let gpa = self.translate(gva)?;
            if self.gpa_space.write_data(gpa, &buf[done..done + n])? != n {
                return Err(Error::InvalidParam);
            }
            done += n;
        }
        Ok(())
    }

    /// Current operating mode as decoder bitness.
    fn cpu_bitness(&self) -> u32 {
        if self.state.cr0 & CR0_PE == 0 || self.state.rflags & RFLAGS_VM != 0 {
            16
        } else if self.msrs.efer & EFER_LMA != 0 && self.state.cs.ar & AR_L != 0 {
            64
        } else if self.state.cs.ar & AR_D != 0 {
            32
        } else {
            16
        }
    }

    /// Fetch up to 15 instruction bytes at CS:RIP through the fetch cache.
    fn fetch_instruction(&mut self, buf: &mut [u8; mmio::MAX_INSN_BYTES]) -> Result<usize> {
        let linear = self.state.cs.base.wrapping_add(self.state.rip);
        let gva = Gva::new(linear).ok_or(Error::InvalidParam)?;
        let gpa = match self.fetch_cache.lookup(self.state.cr3, gva) {
            Some(gpa) => gpa,
            None => {
                let gpa = self.translate(gva)?;
                self.fetch_cache.fill(self.state.cr3, gva, gpa);
                gpa
            }
        };
        let in_page = (0x1000 - gpa.page_offset() as usize).min(buf.len());
        let mut got = self.gpa_space.read_data(gpa, &mut buf[..in_page])?;
        // Spill into the next page when the window crosses it.
        if got == in_page && in_page < buf.len() {
            if let Some(next_gva) = Gva::new((linear & !0xfff).wrapping_add(0x1000)) {
                if let Ok(next) = self.translate(next_gva) {
                    got += self
                        .gpa_space
                        .read_data(next, &mut buf[in_page..])
                        .unwrap_or(0);
                }
            }
        }
        if got == 0 {
            return Err(Error::InvalidParam);
        }
        Ok(got)
    }

    // -- MMIO ---------------------------------------------------------------

    pub(crate) fn handle_mmio_exit(&mut self, exit: &ExitInfo, gpa: Gpa) -> Result<ExitAction> {
        let mut bytes = [0u8; mmio::MAX_INSN_BYTES];
        let got = match self.fetch_instruction(&mut bytes) {
            Ok(got) => got,
            Err(_) => return self.full_mmio_exit(exit),
        };

        let bitness = self.cpu_bitness();
        let seg = SegBases {
            es: self.state.es.base,
            cs: self.state.cs.base,
            ss: self.state.ss.base,
            ds: self.state.ds.base,
            fs: self.state.fs.base,
            gs: self.state.gs.base,
        };
        let view = self.paging_view();
        let space = self.gpa_space.clone();
        let decoded = {
            let mut ctx = mmio::DecodeCtx {
                gprs: &mut self.state.gprs,
                rip: self.state.rip,
                rflags: self.state.rflags,
                bitness,
                seg,
                mmio_extra: self.mmio_extra,
            };
            mmio::decode_mmio(&mut ctx, &bytes[..got], gpa, &space, &|gva| {
                paging::gva_to_gpa(&space, &view, gva).ok()
            })
        };

        match decoded {
            Decoded::Fast(req) => {
                self.post_mmio = Some(req.post);
                if req.advance_rip {
                    self.advance_rip_by(req.insn_len as u64);
                }
                let fastmmio = FastMmioPayload {
                    gpa: req.gpa,
                    value: if req.direction == 2 { req.gpa2 } else { req.value },
                    size: req.size,
                    direction: req.direction,
                    reg_index: req.reg_index,
                    pad0: 0,
                    cr0: self.state.cr0,
                    cr2: self.state.gprs.cr2,
                    cr3: self.state.cr3,
                    cr4: self.state.cr4,
                };
                let t = self.tunnel()?;
                t.page().payload.fastmmio = fastmmio;
                t.set_exit(self.last_reason, ExitStatus::FastMmio);
                Ok(ExitAction::ExitToUser(ExitStatus::FastMmio))
            }
            Decoded::Retired(len) => {
                self.advance_rip_by(len as u64);
                Ok(ExitAction::Resume)
            }
            Decoded::Full => self.full_mmio_exit(exit),
        }
    }

    fn full_mmio_exit(&mut self, exit: &ExitInfo) -> Result<ExitAction> {
        let t = self.tunnel()?;
        t.page().payload.mmio = MmioPayload {
            gla: exit.guest_linear,
        };
        t.set_exit(self.last_reason, ExitStatus::Mmio);
        Ok(ExitAction::ExitToUser(ExitStatus::Mmio))
    }

    /// Apply the post-MMIO descriptor with the value user space returned.
    fn complete_post_mmio(&mut self) -> Result<()> {
        let Some(post) = self.post_mmio.take() else {
            return Ok(());
        };
        let value = unsafe { self.tunnel()?.page().payload.fastmmio.value };
        match post.op {
            PostOp::WriteMem => {
                let bytes = value.to_le_bytes();
                self.write_guest_virtual(post.va, &bytes[..post.size as usize])
            }
            _ => mmio::handle_mmio_post(&mut self.state.gprs, &post, value, &mut |_, _, _| {
                Ok(())
            }),
        }
    }

    /// Apply a pending I/O completion with the buffer user space filled.
    fn complete_pending_io(&mut self) -> Result<()> {
        let Some(io) = self.pending_io.take() else {
            return Ok(());
        };
        match io {
            PendingIo::RegIn { size } => {
                let mut buf = [0u8; 8];
                buf[..size as usize].copy_from_slice(&self.tunnel()?.io_buf()[..size as usize]);
                self.state
                    .gprs
                    .write_sized(gpr::RAX, size, u64::from_le_bytes(buf));
            }
            PendingIo::StringIn { va, count, size, df } => {
                for i in 0..count {
                    let mut buf = [0u8; 8];
                    {
                        let off = (i * size as u64) as usize;
                        buf[..size as usize].copy_from_slice(
                            &self.tunnel()?.io_buf()[off..off + size as usize],
                        );
                    }
                    let elem = vmexit::io::string_element_va(va, i, size as u64, df);
                    self.write_guest_virtual(elem, &buf[..size as usize])?;
                }
            }
        }
        Ok(())
    }

    // -- run loop -----------------------------------------------------------

    /// Drive the vCPU until an exit must be surfaced to user space.
    /// Returns the exit status published in the tunnel.
    pub fn run(&mut self) -> Result<ExitStatus> {
        if self.tunnel.is_none() {
            return Err(Error::InvalidParam);
        }
        if self.is_panicked() {
            self.tunnel_exit(ExitStatus::StateChange);
            return Ok(ExitStatus::StateChange);
        }

        // Finish whatever the device model just completed.
        self.complete_post_mmio()?;
        self.complete_pending_io()?;

        self.shared.flags.fetch_or(FLAG_IS_RUNNING, Ordering::SeqCst);
        let result = self.run_loop();
        self.shared
            .flags
            .fetch_and(!FLAG_IS_RUNNING, Ordering::SeqCst);
        self.shared.running_cpu.store(NO_CPU, Ordering::SeqCst);
        result
    }

    fn run_loop(&mut self) -> Result<ExitStatus> {
        loop {
            if self.shared.is_paused() {
                self.tunnel_exit(ExitStatus::Paused);
                return Ok(ExitStatus::Paused);
            }
            if self.is_panicked() {
                self.tunnel_exit(ExitStatus::StateChange);
                return Ok(ExitStatus::StateChange);
            }
            if self.tunnel()?.page().user_event_pending != 0 {
                self.tunnel_exit(ExitStatus::Interrupt);
                return Ok(ExitStatus::Interrupt);
            }

            // Consume a sticky invalidation before reusing the EPT.
            if self.ept.take_invept_pending() {
                invept::invept(self.ept.eptp(), invept::preferred_type())?;
            }

            let exit = self.enter_guest()?;
            match vmexit::dispatch(self, &exit)? {
                ExitAction::Resume => continue,
                ExitAction::ExitToUser(status) => return Ok(status),
            }
        }
    }

    /// One guest entry: load the VMCS, flush pending writes, inject, run,
    /// snapshot the exit.
    fn enter_guest(&mut self) -> Result<ExitInfo> {
        let loaded = percpu::load_vmcs(&self.vmcs, self.key())?;
        let vmcs = loaded.vmcs();
        self.shared
            .running_cpu
            .store(loaded.cpu_id(), Ordering::SeqCst);

        if !self.vmcs_initialized {
            self.setup_vmcs(&vmcs)?;
            self.vmcs_initialized = true;
        }
        self.flush_pending_writes(&vmcs)?;
        self.inject_intr(&vmcs)?;
        self.fixup_access_rights(&vmcs)?;

        // Interrupts stay off from just before VMRUN until the host state
        // is restored; the deferred host vector fires at the STI below.
        let irq = IrqGuard::disable();
        let pcpu = unsafe { percpu::current() };
        pcpu.host_state = HostState::capture();

        let run_result = VmxRunResult::from_raw(unsafe {
            asm_vmxrun(&mut self.state.gprs, self.launched as u64)
        });

        unsafe { pcpu.host_state.restore() };

        if run_result != VmxRunResult::Exited {
            let err = instruction_error();
            self.shared.running_cpu.store(NO_CPU, Ordering::SeqCst);
            drop(irq);
            drop(loaded);
            error!(
                "vcpu {}: entry failed ({:?}): {:?}",
                self.vcpu_id, run_result, err
            );
            self.set_panicked();
            return Err(Error::Vmx(err));
        }
        self.launched = true;

        let exit = self.snapshot_exit(&vmcs)?;

        // Events whose delivery the exit interrupted go back in first.
        self.entry_event.clear();
        if exit.idt_vectoring.is_valid() {
            self.entry_event.recover_idt_vectoring(
                exit.idt_vectoring,
                exit.idt_error_code,
                exit.instruction_length,
            );
        }

        let ready = !self.has_pending_interrupt()
            && can_inject_interrupt(self.state.rflags, exit.interruptibility());
        if let Ok(t) = self.tunnel() {
            t.page().ready_for_interrupt_injection = ready as i32;
            t.page().apic_base = self.msrs.apic_base;
        }

        self.shared.running_cpu.store(NO_CPU, Ordering::SeqCst);
        drop(irq);
        drop(loaded);
        self.last_reason = exit.reason;
        Ok(exit)
    }

    fn snapshot_exit(&mut self, vmcs: &ActiveVmcs) -> Result<ExitInfo> {
        let exit = ExitInfo {
            reason: vmcs.read(Field::VmexitReason)? as u32,
            qualification: vmcs.read(Field::VmexitQualification)?,
            guest_physical: vmcs.read(Field::GuestPhysicalAddr)?,
            guest_linear: vmcs.read(Field::GuestLinearAddr)?,
            intr_info: InterruptionInfo::from_raw(
                vmcs.read(Field::VmexitInterruptionInfo)? as u32
            ),
            intr_error_code: vmcs.read(Field::VmexitInterruptionErrCode)? as u32,
            idt_vectoring: InterruptionInfo::from_raw(vmcs.read(Field::IdtVectoringInfo)? as u32),
            idt_error_code: vmcs.read(Field::IdtVectoringErrCode)? as u32,
            instruction_length: vmcs.read(Field::VmexitInstructionLength)? as u32,
            interruptibility: vmcs.read(Field::GuestInterruptibilityState)? as u32,
        };

        // Refresh the cached guest state the handlers read.
        self.state.rip = vmcs.read(Field::GuestRip)?;
        self.state.rflags = vmcs.read(Field::GuestRflags)?;
        self.state.gprs.regs[gpr::RSP] = vmcs.read(Field::GuestRsp)?;
        self.state.cr0 = vmcs.read(Field::GuestCr0)?;
        self.state.cr3 = vmcs.read(Field::GuestCr3)?;
        self.state.cr4 = vmcs.read(Field::GuestCr4)?;
        self.msrs.efer = vmcs.read(Field::GuestIa32Efer)?;
        for (seg, sel, base, limit, ar) in [
            (&mut self.state.cs, Field::GuestCsSelector, Field::GuestCsBase, Field::GuestCsLimit, Field::GuestCsAccessRights),
            (&mut self.state.ss, Field::GuestSsSelector, Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsAccessRights),
            (&mut self.state.ds, Field::GuestDsSelector, Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsAccessRights),
            (&mut self.state.es, Field::GuestEsSelector, Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsAccessRights),
        ] {
            seg.selector = vmcs.read(sel)? as u16;
            seg.base = vmcs.read(base)?;
            seg.limit = vmcs.read(limit)? as u32;
            seg.ar = vmcs.read(ar)? as u32;
        }
        self.shared
            .flags
            .fetch_or(FLAG_CUR_STATE_VALID, Ordering::Relaxed);
        Ok(exit)
    }

    fn flush_pending_writes(&mut self, vmcs: &ActiveVmcs) -> Result<()> {
        let pw = core::mem::take(&mut self.pending_writes);
        if pw.full_state {
            self.write_full_state(vmcs)?;
        } else {
            if let Some(v) = pw.rip {
                vmcs.write(Field::GuestRip, v)?;
            }
            if let Some(v) = pw.rflags {
                vmcs.write(Field::GuestRflags, v)?;
            }
            if let Some(v) = pw.cr0 {
                vmcs.write(Field::GuestCr0, self.apply_cr0_fixed(v))?;
            }
            if let Some(v) = pw.cr3 {
                vmcs.write(Field::GuestCr3, v)?;
            }
            if let Some(v) = pw.cr4 {
                vmcs.write(Field::GuestCr4, self.apply_cr4_fixed(v))?;
            }
            if let Some(v) = pw.efer {
                vmcs.write(Field::GuestIa32Efer, v)?;
                self.sync_ia32e_mode(vmcs, v)?;
            }
            if let Some(v) = pw.dr7 {
                vmcs.write(Field::GuestDr7, v)?;
            }
            if let Some(v) = pw.fs_base {
                vmcs.write(Field::GuestFsBase, v)?;
            }
            if let Some(v) = pw.gs_base {
                vmcs.write(Field::GuestGsBase, v)?;
            }
            if let Some(p) = pw.pdptes {
                vmcs.write(Field::GuestIa32Pdpte0, p[0])?;
                vmcs.write(Field::GuestIa32Pdpte1, p[1])?;
                vmcs.write(Field::GuestIa32Pdpte2, p[2])?;
                vmcs.write(Field::GuestIa32Pdpte3, p[3])?;
            }
            if let Some(v) = pw.interruptibility {
                vmcs.write(Field::GuestInterruptibilityState, v as u64)?;
            }
            if pw.primary_ctls_set != 0 || pw.primary_ctls_clear != 0 {
                let cur = vmcs.read(Field::ProcessorBasedVmexecControls)? as u32;
                vmcs.write(
                    Field::ProcessorBasedVmexecControls,
                    ((cur | pw.primary_ctls_set) & !pw.primary_ctls_clear) as u64,
                )?;
            }
        }
        vmcs.write(Field::ExceptionBitmap, self.exception_bitmap as u64)?;
        Ok(())
    }

    fn sync_ia32e_mode(&self, vmcs: &ActiveVmcs, efer: u64) -> Result<()> {
        let entry = vmcs.read(Field::VmentryControls)? as u32;
        let entry = if efer & EFER_LMA != 0 {
            entry | EntryCtls::IA32E_MODE_GUEST.bits()
        } else {
            entry & !EntryCtls::IA32E_MODE_GUEST.bits()
        };
        vmcs.write(Field::VmentryControls, entry as u64)
    }

    fn inject_intr(&mut self, vmcs: &ActiveVmcs) -> Result<()> {
        if !self.entry_event.is_injected() {
            let interruptibility = Interruptibility::from_bits_truncate(
                vmcs.read(Field::GuestInterruptibilityState)? as u32,
            );
            let window_requested = self
                .tunnel()
                .map(|t| t.page().request_interrupt_window != 0)
                .unwrap_or(false);
            if self.shared.pending.any_pending() {
                if can_inject_interrupt(self.state.rflags, interruptibility) {
                    if let Some(vector) = self.shared.pending.pick() {
                        self.entry_event.inject_interrupt(vector);
                    }
                } else {
                    self.request_interrupt_window();
                }
            } else if window_requested
                && !can_inject_interrupt(self.state.rflags, interruptibility)
            {
                self.request_interrupt_window();
            }
        }

        if let Some(info) = self.entry_event.intr_info {
            if info.is_valid() {
                vmcs.write(Field::VmentryInterruptionInfo, info.raw() as u64)?;
                if let Some(code) = self.entry_event.error_code {
                    vmcs.write(Field::VmentryExceptionErrCode, code as u64)?;
                }
                if let Some(len) = self.entry_event.instruction_length {
                    vmcs.write(Field::VmentryInstructionLength, len as u64)?;
                }
                self.entry_event.clear();
            }
        }
        // Window-control changes staged just above.
        let set = core::mem::take(&mut self.pending_writes.primary_ctls_set);
        let clear = core::mem::take(&mut self.pending_writes.primary_ctls_clear);
        if set != 0 || clear != 0 {
            let cur = vmcs.read(Field::ProcessorBasedVmexecControls)? as u32;
            vmcs.write(
                Field::ProcessorBasedVmexecControls,
                ((cur | set) & !clear) as u64,
            )?;
        }
        Ok(())
    }

    /// Launch-state quirks: some device models leave CS/TR access rights
    /// with a non-accessed type that fails entry checks; force the
    /// accessed/busy types.
    fn fixup_access_rights(&self, vmcs: &ActiveVmcs) -> Result<()> {
        let cs_ar = vmcs.read(Field::GuestCsAccessRights)?;
        if cs_ar & 0xf == 0xa {
            vmcs.write(Field::GuestCsAccessRights, (cs_ar & !0xf) | 0xb)?;
        }
        let tr_ar = vmcs.read(Field::GuestTrAccessRights)?;
        if tr_ar & 0xf != 0xb {
            vmcs.write(Field::GuestTrAccessRights, (tr_ar & !0xf) | 0xb)?;
        }
        Ok(())
    }

    fn apply_cr0_fixed(&self, value: u64) -> u64 {
        let Some(caps) = crate::probe::global_caps() else {
            return value;
        };
        let mut fixed0 = caps.cr0_fixed0;
        if self.unrestricted_guest() {
            // UG lets PE and PG be clear despite CR0_FIXED0.
            fixed0 &= !(CR0_PE | (1 << 31));
        }
        (value | fixed0) & caps.cr0_fixed1
    }

    fn apply_cr4_fixed(&self, value: u64) -> u64 {
        let Some(caps) = crate::probe::global_caps() else {
            return value;
        };
        (value | caps.cr4_fixed0) & caps.cr4_fixed1
    }

    /// Initial VMCS setup: control words from the capability MSRs, host
    /// state, and the cached guest state.
    fn setup_vmcs(&mut self, vmcs: &ActiveVmcs) -> Result<()> {
        use crate::probe::VmxCapabilities;
        let caps = crate::probe::global_caps().ok_or(Error::NoDevice)?;

        let pin = VmxCapabilities::apply(
            caps.pin_ctls,
            (PinBasedCtls::EXTERNAL_INTERRUPT_EXITING | PinBasedCtls::NMI_EXITING).bits(),
        );
        vmcs.write(Field::PinBasedExecControls, pin as u64)?;

        let primary = VmxCapabilities::apply(
            caps.proc_ctls,
            (PrimaryCtls::HLT_EXITING
                | PrimaryCtls::UNCOND_IO_EXITING
                | PrimaryCtls::MOV_DR_EXITING
                | PrimaryCtls::ACTIVATE_SECONDARY_CTLS)
                .bits(),
        );
        vmcs.write(Field::ProcessorBasedVmexecControls, primary as u64)?;

        let secondary = VmxCapabilities::apply(
            caps.proc_ctls2,
            (SecondaryCtls::ENABLE_EPT
                | SecondaryCtls::ENABLE_VPID
                | SecondaryCtls::UNRESTRICTED_GUEST
                | SecondaryCtls::ENABLE_RDTSCP)
                .bits(),
        );
        vmcs.write(Field::SecondaryVmexecControls, secondary as u64)?;

        let exit = VmxCapabilities::apply(
            caps.exit_ctls,
            (ExitCtls::HOST_ADDRESS_SPACE_SIZE
                | ExitCtls::SAVE_IA32_EFER
                | ExitCtls::LOAD_IA32_EFER)
                .bits(),
        );
        vmcs.write(Field::VmexitControls, exit as u64)?;

        let entry = VmxCapabilities::apply(caps.entry_ctls, EntryCtls::LOAD_IA32_EFER.bits());
        vmcs.write(Field::VmentryControls, entry as u64)?;

        vmcs.write(Field::ExceptionBitmap, self.exception_bitmap as u64)?;
        vmcs.write(Field::Vpid, self.vpid as u64)?;
        vmcs.write(Field::Eptptr, self.ept.eptp().raw())?;
        vmcs.write(Field::GuestLinkPointer, u64::MAX)?;
        vmcs.write(Field::Cr0GuestHostMask, 0)?;
        vmcs.write(Field::Cr4GuestHostMask, Cr4::VMXE.bits())?;
        vmcs.write(Field::Cr4ReadShadow, 0)?;

        // Host state area. The volatile pieces (FS/GS bases, DS/ES) are
        // also captured right before every VMRUN.
        let sels = HostSelectors::read();
        vmcs.write(Field::HostCsSelector, (sels.cs & !0x7) as u64)?;
        vmcs.write(Field::HostSsSelector, (sels.ss & !0x7) as u64)?;
        vmcs.write(Field::HostDsSelector, (sels.ds & !0x7) as u64)?;
        vmcs.write(Field::HostEsSelector, (sels.es & !0x7) as u64)?;
        vmcs.write(Field::HostFsSelector, (sels.fs & !0x7) as u64)?;
        vmcs.write(Field::HostGsSelector, (sels.gs & !0x7) as u64)?;
        vmcs.write(Field::HostTrSelector, (sels.tr & !0x7) as u64)?;
        vmcs.write(Field::HostCr0, Cr0::current().bits())?;
        vmcs.write(Field::HostCr3, x86::read_cr3())?;
        vmcs.write(Field::HostCr4, (Cr4::current() | Cr4::VMXE).bits())?;
        vmcs.write(Field::HostGdtrBase, sgdt().base)?;
        vmcs.write(Field::HostIdtrBase, sidt().base)?;
        vmcs.write(Field::HostTrBase, 0)?;
        vmcs.write(Field::HostFsBase, Msr::<{ x86::IA32_FS_BASE }>::read())?;
        vmcs.write(Field::HostGsBase, Msr::<{ x86::IA32_GS_BASE }>::read())?;
        vmcs.write(Field::HostIa32Efer, Msr::<{ x86::IA32_EFER }>::read())?;
        vmcs.write(Field::HostRip, asm_vmexit_handler as usize as u64)?;

        self.write_full_state(vmcs)
    }

    /// Push the entire cached guest state into the VMCS (first entry and
    /// after `SET_REGS`).
    fn write_full_state(&self, vmcs: &ActiveVmcs) -> Result<()> {
        let s = &self.state;
        vmcs.write(Field::GuestRip, s.rip)?;
        vmcs.write(Field::GuestRsp, s.gprs.regs[gpr::RSP])?;
        vmcs.write(Field::GuestRflags, s.rflags | 0x2)?;
        vmcs.write(Field::GuestCr0, self.apply_cr0_fixed(s.cr0))?;
        vmcs.write(Field::GuestCr3, s.cr3)?;
        vmcs.write(Field::GuestCr4, self.apply_cr4_fixed(s.cr4))?;
        vmcs.write(Field::GuestDr7, s.dr7)?;
        vmcs.write(Field::GuestIa32Efer, self.msrs.efer)?;
        self.sync_ia32e_mode(vmcs, self.msrs.efer)?;
        vmcs.write(Field::GuestIa32Pat, self.msrs.pat)?;
        vmcs.write(Field::GuestActivityState, 0)?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;
        vmcs.write(Field::GuestPendingDbgExceptions, 0)?;
        vmcs.write(Field::GuestIa32SysenterCsMsr, self.msrs.sysenter_cs)?;
        vmcs.write(Field::GuestIa32SysenterEspMsr, self.msrs.sysenter_esp)?;
        vmcs.write(Field::GuestIa32SysenterEipMsr, self.msrs.sysenter_eip)?;

        for (seg, sel, base, limit, ar) in [
            (&s.cs, Field::GuestCsSelector, Field::GuestCsBase, Field::GuestCsLimit, Field::GuestCsAccessRights),
            (&s.ss, Field::GuestSsSelector, Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsAccessRights),
            (&s.ds, Field::GuestDsSelector, Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsAccessRights),
            (&s.es, Field::GuestEsSelector, Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsAccessRights),
            (&s.fs, Field::GuestFsSelector, Field::GuestFsBase, Field::GuestFsLimit, Field::GuestFsAccessRights),
            (&s.gs, Field::GuestGsSelector, Field::GuestGsBase, Field::GuestGsLimit, Field::GuestGsAccessRights),
            (&s.ldt, Field::GuestLdtrSelector, Field::GuestLdtrBase, Field::GuestLdtrLimit, Field::GuestLdtrAccessRights),
            (&s.tr, Field::GuestTrSelector, Field::GuestTrBase, Field::GuestTrLimit, Field::GuestTrAccessRights),
        ] {
            vmcs.write(sel, seg.selector as u64)?;
            vmcs.write(base, seg.base)?;
            vmcs.write(limit, seg.limit as u64)?;
            // A zero AR marks an unusable segment (bit 16).
            let ar_value = if seg.ar == 0 { 1 << 16 } else { seg.ar as u64 };
            vmcs.write(ar, ar_value)?;
        }
        vmcs.write(Field::GuestGdtrBase, s.gdt.base)?;
        vmcs.write(Field::GuestGdtrLimit, s.gdt.limit as u64)?;
        vmcs.write(Field::GuestIdtrBase, s.idt.base)?;
        vmcs.write(Field::GuestIdtrLimit, s.idt.limit as u64)?;
        Ok(())
    }

    // -- ioctl servicing ----------------------------------------------------

    /// `GET_REGS`.
    pub fn get_regs(&self) -> VcpuState {
        self.state
    }

    /// `SET_REGS`: replaces the architectural state wholesale.
    pub fn set_regs(&mut self, state: &VcpuState) {
        self.state = *state;
        self.pending_writes.full_state = true;
        self.fetch_cache.invalidate();
    }

    /// `GET_FPU`.
    pub fn get_fpu(&self) -> FpuState {
        self.fpu
    }

    /// `SET_FPU`.
    pub fn set_fpu(&mut self, fpu: &FpuState) {
        self.fpu = *fpu;
    }

    /// `GET_MSRS`: fills in the value of each requested index; unknown
    /// MSRs read as zero with a warning.
    pub fn get_msrs(&self, entries: &mut [(u32, u64)]) -> Result<()> {
        if entries.len() > crate::config::HAX_MAX_MSR_ARRAY {
            return Err(Error::InvalidParam);
        }
        for (index, value) in entries.iter_mut() {
            *value = vmexit::msr::read_msr(self, *index).unwrap_or_else(|| {
                warning!("get_msrs: unknown msr 0x{:x}", index);
                0
            });
        }
        Ok(())
    }

    /// `SET_MSRS`: returns the number of entries actually applied.
    pub fn set_msrs(&mut self, entries: &[(u32, u64)]) -> Result<usize> {
        if entries.len() > crate::config::HAX_MAX_MSR_ARRAY {
            return Err(Error::InvalidParam);
        }
        let mut done = 0;
        for &(index, value) in entries {
            if vmexit::msr::write_msr(self, index, value) {
                done += 1;
            } else {
                warning!("set_msrs: unknown msr 0x{:x}", index);
            }
        }
        Ok(done)
    }

    /// `DEBUG`: arm or disarm guest debugging (breakpoints, single-step).
    pub fn set_debug(&mut self, enable: bool, single_step: bool, dr: &[u64; 4], dr7: u64) {
        if enable {
            self.exception_bitmap |= (1 << 1) | (1 << 3);
            self.state.dr0 = dr[0];
            self.state.dr1 = dr[1];
            self.state.dr2 = dr[2];
            self.state.dr3 = dr[3];
            self.state.dr7 = dr7;
            self.stage_dr7();
            if single_step {
                self.state.rflags |= RFLAGS_TF;
            } else {
                self.state.rflags &= !RFLAGS_TF;
            }
        } else {
            self.exception_bitmap &= !((1 << 1) | (1 << 3));
            self.state.rflags &= !RFLAGS_TF;
        }
        self.pending_writes.rflags = Some(self.state.rflags);
    }
}

/// Saved-IF interrupt guard around the world switch.
struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    fn disable() -> Self {
        let was_enabled = Rflags::read().contains(Rflags::IF);
        unsafe { core::arch::asm!("cli", options(nostack, nomem)) };
        Self { was_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            unsafe { core::arch::asm!("sti", options(nostack, nomem)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    fn test_vcpu() -> Vcpu {
        install_mock();
        let space = Arc::new(GpaSpace::new());
        let ept = Arc::new(EptTree::new().unwrap());
        let cpuid = Arc::new(SpinLock::new(GuestCpuid::init()));
        Vcpu::new(
            1,
            0,
            0x41,
            1,
            Arc::new(VcpuShared::new()),
            space,
            ept,
            cpuid,
        )
        .unwrap()
    }

    #[test]
    fn regs_round_trip_is_identical() {
        let mut vcpu = test_vcpu();
        let mut state = VcpuState::at_reset();
        state.gprs.regs[gpr::RAX] = 0x1234_5678_9abc_def0;
        state.rip = 0x7c00;
        state.cs.base = 0x7000;
        state.dr3 = 0xdead;
        vcpu.set_regs(&state);
        let back = vcpu.get_regs();
        let a = unsafe {
            core::slice::from_raw_parts(
                &state as *const _ as *const u8,
                core::mem::size_of::<VcpuState>(),
            )
        };
        let b = unsafe {
            core::slice::from_raw_parts(
                &back as *const _ as *const u8,
                core::mem::size_of::<VcpuState>(),
            )
        };
        assert_eq!(a, b);
    }

    #[test]
    fn reset_state_is_real_mode() {
        let s = VcpuState::at_reset();
        assert_eq!(s.rip, 0xfff0);
        assert_eq!(s.cs.selector, 0xf000);
        assert_eq!(s.cs.base, 0xffff_0000);
        assert_eq!(s.cr0 & 1, 0);
        assert_eq!(s.rflags, 0x2);
    }

    #[test]
    fn fpu_round_trip() {
        let mut vcpu = test_vcpu();
        let mut fpu = FpuState::default();
        fpu.image[100] = 0x5a;
        vcpu.set_fpu(&fpu);
        assert_eq!(vcpu.get_fpu().image[100], 0x5a);
        // Default image carries the reset FCW/MXCSR.
        assert_eq!(&FpuState::default().image[0..2], &[0x7f, 0x03]);
    }

    #[test]
    fn pause_sets_flag_and_kicks() {
        let vcpu = test_vcpu();
        let shared = vcpu.shared().clone();
        assert!(!shared.is_paused());
        shared.pause();
        assert!(shared.is_paused());
        shared.unpause();
        assert!(!shared.is_paused());
    }

    #[test]
    fn interrupt_enqueues() {
        let mut vcpu = test_vcpu();
        assert!(!vcpu.has_pending_interrupt());
        vcpu.shared().interrupt(0x30);
        assert!(vcpu.has_pending_interrupt());
        // An injected exception also counts as pending.
        let mut vcpu2 = test_vcpu();
        vcpu2.inject_exception(6, None);
        assert!(vcpu2.has_pending_interrupt());
    }

    #[test]
    fn advance_rip_stages_write() {
        let mut vcpu = test_vcpu();
        vcpu.state.rip = 0x1000;
        let exit = ExitInfo {
            instruction_length: 3,
            interruptibility: Interruptibility::STI_BLOCKING.bits(),
            ..ExitInfo::default()
        };
        vcpu.advance_rip(&exit);
        assert_eq!(vcpu.state.rip, 0x1003);
        assert_eq!(vcpu.pending_writes.rip, Some(0x1003));
        // STI blocking is cleared by instruction completion.
        assert_eq!(vcpu.pending_writes.interruptibility, Some(0));
    }

    #[test]
    fn bitness_follows_mode_bits() {
        let mut vcpu = test_vcpu();
        // Real mode.
        assert_eq!(vcpu.cpu_bitness(), 16);
        // Protected 32-bit.
        vcpu.state.cr0 |= CR0_PE;
        vcpu.state.cs.ar = 0xc093; // D bit set
        assert_eq!(vcpu.cpu_bitness(), 32);
        // Long mode.
        vcpu.msrs.efer |= EFER_LMA;
        vcpu.state.cs.ar = 0xa09b; // L bit set
        assert_eq!(vcpu.cpu_bitness(), 64);
    }

    #[test]
    fn set_debug_arms_exception_bitmap() {
        let mut vcpu = test_vcpu();
        assert!(!vcpu.debug_armed());
        vcpu.set_debug(true, true, &[0x1000, 0, 0, 0], 0x401);
        assert!(vcpu.debug_armed());
        assert_eq!(vcpu.state.dr0, 0x1000);
        assert_ne!(vcpu.state.rflags & RFLAGS_TF, 0);
        vcpu.set_debug(false, false, &[0; 4], 0);
        assert!(!vcpu.debug_armed());
    }
}
