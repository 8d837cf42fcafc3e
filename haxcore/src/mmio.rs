//! MMIO instruction decoder and fast path.
//!
//! Invoked when an EPT violation resolves to "no backing RAM". The vCPU
//! fetches up to 15 bytes at CS:RIP, this module decodes them and, for the
//! supported instruction set (MOV/MOVZX/STOS/MOVS and the AND/OR/XOR
//! register loads), produces a structured fast-MMIO request plus the
//! `post_mmio` descriptor applied when user space returns the value.
//! Anything else escalates to the full `HAX_EXIT_MMIO` path.

use crate::memory::{Gpa, GpaSpace, Gva};
use crate::vmx::entry::{gpr, GuestGprs};
use crate::Result;
use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

/// Max bytes of one x86 instruction.
pub const MAX_INSN_BYTES: usize = 15;

/// Bitwise post-processing applied between the value user space returns
/// and the saved operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Manip {
    None,
    And,
    Or,
    Xor,
}

/// What to do with the value once user space completes the request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PostOp {
    /// Nothing to apply (writes, MMIO-to-MMIO copies).
    Noop,
    /// Store into a guest register.
    WriteReg,
    /// Store into guest memory at `va`.
    WriteMem,
}

/// Per-vCPU post-MMIO descriptor captured at decode time.
#[derive(Clone, Copy, Debug)]
pub struct PostMmio {
    pub op: PostOp,
    /// Destination register (x86 numbering) for `WriteReg`.
    pub reg_index: usize,
    /// Destination register write width.
    pub reg_size: u8,
    /// Destination GVA for `WriteMem`.
    pub va: u64,
    pub manip: Manip,
    /// Access width of the MMIO operand.
    pub size: u8,
    /// Saved operand for the bitwise ops.
    pub value: u64,
}

impl Default for PostMmio {
    fn default() -> Self {
        Self {
            op: PostOp::Noop,
            reg_index: 0,
            reg_size: 0,
            va: 0,
            manip: Manip::None,
            size: 0,
            value: 0,
        }
    }
}

/// A decoded fast-MMIO request.
#[derive(Clone, Copy, Debug)]
pub struct FastRequest {
    /// Length of the decoded instruction.
    pub insn_len: u8,
    pub gpa: u64,
    /// Destination GPA for direction 2 (MMIO to MMIO).
    pub gpa2: u64,
    pub size: u8,
    /// 0 = read, 1 = write, 2 = copy gpa -> gpa2.
    pub direction: u8,
    /// Outgoing value for writes.
    pub value: u64,
    /// Destination register for reads, for the device model's benefit.
    pub reg_index: u16,
    pub post: PostMmio,
    /// Whether RIP moves past the instruction on re-entry (REP iterations
    /// hold RIP until the count reaches zero).
    pub advance_rip: bool,
}

/// Decoder outcome.
#[derive(Clone, Copy, Debug)]
pub enum Decoded {
    /// Fast-path request for user space.
    Fast(FastRequest),
    /// Unsupported instruction: full MMIO exit.
    Full,
    /// The instruction retired without an access (REP with count zero);
    /// carries the instruction length for the RIP advance.
    Retired(u8),
}

/// Segment base registers of the faulting vCPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegBases {
    pub es: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub fs: u64,
    pub gs: u64,
}

impl SegBases {
    fn of(&self, seg: Register) -> u64 {
        match seg {
            Register::ES => self.es,
            Register::CS => self.cs,
            Register::SS => self.ss,
            Register::FS => self.fs,
            Register::GS => self.gs,
            _ => self.ds,
        }
    }
}

/// Decode inputs: the guest register file plus the mode bits the parse
/// depends on.
pub struct DecodeCtx<'a> {
    pub gprs: &'a mut GuestGprs,
    pub rip: u64,
    pub rflags: u64,
    /// 16, 32, or 64.
    pub bitness: u32,
    pub seg: SegBases,
    /// MMIO-to-MMIO copies negotiated with the device model.
    pub mmio_extra: bool,
}

const RFLAGS_DF: u64 = 1 << 10;

fn reg_info(reg: Register) -> Option<(usize, u8)> {
    use Register as R;
    let v = reg as u32;
    let in_range = |lo: R, hi: R| v >= lo as u32 && v <= hi as u32;
    if in_range(R::AL, R::BL) {
        Some(((v - R::AL as u32) as usize, 1))
    } else if in_range(R::SPL, R::DIL) {
        Some((4 + (v - R::SPL as u32) as usize, 1))
    } else if in_range(R::R8L, R::R15L) {
        Some((8 + (v - R::R8L as u32) as usize, 1))
    } else if in_range(R::AX, R::R15W) {
        Some(((v - R::AX as u32) as usize, 2))
    } else if in_range(R::EAX, R::R15D) {
        Some(((v - R::EAX as u32) as usize, 4))
    } else if in_range(R::RAX, R::R15) {
        Some(((v - R::RAX as u32) as usize, 8))
    } else {
        // AH/CH/DH/BH and anything that is not a GPR: let the device
        // model emulate it.
        None
    }
}

fn addr_mask(bitness: u32) -> u64 {
    match bitness {
        16 => 0xffff,
        32 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn movzx_src_size(code: Code) -> u8 {
    match code {
        Code::Movzx_r16_rm8 | Code::Movzx_r32_rm8 | Code::Movzx_r64_rm8 => 1,
        _ => 2,
    }
}

fn mov_imm(insn: &Instruction) -> (u64, u8) {
    match insn.code() {
        Code::Mov_rm8_imm8 => (insn.immediate8() as u64, 1),
        Code::Mov_rm16_imm16 => (insn.immediate16() as u64, 2),
        Code::Mov_rm32_imm32 => (insn.immediate32() as u64, 4),
        // imm32 sign-extended to 64 bits.
        _ => (insn.immediate32to64() as u64, 8),
    }
}

fn string_size(code: Code) -> u8 {
    match code {
        Code::Stosb_m8_AL | Code::Movsb_m8_m8 => 1,
        Code::Stosw_m16_AX | Code::Movsw_m16_m16 => 2,
        Code::Stosd_m32_EAX | Code::Movsd_m32_m32 => 4,
        _ => 8,
    }
}

#[inline]
fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

/// Decode the faulting instruction and build the fast-MMIO request.
///
/// `translate` resolves guest-virtual operands of MOVS to guest-physical;
/// `space` classifies each side as RAM or MMIO. REP iterations update
/// RSI/RDI/RCX here, one access per exit, and keep RIP in place until the
/// final iteration.
pub fn decode_mmio(
    ctx: &mut DecodeCtx<'_>,
    bytes: &[u8],
    fault_gpa: Gpa,
    space: &GpaSpace,
    translate: &dyn Fn(Gva) -> Option<Gpa>,
) -> Decoded {
    let mut decoder = Decoder::with_ip(ctx.bitness, bytes, ctx.rip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Decoded::Full;
    }
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Decoded::Full;
    }

    match insn.mnemonic() {
        Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
            decode_mov_family(ctx, &insn, fault_gpa)
        }
        _ => match insn.code() {
            Code::Stosb_m8_AL | Code::Stosw_m16_AX | Code::Stosd_m32_EAX | Code::Stosq_m64_RAX => {
                decode_stos(ctx, &insn, fault_gpa)
            }
            // Matching by Code, not mnemonic: Movsd also names the SSE
            // scalar move.
            Code::Movsb_m8_m8 | Code::Movsw_m16_m16 | Code::Movsd_m32_m32 | Code::Movsq_m64_m64 => {
                decode_movs(ctx, &insn, space, translate)
            }
            _ => Decoded::Full,
        },
    }
}

fn decode_mov_family(ctx: &mut DecodeCtx<'_>, insn: &Instruction, fault_gpa: Gpa) -> Decoded {
    let manip = match insn.mnemonic() {
        Mnemonic::And => Manip::And,
        Mnemonic::Or => Manip::Or,
        Mnemonic::Xor => Manip::Xor,
        _ => Manip::None,
    };
    match (insn.op0_kind(), insn.op1_kind()) {
        // Load: reg <- iomem.
        (OpKind::Register, OpKind::Memory) => {
            let Some((reg_index, reg_size)) = reg_info(insn.op0_register()) else {
                return Decoded::Full;
            };
            let size = if insn.mnemonic() == Mnemonic::Movzx {
                movzx_src_size(insn.code())
            } else {
                reg_size
            };
            let saved = if manip == Manip::None {
                0
            } else {
                ctx.gprs.read_sized(reg_index, size)
            };
            Decoded::Fast(FastRequest {
                insn_len: insn.len() as u8,
                gpa: fault_gpa.into_u64(),
                gpa2: 0,
                size,
                direction: 0,
                value: 0,
                reg_index: reg_index as u16,
                post: PostMmio {
                    op: PostOp::WriteReg,
                    reg_index,
                    reg_size,
                    va: 0,
                    manip,
                    size,
                    value: saved,
                },
                advance_rip: true,
            })
        }
        // Store: iomem <- reg. The bitwise forms with a memory destination
        // are not in the supported set.
        (OpKind::Memory, OpKind::Register) if manip == Manip::None => {
            let Some((reg_index, size)) = reg_info(insn.op1_register()) else {
                return Decoded::Full;
            };
            Decoded::Fast(FastRequest {
                insn_len: insn.len() as u8,
                gpa: fault_gpa.into_u64(),
                gpa2: 0,
                size,
                direction: 1,
                value: ctx.gprs.read_sized(reg_index, size),
                reg_index: reg_index as u16,
                post: PostMmio::default(),
                advance_rip: true,
            })
        }
        // Store: iomem <- imm.
        (OpKind::Memory, _) if insn.mnemonic() == Mnemonic::Mov && insn.op1_kind() != OpKind::Memory => {
            let (value, size) = mov_imm(insn);
            Decoded::Fast(FastRequest {
                insn_len: insn.len() as u8,
                gpa: fault_gpa.into_u64(),
                gpa2: 0,
                size,
                direction: 1,
                value: value & size_mask(size),
                reg_index: 0,
                post: PostMmio::default(),
                advance_rip: true,
            })
        }
        _ => Decoded::Full,
    }
}

fn decode_stos(ctx: &mut DecodeCtx<'_>, insn: &Instruction, fault_gpa: Gpa) -> Decoded {
    let size = string_size(insn.code());
    let rep = insn.has_rep_prefix();
    if rep && ctx.gprs.regs[gpr::RCX] & addr_mask(ctx.bitness) == 0 {
        return Decoded::Retired(insn.len() as u8);
    }
    let value = ctx.gprs.read_sized(gpr::RAX, size);
    let advance_rip = string_step(ctx, rep, size, false, true);
    Decoded::Fast(FastRequest {
        insn_len: insn.len() as u8,
        gpa: fault_gpa.into_u64(),
        gpa2: 0,
        size,
        direction: 1,
        value,
        reg_index: gpr::RAX as u16,
        post: PostMmio::default(),
        advance_rip,
    })
}

fn decode_movs(
    ctx: &mut DecodeCtx<'_>,
    insn: &Instruction,
    space: &GpaSpace,
    translate: &dyn Fn(Gva) -> Option<Gpa>,
) -> Decoded {
    let size = string_size(insn.code());
    let rep = insn.has_rep_prefix();
    if rep && ctx.gprs.regs[gpr::RCX] & addr_mask(ctx.bitness) == 0 {
        return Decoded::Retired(insn.len() as u8);
    }
    let mask = addr_mask(ctx.bitness);
    // Source DS(:override):RSI, destination ES:RDI.
    let src_seg = insn.memory_segment();
    let src_va = (ctx.gprs.regs[gpr::RSI] & mask).wrapping_add(ctx.seg.of(src_seg));
    let dst_va = (ctx.gprs.regs[gpr::RDI] & mask).wrapping_add(ctx.seg.es);

    let (Some(src_gva), Some(dst_gva)) = (Gva::new(src_va), Gva::new(dst_va)) else {
        return Decoded::Full;
    };
    let (Some(src_gpa), Some(dst_gpa)) = (translate(src_gva), translate(dst_gva)) else {
        return Decoded::Full;
    };
    let src_mmio = space.slot_for(src_gpa.gfn()).is_none();
    let dst_mmio = space.slot_for(dst_gpa.gfn()).is_none();

    let req = match (src_mmio, dst_mmio) {
        (true, false) => FastRequest {
            insn_len: insn.len() as u8,
            gpa: src_gpa.into_u64(),
            gpa2: 0,
            size,
            direction: 0,
            value: 0,
            reg_index: 0,
            post: PostMmio {
                op: PostOp::WriteMem,
                reg_index: 0,
                reg_size: 0,
                va: dst_va,
                manip: Manip::None,
                size,
                value: 0,
            },
            advance_rip: false,
        },
        (false, true) => {
            let mut buf = [0u8; 8];
            let n = size as usize;
            match space.read_data(src_gpa, &mut buf[..n]) {
                Ok(read) if read == n => {}
                _ => return Decoded::Full,
            }
            FastRequest {
                insn_len: insn.len() as u8,
                gpa: dst_gpa.into_u64(),
                gpa2: 0,
                size,
                direction: 1,
                value: u64::from_le_bytes(buf) & size_mask(size),
                reg_index: 0,
                post: PostMmio::default(),
                advance_rip: false,
            }
        }
        (true, true) => {
            if !ctx.mmio_extra {
                return Decoded::Full;
            }
            FastRequest {
                insn_len: insn.len() as u8,
                gpa: src_gpa.into_u64(),
                gpa2: dst_gpa.into_u64(),
                size,
                direction: 2,
                value: dst_gpa.into_u64(),
                reg_index: 0,
                post: PostMmio::default(),
                advance_rip: false,
            }
        }
        (false, false) => return Decoded::Full,
    };
    let advance_rip = string_step(ctx, rep, size, true, true);
    Decoded::Fast(FastRequest {
        advance_rip,
        ..req
    })
}

/// Advance the string registers by one element: RSI/RDI move by the access
/// size with the sign of RFLAGS.DF, RCX decrements under REP. Returns
/// whether RIP should advance (count exhausted or no REP).
fn string_step(ctx: &mut DecodeCtx<'_>, rep: bool, size: u8, step_rsi: bool, step_rdi: bool) -> bool {
    let delta = if ctx.rflags & RFLAGS_DF != 0 {
        (size as u64).wrapping_neg()
    } else {
        size as u64
    };
    if step_rsi {
        ctx.gprs.regs[gpr::RSI] = ctx.gprs.regs[gpr::RSI].wrapping_add(delta);
    }
    if step_rdi {
        ctx.gprs.regs[gpr::RDI] = ctx.gprs.regs[gpr::RDI].wrapping_add(delta);
    }
    if !rep {
        return true;
    }
    let mask = addr_mask(ctx.bitness);
    let count = (ctx.gprs.regs[gpr::RCX] & mask).wrapping_sub(1) & mask;
    ctx.gprs.regs[gpr::RCX] = (ctx.gprs.regs[gpr::RCX] & !mask) | count;
    count == 0
}

/// Apply the saved post-MMIO descriptor after user space returned `value`.
///
/// The bitwise op combines the returned value with the saved operand; the
/// store truncates to the recorded width (64-bit register writes replace
/// the whole register, 32-bit writes zero-extend, narrower writes merge).
pub fn handle_mmio_post(
    gprs: &mut GuestGprs,
    post: &PostMmio,
    value: u64,
    write_mem: &mut dyn FnMut(u64, u64, u8) -> Result<()>,
) -> Result<()> {
    let value = value & size_mask(post.size);
    match post.op {
        PostOp::Noop => Ok(()),
        PostOp::WriteReg => {
            let v = match post.manip {
                Manip::None => value,
                Manip::And => post.value & value,
                Manip::Or => post.value | value,
                Manip::Xor => post.value ^ value,
            };
            gprs.write_sized(post.reg_index, post.reg_size, v & size_mask(post.size));
            Ok(())
        }
        PostOp::WriteMem => write_mem(post.va, value, post.size),
    }
}

/// One-entry fetch cache keyed by code page and guest CR3, amortizing the
/// page walk on tight MMIO loops.
#[derive(Clone, Copy, Debug, Default)]
pub struct FetchCache {
    valid: bool,
    cr3: u64,
    gva_page: u64,
    gpa_page: u64,
}

impl FetchCache {
    /// Cached translation of the page containing `gva` under `cr3`.
    pub fn lookup(&self, cr3: u64, gva: Gva) -> Option<Gpa> {
        (self.valid && self.cr3 == cr3 && gva.into_u64() & !0xfff == self.gva_page)
            .then(|| Gpa::new(self.gpa_page | gva.page_offset()))
            .flatten()
    }

    /// Record a translation.
    pub fn fill(&mut self, cr3: u64, gva: Gva, gpa: Gpa) {
        self.valid = true;
        self.cr3 = cr3;
        self.gva_page = gva.into_u64() & !0xfff;
        self.gpa_page = gpa.into_u64() & !0xfff;
    }

    /// Drop the cached translation (CR3 switch, slot change).
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemSlotFlags;
    use haxhal::mock::install_mock;

    fn ram_with_hole() -> GpaSpace {
        // RAM at [0, 0x100000) with a hole at [0xf0000, 0xf1000).
        let mock = install_mock();
        let uva = mock.alloc_user(0x10_0000);
        let space = GpaSpace::new();
        space.add_ramblock(uva, 0x10_0000).unwrap();
        space.set_ram(0, 0x100, uva, MemSlotFlags::empty()).unwrap();
        space
            .set_ram(0xf0, 1, 0, MemSlotFlags::INVALID)
            .unwrap();
        space
            .set_ram(0xf1, 0xf, uva + 0xf1000, MemSlotFlags::empty())
            .unwrap();
        space
    }

    fn ctx<'a>(gprs: &'a mut GuestGprs) -> DecodeCtx<'a> {
        DecodeCtx {
            gprs,
            rip: 0x1000,
            rflags: 0x2,
            bitness: 64,
            seg: SegBases::default(),
            mmio_extra: true,
        }
    }

    fn decode(
        ctx: &mut DecodeCtx<'_>,
        bytes: &[u8],
        gpa: u64,
        space: &GpaSpace,
    ) -> Decoded {
        decode_mmio(ctx, bytes, Gpa::new(gpa).unwrap(), space, &|gva| {
            Gpa::new(gva.into_u64())
        })
    }

    #[test]
    fn mov_load_to_al() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RAX] = 0xffff_ffff_ffff_ffff;
        let mut c = ctx(&mut gprs);
        // mov al, [rbx]
        let Decoded::Fast(req) = decode(&mut c, &[0x8a, 0x03], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!((req.gpa, req.size, req.direction), (0xf0000, 1, 0));
        assert_eq!(req.reg_index, gpr::RAX as u16);
        assert!(req.advance_rip);

        // Device model returns 0xAB; only AL changes.
        handle_mmio_post(&mut gprs, &req.post, 0xab, &mut |_, _, _| Ok(())).unwrap();
        assert_eq!(gprs.regs[gpr::RAX], 0xffff_ffff_ffff_ffab);
    }

    #[test]
    fn mov_store_from_reg() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RCX] = 0x1122_3344_5566_7788;
        let mut c = ctx(&mut gprs);
        // mov [rbx], ecx
        let Decoded::Fast(req) = decode(&mut c, &[0x89, 0x0b], 0xf0004, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!((req.size, req.direction), (4, 1));
        assert_eq!(req.value, 0x5566_7788);
        assert_eq!(req.post.op, PostOp::Noop);
    }

    #[test]
    fn mov_store_imm() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        let mut c = ctx(&mut gprs);
        // mov byte ptr [rbx], 0x5a
        let Decoded::Fast(req) = decode(&mut c, &[0xc6, 0x03, 0x5a], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!((req.size, req.direction, req.value), (1, 1, 0x5a));
    }

    #[test]
    fn movzx_zero_extends() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RDX] = u64::MAX;
        let mut c = ctx(&mut gprs);
        // movzx edx, byte ptr [rbx]
        let Decoded::Fast(req) = decode(&mut c, &[0x0f, 0xb6, 0x13], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!((req.size, req.direction), (1, 0));
        handle_mmio_post(&mut gprs, &req.post, 0x80, &mut |_, _, _| Ok(())).unwrap();
        // 32-bit destination write zero-extends to the full register.
        assert_eq!(gprs.regs[gpr::RDX], 0x80);
    }

    #[test]
    fn and_load_combines_with_register() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RAX] = 0xf0;
        let mut c = ctx(&mut gprs);
        // and al, [rbx]
        let Decoded::Fast(req) = decode(&mut c, &[0x22, 0x03], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!(req.post.manip, Manip::And);
        assert_eq!(req.post.value, 0xf0);
        handle_mmio_post(&mut gprs, &req.post, 0x3c, &mut |_, _, _| Ok(())).unwrap();
        assert_eq!(gprs.regs[gpr::RAX], 0x30);
    }

    #[test]
    fn unsupported_opcode_is_full_exit() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        let mut c = ctx(&mut gprs);
        // add [rbx], eax
        assert!(matches!(
            decode(&mut c, &[0x01, 0x03], 0xf0000, &space),
            Decoded::Full
        ));
        // mov ah, [rbx]: high-byte destinations are not decoded.
        assert!(matches!(
            decode(&mut c, &[0x8a, 0x23], 0xf0000, &space),
            Decoded::Full
        ));
    }

    #[test]
    fn rep_stos_steps_one_element_per_exit() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RAX] = 0x77;
        gprs.regs[gpr::RCX] = 2;
        gprs.regs[gpr::RDI] = 0xf0000;
        let mut c = ctx(&mut gprs);
        // rep stosb
        let Decoded::Fast(req) = decode(&mut c, &[0xf3, 0xaa], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!((req.direction, req.value, req.size), (1, 0x77, 1));
        assert!(!req.advance_rip);
        assert_eq!(gprs.regs[gpr::RDI], 0xf0001);
        assert_eq!(gprs.regs[gpr::RCX], 1);

        // Final iteration advances RIP.
        let mut c = ctx(&mut gprs);
        let Decoded::Fast(req) = decode(&mut c, &[0xf3, 0xaa], 0xf0001, &space) else {
            panic!("expected fast decode");
        };
        assert!(req.advance_rip);
        assert_eq!(gprs.regs[gpr::RCX], 0);

        // Count exhausted: the instruction retires with no access.
        let mut c = ctx(&mut gprs);
        assert!(matches!(
            decode(&mut c, &[0xf3, 0xaa], 0xf0000, &space),
            Decoded::Retired(2)
        ));
    }

    #[test]
    fn rep_movs_ram_to_mmio() {
        let space = ram_with_hole();
        // Seed source RAM.
        space
            .write_data(Gpa::new(0x8000).unwrap(), &[0xaa, 0xbb, 0xcc, 0xdd])
            .unwrap();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RCX] = 4;
        gprs.regs[gpr::RSI] = 0x8000;
        gprs.regs[gpr::RDI] = 0xf0000;
        for i in 0..4u64 {
            let mut c = ctx(&mut gprs);
            // rep movsb
            let Decoded::Fast(req) = decode(&mut c, &[0xf3, 0xa4], 0xf0000 + i, &space) else {
                panic!("expected fast decode");
            };
            assert_eq!(req.direction, 1);
            assert_eq!(req.size, 1);
            assert_eq!(req.gpa, 0xf0000 + i);
            assert_eq!(req.value, [0xaa, 0xbb, 0xcc, 0xdd][i as usize] as u64);
            assert_eq!(req.advance_rip, i == 3);
            assert_eq!(gprs.regs[gpr::RSI], 0x8001 + i);
            assert_eq!(gprs.regs[gpr::RDI], 0xf0001 + i);
            assert_eq!(gprs.regs[gpr::RCX], 3 - i);
        }
    }

    #[test]
    fn movs_mmio_to_ram_posts_memory_write() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RSI] = 0xf0000;
        gprs.regs[gpr::RDI] = 0x9000;
        let mut c = ctx(&mut gprs);
        // movsb, source is the hole.
        let Decoded::Fast(req) = decode(&mut c, &[0xa4], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!(req.direction, 0);
        assert_eq!(req.gpa, 0xf0000);
        assert_eq!(req.post.op, PostOp::WriteMem);
        assert_eq!(req.post.va, 0x9000);
        assert!(req.advance_rip);

        let mut written = None;
        handle_mmio_post(&mut gprs, &req.post, 0x42, &mut |va, v, size| {
            written = Some((va, v, size));
            Ok(())
        })
        .unwrap();
        assert_eq!(written, Some((0x9000, 0x42, 1)));
    }

    #[test]
    fn movs_mmio_to_mmio_uses_direction_2() {
        let space = ram_with_hole();
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RSI] = 0xf0000;
        gprs.regs[gpr::RDI] = 0xf0800;
        let mut c = ctx(&mut gprs);
        let Decoded::Fast(req) = decode(&mut c, &[0xa4], 0xf0000, &space) else {
            panic!("expected fast decode");
        };
        assert_eq!(req.direction, 2);
        assert_eq!((req.gpa, req.gpa2), (0xf0000, 0xf0800));

        // Without the negotiated feature the decoder bails out.
        let mut gprs2 = GuestGprs::default();
        gprs2.regs[gpr::RSI] = 0xf0000;
        gprs2.regs[gpr::RDI] = 0xf0800;
        let mut c = ctx(&mut gprs2);
        c.mmio_extra = false;
        assert!(matches!(
            decode(&mut c, &[0xa4], 0xf0000, &space),
            Decoded::Full
        ));
    }

    #[test]
    fn fetch_cache_hits_same_page() {
        let mut cache = FetchCache::default();
        let gva = Gva::new(0x40_1000).unwrap();
        let gpa = Gpa::new(0x9000).unwrap();
        assert!(cache.lookup(0x5000, gva).is_none());
        cache.fill(0x5000, gva, gpa);
        let hit = cache.lookup(0x5000, Gva::new(0x40_1abc).unwrap()).unwrap();
        assert_eq!(hit.into_u64(), 0x9abc);
        // Different CR3 misses.
        assert!(cache.lookup(0x6000, gva).is_none());
        cache.invalidate();
        assert!(cache.lookup(0x5000, gva).is_none());
    }
}
