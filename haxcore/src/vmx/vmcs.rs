//! VMCS management.

use super::VmxResult;
use crate::{Error, Result};
use core::arch::asm;
use haxhal::{Pa, PageFrame};

/// Possible errors of VMX instructions.
///
/// # Details
/// See Intel SDM Vol. 3C, Table 30-1, VM-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff,
    /// VM entry with invalid control field(s)
    InvalidControlFields,
    /// VM entry with invalid host-state field(s)
    InvalidHostState,
    /// VMPTRLD with invalid physical address
    VmptrldWithInvAddr,
    /// VMPTRLD with VMXON pointer
    VmptrldWithVmxon,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmptrldWithIncorrectRevId,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField,
    /// VMWRITE to read-only VMCS component
    WriteToRoField,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot,
    /// VM entry with events blocked by MOV SS
    VmentryWithEventBlockedByMovss,
    /// Invalid operand to INVEPT/INVVPID
    InvalidOperandToInvept,
    /// Unknown error
    Unknown,
}

impl InstructionError {
    fn from_number(v: u64) -> Self {
        match v {
            1 => InstructionError::VmcallInVmxRoot,
            2 => InstructionError::VmclearWithInvAddr,
            3 => InstructionError::VmclearWithVmxon,
            4 => InstructionError::VmlaunchWithNonclearVmcs,
            5 => InstructionError::VmresumeWithNonlaunchedVmcs,
            6 => InstructionError::VmresumeAfterVmxoff,
            7 => InstructionError::InvalidControlFields,
            8 => InstructionError::InvalidHostState,
            9 => InstructionError::VmptrldWithInvAddr,
            10 => InstructionError::VmptrldWithVmxon,
            11 => InstructionError::VmptrldWithIncorrectRevId,
            12 => InstructionError::UnsupportedVmcsField,
            13 => InstructionError::WriteToRoField,
            15 => InstructionError::VmxonInVmxRoot,
            26 => InstructionError::VmentryWithEventBlockedByMovss,
            28 => InstructionError::InvalidOperandToInvept,
            _ => InstructionError::Unknown,
        }
    }
}

/// Vmcs field encodings.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum Field {
    // 16bit fields
    Vpid = 0x00000000,
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64bit fields
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    MsrBitmaps = 0x00002004,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrLoadAddr = 0x00002008,
    VmentryMsrLoadAddr = 0x0000200A,
    TscOffset = 0x00002010,
    Eptptr = 0x0000201A,
    GuestPhysicalAddr = 0x00002400,
    GuestLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    GuestIa32Pdpte0 = 0x0000280A,
    GuestIa32Pdpte1 = 0x0000280C,
    GuestIa32Pdpte2 = 0x0000280E,
    GuestIa32Pdpte3 = 0x00002810,
    HostIa32Pat = 0x00002C00,
    HostIa32Efer = 0x00002C02,
    // 32bit fields
    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    PageFaultErrCodeMask = 0x00004006,
    PageFaultErrCodeMatch = 0x00004008,
    Cr3TargetCount = 0x0000400A,
    VmexitControls = 0x0000400C,
    VmexitMsrStoreCount = 0x0000400E,
    VmexitMsrLoadCount = 0x00004010,
    VmentryControls = 0x00004012,
    VmentryMsrLoadCount = 0x00004014,
    VmentryInterruptionInfo = 0x00004016,
    VmentryExceptionErrCode = 0x00004018,
    VmentryInstructionLength = 0x0000401A,
    TprThreshold = 0x0000401C,
    SecondaryVmexecControls = 0x0000401E,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInterruptionErrCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestIa32SysenterCsMsr = 0x0000482A,
    HostIa32SysenterCsMsr = 0x00004C00,
    // natural-width fields
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    VmexitQualification = 0x00006400,
    GuestLinearAddr = 0x0000640A,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestIa32SysenterEspMsr = 0x00006824,
    GuestIa32SysenterEipMsr = 0x00006826,
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostIa32SysenterEspMsr = 0x00006C10,
    HostIa32SysenterEipMsr = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// The current VM-instruction error of this pCPU.
pub fn instruction_error() -> InstructionError {
    unsafe {
        let err: i8;
        let v: u64;
        asm!(
            "clc",
            "vmread {}, {}",
            "setna {}",
            out(reg) v,
            in(reg) Field::InstructionError as u64,
            out(reg_byte) err
        );
        if err != 0 {
            InstructionError::Unknown
        } else {
            InstructionError::from_number(v)
        }
    }
}

#[inline]
fn vmx_ptr_op(pa: Pa, op_vmclear: bool) -> VmxResult {
    unsafe {
        let (cf, zf): (u8, u8);
        let addr = pa.into_u64();
        if op_vmclear {
            asm!(
                "vmclear [{}]",
                "setc {}",
                "setz {}",
                in(reg) &addr,
                out(reg_byte) cf,
                out(reg_byte) zf,
            );
        } else {
            asm!(
                "vmptrld [{}]",
                "setc {}",
                "setz {}",
                in(reg) &addr,
                out(reg_byte) cf,
                out(reg_byte) zf,
            );
        }
        VmxResult::from_flags(cf, zf)
    }
}

/// VMCLEAR by physical address (used when the owning `Vmcs` object is not
/// at hand, e.g. from the load-token drop path).
pub(crate) fn vmx_clear_pa(pa: Pa) -> VmxResult {
    vmx_ptr_op(pa, true)
}

/// Execute VMXON with the given region.
///
/// # Safety
/// The region must be a valid, revision-stamped VMXON page and CR4.VMXE
/// must be set.
pub unsafe fn vmxon(pa: Pa) -> VmxResult {
    let (cf, zf): (u8, u8);
    let addr = pa.into_u64();
    asm!(
        "vmxon [{}]",
        "setc {}",
        "setz {}",
        in(reg) &addr,
        out(reg_byte) cf,
        out(reg_byte) zf,
    );
    VmxResult::from_flags(cf, zf)
}

/// Execute VMXOFF.
///
/// # Safety
/// The pCPU must be in VMX root operation.
pub unsafe fn vmxoff() -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!(
        "vmxoff",
        "setc {}",
        "setz {}",
        out(reg_byte) cf,
        out(reg_byte) zf,
    );
    VmxResult::from_flags(cf, zf)
}

/// Execute VMPTRST, returning the current-VMCS pointer. Used to probe
/// whether another VMM already holds VMX root on this pCPU.
///
/// # Safety
/// Faults unless the pCPU is in VMX operation.
pub unsafe fn vmptrst() -> core::result::Result<u64, VmxResult> {
    let (cf, zf): (u8, u8);
    let mut out: u64 = 0;
    asm!(
        "vmptrst [{}]",
        "setc {}",
        "setz {}",
        in(reg) &mut out,
        out(reg_byte) cf,
        out(reg_byte) zf,
    );
    match VmxResult::from_flags(cf, zf) {
        VmxResult::Succeed => Ok(out),
        r => Err(r),
    }
}

/// A per-vCPU VMCS page.
pub struct Vmcs {
    frame: PageFrame,
}

impl Vmcs {
    /// Allocate a zero-filled VMCS page stamped with `revision_id`.
    pub fn new(revision_id: u32) -> Result<Self> {
        let mut frame = PageFrame::new().ok_or(Error::NoMemory)?;
        unsafe {
            frame.inner_mut()[..4].copy_from_slice(&revision_id.to_le_bytes());
        }
        Ok(Self { frame })
    }

    /// Host-physical address of the page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.frame.pa()
    }

    /// VMCLEAR this VMCS (flush and mark clear).
    pub fn clear(&self) -> Result<()> {
        match vmx_ptr_op(self.pa(), true) {
            VmxResult::Succeed => Ok(()),
            _ => Err(Error::Vmx(instruction_error())),
        }
    }

    /// VMPTRLD this VMCS, making it current on the pCPU.
    pub(crate) fn load(&self) -> Result<()> {
        match vmx_ptr_op(self.pa(), false) {
            VmxResult::Succeed => Ok(()),
            _ => Err(Error::Vmx(instruction_error())),
        }
    }
}

/// Access to the VMCS currently loaded on this pCPU. Only reachable
/// through the engine's load token, which pins the thread to the pCPU.
#[derive(Clone, Copy)]
pub struct ActiveVmcs {
    _p: (),
}

impl ActiveVmcs {
    pub(crate) fn assume_loaded() -> Self {
        Self { _p: () }
    }

    /// Read a field of the current VMCS.
    pub fn read(&self, field: Field) -> Result<u64> {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err
            );
            if err != 0 {
                Err(Error::Vmx(instruction_error()))
            } else {
                Ok(v)
            }
        }
    }

    /// Write a field of the current VMCS.
    pub fn write(&self, field: Field, v: u64) -> Result<()> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) v,
                out(reg_byte) err
            );
            if err != 0 {
                Err(Error::Vmx(instruction_error()))
            } else {
                Ok(())
            }
        }
    }
}
