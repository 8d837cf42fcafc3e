//! Event and interrupt injection.

use crate::vmx::controls::{EventType, InterruptionInfo, Interruptibility};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// The 256-bit pending-interrupt bitmap of one vCPU.
///
/// Device-model threads enqueue; the vCPU thread picks before each entry.
pub struct PendingInterrupts {
    bits: [AtomicU64; 4],
    count: AtomicU32,
}

impl PendingInterrupts {
    /// Create an empty set.
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            bits: [ZERO; 4],
            count: AtomicU32::new(0),
        }
    }

    /// Enqueue `vector`.
    pub fn enqueue(&self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        if self.bits[word].fetch_or(1 << bit, Ordering::SeqCst) & (1 << bit) == 0 {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Whether any vector is pending.
    pub fn any_pending(&self) -> bool {
        self.count.load(Ordering::SeqCst) != 0
    }

    /// Pop the highest pending vector (hardware-like priority).
    pub fn pick(&self) -> Option<u8> {
        for word in (0..4).rev() {
            let v = self.bits[word].load(Ordering::SeqCst);
            if v == 0 {
                continue;
            }
            let bit = 63 - v.leading_zeros() as usize;
            if self.bits[word].fetch_and(!(1 << bit), Ordering::SeqCst) & (1 << bit) != 0 {
                self.count.fetch_sub(1, Ordering::SeqCst);
                return Some((word * 64 + bit) as u8);
            }
        }
        None
    }
}

impl Default for PendingInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an external interrupt may be injected right now.
pub fn can_inject_interrupt(rflags: u64, interruptibility: Interruptibility) -> bool {
    rflags & (1 << 9) != 0 // RFLAGS.IF
        && !interruptibility
            .intersects(Interruptibility::STI_BLOCKING | Interruptibility::MOV_SS_BLOCKING)
}

/// An event staged for the next VM entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PendingEntryEvent {
    pub intr_info: Option<InterruptionInfo>,
    pub error_code: Option<u32>,
    pub instruction_length: Option<u32>,
}

impl PendingEntryEvent {
    /// Whether an event is staged.
    pub fn is_injected(&self) -> bool {
        self.intr_info.map_or(false, |i| i.is_valid())
    }

    /// Stage an external interrupt.
    pub fn inject_interrupt(&mut self, vector: u8) {
        self.intr_info = Some(InterruptionInfo::new(
            EventType::ExternalInterrupt,
            vector,
            false,
        ));
        self.error_code = None;
        self.instruction_length = None;
    }

    /// Stage an exception, with an error code where the vector pushes one.
    pub fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) {
        self.intr_info = Some(InterruptionInfo::new(
            EventType::HardwareException,
            vector,
            error_code.is_some(),
        ));
        self.error_code = error_code;
        self.instruction_length = None;
    }

    /// Stage an NMI.
    pub fn inject_nmi(&mut self) {
        self.intr_info = Some(InterruptionInfo::new(EventType::Nmi, 2, false));
        self.error_code = None;
        self.instruction_length = None;
    }

    /// Re-stage an event whose IDT delivery the last exit interrupted: the
    /// IDT-vectoring information is copied to the next entry verbatim,
    /// together with its error code and (for software events) the
    /// instruction length.
    pub fn recover_idt_vectoring(
        &mut self,
        idt_info: InterruptionInfo,
        error_code: u32,
        instruction_length: u32,
    ) -> bool {
        if !idt_info.is_valid() {
            return false;
        }
        self.intr_info = Some(idt_info);
        self.error_code = idt_info.has_error_code().then_some(error_code);
        self.instruction_length = matches!(
            idt_info.event_type(),
            EventType::SoftwareInterrupt
                | EventType::SoftwareException
                | EventType::PrivSoftwareException
        )
        .then_some(instruction_length);
        true
    }

    /// Clear after the entry consumed the event.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_returns_highest_vector_first() {
        let pending = PendingInterrupts::new();
        pending.enqueue(32);
        pending.enqueue(200);
        pending.enqueue(33);
        assert!(pending.any_pending());
        assert_eq!(pending.pick(), Some(200));
        assert_eq!(pending.pick(), Some(33));
        assert_eq!(pending.pick(), Some(32));
        assert_eq!(pending.pick(), None);
        assert!(!pending.any_pending());
    }

    #[test]
    fn duplicate_enqueue_is_one_event() {
        let pending = PendingInterrupts::new();
        pending.enqueue(48);
        pending.enqueue(48);
        assert_eq!(pending.pick(), Some(48));
        assert_eq!(pending.pick(), None);
    }

    #[test]
    fn injection_gating() {
        assert!(can_inject_interrupt(1 << 9, Interruptibility::empty()));
        assert!(!can_inject_interrupt(0, Interruptibility::empty()));
        assert!(!can_inject_interrupt(
            1 << 9,
            Interruptibility::STI_BLOCKING
        ));
        assert!(!can_inject_interrupt(
            1 << 9,
            Interruptibility::MOV_SS_BLOCKING
        ));
        // NMI blocking alone does not gate external interrupts.
        assert!(can_inject_interrupt(1 << 9, Interruptibility::NMI_BLOCKING));
    }

    #[test]
    fn exception_injection_carries_error_code() {
        let mut ev = PendingEntryEvent::default();
        ev.inject_exception(14, Some(0x2));
        assert!(ev.is_injected());
        let info = ev.intr_info.unwrap();
        assert_eq!(info.vector(), 14);
        assert!(info.has_error_code());
        assert_eq!(ev.error_code, Some(2));

        ev.clear();
        ev.inject_exception(6, None);
        assert!(!ev.intr_info.unwrap().has_error_code());
        assert_eq!(ev.error_code, None);
    }

    #[test]
    fn idt_vectoring_recovery() {
        let mut ev = PendingEntryEvent::default();
        // A hardware interrupt (vector 0x20) was being delivered.
        let idt = InterruptionInfo::from_raw(0x20 | (1 << 31));
        assert!(ev.recover_idt_vectoring(idt, 0, 3));
        assert_eq!(ev.intr_info.unwrap().raw(), idt.raw());
        assert_eq!(ev.error_code, None);
        assert_eq!(ev.instruction_length, None);

        // An invalid field recovers nothing.
        let mut ev = PendingEntryEvent::default();
        assert!(!ev.recover_idt_vectoring(InterruptionInfo::NONE, 0, 0));
        assert!(!ev.is_injected());
    }
}
