//! x86_64 System V ABI context switch.
//!
//! Only the callee-saved register file needs saving: `rbx`, `rbp`,
//! `r12`-`r15`, `rsp`, plus the MXCSR control/status word and the x87
//! control word (the only pieces of FPU/SSE state that are supposed to
//! survive across an arbitrary function call boundary).

use std::arch::global_asm;
use std::os::raw::c_void;

use super::EntryFn;

#[repr(C)]
pub(crate) struct Context {
    rsp: u64,
    mxcsr: u32,
    fcw: u16,
    _pad: u16,
}

extern "C" {
    fn fevrt_ctx_switch(from: *mut Context, to: *const Context);
    fn fevrt_ctx_switch_and_call(
        arg: *mut c_void,
        post_fn: EntryFn,
        from: *mut Context,
        to: *const Context,
    );
}

pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
    fevrt_ctx_switch(from, to)
}

pub(crate) unsafe fn switch_and_call(
    arg: *mut c_void,
    post_fn: EntryFn,
    from: *mut Context,
    to: *const Context,
) {
    fevrt_ctx_switch_and_call(arg, post_fn, from, to)
}

/// Default MXCSR: all exceptions masked, round-to-nearest, flush-to-zero off.
const MXCSR_INIT: u32 = 0x1F80;
/// Default x87 control word: all exceptions masked, 64-bit precision.
const FCW_INIT: u16 = 0x037F;

pub(crate) unsafe fn init(stack_top: *mut u8, entry: EntryFn, arg: *mut c_void) -> Context {
    // Reserve six 8-byte slots for the registers the switch epilogue pops
    // (r15, r14, r13, r12, rbx, rbp, in that order) plus one for the
    // trampoline's return address, all below a 16-byte-aligned stack_top as
    // required by the SysV ABI once `entry` is actually called.
    let mut sp = (stack_top as usize & !0xf) as *mut u64;
    sp = sp.sub(7);

    // Popped last, becomes the return address `ret` jumps to.
    *sp.add(6) = fevrt_trampoline as usize as u64;
    *sp.add(5) = 0; // rbp
    *sp.add(4) = 0; // rbx
    *sp.add(3) = arg as usize as u64; // r12: carries the argument
    *sp.add(2) = entry as usize as u64; // r13: carries the entry point
    *sp.add(1) = 0; // r14
    *sp.add(0) = 0; // r15

    Context {
        rsp: sp as u64,
        mxcsr: MXCSR_INIT,
        fcw: FCW_INIT,
    }
}

extern "C" {
    fn fevrt_trampoline();
}

global_asm!(
    r#"
.text

// fn fevrt_ctx_switch(from: *mut Context, to: *const Context)
// rdi = from, rsi = to
.global fevrt_ctx_switch
.p2align 4
fevrt_ctx_switch:
    stmxcsr [rdi + 8]
    fnstcw  [rdi + 12]

    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp

    mov rsp, [rsi]
    ldmxcsr [rsi + 8]
    fldcw   [rsi + 12]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

// fn fevrt_ctx_switch_and_call(arg: *mut c_void, post_fn: EntryFn, from: *mut Context, to: *const Context)
// rdi = arg, rsi = post_fn, rdx = from, rcx = to
.global fevrt_ctx_switch_and_call
.p2align 4
fevrt_ctx_switch_and_call:
    stmxcsr [rdx + 8]
    fnstcw  [rdx + 12]

    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdx], rsp

    mov rsp, [rcx]
    ldmxcsr [rcx + 8]
    fldcw   [rcx + 12]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp

    // We are now executing on the destination stack with its callee-saved
    // registers restored, but we haven't yet returned to whatever was
    // waiting there. `rdi`/`rsi` (arg/post_fn) were never touched above, so
    // calling through them here runs post_fn(arg) on the destination stack,
    // after which the final `ret` resumes the destination normally.
    call rsi
    ret

// Entry trampoline for a freshly created fiber. r12 holds the argument, r13
// holds the real entry point, both placed there by `init` above.
.global fevrt_trampoline
.p2align 4
fevrt_trampoline:
    mov rdi, r12
    call r13
    ud2
"#
);
