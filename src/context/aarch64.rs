//! aarch64 AAPCS64 context switch.
//!
//! Mirrors the x86_64 implementation: `x19`-`x28`, the frame pointer `x29`
//! and link register `x30`, the stack pointer, and `fpcr` (the aarch64
//! analogue of MXCSR; `fpsr` is not preserved across calls by the platform
//! ABI and is therefore not part of the saved state either).

use std::arch::global_asm;
use std::os::raw::c_void;

use super::EntryFn;

#[repr(C)]
pub(crate) struct Context {
    sp: u64,
    fpcr: u64,
}

extern "C" {
    fn fevrt_ctx_switch(from: *mut Context, to: *const Context);
    fn fevrt_ctx_switch_and_call(
        arg: *mut c_void,
        post_fn: EntryFn,
        from: *mut Context,
        to: *const Context,
    );
    fn fevrt_trampoline();
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

const FPCR_INIT: u64 = 0;

pub(crate) unsafe fn init(stack_top: *mut u8, entry: EntryFn, arg: *mut c_void) -> Context {
    // 96 bytes for x19-x28, x29, x30, 16-byte aligned.
    let base = ((stack_top as usize) & !0xf) - 96;
    let sp = base as *mut u64;

    *sp.add(0) = arg as usize as u64; // x19
    *sp.add(1) = entry as usize as u64; // x20
    for i in 2..10 {
        *sp.add(i) = 0; // x21..x28
    }
    *sp.add(10) = 0; // x29 (fp)
    *sp.add(11) = fevrt_trampoline as usize as u64; // x30 (lr)

    Context {
        sp: base as u64,
        fpcr: FPCR_INIT,
    }
}

global_asm!(
    r#"
.text

// fn fevrt_ctx_switch(from: *mut Context, to: *const Context)
// x0 = from, x1 = to
.global fevrt_ctx_switch
.p2align 4
fevrt_ctx_switch:
    sub sp, sp, #96
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    mrs x9, fpcr
    str x9, [x0, #8]
    mov x9, sp
    str x9, [x0]

    ldr x9, [x1]
    mov sp, x9
    ldr x9, [x1, #8]
    msr fpcr, x9
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    add sp, sp, #96
    ret

// fn fevrt_ctx_switch_and_call(arg: *mut c_void, post_fn: EntryFn, from: *mut Context, to: *const Context)
// x0 = arg, x1 = post_fn, x2 = from, x3 = to
.global fevrt_ctx_switch_and_call
.p2align 4
fevrt_ctx_switch_and_call:
    sub sp, sp, #96
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    mrs x9, fpcr
    str x9, [x2, #8]
    mov x9, sp
    str x9, [x2]

    ldr x9, [x3]
    mov sp, x9
    ldr x9, [x3, #8]
    msr fpcr, x9
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    add sp, sp, #96

    // x0/x1 (arg/post_fn) were never touched, so this runs post_fn(arg) on
    // the destination stack before the final `ret` resumes it normally.
    blr x1
    ret

.global fevrt_trampoline
.p2align 4
fevrt_trampoline:
    mov x0, x19
    blr x20
    brk #1
"#
);
