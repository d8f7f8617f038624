// BSD 2-Clause License
//
// Copyright (c) 2022, 2023 The atoll developers
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! C ABI surface for compiler-instrumented targets. Expressions cross the
//! boundary as owned `*mut ExprRef` handles; the instrumentation releases
//! them with [atoll_expression_release] once the shadowed value dies. All
//! state lives in a per-process (single-threaded) [Engine] created by
//! [atoll_initialize] from the environment.

use std::cell::RefCell;
use std::fs::File;
use std::os::unix::io::AsRawFd;

use atoll_lib::config::Config;
use atoll_lib::expr::ExprRef;
use atoll_lib::fatal;
use atoll_lib::runtime::Engine;

pub type AtollExpr = *mut ExprRef;

thread_local! {
    static ENGINE: RefCell<Option<Engine>> = const { RefCell::new(None) };
}

fn with_engine<T>(f: impl FnOnce(&Engine) -> T) -> T {
    ENGINE.with(|engine| match &*engine.borrow() {
        Some(engine) => f(engine),
        None => fatal!("the runtime has not been initialized"),
    })
}

fn export(e: ExprRef) -> AtollExpr {
    Box::into_raw(Box::new(e))
}

/// # Safety
/// `e` must be a live handle returned by one of the builder entry points.
unsafe fn import(e: AtollExpr) -> &'static ExprRef {
    match e.as_ref() {
        Some(e) => e,
        None => fatal!("null expression handle"),
    }
}

/// Reads the configuration from the environment (`ATOLL_INPUT`,
/// `ATOLL_OUTPUT_DIR`, ...) and builds the engine. Must be called before
/// any other entry point. Standard input of the target is re-pointed at
/// the input file, so targets that read stdin see the same bytes the
/// engine slurped.
#[no_mangle]
pub extern "C" fn atoll_initialize() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => fatal!("initialization failed: {}", err),
    };

    if let Ok(file) = File::open(&config.input_file) {
        unsafe {
            if libc::dup2(file.as_raw_fd(), libc::STDIN_FILENO) < 0 {
                fatal!("failed to redirect standard input");
            }
        }
    }

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => fatal!("initialization failed: {}", err),
    };
    ENGINE.with(|slot| *slot.borrow_mut() = Some(engine))
}

#[no_mangle]
pub extern "C" fn atoll_get_input_byte(offset: usize) -> AtollExpr {
    with_engine(|engine| export(engine.get_input_byte(offset)))
}

#[no_mangle]
pub extern "C" fn atoll_build_integer(value: u64, bits: u8) -> AtollExpr {
    with_engine(|engine| export(engine.builder().create_constant_u64(value, bits as u32)))
}

#[no_mangle]
pub extern "C" fn atoll_build_bool(value: bool) -> AtollExpr {
    with_engine(|engine| export(engine.builder().create_bool(value)))
}

macro_rules! build_binary {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            /// Both operands must be live expression handles.
            #[no_mangle]
            pub unsafe extern "C" fn $name(a: AtollExpr, b: AtollExpr) -> AtollExpr {
                let (a, b) = (import(a), import(b));
                with_engine(|engine| export(engine.builder().$method(a, b)))
            }
        )*
    };
}

macro_rules! build_unary {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            /// The operand must be a live expression handle.
            #[no_mangle]
            pub unsafe extern "C" fn $name(e: AtollExpr) -> AtollExpr {
                let e = import(e);
                with_engine(|engine| export(engine.builder().$method(e)))
            }
        )*
    };
}

build_binary! {
    atoll_build_add => create_add,
    atoll_build_sub => create_sub,
    atoll_build_mul => create_mul,
    atoll_build_unsigned_div => create_udiv,
    atoll_build_signed_div => create_sdiv,
    atoll_build_unsigned_rem => create_urem,
    atoll_build_signed_rem => create_srem,
    atoll_build_and => create_and,
    atoll_build_or => create_or,
    atoll_build_xor => create_xor,
    atoll_build_shift_left => create_shl,
    atoll_build_logical_shift_right => create_lshr,
    atoll_build_arithmetic_shift_right => create_ashr,
    atoll_build_equal => create_equal,
    atoll_build_not_equal => create_distinct,
    atoll_build_unsigned_less_than => create_ult,
    atoll_build_unsigned_less_equal => create_ule,
    atoll_build_unsigned_greater_than => create_ugt,
    atoll_build_unsigned_greater_equal => create_uge,
    atoll_build_signed_less_than => create_slt,
    atoll_build_signed_less_equal => create_sle,
    atoll_build_signed_greater_than => create_sgt,
    atoll_build_signed_greater_equal => create_sge,
    atoll_build_bool_and => create_land,
    atoll_build_bool_or => create_lor,
    atoll_build_concat => create_concat,
}

build_unary! {
    atoll_build_neg => create_neg,
    atoll_build_not => create_not,
    atoll_build_bool_not => create_lnot,
}

/// # Safety
/// The operand must be a live expression handle.
#[no_mangle]
pub unsafe extern "C" fn atoll_build_zext(e: AtollExpr, bits: u8) -> AtollExpr {
    let e = import(e);
    with_engine(|engine| export(engine.builder().create_zext(e, bits as u32)))
}

/// # Safety
/// The operand must be a live expression handle.
#[no_mangle]
pub unsafe extern "C" fn atoll_build_sext(e: AtollExpr, bits: u8) -> AtollExpr {
    let e = import(e);
    with_engine(|engine| export(engine.builder().create_sext(e, bits as u32)))
}

/// # Safety
/// The operand must be a live expression handle.
#[no_mangle]
pub unsafe extern "C" fn atoll_build_trunc(e: AtollExpr, bits: u8) -> AtollExpr {
    let e = import(e);
    with_engine(|engine| export(engine.builder().create_trunc(e, bits as u32)))
}

/// # Safety
/// The operand must be a live expression handle.
#[no_mangle]
pub unsafe extern "C" fn atoll_build_extract(e: AtollExpr, index: u32, bits: u32) -> AtollExpr {
    let e = import(e);
    with_engine(|engine| export(engine.builder().create_extract(e, index, bits)))
}

/// # Safety
/// All three operands must be live expression handles.
#[no_mangle]
pub unsafe extern "C" fn atoll_build_ite(
    cond: AtollExpr,
    then_expr: AtollExpr,
    else_expr: AtollExpr,
) -> AtollExpr {
    let (cond, then_expr, else_expr) = (import(cond), import(then_expr), import(else_expr));
    with_engine(|engine| export(engine.builder().create_ite(cond, then_expr, else_expr)))
}

/// # Safety
/// `constraint` must be null or a live expression handle.
#[no_mangle]
pub unsafe extern "C" fn atoll_push_path_constraint(constraint: AtollExpr, taken: bool, pc: u64) {
    if constraint.is_null() {
        return;
    }
    let constraint = import(constraint);
    with_engine(|engine| engine.push_path_constraint(constraint, taken, pc))
}

#[no_mangle]
pub extern "C" fn atoll_notify_call(pc: u64) {
    with_engine(|engine| engine.notify_call(pc))
}

#[no_mangle]
pub extern "C" fn atoll_notify_ret(pc: u64) {
    with_engine(|engine| engine.notify_ret(pc))
}

#[no_mangle]
pub extern "C" fn atoll_notify_basic_block(pc: u64) {
    with_engine(|engine| engine.notify_basic_block(pc))
}

/// # Safety
/// `e` must be a live expression handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn atoll_expression_release(e: AtollExpr) {
    if !e.is_null() {
        drop(Box::from_raw(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn ffi_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input_file = dir.path().join("input");
        fs::write(&input_file, [0u8, 0]).unwrap();
        std::env::set_var("ATOLL_INPUT", &input_file);
        std::env::set_var("ATOLL_OUTPUT_DIR", dir.path().join("out"));

        atoll_initialize();
        unsafe {
            let x = atoll_get_input_byte(0);
            let c = atoll_build_integer(0x41, 8);
            let cond = atoll_build_equal(x, c);
            atoll_push_path_constraint(cond, false, 0x1000);
            atoll_expression_release(cond);
            atoll_expression_release(c);
            atoll_expression_release(x);
        }
        let testcase = fs::read(dir.path().join("out").join("000000")).unwrap();
        assert_eq!(testcase, vec![0x41, 0x00]);
    }
}
