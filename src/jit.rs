use std::ffi::{CStr, CString};
use std::mem;
use std::ptr;

use libc::{c_char, c_void};
use llvm_sys::execution_engine::{self, LLVMExecutionEngineRef, LLVMMCJITCompilerOptions};
use llvm_sys::prelude::*;
use llvm_sys::{core, support, target};

use super::context::Context;
use super::error::{Error, ErrorKind};

/// putchar that takes a double and returns 0, callable from the language
/// after `extern putchard(x)`.
extern "C" fn putchard(x: f64) -> f64 {
    unsafe {
        libc::putchar(x as libc::c_int);
    }
    0.0
}

/// Print a double with a newline, callable after `extern printd(x)`.
extern "C" fn printd(x: f64) -> f64 {
    println!("{}", x);
    0.0
}

/// The backend collaborator: one MCJIT execution engine that accepts
/// completed modules and resolves symbols to native addresses.
pub(crate) struct Jit {
    ee: LLVMExecutionEngineRef,
}

impl Jit {
    pub(crate) unsafe fn new(ctx: &Context) -> Result<Jit, Error> {
        execution_engine::LLVMLinkInMCJIT();
        if target::LLVM_InitializeNativeTarget() != 0 {
            return Err(Error::from(ErrorKind::Jit("no native target".to_owned())));
        }
        target::LLVM_InitializeNativeAsmPrinter();
        target::LLVM_InitializeNativeAsmParser();

        // language-visible runtime helpers, resolved by name
        support::LLVMAddSymbol(
            b"putchard\0".as_ptr() as *const _,
            putchard as usize as *mut c_void,
        );
        support::LLVMAddSymbol(
            b"printd\0".as_ptr() as *const _,
            printd as usize as *mut c_void,
        );

        // MCJIT wants a module at construction time; hand it a throwaway
        let bootstrap = core::LLVMModuleCreateWithNameInContext(
            b"jit bootstrap\0".as_ptr() as *const _,
            ctx.context,
        );

        let mut options: LLVMMCJITCompilerOptions = mem::zeroed();
        execution_engine::LLVMInitializeMCJITCompilerOptions(
            &mut options,
            mem::size_of::<LLVMMCJITCompilerOptions>(),
        );

        let mut ee = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        if execution_engine::LLVMCreateMCJITCompilerForModule(
            &mut ee,
            bootstrap,
            &mut options,
            mem::size_of::<LLVMMCJITCompilerOptions>(),
            &mut err,
        ) != 0
        {
            return Err(Error::from(ErrorKind::Jit(consume_message(err))));
        }

        Ok(Jit { ee })
    }

    /// Data layout string of the engine's target, applied by the compile
    /// context to every module it rotates in.
    pub(crate) unsafe fn data_layout(&self) -> CString {
        let td = execution_engine::LLVMGetExecutionEngineTargetData(self.ee);
        let rep = target::LLVMCopyStringRepOfTargetData(td);
        let layout = CStr::from_ptr(rep).to_owned();
        core::LLVMDisposeMessage(rep);
        layout
    }

    /// Hand a completed unit over; the engine owns it from here on and
    /// compiles it lazily, on first symbol request.
    pub(crate) unsafe fn add_module(&self, module: LLVMModuleRef) {
        execution_engine::LLVMAddModule(self.ee, module);
    }

    pub(crate) unsafe fn remove_module(&self, module: LLVMModuleRef) -> Result<(), Error> {
        let mut out = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        if execution_engine::LLVMRemoveModule(self.ee, module, &mut out, &mut err) != 0 {
            return Err(Error::from(ErrorKind::Jit(consume_message(err))));
        }
        core::LLVMDisposeModule(out);
        Ok(())
    }

    pub(crate) unsafe fn function_address(&self, name: &str) -> Option<u64> {
        let cn = CString::new(name).unwrap_or_default();
        match execution_engine::LLVMGetFunctionAddress(self.ee, cn.as_ptr()) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Resolve a zero-argument double-returning function and call it.
    pub(crate) unsafe fn eval_double(&self, name: &str) -> Option<f64> {
        let addr = self.function_address(name)?;
        let func: extern "C" fn() -> f64 = mem::transmute(addr as usize);
        Some(func())
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        unsafe {
            execution_engine::LLVMDisposeExecutionEngine(self.ee);
        }
    }
}

unsafe fn consume_message(msg: *mut c_char) -> String {
    let owned = CStr::from_ptr(msg).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(msg);
    owned
}

#[cfg(test)]
mod test {
    use super::super::codegen;
    use super::super::parser::{self, ANON_FN_NAME};
    use super::*;
    use combine::Parser;

    fn lex_tokens(s: &str) -> Vec<super::super::token::Token> {
        let mut buf = s;
        let mut tokens = Vec::new();
        while let Ok((Some(token), rest)) = super::super::lexer::lex().parse(buf) {
            buf = rest;
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn test_eval_end_to_end() {
        unsafe {
            let mut ctx = Context::new();
            let jit = Jit::new(&ctx).unwrap();
            ctx.set_data_layout(jit.data_layout());

            let tokens = lex_tokens("def foo(a b) a*a + b*b");
            let (def, _) = parser::definition(ctx.ops.clone())
                .parse(tokens.as_slice())
                .unwrap();
            codegen::codegen_func(&mut ctx, &def).unwrap();
            jit.add_module(ctx.rotate_module());

            let tokens = lex_tokens("foo(3, 4)");
            let (anon, _) = parser::toplevel(ctx.ops.clone())
                .parse(tokens.as_slice())
                .unwrap();
            codegen::codegen_func(&mut ctx, &anon).unwrap();
            let module = ctx.rotate_module();
            jit.add_module(module);

            assert_eq!(jit.eval_double(ANON_FN_NAME), Some(25.0));
            jit.remove_module(module).unwrap();
        }
    }
}
