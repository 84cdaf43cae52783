use std::ffi::CString;

use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyFunction};
use llvm_sys::core;
use llvm_sys::prelude::*;
use llvm_sys::{LLVMLinkage, LLVMRealPredicate};

use super::ast::{Expr, Function, Prototype};
use super::context::Context;
use super::error::{Error, ErrorKind};

fn cname(s: &str) -> CString {
    // identifiers come out of the lexer alphanumeric, so interior NULs
    // cannot happen
    CString::new(s).unwrap_or_default()
}

/// Look a callable up in the active module, falling back to materializing a
/// declaration from the signature registry. Signatures survive module
/// rotation, so a function defined several units ago stays callable.
pub(crate) unsafe fn get_function(ctx: &mut Context, name: &str) -> Option<LLVMValueRef> {
    let cn = cname(name);
    let func = core::LLVMGetNamedFunction(ctx.module, cn.as_ptr());
    if !func.is_null() {
        return Some(func);
    }

    let proto = ctx.signature(name).cloned()?;
    codegen_proto(ctx, &proto).ok()
}

pub(crate) unsafe fn codegen_expr(ctx: &mut Context, e: &Expr) -> Result<LLVMValueRef, Error> {
    match e {
        Expr::Number(n) => Ok(core::LLVMConstReal(ctx.double_type, *n)),
        Expr::Variable(name) => ctx
            .lookup_variable(name)
            .ok_or_else(|| Error::from(ErrorKind::UnknownVariable(name.clone()))),
        Expr::Unary(op, operand) => {
            let operand_val = codegen_expr(ctx, operand)?;
            let func = get_function(ctx, &format!("unary{}", op))
                .ok_or_else(|| Error::from(ErrorKind::UnknownUnaryOperator(*op)))?;
            let mut args = [operand_val];
            Ok(core::LLVMBuildCall(
                ctx.builder,
                func,
                args.as_mut_ptr(),
                1,
                b"unop\0".as_ptr() as *const _,
            ))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs_val = codegen_expr(ctx, lhs)?;
            let rhs_val = codegen_expr(ctx, rhs)?;
            match *op {
                '+' => Ok(core::LLVMBuildFAdd(
                    ctx.builder,
                    lhs_val,
                    rhs_val,
                    b"add_tmp\0".as_ptr() as *const _,
                )),
                '-' => Ok(core::LLVMBuildFSub(
                    ctx.builder,
                    lhs_val,
                    rhs_val,
                    b"sub_tmp\0".as_ptr() as *const _,
                )),
                '*' => Ok(core::LLVMBuildFMul(
                    ctx.builder,
                    lhs_val,
                    rhs_val,
                    b"mul_tmp\0".as_ptr() as *const _,
                )),
                '<' => {
                    let cmp = core::LLVMBuildFCmp(
                        ctx.builder,
                        LLVMRealPredicate::LLVMRealULT,
                        lhs_val,
                        rhs_val,
                        b"cmp_tmp\0".as_ptr() as *const _,
                    );
                    // convert bool 0/1 to double 0.0 or 1.0
                    Ok(core::LLVMBuildUIToFP(
                        ctx.builder,
                        cmp,
                        ctx.double_type,
                        b"bool_tmp\0".as_ptr() as *const _,
                    ))
                }
                op => {
                    // User-declared operators lower to a call of the
                    // "binary<op>" function. The four builtin characters
                    // never reach this arm, even when redeclared with a
                    // different precedence.
                    let func = get_function(ctx, &format!("binary{}", op))
                        .ok_or_else(|| Error::from(ErrorKind::UnknownBinaryOperator(op)))?;
                    let mut args = [lhs_val, rhs_val];
                    Ok(core::LLVMBuildCall(
                        ctx.builder,
                        func,
                        args.as_mut_ptr(),
                        2,
                        b"binop\0".as_ptr() as *const _,
                    ))
                }
            }
        }
        Expr::Call(callee, args) => {
            let func = get_function(ctx, callee)
                .ok_or_else(|| Error::from(ErrorKind::UnknownFunction(callee.clone())))?;
            if core::LLVMCountParams(func) as usize != args.len() {
                return Err(Error::from(ErrorKind::ArityMismatch(callee.clone())));
            }

            let mut arg_vals = Vec::with_capacity(args.len());
            for arg in args {
                arg_vals.push(codegen_expr(ctx, arg)?);
            }

            Ok(core::LLVMBuildCall(
                ctx.builder,
                func,
                arg_vals.as_mut_ptr(),
                arg_vals.len() as u32,
                b"call_tmp\0".as_ptr() as *const _,
            ))
        }
        Expr::If(cond, then_expr, else_expr) => {
            let cond_val = codegen_expr(ctx, cond)?;
            let zero = core::LLVMConstReal(ctx.double_type, 0.0);
            let cond_val = core::LLVMBuildFCmp(
                ctx.builder,
                LLVMRealPredicate::LLVMRealONE,
                cond_val,
                zero,
                b"if_cond\0".as_ptr() as *const _,
            );

            let func = core::LLVMGetBasicBlockParent(core::LLVMGetInsertBlock(ctx.builder));
            let then_bb =
                core::LLVMAppendBasicBlockInContext(ctx.context, func, b"then\0".as_ptr() as *const _);
            let else_bb =
                core::LLVMAppendBasicBlockInContext(ctx.context, func, b"else\0".as_ptr() as *const _);
            let merge_bb = core::LLVMAppendBasicBlockInContext(
                ctx.context,
                func,
                b"if_cont\0".as_ptr() as *const _,
            );
            core::LLVMBuildCondBr(ctx.builder, cond_val, then_bb, else_bb);

            core::LLVMPositionBuilderAtEnd(ctx.builder, then_bb);
            let then_val = codegen_expr(ctx, then_expr)?;
            core::LLVMBuildBr(ctx.builder, merge_bb);
            // lowering the branch may have moved the builder into a nested
            // block; that block is the real predecessor of the merge
            let then_exit = core::LLVMGetInsertBlock(ctx.builder);

            core::LLVMPositionBuilderAtEnd(ctx.builder, else_bb);
            let else_val = codegen_expr(ctx, else_expr)?;
            core::LLVMBuildBr(ctx.builder, merge_bb);
            let else_exit = core::LLVMGetInsertBlock(ctx.builder);

            core::LLVMPositionBuilderAtEnd(ctx.builder, merge_bb);
            let phi =
                core::LLVMBuildPhi(ctx.builder, ctx.double_type, b"if_tmp\0".as_ptr() as *const _);
            let mut incoming_vals = [then_val, else_val];
            let mut incoming_blocks = [then_exit, else_exit];
            core::LLVMAddIncoming(phi, incoming_vals.as_mut_ptr(), incoming_blocks.as_mut_ptr(), 2);
            Ok(phi)
        }
        Expr::For(var, start, end, step, body) => {
            let start_val = codegen_expr(ctx, start)?;

            let preheader_bb = core::LLVMGetInsertBlock(ctx.builder);
            let func = core::LLVMGetBasicBlockParent(preheader_bb);
            let loop_bb =
                core::LLVMAppendBasicBlockInContext(ctx.context, func, b"loop\0".as_ptr() as *const _);
            core::LLVMBuildBr(ctx.builder, loop_bb);

            core::LLVMPositionBuilderAtEnd(ctx.builder, loop_bb);
            let var_name = cname(var);
            let phi = core::LLVMBuildPhi(ctx.builder, ctx.double_type, var_name.as_ptr());
            let mut start_vals = [start_val];
            let mut start_blocks = [preheader_bb];
            core::LLVMAddIncoming(phi, start_vals.as_mut_ptr(), start_blocks.as_mut_ptr(), 1);

            // the loop variable shadows any outer binding of the same name
            let shadowed = ctx.bind_variable(var.clone(), phi);

            // the body's value is discarded; only its effects on control
            // flow matter
            codegen_expr(ctx, body)?;

            let step_val = match (**step).as_ref() {
                Some(step) => codegen_expr(ctx, step)?,
                None => core::LLVMConstReal(ctx.double_type, 1.0),
            };
            let next_var = core::LLVMBuildFAdd(
                ctx.builder,
                phi,
                step_val,
                b"next_var\0".as_ptr() as *const _,
            );

            let end_val = codegen_expr(ctx, end)?;
            let zero = core::LLVMConstReal(ctx.double_type, 0.0);
            let end_cond = core::LLVMBuildFCmp(
                ctx.builder,
                LLVMRealPredicate::LLVMRealONE,
                end_val,
                zero,
                b"loop_cond\0".as_ptr() as *const _,
            );

            let loop_end_bb = core::LLVMGetInsertBlock(ctx.builder);
            let after_bb = core::LLVMAppendBasicBlockInContext(
                ctx.context,
                func,
                b"after_loop\0".as_ptr() as *const _,
            );
            core::LLVMBuildCondBr(ctx.builder, end_cond, loop_bb, after_bb);
            core::LLVMPositionBuilderAtEnd(ctx.builder, after_bb);

            let mut next_vals = [next_var];
            let mut next_blocks = [loop_end_bb];
            core::LLVMAddIncoming(phi, next_vals.as_mut_ptr(), next_blocks.as_mut_ptr(), 1);

            ctx.restore_variable(var, shadowed);

            // the for expression itself always evaluates to 0.0
            Ok(core::LLVMConstNull(ctx.double_type))
        }
    }
}

pub(crate) unsafe fn codegen_proto(
    ctx: &mut Context,
    proto: &Prototype,
) -> Result<LLVMValueRef, Error> {
    let mut doubles = vec![ctx.double_type; proto.args.len()];
    let func_type = core::LLVMFunctionType(
        ctx.double_type,
        doubles.as_mut_ptr(),
        doubles.len() as u32,
        0,
    );

    let name = cname(&proto.name);
    let func = core::LLVMAddFunction(ctx.module, name.as_ptr(), func_type);
    core::LLVMSetLinkage(func, LLVMLinkage::LLVMExternalLinkage);

    for (i, arg) in proto.args.iter().enumerate() {
        let param = core::LLVMGetParam(func, i as u32);
        core::LLVMSetValueName2(param, arg.as_ptr() as *const _, arg.len());
    }

    Ok(func)
}

unsafe fn discard(ctx: &mut Context, func: LLVMValueRef, declared_op: Option<char>) {
    // a failed definition must leave no trace: drop the half-built function
    // and take the operator declaration back out of the table
    core::LLVMDeleteFunction(func);
    if let Some(op) = declared_op {
        ctx.ops.remove(op);
    }
}

pub(crate) unsafe fn codegen_func(ctx: &mut Context, f: &Function) -> Result<LLVMValueRef, Error> {
    let proto = f.0.as_ref();
    ctx.register_signature(proto.clone());
    let func = get_function(ctx, &proto.name)
        .ok_or_else(|| Error::from(ErrorKind::UnknownFunction(proto.name.clone())))?;

    // get_function can hand back a declaration emitted earlier into this
    // module (an extern, say) whose parameter list is shorter than the one
    // being defined; the by-index parameter binding below must not run
    // against it.
    if core::LLVMCountParams(func) as usize != proto.args.len() {
        return Err(Error::from(ErrorKind::Redefinition(proto.name.clone())));
    }

    // Install a user-declared binary operator before the body lowers, so
    // the operator is usable from code compiled after this point.
    let declared_op = if proto.is_binary_op() {
        proto.operator_char()
    } else {
        None
    };
    if let Some(op) = declared_op {
        ctx.ops.declare(op, proto.precedence);
    }

    let entry =
        core::LLVMAppendBasicBlockInContext(ctx.context, func, b"entry\0".as_ptr() as *const _);
    core::LLVMPositionBuilderAtEnd(ctx.builder, entry);

    ctx.reset_environment();
    for (i, arg) in proto.args.iter().enumerate() {
        ctx.bind_variable(arg.clone(), core::LLVMGetParam(func, i as u32));
    }

    let ret = match codegen_expr(ctx, &f.1) {
        Ok(ret) => ret,
        Err(e) => {
            discard(ctx, func, declared_op);
            return Err(e);
        }
    };

    core::LLVMBuildRet(ctx.builder, ret);

    if LLVMVerifyFunction(func, LLVMVerifierFailureAction::LLVMPrintMessageAction) != 0 {
        discard(ctx, func, declared_op);
        return Err(Error::from(ErrorKind::Verify(proto.name.clone())));
    }

    core::LLVMRunFunctionPassManager(ctx.fpm, func);

    Ok(func)
}

#[cfg(test)]
mod test {
    use super::super::parser;
    use super::*;
    use combine::Parser;
    use llvm_sys::LLVMOpcode;

    fn lex_tokens(s: &str) -> Vec<super::super::token::Token> {
        let mut buf = s;
        let mut tokens = Vec::new();
        while let Ok((Some(token), rest)) = super::super::lexer::lex().parse(buf) {
            buf = rest;
            tokens.push(token);
        }
        tokens
    }

    unsafe fn lower_def(ctx: &mut Context, src: &str) -> Result<LLVMValueRef, Error> {
        let tokens = lex_tokens(src);
        let (func, rest) = parser::definition(ctx.ops.clone())
            .parse(tokens.as_slice())
            .unwrap();
        assert!(rest.is_empty(), "definition left tokens: {:?}", rest);
        codegen_func(ctx, &func)
    }

    unsafe fn lower_toplevel(ctx: &mut Context, src: &str) -> Result<LLVMValueRef, Error> {
        let tokens = lex_tokens(src);
        let (func, _) = parser::toplevel(ctx.ops.clone())
            .parse(tokens.as_slice())
            .unwrap();
        codegen_func(ctx, &func)
    }

    #[test]
    fn test_function_definition_and_call() {
        unsafe {
            let mut ctx = Context::new();
            assert!(lower_def(&mut ctx, "def foo(a b) a*a + b*b").is_ok());
            assert!(lower_toplevel(&mut ctx, "foo(3, 4)").is_ok());
        }
    }

    #[test]
    fn test_call_resolves_across_rotation() {
        unsafe {
            let mut ctx = Context::new();
            assert!(lower_def(&mut ctx, "def foo(a b) a + b").is_ok());

            let old = ctx.rotate_module();
            // foo is gone from the active module but survives in the
            // signature registry
            assert!(lower_toplevel(&mut ctx, "foo(1, 2)").is_ok());
            core::LLVMDisposeModule(old);
        }
    }

    #[test]
    fn test_unknown_variable_erases_function() {
        unsafe {
            let mut ctx = Context::new();
            let err = lower_def(&mut ctx, "def f(a) b").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::UnknownVariable("b".to_owned()));

            let name = CString::new("f").unwrap();
            assert!(core::LLVMGetNamedFunction(ctx.module, name.as_ptr()).is_null());
        }
    }

    #[test]
    fn test_failed_operator_definition_rolls_back() {
        unsafe {
            let mut ctx = Context::new();
            let err = lower_def(&mut ctx, "def binary% 10 (a b) a*undefined_var").unwrap_err();
            assert_eq!(
                err.kind(),
                &ErrorKind::UnknownVariable("undefined_var".to_owned())
            );
            assert_eq!(ctx.ops.get('%'), None);
        }
    }

    #[test]
    fn test_successful_operator_definition_stays_declared() {
        unsafe {
            let mut ctx = Context::new();
            assert!(lower_def(&mut ctx, "def binary| 5 (a b) a + b").is_ok());
            assert_eq!(ctx.ops.get('|'), Some(5));
            assert!(lower_def(&mut ctx, "def g(x y) x | y").is_ok());
        }
    }

    #[test]
    fn test_builtin_lowering_wins_over_user_redefinition() {
        unsafe {
            let mut ctx = Context::new();
            assert!(lower_def(&mut ctx, "def binary+ 5 (a b) 42").is_ok());
            assert_eq!(ctx.ops.get('+'), Some(5));

            // '+' still lowers through the builtin fadd path, not a call
            let func = lower_def(&mut ctx, "def g(x y) x + y").unwrap();
            let entry = core::LLVMGetFirstBasicBlock(func);
            let first = core::LLVMGetFirstInstruction(entry);
            assert_eq!(core::LLVMGetInstructionOpcode(first), LLVMOpcode::LLVMFAdd);
        }
    }

    #[test]
    fn test_unary_operator() {
        unsafe {
            let mut ctx = Context::new();
            assert!(lower_def(&mut ctx, "def unary!(v) if v then 0 else 1").is_ok());
            assert!(lower_def(&mut ctx, "def g(x) !x").is_ok());

            let err = lower_def(&mut ctx, "def h(x) $x").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::UnknownUnaryOperator('$'));
        }
    }

    #[test]
    fn test_unknown_function_and_arity() {
        unsafe {
            let mut ctx = Context::new();
            let err = lower_toplevel(&mut ctx, "nope(1)").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::UnknownFunction("nope".to_owned()));

            assert!(lower_def(&mut ctx, "def one(a) a").is_ok());
            let err = lower_toplevel(&mut ctx, "one(1, 2)").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::ArityMismatch("one".to_owned()));
        }
    }

    #[test]
    fn test_redefinition_with_different_arity_is_an_error() {
        unsafe {
            let mut ctx = Context::new();
            // an extern leaves a 1-parameter declaration in the active module
            let proto = Prototype::new("foo".to_owned(), vec!["a".to_owned()]);
            codegen_proto(&mut ctx, &proto).unwrap();
            ctx.register_signature(proto);

            let err = lower_def(&mut ctx, "def foo(a b) a + b").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::Redefinition("foo".to_owned()));

            // the original declaration is untouched and still callable
            let name = CString::new("foo").unwrap();
            let func = core::LLVMGetNamedFunction(ctx.module, name.as_ptr());
            assert_eq!(core::LLVMCountParams(func), 1);
            assert!(lower_toplevel(&mut ctx, "foo(0)").is_ok());
        }
    }

    #[test]
    fn test_extern_declaration_is_callable() {
        unsafe {
            let mut ctx = Context::new();
            let proto = Prototype::new("sin".to_owned(), vec!["x".to_owned()]);
            assert!(codegen_proto(&mut ctx, &proto).is_ok());
            ctx.register_signature(proto);
            assert!(lower_toplevel(&mut ctx, "sin(0)").is_ok());
        }
    }

    #[test]
    fn test_if_and_for_lower_cleanly() {
        unsafe {
            let mut ctx = Context::new();
            assert!(lower_def(&mut ctx, "def f(x) if x < 3 then 1 else 2").is_ok());
            assert!(lower_def(&mut ctx, "def g(n) for i = 1, i < n in i").is_ok());
            assert!(lower_def(&mut ctx, "def h(n) for i = 1, i < n, 2 in i").is_ok());
        }
    }
}
