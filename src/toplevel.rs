use super::ast::{Function, Prototype};
use super::codegen;
use super::context::Context;
use super::jit::Jit;
use super::lexer;
use super::parser::{self, ANON_FN_NAME};
use super::token::Token;
use combine::Parser;
use llvm_sys::core;
use std::io::{stdin, stdout, Write};

pub(crate) unsafe fn main_loop(ctx: &mut Context, jit: &Jit) {
    'outer: loop {
        print!("ready> ");
        stdout().flush().unwrap();
        let mut line = String::new();
        match stdin().read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut buf = line.as_str();
        let mut tokens = Vec::new();
        loop {
            match lexer::lex().parse(buf) {
                Ok((Some(token), rest)) => {
                    buf = rest;
                    tokens.push(token);
                }
                Ok(_) => break,
                Err(e) => {
                    println!("error: {}", e);
                    continue 'outer;
                }
            }
        }

        handle_tokens(ctx, jit, &tokens);
    }
}

/// top ::= definition | external | expression | ';'
///
/// The outermost recovery boundary: a failed parse skips exactly one token
/// and resumes; a failed lowering just reports and moves on. Nothing here
/// is fatal before the tokens run out.
pub(crate) unsafe fn handle_tokens(ctx: &mut Context, jit: &Jit, tokens: &[Token]) {
    let mut ts = tokens;

    while !ts.is_empty() {
        match ts[0] {
            Token::Kwd(';') => ts = &ts[1..],
            Token::Def => match parser::definition(ctx.ops.clone()).parse(ts) {
                Ok((func, rest)) => {
                    handle_definition(ctx, jit, &func);
                    ts = rest;
                }
                Err(e) => {
                    println!("error: {:?}", e);
                    ts = &ts[1..];
                }
            },
            Token::Extern => match parser::extern_parser().parse(ts) {
                Ok((proto, rest)) => {
                    handle_extern(ctx, proto);
                    ts = rest;
                }
                Err(e) => {
                    println!("error: {:?}", e);
                    ts = &ts[1..];
                }
            },
            _ => match parser::toplevel(ctx.ops.clone()).parse(ts) {
                Ok((func, rest)) => {
                    handle_top_level_expression(ctx, jit, &func);
                    ts = rest;
                }
                Err(e) => {
                    println!("error: {:?}", e);
                    ts = &ts[1..];
                }
            },
        }
    }
}

unsafe fn handle_definition(ctx: &mut Context, jit: &Jit, func: &Function) {
    match codegen::codegen_func(ctx, func) {
        Ok(ir) => {
            println!("Read function definition:");
            core::LLVMDumpValue(ir);
            jit.add_module(ctx.rotate_module());
        }
        Err(e) => println!("error: {}", e),
    }
}

unsafe fn handle_extern(ctx: &mut Context, proto: Prototype) {
    match codegen::codegen_proto(ctx, &proto) {
        Ok(ir) => {
            println!("Read extern:");
            core::LLVMDumpValue(ir);
            ctx.register_signature(proto);
        }
        Err(e) => println!("error: {}", e),
    }
}

unsafe fn handle_top_level_expression(ctx: &mut Context, jit: &Jit, func: &Function) {
    match codegen::codegen_func(ctx, func) {
        Ok(ir) => {
            println!("Read top-level expression:");
            core::LLVMDumpValue(ir);

            let module = ctx.rotate_module();
            jit.add_module(module);
            match jit.eval_double(ANON_FN_NAME) {
                Some(value) => println!("Evaluated to {}", value),
                None => println!("error: {} did not resolve", ANON_FN_NAME),
            }
            // evaluated once and never referenced again; its unit can go
            if let Err(e) = jit.remove_module(module) {
                println!("error: {}", e);
            }
        }
        Err(e) => println!("error: {}", e),
    }
}
