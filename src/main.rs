mod ast;
mod codegen;
mod context;
mod error;
mod jit;
mod lexer;
mod parser;
mod token;
mod toplevel;

fn main() {
    unsafe {
        let mut ctx = context::Context::new();
        let the_jit = match jit::Jit::new(&ctx) {
            Ok(jit) => jit,
            Err(e) => {
                eprintln!("error: {}", e);
                return;
            }
        };
        ctx.set_data_layout(the_jit.data_layout());

        toplevel::main_loop(&mut ctx, &the_jit);
    }
}
