use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::rc::Rc;

use llvm_sys::core;
use llvm_sys::prelude::*;
use llvm_sys::transforms::{instcombine, scalar};

use super::ast::Prototype;

const MODULE_NAME: &[u8] = b"my cool jit\0";

/// Binary operator precedences, shared between the parser (which consults
/// the table while climbing) and function lowering (which installs
/// user-declared operators and rolls them back on failure). A stored
/// precedence <= 0 counts as "not an operator".
#[derive(Clone)]
pub(crate) struct OpPrecedence(Rc<RefCell<HashMap<char, i32>>>);

impl OpPrecedence {
    pub(crate) fn new() -> OpPrecedence {
        let mut table = HashMap::new();
        table.insert('<', 10);
        table.insert('+', 20);
        table.insert('-', 20);
        table.insert('*', 40); // highest
        OpPrecedence(Rc::new(RefCell::new(table)))
    }

    pub(crate) fn get(&self, op: char) -> Option<i32> {
        match self.0.borrow().get(&op) {
            Some(&prec) if prec > 0 => Some(prec),
            _ => None,
        }
    }

    pub(crate) fn declare(&self, op: char, precedence: i32) {
        self.0.borrow_mut().insert(op, precedence);
    }

    pub(crate) fn remove(&self, op: char) {
        self.0.borrow_mut().remove(&op);
    }
}

/// All mutable state of one compilation session: the unit under
/// construction, the operator table, the signature registry, and the
/// variable environment of the function currently being lowered.
pub(crate) struct Context {
    pub(crate) context: LLVMContextRef,
    pub(crate) module: LLVMModuleRef,
    pub(crate) builder: LLVMBuilderRef,
    pub(crate) double_type: LLVMTypeRef,
    pub(crate) fpm: LLVMPassManagerRef,
    pub(crate) ops: OpPrecedence,
    named_values: HashMap<String, LLVMValueRef>,
    fn_protos: HashMap<String, Prototype>,
    data_layout: Option<CString>,
}

impl Context {
    pub(crate) unsafe fn new() -> Context {
        let context = core::LLVMContextCreate();
        let builder = core::LLVMCreateBuilderInContext(context);
        let double_type = core::LLVMDoubleTypeInContext(context);
        let (module, fpm) = new_unit(context, None);

        Context {
            context,
            module,
            builder,
            double_type,
            fpm,
            ops: OpPrecedence::new(),
            named_values: HashMap::new(),
            fn_protos: HashMap::new(),
            data_layout: None,
        }
    }

    pub(crate) unsafe fn set_data_layout(&mut self, layout: CString) {
        core::LLVMSetDataLayout(self.module, layout.as_ptr());
        self.data_layout = Some(layout);
    }

    /// Detach the module under construction for the backend to consume and
    /// start a fresh, empty one with the same data layout and pass
    /// pipeline. The caller takes ownership of the returned module.
    pub(crate) unsafe fn rotate_module(&mut self) -> LLVMModuleRef {
        core::LLVMDisposePassManager(self.fpm);
        let done = self.module;
        let (module, fpm) = new_unit(self.context, self.data_layout.as_deref());
        self.module = module;
        self.fpm = fpm;
        done
    }

    /// Insert-or-replace in the signature registry; last write wins. The
    /// previous entry, if any, is handed back.
    pub(crate) fn register_signature(&mut self, proto: Prototype) -> Option<Prototype> {
        self.fn_protos.insert(proto.name.clone(), proto)
    }

    pub(crate) fn signature(&self, name: &str) -> Option<&Prototype> {
        self.fn_protos.get(name)
    }

    pub(crate) fn bind_variable(&mut self, name: String, value: LLVMValueRef) -> Option<LLVMValueRef> {
        self.named_values.insert(name, value)
    }

    pub(crate) fn lookup_variable(&self, name: &str) -> Option<LLVMValueRef> {
        self.named_values.get(name).copied()
    }

    /// Undo a `bind_variable` shadow: reinstate the binding it returned, or
    /// drop the name entirely if there was none.
    pub(crate) fn restore_variable(&mut self, name: &str, shadowed: Option<LLVMValueRef>) {
        match shadowed {
            Some(value) => {
                self.named_values.insert(name.to_owned(), value);
            }
            None => {
                self.named_values.remove(name);
            }
        }
    }

    /// Called once at the start of lowering each function body; the
    /// environment is then repopulated with that function's parameters.
    pub(crate) fn reset_environment(&mut self) {
        self.named_values.clear();
    }
}

unsafe fn new_unit(
    context: LLVMContextRef,
    layout: Option<&CStr>,
) -> (LLVMModuleRef, LLVMPassManagerRef) {
    let module = core::LLVMModuleCreateWithNameInContext(MODULE_NAME.as_ptr() as *const _, context);
    if let Some(layout) = layout {
        core::LLVMSetDataLayout(module, layout.as_ptr());
    }

    let fpm = core::LLVMCreateFunctionPassManagerForModule(module);
    instcombine::LLVMAddInstructionCombiningPass(fpm);
    scalar::LLVMAddReassociatePass(fpm);
    scalar::LLVMAddGVNPass(fpm);
    scalar::LLVMAddCFGSimplificationPass(fpm);
    core::LLVMInitializeFunctionPassManager(fpm);

    (module, fpm)
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            core::LLVMDisposePassManager(self.fpm);
            core::LLVMDisposeBuilder(self.builder);
            core::LLVMDisposeModule(self.module);
            core::LLVMContextDispose(self.context);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_builtin_precedences() {
        let ops = OpPrecedence::new();
        assert_eq!(ops.get('<'), Some(10));
        assert_eq!(ops.get('+'), Some(20));
        assert_eq!(ops.get('-'), Some(20));
        assert_eq!(ops.get('*'), Some(40));
        assert_eq!(ops.get('%'), None);
    }

    #[test]
    fn test_declare_and_remove() {
        let ops = OpPrecedence::new();
        ops.declare('|', 5);
        assert_eq!(ops.get('|'), Some(5));
        ops.remove('|');
        assert_eq!(ops.get('|'), None);
    }

    #[test]
    fn test_nonpositive_precedence_is_not_an_operator() {
        let ops = OpPrecedence::new();
        ops.declare('z', 0);
        assert_eq!(ops.get('z'), None);
    }

    #[test]
    fn test_register_signature_last_write_wins() {
        unsafe {
            let mut ctx = Context::new();
            let first = Prototype::new("f".to_owned(), vec!["a".to_owned()]);
            assert_eq!(ctx.register_signature(first.clone()), None);

            let second = Prototype::new("f".to_owned(), vec!["a".to_owned(), "b".to_owned()]);
            assert_eq!(ctx.register_signature(second.clone()), Some(first));
            assert_eq!(ctx.signature("f"), Some(&second));
        }
    }

    #[test]
    fn test_variable_environment() {
        unsafe {
            let mut ctx = Context::new();
            let one = core::LLVMConstReal(ctx.double_type, 1.0);
            let two = core::LLVMConstReal(ctx.double_type, 2.0);

            assert_eq!(ctx.bind_variable("x".to_owned(), one), None);
            let shadowed = ctx.bind_variable("x".to_owned(), two);
            assert_eq!(shadowed, Some(one));
            assert_eq!(ctx.lookup_variable("x"), Some(two));

            ctx.restore_variable("x", shadowed);
            assert_eq!(ctx.lookup_variable("x"), Some(one));
            ctx.restore_variable("x", None);
            assert_eq!(ctx.lookup_variable("x"), None);

            ctx.bind_variable("y".to_owned(), one);
            ctx.reset_environment();
            assert_eq!(ctx.lookup_variable("y"), None);
        }
    }

    #[test]
    fn test_rotate_module_keeps_data_layout() {
        unsafe {
            let mut ctx = Context::new();
            let layout = CString::new("e-m:e-i64:64-f80:128-n8:16:32:64-S128").unwrap();
            ctx.set_data_layout(layout.clone());

            let old = ctx.rotate_module();
            assert_ne!(old, ctx.module);
            let rotated = CStr::from_ptr(core::LLVMGetDataLayoutStr(ctx.module));
            assert_eq!(rotated, layout.as_c_str());
            core::LLVMDisposeModule(old);
        }
    }
}
