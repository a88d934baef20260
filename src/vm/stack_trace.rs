//! Human-readable stack traces.
//!
//! Walks the frame chain from newest to oldest and emits one line per
//! managed frame:
//!
//! ```text
//!   module.Type.method(this: Type, x: Int, y: ref Int)
//!     at line 42 in "source.osp"
//! ```
//!
//! The first frame on a thread exists only to carry the startup arguments
//! and has no method; it is not included. Argument types use the last
//! component of their qualified name, references render as `ref <type>`,
//! and bound `aves.Method` values describe their instance and target
//! recursively.

use std::fmt::Write;
use std::sync::Arc;

use ovum_core::Value;

use crate::runtime::method::MethodOverload;
use crate::vm::frame::StackFrame;
use crate::vm::thread::Thread;
use crate::vm::vm::Vm;

pub struct StackTraceFormatter;

impl StackTraceFormatter {
    pub fn format(thread: &Thread) -> String {
        let mut out = String::new();
        let mut ip = thread.ip();
        for frame in thread.frames().iter().rev() {
            let Some(method) = &frame.method else {
                break;
            };
            Self::append_frame(thread.vm(), thread, &mut out, frame, method, ip);
            ip = frame.prev_ip;
        }
        out
    }

    fn append_frame(
        vm: &Vm,
        thread: &Thread,
        out: &mut String,
        frame: &StackFrame,
        method: &Arc<MethodOverload>,
        ip: u32,
    ) {
        out.push_str("  ");
        out.push_str(&vm.qualified_method_name(method.group));
        out.push('(');

        let instance_offset = method.instance_offset() as usize;
        let param_count = frame.argc as usize;
        for i in 0..param_count {
            if i > 0 {
                out.push_str(", ");
            }
            if i == 0 && method.is_instance() {
                out.push_str("this");
            } else {
                match method.params.get(i - instance_offset) {
                    Some(param) => out.push_str(&param.name),
                    None => out.push('_'),
                }
            }
            out.push_str(": ");
            let arg = &thread.stack_slots()[frame.base + i];
            Self::append_argument_type(vm, thread, out, arg);
        }
        out.push(')');

        if let Some(body) = method.initialized() {
            if let Some(debug) = &body.debug_symbols {
                if let Some(symbol) = debug.find(ip) {
                    let _ = write!(out, "\n    at line {} in \"{}\"", symbol.line, debug.file);
                }
            }
        }
        out.push('\n');
    }

    fn append_argument_type(vm: &Vm, thread: &Thread, out: &mut String, arg: &Value) {
        let value;
        let arg = if arg.is_ref() {
            out.push_str("ref ");
            value = thread.read_through_ref(arg);
            &value
        } else {
            arg
        };

        let Some(type_id) = vm.value_type_id(arg) else {
            out.push_str("null");
            return;
        };
        out.push_str(vm.type_info(type_id).short_name());

        // Bound methods are described recursively:
        //   Method(this: <instance type>, <target>)
        if type_id == vm.standard.method {
            if let Value::Object { handle, .. } = arg {
                let instance = vm.gc().read_field(*handle, 0).unwrap_or(Value::Null);
                out.push_str("(this: ");
                Self::append_argument_type(vm, thread, out, &instance);
                out.push_str(", ");
                match vm.gc().read_field(*handle, 1) {
                    Some(Value::FnRef(method)) => {
                        out.push_str(&Self::short_method_name(vm, method));
                    }
                    _ => out.push('?'),
                }
                out.push(')');
            }
        }
    }

    /// The semi-qualified method name: the last component of the type name
    /// plus the method name, or just the last component for global
    /// functions.
    fn short_method_name(vm: &Vm, method: ovum_core::MethodId) -> String {
        let group = vm.method(method);
        match group.decl_type {
            Some(ty) => format!("{}.{}", vm.type_info(ty).short_name(), group.name),
            None => match group.name.rfind('.') {
                Some(dot) => group.name[dot + 1..].to_string(),
                None => group.name.to_string(),
            },
        }
    }
}
