//! Lua-visible capability objects handed to script entry points.
//!
//! `Init`/`Main` receive a [`QuestStateApi`]; `OnPersist` additionally
//! receives a [`PersistApi`] scoped to the host's opaque transfer context.
//! State methods mutate the owning quest's shared bookkeeping; nothing here
//! calls back into the host directly except the cooperative prompt wait.

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

use mlua::{UserData, UserDataMethods, Value, Variadic};

use crate::diag;
use crate::host::{self, HostApi, TransferF64Fn, TransferI32Fn};
use crate::interp::ScriptValue;
use crate::persist;
use crate::quest::{PendingBinding, PendingThread, QuestShared};
use crate::wait::{self, WaitOutcome};

#[derive(Clone)]
pub struct QuestStateApi {
    pub(crate) quest: String,
    pub(crate) shared: Rc<RefCell<QuestShared>>,
}

impl UserData for QuestStateApi {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("log", |_, this, message: String| {
            diag!("quest '{}': {message}", this.quest);
            this.shared
                .borrow_mut()
                .events
                .push(format!("quest.log {message}"));
            Ok(())
        });

        // Thread creation is deferred: the request is queued here and
        // submitted to the host's facility on the next step.
        methods.add_method(
            "start_thread",
            |_, this, (function, args): (String, Variadic<Value>)| {
                Ok(queue_thread(this, function, None, &args))
            },
        );

        methods.add_method(
            "start_thread_in",
            |_, this, (function, region, args): (String, String, Variadic<Value>)| {
                Ok(queue_thread(this, function, Some(region), &args))
            },
        );

        methods.add_method(
            "bind_entity",
            |_, this, (entity, file): (String, String)| {
                let mut shared = this.shared.borrow_mut();
                shared.events.push(format!("binding.request {entity}"));
                shared.pending_bindings.push(PendingBinding { entity, file });
                Ok(())
            },
        );

        // Blocks the calling script until the player answers or the host
        // starts terminating; no answer comes back as nil.
        methods.add_method("ask_yes_no", |_, this, ()| {
            match wait::wait_yes_no(host::api(), &this.quest) {
                WaitOutcome::Ready(answer) => Ok(Some(answer)),
                WaitOutcome::Cancelled => Ok(None),
            }
        });
    }
}

fn queue_thread(
    this: &QuestStateApi,
    function: String,
    region: Option<String>,
    args: &[Value],
) -> u32 {
    let mut captured = Vec::with_capacity(args.len());
    for value in args {
        match ScriptValue::capture(value) {
            Some(value) => captured.push(value),
            None => diag!(
                "quest '{}': thread '{function}' argument {} is not plain data; dropped",
                this.quest,
                captured.len() + 1
            ),
        }
    }
    let mut shared = this.shared.borrow_mut();
    let index = shared.next_thread;
    shared.next_thread += 1;
    shared.events.push(format!("thread.queue {function} (#{index})"));
    shared.pending_threads.insert(
        index,
        PendingThread {
            function,
            region,
            args: captured,
        },
    );
    index
}

/// Persistence capability: wraps the host's transfer context for the
/// duration of one `OnPersist` call. Holds copies of the transfer bindings
/// so the object never reaches back into process-global state.
pub struct PersistApi {
    ctx: *mut c_void,
    transfer_i32: Option<TransferI32Fn>,
    transfer_f64: Option<TransferF64Fn>,
}

impl PersistApi {
    pub fn new(api: &HostApi, ctx: *mut c_void) -> Self {
        PersistApi {
            ctx,
            transfer_i32: api.transfer_i32,
            transfer_f64: api.transfer_f64,
        }
    }

    fn as_host(&self) -> HostApi {
        let mut api = HostApi::unresolved();
        api.transfer_i32 = self.transfer_i32;
        api.transfer_f64 = self.transfer_f64;
        api
    }
}

impl UserData for PersistApi {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("int", |_, this, (name, fallback): (String, i32)| {
            Ok(persist::transfer_int(&this.as_host(), this.ctx, &name, fallback))
        });
        methods.add_method("number", |_, this, (name, fallback): (String, f64)| {
            Ok(persist::transfer_number(&this.as_host(), this.ctx, &name, fallback))
        });
        methods.add_method("flag", |_, this, (name, fallback): (String, bool)| {
            Ok(persist::transfer_flag(&this.as_host(), this.ctx, &name, fallback))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> QuestStateApi {
        QuestStateApi {
            quest: "embers".to_string(),
            shared: Rc::new(RefCell::new(QuestShared::default())),
        }
    }

    #[test]
    fn queued_threads_get_sequential_indices() {
        let api = state();
        assert_eq!(queue_thread(&api, "First".to_string(), None, &[]), 0);
        assert_eq!(
            queue_thread(&api, "Second".to_string(), Some("camp".to_string()), &[]),
            1
        );
        let shared = api.shared.borrow();
        assert_eq!(shared.pending_threads.len(), 2);
        assert_eq!(shared.pending_threads[&0].function, "First");
        assert_eq!(shared.pending_threads[&1].region.as_deref(), Some("camp"));
    }

    #[test]
    fn non_plain_arguments_are_dropped_from_the_capture() {
        let api = state();
        let lua = mlua::Lua::new();
        let table = Value::Table(lua.create_table().expect("table"));
        queue_thread(
            &api,
            "Mixed".to_string(),
            None,
            &[Value::Integer(3), table, Value::Boolean(true)],
        );
        let shared = api.shared.borrow();
        assert_eq!(
            shared.pending_threads[&0].args,
            vec![ScriptValue::Number(3.0), ScriptValue::Bool(true)]
        );
    }
}
