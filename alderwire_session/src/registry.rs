// Per-RPC protocol registry.
//
// RPCs are registered explicitly at startup: id, permission class,
// transport, an ordered parameter-kind list, optional caller/callee
// injection indices, and a handler. Dispatch is a table lookup plus an
// indexed argument decode — there is no runtime type inspection and no
// process-wide registry; the table is a constructor parameter of the
// connection.
//
// The definition table (without handlers) is shared with the I/O loop,
// which needs permissions and the callee predicate for routing; handlers
// stay on the caller's thread.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use alderwire_protocol::rpc::ArgKind;
use alderwire_protocol::rpc::ArgValue;
use alderwire_protocol::types::{ClientId, NetworkId, RpcId, RpcPermission, Transport};

use crate::error::{Result, SessionError};

/// Declaration of one RPC.
#[derive(Clone, Debug)]
pub struct RpcDef {
    pub id: RpcId,
    pub permission: RpcPermission,
    pub transport: Transport,
    pub params: Vec<ArgKind>,
    /// Parameter position filled with the caller's id on the receiving
    /// side instead of traveling on the wire.
    pub caller_index: Option<usize>,
    /// Parameter position filled with the callee's id. An RPC with a
    /// callee parameter is routed point-to-point when the callee is
    /// concrete.
    pub callee_index: Option<usize>,
}

impl RpcDef {
    /// The "has a callee id parameter" predicate used by relay routing.
    pub fn has_callee_param(&self) -> bool {
        self.callee_index.is_some()
    }
}

/// Invocation context passed to handlers.
#[derive(Clone, Copy, Debug)]
pub struct RpcContext {
    pub rpc_id: RpcId,
    pub caller: ClientId,
    pub callee: ClientId,
    pub target: NetworkId,
}

/// User RPC handler. Errors are logged and swallowed by the dispatcher so
/// one bad invocation cannot stop the queue.
pub type RpcHandler = Box<dyn FnMut(&RpcContext, &[ArgValue]) -> Result<()>>;

/// Immutable definition table shared with the I/O loop.
pub struct RpcTable {
    defs: HashMap<u32, RpcDef>,
}

impl RpcTable {
    pub fn def(&self, id: RpcId) -> Option<&RpcDef> {
        self.defs.get(&id.0)
    }
}

/// Registry of RPC definitions and their handlers.
#[derive(Default)]
pub struct ProtocolRegistry {
    defs: HashMap<u32, RpcDef>,
    handlers: HashMap<u32, RpcHandler>,
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        ProtocolRegistry::default()
    }

    /// Register an RPC. User ids start at 30; injection indices must point
    /// at `Client`-kind parameters.
    pub fn define_rpc(&mut self, def: RpcDef, handler: RpcHandler) -> Result<()> {
        if def.id.is_control() {
            return Err(SessionError::Config(format!(
                "rpc id {} is reserved for control messages",
                def.id.0
            )));
        }
        if self.defs.contains_key(&def.id.0) {
            return Err(SessionError::Config(format!(
                "rpc id {} already registered",
                def.id.0
            )));
        }
        for index in [def.caller_index, def.callee_index].into_iter().flatten() {
            match def.params.get(index) {
                Some(ArgKind::Client) => {}
                _ => {
                    return Err(SessionError::Config(format!(
                        "injection index {index} of rpc {} must name a client-id parameter",
                        def.id.0
                    )));
                }
            }
        }
        self.handlers.insert(def.id.0, handler);
        self.defs.insert(def.id.0, def);
        Ok(())
    }

    pub fn def(&self, id: RpcId) -> Option<&RpcDef> {
        self.defs.get(&id.0)
    }

    /// Snapshot the definitions for the I/O loop.
    pub fn table(&self) -> Arc<RpcTable> {
        Arc::new(RpcTable {
            defs: self.defs.clone(),
        })
    }

    /// Invoke the handler for `ctx.rpc_id`, logging and swallowing its
    /// error. Returns whether a handler existed.
    pub fn dispatch(&mut self, ctx: &RpcContext, args: &[ArgValue]) -> bool {
        match self.handlers.get_mut(&ctx.rpc_id.0) {
            Some(handler) => {
                if let Err(error) = handler(ctx, args) {
                    warn!(rpc = ctx.rpc_id.0, %error, "rpc handler failed");
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn def(id: u32) -> RpcDef {
        RpcDef {
            id: RpcId(id),
            permission: RpcPermission::AnyToAll,
            transport: Transport::Stream,
            params: vec![ArgKind::Client, ArgKind::U32],
            caller_index: Some(0),
            callee_index: None,
        }
    }

    #[test]
    fn rejects_reserved_and_duplicate_ids() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry
            .define_rpc(def(8), Box::new(|_, _| Ok(())))
            .is_err());
        registry.define_rpc(def(30), Box::new(|_, _| Ok(()))).unwrap();
        assert!(registry
            .define_rpc(def(30), Box::new(|_, _| Ok(())))
            .is_err());
    }

    #[test]
    fn rejects_bad_injection_index() {
        let mut registry = ProtocolRegistry::new();
        let mut bad = def(30);
        bad.caller_index = Some(1); // points at the u32, not a client id
        assert!(registry.define_rpc(bad, Box::new(|_, _| Ok(()))).is_err());

        let mut out_of_range = def(31);
        out_of_range.caller_index = Some(5);
        assert!(registry
            .define_rpc(out_of_range, Box::new(|_, _| Ok(())))
            .is_err());
    }

    #[test]
    fn dispatch_runs_handler_and_swallows_errors() {
        let calls = Rc::new(RefCell::new(0));
        let mut registry = ProtocolRegistry::new();
        let counter = calls.clone();
        registry
            .define_rpc(
                def(30),
                Box::new(move |_, _| {
                    *counter.borrow_mut() += 1;
                    Err(SessionError::NotConnected)
                }),
            )
            .unwrap();

        let ctx = RpcContext {
            rpc_id: RpcId(30),
            caller: ClientId(1),
            callee: ClientId::NONE,
            target: NetworkId::NONE,
        };
        assert!(registry.dispatch(&ctx, &[]));
        assert!(registry.dispatch(&ctx, &[]));
        assert_eq!(*calls.borrow(), 2);

        let unknown = RpcContext {
            rpc_id: RpcId(99),
            ..ctx
        };
        assert!(!registry.dispatch(&unknown, &[]));
    }

    #[test]
    fn table_snapshot_carries_defs() {
        let mut registry = ProtocolRegistry::new();
        registry.define_rpc(def(42), Box::new(|_, _| Ok(()))).unwrap();
        let table = registry.table();
        assert!(table.def(RpcId(42)).is_some());
        assert!(table.def(RpcId(43)).is_none());
        assert!(table.def(RpcId(42)).unwrap().has_callee_param() == false);
    }
}
