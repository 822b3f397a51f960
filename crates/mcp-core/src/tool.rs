//! Tool registry backing the default `tools/list` and `tools/call` handlers.

use crate::error::HandlerError;
use crate::jsonrpc::JsonRpcError;
use crate::protocol::{CallToolParams, CallToolResult, Tool};
use crate::server::RequestContext;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

pub type ToolFuture = BoxFuture<'static, Result<CallToolResult, HandlerError>>;
pub type ToolFn = Arc<dyn Fn(RequestContext, Map<String, Value>) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredTool {
    definition: Tool,
    call: ToolFn,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<RegisteredTool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool registered under an existing name replaces it
    /// in place, keeping its position in `tools/list`.
    pub fn register<F, Fut>(&self, definition: Tool, call: F)
    where
        F: Fn(RequestContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, HandlerError>> + Send + 'static,
    {
        let call: ToolFn = Arc::new(move |ctx, args| call(ctx, args).boxed());
        let entry = RegisteredTool { definition, call };
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        match tools
            .iter_mut()
            .find(|t| t.definition.name == entry.definition.name)
        {
            Some(existing) => *existing = entry,
            None => tools.push(entry),
        }
    }

    pub fn definitions(&self) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|t| t.definition.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|t| t.definition.name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Run a tool by name.
    ///
    /// An unknown tool is a protocol error (`InvalidParams`). A tool that
    /// fails with an opaque error produces an `isError` result instead, so the
    /// caller sees the failure as tool output; structured protocol errors are
    /// passed through.
    pub async fn call(
        &self,
        ctx: RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult, HandlerError> {
        let call = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.definition.name == params.name)
            .map(|t| t.call.clone());
        let Some(call) = call else {
            return Err(JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)).into());
        };

        match call(ctx, params.arguments).await {
            Ok(result) => Ok(result),
            Err(HandlerError::Rpc(err)) => Err(HandlerError::Rpc(err)),
            Err(HandlerError::Internal(err)) => {
                tracing::debug!(tool = %params.name, error = %err, "Tool failed");
                Ok(CallToolResult::error(format!("{:#}", err)))
            }
        }
    }
}
