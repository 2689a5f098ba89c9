//! Before/after filter chains.
//!
//! A filter sees `(server_id, msg, opts)` and either aborts the call with an
//! error or passes it on, optionally replacing any of the three values.
//! Filters run synchronously in registration order.

use crate::config::CallOptions;
use crate::protocol::RpcMessage;
use crate::{Result, RpcError};
use std::sync::Arc;

/// Outcome of a filter that lets the call continue.
///
/// `None` fields pass the previous value through unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterAction {
    pub server_id: Option<String>,
    pub msg: Option<RpcMessage>,
    pub opts: Option<CallOptions>,
}

impl FilterAction {
    /// Continue with the call unchanged.
    pub fn pass() -> Self {
        Self::default()
    }

    /// Continue, but send to a different server.
    pub fn redirect(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Self::default()
        }
    }

    /// Continue with a replacement message.
    pub fn with_msg(mut self, msg: RpcMessage) -> Self {
        self.msg = Some(msg);
        self
    }

    /// Continue with replacement call options.
    pub fn with_opts(mut self, opts: CallOptions) -> Self {
        self.opts = Some(opts);
        self
    }
}

pub trait Filter: Send + Sync {
    fn apply(&self, server_id: &str, msg: &RpcMessage, opts: &CallOptions) -> Result<FilterAction>;
}

impl<F> Filter for F
where
    F: Fn(&str, &RpcMessage, &CallOptions) -> Result<FilterAction> + Send + Sync,
{
    fn apply(&self, server_id: &str, msg: &RpcMessage, opts: &CallOptions) -> Result<FilterAction> {
        self(server_id, msg, opts)
    }
}

/// Wrap a closure as a shareable filter.
pub fn from_fn<F>(f: F) -> Arc<dyn Filter>
where
    F: Fn(&str, &RpcMessage, &CallOptions) -> Result<FilterAction> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An append-only, ordered list of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain.
    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Append several filters, keeping their order.
    pub fn extend<I>(&mut self, filters: I)
    where
        I: IntoIterator<Item = Arc<dyn Filter>>,
    {
        self.filters.extend(filters);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Thread the call through every filter.
    ///
    /// The first error short-circuits the chain. Errors that are not already
    /// filter errors are wrapped so the station reports them as such.
    pub fn run(
        &self,
        mut server_id: String,
        mut msg: RpcMessage,
        mut opts: CallOptions,
    ) -> Result<(String, RpcMessage, CallOptions)> {
        for filter in &self.filters {
            let action = filter.apply(&server_id, &msg, &opts).map_err(|err| match err {
                RpcError::Filter { .. } => err,
                other => RpcError::Filter {
                    message: other.to_string(),
                },
            })?;
            if let Some(id) = action.server_id {
                server_id = id;
            }
            if let Some(m) = action.msg {
                msg = m;
            }
            if let Some(o) = action.opts {
                opts = o;
            }
        }
        Ok((server_id, msg, opts))
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Namespace;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg() -> RpcMessage {
        RpcMessage::new(Namespace::User, "area", "playerRemote", "move")
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = FilterChain::new();
        let (id, m, o) = chain
            .run("area-1".into(), msg(), CallOptions::default())
            .unwrap();
        assert_eq!(id, "area-1");
        assert_eq!(m, msg());
        assert_eq!(o, CallOptions::default());
    }

    #[test]
    fn test_filters_rewrite_in_order() {
        let mut chain = FilterChain::new();
        chain.push(from_fn(|_, _, _| Ok(FilterAction::redirect("area-2"))));
        chain.push(from_fn(|id, m, _| {
            assert_eq!(id, "area-2");
            let mut rewritten = m.clone();
            rewritten.method = "teleport".into();
            Ok(FilterAction::pass().with_msg(rewritten))
        }));

        let (id, m, _) = chain
            .run("area-1".into(), msg(), CallOptions::default())
            .unwrap();
        assert_eq!(id, "area-2");
        assert_eq!(m.method, "teleport");
    }

    #[test]
    fn test_error_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut chain = FilterChain::new();
        chain.push(from_fn(|_, _, _| Err(RpcError::Other("banned".into()))));
        chain.push(from_fn(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FilterAction::pass())
        }));

        match chain.run("area-1".into(), msg(), CallOptions::default()) {
            Err(RpcError::Filter { message }) => assert_eq!(message, "banned"),
            other => panic!("Expected filter error, got: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
