//! Message handlers and the per-endpoint handler table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::message::{decode_message, Channel};

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

type HandlerFn = dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync;

/// A registered message handler.
///
/// Handlers are compared by identity: two clones of the same
/// `MessageHandler` are the same handler, two handlers built from identical
/// closures are not.
#[derive(Clone)]
pub struct MessageHandler {
    f: Arc<HandlerFn>,
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("ptr", &Arc::as_ptr(&self.f).cast::<()>())
            .finish()
    }
}

impl MessageHandler {
    /// Wrap an async handler.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |payload| -> HandlerFuture { Box::pin(f(payload)) }),
        }
    }

    /// Wrap a synchronous handler.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::new(move |payload| std::future::ready(f(payload)))
    }

    /// Run the handler.
    pub fn invoke(&self, payload: Option<Value>) -> HandlerFuture {
        (self.f)(payload)
    }

    /// `true` if both refer to the same registration.
    pub fn same_as(&self, other: &MessageHandler) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

/// Normalized message name → handlers in registration order.
#[derive(Debug, Default)]
pub(crate) struct HandlerTable {
    map: HashMap<String, Vec<MessageHandler>>,
}

impl HandlerTable {
    pub(crate) fn add(&mut self, msg: String, handler: MessageHandler) {
        self.map.entry(msg).or_default().push(handler);
    }

    /// Remove every registration of `handler` under `msg`. Returns how many
    /// were removed.
    pub(crate) fn remove(&mut self, msg: &str, handler: &MessageHandler) -> usize {
        let Some(list) = self.map.get_mut(msg) else {
            return 0;
        };
        let before = list.len();
        list.retain(|h| !h.same_as(handler));
        let removed = before - list.len();
        if list.is_empty() {
            self.map.remove(msg);
        }
        removed
    }

    pub(crate) fn get(&self, msg: &str) -> Vec<MessageHandler> {
        self.map.get(msg).cloned().unwrap_or_default()
    }

    pub(crate) fn has(&self, msg: &str) -> bool {
        self.map.get(msg).is_some_and(|list| !list.is_empty())
    }

    /// Sorted message names.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names a client declares to its hub: `NET` and `SYNC`.
    pub(crate) fn declarable(&self) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|msg| {
                matches!(
                    decode_message(msg),
                    Ok((Channel::Net | Channel::Sync, _))
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_invoke() {
        let h = MessageHandler::from_fn(|p| Ok(json!({ "got": p })));
        let out = h.invoke(Some(json!(3))).await.unwrap();
        assert_eq!(out, json!({"got": 3}));

        let h = MessageHandler::new(|_| async { anyhow::bail!("nope") });
        assert_eq!(h.invoke(None).await.unwrap_err().to_string(), "nope");
    }

    #[test]
    fn test_remove_by_identity() {
        let a = MessageHandler::from_fn(|_| Ok(Value::Null));
        let b = MessageHandler::from_fn(|_| Ok(Value::Null));
        let mut table = HandlerTable::default();
        table.add("NET:X".into(), a.clone());
        table.add("NET:X".into(), b.clone());
        table.add("NET:X".into(), a.clone());

        assert_eq!(table.remove("NET:X", &a), 2);
        let left = table.get("NET:X");
        assert_eq!(left.len(), 1);
        assert!(left[0].same_as(&b));

        assert_eq!(table.remove("NET:X", &b), 1);
        assert!(!table.has("NET:X"));
        assert!(table.names().is_empty());
    }

    #[test]
    fn test_declarable_filters_channels() {
        let h = MessageHandler::from_fn(|_| Ok(Value::Null));
        let mut table = HandlerTable::default();
        for msg in ["NET:B", ":LOCAL", "SRV:HUB", "SYNC:A", "NET:A"] {
            table.add(msg.into(), h.clone());
        }
        assert_eq!(table.declarable(), vec!["NET:A", "NET:B", "SYNC:A"]);
    }
}
