//! Remote object references and call proxies.
//!
//! The engine identifies its objects by positive integer ids. On the wire an
//! object reference is either a bare id or `{"$id": <id>, "$class": <name>}`.

use crate::ipc::multiplexer::{CallMultiplexer, PendingCall};
use crate::ipc::protocol::ObjectId;
use crate::ipc::transport::MessageSink;
use crate::{JsonipcError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Reference to an object living in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ObjectRepr")]
pub struct RemoteObject {
    #[serde(rename = "$id")]
    id: ObjectId,
    #[serde(rename = "$class", default, skip_serializing_if = "Option::is_none")]
    class: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectRepr {
    Id(serde_json::Number),
    Object {
        #[serde(rename = "$id")]
        id: serde_json::Number,
        #[serde(rename = "$class", default)]
        class: Option<String>,
    },
}

/// Ids are positive integers; integral floats such as `42.0` count as integers.
fn positive_id(number: &serde_json::Number) -> Option<ObjectId> {
    if let Some(id) = number.as_u64() {
        return (id > 0).then_some(id);
    }
    let id = number.as_f64()?;
    (id >= 1.0 && id.fract() == 0.0 && id < u64::MAX as f64).then_some(id as ObjectId)
}

impl TryFrom<ObjectRepr> for RemoteObject {
    type Error = String;

    fn try_from(repr: ObjectRepr) -> std::result::Result<Self, Self::Error> {
        let (number, class) = match repr {
            ObjectRepr::Id(number) => (number, None),
            ObjectRepr::Object { id, class } => (id, class),
        };
        let id = positive_id(&number)
            .ok_or_else(|| format!("object id must be a positive integer, got {}", number))?;
        Ok(Self { id, class })
    }
}

impl RemoteObject {
    /// Create a reference. Returns `None` for the reserved id zero.
    pub fn new(id: ObjectId) -> Option<Self> {
        (id > 0).then_some(Self { id, class: None })
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    /// Decode a call result into an object reference.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| JsonipcError::Protocol {
            message: format!("Invalid object reference {}: {}", value, e),
        })
    }
}

/// Proxy that sends calls to one remote object.
#[derive(Debug)]
pub struct ObjectProxy<S: MessageSink> {
    object: RemoteObject,
    mux: Arc<CallMultiplexer<S>>,
}

impl<S: MessageSink> Clone for ObjectProxy<S> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            mux: Arc::clone(&self.mux),
        }
    }
}

impl<S: MessageSink> ObjectProxy<S> {
    pub fn new(object: RemoteObject, mux: Arc<CallMultiplexer<S>>) -> Self {
        Self { object, mux }
    }

    pub fn object(&self) -> &RemoteObject {
        &self.object
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    /// Proxy for another object reachable over the same channel.
    pub fn proxy_for(&self, object: RemoteObject) -> Self {
        Self::new(object, Arc::clone(&self.mux))
    }

    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        self.mux.invoke(Some(self.object.id()), method, args)
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.mux.call(Some(self.object.id()), method, args).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.mux
            .call_with_timeout(Some(self.object.id()), method, args, timeout)
            .await
    }

    /// Call a method and decode its result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}
