//! Remote procedure call boundary
//!
//! The cache talks to the server only through the [`Remote`] trait. Transport,
//! authentication and the concrete method surface live behind it.

pub mod batch;
pub mod memory;

pub use batch::BatchResult;
pub use memory::MemoryRemote;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Protocol-level failure reported by the remote side
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct RemoteFault {
    pub code: i32,
    pub message: String,
}

impl RemoteFault {
    /// The requested object does not exist
    pub const NOT_FOUND: i32 = 404;
    /// The parameters were rejected
    pub const INVALID_PARAMS: i32 = 400;
    /// No such method
    pub const UNKNOWN_METHOD: i32 = -32601;
    /// The call never got a proper answer
    pub const TRANSPORT: i32 = -32300;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }
}

/// One method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub method: String,
    pub params: Vec<Value>,
}

impl RemoteCall {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Generic remote procedure interface
///
/// Implementations use interior mutability where they need state; the cache
/// only ever holds a shared reference.
pub trait Remote {
    /// Invoke a single method
    fn call(&self, method: &str, params: &[Value]) -> Result<Value, RemoteFault>;

    /// Invoke several methods in one round trip
    ///
    /// The outer error means the whole batch failed; the inner results are
    /// per call and in the order given. The default issues the calls one by
    /// one.
    fn batch_call(&self, calls: &[RemoteCall]) -> Result<Vec<Result<Value, RemoteFault>>, RemoteFault> {
        Ok(calls
            .iter()
            .map(|c| self.call(&c.method, &c.params))
            .collect())
    }

    /// Bound how long a single call may block
    fn set_timeout(&self, _timeout: Option<Duration>) {}
}

impl<R: Remote + ?Sized> Remote for Rc<R> {
    fn call(&self, method: &str, params: &[Value]) -> Result<Value, RemoteFault> {
        (**self).call(method, params)
    }

    fn batch_call(&self, calls: &[RemoteCall]) -> Result<Vec<Result<Value, RemoteFault>>, RemoteFault> {
        (**self).batch_call(calls)
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        (**self).set_timeout(timeout)
    }
}

impl<R: Remote + ?Sized> Remote for Box<R> {
    fn call(&self, method: &str, params: &[Value]) -> Result<Value, RemoteFault> {
        (**self).call(method, params)
    }

    fn batch_call(&self, calls: &[RemoteCall]) -> Result<Vec<Result<Value, RemoteFault>>, RemoteFault> {
        (**self).batch_call(calls)
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        (**self).set_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Remote for Echo {
        fn call(&self, method: &str, params: &[Value]) -> Result<Value, RemoteFault> {
            if method == "fail" {
                return Err(RemoteFault::new(RemoteFault::INVALID_PARAMS, "bad"));
            }
            Ok(json!({ "method": method, "params": params }))
        }
    }

    #[test]
    fn default_batch_is_sequential_and_isolated() {
        let calls = vec![
            RemoteCall::new("a", vec![json!(1)]),
            RemoteCall::new("fail", vec![]),
            RemoteCall::new("b", vec![]),
        ];
        let results = Echo.batch_call(&calls).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap()["method"], "a");
        assert_eq!(results[1].as_ref().unwrap_err().code, RemoteFault::INVALID_PARAMS);
        assert_eq!(results[2].as_ref().unwrap()["method"], "b");
    }

    #[test]
    fn fault_display() {
        let fault = RemoteFault::not_found("TestPlan 7");
        assert!(fault.is_not_found());
        assert_eq!(fault.to_string(), "[404] TestPlan 7");
    }
}
