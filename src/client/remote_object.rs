//! Forwarding of operations to endpoint-resident objects
//!
//! [`Forward`] turns the closed set of [`Operation`]s into ordinary method
//! calls. It is implemented by [`RemoteObject`], a plain handle to a remote
//! object, and by the keyed [`SharedObject`](super::SharedObject) proxy.

use rmem_connect::{
    Arg, BinaryOp, CompareOp, ConnectionGuardian, Operation, RemoteError, RemoteErrorKind,
    RemoteRef, Reply, UnaryOp,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, RmemError};

/// Producer of the current live connection
///
/// Proxies and resolvers hold one of these instead of a connection, so a
/// replaced connection is picked up by every holder immediately.
pub trait ConnectionSource: Send + Sync {
    fn connection(&self) -> Result<Arc<ConnectionGuardian>>;
}

impl ConnectionSource for Arc<ConnectionGuardian> {
    fn connection(&self) -> Result<Arc<ConnectionGuardian>> {
        Ok(Arc::clone(self))
    }
}

/// Result of a forwarded operation
#[derive(Debug, Clone)]
pub enum RemoteValue {
    /// Scalar returned by value
    Value(Value),
    /// Handle to an object that stays on the endpoint
    Object(RemoteObject),
    /// Elements produced by iteration
    Items(Vec<RemoteValue>),
}

impl RemoteValue {
    pub(crate) fn from_reply(reply: Reply, source: &Arc<dyn ConnectionSource>) -> Self {
        match reply {
            Reply::Value(v) => RemoteValue::Value(v),
            Reply::Ref(r) => RemoteValue::Object(RemoteObject::new(Arc::clone(source), r)),
            Reply::Items(items) => RemoteValue::Items(
                items
                    .into_iter()
                    .map(|item| RemoteValue::from_reply(item, source))
                    .collect(),
            ),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            RemoteValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            RemoteValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&RemoteObject> {
        match self {
            RemoteValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<RemoteObject> {
        match self {
            RemoteValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(Value::as_bool)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RemoteValue::Value(Value::Null))
    }

    /// Pass this result back to the endpoint as an argument
    ///
    /// Iteration results have no single remote counterpart and yield `None`.
    pub fn to_arg(&self) -> Option<Arg> {
        match self {
            RemoteValue::Value(v) => Some(Arg::Value(v.clone())),
            RemoteValue::Object(o) => Some(Arg::Ref(o.target.clone())),
            RemoteValue::Items(_) => None,
        }
    }
}

/// Unkeyed handle to an object living on the endpoint
#[derive(Clone)]
pub struct RemoteObject {
    source: Arc<dyn ConnectionSource>,
    target: RemoteRef,
}

impl RemoteObject {
    pub fn new(source: Arc<dyn ConnectionSource>, target: RemoteRef) -> Self {
        Self { source, target }
    }

    pub fn remote_ref(&self) -> &RemoteRef {
        &self.target
    }

    pub fn type_name(&self) -> &str {
        &self.target.type_name
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("target", &self.target)
            .finish()
    }
}

impl From<&RemoteObject> for Arg {
    fn from(obj: &RemoteObject) -> Self {
        Arg::Ref(obj.target.clone())
    }
}

impl From<RemoteObject> for Arg {
    fn from(obj: RemoteObject) -> Self {
        Arg::Ref(obj.target)
    }
}

impl Forward for RemoteObject {
    fn invoke(&self, op: Operation) -> Result<RemoteValue> {
        let guardian = self.source.connection()?;
        let reply = guardian.invoke(&self.target, op)?;
        Ok(RemoteValue::from_reply(reply, &self.source))
    }
}

fn unexpected(what: &str, got: &RemoteValue) -> RmemError {
    RmemError::Remote(RemoteError::new(
        RemoteErrorKind::Type,
        format!("expected {} from the endpoint, got {:?}", what, got),
    ))
}

fn expect_bool(value: RemoteValue) -> Result<bool> {
    value.as_bool().ok_or_else(|| unexpected("a bool", &value))
}

fn expect_string(value: RemoteValue) -> Result<String> {
    match value {
        RemoteValue::Value(Value::String(s)) => Ok(s),
        other => Err(unexpected("a string", &other)),
    }
}

/// Operations forwarded to a remote object
///
/// Only [`invoke`](Forward::invoke) is required; every helper builds one
/// [`Operation`] and interprets the reply.
pub trait Forward {
    /// Perform `op` on the remote object
    fn invoke(&self, op: Operation) -> Result<RemoteValue>;

    fn getattr(&self, name: &str) -> Result<RemoteValue> {
        self.invoke(Operation::GetAttr(name.to_string()))
    }

    fn setattr(&self, name: &str, value: impl Into<Arg>) -> Result<()>
    where
        Self: Sized,
    {
        self.invoke(Operation::SetAttr(name.to_string(), value.into()))
            .map(|_| ())
    }

    fn delattr(&self, name: &str) -> Result<()> {
        self.invoke(Operation::DelAttr(name.to_string())).map(|_| ())
    }

    fn call(&self, args: Vec<Arg>) -> Result<RemoteValue> {
        self.invoke(Operation::Call(args))
    }

    /// Look up a bound method and call it
    fn call_method(&self, name: &str, args: Vec<Arg>) -> Result<RemoteValue> {
        match self.getattr(name)? {
            RemoteValue::Object(method) => method.call(args),
            other => Err(unexpected("a callable", &other)),
        }
    }

    fn get_item(&self, index: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.invoke(Operation::GetItem(index.into()))
    }

    fn set_item(&self, index: impl Into<Arg>, value: impl Into<Arg>) -> Result<()>
    where
        Self: Sized,
    {
        self.invoke(Operation::SetItem(index.into(), value.into()))
            .map(|_| ())
    }

    fn del_item(&self, index: impl Into<Arg>) -> Result<()>
    where
        Self: Sized,
    {
        self.invoke(Operation::DelItem(index.into())).map(|_| ())
    }

    fn contains(&self, item: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        expect_bool(self.invoke(Operation::Contains(item.into()))?)
    }

    fn binary(&self, op: BinaryOp, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.invoke(Operation::Binary(op, rhs.into()))
    }

    fn add(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::Add, rhs)
    }

    fn sub(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::Sub, rhs)
    }

    fn mul(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::Mul, rhs)
    }

    fn truediv(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::TrueDiv, rhs)
    }

    fn floordiv(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::FloorDiv, rhs)
    }

    fn rem(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::Mod, rhs)
    }

    fn pow(&self, rhs: impl Into<Arg>) -> Result<RemoteValue>
    where
        Self: Sized,
    {
        self.binary(BinaryOp::Pow, rhs)
    }

    fn unary(&self, op: UnaryOp) -> Result<RemoteValue> {
        self.invoke(Operation::Unary(op))
    }

    fn neg(&self) -> Result<RemoteValue> {
        self.unary(UnaryOp::Neg)
    }

    /// Comparison with the remote object's own semantics
    fn compare(&self, op: CompareOp, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        expect_bool(self.invoke(Operation::Compare(op, rhs.into()))?)
    }

    fn eq(&self, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        self.compare(CompareOp::Eq, rhs)
    }

    fn ne(&self, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        self.compare(CompareOp::Ne, rhs)
    }

    fn lt(&self, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        self.compare(CompareOp::Lt, rhs)
    }

    fn le(&self, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        self.compare(CompareOp::Le, rhs)
    }

    fn gt(&self, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        self.compare(CompareOp::Gt, rhs)
    }

    fn ge(&self, rhs: impl Into<Arg>) -> Result<bool>
    where
        Self: Sized,
    {
        self.compare(CompareOp::Ge, rhs)
    }

    fn len(&self) -> Result<usize> {
        let value = self.invoke(Operation::Len)?;
        value
            .as_value()
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| unexpected("a length", &value))
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn str(&self) -> Result<String> {
        expect_string(self.invoke(Operation::Str)?)
    }

    fn repr(&self) -> Result<String> {
        expect_string(self.invoke(Operation::Repr)?)
    }

    fn truthy(&self) -> Result<bool> {
        expect_bool(self.invoke(Operation::Bool)?)
    }

    fn hash(&self) -> Result<i64> {
        let value = self.invoke(Operation::Hash)?;
        value.as_i64().ok_or_else(|| unexpected("a hash", &value))
    }

    /// Materialize the remote object's iteration
    fn iter(&self) -> Result<Vec<RemoteValue>> {
        match self.invoke(Operation::Iter)? {
            RemoteValue::Items(items) => Ok(items),
            other => Err(unexpected("iteration items", &other)),
        }
    }

    fn enter(&self) -> Result<RemoteValue> {
        self.invoke(Operation::Enter)
    }

    fn exit(&self) -> Result<()> {
        self.invoke(Operation::Exit).map(|_| ())
    }

    /// Run `f` between `enter` and `exit`
    ///
    /// `exit` runs even when `f` fails; the error from `f` wins over one
    /// from `exit`.
    fn scoped<T, F>(&self, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(RemoteValue) -> Result<T>,
    {
        let entered = self.enter()?;
        match f(entered) {
            Ok(value) => {
                self.exit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(exit_err) = self.exit() {
                    debug!("Ignoring exit failure after scoped error: {}", exit_err);
                }
                Err(e)
            }
        }
    }
}
