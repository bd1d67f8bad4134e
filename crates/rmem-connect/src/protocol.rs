//! Values exchanged with the remote endpoint
//!
//! Data travels as [`serde_json::Value`]. Scalars (null, booleans, numbers,
//! strings) are passed by value; everything else stays in the endpoint's
//! memory and is referred to through a [`RemoteRef`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Version negotiated during the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Handle to an object living in the remote endpoint's memory
///
/// Carries no local identity beyond the endpoint-assigned id. Dropping it
/// never frees the remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Endpoint-assigned object id
    pub id: u64,
    /// Remote type name, for diagnostics only
    pub type_name: String,
}

impl RemoteRef {
    pub fn new(id: u64, type_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
        }
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<remote {} #{}>", self.type_name, self.id)
    }
}

/// Argument passed to the remote side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    /// Plain data, materialized on the remote side
    Value(Value),
    /// An object already living on the remote side
    Ref(RemoteRef),
}

impl Arg {
    pub fn as_ref(&self) -> Option<&RemoteRef> {
        match self {
            Arg::Ref(r) => Some(r),
            Arg::Value(_) => None,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<RemoteRef> for Arg {
    fn from(r: RemoteRef) -> Self {
        Arg::Ref(r)
    }
}

impl From<&RemoteRef> for Arg {
    fn from(r: &RemoteRef) -> Self {
        Arg::Ref(r.clone())
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Value(Value::Bool(v))
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Value(Value::String(v.to_string()))
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Value(Value::String(v))
    }
}

/// Result of a remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Value(Value),
    Ref(RemoteRef),
    /// Materialized iteration
    Items(Vec<Reply>),
}

/// Answer to a create-if-absent reservation
///
/// `Granted` maps the key to a placeholder; only the holder of the token may
/// fill it (or release it). `Taken` carries the object the key already maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reservation {
    Granted { token: u64 },
    Taken(RemoteRef),
}

/// Binary operators understood by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::TrueDiv => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
        }
    }
}

/// Unary operators understood by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
}

/// Rich comparisons, evaluated with the remote object's semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Closed set of operations that can be forwarded to a remote object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    GetAttr(String),
    SetAttr(String, Arg),
    DelAttr(String),
    Call(Vec<Arg>),
    GetItem(Arg),
    SetItem(Arg, Arg),
    DelItem(Arg),
    Contains(Arg),
    Binary(BinaryOp, Arg),
    Unary(UnaryOp),
    Compare(CompareOp, Arg),
    Len,
    Str,
    Repr,
    Bool,
    Hash,
    Iter,
    /// Begin scoped use (context-manager enter)
    Enter,
    /// End scoped use (context-manager exit)
    Exit,
}

impl Operation {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetAttr(_) => "getattr",
            Operation::SetAttr(..) => "setattr",
            Operation::DelAttr(_) => "delattr",
            Operation::Call(_) => "call",
            Operation::GetItem(_) => "getitem",
            Operation::SetItem(..) => "setitem",
            Operation::DelItem(_) => "delitem",
            Operation::Contains(_) => "contains",
            Operation::Binary(..) => "binary",
            Operation::Unary(_) => "unary",
            Operation::Compare(..) => "compare",
            Operation::Len => "len",
            Operation::Str => "str",
            Operation::Repr => "repr",
            Operation::Bool => "bool",
            Operation::Hash => "hash",
            Operation::Iter => "iter",
            Operation::Enter => "enter",
            Operation::Exit => "exit",
        }
    }
}
