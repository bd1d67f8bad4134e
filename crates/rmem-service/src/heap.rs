//! Object heap of the registry endpoint
//!
//! Every object the endpoint hands out by reference lives here until the
//! service is dropped; there is no collection of unreachable objects. The one
//! exception is a reservation placeholder, freed once it is filled or released.
//! Scalars stored inside containers are kept inline.
//!
//! Semantics follow the usual dynamic-language conventions: integers and
//! floats mix freely, strings and lists concatenate with `+`, bound methods
//! are first-class objects, and a lock supports scoped use.

use rmem_connect::{
    Arg, BinaryOp, CompareOp, Operation, RemoteError, RemoteErrorKind, RemoteRef, Reply, UnaryOp,
};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

pub type ObjectId = u64;

type OpResult<T> = Result<T, RemoteError>;

const MAX_RENDER_DEPTH: usize = 32;

const LIST_METHODS: &[&str] = &["append", "extend", "pop", "insert", "index", "clear"];
const DICT_METHODS: &[&str] = &["get", "keys", "pop", "clear"];
const STR_METHODS: &[&str] = &["upper", "lower"];
const LOCK_METHODS: &[&str] = &["acquire", "release", "locked"];

fn error(kind: RemoteErrorKind, message: impl Into<String>) -> RemoteError {
    RemoteError::new(kind, message)
}

fn type_error(message: impl Into<String>) -> RemoteError {
    error(RemoteErrorKind::Type, message)
}

fn none() -> Reply {
    Reply::Value(Value::Null)
}

/// An element stored inside a container
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Inline scalar
    Value(Value),
    /// Reference to another heap object
    Object(ObjectId),
}

/// Callables exposed by the built-in modules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    List,
    Dict,
    Lock,
}

impl Builtin {
    fn name(&self) -> &'static str {
        match self {
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Lock => "Lock",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Object {
    Scalar(Value),
    List(Vec<Slot>),
    Dict(BTreeMap<String, Slot>),
    Module {
        name: String,
        attrs: BTreeMap<String, Slot>,
    },
    Builtin(Builtin),
    Method {
        owner: ObjectId,
        name: String,
    },
    Lock {
        held: bool,
    },
    /// Stands in for an object whose creator holds a reservation
    Pending,
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Scalar(v) => value_type_name(v),
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Module { .. } => "module",
            Object::Builtin(_) => "type",
            Object::Method { .. } => "method",
            Object::Lock { .. } => "lock",
            Object::Pending => "pending",
        }
    }

    fn method_names(&self) -> &'static [&'static str] {
        match self {
            Object::List(_) => LIST_METHODS,
            Object::Dict(_) => DICT_METHODS,
            Object::Scalar(Value::String(_)) => STR_METHODS,
            Object::Lock { .. } => LOCK_METHODS,
            _ => &[],
        }
    }

    fn is_data(&self) -> bool {
        matches!(self, Object::Scalar(_) | Object::List(_) | Object::Dict(_))
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

// ═══════════════════════════════════════════════════════════════════════════
// Numbers
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .map(Num::Int)
                .or_else(|| n.as_f64().map(Num::Float)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn is_zero(self) -> bool {
        self.as_f64() == 0.0
    }

    fn into_value(self) -> OpResult<Value> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| error(RemoteErrorKind::Value, "float result is not finite")),
        }
    }
}

fn overflow() -> RemoteError {
    error(RemoteErrorKind::Value, "integer overflow")
}

fn floor_div(a: i64, b: i64) -> OpResult<i64> {
    let q = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

fn numeric(op: BinaryOp, a: Num, b: Num) -> OpResult<Num> {
    use Num::{Float, Int};

    let zero_check = |what: &str| {
        if b.is_zero() {
            Err(error(
                RemoteErrorKind::ZeroDivision,
                format!("{} by zero", what),
            ))
        } else {
            Ok(())
        }
    };

    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => match (a, b) {
            (Int(x), Int(y)) => {
                let r = match op {
                    BinaryOp::Add => x.checked_add(y),
                    BinaryOp::Sub => x.checked_sub(y),
                    _ => x.checked_mul(y),
                };
                r.map(Int).ok_or_else(overflow)
            }
            _ => {
                let (x, y) = (a.as_f64(), b.as_f64());
                Ok(Float(match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    _ => x * y,
                }))
            }
        },
        BinaryOp::TrueDiv => {
            zero_check("division")?;
            Ok(Float(a.as_f64() / b.as_f64()))
        }
        BinaryOp::FloorDiv => {
            zero_check("integer division")?;
            match (a, b) {
                (Int(x), Int(y)) => floor_div(x, y).map(Int),
                _ => Ok(Float((a.as_f64() / b.as_f64()).floor())),
            }
        }
        BinaryOp::Mod => {
            zero_check("modulo")?;
            match (a, b) {
                (Int(x), Int(y)) => Ok(Int(floor_mod(x, y))),
                _ => {
                    let (x, y) = (a.as_f64(), b.as_f64());
                    let r = x % y;
                    Ok(Float(if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                        r + y
                    } else {
                        r
                    }))
                }
            }
        }
        BinaryOp::Pow => match (a, b) {
            (Int(x), Int(y)) if y >= 0 => {
                let exp = u32::try_from(y).map_err(|_| overflow())?;
                x.checked_pow(exp).map(Int).ok_or_else(overflow)
            }
            _ => Ok(Float(a.as_f64().powf(b.as_f64()))),
        },
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> OpResult<Value> {
    match (op, &lhs, &rhs) {
        (BinaryOp::Add, Value::String(a), Value::String(b)) => {
            return Ok(Value::String(format!("{}{}", a, b)))
        }
        (BinaryOp::Add, Value::Array(a), Value::Array(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            return Ok(Value::Array(joined));
        }
        _ => {}
    }

    match (Num::of(&lhs), Num::of(&rhs)) {
        (Some(a), Some(b)) => numeric(op, a, b)?.into_value(),
        _ => Err(type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            value_type_name(&lhs),
            value_type_name(&rhs)
        ))),
    }
}

/// Equality with numeric coercion (`1 == 1.0`, `True == 1`)
fn data_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
        return match (x, y) {
            (Num::Int(x), Num::Int(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        };
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| data_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| data_eq(v, other)))
        }
        _ => false,
    }
}

fn data_cmp(op: CompareOp, a: &Value, b: &Value) -> OpResult<Ordering> {
    if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
        return Ok(match (x, y) {
            (Num::Int(x), Num::Int(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        });
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            value_type_name(a),
            value_type_name(b)
        ))),
    }
}

fn compare_values(op: CompareOp, a: &Value, b: &Value) -> OpResult<bool> {
    Ok(match op {
        CompareOp::Eq => data_eq(a, b),
        CompareOp::Ne => !data_eq(a, b),
        CompareOp::Lt => data_cmp(op, a, b)? == Ordering::Less,
        CompareOp::Le => data_cmp(op, a, b)? != Ordering::Greater,
        CompareOp::Gt => data_cmp(op, a, b)? == Ordering::Greater,
        CompareOp::Ge => data_cmp(op, a, b)? != Ordering::Less,
    })
}

fn truthy_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => Num::of(value).is_some_and(|n| !n.is_zero()),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn render_value(value: &Value, repr: bool, out: &mut String) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) if repr => out.push_str(&quote(s)),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_value(item, true, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&quote(k));
                out.push_str(": ");
                render_value(v, true, out);
            }
            out.push('}');
        }
    }
}

fn hash_scalar(value: &Value) -> OpResult<i64> {
    let mut hasher = DefaultHasher::new();
    match Num::of(value) {
        Some(Num::Int(i)) => i.hash(&mut hasher),
        // Integral floats hash like the equal integer
        Some(Num::Float(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).hash(&mut hasher),
        Some(Num::Float(f)) => f.to_bits().hash(&mut hasher),
        None => match value {
            Value::Null => 0u8.hash(&mut hasher),
            Value::String(s) => s.hash(&mut hasher),
            other => {
                return Err(type_error(format!(
                    "unhashable type: '{}'",
                    value_type_name(other)
                )))
            }
        },
    }
    Ok(hasher.finish() as i64)
}

fn normalize_index(index: i64, len: usize, what: &str) -> OpResult<usize> {
    let len_i = i64::try_from(len).map_err(|_| overflow())?;
    let resolved = if index < 0 { index + len_i } else { index };
    if resolved < 0 || resolved >= len_i {
        return Err(error(
            RemoteErrorKind::Index,
            format!("{} index out of range", what),
        ));
    }
    Ok(resolved as usize)
}

fn expect_args(args: &[Arg], min: usize, max: usize, name: &str) -> OpResult<()> {
    if args.len() < min || args.len() > max {
        return Err(type_error(format!(
            "{}() takes {} to {} arguments ({} given)",
            name,
            min,
            max,
            args.len()
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Heap
// ═══════════════════════════════════════════════════════════════════════════

/// Object storage plus the operation semantics of the endpoint
#[derive(Debug, Default)]
pub struct Heap {
    objects: HashMap<ObjectId, Object>,
    modules: HashMap<String, ObjectId>,
    /// Bound methods already handed out, per owner and name
    methods: HashMap<(ObjectId, String), ObjectId>,
    next_id: ObjectId,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: Object) -> ObjectId {
        self.next_id += 1;
        self.objects.insert(self.next_id, object);
        self.next_id
    }

    /// Free a reservation placeholder; other objects are never freed
    pub fn free_placeholder(&mut self, id: ObjectId) -> bool {
        if !matches!(self.objects.get(&id), Some(Object::Pending)) {
            return false;
        }
        self.objects.remove(&id);
        true
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> OpResult<&Object> {
        self.objects.get(&id).ok_or_else(|| {
            error(
                RemoteErrorKind::Runtime,
                format!("stale reference to object #{}", id),
            )
        })
    }

    fn get_mut(&mut self, id: ObjectId) -> OpResult<&mut Object> {
        self.objects.get_mut(&id).ok_or_else(|| {
            error(
                RemoteErrorKind::Runtime,
                format!("stale reference to object #{}", id),
            )
        })
    }

    pub fn remote_ref(&self, id: ObjectId) -> OpResult<RemoteRef> {
        Ok(RemoteRef::new(id, self.get(id)?.type_name()))
    }

    /// Namespace object for `module`, created on first import
    pub fn import(&mut self, module: &str) -> OpResult<ObjectId> {
        if let Some(id) = self.modules.get(module) {
            return Ok(*id);
        }

        let builtins: &[Builtin] = match module {
            "builtins" => &[Builtin::List, Builtin::Dict],
            "threading" => &[Builtin::Lock],
            _ => {
                return Err(error(
                    RemoteErrorKind::Import,
                    format!("No module named '{}'", module),
                ))
            }
        };

        let mut attrs = BTreeMap::new();
        for builtin in builtins {
            let id = self.alloc(Object::Builtin(*builtin));
            attrs.insert(builtin.name().to_string(), Slot::Object(id));
        }
        let id = self.alloc(Object::Module {
            name: module.to_string(),
            attrs,
        });
        self.modules.insert(module.to_string(), id);
        Ok(id)
    }

    /// Turn an argument into something storable in a container
    pub fn materialize(&mut self, arg: &Arg) -> OpResult<Slot> {
        match arg {
            Arg::Ref(r) => match self.get(r.id)? {
                Object::Pending => Err(error(
                    RemoteErrorKind::Runtime,
                    format!("object #{} is still being created", r.id),
                )),
                _ => Ok(Slot::Object(r.id)),
            },
            Arg::Value(v) => Ok(self.materialize_value(v.clone())),
        }
    }

    fn materialize_value(&mut self, value: Value) -> Slot {
        match value {
            Value::Array(items) => {
                let slots = items
                    .into_iter()
                    .map(|item| self.materialize_value(item))
                    .collect();
                Slot::Object(self.alloc(Object::List(slots)))
            }
            Value::Object(map) => {
                let slots = map
                    .into_iter()
                    .map(|(k, v)| (k, self.materialize_value(v)))
                    .collect();
                Slot::Object(self.alloc(Object::Dict(slots)))
            }
            scalar => Slot::Value(scalar),
        }
    }

    /// Heap object for an argument, allocating scalars on demand
    pub fn store(&mut self, arg: &Arg) -> OpResult<ObjectId> {
        match self.materialize(arg)? {
            Slot::Object(id) => Ok(id),
            Slot::Value(v) => Ok(self.alloc(Object::Scalar(v))),
        }
    }

    pub fn reply(&self, slot: &Slot) -> OpResult<Reply> {
        match slot {
            Slot::Value(v) => Ok(Reply::Value(v.clone())),
            Slot::Object(id) => match self.get(*id)? {
                Object::Scalar(v) => Ok(Reply::Value(v.clone())),
                _ => self.remote_ref(*id).map(Reply::Ref),
            },
        }
    }

    fn value_reply(&mut self, value: Value) -> OpResult<Reply> {
        if is_scalar(&value) {
            return Ok(Reply::Value(value));
        }
        let slot = self.materialize_value(value);
        self.reply(&slot)
    }

    fn arg_reply(&mut self, arg: &Arg) -> OpResult<Reply> {
        let slot = self.materialize(arg)?;
        self.reply(&slot)
    }

    /// Deep copy of a data object as JSON
    pub fn snapshot(&self, slot: &Slot) -> OpResult<Value> {
        match slot {
            Slot::Value(v) => Ok(v.clone()),
            Slot::Object(id) => match self.get(*id)? {
                Object::Scalar(v) => Ok(v.clone()),
                Object::List(items) => items
                    .iter()
                    .map(|item| self.snapshot(item))
                    .collect::<OpResult<Vec<_>>>()
                    .map(Value::Array),
                Object::Dict(map) => map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.snapshot(v)?)))
                    .collect::<OpResult<serde_json::Map<_, _>>>()
                    .map(Value::Object),
                other => Err(type_error(format!(
                    "'{}' object is not plain data",
                    other.type_name()
                ))),
            },
        }
    }

    fn arg_snapshot(&self, arg: &Arg) -> OpResult<Value> {
        match arg {
            Arg::Value(v) => Ok(v.clone()),
            Arg::Ref(r) => self.snapshot(&Slot::Object(r.id)),
        }
    }

    fn arg_int(&self, arg: &Arg) -> OpResult<i64> {
        let value = self.arg_snapshot(arg)?;
        match Num::of(&value) {
            Some(Num::Int(i)) => Ok(i),
            _ => Err(type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                value_type_name(&value)
            ))),
        }
    }

    fn arg_str(&self, arg: &Arg) -> OpResult<String> {
        match self.arg_snapshot(arg)? {
            Value::String(s) => Ok(s),
            other => Err(type_error(format!(
                "expected str, got '{}'",
                value_type_name(&other)
            ))),
        }
    }

    pub fn render(&self, slot: &Slot, repr: bool) -> OpResult<String> {
        let mut out = String::new();
        self.render_into(slot, repr, 0, &mut out)?;
        Ok(out)
    }

    fn render_into(&self, slot: &Slot, repr: bool, depth: usize, out: &mut String) -> OpResult<()> {
        if depth > MAX_RENDER_DEPTH {
            out.push_str("...");
            return Ok(());
        }
        let id = match slot {
            Slot::Value(v) => {
                render_value(v, repr, out);
                return Ok(());
            }
            Slot::Object(id) => *id,
        };

        match self.get(id)? {
            Object::Scalar(v) => render_value(v, repr, out),
            Object::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(item, true, depth + 1, out)?;
                }
                out.push(']');
            }
            Object::Dict(map) => {
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&quote(k));
                    out.push_str(": ");
                    self.render_into(v, true, depth + 1, out)?;
                }
                out.push('}');
            }
            Object::Module { name, .. } => out.push_str(&format!("<module '{}'>", name)),
            Object::Builtin(b) => out.push_str(&format!("<class '{}'>", b.name())),
            Object::Method { owner, name } => {
                let owner_type = self.get(*owner).map(Object::type_name).unwrap_or("object");
                out.push_str(&format!(
                    "<built-in method {} of {} object>",
                    name, owner_type
                ));
            }
            Object::Lock { held: true } => out.push_str("<locked lock>"),
            Object::Lock { held: false } => out.push_str("<unlocked lock>"),
            Object::Pending => out.push_str("<pending object>"),
        }
        Ok(())
    }

    fn truthy(&self, id: ObjectId) -> OpResult<bool> {
        Ok(match self.get(id)? {
            Object::Scalar(v) => truthy_value(v),
            Object::List(items) => !items.is_empty(),
            Object::Dict(map) => !map.is_empty(),
            _ => true,
        })
    }

    fn len_of(&self, id: ObjectId) -> OpResult<usize> {
        match self.get(id)? {
            Object::List(items) => Ok(items.len()),
            Object::Dict(map) => Ok(map.len()),
            Object::Scalar(Value::String(s)) => Ok(s.chars().count()),
            other => Err(type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }

    /// Element slots of anything iterable
    fn iter_slots(&mut self, arg: &Arg) -> OpResult<Vec<Slot>> {
        if let Arg::Ref(r) = arg {
            match self.get(r.id)? {
                Object::List(items) => return Ok(items.clone()),
                Object::Dict(map) => {
                    return Ok(map.keys().map(|k| Slot::Value(Value::String(k.clone()))).collect())
                }
                Object::Scalar(_) => {}
                other => {
                    return Err(type_error(format!(
                        "'{}' object is not iterable",
                        other.type_name()
                    )))
                }
            }
        }

        match self.arg_snapshot(arg)? {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|item| self.materialize_value(item))
                .collect()),
            Value::Object(map) => Ok(map.into_iter().map(|(k, _)| Slot::Value(Value::String(k))).collect()),
            other => Err(type_error(format!(
                "'{}' object is not iterable",
                value_type_name(&other)
            ))),
        }
    }

    fn list_mut(&mut self, id: ObjectId) -> OpResult<&mut Vec<Slot>> {
        match self.get_mut(id)? {
            Object::List(items) => Ok(items),
            other => Err(type_error(format!(
                "expected list, got '{}'",
                other.type_name()
            ))),
        }
    }

    fn dict_mut(&mut self, id: ObjectId) -> OpResult<&mut BTreeMap<String, Slot>> {
        match self.get_mut(id)? {
            Object::Dict(map) => Ok(map),
            other => Err(type_error(format!(
                "expected dict, got '{}'",
                other.type_name()
            ))),
        }
    }

    fn new_list(&mut self, slots: Vec<Slot>) -> OpResult<Reply> {
        let id = self.alloc(Object::List(slots));
        self.remote_ref(id).map(Reply::Ref)
    }

    /// Index of the first element equal to `needle`
    fn position(&self, id: ObjectId, needle: &Value) -> OpResult<Option<usize>> {
        let items = match self.get(id)? {
            Object::List(items) => items,
            other => {
                return Err(type_error(format!(
                    "expected list, got '{}'",
                    other.type_name()
                )))
            }
        };
        for (i, item) in items.iter().enumerate() {
            if self.snapshot(item).is_ok_and(|v| data_eq(&v, needle)) {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operation dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Perform `op` on object `id`
    pub fn invoke(&mut self, id: ObjectId, op: Operation) -> OpResult<Reply> {
        if let Object::Pending = self.get(id)? {
            return Err(error(
                RemoteErrorKind::Runtime,
                format!("object #{} is still being created", id),
            ));
        }
        let target = Slot::Object(id);
        match op {
            Operation::GetAttr(name) => self.get_attr(id, &name),
            Operation::SetAttr(name, value) => self.set_attr(id, name, &value),
            Operation::DelAttr(name) => self.del_attr(id, &name),
            Operation::Call(args) => self.call(id, &args),
            Operation::GetItem(index) => self.get_item(id, &index),
            Operation::SetItem(index, value) => self.set_item(id, &index, &value),
            Operation::DelItem(index) => self.del_item(id, &index),
            Operation::Contains(item) => self.contains(id, &item).map(|b| Reply::Value(Value::Bool(b))),
            Operation::Binary(op, rhs) => {
                let lhs = self.snapshot(&target)?;
                let rhs = self.arg_snapshot(&rhs)?;
                let result = binary(op, lhs, rhs)?;
                self.value_reply(result)
            }
            Operation::Unary(op) => self.unary(id, op),
            Operation::Compare(op, rhs) => self.compare(id, op, &rhs),
            Operation::Len => self
                .len_of(id)
                .map(|n| Reply::Value(Value::from(n as u64))),
            Operation::Str => self
                .render(&target, false)
                .map(|s| Reply::Value(Value::String(s))),
            Operation::Repr => self
                .render(&target, true)
                .map(|s| Reply::Value(Value::String(s))),
            Operation::Bool => self.truthy(id).map(|b| Reply::Value(Value::Bool(b))),
            Operation::Hash => self.hash_of(id),
            Operation::Iter => self.iterate(id),
            Operation::Enter => self.enter(id),
            Operation::Exit => self.exit(id),
        }
    }

    fn get_attr(&mut self, id: ObjectId, name: &str) -> OpResult<Reply> {
        let object = self.get(id)?;
        if let Object::Module { name: module, attrs } = object {
            let slot = attrs.get(name).cloned().ok_or_else(|| {
                error(
                    RemoteErrorKind::Attribute,
                    format!("module '{}' has no attribute '{}'", module, name),
                )
            })?;
            return self.reply(&slot);
        }
        if !object.method_names().contains(&name) {
            return Err(error(
                RemoteErrorKind::Attribute,
                format!("'{}' object has no attribute '{}'", object.type_name(), name),
            ));
        }

        let key = (id, name.to_string());
        let method = match self.methods.get(&key).copied() {
            Some(method) => method,
            None => {
                let method = self.alloc(Object::Method {
                    owner: id,
                    name: name.to_string(),
                });
                self.methods.insert(key, method);
                method
            }
        };
        self.remote_ref(method).map(Reply::Ref)
    }

    fn set_attr(&mut self, id: ObjectId, name: String, value: &Arg) -> OpResult<Reply> {
        let slot = self.materialize(value)?;
        match self.get_mut(id)? {
            Object::Module { attrs, .. } => {
                attrs.insert(name, slot);
                Ok(none())
            }
            other => Err(error(
                RemoteErrorKind::Attribute,
                format!("'{}' object attribute '{}' is read-only", other.type_name(), name),
            )),
        }
    }

    fn del_attr(&mut self, id: ObjectId, name: &str) -> OpResult<Reply> {
        match self.get_mut(id)? {
            Object::Module { name: module, attrs } => match attrs.remove(name) {
                Some(_) => Ok(none()),
                None => Err(error(
                    RemoteErrorKind::Attribute,
                    format!("module '{}' has no attribute '{}'", module, name),
                )),
            },
            other => Err(error(
                RemoteErrorKind::Attribute,
                format!("'{}' object attribute '{}' is read-only", other.type_name(), name),
            )),
        }
    }

    fn call(&mut self, id: ObjectId, args: &[Arg]) -> OpResult<Reply> {
        match self.get(id)? {
            Object::Builtin(builtin) => {
                let builtin = *builtin;
                self.call_builtin(builtin, args)
            }
            Object::Method { owner, name } => {
                let (owner, name) = (*owner, name.clone());
                self.call_method(owner, &name, args)
            }
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: &[Arg]) -> OpResult<Reply> {
        let name = builtin.name();
        match builtin {
            Builtin::List => {
                expect_args(args, 0, 1, name)?;
                let slots = match args.first() {
                    Some(arg) => self.iter_slots(arg)?,
                    None => Vec::new(),
                };
                self.new_list(slots)
            }
            Builtin::Dict => {
                expect_args(args, 0, 1, name)?;
                let map = match args.first() {
                    None => BTreeMap::new(),
                    Some(arg) => self.dict_source(arg)?,
                };
                let id = self.alloc(Object::Dict(map));
                self.remote_ref(id).map(Reply::Ref)
            }
            Builtin::Lock => {
                expect_args(args, 0, 0, name)?;
                let id = self.alloc(Object::Lock { held: false });
                self.remote_ref(id).map(Reply::Ref)
            }
        }
    }

    fn dict_source(&mut self, arg: &Arg) -> OpResult<BTreeMap<String, Slot>> {
        if let Arg::Ref(r) = arg {
            if let Object::Dict(map) = self.get(r.id)? {
                return Ok(map.clone());
            }
        }
        match self.arg_snapshot(arg)? {
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| (k, self.materialize_value(v)))
                .collect()),
            other => Err(type_error(format!(
                "'{}' object is not a mapping",
                value_type_name(&other)
            ))),
        }
    }

    fn call_method(&mut self, owner: ObjectId, name: &str, args: &[Arg]) -> OpResult<Reply> {
        match self.get(owner)? {
            Object::List(_) => self.list_method(owner, name, args),
            Object::Dict(_) => self.dict_method(owner, name, args),
            Object::Scalar(Value::String(s)) => {
                let s = s.clone();
                self.str_method(&s, name, args)
            }
            Object::Lock { .. } => self.lock_method(owner, name, args),
            other => Err(type_error(format!(
                "'{}' object has no methods",
                other.type_name()
            ))),
        }
    }

    fn list_method(&mut self, owner: ObjectId, name: &str, args: &[Arg]) -> OpResult<Reply> {
        match name {
            "append" => {
                expect_args(args, 1, 1, name)?;
                let slot = self.materialize(&args[0])?;
                self.list_mut(owner)?.push(slot);
                Ok(none())
            }
            "extend" => {
                expect_args(args, 1, 1, name)?;
                let slots = self.iter_slots(&args[0])?;
                self.list_mut(owner)?.extend(slots);
                Ok(none())
            }
            "pop" => {
                expect_args(args, 0, 1, name)?;
                let index = match args.first() {
                    Some(arg) => self.arg_int(arg)?,
                    None => -1,
                };
                let items = self.list_mut(owner)?;
                if items.is_empty() {
                    return Err(error(RemoteErrorKind::Index, "pop from empty list"));
                }
                let i = normalize_index(index, items.len(), "pop")?;
                let slot = items.remove(i);
                self.reply(&slot)
            }
            "insert" => {
                expect_args(args, 2, 2, name)?;
                let index = self.arg_int(&args[0])?;
                let slot = self.materialize(&args[1])?;
                let items = self.list_mut(owner)?;
                let len = items.len() as i64;
                let at = if index < 0 {
                    (index + len).max(0)
                } else {
                    index.min(len)
                };
                items.insert(at as usize, slot);
                Ok(none())
            }
            "index" => {
                expect_args(args, 1, 1, name)?;
                let needle = self.arg_snapshot(&args[0])?;
                match self.position(owner, &needle)? {
                    Some(i) => Ok(Reply::Value(Value::from(i as u64))),
                    None => Err(error(RemoteErrorKind::Value, "x is not in list")),
                }
            }
            "clear" => {
                expect_args(args, 0, 0, name)?;
                self.list_mut(owner)?.clear();
                Ok(none())
            }
            _ => Err(error(
                RemoteErrorKind::Attribute,
                format!("'list' object has no attribute '{}'", name),
            )),
        }
    }

    fn dict_method(&mut self, owner: ObjectId, name: &str, args: &[Arg]) -> OpResult<Reply> {
        match name {
            "get" => {
                expect_args(args, 1, 2, name)?;
                let key = self.arg_str(&args[0])?;
                match self.dict_mut(owner)?.get(&key).cloned() {
                    Some(slot) => self.reply(&slot),
                    None => match args.get(1) {
                        Some(default) => self.arg_reply(default),
                        None => Ok(none()),
                    },
                }
            }
            "keys" => {
                expect_args(args, 0, 0, name)?;
                let keys = self
                    .dict_mut(owner)?
                    .keys()
                    .map(|k| Slot::Value(Value::String(k.clone())))
                    .collect();
                self.new_list(keys)
            }
            "pop" => {
                expect_args(args, 1, 2, name)?;
                let key = self.arg_str(&args[0])?;
                match self.dict_mut(owner)?.remove(&key) {
                    Some(slot) => self.reply(&slot),
                    None => match args.get(1) {
                        Some(default) => self.arg_reply(default),
                        None => Err(error(RemoteErrorKind::Key, quote(&key))),
                    },
                }
            }
            "clear" => {
                expect_args(args, 0, 0, name)?;
                self.dict_mut(owner)?.clear();
                Ok(none())
            }
            _ => Err(error(
                RemoteErrorKind::Attribute,
                format!("'dict' object has no attribute '{}'", name),
            )),
        }
    }

    fn str_method(&self, s: &str, name: &str, args: &[Arg]) -> OpResult<Reply> {
        let text = |t: String| -> OpResult<Reply> { Ok(Reply::Value(Value::String(t))) };
        match name {
            "upper" => {
                expect_args(args, 0, 0, name)?;
                text(s.to_uppercase())
            }
            "lower" => {
                expect_args(args, 0, 0, name)?;
                text(s.to_lowercase())
            }
            _ => Err(error(
                RemoteErrorKind::Attribute,
                format!("'str' object has no attribute '{}'", name),
            )),
        }
    }

    fn lock_method(&mut self, owner: ObjectId, name: &str, args: &[Arg]) -> OpResult<Reply> {
        expect_args(args, 0, 0, name)?;
        let held = match self.get_mut(owner)? {
            Object::Lock { held } => held,
            other => {
                return Err(type_error(format!(
                    "expected lock, got '{}'",
                    other.type_name()
                )))
            }
        };
        match name {
            // Non-blocking: the endpoint serves every client from one thread of control
            "acquire" => {
                let acquired = !*held;
                *held = true;
                Ok(Reply::Value(Value::Bool(acquired)))
            }
            "release" => {
                if !*held {
                    return Err(error(RemoteErrorKind::Runtime, "release unlocked lock"));
                }
                *held = false;
                Ok(none())
            }
            "locked" => Ok(Reply::Value(Value::Bool(*held))),
            _ => Err(error(
                RemoteErrorKind::Attribute,
                format!("'lock' object has no attribute '{}'", name),
            )),
        }
    }

    fn get_item(&mut self, id: ObjectId, index: &Arg) -> OpResult<Reply> {
        let slot = match self.get(id)? {
            Object::List(items) => {
                let i = normalize_index(self.arg_int(index)?, items.len(), "list")?;
                items[i].clone()
            }
            Object::Dict(map) => {
                let key = self.arg_str(index)?;
                map.get(&key)
                    .cloned()
                    .ok_or_else(|| error(RemoteErrorKind::Key, quote(&key)))?
            }
            other => {
                return Err(type_error(format!(
                    "'{}' object is not subscriptable",
                    other.type_name()
                )))
            }
        };
        self.reply(&slot)
    }

    fn set_item(&mut self, id: ObjectId, index: &Arg, value: &Arg) -> OpResult<Reply> {
        let type_name = self.get(id)?.type_name();
        match type_name {
            "list" => {
                let index = self.arg_int(index)?;
                let slot = self.materialize(value)?;
                let items = self.list_mut(id)?;
                let i = normalize_index(index, items.len(), "list assignment")?;
                items[i] = slot;
            }
            "dict" => {
                let key = self.arg_str(index)?;
                let slot = self.materialize(value)?;
                self.dict_mut(id)?.insert(key, slot);
            }
            other => {
                return Err(type_error(format!(
                    "'{}' object does not support item assignment",
                    other
                )))
            }
        }
        Ok(none())
    }

    fn del_item(&mut self, id: ObjectId, index: &Arg) -> OpResult<Reply> {
        let type_name = self.get(id)?.type_name();
        match type_name {
            "list" => {
                let index = self.arg_int(index)?;
                let items = self.list_mut(id)?;
                let i = normalize_index(index, items.len(), "list assignment")?;
                items.remove(i);
            }
            "dict" => {
                let key = self.arg_str(index)?;
                if self.dict_mut(id)?.remove(&key).is_none() {
                    return Err(error(RemoteErrorKind::Key, quote(&key)));
                }
            }
            other => {
                return Err(type_error(format!(
                    "'{}' object does not support item deletion",
                    other
                )))
            }
        }
        Ok(none())
    }

    fn contains(&self, id: ObjectId, item: &Arg) -> OpResult<bool> {
        let needle = self.arg_snapshot(item)?;
        match self.get(id)? {
            Object::List(_) => Ok(self.position(id, &needle)?.is_some()),
            Object::Dict(map) => Ok(match &needle {
                Value::String(k) => map.contains_key(k),
                _ => false,
            }),
            Object::Scalar(Value::String(s)) => match &needle {
                Value::String(sub) => Ok(s.contains(sub.as_str())),
                other => Err(type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    value_type_name(other)
                ))),
            },
            other => Err(type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    fn unary(&mut self, id: ObjectId, op: UnaryOp) -> OpResult<Reply> {
        let value = self.snapshot(&Slot::Object(id))?;
        let num = Num::of(&value).ok_or_else(|| {
            type_error(format!(
                "bad operand type for unary operation: '{}'",
                value_type_name(&value)
            ))
        })?;
        let result = match (op, num) {
            (UnaryOp::Neg, Num::Int(i)) => Num::Int(i.checked_neg().ok_or_else(overflow)?),
            (UnaryOp::Neg, Num::Float(f)) => Num::Float(-f),
            (UnaryOp::Abs, Num::Int(i)) => Num::Int(i.checked_abs().ok_or_else(overflow)?),
            (UnaryOp::Abs, Num::Float(f)) => Num::Float(f.abs()),
        };
        result.into_value().map(Reply::Value)
    }

    fn compare(&self, id: ObjectId, op: CompareOp, rhs: &Arg) -> OpResult<Reply> {
        let both_data = self.get(id)?.is_data()
            && match rhs {
                Arg::Ref(r) => self.get(r.id)?.is_data(),
                Arg::Value(_) => true,
            };

        let result = if both_data {
            let lhs = self.snapshot(&Slot::Object(id))?;
            let rhs = self.arg_snapshot(rhs)?;
            compare_values(op, &lhs, &rhs)?
        } else {
            // Namespaces, callables and locks compare by identity
            let same = rhs.as_ref().is_some_and(|r| r.id == id);
            match op {
                CompareOp::Eq => same,
                CompareOp::Ne => !same,
                _ => {
                    return Err(type_error(format!(
                        "'{}' not supported between instances of '{}'",
                        op.symbol(),
                        self.get(id)?.type_name()
                    )))
                }
            }
        };
        Ok(Reply::Value(Value::Bool(result)))
    }

    fn hash_of(&self, id: ObjectId) -> OpResult<Reply> {
        let hash = match self.get(id)? {
            Object::Scalar(v) => hash_scalar(v)?,
            Object::List(_) | Object::Dict(_) => {
                return Err(type_error(format!(
                    "unhashable type: '{}'",
                    self.get(id)?.type_name()
                )))
            }
            _ => {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                hasher.finish() as i64
            }
        };
        Ok(Reply::Value(Value::from(hash)))
    }

    fn iterate(&self, id: ObjectId) -> OpResult<Reply> {
        let items = match self.get(id)? {
            Object::List(items) => items
                .iter()
                .map(|item| self.reply(item))
                .collect::<OpResult<Vec<_>>>()?,
            Object::Dict(map) => map
                .keys()
                .map(|k| Reply::Value(Value::String(k.clone())))
                .collect(),
            other => {
                return Err(type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        };
        Ok(Reply::Items(items))
    }

    fn enter(&mut self, id: ObjectId) -> OpResult<Reply> {
        match self.get_mut(id)? {
            Object::Lock { held } => {
                if *held {
                    return Err(error(RemoteErrorKind::Runtime, "lock is already held"));
                }
                *held = true;
                Ok(Reply::Value(Value::Bool(true)))
            }
            other => Err(type_error(format!(
                "'{}' object does not support scoped use",
                other.type_name()
            ))),
        }
    }

    fn exit(&mut self, id: ObjectId) -> OpResult<Reply> {
        match self.get_mut(id)? {
            Object::Lock { held } => {
                if !*held {
                    return Err(error(RemoteErrorKind::Runtime, "release unlocked lock"));
                }
                *held = false;
                Ok(none())
            }
            other => Err(type_error(format!(
                "'{}' object does not support scoped use",
                other.type_name()
            ))),
        }
    }
}
