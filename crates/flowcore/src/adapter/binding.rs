use crate::duration::parse_duration;
use crate::error::ArgumentError;
use crate::{Context, FunctionArguments, Output};
use futures::future::{self, BoxFuture};
use serde::Serialize;
use std::time::Duration;

/// Primitive kind of an argument record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    Int,
    /// Integer that also accepts a duration string (stored as nanoseconds)
    Int64,
    String,
    Float,
    Bool,
}

/// How binding failures are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Any field that cannot be bound fails the call
    Strict,
    /// Required fields must bind; broken optional fields are skipped
    Tolerant,
    /// Nothing fails; used for parameter discovery and suggestions
    Discovery,
}

enum Setter<R> {
    Int(fn(&mut R, i64)),
    Int64(fn(&mut R, i64)),
    Duration(fn(&mut R, Duration)),
    Str(fn(&mut R, String)),
    Float(fn(&mut R, f64)),
    Bool(fn(&mut R, bool)),
}

/// Describes one field of an argument record: name, kind, optionality and
/// how to store a converted value.
pub struct ArgField<R> {
    name: &'static str,
    optional: bool,
    setter: Setter<R>,
}

impl<R> ArgField<R> {
    fn required(name: &'static str, setter: Setter<R>) -> Self {
        Self {
            name,
            optional: false,
            setter,
        }
    }

    pub fn int(name: &'static str, set: fn(&mut R, i64)) -> Self {
        Self::required(name, Setter::Int(set))
    }

    pub fn int64(name: &'static str, set: fn(&mut R, i64)) -> Self {
        Self::required(name, Setter::Int64(set))
    }

    /// 64-bit field exposed to the record as a [`Duration`]
    pub fn duration(name: &'static str, set: fn(&mut R, Duration)) -> Self {
        Self::required(name, Setter::Duration(set))
    }

    pub fn string(name: &'static str, set: fn(&mut R, String)) -> Self {
        Self::required(name, Setter::Str(set))
    }

    pub fn float(name: &'static str, set: fn(&mut R, f64)) -> Self {
        Self::required(name, Setter::Float(set))
    }

    pub fn bool(name: &'static str, set: fn(&mut R, bool)) -> Self {
        Self::required(name, Setter::Bool(set))
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn kind(&self) -> ArgKind {
        match self.setter {
            Setter::Int(_) => ArgKind::Int,
            Setter::Int64(_) | Setter::Duration(_) => ArgKind::Int64,
            Setter::Str(_) => ArgKind::String,
            Setter::Float(_) => ArgKind::Float,
            Setter::Bool(_) => ArgKind::Bool,
        }
    }

    fn apply(&self, record: &mut R, raw: &str) -> Result<(), String> {
        match self.setter {
            Setter::Int(set) => set(record, parse_int(raw)?),
            Setter::Int64(set) => set(record, parse_int64(raw)?),
            Setter::Duration(set) => {
                let nanos = parse_int64(raw)?;
                let nanos = u64::try_from(nanos).map_err(|_| "negative duration".to_string())?;
                set(record, Duration::from_nanos(nanos))
            }
            Setter::Str(set) => set(record, raw.to_string()),
            Setter::Float(set) => set(
                record,
                raw.trim().parse().map_err(|e| format!("{}", e))?,
            ),
            Setter::Bool(set) => set(record, parse_bool(raw)?),
        }
        Ok(())
    }
}

/// Typed argument record bound from the caller's string arguments.
///
/// `O` is the operator the record belongs to; it is handed to the hooks so
/// a record can consult operator state (e.g. list keys of a namespace).
pub trait ArgumentRecord<O: ?Sized>: Default + Send + Sized + 'static {
    fn fields() -> Vec<ArgField<Self>>;

    /// Runs after binding and may reject the combination of values
    fn verify(&self, _operator: &O) -> Result<(), Output> {
        Ok(())
    }

    /// Values to offer for `arg`; `None` defers to the operator and the
    /// generic fallback
    fn suggestions(&self, _operator: &O, _arg: &str) -> Option<Vec<String>> {
        None
    }
}

/// Record for functions that only want the raw argument map
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArguments;

impl<O: ?Sized> ArgumentRecord<O> for NoArguments {
    fn fields() -> Vec<ArgField<Self>> {
        Vec::new()
    }
}

/// Binds `args` to a fresh record. Returns the record and the arguments no
/// field consumed, in their original casing.
pub fn bind_arguments<R: Default>(
    fields: &[ArgField<R>],
    args: &FunctionArguments,
    mode: BindMode,
) -> Result<(R, FunctionArguments), ArgumentError> {
    let mut record = R::default();
    let mut remaining = args.clone();

    for field in fields.iter().filter(|f| !f.optional) {
        let Some(raw) = remaining.get_combined(field.name) else {
            if mode == BindMode::Discovery {
                continue;
            }
            return Err(ArgumentError::Missing(field.name.to_string()));
        };
        match field.apply(&mut record, &raw) {
            Ok(()) => {
                remaining.remove(field.name);
            }
            Err(_) if mode == BindMode::Discovery => {}
            Err(reason) => {
                return Err(ArgumentError::Invalid {
                    name: field.name.to_string(),
                    reason,
                })
            }
        }
    }

    for field in fields.iter().filter(|f| f.optional) {
        let Some(raw) = remaining.get_combined(field.name) else {
            continue;
        };
        match field.apply(&mut record, &raw) {
            Ok(()) => {
                remaining.remove(field.name);
            }
            Err(reason) if mode == BindMode::Strict => {
                return Err(ArgumentError::Invalid {
                    name: field.name.to_string(),
                    reason,
                })
            }
            Err(reason) => {
                tracing::debug!("Ignoring optional parameter \"{}\": {}", field.name, reason);
            }
        }
    }

    Ok((record, remaining))
}

fn parse_int(raw: &str) -> Result<i64, String> {
    raw.trim().parse().map_err(|e| format!("{}", e))
}

fn parse_int64(raw: &str) -> Result<i64, String> {
    if let Ok(value) = raw.trim().parse::<i64>() {
        return Ok(value);
    }
    let duration = parse_duration(raw)
        .ok_or_else(|| format!("\"{}\" is neither a number nor a duration", raw))?;
    i64::try_from(duration.as_nanos()).map_err(|_| "duration out of range".to_string())
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(format!("\"{}\" is not a boolean", other)),
    }
}

pub(crate) type RecordFn<O, R> = Box<
    dyn for<'a> Fn(&'a O, &'a Context, &'a Output, R) -> BoxFuture<'a, Output> + Send + Sync,
>;

pub(crate) type RecordAndRestFn<O, R> = Box<
    dyn for<'a> Fn(&'a O, &'a Context, &'a Output, R, FunctionArguments) -> BoxFuture<'a, Output>
        + Send
        + Sync,
>;

pub(crate) enum RecordCall<O, R> {
    Record(RecordFn<O, R>),
    RecordAndRest(RecordAndRestFn<O, R>),
}

/// Type-erased binding of one argument record type to its handler
pub(crate) trait Binder<O>: Send + Sync {
    fn parameters(&self) -> Vec<String>;

    fn field_kind(&self, arg: &str) -> Option<ArgKind>;

    fn invoke<'a>(
        &'a self,
        operator: &'a O,
        ctx: &'a Context,
        input: &'a Output,
        args: FunctionArguments,
        mode: BindMode,
    ) -> BoxFuture<'a, Output>;

    fn record_suggestions(
        &self,
        operator: &O,
        arg: &str,
        other_args: &FunctionArguments,
    ) -> Option<Vec<String>>;
}

pub(crate) struct RecordBinder<O, R> {
    pub(crate) fields: Vec<ArgField<R>>,
    pub(crate) call: RecordCall<O, R>,
}

impl<O, R> Binder<O> for RecordBinder<O, R>
where
    O: Send + Sync + 'static,
    R: ArgumentRecord<O>,
{
    fn parameters(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.to_string()).collect()
    }

    fn field_kind(&self, arg: &str) -> Option<ArgKind> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(arg))
            .map(ArgField::kind)
    }

    fn invoke<'a>(
        &'a self,
        operator: &'a O,
        ctx: &'a Context,
        input: &'a Output,
        args: FunctionArguments,
        mode: BindMode,
    ) -> BoxFuture<'a, Output> {
        let (record, rest) = match bind_arguments(&self.fields, &args, mode) {
            Ok(bound) => bound,
            Err(e) => return Box::pin(future::ready(Output::from(e))),
        };
        if let Err(rejected) = record.verify(operator) {
            return Box::pin(future::ready(rejected));
        }
        match &self.call {
            RecordCall::Record(f) => f(operator, ctx, input, record),
            RecordCall::RecordAndRest(f) => f(operator, ctx, input, record, rest),
        }
    }

    fn record_suggestions(
        &self,
        operator: &O,
        arg: &str,
        other_args: &FunctionArguments,
    ) -> Option<Vec<String>> {
        let (record, _) = bind_arguments(&self.fields, other_args, BindMode::Discovery).ok()?;
        // records match on the declared field name
        let arg = self
            .fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(arg))
            .map(|f| f.name)
            .unwrap_or(arg);
        record.suggestions(operator, arg)
    }
}
