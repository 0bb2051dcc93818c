//! The `store` operator: namespaced key/value access for flows.
//!
//! Results are rendered according to the `output` argument:
//!
//! | mode | result |
//! |---|---|
//! | `hierarchy` (default) | `{namespace: {key: envelope}}` |
//! | `full` | `{key: {value, rawValue, age, modifiedBy, reason}}` |
//! | `arguments` | `{key: text}` |
//! | `flat` | `{key: json value}` |
//! | `direct` | the stored value itself |
//! | `bool` | `true` |
//! | `empty` | nothing |
//!
//! A single errored entry is always returned as it is.

use flowcore::{
    status, AdaptedOperator, ArgField, ArgumentRecord, Context, FlowError, FunctionArguments,
    OperatorBuilder, OperatorHandler, Output,
};
use flowstore::{ModifiedBy, SearchQuery, Store, StoreEntry, StoreError, StoreNamespace};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const OUTPUT_MODES: &[&str] = &["full", "arguments", "flat", "direct", "bool", "empty", "hierarchy"];

const DEFAULT_MODE: &str = "hierarchy";
const DEFAULT_KEY_ARG: &str = "key";
const DEFAULT_VALUE_ARG: &str = "value";

pub struct StoreOperator {
    store: Arc<Store>,
}

impl StoreOperator {
    fn namespace(&self, name: &str) -> Result<Arc<dyn StoreNamespace>, Output> {
        self.store.namespace(name).map_err(Output::from)
    }

    /// Only namespaces that exist; suggestions must not create any
    fn existing_namespace(&self, name: &str) -> Option<Arc<dyn StoreNamespace>> {
        self.store.existing_namespace(name)
    }

    fn key_suggestions(&self, namespace: &str) -> Option<Vec<String>> {
        self.existing_namespace(namespace)?.keys().ok()
    }

    fn value_suggestions(&self, namespace: &str, key: &str) -> Option<Vec<String>> {
        let entry = self.existing_namespace(namespace)?.get(key).ok()??;
        Some(vec![entry.data().to_text()])
    }
}

impl OperatorHandler for StoreOperator {
    fn suggest(&self, arg: &str, _other_args: &FunctionArguments) -> Option<Vec<String>> {
        let values = match arg.to_ascii_lowercase().as_str() {
            "namespace" => self.store.namespace_names(),
            "output" => OUTPUT_MODES.iter().map(|m| m.to_string()).collect(),
            "keyargname" => vec![DEFAULT_KEY_ARG.to_string(), "topic".to_string()],
            "valueargname" => vec![DEFAULT_VALUE_ARG.to_string()],
            _ => return None,
        };
        Some(values)
    }
}

/// Arguments of the single-key functions. The key is either `key` or the
/// argument named by `keyArgName`.
#[derive(Default)]
struct KeyArgs {
    namespace: String,
    key: Option<String>,
    key_arg_name: Option<String>,
    output: Option<String>,
    default_value: Option<String>,
    value: Option<String>,
    value_arg_name: Option<String>,
    max_age: Option<Duration>,
}

impl KeyArgs {
    fn key(&self, rest: &FunctionArguments) -> Result<String, Output> {
        match self.key_arg_name.as_deref() {
            Some(name) if !name.eq_ignore_ascii_case(DEFAULT_KEY_ARG) => rest
                .get(name)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .ok_or_else(|| Output::error(status::BAD_REQUEST, format!("No key \"{}\" given", name))),
            _ => self
                .key
                .clone()
                .ok_or_else(|| Output::error(status::BAD_REQUEST, "No key given")),
        }
    }

    fn value(&self, rest: &FunctionArguments) -> Result<String, Output> {
        match self.value_arg_name.as_deref() {
            Some(name) if !name.eq_ignore_ascii_case(DEFAULT_VALUE_ARG) => rest
                .get(name)
                .map(String::from)
                .ok_or_else(|| Output::error(status::BAD_REQUEST, format!("No value \"{}\" given", name))),
            _ => self
                .value
                .clone()
                .ok_or_else(|| Output::error(status::BAD_REQUEST, "No value given")),
        }
    }

    fn mode(&self) -> &str {
        self.output.as_deref().unwrap_or(DEFAULT_MODE)
    }
}

impl ArgumentRecord<StoreOperator> for KeyArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("namespace", |r: &mut Self, v| r.namespace = v),
            ArgField::string("key", |r: &mut Self, v| r.key = Some(v)).optional(),
            ArgField::string("keyArgName", |r: &mut Self, v| r.key_arg_name = Some(v)).optional(),
            ArgField::string("output", |r: &mut Self, v| r.output = Some(v)).optional(),
            ArgField::string("defaultValue", |r: &mut Self, v| r.default_value = Some(v)).optional(),
            ArgField::string("value", |r: &mut Self, v| r.value = Some(v)).optional(),
            ArgField::string("valueArgName", |r: &mut Self, v| r.value_arg_name = Some(v)).optional(),
            ArgField::duration("maxAge", |r: &mut Self, v| r.max_age = Some(v)).optional(),
        ]
    }

    fn suggestions(&self, op: &StoreOperator, arg: &str) -> Option<Vec<String>> {
        match arg {
            "key" => op.key_suggestions(&self.namespace),
            "value" => op.value_suggestions(&self.namespace, self.key.as_deref()?),
            _ => None,
        }
    }
}

#[derive(Default)]
struct CasArgs {
    namespace: String,
    key: String,
    value: String,
    output: Option<String>,
}

impl ArgumentRecord<StoreOperator> for CasArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("namespace", |r: &mut Self, v| r.namespace = v),
            ArgField::string("key", |r: &mut Self, v| r.key = v),
            ArgField::string("value", |r: &mut Self, v| r.value = v),
            ArgField::string("output", |r: &mut Self, v| r.output = Some(v)).optional(),
        ]
    }

    fn suggestions(&self, op: &StoreOperator, arg: &str) -> Option<Vec<String>> {
        match arg {
            "key" => op.key_suggestions(&self.namespace),
            "value" => op.value_suggestions(&self.namespace, &self.key),
            _ => None,
        }
    }
}

#[derive(Default)]
struct SearchArgs {
    namespace: String,
    query: SearchQuery,
    output: Option<String>,
}

impl ArgumentRecord<StoreOperator> for SearchArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("namespace", |r: &mut Self, v| r.namespace = v),
            ArgField::string("key", |r: &mut Self, v| r.query.key = Some(v)).optional(),
            ArgField::string("value", |r: &mut Self, v| r.query.value = Some(v)).optional(),
            ArgField::string("modifiedBy", |r: &mut Self, v| r.query.modified_by = Some(v)).optional(),
            ArgField::duration("minAge", |r: &mut Self, v| r.query.min_age = Some(v)).optional(),
            ArgField::duration("maxAge", |r: &mut Self, v| r.query.max_age = Some(v)).optional(),
            ArgField::string("output", |r: &mut Self, v| r.output = Some(v)).optional(),
        ]
    }

    fn suggestions(&self, op: &StoreOperator, arg: &str) -> Option<Vec<String>> {
        match arg {
            "key" => op.key_suggestions(&self.namespace),
            _ => None,
        }
    }
}

/// Arguments of the whole-namespace functions
#[derive(Default)]
struct NamespaceArgs {
    namespace: String,
    max_age: Option<Duration>,
    output: Option<String>,
}

impl ArgumentRecord<StoreOperator> for NamespaceArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("namespace", |r: &mut Self, v| r.namespace = v),
            ArgField::duration("maxAge", |r: &mut Self, v| r.max_age = Some(v)).optional(),
            ArgField::string("output", |r: &mut Self, v| r.output = Some(v)).optional(),
        ]
    }
}

#[derive(Default)]
struct TrimArgs {
    namespace: String,
    max_entries: i64,
}

impl ArgumentRecord<StoreOperator> for TrimArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("namespace", |r: &mut Self, v| r.namespace = v),
            ArgField::int("maxEntries", |r: &mut Self, v| r.max_entries = v),
        ]
    }

    fn verify(&self, _op: &StoreOperator) -> Result<(), Output> {
        if self.max_entries < 0 {
            return Err(Output::error(status::BAD_REQUEST, "maxEntries must not be negative"));
        }
        Ok(())
    }
}

/// Renders a result according to an output mode
pub fn render(namespace: &str, mode: &str, result: BTreeMap<String, StoreEntry>) -> Output {
    if result.len() == 1 {
        if let Some(entry) = result.values().next().filter(|e| e.is_error()) {
            return entry.data().clone();
        }
    }
    match mode {
        "full" => Output::object(&result),
        "arguments" => {
            let flat: BTreeMap<&String, String> =
                result.iter().map(|(k, e)| (k, e.data().to_text())).collect();
            Output::object(&flat)
        }
        "flat" => {
            let flat: BTreeMap<&String, serde_json::Value> =
                result.iter().map(|(k, e)| (k, e.data().to_json())).collect();
            Output::object(&flat)
        }
        "direct" => result
            .values()
            .next()
            .map(|e| e.data().clone())
            .unwrap_or_default(),
        "bool" => Output::plain("true"),
        "empty" => Output::empty(),
        "hierarchy" => {
            let values: BTreeMap<&String, &Output> = result.iter().map(|(k, e)| (k, e.data())).collect();
            Output::object(&BTreeMap::from([(namespace, values)]))
        }
        other => Output::error(status::BAD_REQUEST, format!("Unknown output type '{}'", other)),
    }
}

fn single(key: String, entry: StoreEntry) -> BTreeMap<String, StoreEntry> {
    BTreeMap::from([(key, entry)])
}

fn read(ns: &dyn StoreNamespace, key: &str, max_age: Option<Duration>) -> Result<Option<StoreEntry>, StoreError> {
    match max_age {
        Some(max_age) => ns.get_if_younger(key, max_age),
        None => ns.get(key),
    }
}

impl StoreOperator {
    async fn get_namespaces(&self) -> Output {
        Output::object(&self.store.namespace_names())
    }

    async fn get(&self, ctx: &Context, args: KeyArgs, rest: FunctionArguments) -> Output {
        let key = match args.key(&rest) {
            Ok(key) => key,
            Err(e) => return e,
        };
        let ns = match self.namespace(&args.namespace) {
            Ok(ns) => ns,
            Err(e) => return e,
        };
        let entry = match read(ns.as_ref(), &key, args.max_age) {
            Ok(Some(entry)) => entry,
            Ok(None) => match &args.default_value {
                Some(default) => StoreEntry::new(Output::plain(default), Some(ModifiedBy::from(ctx))),
                None => return StoreError::NotFound(key).into(),
            },
            Err(e) => return e.into(),
        };
        render(&args.namespace, args.mode(), single(key, entry))
    }

    /// 417 unless the stored value renders as `value` (or the input)
    async fn equals(&self, input: &Output, args: KeyArgs, rest: FunctionArguments) -> Output {
        let key = match args.key(&rest) {
            Ok(key) => key,
            Err(e) => return e,
        };
        let ns = match self.namespace(&args.namespace) {
            Ok(ns) => ns,
            Err(e) => return e,
        };
        let entry = match read(ns.as_ref(), &key, args.max_age) {
            Ok(Some(entry)) => entry,
            Ok(None) => return StoreError::NotFound(key).into(),
            Err(e) => return e.into(),
        };
        if entry.is_error() {
            return entry.data().clone();
        }
        let expected = args.value.clone().unwrap_or_else(|| input.to_text());
        if entry.data().to_text() != expected {
            return Output::error(status::EXPECTATION_FAILED, "Values do not match");
        }
        render(&args.namespace, args.mode(), single(key, entry))
    }

    /// Stores the input. With `maxAge` the key is only claimed when absent
    /// or older than that.
    async fn set(&self, ctx: &Context, input: &Output, args: KeyArgs, rest: FunctionArguments) -> Output {
        let key = match args.key(&rest) {
            Ok(key) => key,
            Err(e) => return e,
        };
        self.write(ctx, input.clone(), &args, key)
    }

    async fn set_simple_value(&self, ctx: &Context, args: KeyArgs, rest: FunctionArguments) -> Output {
        let value = match args.value(&rest) {
            Ok(value) => value,
            Err(e) => return e,
        };
        let key = match args.key(&rest) {
            Ok(key) => key,
            Err(e) => return e,
        };
        self.write(ctx, Output::plain(value), &args, key)
    }

    fn write(&self, ctx: &Context, value: Output, args: &KeyArgs, key: String) -> Output {
        let ns = match self.namespace(&args.namespace) {
            Ok(ns) => ns,
            Err(e) => return e,
        };
        let written = match args.max_age {
            Some(max_age) => ns.set_if_absent_or_older(&key, value, max_age, ctx),
            None => ns.set(&key, value, ctx),
        };
        match written {
            Ok(entry) => render(&args.namespace, args.mode(), single(key, entry)),
            Err(e) => e.into(),
        }
    }

    async fn delete(&self, args: KeyArgs, rest: FunctionArguments) -> Output {
        let key = match args.key(&rest) {
            Ok(key) => key,
            Err(e) => return e,
        };
        let deleted = self
            .namespace(&args.namespace)
            .and_then(|ns| ns.delete(&key).map_err(Output::from));
        match deleted {
            Ok(()) => Output::empty(),
            Err(e) => e,
        }
    }

    async fn compare_and_swap(&self, ctx: &Context, input: &Output, args: CasArgs) -> Output {
        let ns = match self.namespace(&args.namespace) {
            Ok(ns) => ns,
            Err(e) => return e,
        };
        match ns.compare_and_swap(&args.key, &args.value, input.clone(), ctx) {
            Ok(entry) => render(
                &args.namespace,
                args.output.as_deref().unwrap_or(DEFAULT_MODE),
                single(args.key, entry),
            ),
            Err(e) => e.into(),
        }
    }

    async fn search(&self, args: SearchArgs) -> Output {
        let found = self
            .namespace(&args.namespace)
            .and_then(|ns| ns.search(&args.query).map_err(Output::from));
        match found {
            Ok(found) => render(&args.namespace, args.output.as_deref().unwrap_or(DEFAULT_MODE), found),
            Err(e) => e,
        }
    }

    async fn get_all(&self, args: NamespaceArgs) -> Output {
        let query = SearchQuery {
            max_age: args.max_age,
            ..Default::default()
        };
        let found = self
            .namespace(&args.namespace)
            .and_then(|ns| ns.search(&query).map_err(Output::from));
        match found {
            Ok(found) => render(&args.namespace, args.output.as_deref().unwrap_or(DEFAULT_MODE), found),
            Err(e) => e,
        }
    }

    /// Stores every member of a JSON object input
    async fn set_all(&self, ctx: &Context, input: &Output, args: NamespaceArgs) -> Output {
        let values: BTreeMap<String, serde_json::Value> = match input.parse_json() {
            Ok(values) => values,
            Err(e) => return Output::error(status::BAD_REQUEST, format!("Cannot parse input: {}", e)),
        };
        let stored = self
            .namespace(&args.namespace)
            .and_then(|ns| ns.set_all(values, ctx).map_err(Output::from));
        match stored {
            Ok(count) => {
                tracing::debug!("Stored {} values in {}", count, args.namespace);
                Output::empty()
            }
            Err(e) => e,
        }
    }

    async fn delete_older(&self, args: NamespaceArgs) -> Output {
        let Some(max_age) = args.max_age else {
            return Output::error(status::BAD_REQUEST, "No maxAge given");
        };
        let deleted = self
            .namespace(&args.namespace)
            .and_then(|ns| ns.delete_older(max_age).map_err(Output::from));
        match deleted {
            Ok(count) => Output::plain(format!("Deleted {} records", count)),
            Err(e) => e,
        }
    }

    async fn trim(&self, args: TrimArgs) -> Output {
        let max_entries = usize::try_from(args.max_entries).unwrap_or_default();
        let deleted = self
            .namespace(&args.namespace)
            .and_then(|ns| ns.trim(max_entries).map_err(Output::from));
        match deleted {
            Ok(count) => Output::plain(format!("Deleted {} records", count)),
            Err(e) => e,
        }
    }
}

pub fn operator(store: Arc<Store>, enabled: bool) -> Result<Option<AdaptedOperator<StoreOperator>>, FlowError> {
    OperatorBuilder::new("store", StoreOperator { store })
        .enabled(enabled)
        .simple("getNamespaces", |op| Box::pin(op.get_namespaces()))
        .full_signature("get", |op, ctx, _input, args: KeyArgs, rest| {
            Box::pin(op.get(ctx, args, rest))
        })
        .full_signature("set", |op, ctx, input, args: KeyArgs, rest| {
            Box::pin(op.set(ctx, input, args, rest))
        })
        .full_signature("setSimpleValue", |op, ctx, _input, args: KeyArgs, rest| {
            Box::pin(op.set_simple_value(ctx, args, rest))
        })
        .full_signature("equals", |op, _ctx, input, args: KeyArgs, rest| {
            Box::pin(op.equals(input, args, rest))
        })
        .full_signature("delete", |op, _ctx, _input, args: KeyArgs, rest| {
            Box::pin(op.delete(args, rest))
        })
        .full_signature("del", |op, _ctx, _input, args: KeyArgs, rest| {
            Box::pin(op.delete(args, rest))
        })
        .full_signature("remove", |op, _ctx, _input, args: KeyArgs, rest| {
            Box::pin(op.delete(args, rest))
        })
        .with_arguments("compareAndSwap", |op, ctx, input, args: CasArgs| {
            Box::pin(op.compare_and_swap(ctx, input, args))
        })
        .with_arguments("search", |op, _ctx, _input, args: SearchArgs| Box::pin(op.search(args)))
        .with_arguments("getAll", |op, _ctx, _input, args: NamespaceArgs| Box::pin(op.get_all(args)))
        .with_arguments("setAll", |op, ctx, input, args: NamespaceArgs| {
            Box::pin(op.set_all(ctx, input, args))
        })
        .with_arguments("deleteOlder", |op, _ctx, _input, args: NamespaceArgs| {
            Box::pin(op.delete_older(args))
        })
        .with_arguments("trim", |op, _ctx, _input, args: TrimArgs| Box::pin(op.trim(args)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> BTreeMap<String, StoreEntry> {
        BTreeMap::from([
            ("a".to_string(), StoreEntry::new(Output::plain("1"), None)),
            ("b".to_string(), StoreEntry::new(Output::json(serde_json::json!({"x": 2})), None)),
        ])
    }

    #[test]
    fn test_render_modes() {
        let out = render("ns", "arguments", entries());
        assert_eq!(out.to_json(), serde_json::json!({"a": "1", "b": "{\n  \"x\": 2\n}"}));

        let out = render("ns", "flat", entries());
        assert_eq!(out.to_json(), serde_json::json!({"a": 1, "b": {"x": 2}}));

        let out = render("ns", "hierarchy", entries());
        assert_eq!(out.to_json()["ns"]["a"]["payload"]["value"], "1");

        let out = render("ns", "full", entries());
        assert_eq!(out.to_json()["b"]["rawValue"]["x"], 2);

        assert_eq!(render("ns", "bool", entries()).to_text(), "true");
        assert!(render("ns", "empty", entries()).is_empty());
        assert_eq!(render("ns", "direct", entries()).to_text(), "1");
        assert_eq!(render("ns", "tree", entries()).status_code(), status::BAD_REQUEST);
    }

    #[test]
    fn test_single_error_is_returned_as_is() {
        let failed = single(
            "k".to_string(),
            StoreEntry::new(Output::error(status::GONE, "too old"), None),
        );
        let out = render("ns", "bool", failed);
        assert_eq!(out.status_code(), status::GONE);
        assert_eq!(out.to_text(), "too old");
    }
}
