use flowcore::{
    status, AdaptedOperator, ArgField, ArgumentRecord, FlowError, FunctionArguments,
    NoArguments, OperatorBuilder, OperatorHandler, Output,
};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Stateless helpers for shaping data inside flows
#[derive(Default)]
pub struct Utils;

impl OperatorHandler for Utils {}

#[derive(Default)]
struct EchoArgs {
    output: Option<String>,
    silent: Option<bool>,
    as_string: Option<bool>,
}

impl ArgumentRecord<Utils> for EchoArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("output", |r: &mut Self, v| r.output = Some(v)).optional(),
            ArgField::bool("silent", |r: &mut Self, v| r.silent = Some(v)).optional(),
            ArgField::bool("asString", |r: &mut Self, v| r.as_string = Some(v)).optional(),
        ]
    }
}

#[derive(Default)]
struct FlattenArgs {
    include_regexp: Option<String>,
    exclude_regexp: Option<String>,
}

impl ArgumentRecord<Utils> for FlattenArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("includeRegexp", |r: &mut Self, v| r.include_regexp = Some(v)).optional(),
            ArgField::string("excludeRegexp", |r: &mut Self, v| r.exclude_regexp = Some(v)).optional(),
        ]
    }
}

#[derive(Default)]
struct EchoArgumentsArgs {
    input_key: Option<String>,
}

impl ArgumentRecord<Utils> for EchoArgumentsArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![ArgField::string("inputKey", |r: &mut Self, v| r.input_key = Some(v)).optional()]
    }
}

#[derive(Default)]
struct IntArgs {
    key: Option<String>,
    value: i64,
}

impl ArgumentRecord<Utils> for IntArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("key", |r: &mut Self, v| r.key = Some(v)).optional(),
            ArgField::int("value", |r: &mut Self, v| r.value = v),
        ]
    }
}

#[derive(Default)]
struct SplitArgs {
    sep: String,
    pos: i64,
}

impl ArgumentRecord<Utils> for SplitArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("sep", |r: &mut Self, v| r.sep = v),
            ArgField::int("pos", |r: &mut Self, v| r.pos = v),
        ]
    }

    fn verify(&self, _op: &Utils) -> Result<(), Output> {
        if self.sep.is_empty() {
            return Err(Output::error(status::BAD_REQUEST, "Need a separator (sep) to split"));
        }
        if self.pos < 0 {
            return Err(Output::error(status::BAD_REQUEST, "pos must not be negative"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ReplaceArgs {
    input_string: Option<String>,
    search: String,
    replace: String,
}

impl ArgumentRecord<Utils> for ReplaceArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("inputString", |r: &mut Self, v| r.input_string = Some(v)).optional(),
            ArgField::string("search", |r: &mut Self, v| r.search = v),
            ArgField::string("replace", |r: &mut Self, v| r.replace = v),
        ]
    }
}

#[derive(Default)]
struct RegexpArgs {
    regexp: String,
    input_string: Option<String>,
}

impl ArgumentRecord<Utils> for RegexpArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("regexp", |r: &mut Self, v| r.regexp = v),
            ArgField::string("inputString", |r: &mut Self, v| r.input_string = Some(v)).optional(),
        ]
    }
}

/// Flattens nested objects into `a.b.c` keys, keeping leaf values as they
/// are
fn flatten_value(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, inner) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_value(&key, inner, out);
            }
        }
        _ => {
            out.insert(prefix.to_string(), value.clone());
        }
    }
}

fn flatten_input(input: &Output) -> Result<BTreeMap<String, Value>, Output> {
    let nested: Map<String, Value> = input
        .parse_json()
        .map_err(|_| Output::error(status::BAD_REQUEST, "input cannot be parsed into a map"))?;
    let mut flat = BTreeMap::new();
    for (key, value) in &nested {
        flatten_value(key, value, &mut flat);
    }
    Ok(flat)
}

fn compile(pattern: &str, what: &str) -> Result<Regex, Output> {
    Regex::new(pattern).map_err(|e| {
        Output::error(
            status::BAD_REQUEST,
            format!("{} regexp cannot be compiled: {}", what, e),
        )
    })
}

fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| format!("{} is out of range", n)),
        Value::String(s) => s.trim().parse().map_err(|e| format!("\"{}\": {}", s, e)),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("{} is not a number", other)),
    }
}

impl Utils {
    async fn echo(&self, input: &Output, args: EchoArgs) -> Output {
        if let Some(output) = args.output {
            return Output::plain(output);
        }
        if args.silent == Some(true) {
            return Output::empty();
        }
        if args.as_string == Some(true) {
            return Output::plain(input.to_text());
        }
        input.clone()
    }

    async fn has_input(&self, input: &Output) -> Output {
        if input.is_empty() {
            return Output::error(status::EXPECTATION_FAILED, "Expected input");
        }
        input.clone()
    }

    async fn fail(&self) -> Output {
        Output::error(status::EXPECTATION_FAILED, "Fail")
    }

    async fn flatten(&self, input: &Output, args: FlattenArgs) -> Output {
        let mut flat = match flatten_input(input) {
            Ok(flat) => flat,
            Err(e) => return e,
        };
        if let Some(pattern) = &args.include_regexp {
            match compile(pattern, "include") {
                Ok(re) => flat.retain(|key, _| re.is_match(key)),
                Err(e) => return e,
            }
        }
        if let Some(pattern) = &args.exclude_regexp {
            match compile(pattern, "exclude") {
                Ok(re) => flat.retain(|key, _| !re.is_match(key)),
                Err(e) => return e,
            }
        }
        Output::object(&flat)
    }

    /// The input's fields (or the whole input under `inputKey`) overlaid
    /// with the remaining arguments
    async fn echo_arguments(&self, input: &Output, args: EchoArgumentsArgs, rest: FunctionArguments) -> Output {
        let mut output = Map::new();
        if !input.is_empty() {
            match &args.input_key {
                Some(key) => {
                    output.insert(key.clone(), input.to_json());
                }
                None => match input.to_args_map() {
                    Ok(map) => output.extend(map.into_iter().map(|(k, v)| (k, Value::String(v)))),
                    Err(_) => {
                        return Output::error(
                            status::BAD_REQUEST,
                            "input cannot be converted to a map, assign inputKey",
                        )
                    }
                },
            }
        }
        for (key, value) in rest.original_case_map() {
            output.insert(key, Value::String(value));
        }
        Output::json(Value::Object(output))
    }

    async fn merge_input_and_arguments(&self, input: &Output, rest: FunctionArguments) -> Output {
        let mut output: Map<String, Value> = input.parse_json().unwrap_or_default();
        for (key, values) in rest.iter() {
            output.insert(key.to_string(), Value::String(values.join(",")));
        }
        Output::json(Value::Object(output))
    }

    fn int_value(&self, input: &Output, args: &IntArgs) -> Result<i64, Output> {
        let value = match &args.key {
            Some(key) => {
                let flat = flatten_input(input)?;
                flat.get(key).cloned().ok_or_else(|| {
                    Output::error(status::EXPECTATION_FAILED, format!("key {} not found", key))
                })?
            }
            None => input.to_json(),
        };
        to_int(&value).map_err(|e| {
            Output::error(
                status::BAD_REQUEST,
                format!("input cannot be converted to int: {}", e),
            )
        })
    }

    fn compare_int(&self, input: &Output, args: IntArgs, relation: &str, holds: fn(i64, i64) -> bool) -> Output {
        match self.int_value(input, &args) {
            Ok(v) if holds(v, args.value) => input.clone(),
            Ok(_) => Output::error(
                status::EXPECTATION_FAILED,
                format!("input is not {} {}", relation, args.value),
            ),
            Err(e) => e,
        }
    }

    async fn int_equal(&self, input: &Output, args: IntArgs) -> Output {
        self.compare_int(input, args, "equal to", |a, b| a == b)
    }

    async fn int_less_than(&self, input: &Output, args: IntArgs) -> Output {
        self.compare_int(input, args, "less than", |a, b| a < b)
    }

    async fn int_greater_than(&self, input: &Output, args: IntArgs) -> Output {
        self.compare_int(input, args, "greater than", |a, b| a > b)
    }

    async fn string_split(&self, input: &Output, args: SplitArgs) -> Output {
        let text = input.to_text();
        let parts: Vec<&str> = text.split(args.sep.as_str()).collect();
        match usize::try_from(args.pos).ok().and_then(|pos| parts.get(pos)) {
            Some(part) => Output::plain(*part),
            None => Output::error(
                status::BAD_REQUEST,
                format!("Pos {} not available in {:?}", args.pos, parts),
            ),
        }
    }

    async fn string_replace(&self, input: &Output, args: ReplaceArgs) -> Output {
        let text = args.input_string.unwrap_or_else(|| input.to_text());
        Output::plain(text.replace(&args.search, &args.replace))
    }

    /// Passes the text on if it matches, with its capture groups as an
    /// object; 417 otherwise
    async fn regexp_match(&self, input: &Output, args: RegexpArgs) -> Output {
        let re = match compile(&args.regexp, "match") {
            Ok(re) => re,
            Err(e) => return e,
        };
        let text = args.input_string.unwrap_or_else(|| input.to_text());
        let Some(captures) = re.captures(&text) else {
            return Output::error(
                status::EXPECTATION_FAILED,
                format!("input does not match {}", args.regexp),
            );
        };
        let mut groups = BTreeMap::new();
        for (index, name) in re.capture_names().enumerate() {
            if let Some(m) = captures.get(index) {
                let key = name.map(String::from).unwrap_or_else(|| index.to_string());
                groups.insert(key, m.as_str().to_string());
            }
        }
        Output::object(&groups)
    }
}

pub fn operator(enabled: bool) -> Result<Option<AdaptedOperator<Utils>>, FlowError> {
    OperatorBuilder::new("utils", Utils)
        .enabled(enabled)
        .with_arguments("echo", |op, _ctx, input, args: EchoArgs| Box::pin(op.echo(input, args)))
        .context_and_input("hasInput", |op, _ctx, input| Box::pin(op.has_input(input)))
        .simple("fail", |op| Box::pin(op.fail()))
        .with_arguments("flatten", |op, _ctx, input, args: FlattenArgs| {
            Box::pin(op.flatten(input, args))
        })
        .full_signature("echoArguments", |op, _ctx, input, args: EchoArgumentsArgs, rest| {
            Box::pin(op.echo_arguments(input, args, rest))
        })
        .full_signature("mergeInputAndArguments", |op, _ctx, input, _args: NoArguments, rest| {
            Box::pin(op.merge_input_and_arguments(input, rest))
        })
        .with_arguments("intEqual", |op, _ctx, input, args: IntArgs| Box::pin(op.int_equal(input, args)))
        .with_arguments("intLessThan", |op, _ctx, input, args: IntArgs| {
            Box::pin(op.int_less_than(input, args))
        })
        .with_arguments("intGreaterThan", |op, _ctx, input, args: IntArgs| {
            Box::pin(op.int_greater_than(input, args))
        })
        .with_arguments("stringSplit", |op, _ctx, input, args: SplitArgs| {
            Box::pin(op.string_split(input, args))
        })
        .with_arguments("stringReplace", |op, _ctx, input, args: ReplaceArgs| {
            Box::pin(op.string_replace(input, args))
        })
        .with_arguments("regexpMatch", |op, _ctx, input, args: RegexpArgs| {
            Box::pin(op.regexp_match(input, args))
        })
        .build()
}
