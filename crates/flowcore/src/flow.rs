use crate::error::ValidationError;
use crate::tags;
use crate::FunctionArguments;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name under which the main input of a flow is addressed
pub const ROOT_SYMBOL: &str = "_";

/// One step of a flow: which operator function to call, with which static
/// arguments, and where its input and extra arguments come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationDesc {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub operator: String,
    pub function: String,
    #[serde(skip_serializing_if = "FunctionArguments::is_empty")]
    pub arguments: FunctionArguments,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_on_success_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_on_fail_of: Option<String>,
    pub use_main_args: bool,
}

impl Default for OperationDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            operator: String::new(),
            function: String::new(),
            arguments: FunctionArguments::new(),
            input_from: None,
            arguments_from: None,
            execute_on_success_of: None,
            execute_on_fail_of: None,
            use_main_args: true,
        }
    }
}

impl OperationDesc {
    pub fn new(operator: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.set(key, value);
        self
    }

    pub fn input_from(mut self, source: impl Into<String>) -> Self {
        self.input_from = Some(source.into());
        self
    }

    pub fn arguments_from(mut self, source: impl Into<String>) -> Self {
        self.arguments_from = Some(source.into());
        self
    }

    pub fn on_success_of(mut self, source: impl Into<String>) -> Self {
        self.execute_on_success_of = Some(source.into());
        self
    }

    pub fn on_fail_of(mut self, source: impl Into<String>) -> Self {
        self.execute_on_fail_of = Some(source.into());
        self
    }

    pub fn use_main_args(mut self, use_main_args: bool) -> Self {
        self.use_main_args = use_main_args;
        self
    }

    /// URL calling this operation on its own through the HTTP front door
    pub fn quick_link(&self) -> String {
        let mut link = format!("/{}", self.operator);
        if !self.function.is_empty() {
            link.push('/');
            link.push_str(&self.function);
        }
        let pairs: Vec<(&str, &str)> = self
            .arguments
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key, v.as_str())))
            .collect();
        if let Ok(query) = serde_urlencoded::to_string(&pairs) {
            if !query.is_empty() {
                link.push('?');
                link.push_str(&query);
            }
        }
        link
    }

    fn references_mut(&mut self) -> [&mut Option<String>; 4] {
        [
            &mut self.input_from,
            &mut self.arguments_from,
            &mut self.execute_on_success_of,
            &mut self.execute_on_fail_of,
        ]
    }
}

/// A flow as authored or persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowDesc {
    pub display_name: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_from: Option<String>,
    pub operations: Vec<OperationDesc>,
    /// Where the flow was loaded from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FlowDesc {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn with_operation(mut self, operation: OperationDesc) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_tags(tags);
        self
    }

    pub fn output_from(mut self, source: impl Into<String>) -> Self {
        self.output_from = Some(source.into());
        self
    }

    /// Adds tags, dropping exact duplicates
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }

    pub fn remove_tag(&mut self, tag: &str) {
        self.tags.retain(|t| t != tag);
    }

    /// Value of the first tag with this key; `None` if the tag is absent or
    /// has no value
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .map(|t| tags::split_tag(t))
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v)
    }

    pub fn has_all_tags<W: AsRef<str>>(&self, wanted: &[W]) -> bool {
        tags::has_all_tags(&self.tags, wanted)
    }

    pub fn has_at_least_one_tag<W: AsRef<str>>(&self, wanted: &[W]) -> bool {
        tags::has_at_least_one_tag(&self.tags, wanted)
    }

    pub fn has_at_least_one_tag_per_group<W: AsRef<str>>(&self, groups: &[Vec<W>]) -> bool {
        tags::has_at_least_one_tag_per_group(&self.tags, groups)
    }

    /// Renames an operation and every reference to it
    pub fn rename_operation(&mut self, old: &str, new: &str) {
        let rename = |reference: &mut Option<String>| {
            if reference.as_deref() == Some(old) {
                *reference = Some(new.to_string());
            }
        };
        for op in &mut self.operations {
            if op.name == old {
                op.name = new.to_string();
            }
            for reference in op.references_mut() {
                rename(reference);
            }
        }
        rename(&mut self.output_from);
    }

    /// Checks the descriptor and fills in defaults.
    ///
    /// `has_operator` decides whether an operator name is registered; it is
    /// called with the name as written in the descriptor.
    pub fn validate(
        &self,
        flow_id: &str,
        has_operator: impl Fn(&str) -> bool,
    ) -> Result<CompleteFlow, ValidationError> {
        if self.operations.is_empty() {
            return Err(ValidationError::NoOperations);
        }

        let mut desc = self.clone();
        if desc.display_name.is_empty() {
            desc.display_name = capitalize(flow_id);
        }

        let mut known: HashSet<String> = HashSet::from([ROOT_SYMBOL.to_string()]);
        for (index, op) in desc.operations.iter_mut().enumerate() {
            for reference in op.references_mut() {
                if reference.as_deref() == Some("") {
                    *reference = None;
                }
            }
            if op.name == ROOT_SYMBOL {
                return Err(ValidationError::ReservedName(op.name.clone()));
            }
            if op.name.is_empty() {
                op.name = format!("#{}", index);
            }
            if known.contains(&op.name) {
                return Err(ValidationError::DuplicateName(op.name.clone()));
            }
            if !has_operator(&op.operator) {
                return Err(ValidationError::UnknownOperator {
                    operation: op.name.clone(),
                    operator: op.operator.clone(),
                });
            }

            let references = [
                ("argumentsFrom", &op.arguments_from),
                ("inputFrom", &op.input_from),
                ("executeOnSuccessOf", &op.execute_on_success_of),
                ("executeOnFailOf", &op.execute_on_fail_of),
            ];
            for (field, reference) in references {
                if let Some(reference) = reference {
                    if !known.contains(reference) {
                        return Err(ValidationError::UnknownReference {
                            operation: op.name.clone(),
                            field,
                            reference: reference.clone(),
                        });
                    }
                }
            }
            if let Some(fail_source) = &op.execute_on_fail_of {
                if op.input_from.as_ref() == Some(fail_source) {
                    return Err(ValidationError::FailSourceIsInput(op.name.clone()));
                }
                if op.execute_on_success_of.as_ref() == Some(fail_source) {
                    return Err(ValidationError::FailSourceIsSuccessSource(op.name.clone()));
                }
            }
            if index == 0 && op.input_from.is_none() {
                op.input_from = Some(ROOT_SYMBOL.to_string());
            }

            known.insert(op.name.clone());
        }

        let output_from = match desc.output_from.take().filter(|o| !o.is_empty()) {
            Some(output) if known.contains(&output) => output,
            Some(output) => return Err(ValidationError::UnknownOutput(output)),
            None if desc.operations.len() == 1 => desc.operations[0].name.clone(),
            None => return Err(ValidationError::MissingOutput),
        };
        desc.output_from = Some(output_from);

        Ok(CompleteFlow {
            id: flow_id.to_string(),
            desc,
        })
    }
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A validated flow: every reference resolves, every operation has a name,
/// the output source is set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteFlow {
    id: String,
    #[serde(flatten)]
    desc: FlowDesc,
}

impl CompleteFlow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn desc(&self) -> &FlowDesc {
        &self.desc
    }

    pub fn into_desc(self) -> FlowDesc {
        self.desc
    }

    pub fn operations(&self) -> &[OperationDesc] {
        &self.desc.operations
    }

    pub fn output_from(&self) -> &str {
        self.desc.output_from.as_deref().unwrap_or(ROOT_SYMBOL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_operator(_: &str) -> bool {
        true
    }

    #[test]
    fn test_single_operation_defaults() {
        let desc = FlowDesc::default().with_operation(OperationDesc::new("utils", "echo"));
        let flow = desc.validate("lights", any_operator).unwrap();
        assert_eq!(flow.desc().display_name, "Lights");
        assert_eq!(flow.operations()[0].name, "#0");
        assert_eq!(flow.operations()[0].input_from.as_deref(), Some(ROOT_SYMBOL));
        assert_eq!(flow.output_from(), "#0");
    }

    #[test]
    fn test_rename_operation_rewrites_references() {
        let mut desc = FlowDesc::default()
            .with_operation(OperationDesc::new("utils", "echo").named("a"))
            .with_operation(OperationDesc::new("utils", "echo").named("b").input_from("a"))
            .output_from("a");
        desc.rename_operation("a", "first");
        assert_eq!(desc.operations[0].name, "first");
        assert_eq!(desc.operations[1].input_from.as_deref(), Some("first"));
        assert_eq!(desc.output_from.as_deref(), Some("first"));
    }

    #[test]
    fn test_tag_value() {
        let desc = FlowDesc::default().with_tags(["room:kitchen", "light", "room:bath"]);
        assert_eq!(desc.tag_value("ROOM"), Some("kitchen"));
        assert_eq!(desc.tag_value("light"), None);
        assert_eq!(desc.tag_value("missing"), None);
    }

    #[test]
    fn test_quick_link() {
        let op = OperationDesc::new("store", "get")
            .with_argument("namespace", "my ns")
            .with_argument("key", "k");
        assert_eq!(op.quick_link(), "/store/get?key=k&namespace=my+ns");
        assert_eq!(OperationDesc::new("system", "noop").quick_link(), "/system/noop");
    }
}
