//! Reading flow documents from disk
//!
//! A file holds either a single flow (an object with `operations`, named by
//! its `id` field or else by the file stem) or an object mapping flow ids
//! to flows. A directory is read file by file, `*.json` only.

use flowcore::{FlowDesc, FlowError};
use serde_json::Value;
use std::path::Path;

/// Flows of a file or a directory, with `source` set to the file path
pub fn read_flows(path: &Path) -> Result<Vec<(String, FlowDesc)>, FlowError> {
    if path.is_dir() {
        return read_flow_dir(path);
    }
    read_flow_file(path)
}

pub fn read_flow_dir(dir: &Path) -> Result<Vec<(String, FlowDesc)>, FlowError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension() == Some("json".as_ref()) {
            files.push(path);
        }
    }
    files.sort();

    let mut flows = Vec::new();
    for file in files {
        flows.extend(read_flow_file(&file)?);
    }
    tracing::debug!("Read {} flows from {}", flows.len(), dir.display());
    Ok(flows)
}

pub fn read_flow_file(path: &Path) -> Result<Vec<(String, FlowDesc)>, FlowError> {
    let text = std::fs::read_to_string(path)?;
    let source = path.display().to_string();
    let mut document: Value = serde_json::from_str(&text)?;

    let mut flows = Vec::new();
    if document.get("operations").is_some() {
        let id = match document.as_object_mut().and_then(|o| o.remove("id")) {
            Some(Value::String(id)) => id,
            _ => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let desc: FlowDesc = serde_json::from_value(document)?;
        flows.push((id, desc));
    } else if let Value::Object(map) = document {
        for (id, flow) in map {
            flows.push((id, serde_json::from_value(flow)?));
        }
    } else {
        return Err(FlowError::Persistence(format!(
            "{} does not contain a flow or a map of flows",
            source
        )));
    }

    for (_, desc) in &mut flows {
        desc.source = Some(source.clone());
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flow_and_map_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("porch.json"),
            r#"{"displayName":"Porch","operations":[{"operator":"utils","function":"echo"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("more.json"),
            r#"{"a":{"operations":[{"operator":"system","function":"noop"}]},"b":{"operations":[]}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let flows = read_flows(dir.path()).unwrap();
        let ids: Vec<&str> = flows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "porch"]);
        assert!(flows[2].1.source.as_deref().unwrap().ends_with("porch.json"));
        assert_eq!(flows[2].1.display_name, "Porch");
    }

    #[test]
    fn test_explicit_id_wins_over_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        std::fs::write(
            &path,
            r#"{"id":"doorbell","operations":[{"operator":"utils","function":"echo"}]}"#,
        )
        .unwrap();
        let flows = read_flow_file(&path).unwrap();
        assert_eq!(flows[0].0, "doorbell");
    }
}
