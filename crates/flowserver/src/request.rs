//! Turns an HTTP request into the arguments and main input of a flow

use flowcore::{FunctionArguments, Output, FORM_CONTENT_TYPE};

/// Query parameters as arguments; repeated keys keep every value
pub fn query_arguments(query: &str) -> Result<FunctionArguments, Output> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).map_err(|e| {
        Output::error(
            flowcore::status::BAD_REQUEST,
            format!("Cannot parse query: {}", e),
        )
    })?;
    let mut args = FunctionArguments::new();
    for (key, value) in pairs {
        args.append(key, value);
    }
    Ok(args)
}

/// The body as main input, typed by its content type
pub fn body_input(content_type: Option<&str>, body: &[u8]) -> Result<Output, Output> {
    if body.is_empty() {
        return Ok(Output::empty());
    }
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if mime == "application/json" {
        let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
            Output::error(
                flowcore::status::BAD_REQUEST,
                format!("Cannot parse JSON body: {}", e),
            )
        })?;
        return Ok(Output::json(value));
    }
    if mime.starts_with("text/") {
        return Ok(Output::plain(String::from_utf8_lossy(body).into_owned()));
    }
    if mime == FORM_CONTENT_TYPE {
        return Ok(Output::bytes_with_content_type(body, FORM_CONTENT_TYPE));
    }
    Ok(match content_type {
        Some(ct) if !ct.is_empty() => Output::bytes_with_content_type(body, ct),
        _ => Output::bytes(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::OutputKind;

    #[test]
    fn test_query_keeps_repeated_values() {
        let args = query_arguments("room=hall&room=kitchen&level=3").unwrap();
        assert_eq!(args.get_all("room"), ["hall", "kitchen"]);
        assert_eq!(args.get("level"), Some("3"));
        assert!(query_arguments("").unwrap().is_empty());
    }

    #[test]
    fn test_body_kinds() {
        let out = body_input(Some("application/json; charset=utf-8"), br#"{"on":true}"#).unwrap();
        assert_eq!(out.to_json()["on"], true);

        let out = body_input(Some("text/plain"), b"hello").unwrap();
        assert_eq!(out.kind(), OutputKind::Plain);
        assert_eq!(out.to_text(), "hello");

        let out = body_input(Some(FORM_CONTENT_TYPE), b"a=1&b=2").unwrap();
        assert!(out.is_form_data());
        assert_eq!(out.to_args_map().unwrap()["b"], "2");

        let out = body_input(Some("image/png"), &[0x89, 0x50]).unwrap();
        assert_eq!(out.kind(), OutputKind::Bytes);
        assert_eq!(out.content_type(), "image/png");

        assert!(body_input(None, b"").unwrap().is_empty());
        let err = body_input(Some("application/json"), b"{").unwrap_err();
        assert_eq!(err.status_code(), flowcore::status::BAD_REQUEST);
    }
}
