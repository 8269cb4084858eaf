/// Instance id for an agent that was not given one: `<hostname>-<suffix>`,
/// reduced to the characters the registry accepts.
#[must_use]
pub fn generate_instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '-' })
        .take(64)
        .collect();

    format!("{host}-{}", nanoid::nanoid!(6, &nanoid::alphabet::SAFE))
}

/// Parse `key=value` command-line pairs
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_clean() {
        let a = generate_instance_id();
        let b = generate_instance_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')));
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("weight=5").unwrap(), ("weight".to_string(), "5".to_string()));
        assert_eq!(parse_key_value("url=a=b").unwrap(), ("url".to_string(), "a=b".to_string()));
        assert!(parse_key_value("weight").is_err());
        assert!(parse_key_value("=5").is_err());
    }
}
