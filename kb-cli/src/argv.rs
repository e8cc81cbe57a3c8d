//! Minimal argv handling for the dynamic command surface (spec.md §1 marks argument
//! parsing/help rendering as an external collaborator; commands are only known after
//! the registry is built, so a static derive-based parser does not fit). Splits argv
//! into the leading non-flag words that name a command and the trailing `--flag`
//! tokens, and turns the latter into the `input.flags` object a handler receives.

/// Leading tokens that don't start with `-` name the command; everything after is
/// flags (and, for a group/system command, any leftover positional words).
pub fn split_command_and_flags(args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut words = Vec::new();
    let mut idx = 0;
    while idx < args.len() && !args[idx].starts_with('-') {
        words.push(args[idx].clone());
        idx += 1;
    }
    (words, args[idx..].to_vec())
}

/// `--flag value`, `--flag=value`, and bare `--flag`/`-f` boolean forms.
pub fn parse_flags(tokens: &[String]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if let Some(rest) = token.strip_prefix("--") {
            if let Some((key, value)) = rest.split_once('=') {
                map.insert(key.to_string(), parse_scalar(value));
                i += 1;
                continue;
            }
            let has_value = tokens.get(i + 1).is_some_and(|next| !next.starts_with('-'));
            if has_value {
                map.insert(rest.to_string(), parse_scalar(&tokens[i + 1]));
                i += 2;
            } else {
                map.insert(rest.to_string(), serde_json::Value::Bool(true));
                i += 1;
            }
        } else if let Some(flag) = token.strip_prefix('-') {
            map.insert(flag.to_string(), serde_json::Value::Bool(true));
            i += 1;
        } else {
            i += 1;
        }
    }
    serde_json::Value::Object(map)
}

fn parse_scalar(raw: &str) -> serde_json::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_leading_words_from_flags() {
        let args = vec!["plugin".into(), "list".into(), "--verbose".into()];
        let (words, rest) = split_command_and_flags(&args);
        assert_eq!(words, vec!["plugin".to_string(), "list".to_string()]);
        assert_eq!(rest, vec!["--verbose".to_string()]);
    }

    #[test]
    fn parses_key_value_and_boolean_flags() {
        let tokens = vec!["--name".into(), "demo".into(), "--force".into(), "-v".into()];
        let flags = parse_flags(&tokens);
        assert_eq!(flags["name"], serde_json::json!("demo"));
        assert_eq!(flags["force"], serde_json::json!(true));
        assert_eq!(flags["v"], serde_json::json!(true));
    }

    #[test]
    fn parses_equals_form_and_numbers() {
        let tokens = vec!["--count=3".into()];
        let flags = parse_flags(&tokens);
        assert_eq!(flags["count"], serde_json::json!(3));
    }
}
