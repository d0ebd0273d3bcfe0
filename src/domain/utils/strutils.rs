use rand::Rng;
use rand::distr::Alphanumeric;

const TRUE_STRINGS: [&str; 6] = ["1", "t", "true", "on", "y", "yes"];
const FALSE_STRINGS: [&str; 6] = ["0", "f", "false", "off", "n", "no"];

/// Lenient boolean parsing: anything not recognised as true is false.
pub fn bool_from_string(value: &str) -> bool {
    TRUE_STRINGS.contains(&value.trim().to_lowercase().as_str())
}

/// Strict boolean parsing: unrecognised input yields `None`.
pub fn strict_bool_from_string(value: &str) -> Option<bool> {
    let lowered = value.trim().to_lowercase();
    if TRUE_STRINGS.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSE_STRINGS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Short random token with a prefix, e.g. `r-3k9d0x1a`.
pub fn generate_uid(prefix: &str) -> String {
    let suffix: String = rand::rng().sample_iter(&Alphanumeric).take(8).map(|c| (c as char).to_ascii_lowercase()).collect();
    format!("{}-{}", prefix, suffix)
}

/// Turns a display name into something usable as a hostname.
pub fn sanitize_hostname(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        match c {
            ' ' | '_' => out.push('-'),
            'a'..='z' | '0'..='9' | '-' | '.' => out.push(c),
            _ => {}
        }
    }
    let trimmed: String = out.trim_matches(|c| c == '-' || c == '.').chars().take(63).collect();
    trimmed.trim_end_matches(|c| c == '-' || c == '.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parsing_rejects_garbage() {
        assert_eq!(strict_bool_from_string("Yes"), Some(true));
        assert_eq!(strict_bool_from_string("off"), Some(false));
        assert_eq!(strict_bool_from_string("maybe"), None);
        assert!(!bool_from_string("maybe"));
    }

    #[test]
    fn uid_has_prefix_and_suffix() {
        let uid = generate_uid("r");
        assert!(uid.starts_with("r-"));
        assert_eq!(uid.len(), 10);
    }

    #[test]
    fn hostname_is_sanitized() {
        assert_eq!(sanitize_hostname("My Server_01!"), "my-server-01");
        assert_eq!(sanitize_hostname("--web.1--"), "web.1");
    }
}
