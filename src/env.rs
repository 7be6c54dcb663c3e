//! Variable interpolation for script strings.

use std::collections::HashMap;

/// Interpolate `${VAR}` references in a string.
///
/// Each name is looked up in `vars` first, then in the process environment.
/// Returns an error message if a referenced variable is not set or a
/// reference is not closed.
pub fn interpolate(s: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => var_name.push(c),
                    None => {
                        return Err(format!("unclosed variable reference: ${{{var_name}"));
                    }
                }
            }
            let value = vars
                .get(&var_name)
                .cloned()
                .or_else(|| std::env::var(&var_name).ok())
                .ok_or_else(|| format!("variable '{var_name}' is not set"))?;
            result.push_str(&value);
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// Interpolate every string in a list.
pub fn interpolate_all(list: &[String], vars: &HashMap<String, String>) -> Result<Vec<String>, String> {
    list.iter().map(|s| interpolate(s, vars)).collect()
}
