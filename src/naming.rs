use crate::error::Error;
use regex::Regex;
use std::sync::OnceLock;

pub fn is_camel(name: &str) -> bool {
    name != name.to_lowercase() && name != name.to_uppercase() && !name.contains('_')
}

/// `ShoppingVertical` -> `shopping_vertical`, `HTTPServer` -> `http_server`.
pub fn decamelize(name: &str) -> Result<String, Error> {
    static FIRST: OnceLock<Regex> = OnceLock::new();
    static SECOND: OnceLock<Regex> = OnceLock::new();
    let first = cached(&FIRST, r"(.)([A-Z][a-z]+)")?;
    let second = cached(&SECOND, r"([a-z0-9])([A-Z])")?;
    let s1 = first.replace_all(name, "${1}_${2}");
    Ok(second.replace_all(&s1, "${1}_${2}").to_lowercase())
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex, Error> {
    if let Some(re) = cell.get() {
        return Ok(re);
    }
    let re = Regex::new(pattern)?;
    Ok(cell.get_or_init(|| re))
}

/// Column prefix for an unnested path segment: `result.Networks` -> `network`.
pub fn singular_prefix(path: &str) -> String {
    let last = path.rsplit('.').next().unwrap_or(path).to_lowercase();
    if let Some(stem) = last.strip_suffix("ies") {
        format!("{}y", stem)
    } else if let Some(stem) = last.strip_suffix('s') {
        stem.to_string()
    } else {
        last
    }
}
