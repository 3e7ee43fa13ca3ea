use crate::error::Error;
use std::collections::HashMap;

pub type Params = HashMap<String, String>;

/// Substitutes `{name}` placeholders from `params`. `{{` and `}}` produce
/// literal braces; braces around anything that is not an identifier are
/// kept verbatim so JSON or JavaScript bodies pass through untouched.
pub fn render(template: &str, params: &Params) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            match placeholder(&tail[1..]) {
                Some(name) => {
                    let value = params.get(name).ok_or_else(|| Error::MissingParameter {
                        name: name.to_string(),
                    })?;
                    out.push_str(value);
                    rest = &tail[name.len() + 2..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholder(s: &str) -> Option<&str> {
    let end = s.find('}')?;
    let name = &s[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    if (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some(name)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let p = params(&[("api_key", "xyz"), ("start_date", "2019-09-01"), ("page", "2")]);
        let url = render(
            "https://api.example.com/?key={api_key}&from={start_date}&page={page}",
            &p,
        )
        .unwrap();
        assert_eq!(url, "https://api.example.com/?key=xyz&from=2019-09-01&page=2");
    }

    #[test]
    fn test_render_keeps_non_placeholder_braces() {
        let p = params(&[("dataset", "mango")]);
        let sql = render(
            "CREATE FUNCTION {dataset}.f(x STRING) RETURNS STRING LANGUAGE js AS \"\"\" if (x) { return x; } \"\"\"; SELECT '{{literal}}'",
            &p,
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE FUNCTION mango.f(x STRING) RETURNS STRING LANGUAGE js AS \"\"\" if (x) { return x; } \"\"\"; SELECT '{literal}'"
        );
    }

    #[test]
    fn test_render_missing_parameter() {
        let result = render("SELECT * FROM {src}", &Params::new());
        assert!(matches!(
            result.unwrap_err(),
            Error::MissingParameter { name } if name == "src"
        ));
    }
}
