use std::collections::BTreeMap;

/// Substitutes `{{KEY}}` placeholders with the given parameters.
///
/// This is trusted substitution: values are inserted verbatim, no escaping,
/// no control flow. Placeholders without a matching parameter are left as-is.
pub fn apply(template: &str, params: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_params() {
        let mut params = BTreeMap::new();
        params.insert("TITLE".to_string(), "oops".to_string());
        params.insert("MESSAGE".to_string(), "<b>boom</b>".to_string());

        let out = apply("<h1>{{TITLE}}</h1><p>{{MESSAGE}}</p>", &params);
        assert_eq!(out, "<h1>oops</h1><p><b>boom</b></p>");
    }

    #[test]
    fn unknown_placeholders_survive() {
        let out = apply("{{UNKNOWN}}", &BTreeMap::new());
        assert_eq!(out, "{{UNKNOWN}}");
    }

    #[test]
    fn repeated_placeholders_are_all_replaced() {
        let mut params = BTreeMap::new();
        params.insert("X".to_string(), "y".to_string());
        assert_eq!(apply("{{X}}-{{X}}", &params), "y-y");
    }
}
