use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use bytes::Bytes;

use crate::pool::{CheckoutError, PoolOptions};
use crate::response::template;

/// The error-page template set, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ErrorPageTemplates {
    layout: String,
    css: String,
    general: String,
    general_with_html: String,
    undisclosed: String,
}

impl ErrorPageTemplates {
    /// Loads the template files from a `templates` resource directory.
    pub fn load(dir: &Path) -> io::Result<Self> {
        let read = |name: &str| std::fs::read_to_string(dir.join(name));
        Ok(Self {
            layout: read("error_layout.html.template")?,
            css: read("error_layout.css")?,
            general: read("general_error.html.template")?,
            general_with_html: read("general_error_with_html.html.template")?,
            undisclosed: read("undisclosed_error.html.template")?,
        })
    }

    /// Builds a template set from in-memory strings.
    pub fn from_parts(
        layout: impl Into<String>,
        css: impl Into<String>,
        general: impl Into<String>,
        general_with_html: impl Into<String>,
        undisclosed: impl Into<String>,
    ) -> Self {
        Self {
            layout: layout.into(),
            css: css.into(),
            general: general.into(),
            general_with_html: general_with_html.into(),
            undisclosed: undisclosed.into(),
        }
    }

    /// Renders the HTML body of a 500 response.
    ///
    /// With `friendly` pages the message (and, for spawn errors, the
    /// pre-rendered HTML plus annotations with upper-cased names) is spliced
    /// into the layout; otherwise the static undisclosed-error page is
    /// returned.
    pub fn render(
        &self,
        friendly: bool,
        message: &str,
        spawn_error: Option<&CheckoutError>,
        options: &PoolOptions,
    ) -> String {
        if !friendly {
            return self.undisclosed.clone();
        }

        let mut params = BTreeMap::new();
        params.insert("CSS".to_string(), self.css.clone());
        params.insert("APP_ROOT".to_string(), options.app_root.clone());
        params.insert("ENVIRONMENT".to_string(), options.environment.clone());
        params.insert("MESSAGE".to_string(), message.to_string());

        let general = match spawn_error {
            Some(error) => {
                params.insert(
                    "TITLE".to_string(),
                    "Web application could not be started".to_string(),
                );
                for (name, value) in &error.annotations {
                    params.insert(name.to_uppercase(), value.clone());
                }
                &self.general_with_html
            }
            None => {
                params.insert("TITLE".to_string(), "Internal server error".to_string());
                &self.general
            }
        };

        let content = template::apply(general, &params);
        params.insert("CONTENT".to_string(), content);
        template::apply(&self.layout, &params)
    }
}

/// Builds the header block of the 500 response the error page is served
/// with. The `Status:` header is always present; the `HTTP/1.1` status line
/// is subject to the same option as rewritten application responses.
pub fn error_response_head(print_status_line: bool, content_length: usize) -> Bytes {
    let mut head = String::with_capacity(128);
    if print_status_line {
        head.push_str("HTTP/1.1 500 Internal Server Error\r\n");
    }
    head.push_str("Status: 500 Internal Server Error\r\n");
    head.push_str(&format!("Content-Length: {content_length}\r\n"));
    head.push_str("Content-Type: text/html; charset=UTF-8\r\n");
    head.push_str("\r\n");
    Bytes::from(head.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> ErrorPageTemplates {
        ErrorPageTemplates::from_parts(
            "<html><style>{{CSS}}</style><h1>{{TITLE}}</h1>{{CONTENT}}</html>",
            "body {}",
            "<p>{{MESSAGE}}</p><i>{{APP_ROOT}} ({{ENVIRONMENT}})</i>",
            "<div>{{MESSAGE}}</div><small>{{ERROR_ID}}</small>",
            "<html>We're sorry, but something went wrong.</html>",
        )
    }

    fn options() -> PoolOptions {
        PoolOptions {
            app_root: "/srv/app".to_string(),
            environment: "production".to_string(),
            ..PoolOptions::default()
        }
    }

    #[test]
    fn plain_message_uses_the_general_template() {
        let html = templates().render(true, "kaboom", None, &options());
        assert!(html.contains("<h1>Internal server error</h1>"));
        assert!(html.contains("<p>kaboom</p>"));
        assert!(html.contains("/srv/app (production)"));
    }

    #[test]
    fn spawn_error_uses_the_html_template_and_annotations() {
        let error = CheckoutError::new("spawn failed")
            .with_error_page("<h1>boom</h1>")
            .with_annotation("error_id", "ab12");

        let html = templates().render(true, "<h1>boom</h1>", Some(&error), &options());
        assert!(html.contains("<h1>Web application could not be started</h1>"));
        assert!(html.contains("<div><h1>boom</h1></div>"));
        assert!(html.contains("<small>ab12</small>"));
    }

    #[test]
    fn unfriendly_pages_disclose_nothing() {
        let html = templates().render(false, "secret details", None, &options());
        assert!(!html.contains("secret details"));
        assert!(html.contains("something went wrong"));
    }

    #[test]
    fn response_head_shape() {
        let head = error_response_head(true, 42);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Status: 500 Internal Server Error\r\n"));
        assert!(text.contains("Content-Length: 42\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let without_status_line = error_response_head(false, 0);
        assert!(without_status_line.starts_with(&b"Status: 500"[..]));
    }
}
