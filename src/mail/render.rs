//! Template rendering for form submissions.
//!
//! Takes a form's handler template and the submitted fields, substitutes
//! `{{name}}` placeholders, and produces a mail ready for the SMTP sender.
//! Multi-valued fields (`name[]`) and repeated names are grouped and joined.
//! Fields the template body never references are appended as a submission
//! table so nothing the visitor typed is silently dropped.

use thiserror::Error;

use crate::forms::FormRecord;
use crate::queue::codec::Field;

/// A rendered mail, addressing included. Kept as plain strings so the
/// renderer stays independent of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub from_name: String,
    pub from_email: String,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: String,
}

/// Terminal render failures. None of these are retriable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("form has no handler")]
    MissingHandler,

    #[error("handler has no template")]
    MissingTemplate,

    #[error("rendered subject is empty")]
    EmptySubject,

    #[error("rendered body is empty")]
    EmptyBody,
}

/// Render a submission through the form's template.
///
/// `attachment_url` is the download link for the submission's attachment
/// bundle; `None` when the submission carries no attachments.
pub fn render(
    form: &FormRecord,
    fields: &[Field],
    origin: &str,
    attachment_url: Option<&str>,
) -> Result<RenderedMail, RenderError> {
    let handler = form.handler.as_ref().ok_or(RenderError::MissingHandler)?;
    let template = handler.template.as_ref().ok_or(RenderError::MissingTemplate)?;

    let values = group_fields(fields);

    let subject = interpolate(&template.subject, &values);
    if subject.trim().is_empty() {
        return Err(RenderError::EmptySubject);
    }

    let mut html = interpolate(&template.body, &values);
    if html.trim().is_empty() {
        return Err(RenderError::EmptyBody);
    }

    // Fields the template never referenced still reach the recipient.
    let unreferenced: Vec<&(String, String)> = values
        .iter()
        .filter(|(name, _)| !references(&template.body, name))
        .collect();
    if !unreferenced.is_empty() {
        html.push_str("\n<hr>\n");
        for (name, value) in unreferenced {
            html.push_str(&format!(
                "<p><strong>{}:</strong> {}</p>\n",
                escape_html(name),
                escape_html(value)
            ));
        }
    }

    if let Some(url) = attachment_url {
        html.push_str(&format!(
            "\n<p><a href=\"{}\">Download attachments</a></p>\n",
            escape_html(url)
        ));
    }

    html.push_str(&format!(
        "\n<p><small>Submitted via {}</small></p>\n",
        escape_html(origin)
    ));

    Ok(RenderedMail {
        from_name: handler.from_name.clone(),
        from_email: handler.from_email.clone(),
        to: handler.to.clone(),
        reply_to: handler.reply_to.clone(),
        subject,
        html,
    })
}

/// Synthesize the fixed OTP mail. No template, no attachments.
pub fn render_otp(form: &FormRecord, code: &str) -> Result<RenderedMail, RenderError> {
    let handler = form.handler.as_ref().ok_or(RenderError::MissingHandler)?;

    Ok(RenderedMail {
        from_name: handler.from_name.clone(),
        from_email: handler.from_email.clone(),
        to: handler.to.clone(),
        reply_to: None,
        subject: format!("OTP Code: {code}"),
        html: format!(
            "<p>Your one-time password is <strong>{}</strong>.</p>",
            escape_html(code)
        ),
    })
}

/// Group submitted fields by display name, preserving first-seen order.
/// A `[]` suffix is stripped; repeated names collect their values joined
/// with ", ".
fn group_fields(fields: &[Field]) -> Vec<(String, String)> {
    let mut grouped: Vec<(String, String)> = Vec::new();
    for field in fields {
        let name = field.name.strip_suffix("[]").unwrap_or(&field.name);
        match grouped.iter_mut().find(|(n, _)| n == name) {
            Some((_, value)) => {
                value.push_str(", ");
                value.push_str(&field.value);
            }
            None => grouped.push((name.to_string(), field.value.clone())),
        }
    }
    grouped
}

/// Replace `{{name}}` tokens with field values. Unknown tokens render empty.
fn interpolate(template: &str, values: &[(String, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let token = after[..end].trim();
                if let Some((_, value)) = values.iter().find(|(n, _)| n == token) {
                    out.push_str(&escape_html(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token; emit the remainder verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether the template body references a field by name.
fn references(template: &str, name: &str) -> bool {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if after[..end].trim() == name {
                    return true;
                }
                rest = &after[end + 2..];
            }
            None => return false,
        }
    }
    false
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::{Handler, Template};

    fn form_with_template(subject: &str, body: &str) -> FormRecord {
        FormRecord {
            id: "frm_1".into(),
            allow_duplicates: false,
            handler: Some(Handler {
                from_name: "Acme Forms".into(),
                from_email: "forms@acme.example".into(),
                to: "inbox@acme.example".into(),
                reply_to: None,
                template: Some(Template {
                    subject: subject.into(),
                    body: body.into(),
                }),
                gateway: None,
            }),
        }
    }

    fn field(name: &str, value: &str) -> Field {
        Field {
            name: name.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let form = form_with_template("From {{name}}", "<p>{{message}}</p>");
        let fields = vec![field("name", "Ada"), field("message", "hello there")];

        let mail = render(&form, &fields, "web", None).unwrap();
        assert_eq!(mail.subject, "From Ada");
        assert!(mail.html.contains("<p>hello there</p>"));
        assert_eq!(mail.to, "inbox@acme.example");
    }

    #[test]
    fn test_render_groups_multi_valued_fields() {
        let form = form_with_template("Subject", "<p>{{topics}}</p>");
        let fields = vec![
            field("topics[]", "sales"),
            field("topics[]", "support"),
            field("topics[]", "billing"),
        ];

        let mail = render(&form, &fields, "web", None).unwrap();
        assert!(mail.html.contains("sales, support, billing"));
    }

    #[test]
    fn test_render_appends_unreferenced_fields() {
        let form = form_with_template("Subject", "<p>{{message}}</p>");
        let fields = vec![field("message", "hi"), field("phone", "555-0100")];

        let mail = render(&form, &fields, "web", None).unwrap();
        assert!(mail.html.contains("<strong>phone:</strong> 555-0100"));
    }

    #[test]
    fn test_render_escapes_field_values() {
        let form = form_with_template("Subject", "<p>{{message}}</p>");
        let fields = vec![field("message", "<script>alert(1)</script>")];

        let mail = render(&form, &fields, "web", None).unwrap();
        assert!(mail.html.contains("&lt;script&gt;"));
        assert!(!mail.html.contains("<script>"));
    }

    #[test]
    fn test_render_attachment_link() {
        let form = form_with_template("Subject", "<p>{{message}}</p>");
        let fields = vec![field("message", "hi")];

        let mail = render(&form, &fields, "web", Some("https://api.example/attachments/ab12")).unwrap();
        assert!(mail.html.contains("https://api.example/attachments/ab12"));
        assert!(mail.html.contains("Download attachments"));

        let without = render(&form, &fields, "web", None).unwrap();
        assert!(!without.html.contains("Download attachments"));
    }

    #[test]
    fn test_render_unknown_placeholder_is_empty() {
        let form = form_with_template("Hi {{nobody}}!", "<p>{{message}}</p>");
        let fields = vec![field("message", "hi")];

        let mail = render(&form, &fields, "web", None).unwrap();
        assert_eq!(mail.subject, "Hi !");
    }

    #[test]
    fn test_render_missing_handler() {
        let form = FormRecord {
            id: "frm_1".into(),
            allow_duplicates: false,
            handler: None,
        };
        assert_eq!(
            render(&form, &[], "web", None).unwrap_err(),
            RenderError::MissingHandler
        );
    }

    #[test]
    fn test_render_missing_template() {
        let mut form = form_with_template("s", "b");
        form.handler.as_mut().unwrap().template = None;
        assert_eq!(
            render(&form, &[], "web", None).unwrap_err(),
            RenderError::MissingTemplate
        );
    }

    #[test]
    fn test_render_empty_subject() {
        let form = form_with_template("{{missing}}", "<p>body</p>");
        assert_eq!(
            render(&form, &[], "web", None).unwrap_err(),
            RenderError::EmptySubject
        );
    }

    #[test]
    fn test_render_empty_body() {
        let form = form_with_template("Subject", "{{missing}}");
        assert_eq!(
            render(&form, &[], "web", None).unwrap_err(),
            RenderError::EmptyBody
        );
    }

    #[test]
    fn test_render_otp() {
        let form = form_with_template("ignored", "ignored");
        let mail = render_otp(&form, "123456").unwrap();
        assert_eq!(mail.subject, "OTP Code: 123456");
        assert!(mail.html.contains("123456"));
        assert!(mail.reply_to.is_none());
    }

    #[test]
    fn test_interpolate_unterminated_token() {
        let values = vec![("a".to_string(), "1".to_string())];
        assert_eq!(interpolate("x {{a}} y {{broken", &values), "x 1 y {{broken");
    }
}
