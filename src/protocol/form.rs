//! Login and registration request forms.
//!
//! A server describes the fields it wants as one `;`-separated string:
//!
//! - `#label` asks for a hidden (password-style) input
//! - `label:opt1:opt2` offers a fixed set of options
//! - anything else is a plain text prompt
//!
//! ```rust
//! use secure_mux::protocol::form::{FormField, FormSpec};
//!
//! let form = FormSpec::parse("user;#password;role:admin:guest");
//! assert_eq!(form.fields()[1], FormField::Hidden("password".into()));
//! assert_eq!(form.to_string(), "user;#password;role:admin:guest");
//! ```

use std::fmt;

const FIELD_SEPARATOR: char = ';';
const HIDDEN_MARKER: char = '#';
const OPTION_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormField {
    Text(String),
    Hidden(String),
    Choice { label: String, options: Vec<String> },
}

impl FormField {
    pub fn label(&self) -> &str {
        match self {
            FormField::Text(label) | FormField::Hidden(label) => label,
            FormField::Choice { label, .. } => label,
        }
    }

    fn parse(raw: &str) -> Self {
        if let Some(label) = raw.strip_prefix(HIDDEN_MARKER) {
            return FormField::Hidden(label.to_string());
        }
        if raw.contains(OPTION_SEPARATOR) {
            let mut parts = raw.split(OPTION_SEPARATOR);
            let label = parts.next().unwrap_or_default().to_string();
            let options = parts
                .filter(|option| !option.is_empty())
                .map(str::to_string)
                .collect();
            return FormField::Choice { label, options };
        }
        FormField::Text(raw.to_string())
    }
}

impl fmt::Display for FormField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormField::Text(label) => write!(f, "{label}"),
            FormField::Hidden(label) => write!(f, "{HIDDEN_MARKER}{label}"),
            FormField::Choice { label, options } => {
                write!(f, "{label}")?;
                for option in options {
                    write!(f, "{OPTION_SEPARATOR}{option}")?;
                }
                Ok(())
            }
        }
    }
}

/// Ordered list of fields a client must fill in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormSpec {
    fields: Vec<FormField>,
}

impl FormSpec {
    pub fn new(fields: Vec<FormField>) -> Self {
        Self { fields }
    }

    /// Parse the wire form. Empty fields are skipped.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .split(FIELD_SEPARATOR)
            .filter(|raw| !raw.is_empty())
            .map(FormField::parse)
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for FormSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "{FIELD_SEPARATOR}")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_kinds() {
        let form = FormSpec::parse("user;#password;role:admin:guest");
        assert_eq!(
            form.fields(),
            &[
                FormField::Text("user".into()),
                FormField::Hidden("password".into()),
                FormField::Choice {
                    label: "role".into(),
                    options: vec!["admin".into(), "guest".into()],
                },
            ]
        );
        assert_eq!(form.fields()[2].label(), "role");
    }

    #[test]
    fn test_empty_fields_skipped() {
        let form = FormSpec::parse(";user;;");
        assert_eq!(form.fields().len(), 1);
        assert!(FormSpec::parse("").is_empty());
    }

    #[test]
    fn test_display_renders_wire_form() {
        let raw = "mail;#pin;tier:free:pro";
        assert_eq!(FormSpec::parse(raw).to_string(), raw);
    }
}
