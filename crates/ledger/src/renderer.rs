//! SMS message templates.
//!
//! Templates use `{{.Field}}` placeholders (the leading dot is optional).
//! A template is parsed once and then rendered per customer with no I/O.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use jonche_common::error::AppError;

/// `02 Jan 2006` style date used in payment confirmations.
pub const PAID_DATE_FORMAT: &str = "%d %b %Y";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown template field '{0}'")]
    UnknownField(String),

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("template field '{0}' has no value")]
    MissingValue(&'static str),
}

impl From<RenderError> for AppError {
    fn from(err: RenderError) -> Self {
        AppError::Render(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    PhoneNumber,
    Loaned,
    Paid,
    PaidDate,
}

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::Name => "Name",
            Field::PhoneNumber => "PhoneNumber",
            Field::Loaned => "Loaned",
            Field::Paid => "Paid",
            Field::PaidDate => "PaidDate",
        }
    }
}

impl FromStr for Field {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Name" => Ok(Field::Name),
            "PhoneNumber" => Ok(Field::PhoneNumber),
            "Loaned" => Ok(Field::Loaned),
            "Paid" => Ok(Field::Paid),
            "PaidDate" => Ok(Field::PaidDate),
            other => Err(RenderError::UnknownField(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Per-customer values a template can reference.
#[derive(Debug, Clone, Default)]
pub struct TemplateParams {
    pub name: String,
    pub phone_number: String,
    pub loaned: Decimal,
    /// Only set for payment confirmations.
    pub paid: Option<Decimal>,
    pub paid_date: Option<DateTime<Utc>>,
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(RenderError::Unterminated(offset + start))?;

            let key = after[..end].trim();
            let key = key.strip_prefix('.').unwrap_or(key);
            segments.push(Segment::Field(key.parse()?));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Whether the template references payment-only fields.
    pub fn needs_payment(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Field(Field::Paid | Field::PaidDate)))
    }

    pub fn render(&self, params: &TemplateParams) -> Result<String, RenderError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(&field_value(*field, params)?),
            }
        }
        Ok(out)
    }
}

fn field_value(field: Field, params: &TemplateParams) -> Result<String, RenderError> {
    Ok(match field {
        Field::Name => params.name.clone(),
        Field::PhoneNumber => params.phone_number.clone(),
        Field::Loaned => format_amount(params.loaned),
        Field::Paid => format_amount(params.paid.ok_or(RenderError::MissingValue(field.name()))?),
        Field::PaidDate => params
            .paid_date
            .ok_or(RenderError::MissingValue(field.name()))?
            .format(PAID_DATE_FORMAT)
            .to_string(),
    })
}

/// Shortest decimal form: `100.00` renders as `100`, `250.50` as `250.5`.
pub fn format_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use jonche_common::config::DEFAULT_PAYMENT_TEMPLATE;

    fn render(source: &str, params: &TemplateParams) -> Result<String, RenderError> {
        MessageTemplate::parse(source)?.render(params)
    }

    fn john() -> TemplateParams {
        TemplateParams {
            name: "JOHN".into(),
            phone_number: "0712345678".into(),
            loaned: dec!(100.0),
            ..TemplateParams::default()
        }
    }

    #[test]
    fn test_render_balance_without_trailing_zeros() {
        let out = render("Hello {{Name}}, balance {{Loaned}}", &john()).unwrap();
        assert_eq!(out, "Hello JOHN, balance 100");
    }

    #[test]
    fn test_dotted_and_spaced_placeholders() {
        let out = render("{{ .Name }} / {{.PhoneNumber}}", &john()).unwrap();
        assert_eq!(out, "JOHN / 0712345678");
    }

    #[test]
    fn test_payment_confirmation_template() {
        let params = TemplateParams {
            paid: Some(dec!(250.50)),
            paid_date: Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap()),
            loaned: dec!(749.50),
            ..john()
        };
        let out = render(DEFAULT_PAYMENT_TEMPLATE, &params).unwrap();
        assert_eq!(
            out,
            "Hello JOHN, we have received your payment of KES 250.5 on 05 Mar 2024. \
             Your new balance is KES 749.5. Thank you!"
        );
        assert!(!out.contains("{{"));
    }

    #[test]
    fn test_unknown_field_rejected_at_parse() {
        assert_eq!(
            MessageTemplate::parse("Hi {{.Balance}}").unwrap_err(),
            RenderError::UnknownField("Balance".into())
        );
    }

    #[test]
    fn test_unterminated_placeholder() {
        assert_eq!(
            MessageTemplate::parse("Hi {{.Name").unwrap_err(),
            RenderError::Unterminated(3)
        );
    }

    #[test]
    fn test_missing_payment_values() {
        let template = MessageTemplate::parse("Paid {{.Paid}}").unwrap();
        assert!(template.needs_payment());
        assert_eq!(
            template.render(&john()).unwrap_err(),
            RenderError::MissingValue("Paid")
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        let template = MessageTemplate::parse("No placeholders here").unwrap();
        assert!(!template.needs_payment());
        assert_eq!(template.render(&john()).unwrap(), "No placeholders here");
    }
}
