use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::{
    CatalogItemInput, CatalogModificationInput, CustomerInput, GroupInput, ManufacturerInput,
    ProposalInput, TaxInput, UserInput,
};

/// Field-level validation failure. `fields` maps field name to message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("validation failed for {}", .fields.keys().cloned().collect::<Vec<_>>().join(", "))]
pub struct ValidationError {
    pub fields: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), message.into());
        Self { fields }
    }
}

/// Accumulates field errors; the first error per field wins.
#[derive(Debug, Default)]
pub struct Validator {
    errors: BTreeMap<String, String>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) -> &mut Self {
        self.errors
            .entry(field.to_string())
            .or_insert_with(|| message.into());
        self
    }

    pub fn required(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.add(field, "is required");
        }
        self
    }

    /// Optional email: empty values pass, anything else must look like `local@domain.tld`.
    pub fn email(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) {
            if !looks_like_email(value) {
                self.add(field, "must be a valid email address");
            }
        }
        self
    }

    pub fn max_len(&mut self, field: &str, value: Option<&str>, max: usize) -> &mut Self {
        if value.is_some_and(|value| value.chars().count() > max) {
            self.add(field, format!("must be at most {max} characters"));
        }
        self
    }

    pub fn non_negative(&mut self, field: &str, value: f64) -> &mut Self {
        if !value.is_finite() || value < 0.0 {
            self.add(field, "must not be negative");
        }
        self
    }

    pub fn percent(&mut self, field: &str, value: Option<f64>) -> &mut Self {
        if let Some(value) = value {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                self.add(field, "must be between 0 and 100");
            }
        }
        self
    }

    pub fn finish(&mut self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                fields: std::mem::take(&mut self.errors),
            })
        }
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.contains(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}

impl CustomerInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Validator::new()
            .required("name", &self.name)
            .max_len("name", Some(&self.name), 255)
            .email("email", self.email.as_deref())
            .max_len("note", self.note.as_deref(), 5000)
            .percent("default_discount", self.default_discount)
            .finish()
    }
}

impl ProposalInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut validator = Validator::new();
        if self.customer_id.is_none() {
            match &self.customer {
                Some(customer) => {
                    validator
                        .required("customer.name", &customer.name)
                        .email("customer.email", customer.email.as_deref());
                }
                None => {
                    validator.add("customer_id", "is required");
                }
            }
        }
        validator.max_len("title", self.title.as_deref(), 255);
        if self.follow_up_dates.len() > 3 {
            validator.add("follow_up_dates", "at most 3 follow up dates are allowed");
        }
        for (index, version) in self.manufacturers_data.iter().enumerate() {
            validator.percent(
                &format!("manufacturers_data[{index}].discount_percent"),
                Some(version.discount_percent),
            );
            for (item_index, item) in version.items.iter().enumerate() {
                let prefix = format!("manufacturers_data[{index}].items[{item_index}]");
                validator.required(&format!("{prefix}.code"), &item.code);
                validator.non_negative(&format!("{prefix}.price"), item.price);
                if item.qty < 0 {
                    validator.add(&format!("{prefix}.qty"), "must not be negative");
                }
            }
        }
        validator.finish()
    }
}

impl ManufacturerInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut validator = Validator::new();
        validator
            .required("name", &self.name)
            .email("email", self.email.as_deref())
            .non_negative("delivery_fee", self.delivery_fee);
        if !self.cost_multiplier.is_finite() || self.cost_multiplier <= 0.0 {
            validator.add("cost_multiplier", "must be greater than 0");
        }
        validator.finish()
    }
}

impl CatalogItemInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Validator::new()
            .required("code", &self.code)
            .max_len("code", Some(&self.code), 100)
            .non_negative("price", self.price)
            .finish()
    }
}

impl CatalogModificationInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Validator::new()
            .required("name", &self.name)
            .non_negative("price", self.price)
            .finish()
    }
}

impl TaxInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Validator::new()
            .required("label", &self.label)
            .percent("value", Some(self.value))
            .finish()
    }
}

impl GroupInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut validator = Validator::new();
        validator.required("name", &self.name);
        if let Some(multiplier) = self.multiplier {
            if !multiplier.is_finite() || multiplier <= 0.0 {
                validator.add("multiplier", "must be greater than 0");
            }
        }
        validator.finish()
    }
}

impl UserInput {
    /// `creating` makes the password mandatory.
    pub fn validate(&self, creating: bool) -> Result<(), ValidationError> {
        let mut validator = Validator::new();
        validator
            .required("name", &self.name)
            .required("email", &self.email)
            .email("email", Some(&self.email));
        match self.password.as_deref() {
            Some(password) if password.chars().count() < 8 => {
                validator.add("password", "must be at least 8 characters");
            }
            None if creating => {
                validator.add("password", "is required");
            }
            _ => {}
        }
        validator.finish()
    }
}

/// Validates a new contact thread.
pub fn validate_thread(subject: &str, body: &str) -> Result<(), ValidationError> {
    Validator::new()
        .required("subject", subject)
        .max_len("subject", Some(subject), 255)
        .required("body", body)
        .max_len("body", Some(body), 10_000)
        .finish()
}

/// Validates a reply inside a contact thread.
pub fn validate_message(body: &str) -> Result<(), ValidationError> {
    Validator::new()
        .required("body", body)
        .max_len("body", Some(body), 10_000)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InlineCustomer, LineItem, ManufacturerVersion};

    #[test]
    fn rejects_empty_required_fields() {
        let err = CustomerInput::default().validate().expect_err("name required");
        assert_eq!(err.fields.get("name").map(String::as_str), Some("is required"));

        let input = CustomerInput {
            name: "   ".into(),
            ..CustomerInput::default()
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn accumulates_multiple_fields() {
        let input = CustomerInput {
            name: "Jane".into(),
            email: Some("not-an-email".into()),
            default_discount: Some(120.0),
            ..CustomerInput::default()
        };
        let err = input.validate().expect_err("invalid input");
        assert_eq!(err.fields.len(), 2);
        assert!(err.fields.contains_key("email"));
        assert!(err.fields.contains_key("default_discount"));
        assert!(err.to_string().contains("default_discount, email"));
    }

    #[test]
    fn email_rules() {
        for valid in ["a@b.co", "first.last@example.com"] {
            assert!(looks_like_email(valid), "{valid}");
        }
        for invalid in ["@b.co", "a@b", "a@@b.co", "a b@c.com", "a@.com"] {
            assert!(!looks_like_email(invalid), "{invalid}");
        }
        assert!(Validator::new().email("email", Some("")).finish().is_ok());
    }

    #[test]
    fn proposal_requires_some_customer() {
        let err = ProposalInput::default().validate().expect_err("customer required");
        assert!(err.fields.contains_key("customer_id"));

        let input = ProposalInput {
            customer: Some(InlineCustomer {
                name: "Walk-in".into(),
                email: Some("walkin@example.com".into()),
                mobile: None,
            }),
            ..ProposalInput::default()
        };
        assert!(input.validate().is_ok());
    }

    #[test]
    fn proposal_line_items_are_checked() {
        let input = ProposalInput {
            customer_id: Some(1),
            manufacturers_data: vec![ManufacturerVersion {
                manufacturer_id: 1,
                version_name: String::new(),
                selected_style: None,
                is_assembled: true,
                discount_percent: 5.0,
                items: vec![LineItem {
                    code: String::new(),
                    description: None,
                    qty: -2,
                    price: -1.0,
                    include_assembly_fee: true,
                    assembly_cost: None,
                    modifications: Vec::new(),
                }],
                custom_items: Vec::new(),
                summary: None,
            }],
            ..ProposalInput::default()
        };
        let err = input.validate().expect_err("bad items");
        assert!(err.fields.contains_key("manufacturers_data[0].items[0].code"));
        assert!(err.fields.contains_key("manufacturers_data[0].items[0].qty"));
        assert!(err.fields.contains_key("manufacturers_data[0].items[0].price"));
    }

    #[test]
    fn user_password_rules() {
        let input = UserInput {
            name: "Ana".into(),
            email: "ana@example.com".into(),
            ..UserInput::default()
        };
        assert!(input.validate(true).is_err());
        assert!(input.validate(false).is_ok());

        let short = UserInput {
            password: Some("short".into()),
            ..input
        };
        assert!(short.validate(false).is_err());
    }

    #[test]
    fn thread_and_message_bodies_required() {
        assert!(validate_thread("Hello", "").is_err());
        assert!(validate_thread("", "body").is_err());
        assert!(validate_thread("Hello", "body").is_ok());
        assert!(validate_message("  ").is_err());
    }
}
