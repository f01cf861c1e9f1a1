use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use cabinet_portal_core::{PricingError, TransitionError, ValidationError};
use cabinet_portal_storage::{
    ActivityError, CatalogError, ContactError, CustomerError, CustomizationError, GroupError,
    ManufacturerError, NotificationError, ProposalError, TaxError, UserError,
};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<BTreeMap<String, String>>,
}

/// `application/problem+json` error body returned by every handler.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
                errors: None,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    pub fn bad_request(problem_type: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, problem_type, detail)
    }

    pub fn conflict(problem_type: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, problem_type, detail)
    }

    /// Logs `err` and hides it behind a generic 500.
    pub fn internal(stage: &'static str, err: &dyn std::fmt::Display) -> Self {
        error!(stage, error = %err, "request failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "an unexpected error occurred",
        )
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<ValidationError> for ProblemResponse {
    fn from(err: ValidationError) -> Self {
        let mut problem = Self::bad_request("validation_failed", err.to_string());
        problem.body.errors = Some(err.fields);
        problem
    }
}

impl From<PricingError> for ProblemResponse {
    fn from(err: PricingError) -> Self {
        Self::bad_request("invalid_pricing", err.to_string())
    }
}

impl From<TransitionError> for ProblemResponse {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::UnknownStatus(_) => Self::bad_request("unknown_status", err.to_string()),
            TransitionError::NotAllowed { .. } => {
                Self::conflict("invalid_transition", err.to_string())
            }
        }
    }
}

impl From<UserError> for ProblemResponse {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound => Self::not_found("user not found"),
            UserError::EmailTaken => Self::conflict("duplicate_email", err.to_string()),
            UserError::MissingGroup => Self::bad_request("unknown_group", err.to_string()),
            UserError::Database(ref inner) => Self::internal("storage", inner),
        }
    }
}

impl From<GroupError> for ProblemResponse {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::NotFound => Self::not_found("contractor not found"),
            other => Self::internal("storage", &other),
        }
    }
}

impl From<CustomerError> for ProblemResponse {
    fn from(err: CustomerError) -> Self {
        match err {
            CustomerError::NotFound => Self::not_found("customer not found"),
            CustomerError::DuplicateEmail => Self::conflict("duplicate_email", err.to_string()),
            CustomerError::Database(ref inner) => Self::internal("storage", inner),
        }
    }
}

impl From<ProposalError> for ProblemResponse {
    fn from(err: ProposalError) -> Self {
        match err {
            ProposalError::NotFound => Self::not_found("proposal not found"),
            ProposalError::Locked => Self::conflict("proposal_locked", err.to_string()),
            ProposalError::StatusConflict { .. } => {
                Self::conflict("status_conflict", err.to_string())
            }
            ProposalError::MissingCustomer => {
                Self::bad_request("unknown_customer", err.to_string())
            }
            other => Self::internal("storage", &other),
        }
    }
}

impl From<ManufacturerError> for ProblemResponse {
    fn from(err: ManufacturerError) -> Self {
        match err {
            ManufacturerError::NotFound => Self::not_found("manufacturer not found"),
            ManufacturerError::Database(ref inner) => Self::internal("storage", inner),
        }
    }
}

impl From<CatalogError> for ProblemResponse {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound => Self::not_found("catalog item not found"),
            CatalogError::MissingManufacturer => Self::not_found("manufacturer not found"),
            CatalogError::Database(ref inner) => Self::internal("storage", inner),
        }
    }
}

impl From<TaxError> for ProblemResponse {
    fn from(err: TaxError) -> Self {
        match err {
            TaxError::NotFound => Self::not_found("tax not found"),
            TaxError::Database(ref inner) => Self::internal("storage", inner),
        }
    }
}

impl From<ContactError> for ProblemResponse {
    fn from(err: ContactError) -> Self {
        match err {
            ContactError::NotFound => Self::not_found("thread not found"),
            ContactError::Closed => Self::conflict("thread_closed", err.to_string()),
            ContactError::Database(ref inner) => Self::internal("storage", inner),
        }
    }
}

impl From<NotificationError> for ProblemResponse {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::NotFound => Self::not_found("notification not found"),
            other => Self::internal("storage", &other),
        }
    }
}

impl From<CustomizationError> for ProblemResponse {
    fn from(err: CustomizationError) -> Self {
        Self::internal("storage", &err)
    }
}

impl From<ActivityError> for ProblemResponse {
    fn from(err: ActivityError) -> Self {
        Self::internal("storage", &err)
    }
}
