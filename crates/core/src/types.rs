use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pricing::PriceSummary;
use crate::status::ProposalStatus;

/// Primary key type shared by every table.
pub type Id = i64;

/// Role attached to a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manufacturer,
    Manager,
    Sales,
    Contractor,
    User,
}

impl Role {
    /// Returns the canonical database representation for the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::Manufacturer => "manufacturer",
            Self::Manager => "manager",
            Self::Sales => "sales",
            Self::Contractor => "contractor",
            Self::User => "user",
        }
    }

    /// Parses stored role strings leniently. Unknown values degrade to `User`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "super_admin" | "superadmin" | "super admin" => Self::SuperAdmin,
            "admin" => Self::Admin,
            "manufacturer" | "manufacturers" => Self::Manufacturer,
            "manager" => Self::Manager,
            "sales" => Self::Sales,
            "contractor" => Self::Contractor,
            _ => Self::User,
        }
    }
}

/// Authenticated account as exposed over the API. Password hashes never leave storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or updating a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// Required on create, optional on update.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub group_id: Option<Id>,
}

/// Kind of user group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Standard,
    Contractor,
}

impl GroupType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Contractor => "contractor",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("contractor") {
            Self::Contractor
        } else {
            Self::Standard
        }
    }
}

/// Feature toggles granted to a contractor group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupModules {
    pub dashboard: bool,
    pub proposals: bool,
    pub customers: bool,
    pub resources: bool,
}

/// A user group. Contractor groups are the reseller tenants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractorGroup {
    pub id: Id,
    pub name: String,
    pub group_type: GroupType,
    pub modules: GroupModules,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    pub multiplier_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContractorGroup {
    /// Price multiplier applied to catalog prices for members of this group.
    pub fn effective_multiplier(&self) -> f64 {
        match self.multiplier {
            Some(value) if self.multiplier_enabled && value > 0.0 => value,
            _ => 1.0,
        }
    }
}

/// Payload for creating or updating a group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupInput {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_group_type")]
    pub group_type: GroupType,
    #[serde(default)]
    pub modules: GroupModules,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub multiplier_enabled: bool,
}

fn default_group_type() -> GroupType {
    GroupType::Contractor
}

/// Group listing row with usage counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractorSummary {
    #[serde(flatten)]
    pub group: ContractorGroup,
    pub user_count: i64,
    pub customer_count: i64,
    pub proposal_count: i64,
}

/// End customer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Id,
    pub name: String,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub home_phone: Option<String>,
    pub address: Option<String>,
    pub apt_or_suite: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub company_name: Option<String>,
    pub customer_type: Option<String>,
    pub lead_source: Option<String>,
    pub default_discount: Option<f64>,
    pub note: Option<String>,
    pub group_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Customer listing row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerListItem {
    #[serde(flatten)]
    pub customer: Customer,
    pub proposal_count: i64,
}

/// Payload for creating or updating a customer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomerInput {
    pub name: String,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub home_phone: Option<String>,
    pub address: Option<String>,
    pub apt_or_suite: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub company_name: Option<String>,
    pub customer_type: Option<String>,
    pub lead_source: Option<String>,
    pub default_discount: Option<f64>,
    pub note: Option<String>,
}

/// Whether a record is still a quote or has been converted into an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Quote,
    Order,
}

impl ProposalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Order => "order",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "quote" | "proposal" | "0" => Some(Self::Quote),
            "order" | "contract" | "1" => Some(Self::Order),
            _ => None,
        }
    }
}

/// How an assembly fee is charged for a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyFeeKind {
    Flat,
    Fixed,
    Percentage,
    #[serde(other)]
    Legacy,
}

impl AssemblyFeeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Fixed => "fixed",
            Self::Percentage => "percentage",
            Self::Legacy => "legacy",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "flat" => Self::Flat,
            "fixed" => Self::Fixed,
            "percentage" | "percent" => Self::Percentage,
            _ => Self::Legacy,
        }
    }
}

/// Assembly fee configured on a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssemblyCost {
    #[serde(rename = "type", default = "legacy_fee_kind")]
    pub kind: AssemblyFeeKind,
    pub price: f64,
}

fn legacy_fee_kind() -> AssemblyFeeKind {
    AssemblyFeeKind::Legacy
}

/// Priced add-on attached to a line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemModification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub price: f64,
    #[serde(default = "default_qty")]
    pub qty: i64,
}

/// A cabinet line inside a manufacturer version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_qty")]
    pub qty: i64,
    /// Catalog list price before multipliers.
    pub price: f64,
    #[serde(default = "default_true")]
    pub include_assembly_fee: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_cost: Option<AssemblyCost>,
    #[serde(default)]
    pub modifications: Vec<ItemModification>,
}

/// Free-form priced line that is not in a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomItem {
    pub name: String,
    pub price: f64,
}

/// One manufacturer's priced selection inside a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManufacturerVersion {
    pub manufacturer_id: Id,
    #[serde(default)]
    pub version_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_style: Option<String>,
    #[serde(default = "default_true")]
    pub is_assembled: bool,
    #[serde(default)]
    pub discount_percent: f64,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub custom_items: Vec<CustomItem>,
    /// Computed server side on save; client values are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PriceSummary>,
}

fn default_qty() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

/// Denormalised customer fields shown with a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub id: Id,
    pub name: String,
    pub email: Option<String>,
}

/// A quote or order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Id,
    pub customer_id: Option<Id>,
    pub owner_group_id: Option<Id>,
    pub created_by: Option<Id>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub designer: Option<String>,
    pub sales_rep: Option<String>,
    pub lead_source: Option<String>,
    pub kind: ProposalKind,
    pub status: ProposalStatus,
    pub date: Option<NaiveDate>,
    pub follow_up_dates: Vec<NaiveDate>,
    pub manufacturers_data: Vec<ManufacturerVersion>,
    pub grand_total_cents: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<Id>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerRef>,
}

impl Proposal {
    /// Accepted proposals can no longer be edited.
    pub fn is_locked(&self) -> bool {
        self.accepted_at.is_some() || self.status == ProposalStatus::Accepted
    }
}

/// Inline customer supplied with a proposal when no `customer_id` is given.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InlineCustomer {
    pub name: String,
    pub email: Option<String>,
    pub mobile: Option<String>,
}

/// Payload for creating or updating a proposal.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProposalInput {
    pub customer_id: Option<Id>,
    pub customer: Option<InlineCustomer>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub designer: Option<String>,
    pub sales_rep: Option<String>,
    pub lead_source: Option<String>,
    pub status: Option<String>,
    pub date: Option<NaiveDate>,
    pub follow_up_dates: Vec<NaiveDate>,
    pub expires_at: Option<DateTime<Utc>>,
    pub manufacturers_data: Vec<ManufacturerVersion>,
    /// Showroom mode multiplier used when the summaries are priced.
    pub showroom_multiplier: Option<f64>,
}

/// Cabinet manufacturer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manufacturer {
    pub id: Id,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub website: Option<String>,
    pub is_price_msrp: bool,
    pub cost_multiplier: f64,
    pub delivery_fee: f64,
    pub instructions: Option<String>,
    pub image: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or updating a manufacturer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManufacturerInput {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub website: Option<String>,
    pub is_price_msrp: bool,
    pub cost_multiplier: f64,
    pub delivery_fee: f64,
    pub instructions: Option<String>,
}

impl Default for ManufacturerInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            email: None,
            phone: None,
            address: None,
            website: None,
            is_price_msrp: true,
            cost_multiplier: 1.0,
            delivery_fee: 0.0,
            instructions: None,
        }
    }
}

/// Item in a manufacturer's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: Id,
    pub manufacturer_id: Id,
    pub code: String,
    pub style: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub price: f64,
    pub discontinued: bool,
    pub assembly_cost: Option<AssemblyCost>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Catalog row before it is stored, from the manual form or a CSV upload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CatalogItemInput {
    pub code: String,
    pub style: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub price: f64,
    pub discontinued: bool,
}

/// Distinct style inside a catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleSummary {
    pub style: String,
    pub item_count: i64,
    pub min_price: f64,
}

/// Modification option stored against a catalog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModification {
    pub id: Id,
    pub catalog_item_id: Id,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

/// Payload for a new catalog modification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogModificationInput {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
}

/// Sales tax rate; `value` is a percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tax {
    pub id: Id,
    pub label: String,
    pub value: f64,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Payload for a new tax rate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaxInput {
    pub label: String,
    pub value: f64,
    pub is_default: bool,
}

/// Contact thread lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Open,
    Closed,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Support conversation between a user and the admins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactThread {
    pub id: Id,
    pub user_id: Id,
    pub subject: String,
    pub status: ThreadStatus,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    /// Messages from the other side the viewer has not read yet.
    pub unread_count: i64,
}

/// Message inside a contact thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactMessage {
    pub id: Id,
    pub thread_id: Id,
    pub author_user_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub is_admin: bool,
    pub body: String,
    pub read_by_recipient: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Public company contact block shown on the contact page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactInfo {
    pub company_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub website: Option<String>,
    pub hours: Option<String>,
    pub notes: Option<String>,
}

/// Notification urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
}

impl NotificationPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Notification delivered to a single recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Id,
    pub recipient_user_id: Id,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub payload: Option<Value>,
    pub priority: NotificationPriority,
    pub action_url: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_by: Option<Id>,
    pub created_at: DateTime<Utc>,
}

/// Notification template fanned out to one or more recipients.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub kind: String,
    pub title: String,
    pub message: String,
    pub payload: Option<Value>,
    pub priority: NotificationPriority,
    pub action_url: Option<String>,
    pub created_by: Option<Id>,
}

/// Branding applied to the web UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiCustomization {
    pub app_name: String,
    pub primary_color: String,
    pub secondary_color: String,
    pub header_bg: String,
    pub sidebar_bg: String,
    pub login_title: Option<String>,
    pub login_subtitle: Option<String>,
    pub logo_path: Option<String>,
}

impl Default for UiCustomization {
    fn default() -> Self {
        Self {
            app_name: "Cabinet Portal".to_string(),
            primary_color: "#321fdb".to_string(),
            secondary_color: "#9da5b1".to_string(),
            header_bg: "#ffffff".to_string(),
            sidebar_bg: "#212631".to_string(),
            login_title: None,
            login_subtitle: None,
            logo_path: None,
        }
    }
}

/// Layout options used when proposals are exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfCustomization {
    pub company_name: Option<String>,
    pub company_phone: Option<String>,
    pub company_email: Option<String>,
    pub company_address: Option<String>,
    pub header_bg_color: String,
    pub header_txt_color: String,
    pub footer_text: Option<String>,
    pub show_prices: bool,
    pub logo_path: Option<String>,
}

impl Default for PdfCustomization {
    fn default() -> Self {
        Self {
            company_name: None,
            company_phone: None,
            company_email: None,
            company_address: None,
            header_bg_color: "#000000".to_string(),
            header_txt_color: "#ffffff".to_string(),
            footer_text: None,
            show_prices: true,
            logo_path: None,
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Id,
    pub actor_id: Option<Id>,
    pub action: String,
    pub target_type: String,
    pub target_id: Option<Id>,
    pub diff: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_parse_accepts_legacy_spellings() {
        assert_eq!(Role::parse("Super Admin"), Role::SuperAdmin);
        assert_eq!(Role::parse("superadmin"), Role::SuperAdmin);
        assert_eq!(Role::parse("Manufacturers"), Role::Manufacturer);
        assert_eq!(Role::parse("ghost"), Role::User);
    }

    #[test]
    fn group_multiplier_requires_enabled_flag() {
        let now = Utc::now();
        let mut group = ContractorGroup {
            id: 1,
            name: "Acme".into(),
            group_type: GroupType::Contractor,
            modules: GroupModules::default(),
            multiplier: Some(1.25),
            multiplier_enabled: false,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(group.effective_multiplier(), 1.0);
        group.multiplier_enabled = true;
        assert_eq!(group.effective_multiplier(), 1.25);
        group.multiplier = Some(0.0);
        assert_eq!(group.effective_multiplier(), 1.0);
    }

    #[test]
    fn manufacturer_version_defaults_when_fields_missing() {
        let version: ManufacturerVersion = serde_json::from_value(json!({
            "manufacturer_id": 3,
            "items": [{ "code": "B12", "price": 100.0 }]
        }))
        .expect("version should deserialize");

        assert!(version.is_assembled);
        assert_eq!(version.items[0].qty, 1);
        assert!(version.items[0].include_assembly_fee);
        assert!(version.summary.is_none());
    }

    #[test]
    fn unknown_assembly_kind_is_legacy() {
        let cost: AssemblyCost =
            serde_json::from_value(json!({ "type": "per-box", "price": 12.5 })).expect("cost");
        assert_eq!(cost.kind, AssemblyFeeKind::Legacy);

        let untyped: AssemblyCost = serde_json::from_value(json!({ "price": 4 })).expect("cost");
        assert_eq!(untyped.kind, AssemblyFeeKind::Legacy);
    }

    #[test]
    fn proposal_kind_parses_numeric_codes() {
        assert_eq!(ProposalKind::parse("0"), Some(ProposalKind::Quote));
        assert_eq!(ProposalKind::parse("contract"), Some(ProposalKind::Order));
        assert_eq!(ProposalKind::parse("bogus"), None);
    }
}
