//! Proposal pricing. Amounts are computed in dollars and rounded to whole
//! cents per component, so a summary always adds up exactly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AssemblyCost, AssemblyFeeKind, ManufacturerVersion};

/// Multipliers and rates in effect for one manufacturer version.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingContext {
    pub manufacturer_multiplier: f64,
    pub group_multiplier: f64,
    /// Extra multiplier applied when showroom mode is on.
    pub showroom_multiplier: Option<f64>,
    pub tax_rate_pct: f64,
    pub delivery_fee: f64,
}

impl Default for PricingContext {
    fn default() -> Self {
        Self {
            manufacturer_multiplier: 1.0,
            group_multiplier: 1.0,
            showroom_multiplier: None,
            tax_rate_pct: 0.0,
            delivery_fee: 0.0,
        }
    }
}

impl PricingContext {
    fn showroom(&self) -> f64 {
        match self.showroom_multiplier {
            Some(value) if value > 0.0 => value,
            _ => 1.0,
        }
    }

    /// Final per-unit price of a catalog item.
    pub fn unit_price(&self, base: f64) -> f64 {
        base * self.manufacturer_multiplier * self.group_multiplier * self.showroom()
    }

    /// Per-unit assembly fee for an item whose final unit price is `final_unit`.
    pub fn assembly_fee(&self, cost: &AssemblyCost, final_unit: f64) -> f64 {
        match cost.kind {
            AssemblyFeeKind::Flat | AssemblyFeeKind::Fixed => cost.price * self.showroom(),
            AssemblyFeeKind::Percentage => final_unit * cost.price / 100.0,
            AssemblyFeeKind::Legacy => cost.price,
        }
    }
}

/// Priced totals of one manufacturer version, in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSummary {
    pub parts_cents: i64,
    pub assembly_cents: i64,
    pub modifications_cents: i64,
    pub custom_items_cents: i64,
    pub subtotal_cents: i64,
    pub discount_percent: f64,
    pub discount_cents: i64,
    pub total_after_discount_cents: i64,
    pub delivery_cents: i64,
    pub tax_rate_pct: f64,
    pub tax_cents: i64,
    pub grand_total_cents: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("item {code} has a negative quantity")]
    NegativeQuantity { code: String },
    #[error("item {code} has a negative price")]
    NegativePrice { code: String },
    #[error("tax rate must not be negative")]
    NegativeTaxRate,
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn percent_of(cents: i64, pct: f64) -> i64 {
    (cents as f64 * pct / 100.0).round() as i64
}

/// Computes the summary for a manufacturer version.
pub fn summarize(
    version: &ManufacturerVersion,
    ctx: &PricingContext,
) -> Result<PriceSummary, PricingError> {
    if ctx.tax_rate_pct < 0.0 {
        return Err(PricingError::NegativeTaxRate);
    }

    let showroom = ctx.showroom();
    let mut parts = 0.0;
    let mut assembly = 0.0;
    let mut modifications = 0.0;

    for item in &version.items {
        if item.qty < 0 {
            return Err(PricingError::NegativeQuantity {
                code: item.code.clone(),
            });
        }
        if item.price < 0.0 {
            return Err(PricingError::NegativePrice {
                code: item.code.clone(),
            });
        }

        let qty = item.qty as f64;
        let final_unit = ctx.unit_price(item.price);
        parts += final_unit * qty;

        if version.is_assembled && item.include_assembly_fee {
            if let Some(cost) = &item.assembly_cost {
                assembly += ctx.assembly_fee(cost, final_unit) * qty;
            }
        }

        for modification in &item.modifications {
            if modification.qty < 0 {
                return Err(PricingError::NegativeQuantity {
                    code: item.code.clone(),
                });
            }
            if modification.price < 0.0 {
                return Err(PricingError::NegativePrice {
                    code: item.code.clone(),
                });
            }
            modifications += modification.price * modification.qty as f64 * showroom;
        }
    }

    let mut custom = 0.0;
    for custom_item in &version.custom_items {
        if custom_item.price < 0.0 {
            return Err(PricingError::NegativePrice {
                code: custom_item.name.clone(),
            });
        }
        custom += custom_item.price * showroom;
    }

    let parts_cents = to_cents(parts);
    let assembly_cents = to_cents(assembly);
    let modifications_cents = to_cents(modifications);
    let custom_items_cents = to_cents(custom);
    let subtotal_cents = parts_cents + assembly_cents + modifications_cents + custom_items_cents;

    let discount_percent = version.discount_percent.clamp(0.0, 100.0);
    let discount_cents = percent_of(subtotal_cents, discount_percent);
    let total_after_discount_cents = subtotal_cents - discount_cents;

    let delivery_cents = if version.items.is_empty() {
        0
    } else {
        to_cents(ctx.delivery_fee.max(0.0))
    };

    let tax_cents = percent_of(total_after_discount_cents + delivery_cents, ctx.tax_rate_pct);
    let grand_total_cents = total_after_discount_cents + delivery_cents + tax_cents;

    Ok(PriceSummary {
        parts_cents,
        assembly_cents,
        modifications_cents,
        custom_items_cents,
        subtotal_cents,
        discount_percent,
        discount_cents,
        total_after_discount_cents,
        delivery_cents,
        tax_rate_pct: ctx.tax_rate_pct,
        tax_cents,
        grand_total_cents,
    })
}

/// Sum of the grand totals of every summarised version.
pub fn proposal_total(versions: &[ManufacturerVersion]) -> i64 {
    versions
        .iter()
        .filter_map(|version| version.summary.as_ref())
        .map(|summary| summary.grand_total_cents)
        .sum()
}

/// Formats cents as US dollars, e.g. `$1,234.56` or `-$12.00`.
pub fn format_currency(cents: i64) -> String {
    let negative = cents < 0;
    let abs = cents.unsigned_abs();
    let dollars = (abs / 100).to_string();
    let remainder = abs % 100;

    let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
    for (index, digit) in dollars.chars().enumerate() {
        if index > 0 && (dollars.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    format!("{}${grouped}.{remainder:02}", if negative { "-" } else { "" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CustomItem, ItemModification, LineItem};

    fn item(code: &str, qty: i64, price: f64) -> LineItem {
        LineItem {
            code: code.to_string(),
            description: None,
            qty,
            price,
            include_assembly_fee: true,
            assembly_cost: None,
            modifications: Vec::new(),
        }
    }

    fn version(items: Vec<LineItem>) -> ManufacturerVersion {
        ManufacturerVersion {
            manufacturer_id: 1,
            version_name: "Base".into(),
            selected_style: None,
            is_assembled: true,
            discount_percent: 0.0,
            items,
            custom_items: Vec::new(),
            summary: None,
        }
    }

    #[test]
    fn unit_price_applies_all_multipliers() {
        let ctx = PricingContext {
            manufacturer_multiplier: 1.5,
            group_multiplier: 1.2,
            showroom_multiplier: Some(2.0),
            ..PricingContext::default()
        };
        assert!((ctx.unit_price(100.0) - 360.0).abs() < 1e-9);
    }

    #[test]
    fn assembly_fee_by_kind() {
        let ctx = PricingContext {
            showroom_multiplier: Some(1.5),
            ..PricingContext::default()
        };
        let flat = AssemblyCost {
            kind: AssemblyFeeKind::Flat,
            price: 10.0,
        };
        let percentage = AssemblyCost {
            kind: AssemblyFeeKind::Percentage,
            price: 10.0,
        };
        let legacy = AssemblyCost {
            kind: AssemblyFeeKind::Legacy,
            price: 10.0,
        };
        assert!((ctx.assembly_fee(&flat, 200.0) - 15.0).abs() < 1e-9);
        assert!((ctx.assembly_fee(&percentage, 200.0) - 20.0).abs() < 1e-9);
        assert!((ctx.assembly_fee(&legacy, 200.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn summarizes_fixture_line_items() {
        let mut base = item("B12", 2, 150.0);
        base.assembly_cost = Some(AssemblyCost {
            kind: AssemblyFeeKind::Fixed,
            price: 25.0,
        });
        base.modifications.push(ItemModification {
            name: Some("Finished end".into()),
            price: 12.5,
            qty: 2,
        });
        let mut wall = item("W3030", 1, 99.99);
        wall.include_assembly_fee = false;
        wall.assembly_cost = Some(AssemblyCost {
            kind: AssemblyFeeKind::Flat,
            price: 25.0,
        });

        let mut version = version(vec![base, wall]);
        version.discount_percent = 10.0;
        version.custom_items.push(CustomItem {
            name: "Filler".into(),
            price: 40.0,
        });

        let ctx = PricingContext {
            tax_rate_pct: 8.25,
            delivery_fee: 75.0,
            ..PricingContext::default()
        };
        let summary = summarize(&version, &ctx).expect("summary");

        assert_eq!(summary.parts_cents, 39_999);
        assert_eq!(summary.assembly_cents, 5_000);
        assert_eq!(summary.modifications_cents, 2_500);
        assert_eq!(summary.custom_items_cents, 4_000);
        assert_eq!(summary.subtotal_cents, 51_499);
        assert_eq!(summary.discount_cents, 5_150);
        assert_eq!(summary.total_after_discount_cents, 46_349);
        assert_eq!(summary.delivery_cents, 7_500);
        assert_eq!(summary.tax_cents, 4_443);
        assert_eq!(summary.grand_total_cents, 58_292);
        assert_eq!(format_currency(summary.grand_total_cents), "$582.92");
    }

    #[test]
    fn unassembled_versions_skip_assembly() {
        let mut line = item("B12", 3, 100.0);
        line.assembly_cost = Some(AssemblyCost {
            kind: AssemblyFeeKind::Flat,
            price: 20.0,
        });
        let mut version = version(vec![line]);
        version.is_assembled = false;

        let summary = summarize(&version, &PricingContext::default()).expect("summary");
        assert_eq!(summary.assembly_cents, 0);
        assert_eq!(summary.grand_total_cents, 30_000);
    }

    #[test]
    fn delivery_requires_a_cabinet_item() {
        let mut version = version(Vec::new());
        version.custom_items.push(CustomItem {
            name: "Labor".into(),
            price: 100.0,
        });
        let ctx = PricingContext {
            delivery_fee: 50.0,
            ..PricingContext::default()
        };
        let summary = summarize(&version, &ctx).expect("summary");
        assert_eq!(summary.delivery_cents, 0);
        assert_eq!(summary.grand_total_cents, 10_000);
    }

    #[test]
    fn discount_is_clamped() {
        let mut version = version(vec![item("B12", 1, 100.0)]);
        version.discount_percent = 150.0;
        let summary = summarize(&version, &PricingContext::default()).expect("summary");
        assert_eq!(summary.discount_percent, 100.0);
        assert_eq!(summary.grand_total_cents, 0);
    }

    #[test]
    fn rejects_negative_inputs() {
        let version = version(vec![item("B12", -1, 100.0)]);
        assert_eq!(
            summarize(&version, &PricingContext::default()),
            Err(PricingError::NegativeQuantity { code: "B12".into() })
        );

        let ctx = PricingContext {
            tax_rate_pct: -1.0,
            ..PricingContext::default()
        };
        assert_eq!(
            summarize(&self::version(Vec::new()), &ctx),
            Err(PricingError::NegativeTaxRate)
        );
    }

    #[test]
    fn proposal_total_sums_summaries() {
        let mut first = version(vec![item("A", 1, 10.0)]);
        first.summary = Some(PriceSummary {
            grand_total_cents: 1_000,
            ..PriceSummary::default()
        });
        let mut second = version(vec![item("B", 1, 20.0)]);
        second.summary = Some(PriceSummary {
            grand_total_cents: 2_550,
            ..PriceSummary::default()
        });
        let unsummarized = version(vec![item("C", 1, 30.0)]);

        assert_eq!(proposal_total(&[first, second, unsummarized]), 3_550);
    }

    #[test]
    fn formats_currency() {
        assert_eq!(format_currency(0), "$0.00");
        assert_eq!(format_currency(123_456), "$1,234.56");
        assert_eq!(format_currency(100_000_000), "$1,000,000.00");
        assert_eq!(format_currency(-1_200), "-$12.00");
        assert_eq!(format_currency(5), "$0.05");
    }
}
